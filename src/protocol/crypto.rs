//! Tor Protocol Cryptography
//!
//! Implements Tor-spec-compliant crypto for circuit communication:
//! - AES-128-CTR for stream encryption
//! - SHA-1 for running digests (Tor spec requirement)
//! - HKDF-SHA256 for key derivation
//! - Onion encryption (layered encryption through multiple hops)
//!
//! Security: All key material is zeroized on drop to prevent memory leakage.

use super::cell::{Cell, RelayCell};
use crate::error::{Result, TorError};
use aes::Aes128;
use ctr::{
    cipher::{KeyIvInit, StreamCipher},
    Ctr128BE,
};
use hkdf::Hkdf;
use sha1::{Digest, Sha1};
use sha2::Sha256;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// AES-128-CTR cipher type
type Aes128Ctr = Ctr128BE<Aes128>;

const RECOGNIZED_RANGE: std::ops::Range<usize> = 1..3;
const DIGEST_RANGE: std::ops::Range<usize> = RelayCell::DIGEST_OFFSET..RelayCell::DIGEST_OFFSET + 4;

/// Circuit keys for one hop
///
/// Each hop in the circuit has separate keys for:
/// - Forward encryption (client → relay)
/// - Backward encryption (relay → client)
/// - Forward digest seed (integrity)
/// - Backward digest seed (integrity)
///
/// Keys are zeroized when dropped.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct CircuitKeys {
    /// Forward encryption key (client → relay)
    pub forward_key: [u8; 16],

    /// Backward encryption key (relay → client)
    pub backward_key: [u8; 16],

    /// Forward digest seed (Df)
    pub forward_digest: [u8; 20],

    /// Backward digest seed (Db)
    pub backward_digest: [u8; 20],
}

impl CircuitKeys {
    /// Derive circuit keys from KEY_SEED using Tor's KDF
    ///
    /// ```text
    /// K = HKDF-SHA256-Expand(PRK = KEY_SEED, m_expand)
    ///
    /// Output: Df (20) | Db (20) | Kf (16) | Kb (16) = 72 bytes
    /// ```
    pub fn derive_from_secret(key_seed: &[u8]) -> Result<Self> {
        const M_EXPAND: &[u8] = b"ntor-curve25519-sha256-1:key_expand";

        // KEY_SEED is already an HMAC-SHA256 output, so it is used as the PRK
        // directly and the Extract step is skipped.
        let hkdf = Hkdf::<Sha256>::from_prk(key_seed)
            .map_err(|_| TorError::KeyDerivationFailed("Invalid PRK length".into()))?;

        let mut okm = [0u8; 72];
        hkdf.expand(M_EXPAND, &mut okm)
            .map_err(|_| TorError::KeyDerivationFailed("HKDF expand failed".into()))?;

        let mut keys = CircuitKeys {
            forward_key: [0u8; 16],
            backward_key: [0u8; 16],
            forward_digest: [0u8; 20],
            backward_digest: [0u8; 20],
        };
        keys.forward_digest.copy_from_slice(&okm[0..20]);
        keys.backward_digest.copy_from_slice(&okm[20..40]);
        keys.forward_key.copy_from_slice(&okm[40..56]);
        keys.backward_key.copy_from_slice(&okm[56..72]);
        okm.zeroize();

        log::trace!("Derived circuit keys (Df prefix {:02x?})", &keys.forward_digest[..4]);

        Ok(keys)
    }
}

fn new_cipher(key: &[u8; 16]) -> Aes128Ctr {
    // IVs start at zero for AES-CTR (Tor spec)
    Aes128Ctr::new(key.into(), &[0u8; 16].into())
}

fn seeded_digest(seed: &[u8; 20]) -> Sha1 {
    let mut digest = Sha1::new();
    digest.update(seed);
    digest
}

/// Write the running digest of `payload` (digest field zeroed) into the cell
fn stamp_digest(digest: &mut Sha1, payload: &mut [u8]) {
    payload[DIGEST_RANGE].fill(0);
    digest.update(&payload[..]);
    let full = digest.clone().finalize();
    payload[DIGEST_RANGE].copy_from_slice(&full[..4]);
}

/// Check whether `payload` is a plaintext relay cell for this digest state.
///
/// On success the digest state is advanced and the full 20-byte running
/// digest is returned. On failure the state is left untouched.
fn check_recognized(digest: &mut Sha1, payload: &[u8]) -> Option<[u8; 20]> {
    if payload[RECOGNIZED_RANGE] != [0, 0] {
        return None;
    }
    let mut received = [0u8; 4];
    received.copy_from_slice(&payload[DIGEST_RANGE]);

    let mut zeroed = payload.to_vec();
    zeroed[DIGEST_RANGE].fill(0);
    let mut candidate = digest.clone();
    candidate.update(&zeroed);
    let full = candidate.clone().finalize();

    if full[..4] != received {
        return None;
    }
    *digest = candidate;
    let mut out = [0u8; 20];
    out.copy_from_slice(&full);
    Some(out)
}

fn check_payload_len(payload: &[u8]) -> Result<()> {
    if payload.len() != Cell::PAYLOAD_SIZE {
        return Err(TorError::MalformedCell(format!(
            "relay payload must be {} bytes, got {}",
            Cell::PAYLOAD_SIZE,
            payload.len()
        )));
    }
    Ok(())
}

/// Cipher and digest state for one hop, as seen from the client
pub struct HopCrypto {
    forward_cipher: Aes128Ctr,
    backward_cipher: Aes128Ctr,
    forward_digest: Sha1,
    backward_digest: Sha1,
}

impl HopCrypto {
    pub fn new(keys: &CircuitKeys) -> Self {
        Self {
            forward_cipher: new_cipher(&keys.forward_key),
            backward_cipher: new_cipher(&keys.backward_key),
            forward_digest: seeded_digest(&keys.forward_digest),
            backward_digest: seeded_digest(&keys.backward_digest),
        }
    }
}

/// Onion Crypto Engine
///
/// Layered encryption is a fold over the ordered hop list: outbound cells
/// are encrypted from the target hop down to hop 1 (so hop 1 peels first),
/// inbound cells are decrypted from hop 1 upward until a hop recognizes them.
#[derive(Default)]
pub struct OnionCrypto {
    hops: Vec<HopCrypto>,
    /// Full backward digest of the last cell recognized from each hop
    last_recv_digest: Vec<[u8; 20]>,
}

impl OnionCrypto {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a hop after a successful CREATED2 / EXTENDED2
    pub fn add_hop(&mut self, keys: &CircuitKeys) {
        self.hops.push(HopCrypto::new(keys));
        self.last_recv_digest.push([0u8; 20]);
    }

    pub fn hop_count(&self) -> usize {
        self.hops.len()
    }

    /// Stamp the digest for `target_hop` and apply every layer from
    /// `target_hop` down to hop 0.
    pub fn encrypt_forward(&mut self, payload: &mut [u8], target_hop: usize) -> Result<()> {
        check_payload_len(payload)?;
        if target_hop >= self.hops.len() {
            return Err(TorError::InvalidState(format!(
                "no hop {} on a {}-hop circuit",
                target_hop,
                self.hops.len()
            )));
        }

        stamp_digest(&mut self.hops[target_hop].forward_digest, payload);

        for hop in self.hops[..=target_hop].iter_mut().rev() {
            hop.forward_cipher.apply_keystream(payload);
        }
        Ok(())
    }

    /// Peel layers until a hop recognizes the cell; returns that hop's index.
    ///
    /// A cell no hop recognizes is a protocol violation. The cipher streams
    /// have advanced regardless, so the circuit must be torn down.
    pub fn decrypt_backward(&mut self, payload: &mut [u8]) -> Result<usize> {
        check_payload_len(payload)?;

        for (idx, hop) in self.hops.iter_mut().enumerate() {
            hop.backward_cipher.apply_keystream(payload);
            if let Some(full) = check_recognized(&mut hop.backward_digest, payload) {
                self.last_recv_digest[idx] = full;
                return Ok(idx);
            }
        }

        Err(TorError::DigestMismatch)
    }

    /// Running digest of the last cell received from `hop` (SENDME v1 payload)
    pub fn last_received_digest(&self, hop: usize) -> Option<[u8; 20]> {
        self.last_recv_digest.get(hop).copied()
    }
}

/// One hop's crypto as seen from the relay side of a circuit.
///
/// Used by in-process relays (tests, local simulation) to check that the
/// client side applies exactly one layer per hop.
pub struct RelayLayer {
    forward_cipher: Aes128Ctr,
    backward_cipher: Aes128Ctr,
    forward_digest: Sha1,
    backward_digest: Sha1,
}

impl RelayLayer {
    pub fn new(keys: &CircuitKeys) -> Self {
        Self {
            forward_cipher: new_cipher(&keys.forward_key),
            backward_cipher: new_cipher(&keys.backward_key),
            forward_digest: seeded_digest(&keys.forward_digest),
            backward_digest: seeded_digest(&keys.backward_digest),
        }
    }

    /// Remove this hop's layer from an outbound payload.
    ///
    /// Returns the full forward digest when the cell is addressed to this hop;
    /// `None` means the payload should be passed on to the next hop.
    pub fn peel_forward(&mut self, payload: &mut [u8]) -> Result<Option<[u8; 20]>> {
        check_payload_len(payload)?;
        self.forward_cipher.apply_keystream(payload);
        Ok(check_recognized(&mut self.forward_digest, payload))
    }

    /// Turn a plaintext relay cell originated at this hop into a backward payload
    pub fn originate_backward(&mut self, cell: &RelayCell) -> Result<(Vec<u8>, [u8; 20])> {
        let mut payload = cell.to_bytes()?;
        stamp_digest(&mut self.backward_digest, &mut payload);
        let mut full = [0u8; 20];
        full.copy_from_slice(&self.backward_digest.clone().finalize());
        self.backward_cipher.apply_keystream(&mut payload);
        Ok((payload, full))
    }

    /// Add this hop's layer to a backward payload coming from further out
    pub fn wrap_backward(&mut self, payload: &mut [u8]) -> Result<()> {
        check_payload_len(payload)?;
        self.backward_cipher.apply_keystream(payload);
        Ok(())
    }
}
