//! ntor handshake implementation
//!
//! Implements the ntor (ntor1) key exchange protocol used by Tor for circuit creation.
//! Based on X25519 Elliptic Curve Diffie-Hellman.
//!
//! References:
//! - Tor Spec: https://spec.torproject.org/tor-spec/create-created-cells.html
//! - Proposal 216: ntor handshake
//!
//! AUTH is compared in constant time.

use super::crypto::CircuitKeys;
use crate::error::{Result, TorError};
use hmac::{Hmac, Mac};
use rand::rngs::OsRng;
use sha2::Sha256;
use subtle::ConstantTimeEq;
use x25519_dalek::{PublicKey, StaticSecret};

type HmacSha256 = Hmac<Sha256>;

const PROTOID: &[u8] = b"ntor-curve25519-sha256-1";
const T_KEY: &[u8] = b"ntor-curve25519-sha256-1:key_extract";
const T_VERIFY: &[u8] = b"ntor-curve25519-sha256-1:verify";
const T_MAC: &[u8] = b"ntor-curve25519-sha256-1:mac";

/// Handshake type for ntor in CREATE2 / EXTEND2
pub const NTOR_HANDSHAKE_TYPE: u16 = 0x0002;

/// Length of the client handshake data: ID | B | X
pub const NTOR_CLIENT_DATA_LEN: usize = 84;

/// Length of the server reply: Y | AUTH
pub const NTOR_SERVER_DATA_LEN: usize = 64;

/// ntor handshake state (client side)
///
/// The ephemeral secret is a `StaticSecret`, which zeroizes itself on drop.
pub struct NtorHandshake {
    client_secret: StaticSecret,
    client_public: PublicKey,
}

impl NtorHandshake {
    /// Create a new ntor handshake with a fresh ephemeral key pair
    ///
    /// Obviously broken RNG output is rejected with `EntropyError`.
    pub fn new() -> Result<Self> {
        let client_secret = StaticSecret::random_from_rng(OsRng);
        let client_public = PublicKey::from(&client_secret);

        validate_entropy(client_public.as_bytes())?;

        log::trace!(
            "Generated ntor client key (prefix {:02x?})",
            &client_public.as_bytes()[..8]
        );

        Ok(Self {
            client_secret,
            client_public,
        })
    }

    /// Get the client's public key (to send to relay)
    pub fn client_public_key(&self) -> &PublicKey {
        &self.client_public
    }

    /// Complete the handshake with relay's response
    ///
    /// Returns KEY_SEED (32 bytes) for use with [`derive_circuit_keys`].
    ///
    /// Tor spec: secret_input = EXP(Y,x) | EXP(B,x) | ID | B | X | Y | PROTOID
    pub fn complete(
        self,
        relay_identity_fingerprint: &[u8; 20],
        relay_onion_key: &PublicKey,
        server_public_key: &PublicKey,
        server_auth: &[u8; 32],
    ) -> Result<[u8; 32]> {
        let exp_yx = self.client_secret.diffie_hellman(server_public_key);
        let exp_bx = self.client_secret.diffie_hellman(relay_onion_key);
        if !exp_yx.was_contributory() || !exp_bx.was_contributory() {
            return Err(TorError::HandshakeFailed(
                "ntor shared secret is degenerate (small-order key)".into(),
            ));
        }

        let secret_input = secret_input(
            exp_yx.as_bytes(),
            exp_bx.as_bytes(),
            relay_identity_fingerprint,
            relay_onion_key,
            &self.client_public,
            server_public_key,
        );
        let (key_seed, computed_auth) = seed_and_auth(
            &secret_input,
            relay_identity_fingerprint,
            relay_onion_key,
            &self.client_public,
            server_public_key,
        )?;

        let auth_valid: bool = computed_auth.as_slice().ct_eq(server_auth).into();
        if !auth_valid {
            log::warn!("Server AUTH verification failed");
            return Err(TorError::AuthVerificationFailed(
                "ntor server AUTH mismatch".into(),
            ));
        }

        log::debug!("Server AUTH verified");
        Ok(key_seed)
    }

    /// Create CREATE2 / EXTEND2 handshake data for ntor
    ///
    /// Format (Tor spec): ID (20 bytes) | B (32 bytes) | X (32 bytes) = 84 bytes
    pub fn create_handshake_data(
        client_public: &PublicKey,
        relay_identity_fingerprint: &[u8; 20],
        relay_onion_key: &PublicKey,
    ) -> Vec<u8> {
        let mut data = Vec::with_capacity(NTOR_CLIENT_DATA_LEN);
        data.extend_from_slice(relay_identity_fingerprint);
        data.extend_from_slice(relay_onion_key.as_bytes());
        data.extend_from_slice(client_public.as_bytes());
        data
    }
}

/// Detects obvious RNG failures (all zeros, all ones, repeated patterns)
fn validate_entropy(bytes: &[u8]) -> Result<()> {
    if bytes.iter().all(|&b| b == 0) {
        log::error!("Generated key is all zeros");
        return Err(TorError::EntropyError("all zeros".into()));
    }
    if bytes.iter().all(|&b| b == 0xFF) {
        log::error!("Generated key is all 0xFF");
        return Err(TorError::EntropyError("all ones".into()));
    }

    let unique_bytes: std::collections::HashSet<u8> = bytes.iter().copied().collect();
    if unique_bytes.len() < 8 {
        log::error!("Generated key has low entropy ({} unique bytes)", unique_bytes.len());
        return Err(TorError::EntropyError(format!(
            "low entropy: {} unique bytes",
            unique_bytes.len()
        )));
    }
    Ok(())
}

fn secret_input(
    exp_1: &[u8; 32],
    exp_2: &[u8; 32],
    id: &[u8; 20],
    b: &PublicKey,
    x: &PublicKey,
    y: &PublicKey,
) -> Vec<u8> {
    let mut input = Vec::with_capacity(32 * 5 + 20 + PROTOID.len());
    input.extend_from_slice(exp_1);
    input.extend_from_slice(exp_2);
    input.extend_from_slice(id);
    input.extend_from_slice(b.as_bytes());
    input.extend_from_slice(x.as_bytes());
    input.extend_from_slice(y.as_bytes());
    input.extend_from_slice(PROTOID);
    input
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Result<[u8; 32]> {
    let mut mac = HmacSha256::new_from_slice(key)
        .map_err(|e| TorError::Crypto(format!("HMAC init failed: {}", e)))?;
    mac.update(data);
    let mut out = [0u8; 32];
    out.copy_from_slice(&mac.finalize().into_bytes());
    Ok(out)
}

/// KEY_SEED = H(secret_input, t_key), AUTH = H(verify | ID | B | Y | X | PROTOID | "Server", t_mac)
fn seed_and_auth(
    secret_input: &[u8],
    id: &[u8; 20],
    b: &PublicKey,
    x: &PublicKey,
    y: &PublicKey,
) -> Result<([u8; 32], [u8; 32])> {
    let key_seed = hmac_sha256(T_KEY, secret_input)?;
    let verify = hmac_sha256(T_VERIFY, secret_input)?;

    let mut auth_input = Vec::with_capacity(32 * 4 + 20 + PROTOID.len() + 6);
    auth_input.extend_from_slice(&verify);
    auth_input.extend_from_slice(id);
    auth_input.extend_from_slice(b.as_bytes());
    auth_input.extend_from_slice(y.as_bytes());
    auth_input.extend_from_slice(x.as_bytes());
    auth_input.extend_from_slice(PROTOID);
    auth_input.extend_from_slice(b"Server");

    let auth = hmac_sha256(T_MAC, &auth_input)?;
    Ok((key_seed, auth))
}

/// Relay side of the ntor handshake.
///
/// Takes the 84-byte client data and returns the 64-byte reply (Y | AUTH)
/// together with KEY_SEED. Used by in-process relays.
pub fn server_handshake(
    identity_fingerprint: &[u8; 20],
    onion_secret: &StaticSecret,
    client_data: &[u8],
) -> Result<(Vec<u8>, [u8; 32])> {
    if client_data.len() < NTOR_CLIENT_DATA_LEN {
        return Err(TorError::HandshakeFailed("ntor client data too short".into()));
    }
    if client_data[..20] != identity_fingerprint[..] {
        return Err(TorError::HandshakeFailed("ntor request for another relay".into()));
    }

    let onion_public = PublicKey::from(onion_secret);
    if client_data[20..52] != onion_public.as_bytes()[..] {
        return Err(TorError::HandshakeFailed("ntor request for unknown onion key".into()));
    }

    let mut x_bytes = [0u8; 32];
    x_bytes.copy_from_slice(&client_data[52..84]);
    let x = PublicKey::from(x_bytes);

    let y_secret = StaticSecret::random_from_rng(OsRng);
    let y = PublicKey::from(&y_secret);

    let exp_xy = y_secret.diffie_hellman(&x);
    let exp_xb = onion_secret.diffie_hellman(&x);

    let input = secret_input(
        exp_xy.as_bytes(),
        exp_xb.as_bytes(),
        identity_fingerprint,
        &onion_public,
        &x,
        &y,
    );
    let (key_seed, auth) = seed_and_auth(&input, identity_fingerprint, &onion_public, &x, &y)?;

    let mut reply = Vec::with_capacity(NTOR_SERVER_DATA_LEN);
    reply.extend_from_slice(y.as_bytes());
    reply.extend_from_slice(&auth);
    Ok((reply, key_seed))
}

/// Parse the ntor reply carried by CREATED2 / EXTENDED2: HLEN (2) | Y (32) | AUTH (32)
pub fn parse_created2_payload(payload: &[u8]) -> Result<(PublicKey, [u8; 32])> {
    if payload.len() < 2 {
        return Err(TorError::ProtocolError("CREATED2 payload too short".into()));
    }
    let hlen = u16::from_be_bytes([payload[0], payload[1]]) as usize;
    if hlen < NTOR_SERVER_DATA_LEN || payload.len() < 2 + hlen {
        return Err(TorError::ProtocolError(format!(
            "CREATED2 handshake data too short: HLEN={}",
            hlen
        )));
    }
    let hdata = &payload[2..2 + NTOR_SERVER_DATA_LEN];

    let mut server_public_bytes = [0u8; 32];
    server_public_bytes.copy_from_slice(&hdata[0..32]);
    let mut server_auth = [0u8; 32];
    server_auth.copy_from_slice(&hdata[32..64]);

    Ok((PublicKey::from(server_public_bytes), server_auth))
}

/// Derive circuit keys from the ntor KEY_SEED
pub fn derive_circuit_keys(key_seed: &[u8; 32]) -> Result<CircuitKeys> {
    CircuitKeys::derive_from_secret(key_seed)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn relay_identity() -> [u8; 20] {
        [
            0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08, 0x09, 0x0a, 0x0b, 0x0c, 0x0d, 0x0e,
            0x0f, 0x10, 0x11, 0x12, 0x13, 0x14,
        ]
    }

    fn with_hlen(reply: &[u8]) -> Vec<u8> {
        let mut payload = (reply.len() as u16).to_be_bytes().to_vec();
        payload.extend_from_slice(reply);
        payload
    }

    #[test]
    fn test_ntor_handshake_creation() {
        let handshake = NtorHandshake::new().unwrap();
        assert_eq!(handshake.client_public_key().as_bytes().len(), 32);
    }

    #[test]
    fn test_client_and_server_agree() {
        let id = relay_identity();
        let onion_secret = StaticSecret::random_from_rng(OsRng);
        let onion_public = PublicKey::from(&onion_secret);

        let client = NtorHandshake::new().unwrap();
        let data =
            NtorHandshake::create_handshake_data(client.client_public_key(), &id, &onion_public);

        let (reply, server_seed) = server_handshake(&id, &onion_secret, &data).unwrap();
        let (y, auth) = parse_created2_payload(&with_hlen(&reply)).unwrap();
        let client_seed = client.complete(&id, &onion_public, &y, &auth).unwrap();

        assert_eq!(client_seed, server_seed);
        let keys = derive_circuit_keys(&client_seed).unwrap();
        assert_ne!(keys.forward_key, keys.backward_key);
    }

    #[test]
    fn test_bad_auth_rejected() {
        let id = relay_identity();
        let onion_secret = StaticSecret::random_from_rng(OsRng);
        let onion_public = PublicKey::from(&onion_secret);

        let client = NtorHandshake::new().unwrap();
        let data =
            NtorHandshake::create_handshake_data(client.client_public_key(), &id, &onion_public);
        let (mut reply, _) = server_handshake(&id, &onion_secret, &data).unwrap();
        reply[40] ^= 0xff;

        let (y, auth) = parse_created2_payload(&with_hlen(&reply)).unwrap();
        let err = client.complete(&id, &onion_public, &y, &auth).unwrap_err();
        assert!(matches!(err, TorError::AuthVerificationFailed(_)));
    }

    #[test]
    fn test_create_handshake_data() {
        let client_secret = StaticSecret::random_from_rng(OsRng);
        let client_public = PublicKey::from(&client_secret);
        let relay_fingerprint = relay_identity();

        let onion_secret = StaticSecret::random_from_rng(OsRng);
        let relay_onion = PublicKey::from(&onion_secret);

        let data =
            NtorHandshake::create_handshake_data(&client_public, &relay_fingerprint, &relay_onion);

        assert_eq!(data.len(), NTOR_CLIENT_DATA_LEN);
        assert_eq!(&data[0..20], &relay_fingerprint);
        assert_eq!(&data[20..52], relay_onion.as_bytes());
        assert_eq!(&data[52..84], client_public.as_bytes());
    }

    #[test]
    fn test_short_created2_rejected() {
        assert!(parse_created2_payload(&[0, 64, 1, 2, 3]).is_err());
        assert!(parse_created2_payload(&[0]).is_err());
    }

    #[test]
    fn test_entropy_validation() {
        assert!(validate_entropy(&[0u8; 32]).is_err());
        assert!(validate_entropy(&[0xffu8; 32]).is_err());
        let varied: Vec<u8> = (0..32).collect();
        assert!(validate_entropy(&varied).is_ok());
    }
}
