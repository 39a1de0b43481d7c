//! Tor certificate verification
//!
//! Parses the CERTS cell a relay sends during the link handshake and
//! checks its Ed25519 certificate chain: the signing-key certificate
//! (type 4) must be signed by the identity key it carries in its
//! signed-with-key extension, and must not be expired. When a TLS link
//! certificate (type 5) is present it must be signed by that signing key.
//!
//! Reference: tor-spec.txt Section 4.2, cert-spec.txt

use crate::error::{Result, TorError};
use ed25519_dalek::{Signature, Verifier, VerifyingKey};

/// Certificate types as defined in Tor spec
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CertType {
    /// Type 1: Link key certificate signed with RSA identity key (legacy)
    RsaLink = 1,
    /// Type 2: RSA1024 Identity certificate (legacy)
    RsaId = 2,
    /// Type 3: RSA1024 AUTHENTICATE cell link certificate (legacy)
    RsaAuth = 3,
    /// Type 4: Ed25519 signing key, signed with Ed25519 identity key
    Ed25519SigningKey = 4,
    /// Type 5: TLS link certificate, signed with Ed25519 signing key
    Ed25519TlsLink = 5,
    /// Type 6: Ed25519 AUTHENTICATE cell key, signed with Ed25519 signing key
    Ed25519AuthKey = 6,
    /// Type 7: Ed25519 identity, signed with RSA identity (cross-cert)
    Ed25519Identity = 7,
}

impl CertType {
    pub fn from_u8(val: u8) -> Option<Self> {
        match val {
            1 => Some(CertType::RsaLink),
            2 => Some(CertType::RsaId),
            3 => Some(CertType::RsaAuth),
            4 => Some(CertType::Ed25519SigningKey),
            5 => Some(CertType::Ed25519TlsLink),
            6 => Some(CertType::Ed25519AuthKey),
            7 => Some(CertType::Ed25519Identity),
            _ => None,
        }
    }
}

/// Extension type carrying the key that signed the certificate
const EXT_SIGNED_WITH_ED25519_KEY: u8 = 0x04;

/// A raw certificate from a CERTS cell
#[derive(Debug, Clone)]
pub struct Certificate {
    pub cert_type: u8,
    pub data: Vec<u8>,
}

/// Parsed Ed25519 certificate (Tor's tor-cert format)
///
/// ```text
/// VERSION (1) | CERT_TYPE (1) | EXPIRATION (4, hours) | CERT_KEY_TYPE (1)
/// CERTIFIED_KEY (32) | N_EXTENSIONS (1) | EXTENSIONS | SIGNATURE (64)
/// ```
#[derive(Debug, Clone)]
pub struct Ed25519Certificate {
    pub cert_type: u8,
    /// Expiration time (hours since Unix epoch)
    pub expiration_hours: u32,
    pub cert_key_type: u8,
    pub certified_key: [u8; 32],
    /// Key from the signed-with-ed25519-key extension, if present
    pub signing_key: Option<[u8; 32]>,
    /// Everything covered by the signature
    pub signed_data: Vec<u8>,
    pub signature: [u8; 64],
}

impl Ed25519Certificate {
    const MIN_LEN: usize = 40 + 64;

    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < Self::MIN_LEN {
            return Err(TorError::CertificateError(format!(
                "Certificate too short: {} bytes",
                data.len()
            )));
        }
        if data[0] != 0x01 {
            return Err(TorError::CertificateError(format!(
                "Unknown certificate version: {}",
                data[0]
            )));
        }

        let cert_type = data[1];
        let expiration_hours = u32::from_be_bytes([data[2], data[3], data[4], data[5]]);
        let cert_key_type = data[6];
        let mut certified_key = [0u8; 32];
        certified_key.copy_from_slice(&data[7..39]);

        let n_extensions = data[39];
        let mut offset = 40;
        let mut signing_key = None;

        for _ in 0..n_extensions {
            // ExtLength (2) | ExtType (1) | ExtFlags (1) | ExtData
            if offset + 4 > data.len() {
                return Err(TorError::CertificateError("Extension header truncated".into()));
            }
            let ext_len = u16::from_be_bytes([data[offset], data[offset + 1]]) as usize;
            let ext_type = data[offset + 2];
            let body_start = offset + 4;
            if body_start + ext_len > data.len() {
                return Err(TorError::CertificateError("Extension body truncated".into()));
            }
            if ext_type == EXT_SIGNED_WITH_ED25519_KEY && ext_len == 32 {
                let mut key = [0u8; 32];
                key.copy_from_slice(&data[body_start..body_start + 32]);
                signing_key = Some(key);
            }
            offset = body_start + ext_len;
        }

        if data.len() != offset + 64 {
            return Err(TorError::CertificateError(format!(
                "Certificate length mismatch: signature expected at {}, len {}",
                offset,
                data.len()
            )));
        }

        let mut signature = [0u8; 64];
        signature.copy_from_slice(&data[offset..]);

        Ok(Self {
            cert_type,
            expiration_hours,
            cert_key_type,
            certified_key,
            signing_key,
            signed_data: data[..offset].to_vec(),
            signature,
        })
    }

    /// Verify the certificate signature using the given key
    pub fn verify_signature(&self, key: &[u8; 32]) -> Result<()> {
        let verifying_key = VerifyingKey::from_bytes(key)
            .map_err(|e| TorError::CertificateError(format!("Invalid signing key: {}", e)))?;
        let signature = Signature::from_bytes(&self.signature);
        verifying_key
            .verify(&self.signed_data, &signature)
            .map_err(|e| {
                TorError::CertificateError(format!("Signature verification failed: {}", e))
            })
    }

    pub fn is_expired(&self, now_unix: u64) -> bool {
        u64::from(self.expiration_hours) * 3600 < now_unix
    }
}

/// Parsed CERTS cell
#[derive(Debug)]
pub struct CertsCell {
    pub certificates: Vec<Certificate>,
}

impl CertsCell {
    /// Parse a CERTS cell payload: N | (type (1) | len (2) | body)*
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.is_empty() {
            return Err(TorError::CertificateError("Empty CERTS cell".into()));
        }

        let n_certs = data[0] as usize;
        let mut offset = 1;
        let mut certificates = Vec::with_capacity(n_certs);

        for i in 0..n_certs {
            if offset + 3 > data.len() {
                return Err(TorError::CertificateError(format!(
                    "CERTS cell truncated at certificate {}",
                    i
                )));
            }
            let cert_type = data[offset];
            let cert_len = u16::from_be_bytes([data[offset + 1], data[offset + 2]]) as usize;
            offset += 3;

            if offset + cert_len > data.len() {
                return Err(TorError::CertificateError(format!(
                    "Certificate {} data truncated",
                    i
                )));
            }
            certificates.push(Certificate {
                cert_type,
                data: data[offset..offset + cert_len].to_vec(),
            });
            offset += cert_len;
        }

        Ok(Self { certificates })
    }

    pub fn get_cert(&self, cert_type: CertType) -> Option<&Certificate> {
        self.certificates
            .iter()
            .find(|c| c.cert_type == cert_type as u8)
    }

    /// Check the Ed25519 chain and return the relay's verified keys
    pub fn verify(&self, now_unix: u64) -> Result<VerifiedRelay> {
        let raw = self.get_cert(CertType::Ed25519SigningKey).ok_or_else(|| {
            TorError::CertificateError("Missing Ed25519 signing key certificate (type 4)".into())
        })?;
        let signing_cert = Ed25519Certificate::parse(&raw.data)?;

        if signing_cert.cert_type != CertType::Ed25519SigningKey as u8 {
            return Err(TorError::CertificateError(format!(
                "type 4 slot holds a type {} certificate",
                signing_cert.cert_type
            )));
        }
        if signing_cert.is_expired(now_unix) {
            return Err(TorError::CertificateError(
                "Signing key certificate is expired".into(),
            ));
        }

        let identity = signing_cert.signing_key.ok_or_else(|| {
            TorError::CertificateError("Signing key certificate does not name its signer".into())
        })?;
        signing_cert.verify_signature(&identity)?;

        if let Some(raw_link) = self.get_cert(CertType::Ed25519TlsLink) {
            let link_cert = Ed25519Certificate::parse(&raw_link.data)?;
            if link_cert.is_expired(now_unix) {
                return Err(TorError::CertificateError("TLS link certificate is expired".into()));
            }
            link_cert.verify_signature(&signing_cert.certified_key)?;
        }

        Ok(VerifiedRelay {
            ed25519_identity: identity,
            ed25519_signing_key: signing_cert.certified_key,
        })
    }
}

/// Keys proven by a relay's CERTS cell
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedRelay {
    pub ed25519_identity: [u8; 32],
    pub ed25519_signing_key: [u8; 32],
}

#[cfg(test)]
mod tests {
    use super::*;
    use ed25519_dalek::{Signer, SigningKey};

    fn cert(cert_type: u8, expires_hours: u32, certified: [u8; 32], signer: &SigningKey) -> Vec<u8> {
        let mut body = vec![0x01, cert_type];
        body.extend_from_slice(&expires_hours.to_be_bytes());
        body.push(0x01);
        body.extend_from_slice(&certified);
        body.push(1);
        body.extend_from_slice(&32u16.to_be_bytes());
        body.push(EXT_SIGNED_WITH_ED25519_KEY);
        body.push(0);
        body.extend_from_slice(signer.verifying_key().as_bytes());
        let sig = signer.sign(&body);
        body.extend_from_slice(&sig.to_bytes());
        body
    }

    fn certs_payload(certs: &[(u8, Vec<u8>)]) -> Vec<u8> {
        let mut out = vec![certs.len() as u8];
        for (t, body) in certs {
            out.push(*t);
            out.extend_from_slice(&(body.len() as u16).to_be_bytes());
            out.extend_from_slice(body);
        }
        out
    }

    const NOW: u64 = 1_700_000_000;

    #[test]
    fn test_parse_empty_certs_cell() {
        assert!(CertsCell::parse(&[]).is_err());
        assert_eq!(CertsCell::parse(&[0]).unwrap().certificates.len(), 0);
    }

    #[test]
    fn test_cert_type_parsing() {
        assert_eq!(CertType::from_u8(4), Some(CertType::Ed25519SigningKey));
        assert_eq!(CertType::from_u8(7), Some(CertType::Ed25519Identity));
        assert_eq!(CertType::from_u8(99), None);
    }

    #[test]
    fn test_valid_chain() {
        let identity = SigningKey::from_bytes(&[1u8; 32]);
        let signing = SigningKey::from_bytes(&[2u8; 32]);
        let expires = (NOW / 3600) as u32 + 24;

        let payload = certs_payload(&[
            (4, cert(4, expires, signing.verifying_key().to_bytes(), &identity)),
            (5, cert(5, expires, [9u8; 32], &signing)),
        ]);
        let verified = CertsCell::parse(&payload).unwrap().verify(NOW).unwrap();
        assert_eq!(verified.ed25519_identity, identity.verifying_key().to_bytes());
        assert_eq!(verified.ed25519_signing_key, signing.verifying_key().to_bytes());
    }

    #[test]
    fn test_expired_and_forged_rejected() {
        let identity = SigningKey::from_bytes(&[1u8; 32]);
        let signing = SigningKey::from_bytes(&[2u8; 32]);
        let past = (NOW / 3600) as u32 - 1;

        let expired = certs_payload(&[(4, cert(4, past, signing.verifying_key().to_bytes(), &identity))]);
        assert!(CertsCell::parse(&expired).unwrap().verify(NOW).is_err());

        let mut forged = cert(4, past + 48, signing.verifying_key().to_bytes(), &identity);
        forged[10] ^= 1;
        let forged = certs_payload(&[(4, forged)]);
        assert!(CertsCell::parse(&forged).unwrap().verify(NOW).is_err());

        assert!(CertsCell::parse(&[0]).unwrap().verify(NOW).is_err());
    }
}
