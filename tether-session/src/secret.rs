//! Server-side secret material and keyed hashing

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use rand::{rngs::OsRng, RngCore};
use hmac::{
    digest::{Key, KeyInit},
    Hmac, Mac,
};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tracing::warn;

type HmacSha256 = Hmac<Sha256>;

/// Process-wide secret used to key fingerprints and integrity tokens
#[derive(Clone)]
pub struct ServerSecret(Arc<[u8]>);

impl ServerSecret {
    pub fn from_bytes(bytes: &[u8]) -> Self {
        Self(Arc::from(bytes))
    }

    pub fn generate() -> Self {
        let mut bytes = [0u8; 32];
        OsRng.fill_bytes(&mut bytes);
        Self::from_bytes(&bytes)
    }

    /// Read a base64 secret from `var`, falling back to a random one
    ///
    /// A random secret invalidates every fingerprint and integrity token on
    /// restart, which is acceptable for development only.
    pub fn from_env_or_generate(var: &str) -> Self {
        match std::env::var(var) {
            Ok(encoded) => match BASE64.decode(encoded.trim()) {
                Ok(bytes) if bytes.len() >= 32 => Self::from_bytes(&bytes),
                Ok(_) => {
                    warn!(variable = var, "Secret shorter than 32 bytes, generating a random one");
                    Self::generate()
                }
                Err(e) => {
                    warn!(variable = var, error = %e, "Secret is not valid base64, generating a random one");
                    Self::generate()
                }
            },
            Err(_) => {
                warn!(variable = var, "No secret configured, generating a random one");
                Self::generate()
            }
        }
    }

    /// Derive an independent key for one purpose
    pub fn derive(&self, label: &str) -> [u8; 32] {
        hmac_sha256(&self.0, &[b"tether-derive", label.as_bytes()])
    }
}

impl std::fmt::Debug for ServerSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ServerSecret(..)")
    }
}

/// HMAC-SHA256 over the concatenation of `parts`
pub fn hmac_sha256(key: &[u8], parts: &[&[u8]]) -> [u8; 32] {
    let mut mac = keyed(key);
    for part in parts {
        mac.update(part);
    }
    mac.finalize().into_bytes().into()
}

/// Keys are brought to the block size the way HMAC itself does it, so
/// construction cannot fail
fn keyed(key: &[u8]) -> HmacSha256 {
    let mut block = Key::<HmacSha256>::default();
    if key.len() > block.len() {
        block[..32].copy_from_slice(&Sha256::digest(key));
    } else {
        block[..key.len()].copy_from_slice(key);
    }
    <HmacSha256 as KeyInit>::new(&block)
}

/// Compare without short-circuiting on the first differing byte
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hmac_matches_rfc4231_case_2() {
        let mac = hmac_sha256(b"Jefe", &[b"what do ya want ", b"for nothing?"]);
        let hex: String = mac.iter().map(|b| format!("{:02x}", b)).collect();
        assert_eq!(
            hex,
            "5bdcc146bf60754e6a042426089575c75a003f089d2739839dec58b964ec3843"
        );
    }

    #[test]
    fn test_hmac_long_key_matches_rfc4231_case_6() {
        let key = [0xaau8; 131];
        let mac = hmac_sha256(
            &key,
            &[b"Test Using Larger Than Block-Size Key - Hash Key First"],
        );
        let hex: String = mac.iter().map(|b| format!("{:02x}", b)).collect();
        assert_eq!(
            hex,
            "60e431591ee0b67f0d8a26aacbf5b77f8e0bc6213728c5140546040f0ee37f54"
        );
    }

    #[test]
    fn test_derived_keys_are_label_specific() {
        let secret = ServerSecret::from_bytes(&[7u8; 32]);
        assert_ne!(secret.derive("fingerprint"), secret.derive("integrity"));
        assert_eq!(secret.derive("fingerprint"), secret.derive("fingerprint"));
    }

    #[test]
    fn test_constant_time_eq() {
        assert!(constant_time_eq(b"abc", b"abc"));
        assert!(!constant_time_eq(b"abc", b"abd"));
        assert!(!constant_time_eq(b"abc", b"ab"));
    }
}
