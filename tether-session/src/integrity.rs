//! Request-integrity tokens
//!
//! A token is `nonce.mac` where `mac = HMAC(key, nonce || session_id)`, both
//! parts unpadded URL-safe base64. Tokens are only ever issued for and checked
//! against the [`SessionId`] the store returned, so a token minted for one
//! session is worthless for any other.

use crate::model::SessionId;
use crate::secret::{constant_time_eq, hmac_sha256, ServerSecret};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use rand::rngs::OsRng;
use rand::RngCore;

const NONCE_LEN: usize = 16;

#[derive(Clone)]
pub struct IntegrityTokens {
    key: [u8; 32],
}

impl IntegrityTokens {
    pub fn new(secret: &ServerSecret) -> Self {
        Self {
            key: secret.derive("integrity"),
        }
    }

    pub fn issue(&self, session_id: &SessionId) -> String {
        let mut nonce = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce);
        let mac = hmac_sha256(&self.key, &[&nonce[..], session_id.as_bytes()]);

        format!(
            "{}.{}",
            URL_SAFE_NO_PAD.encode(nonce),
            URL_SAFE_NO_PAD.encode(mac)
        )
    }

    pub fn verify(&self, session_id: &SessionId, token: &str) -> bool {
        let Some((nonce, mac)) = token.split_once('.') else {
            return false;
        };

        let (Ok(nonce), Ok(mac)) = (URL_SAFE_NO_PAD.decode(nonce), URL_SAFE_NO_PAD.decode(mac))
        else {
            return false;
        };

        if nonce.len() != NONCE_LEN {
            return false;
        }

        let expected = hmac_sha256(&self.key, &[&nonce[..], session_id.as_bytes()]);
        constant_time_eq(&expected, &mac)
    }
}

impl std::fmt::Debug for IntegrityTokens {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("IntegrityTokens")
    }
}
