//! TOTP enrollment and verification, plus at-rest encryption of the key.
//!
//! Codes are 6 digits over a 30-second period (SHA-1), which is what every
//! mainstream authenticator app expects. Keys are 20 random bytes and are
//! wrapped with AES-256-GCM before they touch the document store.

use crate::error::AppError;
use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng as AeadOsRng};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use rand::rngs::OsRng;
use rand::RngCore;
use totp_rs::{Algorithm, TOTP};

pub const TOTP_KEY_BYTES: usize = 20;
const TOTP_DIGITS: usize = 6;
const TOTP_STEP_SECONDS: u64 = 30;
const NONCE_BYTES: usize = 12;

pub fn generate_totp_key() -> [u8; TOTP_KEY_BYTES] {
    let mut key = [0u8; TOTP_KEY_BYTES];
    OsRng.fill_bytes(&mut key);
    key
}

fn build(key: &[u8], issuer: Option<String>, account: String) -> Result<TOTP, AppError> {
    TOTP::new(
        Algorithm::SHA1,
        TOTP_DIGITS,
        1,
        TOTP_STEP_SECONDS,
        key.to_vec(),
        issuer,
        account,
    )
    .map_err(|e| AppError::Internal(format!("totp init: {}", e)))
}

/// `otpauth://` URI for the enrollment QR code.
pub fn key_uri(issuer: &str, account: &str, key: &[u8]) -> Result<String, AppError> {
    let totp = build(key, Some(issuer.to_string()), account.to_string())?;
    Ok(totp.get_url())
}

/// Checks `code` against the current 30-second window (one period of skew
/// either side). Anything that fails to parse or verify is just `false`.
pub fn verify_code(key: &[u8], code: &str) -> bool {
    let Ok(totp) = build(key, None, String::new()) else {
        return false;
    };
    totp.check_current(code).unwrap_or(false)
}

/// Generates the code for the current window. Used by enrollment tests and
/// nothing else in the request path.
pub fn current_code(key: &[u8]) -> Result<String, AppError> {
    let totp = build(key, None, String::new())?;
    totp.generate_current()
        .map_err(|e| AppError::Internal(format!("totp clock: {}", e)))
}

/// AES-256-GCM wrapping for TOTP keys at rest.
pub struct TotpCipher {
    cipher: Aes256Gcm,
}

impl TotpCipher {
    /// `key_hex` must decode to exactly 32 bytes.
    pub fn from_hex(key_hex: &str) -> Result<Self, AppError> {
        let bytes = hex::decode(key_hex)
            .map_err(|e| AppError::Config(format!("totp cipher key: {}", e)))?;
        if bytes.len() != 32 {
            return Err(AppError::Config(
                "totp cipher key must be 32 bytes of hex".to_string(),
            ));
        }
        let key = Key::<Aes256Gcm>::from_slice(&bytes);
        Ok(Self {
            cipher: Aes256Gcm::new(key),
        })
    }

    /// Returns `nonce || ciphertext`.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, AppError> {
        let nonce = Aes256Gcm::generate_nonce(&mut AeadOsRng);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, plaintext)
            .map_err(|e| AppError::Internal(format!("totp key encrypt: {}", e)))?;
        let mut out = nonce.to_vec();
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    pub fn decrypt(&self, data: &[u8]) -> Result<Vec<u8>, AppError> {
        if data.len() <= NONCE_BYTES {
            return Err(AppError::Internal("totp key ciphertext too short".into()));
        }
        let (nonce, ciphertext) = data.split_at(NONCE_BYTES);
        self.cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|e| AppError::Internal(format!("totp key decrypt: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cipher() -> TotpCipher {
        TotpCipher::from_hex(&"ab".repeat(32)).unwrap()
    }

    #[test]
    fn test_verify_accepts_current_code() {
        let key = generate_totp_key();
        let code = current_code(&key).unwrap();
        assert!(verify_code(&key, &code));
        assert!(!verify_code(&key, "000000"));
        assert!(!verify_code(&key, "not-a-code"));
    }

    #[test]
    fn test_key_uri_contains_issuer_and_account() {
        let key = generate_totp_key();
        let uri = key_uri("Gatehouse", "alice@example.com", &key).unwrap();
        assert!(uri.starts_with("otpauth://totp/"));
        assert!(uri.contains("Gatehouse"));
        assert!(uri.contains("alice%40example.com") || uri.contains("alice@example.com"));
    }

    #[test]
    fn test_cipher_round_trip() {
        let key = generate_totp_key();
        let wrapped = cipher().encrypt(&key).unwrap();
        assert_ne!(&wrapped[NONCE_BYTES..], &key[..]);
        assert_eq!(cipher().decrypt(&wrapped).unwrap(), key.to_vec());
    }

    #[test]
    fn test_cipher_rejects_tampering() {
        let key = generate_totp_key();
        let mut wrapped = cipher().encrypt(&key).unwrap();
        let last = wrapped.len() - 1;
        wrapped[last] ^= 0xff;
        assert!(cipher().decrypt(&wrapped).is_err());
    }

    #[test]
    fn test_cipher_key_must_be_32_bytes() {
        assert!(TotpCipher::from_hex("abcd").is_err());
        assert!(TotpCipher::from_hex("zz").is_err());
    }
}
