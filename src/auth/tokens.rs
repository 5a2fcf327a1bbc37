//! Token generation and one-way hashing.
//!
//! Session tokens are high-entropy secrets handed to the client; the store
//! only ever sees their SHA-256 digest, so a leaked store cannot reproduce a
//! valid cookie value. Reset tokens follow the same scheme.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};

/// 20 random bytes, unpadded text encoding. This is the raw cookie value.
pub fn generate_session_token() -> String {
    let mut bytes = [0u8; 20];
    OsRng.fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// 32 random bytes, hex. Embedded in set-password links.
pub fn generate_reset_token() -> String {
    let mut bytes = [0u8; 32];
    OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Derives the storage id for a token: lowercase-hex SHA-256.
pub fn hash_token(token: &str) -> String {
    hex::encode(Sha256::digest(token.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_tokens_are_unique_and_unpadded() {
        let a = generate_session_token();
        let b = generate_session_token();
        assert_ne!(a, b);
        assert!(!a.contains('='));
        // 20 bytes -> at least 27 base64 chars
        assert!(a.len() >= 27);
    }

    #[test]
    fn test_hash_token_is_deterministic() {
        let token = generate_session_token();
        assert_eq!(hash_token(&token), hash_token(&token));
        assert_ne!(hash_token(&token), token);
        assert_eq!(hash_token(&token).len(), 64);
        assert!(hash_token(&token)
            .chars()
            .all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn test_reset_token_is_hex() {
        let token = generate_reset_token();
        assert_eq!(token.len(), 64);
        assert!(hex::decode(&token).is_ok());
    }
}
