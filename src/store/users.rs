//! User documents.
//!
//! Users live at `users/<id>`. Security-sensitive lookups (by email, password
//! hash, reset token) fold store failures into `None` so callers cannot tell
//! a missing account from an unreachable store; the real error is logged
//! here first.

use crate::auth::totp::TotpCipher;
use crate::error::{AppError, StoreError};
use crate::store::DocumentStore;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tracing::error;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize)]
pub struct User {
    pub id: String,
    pub email: String,
    pub username: String,
    pub email_verified: bool,
    pub registered_2fa: bool,
}

pub struct NewUser {
    pub email: String,
    pub username: String,
    pub password_hash: String,
    pub reset_token_hash: String,
    pub reset_token_expires_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UserDoc {
    email: String,
    username: String,
    password_hash: String,
    #[serde(default)]
    email_verified: bool,
    #[serde(default)]
    totp_key: Option<String>,
    #[serde(default)]
    reset_token_hash: Option<String>,
    #[serde(default)]
    reset_token_expires_at: Option<i64>,
    #[serde(default)]
    created_at: i64,
}

impl UserDoc {
    fn into_user(self, id: String) -> User {
        User {
            id,
            email: self.email,
            username: self.username,
            email_verified: self.email_verified,
            registered_2fa: self.totp_key.as_deref().is_some_and(|k| !k.is_empty()),
        }
    }
}

pub struct ResetToken {
    pub token_hash: String,
    pub expires_at: DateTime<Utc>,
}

pub struct UserRepo {
    store: Arc<dyn DocumentStore>,
    cipher: Arc<TotpCipher>,
}

fn user_path(id: &str) -> String {
    format!("users/{}", id)
}

impl UserRepo {
    pub fn new(store: Arc<dyn DocumentStore>, cipher: Arc<TotpCipher>) -> Self {
        Self { store, cipher }
    }

    pub async fn create_user(&self, new: NewUser) -> Result<User, AppError> {
        let id = Uuid::new_v4().to_string();
        let doc = UserDoc {
            email: new.email,
            username: new.username,
            password_hash: new.password_hash,
            email_verified: false,
            totp_key: None,
            reset_token_hash: Some(new.reset_token_hash),
            reset_token_expires_at: Some(new.reset_token_expires_at.timestamp()),
            created_at: Utc::now().timestamp(),
        };
        let value = serde_json::to_value(&doc)
            .map_err(|e| AppError::Internal(format!("user doc: {}", e)))?;
        self.store.set(&user_path(&id), value).await?;
        Ok(doc.into_user(id))
    }

    async fn find_by_email(&self, email: &str) -> Result<Option<(String, UserDoc)>, StoreError> {
        let Some((id, value)) = self.store.query_by_field("users", "email", email).await? else {
            return Ok(None);
        };
        let doc: UserDoc = serde_json::from_value(value).map_err(|e| StoreError::Malformed {
            path: user_path(&id),
            detail: e.to_string(),
        })?;
        Ok(Some((id, doc)))
    }

    pub async fn get_user(&self, id: &str) -> Option<User> {
        let value = match self.store.get(&user_path(id)).await {
            Ok(Some(value)) => value,
            Ok(None) => return None,
            Err(e) => {
                error!("user lookup failed for {}: {}", id, e);
                return None;
            }
        };
        match serde_json::from_value::<UserDoc>(value) {
            Ok(doc) => Some(doc.into_user(id.to_string())),
            Err(e) => {
                error!("malformed user document at {}: {}", user_path(id), e);
                None
            }
        }
    }

    pub async fn get_user_from_email(&self, email: &str) -> Option<User> {
        match self.find_by_email(email).await {
            Ok(Some((id, doc))) => Some(doc.into_user(id)),
            Ok(None) => None,
            Err(e) => {
                error!("user email lookup failed: {}", e);
                None
            }
        }
    }

    pub async fn get_password_hash(&self, email: &str) -> Option<String> {
        match self.find_by_email(email).await {
            Ok(Some((_, doc))) => Some(doc.password_hash),
            Ok(None) => None,
            Err(e) => {
                error!("password hash lookup failed: {}", e);
                None
            }
        }
    }

    pub async fn get_reset_token(&self, email: &str) -> Option<ResetToken> {
        match self.find_by_email(email).await {
            Ok(Some((_, doc))) => {
                let token_hash = doc.reset_token_hash?;
                let expires_at =
                    DateTime::from_timestamp(doc.reset_token_expires_at?, 0)?;
                Some(ResetToken {
                    token_hash,
                    expires_at,
                })
            }
            Ok(None) => None,
            Err(e) => {
                error!("reset token lookup failed: {}", e);
                None
            }
        }
    }

    /// Re-hashes done by the caller; this also marks the email verified and
    /// is the tail end of the set-password flow.
    pub async fn update_password(&self, email: &str, new_hash: &str) -> Result<(), AppError> {
        let (id, _) = self
            .find_by_email(email)
            .await?
            .ok_or_else(|| AppError::Internal("no user for password update".to_string()))?;
        self.store
            .update(
                &user_path(&id),
                json!({ "passwordHash": new_hash, "emailVerified": true }),
            )
            .await?;
        Ok(())
    }

    pub async fn clear_reset_token(&self, email: &str) -> Result<(), AppError> {
        let (id, _) = self
            .find_by_email(email)
            .await?
            .ok_or_else(|| AppError::Internal("no user for reset token clear".to_string()))?;
        self.store
            .update(
                &user_path(&id),
                json!({ "resetTokenHash": null, "resetTokenExpiresAt": null }),
            )
            .await?;
        Ok(())
    }

    pub async fn get_totp_key(&self, user_id: &str) -> Option<Vec<u8>> {
        let value = match self.store.get(&user_path(user_id)).await {
            Ok(Some(value)) => value,
            Ok(None) => return None,
            Err(e) => {
                error!("totp key lookup failed for {}: {}", user_id, e);
                return None;
            }
        };
        let encoded = value.get("totpKey")?.as_str()?;
        let wrapped = match BASE64.decode(encoded) {
            Ok(bytes) => bytes,
            Err(e) => {
                error!("undecodable totp key for {}: {}", user_id, e);
                return None;
            }
        };
        match self.cipher.decrypt(&wrapped) {
            Ok(key) => Some(key),
            Err(e) => {
                error!("totp key decrypt failed for {}: {}", user_id, e);
                None
            }
        }
    }

    pub async fn update_totp_key(&self, user_id: &str, key: &[u8]) -> Result<(), AppError> {
        let wrapped = self.cipher.encrypt(key)?;
        self.store
            .update(
                &user_path(user_id),
                json!({ "totpKey": BASE64.encode(wrapped) }),
            )
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::totp;
    use crate::store::MemoryStore;

    fn repo() -> UserRepo {
        let store = Arc::new(MemoryStore::new());
        let cipher = Arc::new(TotpCipher::from_hex(&"11".repeat(32)).unwrap());
        UserRepo::new(store, cipher)
    }

    fn new_user(email: &str) -> NewUser {
        NewUser {
            email: email.to_string(),
            username: "Alice Example".to_string(),
            password_hash: "$argon2id$fake".to_string(),
            reset_token_hash: "deadbeef".to_string(),
            reset_token_expires_at: Utc::now() + chrono::Duration::hours(1),
        }
    }

    #[tokio::test]
    async fn test_create_and_lookup() {
        let repo = repo();
        let created = repo.create_user(new_user("alice@example.com")).await.unwrap();
        assert!(!created.email_verified);
        assert!(!created.registered_2fa);

        let by_email = repo.get_user_from_email("alice@example.com").await.unwrap();
        assert_eq!(by_email.id, created.id);
        let by_id = repo.get_user(&created.id).await.unwrap();
        assert_eq!(by_id.email, "alice@example.com");

        assert!(repo.get_user_from_email("nobody@example.com").await.is_none());
        assert!(repo.get_user("missing-id").await.is_none());
    }

    #[tokio::test]
    async fn test_totp_key_round_trip_flips_registration() {
        let repo = repo();
        let user = repo.create_user(new_user("bob@example.com")).await.unwrap();
        assert!(repo.get_totp_key(&user.id).await.is_none());

        let key = totp::generate_totp_key();
        repo.update_totp_key(&user.id, &key).await.unwrap();

        let loaded = repo.get_totp_key(&user.id).await.unwrap();
        assert_eq!(loaded, key.to_vec());
        assert!(repo.get_user(&user.id).await.unwrap().registered_2fa);
    }

    #[tokio::test]
    async fn test_password_update_marks_email_verified() {
        let repo = repo();
        repo.create_user(new_user("carol@example.com")).await.unwrap();

        repo.update_password("carol@example.com", "$argon2id$new")
            .await
            .unwrap();
        assert_eq!(
            repo.get_password_hash("carol@example.com").await.unwrap(),
            "$argon2id$new"
        );
        assert!(
            repo.get_user_from_email("carol@example.com")
                .await
                .unwrap()
                .email_verified
        );
    }

    #[tokio::test]
    async fn test_reset_token_clears() {
        let repo = repo();
        repo.create_user(new_user("dave@example.com")).await.unwrap();
        assert!(repo.get_reset_token("dave@example.com").await.is_some());

        repo.clear_reset_token("dave@example.com").await.unwrap();
        assert!(repo.get_reset_token("dave@example.com").await.is_none());
    }
}
