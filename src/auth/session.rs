//! Session lifecycle: create, validate with sliding renewal, invalidate.
//!
//! A session document lives at `sessions/<id>` where `id` is the SHA-256 of
//! the cookie token. Lifetime is 30 days; validations landing in the final
//! 15 days extend the expiry by a fresh 30 days, so active users never
//! re-authenticate while a stolen-but-unused token dies within a month.

use crate::auth::tokens;
use crate::error::AppError;
use crate::store::{DocumentStore, User, UserRepo};
use actix_web::cookie::time::{Duration as CookieDuration, OffsetDateTime};
use actix_web::cookie::{Cookie, SameSite};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, error};

pub const SESSION_COOKIE: &str = "session";

const SESSION_LIFETIME_DAYS: i64 = 30;
const RENEWAL_WINDOW_DAYS: i64 = 15;

#[derive(Debug, Clone, Serialize)]
pub struct Session {
    pub id: String,
    pub user_id: String,
    pub expires_at: DateTime<Utc>,
    pub two_factor_verified: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct SessionFlags {
    pub two_factor_verified: bool,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SessionDoc {
    user_id: String,
    /// Epoch seconds in the persisted form.
    expires_at: i64,
    two_factor_verified: bool,
}

fn session_path(id: &str) -> String {
    format!("sessions/{}", id)
}

pub struct SessionStore {
    store: Arc<dyn DocumentStore>,
    users: Arc<UserRepo>,
}

impl SessionStore {
    pub fn new(store: Arc<dyn DocumentStore>, users: Arc<UserRepo>) -> Self {
        Self { store, users }
    }

    pub async fn create_session(
        &self,
        token: &str,
        user_id: &str,
        flags: SessionFlags,
    ) -> Result<Session, AppError> {
        let id = tokens::hash_token(token);
        let expires_at = Utc::now() + Duration::days(SESSION_LIFETIME_DAYS);
        let doc = SessionDoc {
            user_id: user_id.to_string(),
            expires_at: expires_at.timestamp(),
            two_factor_verified: flags.two_factor_verified,
        };
        let value = serde_json::to_value(&doc)
            .map_err(|e| AppError::Internal(format!("session doc: {}", e)))?;
        self.store.set(&session_path(&id), value).await?;
        Ok(Session {
            id,
            user_id: user_id.to_string(),
            expires_at,
            two_factor_verified: flags.two_factor_verified,
        })
    }

    /// Fails closed: absent record, expired record, missing user and store
    /// errors all come back as `None`. Expired records are deleted on
    /// detection. A validation inside the renewal window persists the new
    /// expiry before returning.
    pub async fn validate_session_token(&self, token: &str) -> Option<(Session, User)> {
        let id = tokens::hash_token(token);
        let path = session_path(&id);

        let value = match self.store.get(&path).await {
            Ok(Some(value)) => value,
            Ok(None) => {
                debug!("session not found");
                return None;
            }
            Err(e) => {
                error!("session lookup failed: {}", e);
                return None;
            }
        };
        let mut doc: SessionDoc = match serde_json::from_value(value) {
            Ok(doc) => doc,
            Err(e) => {
                error!("malformed session document at {}: {}", path, e);
                return None;
            }
        };

        let now = Utc::now();
        let expires_at = DateTime::from_timestamp(doc.expires_at, 0)?;
        if now >= expires_at {
            debug!("session expired");
            if let Err(e) = self.store.remove(&path).await {
                error!("failed to purge expired session: {}", e);
            }
            return None;
        }

        if now >= expires_at - Duration::days(RENEWAL_WINDOW_DAYS) {
            let renewed = now + Duration::days(SESSION_LIFETIME_DAYS);
            if let Err(e) = self
                .store
                .update(&path, json!({ "expiresAt": renewed.timestamp() }))
                .await
            {
                error!("session renewal failed: {}", e);
                return None;
            }
            doc.expires_at = renewed.timestamp();
        }

        let user = self.users.get_user(&doc.user_id).await?;

        let session = Session {
            id,
            user_id: doc.user_id,
            expires_at: DateTime::from_timestamp(doc.expires_at, 0)?,
            two_factor_verified: doc.two_factor_verified,
        };
        Some((session, user))
    }

    /// Idempotent: an already-absent session is not an error.
    pub async fn invalidate_session(&self, id: &str) -> Result<(), AppError> {
        self.store.remove(&session_path(id)).await?;
        Ok(())
    }

    /// Caller must have just validated the session; expiry is not re-checked.
    pub async fn set_session_as_2fa_verified(&self, id: &str) -> Result<(), AppError> {
        self.store
            .update(&session_path(id), json!({ "twoFactorVerified": true }))
            .await?;
        Ok(())
    }
}

/// HTTP-only, same-site-lax cookie carrying the raw session token, expiring
/// with the session.
pub fn session_cookie(token: &str, expires_at: DateTime<Utc>, secure: bool) -> Cookie<'static> {
    let mut cookie = Cookie::new(SESSION_COOKIE, token.to_string());
    cookie.set_http_only(true);
    cookie.set_same_site(SameSite::Lax);
    cookie.set_path("/");
    cookie.set_secure(secure);
    if let Ok(expires) = OffsetDateTime::from_unix_timestamp(expires_at.timestamp()) {
        cookie.set_expires(expires);
    }
    cookie
}

/// Empty value, immediate expiry.
pub fn clear_session_cookie(secure: bool) -> Cookie<'static> {
    let mut cookie = Cookie::new(SESSION_COOKIE, "");
    cookie.set_http_only(true);
    cookie.set_same_site(SameSite::Lax);
    cookie.set_path("/");
    cookie.set_secure(secure);
    cookie.set_max_age(CookieDuration::ZERO);
    cookie
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_cookie_attributes() {
        let expires = Utc::now() + Duration::days(30);
        let cookie = session_cookie("tok", expires, false);
        assert_eq!(cookie.name(), SESSION_COOKIE);
        assert_eq!(cookie.value(), "tok");
        assert_eq!(cookie.http_only(), Some(true));
        assert_eq!(cookie.same_site(), Some(SameSite::Lax));
        assert_eq!(cookie.path(), Some("/"));
        assert!(cookie.expires().is_some());
    }

    #[test]
    fn test_clear_cookie_expires_immediately() {
        let cookie = clear_session_cookie(false);
        assert_eq!(cookie.value(), "");
        assert_eq!(cookie.max_age(), Some(CookieDuration::ZERO));
    }
}
