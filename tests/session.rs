//! Session lifecycle against the in-memory document store.

use chrono::{Duration, Utc};
use gatehouse_server::auth::session::{SessionFlags, SessionStore};
use gatehouse_server::auth::tokens;
use gatehouse_server::auth::totp::TotpCipher;
use gatehouse_server::store::{DocumentStore, MemoryStore, NewUser, UserRepo};
use serde_json::json;
use std::sync::Arc;

struct Fixture {
    store: Arc<MemoryStore>,
    users: Arc<UserRepo>,
    sessions: SessionStore,
}

fn fixture() -> Fixture {
    let store = Arc::new(MemoryStore::new());
    let cipher = Arc::new(TotpCipher::from_hex(&"22".repeat(32)).unwrap());
    let users = Arc::new(UserRepo::new(store.clone() as Arc<dyn DocumentStore>, cipher));
    let sessions = SessionStore::new(store.clone() as Arc<dyn DocumentStore>, users.clone());
    Fixture {
        store,
        users,
        sessions,
    }
}

async fn seed_user(fx: &Fixture, email: &str) -> String {
    fx.users
        .create_user(NewUser {
            email: email.to_string(),
            username: "Test User".to_string(),
            password_hash: "$argon2id$fake".to_string(),
            reset_token_hash: "unused".to_string(),
            reset_token_expires_at: Utc::now() + Duration::hours(1),
        })
        .await
        .unwrap()
        .id
}

#[tokio::test]
async fn test_create_then_validate() {
    let fx = fixture();
    let user_id = seed_user(&fx, "a@example.com").await;

    let token = tokens::generate_session_token();
    let created = fx
        .sessions
        .create_session(
            &token,
            &user_id,
            SessionFlags {
                two_factor_verified: false,
            },
        )
        .await
        .unwrap();

    // store holds the hash, never the raw token
    assert_eq!(created.id, tokens::hash_token(&token));
    assert!(!fx
        .store
        .exists(&format!("sessions/{}", token))
        .await
        .unwrap());

    let (session, user) = fx.sessions.validate_session_token(&token).await.unwrap();
    assert_eq!(session.id, created.id);
    assert_eq!(session.user_id, user_id);
    assert_eq!(user.email, "a@example.com");
    assert!(!session.two_factor_verified);

    // roughly 30 days out
    let remaining = session.expires_at - Utc::now();
    assert!(remaining > Duration::days(29) && remaining <= Duration::days(30));
}

#[tokio::test]
async fn test_validation_outside_renewal_window_leaves_expiry() {
    let fx = fixture();
    let user_id = seed_user(&fx, "b@example.com").await;

    let token = tokens::generate_session_token();
    let id = tokens::hash_token(&token);
    let expires_at = (Utc::now() + Duration::days(20)).timestamp();
    fx.store
        .set(
            &format!("sessions/{}", id),
            json!({ "userId": user_id, "expiresAt": expires_at, "twoFactorVerified": false }),
        )
        .await
        .unwrap();

    let (session, _) = fx.sessions.validate_session_token(&token).await.unwrap();
    assert_eq!(session.expires_at.timestamp(), expires_at);

    let doc = fx.store.get(&format!("sessions/{}", id)).await.unwrap().unwrap();
    assert_eq!(doc["expiresAt"], expires_at);
}

#[tokio::test]
async fn test_validation_inside_renewal_window_extends_expiry() {
    let fx = fixture();
    let user_id = seed_user(&fx, "c@example.com").await;

    let token = tokens::generate_session_token();
    let id = tokens::hash_token(&token);
    let old_expiry = (Utc::now() + Duration::days(10)).timestamp();
    fx.store
        .set(
            &format!("sessions/{}", id),
            json!({ "userId": user_id, "expiresAt": old_expiry, "twoFactorVerified": true }),
        )
        .await
        .unwrap();

    let (session, _) = fx.sessions.validate_session_token(&token).await.unwrap();
    let remaining = session.expires_at - Utc::now();
    assert!(remaining > Duration::days(29));

    // the renewal is persisted, not just returned
    let doc = fx.store.get(&format!("sessions/{}", id)).await.unwrap().unwrap();
    assert_eq!(doc["expiresAt"], session.expires_at.timestamp());
    assert!(doc["expiresAt"].as_i64().unwrap() > old_expiry);
}

#[tokio::test]
async fn test_expired_session_validates_as_absent_and_is_purged() {
    let fx = fixture();
    let user_id = seed_user(&fx, "d@example.com").await;

    let token = tokens::generate_session_token();
    let id = tokens::hash_token(&token);
    let path = format!("sessions/{}", id);
    fx.store
        .set(
            &path,
            json!({
                "userId": user_id,
                "expiresAt": (Utc::now() - Duration::seconds(5)).timestamp(),
                "twoFactorVerified": false
            }),
        )
        .await
        .unwrap();

    assert!(fx.sessions.validate_session_token(&token).await.is_none());
    assert!(!fx.store.exists(&path).await.unwrap());
}

#[tokio::test]
async fn test_unknown_token_and_missing_user_fail_closed() {
    let fx = fixture();

    assert!(fx
        .sessions
        .validate_session_token("never-issued")
        .await
        .is_none());

    // session pointing at a user the store no longer has
    let token = tokens::generate_session_token();
    let id = tokens::hash_token(&token);
    fx.store
        .set(
            &format!("sessions/{}", id),
            json!({
                "userId": "ghost",
                "expiresAt": (Utc::now() + Duration::days(30)).timestamp(),
                "twoFactorVerified": false
            }),
        )
        .await
        .unwrap();
    assert!(fx.sessions.validate_session_token(&token).await.is_none());
}

#[tokio::test]
async fn test_invalidate_is_idempotent() {
    let fx = fixture();
    let user_id = seed_user(&fx, "e@example.com").await;

    let token = tokens::generate_session_token();
    let session = fx
        .sessions
        .create_session(
            &token,
            &user_id,
            SessionFlags {
                two_factor_verified: false,
            },
        )
        .await
        .unwrap();

    fx.sessions.invalidate_session(&session.id).await.unwrap();
    assert!(fx.sessions.validate_session_token(&token).await.is_none());
    // second delete of an absent record is not an error
    fx.sessions.invalidate_session(&session.id).await.unwrap();
}

#[tokio::test]
async fn test_mark_2fa_verified() {
    let fx = fixture();
    let user_id = seed_user(&fx, "f@example.com").await;

    let token = tokens::generate_session_token();
    let session = fx
        .sessions
        .create_session(
            &token,
            &user_id,
            SessionFlags {
                two_factor_verified: false,
            },
        )
        .await
        .unwrap();

    fx.sessions
        .set_session_as_2fa_verified(&session.id)
        .await
        .unwrap();

    let (validated, _) = fx.sessions.validate_session_token(&token).await.unwrap();
    assert!(validated.two_factor_verified);
}
