//! Login, logout, two-factor and password-reset flows.

use crate::auth::middleware::{client_ip, AuthContext};
use crate::auth::session::{clear_session_cookie, session_cookie, Session, SessionFlags};
use crate::auth::{password, tokens, totp};
use crate::error::AppError;
use crate::store::{NewUser, User};
use crate::AppState;
use actix_web::http::header;
use actix_web::{web, HttpRequest, HttpResponse};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{Duration, Utc};
use serde::Deserialize;
use serde_json::json;
use tracing::{error, info};

const INVALID_CREDENTIALS: &str = "Invalid email or password";

fn verify_email_input(email: &str) -> bool {
    if email.len() >= 256 {
        return false;
    }
    let Some((local, domain)) = email.split_once('@') else {
        return false;
    };
    !local.is_empty()
        && domain
            .find('.')
            .is_some_and(|i| i > 0 && i < domain.len() - 1)
}

fn verify_username_input(username: &str) -> bool {
    username.len() > 3 && username.len() < 32 && username.trim() == username
}

fn found(location: &str) -> HttpResponse {
    HttpResponse::Found()
        .insert_header((header::LOCATION, location))
        .finish()
}

fn require_auth(ctx: &AuthContext) -> Result<(&Session, &User), AppError> {
    match (&ctx.session, &ctx.user) {
        (Some(session), Some(user)) => Ok((session, user)),
        _ => Err(AppError::redirect("/login")),
    }
}

/// The protected landing page. Gates on 2FA state before granting access.
pub async fn home(ctx: web::ReqData<AuthContext>) -> Result<HttpResponse, AppError> {
    let (session, user) = require_auth(&ctx)?;
    if !user.registered_2fa {
        return Ok(found("/2fa/setup"));
    }
    if !session.two_factor_verified {
        return Ok(found("/2fa"));
    }
    Ok(HttpResponse::Ok().json(json!({ "user": user })))
}

pub async fn login_page(ctx: web::ReqData<AuthContext>) -> HttpResponse {
    if let (Some(session), Some(user)) = (&ctx.session, &ctx.user) {
        if !user.registered_2fa {
            return found("/2fa/setup");
        }
        if !session.two_factor_verified {
            return found("/2fa");
        }
        return found("/");
    }
    HttpResponse::Ok().json(json!({}))
}

#[derive(Debug, Deserialize)]
pub struct LoginForm {
    pub email: String,
    pub password: String,
}

/// Credential login. Limiter order matters: the IP bucket is checked before
/// any user lookup happens, the per-user throttler before the expensive
/// password verification.
pub async fn login(
    req: HttpRequest,
    form: web::Form<LoginForm>,
    state: web::Data<AppState>,
) -> Result<HttpResponse, AppError> {
    let ip = client_ip(req.headers());
    if let Some(ip) = &ip {
        if !state.login_ip_bucket.check(ip, 1).await {
            return Err(AppError::RateLimited);
        }
    }

    let form = form.into_inner();
    if form.email.is_empty() || form.password.is_empty() {
        return Err(AppError::validation("Please enter your email and password."));
    }
    if !verify_email_input(&form.email) {
        return Err(AppError::field("Invalid or missing fields", "email", "Invalid email"));
    }

    // Unknown account, missing hash and wrong password all surface the same
    // way; account existence must not be observable here.
    let Some(user) = state.users.get_user_from_email(&form.email).await else {
        return Err(AppError::validation(INVALID_CREDENTIALS));
    };

    if let Some(ip) = &ip {
        if !state.login_ip_bucket.consume(ip, 1).await {
            return Err(AppError::RateLimited);
        }
    }
    if !state.login_throttler.consume(&user.id).await {
        return Err(AppError::RateLimited);
    }

    let Some(hash) = state.users.get_password_hash(&form.email).await else {
        return Err(AppError::validation(INVALID_CREDENTIALS));
    };
    let submitted = form.password.clone();
    let valid = web::block(move || password::verify_password(&hash, &submitted)).await??;
    if !valid {
        return Err(AppError::validation(INVALID_CREDENTIALS));
    }

    state.login_throttler.reset(&user.id).await;
    info!("login successful for user {}", user.id);

    let token = tokens::generate_session_token();
    let session = state
        .sessions
        .create_session(
            &token,
            &user.id,
            SessionFlags {
                two_factor_verified: false,
            },
        )
        .await?;

    let location = if user.registered_2fa { "/2fa" } else { "/2fa/setup" };
    Ok(HttpResponse::Found()
        .cookie(session_cookie(
            &token,
            session.expires_at,
            state.config.auth.secure_cookies,
        ))
        .insert_header((header::LOCATION, location))
        .finish())
}

pub async fn logout(
    ctx: web::ReqData<AuthContext>,
    state: web::Data<AppState>,
) -> Result<HttpResponse, AppError> {
    if let Some(session) = &ctx.session {
        state.sessions.invalidate_session(&session.id).await?;
    }
    Ok(HttpResponse::Found()
        .cookie(clear_session_cookie(state.config.auth.secure_cookies))
        .insert_header((header::LOCATION, "/login"))
        .finish())
}

/// Provisions a fresh TOTP key for enrollment. The key only becomes the
/// user's credential once a valid code is submitted to the POST handler.
pub async fn two_factor_setup_page(
    ctx: web::ReqData<AuthContext>,
    state: web::Data<AppState>,
) -> Result<HttpResponse, AppError> {
    let (_, user) = require_auth(&ctx)?;
    let key = totp::generate_totp_key();
    let uri = totp::key_uri(&state.config.auth.totp_issuer, &user.username, &key)?;
    Ok(HttpResponse::Ok().json(json!({
        "key": BASE64.encode(key),
        "keyUri": uri,
    })))
}

#[derive(Debug, Deserialize)]
pub struct TwoFactorSetupForm {
    pub key: String,
    pub code: String,
}

pub async fn two_factor_setup(
    ctx: web::ReqData<AuthContext>,
    form: web::Form<TwoFactorSetupForm>,
    state: web::Data<AppState>,
) -> Result<HttpResponse, AppError> {
    let (session, user) = require_auth(&ctx)?;

    if form.code.is_empty() {
        return Err(AppError::field("Invalid or missing fields", "code", "Please enter your code"));
    }
    // 20 key bytes encode to exactly 28 base64 characters
    if form.key.len() != 28 {
        return Err(AppError::validation("Invalid key"));
    }
    let key = BASE64
        .decode(&form.key)
        .map_err(|_| AppError::validation("Invalid key"))?;
    if key.len() != totp::TOTP_KEY_BYTES {
        return Err(AppError::validation("Invalid key"));
    }

    if !state.totp_bucket.consume(&user.id, 1).await {
        return Err(AppError::RateLimited);
    }
    if !totp::verify_code(&key, &form.code) {
        return Err(AppError::validation("Invalid code"));
    }

    state.users.update_totp_key(&user.id, &key).await?;
    state
        .sessions
        .set_session_as_2fa_verified(&session.id)
        .await?;
    Ok(found("/"))
}

pub async fn two_factor_page(ctx: web::ReqData<AuthContext>) -> Result<HttpResponse, AppError> {
    let (session, user) = require_auth(&ctx)?;
    if !user.registered_2fa {
        return Ok(found("/2fa/setup"));
    }
    if session.two_factor_verified {
        return Ok(found("/"));
    }
    Ok(HttpResponse::Ok().json(json!({ "message": "Enter the code from your authenticator app" })))
}

#[derive(Debug, Deserialize)]
pub struct TwoFactorVerifyForm {
    pub code: String,
}

pub async fn two_factor_verify(
    ctx: web::ReqData<AuthContext>,
    form: web::Form<TwoFactorVerifyForm>,
    state: web::Data<AppState>,
) -> Result<HttpResponse, AppError> {
    let (session, user) = require_auth(&ctx)?;
    if !user.registered_2fa {
        return Ok(found("/2fa/setup"));
    }
    if form.code.is_empty() {
        return Err(AppError::field("Invalid or missing fields", "code", "Please enter your code"));
    }
    if !state.totp_bucket.consume(&user.id, 1).await {
        return Err(AppError::RateLimited);
    }

    let Some(key) = state.users.get_totp_key(&user.id).await else {
        return Err(AppError::validation("Invalid code"));
    };
    if !totp::verify_code(&key, &form.code) {
        return Err(AppError::validation("Invalid code"));
    }

    state
        .sessions
        .set_session_as_2fa_verified(&session.id)
        .await?;
    Ok(found("/"))
}

#[derive(Debug, Deserialize)]
pub struct SetPasswordQuery {
    pub email: Option<String>,
    pub token: Option<String>,
}

async fn validate_reset_token(
    state: &AppState,
    email: &str,
    token: &str,
) -> Result<(), AppError> {
    let Some(reset) = state.users.get_reset_token(email).await else {
        return Err(AppError::redirect("/login"));
    };
    if reset.token_hash != tokens::hash_token(token) || Utc::now() > reset.expires_at {
        return Err(AppError::redirect("/login"));
    }
    Ok(())
}

/// Entry point of the reset link. A live session on this browser is
/// invalidated; whoever holds the link is about to become the account owner.
pub async fn set_password_page(
    ctx: web::ReqData<AuthContext>,
    query: web::Query<SetPasswordQuery>,
    state: web::Data<AppState>,
) -> Result<HttpResponse, AppError> {
    let (Some(email), Some(token)) = (&query.email, &query.token) else {
        return Err(AppError::redirect("/login"));
    };
    validate_reset_token(&state, email, token).await?;

    let mut response = HttpResponse::Ok();
    if let Some(session) = &ctx.session {
        state.sessions.invalidate_session(&session.id).await?;
        response.cookie(clear_session_cookie(state.config.auth.secure_cookies));
    }
    Ok(response.json(json!({ "email": email })))
}

#[derive(Debug, Deserialize)]
pub struct SetPasswordForm {
    pub email: String,
    pub token: String,
    pub password: String,
}

pub async fn set_password(
    ctx: web::ReqData<AuthContext>,
    form: web::Form<SetPasswordForm>,
    state: web::Data<AppState>,
) -> Result<HttpResponse, AppError> {
    validate_reset_token(&state, &form.email, &form.token).await?;

    if form.password.is_empty() {
        return Err(AppError::field(
            "New password is required",
            "password",
            "New password is required",
        ));
    }
    if !password::acceptable_password_length(&form.password) {
        return Err(AppError::validation("Weak password"));
    }
    if state.breach.is_breached(&form.password).await? {
        return Err(AppError::validation("Weak password"));
    }

    let submitted = form.password.clone();
    let hash = web::block(move || password::hash_password(&submitted)).await??;
    state.users.update_password(&form.email, &hash).await?;
    state.users.clear_reset_token(&form.email).await?;

    let mut response = HttpResponse::Found();
    response.insert_header((header::LOCATION, "/login"));
    if let Some(session) = &ctx.session {
        state.sessions.invalidate_session(&session.id).await?;
        response.cookie(clear_session_cookie(state.config.auth.secure_cookies));
    }
    Ok(response.finish())
}

#[derive(Debug, Deserialize)]
pub struct CreateUserForm {
    pub email: String,
    pub username: String,
    pub password: String,
}

/// Provisioning: persists the user with a hashed password and mails a
/// one-hour set-password link. Email delivery failure is reported in the
/// logs but does not roll the user back.
pub async fn create_user(
    ctx: web::ReqData<AuthContext>,
    form: web::Form<CreateUserForm>,
    state: web::Data<AppState>,
) -> Result<HttpResponse, AppError> {
    let (session, user) = require_auth(&ctx)?;
    if !user.registered_2fa {
        return Ok(found("/2fa/setup"));
    }
    if !session.two_factor_verified {
        return Ok(found("/2fa"));
    }

    if !verify_email_input(&form.email) {
        return Err(AppError::field("Invalid or missing fields", "email", "Invalid email"));
    }
    if state.users.get_user_from_email(&form.email).await.is_some() {
        return Err(AppError::field("Invalid or missing fields", "email", "Email is already used"));
    }
    if !verify_username_input(&form.username) {
        return Err(AppError::field("Invalid or missing fields", "username", "Invalid username"));
    }
    if !password::acceptable_password_length(&form.password) {
        return Err(AppError::validation("Weak password"));
    }
    if state.breach.is_breached(&form.password).await? {
        return Err(AppError::validation("Weak password"));
    }

    let submitted = form.password.clone();
    let password_hash = web::block(move || password::hash_password(&submitted)).await??;
    let reset_token = tokens::generate_reset_token();

    let created = state
        .users
        .create_user(NewUser {
            email: form.email.clone(),
            username: form.username.clone(),
            password_hash,
            reset_token_hash: tokens::hash_token(&reset_token),
            reset_token_expires_at: Utc::now() + Duration::hours(1),
        })
        .await?;
    info!("created user {}", created.id);

    if let Err(e) = state
        .mailer
        .send_set_password_email(&created.email, &created.username, &reset_token)
        .await
    {
        error!("set-password email to {} failed: {}", created.email, e);
    }

    Ok(found("/users"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_email_validation() {
        assert!(verify_email_input("alice@example.com"));
        assert!(verify_email_input("a@b.c"));
        assert!(!verify_email_input("alice"));
        assert!(!verify_email_input("@example.com"));
        assert!(!verify_email_input("alice@example"));
        assert!(!verify_email_input("alice@.com"));
        assert!(!verify_email_input("alice@com."));
        assert!(!verify_email_input(&format!("{}@example.com", "x".repeat(256))));
    }

    #[test]
    fn test_username_validation() {
        assert!(verify_username_input("alice"));
        assert!(!verify_username_input("abc"));
        assert!(!verify_username_input(" alice "));
        assert!(!verify_username_input(&"x".repeat(32)));
    }
}
