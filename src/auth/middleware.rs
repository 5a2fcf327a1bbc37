//! The per-request gate, applied to every inbound request as two stages:
//! rate limiting first (cheap, blocks unauthenticated enumeration before any
//! store work), then session resolution.

use crate::auth::session::{clear_session_cookie, session_cookie, Session, SESSION_COOKIE};
use crate::store::User;
use crate::AppState;
use actix_web::body::{EitherBody, MessageBody};
use actix_web::dev::{ServiceRequest, ServiceResponse};
use actix_web::http::header::{self, HeaderMap};
use actix_web::http::Method;
use actix_web::middleware::Next;
use actix_web::{web, HttpMessage, HttpResponse};
use tracing::{error, warn};

/// Resolved identity attached to every request after the session stage.
#[derive(Clone, Default)]
pub struct AuthContext {
    pub session: Option<Session>,
    pub user: Option<User>,
}

/// First address in `X-Forwarded-For`, if the upstream proxy supplied one.
pub fn client_ip(headers: &HeaderMap) -> Option<String> {
    headers
        .get("X-Forwarded-For")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn request_cost(method: &Method) -> u32 {
    // Side-effect-free methods are cheap; mutations weigh triple.
    match *method {
        Method::GET | Method::HEAD | Method::OPTIONS => 1,
        _ => 3,
    }
}

/// Routes reachable without a session: login, the password-reset entry point
/// and the health probe.
fn is_public_path(path: &str) -> bool {
    matches!(path, "/login" | "/set-password" | "/health")
}

/// Stage 1: per-IP token bucket, cost-weighted by HTTP verb. Requests with
/// no forwarded IP pass unlimited; blocking all traffic behind a
/// misconfigured proxy would be worse, so the gap is logged instead.
pub async fn rate_limit_gate(
    req: ServiceRequest,
    next: Next<impl MessageBody + 'static>,
) -> Result<ServiceResponse<EitherBody<impl MessageBody + 'static>>, actix_web::Error> {
    let rejected = match req.app_data::<web::Data<AppState>>() {
        Some(state) => match client_ip(req.headers()) {
            Some(ip) => {
                let cost = request_cost(req.method());
                !state.request_bucket.consume(&ip, cost).await
            }
            None => {
                warn!("no client IP on request; skipping rate limit");
                false
            }
        },
        None => false,
    };

    if rejected {
        let res = HttpResponse::TooManyRequests().json(serde_json::json!({
            "error": { "status": 429, "message": "Too many requests" }
        }));
        return Ok(req.into_response(res).map_into_right_body());
    }
    next.call(req).await.map(|res| res.map_into_left_body())
}

/// Stage 2: resolve the session cookie. A valid session re-issues the cookie
/// (carrying any renewed expiry); an invalid one is cleared. Anonymous
/// requests to protected routes are redirected to the login page.
pub async fn session_gate(
    req: ServiceRequest,
    next: Next<impl MessageBody + 'static>,
) -> Result<ServiceResponse<EitherBody<impl MessageBody + 'static>>, actix_web::Error> {
    let state = req.app_data::<web::Data<AppState>>().cloned();
    let token = req.cookie(SESSION_COOKIE).map(|c| c.value().to_string());

    let mut reissue = None;
    let mut clear = false;

    match (&state, token) {
        (Some(state), Some(token)) => {
            match state.sessions.validate_session_token(&token).await {
                Some((session, user)) => {
                    reissue = Some(session_cookie(
                        &token,
                        session.expires_at,
                        state.config.auth.secure_cookies,
                    ));
                    req.extensions_mut().insert(AuthContext {
                        session: Some(session),
                        user: Some(user),
                    });
                }
                None => {
                    clear = true;
                    req.extensions_mut().insert(AuthContext::default());
                }
            }
        }
        (Some(_), None) => {
            req.extensions_mut().insert(AuthContext::default());
            if !is_public_path(req.path()) {
                let res = HttpResponse::Found()
                    .insert_header((header::LOCATION, "/login"))
                    .finish();
                return Ok(req.into_response(res).map_into_right_body());
            }
        }
        (None, _) => {
            req.extensions_mut().insert(AuthContext::default());
        }
    }

    let mut res = next.call(req).await?.map_into_left_body();
    let secure = state.map(|s| s.config.auth.secure_cookies).unwrap_or(false);
    if let Some(cookie) = reissue {
        if let Err(e) = res.response_mut().add_cookie(&cookie) {
            error!("failed to re-issue session cookie: {}", e);
        }
    }
    if clear {
        if let Err(e) = res.response_mut().add_cookie(&clear_session_cookie(secure)) {
            error!("failed to clear session cookie: {}", e);
        }
    }
    Ok(res)
}
