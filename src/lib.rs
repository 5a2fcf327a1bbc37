pub mod auth;
pub mod breach;
pub mod config;
pub mod email;
pub mod error;
pub mod store;

use std::sync::Arc;

use actix_web::{web, HttpResponse};

pub use auth::{AuthContext, RefillingTokenBucket, SessionStore, Throttler};
pub use breach::BreachClient;
pub use config::Settings;
pub use email::Mailer;
pub use error::AppError;
pub use store::{DocumentStore, UserRepo};

pub type Result<T> = std::result::Result<T, AppError>;

/// Health check endpoint handler
/// Returns a JSON response with server status and timestamp
pub async fn health_check() -> HttpResponse {
    HttpResponse::Ok().json(serde_json::json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339()
    }))
}

/// Application state shared across all components
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Settings>,
    pub sessions: Arc<SessionStore>,
    pub users: Arc<UserRepo>,
    pub mailer: Arc<dyn Mailer>,
    pub breach: Arc<BreachClient>,
    /// Gate bucket applied to every inbound request, keyed by client IP.
    pub request_bucket: Arc<RefillingTokenBucket<String>>,
    /// Tighter per-IP bucket consulted by the login action.
    pub login_ip_bucket: Arc<RefillingTokenBucket<String>>,
    /// Per-user exponential backoff for credential checks.
    pub login_throttler: Arc<Throttler<String>>,
    /// Per-user bucket for TOTP key updates and challenges.
    pub totp_bucket: Arc<RefillingTokenBucket<String>>,
}

impl AppState {
    pub fn new(
        config: Settings,
        store: Arc<dyn DocumentStore>,
        mailer: Arc<dyn Mailer>,
    ) -> Result<Self> {
        let cipher = Arc::new(auth::totp::TotpCipher::from_hex(
            &config.auth.totp_cipher_key,
        )?);
        let users = Arc::new(UserRepo::new(Arc::clone(&store), cipher));
        let sessions = Arc::new(SessionStore::new(Arc::clone(&store), Arc::clone(&users)));
        let rl = &config.rate_limit;

        Ok(Self {
            sessions,
            users,
            mailer,
            breach: Arc::new(BreachClient::new(config.breach.base_url.clone())),
            request_bucket: Arc::new(RefillingTokenBucket::new(
                rl.ip_capacity,
                rl.ip_refill_seconds,
            )),
            login_ip_bucket: Arc::new(RefillingTokenBucket::new(
                rl.login_ip_capacity,
                rl.login_ip_refill_seconds,
            )),
            login_throttler: Arc::new(Throttler::new(rl.login_delays.clone())),
            totp_bucket: Arc::new(RefillingTokenBucket::new(
                rl.totp_capacity,
                rl.totp_refill_seconds,
            )),
            config: Arc::new(config),
        })
    }

    /// Evicts idle limiter entries; driven by a periodic task in `main`.
    pub async fn sweep_limiters(&self) {
        let max_idle = chrono::Duration::seconds(self.config.rate_limit.sweep_idle_seconds as i64);
        self.request_bucket.sweep(max_idle).await;
        self.login_ip_bucket.sweep(max_idle).await;
        self.login_throttler.sweep(max_idle).await;
        self.totp_bucket.sweep(max_idle).await;
    }
}

/// Route table, shared by `main` and the integration tests.
pub fn routes(cfg: &mut web::ServiceConfig) {
    cfg.route("/health", web::get().to(health_check))
        .route("/", web::get().to(auth::handlers::home))
        .route("/login", web::get().to(auth::handlers::login_page))
        .route("/login", web::post().to(auth::handlers::login))
        .route("/logout", web::post().to(auth::handlers::logout))
        .route("/2fa", web::get().to(auth::handlers::two_factor_page))
        .route("/2fa", web::post().to(auth::handlers::two_factor_verify))
        .route("/2fa/setup", web::get().to(auth::handlers::two_factor_setup_page))
        .route("/2fa/setup", web::post().to(auth::handlers::two_factor_setup))
        .route("/set-password", web::get().to(auth::handlers::set_password_page))
        .route("/set-password", web::post().to(auth::handlers::set_password))
        .route("/users", web::post().to(auth::handlers::create_user));
}
