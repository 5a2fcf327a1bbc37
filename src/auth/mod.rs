//! Authentication core: token crypto, rate limiting, session lifecycle and
//! the request-level gate.

pub mod handlers;
pub mod middleware;
pub mod password;
pub mod rate_limit;
pub mod session;
pub mod tokens;
pub mod totp;

pub use middleware::AuthContext;
pub use rate_limit::{RefillingTokenBucket, Throttler};
pub use session::{Session, SessionFlags, SessionStore, SESSION_COOKIE};
