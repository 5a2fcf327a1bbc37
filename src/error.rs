use actix_web::{http::header, http::StatusCode, HttpResponse, ResponseError};
use serde_json::json;
use std::collections::BTreeMap;
use thiserror::Error;
use tracing::error;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Too many requests")]
    RateLimited,

    #[error("Authentication required")]
    Unauthenticated { location: String },

    #[error("Validation error: {message}")]
    Validation {
        message: String,
        fields: BTreeMap<String, String>,
    },

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Upstream request failed: {0}")]
    Upstream(String),

    #[error("Email delivery failed: {0}")]
    Email(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal server error: {0}")]
    Internal(String),
}

impl AppError {
    pub fn validation(message: impl Into<String>) -> Self {
        AppError::Validation {
            message: message.into(),
            fields: BTreeMap::new(),
        }
    }

    pub fn field(message: impl Into<String>, field: &str, detail: impl Into<String>) -> Self {
        let mut fields = BTreeMap::new();
        fields.insert(field.to_string(), detail.into());
        AppError::Validation {
            message: message.into(),
            fields,
        }
    }

    pub fn redirect(location: impl Into<String>) -> Self {
        AppError::Unauthenticated {
            location: location.into(),
        }
    }
}

impl From<config::ConfigError> for AppError {
    fn from(err: config::ConfigError) -> Self {
        AppError::Config(err.to_string())
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        AppError::Internal(err.to_string())
    }
}

impl From<reqwest::Error> for AppError {
    fn from(err: reqwest::Error) -> Self {
        AppError::Upstream(err.to_string())
    }
}

impl From<actix_web::error::BlockingError> for AppError {
    fn from(err: actix_web::error::BlockingError) -> Self {
        AppError::Internal(err.to_string())
    }
}

impl ResponseError for AppError {
    fn status_code(&self) -> StatusCode {
        match self {
            AppError::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            AppError::Unauthenticated { .. } => StatusCode::FOUND,
            AppError::Validation { .. } => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse {
        match self {
            AppError::RateLimited => HttpResponse::TooManyRequests().json(json!({
                "error": { "status": 429, "message": "Too many requests" }
            })),
            AppError::Unauthenticated { location } => HttpResponse::Found()
                .insert_header((header::LOCATION, location.as_str()))
                .finish(),
            AppError::Validation { message, fields } => HttpResponse::BadRequest().json(json!({
                "error": { "status": 400, "message": message, "fields": fields }
            })),
            other => {
                // Detail stays in the logs; the caller gets a generic failure
                // so store outages are indistinguishable from lookup misses.
                error!("internal error: {}", other);
                HttpResponse::InternalServerError().json(json!({
                    "error": { "status": 500, "message": "Something went wrong" }
                }))
            }
        }
    }
}

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Query error: {0}")]
    Query(String),

    #[error("Malformed document at {path}: {detail}")]
    Malformed { path: String, detail: String },
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
                StoreError::Connection(err.to_string())
            }
            _ => StoreError::Query(err.to_string()),
        }
    }
}
