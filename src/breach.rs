//! Compromised-password lookup via the k-anonymity range API.
//!
//! Only the first five hex characters of the SHA-1 digest leave the process;
//! the response is the list of digest suffixes sharing that prefix.

use crate::error::AppError;
use sha1::{Digest, Sha1};

pub struct BreachClient {
    http: reqwest::Client,
    base_url: String,
}

impl BreachClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into(),
        }
    }

    /// True when the password appears in the breach corpus. Network failures
    /// propagate; the caller decides whether to fail the submission.
    pub async fn is_breached(&self, password: &str) -> Result<bool, AppError> {
        let digest = hex::encode(Sha1::digest(password.as_bytes()));
        let (prefix, suffix) = digest.split_at(5);

        let body = self
            .http
            .get(format!("{}/{}", self.base_url.trim_end_matches('/'), prefix))
            .send()
            .await?
            .error_for_status()?
            .text()
            .await?;

        Ok(body.lines().any(|line| {
            line.split(':')
                .next()
                .is_some_and(|candidate| candidate.trim().eq_ignore_ascii_case(suffix))
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path_regex};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn suffix_of(password: &str) -> String {
        let digest = hex::encode(Sha1::digest(password.as_bytes()));
        digest[5..].to_uppercase()
    }

    #[tokio::test]
    async fn test_detects_breached_password() {
        let server = MockServer::start().await;
        let body = format!("AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA:3\n{}:42\n", suffix_of("password123"));
        Mock::given(method("GET"))
            .and(path_regex(r"^/[0-9a-fA-F]{5}$"))
            .respond_with(ResponseTemplate::new(200).set_body_string(body))
            .mount(&server)
            .await;

        let client = BreachClient::new(server.uri());
        assert!(client.is_breached("password123").await.unwrap());
    }

    #[tokio::test]
    async fn test_clean_password_passes() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path_regex(r"^/[0-9a-fA-F]{5}$"))
            .respond_with(ResponseTemplate::new(200).set_body_string("AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA:3\n"))
            .mount(&server)
            .await;

        let client = BreachClient::new(server.uri());
        assert!(!client.is_breached("zx9!unique!correct").await.unwrap());
    }

    #[tokio::test]
    async fn test_upstream_failure_propagates() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path_regex(r"^/[0-9a-fA-F]{5}$"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let client = BreachClient::new(server.uri());
        assert!(client.is_breached("whatever-password").await.is_err());
    }
}
