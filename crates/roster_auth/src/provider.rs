//! The token-refresh call to the resource provider.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde::Deserialize;
use tracing::debug;

use crate::models::Credential;

/// Why a refresh call failed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("token refresh failed (status {status:?}, code {code:?}): {message}")]
pub struct RefreshError {
    /// HTTP status, if the provider answered at all.
    pub status: Option<u16>,
    /// OAuth `error` field from the response body.
    pub code: Option<String>,
    pub message: String,
}

impl RefreshError {
    /// A failure that never reached the provider or had no parseable answer.
    pub fn transport(message: impl Into<String>) -> Self {
        Self {
            status: None,
            code: None,
            message: message.into(),
        }
    }

    /// The refresh token has been permanently revoked.
    ///
    /// Everything else (network, rate limits, 5xx) is transient.
    pub fn is_revocation(&self) -> bool {
        self.status == Some(401) || self.code.as_deref() == Some("invalid_grant")
    }
}

/// Exchanges a refresh token for a new credential.
#[async_trait]
pub trait OAuthProvider: Send + Sync {
    async fn refresh(&self, refresh_token: &str) -> Result<Credential, RefreshError>;
}

/// OAuth client settings for [`HttpOAuthProvider`].
#[derive(Clone)]
pub struct OAuthClientConfig {
    pub token_url: String,
    pub client_id: String,
    pub client_secret: Option<String>,
}

impl std::fmt::Debug for OAuthClientConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OAuthClientConfig")
            .field("token_url", &self.token_url)
            .field("client_id", &self.client_id)
            .field("client_secret", &self.client_secret.as_ref().map(|_| "[REDACTED]"))
            .finish()
    }
}

/// Refresh over HTTP with a `grant_type=refresh_token` form post.
#[derive(Debug, Clone)]
pub struct HttpOAuthProvider {
    client: reqwest::Client,
    config: OAuthClientConfig,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_at: Option<i64>,
    #[serde(default)]
    expires_in: Option<i64>,
    #[serde(default)]
    token_type: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ErrorResponse {
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    error_description: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

impl HttpOAuthProvider {
    pub fn new(config: OAuthClientConfig) -> Result<Self, RefreshError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| RefreshError::transport(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { client, config })
    }
}

#[async_trait]
impl OAuthProvider for HttpOAuthProvider {
    async fn refresh(&self, refresh_token: &str) -> Result<Credential, RefreshError> {
        let mut form = vec![
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
            ("client_id", self.config.client_id.as_str()),
        ];
        if let Some(secret) = self.config.client_secret.as_deref() {
            form.push(("client_secret", secret));
        }

        debug!("Posting refresh request to {}", self.config.token_url);
        let response = self
            .client
            .post(&self.config.token_url)
            .form(&form)
            .send()
            .await
            .map_err(|e| RefreshError::transport(e.to_string()))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| RefreshError::transport(e.to_string()))?;

        if !status.is_success() {
            return Err(map_refresh_error(status.as_u16(), &body));
        }

        let parsed: TokenResponse = serde_json::from_str(&body).map_err(|e| RefreshError {
            status: Some(status.as_u16()),
            code: None,
            message: format!("unparsable token response: {e}"),
        })?;
        Ok(parsed.into_credential(Utc::now().timestamp()))
    }
}

impl TokenResponse {
    fn into_credential(self, now: i64) -> Credential {
        Credential {
            access_token: self.access_token,
            refresh_token: self.refresh_token,
            expires_at: self
                .expires_at
                .or_else(|| self.expires_in.map(|secs| now + secs)),
            token_type: self.token_type.unwrap_or_else(|| "Bearer".to_string()),
        }
    }
}

fn map_refresh_error(status: u16, body: &str) -> RefreshError {
    let parsed: ErrorResponse = serde_json::from_str(body).unwrap_or_default();
    let message = parsed
        .error_description
        .or(parsed.message)
        .unwrap_or_else(|| body.chars().take(200).collect());
    RefreshError {
        status: Some(status),
        code: parsed.error,
        message,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_revocation_classification() {
        let unauthorized = map_refresh_error(401, "Unauthorized");
        assert!(unauthorized.is_revocation());
        assert!(unauthorized.code.is_none());

        let invalid_grant = map_refresh_error(
            400,
            r#"{"error":"invalid_grant","error_description":"Refresh token revoked"}"#,
        );
        assert!(invalid_grant.is_revocation());
        assert_eq!(invalid_grant.message, "Refresh token revoked");

        assert!(!map_refresh_error(429, r#"{"message":"Rate Limit Exceeded"}"#).is_revocation());
        assert!(!map_refresh_error(503, "").is_revocation());
        assert!(!map_refresh_error(400, r#"{"error":"invalid_request"}"#).is_revocation());
        assert!(!RefreshError::transport("connection reset").is_revocation());
    }

    #[test]
    fn test_token_response_expires_in() {
        let response: TokenResponse = serde_json::from_str(
            r#"{"access_token":"a2","refresh_token":"r2","expires_in":21600,"token_type":"Bearer"}"#,
        )
        .unwrap();
        let credential = response.into_credential(1_000);
        assert_eq!(credential.access_token, "a2");
        assert_eq!(credential.refresh_token.as_deref(), Some("r2"));
        assert_eq!(credential.expires_at, Some(22_600));
    }

    #[test]
    fn test_token_response_prefers_expires_at() {
        let response: TokenResponse = serde_json::from_str(
            r#"{"access_token":"a2","expires_at":5000,"expires_in":10}"#,
        )
        .unwrap();
        let credential = response.into_credential(1_000);
        assert_eq!(credential.expires_at, Some(5_000));
        assert!(credential.refresh_token.is_none());
        assert_eq!(credential.token_type, "Bearer");
    }

    #[test]
    fn test_client_config_debug_redacts_secret() {
        let config = OAuthClientConfig {
            token_url: "https://provider.example/oauth/token".to_string(),
            client_id: "client".to_string(),
            client_secret: Some("hunter2".to_string()),
        };
        let debug = format!("{config:?}");
        assert!(!debug.contains("hunter2"));
    }
}
