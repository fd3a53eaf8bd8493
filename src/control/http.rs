//! HTTP utilities for control-plane calls

use super::wire::ApiResponse;
use crate::error::{ConfigError, ControlPlaneError};
use anyhow::{Context, Result};
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::time::Duration;
use url::Url;

/// Maximum length of response body to log (to avoid logging sensitive data)
const MAX_LOG_BODY_LENGTH: usize = 200;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// Sanitize response body for logging
/// Truncates long responses and strips non-printable characters
fn sanitize_for_log(body: &str) -> String {
    let truncated = if body.len() > MAX_LOG_BODY_LENGTH {
        let cut = (0..=MAX_LOG_BODY_LENGTH)
            .rev()
            .find(|i| body.is_char_boundary(*i))
            .unwrap_or(0);
        format!("{}... [truncated, {} bytes total]", &body[..cut], body.len())
    } else {
        body.to_string()
    };

    truncated.replace(|c: char| !c.is_ascii_graphic() && c != ' ', "")
}

/// Token header attached to a request
#[derive(Debug, Clone, Copy)]
pub enum TokenHeader<'a> {
    /// One-time token used only for registration
    Once(&'a str),
    /// Session token returned by registration
    Persistent(&'a str),
    None,
}

impl TokenHeader<'_> {
    fn apply(self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match self {
            Self::Once(token) => request.header("ONCETOKEN", token),
            Self::Persistent(token) => request.header("PERSISTENTTOKEN", token),
            Self::None => request,
        }
    }
}

/// HTTP client wrapper for control-plane calls
#[derive(Clone)]
pub struct ControlPlaneHttp {
    client: Client,
    base: Url,
}

impl ControlPlaneHttp {
    /// Create a new HTTP client against `server_url`
    pub fn new(server_url: &str) -> Result<Self> {
        let base = Url::parse(server_url)
            .map_err(|_| ConfigError::InvalidServerUrl(server_url.to_string()))?;

        let client = Client::builder()
            .user_agent(concat!("cloudrec-agent/", env!("CARGO_PKG_VERSION")))
            .timeout(REQUEST_TIMEOUT)
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self { client, base })
    }

    pub fn base_url(&self) -> &Url {
        &self.base
    }

    fn endpoint(&self, path: &str) -> Result<Url> {
        self.base
            .join(path)
            .with_context(|| format!("Invalid endpoint path {}", path))
    }

    /// POST a JSON body and decode the response envelope
    ///
    /// Non-2xx statuses map to [`ControlPlaneError::Status`]; envelopes with
    /// a non-success code map to [`ControlPlaneError::Rejected`].
    pub async fn post<B, T>(&self, path: &str, token: TokenHeader<'_>, body: &B) -> Result<Option<T>>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let url = self.endpoint(path)?;
        tracing::debug!("POST {}", url);

        let request = token.apply(self.client.post(url).json(body));
        let response = request.send().await.context("Failed to send request")?;

        let status = response.status();
        let text = response
            .text()
            .await
            .context("Failed to read response body")?;

        if !status.is_success() {
            // Security: Only log sanitized/truncated error body to avoid leaking sensitive data
            tracing::error!("Control plane error: {} - {}", status, sanitize_for_log(&text));
            return Err(ControlPlaneError::Status(status.as_u16()).into());
        }

        // Handle empty response
        if text.trim().is_empty() {
            return Ok(None);
        }

        let envelope: ApiResponse<T> =
            serde_json::from_str(&text).context("Failed to parse response JSON")?;
        if !envelope.is_success() {
            return Err(ControlPlaneError::Rejected {
                code: envelope.code,
                msg: envelope.msg.unwrap_or_else(|| "unknown error".to_string()),
            }
            .into());
        }

        Ok(envelope.content)
    }
}

/// Format a control-plane error for operator-facing logs
pub fn format_control_plane_error(error: &anyhow::Error) -> String {
    if let Some(err) = error.downcast_ref::<ControlPlaneError>() {
        return match err {
            ControlPlaneError::Status(401) | ControlPlaneError::Status(403) => {
                "Authentication failed. Check the access token.".to_string()
            }
            ControlPlaneError::Status(404) => {
                "Endpoint not found. Check the server url.".to_string()
            }
            ControlPlaneError::Status(code) if *code >= 500 => {
                "Control plane temporarily unavailable.".to_string()
            }
            other => other.to_string(),
        };
    }

    // Truncate long error messages and remove potential sensitive data
    let error_str = format!("{:#}", error);
    let sanitized = error_str
        .chars()
        .filter(|c| c.is_ascii_graphic() || *c == ' ')
        .take(120)
        .collect::<String>();

    if sanitized.len() < error_str.len() {
        format!("{}...", sanitized)
    } else {
        sanitized
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_truncates() {
        let body = "x".repeat(500);
        let out = sanitize_for_log(&body);
        assert!(out.starts_with(&"x".repeat(200)));
        assert!(out.contains("500 bytes total"));
    }

    #[test]
    fn test_sanitize_strips_control_chars() {
        assert_eq!(sanitize_for_log("a\nb\tc d"), "abc d");
    }

    #[test]
    fn test_endpoint_join() {
        let http = ControlPlaneHttp::new("http://localhost:8080").unwrap();
        assert_eq!(
            http.endpoint("/api/agent/registry").unwrap().as_str(),
            "http://localhost:8080/api/agent/registry"
        );
    }

    #[test]
    fn test_invalid_server_url() {
        assert!(ControlPlaneHttp::new("not a url").is_err());
    }

    #[test]
    fn test_format_status_errors() {
        let err: anyhow::Error = ControlPlaneError::Status(401).into();
        assert!(format_control_plane_error(&err).contains("Authentication failed"));

        let err: anyhow::Error = ControlPlaneError::Status(503).into();
        assert!(format_control_plane_error(&err).contains("unavailable"));

        let err = anyhow::anyhow!("connection refused");
        assert_eq!(format_control_plane_error(&err), "connection refused");
    }
}
