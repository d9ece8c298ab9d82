//! HTTP client for the remote long-term memory service.
//!
//! Three calls, each with its own bounded timeout: `GET /health` (3s),
//! `POST /archive` (10s), and the read-after-write verification
//! `GET /exchange/{id}` (5s). Failures carry an [`ErrorKind`] classification
//! that doubles as the dead-letter directory name.

use recall_common::RecoveryConfig;
use reqwest::StatusCode;
use serde_json::Value;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Failure classification for archive/verify attempts.
///
/// `as_str()` values are stable: they name the `failed/<error_type>/`
/// dead-letter directories and appear in analytics files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ErrorKind {
    NetworkTimeout,
    NetworkConnection,
    DataCorruption,
    VerificationFailure,
    BadRequest,
    AuthFailure,
    PermissionDenied,
    EndpointNotFound,
    PayloadTooLarge,
    RateLimited,
    ServerError,
    HttpError,
    UnknownError,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NetworkTimeout => "network_timeout",
            Self::NetworkConnection => "network_connection",
            Self::DataCorruption => "data_corruption",
            Self::VerificationFailure => "verification_failure",
            Self::BadRequest => "bad_request",
            Self::AuthFailure => "auth_failure",
            Self::PermissionDenied => "permission_denied",
            Self::EndpointNotFound => "endpoint_not_found",
            Self::PayloadTooLarge => "payload_too_large",
            Self::RateLimited => "rate_limited",
            Self::ServerError => "server_error",
            Self::HttpError => "http_error",
            Self::UnknownError => "unknown_error",
        }
    }

    /// Classify a non-200 archive response by status code.
    pub fn from_status(status: StatusCode) -> Self {
        match status.as_u16() {
            400 => Self::BadRequest,
            401 => Self::AuthFailure,
            403 => Self::PermissionDenied,
            404 => Self::EndpointNotFound,
            413 => Self::PayloadTooLarge,
            429 => Self::RateLimited,
            500..=599 => Self::ServerError,
            _ => Self::HttpError,
        }
    }

    /// Classify a reqwest transport error.
    pub fn from_transport(err: &reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::NetworkTimeout
        } else if err.is_connect() {
            Self::NetworkConnection
        } else {
            Self::UnknownError
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A classified failure talking to the memory service.
#[derive(Debug, Clone, Error)]
#[error("{kind}: {message}")]
pub struct ServiceError {
    pub kind: ErrorKind,
    pub message: String,
}

impl ServiceError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

/// Client for the remote memory service endpoints the daemon consumes.
#[derive(Debug, Clone)]
pub struct MemoryServiceClient {
    base_url: String,
    client: reqwest::Client,
    health_timeout: Duration,
    archive_timeout: Duration,
    verify_timeout: Duration,
}

impl MemoryServiceClient {
    pub fn new(config: &RecoveryConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder().build()?;
        Ok(Self {
            base_url: config.service_url.trim_end_matches('/').to_string(),
            client,
            health_timeout: config.health_timeout(),
            archive_timeout: config.archive_timeout(),
            verify_timeout: config.verify_timeout(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// `GET /health`: Ok when the service answers 200 within the timeout.
    pub async fn health(&self) -> Result<(), ServiceError> {
        let url = format!("{}/health", self.base_url);
        let resp = self
            .client
            .get(&url)
            .timeout(self.health_timeout)
            .send()
            .await
            .map_err(|e| ServiceError::new(ErrorKind::from_transport(&e), e.to_string()))?;

        if resp.status() == StatusCode::OK {
            Ok(())
        } else {
            Err(ServiceError::new(
                ErrorKind::from_status(resp.status()),
                format!("health check returned {}", resp.status()),
            ))
        }
    }

    /// `POST /archive` with the transformed exchange body.
    pub async fn archive(&self, body: &Value) -> Result<(), ServiceError> {
        let url = format!("{}/archive", self.base_url);
        let resp = self
            .client
            .post(&url)
            .json(body)
            .timeout(self.archive_timeout)
            .send()
            .await
            .map_err(|e| ServiceError::new(ErrorKind::from_transport(&e), e.to_string()))?;

        if resp.status() == StatusCode::OK {
            Ok(())
        } else {
            Err(ServiceError::new(
                ErrorKind::from_status(resp.status()),
                format!("archive returned {}", resp.status()),
            ))
        }
    }

    /// Read-after-write check: `GET /exchange/{id}` must answer 200.
    ///
    /// Any response other than 200 is a verification failure: the accept-ack
    /// alone is not proof of durable visibility. A transport failure keeps
    /// its network classification — a slow or unreachable service is not
    /// evidence of a lost write.
    pub async fn verify(&self, exchange_id: &str) -> Result<(), ServiceError> {
        let url = format!("{}/exchange/{}", self.base_url, exchange_id);
        let resp = self
            .client
            .get(&url)
            .timeout(self.verify_timeout)
            .send()
            .await
            .map_err(|e| {
                ServiceError::new(
                    ErrorKind::from_transport(&e),
                    format!("verification request failed: {}", e),
                )
            })?;

        if resp.status() == StatusCode::OK {
            Ok(())
        } else {
            Err(ServiceError::new(
                ErrorKind::VerificationFailure,
                format!("exchange {} not durably visible ({})", exchange_id, resp.status()),
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_classification() {
        assert_eq!(ErrorKind::from_status(StatusCode::BAD_REQUEST), ErrorKind::BadRequest);
        assert_eq!(ErrorKind::from_status(StatusCode::UNAUTHORIZED), ErrorKind::AuthFailure);
        assert_eq!(ErrorKind::from_status(StatusCode::FORBIDDEN), ErrorKind::PermissionDenied);
        assert_eq!(ErrorKind::from_status(StatusCode::NOT_FOUND), ErrorKind::EndpointNotFound);
        assert_eq!(
            ErrorKind::from_status(StatusCode::PAYLOAD_TOO_LARGE),
            ErrorKind::PayloadTooLarge
        );
        assert_eq!(
            ErrorKind::from_status(StatusCode::TOO_MANY_REQUESTS),
            ErrorKind::RateLimited
        );
        assert_eq!(
            ErrorKind::from_status(StatusCode::INTERNAL_SERVER_ERROR),
            ErrorKind::ServerError
        );
        assert_eq!(
            ErrorKind::from_status(StatusCode::SERVICE_UNAVAILABLE),
            ErrorKind::ServerError
        );
        assert_eq!(ErrorKind::from_status(StatusCode::IM_A_TEAPOT), ErrorKind::HttpError);
    }

    #[test]
    fn test_error_kind_names_are_snake_case() {
        // These are on-disk directory names; breaking them strands
        // dead-lettered files.
        assert_eq!(ErrorKind::NetworkTimeout.as_str(), "network_timeout");
        assert_eq!(ErrorKind::VerificationFailure.as_str(), "verification_failure");
        assert_eq!(ErrorKind::DataCorruption.as_str(), "data_corruption");
    }

    #[test]
    fn test_service_error_display() {
        let err = ServiceError::new(ErrorKind::RateLimited, "archive returned 429");
        assert_eq!(err.to_string(), "rate_limited: archive returned 429");
    }
}
