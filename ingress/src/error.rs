//! Error types for the ingress

use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use thiserror::Error;

/// Result type alias for ingress operations
pub type Result<T> = std::result::Result<T, IngressError>;

/// Why a host mapping token was rejected
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MappingFault {
    /// No space between host and port
    MissingSeparator,
    /// Host part is empty
    EmptyHost,
    /// Port part is not an integer in the port range
    InvalidPort,
}

impl std::fmt::Display for MappingFault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let reason = match self {
            MappingFault::MissingSeparator => "missing space separator",
            MappingFault::EmptyHost => "empty host",
            MappingFault::InvalidPort => "port is not an integer in 0-65535",
        };
        f.write_str(reason)
    }
}

/// Ingress error types
#[derive(Error, Debug)]
pub enum IngressError {
    /// Host mapping text could not be parsed
    #[error("{token:?} (entry {index}) is not a host mapping: {reason}")]
    MalformedMapping {
        index: usize,
        token: String,
        reason: MappingFault,
    },

    /// The same host appears twice in the mapping list
    #[error("Host {0} is mapped more than once")]
    DuplicateHost(String),

    /// Missing or invalid configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// Host is not served by this ingress
    #[error("Forbidden Host: {host}")]
    AccessDenied { host: String },

    /// Forwarding to the backend failed
    #[error("Backend unavailable: {0}")]
    BackendUnavailable(String),

    /// A certificate could not be obtained for a host
    #[error("Certificate issuance failed for {host}: {reason}")]
    CertificateIssuance { host: String, reason: String },

    /// A listener could not be bound
    #[error("Failed to bind {addr}: {source}")]
    ListenerBind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    /// TLS error
    #[error("TLS error: {0}")]
    Tls(String),

    /// ACME protocol error
    #[error("ACME error: {0}")]
    Acme(#[from] instant_acme::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl IntoResponse for IngressError {
    fn into_response(self) -> Response {
        let (status, body) = match self {
            IngressError::AccessDenied { host } => {
                (StatusCode::FORBIDDEN, format!("Forbidden Host: {host}\n"))
            }
            IngressError::BackendUnavailable(_) => {
                (StatusCode::BAD_GATEWAY, "Bad Gateway\n".to_string())
            }
            _ => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Internal Server Error\n".to_string(),
            ),
        };

        (
            status,
            [
                (header::CONTENT_TYPE, "text/plain; charset=utf-8"),
                (header::X_CONTENT_TYPE_OPTIONS, "nosniff"),
            ],
            body,
        )
            .into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::BodyExt;

    #[tokio::test]
    async fn test_access_denied_response() {
        let response = IngressError::AccessDenied {
            host: "c.example".to_string(),
        }
        .into_response();

        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"Forbidden Host: c.example\n");
    }

    #[test]
    fn test_backend_unavailable_status() {
        let response = IngressError::BackendUnavailable("refused".to_string()).into_response();
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    }

    #[test]
    fn test_malformed_mapping_message() {
        let err = IngressError::MalformedMapping {
            index: 1,
            token: "a.example".to_string(),
            reason: MappingFault::MissingSeparator,
        };
        assert_eq!(
            err.to_string(),
            "\"a.example\" (entry 1) is not a host mapping: missing space separator"
        );
    }
}
