//! Error taxonomy for the gateway.
//!
//! Every failure a handler can produce maps onto exactly one variant here,
//! and every variant maps onto exactly one HTTP status. Captured subprocess
//! stderr is carried verbatim into the response body: this is an internal
//! operator tool and the raw tool output is the primary debugging artifact.

use std::process::ExitStatus;

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum GatewayError {
    /// The request itself is unusable (missing or malformed `url`, unknown
    /// preset). Checked before any subprocess is spawned.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// A required configuration value is absent or unusable at the point of
    /// use. Most of these are caught at startup; the rest (e.g. a missing
    /// transcoder binary) surface here.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The OS failed to start the subprocess.
    #[error("failed to start {tool}: {message}")]
    Spawn { tool: String, message: String },

    /// The tool exited nonzero without an upstream-connectivity signature.
    #[error("{tool} exited with {status}")]
    Subprocess {
        tool: String,
        status: ExitStatus,
        stderr: String,
    },

    /// The tool exited nonzero and its stderr carries a proxy/network
    /// signature: the path to the target site is broken, not the request.
    #[error("upstream connectivity failure")]
    UpstreamBlocked { stderr: String },

    /// The tool ran past its deadline and was killed.
    #[error("{tool} timed out after {secs}s and was killed")]
    Timeout { tool: String, secs: u64 },

    /// Exit code zero, yet no expected output file exists on disk.
    #[error("the tool reported success but produced no artifacts")]
    ArtifactMissing,

    /// Building the response archive failed before headers were committed.
    #[error("archive construction failed: {0}")]
    Archive(String),

    /// No transcript track exists for the requested language.
    #[error("no transcript available for language {0}")]
    TranscriptUnavailable(String),

    /// The URL carries nothing that looks like a video reference.
    #[error("could not derive a video reference from the url")]
    TranscriptSourceInvalid,
}

impl GatewayError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::InvalidRequest(_) | Self::TranscriptSourceInvalid => StatusCode::BAD_REQUEST,
            Self::ArtifactMissing | Self::TranscriptUnavailable(_) => StatusCode::NOT_FOUND,
            Self::UpstreamBlocked { .. } => StatusCode::BAD_GATEWAY,
            Self::Configuration(_)
            | Self::Spawn { .. }
            | Self::Subprocess { .. }
            | Self::Timeout { .. }
            | Self::Archive(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Captured stderr, where a variant carries one.
    fn detail(&self) -> Option<&str> {
        match self {
            Self::Subprocess { stderr, .. } | Self::UpstreamBlocked { stderr } => {
                Some(stderr.as_str())
            }
            _ => None,
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status();
        let mut body = serde_json::json!({
            "error": self.to_string(),
        });
        if let Some(detail) = self.detail()
            && !detail.is_empty()
        {
            body["detail"] = serde_json::Value::String(detail.to_owned());
        }
        (status, Json(body)).into_response()
    }
}

pub type GatewayResult<T> = Result<T, GatewayError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn statuses_match_failure_classes() {
        assert_eq!(
            GatewayError::InvalidRequest("missing url".into()).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            GatewayError::ArtifactMissing.status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            GatewayError::UpstreamBlocked {
                stderr: "proxy".into()
            }
            .status(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            GatewayError::Archive("zip".into()).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(
            GatewayError::TranscriptUnavailable("en".into()).status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            GatewayError::TranscriptSourceInvalid.status(),
            StatusCode::BAD_REQUEST
        );
    }

    #[test]
    fn detail_carries_stderr_verbatim() {
        let err = GatewayError::UpstreamBlocked {
            stderr: "ERROR: Tunnel connection failed: 502".into(),
        };
        assert_eq!(
            err.detail(),
            Some("ERROR: Tunnel connection failed: 502")
        );
        assert!(GatewayError::ArtifactMissing.detail().is_none());
    }
}
