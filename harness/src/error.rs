//! Harness error types
//!
//! Every failure the protocol engine can raise. The three taxonomy members
//! (`Protocol`, `Server`, `Round`) mirror the evaluation service's wire
//! errors and carry a reason, a message and a diagnostic trace. The remaining
//! variants are local faults (I/O, JSON, transport, configuration).

use serde::{Deserialize, Serialize};
use std::backtrace::Backtrace;
use thiserror::Error;

/// Result type alias for harness operations
pub type HarnessResult<T> = Result<T, HarnessError>;

/// Trace recorded when none was captured.
pub const TRACE_UNAVAILABLE: &str = "stack trace unavailable";

/// Status code used for caller misuse.
pub const PROTOCOL_STATUS: u16 = 400;
/// Status code used for backing-store faults.
pub const SERVER_STATUS: u16 = 500;
/// Status code used for "no more rounds". The service answers end-of-data
/// with 204 No Content, so the taxonomy member takes the same code.
pub const ROUND_STATUS: u16 = 204;

// ============================================================================
// Wire body
// ============================================================================

/// Error body exchanged with the evaluation service.
///
/// # Example
/// ```json
/// {
///   "reason": "DetectionRepost",
///   "message": "Cannot re post detection for a given round",
///   "stack_trace": "stack trace unavailable"
/// }
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub reason: String,
    pub message: String,
    #[serde(default = "default_trace")]
    pub stack_trace: String,
}

fn default_trace() -> String {
    TRACE_UNAVAILABLE.to_string()
}

impl std::fmt::Display for ErrorBody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.reason, self.message)
    }
}

/// Errors that can occur during harness operations
#[derive(Error, Debug)]
pub enum HarnessError {
    /// Caller misuse: unknown or terminated session, repost, budget, gating
    #[error("Protocol error [{reason}]: {message}")]
    Protocol {
        reason: String,
        message: String,
        trace: String,
    },

    /// Backing-store fault: missing metadata, unreadable result files
    #[error("Server error [{reason}]: {message}")]
    Server {
        reason: String,
        message: String,
        trace: String,
    },

    /// No more rounds are available for the test
    #[error("Round error [{reason}]: {message}")]
    Round {
        reason: String,
        message: String,
        trace: String,
    },

    /// Transport failure talking to the evaluation service
    #[error("HTTP error: {message}")]
    Http { message: String, retryable: bool },

    /// Configuration error
    #[error("Configuration error: {message}")]
    Config { message: String },

    /// An algorithm stage reported a failure
    #[error("Algorithm stage {stage} failed: {message}")]
    Algorithm { stage: String, message: String },

    /// Invalid state transition
    #[error("Invalid state transition from {from} to {to}")]
    InvalidStateTransition { from: String, to: String },

    /// Requested mode is not supported
    #[error("Not implemented: {message}")]
    NotImplemented { message: String },

    /// IO error wrapper
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Capture a diagnostic trace when `RUST_BACKTRACE` enables it.
pub fn capture_trace() -> String {
    let backtrace = Backtrace::capture();
    match backtrace.status() {
        std::backtrace::BacktraceStatus::Captured => backtrace.to_string(),
        _ => TRACE_UNAVAILABLE.to_string(),
    }
}

impl HarnessError {
    /// Create a protocol (caller misuse) error
    pub fn protocol(reason: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Protocol {
            reason: reason.into(),
            message: message.into(),
            trace: capture_trace(),
        }
    }

    /// Create a server (backing store) error
    pub fn server(reason: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Server {
            reason: reason.into(),
            message: message.into(),
            trace: capture_trace(),
        }
    }

    /// Create a round (end of data) error
    pub fn round(reason: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Round {
            reason: reason.into(),
            message: message.into(),
            trace: capture_trace(),
        }
    }

    /// Create a transport error
    pub fn http(message: impl Into<String>, retryable: bool) -> Self {
        Self::Http {
            message: message.into(),
            retryable,
        }
    }

    /// Create a config error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Create an algorithm stage error
    pub fn algorithm(stage: impl std::fmt::Display, message: impl Into<String>) -> Self {
        Self::Algorithm {
            stage: stage.to_string(),
            message: message.into(),
        }
    }

    /// Create a not-implemented error
    pub fn not_implemented(message: impl Into<String>) -> Self {
        Self::NotImplemented {
            message: message.into(),
        }
    }

    /// Replace the diagnostic trace (taxonomy members only)
    pub fn with_trace(mut self, new_trace: impl Into<String>) -> Self {
        match &mut self {
            Self::Protocol { trace, .. } | Self::Server { trace, .. } | Self::Round { trace, .. } => {
                *trace = new_trace.into();
            }
            _ => {}
        }
        self
    }

    /// Machine-readable reason, when the error carries one
    pub fn reason(&self) -> Option<&str> {
        match self {
            Self::Protocol { reason, .. }
            | Self::Server { reason, .. }
            | Self::Round { reason, .. } => Some(reason),
            _ => None,
        }
    }

    /// Whether this is the expected end-of-rounds signal
    pub fn is_round_end(&self) -> bool {
        matches!(self, Self::Round { .. })
    }

    /// Whether this is caller misuse
    pub fn is_protocol(&self) -> bool {
        matches!(self, Self::Protocol { .. })
    }

    /// Whether this is a server-side fault (round errors included)
    pub fn is_server(&self) -> bool {
        matches!(self, Self::Server { .. } | Self::Round { .. })
    }

    /// Status code used when the error crosses the transport
    pub fn status_code(&self) -> u16 {
        match self {
            Self::Protocol { .. } => PROTOCOL_STATUS,
            Self::Round { .. } => ROUND_STATUS,
            _ => SERVER_STATUS,
        }
    }

    /// Check if this error is retryable (transient failure)
    ///
    /// Taxonomy members are never retried: they describe protocol state,
    /// not a flaky link.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Http { retryable, .. } => *retryable,
            Self::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::WouldBlock
                    | std::io::ErrorKind::Interrupted
                    | std::io::ErrorKind::TimedOut
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
            ),
            _ => false,
        }
    }

    /// Convert to the wire error body
    pub fn to_body(&self) -> ErrorBody {
        match self {
            Self::Protocol {
                reason,
                message,
                trace,
            }
            | Self::Server {
                reason,
                message,
                trace,
            }
            | Self::Round {
                reason,
                message,
                trace,
            } => ErrorBody {
                reason: reason.clone(),
                message: message.clone(),
                stack_trace: trace.clone(),
            },
            other => ErrorBody {
                reason: "Unknown".to_string(),
                message: other.to_string(),
                stack_trace: TRACE_UNAVAILABLE.to_string(),
            },
        }
    }

    /// Rebuild a typed error from a service status code and body.
    ///
    /// 4xx maps to `Protocol`, 204 to `Round`, anything else to `Server`.
    pub fn from_status(status: u16, body: ErrorBody) -> Self {
        let ErrorBody {
            reason,
            message,
            stack_trace,
        } = body;
        match status {
            ROUND_STATUS => Self::Round {
                reason,
                message,
                trace: stack_trace,
            },
            400..=499 => Self::Protocol {
                reason,
                message,
                trace: stack_trace,
            },
            _ => Self::Server {
                reason,
                message,
                trace: stack_trace,
            },
        }
    }

    /// Convert to error body JSON
    pub fn to_body_json(&self) -> String {
        serde_json::to_string_pretty(&self.to_body()).unwrap_or_else(|_| {
            format!(
                r#"{{"reason":"SerializationError","message":"{}"}}"#,
                self
            )
        })
    }
}

impl From<reqwest::Error> for HarnessError {
    fn from(err: reqwest::Error) -> Self {
        let retryable = err.is_timeout() || err.is_connect() || err.is_request();
        Self::http(err.to_string(), retryable)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = HarnessError::protocol("DetectionRepost", "cannot repost detection");
        assert!(err.to_string().contains("DetectionRepost"));
        assert!(err.to_string().contains("cannot repost"));

        let err = HarnessError::round("End of Dataset", "all rounds served");
        assert!(err.to_string().contains("Round error"));
    }

    #[test]
    fn test_status_codes() {
        assert_eq!(HarnessError::protocol("a", "b").status_code(), 400);
        assert_eq!(HarnessError::server("a", "b").status_code(), 500);
        assert_eq!(HarnessError::round("a", "b").status_code(), 204);
        assert_eq!(HarnessError::config("bad").status_code(), 500);
    }

    #[test]
    fn test_round_is_server_member() {
        let err = HarnessError::round("no_defined_rounds", "round_size missing");
        assert!(err.is_server());
        assert!(err.is_round_end());
        assert!(!HarnessError::server("x", "y").is_round_end());
    }

    #[test]
    fn test_is_retryable() {
        assert!(HarnessError::http("connection refused", true).is_retryable());
        assert!(!HarnessError::http("bad payload", false).is_retryable());

        // Typed failures are never retried
        assert!(!HarnessError::protocol("SessionEnded", "terminated").is_retryable());
        assert!(!HarnessError::server("metadata_not_found", "missing").is_retryable());
        assert!(!HarnessError::round("End of Dataset", "done").is_retryable());

        let io_err = std::io::Error::new(std::io::ErrorKind::Interrupted, "interrupted");
        let err: HarnessError = io_err.into();
        assert!(err.is_retryable());

        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        let err: HarnessError = io_err.into();
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_body_roundtrip_keeps_kind() {
        let err = HarnessError::protocol("SessionEnded", "terminated").with_trace("trace-1");
        let body = err.to_body();
        assert_eq!(body.stack_trace, "trace-1");

        let restored = HarnessError::from_status(err.status_code(), body);
        assert!(restored.is_protocol());
        assert_eq!(restored.reason(), Some("SessionEnded"));

        let restored = HarnessError::from_status(204, ErrorBody {
            reason: "End of Dataset".into(),
            message: "done".into(),
            stack_trace: TRACE_UNAVAILABLE.into(),
        });
        assert!(restored.is_round_end());

        let restored = HarnessError::from_status(502, ErrorBody {
            reason: "Gateway".into(),
            message: "upstream".into(),
            stack_trace: TRACE_UNAVAILABLE.into(),
        });
        assert!(matches!(restored, HarnessError::Server { .. }));
    }

    #[test]
    fn test_body_json_defaults_trace() {
        let parsed: ErrorBody =
            serde_json::from_str(r#"{"reason":"BadDomain","message":"nope"}"#).unwrap();
        assert_eq!(parsed.stack_trace, TRACE_UNAVAILABLE);

        let json = HarnessError::server("CantReadFile", "gone").to_body_json();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["reason"], "CantReadFile");
    }
}
