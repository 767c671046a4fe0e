//! # Error Taxonomy
//!
//! Structured errors for the channel runtime, per the propagation policy in the
//! specification: validation/not-found/conflict propagate to the (out-of-scope)
//! control plane caller, script/transport/protocol errors are locally recovered by
//! the pipeline and dispatcher, and storage/internal errors escalate to the
//! channel state machine.
//!
//! `anyhow` is still used at the outer boundaries (process startup, integration
//! tests) where an error only needs to be logged and not branched on; this enum is
//! for code that needs to know *which kind* of failure occurred.

use thiserror::Error;

/// The error kinds from the specification's §7 taxonomy.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Caller input invalid. Maps to HTTP 400 at the (out-of-scope) control plane.
    #[error("validation error: {0}")]
    Validation(String),

    /// Referenced entity absent. Maps to HTTP 404.
    #[error("not found: {0}")]
    NotFound(String),

    /// Revision mismatch or duplicate name. Maps to HTTP 409.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Operation not valid in the channel's current state. Maps to HTTP 409.
    #[error("invalid state transition: {0}")]
    State(String),

    /// User-script failure. Locally recovered: the pipeline writes a
    /// PROCESSING_ERROR content row and transitions the connector-message to
    /// ERROR; the channel keeps running.
    #[error("script error: {0}")]
    Script(String),

    /// Destination send failure. Drives the dispatcher's retry policy.
    #[error("transport error: {0}")]
    Transport(String),

    /// Malformed DICOM/MLLP frame. Connection-level: the caller should abort
    /// or close the connection and log a channel event.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Persistence write failure. Fatal for the current pipeline invocation;
    /// the source must not acknowledge upstream. The channel transitions to an
    /// error state.
    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    /// Caught last-resort errors.
    #[error("internal error: {0}")]
    Internal(String),
}

impl EngineError {
    /// The HTTP status code the (out-of-scope) control plane should surface for
    /// this error kind, per spec.md §6/§7.
    pub fn status_code(&self) -> u16 {
        match self {
            EngineError::Validation(_) => 400,
            EngineError::NotFound(_) => 404,
            EngineError::Conflict(_) => 409,
            EngineError::State(_) => 409,
            EngineError::Script(_) => 500,
            EngineError::Transport(_) => 500,
            EngineError::Protocol(_) => 500,
            EngineError::Storage(_) => 500,
            EngineError::Internal(_) => 500,
        }
    }

    /// The `{error, message}` envelope body from spec.md §6.
    pub fn envelope(&self) -> serde_json::Value {
        serde_json::json!({
            "error": self.kind_name(),
            "message": self.to_string(),
        })
    }

    fn kind_name(&self) -> &'static str {
        match self {
            EngineError::Validation(_) => "ValidationError",
            EngineError::NotFound(_) => "NotFound",
            EngineError::Conflict(_) => "Conflict",
            EngineError::State(_) => "StateError",
            EngineError::Script(_) => "ScriptError",
            EngineError::Transport(_) => "TransportError",
            EngineError::Protocol(_) => "ProtocolError",
            EngineError::Storage(_) => "StorageError",
            EngineError::Internal(_) => "Internal",
        }
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;

impl From<std::io::Error> for EngineError {
    fn from(e: std::io::Error) -> Self {
        EngineError::Transport(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_match_spec() {
        assert_eq!(EngineError::Validation("x".into()).status_code(), 400);
        assert_eq!(EngineError::NotFound("x".into()).status_code(), 404);
        assert_eq!(EngineError::Conflict("x".into()).status_code(), 409);
        assert_eq!(EngineError::State("x".into()).status_code(), 409);
    }

    #[test]
    fn envelope_shape() {
        let e = EngineError::Conflict("Channel has been modified".into());
        let v = e.envelope();
        assert_eq!(v["error"], "Conflict");
        assert_eq!(v["message"], "conflict: Channel has been modified");
    }
}
