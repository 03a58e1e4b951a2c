//! Error types for the companion turn pipeline.
//!
//! Each variant carries a stable error code (SCREAMING_SNAKE_CASE) that is
//! included in the Display output and accessible via [`CompanionError::code()`].
//!
//! Most stages never surface these to the orchestrator: generation backends
//! fold failures into [`crate::engine::GenerationResult::NoOutput`], the TTS
//! client into `None`, and the conversation log into a `warn!`. The errors
//! here travel on the few paths that are allowed to fail hard (model
//! initialisation, configuration loading, CLI plumbing).

/// Stable error codes for programmatic error handling.
pub mod error_codes {
    /// Invalid or missing configuration (credential, endpoint, bounds).
    pub const CONFIG_INVALID: &str = "CONFIG_INVALID";

    /// A required runtime capability (GPU compute API) is unavailable.
    pub const CAPABILITY_MISSING: &str = "CAPABILITY_MISSING";

    /// Connection failure, timeout or non-success HTTP status.
    pub const NETWORK_FAILED: &str = "NETWORK_FAILED";

    /// Upstream response had an unexpected shape.
    pub const PROTOCOL_ERROR: &str = "PROTOCOL_ERROR";

    /// Audio output device or playback failure.
    pub const RESOURCE_FAILED: &str = "RESOURCE_FAILED";

    /// Local model load or inference failure.
    pub const MODEL_FAILED: &str = "MODEL_FAILED";

    /// Conversation log load/save failure.
    pub const PERSISTENCE_FAILED: &str = "PERSISTENCE_FAILED";

    /// Filesystem I/O failure.
    pub const IO_ERROR: &str = "IO_ERROR";

    /// JSON (de)serialization failure.
    pub const JSON_ERROR: &str = "JSON_ERROR";
}

/// Errors produced by the companion crate.
///
/// The Display impl formats as `[CODE] message`.
#[derive(Debug, thiserror::Error)]
pub enum CompanionError {
    /// Invalid or missing configuration.
    #[error("[{}] {}", error_codes::CONFIG_INVALID, .0)]
    Config(String),

    /// Unsupported runtime capability.
    #[error("[{}] {}", error_codes::CAPABILITY_MISSING, .0)]
    Capability(String),

    /// Network failure.
    #[error("[{}] {}", error_codes::NETWORK_FAILED, .0)]
    Network(String),

    /// Malformed upstream response.
    #[error("[{}] {}", error_codes::PROTOCOL_ERROR, .0)]
    Protocol(String),

    /// Audio resource failure.
    #[error("[{}] {}", error_codes::RESOURCE_FAILED, .0)]
    Resource(String),

    /// Local model failure.
    #[error("[{}] {}", error_codes::MODEL_FAILED, .0)]
    Model(String),

    /// Log persistence failure.
    #[error("[{}] {}", error_codes::PERSISTENCE_FAILED, .0)]
    Persistence(String),

    /// I/O error.
    #[error("[{}] {}", error_codes::IO_ERROR, .0)]
    Io(#[from] std::io::Error),

    /// JSON error.
    #[error("[{}] {}", error_codes::JSON_ERROR, .0)]
    Json(#[from] serde_json::Error),
}

impl CompanionError {
    /// Returns the stable error code for this error.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Config(_) => error_codes::CONFIG_INVALID,
            Self::Capability(_) => error_codes::CAPABILITY_MISSING,
            Self::Network(_) => error_codes::NETWORK_FAILED,
            Self::Protocol(_) => error_codes::PROTOCOL_ERROR,
            Self::Resource(_) => error_codes::RESOURCE_FAILED,
            Self::Model(_) => error_codes::MODEL_FAILED,
            Self::Persistence(_) => error_codes::PERSISTENCE_FAILED,
            Self::Io(_) => error_codes::IO_ERROR,
            Self::Json(_) => error_codes::JSON_ERROR,
        }
    }

    /// Returns the message without the code prefix.
    ///
    /// This is what ends up in `error`-role log entries.
    pub fn message(&self) -> String {
        match self {
            Self::Config(m)
            | Self::Capability(m)
            | Self::Network(m)
            | Self::Protocol(m)
            | Self::Resource(m)
            | Self::Model(m)
            | Self::Persistence(m) => m.clone(),
            Self::Io(e) => e.to_string(),
            Self::Json(e) => e.to_string(),
        }
    }
}

/// Convenience result type.
pub type Result<T> = std::result::Result<T, CompanionError>;

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

    use super::*;

    #[test]
    fn display_includes_code_prefix() {
        let err = CompanionError::Capability("WebGPU is not available".into());
        assert_eq!(err.to_string(), "[CAPABILITY_MISSING] WebGPU is not available");
        assert_eq!(err.code(), error_codes::CAPABILITY_MISSING);
        assert_eq!(err.message(), "WebGPU is not available");
    }

    #[test]
    fn io_errors_convert() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err: CompanionError = io.into();
        assert_eq!(err.code(), error_codes::IO_ERROR);
        assert!(err.message().contains("gone"));
    }
}
