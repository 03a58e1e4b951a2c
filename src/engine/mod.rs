//! Generation backends.
//!
//! Two variants sit behind [`GenerationBackend`]:
//! - **Cloud**: Gemini `generateContent` over HTTPS ([`cloud::CloudBackend`]).
//! - **Local**: an on-device GGUF model via `mistralrs`
//!   ([`local::LocalBackend`] + [`mistral::MistralrsLoader`]).
//!
//! Per-call failures never escape a backend: `generate` always returns a
//! [`GenerationResult`], with [`GenerationResult::NoOutput`] standing for
//! "no usable output" (missing key, network/protocol failure, timeout,
//! empty completion). Only [`GenerationBackend::prepare`] may fail, and only
//! for initialisation problems such as a missing GPU backend.

pub mod cloud;
pub mod local;
pub mod mistral;

use crate::error::Result;
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;

/// Text shown and logged when a backend produced nothing usable.
pub const NO_OUTPUT_SENTINEL: &str = "...";

/// Outcome of one generation call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GenerationResult {
    /// Non-empty completion, verbatim.
    Text(String),
    /// No usable output.
    NoOutput,
}

impl GenerationResult {
    /// Wrap a completion, mapping blank text to [`GenerationResult::NoOutput`].
    pub fn from_text(text: impl Into<String>) -> Self {
        let text = text.into();
        if text.trim().is_empty() {
            Self::NoOutput
        } else {
            Self::Text(text)
        }
    }

    /// The completion, or the sentinel string.
    pub fn as_str(&self) -> &str {
        match self {
            Self::Text(text) => text,
            Self::NoOutput => NO_OUTPUT_SENTINEL,
        }
    }

    pub fn is_text(&self) -> bool {
        matches!(self, Self::Text(_))
    }
}

impl fmt::Display for GenerationResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-call options. Model settings live with each backend.
#[derive(Debug, Clone, Default)]
pub struct GenerateOptions {
    /// Cloud credential; ignored by the local backend.
    pub api_key: Option<String>,
}

impl GenerateOptions {
    /// Options carrying `api_key`; blank keys count as absent.
    pub fn with_api_key(api_key: &str) -> Self {
        let trimmed = api_key.trim();
        Self {
            api_key: (!trimmed.is_empty()).then(|| trimmed.to_owned()),
        }
    }
}

/// A pluggable completion backend.
#[async_trait]
pub trait GenerationBackend: Send + Sync {
    /// Short identifier recorded in log metadata (`cloud`, `local`).
    fn name(&self) -> &str;

    /// Make the backend ready to serve `generate`.
    ///
    /// # Errors
    ///
    /// Returns [`crate::CompanionError::Capability`] or
    /// [`crate::CompanionError::Model`] when initialisation cannot succeed.
    async fn prepare(&self) -> Result<()> {
        Ok(())
    }

    /// Produce one completion for `prompt`. Never fails.
    async fn generate(&self, prompt: &str, options: &GenerateOptions) -> GenerationResult;

    /// Release held resources. Safe to call when nothing is held.
    async fn dispose(&self) {}
}

/// Backend variants addressable by name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineKind {
    Cloud,
    Local,
}

impl EngineKind {
    /// Resolve an engine name. Unknown names select [`EngineKind::Cloud`].
    pub fn from_name(name: &str) -> Self {
        match name.trim().to_ascii_lowercase().as_str() {
            "local" | "tflite" | "mistralrs" => Self::Local,
            _ => Self::Cloud,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Cloud => "cloud",
            Self::Local => "local",
        }
    }
}

/// Lookup table from engine name to backend instance.
#[derive(Clone)]
pub struct EngineRegistry {
    cloud: Arc<dyn GenerationBackend>,
    local: Arc<dyn GenerationBackend>,
}

impl EngineRegistry {
    pub fn new(cloud: Arc<dyn GenerationBackend>, local: Arc<dyn GenerationBackend>) -> Self {
        Self { cloud, local }
    }

    /// Backend for `name`, falling back to cloud.
    pub fn select(&self, name: &str) -> Arc<dyn GenerationBackend> {
        self.get(EngineKind::from_name(name))
    }

    pub fn get(&self, kind: EngineKind) -> Arc<dyn GenerationBackend> {
        match kind {
            EngineKind::Cloud => Arc::clone(&self.cloud),
            EngineKind::Local => Arc::clone(&self.local),
        }
    }

    /// Dispose every backend.
    pub async fn dispose_all(&self) {
        self.cloud.dispose().await;
        self.local.dispose().await;
    }
}

impl fmt::Debug for EngineRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineRegistry")
            .field("cloud", &self.cloud.name())
            .field("local", &self.local.name())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

    use super::*;

    struct Named(&'static str);

    #[async_trait]
    impl GenerationBackend for Named {
        fn name(&self) -> &str {
            self.0
        }

        async fn generate(&self, _prompt: &str, _options: &GenerateOptions) -> GenerationResult {
            GenerationResult::from_text(self.0)
        }
    }

    #[test]
    fn engine_names_resolve_with_cloud_default() {
        assert_eq!(EngineKind::from_name("gemini"), EngineKind::Cloud);
        assert_eq!(EngineKind::from_name("cloud"), EngineKind::Cloud);
        assert_eq!(EngineKind::from_name("Local"), EngineKind::Local);
        assert_eq!(EngineKind::from_name("tflite"), EngineKind::Local);
        assert_eq!(EngineKind::from_name("something-else"), EngineKind::Cloud);
        assert_eq!(EngineKind::from_name(""), EngineKind::Cloud);
    }

    #[test]
    fn registry_selects_by_name() {
        let registry = EngineRegistry::new(Arc::new(Named("cloud")), Arc::new(Named("local")));
        assert_eq!(registry.select("tflite").name(), "local");
        assert_eq!(registry.select("unknown").name(), "cloud");
    }

    #[test]
    fn blank_text_is_no_output() {
        assert_eq!(GenerationResult::from_text("  \n"), GenerationResult::NoOutput);
        assert_eq!(GenerationResult::NoOutput.as_str(), NO_OUTPUT_SENTINEL);
        assert_eq!(GenerationResult::from_text("hi").as_str(), "hi");
    }

    #[test]
    fn blank_api_key_is_absent() {
        assert_eq!(GenerateOptions::with_api_key("  ").api_key, None);
        assert_eq!(
            GenerateOptions::with_api_key(" k ").api_key.as_deref(),
            Some("k")
        );
    }
}
