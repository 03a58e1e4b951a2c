//! On-device generation backend.
//!
//! [`LocalBackend`] owns at most one loaded model at a time. The model is
//! keyed by the configuration fields the loader and sampler consume
//! ([`ModelKey`]); a call with an unchanged key reuses the loaded instance, a changed key
//! releases the old one and loads anew. Initialisation runs under an async
//! lock, so a caller arriving during an in-flight load waits for it and
//! then sees a cache hit instead of starting a second load.
//!
//! Loading itself is delegated to a [`ModelLoader`] (production:
//! [`super::mistral::MistralrsLoader`]), which keeps this module testable
//! without model weights.

use super::{GenerateOptions, GenerationBackend, GenerationResult};
use crate::config::{GenerationMode, LocalModelConfig};
use crate::error::{CompanionError, Result};
use crate::sanitize::{earliest_marker, extract_assistant_reply};
use async_trait::async_trait;
use futures_util::{Stream, StreamExt};
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Incremental text from a streaming completion.
pub type TokenStream = Pin<Box<dyn Stream<Item = Result<String>> + Send>>;

/// Composite identity of a model configuration.
///
/// `random_seed`, `max_num_images` and `support_audio` never reach
/// `mistralrs`, so they are left out and changing them does not reload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelKey(String);

impl ModelKey {
    pub fn from_config(config: &LocalModelConfig) -> Self {
        Self(format!(
            "{}|{}|{}|{}|{}|{}|{}|{}",
            config.model_id,
            config.model_asset_path,
            config.tokenizer_id,
            config.max_tokens,
            config.temperature,
            config.top_k,
            config.top_p,
            config.apply_chat_template,
        ))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// A loaded model instance.
#[async_trait]
pub trait LocalModel: Send + Sync {
    /// Run to completion and return the raw text.
    async fn complete(&self, prompt: &str) -> Result<String>;

    /// Start a completion and yield text increments.
    async fn stream(&self, prompt: &str) -> Result<TokenStream>;

    /// Release model resources. Called once when the instance is replaced
    /// or disposed.
    fn close(&self) {}
}

/// Creates [`LocalModel`]s from configuration.
#[async_trait]
pub trait ModelLoader: Send + Sync {
    /// Fail fast when the runtime cannot host the model.
    ///
    /// # Errors
    ///
    /// Returns [`CompanionError::Capability`] with a user-facing explanation.
    fn check_capability(&self, config: &LocalModelConfig) -> Result<()>;

    /// Load a model.
    ///
    /// # Errors
    ///
    /// Returns [`CompanionError::Model`] on load failure.
    async fn load(&self, config: &LocalModelConfig) -> Result<Arc<dyn LocalModel>>;
}

/// Resolve-once stop-marker scan over accumulated partial output.
///
/// The first increment that makes any marker appear resolves the scan with
/// the text before the earliest marker; later increments are ignored.
#[derive(Debug)]
pub struct StopScan<'a> {
    markers: &'a [String],
    buffer: String,
    resolved: Option<String>,
}

impl<'a> StopScan<'a> {
    pub fn new(markers: &'a [String]) -> Self {
        Self {
            markers,
            buffer: String::new(),
            resolved: None,
        }
    }

    /// Feed one increment. Returns the resolved text the first time a
    /// marker is seen, `None` otherwise (including after resolution).
    pub fn push(&mut self, increment: &str) -> Option<&str> {
        if self.resolved.is_some() {
            return None;
        }
        self.buffer.push_str(increment);
        let pos = earliest_marker(&self.buffer, self.markers)?;
        self.resolved = Some(self.buffer[..pos].trim().to_owned());
        self.resolved.as_deref()
    }

    #[cfg(test)]
    pub(crate) fn is_resolved(&self) -> bool {
        self.resolved.is_some()
    }

    /// Final text: the resolved prefix, or everything accumulated.
    pub fn finish(self) -> String {
        match self.resolved {
            Some(text) => text,
            None => self.buffer.trim().to_owned(),
        }
    }
}

/// Drain `stream` until a stop marker appears or the stream ends.
///
/// Dropping the stream on early resolution stops further generation.
pub async fn collect_until_stop(mut stream: TokenStream, markers: &[String]) -> Result<String> {
    let mut scan = StopScan::new(markers);
    while let Some(increment) = stream.next().await {
        if scan.push(&increment?).is_some() {
            break;
        }
    }
    Ok(scan.finish())
}

struct LoadedModel {
    key: ModelKey,
    model: Arc<dyn LocalModel>,
}

/// Singleton-owning local backend.
pub struct LocalBackend {
    loader: Arc<dyn ModelLoader>,
    config: Mutex<LocalModelConfig>,
    slot: tokio::sync::Mutex<Option<LoadedModel>>,
}

impl LocalBackend {
    pub fn new(config: LocalModelConfig, loader: Arc<dyn ModelLoader>) -> Self {
        Self {
            loader,
            config: Mutex::new(config),
            slot: tokio::sync::Mutex::new(None),
        }
    }

    /// Current model configuration.
    pub fn config(&self) -> LocalModelConfig {
        match self.config.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Replace the configuration. The next call re-initialises only if the
    /// model key changed.
    #[cfg(test)]
    pub(crate) fn reconfigure(&self, config: LocalModelConfig) {
        match self.config.lock() {
            Ok(mut guard) => *guard = config,
            Err(poisoned) => *poisoned.into_inner() = config,
        }
    }

    /// Key of the loaded model, if any.
    pub async fn loaded_key(&self) -> Option<ModelKey> {
        self.slot.lock().await.as_ref().map(|m| m.key.clone())
    }

    /// Return the loaded model, loading it first when the key changed.
    ///
    /// # Errors
    ///
    /// Propagates capability and load failures from the [`ModelLoader`].
    pub async fn init(&self) -> Result<Arc<dyn LocalModel>> {
        let config = self.config();
        let key = ModelKey::from_config(&config);

        let mut slot = self.slot.lock().await;
        if let Some(loaded) = slot.as_ref()
            && loaded.key == key
        {
            return Ok(Arc::clone(&loaded.model));
        }

        self.loader.check_capability(&config)?;

        if let Some(previous) = slot.take() {
            info!("local model configuration changed, releasing previous instance");
            previous.model.close();
        }

        let started = Instant::now();
        info!("loading local model: {} / {}", config.model_id, config.model_asset_path);
        let model = self.loader.load(&config).await?;
        info!("local model ready in {:.1}s", started.elapsed().as_secs_f64());

        *slot = Some(LoadedModel {
            key,
            model: Arc::clone(&model),
        });
        Ok(model)
    }

    /// Release the loaded model and forget its key. No-op when nothing is loaded.
    pub async fn release(&self) {
        if let Some(loaded) = self.slot.lock().await.take() {
            info!("releasing local model");
            loaded.model.close();
        }
    }

    async fn run(&self, model: Arc<dyn LocalModel>, prompt: &str, config: &LocalModelConfig) -> Result<String> {
        match config.mode {
            GenerationMode::Atomic => {
                let raw = model.complete(prompt).await?;
                Ok(extract_assistant_reply(&raw, &config.stop_markers))
            }
            GenerationMode::Streaming => {
                let stream = model.stream(prompt).await?;
                collect_until_stop(stream, &config.stop_markers).await
            }
        }
    }
}

#[async_trait]
impl GenerationBackend for LocalBackend {
    fn name(&self) -> &str {
        "local"
    }

    async fn prepare(&self) -> Result<()> {
        self.init().await.map(|_| ())
    }

    async fn generate(&self, prompt: &str, _options: &GenerateOptions) -> GenerationResult {
        let model = match self.init().await {
            Ok(model) => model,
            Err(e) => {
                warn!("local model unavailable: {e}");
                return GenerationResult::NoOutput;
            }
        };

        let config = self.config();
        debug!(
            "local generation: mode={:?} prompt_chars={}",
            config.mode,
            prompt.chars().count()
        );
        let timeout = Duration::from_secs(config.timeout_secs);
        match tokio::time::timeout(timeout, self.run(model, prompt, &config)).await {
            Ok(Ok(text)) => GenerationResult::from_text(text),
            Ok(Err(e)) => {
                warn!("local generation failed: {e}");
                GenerationResult::NoOutput
            }
            Err(_) => {
                warn!("local generation timed out after {}s", timeout.as_secs());
                GenerationResult::NoOutput
            }
        }
    }

    async fn dispose(&self) {
        self.release().await;
    }
}

impl std::fmt::Debug for LocalBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalBackend").finish_non_exhaustive()
    }
}

/// Map a loader-side failure into the capability error shown to users.
pub fn capability_error(detail: impl Into<String>) -> CompanionError {
    CompanionError::Capability(detail.into())
}
