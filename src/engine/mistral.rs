//! `mistralrs` implementation of the local model traits.

use super::local::{LocalModel, ModelLoader, TokenStream, capability_error};
use crate::config::LocalModelConfig;
use crate::error::{CompanionError, Result};
use crate::paths;
use async_trait::async_trait;
use mistralrs::{GgufModelBuilder, Model, RequestBuilder, Response, TextMessageRole, TextMessages};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info};

/// True when this build can run inference on a GPU.
pub fn gpu_backend_available() -> bool {
    cfg!(any(feature = "metal", feature = "cuda", target_os = "macos"))
}

/// Chat template that emits each message's content and nothing else.
///
/// Installed in place of the model's own template so a composed prompt,
/// which already carries its turn tags, reaches the tokenizer verbatim.
pub const PASSTHROUGH_CHAT_TEMPLATE: &str =
    "{% for message in messages %}{{ message['content'] }}{% endfor %}";

const PASSTHROUGH_TEMPLATE_FILE: &str = "passthrough_chat_template.json";

/// Write [`PASSTHROUGH_CHAT_TEMPLATE`] as a tokenizer-config style JSON file
/// under `dir` and return its path.
///
/// # Errors
///
/// Returns [`CompanionError::Io`] if the directory or file cannot be written.
pub fn write_passthrough_template(dir: &Path) -> Result<PathBuf> {
    std::fs::create_dir_all(dir)?;
    let path = dir.join(PASSTHROUGH_TEMPLATE_FILE);
    let body = serde_json::json!({ "chat_template": PASSTHROUGH_CHAT_TEMPLATE });
    std::fs::write(&path, serde_json::to_string_pretty(&body)?)?;
    Ok(path)
}

/// Loads GGUF models through `mistralrs`.
#[derive(Debug, Default, Clone, Copy)]
pub struct MistralrsLoader;

#[async_trait]
impl ModelLoader for MistralrsLoader {
    fn check_capability(&self, config: &LocalModelConfig) -> Result<()> {
        if config.require_gpu && !gpu_backend_available() {
            return Err(capability_error(
                "no GPU compute backend is available for the local model; rebuild with \
                 `--features metal` (macOS) or `--features cuda`, or set \
                 `local.require_gpu = false` to run on CPU",
            ));
        }
        Ok(())
    }

    async fn load(&self, config: &LocalModelConfig) -> Result<Arc<dyn LocalModel>> {
        let mut builder =
            GgufModelBuilder::new(&config.model_id, vec![&config.model_asset_path]).with_logging();
        if !config.tokenizer_id.is_empty() {
            builder = builder.with_tok_model_id(&config.tokenizer_id);
        }
        if !config.apply_chat_template {
            let template = write_passthrough_template(&paths::model_support_dir())?;
            debug!("using pass-through chat template {}", template.display());
            builder = builder.with_chat_template(template.display().to_string());
        }
        let model = builder
            .build()
            .await
            .map_err(|e| CompanionError::Model(format!("model build failed: {e}")))?;
        info!("mistralrs model loaded: {}", config.model_asset_path);
        Ok(Arc::new(MistralrsModel {
            model: ModelHandle::new(model),
            config: config.clone(),
        }))
    }
}

/// Shared handle that [`LocalModel::close`] can empty.
///
/// Requests clone the inner `Arc` for their duration; once the handle is
/// closed and in-flight requests finish, the weights are dropped.
struct ModelHandle<T> {
    inner: Mutex<Option<Arc<T>>>,
}

impl<T> ModelHandle<T> {
    fn new(value: T) -> Self {
        Self {
            inner: Mutex::new(Some(Arc::new(value))),
        }
    }

    fn get(&self) -> Result<Arc<T>> {
        let guard = match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        guard
            .as_ref()
            .map(Arc::clone)
            .ok_or_else(|| CompanionError::Model("model has been closed".into()))
    }

    fn take(&self) -> Option<Arc<T>> {
        match self.inner.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        }
    }
}

/// A loaded `mistralrs` model.
pub struct MistralrsModel {
    model: ModelHandle<Model>,
    config: LocalModelConfig,
}

impl MistralrsModel {
    /// One user message holding the whole prompt. Unless
    /// `apply_chat_template` is set, the loader installed
    /// [`PASSTHROUGH_CHAT_TEMPLATE`], so the model sees the prompt as is.
    fn request(&self, prompt: &str) -> RequestBuilder {
        let messages = TextMessages::new()
            .enable_thinking(false)
            .add_message(TextMessageRole::User, prompt);
        RequestBuilder::from(messages)
            .set_sampler_temperature(self.config.temperature)
            .set_sampler_topk(self.config.top_k)
            .set_sampler_topp(self.config.top_p)
            .set_sampler_max_len(self.config.max_tokens)
            .enable_thinking(false)
    }
}

#[async_trait]
impl LocalModel for MistralrsModel {
    async fn complete(&self, prompt: &str) -> Result<String> {
        let response = self
            .model
            .get()?
            .send_chat_request(self.request(prompt))
            .await
            .map_err(|e| CompanionError::Model(format!("inference failed: {e}")))?;
        Ok(response
            .choices
            .first()
            .and_then(|c| c.message.content.clone())
            .unwrap_or_default())
    }

    async fn stream(&self, prompt: &str) -> Result<TokenStream> {
        let request = self.request(prompt);
        let model = self.model.get()?;
        let (tx, rx) = mpsc::channel::<Result<String>>(64);

        tokio::spawn(async move {
            let mut stream = match model.stream_chat_request(request).await {
                Ok(s) => s,
                Err(e) => {
                    let _ = tx
                        .send(Err(CompanionError::Model(format!("stream request failed: {e}"))))
                        .await;
                    return;
                }
            };

            while let Some(response) = stream.next().await {
                let item = match response {
                    Response::Chunk(chunk) => chunk
                        .choices
                        .first()
                        .and_then(|c| c.delta.content.clone())
                        .filter(|text| !text.is_empty())
                        .map(Ok),
                    Response::Done(done) => {
                        // Some models only surface final text in the terminal response.
                        if let Some(text) = done
                            .choices
                            .first()
                            .and_then(|c| c.message.content.clone())
                            .filter(|text| !text.is_empty())
                        {
                            let _ = tx.send(Ok(text)).await;
                        }
                        break;
                    }
                    Response::ModelError(msg, _) => {
                        Some(Err(CompanionError::Model(format!("model error: {msg}"))))
                    }
                    Response::InternalError(e) => {
                        Some(Err(CompanionError::Model(format!("internal error: {e}"))))
                    }
                    Response::ValidationError(e) => {
                        Some(Err(CompanionError::Model(format!("validation error: {e}"))))
                    }
                    _ => None,
                };
                let Some(item) = item else { continue };
                let failed = item.is_err();
                if tx.send(item).await.is_err() {
                    debug!("token receiver dropped, stopping generation");
                    return;
                }
                if failed {
                    return;
                }
            }
        });

        Ok(Box::pin(ReceiverStream::new(rx)))
    }

    fn close(&self) {
        match self.model.take() {
            Some(model) => debug!(
                "closing mistralrs model {} ({} in-flight requests)",
                self.config.model_asset_path,
                Arc::strong_count(&model) - 1
            ),
            None => debug!("mistralrs model already closed"),
        }
    }
}
