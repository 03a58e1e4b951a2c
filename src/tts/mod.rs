//! Speech synthesis client.
//!
//! POSTs the reply to a GPT-SoVITS style HTTP endpoint and returns the
//! response body as an [`AudioHandle`]. Every failure (blank text, network
//! error, non-success status, empty body, timeout) is "no voice available":
//! the caller gets `None` and the turn carries on without audio.
//!
//! The client retains exactly one playable handle. Assigning a new one
//! releases the previous; the orchestrator releases the current one when
//! playback ends.

use crate::config::TtsConfig;
use crate::error::{CompanionError, Result};
use bytes::Bytes;
use serde_json::{Map, Value, json};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, warn};

/// Synthesized audio ready for playback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioHandle {
    /// Unique per client.
    pub id: u64,
    /// Encoded audio (usually WAV).
    pub bytes: Bytes,
    /// Response `Content-Type`, when the server sent one.
    pub content_type: Option<String>,
}

/// Built-in request fields, before overrides.
pub fn default_payload() -> Map<String, Value> {
    let base = json!({
        "text_lang": "en",
        "ref_audio_path": "rev.wav",
        "prompt_text": "どれだけ雨が降ったところで洗い流されて綺麗にはならない",
        "prompt_lang": "ja",
        "top_k": 15,
        "top_p": 1,
        "temperature": 1,
        "repetition_penalty": 1,
        "speed_factor": 1.0,
        "text_split_method": "cut5",
        "seed": -1,
        "streaming_mode": false,
    });
    match base {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

/// Defaults, then `overrides`, then `text`. The text field always reflects
/// the current reply.
pub fn build_payload(text: &str, overrides: &Map<String, Value>) -> Map<String, Value> {
    let mut payload = default_payload();
    for (key, value) in overrides {
        payload.insert(key.clone(), value.clone());
    }
    payload.insert("text".to_owned(), Value::String(text.to_owned()));
    payload
}

/// Health URL for a synthesis endpoint: a trailing `/tts` becomes `/health`.
pub fn health_url(endpoint: &str) -> String {
    match endpoint.strip_suffix("/tts") {
        Some(root) => format!("{root}/health"),
        None => format!("{}/health", endpoint.trim_end_matches('/')),
    }
}

/// HTTP speech synthesis client.
#[derive(Debug)]
pub struct TtsClient {
    client: reqwest::Client,
    config: TtsConfig,
    next_id: AtomicU64,
    current: Mutex<Option<AudioHandle>>,
}

impl TtsClient {
    pub fn new(config: TtsConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            config,
            next_id: AtomicU64::new(1),
            current: Mutex::new(None),
        }
    }

    /// Synthesize `text` at `endpoint`. Returns `None` when no voice is available.
    pub async fn synthesize(&self, text: &str, endpoint: &str) -> Option<AudioHandle> {
        if text.trim().is_empty() {
            return None;
        }
        let timeout = Duration::from_secs(self.config.timeout_secs);
        let fetched = match tokio::time::timeout(timeout, self.fetch(text, endpoint)).await {
            Ok(Ok(fetched)) => fetched,
            Ok(Err(e)) => {
                warn!("speech synthesis unavailable: {e}");
                return None;
            }
            Err(_) => {
                warn!("speech synthesis timed out after {}s", timeout.as_secs());
                return None;
            }
        };

        let (bytes, content_type) = fetched;
        let handle = AudioHandle {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            bytes,
            content_type,
        };
        self.assign(handle.clone());
        Some(handle)
    }

    async fn fetch(&self, text: &str, endpoint: &str) -> Result<(Bytes, Option<String>)> {
        let payload = build_payload(text, &self.config.payload);
        let response = self
            .client
            .post(endpoint)
            .header("Content-Type", "application/json")
            .json(&payload)
            .send()
            .await
            .map_err(|e| CompanionError::Network(format!("TTS request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body_text = response.text().await.unwrap_or_default();
            let excerpt: String = body_text.chars().take(300).collect();
            return Err(CompanionError::Network(format!("TTS HTTP {status}: {excerpt}")));
        }

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned);
        let bytes = response
            .bytes()
            .await
            .map_err(|e| CompanionError::Network(format!("TTS body read failed: {e}")))?;
        if bytes.is_empty() {
            return Err(CompanionError::Protocol("TTS returned empty audio".into()));
        }
        debug!("synthesized {} bytes of audio", bytes.len());
        Ok((bytes, content_type))
    }

    fn assign(&self, handle: AudioHandle) {
        let mut current = match self.current.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(previous) = current.replace(handle) {
            debug!("released superseded audio handle {}", previous.id);
        }
    }

    /// Release the retained handle if it is `id`.
    pub fn release(&self, id: u64) {
        let mut current = match self.current.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if current.as_ref().is_some_and(|h| h.id == id) {
            *current = None;
            debug!("released audio handle {id}");
        }
    }

    /// Id of the retained handle, if any.
    pub fn current_id(&self) -> Option<u64> {
        match self.current.lock() {
            Ok(guard) => guard.as_ref().map(|h| h.id),
            Err(poisoned) => poisoned.into_inner().as_ref().map(|h| h.id),
        }
    }

    /// Query the server's health route.
    ///
    /// # Errors
    ///
    /// Returns [`CompanionError::Network`] when the health check fails.
    pub async fn health(&self, endpoint: &str) -> Result<()> {
        let url = health_url(endpoint);
        let request = self.client.get(&url).send();
        let response = tokio::time::timeout(Duration::from_secs(self.config.timeout_secs), request)
            .await
            .map_err(|_| CompanionError::Network(format!("TTS health check timed out: {url}")))?
            .map_err(|e| CompanionError::Network(format!("TTS health check failed: {e}")))?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(CompanionError::Network(format!(
                "TTS health check returned HTTP {}",
                response.status()
            )))
        }
    }
}
