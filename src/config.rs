//! Configuration types for the companion.
//!
//! Everything here is persisted as TOML. [`EngineOptions`] is the
//! user-editable part (engine, key, TTS endpoint, persona, memory,
//! few-shot) and is handed to the orchestrator by value on every turn; the
//! remaining sections are deployment settings read once at startup.

use crate::error::{CompanionError, Result};
use crate::prompt::template::DEFAULT_STOP_MARKERS;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Default persona text.
pub const DEFAULT_SYSTEM_PROMPT: &str = "You are \"Misaki\", an 18-year-old girl. Quiet, detached, soft voice. Sound tired.
Rules:
- Plain text only. No emojis. No markdown. No ASCII art. No role tags.
- No feelings or stage directions. No brackets. No quotes around the answer.";

/// Default speech synthesis endpoint (a local GPT-SoVITS style server).
pub const DEFAULT_TTS_ENDPOINT: &str = "http://127.0.0.1:9880/tts";

/// Lower bound for the memory window, in exchanges.
pub const MIN_MEMORY_TURNS: usize = 1;
/// Upper bound for the memory window, in exchanges.
pub const MAX_MEMORY_TURNS: usize = 50;

/// Environment variable consulted when no API key is configured.
pub const API_KEY_ENV: &str = "GEMINI_API_KEY";

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CompanionConfig {
    /// Keys durable storage (log file name).
    pub deployment_id: String,
    /// User-editable engine options.
    pub ai: EngineOptions,
    /// Cloud generation settings.
    pub cloud: CloudConfig,
    /// On-device generation settings.
    pub local: LocalModelConfig,
    /// Speech synthesis settings.
    pub tts: TtsConfig,
    /// Conversation log settings.
    pub chat_log: ChatLogConfig,
    /// Display and hide delays.
    pub timing: TimingConfig,
    /// Talk/idle animation names.
    pub avatar: AvatarConfig,
    /// Audio output settings.
    pub audio: AudioConfig,
    /// Reply sanitizer settings.
    pub sanitizer: SanitizerConfig,
}

impl Default for CompanionConfig {
    fn default() -> Self {
        Self {
            deployment_id: "misaki".to_owned(),
            ai: EngineOptions::default(),
            cloud: CloudConfig::default(),
            local: LocalModelConfig::default(),
            tts: TtsConfig::default(),
            chat_log: ChatLogConfig::default(),
            timing: TimingConfig::default(),
            avatar: AvatarConfig::default(),
            audio: AudioConfig::default(),
            sanitizer: SanitizerConfig::default(),
        }
    }
}

/// Per-turn options supplied by the UI.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineOptions {
    /// Backend name (`cloud`/`gemini` or `local`/`tflite`); unknown names
    /// select the cloud backend.
    pub engine: String,
    /// Cloud API key. Empty means "not configured".
    pub api_key: String,
    /// Speech synthesis endpoint URL.
    pub tts_endpoint: String,
    /// Persona / system prompt.
    pub system_prompt: String,
    /// Recent-history memory window.
    pub memory: MemoryOptions,
    /// Static example exchanges.
    pub few_shot: FewShotOptions,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            engine: "cloud".to_owned(),
            api_key: String::new(),
            tts_endpoint: DEFAULT_TTS_ENDPOINT.to_owned(),
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_owned(),
            memory: MemoryOptions::default(),
            few_shot: FewShotOptions::default(),
        }
    }
}

/// Memory window options.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryOptions {
    pub enabled: bool,
    /// Exchanges to remember; clamped to 1..=50 at use.
    pub turns: usize,
}

impl Default for MemoryOptions {
    fn default() -> Self {
        Self {
            enabled: false,
            turns: 10,
        }
    }
}

impl MemoryOptions {
    /// The configured window clamped to the supported range.
    pub fn effective_turns(&self) -> usize {
        self.turns.clamp(MIN_MEMORY_TURNS, MAX_MEMORY_TURNS)
    }
}

/// Few-shot block options.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FewShotOptions {
    pub enabled: bool,
}

/// Cloud (Gemini `generateContent`) backend settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CloudConfig {
    /// API root, without the `/models/...` suffix.
    pub base_url: String,
    pub model: String,
    pub temperature: f64,
    pub top_p: f64,
    pub max_output_tokens: u32,
    /// Bound on the whole request, in seconds.
    pub timeout_secs: u64,
    /// Threshold applied to every safety category.
    pub safety_threshold: String,
}

impl Default for CloudConfig {
    fn default() -> Self {
        Self {
            base_url: "https://generativelanguage.googleapis.com/v1beta".to_owned(),
            model: "gemini-1.5-flash".to_owned(),
            temperature: 0.7,
            top_p: 1.0,
            max_output_tokens: 192,
            timeout_secs: 30,
            safety_threshold: "BLOCK_MEDIUM_AND_ABOVE".to_owned(),
        }
    }
}

/// How the local backend consumes model output.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GenerationMode {
    /// Scan partial output for stop markers and resolve early.
    #[default]
    Streaming,
    /// Await the full completion.
    Atomic,
}

/// On-device model settings.
///
/// Fields the loader or sampler consume are part of the singleton's cache
/// key (see [`crate::engine::local::ModelKey`]).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LocalModelConfig {
    /// HuggingFace repo id or local directory holding the GGUF file.
    pub model_id: String,
    /// GGUF file name inside `model_id`.
    pub model_asset_path: String,
    /// Tokenizer source (empty = use the GGUF's embedded tokenizer).
    pub tokenizer_id: String,
    pub max_tokens: usize,
    pub temperature: f64,
    pub top_k: usize,
    pub top_p: f64,
    pub random_seed: u64,
    pub max_num_images: u32,
    pub support_audio: bool,
    pub mode: GenerationMode,
    /// Literal substrings that end the usable part of a completion.
    pub stop_markers: Vec<String>,
    /// Refuse to load without a GPU compute backend.
    pub require_gpu: bool,
    /// Bound on one generation call, in seconds.
    pub timeout_secs: u64,
    /// Render the prompt through the model's own chat template. Off by
    /// default: the composed prompt already carries the turn tags.
    pub apply_chat_template: bool,
}

impl Default for LocalModelConfig {
    fn default() -> Self {
        Self {
            model_id: "bartowski/Llama-3.2-1B-Instruct-GGUF".to_owned(),
            model_asset_path: "Llama-3.2-1B-Instruct-Q8_0.gguf".to_owned(),
            tokenizer_id: "unsloth/Llama-3.2-1B-Instruct".to_owned(),
            max_tokens: 512,
            temperature: 0.78,
            top_k: 64,
            top_p: 0.95,
            random_seed: 101,
            max_num_images: 0,
            support_audio: false,
            mode: GenerationMode::Streaming,
            stop_markers: DEFAULT_STOP_MARKERS.iter().map(|s| (*s).to_owned()).collect(),
            require_gpu: true,
            timeout_secs: 120,
            apply_chat_template: false,
        }
    }
}

/// Speech synthesis settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TtsConfig {
    pub timeout_secs: u64,
    /// Payload overrides layered over the built-in defaults. A `text`
    /// entry here is ignored; the reply text always wins.
    pub payload: serde_json::Map<String, serde_json::Value>,
}

impl Default for TtsConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 60,
            payload: serde_json::Map::new(),
        }
    }
}

/// Conversation log settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChatLogConfig {
    /// When false, turns are not recorded (and memory has nothing to read).
    pub enabled: bool,
    /// Maximum retained entries; oldest are dropped first.
    pub capacity: usize,
    /// Storage directory (None = platform data dir).
    pub dir: Option<PathBuf>,
}

impl Default for ChatLogConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            capacity: 500,
            dir: None,
        }
    }
}

impl ChatLogConfig {
    /// Resolved storage directory.
    pub fn resolved_dir(&self) -> PathBuf {
        self.dir.clone().unwrap_or_else(crate::paths::chat_log_dir)
    }
}

/// Delays applied by the orchestrator, in milliseconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    /// How long a reply stays up when there is no audio to wait for.
    pub no_audio_display_ms: u64,
    /// Bubble hide delay after a successful turn.
    pub hide_bubble_ms: u64,
    /// Bubble hide delay (and gate hold) after a failed turn.
    pub failure_hide_ms: u64,
    /// Longest accepted user message, in characters.
    pub max_input_chars: usize,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            no_audio_display_ms: 1200,
            hide_bubble_ms: 1000,
            failure_hide_ms: 1200,
            max_input_chars: 500,
        }
    }
}

/// Animation names and tracks used while speaking.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AvatarConfig {
    pub talk_mouth: String,
    pub talk_motion: String,
    pub mouth_track: usize,
    pub motion_track: usize,
    pub idle_animation: String,
    pub idle_track: usize,
    /// Mix duration when talk tracks are emptied, in seconds.
    pub talk_fade_secs: f32,
}

impl Default for AvatarConfig {
    fn default() -> Self {
        Self {
            talk_mouth: "Talk_01_A".to_owned(),
            talk_motion: "Talk_01_M".to_owned(),
            mouth_track: 7,
            motion_track: 8,
            idle_animation: "Idle_01".to_owned(),
            idle_track: 0,
            talk_fade_secs: 0.25,
        }
    }
}

/// Audio output configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    /// Output device name (None = system default).
    pub output_device: Option<String>,
    /// Linear gain applied to decoded samples.
    pub volume: f32,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            output_device: None,
            volume: 1.0,
        }
    }
}

/// Reply sanitizer settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SanitizerConfig {
    /// Speaker names stripped when they appear as `Name:` prefixes.
    pub role_names: Vec<String>,
}

impl Default for SanitizerConfig {
    fn default() -> Self {
        Self {
            role_names: vec!["User".to_owned(), "Misaki".to_owned()],
        }
    }
}

impl CompanionConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content).map_err(|e| CompanionError::Config(e.to_string()))
    }

    /// Save configuration to a TOML file, creating parent directories as needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written or the config cannot be serialized.
    pub fn save_to_file(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content =
            toml::to_string_pretty(self).map_err(|e| CompanionError::Config(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Returns the default config file path: `{config_dir}/config.toml`.
    pub fn default_config_path() -> PathBuf {
        crate::paths::config_dir().join("config.toml")
    }

    /// Load `path` if given, else the default path if it exists, else defaults.
    /// A blank API key is then filled from `GEMINI_API_KEY`.
    ///
    /// # Errors
    ///
    /// Returns an error if a config file exists but cannot be read or parsed.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => {
                let default_path = Self::default_config_path();
                if default_path.is_file() {
                    Self::from_file(&default_path)?
                } else {
                    Self::default()
                }
            }
        };
        if config.ai.api_key.trim().is_empty()
            && let Ok(key) = std::env::var(API_KEY_ENV)
        {
            config.ai.api_key = key;
        }
        Ok(config)
    }

    /// Reject settings the pipeline cannot run with.
    ///
    /// # Errors
    ///
    /// Returns [`CompanionError::Config`] describing the first problem found.
    pub fn validate(&self) -> Result<()> {
        if self.deployment_id.trim().is_empty() {
            return Err(CompanionError::Config("deployment_id must not be empty".into()));
        }
        url::Url::parse(&self.ai.tts_endpoint).map_err(|e| {
            CompanionError::Config(format!(
                "invalid TTS endpoint '{}': {e}",
                self.ai.tts_endpoint
            ))
        })?;
        url::Url::parse(&self.cloud.base_url).map_err(|e| {
            CompanionError::Config(format!("invalid cloud base_url '{}': {e}", self.cloud.base_url))
        })?;
        if self.chat_log.capacity == 0 {
            return Err(CompanionError::Config("chat_log.capacity must be at least 1".into()));
        }
        if self.local.stop_markers.iter().all(|m| m.is_empty()) {
            return Err(CompanionError::Config(
                "local.stop_markers needs at least one non-empty marker".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

    use super::*;

    #[test]
    fn defaults_are_sensible() {
        let config = CompanionConfig::default();
        assert_eq!(config.deployment_id, "misaki");
        assert_eq!(config.ai.tts_endpoint, DEFAULT_TTS_ENDPOINT);
        assert_eq!(config.cloud.max_output_tokens, 192);
        assert_eq!(config.cloud.timeout_secs, 30);
        assert_eq!(config.local.max_tokens, 512);
        assert_eq!(config.local.mode, GenerationMode::Streaming);
        assert!(!config.local.apply_chat_template);
        assert!(config.local.stop_markers.iter().any(|m| m == "<|user|>"));
        assert_eq!(config.chat_log.capacity, 500);
        assert!(config.chat_log.enabled);
        assert_eq!(config.timing.no_audio_display_ms, 1200);
        assert_eq!(config.avatar.mouth_track, 7);
        assert_eq!(config.avatar.motion_track, 8);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn memory_turns_are_clamped() {
        let mut memory = MemoryOptions::default();
        assert_eq!(memory.effective_turns(), 10);
        memory.turns = 0;
        assert_eq!(memory.effective_turns(), 1);
        memory.turns = 400;
        assert_eq!(memory.effective_turns(), 50);
    }

    #[test]
    fn toml_round_trip_preserves_overrides() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let mut config = CompanionConfig::default();
        config.ai.engine = "local".into();
        config.ai.memory = MemoryOptions {
            enabled: true,
            turns: 4,
        };
        config.local.mode = GenerationMode::Atomic;
        config
            .tts
            .payload
            .insert("speed_factor".into(), serde_json::json!(1.25));
        config.save_to_file(&path).unwrap();

        let loaded = CompanionConfig::from_file(&path).unwrap();
        assert_eq!(loaded.ai, config.ai);
        assert_eq!(loaded.local.mode, GenerationMode::Atomic);
        assert_eq!(
            loaded.tts.payload.get("speed_factor"),
            Some(&serde_json::json!(1.25))
        );
    }

    #[test]
    fn partial_toml_fills_defaults() {
        let config: CompanionConfig = toml::from_str(
            r#"
            deployment_id = "kiri"

            [ai]
            engine = "gemini"

            [local]
            stop_markers = ["<|user|>"]
            "#,
        )
        .unwrap();
        assert_eq!(config.deployment_id, "kiri");
        assert_eq!(config.ai.engine, "gemini");
        assert_eq!(config.ai.tts_endpoint, DEFAULT_TTS_ENDPOINT);
        assert_eq!(config.local.stop_markers, vec!["<|user|>".to_owned()]);
        assert_eq!(config.local.top_k, 64);
        assert!(!config.local.apply_chat_template);
    }

    #[test]
    fn from_file_invalid_toml_returns_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.toml");
        std::fs::write(&path, "this is not valid toml {{{").unwrap();
        let err = CompanionConfig::from_file(&path).unwrap_err();
        assert!(matches!(err, CompanionError::Config(_)));
    }

    #[test]
    fn validate_rejects_bad_endpoint_and_capacity() {
        let mut config = CompanionConfig::default();
        config.ai.tts_endpoint = "not a url".into();
        assert!(config.validate().is_err());

        let mut config = CompanionConfig::default();
        config.chat_log.capacity = 0;
        assert!(config.validate().is_err());

        let mut config = CompanionConfig::default();
        config.local.stop_markers.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn load_prefers_explicit_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("companion.toml");
        std::fs::write(&path, "deployment_id = \"sayaka\"\n[ai]\napi_key = \"from-file\"\n")
            .unwrap();
        let config = CompanionConfig::load(Some(&path)).unwrap();
        assert_eq!(config.deployment_id, "sayaka");
        assert_eq!(config.ai.api_key, "from-file");
    }
}
