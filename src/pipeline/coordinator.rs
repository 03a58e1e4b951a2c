//! Turn orchestrator: one user message in, one spoken (or shown) reply out.
//!
//! ```text
//! on_send ─▶ gate ─▶ log user ─▶ prompt ─▶ backend ─▶ clean ─▶ cap ─▶ TTS
//!                                                                    │
//!                        ┌───────── audio ──────────┬─── no audio ───┘
//!                        ▼                          ▼
//!          talk anim + log + playback      display delay + log
//!                        └──────────┬───────────────┘
//!                                   ▼
//!                     hide bubble, clear input, Ready
//! ```
//!
//! Only backend preparation can fail a turn. Generation and voice problems
//! degrade to the placeholder reply and the display-only path.

use crate::audio::{AudioSink, CpalAudioSink, PlaybackOutcome};
use crate::avatar::{AnimationDriver, TrackAnimator};
use crate::config::{CompanionConfig, EngineOptions, TimingConfig};
use crate::engine::cloud::CloudBackend;
use crate::engine::local::LocalBackend;
use crate::engine::mistral::MistralrsLoader;
use crate::engine::{EngineRegistry, GenerateOptions, GenerationBackend};
use crate::error::{CompanionError, Result};
use crate::history::store::JsonFileLogStore;
use crate::history::{ConversationLog, ConversationTurn, MemoryExclusion, TurnMeta, TurnRole};
use crate::pipeline::state::{BusyGuard, TurnGate, TurnPhase};
use crate::prompt::PromptBuilder;
use crate::runtime::{RuntimeEvent, TurnStatus};
use crate::sanitize::{Sanitizer, cap_sentences};
use crate::tts::{AudioHandle, TtsClient};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Bubble text while a reply is being produced.
pub const THINKING_BUBBLE: &str = "...thinking";
/// Bubble text after a failed turn.
pub const FAILURE_BUBBLE: &str = "...failed";

/// Why a message was not accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    /// Blank after trimming.
    Empty,
    /// Another turn holds the gate.
    Busy,
    /// Longer than the configured limit.
    TooLong,
}

/// How a call to [`TurnOrchestrator::on_send`] ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnOutcome {
    /// Nothing happened: no log entry, no status change.
    Rejected(RejectReason),
    /// A reply was produced; `spoken` is false on the display-only path.
    Replied { reply: String, spoken: bool },
    /// Backend preparation failed; an error turn was logged.
    Failed { message: String },
}

/// Runs conversation turns against the configured collaborators.
pub struct TurnOrchestrator {
    engines: EngineRegistry,
    tts: Arc<TtsClient>,
    audio: Arc<dyn AudioSink>,
    animator: Arc<dyn AnimationDriver>,
    log: Arc<Mutex<ConversationLog>>,
    sanitizer: Sanitizer,
    timing: TimingConfig,
    gate: Arc<TurnGate>,
    runtime_tx: Option<broadcast::Sender<RuntimeEvent>>,
}

impl std::fmt::Debug for TurnOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TurnOrchestrator")
            .field("engines", &self.engines)
            .field("phase", &self.gate.phase())
            .field("timing", &self.timing)
            .finish_non_exhaustive()
    }
}

impl TurnOrchestrator {
    /// Create an orchestrator over explicit collaborators.
    pub fn new(
        engines: EngineRegistry,
        tts: Arc<TtsClient>,
        audio: Arc<dyn AudioSink>,
        animator: Arc<dyn AnimationDriver>,
        log: ConversationLog,
    ) -> Self {
        Self {
            engines,
            tts,
            audio,
            animator,
            log: Arc::new(Mutex::new(log)),
            sanitizer: Sanitizer::default(),
            timing: TimingConfig::default(),
            gate: TurnGate::new(),
            runtime_tx: None,
        }
    }

    /// Wire up the production stack described by `config`.
    ///
    /// # Errors
    ///
    /// Returns an error if the config is invalid or the chat log directory
    /// cannot be created.
    pub fn from_config(config: &CompanionConfig) -> Result<Self> {
        config.validate()?;

        let log = if config.chat_log.enabled {
            let store =
                JsonFileLogStore::new(config.chat_log.resolved_dir(), &config.deployment_id)?;
            ConversationLog::hydrate(config.chat_log.capacity, Arc::new(store))
        } else {
            ConversationLog::new(config.chat_log.capacity).with_enabled(false)
        };

        let engines = EngineRegistry::new(
            Arc::new(CloudBackend::new(config.cloud.clone())),
            Arc::new(LocalBackend::new(
                config.local.clone(),
                Arc::new(MistralrsLoader),
            )),
        );

        info!(
            "companion '{}' ready: engine={}, chat log {} ({} entries)",
            config.deployment_id,
            config.ai.engine,
            if log.is_enabled() { "on" } else { "off" },
            log.len()
        );

        Ok(Self::new(
            engines,
            Arc::new(TtsClient::new(config.tts.clone())),
            Arc::new(CpalAudioSink::new(config.audio.clone())),
            Arc::new(TrackAnimator::new(config.avatar.clone())),
            log,
        )
        .with_sanitizer(Sanitizer::new(&config.sanitizer.role_names))
        .with_timing(config.timing.clone()))
    }

    /// Attach a runtime event broadcaster for UI/observability.
    pub fn with_runtime_events(mut self, tx: broadcast::Sender<RuntimeEvent>) -> Self {
        self.runtime_tx = Some(tx);
        self
    }

    pub fn with_sanitizer(mut self, sanitizer: Sanitizer) -> Self {
        self.sanitizer = sanitizer;
        self
    }

    pub fn with_timing(mut self, timing: TimingConfig) -> Self {
        self.timing = timing;
        self
    }

    pub fn phase(&self) -> TurnPhase {
        self.gate.phase()
    }

    pub fn is_busy(&self) -> bool {
        self.gate.is_busy()
    }

    /// Shared handle to the conversation log.
    pub fn log(&self) -> Arc<Mutex<ConversationLog>> {
        Arc::clone(&self.log)
    }

    pub fn engines(&self) -> &EngineRegistry {
        &self.engines
    }

    pub fn tts(&self) -> &Arc<TtsClient> {
        &self.tts
    }

    /// Handle one user message.
    ///
    /// Rejection (blank, too long, or busy) is decided before the first
    /// suspension point, so of two concurrent calls exactly one proceeds.
    pub async fn on_send(&self, input: &str, options: &EngineOptions) -> TurnOutcome {
        let text = input.trim();
        if text.is_empty() {
            return TurnOutcome::Rejected(RejectReason::Empty);
        }
        if text.chars().count() > self.timing.max_input_chars {
            debug!(
                "message rejected: {} chars exceeds {}",
                text.chars().count(),
                self.timing.max_input_chars
            );
            return TurnOutcome::Rejected(RejectReason::TooLong);
        }
        let Some(guard) = self.gate.try_acquire() else {
            debug!("message rejected: a turn is already in flight");
            return TurnOutcome::Rejected(RejectReason::Busy);
        };

        guard.enter(TurnPhase::Thinking);
        let user_id = self.append(ConversationTurn::new(
            TurnRole::User,
            text,
            TurnMeta::default(),
        ));
        self.emit(RuntimeEvent::Status(TurnStatus::Thinking));
        self.emit(RuntimeEvent::Bubble {
            text: THINKING_BUBBLE.to_owned(),
        });

        let backend = self.engines.select(&options.engine);
        match self
            .run_turn(&guard, backend.as_ref(), text, user_id, options)
            .await
        {
            Ok(outcome) => outcome,
            Err(e) => self.fail(&guard, backend.name(), e).await,
        }
    }

    /// [`Self::on_send`], abandoned as soon as `cancel` fires.
    ///
    /// Returns `None` when cancelled. The turn future is dropped, which
    /// releases the gate and returns the phase to idle; a held voice handle
    /// is released and `Ready` is emitted.
    pub async fn on_send_until_cancelled(
        &self,
        input: &str,
        options: &EngineOptions,
        cancel: &CancellationToken,
    ) -> Option<TurnOutcome> {
        tokio::select! {
            outcome = self.on_send(input, options) => Some(outcome),
            _ = cancel.cancelled() => {
                info!("turn cancelled");
                if let Some(id) = self.tts.current_id() {
                    self.tts.release(id);
                }
                self.emit(RuntimeEvent::Status(TurnStatus::Ready));
                None
            }
        }
    }

    /// Release backend resources.
    pub async fn dispose(&self) {
        self.engines.dispose_all().await;
        if let Some(id) = self.tts.current_id() {
            self.tts.release(id);
        }
    }

    async fn run_turn(
        &self,
        guard: &BusyGuard,
        backend: &dyn GenerationBackend,
        text: &str,
        user_id: Option<String>,
        options: &EngineOptions,
    ) -> Result<TurnOutcome> {
        backend.prepare().await?;

        let exclusion = match user_id {
            Some(id) => MemoryExclusion::Id(id),
            None => MemoryExclusion::Nothing,
        };
        let prompt = {
            let log = self.lock_log();
            PromptBuilder::new(options)
                .with_exclusion(exclusion)
                .build_turn(&log, text)
        };

        let raw = backend
            .generate(&prompt, &GenerateOptions::with_api_key(&options.api_key))
            .await;
        let reply = cap_sentences(&self.sanitizer.clean(raw.as_str()));
        debug!("reply from {}: {reply:?}", backend.name());

        let voice = self.tts.synthesize(&reply, &options.tts_endpoint).await;
        self.emit(RuntimeEvent::Bubble {
            text: reply.clone(),
        });

        let spoken = match voice {
            Some(handle) => {
                self.speak(guard, backend.name(), &reply, handle).await;
                true
            }
            None => {
                self.emit(RuntimeEvent::VoiceUnavailable);
                tokio::time::sleep(Duration::from_millis(self.timing.no_audio_display_ms)).await;
                self.append(ConversationTurn::new(
                    TurnRole::Assistant,
                    reply.as_str(),
                    TurnMeta {
                        engine: Some(backend.name().to_owned()),
                        tts_used: Some(false),
                    },
                ));
                false
            }
        };

        self.emit(RuntimeEvent::HideBubble {
            after: Duration::from_millis(self.timing.hide_bubble_ms),
        });
        self.emit(RuntimeEvent::ClearInput);
        self.emit(RuntimeEvent::Status(TurnStatus::Ready));
        Ok(TurnOutcome::Replied { reply, spoken })
    }

    async fn speak(&self, guard: &BusyGuard, engine: &str, reply: &str, handle: AudioHandle) {
        guard.enter(TurnPhase::Speaking);
        self.emit(RuntimeEvent::Status(TurnStatus::Speaking));
        self.animator.play_talk();
        self.append(ConversationTurn::new(
            TurnRole::Assistant,
            reply,
            TurnMeta {
                engine: Some(engine.to_owned()),
                tts_used: Some(true),
            },
        ));

        if let PlaybackOutcome::Failed(reason) = self.audio.play(&handle).await {
            warn!("playback failed, ending speech: {reason}");
        }

        self.animator.stop_talk();
        self.animator.return_to_idle();
        self.tts.release(handle.id);
    }

    async fn fail(&self, guard: &BusyGuard, engine: &str, e: CompanionError) -> TurnOutcome {
        error!("turn failed: {e}");
        guard.enter(TurnPhase::Failed);

        let message = e.message();
        self.append(ConversationTurn::new(
            TurnRole::Error,
            message.as_str(),
            TurnMeta {
                engine: Some(engine.to_owned()),
                tts_used: None,
            },
        ));
        self.emit(RuntimeEvent::Bubble {
            text: FAILURE_BUBBLE.to_owned(),
        });
        self.emit(RuntimeEvent::Status(TurnStatus::Error));

        let hold = Duration::from_millis(self.timing.failure_hide_ms);
        self.emit(RuntimeEvent::HideBubble { after: hold });
        // The gate stays held until the failure bubble is gone.
        tokio::time::sleep(hold).await;
        self.emit(RuntimeEvent::Status(TurnStatus::Ready));
        TurnOutcome::Failed { message }
    }

    fn append(&self, turn: ConversationTurn) -> Option<String> {
        let role = turn.role;
        let id = self.lock_log().append(turn);
        if id.is_some() {
            self.emit(RuntimeEvent::TurnLogged { role });
        }
        id
    }

    fn lock_log(&self) -> MutexGuard<'_, ConversationLog> {
        match self.log.lock() {
            Ok(log) => log,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn emit(&self, event: RuntimeEvent) {
        if let Some(tx) = &self.runtime_tx {
            let _ = tx.send(event);
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

    use super::*;
    use crate::config::TtsConfig;
    use crate::engine::GenerationResult;
    use async_trait::async_trait;

    struct Echo;

    #[async_trait]
    impl GenerationBackend for Echo {
        fn name(&self) -> &str {
            "echo"
        }

        async fn generate(&self, _prompt: &str, _options: &GenerateOptions) -> GenerationResult {
            GenerationResult::from_text("fine.")
        }
    }

    struct Silent;

    #[async_trait]
    impl AudioSink for Silent {
        async fn play(&self, _handle: &AudioHandle) -> PlaybackOutcome {
            PlaybackOutcome::Ended
        }
    }

    struct Still;

    impl AnimationDriver for Still {
        fn play_talk(&self) {}
        fn stop_talk(&self) {}
        fn return_to_idle(&self) {}
    }

    fn orchestrator() -> TurnOrchestrator {
        TurnOrchestrator::new(
            EngineRegistry::new(Arc::new(Echo), Arc::new(Echo)),
            Arc::new(TtsClient::new(TtsConfig::default())),
            Arc::new(Silent),
            Arc::new(Still),
            ConversationLog::new(10),
        )
    }

    #[tokio::test]
    async fn blank_input_is_rejected_without_side_effects() {
        let orch = orchestrator();
        let outcome = orch.on_send("   \n ", &EngineOptions::default()).await;
        assert_eq!(outcome, TurnOutcome::Rejected(RejectReason::Empty));
        assert!(orch.log().lock().unwrap().is_empty());
        assert_eq!(orch.phase(), TurnPhase::Idle);
    }

    #[tokio::test]
    async fn overlong_input_is_rejected() {
        let orch = orchestrator().with_timing(TimingConfig {
            max_input_chars: 5,
            ..TimingConfig::default()
        });
        let outcome = orch.on_send("far too long", &EngineOptions::default()).await;
        assert_eq!(outcome, TurnOutcome::Rejected(RejectReason::TooLong));
        assert!(orch.log().lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn held_gate_rejects_as_busy() {
        let orch = orchestrator();
        let _held = orch.gate.try_acquire().unwrap();
        let outcome = orch.on_send("hello", &EngineOptions::default()).await;
        assert_eq!(outcome, TurnOutcome::Rejected(RejectReason::Busy));
        assert!(orch.log().lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn unreachable_voice_falls_back_to_display_only() {
        let (tx, mut rx) = broadcast::channel(32);
        let orch = orchestrator().with_runtime_events(tx);
        let options = EngineOptions {
            tts_endpoint: "http://127.0.0.1:9/tts".into(),
            ..EngineOptions::default()
        };

        let outcome = orch.on_send("hello", &options).await;
        assert_eq!(
            outcome,
            TurnOutcome::Replied {
                reply: "fine.".into(),
                spoken: false
            }
        );
        assert!(!orch.is_busy());

        let log = orch.log();
        let log = log.lock().unwrap();
        let roles: Vec<TurnRole> = log.entries().iter().map(|t| t.role).collect();
        assert_eq!(roles, vec![TurnRole::User, TurnRole::Assistant]);
        assert_eq!(log.entries()[1].meta.tts_used, Some(false));
        assert_eq!(log.entries()[1].meta.engine.as_deref(), Some("echo"));

        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        assert!(events.contains(&RuntimeEvent::VoiceUnavailable));
        assert_eq!(events.last(), Some(&RuntimeEvent::Status(TurnStatus::Ready)));
    }
}
