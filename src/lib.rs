//! Companion: the conversation turn pipeline of a desktop character.
//!
//! One typed message becomes one short spoken reply:
//! User text → prompt → LLM backend → sanitizer → TTS → Speaker + animation
//!
//! # Architecture
//!
//! - **Prompt**: persona, recent-history memory and example exchanges in a
//!   turn-tagged template
//! - **Engine**: Gemini over HTTP or a local GGUF model via `mistralrs`
//! - **Sanitize**: strips markup, stage directions and role prefixes, caps
//!   the reply at two sentences
//! - **TTS**: a GPT-SoVITS-style HTTP endpoint returning an audio blob
//! - **Audio playback**: decodes with `symphonia`, plays via `cpal`
//! - **History**: a capacity-bounded turn log persisted as JSON
//!
//! [`TurnOrchestrator`] ties these together behind a single-flight gate.

pub mod audio;
pub mod avatar;
pub mod config;
pub mod engine;
pub mod error;
pub mod health;
pub mod history;
pub mod paths;
pub mod pipeline;
pub mod prompt;
pub mod runtime;
pub mod sanitize;
pub mod tts;

pub use config::{CompanionConfig, EngineOptions};
pub use error::{CompanionError, Result};
pub use history::{ConversationLog, ConversationTurn, TurnRole};
pub use pipeline::coordinator::{RejectReason, TurnOrchestrator, TurnOutcome};
pub use pipeline::state::TurnPhase;
pub use runtime::{RuntimeEvent, TurnStatus};
