//! Runtime events emitted by the turn pipeline for the UI.
//!
//! Events are small and cloneable; they travel on a
//! `tokio::sync::broadcast` channel so any number of frontends can follow
//! along. A lagging or absent receiver never blocks a turn.

use crate::history::TurnRole;
use std::time::Duration;

/// Coarse status for the UI's indicator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnStatus {
    Ready,
    Thinking,
    Speaking,
    Error,
}

impl TurnStatus {
    /// Wire name (`ready`, `thinking`, `speaking`, `error`).
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ready => "ready",
            Self::Thinking => "thinking",
            Self::Speaking => "speaking",
            Self::Error => "error",
        }
    }

    /// Human-facing label.
    pub fn label(self) -> &'static str {
        match self {
            Self::Ready => "Ready",
            Self::Thinking => "Thinking...",
            Self::Speaking => "Speaking...",
            Self::Error => "Error",
        }
    }
}

/// Events that describe what the pipeline is doing "right now".
#[derive(Debug, Clone, PartialEq)]
pub enum RuntimeEvent {
    /// Status indicator change.
    Status(TurnStatus),
    /// Show `text` in the speech bubble.
    Bubble { text: String },
    /// Hide the speech bubble after `after`.
    HideBubble { after: Duration },
    /// Clear the input field.
    ClearInput,
    /// The reply is shown without audio.
    VoiceUnavailable,
    /// A turn record was appended to the log.
    TurnLogged { role: TurnRole },
}
