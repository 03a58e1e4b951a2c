//! Conversation turn pipeline: single-flight gate and orchestrator.

pub mod coordinator;
pub mod state;
