//! Prompt assembly.
//!
//! A prompt is a list of typed [`Segment`]s rendered by one join rule:
//! persona, memory and examples form the system block (joined by a blank
//! line, empty segments skipped), and the final user turn is appended on its
//! own line with nothing after the assistant tag.

pub mod template;

use crate::config::{EngineOptions, FewShotOptions, MemoryOptions};
use crate::history::{ConversationLog, ConversationTurn, MemoryExclusion, TurnRole};
use template::{ASSISTANT_TAG, BLOCK_SEPARATOR, EXAMPLES_HEADER, FEW_SHOT_EXCHANGES, USER_TAG};

/// One typed piece of a prompt.
#[derive(Debug, Clone, PartialEq)]
pub enum Segment {
    /// Trimmed persona text.
    Persona(String),
    /// Recent history, oldest first.
    Memory(Vec<ConversationTurn>),
    /// Static few-shot exchanges.
    Examples,
    /// The message being answered.
    Turn(String),
}

impl Segment {
    /// Render this segment. Returns `None` for segments with no content.
    pub fn render(&self) -> Option<String> {
        match self {
            Self::Persona(text) => (!text.is_empty()).then(|| text.clone()),
            Self::Memory(turns) => {
                let lines: Vec<String> = turns
                    .iter()
                    .filter_map(|turn| {
                        let tag = match turn.role {
                            TurnRole::User => USER_TAG,
                            TurnRole::Assistant => ASSISTANT_TAG,
                            TurnRole::Error => return None,
                        };
                        Some(template::tagged_turn(tag, &collapse_whitespace(&turn.text)))
                    })
                    .collect();
                (!lines.is_empty()).then(|| lines.join("\n"))
            }
            Self::Examples => {
                let mut lines = Vec::with_capacity(FEW_SHOT_EXCHANGES.len() * 2);
                for (user, assistant) in FEW_SHOT_EXCHANGES {
                    lines.push(template::tagged_turn(USER_TAG, user));
                    lines.push(template::tagged_turn(ASSISTANT_TAG, assistant));
                }
                Some(format!("{EXAMPLES_HEADER}\n{}", lines.join("\n")))
            }
            Self::Turn(text) => Some(template::final_turn(text)),
        }
    }
}

/// Builds prompts from persona, memory and few-shot settings.
#[derive(Debug, Clone)]
pub struct PromptBuilder {
    system_prompt: String,
    memory: MemoryOptions,
    few_shot: FewShotOptions,
    exclusion: MemoryExclusion,
}

impl PromptBuilder {
    /// Create a builder from per-turn options.
    ///
    /// Memory excludes the newest log entry unless told otherwise via
    /// [`PromptBuilder::with_exclusion`].
    pub fn new(options: &EngineOptions) -> Self {
        Self {
            system_prompt: options.system_prompt.clone(),
            memory: options.memory,
            few_shot: options.few_shot,
            exclusion: MemoryExclusion::Latest,
        }
    }

    /// Choose which log entry is kept out of the memory window.
    pub fn with_exclusion(mut self, exclusion: MemoryExclusion) -> Self {
        self.exclusion = exclusion;
        self
    }

    /// The system-block segments, in order.
    pub fn segments(&self, log: &ConversationLog) -> Vec<Segment> {
        let mut segments = Vec::with_capacity(3);
        let persona = self.system_prompt.trim();
        if !persona.is_empty() {
            segments.push(Segment::Persona(persona.to_owned()));
        }
        if self.memory.enabled && !log.is_empty() {
            let turns = log.recent(self.memory.effective_turns(), &self.exclusion);
            if !turns.is_empty() {
                segments.push(Segment::Memory(turns));
            }
        }
        if self.few_shot.enabled {
            segments.push(Segment::Examples);
        }
        segments
    }

    /// Render the system block: persona, memory, examples.
    pub fn build(&self, log: &ConversationLog) -> String {
        join_segments(&self.segments(log))
    }

    /// Render the full generation-ready prompt for `user_text`.
    pub fn build_turn(&self, log: &ConversationLog, user_text: &str) -> String {
        compose(&self.build(log), user_text)
    }
}

/// Append the final turn to an already-built system block.
pub fn compose(system: &str, user_text: &str) -> String {
    let turn = Segment::Turn(user_text.to_owned()).render().unwrap_or_default();
    if system.is_empty() {
        turn
    } else {
        format!("{system}\n{turn}")
    }
}

fn join_segments(segments: &[Segment]) -> String {
    segments
        .iter()
        .filter_map(Segment::render)
        .collect::<Vec<_>>()
        .join(BLOCK_SEPARATOR)
}

fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

    use super::*;
    use crate::history::TurnMeta;

    fn options(memory: bool, few_shot: bool) -> EngineOptions {
        EngineOptions {
            system_prompt: "  You are Misaki.  ".into(),
            memory: MemoryOptions {
                enabled: memory,
                turns: 10,
            },
            few_shot: FewShotOptions { enabled: few_shot },
            ..EngineOptions::default()
        }
    }

    fn log_with(entries: &[(TurnRole, &str)]) -> ConversationLog {
        let mut log = ConversationLog::new(500);
        for (role, text) in entries {
            log.append(ConversationTurn::new(*role, *text, TurnMeta::default()));
        }
        log
    }

    #[test]
    fn persona_is_trimmed_and_alone_without_options() {
        let log = ConversationLog::new(10);
        let built = PromptBuilder::new(&options(false, false)).build(&log);
        assert_eq!(built, "You are Misaki.");
    }

    #[test]
    fn empty_persona_is_omitted() {
        let mut opts = options(false, true);
        opts.system_prompt = "   ".into();
        let built = PromptBuilder::new(&opts).build(&ConversationLog::new(10));
        assert!(built.starts_with("Examples:\n<|user|>\n"));
    }

    #[test]
    fn empty_log_omits_memory_block() {
        let builder = PromptBuilder::new(&options(true, false));
        let built = builder.build(&ConversationLog::new(10));
        assert_eq!(built, "You are Misaki.");
        assert!(!built.contains("\n\n"));
    }

    #[test]
    fn memory_excludes_message_being_answered() {
        let log = log_with(&[
            (TurnRole::User, "hi"),
            (TurnRole::Assistant, "hey"),
            (TurnRole::User, "current"),
        ]);
        let built = PromptBuilder::new(&options(true, false)).build(&log);
        assert_eq!(
            built,
            "You are Misaki.\n\n<|user|>\nhi</s>\n<|assistant|>\nhey</s>"
        );
        assert!(!built.contains("current"));
    }

    #[test]
    fn memory_exclusion_by_id_matches_latest() {
        let log = log_with(&[
            (TurnRole::User, "hi"),
            (TurnRole::Assistant, "hey"),
            (TurnRole::User, "current"),
        ]);
        let id = log.entries().last().unwrap().id.clone();
        let by_latest = PromptBuilder::new(&options(true, false)).build(&log);
        let by_id = PromptBuilder::new(&options(true, false))
            .with_exclusion(MemoryExclusion::Id(id))
            .build(&log);
        assert_eq!(by_latest, by_id);
    }

    #[test]
    fn memory_skips_error_entries_and_collapses_whitespace() {
        let log = log_with(&[
            (TurnRole::User, "tell me\n  something"),
            (TurnRole::Error, "network down"),
            (TurnRole::User, "current"),
        ]);
        let built = PromptBuilder::new(&options(true, false)).build(&log);
        assert!(built.contains("<|user|>\ntell me something</s>"));
        assert!(!built.contains("network down"));
    }

    #[test]
    fn blocks_join_in_order() {
        let log = log_with(&[(TurnRole::User, "hi"), (TurnRole::User, "current")]);
        let built = PromptBuilder::new(&options(true, true)).build(&log);
        let persona = built.find("You are Misaki.").unwrap();
        let memory = built.find("<|user|>\nhi</s>").unwrap();
        let examples = built.find("Examples:").unwrap();
        assert!(persona < memory && memory < examples);
        assert!(built.contains("</s>\n\nExamples:\n<|user|>\nWhat are you doing this weekend?</s>"));
    }

    #[test]
    fn final_turn_ends_at_assistant_tag() {
        let builder = PromptBuilder::new(&options(false, false));
        let prompt = builder.build_turn(&ConversationLog::new(10), "hello");
        assert_eq!(
            prompt,
            "You are Misaki.\n<|user|>\nhello </s>\n<|assistant|>"
        );
        assert!(prompt.ends_with(ASSISTANT_TAG));
    }

    #[test]
    fn compose_without_system_has_no_leading_newline() {
        assert_eq!(compose("", "yo"), "<|user|>\nyo </s>\n<|assistant|>");
    }
}
