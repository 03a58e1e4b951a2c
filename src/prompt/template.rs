//! Turn-delimiter literals shared by the prompt builder and the sanitizer.
//!
//! The builder writes these tags into every prompt and the stop scan looks
//! for the same strings in model output, so both sides read them from here.

/// Opens a user turn.
pub const USER_TAG: &str = "<|user|>";

/// Opens an assistant turn. Generation starts right after it.
pub const ASSISTANT_TAG: &str = "<|assistant|>";

/// Terminates a turn.
pub const END_OF_TURN: &str = "</s>";

/// Separator between prompt blocks.
pub const BLOCK_SEPARATOR: &str = "\n\n";

/// Header of the few-shot block.
pub const EXAMPLES_HEADER: &str = "Examples:";

/// Default stop markers for on-device generation.
///
/// The bare `<` cuts any reply that contains a literal less-than sign. It
/// stays in the default list to match deployed behaviour; drop it via
/// `local.stop_markers` if that is too aggressive for a given model.
pub const DEFAULT_STOP_MARKERS: &[&str] = &[
    "<s/>",
    "</s",
    "<s",
    "<",
    "<<END>>",
    USER_TAG,
    ASSISTANT_TAG,
];

/// Static example exchanges for the few-shot block.
pub const FEW_SHOT_EXCHANGES: &[(&str, &str)] = &[
    (
        "What are you doing this weekend?",
        "Probably just watch the dust settle. It's quieter than going out.",
    ),
    (
        "I'm so excited, I bought a new game!",
        "*Another bright, loud world...* Hope the loading screens are short for you.",
    ),
    (
        "how to make fried rice?",
        "The oil always sizzles so loudly. It's... a lot. Why do you ask?",
    ),
];

/// Render one tagged turn: `{tag}\n{text}</s>`.
pub fn tagged_turn(tag: &str, text: &str) -> String {
    format!("{tag}\n{text}{END_OF_TURN}")
}

/// Render the open-ended final turn the backend completes.
///
/// Nothing follows the assistant tag.
pub fn final_turn(user_text: &str) -> String {
    format!("{USER_TAG}\n{user_text} {END_OF_TURN}\n{ASSISTANT_TAG}")
}
