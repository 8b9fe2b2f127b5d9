/* ------------------------------------------------------------------ */
/* Error taxonomy shared by every stage of the stack                   */
/* ------------------------------------------------------------------ */

use thiserror::Error;

pub type Result<T> = std::result::Result<T, LmError>;

#[derive(Error, Debug)]
pub enum LmError {
    /// Malformed caller input: empty prompt tokens, bad sampling parameters, ...
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Sequence longer than the model context under the active policy.
    #[error("sequence of {len} tokens exceeds context length {max}")]
    ContextOverflow { len: usize, max: usize },

    /// Non-finite loss or gradient. Fatal to the training run.
    #[error("non-finite {what} at step {step}: {value}")]
    NonFinite {
        what: &'static str,
        step: u64,
        value: f32,
    },

    #[error("checkpoint not found: {0}")]
    CheckpointNotFound(String),

    /// Published checkpoints are immutable; a second publish under the same id is refused.
    #[error("checkpoint {0} is already published")]
    CheckpointExists(String),

    #[error("checkpoint {id} is corrupt: {reason}")]
    CheckpointCorrupt { id: String, reason: String },

    /// Token id outside the loaded vocabulary.
    #[error("token id {id} outside vocabulary of size {vocab_size}")]
    TokenOutOfRange { id: usize, vocab_size: usize },

    /// Tokenizer and model were built for different vocabularies.
    #[error("tokenizer vocabulary ({tokenizer}) does not match model vocabulary ({model})")]
    VocabMismatch { tokenizer: usize, model: usize },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serde_json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl LmError {
    pub fn invalid(msg: impl Into<String>) -> Self {
        LmError::InvalidInput(msg.into())
    }

    pub fn corrupt(id: impl Into<String>, reason: impl Into<String>) -> Self {
        LmError::CheckpointCorrupt {
            id: id.into(),
            reason: reason.into(),
        }
    }
}
