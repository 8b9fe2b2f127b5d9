//! finlm: a small GPT stack built from scratch on flat f32 buffers.
//!
//! Byte-pair tokenizer → pre-LN decoder with an exact manual backward pass →
//! AdamW trainer with atomic, checksummed checkpoints → KV-cached generation
//! behind a library API, a CLI and a tiny HTTP endpoint.

pub mod config;
pub mod error;
pub mod rng;
pub mod ops;
pub mod tokenizer;
pub mod model;
pub mod forward;
pub mod backward;
pub mod kv_cache;
pub mod optimizer;
pub mod data;
pub mod checkpoint;
pub mod train;
pub mod sampling;
pub mod inference;
pub mod serve;
#[cfg(feature = "metal")]
pub mod accel;

pub use checkpoint::{Checkpoint, CheckpointId, CheckpointManager, CheckpointTag, Metrics, Selector};
pub use config::{GenerationConfig, ModelConfig, RunConfig, TokenizerConfig, TrainConfig, TruncationPolicy};
pub use error::{LmError, Result};
pub use inference::{Generation, GenerationSession, InferenceEngine, StopReason};
pub use kv_cache::KvCache;
pub use model::{GptModel, Parameters};
pub use sampling::SelectionPolicy;
pub use tokenizer::Tokenizer;
pub use train::{train_from_corpus, EvalReport, Phase, StepReport, TrainJob, TrainOutcome, TrainState, Trainer};
