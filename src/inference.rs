/* ------------------------------------------------------------------ */
/* KV-cached autoregressive generation                                */
/* ------------------------------------------------------------------ */
//
// Protocol per request: [<bos>] + encode(prompt) → prompt-length policy →
// one prefill → loop { select; stop on <eos> or max_tokens; forward_step }.
// The engine only shares read-only weights; every request owns its cache.

use std::path::Path;
use std::sync::Arc;

use log::debug;
use serde::{Deserialize, Serialize};

use crate::checkpoint::{CheckpointManager, Selector};
use crate::config::{GenerationConfig, TruncationPolicy};
use crate::error::{LmError, Result};
use crate::kv_cache::KvCache;
use crate::model::GptModel;
use crate::rng::Rng;
use crate::sampling::SelectionPolicy;
use crate::tokenizer::{Tokenizer, BOS_ID, EOS_ID};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// The model selected `<eos>` (not included in the output).
    Eos,
    MaxTokens,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Generation {
    pub text:          String,
    /// Generated ids, excluding the prompt and any `<eos>`.
    pub tokens:        Vec<usize>,
    /// Prompt length fed to the model, `<bos>` included, after truncation.
    pub prompt_tokens: usize,
    /// Prompt tokens dropped by `TruncationPolicy::KeepLatest`.
    pub truncated:     usize,
    pub stop:          StopReason,
}

/// One in-flight generation: its cache, its rng and the logits for the next position.
pub struct GenerationSession<'m> {
    model:  &'m GptModel,
    cache:  KvCache,
    rng:    Rng,
    logits: Vec<f32>,
}

impl<'m> GenerationSession<'m> {
    /// Prefill `prompt` into a fresh cache.
    pub fn start(model: &'m GptModel, prompt: &[usize], seed: u64) -> Result<Self> {
        let mut cache = KvCache::new(model.config());
        let logits = model.prefill(prompt, &mut cache)?;
        Ok(Self { model, cache, rng: Rng::new(seed), logits })
    }

    pub fn logits(&self) -> &[f32] { &self.logits }
    pub fn cache(&self) -> &KvCache { &self.cache }
    pub fn position(&self) -> usize { self.cache.len() }

    pub fn select(&mut self, policy: &SelectionPolicy) -> usize {
        policy.select(&self.logits, &mut self.rng)
    }

    /// Run `token` through the model; the cache grows by one position.
    pub fn feed(&mut self, token: usize) -> Result<()> {
        self.logits = self.model.forward_step(token, &mut self.cache)?;
        Ok(())
    }
}

#[derive(Clone)]
pub struct InferenceEngine {
    model:     Arc<GptModel>,
    tokenizer: Arc<Tokenizer>,
    config:    GenerationConfig,
}

impl InferenceEngine {
    pub fn new(model: Arc<GptModel>, tokenizer: Arc<Tokenizer>, config: GenerationConfig) -> Result<Self> {
        let (tok_v, model_v) = (tokenizer.vocab_size(), model.config().vocab_size);
        if tok_v != model_v {
            return Err(LmError::VocabMismatch { tokenizer: tok_v, model: model_v });
        }
        Ok(Self { model, tokenizer, config })
    }

    pub fn from_checkpoint(
        dir: impl AsRef<Path>,
        selector: &Selector,
        tokenizer_path: impl AsRef<Path>,
        config: GenerationConfig,
    ) -> Result<Self> {
        let manager = CheckpointManager::open(dir)?;
        let ckpt = manager.load(selector)?;
        debug!("loaded {} (step {}) for inference", ckpt.id, ckpt.step);
        let tokenizer = Tokenizer::load(tokenizer_path)?;
        let model = GptModel::from_parameters(ckpt.model_config, ckpt.params)?;
        Self::new(Arc::new(model), Arc::new(tokenizer), config)
    }

    pub fn model(&self) -> &GptModel { &self.model }
    pub fn tokenizer(&self) -> &Tokenizer { &self.tokenizer }
    pub fn config(&self) -> &GenerationConfig { &self.config }

    /// Configured `max_tokens`, capped to what the context length allows.
    pub fn default_max_tokens(&self) -> usize {
        self.config.max_tokens.min(self.model.config().block_size.saturating_sub(1))
    }

    /// `[<bos>] + encode(prompt)`, shortened or rejected so that
    /// `prompt + max_tokens <= block_size`. Returns the ids and how many were dropped.
    pub fn prepare_prompt(&self, prompt: &str, max_tokens: usize) -> Result<(Vec<usize>, usize)> {
        let block = self.model.config().block_size;
        if max_tokens >= block {
            return Err(LmError::invalid(format!(
                "max_tokens ({max_tokens}) must be smaller than the context length ({block})"
            )));
        }
        let mut ids = self.tokenizer.encode_with_specials(prompt, true, false);
        let budget = block - max_tokens;
        if ids.len() <= budget {
            return Ok((ids, 0));
        }
        match self.config.truncation {
            TruncationPolicy::Reject => Err(LmError::ContextOverflow { len: ids.len() + max_tokens, max: block }),
            TruncationPolicy::KeepLatest => {
                let dropped = ids.len() - budget;
                ids.drain(1..1 + dropped);
                debug_assert_eq!(ids[0], BOS_ID);
                Ok((ids, dropped))
            }
        }
    }

    pub fn generate(&self, prompt: &str, max_tokens: usize, policy: &SelectionPolicy, seed: u64) -> Result<Generation> {
        self.generate_streaming(prompt, max_tokens, policy, seed, |_| {})
    }

    /// Like `generate`, calling `on_token` with the text of every generated token as it is produced.
    pub fn generate_streaming<F>(
        &self,
        prompt: &str,
        max_tokens: usize,
        policy: &SelectionPolicy,
        seed: u64,
        mut on_token: F,
    ) -> Result<Generation>
    where
        F: FnMut(&str),
    {
        policy.validate()?;
        let (ids, truncated) = self.prepare_prompt(prompt, max_tokens)?;
        let prompt_tokens = ids.len();
        if truncated > 0 {
            debug!("prompt truncated: dropped {truncated} oldest tokens");
        }

        let mut tokens = Vec::with_capacity(max_tokens);
        let mut text = String::new();
        let mut stop = StopReason::MaxTokens;

        if max_tokens > 0 {
            let mut session = GenerationSession::start(&self.model, &ids, seed)?;
            loop {
                let next = session.select(policy);
                if next == EOS_ID {
                    stop = StopReason::Eos;
                    break;
                }
                let piece = self.tokenizer.decode_token(next)?;
                on_token(piece);
                text.push_str(piece);
                tokens.push(next);
                if tokens.len() == max_tokens {
                    break;
                }
                session.feed(next)?;
            }
        }

        Ok(Generation { text, tokens, prompt_tokens, truncated, stop })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ModelConfig, TokenizerConfig};

    const CORPUS: &str = "the cat sat on the mat\n\nthe dog sat on the log\n\na cat and a dog";

    fn engine(block_size: usize, truncation: TruncationPolicy) -> InferenceEngine {
        let tok = Tokenizer::train(CORPUS, &TokenizerConfig { vocab_size: 40, min_frequency: 2 }).unwrap();
        let cfg = ModelConfig { vocab_size: tok.vocab_size(), n_embd: 8, n_head: 2, n_layer: 2, block_size };
        let model = GptModel::new(cfg, &mut Rng::new(11)).unwrap();
        let gen = GenerationConfig { truncation, max_tokens: 4 };
        InferenceEngine::new(Arc::new(model), Arc::new(tok), gen).unwrap()
    }

    #[test]
    fn vocabulary_mismatch_is_rejected() {
        let tok = Tokenizer::train(CORPUS, &TokenizerConfig::default()).unwrap();
        let cfg = ModelConfig { vocab_size: tok.vocab_size() + 1, n_embd: 8, n_head: 2, n_layer: 1, block_size: 8 };
        let model = GptModel::new(cfg, &mut Rng::new(1)).unwrap();
        let err = InferenceEngine::new(Arc::new(model), Arc::new(tok), GenerationConfig::default()).err();
        assert!(matches!(err, Some(LmError::VocabMismatch { .. })));
    }

    #[test]
    fn greedy_generation_matches_full_recompute() {
        let e = engine(24, TruncationPolicy::KeepLatest);
        let g = e.generate("the cat", 6, &SelectionPolicy::Greedy, 0).unwrap();
        assert!(g.tokens.len() <= 6);
        assert_eq!(g, e.generate("the cat", 6, &SelectionPolicy::Greedy, 99).unwrap());

        let (mut seq, _) = e.prepare_prompt("the cat", 6).unwrap();
        for &t in &g.tokens {
            let logits = e.model().forward(&seq).unwrap();
            assert_eq!(crate::sampling::argmax(logits.last().unwrap()), t);
            seq.push(t);
        }
        assert_eq!(g.text, e.tokenizer().decode(&g.tokens).unwrap());
    }

    #[test]
    fn cache_grows_by_one_per_step() {
        let e = engine(16, TruncationPolicy::KeepLatest);
        let (ids, _) = e.prepare_prompt("a dog", 4).unwrap();
        let mut s = GenerationSession::start(e.model(), &ids, 3).unwrap();
        assert_eq!(s.position(), ids.len());
        for t in 1..=3 {
            let next = s.select(&SelectionPolicy::Temperature { temperature: 1.0 });
            s.feed(next).unwrap();
            assert_eq!(s.position(), ids.len() + t);
        }
    }

    #[test]
    fn long_prompts_follow_the_truncation_policy() {
        let long = "the cat sat on the mat the dog sat on the log";
        let keep = engine(12, TruncationPolicy::KeepLatest);
        let (ids, dropped) = keep.prepare_prompt(long, 4).unwrap();
        assert_eq!(ids.len(), 8);
        assert_eq!(ids[0], BOS_ID);
        let full = keep.tokenizer().encode(long);
        assert_eq!(&ids[1..], &full[full.len() - 7..]);
        assert_eq!(dropped, full.len() - 7);
        let g = keep.generate(long, 4, &SelectionPolicy::Greedy, 0).unwrap();
        assert_eq!((g.prompt_tokens, g.truncated), (8, dropped));

        let reject = engine(12, TruncationPolicy::Reject);
        let err = reject.generate(long, 4, &SelectionPolicy::Greedy, 0).unwrap_err();
        assert!(matches!(err, LmError::ContextOverflow { max: 12, .. }));
    }

    #[test]
    fn max_tokens_must_leave_room_for_the_prompt() {
        let e = engine(8, TruncationPolicy::KeepLatest);
        let err = e.generate("cat", 8, &SelectionPolicy::Greedy, 0).unwrap_err();
        assert!(matches!(err, LmError::InvalidInput(_)));
        let none = e.generate("cat", 0, &SelectionPolicy::Greedy, 0).unwrap();
        assert!(none.tokens.is_empty());
        assert_eq!(none.stop, StopReason::MaxTokens);
    }

    // Final LN gain 0 and bias 1 make every position's features all-ones, so
    // logits are the lm_head row sums: `eos_bias` per feature for <eos>, 0 elsewhere.
    fn eos_engine(eos_bias: f32) -> InferenceEngine {
        let tok = Tokenizer::train(CORPUS, &TokenizerConfig { vocab_size: 40, min_frequency: 2 }).unwrap();
        let cfg = ModelConfig { vocab_size: tok.vocab_size(), n_embd: 8, n_head: 2, n_layer: 1, block_size: 24 };
        let mut model = GptModel::new(cfg, &mut Rng::new(2)).unwrap();
        let p = model.params_mut();
        p.lnf_g.fill(0.0);
        p.lnf_b.fill(1.0);
        p.lm_head.fill(0.0);
        p.lm_head[EOS_ID * 8..(EOS_ID + 1) * 8].fill(eos_bias);
        InferenceEngine::new(Arc::new(model), Arc::new(tok), GenerationConfig::default()).unwrap()
    }

    #[test]
    fn eos_ends_generation_early_and_is_not_emitted() {
        let e = eos_engine(1.0);
        let g = e.generate("the cat", 10, &SelectionPolicy::Greedy, 0).unwrap();
        assert_eq!(g.stop, StopReason::Eos);
        assert!(g.tokens.is_empty());
        assert_eq!(g.text, "");

        // <eos> likely but not certain: short only when it was drawn
        let e = eos_engine(0.4);
        let policy = SelectionPolicy::Temperature { temperature: 1.0 };
        let runs: Vec<Generation> = (0..24).map(|seed| e.generate("the dog", 10, &policy, seed).unwrap()).collect();
        for g in &runs {
            assert_eq!(g.stop == StopReason::Eos, g.tokens.len() < 10);
            assert!(!g.tokens.contains(&EOS_ID));
            assert_eq!(g.text, e.tokenizer().decode(&g.tokens).unwrap());
        }
        assert!(runs.iter().any(|g| g.stop == StopReason::Eos && !g.tokens.is_empty()));
    }

    #[test]
    fn streaming_pieces_concatenate_to_the_text() {
        let e = engine(20, TruncationPolicy::KeepLatest);
        let policy = SelectionPolicy::TopK { k: 5, temperature: 1.2 };
        let mut streamed = String::new();
        let g = e.generate_streaming("the", 8, &policy, 7, |p| streamed.push_str(p)).unwrap();
        assert_eq!(streamed, g.text);
        assert_eq!(g, e.generate("the", 8, &policy, 7).unwrap());
        if g.stop == StopReason::MaxTokens {
            assert_eq!(g.tokens.len(), 8);
        }
    }
}
