/* ------------------------------------------------------------------ */
/* Training: state machine, train step, evaluation, run loop          */
/* ------------------------------------------------------------------ */

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::{info, warn};
use rayon::prelude::*;

use crate::checkpoint::{BackgroundWriter, CheckpointId, CheckpointManager, CheckpointTag, Metrics, Selector};
use crate::config::{ModelConfig, TokenizerConfig, TrainConfig};
use crate::data::{self, Batch, Dataset, Example, Prefetcher};
use crate::error::{LmError, Result};
use crate::model::{GptModel, Parameters};
use crate::ops::cross_entropy_fwd;
use crate::optimizer::{adamw_step, clip_grad_norm, AdamWConfig, LrSchedule, OptimizerState};
use crate::rng::Rng;
use crate::tokenizer::{Tokenizer, PAD_ID};

const PREFETCH_DEPTH: usize = 4;

/* ------------------------------------------------------------------ */
/* State                                                              */
/* ------------------------------------------------------------------ */

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// No update applied yet.
    Init,
    Warmup,
    Anneal,
    Done,
}

impl Phase {
    pub fn at(step: u64, cfg: &TrainConfig) -> Phase {
        if step >= cfg.max_steps {
            Phase::Done
        } else if step == 0 {
            Phase::Init
        } else if step < cfg.warmup_steps {
            Phase::Warmup
        } else {
            Phase::Anneal
        }
    }
}

/// Everything besides the weights that a training step reads and advances.
#[derive(Debug, Clone, PartialEq)]
pub struct TrainState {
    pub optimizer:     OptimizerState,
    pub best_val_loss: Option<f32>,
    pub seed:          u64,
}

impl TrainState {
    pub fn new(model_config: &ModelConfig, seed: u64) -> Self {
        Self { optimizer: OptimizerState::new(model_config), best_val_loss: None, seed }
    }

    /// Number of completed steps.
    pub fn step(&self) -> u64 { self.optimizer.step }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StepReport {
    /// Step index after the update (1 for the first step).
    pub step:      u64,
    pub loss:      f32,
    /// Global gradient norm before clipping.
    pub grad_norm: f32,
    pub lr:        f32,
    pub tokens:    usize,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EvalReport {
    /// Mean cross-entropy per counted token; NaN when nothing was evaluated.
    pub loss:       f32,
    pub perplexity: f32,
    pub tokens:     usize,
    pub skipped:    usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TrainOutcome {
    pub final_step:    u64,
    pub train_loss:    Option<f32>,
    pub last_eval:     Option<EvalReport>,
    pub best_val_loss: Option<f32>,
    pub stopped_early: bool,
    pub checkpoints:   Vec<CheckpointId>,
}

/* ------------------------------------------------------------------ */
/* Loss                                                               */
/* ------------------------------------------------------------------ */

// Cross-entropy summed over non-pad targets. When `d_logits` is given it
// receives scale · (softmax − onehot) at counted positions (zero elsewhere).
fn sequence_loss(
    logits: &[f32],
    targets: &[usize],
    vocab_size: usize,
    scale: f32,
    mut d_logits: Option<&mut [f32]>,
) -> Result<(f64, usize)> {
    let v = vocab_size;
    let mut probs = vec![0.0f32; v];
    let mut sum = 0.0f64;
    let mut count = 0usize;
    for (pos, &target) in targets.iter().enumerate() {
        if target == PAD_ID {
            continue;
        }
        if target >= v {
            return Err(LmError::TokenOutOfRange { id: target, vocab_size: v });
        }
        let row = &logits[pos * v..(pos + 1) * v];
        sum += cross_entropy_fwd(row, target, &mut probs) as f64;
        count += 1;
        if let Some(d) = d_logits.as_deref_mut() {
            let dr = &mut d[pos * v..(pos + 1) * v];
            dr.iter_mut().zip(probs.iter()).for_each(|(g, p)| *g = p * scale);
            dr[target] -= scale;
        }
    }
    Ok((sum, count))
}

fn example_grads(model: &GptModel, ex: &Example, scale: f32) -> Result<(f64, Parameters)> {
    let (logits, acts) = model.forward_train(&ex.inputs)?;
    let mut d_logits = vec![0.0f32; logits.len()];
    let (loss, _) = sequence_loss(&logits, &ex.targets, model.config().vocab_size, scale, Some(d_logits.as_mut_slice()))?;
    Ok((loss, model.backward(&ex.inputs, &acts, &d_logits)))
}

fn example_loss(model: &GptModel, ex: &Example) -> Result<(f64, usize)> {
    let (logits, _) = model.forward_train(&ex.inputs)?;
    sequence_loss(&logits, &ex.targets, model.config().vocab_size, 1.0, None)
}

/* ------------------------------------------------------------------ */
/* One optimisation step                                              */
/* ------------------------------------------------------------------ */

/// Forward + backward over `batch`, global-norm clip, AdamW update.
///
/// The loss is the mean over every non-pad target in the batch. Examples run
/// in parallel; their gradients are summed in batch order so the result does
/// not depend on thread scheduling.
pub fn train_step(
    model: &mut GptModel,
    mut state: TrainState,
    batch: &Batch,
    cfg: &TrainConfig,
) -> Result<(TrainState, StepReport)> {
    let step = state.optimizer.step;
    let tokens: usize = batch.examples.iter().map(Example::counted).sum();
    if tokens == 0 {
        return Err(LmError::invalid("batch has no target tokens"));
    }
    let scale = 1.0 / tokens as f32;

    let model_ref = &*model;
    let results: Vec<(f64, Parameters)> = batch
        .examples
        .par_iter()
        .map(|ex| example_grads(model_ref, ex, scale))
        .collect::<Result<_>>()?;

    let mut results = results.into_iter();
    let (mut loss_sum, mut grads) = match results.next() {
        Some(first) => first,
        None => return Err(LmError::invalid("empty batch")),
    };
    for (loss, g) in results {
        loss_sum += loss;
        grads.add_assign(&g);
    }

    let loss = (loss_sum / tokens as f64) as f32;
    if !loss.is_finite() {
        return Err(LmError::NonFinite { what: "loss", step, value: loss });
    }

    let grad_norm = clip_grad_norm(&mut grads, cfg.grad_clip);
    if !grad_norm.is_finite() {
        return Err(LmError::NonFinite { what: "gradient norm", step, value: grad_norm });
    }

    let lr = LrSchedule::from(cfg).lr_at(step);
    adamw_step(model.params_mut(), &grads, &mut state.optimizer, lr, &AdamWConfig::from(cfg));

    let report = StepReport { step: state.optimizer.step, loss, grad_norm, lr, tokens };
    Ok((state, report))
}

/* ------------------------------------------------------------------ */
/* Evaluation                                                         */
/* ------------------------------------------------------------------ */

/// Mean loss and perplexity over `batches`. A batch that fails (for example
/// an id outside the model vocabulary) is logged and skipped.
pub fn evaluate(model: &GptModel, batches: &[Batch]) -> EvalReport {
    let mut sum = 0.0f64;
    let mut tokens = 0usize;
    let mut skipped = 0usize;

    for (i, batch) in batches.iter().enumerate() {
        let res: Result<Vec<(f64, usize)>> =
            batch.examples.par_iter().map(|ex| example_loss(model, ex)).collect();
        match res {
            Ok(parts) => {
                for (l, n) in parts {
                    sum += l;
                    tokens += n;
                }
            }
            Err(e) => {
                warn!("skipping evaluation batch {i}: {e}");
                skipped += 1;
            }
        }
    }

    let loss = if tokens > 0 { (sum / tokens as f64) as f32 } else { f32::NAN };
    EvalReport { loss, perplexity: loss.exp(), tokens, skipped }
}

/* ------------------------------------------------------------------ */
/* Run loop                                                           */
/* ------------------------------------------------------------------ */

enum BatchSource {
    Prefetch(Prefetcher),
    Inline(Arc<Dataset>),
}

impl BatchSource {
    fn next(&mut self, step: u64, batch_size: usize, seed: u64) -> Batch {
        match self {
            BatchSource::Prefetch(p) => p.next(step),
            BatchSource::Inline(d) => d.batch_for_step(step, batch_size, seed),
        }
    }
}

pub struct Trainer {
    cfg:         TrainConfig,
    train:       Arc<Dataset>,
    val:         Dataset,
    checkpoints: Option<Arc<CheckpointManager>>,
    stop:        Option<Arc<AtomicBool>>,
}

impl Trainer {
    pub fn new(cfg: TrainConfig, train: Dataset, val: Dataset) -> Result<Self> {
        cfg.validate()?;
        if train.is_empty() {
            return Err(LmError::invalid("training set is empty"));
        }
        Ok(Self { cfg, train: Arc::new(train), val, checkpoints: None, stop: None })
    }

    pub fn with_checkpoints(mut self, manager: Arc<CheckpointManager>) -> Self {
        self.checkpoints = Some(manager);
        self
    }

    /// Checked after every step; when set, a regular checkpoint is saved and the run returns.
    pub fn with_stop_flag(mut self, flag: Arc<AtomicBool>) -> Self {
        self.stop = Some(flag);
        self
    }

    pub fn config(&self) -> &TrainConfig { &self.cfg }

    pub fn evaluate(&self, model: &GptModel) -> EvalReport {
        evaluate(model, &self.val.eval_batches(self.cfg.batch_size, self.cfg.eval_batches))
    }

    pub fn run(&self, model: &mut GptModel, mut state: TrainState) -> Result<(TrainState, TrainOutcome)> {
        let cfg = &self.cfg;
        let start = state.step();
        let seed = state.seed;

        info!("=== Training ===");
        if start > 0 { info!("Resuming from step {start}"); }
        info!("Steps: {} → {}", start, cfg.max_steps);
        info!("Batch size: {} | windows: {} train / {} val", cfg.batch_size, self.train.len(), self.val.len());
        info!("Learning rate: {} → {} (warmup {})", cfg.peak_lr, cfg.min_lr, cfg.warmup_steps);
        info!("Gradient clipping: {} | cores: {}", cfg.grad_clip, rayon::current_num_threads());

        let mut source = if cfg.prefetch && start < cfg.max_steps {
            BatchSource::Prefetch(Prefetcher::spawn(
                Arc::clone(&self.train),
                start..cfg.max_steps,
                cfg.batch_size,
                seed,
                PREFETCH_DEPTH,
            ))
        } else {
            BatchSource::Inline(Arc::clone(&self.train))
        };
        let writer = self.checkpoints.as_ref().map(|m| BackgroundWriter::spawn(Arc::clone(m)));
        let keep_last = (cfg.keep_last > 0).then_some(cfg.keep_last);

        let mut outcome = TrainOutcome {
            final_step:    start,
            train_loss:    None,
            last_eval:     None,
            best_val_loss: state.best_val_loss,
            stopped_early: false,
            checkpoints:   Vec::new(),
        };
        let mut last_saved = None;

        for step in start..cfg.max_steps {
            let batch = source.next(step, cfg.batch_size, seed);
            let (next, report) = train_step(model, state, &batch, cfg)?;
            state = next;
            let done = report.step;
            outcome.train_loss = Some(report.loss);

            let mut val_now = None;
            let eval_due = cfg.eval_interval > 0 && (done % cfg.eval_interval == 0 || done == cfg.max_steps);
            if eval_due && !self.val.is_empty() {
                let ev = self.evaluate(model);
                outcome.last_eval = Some(ev);
                if ev.tokens > 0 && ev.loss.is_finite() {
                    val_now = Some(ev.loss);
                    let improved = state.best_val_loss.map_or(true, |b| ev.loss < b);
                    if improved {
                        state.best_val_loss = Some(ev.loss);
                    }
                    info!(
                        "Iter {:5} | Loss: {:.4} | Val: {:.4} (ppl {:.1}) | LR: {:.6} | Best: {:.4}",
                        done, report.loss, ev.loss, ev.perplexity, report.lr,
                        state.best_val_loss.unwrap_or(ev.loss)
                    );
                    if improved {
                        if let Some(w) = &writer {
                            let metrics = Metrics {
                                train_loss:    Some(report.loss),
                                val_loss:      Some(ev.loss),
                                best_val_loss: state.best_val_loss,
                            };
                            w.submit(model.params(), &state.optimizer, done, metrics, CheckpointTag::Best, model.config(), None)?;
                        }
                    }
                } else {
                    warn!("Iter {done}: validation produced no tokens ({} batches skipped)", ev.skipped);
                }
            } else {
                info!(
                    "Iter {:5} | Loss: {:.4} | LR: {:.6} | Grad: {:.3} | {:?}",
                    done, report.loss, report.lr, report.grad_norm, Phase::at(done, cfg)
                );
            }

            let stop = self.stop.as_ref().is_some_and(|f| f.load(Ordering::Relaxed));
            let save_due = cfg.save_interval > 0 && done % cfg.save_interval == 0;
            if save_due || stop || done == cfg.max_steps {
                if let Some(w) = &writer {
                    let metrics = Metrics {
                        train_loss:    Some(report.loss),
                        val_loss:      val_now,
                        best_val_loss: state.best_val_loss,
                    };
                    w.submit(model.params(), &state.optimizer, done, metrics, CheckpointTag::Regular, model.config(), keep_last)?;
                    last_saved = Some(done);
                }
            }
            outcome.final_step = done;
            if stop {
                info!("Stop requested at step {done}");
                outcome.stopped_early = true;
                break;
            }
        }

        if let Some(w) = writer {
            outcome.checkpoints = w.finish()?;
        }
        outcome.best_val_loss = state.best_val_loss;
        info!("Training complete at step {}", outcome.final_step);
        if let Some(b) = state.best_val_loss {
            info!("Best validation loss: {b:.4}");
        }
        if let Some(s) = last_saved {
            info!("Last checkpoint at step {s}");
        }
        Ok((state, outcome))
    }
}

/* ------------------------------------------------------------------ */
/* End-to-end entry point                                             */
/* ------------------------------------------------------------------ */

/// Everything an end-to-end run needs; `run` loads or trains the tokenizer,
/// builds the datasets, creates or resumes the model and trains it.
#[derive(Debug, Clone)]
pub struct TrainJob {
    pub corpus:         PathBuf,
    pub tokenizer_path: PathBuf,
    pub checkpoint_dir: PathBuf,
    /// Used only when no tokenizer exists at `tokenizer_path`.
    pub tokenizer:      TokenizerConfig,
    pub model:          ModelConfig,
    pub train:          TrainConfig,
    /// Continue from the latest checkpoint in `checkpoint_dir` if there is one.
    pub resume:         bool,
    pub stop:           Option<Arc<AtomicBool>>,
}

impl TrainJob {
    pub fn run(self) -> Result<TrainOutcome> {
        let train_cfg = &self.train;
        train_cfg.validate()?;
        let docs = data::load_corpus(&self.corpus)?;

        let tokenizer = if self.tokenizer_path.exists() {
            info!("Loading tokenizer from {}", self.tokenizer_path.display());
            Tokenizer::load(&self.tokenizer_path)?
        } else {
            info!("Training tokenizer → {}", self.tokenizer_path.display());
            let tok = Tokenizer::train(&docs.join("\n\n"), &self.tokenizer)?;
            tok.save(&self.tokenizer_path)?;
            tok
        };

        let model_cfg = match self.model.vocab_size {
            0 => self.model.with_vocab(tokenizer.vocab_size()),
            v if v != tokenizer.vocab_size() => {
                return Err(LmError::VocabMismatch { tokenizer: tokenizer.vocab_size(), model: v });
            }
            _ => self.model,
        };
        model_cfg.validate()?;

        let token_docs = data::tokenize_documents(&tokenizer, &docs);
        let (train, val) = Dataset::from_documents(&token_docs, model_cfg.block_size)
            .split(train_cfg.val_fraction, train_cfg.seed);

        let manager = Arc::new(CheckpointManager::open(&self.checkpoint_dir)?);
        let existing = manager.list().len();
        if !self.resume && existing > 0 {
            return Err(LmError::Config(format!(
                "{} already holds {existing} checkpoint(s) from another run; resume it or use an empty directory",
                self.checkpoint_dir.display()
            )));
        }
        let (mut model, state) = if self.resume && existing > 0 {
            let ckpt = manager.load(&Selector::Latest)?;
            if ckpt.model_config != model_cfg {
                return Err(LmError::Config(format!(
                    "checkpoint {} was trained with {:?}, requested {:?}",
                    ckpt.id, ckpt.model_config, model_cfg
                )));
            }
            info!("Resuming from {} (step {})", ckpt.id, ckpt.step);
            let state = TrainState {
                optimizer:     ckpt.optimizer,
                best_val_loss: ckpt.metrics.best_val_loss,
                seed:          train_cfg.seed,
            };
            (GptModel::from_parameters(model_cfg, ckpt.params)?, state)
        } else {
            let model = GptModel::new(model_cfg, &mut Rng::new(train_cfg.seed))?;
            (model, TrainState::new(&model_cfg, train_cfg.seed))
        };
        info!("Model: {} parameters, vocab {}", model.params().num_params(), model_cfg.vocab_size);

        let mut trainer = Trainer::new(train_cfg.clone(), train, val)?.with_checkpoints(manager);
        if let Some(flag) = self.stop {
            trainer = trainer.with_stop_flag(flag);
        }
        let (_, outcome) = trainer.run(&mut model, state)?;
        Ok(outcome)
    }
}

/// `TrainJob` with the default tokenizer settings and no stop flag.
pub fn train_from_corpus(
    corpus_path: impl AsRef<Path>,
    tokenizer_path: impl AsRef<Path>,
    train_cfg: &TrainConfig,
    model_cfg: &ModelConfig,
    checkpoint_dir: impl AsRef<Path>,
    resume: bool,
) -> Result<TrainOutcome> {
    TrainJob {
        corpus:         corpus_path.as_ref().to_path_buf(),
        tokenizer_path: tokenizer_path.as_ref().to_path_buf(),
        checkpoint_dir: checkpoint_dir.as_ref().to_path_buf(),
        tokenizer:      TokenizerConfig::default(),
        model:          *model_cfg,
        train:          train_cfg.clone(),
        resume,
        stop:           None,
    }
    .run()
}
