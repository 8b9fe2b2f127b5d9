/* ------------------------------------------------------------------ */
/* finlm command line                                                 */
/* ------------------------------------------------------------------ */

use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::{Args, Parser, Subcommand, ValueEnum};
use log::info;

use finlm::checkpoint::{CheckpointManager, Selector};
use finlm::config::{RunConfig, BPE_VOCAB_PATH};
use finlm::data::{self, Dataset};
use finlm::inference::InferenceEngine;
use finlm::sampling::SelectionPolicy;
use finlm::serve::{run_server, ServeOptions};
use finlm::tokenizer::Tokenizer;
use finlm::train::{evaluate, TrainJob};

#[derive(Parser)]
#[command(name = "finlm", version, about = "Train and run a small GPT for the finance assistant")]
struct Cli {
    /// JSON preset (see configs/); missing fields use built-in defaults.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Learn a BPE vocabulary from a corpus.
    TokenizerTrain {
        #[arg(long)]
        corpus: PathBuf,
        #[arg(long, default_value = BPE_VOCAB_PATH)]
        out: PathBuf,
        #[arg(long)]
        vocab_size: Option<usize>,
    },
    /// Train (or resume training) the model.
    Train {
        #[arg(long)]
        corpus: PathBuf,
        #[arg(long, default_value = BPE_VOCAB_PATH)]
        tokenizer: PathBuf,
        #[arg(long, default_value = "checkpoints")]
        checkpoints: PathBuf,
        #[arg(long)]
        resume: bool,
        /// Override train.max_steps.
        #[arg(long)]
        steps: Option<u64>,
    },
    /// Generate a continuation of a prompt.
    Generate {
        #[command(flatten)]
        model: ModelArgs,
        #[arg(long)]
        prompt: String,
        #[arg(long)]
        max_tokens: Option<usize>,
        #[command(flatten)]
        sampling: SamplingArgs,
        /// Print tokens as they are produced.
        #[arg(long)]
        stream: bool,
    },
    /// Loss and perplexity of a checkpoint on the held-out split of a corpus.
    Eval {
        #[command(flatten)]
        model: ModelArgs,
        #[arg(long)]
        corpus: PathBuf,
        /// Evaluate on every window instead of the validation split.
        #[arg(long)]
        all: bool,
    },
    /// List (and optionally prune) checkpoints.
    Checkpoints {
        #[arg(long, default_value = "checkpoints")]
        dir: PathBuf,
        /// Keep only the newest N regular checkpoints (the best one is always kept).
        #[arg(long)]
        prune: Option<usize>,
    },
    /// Serve POST /generate over HTTP.
    Serve {
        #[command(flatten)]
        model: ModelArgs,
        #[arg(long, default_value = "127.0.0.1:8080")]
        addr: String,
        #[arg(long, default_value_t = 4)]
        workers: usize,
        #[arg(long, env = "FINLM_API_KEY")]
        api_key: Option<String>,
    },
}

#[derive(Args)]
struct ModelArgs {
    #[arg(long, default_value = "checkpoints")]
    checkpoints: PathBuf,
    /// "latest", "best" or a checkpoint id.
    #[arg(long, default_value = "best")]
    select: Selector,
    #[arg(long, default_value = BPE_VOCAB_PATH)]
    tokenizer: PathBuf,
}

#[derive(Clone, Copy, ValueEnum)]
enum PolicyKind {
    Greedy,
    Temperature,
    TopK,
    TopP,
}

#[derive(Args)]
struct SamplingArgs {
    #[arg(long, value_enum, default_value_t = PolicyKind::TopP)]
    policy: PolicyKind,
    #[arg(long, default_value_t = finlm::config::DEFAULT_TEMPERATURE)]
    temperature: f32,
    #[arg(long, default_value_t = 40)]
    top_k: usize,
    #[arg(long, default_value_t = 0.9)]
    top_p: f32,
    #[arg(long, default_value_t = 1337)]
    seed: u64,
}

impl SamplingArgs {
    fn policy(&self) -> SelectionPolicy {
        let temperature = self.temperature;
        match self.policy {
            PolicyKind::Greedy => SelectionPolicy::Greedy,
            PolicyKind::Temperature => SelectionPolicy::Temperature { temperature },
            PolicyKind::TopK => SelectionPolicy::TopK { k: self.top_k, temperature },
            PolicyKind::TopP => SelectionPolicy::TopP { p: self.top_p, temperature },
        }
    }
}

fn engine(args: &ModelArgs, run: &RunConfig) -> anyhow::Result<InferenceEngine> {
    InferenceEngine::from_checkpoint(&args.checkpoints, &args.select, &args.tokenizer, run.generation)
        .with_context(|| format!("loading model from {}", args.checkpoints.display()))
}

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    let run = match &cli.config {
        Some(path) => RunConfig::from_path(path).with_context(|| format!("reading {}", path.display()))?,
        None => RunConfig::default(),
    };

    match cli.command {
        Command::TokenizerTrain { corpus, out, vocab_size } => {
            let mut cfg = run.tokenizer;
            if let Some(v) = vocab_size {
                cfg.vocab_size = v;
            }
            let docs = data::load_corpus(&corpus)?;
            let tok = Tokenizer::train(&docs.join("\n\n"), &cfg)?;
            tok.save(&out)?;
            info!("Saved {} tokens ({} merges) to {}", tok.vocab_size(), tok.num_merges(), out.display());
        }

        Command::Train { corpus, tokenizer, checkpoints, resume, steps } => {
            let mut train = run.train.clone();
            if let Some(s) = steps {
                train.max_steps = s;
            }
            let stop = Arc::new(AtomicBool::new(false));
            let handler_flag = Arc::clone(&stop);
            ctrlc::set_handler(move || {
                info!("Ctrl-C received, finishing the current step");
                handler_flag.store(true, Ordering::Relaxed);
            })
            .context("failed to install signal handler")?;

            let outcome = TrainJob {
                corpus,
                tokenizer_path: tokenizer,
                checkpoint_dir: checkpoints,
                tokenizer: run.tokenizer,
                model: run.model,
                train,
                resume,
                stop: Some(stop),
            }
            .run()?;
            info!(
                "Finished at step {} | train loss {} | best val {}",
                outcome.final_step,
                outcome.train_loss.map_or("-".into(), |l| format!("{l:.4}")),
                outcome.best_val_loss.map_or("-".into(), |l| format!("{l:.4}")),
            );
        }

        Command::Generate { model, prompt, max_tokens, sampling, stream } => {
            let engine = engine(&model, &run)?;
            let max_tokens = max_tokens.unwrap_or_else(|| engine.default_max_tokens());
            let policy = sampling.policy();
            let generation = if stream {
                let mut stdout = std::io::stdout();
                print!("{prompt}");
                let g = engine.generate_streaming(&prompt, max_tokens, &policy, sampling.seed, |piece| {
                    print!("{piece}");
                    let _ = stdout.flush();
                })?;
                println!();
                g
            } else {
                let g = engine.generate(&prompt, max_tokens, &policy, sampling.seed)?;
                println!("{prompt}{}", g.text);
                g
            };
            info!(
                "{} prompt tokens ({} truncated), {} generated, stop: {:?}",
                generation.prompt_tokens, generation.truncated, generation.tokens.len(), generation.stop
            );
        }

        Command::Eval { model, corpus, all } => {
            let engine = engine(&model, &run)?;
            let docs = data::load_corpus(&corpus)?;
            let tokens = data::tokenize_documents(engine.tokenizer(), &docs);
            let dataset = Dataset::from_documents(&tokens, engine.model().config().block_size);
            let dataset = if all { dataset } else { dataset.split(run.train.val_fraction, run.train.seed).1 };
            if dataset.is_empty() {
                bail!("no evaluation windows in {}", corpus.display());
            }
            let batches = dataset.eval_batches(run.train.batch_size, usize::MAX);
            let report = evaluate(engine.model(), &batches);
            println!(
                "loss {:.4} | perplexity {:.2} | tokens {} | skipped batches {}",
                report.loss, report.perplexity, report.tokens, report.skipped
            );
        }

        Command::Checkpoints { dir, prune } => {
            let manager = CheckpointManager::open(&dir)?;
            if let Some(n) = prune {
                for id in manager.prune(n)? {
                    info!("pruned {id}");
                }
            }
            let best = manager.best_id();
            for c in manager.list() {
                let val = c.metrics.val_loss.map_or("-".into(), |v| format!("{v:.4}"));
                let marker = if best.as_ref() == Some(&c.id) { "  *best" } else { "" };
                println!("{:<28} step {:>8}  val {:>8}{marker}", c.id.as_str(), c.step, val);
            }
        }

        Command::Serve { model, addr, workers, api_key } => {
            let engine = Arc::new(engine(&model, &run)?);
            let opts = ServeOptions { workers, api_key, ..ServeOptions::default() };
            run_server(&addr, engine, opts)?;
        }
    }
    Ok(())
}
