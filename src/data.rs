/* ------------------------------------------------------------------ */
/* Corpus → fixed-length training windows → deterministic batches     */
/* ------------------------------------------------------------------ */
//
// A corpus file is a sequence of documents separated by blank lines. Each
// document becomes [<bos>] + tokens + [<eos>] and is cut into windows of
// block_size + 1 tokens (consecutive windows share one token so every
// target is covered once). The last window of a document is right-padded
// with <pad>; padded targets are excluded from the loss.
//
// Batch contents are a pure function of (seed, step): a resumed run or the
// background prefetcher always produces exactly the batch a fresh run would.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver};
use std::sync::Arc;
use std::thread::JoinHandle;

use log::{debug, warn};
use rayon::prelude::*;

use crate::error::{LmError, Result};
use crate::rng::Rng;
use crate::tokenizer::{Tokenizer, PAD_ID};

/// Split raw corpus text into documents (blank-line separated, trimmed).
pub fn split_documents(text: &str) -> Vec<String> {
    let mut docs = Vec::new();
    let mut current: Vec<&str> = Vec::new();
    for line in text.lines() {
        if line.trim().is_empty() {
            if !current.is_empty() {
                docs.push(current.join("\n"));
                current.clear();
            }
        } else {
            current.push(line.trim_end());
        }
    }
    if !current.is_empty() {
        docs.push(current.join("\n"));
    }
    docs
}

pub fn load_corpus(path: impl AsRef<Path>) -> Result<Vec<String>> {
    let path = path.as_ref();
    let text = std::fs::read_to_string(path)?;
    let docs = split_documents(&text);
    if docs.is_empty() {
        return Err(LmError::invalid(format!("corpus {} contains no documents", path.display())));
    }
    Ok(docs)
}

/// `[<bos>] + encode(doc) + [<eos>]` for every document, in order.
pub fn tokenize_documents(tokenizer: &Tokenizer, docs: &[String]) -> Vec<Vec<usize>> {
    docs.par_iter()
        .map(|d| tokenizer.encode_with_specials(d, true, true))
        .collect()
}

/// One training example: `targets[i]` is the token that follows `inputs[i]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Example {
    pub inputs:  Vec<usize>,
    pub targets: Vec<usize>,
}

impl Example {
    /// Positions whose target counts toward the loss.
    pub fn counted(&self) -> usize {
        self.targets.iter().filter(|&&t| t != PAD_ID).count()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Batch {
    pub examples: Vec<Example>,
}

#[derive(Debug, Clone, Default)]
pub struct Dataset {
    block_size: usize,
    windows:    Vec<Vec<usize>>, // each block_size + 1 long
}

impl Dataset {
    pub fn from_documents(docs: &[Vec<usize>], block_size: usize) -> Self {
        let span = block_size + 1;
        let mut windows = Vec::new();
        for doc in docs {
            if doc.len() < 2 {
                continue;
            }
            let mut start = 0;
            loop {
                let end = (start + span).min(doc.len());
                let mut w = doc[start..end].to_vec();
                w.resize(span, PAD_ID);
                windows.push(w);
                if end == doc.len() {
                    break;
                }
                start += block_size;
            }
        }
        Self { block_size, windows }
    }

    pub fn len(&self) -> usize { self.windows.len() }
    pub fn is_empty(&self) -> bool { self.windows.is_empty() }
    pub fn block_size(&self) -> usize { self.block_size }

    /// Deterministic shuffle by `seed`, then hold out `val_fraction` of the
    /// windows (at least one when the fraction is non-zero and there are two or more).
    pub fn split(self, val_fraction: f32, seed: u64) -> (Dataset, Dataset) {
        let mut windows = self.windows;
        let mut rng = Rng::new(seed);
        for i in (1..windows.len()).rev() {
            let j = rng.choice(i + 1);
            windows.swap(i, j);
        }
        let n = windows.len();
        let mut n_val = (n as f32 * val_fraction).ceil() as usize;
        if val_fraction > 0.0 && n >= 2 {
            n_val = n_val.max(1);
        }
        n_val = n_val.min(n.saturating_sub(1));
        let val = windows.split_off(n - n_val);
        (
            Dataset { block_size: self.block_size, windows },
            Dataset { block_size: self.block_size, windows: val },
        )
    }

    fn example(&self, i: usize) -> Example {
        let w = &self.windows[i];
        Example { inputs: w[..self.block_size].to_vec(), targets: w[1..].to_vec() }
    }

    /// The training batch for `step`: `batch_size` windows drawn with
    /// replacement from the stream `(seed, step)`.
    pub fn batch_for_step(&self, step: u64, batch_size: usize, seed: u64) -> Batch {
        if self.windows.is_empty() {
            return Batch { examples: Vec::new() };
        }
        let mut rng = Rng::for_stream(seed, step);
        let examples = (0..batch_size).map(|_| self.example(rng.choice(self.windows.len()))).collect();
        Batch { examples }
    }

    /// Up to `max_batches` consecutive batches covering the dataset in order.
    pub fn eval_batches(&self, batch_size: usize, max_batches: usize) -> Vec<Batch> {
        (0..self.windows.len())
            .collect::<Vec<_>>()
            .chunks(batch_size.max(1))
            .take(max_batches)
            .map(|idx| Batch { examples: idx.iter().map(|&i| self.example(i)).collect() })
            .collect()
    }
}

/* ------------------------------------------------------------------ */
/* Background batch prefetch                                          */
/* ------------------------------------------------------------------ */

/// Builds `batch_for_step` for upcoming steps on a worker thread, `depth`
/// batches ahead. `next` falls back to building the batch inline if the
/// worker is out of step or gone, so results never depend on it.
pub struct Prefetcher {
    dataset:    Arc<Dataset>,
    batch_size: usize,
    seed:       u64,
    rx:         Option<Receiver<(u64, Batch)>>,
    stop:       Arc<AtomicBool>,
    handle:     Option<JoinHandle<()>>,
}

impl Prefetcher {
    pub fn spawn(dataset: Arc<Dataset>, steps: std::ops::Range<u64>, batch_size: usize, seed: u64, depth: usize) -> Self {
        let (tx, rx) = mpsc::sync_channel(depth.max(1));
        let stop = Arc::new(AtomicBool::new(false));
        let worker = {
            let dataset = Arc::clone(&dataset);
            let stop = Arc::clone(&stop);
            move || {
                for step in steps {
                    if stop.load(Ordering::Relaxed) {
                        break;
                    }
                    if tx.send((step, dataset.batch_for_step(step, batch_size, seed))).is_err() {
                        break;
                    }
                }
            }
        };
        let (rx, handle) = match std::thread::Builder::new().name("prefetch".into()).spawn(worker) {
            Ok(h) => (Some(rx), Some(h)),
            Err(e) => {
                warn!("could not start prefetch thread, building batches inline: {e}");
                (None, None)
            }
        };
        Self { dataset, batch_size, seed, rx, stop, handle }
    }

    pub fn next(&mut self, step: u64) -> Batch {
        if let Some(rx) = &self.rx {
            match rx.recv() {
                Ok((s, batch)) if s == step => return batch,
                Ok((s, _)) => {
                    debug!("prefetcher produced step {s}, wanted {step}; building inline");
                    self.shutdown();
                }
                Err(_) => self.shutdown(),
            }
        }
        self.dataset.batch_for_step(step, self.batch_size, self.seed)
    }

    fn shutdown(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        drop(self.rx.take());
        if let Some(h) = self.handle.take() {
            let _ = h.join();
        }
    }
}

impl Drop for Prefetcher {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn documents_split_on_blank_lines() {
        let docs = split_documents("a b\nc\n\n\nd  \n\n");
        assert_eq!(docs, vec!["a b\nc".to_string(), "d".to_string()]);
    }

    #[test]
    fn windows_overlap_by_one_and_pad_the_tail() {
        let doc: Vec<usize> = (10..20).collect(); // 10 tokens
        let ds = Dataset::from_documents(&[doc], 4);
        assert_eq!(ds.len(), 3);
        assert_eq!(ds.windows[0], vec![10, 11, 12, 13, 14]);
        assert_eq!(ds.windows[1], vec![14, 15, 16, 17, 18]);
        assert_eq!(ds.windows[2], vec![18, 19, PAD_ID, PAD_ID, PAD_ID]);
        let ex = ds.example(2);
        assert_eq!(ex.inputs, vec![18, 19, PAD_ID, PAD_ID]);
        assert_eq!(ex.targets, vec![19, PAD_ID, PAD_ID, PAD_ID]);
        assert_eq!(ex.counted(), 1);
    }

    #[test]
    fn batches_are_a_function_of_seed_and_step() {
        let docs: Vec<Vec<usize>> = (0..20).map(|d| (0..7).map(|t| 4 + d + t).collect()).collect();
        let ds = Dataset::from_documents(&docs, 4);
        assert_eq!(ds.batch_for_step(3, 4, 9), ds.batch_for_step(3, 4, 9));
        assert_ne!(ds.batch_for_step(3, 4, 9), ds.batch_for_step(4, 4, 9));
        assert_eq!(ds.batch_for_step(0, 4, 9).examples.len(), 4);
    }

    #[test]
    fn split_is_deterministic_and_disjoint_in_size() {
        let docs: Vec<Vec<usize>> = (0..10).map(|d| vec![4 + d, 5 + d, 6 + d]).collect();
        let (tr1, va1) = Dataset::from_documents(&docs, 4).split(0.2, 1);
        let (tr2, va2) = Dataset::from_documents(&docs, 4).split(0.2, 1);
        assert_eq!(tr1.windows, tr2.windows);
        assert_eq!(va1.windows, va2.windows);
        assert_eq!((tr1.len(), va1.len()), (8, 2));
    }

    #[test]
    fn prefetcher_matches_direct_batches() {
        let docs: Vec<Vec<usize>> = (0..30).map(|d| (0..9).map(|t| 4 + (d * 3 + t) % 50).collect()).collect();
        let ds = Arc::new(Dataset::from_documents(&docs, 4));
        let mut pf = Prefetcher::spawn(Arc::clone(&ds), 5..12, 3, 42, 2);
        for step in 5..12 {
            assert_eq!(pf.next(step), ds.batch_for_step(step, 3, 42));
        }
        // past the prefetched range it falls back to inline construction
        assert_eq!(pf.next(12), ds.batch_for_step(12, 3, 42));
    }
}
