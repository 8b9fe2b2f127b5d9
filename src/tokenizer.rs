/* ------------------------------------------------------------------ */
/* Byte-pair-encoding tokenizer                                      */
/* ------------------------------------------------------------------ */
//
// Public interface:
//   Tokenizer::train(corpus, cfg)   → learn a vocabulary from scratch
//   Tokenizer::load(path)           → load a saved vocabulary artifact
//   tokenizer.save(path)            → atomic JSON write
//   tokenizer.encode(text)          → Vec<usize>   (no control tokens)
//   tokenizer.decode(ids)           → Result<String>
//
// Id layout: control tokens 0..4, then every distinct corpus character in
// code-point order, then one id per merge in the order merges were learned.
// Text is pre-split into word chunks by PRETOKENIZE_PATTERN; merges never
// cross a chunk boundary.
//
// The vocab file stores merges as (left_id, right_id); the merged token of
// merge i is id `n_base + i`. Two different merges may spell the same string,
// so ids (not strings) identify merges.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::path::Path;

use fancy_regex::Regex;
use log::{debug, info, warn};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::checkpoint::write_atomic;
use crate::config::TokenizerConfig;
use crate::error::{LmError, Result};

pub const PAD_ID: usize = 0;
pub const UNK_ID: usize = 1;
pub const BOS_ID: usize = 2;
pub const EOS_ID: usize = 3;

const CONTROL_TOKENS: [&str; 4] = ["<pad>", "<unk>", "<bos>", "<eos>"];
const UNK_PLACEHOLDER: &str = "\u{FFFD}";
const VOCAB_VERSION: u32 = 1;

/// Contractions, letter runs, digit runs, punctuation runs, whitespace.
pub const PRETOKENIZE_PATTERN: &str =
    r"'s|'t|'re|'ve|'m|'ll|'d| ?\p{L}+| ?\p{N}+| ?[^\s\p{L}\p{N}]+|\s+(?!\S)|\s+";

// Serialisable vocab file format
#[derive(Serialize, Deserialize)]
struct VocabFile {
    version: u32,
    vocab:   Vec<String>,         // token_id → token string
    merges:  Vec<(usize, usize)>, // merge i produces id n_base + i
    pattern: String,
}

#[derive(Debug, Clone)]
pub struct Tokenizer {
    vocab:       Vec<String>,
    token_to_id: HashMap<String, usize>,
    char_to_id:  HashMap<char, usize>,
    merges:      Vec<(usize, usize)>,
    // (left, right) → merge rank; lower rank = learned earlier = applied first
    merge_rank:  HashMap<(usize, usize), usize>,
    n_base:      usize,
    pattern:     String,
    splitter:    Regex,
}

// One distinct pre-token chunk of the training corpus.
struct Word {
    symbols: Vec<usize>,
    freq:    i64,
}

// Max-heap on count; ties go to the lexicographically smallest (left, right)
// string pair, then to the smallest ids.
type HeapEntry = (i64, Reverse<(String, String)>, Reverse<(usize, usize)>);

fn compile_pattern(pattern: &str) -> Result<Regex> {
    Regex::new(pattern).map_err(|e| LmError::Config(format!("invalid pre-tokenizer pattern: {e}")))
}

fn count_pairs(word: &Word, sign: i64, out: &mut HashMap<(usize, usize), i64>) {
    for w in word.symbols.windows(2) {
        *out.entry((w[0], w[1])).or_insert(0) += sign * word.freq;
    }
}

// Replace every non-overlapping (left, right) in `word` with `new_id`,
// returning the pair-count deltas the rewrite causes.
fn merge_word(word: &mut Word, left: usize, right: usize, new_id: usize) -> HashMap<(usize, usize), i64> {
    let mut delta = HashMap::new();
    if !word.symbols.windows(2).any(|w| w[0] == left && w[1] == right) {
        return delta;
    }
    count_pairs(word, -1, &mut delta);

    let mut out = Vec::with_capacity(word.symbols.len());
    let mut i = 0;
    while i < word.symbols.len() {
        if i + 1 < word.symbols.len() && word.symbols[i] == left && word.symbols[i + 1] == right {
            out.push(new_id);
            i += 2;
        } else {
            out.push(word.symbols[i]);
            i += 1;
        }
    }
    word.symbols = out;

    count_pairs(word, 1, &mut delta);
    delta.retain(|_, d| *d != 0);
    delta
}

impl Tokenizer {
    // ── Training ──────────────────────────────────────────────────────
    //
    // Incremental BPE over distinct chunks weighted by frequency, with a
    // max-heap for best-pair lookup.
    //
    // pair_counts: true current count for each pair.
    // heap: (count, pair) entries that may be stale; a popped entry is only
    //   used if it still matches pair_counts ("lazy deletion").
    //
    // Each merge rewrites the affected chunks in parallel and folds their
    // count deltas back in chunk order, so training is deterministic.

    pub fn train(corpus: &str, cfg: &TokenizerConfig) -> Result<Self> {
        let splitter = compile_pattern(PRETOKENIZE_PATTERN)?;

        // Step 1: base vocabulary = control tokens + sorted distinct characters
        let mut chars: Vec<char> = corpus.chars().collect();
        chars.par_sort_unstable();
        chars.dedup();

        let mut vocab: Vec<String> = CONTROL_TOKENS.iter().map(|s| s.to_string()).collect();
        vocab.extend(chars.iter().map(|c| c.to_string()));
        let n_base = vocab.len();
        let char_to_id: HashMap<char, usize> =
            chars.iter().enumerate().map(|(i, &c)| (c, CONTROL_TOKENS.len() + i)).collect();

        // Step 2: distinct chunks with their frequencies
        let mut freqs: HashMap<&str, i64> = HashMap::new();
        for chunk in split_chunks(&splitter, corpus) {
            *freqs.entry(chunk).or_insert(0) += 1;
        }
        let mut chunks: Vec<(&str, i64)> = freqs.into_iter().collect();
        chunks.sort_unstable();
        let mut words: Vec<Word> = chunks
            .iter()
            .map(|&(s, freq)| Word { symbols: s.chars().map(|c| char_to_id[&c]).collect(), freq })
            .collect();

        // Step 3: initial pair counts
        let mut pair_counts: HashMap<(usize, usize), i64> = words
            .par_iter()
            .fold(HashMap::new, |mut acc, w| {
                count_pairs(w, 1, &mut acc);
                acc
            })
            .reduce(HashMap::new, |mut a, b| {
                for (k, v) in b {
                    *a.entry(k).or_insert(0) += v;
                }
                a
            });

        let entry = |vocab: &[String], (l, r): (usize, usize), count: i64| -> HeapEntry {
            (count, Reverse((vocab[l].clone(), vocab[r].clone())), Reverse((l, r)))
        };
        let mut heap: BinaryHeap<HeapEntry> =
            pair_counts.iter().map(|(&pair, &count)| entry(&vocab, pair, count)).collect();

        let n_merges = cfg.vocab_size.saturating_sub(n_base);
        let min_freq = cfg.min_frequency.max(1) as i64;
        let report_every = (n_merges / 20).max(1);
        let mut merges: Vec<(usize, usize)> = Vec::with_capacity(n_merges);

        info!(
            "BPE training: {} chunks ({} distinct), base vocab {}, up to {} merges",
            words.iter().map(|w| w.freq).sum::<i64>(),
            words.len(),
            n_base,
            n_merges
        );

        while merges.len() < n_merges {
            // Pop until a non-stale entry turns up
            let mut best = None;
            while let Some((count, _, Reverse(pair))) = heap.pop() {
                if pair_counts.get(&pair).copied().unwrap_or(0) == count && count > 0 {
                    best = Some((pair, count));
                    break;
                }
            }
            let Some(((left, right), count)) = best else { break };
            if count < min_freq {
                debug!("best pair occurs {count} times (< {min_freq}), stopping");
                break;
            }

            let new_id = vocab.len();
            let merged = format!("{}{}", vocab[left], vocab[right]);
            vocab.push(merged);
            merges.push((left, right));

            let deltas: Vec<HashMap<(usize, usize), i64>> =
                words.par_iter_mut().map(|w| merge_word(w, left, right, new_id)).collect();
            let mut net: HashMap<(usize, usize), i64> = HashMap::new();
            for d in deltas {
                for (k, v) in d {
                    *net.entry(k).or_insert(0) += v;
                }
            }
            let mut changed: Vec<((usize, usize), i64)> = net.into_iter().filter(|(_, v)| *v != 0).collect();
            changed.sort_unstable();
            for (pair, d) in changed {
                let e = pair_counts.entry(pair).or_insert(0);
                *e += d;
                if *e > 0 {
                    heap.push(entry(&vocab, pair, *e));
                }
            }

            if merges.len() % report_every == 0 {
                info!(
                    "BPE training: {}/{} merges, vocab {}, last {:?} x{}",
                    merges.len(), n_merges, vocab.len(), vocab[new_id], count
                );
            }
        }

        info!("BPE training done: {} merges, vocab {}", merges.len(), vocab.len());
        Self::from_parts(vocab, merges, PRETOKENIZE_PATTERN.to_string(), splitter)
    }

    fn from_parts(vocab: Vec<String>, merges: Vec<(usize, usize)>, pattern: String, splitter: Regex) -> Result<Self> {
        let n_base = vocab.len().saturating_sub(merges.len());
        if n_base < CONTROL_TOKENS.len() || vocab.len() != n_base + merges.len() {
            return Err(LmError::invalid("vocabulary is smaller than its merge list"));
        }
        for (i, name) in CONTROL_TOKENS.iter().enumerate() {
            if vocab[i] != *name {
                return Err(LmError::invalid(format!("token {i} must be {name}, found {:?}", vocab[i])));
            }
        }

        let mut char_to_id = HashMap::new();
        for (id, tok) in vocab.iter().enumerate().take(n_base).skip(CONTROL_TOKENS.len()) {
            let mut it = tok.chars();
            match (it.next(), it.next()) {
                (Some(c), None) => { char_to_id.insert(c, id); }
                _ => return Err(LmError::invalid(format!("base token {id} is not a single character: {tok:?}"))),
            }
        }

        let mut merge_rank = HashMap::with_capacity(merges.len());
        for (rank, &(l, r)) in merges.iter().enumerate() {
            let id = n_base + rank;
            if l >= id || r >= id || vocab[id] != format!("{}{}", vocab[l], vocab[r]) {
                return Err(LmError::invalid(format!("merge {rank} ({l}, {r}) does not produce token {id}")));
            }
            merge_rank.entry((l, r)).or_insert(rank);
        }

        // first id wins when two merges spell the same string
        let mut token_to_id = HashMap::with_capacity(vocab.len());
        for (id, tok) in vocab.iter().enumerate() {
            token_to_id.entry(tok.clone()).or_insert(id);
        }

        Ok(Self { vocab, token_to_id, char_to_id, merges, merge_rank, n_base, pattern, splitter })
    }

    // ── Save / Load ───────────────────────────────────────────────────

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let file = VocabFile {
            version: VOCAB_VERSION,
            vocab:   self.vocab.clone(),
            merges:  self.merges.clone(),
            pattern: self.pattern.clone(),
        };
        let json = serde_json::to_vec_pretty(&file)?;
        write_atomic(path.as_ref(), &json)?;
        Ok(())
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)?;
        let file: VocabFile = serde_json::from_str(&json)?;
        if file.version != VOCAB_VERSION {
            return Err(LmError::invalid(format!(
                "{}: unsupported vocabulary version {}",
                path.display(),
                file.version
            )));
        }
        let splitter = compile_pattern(&file.pattern)?;
        Self::from_parts(file.vocab, file.merges, file.pattern, splitter)
    }

    // ── Accessors ─────────────────────────────────────────────────────

    pub fn vocab_size(&self) -> usize { self.vocab.len() }
    pub fn num_merges(&self) -> usize { self.merges.len() }
    pub fn pad_id(&self) -> usize { PAD_ID }
    pub fn unk_id(&self) -> usize { UNK_ID }
    pub fn bos_id(&self) -> usize { BOS_ID }
    pub fn eos_id(&self) -> usize { EOS_ID }

    pub fn id_of(&self, token: &str) -> Option<usize> {
        self.token_to_id.get(token).copied()
    }

    pub fn token_of(&self, id: usize) -> Option<&str> {
        self.vocab.get(id).map(String::as_str)
    }

    // ── Encode ────────────────────────────────────────────────────────
    //
    // Per chunk: characters → base ids, then repeatedly pick the applicable
    // merge of lowest rank and apply all of its non-overlapping occurrences
    // in one left-to-right pass. Chunks are independent and run on rayon.

    fn encode_chunk(&self, chunk: &str) -> Vec<usize> {
        let mut tokens: Vec<usize> =
            chunk.chars().map(|c| self.char_to_id.get(&c).copied().unwrap_or(UNK_ID)).collect();

        while tokens.len() >= 2 {
            let best = tokens
                .windows(2)
                .filter_map(|w| self.merge_rank.get(&(w[0], w[1])).copied())
                .min();
            let Some(rank) = best else { break };
            let (left, right) = self.merges[rank];
            let merged = self.n_base + rank;

            let mut out = Vec::with_capacity(tokens.len());
            let mut i = 0;
            while i < tokens.len() {
                if i + 1 < tokens.len() && tokens[i] == left && tokens[i + 1] == right {
                    out.push(merged);
                    i += 2;
                } else {
                    out.push(tokens[i]);
                    i += 1;
                }
            }
            tokens = out;
        }
        tokens
    }

    pub fn encode(&self, text: &str) -> Vec<usize> {
        let chunks = split_chunks(&self.splitter, text);
        chunks.par_iter().flat_map_iter(|c| self.encode_chunk(c)).collect()
    }

    pub fn encode_with_specials(&self, text: &str, bos: bool, eos: bool) -> Vec<usize> {
        let mut out = Vec::new();
        if bos { out.push(BOS_ID); }
        out.extend(self.encode(text));
        if eos { out.push(EOS_ID); }
        out
    }

    // ── Decode ────────────────────────────────────────────────────────

    /// Text of a single id: control tokens other than `<unk>` decode to "".
    pub fn decode_token(&self, id: usize) -> Result<&str> {
        match id {
            PAD_ID | BOS_ID | EOS_ID => Ok(""),
            UNK_ID => Ok(UNK_PLACEHOLDER),
            _ => self
                .vocab
                .get(id)
                .map(String::as_str)
                .ok_or(LmError::TokenOutOfRange { id, vocab_size: self.vocab.len() }),
        }
    }

    pub fn decode(&self, ids: &[usize]) -> Result<String> {
        let mut out = String::new();
        for &id in ids {
            out.push_str(self.decode_token(id)?);
        }
        Ok(out)
    }
}

// Split `text` into pre-token chunks covering it end to end. If the regex
// engine gives up (backtrack limit) the remainder becomes one chunk.
fn split_chunks<'a>(splitter: &Regex, text: &'a str) -> Vec<&'a str> {
    let mut out = Vec::new();
    let mut end = 0;
    for m in splitter.find_iter(text) {
        match m {
            Ok(m) => {
                if m.start() > end {
                    out.push(&text[end..m.start()]);
                }
                out.push(m.as_str());
                end = m.end();
            }
            Err(e) => {
                warn!("pre-tokenizer failed at byte {end}: {e}; keeping remainder as one chunk");
                break;
            }
        }
    }
    if end < text.len() {
        out.push(&text[end..]);
    }
    out
}
