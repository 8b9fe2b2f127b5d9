/* ------------------------------------------------------------------ */
/* Checkpoint save / load, history index, retention                  */
/* ------------------------------------------------------------------ */
//
// File format (little-endian):
//   [0..8]    magic        b"FLMCKPT1"
//   [8..12]   header_len   u32
//   [12..h]   header       JSON (CheckpointHeader)
//   [h..]     payload      flat f32: params, adam m, adam v
//                          (each in Parameters::layout order)
//
// Publishing: serialise to memory, write `<id>.ckpt.tmp`, fsync, rename to
// `<id>.ckpt`, then rewrite index.json the same way. A reader only ever
// opens renamed files, so it never observes a partial checkpoint.

use std::fmt;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::mpsc::{self, Sender};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::config::ModelConfig;
use crate::error::{LmError, Result};
use crate::model::Parameters;
use crate::optimizer::OptimizerState;

const MAGIC: &[u8; 8] = b"FLMCKPT1";
const FORMAT_VERSION: u32 = 1;
const INDEX_FILE: &str = "index.json";
const EXTENSION: &str = "ckpt";

// ── Atomic file writes ─────────────────────────────────────────────

/// Atomically replace `path` with `buf` (write to .tmp, fsync, rename).
pub fn write_atomic(path: &Path, buf: &[u8]) -> std::io::Result<()> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    {
        let mut f = File::create(&tmp)?;
        f.write_all(buf)?;
        f.sync_all()?;
    }
    fs::rename(&tmp, path)
}

// ── Identity, tags, metrics ────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointTag {
    Regular,
    Best,
}

impl fmt::Display for CheckpointTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CheckpointTag::Regular => "regular",
            CheckpointTag::Best    => "best",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CheckpointId(String);

impl CheckpointId {
    pub fn new(step: u64, tag: CheckpointTag) -> Self {
        Self(format!("step-{step:08}-{tag}"))
    }

    pub fn as_str(&self) -> &str { &self.0 }
}

impl fmt::Display for CheckpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Losses recorded with a checkpoint. Non-finite values are stored as absent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Metrics {
    pub train_loss:    Option<f32>,
    pub val_loss:      Option<f32>,
    pub best_val_loss: Option<f32>,
}

impl Metrics {
    fn sanitized(self) -> Self {
        let keep = |v: Option<f32>| v.filter(|x| x.is_finite());
        Self {
            train_loss:    keep(self.train_loss),
            val_loss:      keep(self.val_loss),
            best_val_loss: keep(self.best_val_loss),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selector {
    Id(CheckpointId),
    Latest,
    Best,
}

impl FromStr for Selector {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(match s {
            "latest" => Selector::Latest,
            "best"   => Selector::Best,
            id       => Selector::Id(CheckpointId(id.to_string())),
        })
    }
}

/// A fully decoded checkpoint.
#[derive(Debug, Clone)]
pub struct Checkpoint {
    pub id:           CheckpointId,
    pub step:         u64,
    pub tag:          CheckpointTag,
    pub metrics:      Metrics,
    pub model_config: ModelConfig,
    pub params:       Parameters,
    pub optimizer:    OptimizerState,
}

// ── Binary codec ───────────────────────────────────────────────────

#[derive(Debug, Serialize, Deserialize)]
struct CheckpointHeader {
    version:        u32,
    step:           u64,
    optimizer_step: u64,
    tag:            CheckpointTag,
    metrics:        Metrics,
    model:          ModelConfig,
    payload_len:    u64,
    payload_sha256: String,
    tensors:        Vec<(String, usize)>,
}

fn write_f32s(buf: &mut Vec<u8>, s: &[f32]) {
    buf.reserve(s.len() * 4);
    for &v in s { buf.extend_from_slice(&v.to_le_bytes()); }
}

fn read_f32s(raw: &[u8]) -> Vec<f32> {
    raw.chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect()
}

/// Serialize a checkpoint to an in-memory byte buffer. No disk I/O.
pub fn encode_checkpoint(
    params: &Parameters,
    optimizer: &OptimizerState,
    step: u64,
    metrics: Metrics,
    tag: CheckpointTag,
    model_config: &ModelConfig,
) -> Result<Vec<u8>> {
    let layout = Parameters::layout(model_config);
    for part in [params, &optimizer.m, &optimizer.v] {
        let lens: Vec<usize> = part.tensors().iter().map(|t| t.len()).collect();
        if lens.len() != layout.len() || lens.iter().zip(&layout).any(|(a, (_, b))| a != b) {
            return Err(LmError::invalid("parameters do not match the checkpoint model config"));
        }
    }

    let n = params.num_params();
    let mut payload = Vec::with_capacity(n * 4 * 3);
    for part in [params, &optimizer.m, &optimizer.v] {
        for t in part.tensors() {
            write_f32s(&mut payload, t);
        }
    }

    let header = CheckpointHeader {
        version:        FORMAT_VERSION,
        step,
        optimizer_step: optimizer.step,
        tag,
        metrics:        metrics.sanitized(),
        model:          *model_config,
        payload_len:    payload.len() as u64,
        payload_sha256: hex::encode(Sha256::digest(&payload)),
        tensors:        layout,
    };
    let header_json = serde_json::to_vec(&header)?;

    let mut buf = Vec::with_capacity(MAGIC.len() + 4 + header_json.len() + payload.len());
    buf.extend_from_slice(MAGIC);
    buf.extend_from_slice(&(header_json.len() as u32).to_le_bytes());
    buf.extend_from_slice(&header_json);
    buf.extend_from_slice(&payload);
    Ok(buf)
}

/// Decode and verify a checkpoint buffer. Every failure is `CheckpointCorrupt`.
pub fn decode_checkpoint(id: &CheckpointId, bytes: &[u8]) -> Result<Checkpoint> {
    let corrupt = |reason: String| LmError::corrupt(id.as_str(), reason);

    if bytes.len() < MAGIC.len() + 4 || &bytes[..MAGIC.len()] != MAGIC {
        return Err(corrupt("bad magic bytes".into()));
    }
    let hlen = u32::from_le_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]) as usize;
    let body = &bytes[12..];
    if body.len() < hlen {
        return Err(corrupt(format!("header truncated ({} of {hlen} bytes)", body.len())));
    }
    let header: CheckpointHeader = serde_json::from_slice(&body[..hlen])
        .map_err(|e| corrupt(format!("unreadable header: {e}")))?;
    if header.version != FORMAT_VERSION {
        return Err(corrupt(format!("unsupported format version {}", header.version)));
    }

    let payload = &body[hlen..];
    if payload.len() as u64 != header.payload_len {
        return Err(corrupt(format!(
            "payload is {} bytes, header says {}",
            payload.len(),
            header.payload_len
        )));
    }
    let digest = hex::encode(Sha256::digest(payload));
    if digest != header.payload_sha256 {
        return Err(corrupt("payload checksum mismatch".into()));
    }

    header.model.validate().map_err(|e| corrupt(format!("invalid model config: {e}")))?;
    let layout = Parameters::layout(&header.model);
    if layout != header.tensors {
        return Err(corrupt("tensor table does not match the model config".into()));
    }
    let n: usize = layout.iter().map(|(_, len)| len).sum();
    if payload.len() != n * 4 * 3 {
        return Err(corrupt(format!("payload holds {} floats, expected {}", payload.len() / 4, n * 3)));
    }

    let values = read_f32s(payload);
    let part = |i: usize| Parameters::from_flat(&header.model, &values[i * n..(i + 1) * n]);
    let params = part(0).map_err(|e| corrupt(e.to_string()))?;
    let m = part(1).map_err(|e| corrupt(e.to_string()))?;
    let v = part(2).map_err(|e| corrupt(e.to_string()))?;

    Ok(Checkpoint {
        id:           id.clone(),
        step:         header.step,
        tag:          header.tag,
        metrics:      header.metrics,
        model_config: header.model,
        params,
        optimizer:    OptimizerState { step: header.optimizer_step, m, v },
    })
}

// ── History index ──────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointInfo {
    pub id:      CheckpointId,
    pub step:    u64,
    pub tag:     CheckpointTag,
    pub metrics: Metrics,
    pub file:    String,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Index {
    version: u32,
    /// Publish order (oldest first).
    entries: Vec<CheckpointInfo>,
    best:    Option<CheckpointId>,
    /// Ids whose file is being written right now.
    #[serde(skip)]
    pending: Vec<CheckpointId>,
}

impl Index {
    // Lowest validation loss wins; ties go to the earlier publish.
    fn recompute_best(&mut self) {
        self.best = self
            .entries
            .iter()
            .filter_map(|e| e.metrics.val_loss.map(|l| (l, e)))
            .fold(None::<(f32, &CheckpointInfo)>, |best, (l, e)| match best {
                Some((bl, _)) if bl <= l => best,
                _ => Some((l, e)),
            })
            .map(|(_, e)| e.id.clone());
    }
}

/* ------------------------------------------------------------------ */
/* CheckpointManager                                                  */
/* ------------------------------------------------------------------ */

/// Owns one checkpoint directory. `Sync`: the index mutex is held only to
/// reserve an id, register a written file or resolve a name, never across
/// the checkpoint file write itself.
#[derive(Debug)]
pub struct CheckpointManager {
    dir:   PathBuf,
    index: Mutex<Index>,
}

impl CheckpointManager {
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        let index_path = dir.join(INDEX_FILE);
        let index = if index_path.exists() {
            let raw = fs::read(&index_path)?;
            serde_json::from_slice(&raw)
                .map_err(|e| LmError::corrupt(INDEX_FILE, format!("unreadable index: {e}")))?
        } else {
            Index { version: FORMAT_VERSION, ..Index::default() }
        };
        debug!("opened checkpoint dir {} ({} entries)", dir.display(), index.entries.len());
        Ok(Self { dir, index: Mutex::new(index) })
    }

    pub fn dir(&self) -> &Path { &self.dir }

    fn lock(&self) -> MutexGuard<'_, Index> {
        // a panic while holding the lock leaves the on-disk index authoritative
        self.index.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write_index(&self, index: &Index) -> Result<()> {
        let json = serde_json::to_vec_pretty(index)?;
        write_atomic(&self.dir.join(INDEX_FILE), &json)?;
        Ok(())
    }

    pub fn save(
        &self,
        params: &Parameters,
        optimizer: &OptimizerState,
        step: u64,
        metrics: Metrics,
        tag: CheckpointTag,
        model_config: &ModelConfig,
    ) -> Result<CheckpointId> {
        let bytes = encode_checkpoint(params, optimizer, step, metrics, tag, model_config)?;
        self.publish(bytes, step, metrics.sanitized(), tag)
    }

    /// Write pre-encoded checkpoint bytes and register them in the index.
    /// Fails with `CheckpointExists` if the id is already published or being written.
    pub fn publish(&self, bytes: Vec<u8>, step: u64, metrics: Metrics, tag: CheckpointTag) -> Result<CheckpointId> {
        let id = CheckpointId::new(step, tag);
        let file = format!("{id}.{EXTENSION}");

        self.reserve(&id)?;
        let written = write_atomic(&self.dir.join(&file), &bytes);

        let mut index = self.lock();
        index.pending.retain(|p| p != &id);
        written?;
        index.entries.push(CheckpointInfo { id: id.clone(), step, tag, metrics, file });
        index.recompute_best();
        self.write_index(&index)?;

        info!("saved checkpoint {id} ({:.1} MB)", bytes.len() as f64 / 1_048_576.0);
        Ok(id)
    }

    fn reserve(&self, id: &CheckpointId) -> Result<()> {
        let mut index = self.lock();
        if index.entries.iter().any(|e| &e.id == id) || index.pending.contains(id) {
            return Err(LmError::CheckpointExists(id.to_string()));
        }
        index.pending.push(id.clone());
        Ok(())
    }

    pub fn list(&self) -> Vec<CheckpointInfo> {
        self.lock().entries.clone()
    }

    pub fn best_id(&self) -> Option<CheckpointId> {
        self.lock().best.clone()
    }

    fn resolve(&self, selector: &Selector) -> Result<CheckpointInfo> {
        let index = self.lock();
        let found = match selector {
            Selector::Latest => index.entries.iter().max_by_key(|e| e.step),
            Selector::Best => {
                let best = index.best.as_ref();
                index.entries.iter().find(|e| Some(&e.id) == best)
            }
            Selector::Id(id) => index.entries.iter().find(|e| &e.id == id),
        };
        found.cloned().ok_or_else(|| {
            LmError::CheckpointNotFound(match selector {
                Selector::Latest => "latest (no checkpoints saved)".to_string(),
                Selector::Best   => "best (no checkpoint has a validation loss)".to_string(),
                Selector::Id(id) => id.to_string(),
            })
        })
    }

    pub fn load(&self, selector: &Selector) -> Result<Checkpoint> {
        let info = self.resolve(selector)?;
        let path = self.dir.join(&info.file);
        let bytes = match fs::read(&path) {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(LmError::CheckpointNotFound(format!("{} (missing {})", info.id, path.display())));
            }
            Err(e) => return Err(e.into()),
        };
        let ckpt = decode_checkpoint(&info.id, &bytes)?;
        debug!("loaded checkpoint {} (step {})", ckpt.id, ckpt.step);
        Ok(ckpt)
    }

    /// Delete all but the newest `keep_last` checkpoints; the best one is always kept.
    pub fn prune(&self, keep_last: usize) -> Result<Vec<CheckpointId>> {
        let mut index = self.lock();
        let n = index.entries.len();
        if n <= keep_last {
            return Ok(Vec::new());
        }
        let best = index.best.clone();
        let mut removed = Vec::new();
        let mut kept = Vec::with_capacity(keep_last + 1);
        for (i, e) in std::mem::take(&mut index.entries).into_iter().enumerate() {
            if i >= n - keep_last || Some(&e.id) == best.as_ref() {
                kept.push(e);
            } else {
                match fs::remove_file(self.dir.join(&e.file)) {
                    Ok(()) => {}
                    Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                    Err(err) => warn!("could not delete {}: {err}", e.file),
                }
                removed.push(e.id);
            }
        }
        index.entries = kept;
        self.write_index(&index)?;
        if !removed.is_empty() {
            debug!("pruned {} checkpoint(s)", removed.len());
        }
        Ok(removed)
    }
}

/* ------------------------------------------------------------------ */
/* BackgroundWriter: publish checkpoints off the training thread      */
/* ------------------------------------------------------------------ */

struct WriteJob {
    bytes:     Vec<u8>,
    step:      u64,
    metrics:   Metrics,
    tag:       CheckpointTag,
    keep_last: Option<usize>,
}

/// Encoding happens on the caller's thread (a consistent snapshot); disk
/// writes, index updates and pruning happen on the writer thread in order.
pub struct BackgroundWriter {
    tx:     Option<Sender<WriteJob>>,
    handle: Option<JoinHandle<Result<Vec<CheckpointId>>>>,
}

impl BackgroundWriter {
    pub fn spawn(manager: Arc<CheckpointManager>) -> Self {
        let (tx, rx) = mpsc::channel::<WriteJob>();
        let handle = std::thread::Builder::new()
            .name("ckpt-writer".into())
            .spawn(move || {
                let mut written = Vec::new();
                let mut first_err = None;
                for job in rx {
                    let res = manager
                        .publish(job.bytes, job.step, job.metrics, job.tag)
                        .and_then(|id| {
                            if let Some(k) = job.keep_last {
                                manager.prune(k)?;
                            }
                            Ok(id)
                        });
                    match res {
                        Ok(id) => written.push(id),
                        Err(e) => {
                            warn!("background checkpoint write failed: {e}");
                            first_err.get_or_insert(e);
                        }
                    }
                }
                match first_err {
                    Some(e) => Err(e),
                    None => Ok(written),
                }
            });
        match handle {
            Ok(h) => Self { tx: Some(tx), handle: Some(h) },
            Err(e) => {
                warn!("could not start checkpoint writer thread: {e}");
                Self { tx: None, handle: None }
            }
        }
    }

    /// Snapshot the state now and queue it for publishing.
    #[allow(clippy::too_many_arguments)]
    pub fn submit(
        &self,
        params: &Parameters,
        optimizer: &OptimizerState,
        step: u64,
        metrics: Metrics,
        tag: CheckpointTag,
        model_config: &ModelConfig,
        keep_last: Option<usize>,
    ) -> Result<CheckpointId> {
        let bytes = encode_checkpoint(params, optimizer, step, metrics, tag, model_config)?;
        let job = WriteJob { bytes, step, metrics: metrics.sanitized(), tag, keep_last };
        let tx = self.tx.as_ref().ok_or_else(|| LmError::invalid("checkpoint writer is not running"))?;
        tx.send(job).map_err(|_| LmError::invalid("checkpoint writer has stopped"))?;
        Ok(CheckpointId::new(step, tag))
    }

    /// Wait for every queued write; returns the published ids or the first error.
    pub fn finish(mut self) -> Result<Vec<CheckpointId>> {
        self.join()
    }

    fn join(&mut self) -> Result<Vec<CheckpointId>> {
        drop(self.tx.take());
        match self.handle.take() {
            Some(h) => h
                .join()
                .unwrap_or_else(|_| Err(LmError::invalid("checkpoint writer thread panicked"))),
            None => Ok(Vec::new()),
        }
    }
}

impl Drop for BackgroundWriter {
    fn drop(&mut self) {
        if let Err(e) = self.join() {
            warn!("checkpoint writer: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rng::Rng;
    use tempfile::tempdir;

    fn cfg() -> ModelConfig {
        ModelConfig { vocab_size: 9, n_embd: 4, n_head: 2, n_layer: 1, block_size: 6 }
    }

    fn state(seed: u64) -> (Parameters, OptimizerState) {
        let c = cfg();
        let params = Parameters::init(&c, &mut Rng::new(seed));
        let mut opt = OptimizerState::new(&c);
        opt.step = 7;
        opt.m.wte[0] = 0.25;
        opt.v.lm_head[3] = 1e-4;
        (params, opt)
    }

    fn metrics(val: f32) -> Metrics {
        Metrics { train_loss: Some(val + 0.1), val_loss: Some(val), best_val_loss: Some(val) }
    }

    #[test]
    fn id_format() {
        assert_eq!(CheckpointId::new(42, CheckpointTag::Best).as_str(), "step-00000042-best");
        assert_eq!("best".parse::<Selector>().unwrap(), Selector::Best);
        assert_eq!(
            "step-00000001-regular".parse::<Selector>().unwrap(),
            Selector::Id(CheckpointId::new(1, CheckpointTag::Regular))
        );
    }

    #[test]
    fn save_then_load_is_identity() {
        let dir = tempdir().unwrap();
        let mgr = CheckpointManager::open(dir.path()).unwrap();
        let (params, opt) = state(1);
        let id = mgr.save(&params, &opt, 7, metrics(2.0), CheckpointTag::Regular, &cfg()).unwrap();
        assert!(dir.path().join(format!("{id}.ckpt")).exists());
        assert!(!dir.path().join(format!("{id}.ckpt.tmp")).exists());

        let back = mgr.load(&Selector::Id(id.clone())).unwrap();
        assert_eq!(back.params, params);
        assert_eq!(back.optimizer, opt);
        assert_eq!(back.step, 7);
        assert_eq!(back.model_config, cfg());
        assert_eq!(back.metrics.val_loss, Some(2.0));

        // a fresh manager sees the same history
        let again = CheckpointManager::open(dir.path()).unwrap();
        assert_eq!(again.list().len(), 1);
        assert_eq!(again.load(&Selector::Latest).unwrap().params, params);
    }

    #[test]
    fn best_is_lowest_validation_loss_not_latest() {
        let dir = tempdir().unwrap();
        let mgr = CheckpointManager::open(dir.path()).unwrap();
        let (params, opt) = state(2);
        mgr.save(&params, &opt, 100, metrics(2.0), CheckpointTag::Regular, &cfg()).unwrap();
        mgr.save(&params, &opt, 200, metrics(2.5), CheckpointTag::Regular, &cfg()).unwrap();
        assert_eq!(mgr.load(&Selector::Best).unwrap().step, 100);
        assert_eq!(mgr.load(&Selector::Latest).unwrap().step, 200);
    }

    #[test]
    fn missing_and_corrupt_are_distinguished() {
        let dir = tempdir().unwrap();
        let mgr = CheckpointManager::open(dir.path()).unwrap();
        assert!(matches!(mgr.load(&Selector::Latest), Err(LmError::CheckpointNotFound(_))));
        assert!(matches!(mgr.load(&"step-1".parse().unwrap()), Err(LmError::CheckpointNotFound(_))));

        let (params, opt) = state(3);
        let id = mgr.save(&params, &opt, 5, metrics(1.0), CheckpointTag::Regular, &cfg()).unwrap();
        let path = dir.path().join(format!("{id}.ckpt"));

        // flip one payload byte → checksum mismatch
        let mut bytes = fs::read(&path).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;
        fs::write(&path, &bytes).unwrap();
        assert!(matches!(mgr.load(&Selector::Latest), Err(LmError::CheckpointCorrupt { .. })));

        // truncate → corrupt
        fs::write(&path, &bytes[..bytes.len() / 2]).unwrap();
        assert!(matches!(mgr.load(&Selector::Latest), Err(LmError::CheckpointCorrupt { .. })));

        // wrong magic → corrupt
        fs::write(&path, b"NOTACKPTxxxxxxxx").unwrap();
        assert!(matches!(mgr.load(&Selector::Latest), Err(LmError::CheckpointCorrupt { .. })));

        fs::remove_file(&path).unwrap();
        assert!(matches!(mgr.load(&Selector::Latest), Err(LmError::CheckpointNotFound(_))));
    }

    #[test]
    fn prune_keeps_latest_and_best() {
        let dir = tempdir().unwrap();
        let mgr = CheckpointManager::open(dir.path()).unwrap();
        let (params, opt) = state(4);
        for (step, loss) in [(1, 1.0), (2, 3.0), (3, 4.0), (4, 5.0)] {
            mgr.save(&params, &opt, step, metrics(loss), CheckpointTag::Regular, &cfg()).unwrap();
        }
        let removed = mgr.prune(2).unwrap();
        assert_eq!(removed, vec![CheckpointId::new(2, CheckpointTag::Regular)]);
        let steps: Vec<u64> = mgr.list().iter().map(|e| e.step).collect();
        assert_eq!(steps, vec![1, 3, 4]);
        assert!(!dir.path().join("step-00000002-regular.ckpt").exists());
        assert_eq!(mgr.load(&Selector::Best).unwrap().step, 1);
    }

    #[test]
    fn background_writer_publishes_in_order() {
        let dir = tempdir().unwrap();
        let mgr = Arc::new(CheckpointManager::open(dir.path()).unwrap());
        let writer = BackgroundWriter::spawn(Arc::clone(&mgr));
        let (params, opt) = state(5);
        for step in 1..=3 {
            writer
                .submit(&params, &opt, step, metrics(step as f32), CheckpointTag::Regular, &cfg(), Some(2))
                .unwrap();
        }
        let written = writer.finish().unwrap();
        assert_eq!(written.len(), 3);
        let steps: Vec<u64> = mgr.list().iter().map(|e| e.step).collect();
        assert_eq!(steps, vec![1, 2, 3]);
    }

    #[test]
    fn published_ids_are_never_overwritten() {
        let dir = tempdir().unwrap();
        let mgr = CheckpointManager::open(dir.path()).unwrap();
        let (first, opt) = state(6);
        let (second, _) = state(7);
        let id = mgr.save(&first, &opt, 3, metrics(1.0), CheckpointTag::Regular, &cfg()).unwrap();
        let err = mgr.save(&second, &opt, 3, metrics(0.5), CheckpointTag::Regular, &cfg()).unwrap_err();
        assert!(matches!(err, LmError::CheckpointExists(_)), "{err}");

        assert_eq!(mgr.list().len(), 1);
        assert_eq!(mgr.load(&Selector::Id(id)).unwrap().params, first);
        assert_eq!(mgr.load(&Selector::Best).unwrap().metrics.val_loss, Some(1.0));
    }

    #[test]
    fn reads_proceed_while_another_checkpoint_is_being_written() {
        let dir = tempdir().unwrap();
        let mgr = CheckpointManager::open(dir.path()).unwrap();
        let (params, opt) = state(8);
        let done = mgr.save(&params, &opt, 1, metrics(2.0), CheckpointTag::Regular, &cfg()).unwrap();

        // an in-flight write holds a reservation, not the index lock
        let in_flight = CheckpointId::new(2, CheckpointTag::Regular);
        mgr.reserve(&in_flight).unwrap();
        assert_eq!(mgr.load(&Selector::Id(done.clone())).unwrap().step, 1);
        assert_eq!(mgr.load(&Selector::Latest).unwrap().id, done);
        assert_eq!(mgr.list().len(), 1);
        assert!(matches!(mgr.reserve(&in_flight), Err(LmError::CheckpointExists(_))));
        assert!(matches!(
            mgr.save(&params, &opt, 2, metrics(2.0), CheckpointTag::Regular, &cfg()),
            Err(LmError::CheckpointExists(_))
        ));
    }

    #[test]
    fn concurrent_saves_and_loads_all_complete() {
        let dir = tempdir().unwrap();
        let mgr = Arc::new(CheckpointManager::open(dir.path()).unwrap());
        let (params, opt) = state(9);
        mgr.save(&params, &opt, 1, metrics(3.0), CheckpointTag::Regular, &cfg()).unwrap();

        std::thread::scope(|s| {
            for step in 2..6u64 {
                let (mgr, params, opt) = (Arc::clone(&mgr), &params, &opt);
                s.spawn(move || {
                    mgr.save(params, opt, step, metrics(step as f32), CheckpointTag::Regular, &cfg()).unwrap();
                });
            }
            for _ in 0..20 {
                let first = CheckpointId::new(1, CheckpointTag::Regular);
                assert_eq!(mgr.load(&Selector::Id(first)).unwrap().params, params);
            }
        });
        let steps: std::collections::BTreeSet<u64> = mgr.list().iter().map(|e| e.step).collect();
        assert_eq!(steps.into_iter().collect::<Vec<_>>(), vec![1, 2, 3, 4, 5]);
        assert_eq!(CheckpointManager::open(dir.path()).unwrap().list().len(), 5);
    }
}
