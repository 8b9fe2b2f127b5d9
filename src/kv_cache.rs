/* ------------------------------------------------------------------ */
/* Per-session key/value cache for incremental decoding              */
/* ------------------------------------------------------------------ */
//
// Layout per layer: keys and values are flat [positions × C] buffers, one
// row per processed position, heads side by side inside the row. Rows are
// only ever appended; nothing is rewritten while a generation call runs.
// Storage grows in GROW_POSITIONS steps, capped at the model context, so a
// short generation never pays for a full-context allocation.

use crate::config::ModelConfig;

const GROW_POSITIONS: usize = 64;

#[derive(Debug, Clone, Default)]
struct LayerKv {
    keys:   Vec<f32>,
    values: Vec<f32>,
}

#[derive(Debug, Clone)]
pub struct KvCache {
    n_embd:     usize,
    block_size: usize,
    layers:     Vec<LayerKv>,
}

impl KvCache {
    pub fn new(config: &ModelConfig) -> Self {
        Self {
            n_embd:     config.n_embd,
            block_size: config.block_size,
            layers:     (0..config.n_layer).map(|_| LayerKv::default()).collect(),
        }
    }

    /// Number of fully processed positions (identical across layers between steps).
    pub fn len(&self) -> usize {
        self.layers.last().map_or(0, |l| l.keys.len() / self.n_embd)
    }

    pub fn is_empty(&self) -> bool { self.len() == 0 }

    pub fn n_layers(&self) -> usize { self.layers.len() }

    /// Positions the current allocation holds without growing.
    pub fn capacity(&self) -> usize {
        self.layers.first().map_or(0, |l| l.keys.capacity() / self.n_embd)
    }

    /// Keys of `layer` for every cached position, [len × C].
    pub fn keys(&self, layer: usize) -> &[f32] { &self.layers[layer].keys }

    pub fn values(&self, layer: usize) -> &[f32] { &self.layers[layer].values }

    pub(crate) fn append(&mut self, layer: usize, k: &[f32], v: &[f32]) {
        debug_assert_eq!(k.len() % self.n_embd, 0);
        debug_assert_eq!(k.len(), v.len());
        let c = self.n_embd;
        let block_size = self.block_size;
        let l = &mut self.layers[layer];
        let needed = l.keys.len() + k.len();
        if needed > l.keys.capacity() {
            let positions = (needed / c).div_ceil(GROW_POSITIONS) * GROW_POSITIONS;
            let target = positions.min(block_size).max(needed / c) * c;
            l.keys.reserve_exact(target - l.keys.len());
            l.values.reserve_exact(target - l.values.len());
        }
        l.keys.extend_from_slice(k);
        l.values.extend_from_slice(v);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> ModelConfig {
        ModelConfig { vocab_size: 5, n_embd: 4, n_head: 2, n_layer: 3, block_size: 100 }
    }

    #[test]
    fn append_grows_every_layer_in_lockstep() {
        let mut cache = KvCache::new(&cfg());
        assert!(cache.is_empty());
        for pos in 0..3 {
            for layer in 0..3 {
                let row = [pos as f32; 4];
                cache.append(layer, &row, &row);
            }
            assert_eq!(cache.len(), pos + 1);
        }
        assert_eq!(cache.keys(1).len(), 3 * 4);
        assert_eq!(&cache.values(2)[8..12], &[2.0; 4]);
    }

    #[test]
    fn growth_is_chunked_and_capped_by_context() {
        let mut cache = KvCache::new(&cfg());
        cache.append(0, &[0.0; 4], &[0.0; 4]);
        assert!(cache.capacity() >= GROW_POSITIONS);
        let big = vec![1.0; 90 * 4];
        cache.append(0, &big, &big);
        assert!(cache.capacity() >= 91);
        assert!(cache.capacity() <= 100 + GROW_POSITIONS);
    }

    #[test]
    fn earlier_rows_are_never_touched() {
        let mut cache = KvCache::new(&cfg());
        cache.append(0, &[1.0, 2.0, 3.0, 4.0], &[5.0; 4]);
        let before = cache.keys(0).to_vec();
        cache.append(0, &[9.0; 4], &[9.0; 4]);
        assert_eq!(&cache.keys(0)[..4], before.as_slice());
    }
}
