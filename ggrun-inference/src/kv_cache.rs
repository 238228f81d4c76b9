use crate::configuration::ModelConfig;

#[cfg(test)]
#[path = "../tests/unit/kv_cache_test.rs"]
mod kv_cache_test;

/// Fixed-capacity key/value cache laid out as `[layers, kv_heads, capacity, head_dim]`.
///
/// Writes land at the current position; reads cover positions `0..=position`.
/// The position never exceeds `capacity - 1`, so a full cache keeps overwriting its last slot.
pub struct KvCache {
    n_layers: usize,
    n_kv_heads: usize,
    capacity: usize,
    head_dim: usize,
    keys: Vec<f32>,
    values: Vec<f32>,
    position: usize,
}

impl KvCache {
    pub fn new(n_layers: usize, n_kv_heads: usize, capacity: usize, head_dim: usize) -> Self {
        let capacity = capacity.max(1);
        let len = n_layers * n_kv_heads * capacity * head_dim;
        Self { n_layers, n_kv_heads, capacity, head_dim, keys: vec![0.0; len], values: vec![0.0; len], position: 0 }
    }

    pub fn for_model(config: &ModelConfig, capacity: usize) -> Self {
        Self::new(config.n_layers, config.n_kv_heads, capacity, config.head_dim)
    }

    pub fn position(&self) -> usize {
        self.position
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn size_bytes(&self) -> usize {
        (self.keys.len() + self.values.len()) * std::mem::size_of::<f32>()
    }

    fn slot(&self, layer: usize, kv_head: usize, pos: usize) -> usize {
        debug_assert!(layer < self.n_layers && kv_head < self.n_kv_heads && pos < self.capacity);
        ((layer * self.n_kv_heads + kv_head) * self.capacity + pos) * self.head_dim
    }

    /// Stores one head's key and value at the current position.
    pub fn write(&mut self, layer: usize, kv_head: usize, key: &[f32], value: &[f32]) {
        let start = self.slot(layer, kv_head, self.position);
        let end = start + self.head_dim;
        self.keys[start..end].copy_from_slice(&key[..self.head_dim]);
        self.values[start..end].copy_from_slice(&value[..self.head_dim]);
    }

    /// Keys for positions `0..=position`, `head_dim` values each.
    pub fn keys(&self, layer: usize, kv_head: usize) -> &[f32] {
        let start = self.slot(layer, kv_head, 0);
        &self.keys[start..start + (self.position + 1) * self.head_dim]
    }

    /// Values for positions `0..=position`, `head_dim` values each.
    pub fn values(&self, layer: usize, kv_head: usize) -> &[f32] {
        let start = self.slot(layer, kv_head, 0);
        &self.values[start..start + (self.position + 1) * self.head_dim]
    }

    /// Moves to the next position, saturating at the last slot.
    pub fn advance(&mut self) -> usize {
        self.position = (self.position + 1).min(self.capacity - 1);
        self.position
    }

    pub fn reset(&mut self) {
        self.position = 0;
        self.keys.fill(0.0);
        self.values.fill(0.0);
    }
}

impl std::fmt::Debug for KvCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KvCache")
            .field("layers", &self.n_layers)
            .field("kv_heads", &self.n_kv_heads)
            .field("capacity", &self.capacity)
            .field("head_dim", &self.head_dim)
            .field("position", &self.position)
            .finish()
    }
}
