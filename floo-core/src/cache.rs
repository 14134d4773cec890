//! KV-Cache Block Model
//!
//! Models the per-instance KV cache as a pool of fixed-size blocks plus the
//! staging buffer migrations copy through:
//! - Block pool layout: per block, `layers x {K,V} x block_elements`
//! - Staging layout: `layers x {K,V} x slot x block_elements`
//! - Head-axis split/concat used when source and destination tensor-parallel
//!   widths differ

use serde::{Deserialize, Serialize};

use floo_common::{Error, Result};

/// Shape of the KV cache held by one worker
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct KvCacheSpec {
    /// Token positions per block
    pub block_size: usize,
    pub num_kv_heads: usize,
    pub head_size: usize,
    pub num_layers: usize,
    /// Size of the block pool, fixed at startup
    pub num_gpu_blocks: usize,
}

impl KvCacheSpec {
    /// Elements per block per layer per K/V tensor
    pub fn block_elements(&self) -> usize {
        self.block_size * self.num_kv_heads * self.head_size
    }

    /// Total elements one block occupies across all layers and both tensors
    pub fn block_total_elements(&self) -> usize {
        self.num_layers * 2 * self.block_elements()
    }

    pub fn block_bytes(&self) -> usize {
        self.block_total_elements() * std::mem::size_of::<f32>()
    }
}

impl Default for KvCacheSpec {
    fn default() -> Self {
        Self {
            block_size: 16,
            num_kv_heads: 8,
            head_size: 16,
            num_layers: 4,
            num_gpu_blocks: 256,
        }
    }
}

/// A batch of blocks copied out of the live pool, in staging layout.
///
/// This is the value the transport moves between workers. Layout is
/// `[layer][kv][block][position][head][head_elem]`, flattened.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StagingPayload {
    pub num_blocks: usize,
    pub num_layers: usize,
    pub block_size: usize,
    pub num_heads: usize,
    pub head_size: usize,
    pub data: Vec<f32>,
}

impl StagingPayload {
    pub fn zeroed(
        num_blocks: usize,
        num_layers: usize,
        block_size: usize,
        num_heads: usize,
        head_size: usize,
    ) -> Self {
        let len = num_layers * 2 * num_blocks * block_size * num_heads * head_size;
        Self {
            num_blocks,
            num_layers,
            block_size,
            num_heads,
            head_size,
            data: vec![0.0; len],
        }
    }

    fn index(&self, layer: usize, kv: usize, block: usize, pos: usize, head: usize) -> usize {
        ((((layer * 2 + kv) * self.num_blocks + block) * self.block_size + pos) * self.num_heads
            + head)
            * self.head_size
    }

    /// Split along the head axis into `chunk_size` equal slices.
    ///
    /// Slice `r` holds heads `[r * num_heads / chunk_size, (r + 1) * num_heads / chunk_size)`.
    pub fn split_heads(&self, chunk_size: usize) -> Result<Vec<StagingPayload>> {
        if chunk_size == 0 || self.num_heads % chunk_size != 0 {
            return Err(Error::InvalidConfig(format!(
                "cannot split {} kv heads into {} slices",
                self.num_heads, chunk_size
            )));
        }
        if chunk_size == 1 {
            return Ok(vec![self.clone()]);
        }
        let heads_per_chunk = self.num_heads / chunk_size;
        let mut slices = Vec::with_capacity(chunk_size);
        for rank in 0..chunk_size {
            let mut slice = StagingPayload::zeroed(
                self.num_blocks,
                self.num_layers,
                self.block_size,
                heads_per_chunk,
                self.head_size,
            );
            for layer in 0..self.num_layers {
                for kv in 0..2 {
                    for block in 0..self.num_blocks {
                        for pos in 0..self.block_size {
                            let src = self.index(layer, kv, block, pos, rank * heads_per_chunk);
                            let dst = slice.index(layer, kv, block, pos, 0);
                            let len = heads_per_chunk * self.head_size;
                            slice.data[dst..dst + len]
                                .copy_from_slice(&self.data[src..src + len]);
                        }
                    }
                }
            }
            slices.push(slice);
        }
        Ok(slices)
    }

    /// Concatenate slices along the head axis, inverse of [`split_heads`].
    ///
    /// [`split_heads`]: StagingPayload::split_heads
    pub fn concat_heads(slices: &[StagingPayload]) -> Result<StagingPayload> {
        let first = slices
            .first()
            .ok_or_else(|| Error::InvalidConfig("cannot concat zero slices".to_string()))?;
        if slices.len() == 1 {
            return Ok(first.clone());
        }
        for slice in slices {
            if slice.num_blocks != first.num_blocks
                || slice.num_layers != first.num_layers
                || slice.block_size != first.block_size
                || slice.num_heads != first.num_heads
                || slice.head_size != first.head_size
            {
                return Err(Error::Transport(
                    "received head slices with mismatched shapes".to_string(),
                ));
            }
        }
        let mut out = StagingPayload::zeroed(
            first.num_blocks,
            first.num_layers,
            first.block_size,
            first.num_heads * slices.len(),
            first.head_size,
        );
        for (rank, slice) in slices.iter().enumerate() {
            for layer in 0..slice.num_layers {
                for kv in 0..2 {
                    for block in 0..slice.num_blocks {
                        for pos in 0..slice.block_size {
                            let src = slice.index(layer, kv, block, pos, 0);
                            let dst = out.index(layer, kv, block, pos, rank * slice.num_heads);
                            let len = slice.num_heads * slice.head_size;
                            out.data[dst..dst + len]
                                .copy_from_slice(&slice.data[src..src + len]);
                        }
                    }
                }
            }
        }
        Ok(out)
    }
}

/// The live block pool of one worker.
///
/// Stands in for GPU memory: the model executor's swap primitive is exposed
/// as [`read_blocks`] (GPU -> staging) and [`write_blocks`] (staging -> GPU).
///
/// [`read_blocks`]: KvCacheStore::read_blocks
/// [`write_blocks`]: KvCacheStore::write_blocks
#[derive(Debug)]
pub struct KvCacheStore {
    spec: KvCacheSpec,
    // [block] -> [layer][kv][block_elements], flattened per block
    blocks: Vec<Vec<f32>>,
}

impl KvCacheStore {
    pub fn new(spec: KvCacheSpec) -> Self {
        let blocks = (0..spec.num_gpu_blocks)
            .map(|_| vec![0.0; spec.num_layers * 2 * spec.block_elements()])
            .collect();
        Self { spec, blocks }
    }

    pub fn spec(&self) -> &KvCacheSpec {
        &self.spec
    }

    fn block_offset(&self, layer: usize, kv: usize) -> usize {
        (layer * 2 + kv) * self.spec.block_elements()
    }

    /// Copy `blocks` out of the pool into a staging payload, layer by layer.
    pub fn read_blocks(&self, blocks: &[usize]) -> Result<StagingPayload> {
        let mut payload = StagingPayload::zeroed(
            blocks.len(),
            self.spec.num_layers,
            self.spec.block_size,
            self.spec.num_kv_heads,
            self.spec.head_size,
        );
        let elems = self.spec.block_elements();
        for layer in 0..self.spec.num_layers {
            for kv in 0..2 {
                for (slot, &block) in blocks.iter().enumerate() {
                    let data = self.blocks.get(block).ok_or_else(|| {
                        Error::System(format!("block index {} out of range", block))
                    })?;
                    let src = self.block_offset(layer, kv);
                    let dst = payload.index(layer, kv, slot, 0, 0);
                    payload.data[dst..dst + elems].copy_from_slice(&data[src..src + elems]);
                }
            }
        }
        Ok(payload)
    }

    /// Copy a staging payload into the pool at `blocks`, layer by layer.
    pub fn write_blocks(&mut self, payload: &StagingPayload, blocks: &[usize]) -> Result<()> {
        if payload.num_blocks != blocks.len() {
            return Err(Error::Transport(format!(
                "payload carries {} blocks, destination expects {}",
                payload.num_blocks,
                blocks.len()
            )));
        }
        if payload.num_heads != self.spec.num_kv_heads
            || payload.head_size != self.spec.head_size
            || payload.num_layers != self.spec.num_layers
            || payload.block_size != self.spec.block_size
        {
            return Err(Error::Transport(
                "payload shape does not match destination cache".to_string(),
            ));
        }
        let elems = self.spec.block_elements();
        for layer in 0..self.spec.num_layers {
            for kv in 0..2 {
                for (slot, &block) in blocks.iter().enumerate() {
                    let data = self.blocks.get_mut(block).ok_or_else(|| {
                        Error::System(format!("block index {} out of range", block))
                    })?;
                    let src = payload.index(layer, kv, slot, 0, 0);
                    let dst = (layer * 2 + kv) * elems;
                    data[dst..dst + elems].copy_from_slice(&payload.data[src..src + elems]);
                }
            }
        }
        Ok(())
    }

    /// Fill a block with a deterministic pattern derived from `seed`.
    pub fn fill_block(&mut self, block: usize, seed: u64) {
        if let Some(data) = self.blocks.get_mut(block) {
            for (i, v) in data.iter_mut().enumerate() {
                *v = ((seed as f64 * 31.0 + i as f64).sin() * 1000.0) as f32;
            }
        }
    }

    /// Raw contents of one block, for equality checks in tests.
    pub fn block_data(&self, block: usize) -> Option<&[f32]> {
        self.blocks.get(block).map(|b| b.as_slice())
    }

    /// Heads slice of one block's contents, as a destination worker with
    /// `1 / chunk_size` of the heads would hold it.
    pub fn block_head_slice(&self, block: usize, chunk_size: usize, chunk_rank: usize) -> Vec<f32> {
        let data = &self.blocks[block];
        let heads_per_chunk = self.spec.num_kv_heads / chunk_size;
        let mut out = Vec::with_capacity(data.len() / chunk_size);
        for layer in 0..self.spec.num_layers {
            for kv in 0..2 {
                let base = self.block_offset(layer, kv);
                for pos in 0..self.spec.block_size {
                    let start = base
                        + (pos * self.spec.num_kv_heads + chunk_rank * heads_per_chunk)
                            * self.spec.head_size;
                    out.extend_from_slice(
                        &data[start..start + heads_per_chunk * self.spec.head_size],
                    );
                }
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_spec() -> KvCacheSpec {
        KvCacheSpec {
            block_size: 2,
            num_kv_heads: 4,
            head_size: 3,
            num_layers: 2,
            num_gpu_blocks: 8,
        }
    }

    #[test]
    fn test_spec_sizes() {
        let spec = small_spec();
        assert_eq!(spec.block_elements(), 2 * 4 * 3);
        assert_eq!(spec.block_total_elements(), 2 * 2 * 24);
        assert_eq!(spec.block_bytes(), 96 * 4);
    }

    #[test]
    fn test_swap_roundtrip() {
        let spec = small_spec();
        let mut src = KvCacheStore::new(spec);
        let mut dst = KvCacheStore::new(spec);
        src.fill_block(1, 7);
        src.fill_block(3, 11);

        let payload = src.read_blocks(&[1, 3]).unwrap();
        dst.write_blocks(&payload, &[5, 0]).unwrap();

        assert_eq!(src.block_data(1), dst.block_data(5));
        assert_eq!(src.block_data(3), dst.block_data(0));
    }

    #[test]
    fn test_split_concat_roundtrip() {
        let spec = small_spec();
        let mut store = KvCacheStore::new(spec);
        store.fill_block(0, 42);
        store.fill_block(2, 43);

        let payload = store.read_blocks(&[0, 2]).unwrap();
        let slices = payload.split_heads(2).unwrap();
        assert_eq!(slices.len(), 2);
        assert_eq!(slices[0].num_heads, 2);

        let rejoined = StagingPayload::concat_heads(&slices).unwrap();
        assert_eq!(rejoined, payload);
    }

    #[test]
    fn test_split_slice_matches_head_range() {
        let spec = small_spec();
        let mut store = KvCacheStore::new(spec);
        store.fill_block(4, 9);

        let payload = store.read_blocks(&[4]).unwrap();
        let slices = payload.split_heads(2).unwrap();

        // Slice 1 must hold exactly heads [2, 4) of the original block.
        let mut expected = StagingPayload::zeroed(1, spec.num_layers, spec.block_size, 2, 3);
        for layer in 0..spec.num_layers {
            for kv in 0..2 {
                for pos in 0..spec.block_size {
                    let src = payload.index(layer, kv, 0, pos, 2);
                    let dst = expected.index(layer, kv, 0, pos, 0);
                    expected.data[dst..dst + 6].copy_from_slice(&payload.data[src..src + 6]);
                }
            }
        }
        assert_eq!(slices[1], expected);
    }

    #[test]
    fn test_split_rejects_uneven_chunks() {
        let payload = StagingPayload::zeroed(1, 2, 2, 4, 3);
        assert!(payload.split_heads(3).is_err());
        assert!(payload.split_heads(0).is_err());
    }

    #[test]
    fn test_payload_survives_serialization() {
        let spec = small_spec();
        let mut store = KvCacheStore::new(spec);
        store.fill_block(1, 3);
        let payload = store.read_blocks(&[1]).unwrap();

        let wire = serde_json::to_string(&payload).unwrap();
        let decoded: StagingPayload = serde_json::from_str(&wire).unwrap();
        assert_eq!(decoded, payload);
    }

    #[test]
    fn test_write_rejects_shape_mismatch() {
        let spec = small_spec();
        let mut store = KvCacheStore::new(spec);
        let payload = StagingPayload::zeroed(2, spec.num_layers, spec.block_size, 2, 3);
        assert!(store.write_blocks(&payload, &[0, 1]).is_err());
        let payload = StagingPayload::zeroed(1, spec.num_layers, spec.block_size, 4, 3);
        assert!(store.write_blocks(&payload, &[0, 1]).is_err());
    }
}
