use crate::config::AddrType;
use crate::memory::allocator::{AllocatorContext, KvCacheAllocator};
use crate::tensor::{KvType, TensorMeta, TensorNode};

/// Backing region for a linear NPU tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NpuBufType {
    Weight,
    Act,
}

/// Tokens covered by one KV pool entry. Must match the pool's entry sizing.
const ENTRY_TOKENS: u32 = 32;

/// One 2D shard of an NPU tensor: either a contiguous buffer or a KV shard
/// assembled from pool entries. A 3D tensor [h, l, d] is stored as h shards
/// of [l, d], which keeps each head's bursts contiguous for the systolic
/// array.
#[derive(Debug)]
pub enum NpuInner {
    Buffer(NpuBuffer),
    Kv(NpuKvShard),
}

#[derive(Debug)]
pub struct NpuBuffer {
    base: AddrType,
    rows: u32,
    cols: u32,
    precision: u32,
}

impl NpuBuffer {
    fn get_addr(&self, row: u32, col: u32, transposed: bool) -> AddrType {
        assert!(row < self.rows && col < self.cols, "index out of shape");
        let offset = if transposed {
            // swap the two stride multipliers
            col as u64 * self.rows as u64 + row as u64
        } else {
            row as u64 * self.cols as u64 + col as u64
        };
        self.base + offset * self.precision as u64
    }

    fn all_addrs(&self, out: &mut Vec<AddrType>) {
        let total = self.rows as u64 * self.cols as u64;
        for i in 0..total {
            out.push(self.base + i * self.precision as u64);
        }
    }
}

/// One head's KV shard. Storage is token-major over fixed 32-token pool
/// entries; the logical index order depends on whether this is a key shard
/// ([d_k, seq_len]) or a value shard ([seq_len, d_k]).
#[derive(Debug)]
pub struct NpuKvShard {
    kv_type: KvType,
    d_k: u32,
    seq_len: u32,
    entries: Vec<AddrType>,
    precision: u32,
}

impl NpuKvShard {
    fn token_addr(&self, token: u32, d: u32) -> AddrType {
        assert!(token < self.seq_len, "token {} beyond seq_len {}", token, self.seq_len);
        let entry = self.entries[(token / ENTRY_TOKENS) as usize];
        let offset = (token % ENTRY_TOKENS) as u64 * self.d_k as u64 + d as u64;
        entry + offset * self.precision as u64
    }

    fn get_addr(&self, i: u32, j: u32) -> AddrType {
        match self.kv_type {
            KvType::Key => self.token_addr(j, i),
            KvType::Value => self.token_addr(i, j),
        }
    }

    fn all_addrs(&self, out: &mut Vec<AddrType>) {
        for token in 0..self.seq_len {
            for d in 0..self.d_k {
                out.push(self.token_addr(token, d));
            }
        }
    }

    fn add_token(&mut self, kv: &mut KvCacheAllocator) {
        self.seq_len += 1;
        let capacity = self.entries.len() as u32 * ENTRY_TOKENS;
        if self.seq_len > capacity {
            self.entries.push(kv.allocate());
        }
    }
}

/// Linear/strided tensor resident in the weight or activation region, or in
/// the NPU-layout KV pool.
#[derive(Debug)]
pub struct NpuTensor {
    meta: TensorMeta,
    inners: Vec<NpuInner>,
    transposed: bool,
}

impl NpuTensor {
    /// Builds the shard list and claims backing storage from the matching
    /// region. 2D shapes get one shard, 3D shapes one per leading dim.
    pub fn new(meta: TensorMeta, buf_type: NpuBufType, alloc: &mut AllocatorContext) -> Self {
        let (num_inners, rows, cols) = split_dims(&meta.dims);
        let precision = meta.precision;
        let shard_bytes = rows as u64 * cols as u64 * precision as u64;
        let inners = (0..num_inners)
            .map(|_| {
                let base = match buf_type {
                    NpuBufType::Weight => alloc.weight.allocate(shard_bytes),
                    NpuBufType::Act => alloc.activation.allocate(shard_bytes),
                };
                NpuInner::Buffer(NpuBuffer {
                    base,
                    rows,
                    cols,
                    precision,
                })
            })
            .collect();
        Self {
            meta,
            inners,
            transposed: false,
        }
    }

    /// KV variant: [h, d_k, seq_len] keys or [h, seq_len, d_k] values, one
    /// shard per head, each shard a list of 32-token pool entries.
    pub fn new_kv(meta: TensorMeta, kv_type: KvType, kv: &mut KvCacheAllocator) -> Self {
        assert!(meta.dims.len() == 3, "KV tensor must be 3D");
        let (seq_len, d_k) = match kv_type {
            KvType::Key => (meta.dims[2], meta.dims[1]),
            KvType::Value => (meta.dims[1], meta.dims[2]),
        };
        let precision = meta.precision;
        let num_entries = seq_len.div_ceil(ENTRY_TOKENS);
        let inners = (0..meta.dims[0])
            .map(|_| {
                let entries = (0..num_entries).map(|_| kv.allocate()).collect();
                NpuInner::Kv(NpuKvShard {
                    kv_type,
                    d_k,
                    seq_len,
                    entries,
                    precision,
                })
            })
            .collect();
        Self {
            meta,
            inners,
            transposed: false,
        }
    }

    pub fn set_transposed(&mut self) {
        self.transposed = true;
    }

    pub fn unset_transposed(&mut self) {
        self.transposed = false;
    }

    pub fn is_transposed(&self) -> bool {
        self.transposed
    }

    pub fn num_inners(&self) -> usize {
        self.inners.len()
    }

    /// Element addresses of one shard, row-major.
    pub fn inner_all_addrs(&self, idx: usize) -> Vec<AddrType> {
        let mut out = Vec::new();
        match &self.inners[idx] {
            NpuInner::Buffer(buf) => buf.all_addrs(&mut out),
            NpuInner::Kv(shard) => shard.all_addrs(&mut out),
        }
        out
    }

    fn kv_type(&self) -> Option<KvType> {
        match self.inners.first() {
            Some(NpuInner::Kv(shard)) => Some(shard.kv_type),
            _ => None,
        }
    }
}

/// 2D shapes map to a single shard; 3D shapes to one shard per leading dim.
fn split_dims(dims: &[u32]) -> (u32, u32, u32) {
    match dims.len() {
        2 => (1, dims[0], dims[1]),
        3 => (dims[0], dims[1], dims[2]),
        n => panic!("unsupported tensor rank {}", n),
    }
}

impl TensorNode for NpuTensor {
    fn meta(&self) -> &TensorMeta {
        &self.meta
    }

    fn meta_mut(&mut self) -> &mut TensorMeta {
        &mut self.meta
    }

    fn get_addr(&self, indexes: &[u32]) -> AddrType {
        let (inner_idx, row, col) = match indexes.len() {
            2 => (0, indexes[0], indexes[1]),
            3 => (indexes[0] as usize, indexes[1], indexes[2]),
            n => panic!("unsupported index rank {}", n),
        };
        match &self.inners[inner_idx] {
            NpuInner::Buffer(buf) => buf.get_addr(row, col, self.transposed),
            NpuInner::Kv(shard) => shard.get_addr(row, col),
        }
    }

    fn get_all_addrs(&self) -> Vec<AddrType> {
        let mut out = Vec::new();
        for inner in &self.inners {
            match inner {
                NpuInner::Buffer(buf) => buf.all_addrs(&mut out),
                NpuInner::Kv(shard) => shard.all_addrs(&mut out),
            }
        }
        out
    }

    fn add_token(&mut self, kv: &mut KvCacheAllocator) {
        let kv_type = self
            .kv_type()
            .expect("add_token on a non-KV tensor");
        match kv_type {
            KvType::Key => self.meta.dims[2] += 1,
            KvType::Value => self.meta.dims[1] += 1,
        }
        for inner in &mut self.inners {
            match inner {
                NpuInner::Kv(shard) => shard.add_token(kv),
                NpuInner::Buffer(_) => unreachable!("mixed KV/buffer shards"),
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::config::{RunMode, SimulationConfig};
    use crate::memory::allocator::AllocatorContext;
    use crate::tensor::{TensorArena, TensorNode};

    fn ctx() -> (SimulationConfig, AllocatorContext) {
        let config = SimulationConfig {
            run_mode: RunMode::NpuOnly,
            ..Default::default()
        };
        let mut alloc = AllocatorContext::new(&config);
        alloc.weight.allocate(1 << 20);
        alloc.init_runtime_regions(&config);
        (config, alloc)
    }

    #[test]
    fn strided_addressing_honors_transpose() {
        let (config, mut alloc) = ctx();
        let mut arena = TensorArena::new();
        let id = arena.create_npu(
            "x".into(),
            vec![4, 8],
            NpuBufType::Act,
            true,
            &mut alloc,
            &config,
        );
        let base = arena.get(id).get_addr(&[0, 0]);
        assert_eq!(arena.get(id).get_addr(&[1, 2]), base + (8 + 2) * 2);

        match arena.get_mut(id) {
            crate::tensor::Tensor::Npu(t) => t.set_transposed(),
            _ => unreachable!(),
        }
        assert_eq!(arena.get(id).get_addr(&[1, 2]), base + (2 * 4 + 1) * 2);
    }

    #[test]
    fn three_d_tensor_shards_per_head() {
        let (config, mut alloc) = ctx();
        let mut arena = TensorArena::new();
        let id = arena.create_npu(
            "act3d".into(),
            vec![8, 2, 128],
            NpuBufType::Act,
            false,
            &mut alloc,
            &config,
        );
        let t = arena.get(id).as_npu();
        assert_eq!(t.num_inners(), 8);
        // all (head, row, col) element addresses exactly once
        assert_eq!(t.get_all_addrs().len(), 8 * 2 * 128);
    }

    #[test]
    fn kv_shard_grows_by_entry() {
        let (config, mut alloc) = ctx();
        let mut arena = TensorArena::new();
        let h = config.heads_per_rank();
        let d_k = config.d_k();
        let id = arena.create_npu_kv(
            "key".into(),
            vec![h, d_k, 32],
            KvType::Key,
            true,
            &mut alloc,
            &config,
        );

        let entries_before = match &arena.get(id).as_npu().inners[0] {
            NpuInner::Kv(s) => s.entries.len(),
            _ => unreachable!(),
        };
        arena.get_mut(id).add_token(&mut alloc.kv);
        let t = arena.get(id).as_npu();
        assert_eq!(t.meta().dims[2], 33);
        let entries_after = match &t.inners[0] {
            NpuInner::Kv(s) => s.entries.len(),
            _ => unreachable!(),
        };
        // 33 tokens need a second 32-token entry
        assert_eq!(entries_after, entries_before + 1);
    }
}
