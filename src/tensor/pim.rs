use crate::config::{AddrType, SimulationConfig};
use crate::memory::allocator::KvCacheAllocator;
use crate::tensor::{KvType, TensorMeta, TensorNode};
use crate::utils::div_ceil;

/// Cache tensor striped over one DRAM channel's PIM banks. Physical identity
/// is the bound channel plus the list of absolute row indices pulled from the
/// pool; element addressing goes through PIM command headers, not raw
/// addresses.
///
/// Layout per kv side, with E = n_embd and C = elements per DRAM row:
/// * KEY [h, d_k, seq_len]: groups of ceil(E / C) rows, one group per
///   bank_per_ch tokens. Successive tokens land on successive banks so keys
///   compare in parallel across banks.
/// * VALUE [h, seq_len, d_k]: groups of ceil(E / bank_per_ch) rows, one group
///   per C tokens. Value rows accumulate column-wise within one bank.
#[derive(Debug)]
pub struct PimTensor {
    meta: TensorMeta,
    kv_type: KvType,
    ch: u32,
    seq_len: u32,
    bank_per_ch: u32,
    num_ele_per_row: u32,
    rows_per_alloc: u32,
    rows: Vec<u64>,
}

impl PimTensor {
    pub fn new(
        meta: TensorMeta,
        ch: u32,
        kv_type: KvType,
        kv: &mut KvCacheAllocator,
        config: &SimulationConfig,
    ) -> Self {
        let seq_len = match kv_type {
            KvType::Key => meta.dims[2],
            KvType::Value => meta.dims[1],
        };
        let bank_per_ch = kv.bank_per_ch();
        let num_ele_per_row = kv.num_ele_per_row();
        let e = config.model_n_embd;

        let (rows_per_alloc, num_alloc_iter) = match kv_type {
            KvType::Key => (
                div_ceil(e as u64, num_ele_per_row as u64) as u32,
                div_ceil(seq_len as u64, bank_per_ch as u64) as u32,
            ),
            KvType::Value => (
                div_ceil(e as u64, bank_per_ch as u64) as u32,
                div_ceil(seq_len as u64, num_ele_per_row as u64) as u32,
            ),
        };

        let rows = (0..num_alloc_iter * rows_per_alloc)
            .map(|_| kv.allocate_row(ch))
            .collect();

        Self {
            meta,
            kv_type,
            ch,
            seq_len,
            bank_per_ch,
            num_ele_per_row,
            rows_per_alloc,
            rows,
        }
    }

    pub fn kv_type(&self) -> KvType {
        self.kv_type
    }

    pub fn channel(&self) -> u32 {
        self.ch
    }

    pub fn seq_len(&self) -> u32 {
        self.seq_len
    }

    pub fn num_rows(&self) -> usize {
        self.rows.len()
    }

    pub fn rows(&self) -> &[u64] {
        &self.rows
    }

    pub fn row(&self, idx: usize) -> u64 {
        self.rows[idx]
    }

    /// Seq-len capacity of the rows allocated so far, rounded to the layout
    /// stride.
    pub fn allocated_seq_len(&self) -> u32 {
        let stride = match self.kv_type {
            KvType::Key => self.bank_per_ch,
            KvType::Value => self.num_ele_per_row,
        } as u64;
        (div_ceil(self.seq_len as u64, stride) * stride) as u32
    }

    /// Hands every row back to the pool. Called once when the owning request
    /// completes.
    pub fn release_rows(&mut self, kv: &mut KvCacheAllocator) {
        for row in self.rows.drain(..) {
            kv.free_row(self.ch, row);
        }
        self.seq_len = 0;
    }
}

impl TensorNode for PimTensor {
    fn meta(&self) -> &TensorMeta {
        &self.meta
    }

    fn meta_mut(&mut self) -> &mut TensorMeta {
        &mut self.meta
    }

    /// Not used by the compute path; PIM tiles address memory through
    /// encoded command headers.
    fn get_addr(&self, _indexes: &[u32]) -> AddrType {
        0
    }

    fn get_all_addrs(&self) -> Vec<AddrType> {
        Vec::new()
    }

    fn add_token(&mut self, kv: &mut KvCacheAllocator) {
        self.seq_len += 1;
        match self.kv_type {
            KvType::Key => self.meta.dims[2] += 1,
            KvType::Value => self.meta.dims[1] += 1,
        }

        if self.seq_len <= self.allocated_seq_len() {
            return;
        }
        for _ in 0..self.rows_per_alloc {
            self.rows.push(kv.allocate_row(self.ch));
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::config::{RunMode, SimulationConfig};
    use crate::memory::allocator::AllocatorContext;
    use crate::tensor::{TensorArena, TensorNode};

    fn setup() -> (SimulationConfig, AllocatorContext, TensorArena) {
        let config = SimulationConfig {
            run_mode: RunMode::NpuPim,
            ..Default::default()
        };
        let mut alloc = AllocatorContext::new(&config);
        alloc.weight.allocate(1 << 20);
        alloc.init_runtime_regions(&config);
        (config, alloc, TensorArena::new())
    }

    #[test]
    fn key_growth_follows_bank_stride() {
        // E=1024, precision=2, page=1024B -> 512 elems/row, 16 banks/ch
        let (config, mut alloc, mut arena) = setup();
        let h = config.heads_per_rank();
        let d_k = config.d_k();
        let id = arena.create_pim(
            "key".into(),
            0,
            vec![h, d_k, 1],
            KvType::Key,
            true,
            &mut alloc.kv,
            &config,
        );

        // rows_per_alloc = ceil(1024 / 512) = 2
        assert_eq!(arena.get(id).as_pim().num_rows(), 2);

        // tokens 2..=16 fit in the first group
        for _ in 1..16 {
            arena.get_mut(id).add_token(&mut alloc.kv);
        }
        assert_eq!(arena.get(id).as_pim().num_rows(), 2);

        // token 17 crosses the bank stride
        arena.get_mut(id).add_token(&mut alloc.kv);
        let t = arena.get(id).as_pim();
        assert_eq!(t.seq_len(), 17);
        assert_eq!(t.num_rows(), 4);
        assert_eq!(t.meta().dims[2], 17);
    }

    #[test]
    fn value_growth_follows_row_stride() {
        let (config, mut alloc, mut arena) = setup();
        let h = config.heads_per_rank();
        let d_k = config.d_k();
        let id = arena.create_pim(
            "value".into(),
            0,
            vec![h, 1, d_k],
            KvType::Value,
            true,
            &mut alloc.kv,
            &config,
        );

        // rows_per_alloc = ceil(1024 / 16) = 64; stride = 512 tokens
        assert_eq!(arena.get(id).as_pim().num_rows(), 64);
        for _ in 1..512 {
            arena.get_mut(id).add_token(&mut alloc.kv);
        }
        assert_eq!(arena.get(id).as_pim().num_rows(), 64);
        arena.get_mut(id).add_token(&mut alloc.kv);
        assert_eq!(arena.get(id).as_pim().num_rows(), 128);
    }

    #[test]
    fn row_accounting_balances_per_channel() {
        let (config, mut alloc, mut arena) = setup();
        let initially = alloc.kv.rows_initially_free();
        let h = config.heads_per_rank();
        let d_k = config.d_k();

        let k = arena.create_pim(
            "k".into(),
            2,
            vec![h, d_k, 64],
            KvType::Key,
            true,
            &mut alloc.kv,
            &config,
        );
        let v = arena.create_pim(
            "v".into(),
            2,
            vec![h, 64, d_k],
            KvType::Value,
            true,
            &mut alloc.kv,
            &config,
        );

        let live = arena.get(k).as_pim().num_rows() + arena.get(v).as_pim().num_rows();
        assert_eq!(
            live as u64,
            initially - alloc.kv.free_rows_on(2)
        );
        assert_eq!(arena.get(k).as_pim().channel(), arena.get(v).as_pim().channel());
    }

    #[test]
    fn pim_tensors_expose_no_linear_addrs() {
        let (config, mut alloc, mut arena) = setup();
        let id = arena.create_pim(
            "k".into(),
            0,
            vec![config.heads_per_rank(), config.d_k(), 8],
            KvType::Key,
            true,
            &mut alloc.kv,
            &config,
        );
        assert_eq!(arena.get(id).get_addr(&[0, 0, 0]), 0);
        assert!(arena.get(id).get_all_addrs().is_empty());
    }
}
