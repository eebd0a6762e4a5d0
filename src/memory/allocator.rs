use log::debug;

use crate::config::{AddrType, RunMode, SimulationConfig};
use crate::utils::div_ceil;

/// Bump allocator for model weights, never freed. The allocation unit is one
/// full-channel stripe (`dram_req_size * dram_channels` bytes) so every
/// weight burst saturates all channels. The top pointer counts stripes, not
/// bytes; `next_aligned_addr` aligns that count as the downstream regions
/// expect.
#[derive(Debug)]
pub struct WeightAllocator {
    top_addr: AddrType,
    unit: u64,
    alignment: u64,
}

impl WeightAllocator {
    pub fn new(config: &SimulationConfig) -> Self {
        Self {
            top_addr: 0,
            unit: config.dram_req_size as u64 * config.dram_channels as u64,
            alignment: config.dram_req_size as u64,
        }
    }

    pub fn allocate(&mut self, size: u64) -> AddrType {
        let result = self.top_addr;
        self.top_addr += div_ceil(size, self.unit);
        result
    }

    /// Aligned top plus one alignment unit of gap. The activation region
    /// starts here.
    pub fn next_aligned_addr(&self) -> AddrType {
        assert!(self.top_addr > 0, "no weights allocated yet");
        align_down(self.top_addr, self.alignment) + self.alignment
    }
}

/// Scoped bump allocator inside a fixed activation buffer. `flush` resets the
/// arena between inference steps; nothing allocated here outlives a step.
#[derive(Debug)]
pub struct ActivationAllocator {
    base_addr: AddrType,
    top_addr: AddrType,
    buf_size: u64,
    buf_limit: AddrType,
    alignment: u64,
}

impl ActivationAllocator {
    pub fn new(config: &SimulationConfig) -> Self {
        Self {
            base_addr: 0,
            top_addr: 0,
            buf_size: config.HBM_act_buf_size,
            buf_limit: 0,
            alignment: config.dram_req_size as u64,
        }
    }

    pub fn init(&mut self, base_addr: AddrType) {
        self.base_addr = base_addr;
        self.top_addr = base_addr;
        self.buf_limit = base_addr + self.buf_size;
        debug!(
            "activation buffer [{:#x}, {:#x})",
            self.base_addr, self.buf_limit
        );
    }

    pub fn allocate(&mut self, size: u64) -> AddrType {
        assert!(
            self.top_addr + size < self.buf_limit,
            "activation buffer overflow: top {:#x} + {} exceeds limit {:#x}",
            self.top_addr,
            size,
            self.buf_limit
        );
        let result = self.top_addr;
        self.top_addr += size;
        if self.top_addr & (self.alignment - 1) != 0 {
            self.top_addr += self.alignment - (self.top_addr & (self.alignment - 1));
        }
        result
    }

    /// Aligned end of the activation buffer plus one alignment unit. The KV
    /// cache region starts here.
    pub fn next_aligned_addr(&self) -> AddrType {
        assert!(self.base_addr > 0, "activation allocator not initialized");
        assert!(self.buf_size > 0, "activation buffer has zero size");
        align_down(self.buf_limit, self.alignment) + self.alignment
    }

    /// Resets the arena. Called between inference steps.
    pub fn flush(&mut self) {
        self.top_addr = self.base_addr;
    }
}

/// Matrix rows held by one DRAM PIM row.
const ROW_PER_BANK: u64 = 32768;
/// log2 of one DRAM row in bytes (1 MiB rows).
const ROW_OFFSET: u32 = 20;
/// Tokens covered by one NPU-layout cache entry.
const ENTRY_TOKENS: u64 = 32;

/// Pool allocator for the KV cache. Exactly one of the two layouts is live,
/// chosen by the run mode: the NPU layout hands out fixed-size linear entries
/// (32 tokens of one head), the PIM layout hands out DRAM row indices from a
/// per-channel free list. Free lists are LIFO so a freed entry is the next
/// one returned.
#[derive(Debug)]
pub struct KvCacheAllocator {
    mode: RunMode,
    base_addr: AddrType,

    // NPU layout
    entry_bytes: u64,
    free_entries: Vec<AddrType>,

    // PIM layout
    base_row: u64,
    bank_per_ch: u32,
    num_ele_per_row: u32,
    free_rows: Vec<Vec<u64>>,
    rows_initially_free: u64,
}

impl KvCacheAllocator {
    pub fn new(config: &SimulationConfig) -> Self {
        Self {
            mode: config.run_mode,
            base_addr: 0,
            entry_bytes: ENTRY_TOKENS * config.d_k() as u64 * config.precision as u64,
            free_entries: Vec::new(),
            base_row: 0,
            bank_per_ch: config.dram_banks_per_ch,
            num_ele_per_row: config.elems_per_dram_row(),
            free_rows: Vec::new(),
            rows_initially_free: 0,
        }
    }

    pub fn init(&mut self, base_addr: AddrType, config: &SimulationConfig) {
        match self.mode {
            RunMode::NpuOnly => self.init_npu_layout(base_addr, config),
            RunMode::NpuPim => self.init_pim_layout(base_addr, config),
        }
    }

    /// Carves the whole pool into linear entries up front. Entries hold 32
    /// tokens of one head at d_k granularity, so adjacent latent vectors of a
    /// head load as contiguous bursts.
    fn init_npu_layout(&mut self, base_addr: AddrType, config: &SimulationConfig) {
        let h = config.heads_per_rank() as u64;
        let d_k = config.d_k() as u64;
        let pool_bytes = config.max_active_reqs as u64
            * config.max_seq_len as u64
            * h
            * d_k
            * config.precision as u64;
        assert!(
            base_addr + pool_bytes < config.HBM_size,
            "KV cache pool [{:#x}, {:#x}) exceeds HBM size {:#x}",
            base_addr,
            base_addr + pool_bytes,
            config.HBM_size
        );

        self.base_addr = base_addr;
        let num_entries =
            config.max_active_reqs as u64 * config.max_seq_len as u64 * h / ENTRY_TOKENS;
        // pushed in reverse so the LIFO pop hands out ascending addresses
        for i in (0..num_entries).rev() {
            self.free_entries.push(base_addr + i * self.entry_bytes);
        }
    }

    /// Every DRAM row above the weight/activation regions goes onto its
    /// channel's free list.
    fn init_pim_layout(&mut self, base_addr: AddrType, config: &SimulationConfig) {
        let mask = !((1u64 << ROW_OFFSET) - 1);
        // start from the next full row boundary
        let base_addr = (base_addr & mask) + (1 << ROW_OFFSET);
        self.base_addr = base_addr;
        self.base_row = base_addr >> ROW_OFFSET;
        assert!(
            self.base_row < ROW_PER_BANK,
            "KV base row {} beyond physical rows {}",
            self.base_row,
            ROW_PER_BANK
        );

        self.rows_initially_free = ROW_PER_BANK - self.base_row;
        for _ in 0..config.dram_channels {
            let rows: Vec<u64> = (self.base_row..ROW_PER_BANK).rev().collect();
            self.free_rows.push(rows);
        }
    }

    /// NPU layout: pop one linear entry.
    pub fn allocate(&mut self) -> AddrType {
        assert!(
            self.mode == RunMode::NpuOnly,
            "linear KV allocate called in PIM mode"
        );
        self.free_entries.pop().expect("KV cache entries exhausted")
    }

    /// PIM layout: pop one free row of the given channel.
    pub fn allocate_row(&mut self, ch: u32) -> u64 {
        assert!(
            self.mode == RunMode::NpuPim,
            "per-channel KV allocate called in NPU-only mode"
        );
        self.free_rows[ch as usize]
            .pop()
            .unwrap_or_else(|| panic!("KV cache rows exhausted on channel {}", ch))
    }

    pub fn free(&mut self, addr: AddrType) {
        assert!(
            self.mode == RunMode::NpuOnly,
            "linear KV free called in PIM mode"
        );
        self.free_entries.push(addr);
    }

    pub fn free_row(&mut self, ch: u32, row: u64) {
        assert!(
            self.mode == RunMode::NpuPim,
            "per-channel KV free called in NPU-only mode"
        );
        self.free_rows[ch as usize].push(row);
    }

    pub fn bank_per_ch(&self) -> u32 {
        self.bank_per_ch
    }

    pub fn num_ele_per_row(&self) -> u32 {
        self.num_ele_per_row
    }

    /// Free rows currently on a channel's list.
    pub fn free_rows_on(&self, ch: u32) -> u64 {
        self.free_rows[ch as usize].len() as u64
    }

    pub fn rows_initially_free(&self) -> u64 {
        self.rows_initially_free
    }
}

/// The three HBM regions, owned together so the initialization order (weight,
/// then activation, then KV) is a code path instead of a convention.
#[derive(Debug)]
pub struct AllocatorContext {
    pub weight: WeightAllocator,
    pub activation: ActivationAllocator,
    pub kv: KvCacheAllocator,
}

impl AllocatorContext {
    pub fn new(config: &SimulationConfig) -> Self {
        Self {
            weight: WeightAllocator::new(config),
            activation: ActivationAllocator::new(config),
            kv: KvCacheAllocator::new(config),
        }
    }

    /// Places the activation and KV regions above whatever the weight
    /// allocator has handed out. Must run after all weights are allocated.
    pub fn init_runtime_regions(&mut self, config: &SimulationConfig) {
        self.activation.init(self.weight.next_aligned_addr());
        self.kv.init(self.activation.next_aligned_addr(), config);
    }
}

fn align_down(addr: AddrType, alignment: u64) -> AddrType {
    addr - (addr % alignment)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::config::{RunMode, SimulationConfig};

    fn cfg() -> SimulationConfig {
        SimulationConfig {
            HBM_act_buf_size: 4096,
            ..Default::default()
        }
    }

    #[test]
    fn activation_bump_and_flush() {
        let mut alloc = ActivationAllocator::new(&cfg());
        let base = 0x10000;
        alloc.init(base);
        assert_eq!(alloc.allocate(100), base);
        // 100 rounds up to the next 64-aligned boundary
        assert_eq!(alloc.allocate(60), base + 128);
        alloc.flush();
        assert_eq!(alloc.allocate(1), base);
    }

    #[test]
    #[should_panic(expected = "activation buffer overflow")]
    fn activation_overflow_is_fatal() {
        let config = cfg();
        let mut alloc = ActivationAllocator::new(&config);
        alloc.init(0x10000);
        alloc.allocate(config.HBM_act_buf_size + 1);
    }

    #[test]
    fn weight_full_channel_rounding() {
        // 64B requests * 32 channels -> 2048B stripes
        let mut alloc = WeightAllocator::new(&cfg());
        assert_eq!(alloc.allocate(1), 0);
        assert_eq!(alloc.allocate(2049), 1);
        assert_eq!(alloc.allocate(1), 3);
    }

    #[test]
    #[should_panic(expected = "no weights allocated")]
    fn weight_next_aligned_requires_allocation() {
        let alloc = WeightAllocator::new(&cfg());
        alloc.next_aligned_addr();
    }

    #[test]
    fn pim_rows_are_lifo_per_channel() {
        let config = SimulationConfig {
            run_mode: RunMode::NpuPim,
            ..cfg()
        };
        let mut alloc = KvCacheAllocator::new(&config);
        alloc.init(0x100000, &config);

        let initially = alloc.free_rows_on(3);
        let row = alloc.allocate_row(3);
        assert_eq!(alloc.free_rows_on(3), initially - 1);
        alloc.free_row(3, row);
        assert_eq!(alloc.allocate_row(3), row);
    }

    #[test]
    fn npu_entries_are_lifo() {
        let config = SimulationConfig {
            run_mode: RunMode::NpuOnly,
            ..cfg()
        };
        let mut alloc = KvCacheAllocator::new(&config);
        alloc.init(0x100000, &config);

        let first = alloc.allocate();
        let second = alloc.allocate();
        assert!(second > first);
        alloc.free(first);
        assert_eq!(alloc.allocate(), first);
    }

    #[test]
    #[should_panic(expected = "per-channel KV allocate called in NPU-only mode")]
    fn pim_allocate_in_npu_mode_is_fatal() {
        let config = SimulationConfig {
            run_mode: RunMode::NpuOnly,
            ..cfg()
        };
        let mut alloc = KvCacheAllocator::new(&config);
        alloc.init(0x100000, &config);
        alloc.allocate_row(0);
    }

    #[test]
    #[should_panic(expected = "linear KV allocate called in PIM mode")]
    fn npu_allocate_in_pim_mode_is_fatal() {
        let config = SimulationConfig {
            run_mode: RunMode::NpuPim,
            ..cfg()
        };
        let mut alloc = KvCacheAllocator::new(&config);
        alloc.init(0x100000, &config);
        alloc.allocate();
    }

    #[test]
    fn context_orders_regions() {
        let config = SimulationConfig {
            run_mode: RunMode::NpuPim,
            ..cfg()
        };
        let mut ctx = AllocatorContext::new(&config);
        ctx.weight.allocate(1 << 20);
        ctx.init_runtime_regions(&config);
        // activation sits above the weight top, KV rows above the activation buffer
        assert!(ctx.kv.rows_initially_free() > 0);
        let base = ctx.weight.next_aligned_addr();
        assert_eq!(ctx.activation.allocate(1), base);
    }
}
