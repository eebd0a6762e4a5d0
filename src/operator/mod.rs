pub mod matmul;
pub mod mha;
pub mod pim_attention;
pub mod vector;

use derive_more::Display;

use crate::config::{AddrType, SimulationConfig};
use crate::memory::address_map::AddressMap;
use crate::memory::allocator::AllocatorContext;
use crate::tensor::{TensorArena, TensorId};

pub use matmul::MatMul;
pub use mha::FusedMha;
pub use pim_attention::{PimAttend, PimLogitSoftmax};
pub use vector::{Pointwise, PointwiseKind};

pub type OpId = u32;

/// Operand tags carried by instructions so the trace consumer can tell input
/// staging from output drain.
pub const INPUT_OPERAND: u32 = 0;
pub const OUTPUT_OPERAND: u32 = 1;

/// Scratchpad address spaces. The accumulator scratchpad is a separate
/// physical array with its own budget.
pub const SPAD_BASE: AddrType = 0x1000_0000;
pub const ACCUM_SPAD_BASE: AddrType = 0x2000_0000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Display)]
pub enum Opcode {
    #[default]
    #[display("MOVIN")]
    Movin,
    #[display("MOVOUT")]
    Movout,
    #[display("GEMM")]
    Gemm,
    #[display("ADD")]
    Add,
    #[display("MUL")]
    Mul,
    #[display("EXP")]
    Exp,
    #[display("GELU")]
    Gelu,
    #[display("LAYERNORM")]
    LayerNorm,
    #[display("SOFTMAX")]
    Softmax,
    #[display("ADD_TREE")]
    AddTree,
    #[display("SCALAR_SQRT")]
    ScalarSqrt,
    #[display("SCALAR_ADD")]
    ScalarAdd,
    #[display("SCALAR_MUL")]
    ScalarMul,
    #[display("PIM_GWRITE")]
    PimGwrite,
    #[display("PIM_HEADER")]
    PimHeader,
    #[display("PIM_COMP")]
    PimComp,
    #[display("PIM_READRES")]
    PimReadres,
    #[display("PIM_COMPS_READRES")]
    PimCompsReadres,
}

impl Opcode {
    pub fn is_pim(&self) -> bool {
        matches!(
            self,
            Opcode::PimGwrite
                | Opcode::PimHeader
                | Opcode::PimComp
                | Opcode::PimReadres
                | Opcode::PimCompsReadres
        )
    }
}

/// One hardware instruction with pre-resolved addresses. `src_addrs` holds
/// DRAM addresses for MOVIN/MOVOUT, SRAM addresses for compute, and encoded
/// PIM headers for the PIM opcodes.
#[derive(Debug, Clone, Default)]
pub struct Instruction {
    pub opcode: Opcode,
    pub dest_addr: AddrType,
    pub size: u64,
    pub src_addrs: Vec<AddrType>,
    pub tile_m: u32,
    pub tile_k: u32,
    pub tile_n: u32,
    pub operand_id: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TileStatus {
    #[default]
    Initialized,
    Running,
    Finished,
}

/// Unit of dispatch to one compute resource. Instruction order inside a tile
/// is significant; tiles of one operation are mutually independent.
#[derive(Debug, Clone, Default)]
pub struct Tile {
    pub status: TileStatus,
    pub optype: String,
    pub operation_id: OpId,
    pub batch: u32,
    pub k: u32,
    pub accum: bool,
    pub instructions: Vec<Instruction>,
}

/// Per-operation SRAM bump allocator used while emitting instructions.
/// Capacities are counted in scratchpad words (one element each); `reset`
/// runs at every tile boundary since a tile owns the scratchpad while it
/// executes.
#[derive(Debug)]
pub struct ScratchpadBump {
    precision: u32,
    spad_used: u64,
    spad_capacity: u64,
    accum_used: u64,
    accum_capacity: u64,
}

impl ScratchpadBump {
    pub fn new(config: &SimulationConfig) -> Self {
        Self {
            precision: config.precision,
            spad_used: 0,
            spad_capacity: config.spad_size as u64 * 1024,
            accum_used: 0,
            accum_capacity: config.accum_spad_size as u64 * 1024,
        }
    }

    /// Reserves `elems` scratchpad words, returning the SRAM address and the
    /// reservation size in bytes. `accum` selects the accumulator array.
    pub fn allocate(&mut self, elems: u64, accum: bool) -> (AddrType, u64) {
        let (used, capacity, base) = if accum {
            (&mut self.accum_used, self.accum_capacity, ACCUM_SPAD_BASE)
        } else {
            (&mut self.spad_used, self.spad_capacity, SPAD_BASE)
        };
        assert!(
            *used + elems <= capacity,
            "scratchpad exhausted: {} + {} words over {}",
            used,
            elems,
            capacity
        );
        let addr = base + *used * self.precision as u64;
        *used += elems;
        (addr, elems * self.precision as u64)
    }

    pub fn reset(&mut self) {
        self.spad_used = 0;
        self.accum_used = 0;
    }
}

/// Everything the graph machinery needs from an operation, independent of
/// its kind: identity, tensor edges, the lowered tiles, and completion
/// tracking.
#[derive(Debug)]
pub struct OpCommon {
    pub id: OpId,
    pub name: String,
    pub inputs: Vec<TensorId>,
    pub outputs: Vec<TensorId>,
    pub tiles: Vec<Tile>,
    /// tile count at lowering time; stable across the scheduler draining `tiles`
    pub num_tiles: usize,
    pub finished_tiles: usize,
    pub finished: bool,
    pub spad: ScratchpadBump,
}

impl OpCommon {
    pub fn new_tile(&self, batch: u32, k: u32, accum: bool) -> Tile {
        Tile {
            status: TileStatus::Initialized,
            optype: self.name.clone(),
            operation_id: self.id,
            batch,
            k,
            accum,
            instructions: Vec::new(),
        }
    }
}

/// Everything an operation touches while lowering: shapes come from the
/// arena, output storage from the allocators, physical bit layouts from the
/// address map.
pub struct LowerCtx<'a> {
    pub config: &'a SimulationConfig,
    pub addr_map: &'a AddressMap,
    pub arena: &'a mut TensorArena,
    pub alloc: &'a mut AllocatorContext,
}

/// DRAM addresses covering a 2D region of a linear tensor, one address per
/// DRAM request inside each row segment.
pub(crate) fn region_addrs(
    tensor: &crate::tensor::Tensor,
    row0: u32,
    rows: u32,
    col0: u32,
    cols: u32,
    config: &SimulationConfig,
) -> Vec<AddrType> {
    use crate::tensor::TensorNode;
    let step = (config.dram_req_size / config.precision).max(1);
    let mut addrs = Vec::new();
    for r in row0..row0 + rows {
        let mut c = col0;
        while c < col0 + cols {
            addrs.push(tensor.get_addr(&[r, c]));
            c += step;
        }
    }
    addrs
}

/// The closed set of operation kinds the stage builder emits.
#[derive(Debug)]
pub enum OpKind {
    MatMul(MatMul),
    Pointwise(Pointwise),
    FusedMha(FusedMha),
    PimLogitSoftmax(PimLogitSoftmax),
    PimAttend(PimAttend),
}

/// A dataflow-graph node. Constructed by the stage builder, lowered exactly
/// once, its tiles consumed exactly once by the dispatch scheduler.
#[derive(Debug)]
pub struct Operation {
    pub common: OpCommon,
    pub kind: OpKind,
}

impl Operation {
    pub fn new(id: OpId, name: String, kind: OpKind, config: &SimulationConfig) -> Self {
        Self {
            common: OpCommon {
                id,
                name,
                inputs: Vec::new(),
                outputs: Vec::new(),
                tiles: Vec::new(),
                num_tiles: 0,
                finished_tiles: 0,
                finished: false,
                spad: ScratchpadBump::new(config),
            },
            kind,
        }
    }

    pub fn id(&self) -> OpId {
        self.common.id
    }

    pub fn name(&self) -> &str {
        &self.common.name
    }

    pub fn optype(&self) -> &'static str {
        match &self.kind {
            OpKind::MatMul(_) => "MatMul",
            OpKind::Pointwise(p) => p.kind.optype(),
            OpKind::FusedMha(_) => "FusedMha",
            OpKind::PimLogitSoftmax(_) => "PimLogitSoftmax",
            OpKind::PimAttend(_) => "PimAttend",
        }
    }

    /// Wires producer/consumer edges, validates shapes, allocates output
    /// tensors, partitions the work to fit SRAM, and emits the tiles.
    pub fn lower(&mut self, ctx: &mut LowerCtx, inputs: Vec<TensorId>) -> Vec<TensorId> {
        assert!(self.common.tiles.is_empty(), "operation lowered twice");
        for &t in &inputs {
            ctx.arena.add_child(t, self.common.id);
        }
        self.common.inputs = inputs;

        let outputs = match &mut self.kind {
            OpKind::MatMul(op) => op.lower(&mut self.common, ctx),
            OpKind::Pointwise(op) => op.lower(&mut self.common, ctx),
            OpKind::FusedMha(op) => op.lower(&mut self.common, ctx),
            OpKind::PimLogitSoftmax(op) => op.lower(&mut self.common, ctx),
            OpKind::PimAttend(op) => op.lower(&mut self.common, ctx),
        };

        for &t in &outputs {
            ctx.arena.set_src_node(t, self.common.id);
        }
        self.common.outputs = outputs.clone();
        self.common.num_tiles = self.common.tiles.len();
        outputs
    }

    /// True when every input is produced and nothing has been dispatched.
    pub fn executable(&self, arena: &TensorArena) -> bool {
        !self.common.finished
            && self.common.finished_tiles == 0
            && self.common.inputs.iter().all(|&t| arena.get(t).produced())
    }

    pub fn num_tiles(&self) -> usize {
        self.common.num_tiles
    }

    pub fn tiles(&self) -> &[Tile] {
        &self.common.tiles
    }

    pub fn tiles_mut(&mut self) -> &mut [Tile] {
        &mut self.common.tiles
    }
}
