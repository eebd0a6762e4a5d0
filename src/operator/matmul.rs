use log::trace;

use crate::operator::{
    region_addrs, Instruction, LowerCtx, OpCommon, Opcode, INPUT_OPERAND, OUTPUT_OPERAND,
};
use crate::tensor::{NpuBufType, TensorId};
use crate::utils::{div_ceil, name_concat};

/// Batched GEMM on the systolic array: `out[M,N] = x[M,K] * w[K,N] (+ b[N])`.
/// Tiled so one (x, w) tile pair fits the scratchpad and one output tile
/// fits the accumulator scratchpad; the K dimension streams through the
/// array with partial sums held in the accumulator.
#[derive(Debug, Default)]
pub struct MatMul {
    m: u32,
    k: u32,
    n: u32,
    tile_m: u32,
    tile_k: u32,
    tile_n: u32,
}

impl MatMul {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lower(&mut self, common: &mut OpCommon, ctx: &mut LowerCtx) -> Vec<TensorId> {
        let has_bias = match common.inputs.len() {
            2 => false,
            3 => true,
            n => panic!("{}: matmul expects 2 or 3 inputs, got {}", common.name, n),
        };

        let x_dims = ctx.arena.get(common.inputs[0]).dims().to_vec();
        let w_dims = ctx.arena.get(common.inputs[1]).dims().to_vec();
        assert!(
            x_dims.len() == 2 && w_dims.len() == 2,
            "{}: matmul operands must be 2D",
            common.name
        );
        assert!(
            x_dims[1] == w_dims[0],
            "{}: inner dims differ, x {:?} vs w {:?}",
            common.name,
            x_dims,
            w_dims
        );
        if has_bias {
            let b_dims = ctx.arena.get(common.inputs[2]).dims();
            assert!(
                b_dims == [1, w_dims[1]],
                "{}: bias shape {:?} does not match n {}",
                common.name,
                b_dims,
                w_dims[1]
            );
        }

        self.m = x_dims[0];
        self.k = x_dims[1];
        self.n = w_dims[1];

        let out = ctx.arena.create_npu(
            name_concat(&[&common.name, "out"]),
            vec![self.m, self.n],
            NpuBufType::Act,
            false,
            ctx.alloc,
            ctx.config,
        );

        self.calculate_loops(common, ctx);
        self.initialize_tiles(common, ctx, out);
        vec![out]
    }

    /// Shrinks the K tile until input staging fits the scratchpad. M and N
    /// tiles start from the array shape; the output tile must fit the
    /// accumulator scratchpad outright.
    fn calculate_loops(&mut self, common: &OpCommon, ctx: &LowerCtx) {
        let config = ctx.config;
        self.tile_m = self.m.min(config.core_height);
        self.tile_n = self.n.min(config.core_width);

        let spad_words = config.spad_size as u64 * 1024;
        let accum_words = config.accum_spad_size as u64 * 1024;
        assert!(
            self.tile_m as u64 * self.tile_n as u64 <= accum_words,
            "{}: output tile {}x{} exceeds accumulator scratchpad",
            common.name,
            self.tile_m,
            self.tile_n
        );

        // leave one row of words for the bias staging
        let per_k_words = (self.tile_m + self.tile_n) as u64;
        let avail = spad_words.saturating_sub(self.tile_n as u64);
        let tile_k = (avail / per_k_words).min(self.k as u64);
        assert!(
            tile_k > 0,
            "{}: scratchpad too small for a single K column",
            common.name
        );
        self.tile_k = tile_k as u32;
        trace!(
            "{}: gemm tiling m/k/n = {}/{}/{}",
            common.name,
            self.tile_m,
            self.tile_k,
            self.tile_n
        );
    }

    fn initialize_tiles(&mut self, common: &mut OpCommon, ctx: &LowerCtx, out: TensorId) {
        let m_tiles = div_ceil(self.m as u64, self.tile_m as u64) as u32;
        let n_tiles = div_ceil(self.n as u64, self.tile_n as u64) as u32;
        let k_tiles = div_ceil(self.k as u64, self.tile_k as u64) as u32;

        for mi in 0..m_tiles {
            for ni in 0..n_tiles {
                let tile = self.initialize_instructions(common, ctx, out, mi, ni, k_tiles);
                common.tiles.push(tile);
            }
        }
    }

    fn initialize_instructions(
        &self,
        common: &mut OpCommon,
        ctx: &LowerCtx,
        out: TensorId,
        mi: u32,
        ni: u32,
        k_tiles: u32,
    ) -> crate::operator::Tile {
        let mut tile = common.new_tile(mi, ni, k_tiles > 1);
        common.spad.reset();

        let row0 = mi * self.tile_m;
        let rows = self.tile_m.min(self.m - row0);
        let col0 = ni * self.tile_n;
        let cols = self.tile_n.min(self.n - col0);

        let x = ctx.arena.get(common.inputs[0]);
        let w = ctx.arena.get(common.inputs[1]);

        let (sram_acc, acc_bytes) = common.spad.allocate(rows as u64 * cols as u64, true);
        // staging buffers are reused across the K sweep
        let (sram_x, _) = common.spad.allocate(rows as u64 * self.tile_k as u64, false);
        let (sram_w, _) = common.spad.allocate(self.tile_k as u64 * cols as u64, false);

        for ki in 0..k_tiles {
            let k0 = ki * self.tile_k;
            let ks = self.tile_k.min(self.k - k0);
            let x_bytes = rows as u64 * ks as u64 * ctx.config.precision as u64;
            let w_bytes = ks as u64 * cols as u64 * ctx.config.precision as u64;

            tile.instructions.push(Instruction {
                opcode: Opcode::Movin,
                dest_addr: sram_x,
                size: x_bytes,
                src_addrs: region_addrs(x, row0, rows, k0, ks, ctx.config),
                operand_id: INPUT_OPERAND,
                ..Default::default()
            });
            tile.instructions.push(Instruction {
                opcode: Opcode::Movin,
                dest_addr: sram_w,
                size: w_bytes,
                src_addrs: region_addrs(w, k0, ks, col0, cols, ctx.config),
                operand_id: INPUT_OPERAND,
                ..Default::default()
            });
            tile.instructions.push(Instruction {
                opcode: Opcode::Gemm,
                dest_addr: sram_acc,
                size: acc_bytes,
                src_addrs: vec![sram_x, sram_w],
                tile_m: rows,
                tile_k: ks,
                tile_n: cols,
                ..Default::default()
            });
        }

        if common.inputs.len() == 3 {
            let bias = ctx.arena.get(common.inputs[2]);
            let (sram_b, b_bytes) = common.spad.allocate(cols as u64, false);
            tile.instructions.push(Instruction {
                opcode: Opcode::Movin,
                dest_addr: sram_b,
                size: b_bytes,
                src_addrs: region_addrs(bias, 0, 1, col0, cols, ctx.config),
                operand_id: INPUT_OPERAND,
                ..Default::default()
            });
            tile.instructions.push(Instruction {
                opcode: Opcode::Add,
                dest_addr: sram_acc,
                size: acc_bytes,
                src_addrs: vec![sram_acc, sram_b],
                ..Default::default()
            });
        }

        tile.instructions.push(Instruction {
            opcode: Opcode::Movout,
            dest_addr: sram_acc,
            size: acc_bytes,
            src_addrs: region_addrs(ctx.arena.get(out), row0, rows, col0, cols, ctx.config),
            operand_id: OUTPUT_OPERAND,
            ..Default::default()
        });

        tile
    }
}
