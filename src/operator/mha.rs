use crate::operator::{
    region_addrs, Instruction, LowerCtx, OpCommon, Opcode, INPUT_OPERAND, OUTPUT_OPERAND,
};
use crate::tensor::{NpuBufType, TensorId};
use crate::utils::name_concat;

/// Whole-sub-batch attention for NPU-only runs: per head, logits GEMM,
/// softmax, then the attend GEMM, all staged through the scratchpad against
/// the linear-layout KV cache. Inputs are the batched QKV activation
/// followed by each request's K and V cache tensors.
#[derive(Debug)]
pub struct FusedMha {
    rows_breakdown: Vec<u32>,
    batch_size: usize,
    nh: u32,
    dk: u32,
    req_idxs: Vec<usize>,
}

impl FusedMha {
    pub fn new(rows_breakdown: Vec<u32>) -> Self {
        Self {
            rows_breakdown,
            batch_size: 0,
            nh: 0,
            dk: 0,
            req_idxs: Vec::new(),
        }
    }

    fn key(&self, common: &OpCommon, i: usize) -> TensorId {
        common.inputs[1 + i]
    }

    fn value(&self, common: &OpCommon, i: usize) -> TensorId {
        common.inputs[1 + self.batch_size + i]
    }

    pub fn lower(&mut self, common: &mut OpCommon, ctx: &mut LowerCtx) -> Vec<TensorId> {
        assert!(
            common.inputs.len() >= 3 && (common.inputs.len() - 1) % 2 == 0,
            "{}: expected qkv plus per-request K/V pairs",
            common.name
        );
        self.batch_size = (common.inputs.len() - 1) / 2;
        assert!(
            self.rows_breakdown.len() == self.batch_size,
            "{}: row breakdown covers {} requests, inputs carry {}",
            common.name,
            self.rows_breakdown.len(),
            self.batch_size
        );

        let k0_dims = ctx.arena.get(self.key(common, 0)).dims().to_vec();
        self.nh = k0_dims[0];
        self.dk = k0_dims[1];
        let num_rows: u32 = self.rows_breakdown.iter().sum();

        let qkv_dims = ctx.arena.get(common.inputs[0]).dims().to_vec();
        assert!(
            qkv_dims == [num_rows, 3 * self.nh * self.dk],
            "{}: qkv shape {:?} does not match {} rows of 3x{} heads",
            common.name,
            qkv_dims,
            num_rows,
            self.nh * self.dk
        );

        for i in 0..self.batch_size {
            let k = ctx.arena.get(self.key(common, i)).dims().to_vec();
            let v = ctx.arena.get(self.value(common, i)).dims().to_vec();
            assert!(
                k[0] == self.nh && v[0] == self.nh,
                "{}: head count mismatch on request {}",
                common.name,
                i
            );
            assert!(
                k[2] == v[1] && k[1] == v[2],
                "{}: K {:?} and V {:?} disagree on request {}",
                common.name,
                k,
                v,
                i
            );
        }

        let out = ctx.arena.create_npu(
            name_concat(&[&common.name, "out"]),
            vec![num_rows, self.nh * self.dk],
            NpuBufType::Act,
            false,
            ctx.alloc,
            ctx.config,
        );

        self.calculate_loops(common, ctx);
        self.initialize_tiles(common, ctx, out);
        vec![out]
    }

    /// Greedy request packing against the scratchpad, one tile per group.
    fn calculate_loops(&mut self, common: &OpCommon, ctx: &LowerCtx) {
        let budget = ctx.config.spad_size as u64 * 1024;
        let mut sram_needs = 0u64;
        for i in 0..self.batch_size {
            let l = self.rows_breakdown[i] as u64;
            let seq = ctx.arena.get(self.value(common, i)).dims()[1] as u64;
            let (nh, dk) = (self.nh as u64, self.dk as u64);
            // q, staged K, logits, staged V, and the output row per head
            let need = nh * (l * dk + dk * seq + l * seq + seq * dk + l * dk);
            sram_needs += need;
            if sram_needs > budget {
                assert!(
                    i > 0,
                    "{}: request {} alone needs {} scratchpad words over {}",
                    common.name,
                    i,
                    need,
                    budget
                );
                self.req_idxs.push(i - 1);
                sram_needs = need;
            }
        }
        self.req_idxs.push(self.batch_size - 1);
    }

    fn initialize_tiles(&mut self, common: &mut OpCommon, ctx: &LowerCtx, out: TensorId) {
        let req_idxs = self.req_idxs.clone();
        let mut prev = 0usize;
        for (i, &idx) in req_idxs.iter().enumerate() {
            if i == req_idxs.len() - 1 {
                assert!(idx == self.batch_size - 1, "tile ranges must cover the batch");
            }
            let tile = self.initialize_instructions(common, ctx, out, prev, idx);
            common.tiles.push(tile);
            prev = idx + 1;
        }
    }

    fn initialize_instructions(
        &self,
        common: &mut OpCommon,
        ctx: &LowerCtx,
        out: TensorId,
        start: usize,
        end: usize,
    ) -> crate::operator::Tile {
        let mut tile = common.new_tile(start as u32, 0, false);
        common.spad.reset();

        let mut row_offset: u32 = self.rows_breakdown[..start].iter().sum();
        for i in start..=end {
            let l = self.rows_breakdown[i];
            let seq = ctx.arena.get(self.value(common, i)).dims()[1];
            let qkv = ctx.arena.get(common.inputs[0]);
            let key = ctx.arena.get(self.key(common, i)).as_npu();
            let value = ctx.arena.get(self.value(common, i)).as_npu();
            let out_tensor = ctx.arena.get(out);

            for hi in 0..self.nh {
                let (l, seq, dk) = (l as u64, seq as u64, self.dk as u64);
                let (sram_q, q_bytes) = common.spad.allocate(l * dk, false);
                let (sram_k, k_bytes) = common.spad.allocate(dk * seq, false);
                let (sram_logit, logit_bytes) = common.spad.allocate(l * seq, false);
                let (sram_v, v_bytes) = common.spad.allocate(seq * dk, false);
                let (sram_o, o_bytes) = common.spad.allocate(l * dk, true);

                // query columns of this head inside the packed qkv rows
                tile.instructions.push(Instruction {
                    opcode: Opcode::Movin,
                    dest_addr: sram_q,
                    size: q_bytes,
                    src_addrs: region_addrs(
                        qkv,
                        row_offset,
                        l as u32,
                        hi * self.dk,
                        self.dk,
                        ctx.config,
                    ),
                    operand_id: INPUT_OPERAND,
                    ..Default::default()
                });
                tile.instructions.push(Instruction {
                    opcode: Opcode::Movin,
                    dest_addr: sram_k,
                    size: k_bytes,
                    src_addrs: key.inner_all_addrs(hi as usize),
                    operand_id: INPUT_OPERAND,
                    ..Default::default()
                });
                tile.instructions.push(Instruction {
                    opcode: Opcode::Gemm,
                    dest_addr: sram_logit,
                    size: logit_bytes,
                    src_addrs: vec![sram_q, sram_k],
                    tile_m: l as u32,
                    tile_k: self.dk,
                    tile_n: seq as u32,
                    ..Default::default()
                });
                tile.instructions.push(Instruction {
                    opcode: Opcode::Softmax,
                    dest_addr: sram_logit,
                    size: logit_bytes,
                    src_addrs: vec![sram_logit],
                    ..Default::default()
                });
                tile.instructions.push(Instruction {
                    opcode: Opcode::Movin,
                    dest_addr: sram_v,
                    size: v_bytes,
                    src_addrs: value.inner_all_addrs(hi as usize),
                    operand_id: INPUT_OPERAND,
                    ..Default::default()
                });
                tile.instructions.push(Instruction {
                    opcode: Opcode::Gemm,
                    dest_addr: sram_o,
                    size: o_bytes,
                    src_addrs: vec![sram_logit, sram_v],
                    tile_m: l as u32,
                    tile_k: seq as u32,
                    tile_n: self.dk,
                    ..Default::default()
                });
                tile.instructions.push(Instruction {
                    opcode: Opcode::Movout,
                    dest_addr: sram_o,
                    size: o_bytes,
                    src_addrs: region_addrs(
                        out_tensor,
                        row_offset,
                        l as u32,
                        hi * self.dk,
                        self.dk,
                        ctx.config,
                    ),
                    operand_id: OUTPUT_OPERAND,
                    ..Default::default()
                });
            }
            row_offset += l;
        }

        tile
    }
}
