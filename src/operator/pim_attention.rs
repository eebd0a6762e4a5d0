use fxhash::FxHashMap;
use log::trace;

use crate::config::DramType;
use crate::operator::{
    Instruction, LowerCtx, OpCommon, Opcode, INPUT_OPERAND, OUTPUT_OPERAND,
};
use crate::tensor::{NpuBufType, TensorId, TensorNode};
use crate::utils::{div_ceil, name_concat, next_pow2};

/// Decode-phase attention score computation offloaded to the PIM banks:
/// stages each head's query with GWRITE, streams COMP commands over the KEY
/// row groups (successive tokens sit on successive banks), then softmaxes
/// the gathered logits on the vector unit. Inputs are `batch` query tensors
/// [h, 1, d_k] followed by `batch` KEY cache tensors [h, d_k, seq_len].
#[derive(Debug)]
pub struct PimLogitSoftmax {
    batch_size: usize,
    nh: u32,
    dk: u32,
    banks_per_channel: u32,
    datas_per_comp_cmd: u32,
    rows_per_chunk: u32,
    req_idxs: Vec<usize>,
}

impl PimLogitSoftmax {
    pub fn new() -> Self {
        Self {
            batch_size: 0,
            nh: 0,
            dk: 0,
            banks_per_channel: 0,
            datas_per_comp_cmd: 0,
            rows_per_chunk: 0,
            req_idxs: Vec::new(),
        }
    }

    fn query(&self, common: &OpCommon, i: usize) -> TensorId {
        common.inputs[i]
    }

    fn kcache(&self, common: &OpCommon, i: usize) -> TensorId {
        common.inputs[self.batch_size + i]
    }

    pub fn lower(&mut self, common: &mut OpCommon, ctx: &mut LowerCtx) -> Vec<TensorId> {
        assert!(
            !common.inputs.is_empty() && common.inputs.len() % 2 == 0,
            "{}: expected query/key pairs",
            common.name
        );
        self.batch_size = common.inputs.len() / 2;

        let k0 = ctx.arena.get(self.kcache(common, 0)).dims().to_vec();
        self.nh = k0[0];
        self.dk = k0[1];

        let mut outputs = Vec::with_capacity(self.batch_size);
        for i in 0..self.batch_size {
            let q = ctx.arena.get(self.query(common, i)).dims().to_vec();
            let k = ctx.arena.get(self.kcache(common, i)).dims().to_vec();
            assert!(
                q[0] == k[0],
                "{}: head counts differ on request {} ({} vs {})",
                common.name,
                i,
                q[0],
                k[0]
            );
            assert!(
                q[2] == k[1],
                "{}: query width {} does not match key depth {} on request {}",
                common.name,
                q[2],
                k[1],
                i
            );

            outputs.push(ctx.arena.create_npu(
                name_concat(&[&common.name, &format!("out{}", i)]),
                vec![self.nh, q[1], k[2]],
                NpuBufType::Act,
                false,
                ctx.alloc,
                ctx.config,
            ));
        }

        self.calculate_loops(common, ctx);
        self.initialize_tiles(common, ctx, &outputs);
        outputs
    }

    fn calculate_loops(&mut self, common: &OpCommon, ctx: &LowerCtx) {
        let config = ctx.config;
        self.banks_per_channel = config.dram_banks_per_ch;
        self.datas_per_comp_cmd = config.pim_comp_coverage;
        // a KEY row group spans the full embedding across the row buffer
        self.rows_per_chunk = div_ceil(
            config.model_n_embd as u64,
            config.elems_per_dram_row() as u64,
        ) as u32;

        self.req_idxs = pack_requests_by_sram(common, ctx, self.batch_size, |i| {
            let q_len = ctx.arena.get(self.query(common, i)).dims()[1];
            let seq = ctx.arena.get(self.kcache(common, i)).dims()[2];
            (q_len, seq)
        });
    }

    fn initialize_tiles(&mut self, common: &mut OpCommon, ctx: &LowerCtx, outputs: &[TensorId]) {
        let req_idxs = self.req_idxs.clone();
        let mut prev = 0usize;
        for (i, &idx) in req_idxs.iter().enumerate() {
            if i == req_idxs.len() - 1 {
                assert!(idx == self.batch_size - 1, "tile ranges must cover the batch");
            }
            let tile = self.initialize_instructions(common, ctx, outputs, prev, idx);
            common.tiles.push(tile);
            prev = idx + 1;
        }
    }

    fn initialize_instructions(
        &self,
        common: &mut OpCommon,
        ctx: &LowerCtx,
        outputs: &[TensorId],
        start: usize,
        end: usize,
    ) -> crate::operator::Tile {
        let mut tile = common.new_tile(start as u32, 0, false);
        common.spad.reset();
        let dram_type = ctx.config.dram_type;
        let banks = self.banks_per_channel;

        for i in start..=end {
            let key = ctx.arena.get(self.kcache(common, i)).as_pim();
            let seq_len = key.meta().dims[2];
            let ch = key.channel();
            let chunks = div_ceil(seq_len as u64, banks as u64) as u32;

            for hi in 0..self.nh {
                let mut sram_chunk_addrs = Vec::with_capacity(chunks as usize);
                for ci in 0..chunks {
                    // stage this head's query row into the PIM unit
                    let query_row = 0; // TODO: place the staged query into a real scratch row
                    let gw_header = ctx.addr_map.encode_pim_header(ch, query_row, true, 0, 0);
                    let (sram_gw, _) = common.spad.allocate(0, false);
                    tile.instructions.push(Instruction {
                        opcode: Opcode::PimGwrite,
                        dest_addr: sram_gw,
                        size: 0,
                        src_addrs: vec![gw_header],
                        operand_id: INPUT_OPERAND,
                        ..Default::default()
                    });

                    let tokens = banks.min(seq_len - ci * banks);
                    // one dot product per bank, streamed datas_per_comp at a time
                    let num_comps = div_ceil(
                        tokens as u64 * self.dk as u64,
                        banks as u64 * self.datas_per_comp_cmd as u64,
                    ) as u32;
                    assert!(num_comps > 0);
                    let decoded_num_comps = next_pow2(num_comps as u64) as u32;

                    // every row of the group holds a different slice of the
                    // embedding, so each needs its own landing slot
                    let mut sram_partial_addrs = Vec::with_capacity(self.rows_per_chunk as usize);
                    for ri in 0..self.rows_per_chunk {
                        let (sram_addr, sram_bytes) = common.spad.allocate(tokens as u64, false);
                        let dram_row = key.row((ci * self.rows_per_chunk + ri) as usize);
                        let p_header = ctx.addr_map.encode_pim_header(
                            ch,
                            dram_row,
                            false,
                            decoded_num_comps,
                            1,
                        );
                        tile.instructions.push(Instruction {
                            opcode: Opcode::PimHeader,
                            dest_addr: sram_addr,
                            size: 0,
                            src_addrs: vec![p_header],
                            operand_id: INPUT_OPERAND,
                            ..Default::default()
                        });

                        let dram_addr = ctx
                            .addr_map
                            .encode_pim_comps_readres(ch, dram_row, num_comps, true);
                        emit_comp_pattern(
                            &mut tile,
                            dram_type,
                            num_comps,
                            sram_addr,
                            sram_bytes,
                            dram_addr,
                        );
                        sram_partial_addrs.push(sram_addr);
                    }

                    // sum the per-row partial dot products into this chunk's
                    // logits before anything downstream reads them
                    if self.rows_per_chunk > 1 {
                        let (sram_chunk, chunk_bytes) =
                            common.spad.allocate(tokens as u64, true);
                        tile.instructions.push(Instruction {
                            opcode: Opcode::Add,
                            dest_addr: sram_chunk,
                            size: chunk_bytes,
                            src_addrs: sram_partial_addrs,
                            ..Default::default()
                        });
                        sram_chunk_addrs.push(sram_chunk);
                    } else {
                        sram_chunk_addrs.push(sram_partial_addrs[0]);
                    }
                }

                // normalize the gathered logits, then drain this head's row
                let (sram_sm, sm_bytes) = common.spad.allocate(seq_len as u64, false);
                tile.instructions.push(Instruction {
                    opcode: Opcode::Softmax,
                    dest_addr: sram_sm,
                    size: sm_bytes,
                    src_addrs: sram_chunk_addrs,
                    ..Default::default()
                });
                tile.instructions.push(Instruction {
                    opcode: Opcode::Movout,
                    dest_addr: sram_sm,
                    size: sm_bytes,
                    src_addrs: ctx
                        .arena
                        .get(outputs[i])
                        .as_npu()
                        .inner_all_addrs(hi as usize),
                    operand_id: OUTPUT_OPERAND,
                    ..Default::default()
                });
            }
        }

        tile
    }
}

impl Default for PimLogitSoftmax {
    fn default() -> Self {
        Self::new()
    }
}

/// Decode-phase attention-times-value offloaded to the PIM banks. Inputs are
/// `batch` logit tensors [h, l, seq_len] followed by `batch` VALUE cache
/// tensors [h, seq_len, d_k]; the output is one [h, l, d_k] tensor per
/// request. Within a tile the GWRITE staging a chunk's logits always
/// precedes the COMP commands that reference its row.
#[derive(Debug)]
pub struct PimAttend {
    batch_size: usize,
    nh: u32,
    dk: u32,
    /// elements per DRAM page
    page_size: u32,
    banks_per_channel: u32,
    tiles_per_chunk: u32,
    datas_per_comp_cmd: u32,
    req_idxs: Vec<usize>,
}

impl PimAttend {
    pub fn new() -> Self {
        Self {
            batch_size: 0,
            nh: 0,
            dk: 0,
            page_size: 0,
            banks_per_channel: 0,
            tiles_per_chunk: 0,
            datas_per_comp_cmd: 0,
            req_idxs: Vec::new(),
        }
    }

    fn logit(&self, common: &OpCommon, i: usize) -> TensorId {
        common.inputs[i]
    }

    fn vcache(&self, common: &OpCommon, i: usize) -> TensorId {
        common.inputs[self.batch_size + i]
    }

    pub fn lower(&mut self, common: &mut OpCommon, ctx: &mut LowerCtx) -> Vec<TensorId> {
        assert!(
            !common.inputs.is_empty() && common.inputs.len() % 2 == 0,
            "{}: expected logit/value pairs",
            common.name
        );
        self.batch_size = common.inputs.len() / 2;

        let v0 = ctx.arena.get(self.vcache(common, 0)).dims().to_vec();
        self.nh = v0[0];
        self.dk = v0[2];

        let mut outputs = Vec::with_capacity(self.batch_size);
        for i in 0..self.batch_size {
            let l_dims = ctx.arena.get(self.logit(common, i)).dims().to_vec();
            let v_dims = ctx.arena.get(self.vcache(common, i)).dims().to_vec();
            // seq_len of the scores must match the values they weight
            assert!(
                l_dims[2] == v_dims[1],
                "{}: logits seq {} vs values seq {} on request {}",
                common.name,
                l_dims[2],
                v_dims[1],
                i
            );
            assert!(
                l_dims[0] == v_dims[0],
                "{}: head counts differ on request {} ({} vs {})",
                common.name,
                l_dims[0],
                v_dims[0],
                i
            );

            outputs.push(ctx.arena.create_npu(
                name_concat(&[&common.name, &format!("out{}", i)]),
                vec![self.nh, l_dims[1], self.dk],
                NpuBufType::Act,
                false,
                ctx.alloc,
                ctx.config,
            ));
        }

        self.calculate_loops(common, ctx);
        self.initialize_tiles(common, ctx, &outputs);
        outputs
    }

    fn calculate_loops(&mut self, common: &OpCommon, ctx: &LowerCtx) {
        let config = ctx.config;
        self.page_size = config.elems_per_dram_row();
        self.banks_per_channel = config.dram_banks_per_ch;
        self.tiles_per_chunk = div_ceil(self.dk as u64, self.banks_per_channel as u64) as u32;
        self.datas_per_comp_cmd = config.pim_comp_coverage;

        self.req_idxs = pack_requests_by_sram(common, ctx, self.batch_size, |i| {
            let q_len = ctx.arena.get(self.logit(common, i)).dims()[1];
            let seq = ctx.arena.get(self.vcache(common, i)).dims()[1];
            (q_len, seq)
        });
        trace!("{}: request groups {:?}", common.name, self.req_idxs);
    }

    fn initialize_tiles(&mut self, common: &mut OpCommon, ctx: &LowerCtx, outputs: &[TensorId]) {
        let req_idxs = self.req_idxs.clone();
        let mut prev = 0usize;
        for (i, &idx) in req_idxs.iter().enumerate() {
            if i == req_idxs.len() - 1 {
                assert!(idx == self.batch_size - 1, "tile ranges must cover the batch");
            }
            let tile = self.initialize_instructions(common, ctx, outputs, prev, idx);
            common.tiles.push(tile);
            prev = idx + 1;
        }
    }

    fn initialize_instructions(
        &self,
        common: &mut OpCommon,
        ctx: &LowerCtx,
        outputs: &[TensorId],
        start: usize,
        end: usize,
    ) -> crate::operator::Tile {
        let mut tile = common.new_tile(start as u32, 0, false);
        common.spad.reset();
        let dram_type = ctx.config.dram_type;
        let banks = self.banks_per_channel;

        for i in start..=end {
            let value = ctx.arena.get(self.vcache(common, i)).as_pim();
            let logit = ctx.arena.get(self.logit(common, i)).as_npu();
            let seq_len = value.meta().dims[1];
            let q_len = logit.meta().dims[1];
            let ch = value.channel();
            let chunks = div_ceil(seq_len as u64, self.page_size as u64) as u32;

            if q_len != 1 {
                // Prefill shape: whole score matrix against the values in one
                // GEMM per head. Rejected in calculate_loops; kept for the day
                // the PIM path grows a prefill story.
                self.emit_prefill(common, ctx, &mut tile, outputs[i], i, seq_len, q_len);
                continue;
            }

            for hi in 0..self.nh {
                let mut sram_readres_addrs: FxHashMap<u32, Vec<u64>> = FxHashMap::default();
                for ci in 0..chunks {
                    // stage this chunk's logits into the PIM unit
                    let logit_row = 0; // TODO: derive from the logit tensor's DRAM placement
                    let gw_header = ctx.addr_map.encode_pim_header(ch, logit_row, true, 0, 0);
                    let (sram_gw, _) = common.spad.allocate(0, false);
                    tile.instructions.push(Instruction {
                        opcode: Opcode::PimGwrite,
                        dest_addr: sram_gw,
                        size: 0,
                        src_addrs: vec![gw_header],
                        operand_id: INPUT_OPERAND,
                        ..Default::default()
                    });

                    let residual = seq_len % self.page_size;
                    let num_comps = if ci == chunks - 1 && residual > 0 {
                        div_ceil(residual as u64, self.datas_per_comp_cmd as u64) as u32
                    } else {
                        self.page_size / self.datas_per_comp_cmd
                    };
                    assert!(num_comps > 0);
                    let decoded_num_comps = next_pow2(num_comps as u64) as u32;
                    assert!(num_comps <= decoded_num_comps);

                    for ti in 0..self.tiles_per_chunk {
                        let (sram_addr, sram_bytes) = common.spad.allocate(banks as u64, false);
                        let dram_row = value.row((ti * chunks + ci) as usize);
                        let p_header = ctx.addr_map.encode_pim_header(
                            ch,
                            dram_row,
                            false,
                            decoded_num_comps,
                            1,
                        );
                        tile.instructions.push(Instruction {
                            opcode: Opcode::PimHeader,
                            dest_addr: sram_addr,
                            size: 0,
                            src_addrs: vec![p_header],
                            operand_id: INPUT_OPERAND,
                            ..Default::default()
                        });

                        let dram_addr = ctx
                            .addr_map
                            .encode_pim_comps_readres(ch, dram_row, num_comps, true);
                        emit_comp_pattern(
                            &mut tile,
                            dram_type,
                            num_comps,
                            sram_addr,
                            sram_bytes,
                            dram_addr,
                        );

                        sram_readres_addrs.entry(ti).or_default().push(sram_addr);
                    }
                }

                // drain this head: sum the per-chunk partials when the
                // sequence spanned several pages, else move the single chunk
                // straight out
                let head_addrs = ctx
                    .arena
                    .get(outputs[i])
                    .as_npu()
                    .inner_all_addrs(hi as usize);
                for ti in 0..self.tiles_per_chunk {
                    let partials = &sram_readres_addrs[&ti];
                    let lo = (ti * banks) as usize;
                    let hi_end = ((ti + 1) * banks).min(self.dk) as usize;
                    let slice = head_addrs[lo..hi_end].to_vec();

                    if chunks > 1 {
                        assert!(partials.len() == chunks as usize);
                        let (sram_acc, acc_bytes) = common.spad.allocate(banks as u64, true);
                        tile.instructions.push(Instruction {
                            opcode: Opcode::Add,
                            dest_addr: sram_acc,
                            size: acc_bytes,
                            src_addrs: partials.clone(),
                            ..Default::default()
                        });
                        tile.instructions.push(Instruction {
                            opcode: Opcode::Movout,
                            dest_addr: sram_acc,
                            size: acc_bytes,
                            src_addrs: slice,
                            operand_id: OUTPUT_OPERAND,
                            ..Default::default()
                        });
                    } else {
                        tile.instructions.push(Instruction {
                            opcode: Opcode::Movout,
                            dest_addr: partials[0],
                            size: banks as u64 * ctx.config.precision as u64,
                            src_addrs: slice,
                            operand_id: OUTPUT_OPERAND,
                            ..Default::default()
                        });
                    }
                }
            }
        }

        tile
    }

    #[allow(clippy::too_many_arguments)]
    fn emit_prefill(
        &self,
        common: &mut OpCommon,
        ctx: &LowerCtx,
        tile: &mut crate::operator::Tile,
        out: TensorId,
        i: usize,
        seq_len: u32,
        q_len: u32,
    ) {
        let logit = ctx.arena.get(self.logit(common, i)).as_npu();
        let value = ctx.arena.get(self.vcache(common, i)).as_pim();
        for hi in 0..self.nh {
            let (q, seq, dk) = (q_len as u64, seq_len as u64, self.dk as u64);
            let (sram_l, l_bytes) = common.spad.allocate(q * seq, false);
            let (sram_v, v_bytes) = common.spad.allocate(seq * dk, false);
            let (sram_a, a_bytes) = common.spad.allocate(q * dk, true);

            tile.instructions.push(Instruction {
                opcode: Opcode::Movin,
                dest_addr: sram_l,
                size: l_bytes,
                src_addrs: logit.inner_all_addrs(hi as usize),
                operand_id: INPUT_OPERAND,
                ..Default::default()
            });
            tile.instructions.push(Instruction {
                opcode: Opcode::Movin,
                dest_addr: sram_v,
                size: v_bytes,
                src_addrs: value.get_all_addrs(),
                operand_id: INPUT_OPERAND,
                ..Default::default()
            });
            tile.instructions.push(Instruction {
                opcode: Opcode::Gemm,
                dest_addr: sram_a,
                size: a_bytes,
                src_addrs: vec![sram_l, sram_v],
                tile_m: q_len,
                tile_k: seq_len,
                tile_n: self.dk,
                ..Default::default()
            });
            tile.instructions.push(Instruction {
                opcode: Opcode::Movout,
                dest_addr: sram_a,
                size: a_bytes,
                src_addrs: ctx.arena.get(out).as_npu().inner_all_addrs(hi as usize),
                operand_id: OUTPUT_OPERAND,
                ..Default::default()
            });
        }
    }
}

impl Default for PimAttend {
    fn default() -> Self {
        Self::new()
    }
}

/// Greedy decode-request packing shared by the two PIM attention stages:
/// requests accumulate into a tile until the scratchpad estimate overflows,
/// which closes the tile at the previous request. A single oversized request
/// means the hardware is mis-sized and is fatal.
fn pack_requests_by_sram(
    common: &OpCommon,
    ctx: &LowerCtx,
    batch_size: usize,
    mut shape_of: impl FnMut(usize) -> (u32, u32),
) -> Vec<usize> {
    let mut req_idxs = Vec::new();
    let config = ctx.config;
    let nh = config.heads_per_rank() as u64;
    let dk = config.d_k() as u64;
    let e = config.embd_per_rank() as u64;
    let page_size = config.elems_per_dram_row() as u64;

    let heads_per_dram_page = page_size / dk;
    assert!(
        heads_per_dram_page > 0,
        "{}: head dim {} larger than a DRAM page of {} elements",
        common.name,
        dk,
        page_size
    );
    let heads_space_in_page = heads_per_dram_page * dk;
    let chunks = div_ceil(e, heads_space_in_page);

    let budget = config.spad_size as u64 * 1024;
    let mut sram_needs = 0u64;
    for i in 0..batch_size {
        let (q_len, seq_len) = shape_of(i);
        assert!(
            q_len == 1,
            "{}: request {} is in prefill (q_len {}), only decode is supported here",
            common.name,
            i,
            q_len
        );
        // staged logits plus per-chunk partial outputs, per head
        let need = (seq_len as u64 + chunks * dk) * nh;
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
            req_idxs.push(i - 1);
            sram_needs = need;
        }
    }
    req_idxs.push(batch_size - 1);
    req_idxs
}

/// NEWTON issues its COMP burst as discrete commands closed by a READRES;
/// the fused DRAM dialects collapse the group into one command.
fn emit_comp_pattern(
    tile: &mut crate::operator::Tile,
    dram_type: DramType,
    num_comps: u32,
    sram_addr: u64,
    sram_bytes: u64,
    dram_addr: u64,
) {
    if dram_type == DramType::Newton {
        let comp_inst = Instruction {
            opcode: Opcode::PimComp,
            dest_addr: sram_addr,
            size: 0,
            src_addrs: vec![dram_addr],
            operand_id: INPUT_OPERAND,
            ..Default::default()
        };
        for _ in 0..num_comps {
            tile.instructions.push(comp_inst.clone());
        }
        tile.instructions.push(Instruction {
            opcode: Opcode::PimReadres,
            dest_addr: sram_addr,
            size: sram_bytes,
            src_addrs: vec![dram_addr],
            operand_id: INPUT_OPERAND,
            ..Default::default()
        });
    } else {
        tile.instructions.push(Instruction {
            opcode: Opcode::PimCompsReadres,
            dest_addr: sram_addr,
            size: sram_bytes,
            src_addrs: vec![dram_addr],
            operand_id: INPUT_OPERAND,
            ..Default::default()
        });
    }
}
