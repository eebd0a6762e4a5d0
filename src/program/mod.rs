use std::fs::File;
use std::io::{self, Write};
use std::path::Path;

use derive_more::Display;
use fxhash::FxHashMap;
use itertools::Itertools;
use log::{debug, info};
use serde::Serialize;

use crate::config::{CycleType, RunMode, SimulationConfig};
use crate::model::ModelWeights;
use crate::operator::{
    FusedMha, LowerCtx, MatMul, OpId, OpKind, Operation, PimAttend, PimLogitSoftmax, Pointwise,
    PointwiseKind, Tile,
};
use crate::request::BatchedRequest;
use crate::tensor::{NpuBufType, TensorArena, TensorId, TensorNode};
use crate::utils::name_concat;

/// Which platform a stage program targets in the interleaved schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum StagePlatform {
    #[display("SA")]
    Sa,
    #[display("PIM")]
    Pim,
}

/// Position in the two-phase sub-batch interleaving.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum Stage {
    A,
    B,
}

/// One row of the per-step operation log.
#[derive(Debug, Clone, Serialize)]
pub struct OperationStat {
    pub name: String,
    pub optype: String,
    pub tiles: usize,
    pub instructions: usize,
    pub cycles: CycleType,
    pub dram_reads: u64,
    pub dram_writes: u64,
}

impl OperationStat {
    fn new(name: &str, optype: &str) -> Self {
        Self {
            name: name.to_string(),
            optype: optype.to_string(),
            tiles: 0,
            instructions: 0,
            cycles: 0,
            dram_reads: 0,
            dram_writes: 0,
        }
    }

    fn add_tile(&mut self, tile: &Tile, cycles: CycleType) {
        use crate::operator::Opcode;
        self.tiles += 1;
        self.instructions += tile.instructions.len();
        self.cycles += cycles;
        for inst in &tile.instructions {
            match inst.opcode {
                Opcode::Movin => self.dram_reads += inst.size,
                Opcode::Movout => self.dram_writes += inst.size,
                Opcode::PimReadres | Opcode::PimCompsReadres => self.dram_reads += inst.size,
                _ => {}
            }
        }
    }
}

/// The operation DAG for one (sub-batch, platform, stage) triple. Stitches
/// transformer blocks into operations at construction, then tracks readiness
/// as the dispatch scheduler completes tiles.
pub struct StageProgram {
    name: String,
    platform: StagePlatform,
    stage: Stage,
    breq: BatchedRequest,
    op_map: FxHashMap<OpId, Operation>,
    executable: Vec<OpId>,
    stats: FxHashMap<OpId, OperationStat>,
    finished_order: Vec<OpId>,
    next_op_id: OpId,
}

impl StageProgram {
    pub fn new(
        weights: &ModelWeights,
        breq: BatchedRequest,
        platform: StagePlatform,
        stage: Stage,
        ctx: &mut LowerCtx,
    ) -> Self {
        let mut program = Self {
            name: format!("{}_stage_{}", platform, stage),
            platform,
            stage,
            breq,
            op_map: FxHashMap::default(),
            executable: Vec::new(),
            stats: FxHashMap::default(),
            finished_order: Vec::new(),
            next_op_id: 0,
        };
        program.init_program(weights, ctx);
        info!(
            "{}: {} operations, {} initially executable",
            program.name,
            program.op_map.len(),
            program.executable.len()
        );
        program
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn enable_qkv_gen(&self) -> bool {
        self.stage == Stage::A
    }

    fn enable_proj_ffns(&self) -> bool {
        self.stage == Stage::B
    }

    fn skip_pim_stage(&self, config: &SimulationConfig) -> bool {
        config.run_mode == RunMode::NpuOnly || self.breq.is_empty()
    }

    fn init_program(&mut self, weights: &ModelWeights, ctx: &mut LowerCtx) {
        if self.breq.is_empty() {
            return;
        }
        match self.platform {
            StagePlatform::Sa => self.init_sa_program(weights, ctx),
            StagePlatform::Pim => self.init_pim_program(ctx),
        }
    }

    /// Registers an operation: wires edges, lowers it, and seeds the
    /// executable set when its inputs are already produced.
    pub fn add_op(
        &mut self,
        kind: OpKind,
        name: String,
        inputs: Vec<TensorId>,
        ctx: &mut LowerCtx,
    ) -> Vec<TensorId> {
        let id = self.next_op_id;
        self.next_op_id += 1;
        let mut op = Operation::new(id, name, kind, ctx.config);
        let outputs = op.lower(ctx, inputs);
        if op.executable(ctx.arena) {
            self.executable.push(id);
        }
        self.op_map.insert(id, op);
        outputs
    }

    /// Fresh produced activation standing in for a tensor computed by the
    /// other platform in a previous stage.
    fn stage_input(
        &mut self,
        name: String,
        dims: Vec<u32>,
        ctx: &mut LowerCtx,
    ) -> TensorId {
        ctx.arena
            .create_npu(name, dims, NpuBufType::Act, true, ctx.alloc, ctx.config)
    }

    fn init_sa_program(&mut self, weights: &ModelWeights, ctx: &mut LowerCtx) {
        let num_rows = self.breq.num_rows();
        let e = ctx.config.model_n_embd;
        let e_rank = ctx.config.embd_per_rank();

        for layer in 0..weights.num_layers() {
            let tag = format!("l{}", layer);

            if ctx.config.run_mode == RunMode::NpuOnly {
                // the whole block chains on one platform
                let x = self.stage_input(
                    name_concat(&[&tag, "input"]),
                    vec![num_rows, e],
                    ctx,
                );
                let qkv = self.qkv_gen_block(weights, layer, x, ctx);
                let attn = self.mha_block(layer, qkv, ctx);
                self.proj_ffn_block(weights, layer, attn, x, ctx);
                continue;
            }

            if self.enable_qkv_gen() {
                let x = self.stage_input(
                    name_concat(&[&tag, "input"]),
                    vec![num_rows, e],
                    ctx,
                );
                self.qkv_gen_block(weights, layer, x, ctx);
            }
            if self.enable_proj_ffns() {
                // attention output and residual stream from earlier stages
                let attn = self.stage_input(
                    name_concat(&[&tag, "attn"]),
                    vec![num_rows, e_rank],
                    ctx,
                );
                let residual = self.stage_input(
                    name_concat(&[&tag, "residual"]),
                    vec![num_rows, e],
                    ctx,
                );
                self.proj_ffn_block(weights, layer, attn, residual, ctx);
            }
        }
    }

    fn init_pim_program(&mut self, ctx: &mut LowerCtx) {
        if self.skip_pim_stage(ctx.config) {
            return;
        }
        let num_layers = {
            let req = self.breq.reqs()[0].borrow();
            req.k_cache.len() as u32
        };
        for layer in 0..num_layers {
            self.attention_block(layer, ctx);
        }
    }

    /// LayerNorm then the packed QKV projection.
    fn qkv_gen_block(
        &mut self,
        weights: &ModelWeights,
        layer: u32,
        x: TensorId,
        ctx: &mut LowerCtx,
    ) -> TensorId {
        let tag = format!("l{}", layer);
        let lw = weights.layer(layer);
        let normed = self.add_op(
            OpKind::Pointwise(Pointwise::new(PointwiseKind::LayerNorm)),
            name_concat(&[&tag, "ln1"]),
            vec![x],
            ctx,
        )[0];
        self.add_op(
            OpKind::MatMul(MatMul::new()),
            name_concat(&[&tag, "qkv_gen"]),
            vec![normed, lw.w_qkv, lw.b_qkv],
            ctx,
        )[0]
    }

    /// NPU-only attention over the linear-layout caches. Decoding requests
    /// grow their caches by the token this step appends.
    fn mha_block(&mut self, layer: u32, qkv: TensorId, ctx: &mut LowerCtx) -> TensorId {
        let tag = format!("l{}", layer);
        let mut inputs = vec![qkv];
        let mut keys = Vec::new();
        let mut values = Vec::new();
        for i in 0..self.breq.num_reqs() {
            let (k, v) = self.breq.cache(layer, i);
            if self.breq.is_initiated(i) {
                ctx.arena.get_mut(k).add_token(&mut ctx.alloc.kv);
                ctx.arena.get_mut(v).add_token(&mut ctx.alloc.kv);
            }
            keys.push(k);
            values.push(v);
        }
        inputs.extend(keys);
        inputs.extend(values);

        self.add_op(
            OpKind::FusedMha(FusedMha::new(self.breq.num_rows_breakdown())),
            name_concat(&[&tag, "mha"]),
            inputs,
            ctx,
        )[0]
    }

    /// PIM attention pair: logit-softmax against the KEY caches, attend
    /// against the VALUE caches. Caches grow by this step's token first.
    fn attention_block(&mut self, layer: u32, ctx: &mut LowerCtx) {
        let tag = format!("l{}", layer);
        let h = ctx.config.heads_per_rank();
        let d_k = ctx.config.d_k();

        let mut queries = Vec::new();
        let mut keys = Vec::new();
        let mut values = Vec::new();
        for i in 0..self.breq.num_reqs() {
            assert!(
                self.breq.is_initiated(i),
                "{}: request {} reached the attention stage before prefill",
                self.name,
                i
            );
            let (k, v) = self.breq.cache(layer, i);
            ctx.arena.get_mut(k).add_token(&mut ctx.alloc.kv);
            ctx.arena.get_mut(v).add_token(&mut ctx.alloc.kv);
            keys.push(k);
            values.push(v);
            queries.push(self.stage_input(
                name_concat(&[&tag, &format!("query{}", i)]),
                vec![h, 1, d_k],
                ctx,
            ));
        }

        let mut logit_inputs = queries;
        logit_inputs.extend(keys);
        let logits = self.add_op(
            OpKind::PimLogitSoftmax(PimLogitSoftmax::new()),
            name_concat(&[&tag, "logit_softmax"]),
            logit_inputs,
            ctx,
        );

        let mut attend_inputs = logits;
        attend_inputs.extend(values);
        self.add_op(
            OpKind::PimAttend(PimAttend::new()),
            name_concat(&[&tag, "attend"]),
            attend_inputs,
            ctx,
        );
    }

    /// Output projection, residual, and the FFN. `kernel_fusion` collapses
    /// the residual-add into the layernorm and the ff1 bias into the gelu.
    fn proj_ffn_block(
        &mut self,
        weights: &ModelWeights,
        layer: u32,
        attn: TensorId,
        residual: TensorId,
        ctx: &mut LowerCtx,
    ) -> TensorId {
        let tag = format!("l{}", layer);
        let lw = weights.layer(layer);
        let fusion = ctx.config.kernel_fusion;

        let proj = self.add_op(
            OpKind::MatMul(MatMul::new()),
            name_concat(&[&tag, "proj"]),
            vec![attn, lw.w_proj, lw.b_proj],
            ctx,
        )[0];

        let (sum, normed) = if fusion {
            let outs = self.add_op(
                OpKind::Pointwise(Pointwise::new(PointwiseKind::AddLayerNorm)),
                name_concat(&[&tag, "residual_ln2"]),
                vec![proj, residual],
                ctx,
            );
            (outs[0], outs[1])
        } else {
            let sum = self.add_op(
                OpKind::Pointwise(Pointwise::new(PointwiseKind::Add)),
                name_concat(&[&tag, "residual"]),
                vec![proj, residual],
                ctx,
            )[0];
            let normed = self.add_op(
                OpKind::Pointwise(Pointwise::new(PointwiseKind::LayerNorm)),
                name_concat(&[&tag, "ln2"]),
                vec![sum],
                ctx,
            )[0];
            (sum, normed)
        };

        let activated = if fusion {
            let ff1 = self.add_op(
                OpKind::MatMul(MatMul::new()),
                name_concat(&[&tag, "ff1"]),
                vec![normed, lw.w_ff1],
                ctx,
            )[0];
            self.add_op(
                OpKind::Pointwise(Pointwise::new(PointwiseKind::BiasGelu)),
                name_concat(&[&tag, "bias_gelu"]),
                vec![ff1, lw.b_ff1],
                ctx,
            )[0]
        } else {
            let ff1 = self.add_op(
                OpKind::MatMul(MatMul::new()),
                name_concat(&[&tag, "ff1"]),
                vec![normed, lw.w_ff1, lw.b_ff1],
                ctx,
            )[0];
            self.add_op(
                OpKind::Pointwise(Pointwise::new(PointwiseKind::Gelu)),
                name_concat(&[&tag, "gelu"]),
                vec![ff1],
                ctx,
            )[0]
        };

        let ff2 = self.add_op(
            OpKind::MatMul(MatMul::new()),
            name_concat(&[&tag, "ff2"]),
            vec![activated, lw.w_ff2, lw.b_ff2],
            ctx,
        )[0];
        self.add_op(
            OpKind::Pointwise(Pointwise::new(PointwiseKind::Add)),
            name_concat(&[&tag, "ffn_residual"]),
            vec![ff2, sum],
            ctx,
        )[0]
    }

    pub fn get_executable_operations(&self) -> &[OpId] {
        &self.executable
    }

    pub fn pop_executable(&mut self) -> Option<OpId> {
        self.executable.pop()
    }

    pub fn check_exist_in_executable(&self, op_id: OpId) -> bool {
        self.executable.contains(&op_id)
    }

    pub fn operation(&self, op_id: OpId) -> &Operation {
        self.op_map
            .get(&op_id)
            .unwrap_or_else(|| panic!("{}: unknown operation id {}", self.name, op_id))
    }

    pub fn num_operations(&self) -> usize {
        self.op_map.len()
    }

    /// Moves an operation's tiles out for dispatch; each tile comes back
    /// through `finish_operation_tile`.
    pub fn take_tiles(&mut self, op_id: OpId) -> Vec<Tile> {
        let op = self
            .op_map
            .get_mut(&op_id)
            .unwrap_or_else(|| panic!("{}: unknown operation id {}", self.name, op_id));
        std::mem::take(&mut op.common.tiles)
    }

    /// Records a completed tile; the last tile of an operation finishes it.
    pub fn finish_operation_tile(
        &mut self,
        arena: &mut TensorArena,
        tile: &Tile,
        cycles: CycleType,
    ) {
        let op = self
            .op_map
            .get_mut(&tile.operation_id)
            .unwrap_or_else(|| {
                panic!(
                    "{}: tile completion for unknown operation id {}",
                    self.name, tile.operation_id
                )
            });
        assert!(
            !op.common.finished,
            "{}: tile completion after {} already finished",
            self.name,
            op.common.name
        );
        let (name, optype) = (op.common.name.clone(), op.optype());
        op.common.finished_tiles += 1;
        let done = op.common.finished_tiles == op.common.num_tiles;

        self.stats
            .entry(tile.operation_id)
            .or_insert_with(|| OperationStat::new(&name, optype))
            .add_tile(tile, cycles);

        if done {
            self.finish_operation(arena, tile.operation_id);
        }
    }

    /// Marks the operation's outputs produced and promotes any consumer
    /// whose inputs are now all produced.
    pub fn finish_operation(&mut self, arena: &mut TensorArena, op_id: OpId) {
        let op = self
            .op_map
            .get_mut(&op_id)
            .unwrap_or_else(|| panic!("{}: unknown operation id {}", self.name, op_id));
        op.common.finished = true;
        self.finished_order.push(op_id);
        debug!("{}: finished {}", self.name, op.common.name);

        let outputs = op.common.outputs.clone();
        for out in outputs {
            arena.get_mut(out).set_produced();
            self.find_executable_node(arena, out);
        }
    }

    /// Scans a tensor's consumers for newly-ready operations.
    pub fn find_executable_node(&mut self, arena: &TensorArena, tensor: TensorId) {
        let children = arena.get(tensor).child_nodes().to_vec();
        for child in children {
            let Some(op) = self.op_map.get(&child) else {
                continue; // consumer registered by another stage program
            };
            if op.executable(arena) && !self.check_exist_in_executable(child) {
                self.executable.push(child);
            }
        }
    }

    /// Complete when nothing is ready and nothing is in flight.
    pub fn check_finish(&self) -> bool {
        self.executable.is_empty() && self.op_map.values().all(|op| op.common.finished)
    }

    pub fn list_operation_stat(&self) -> Vec<OperationStat> {
        self.finished_order
            .iter()
            .filter_map(|id| self.stats.get(id).cloned())
            .collect()
    }

    pub fn total_cycles(&self) -> CycleType {
        self.stats.values().map(|s| s.cycles).sum()
    }

    /// Writes the operation DAG as Graphviz dot: box nodes per operation,
    /// ellipses for source tensors, edges following the tensor consumers.
    pub fn dump_dot(&self, arena: &TensorArena, path: &Path) -> io::Result<()> {
        let mut f = File::create(path)?;
        writeln!(f, "digraph {} {{", self.name)?;
        writeln!(f, "    rankdir=LR;")?;
        writeln!(f, "    node [shape=box, style=filled, color=lightblue];")?;

        for op in self.op_map.values().sorted_by_key(|op| op.id()) {
            writeln!(
                f,
                "    op_{} [label=\"{}\\n{}\"];",
                op.id(),
                op.name(),
                op.optype()
            )?;
            for &out in &op.common.outputs {
                for &child in arena.get(out).child_nodes() {
                    if self.op_map.contains_key(&child) {
                        writeln!(f, "    op_{} -> op_{};", op.id(), child)?;
                    }
                }
            }
        }

        // source tensors feeding the program
        let mut declared = fxhash::FxHashSet::default();
        for op in self.op_map.values().sorted_by_key(|op| op.id()) {
            for &input in &op.common.inputs {
                let tensor = arena.get(input);
                if tensor.src_node().is_none() {
                    if declared.insert(input) {
                        writeln!(
                            f,
                            "    tensor_{} [label=\"{}\", shape=ellipse, color=lightgrey];",
                            input,
                            tensor.name()
                        )?;
                    }
                    writeln!(f, "    tensor_{} -> op_{};", input, op.id())?;
                }
            }
        }

        writeln!(f, "}}")?;
        Ok(())
    }
}
