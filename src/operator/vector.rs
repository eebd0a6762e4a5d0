use crate::operator::{
    region_addrs, Instruction, LowerCtx, OpCommon, Opcode, INPUT_OPERAND, OUTPUT_OPERAND,
};
use crate::tensor::{NpuBufType, TensorId};
use crate::utils::{div_ceil, name_concat};

/// Row-parallel operations on the vector unit. The fused kinds collapse the
/// residual-into-norm and bias-into-activation pairs the builder would
/// otherwise emit back to back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PointwiseKind {
    LayerNorm,
    Softmax,
    Gelu,
    Add,
    /// a + b, then layernorm; outputs [sum, normed]
    AddLayerNorm,
    /// x + bias, then gelu
    BiasGelu,
}

impl PointwiseKind {
    pub fn optype(&self) -> &'static str {
        match self {
            PointwiseKind::LayerNorm => "LayerNorm",
            PointwiseKind::Softmax => "Softmax",
            PointwiseKind::Gelu => "Gelu",
            PointwiseKind::Add => "Add",
            PointwiseKind::AddLayerNorm => "AddLayerNorm",
            PointwiseKind::BiasGelu => "BiasGelu",
        }
    }

    fn num_inputs(&self) -> usize {
        match self {
            PointwiseKind::LayerNorm | PointwiseKind::Softmax | PointwiseKind::Gelu => 1,
            PointwiseKind::Add | PointwiseKind::AddLayerNorm | PointwiseKind::BiasGelu => 2,
        }
    }
}

#[derive(Debug)]
pub struct Pointwise {
    pub kind: PointwiseKind,
    rows: u32,
    cols: u32,
    rows_per_tile: u32,
}

impl Pointwise {
    pub fn new(kind: PointwiseKind) -> Self {
        Self {
            kind,
            rows: 0,
            cols: 0,
            rows_per_tile: 0,
        }
    }

    pub fn lower(&mut self, common: &mut OpCommon, ctx: &mut LowerCtx) -> Vec<TensorId> {
        assert!(
            common.inputs.len() == self.kind.num_inputs(),
            "{}: {} expects {} inputs, got {}",
            common.name,
            self.kind.optype(),
            self.kind.num_inputs(),
            common.inputs.len()
        );

        let dims = ctx.arena.get(common.inputs[0]).dims().to_vec();
        assert!(dims.len() == 2, "{}: pointwise operands must be 2D", common.name);
        self.rows = dims[0];
        self.cols = dims[1];

        match self.kind {
            PointwiseKind::Add | PointwiseKind::AddLayerNorm => {
                let other = ctx.arena.get(common.inputs[1]).dims();
                assert!(
                    other == dims.as_slice(),
                    "{}: operand shapes differ, {:?} vs {:?}",
                    common.name,
                    dims,
                    other
                );
            }
            PointwiseKind::BiasGelu => {
                let bias = ctx.arena.get(common.inputs[1]).dims();
                assert!(
                    bias == [1, self.cols],
                    "{}: bias shape {:?} does not match cols {}",
                    common.name,
                    bias,
                    self.cols
                );
            }
            _ => {}
        }

        let mut outputs = vec![ctx.arena.create_npu(
            name_concat(&[&common.name, "out"]),
            vec![self.rows, self.cols],
            NpuBufType::Act,
            false,
            ctx.alloc,
            ctx.config,
        )];
        if self.kind == PointwiseKind::AddLayerNorm {
            // outputs[0] is the residual sum, outputs[1] the normalized rows
            outputs.push(ctx.arena.create_npu(
                name_concat(&[&common.name, "norm"]),
                vec![self.rows, self.cols],
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
        // stage every operand row plus the output rows per tile row
        let num_outputs = if self.kind == PointwiseKind::AddLayerNorm { 2 } else { 1 };
        let words_per_row = self.cols as u64 * (self.kind.num_inputs() as u64 + num_outputs);
        let spad_words = ctx.config.spad_size as u64 * 1024;
        let rows_fit = spad_words / words_per_row;
        assert!(
            rows_fit > 0,
            "{}: scratchpad too small for one row of {} elements",
            common.name,
            self.cols
        );
        self.rows_per_tile = (rows_fit as u32).min(self.rows);
    }

    fn initialize_tiles(&mut self, common: &mut OpCommon, ctx: &LowerCtx, outputs: &[TensorId]) {
        let num_tiles = div_ceil(self.rows as u64, self.rows_per_tile as u64) as u32;
        for ti in 0..num_tiles {
            let row0 = ti * self.rows_per_tile;
            let rows = self.rows_per_tile.min(self.rows - row0);
            let tile = self.initialize_instructions(common, ctx, outputs, ti, row0, rows);
            common.tiles.push(tile);
        }
    }

    fn initialize_instructions(
        &self,
        common: &mut OpCommon,
        ctx: &LowerCtx,
        outputs: &[TensorId],
        ti: u32,
        row0: u32,
        rows: u32,
    ) -> crate::operator::Tile {
        let mut tile = common.new_tile(ti, 0, false);
        common.spad.reset();

        let words = rows as u64 * self.cols as u64;
        let mut sram_in = Vec::new();
        for &input in &common.inputs {
            let tensor = ctx.arena.get(input);
            let is_bias = self.kind == PointwiseKind::BiasGelu && sram_in.len() == 1;
            let (elems, addrs) = if is_bias {
                (
                    self.cols as u64,
                    region_addrs(tensor, 0, 1, 0, self.cols, ctx.config),
                )
            } else {
                (words, region_addrs(tensor, row0, rows, 0, self.cols, ctx.config))
            };
            let (addr, bytes) = common.spad.allocate(elems, false);
            tile.instructions.push(Instruction {
                opcode: Opcode::Movin,
                dest_addr: addr,
                size: bytes,
                src_addrs: addrs,
                operand_id: INPUT_OPERAND,
                ..Default::default()
            });
            sram_in.push(addr);
        }

        let (sram_out, out_bytes) = common.spad.allocate(words, false);
        match self.kind {
            PointwiseKind::LayerNorm => {
                tile.instructions.push(Instruction {
                    opcode: Opcode::LayerNorm,
                    dest_addr: sram_out,
                    size: out_bytes,
                    src_addrs: vec![sram_in[0]],
                    ..Default::default()
                });
            }
            PointwiseKind::Softmax => {
                tile.instructions.push(Instruction {
                    opcode: Opcode::Softmax,
                    dest_addr: sram_out,
                    size: out_bytes,
                    src_addrs: vec![sram_in[0]],
                    ..Default::default()
                });
            }
            PointwiseKind::Gelu => {
                tile.instructions.push(Instruction {
                    opcode: Opcode::Gelu,
                    dest_addr: sram_out,
                    size: out_bytes,
                    src_addrs: vec![sram_in[0]],
                    ..Default::default()
                });
            }
            PointwiseKind::Add | PointwiseKind::BiasGelu | PointwiseKind::AddLayerNorm => {
                tile.instructions.push(Instruction {
                    opcode: Opcode::Add,
                    dest_addr: sram_out,
                    size: out_bytes,
                    src_addrs: vec![sram_in[0], sram_in[1]],
                    ..Default::default()
                });
            }
        }

        // bias-gelu applies the activation in place before the drain
        if self.kind == PointwiseKind::BiasGelu {
            tile.instructions.push(Instruction {
                opcode: Opcode::Gelu,
                dest_addr: sram_out,
                size: out_bytes,
                src_addrs: vec![sram_out],
                ..Default::default()
            });
        }

        // MOVOUT of the primary output (the sum for add-layernorm)
        tile.instructions.push(Instruction {
            opcode: Opcode::Movout,
            dest_addr: sram_out,
            size: out_bytes,
            src_addrs: region_addrs(ctx.arena.get(outputs[0]), row0, rows, 0, self.cols, ctx.config),
            operand_id: OUTPUT_OPERAND,
            ..Default::default()
        });

        match self.kind {
            PointwiseKind::AddLayerNorm => {
                let (sram_norm, norm_bytes) = common.spad.allocate(words, false);
                tile.instructions.push(Instruction {
                    opcode: Opcode::LayerNorm,
                    dest_addr: sram_norm,
                    size: norm_bytes,
                    src_addrs: vec![sram_out],
                    ..Default::default()
                });
                tile.instructions.push(Instruction {
                    opcode: Opcode::Movout,
                    dest_addr: sram_norm,
                    size: norm_bytes,
                    src_addrs: region_addrs(
                        ctx.arena.get(outputs[1]),
                        row0,
                        rows,
                        0,
                        self.cols,
                        ctx.config,
                    ),
                    operand_id: OUTPUT_OPERAND,
                    ..Default::default()
                });
            }
            _ => {}
        }

        tile
    }
}
