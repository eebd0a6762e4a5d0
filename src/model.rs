use log::info;

use crate::config::SimulationConfig;
use crate::memory::allocator::AllocatorContext;
use crate::tensor::{NpuBufType, TensorArena, TensorId};
use crate::utils::name_concat;

/// Weight and bias handles for one transformer layer, sharded for this
/// tensor-parallel rank: QKV projects into 3 * E/tp columns, the output
/// projection folds the rank's heads back to E, and the FFN splits its 4E
/// hidden width across ranks.
#[derive(Debug)]
pub struct LayerWeights {
    pub w_qkv: TensorId,
    pub b_qkv: TensorId,
    pub w_proj: TensorId,
    pub b_proj: TensorId,
    pub w_ff1: TensorId,
    pub b_ff1: TensorId,
    pub w_ff2: TensorId,
    pub b_ff2: TensorId,
}

/// Per-layer weight tensors, allocated through the weight region before the
/// activation and KV regions are placed above it.
#[derive(Debug)]
pub struct ModelWeights {
    layers: Vec<LayerWeights>,
}

impl ModelWeights {
    pub fn new(
        arena: &mut TensorArena,
        alloc: &mut AllocatorContext,
        config: &SimulationConfig,
    ) -> Self {
        let e = config.model_n_embd;
        let e_rank = config.embd_per_rank();
        let ff_hidden = 4 * e / config.n_tp;

        let weight = |arena: &mut TensorArena,
                      alloc: &mut AllocatorContext,
                      name: String,
                      dims: Vec<u32>| {
            arena.create_npu(name, dims, NpuBufType::Weight, true, alloc, config)
        };

        let layers = (0..config.model_n_layer)
            .map(|l| {
                let tag = format!("l{}", l);
                LayerWeights {
                    w_qkv: weight(arena, alloc, name_concat(&[&tag, "w_qkv"]), vec![e, 3 * e_rank]),
                    b_qkv: weight(arena, alloc, name_concat(&[&tag, "b_qkv"]), vec![1, 3 * e_rank]),
                    w_proj: weight(arena, alloc, name_concat(&[&tag, "w_proj"]), vec![e_rank, e]),
                    b_proj: weight(arena, alloc, name_concat(&[&tag, "b_proj"]), vec![1, e]),
                    w_ff1: weight(arena, alloc, name_concat(&[&tag, "w_ff1"]), vec![e, ff_hidden]),
                    b_ff1: weight(arena, alloc, name_concat(&[&tag, "b_ff1"]), vec![1, ff_hidden]),
                    w_ff2: weight(arena, alloc, name_concat(&[&tag, "w_ff2"]), vec![ff_hidden, e]),
                    b_ff2: weight(arena, alloc, name_concat(&[&tag, "b_ff2"]), vec![1, e]),
                }
            })
            .collect();

        info!(
            "model {}: {} layers, E {}, {} heads ({} per rank)",
            config.model_name,
            config.model_n_layer,
            e,
            config.model_n_head,
            config.heads_per_rank()
        );
        Self { layers }
    }

    pub fn layer(&self, l: u32) -> &LayerWeights {
        &self.layers[l as usize]
    }

    pub fn num_layers(&self) -> u32 {
        self.layers.len() as u32
    }
}
