use std::cell::RefCell;
use std::rc::Rc;

use log::debug;

use crate::config::{RunMode, SimulationConfig};
use crate::memory::allocator::AllocatorContext;
use crate::tensor::{KvType, Tensor, TensorArena, TensorId};
use crate::utils::name_concat;

/// One inference request moving through prefill and decode. The scheduler
/// flips `is_initiated` after prefill and bumps `generated` once per decode
/// step; the attention lowering grows the caches.
#[derive(Debug)]
pub struct InferRequest {
    pub id: u32,
    /// prompt token count
    pub input_size: u32,
    /// target generated token count
    pub output_size: u32,
    pub generated: u32,
    /// true once prefill completed; every later step consumes one token
    pub is_initiated: bool,
    /// PIM channel bound to this request's K/V tensors
    pub channel: u32,
    /// per-layer cache handles
    pub k_cache: Vec<TensorId>,
    pub v_cache: Vec<TensorId>,
}

pub type SharedRequest = Rc<RefCell<InferRequest>>;

impl InferRequest {
    pub fn done(&self) -> bool {
        self.generated >= self.output_size
    }

    /// Creates the per-layer K/V tensors in the layout the run mode demands.
    /// Called once at admission, after prefill sized the caches.
    pub fn init_cache(
        &mut self,
        arena: &mut TensorArena,
        alloc: &mut AllocatorContext,
        config: &SimulationConfig,
    ) {
        assert!(self.k_cache.is_empty(), "cache initialized twice");
        if config.ch_load_balancing && config.run_mode == RunMode::NpuPim {
            // bind to the channel with the most free rows at admission time
            self.channel = (0..config.dram_channels)
                .max_by_key(|&ch| alloc.kv.free_rows_on(ch))
                .unwrap_or(0);
        }
        let h = config.heads_per_rank();
        let d_k = config.d_k();
        let seq_len = self.input_size;
        let req_tag = format!("req{}", self.id);

        for layer in 0..config.model_n_layer {
            let layer_tag = format!("l{}", layer);
            let key_name = name_concat(&[&req_tag, "key", &layer_tag]);
            let value_name = name_concat(&[&req_tag, "value", &layer_tag]);
            let key_dims = vec![h, d_k, seq_len];
            let value_dims = vec![h, seq_len, d_k];

            let (k, v) = match config.run_mode {
                RunMode::NpuPim => (
                    arena.create_pim(
                        key_name,
                        self.channel,
                        key_dims,
                        KvType::Key,
                        true,
                        &mut alloc.kv,
                        config,
                    ),
                    arena.create_pim(
                        value_name,
                        self.channel,
                        value_dims,
                        KvType::Value,
                        true,
                        &mut alloc.kv,
                        config,
                    ),
                ),
                RunMode::NpuOnly => (
                    arena.create_npu_kv(key_name, key_dims, KvType::Key, true, alloc, config),
                    arena.create_npu_kv(value_name, value_dims, KvType::Value, true, alloc, config),
                ),
            };
            self.k_cache.push(k);
            self.v_cache.push(v);
        }
        debug!(
            "req{}: cache initialized, seq_len {}, channel {}",
            self.id, seq_len, self.channel
        );
    }

    /// Returns all PIM rows to the pool when the request retires. NPU-layout
    /// entries stay pooled for the lifetime of the run.
    pub fn release_cache(&mut self, arena: &mut TensorArena, alloc: &mut AllocatorContext) {
        for id in self.k_cache.drain(..).chain(self.v_cache.drain(..)) {
            if let Tensor::Pim(t) = arena.get_mut(id) {
                t.release_rows(&mut alloc.kv);
            }
        }
    }
}

/// An ordered sub-batch of requests. Immutable after construction; the row
/// accounting below sizes every batched NPU operation.
#[derive(Debug, Clone)]
pub struct BatchedRequest {
    reqs: Vec<SharedRequest>,
}

impl BatchedRequest {
    pub fn new(reqs: Vec<SharedRequest>) -> Self {
        Self { reqs }
    }

    pub fn num_reqs(&self) -> usize {
        self.reqs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.reqs.is_empty()
    }

    /// Rows contributed to a batched matmul: one per decoding request, the
    /// whole prompt for a request still in prefill.
    pub fn num_rows(&self) -> u32 {
        self.reqs
            .iter()
            .map(|r| {
                let r = r.borrow();
                if r.is_initiated {
                    1
                } else {
                    r.input_size
                }
            })
            .sum()
    }

    pub fn num_rows_breakdown(&self) -> Vec<u32> {
        self.reqs
            .iter()
            .map(|r| {
                let r = r.borrow();
                if r.is_initiated {
                    1
                } else {
                    r.input_size
                }
            })
            .collect()
    }

    pub fn is_initiated(&self, index: usize) -> bool {
        self.reqs[index].borrow().is_initiated
    }

    pub fn cache(&self, layer: u32, index: usize) -> (TensorId, TensorId) {
        let req = self.reqs[index].borrow();
        (
            req.k_cache[layer as usize],
            req.v_cache[layer as usize],
        )
    }

    pub fn reqs(&self) -> &[SharedRequest] {
        &self.reqs
    }
}

/// Synthetic client: builds the request stream the `request_*` config
/// describes. Channels bind round-robin here; with `ch_load_balancing` the
/// binding is revisited at admission, once earlier caches occupy rows.
pub fn generate_requests(config: &SimulationConfig) -> Vec<SharedRequest> {
    let count = config.request_total_cnt.min(config.max_active_reqs);
    (0..count)
        .map(|id| {
            let channel = id % config.dram_channels;
            Rc::new(RefCell::new(InferRequest {
                id,
                input_size: config.request_input_seq_len,
                output_size: config.request_output_seq_len,
                generated: 0,
                is_initiated: false,
                channel,
                k_cache: Vec::new(),
                v_cache: Vec::new(),
            }))
        })
        .collect()
}

#[cfg(test)]
mod test {
    use super::*;

    fn req(id: u32, input_size: u32, is_initiated: bool) -> SharedRequest {
        Rc::new(RefCell::new(InferRequest {
            id,
            input_size,
            output_size: 8,
            generated: 0,
            is_initiated,
            channel: 0,
            k_cache: Vec::new(),
            v_cache: Vec::new(),
        }))
    }

    #[test]
    fn row_breakdown_tracks_initiation() {
        let batch = BatchedRequest::new(vec![req(0, 128, false), req(1, 64, true), req(2, 32, true)]);
        let breakdown = batch.num_rows_breakdown();
        assert_eq!(breakdown, vec![128, 1, 1]);
        assert_eq!(batch.num_rows(), breakdown.iter().sum::<u32>());
    }

    #[test]
    fn round_robin_channel_binding() {
        let config = crate::config::SimulationConfig {
            request_total_cnt: 3,
            ..Default::default()
        };
        let reqs = generate_requests(&config);
        assert_eq!(reqs.len(), 3);
        assert_eq!(reqs[2].borrow().channel, 2);
    }
}
