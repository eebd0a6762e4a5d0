pub mod npu;
pub mod pim;

use enum_dispatch::enum_dispatch;
use fxhash::FxHashMap;

use crate::config::{AddrType, SimulationConfig};
use crate::memory::allocator::{AllocatorContext, KvCacheAllocator};
use crate::operator::OpId;

pub use npu::{NpuBufType, NpuTensor};
pub use pim::PimTensor;

pub type TensorId = u32;

/// Whether a cache tensor holds keys or values. The two sides use
/// incompatible physical layouts (see the pim module).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KvType {
    Key,
    Value,
}

/// Graph-node state shared by every tensor variant: identity, shape, and the
/// producer/consumer edges that drive readiness.
#[derive(Debug, Clone)]
pub struct TensorMeta {
    pub id: TensorId,
    pub name: String,
    pub dims: Vec<u32>,
    pub precision: u32,
    pub produced: bool,
    pub src_node: Option<OpId>,
    pub child_nodes: Vec<OpId>,
}

impl TensorMeta {
    fn new(id: TensorId, name: String, dims: Vec<u32>, precision: u32, produced: bool) -> Self {
        Self {
            id,
            name,
            dims,
            precision,
            produced,
            src_node: None,
            child_nodes: Vec::new(),
        }
    }
}

/// Capability set every tensor variant implements. Dispatch is infrequent
/// (once per tile-emission inner loop) and the variant set is closed, so a
/// tagged union carries it.
#[enum_dispatch]
pub trait TensorNode {
    fn meta(&self) -> &TensorMeta;
    fn meta_mut(&mut self) -> &mut TensorMeta;
    /// Physical address of one element, by logical row-major index.
    fn get_addr(&self, indexes: &[u32]) -> AddrType;
    /// Every element address, row-major over (head, row, col). Empty for PIM
    /// tensors, whose identity is the channel and row list.
    fn get_all_addrs(&self) -> Vec<AddrType>;
    /// Grows a KV tensor by one token, pulling fresh capacity from the pool
    /// when the layout stride is crossed.
    fn add_token(&mut self, kv: &mut KvCacheAllocator);
}

#[enum_dispatch(TensorNode)]
#[derive(Debug)]
pub enum Tensor {
    Npu(NpuTensor),
    Pim(PimTensor),
}

impl Tensor {
    pub fn id(&self) -> TensorId {
        self.meta().id
    }

    pub fn name(&self) -> &str {
        &self.meta().name
    }

    pub fn dims(&self) -> &[u32] {
        &self.meta().dims
    }

    pub fn produced(&self) -> bool {
        self.meta().produced
    }

    pub fn set_produced(&mut self) {
        self.meta_mut().produced = true;
    }

    pub fn src_node(&self) -> Option<OpId> {
        self.meta().src_node
    }

    pub fn child_nodes(&self) -> &[OpId] {
        &self.meta().child_nodes
    }

    pub fn as_pim(&self) -> &PimTensor {
        match self {
            Tensor::Pim(t) => t,
            Tensor::Npu(t) => panic!("tensor {} is not channel-bound", t.meta().name),
        }
    }

    pub fn as_npu(&self) -> &NpuTensor {
        match self {
            Tensor::Npu(t) => t,
            Tensor::Pim(t) => panic!("tensor {} is not NPU-resident", t.meta().name),
        }
    }
}

/// Central owner of every tensor node. Operations and programs refer to
/// tensors by id; the back-edges (`src_node`, `child_nodes`) are lookup
/// relations into this arena, never owning references.
#[derive(Debug, Default)]
pub struct TensorArena {
    tensors: FxHashMap<TensorId, Tensor>,
    next_id: TensorId,
}

impl TensorArena {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_id(&mut self) -> TensorId {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    pub fn insert(&mut self, tensor: Tensor) -> TensorId {
        let id = tensor.id();
        self.tensors.insert(id, tensor);
        id
    }

    /// Linear NPU tensor backed by the weight or activation region. A 3D
    /// shape [h, l, d] becomes h inner 2D shards of [l, d].
    pub fn create_npu(
        &mut self,
        name: String,
        dims: Vec<u32>,
        buf_type: NpuBufType,
        produced: bool,
        alloc: &mut AllocatorContext,
        config: &SimulationConfig,
    ) -> TensorId {
        let id = self.next_id();
        let meta = TensorMeta::new(id, name, dims, config.precision, produced);
        let tensor = NpuTensor::new(meta, buf_type, alloc);
        self.insert(Tensor::Npu(tensor))
    }

    /// NPU-layout KV tensor, sharded per head over pool entries.
    pub fn create_npu_kv(
        &mut self,
        name: String,
        dims: Vec<u32>,
        kv_type: KvType,
        produced: bool,
        alloc: &mut AllocatorContext,
        config: &SimulationConfig,
    ) -> TensorId {
        let id = self.next_id();
        let meta = TensorMeta::new(id, name, dims, config.precision, produced);
        let tensor = NpuTensor::new_kv(meta, kv_type, &mut alloc.kv);
        self.insert(Tensor::Npu(tensor))
    }

    /// Channel-bound PIM tensor carrying a DRAM row list.
    pub fn create_pim(
        &mut self,
        name: String,
        ch: u32,
        dims: Vec<u32>,
        kv_type: KvType,
        produced: bool,
        kv: &mut KvCacheAllocator,
        config: &SimulationConfig,
    ) -> TensorId {
        let id = self.next_id();
        let meta = TensorMeta::new(id, name, dims, config.precision, produced);
        let tensor = PimTensor::new(meta, ch, kv_type, kv, config);
        self.insert(Tensor::Pim(tensor))
    }

    pub fn get(&self, id: TensorId) -> &Tensor {
        self.tensors
            .get(&id)
            .unwrap_or_else(|| panic!("unknown tensor id {}", id))
    }

    pub fn get_mut(&mut self, id: TensorId) -> &mut Tensor {
        self.tensors
            .get_mut(&id)
            .unwrap_or_else(|| panic!("unknown tensor id {}", id))
    }

    pub fn add_child(&mut self, id: TensorId, op: OpId) {
        self.get_mut(id).meta_mut().child_nodes.push(op);
    }

    pub fn set_src_node(&mut self, id: TensorId, op: OpId) {
        self.get_mut(id).meta_mut().src_node = Some(op);
    }

    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&TensorId, &Tensor)> {
        self.tensors.iter()
    }
}
