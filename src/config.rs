use std::fs;
use std::path::Path;

use serde::Deserialize;
use thiserror::Error;

pub type CycleType = u64;
pub type AddrType = u64;

/// Core type: systolic array, output-stationary or weight-stationary dataflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum CoreType {
    #[serde(rename = "systolic_os")]
    SystolicOs,
    #[serde(rename = "systolic_ws")]
    SystolicWs,
}

/// DRAM flavor. NEWTON issues discrete COMP commands; NEUPIMS fuses the
/// COMP burst and the result read into one command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum DramType {
    #[serde(rename = "DRAM")]
    Dram,
    #[serde(rename = "NEWTON")]
    Newton,
    #[serde(rename = "NEUPIMS")]
    Neupims,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum IcntType {
    #[serde(rename = "simple")]
    Simple,
    #[serde(rename = "booksim2")]
    Booksim2,
}

/// NPU_ONLY keeps the KV cache in the linear NPU layout; NPU_PIM stripes it
/// across DRAM channels and offloads attention onto the PIM banks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum RunMode {
    #[serde(rename = "NPU_ONLY")]
    NpuOnly,
    #[serde(rename = "NPU_PIM")]
    NpuPim,
}

/// Every knob the simulator reads, assembled from the layered JSON config
/// files. Unspecified fields keep their defaults so partial overlays work.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
#[allow(non_snake_case)]
pub struct SimulationConfig {
    /* model */
    pub model_name: String,
    pub model_block_size: u32,
    pub model_vocab_size: u32,
    pub model_n_layer: u32,
    pub model_n_head: u32,
    pub model_n_embd: u32,

    /* execution mode */
    pub run_mode: RunMode,
    pub sub_batch_mode: bool,
    pub ch_load_balancing: bool,
    pub kernel_fusion: bool,
    pub max_batch_size: u32,
    /// max size of (ready queue + running queue) in the scheduler
    pub max_active_reqs: u32,
    pub max_seq_len: u32,
    pub HBM_size: u64,
    pub HBM_act_buf_size: u64,

    /* NPU core */
    pub num_cores: u32,
    pub core_type: CoreType,
    pub core_freq: u32,
    pub core_width: u32,
    pub core_height: u32,
    pub n_tp: u32,

    /* vector unit */
    pub vector_core_count: u32,
    pub vector_core_width: u32,
    pub layernorm_latency: CycleType,
    pub softmax_latency: CycleType,
    pub add_latency: CycleType,
    pub mul_latency: CycleType,
    pub exp_latency: CycleType,
    pub gelu_latency: CycleType,
    pub add_tree_latency: CycleType,
    pub scalar_sqrt_latency: CycleType,
    pub scalar_add_latency: CycleType,
    pub scalar_mul_latency: CycleType,

    /* on-chip SRAM (sizes in KB) */
    pub sram_width: u32,
    pub sram_size: u32,
    pub spad_size: u32,
    pub accum_spad_size: u32,

    /* DRAM */
    pub dram_type: DramType,
    pub dram_freq: u32,
    pub dram_channels: u32,
    pub dram_req_size: u32,

    /* PIM */
    pub pim_config_path: String,
    /// DRAM row buffer size in bytes
    pub dram_page_size: u32,
    pub dram_banks_per_ch: u32,
    /// params covered by one PIM_COMP command
    pub pim_comp_coverage: u32,

    /* logging */
    pub operation_log_output_path: String,
    pub log_dir: String,

    /* client workload */
    pub request_input_seq_len: u32,
    pub request_interval: u32,
    pub request_total_cnt: u32,
    pub request_output_seq_len: u32,
    pub request_dataset_path: String,

    /* interconnect */
    pub icnt_type: IcntType,
    pub icnt_config_path: String,
    pub icnt_freq: u32,
    pub icnt_latency: u32,

    /* scheduler */
    pub scheduler_type: String,

    /* misc */
    pub precision: u32,
    pub layout: String,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            model_name: "gpt2".to_string(),
            model_block_size: 1024,
            model_vocab_size: 50257,
            model_n_layer: 2,
            model_n_head: 8,
            model_n_embd: 1024,
            run_mode: RunMode::NpuPim,
            sub_batch_mode: false,
            ch_load_balancing: false,
            kernel_fusion: false,
            max_batch_size: 32,
            max_active_reqs: 64,
            max_seq_len: 2048,
            HBM_size: 1 << 34,
            HBM_act_buf_size: 1 << 26,
            num_cores: 1,
            core_type: CoreType::SystolicOs,
            core_freq: 1000,
            core_width: 128,
            core_height: 128,
            n_tp: 1,
            vector_core_count: 1,
            vector_core_width: 128,
            layernorm_latency: 8,
            softmax_latency: 8,
            add_latency: 1,
            mul_latency: 1,
            exp_latency: 2,
            gelu_latency: 2,
            add_tree_latency: 2,
            scalar_sqrt_latency: 2,
            scalar_add_latency: 1,
            scalar_mul_latency: 1,
            sram_width: 32,
            sram_size: 128,
            spad_size: 64,
            accum_spad_size: 64,
            dram_type: DramType::Neupims,
            dram_freq: 1000,
            dram_channels: 32,
            dram_req_size: 64,
            pim_config_path: String::new(),
            dram_page_size: 1024,
            dram_banks_per_ch: 16,
            pim_comp_coverage: 16,
            operation_log_output_path: String::new(),
            log_dir: ".".to_string(),
            request_input_seq_len: 128,
            request_interval: 0,
            request_total_cnt: 4,
            request_output_seq_len: 4,
            request_dataset_path: String::new(),
            icnt_type: IcntType::Simple,
            icnt_config_path: String::new(),
            icnt_freq: 1000,
            icnt_latency: 4,
            scheduler_type: "simple".to_string(),
            precision: 2,
            layout: String::new(),
        }
    }
}

impl SimulationConfig {
    /// Heads owned by one tensor-parallel rank.
    pub fn heads_per_rank(&self) -> u32 {
        self.model_n_head / self.n_tp
    }

    /// Per-head hidden dimension.
    pub fn d_k(&self) -> u32 {
        self.model_n_embd / self.model_n_head
    }

    /// Embedding width owned by one tensor-parallel rank.
    pub fn embd_per_rank(&self) -> u32 {
        self.heads_per_rank() * self.d_k()
    }

    /// DRAM row capacity in elements.
    pub fn elems_per_dram_row(&self) -> u32 {
        self.dram_page_size / self.precision
    }

    /// Round an address down to the DRAM request granularity.
    pub fn align_address(&self, addr: AddrType) -> AddrType {
        addr - (addr % self.dram_req_size as AddrType)
    }

    /// Rejects geometry the address map and allocators cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let pow2 = |v: u32| v != 0 && v & (v - 1) == 0;
        if !pow2(self.dram_channels) {
            return Err(ConfigError::invalid(
                "dram_channels",
                format!("{} is not a power of two", self.dram_channels),
            ));
        }
        if !pow2(self.dram_banks_per_ch) {
            return Err(ConfigError::invalid(
                "dram_banks_per_ch",
                format!("{} is not a power of two", self.dram_banks_per_ch),
            ));
        }
        if !pow2(self.dram_req_size) {
            return Err(ConfigError::invalid(
                "dram_req_size",
                format!("{} is not a power of two", self.dram_req_size),
            ));
        }
        if self.precision == 0 {
            return Err(ConfigError::invalid("precision", "must be nonzero".into()));
        }
        if self.n_tp == 0 || self.model_n_head % self.n_tp != 0 {
            return Err(ConfigError::invalid(
                "n_tp",
                format!("n_head {} not divisible by n_tp {}", self.model_n_head, self.n_tp),
            ));
        }
        if self.model_n_head == 0 || self.model_n_embd % self.model_n_head != 0 {
            return Err(ConfigError::invalid(
                "model_n_head",
                format!(
                    "n_embd {} not divisible by n_head {}",
                    self.model_n_embd, self.model_n_head
                ),
            ));
        }
        if self.dram_page_size % self.precision != 0 {
            return Err(ConfigError::invalid(
                "dram_page_size",
                format!(
                    "{} not divisible by precision {}",
                    self.dram_page_size, self.precision
                ),
            ));
        }
        if self.scheduler_type != "simple" {
            return Err(ConfigError::invalid(
                "scheduler_type",
                format!("unknown scheduler '{}'", self.scheduler_type),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("invalid config field `{field}`: {reason}")]
    InvalidField { field: &'static str, reason: String },
}

impl ConfigError {
    fn invalid(field: &'static str, reason: String) -> Self {
        ConfigError::InvalidField { field, reason }
    }
}

fn read_json(path: &Path) -> Result<serde_json::Value, ConfigError> {
    let text = fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.display().to_string(),
        source,
    })?;
    serde_json::from_str(&text).map_err(|source| ConfigError::Parse {
        path: path.display().to_string(),
        source,
    })
}

/// Loads the base hardware config and merges the optional overlay files
/// (memory, model, client, system) over it, last writer wins per field.
pub fn load_config(base: &Path, overlays: &[&Path]) -> Result<SimulationConfig, ConfigError> {
    let mut merged = read_json(base)?;
    for overlay in overlays {
        let value = read_json(overlay)?;
        merge_objects(&mut merged, value);
    }
    let config: SimulationConfig =
        serde_json::from_value(merged).map_err(|source| ConfigError::Parse {
            path: base.display().to_string(),
            source,
        })?;
    config.validate()?;
    Ok(config)
}

fn merge_objects(dst: &mut serde_json::Value, src: serde_json::Value) {
    match (dst, src) {
        (serde_json::Value::Object(dst_map), serde_json::Value::Object(src_map)) => {
            for (k, v) in src_map {
                dst_map.insert(k, v);
            }
        }
        (dst_slot, src_val) => *dst_slot = src_val,
    }
}
