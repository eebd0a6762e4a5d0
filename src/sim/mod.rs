pub mod cost;

use std::path::{Path, PathBuf};

use log::{info, warn};

use crate::config::{CycleType, RunMode, SimulationConfig};
use crate::memory::address_map::AddressMap;
use crate::memory::allocator::AllocatorContext;
use crate::model::ModelWeights;
use crate::operator::{LowerCtx, TileStatus};
use crate::program::{OperationStat, Stage, StagePlatform, StageProgram};
use crate::request::{generate_requests, BatchedRequest, SharedRequest};
use crate::tensor::TensorArena;

/// End-of-run aggregates: wall clock per stage program and the DRAM traffic
/// the instruction streams generated.
#[derive(Debug, Default)]
pub struct SimStats {
    pub total_cycles: CycleType,
    pub stage_cycles: Vec<(String, CycleType)>,
    pub dram_reads: u64,
    pub dram_writes: u64,
    pub operations: Vec<OperationStat>,
}

/// The in-order dispatch driver. Owns the arena, the allocators and the
/// request stream; per decode step it builds the stage programs, drains
/// their ready sets, and aggregates cycle counts. Platforms within a stage
/// overlap, so a stage costs the slower of the two.
pub struct Simulator {
    config: SimulationConfig,
    addr_map: AddressMap,
    arena: TensorArena,
    alloc: AllocatorContext,
    weights: ModelWeights,
    requests: Vec<SharedRequest>,
    stats: SimStats,
    dot_dumped: bool,
}

impl Simulator {
    pub fn new(config: SimulationConfig) -> Self {
        let addr_map = AddressMap::new(&config);
        let mut arena = TensorArena::new();
        let mut alloc = AllocatorContext::new(&config);

        // weights first; the activation and KV regions stack above them
        let weights = ModelWeights::new(&mut arena, &mut alloc, &config);
        alloc.init_runtime_regions(&config);

        let requests = generate_requests(&config);
        Self {
            config,
            addr_map,
            arena,
            alloc,
            weights,
            requests,
            stats: SimStats::default(),
            dot_dumped: false,
        }
    }

    /// Admits requests as they arrive (prefill modeled as already complete,
    /// caches sized to the prompt), then decodes until all requests retire.
    pub fn run(&mut self) {
        let mut pending: Vec<SharedRequest> = self.requests.clone();
        let mut live: Vec<SharedRequest> = Vec::new();
        let mut step = 0u32;

        while !live.is_empty() || !pending.is_empty() {
            // arrivals are spaced request_interval steps apart
            while let Some(first) = pending.first() {
                let arrival = first.borrow().id * self.config.request_interval;
                if arrival > step {
                    break;
                }
                let req = pending.remove(0);
                {
                    let mut req = req.borrow_mut();
                    req.init_cache(&mut self.arena, &mut self.alloc, &self.config);
                    req.is_initiated = true;
                }
                live.push(req);
            }
            if live.is_empty() {
                step += 1;
                continue;
            }

            self.run_step(step, &live);

            for req in &live {
                req.borrow_mut().generated += 1;
            }
            live.retain(|req| {
                let done = req.borrow().done();
                if done {
                    let mut req = req.borrow_mut();
                    info!("req{}: completed after {} tokens", req.id, req.generated);
                    req.release_cache(&mut self.arena, &mut self.alloc);
                }
                !done
            });

            // activations are an arena per step
            self.alloc.activation.flush();
            step += 1;
        }

        info!(
            "simulation finished: {} steps, {} cycles, {} B read, {} B written",
            step, self.stats.total_cycles, self.stats.dram_reads, self.stats.dram_writes
        );
    }

    fn run_step(&mut self, step: u32, live: &[SharedRequest]) {
        let (front, back) = self.split_sub_batches(live);

        match self.config.run_mode {
            RunMode::NpuOnly => {
                let batch = BatchedRequest::new(live.to_vec());
                self.run_stage(step, batch, None, Stage::A);
            }
            RunMode::NpuPim => {
                if let Some(back) = back {
                    // QKV of one sub-batch overlaps the other's attention
                    self.run_stage(step, front.clone(), Some(back.clone()), Stage::A);
                    self.run_stage(step, back.clone(), Some(front.clone()), Stage::A);
                    self.run_stage(step, front, None, Stage::B);
                    self.run_stage(step, back, None, Stage::B);
                } else {
                    self.run_stage(step, front.clone(), Some(front.clone()), Stage::A);
                    self.run_stage(step, front, None, Stage::B);
                }
            }
        }
    }

    /// Runs one SA stage program, optionally overlapped with the PIM
    /// attention program of the companion sub-batch.
    fn run_stage(
        &mut self,
        step: u32,
        sa_batch: BatchedRequest,
        pim_batch: Option<BatchedRequest>,
        stage: Stage,
    ) {
        let sa_cycles = {
            let mut program = self.build_program(sa_batch, StagePlatform::Sa, stage);
            self.maybe_dump_dot(&program);
            let cycles = self.run_program(&mut program);
            self.collect(&program);
            cycles
        };

        let pim_cycles = match pim_batch {
            Some(batch) if !batch.is_empty() => {
                let mut program = self.build_program(batch, StagePlatform::Pim, stage);
                let cycles = self.run_program(&mut program);
                self.collect(&program);
                cycles
            }
            _ => 0,
        };

        let stage_cycles = sa_cycles.max(pim_cycles);
        self.stats.total_cycles += stage_cycles;
        self.stats
            .stage_cycles
            .push((format!("step{}_stage_{}", step, stage), stage_cycles));
    }

    fn build_program(
        &mut self,
        batch: BatchedRequest,
        platform: StagePlatform,
        stage: Stage,
    ) -> StageProgram {
        let mut ctx = LowerCtx {
            config: &self.config,
            addr_map: &self.addr_map,
            arena: &mut self.arena,
            alloc: &mut self.alloc,
        };
        StageProgram::new(&self.weights, batch, platform, stage, &mut ctx)
    }

    /// Drains the ready set in order; a popped operation's tiles run back to
    /// back on their resource.
    fn run_program(&mut self, program: &mut StageProgram) -> CycleType {
        let mut cycles = 0;
        while let Some(op_id) = program.pop_executable() {
            let mut tiles = program.take_tiles(op_id);
            for tile in tiles.iter_mut() {
                tile.status = TileStatus::Running;
                let t = cost::tile_cycles(tile, &self.config, &self.addr_map);
                tile.status = TileStatus::Finished;
                cycles += t;
                program.finish_operation_tile(&mut self.arena, tile, t);
            }
        }
        assert!(
            program.check_finish(),
            "{}: stalled with unfinished operations",
            program.name()
        );
        cycles
    }

    fn collect(&mut self, program: &StageProgram) {
        for stat in program.list_operation_stat() {
            self.stats.dram_reads += stat.dram_reads;
            self.stats.dram_writes += stat.dram_writes;
            self.stats.operations.push(stat);
        }
    }

    /// Splits the live set into the two interleaved sub-batches, or keeps a
    /// single batch when interleaving is off or pointless.
    fn split_sub_batches(
        &self,
        live: &[SharedRequest],
    ) -> (BatchedRequest, Option<BatchedRequest>) {
        if self.config.sub_batch_mode && self.config.run_mode == RunMode::NpuPim && live.len() >= 2
        {
            let mid = live.len() / 2;
            (
                BatchedRequest::new(live[..mid].to_vec()),
                Some(BatchedRequest::new(live[mid..].to_vec())),
            )
        } else {
            (BatchedRequest::new(live.to_vec()), None)
        }
    }

    fn maybe_dump_dot(&mut self, program: &StageProgram) {
        if self.dot_dumped {
            return;
        }
        let path = Path::new(&self.config.log_dir).join("graph.dot");
        match program.dump_dot(&self.arena, &path) {
            Ok(()) => info!("operation graph written to {}", path.display()),
            Err(e) => warn!("failed to write {}: {}", path.display(), e),
        }
        self.dot_dumped = true;
    }

    pub fn stats(&self) -> &SimStats {
        &self.stats
    }

    /// One CSV row per finished operation, in completion order.
    pub fn write_operation_log(&self) -> Result<PathBuf, csv::Error> {
        let path = if self.config.operation_log_output_path.is_empty() {
            Path::new(&self.config.log_dir).join("operation_log.csv")
        } else {
            PathBuf::from(&self.config.operation_log_output_path)
        };
        let mut writer = csv::Writer::from_path(&path)?;
        for stat in &self.stats.operations {
            writer.serialize(stat)?;
        }
        writer.flush()?;
        Ok(path)
    }

    pub fn log_summary(&self) {
        for (name, cycles) in &self.stats.stage_cycles {
            info!("{}: {} cycles", name, cycles);
        }
        info!(
            "total {} cycles, DRAM {} B read / {} B written over {} operations",
            self.stats.total_cycles,
            self.stats.dram_reads,
            self.stats.dram_writes,
            self.stats.operations.len()
        );
    }
}
