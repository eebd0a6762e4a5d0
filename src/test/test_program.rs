#[cfg(test)]
mod test {
    use std::fs;

    use crate::config::{RunMode, SimulationConfig};
    use crate::memory::address_map::AddressMap;
    use crate::memory::allocator::AllocatorContext;
    use crate::model::ModelWeights;
    use crate::operator::LowerCtx;
    use crate::program::{Stage, StagePlatform, StageProgram};
    use crate::request::{generate_requests, BatchedRequest, SharedRequest};
    use crate::sim::Simulator;
    use crate::tensor::TensorArena;

    struct Rig {
        config: SimulationConfig,
        addr_map: AddressMap,
        arena: TensorArena,
        alloc: AllocatorContext,
        weights: ModelWeights,
    }

    fn rig(config: SimulationConfig) -> Rig {
        let addr_map = AddressMap::new(&config);
        let mut arena = TensorArena::new();
        let mut alloc = AllocatorContext::new(&config);
        let weights = ModelWeights::new(&mut arena, &mut alloc, &config);
        alloc.init_runtime_regions(&config);
        Rig {
            config,
            addr_map,
            arena,
            alloc,
            weights,
        }
    }

    fn admitted_requests(rig: &mut Rig) -> Vec<SharedRequest> {
        let reqs = generate_requests(&rig.config);
        for req in &reqs {
            let mut req = req.borrow_mut();
            req.init_cache(&mut rig.arena, &mut rig.alloc, &rig.config);
            req.is_initiated = true;
        }
        reqs
    }

    fn build(rig: &mut Rig, reqs: Vec<SharedRequest>, platform: StagePlatform, stage: Stage) -> StageProgram {
        let mut ctx = LowerCtx {
            config: &rig.config,
            addr_map: &rig.addr_map,
            arena: &mut rig.arena,
            alloc: &mut rig.alloc,
        };
        StageProgram::new(&rig.weights, BatchedRequest::new(reqs), platform, stage, &mut ctx)
    }

    fn pim_config() -> SimulationConfig {
        SimulationConfig {
            run_mode: RunMode::NpuPim,
            model_n_layer: 2,
            request_total_cnt: 2,
            request_input_seq_len: 64,
            request_output_seq_len: 2,
            ..Default::default()
        }
    }

    #[test]
    fn stage_a_builds_qkv_blocks_only() {
        let mut rig = rig(pim_config());
        let reqs = admitted_requests(&mut rig);
        let program = build(&mut rig, reqs, StagePlatform::Sa, Stage::A);
        // layernorm + qkv matmul per layer
        assert_eq!(program.num_operations(), 2 * 2);
    }

    #[test]
    fn stage_b_builds_projection_and_ffn() {
        let mut rig = rig(pim_config());
        let reqs = admitted_requests(&mut rig);
        let program = build(&mut rig, reqs, StagePlatform::Sa, Stage::B);
        // proj, residual add, ln, ff1, gelu, ff2, ffn residual per layer
        assert_eq!(program.num_operations(), 7 * 2);
    }

    #[test]
    fn kernel_fusion_collapses_the_pointwise_pairs() {
        let mut rig = rig(SimulationConfig {
            kernel_fusion: true,
            ..pim_config()
        });
        let reqs = admitted_requests(&mut rig);
        let program = build(&mut rig, reqs, StagePlatform::Sa, Stage::B);
        // the add+ln and bias+gelu pairs merge
        assert_eq!(program.num_operations(), 6 * 2);

        let optypes: Vec<&str> = (0..program.num_operations() as u32)
            .map(|id| program.operation(id).optype())
            .collect();
        assert!(optypes.contains(&"AddLayerNorm"));
        assert!(optypes.contains(&"BiasGelu"));
        assert!(!optypes.contains(&"Gelu"));
    }

    #[test]
    fn pim_program_grows_caches_and_pairs_the_stages() {
        let mut rig = rig(pim_config());
        let reqs = admitted_requests(&mut rig);
        let input_len = rig.config.request_input_seq_len;

        let (k, v) = {
            let req = reqs[0].borrow();
            (req.k_cache[0], req.v_cache[0])
        };
        let program = build(&mut rig, reqs.clone(), StagePlatform::Pim, Stage::A);

        // logit-softmax + attend per layer
        assert_eq!(program.num_operations(), 2 * 2);

        // the step's token landed in both caches
        let key = rig.arena.get(k).as_pim();
        let value = rig.arena.get(v).as_pim();
        assert_eq!(key.seq_len(), input_len + 1);
        assert_eq!(value.seq_len(), input_len + 1);
        assert_eq!(key.channel(), value.channel());
    }

    #[test]
    fn pim_stage_is_skipped_in_npu_only_mode() {
        let mut rig = rig(SimulationConfig {
            run_mode: RunMode::NpuOnly,
            spad_size: 512,
            ..pim_config()
        });
        let reqs = admitted_requests(&mut rig);
        let program = build(&mut rig, reqs, StagePlatform::Pim, Stage::A);
        assert_eq!(program.num_operations(), 0);
        assert!(program.check_finish());
    }

    fn temp_log_dir(tag: &str) -> String {
        let dir = std::env::temp_dir().join(format!("pimflow_test_{}", tag));
        fs::create_dir_all(&dir).unwrap();
        dir.display().to_string()
    }

    #[test]
    fn npu_pim_run_produces_cycles_and_artifacts() {
        let log_dir = temp_log_dir("npu_pim");
        let config = SimulationConfig {
            log_dir: log_dir.clone(),
            ..pim_config()
        };
        let mut sim = Simulator::new(config);
        sim.run();

        let stats = sim.stats();
        assert!(stats.total_cycles > 0);
        assert!(!stats.operations.is_empty());
        assert!(stats.dram_reads > 0);

        let log_path = sim.write_operation_log().unwrap();
        let log_text = fs::read_to_string(log_path).unwrap();
        assert!(log_text.lines().count() > 1);

        let dot = fs::read_to_string(format!("{}/graph.dot", log_dir)).unwrap();
        assert!(dot.starts_with("digraph"));
        assert!(dot.contains("qkv_gen"));
    }

    #[test]
    fn sub_batch_mode_interleaves_both_halves() {
        let config = SimulationConfig {
            sub_batch_mode: true,
            request_total_cnt: 4,
            log_dir: temp_log_dir("sub_batch"),
            ..pim_config()
        };
        let mut sim = Simulator::new(config);
        sim.run();

        let stats = sim.stats();
        assert!(stats.total_cycles > 0);
        // both sub-batches attended every layer
        assert!(stats
            .operations
            .iter()
            .filter(|s| s.optype == "PimAttend")
            .count()
            >= 4);
    }

    #[test]
    fn npu_only_run_uses_the_fused_attention_path() {
        let config = SimulationConfig {
            run_mode: RunMode::NpuOnly,
            spad_size: 512,
            log_dir: temp_log_dir("npu_only"),
            ..pim_config()
        };
        let mut sim = Simulator::new(config);
        sim.run();

        let stats = sim.stats();
        assert!(stats.total_cycles > 0);
        assert!(stats.operations.iter().any(|s| s.optype == "FusedMha"));
        assert!(stats.operations.iter().all(|s| !s.optype.starts_with("Pim")));
    }
}
