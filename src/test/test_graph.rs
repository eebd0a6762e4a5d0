#[cfg(test)]
mod test {
    use fxhash::FxHashSet;

    use crate::config::{RunMode, SimulationConfig};
    use crate::memory::address_map::AddressMap;
    use crate::memory::allocator::AllocatorContext;
    use crate::model::ModelWeights;
    use crate::operator::{LowerCtx, OpKind, Pointwise, PointwiseKind, Tile};
    use crate::program::{Stage, StagePlatform, StageProgram};
    use crate::request::BatchedRequest;
    use crate::tensor::{NpuBufType, TensorArena, TensorId};

    struct Rig {
        config: SimulationConfig,
        addr_map: AddressMap,
        arena: TensorArena,
        alloc: AllocatorContext,
        weights: ModelWeights,
    }

    fn rig() -> Rig {
        let config = SimulationConfig {
            run_mode: RunMode::NpuOnly,
            model_n_layer: 1,
            // room for a whole decode request in the fused attention path
            spad_size: 512,
            ..Default::default()
        };
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

    fn empty_program(rig: &mut Rig) -> StageProgram {
        let mut ctx = LowerCtx {
            config: &rig.config,
            addr_map: &rig.addr_map,
            arena: &mut rig.arena,
            alloc: &mut rig.alloc,
        };
        StageProgram::new(
            &rig.weights,
            BatchedRequest::new(Vec::new()),
            StagePlatform::Sa,
            Stage::A,
            &mut ctx,
        )
    }

    fn source_tensor(rig: &mut Rig) -> TensorId {
        rig.arena.create_npu(
            "input".into(),
            vec![4, 64],
            NpuBufType::Act,
            true,
            &mut rig.alloc,
            &rig.config,
        )
    }

    /// Builds the chain input -> A -> B -> C of pointwise ops.
    fn chain(rig: &mut Rig, program: &mut StageProgram) -> Vec<u32> {
        let x = source_tensor(rig);
        let mut ctx = LowerCtx {
            config: &rig.config,
            addr_map: &rig.addr_map,
            arena: &mut rig.arena,
            alloc: &mut rig.alloc,
        };
        let a = program.add_op(
            OpKind::Pointwise(Pointwise::new(PointwiseKind::LayerNorm)),
            "a".into(),
            vec![x],
            &mut ctx,
        )[0];
        let b = program.add_op(
            OpKind::Pointwise(Pointwise::new(PointwiseKind::Gelu)),
            "b".into(),
            vec![a],
            &mut ctx,
        )[0];
        program.add_op(
            OpKind::Pointwise(Pointwise::new(PointwiseKind::Softmax)),
            "c".into(),
            vec![b],
            &mut ctx,
        );
        (0..3).collect()
    }

    fn finish_all_tiles(rig: &mut Rig, program: &mut StageProgram, op_id: u32) {
        let tiles = program.take_tiles(op_id);
        for tile in &tiles {
            program.finish_operation_tile(&mut rig.arena, tile, 1);
        }
    }

    #[test]
    fn readiness_advances_one_link_at_a_time() {
        let mut rig = rig();
        let mut program = empty_program(&mut rig);
        let ids = chain(&mut rig, &mut program);

        // only the head of the chain is ready
        assert_eq!(program.get_executable_operations(), &[ids[0]]);

        finish_all_tiles(&mut rig, &mut program, ids[0]);
        assert_eq!(program.get_executable_operations(), &[ids[1]]);

        finish_all_tiles(&mut rig, &mut program, ids[1]);
        assert_eq!(program.get_executable_operations(), &[ids[2]]);

        finish_all_tiles(&mut rig, &mut program, ids[2]);
        assert!(program.check_finish());
    }

    #[test]
    fn finished_outputs_are_produced_and_inputs_were_ready() {
        let mut rig = rig();
        let mut program = empty_program(&mut rig);
        let ids = chain(&mut rig, &mut program);

        for &id in &ids {
            // every executable operation has produced inputs
            for &ready in program.get_executable_operations() {
                let op = program.operation(ready);
                for &input in &op.common.inputs {
                    assert!(rig.arena.get(input).produced());
                }
            }
            finish_all_tiles(&mut rig, &mut program, id);
            for &out in &program.operation(id).common.outputs {
                assert!(rig.arena.get(out).produced());
            }
        }
    }

    #[test]
    fn no_operation_becomes_executable_twice() {
        let mut rig = rig();
        let mut program = empty_program(&mut rig);
        chain(&mut rig, &mut program);

        let mut seen = FxHashSet::default();
        while let Some(op_id) = program.pop_executable() {
            assert!(seen.insert(op_id), "operation {} scheduled twice", op_id);
            finish_all_tiles(&mut rig, &mut program, op_id);
        }
        assert!(program.check_finish());
        assert_eq!(seen.len(), program.num_operations());
    }

    #[test]
    fn full_block_topological_walk_visits_every_op_once() {
        let mut rig = rig();
        let reqs = crate::request::generate_requests(&rig.config);
        for req in &reqs {
            let mut req = req.borrow_mut();
            req.init_cache(&mut rig.arena, &mut rig.alloc, &rig.config);
            req.is_initiated = true;
        }
        let mut ctx = LowerCtx {
            config: &rig.config,
            addr_map: &rig.addr_map,
            arena: &mut rig.arena,
            alloc: &mut rig.alloc,
        };
        let mut program = StageProgram::new(
            &rig.weights,
            BatchedRequest::new(reqs),
            StagePlatform::Sa,
            Stage::A,
            &mut ctx,
        );

        let mut visited = FxHashSet::default();
        while let Some(op_id) = program.pop_executable() {
            assert!(visited.insert(op_id));
            finish_all_tiles(&mut rig, &mut program, op_id);
        }
        // acyclic by construction: the walk exhausts the whole program
        assert!(program.check_finish());
        assert_eq!(visited.len(), program.num_operations());
    }

    #[test]
    #[should_panic(expected = "unknown operation id")]
    fn tile_completion_for_unknown_operation_is_fatal() {
        let mut rig = rig();
        let mut program = empty_program(&mut rig);
        chain(&mut rig, &mut program);

        let stray = Tile {
            operation_id: 999,
            ..Default::default()
        };
        program.finish_operation_tile(&mut rig.arena, &stray, 1);
    }
}
