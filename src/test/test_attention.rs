#[cfg(test)]
mod test {
    use crate::config::{DramType, RunMode, SimulationConfig};
    use crate::memory::address_map::AddressMap;
    use crate::memory::allocator::AllocatorContext;
    use crate::operator::{LowerCtx, OpKind, Opcode, Operation, PimAttend, PimLogitSoftmax};
    use crate::tensor::{KvType, NpuBufType, TensorArena, TensorId};

    struct Rig {
        config: SimulationConfig,
        addr_map: AddressMap,
        arena: TensorArena,
        alloc: AllocatorContext,
    }

    fn rig(config: SimulationConfig) -> Rig {
        let addr_map = AddressMap::new(&config);
        let mut alloc = AllocatorContext::new(&config);
        alloc.weight.allocate(1 << 20);
        alloc.init_runtime_regions(&config);
        Rig {
            config,
            addr_map,
            arena: TensorArena::new(),
            alloc,
        }
    }

    fn pim_config(spad_size: u32) -> SimulationConfig {
        SimulationConfig {
            run_mode: RunMode::NpuPim,
            spad_size,
            ..Default::default()
        }
    }

    /// Decode-shaped logits [h, 1, seq] living in the activation region.
    fn logits(rig: &mut Rig, seq_len: u32) -> TensorId {
        let h = rig.config.heads_per_rank();
        rig.arena.create_npu(
            "logit".into(),
            vec![h, 1, seq_len],
            NpuBufType::Act,
            true,
            &mut rig.alloc,
            &rig.config,
        )
    }

    fn value_cache(rig: &mut Rig, ch: u32, seq_len: u32) -> TensorId {
        let h = rig.config.heads_per_rank();
        let d_k = rig.config.d_k();
        rig.arena.create_pim(
            "value".into(),
            ch,
            vec![h, seq_len, d_k],
            KvType::Value,
            true,
            &mut rig.alloc.kv,
            &rig.config,
        )
    }

    fn key_cache(rig: &mut Rig, ch: u32, seq_len: u32) -> TensorId {
        let h = rig.config.heads_per_rank();
        let d_k = rig.config.d_k();
        rig.arena.create_pim(
            "key".into(),
            ch,
            vec![h, d_k, seq_len],
            KvType::Key,
            true,
            &mut rig.alloc.kv,
            &rig.config,
        )
    }

    fn lower_attend(rig: &mut Rig, inputs: Vec<TensorId>) -> Operation {
        let mut op = Operation::new(
            0,
            "attend".into(),
            OpKind::PimAttend(PimAttend::new()),
            &rig.config,
        );
        let mut ctx = LowerCtx {
            config: &rig.config,
            addr_map: &rig.addr_map,
            arena: &mut rig.arena,
            alloc: &mut rig.alloc,
        };
        op.lower(&mut ctx, inputs);
        op
    }

    fn opcode_count(op: &Operation, opcode: Opcode) -> usize {
        op.tiles()
            .iter()
            .flat_map(|t| &t.instructions)
            .filter(|i| i.opcode == opcode)
            .count()
    }

    #[test]
    fn two_requests_pack_into_one_tile_when_spad_allows() {
        // per request: (1024 + 2 * 128) * 8 = 10240 scratchpad words
        let mut rig = rig(pim_config(32));
        let l0 = logits(&mut rig, 1024);
        let l1 = logits(&mut rig, 1024);
        let v0 = value_cache(&mut rig, 0, 1024);
        let v1 = value_cache(&mut rig, 1, 1024);
        let op = lower_attend(&mut rig, vec![l0, l1, v0, v1]);
        assert_eq!(op.num_tiles(), 1);
    }

    #[test]
    fn two_requests_split_when_spad_halves() {
        let mut rig = rig(pim_config(16));
        let l0 = logits(&mut rig, 1024);
        let l1 = logits(&mut rig, 1024);
        let v0 = value_cache(&mut rig, 0, 1024);
        let v1 = value_cache(&mut rig, 1, 1024);
        let op = lower_attend(&mut rig, vec![l0, l1, v0, v1]);
        assert_eq!(op.num_tiles(), 2);
    }

    #[test]
    #[should_panic(expected = "alone needs")]
    fn oversized_single_request_fails_at_lowering() {
        let mut rig = rig(pim_config(16));
        let l = logits(&mut rig, 8192);
        let v = value_cache(&mut rig, 0, 8192);
        lower_attend(&mut rig, vec![l, v]);
    }

    #[test]
    #[should_panic(expected = "only decode is supported")]
    fn prefill_request_is_rejected() {
        let mut rig = rig(pim_config(64));
        let h = rig.config.heads_per_rank();
        let prefill_logits = rig.arena.create_npu(
            "logit".into(),
            vec![h, 64, 64],
            NpuBufType::Act,
            true,
            &mut rig.alloc,
            &rig.config,
        );
        let v = value_cache(&mut rig, 0, 64);
        lower_attend(&mut rig, vec![prefill_logits, v]);
    }

    #[test]
    fn newton_emits_discrete_comp_bursts() {
        let mut rig = rig(SimulationConfig {
            dram_type: DramType::Newton,
            ..pim_config(64)
        });
        // seq 512 is exactly one page: num_comps = 512 / 16 = 32
        let l = logits(&mut rig, 512);
        let v = value_cache(&mut rig, 0, 512);
        let op = lower_attend(&mut rig, vec![l, v]);

        // 8 heads x 1 chunk x 8 bank groups
        let groups = 8 * 8;
        assert_eq!(opcode_count(&op, Opcode::PimHeader), groups);
        assert_eq!(opcode_count(&op, Opcode::PimComp), groups * 32);
        assert_eq!(opcode_count(&op, Opcode::PimReadres), groups);
        assert_eq!(opcode_count(&op, Opcode::PimCompsReadres), 0);
    }

    #[test]
    fn neupims_fuses_the_comp_group() {
        let mut rig = rig(pim_config(64));
        let l = logits(&mut rig, 512);
        let v = value_cache(&mut rig, 0, 512);
        let op = lower_attend(&mut rig, vec![l, v]);

        let groups = 8 * 8;
        assert_eq!(opcode_count(&op, Opcode::PimCompsReadres), groups);
        assert_eq!(opcode_count(&op, Opcode::PimComp), 0);
        assert_eq!(opcode_count(&op, Opcode::PimReadres), 0);
    }

    #[test]
    fn single_chunk_skips_the_cross_chunk_add() {
        let mut rig = rig(pim_config(64));
        let l = logits(&mut rig, 512);
        let v = value_cache(&mut rig, 0, 512);
        let op = lower_attend(&mut rig, vec![l, v]);

        assert_eq!(opcode_count(&op, Opcode::Add), 0);
        // every bank group still drains
        assert_eq!(opcode_count(&op, Opcode::Movout), 8 * 8);
    }

    #[test]
    fn multi_chunk_accumulates_before_the_drain() {
        let mut rig = rig(pim_config(64));
        let l = logits(&mut rig, 1024);
        let v = value_cache(&mut rig, 0, 1024);
        let op = lower_attend(&mut rig, vec![l, v]);

        // chunks = 2: one ADD per head per bank group
        assert_eq!(opcode_count(&op, Opcode::Add), 8 * 8);
    }

    #[test]
    fn gwrite_precedes_any_comp_on_its_row() {
        let mut rig = rig(SimulationConfig {
            dram_type: DramType::Newton,
            ..pim_config(64)
        });
        let l = logits(&mut rig, 1024);
        let v = value_cache(&mut rig, 0, 1024);
        let op = lower_attend(&mut rig, vec![l, v]);

        for tile in op.tiles() {
            let first_gwrite = tile
                .instructions
                .iter()
                .position(|i| i.opcode == Opcode::PimGwrite);
            let first_comp = tile
                .instructions
                .iter()
                .position(|i| i.opcode == Opcode::PimComp);
            assert!(first_gwrite.unwrap() < first_comp.unwrap());
        }
    }

    #[test]
    fn residual_chunk_rounds_comps_to_a_power_of_two() {
        let mut rig = rig(pim_config(64));
        // 520 tokens: last chunk holds 8 residual tokens -> ceil(8/16) = 1 comp
        let l = logits(&mut rig, 520);
        let v = value_cache(&mut rig, 0, 520);
        let op = lower_attend(&mut rig, vec![l, v]);

        let headers: Vec<u32> = op
            .tiles()
            .iter()
            .flat_map(|t| &t.instructions)
            .filter(|i| i.opcode == Opcode::PimHeader)
            .map(|i| rig.addr_map.decode_pim_num_comps(i.src_addrs[0]))
            .collect();
        assert!(!headers.is_empty());
        for comps in headers {
            assert!(comps.is_power_of_two(), "num_comps {} not a power of two", comps);
        }
    }

    #[test]
    fn logit_softmax_normalizes_then_drains_each_head() {
        let mut rig = rig(pim_config(64));
        let h = rig.config.heads_per_rank();
        let d_k = rig.config.d_k();
        let q0 = rig.arena.create_npu(
            "query".into(),
            vec![h, 1, d_k],
            NpuBufType::Act,
            true,
            &mut rig.alloc,
            &rig.config,
        );
        let k0 = key_cache(&mut rig, 0, 48);

        let mut op = Operation::new(
            0,
            "logit_softmax".into(),
            OpKind::PimLogitSoftmax(PimLogitSoftmax::new()),
            &rig.config,
        );
        let mut ctx = LowerCtx {
            config: &rig.config,
            addr_map: &rig.addr_map,
            arena: &mut rig.arena,
            alloc: &mut rig.alloc,
        };
        let outputs = op.lower(&mut ctx, vec![q0, k0]);

        assert_eq!(outputs.len(), 1);
        assert_eq!(rig.arena.get(outputs[0]).dims(), &[h, 1, 48]);
        // one softmax and one drain per head, staged by per-chunk gwrites
        assert_eq!(opcode_count(&op, Opcode::Softmax), h as usize);
        assert_eq!(opcode_count(&op, Opcode::Movout), h as usize);
        // 48 tokens over 16 banks -> 3 chunks per head
        assert_eq!(opcode_count(&op, Opcode::PimGwrite), 3 * h as usize);
        // each chunk spans 2 key rows, summed before the softmax reads them
        assert_eq!(opcode_count(&op, Opcode::PimHeader), 3 * 2 * h as usize);
        assert_eq!(opcode_count(&op, Opcode::Add), 3 * h as usize);
    }
}
