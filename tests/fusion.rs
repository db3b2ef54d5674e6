//! Fusion properties over the public API: instruction preservation,
//! dependency ordering, idempotence, serial counts, and temp disjointness.

use rustc_hash::FxHashSet;
use veld::base::BaseHandle;
use veld::block::{Block, LoopBlock};
use veld::dtype::{ConstVal, DType};
use veld::fuser::{fuser_greedy, fuser_serial, fuser_singleton, remove_system_only_blocks};
use veld::instruction::{Instruction, Opcode};
use veld::view::{Operand, View};

fn add_const(out: &BaseHandle, input: &BaseHandle, shape: &[i64]) -> Instruction {
    Instruction::binary(
        Opcode::Add,
        View::contiguous(out, shape),
        Operand::View(View::contiguous(input, shape)),
        Operand::Const(ConstVal::Float64(1.0)),
    )
}

/// A small pipeline: d = ((a + 1) + 1) + 1 with the intermediates freed.
fn chain_batch() -> (Vec<Instruction>, Vec<BaseHandle>) {
    let bases: Vec<BaseHandle> = (0..4).map(|_| BaseHandle::new(DType::Float64, 16)).collect();
    let mut batch = Vec::new();
    for w in bases.windows(2) {
        let mut instr = add_const(&w[1], &w[0], &[16]);
        instr.constructor = true;
        batch.push(instr);
    }
    batch.push(Instruction::free(View::contiguous(&bases[1], &[16])));
    batch.push(Instruction::free(View::contiguous(&bases[2], &[16])));
    (batch, bases)
}

fn opcode_multiset(blocks: &[Block]) -> Vec<&'static str> {
    let mut names: Vec<&'static str> = blocks
        .iter()
        .flat_map(|b| b.all_instrs())
        .map(|i| i.opcode.name())
        .collect();
    names.sort();
    names
}

#[test]
fn fusion_preserves_instruction_multiset() {
    let (batch, _bases) = chain_batch();
    let mut before = batch.iter().map(|i| i.opcode.name()).collect::<Vec<_>>();
    before.sort();

    let mut blocks = fuser_singleton(batch);
    fuser_greedy(&mut blocks);
    assert_eq!(opcode_multiset(&blocks), before);
}

#[test]
fn greedy_fuses_chain_into_one_kernel_with_temps() {
    let (batch, bases) = chain_batch();
    let mut blocks = fuser_singleton(batch);
    fuser_greedy(&mut blocks);
    assert_eq!(blocks.len(), 1);

    let kernel: &LoopBlock = blocks[0].as_loop().unwrap();
    assert!(kernel.temps.contains(&bases[1]));
    assert!(kernel.temps.contains(&bases[2]));
    assert!(!kernel.temps.contains(&bases[3]));
}

#[test]
fn fusion_is_idempotent() {
    let (batch, _bases) = chain_batch();
    let mut blocks = fuser_singleton(batch);
    fuser_greedy(&mut blocks);
    let once: Vec<String> = blocks.iter().map(|b| b.pprint()).collect();
    fuser_greedy(&mut blocks);
    let twice: Vec<String> = blocks.iter().map(|b| b.pprint()).collect();
    assert_eq!(once, twice);
}

#[test]
fn serial_fusion_yields_one_kernel_per_compute_instruction() {
    let (batch, _bases) = chain_batch();
    let computes = batch.iter().filter(|i| !i.opcode.is_system()).count();

    let mut serial = fuser_singleton(batch.clone());
    fuser_serial(&mut serial);
    let serial_kernels = serial.iter().filter(|b| !b.is_system_only()).count();
    assert_eq!(serial_kernels, computes);

    let mut greedy = fuser_singleton(batch);
    fuser_greedy(&mut greedy);
    remove_system_only_blocks(&mut greedy);
    assert!(greedy.len() <= serial_kernels);
}

#[test]
fn dependent_instructions_stay_ordered() {
    let (batch, bases) = chain_batch();
    let mut blocks = fuser_singleton(batch);
    fuser_greedy(&mut blocks);

    // Inside the fused kernel, the writer of each base precedes its reader.
    let instrs = blocks[0].all_instrs();
    let write_pos = |b: &BaseHandle| {
        instrs
            .iter()
            .position(|i| !i.opcode.is_system() && i.out_view().map(|v| &v.base) == Some(b))
    };
    let read_pos = |b: &BaseHandle| {
        instrs
            .iter()
            .position(|i| i.views().skip(1).any(|v| v.base == *b))
    };
    for base in &bases[1..3] {
        assert!(write_pos(base).unwrap() < read_pos(base).unwrap());
    }
}

#[test]
fn temps_never_appear_in_sibling_kernels() {
    // Two independent pipelines that cannot fuse (different sizes): each
    // temp must be born and killed within exactly one kernel.
    let a1 = BaseHandle::new(DType::Float64, 16);
    let b1 = BaseHandle::new(DType::Float64, 16);
    let c1 = BaseHandle::new(DType::Float64, 16);
    let m = BaseHandle::new(DType::Float64, 15);
    let r = BaseHandle::new(DType::Float64, 3);

    let mut i1 = add_const(&b1, &a1, &[16]);
    i1.constructor = true;
    let mut i2 = add_const(&c1, &b1, &[16]);
    i2.constructor = true;
    let batch = vec![
        i1,
        i2,
        Instruction::free(View::contiguous(&b1, &[16])),
        Instruction::sweep(
            Opcode::AddReduce,
            View::contiguous(&r, &[3]),
            View::contiguous(&m, &[3, 5]),
            1,
        ),
    ];

    let mut blocks = fuser_singleton(batch);
    fuser_greedy(&mut blocks);

    let mut seen: FxHashSet<BaseHandle> = FxHashSet::default();
    for block in &blocks {
        let kernel = block.as_loop().unwrap();
        for temp in kernel.all_temps() {
            assert!(seen.insert(temp), "temp shared between kernels");
        }
        // temps = news ∩ frees at every node.
        let expect: FxHashSet<BaseHandle> = kernel
            .news
            .intersection(&kernel.frees)
            .cloned()
            .collect();
        assert_eq!(kernel.temps, expect);
    }
}

#[test]
fn system_only_kernels_are_pruned_and_report_frees() {
    let a = BaseHandle::new(DType::Float64, 16);
    let m = BaseHandle::new(DType::Float64, 15);
    let r = BaseHandle::new(DType::Float64, 3);
    // The free cannot merge into the reduction block (sizes differ), so it
    // ends up in a system-only block that pruning must report.
    let batch = vec![
        Instruction::sweep(
            Opcode::AddReduce,
            View::contiguous(&r, &[3]),
            View::contiguous(&m, &[3, 5]),
            1,
        ),
        Instruction::free(View::contiguous(&a, &[16])),
    ];
    let mut blocks = fuser_singleton(batch);
    fuser_greedy(&mut blocks);
    let freed = remove_system_only_blocks(&mut blocks);
    assert_eq!(blocks.len(), 1);
    assert!(freed.contains(&a));
}

#[test]
fn reshapable_streams_collapse_to_flat_blocks() {
    let a = BaseHandle::new(DType::Float32, 128);
    let b = BaseHandle::new(DType::Float32, 128);
    let c = BaseHandle::new(DType::Float32, 128);
    let batch = vec![
        Instruction::binary(
            Opcode::Add,
            View::contiguous(&b, &[8, 16]),
            Operand::View(View::contiguous(&a, &[8, 16])),
            Operand::Const(ConstVal::Float32(1.0)),
        ),
        Instruction::binary(
            Opcode::Multiply,
            View::contiguous(&c, &[8, 16]),
            Operand::View(View::contiguous(&b, &[8, 16])),
            Operand::Const(ConstVal::Float32(2.0)),
        ),
    ];
    let mut blocks = fuser_singleton(batch);
    fuser_greedy(&mut blocks);
    assert_eq!(blocks.len(), 1);
    let kernel = blocks[0].as_loop().unwrap();
    assert!(kernel.reshapable);
    assert_eq!(kernel.size, 128);
    assert!(kernel.is_innermost());
}
