//! Source-level checks on fully fused kernels: the pipeline from a raw
//! batch through fusion to C text.

use veld::basedb::BaseDb;
use veld::codegen::write_kernel;
use veld::config::EngineConfig;
use veld::dtype::{ConstVal, DType};
use veld::fuser::{fuser_greedy, fuser_singleton};
use veld::instruction::{Instruction, Opcode};
use veld::kernel::Kernel;
use veld::prelude::*;

/// Fuses a batch and renders every kernel.
fn generate(batch: Vec<Instruction>, config: &EngineConfig) -> Vec<String> {
    let mut blocks = fuser_singleton(batch);
    fuser_greedy(&mut blocks);
    blocks
        .iter()
        .map(|block| {
            let kernel = Kernel::new(block.as_loop().unwrap().clone());
            let mut base_ids = BaseDb::new();
            for instr in kernel.all_instrs() {
                for view in instr.views() {
                    base_ids.insert(&view.base);
                }
            }
            base_ids.insert_tmp(kernel.temps().iter().cloned());
            write_kernel(&kernel, &mut base_ids, config).unwrap()
        })
        .collect()
}

#[test]
fn fused_elementwise_chain_contracts_the_temp() {
    let a = BaseHandle::new(DType::Float32, 8);
    let b = BaseHandle::new(DType::Float32, 8);
    let c = BaseHandle::new(DType::Float32, 8);
    let mut i1 = Instruction::binary(
        Opcode::Add,
        View::contiguous(&b, &[8]),
        Operand::View(View::contiguous(&a, &[8])),
        Operand::Const(ConstVal::Float32(1.0)),
    );
    i1.constructor = true;
    let mut i2 = Instruction::binary(
        Opcode::Multiply,
        View::contiguous(&c, &[8]),
        Operand::View(View::contiguous(&b, &[8])),
        Operand::Const(ConstVal::Float32(2.0)),
    );
    i2.constructor = true;
    let batch = vec![i1, i2, Instruction::free(View::contiguous(&b, &[8]))];

    let sources = generate(batch, &EngineConfig::default());
    assert_eq!(sources.len(), 1);
    let src = &sources[0];

    // One loop, both instructions, and b lives in a register.
    assert_eq!(src.matches("for(").count(), 1);
    assert!(src.contains("float t0;"));
    assert!(src.contains("t0 = a1[i0] + 1.0f;"));
    assert!(src.contains("a2[i0] = t0 * 2.0f;"));
    // b is neither a parameter nor stored.
    assert!(src.contains("void execute(float a1[static 8], float a2[static 8])"));
    assert!(!src.contains("a0["));
}

#[test]
fn sum_of_vector_uses_reduction_clause() {
    let a = BaseHandle::new(DType::Float64, 10);
    let s = BaseHandle::new(DType::Float64, 1);
    let batch = vec![Instruction::sweep(
        Opcode::AddReduce,
        View::contiguous(&s, &[1]),
        View::contiguous(&a, &[10]),
        0,
    )];
    let sources = generate(batch, &EngineConfig::new().with_openmp());
    let src = &sources[0];
    assert!(src.contains("reduction(+:s0)"));
    assert!(!src.contains("atomic"));
    assert!(!src.contains("critical"));
}

#[test]
fn operand_order_survives_to_the_subscript() {
    // a = b - c must subtract in exactly that order.
    let b = BaseHandle::new(DType::Int32, 8);
    let c = BaseHandle::new(DType::Int32, 8);
    let a = BaseHandle::new(DType::Int32, 8);
    let batch = vec![Instruction::binary(
        Opcode::Subtract,
        View::contiguous(&a, &[8]),
        Operand::View(View::contiguous(&b, &[8])),
        Operand::View(View::contiguous(&c, &[8])),
    )];
    let sources = generate(batch, &EngineConfig::default());
    assert!(sources[0].contains("a0[i0] = a1[i0] - a2[i0];"));
}

#[test]
fn strided_views_subscript_with_strides() {
    // Every second element of a 16-element base.
    let a = BaseHandle::new(DType::Float64, 16);
    let out = BaseHandle::new(DType::Float64, 8);
    let strided = View {
        base: a.clone(),
        start: 1,
        shape: vec![8],
        stride: vec![2],
    };
    let batch = vec![Instruction::binary(
        Opcode::Add,
        View::contiguous(&out, &[8]),
        Operand::View(strided),
        Operand::Const(ConstVal::Float64(0.5)),
    )];
    let sources = generate(batch, &EngineConfig::default());
    assert!(sources[0].contains("a0[i0] = a1[1 + i0*2] + 0.5;"));
}

#[test]
fn identical_batches_generate_identical_source() {
    let mk = || {
        let a = BaseHandle::new(DType::Float64, 10);
        let s = BaseHandle::new(DType::Float64, 1);
        vec![Instruction::sweep(
            Opcode::AddReduce,
            View::contiguous(&s, &[1]),
            View::contiguous(&a, &[10]),
            0,
        )]
    };
    let config = EngineConfig::default();
    // Different bases, same shapes and opcodes: the source must be byte
    // identical so the Store cache hits.
    assert_eq!(generate(mk(), &config), generate(mk(), &config));
}

#[test]
fn matrix_row_reduction_keeps_outer_loop_unpeeled() {
    let m = BaseHandle::new(DType::Int32, 20);
    let r = BaseHandle::new(DType::Int32, 4);
    let batch = vec![Instruction::sweep(
        Opcode::AddReduce,
        View::contiguous(&r, &[4]),
        View::contiguous(&m, &[4, 5]),
        1,
    )];
    let sources = generate(batch, &EngineConfig::default());
    let src = &sources[0];
    assert!(src.contains("for(uint64_t i0=0; i0 < 4; ++i0) {"));
    // The inner loop is seeded (int add has an identity), not peeled.
    assert!(src.contains("s0 = 0;"));
    assert!(src.contains("for(uint64_t i1=0; i1 < 5; ++i1) {"));
    assert!(src.contains("a0[i0] = s0;"));
}
