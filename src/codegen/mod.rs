//! Lowering of fused blocks to C source.
//!
//! One kernel becomes a freestanding translation unit with two exported
//! functions: `execute`, taking the non-contracted bases as typed array
//! parameters, and `launcher`, which unpacks a `void*` list and calls it.
//! The loop writer handles scalar replacement of innermost reductions,
//! loop peeling or seeding for sweep initialisation, contraction of
//! temporaries into loop-local scalars, and the OpenMP classification of
//! every sweep output (reduction clause, atomic, or critical).

mod instr;

pub use instr::{subscript, write_instr};

use log::trace;
use rustc_hash::FxHashSet;

use crate::base::BaseHandle;
use crate::basedb::BaseDb;
use crate::block::{Block, LoopBlock};
use crate::config::EngineConfig;
use crate::dtype::DType;
use crate::error::Result;
use crate::instruction::{InstrPtr, Instruction, Opcode};
use crate::kernel::Kernel;
use crate::view::Operand;

fn spaces(out: &mut String, num: usize) {
    out.push_str(&" ".repeat(num));
}

/// The OpenMP reduction symbol for an opcode, if it has one.
fn openmp_reduce_symbol(opcode: Opcode) -> Option<&'static str> {
    match opcode {
        Opcode::AddReduce => Some("+"),
        Opcode::MultiplyReduce => Some("*"),
        Opcode::BitwiseAndReduce => Some("&"),
        Opcode::BitwiseOrReduce => Some("|"),
        Opcode::BitwiseXorReduce => Some("^"),
        Opcode::MaximumReduce => Some("max"),
        Opcode::MinimumReduce => Some("min"),
        _ => None,
    }
}

/// Does the opcode support the OpenMP atomic guard?
fn openmp_atomic_compatible(opcode: Opcode) -> bool {
    matches!(
        opcode,
        Opcode::AddReduce
            | Opcode::MultiplyReduce
            | Opcode::BitwiseAndReduce
            | Opcode::BitwiseOrReduce
            | Opcode::BitwiseXorReduce
    )
}

/// A block goes parallel only when every sweep is a reduction.
fn openmp_compatible(block: &LoopBlock) -> bool {
    block.sweeps.iter().all(|instr| instr.opcode.is_reduction())
}

/// An OpenMP SIMD loop tolerates no other pragma in its body.
fn simd_compatible(block: &LoopBlock, base_ids: &BaseDb) -> bool {
    if !block
        .sweeps
        .iter()
        .all(|instr| openmp_reduce_symbol(instr.opcode).is_some())
    {
        return false;
    }
    block
        .all_bases()
        .iter()
        .all(|b| !base_ids.is_openmp_atomic(b) && !base_ids.is_openmp_critical(b))
}

/// The neutral element seeding a reduction, when one exists. Integer
/// max/min have no portable literal, so those always go through peeling.
fn reduce_identity(opcode: Opcode, dtype: DType) -> Option<&'static str> {
    match opcode {
        Opcode::AddReduce => Some("0"),
        Opcode::MultiplyReduce => Some("1"),
        Opcode::BitwiseOrReduce | Opcode::BitwiseXorReduce => {
            Some(if dtype == DType::Bool { "false" } else { "0" })
        }
        Opcode::BitwiseAndReduce => Some(if dtype == DType::Bool { "true" } else { "~0" }),
        Opcode::LogicalAndReduce => Some("true"),
        Opcode::LogicalOrReduce | Opcode::LogicalXorReduce => Some("false"),
        Opcode::MaximumReduce if dtype.is_float() => Some("-INFINITY"),
        Opcode::MinimumReduce if dtype.is_float() => Some("INFINITY"),
        _ => None,
    }
}

/// Does `instr` sweep the innermost axis of its input? Such a reduction
/// finishes each output element before moving on, so its accumulator can
/// live in a scalar.
fn sweeping_innermost_axis(instr: &Instruction) -> bool {
    if !instr.opcode.is_sweep() {
        return false;
    }
    let input = match instr.operands.get(1).and_then(|op| op.view()) {
        Some(v) => v,
        None => return false,
    };
    instr.sweep_axis() == Some(input.ndim() - 1)
}

/// Sweeps of a block in a stable order (by output base id), so emission
/// does not depend on set iteration order.
fn sorted_sweeps(block: &LoopBlock, base_ids: &BaseDb) -> Vec<InstrPtr> {
    let mut sweeps: Vec<InstrPtr> = block.sweeps.iter().cloned().collect();
    sweeps.sort_by_key(|instr| instr.out_view().map(|v| base_ids.id(&v.base)).unwrap_or(0));
    sweeps
}

/// Contracted temporaries used by this node's direct instruction leaves
/// and not yet declared by an ancestor; they get their declaration inside
/// this loop body, so under a parallel loop every worker owns its own
/// copy. A deeper loop reading the same temp sees the enclosing scope.
fn local_temps(
    block: &LoopBlock,
    base_ids: &BaseDb,
    declared: &FxHashSet<BaseHandle>,
) -> Vec<BaseHandle> {
    let mut out: Vec<BaseHandle> = Vec::new();
    for child in &block.children {
        if let Some(instr) = child.as_instr() {
            for view in instr.views() {
                if base_ids.is_tmp(&view.base)
                    && !declared.contains(&view.base)
                    && !out.contains(&view.base)
                {
                    out.push(view.base.clone());
                }
            }
        }
    }
    out.sort_by_key(|b| base_ids.id(b));
    out
}

/// Writes the `#pragma omp` header for a loop: `parallel for` on the
/// outermost loop when all sweeps are reductions, `simd` on compatible
/// innermost loops, and the reduction clauses for scalar-replaced or
/// contracted sweep outputs. Sweep outputs that cannot take a reduction
/// clause are flagged atomic or critical for the body writer.
fn write_openmp_header(
    out: &mut String,
    block: &LoopBlock,
    base_ids: &mut BaseDb,
    config: &EngineConfig,
) {
    if !config.compiler_openmp {
        return;
    }
    let mut openmp_reductions: Vec<InstrPtr> = Vec::new();
    let mut header = String::new();

    // "parallel for" goes to the outermost loop.
    if block.rank == 0 && openmp_compatible(block) {
        header.push_str(" parallel for");
        // Every sweep is either summarised through a reduction clause or
        // guarded; this classification is what keeps racing writes out.
        for instr in sorted_sweeps(block, base_ids) {
            let base = instr.out_view().unwrap().base.clone();
            if openmp_reduce_symbol(instr.opcode).is_some()
                && (base_ids.is_scalar_replaced(&base) || base_ids.is_tmp(&base))
            {
                openmp_reductions.push(instr);
            } else if openmp_atomic_compatible(instr.opcode) {
                base_ids.insert_openmp_atomic(&base);
            } else {
                base_ids.insert_openmp_critical(&base);
            }
        }
    }

    // "simd" goes to the innermost loop, which may also be the outermost.
    if config.compiler_openmp_simd && block.is_innermost() && simd_compatible(block, base_ids) {
        header.push_str(" simd");
        if block.rank > 0 {
            // Rank 0 already declared its reduction clauses.
            for instr in sorted_sweeps(block, base_ids) {
                let base = &instr.out_view().unwrap().base;
                if base_ids.is_scalar_replaced(base) || base_ids.is_tmp(base) {
                    openmp_reductions.push(instr.clone());
                }
            }
        }
    }

    for instr in &openmp_reductions {
        let base = &instr.out_view().unwrap().base;
        let prefix = if base_ids.is_scalar_replaced(base) { "s" } else { "t" };
        header.push_str(&format!(
            " reduction({}:{}{})",
            openmp_reduce_symbol(instr.opcode).unwrap(),
            prefix,
            base_ids.id(base)
        ));
    }

    if !header.is_empty() {
        out.push_str(&format!("#pragma omp{}\n", header));
        spaces(out, 4 + block.rank * 4);
    }
}

/// Emits one loop node: scalar replacements, seed or peel, the OpenMP
/// header, the `for` itself, temp declarations, the body, and finally the
/// scalar store-backs.
fn write_loop_block(
    out: &mut String,
    block: &LoopBlock,
    base_ids: &mut BaseDb,
    config: &EngineConfig,
    declared: &FxHashSet<BaseHandle>,
) -> Result<()> {
    spaces(out, 4 + block.rank * 4);

    let sweeps = sorted_sweeps(block, base_ids);

    // Scalar replace reductions over the innermost axis. Temporary outputs
    // already live in a scalar.
    let mut scalar_replacements = Vec::new();
    for instr in &sweeps {
        if instr.opcode.is_reduction() && sweeping_innermost_axis(instr) {
            let view = instr.out_view().unwrap().clone();
            if base_ids.is_tmp(&view.base) {
                continue;
            }
            out.push_str(&format!(
                "{} s{};\n",
                view.dtype().c_name(),
                base_ids.id(&view.base)
            ));
            spaces(out, 4 + block.rank * 4);
            base_ids.insert_scalar_replacement(&view.base);
            scalar_replacements.push(view);
        }
    }

    // No peeling when every sweep has an identity and writes to a scalar.
    let need_to_peel = sweeps.iter().any(|instr| {
        let base = &instr.out_view().unwrap().base;
        !(reduce_identity(instr.opcode, instr.out_view().unwrap().dtype()).is_some()
            && (base_ids.is_scalar_replaced(base) || base_ids.is_tmp(base)))
    });

    if !sweeps.is_empty() && !need_to_peel {
        for instr in &sweeps {
            let view = instr.out_view().unwrap();
            let prefix = if base_ids.is_tmp(&view.base) { "t" } else { "s" };
            out.push_str(&format!(
                "{}{} = {};\n",
                prefix,
                base_ids.id(&view.base),
                reduce_identity(instr.opcode, view.dtype()).unwrap()
            ));
            spaces(out, 4 + block.rank * 4);
        }
    }

    let local_tmps = local_temps(block, base_ids, declared);
    let mut inner_declared = declared.clone();
    inner_declared.extend(local_tmps.iter().cloned());

    // Peel the first iteration: the sweep is replaced by an identity-copy,
    // which initialises the output, and the main loop starts at one.
    if !sweeps.is_empty() && need_to_peel {
        let mut peeled = block.clone();
        for instr in &sweeps {
            let axis = instr.sweep_axis().unwrap();
            let input = instr.operands[1].view().unwrap().clone();
            let mut out_view = instr.out_view().unwrap().clone();
            // Reducing to a non-scalar: give the output a unit dimension so
            // it lines up with the input's loop nest.
            if instr.opcode.is_reduction() && input.ndim() > 1 {
                out_view.insert_dim(axis, 1, 0);
            }
            let ident = Instruction::unary(Opcode::Identity, out_view, Operand::View(input));
            peeled = peeled.replace_instr(instr, ident);
        }
        out.push_str("{ // Peeled loop, 1. sweep iteration\n");
        spaces(out, 8 + block.rank * 4);
        out.push_str(&format!("uint64_t i{} = 0;\n", block.rank));
        for base in &local_tmps {
            spaces(out, 8 + block.rank * 4);
            out.push_str(&format!("{} t{};\n", base.dtype().c_name(), base_ids.id(base)));
        }
        for child in &peeled.children {
            match child {
                Block::Instr(leaf) => {
                    let stmt = write_instr(&leaf.instr, base_ids)?;
                    if !stmt.is_empty() {
                        spaces(out, 4 + leaf.rank * 4);
                        out.push_str(&stmt);
                        out.push('\n');
                    }
                }
                Block::Loop(inner) => write_loop_block(out, inner, base_ids, config, &inner_declared)?,
            }
        }
        spaces(out, 4 + block.rank * 4);
        out.push_str("}\n");
        spaces(out, 4 + block.rank * 4);
    }

    // One-sized loops are not worth a parallel header.
    let for_loop_size = if need_to_peel && !sweeps.is_empty() {
        block.size - 1
    } else {
        block.size
    };
    if for_loop_size > 1 {
        write_openmp_header(out, block, base_ids, config);
    }

    let start = if !sweeps.is_empty() && need_to_peel { 1 } else { 0 };
    out.push_str(&format!(
        "for(uint64_t i{r}={start}; i{r} < {size}; ++i{r}) {{\n",
        r = block.rank,
        start = start,
        size = block.size
    ));

    for base in &local_tmps {
        spaces(out, 8 + block.rank * 4);
        out.push_str(&format!("{} t{};\n", base.dtype().c_name(), base_ids.id(base)));
    }

    for child in &block.children {
        match child {
            Block::Instr(leaf) => {
                let instr = &leaf.instr;
                if instr.opcode.nop() > 0 && !instr.opcode.is_system() {
                    let base = &instr.out_view().unwrap().base;
                    if base_ids.is_openmp_atomic(base) {
                        spaces(out, 4 + leaf.rank * 4);
                        out.push_str("#pragma omp atomic\n");
                    } else if base_ids.is_openmp_critical(base) {
                        spaces(out, 4 + leaf.rank * 4);
                        out.push_str("#pragma omp critical\n");
                    }
                }
                let stmt = write_instr(instr, base_ids)?;
                if !stmt.is_empty() {
                    spaces(out, 4 + leaf.rank * 4);
                    out.push_str(&stmt);
                    out.push('\n');
                }
            }
            Block::Loop(inner) => write_loop_block(out, inner, base_ids, config, &inner_declared)?,
        }
    }
    spaces(out, 4 + block.rank * 4);
    out.push_str("}\n");

    // Copy the scalar replacements back to their arrays, and drop the flag
    // so it cannot be observed by a sibling subtree.
    for view in &scalar_replacements {
        spaces(out, 4 + block.rank * 4);
        let id = base_ids.id(&view.base);
        base_ids.erase_scalar_replacement(&view.base);
        out.push_str(&format!("a{}[{}] = s{};\n", id, subscript(view), id));
    }
    Ok(())
}

/// Renders a kernel to a complete C translation unit. The full source text
/// is the Store's cache key, so identical shapes and opcodes hit.
pub fn write_kernel(kernel: &Kernel, base_ids: &mut BaseDb, config: &EngineConfig) -> Result<String> {
    let mut out = String::new();
    out.push_str("#include <stdint.h>\n");
    out.push_str("#include <stdlib.h>\n");
    out.push_str("#include <stdbool.h>\n");
    out.push_str("#include <complex.h>\n");
    out.push_str("#include <tgmath.h>\n");
    out.push_str("#include <math.h>\n");
    if kernel.use_random() {
        out.push_str("#include \"random123.h\"\n");
    }
    out.push('\n');

    out.push_str("void execute(");
    for (i, base) in kernel.non_temps().iter().enumerate() {
        if i > 0 {
            out.push_str(", ");
        }
        out.push_str(&format!(
            "{} a{}[static {}]",
            base.dtype().c_name(),
            base_ids.id(base),
            base.nelem()
        ));
    }
    out.push_str(") {\n");
    write_loop_block(&mut out, &kernel.block, base_ids, config, &FxHashSet::default())?;
    out.push_str("}\n\n");

    out.push_str("void launcher(void* data_list[]) {\n");
    for (i, base) in kernel.non_temps().iter().enumerate() {
        out.push_str(&format!(
            "    {} *a{} = data_list[{}];\n",
            base.dtype().c_name(),
            base_ids.id(base),
            i
        ));
    }
    out.push_str("    execute(");
    for (i, base) in kernel.non_temps().iter().enumerate() {
        if i > 0 {
            out.push_str(", ");
        }
        out.push_str(&format!("a{}", base_ids.id(base)));
    }
    out.push_str(");\n}\n");

    trace!("generated kernel of {} bytes", out.len());
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::create_nested_block;
    use crate::dtype::ConstVal;
    use crate::view::View;
    use rustc_hash::FxHashSet;

    fn kernel_for(instrs: Vec<Instruction>, news: &[&BaseHandle], frees: &[&BaseHandle]) -> Kernel {
        let news: FxHashSet<BaseHandle> = news.iter().map(|b| (*b).clone()).collect();
        let frees: FxHashSet<BaseHandle> = frees.iter().map(|b| (*b).clone()).collect();
        Kernel::new(create_nested_block(instrs, news, frees, 0, None).unwrap())
    }

    fn ids_for(kernel: &Kernel) -> BaseDb {
        let mut base_ids = BaseDb::new();
        for instr in kernel.all_instrs() {
            for view in instr.views() {
                base_ids.insert(&view.base);
            }
        }
        base_ids.insert_tmp(kernel.temps().iter().cloned());
        base_ids
    }

    fn gen(kernel: &Kernel, config: &EngineConfig) -> String {
        let mut base_ids = ids_for(kernel);
        write_kernel(kernel, &mut base_ids, config).unwrap()
    }

    #[test]
    fn test_sum_vector_seeds_and_uses_reduction_clause() {
        let a = BaseHandle::new(DType::Float64, 10);
        let s = BaseHandle::new(DType::Float64, 1);
        let kernel = kernel_for(
            vec![Instruction::sweep(
                Opcode::AddReduce,
                View::contiguous(&s, &[1]),
                View::contiguous(&a, &[10]),
                0,
            )],
            &[],
            &[],
        );
        let src = gen(&kernel, &EngineConfig::new().with_openmp());
        assert!(src.contains("double s0;"));
        assert!(src.contains("s0 = 0;"));
        assert!(src.contains("#pragma omp parallel for reduction(+:s0)"));
        assert!(src.contains("for(uint64_t i0=0; i0 < 10; ++i0) {"));
        assert!(src.contains("s0 = s0 + a1[i0];"));
        assert!(src.contains("a0[0] = s0;"));
        assert!(!src.contains("atomic"));
        assert!(!src.contains("critical"));
    }

    #[test]
    fn test_integer_max_reduce_is_peeled() {
        // No identity for integer max, so the loop starts at one with an
        // identity-copy covering index zero.
        let a = BaseHandle::new(DType::Int32, 5);
        let s = BaseHandle::new(DType::Int32, 1);
        let kernel = kernel_for(
            vec![Instruction::sweep(
                Opcode::MaximumReduce,
                View::contiguous(&s, &[1]),
                View::contiguous(&a, &[5]),
                0,
            )],
            &[],
            &[],
        );
        let src = gen(&kernel, &EngineConfig::default());
        assert!(src.contains("Peeled loop"));
        assert!(src.contains("uint64_t i0 = 0;"));
        assert!(src.contains("s0 = a1[i0];"));
        assert!(src.contains("for(uint64_t i0=1; i0 < 5; ++i0) {"));
        assert!(!src.contains("for(uint64_t i0=0;"));
    }

    #[test]
    fn test_float_max_reduce_is_seeded() {
        let a = BaseHandle::new(DType::Float64, 5);
        let s = BaseHandle::new(DType::Float64, 1);
        let kernel = kernel_for(
            vec![Instruction::sweep(
                Opcode::MaximumReduce,
                View::contiguous(&s, &[1]),
                View::contiguous(&a, &[5]),
                0,
            )],
            &[],
            &[],
        );
        let src = gen(&kernel, &EngineConfig::default());
        assert!(src.contains("s0 = -INFINITY;"));
        assert!(!src.contains("Peeled loop"));
    }

    #[test]
    fn test_non_innermost_sweep_goes_atomic() {
        // reduce(+, m[20][50], axis=0): the output stays live in memory, so
        // the parallel header cannot use a reduction clause and falls back
        // to the atomic guard.
        let m = BaseHandle::new(DType::Int64, 1000);
        let r = BaseHandle::new(DType::Int64, 50);
        let kernel = kernel_for(
            vec![Instruction::sweep(
                Opcode::AddReduce,
                View::contiguous(&r, &[50]),
                View::contiguous(&m, &[20, 50]),
                0,
            )],
            &[],
            &[],
        );
        let src = gen(&kernel, &EngineConfig::new().with_openmp());
        assert!(src.contains("#pragma omp parallel for\n"));
        assert!(src.contains("#pragma omp atomic"));
        assert!(!src.contains("critical"));
        assert!(!src.contains("reduction("));
    }

    #[test]
    fn test_mod_reduce_goes_critical() {
        let m = BaseHandle::new(DType::Int64, 1000);
        let r = BaseHandle::new(DType::Int64, 50);
        let kernel = kernel_for(
            vec![Instruction::sweep(
                Opcode::ModReduce,
                View::contiguous(&r, &[50]),
                View::contiguous(&m, &[20, 50]),
                0,
            )],
            &[],
            &[],
        );
        let src = gen(&kernel, &EngineConfig::new().with_openmp());
        assert!(src.contains("#pragma omp critical"));
        assert!(!src.contains("atomic"));
    }

    #[test]
    fn test_temp_declared_inside_loop() {
        let a = BaseHandle::new(DType::Float32, 8);
        let b = BaseHandle::new(DType::Float32, 8);
        let c = BaseHandle::new(DType::Float32, 8);
        let i1 = Instruction::binary(
            Opcode::Add,
            View::contiguous(&b, &[8]),
            Operand::View(View::contiguous(&a, &[8])),
            Operand::Const(ConstVal::Float32(1.0)),
        );
        let i2 = Instruction::binary(
            Opcode::Multiply,
            View::contiguous(&c, &[8]),
            Operand::View(View::contiguous(&b, &[8])),
            Operand::Const(ConstVal::Float32(2.0)),
        );
        let kernel = kernel_for(vec![i1, i2], &[&b, &c], &[&b]);
        let src = gen(&kernel, &EngineConfig::default());
        // b is contracted: declared in the loop body, absent from the
        // signature, and never stored to memory.
        assert!(src.contains("float t0;"));
        assert!(src.contains("t0 = a1[i0] + 1.0f;"));
        assert!(src.contains("a2[i0] = t0 * 2.0f;"));
        assert!(src.contains("void execute(float a1[static 8], float a2[static 8])"));
    }

    #[test]
    fn test_row_reduction_scalar_roundtrip() {
        let m = BaseHandle::new(DType::Int32, 20);
        let r = BaseHandle::new(DType::Int32, 4);
        let kernel = kernel_for(
            vec![Instruction::sweep(
                Opcode::AddReduce,
                View::contiguous(&r, &[4]),
                View::contiguous(&m, &[4, 5]),
                1,
            )],
            &[],
            &[],
        );
        let src = gen(&kernel, &EngineConfig::default());
        assert!(src.contains("int32_t s0;"));
        assert!(src.contains("s0 = 0;"));
        assert!(src.contains("s0 = s0 + a1[i0*5 + i1];"));
        assert!(src.contains("a0[i0] = s0;"));
    }

    #[test]
    fn test_simd_header_on_innermost() {
        let a = BaseHandle::new(DType::Float64, 10);
        let s = BaseHandle::new(DType::Float64, 1);
        let kernel = kernel_for(
            vec![Instruction::sweep(
                Opcode::AddReduce,
                View::contiguous(&s, &[1]),
                View::contiguous(&a, &[10]),
                0,
            )],
            &[],
            &[],
        );
        let src = gen(&kernel, &EngineConfig::new().with_openmp_simd());
        assert!(src.contains("#pragma omp parallel for simd reduction(+:s0)"));
    }

    #[test]
    fn test_launcher_casts_in_parameter_order() {
        let a = BaseHandle::new(DType::Float64, 8);
        let b = BaseHandle::new(DType::Float64, 8);
        let kernel = kernel_for(
            vec![Instruction::binary(
                Opcode::Add,
                View::contiguous(&b, &[8]),
                Operand::View(View::contiguous(&a, &[8])),
                Operand::Const(ConstVal::Float64(1.0)),
            )],
            &[],
            &[],
        );
        let src = gen(&kernel, &EngineConfig::default());
        assert!(src.contains("void launcher(void* data_list[]) {"));
        assert!(src.contains("double *a0 = data_list[0];"));
        assert!(src.contains("double *a1 = data_list[1];"));
        assert!(src.contains("execute(a0, a1);"));
    }

    #[test]
    fn test_random_kernel_includes_header() {
        let out = BaseHandle::new(DType::Uint64, 8);
        let kernel = kernel_for(
            vec![Instruction::random(View::contiguous(&out, &[8]), 7)],
            &[],
            &[],
        );
        let src = gen(&kernel, &EngineConfig::default());
        assert!(src.contains("#include \"random123.h\""));
        assert!(src.contains("a0[i0] = random123(7ull, i0);"));
    }
}
