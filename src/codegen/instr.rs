//! Per-instruction emission: array subscripts, operand rendering, and the
//! scalar expression table.
//!
//! The table is a dispatch on `(opcode, element type)` producing a C
//! statement from operand strings. Pairs without an entry are a fatal
//! batch error; the front end is expected never to emit them.

use crate::basedb::BaseDb;
use crate::dtype::DType;
use crate::error::{EngineError, Result};
use crate::instruction::{Instruction, Opcode};
use crate::view::{Operand, View};

/// The in-loop subscript of a view: `start + i0*stride0 + i1*stride1 + …`,
/// using the loop indices of the enclosing nest. Dimensions of extent one
/// and broadcast dimensions (stride zero) contribute nothing.
pub fn subscript(view: &View) -> String {
    let mut terms: Vec<String> = Vec::new();
    if view.start != 0 {
        terms.push(view.start.to_string());
    }
    for (d, (&sh, &st)) in view.shape.iter().zip(&view.stride).enumerate() {
        if sh > 1 && st != 0 {
            if st == 1 {
                terms.push(format!("i{}", d));
            } else {
                terms.push(format!("i{}*{}", d, st));
            }
        }
    }
    if terms.is_empty() {
        "0".to_string()
    } else {
        terms.join(" + ")
    }
}

/// Like [`subscript`] but with the index at `axis` shifted one iteration
/// back. Scans read the previously produced element through this.
fn subscript_prev(view: &View, axis: usize) -> String {
    let mut terms: Vec<String> = Vec::new();
    if view.start != 0 {
        terms.push(view.start.to_string());
    }
    for (d, (&sh, &st)) in view.shape.iter().zip(&view.stride).enumerate() {
        if d == axis {
            if st == 1 {
                terms.push(format!("(i{} - 1)", d));
            } else {
                terms.push(format!("(i{} - 1)*{}", d, st));
            }
        } else if sh > 1 && st != 0 {
            if st == 1 {
                terms.push(format!("i{}", d));
            } else {
                terms.push(format!("i{}*{}", d, st));
            }
        }
    }
    if terms.is_empty() {
        "0".to_string()
    } else {
        terms.join(" + ")
    }
}

/// Renders a view operand according to its storage class: scalar-replaced
/// bases become `s<id>`, contracted temporaries `t<id>`, everything else an
/// array subscription.
fn view_str(view: &View, base_ids: &BaseDb) -> String {
    let id = base_ids.id(&view.base);
    if base_ids.is_scalar_replaced(&view.base) {
        format!("s{}", id)
    } else if base_ids.is_tmp(&view.base) {
        format!("t{}", id)
    } else {
        format!("a{}[{}]", id, subscript(view))
    }
}

fn operand_str(op: &Operand, base_ids: &BaseDb) -> String {
    match op {
        Operand::View(v) => view_str(v, base_ids),
        Operand::Const(c) => c.c_literal(),
    }
}

fn unsupported(instr: &Instruction, dtype: DType) -> EngineError {
    EngineError::UnsupportedOperation {
        opcode: instr.opcode,
        dtype,
    }
}

/// Renders one instruction as a C statement (no indentation, no newline).
/// System instructions render to nothing.
pub fn write_instr(instr: &Instruction, base_ids: &BaseDb) -> Result<String> {
    use Opcode::*;

    if instr.opcode.is_system() {
        return Ok(String::new());
    }

    if instr.opcode == Random {
        return write_random(instr, base_ids);
    }

    if instr.opcode.is_reduction() {
        return write_reduction(instr, base_ids);
    }

    if matches!(instr.opcode, AddAccumulate | MultiplyAccumulate) {
        return write_scan(instr, base_ids);
    }

    let ops: Vec<String> = instr
        .operands
        .iter()
        .map(|op| operand_str(op, base_ids))
        .collect();
    // The operation's element type is the first input's; the output may
    // differ (comparisons produce bool).
    let dtype = instr.operands.get(1).map(|op| op.dtype()).unwrap_or_else(|| {
        instr.operands[0].dtype()
    });

    let stmt = match instr.opcode {
        Add if dtype != DType::Bool => format!("{} = {} + {};", ops[0], ops[1], ops[2]),
        Subtract if dtype != DType::Bool => format!("{} = {} - {};", ops[0], ops[1], ops[2]),
        Multiply if dtype != DType::Bool => format!("{} = {} * {};", ops[0], ops[1], ops[2]),
        Divide if dtype != DType::Bool => format!("{} = {} / {};", ops[0], ops[1], ops[2]),
        Mod if dtype.is_integer() => format!("{} = {} % {};", ops[0], ops[1], ops[2]),
        Mod if dtype.is_float() => format!("{} = fmod({}, {});", ops[0], ops[1], ops[2]),
        Power if dtype.is_float() => format!("{} = pow({}, {});", ops[0], ops[1], ops[2]),
        Maximum if dtype != DType::Bool => format!(
            "{} = {} > {} ? {} : {};",
            ops[0], ops[1], ops[2], ops[1], ops[2]
        ),
        Minimum if dtype != DType::Bool => format!(
            "{} = {} < {} ? {} : {};",
            ops[0], ops[1], ops[2], ops[1], ops[2]
        ),
        BitwiseAnd if !dtype.is_float() => format!("{} = {} & {};", ops[0], ops[1], ops[2]),
        BitwiseOr if !dtype.is_float() => format!("{} = {} | {};", ops[0], ops[1], ops[2]),
        BitwiseXor if !dtype.is_float() => format!("{} = {} ^ {};", ops[0], ops[1], ops[2]),
        LogicalAnd if dtype == DType::Bool => format!("{} = {} && {};", ops[0], ops[1], ops[2]),
        LogicalOr if dtype == DType::Bool => format!("{} = {} || {};", ops[0], ops[1], ops[2]),
        LogicalXor if dtype == DType::Bool => format!("{} = {} != {};", ops[0], ops[1], ops[2]),
        Equal => format!("{} = {} == {};", ops[0], ops[1], ops[2]),
        NotEqual => format!("{} = {} != {};", ops[0], ops[1], ops[2]),
        Less => format!("{} = {} < {};", ops[0], ops[1], ops[2]),
        LessEqual => format!("{} = {} <= {};", ops[0], ops[1], ops[2]),
        Greater => format!("{} = {} > {};", ops[0], ops[1], ops[2]),
        GreaterEqual => format!("{} = {} >= {};", ops[0], ops[1], ops[2]),
        Identity => format!("{} = {};", ops[0], ops[1]),
        Negative if dtype != DType::Bool => format!("{} = -{};", ops[0], ops[1]),
        Sqrt if dtype.is_float() => format!("{} = sqrt({});", ops[0], ops[1]),
        _ => return Err(unsupported(instr, dtype)),
    };
    Ok(stmt)
}

/// Reductions fold into their output: `out = out <op> in`. When the input
/// is multi-dimensional the output view gets a unit dimension inserted at
/// the swept axis so its subscript lines up with the loop nest.
fn write_reduction(instr: &Instruction, base_ids: &BaseDb) -> Result<String> {
    use Opcode::*;

    let axis = instr.sweep_axis().ok_or_else(|| {
        EngineError::MalformedInstruction(format!("{} without an axis", instr.opcode.name()))
    })?;
    let input = instr.operands[1].view().ok_or_else(|| {
        EngineError::MalformedInstruction(format!(
            "{} input must be a view",
            instr.opcode.name()
        ))
    })?;

    let out = instr.out_view().unwrap();
    let lhs = if base_ids.is_scalar_replaced(&out.base) || base_ids.is_tmp(&out.base) {
        view_str(out, base_ids)
    } else {
        let mut aligned = out.clone();
        if input.ndim() > 1 {
            aligned.insert_dim(axis, 1, 0);
        }
        format!("a{}[{}]", base_ids.id(&out.base), subscript(&aligned))
    };
    let rhs = view_str(input, base_ids);
    let dtype = input.dtype();

    let stmt = match instr.opcode {
        AddReduce if dtype != DType::Bool => format!("{} = {} + {};", lhs, lhs, rhs),
        MultiplyReduce if dtype != DType::Bool => format!("{} = {} * {};", lhs, lhs, rhs),
        MaximumReduce if dtype != DType::Bool => {
            format!("{} = {} > {} ? {} : {};", lhs, lhs, rhs, lhs, rhs)
        }
        MinimumReduce if dtype != DType::Bool => {
            format!("{} = {} < {} ? {} : {};", lhs, lhs, rhs, lhs, rhs)
        }
        BitwiseAndReduce if !dtype.is_float() => format!("{} = {} & {};", lhs, lhs, rhs),
        BitwiseOrReduce if !dtype.is_float() => format!("{} = {} | {};", lhs, lhs, rhs),
        BitwiseXorReduce if !dtype.is_float() => format!("{} = {} ^ {};", lhs, lhs, rhs),
        LogicalAndReduce if dtype == DType::Bool => format!("{} = {} && {};", lhs, lhs, rhs),
        LogicalOrReduce if dtype == DType::Bool => format!("{} = {} || {};", lhs, lhs, rhs),
        LogicalXorReduce if dtype == DType::Bool => format!("{} = {} != {};", lhs, lhs, rhs),
        ModReduce if dtype.is_integer() => format!("{} = {} % {};", lhs, lhs, rhs),
        ModReduce if dtype.is_float() => format!("{} = fmod({}, {});", lhs, lhs, rhs),
        _ => return Err(unsupported(instr, dtype)),
    };
    Ok(stmt)
}

/// Scans keep the swept axis: each element combines the previous output
/// element with the input. A contracted output carries the running value
/// in its scalar instead.
fn write_scan(instr: &Instruction, base_ids: &BaseDb) -> Result<String> {
    let axis = instr.sweep_axis().ok_or_else(|| {
        EngineError::MalformedInstruction(format!("{} without an axis", instr.opcode.name()))
    })?;
    let out = instr.out_view().unwrap();
    let input = instr.operands[1].view().ok_or_else(|| {
        EngineError::MalformedInstruction(format!(
            "{} input must be a view",
            instr.opcode.name()
        ))
    })?;

    let lhs = view_str(out, base_ids);
    let prev = if base_ids.is_tmp(&out.base) || base_ids.is_scalar_replaced(&out.base) {
        lhs.clone()
    } else {
        format!("a{}[{}]", base_ids.id(&out.base), subscript_prev(out, axis))
    };
    let rhs = view_str(input, base_ids);
    let dtype = input.dtype();

    let stmt = match instr.opcode {
        Opcode::AddAccumulate if dtype != DType::Bool => {
            format!("{} = {} + {};", lhs, prev, rhs)
        }
        Opcode::MultiplyAccumulate if dtype != DType::Bool => {
            format!("{} = {} * {};", lhs, prev, rhs)
        }
        _ => return Err(unsupported(instr, dtype)),
    };
    Ok(stmt)
}

/// `out = random123(seed, index)`: the flat element index is the counter,
/// so the stream is reproducible regardless of fusion and threading.
fn write_random(instr: &Instruction, base_ids: &BaseDb) -> Result<String> {
    let out = instr.out_view().unwrap();
    if out.dtype() != DType::Uint64 {
        return Err(unsupported(instr, out.dtype()));
    }
    let seed = instr
        .constant
        .as_ref()
        .and_then(|c| c.get_int())
        .ok_or_else(|| {
            EngineError::MalformedInstruction("RANDOM without a seed constant".to_string())
        })?;
    Ok(format!(
        "{} = random123({}ull, {});",
        view_str(out, base_ids),
        seed as u64,
        subscript(out)
    ))
}
