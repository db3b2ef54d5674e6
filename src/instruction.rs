//! The array bytecode: opcodes and instructions.

use std::ops::Deref;
use std::rc::Rc;

use crate::dtype::ConstVal;
use crate::error::{EngineError, Result};
use crate::view::{Operand, View};

/// Maximum number of dimensions a view may carry.
pub const MAX_DIM: usize = 16;

/// Operation tag. Sweeps fold along one named axis; reductions are the
/// sweeps that drop that axis from the output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Opcode {
    // Elementwise arithmetic
    Add,
    Subtract,
    Multiply,
    Divide,
    Mod,
    Power,
    Maximum,
    Minimum,
    // Elementwise bitwise
    BitwiseAnd,
    BitwiseOr,
    BitwiseXor,
    // Elementwise logical
    LogicalAnd,
    LogicalOr,
    LogicalXor,
    // Elementwise comparison
    Equal,
    NotEqual,
    Less,
    LessEqual,
    Greater,
    GreaterEqual,
    // Elementwise unary
    Identity,
    Negative,
    Sqrt,
    // Reductions
    AddReduce,
    MultiplyReduce,
    MinimumReduce,
    MaximumReduce,
    BitwiseAndReduce,
    BitwiseOrReduce,
    BitwiseXorReduce,
    LogicalAndReduce,
    LogicalOrReduce,
    LogicalXorReduce,
    ModReduce,
    // Sweeps that keep the swept axis (prefix scans)
    AddAccumulate,
    MultiplyAccumulate,
    // Generator
    Random,
    // System
    Free,
    Discard,
    Sync,
    None,
}

impl Opcode {
    /// Number of operands, output included.
    pub fn nop(self) -> usize {
        use Opcode::*;
        match self {
            None => 0,
            Free | Discard | Sync | Random => 1,
            Identity | Negative | Sqrt => 2,
            _ => 3,
        }
    }

    pub fn is_system(self) -> bool {
        matches!(self, Opcode::Free | Opcode::Discard | Opcode::Sync | Opcode::None)
    }

    /// A reduction folds the swept axis away.
    pub fn is_reduction(self) -> bool {
        use Opcode::*;
        matches!(
            self,
            AddReduce
                | MultiplyReduce
                | MinimumReduce
                | MaximumReduce
                | BitwiseAndReduce
                | BitwiseOrReduce
                | BitwiseXorReduce
                | LogicalAndReduce
                | LogicalOrReduce
                | LogicalXorReduce
                | ModReduce
        )
    }

    /// Sweeps are folds along one named axis: reductions plus scans.
    pub fn is_sweep(self) -> bool {
        self.is_reduction() || matches!(self, Opcode::AddAccumulate | Opcode::MultiplyAccumulate)
    }

    pub fn name(self) -> &'static str {
        use Opcode::*;
        match self {
            Add => "ADD",
            Subtract => "SUBTRACT",
            Multiply => "MULTIPLY",
            Divide => "DIVIDE",
            Mod => "MOD",
            Power => "POWER",
            Maximum => "MAXIMUM",
            Minimum => "MINIMUM",
            BitwiseAnd => "BITWISE_AND",
            BitwiseOr => "BITWISE_OR",
            BitwiseXor => "BITWISE_XOR",
            LogicalAnd => "LOGICAL_AND",
            LogicalOr => "LOGICAL_OR",
            LogicalXor => "LOGICAL_XOR",
            Equal => "EQUAL",
            NotEqual => "NOT_EQUAL",
            Less => "LESS",
            LessEqual => "LESS_EQUAL",
            Greater => "GREATER",
            GreaterEqual => "GREATER_EQUAL",
            Identity => "IDENTITY",
            Negative => "NEGATIVE",
            Sqrt => "SQRT",
            AddReduce => "ADD_REDUCE",
            MultiplyReduce => "MULTIPLY_REDUCE",
            MinimumReduce => "MINIMUM_REDUCE",
            MaximumReduce => "MAXIMUM_REDUCE",
            BitwiseAndReduce => "BITWISE_AND_REDUCE",
            BitwiseOrReduce => "BITWISE_OR_REDUCE",
            BitwiseXorReduce => "BITWISE_XOR_REDUCE",
            LogicalAndReduce => "LOGICAL_AND_REDUCE",
            LogicalOrReduce => "LOGICAL_OR_REDUCE",
            LogicalXorReduce => "LOGICAL_XOR_REDUCE",
            ModReduce => "MOD_REDUCE",
            AddAccumulate => "ADD_ACCUMULATE",
            MultiplyAccumulate => "MULTIPLY_ACCUMULATE",
            Random => "RANDOM",
            Free => "FREE",
            Discard => "DISCARD",
            Sync => "SYNC",
            None => "NONE",
        }
    }
}

/// One bytecode instruction over at most three operands. Operand 0 is the
/// output; sweeps carry their axis as an integer constant.
#[derive(Debug, Clone)]
pub struct Instruction {
    pub opcode: Opcode,
    pub operands: Vec<Operand>,
    pub constant: Option<ConstVal>,
    pub constructor: bool,
}

impl Instruction {
    pub fn binary(opcode: Opcode, out: View, lhs: Operand, rhs: Operand) -> Self {
        Instruction {
            opcode,
            operands: vec![Operand::View(out), lhs, rhs],
            constant: None,
            constructor: false,
        }
    }

    pub fn unary(opcode: Opcode, out: View, input: Operand) -> Self {
        Instruction {
            opcode,
            operands: vec![Operand::View(out), input],
            constant: None,
            constructor: false,
        }
    }

    /// A sweep over `axis` of `input`, reduction or scan.
    pub fn sweep(opcode: Opcode, out: View, input: View, axis: i64) -> Self {
        debug_assert!(opcode.is_sweep());
        Instruction {
            opcode,
            operands: vec![
                Operand::View(out),
                Operand::View(input),
                Operand::Const(ConstVal::Int64(axis)),
            ],
            constant: Some(ConstVal::Int64(axis)),
            constructor: false,
        }
    }

    /// Fills `out` with counter-based random values derived from `seed`.
    pub fn random(out: View, seed: u64) -> Self {
        Instruction {
            opcode: Opcode::Random,
            operands: vec![Operand::View(out)],
            constant: Some(ConstVal::Uint64(seed)),
            constructor: false,
        }
    }

    pub fn free(view: View) -> Self {
        Instruction {
            opcode: Opcode::Free,
            operands: vec![Operand::View(view)],
            constant: None,
            constructor: false,
        }
    }

    /// The output view. `None` only for zero-operand system instructions.
    pub fn out_view(&self) -> Option<&View> {
        self.operands.first().and_then(|op| op.view())
    }

    /// All non-constant operand views, output first.
    pub fn views(&self) -> impl Iterator<Item = &View> {
        self.operands.iter().filter_map(|op| op.view())
    }

    /// The axis a sweep folds along, or `None` for non-sweeps.
    pub fn sweep_axis(&self) -> Option<usize> {
        if !self.opcode.is_sweep() {
            return None;
        }
        self.constant
            .as_ref()
            .and_then(|c| c.get_int())
            .filter(|&axis| axis >= 0 && (axis as usize) < MAX_DIM)
            .map(|axis| axis as usize)
    }

    /// The shape of the widest-rank view operand; ties resolved by the
    /// element-wise maximum across operands of that rank.
    pub fn dominating_shape(&self) -> Vec<i64> {
        let ndim = self.views().map(|v| v.ndim()).max().unwrap_or(0);
        let mut shape: Vec<i64> = Vec::new();
        for view in self.views().filter(|v| v.ndim() == ndim) {
            for (d, &s) in view.shape.iter().enumerate() {
                if d < shape.len() {
                    if shape[d] < s {
                        shape[d] = s;
                    }
                } else {
                    shape.push(s);
                }
            }
        }
        shape
    }

    pub fn dominating_rank(&self) -> usize {
        self.views().map(|v| v.ndim()).max().unwrap_or(0)
    }

    /// Reshapable instructions may have their trailing dimensions collapsed
    /// or split: every view must be logically contiguous, and sweeps are
    /// pinned to their axis.
    pub fn is_reshapable(&self) -> bool {
        !self.opcode.is_sweep() && self.views().all(|v| v.is_reshapable())
    }

    /// Applies `shape` to every view operand with row-major strides.
    pub fn reshape(&mut self, shape: &[i64]) {
        debug_assert!(self.is_reshapable());
        for op in self.operands.iter_mut() {
            if let Some(v) = op.view_mut() {
                v.reshape(shape);
            }
        }
    }

    /// Front-end sanity checks; a failure is a fatal batch error.
    pub fn validate(&self) -> Result<()> {
        if self.operands.len() != self.opcode.nop() {
            return Err(EngineError::MalformedInstruction(format!(
                "{} takes {} operands, got {}",
                self.opcode.name(),
                self.opcode.nop(),
                self.operands.len()
            )));
        }
        if self.opcode.is_sweep() {
            let axis = self.sweep_axis().ok_or_else(|| {
                EngineError::MalformedInstruction(format!(
                    "{} carries no valid axis constant",
                    self.opcode.name()
                ))
            })?;
            let out = self.operands[0].view().ok_or_else(|| {
                EngineError::MalformedInstruction(format!(
                    "{} output must be a view",
                    self.opcode.name()
                ))
            })?;
            let input = self.operands[1].view().ok_or_else(|| {
                EngineError::MalformedInstruction(format!(
                    "{} input must be a view",
                    self.opcode.name()
                ))
            })?;
            if axis >= input.ndim() {
                return Err(EngineError::MalformedInstruction(format!(
                    "{} axis {} out of range for a {}-d input",
                    self.opcode.name(),
                    axis,
                    input.ndim()
                )));
            }
            if out.dtype() != input.dtype() {
                return Err(EngineError::MalformedInstruction(format!(
                    "{} output type {:?} does not match input type {:?}",
                    self.opcode.name(),
                    out.dtype(),
                    input.dtype()
                )));
            }
        }
        Ok(())
    }
}

impl std::fmt::Display for Instruction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.opcode.name())?;
        for op in &self.operands {
            write!(f, " {}", op)?;
        }
        Ok(())
    }
}

/// Shared instruction handle with pointer identity, so sweep sets and block
/// leaves can refer to the same instruction.
#[derive(Clone)]
pub struct InstrPtr(pub Rc<Instruction>);

impl InstrPtr {
    pub fn new(instr: Instruction) -> Self {
        InstrPtr(Rc::new(instr))
    }
}

impl Deref for InstrPtr {
    type Target = Instruction;

    fn deref(&self) -> &Instruction {
        &self.0
    }
}

impl PartialEq for InstrPtr {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }
}

impl Eq for InstrPtr {}

impl std::hash::Hash for InstrPtr {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        (Rc::as_ptr(&self.0) as usize).hash(state);
    }
}

impl std::fmt::Debug for InstrPtr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}
