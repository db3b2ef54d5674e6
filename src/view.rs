//! Strided windows over bases.

use crate::base::BaseHandle;
use crate::dtype::{ConstVal, DType};

/// A strided n-dimensional window over a base. Strides are in elements.
#[derive(Debug, Clone, PartialEq)]
pub struct View {
    pub base: BaseHandle,
    pub start: i64,
    pub shape: Vec<i64>,
    pub stride: Vec<i64>,
}

impl View {
    /// A full row-major view covering the whole base with the given shape.
    pub fn contiguous(base: &BaseHandle, shape: &[i64]) -> Self {
        let stride = row_major_strides(shape);
        View {
            base: base.clone(),
            start: 0,
            shape: shape.to_vec(),
            stride,
        }
    }

    pub fn ndim(&self) -> usize {
        self.shape.len()
    }

    pub fn nelem(&self) -> i64 {
        self.shape.iter().product()
    }

    pub fn dtype(&self) -> DType {
        self.base.dtype()
    }

    /// A view is reshapable iff its strides are the standard row-major
    /// layout of its shape, i.e. it is logically contiguous in its base.
    pub fn is_reshapable(&self) -> bool {
        self.stride == row_major_strides(&self.shape)
    }

    /// Replaces the shape with `shape`, keeping base and start and taking
    /// row-major strides. Only meaningful on reshapable views.
    pub fn reshape(&mut self, shape: &[i64]) {
        debug_assert_eq!(self.nelem(), shape.iter().product::<i64>());
        self.stride = row_major_strides(shape);
        self.shape = shape.to_vec();
    }

    /// Inserts a dimension of extent `size` and stride `stride` at `axis`.
    /// Used when a sweep output has to line up with the loop nest of its
    /// input.
    pub fn insert_dim(&mut self, axis: usize, size: i64, stride: i64) {
        self.shape.insert(axis, size);
        self.stride.insert(axis, stride);
    }
}

impl std::fmt::Display for View {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}[{}:{:?}:{:?}]",
            self.base, self.start, self.shape, self.stride
        )
    }
}

fn row_major_strides(shape: &[i64]) -> Vec<i64> {
    let mut stride = vec![1i64; shape.len()];
    for d in (0..shape.len().saturating_sub(1)).rev() {
        stride[d] = stride[d + 1] * shape[d + 1];
    }
    stride
}

/// An instruction operand: either a strided view or an inline constant.
#[derive(Debug, Clone, PartialEq)]
pub enum Operand {
    View(View),
    Const(ConstVal),
}

impl Operand {
    pub fn view(&self) -> Option<&View> {
        match self {
            Operand::View(v) => Some(v),
            Operand::Const(_) => None,
        }
    }

    pub fn view_mut(&mut self) -> Option<&mut View> {
        match self {
            Operand::View(v) => Some(v),
            Operand::Const(_) => None,
        }
    }

    pub fn is_const(&self) -> bool {
        matches!(self, Operand::Const(_))
    }

    pub fn dtype(&self) -> DType {
        match self {
            Operand::View(v) => v.dtype(),
            Operand::Const(c) => c.dtype(),
        }
    }
}

impl std::fmt::Display for Operand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Operand::View(v) => write!(f, "{}", v),
            Operand::Const(c) => write!(f, "{}", c),
        }
    }
}
