//! Veld: a just-in-time execution engine for array bytecode.
//!
//! A front end hands over flat batches of instructions on strided
//! n-dimensional views. The engine fuses them into nested loop blocks,
//! emits C source for the fused nests, compiles it at runtime into a
//! shared object, and invokes it with the live data pointers.
//!
//! # Example
//!
//! ```no_run
//! use veld::prelude::*;
//!
//! let mut engine = Engine::new(EngineConfig::default()).unwrap();
//!
//! // sum(a) for a = [0, 1, ..., 9]
//! let a = BaseHandle::new(DType::Float64, 10);
//! a.copy_from_slice(&(0..10).map(|i| i as f64).collect::<Vec<_>>()).unwrap();
//! let s = BaseHandle::new(DType::Float64, 1);
//!
//! engine.execute(vec![Instruction::sweep(
//!     Opcode::AddReduce,
//!     View::contiguous(&s, &[1]),
//!     View::contiguous(&a, &[10]),
//!     0,
//! )]).unwrap();
//!
//! assert_eq!(s.to_vec::<f64>(), vec![45.0]);
//! ```

pub mod base;
pub mod basedb;
pub mod block;
pub mod codegen;
pub mod config;
pub mod dtype;
pub mod engine;
pub mod error;
pub mod fuser;
pub mod graph;
pub mod instruction;
pub mod kernel;
pub mod store;
pub mod view;

pub use base::BaseHandle;
pub use config::EngineConfig;
pub use dtype::{ConstVal, DType, Scalar};
pub use engine::Engine;
pub use error::{EngineError, Result};
pub use instruction::{Instruction, Opcode};
pub use view::{Operand, View};

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::base::BaseHandle;
    pub use crate::config::EngineConfig;
    pub use crate::dtype::{ConstVal, DType};
    pub use crate::engine::Engine;
    pub use crate::instruction::{Instruction, Opcode};
    pub use crate::view::{Operand, View};
}
