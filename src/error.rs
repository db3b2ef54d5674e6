//! Error type for batch execution.

use std::path::PathBuf;

use crate::dtype::DType;
use crate::instruction::Opcode;

/// Fatal batch errors. There is no recovery within a batch; every variant
/// surfaces to the caller with the batch boundary intact.
#[derive(Debug)]
pub enum EngineError {
    /// The front end handed over an instruction the engine cannot make
    /// sense of (wrong operand count, mismatched reduction types, ...).
    MalformedInstruction(String),
    /// The scalar kernel table has no entry for this (opcode, type) pair.
    UnsupportedOperation { opcode: Opcode, dtype: DType },
    /// Out of memory while allocating a base of the given byte size.
    AllocationFailed(usize),
    /// The C compiler rejected a generated kernel. The offending source is
    /// kept on disk for debugging.
    CompileFailed {
        diagnostics: String,
        source_path: PathBuf,
    },
    /// The compiled shared object could not be loaded or lacks `launcher`.
    LoadFailed(String),
    Io(std::io::Error),
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::MalformedInstruction(s) => write!(f, "malformed instruction: {}", s),
            EngineError::UnsupportedOperation { opcode, dtype } => {
                write!(f, "unsupported operation: {:?} on {:?}", opcode, dtype)
            }
            EngineError::AllocationFailed(size) => {
                write!(f, "failed to allocate base of {} bytes", size)
            }
            EngineError::CompileFailed {
                diagnostics,
                source_path,
            } => write!(
                f,
                "kernel compilation failed (source kept at {}):\n{}",
                source_path.display(),
                diagnostics
            ),
            EngineError::LoadFailed(s) => write!(f, "failed to load compiled kernel: {}", s),
            EngineError::Io(e) => write!(f, "i/o error: {}", e),
        }
    }
}

impl std::error::Error for EngineError {}

impl From<std::io::Error> for EngineError {
    fn from(e: std::io::Error) -> Self {
        EngineError::Io(e)
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
