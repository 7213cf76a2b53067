//! The translation seam: failure taxonomy, the backend traits and the
//! default backend.

use std::{fmt, sync::Arc};

use libc::c_void;
use thiserror::Error;

use crate::{
    bytecode::Value,
    frame::Frame,
    method::MethodIdx,
    vm::{VMError, VM},
};

pub(crate) mod evalgen;
pub(crate) mod graph_builder;
pub(crate) mod ir;
pub(crate) mod vm_state;

/// A failure to translate a method. Failures are total: no partial graph is
/// kept and no entry point is installed.
#[derive(Debug, Error)]
pub enum CompilationError {
    /// The bytecode producer broke its contract (unbalanced stack at a
    /// join, a branch into the middle of an instruction, a bad index).
    /// Interesting to whoever generated the bytecode, not to the end user
    /// running it.
    #[error("general error: {0}")]
    General(String),
    /// An opcode this translator has no handler for.
    #[error("unsupported opcode {opcode:#04x} at offset {off}")]
    UnsupportedOpcode { off: usize, opcode: u8 },
    /// Something went wrong that is probably a bug in the translator.
    #[error("internal error: {0}")]
    InternalError(String),
    /// A limit was exceeded (e.g. a graph grew past what its index type can
    /// name).
    #[error("limit exceeded: {0}")]
    LimitExceeded(String),
}

/// The trait every backend consuming finished method graphs must implement.
pub trait Compiler: Send + Sync {
    /// Translate `midx` into something executable, or fail totally.
    fn compile(
        &self,
        vm: &VM,
        midx: MethodIdx,
    ) -> Result<Arc<dyn CompiledMethod>, CompilationError>;
}

/// An executable compiled method.
pub trait CompiledMethod: fmt::Debug + Send + Sync {
    /// The entry point address, as handed to dispatch tables.
    fn entry(&self) -> *const c_void;

    /// Execute against `frame`, returning the method's result.
    fn invoke(&self, vm: &VM, frame: &mut Frame) -> Result<Value, VMError>;
}

pub(crate) fn default_compiler() -> Arc<dyn Compiler> {
    Arc::new(evalgen::EvalGen::new())
}
