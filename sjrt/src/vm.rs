//! The virtual machine: the method table, interpreted/compiled dispatch and
//! the byte-by-byte interpreter loop.

use std::sync::Arc;

use thiserror::Error;
use typed_index_collections::TiVec;

use crate::{
    bytecode::{Opcode, Value, SENTINEL_RESULT},
    compile::{default_compiler, CompiledMethod, Compiler},
    frame::{Frame, FrameKind, LOCAL_SLOTS},
    log,
    method::{Method, MethodIdx},
};

pub type HotThreshold = usize;

/// How many interpreted invocations a method gets before it is handed to
/// the compiler.
const DEFAULT_HOT_THRESHOLD: HotThreshold = 10;

/// A fault reported while running bytecode.
#[derive(Debug, Error, PartialEq)]
pub enum VMError {
    #[error("unknown opcode {opcode:#04x} at offset {off}")]
    UnknownOpcode { off: usize, opcode: u8 },
    #[error("call target {0} out of range")]
    BadCallTarget(usize),
    #[error("method expects {expected} arguments, got {got}")]
    WrongArgCount { expected: usize, got: usize },
    #[error("internal error: {0}")]
    Internal(String),
}

/// Configure a [VM].
pub struct VMBuilder {
    hot_threshold: HotThreshold,
    compiler: Option<Arc<dyn Compiler>>,
}

impl VMBuilder {
    /// Create a builder with default parameters. `SJ_HOT_THRESHOLD` in the
    /// environment overrides the default threshold.
    pub fn new() -> Self {
        let hot_threshold = std::env::var("SJ_HOT_THRESHOLD")
            .ok()
            .and_then(|x| x.parse().ok())
            .unwrap_or(DEFAULT_HOT_THRESHOLD);
        Self {
            hot_threshold,
            compiler: None,
        }
    }

    /// Change this builder's `hot_threshold` value.
    pub fn hot_threshold(mut self, hot_threshold: HotThreshold) -> Self {
        self.hot_threshold = hot_threshold;
        self
    }

    /// Use `compiler` as the backend instead of the default one.
    pub fn compiler(mut self, compiler: Arc<dyn Compiler>) -> Self {
        self.compiler = Some(compiler);
        self
    }

    pub fn build(self) -> VM {
        VM {
            methods: TiVec::new(),
            hot_threshold: self.hot_threshold,
            compiler: self.compiler.unwrap_or_else(default_compiler),
        }
    }
}

impl Default for VMBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// The interpreter runtime: owns the method table and the JIT boundary.
pub struct VM {
    methods: TiVec<MethodIdx, Method>,
    hot_threshold: HotThreshold,
    compiler: Arc<dyn Compiler>,
}

impl VM {
    pub fn hot_threshold(&self) -> HotThreshold {
        self.hot_threshold
    }

    /// Register a method, returning the index `Call` immediates (and
    /// [VM::invoke]) name it by.
    pub fn add_method(&mut self, method: Method) -> MethodIdx {
        assert!(method.arg_count() <= LOCAL_SLOTS);
        let idx = MethodIdx::from(self.methods.len());
        self.methods.push(method);
        idx
    }

    pub(crate) fn method(&self, idx: MethodIdx) -> &Method {
        &self.methods[idx]
    }

    pub(crate) fn try_method(&self, idx: MethodIdx) -> Option<&Method> {
        self.methods.get(idx)
    }

    /// Invoke a method from outside the machine.
    pub fn invoke(&self, idx: MethodIdx, args: &[Value]) -> Result<Value, VMError> {
        let m = self
            .try_method(idx)
            .ok_or(VMError::BadCallTarget(usize::from(idx)))?;
        if args.len() != m.arg_count() {
            return Err(VMError::WrongArgCount {
                expected: m.arg_count(),
                got: args.len(),
            });
        }
        let mut frame = Frame::boxed(m.bytecode(), FrameKind::Interpreted);
        for (i, a) in args.iter().enumerate() {
            frame.set_local(i, *a);
        }
        self.dispatch(idx, &mut frame)
    }

    /// Run `idx` in `frame`: the compiled entry if one is installed,
    /// otherwise the interpreter, possibly compiling first once the method
    /// has been invoked often enough.
    pub(crate) fn dispatch(&self, idx: MethodIdx, frame: &mut Frame) -> Result<Value, VMError> {
        let m = self.method(idx);
        if let Some(cm) = m.compiled() {
            log::log_jit_state(&format!("enter-jit: {}", m.name()));
            frame.set_kind(FrameKind::Jitted);
            return cm.invoke(self, frame);
        }
        let count = m.inc_count();
        if count >= self.hot_threshold && m.is_counting() {
            log::log_jit_state(&format!("start-compiling: {}", m.name()));
            match self.compiler.compile(self, idx) {
                Ok(cm) => {
                    log::log_jit_state(&format!("compiled: {}", m.name()));
                    m.set_compiled(Arc::clone(&cm));
                    frame.set_kind(FrameKind::Jitted);
                    return cm.invoke(self, frame);
                }
                Err(e) => {
                    // A retry would fail identically: park the method on
                    // the interpreted path.
                    log::log_jit_state(&format!("compilation-failed: {}: {e}", m.name()));
                    m.set_dont_compile();
                }
            }
        }
        self.interp(idx, frame)
    }

    /// The call boundary shared by both execution modes: pop the callee's
    /// arguments off the caller's stack, run the callee in a fresh frame
    /// (interpreted or compiled, whatever it currently is), push the single
    /// result back.
    pub(crate) fn call(&self, idx: MethodIdx, caller: &mut Frame) -> Result<(), VMError> {
        let m = self
            .try_method(idx)
            .ok_or(VMError::BadCallTarget(usize::from(idx)))?;
        let mut frame = Frame::boxed(m.bytecode(), FrameKind::Interpreted);
        // The first-pushed argument becomes local 0.
        for i in (0..m.arg_count()).rev() {
            let v = caller.pop();
            frame.set_local(i, v);
        }
        frame.set_previous(caller as *mut Frame);
        let ret = self.dispatch(idx, &mut frame)?;
        caller.push(ret);
        Ok(())
    }

    /// The byte-by-byte interpreter loop.
    fn interp(&self, idx: MethodIdx, frame: &mut Frame) -> Result<Value, VMError> {
        debug_assert_eq!(frame.kind(), FrameKind::Interpreted);
        let m = self.method(idx);
        let bc = m.bytecode();
        let mut pc = 0usize;
        loop {
            let Some(&byte) = bc.get(pc) else {
                return Err(VMError::Internal(format!("pc {pc} out of range")));
            };
            let Some(opcode) = Opcode::from_byte(byte) else {
                return Err(VMError::UnknownOpcode {
                    off: pc,
                    opcode: byte,
                });
            };
            let imm = |bc: &[u8]| -> Result<u8, VMError> {
                bc.get(pc + 1)
                    .copied()
                    .ok_or_else(|| VMError::Internal(format!("truncated instruction at {pc}")))
            };
            match opcode {
                Opcode::PushConstant => {
                    frame.push(Value::from(imm(bc)? as i8));
                    pc += 2;
                }
                Opcode::Dup => {
                    let v = frame.pop();
                    frame.push(v);
                    frame.push(v);
                    pc += 1;
                }
                Opcode::Add | Opcode::Sub | Opcode::Mul | Opcode::Div => {
                    let r = frame.pop();
                    let l = frame.pop();
                    frame.push(match opcode {
                        Opcode::Add => l.wrapping_add(r),
                        Opcode::Sub => l.wrapping_sub(r),
                        Opcode::Mul => l.wrapping_mul(r),
                        // Divide-by-zero faults here exactly as it does in
                        // compiled code.
                        _ => l.wrapping_div(r),
                    });
                    pc += 1;
                }
                Opcode::Ret => {
                    return Ok(if frame.depth() == 0 {
                        SENTINEL_RESULT
                    } else {
                        frame.pop()
                    });
                }
                Opcode::Call => {
                    let target = MethodIdx::from(usize::from(imm(bc)?));
                    frame.set_saved_pc(pc as i32);
                    self.call(target, frame)?;
                    pc += 2;
                }
                Opcode::JmpL | Opcode::JmpG => {
                    let target = usize::from(imm(bc)?);
                    let r = frame.pop();
                    let l = frame.pop();
                    let hit = if opcode == Opcode::JmpL { l < r } else { l > r };
                    pc = if hit { target } else { pc + 2 };
                }
                Opcode::PushLocal => {
                    let v = frame.local(usize::from(imm(bc)?));
                    frame.push(v);
                    pc += 2;
                }
                Opcode::PopLocal => {
                    let i = usize::from(imm(bc)?);
                    let v = frame.pop();
                    frame.set_local(i, v);
                    pc += 2;
                }
                Opcode::Exit => return Ok(SENTINEL_RESULT),
            }
        }
    }
}
