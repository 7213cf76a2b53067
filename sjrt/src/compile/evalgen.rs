//! The reference backend: executes method graphs against real frame memory.
//!
//! This stands in for the out-of-scope native emitter. It consumes the
//! finished graph exactly as an emitter would, and every slot and field
//! access it performs goes through the registered frame layout, so the
//! memory the interpreter observes is bit-for-bit what emitted code would
//! have produced. Division and overflow are the host machine's; no checks
//! are added that interpretation would not also hit.

use std::sync::Arc;

use libc::c_void;

use super::{
    graph_builder,
    ir::{ArithOp, CondOp, Inst, MethodGraph, Operand, Term},
    vm_state::StateConfig,
    CompilationError, CompiledMethod, Compiler,
};
use crate::{
    bytecode::{Value, VALUE_SIZE},
    frame::{Frame, FrameField, FrameLayout},
    log,
    method::MethodIdx,
    vm::{VMError, VM},
};

/// The default backend.
pub(crate) struct EvalGen {
    cfg: StateConfig,
}

impl EvalGen {
    pub(crate) fn new() -> Self {
        Self {
            cfg: StateConfig::default(),
        }
    }

    #[cfg(test)]
    pub(crate) fn with_config(cfg: StateConfig) -> Self {
        Self { cfg }
    }
}

impl Compiler for EvalGen {
    fn compile(
        &self,
        vm: &VM,
        midx: MethodIdx,
    ) -> Result<Arc<dyn CompiledMethod>, CompilationError> {
        let graph = graph_builder::build(vm, midx, self.cfg)?;
        log::log_ir(graph.name(), &graph.to_string());
        Ok(Arc::new(EvalledMethod {
            graph,
            layout: FrameLayout::registered(),
        }))
    }
}

/// A compiled method in directly-evaluable form.
#[derive(Debug)]
struct EvalledMethod {
    graph: MethodGraph,
    layout: FrameLayout,
}

impl CompiledMethod for EvalledMethod {
    fn entry(&self) -> *const c_void {
        self as *const EvalledMethod as *const c_void
    }

    fn invoke(&self, vm: &VM, frame: &mut Frame) -> Result<Value, VMError> {
        // One cell per arena instruction; written each time its defining
        // instruction executes.
        let mut vals: Vec<Option<Value>> = vec![None; self.graph.num_insts()];
        let mut cur = self.graph.entry();
        loop {
            let block = self.graph.block(cur).ok_or_else(|| {
                VMError::Internal(format!("{}: control reached unbuilt block {cur}", self.graph.name()))
            })?;
            for idx in &block.code {
                let v = self.exec(vm, frame, &vals, self.graph.inst(*idx))?;
                vals[usize::from(*idx)] = v;
            }
            match block.term {
                Term::Goto(target) => cur = target,
                Term::Branch {
                    cond,
                    lhs,
                    rhs,
                    taken,
                    fallthrough,
                } => {
                    let l = operand(&vals, lhs);
                    let r = operand(&vals, rhs);
                    let hit = match cond {
                        CondOp::Less => l < r,
                        CondOp::Greater => l > r,
                    };
                    cur = if hit { taken } else { fallthrough };
                }
                Term::Ret { val } => return Ok(operand(&vals, val)),
            }
        }
    }
}

/// Resolve an operand against the value table.
fn operand(vals: &[Option<Value>], op: Operand) -> Value {
    match op {
        Operand::Const(v) => v,
        // unwrap safe: the builder only emits operands whose defining
        // instruction executes on every path before the use.
        Operand::Inst(i) => vals[usize::from(i)].unwrap(),
    }
}

impl EvalledMethod {
    fn field_ptr(&self, frame: &mut Frame, field: FrameField) -> *mut u8 {
        let base = frame as *mut Frame as *mut u8;
        // Safe: the layout was registered from this very record type.
        unsafe { base.add(self.layout.offset(field)) }
    }

    fn load_field(&self, frame: &mut Frame, field: FrameField) -> Value {
        let p = self.field_ptr(frame, field);
        unsafe {
            match field {
                FrameField::SavedPc => Value::from(*(p as *const i32)),
                FrameField::Kind => Value::from(*(p as *const u8)),
                _ => *(p as *const *mut Value) as usize as Value,
            }
        }
    }

    fn store_field(&self, frame: &mut Frame, field: FrameField, v: Value) {
        let p = self.field_ptr(frame, field);
        unsafe {
            match field {
                FrameField::SavedPc => *(p as *mut i32) = v as i32,
                FrameField::Kind => *(p as *mut u8) = v as u8,
                _ => *(p as *mut *mut Value) = v as usize as *mut Value,
            }
        }
    }

    /// Execute one instruction, returning the value it defines (if any).
    fn exec(
        &self,
        vm: &VM,
        frame: &mut Frame,
        vals: &[Option<Value>],
        inst: &Inst,
    ) -> Result<Option<Value>, VMError> {
        let v = match inst {
            Inst::Const(v) => Some(*v),
            Inst::LoadField(field) => Some(self.load_field(frame, *field)),
            Inst::StoreField { field, val } => {
                let v = operand(vals, *val);
                self.store_field(frame, *field, v);
                None
            }
            Inst::PtrAdd { base, slots } => {
                let b = operand(vals, *base);
                Some(b.wrapping_add(Value::from(*slots) * VALUE_SIZE as Value))
            }
            Inst::Load { base, idx } => {
                let b = operand(vals, *base) as usize as *const Value;
                Some(unsafe { b.offset(*idx as isize).read() })
            }
            Inst::Store { base, idx, val } => {
                let b = operand(vals, *base) as usize as *mut Value;
                let v = operand(vals, *val);
                unsafe { b.offset(*idx as isize).write(v) };
                None
            }
            Inst::BinOp { op, lhs, rhs } => {
                let l = operand(vals, *lhs);
                let r = operand(vals, *rhs);
                Some(match op {
                    ArithOp::Add => l.wrapping_add(r),
                    ArithOp::Sub => l.wrapping_sub(r),
                    ArithOp::Mul => l.wrapping_mul(r),
                    // Divide-by-zero faults here exactly as it does in the
                    // interpreter loop.
                    ArithOp::Div => l.wrapping_div(r),
                })
            }
            Inst::Call { target } => {
                vm.call(*target, frame)?;
                None
            }
        };
        Ok(v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        bytecode::Opcode,
        compile::vm_state::Policy,
        frame::FrameKind,
        method::Method,
        testing,
        vm::VMBuilder,
    };

    fn op(o: Opcode) -> u8 {
        o as u8
    }

    fn invoke_compiled(vm: &crate::vm::VM, midx: MethodIdx, cfg: StateConfig, args: &[Value]) -> Value {
        let cm = EvalGen::with_config(cfg).compile(vm, midx).unwrap();
        let mut frame = Frame::boxed(vm.method(midx).bytecode(), FrameKind::Jitted);
        for (i, a) in args.iter().enumerate() {
            frame.set_local(i, *a);
        }
        cm.invoke(vm, &mut frame).unwrap()
    }

    #[test]
    fn add_returns_eight() {
        let mut vm = VMBuilder::new().build();
        let idx = vm.add_method(testing::add_method());
        assert_eq!(invoke_compiled(&vm, idx, StateConfig::default(), &[]), 8);
    }

    #[test]
    fn entry_is_stable_and_non_null() {
        let mut vm = VMBuilder::new().build();
        let idx = vm.add_method(testing::add_method());
        let cm = EvalGen::new().compile(&vm, idx).unwrap();
        assert!(!cm.entry().is_null());
        assert_eq!(cm.entry(), cm.entry());
    }

    #[test]
    fn every_policy_pairing_agrees_with_the_interpreter() {
        let configs = [
            StateConfig::default(),
            StateConfig {
                stack: Policy::Immediate,
                locals: Policy::Immediate,
            },
            StateConfig {
                stack: Policy::Cached,
                locals: Policy::Cached,
            },
            StateConfig {
                stack: Policy::Immediate,
                locals: Policy::Cached,
            },
        ];
        let mut vm = VMBuilder::new().build();
        let fib = vm.add_method(testing::fib_method(0));
        let iter_fib = vm.add_method(testing::iter_fib_method());
        for cfg in configs {
            assert_eq!(invoke_compiled(&vm, fib, cfg, &[10]), 55);
            assert_eq!(invoke_compiled(&vm, iter_fib, cfg, &[10]), 55);
        }
        // And normal dispatch through the VM agrees.
        assert_eq!(vm.invoke(fib, &[10]).unwrap(), 55);
        assert_eq!(vm.invoke(iter_fib, &[10]).unwrap(), 55);
    }

    #[test]
    fn round_trip_through_frame_memory() {
        // The callee's result reaches the caller only through frame memory:
        // the callee pushes it onto the caller's stack and the compiled
        // caller re-reads that slot. 7 + 1 only comes out right if the
        // commit/resynchronize sequence around the call is bit-preserving.
        let mut vm = VMBuilder::new().build();
        let one = vm.add_method(Method::new(
            "one",
            vec![op(Opcode::PushConstant), 1, op(Opcode::Ret)],
            0,
        ));
        let bc = vec![
            op(Opcode::PushConstant),
            7,
            op(Opcode::Call),
            u8::try_from(usize::from(one)).unwrap(),
            op(Opcode::Add),
            op(Opcode::Ret),
        ];
        let caller = vm.add_method(Method::new("caller", bc, 0));
        assert_eq!(invoke_compiled(&vm, caller, StateConfig::default(), &[]), 8);
    }

    #[test]
    fn saved_pc_written_at_call_sites() {
        let mut vm = VMBuilder::new().build();
        let one = vm.add_method(Method::new(
            "one",
            vec![op(Opcode::PushConstant), 1, op(Opcode::Ret)],
            0,
        ));
        let bc = vec![
            op(Opcode::PushConstant),
            7,
            op(Opcode::Call),
            u8::try_from(usize::from(one)).unwrap(),
            op(Opcode::Ret),
        ];
        let caller = vm.add_method(Method::new("caller", bc, 0));
        let cm = EvalGen::new().compile(&vm, caller).unwrap();
        let mut frame = Frame::boxed(vm.method(caller).bytecode(), FrameKind::Jitted);
        cm.invoke(&vm, &mut frame).unwrap();
        // The call lives at offset 2.
        assert_eq!(frame.saved_pc(), 2);
    }
}
