//! The compile-time model of the running interpreter's operand stack and
//! locals array.
//!
//! Each container is bound to one Backing Location: a pointer-typed field of
//! the frame record (`sp` for the stack, `locals` for the array). Whatever a
//! container does at compile time, the emitted code's final effect on that
//! field and the memory it points at must be indistinguishable from direct
//! interpretation. Two write policies exist; see [Policy].

use super::{
    ir::{Inst, IrSink, InstIdx, Operand},
    CompilationError,
};
use crate::frame::FrameField;

/// How a container keeps its Backing Location in sync.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) enum Policy {
    /// Every push/pop/get/set reads or writes frame memory as it happens.
    /// Required when interpreted and compiled code may interleave
    /// observation of the same memory between commit points.
    Immediate,
    /// Values are tracked at compile time and only written out on
    /// [AbstractState::commit]. Cheaper, but a commit must precede any
    /// boundary where an external observer might read the frame.
    Cached,
}

/// Which write policy each container of a translation uses.
#[derive(Copy, Clone, Debug)]
pub(crate) struct StateConfig {
    pub(crate) stack: Policy,
    pub(crate) locals: Policy,
}

impl Default for StateConfig {
    /// The interpreter's own configuration: the stack is flushed at
    /// boundaries, the locals array writes straight through.
    fn default() -> Self {
        Self {
            stack: Policy::Cached,
            locals: Policy::Immediate,
        }
    }
}

/// A tracked slot: a value known at compile time, or "whatever the frame
/// memory currently holds".
#[derive(Clone, Debug)]
enum Slot {
    Val(Operand),
    Mem,
}

/// The abstract operand stack.
///
/// `base` is the value of the `sp` field at method entry. A method
/// activation starts with an empty stack, so slot `i` always lives at
/// `base + i` slots regardless of policy; the field itself is kept equal to
/// `base + depth`.
#[derive(Clone, Debug)]
pub(crate) struct OperandStack {
    base: InstIdx,
    policy: Policy,
    /// Compile-time depth, in slots.
    depth: usize,
    /// Tracked slots; only populated under [Policy::Cached].
    slots: Vec<Slot>,
}

impl OperandStack {
    fn new(base: InstIdx, policy: Policy) -> Self {
        Self {
            base,
            policy,
            depth: 0,
            slots: Vec::new(),
        }
    }

    pub(crate) fn depth(&self) -> usize {
        self.depth
    }

    fn base_op(&self) -> Operand {
        Operand::Inst(self.base)
    }

    /// Write the `sp` field: `base + depth` slots.
    fn emit_sp_update(&self, sink: &mut IrSink) -> Result<(), CompilationError> {
        let p = sink.emit(Inst::PtrAdd {
            base: self.base_op(),
            slots: i32::try_from(self.depth)
                .map_err(|_| CompilationError::LimitExceeded("stack depth".into()))?,
        })?;
        sink.emit(Inst::StoreField {
            field: FrameField::Sp,
            val: Operand::Inst(p),
        })?;
        Ok(())
    }

    pub(crate) fn push(&mut self, sink: &mut IrSink, val: Operand) -> Result<(), CompilationError> {
        match self.policy {
            Policy::Cached => self.slots.push(Slot::Val(val)),
            Policy::Immediate => {
                sink.emit(Inst::Store {
                    base: self.base_op(),
                    idx: self.depth as i32,
                    val,
                })?;
            }
        }
        self.depth += 1;
        if self.policy == Policy::Immediate {
            self.emit_sp_update(sink)?;
        }
        Ok(())
    }

    pub(crate) fn pop(&mut self, sink: &mut IrSink) -> Result<Operand, CompilationError> {
        if self.depth == 0 {
            return Err(CompilationError::General("operand stack underflow".into()));
        }
        self.depth -= 1;
        match self.policy {
            // unwrap safe: under Cached, `slots.len()` always equals the
            // pre-decrement depth, which was checked non-zero above.
            Policy::Cached => match self.slots.pop().unwrap() {
                Slot::Val(v) => Ok(v),
                Slot::Mem => {
                    let l = sink.emit(Inst::Load {
                        base: self.base_op(),
                        idx: self.depth as i32,
                    })?;
                    Ok(Operand::Inst(l))
                }
            },
            Policy::Immediate => {
                let l = sink.emit(Inst::Load {
                    base: self.base_op(),
                    idx: self.depth as i32,
                })?;
                self.emit_sp_update(sink)?;
                Ok(Operand::Inst(l))
            }
        }
    }

    /// Discard `n` slots. A negative `n` grows the visible window: the
    /// revealed slots' contents come from frame memory. That is the
    /// convention a caller uses to adopt values some other party has already
    /// placed on its stack, not an error.
    pub(crate) fn drop_items(&mut self, sink: &mut IrSink, n: isize) -> Result<(), CompilationError> {
        // The depth is bounded by the bytecode length, so the cast is exact.
        let new_depth = self.depth as isize - n;
        if new_depth < 0 {
            return Err(CompilationError::General(
                "operand stack underflow (drop)".into(),
            ));
        }
        let new_depth = new_depth as usize;
        if self.policy == Policy::Cached {
            if new_depth <= self.depth {
                self.slots.truncate(new_depth);
            } else {
                self.slots.resize(new_depth, Slot::Mem);
            }
        }
        self.depth = new_depth;
        if self.policy == Policy::Immediate {
            self.emit_sp_update(sink)?;
        }
        Ok(())
    }

    /// Flush every tracked value into its slot and bring the `sp` field up
    /// to date. Repeated commits without intervening mutation are redundant
    /// but harmless.
    pub(crate) fn commit(&mut self, sink: &mut IrSink) -> Result<(), CompilationError> {
        if self.policy == Policy::Cached {
            for (i, slot) in self.slots.iter().enumerate() {
                if let Slot::Val(v) = slot {
                    sink.emit(Inst::Store {
                        base: self.base_op(),
                        idx: i as i32,
                        val: *v,
                    })?;
                }
            }
            self.emit_sp_update(sink)?;
        }
        Ok(())
    }

    /// Re-read every slot from frame memory, dropping compile-time
    /// tracking. Used when an external operation may have written the
    /// stack.
    pub(crate) fn reload(&mut self, sink: &mut IrSink) -> Result<(), CompilationError> {
        if self.policy == Policy::Cached {
            self.slots.clear();
            for i in 0..self.depth {
                let l = sink.emit(Inst::Load {
                    base: self.base_op(),
                    idx: i as i32,
                })?;
                self.slots.push(Slot::Val(Operand::Inst(l)));
            }
        }
        Ok(())
    }

    /// Forget tracked values but keep the depth: every slot becomes
    /// memory-resident and will be loaded lazily where it is next used. The
    /// committed memory image must already be current.
    pub(crate) fn demote(&mut self) {
        if self.policy == Policy::Cached {
            self.slots.clear();
            self.slots.resize(self.depth, Slot::Mem);
        }
    }

    /// Resynchronize after a call: the callee consumed `argc` slots and
    /// pushed one result, all through frame memory (the call helper also
    /// updated the `sp` field, so nothing needs emitting here).
    pub(crate) fn refresh_after_call(&mut self, argc: usize) -> Result<(), CompilationError> {
        if self.depth < argc {
            return Err(CompilationError::General(format!(
                "call needs {argc} operands but the stack holds {}",
                self.depth
            )));
        }
        self.depth = self.depth - argc + 1;
        if self.policy == Policy::Cached {
            self.slots.truncate(self.depth - 1);
            self.slots.push(Slot::Mem);
        }
        Ok(())
    }
}

/// The abstract locals array.
///
/// `base` is the value of the `locals` field at method entry; slot `i`
/// lives at `base + i` slots.
#[derive(Clone, Debug)]
pub(crate) struct LocalsArray {
    base: InstIdx,
    policy: Policy,
    len: usize,
    /// Tracked values (Cached only); `Mem` means frame memory is current.
    slots: Vec<Slot>,
    /// Tracked values not yet written back (Cached only).
    dirty: Vec<bool>,
}

impl LocalsArray {
    fn new(base: InstIdx, policy: Policy, len: usize) -> Self {
        Self {
            base,
            policy,
            len,
            slots: vec![Slot::Mem; len],
            dirty: vec![false; len],
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }

    fn base_op(&self) -> Operand {
        Operand::Inst(self.base)
    }

    fn check(&self, idx: usize) -> Result<(), CompilationError> {
        if idx >= self.len {
            return Err(CompilationError::General(format!(
                "local index {idx} out of range (array holds {})",
                self.len
            )));
        }
        Ok(())
    }

    pub(crate) fn get(
        &mut self,
        sink: &mut IrSink,
        idx: usize,
    ) -> Result<Operand, CompilationError> {
        self.check(idx)?;
        match self.policy {
            Policy::Immediate => {
                let l = sink.emit(Inst::Load {
                    base: self.base_op(),
                    idx: idx as i32,
                })?;
                Ok(Operand::Inst(l))
            }
            Policy::Cached => match self.slots[idx] {
                Slot::Val(v) => Ok(v),
                Slot::Mem => {
                    let l = sink.emit(Inst::Load {
                        base: self.base_op(),
                        idx: idx as i32,
                    })?;
                    self.slots[idx] = Slot::Val(Operand::Inst(l));
                    Ok(Operand::Inst(l))
                }
            },
        }
    }

    pub(crate) fn set(
        &mut self,
        sink: &mut IrSink,
        idx: usize,
        val: Operand,
    ) -> Result<(), CompilationError> {
        self.check(idx)?;
        match self.policy {
            Policy::Immediate => {
                sink.emit(Inst::Store {
                    base: self.base_op(),
                    idx: idx as i32,
                    val,
                })?;
            }
            Policy::Cached => {
                self.slots[idx] = Slot::Val(val);
                self.dirty[idx] = true;
            }
        }
        Ok(())
    }

    /// Write back every dirty tracked value. Idempotent.
    pub(crate) fn commit(&mut self, sink: &mut IrSink) -> Result<(), CompilationError> {
        if self.policy == Policy::Cached {
            for (i, slot) in self.slots.iter().enumerate() {
                if self.dirty[i] {
                    if let Slot::Val(v) = slot {
                        sink.emit(Inst::Store {
                            base: self.base_op(),
                            idx: i as i32,
                            val: *v,
                        })?;
                    }
                }
            }
            self.dirty.iter_mut().for_each(|d| *d = false);
        }
        Ok(())
    }

    /// Re-read every local from frame memory.
    pub(crate) fn reload(&mut self, sink: &mut IrSink) -> Result<(), CompilationError> {
        if self.policy == Policy::Cached {
            for i in 0..self.len {
                let l = sink.emit(Inst::Load {
                    base: self.base_op(),
                    idx: i as i32,
                })?;
                self.slots[i] = Slot::Val(Operand::Inst(l));
                self.dirty[i] = false;
            }
        }
        Ok(())
    }

    /// Forget tracked values; frame memory becomes the source of truth.
    pub(crate) fn demote(&mut self) {
        if self.policy == Policy::Cached {
            self.slots.iter_mut().for_each(|s| *s = Slot::Mem);
            self.dirty.iter_mut().for_each(|d| *d = false);
        }
    }
}

/// A snapshot of both containers at one program point.
#[derive(Clone, Debug)]
pub(crate) struct AbstractState {
    pub(crate) stack: OperandStack,
    pub(crate) locals: LocalsArray,
}

impl AbstractState {
    /// Create the method-entry state. Each container's backing field is
    /// loaded once here; those base pointers anchor all later slot
    /// addressing.
    pub(crate) fn entry(
        sink: &mut IrSink,
        cfg: StateConfig,
        locals_len: usize,
    ) -> Result<Self, CompilationError> {
        let sp_base = sink.emit(Inst::LoadField(FrameField::Sp))?;
        let locals_base = sink.emit(Inst::LoadField(FrameField::Locals))?;
        Ok(Self {
            stack: OperandStack::new(sp_base, cfg.stack),
            locals: LocalsArray::new(locals_base, cfg.locals, locals_len),
        })
    }

    /// Emit writes bringing every Backing Location up to date.
    pub(crate) fn commit(&mut self, sink: &mut IrSink) -> Result<(), CompilationError> {
        self.stack.commit(sink)?;
        self.locals.commit(sink)
    }

    /// Re-read every Backing Location; used when an external operation may
    /// have changed memory.
    pub(crate) fn reload(&mut self, sink: &mut IrSink) -> Result<(), CompilationError> {
        self.stack.reload(sink)?;
        self.locals.reload(sink)
    }

    /// An independent snapshot: shares no mutable sub-state with `self`.
    pub(crate) fn make_copy(&self) -> Self {
        self.clone()
    }

    /// A snapshot for a control-flow join. Committed memory is the only
    /// thing every predecessor agrees on, so tracked values demote to
    /// memory-resident form.
    pub(crate) fn make_join_copy(&self) -> Self {
        let mut copy = self.clone();
        copy.stack.demote();
        copy.locals.demote();
        copy
    }

    /// Reconcile this state with the state already recorded at the same
    /// offset. Pure bookkeeping unless the shapes diverge, which is a
    /// defect in the bytecode producer, not something translation repairs.
    pub(crate) fn merge_into(&self, existing: &AbstractState) -> Result<(), CompilationError> {
        if self.stack.depth() != existing.stack.depth() {
            return Err(CompilationError::General(format!(
                "operand stack depth mismatch at join: {} vs {}",
                self.stack.depth(),
                existing.stack.depth()
            )));
        }
        if self.locals.len() != existing.locals.len() {
            return Err(CompilationError::InternalError(
                "locals shape changed between predecessors".into(),
            ));
        }
        Ok(())
    }
}
