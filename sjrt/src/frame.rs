//! The interpreter's per-invocation frame record, and the registered layout
//! the translator uses to address it.

use std::{mem, ptr};

use strum::Display;

use crate::bytecode::Value;

/// Capacity of a frame's operand stack, in slots.
pub(crate) const STACK_SLOTS: usize = 64;
/// Capacity of a frame's locals array, in slots.
pub(crate) const LOCAL_SLOTS: usize = 16;

/// Who is executing a frame right now.
#[repr(u8)]
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum FrameKind {
    Interpreted = 0,
    Jitted,
}

/// One method activation's memory record.
///
/// Both the interpreter and compiled code read and write the same record:
/// the `sp` and `locals` fields are the Backing Locations the translator's
/// abstract state must stay consistent with. The layout is fixed (`repr(C)`)
/// so that field offsets reported by [FrameLayout] mean the same thing to
/// everyone.
#[repr(C)]
pub struct Frame {
    /// The running method's bytecode.
    bytecode: *const u8,
    /// The bytecode offset saved when this frame makes a call.
    saved_pc: i32,
    kind: FrameKind,
    /// One past the top of the operand stack.
    sp: *mut Value,
    /// Base of the locals array.
    locals: *mut Value,
    /// The caller's frame, or null for a top-level activation.
    previous: *mut Frame,
    stack: [Value; STACK_SLOTS],
    slots: [Value; LOCAL_SLOTS],
}

impl Frame {
    /// Allocate a fresh frame for `bytecode`. The stack starts empty and
    /// every local starts zeroed; `sp`/`locals` point into the frame's own
    /// arrays, which is why the frame is boxed before they are wired up.
    pub fn boxed(bytecode: &[u8], kind: FrameKind) -> Box<Frame> {
        let mut f = Box::new(Frame {
            bytecode: bytecode.as_ptr(),
            saved_pc: 0,
            kind,
            sp: ptr::null_mut(),
            locals: ptr::null_mut(),
            previous: ptr::null_mut(),
            stack: [0; STACK_SLOTS],
            slots: [0; LOCAL_SLOTS],
        });
        f.sp = f.stack.as_mut_ptr();
        f.locals = f.slots.as_mut_ptr();
        f
    }

    /// Current operand stack depth, in slots.
    pub(crate) fn depth(&self) -> usize {
        // Safe: `sp` only ever points into (or one past) `stack`.
        usize::try_from(unsafe { self.sp.offset_from(self.stack.as_ptr()) }).unwrap()
    }

    pub(crate) fn push(&mut self, v: Value) {
        assert!(self.depth() < STACK_SLOTS, "operand stack overflow");
        unsafe {
            self.sp.write(v);
            self.sp = self.sp.add(1);
        }
    }

    pub(crate) fn pop(&mut self) -> Value {
        assert!(self.depth() > 0, "operand stack underflow");
        unsafe {
            self.sp = self.sp.sub(1);
            self.sp.read()
        }
    }

    pub(crate) fn local(&self, idx: usize) -> Value {
        assert!(idx < LOCAL_SLOTS);
        unsafe { self.locals.add(idx).read() }
    }

    pub(crate) fn set_local(&mut self, idx: usize, v: Value) {
        assert!(idx < LOCAL_SLOTS);
        unsafe { self.locals.add(idx).write(v) }
    }

    pub(crate) fn saved_pc(&self) -> i32 {
        self.saved_pc
    }

    pub(crate) fn set_saved_pc(&mut self, pc: i32) {
        self.saved_pc = pc;
    }

    pub(crate) fn kind(&self) -> FrameKind {
        self.kind
    }

    pub(crate) fn set_kind(&mut self, kind: FrameKind) {
        self.kind = kind;
    }

    pub(crate) fn set_previous(&mut self, previous: *mut Frame) {
        self.previous = previous;
    }
}

/// A named field of the frame record: what the translator knows a Backing
/// Location as.
#[derive(Copy, Clone, Debug, Display, Eq, PartialEq)]
#[strum(serialize_all = "snake_case")]
pub enum FrameField {
    Bytecode,
    SavedPc,
    Kind,
    Sp,
    Locals,
    Previous,
}

/// Byte offsets of the frame record's fields, as reported by struct
/// registration. Compiled code may only address a frame through these.
#[derive(Copy, Clone, Debug)]
pub struct FrameLayout {
    bytecode: usize,
    saved_pc: usize,
    kind: usize,
    sp: usize,
    locals: usize,
    previous: usize,
}

impl FrameLayout {
    /// The layout of [Frame] as registered with the compiler.
    pub fn registered() -> Self {
        Self {
            bytecode: mem::offset_of!(Frame, bytecode),
            saved_pc: mem::offset_of!(Frame, saved_pc),
            kind: mem::offset_of!(Frame, kind),
            sp: mem::offset_of!(Frame, sp),
            locals: mem::offset_of!(Frame, locals),
            previous: mem::offset_of!(Frame, previous),
        }
    }

    /// The byte offset of `field` from the frame's base address.
    pub fn offset(&self, field: FrameField) -> usize {
        match field {
            FrameField::Bytecode => self.bytecode,
            FrameField::SavedPc => self.saved_pc,
            FrameField::Kind => self.kind,
            FrameField::Sp => self.sp,
            FrameField::Locals => self.locals,
            FrameField::Previous => self.previous,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_pop() {
        let bc = [0u8];
        let mut f = Frame::boxed(&bc, FrameKind::Interpreted);
        assert_eq!(f.depth(), 0);
        f.push(5);
        f.push(3);
        assert_eq!(f.depth(), 2);
        assert_eq!(f.pop(), 3);
        assert_eq!(f.pop(), 5);
        assert_eq!(f.depth(), 0);
    }

    #[test]
    #[should_panic(expected = "operand stack underflow")]
    fn pop_empty() {
        let bc = [0u8];
        let mut f = Frame::boxed(&bc, FrameKind::Interpreted);
        f.pop();
    }

    #[test]
    fn kind_discriminates() {
        let bc = [0u8];
        let mut f = Frame::boxed(&bc, FrameKind::Interpreted);
        assert_eq!(f.kind(), FrameKind::Interpreted);
        f.set_kind(FrameKind::Jitted);
        assert_eq!(f.kind(), FrameKind::Jitted);
    }

    #[test]
    fn locals_round_trip() {
        let bc = [0u8];
        let mut f = Frame::boxed(&bc, FrameKind::Interpreted);
        assert_eq!(f.local(0), 0);
        f.set_local(3, -7);
        assert_eq!(f.local(3), -7);
    }

    #[test]
    fn registered_offsets_match_the_record() {
        let layout = FrameLayout::registered();
        assert_eq!(layout.offset(FrameField::Sp), mem::offset_of!(Frame, sp));
        assert_eq!(
            layout.offset(FrameField::Locals),
            mem::offset_of!(Frame, locals)
        );

        // All registered fields live before the value arrays and are
        // distinct.
        let mut offs = [
            layout.offset(FrameField::Bytecode),
            layout.offset(FrameField::SavedPc),
            layout.offset(FrameField::Kind),
            layout.offset(FrameField::Sp),
            layout.offset(FrameField::Locals),
            layout.offset(FrameField::Previous),
        ];
        offs.sort_unstable();
        for w in offs.windows(2) {
            assert!(w[0] < w[1]);
        }
    }

    #[test]
    fn sp_field_tracks_pushes() {
        // The `sp` field is the Backing Location of the operand stack: a
        // push must be observable through it.
        let bc = [0u8];
        let mut f = Frame::boxed(&bc, FrameKind::Interpreted);
        let layout = FrameLayout::registered();
        let before = unsafe {
            *((&*f as *const Frame as *const u8).add(layout.offset(FrameField::Sp))
                as *const *const Value)
        };
        f.push(42);
        let after = unsafe {
            *((&*f as *const Frame as *const u8).add(layout.offset(FrameField::Sp))
                as *const *const Value)
        };
        assert_eq!(unsafe { before.read() }, 42);
        assert_eq!(unsafe { after.offset_from(before) }, 1);
    }
}
