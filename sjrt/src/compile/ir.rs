//! The method graph IR: the translator's output and the backend's input.
//!
//! Instructions live in one arena per graph and refer to each other by
//! index rather than by reference; blocks are keyed by the bytecode offset
//! they were translated from. Abbreviations: `Inst` is an "instruction",
//! `Idx` an "index", `BcOff` a bytecode offset.

use std::fmt;

use typed_index_collections::TiVec;

use super::CompilationError;
use crate::{bytecode::Value, frame::FrameField, method::MethodIdx};

/// Helper to create index overflow errors.
fn index_overflow(typ: &str) -> CompilationError {
    CompilationError::LimitExceeded(format!("index overflow: {typ}"))
}

// Generate common methods for 16-bit index types.
macro_rules! index_16bit {
    ($struct:ident) => {
        impl $struct {
            pub(crate) fn new(v: usize) -> Result<Self, CompilationError> {
                u16::try_from(v)
                    .map_err(|_| index_overflow(stringify!($struct)))
                    .map(Self)
            }
        }

        impl From<usize> for $struct {
            /// Required for `TiVec`. Only use where the index is known to
            /// fit; otherwise use [Self::new].
            fn from(v: usize) -> Self {
                Self::new(v).unwrap()
            }
        }

        impl From<$struct> for usize {
            fn from(s: $struct) -> usize {
                s.0.into()
            }
        }
    };
}

/// An instruction index into [MethodGraph::insts].
#[derive(Copy, Clone, Debug, Eq, Hash, PartialEq, PartialOrd)]
pub(crate) struct InstIdx(u16);
index_16bit!(InstIdx);

impl fmt::Display for InstIdx {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "%{}", self.0)
    }
}

/// A byte offset into a method's bytecode. Graph blocks are keyed by the
/// offset they were translated from.
#[derive(Copy, Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub(crate) struct BcOff(usize);

impl From<usize> for BcOff {
    fn from(v: usize) -> Self {
        Self(v)
    }
}

impl From<BcOff> for usize {
    fn from(v: BcOff) -> usize {
        v.0
    }
}

impl fmt::Display for BcOff {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "bc{}", self.0)
    }
}

/// An instruction operand: the value defined by an earlier instruction, or
/// an inline constant.
#[derive(Copy, Clone, Debug, PartialEq)]
pub(crate) enum Operand {
    Inst(InstIdx),
    Const(Value),
}

impl fmt::Display for Operand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operand::Inst(i) => write!(f, "{i}"),
            Operand::Const(v) => write!(f, "{v}"),
        }
    }
}

/// An arithmetic operator, with the host machine's semantics.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) enum ArithOp {
    Add,
    Sub,
    Mul,
    Div,
}

impl fmt::Display for ArithOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ArithOp::Add => "add",
            ArithOp::Sub => "sub",
            ArithOp::Mul => "mul",
            ArithOp::Div => "div",
        };
        write!(f, "{s}")
    }
}

/// A relational operator for conditional branches.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) enum CondOp {
    Less,
    Greater,
}

impl fmt::Display for CondOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CondOp::Less => "lt",
            CondOp::Greater => "gt",
        };
        write!(f, "{s}")
    }
}

/// An IR instruction.
///
/// Slot addressing is always `base + idx * value-width` where `base` is a
/// pointer previously read out of a frame field: exactly the accesses
/// emitted native code would make.
#[derive(Clone, Debug, PartialEq)]
pub(crate) enum Inst {
    /// An inline constant.
    Const(Value),
    /// Read a frame-record field.
    LoadField(FrameField),
    /// Write a frame-record field.
    StoreField { field: FrameField, val: Operand },
    /// `base` plus `slots` value-widths, in bytes.
    PtrAdd { base: Operand, slots: i32 },
    /// Load the `idx`th slot from `base`.
    Load { base: Operand, idx: i32 },
    /// Store `val` into the `idx`th slot from `base`.
    Store {
        base: Operand,
        idx: i32,
        val: Operand,
    },
    /// Apply `op` natively.
    BinOp {
        op: ArithOp,
        lhs: Operand,
        rhs: Operand,
    },
    /// Call another method. Arguments and the result travel through frame
    /// memory, so the surrounding state must be committed.
    Call { target: MethodIdx },
}

impl fmt::Display for Inst {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Inst::Const(v) => write!(f, "const {v}"),
            Inst::LoadField(field) => write!(f, "loadfield {field}"),
            Inst::StoreField { field, val } => write!(f, "storefield {field}, {val}"),
            Inst::PtrAdd { base, slots } => write!(f, "ptradd {base}, {slots}"),
            Inst::Load { base, idx } => write!(f, "load {base}[{idx}]"),
            Inst::Store { base, idx, val } => write!(f, "store {base}[{idx}], {val}"),
            Inst::BinOp { op, lhs, rhs } => write!(f, "{op} {lhs}, {rhs}"),
            Inst::Call { target } => write!(f, "call {target}"),
        }
    }
}

/// A block terminator: where control goes when a block's code is done.
#[derive(Clone, Debug, PartialEq)]
pub(crate) enum Term {
    /// Fall through to the block at the given offset.
    Goto(BcOff),
    /// Compare-and-branch: `taken` if `lhs cond rhs`, else `fallthrough`.
    Branch {
        cond: CondOp,
        lhs: Operand,
        rhs: Operand,
        taken: BcOff,
        fallthrough: BcOff,
    },
    /// Return `val` to whoever invoked the method.
    Ret { val: Operand },
}

impl fmt::Display for Term {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Term::Goto(t) => write!(f, "goto {t}"),
            Term::Branch {
                cond,
                lhs,
                rhs,
                taken,
                fallthrough,
            } => write!(f, "branch {cond} {lhs}, {rhs} -> {taken}, {fallthrough}"),
            Term::Ret { val } => write!(f, "ret {val}"),
        }
    }
}

/// One graph block: the IR translated from a single bytecode instruction.
#[derive(Debug)]
pub(crate) struct Block {
    pub(crate) code: Vec<InstIdx>,
    pub(crate) term: Term,
}

/// The finished translation of one method.
///
/// `blocks` is indexed densely by byte offset; offsets inside multi-byte
/// instructions and offsets the worklist never reached hold `None`.
#[derive(Debug)]
pub(crate) struct MethodGraph {
    name: String,
    insts: TiVec<InstIdx, Inst>,
    blocks: TiVec<BcOff, Option<Block>>,
}

impl MethodGraph {
    pub(crate) fn new(
        name: String,
        insts: TiVec<InstIdx, Inst>,
        blocks: TiVec<BcOff, Option<Block>>,
    ) -> Self {
        Self {
            name,
            insts,
            blocks,
        }
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    /// Translation always starts at offset 0.
    pub(crate) fn entry(&self) -> BcOff {
        BcOff::from(0)
    }

    pub(crate) fn inst(&self, idx: InstIdx) -> &Inst {
        &self.insts[idx]
    }

    pub(crate) fn num_insts(&self) -> usize {
        self.insts.len()
    }

    pub(crate) fn block(&self, off: BcOff) -> Option<&Block> {
        self.blocks.get(off).and_then(|b| b.as_ref())
    }

    /// The built blocks, in offset order.
    pub(crate) fn blocks(&self) -> impl Iterator<Item = (BcOff, &Block)> {
        self.blocks
            .iter_enumerated()
            .filter_map(|(off, b)| b.as_ref().map(|b| (off, b)))
    }
}

impl fmt::Display for MethodGraph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "; graph for {}", self.name)?;
        for (off, block) in self.blocks() {
            write!(f, "\n{off}:")?;
            for idx in &block.code {
                write!(f, "\n    {idx}: {}", self.insts[*idx])?;
            }
            write!(f, "\n    {}", block.term)?;
        }
        Ok(())
    }
}

/// Appends instructions to a graph-in-progress: the arena and the block
/// being built.
pub(crate) struct IrSink<'a> {
    insts: &'a mut TiVec<InstIdx, Inst>,
    code: &'a mut Vec<InstIdx>,
}

impl<'a> IrSink<'a> {
    pub(crate) fn new(insts: &'a mut TiVec<InstIdx, Inst>, code: &'a mut Vec<InstIdx>) -> Self {
        Self { insts, code }
    }

    /// Append `inst`, returning the index naming the value it defines.
    pub(crate) fn emit(&mut self, inst: Inst) -> Result<InstIdx, CompilationError> {
        let idx = InstIdx::new(self.insts.len())?;
        self.insts.push(inst);
        self.code.push(idx);
        Ok(idx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn index16_fits() {
        assert!(InstIdx::new(0).is_ok());
        assert!(InstIdx::new(1).is_ok());
        assert!(InstIdx::new(0x1234).is_ok());
        assert!(InstIdx::new(0xffff).is_ok());
    }

    #[test]
    fn index16_doesnt_fit() {
        assert!(InstIdx::new(0x10000).is_err());
        assert!(InstIdx::new(0x12345).is_err());
        assert!(InstIdx::new(usize::MAX).is_err());
    }

    #[test]
    fn sink_appends_in_order() {
        let mut insts = TiVec::new();
        let mut code = Vec::new();
        let mut sink = IrSink::new(&mut insts, &mut code);
        let a = sink.emit(Inst::Const(1)).unwrap();
        let b = sink
            .emit(Inst::BinOp {
                op: ArithOp::Add,
                lhs: Operand::Inst(a),
                rhs: Operand::Const(2),
            })
            .unwrap();
        assert_eq!(code, vec![a, b]);
        assert_eq!(insts[a], Inst::Const(1));
    }

    #[test]
    fn print_graph() {
        let mut insts: TiVec<InstIdx, Inst> = TiVec::new();
        let mut code = Vec::new();
        let mut sink = IrSink::new(&mut insts, &mut code);
        let l = sink.emit(Inst::Const(5)).unwrap();
        let r = sink.emit(Inst::Const(3)).unwrap();
        let s = sink
            .emit(Inst::BinOp {
                op: ArithOp::Add,
                lhs: Operand::Inst(l),
                rhs: Operand::Inst(r),
            })
            .unwrap();
        let mut blocks: TiVec<BcOff, Option<Block>> = TiVec::new();
        blocks.push(Some(Block {
            code,
            term: Term::Ret {
                val: Operand::Inst(s),
            },
        }));
        let g = MethodGraph::new("Add".to_owned(), insts, blocks);
        let expect = [
            "; graph for Add",
            "bc0:",
            "    %0: const 5",
            "    %1: const 3",
            "    %2: add %0, %1",
            "    ret %2",
        ]
        .join("\n");
        assert_eq!(g.to_string(), expect);
    }
}
