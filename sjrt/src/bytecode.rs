//! Bytecode definitions: the value scalar, the opcode set and the fixed
//! opcode length table.

use static_assertions::const_assert_eq;
use strum::{Display, EnumCount, FromRepr};

/// The scalar type held by every operand stack slot and every local. There
/// is exactly one value width in this machine; anything wider or narrower is
/// somebody else's interpreter.
pub type Value = i64;

/// The byte width of one stack slot / local.
pub(crate) const VALUE_SIZE: usize = std::mem::size_of::<Value>();
const_assert_eq!(VALUE_SIZE, 8);

/// The result reported when execution ends without a value on the operand
/// stack: an empty-stack `Ret`, or `Exit`.
pub const SENTINEL_RESULT: Value = -1;

/// An opcode tag. The discriminant is the opcode byte as it appears in
/// method bytecode.
#[repr(u8)]
#[derive(Copy, Clone, Debug, Display, EnumCount, Eq, FromRepr, PartialEq)]
pub enum Opcode {
    /// Push the sign-extended immediate byte.
    PushConstant = 0,
    /// Duplicate the top of the operand stack.
    Dup,
    Add,
    Sub,
    Mul,
    Div,
    /// Return the top of the operand stack (or [SENTINEL_RESULT] if the
    /// stack is empty).
    Ret,
    /// Call the method whose table index is the immediate byte.
    Call,
    /// Pop `r`, pop `l`; branch to the absolute immediate offset if `l < r`.
    JmpL,
    /// Pop `r`, pop `l`; branch to the absolute immediate offset if `l > r`.
    JmpG,
    /// Push the local at the immediate index.
    PushLocal,
    /// Pop into the local at the immediate index.
    PopLocal,
    /// End execution. The interpreter reports [SENTINEL_RESULT]; the
    /// translator has no handler for it.
    Exit,
}

/// Total instruction lengths in bytes, indexed by opcode discriminant: 1 for
/// the tag plus however many bytes the immediate operand occupies. This
/// table is the only source of fallthrough distances.
const OPCODE_LENGTHS: [usize; Opcode::COUNT] = [2, 1, 1, 1, 1, 1, 1, 2, 2, 2, 2, 2, 1];

impl Opcode {
    /// Decode one opcode byte, or `None` if the byte names no opcode.
    pub fn from_byte(byte: u8) -> Option<Self> {
        Self::from_repr(byte)
    }

    /// The total instruction length in bytes, immediate included.
    #[allow(clippy::len_without_is_empty)]
    pub fn len(self) -> usize {
        OPCODE_LENGTHS[self as usize]
    }

    /// Does this opcode carry an immediate operand byte?
    pub(crate) fn has_imm(self) -> bool {
        self.len() == 2
    }
}
