//! Bytecode fixtures shared across tests: small hand-assembled programs
//! covering straight-line code, calls, loops and defective input.

use crate::{bytecode::Opcode, method::Method};

fn op(o: Opcode) -> u8 {
    o as u8
}

/// `5 + 3`: the smallest interesting straight-line program.
pub(crate) fn add_method() -> Method {
    Method::new(
        "Add",
        vec![
            op(Opcode::PushConstant),
            5,
            op(Opcode::PushConstant),
            3,
            op(Opcode::Add),
            op(Opcode::Ret),
        ],
        0,
    )
}

/// `10 / 0`: faults natively on either execution path.
pub(crate) fn div_zero_method() -> Method {
    Method::new(
        "DivZero",
        vec![
            op(Opcode::PushConstant),
            10,
            op(Opcode::PushConstant),
            0,
            op(Opcode::Div),
            op(Opcode::Ret),
        ],
        0,
    )
}

/// Recursive Fibonacci. `self_idx` is the method-table index the method
/// will be registered at, so it can call itself.
///
/// ```text
/// fib(n): if n < 2 return n; return fib(n-1) + fib(n-2)
/// ```
pub(crate) fn fib_method(self_idx: u8) -> Method {
    Method::new(
        "Fib",
        vec![
            op(Opcode::PushLocal),    // 0: [n]
            0,
            op(Opcode::PushConstant), // 2: [n, 2]
            2,
            op(Opcode::JmpL),         // 4: n < 2 -> 22
            22,
            op(Opcode::PushLocal),    // 6: [n]
            0,
            op(Opcode::PushConstant), // 8: [n, 1]
            1,
            op(Opcode::Sub),          // 10: [n-1]
            op(Opcode::Call),         // 11: [fib(n-1)]
            self_idx,
            op(Opcode::PushLocal),    // 13: [fib(n-1), n]
            0,
            op(Opcode::PushConstant), // 15: [fib(n-1), n, 2]
            2,
            op(Opcode::Sub),          // 17: [fib(n-1), n-2]
            op(Opcode::Call),         // 18: [fib(n-1), fib(n-2)]
            self_idx,
            op(Opcode::Add),          // 20: [fib(n)]
            op(Opcode::Ret),          // 21
            op(Opcode::PushLocal),    // 22: [n]
            0,
            op(Opcode::Ret),          // 24
        ],
        1,
    )
}

/// Iterative Fibonacci. The loop header at offset 8 is reached both by
/// falling in from the initialisation code and by the backward branch at
/// offset 36, so translating it exercises state merging.
///
/// Locals: 0 = n, 1 = a, 2 = b.
pub(crate) fn iter_fib_method() -> Method {
    Method::new(
        "IterFib",
        vec![
            op(Opcode::PushConstant), // 0: a = 0
            0,
            op(Opcode::PopLocal),     // 2
            1,
            op(Opcode::PushConstant), // 4: b = 1
            1,
            op(Opcode::PopLocal),     // 6
            2,
            op(Opcode::PushLocal),    // 8: loop header: [n]
            0,
            op(Opcode::PushConstant), // 10: [n, 1]
            1,
            op(Opcode::JmpL),         // 12: n < 1 -> 38
            38,
            op(Opcode::PushLocal),    // 14: [a]
            1,
            op(Opcode::PushLocal),    // 16: [a, b]
            2,
            op(Opcode::Add),          // 18: [a+b]
            op(Opcode::PushLocal),    // 19: [a+b, b]
            2,
            op(Opcode::PopLocal),     // 21: a = b; [a+b]
            1,
            op(Opcode::PopLocal),     // 23: b = a+b; []
            2,
            op(Opcode::PushLocal),    // 25: [n]
            0,
            op(Opcode::PushConstant), // 27: [n, 1]
            1,
            op(Opcode::Sub),          // 29: [n-1]
            op(Opcode::PopLocal),     // 30: n = n-1; []
            0,
            op(Opcode::PushConstant), // 32: [0]
            0,
            op(Opcode::PushConstant), // 34: [0, 1]
            1,
            op(Opcode::JmpL),         // 36: 0 < 1, always -> 8
            8,
            op(Opcode::PushLocal),    // 38: [a]
            1,
            op(Opcode::Ret),          // 40
        ],
        1,
    )
}

/// A correct program followed by a byte that names no opcode. Interpreting
/// it never reaches the bad byte; translating it must refuse the whole
/// method.
pub(crate) fn unknown_opcode_method() -> Method {
    Method::new(
        "Unknown",
        vec![
            op(Opcode::PushConstant),
            5,
            op(Opcode::PushConstant),
            3,
            op(Opcode::Add),
            op(Opcode::Ret),
            0xee,
        ],
        0,
    )
}
