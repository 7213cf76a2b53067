//! Illustrative driver: registers the sample methods, invokes one past the
//! hot threshold and prints what comes back. Run with `SJD_LOG_JITSTATE=-`
//! (and/or `SJD_LOG_IR=-`) to watch methods move from interpretation to
//! compiled execution.

use std::process::exit;

use sjrt::{Method, Opcode, VMBuilder};

fn op(o: Opcode) -> u8 {
    o as u8
}

/// `fib(n)`, recursively. Calls itself through `self_idx`.
fn fib_method(self_idx: u8) -> Method {
    Method::new(
        "Fib",
        vec![
            op(Opcode::PushLocal),
            0,
            op(Opcode::PushConstant),
            2,
            op(Opcode::JmpL),
            22,
            op(Opcode::PushLocal),
            0,
            op(Opcode::PushConstant),
            1,
            op(Opcode::Sub),
            op(Opcode::Call),
            self_idx,
            op(Opcode::PushLocal),
            0,
            op(Opcode::PushConstant),
            2,
            op(Opcode::Sub),
            op(Opcode::Call),
            self_idx,
            op(Opcode::Add),
            op(Opcode::Ret),
            op(Opcode::PushLocal),
            0,
            op(Opcode::Ret),
        ],
        1,
    )
}

/// `fib(n)`, iteratively: a = 0, b = 1, n times (a, b) = (b, a + b).
fn iter_fib_method() -> Method {
    Method::new(
        "IterFib",
        vec![
            op(Opcode::PushConstant),
            0,
            op(Opcode::PopLocal),
            1,
            op(Opcode::PushConstant),
            1,
            op(Opcode::PopLocal),
            2,
            op(Opcode::PushLocal),
            0,
            op(Opcode::PushConstant),
            1,
            op(Opcode::JmpL),
            38,
            op(Opcode::PushLocal),
            1,
            op(Opcode::PushLocal),
            2,
            op(Opcode::Add),
            op(Opcode::PushLocal),
            2,
            op(Opcode::PopLocal),
            1,
            op(Opcode::PopLocal),
            2,
            op(Opcode::PushLocal),
            0,
            op(Opcode::PushConstant),
            1,
            op(Opcode::Sub),
            op(Opcode::PopLocal),
            0,
            op(Opcode::PushConstant),
            0,
            op(Opcode::PushConstant),
            1,
            op(Opcode::JmpL),
            8,
            op(Opcode::PushLocal),
            1,
            op(Opcode::Ret),
        ],
        1,
    )
}

fn main() {
    println!("step 1: initialize the VM");
    let mut vm = VMBuilder::new().build();

    println!("step 2: register methods");
    let fib = vm.add_method(fib_method(0));
    let iter_fib = vm.add_method(iter_fib_method());

    println!(
        "step 3: invoke past the hot threshold ({})",
        vm.hot_threshold()
    );
    for n in 0..=15 {
        let recursive = match vm.invoke(fib, &[n]) {
            Ok(v) => v,
            Err(e) => {
                eprintln!("fail: {e}");
                exit(1);
            }
        };
        let iterative = match vm.invoke(iter_fib, &[n]) {
            Ok(v) => v,
            Err(e) => {
                eprintln!("fail: {e}");
                exit(2);
            }
        };
        assert_eq!(recursive, iterative);
        println!("fib({n}) = {recursive}");
    }

    println!("step 4: done");
}
