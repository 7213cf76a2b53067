//! The implementation of the `SJD_LOG_*` environment variables.
//!
//! When the `sjd` feature is not enabled, this module exposes no-op
//! functions.

pub(crate) use internals::*;

#[cfg(not(feature = "sjd"))]
mod internals {
    pub(crate) fn log_jit_state(_: &str) {}
    pub(crate) fn log_ir(_: &str, _: &str) {}
}

#[cfg(feature = "sjd")]
mod internals {
    use std::{env, fs::File, io::Write, sync::LazyLock};

    // SJD_LOG_JITSTATE: "-" for stderr, anything else is a path to append
    // to.
    static JITSTATE_LOG: LazyLock<Option<String>> =
        LazyLock::new(|| env::var("SJD_LOG_JITSTATE").ok());

    /// Log select JIT events for testing/debugging purposes.
    pub(crate) fn log_jit_state(state: &str) {
        match JITSTATE_LOG.as_ref().map(|x| x.as_str()) {
            Some("-") => eprintln!("jitstate: {state}"),
            Some(p) => {
                File::options()
                    .append(true)
                    .create(true)
                    .open(p)
                    .map(|mut f| writeln!(f, "jitstate: {state}"))
                    .ok();
            }
            None => (),
        }
    }

    // SJD_LOG_IR: same sink convention as SJD_LOG_JITSTATE.
    static IR_LOG: LazyLock<Option<String>> = LazyLock::new(|| env::var("SJD_LOG_IR").ok());

    /// Dump the graph IR built for `name`.
    pub(crate) fn log_ir(name: &str, ir: &str) {
        match IR_LOG.as_ref().map(|x| x.as_str()) {
            Some("-") => eprintln!("--- Begin graph: {name} ---\n{ir}\n--- End graph ---"),
            Some(p) => {
                File::options()
                    .append(true)
                    .create(true)
                    .open(p)
                    .map(|mut f| {
                        writeln!(f, "--- Begin graph: {name} ---\n{ir}\n--- End graph ---")
                    })
                    .ok();
            }
            None => (),
        }
    }
}
