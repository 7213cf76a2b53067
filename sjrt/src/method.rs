//! Method descriptors: the unit of translation and dispatch.

use std::{
    fmt,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};

use parking_lot::Mutex;

use crate::compile::CompiledMethod;

/// Index of a [Method] in the VM's method table. `Call` immediates name
/// callees by this index.
#[derive(Copy, Clone, Debug, Eq, Hash, PartialEq)]
pub struct MethodIdx(usize);

impl From<usize> for MethodIdx {
    fn from(v: usize) -> Self {
        Self(v)
    }
}

impl From<MethodIdx> for usize {
    fn from(v: MethodIdx) -> usize {
        v.0
    }
}

impl fmt::Display for MethodIdx {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "m{}", self.0)
    }
}

/// A method's dispatch state.
///
/// Methods start `Counting` and move exactly once, to `Compiled` when a
/// translation succeeds or to `DontCompile` when one fails. There is no way
/// back: a failed translation would fail identically if retried.
#[derive(Debug)]
pub(crate) enum MethodState {
    /// Interpreted; counting invocations towards the hot threshold.
    Counting,
    /// Has a compiled entry; every future invocation dispatches to it.
    Compiled(Arc<dyn CompiledMethod>),
    /// Translation failed; interpret forever.
    DontCompile,
}

/// One logical method: immutable bytecode plus the mutable JIT bookkeeping
/// around it.
pub struct Method {
    name: String,
    bytecode: Arc<[u8]>,
    arg_count: usize,
    /// Interpreted invocations so far.
    hotcount: AtomicUsize,
    state: Mutex<MethodState>,
}

impl Method {
    pub fn new(name: &str, bytecode: Vec<u8>, arg_count: usize) -> Self {
        Self {
            name: name.to_owned(),
            bytecode: bytecode.into(),
            arg_count,
            hotcount: AtomicUsize::new(0),
            state: Mutex::new(MethodState::Counting),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn bytecode(&self) -> &[u8] {
        &self.bytecode
    }

    pub fn arg_count(&self) -> usize {
        self.arg_count
    }

    /// Record one interpreted invocation and return the new count.
    pub(crate) fn inc_count(&self) -> usize {
        self.hotcount.fetch_add(1, Ordering::Relaxed) + 1
    }

    #[cfg(test)]
    pub(crate) fn count(&self) -> usize {
        self.hotcount.load(Ordering::Relaxed)
    }

    /// If this method has a compiled entry, a clone of it.
    pub(crate) fn compiled(&self) -> Option<Arc<dyn CompiledMethod>> {
        match &*self.state.lock() {
            MethodState::Compiled(cm) => Some(Arc::clone(cm)),
            _ => None,
        }
    }

    pub(crate) fn is_counting(&self) -> bool {
        matches!(&*self.state.lock(), MethodState::Counting)
    }

    #[cfg(test)]
    pub(crate) fn is_dont_compile(&self) -> bool {
        matches!(&*self.state.lock(), MethodState::DontCompile)
    }

    /// Install a compiled entry. Happens at most once per method.
    pub(crate) fn set_compiled(&self, cm: Arc<dyn CompiledMethod>) {
        let mut state = self.state.lock();
        debug_assert!(matches!(&*state, MethodState::Counting));
        *state = MethodState::Compiled(cm);
    }

    /// Park this method on the interpreted path for good.
    pub(crate) fn set_dont_compile(&self) {
        let mut state = self.state.lock();
        debug_assert!(matches!(&*state, MethodState::Counting));
        *state = MethodState::DontCompile;
    }
}

impl fmt::Debug for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Method")
            .field("name", &self.name)
            .field("arg_count", &self.arg_count)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counting() {
        let m = Method::new("x", vec![crate::bytecode::Opcode::Ret as u8], 0);
        assert_eq!(m.count(), 0);
        assert_eq!(m.inc_count(), 1);
        assert_eq!(m.inc_count(), 2);
        assert_eq!(m.count(), 2);
        assert!(m.is_counting());
        assert!(m.compiled().is_none());
    }

    #[test]
    fn dont_compile_is_terminal() {
        let m = Method::new("x", vec![crate::bytecode::Opcode::Ret as u8], 0);
        m.set_dont_compile();
        assert!(!m.is_counting());
        assert!(m.is_dont_compile());
        assert!(m.compiled().is_none());
    }
}
