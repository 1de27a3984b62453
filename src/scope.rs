//! Search scopes
//!
//! A scope is the ordered module list a lookup walks. The loader rebuilds a
//! scope when objects are added or removed and publishes the new list with a
//! single pointer swap; resolvers read whatever list is current when they
//! start and keep using it for the whole walk, so the element count and the
//! elements always travel together.
//!
//! Superseded lists are not freed while the scope is alive. Readers may still
//! be walking them, and deferring the free to scope teardown is what lets the
//! read side run without a lock.

use crate::module::ModuleRef;
use alloc::{boxed::Box, vec::Vec};
use core::sync::atomic::{AtomicPtr, Ordering};
use spin::Mutex;

struct ScopeList {
    modules: Box<[ModuleRef]>,
}

pub struct Scope {
    current: AtomicPtr<ScopeList>,
    /// Superseded lists, kept until the scope is dropped.
    retired: Mutex<Vec<Box<ScopeList>>>,
}

unsafe impl Send for Scope {}
unsafe impl Sync for Scope {}

impl Scope {
    pub fn new(modules: impl IntoIterator<Item = ModuleRef>) -> Self {
        let list = Box::new(ScopeList {
            modules: modules.into_iter().collect(),
        });
        Scope {
            current: AtomicPtr::new(Box::into_raw(list)),
            retired: Mutex::new(Vec::new()),
        }
    }

    /// Publish a new module list.
    ///
    /// Loader-side only; concurrent publishers must already be serialized by
    /// the load lock. The release store pairs with the acquire load in
    /// [`Scope::snapshot`].
    pub fn publish(&self, modules: impl IntoIterator<Item = ModuleRef>) {
        let list = Box::new(ScopeList {
            modules: modules.into_iter().collect(),
        });
        let old = self.current.swap(Box::into_raw(list), Ordering::Release);
        // Readers may still hold the old list; park it until drop.
        self.retired.lock().push(unsafe { Box::from_raw(old) });
    }

    /// The current module list.
    ///
    /// The returned slice stays valid for the scope's lifetime even if a new
    /// list is published mid-walk; the walk simply finishes on the list it
    /// started with.
    #[inline]
    pub fn snapshot(&self) -> &[ModuleRef] {
        let list = self.current.load(Ordering::Acquire);
        unsafe { &(*list).modules }
    }

    /// Number of modules currently in the scope.
    #[inline]
    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.snapshot().is_empty()
    }
}

impl Drop for Scope {
    fn drop(&mut self) {
        let list = self.current.swap(core::ptr::null_mut(), Ordering::Relaxed);
        if !list.is_null() {
            drop(unsafe { Box::from_raw(list) });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module::{Module, ModuleKind};
    use crate::symbol::SymbolTable;
    use crate::tests_support::leak_words;

    fn module(name: &str) -> ModuleRef {
        // Minimal empty gnu hash section: 1 bucket, symbias 1, 1 bitmask
        // word, shift 0, empty bucket.
        let section = leak_words(&[1u32, 1, 1, 0, 0, 0, 0]);
        let symbols = SymbolTable::new(
            crate::hash::HashSection::Gnu(section),
            &[],
            b"\0",
            None,
        )
        .unwrap();
        Module::builder(name, ModuleKind::Loaded)
            .symbols(symbols)
            .build(0, [])
    }

    #[test]
    fn snapshot_survives_publish() {
        let scope = Scope::new([module("a"), module("b")]);
        let before = scope.snapshot();
        assert_eq!(before.len(), 2);
        scope.publish([module("a"), module("b"), module("c")]);
        // The old snapshot is still readable and unchanged.
        assert_eq!(before.len(), 2);
        assert_eq!(scope.snapshot().len(), 3);
    }
}
