//! Dependencies discovered through symbol binding
//!
//! When a lookup binds module A to a definition in module B that A's
//! load-time dependency list does not cover, B must stay loaded as long as A
//! is. Those extra edges are recorded here, per referencing module.
//!
//! The edge list is probed without a lock on the hot path: the slot array is
//! published behind an atomic pointer and the active count is bumped with a
//! release store only after the new slot is written. Appends are serialized
//! by the namespace load lock; superseded arrays are retired until the
//! module itself is dropped so an unlocked reader never observes freed
//! storage.

use crate::{
    module::{Module, ModuleRef, ModuleWeak},
    resolver::LookupFlags,
    state::{DebugFlags, RtldState},
};
use alloc::{boxed::Box, sync::Arc, vec::Vec};
use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};
use log::debug;
use spin::Mutex;

const INITIAL_DEPS: usize = 10;

struct DepBlock {
    /// Slots `0..act` are initialized and may be read without a lock.
    act: AtomicUsize,
    slots: Box<[UnsafeCell<Option<ModuleWeak>>]>,
}

impl DepBlock {
    fn with_capacity(capacity: usize) -> Result<Box<DepBlock>, ()> {
        let mut slots = Vec::new();
        slots.try_reserve_exact(capacity).map_err(|_| ())?;
        slots.resize_with(capacity, || UnsafeCell::new(None));
        Ok(Box::new(DepBlock {
            act: AtomicUsize::new(0),
            slots: slots.into_boxed_slice(),
        }))
    }

    fn iter(&self) -> impl Iterator<Item = &ModuleWeak> {
        let act = self.act.load(Ordering::Acquire);
        self.slots[..act]
            .iter()
            // Slots below act were fully written before act was published.
            .filter_map(|slot| unsafe { (*slot.get()).as_ref() })
    }
}

/// Per-module list of binding-discovered dependency edges.
pub(crate) struct DynDeps {
    current: AtomicPtr<DepBlock>,
    /// Superseded blocks, kept until the owning module drops.
    retired: Mutex<Vec<Box<DepBlock>>>,
}

unsafe impl Send for DynDeps {}
unsafe impl Sync for DynDeps {}

impl DynDeps {
    pub(crate) fn new() -> Self {
        DynDeps {
            current: AtomicPtr::new(core::ptr::null_mut()),
            retired: Mutex::new(Vec::new()),
        }
    }

    /// Unlocked probe: whether `target` is already recorded.
    pub(crate) fn contains(&self, target: &Module) -> bool {
        let block = self.current.load(Ordering::Acquire);
        if block.is_null() {
            return false;
        }
        unsafe { &*block }
            .iter()
            .any(|dep| core::ptr::eq(dep.as_ptr(), target))
    }

    /// Append an edge. Callers hold the namespace load lock; failure means
    /// allocation failed and the caller falls back to pinning the target.
    pub(crate) fn push(&self, dep: ModuleWeak) -> Result<(), ()> {
        let current = self.current.load(Ordering::Relaxed);
        if current.is_null() {
            let block = DepBlock::with_capacity(INITIAL_DEPS)?;
            unsafe { *block.slots[0].get() = Some(dep) };
            block.act.store(1, Ordering::Release);
            self.current.store(Box::into_raw(block), Ordering::Release);
            return Ok(());
        }

        let block = unsafe { &*current };
        let act = block.act.load(Ordering::Relaxed);
        if act < block.slots.len() {
            // The slot is invisible to readers until act is bumped.
            unsafe { *block.slots[act].get() = Some(dep) };
            block.act.store(act + 1, Ordering::Release);
            return Ok(());
        }

        // Grow: copy into a doubled block, publish it, retire the old one.
        let grown = DepBlock::with_capacity(block.slots.len() * 2)?;
        for (idx, old) in block.slots.iter().enumerate() {
            unsafe { *grown.slots[idx].get() = (*old.get()).clone() };
        }
        unsafe { *grown.slots[act].get() = Some(dep) };
        grown.act.store(act + 1, Ordering::Release);
        let old = self.current.swap(Box::into_raw(grown), Ordering::Release);
        self.retired.lock().push(unsafe { Box::from_raw(old) });
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        let block = self.current.load(Ordering::Acquire);
        if block.is_null() {
            0
        } else {
            unsafe { &*block }.act.load(Ordering::Acquire)
        }
    }
}

impl Drop for DynDeps {
    fn drop(&mut self) {
        let block = self.current.swap(core::ptr::null_mut(), Ordering::Relaxed);
        if !block.is_null() {
            drop(unsafe { Box::from_raw(block) });
        }
    }
}

/// Outcome of [`RtldState::add_dependency`].
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum AddDependency {
    /// The edge is recorded (or the target was pinned instead).
    Added,
    /// Nothing to do: the edge already exists or the target can never go
    /// away.
    AlreadyPresent,
    /// The target vanished between the lookup and the lock; the whole
    /// lookup must be repeated.
    Retry,
}

impl RtldState {
    /// Make sure `map`, which just satisfied a binding from `undef_map`,
    /// stays loaded as long as `undef_map` is.
    ///
    /// The unlocked probes run first; most bindings hit an existing edge and
    /// never touch the lock. Otherwise the namespace load lock is taken and
    /// everything is re-validated: the target may have been unloaded, or
    /// even reloaded at the same address, which the registration serial
    /// exposes.
    pub(crate) fn add_dependency(
        &self,
        undef_map: &ModuleRef,
        map: &ModuleRef,
        flags: LookupFlags,
    ) -> AddDependency {
        // A module never needs an edge to itself, and a permanent target
        // cannot go away.
        if core::ptr::eq(&**undef_map, &**map) || map.is_permanent() {
            return AlreadyPresent;
        }
        if undef_map.depends_on(map) || undef_map.dyn_deps.contains(map) {
            return AlreadyPresent;
        }

        let serial = map.serial();

        // Holding a global-scope guard while taking the load lock inverts
        // the loader's lock order; drop the guard first and retake it after.
        let gscope = if flags.contains(LookupFlags::GSCOPE_LOCK) {
            let gscope = self.gscope();
            if let Some(gscope) = gscope {
                gscope.release();
            }
            gscope
        } else {
            None
        };

        let ns = self.namespace(undef_map.namespace());
        let loaded = ns.lock_loaded();

        // The lists may have gained the edge while we were unlocked.
        if undef_map.depends_on(map) || undef_map.dyn_deps.contains(map) {
            drop(loaded);
            if let Some(gscope) = gscope {
                gscope.reacquire();
            }
            return AlreadyPresent;
        }

        // Re-validate the target under the lock.
        let still_loaded = loaded.iter().any(|m| core::ptr::eq(&**m, &**map));
        if !still_loaded || map.serial() != serial {
            drop(loaded);
            if let Some(gscope) = gscope {
                gscope.reacquire();
            }
            return Retry;
        }

        let result = if map.is_nodelete() {
            // Pinned in the meantime; no edge needed.
            AlreadyPresent
        } else if undef_map.is_permanent() {
            // The referencer can never be unloaded, so the edge would never
            // be walked; pin the target outright.
            map.mark_nodelete();
            if self.debug().contains(DebugFlags::FILES) {
                debug!(
                    "marking {} [{}] as NODELETE due to reference from {} [{}]",
                    map.name(),
                    map.namespace(),
                    undef_map.name(),
                    undef_map.namespace()
                );
            }
            Added
        } else {
            if undef_map.dyn_deps.push(Arc::downgrade(map)).is_err() {
                // No memory for the edge; keeping the target alive forever
                // is the only safe answer.
                map.mark_nodelete();
            } else if self.debug().contains(DebugFlags::FILES) {
                debug!(
                    "adding dependency: {} [{}] -> {} [{}]",
                    undef_map.name(),
                    undef_map.namespace(),
                    map.name(),
                    map.namespace()
                );
            }
            Added
        };

        drop(loaded);
        if let Some(gscope) = gscope {
            gscope.reacquire();
        }
        result
    }
}

use AddDependency::{Added, AlreadyPresent, Retry};
