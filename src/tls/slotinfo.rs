//! TLS module IDs and the slotinfo list
//!
//! Every TLS-bearing module gets a positive module ID, its index into every
//! thread's DTV. The slotinfo list records, per ID, the owning module and
//! the generation at which the slot last changed. The list only ever grows;
//! IDs freed by unload are reused through a gap scan, never compacted, so
//! any ID that was ever valid still indexes the list.
//!
//! All functions here run under the TLS load lock.

use super::{TlsMaps, TlsState};
use crate::module::{Module, ModuleKind, ModuleRef, ModuleWeak};
use alloc::{boxed::Box, sync::Arc, vec::Vec};
use core::sync::atomic::Ordering;

/// Slots added per list node beyond what is immediately needed.
pub(crate) const TLS_SLOTINFO_SURPLUS: usize = 62;

#[derive(Default)]
pub(crate) struct SlotEntry {
    pub(crate) map: Option<ModuleWeak>,
    /// Generation at which this slot last changed.
    pub(crate) generation: u64,
}

struct SlotinfoNode {
    slots: Box<[SlotEntry]>,
    next: Option<Box<SlotinfoNode>>,
}

impl SlotinfoNode {
    fn new() -> Self {
        let mut slots = Vec::new();
        slots.resize_with(TLS_SLOTINFO_SURPLUS, SlotEntry::default);
        SlotinfoNode {
            slots: slots.into_boxed_slice(),
            next: None,
        }
    }
}

/// Linked list of fixed-size slot arrays, indexed by module ID. Index 0 of
/// the first node is unused; module IDs start at 1.
pub(crate) struct SlotinfoList {
    head: SlotinfoNode,
}

impl SlotinfoList {
    pub(crate) fn new() -> Self {
        SlotinfoList {
            head: SlotinfoNode::new(),
        }
    }

    pub(crate) fn entry(&self, modid: usize) -> Option<&SlotEntry> {
        let mut idx = modid;
        let mut node = &self.head;
        loop {
            if idx < node.slots.len() {
                return Some(&node.slots[idx]);
            }
            idx -= node.slots.len();
            node = node.next.as_deref()?;
        }
    }

    fn entry_mut(&mut self, modid: usize) -> Option<&mut SlotEntry> {
        let mut idx = modid;
        let mut node = &mut self.head;
        loop {
            if idx < node.slots.len() {
                return Some(&mut node.slots[idx]);
            }
            idx -= node.slots.len();
            node = node.next.as_deref_mut()?;
        }
    }

    /// Append nodes until `modid` has a slot.
    fn ensure(&mut self, modid: usize) {
        let mut idx = modid;
        let mut node = &mut self.head;
        loop {
            if idx < node.slots.len() {
                return;
            }
            idx -= node.slots.len();
            node = node.next.get_or_insert_with(|| Box::new(SlotinfoNode::new()));
        }
    }

    /// Visit every slot in module-ID order.
    pub(crate) fn iter(&self) -> impl Iterator<Item = (usize, &SlotEntry)> {
        SlotIter {
            node: Some(&self.head),
            base: 0,
            idx: 0,
        }
    }
}

struct SlotIter<'a> {
    node: Option<&'a SlotinfoNode>,
    base: usize,
    idx: usize,
}

impl<'a> Iterator for SlotIter<'a> {
    type Item = (usize, &'a SlotEntry);

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let node = self.node?;
            if self.idx < node.slots.len() {
                let item = (self.base + self.idx, &node.slots[self.idx]);
                self.idx += 1;
                return Some(item);
            }
            self.base += node.slots.len();
            self.idx = 0;
            self.node = node.next.as_deref();
        }
    }
}

impl TlsState {
    /// Give `module` a TLS module ID, reusing a gap when one is known to
    /// exist.
    ///
    /// Gap scanning starts past the startup modules; their IDs are pinned by
    /// the static layout. When the scan walks off the end without a hit the
    /// gap flag was stale and a fresh ID is handed out instead.
    pub fn assign_tls_modid(&self, module: &ModuleRef) {
        let mut maps = self.lock_maps();
        let max = self.max_modid();

        if maps.gaps {
            let start = maps.static_nelem + 1;
            if let Some(reused) = scan_for_gap(&mut maps, start, max, module) {
                module.tls_modid.store(reused, Ordering::Relaxed);
                return;
            }
            // The scan walked off the high end; the list has no holes left.
            maps.gaps = false;
        }
        let result = max + 1;
        self.set_max_modid(result);
        module.tls_modid.store(result, Ordering::Relaxed);
    }

    /// Number of live TLS module IDs: the high-water mark unless unload
    /// opened gaps, in which case the occupied slots are counted.
    pub fn count_modids(&self) -> usize {
        let maps = self.lock_maps();
        if !maps.gaps {
            return self.max_modid();
        }
        maps.slotinfo
            .iter()
            .filter(|(modid, entry)| *modid != 0 && entry.map.is_some())
            .count()
    }

    /// Record `module` in the slotinfo list, in up to two phases.
    ///
    /// With `do_add` false only capacity is reserved; a later `do_add` call
    /// for the same module then cannot fail. The commit stamps the slot with
    /// the successor of the current generation; the caller advances the
    /// counter once all modules of the load are committed.
    ///
    /// Returns false when the module has no TLS segment or was committed by
    /// an earlier call.
    pub fn add_to_slotinfo(&self, module: &ModuleRef, do_add: bool) -> bool {
        if module.tls().is_none() || module.tls_in_slotinfo.load(Ordering::Relaxed) {
            return false;
        }
        let modid = module.tls_modid();
        debug_assert!(modid != 0, "module ID must be assigned first");

        let mut maps = self.lock_maps();
        maps.slotinfo.ensure(modid);
        if do_add {
            let next_gen = self.generation() + 1;
            if let Some(entry) = maps.slotinfo.entry_mut(modid) {
                entry.map = Some(Arc::downgrade(module));
                entry.generation = next_gen;
            }
            module.tls_in_slotinfo.store(true, Ordering::Relaxed);
        }
        true
    }

    /// Clear a module's slot at unload, opening a gap for ID reuse.
    ///
    /// The slot is stamped with the successor generation so threads that
    /// catch up invalidate any cached block for the ID; the caller advances
    /// the generation counter afterwards.
    pub fn remove_from_slotinfo(&self, module: &Module) {
        let modid = module.tls_modid.load(Ordering::Relaxed);
        if modid == 0 {
            return;
        }
        let mut maps = self.lock_maps();
        let next_gen = self.generation() + 1;
        if let Some(entry) = maps.slotinfo.entry_mut(modid) {
            entry.map = None;
            entry.generation = next_gen;
        }
        module.tls_in_slotinfo.store(false, Ordering::Relaxed);
        maps.gaps = true;
    }

    /// Cache the boundary below which module IDs belong to startup objects.
    ///
    /// Slots of startup objects never change, so accesses to them may skip
    /// the DTV update even from inside a TLS allocation.
    pub fn initial_modid_limit_setup(&self) {
        let maps = self.lock_maps();
        let mut limit = 1;
        for (modid, entry) in maps.slotinfo.iter().skip(1) {
            let live = entry
                .map
                .as_ref()
                .and_then(ModuleWeak::upgrade)
                .is_some_and(|module| module.kind() != ModuleKind::Loaded);
            if !live {
                break;
            }
            limit = modid + 1;
        }
        self.set_initial_modid_limit(limit);
    }
}

/// Find and claim the lowest free slot in `start..=max`, if any.
fn scan_for_gap(
    maps: &mut TlsMaps,
    start: usize,
    max: usize,
    module: &ModuleRef,
) -> Option<usize> {
    let mut result = start;
    while result <= max {
        match maps.slotinfo.entry_mut(result) {
            Some(entry) if entry.map.is_none() => {
                // Claim the slot so a concurrent load sees it as used.
                entry.map = Some(Arc::downgrade(module));
                entry.generation = 0;
                return Some(result);
            }
            Some(_) => result += 1,
            None => return None,
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests_support::gnu_module_with_tls;
    use crate::tls::TlsTemplate;

    fn tls_module(name: &str, kind: ModuleKind) -> ModuleRef {
        gnu_module_with_tls(
            name,
            kind,
            &[],
            TlsTemplate {
                image: &[],
                memsz: 16,
                align: 8,
                firstbyte_offset: 0,
            },
        )
    }

    #[test]
    fn ids_are_assigned_monotonically() {
        let state = TlsState::new();
        let a = tls_module("a.so", ModuleKind::Library);
        let b = tls_module("b.so", ModuleKind::Library);
        state.assign_tls_modid(&a);
        state.assign_tls_modid(&b);
        assert_eq!(a.tls_modid(), 1);
        assert_eq!(b.tls_modid(), 2);
        assert_eq!(state.max_modid(), 2);
        assert_eq!(state.count_modids(), 2);
    }

    #[test]
    fn unload_opens_a_gap_that_is_reused() {
        let state = TlsState::new();
        let a = tls_module("a.so", ModuleKind::Loaded);
        let b = tls_module("b.so", ModuleKind::Loaded);
        let c = tls_module("c.so", ModuleKind::Loaded);
        for module in [&a, &b, &c] {
            state.assign_tls_modid(module);
            assert!(state.add_to_slotinfo(module, true));
        }
        state.bump_generation();

        state.remove_from_slotinfo(&b);
        state.bump_generation();
        assert_eq!(state.count_modids(), 2);

        let d = tls_module("d.so", ModuleKind::Loaded);
        state.assign_tls_modid(&d);
        // The freed ID is handed out again; the high-water mark is
        // untouched.
        assert_eq!(d.tls_modid(), 2);
        assert_eq!(state.max_modid(), 3);
    }

    #[test]
    fn exhausted_gap_scan_falls_back_to_a_fresh_id() {
        let state = TlsState::new();
        let a = tls_module("a.so", ModuleKind::Loaded);
        state.assign_tls_modid(&a);
        assert!(state.add_to_slotinfo(&a, true));
        state.bump_generation();

        state.remove_from_slotinfo(&a);
        state.bump_generation();
        let b = tls_module("b.so", ModuleKind::Loaded);
        state.assign_tls_modid(&b);
        assert_eq!(b.tls_modid(), 1);

        // The gap flag is now stale; the next assignment must not loop.
        let c = tls_module("c.so", ModuleKind::Loaded);
        state.assign_tls_modid(&c);
        assert_eq!(c.tls_modid(), 2);
    }

    #[test]
    fn two_phase_add_is_idempotent() {
        let state = TlsState::new();
        let a = tls_module("a.so", ModuleKind::Loaded);
        state.assign_tls_modid(&a);
        assert!(state.add_to_slotinfo(&a, false));
        assert!(state.add_to_slotinfo(&a, true));
        // Committed once; a second commit reports nothing to do.
        assert!(!state.add_to_slotinfo(&a, true));
    }

    #[test]
    fn ids_beyond_one_node_reach_a_second_node() {
        let state = TlsState::new();
        let mut modules = Vec::new();
        for i in 0..TLS_SLOTINFO_SURPLUS + 4 {
            let module = tls_module(&alloc::format!("m{i}.so"), ModuleKind::Loaded);
            state.assign_tls_modid(&module);
            assert!(state.add_to_slotinfo(&module, true));
            modules.push(module);
        }
        state.bump_generation();
        let maps = state.lock_maps();
        let last = modules.last().unwrap();
        let entry = maps.slotinfo.entry(last.tls_modid()).unwrap();
        assert!(entry.map.is_some());
        assert_eq!(entry.generation, 1);
    }

    #[test]
    fn initial_limit_stops_at_first_runtime_module() {
        let state = TlsState::new();
        let a = tls_module("a.so", ModuleKind::Library);
        let b = tls_module("b.so", ModuleKind::Library);
        let c = tls_module("c.so", ModuleKind::Loaded);
        for module in [&a, &b, &c] {
            state.assign_tls_modid(module);
            assert!(state.add_to_slotinfo(module, true));
        }
        state.bump_generation();
        state.initial_modid_limit_setup();
        assert_eq!(state.initial_modid_limit(), 3);
    }
}
