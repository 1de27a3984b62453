//! Per-thread dynamic thread vectors
//!
//! A DTV maps module IDs to the calling thread's block addresses. Statically
//! placed modules are filled in when the thread's storage is set up; blocks
//! of modules loaded later materialize on first access. The vector carries
//! the generation it was last synchronized at; a mismatch against the global
//! counter sends the access down the update path, which replays every slot
//! change between the two generations.

use super::layout::{LayoutStrategy, NativeLayout};
use super::{TlsBlock, TlsState, FORCED_DYNAMIC_TLS_OFFSET, NO_TLS_OFFSET};
use crate::module::{Module, ModuleRef, ModuleWeak};
use alloc::vec::Vec;
use core::ptr::NonNull;
use core::sync::atomic::Ordering;

/// Slots allocated beyond the current maximum so most loads do not force a
/// per-thread resize.
const DTV_SURPLUS: usize = 14;

#[derive(Default)]
struct DtvSlot {
    /// Address of the module's block for this thread, if materialized.
    value: Option<NonNull<u8>>,
    /// Owned backing allocation for dynamically placed blocks; statically
    /// placed blocks live inside the thread's static area and own nothing.
    block: Option<TlsBlock>,
}

/// One thread's module-ID-to-block mapping.
pub struct Dtv {
    /// Generation this vector was last synchronized at.
    generation: u64,
    /// Index 0 is unused; module IDs start at 1.
    slots: Vec<DtvSlot>,
}

impl Dtv {
    fn new(max_modid: usize) -> Self {
        let mut slots = Vec::new();
        slots.resize_with(max_modid + DTV_SURPLUS + 1, DtvSlot::default);
        Dtv {
            generation: 0,
            slots,
        }
    }

    #[inline]
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Highest module ID the vector can hold without resizing.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.slots.len() - 1
    }

    /// This thread's block address for `modid`, if already materialized.
    #[inline]
    pub fn value(&self, modid: usize) -> Option<NonNull<u8>> {
        self.slots.get(modid)?.value
    }

    fn resize(&mut self, max_modid: usize) {
        self.slots
            .resize_with(max_modid + DTV_SURPLUS + 1, DtvSlot::default);
    }

    fn slot_mut(&mut self, modid: usize) -> &mut DtvSlot {
        if modid >= self.slots.len() {
            self.resize(modid);
        }
        &mut self.slots[modid]
    }
}

/// A thread's TLS resources: the static area, its position for the thread
/// pointer, and the DTV.
pub struct ThreadTls {
    /// Owned static area; `None` when the caller provided the storage.
    storage: Option<TlsBlock>,
    tcb: NonNull<u8>,
    pub dtv: Dtv,
}

impl ThreadTls {
    /// The thread pointer value for this thread.
    #[inline]
    pub fn tcb(&self) -> NonNull<u8> {
        self.tcb
    }
}

impl TlsState {
    /// Allocate the static area and a fresh DTV for a new thread. Returns
    /// `None` if the allocation fails or the static layout has not been
    /// planned yet.
    pub fn allocate_tls_storage(&self) -> Option<ThreadTls> {
        let layout = *self.static_layout()?;
        let alloc_layout =
            alloc::alloc::Layout::from_size_align(layout.size.max(1), layout.align.max(1))
                .ok()?;
        self.allocate_begin();
        let raw = unsafe { alloc::alloc::alloc_zeroed(alloc_layout) };
        self.allocate_end();
        let ptr = NonNull::new(raw)?;
        let storage = TlsBlock::from_raw(ptr, alloc_layout);
        let tcb = unsafe { NativeLayout::tcb_from_storage(ptr.as_ptr(), &layout) };
        Some(ThreadTls {
            storage: Some(storage),
            tcb: NonNull::new(tcb)?,
            dtv: Dtv::new(self.max_modid()),
        })
    }

    /// Set up TLS for a new thread, over `mem` when the caller already
    /// allocated the static area (it must satisfy the planned size and
    /// alignment) or over a fresh allocation.
    ///
    /// # Safety
    /// When `mem` is provided it must point to at least the planned static
    /// size, aligned to the planned alignment, and stay valid for the
    /// lifetime of the returned value.
    pub unsafe fn allocate_tls(&self, mem: Option<NonNull<u8>>) -> Option<ThreadTls> {
        let mut tls = match mem {
            None => self.allocate_tls_storage()?,
            Some(base) => {
                let layout = *self.static_layout()?;
                let tcb = unsafe { NativeLayout::tcb_from_storage(base.as_ptr(), &layout) };
                ThreadTls {
                    storage: None,
                    tcb: NonNull::new(tcb)?,
                    dtv: Dtv::new(self.max_modid()),
                }
            }
        };
        unsafe { self.allocate_tls_init(&mut tls, false) };
        Some(tls)
    }

    /// Fill the DTV and the static area for every currently loaded TLS
    /// module.
    ///
    /// `main_thread` marks the first call during process start; modules in
    /// secondary namespaces were already initialized by their load path and
    /// are skipped then.
    ///
    /// # Safety
    /// `tls` must have been produced for this state's planned layout and its
    /// static area must be writable.
    pub unsafe fn allocate_tls_init(&self, tls: &mut ThreadTls, main_thread: bool) {
        let maps = self.lock_maps();
        let max_modid = self.max_modid();
        if tls.dtv.capacity() < max_modid {
            tls.dtv.resize(max_modid);
        }

        let mut maxgen = 0;
        for (modid, entry) in maps.slotinfo.iter().skip(1) {
            if modid > max_modid {
                break;
            }
            let Some(map) = entry.map.as_ref().and_then(ModuleWeak::upgrade) else {
                continue;
            };
            debug_assert!(entry.generation <= self.generation());
            maxgen = maxgen.max(entry.generation);

            let slot = tls.dtv.slot_mut(modid);
            slot.value = None;
            slot.block = None;

            let offset = map.tls_offset.load(Ordering::Acquire);
            if offset == NO_TLS_OFFSET || offset == FORCED_DYNAMIC_TLS_OFFSET {
                continue;
            }
            let Some(template) = map.tls() else { continue };
            let dest = unsafe { NativeLayout::static_block_ptr(tls.tcb.as_ptr(), offset) };
            slot.value = NonNull::new(dest);

            if map.namespace() != 0 && main_thread {
                continue;
            }
            unsafe { init_block(dest, template) };
        }
        drop(maps);
        tls.dtv.generation = maxgen;
    }

    /// Release a thread's TLS resources. Dynamic blocks are always freed;
    /// the static area only when `dealloc_tcb` is set (a caller-provided
    /// area is never freed).
    pub fn deallocate_tls(&self, mut tls: ThreadTls, dealloc_tcb: bool) {
        if !dealloc_tcb {
            if let Some(storage) = tls.storage.take() {
                core::mem::forget(storage);
            }
        }
        drop(tls);
    }

    /// Replay slot changes between the DTV's generation and `new_gen`.
    ///
    /// Every slot stamped in that window is reset to unallocated (freeing a
    /// superseded dynamic block) so the next access materializes the current
    /// module's storage. Returns the module now occupying `req_modid`, when
    /// one does.
    pub fn update_slotinfo(
        &self,
        dtv: &mut Dtv,
        req_modid: usize,
        new_gen: u64,
    ) -> Option<ModuleRef> {
        let mut the_map = None;
        if dtv.generation < new_gen {
            let maps = self.lock_maps();
            let max_modid = self.max_modid();
            debug_assert!(max_modid >= req_modid);

            for (modid, entry) in maps.slotinfo.iter().skip(1) {
                if modid > max_modid {
                    break;
                }
                // Changes past new_gen belong to loads we are not yet
                // synchronized with; changes at or before our generation
                // were already applied.
                if entry.generation > new_gen || entry.generation <= dtv.generation {
                    continue;
                }

                let map = entry.map.as_ref().and_then(ModuleWeak::upgrade);
                if dtv.capacity() < modid {
                    if map.is_none() {
                        continue;
                    }
                    dtv.resize(max_modid);
                }

                let slot = dtv.slot_mut(modid);
                slot.block = None;
                slot.value = None;

                if modid == req_modid {
                    the_map = map;
                }
            }
            dtv.generation = new_gen;
        }
        the_map
    }

    /// Address of the thread's block for `(modid, offset)`, materializing
    /// storage on first access.
    ///
    /// A generation mismatch first replays pending slot changes — unless
    /// this is a reentrant access from inside a TLS allocation and the ID
    /// belongs to a startup module, whose slot can never change.
    ///
    /// # Safety
    /// `tls` must belong to the calling thread and `offset` must lie within
    /// the module's block.
    pub unsafe fn tls_get_addr(
        &self,
        tls: &mut ThreadTls,
        modid: usize,
        offset: usize,
    ) -> *mut u8 {
        let current = self.generation();
        if tls.dtv.generation != current
            && !(self.allocation_active() && modid < self.initial_modid_limit())
        {
            let current = self.generation_acquire();
            let the_map = self.update_slotinfo(&mut tls.dtv, modid, current);
            return match tls.dtv.value(modid) {
                Some(ptr) => unsafe { ptr.as_ptr().add(offset) },
                None => unsafe { self.tls_get_addr_tail(tls, modid, offset, the_map) },
            };
        }
        match tls.dtv.value(modid) {
            Some(ptr) => unsafe { ptr.as_ptr().add(offset) },
            None => unsafe { self.tls_get_addr_tail(tls, modid, offset, None) },
        }
    }

    /// Deferred block materialization.
    unsafe fn tls_get_addr_tail(
        &self,
        tls: &mut ThreadTls,
        modid: usize,
        offset: usize,
        the_map: Option<ModuleRef>,
    ) -> *mut u8 {
        let map = match the_map {
            Some(map) => map,
            None => {
                let maps = self.lock_maps();
                match maps
                    .slotinfo
                    .entry(modid)
                    .and_then(|entry| entry.map.as_ref())
                    .and_then(ModuleWeak::upgrade)
                {
                    Some(map) => map,
                    None => vanished_module(modid),
                }
            }
        };

        // A load running in parallel may still assign the module a static
        // offset. Decide under the lock: either commit it to dynamic
        // placement for good, or adopt the already-assigned static block.
        if map.tls_offset.load(Ordering::Acquire) != FORCED_DYNAMIC_TLS_OFFSET {
            let maps = self.lock_maps();
            let off = map.tls_offset.load(Ordering::Relaxed);
            if off == NO_TLS_OFFSET {
                map.tls_offset
                    .store(FORCED_DYNAMIC_TLS_OFFSET, Ordering::Release);
                drop(maps);
            } else if off != FORCED_DYNAMIC_TLS_OFFSET {
                let dest = unsafe { NativeLayout::static_block_ptr(tls.tcb.as_ptr(), off) };
                drop(maps);
                let slot = tls.dtv.slot_mut(modid);
                slot.block = None;
                slot.value = NonNull::new(dest);
                return unsafe { dest.add(offset) };
            } else {
                drop(maps);
            }
        }

        let block = allocate_and_init(self, &map);
        let ptr = block.as_ptr();
        let slot = tls.dtv.slot_mut(modid);
        slot.value = Some(ptr);
        slot.block = Some(block);
        unsafe { ptr.as_ptr().add(offset) }
    }

    /// The thread's block for `module` if it is already materialized; never
    /// allocates and never blocks on the generation catching up.
    pub fn tls_get_addr_soft(&self, tls: &ThreadTls, module: &Module) -> Option<NonNull<u8>> {
        let modid = module.tls_modid();
        if modid == 0 {
            return None;
        }
        if tls.dtv.generation != self.generation() {
            // The vector is stale; it may still cover this module if the
            // module's slot predates the vector's generation.
            if modid > tls.dtv.capacity() {
                return None;
            }
            let maps = self.lock_maps();
            let entry = maps.slotinfo.entry(modid)?;
            if tls.dtv.generation < entry.generation {
                return None;
            }
        }
        tls.dtv.value(modid)
    }
}

impl TlsBlock {
    fn from_raw(ptr: NonNull<u8>, layout: alloc::alloc::Layout) -> TlsBlock {
        TlsBlock { ptr, layout }
    }
}

/// Allocate and initialize one module block; allocation failure is fatal.
fn allocate_and_init(state: &TlsState, map: &ModuleRef) -> TlsBlock {
    let Some(template) = map.tls() else {
        vanished_module(map.tls_modid());
    };
    let block = TlsBlock::alloc(state, template.memsz, template.align);
    unsafe { init_block(block.as_ptr().as_ptr(), template) };
    block
}

/// Copy the initialization image and zero the rest of the block.
///
/// # Safety
/// `dest` must point to at least `template.memsz` writable bytes.
unsafe fn init_block(dest: *mut u8, template: &super::TlsTemplate) {
    unsafe {
        core::ptr::copy_nonoverlapping(template.image.as_ptr(), dest, template.image.len());
        core::ptr::write_bytes(
            dest.add(template.image.len()),
            0,
            template.memsz - template.image.len(),
        );
    }
}

#[cold]
#[inline(never)]
fn vanished_module(modid: usize) -> ! {
    panic!("TLS module {modid} disappeared while thread storage referenced it");
}
