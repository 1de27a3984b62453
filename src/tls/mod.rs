//! Thread-local storage
//!
//! Modules carrying a TLS segment get a module ID and a slot in a shared
//! slotinfo list; threads carry a dynamic thread vector (DTV) mapping module
//! IDs to per-thread block addresses. Statically known modules get fixed
//! offsets in one static block laid out next to the thread control block;
//! everything loaded later is allocated on first access.
//!
//! A global generation counter advances whenever a slot changes. Threads
//! compare their DTV's generation against it on every dynamic access and
//! catch up lazily, so loading and unloading never has to visit other
//! threads' vectors.

mod dtv;
mod layout;
mod slotinfo;

pub use dtv::{Dtv, ThreadTls};
pub use layout::{
    DtvAtTp, ExtraBlock, LayoutStrategy, NativeLayout, StaticLayout, TcbAtTp, DL_NNS,
};
pub(crate) use slotinfo::SlotinfoList;

use crate::error::tls_error;
use crate::module::ModuleRef;
use alloc::{alloc::Layout, format};
use core::ptr::NonNull;
use core::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use spin::{Mutex, MutexGuard, Once};

/// No static offset has been decided for the module yet.
pub const NO_TLS_OFFSET: isize = 0;
/// The module's block must live in per-thread dynamic allocations; a static
/// offset may never be assigned retroactively.
pub const FORCED_DYNAMIC_TLS_OFFSET: isize = -1;

/// The loader's read-only description of a module's TLS segment.
#[derive(Clone, Copy, Debug)]
pub struct TlsTemplate {
    /// Initialization image; the leading `image.len()` bytes of every fresh
    /// block, the rest is zeroed.
    pub image: &'static [u8],
    /// Total block size; at least `image.len()`.
    pub memsz: usize,
    /// Alignment of the block, a power of two.
    pub align: usize,
    /// Address of the segment modulo its alignment in the mapped file; the
    /// in-memory block must reproduce it.
    pub firstbyte_offset: usize,
}

pub(crate) struct TlsMaps {
    pub(crate) slotinfo: SlotinfoList,
    /// Unload left unused IDs below the high-water mark.
    pub(crate) gaps: bool,
    /// Number of modules whose IDs were assigned before the static layout
    /// was fixed; gap scans never hand those IDs out again.
    pub(crate) static_nelem: usize,
}

/// Process-wide TLS bookkeeping.
///
/// The slotinfo list and the gap state live behind one mutex, the TLS load
/// lock. Dynamic-access fast paths only read the atomic generation counter;
/// every slot mutation happens under the lock.
pub struct TlsState {
    pub(crate) maps: Mutex<TlsMaps>,
    generation: AtomicU64,
    max_dtv_idx: AtomicUsize,
    /// Threads currently inside a TLS allocation; lets a reentrant access
    /// from an interposed allocator skip the DTV update.
    threads_in_update: AtomicUsize,
    /// Module IDs below this bound belong to startup objects whose slots
    /// never change.
    initial_modid_limit: AtomicUsize,
    static_layout: Once<StaticLayout>,
    surplus: AtomicUsize,
}

impl TlsState {
    pub fn new() -> Self {
        TlsState {
            maps: Mutex::new(TlsMaps {
                slotinfo: SlotinfoList::new(),
                gaps: false,
                static_nelem: 0,
            }),
            generation: AtomicU64::new(0),
            max_dtv_idx: AtomicUsize::new(0),
            threads_in_update: AtomicUsize::new(0),
            initial_modid_limit: AtomicUsize::new(0),
            static_layout: Once::new(),
            surplus: AtomicUsize::new(
                layout::tls_static_surplus(layout::DEFAULT_NNS, layout::OPTIONAL_TLS)
                    + layout::LEGACY_TLS,
            ),
        }
    }

    /// Size the static surplus from the namespace budget.
    ///
    /// `nns` is the expected number of namespaces (clamped to [`DL_NNS`]),
    /// `opt_tls` the optional static TLS each namespace may claim, `naudit`
    /// the number of audit namespaces, which must fit in the remaining
    /// budget.
    pub fn static_surplus_init(
        &self,
        nns: Option<usize>,
        opt_tls: usize,
        naudit: usize,
    ) -> crate::Result<()> {
        let mut nns = nns.unwrap_or(layout::DEFAULT_NNS).clamp(1, DL_NNS);
        if DL_NNS - nns < naudit {
            return Err(tls_error(format!(
                "audit namespaces ({naudit}) exceed the remaining budget ({})",
                DL_NNS - nns
            )));
        }
        nns += naudit;
        self.surplus.store(
            layout::tls_static_surplus(nns, opt_tls) + layout::LEGACY_TLS,
            Ordering::Relaxed,
        );
        Ok(())
    }

    /// Current generation; relaxed, callers that need to synchronize with a
    /// slot update use [`TlsState::generation_acquire`].
    #[inline]
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Relaxed)
    }

    #[inline]
    pub(crate) fn generation_acquire(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Advance the generation counter after slotinfo changes have been
    /// stamped with the successor value. Returns the new generation.
    pub fn bump_generation(&self) -> u64 {
        self.generation.fetch_add(1, Ordering::Release) + 1
    }

    /// Highest module ID ever assigned.
    #[inline]
    pub fn max_modid(&self) -> usize {
        self.max_dtv_idx.load(Ordering::Relaxed)
    }

    pub(crate) fn set_max_modid(&self, modid: usize) {
        self.max_dtv_idx.store(modid, Ordering::Relaxed);
    }

    pub(crate) fn lock_maps(&self) -> MutexGuard<'_, TlsMaps> {
        self.maps.lock()
    }

    pub(crate) fn allocate_begin(&self) {
        self.threads_in_update.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn allocate_end(&self) {
        self.threads_in_update.fetch_sub(1, Ordering::Relaxed);
    }

    pub(crate) fn allocation_active(&self) -> bool {
        self.threads_in_update.load(Ordering::Relaxed) > 0
    }

    pub(crate) fn initial_modid_limit(&self) -> usize {
        self.initial_modid_limit.load(Ordering::Relaxed)
    }

    pub(crate) fn set_initial_modid_limit(&self, limit: usize) {
        self.initial_modid_limit.store(limit, Ordering::Relaxed);
    }

    /// Fix the static block layout over the startup module list. Runs the
    /// planner at most once; later calls return the recorded layout.
    pub fn determine_offsets(&self, modules: &[ModuleRef], extra: ExtraBlock) -> &StaticLayout {
        self.static_layout.call_once(|| {
            let surplus = self.surplus.load(Ordering::Relaxed);
            let layout = NativeLayout::plan(modules, extra, surplus);
            self.maps.lock().static_nelem = self.max_modid();
            layout
        })
    }

    pub(crate) fn static_layout(&self) -> Option<&StaticLayout> {
        self.static_layout.get()
    }

    /// Size and alignment of the static TLS block, once planned.
    pub fn get_tls_static_info(&self) -> Option<(usize, usize)> {
        self.static_layout.get().map(|l| (l.size, l.align))
    }
}

impl Default for TlsState {
    fn default() -> Self {
        TlsState::new()
    }
}

/// One owned dynamic TLS block.
pub(crate) struct TlsBlock {
    ptr: NonNull<u8>,
    layout: Layout,
}

impl TlsBlock {
    /// Allocate a zero-initialized block; allocation failure is fatal, the
    /// access paths have no way to report it.
    pub(crate) fn alloc(state: &TlsState, size: usize, align: usize) -> TlsBlock {
        let layout = match Layout::from_size_align(size.max(1), align.max(1)) {
            Ok(layout) => layout,
            Err(_) => panic!("invalid TLS block layout: {size} bytes, align {align}"),
        };
        state.allocate_begin();
        let raw = unsafe { alloc::alloc::alloc_zeroed(layout) };
        state.allocate_end();
        let Some(ptr) = NonNull::new(raw) else {
            alloc::alloc::handle_alloc_error(layout);
        };
        TlsBlock { ptr, layout }
    }

    #[inline]
    pub(crate) fn as_ptr(&self) -> NonNull<u8> {
        self.ptr
    }
}

impl Drop for TlsBlock {
    fn drop(&mut self) {
        unsafe { alloc::alloc::dealloc(self.ptr.as_ptr(), self.layout) };
    }
}
