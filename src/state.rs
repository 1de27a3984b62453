//! Loader state
//!
//! One [`RtldState`] holds everything resolution and TLS share across calls:
//! the namespaces with their scopes and per-namespace tables, the TLS
//! bookkeeping, tunables and debug switches. The loader owns the state and
//! threads a reference into every call; the crate keeps no globals.

use crate::{
    fastload::FastloadCache,
    module::{Module, ModuleRef},
    scope::Scope,
    tls::TlsState,
    unique::UniqueTable,
};
use alloc::{boxed::Box, vec::Vec};
use bitflags::bitflags;
use core::sync::atomic::{AtomicU64, Ordering};
use spin::{Mutex, MutexGuard, Once};

bitflags! {
    /// Debug event classes, each gating one family of log lines.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct DebugFlags: u32 {
        /// Per-module lookup progress.
        const SYMBOLS  = 1 << 0;
        /// Successful bindings.
        const BINDINGS = 1 << 1;
        /// Dependency edges added through binding.
        const FILES    = 1 << 2;
        /// Suppress the undefined-symbol report (unused-object probing
        /// resolves deliberately missing names).
        const UNUSED   = 1 << 3;
        /// Fastload cache build and skip decisions.
        const FASTLOAD = 1 << 4;
    }
}

/// Configuration the loader decides and the core only consumes.
#[derive(Clone, Copy, Debug)]
pub struct Tunables {
    /// Module count the base namespace must exceed before the fastload
    /// cache is built; negative disables the cache entirely.
    pub fastload_cutoff: i32,
    /// Historic weak-symbol semantics: a weak definition does not stop the
    /// search, a global definition anywhere later in the walk overrides it.
    /// Off by default; weak definitions then bind like global ones.
    pub dynamic_weak: bool,
    /// Optional static TLS bytes reserved per namespace.
    pub optional_tls: usize,
    /// Internal-use region appended to the static TLS block.
    pub extra_tls: crate::tls::ExtraBlock,
}

impl Default for Tunables {
    fn default() -> Self {
        Tunables {
            fastload_cutoff: 32,
            dynamic_weak: false,
            optional_tls: 512,
            extra_tls: crate::tls::ExtraBlock::default(),
        }
    }
}

/// Release/reacquire hooks for a thread's global-scope guard.
///
/// When a lookup holds the guard and must take a namespace load lock, the
/// two lock orders would deadlock against a loader thread taking them the
/// other way around; the dependency recorder releases the guard first and
/// reacquires it after, retrying the lookup.
pub trait GscopeControl: Send + Sync {
    fn release(&self);
    fn reacquire(&self);
}

/// One namespace: the modules loaded into it and the lookup structures
/// scoped to it.
pub struct Namespace {
    main_scope: Scope,
    /// Registration order of every live module. The mutex doubles as the
    /// namespace load lock: whoever holds it may mutate scopes and
    /// dependency lists.
    loaded: Mutex<Vec<ModuleRef>>,
    pub(crate) unique: Mutex<UniqueTable>,
    fastload: Once<FastloadCache>,
}

impl Namespace {
    fn new() -> Self {
        Namespace {
            main_scope: Scope::new([]),
            loaded: Mutex::new(Vec::new()),
            unique: Mutex::new(UniqueTable::new()),
            fastload: Once::new(),
        }
    }

    /// The scope global lookups in this namespace walk.
    #[inline]
    pub fn main_scope(&self) -> &Scope {
        &self.main_scope
    }

    /// Take the namespace load lock.
    pub fn lock_loaded(&self) -> MutexGuard<'_, Vec<ModuleRef>> {
        self.loaded.lock()
    }

    /// Whether `module` is still registered, by identity.
    pub fn is_loaded(&self, module: &Module) -> bool {
        self.loaded
            .lock()
            .iter()
            .any(|m| core::ptr::eq(&**m, module))
    }

    pub(crate) fn fastload(&self) -> Option<&FastloadCache> {
        self.fastload.get()
    }

    /// Whether the fastload cache has been built for this namespace.
    pub fn has_fastload(&self) -> bool {
        self.fastload.get().is_some()
    }
}

/// Shared loader state: namespaces, TLS, tunables, debug switches.
pub struct RtldState {
    namespaces: Box<[Namespace]>,
    pub tls: TlsState,
    tunables: Tunables,
    debug: DebugFlags,
    gscope: Option<Box<dyn GscopeControl>>,
    /// Next registration serial; never reused.
    next_serial: AtomicU64,
}

/// The namespace the executable and its startup dependencies live in.
pub const BASE_NS: usize = 0;

impl RtldState {
    /// Create a state with `nns` namespaces (at least one). The count is
    /// fixed for the state's lifetime.
    pub fn new(nns: usize, tunables: Tunables) -> Self {
        let mut namespaces = Vec::with_capacity(nns.max(1));
        namespaces.resize_with(nns.max(1), Namespace::new);
        RtldState {
            namespaces: namespaces.into_boxed_slice(),
            tls: TlsState::new(),
            tunables,
            debug: DebugFlags::empty(),
            gscope: None,
            next_serial: AtomicU64::new(0),
        }
    }

    pub fn with_debug(mut self, debug: DebugFlags) -> Self {
        self.debug = debug;
        self
    }

    pub fn with_gscope(mut self, gscope: Box<dyn GscopeControl>) -> Self {
        self.gscope = Some(gscope);
        self
    }

    #[inline]
    pub fn namespace(&self, ns: usize) -> &Namespace {
        &self.namespaces[ns]
    }

    #[inline]
    pub fn namespace_count(&self) -> usize {
        self.namespaces.len()
    }

    #[inline]
    pub fn tunables(&self) -> &Tunables {
        &self.tunables
    }

    #[inline]
    pub(crate) fn debug(&self) -> DebugFlags {
        self.debug
    }

    pub(crate) fn gscope(&self) -> Option<&dyn GscopeControl> {
        self.gscope.as_deref()
    }

    /// Register a freshly loaded module: assign its serial, append it to its
    /// namespace's loaded list and republish the main scope with it.
    pub fn register_module(&self, module: &ModuleRef) {
        let serial = self.next_serial.fetch_add(1, Ordering::Relaxed) + 1;
        module.set_registration(serial);
        let ns = self.namespace(module.namespace());
        let mut loaded = ns.loaded.lock();
        loaded.push(module.clone());
        ns.main_scope.publish(loaded.iter().cloned());
    }

    /// Drop a module from its namespace at unload. The module is flagged
    /// first so in-flight walks skip it even on scope lists that still carry
    /// it.
    pub fn unregister_module(&self, module: &ModuleRef) {
        module.mark_removed();
        let ns = self.namespace(module.namespace());
        // Definers of unique symbols are pinned at binding time; reaching
        // here with one still recorded is a loader bug.
        debug_assert!(
            !ns.unique.lock().references(module),
            "unloading {} while it still backs unique definitions",
            module.name()
        );
        let mut loaded = ns.loaded.lock();
        loaded.retain(|m| !core::ptr::eq(&**m, &**module));
        ns.main_scope.publish(loaded.iter().cloned());
    }

    /// Size the TLS surplus for this state's namespace count plus `naudit`
    /// audit namespaces, using the tunables' optional static TLS.
    pub fn tls_surplus_init(&self, naudit: usize) -> crate::Result<()> {
        self.tls.static_surplus_init(
            Some(self.namespaces.len()),
            self.tunables.optional_tls,
            naudit,
        )
    }

    /// Fix the static TLS layout over the base namespace's startup modules,
    /// appending the extra region the tunables reserve.
    pub fn determine_static_tls(&self) -> &crate::tls::StaticLayout {
        let ns = self.namespace(BASE_NS);
        self.tls
            .determine_offsets(ns.main_scope.snapshot(), self.tunables.extra_tls)
    }

    /// Build the base namespace's fastload cache once the object count
    /// exceeds the cutoff. Later registrations never rebuild it; positions
    /// it reports are skip hints that stay conservative.
    pub fn maybe_build_fastload(&self) {
        let cutoff = self.tunables.fastload_cutoff;
        if cutoff < 0 {
            return;
        }
        let ns = self.namespace(BASE_NS);
        let scope = ns.main_scope.snapshot();
        if scope.len() <= cutoff as usize {
            return;
        }
        ns.fastload.call_once(|| FastloadCache::build(scope));
    }
}
