//! Loaded-module view
//!
//! A [`Module`] is the read-only record the loader registers for every mapped
//! object: its symbol table, relocation summary, dependency lists and TLS
//! template. Resolution never mutates a module except through the few atomic
//! flags reserved for it (`used`, `nodelete`, the TLS placement fields).
//!
//! Modules are shared as `Arc`s. The namespace's loaded list holds the strong
//! references; dependency edges and scopes hold clones, so a module stays
//! alive as long as anything can still resolve through it.

use crate::{
    deps::DynDeps,
    symbol::SymbolTable,
    tls::TlsTemplate,
};
use alloc::{
    boxed::Box,
    string::String,
    sync::{Arc, Weak},
    vec::Vec,
};
use core::sync::atomic::{AtomicBool, AtomicIsize, AtomicU64, AtomicUsize, Ordering};

pub type ModuleRef = Arc<Module>;
pub type ModuleWeak = Weak<Module>;

/// How the object entered the process.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ModuleKind {
    /// The main executable.
    Executable,
    /// A dependency mapped during startup; can never be unloaded.
    Library,
    /// An object loaded at runtime; unloadable unless pinned.
    Loaded,
}

/// Classification of a relocation record, as far as resolution cares: the
/// machine-specific relocation codes are the loader's business, but the
/// resolver must know which records are copy relocations.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RelocKind {
    Copy,
    Other,
}

/// One relocation record of the module, reduced to what resolution needs.
#[derive(Clone, Copy)]
pub struct Reloc {
    pub kind: RelocKind,
    /// Index of the referenced symbol in the module's symbol table.
    pub symidx: u32,
}

pub struct Module {
    name: Box<str>,
    /// Alternate names the object answers to (soname and link aliases);
    /// version requirements name objects by any of these.
    aliases: Box<[Box<str>]>,
    kind: ModuleKind,
    /// Namespace the module lives in.
    ns: usize,
    /// Monotonic registration number; never reused, so a dangling reference
    /// to a reloaded object can be told apart from the original.
    serial: AtomicU64,
    symbols: SymbolTable,
    relocs: Box<[Reloc]>,

    /// The object may not be unloaded.
    nodelete: AtomicBool,
    /// The object is on its way out; resolution must ignore it.
    removed: AtomicBool,
    /// Some reference resolved to this object.
    used: AtomicBool,

    /// Direct dependencies recorded at load time.
    static_deps: Box<[ModuleWeak]>,
    /// Dependencies discovered through symbol binding.
    pub(crate) dyn_deps: DynDeps,

    /// TLS initialization template, when the object has a TLS segment.
    tls: Option<TlsTemplate>,
    /// Assigned TLS module ID; zero until assigned.
    pub(crate) tls_modid: AtomicUsize,
    /// Static-block offset, or one of the sentinels in [`crate::tls`].
    pub(crate) tls_offset: AtomicIsize,
    /// Set once the module has a committed slotinfo entry.
    pub(crate) tls_in_slotinfo: AtomicBool,
}

impl Module {
    pub fn builder(name: impl Into<String>, kind: ModuleKind) -> ModuleBuilder {
        ModuleBuilder {
            name: name.into(),
            aliases: Vec::new(),
            kind,
            symbols: None,
            relocs: Vec::new(),
            tls: None,
        }
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn kind(&self) -> ModuleKind {
        self.kind
    }

    #[inline]
    pub fn namespace(&self) -> usize {
        self.ns
    }

    #[inline]
    pub fn symbols(&self) -> &SymbolTable {
        &self.symbols
    }

    #[inline]
    pub(crate) fn serial(&self) -> u64 {
        self.serial.load(Ordering::Acquire)
    }

    pub(crate) fn set_registration(&self, serial: u64) {
        self.serial.store(serial, Ordering::Release);
    }

    #[inline]
    pub fn is_nodelete(&self) -> bool {
        self.nodelete.load(Ordering::Acquire)
    }

    /// Pin the module: it may never be unloaded from now on.
    #[inline]
    pub fn mark_nodelete(&self) {
        self.nodelete.store(true, Ordering::Release);
    }

    #[inline]
    pub fn is_removed(&self) -> bool {
        self.removed.load(Ordering::Acquire)
    }

    /// Flag the module as being unloaded; lookups skip it from now on even
    /// while it is still on a scope list.
    #[inline]
    pub fn mark_removed(&self) {
        self.removed.store(true, Ordering::Release);
    }

    #[inline]
    pub fn is_used(&self) -> bool {
        self.used.load(Ordering::Relaxed)
    }

    #[inline]
    pub(crate) fn mark_used(&self) {
        if !self.used.load(Ordering::Relaxed) {
            self.used.store(true, Ordering::Relaxed);
        }
    }

    /// A module that can never be unloaded: either by kind or by pinning.
    #[inline]
    pub(crate) fn is_permanent(&self) -> bool {
        self.kind != ModuleKind::Loaded || self.is_nodelete()
    }

    /// Whether `file` names this object, by primary name or alias.
    pub(crate) fn matches_name(&self, file: &str) -> bool {
        if &*self.name == file {
            return true;
        }
        self.aliases.iter().any(|alias| &**alias == file)
    }

    /// Whether the load-time dependency list already records `target`.
    pub(crate) fn depends_on(&self, target: &Module) -> bool {
        self.static_deps
            .iter()
            .any(|dep| core::ptr::eq(dep.as_ptr(), target))
    }

    /// Whether any relocation record of this module is a copy relocation
    /// against `name`.
    pub(crate) fn has_copy_relocation(&self, name: &str) -> bool {
        self.relocs.iter().any(|reloc| {
            reloc.kind == RelocKind::Copy
                && self.symbols.symbol_name(reloc.symidx as usize) == name
        })
    }

    #[inline]
    pub fn tls(&self) -> Option<&TlsTemplate> {
        self.tls.as_ref()
    }

    /// Assigned TLS module ID, zero when none has been assigned yet.
    #[inline]
    pub fn tls_modid(&self) -> usize {
        self.tls_modid.load(Ordering::Relaxed)
    }
}

impl core::fmt::Debug for Module {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Module")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("ns", &self.ns)
            .finish()
    }
}

/// Assembles a [`Module`] from the loader's section views.
pub struct ModuleBuilder {
    name: String,
    aliases: Vec<String>,
    kind: ModuleKind,
    symbols: Option<SymbolTable>,
    relocs: Vec<Reloc>,
    tls: Option<TlsTemplate>,
}

impl ModuleBuilder {
    pub fn symbols(mut self, symbols: SymbolTable) -> Self {
        self.symbols = Some(symbols);
        self
    }

    pub fn alias(mut self, alias: impl Into<String>) -> Self {
        self.aliases.push(alias.into());
        self
    }

    pub fn relocs(mut self, relocs: impl IntoIterator<Item = Reloc>) -> Self {
        self.relocs.extend(relocs);
        self
    }

    pub fn tls(mut self, tls: TlsTemplate) -> Self {
        self.tls = Some(tls);
        self
    }

    /// Record the load-time dependencies and produce the module.
    ///
    /// # Panics
    /// Panics when no symbol table was supplied; every resolvable module has
    /// one.
    pub fn build(self, ns: usize, static_deps: impl IntoIterator<Item = ModuleRef>) -> ModuleRef {
        let symbols = self.symbols.expect("module without a symbol table");
        Arc::new(Module {
            name: self.name.into_boxed_str(),
            aliases: self
                .aliases
                .into_iter()
                .map(String::into_boxed_str)
                .collect(),
            kind: self.kind,
            ns,
            serial: AtomicU64::new(0),
            symbols,
            relocs: self.relocs.into_boxed_slice(),
            nodelete: AtomicBool::new(false),
            removed: AtomicBool::new(false),
            used: AtomicBool::new(false),
            static_deps: static_deps
                .into_iter()
                .map(|dep| Arc::downgrade(&dep))
                .collect(),
            dyn_deps: DynDeps::new(),
            tls: self.tls,
            tls_modid: AtomicUsize::new(0),
            tls_offset: AtomicIsize::new(crate::tls::NO_TLS_OFFSET),
            tls_in_slotinfo: AtomicBool::new(false),
        })
    }
}
