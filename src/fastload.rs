//! Symbol position cache
//!
//! With many directly loaded objects, most lookups walk a long prefix of the
//! main search scope only to find the definition near the end. When the
//! object count first exceeds a configurable cutoff, a one-shot cache is
//! built that maps every exported symbol to the earliest scope position that
//! defines it; later walks over the main scope start there instead of at
//! position zero.
//!
//! The cache is never rebuilt or invalidated. That is safe because it only
//! produces skip hints: a recorded position is at most the index of the
//! first definer among the modules present at build time, so skipping ahead
//! can never pass a definition. Symbols the cache has never seen report the
//! build-time module count, which either ends the walk (nothing new was
//! loaded) or lands exactly on the first module loaded after the build.

use crate::{module::ModuleRef, symbol::ElfSym};
use alloc::{boxed::Box, vec::Vec};
use elf::abi::{STT_COMMON, STT_FILE, STT_SECTION, STT_TLS};
use log::trace;

#[derive(Clone, Copy)]
struct FastEntry {
    hash: u32,
    /// Earliest main-scope index defining the name.
    pos: u32,
    name: &'static str,
}

/// Build-once cache of earliest defining positions, keyed by GNU hash plus
/// the name itself so collisions cannot misdirect a walk.
pub(crate) struct FastloadCache {
    mask: usize,
    entries: Box<[Option<FastEntry>]>,
    len: usize,
    /// Reported on a miss: the number of modules the cache was built over.
    default_pos: usize,
}

impl FastloadCache {
    /// Scan the scope and record each acceptable symbol's earliest definer.
    ///
    /// A symbol is recorded when the scope walk could bind to it: it must
    /// have a value (or be TLS), be a code or data definition, and not be
    /// local.
    pub(crate) fn build(scope: &[ModuleRef]) -> FastloadCache {
        let total_symbols: usize = scope
            .iter()
            .map(|module| module.symbols().count_syms())
            .sum();
        // Size for at most 25% load up front; duplicates across objects
        // usually leave it emptier.
        let size = (total_symbols.max(1) * 4).next_power_of_two();
        let mut cache = FastloadCache {
            mask: size - 1,
            entries: make_entries(size),
            len: 0,
            default_pos: scope.len(),
        };
        for (pos, module) in scope.iter().enumerate() {
            let symbols = module.symbols();
            let count = symbols.count_syms();
            trace!("fastload: {}: {} symbols", module.name(), count);
            for idx in 0..count {
                let sym = symbols.symbol(idx);
                if eligible(sym) {
                    cache.insert(symbols.symbol_name(idx), pos as u32);
                }
            }
        }
        cache
    }

    fn insert(&mut self, name: &'static str, pos: u32) {
        let hash = crate::hash::gnu_hash(name.as_bytes());
        let mut idx = hash as usize & self.mask;
        loop {
            match &mut self.entries[idx] {
                Some(entry) if entry.hash == hash && entry.name == name => {
                    // Keep the earliest definer; later ones are shadowed.
                    if pos < entry.pos {
                        entry.pos = pos;
                    }
                    return;
                }
                Some(_) => idx = (idx + 1) & self.mask,
                slot @ None => {
                    *slot = Some(FastEntry { hash, pos, name });
                    self.len += 1;
                    if (self.len + 1) * 2 > self.entries.len() {
                        self.grow();
                    }
                    return;
                }
            }
        }
    }

    fn grow(&mut self) {
        let size = self.entries.len() * 2;
        let old = core::mem::replace(&mut self.entries, make_entries(size));
        self.mask = size - 1;
        for entry in old.into_vec().into_iter().flatten() {
            let mut idx = entry.hash as usize & self.mask;
            while self.entries[idx].is_some() {
                idx = (idx + 1) & self.mask;
            }
            self.entries[idx] = Some(entry);
        }
    }

    /// The scope position a walk for `name` may start at.
    pub(crate) fn position(&self, hash: u32, name: &str) -> usize {
        let mut idx = hash as usize & self.mask;
        loop {
            match &self.entries[idx] {
                Some(entry) if entry.hash == hash && entry.name == name => {
                    return entry.pos as usize;
                }
                Some(_) => idx = (idx + 1) & self.mask,
                None => return self.default_pos,
            }
        }
    }
}

fn make_entries(size: usize) -> Box<[Option<FastEntry>]> {
    let mut entries = Vec::with_capacity(size);
    entries.resize_with(size, || None);
    entries.into_boxed_slice()
}

fn eligible(sym: &ElfSym) -> bool {
    if sym.st_value == 0 && sym.st_type() != STT_TLS {
        return false;
    }
    if matches!(sym.st_type(), STT_SECTION | STT_FILE | STT_COMMON) {
        return false;
    }
    !sym.is_local()
}
