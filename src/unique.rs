//! Unique-symbol table
//!
//! `STB_GNU_UNIQUE` definitions must resolve to one address per namespace no
//! matter how many objects define them or how scopes are ordered. The first
//! binding enters the definition into a per-namespace table; later bindings
//! return the stored entry instead of whatever the scope walk found.

use crate::{
    module::{Module, ModuleKind, ModuleRef},
    resolver::TypeClass,
    symbol::ElfSym,
};
use alloc::{boxed::Box, vec::Vec};

const INITIAL_NUNIQUE_SYM_TABLE: usize = 31;

struct UniqueEntry {
    hash: u32,
    name: &'static str,
    sym: &'static ElfSym,
    module: ModuleRef,
}

/// Open-addressing table with double hashing; sizes are prime so the probe
/// stride `1 + hash % (size - 2)` visits every slot.
pub(crate) struct UniqueTable {
    entries: Box<[Option<UniqueEntry>]>,
    n_elements: usize,
}

impl UniqueTable {
    pub(crate) fn new() -> Self {
        UniqueTable {
            entries: Vec::new().into_boxed_slice(),
            n_elements: 0,
        }
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.n_elements
    }

    #[cfg(test)]
    pub(crate) fn capacity(&self) -> usize {
        self.entries.len()
    }

    /// Resolve a unique binding: return the entry already recorded for this
    /// name, or record the candidate and return it.
    ///
    /// For copy-relocation lookups the reference symbol and its module are
    /// recorded instead of the found definition, so that every later binding
    /// resolves to the central copy the executable is about to initialize.
    ///
    /// Allocation failure while creating or growing the table is fatal; the
    /// allocator aborts the process.
    pub(crate) fn lookup_or_insert(
        &mut self,
        hash: u32,
        name: &'static str,
        sym: &'static ElfSym,
        module: &ModuleRef,
        type_class: TypeClass,
        ref_sym: Option<&'static ElfSym>,
        undef_map: Option<&ModuleRef>,
    ) -> (&'static ElfSym, ModuleRef) {
        if !self.entries.is_empty() {
            let size = self.entries.len();
            let mut idx = hash as usize % size;
            let stride = 1 + hash as usize % (size - 2);
            loop {
                match &self.entries[idx] {
                    Some(entry) if entry.hash == hash && entry.name == name => {
                        return if type_class.contains(TypeClass::COPY) {
                            // The central copy lives at the reference; make
                            // sure it is what gets initialized.
                            (sym, module.clone())
                        } else {
                            (entry.sym, entry.module.clone())
                        };
                    }
                    Some(_) => {
                        idx += stride;
                        if idx >= size {
                            idx -= size;
                        }
                    }
                    None => break,
                }
            }
            if size * 3 <= self.n_elements * 4 {
                // Keep the table under 75% full so probe chains stay short.
                self.grow();
            }
        } else {
            self.entries = make_entries(INITIAL_NUNIQUE_SYM_TABLE);
        }

        let (new_sym, new_module) = if type_class.contains(TypeClass::COPY) {
            (
                ref_sym.unwrap_or(sym),
                undef_map.unwrap_or(module).clone(),
            )
        } else {
            if module.kind() == ModuleKind::Loaded {
                // The stored definition must outlive every module that
                // bound to it.
                module.mark_nodelete();
            }
            (sym, module.clone())
        };
        self.enter(hash, name, new_sym, new_module);
        self.n_elements += 1;
        (sym, module.clone())
    }

    fn enter(&mut self, hash: u32, name: &'static str, sym: &'static ElfSym, module: ModuleRef) {
        let size = self.entries.len();
        let mut idx = hash as usize % size;
        let stride = 1 + hash as usize % (size - 2);
        while self.entries[idx].is_some() {
            idx += stride;
            if idx >= size {
                idx -= size;
            }
        }
        self.entries[idx] = Some(UniqueEntry {
            hash,
            name,
            sym,
            module,
        });
    }

    fn grow(&mut self) {
        let newsize = higher_prime_number(self.entries.len() + 1);
        let old = core::mem::replace(&mut self.entries, make_entries(newsize));
        for entry in old.into_vec().into_iter().flatten() {
            self.enter(entry.hash, entry.name, entry.sym, entry.module);
        }
    }

    /// Whether any recorded definition lives in `module`.
    pub(crate) fn references(&self, module: &Module) -> bool {
        self.entries
            .iter()
            .flatten()
            .any(|entry| core::ptr::eq(&*entry.module, module))
    }
}

fn make_entries(size: usize) -> Box<[Option<UniqueEntry>]> {
    let mut entries = Vec::with_capacity(size);
    entries.resize_with(size, || None);
    entries.into_boxed_slice()
}

/// Smallest prime strictly greater than or equal to `n`.
fn higher_prime_number(n: usize) -> usize {
    let mut candidate = n | 1;
    loop {
        let mut is_prime = candidate > 1;
        let mut div = 3;
        while div * div <= candidate {
            if candidate % div == 0 {
                is_prime = false;
                break;
            }
            div += 2;
        }
        if is_prime {
            return candidate;
        }
        candidate += 2;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests_support::{func, gnu_module, leak};
    use alloc::format;

    fn entry_for(name: &str) -> (u32, &'static str, &'static ElfSym) {
        let sym = &leak(alloc::vec![func(0x100)])[0];
        let name: &'static str = alloc::boxed::Box::leak(name.into());
        (crate::hash::gnu_hash(name.as_bytes()), name, sym)
    }

    #[test]
    fn first_binding_wins() {
        let mut table = UniqueTable::new();
        let module_a = gnu_module("a.so", ModuleKind::Loaded, &[]);
        let module_b = gnu_module("b.so", ModuleKind::Loaded, &[]);
        let (hash, name, sym_a) = entry_for("counter");
        let sym_b = &leak(alloc::vec![func(0x200)])[0];

        let (found, owner) = table.lookup_or_insert(
            hash, name, sym_a, &module_a, TypeClass::empty(), None, None,
        );
        assert!(core::ptr::eq(found, sym_a));
        assert_eq!(owner.name(), "a.so");
        // The definer of a unique symbol is pinned.
        assert!(module_a.is_nodelete());

        let (found, owner) = table.lookup_or_insert(
            hash, name, sym_b, &module_b, TypeClass::empty(), None, None,
        );
        assert!(core::ptr::eq(found, sym_a));
        assert_eq!(owner.name(), "a.so");
        assert!(!module_b.is_nodelete());
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn survives_resize() {
        let mut table = UniqueTable::new();
        let module = gnu_module("a.so", ModuleKind::Library, &[]);
        let mut entries = Vec::new();
        for i in 0..64 {
            let (hash, name, sym) = entry_for(&format!("uniq_{i}"));
            entries.push((hash, name, sym));
            table.lookup_or_insert(
                hash, name, sym, &module, TypeClass::empty(), None, None,
            );
        }
        assert_eq!(table.len(), 64);
        assert!(table.capacity() > INITIAL_NUNIQUE_SYM_TABLE);
        // Every entry is still found after rehashing, and nothing is
        // inserted twice.
        for (hash, name, sym) in entries {
            let (found, _) = table.lookup_or_insert(
                hash, name, sym, &module, TypeClass::empty(), None, None,
            );
            assert!(core::ptr::eq(found, sym));
        }
        assert_eq!(table.len(), 64);
    }
}
