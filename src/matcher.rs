//! Candidate acceptance rules
//!
//! A hash chain yields candidate symbol indices; [`ChainMatcher`] decides,
//! per candidate, whether the record can satisfy the reference at all:
//! definedness, type, name, and version. Precedence between acceptable
//! definitions across modules is the walker's business, not handled here.

use crate::{
    resolver::{LookupFlags, TypeClass},
    symbol::{ElfSym, SymbolTable},
    version::VersionReq,
};
use elf::abi::{SHN_UNDEF, STT_TLS};

/// Per-chain matching state.
///
/// An unversioned reference against a versioned module must not bind to an
/// arbitrary version. Acceptable default-version candidates are counted
/// while the chain is walked; if the chain ends with exactly one, that one
/// wins after all ([`ChainMatcher::into_default`]).
pub(crate) struct ChainMatcher {
    num_versions: usize,
    versioned_sym: Option<&'static ElfSym>,
}

impl ChainMatcher {
    pub(crate) fn new() -> Self {
        ChainMatcher {
            num_versions: 0,
            versioned_sym: None,
        }
    }

    /// Test one candidate.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn check(
        &mut self,
        symbols: &SymbolTable,
        symidx: usize,
        name: &str,
        ref_sym: Option<&ElfSym>,
        version: Option<&VersionReq<'_>>,
        type_class: TypeClass,
        flags: LookupFlags,
    ) -> Option<&'static ElfSym> {
        let sym: &'static ElfSym = &symbols.symtab[symidx];

        // Only TLS symbols may legitimately have value zero, and a PLT
        // reference must never bind to another undefined PLT slot.
        if sym.st_value == 0 && sym.st_type() != STT_TLS {
            return None;
        }
        if type_class.contains(TypeClass::PLT) && sym.st_shndx() == SHN_UNDEF as usize {
            return None;
        }
        if !sym.is_ok_type() {
            return None;
        }

        // When the candidate is the reference record itself the names are
        // known to agree; skip the string compare.
        let is_ref = ref_sym.is_some_and(|reference| core::ptr::eq(reference, sym));
        if !is_ref && symbols.symbol_name(symidx) != name {
            return None;
        }

        match (version, symbols.version_table()) {
            // The object predates symbol versioning; whatever it defines is
            // the only thing it can offer.
            (Some(_), None) => {}
            (Some(req), Some(table)) => {
                if !table.matches(symidx, req) {
                    return None;
                }
            }
            (None, Some(table)) => {
                // An unversioned reference accepts base-record symbols
                // outright. An old unversioned binary additionally binds
                // the oldest version tier directly; a dlsym-style lookup
                // defers every version to the sole-default fallback so it
                // ends up on the one public (newest) interface.
                let cutoff = if flags.contains(LookupFlags::RETURN_NEWEST) {
                    2
                } else {
                    3
                };
                if table.index(symidx) >= cutoff {
                    if !table.is_hidden(symidx) {
                        self.num_versions += 1;
                        if self.num_versions == 1 {
                            self.versioned_sym = Some(sym);
                        }
                    }
                    return None;
                }
            }
            (None, None) => {}
        }

        Some(sym)
    }

    /// The module's sole default-version definition, if the chain saw
    /// exactly one; with several the reference is ambiguous and stays
    /// unresolved in this module.
    pub(crate) fn into_default(self) -> Option<&'static ElfSym> {
        if self.num_versions == 1 {
            self.versioned_sym
        } else {
            None
        }
    }
}
