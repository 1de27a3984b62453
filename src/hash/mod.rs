//! Symbol hash section views
//!
//! A module's dynamic symbol table is reached through one of two on-disk hash
//! sections: the GNU format (`.gnu.hash`, bitmask filter plus hash chains) or
//! the classic SysV format (`.hash`, bucket/chain arrays). The views here are
//! parsed and validated once when a module is registered; after that, lookups
//! enumerate candidate symbol indices through bounds-checked slices and the
//! resolver decides which candidate actually satisfies the reference.

use crate::{Result, error::parse_hash_error};

mod gnu;
mod sysv;

pub(crate) use gnu::GnuHash;
pub(crate) use sysv::SysvHash;

/// Raw bytes of a module's hash section, tagged with its format.
///
/// The loader knows the format from the dynamic section tag the section was
/// found under.
pub enum HashSection {
    /// A `.gnu.hash` section.
    Gnu(&'static [u8]),
    /// A classic `.hash` section.
    Sysv(&'static [u8]),
}

/// Validated view over a module's hash section.
pub(crate) enum HashTable {
    Gnu(GnuHash),
    Sysv(SysvHash),
}

/// The GNU symbol hash function (DJB: h = h * 33 + c, seeded with 5381).
#[inline]
pub fn gnu_hash(name: &[u8]) -> u32 {
    let mut hash = 5381u32;
    for byte in name {
        hash = hash.wrapping_mul(33).wrapping_add(u32::from(*byte));
    }
    hash
}

/// The classic SysV ELF hash function. Also used for version-name hashes.
#[inline]
pub fn sysv_hash(name: &[u8]) -> u32 {
    let mut hash = 0u32;
    #[allow(unused_assignments)]
    let mut g = 0u32;
    for byte in name {
        hash = (hash << 4).wrapping_add(u32::from(*byte));
        g = hash & 0xf000_0000;
        if g != 0 {
            hash ^= g >> 24;
        }
        hash &= !g;
    }
    hash
}

impl HashTable {
    /// Parse and validate a hash section.
    ///
    /// `symtab_len` bounds the symbol indices the section may refer to;
    /// entries pointing past it make the section malformed.
    pub(crate) fn parse(section: HashSection, symtab_len: usize) -> Result<HashTable> {
        match section {
            HashSection::Gnu(bytes) => Ok(HashTable::Gnu(GnuHash::parse(bytes, symtab_len)?)),
            HashSection::Sysv(bytes) => Ok(HashTable::Sysv(SysvHash::parse(bytes, symtab_len)?)),
        }
    }

    /// Number of symbols reachable through the section.
    ///
    /// The classic format records it directly; the GNU format recovers it by
    /// walking the chain of the last used bucket to its terminator.
    #[inline]
    pub(crate) fn count_syms(&self) -> usize {
        match self {
            HashTable::Gnu(hashtab) => hashtab.count_syms(),
            HashTable::Sysv(hashtab) => hashtab.count_syms(),
        }
    }

    /// Enumerate the symbol-table indices that may define a name.
    ///
    /// `hash` is the precomputed GNU hash of the name. The SysV hash is only
    /// computed when a module with a classic section is encountered, and the
    /// computed value is cached in `sysv_hash` for the rest of the walk.
    ///
    /// The iterator yields candidates; name comparison and acceptance rules
    /// stay with the caller. For the GNU format the bitmask may prove the
    /// name absent without touching a chain.
    pub(crate) fn candidates(
        &self,
        hash: u32,
        sysv_hash_cache: &mut Option<u32>,
        name: &str,
    ) -> Candidates<'_> {
        match self {
            HashTable::Gnu(hashtab) => hashtab.candidates(hash),
            HashTable::Sysv(hashtab) => {
                let hash =
                    *sysv_hash_cache.get_or_insert_with(|| sysv_hash(name.as_bytes()));
                hashtab.candidates(hash)
            }
        }
    }
}

/// Iterator over candidate symbol indices for one module.
pub(crate) enum Candidates<'tab> {
    /// The bitmask or bucket ruled the name out.
    Empty,
    Gnu(gnu::GnuCandidates<'tab>),
    Sysv(sysv::SysvCandidates<'tab>),
}

impl Iterator for Candidates<'_> {
    type Item = usize;

    #[inline]
    fn next(&mut self) -> Option<usize> {
        match self {
            Candidates::Empty => None,
            Candidates::Gnu(it) => it.next(),
            Candidates::Sysv(it) => it.next(),
        }
    }
}

/// Reinterpret the body of a hash section as 32-bit words.
///
/// The loader maps these sections with their natural alignment; a section
/// that is not word-aligned is malformed.
pub(crate) fn section_words(bytes: &'static [u8]) -> Result<&'static [u32]> {
    if bytes.as_ptr().align_offset(align_of::<u32>()) != 0 {
        return Err(parse_hash_error("hash section is not word aligned"));
    }
    // Alignment was checked above and u32 has no invalid bit patterns.
    Ok(unsafe {
        core::slice::from_raw_parts(bytes.as_ptr().cast::<u32>(), bytes.len() / size_of::<u32>())
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gnu_hash_known_values() {
        // Reference values for the DJB hash used by linkers.
        assert_eq!(gnu_hash(b""), 5381);
        assert_eq!(gnu_hash(b"printf"), 0x156b2bb8);
        assert_eq!(gnu_hash(b"exit"), 0x7c967e3f);
    }

    #[test]
    fn sysv_hash_known_values() {
        assert_eq!(sysv_hash(b""), 0);
        assert_eq!(sysv_hash(b"printf"), 0x077905a6);
        assert_eq!(sysv_hash(b"exit"), 0x0006cf04);
    }

    #[test]
    fn bitmask_never_rules_out_a_present_name() {
        use crate::tests_support::{build_gnu_tables, func};
        use alloc::{boxed::Box, format, vec::Vec};

        let names: Vec<&'static str> = (0..100)
            .map(|i| Box::leak(format!("symbol_{i}").into_boxed_str()) as &'static str)
            .collect();
        let syms: Vec<(&str, crate::symbol::ElfSym)> =
            names.iter().map(|&name| (name, func(1))).collect();
        let (section, symtab, _strtab) = build_gnu_tables(&syms);
        let table = HashTable::parse(section, symtab.len()).unwrap();
        for name in names {
            let hash = gnu_hash(name.as_bytes());
            let mut cache = None;
            assert!(
                table.candidates(hash, &mut cache, name).next().is_some(),
                "bitmask dropped {name}"
            );
        }
    }

    #[test]
    fn chain_region_is_clamped_to_the_symbol_table() {
        use crate::tests_support::leak_words;
        use alloc::vec::Vec;

        let hash = gnu_hash(b"f");
        // One bucket starting at symbol 1, an all-ones bitmask, and a chain
        // that keeps running past the two-entry symbol table. Both chain
        // words carry the probe hash, but only the first describes a real
        // symbol; the second must never be yielded.
        let words = leak_words(&[
            1,
            1,
            1,
            0,
            0xffff_ffff,
            0xffff_ffff,
            1,
            hash & !1,
            hash | 1,
        ]);
        let table = HashTable::parse(HashSection::Gnu(words), 2).unwrap();
        let mut cache = None;
        let indices: Vec<usize> = table.candidates(hash, &mut cache, "f").collect();
        assert_eq!(indices, [1]);
    }

    #[test]
    fn malformed_sections_are_rejected() {
        use crate::tests_support::leak_words;

        // Header shorter than its fixed part.
        assert!(HashTable::parse(HashSection::Gnu(leak_words(&[1, 1])), 4).is_err());
        // Bitmask word count must be a power of two.
        assert!(
            HashTable::parse(
                HashSection::Gnu(leak_words(&[1, 1, 3, 0, 0, 0, 0, 0, 0, 0, 0])),
                4
            )
            .is_err()
        );
        // Body shorter than the bucket and chain arrays it declares.
        assert!(HashTable::parse(HashSection::Sysv(leak_words(&[2, 2, 0])), 4).is_err());
    }
}
