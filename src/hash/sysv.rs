//! Classic SysV ELF hash table view
//!
//! The traditional `.hash` format: a bucket array indexed by `hash %
//! nbucket` and a chain array indexed by symbol index, terminated by entry 0
//! (the undefined symbol never starts a chain). Slower than the GNU format
//! but still emitted by some linkers and required for full coverage.

use crate::{Result, error::parse_hash_error, hash::section_words};

/// Validated view over a `.hash` section.
pub(crate) struct SysvHash {
    nbucket: u32,
    /// Chain entry count; equals the number of dynamic symbols.
    nchain: u32,
    buckets: &'static [u32],
    chains: &'static [u32],
}

impl SysvHash {
    pub(crate) fn parse(bytes: &'static [u8], symtab_len: usize) -> Result<SysvHash> {
        let words = section_words(bytes)?;
        let [nbucket, nchain] = *words
            .first_chunk::<2>()
            .ok_or(parse_hash_error("sysv hash section is shorter than its header"))?;
        if nbucket == 0 {
            return Err(parse_hash_error("sysv hash section has no buckets"));
        }
        let body = &words[2..];
        if body.len() < nbucket as usize + nchain as usize {
            return Err(parse_hash_error("sysv hash section is truncated"));
        }
        if nchain as usize > symtab_len {
            return Err(parse_hash_error(
                "sysv hash chain count exceeds the symbol table",
            ));
        }
        let buckets = &body[..nbucket as usize];
        let chains = &body[nbucket as usize..][..nchain as usize];
        for &idx in buckets.iter().chain(chains) {
            if idx >= nchain {
                return Err(parse_hash_error(
                    "sysv hash entry points outside the symbol table",
                ));
            }
        }
        Ok(SysvHash {
            nbucket,
            nchain,
            buckets,
            chains,
        })
    }

    /// Enumerate candidates for a precomputed SysV hash.
    ///
    /// Every entry on the selected bucket's chain is a candidate; the format
    /// stores no per-entry hash to pre-filter with.
    pub(crate) fn candidates(&self, hash: u32) -> super::Candidates<'_> {
        let head = self.buckets[(hash % self.nbucket) as usize];
        if head == 0 {
            return super::Candidates::Empty;
        }
        super::Candidates::Sysv(SysvCandidates {
            chains: self.chains,
            cur: head,
            // A malformed chain could loop; never yield more entries than
            // the table has.
            remaining: self.nchain,
        })
    }

    #[inline]
    pub(crate) fn count_syms(&self) -> usize {
        self.nchain as usize
    }
}

/// Walks one bucket chain until the terminating zero entry.
pub(crate) struct SysvCandidates<'tab> {
    chains: &'tab [u32],
    cur: u32,
    remaining: u32,
}

impl Iterator for SysvCandidates<'_> {
    type Item = usize;

    fn next(&mut self) -> Option<usize> {
        if self.cur == 0 || self.remaining == 0 {
            return None;
        }
        let symidx = self.cur as usize;
        self.cur = self.chains[symidx];
        self.remaining -= 1;
        Some(symidx)
    }
}
