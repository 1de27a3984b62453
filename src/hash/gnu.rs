use crate::{Result, error::parse_hash_error, hash::section_words};

/// Size in bits of one bitmask word.
const BLOOM_BITS: u32 = u64::BITS;

/// Validated view over a `.gnu.hash` section.
///
/// Layout on disk: a four-word header (bucket count, first hashed symbol
/// index, bitmask word count, second-bit shift), the bitmask words, the
/// bucket array, then one chain word per hashed symbol. Chain words hold the
/// symbol's hash with the low bit replaced by an end-of-chain marker.
pub(crate) struct GnuHash {
    nbucket: u32,
    /// Index of the first symbol reachable through the section; chain word
    /// `i` describes symbol `symbias + i`.
    symbias: u32,
    /// Bitmask word count minus one. The count is a power of two, so this is
    /// usable directly as an index mask.
    bitmask_idxbits: u32,
    shift: u32,
    bitmask: &'static [u64],
    buckets: &'static [u32],
    chains: &'static [u32],
}

impl GnuHash {
    pub(crate) fn parse(bytes: &'static [u8], symtab_len: usize) -> Result<GnuHash> {
        let words = section_words(bytes)?;
        let [nbucket, symbias, bitmask_nwords, shift] = *words.first_chunk::<4>().ok_or(
            parse_hash_error("gnu hash section is shorter than its header"),
        )?;
        if nbucket == 0 {
            return Err(parse_hash_error("gnu hash section has no buckets"));
        }
        // The bitmask probe masks with nwords - 1, which only selects a
        // valid word when the count is a power of two.
        if bitmask_nwords == 0 || !bitmask_nwords.is_power_of_two() {
            return Err(parse_hash_error(
                "gnu hash bitmask word count is not a power of two",
            ));
        }
        let bitmask_u32s = bitmask_nwords as usize * 2;
        let body = &words[4..];
        if body.len() < bitmask_u32s + nbucket as usize {
            return Err(parse_hash_error("gnu hash section is truncated"));
        }
        let bitmask_bytes = &bytes[4 * size_of::<u32>()..][..bitmask_nwords as usize * 8];
        if bitmask_bytes.as_ptr().align_offset(align_of::<u64>()) != 0 {
            return Err(parse_hash_error("gnu hash bitmask is not aligned"));
        }
        let bitmask = unsafe {
            core::slice::from_raw_parts(
                bitmask_bytes.as_ptr().cast::<u64>(),
                bitmask_nwords as usize,
            )
        };
        let buckets = &body[bitmask_u32s..][..nbucket as usize];
        // One chain word per hashed symbol; a longer remainder would let a
        // chain walk yield indices past the symbol table.
        let nchain = symtab_len.saturating_sub(symbias as usize);
        let chains = &body[bitmask_u32s + nbucket as usize..];
        let chains = &chains[..chains.len().min(nchain)];
        for &bucket in buckets {
            if bucket != 0
                && (bucket < symbias
                    || bucket as usize >= symtab_len
                    || (bucket - symbias) as usize >= chains.len())
            {
                return Err(parse_hash_error(
                    "gnu hash bucket points outside the symbol table",
                ));
            }
        }
        Ok(GnuHash {
            nbucket,
            symbias,
            bitmask_idxbits: bitmask_nwords - 1,
            shift,
            bitmask,
            buckets,
            chains,
        })
    }

    /// Enumerate candidates for a precomputed GNU hash.
    ///
    /// The two bitmask bits are probed first; most misses end here without
    /// touching a bucket.
    pub(crate) fn candidates(&self, hash: u32) -> super::Candidates<'_> {
        let word = self.bitmask[((hash / BLOOM_BITS) & self.bitmask_idxbits) as usize];
        let bit1 = hash % BLOOM_BITS;
        let bit2 = (hash >> self.shift) % BLOOM_BITS;
        if (word >> bit1) & (word >> bit2) & 1 == 0 {
            return super::Candidates::Empty;
        }
        let bucket = self.buckets[(hash % self.nbucket) as usize];
        if bucket == 0 {
            return super::Candidates::Empty;
        }
        super::Candidates::Gnu(GnuCandidates {
            chains: self.chains,
            symbias: self.symbias as usize,
            pos: (bucket - self.symbias) as usize,
            hash,
            done: false,
        })
    }

    pub(crate) fn count_syms(&self) -> usize {
        let mut nsym = 0usize;
        for &bucket in self.buckets {
            nsym = nsym.max(bucket as usize);
        }
        if nsym == 0 {
            return 0;
        }
        let mut i = nsym - self.symbias as usize;
        while let Some(&chain) = self.chains.get(i) {
            if chain & 1 != 0 {
                break;
            }
            nsym += 1;
            i += 1;
        }
        nsym + 1
    }
}

/// Walks one hash chain, yielding the indices whose stored hash matches the
/// probe hash ignoring the end-of-chain bit.
pub(crate) struct GnuCandidates<'tab> {
    chains: &'tab [u32],
    symbias: usize,
    pos: usize,
    hash: u32,
    done: bool,
}

impl Iterator for GnuCandidates<'_> {
    type Item = usize;

    fn next(&mut self) -> Option<usize> {
        while !self.done {
            let chain = *self.chains.get(self.pos)?;
            let symidx = self.symbias + self.pos;
            self.pos += 1;
            if chain & 1 != 0 {
                self.done = true;
            }
            if (chain ^ self.hash) >> 1 == 0 {
                return Some(symidx);
            }
        }
        None
    }
}
