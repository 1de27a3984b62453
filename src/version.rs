//! Symbol versioning
//!
//! A module that defines or requires versioned symbols carries a per-symbol
//! version index table plus a set of named version records. A reference may
//! ask for a specific version; unversioned references fall back to a default
//! policy handled by the matcher.

use crate::hash::sysv_hash;
use alloc::{boxed::Box, vec, vec::Vec};

/// Version index bits that select the record; the top bit marks the symbol
/// as hidden from unversioned lookups.
const VERSYM_IDX_MASK: u16 = 0x7fff;
const VERSYM_HIDDEN: u16 = 0x8000;

/// One named version a module defines or pulls in from a dependency.
#[derive(Clone, Copy)]
struct VersionRecord {
    /// SysV hash of the version name; zero for the unversioned base records.
    hash: u32,
    name: &'static str,
}

/// A module's symbol version information.
pub struct VersionTable {
    /// Per-symbol version indices, parallel to the symbol table.
    versym: &'static [u16],
    /// Version records, indexed by the masked version index.
    records: Box<[VersionRecord]>,
}

impl VersionTable {
    /// Build the table from the per-symbol indices and the named records.
    ///
    /// `records` maps version indices to version names; indices 0 and 1 are
    /// the local and global base records and need not be supplied.
    pub fn new(
        versym: &'static [u16],
        records: impl IntoIterator<Item = (u16, &'static str)>,
    ) -> Self {
        let records: Vec<(u16, &'static str)> = records.into_iter().collect();
        let max_idx = records.iter().map(|(idx, _)| *idx).max().unwrap_or(1);
        let mut table = vec![
            VersionRecord { hash: 0, name: "" };
            max_idx as usize + 1
        ];
        for (idx, name) in records {
            table[idx as usize] = VersionRecord {
                hash: sysv_hash(name.as_bytes()),
                name,
            };
        }
        VersionTable {
            versym,
            records: table.into_boxed_slice(),
        }
    }

    /// The masked version index of the symbol at `symidx`.
    #[inline]
    pub(crate) fn index(&self, symidx: usize) -> u16 {
        self.versym.get(symidx).copied().unwrap_or(0) & VERSYM_IDX_MASK
    }

    /// Whether the symbol at `symidx` is hidden from unversioned lookups.
    #[inline]
    pub(crate) fn is_hidden(&self, symidx: usize) -> bool {
        self.versym.get(symidx).copied().unwrap_or(0) & VERSYM_HIDDEN != 0
    }

    /// Check the symbol at `symidx` against a version requirement.
    ///
    /// The symbol matches when its record names exactly the required
    /// version, or when it is a non-hidden base-record symbol and the
    /// requirement itself is not hidden. Everything else is the wrong
    /// version.
    pub(crate) fn matches(&self, symidx: usize, req: &VersionReq) -> bool {
        let ndx = self.index(symidx) as usize;
        let record = self
            .records
            .get(ndx)
            .copied()
            .unwrap_or(VersionRecord { hash: 0, name: "" });
        if record.hash == req.hash && record.name == req.name {
            return true;
        }
        !req.hidden && record.hash == 0 && !self.is_hidden(symidx)
    }
}

/// A version requirement attached to a symbol reference.
pub struct VersionReq<'a> {
    /// The required version name.
    pub name: &'a str,
    /// Precomputed SysV hash of the name.
    pub(crate) hash: u32,
    /// A hidden requirement never accepts base-record symbols.
    pub hidden: bool,
    /// Name of the object that is supposed to define the version, when the
    /// requirement comes from a version-needed record. Reaching that object
    /// without a match is a hard error rather than a miss.
    pub filename: Option<&'a str>,
}

impl<'a> VersionReq<'a> {
    pub fn new(name: &'a str, filename: Option<&'a str>) -> Self {
        VersionReq {
            name,
            hash: sysv_hash(name.as_bytes()),
            hidden: false,
            filename,
        }
    }

    pub fn hidden(mut self) -> Self {
        self.hidden = true;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leak<T>(v: Vec<T>) -> &'static [T] {
        Box::leak(v.into_boxed_slice())
    }

    #[test]
    fn exact_version_match() {
        let versym = leak(vec![0u16, 2, 3]);
        let table = VersionTable::new(versym, [(2, "LIB_1.0"), (3, "LIB_2.0")]);
        let req = VersionReq::new("LIB_2.0", Some("libx.so"));
        assert!(!table.matches(1, &req));
        assert!(table.matches(2, &req));
    }

    #[test]
    fn base_records_satisfy_non_hidden_requirements() {
        let versym = leak(vec![1u16, 1 | VERSYM_HIDDEN]);
        let table = VersionTable::new(versym, []);
        let req = VersionReq::new("LIB_1.0", None);
        assert!(table.matches(0, &req));
        // A hidden symbol never satisfies a versioned request through the
        // base-record fallback.
        assert!(!table.matches(1, &req));
        assert!(!table.matches(0, &VersionReq::new("LIB_1.0", None).hidden()));
    }
}
