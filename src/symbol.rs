//! ELF symbol table handling
//!
//! This module provides the typed view over a module's dynamic symbol table:
//! the symbol record itself, the string table it names symbols in, and the
//! [`SymbolTable`] that ties both to a hash section view and optional version
//! records. All section inputs are slices that live as long as the process;
//! the loader never unmaps an object's tables while resolution can run.

use crate::{
    hash::HashTable,
    version::VersionTable,
};
use core::ffi::CStr;
use elf::abi::{
    SHN_UNDEF, STB_GLOBAL, STB_GNU_UNIQUE, STB_LOCAL, STB_WEAK, STT_COMMON, STT_FUNC,
    STT_GNU_IFUNC, STT_NOTYPE, STT_OBJECT, STT_TLS, STV_HIDDEN, STV_INTERNAL,
};

/// Bindings a definition may carry and still satisfy a reference.
/// This mask includes STB_GLOBAL, STB_WEAK, and STB_GNU_UNIQUE bindings.
const OK_BINDS: usize = 1 << STB_GLOBAL | 1 << STB_WEAK | 1 << STB_GNU_UNIQUE;

/// Symbol types a definition may carry and still satisfy a reference.
/// This mask includes STT_NOTYPE, STT_OBJECT, STT_FUNC, STT_COMMON, STT_TLS,
/// and STT_GNU_IFUNC types.
const OK_TYPES: usize = 1 << STT_NOTYPE
    | 1 << STT_OBJECT
    | 1 << STT_FUNC
    | 1 << STT_COMMON
    | 1 << STT_TLS
    | 1 << STT_GNU_IFUNC;

/// ELF symbol table entry (64-bit layout).
///
/// Wraps the on-disk record and provides accessor methods so callers never
/// poke at packed info bytes directly.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[repr(C)]
pub struct ElfSym {
    pub st_name: u32,
    pub st_info: u8,
    pub st_other: u8,
    pub st_shndx: u16,
    pub st_value: u64,
    pub st_size: u64,
}

impl ElfSym {
    /// Returns the symbol value.
    #[inline]
    pub fn st_value(&self) -> usize {
        self.st_value as usize
    }

    /// Returns the symbol binding.
    #[inline]
    pub fn st_bind(&self) -> u8 {
        self.st_info >> 4
    }

    /// Returns the symbol type.
    #[inline]
    pub fn st_type(&self) -> u8 {
        self.st_info & 0xf
    }

    /// Returns the section index.
    #[inline]
    pub fn st_shndx(&self) -> usize {
        self.st_shndx as usize
    }

    /// Returns the symbol name index.
    #[inline]
    pub fn st_name(&self) -> usize {
        self.st_name as usize
    }

    /// Returns the symbol size.
    #[inline]
    pub fn st_size(&self) -> usize {
        self.st_size as usize
    }

    /// Returns the symbol visibility.
    #[inline]
    pub fn st_visibility(&self) -> u8 {
        self.st_other & 0x3
    }

    /// Returns true if the symbol is undefined (not defined in this object).
    #[inline]
    pub fn is_undef(&self) -> bool {
        self.st_shndx == SHN_UNDEF
    }

    /// Returns true if the symbol has a binding a reference may bind to.
    #[inline]
    pub fn is_ok_bind(&self) -> bool {
        (1 << self.st_bind()) & OK_BINDS != 0
    }

    /// Returns true if the symbol has a type a reference may bind to.
    #[inline]
    pub fn is_ok_type(&self) -> bool {
        (1 << self.st_type()) & OK_TYPES != 0
    }

    /// Returns true if the symbol has local binding.
    #[inline]
    pub fn is_local(&self) -> bool {
        self.st_bind() == STB_LOCAL
    }

    /// Returns true if the symbol has weak binding.
    #[inline]
    pub fn is_weak(&self) -> bool {
        self.st_bind() == STB_WEAK
    }

    /// Hidden and internal symbols bind locally; resolution never hands them
    /// out across modules.
    #[inline]
    pub fn binds_local(&self) -> bool {
        self.st_visibility() == STV_HIDDEN || self.st_visibility() == STV_INTERNAL
    }
}

/// ELF string table wrapper
///
/// Provides access to the null-terminated names the symbol table refers to.
#[derive(Clone, Copy)]
pub struct StringTable {
    data: &'static [u8],
}

impl StringTable {
    pub const fn new(data: &'static [u8]) -> Self {
        StringTable { data }
    }

    /// Get a C-style string from the string table at the specified offset.
    #[inline]
    pub(crate) fn get_cstr(&self, offset: usize) -> &'static CStr {
        CStr::from_bytes_until_nul(&self.data[offset..]).unwrap_or_default()
    }

    #[inline]
    fn convert_cstr(s: &CStr) -> &str {
        unsafe { core::str::from_utf8_unchecked(s.to_bytes()) }
    }

    /// Get a Rust string slice from the string table at the specified offset.
    #[inline]
    pub(crate) fn get_str(&self, offset: usize) -> &'static str {
        Self::convert_cstr(self.get_cstr(offset))
    }
}

/// Symbol table of a loaded module.
///
/// Owns the hash section view and knows how to enumerate the candidate
/// definitions for a precomputed name hash.
pub struct SymbolTable {
    /// Hash section view used to enumerate lookup candidates.
    pub(crate) hashtab: HashTable,

    /// The dynamic symbol table.
    pub(crate) symtab: &'static [ElfSym],

    /// String table for symbol names.
    pub(crate) strtab: StringTable,

    /// Symbol version records, when the module carries any.
    pub(crate) version: Option<VersionTable>,
}

impl SymbolTable {
    /// Wires up the hash section view for a module's symbol table.
    ///
    /// The symbol slice may be longer than the set reachable through the
    /// hash section; the view reports how many entries the section covers.
    ///
    /// # Arguments
    /// * `hash_section` - Raw bytes of the `.gnu.hash` or `.hash` section.
    /// * `symtab` - The dynamic symbol table.
    /// * `strtab` - Raw bytes of the dynamic string table.
    /// * `version` - Version records, if the module has them.
    pub fn new(
        hash_section: crate::hash::HashSection,
        symtab: &'static [ElfSym],
        strtab: &'static [u8],
        version: Option<VersionTable>,
    ) -> crate::Result<Self> {
        let hashtab = HashTable::parse(hash_section, symtab.len())?;
        Ok(SymbolTable {
            hashtab,
            symtab,
            strtab: StringTable::new(strtab),
            version,
        })
    }

    /// Get a reference to the string table.
    #[inline]
    pub(crate) fn strtab(&self) -> &StringTable {
        &self.strtab
    }

    /// Get the symbol at the specified index.
    #[inline]
    pub(crate) fn symbol(&self, idx: usize) -> &ElfSym {
        &self.symtab[idx]
    }

    /// Get the name of the symbol at the specified index.
    #[inline]
    pub(crate) fn symbol_name(&self, idx: usize) -> &'static str {
        self.strtab.get_str(self.symtab[idx].st_name())
    }

    /// The module's version records, when it carries any.
    #[inline]
    pub(crate) fn version_table(&self) -> Option<&VersionTable> {
        self.version.as_ref()
    }

    /// Get the number of symbols reachable through the hash section.
    #[inline]
    pub fn count_syms(&self) -> usize {
        self.hashtab.count_syms()
    }

    /// Whether the module carries version records.
    #[inline]
    pub(crate) fn has_versions(&self) -> bool {
        self.version.is_some()
    }

    /// Find a defined symbol by name, ignoring versions.
    ///
    /// This is the direct single-module probe; scope-wide resolution with
    /// precedence rules lives in the resolver.
    pub fn lookup_by_name(&self, name: &str) -> Option<&'static ElfSym> {
        let symtab = self.symtab;
        let hash = crate::hash::gnu_hash(name.as_bytes());
        let mut sysv_hash = None;
        for idx in self.hashtab.candidates(hash, &mut sysv_hash, name) {
            let sym = &symtab[idx];
            if !sym.is_undef()
                && sym.is_ok_bind()
                && sym.is_ok_type()
                && self.symbol_name(idx) == name
            {
                return Some(sym);
            }
        }
        None
    }

}
