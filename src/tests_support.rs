//! Helpers for unit tests: synthetic hash sections and modules assembled in
//! memory, laid out exactly as a linker would emit them.
#![allow(dead_code)]

use crate::{
    hash::{HashSection, gnu_hash, sysv_hash},
    module::{Module, ModuleKind, ModuleRef},
    symbol::{ElfSym, SymbolTable},
};
use alloc::{vec, vec::Vec};
use elf::abi::{STB_GLOBAL, STB_WEAK, STT_FUNC, STT_OBJECT, STT_TLS};

/// Leak 32-bit words as an 8-byte-aligned byte slice, the alignment hash
/// sections get from the loader.
pub(crate) fn leak_words(words: &[u32]) -> &'static [u8] {
    let n64 = words.len().div_ceil(2);
    let mut storage: Vec<u64> = vec![0; n64];
    for (i, word) in words.iter().enumerate() {
        let shift = (i % 2) * 32;
        storage[i / 2] |= u64::from(*word) << shift;
    }
    let leaked: &'static [u64] = alloc::boxed::Box::leak(storage.into_boxed_slice());
    let bytes = unsafe {
        core::slice::from_raw_parts(leaked.as_ptr().cast::<u8>(), leaked.len() * 8)
    };
    &bytes[..words.len() * 4]
}

pub(crate) fn leak<T>(v: Vec<T>) -> &'static [T] {
    alloc::boxed::Box::leak(v.into_boxed_slice())
}

pub(crate) fn func(value: u64) -> ElfSym {
    ElfSym {
        st_info: (STB_GLOBAL << 4) | STT_FUNC,
        st_shndx: 1,
        st_value: value,
        st_size: 8,
        ..Default::default()
    }
}

pub(crate) fn weak_func(value: u64) -> ElfSym {
    ElfSym {
        st_info: (STB_WEAK << 4) | STT_FUNC,
        st_shndx: 1,
        st_value: value,
        st_size: 8,
        ..Default::default()
    }
}

pub(crate) fn object(value: u64, size: u64) -> ElfSym {
    ElfSym {
        st_info: (STB_GLOBAL << 4) | STT_OBJECT,
        st_shndx: 2,
        st_value: value,
        st_size: size,
        ..Default::default()
    }
}

pub(crate) fn tls_object(offset: u64, size: u64) -> ElfSym {
    ElfSym {
        st_info: (STB_GLOBAL << 4) | STT_TLS,
        st_shndx: 3,
        st_value: offset,
        st_size: size,
        ..Default::default()
    }
}

/// Assemble a `.gnu.hash` section plus matching symbol/string tables.
///
/// Symbols are re-sorted by bucket the way linkers emit them; symbol 0 stays
/// the null entry and the section's first hashed index is 1.
pub(crate) fn build_gnu_tables(
    syms: &[(&str, ElfSym)],
) -> (HashSection, &'static [ElfSym], &'static [u8]) {
    let versioned: Vec<(&str, ElfSym, u16)> =
        syms.iter().map(|&(name, sym)| (name, sym, 0)).collect();
    let (section, symtab, strtab, _versym) = build_gnu_tables_versioned(&versioned);
    (section, symtab, strtab)
}

/// Like [`build_gnu_tables`], also emitting a version index table parallel
/// to the re-sorted symbol table.
pub(crate) fn build_gnu_tables_versioned(
    syms: &[(&str, ElfSym, u16)],
) -> (HashSection, &'static [ElfSym], &'static [u8], &'static [u16]) {
    let nbucket = syms.len().max(1) as u32;
    let symbias = 1u32;
    let shift = 6u32;
    let nbloom = 1u32;

    let mut order: Vec<usize> = (0..syms.len()).collect();
    order.sort_by_key(|&i| gnu_hash(syms[i].0.as_bytes()) % nbucket);

    let mut strtab: Vec<u8> = vec![0];
    let mut symtab: Vec<ElfSym> = vec![ElfSym::default()];
    let mut versym: Vec<u16> = vec![0];
    let mut hashes: Vec<u32> = Vec::new();
    for &i in &order {
        let (name, mut sym, ver) = (syms[i].0, syms[i].1, syms[i].2);
        sym.st_name = strtab.len() as u32;
        strtab.extend_from_slice(name.as_bytes());
        strtab.push(0);
        symtab.push(sym);
        versym.push(ver);
        hashes.push(gnu_hash(name.as_bytes()));
    }

    let mut bloom = 0u64;
    for &h in &hashes {
        bloom |= 1u64 << (h % 64);
        bloom |= 1u64 << ((h >> shift) % 64);
    }

    let mut buckets = vec![0u32; nbucket as usize];
    let mut chains = vec![0u32; hashes.len()];
    for (pos, &h) in hashes.iter().enumerate() {
        let bucket = (h % nbucket) as usize;
        if buckets[bucket] == 0 {
            buckets[bucket] = symbias + pos as u32;
        }
        let last_of_bucket = hashes
            .get(pos + 1)
            .is_none_or(|next| next % nbucket != h % nbucket);
        chains[pos] = (h & !1) | u32::from(last_of_bucket);
    }

    let mut words = vec![nbucket, symbias, nbloom, shift];
    words.push((bloom & 0xffff_ffff) as u32);
    words.push((bloom >> 32) as u32);
    words.extend_from_slice(&buckets);
    words.extend_from_slice(&chains);

    (
        HashSection::Gnu(leak_words(&words)),
        leak(symtab),
        leak(strtab),
        leak(versym),
    )
}

/// A module with a GNU hash section and version records. Symbol entries
/// carry their version index (hidden bit included) as emitted into the
/// version index table.
pub(crate) fn gnu_module_versioned(
    name: &str,
    kind: ModuleKind,
    syms: &[(&str, ElfSym, u16)],
    records: &[(u16, &'static str)],
) -> ModuleRef {
    let (section, symtab, strtab, versym) = build_gnu_tables_versioned(syms);
    let version = crate::version::VersionTable::new(versym, records.iter().copied());
    let symbols = SymbolTable::new(section, symtab, strtab, Some(version)).unwrap();
    Module::builder(name, kind).symbols(symbols).build(0, [])
}

/// Assemble a classic `.hash` section plus matching symbol/string tables.
pub(crate) fn build_sysv_tables(
    syms: &[(&str, ElfSym)],
) -> (HashSection, &'static [ElfSym], &'static [u8]) {
    let nbucket = syms.len().max(1) as u32;
    let nchain = syms.len() as u32 + 1;

    let mut strtab: Vec<u8> = vec![0];
    let mut symtab: Vec<ElfSym> = vec![ElfSym::default()];
    let mut buckets = vec![0u32; nbucket as usize];
    let mut chains = vec![0u32; nchain as usize];
    for (i, &(name, mut sym)) in syms.iter().enumerate() {
        sym.st_name = strtab.len() as u32;
        strtab.extend_from_slice(name.as_bytes());
        strtab.push(0);
        symtab.push(sym);
        let symidx = i as u32 + 1;
        let bucket = (sysv_hash(name.as_bytes()) % nbucket) as usize;
        chains[symidx as usize] = buckets[bucket];
        buckets[bucket] = symidx;
    }

    let mut words = vec![nbucket, nchain];
    words.extend_from_slice(&buckets);
    words.extend_from_slice(&chains);

    (
        HashSection::Sysv(leak_words(&words)),
        leak(symtab),
        leak(strtab),
    )
}

/// A module with a GNU hash section over the given symbols.
pub(crate) fn gnu_module(name: &str, kind: ModuleKind, syms: &[(&str, ElfSym)]) -> ModuleRef {
    let (section, symtab, strtab) = build_gnu_tables(syms);
    let symbols = SymbolTable::new(section, symtab, strtab, None).unwrap();
    Module::builder(name, kind).symbols(symbols).build(0, [])
}

/// A module with a GNU hash section and a TLS segment.
pub(crate) fn gnu_module_with_tls(
    name: &str,
    kind: ModuleKind,
    syms: &[(&str, ElfSym)],
    tls: crate::tls::TlsTemplate,
) -> ModuleRef {
    let (section, symtab, strtab) = build_gnu_tables(syms);
    let symbols = SymbolTable::new(section, symtab, strtab, None).unwrap();
    Module::builder(name, kind)
        .symbols(symbols)
        .tls(tls)
        .build(0, [])
}

/// A module with a classic hash section over the given symbols.
pub(crate) fn sysv_module(name: &str, kind: ModuleKind, syms: &[(&str, ElfSym)]) -> ModuleRef {
    let (section, symtab, strtab) = build_sysv_tables(syms);
    let symbols = SymbolTable::new(section, symtab, strtab, None).unwrap();
    Module::builder(name, kind).symbols(symbols).build(0, [])
}
