//! Helpers shared by the integration tests: modules assembled in memory
//! through the public API, laid out the way a linker would emit them.
#![allow(dead_code)]

use rtld_core::{
    ElfSym, HashSection, Module, ModuleKind, ModuleRef, RtldState, SymbolTable, TlsTemplate,
    Tunables, VersionTable,
    abi::{STB_GLOBAL, STB_GNU_UNIQUE, STB_WEAK, STT_FUNC, STT_OBJECT, STT_TLS},
    gnu_hash,
};

pub fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub fn leak_words(words: &[u32]) -> &'static [u8] {
    let n64 = words.len().div_ceil(2);
    let mut storage: Vec<u64> = vec![0; n64];
    for (i, word) in words.iter().enumerate() {
        let shift = (i % 2) * 32;
        storage[i / 2] |= u64::from(*word) << shift;
    }
    let leaked: &'static [u64] = Box::leak(storage.into_boxed_slice());
    let bytes =
        unsafe { std::slice::from_raw_parts(leaked.as_ptr().cast::<u8>(), leaked.len() * 8) };
    &bytes[..words.len() * 4]
}

pub fn leak<T>(v: Vec<T>) -> &'static [T] {
    Box::leak(v.into_boxed_slice())
}

pub fn func(value: u64) -> ElfSym {
    ElfSym {
        st_info: (STB_GLOBAL << 4) | STT_FUNC,
        st_shndx: 1,
        st_value: value,
        st_size: 8,
        ..Default::default()
    }
}

pub fn weak_func(value: u64) -> ElfSym {
    ElfSym {
        st_info: (STB_WEAK << 4) | STT_FUNC,
        st_shndx: 1,
        st_value: value,
        st_size: 8,
        ..Default::default()
    }
}

pub fn unique_func(value: u64) -> ElfSym {
    ElfSym {
        st_info: (STB_GNU_UNIQUE << 4) | STT_FUNC,
        st_shndx: 1,
        st_value: value,
        st_size: 8,
        ..Default::default()
    }
}

pub fn object(value: u64, size: u64) -> ElfSym {
    ElfSym {
        st_info: (STB_GLOBAL << 4) | STT_OBJECT,
        st_shndx: 2,
        st_value: value,
        st_size: size,
        ..Default::default()
    }
}

pub fn tls_object(offset: u64, size: u64) -> ElfSym {
    ElfSym {
        st_info: (STB_GLOBAL << 4) | STT_TLS,
        st_shndx: 3,
        st_value: offset,
        st_size: size,
        ..Default::default()
    }
}

/// Assemble a `.gnu.hash` section plus matching symbol, string and version
/// index tables. Symbols are re-sorted by bucket the way linkers emit them;
/// symbol 0 stays the null entry.
pub fn build_gnu_tables(
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

pub fn module(name: &str, kind: ModuleKind, syms: &[(&str, ElfSym)]) -> ModuleRef {
    let versioned: Vec<(&str, ElfSym, u16)> =
        syms.iter().map(|&(name, sym)| (name, sym, 0)).collect();
    let (section, symtab, strtab, _versym) = build_gnu_tables(&versioned);
    let symbols = SymbolTable::new(section, symtab, strtab, None).unwrap();
    Module::builder(name, kind).symbols(symbols).build(0, [])
}

/// A module with version records. Symbol entries carry their version index,
/// hidden bit included.
pub fn module_versioned(
    name: &str,
    kind: ModuleKind,
    syms: &[(&str, ElfSym, u16)],
    records: &[(u16, &'static str)],
) -> ModuleRef {
    let (section, symtab, strtab, versym) = build_gnu_tables(syms);
    let version = VersionTable::new(versym, records.iter().copied());
    let symbols = SymbolTable::new(section, symtab, strtab, Some(version)).unwrap();
    Module::builder(name, kind).symbols(symbols).build(0, [])
}

pub fn module_with_tls(
    name: &str,
    kind: ModuleKind,
    image: &'static [u8],
    memsz: usize,
    align: usize,
) -> ModuleRef {
    let (section, symtab, strtab, _versym) = build_gnu_tables(&[]);
    let symbols = SymbolTable::new(section, symtab, strtab, None).unwrap();
    Module::builder(name, kind)
        .symbols(symbols)
        .tls(TlsTemplate {
            image,
            memsz,
            align,
            firstbyte_offset: 0,
        })
        .build(0, [])
}

pub fn state_with(tunables: Tunables, modules: &[&ModuleRef]) -> RtldState {
    let state = RtldState::new(1, tunables);
    for module in modules {
        state.register_module(module);
    }
    state
}
