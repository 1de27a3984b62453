//! # rtld_core
//! The symbol-resolution and thread-local-storage core of a dynamic loader.
//!
//! The crate owns the parts of run-time linking that are independent of how
//! objects get mapped into memory: walking search scopes for symbol
//! definitions with the full precedence rules (weak, unique, protected,
//! versioned), recording the dependency edges bindings create, and managing
//! TLS module IDs, static-block layout and per-thread DTVs.
//!
//! A loader registers every mapped object as a [`Module`] inside an
//! [`RtldState`] and drives resolution through [`resolver::lookup_symbol`];
//! the TLS side hangs off [`RtldState::tls`]. The crate is `no_std` (plus
//! `alloc`) and keeps no globals, so a loader can host several independent
//! states if it wants to.
#![no_std]
extern crate alloc;
#[cfg(test)]
extern crate std;

mod deps;
mod error;
mod fastload;
pub mod hash;
mod matcher;
pub mod module;
pub mod resolver;
pub mod scope;
pub mod state;
pub mod symbol;
#[cfg(test)]
mod tests_support;
pub mod tls;
mod unique;
pub mod version;

pub use elf::abi;

pub use error::Error;
pub use hash::{HashSection, gnu_hash, sysv_hash};
pub use module::{Module, ModuleBuilder, ModuleKind, ModuleRef, ModuleWeak, Reloc, RelocKind};
pub use resolver::{LookupFlags, ResolvedSymbol, TypeClass, lookup_symbol};
pub use scope::Scope;
pub use state::{BASE_NS, DebugFlags, GscopeControl, Namespace, RtldState, Tunables};
pub use symbol::{ElfSym, StringTable, SymbolTable};
pub use tls::{Dtv, ThreadTls, TlsState, TlsTemplate};
pub use version::{VersionReq, VersionTable};

pub type Result<T> = core::result::Result<T, Error>;
