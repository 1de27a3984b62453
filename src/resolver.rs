//! Scope-wide symbol resolution
//!
//! [`lookup_symbol`] is the entry point relocation and `dlsym`-style probes
//! go through. It walks the caller's scope list in order, asks each module's
//! hash section for candidates, and applies the precedence rules between
//! acceptable definitions: first definition wins, weak definitions defer to
//! later global ones only in the historic mode, unique definitions resolve
//! through the per-namespace table, and protected references bind back to
//! the referencing module.
//!
//! Binding a runtime-loaded definition also records a dependency edge so the
//! definer cannot be unloaded from under the reference; when the definer
//! vanishes while the edge is taken, the whole lookup transparently repeats.

use crate::{
    deps::AddDependency,
    error::{undefined_symbol_error, version_mismatch_error},
    fastload::FastloadCache,
    hash::gnu_hash,
    matcher::ChainMatcher,
    module::{ModuleKind, ModuleRef},
    scope::Scope,
    state::{BASE_NS, DebugFlags, RtldState},
    symbol::ElfSym,
    version::VersionReq,
};
use alloc::string::ToString;
use bitflags::bitflags;
use core::ptr;
use elf::abi::{STB_GLOBAL, STB_GNU_UNIQUE, STB_WEAK, STV_PROTECTED};
use log::debug;

bitflags! {
    /// What kind of relocation the reference comes from. The class changes
    /// which definitions are acceptable, not how the scope is walked.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct TypeClass: u32 {
        /// A jump-slot reference; must never bind to an undefined PLT entry.
        const PLT = 1;
        /// A copy relocation in the executable; the executable's own
        /// definition is the destination, not a source.
        const COPY = 2;
        /// Second-pass probe for protected data: definitions the executable
        /// shadows with a copy relocation do not count.
        const EXTERN_PROTECTED_DATA = 4;
    }
}

bitflags! {
    /// Per-call behavior switches.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct LookupFlags: u32 {
        /// Record a dependency edge from the referencing module to the
        /// defining one.
        const ADD_DEPENDENCY = 1 << 0;
        /// The calling thread holds its global-scope guard; it must be
        /// released around the namespace load lock.
        const GSCOPE_LOCK = 1 << 1;
        /// Program-interface probe (`dlsym` and friends): among several
        /// versions of a name, bind the newest public one instead of the
        /// compatibility default an old binary would get.
        const RETURN_NEWEST = 1 << 2;
    }
}

/// A successful binding: the definition and the module that owns it.
#[derive(Clone)]
pub struct ResolvedSymbol {
    pub sym: &'static ElfSym,
    pub module: ModuleRef,
}

impl ResolvedSymbol {
    /// The bound address: module-relative for regular symbols; TLS symbols
    /// go through the TLS machinery instead.
    #[inline]
    pub fn value(&self) -> usize {
        self.sym.st_value()
    }
}

impl core::fmt::Debug for ResolvedSymbol {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ResolvedSymbol")
            .field("module", &self.module.name())
            .field("value", &self.value())
            .finish()
    }
}

/// Immutable per-lookup inputs plus the lazily computed SysV hash, shared
/// across every module and scope of one walk.
struct LookupContext<'a> {
    name: &'a str,
    hash: u32,
    sysv_hash: Option<u32>,
    ref_sym: Option<&'static ElfSym>,
    version: Option<&'a VersionReq<'a>>,
    flags: LookupFlags,
}

enum Outcome {
    Resolved(ResolvedSymbol),
    Unresolved,
    /// The definer was unloaded while the dependency edge was being taken.
    Retry,
}

/// Resolve `name` against the scope list, in order.
///
/// `undef_map` is the module containing the reference; `ref_sym` its symbol
/// record, whose binding decides whether an unresolved reference is an error
/// (strong) or a null result (weak). `skip_map` restarts the search behind a
/// given module, which is how `RTLD_NEXT` behaves; unresolved strong
/// references are not reported as errors in that mode.
///
/// # Errors
/// [`crate::Error::UndefinedSymbol`] for an unresolved strong reference and
/// [`crate::Error::VersionMismatch`] when the object named by a version
/// requirement is in scope but lacks the version.
#[allow(clippy::too_many_arguments)]
pub fn lookup_symbol(
    state: &RtldState,
    name: &str,
    undef_map: Option<&ModuleRef>,
    ref_sym: Option<&'static ElfSym>,
    scopes: &[&Scope],
    version: Option<&VersionReq<'_>>,
    type_class: TypeClass,
    flags: LookupFlags,
    skip_map: Option<&ModuleRef>,
) -> crate::Result<Option<ResolvedSymbol>> {
    let mut ctx = LookupContext {
        name,
        hash: gnu_hash(name.as_bytes()),
        sysv_hash: None,
        ref_sym,
        version,
        flags,
    };
    loop {
        match lookup_once(
            state, &mut ctx, undef_map, scopes, type_class, skip_map,
        )? {
            Outcome::Resolved(found) => return Ok(Some(found)),
            Outcome::Unresolved => return Ok(None),
            Outcome::Retry => continue,
        }
    }
}

fn lookup_once(
    state: &RtldState,
    ctx: &mut LookupContext<'_>,
    undef_map: Option<&ModuleRef>,
    scopes: &[&Scope],
    type_class: TypeClass,
    skip_map: Option<&ModuleRef>,
) -> crate::Result<Outcome> {
    let mut current: Option<ResolvedSymbol> = None;

    for (scope_idx, scope) in scopes.iter().enumerate() {
        let list = scope.snapshot();
        // Restart behind the skipped module; it is only ever on the first
        // scope of its own lookup.
        let start = match skip_map {
            Some(skip) if scope_idx == 0 => list
                .iter()
                .position(|m| ptr::eq(&**m, &**skip))
                .unwrap_or(0),
            _ => 0,
        };
        let fastload = if start == 0 {
            fastload_for(state, *scope)
        } else {
            None
        };
        match do_lookup(
            state, ctx, list, start, type_class, skip_map, undef_map, fastload, &mut current,
        ) {
            Ok(true) => break,
            Ok(false) => {}
            // A version conflict is only reportable for a plain lookup; a
            // skip-style search keeps going and simply comes up empty.
            Err(err) if skip_map.is_none() => return Err(err),
            Err(_) => {}
        }
    }

    let Some(mut found) = current else {
        let weak_ref = ctx.ref_sym.is_some_and(ElfSym::is_weak);
        if !weak_ref && skip_map.is_none() && !state.debug().contains(DebugFlags::UNUSED) {
            return Err(undefined_symbol_error(
                ctx.name,
                referer_name(undef_map),
                ctx.version.map(|req| req.name.to_string()),
            ));
        }
        return Ok(Outcome::Unresolved);
    };

    // A protected reference must observe its own module's definition even
    // when something earlier in scope preempts the name.
    let mut protected_bound = false;
    if let Some(reference) = ctx.ref_sym
        && reference.st_visibility() == STV_PROTECTED
    {
        if type_class == TypeClass::PLT {
            if let Some(undef) = undef_map
                && !ptr::eq(&*found.module, &**undef)
            {
                found = ResolvedSymbol {
                    sym: reference,
                    module: undef.clone(),
                };
                protected_bound = true;
            }
        } else if let Some(undef) = undef_map {
            // For data the preempting definition only wins when it is the
            // one every other module binds to as well; re-run the walk with
            // the executable's copy-relocation shadows excluded to find out.
            let mut canonical: Option<ResolvedSymbol> = None;
            for (scope_idx, scope) in scopes.iter().enumerate() {
                let list = scope.snapshot();
                let start = match skip_map {
                    Some(skip) if scope_idx == 0 => list
                        .iter()
                        .position(|m| ptr::eq(&**m, &**skip))
                        .unwrap_or(0),
                    _ => 0,
                };
                match do_lookup(
                    state,
                    ctx,
                    list,
                    start,
                    TypeClass::EXTERN_PROTECTED_DATA,
                    skip_map,
                    None,
                    None,
                    &mut canonical,
                ) {
                    Ok(false) => {}
                    Ok(true) | Err(_) => break,
                }
            }
            if let Some(canonical) = canonical
                && !ptr::eq(&*canonical.module, &**undef)
            {
                found = ResolvedSymbol {
                    sym: reference,
                    module: undef.clone(),
                };
                protected_bound = true;
            }
        }
    }

    // Binding into a runtime-loaded object must keep that object alive for
    // as long as the referencing one.
    if found.module.kind() == ModuleKind::Loaded
        && ctx.flags.contains(LookupFlags::ADD_DEPENDENCY)
        && let Some(undef) = undef_map
        && state.add_dependency(undef, &found.module, ctx.flags) == AddDependency::Retry
    {
        return Ok(Outcome::Retry);
    }

    found.module.mark_used();

    if state.debug().contains(DebugFlags::BINDINGS) {
        debug!(
            "binding file {} [{}] to {} [{}]: {} symbol `{}'{}",
            referer_name(undef_map),
            undef_map.map_or(BASE_NS, |m| m.namespace()),
            found.module.name(),
            found.module.namespace(),
            if protected_bound { "protected" } else { "normal" },
            ctx.name,
            match ctx.version {
                Some(req) => alloc::format!(" [{}]", req.name),
                None => alloc::string::String::new(),
            },
        );
    }

    Ok(Outcome::Resolved(found))
}

/// Walk one scope list from `start`.
///
/// A definitive binding fills `result` and returns `true`, ending the whole
/// lookup. A weak definition in the historic mode fills `result` only if it
/// is still empty and returns `false`, so a later global definition in any
/// scope may overwrite it.
#[allow(clippy::too_many_arguments)]
fn do_lookup(
    state: &RtldState,
    ctx: &mut LookupContext<'_>,
    list: &[ModuleRef],
    start: usize,
    type_class: TypeClass,
    skip: Option<&ModuleRef>,
    undef_map: Option<&ModuleRef>,
    fastload: Option<&FastloadCache>,
    result: &mut Option<ResolvedSymbol>,
) -> crate::Result<bool> {
    let mut begin = start;
    if let Some(cache) = fastload {
        let pos = cache.position(ctx.hash, ctx.name);
        if state.debug().contains(DebugFlags::FASTLOAD) {
            debug!("fastload: symbol={}; start position {}", ctx.name, pos);
        }
        if pos >= list.len() {
            return Ok(false);
        }
        if pos > begin {
            begin = pos;
        }
    }

    for module in &list[begin..] {
        if let Some(skip) = skip
            && ptr::eq(&**module, &**skip)
        {
            continue;
        }
        // A copy relocation copies out of a library into the executable;
        // the executable's own definition is the destination.
        if type_class.contains(TypeClass::COPY) && module.kind() == ModuleKind::Executable {
            continue;
        }
        if module.is_removed() {
            continue;
        }

        let symbols = module.symbols();
        if state.debug().contains(DebugFlags::SYMBOLS) {
            debug!(
                "symbol={}; lookup in file={} [{}]",
                ctx.name,
                module.name(),
                module.namespace()
            );
        }

        let mut matcher = ChainMatcher::new();
        let mut found: Option<&'static ElfSym> = None;
        for symidx in symbols
            .hashtab
            .candidates(ctx.hash, &mut ctx.sysv_hash, ctx.name)
        {
            if let Some(sym) = matcher.check(
                symbols, symidx, ctx.name, ctx.ref_sym, ctx.version, type_class, ctx.flags,
            ) {
                // Hidden and internal definitions bind locally and are
                // never handed out; keep scanning the chain.
                if sym.binds_local() {
                    continue;
                }
                found = Some(sym);
                break;
            }
        }
        let found = match found {
            Some(sym) => Some(sym),
            None => matcher.into_default(),
        };

        let Some(sym) = found else {
            // The module named by the version requirement is right here and
            // does not define the version; no later module can fix that.
            if let Some(req) = ctx.version
                && let Some(file) = req.filename
                && module.matches_name(file)
            {
                return Err(version_mismatch_error(
                    ctx.name,
                    req.name,
                    file,
                    referer_name(undef_map),
                    !symbols.has_versions(),
                ));
            }
            continue;
        };

        // In the second protected-data pass the executable's copy shadows
        // the original; the copy is not the canonical definition.
        if type_class.contains(TypeClass::EXTERN_PROTECTED_DATA)
            && undef_map.is_none()
            && module.kind() == ModuleKind::Executable
            && module.has_copy_relocation(ctx.name)
        {
            continue;
        }

        match sym.st_bind() {
            STB_WEAK if state.tunables().dynamic_weak => {
                // Historic mode: remember the first weak definition but let
                // a global one anywhere later in the walk take over.
                if result.is_none() {
                    *result = Some(ResolvedSymbol {
                        sym,
                        module: module.clone(),
                    });
                }
            }
            STB_GLOBAL | STB_WEAK => {
                *result = Some(ResolvedSymbol {
                    sym,
                    module: module.clone(),
                });
                return Ok(true);
            }
            STB_GNU_UNIQUE => {
                let uname = symbols.strtab().get_str(sym.st_name());
                let (sym, owner) = state
                    .namespace(module.namespace())
                    .unique
                    .lock()
                    .lookup_or_insert(
                        ctx.hash, uname, sym, module, type_class, ctx.ref_sym, undef_map,
                    );
                *result = Some(ResolvedSymbol {
                    sym,
                    module: owner,
                });
                return Ok(true);
            }
            // Local definitions never satisfy a cross-module reference.
            _ => {}
        }
    }

    Ok(false)
}

/// The base namespace's fastload cache, when `scope` is that namespace's
/// main scope and the cache has been built.
fn fastload_for<'a>(state: &'a RtldState, scope: &Scope) -> Option<&'a FastloadCache> {
    let ns = state.namespace(BASE_NS);
    if ptr::eq(scope, ns.main_scope()) {
        ns.fastload()
    } else {
        None
    }
}

fn referer_name(undef_map: Option<&ModuleRef>) -> &str {
    undef_map.map_or("<main program>", |m| m.name())
}
