mod common;

use common::*;
use rstest::rstest;
use rtld_core::tls::ExtraBlock;
use rtld_core::{ModuleKind, ModuleRef, TlsState};

fn register(state: &TlsState, module: &ModuleRef) {
    state.assign_tls_modid(module);
    assert!(state.add_to_slotinfo(module, true));
    state.bump_generation();
}

#[rstest]
fn startup_modules_share_the_static_block() {
    init_logger();
    let state = TlsState::new();
    let a = module_with_tls("a.so", ModuleKind::Library, b"\x01\x02\x03\x04", 32, 16);
    let b = module_with_tls("b.so", ModuleKind::Library, b"\xff", 8, 8);
    register(&state, &a);
    register(&state, &b);
    assert_eq!(a.tls_modid(), 1);
    assert_eq!(b.tls_modid(), 2);

    assert!(state.get_tls_static_info().is_none());
    state.determine_offsets(&[a.clone(), b.clone()], ExtraBlock::default());
    let (size, align) = state.get_tls_static_info().expect("layout planned");
    assert!(align >= 16);
    // Both blocks plus the configured surplus must fit.
    assert!(size >= 32 + 8);

    let mut tls = unsafe { state.allocate_tls(None) }.expect("thread storage");
    let pa = unsafe { state.tls_get_addr(&mut tls, a.tls_modid(), 0) };
    let pb = unsafe { state.tls_get_addr(&mut tls, b.tls_modid(), 0) };
    assert_eq!(pa as usize % 16, 0);
    assert_eq!(pb as usize % 8, 0);

    let da = unsafe { std::slice::from_raw_parts(pa, 32) };
    assert_eq!(&da[..4], b"\x01\x02\x03\x04");
    assert!(da[4..].iter().all(|&x| x == 0));
    let db = unsafe { std::slice::from_raw_parts(pb, 8) };
    assert_eq!(db[0], 0xff);

    // The two blocks are disjoint.
    let (lo, hi) = if pa < pb { (pa, pb) } else { (pb, pa) };
    assert!(unsafe { lo.add(if lo == pa { 32 } else { 8 }) } <= hi);
    state.deallocate_tls(tls, true);
}

#[rstest]
fn second_thread_sees_the_same_offsets() {
    init_logger();
    let state = TlsState::new();
    let a = module_with_tls("a.so", ModuleKind::Library, b"\x7e", 16, 16);
    register(&state, &a);
    state.determine_offsets(&[a.clone()], ExtraBlock::default());

    let mut t1 = unsafe { state.allocate_tls(None) }.expect("thread 1");
    let mut t2 = unsafe { state.allocate_tls(None) }.expect("thread 2");
    let p1 = unsafe { state.tls_get_addr(&mut t1, 1, 0) };
    let p2 = unsafe { state.tls_get_addr(&mut t2, 1, 0) };
    assert_ne!(p1, p2);
    // Same offset relative to each thread pointer.
    let off1 = p1 as isize - t1.tcb().as_ptr() as isize;
    let off2 = p2 as isize - t2.tcb().as_ptr() as isize;
    assert_eq!(off1, off2);

    // Writes stay thread-private.
    unsafe { *p1 = 0x11 };
    assert_eq!(unsafe { *p2 }, 0x7e);
    state.deallocate_tls(t1, true);
    state.deallocate_tls(t2, true);
}

#[rstest]
fn late_loads_use_dynamic_blocks() {
    init_logger();
    let state = TlsState::new();
    state.determine_offsets(&[], ExtraBlock::default());
    let mut tls = unsafe { state.allocate_tls(None) }.expect("thread storage");

    let plugin = module_with_tls("plugin.so", ModuleKind::Loaded, b"\x2a\x2b", 64, 32);
    register(&state, &plugin);
    let modid = plugin.tls_modid();

    // The thread's vector predates the load; first access catches up and
    // materializes the block.
    let p = unsafe { state.tls_get_addr(&mut tls, modid, 0) };
    assert_eq!(tls.dtv.generation(), state.generation());
    assert_eq!(p as usize % 32, 0);
    let data = unsafe { std::slice::from_raw_parts(p, 64) };
    assert_eq!(&data[..2], b"\x2a\x2b");
    assert!(data[2..].iter().all(|&x| x == 0));

    let again = unsafe { state.tls_get_addr(&mut tls, modid, 16) };
    assert_eq!(again as usize, p as usize + 16);
    state.deallocate_tls(tls, true);
}

#[rstest]
fn unloading_recycles_module_ids() {
    init_logger();
    let state = TlsState::new();
    state.determine_offsets(&[], ExtraBlock::default());
    let mut tls = unsafe { state.allocate_tls(None) }.expect("thread storage");

    let first = module_with_tls("one.so", ModuleKind::Loaded, b"\x01", 16, 16);
    register(&state, &first);
    let id = first.tls_modid();
    let p1 = unsafe { state.tls_get_addr(&mut tls, id, 0) };
    assert_eq!(unsafe { *p1 }, 0x01);

    state.remove_from_slotinfo(&first);
    state.bump_generation();
    drop(first);

    let second = module_with_tls("two.so", ModuleKind::Loaded, b"\x02", 16, 16);
    register(&state, &second);
    assert_eq!(second.tls_modid(), id);

    // The stale block is replaced by the new module's image.
    let p2 = unsafe { state.tls_get_addr(&mut tls, id, 0) };
    assert_eq!(unsafe { *p2 }, 0x02);
    state.deallocate_tls(tls, true);
}

#[rstest]
fn soft_probe_reports_only_materialized_blocks() {
    init_logger();
    let state = TlsState::new();
    state.determine_offsets(&[], ExtraBlock::default());
    let mut tls = unsafe { state.allocate_tls(None) }.expect("thread storage");

    let plugin = module_with_tls("plugin.so", ModuleKind::Loaded, &[], 16, 16);
    register(&state, &plugin);

    assert!(state.tls_get_addr_soft(&tls, &plugin).is_none());
    let p = unsafe { state.tls_get_addr(&mut tls, plugin.tls_modid(), 0) };
    let probed = state
        .tls_get_addr_soft(&tls, &plugin)
        .expect("block exists now");
    assert_eq!(probed.as_ptr(), p);
    state.deallocate_tls(tls, true);
}

#[rstest]
fn audit_namespaces_must_fit_the_budget() {
    let state = TlsState::new();
    assert!(state.static_surplus_init(Some(4), 512, 2).is_ok());
    // Claiming every namespace leaves no room for audit namespaces.
    assert!(state.static_surplus_init(Some(16), 512, 1).is_err());
}
