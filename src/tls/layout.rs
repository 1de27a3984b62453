//! Static TLS block layout
//!
//! Startup modules get fixed offsets in one block allocated next to the
//! thread control block (TCB). Targets place the block either below the
//! thread pointer (x86 family) or above it (aarch64, riscv); the direction
//! is fixed per target, so the two planners are separate types and the
//! native one is picked at build time.
//!
//! Linkers lay TLS data out against the segment's file position, so the
//! first byte of a block may need padding before it. The planners reuse
//! that padding for a later, smaller block when it fits.

use super::TlsTemplate;
use crate::module::ModuleRef;
use core::sync::atomic::Ordering;

/// Maximum number of namespaces the surplus budget covers.
pub const DL_NNS: usize = 16;

/// Initial-exec surplus per namespace for the core library.
const LIBC_IE_TLS: usize = 144;
/// Initial-exec surplus per namespace for other libraries.
const OTHER_IE_TLS: usize = 144;
pub(super) const DEFAULT_NNS: usize = 4;
pub(super) const OPTIONAL_TLS: usize = 512;

pub(super) const fn tls_static_surplus(nns: usize, opt_tls: usize) -> usize {
    (nns - 1) * LIBC_IE_TLS + nns * OTHER_IE_TLS + opt_tls
}

/// Historic calibration: the default surplus used to be 1664 bytes and
/// binaries grew to depend on it.
pub(super) const LEGACY_TLS: usize = 1664 - tls_static_surplus(DEFAULT_NNS, OPTIONAL_TLS);

/// An opaque internal-use region appended after every module block.
#[derive(Clone, Copy, Debug, Default)]
pub struct ExtraBlock {
    /// Size, a multiple of `align`.
    pub size: usize,
    pub align: usize,
}

/// Result of the one-shot static layout pass.
#[derive(Clone, Copy, Debug)]
pub struct StaticLayout {
    /// Total allocation size per thread, TCB included.
    pub size: usize,
    /// Alignment of the allocation.
    pub align: usize,
    /// Bytes used by module blocks and the extra region, surplus excluded.
    pub used: usize,
    /// Signed offset of the extra region from the thread pointer.
    pub extra_offset: isize,
}

/// One direction of static TLS placement.
///
/// Offsets stored in a module's TLS offset field are interpreted through the
/// same strategy that assigned them: with [`TcbAtTp`] an offset is the byte
/// distance below the thread pointer, with [`DtvAtTp`] the distance above it.
pub trait LayoutStrategy {
    /// Thread control block bytes included in [`StaticLayout::size`].
    const TCB_SIZE: usize;
    const TCB_ALIGNMENT: usize;

    /// Assign a static offset to every module with a TLS segment and
    /// compute the per-thread block shape.
    fn plan(modules: &[ModuleRef], extra: ExtraBlock, surplus: usize) -> StaticLayout;

    /// Address of a module block given the thread pointer and the module's
    /// assigned offset.
    ///
    /// # Safety
    /// `tcb` must point into a live static TLS allocation shaped by the
    /// layout that produced `offset`.
    unsafe fn static_block_ptr(tcb: *mut u8, offset: isize) -> *mut u8;

    /// Thread pointer position inside a static allocation of `layout.size`
    /// bytes starting at `base`.
    ///
    /// # Safety
    /// `base` must point to at least `layout.size` bytes aligned to
    /// `layout.align`.
    unsafe fn tcb_from_storage(base: *mut u8, layout: &StaticLayout) -> *mut u8;
}

/// Blocks grow toward lower addresses; the TCB sits at the thread pointer,
/// at the top of the allocation.
pub struct TcbAtTp;

/// Blocks grow toward higher addresses, following the TCB at the thread
/// pointer.
pub struct DtvAtTp;

cfg_if::cfg_if! {
    if #[cfg(any(target_arch = "x86_64", target_arch = "x86"))] {
        pub type NativeLayout = TcbAtTp;
    } else {
        pub type NativeLayout = DtvAtTp;
    }
}

fn roundup(value: usize, align: usize) -> usize {
    value.div_ceil(align) * align
}

/// Padding needed before the block so its first byte lands on the file's
/// position modulo the alignment.
fn firstbyte(template: &TlsTemplate) -> usize {
    template.firstbyte_offset.wrapping_neg() & (template.align - 1)
}

fn tls_modules(modules: &[ModuleRef]) -> impl Iterator<Item = (&ModuleRef, &TlsTemplate)> {
    modules
        .iter()
        .filter_map(|module| module.tls().map(|template| (module, template)))
}

impl LayoutStrategy for TcbAtTp {
    const TCB_SIZE: usize = 64;
    const TCB_ALIGNMENT: usize = 64;

    fn plan(modules: &[ModuleRef], extra: ExtraBlock, surplus: usize) -> StaticLayout {
        let mut max_align = Self::TCB_ALIGNMENT;
        let mut freetop = 0usize;
        let mut freebottom = 0usize;
        let mut offset = 0usize;

        for (module, template) in tls_modules(modules) {
            let firstbyte = firstbyte(template);
            max_align = max_align.max(template.align);

            // Try the gap left by an earlier block's alignment padding.
            if freebottom - freetop >= template.memsz {
                let off = roundup(freetop + template.memsz - firstbyte, template.align)
                    + firstbyte;
                if off <= freebottom {
                    freetop = off;
                    module.tls_offset.store(off as isize, Ordering::Release);
                    continue;
                }
            }

            let off = roundup(offset + template.memsz - firstbyte, template.align) + firstbyte;
            if off > offset + template.memsz + (freebottom - freetop) {
                freetop = offset;
                freebottom = off - template.memsz;
            }
            offset = off;
            module.tls_offset.store(off as isize, Ordering::Release);
        }

        // The extra region is allocated last, so with this direction it ends
        // up first in the block, at the most negative offset.
        max_align = max_align.max(extra.align);
        offset = roundup(offset, extra.align.max(1)) + extra.size;
        let extra_offset = -(offset as isize);

        StaticLayout {
            size: roundup(offset + surplus, max_align) + Self::TCB_SIZE,
            align: max_align,
            used: offset,
            extra_offset,
        }
    }

    #[inline]
    unsafe fn static_block_ptr(tcb: *mut u8, offset: isize) -> *mut u8 {
        unsafe { tcb.sub(offset as usize) }
    }

    #[inline]
    unsafe fn tcb_from_storage(base: *mut u8, layout: &StaticLayout) -> *mut u8 {
        unsafe { base.add(layout.size - Self::TCB_SIZE) }
    }
}

impl LayoutStrategy for DtvAtTp {
    const TCB_SIZE: usize = 16;
    const TCB_ALIGNMENT: usize = 16;

    fn plan(modules: &[ModuleRef], extra: ExtraBlock, surplus: usize) -> StaticLayout {
        let mut max_align = Self::TCB_ALIGNMENT;
        let mut freetop = 0usize;
        let mut freebottom = 0usize;
        // Blocks start right after the TCB.
        let mut offset = Self::TCB_SIZE;

        for (module, template) in tls_modules(modules) {
            let firstbyte = firstbyte(template);
            max_align = max_align.max(template.align);

            if template.memsz <= freetop - freebottom {
                let mut off = roundup(freebottom, template.align);
                if off - freebottom < firstbyte {
                    off += template.align;
                }
                if off + template.memsz - firstbyte <= freetop {
                    module
                        .tls_offset
                        .store((off - firstbyte) as isize, Ordering::Release);
                    freebottom = off + template.memsz - firstbyte;
                    continue;
                }
            }

            let mut off = roundup(offset, template.align);
            if off - offset < firstbyte {
                off += template.align;
            }
            module
                .tls_offset
                .store((off - firstbyte) as isize, Ordering::Release);
            if off - firstbyte - offset > freetop - freebottom {
                freebottom = offset;
                freetop = off - firstbyte;
            }
            offset = off + template.memsz - firstbyte;
        }

        // With this direction the extra region is the last block, right
        // after the modules.
        max_align = max_align.max(extra.align);
        offset = roundup(offset, extra.align.max(1));
        let extra_offset = offset as isize;
        offset += extra.size;

        StaticLayout {
            size: roundup(offset + surplus, Self::TCB_ALIGNMENT),
            align: max_align,
            used: offset,
            extra_offset,
        }
    }

    #[inline]
    unsafe fn static_block_ptr(tcb: *mut u8, offset: isize) -> *mut u8 {
        unsafe { tcb.add(offset as usize) }
    }

    #[inline]
    unsafe fn tcb_from_storage(base: *mut u8, _layout: &StaticLayout) -> *mut u8 {
        base
    }
}
