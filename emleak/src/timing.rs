//! Access-latency measurement, used for calibrating the flush and thrash
//! primitives (not for recovering leaked bits).

use crate::cache::*;
use itertools::Itertools;

/// Read a timestamp counter.
///
/// On x86_64 this is fenced RDTSC. On aarch64 it is the virtual counter
/// (`CNTVCT_EL0`, 54MHz on the BCM2711). That is too coarse to resolve a
/// cache hit, so flush calibrations there rely on [`time_access_batch`]. A
/// load that misses all the way to DRAM still spans several ticks.
#[cfg(target_arch = "x86_64")]
#[inline(always)]
pub fn timestamp() -> u64 {
    use core::arch::x86_64 as arch;
    unsafe {
        arch::_mm_mfence();
        arch::_mm_lfence();
        let tsc = arch::_rdtsc();
        arch::_mm_lfence();
        tsc
    }
}

#[cfg(target_arch = "aarch64")]
#[inline(always)]
pub fn timestamp() -> u64 {
    let cnt: u64;
    unsafe {
        core::arch::asm!("isb", "mrs {}, cntvct_el0", "isb", out(reg) cnt,
            options(nomem, nostack));
    }
    cnt
}

#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
pub fn timestamp() -> u64 {
    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default();
    now.as_nanos() as u64
}

/// Time a single load from `ptr`.
#[inline(always)]
pub fn time_access(ptr: *const u8) -> u64 {
    let start = timestamp();
    unsafe { maccess(ptr) };
    let end = timestamp();
    end.wrapping_sub(start)
}

/// Time `n` loads from `ptr`, optionally flushing before each one.
pub fn time_access_batch(ptr: *const u8, n: usize, flush: bool) -> u64 {
    let start = timestamp();
    for _ in 0..n {
        if flush {
            flush_line(ptr);
        }
        unsafe { maccess(ptr) };
    }
    let end = timestamp();
    end.wrapping_sub(start)
}

/// A list of observed latencies.
#[derive(Clone, Debug)]
pub struct Latencies(pub Vec<u64>);
impl Latencies {
    /// Sample `n` latencies with `sample`.
    pub fn collect(n: usize, mut sample: impl FnMut() -> u64) -> Self {
        Self((0..n).map(|_| sample()).collect())
    }

    pub fn len(&self) -> usize { self.0.len() }

    pub fn min(&self) -> Option<u64> { self.0.iter().copied().min() }

    pub fn max(&self) -> Option<u64> { self.0.iter().copied().max() }

    pub fn median(&self) -> Option<u64> {
        if self.0.is_empty() {
            return None;
        }
        let sorted = self.0.iter().copied().sorted_unstable().collect_vec();
        Some(sorted[sorted.len() / 2])
    }
}

/// Result of comparing cached and uncached accesses to the same line.
#[derive(Clone, Debug)]
pub struct FlushCalibration {
    pub cached: Latencies,
    pub flushed: Latencies,
}

impl FlushCalibration {
    /// Measure `n` cached and `n` flushed accesses to `ptr`.
    pub fn run(ptr: *const u8, n: usize) -> Self {
        let cached = Latencies::collect(n, || {
            unsafe { maccess(ptr) };
            time_access(ptr)
        });
        let flushed = Latencies::collect(n, || {
            flush_line(ptr);
            time_access(ptr)
        });
        Self { cached, flushed }
    }

    /// Returns true when the median flushed access is slower than the
    /// median cached access.
    pub fn distinguishable(&self) -> bool {
        match (self.cached.median(), self.flushed.median()) {
            (Some(c), Some(f)) => f > c,
            _ => false,
        }
    }
}
