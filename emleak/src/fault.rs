//! Bounded transient execution.
//!
//! The register-leak gadget deliberately faults. A `SIGSEGV` handler
//! recognizes faults raised from inside the gadget and resumes execution at
//! the gadget's final `ret`, so control returns to the caller as if the
//! gadget had completed normally. Faults anywhere else are not ours: the
//! default disposition is restored and the fault is allowed to recur.
//!
//! The window is described by three process-wide atomics since the handler
//! can't carry any state of its own.

use crate::error::*;
use nix::libc;
use nix::sys::signal::{ sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal };
use std::ops::Range;
use std::sync::atomic::{ AtomicBool, AtomicU64, AtomicUsize, Ordering };

static WINDOW_START: AtomicUsize = AtomicUsize::new(0);
static WINDOW_END: AtomicUsize = AtomicUsize::new(0);
static RESUME_PC: AtomicUsize = AtomicUsize::new(0);
static RECOVERED: AtomicU64 = AtomicU64::new(0);
static REGISTERED: AtomicBool = AtomicBool::new(false);

/// Returns the resume address for a fault at `pc`, if `pc` lies in the
/// armed window.
pub fn resume_target(pc: usize) -> Option<usize> {
    let start = WINDOW_START.load(Ordering::Acquire);
    let end = WINDOW_END.load(Ordering::Acquire);
    if start < end && (start..end).contains(&pc) {
        Some(RESUME_PC.load(Ordering::Acquire))
    } else {
        None
    }
}

/// Number of faults recovered since startup.
pub fn recovered_faults() -> u64 {
    RECOVERED.load(Ordering::Relaxed)
}

#[cfg(all(target_os = "linux", target_arch = "aarch64"))]
unsafe fn context_pc(ctx: *mut libc::c_void) -> Option<*mut u64> {
    let uc = ctx as *mut libc::ucontext_t;
    Some(std::ptr::addr_of_mut!((*uc).uc_mcontext.pc))
}

#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
unsafe fn context_pc(ctx: *mut libc::c_void) -> Option<*mut u64> {
    let uc = ctx as *mut libc::ucontext_t;
    let rip = std::ptr::addr_of_mut!((*uc).uc_mcontext.gregs[libc::REG_RIP as usize]);
    Some(rip as *mut u64)
}

#[cfg(not(all(target_os = "linux",
    any(target_arch = "aarch64", target_arch = "x86_64"))))]
unsafe fn context_pc(_ctx: *mut libc::c_void) -> Option<*mut u64> {
    None
}

extern "C" fn handle_fault(_sig: libc::c_int, _info: *mut libc::siginfo_t,
    ctx: *mut libc::c_void)
{
    unsafe {
        let target = context_pc(ctx)
            .and_then(|pc| resume_target(*pc as usize).map(|r| (pc, r)));
        match target {
            Some((pc, resume)) => {
                *pc = resume as u64;
                RECOVERED.fetch_add(1, Ordering::Relaxed);
            },
            None => {
                libc::signal(libc::SIGSEGV, libc::SIG_DFL);
            },
        }
    }
}

/// Ownership of the process-wide `SIGSEGV` handler.
///
/// Only one window can exist at a time. Dropping it disarms the window and
/// restores the previous handler.
pub struct TransientWindow {
    prev: SigAction,
}

impl TransientWindow {
    /// Install the fault handler. The window starts out disarmed.
    pub fn register() -> TargetResult<Self> {
        if REGISTERED.swap(true, Ordering::AcqRel) {
            return Err(TargetError::FaultHandler(nix::Error::EBUSY));
        }
        let action = SigAction::new(
            SigHandler::SigAction(handle_fault),
            SaFlags::SA_SIGINFO,
            SigSet::empty(),
        );
        match unsafe { sigaction(Signal::SIGSEGV, &action) } {
            Ok(prev) => Ok(Self { prev }),
            Err(e) => {
                REGISTERED.store(false, Ordering::Release);
                Err(TargetError::FaultHandler(e))
            },
        }
    }

    /// Recover faults raised from `range` by resuming at `resume`.
    pub fn arm(&self, range: Range<usize>, resume: usize) {
        assert!(range.contains(&resume));
        RESUME_PC.store(resume, Ordering::Release);
        WINDOW_END.store(range.end, Ordering::Release);
        WINDOW_START.store(range.start, Ordering::Release);
    }

    pub fn disarm(&self) {
        WINDOW_START.store(0, Ordering::Release);
        WINDOW_END.store(0, Ordering::Release);
        RESUME_PC.store(0, Ordering::Release);
    }
}

impl Drop for TransientWindow {
    fn drop(&mut self) {
        self.disarm();
        unsafe {
            let _ = sigaction(Signal::SIGSEGV, &self.prev);
        }
        REGISTERED.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod test {
    use super::*;

    // All window state is global, so everything lives in one test.
    #[test]
    fn window_lifecycle() {
        let window = TransientWindow::register().unwrap();
        assert!(matches!(TransientWindow::register(),
            Err(TargetError::FaultHandler(nix::Error::EBUSY))));

        assert_eq!(resume_target(0x1000), None);
        window.arm(0x1000..0x1240, 0x1238);
        assert_eq!(resume_target(0x1000), Some(0x1238));
        assert_eq!(resume_target(0x1014), Some(0x1238));
        assert_eq!(resume_target(0x1240), None);
        assert_eq!(resume_target(0x0ffc), None);

        window.disarm();
        assert_eq!(resume_target(0x1014), None);
        drop(window);

        let again = TransientWindow::register().unwrap();
        drop(again);
        assert_eq!(recovered_faults(), 0);
    }
}
