//! The leak variants.
//!
//! Each variant turns one request into one leak attempt framed by the
//! trigger. A target binary runs exactly one of them. Nothing here measures
//! anything: the observable effect is whatever the [`Transmitter`] (or the
//! gadget) does while the trigger is high.

use crate::cache::*;
use crate::config::TargetConfig;
use crate::error::*;
use crate::gadget::*;
use crate::request::*;
use crate::secret::SecretStore;
use crate::trigger::Trigger;
use std::fmt;

/// The instruction sequences that carry a bit out of the core.
///
/// These are pinned to the target microarchitecture. Tests substitute a
/// [`CountingTransmitter`] to check which path was taken.
pub trait Transmitter {
    /// Executed only on the "bit is 1" path of the control-flow variants.
    fn on_one(&mut self);

    /// Run the operand-dependent sequence with the bit value (0 or 1) as
    /// the operand.
    fn divide(&mut self, operand: u64);
}

/// The real [`Transmitter`].
#[derive(Clone, Copy, Debug, Default)]
pub struct EmTransmitter;

impl EmTransmitter {
    /// Number of back-to-back divides.
    pub const DIVIDE_REPS: usize = 64;
}

impl Transmitter for EmTransmitter {
    #[inline(always)]
    fn on_one(&mut self) {
        unsafe { core::arch::asm!("nop", options(nomem, nostack, preserves_flags)) };
    }

    /// `x15 = !0`, `x11 = operand - 1` (either `!0` or `0`), followed by
    /// `udiv x10, x15, x11` 64 times.
    #[cfg(target_arch = "aarch64")]
    #[inline(always)]
    fn divide(&mut self, operand: u64) {
        unsafe {
            core::arch::asm!(
                "mov x11, {v}",
                "sub x11, x11, #1",
                "mov x15, #-1",
                ".rept {cnt}",
                "udiv x10, x15, x11",
                ".endr",
                v = in(reg) operand,
                cnt = const Self::DIVIDE_REPS,
                out("x10") _, out("x11") _, out("x15") _,
                options(nomem, nostack, preserves_flags)
            );
        }
    }

    /// Same idea as on aarch64, except that x86 traps on a zero divisor so
    /// the divisor is `(operand - 1) | 1`.
    #[cfg(target_arch = "x86_64")]
    #[inline(always)]
    fn divide(&mut self, operand: u64) {
        let divisor = operand.wrapping_sub(1) | 1;
        unsafe {
            core::arch::asm!(
                ".rept {cnt}",
                "mov rax, {n}",
                "xor edx, edx",
                "div {d}",
                ".endr",
                n = in(reg) u64::MAX,
                d = in(reg) divisor,
                cnt = const Self::DIVIDE_REPS,
                out("rax") _, out("rdx") _,
                options(nomem, nostack)
            );
        }
    }

    #[cfg(not(any(target_arch = "aarch64", target_arch = "x86_64")))]
    fn divide(&mut self, operand: u64) {
        let divisor = operand.wrapping_sub(1) | 1;
        for _ in 0..Self::DIVIDE_REPS {
            std::hint::black_box(u64::MAX / std::hint::black_box(divisor));
        }
    }
}

/// A [`Transmitter`] which only counts.
#[derive(Clone, Debug, Default)]
pub struct CountingTransmitter {
    pub ones: usize,
    pub operands: Vec<u64>,
}

impl Transmitter for CountingTransmitter {
    fn on_one(&mut self) { self.ones += 1; }
    fn divide(&mut self, operand: u64) { self.operands.push(operand); }
}


/// Everything a leak attempt operates on, created once at startup.
pub struct LeakContext {
    pub store: Box<SecretStore>,
    pub chain: DereferenceChain,
    pub miss: MissBuffer,
    pub thrash: ThrashBuffer,
}

impl LeakContext {
    pub fn new(cfg: &TargetConfig) -> TargetResult<Self> {
        Self::with_store(SecretStore::default(), cfg)
    }

    pub fn with_store(store: SecretStore, cfg: &TargetConfig) -> TargetResult<Self> {
        Ok(Self {
            store: Box::new(store),
            chain: DereferenceChain::new()?,
            miss: MissBuffer::new()?,
            thrash: ThrashBuffer::new(cfg.thrash_len, cfg.thrash_passes)?,
        })
    }
}


/// What happened while serving a decoded request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LeakOutcome {
    /// A leak attempt ran.
    Leaked,
    /// The cache was thrashed and the secret re-primed.
    Thrashed,
    /// The register selector is not a system register read.
    Rejected,
    /// The option value is unknown.
    Ignored,
}

/// A leak strategy.
///
/// The dispatcher calls [`LeakVariant::on_start`] once, then for each request
/// [`LeakVariant::execute`] followed (after the reply has been sent) by
/// [`LeakVariant::after_reply`]. Variants own the trigger discipline.
pub trait LeakVariant {
    const NAME: &'static str;
    type Request: WireRequest + fmt::Debug;

    fn on_start(&mut self, _trigger: &mut impl Trigger) {}

    fn execute(&mut self, ctx: &LeakContext, trigger: &mut impl Trigger,
        req: &Self::Request) -> TargetResult<LeakOutcome>;

    /// `outcome` is `None` when the request could not be decoded.
    fn after_reply(&mut self, _trigger: &mut impl Trigger,
        _outcome: Option<LeakOutcome>) {}
}


/// Branch on bit `bit` of the store when it is within the bound.
///
/// The bound is re-read from memory, so flushing it first makes the check
/// resolve late and lets the branch on the data bit run ahead of it.
#[inline(never)]
fn access_bit<E: Transmitter>(store: &SecretStore, bit: BitIndex, tx: &mut E,
    flush: bool)
{
    if flush {
        flush_line(store.bound_ptr());
    }
    let idx = bit.unsigned();
    if idx < store.bound() {
        let byte = unsafe { std::ptr::read_volatile(store.data_ptr().add(idx / 8)) };
        if byte & (1 << (idx % 8)) != 0 {
            tx.on_one();
        }
    }
}

/// Run the divide sequence with bit `bit` of the store as the operand.
#[inline(never)]
fn access_operand<E: Transmitter>(store: &SecretStore, bit: BitIndex, tx: &mut E) {
    flush_line(store.bound_ptr());
    let idx = bit.unsigned();
    if idx < store.bound() {
        let byte = unsafe { std::ptr::read_volatile(store.data_ptr().add(idx / 8)) };
        tx.divide(((byte >> (idx % 8)) & 1) as u64);
    }
}


/// Leak a system register bit through the transient gadget.
pub struct RegisterLeak<G: TransientGadget> {
    gadget: G,
}

impl<G: TransientGadget> RegisterLeak<G> {
    pub fn new(gadget: G) -> Self { Self { gadget } }
    pub fn gadget(&self) -> &G { &self.gadget }
    pub fn gadget_mut(&mut self) -> &mut G { &mut self.gadget }
}

impl<G: TransientGadget> LeakVariant for RegisterLeak<G> {
    const NAME: &'static str = "sysreg";
    type Request = RegisterRequest;

    fn execute(&mut self, ctx: &LeakContext, trigger: &mut impl Trigger,
        req: &RegisterRequest) -> TargetResult<LeakOutcome>
    {
        let Some(selector) = RegisterSelector::from_raw(req.selector) else {
            return Ok(LeakOutcome::Rejected);
        };
        self.gadget.prepare(selector)?;
        ctx.chain.flush();
        ctx.miss.flush();

        nop_sled::<128>();
        trigger.assert();
        self.gadget.invoke(&GadgetArgs {
            chain: &ctx.chain,
            miss: &ctx.miss,
            bit: req.bit,
        });
        trigger.deassert();
        nop_sled::<1024>();

        Ok(LeakOutcome::Leaked)
    }
}


/// Branch on a secret bit after flushing the bound.
pub struct ControlFlowLeak<E: Transmitter> {
    tx: E,
}

impl<E: Transmitter> ControlFlowLeak<E> {
    pub fn new(tx: E) -> Self { Self { tx } }
    pub fn transmitter(&self) -> &E { &self.tx }
}

impl<E: Transmitter> LeakVariant for ControlFlowLeak<E> {
    const NAME: &'static str = "cf";
    type Request = BitRequest;

    fn execute(&mut self, ctx: &LeakContext, trigger: &mut impl Trigger,
        req: &BitRequest) -> TargetResult<LeakOutcome>
    {
        trigger.assert();
        access_bit(&ctx.store, req.bit, &mut self.tx, true);
        trigger.deassert();
        Ok(LeakOutcome::Leaked)
    }
}


/// Branch on a secret bit in whatever cache state the previous request left
/// behind, plus a mode which thrashes the cache and re-primes the secret.
///
/// The trigger is high while waiting for a request and is raised again after
/// every reply. A leak request drops it right after the access, so each leak
/// ends one pulse. A thrash request leaves it high through the thrash and the
/// rewarm, which stretches the pulse closed by the following leak.
pub struct NoFlushLeak<E: Transmitter> {
    tx: E,
}

impl<E: Transmitter> NoFlushLeak<E> {
    pub fn new(tx: E) -> Self { Self { tx } }
    pub fn transmitter(&self) -> &E { &self.tx }
}

impl<E: Transmitter> LeakVariant for NoFlushLeak<E> {
    const NAME: &'static str = "cf-noflush";
    type Request = ModeRequest;

    fn on_start(&mut self, trigger: &mut impl Trigger) {
        trigger.assert();
    }

    fn execute(&mut self, ctx: &LeakContext, trigger: &mut impl Trigger,
        req: &ModeRequest) -> TargetResult<LeakOutcome>
    {
        match req.mode() {
            Some(LeakMode::Leak) => {
                access_bit(&ctx.store, req.bit, &mut self.tx, false);
                trigger.deassert();
                Ok(LeakOutcome::Leaked)
            },
            Some(LeakMode::Thrash) => {
                ctx.thrash.thrash();
                rewarm_secret(&ctx.store);
                Ok(LeakOutcome::Thrashed)
            },
            None => Ok(LeakOutcome::Ignored),
        }
    }

    fn after_reply(&mut self, trigger: &mut impl Trigger,
        _outcome: Option<LeakOutcome>)
    {
        trigger.assert();
    }
}


/// Select the operand of the divide sequence with a secret bit.
pub struct OperandLeak<E: Transmitter> {
    tx: E,
}

impl<E: Transmitter> OperandLeak<E> {
    pub fn new(tx: E) -> Self { Self { tx } }
    pub fn transmitter(&self) -> &E { &self.tx }
}

impl<E: Transmitter> LeakVariant for OperandLeak<E> {
    const NAME: &'static str = "operand";
    type Request = BitRequest;

    fn execute(&mut self, ctx: &LeakContext, trigger: &mut impl Trigger,
        req: &BitRequest) -> TargetResult<LeakOutcome>
    {
        trigger.assert();
        access_operand(&ctx.store, req.bit, &mut self.tx);
        trigger.deassert();
        Ok(LeakOutcome::Leaked)
    }
}


#[cfg(test)]
mod test {
    use super::*;
    use crate::trigger::{ Level, PulseRecorder };

    fn context() -> LeakContext {
        let cfg = TargetConfig::default().thrash_len(64 * 1024).thrash_passes(1);
        LeakContext::new(&cfg).unwrap()
    }

    #[test]
    fn control_flow_takes_one_path_iff_bit_set() {
        let ctx = context();
        let mut trigger = PulseRecorder::new();
        let bound = ctx.store.accessible_bits();
        for i in 0..bound {
            let mut v = ControlFlowLeak::new(CountingTransmitter::default());
            let req = BitRequest { bit: BitIndex(i as i32) };
            let res = v.execute(&ctx, &mut trigger, &req).unwrap();
            assert_eq!(res, LeakOutcome::Leaked);
            let expected = ctx.store.bit(i).unwrap() as usize;
            assert_eq!(v.transmitter().ones, expected, "bit {}", i);
        }
        assert_eq!(trigger.pulses().len(), bound);
    }

    #[test]
    fn control_flow_out_of_bounds_is_architecturally_silent() {
        let ctx = context();
        let mut trigger = PulseRecorder::new();
        let mut v = ControlFlowLeak::new(CountingTransmitter::default());
        for bit in [40, 41, 300, 1023, -1, i32::MIN, i32::MAX] {
            v.execute(&ctx, &mut trigger, &BitRequest { bit: BitIndex(bit) }).unwrap();
        }
        assert_eq!(v.transmitter().ones, 0);
        assert_eq!(trigger.pulses().len(), 7);
    }

    #[test]
    fn operand_matches_bit() {
        let ctx = context();
        let mut trigger = PulseRecorder::new();
        let mut v = OperandLeak::new(CountingTransmitter::default());
        let bound = ctx.store.accessible_bits();
        for i in 0..bound {
            v.execute(&ctx, &mut trigger, &BitRequest { bit: BitIndex(i as i32) })
                .unwrap();
        }
        let expected: Vec<u64> = (0..bound)
            .map(|i| ctx.store.bit(i).unwrap() as u64)
            .collect();
        assert_eq!(v.transmitter().operands, expected);

        v.execute(&ctx, &mut trigger, &BitRequest { bit: BitIndex(bound as i32) })
            .unwrap();
        assert_eq!(v.transmitter().operands.len(), bound);
    }

    #[test]
    fn em_transmitter_runs() {
        let mut tx = EmTransmitter;
        tx.on_one();
        tx.divide(0);
        tx.divide(1);
    }

    #[test]
    fn real_transmitter_in_bounds() {
        let ctx = context();
        let mut trigger = PulseRecorder::new();
        let mut cf = ControlFlowLeak::new(EmTransmitter);
        let mut op = OperandLeak::new(EmTransmitter);
        for i in 0..48 {
            let req = BitRequest { bit: BitIndex(i) };
            cf.execute(&ctx, &mut trigger, &req).unwrap();
            op.execute(&ctx, &mut trigger, &req).unwrap();
        }
        assert_eq!(trigger.pulses().len(), 96);
    }

    #[test]
    fn noflush_trigger_discipline() {
        let ctx = context();
        let mut trigger = PulseRecorder::new();
        let mut v = NoFlushLeak::new(CountingTransmitter::default());
        v.on_start(&mut trigger);
        assert_eq!(trigger.level(), Level::High);

        // Leak: drop after the access, raise again after the reply.
        let leak = ModeRequest { bit: BitIndex(2), option: 0 };
        let out = v.execute(&ctx, &mut trigger, &leak).unwrap();
        assert_eq!(out, LeakOutcome::Leaked);
        assert_eq!(trigger.level(), Level::Low);
        v.after_reply(&mut trigger, Some(out));
        assert_eq!(trigger.level(), Level::High);
        assert_eq!(v.transmitter().ones, 1);

        // Thrash: the line stays high through thrash, rewarm and reply.
        let edges = trigger.edges().len();
        let thrash = ModeRequest { bit: BitIndex(2), option: 1 };
        let out = v.execute(&ctx, &mut trigger, &thrash).unwrap();
        assert_eq!(out, LeakOutcome::Thrashed);
        v.after_reply(&mut trigger, Some(out));
        assert_eq!(trigger.level(), Level::High);
        assert_eq!(trigger.edges().len(), edges);

        // The leak following a thrash still ends its pulse at the access.
        let out = v.execute(&ctx, &mut trigger, &leak).unwrap();
        assert_eq!(trigger.level(), Level::Low);
        assert_eq!(trigger.edges().len(), edges + 1);
        v.after_reply(&mut trigger, Some(out));
        assert_eq!(trigger.level(), Level::High);
        assert_eq!(v.transmitter().ones, 2);
    }

    #[test]
    fn noflush_thrash_widens_the_next_pulse() {
        let ctx = context();
        let mut trigger = PulseRecorder::new();
        let mut v = NoFlushLeak::new(CountingTransmitter::default());
        let leak = ModeRequest { bit: BitIndex(2), option: 0 };
        let thrash = ModeRequest { bit: BitIndex(2), option: 1 };
        v.on_start(&mut trigger);

        let out = v.execute(&ctx, &mut trigger, &leak).unwrap();
        v.after_reply(&mut trigger, Some(out));
        let plain = trigger.last_pulse().unwrap();

        let out = v.execute(&ctx, &mut trigger, &thrash).unwrap();
        v.after_reply(&mut trigger, Some(out));
        std::thread::sleep(std::time::Duration::from_millis(5));
        let out = v.execute(&ctx, &mut trigger, &leak).unwrap();
        v.after_reply(&mut trigger, Some(out));
        let framed = trigger.last_pulse().unwrap();

        assert_eq!(trigger.pulses().len(), 2);
        assert!(framed >= std::time::Duration::from_millis(5));
        assert!(framed > plain);
    }

    #[test]
    fn noflush_unknown_option_is_a_no_op() {
        let ctx = context();
        let mut trigger = PulseRecorder::new();
        let mut v = NoFlushLeak::new(CountingTransmitter::default());
        v.on_start(&mut trigger);
        let req = ModeRequest { bit: BitIndex(2), option: 7 };
        let out = v.execute(&ctx, &mut trigger, &req).unwrap();
        assert_eq!(out, LeakOutcome::Ignored);
        v.after_reply(&mut trigger, Some(out));
        assert_eq!(trigger.edges().len(), 1);
        assert_eq!(trigger.level(), Level::High);
        assert_eq!(v.transmitter().ones, 0);
    }

    #[test]
    fn thrash_keeps_secret_intact() {
        let ctx = context();
        let before = ctx.store.data().to_vec();
        let mut trigger = PulseRecorder::new();
        let mut v = NoFlushLeak::new(CountingTransmitter::default());
        for _ in 0..4 {
            let req = ModeRequest { bit: BitIndex(0), option: 1 };
            v.execute(&ctx, &mut trigger, &req).unwrap();
        }
        assert_eq!(ctx.store.data(), &before[..]);
    }

    #[test]
    fn register_leak_rejects_non_mrs() {
        let ctx = context();
        let mut trigger = PulseRecorder::new();
        let mut v = RegisterLeak::new(SoftwareGadget::new().unwrap());
        let req = RegisterRequest { bit: BitIndex(39), selector: 0xd503_201f };
        let out = v.execute(&ctx, &mut trigger, &req).unwrap();
        assert_eq!(out, LeakOutcome::Rejected);
        assert!(trigger.edges().is_empty());
        assert!(v.gadget().code().is_pristine());
    }

    #[test]
    fn register_leak_touches_line_of_bit() {
        let ctx = context();
        let mut trigger = PulseRecorder::new();
        let mut gadget = SoftwareGadget::new().unwrap();
        gadget.set_register(RegisterSelector::TTBR1_EL1, 1 << 39);
        let mut v = RegisterLeak::new(gadget);

        for (bit, line) in [(39, 1), (38, 0), (40, 0)] {
            let req = RegisterRequest {
                bit: BitIndex(bit),
                selector: RegisterSelector::TTBR1_EL1.encoding(),
            };
            let out = v.execute(&ctx, &mut trigger, &req).unwrap();
            assert_eq!(out, LeakOutcome::Leaked);
            assert_eq!(v.gadget().last().unwrap().line, line);
        }
        assert_eq!(trigger.pulses().len(), 3);
    }

    #[test]
    fn register_leak_preserves_template() {
        let ctx = context();
        let mut trigger = PulseRecorder::new();
        let mut v = RegisterLeak::new(SoftwareGadget::new().unwrap());
        let chain_before: Vec<usize> = (0..ctx.chain.links())
            .map(|i| ctx.chain.value(i))
            .collect();

        let selectors = [
            RegisterSelector::TCR_EL1.encoding(),
            0xffff_ffff,
            0xd503_201f,
            RegisterSelector::VBAR_EL1.encoding(),
            0,
        ];
        for i in 0..100 {
            let sel = selectors[i % selectors.len()];
            let req = RegisterRequest { bit: BitIndex(i as i32 % 64), selector: sel };
            v.execute(&ctx, &mut trigger, &req).unwrap();
            let template = v.gadget().code().template().words();
            let words = v.gadget().code().words();
            for (j, (w, t)) in words.iter().zip(template).enumerate() {
                if j != GadgetTemplate::PATCH_INDEX {
                    assert_eq!(w, t, "word {} after request {}", j, i);
                }
            }
        }
        let chain_after: Vec<usize> = (0..ctx.chain.links())
            .map(|i| ctx.chain.value(i))
            .collect();
        assert_eq!(chain_before, chain_after);
    }
}
