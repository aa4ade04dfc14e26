use clap::Parser;
use emleak::*;
use emleak_rpi4::*;
use tracing::warn;

/// Leak one bit of an EL1 system register through a transient read.
///
/// Context
/// =======
///
/// `MRS` from EL0 is not allowed to read EL1 registers, but the Cortex-A72
/// forwards the value to dependent instructions before the exception is
/// taken. The same is true for a load which faults: everything after it in
/// program order runs transiently until the fault retires.
///
/// Test
/// ====
///
/// Each request is `{ bit: i32, selector: u32 }`, where the selector is an
/// `MRS` encoding naming the register.
///
/// 1. Load a fresh copy of the gadget, patch the selector into its
///    placeholder slot and synchronize the instruction cache.
///
/// 2. Flush the first five links of the dereference chain and both probe
///    lines of the miss buffer.
///
/// 3. Raise the trigger and call the gadget. The gadget walks the flushed
///    chain, faults on a null load which depends on the chain, and
///    transiently reads the register, touching the miss buffer line selected
///    by `bit` and running a divide sequence whose operand depends on it.
///
/// 4. The fault handler resumes at the end of the gadget. Drop the trigger
///    and echo the request.
///
/// Requests with a selector which is not an `MRS` encoding are echoed
/// without running the gadget (and without a trigger pulse).
///
#[derive(Parser)]
#[command(verbatim_doc_comment)]
struct Args {
    #[command(flatten)]
    target: TargetArgs,
}

fn software(cfg: &TargetConfig) -> TargetResult<std::convert::Infallible> {
    launch(cfg, || Ok(RegisterLeak::new(SoftwareGadget::new()?)))
}

#[cfg(target_arch = "aarch64")]
fn speculative(cfg: &TargetConfig) -> TargetResult<std::convert::Infallible> {
    launch(cfg, || Ok(RegisterLeak::new(SpeculativeGadget::new()?)))
}

#[cfg(not(target_arch = "aarch64"))]
fn speculative(cfg: &TargetConfig) -> TargetResult<std::convert::Infallible> {
    warn!("the transient gadget only runs on aarch64, using the software gadget");
    software(cfg)
}

fn main() {
    init_logging();
    let args = Args::parse();
    let cfg = TargetConfig::from_cmdline_args(&args.target);

    let res = if cfg.dry_run {
        warn!("dry run: using the software gadget");
        software(&cfg)
    } else {
        speculative(&cfg)
    };
    exit_on_error(res);
}
