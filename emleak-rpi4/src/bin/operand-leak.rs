use clap::Parser;
use emleak::*;
use emleak_rpi4::*;

/// Leak one secret bit through the latency of `UDIV`.
///
/// Context
/// =======
///
/// On the Cortex-A72, `UDIV` retires early for some operand values. Dividing
/// all-ones by zero and by all-ones takes a different number of cycles, so
/// the bit can be carried by a data dependency alone with no branch on it.
///
/// Test
/// ====
///
/// Each request is `{ bit: i32 }`.
///
/// 1. Raise the trigger.
///
/// 2. Flush the bound and check `bit < bound`. If the check passes, load bit
///    `bit` of the store (0 or 1) into `x11`, subtract one and run
///    `udiv x10, x15, x11` 64 times with `x15 = !0`.
///
/// 3. Drop the trigger and echo the request.
///
#[derive(Parser)]
#[command(verbatim_doc_comment)]
struct Args {
    #[command(flatten)]
    target: TargetArgs,
}

fn main() {
    init_logging();
    let args = Args::parse();
    let cfg = TargetConfig::from_cmdline_args(&args.target);
    exit_on_error(launch(&cfg, || Ok(OperandLeak::new(EmTransmitter))));
}
