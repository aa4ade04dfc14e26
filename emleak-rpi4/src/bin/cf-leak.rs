use clap::Parser;
use emleak::*;
use emleak_rpi4::*;

/// Leak one secret bit through a branch which runs ahead of a flushed
/// bounds check.
///
/// Context
/// =======
///
/// The secret store holds a 5-byte accessible prefix (`"data|"`, 40 bits)
/// followed by a 32-byte secret. The bound is a variable in memory, so
/// evicting it makes the bounds check resolve late. Until then the core
/// predicts the check as taken (it always is for in-bounds requests) and
/// keeps going into the branch on the data bit.
///
/// Test
/// ====
///
/// Each request is `{ bit: i32 }`.
///
/// 1. Raise the trigger.
///
/// 2. Flush the bound, then check `bit < bound`. If the check passes (or is
///    predicted to), branch on bit `bit` of the store and run a `nop` only
///    when it is 1.
///
/// 3. Drop the trigger and echo the request.
///
/// Bits past 40 are never architecturally accessed. Any difference in the
/// emissions for those comes from the mispredicted path.
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
    exit_on_error(launch(&cfg, || Ok(ControlFlowLeak::new(EmTransmitter))));
}
