use clap::Parser;
use emleak::*;
use emleak_rpi4::*;

/// Leak one secret bit through a branch, relying on the cache state left by
/// earlier requests instead of flushing.
///
/// Context
/// =======
///
/// Same branch structure as `cf-leak`, except the bound is never flushed.
/// Instead, the operator controls the cache state with a separate request
/// which thrashes the whole cache and then brings only the secret back in.
///
/// Test
/// ====
///
/// Each request is `{ bit: i32, option: i32 }`. The trigger is high while
/// the target waits for a request.
///
/// - `option = 0` (leak): check `bit < bound` and branch on bit `bit` of the
///   store. Drop the trigger, echo the request and raise the trigger again.
///
/// - `option = 1` (thrash): read a 4MiB buffer five times, touch every byte
///   of the secret and echo the request. The trigger stays high throughout.
///
/// - Anything else is echoed and otherwise ignored.
///
/// Every leak request ends one pulse. The pulse ended by the first leak after
/// a thrash also spans the thrash, so it is visibly wider on the scope.
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
    exit_on_error(launch(&cfg, || Ok(NoFlushLeak::new(EmTransmitter))));
}
