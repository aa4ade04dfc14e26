use clap::Parser;
use emleak::*;
use emleak::timing::FlushCalibration;
use std::io::ErrorKind;

fn describe_err(e: &std::io::Error) -> String {
    match e.kind() {
        ErrorKind::NotFound => "<not present>".to_string(),
        ErrorKind::PermissionDenied => "<permission denied; are you root?>".to_string(),
        _ => format!("<{}>", e),
    }
}

fn describe(res: std::io::Result<String>) -> String {
    res.unwrap_or_else(|e| describe_err(&e))
}

/// Summarize the target environment and check that flushed and cached
/// accesses can be told apart.
#[derive(Parser)]
struct Args {
    /// Core to pin to for the calibration.
    #[arg(default_value_t = 0)]
    core: usize,

    /// Samples per calibration series.
    #[arg(long, default_value_t = 4096)]
    samples: usize,
}

fn main() {
    let args = Args::parse();
    let core = args.core;

    let num_cores = match TargetEnv::online_cores() {
        Some(n) => n.to_string(),
        None => "<unknown>".to_string(),
    };
    let gpiomem = match TargetEnv::gpiomem_accessible() {
        Ok(()) => "accessible".to_string(),
        Err(e) => format!("{} [!!]", describe_err(&e)),
    };

    println!("[*] 'emleak' environment summary:");
    println!("  {:<40}: {}", "online cores", num_cores);
    println!("  {:<40}: {}", "isolated cores", describe(TargetEnv::sysfs_isolated()));
    println!("  {:<40}: {}", "nohz_full cores", describe(TargetEnv::sysfs_nohz()));
    println!("  {:<40}: {}", format!("cpufreq scaling (core {})", core),
        describe(TargetEnv::sysfs_cpufreq_governor(core)));
    println!("  {:<40}: {}", "/dev/gpiomem", gpiomem);

    if let Err(e) = TargetEnv::pin_to_core(core) {
        println!("[!] {}", e);
        return;
    }

    // Flush vs. cached access latency for one line of the secret store.
    let store = SecretStore::default();
    let cal = FlushCalibration::run(store.bound_ptr(), args.samples);
    println!("[*] flush calibration (core {}, {} samples each):", core, cal.cached.len());
    println!("  {:<40}: min={:?} med={:?} max={:?}", "cached",
        cal.cached.min(), cal.cached.median(), cal.cached.max());
    println!("  {:<40}: min={:?} med={:?} max={:?}", "flushed",
        cal.flushed.min(), cal.flushed.median(), cal.flushed.max());
    println!("  {:<40}: {}", "distinguishable",
        if cal.distinguishable() { "yes" } else { "no [!!]" });
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn core_argument_is_parsed() {
        assert_eq!(Args::try_parse_from(["emleak-env"]).unwrap().core, 0);
        assert_eq!(Args::try_parse_from(["emleak-env", "3"]).unwrap().core, 3);
        assert!(Args::try_parse_from(["emleak-env", "three"]).is_err());
        assert!(Args::try_parse_from(["emleak-env", "-1"]).is_err());
    }
}
