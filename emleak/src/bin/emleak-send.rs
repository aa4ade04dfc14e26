use clap::{ Parser, Subcommand };
use emleak::*;
use emleak::client::TargetClient;
use std::time::Duration;
use tracing::{ error, info };

/// Send leak requests to a target and wait for each echo.
///
/// Examples
/// ========
///
/// Leak bit 45 through the control-flow or operand-timing targets:
///
///   emleak-send --target 10.0.0.2:10000 bit 45
///
/// Leak bit 12 of TTBR1_EL1 through the register target:
///
///   emleak-send --target 10.0.0.2:10000 register 12 ttbr1_el1
///
/// Thrash, then leak bit 45 through the no-flush target:
///
///   emleak-send --target 10.0.0.2:10000 mode 45 thrash
///   emleak-send --target 10.0.0.2:10000 mode 45 leak
///
#[derive(Parser)]
#[command(verbatim_doc_comment)]
struct Args {
    /// Address of the target.
    #[arg(long, default_value = "127.0.0.1:10000")]
    target: String,

    /// Reply timeout in milliseconds.
    #[arg(long, default_value_t = 1000)]
    timeout_ms: u64,

    /// Number of times to send the request.
    #[arg(long, default_value_t = 1)]
    count: usize,

    #[command(subcommand)]
    cmd: Cmd,
}

#[derive(Subcommand)]
enum Cmd {
    /// `{ bit }`
    Bit {
        #[arg(allow_negative_numbers = true)]
        bit: i32,
    },
    /// `{ bit, selector }`, where the selector is either a register name or
    /// a raw MRS encoding in hex.
    Register {
        #[arg(allow_negative_numbers = true)]
        bit: i32,
        selector: String,
    },
    /// `{ bit, option }`, where the option is `leak`, `thrash` or a raw
    /// integer.
    Mode {
        #[arg(allow_negative_numbers = true)]
        bit: i32,
        option: String,
    },
}

fn parse_selector(s: &str) -> Option<u32> {
    if let Some(sel) = RegisterSelector::lookup(s) {
        return Some(sel.encoding());
    }
    let digits = s.trim_start_matches("0x");
    u32::from_str_radix(digits, 16).ok()
}

fn parse_option(s: &str) -> Option<i32> {
    match s {
        "leak" => Some(LeakMode::Leak.raw()),
        "thrash" => Some(LeakMode::Thrash.raw()),
        _ => s.parse().ok(),
    }
}

fn encode(cmd: &Cmd) -> Result<Vec<u8>, String> {
    match cmd {
        Cmd::Bit { bit } => Ok(BitRequest { bit: BitIndex(*bit) }.encode()),
        Cmd::Register { bit, selector } => {
            let selector = parse_selector(selector)
                .ok_or_else(|| format!("unknown register selector '{}'", selector))?;
            if RegisterSelector::from_raw(selector).is_none() {
                info!("{:08x} is not an MRS encoding; the target will ignore it", selector);
            }
            Ok(RegisterRequest { bit: BitIndex(*bit), selector }.encode())
        },
        Cmd::Mode { bit, option } => {
            let option = parse_option(option)
                .ok_or_else(|| format!("unknown option '{}'", option))?;
            Ok(ModeRequest { bit: BitIndex(*bit), option }.encode())
        },
    }
}

fn main() {
    init_logging();
    let args = Args::parse();

    let buf = match encode(&args.cmd) {
        Ok(buf) => buf,
        Err(e) => {
            error!("{}", e);
            std::process::exit(1);
        },
    };
    let client = match TargetClient::connect(args.target.as_str(),
        Duration::from_millis(args.timeout_ms))
    {
        Ok(c) => c,
        Err(e) => {
            error!("couldn't reach {}: {}", args.target, e);
            std::process::exit(1);
        },
    };

    for i in 0..args.count {
        match client.send_raw(&buf) {
            Ok(reply) if reply == buf => {
                info!(request = i, "{:02x?} acknowledged", buf);
            },
            Ok(reply) => {
                error!(request = i, "unexpected reply {:02x?}", reply);
                std::process::exit(1);
            },
            Err(e) => {
                error!(request = i, "no reply from {}: {}", client.target(), e);
                std::process::exit(1);
            },
        }
    }
}
