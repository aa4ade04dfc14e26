//! Raspberry Pi 4 (BCM2711, Cortex-A72) targets.
//!
//! Every binary in this crate runs exactly one leak variant through
//! [`launch`], which performs the startup sequence in a fixed order:
//!
//! 1. Pin to a core (if requested)
//! 2. Build the variant (fault handler and executable memory, if any)
//! 3. Allocate the secret store and cache buffers
//! 4. Map the GPIO block and configure the trigger pin
//! 5. Bind the UDP socket
//!
//! Any failure is fatal and nothing after the failing step runs.

pub mod gpio;

use emleak::*;
use std::convert::Infallible;
use std::time::Duration;
use tracing::{ error, info, warn };

pub use crate::gpio::*;

/// The trigger used by a target: the real GPIO pin, or an in-memory
/// recorder when running with `--dry-run`.
pub enum Rpi4Trigger {
    Gpio(GpioTrigger),
    DryRun(PulseRecorder),
}

impl Rpi4Trigger {
    pub fn from_config(cfg: &TargetConfig) -> TargetResult<Self> {
        if cfg.dry_run {
            warn!("dry run: trigger edges are only recorded in memory");
            return Ok(Self::DryRun(PulseRecorder::new()));
        }
        let gpio = Bcm2711Gpio::open()?;
        Ok(Self::Gpio(GpioTrigger::new(gpio, cfg.trigger_pin)?))
    }
}

impl Trigger for Rpi4Trigger {
    #[inline(always)]
    fn assert(&mut self) {
        match self {
            Self::Gpio(t) => t.assert(),
            Self::DryRun(t) => t.assert(),
        }
    }

    #[inline(always)]
    fn deassert(&mut self) {
        match self {
            Self::Gpio(t) => t.deassert(),
            Self::DryRun(t) => t.deassert(),
        }
    }

    fn last_pulse(&self) -> Option<Duration> {
        match self {
            Self::Gpio(_) => None,
            Self::DryRun(t) => t.last_pulse(),
        }
    }
}

/// Run the startup sequence and serve requests with the variant built by
/// `make_variant`. Only returns on a fatal error.
pub fn launch<V, F>(cfg: &TargetConfig, make_variant: F)
    -> TargetResult<Infallible>
where
    V: LeakVariant,
    F: FnOnce() -> TargetResult<V>,
{
    if let Some(core) = cfg.pinned_core {
        TargetEnv::pin_to_core(core)?;
        info!(core, "pinned to core");
    }

    let variant = make_variant()?;
    let ctx = LeakContext::new(cfg)?;
    let trigger = Rpi4Trigger::from_config(cfg)?;
    let transport = UdpTransport::bind(cfg.port)?;
    info!(variant = V::NAME, port = cfg.port, pin = cfg.trigger_pin,
        "target ready");

    let mut dispatcher = Dispatcher::new(ctx, variant, trigger, transport);
    dispatcher.run()
}

/// Report a fatal startup or integrity error and exit.
pub fn exit_on_error(res: TargetResult<Infallible>) -> ! {
    match res {
        Ok(never) => match never {},
        Err(e) => {
            error!("{}", e);
            std::process::exit(1);
        },
    }
}
