//! Target configuration.
//!
//! Running a target binary without arguments yields [`TargetConfig::default`],
//! which is the fixed configuration used for all measurements (UDP port 10000,
//! trigger on BCM GPIO 16).

use crate::cache::ThrashBuffer;

/// Configuration passed to the target startup sequence.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TargetConfig {
    /// UDP port bound on all interfaces.
    pub port: u16,

    /// BCM GPIO number of the trigger line.
    pub trigger_pin: u32,

    /// Optionally pin the target to a specific core before allocating
    /// anything.
    pub pinned_core: Option<usize>,

    /// Size of the thrash buffer in bytes.
    pub thrash_len: usize,

    /// Number of passes over the thrash buffer per thrash request.
    pub thrash_passes: usize,

    /// Replace the GPIO trigger (and the speculative gadget) with in-memory
    /// stand-ins.
    pub dry_run: bool,
}

impl TargetConfig {
    pub const DEFAULT_PORT: u16 = 10000;
    pub const DEFAULT_TRIGGER_PIN: u32 = 16;

    pub fn from_cmdline_args(args: &TargetArgs) -> Self {
        Self::default()
            .port(args.port)
            .trigger_pin(args.pin)
            .pinned_core(args.core)
            .thrash_len(args.thrash_len)
            .thrash_passes(args.thrash_passes)
            .dry_run(args.dry_run)
    }
}

impl Default for TargetConfig {
    fn default() -> Self {
        Self {
            port: Self::DEFAULT_PORT,
            trigger_pin: Self::DEFAULT_TRIGGER_PIN,
            pinned_core: None,
            thrash_len: ThrashBuffer::DEFAULT_LEN,
            thrash_passes: ThrashBuffer::DEFAULT_PASSES,
            dry_run: false,
        }
    }
}

impl TargetConfig {
    pub fn port(mut self, x: u16) -> Self {
        self.port = x;
        self
    }

    pub fn trigger_pin(mut self, x: u32) -> Self {
        self.trigger_pin = x;
        self
    }

    pub fn pinned_core(mut self, x: Option<usize>) -> Self {
        self.pinned_core = x;
        self
    }

    pub fn thrash_len(mut self, x: usize) -> Self {
        self.thrash_len = x;
        self
    }

    pub fn thrash_passes(mut self, x: usize) -> Self {
        self.thrash_passes = x;
        self
    }

    pub fn dry_run(mut self, x: bool) -> Self {
        self.dry_run = x;
        self
    }
}

/// Command-line arguments shared by all target binaries.
#[derive(clap::Args, Clone, Debug)]
pub struct TargetArgs {
    /// UDP port to listen on.
    #[arg(long, default_value_t = TargetConfig::DEFAULT_PORT)]
    pub port: u16,

    /// BCM GPIO number of the trigger line.
    #[arg(long, default_value_t = TargetConfig::DEFAULT_TRIGGER_PIN)]
    pub pin: u32,

    /// Pin the process to this core.
    #[arg(long)]
    pub core: Option<usize>,

    /// Thrash buffer size in bytes.
    #[arg(long, default_value_t = ThrashBuffer::DEFAULT_LEN)]
    pub thrash_len: usize,

    /// Passes over the thrash buffer per thrash request.
    #[arg(long, default_value_t = ThrashBuffer::DEFAULT_PASSES)]
    pub thrash_passes: usize,

    /// Record trigger edges in memory instead of driving the GPIO pin.
    #[arg(long)]
    pub dry_run: bool,
}
