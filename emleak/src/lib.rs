//! Target-side oracle for electromagnetic leakage experiments.
//!
//! A target process receives a request over UDP, drives a trigger line high,
//! runs exactly one leak primitive which makes a chosen bit observable as an
//! EM emission pattern, drops the trigger and echoes the request back. An
//! external oscilloscope captures the emissions; nothing in this crate tries
//! to recover the bit.
//!
//! The crate is organized bottom-up:
//!
//! - [`secret`]: the secret store (accessible prefix + secret suffix)
//! - [`cache`]: flush/thrash primitives and the buffers they operate on
//! - [`gadget`]: the patchable register-read gadget and its code buffer
//! - [`fault`]: bounded transient execution (SIGSEGV recovery)
//! - [`variant`]: the four leak strategies
//! - [`dispatch`]: the request/reply loop
//!
//! Platform-specific pieces (i.e. the GPIO trigger) live in a separate crate.

pub mod cache;
pub mod client;
pub mod config;
pub mod dispatch;
pub mod env;
pub mod error;
pub mod fault;
pub mod gadget;
pub mod request;
pub mod secret;
pub mod timing;
pub mod transport;
pub mod trigger;
pub mod variant;

pub use crate::cache::*;
pub use crate::config::*;
pub use crate::dispatch::*;
pub use crate::env::TargetEnv;
pub use crate::error::*;
pub use crate::gadget::*;
pub use crate::request::*;
pub use crate::secret::*;
pub use crate::transport::*;
pub use crate::trigger::*;
pub use crate::variant::*;

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Install the global `tracing` subscriber.
///
/// Honors `RUST_LOG`, defaulting to `info`. Calling this more than once is
/// harmless; only the first call installs anything.
pub fn init_logging() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .try_init();
}
