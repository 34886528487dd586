//! Tracing setup for hosts that do not install their own subscriber.
//!
//! The processor only emits `tracing` events and `metrics` samples. Hosts
//! that already configure a subscriber and a metrics recorder can ignore
//! this module.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Installs a global `fmt` subscriber.
///
/// The filter is `directive` when given, otherwise `RUST_LOG`, otherwise
/// `info`. Returns `false` if a global subscriber was already set, in which
/// case nothing changes.
pub fn init_tracing(directive: Option<&str>) -> bool {
    let filter = match directive {
        Some(directive) => EnvFilter::new(directive),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init()
        .is_ok()
}
