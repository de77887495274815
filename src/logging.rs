//! Tracing setup for binaries and tests embedding the engine.
//!
//! The engine itself only emits `tracing` events; nothing is printed unless a
//! subscriber is installed, e.g. with [`init`].

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Install a compact stderr subscriber filtered by `RUST_LOG` (default `warn`).
///
/// Calling it again, or after another subscriber was installed, does nothing.
///
/// ```bash
/// RUST_LOG=cycler=debug cargo test
/// ```
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    let installed = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .try_init();
    if installed.is_ok() {
        tracing::debug!("Tracing initialised.");
    }
}

#[cfg(test)]
mod tests {
    #[test]
    fn init_twice_is_harmless() {
        super::init();
        super::init();
        tracing::info!("still logging");
    }
}
