//! Tracing subscriber setup for the binaries.
//!
//! The library only emits `tracing` events; installing a subscriber is left
//! to the application.  `RUST_LOG` overrides the default `info` filter, e.g.
//! `RUST_LOG=spidet=debug` prints one line per NMF run.
use std::io::IsTerminal;
use std::sync::OnceLock;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Registry};

static INITIALISED: OnceLock<()> = OnceLock::new();

/// Install the global fmt subscriber (stderr, `info` unless `RUST_LOG` is
/// set).  Later calls are no-ops.
pub fn init_tracing() {
    init_tracing_with("info");
}

/// Like [`init_tracing`] with a different fallback filter directive.
pub fn init_tracing_with(default_directive: &str) {
    INITIALISED.get_or_init(|| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(default_directive));
        let fmt_layer = tracing_subscriber::fmt::layer()
            .with_target(false)
            .with_ansi(std::io::stderr().is_terminal())
            .with_writer(std::io::stderr);
        // Another subscriber may already be installed by an embedding
        // application; that one wins.
        let _ = Registry::default().with(filter).with(fmt_layer).try_init();
    });
}

#[cfg(test)]
mod tests {
    #[test]
    fn repeated_init_is_harmless() {
        super::init_tracing();
        super::init_tracing_with("debug");
        tracing::info!("logging initialised");
    }
}
