//! Logging infrastructure.
//!
//! - Global `tracing` subscriber honoring `RUST_LOG`
//! - Per-job log files with a tail buffer for failure diagnosis
//!
//! # Example
//!
//! ```no_run
//! use dubsync_core::logging::{JobLogger, LogConfig};
//!
//! let logger = JobLogger::new("pair_001", ".logs", LogConfig::default(), None).unwrap();
//! logger.phase("Analysis");
//! logger.info("master.wav vs dub.wav");
//! logger.success("offset +0.120s");
//! ```

mod job_logger;
mod types;

pub use job_logger::JobLogger;
pub use types::{LogCallback, LogConfig, LogLevel, MessagePrefix};

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Install the global tracing subscriber.
///
/// `RUST_LOG` wins over `default_level`. Output goes to stderr. Calling this
/// twice is a no-op.
pub fn init_tracing(default_level: LogLevel) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_level.as_filter_str()));

    let _ = tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_writer(std::io::stderr))
        .with(filter)
        .try_init();
}

/// Initialize tracing for tests (warnings and above).
#[cfg(test)]
pub fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("warn")
        .with_test_writer()
        .try_init();
}
