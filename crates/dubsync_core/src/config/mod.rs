//! Configuration management.
//!
//! - TOML file with `[analysis]`, `[scheduler]` and `[logging]` sections
//! - Atomic writes (temp file, then rename)
//! - Section-level updates that leave other sections untouched
//! - Validation on load, defaults for anything missing
//!
//! # Example
//!
//! ```no_run
//! use dubsync_core::config::{ConfigManager, ConfigSection};
//!
//! let mut config = ConfigManager::new("dubsync.toml");
//! config.load_or_create().unwrap();
//!
//! config.settings_mut().scheduler.workers = 4;
//! config.update_section(ConfigSection::Scheduler).unwrap();
//! ```

mod manager;
mod settings;

pub use manager::{validate, ConfigError, ConfigManager, ConfigResult};
pub use settings::{AnalysisSettings, ConfigSection, LoggingSettings, SchedulerSettings, Settings};
