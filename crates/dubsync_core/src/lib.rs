//! dubsync core - offset detection and consensus for master/dub audio.
//!
//! The crate takes decoded mono PCM and reports how far a dub track is
//! shifted against its master, whether that shift drifts, and how much the
//! result can be trusted. Decoding and presentation live in the callers.

pub mod analysis;
pub mod config;
pub mod logging;
pub mod scheduler;

/// Returns the crate version.
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_returns_value() {
        assert!(!version().is_empty());
    }
}
