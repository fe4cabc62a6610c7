//! Process-level tuning for the clock, oplog pagination, and (indirectly)
//! the sync driver. Not synchronized and not part of the oplog; loaded once
//! at startup and overridable by the embedding host, e.g. to shrink the
//! drift budget or page size in tests.

use crate::hlc::{ClockService, DEFAULT_MAX_DRIFT_MS, MAX_COUNTER};
use crate::oplog::DEFAULT_PAGE_SIZE;

/// Crate-wide tunables. Construct with [`Config::default`] and override
/// individual fields with the builder methods before wiring up the clock
/// and oplog store.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Config {
    /// Maximum allowed skew, in milliseconds, between an HLC's physical
    /// time and the local system clock before [`crate::error::Error::ClockDrift`].
    pub max_drift_ms: i64,
    /// Counter ceiling within a single millisecond.
    pub max_counter: u16,
    /// Page size for [`crate::oplog::OplogStore::get_entries_after`].
    pub oplog_page_size: usize,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            max_drift_ms: DEFAULT_MAX_DRIFT_MS,
            max_counter: MAX_COUNTER,
            oplog_page_size: DEFAULT_PAGE_SIZE,
        }
    }
}

impl Config {
    pub fn with_max_drift_ms(mut self, max_drift_ms: i64) -> Self {
        self.max_drift_ms = max_drift_ms;
        self
    }

    pub fn with_max_counter(mut self, max_counter: u16) -> Self {
        self.max_counter = max_counter;
        self
    }

    pub fn with_oplog_page_size(mut self, oplog_page_size: usize) -> Self {
        self.oplog_page_size = oplog_page_size;
        self
    }

    /// Builds a [`ClockService`] honoring this config's drift/counter
    /// budget, driven by the real system clock.
    pub fn build_clock(&self) -> ClockService {
        ClockService::new()
            .with_max_drift_ms(self.max_drift_ms)
            .with_max_counter(self.max_counter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec_constants() {
        let config = Config::default();
        assert_eq!(config.max_drift_ms, 60_000);
        assert_eq!(config.max_counter, 65535);
        assert_eq!(config.oplog_page_size, 100);
    }

    #[test]
    fn builder_overrides_apply() {
        let config = Config::default()
            .with_max_drift_ms(0)
            .with_oplog_page_size(3);
        assert_eq!(config.max_drift_ms, 0);
        assert_eq!(config.oplog_page_size, 3);
    }
}
