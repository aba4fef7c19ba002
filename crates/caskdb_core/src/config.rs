//! Engine configuration.

use crate::error::{CoreError, CoreResult};
use std::time::Duration;

/// Configuration for opening an engine.
#[derive(Debug, Clone)]
pub struct Config {
    /// Whether to create the directory if it doesn't exist.
    pub create_if_missing: bool,

    /// Size in bytes after which the active segment is sealed and a new one
    /// is started. Also bounds merge output files.
    pub max_file_size: u64,

    /// Upper bound on open-time recovery (`Duration::ZERO` = unbounded).
    pub recovery_timeout: Duration,

    /// Whether to fsync the active data and hint files after every write.
    pub sync_on_write: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            create_if_missing: true,
            max_file_size: 256 * 1024 * 1024, // 256 MB
            recovery_timeout: Duration::ZERO, // unbounded
            sync_on_write: false,
        }
    }
}

impl Config {
    /// Creates a new configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets whether to create the directory if missing.
    #[must_use]
    pub const fn create_if_missing(mut self, value: bool) -> Self {
        self.create_if_missing = value;
        self
    }

    /// Sets the segment rotation threshold.
    #[must_use]
    pub const fn max_file_size(mut self, size: u64) -> Self {
        self.max_file_size = size;
        self
    }

    /// Sets the recovery time budget.
    #[must_use]
    pub const fn recovery_timeout(mut self, timeout: Duration) -> Self {
        self.recovery_timeout = timeout;
        self
    }

    /// Sets whether to fsync after every write.
    #[must_use]
    pub const fn sync_on_write(mut self, value: bool) -> Self {
        self.sync_on_write = value;
        self
    }

    /// Checks the configuration for values the on-disk format cannot honour.
    ///
    /// Hint records store 32-bit positions, so no segment may grow past
    /// `u32::MAX` bytes before rotating.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvalidConfig`] on a zero or oversized
    /// `max_file_size`.
    pub fn validate(&self) -> CoreResult<()> {
        if self.max_file_size == 0 {
            return Err(CoreError::invalid_config("max_file_size must be non-zero"));
        }
        if self.max_file_size > u64::from(u32::MAX) {
            return Err(CoreError::invalid_config(format!(
                "max_file_size {} exceeds the 32-bit position limit",
                self.max_file_size
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let config = Config::default();
        assert!(config.create_if_missing);
        assert!(!config.sync_on_write);
        assert_eq!(config.recovery_timeout, Duration::ZERO);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn builder_pattern() {
        let config = Config::new()
            .create_if_missing(false)
            .sync_on_write(true)
            .max_file_size(1024)
            .recovery_timeout(Duration::from_secs(5));

        assert!(!config.create_if_missing);
        assert!(config.sync_on_write);
        assert_eq!(config.max_file_size, 1024);
        assert_eq!(config.recovery_timeout, Duration::from_secs(5));
    }

    #[test]
    fn validate_rejects_bad_sizes() {
        assert!(Config::new().max_file_size(0).validate().is_err());
        assert!(Config::new()
            .max_file_size(u64::from(u32::MAX) + 1)
            .validate()
            .is_err());
        assert!(Config::new()
            .max_file_size(u64::from(u32::MAX))
            .validate()
            .is_ok());
    }
}
