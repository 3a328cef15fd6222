// SPDX-License-Identifier: Apache-2.0

//! Configuration for the tail engine.

use std::time::Duration;

use crate::error::{Error, Result};

/// Initial read position for a file that has no stored offset yet.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Whence {
    /// Read from byte 0.
    #[default]
    Oldest,
    /// Skip to the end of the file.
    Newest,
}

/// Configuration for [`TailReader`](crate::tail::TailReader).
#[derive(Debug, Clone)]
pub struct TailConfig {
    /// Glob pattern for files to follow (required).
    pub log_path_pattern: String,
    /// Glob pattern for files to skip. Empty disables exclusion.
    pub ignore_log_path_pattern: String,
    /// Where to start reading a newly discovered file.
    pub whence: Whence,
    /// Inactive followers whose file mtime is older than this are retired.
    /// Zero disables expiry.
    pub expire: Duration,
    /// TTL for on-disk per-file submeta directories. Must be zero (never
    /// clean) or at least `expire`.
    pub submeta_expire: Duration,
    /// Discovery polling period.
    pub stat_interval: Duration,
    /// Hard cap on concurrently open followers.
    pub max_open_files: usize,
}

impl Default for TailConfig {
    fn default() -> Self {
        Self {
            log_path_pattern: String::new(),
            ignore_log_path_pattern: String::new(),
            whence: Whence::Oldest,
            expire: Duration::from_secs(24 * 60 * 60),
            submeta_expire: Duration::from_secs(720 * 60 * 60),
            stat_interval: Duration::from_secs(3 * 60),
            max_open_files: 256,
        }
    }
}

impl TailConfig {
    /// Validate the configuration. Called at engine construction; an invalid
    /// configuration means the engine is not created.
    pub fn validate(&self) -> Result<()> {
        if self.log_path_pattern.is_empty() {
            return Err(Error::Config(
                "log_path_pattern must be specified".to_string(),
            ));
        }
        glob::Pattern::new(&self.log_path_pattern).map_err(|e| {
            Error::InvalidGlob(format!(
                "invalid log_path_pattern '{}': {}",
                self.log_path_pattern, e
            ))
        })?;
        if !self.ignore_log_path_pattern.is_empty() {
            glob::Pattern::new(&self.ignore_log_path_pattern).map_err(|e| {
                Error::InvalidGlob(format!(
                    "invalid ignore_log_path_pattern '{}': {}",
                    self.ignore_log_path_pattern, e
                ))
            })?;
        }
        // submeta_expire == 0 disables submeta cleaning entirely; otherwise
        // it must cover `expire` or offsets would be swept while their
        // follower is still eligible to run.
        if !self.submeta_expire.is_zero() && self.submeta_expire < self.expire {
            return Err(Error::Config(format!(
                "submeta_expire ({:?}) is less than expire ({:?})",
                self.submeta_expire, self.expire
            )));
        }
        if self.stat_interval.is_zero() {
            return Err(Error::Config("stat_interval must be non-zero".to_string()));
        }
        if self.max_open_files == 0 {
            return Err(Error::Config("max_open_files must be non-zero".to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid() -> TailConfig {
        TailConfig {
            log_path_pattern: "/var/log/*.log".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_validate_ok() {
        assert!(valid().validate().is_ok());
    }

    #[test]
    fn test_validate_requires_pattern() {
        let config = TailConfig::default();
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_validate_bad_glob() {
        let config = TailConfig {
            log_path_pattern: "/var/log/[*.log".to_string(),
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(Error::InvalidGlob(_))));
    }

    #[test]
    fn test_validate_submeta_expire_below_expire() {
        let config = TailConfig {
            submeta_expire: Duration::from_secs(60),
            expire: Duration::from_secs(120),
            ..valid()
        };
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_validate_submeta_expire_zero_disables_check() {
        let config = TailConfig {
            submeta_expire: Duration::ZERO,
            expire: Duration::from_secs(120),
            ..valid()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_expire_zero_is_allowed() {
        let config = TailConfig {
            expire: Duration::ZERO,
            ..valid()
        };
        assert!(config.validate().is_ok());
    }
}
