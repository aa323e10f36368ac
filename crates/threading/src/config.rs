//! Threading configuration

use crate::{Result, ThreadError};
use serde::{Deserialize, Serialize};

/// Sizing of the thread pool and its stacks
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThreadConfig {
    /// Number of user threads (stack slots) available
    #[serde(default = "ThreadConfig::default_max_threads")]
    pub max_threads: usize,
    /// Stack size in bytes used when a thread asks for 0, and the size of each pool slot
    #[serde(default = "ThreadConfig::default_stack_size")]
    pub default_stack_size: usize,
    /// Requests below this are raised to it
    #[serde(default = "ThreadConfig::default_min_stack_size")]
    pub min_stack_size: usize,
    /// Bytes held back from the reported usable stack size
    #[serde(default = "ThreadConfig::default_stack_margin")]
    pub stack_margin: usize,
    /// Kernel priority for user threads
    #[serde(default = "ThreadConfig::default_priority")]
    pub priority: i32,
}

impl Default for ThreadConfig {
    fn default() -> Self {
        Self {
            max_threads: Self::default_max_threads(),
            default_stack_size: Self::default_stack_size(),
            min_stack_size: Self::default_min_stack_size(),
            stack_margin: Self::default_stack_margin(),
            priority: Self::default_priority(),
        }
    }
}

impl ThreadConfig {
    fn default_max_threads() -> usize {
        8
    }

    fn default_stack_size() -> usize {
        Self::default_min_stack_size() + 1024
    }

    fn default_min_stack_size() -> usize {
        4 * 1024
    }

    fn default_stack_margin() -> usize {
        1024
    }

    fn default_priority() -> i32 {
        5
    }

    /// Normalize a requested stack size: 0 selects the default, small requests are raised
    pub fn normalize_stack_size(&self, requested: usize) -> usize {
        match requested {
            0 => self.default_stack_size,
            n if n < self.min_stack_size => self.min_stack_size,
            n => n,
        }
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        if self.max_threads == 0 {
            return Err(ThreadError::Config(
                "max_threads must be at least 1".to_string(),
            ));
        }
        if self.min_stack_size > self.default_stack_size {
            return Err(ThreadError::Config(format!(
                "min_stack_size ({}) exceeds default_stack_size ({})",
                self.min_stack_size, self.default_stack_size
            )));
        }
        if self.stack_margin >= self.min_stack_size {
            return Err(ThreadError::Config(format!(
                "stack_margin ({}) must be smaller than min_stack_size ({})",
                self.stack_margin, self.min_stack_size
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ThreadConfig::default();
        assert_eq!(config.max_threads, 8);
        assert_eq!(config.min_stack_size, 4096);
        assert_eq!(config.default_stack_size, 5120);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_normalize_stack_size() {
        let config = ThreadConfig::default();
        assert_eq!(config.normalize_stack_size(0), 5120);
        assert_eq!(config.normalize_stack_size(100), 4096);
        assert_eq!(config.normalize_stack_size(8192), 8192);
    }

    #[test]
    fn test_validate_rejects_inconsistent_sizes() {
        let mut config = ThreadConfig::default();
        config.min_stack_size = 16 * 1024;
        assert!(config.validate().is_err());

        let mut config = ThreadConfig::default();
        config.max_threads = 0;
        assert!(config.validate().is_err());

        let mut config = ThreadConfig::default();
        config.stack_margin = config.min_stack_size;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: ThreadConfig = toml::from_str("max_threads = 2").unwrap();
        assert_eq!(config.max_threads, 2);
        assert_eq!(config.default_stack_size, 5120);
    }

    proptest::proptest! {
        #[test]
        fn test_normalized_size_never_below_minimum(requested in 0usize..64 * 1024) {
            let config = ThreadConfig::default();
            let size = config.normalize_stack_size(requested);
            proptest::prop_assert!(size >= config.min_stack_size);
            if requested >= config.min_stack_size {
                proptest::prop_assert_eq!(size, requested);
            }
        }
    }
}
