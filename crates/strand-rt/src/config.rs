// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Runtime configuration.
//!
//! One process-wide config, resolved on first use. The only knob today is
//! the default fiber stack size, overridable through the environment.

use std::sync::OnceLock;

use thiserror::Error;

/// Environment variable overriding the default stack size (bytes).
pub const STACK_SIZE_ENV: &str = "STRAND_FIBER_STACK_SIZE";

/// Default fiber stack size: 128 KiB.
pub const DEFAULT_STACK_SIZE: usize = 128 * 1024;

/// Smallest stack the runtime will hand to a fiber.
pub const MIN_STACK_SIZE: usize = 16 * 1024;

/// Rejected environment override.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("STRAND_FIBER_STACK_SIZE is not a byte count: {0:?}")]
    MalformedStackSize(String),
    #[error("stack size {0} is below the {MIN_STACK_SIZE}-byte minimum")]
    StackTooSmall(usize),
}

/// Process-wide runtime configuration.
#[derive(Debug, Clone)]
pub struct RtConfig {
    /// Stack size for fibers created without an explicit size.
    pub stack_size: usize,
}

impl Default for RtConfig {
    fn default() -> Self {
        Self {
            stack_size: DEFAULT_STACK_SIZE,
        }
    }
}

impl RtConfig {
    /// Read the config from the environment. An unset variable yields the
    /// defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        let raw = match std::env::var(STACK_SIZE_ENV) {
            Ok(raw) => raw,
            Err(_) => return Ok(Self::default()),
        };
        let bytes: usize = raw
            .trim()
            .parse()
            .map_err(|_| ConfigError::MalformedStackSize(raw.clone()))?;
        if bytes < MIN_STACK_SIZE {
            return Err(ConfigError::StackTooSmall(bytes));
        }
        Ok(Self { stack_size: bytes })
    }
}

static CONFIG: OnceLock<RtConfig> = OnceLock::new();

/// The resolved process-wide config. A malformed override is logged once
/// and replaced by the defaults.
pub fn config() -> &'static RtConfig {
    CONFIG.get_or_init(|| match RtConfig::from_env() {
        Ok(cfg) => cfg,
        Err(err) => {
            log::warn!("ignoring stack size override: {err}");
            RtConfig::default()
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_when_env_unset() {
        // Only this test touches the variable.
        std::env::remove_var(STACK_SIZE_ENV);
        assert_eq!(RtConfig::from_env().unwrap().stack_size, DEFAULT_STACK_SIZE);

        std::env::set_var(STACK_SIZE_ENV, "262144");
        assert_eq!(RtConfig::from_env().unwrap().stack_size, 262144);

        std::env::set_var(STACK_SIZE_ENV, "lots");
        assert!(matches!(
            RtConfig::from_env(),
            Err(ConfigError::MalformedStackSize(_))
        ));

        std::env::set_var(STACK_SIZE_ENV, "1024");
        assert!(matches!(
            RtConfig::from_env(),
            Err(ConfigError::StackTooSmall(1024))
        ));

        std::env::remove_var(STACK_SIZE_ENV);
    }
}
