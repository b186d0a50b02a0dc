// SPDX-FileCopyrightText: 2025 2025 Contributors to the OpenIMP project.
// SPDX-License-Identifier: Apache-2.0

//! Runtime tuning knobs.
//!
//! The registry dimensions are fixed by [`imp_sys::MAX_DEVICES`] and
//! [`imp_sys::MAX_GROUPS`]; everything that can reasonably differ between
//! boards lives in [`RuntimeConfig`].

use std::{path::Path, time::Duration};

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Environment variable naming a JSON configuration file.
pub const CONFIG_ENV_VAR: &str = "IMP_CONFIG";

/// Runtime configuration.
///
/// Every field has a default, so a configuration document only needs to list
/// the values it changes.
///
/// # Examples
///
/// ```
/// use imp::config::RuntimeConfig;
///
/// # fn main() -> Result<(), imp::Error> {
/// let config = RuntimeConfig::from_json_str(r#"{ "in_flight_frames": 4 }"#)?;
/// assert_eq!(config.in_flight_frames, 4);
/// assert_eq!(config.device_open_attempts, 257);
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Attempts made when opening a frame-channel device node.
    pub device_open_attempts: u32,
    /// Delay between two open attempts, in milliseconds.
    pub device_open_interval_ms: u64,
    /// Period at which idle channel workers check for cancellation.
    pub worker_idle_interval_ms: u64,
    /// Frames a module may be processing at once before deliveries are dropped.
    pub in_flight_frames: usize,
    /// Number of buffer-pool slots.
    pub max_pools: usize,
    /// Number of analysis channels.
    pub max_channels: usize,
    /// Number of analysis groups.
    pub max_channel_groups: usize,
    /// Live buffers tracked by [`crate::HeapAllocator`].
    pub max_dma_buffers: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            device_open_attempts: 257,
            device_open_interval_ms: 10,
            worker_idle_interval_ms: 100,
            in_flight_frames: 16,
            max_pools: 6,
            max_channels: 65,
            max_channel_groups: 2,
            max_dma_buffers: 128,
        }
    }
}

impl RuntimeConfig {
    /// Parses and validates a JSON document.
    ///
    /// # Errors
    ///
    /// - [`Error::Config`] if the document is not valid JSON for this type
    /// - [`Error::InvalidArg`] if a value fails [`Self::validate`]
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Reads, parses and validates a JSON file.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Device`] if the file cannot be read, otherwise the
    /// errors of [`Self::from_json_str`].
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let json = std::fs::read_to_string(path.as_ref())?;
        Self::from_json_str(&json)
    }

    /// Loads the file named by `IMP_CONFIG`, or the defaults when it is unset.
    pub fn from_env() -> Result<Self> {
        match std::env::var_os(CONFIG_ENV_VAR) {
            Some(path) => {
                tracing::info!(path = ?path, "Loading runtime configuration.");
                Self::from_file(path)
            }
            None => Ok(Self::default()),
        }
    }

    /// Rejects zero counts and zero intervals.
    pub fn validate(&self) -> Result<()> {
        let counts = [
            ("device_open_attempts", self.device_open_attempts as usize),
            ("in_flight_frames", self.in_flight_frames),
            ("max_pools", self.max_pools),
            ("max_channels", self.max_channels),
            ("max_channel_groups", self.max_channel_groups),
            ("max_dma_buffers", self.max_dma_buffers),
        ];
        if let Some((name, _)) = counts.iter().find(|(_, value)| *value == 0) {
            return Err(Error::InvalidArg(format!("{name} must be non-zero")));
        }
        if self.worker_idle_interval_ms == 0 {
            return Err(Error::InvalidArg(
                "worker_idle_interval_ms must be non-zero".to_string(),
            ));
        }
        if self.max_channel_groups > imp_sys::MAX_GROUPS {
            return Err(Error::InvalidArg(format!(
                "max_channel_groups exceeds the registry's {} groups",
                imp_sys::MAX_GROUPS
            )));
        }
        Ok(())
    }

    pub fn device_open_interval(&self) -> Duration {
        Duration::from_millis(self.device_open_interval_ms)
    }

    pub fn worker_idle_interval(&self) -> Duration {
        Duration::from_millis(self.worker_idle_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_yields_defaults() {
        let config = RuntimeConfig::from_json_str("{}").unwrap();
        assert_eq!(config, RuntimeConfig::default());
        assert_eq!(config.device_open_interval(), Duration::from_millis(10));
    }

    #[test]
    fn zero_counts_are_rejected() {
        let err = RuntimeConfig::from_json_str(r#"{ "max_pools": 0 }"#).unwrap_err();
        assert!(matches!(err, Error::InvalidArg(msg) if msg.contains("max_pools")));

        let err = RuntimeConfig::from_json_str(r#"{ "worker_idle_interval_ms": 0 }"#).unwrap_err();
        assert!(matches!(err, Error::InvalidArg(_)));
    }

    #[test]
    fn malformed_document_is_a_config_error() {
        let err = RuntimeConfig::from_json_str(r#"{ "max_pools": "six" }"#).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn groups_cannot_exceed_registry_columns() {
        let config = RuntimeConfig {
            max_channel_groups: imp_sys::MAX_GROUPS + 1,
            ..RuntimeConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn missing_file_is_a_device_error() {
        let path = std::env::temp_dir().join(format!("imp-missing-{}.json", uuid::Uuid::new_v4()));
        assert!(matches!(RuntimeConfig::from_file(path), Err(Error::Device(_))));
    }
}
