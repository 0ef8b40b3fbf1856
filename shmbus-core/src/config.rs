// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! YAML configuration parser with strict validation.
//!
//! A configuration names the bus to join, the capacity of the pipes this
//! process creates and, optionally, the terminal address it joins as.
//! Any invalid field results in a HardValidationError that prevents startup.
//!
//! ```yaml
//! bus:
//!   key: 0x1234
//!   pipe_capacity: 65536
//! terminal:
//!   kind: 0
//!   instance: 1
//! ```

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{BusError, BusResult, HardValidationError};
use crate::types::{BusKey, TerminalAddress};

/// Default ring capacity of a lazily created pipe.
pub const DEFAULT_PIPE_CAPACITY: usize = 64 * 1024;

/// Smallest accepted pipe capacity.
pub const MIN_PIPE_CAPACITY: usize = 64;

/// Largest accepted pipe capacity.
pub const MAX_PIPE_CAPACITY: usize = 64 * 1024 * 1024;

/// Bus key as written in YAML: an integer or a `0x` string.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawKey {
    Number(u64),
    Text(String),
}

/// Raw bus section as parsed from YAML (before validation).
#[derive(Debug, Deserialize)]
struct RawBusConfig {
    key: Option<RawKey>,
    #[serde(default = "default_pipe_capacity")]
    pipe_capacity: usize,
}

fn default_pipe_capacity() -> usize {
    DEFAULT_PIPE_CAPACITY
}

/// Raw terminal section.
#[derive(Debug, Deserialize)]
struct RawTerminalConfig {
    kind: Option<u32>,
    instance: Option<u32>,
}

/// Raw root configuration file.
#[derive(Debug, Deserialize)]
struct RawConfig {
    bus: Option<RawBusConfig>,
    terminal: Option<RawTerminalConfig>,
}

/// Validated configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BusConfig {
    pub key: BusKey,
    /// Power of two within `MIN_PIPE_CAPACITY..=MAX_PIPE_CAPACITY`.
    pub pipe_capacity: usize,
    pub terminal: Option<TerminalAddress>,
}

impl BusConfig {
    /// Configuration with default pipe capacity and no terminal.
    pub fn new(key: BusKey) -> Self {
        Self {
            key,
            pipe_capacity: DEFAULT_PIPE_CAPACITY,
            terminal: None,
        }
    }
}

/// Configuration loader with strict validation.
pub struct ConfigLoader;

impl ConfigLoader {
    /// Load and validate configuration from a YAML file.
    pub fn load_file(path: impl AsRef<Path>) -> BusResult<BusConfig> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(BusError::ConfigNotFound {
                path: path.to_path_buf(),
            });
        }

        let content = std::fs::read_to_string(path).map_err(|e| BusError::Io {
            context: "reading config file",
            source: e,
        })?;

        Self::load_string(&content)
    }

    /// Load and validate configuration from a YAML string.
    pub fn load_string(content: &str) -> BusResult<BusConfig> {
        let raw: RawConfig = serde_yaml::from_str(content).map_err(|e| BusError::ConfigParse {
            message: format!("YAML parse error: {}", e),
        })?;

        Self::validate(raw)
    }

    fn validate(raw: RawConfig) -> BusResult<BusConfig> {
        let bus = raw
            .bus
            .ok_or_else(|| HardValidationError::MissingRequiredField {
                field: "bus",
                context: "configuration root".to_string(),
            })?;

        let key = Self::validate_key(bus.key)?;
        let pipe_capacity = Self::validate_capacity(bus.pipe_capacity)?;
        let terminal = raw.terminal.map(Self::validate_terminal).transpose()?;

        Ok(BusConfig {
            key,
            pipe_capacity,
            terminal,
        })
    }

    fn validate_key(raw: Option<RawKey>) -> Result<BusKey, HardValidationError> {
        match raw {
            None => Err(HardValidationError::MissingRequiredField {
                field: "key",
                context: "bus".to_string(),
            }),
            Some(RawKey::Number(n)) => u16::try_from(n).map(BusKey::new).map_err(|_| {
                HardValidationError::InvalidFieldValue {
                    field: "key",
                    value: n.to_string(),
                    reason: format!("Must not exceed {:#06x}", u16::MAX),
                }
            }),
            Some(RawKey::Text(s)) => s.parse(),
        }
    }

    /// Bounds-check and round up to the next power of two.
    fn validate_capacity(capacity: usize) -> Result<usize, HardValidationError> {
        if !(MIN_PIPE_CAPACITY..=MAX_PIPE_CAPACITY).contains(&capacity) {
            return Err(HardValidationError::InvalidFieldValue {
                field: "pipe_capacity",
                value: capacity.to_string(),
                reason: format!(
                    "Must be between {} and {} bytes",
                    MIN_PIPE_CAPACITY, MAX_PIPE_CAPACITY
                ),
            });
        }
        Ok(capacity.next_power_of_two())
    }

    fn validate_terminal(raw: RawTerminalConfig) -> Result<TerminalAddress, HardValidationError> {
        let kind = raw.kind.unwrap_or(0);
        let instance = raw
            .instance
            .ok_or_else(|| HardValidationError::MissingRequiredField {
                field: "instance",
                context: "terminal".to_string(),
            })?;

        let kind = u16::try_from(kind).map_err(|_| HardValidationError::InvalidFieldValue {
            field: "kind",
            value: kind.to_string(),
            reason: "Out of range".to_string(),
        })?;
        let instance =
            u16::try_from(instance).map_err(|_| HardValidationError::InvalidFieldValue {
                field: "instance",
                value: instance.to_string(),
                reason: format!("Must not exceed {}", u16::MAX),
            })?;

        TerminalAddress::new(kind, instance)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const VALID_CONFIG: &str = r#"
bus:
  key: 0x1234
  pipe_capacity: 4096
terminal:
  kind: 2
  instance: 7
"#;

    #[test]
    fn test_valid_config() {
        let config = ConfigLoader::load_string(VALID_CONFIG).unwrap();
        assert_eq!(config.key, BusKey::new(0x1234));
        assert_eq!(config.pipe_capacity, 4096);
        assert_eq!(config.terminal, Some(TerminalAddress::new(2, 7).unwrap()));
    }

    #[test]
    fn test_defaults() {
        let config = ConfigLoader::load_string("bus:\n  key: 42\n").unwrap();
        assert_eq!(config.key.value(), 42);
        assert_eq!(config.pipe_capacity, DEFAULT_PIPE_CAPACITY);
        assert!(config.terminal.is_none());
        assert_eq!(config, BusConfig::new(BusKey::new(42)));
    }

    #[test]
    fn test_key_as_string() {
        let config = ConfigLoader::load_string("bus:\n  key: \"0xBEEF\"\n").unwrap();
        assert_eq!(config.key.value(), 0xBEEF);
    }

    #[test]
    fn test_missing_bus_section() {
        let result = ConfigLoader::load_string("terminal:\n  instance: 1\n");
        assert!(matches!(
            result,
            Err(BusError::HardValidation(
                HardValidationError::MissingRequiredField { field: "bus", .. }
            ))
        ));
    }

    #[test]
    fn test_missing_key() {
        let result = ConfigLoader::load_string("bus:\n  pipe_capacity: 1024\n");
        assert!(matches!(
            result,
            Err(BusError::HardValidation(
                HardValidationError::MissingRequiredField { field: "key", .. }
            ))
        ));
    }

    #[test]
    fn test_key_out_of_range() {
        let result = ConfigLoader::load_string("bus:\n  key: 70000\n");
        assert!(result.is_err());
    }

    #[test]
    fn test_capacity_bounds_and_rounding() {
        let result = ConfigLoader::load_string("bus:\n  key: 1\n  pipe_capacity: 16\n");
        assert!(result.is_err());

        let result = ConfigLoader::load_string("bus:\n  key: 1\n  pipe_capacity: 134217728\n");
        assert!(result.is_err());

        let config = ConfigLoader::load_string("bus:\n  key: 1\n  pipe_capacity: 1000\n").unwrap();
        assert_eq!(config.pipe_capacity, 1024);
    }

    #[test]
    fn test_terminal_requires_instance() {
        let yaml = "bus:\n  key: 1\nterminal:\n  kind: 3\n";
        assert!(ConfigLoader::load_string(yaml).is_err());
    }

    #[test]
    fn test_terminal_kind_out_of_range() {
        let yaml = "bus:\n  key: 1\nterminal:\n  kind: 40000\n  instance: 1\n";
        assert!(ConfigLoader::load_string(yaml).is_err());
    }

    #[test]
    fn test_malformed_yaml() {
        let result = ConfigLoader::load_string("bus: [unclosed");
        assert!(matches!(result, Err(BusError::ConfigParse { .. })));
    }

    #[test]
    fn test_missing_file() {
        let result = ConfigLoader::load_file("/nonexistent/shmbus.yaml");
        assert!(matches!(result, Err(BusError::ConfigNotFound { .. })));
    }
}
