//! Configuration for the DX2W bridge.

use hydrobridge_common::{Format, LoggingConfig};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::catalog::{DEFAULT_GROUP, RegisterCatalog, RegisterDefinition};
use crate::error::{Dx2wError, Result};

/// Poll interval used when neither the group nor `default` is configured.
pub const FALLBACK_POLL_INTERVAL_SECS: u64 = 660;

/// Complete bridge configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Dx2wBridgeConfig {
    /// Modbus TCP gateway settings
    pub modbus: ModbusConfig,

    /// Poll interval in seconds, per group name
    #[serde(default)]
    pub poll_groups: BTreeMap<String, u64>,

    /// Register catalog, keyed by register name
    pub registers: BTreeMap<String, RegisterDefinition>,

    /// History retention and snapshot settings
    #[serde(default)]
    pub history: HistoryConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Modbus TCP session settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModbusConfig {
    /// Gateway host (IP or hostname)
    pub host: String,

    /// TCP port (default: 502)
    #[serde(default = "default_modbus_port")]
    pub port: u16,

    /// Modbus unit/slave ID (1-247)
    #[serde(default = "default_unit_id", alias = "slave_id")]
    pub unit_id: u8,

    /// Connect and transaction timeout in seconds
    #[serde(default = "default_timeout_secs", alias = "timeout")]
    pub timeout_secs: u64,
}

fn default_modbus_port() -> u16 {
    502
}

fn default_unit_id() -> u8 {
    1
}

fn default_timeout_secs() -> u64 {
    5
}

/// Snapshot persistence settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryConfig {
    /// Directory holding the snapshot file
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Snapshot file name inside `data_dir`
    #[serde(default = "default_snapshot_file")]
    pub snapshot_file: String,

    /// Seconds between periodic snapshots
    #[serde(default = "default_snapshot_interval")]
    pub snapshot_interval_secs: u64,

    /// Encoding inside the gzip stream
    #[serde(default)]
    pub format: Format,
}

fn default_data_dir() -> PathBuf {
    PathBuf::from(".")
}

fn default_snapshot_file() -> String {
    "dx2w_history.json.gz".to_string()
}

fn default_snapshot_interval() -> u64 {
    15 * 60
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            snapshot_file: default_snapshot_file(),
            snapshot_interval_secs: default_snapshot_interval(),
            format: Format::default(),
        }
    }
}

impl HistoryConfig {
    /// Full path of the snapshot file.
    pub fn snapshot_path(&self) -> PathBuf {
        self.data_dir.join(&self.snapshot_file)
    }

    pub fn snapshot_interval(&self) -> Duration {
        Duration::from_secs(self.snapshot_interval_secs)
    }
}

impl Dx2wBridgeConfig {
    /// Load configuration from a JSON5 file and validate it.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let config: Dx2wBridgeConfig = hydrobridge_common::load_config(path)?;
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from a JSON5 string and validate it.
    pub fn parse(content: &str) -> Result<Self> {
        let config: Dx2wBridgeConfig = hydrobridge_common::parse_config(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Build the register catalog.
    pub fn catalog(&self) -> RegisterCatalog {
        RegisterCatalog::new(self.registers.clone())
    }

    /// Poll interval for a group: its own, else `default`, else 660s.
    pub fn group_interval(&self, group: &str) -> Duration {
        let secs = self
            .poll_groups
            .get(group)
            .or_else(|| self.poll_groups.get(DEFAULT_GROUP))
            .copied()
            .unwrap_or(FALLBACK_POLL_INTERVAL_SECS);
        Duration::from_secs(secs)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.modbus.host.trim().is_empty() {
            return Err(Dx2wError::config("Modbus host cannot be empty"));
        }

        if self.modbus.unit_id == 0 || self.modbus.unit_id > 247 {
            return Err(Dx2wError::config(format!(
                "Modbus unit_id must be 1-247, got {}",
                self.modbus.unit_id
            )));
        }

        if self.modbus.timeout_secs == 0 {
            return Err(Dx2wError::config("Modbus timeout must be positive"));
        }

        for (group, secs) in &self.poll_groups {
            if *secs == 0 {
                return Err(Dx2wError::config(format!(
                    "Poll group '{}': interval must be positive",
                    group
                )));
            }
        }

        if self.history.snapshot_interval_secs == 0 {
            return Err(Dx2wError::config("Snapshot interval must be positive"));
        }

        if self.history.snapshot_file.trim().is_empty() {
            return Err(Dx2wError::config("Snapshot file name cannot be empty"));
        }

        self.catalog().validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::anomaly::ValidityRule;
    use crate::catalog::WireType;

    const SAMPLE: &str = r#"{
        modbus: { host: "192.168.1.50", slave_id: 200, timeout: 3 },
        poll_groups: { default: 300, fast: 15 },
        registers: {
            outside_air_temp: {
                address: 1000,
                data_type: "int16",
                scale: 0.1,
                group: "fast",
                description: "Outdoor air temperature",
                validation: { kind: "rate_limited_range", min: -58, max: 122, max_delta: 27, window_secs: 480 },
            },
            compressor_on: { address: 1010, data_type: "bool" },
            hot_water_design_temp: { address: 2000, data_type: "float32", writable: true, group: "slow" },
        },
        history: { data_dir: "/var/lib/hydrobridge", format: "cbor" },
    }"#;

    #[test]
    fn test_parse_config() {
        let config = Dx2wBridgeConfig::parse(SAMPLE).unwrap();

        assert_eq!(config.modbus.host, "192.168.1.50");
        assert_eq!(config.modbus.port, 502);
        assert_eq!(config.modbus.unit_id, 200);
        assert_eq!(config.modbus.timeout_secs, 3);
        assert_eq!(config.registers.len(), 3);
        assert_eq!(config.history.format, Format::Cbor);
        assert_eq!(config.history.snapshot_interval_secs, 900);
        assert_eq!(
            config.history.snapshot_path(),
            PathBuf::from("/var/lib/hydrobridge/dx2w_history.json.gz")
        );
    }

    #[test]
    fn test_catalog_names_filled() {
        let config = Dx2wBridgeConfig::parse(SAMPLE).unwrap();
        let catalog = config.catalog();

        let def = catalog.get("outside_air_temp").unwrap();
        assert_eq!(def.name, "outside_air_temp");
        assert_eq!(def.data_type, WireType::Int16);
        assert_eq!(
            def.validation,
            Some(ValidityRule::outdoor_air_temperature().to_fahrenheit())
        );
    }

    #[test]
    fn test_group_interval() {
        let config = Dx2wBridgeConfig::parse(SAMPLE).unwrap();

        assert_eq!(config.group_interval("fast"), Duration::from_secs(15));
        assert_eq!(config.group_interval(DEFAULT_GROUP), Duration::from_secs(300));
        // "slow" is not configured: falls back to the default group
        assert_eq!(config.group_interval("slow"), Duration::from_secs(300));
    }

    #[test]
    fn test_fallback_interval() {
        let mut config = Dx2wBridgeConfig::parse(SAMPLE).unwrap();
        config.poll_groups.clear();

        assert_eq!(
            config.group_interval("fast"),
            Duration::from_secs(FALLBACK_POLL_INTERVAL_SECS)
        );
    }

    #[test]
    fn test_validate_unit_id() {
        let mut config = Dx2wBridgeConfig::parse(SAMPLE).unwrap();
        config.modbus.unit_id = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_zero_interval() {
        let mut config = Dx2wBridgeConfig::parse(SAMPLE).unwrap();
        config.poll_groups.insert("fast".to_string(), 0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_unsupported_data_type_is_config_error() {
        let json = r#"{
            modbus: { host: "h" },
            registers: { r: { address: 1, data_type: "int32" } },
        }"#;
        assert!(matches!(
            Dx2wBridgeConfig::parse(json),
            Err(Dx2wError::Config(_))
        ));
    }

    #[test]
    fn test_example_config() {
        let config = Dx2wBridgeConfig::parse(include_str!("../dx2w.example.json5")).unwrap();

        assert_eq!(config.registers.len(), 10);
        assert_eq!(config.group_interval("fast"), Duration::from_secs(60));
        assert!(config.catalog().get("hot_water_differential").unwrap().writable);
    }

    #[test]
    fn test_validate_no_registers() {
        let json = r#"{ modbus: { host: "h" }, registers: {} }"#;
        assert!(Dx2wBridgeConfig::parse(json).is_err());
    }
}
