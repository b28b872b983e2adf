//! Register catalog: the static name → definition table.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::anomaly::ValidityRule;
use crate::error::{Dx2wError, Result};

/// Poll group used for registers that do not name one.
pub const DEFAULT_GROUP: &str = "default";

/// Wire representation of a holding register.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WireType {
    /// Unsigned 16-bit integer (1 word)
    Uint16,
    /// Signed 16-bit integer (1 word)
    Int16,
    /// IEEE-754 float, big-endian word order (2 words)
    Float32,
    /// On/off flag (1 word, nonzero = true)
    #[serde(alias = "binary")]
    Bool,
}

impl WireType {
    /// Number of 16-bit words the type occupies.
    pub fn word_count(&self) -> u16 {
        match self {
            WireType::Uint16 | WireType::Int16 | WireType::Bool => 1,
            WireType::Float32 => 2,
        }
    }

    /// Return the string name for this wire type.
    pub fn as_str(&self) -> &'static str {
        match self {
            WireType::Uint16 => "uint16",
            WireType::Int16 => "int16",
            WireType::Float32 => "float32",
            WireType::Bool => "bool",
        }
    }
}

/// Definition of a single named register.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegisterDefinition {
    /// Register name (the catalog key).
    #[serde(skip)]
    pub name: String,

    /// Holding register address (0-based).
    pub address: u16,

    /// Wire type.
    pub data_type: WireType,

    /// Scaling factor; `0` means the raw value is used as-is.
    #[serde(default)]
    pub scale: f64,

    /// Offset applied after scaling.
    #[serde(default)]
    pub offset: f64,

    /// Whether external callers may write this register.
    #[serde(default)]
    pub writable: bool,

    /// Poll group name; empty means [`DEFAULT_GROUP`].
    #[serde(default)]
    pub group: String,

    /// Human-readable description.
    #[serde(default)]
    pub description: String,

    /// Plausibility rule applied to decoded readings.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validation: Option<ValidityRule>,
}

impl RegisterDefinition {
    /// Create a definition with no scaling, read-only, in the default group.
    pub fn new(name: impl Into<String>, address: u16, data_type: WireType) -> Self {
        Self {
            name: name.into(),
            address,
            data_type,
            scale: 0.0,
            offset: 0.0,
            writable: false,
            group: String::new(),
            description: String::new(),
            validation: None,
        }
    }

    /// Set scale and offset.
    pub fn scaled(mut self, scale: f64, offset: f64) -> Self {
        self.scale = scale;
        self.offset = offset;
        self
    }

    /// Mark the register writable.
    pub fn writable(mut self) -> Self {
        self.writable = true;
        self
    }

    /// Put the register in a poll group.
    pub fn in_group(mut self, group: impl Into<String>) -> Self {
        self.group = group.into();
        self
    }

    /// Attach a plausibility rule.
    pub fn with_validation(mut self, rule: ValidityRule) -> Self {
        self.validation = Some(rule);
        self
    }

    /// Whether decoded values are scaled.
    pub fn is_scaled(&self) -> bool {
        self.scale != 0.0
    }

    /// Effective poll group.
    pub fn group_name(&self) -> &str {
        if self.group.is_empty() {
            DEFAULT_GROUP
        } else {
            &self.group
        }
    }
}

/// Immutable register table, loaded once at startup.
#[derive(Debug, Clone, Default)]
pub struct RegisterCatalog {
    registers: BTreeMap<String, RegisterDefinition>,
}

impl RegisterCatalog {
    /// Build a catalog from definitions keyed by name.
    ///
    /// Each definition's `name` is overwritten with its key.
    pub fn new(registers: BTreeMap<String, RegisterDefinition>) -> Self {
        let registers = registers
            .into_iter()
            .map(|(name, mut def)| {
                def.name = name.clone();
                (name, def)
            })
            .collect();
        Self { registers }
    }

    /// Build a catalog from a list of named definitions.
    pub fn from_definitions(defs: impl IntoIterator<Item = RegisterDefinition>) -> Self {
        Self::new(defs.into_iter().map(|d| (d.name.clone(), d)).collect())
    }

    /// Look up a register, failing with a configuration error if unknown.
    pub fn get(&self, name: &str) -> Result<&RegisterDefinition> {
        self.registers
            .get(name)
            .ok_or_else(|| Dx2wError::unknown_register(name))
    }

    /// Whether the register exists.
    pub fn contains(&self, name: &str) -> bool {
        self.registers.contains_key(name)
    }

    /// Iterate over all definitions in name order.
    pub fn iter(&self) -> impl Iterator<Item = &RegisterDefinition> {
        self.registers.values()
    }

    pub fn len(&self) -> usize {
        self.registers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.registers.is_empty()
    }

    /// Partition register names by effective poll group.
    pub fn groups(&self) -> BTreeMap<String, Vec<String>> {
        let mut grouped: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for def in self.registers.values() {
            grouped
                .entry(def.group_name().to_string())
                .or_default()
                .push(def.name.clone());
        }
        grouped
    }

    /// Validate the catalog.
    ///
    /// This is the one place a configuration error is fatal: the process must
    /// not run against an inconsistent register table.
    pub fn validate(&self) -> Result<()> {
        if self.registers.is_empty() {
            return Err(Dx2wError::config("At least one register must be configured"));
        }

        for def in self.registers.values() {
            if def.name.trim().is_empty() {
                return Err(Dx2wError::config("Register name cannot be empty"));
            }

            if !def.scale.is_finite() || !def.offset.is_finite() {
                return Err(Dx2wError::config(format!(
                    "Register '{}': scale and offset must be finite",
                    def.name
                )));
            }

            if def.data_type == WireType::Bool && def.is_scaled() {
                return Err(Dx2wError::config(format!(
                    "Register '{}': bool registers cannot be scaled",
                    def.name
                )));
            }

            if def.address.checked_add(def.data_type.word_count() - 1).is_none() {
                return Err(Dx2wError::config(format!(
                    "Register '{}': address {} overflows the register space",
                    def.name, def.address
                )));
            }

            if let Some(rule) = &def.validation {
                rule.validate(&def.name)?;
                if let Some(companion) = rule.companion() {
                    if !self.registers.contains_key(companion) {
                        return Err(Dx2wError::config(format!(
                            "Register '{}': validation depends on unknown register '{}'",
                            def.name, companion
                        )));
                    }
                }
            }
        }

        Ok(())
    }
}
