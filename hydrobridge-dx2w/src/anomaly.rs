//! Plausibility rules for decoded register readings.
//!
//! A rejected reading does not stop polling: the store records it as a
//! carried-forward entry with the rejection message.

use chrono::{DateTime, TimeDelta, Utc};
use hydrobridge_common::{HistoryEntry, Value};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::catalog::RegisterCatalog;
use crate::error::{Dx2wError, Result};
use crate::history::{HistoryStore, RETENTION_HOURS};

/// Longest rate-of-change window: older entries are pruned anyway.
pub const MAX_RATE_WINDOW_SECS: u64 = RETENTION_HOURS as u64 * 3600;

/// Validity rule attached to a register in the catalog.
///
/// Bounds are expressed in the register's own (decoded) units.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ValidityRule {
    /// Absolute bounds.
    Range { min: f64, max: f64 },

    /// Absolute bounds plus a limit on change against the register's own
    /// latest entry, applied when that entry is younger than `window_secs`.
    RateLimitedRange {
        min: f64,
        max: f64,
        max_delta: f64,
        window_secs: u64,
    },

    /// Heat-pump output power, cross-checked against an input power register.
    OutputPower {
        max_output: f64,
        companion: String,
        min_companion: f64,
        max_ratio: f64,
    },
}

impl ValidityRule {
    /// Supply/return water temperatures, °C.
    pub fn water_temperature() -> Self {
        ValidityRule::Range {
            min: 20.0,
            max: 50.0,
        }
    }

    /// Outdoor air temperature, °C: no more than 15 °C change within 8 minutes.
    pub fn outdoor_air_temperature() -> Self {
        ValidityRule::RateLimitedRange {
            min: -50.0,
            max: 50.0,
            max_delta: 15.0,
            window_secs: 8 * 60,
        }
    }

    /// Output power with `companion` as the input power register.
    pub fn heat_pump_output(companion: impl Into<String>) -> Self {
        ValidityRule::OutputPower {
            max_output: 15.0,
            companion: companion.into(),
            min_companion: 100.0,
            max_ratio: 8.0,
        }
    }

    /// Convert a Celsius temperature rule to Fahrenheit.
    ///
    /// Absolute bounds are converted as temperatures, `max_delta` as a
    /// temperature difference. Power rules are returned unchanged.
    pub fn to_fahrenheit(self) -> Self {
        let temp = |c: f64| c * 9.0 / 5.0 + 32.0;
        match self {
            ValidityRule::Range { min, max } => ValidityRule::Range {
                min: temp(min),
                max: temp(max),
            },
            ValidityRule::RateLimitedRange {
                min,
                max,
                max_delta,
                window_secs,
            } => ValidityRule::RateLimitedRange {
                min: temp(min),
                max: temp(max),
                max_delta: max_delta * 9.0 / 5.0,
                window_secs,
            },
            other => other,
        }
    }

    /// Register this rule depends on, besides the one it is attached to.
    pub fn companion(&self) -> Option<&str> {
        match self {
            ValidityRule::OutputPower { companion, .. } => Some(companion),
            _ => None,
        }
    }

    /// Check the rule's own parameters.
    pub fn validate(&self, register: &str) -> Result<()> {
        let bad = |msg: &str| {
            Err(Dx2wError::config(format!(
                "Register '{}': invalid validation rule: {}",
                register, msg
            )))
        };

        match self {
            ValidityRule::Range { min, max } => {
                if !(min.is_finite() && max.is_finite()) || min > max {
                    return bad("range requires finite min <= max");
                }
            }
            ValidityRule::RateLimitedRange {
                min,
                max,
                max_delta,
                window_secs,
            } => {
                if !(min.is_finite() && max.is_finite()) || min > max {
                    return bad("range requires finite min <= max");
                }
                if !max_delta.is_finite() || *max_delta <= 0.0 || *window_secs == 0 {
                    return bad("max_delta and window_secs must be positive");
                }
                if *window_secs > MAX_RATE_WINDOW_SECS {
                    return bad("window_secs cannot exceed the 24h retention window");
                }
            }
            ValidityRule::OutputPower {
                max_output,
                companion,
                min_companion,
                max_ratio,
            } => {
                if companion.is_empty() {
                    return bad("companion register name is empty");
                }
                if companion == register {
                    return bad("companion must be a different register");
                }
                if *max_output <= 0.0 || *max_ratio <= 0.0 || *min_companion < 0.0 {
                    return bad("power limits must be positive");
                }
            }
        }

        Ok(())
    }

    /// Evaluate `value` against this rule.
    ///
    /// `own_latest` is the register's most recent entry, `companion_latest`
    /// the companion register's (for cross-register rules).
    pub fn check(
        &self,
        value: Value,
        own_latest: Option<&HistoryEntry>,
        companion_latest: Option<&HistoryEntry>,
        now: DateTime<Utc>,
    ) -> std::result::Result<(), String> {
        let Some(v) = value.numeric() else {
            return Err(format!("expected a numeric value, got {}", value));
        };

        match self {
            ValidityRule::Range { min, max } => check_bounds(v, *min, *max),
            ValidityRule::RateLimitedRange {
                min,
                max,
                max_delta,
                window_secs,
            } => {
                check_bounds(v, *min, *max)?;

                let Some(latest) = own_latest else {
                    return Ok(());
                };
                let Some(prev) = latest.value.and_then(|p| p.numeric()) else {
                    return Ok(());
                };

                let delta = (v - prev).abs();
                let age = now - latest.timestamp;
                let window = i64::try_from(*window_secs)
                    .ok()
                    .and_then(TimeDelta::try_seconds)
                    .unwrap_or(TimeDelta::MAX);
                if age < window && delta > *max_delta {
                    return Err(format!(
                        "changed too fast: delta {:.1} in {}s",
                        delta,
                        age.num_seconds()
                    ));
                }
                Ok(())
            }
            ValidityRule::OutputPower {
                max_output,
                min_companion,
                max_ratio,
                ..
            } => {
                if v == 0.0 {
                    return Ok(());
                }
                if v < 0.0 {
                    return Err("negative output".to_string());
                }
                if v > *max_output {
                    return Err(format!(
                        "output {} exceeds expected maximum {}",
                        v, max_output
                    ));
                }

                let input = companion_latest
                    .and_then(|e| e.value)
                    .and_then(|p| p.numeric());
                if let Some(input) = input {
                    if input < *min_companion {
                        return Err("can't have output with no input".to_string());
                    }
                    if v > max_ratio * input {
                        return Err(format!("can't have output with COP > {}", max_ratio));
                    }
                }
                Ok(())
            }
        }
    }
}

fn check_bounds(v: f64, min: f64, max: f64) -> std::result::Result<(), String> {
    if v < min {
        return Err(format!("value {} below minimum {}", v, min));
    }
    if v > max {
        return Err(format!("value {} above maximum {}", v, max));
    }
    Ok(())
}

/// Per-register rule table.
#[derive(Debug, Clone, Default)]
pub struct AnomalyDetector {
    rules: HashMap<String, ValidityRule>,
}

impl AnomalyDetector {
    /// Detector with no rules; every value passes.
    pub fn new() -> Self {
        Self::default()
    }

    /// Collect the rules declared in the catalog.
    pub fn from_catalog(catalog: &RegisterCatalog) -> Self {
        let rules = catalog
            .iter()
            .filter_map(|def| def.validation.clone().map(|r| (def.name.clone(), r)))
            .collect();
        Self { rules }
    }

    /// Add or replace the rule for a register.
    pub fn with_rule(mut self, register: impl Into<String>, rule: ValidityRule) -> Self {
        self.rules.insert(register.into(), rule);
        self
    }

    /// Rule configured for a register, if any.
    pub fn rule(&self, register: &str) -> Option<&ValidityRule> {
        self.rules.get(register)
    }

    /// Validate a freshly decoded value against the register's rule and the
    /// accumulated history.
    pub fn validate(
        &self,
        register: &str,
        value: Value,
        history: &HistoryStore,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let Some(rule) = self.rules.get(register) else {
            return Ok(());
        };

        let own = history.latest(register);
        let companion = rule.companion().and_then(|c| history.latest(c));

        rule.check(value, own.as_ref(), companion.as_ref(), now)
            .map_err(|msg| {
                Dx2wError::validation(format!("invalid value for '{}': {}", register, msg))
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(value: f64, age_secs: i64, now: DateTime<Utc>) -> HistoryEntry {
        HistoryEntry::ok(Value::Numeric(value)).at(now - TimeDelta::seconds(age_secs))
    }

    #[test]
    fn test_water_temperature_bounds() {
        let rule = ValidityRule::water_temperature();
        let now = Utc::now();

        assert!(rule.check(Value::Numeric(35.0), None, None, now).is_ok());
        assert!(rule.check(Value::Numeric(20.0), None, None, now).is_ok());
        assert!(rule.check(Value::Numeric(5.0), None, None, now).is_err());
        assert!(rule.check(Value::Numeric(50.1), None, None, now).is_err());
    }

    #[test]
    fn test_boolean_against_numeric_rule() {
        let rule = ValidityRule::water_temperature();
        assert!(
            rule.check(Value::Boolean(true), None, None, Utc::now())
                .is_err()
        );
    }

    #[test]
    fn test_outdoor_air_rate_of_change() {
        let rule = ValidityRule::outdoor_air_temperature();
        let now = Utc::now();

        // 20 degree jump within 2 minutes is implausible
        let recent = entry(-5.0, 120, now);
        assert!(
            rule.check(Value::Numeric(15.0), Some(&recent), None, now)
                .is_err()
        );

        // Same jump after 10 minutes is accepted
        let stale = entry(-5.0, 600, now);
        assert!(
            rule.check(Value::Numeric(15.0), Some(&stale), None, now)
                .is_ok()
        );

        // Small change within the window is fine
        assert!(
            rule.check(Value::Numeric(0.0), Some(&recent), None, now)
                .is_ok()
        );
    }

    #[test]
    fn test_outdoor_air_absolute_bounds() {
        let rule = ValidityRule::outdoor_air_temperature();
        let now = Utc::now();

        assert!(rule.check(Value::Numeric(-51.0), None, None, now).is_err());
        assert!(rule.check(Value::Numeric(51.0), None, None, now).is_err());
        assert!(rule.check(Value::Numeric(-30.0), None, None, now).is_ok());
    }

    #[test]
    fn test_output_power_rules() {
        let rule = ValidityRule::heat_pump_output("hp_input_kw");
        let now = Utc::now();

        assert!(rule.check(Value::Numeric(0.0), None, None, now).is_ok());
        assert!(rule.check(Value::Numeric(-1.0), None, None, now).is_err());
        assert!(rule.check(Value::Numeric(16.0), None, None, now).is_err());
        assert!(rule.check(Value::Numeric(10.0), None, None, now).is_ok());

        let no_input = entry(50.0, 10, now);
        assert!(
            rule.check(Value::Numeric(10.0), None, Some(&no_input), now)
                .is_err()
        );

        let input = entry(1000.0, 10, now);
        assert!(
            rule.check(Value::Numeric(10.0), None, Some(&input), now)
                .is_ok()
        );
    }

    #[test]
    fn test_output_power_cop_ceiling() {
        let rule = ValidityRule::OutputPower {
            max_output: 15.0,
            companion: "hp_input_kw".to_string(),
            min_companion: 0.5,
            max_ratio: 8.0,
        };
        let now = Utc::now();
        let input = entry(1.0, 10, now);

        assert!(
            rule.check(Value::Numeric(8.0), None, Some(&input), now)
                .is_ok()
        );
        assert!(
            rule.check(Value::Numeric(9.0), None, Some(&input), now)
                .is_err()
        );
    }

    #[test]
    fn test_to_fahrenheit() {
        let rule = ValidityRule::outdoor_air_temperature().to_fahrenheit();
        assert_eq!(
            rule,
            ValidityRule::RateLimitedRange {
                min: -58.0,
                max: 122.0,
                max_delta: 27.0,
                window_secs: 480,
            }
        );
    }

    #[test]
    fn test_parse_rule() {
        let json = r#"{ kind: "output_power", max_output: 15, companion: "hp_input_kw", min_companion: 100, max_ratio: 8 }"#;
        let rule: ValidityRule = json5::from_str(json).unwrap();

        assert_eq!(rule, ValidityRule::heat_pump_output("hp_input_kw"));
        assert_eq!(rule.companion(), Some("hp_input_kw"));
    }

    #[test]
    fn test_rule_validation() {
        assert!(ValidityRule::Range { min: 5.0, max: 1.0 }
            .validate("x")
            .is_err());
        assert!(ValidityRule::heat_pump_output("x").validate("x").is_err());
        assert!(ValidityRule::outdoor_air_temperature().validate("x").is_ok());
    }

    #[test]
    fn test_rate_window_bounded() {
        let json = r#"{ kind: "rate_limited_range", min: -58, max: 122, max_delta: 27, window_secs: 100000000000000000 }"#;
        let rule: ValidityRule = json5::from_str(json).unwrap();
        assert!(matches!(rule.validate("oat"), Err(Dx2wError::Config(_))));

        let day = ValidityRule::RateLimitedRange {
            min: -58.0,
            max: 122.0,
            max_delta: 27.0,
            window_secs: MAX_RATE_WINDOW_SECS,
        };
        assert!(day.validate("oat").is_ok());
    }

    #[test]
    fn test_oversized_window_checks_without_panicking() {
        let now = Utc::now();
        let prev = entry(50.0, 60, now);

        for window_secs in [100_000_000_000_000_000, u64::MAX] {
            let rule = ValidityRule::RateLimitedRange {
                min: -58.0,
                max: 122.0,
                max_delta: 27.0,
                window_secs,
            };
            assert!(rule.check(Value::Numeric(51.0), Some(&prev), None, now).is_ok());
            assert!(rule.check(Value::Numeric(90.0), Some(&prev), None, now).is_err());
        }
    }

    #[test]
    fn test_detector_uses_history() {
        let store = HistoryStore::new();
        let now = Utc::now();
        store.append("outside_air_temp", now - TimeDelta::seconds(60), Ok(Value::Numeric(2.0)));

        let detector = AnomalyDetector::new()
            .with_rule("outside_air_temp", ValidityRule::outdoor_air_temperature());

        assert!(
            detector
                .validate("outside_air_temp", Value::Numeric(30.0), &store, now)
                .is_err()
        );
        assert!(
            detector
                .validate("outside_air_temp", Value::Numeric(3.0), &store, now)
                .is_ok()
        );
        // No rule: always passes
        assert!(
            detector
                .validate("compressor_on", Value::Boolean(true), &store, now)
                .is_ok()
        );
    }

    #[test]
    fn test_detector_from_catalog() {
        use crate::catalog::{RegisterDefinition, WireType};

        let catalog = RegisterCatalog::from_definitions([
            RegisterDefinition::new("mix_water_temp", 1, WireType::Int16)
                .with_validation(ValidityRule::water_temperature()),
            RegisterDefinition::new("compressor_on", 2, WireType::Bool),
        ]);
        let detector = AnomalyDetector::from_catalog(&catalog);

        assert!(detector.rule("mix_water_temp").is_some());
        assert!(detector.rule("compressor_on").is_none());
    }
}
