//! Query and control facade used by external collaborators.
//!
//! Reads come from the history store; writes go straight to the device and
//! do not touch history until the caller asks for a [`refresh`].
//!
//! [`refresh`]: HistoryService::refresh

use chrono::{DateTime, Utc};
use hydrobridge_common::{HistoryEntry, Value};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::anomaly::AnomalyDetector;
use crate::client::Dx2wClient;
use crate::connection::Connector;
use crate::error::{Dx2wError, Result};
use crate::history::HistoryStore;

/// Register names used by the setpoint helpers.
pub mod registers {
    pub const OUTSIDE_AIR_TEMP: &str = "outside_air_temp";
    pub const OUTDOOR_AIR_DESIGN_TEMP: &str = "outdoor_air_design_temp";
    pub const HOT_WATER_DESIGN_TEMP: &str = "hot_water_design_temp";
    pub const HOT_WATER_MIN_TEMP: &str = "hot_water_min_temp";
    pub const HOT_WATER_DIFFERENTIAL: &str = "hot_water_differential";
}

/// Delay before the confirming read in [`HistoryService::write_and_refresh`].
pub const POST_WRITE_SETTLE: Duration = Duration::from_millis(300);

/// Latest state of one catalog register.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RegisterStatus {
    pub id: String,
    pub description: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub writable: bool,
}

pub struct HistoryService<C: Connector> {
    client: Dx2wClient<C>,
    store: Arc<HistoryStore>,
    detector: Arc<AnomalyDetector>,
}

impl<C: Connector> Clone for HistoryService<C> {
    fn clone(&self) -> Self {
        Self {
            client: self.client.clone(),
            store: self.store.clone(),
            detector: self.detector.clone(),
        }
    }
}

impl<C: Connector> HistoryService<C> {
    pub fn new(
        client: Dx2wClient<C>,
        store: Arc<HistoryStore>,
        detector: Arc<AnomalyDetector>,
    ) -> Self {
        Self {
            client,
            store,
            detector,
        }
    }

    pub fn client(&self) -> &Dx2wClient<C> {
        &self.client
    }

    pub fn store(&self) -> &Arc<HistoryStore> {
        &self.store
    }

    pub fn list_all(&self, name: &str) -> Vec<HistoryEntry> {
        self.store.list_all(name)
    }

    pub fn latest_all(&self) -> BTreeMap<String, HistoryEntry> {
        self.store.latest_all()
    }

    pub fn mean(&self, name: &str, interval: Duration) -> Result<f64> {
        self.store.mean(name, interval)
    }

    pub fn median(&self, name: &str, interval: Duration) -> Result<f64> {
        self.store.median(name, interval)
    }

    pub fn percent_on(&self, name: &str, interval: Duration) -> Result<f64> {
        self.store.percent_on(name, interval)
    }

    /// Latest state of every catalog register, keyed by name.
    pub fn values(&self) -> BTreeMap<String, RegisterStatus> {
        let mut latest = self.store.latest_all();
        self.client
            .catalog()
            .iter()
            .map(|def| {
                let entry = latest.remove(&def.name);
                let status = RegisterStatus {
                    id: def.name.clone(),
                    description: def.description.clone(),
                    value: entry.as_ref().and_then(|e| e.value),
                    timestamp: entry.as_ref().map(|e| e.timestamp),
                    error: entry.and_then(|e| e.error),
                    writable: def.writable,
                };
                (def.name.clone(), status)
            })
            .collect()
    }

    /// Write a value. History is not updated.
    pub async fn write_value(&self, name: &str, value: Value) -> Result<()> {
        self.client.write_value(name, value).await
    }

    /// Read a register now and record the result like a poll would.
    ///
    /// Fails only for an unknown register; read and validation failures end
    /// up in the returned entry's `error`.
    pub async fn refresh(&self, name: &str) -> Result<HistoryEntry> {
        self.client.catalog().get(name)?;

        let reading = self.client.read_value(name).await;
        let now = Utc::now();
        let reading = reading.and_then(|value| {
            self.detector
                .validate(name, value, &self.store, now)
                .map(|()| value)
        });

        if let Err(e) = &reading {
            warn!(register = %name, error = %e, "Refresh failed");
        }
        Ok(self.store.append(name, now, reading))
    }

    /// Write a value, wait for the device to settle, then refresh.
    pub async fn write_and_refresh(&self, name: &str, value: Value) -> Result<HistoryEntry> {
        self.write_value(name, value).await?;
        tokio::time::sleep(POST_WRITE_SETTLE).await;
        self.refresh(name).await
    }

    pub async fn set_outdoor_air_design_temp_c(&self, celsius: f64) -> Result<()> {
        self.write_celsius(registers::OUTDOOR_AIR_DESIGN_TEMP, celsius)
            .await
    }

    /// Hot-water design temperature, 20-50 °C.
    pub async fn set_hot_water_design_temp_c(&self, celsius: f64) -> Result<()> {
        check_setpoint(registers::HOT_WATER_DESIGN_TEMP, celsius, 20.0, 50.0)?;
        self.write_celsius(registers::HOT_WATER_DESIGN_TEMP, celsius)
            .await
    }

    /// Hot-water minimum temperature, 20-50 °C.
    pub async fn set_hot_water_min_temp_c(&self, celsius: f64) -> Result<()> {
        check_setpoint(registers::HOT_WATER_MIN_TEMP, celsius, 20.0, 50.0)?;
        self.write_celsius(registers::HOT_WATER_MIN_TEMP, celsius)
            .await
    }

    /// Hot-water differential, 1-20 °C. Written as a Fahrenheit difference.
    pub async fn set_hot_water_differential_c(&self, celsius: f64) -> Result<()> {
        check_setpoint(registers::HOT_WATER_DIFFERENTIAL, celsius, 1.0, 20.0)?;
        let delta_f = celsius * 9.0 / 5.0;
        info!("Setting {} to {:.1} °C ({:.1} °F delta)", registers::HOT_WATER_DIFFERENTIAL, celsius, delta_f);
        self.client
            .write_value(registers::HOT_WATER_DIFFERENTIAL, Value::Numeric(delta_f))
            .await
    }

    /// Median outdoor air temperature over `interval`, in °C.
    pub fn median_outdoor_air_temp_c(&self, interval: Duration) -> Result<f64> {
        self.store
            .median(registers::OUTSIDE_AIR_TEMP, interval)
            .map(f_to_c)
    }

    async fn write_celsius(&self, name: &str, celsius: f64) -> Result<()> {
        let fahrenheit = c_to_f(celsius);
        info!("Setting {} to {:.1} °C ({:.1} °F)", name, celsius, fahrenheit);
        self.client
            .write_value(name, Value::Numeric(fahrenheit))
            .await
    }
}

fn check_setpoint(name: &str, celsius: f64, min: f64, max: f64) -> Result<()> {
    if !(min..=max).contains(&celsius) {
        return Err(Dx2wError::Range {
            register: name.to_string(),
            wire_type: "setpoint",
            value: celsius,
        });
    }
    Ok(())
}

pub fn c_to_f(celsius: f64) -> f64 {
    celsius * 9.0 / 5.0 + 32.0
}

pub fn f_to_c(fahrenheit: f64) -> f64 {
    (fahrenheit - 32.0) * 5.0 / 9.0
}
