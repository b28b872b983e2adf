//! Modbus TCP telemetry and history engine for a DX2W hydronic heat pump.
//!
//! The engine polls named registers in independent groups, filters
//! implausible readings, keeps a rolling 24 hour history and snapshots it to
//! disk.
//!
//! ```text
//! GroupScheduler → ConnectionManager → codec::decode → AnomalyDetector → HistoryStore
//!                                                                          ↕
//!                                                                  SnapshotPersister
//! ```
//!
//! Writes go the other way: `Dx2wClient::write_value` → `codec::encode` →
//! `ConnectionManager`.

pub mod anomaly;
pub mod catalog;
pub mod client;
pub mod codec;
pub mod config;
pub mod connection;
pub mod error;
pub mod history;
pub mod scheduler;
pub mod service;
pub mod snapshot;

pub use anomaly::{AnomalyDetector, ValidityRule};
pub use catalog::{RegisterCatalog, RegisterDefinition, WireType};
pub use client::{Dx2wClient, RegisterReader};
pub use config::Dx2wBridgeConfig;
pub use connection::{
    BackoffPolicy, ConnectionManager, ConnectionOptions, Connector, ModbusSession, TcpConnector,
};
pub use error::{Dx2wError, Result};
pub use history::{HistoryMap, HistoryStore};
pub use scheduler::GroupScheduler;
pub use service::{HistoryService, RegisterStatus};
pub use snapshot::SnapshotPersister;
