//! Background Jobs for SENTINEL
//!
//! - `maintenance`: dead-letter sweeps and idempotency record cleanup
//!
//! # Usage
//!
//! ```ignore
//! use sentinel_api::jobs::{maintenance_task, MaintenanceConfig};
//! use tokio::sync::watch;
//!
//! let (shutdown_tx, shutdown_rx) = watch::channel(false);
//! tokio::spawn(maintenance_task(sweeper, coordinator, MaintenanceConfig::default(), shutdown_rx));
//!
//! // On shutdown
//! let _ = shutdown_tx.send(true);
//! ```

pub mod maintenance;

pub use maintenance::{maintenance_task, MaintenanceConfig, MaintenanceMetrics, MaintenanceSnapshot};
