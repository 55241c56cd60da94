//! EMG sensor connectivity and daily health metrics.
//!
//! The BLE side scans for the sensor, connects, selects its stream
//! characteristic and keeps a short window of decoded samples
//! ([`sensor::DeviceManager`], driven by [`connection::ConnectionManager`]).
//! The health side queries a host health-data service through ordered fallback
//! tiers and publishes timestamped snapshots ([`health::HealthAggregator`]).

pub mod app;
pub mod btle;
pub mod config;
pub mod connection;
pub mod decoder;
pub mod device_scanner;
pub mod error;
pub mod gatt;
pub mod health;
pub mod health_fetchers;
pub mod health_store;
pub mod sensor;
pub mod timeseries;
pub mod transport;
