//! # Record Module
//!
//! Measurement inputs and the rendered stumble record.
//!
//! This module handles:
//! - Position fixes with NaN-for-unknown fields
//! - Cell observations tagged by radio technology
//! - Wi-Fi scan results and opt-out filtering
//! - Rendering one immutable JSON record per fix

pub mod observation;
pub mod render;

pub use observation::{CellObservation, Position, WifiScanResult};
pub use render::{CellTower, RadioType, Record, WifiAccessPoint};
