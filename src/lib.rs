//! # Stumbler Library
//!
//! Buffer geolocation stumbles to local storage and upload them in batches.
//!
//! A position fix is joined with the radio-network and Wi-Fi scans taken for
//! it, rendered as one JSON record, and appended to a size-capped segment
//! file. Full segments rotate into a single completed slot that a rate-limited
//! scheduler drains to a remote collector.

pub mod aggregator;
pub mod config;
pub mod error;
pub mod geo;
pub mod guard;
pub mod logging;
pub mod pipeline;
pub mod record;
pub mod segment;
pub mod upload;
