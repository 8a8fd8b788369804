//! # Stumbler
//!
//! Reads stumbles from stdin, buffers them on disk and uploads completed
//! segments to a geosubmit collector.
//!
//! Each stdin line is one JSON object carrying a position fix and the scans
//! taken for it:
//!
//! ```text
//! {"position":{"latitude":1.0,"longitude":2.0},"cells":[...],"wifi":[...]}
//! ```
//!
//! A `null` or missing `cells`/`wifi` list means that scan failed.

use std::path::Path;

use anyhow::{Context, Result};
use chrono::Utc;
use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::time::{interval, Duration};
use tracing::{debug, info, warn};

use stumbler::aggregator::Aggregator;
use stumbler::config::Config;
use stumbler::geo::FixThrottle;
use stumbler::logging;
use stumbler::pipeline::{Pipeline, TickReport};
use stumbler::record::{CellObservation, Position, WifiScanResult};

/// Configuration file read when no path is given on the command line
const DEFAULT_CONFIG_PATH: &str = "config/default.toml";

/// Radio-network answers a stdin stumble carries
const RADIO_RESPONSES_PER_LINE: u32 = 1;

/// One stdin line
#[derive(Debug, Deserialize)]
struct StumbleInput {
    position: Position,
    #[serde(default)]
    cells: Option<Vec<CellObservation>>,
    #[serde(default)]
    wifi: Option<Vec<WifiScanResult>>,
}

/// Main entry point for the stumbler
///
/// # Control Flow
///
/// 1. **Initialization**
///    - Load configuration (first argument, else `config/default.toml`,
///      else built-in defaults)
///    - Set up logging
///    - Create the storage directory and the upload client
///
/// 2. **Main Loop**
///    - Feed every admitted stdin stumble through the aggregator
///    - Run an upload scheduler pass on every tick
///    - Handle Ctrl+C for graceful shutdown
///
/// Stdin reaching EOF stops ingest but keeps the scheduler running, so
/// completed segments still drain.
///
/// # Errors
///
/// Returns error if the configuration is invalid, logging cannot be
/// installed, or the storage directory cannot be created
///
/// # Examples
///
/// ```bash
/// stumbler config/default.toml < stumbles.jsonl
/// ```
#[tokio::main]
async fn main() -> Result<()> {
    let (config, config_source) = load_config()?;
    let _log_guard = logging::init(&config.logging)?;

    info!("Stumbler v{} starting...", env!("CARGO_PKG_VERSION"));
    info!("Configuration: {}", config_source);

    let pipeline = Pipeline::from_config(&config)
        .with_context(|| format!("failed to open storage at {}", config.storage.dir))?;
    let aggregator = pipeline.aggregator(&config.stumble.opt_out_suffix);
    let mut throttle = FixThrottle::from_config(&config.stumble);

    info!(
        "Storing segments in {} (cap {} bytes), uploading to {}",
        config.storage.dir, config.storage.max_segment_bytes, config.upload.endpoint
    );

    let mut ticker = interval(Duration::from_millis(config.upload.tick_interval_ms));
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;
    let mut admitted: u64 = 0;

    info!("Reading stumbles from stdin, press Ctrl+C to exit");

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let pipeline = pipeline.clone();
                tokio::spawn(async move {
                    match pipeline.tick().await {
                        Ok(TickReport::Uploaded { outcome, deleted }) => {
                            info!("Upload finished: {:?} (segment deleted: {})", outcome, deleted);
                        }
                        Ok(report) => debug!("Scheduler tick: {:?}", report),
                        Err(e) => warn!("Scheduler tick failed: {}", e),
                    }
                });
            }

            line = lines.next_line(), if stdin_open => {
                match line {
                    Ok(Some(line)) => {
                        if ingest(&aggregator, &mut throttle, &line) {
                            admitted += 1;
                        }
                    }
                    Ok(None) => {
                        info!("Stdin closed after {} stumbles, uploads continue", admitted);
                        stdin_open = false;
                    }
                    Err(e) => {
                        warn!("Failed to read stdin: {}", e);
                        stdin_open = false;
                    }
                }
            }

            // Handle Ctrl+C for graceful shutdown
            _ = tokio::signal::ctrl_c() => {
                info!("Received Ctrl+C, shutting down...");
                info!("Total stumbles admitted: {}", admitted);
                break;
            }
        }
    }

    Ok(())
}

fn load_config() -> Result<(Config, String)> {
    if let Some(path) = std::env::args().nth(1) {
        let config = Config::load(&path).with_context(|| format!("failed to load {}", path))?;
        return Ok((config, path));
    }

    if Path::new(DEFAULT_CONFIG_PATH).exists() {
        let config = Config::load(DEFAULT_CONFIG_PATH)
            .with_context(|| format!("failed to load {}", DEFAULT_CONFIG_PATH))?;
        return Ok((config, DEFAULT_CONFIG_PATH.to_string()));
    }

    Ok((Config::from_toml("")?, "built-in defaults".to_string()))
}

/// Parse one stdin line and feed it through the aggregator
///
/// # Returns
///
/// `true` if the line started a stumble
fn ingest(aggregator: &Aggregator, throttle: &mut FixThrottle, line: &str) -> bool {
    let line = line.trim();
    if line.is_empty() {
        return false;
    }

    let input: StumbleInput = match serde_json::from_str(line) {
        Ok(input) => input,
        Err(e) => {
            warn!("Ignoring malformed stumble line: {}", e);
            return false;
        }
    };

    if !throttle.admit(&input.position, Utc::now()) {
        return false;
    }

    let join = aggregator.begin_fix(input.position);
    join.set_radio_responses_expected(RADIO_RESPONSES_PER_LINE);

    match input.cells {
        Some(cells) => join.on_radio_scan_result(cells),
        None => join.on_radio_scan_failed(),
    }
    match input.wifi {
        Some(results) => join.on_wifi_scan_result(results),
        None => join.on_wifi_scan_failed(),
    }

    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};
    use stumbler::aggregator::RecordSink;
    use stumbler::record::Record;

    #[derive(Default)]
    struct Collect {
        records: Mutex<Vec<Record>>,
    }

    impl RecordSink for Collect {
        fn accept(&self, record: Record) {
            self.records.lock().unwrap().push(record);
        }
    }

    fn setup() -> (Arc<Collect>, Aggregator, FixThrottle) {
        let sink = Arc::new(Collect::default());
        let aggregator = Aggregator::new(sink.clone(), "_nomap");
        let throttle = FixThrottle::new(chrono::Duration::zero(), 0.0);
        (sink, aggregator, throttle)
    }

    #[test]
    fn test_constants() {
        assert_eq!(DEFAULT_CONFIG_PATH, "config/default.toml");
        assert_eq!(RADIO_RESPONSES_PER_LINE, 1);
    }

    #[test]
    fn test_ingest_full_line() {
        let (sink, aggregator, mut throttle) = setup();
        let line = r#"{"position":{"latitude":1.0,"longitude":2.0},
            "cells":[{"type":"gsm","registered":true,"mcc":310,"mnc":260,"lac":7,"cid":5,"asu":10}],
            "wifi":[{"bssid":"AA:BB:CC:DD:EE:FF","ssid":"home","signal_strength":-50}]}"#
            .replace('\n', "");

        assert!(ingest(&aggregator, &mut throttle, &line));

        let records = sink.records.lock().unwrap();
        assert_eq!(records.len(), 1);
        let json = records[0].to_json().unwrap();
        assert!(json.contains(r#""latitude":1.000000"#));
        assert!(json.contains(r#""locationAreaCode":7"#));
        assert!(json.contains(r#""macAddress":"AABBCCDDEEFF""#));
    }

    #[test]
    fn test_ingest_failed_scans() {
        let (sink, aggregator, mut throttle) = setup();
        assert!(ingest(
            &aggregator,
            &mut throttle,
            r#"{"position":{"latitude":1.0,"longitude":2.0},"cells":null}"#
        ));

        let records = sink.records.lock().unwrap();
        assert_eq!(records.len(), 1);
        assert!(records[0].cell_towers().is_empty());
        assert!(records[0].wifi_access_points().is_none());
    }

    #[test]
    fn test_ingest_ignores_malformed_and_blank() {
        let (sink, aggregator, mut throttle) = setup();
        assert!(!ingest(&aggregator, &mut throttle, "   "));
        assert!(!ingest(&aggregator, &mut throttle, "not json"));
        assert!(!ingest(&aggregator, &mut throttle, r#"{"cells":[]}"#));
        assert!(sink.records.lock().unwrap().is_empty());
    }

    #[test]
    fn test_ingest_respects_throttle() {
        let sink = Arc::new(Collect::default());
        let aggregator = Aggregator::new(sink.clone(), "_nomap");
        let mut throttle = FixThrottle::new(chrono::Duration::hours(1), 0.0);
        let line = r#"{"position":{"latitude":1.0,"longitude":2.0},"cells":[],"wifi":[]}"#;

        assert!(ingest(&aggregator, &mut throttle, line));
        assert!(!ingest(&aggregator, &mut throttle, line));
        assert_eq!(sink.records.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_fix_without_coordinates_not_admitted() {
        let (sink, aggregator, mut throttle) = setup();
        assert!(!ingest(
            &aggregator,
            &mut throttle,
            r#"{"position":{"accuracy":5.0},"cells":[],"wifi":[]}"#
        ));
        assert!(sink.records.lock().unwrap().is_empty());
    }
}
