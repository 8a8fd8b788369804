//! # Record Aggregator
//!
//! Joins the radio-network and Wi-Fi scans taken for one position fix.
//!
//! Both scans are requested concurrently and answer through callbacks that
//! may arrive in either order, on any thread, and either may fail outright.
//! Each fix gets its own [`FixJoin`] barrier. The barrier completes once the
//! Wi-Fi answer (result or failure) is in and the number of radio-network
//! answers equals the expected count; at that point exactly one record is
//! rendered and handed to the [`RecordSink`].

use std::sync::{Arc, Mutex, PoisonError};

use chrono::Utc;
use tracing::{debug, warn};

use crate::record::{CellObservation, Position, Record, WifiScanResult};

/// Destination for rendered records
pub trait RecordSink: Send + Sync {
    /// Take ownership of one rendered record
    fn accept(&self, record: Record);
}

/// Starts one join per position fix
#[derive(Clone)]
pub struct Aggregator {
    sink: Arc<dyn RecordSink>,
    opt_out_suffix: Arc<str>,
}

impl Aggregator {
    /// Create an aggregator
    ///
    /// # Arguments
    ///
    /// * `sink` - Receives every completed record
    /// * `opt_out_suffix` - SSID suffix that excludes an access point
    pub fn new(sink: Arc<dyn RecordSink>, opt_out_suffix: &str) -> Self {
        Self {
            sink,
            opt_out_suffix: Arc::from(opt_out_suffix),
        }
    }

    /// Start joining the scans for a new position fix
    ///
    /// The returned handle is what the scan sources call back into. The join
    /// cannot complete until [`FixJoin::set_radio_responses_expected`] has
    /// been called.
    pub fn begin_fix(&self, position: Position) -> Arc<FixJoin> {
        debug!(
            latitude = position.latitude,
            longitude = position.longitude,
            "Beginning stumble for position fix"
        );
        Arc::new(FixJoin {
            position,
            opt_out_suffix: Arc::clone(&self.opt_out_suffix),
            sink: Arc::clone(&self.sink),
            barrier: Mutex::new(JoinBarrier::default()),
        })
    }
}

/// Wi-Fi side of the barrier
#[derive(Debug, Default)]
enum WifiArrival {
    #[default]
    Pending,
    Received(Vec<WifiScanResult>),
    Failed,
}

#[derive(Debug, Default)]
struct JoinBarrier {
    expected: Option<u32>,
    received: u32,
    cells: Vec<CellObservation>,
    wifi: WifiArrival,
    finished: bool,
}

impl JoinBarrier {
    fn is_complete(&self) -> bool {
        !self.finished
            && !matches!(self.wifi, WifiArrival::Pending)
            && self.expected == Some(self.received)
    }

    /// Close the barrier and hand out its contents if every input is in
    fn take_if_complete(&mut self) -> Option<(Vec<CellObservation>, Option<Vec<WifiScanResult>>)> {
        if !self.is_complete() {
            return None;
        }
        self.finished = true;
        let wifi = match std::mem::take(&mut self.wifi) {
            WifiArrival::Received(results) => Some(results),
            _ => None,
        };
        Some((std::mem::take(&mut self.cells), wifi))
    }
}

/// Join state for one position fix
pub struct FixJoin {
    position: Position,
    opt_out_suffix: Arc<str>,
    sink: Arc<dyn RecordSink>,
    barrier: Mutex<JoinBarrier>,
}

impl std::fmt::Debug for FixJoin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FixJoin")
            .field("position", &self.position)
            .field("barrier", &self.barrier)
            .finish_non_exhaustive()
    }
}

impl FixJoin {
    /// Set how many radio-network answers this fix waits for
    ///
    /// Answers that arrived before this call still count.
    pub fn set_radio_responses_expected(&self, count: u32) {
        self.update(|barrier| {
            debug!(count, received = barrier.received, "Radio responses expected");
            barrier.expected = Some(count);
        });
    }

    pub fn on_radio_scan_result(&self, cells: Vec<CellObservation>) {
        self.update(|barrier| {
            debug!(count = cells.len(), "Radio scan result");
            barrier.cells.extend(cells);
            barrier.received += 1;
        });
    }

    pub fn on_radio_scan_failed(&self) {
        self.update(|barrier| {
            warn!(received = barrier.received, "Radio scan failed");
            barrier.received += 1;
        });
    }

    pub fn on_wifi_scan_result(&self, results: Vec<WifiScanResult>) {
        self.update(|barrier| {
            if !matches!(barrier.wifi, WifiArrival::Pending) {
                debug!("Ignoring duplicate Wi-Fi answer");
                return;
            }
            debug!(count = results.len(), "Wi-Fi scan result");
            barrier.wifi = WifiArrival::Received(results);
        });
    }

    pub fn on_wifi_scan_failed(&self) {
        self.update(|barrier| {
            if !matches!(barrier.wifi, WifiArrival::Pending) {
                debug!("Ignoring duplicate Wi-Fi answer");
                return;
            }
            warn!("Wi-Fi scan failed");
            barrier.wifi = WifiArrival::Failed;
        });
    }

    /// Whether the join has completed (rendered or discarded)
    pub fn is_finished(&self) -> bool {
        self.barrier
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .finished
    }

    /// Apply one input and complete the join if it was the last one missing
    fn update(&self, apply: impl FnOnce(&mut JoinBarrier)) {
        let ready = {
            let mut barrier = self.barrier.lock().unwrap_or_else(PoisonError::into_inner);
            if barrier.finished {
                debug!("Ignoring scan answer for a completed stumble");
                return;
            }
            apply(&mut barrier);
            barrier.take_if_complete()
        };

        // Render outside the lock; the barrier is already closed
        if let Some((cells, wifi)) = ready {
            self.complete(&cells, wifi.as_deref());
        }
    }

    fn complete(&self, cells: &[CellObservation], wifi: Option<&[WifiScanResult]>) {
        let now_ms = Utc::now().timestamp_millis();
        match Record::render(&self.position, cells, wifi, &self.opt_out_suffix, now_ms) {
            Ok(record) => {
                debug!(
                    latitude = record.latitude(),
                    longitude = record.longitude(),
                    timestamp = record.timestamp(),
                    cells = record.cell_towers().len(),
                    access_points = record.wifi_access_points().map_or(0, |aps| aps.len()),
                    "Stumble record rendered"
                );
                self.sink.accept(record);
            }
            Err(e) => {
                warn!("Dropping stumble: {}", e);
            }
        }
    }
}


#[cfg(test)]
mod tests {
    use super::mocks::CollectingSink;
    use super::*;

    fn setup() -> (Arc<CollectingSink>, Aggregator) {
        let sink = CollectingSink::new();
        let aggregator = Aggregator::new(sink.clone(), "_nomap");
        (sink, aggregator)
    }

    fn gsm() -> CellObservation {
        CellObservation::Gsm {
            registered: true,
            mcc: Some(310),
            mnc: Some(260),
            lac: Some(7),
            cid: Some(5),
            asu: Some(10),
        }
    }

    fn ap() -> WifiScanResult {
        WifiScanResult::new("AA:BB:CC:DD:EE:FF", "home", -50)
    }

    #[test]
    fn test_radio_then_wifi() {
        let (sink, aggregator) = setup();
        let join = aggregator.begin_fix(Position::new(1.0, 2.0));
        join.set_radio_responses_expected(1);

        join.on_radio_scan_result(vec![gsm()]);
        assert_eq!(sink.count(), 0, "must wait for Wi-Fi");

        join.on_wifi_scan_result(vec![ap()]);
        assert_eq!(sink.count(), 1);
        assert!(join.is_finished());

        let record = sink.first();
        assert_eq!(record.cell_towers().len(), 1);
        assert_eq!(record.wifi_access_points().unwrap().len(), 1);
    }

    #[test]
    fn test_wifi_then_radio() {
        let (sink, aggregator) = setup();
        let join = aggregator.begin_fix(Position::new(1.0, 2.0));
        join.set_radio_responses_expected(1);

        join.on_wifi_scan_result(vec![ap()]);
        assert_eq!(sink.count(), 0, "must wait for the radio answer");

        join.on_radio_scan_result(vec![gsm()]);
        assert_eq!(sink.count(), 1);
        assert_eq!(sink.first().cell_towers().len(), 1);
    }

    #[test]
    fn test_radio_failed_then_wifi() {
        let (sink, aggregator) = setup();
        let join = aggregator.begin_fix(Position::new(1.0, 2.0));
        join.set_radio_responses_expected(1);

        join.on_radio_scan_failed();
        join.on_wifi_scan_result(vec![ap()]);

        assert_eq!(sink.count(), 1);
        assert!(sink.first().cell_towers().is_empty());
    }

    #[test]
    fn test_wifi_failed_then_radio() {
        let (sink, aggregator) = setup();
        let join = aggregator.begin_fix(Position::new(1.0, 2.0));
        join.set_radio_responses_expected(1);

        join.on_wifi_scan_failed();
        join.on_radio_scan_result(vec![gsm()]);

        assert_eq!(sink.count(), 1);
        assert!(sink.first().wifi_access_points().is_none());
    }

    #[test]
    fn test_both_failed_in_either_order() {
        let (sink, aggregator) = setup();

        let first = aggregator.begin_fix(Position::new(1.0, 2.0));
        first.set_radio_responses_expected(1);
        first.on_radio_scan_failed();
        first.on_wifi_scan_failed();

        let second = aggregator.begin_fix(Position::new(3.0, 4.0));
        second.set_radio_responses_expected(1);
        second.on_wifi_scan_failed();
        second.on_radio_scan_failed();

        assert_eq!(sink.count(), 2);
    }

    #[test]
    fn test_multiple_radio_responses() {
        let (sink, aggregator) = setup();
        let join = aggregator.begin_fix(Position::new(1.0, 2.0));
        join.set_radio_responses_expected(2);

        join.on_radio_scan_result(vec![gsm()]);
        join.on_wifi_scan_result(vec![]);
        assert_eq!(sink.count(), 0, "one radio answer still missing");

        join.on_radio_scan_result(vec![gsm(), gsm()]);
        assert_eq!(sink.count(), 1);
        assert_eq!(sink.first().cell_towers().len(), 3);
    }

    #[test]
    fn test_expected_count_set_after_answers() {
        let (sink, aggregator) = setup();
        let join = aggregator.begin_fix(Position::new(1.0, 2.0));

        join.on_radio_scan_result(vec![gsm()]);
        join.on_wifi_scan_result(vec![ap()]);
        assert_eq!(sink.count(), 0, "expectation not set yet");

        join.set_radio_responses_expected(1);
        assert_eq!(sink.count(), 1);
    }

    #[test]
    fn test_zero_radio_interfaces() {
        let (sink, aggregator) = setup();
        let join = aggregator.begin_fix(Position::new(1.0, 2.0));
        join.set_radio_responses_expected(0);
        assert_eq!(sink.count(), 0);

        join.on_wifi_scan_result(vec![ap()]);
        assert_eq!(sink.count(), 1);
    }

    #[test]
    fn test_late_callbacks_ignored() {
        let (sink, aggregator) = setup();
        let join = aggregator.begin_fix(Position::new(1.0, 2.0));
        join.set_radio_responses_expected(1);
        join.on_radio_scan_result(vec![gsm()]);
        join.on_wifi_scan_result(vec![ap()]);

        join.on_wifi_scan_failed();
        join.on_radio_scan_result(vec![gsm()]);
        join.set_radio_responses_expected(2);

        assert_eq!(sink.count(), 1);
    }

    #[test]
    fn test_duplicate_wifi_answer_keeps_first() {
        let (sink, aggregator) = setup();
        let join = aggregator.begin_fix(Position::new(1.0, 2.0));
        join.set_radio_responses_expected(1);

        join.on_wifi_scan_result(vec![ap()]);
        join.on_wifi_scan_failed();
        join.on_radio_scan_result(vec![]);

        assert_eq!(sink.first().wifi_access_points().unwrap().len(), 1);
    }

    #[test]
    fn test_unusable_position_renders_nothing() {
        let (sink, aggregator) = setup();
        let mut position = Position::new(1.0, 2.0);
        position.longitude = f64::NAN;

        let join = aggregator.begin_fix(position);
        join.set_radio_responses_expected(1);
        join.on_radio_scan_result(vec![gsm()]);
        join.on_wifi_scan_result(vec![ap()]);

        assert_eq!(sink.count(), 0);
        assert!(join.is_finished(), "join state is discarded");
    }

    #[test]
    fn test_opt_out_filtered_through_join() {
        let (sink, aggregator) = setup();
        let join = aggregator.begin_fix(Position::new(1.0, 2.0));
        join.set_radio_responses_expected(0);
        join.on_wifi_scan_result(vec![
            WifiScanResult::new("00:00:00:00:00:01", "office_nomap", -40),
            ap(),
        ]);

        let json = sink.first().to_json().unwrap();
        assert!(!json.contains("000000000001"));
        assert!(json.contains("AABBCCDDEEFF"));
    }

    #[test]
    fn test_concurrent_callbacks_render_once() {
        for _ in 0..50 {
            let (sink, aggregator) = setup();
            let join = aggregator.begin_fix(Position::new(1.0, 2.0));
            join.set_radio_responses_expected(4);

            let mut handles = Vec::new();
            for _ in 0..4 {
                let join = Arc::clone(&join);
                handles.push(std::thread::spawn(move || join.on_radio_scan_result(vec![gsm()])));
            }
            let wifi_join = Arc::clone(&join);
            handles.push(std::thread::spawn(move || wifi_join.on_wifi_scan_result(vec![ap()])));

            for handle in handles {
                handle.join().unwrap();
            }

            assert_eq!(sink.count(), 1);
            assert_eq!(sink.first().cell_towers().len(), 4);
        }
    }
}
