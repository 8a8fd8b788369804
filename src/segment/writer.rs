//! # Segment Writer
//!
//! Appends records to the open segment and rotates it when full.
//!
//! The writer keeps no state about the open segment besides its paths: every
//! call re-derives the write position from the file size on disk, so a failed
//! call leaves nothing stale behind for the next one.

use std::fs::{self, OpenOptions};
use std::io::{self, Write};

use tracing::{debug, info, warn};

use super::{is_complete_envelope, SegmentLayout, ENVELOPE_PREFIX, ENVELOPE_SUFFIX, ITEM_SEPARATOR};
use crate::error::{Result, StumblerError};
use crate::record::Record;

/// Segments that can exist at once: the open one and the completed one
const RETAINED_SEGMENTS: usize = 2;

/// While rotation is deferred the open segment may grow to this many caps
const OVERFLOW_FACTOR: u64 = 4;

/// Where the next item goes, derived from the open segment's size
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WritePosition {
    /// Empty or missing segment; the item opens the envelope
    First,
    /// Item follows a separator
    Middle,
    /// Segment is at or over the cap and must be closed first
    Closing,
}

/// Result of trying to close the open segment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseOutcome {
    /// Envelope verified and renamed into the completed slot
    Rotated,
    /// Completed slot is occupied; the segment stays open
    Deferred,
    /// Envelope failed verification; segment moved to quarantine
    Quarantined,
    /// No open segment, or an empty one
    NothingToClose,
}

/// What a successful append did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AppendReport {
    /// Position the record was written at (`First` or `Middle`)
    pub position: WritePosition,
    /// Size of the open segment right after the write
    pub segment_bytes: u64,
    /// Close attempted because the write reached the cap
    pub close: Option<CloseOutcome>,
}

/// Owner of the open segment
#[derive(Debug)]
pub struct SegmentWriter {
    layout: SegmentLayout,
    max_segment_bytes: u64,
}

impl SegmentWriter {
    /// Create a writer
    ///
    /// # Arguments
    ///
    /// * `layout` - Storage directory layout
    /// * `max_segment_bytes` - Size at which a segment is closed
    pub fn new(layout: SegmentLayout, max_segment_bytes: u64) -> Self {
        Self {
            layout,
            max_segment_bytes,
        }
    }

    pub fn layout(&self) -> &SegmentLayout {
        &self.layout
    }

    /// Derive the write position from the open segment's size
    pub fn write_position(&self) -> Result<WritePosition> {
        let size = self.open_size()?;
        Ok(if size == 0 {
            WritePosition::First
        } else if size >= self.max_segment_bytes {
            WritePosition::Closing
        } else {
            WritePosition::Middle
        })
    }

    /// Append one record to the open segment
    ///
    /// Closes and rotates a segment left over cap by an earlier call before
    /// writing, and closes the segment right after writing if the record
    /// pushed it to the cap.
    ///
    /// # Errors
    ///
    /// Returns error if:
    /// - The record cannot be serialized
    /// - Opening, writing or syncing the segment fails
    /// - The completed slot is occupied and the open segment reached its
    ///   overflow ceiling (`Backpressure`); the record is not written
    pub fn append(&mut self, record: &Record) -> Result<AppendReport> {
        let item = record.to_json()?;
        let position = self.resolve_position()?;

        let mut bytes = Vec::with_capacity(ENVELOPE_PREFIX.len() + item.len());
        match position {
            WritePosition::First => bytes.extend_from_slice(ENVELOPE_PREFIX),
            WritePosition::Middle => bytes.extend_from_slice(ITEM_SEPARATOR),
            WritePosition::Closing => {
                return Err(StumblerError::Backpressure(
                    "open segment is still full".to_string(),
                ))
            }
        }
        bytes.extend_from_slice(item.as_bytes());

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.layout.in_progress())?;
        file.write_all(&bytes)?;
        file.sync_data()?;
        let segment_bytes = file.metadata()?.len();
        drop(file);

        debug!(?position, segment_bytes, "Appended stumble record");

        let close = if segment_bytes >= self.max_segment_bytes {
            match self.close_and_rotate() {
                Ok(outcome) => Some(outcome),
                Err(e) => {
                    warn!("Failed to close full segment: {}", e);
                    None
                }
            }
        } else {
            None
        };

        Ok(AppendReport {
            position,
            segment_bytes,
            close,
        })
    }

    /// Close the open segment and move it into the completed slot
    ///
    /// Writes the envelope suffix unless the segment already carries one,
    /// then re-reads the file and verifies it parses as a complete envelope.
    /// A segment that fails verification is quarantined and never appended
    /// to again.
    pub fn close_and_rotate(&self) -> Result<CloseOutcome> {
        let open = self.layout.in_progress();
        let completed = self.layout.completed();

        if completed.try_exists()? {
            return Ok(CloseOutcome::Deferred);
        }

        let contents = match fs::read(&open) {
            Ok(contents) => contents,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(CloseOutcome::NothingToClose),
            Err(e) => return Err(e.into()),
        };
        if contents.is_empty() {
            return Ok(CloseOutcome::NothingToClose);
        }

        // A segment closed by an earlier call whose rename failed is reused as is
        if !is_complete_envelope(&contents) {
            if !contents.starts_with(ENVELOPE_PREFIX) {
                return self.quarantine("missing envelope prefix");
            }

            let mut file = OpenOptions::new().append(true).open(&open)?;
            file.write_all(ENVELOPE_SUFFIX)?;
            file.sync_data()?;
            drop(file);

            let closed = fs::read(&open)?;
            if !is_complete_envelope(&closed) {
                return self.quarantine("envelope does not verify after close");
            }
        }

        fs::rename(&open, &completed)?;
        info!(path = %completed.display(), "Segment closed and queued for upload");
        Ok(CloseOutcome::Rotated)
    }

    /// Pick the position for the next item, rotating a full segment first
    fn resolve_position(&self) -> Result<WritePosition> {
        for _ in 0..RETAINED_SEGMENTS {
            match self.write_position()? {
                WritePosition::Closing => match self.close_and_rotate()? {
                    CloseOutcome::Rotated
                    | CloseOutcome::Quarantined
                    | CloseOutcome::NothingToClose => continue,
                    CloseOutcome::Deferred => return self.overflow_position(),
                },
                position => return Ok(position),
            }
        }

        Err(StumblerError::Backpressure(
            "open segment still full after rotation".to_string(),
        ))
    }

    /// Position for an item while the completed slot is occupied
    ///
    /// The suffix is only ever written when the slot is free, so a deferred
    /// segment is still open and can take more items.
    fn overflow_position(&self) -> Result<WritePosition> {
        let size = self.open_size()?;
        let ceiling = self.max_segment_bytes.saturating_mul(OVERFLOW_FACTOR);
        if size >= ceiling {
            return Err(StumblerError::Backpressure(format!(
                "completed segment not drained and open segment at {} bytes",
                size
            )));
        }
        debug!(size, "Completed slot occupied, deferring rotation");
        Ok(WritePosition::Middle)
    }

    fn quarantine(&self, reason: &str) -> Result<CloseOutcome> {
        let quarantine = self.layout.quarantine();
        fs::rename(self.layout.in_progress(), &quarantine)?;
        warn!(reason, path = %quarantine.display(), "Quarantined malformed segment");
        Ok(CloseOutcome::Quarantined)
    }

    fn open_size(&self) -> Result<u64> {
        match fs::metadata(self.layout.in_progress()) {
            Ok(metadata) => Ok(metadata.len()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(0),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{CellObservation, Position};
    use tempfile::TempDir;

    const CAP: u64 = 1024;

    fn setup() -> (TempDir, SegmentWriter) {
        let dir = tempfile::tempdir().unwrap();
        let writer = SegmentWriter::new(SegmentLayout::new(dir.path()), CAP);
        (dir, writer)
    }

    fn record(n: u32) -> Record {
        let cells = [CellObservation::Gsm {
            registered: true,
            mcc: Some(310),
            mnc: Some(260),
            lac: Some(7),
            cid: Some(n as i32),
            asu: Some(10),
        }];
        Record::render(&Position::new(1.0, f64::from(n)), &cells, None, "_nomap", 1_700_000_000_000).unwrap()
    }

    fn items_in(bytes: &[u8]) -> usize {
        let value: serde_json::Value = serde_json::from_slice(bytes).unwrap();
        value["items"].as_array().unwrap().len()
    }

    #[test]
    fn test_first_append_opens_envelope() {
        let (_dir, mut writer) = setup();
        assert_eq!(writer.write_position().unwrap(), WritePosition::First);

        let report = writer.append(&record(1)).unwrap();
        assert_eq!(report.position, WritePosition::First);
        assert_eq!(report.close, None);

        let contents = fs::read(writer.layout().in_progress()).unwrap();
        let expected = format!("{{\"items\":[{}", record(1).to_json().unwrap());
        assert_eq!(contents, expected.as_bytes());
        assert_eq!(report.segment_bytes, contents.len() as u64);
    }

    #[test]
    fn test_second_append_uses_separator() {
        let (_dir, mut writer) = setup();
        writer.append(&record(1)).unwrap();
        assert_eq!(writer.write_position().unwrap(), WritePosition::Middle);

        let report = writer.append(&record(2)).unwrap();
        assert_eq!(report.position, WritePosition::Middle);

        let contents = String::from_utf8(fs::read(writer.layout().in_progress()).unwrap()).unwrap();
        assert!(contents.contains(&format!("}},{}", record(2).to_json().unwrap())));
        assert!(!contents.ends_with(','));
    }

    #[test]
    fn test_segment_below_cap_stays_open_and_finalizes() {
        let (_dir, mut writer) = setup();
        writer.append(&record(1)).unwrap();
        writer.append(&record(2)).unwrap();

        assert!(!writer.layout().completed().exists());
        let open = fs::read(writer.layout().in_progress()).unwrap();
        assert!(!is_complete_envelope(&open));

        assert_eq!(writer.close_and_rotate().unwrap(), CloseOutcome::Rotated);
        let completed = fs::read(writer.layout().completed()).unwrap();
        assert_eq!(items_in(&completed), 2);
    }

    #[test]
    fn test_reaching_cap_rotates_immediately() {
        let (_dir, mut writer) = setup();
        let mut appended = 0;
        loop {
            appended += 1;
            let report = writer.append(&record(appended)).unwrap();
            if report.segment_bytes >= CAP {
                assert_eq!(report.close, Some(CloseOutcome::Rotated));
                break;
            }
            assert_eq!(report.close, None);
        }

        assert!(!writer.layout().in_progress().exists());
        let completed = fs::read(writer.layout().completed()).unwrap();
        assert!(is_complete_envelope(&completed));
        assert_eq!(items_in(&completed), appended as usize);

        // Later appends go to a fresh segment and leave the completed one alone
        let report = writer.append(&record(99)).unwrap();
        assert_eq!(report.position, WritePosition::First);
        assert_eq!(fs::read(writer.layout().completed()).unwrap(), completed);
    }

    #[test]
    fn test_occupied_slot_defers_rotation() {
        let (_dir, mut writer) = setup();
        fs::write(writer.layout().completed(), br#"{"items":[{"old":1}]}"#).unwrap();

        // Fill to the cap; the close is deferred and the segment stays open
        let mut appended = 0;
        let last = loop {
            let report = writer.append(&record(appended)).unwrap();
            appended += 1;
            if report.segment_bytes >= CAP {
                break report;
            }
        };
        assert_eq!(last.close, Some(CloseOutcome::Deferred));

        let report = writer.append(&record(appended)).unwrap();
        appended += 1;
        assert_eq!(report.position, WritePosition::Middle);
        assert!(report.segment_bytes > CAP, "open segment grows past the cap");
        assert_eq!(
            fs::read(writer.layout().completed()).unwrap(),
            br#"{"items":[{"old":1}]}"#.to_vec()
        );

        // Once drained, the next append rotates the overfull segment first
        fs::remove_file(writer.layout().completed()).unwrap();
        let report = writer.append(&record(100)).unwrap();
        assert_eq!(report.position, WritePosition::First);

        let completed = fs::read(writer.layout().completed()).unwrap();
        assert_eq!(items_in(&completed), appended as usize);
        let open = String::from_utf8(fs::read(writer.layout().in_progress()).unwrap()).unwrap();
        assert_eq!(open, format!("{{\"items\":[{}", record(100).to_json().unwrap()));
    }

    #[test]
    fn test_overflow_ceiling_drops_records() {
        let (_dir, mut writer) = setup();
        fs::write(writer.layout().completed(), br#"{"items":[]}"#).unwrap();

        let mut rejected = None;
        for n in 0..100 {
            match writer.append(&record(n)) {
                Ok(_) => {}
                Err(e) => {
                    rejected = Some(e);
                    break;
                }
            }
        }

        match rejected {
            Some(StumblerError::Backpressure(_)) => {}
            other => panic!("Expected Backpressure, got: {:?}", other),
        }
        let size = fs::metadata(writer.layout().in_progress()).unwrap().len();
        assert!(size >= CAP * OVERFLOW_FACTOR);
        assert!(size < CAP * OVERFLOW_FACTOR + CAP);
    }

    #[test]
    fn test_over_cap_on_entry_rotates_first() {
        let (_dir, mut writer) = setup();
        // A previous close failed: full segment without suffix
        let mut leftover = ENVELOPE_PREFIX.to_vec();
        leftover.extend_from_slice(record(1).to_json().unwrap().as_bytes());
        while (leftover.len() as u64) < CAP {
            leftover.push(b',');
            leftover.extend_from_slice(record(2).to_json().unwrap().as_bytes());
        }
        fs::write(writer.layout().in_progress(), &leftover).unwrap();
        assert_eq!(writer.write_position().unwrap(), WritePosition::Closing);

        let report = writer.append(&record(3)).unwrap();
        assert_eq!(report.position, WritePosition::First);

        let completed = fs::read(writer.layout().completed()).unwrap();
        assert!(is_complete_envelope(&completed));
        assert!(completed.starts_with(&leftover));
    }

    #[test]
    fn test_already_closed_segment_is_not_closed_twice() {
        let (_dir, writer) = setup();
        let closed = format!("{{\"items\":[{}]}}", record(1).to_json().unwrap());
        fs::write(writer.layout().in_progress(), &closed).unwrap();

        assert_eq!(writer.close_and_rotate().unwrap(), CloseOutcome::Rotated);
        assert_eq!(fs::read(writer.layout().completed()).unwrap(), closed.as_bytes());
    }

    #[test]
    fn test_torn_segment_quarantined() {
        let (_dir, mut writer) = setup();
        let mut torn = ENVELOPE_PREFIX.to_vec();
        torn.extend_from_slice(record(1).to_json().unwrap().as_bytes());
        torn.extend_from_slice(b",{\"latitude\":1.0");
        torn.resize(CAP as usize, b' ');
        fs::write(writer.layout().in_progress(), &torn).unwrap();

        let report = writer.append(&record(2)).unwrap();
        assert_eq!(report.position, WritePosition::First);

        assert!(!writer.layout().completed().exists());
        assert_eq!(fs::read(writer.layout().quarantine()).unwrap(), {
            let mut expected = torn.clone();
            expected.extend_from_slice(ENVELOPE_SUFFIX);
            expected
        });
    }

    #[test]
    fn test_foreign_content_quarantined_without_suffix() {
        let (_dir, writer) = setup();
        fs::write(writer.layout().in_progress(), b"garbage").unwrap();

        assert_eq!(writer.close_and_rotate().unwrap(), CloseOutcome::Quarantined);
        assert_eq!(fs::read(writer.layout().quarantine()).unwrap(), b"garbage");
        assert!(!writer.layout().in_progress().exists());
    }

    #[test]
    fn test_close_without_open_segment() {
        let (_dir, writer) = setup();
        assert_eq!(writer.close_and_rotate().unwrap(), CloseOutcome::NothingToClose);

        fs::write(writer.layout().in_progress(), b"").unwrap();
        assert_eq!(writer.close_and_rotate().unwrap(), CloseOutcome::NothingToClose);
        assert!(!writer.layout().completed().exists());
    }

    #[test]
    fn test_missing_directory_is_an_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = SegmentWriter::new(SegmentLayout::new(dir.path().join("missing")), CAP);
        match writer.append(&record(1)) {
            Err(StumblerError::Io(_)) => {}
            other => panic!("Expected Io error, got: {:?}", other),
        }
    }
}
