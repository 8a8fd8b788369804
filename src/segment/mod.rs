//! # Segment Module
//!
//! Durable, size-capped buffering of rendered records.
//!
//! This module handles:
//! - The on-disk layout of the storage directory
//! - Appending records into the open segment's `{"items":[...]}` envelope
//! - Closing a full segment and rotating it into the completed slot
//! - Quarantining segments whose envelope cannot be verified
//!
//! ## Layout
//!
//! | File                 | Role                                        |
//! |----------------------|---------------------------------------------|
//! | `stumbles.json`      | open segment, appended to                   |
//! | `stumbles.done.json` | completed segment, waiting for upload       |
//! | `stumbles.bad.json`  | last segment that failed verification       |

pub mod writer;

pub use writer::{AppendReport, CloseOutcome, SegmentWriter, WritePosition};

use serde::Deserialize;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// Open segment file name
pub const IN_PROGRESS_FILE: &str = "stumbles.json";

/// Completed segment file name
pub const COMPLETED_FILE: &str = "stumbles.done.json";

/// Quarantined segment file name
pub const QUARANTINE_FILE: &str = "stumbles.bad.json";

/// Written before the first item of a segment
pub const ENVELOPE_PREFIX: &[u8] = b"{\"items\":[";

/// Written after the last item when a segment is closed
pub const ENVELOPE_SUFFIX: &[u8] = b"]}";

/// Written before every item but the first
pub const ITEM_SEPARATOR: &[u8] = b",";

/// Paths of the segment files inside the storage directory
#[derive(Debug, Clone)]
pub struct SegmentLayout {
    dir: PathBuf,
}

impl SegmentLayout {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Create the storage directory if it does not exist yet
    pub fn ensure_dir(&self) -> io::Result<()> {
        fs::create_dir_all(&self.dir)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn in_progress(&self) -> PathBuf {
        self.dir.join(IN_PROGRESS_FILE)
    }

    pub fn completed(&self) -> PathBuf {
        self.dir.join(COMPLETED_FILE)
    }

    pub fn quarantine(&self) -> PathBuf {
        self.dir.join(QUARANTINE_FILE)
    }
}

#[derive(Deserialize)]
struct Envelope {
    #[allow(dead_code)]
    items: Vec<serde::de::IgnoredAny>,
}

/// Whether `bytes` is exactly one closed `{"items":[...]}` envelope
///
/// An open segment never passes: it lacks the closing suffix.
pub fn is_complete_envelope(bytes: &[u8]) -> bool {
    bytes.starts_with(ENVELOPE_PREFIX) && serde_json::from_slice::<Envelope>(bytes).is_ok()
}
