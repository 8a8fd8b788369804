//! # Upload Scheduler
//!
//! Decides, once per tick, whether the completed segment should be sent.
//!
//! A scheduler pass is split around the network call:
//!
//! 1. [`UploadScheduler::prepare`] checks the slot, the dwell period and the
//!    quota, enters the upload guard and reads the segment into memory.
//! 2. The caller submits the payload without holding any lock.
//! 3. [`apply_outcome`] deletes or retains the segment and releases the guard.

use bytes::Bytes;
use chrono::{DateTime, Duration, Utc};
use std::fs;
use std::io;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config::{UploadConfig, MAX_DWELL_S};
use crate::error::Result;
use crate::guard::{ExclusiveGuard, GuardTicket};
use crate::segment::SegmentLayout;
use crate::upload::quota::UploadQuota;
use crate::upload::uploader::UploadOutcome;

/// State of the completed slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadFileStatus {
    /// No completed segment on disk
    NoFile,
    /// A completed segment exists but is younger than the dwell period
    Exists,
    /// A completed segment is old enough to send
    ReadyToUpload,
}

/// State of the upload guard
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadState {
    Idle,
    Uploading,
}

/// Payload read from the completed slot, together with the held upload guard
#[derive(Debug)]
pub struct PendingUpload {
    payload: Bytes,
    ticket: GuardTicket,
}

impl PendingUpload {
    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn into_parts(self) -> (Bytes, GuardTicket) {
        (self.payload, self.ticket)
    }
}

/// What one `prepare` call decided
#[derive(Debug)]
pub enum TickOutcome {
    NoFile,
    NotYetEligible,
    /// An upload is already in flight
    InFlight,
    QuotaExhausted,
    Upload(PendingUpload),
}

/// Gatekeeper for the completed slot
#[derive(Debug)]
pub struct UploadScheduler {
    layout: SegmentLayout,
    min_dwell: Duration,
    quota: UploadQuota,
    upload_guard: Arc<ExclusiveGuard>,
}

impl UploadScheduler {
    /// Create a scheduler
    ///
    /// # Arguments
    ///
    /// * `layout` - Storage directory layout
    /// * `min_dwell` - Minimum age of the completed segment before it is sent
    /// * `max_attempts_per_day` - Upload attempts allowed per UTC day
    pub fn new(layout: SegmentLayout, min_dwell: Duration, max_attempts_per_day: u32) -> Self {
        Self {
            layout,
            min_dwell,
            quota: UploadQuota::new(max_attempts_per_day),
            upload_guard: ExclusiveGuard::new("upload"),
        }
    }

    pub fn from_config(layout: SegmentLayout, config: &UploadConfig) -> Self {
        let dwell_s = config.min_dwell_s.min(MAX_DWELL_S) as i64;
        Self::new(layout, Duration::seconds(dwell_s), config.max_attempts_per_day)
    }

    pub fn layout(&self) -> &SegmentLayout {
        &self.layout
    }

    pub fn quota(&self) -> &UploadQuota {
        &self.quota
    }

    pub fn upload_state(&self) -> UploadState {
        if self.upload_guard.is_busy() {
            UploadState::Uploading
        } else {
            UploadState::Idle
        }
    }

    /// Inspect the completed slot at `now`
    ///
    /// A zero-byte completed file is removed and reported as `NoFile`.
    /// A modification time further in the future than the dwell period means
    /// the clock was set back; such a segment is treated as ready.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the file metadata cannot be read or an empty
    /// file cannot be removed
    pub fn file_status(&self, now: DateTime<Utc>) -> Result<UploadFileStatus> {
        let path = self.layout.completed();
        let metadata = match fs::metadata(&path) {
            Ok(metadata) => metadata,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(UploadFileStatus::NoFile),
            Err(e) => return Err(e.into()),
        };

        if metadata.len() == 0 {
            warn!("Removing empty completed segment {}", path.display());
            remove_if_present(&path)?;
            return Ok(UploadFileStatus::NoFile);
        }

        let modified: DateTime<Utc> = metadata.modified()?.into();
        let age = now.signed_duration_since(modified);

        if age >= self.min_dwell || age < -self.min_dwell {
            Ok(UploadFileStatus::ReadyToUpload)
        } else {
            Ok(UploadFileStatus::Exists)
        }
    }

    /// Decide whether to upload now, and if so take the guard and read the payload
    ///
    /// An attempt is only counted against the quota once the payload has
    /// been read.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the slot cannot be inspected or read. The guard
    /// is not held when an error is returned.
    pub fn prepare(&mut self, now: DateTime<Utc>) -> Result<TickOutcome> {
        if self.upload_guard.is_busy() {
            debug!("Upload in flight, skipping scheduler pass");
            return Ok(TickOutcome::InFlight);
        }

        match self.file_status(now)? {
            UploadFileStatus::NoFile => return Ok(TickOutcome::NoFile),
            UploadFileStatus::Exists => return Ok(TickOutcome::NotYetEligible),
            UploadFileStatus::ReadyToUpload => {}
        }

        // Only attempts with a payload count against the quota
        let path = self.layout.completed();
        let payload = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(TickOutcome::NoFile),
            Err(e) => return Err(e.into()),
        };

        if !self.quota.try_consume(now) {
            debug!(
                "Upload quota exhausted ({} attempts today, max {})",
                self.quota.attempts() - 1,
                self.quota.max_attempts()
            );
            return Ok(TickOutcome::QuotaExhausted);
        }

        let Some(ticket) = self.upload_guard.try_enter() else {
            return Ok(TickOutcome::InFlight);
        };

        info!(
            "Uploading completed segment ({} bytes, attempt {} of {} today)",
            payload.len(),
            self.quota.attempts(),
            self.quota.max_attempts()
        );

        Ok(TickOutcome::Upload(PendingUpload {
            payload: Bytes::from(payload),
            ticket,
        }))
    }
}

/// Apply an upload outcome to the completed slot, then release the upload guard
///
/// # Returns
///
/// `true` if the completed segment was deleted
///
/// # Errors
///
/// Returns an I/O error if the segment should be deleted but cannot be. The
/// guard is released either way.
pub fn apply_outcome(layout: &SegmentLayout, outcome: UploadOutcome, ticket: GuardTicket) -> Result<bool> {
    let result = if outcome.should_delete() {
        let path = layout.completed();
        remove_if_present(&path).map(|_| {
            info!("Upload {:?}, deleted {}", outcome, path.display());
            true
        })
    } else {
        warn!("Upload {:?}, keeping completed segment for a later tick", outcome);
        Ok(false)
    };

    drop(ticket);
    result
}

fn remove_if_present(path: &std::path::Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}
