//! # Stumble Pipeline
//!
//! Wires the segment writer, the upload scheduler and an uploader into one
//! instance that owns all of their state.
//!
//! Two guards coordinate the work:
//!
//! - The run guard (`Idle`/`Running`) admits one writer or scheduler pass at a
//!   time. A pass that finds it `Running` is skipped, and a record that arrives
//!   while it is held is dropped.
//! - The upload guard (`Idle`/`Uploading`), owned by the scheduler, covers the
//!   network call. Appends keep flowing while an upload is in flight.
//!
//! File I/O runs on the blocking pool; only the submission runs on the async
//! runtime, and no lock is held across it.

use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};
use tokio::runtime::Handle;
use tracing::{debug, warn};

use crate::aggregator::{Aggregator, RecordSink};
use crate::config::{Config, StorageConfig, UploadConfig};
use crate::error::Result;
use crate::guard::ExclusiveGuard;
use crate::record::Record;
use crate::segment::{AppendReport, SegmentLayout, SegmentWriter};
use crate::upload::{apply_outcome, HttpUploader, TickOutcome, UploadOutcome, UploadScheduler, UploadState, Uploader};

/// State of the run guard
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Idle,
    Running,
}

/// What one scheduler tick did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickReport {
    /// Another pass held the run guard
    Skipped,
    NoFile,
    NotYetEligible,
    InFlight,
    QuotaExhausted,
    Uploaded { outcome: UploadOutcome, deleted: bool },
}

struct Inner {
    layout: SegmentLayout,
    run_guard: Arc<ExclusiveGuard>,
    writer: Mutex<SegmentWriter>,
    scheduler: Mutex<UploadScheduler>,
    uploader: Arc<dyn Uploader>,
    runtime: Handle,
}

/// Handle to one stumbler pipeline; clones share the same state
#[derive(Clone)]
pub struct Pipeline {
    inner: Arc<Inner>,
}

impl Pipeline {
    /// Create a pipeline on the current Tokio runtime
    ///
    /// # Arguments
    ///
    /// * `storage` - Storage directory and segment cap
    /// * `upload` - Dwell period and quota
    /// * `uploader` - Transport used for completed segments
    ///
    /// # Errors
    ///
    /// Returns error if:
    /// - The storage directory cannot be created
    /// - Called outside a Tokio runtime
    pub fn new(storage: &StorageConfig, upload: &UploadConfig, uploader: Arc<dyn Uploader>) -> Result<Self> {
        let runtime = Handle::try_current()?;
        let layout = SegmentLayout::new(&storage.dir);
        layout.ensure_dir()?;

        Ok(Self {
            inner: Arc::new(Inner {
                writer: Mutex::new(SegmentWriter::new(layout.clone(), storage.max_segment_bytes)),
                scheduler: Mutex::new(UploadScheduler::from_config(layout.clone(), upload)),
                layout,
                run_guard: ExclusiveGuard::new("worker"),
                uploader,
                runtime,
            }),
        })
    }

    /// Create a pipeline uploading over HTTP as configured
    pub fn from_config(config: &Config) -> Result<Self> {
        let uploader = HttpUploader::from_config(&config.upload)?;
        Self::new(&config.storage, &config.upload, Arc::new(uploader))
    }

    /// Aggregator whose completed records are appended to this pipeline
    pub fn aggregator(&self, opt_out_suffix: &str) -> Aggregator {
        Aggregator::new(Arc::new(self.clone()), opt_out_suffix)
    }

    pub fn layout(&self) -> &SegmentLayout {
        &self.inner.layout
    }

    pub fn worker_state(&self) -> WorkerState {
        if self.inner.run_guard.is_busy() {
            WorkerState::Running
        } else {
            WorkerState::Idle
        }
    }

    pub fn upload_state(&self) -> UploadState {
        self.inner
            .scheduler
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .upload_state()
    }

    /// Append one record to the open segment
    ///
    /// # Returns
    ///
    /// * `Ok(Some(report))` - The record was written
    /// * `Ok(None)` - Another pass held the run guard; the record was dropped
    pub async fn append(&self, record: Record) -> Result<Option<AppendReport>> {
        let Some(ticket) = self.inner.run_guard.try_enter() else {
            debug!(guard = self.inner.run_guard.name(), "Guard busy, dropping stumble record");
            return Ok(None);
        };

        let inner = Arc::clone(&self.inner);
        let report = tokio::task::spawn_blocking(move || {
            let _ticket = ticket;
            inner
                .writer
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .append(&record)
        })
        .await??;

        Ok(Some(report))
    }

    /// Run one scheduler pass now
    pub async fn tick(&self) -> Result<TickReport> {
        self.tick_at(Utc::now()).await
    }

    /// Run one scheduler pass as if the time were `now`
    ///
    /// The run guard is held while the slot is inspected and read, and
    /// released before the submission starts.
    pub async fn tick_at(&self, now: DateTime<Utc>) -> Result<TickReport> {
        let Some(ticket) = self.inner.run_guard.try_enter() else {
            debug!(guard = self.inner.run_guard.name(), "Guard busy, skipping scheduler tick");
            return Ok(TickReport::Skipped);
        };

        let inner = Arc::clone(&self.inner);
        let prepared = tokio::task::spawn_blocking(move || {
            let _ticket = ticket;
            inner
                .scheduler
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .prepare(now)
        })
        .await??;

        let pending = match prepared {
            TickOutcome::NoFile => return Ok(TickReport::NoFile),
            TickOutcome::NotYetEligible => return Ok(TickReport::NotYetEligible),
            TickOutcome::InFlight => return Ok(TickReport::InFlight),
            TickOutcome::QuotaExhausted => return Ok(TickReport::QuotaExhausted),
            TickOutcome::Upload(pending) => pending,
        };

        let (payload, upload_ticket) = pending.into_parts();
        let outcome = self.inner.uploader.submit(payload).await;

        let inner = Arc::clone(&self.inner);
        let deleted = tokio::task::spawn_blocking(move || {
            apply_outcome(&inner.layout, outcome, upload_ticket)
        })
        .await??;

        Ok(TickReport::Uploaded { outcome, deleted })
    }
}

impl RecordSink for Pipeline {
    fn accept(&self, record: Record) {
        let pipeline = self.clone();
        self.inner.runtime.spawn(async move {
            if let Err(e) = pipeline.append(record).await {
                warn!("Failed to append stumble record: {}", e);
            }
        });
    }
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("dir", &self.inner.layout.dir())
            .field("worker", &self.worker_state())
            .finish_non_exhaustive()
    }
}
