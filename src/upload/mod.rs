//! # Upload Module
//!
//! Drains the completed segment to the remote collector.
//!
//! This module handles:
//! - Classifying the outcome of one HTTP submission
//! - The dwell-period gate on the completed slot
//! - The per-day attempt quota
//! - Deleting or retaining the segment depending on the outcome

pub mod quota;
pub mod scheduler;
pub mod uploader;

pub use quota::UploadQuota;
pub use scheduler::{apply_outcome, PendingUpload, TickOutcome, UploadFileStatus, UploadScheduler, UploadState};
pub use uploader::{HttpUploader, UploadOutcome, Uploader};
