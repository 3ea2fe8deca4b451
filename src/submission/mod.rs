//! Submission Module
//!
//! Turns validated pipelines into engine submissions and keeps a local
//! record of what was submitted.
//!
//! # Structure
//!
//! - [`backend`]: Backend trait, dry-run and spool backends
//! - [`entry`]: `quick_*` entry points
//! - [`tracking`]: Append-only submission log

pub mod backend;
pub mod entry;
pub mod tracking;

pub use backend::{
    DryRunBackend, SpoolBackend, SpoolManifest, SubmissionRequest, WorkflowBackend, WorkflowKind,
};
pub use entry::{
    quick_dos_batch, quick_qe, quick_qe_sequential, quick_vasp_sequential, single_input,
    submit_loaded, SubmissionResult,
};
pub use tracking::{TrackingEntry, TrackingLog};
