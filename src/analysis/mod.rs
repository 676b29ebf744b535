//! Analysis lifecycle
//!
//! - [`AnalysisRecord`]: durable execution record with an explicit state machine
//! - [`AnalysisTracker`]: single source of truth for analysis status
//! - [`AnalysisRunner`]: asynchronous batch jobs

pub mod record;
pub mod runner;
pub mod tracker;

pub use record::{AnalysisRecord, AnalysisStatus};
pub use runner::{AnalysisHandle, AnalysisRequest, AnalysisRunner, DatasetSource, RunContext};
pub use tracker::AnalysisTracker;
