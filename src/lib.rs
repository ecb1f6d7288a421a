//! Bandscale - progressive concurrency scaling for database load tests.
//!
//! A test runs as a sequence of bands, each at a fixed worker and
//! connection count. The [`controller`] drives a [`executor::BandExecutor`]
//! band by band, aggregates samples into [`models::BandResult`]s,
//! checkpoints progress through [`checkpoint::CheckpointManager`] and
//! analyses the scaling curve with [`analysis::AnalysisEngine`].

pub mod analysis;
pub mod cancel;
pub mod checkpoint;
pub mod controller;
pub mod error;
pub mod executor;
pub mod models;
pub mod planner;
pub mod report;

pub use error::{EngineError, Result};
