//! Error types for the scaling engine.
//!
//! Every failure that can end up in a checkpoint carries an [`ErrorContext`]
//! so a failed run can be reconstructed from the checkpoint alone.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::models::BandPlan;

/// Shared `Result` alias for the engine.
pub type Result<T> = std::result::Result<T, EngineError>;

/// Where and when a failure happened.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorContext {
    /// Index of the band that was running, if any.
    pub band_index: Option<usize>,
    /// Worker count at failure time.
    pub workers: u32,
    /// Connection count at failure time.
    pub connections: u32,
    /// When the failure was observed.
    pub at: DateTime<Utc>,
}

impl ErrorContext {
    /// Context for a failure while `plan` was executing.
    pub fn for_band(plan: &BandPlan) -> Self {
        Self {
            band_index: Some(plan.index),
            workers: plan.workers,
            connections: plan.connections,
            at: Utc::now(),
        }
    }

    /// Context for a failure outside any band.
    pub fn outside_band() -> Self {
        Self {
            band_index: None,
            workers: 0,
            connections: 0,
            at: Utc::now(),
        }
    }
}

impl fmt::Display for ErrorContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.band_index {
            Some(index) => write!(
                f,
                "band {} ({} workers / {} connections)",
                index + 1,
                self.workers,
                self.connections
            ),
            None => write!(f, "no active band"),
        }
    }
}

/// Error reported by a band executor.
///
/// Executors live outside the engine; only the message is kept.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{message}")]
pub struct ExecutorError {
    pub message: String,
}

impl ExecutorError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Top-level error type for the engine.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("[BSC-1001] invalid configuration: {details}")]
    InvalidConfiguration { details: String },

    #[error("[BSC-2001] executor failed at {context}: {message}")]
    Executor {
        context: ErrorContext,
        message: String,
    },

    #[error("[BSC-2002] no data collected for {context}")]
    NoDataCollected { context: ErrorContext },

    #[error("[BSC-3001] insufficient data for analysis: {details}")]
    InsufficientData { details: String },

    #[error("[BSC-4001] checkpoint persistence failed at {path}: {source}")]
    Persistence {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("[BSC-4002] checkpoint not found: {id}")]
    CheckpointNotFound { id: String },

    #[error("[BSC-4003] serialization failure in {context}: {details}")]
    Serialization {
        context: &'static str,
        details: String,
    },
}

impl EngineError {
    /// Stable machine-parseable error code.
    pub const fn code(&self) -> &'static str {
        match self {
            Self::InvalidConfiguration { .. } => "BSC-1001",
            Self::Executor { .. } => "BSC-2001",
            Self::NoDataCollected { .. } => "BSC-2002",
            Self::InsufficientData { .. } => "BSC-3001",
            Self::Persistence { .. } => "BSC-4001",
            Self::CheckpointNotFound { .. } => "BSC-4002",
            Self::Serialization { .. } => "BSC-4003",
        }
    }

    /// Classification used in checkpoints and logs.
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidConfiguration { .. } => ErrorKind::Configuration,
            Self::Executor { .. } => ErrorKind::Executor,
            Self::NoDataCollected { .. } => ErrorKind::Data,
            Self::InsufficientData { .. } => ErrorKind::AnalysisDegraded,
            Self::Persistence { .. }
            | Self::CheckpointNotFound { .. }
            | Self::Serialization { .. } => ErrorKind::Persistence,
        }
    }

    /// Whether retrying the same operation might succeed.
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Persistence { .. })
    }

    pub fn invalid_config(details: impl Into<String>) -> Self {
        Self::InvalidConfiguration {
            details: details.into(),
        }
    }

    pub fn executor(plan: &BandPlan, message: impl Into<String>) -> Self {
        Self::Executor {
            context: ErrorContext::for_band(plan),
            message: message.into(),
        }
    }

    pub fn persistence(path: impl AsRef<Path>, source: std::io::Error) -> Self {
        Self::Persistence {
            path: path.as_ref().to_path_buf(),
            source,
        }
    }

    /// The failure context, when the error is tied to a band.
    pub fn context(&self) -> Option<&ErrorContext> {
        match self {
            Self::Executor { context, .. } | Self::NoDataCollected { context } => Some(context),
            _ => None,
        }
    }

    /// Serializable record of this error for a checkpoint.
    pub fn record(&self) -> ErrorRecord {
        self.record_in(None)
    }

    /// Like [`record`](Self::record), but errors without their own context
    /// are attributed to `band` instead of to no band at all.
    pub fn record_in(&self, band: Option<&BandPlan>) -> ErrorRecord {
        let context = match (self.context(), band) {
            (Some(context), _) => context.clone(),
            (None, Some(plan)) => ErrorContext::for_band(plan),
            (None, None) => ErrorContext::outside_band(),
        };
        ErrorRecord {
            kind: self.kind(),
            code: self.code().to_string(),
            message: self.to_string(),
            context,
        }
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(value: serde_json::Error) -> Self {
        Self::Serialization {
            context: "serde_json",
            details: value.to_string(),
        }
    }
}

/// Error taxonomy used in persisted error records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Configuration,
    Executor,
    Data,
    AnalysisDegraded,
    Persistence,
}

/// An error as stored in a checkpoint's execution state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub kind: ErrorKind,
    pub code: String,
    pub message: String,
    pub context: ErrorContext,
}
