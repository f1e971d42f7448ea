//! Unified error handling for the roadwatch pipeline.
//!
//! One exhaustive error type covers the whole core: trip validation,
//! processing budgets, store I/O, and query validation. The HTTP layer
//! decides how each kind maps to a status code; the core only classifies.

use std::fmt;

/// Unified error type for pipeline operations.
#[derive(Debug, Clone)]
pub enum PipelineError {
    /// Malformed trip document: missing identifiers, empty sample list,
    /// or too few usable samples after normalization.
    InvalidTrip { trip_id: String, message: String },
    /// The detector exceeded the per-trip processing budget.
    ProcessingTimeout { trip_id: String, budget_secs: u64 },
    /// Trip or detection store I/O failed. The caller may retry.
    StoreUnavailable { message: String },
    /// Unrecognized or out-of-range query filter.
    InvalidQuery { message: String },
}

impl fmt::Display for PipelineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PipelineError::InvalidTrip { trip_id, message } => {
                if trip_id.is_empty() {
                    write!(f, "Invalid trip: {}", message)
                } else {
                    write!(f, "Invalid trip '{}': {}", trip_id, message)
                }
            }
            PipelineError::ProcessingTimeout {
                trip_id,
                budget_secs,
            } => {
                write!(
                    f,
                    "Trip '{}' exceeded the {}s processing budget",
                    trip_id, budget_secs
                )
            }
            PipelineError::StoreUnavailable { message } => {
                write!(f, "Store unavailable: {}", message)
            }
            PipelineError::InvalidQuery { message } => {
                write!(f, "Invalid query: {}", message)
            }
        }
    }
}

impl std::error::Error for PipelineError {}

impl From<rusqlite::Error> for PipelineError {
    fn from(e: rusqlite::Error) -> Self {
        PipelineError::StoreUnavailable {
            message: e.to_string(),
        }
    }
}

impl From<serde_json::Error> for PipelineError {
    fn from(e: serde_json::Error) -> Self {
        PipelineError::InvalidTrip {
            trip_id: String::new(),
            message: format!("payload is not valid JSON: {}", e),
        }
    }
}

/// Result type alias for pipeline operations.
pub type Result<T> = std::result::Result<T, PipelineError>;

impl PipelineError {
    /// Shorthand for trip validation failures.
    pub fn invalid_trip(trip_id: &str, message: impl Into<String>) -> Self {
        PipelineError::InvalidTrip {
            trip_id: trip_id.to_string(),
            message: message.into(),
        }
    }

    /// Shorthand for query validation failures.
    pub fn invalid_query(message: impl Into<String>) -> Self {
        PipelineError::InvalidQuery {
            message: message.into(),
        }
    }
}
