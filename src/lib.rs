//! # roadwatch
//!
//! Turns raw smartphone sensor streams recorded during car trips into a
//! ranked, deduplicated map of probable road defects.
//!
//! This library provides:
//! - Trip normalization: one uploaded JSON document into a validated,
//!   uptime-ordered sample sequence
//! - Per-trip bump detection: robust z-scoring of vertical acceleration
//!   with speed, stability, and GPS-quality gates
//! - Cross-trip aggregation: DBSCAN spatial clusters over all stored
//!   detections, with deterministic content-hash ids
//! - Scoring: explainable confidence, priority, and likelihood per
//!   cluster
//!
//! ## Features
//!
//! - **`parallel`** - Batch trip processing with rayon (default)
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use roadwatch::{ClusterQuery, PipelineEngine, SqliteStore, TripDocument};
//!
//! let store = SqliteStore::open("roadwatch.db")?;
//! let mut engine = PipelineEngine::new(store);
//!
//! let doc = TripDocument::from_json(r#"{ "user_id": "...", "trip_id": "...", "samples": [] }"#)?;
//! let summary = engine.ingest(doc)?;
//! println!("trip {}: {} detections", summary.trip_id, summary.detection_count);
//!
//! let clusters = engine.query_clusters(&ClusterQuery::default())?;
//! for c in clusters {
//!     println!("{} hits={} confidence={:.2}", c.cluster_id, c.hits, c.confidence);
//! }
//! # Ok::<(), roadwatch::PipelineError>(())
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// Unified error handling
pub mod error;
pub use error::{PipelineError, Result};

// Trip document model and sample normalization
pub mod trip;
pub use trip::{normalize, NormalizedTrip, RawSample, Sample, TripDocument, WireTimestamp};

// Rolling-window signal statistics
pub mod signal;

// Per-trip bump detection
pub mod detector;
pub use detector::{detect_trip, DetectorConfig};

// Rough-road segment analysis
pub mod segments;
pub use segments::{compute_rough_segments, RoughSegment, RoughnessConfig};

// Geographic utilities (distance, degree conversion, centroids)
pub mod geo_utils;

// Spatial cluster aggregation
pub mod cluster;
pub use cluster::{cluster_detections, ClusterConfig, ClusterStats};

// Confidence and priority scoring
pub mod score;
pub use score::{likelihood_for, score_cluster};

// Trip and detection stores
pub mod store;
pub use store::{DetectionStore, SqliteStore, TripStore};

// Pipeline facade
pub mod engine;
pub use engine::{ClusterQuery, DetectionTaskHandle, PipelineEngine};
#[cfg(feature = "parallel")]
pub use engine::process_trips_parallel;

// ============================================================================
// Core Types
// ============================================================================

/// A GPS coordinate with latitude and longitude (WGS84 degrees).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GpsPoint {
    pub latitude: f64,
    pub longitude: f64,
}

impl GpsPoint {
    /// Create a new GPS point.
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
        }
    }

    /// Check if the point has valid coordinates.
    pub fn is_valid(&self) -> bool {
        self.latitude.is_finite()
            && self.longitude.is_finite()
            && self.latitude >= -90.0
            && self.latitude <= 90.0
            && self.longitude >= -180.0
            && self.longitude <= 180.0
    }
}

/// One confirmed bump, located in space and time.
///
/// Produced by the detector, persisted in the detection store, and
/// consumed by the cluster aggregator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectionEvent {
    pub trip_id: String,
    pub user_id: String,
    pub wall_time: DateTime<Utc>,
    pub latitude: f64,
    pub longitude: f64,
    /// Robust z-score magnitude of vertical acceleration at the event.
    pub intensity: f64,
    /// Mount stability in [0, 1]; 1 = rigidly mounted.
    pub stability: f64,
    /// Vehicle speed at event time.
    pub speed_mps: f64,
}

/// Categorical summary of cluster confidence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Likelihood {
    VeryLikely,
    Likely,
    Uncertain,
}

/// A scored spatial cluster of detections, ready for the dashboard.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterSummary {
    /// Deterministic content-hash id over the member coordinates.
    pub cluster_id: String,
    pub latitude: f64,
    pub longitude: f64,
    /// Member detection count.
    pub hits: u32,
    /// Distinct contributing users.
    pub users: u32,
    pub last_seen: DateTime<Utc>,
    pub avg_intensity: f64,
    pub avg_stability: f64,
    pub confidence: f64,
    pub priority: f64,
    pub likelihood: Likelihood,
}

/// Result of ingesting one trip.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestSummary {
    pub trip_id: String,
    pub detection_count: usize,
}
