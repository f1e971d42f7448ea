//! # Pipeline Engine
//!
//! The request-driven facade over the whole pipeline. Two call-sites
//! exist: ingest (one trip: normalize, detect, persist) and query
//! (recompute clusters or page raw detections from the current
//! detection set).
//!
//! Detection work runs on a spawned worker thread so the ingest path can
//! enforce a hard wall-clock budget, and so upload handlers can
//! acknowledge receipt before detection completes. Queries read one
//! snapshot of the detection store; cluster statistics are cached keyed
//! by the detection set's content hash, so the cache self-invalidates on
//! any write without bookkeeping.

use std::num::NonZeroUsize;
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use chrono::Utc;
use log::{debug, info};
use lru::LruCache;
use sha2::{Digest, Sha256};

use crate::cluster::{cluster_detections, ClusterConfig, ClusterStats};
use crate::detector::{detect_trip, DetectorConfig};
use crate::error::{PipelineError, Result};
use crate::score::{dashboard_threshold, score_cluster};
use crate::segments::{compute_rough_segments, RoughSegment, RoughnessConfig};
use crate::store::{DetectionStore, TripStore};
use crate::trip::{normalize, TripDocument};
use crate::{ClusterSummary, DetectionEvent, IngestSummary};

/// Default hard wall-clock budget for processing one trip.
pub const DEFAULT_INGEST_BUDGET: Duration = Duration::from_secs(60);

/// Upper bound accepted for the clustering radius override.
const MAX_EPS_M: f64 = 30.0;

/// Cached cluster sets per (content hash, parameters).
const CLUSTER_CACHE_ENTRIES: usize = 16;

/// Filters for a cluster query.
#[derive(Debug, Clone)]
pub struct ClusterQuery {
    /// Drop clusters below this confidence. Default: 0.0.
    pub min_confidence: f64,
    /// Maximum clusters returned, ordered by priority descending.
    /// Default: 1000.
    pub limit: usize,
    /// Apply the percentile-based high-priority filter on top of
    /// `min_confidence`. Default: false.
    pub dashboard: bool,
    /// Clustering neighborhood radius in meters. Default: 5.0.
    pub eps_m: f64,
}

impl Default for ClusterQuery {
    fn default() -> Self {
        Self {
            min_confidence: 0.0,
            limit: 1000,
            dashboard: false,
            eps_m: 5.0,
        }
    }
}

/// Handle for detection running on a background worker.
///
/// The computed set is applied to the store later with
/// [`PipelineEngine::ingest_prepared`].
pub struct DetectionTaskHandle {
    receiver: mpsc::Receiver<Result<(TripDocument, Vec<DetectionEvent>)>>,
}

impl DetectionTaskHandle {
    /// Check for completion without blocking.
    pub fn try_recv(&self) -> Option<Result<(TripDocument, Vec<DetectionEvent>)>> {
        self.receiver.try_recv().ok()
    }

    /// Wait for detection to complete.
    pub fn recv(self) -> Result<(TripDocument, Vec<DetectionEvent>)> {
        self.receiver
            .recv()
            .unwrap_or_else(|_| Err(worker_vanished()))
    }
}

fn worker_vanished() -> PipelineError {
    PipelineError::StoreUnavailable {
        message: "detection worker exited unexpectedly".to_string(),
    }
}

type CacheKey = (String, u64, usize);

/// The stateful pipeline facade, generic over the backing stores.
pub struct PipelineEngine<S: TripStore + DetectionStore> {
    store: S,
    detector_config: DetectorConfig,
    cluster_config: ClusterConfig,
    roughness_config: RoughnessConfig,
    ingest_budget: Duration,
    cluster_cache: LruCache<CacheKey, Arc<Vec<ClusterStats>>>,
}

impl<S: TripStore + DetectionStore> PipelineEngine<S> {
    /// Create an engine with default configuration.
    pub fn new(store: S) -> Self {
        Self::with_config(
            store,
            DetectorConfig::default(),
            ClusterConfig::default(),
            DEFAULT_INGEST_BUDGET,
        )
    }

    /// Create an engine with custom configuration.
    pub fn with_config(
        store: S,
        detector_config: DetectorConfig,
        cluster_config: ClusterConfig,
        ingest_budget: Duration,
    ) -> Self {
        Self {
            store,
            detector_config,
            cluster_config,
            roughness_config: RoughnessConfig::default(),
            ingest_budget,
            cluster_cache: LruCache::new(
                NonZeroUsize::new(CLUSTER_CACHE_ENTRIES).unwrap_or(NonZeroUsize::MIN),
            ),
        }
    }

    // ========================================================================
    // Ingest
    // ========================================================================

    /// Ingest one trip: normalize, detect, and persist.
    ///
    /// Detection runs on a worker thread under the engine's wall-clock
    /// budget. On timeout nothing is written and `ProcessingTimeout` is
    /// returned. Re-ingesting a trip replaces its prior detections, so
    /// the operation is idempotent per `trip_id`.
    pub fn ingest(&mut self, doc: TripDocument) -> Result<IngestSummary> {
        let trip_id = doc.trip_id.clone();
        let handle = self.detect_background(doc);

        match handle.receiver.recv_timeout(self.ingest_budget) {
            Ok(Ok((doc, events))) => self.ingest_prepared(&doc, events),
            Ok(Err(e)) => Err(e),
            Err(mpsc::RecvTimeoutError::Timeout) => Err(PipelineError::ProcessingTimeout {
                trip_id,
                budget_secs: self.ingest_budget.as_secs(),
            }),
            Err(mpsc::RecvTimeoutError::Disconnected) => Err(worker_vanished()),
        }
    }

    /// Start detection for a trip on a background worker and return
    /// immediately, so an upload endpoint can acknowledge receipt first.
    pub fn detect_background(&self, doc: TripDocument) -> DetectionTaskHandle {
        let config = self.detector_config.clone();
        let (tx, rx) = mpsc::channel();

        thread::spawn(move || {
            let result = normalize(&doc).map(|trip| {
                let events = detect_trip(&trip, &config);
                (doc, events)
            });
            let _ = tx.send(result);
        });

        DetectionTaskHandle { receiver: rx }
    }

    /// Persist a trip document together with its already-computed
    /// detection set, replacing any prior detections for the trip.
    pub fn ingest_prepared(
        &mut self,
        doc: &TripDocument,
        events: Vec<DetectionEvent>,
    ) -> Result<IngestSummary> {
        self.store.put_trip(doc)?;
        self.store.replace_trip_detections(&doc.trip_id, &events)?;

        info!(
            "[Engine] ingested trip {}: {} detections persisted",
            doc.trip_id,
            events.len()
        );

        Ok(IngestSummary {
            trip_id: doc.trip_id.clone(),
            detection_count: events.len(),
        })
    }

    // ========================================================================
    // Queries
    // ========================================================================

    /// Recompute and score clusters over the current detection set.
    pub fn query_clusters(&mut self, query: &ClusterQuery) -> Result<Vec<ClusterSummary>> {
        validate_query(query)?;

        let events = self.store.scan_all()?;
        let stats = self.clusters_for(&events, query.eps_m);

        let now = Utc::now();
        let scored: Vec<ClusterSummary> =
            stats.iter().map(|c| score_cluster(c, now)).collect();

        let mut threshold = query.min_confidence;
        if query.dashboard {
            let confidences: Vec<f64> = scored.iter().map(|c| c.confidence).collect();
            threshold = threshold.max(dashboard_threshold(&confidences));
        }

        let mut filtered: Vec<ClusterSummary> = scored
            .into_iter()
            .filter(|c| c.confidence >= threshold)
            .collect();

        filtered.sort_by(|a, b| {
            b.priority
                .partial_cmp(&a.priority)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(
                    b.confidence
                        .partial_cmp(&a.confidence)
                        .unwrap_or(std::cmp::Ordering::Equal),
                )
                .then(a.cluster_id.cmp(&b.cluster_id))
        });
        filtered.truncate(query.limit);

        Ok(filtered)
    }

    /// One page of raw detection events, newest first.
    pub fn query_detections(&self, limit: usize, offset: usize) -> Result<Vec<DetectionEvent>> {
        if limit == 0 {
            return Err(PipelineError::invalid_query("limit must be at least 1"));
        }
        self.store.page(limit as u32, offset as u32)
    }

    /// Rough-road segments for a stored trip, recomputed from its raw
    /// payload.
    pub fn rough_segments(&self, trip_id: &str) -> Result<Vec<RoughSegment>> {
        let doc = self.store.get_trip(trip_id)?.ok_or_else(|| {
            PipelineError::invalid_query(format!("trip '{}' not found", trip_id))
        })?;
        let trip = normalize(&doc)?;
        Ok(compute_rough_segments(
            &trip,
            &self.detector_config,
            &self.roughness_config,
        ))
    }

    /// Total stored detection count.
    pub fn detection_count(&self) -> Result<u64> {
        self.store.count()
    }

    // ========================================================================
    // Cluster cache
    // ========================================================================

    fn clusters_for(&mut self, events: &[DetectionEvent], eps_m: f64) -> Arc<Vec<ClusterStats>> {
        let key = (
            detection_content_hash(events),
            eps_m.to_bits(),
            self.cluster_config.min_pts,
        );

        if let Some(cached) = self.cluster_cache.get(&key) {
            debug!("[Engine] cluster cache hit for {} detections", events.len());
            return Arc::clone(cached);
        }

        let config = ClusterConfig {
            eps_m,
            min_pts: self.cluster_config.min_pts,
        };
        let stats = Arc::new(cluster_detections(events, &config));
        self.cluster_cache.put(key, Arc::clone(&stats));
        stats
    }
}

fn validate_query(query: &ClusterQuery) -> Result<()> {
    if !(0.0..=1.0).contains(&query.min_confidence) {
        return Err(PipelineError::invalid_query(format!(
            "min_confidence {} outside [0, 1]",
            query.min_confidence
        )));
    }
    if query.limit == 0 {
        return Err(PipelineError::invalid_query("limit must be at least 1"));
    }
    if !query.eps_m.is_finite() || query.eps_m <= 0.0 || query.eps_m > MAX_EPS_M {
        return Err(PipelineError::invalid_query(format!(
            "eps_m {} outside (0, {}]",
            query.eps_m, MAX_EPS_M
        )));
    }
    Ok(())
}

/// Content hash of a detection set, in the store's canonical scan order.
fn detection_content_hash(events: &[DetectionEvent]) -> String {
    let mut hasher = Sha256::new();
    for e in events {
        hasher.update(e.trip_id.as_bytes());
        hasher.update(e.wall_time.timestamp_millis().to_le_bytes());
        hasher.update(e.latitude.to_le_bytes());
        hasher.update(e.longitude.to_le_bytes());
    }
    let digest = hasher.finalize();
    digest[..16].iter().map(|b| format!("{:02x}", b)).collect()
}

/// Run detection for a batch of trips across the rayon worker pool.
///
/// Trips are independent, so this is embarrassingly parallel; applying
/// the results to the store stays sequential on the caller.
#[cfg(feature = "parallel")]
pub fn process_trips_parallel(
    docs: Vec<TripDocument>,
    config: &DetectorConfig,
) -> Vec<Result<(TripDocument, Vec<DetectionEvent>)>> {
    use rayon::prelude::*;

    docs.into_par_iter()
        .map(|doc| {
            normalize(&doc).map(|trip| {
                let events = detect_trip(&trip, config);
                (doc, events)
            })
        })
        .collect()
}
