//! # Cluster Aggregation
//!
//! Groups stored detection events into spatial clusters and computes the
//! per-cluster statistics the scorer consumes. Clusters are derived, not
//! owned: they are a pure function of the detection set and the
//! aggregation parameters, recomputed on demand.
//!
//! ## Determinism
//!
//! Detections are sorted canonically before clustering, so the output is
//! independent of storage or insertion order. Cluster ids are a content
//! hash over the rounded member coordinates: stable while membership is
//! stable, changed when membership changes.

mod dbscan;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::geo_utils::compute_center;
use crate::{DetectionEvent, GpsPoint};

/// Parameters for spatial cluster aggregation.
#[derive(Debug, Clone)]
pub struct ClusterConfig {
    /// DBSCAN neighborhood radius in meters. Default: 5.0.
    pub eps_m: f64,
    /// Minimum points to form a dense core. Default: 2, which makes a
    /// singleton detection noise rather than a reportable cluster.
    pub min_pts: usize,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            eps_m: 5.0,
            min_pts: 2,
        }
    }
}

/// Unscored per-cluster statistics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterStats {
    /// Hex digest over the sorted, 6-decimal member coordinates.
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
}

/// Group detection events into spatial clusters.
///
/// Noise points (detections no dense neighborhood claims) are discarded.
/// Output is sorted by cluster id, so a fixed detection set yields an
/// identical result on every call.
pub fn cluster_detections(events: &[DetectionEvent], config: &ClusterConfig) -> Vec<ClusterStats> {
    if events.is_empty() {
        return Vec::new();
    }

    // Canonical order decouples the result from insertion order.
    let mut ordered: Vec<&DetectionEvent> = events.iter().collect();
    ordered.sort_by(|a, b| {
        a.latitude
            .partial_cmp(&b.latitude)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(
                a.longitude
                    .partial_cmp(&b.longitude)
                    .unwrap_or(std::cmp::Ordering::Equal),
            )
            .then(a.wall_time.cmp(&b.wall_time))
            .then(a.trip_id.cmp(&b.trip_id))
    });

    let points: Vec<GpsPoint> = ordered
        .iter()
        .map(|e| GpsPoint::new(e.latitude, e.longitude))
        .collect();
    let labels = dbscan::dbscan(&points, config.eps_m, config.min_pts);

    let cluster_count = labels.iter().copied().max().map_or(0, |m| (m + 1).max(0)) as usize;
    let mut groups: Vec<Vec<&DetectionEvent>> = vec![Vec::new(); cluster_count];
    for (i, &label) in labels.iter().enumerate() {
        if label >= 0 {
            groups[label as usize].push(ordered[i]);
        }
    }

    let mut clusters: Vec<ClusterStats> = groups
        .iter()
        .filter_map(|members| summarize(members))
        .collect();

    clusters.sort_by(|a, b| a.cluster_id.cmp(&b.cluster_id));
    clusters
}

fn summarize(members: &[&DetectionEvent]) -> Option<ClusterStats> {
    let (first, _) = members.split_first()?;
    let n = members.len() as f64;
    let centroid = compute_center(
        &members
            .iter()
            .map(|e| GpsPoint::new(e.latitude, e.longitude))
            .collect::<Vec<_>>(),
    );

    let mut users: Vec<&str> = members.iter().map(|e| e.user_id.as_str()).collect();
    users.sort_unstable();
    users.dedup();

    let last_seen = members
        .iter()
        .map(|e| e.wall_time)
        .fold(first.wall_time, |a, b| a.max(b));

    Some(ClusterStats {
        cluster_id: cluster_id_for(members),
        latitude: centroid.latitude,
        longitude: centroid.longitude,
        hits: members.len() as u32,
        users: users.len() as u32,
        last_seen,
        avg_intensity: members.iter().map(|e| e.intensity).sum::<f64>() / n,
        avg_stability: members.iter().map(|e| e.stability).sum::<f64>() / n,
    })
}

/// Deterministic cluster id: hex of the first 16 digest bytes over the
/// sorted 6-decimal member coordinate list.
fn cluster_id_for(members: &[&DetectionEvent]) -> String {
    let mut coords: Vec<String> = members
        .iter()
        .map(|e| format!("{:.6}:{:.6}", e.latitude, e.longitude))
        .collect();
    coords.sort_unstable();

    let mut hasher = Sha256::new();
    for coord in &coords {
        hasher.update(coord.as_bytes());
        hasher.update(b";");
    }
    let digest = hasher.finalize();
    digest[..16].iter().map(|b| format!("{:02x}", b)).collect()
}
