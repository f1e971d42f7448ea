//! Confidence and priority scoring for clusters.
//!
//! Turns per-cluster statistics into a scalar confidence, a ranking
//! priority, and a categorical likelihood label. Every term is a fixed,
//! explainable normalization to [0, 1]; there is no learned model.

use chrono::{DateTime, Utc};

use crate::cluster::ClusterStats;
use crate::{ClusterSummary, Likelihood};

/// Independent contributors saturate coverage at three users.
pub const COVERAGE_SATURATION_USERS: f64 = 3.0;

/// Hit counts saturate at ten.
pub const HITS_SATURATION: f64 = 10.0;

/// Intensity below this z adds nothing; ten z above it saturates.
const INTENSITY_FLOOR: f64 = 5.0;
const INTENSITY_RANGE: f64 = 10.0;

/// Recency decay time constant in days (half-life ≈ 21 days).
pub const RECENCY_DECAY_DAYS: f64 = 30.0;

const W_COVERAGE: f64 = 0.45;
const W_HITS: f64 = 0.25;
const W_INTENSITY: f64 = 0.20;
const W_STABILITY: f64 = 0.10;

const PRIORITY_CONFIDENCE_WEIGHT: f64 = 0.7;
const PRIORITY_SEVERITY_WEIGHT: f64 = 0.3;

/// Confidence bands for the likelihood label.
pub const VERY_LIKELY_THRESHOLD: f64 = 0.66;
pub const LIKELY_THRESHOLD: f64 = 0.40;

/// Dashboard view keeps clusters at or above this percentile of the
/// current confidence distribution, with a floor on the threshold.
pub const DASHBOARD_PERCENTILE: f64 = 0.66;
pub const DASHBOARD_MIN_THRESHOLD: f64 = 0.40;

/// Score one cluster's statistics at the given reference time.
pub fn score_cluster(stats: &ClusterStats, now: DateTime<Utc>) -> ClusterSummary {
    let coverage = (stats.users as f64 / COVERAGE_SATURATION_USERS).min(1.0);
    let hits_n = (stats.hits as f64 / HITS_SATURATION).min(1.0);
    let intensity_n = ((stats.avg_intensity - INTENSITY_FLOOR) / INTENSITY_RANGE).clamp(0.0, 1.0);
    let stability_n = stats.avg_stability.clamp(0.0, 1.0);

    let delta_days =
        ((now - stats.last_seen).num_milliseconds() as f64 / 86_400_000.0).max(0.0);
    let recency = (-delta_days / RECENCY_DECAY_DAYS).exp();

    let confidence = (W_COVERAGE * coverage
        + W_HITS * hits_n
        + W_INTENSITY * intensity_n
        + W_STABILITY * stability_n)
        * recency;

    // Severe bumps recorded on wobbly mounts are likely real but score
    // under-confident; the second term lifts them in the ranking.
    let priority = (PRIORITY_CONFIDENCE_WEIGHT * confidence
        + PRIORITY_SEVERITY_WEIGHT * intensity_n * (1.0 - stability_n))
        .clamp(0.0, 1.0);

    ClusterSummary {
        cluster_id: stats.cluster_id.clone(),
        latitude: stats.latitude,
        longitude: stats.longitude,
        hits: stats.hits,
        users: stats.users,
        last_seen: stats.last_seen,
        avg_intensity: stats.avg_intensity,
        avg_stability: stats.avg_stability,
        confidence,
        priority,
        likelihood: likelihood_for(confidence),
    }
}

/// Map a confidence value to its categorical band.
pub fn likelihood_for(confidence: f64) -> Likelihood {
    if confidence >= VERY_LIKELY_THRESHOLD {
        Likelihood::VeryLikely
    } else if confidence >= LIKELY_THRESHOLD {
        Likelihood::Likely
    } else {
        Likelihood::Uncertain
    }
}

/// Linearly interpolated percentile over unsorted values.
/// Returns 0.0 for an empty slice.
pub fn percentile(values: &[f64], q: f64) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));

    let rank = q.clamp(0.0, 1.0) * (sorted.len() - 1) as f64;
    let lo = rank.floor() as usize;
    let hi = rank.ceil() as usize;
    if lo == hi {
        sorted[lo]
    } else {
        let frac = rank - lo as f64;
        sorted[lo] * (1.0 - frac) + sorted[hi] * frac
    }
}

/// The confidence cutoff for the high-priority dashboard view.
pub fn dashboard_threshold(confidences: &[f64]) -> f64 {
    percentile(confidences, DASHBOARD_PERCENTILE).max(DASHBOARD_MIN_THRESHOLD)
}
