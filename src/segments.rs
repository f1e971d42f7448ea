//! Rough-road segment analysis.
//!
//! A second, independent reading of the same per-sample signals: instead
//! of hunting isolated spikes, this path measures sustained roughness.
//! Samples from stable mounts are bucketed into ~40 m grid cells and each
//! well-populated cell is summarized by the RMS of its robust z values.
//! High RMS without individual spikes is the signature of a degraded
//! surface rather than a single defect.
//!
//! This path shares the detector's signal rows but touches neither the
//! detection store nor the cluster pipeline.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::detector::{compute_signal_rows, DetectorConfig};
use crate::trip::NormalizedTrip;

/// Parameters of the roughness analysis.
#[derive(Debug, Clone)]
pub struct RoughnessConfig {
    /// Grid cell edge length in meters. Default: 40.
    pub cell_size_m: f64,
    /// Minimum samples a cell needs before it is reported. Default: 10.
    pub min_cell_samples: usize,
    /// Minimum mount stability for a sample to participate; shaky
    /// mounts fake roughness. Default: 0.6.
    pub min_stability: f64,
}

impl Default for RoughnessConfig {
    fn default() -> Self {
        Self {
            cell_size_m: 40.0,
            min_cell_samples: 10,
            min_stability: 0.6,
        }
    }
}

/// One rough-road segment: a grid cell with sustained vibration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoughSegment {
    /// Deterministic id derived from the grid cell.
    pub segment_id: String,
    pub latitude: f64,
    pub longitude: f64,
    /// RMS of robust z over the cell's samples.
    pub roughness: f64,
    /// Number of samples contributing to the cell.
    pub window_count: usize,
    pub last_seen: DateTime<Utc>,
}

/// Meters per degree of latitude, for the cell grid.
const METERS_PER_DEGREE: f64 = 111_111.0;

/// Compute rough-road segments for one normalized trip.
pub fn compute_rough_segments(
    trip: &NormalizedTrip,
    detector_config: &DetectorConfig,
    config: &RoughnessConfig,
) -> Vec<RoughSegment> {
    let rows = compute_signal_rows(trip, detector_config);
    let cell_deg = config.cell_size_m / METERS_PER_DEGREE;

    struct CellAcc {
        sum_sq_z: f64,
        sum_lat: f64,
        sum_lng: f64,
        count: usize,
        last_seen: DateTime<Utc>,
    }

    let mut cells: HashMap<(i64, i64), CellAcc> = HashMap::new();

    for row in &rows {
        let point = match row.position {
            Some(p) => p,
            None => continue,
        };
        let z = match row.z {
            Some(z) => z,
            None => continue,
        };
        if row.stability < config.min_stability {
            continue;
        }

        let key = (
            (point.latitude / cell_deg).round() as i64,
            (point.longitude / cell_deg).round() as i64,
        );
        let acc = cells.entry(key).or_insert(CellAcc {
            sum_sq_z: 0.0,
            sum_lat: 0.0,
            sum_lng: 0.0,
            count: 0,
            last_seen: row.wall_time,
        });
        acc.sum_sq_z += z * z;
        acc.sum_lat += point.latitude;
        acc.sum_lng += point.longitude;
        acc.count += 1;
        acc.last_seen = acc.last_seen.max(row.wall_time);
    }

    let mut segments: Vec<RoughSegment> = cells
        .into_iter()
        .filter(|(_, acc)| acc.count >= config.min_cell_samples)
        .map(|((lat_cell, lng_cell), acc)| {
            let n = acc.count as f64;
            let mut hasher = Sha256::new();
            hasher.update(format!("{}:{}", lat_cell, lng_cell).as_bytes());
            let digest = hasher.finalize();
            let segment_id: String = digest[..16].iter().map(|b| format!("{:02x}", b)).collect();

            RoughSegment {
                segment_id,
                latitude: acc.sum_lat / n,
                longitude: acc.sum_lng / n,
                roughness: (acc.sum_sq_z / n).sqrt(),
                window_count: acc.count,
                last_seen: acc.last_seen,
            }
        })
        .collect();

    segments.sort_by(|a, b| {
        b.roughness
            .partial_cmp(&a.roughness)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    segments
}
