//! Per-trip bump detection.
//!
//! From one normalized trip, emits detection events for bumps that are
//! large vertical-acceleration excursions, while the vehicle is moving,
//! while the phone is reasonably stable, and not double-counted within
//! the debounce window.
//!
//! The stages are deliberately simple and explainable:
//!
//! 1. Fuse accel onto the gyro-paced sample stream (last-known accel
//!    with a staleness bound, never array-index alignment).
//! 2. Estimate the device's vertical axis from the trip-mean accel
//!    vector and project acceleration onto it.
//! 3. Score mount stability from smoothed gyro jitter.
//! 4. Score each sample with a robust z against a trailing median/MAD
//!    window.
//! 5. Gate candidates on z, speed, stability, and GPS fix quality, then
//!    debounce with largest-z peak selection.

use chrono::{DateTime, Utc};
use log::{debug, info};

use crate::signal::{dot3, mean3, norm3, TrailingMeanWindow, TrailingRobustWindow};
use crate::trip::NormalizedTrip;
use crate::{DetectionEvent, GpsPoint};

/// Scale factor that makes MAD a consistent estimator of the standard
/// deviation under normality.
pub const NORMAL_MAD_SCALE: f64 = 1.4826;

/// Floor added to the scaled MAD so a dead-flat window cannot divide by
/// zero.
pub const MAD_EPSILON: f64 = 1e-3;

/// Tunable parameters of the per-trip detector.
///
/// Every threshold the pipeline applies is a named field here; nothing is
/// buried in the walk itself.
#[derive(Debug, Clone)]
pub struct DetectorConfig {
    /// Maximum age of a carried-forward accel reading when fusing onto a
    /// gyro-bearing sample. Default: 50 ms.
    pub fusion_max_age_ms: i64,

    /// Trailing window over which gyro magnitude is smoothed into the
    /// jitter estimate. Default: 1000 ms.
    pub jitter_window_ms: i64,

    /// Exponential decay rate mapping jitter (rad/s) to stability, so
    /// 1.0 rad/s of sustained rotation maps to stability ≈ 0.37.
    /// Default: 1.0.
    pub stability_decay: f64,

    /// Trailing window for the robust z-score statistics. Default: 10 s.
    pub zscore_window_ms: i64,

    /// Minimum values the z window must hold before any candidate can
    /// fire. Default: 50.
    pub min_window_samples: usize,

    /// Robust z-score threshold for a candidate bump. Default: 5.0.
    pub z_threshold: f64,

    /// Minimum speed for a candidate; filters out idling and parking
    /// lot jostle. Default: 2.0 m/s.
    pub min_speed_mps: f64,

    /// Minimum stability for a candidate; filters hand-held flailing.
    /// Default: 0.5.
    pub min_stability: f64,

    /// Worst acceptable GPS accuracy for an emitted event. Default: 25 m.
    pub max_accuracy_m: f64,

    /// Maximum age of the last GPS fix for an emitted event.
    /// Default: 2000 ms.
    pub max_fix_age_ms: i64,

    /// Minimum separation between two emitted events. Default: 700 ms.
    pub debounce_ms: i64,

    /// Minimum magnitude of the trip-mean accel vector for the vertical
    /// axis estimate to be usable. Below this the phone orientation is
    /// unknown and the trip yields zero detections. Default: 4.0 m/s².
    pub min_gravity_mss: f64,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            fusion_max_age_ms: 50,
            jitter_window_ms: 1_000,
            stability_decay: 1.0,
            zscore_window_ms: 10_000,
            min_window_samples: 50,
            z_threshold: 5.0,
            min_speed_mps: 2.0,
            min_stability: 0.5,
            max_accuracy_m: 25.0,
            max_fix_age_ms: 2_000,
            debounce_ms: 700,
            min_gravity_mss: 4.0,
        }
    }
}

/// Per-sample derived signals, aligned with the normalized sample
/// sequence. Shared with the roughness analysis.
#[derive(Debug, Clone)]
pub(crate) struct SignalRow {
    pub wall_time: DateTime<Utc>,
    pub uptime_ms: i64,
    /// The sample's own position, if it carried one.
    pub position: Option<GpsPoint>,
    /// Robust z of vertical acceleration; absent while the window warms
    /// up, when no accel was fusable, or when orientation is unknown.
    pub z: Option<f64>,
    /// Mount stability in [0, 1]; 1 = rigid.
    pub stability: f64,
}

/// Last-known GPS fix, carried as explicit state alongside the walk.
#[derive(Debug, Clone, Copy)]
struct LastFix {
    point: GpsPoint,
    accuracy_m: Option<f64>,
    speed_mps: Option<f64>,
    uptime_ms: i64,
}

#[derive(Debug, Clone)]
struct Candidate {
    row_idx: usize,
    uptime_ms: i64,
    z: f64,
    stability: f64,
    point: GpsPoint,
    speed_mps: f64,
}

/// Compute the per-sample signal rows for one trip: fused accel, vertical
/// projection, jitter-based stability, and robust z.
pub(crate) fn compute_signal_rows(trip: &NormalizedTrip, config: &DetectorConfig) -> Vec<SignalRow> {
    // Fusion pass: carry the most recent accel onto each gyro-paced
    // sample, bounded by staleness.
    let mut fused: Vec<Option<[f64; 3]>> = Vec::with_capacity(trip.samples.len());
    let mut last_accel: Option<([f64; 3], i64)> = None;
    for s in &trip.samples {
        if let Some(a) = s.accel {
            last_accel = Some((a, s.uptime_ms));
        }
        fused.push(match last_accel {
            Some((a, t)) if s.uptime_ms - t <= config.fusion_max_age_ms => Some(a),
            _ => None,
        });
    }

    // Vertical axis: trip-mean accel approximates gravity. A weak mean
    // means the orientation kept changing; no usable vertical exists.
    let axis = mean3(fused.iter().flatten());
    let axis = match axis {
        Some(mean) if norm3(&mean) >= config.min_gravity_mss => {
            let n = norm3(&mean);
            Some([mean[0] / n, mean[1] / n, mean[2] / n])
        }
        _ => {
            debug!(
                "[Detector] trip {}: no usable vertical axis, skipping z",
                trip.trip_id
            );
            None
        }
    };

    // Zero-center the vertical projection over the trip.
    let raw_vertical: Vec<Option<f64>> = match axis {
        Some(u) => fused
            .iter()
            .map(|a| a.as_ref().map(|a| dot3(a, &u)))
            .collect(),
        None => vec![None; fused.len()],
    };
    let (sum, count) = raw_vertical
        .iter()
        .flatten()
        .fold((0.0, 0usize), |(s, c), v| (s + v, c + 1));
    let vertical_mean = if count > 0 { sum / count as f64 } else { 0.0 };

    let mut jitter_window = TrailingMeanWindow::new(config.jitter_window_ms);
    let mut z_window = TrailingRobustWindow::new(config.zscore_window_ms);
    let mut rows = Vec::with_capacity(trip.samples.len());

    for (i, s) in trip.samples.iter().enumerate() {
        let jitter = jitter_window.push(s.uptime_ms, norm3(&s.gyro));
        let stability = (-config.stability_decay * jitter).exp().clamp(0.0, 1.0);

        let z = raw_vertical[i].and_then(|raw| {
            let a_v = raw - vertical_mean;
            z_window.push(s.uptime_ms, a_v);
            if z_window.len() < config.min_window_samples {
                return None;
            }
            let (median, mad) = z_window.median_and_mad()?;
            Some((a_v - median).abs() / (NORMAL_MAD_SCALE * mad + MAD_EPSILON))
        });

        rows.push(SignalRow {
            wall_time: s.wall_time,
            uptime_ms: s.uptime_ms,
            position: s.position,
            z,
            stability,
        });
    }

    rows
}

/// Run the detector over one normalized trip.
///
/// A trip that produces zero detections is a valid outcome, not an
/// error. Emitted events are strictly time-ordered and separated by at
/// least the debounce interval.
pub fn detect_trip(trip: &NormalizedTrip, config: &DetectorConfig) -> Vec<DetectionEvent> {
    let rows = compute_signal_rows(trip, config);

    // Candidate gate, with the last GPS fix tracked as explicit state.
    let mut candidates: Vec<Candidate> = Vec::new();
    let mut last_fix: Option<LastFix> = None;

    for (i, s) in trip.samples.iter().enumerate() {
        if let Some(point) = s.position {
            last_fix = Some(LastFix {
                point,
                accuracy_m: s.accuracy_m,
                speed_mps: s.speed_mps,
                uptime_ms: s.uptime_ms,
            });
        }

        let row = &rows[i];
        let z = match row.z {
            Some(z) if z >= config.z_threshold => z,
            _ => continue,
        };
        if row.stability < config.min_stability {
            continue;
        }

        let fix = match last_fix {
            Some(f) if s.uptime_ms - f.uptime_ms <= config.max_fix_age_ms => f,
            _ => continue,
        };
        match fix.accuracy_m {
            Some(acc) if acc <= config.max_accuracy_m => {}
            _ => continue,
        }
        let speed = match fix.speed_mps {
            Some(v) if v >= config.min_speed_mps => v,
            _ => continue,
        };

        candidates.push(Candidate {
            row_idx: i,
            uptime_ms: s.uptime_ms,
            z,
            stability: row.stability,
            point: fix.point,
            speed_mps: speed,
        });
    }

    let picked = debounce(&candidates, config.debounce_ms);
    let events: Vec<DetectionEvent> = picked
        .iter()
        .map(|&idx| {
            let c = &candidates[idx];
            DetectionEvent {
                trip_id: trip.trip_id.clone(),
                user_id: trip.user_id.clone(),
                wall_time: rows[c.row_idx].wall_time,
                latitude: c.point.latitude,
                longitude: c.point.longitude,
                intensity: c.z,
                stability: c.stability,
                speed_mps: c.speed_mps,
            }
        })
        .collect();

    info!(
        "[Detector] trip {}: {} detections from {} samples ({} candidates)",
        trip.trip_id,
        events.len(),
        trip.samples.len(),
        candidates.len()
    );

    events
}

/// Debounce candidates: the first candidate opens a window, the
/// largest-z candidate inside it becomes the event (ties go to the
/// earliest), and suppression runs one debounce interval from the
/// emitted event's time. Returns indices into `candidates`.
fn debounce(candidates: &[Candidate], debounce_ms: i64) -> Vec<usize> {
    let mut picked = Vec::new();
    let mut i = 0;
    while i < candidates.len() {
        let window_end = candidates[i].uptime_ms + debounce_ms;
        let mut best = i;
        let mut j = i + 1;
        while j < candidates.len() && candidates[j].uptime_ms < window_end {
            if candidates[j].z > candidates[best].z {
                best = j;
            }
            j += 1;
        }
        picked.push(best);

        let suppress_until = candidates[best].uptime_ms + debounce_ms;
        i = j;
        while i < candidates.len() && candidates[i].uptime_ms < suppress_until {
            i += 1;
        }
    }
    picked
}
