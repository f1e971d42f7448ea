//! Trip document model and sample normalization.
//!
//! A trip arrives as one JSON document recorded by the mobile collector.
//! This module parses it into a validated, uptime-ordered [`Sample`]
//! sequence. The gyroscope is the alignment beat for everything
//! downstream: a sample without a valid gyro reading is dropped, and a
//! trip with fewer than [`MIN_GYRO_SAMPLES`] usable samples is rejected.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{PipelineError, Result};
use crate::GpsPoint;

/// Minimum number of gyro-bearing samples for a trip to be processable.
pub const MIN_GYRO_SAMPLES: usize = 50;

/// Largest tolerated backward wall-clock jump within a trip, in
/// milliseconds. Small regressions happen on NTP adjustments; anything
/// bigger is a corrupt sample.
pub const MAX_WALL_REGRESSION_MS: i64 = 5_000;

/// A wall-clock timestamp as it appears on the wire: either an ISO-8601
/// string or integer milliseconds since the Unix epoch.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum WireTimestamp {
    Iso(String),
    Millis(i64),
}

impl WireTimestamp {
    /// Resolve to a UTC instant. Returns `None` for unparseable strings
    /// or out-of-range millisecond values.
    pub fn to_utc(&self) -> Option<DateTime<Utc>> {
        match self {
            WireTimestamp::Iso(s) => DateTime::parse_from_rfc3339(s)
                .ok()
                .map(|t| t.with_timezone(&Utc)),
            WireTimestamp::Millis(ms) => Utc.timestamp_millis_opt(*ms).single(),
        }
    }
}

/// One raw sample from the trip document, unvalidated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawSample {
    pub timestamp: WireTimestamp,
    pub uptime_ms: i64,
    #[serde(default)]
    pub latitude: Option<f64>,
    #[serde(default)]
    pub longitude: Option<f64>,
    #[serde(default)]
    pub accuracy_m: Option<f64>,
    #[serde(default)]
    pub speed_mps: Option<f64>,
    #[serde(default)]
    pub accel: Option<Vec<f64>>,
    #[serde(default)]
    pub gyro: Option<Vec<f64>>,
}

/// One trip document as uploaded by the collector.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TripDocument {
    pub user_id: String,
    pub trip_id: String,
    #[serde(default)]
    pub start_time: Option<WireTimestamp>,
    #[serde(default)]
    pub end_time: Option<WireTimestamp>,
    #[serde(default)]
    pub sample_count: Option<u64>,
    pub samples: Vec<RawSample>,
}

impl TripDocument {
    /// Parse a trip document from its JSON payload.
    pub fn from_json(payload: &str) -> Result<Self> {
        let doc: TripDocument = serde_json::from_str(payload)?;
        Ok(doc)
    }
}

/// A validated sample: gyro always present, position and accel optional.
#[derive(Debug, Clone)]
pub struct Sample {
    pub wall_time: DateTime<Utc>,
    /// Monotonic time since device boot. Non-decreasing within a trip.
    pub uptime_ms: i64,
    pub position: Option<GpsPoint>,
    pub accuracy_m: Option<f64>,
    pub speed_mps: Option<f64>,
    pub accel: Option<[f64; 3]>,
    pub gyro: [f64; 3],
}

/// A normalized trip: identifiers plus an uptime-ordered sample sequence.
#[derive(Debug, Clone)]
pub struct NormalizedTrip {
    pub user_id: String,
    pub trip_id: String,
    pub samples: Vec<Sample>,
}

fn finite_triple(values: &Option<Vec<f64>>) -> Option<[f64; 3]> {
    match values {
        Some(v) if v.len() == 3 && v.iter().all(|x| x.is_finite()) => Some([v[0], v[1], v[2]]),
        _ => None,
    }
}

fn valid_position(latitude: Option<f64>, longitude: Option<f64>) -> Option<GpsPoint> {
    match (latitude, longitude) {
        (Some(lat), Some(lng)) => {
            let p = GpsPoint::new(lat, lng);
            if p.is_valid() {
                Some(p)
            } else {
                None
            }
        }
        _ => None,
    }
}

fn non_negative(value: Option<f64>) -> Option<f64> {
    value.filter(|v| v.is_finite() && *v >= 0.0)
}

/// Normalize one trip document into a validated sample sequence.
///
/// Ordering is enforced with a one-pass monotonic filter on `uptime_ms`,
/// not a sort: a sample whose uptime falls below the running maximum is
/// dropped. The same pass drops samples whose wall clock jumps backward
/// by more than [`MAX_WALL_REGRESSION_MS`].
///
/// Fails with `InvalidTrip` if identifiers are missing, the sample array
/// is empty, or fewer than [`MIN_GYRO_SAMPLES`] samples survive.
pub fn normalize(doc: &TripDocument) -> Result<NormalizedTrip> {
    let trip_id = doc.trip_id.trim();
    let user_id = doc.user_id.trim();

    if trip_id.is_empty() {
        return Err(PipelineError::invalid_trip("", "trip_id is missing or empty"));
    }
    if user_id.is_empty() {
        return Err(PipelineError::invalid_trip(
            trip_id,
            "user_id is missing or empty",
        ));
    }
    if doc.samples.is_empty() {
        return Err(PipelineError::invalid_trip(trip_id, "samples array is empty"));
    }

    let mut samples: Vec<Sample> = Vec::with_capacity(doc.samples.len());
    let mut max_uptime = i64::MIN;
    let mut max_wall: Option<DateTime<Utc>> = None;

    for raw in &doc.samples {
        // Gyro is mandatory: without it the sample cannot be fused.
        let gyro = match finite_triple(&raw.gyro) {
            Some(g) => g,
            None => continue,
        };

        let wall_time = match raw.timestamp.to_utc() {
            Some(t) => t,
            None => continue,
        };

        if raw.uptime_ms < max_uptime {
            continue;
        }
        if let Some(prev) = max_wall {
            if (prev - wall_time).num_milliseconds() > MAX_WALL_REGRESSION_MS {
                continue;
            }
        }

        max_uptime = raw.uptime_ms;
        max_wall = Some(max_wall.map_or(wall_time, |prev| prev.max(wall_time)));

        samples.push(Sample {
            wall_time,
            uptime_ms: raw.uptime_ms,
            position: valid_position(raw.latitude, raw.longitude),
            accuracy_m: non_negative(raw.accuracy_m),
            speed_mps: non_negative(raw.speed_mps),
            accel: finite_triple(&raw.accel),
            gyro,
        });
    }

    if samples.len() < MIN_GYRO_SAMPLES {
        return Err(PipelineError::invalid_trip(
            trip_id,
            format!(
                "{} usable samples, minimum {} required",
                samples.len(),
                MIN_GYRO_SAMPLES
            ),
        ));
    }

    Ok(NormalizedTrip {
        user_id: user_id.to_string(),
        trip_id: trip_id.to_string(),
        samples,
    })
}
