//! End-to-end pipeline tests.
//!
//! Drives the full flow (trip document -> ingest -> detection store ->
//! cluster query) over synthetic trips with known ground truth: flat
//! roads, injected bumps, multiple users over one pothole, stale
//! evidence, hand-held phones, and debounce timing.
//!
//! Trips are generated deterministically (LCG noise, fixed layouts) so
//! every assertion is reproducible.

use chrono::{DateTime, Duration as ChronoDuration, Utc};

use roadwatch::geo_utils::haversine_distance;
use roadwatch::{
    ClusterQuery, GpsPoint, Likelihood, PipelineEngine, PipelineError, RawSample, SqliteStore,
    TripDocument, WireTimestamp,
};

const SAMPLE_PERIOD_MS: i64 = 50; // 20 Hz
const SPEED_MPS: f64 = 10.0;
const DEG_PER_METER_LAT: f64 = 1.0 / 111_320.0;

/// Small deterministic noise source, uniform in [-1, 1].
struct Lcg(u64);

impl Lcg {
    fn new(seed: u64) -> Self {
        Self(seed.wrapping_mul(2_862_933_555_777_941_757).wrapping_add(3_037_000_493))
    }

    fn next_unit(&mut self) -> f64 {
        self.0 = self
            .0
            .wrapping_mul(6_364_136_223_846_793_005)
            .wrapping_add(1_442_695_040_888_963_407);
        let mantissa = (self.0 >> 11) as f64 / (1u64 << 53) as f64;
        mantissa * 2.0 - 1.0
    }
}

struct TripSpec {
    trip_id: String,
    user_id: String,
    start: DateTime<Utc>,
    samples: usize,
    /// Where the vehicle is at `bump_at`; the route passes through it.
    target: GpsPoint,
    /// Sample index anchoring the route to `target`.
    bump_at: usize,
    /// (sample index, extra vertical accel) spikes to inject.
    bumps: Vec<(usize, f64)>,
    gyro_mag: f64,
}

impl TripSpec {
    fn new(trip_id: &str, user_id: &str, start: DateTime<Utc>, target: GpsPoint) -> Self {
        Self {
            trip_id: trip_id.to_string(),
            user_id: user_id.to_string(),
            start,
            samples: 6_000, // 5 minutes at 20 Hz
            target,
            bump_at: 2_400, // t = 120 s
            bumps: Vec::new(),
            gyro_mag: 0.0,
        }
    }

    fn with_bump(mut self, at: usize, magnitude: f64) -> Self {
        self.bumps.push((at, magnitude));
        self
    }

    fn with_gyro(mut self, magnitude: f64) -> Self {
        self.gyro_mag = magnitude;
        self
    }

    fn with_samples(mut self, n: usize) -> Self {
        self.samples = n;
        self
    }

    /// A straight drive north at constant speed, flat accel baseline
    /// with deterministic noise, quiet (or sustained) gyro.
    fn build(&self) -> TripDocument {
        let mut rng = Lcg::new(self.trip_id.bytes().map(u64::from).sum());
        let start_ms = self.start.timestamp_millis();
        let step_deg = SPEED_MPS * (SAMPLE_PERIOD_MS as f64 / 1000.0) * DEG_PER_METER_LAT;

        let samples = (0..self.samples)
            .map(|i| {
                let mut az = 9.81 + 0.05 * rng.next_unit();
                if let Some(&(_, magnitude)) =
                    self.bumps.iter().find(|(at, _)| *at == i)
                {
                    az += magnitude;
                }
                let lat = self.target.latitude
                    + (i as f64 - self.bump_at as f64) * step_deg;

                RawSample {
                    timestamp: WireTimestamp::Millis(start_ms + i as i64 * SAMPLE_PERIOD_MS),
                    uptime_ms: 500_000 + i as i64 * SAMPLE_PERIOD_MS,
                    latitude: Some(lat),
                    longitude: Some(self.target.longitude),
                    accuracy_m: Some(6.0),
                    speed_mps: Some(SPEED_MPS),
                    accel: Some(vec![0.0, 0.0, az]),
                    gyro: Some(vec![self.gyro_mag, 0.0, 0.0]),
                }
            })
            .collect();

        TripDocument {
            user_id: self.user_id.clone(),
            trip_id: self.trip_id.clone(),
            start_time: Some(WireTimestamp::Millis(start_ms)),
            end_time: None,
            sample_count: Some(self.samples as u64),
            samples,
        }
    }
}

fn engine() -> PipelineEngine<SqliteStore> {
    PipelineEngine::new(SqliteStore::in_memory().expect("in-memory store"))
}

fn pothole() -> GpsPoint {
    GpsPoint::new(33.8886, 35.4955)
}

fn offset_north(base: &GpsPoint, meters: f64) -> GpsPoint {
    GpsPoint::new(base.latitude + meters * DEG_PER_METER_LAT, base.longitude)
}

// ============================================================================
// Scenario 1: flat calibration trip
// ============================================================================

#[test]
fn test_flat_trip_yields_no_detections_or_clusters() {
    let mut engine = engine();
    let start = Utc::now() - ChronoDuration::hours(1);

    let summary = engine
        .ingest(TripSpec::new("flat-1", "u1", start, pothole()).build())
        .unwrap();

    assert_eq!(summary.detection_count, 0);
    let clusters = engine.query_clusters(&ClusterQuery::default()).unwrap();
    assert!(clusters.is_empty());
}

// ============================================================================
// Scenario 2: single sharp bump
// ============================================================================

#[test]
fn test_single_bump_detected_but_singleton_is_noise() {
    let mut engine = engine();
    let start = Utc::now() - ChronoDuration::hours(1);

    let doc = TripSpec::new("bump-1", "u1", start, pothole())
        .with_bump(2_400, 25.0)
        .with_bump(2_401, 25.0) // ~80 ms of excursion at 20 Hz
        .build();
    let summary = engine.ingest(doc).unwrap();

    assert_eq!(summary.detection_count, 1);
    let events = engine.query_detections(10, 0).unwrap();
    assert_eq!(events.len(), 1);
    assert!(events[0].intensity > 30.0);
    assert!(events[0].stability > 0.99);
    assert!(events[0].speed_mps >= 2.0);
    assert!(haversine_distance(
        &GpsPoint::new(events[0].latitude, events[0].longitude),
        &pothole()
    ) < 2.0);

    // A single detection has no dense neighborhood: DBSCAN noise
    let clusters = engine.query_clusters(&ClusterQuery::default()).unwrap();
    assert!(clusters.is_empty());
}

// ============================================================================
// Scenario 3: two users over one bump
// ============================================================================

#[test]
fn test_two_users_form_a_likely_cluster() {
    let mut engine = engine();
    let start = Utc::now() - ChronoDuration::hours(2);

    for (trip, user, jitter_m) in [("t1", "u1", -1.0), ("t2", "u2", 1.0)] {
        let target = offset_north(&pothole(), jitter_m);
        let doc = TripSpec::new(trip, user, start, target)
            .with_bump(2_400, 25.0)
            .build();
        engine.ingest(doc).unwrap();
    }

    let clusters = engine.query_clusters(&ClusterQuery::default()).unwrap();
    assert_eq!(clusters.len(), 1);

    let c = &clusters[0];
    assert_eq!(c.hits, 2);
    assert_eq!(c.users, 2);
    assert!(haversine_distance(&GpsPoint::new(c.latitude, c.longitude), &pothole()) < 2.0);
    assert!(c.confidence >= 0.4);
    assert_eq!(c.likelihood, Likelihood::Likely);
}

// ============================================================================
// Scenarios 4 and 5: saturated recent cluster vs. the same cluster aged
// ============================================================================

fn ingest_ten_traversals(engine: &mut PipelineEngine<SqliteStore>, age_base_days: i64) {
    let mut trip_no = 0;
    for (user, traversals) in [("u1", 4), ("u2", 3), ("u3", 3)] {
        for k in 0..traversals {
            trip_no += 1;
            let start = Utc::now()
                - ChronoDuration::days(age_base_days + (trip_no % 6))
                - ChronoDuration::hours(k as i64 + 1);
            let target = offset_north(&pothole(), (trip_no % 4) as f64 - 1.5);
            let doc = TripSpec::new(
                &format!("trip-{}-{}", user, k),
                user,
                start,
                target,
            )
            .with_bump(2_400, 25.0)
            .build();
            engine.ingest(doc).unwrap();
        }
    }
}

#[test]
fn test_three_users_ten_hits_recent_is_very_likely() {
    let mut engine = engine();
    ingest_ten_traversals(&mut engine, 0);

    let clusters = engine.query_clusters(&ClusterQuery::default()).unwrap();
    assert_eq!(clusters.len(), 1);

    let c = &clusters[0];
    assert_eq!(c.users, 3);
    assert_eq!(c.hits, 10);
    assert!(c.confidence >= 0.70);
    assert_eq!(c.likelihood, Likelihood::VeryLikely);
}

#[test]
fn test_old_detections_decay_to_uncertain() {
    let mut engine = engine();
    ingest_ten_traversals(&mut engine, 180);

    let clusters = engine.query_clusters(&ClusterQuery::default()).unwrap();
    assert_eq!(clusters.len(), 1);

    let c = &clusters[0];
    assert!(c.confidence <= 0.01);
    assert_eq!(c.likelihood, Likelihood::Uncertain);
}

// ============================================================================
// Scenario 6: hand-held phone
// ============================================================================

#[test]
fn test_handheld_phone_yields_no_detection() {
    let mut engine = engine();
    let start = Utc::now() - ChronoDuration::hours(1);

    let doc = TripSpec::new("hand-1", "u1", start, pothole())
        .with_bump(2_400, 25.0)
        .with_gyro(1.5)
        .build();
    let summary = engine.ingest(doc).unwrap();

    assert_eq!(summary.detection_count, 0);
}

// ============================================================================
// Scenario 7: debounce honored
// ============================================================================

#[test]
fn test_debounce_suppresses_middle_bump() {
    let mut engine = engine();
    let start = Utc::now() - ChronoDuration::hours(1);

    // Bumps at t = 120.0 s, 120.3 s, 121.0 s
    let doc = TripSpec::new("deb-1", "u1", start, pothole())
        .with_samples(3_000)
        .with_bump(2_400, 25.0)
        .with_bump(2_406, 20.0)
        .with_bump(2_420, 25.0)
        .build();
    let summary = engine.ingest(doc).unwrap();
    assert_eq!(summary.detection_count, 2);

    let mut events = engine.query_detections(10, 0).unwrap();
    events.reverse(); // query is newest-first
    let offsets: Vec<i64> = events
        .iter()
        .map(|e| e.wall_time.timestamp_millis() - start.timestamp_millis())
        .collect();
    assert_eq!(offsets, vec![120_000, 121_000]);
}

// ============================================================================
// Ingest idempotence
// ============================================================================

#[test]
fn test_reingest_replaces_rather_than_duplicates() {
    let mut engine = engine();
    let start = Utc::now() - ChronoDuration::hours(1);

    let doc = TripSpec::new("re-1", "u1", start, pothole())
        .with_bump(2_400, 25.0)
        .build();

    let first = engine.ingest(doc.clone()).unwrap();
    let before = engine.query_detections(100, 0).unwrap();

    let second = engine.ingest(doc).unwrap();
    let after = engine.query_detections(100, 0).unwrap();

    assert_eq!(first.detection_count, second.detection_count);
    assert_eq!(before.len(), after.len());
    assert_eq!(engine.detection_count().unwrap(), 1);
    assert_eq!(before[0].wall_time, after[0].wall_time);
    assert_eq!(before[0].latitude, after[0].latitude);
}

// ============================================================================
// Cluster determinism
// ============================================================================

#[test]
fn test_cluster_results_independent_of_ingest_order() {
    let start = Utc::now() - ChronoDuration::hours(3);
    let far_street = GpsPoint::new(33.9020, 35.5200);

    let docs: Vec<TripDocument> = vec![
        TripSpec::new("o1", "u1", start, offset_north(&pothole(), -1.0))
            .with_bump(2_400, 25.0)
            .build(),
        TripSpec::new("o2", "u2", start, offset_north(&pothole(), 1.0))
            .with_bump(2_400, 25.0)
            .build(),
        TripSpec::new("o3", "u3", start, offset_north(&far_street, -1.0))
            .with_bump(2_400, 25.0)
            .build(),
        TripSpec::new("o4", "u4", start, offset_north(&far_street, 1.0))
            .with_bump(2_400, 25.0)
            .build(),
    ];

    let mut forward = engine();
    for doc in &docs {
        forward.ingest(doc.clone()).unwrap();
    }
    let mut backward = engine();
    for doc in docs.iter().rev() {
        backward.ingest(doc.clone()).unwrap();
    }

    let a = forward.query_clusters(&ClusterQuery::default()).unwrap();
    let b = backward.query_clusters(&ClusterQuery::default()).unwrap();

    assert_eq!(a.len(), 2);
    assert_eq!(
        a.iter().map(|c| &c.cluster_id).collect::<Vec<_>>(),
        b.iter().map(|c| &c.cluster_id).collect::<Vec<_>>()
    );
    for (x, y) in a.iter().zip(&b) {
        assert_eq!(x.hits, y.hits);
        assert!((x.latitude - y.latitude).abs() < 1e-12);
        assert!((x.confidence - y.confidence).abs() < 1e-6);
    }

    // Repeat queries on one engine are stable too
    let again = forward.query_clusters(&ClusterQuery::default()).unwrap();
    assert_eq!(
        a.iter().map(|c| &c.cluster_id).collect::<Vec<_>>(),
        again.iter().map(|c| &c.cluster_id).collect::<Vec<_>>()
    );
}

// ============================================================================
// Dashboard filter
// ============================================================================

#[test]
fn test_dashboard_filter_keeps_only_top_confidence() {
    let mut engine = engine();

    // Strong cluster: three users, ten hits, fresh
    ingest_ten_traversals(&mut engine, 0);

    // Weaker cluster on another street: two users
    let start = Utc::now() - ChronoDuration::hours(2);
    let far_street = GpsPoint::new(33.9020, 35.5200);
    for (trip, user, jitter_m) in [("w1", "u8", -1.0), ("w2", "u9", 1.0)] {
        let doc = TripSpec::new(trip, user, start, offset_north(&far_street, jitter_m))
            .with_bump(2_400, 25.0)
            .build();
        engine.ingest(doc).unwrap();
    }

    let all = engine.query_clusters(&ClusterQuery::default()).unwrap();
    assert_eq!(all.len(), 2);

    let dashboard = engine
        .query_clusters(&ClusterQuery {
            dashboard: true,
            ..ClusterQuery::default()
        })
        .unwrap();
    assert_eq!(dashboard.len(), 1);
    assert_eq!(dashboard[0].users, 3);
    assert_eq!(dashboard[0].likelihood, Likelihood::VeryLikely);
}

// ============================================================================
// eps override and query validation
// ============================================================================

#[test]
fn test_eps_override_merges_nearby_singletons() {
    let mut engine = engine();
    let start = Utc::now() - ChronoDuration::hours(1);

    // Two detections 8 m apart: separate at eps=5, merged at eps=10
    for (trip, user, jitter_m) in [("e1", "u1", 0.0), ("e2", "u2", 8.0)] {
        let doc = TripSpec::new(trip, user, start, offset_north(&pothole(), jitter_m))
            .with_bump(2_400, 25.0)
            .build();
        engine.ingest(doc).unwrap();
    }

    let tight = engine.query_clusters(&ClusterQuery::default()).unwrap();
    assert!(tight.is_empty());

    let wide = engine
        .query_clusters(&ClusterQuery {
            eps_m: 10.0,
            ..ClusterQuery::default()
        })
        .unwrap();
    assert_eq!(wide.len(), 1);
    assert_eq!(wide[0].hits, 2);

    let err = engine.query_clusters(&ClusterQuery {
        eps_m: 0.0,
        ..ClusterQuery::default()
    });
    assert!(matches!(err, Err(PipelineError::InvalidQuery { .. })));
}

// ============================================================================
// Persistence across reopen
// ============================================================================

#[test]
fn test_detections_survive_store_reopen() {
    let dir = tempfile::TempDir::new().unwrap();
    let db_path = dir.path().join("roadwatch.db");
    let db_path = db_path.to_str().unwrap();
    let start = Utc::now() - ChronoDuration::hours(2);

    {
        let store = SqliteStore::open(db_path).unwrap();
        let mut engine = PipelineEngine::new(store);
        for (trip, user, jitter_m) in [("p1", "u1", -1.0), ("p2", "u2", 1.0)] {
            let doc = TripSpec::new(trip, user, start, offset_north(&pothole(), jitter_m))
                .with_bump(2_400, 25.0)
                .build();
            engine.ingest(doc).unwrap();
        }
    }

    let store = SqliteStore::open(db_path).unwrap();
    let mut engine = PipelineEngine::new(store);
    assert_eq!(engine.detection_count().unwrap(), 2);

    let clusters = engine.query_clusters(&ClusterQuery::default()).unwrap();
    assert_eq!(clusters.len(), 1);
    assert_eq!(clusters[0].users, 2);

    // The stored raw trip supports roughness reprocessing after reopen
    assert!(engine.rough_segments("p1").is_ok());
    assert!(matches!(
        engine.rough_segments("missing"),
        Err(PipelineError::InvalidQuery { .. })
    ));
}
