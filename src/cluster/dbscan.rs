//! R-tree backed DBSCAN over WGS-84 coordinates.
//!
//! Neighborhood lookups go through an R-tree envelope query in degree
//! space sized conservatively from the radius, then every candidate is
//! verified with exact haversine distance. Raw euclidean distance on
//! degrees is never used, so the result matches reference DBSCAN at any
//! latitude while staying far from O(n²).

use std::collections::VecDeque;

use rstar::{PointDistance, RTree, RTreeObject, AABB};

use crate::geo_utils::{haversine_distance, meters_to_degrees};
use crate::GpsPoint;

/// DBSCAN label for points that belong to no cluster.
pub(crate) const NOISE: i32 = -1;
const UNVISITED: i32 = -2;

/// A point with its index into the caller's slice, for R-tree queries.
#[derive(Debug, Clone, Copy)]
pub(crate) struct IndexedPoint {
    pub idx: usize,
    pub lat: f64,
    pub lng: f64,
}

impl RTreeObject for IndexedPoint {
    type Envelope = AABB<[f64; 2]>;

    fn envelope(&self) -> Self::Envelope {
        AABB::from_point([self.lat, self.lng])
    }
}

impl PointDistance for IndexedPoint {
    fn distance_2(&self, point: &[f64; 2]) -> f64 {
        let dlat = self.lat - point[0];
        let dlng = self.lng - point[1];
        dlat * dlat + dlng * dlng
    }
}

/// Build an R-tree over the given points.
pub(crate) fn build_rtree(points: &[GpsPoint]) -> RTree<IndexedPoint> {
    let indexed: Vec<IndexedPoint> = points
        .iter()
        .enumerate()
        .map(|(i, p)| IndexedPoint {
            idx: i,
            lat: p.latitude,
            lng: p.longitude,
        })
        .collect();
    RTree::bulk_load(indexed)
}

/// All points within `eps_m` meters of `points[center]`, including the
/// center itself.
fn region_query(
    tree: &RTree<IndexedPoint>,
    points: &[GpsPoint],
    center: usize,
    eps_m: f64,
) -> Vec<usize> {
    let p = points[center];
    // Degree spans are never under-sized, so the envelope cannot miss a
    // neighbor; the haversine check below discards the over-fetch.
    let dlat = meters_to_degrees(eps_m, 0.0);
    let dlng = meters_to_degrees(eps_m, p.latitude);
    let envelope = AABB::from_corners(
        [p.latitude - dlat, p.longitude - dlng],
        [p.latitude + dlat, p.longitude + dlng],
    );

    tree.locate_in_envelope(&envelope)
        .filter(|cand| haversine_distance(&p, &points[cand.idx]) <= eps_m)
        .map(|cand| cand.idx)
        .collect()
}

/// Label each point with a cluster id (0..) or [`NOISE`].
///
/// Classic DBSCAN with breadth-first cluster expansion. Cluster numbering
/// follows the order of `points`, so callers wanting order-independent
/// output sort their input canonically first.
pub(crate) fn dbscan(points: &[GpsPoint], eps_m: f64, min_pts: usize) -> Vec<i32> {
    let tree = build_rtree(points);
    let mut labels = vec![UNVISITED; points.len()];
    let mut next_cluster: i32 = 0;

    for i in 0..points.len() {
        if labels[i] != UNVISITED {
            continue;
        }

        let neighbors = region_query(&tree, points, i, eps_m);
        if neighbors.len() < min_pts {
            labels[i] = NOISE;
            continue;
        }

        labels[i] = next_cluster;
        let mut queue: VecDeque<usize> = neighbors.into_iter().collect();

        while let Some(j) = queue.pop_front() {
            if labels[j] == NOISE {
                // Border point reached from a core point
                labels[j] = next_cluster;
                continue;
            }
            if labels[j] != UNVISITED {
                continue;
            }
            labels[j] = next_cluster;

            let expansion = region_query(&tree, points, j, eps_m);
            if expansion.len() >= min_pts {
                queue.extend(expansion);
            }
        }

        next_cluster += 1;
    }

    labels
}
