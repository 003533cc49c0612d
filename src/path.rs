//! Paths: ordered sequences of oriented edges.
//!
//! A [`Path`] is the road-coordinate frame of an on-road belief: signed arc
//! length measured from the path origin, positive when the path is traversed
//! in edge-geometry direction and negative when backward. The distinguished
//! null path (no edges) denotes off-road motion.

use std::sync::Arc;

use crate::error::{Result, TrackingError};
use crate::geometry::{Polyline, COORD_EPS};
use crate::graph::{EdgeId, InferenceGraphSegment, InferredEdge};
use crate::motion::EDGE_LENGTH_ERROR_TOLERANCE;

use nalgebra::DVector;

/// An oriented placement of an edge segment on a path.
#[derive(Clone, Debug)]
pub struct PathEdge {
    segment: InferenceGraphSegment,
    dist_to_start: f64,
    is_backward: bool,
}

impl PathEdge {
    /// Invariant: the sign of `dist_to_start` matches the traversal
    /// direction (negative iff backward), except at the path origin where it
    /// is zero.
    pub fn new(
        segment: InferenceGraphSegment,
        dist_to_start: f64,
        is_backward: bool,
    ) -> Result<Self> {
        if dist_to_start != 0.0 && (dist_to_start < 0.0) != is_backward {
            return Err(TrackingError::Geometry(format!(
                "dist_to_start {dist_to_start} has the wrong sign for is_backward={is_backward}"
            )));
        }
        Ok(Self { segment, dist_to_start, is_backward })
    }

    /// The off-road sentinel edge.
    pub fn null_edge() -> Self {
        Self {
            segment: InferenceGraphSegment {
                edge: InferredEdge::null_edge(),
                geometry: Polyline::empty(),
                offset: 0.0,
            },
            dist_to_start: 0.0,
            is_backward: false,
        }
    }

    pub fn is_null(&self) -> bool {
        self.segment.edge.is_null()
    }

    pub fn edge(&self) -> &Arc<InferredEdge> {
        &self.segment.edge
    }

    pub fn edge_id(&self) -> EdgeId {
        self.segment.edge_id()
    }

    pub fn segment(&self) -> &InferenceGraphSegment {
        &self.segment
    }

    pub fn length(&self) -> f64 {
        self.segment.length()
    }

    pub fn dist_to_start(&self) -> f64 {
        self.dist_to_start
    }

    pub fn is_backward(&self) -> bool {
        self.is_backward
    }

    /// Segment geometry in edge direction.
    pub fn geometry(&self) -> &Polyline {
        &self.segment.geometry
    }

    /// Segment geometry in traversal direction.
    pub fn oriented_geometry(&self) -> Polyline {
        if self.is_backward {
            self.segment.geometry.reversed()
        } else {
            self.segment.geometry.clone()
        }
    }

    /// Whether the signed distance `s` falls on this edge:
    /// `|dist_to_start| ≤ |s| ≤ |dist_to_start| + length`.
    pub fn contains_signed(&self, s: f64) -> bool {
        if self.is_null() {
            return false;
        }
        let a = self.dist_to_start.abs();
        (a - COORD_EPS..=a + self.length() + COORD_EPS).contains(&s.abs())
    }
}

impl PartialEq for PathEdge {
    fn eq(&self, other: &Self) -> bool {
        self.edge_id() == other.edge_id()
            && self.segment.offset == other.segment.offset
            && self.dist_to_start == other.dist_to_start
            && self.is_backward == other.is_backward
    }
}

/// An ordered sequence of path edges forming a continuous polyline, or the
/// null path (off-road).
#[derive(Clone, Debug)]
pub struct Path {
    edges: Vec<PathEdge>,
    is_backward: bool,
    geometry: Polyline,
    total_distance: f64,
}

impl Path {
    /// Build a path, validating its invariants: one shared direction
    /// flag, zero distance at the origin, monotone cumulative distances and
    /// topologically adjacent geometry.
    pub fn new(edges: Vec<PathEdge>, is_backward: bool) -> Result<Self> {
        if edges.is_empty() {
            return Ok(Self::null_path());
        }
        let mut geometry: Option<Polyline> = None;
        let mut expected_dist = 0.0;
        for edge in &edges {
            if edge.is_null() {
                return Err(TrackingError::Geometry(
                    "null edge cannot appear on a non-null path".into(),
                ));
            }
            if edge.is_backward() != is_backward {
                return Err(TrackingError::Geometry(
                    "path edges must share the path direction".into(),
                ));
            }
            if (edge.dist_to_start().abs() - expected_dist).abs() > 1e-6 {
                return Err(TrackingError::Geometry(format!(
                    "edge at |{}| breaks cumulative distance {expected_dist}",
                    edge.dist_to_start().abs()
                )));
            }
            expected_dist += edge.length();
            let oriented = edge.oriented_geometry();
            geometry = Some(match geometry {
                None => oriented,
                Some(g) => g.concat(&oriented)?,
            });
        }
        let direction = if is_backward { -1.0 } else { 1.0 };
        Ok(Self {
            edges,
            is_backward,
            geometry: geometry.expect("at least one edge"),
            total_distance: direction * expected_dist,
        })
    }

    /// The off-road sentinel path.
    pub fn null_path() -> Self {
        Self {
            edges: Vec::new(),
            is_backward: false,
            geometry: Polyline::empty(),
            total_distance: 0.0,
        }
    }

    /// A single-edge forward path starting at the segment's start.
    pub fn from_segment(segment: InferenceGraphSegment) -> Self {
        let edge = PathEdge::new(segment, 0.0, false).expect("origin edge is valid");
        Self::new(vec![edge], false).expect("single-edge path is valid")
    }

    /// Build a path from segments listed in traversal order.
    pub fn from_segments(segments: Vec<InferenceGraphSegment>, is_backward: bool) -> Result<Self> {
        let direction = if is_backward { -1.0 } else { 1.0 };
        let mut dist = 0.0;
        let mut edges = Vec::with_capacity(segments.len());
        for segment in segments {
            let length = segment.length();
            edges.push(PathEdge::new(segment, direction * dist, is_backward)?);
            dist += length;
        }
        Self::new(edges, is_backward)
    }

    pub fn is_null(&self) -> bool {
        self.edges.is_empty()
    }

    pub fn edges(&self) -> &[PathEdge] {
        &self.edges
    }

    pub fn is_backward(&self) -> bool {
        self.is_backward
    }

    /// Signed total path distance (negative on backward paths).
    pub fn total_distance(&self) -> f64 {
        self.total_distance
    }

    /// Concatenated traversal-direction geometry; empty for the null path.
    pub fn geometry(&self) -> &Polyline {
        &self.geometry
    }

    /// Clip a signed distance to the path's signed range.
    pub fn clamp_to_path(&self, s: f64) -> f64 {
        if self.is_null() {
            return s;
        }
        if self.is_backward {
            s.clamp(self.total_distance, 0.0)
        } else {
            s.clamp(0.0, self.total_distance)
        }
    }

    /// Whether a signed distance lies on the path within the edge-length
    /// error tolerance.
    pub fn is_on_path(&self, s: f64) -> bool {
        if self.is_null() {
            return false;
        }
        (self.clamp_to_path(s) - s).abs() <= EDGE_LENGTH_ERROR_TOLERANCE
    }

    /// The last edge whose signed range contains `s`; positions at an edge
    /// boundary belong to the later edge. Off the path end, the terminal
    /// edge is returned. The null path yields the null edge.
    pub fn edge_for_distance(&self, s: f64) -> PathEdge {
        if self.is_null() {
            return PathEdge::null_edge();
        }
        self.edges
            .iter()
            .rev()
            .find(|e| e.contains_signed(s))
            .cloned()
            .unwrap_or_else(|| {
                if s.abs() <= self.edges[0].length() {
                    self.edges[0].clone()
                } else {
                    self.edges.last().expect("non-null path").clone()
                }
            })
    }

    /// Snap a road state's position onto the path when it lies within the
    /// tolerance of either end; reject it otherwise.
    pub fn adjust_for_direction(&self, state: &DVector<f64>) -> Result<DVector<f64>> {
        debug_assert!(!self.is_null());
        let mut adjusted = state.clone();
        let direction = if self.is_backward { -1.0 } else { 1.0 };
        let distance = adjusted[0];
        let over_end = direction * distance - self.total_distance.abs();
        if over_end > 0.0 {
            if over_end > EDGE_LENGTH_ERROR_TOLERANCE {
                return Err(TrackingError::OffPath {
                    position: distance,
                    total_distance: self.total_distance,
                });
            }
            adjusted[0] = self.total_distance;
        } else if direction * distance < 0.0 {
            if direction * distance < -EDGE_LENGTH_ERROR_TOLERANCE {
                return Err(TrackingError::OffPath {
                    position: distance,
                    total_distance: self.total_distance,
                });
            }
            adjusted[0] = 0.0;
        }
        Ok(adjusted)
    }
}

impl PartialEq for Path {
    fn eq(&self, other: &Self) -> bool {
        self.is_backward == other.is_backward && self.edges == other.edges
    }
}
