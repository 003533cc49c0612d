//! Road network abstraction.
//!
//! The estimator sees the road network through the [`InferenceGraph`] trait:
//! a covariance-scaled nearby-segment query plus edge adjacency. Edges are
//! immutable directed polylines; the distinguished null edge is a singleton
//! standing for off-road motion. [`PlanarGraph`] is a small in-memory
//! implementation sufficient for tests and embedding; production road-data
//! sources implement the trait themselves.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, OnceLock};

use crate::error::{Result, TrackingError};
use crate::gaussian::MultivariateGaussian;
use crate::geometry::{Coord, Polyline};
use crate::motion;

/// Stable identifier of a road edge. The null edge reserves `u64::MAX`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EdgeId(pub u64);

impl EdgeId {
    pub const NULL: EdgeId = EdgeId(u64::MAX);
}

impl fmt::Display for EdgeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if *self == EdgeId::NULL {
            write!(f, "null-edge")
        } else {
            write!(f, "edge-{}", self.0)
        }
    }
}

/// An immutable directed polyline on the road graph.
#[derive(Debug)]
pub struct InferredEdge {
    id: EdgeId,
    geometry: Polyline,
    length: f64,
    has_reverse: bool,
}

impl InferredEdge {
    pub fn new(id: EdgeId, geometry: Polyline, has_reverse: bool) -> Result<Arc<Self>> {
        if id == EdgeId::NULL {
            return Err(TrackingError::Geometry("null edge id is reserved".into()));
        }
        if geometry.is_empty() || geometry.length() <= 0.0 {
            return Err(TrackingError::Geometry(format!(
                "edge {id} requires nonzero-length geometry"
            )));
        }
        let length = geometry.length();
        Ok(Arc::new(Self { id, geometry, length, has_reverse }))
    }

    /// The off-road sentinel: zero length, no geometry, stable identity.
    pub fn null_edge() -> Arc<InferredEdge> {
        static NULL: OnceLock<Arc<InferredEdge>> = OnceLock::new();
        NULL.get_or_init(|| {
            Arc::new(InferredEdge {
                id: EdgeId::NULL,
                geometry: Polyline::empty(),
                length: 0.0,
                has_reverse: false,
            })
        })
        .clone()
    }

    pub fn id(&self) -> EdgeId {
        self.id
    }

    pub fn is_null(&self) -> bool {
        self.id == EdgeId::NULL
    }

    pub fn geometry(&self) -> &Polyline {
        &self.geometry
    }

    pub fn length(&self) -> f64 {
        self.length
    }

    pub fn has_reverse(&self) -> bool {
        self.has_reverse
    }

    pub fn start(&self) -> Coord {
        self.geometry.start()
    }

    pub fn end(&self) -> Coord {
        self.geometry.end()
    }

}

/// Split an edge into sub-segments whose arc lengths are bounded by
/// `target`. The concatenated geometry equals the original and the segment
/// offsets partition `[0, length]`. A non-positive or edge-covering target
/// yields the single whole-edge segment.
pub fn edge_segments(edge: &Arc<InferredEdge>, target: f64) -> Vec<InferenceGraphSegment> {
    if edge.is_null() {
        return Vec::new();
    }
    if target <= 0.0 || target >= edge.length {
        return vec![whole_segment(edge)];
    }
    let count = (edge.length / target).ceil() as usize;
    let piece = edge.length / count as f64;
    let mut out = Vec::with_capacity(count);
    for i in 0..count {
        let s0 = i as f64 * piece;
        let s1 = if i + 1 == count { edge.length } else { (i + 1) as f64 * piece };
        let geometry = edge
            .geometry
            .extract(s0, s1)
            .expect("segment bounds are interior to the edge");
        out.push(InferenceGraphSegment { edge: edge.clone(), geometry, offset: s0 });
    }
    out
}

/// The whole edge as a single segment.
pub fn whole_segment(edge: &Arc<InferredEdge>) -> InferenceGraphSegment {
    InferenceGraphSegment {
        edge: edge.clone(),
        geometry: edge.geometry.clone(),
        offset: 0.0,
    }
}

impl PartialEq for InferredEdge {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}
impl Eq for InferredEdge {}

/// A contiguous piece of an edge: the sub-geometry plus its arc offset from
/// the edge start.
#[derive(Clone, Debug)]
pub struct InferenceGraphSegment {
    pub edge: Arc<InferredEdge>,
    pub geometry: Polyline,
    pub offset: f64,
}

impl InferenceGraphSegment {
    pub fn length(&self) -> f64 {
        self.geometry.length()
    }

    pub fn edge_id(&self) -> EdgeId {
        self.edge.id()
    }
}

/// Read-only road network interface. Implementations must be safe under
/// concurrent readers; the estimator never mutates the graph.
pub trait InferenceGraph {
    /// Segments of edges within a covariance-scaled radius of the ground
    /// belief's position.
    fn nearby_segments(&self, belief: &MultivariateGaussian) -> Vec<InferenceGraphSegment>;

    /// Edges whose start coincides with the given edge's end.
    fn outgoing(&self, edge: &InferredEdge) -> Vec<Arc<InferredEdge>>;
}

/// Simple in-memory graph with adjacency derived from shared endpoints.
#[derive(Default)]
pub struct PlanarGraph {
    edges: Vec<Arc<InferredEdge>>,
    outgoing: HashMap<EdgeId, Vec<Arc<InferredEdge>>>,
}

impl PlanarGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_edge(
        &mut self,
        id: u64,
        coords: Vec<Coord>,
        has_reverse: bool,
    ) -> Result<Arc<InferredEdge>> {
        let edge = InferredEdge::new(EdgeId(id), Polyline::new(coords)?, has_reverse)?;
        for existing in &self.edges {
            if (existing.end() - edge.start()).norm() <= crate::geometry::COORD_EPS {
                self.outgoing.entry(existing.id()).or_default().push(edge.clone());
            }
            if (edge.end() - existing.start()).norm() <= crate::geometry::COORD_EPS {
                self.outgoing.entry(edge.id()).or_default().push(existing.clone());
            }
        }
        self.edges.push(edge.clone());
        Ok(edge)
    }

    pub fn edges(&self) -> &[Arc<InferredEdge>] {
        &self.edges
    }
}

impl InferenceGraph for PlanarGraph {
    fn nearby_segments(&self, belief: &MultivariateGaussian) -> Vec<InferenceGraphSegment> {
        if belief.dim() != 4 {
            return Vec::new();
        }
        let position = motion::ground_position(&belief.mean);
        let var_x = belief.covariance[(0, 0)].max(0.0);
        let var_y = belief.covariance[(2, 2)].max(0.0);
        let radius = 3.0 * var_x.max(var_y).sqrt();
        self.edges
            .iter()
            .filter(|e| e.geometry().distance_to(&position) <= radius)
            .map(whole_segment)
            .collect()
    }

    fn outgoing(&self, edge: &InferredEdge) -> Vec<Arc<InferredEdge>> {
        self.outgoing.get(&edge.id()).cloned().unwrap_or_default()
    }
}
