//! Joint path/kinematic state representations.
//!
//! A [`PathStateBelief`] couples a [`Path`] with a Gaussian whose
//! dimensionality is fixed by the path's on/off-road character: 2D road
//! coordinates on a non-null path, 4D ground coordinates on the null path.
//! A [`VehicleState`] is one particle: the belief plus its movement filter,
//! edge-transition distribution, observation and a one-deep parent link.

use nalgebra::DVector;

use crate::error::{Result, TrackingError};
use crate::gaussian::MultivariateGaussian;
use crate::geometry::Coord;
use crate::motion::{ground_position, RoadTrackingFilter};
use crate::observation::GpsObservation;
use crate::path::{Path, PathEdge};
use crate::projection;
use crate::updater::EdgeTransitionDistribution;

/// A Gaussian belief bound to a path.
#[derive(Clone, Debug)]
pub struct PathStateBelief {
    path: Path,
    belief: MultivariateGaussian,
}

impl PathStateBelief {
    /// Bind a belief to a path, converting coordinate systems when the
    /// dimensionality disagrees. A 2D belief bound to a non-null
    /// path must already lie on it up to the edge-length tolerance.
    pub fn on_path(path: Path, belief: MultivariateGaussian) -> Result<Self> {
        Self::bind(path, belief, false)
    }

    /// Like [`Self::on_path`], but a 2D position is clipped into the path's
    /// signed range instead of rejected. Used by predict/measure wrapping
    /// and the learning samplers, which clamp rather than drop.
    pub fn on_path_clamped(path: Path, belief: MultivariateGaussian) -> Result<Self> {
        Self::bind(path, belief, true)
    }

    fn bind(path: Path, belief: MultivariateGaussian, clamp: bool) -> Result<Self> {
        if path.is_null() {
            if belief.dim() != 4 {
                return Err(TrackingError::DimensionMismatch {
                    expected: 4,
                    actual: belief.dim(),
                });
            }
            return Ok(Self { path, belief });
        }
        let belief = match belief.dim() {
            4 => projection::road_belief_from_ground(&belief, &path, None, true)?,
            2 => {
                let mean = if clamp {
                    let mut adjusted = belief.mean.clone();
                    adjusted[0] = path.clamp_to_path(adjusted[0]);
                    adjusted
                } else {
                    path.adjust_for_direction(&belief.mean)?
                };
                MultivariateGaussian::new(mean, belief.covariance)?
            }
            n => {
                return Err(TrackingError::DimensionMismatch { expected: 2, actual: n });
            }
        };
        Ok(Self { path, belief })
    }

    pub fn is_on_road(&self) -> bool {
        !self.path.is_null()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn belief(&self) -> &MultivariateGaussian {
        &self.belief
    }

    /// Raw mean in the belief's native coordinate system.
    pub fn global_state(&self) -> &DVector<f64> {
        &self.belief.mean
    }

    /// The path edge carrying the mean position; the null edge off-road.
    pub fn edge(&self) -> PathEdge {
        if self.is_on_road() {
            self.path.edge_for_distance(self.belief.mean[0])
        } else {
            PathEdge::null_edge()
        }
    }

    /// The belief projected to 4D ground coordinates (identity off-road).
    pub fn ground_belief(&self) -> Result<MultivariateGaussian> {
        if self.is_on_road() {
            projection::ground_belief_from_road(&self.belief, &self.edge(), true)
        } else {
            Ok(self.belief.clone())
        }
    }

    /// The mean projected to 4D ground coordinates.
    pub fn ground_state(&self) -> Result<DVector<f64>> {
        if self.is_on_road() {
            projection::ground_state_from_road(&self.belief.mean, &self.edge(), true)
        } else {
            Ok(self.belief.mean.clone())
        }
    }

    /// Ground position of the mean.
    pub fn mean_location(&self) -> Result<Coord> {
        Ok(ground_position(&self.ground_state()?))
    }

    /// Rewrap this belief onto another path, converting coordinates and
    /// sign conventions as needed (`getStateBeliefOnPath`).
    pub fn on_new_path(&self, path: &Path) -> Result<Self> {
        if *path == self.path {
            return Ok(self.clone());
        }
        let ground = self.ground_belief()?;
        if path.is_null() {
            return Self::on_path(Path::null_path(), ground);
        }
        let road = projection::road_belief_from_ground(&ground, path, None, true)?;
        Self::on_path(path.clone(), road)
    }
}

/// One particle of the tracking posterior.
#[derive(Clone, Debug)]
pub struct VehicleState {
    pub observation: GpsObservation,
    pub belief: PathStateBelief,
    pub filter: RoadTrackingFilter,
    pub edge_transition: EdgeTransitionDistribution,
    parent: Option<Box<VehicleState>>,
}

impl VehicleState {
    pub fn new(
        observation: GpsObservation,
        belief: PathStateBelief,
        filter: RoadTrackingFilter,
        edge_transition: EdgeTransitionDistribution,
    ) -> Self {
        Self { observation, belief, filter, edge_transition, parent: None }
    }

    pub fn parent(&self) -> Option<&VehicleState> {
        self.parent.as_deref()
    }

    /// Attach the previous state as parent. The parent's own parent is
    /// dropped so the lineage chain stays exactly one deep.
    pub fn set_parent(&mut self, parent: &VehicleState) {
        let mut parent = parent.clone();
        parent.parent = None;
        self.parent = Some(Box::new(parent));
    }

    /// Ground-coordinate mean location of the belief.
    pub fn mean_location(&self) -> Result<Coord> {
        self.belief.mean_location()
    }

    /// Identifiers of the edges along the current path, in traversal order.
    pub fn path_edge_ids(&self) -> Vec<crate::graph::EdgeId> {
        self.belief.path().edges().iter().map(|e| e.edge_id()).collect()
    }
}
