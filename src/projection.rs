//! Projections between road (1D curvilinear) and ground (2D planar)
//! coordinates.
//!
//! Every projection runs through a per-segment affine map built from the
//! containing line segment's unit tangent `t` and its cumulative distance
//! `d0` along the path: `ground = P·road + a` with
//! `P = [t.x 0; 0 t.x; t.y 0; 0 t.y]` and `a = [p0 − t·d0, 0]` interleaved,
//! so that `road = Pᵀ(ground − a)`. The projections are always computed in
//! the positive (traversal) direction; backward paths negate the road state
//! on either side of the map.

use nalgebra::{DMatrix, DVector};

use crate::error::{Result, TrackingError};
use crate::gaussian::MultivariateGaussian;
use crate::geometry::{Coord, LineSegment};
use crate::linalg::symmetrize;
use crate::motion::{og_matrix, or_matrix};
use crate::path::{Path, PathEdge};

/// Affine map between a road segment's 1D frame and ground coordinates.
#[derive(Clone, Debug)]
pub struct SegmentProjection {
    matrix: DMatrix<f64>,
    offset: DVector<f64>,
}

impl SegmentProjection {
    /// Build the map for a segment whose start lies `abs_dist_to_start`
    /// meters from the path origin (positive direction).
    pub fn new(segment: &LineSegment, abs_dist_to_start: f64) -> Self {
        debug_assert!(segment.length() > 0.0);
        let t = segment.tangent();
        let anchor = segment.p0 - t * abs_dist_to_start;
        let matrix = DMatrix::from_row_slice(
            4,
            2,
            &[
                t.x, 0.0, //
                0.0, t.x, //
                t.y, 0.0, //
                0.0, t.y,
            ],
        );
        let offset = DVector::from_vec(vec![anchor.x, 0.0, anchor.y, 0.0]);
        Self { matrix, offset }
    }

    pub fn matrix(&self) -> &DMatrix<f64> {
        &self.matrix
    }

    /// Positive-direction road state to ground state.
    pub fn to_ground(&self, road: &DVector<f64>) -> DVector<f64> {
        &self.matrix * road + &self.offset
    }

    /// Ground state to positive-direction road state.
    pub fn to_road(&self, ground: &DVector<f64>) -> DVector<f64> {
        self.matrix.transpose() * (ground - &self.offset)
    }
}

/// The segment projection carrying a road state on the given path edge.
pub fn ground_projection(state: &DVector<f64>, edge: &PathEdge) -> Result<SegmentProjection> {
    if state.len() != 2 {
        return Err(TrackingError::DimensionMismatch { expected: 2, actual: state.len() });
    }
    if edge.is_null() {
        return Err(TrackingError::Geometry(
            "cannot project a road state through the null edge".into(),
        ));
    }
    let s = state[0];
    let s_pos = if edge.is_backward() { -s } else { s };
    let geometry = edge.oriented_geometry();
    let within = (s_pos.abs() - edge.dist_to_start().abs()).clamp(0.0, geometry.length());
    let (segment, seg_d0) = geometry.segment_at(within);
    Ok(SegmentProjection::new(&segment, edge.dist_to_start().abs() + seg_d0))
}

/// Road→ground projection of a raw state.
pub fn ground_state_from_road(
    state: &DVector<f64>,
    edge: &PathEdge,
    use_abs_velocity: bool,
) -> Result<DVector<f64>> {
    let projection = ground_projection(state, edge)?;
    let positive = if edge.is_backward() { -state } else { state.clone() };
    let mut mean = projection.to_ground(&positive);
    if use_abs_velocity {
        rescale_ground_velocity(&mut mean, state[1].abs());
    }
    Ok(mean)
}

/// Road→ground projection of a belief; covariance maps through `P Σ Pᵀ`.
pub fn ground_belief_from_road(
    belief: &MultivariateGaussian,
    edge: &PathEdge,
    use_abs_velocity: bool,
) -> Result<MultivariateGaussian> {
    let projection = ground_projection(&belief.mean, edge)?;
    let positive = if edge.is_backward() { -&belief.mean } else { belief.mean.clone() };
    let mut mean = projection.to_ground(&positive);
    if use_abs_velocity {
        rescale_ground_velocity(&mut mean, belief.mean[1].abs());
    }
    let covariance = symmetrize(&(projection.matrix() * &belief.covariance * projection.matrix().transpose()));
    MultivariateGaussian::new(mean, covariance)
}

fn rescale_ground_velocity(mean: &mut DVector<f64>, abs_velocity: f64) {
    if abs_velocity > 0.0 {
        let norm = (mean[1] * mean[1] + mean[3] * mean[3]).sqrt();
        if norm > 0.0 {
            let scale = abs_velocity / norm;
            mean[1] *= scale;
            mean[3] *= scale;
        }
    }
}

fn road_projection_for(
    position: &Coord,
    path: &Path,
    edge: Option<&PathEdge>,
) -> Result<SegmentProjection> {
    if path.is_null() {
        return Err(TrackingError::Geometry(
            "cannot project onto the null path".into(),
        ));
    }
    let (segment, d0_on_path) = match edge {
        Some(path_edge) => {
            let geometry = path_edge.oriented_geometry();
            let within = geometry.project(position);
            let (segment, seg_d0) = geometry.segment_at(within);
            (segment, path_edge.dist_to_start().abs() + seg_d0)
        }
        None => {
            let geometry = path.geometry();
            let s_star = geometry.project(position);
            geometry.segment_at(s_star)
        }
    };
    Ok(SegmentProjection::new(&segment, d0_on_path))
}

/// Ground→road projection of a raw 4D state onto a path. The result
/// is signed per the path direction and clamped to the path extent.
pub fn road_state_from_ground(
    state: &DVector<f64>,
    path: &Path,
    edge: Option<&PathEdge>,
    use_abs_velocity: bool,
) -> Result<DVector<f64>> {
    if state.len() != 4 {
        return Err(TrackingError::DimensionMismatch { expected: 4, actual: state.len() });
    }
    let position = Coord::new(state[0], state[2]);
    let projection = road_projection_for(&position, path, edge)?;
    let mut mean = projection.to_road(state);
    mean[0] = mean[0].clamp(0.0, path.geometry().length());
    if path.is_backward() {
        mean = -mean;
    }
    if use_abs_velocity {
        let abs_velocity = (state[1] * state[1] + state[3] * state[3]).sqrt();
        mean[1] = mean[1].signum() * abs_velocity;
    }
    Ok(mean)
}

/// Ground→road projection of a belief; covariance maps through `Pᵀ Σ P`.
pub fn road_belief_from_ground(
    belief: &MultivariateGaussian,
    path: &Path,
    edge: Option<&PathEdge>,
    use_abs_velocity: bool,
) -> Result<MultivariateGaussian> {
    if belief.dim() != 4 {
        return Err(TrackingError::DimensionMismatch { expected: 4, actual: belief.dim() });
    }
    let position = Coord::new(belief.mean[0], belief.mean[2]);
    let projection = road_projection_for(&position, path, edge)?;
    let mut mean = projection.to_road(&belief.mean);
    mean[0] = mean[0].clamp(0.0, path.geometry().length());
    if path.is_backward() {
        mean = -mean;
    }
    if use_abs_velocity {
        let abs_velocity =
            (belief.mean[1] * belief.mean[1] + belief.mean[3] * belief.mean[3]).sqrt();
        mean[1] = mean[1].signum() * abs_velocity;
    }
    let covariance = symmetrize(
        &(projection.matrix().transpose() * &belief.covariance * projection.matrix()),
    );
    MultivariateGaussian::new(mean, covariance)
}

/// Map a 2D ground observation to a 1D pseudo-observation on the edge
/// carrying the posterior mean. The observation is lifted to the 4D
/// ground space with zero velocity, projected onto the edge, and reduced to
/// its position component.
pub fn road_observation(
    observation: &Coord,
    obs_cov: &DMatrix<f64>,
    path: &Path,
    edge: &PathEdge,
) -> Result<MultivariateGaussian> {
    if obs_cov.nrows() != 2 || obs_cov.ncols() != 2 {
        return Err(TrackingError::DimensionMismatch { expected: 2, actual: obs_cov.nrows() });
    }
    let og = og_matrix();
    let lifted = MultivariateGaussian::new(
        og.transpose() * DVector::from_vec(vec![observation.x, observation.y]),
        og.transpose() * obs_cov * og,
    )?;
    let projected = road_belief_from_ground(&lifted, path, Some(edge), true)?;
    let or = or_matrix();
    MultivariateGaussian::new(
        or * &projected.mean,
        or * &projected.covariance * or.transpose(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::Polyline;
    use crate::graph::{whole_segment, EdgeId, InferredEdge};
    use assert_approx_eq::assert_approx_eq;

    fn bent_edge_path(is_backward: bool) -> Path {
        // Unit segment along +x followed by a unit segment along +y.
        let edge = InferredEdge::new(
            EdgeId(7),
            Polyline::new(vec![
                Coord::new(0.0, 0.0),
                Coord::new(1.0, 0.0),
                Coord::new(1.0, 1.0),
            ])
            .unwrap(),
            false,
        )
        .unwrap();
        Path::from_segments(vec![whole_segment(&edge)], is_backward).unwrap()
    }

    #[test]
    fn round_trip_interior_state() {
        let path = bent_edge_path(false);
        let edge = path.edges()[0].clone();
        let ground = DVector::from_vec(vec![0.5, 2.0, 0.0, 0.0]);
        let road = road_state_from_ground(&ground, &path, None, false).unwrap();
        assert_approx_eq!(road[0], 0.5, 1e-12);
        assert_approx_eq!(road[1], 2.0, 1e-12);
        let back = ground_state_from_road(&road, &edge, false).unwrap();
        for i in 0..4 {
            assert_approx_eq!(back[i], ground[i], 1e-12);
        }
    }

    #[test]
    fn second_segment_follows_the_bend() {
        let path = bent_edge_path(false);
        let edge = path.edges()[0].clone();
        let road = DVector::from_vec(vec![1.5, 1.0]);
        let ground = ground_state_from_road(&road, &edge, false).unwrap();
        assert_approx_eq!(ground[0], 1.0, 1e-12);
        assert_approx_eq!(ground[2], 0.5, 1e-12);
        // Velocity rotates onto the +y tangent.
        assert_approx_eq!(ground[1], 0.0, 1e-12);
        assert_approx_eq!(ground[3], 1.0, 1e-12);
    }

    #[test]
    fn backward_path_flips_signs() {
        let path = bent_edge_path(true);
        let edge = path.edges()[0].clone();
        // Traversal origin is the (1,1) end; halfway back along +y.
        let ground = DVector::from_vec(vec![1.0, 0.0, 0.5, -1.5]);
        let road = road_state_from_ground(&ground, &path, None, false).unwrap();
        assert_approx_eq!(road[0], -0.5, 1e-12);
        assert_approx_eq!(road[1], -1.5, 1e-12);
        let back = ground_state_from_road(&road, &edge, false).unwrap();
        for i in 0..4 {
            assert_approx_eq!(back[i], ground[i], 1e-12);
        }
    }

    #[test]
    fn abs_velocity_preserves_speed() {
        let path = bent_edge_path(false);
        // Ground velocity not aligned with the tangent loses magnitude under
        // the plain projection; useAbsVelocity restores it.
        let ground = DVector::from_vec(vec![0.5, 1.0, 0.0, 1.0]);
        let plain = road_state_from_ground(&ground, &path, None, false).unwrap();
        assert_approx_eq!(plain[1], 1.0, 1e-12);
        let preserved = road_state_from_ground(&ground, &path, None, true).unwrap();
        assert_approx_eq!(preserved[1], 2.0_f64.sqrt(), 1e-12);
    }

    #[test]
    fn snapped_projection_clamps_to_path() {
        let path = bent_edge_path(false);
        // Orthogonal foot beyond the (1,1) end.
        let ground = DVector::from_vec(vec![1.2, 0.0, 3.0, 1.0]);
        let road = road_state_from_ground(&ground, &path, None, false).unwrap();
        assert_approx_eq!(road[0], 2.0, 1e-12);
    }

    #[test]
    fn road_observation_reduces_to_position() {
        let path = bent_edge_path(false);
        let edge = path.edges()[0].clone();
        let obs_cov = DMatrix::from_diagonal(&DVector::from_vec(vec![0.04, 0.09]));
        let pseudo =
            road_observation(&Coord::new(0.25, 0.1), &obs_cov, &path, &edge).unwrap();
        assert_eq!(pseudo.dim(), 1);
        assert_approx_eq!(pseudo.mean[0], 0.25, 1e-12);
        // Along the +x segment the pseudo-observation variance is the x
        // component of the observation covariance.
        assert_approx_eq!(pseudo.covariance[(0, 0)], 0.04, 1e-12);
    }
}
