//! GPS observations and estimator configuration.

use nalgebra::DMatrix;
use serde::{Deserialize, Serialize};

use crate::error::{Result, TrackingError};
use crate::geometry::Coord;

/// A single noisy position fix in the road graph's planar projection.
///
/// Observations are consumed strictly in timestamp order; `previous_timestamp_ms`
/// links to the preceding fix so the per-step Δt can be rebuilt.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GpsObservation {
    /// Millisecond epoch timestamp.
    pub timestamp_ms: i64,
    /// Projected planar position (meters).
    pub projected_point: Coord,
    /// Timestamp of the previous observation, when one exists.
    pub previous_timestamp_ms: Option<i64>,
    /// Ground truth carried by simulated observations; used only for the
    /// parameter-learning diagnostic warning.
    #[serde(skip)]
    pub ground_truth: Option<GroundTruth>,
}

impl GpsObservation {
    pub fn new(timestamp_ms: i64, projected_point: Coord) -> Self {
        Self { timestamp_ms, projected_point, previous_timestamp_ms: None, ground_truth: None }
    }

    pub fn with_previous(mut self, previous_timestamp_ms: i64) -> Self {
        self.previous_timestamp_ms = Some(previous_timestamp_ms);
        self
    }

    /// Seconds since the previous observation, or the configured default
    /// when this is the first fix.
    pub fn time_diff(&self, default_secs: f64) -> f64 {
        match self.previous_timestamp_ms {
            Some(prev) if self.timestamp_ms > prev => {
                (self.timestamp_ms - prev) as f64 / 1000.0
            }
            _ => default_secs,
        }
    }
}

/// True process covariances attached to a simulated observation.
#[derive(Clone, Debug)]
pub struct GroundTruth {
    pub on_road_state_cov: DMatrix<f64>,
    pub off_road_state_cov: DMatrix<f64>,
}

/// Initial-state configuration for the estimator.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct VehicleStateInitialParameters {
    /// Diagonal of the observation covariance prior mean (m²).
    pub obs_cov: [f64; 2],
    /// Degrees of freedom of the observation covariance prior (≥ 4).
    pub obs_cov_dof: usize,
    /// Diagonal of the on-road process covariance prior mean.
    pub on_road_state_cov: [f64; 2],
    /// Degrees of freedom of the on-road prior (≥ 4).
    pub on_road_cov_dof: usize,
    /// Diagonal of the off-road process covariance prior mean.
    pub off_road_state_cov: [f64; 4],
    /// Degrees of freedom of the off-road prior (≥ 6).
    pub off_road_cov_dof: usize,
    /// Default Δt (seconds) before a second observation is seen.
    pub initial_obs_freq: f64,
    /// Particle population size.
    pub num_particles: usize,
    /// Seed for the updater's random source.
    pub seed: u64,
}

impl Default for VehicleStateInitialParameters {
    fn default() -> Self {
        Self {
            obs_cov: [25.0, 25.0],
            obs_cov_dof: 20,
            on_road_state_cov: [1.0, 1.0],
            on_road_cov_dof: 20,
            off_road_state_cov: [1.0, 1.0, 1.0, 1.0],
            off_road_cov_dof: 20,
            initial_obs_freq: 30.0,
            num_particles: 25,
            seed: 0,
        }
    }
}

impl VehicleStateInitialParameters {
    /// Check that every prior has enough degrees of freedom for its mean to
    /// exist and that the scalar settings are in range.
    pub fn validate(&self) -> Result<()> {
        if self.obs_cov_dof < 4 {
            return Err(TrackingError::InvalidParameters(
                "obs_cov_dof must be at least dim + 2 = 4".into(),
            ));
        }
        if self.on_road_cov_dof < 4 {
            return Err(TrackingError::InvalidParameters(
                "on_road_cov_dof must be at least dim + 2 = 4".into(),
            ));
        }
        if self.off_road_cov_dof < 6 {
            return Err(TrackingError::InvalidParameters(
                "off_road_cov_dof must be at least dim + 2 = 6".into(),
            ));
        }
        if self.initial_obs_freq <= 0.0 {
            return Err(TrackingError::InvalidParameters(
                "initial_obs_freq must be positive".into(),
            ));
        }
        if self.num_particles == 0 {
            return Err(TrackingError::InvalidParameters(
                "num_particles must be positive".into(),
            ));
        }
        let all_positive = self.obs_cov.iter().all(|v| *v > 0.0)
            && self.on_road_state_cov.iter().all(|v| *v > 0.0)
            && self.off_road_state_cov.iter().all(|v| *v > 0.0);
        if !all_positive {
            return Err(TrackingError::InvalidParameters(
                "covariance prior diagonals must be positive".into(),
            ));
        }
        Ok(())
    }
}
