//! The coupled road/ground Kalman filter pair.
//!
//! Each particle owns a [`RoadTrackingFilter`] holding two linear-Gaussian
//! motion models that share the covariance-learning machinery: a 2D
//! constant-velocity model in road coordinates `[s, ṡ]` and a 4D
//! constant-velocity model in ground coordinates `[x, ẋ, y, ẏ]`.
//! Measurements are always 2D ground observations; against an on-road
//! belief they are first reduced to a 1D pseudo-observation on the current
//! edge.

use std::sync::OnceLock;

use nalgebra::{DMatrix, DVector};
use rand::rngs::StdRng;
use rand_distr::{Distribution, Normal};

use crate::error::{Result, TrackingError};
use crate::estimator::CovarianceEstimator;
use crate::gaussian::MultivariateGaussian;
use crate::geometry::Coord;
use crate::linalg::{check_psd, psd_sqrt, spd_solve, symmetrize};
use crate::observation::VehicleStateInitialParameters;
use crate::path::{Path, PathEdge};
use crate::projection;
use crate::state::PathStateBelief;
use crate::wishart::InverseWishart;

/// How far beyond a path endpoint a position may fall before the state is
/// rejected as unrepresentable (meters). Positions inside this band are
/// snapped to the endpoint.
pub const EDGE_LENGTH_ERROR_TOLERANCE: f64 = 0.05;

/// Road observation matrix `O_r = [1, 0]`.
pub fn or_matrix() -> &'static DMatrix<f64> {
    static M: OnceLock<DMatrix<f64>> = OnceLock::new();
    M.get_or_init(|| DMatrix::from_row_slice(1, 2, &[1.0, 0.0]))
}

/// Road velocity selector `V_r = [0, 1]`.
pub fn vr_matrix() -> &'static DMatrix<f64> {
    static M: OnceLock<DMatrix<f64>> = OnceLock::new();
    M.get_or_init(|| DMatrix::from_row_slice(1, 2, &[0.0, 1.0]))
}

/// Ground observation matrix `O_g` selecting `(x, y)`.
pub fn og_matrix() -> &'static DMatrix<f64> {
    static M: OnceLock<DMatrix<f64>> = OnceLock::new();
    M.get_or_init(|| {
        DMatrix::from_row_slice(2, 4, &[1.0, 0.0, 0.0, 0.0, 0.0, 0.0, 1.0, 0.0])
    })
}

/// Ground velocity selector `V_g` selecting `(ẋ, ẏ)`.
pub fn vg_matrix() -> &'static DMatrix<f64> {
    static M: OnceLock<DMatrix<f64>> = OnceLock::new();
    M.get_or_init(|| {
        DMatrix::from_row_slice(2, 4, &[0.0, 1.0, 0.0, 0.0, 0.0, 0.0, 0.0, 1.0])
    })
}

/// Position component of a 4D ground state.
pub fn ground_position(mean: &DVector<f64>) -> Coord {
    debug_assert_eq!(mean.len(), 4);
    Coord::new(mean[0], mean[2])
}

/// Constant-velocity transition matrix for the given time step.
pub fn state_transition(dt: f64, on_road: bool) -> DMatrix<f64> {
    if on_road {
        DMatrix::from_row_slice(2, 2, &[1.0, dt, 0.0, 1.0])
    } else {
        DMatrix::from_row_slice(
            4,
            4,
            &[
                1.0, dt, 0.0, 0.0, //
                0.0, 1.0, 0.0, 0.0, //
                0.0, 0.0, 1.0, dt, //
                0.0, 0.0, 0.0, 1.0,
            ],
        )
    }
}

/// Covariance factor mapping process noise to state increments:
/// `diag(Δt²/2, Δt)` per coordinate axis.
pub fn covariance_factor(dt: f64, on_road: bool) -> DMatrix<f64> {
    let half = dt * dt / 2.0;
    if on_road {
        DMatrix::from_diagonal(&DVector::from_vec(vec![half, dt]))
    } else {
        DMatrix::from_diagonal(&DVector::from_vec(vec![half, dt, half, dt]))
    }
}

/// Per-particle filter pair with unknown covariances.
///
/// Holds the sampled observation covariance `Σ_obs`, the sampled process
/// covariances `Q_r`/`Q_g`, the derived transition covariances `F Q Fᵀ`,
/// and the inverse-Wishart learning state that resamples them after each
/// observation.
#[derive(Clone, Debug)]
pub struct RoadTrackingFilter {
    pub(crate) dt: f64,
    pub(crate) obs_cov: DMatrix<f64>,
    pub(crate) qr: DMatrix<f64>,
    pub(crate) qg: DMatrix<f64>,
    pub(crate) on_road_trans_cov: DMatrix<f64>,
    pub(crate) off_road_trans_cov: DMatrix<f64>,
    pub(crate) learning: CovarianceEstimator,
}

impl RoadTrackingFilter {
    /// Build a filter from the configured priors. With a random source the
    /// initial covariances are drawn from the priors (stochastic mode);
    /// without one they are set to the prior means (deterministic mode).
    pub fn new(
        params: &VehicleStateInitialParameters,
        rng: Option<&mut StdRng>,
    ) -> Result<Self> {
        params.validate()?;
        let obs_prior = InverseWishart::from_expected_diagonal(&params.obs_cov, params.obs_cov_dof)?;
        let on_prior = InverseWishart::from_expected_diagonal(
            &params.on_road_state_cov,
            params.on_road_cov_dof,
        )?;
        let off_prior = InverseWishart::from_expected_diagonal(
            &params.off_road_state_cov,
            params.off_road_cov_dof,
        )?;

        let (obs_cov, qr, qg) = match rng {
            Some(rng) => (
                obs_prior.sample(rng)?,
                on_prior.sample(rng)?,
                off_prior.sample(rng)?,
            ),
            None => (obs_prior.mean(), on_prior.mean(), off_prior.mean()),
        };

        let mut filter = Self {
            dt: params.initial_obs_freq,
            obs_cov,
            qr,
            qg,
            on_road_trans_cov: DMatrix::zeros(2, 2),
            off_road_trans_cov: DMatrix::zeros(4, 4),
            learning: CovarianceEstimator::new(obs_prior, on_prior, off_prior),
        };
        filter.rebuild_transition_covariances();
        Ok(filter)
    }

    pub(crate) fn rebuild_transition_covariances(&mut self) {
        let fr = covariance_factor(self.dt, true);
        let fg = covariance_factor(self.dt, false);
        self.on_road_trans_cov = symmetrize(&(&fr * &self.qr * fr.transpose()));
        self.off_road_trans_cov = symmetrize(&(&fg * &self.qg * fg.transpose()));
    }

    /// Set Δt (seconds) for the next observation; transition matrices and
    /// covariances are rebuilt from it.
    pub fn set_time_diff(&mut self, dt: f64) {
        self.dt = dt;
        self.rebuild_transition_covariances();
    }

    pub fn time_diff(&self) -> f64 {
        self.dt
    }

    pub fn obs_cov(&self) -> &DMatrix<f64> {
        &self.obs_cov
    }

    pub fn qr(&self) -> &DMatrix<f64> {
        &self.qr
    }

    pub fn qg(&self) -> &DMatrix<f64> {
        &self.qg
    }

    pub fn on_road_transition_cov(&self) -> &DMatrix<f64> {
        &self.on_road_trans_cov
    }

    pub fn off_road_transition_cov(&self) -> &DMatrix<f64> {
        &self.off_road_trans_cov
    }

    pub fn learning(&self) -> &CovarianceEstimator {
        &self.learning
    }

    /// Kalman predict on a raw belief in its native coordinate system.
    pub fn predict_gaussian(&self, belief: &MultivariateGaussian) -> Result<MultivariateGaussian> {
        let on_road = match belief.dim() {
            2 => true,
            4 => false,
            n => return Err(TrackingError::DimensionMismatch { expected: 2, actual: n }),
        };
        let g = state_transition(self.dt, on_road);
        let q = if on_road { &self.on_road_trans_cov } else { &self.off_road_trans_cov };
        let mean = &g * &belief.mean;
        let covariance = symmetrize(&(&g * &belief.covariance * g.transpose() + q));
        MultivariateGaussian::new(mean, covariance)
    }

    /// Predict a path-state belief along `path`, converting the prior to the
    /// path's coordinate system first.
    pub fn predict(&self, prior: &PathStateBelief, path: &Path) -> Result<PathStateBelief> {
        let converted = prior.on_new_path(path)?;
        let predicted = self.predict_gaussian(converted.belief())?;
        PathStateBelief::on_path_clamped(path.clone(), predicted)
    }

    /// Kalman measurement update against a 2D ground observation. On-road
    /// beliefs measure through the 1D pseudo-observation built on `edge`,
    /// which must be the edge carrying the posterior mean.
    pub fn measure(
        &self,
        prior: &PathStateBelief,
        observation: &Coord,
        edge: &PathEdge,
    ) -> Result<PathStateBelief> {
        let (h, y, r): (&DMatrix<f64>, DVector<f64>, DMatrix<f64>) = if prior.is_on_road() {
            let pseudo =
                projection::road_observation(observation, &self.obs_cov, prior.path(), edge)?;
            (or_matrix(), pseudo.mean, pseudo.covariance)
        } else {
            (
                og_matrix(),
                DVector::from_vec(vec![observation.x, observation.y]),
                self.obs_cov.clone(),
            )
        };
        let updated = kalman_update(prior.belief(), h, &y, &r)?;
        PathStateBelief::on_path_clamped(prior.path().clone(), updated)
    }

    /// Draw transition noise for a raw predicted mean and return the
    /// perturbed mean. The covariance is chosen by the state's dimension.
    pub fn sample_state_transition(
        &self,
        mean: &DVector<f64>,
        rng: &mut StdRng,
    ) -> Result<DVector<f64>> {
        let cov = match mean.len() {
            2 => &self.on_road_trans_cov,
            4 => &self.off_road_trans_cov,
            n => return Err(TrackingError::DimensionMismatch { expected: 2, actual: n }),
        };
        let sqrt = psd_sqrt(cov)?;
        let normal = Normal::new(0.0, 1.0).expect("unit normal");
        let z = DVector::from_iterator(mean.len(), (0..mean.len()).map(|_| normal.sample(rng)));
        Ok(mean + sqrt * z)
    }

    /// Predictive distribution of the next 2D ground observation given a
    /// path-state belief: `N(O_g μ_g, O_g Σ_g O_gᵀ + Σ_obs)`.
    pub fn observation_distribution(
        &self,
        belief: &PathStateBelief,
    ) -> Result<MultivariateGaussian> {
        let ground = belief.ground_belief()?;
        let og = og_matrix();
        MultivariateGaussian::new(
            og * &ground.mean,
            symmetrize(&(og * &ground.covariance * og.transpose() + &self.obs_cov)),
        )
    }

    /// Log-density of a ground observation under the belief's predictive
    /// observation distribution.
    pub fn observation_log_likelihood(
        &self,
        belief: &PathStateBelief,
        point: &Coord,
    ) -> Result<f64> {
        self.observation_distribution(belief)?
            .log_density(&DVector::from_vec(vec![point.x, point.y]))
    }
}

fn kalman_update(
    prior: &MultivariateGaussian,
    h: &DMatrix<f64>,
    y: &DVector<f64>,
    r: &DMatrix<f64>,
) -> Result<MultivariateGaussian> {
    let s = h * &prior.covariance * h.transpose() + r;
    // K = P Hᵀ S⁻¹, computed by solving S Kᵀ = H Pᵀ.
    let k = spd_solve(&s, &(h * prior.covariance.transpose()))?.transpose();
    let innovation = y - h * &prior.mean;
    let mean = &prior.mean + &k * innovation;
    let dim = prior.dim();
    let identity = DMatrix::<f64>::identity(dim, dim);
    let covariance = symmetrize(&((identity - &k * h) * &prior.covariance));
    check_psd(&covariance)?;
    MultivariateGaussian::new(mean, covariance)
}
