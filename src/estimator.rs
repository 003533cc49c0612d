//! Online covariance learning.
//!
//! After each observation the filter Gibbs-samples the hidden state through
//! a one-step forward-filter/backward-smoother pass and treats the three
//! covariances as inverse-Wishart random variables: the smoothed previous
//! state and a filtered transition sample yield a process-noise residual
//! and an observation residual, each applied as a rank-1 conjugate update
//! before fresh covariances are drawn.

use log::warn;
use nalgebra::DVector;
use rand::rngs::StdRng;

use crate::error::Result;
use crate::gaussian::MultivariateGaussian;
use crate::geometry::Coord;
use crate::linalg::{check_psd, pseudo_inverse_sqrt, spd_solve, symmetrize};
use crate::motion::{
    covariance_factor, og_matrix, or_matrix, state_transition, RoadTrackingFilter,
};
use crate::observation::GpsObservation;
use crate::projection;
use crate::state::PathStateBelief;
use crate::wishart::InverseWishart;

/// Inverse-Wishart learning state carried by each filter, together with the
/// smoothed state samples persisted between observations.
#[derive(Clone, Debug)]
pub struct CovarianceEstimator {
    pub(crate) obs_variance_prior: InverseWishart,
    pub(crate) on_road_variance_prior: InverseWishart,
    pub(crate) off_road_variance_prior: InverseWishart,
    pub(crate) prev_state_sample: Option<PathStateBelief>,
    pub(crate) current_state_sample: Option<PathStateBelief>,
}

impl CovarianceEstimator {
    pub fn new(
        obs_variance_prior: InverseWishart,
        on_road_variance_prior: InverseWishart,
        off_road_variance_prior: InverseWishart,
    ) -> Self {
        Self {
            obs_variance_prior,
            on_road_variance_prior,
            off_road_variance_prior,
            prev_state_sample: None,
            current_state_sample: None,
        }
    }

    pub fn obs_variance_prior(&self) -> &InverseWishart {
        &self.obs_variance_prior
    }

    pub fn on_road_variance_prior(&self) -> &InverseWishart {
        &self.on_road_variance_prior
    }

    pub fn off_road_variance_prior(&self) -> &InverseWishart {
        &self.off_road_variance_prior
    }

    pub fn prev_state_sample(&self) -> Option<&PathStateBelief> {
        self.prev_state_sample.as_ref()
    }

    pub fn current_state_sample(&self) -> Option<&PathStateBelief> {
        self.current_state_sample.as_ref()
    }
}

impl RoadTrackingFilter {
    /// Draw `x̃_{t−1} ~ p(x_{t−1} | x_t, y_t)` through the closed-form
    /// conditional Gaussian smoother.
    pub(crate) fn sample_smoothed_prev_state(
        &self,
        prior: &PathStateBelief,
        prior_predictive: &PathStateBelief,
        posterior: &PathStateBelief,
        observation: &Coord,
        rng: &mut StdRng,
    ) -> Result<PathStateBelief> {
        let prior_on_path = prior.on_new_path(prior_predictive.path())?;
        if posterior.is_on_road() {
            assert_eq!(
                prior_predictive.path().edges().first().map(|e| e.edge_id()),
                posterior.path().edges().first().map(|e| e.edge_id()),
                "smoothing requires prior-predictive and posterior paths to share their first edge",
            );
        }

        let on_road = posterior.is_on_road();
        let (f, y, sigma, c, m, omega) = if on_road {
            // Force the observation onto the posterior edge; it is the best
            // guess as to where the vehicle actually is.
            let pseudo = projection::road_observation(
                observation,
                &self.obs_cov,
                prior_predictive.path(),
                &posterior.edge(),
            )?;
            (
                or_matrix().clone(),
                pseudo.mean,
                pseudo.covariance,
                prior_on_path.belief().covariance.clone(),
                prior_on_path.belief().mean.clone(),
                self.on_road_trans_cov.clone(),
            )
        } else {
            let ground = prior_on_path.ground_belief()?;
            (
                og_matrix().clone(),
                DVector::from_vec(vec![observation.x, observation.y]),
                self.obs_cov.clone(),
                ground.covariance,
                ground.mean,
                self.off_road_trans_cov.clone(),
            )
        };

        let g = state_transition(self.dt, on_road);
        let w = &f * &omega * f.transpose() + &sigma;
        let fg = &f * &g;
        let a = &fg * &c * fg.transpose() + &w;
        let w_til = spd_solve(&a, &(&fg * c.transpose()))?.transpose();

        let m_smooth = &m + &w_til * (&y - &fg * &m);
        let c_smooth = symmetrize(&(&c - &w_til * &a * w_til.transpose()));
        check_psd(&c_smooth)?;

        let sampler = MultivariateGaussian::new(m_smooth, c_smooth)?;
        let mut sampled = sampler.sample(rng)?;
        if on_road {
            sampled[0] = posterior.path().clamp_to_path(sampled[0]);
        }
        PathStateBelief::on_path_clamped(
            posterior.path().clone(),
            MultivariateGaussian::new(sampled, sampler.covariance)?,
        )
    }

    /// Draw `x̃_t` from the one-step-ahead distribution built from the
    /// smoothed previous sample. The predicted covariance is taken from the
    /// transition covariance selected by the previous sample's on/off-road
    /// status, matching the original estimator.
    pub(crate) fn sample_filtered_transition(
        &self,
        prev_sample: &PathStateBelief,
        observation: &Coord,
        rng: &mut StdRng,
    ) -> Result<PathStateBelief> {
        let path = prev_sample.path().clone();
        let mut prediction = self.predict_gaussian(prev_sample.belief())?;
        prediction.covariance = if prev_sample.is_on_road() {
            self.on_road_trans_cov.clone()
        } else {
            self.off_road_trans_cov.clone()
        };
        let predicted_state = PathStateBelief::on_path_clamped(path.clone(), prediction)?;
        let posterior =
            self.measure(&predicted_state, observation, &predicted_state.edge())?;

        let mut sampled = posterior.belief().sample(rng)?;
        if posterior.is_on_road() {
            sampled[0] = path.clamp_to_path(sampled[0]);
        }
        PathStateBelief::on_path_clamped(
            path,
            MultivariateGaussian::new(sampled, posterior.belief().covariance.clone())?,
        )
    }

    /// Run the parameter-learning pass for one observation: smoothed
    /// previous sample, filtered transition sample, inverse-Wishart updates
    /// for the relevant process covariance and the observation covariance,
    /// and redraws of both.
    pub fn update_parameters(
        &mut self,
        prior: &PathStateBelief,
        prior_predictive: &PathStateBelief,
        posterior: &PathStateBelief,
        observation: &GpsObservation,
        rng: &mut StdRng,
    ) -> Result<()> {
        let new_prev_sample = self.sample_smoothed_prev_state(
            prior,
            prior_predictive,
            posterior,
            &observation.projected_point,
            rng,
        )?;
        let new_state_sample =
            self.sample_filtered_transition(&new_prev_sample, &observation.projected_point, rng)?;

        let on_road = new_prev_sample.is_on_road();
        let factor = covariance_factor(self.dt, on_road);
        let g = state_transition(self.dt, on_road);
        let sample_diff =
            new_state_sample.belief().mean.clone() - &g * &new_prev_sample.belief().mean;
        let factor_inv = pseudo_inverse_sqrt(&(&factor * factor.transpose()))?;
        let state_error = &factor_inv * sample_diff;
        let outer = &state_error * state_error.transpose();

        if let Some(truth) = &observation.ground_truth {
            let mut updated = if on_road {
                self.learning.on_road_variance_prior.clone()
            } else {
                self.learning.off_road_variance_prior.clone()
            };
            updated.observe_outer(&outer);
            let true_q = if on_road {
                &truth.on_road_state_cov
            } else {
                &truth.off_road_state_cov
            };
            let update_error = updated.mean() - true_q;
            if update_error.norm() > 0.4 * true_q.norm() {
                warn!(
                    "large process-covariance update error: |error| = {:.6e}",
                    update_error.norm()
                );
            }
        }

        {
            let prior_dist = if on_road {
                &mut self.learning.on_road_variance_prior
            } else {
                &mut self.learning.off_road_variance_prior
            };
            prior_dist.observe_outer(&outer);
            let q_sample = prior_dist.sample(rng)?;
            let trans_cov = symmetrize(&(&factor * &q_sample * factor.transpose()));
            if on_road {
                self.qr = q_sample;
                self.on_road_trans_cov = trans_cov;
            } else {
                self.qg = q_sample;
                self.off_road_trans_cov = trans_cov;
            }
        }

        let ground = new_state_sample.ground_state()?;
        let obs_error = DVector::from_vec(vec![
            observation.projected_point.x,
            observation.projected_point.y,
        ]) - og_matrix() * ground;
        self.learning.obs_variance_prior.observe(&obs_error);
        self.obs_cov = self.learning.obs_variance_prior.sample(rng)?;

        self.learning.prev_state_sample = Some(new_prev_sample);
        self.learning.current_state_sample = Some(new_state_sample);
        Ok(())
    }
}
