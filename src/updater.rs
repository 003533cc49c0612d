//! Bootstrap particle updater and tracking driver.
//!
//! Per observation, each particle is advanced by a Kalman predict in its
//! native coordinate system, perturbed with sampled transition noise, and
//! placed on a path sampled by walking the edge graph forward from its
//! current edge. No measurement correction is applied here; weights come
//! from the predictive observation likelihood, and the measured posterior
//! is formed only inside the covariance-learning pass.
//!
//! The random source is a single serialized `StdRng` owned by the updater
//! and used across particles in sequence; parallelizing over particles
//! would require per-particle generators seeded up front.

use std::sync::Arc;

use log::debug;
use nalgebra::{DMatrix, DVector};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::error::{Result, TrackingError};
use crate::gaussian::MultivariateGaussian;
use crate::geometry::Polyline;
use crate::graph::{edge_segments, InferenceGraph, InferenceGraphSegment, InferredEdge};
use crate::motion::{covariance_factor, og_matrix, RoadTrackingFilter};
use crate::observation::{GpsObservation, VehicleStateInitialParameters};
use crate::path::{Path, PathEdge};
use crate::state::{PathStateBelief, VehicleState};

/// Categorical distribution over the null edge and the outgoing edges of
/// the current edge. The off-road/on-road split is governed by Bernoulli
/// sufficient statistics; on-road edge choices are uniform.
#[derive(Clone, Debug)]
pub struct EdgeTransitionDistribution {
    /// Bernoulli counts for an off-road state: [stay off-road, move on-road].
    off_road_counts: [f64; 2],
    /// Bernoulli counts for an on-road state: [stay on-road, go off-road].
    on_road_counts: [f64; 2],
}

impl Default for EdgeTransitionDistribution {
    fn default() -> Self {
        Self { off_road_counts: [9.0, 1.0], on_road_counts: [19.0, 1.0] }
    }
}

impl EdgeTransitionDistribution {
    pub fn new(off_road_counts: [f64; 2], on_road_counts: [f64; 2]) -> Result<Self> {
        let positive = off_road_counts.iter().chain(on_road_counts.iter()).all(|v| *v > 0.0);
        if !positive {
            return Err(TrackingError::InvalidParameters(
                "edge transition counts must be positive".into(),
            ));
        }
        Ok(Self { off_road_counts, on_road_counts })
    }

    fn stay_off_probability(&self) -> f64 {
        self.off_road_counts[0] / (self.off_road_counts[0] + self.off_road_counts[1])
    }

    fn leave_road_probability(&self) -> f64 {
        self.on_road_counts[1] / (self.on_road_counts[0] + self.on_road_counts[1])
    }

    /// Log-probability of transitioning to the null edge or to one of
    /// `candidate_edges` uniformly chosen on-road edges.
    pub fn log_probability(
        &self,
        currently_on_road: bool,
        target_is_null: bool,
        candidate_edges: usize,
    ) -> f64 {
        let null_prob = if currently_on_road {
            self.leave_road_probability()
        } else {
            self.stay_off_probability()
        };
        if target_is_null {
            null_prob.ln()
        } else {
            (1.0 - null_prob).ln() - (candidate_edges.max(1) as f64).ln()
        }
    }

    /// Sample a transition target; `None` is the null edge. When
    /// `allow_null` is false the null option has been removed from the
    /// domain and an edge is always drawn from `candidates`.
    pub fn sample(
        &self,
        currently_on_road: bool,
        allow_null: bool,
        candidates: &[Arc<InferredEdge>],
        rng: &mut StdRng,
    ) -> Option<Arc<InferredEdge>> {
        let null_prob = if !allow_null {
            0.0
        } else if currently_on_road {
            self.leave_road_probability()
        } else {
            self.stay_off_probability()
        };
        if candidates.is_empty() || rng.random::<f64>() < null_prob {
            return None;
        }
        Some(candidates[rng.random_range(0..candidates.len())].clone())
    }
}

/// Produces new vehicle states from paths sampled along the predicted
/// motion state.
pub struct BootstrapUpdater<G: InferenceGraph> {
    graph: Arc<G>,
    parameters: VehicleStateInitialParameters,
    rng: StdRng,
}

impl<G: InferenceGraph> BootstrapUpdater<G> {
    pub fn new(graph: Arc<G>, parameters: VehicleStateInitialParameters) -> Result<Self> {
        parameters.validate()?;
        let rng = StdRng::seed_from_u64(parameters.seed);
        Ok(Self { graph, parameters, rng })
    }

    pub fn parameters(&self) -> &VehicleStateInitialParameters {
        &self.parameters
    }

    /// The ground-coordinate prior built from an observation: position at
    /// the projected point, zero velocity, covariance from the observation
    /// prior plus one step of off-road process uncertainty.
    fn initial_ground_belief(&self, obs: &GpsObservation) -> Result<MultivariateGaussian> {
        let mean = DVector::from_vec(vec![
            obs.projected_point.x,
            0.0,
            obs.projected_point.y,
            0.0,
        ]);
        let og = og_matrix();
        let obs_cov = DMatrix::from_diagonal(&DVector::from_row_slice(&self.parameters.obs_cov));
        let qg =
            DMatrix::from_diagonal(&DVector::from_row_slice(&self.parameters.off_road_state_cov));
        let factor = covariance_factor(self.parameters.initial_obs_freq, false);
        let covariance = og.transpose() * obs_cov * og + &factor * qg * factor.transpose();
        MultivariateGaussian::new(mean, covariance)
    }

    fn initial_state(
        &mut self,
        obs: &GpsObservation,
        segment: Option<&InferenceGraphSegment>,
    ) -> Result<VehicleState> {
        let mut filter = RoadTrackingFilter::new(&self.parameters, Some(&mut self.rng))?;
        filter.set_time_diff(obs.time_diff(self.parameters.initial_obs_freq));
        let ground = self.initial_ground_belief(obs)?;
        let belief = match segment {
            None => PathStateBelief::on_path(Path::null_path(), ground)?,
            Some(segment) => {
                PathStateBelief::on_path(Path::from_segment(segment.clone()), ground)?
            }
        };
        Ok(VehicleState::new(
            obs.clone(),
            belief,
            filter,
            EdgeTransitionDistribution::default(),
        ))
    }

    /// Observation log-likelihood of a particle's motion-state conditional
    /// distribution at the projected point.
    pub fn compute_log_likelihood(
        &self,
        particle: &VehicleState,
        obs: &GpsObservation,
    ) -> Result<f64> {
        particle
            .filter
            .observation_log_likelihood(&particle.belief, &obs.projected_point)
    }

    /// Create the initial particle population: a local mixture of one
    /// off-road candidate and one candidate per nearby edge segment,
    /// weighted by transition prior and observation likelihood, sampled
    /// `num_particles` times with replacement.
    pub fn create_initial_particles(&mut self, obs: &GpsObservation) -> Result<Vec<VehicleState>> {
        let ground = self.initial_ground_belief(obs)?;
        let nearby = self.graph.nearby_segments(&ground);
        debug!("initializing particles from {} nearby segments", nearby.len());

        let mut particles = Vec::with_capacity(self.parameters.num_particles);
        for _ in 0..self.parameters.num_particles {
            let mut candidates: Vec<VehicleState> = Vec::with_capacity(nearby.len() + 1);
            let mut log_weights: Vec<f64> = Vec::with_capacity(nearby.len() + 1);

            let null_state = self.initial_state(obs, None)?;
            let null_weight = null_state
                .edge_transition
                .log_probability(false, true, nearby.len())
                + self.compute_log_likelihood(&null_state, obs)?;
            candidates.push(null_state);
            log_weights.push(null_weight);

            for segment in &nearby {
                let state = match self.initial_state(obs, Some(segment)) {
                    Ok(state) => state,
                    Err(_) => continue,
                };
                let weight = state
                    .edge_transition
                    .log_probability(false, false, nearby.len())
                    + self.compute_log_likelihood(&state, obs)?;
                candidates.push(state);
                log_weights.push(weight);
            }

            let index = sample_log_categorical(&log_weights, &mut self.rng);
            particles.push(candidates.swap_remove(index));
        }
        Ok(particles)
    }

    /// Advance one particle through predict, edge walk and mean placement.
    pub fn update(&mut self, previous: &VehicleState, obs: &GpsObservation) -> Result<VehicleState> {
        let mut updated = previous.clone();
        updated.observation = obs.clone();
        let dt = obs.time_diff(self.parameters.initial_obs_freq);
        updated.filter.set_time_diff(dt);

        let prediction = updated.filter.predict_gaussian(updated.belief.belief())?;
        let noisy_mean = updated
            .filter
            .sample_state_transition(&prediction.mean, &mut self.rng)?;
        let predicted = MultivariateGaussian::new(noisy_mean, prediction.covariance)?;

        let speed = if predicted.dim() == 2 {
            predicted.mean[1].abs()
        } else {
            (predicted.mean[1] * predicted.mean[1] + predicted.mean[3] * predicted.mean[3]).sqrt()
        };
        // Bound the distance represented by a single path edge to roughly
        // one step of motion.
        let segment_target = (speed * dt).max(1.0);

        let current_edge = updated.belief.edge();
        let new_belief = if current_edge.is_null() {
            self.update_off_road(&updated, predicted, segment_target)?
        } else {
            self.update_on_road(&updated, previous, &current_edge, predicted, segment_target)?
        };
        updated.belief = new_belief;
        updated.set_parent(previous);
        Ok(updated)
    }

    fn update_off_road(
        &mut self,
        state: &VehicleState,
        predicted: MultivariateGaussian,
        segment_target: f64,
    ) -> Result<PathStateBelief> {
        let nearby = self.graph.nearby_segments(&predicted);
        let mut edges: Vec<Arc<InferredEdge>> = Vec::new();
        for segment in &nearby {
            if !edges.iter().any(|e| e.id() == segment.edge.id()) {
                edges.push(segment.edge.clone());
            }
        }
        match state
            .edge_transition
            .sample(false, true, &edges, &mut self.rng)
        {
            None => PathStateBelief::on_path_clamped(Path::null_path(), predicted),
            Some(first) => {
                let mut segments = edge_segments(&first, segment_target);
                for edge in self.sample_successors(&state.edge_transition, &first) {
                    segments.extend(edge_segments(&edge, segment_target));
                }
                let path = Path::from_segments(segments, false)?;
                PathStateBelief::on_path_clamped(path, predicted)
            }
        }
    }

    fn update_on_road(
        &mut self,
        state: &VehicleState,
        previous: &VehicleState,
        current_edge: &PathEdge,
        predicted: MultivariateGaussian,
        segment_target: f64,
    ) -> Result<PathStateBelief> {
        let mut candidates = vec![current_edge.edge().clone()];
        candidates.extend(self.graph.outgoing(current_edge.edge()));
        match state
            .edge_transition
            .sample(true, true, &candidates, &mut self.rng)
        {
            None => {
                // First draw went off-road: project the predicted road
                // belief back to ground coordinates.
                let on_old = PathStateBelief::on_path_clamped(
                    previous.belief.path().clone(),
                    predicted,
                )?;
                on_old.on_new_path(&Path::null_path())
            }
            Some(first) => {
                // New path origin: the start of the particle's current
                // segment; the predicted mean is rebased onto it.
                let mut segments = remainder_segments(
                    current_edge.edge(),
                    current_edge.segment().offset,
                    segment_target,
                )?;
                if first.id() != current_edge.edge().id() {
                    segments.extend(edge_segments(&first, segment_target));
                    for edge in self.sample_successors(&state.edge_transition, &first) {
                        segments.extend(edge_segments(&edge, segment_target));
                    }
                }
                let path = Path::from_segments(segments, false)?;
                let rebased = rebase_road_belief(&predicted, previous.belief.path(), current_edge)?;
                PathStateBelief::on_path_clamped(path, rebased)
            }
        }
    }

    /// Walk forward from `start`, sampling among the current edge and its
    /// outgoing edges until the current edge is drawn twice in succession.
    fn sample_successors(
        &mut self,
        transition: &EdgeTransitionDistribution,
        start: &Arc<InferredEdge>,
    ) -> Vec<Arc<InferredEdge>> {
        let mut successors = Vec::new();
        let mut current = start.clone();
        loop {
            let mut candidates = vec![current.clone()];
            candidates.extend(self.graph.outgoing(&current));
            let choice = match transition.sample(true, false, &candidates, &mut self.rng) {
                Some(choice) => choice,
                None => break,
            };
            if choice.id() == current.id() {
                break;
            }
            successors.push(choice.clone());
            current = choice;
        }
        successors
    }
}

/// Rebase a predicted road belief from its old path frame onto a new
/// forward path whose origin is the start of `current_edge`.
fn rebase_road_belief(
    predicted: &MultivariateGaussian,
    old_path: &Path,
    current_edge: &PathEdge,
) -> Result<MultivariateGaussian> {
    debug_assert_eq!(predicted.dim(), 2);
    let direction = if old_path.is_backward() { -1.0 } else { 1.0 };
    let mut mean = predicted.mean.clone();
    mean[0] = direction * mean[0] - current_edge.dist_to_start().abs();
    mean[1] *= direction;
    MultivariateGaussian::new(mean, predicted.covariance.clone())
}

/// Split the tail of `edge` beyond `from_offset` into segments bounded by
/// `target` arc length.
fn remainder_segments(
    edge: &Arc<InferredEdge>,
    from_offset: f64,
    target: f64,
) -> Result<Vec<InferenceGraphSegment>> {
    if from_offset <= crate::geometry::COORD_EPS {
        return Ok(edge_segments(edge, target));
    }
    let geometry = edge.geometry().extract(from_offset, edge.length())?;
    Ok(split_geometry(edge, from_offset, &geometry, target))
}

fn split_geometry(
    edge: &Arc<InferredEdge>,
    base_offset: f64,
    geometry: &Polyline,
    target: f64,
) -> Vec<InferenceGraphSegment> {
    let length = geometry.length();
    if target <= 0.0 || target >= length {
        return vec![InferenceGraphSegment {
            edge: edge.clone(),
            geometry: geometry.clone(),
            offset: base_offset,
        }];
    }
    let count = (length / target).ceil() as usize;
    let piece = length / count as f64;
    (0..count)
        .map(|i| {
            let s0 = i as f64 * piece;
            let s1 = if i + 1 == count { length } else { (i + 1) as f64 * piece };
            InferenceGraphSegment {
                edge: edge.clone(),
                geometry: geometry.extract(s0, s1).expect("interior split bounds"),
                offset: base_offset + s0,
            }
        })
        .collect()
}

fn normalize_log_weights(log_weights: &mut [f64]) {
    let max = log_weights.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    if !max.is_finite() {
        let uniform = -(log_weights.len() as f64).ln();
        log_weights.iter_mut().for_each(|w| *w = uniform);
        return;
    }
    let sum: f64 = log_weights.iter().map(|w| (w - max).exp()).sum();
    let log_sum = max + sum.ln();
    log_weights.iter_mut().for_each(|w| *w -= log_sum);
}

fn normalized_weights(log_weights: &[f64]) -> Vec<f64> {
    let mut lw = log_weights.to_vec();
    normalize_log_weights(&mut lw);
    lw.iter().map(|w| w.exp()).collect()
}

/// Draw an index from unnormalized log weights with the max-log trick.
fn sample_log_categorical(log_weights: &[f64], rng: &mut StdRng) -> usize {
    let weights = normalized_weights(log_weights);
    let u: f64 = rng.random();
    let mut cumulative = 0.0;
    for (i, w) in weights.iter().enumerate() {
        cumulative += w;
        if u <= cumulative {
            return i;
        }
    }
    weights.len() - 1
}

/// Systematic resampling over normalized weights.
fn systematic_resample(weights: &[f64], count: usize, rng: &mut StdRng) -> Vec<usize> {
    let step = 1.0 / count as f64;
    let start: f64 = rng.random::<f64>() * step;
    let mut indices = Vec::with_capacity(count);
    let mut cumulative = weights[0];
    let mut i = 0;
    for k in 0..count {
        let u = start + k as f64 * step;
        while u > cumulative && i + 1 < weights.len() {
            i += 1;
            cumulative += weights[i];
        }
        indices.push(i);
    }
    indices
}

/// Driver owning the particle population: per observation it resamples the
/// previous population, advances every particle, runs covariance learning
/// and reweights by observation likelihood.
pub struct VehicleTracker<G: InferenceGraph> {
    updater: BootstrapUpdater<G>,
    particles: Vec<VehicleState>,
    log_weights: Vec<f64>,
}

impl<G: InferenceGraph> VehicleTracker<G> {
    pub fn new(graph: Arc<G>, parameters: VehicleStateInitialParameters) -> Result<Self> {
        Ok(Self {
            updater: BootstrapUpdater::new(graph, parameters)?,
            particles: Vec::new(),
            log_weights: Vec::new(),
        })
    }

    /// Consume one observation. The first observation initializes the
    /// population; later ones run the full bootstrap step. A candidate
    /// whose projection fails is dropped; exhausting every candidate is an
    /// error surfaced to the caller.
    pub fn step(&mut self, obs: &GpsObservation) -> Result<()> {
        if self.particles.is_empty() {
            self.particles = self.updater.create_initial_particles(obs)?;
            let mut log_weights = self
                .particles
                .iter()
                .map(|p| self.updater.compute_log_likelihood(p, obs).unwrap_or(f64::NEG_INFINITY))
                .collect::<Vec<_>>();
            normalize_log_weights(&mut log_weights);
            self.log_weights = log_weights;
            return Ok(());
        }

        let weights = normalized_weights(&self.log_weights);
        let indices =
            systematic_resample(&weights, self.particles.len(), &mut self.updater.rng);
        let pool: Vec<VehicleState> =
            indices.into_iter().map(|i| self.particles[i].clone()).collect();

        let mut next = Vec::with_capacity(pool.len());
        let mut log_weights = Vec::with_capacity(pool.len());
        for particle in &pool {
            let mut updated = match self.updater.update(particle, obs) {
                Ok(updated) => updated,
                Err(_) => continue,
            };
            let prior = particle.belief.clone();
            let prior_predictive = updated.belief.clone();
            let learned = updated
                .filter
                .measure(&prior_predictive, &obs.projected_point, &prior_predictive.edge())
                .and_then(|posterior| {
                    updated.filter.update_parameters(
                        &prior,
                        &prior_predictive,
                        &posterior,
                        obs,
                        &mut self.updater.rng,
                    )
                });
            if learned.is_err() {
                continue;
            }
            let weight = match self.updater.compute_log_likelihood(&updated, obs) {
                Ok(weight) => weight,
                Err(_) => continue,
            };
            next.push(updated);
            log_weights.push(weight);
        }

        if next.is_empty() {
            return Err(TrackingError::ParticleDepletion);
        }
        normalize_log_weights(&mut log_weights);
        self.particles = next;
        self.log_weights = log_weights;
        Ok(())
    }

    pub fn particles(&self) -> &[VehicleState] {
        &self.particles
    }

    /// Normalized log weights parallel to [`Self::particles`].
    pub fn log_weights(&self) -> &[f64] {
        &self.log_weights
    }

    /// The highest-weighted particle of the current population.
    pub fn best_particle(&self) -> Option<&VehicleState> {
        self.log_weights
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.total_cmp(b.1))
            .and_then(|(i, _)| self.particles.get(i))
    }
}
