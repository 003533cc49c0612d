//! End-to-end tracking scenarios.

use std::sync::Arc;

use assert_approx_eq::assert_approx_eq;
use nalgebra::{DMatrix, DVector};
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, Normal};

use roadtrack::linalg::EIGEN_TOLERANCE;
use roadtrack::motion::EDGE_LENGTH_ERROR_TOLERANCE;
use roadtrack::{
    whole_segment, Coord, EdgeId, GpsObservation, InferredEdge, MultivariateGaussian, Path,
    PathStateBelief, PlanarGraph, Polyline, RoadTrackingFilter, VehicleStateInitialParameters,
    VehicleTracker,
};

/// Build a path through consecutive coordinates, one unit edge per segment.
fn make_path(coords: &[(f64, f64)], is_backward: bool) -> Path {
    let mut edges = Vec::new();
    for (i, pair) in coords.windows(2).enumerate() {
        let edge = InferredEdge::new(
            EdgeId(1000 + i as u64),
            Polyline::new(vec![
                Coord::new(pair[0].0, pair[0].1),
                Coord::new(pair[1].0, pair[1].1),
            ])
            .unwrap(),
            false,
        )
        .unwrap();
        edges.push(edge);
    }
    if is_backward {
        edges.reverse();
    }
    let segments = edges.iter().map(whole_segment).collect();
    Path::from_segments(segments, is_backward).unwrap()
}

fn tight_params() -> VehicleStateInitialParameters {
    VehicleStateInitialParameters {
        obs_cov: [1e-6, 1e-6],
        obs_cov_dof: 20,
        on_road_state_cov: [1e-6, 1e-6],
        on_road_cov_dof: 20,
        off_road_state_cov: [1e-6, 1e-6, 1e-6, 1e-6],
        off_road_cov_dof: 20,
        initial_obs_freq: 0.1,
        num_particles: 10,
        seed: 0,
    }
}

fn assert_no_negative_eigenvalues(cov: &DMatrix<f64>) {
    let min = cov.clone().symmetric_eigen().eigenvalues.min();
    assert!(
        min >= -EIGEN_TOLERANCE,
        "covariance eigenvalue {min} below the floor"
    );
}

/// Constant velocity along a two-edge straight path.
#[test]
fn two_edge_straight_path_constant_velocity() {
    let path = make_path(&[(0.0, 0.0), (1.0, 0.0), (2.0, 0.0)], false);
    let filter = RoadTrackingFilter::new(&tight_params(), None).unwrap();

    let mut belief = PathStateBelief::on_path(
        path.clone(),
        MultivariateGaussian::new(
            DVector::from_vec(vec![0.1, 1.0]),
            DMatrix::from_diagonal(&DVector::from_vec(vec![1e-9, 1e-9])),
        )
        .unwrap(),
    )
    .unwrap();

    for k in 1..=14 {
        let truth = 0.1 + 0.1 * k as f64;
        let obs = Coord::new(truth, 0.0);
        let prior_predictive = filter.predict(&belief, &path).unwrap();
        let posterior = filter
            .measure(&prior_predictive, &obs, &prior_predictive.edge())
            .unwrap();
        let s = posterior.global_state()[0];
        assert!(
            (s - truth).abs() < 0.01,
            "step {k}: mean {s} deviates from truth {truth}"
        );
        assert!(
            s.abs() <= path.total_distance().abs() + EDGE_LENGTH_ERROR_TOLERANCE,
            "on-road position containment violated at step {k}"
        );
        assert_no_negative_eigenvalues(&posterior.belief().covariance);
        belief = posterior;
    }
    assert_eq!(belief.edge().edge_id(), EdgeId(1001), "final edge must be the second edge");
}

/// The same geometry traversed in reverse; signs flip.
#[test]
fn reverse_direction_path_flips_signs() {
    let path = make_path(&[(0.0, 0.0), (1.0, 0.0), (2.0, 0.0)], true);
    assert_approx_eq!(path.total_distance(), -2.0, 1e-12);
    assert!(path.edges().iter().all(|e| e.dist_to_start() <= 0.0));

    let filter = RoadTrackingFilter::new(&tight_params(), None).unwrap();
    let mut belief = PathStateBelief::on_path(
        path.clone(),
        MultivariateGaussian::new(
            DVector::from_vec(vec![-0.1, -1.0]),
            DMatrix::from_diagonal(&DVector::from_vec(vec![1e-9, 1e-9])),
        )
        .unwrap(),
    )
    .unwrap();

    for k in 1..=14 {
        let truth = -(0.1 + 0.1 * k as f64);
        // Mirror trajectory: ground position walks from (1.9, 0) toward the
        // origin end of the path.
        let obs = Coord::new(2.0 + truth, 0.0);
        let prior_predictive = filter.predict(&belief, &path).unwrap();
        let posterior = filter
            .measure(&prior_predictive, &obs, &prior_predictive.edge())
            .unwrap();
        let s = posterior.global_state()[0];
        assert!(s < 0.0, "backward path state must stay negative, got {s}");
        assert!(
            (s - truth).abs() < 0.01,
            "step {k}: mean {s} deviates from truth {truth}"
        );
        belief = posterior;
    }
    assert_approx_eq!(belief.global_state()[0], -1.5, 0.01);
    // |s| = 1.5 lies on the second path edge (the first geometry edge).
    assert_eq!(belief.edge().edge_id(), EdgeId(1000));
}

/// An off-road start converges onto the nearby edge.
#[test]
fn off_road_to_on_road_transition() {
    let mut graph = PlanarGraph::new();
    graph
        .add_edge(1, vec![Coord::new(0.0, 0.0), Coord::new(10.0, 0.0)], false)
        .unwrap();
    let graph = Arc::new(graph);

    let params = VehicleStateInitialParameters {
        obs_cov: [0.01, 0.01],
        obs_cov_dof: 20,
        on_road_state_cov: [0.01, 0.01],
        on_road_cov_dof: 20,
        off_road_state_cov: [0.1, 0.1, 0.1, 0.1],
        off_road_cov_dof: 20,
        initial_obs_freq: 1.0,
        num_particles: 30,
        seed: 7,
    };

    let mut tracker = VehicleTracker::new(graph, params).unwrap();
    let mut prev: Option<i64> = None;
    for k in 0..4 {
        let t = k as i64 * 1_000;
        let mut obs = GpsObservation::new(t, Coord::new(0.5 + k as f64, 0.0));
        if let Some(p) = prev {
            obs = obs.with_previous(p);
        }
        tracker.step(&obs).unwrap();
        prev = Some(t);
    }

    // Under a tight observation covariance the on-road hypothesis survives
    // in the population and the best particle has moved down the corridor.
    assert!(
        tracker.particles().iter().any(|p| p.belief.is_on_road()),
        "no on-road particle survived"
    );
    let best = tracker.best_particle().expect("population not empty");
    let location = best.mean_location().unwrap();
    assert!(
        location.x > 1.0 && location.y.abs() < 1.0,
        "best particle at {location:?}, expected along the +x corridor"
    );

    // The population mixes both hypotheses at initialization, and on-road
    // candidates dominate the observation likelihood.
    let updater_check = {
        let mut graph = PlanarGraph::new();
        graph
            .add_edge(1, vec![Coord::new(0.0, 0.0), Coord::new(10.0, 0.0)], false)
            .unwrap();
        let params = tracker_params_for_init();
        let mut updater =
            roadtrack::BootstrapUpdater::new(Arc::new(graph), params).unwrap();
        let obs = GpsObservation::new(0, Coord::new(0.5, 0.0));
        let particles = updater.create_initial_particles(&obs).unwrap();
        let on = particles.iter().find(|p| p.belief.is_on_road());
        let off = particles.iter().find(|p| !p.belief.is_on_road());
        match (on, off) {
            (Some(on), Some(off)) => Some((
                updater.compute_log_likelihood(on, &obs).unwrap(),
                updater.compute_log_likelihood(off, &obs).unwrap(),
            )),
            _ => None,
        }
    };
    if let Some((on_ll, off_ll)) = updater_check {
        assert!(
            on_ll > off_ll,
            "on-road candidate ({on_ll}) should beat the off-road baseline ({off_ll})"
        );
    }
}

fn tracker_params_for_init() -> VehicleStateInitialParameters {
    VehicleStateInitialParameters {
        obs_cov: [0.01, 0.01],
        obs_cov_dof: 20,
        on_road_state_cov: [0.01, 0.01],
        on_road_cov_dof: 20,
        off_road_state_cov: [0.1, 0.1, 0.1, 0.1],
        off_road_cov_dof: 20,
        initial_obs_freq: 1.0,
        num_particles: 40,
        seed: 3,
    }
}

/// Covariance learning. The observation-noise posterior tracks
/// the truth in its observable component, and every inverse-Wishart dof
/// grows by exactly one per observation.
#[test]
fn covariance_learning_tracks_observation_noise() {
    let true_obs_var: f64 = 1e-6;
    let true_q: [f64; 2] = [0.01, 0.04];

    // A single very long edge keeps the simulated trajectory on-path.
    let edge = InferredEdge::new(
        EdgeId(1),
        Polyline::new(vec![Coord::new(0.0, 0.0), Coord::new(1e7, 0.0)]).unwrap(),
        false,
    )
    .unwrap();
    let path = Path::from_segment(whole_segment(&edge));

    let params = VehicleStateInitialParameters {
        // Observation prior mean 4x the truth; the learning pass has to
        // pull it down.
        obs_cov: [4e-6, 4e-6],
        obs_cov_dof: 20,
        on_road_state_cov: [1.0, 1.0],
        on_road_cov_dof: 20,
        off_road_state_cov: [1.0, 1.0, 1.0, 1.0],
        off_road_cov_dof: 20,
        initial_obs_freq: 1.0,
        num_particles: 1,
        seed: 0,
    };
    let mut filter = RoadTrackingFilter::new(&params, None).unwrap();
    let initial_obs_dof = filter.learning().obs_variance_prior().dof();
    let initial_on_dof = filter.learning().on_road_variance_prior().dof();

    let mut rng = StdRng::seed_from_u64(13);
    let obs_noise = Normal::new(0.0, true_obs_var.sqrt()).unwrap();
    let pos_noise = Normal::new(0.0, (true_q[0] * 0.25).sqrt()).unwrap();
    let vel_noise = Normal::new(0.0, true_q[1].sqrt()).unwrap();

    let mut truth = DVector::from_vec(vec![5e6, 5.0]);
    let mut belief = PathStateBelief::on_path(
        path.clone(),
        MultivariateGaussian::new(
            truth.clone(),
            DMatrix::from_diagonal(&DVector::from_vec(vec![1e-6, 1e-2])),
        )
        .unwrap(),
    )
    .unwrap();

    let steps = 2000;
    let mut timestamp = 0i64;
    for _ in 0..steps {
        truth[0] += truth[1] + pos_noise.sample(&mut rng);
        truth[1] += vel_noise.sample(&mut rng);
        timestamp += 1_000;
        let obs = GpsObservation::new(
            timestamp,
            Coord::new(
                truth[0] + obs_noise.sample(&mut rng),
                obs_noise.sample(&mut rng),
            ),
        )
        .with_previous(timestamp - 1_000);

        let prior = belief.clone();
        let prior_predictive = filter.predict(&prior, &path).unwrap();
        let posterior = filter
            .measure(&prior_predictive, &obs.projected_point, &prior_predictive.edge())
            .unwrap();
        filter
            .update_parameters(&prior, &prior_predictive, &posterior, &obs, &mut rng)
            .unwrap();
        assert_no_negative_eigenvalues(filter.qr());
        assert_no_negative_eigenvalues(filter.obs_cov());
        belief = posterior;
    }

    // DoF monotonicity: initial dof plus one per observation.
    assert_approx_eq!(
        filter.learning().obs_variance_prior().dof(),
        initial_obs_dof + steps as f64,
        1e-9
    );
    assert_approx_eq!(
        filter.learning().on_road_variance_prior().dof(),
        initial_on_dof + steps as f64,
        1e-9
    );

    // The cross-track observation residual is pure observation noise, so
    // that entry of the posterior mean converges onto the truth.
    let obs_mean = filter.learning().obs_variance_prior().mean();
    let err = (obs_mean[(1, 1)] - true_obs_var).abs();
    assert!(
        err <= 0.2 * true_obs_var,
        "observation-noise posterior mean {} deviates from truth {true_obs_var}",
        obs_mean[(1, 1)]
    );
    // And it moved from the prior toward the truth.
    assert!(
        (obs_mean[(1, 1)] - true_obs_var).abs() < (4e-6 - true_obs_var).abs(),
        "posterior mean did not move toward the truth"
    );

    // State samples are persisted for the next step.
    assert!(filter.learning().prev_state_sample().is_some());
    assert!(filter.learning().current_state_sample().is_some());
}

/// The edge walk terminates and the tracker keeps running when
/// the vehicle never comes near the road network.
#[test]
fn edge_walk_terminates_far_from_the_network() {
    let mut graph = PlanarGraph::new();
    graph
        .add_edge(1, vec![Coord::new(1000.0, 1000.0), Coord::new(1010.0, 1000.0)], false)
        .unwrap();
    let graph = Arc::new(graph);

    let params = VehicleStateInitialParameters {
        obs_cov: [1.0, 1.0],
        obs_cov_dof: 20,
        on_road_state_cov: [0.1, 0.1],
        on_road_cov_dof: 20,
        off_road_state_cov: [0.1, 0.1, 0.1, 0.1],
        off_road_cov_dof: 20,
        initial_obs_freq: 1.0,
        num_particles: 15,
        seed: 21,
    };
    let mut tracker = VehicleTracker::new(graph, params).unwrap();
    let mut prev: Option<i64> = None;
    for k in 0..5 {
        let t = k as i64 * 1_000;
        let mut obs = GpsObservation::new(t, Coord::new(k as f64, -k as f64));
        if let Some(p) = prev {
            obs = obs.with_previous(p);
        }
        tracker.step(&obs).unwrap();
        prev = Some(t);
    }
    // Far from every edge, the whole population stays off-road.
    assert!(tracker.particles().iter().all(|p| !p.belief.is_on_road()));
    // Lineage is one deep across the population.
    for particle in tracker.particles() {
        if let Some(parent) = particle.parent() {
            assert!(parent.parent().is_none());
        }
    }
}

/// Lineage and containment invariants hold across tracker steps over a
/// multi-edge network with branching.
#[test]
fn tracker_respects_containment_and_lineage_on_a_branching_network() {
    let mut graph = PlanarGraph::new();
    graph
        .add_edge(1, vec![Coord::new(0.0, 0.0), Coord::new(10.0, 0.0)], false)
        .unwrap();
    graph
        .add_edge(2, vec![Coord::new(10.0, 0.0), Coord::new(20.0, 0.0)], false)
        .unwrap();
    graph
        .add_edge(3, vec![Coord::new(10.0, 0.0), Coord::new(10.0, 10.0)], false)
        .unwrap();
    let graph = Arc::new(graph);

    let params = VehicleStateInitialParameters {
        obs_cov: [0.25, 0.25],
        obs_cov_dof: 20,
        on_road_state_cov: [0.25, 0.25],
        on_road_cov_dof: 20,
        off_road_state_cov: [0.25, 0.25, 0.25, 0.25],
        off_road_cov_dof: 20,
        initial_obs_freq: 1.0,
        num_particles: 25,
        seed: 11,
    };
    let mut tracker = VehicleTracker::new(graph, params).unwrap();
    let mut prev: Option<i64> = None;
    for k in 0..8 {
        let t = k as i64 * 1_000;
        let mut obs = GpsObservation::new(t, Coord::new(2.0 + 2.0 * k as f64, 0.0));
        if let Some(p) = prev {
            obs = obs.with_previous(p);
        }
        tracker.step(&obs).unwrap();
        prev = Some(t);

        for particle in tracker.particles() {
            if particle.belief.is_on_road() {
                let s = particle.belief.global_state()[0];
                let total = particle.belief.path().total_distance();
                assert!(
                    s.abs() <= total.abs() + EDGE_LENGTH_ERROR_TOLERANCE,
                    "position {s} escapes path of length {total}"
                );
            }
            assert_no_negative_eigenvalues(&particle.belief.belief().covariance);
            if let Some(parent) = particle.parent() {
                assert!(parent.parent().is_none(), "lineage deeper than one");
            }
        }
    }
    let best = tracker.best_particle().unwrap();
    let location = best.mean_location().unwrap();
    assert!(
        location.x > 6.0,
        "best particle should have advanced along the corridor, got {location:?}"
    );
}
