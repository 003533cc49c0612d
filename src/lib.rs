//! Probabilistic vehicle tracking on a road network.
//!
//! This crate tracks a moving vehicle from noisy 2D position fixes against
//! a known road network. The vehicle is either *on-road* — its kinematic
//! state expressed as signed arc length and speed along a path of street
//! edges — or *off-road* in free planar motion. A Rao-Blackwellized
//! bootstrap particle filter maintains the joint posterior over the
//! kinematic state, the path of edges being traversed, and three unknown
//! covariance matrices (observation noise, on-road and off-road process
//! noise) carried as inverse-Wishart sufficient statistics.
//!
//! This crate is primarily built off of three additional dependencies:
//! - [`nalgebra`](https://crates.io/crates/nalgebra): linear algebra for the
//!   beliefs and filter matrices.
//! - [`rand`](https://crates.io/crates/rand) and
//!   [`rand_distr`](https://crates.io/crates/rand_distr): random number
//!   generation for the particle and Gibbs sampling steps.
//! - [`log`](https://crates.io/crates/log): diagnostics, including the
//!   ground-truth deviation warning emitted during parameter learning.
//!
//! ## Crate overview
//!
//! - [`geometry`]: planar polylines with arc-length indexing, and the
//!   analytic merge of polylines sharing an endpoint.
//! - [`graph`]: the road network abstraction — immutable directed edges, the
//!   off-road null-edge sentinel, edge segmentation, nearby-edge queries.
//! - [`path`]: ordered sequences of oriented edges with signed distances,
//!   clamping and edge lookup.
//! - [`projection`]: the ground↔road coordinate projections and the 1D
//!   pseudo-observation used to measure on-road beliefs.
//! - [`gaussian`], [`linalg`]: multivariate Gaussian beliefs and the
//!   positive-semi-definite square-root machinery backing them.
//! - [`motion`]: the coupled road/ground Kalman filter pair owned by each
//!   particle.
//! - [`wishart`], [`estimator`]: inverse-Wishart covariance priors and the
//!   per-observation Gibbs pass that updates and resamples them.
//! - [`state`]: path-state beliefs and the particle (vehicle state) type.
//! - [`updater`]: the bootstrap particle updater and the tracking driver.
//! - [`observation`]: GPS observations and configuration.
//!
//! ## Coordinate conventions
//!
//! Ground states are `[x, ẋ, y, ẏ]` in the planar projection of the road
//! graph (meters, meters/second). Road states are `[s, ṡ]` where `s` is
//! arc length measured from the path origin; both components are negated on
//! paths traversed against edge-geometry direction, so `sign(s)` always
//! matches the path direction. Observations are consumed strictly in
//! timestamp order with Δt rebuilt from consecutive timestamps.

pub mod error;
pub mod estimator;
pub mod gaussian;
pub mod geometry;
pub mod graph;
pub mod linalg;
pub mod motion;
pub mod observation;
pub mod path;
pub mod projection;
pub mod state;
pub mod updater;
pub mod wishart;

pub use error::{Result, TrackingError};
pub use gaussian::MultivariateGaussian;
pub use geometry::{Coord, LineSegment, Polyline};
pub use graph::{
    edge_segments, whole_segment, EdgeId, InferenceGraph, InferenceGraphSegment, InferredEdge,
    PlanarGraph,
};
pub use motion::RoadTrackingFilter;
pub use observation::{GpsObservation, GroundTruth, VehicleStateInitialParameters};
pub use path::{Path, PathEdge};
pub use state::{PathStateBelief, VehicleState};
pub use updater::{BootstrapUpdater, EdgeTransitionDistribution, VehicleTracker};
pub use wishart::InverseWishart;
