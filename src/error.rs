//! Error types for the tracking estimator.

use thiserror::Error;

/// Tracking estimator error type.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TrackingError {
    /// A state's position cannot be represented on the requested path, even
    /// after snapping within the edge-length error tolerance.
    #[error("position {position} not representable on path of signed length {total_distance}")]
    OffPath { position: f64, total_distance: f64 },

    /// A belief or observation has the wrong dimensionality for the
    /// requested operation.
    #[error("dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    /// A covariance matrix has an eigenvalue below the negative floor.
    /// Eigenvalues within the floor are clamped; anything below it is an
    /// internal invariant violation.
    #[error("covariance not positive semi-definite: min eigenvalue {min_eigenvalue}")]
    NonPositiveDefinite { min_eigenvalue: f64 },

    /// An edge or path was built from degenerate geometry.
    #[error("geometry error: {0}")]
    Geometry(String),

    /// Configuration values outside their documented domain.
    #[error("invalid parameters: {0}")]
    InvalidParameters(String),

    /// Every particle candidate was dropped during an update step.
    #[error("particle population depleted: no candidate survived the update")]
    ParticleDepletion,
}

pub type Result<T> = std::result::Result<T, TrackingError>;
