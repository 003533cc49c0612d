//! Inverse-Wishart priors over covariance matrices.
//!
//! The three unknown covariances (observation noise, on-road and off-road
//! process noise) are carried as inverse-Wishart sufficient statistics
//! `(ν, Ψ)`. Each learning step applies the conjugate rank-1 update
//! `(ν, Ψ) ← (ν + 1, Ψ + e eᵀ)` and redraws a covariance from the
//! posterior.

use nalgebra::{DMatrix, DVector};
use rand::rngs::StdRng;
use rand_distr::{ChiSquared, Distribution, Normal};

use crate::error::{Result, TrackingError};
use crate::linalg::symmetrize;

/// Inverse-Wishart distribution with inverse scale `Ψ` and degrees of
/// freedom `ν > dim + 1` (so the mean exists).
#[derive(Clone, Debug, PartialEq)]
pub struct InverseWishart {
    inverse_scale: DMatrix<f64>,
    dof: f64,
}

impl InverseWishart {
    pub fn new(inverse_scale: DMatrix<f64>, dof: f64) -> Result<Self> {
        let dim = inverse_scale.nrows();
        if !inverse_scale.is_square() {
            return Err(TrackingError::DimensionMismatch {
                expected: dim,
                actual: inverse_scale.ncols(),
            });
        }
        if dof <= (dim + 1) as f64 {
            return Err(TrackingError::InvalidParameters(format!(
                "inverse-Wishart dof {dof} must exceed dim + 1 = {}",
                dim + 1
            )));
        }
        Ok(Self { inverse_scale: symmetrize(&inverse_scale), dof })
    }

    /// Prior whose mean equals `diag(scale)`: the inverse scale is
    /// `diag(scale) · (dof − dim − 1)`.
    pub fn from_expected_diagonal(scale: &[f64], dof: usize) -> Result<Self> {
        let dim = scale.len();
        let factor = dof as f64 - dim as f64 - 1.0;
        if factor <= 0.0 {
            return Err(TrackingError::InvalidParameters(format!(
                "dof {dof} too small for an inverse-Wishart mean in dimension {dim}"
            )));
        }
        let diagonal = DVector::from_iterator(dim, scale.iter().map(|v| v * factor));
        Self::new(DMatrix::from_diagonal(&diagonal), dof as f64)
    }

    pub fn dim(&self) -> usize {
        self.inverse_scale.nrows()
    }

    pub fn dof(&self) -> f64 {
        self.dof
    }

    pub fn inverse_scale(&self) -> &DMatrix<f64> {
        &self.inverse_scale
    }

    /// `Ψ / (ν − dim − 1)`.
    pub fn mean(&self) -> DMatrix<f64> {
        &self.inverse_scale / (self.dof - self.dim() as f64 - 1.0)
    }

    /// Conjugate update from a rank-1 residual outer product.
    pub fn observe(&mut self, residual: &DVector<f64>) {
        debug_assert_eq!(residual.len(), self.dim());
        self.observe_outer(&(residual * residual.transpose()));
    }

    /// Conjugate update from a precomputed outer product.
    pub fn observe_outer(&mut self, outer: &DMatrix<f64>) {
        debug_assert_eq!(outer.nrows(), self.dim());
        self.dof += 1.0;
        self.inverse_scale += outer;
    }

    /// Draw a covariance matrix.
    ///
    /// Uses the Bartlett decomposition: a Wishart draw with scale `Ψ⁻¹` is
    /// inverted to produce the inverse-Wishart sample.
    pub fn sample(&self, rng: &mut StdRng) -> Result<DMatrix<f64>> {
        let dim = self.dim();
        let chol_psi = self.inverse_scale.clone().cholesky().ok_or(
            TrackingError::NonPositiveDefinite { min_eigenvalue: f64::NAN },
        )?;
        let psi_inv = chol_psi.inverse();
        let l = psi_inv
            .clone()
            .cholesky()
            .ok_or(TrackingError::NonPositiveDefinite { min_eigenvalue: f64::NAN })?
            .l();

        let normal = Normal::new(0.0, 1.0).expect("unit normal");
        let mut bartlett = DMatrix::<f64>::zeros(dim, dim);
        for i in 0..dim {
            let chi = ChiSquared::new(self.dof - i as f64).map_err(|_| {
                TrackingError::InvalidParameters(format!(
                    "chi-squared dof {} not positive",
                    self.dof - i as f64
                ))
            })?;
            bartlett[(i, i)] = chi.sample(rng).sqrt();
            for j in 0..i {
                bartlett[(i, j)] = normal.sample(rng);
            }
        }

        let factor = l * bartlett;
        let wishart = &factor * factor.transpose();
        let sample = wishart.try_inverse().ok_or(TrackingError::NonPositiveDefinite {
            min_eigenvalue: f64::NAN,
        })?;
        Ok(symmetrize(&sample))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;
    use rand::SeedableRng;

    #[test]
    fn mean_matches_expected_diagonal() {
        let prior = InverseWishart::from_expected_diagonal(&[0.5, 2.0], 20).unwrap();
        let mean = prior.mean();
        assert_approx_eq!(mean[(0, 0)], 0.5, 1e-12);
        assert_approx_eq!(mean[(1, 1)], 2.0, 1e-12);
        assert_approx_eq!(mean[(0, 1)], 0.0, 1e-12);
    }

    #[test]
    fn observe_increments_dof_and_scale() {
        let mut prior = InverseWishart::from_expected_diagonal(&[1.0, 1.0], 10).unwrap();
        let before = prior.inverse_scale().clone();
        prior.observe(&DVector::from_vec(vec![2.0, 0.0]));
        assert_approx_eq!(prior.dof(), 11.0, 1e-12);
        assert_approx_eq!(prior.inverse_scale()[(0, 0)], before[(0, 0)] + 4.0, 1e-12);
    }

    #[test]
    fn insufficient_dof_is_rejected() {
        assert!(InverseWishart::from_expected_diagonal(&[1.0, 1.0], 3).is_err());
    }

    #[test]
    fn samples_concentrate_on_the_mean() {
        let prior = InverseWishart::from_expected_diagonal(&[0.04, 0.09], 200).unwrap();
        let mut rng = StdRng::seed_from_u64(11);
        let mut acc = DMatrix::<f64>::zeros(2, 2);
        let n = 400;
        for _ in 0..n {
            let s = prior.sample(&mut rng).unwrap();
            // Every draw is positive definite.
            assert!(s.clone().cholesky().is_some());
            acc += s;
        }
        acc /= n as f64;
        assert_approx_eq!(acc[(0, 0)], 0.04, 0.01);
        assert_approx_eq!(acc[(1, 1)], 0.09, 0.02);
    }
}
