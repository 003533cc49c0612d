//! Multivariate Gaussian beliefs.

use nalgebra::{DMatrix, DVector};
use rand::rngs::StdRng;
use rand_distr::{Distribution, Normal};

use crate::error::{Result, TrackingError};
use crate::linalg::{psd_sqrt, symmetrize, EIGEN_TOLERANCE};

const LN_2PI: f64 = 1.837_877_066_409_345_3;

/// A Gaussian belief over a 2D road state or a 4D ground state.
#[derive(Clone, Debug, PartialEq)]
pub struct MultivariateGaussian {
    pub mean: DVector<f64>,
    pub covariance: DMatrix<f64>,
}

impl MultivariateGaussian {
    pub fn new(mean: DVector<f64>, covariance: DMatrix<f64>) -> Result<Self> {
        if covariance.nrows() != mean.len() || !covariance.is_square() {
            return Err(TrackingError::DimensionMismatch {
                expected: mean.len(),
                actual: covariance.nrows(),
            });
        }
        Ok(Self {
            mean,
            covariance: symmetrize(&covariance),
        })
    }

    pub fn dim(&self) -> usize {
        self.mean.len()
    }

    /// Draw a sample through the positive semi-definite square root of the
    /// covariance.
    pub fn sample(&self, rng: &mut StdRng) -> Result<DVector<f64>> {
        let sqrt = psd_sqrt(&self.covariance)?;
        let normal = Normal::new(0.0, 1.0).expect("unit normal");
        let z = DVector::from_iterator(self.dim(), (0..self.dim()).map(|_| normal.sample(rng)));
        Ok(&self.mean + sqrt * z)
    }

    /// Log-density at `x`, including the normalization constant.
    ///
    /// Uses Cholesky when the covariance is positive definite; otherwise
    /// falls back to a pseudo-determinant and pseudoinverse over the
    /// eigenvalues above the shared tolerance.
    pub fn log_density(&self, x: &DVector<f64>) -> Result<f64> {
        if x.len() != self.dim() {
            return Err(TrackingError::DimensionMismatch {
                expected: self.dim(),
                actual: x.len(),
            });
        }
        let residual = x - &self.mean;
        if residual.iter().any(|v| !v.is_finite()) {
            return Ok(f64::NEG_INFINITY);
        }

        if let Some(chol) = self.covariance.clone().cholesky() {
            let log_det = 2.0 * chol.l().diagonal().map(|v| v.ln()).sum();
            let solved = chol.solve(&residual);
            let quad = residual.dot(&solved);
            return Ok(-0.5 * (self.dim() as f64 * LN_2PI + log_det + quad));
        }

        let eigen = symmetrize(&self.covariance).symmetric_eigen();
        let min = eigen.eigenvalues.min();
        if min < -EIGEN_TOLERANCE {
            return Err(TrackingError::NonPositiveDefinite { min_eigenvalue: min });
        }
        let mut log_det = 0.0;
        let mut rank = 0usize;
        let mut inv_vals = eigen.eigenvalues.clone();
        for v in inv_vals.iter_mut() {
            if *v > EIGEN_TOLERANCE {
                log_det += v.ln();
                rank += 1;
                *v = 1.0 / *v;
            } else {
                *v = 0.0;
            }
        }
        let pinv =
            &eigen.eigenvectors * DMatrix::from_diagonal(&inv_vals) * eigen.eigenvectors.transpose();
        let quad = residual.dot(&(&pinv * &residual));
        Ok(-0.5 * (rank as f64 * LN_2PI + log_det + quad))
    }
}
