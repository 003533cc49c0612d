//! Linear algebra utilities for covariance manipulation.
//!
//! Every operation that can produce an ill-conditioned covariance goes
//! through [`psd_sqrt`], which clamps small negative eigenvalues to zero and
//! fails fast on anything below the floor. [`pseudo_inverse_sqrt`] provides
//! the truncated spectral pseudoinverse square root used when inverting
//! covariance factors.

use nalgebra::{DMatrix, DVector};

use crate::error::{Result, TrackingError};

/// Eigenvalue floor shared by the square-root and pseudoinverse routines.
/// Eigenvalues with magnitude at or below this are treated as zero; values
/// below the negative floor indicate a numerical bug upstream.
pub const EIGEN_TOLERANCE: f64 = 1e-7;

/// Force symmetry by averaging a matrix with its transpose.
pub fn symmetrize(m: &DMatrix<f64>) -> DMatrix<f64> {
    (m + m.transpose()) * 0.5
}

/// Square root of a symmetric positive semi-definite matrix.
///
/// Tries Cholesky first (positive definite fast path). On failure, falls
/// back to a symmetric eigendecomposition with eigenvalues clamped to zero
/// within [`EIGEN_TOLERANCE`]; an eigenvalue below `-EIGEN_TOLERANCE` is an
/// invariant violation and returns an error. Either way the result `S`
/// satisfies `S * S.transpose() ≈ m`.
pub fn psd_sqrt(m: &DMatrix<f64>) -> Result<DMatrix<f64>> {
    debug_assert!(m.is_square());
    if let Some(chol) = m.clone().cholesky() {
        return Ok(chol.l());
    }

    let eigen = symmetrize(m).symmetric_eigen();
    let min = eigen.eigenvalues.min();
    if min < -EIGEN_TOLERANCE {
        return Err(TrackingError::NonPositiveDefinite { min_eigenvalue: min });
    }
    let sqrt_vals: DVector<f64> = eigen.eigenvalues.map(|v| v.max(0.0).sqrt());
    let sqrt_diag = DMatrix::from_diagonal(&sqrt_vals);
    Ok(&eigen.eigenvectors * sqrt_diag * eigen.eigenvectors.transpose())
}

/// Verify that a covariance has no eigenvalue below the negative floor.
pub fn check_psd(m: &DMatrix<f64>) -> Result<()> {
    let eigen = symmetrize(m).symmetric_eigen();
    let min = eigen.eigenvalues.min();
    if min < -EIGEN_TOLERANCE {
        Err(TrackingError::NonPositiveDefinite { min_eigenvalue: min })
    } else {
        Ok(())
    }
}

/// Truncated spectral pseudoinverse square root of a symmetric positive
/// semi-definite matrix.
///
/// Returns `F⁻` with `F⁻ * m * F⁻.transpose() ≈ I` on the range of `m`;
/// eigenvalues at or below [`EIGEN_TOLERANCE`] are truncated to zero rather
/// than inverted.
pub fn pseudo_inverse_sqrt(m: &DMatrix<f64>) -> Result<DMatrix<f64>> {
    let eigen = symmetrize(m).symmetric_eigen();
    let min = eigen.eigenvalues.min();
    if min < -EIGEN_TOLERANCE {
        return Err(TrackingError::NonPositiveDefinite { min_eigenvalue: min });
    }
    let inv_sqrt_vals: DVector<f64> = eigen
        .eigenvalues
        .map(|v| if v > EIGEN_TOLERANCE { 1.0 / v.sqrt() } else { 0.0 });
    let inv_sqrt_diag = DMatrix::from_diagonal(&inv_sqrt_vals);
    Ok(&eigen.eigenvectors * inv_sqrt_diag * eigen.eigenvectors.transpose())
}

/// Solve `a * x = b` for a symmetric positive (semi-)definite `a`, falling
/// back to the spectral pseudoinverse when Cholesky fails.
pub fn spd_solve(a: &DMatrix<f64>, b: &DMatrix<f64>) -> Result<DMatrix<f64>> {
    if let Some(chol) = a.clone().cholesky() {
        return Ok(chol.solve(b));
    }
    let pinv_sqrt = pseudo_inverse_sqrt(a)?;
    // pinv(a) = F⁻ᵀ F⁻ for the symmetric pseudoinverse square root.
    Ok(&pinv_sqrt.transpose() * &pinv_sqrt * b)
}
