/*
    Nyx, blazing fast astrodynamics
    Copyright (C) 2021 Christopher Rabotin <christopher.rabotin@gmail.com>

    This program is free software: you can redistribute it and/or modify
    it under the terms of the GNU Affero General Public License as published
    by the Free Software Foundation, either version 3 of the License, or
    (at your option) any later version.

    This program is distributed in the hope that it will be useful,
    but WITHOUT ANY WARRANTY; without even the implied warranty of
    MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
    GNU Affero General Public License for more details.

    You should have received a copy of the GNU Affero General Public License
    along with this program.  If not, see <https://www.gnu.org/licenses/>.
*/

use crate::linalg::{DMatrix, Matrix3, Vector3};

/// Makes the provided square matrix symmetric in place: `m(i,j) = m(j,i) = (m(i,j) + m(j,i)) / 2`.
pub fn symmetrize(m: &mut DMatrix<f64>) {
    let n = m.nrows().min(m.ncols());
    for i in 0..n {
        for j in 0..i {
            let avg = 0.5 * (m[(i, j)] + m[(j, i)]);
            m[(i, j)] = avg;
            m[(j, i)] = avg;
        }
    }
}

/// Returns whether the provided matrix is square and symmetric to within the absolute tolerance.
pub fn is_symmetric(m: &DMatrix<f64>, tol: f64) -> bool {
    if m.nrows() != m.ncols() {
        return false;
    }
    for i in 0..m.nrows() {
        for j in 0..i {
            if (m[(i, j)] - m[(j, i)]).abs() > tol {
                return false;
            }
        }
    }
    true
}

/// Returns the lower triangular Cholesky factor `L` such that `L Lᵀ = m`, or None if `m` is not positive definite.
pub fn cholesky_lower(m: &DMatrix<f64>) -> Option<DMatrix<f64>> {
    // A null pivot does not fail the factorization but spreads non finite values
    m.clone()
        .cholesky()
        .map(|chol| chol.l())
        .filter(|l| l.iter().all(|v| v.is_finite()))
}

/// Relative magnitude, with respect to the largest eigenvalue, under which a negative eigenvalue is round-off.
pub const PSD_EIGEN_TOL: f64 = 1e-12;

/// Returns a square root `S` (n×n, not triangular) such that `S Sᵀ = m` for a symmetric positive
/// semi-definite matrix, or None if `m` has a significantly negative eigenvalue.
///
/// With the eigen decomposition `m = V Λ Vᵀ`, the factor is `S = V √Λ`, where eigenvalues within
/// [`PSD_EIGEN_TOL`] of zero are clamped to zero. This handles rank deficient matrices, such as the outer
/// product of a vector, which a Cholesky factorization rejects.
pub fn psd_sqrt(m: &DMatrix<f64>) -> Option<DMatrix<f64>> {
    if m.nrows() != m.ncols() || m.iter().any(|v| !v.is_finite()) {
        return None;
    }
    let mut sym = m.clone();
    symmetrize(&mut sym);
    let eigen = sym.symmetric_eigen();
    let floor = -PSD_EIGEN_TOL * eigen.eigenvalues.amax();
    if eigen.eigenvalues.iter().any(|&lambda| lambda < floor) {
        return None;
    }
    let mut s = eigen.eigenvectors;
    for (j, lambda) in eigen.eigenvalues.iter().enumerate() {
        s.column_mut(j).scale_mut(lambda.max(0.0).sqrt());
    }
    Some(s)
}

/// Cholesky factorization which tolerates rows and columns that are entirely zero (e.g. a noise matrix
/// where some states receive no noise).
///
/// The zero rows and columns are compressed out, the remaining block is factored, and the factor is
/// expanded back to the original dimension with zeros in the removed rows and columns.
pub fn cholesky_lower_compressed(m: &DMatrix<f64>) -> Option<DMatrix<f64>> {
    let n = m.nrows();
    let kept: Vec<usize> = (0..n).filter(|&i| m[(i, i)] != 0.0).collect();
    if kept.len() == n {
        return cholesky_lower(m);
    }

    let mut expanded = DMatrix::zeros(n, n);
    if kept.is_empty() {
        return Some(expanded);
    }

    let reduced = DMatrix::from_fn(kept.len(), kept.len(), |i, j| m[(kept[i], kept[j])]);
    let reduced_l = cholesky_lower(&reduced)?;
    for (ri, &i) in kept.iter().enumerate() {
        for (rj, &j) in kept.iter().enumerate() {
            expanded[(i, j)] = reduced_l[(ri, rj)];
        }
    }
    Some(expanded)
}

/// Returns the lower triangular `S` (n×n) such that `S Sᵀ = A Aᵀ + B Bᵀ`, where `A` is n×n and `B` is n×m.
///
/// This is the thin QR decomposition of the n×(n+m) block `[A | B]`: the transposed block is factored
/// as `Q R` and the n×n upper triangle `R` is returned transposed.
pub fn thin_qr(a: &DMatrix<f64>, b: &DMatrix<f64>) -> DMatrix<f64> {
    let n = a.nrows();
    let m = b.ncols();
    let mut stacked = DMatrix::zeros(a.ncols() + m, n);
    stacked
        .view_mut((0, 0), (a.ncols(), n))
        .copy_from(&a.transpose());
    if m > 0 {
        stacked.view_mut((a.ncols(), 0), (m, n)).copy_from(&b.transpose());
    }
    let r = stacked.qr().r();
    // When the block has fewer rows than columns, R is short and the missing rows are zero.
    let mut s = DMatrix::zeros(n, n);
    let rows = r.nrows().min(n);
    s.view_mut((0, 0), (n, rows))
        .copy_from(&r.rows(0, rows).transpose());
    s
}

/// Returns the rotation from the inertial frame into the velocity-normal-binormal frame, where
/// V is along the velocity, N along the orbit normal, and B completes the triad.
/// Returns None if the position and velocity are colinear or zero.
pub fn vnb_dcm(radius: &Vector3<f64>, velocity: &Vector3<f64>) -> Option<Matrix3<f64>> {
    let v_hat = velocity.try_normalize(f64::EPSILON)?;
    let n_hat = radius.cross(velocity).try_normalize(f64::EPSILON)?;
    let b_hat = v_hat.cross(&n_hat);
    Some(Matrix3::from_rows(&[
        v_hat.transpose(),
        n_hat.transpose(),
        b_hat.transpose(),
    ]))
}
