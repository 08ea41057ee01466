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

use super::{Filter, MeasurementUpdate};
use crate::linalg::{DMatrix, DVector};
use crate::od::{DimensionMismatchSnafu, NotPositiveDefiniteSnafu, ODError, SingularInnovationSnafu};
use crate::utils::{cholesky_lower, symmetrize, thin_qr};
use snafu::prelude::*;

/// Extended Kalman filter measurement update.
///
/// In square root form, the a-priori factor `S` is updated with two thin QR decompositions:
/// `Sw = qr([H S | Sr])`, `K = S Sᵀ Hᵀ (Sw Swᵀ)⁻¹` and `S⁺ = qr([(I - K H) S | K Sr])`, where `Sr` is the
/// Cholesky factor of the measurement noise. The Joseph form is used otherwise, or when the a-priori
/// covariance cannot be factored.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct KF {
    square_root: bool,
}

impl Default for KF {
    fn default() -> Self {
        Self::new()
    }
}

impl KF {
    /// Square root filter
    pub fn new() -> Self {
        Self { square_root: true }
    }

    /// Conventional filter with a Joseph form covariance update
    pub fn joseph() -> Self {
        Self { square_root: false }
    }

    fn joseph_update(
        covar_bar: &DMatrix<f64>,
        sensitivity: &DMatrix<f64>,
        noise: &DMatrix<f64>,
        innovation: &DVector<f64>,
    ) -> Result<MeasurementUpdate, ODError> {
        let n = covar_bar.nrows();
        let s_k = sensitivity * covar_bar * sensitivity.transpose() + noise;
        let s_k_inv = s_k.try_inverse().context(SingularInnovationSnafu)?;
        let gain = covar_bar * sensitivity.transpose() * s_k_inv;

        let state_correction = &gain * innovation;
        let postfit = innovation - sensitivity * &state_correction;

        let first_term = DMatrix::<f64>::identity(n, n) - &gain * sensitivity;
        let mut covar = &first_term * covar_bar * first_term.transpose()
            + &gain * noise * gain.transpose();
        symmetrize(&mut covar);

        Ok(MeasurementUpdate {
            state_correction,
            covar,
            sqrt_covar: None,
            gain,
            postfit,
        })
    }
}

impl Filter for KF {
    fn measurement_update(
        &mut self,
        covar_bar: &DMatrix<f64>,
        sqrt_covar_bar: Option<&DMatrix<f64>>,
        sensitivity: &DMatrix<f64>,
        noise: &DMatrix<f64>,
        innovation: &DVector<f64>,
    ) -> Result<MeasurementUpdate, ODError> {
        let n = covar_bar.nrows();
        let m = innovation.len();
        ensure!(
            sensitivity.nrows() == m && sensitivity.ncols() == n,
            DimensionMismatchSnafu {
                action: "measurement sensitivity",
                expected: n,
                got: sensitivity.ncols()
            }
        );
        ensure!(
            noise.nrows() == m && noise.ncols() == m,
            DimensionMismatchSnafu {
                action: "measurement noise",
                expected: m,
                got: noise.nrows()
            }
        );

        if !self.square_root {
            return Self::joseph_update(covar_bar, sensitivity, noise, innovation);
        }

        let sqrt_bar = match sqrt_covar_bar {
            Some(s) => s.clone(),
            None => match cholesky_lower(covar_bar) {
                Some(s) => s,
                None => {
                    debug!("a-priori covariance is not positive definite: using the Joseph form update");
                    return Self::joseph_update(covar_bar, sensitivity, noise, innovation);
                }
            },
        };
        let sqrt_noise = cholesky_lower(noise).context(NotPositiveDefiniteSnafu {
            matrix: "measurement noise",
        })?;

        let h_s = sensitivity * &sqrt_bar;
        let sqrt_w = thin_qr(&h_s, &sqrt_noise);
        let w_inv = (&sqrt_w * sqrt_w.transpose())
            .try_inverse()
            .context(SingularInnovationSnafu)?;
        let gain = &sqrt_bar * h_s.transpose() * w_inv;

        let state_correction = &gain * innovation;
        let postfit = innovation - sensitivity * &state_correction;

        let reduced = (DMatrix::<f64>::identity(n, n) - &gain * sensitivity) * &sqrt_bar;
        let sqrt_covar = thin_qr(&reduced, &(&gain * &sqrt_noise));
        let mut covar = &sqrt_covar * sqrt_covar.transpose();
        symmetrize(&mut covar);

        trace!("gain = {gain}");

        Ok(MeasurementUpdate {
            state_correction,
            covar,
            sqrt_covar: Some(sqrt_covar),
            gain,
            postfit,
        })
    }

    fn is_square_root(&self) -> bool {
        self.square_root
    }
}
