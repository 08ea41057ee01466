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

use super::ODError;
use crate::linalg::{DMatrix, DVector};

pub mod kalman;
pub use kalman::KF;

/// Result of a measurement update.
#[derive(Clone, Debug, PartialEq)]
pub struct MeasurementUpdate {
    /// Correction to apply to the a-priori solve-for state
    pub state_correction: DVector<f64>,
    pub covar: DMatrix<f64>,
    /// Lower triangular square root of the updated covariance, if it was computed in square root form
    pub sqrt_covar: Option<DMatrix<f64>>,
    pub gain: DMatrix<f64>,
    /// Innovation after the correction, `y - H δx`
    pub postfit: DVector<f64>,
}

/// Defines the measurement update of a sequential filter over a dynamically sized solve-for state.
pub trait Filter {
    /// Computes the measurement update from the a-priori covariance and the innovation
    /// (observed minus computed, less any pending reference offset).
    ///
    /// The square root of the a-priori covariance is used when available, and computed otherwise.
    fn measurement_update(
        &mut self,
        covar_bar: &DMatrix<f64>,
        sqrt_covar_bar: Option<&DMatrix<f64>>,
        sensitivity: &DMatrix<f64>,
        noise: &DMatrix<f64>,
        innovation: &DVector<f64>,
    ) -> Result<MeasurementUpdate, ODError>;

    /// Returns whether this filter maintains the square root of the covariance
    fn is_square_root(&self) -> bool;
}
