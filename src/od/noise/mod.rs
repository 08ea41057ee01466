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

use crate::linalg::DMatrix;
use crate::state::NoiseContext;
use crate::time::Duration;
use std::fmt::Debug;

pub mod gauss_markov;

pub use super::snc::SNC;
pub use gauss_markov::GaussMarkov;

/// Models the growth of the uncertainty of one object between two updates, due to unmodeled dynamics.
pub trait ProcessNoiseModel: Debug {
    /// Number of rows (and columns) of the noise matrix: it applies to the leading solve-for states of the object.
    fn size(&self) -> usize;

    /// Returns the noise covariance accumulated over the (absolute) elapsed time, in the provided dynamics context.
    fn noise_matrix(&self, elapsed: Duration, context: &NoiseContext) -> DMatrix<f64>;

    /// Preferred interval between two process noise updates, zero if the model has no preference.
    fn update_step(&self) -> Duration {
        Duration::ZERO
    }
}
