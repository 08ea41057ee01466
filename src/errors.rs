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

use snafu::prelude::*;

/// Errors raised while assembling, mapping, or propagating the covariance of the propagation state vector.
#[derive(Debug, PartialEq, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum StateError {
    #[snafu(display("object {object} is already registered"))]
    DuplicateObject { object: String },
    #[snafu(display("object #{handle} is not registered or not available"))]
    UnregisteredObject { handle: usize },
    #[snafu(display("unknown state element {element} on object {object}"))]
    UnknownElement { object: String, element: String },
    #[snafu(display(
        "state element {element} on object {object} has size set less than or equal to 0"
    ))]
    InvalidElementSize { object: String, element: String },
    #[snafu(display("value for parameter {parameter} on object {object} is not a number"))]
    NotANumber { object: String, parameter: String },
    #[snafu(display("value for parameter {parameter} on object {object} is infinite"))]
    Infinite { object: String, parameter: String },
    #[snafu(display("{matrix} is not positive definite"))]
    NotPositiveDefinite { matrix: String },
    #[snafu(display("state transition matrix of {object} is singular"))]
    SingularStm { object: String },
    #[snafu(display("{action} requires dimension {expected} but got {got}"))]
    DimensionMismatch {
        action: &'static str,
        expected: usize,
        got: usize,
    },
    #[snafu(display("the propagation state vector has no elements"))]
    EmptyState,
}

impl StateError {
    /// Returns true if this error stems from the registration or configuration of the state, as opposed to its numerics.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            Self::DuplicateObject { .. }
                | Self::UnregisteredObject { .. }
                | Self::UnknownElement { .. }
                | Self::InvalidElementSize { .. }
                | Self::DimensionMismatch { .. }
                | Self::EmptyState
        )
    }
}
