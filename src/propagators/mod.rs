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

use crate::errors::StateError;
use crate::state::PropagatedObject;
use crate::time::{Duration, Epoch};
use snafu::prelude::*;
use std::fmt;

/// Stores the details of the latest step of a dynamics propagator.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct IntegrationDetails {
    /// step size used
    pub step: Duration,
    /// error in the previous integration step
    pub error: f64,
    /// number of attempts needed by an adaptive step size to be within the tolerance
    pub attempts: u8,
}

impl IntegrationDetails {
    /// Details of a fixed step which needed a single attempt.
    pub fn fixed(step: Duration) -> Self {
        Self {
            step,
            error: 0.0,
            attempts: 1,
        }
    }
}

impl fmt::Display for IntegrationDetails {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "IntegrationDetails {{step: {}, error: {:.3e}, attempts: {}}}",
            self.step, self.error, self.attempts
        )
    }
}

#[derive(Debug, PartialEq, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum PropagationError {
    #[snafu(display("propagation step of {step} from {epoch} failed: {details}"))]
    StepFailed {
        epoch: Epoch,
        step: Duration,
        details: String,
    },
    #[snafu(display("propagation failed because {source}"))]
    PropState { source: StateError },
}

/// The dynamical propagator driven by the filter.
///
/// The propagator owns the objects it advances. They are referred to by their index in [Self::objects],
/// and it is expected to advance their state transition matrix along with their state: the STM of each object
/// accumulates since the last time the filter reset it to identity.
pub trait DynamicsPropagator {
    type Object: PropagatedObject;

    /// Advances every object by the signed step.
    fn step(&mut self, step: Duration) -> Result<IntegrationDetails, PropagationError>;

    /// Current state of the propagated objects.
    fn objects(&self) -> &[Self::Object];

    fn objects_mut(&mut self) -> &mut [Self::Object];

    /// Epoch of the first object, or None if there are no objects.
    fn epoch(&self) -> Option<Epoch> {
        self.objects().first().map(|obj| obj.epoch())
    }
}
