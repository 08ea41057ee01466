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

use crate::linalg::{DMatrix, DVector};
use crate::time::Epoch;
use serde_derive::{Deserialize, Serialize};
use snafu::prelude::*;
use std::fmt;

/// An observation as evaluated by the measurement manager at the current state.
#[derive(Clone, Debug, PartialEq)]
pub struct Observation {
    /// Identifier of the tracking data this observation comes from (e.g. station and data type)
    pub id: String,
    pub epoch: Epoch,
    pub observed: DVector<f64>,
    pub computed: DVector<f64>,
    /// Partials of the computed observation with respect to the solve-for state (H tilde)
    pub sensitivity: DMatrix<f64>,
    /// Measurement noise covariance
    pub noise: DMatrix<f64>,
}

impl Observation {
    /// Observed minus computed.
    pub fn prefit(&self) -> DVector<f64> {
        &self.observed - &self.computed
    }

    pub fn size(&self) -> usize {
        self.observed.len()
    }
}

impl fmt::Display for Observation {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} @ {} (size {})", self.id, self.epoch, self.size())
    }
}

/// Status of an event (e.g. light time solution or occultation) the measurement depends on.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum EventStatus {
    Pending,
    Located,
}

/// Reason for which an observation is not used by the estimator.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum EditReason {
    /// Residual larger than the sigma editing gate
    SigmaEdit,
    /// The measurement could not be computed at the current state (e.g. not visible)
    NotComputable,
    /// Observation prior to the start of the run, in the run direction
    OutOfOrder,
}

impl fmt::Display for EditReason {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::SigmaEdit => write!(f, "sigma edit"),
            Self::NotComputable => write!(f, "not computable"),
            Self::OutOfOrder => write!(f, "out of order"),
        }
    }
}

#[derive(Debug, PartialEq, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum MeasurementError {
    #[snafu(display("could not compute measurement {id} @ {epoch}: {details}"))]
    Computation {
        id: String,
        epoch: Epoch,
        details: String,
    },
    #[snafu(display("event #{index} could not be resolved @ {epoch}: {details}"))]
    EventResolution {
        index: usize,
        epoch: Epoch,
        details: String,
    },
    #[snafu(display("no observation was calculated @ {epoch}"))]
    NoObservation { epoch: Epoch },
}

/// The measurement manager provides the observations, in the run direction, and evaluates the computed
/// observations and their sensitivity from the current solve-for state. The estimator never inspects the
/// measurement physics.
pub trait MeasurementManager {
    /// Evaluates the current observation at the provided epoch and solve-for state.
    /// Returns false if the measurement cannot be computed (e.g. the tracker does not see the object).
    fn calculate_measurements(
        &mut self,
        epoch: Epoch,
        state: &DVector<f64>,
    ) -> Result<bool, MeasurementError>;

    /// Number of events which must be located before the calculated observation is usable.
    fn event_count(&self) -> usize {
        0
    }

    /// Refines the solution of an event and returns whether it is located.
    fn locate_event(&mut self, _index: usize) -> Result<EventStatus, MeasurementError> {
        Ok(EventStatus::Located)
    }

    /// Hands a located event back to the measurement model.
    fn process_event(&mut self, _index: usize) -> Result<(), MeasurementError> {
        Ok(())
    }

    /// Epoch of the next pending observation, in the run direction.
    fn epoch(&self) -> Option<Epoch>;

    /// The observation evaluated by the latest call to [Self::calculate_measurements].
    fn observation(&self) -> Option<&Observation>;

    /// Moves on to the next observation, returns false if no observation remains.
    fn advance(&mut self) -> bool;

    /// Rewinds to the first observation in the run direction.
    fn reset(&mut self);

    fn set_direction(&mut self, forward: bool);

    /// Marks the current observation as not used by the estimator.
    fn mark_unused(&mut self, reason: EditReason);

    /// Drops the observations which precede the provided epoch in the run direction, and returns the number of remaining observations.
    fn drop_before(&mut self, epoch: Epoch, forward: bool) -> usize;
}
