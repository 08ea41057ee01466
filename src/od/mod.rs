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
use crate::io::checkpoint::CheckpointError;
use crate::io::ConfigError;
use crate::propagators::PropagationError;
use crate::time::Epoch;
use snafu::prelude::*;
use std::fmt;

/// Provides the measurement updates of the filter.
pub mod filter;
pub use filter::{Filter, KF};

/// Provides the interface to the measurement manager.
pub mod msr;

/// Provides noise modeling
pub mod noise;

/// Provides the filter state machine
pub mod process;

/// Provides all state noise compensation functionality
pub mod snc;

/// A helper type for a square root extended Kalman filter run.
pub type SequentialEstimator<P, M> = process::FilterStateMachine<P, M, KF>;

#[allow(unused_imports)]
pub mod prelude {
    pub use super::filter::*;
    pub use super::msr::*;
    pub use super::noise::{GaussMarkov, ProcessNoiseModel};
    pub use super::process::*;
    pub use super::snc::*;
    pub use super::*;

    pub use crate::time::{Duration, Epoch, TimeUnits, Unit};
}

/// Taxonomy of the estimation errors.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Invalid registration or configuration, raised before the run starts
    Configuration,
    /// Non finite values or factorization of a matrix which is not positive definite
    Numeric,
    /// Inconsistent data: checkpoint content, missing observations, unsynchronized logs
    DataConsistency,
    /// Surfaced unchanged from the measurement manager
    EventResolution,
    Io,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Configuration => write!(f, "configuration error"),
            Self::Numeric => write!(f, "numeric error"),
            Self::DataConsistency => write!(f, "data consistency error"),
            Self::EventResolution => write!(f, "event resolution error"),
            Self::Io => write!(f, "I/O error"),
        }
    }
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ODError {
    #[snafu(display("during an orbit determination, encountered {source}"))]
    ODStateError { source: StateError },
    #[snafu(display("during an orbit determination, encountered {source}"))]
    ODPropError { source: PropagationError },
    #[snafu(display("during an orbit determination, encountered {source}"))]
    ODMeasurementError { source: msr::MeasurementError },
    #[snafu(display("OD warm start failed because {source}"))]
    ODCheckpointError { source: CheckpointError },
    #[snafu(display("OD failed because {source}"))]
    ODConfigError { source: ConfigError },
    #[snafu(display("no estimated object participates in the run: {details}"))]
    NoParticipants { details: &'static str },
    #[snafu(display("object {object} has no a-priori covariance"))]
    MissingCovariance { object: String },
    #[snafu(display("object {object} has no state transition matrix"))]
    MissingStm { object: String },
    #[snafu(display("no observation remains after dropping those prior to {epoch}"))]
    NoMeasurementsRemain { epoch: Epoch },
    #[snafu(display("{matrix} is not positive definite"))]
    NotPositiveDefinite { matrix: &'static str },
    #[snafu(display("innovation covariance is singular"))]
    SingularInnovation,
    #[snafu(display("{action} requires dimension {expected} but got {got}"))]
    DimensionMismatch {
        action: &'static str,
        expected: usize,
        got: usize,
    },
    #[snafu(display("record @ {epoch} is out of order after {previous}"))]
    NonMonotonicRecord { epoch: Epoch, previous: Epoch },
    #[snafu(display("backward record @ {epoch} has no forward counterpart"))]
    SmoothingMismatch { epoch: Epoch },
    #[snafu(display("cannot {action} while the filter is {state}"))]
    InvalidAction {
        action: &'static str,
        state: process::FilterState,
    },
}

impl ODError {
    /// Maps this error onto the estimation error taxonomy.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::ODStateError { source } => {
                if source.is_configuration() {
                    ErrorCategory::Configuration
                } else {
                    ErrorCategory::Numeric
                }
            }
            Self::ODPropError { source } => match source {
                PropagationError::PropState { source } if source.is_configuration() => {
                    ErrorCategory::Configuration
                }
                _ => ErrorCategory::Numeric,
            },
            Self::ODMeasurementError { source } => match source {
                msr::MeasurementError::EventResolution { .. } => ErrorCategory::EventResolution,
                _ => ErrorCategory::DataConsistency,
            },
            Self::ODCheckpointError { source } => {
                if source.is_io() {
                    ErrorCategory::Io
                } else {
                    ErrorCategory::DataConsistency
                }
            }
            Self::ODConfigError { source } => match source {
                ConfigError::ReadError { .. } => ErrorCategory::Io,
                _ => ErrorCategory::Configuration,
            },
            Self::NoParticipants { .. }
            | Self::MissingCovariance { .. }
            | Self::MissingStm { .. }
            | Self::DimensionMismatch { .. }
            | Self::InvalidAction { .. } => ErrorCategory::Configuration,
            Self::NotPositiveDefinite { .. } | Self::SingularInnovation => ErrorCategory::Numeric,
            Self::NoMeasurementsRemain { .. }
            | Self::NonMonotonicRecord { .. }
            | Self::SmoothingMismatch { .. } => ErrorCategory::DataConsistency,
        }
    }
}
