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

/*! # seqod

Sequential orbit determination: the assembly of the propagation state vector of several objects, the
propagation of their covariance (in direct or square root form), and a Kalman filter state machine which
interleaves propagation, measurement evaluation and filter updates, with smoothing runs and warm restarts.

The dynamics and the measurement models are provided by the caller through the [propagators::DynamicsPropagator]
and [od::msr::MeasurementManager] traits.
*/

/// Provides the interface to the dynamics propagators driven by the filter.
pub mod propagators;

/// Provides the propagated objects and the assembly of their propagation state vector.
pub mod state;

/// Utility functions shared by different modules, and which may be useful to engineers.
pub mod utils;

mod errors;
/// Functions which may fail return an error instead of panicking.
pub use self::errors::StateError;

/// All the input/output needs for this library: configuration files and warm start checkpoints.
pub mod io;

/// All the orbital determination tools and functions.
pub mod od;

#[macro_use]
extern crate log;
extern crate hifitime;
extern crate nalgebra as na;

/// Re-export of hifitime
pub mod time {
    pub use hifitime::*;
}

/// Re-export nalgebra
pub mod linalg {
    pub use na::base::*;
}

/// Re-export some useful things
pub use self::state::{
    ElementKind, ObjectHandle, PropagatedObject, Spacecraft, StateVectorAssembler,
};
