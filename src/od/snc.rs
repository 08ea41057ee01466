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

use crate::io::{duration_from_str, duration_to_str, ConfigRepr};
use crate::linalg::DMatrix;
use crate::od::noise::ProcessNoiseModel;
use crate::state::NoiseContext;
use crate::time::{Duration, Epoch};
use serde_derive::{Deserialize, Serialize};
use std::fmt;

/// State noise compensation: white acceleration noise on each Cartesian axis, integrated into position and velocity noise.
///
/// For an acceleration sigma σ over an elapsed time dt, each axis receives
/// `σ² [dt³/3, dt²/2; dt²/2, dt]` on its position and velocity.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[allow(clippy::upper_case_acronyms)]
pub struct SNC {
    /// Acceleration sigma along each axis, in km/s^2
    pub accel_sigma: [f64; 3],
    /// Preferred process noise update interval, zero to let the filter decide
    #[serde(
        serialize_with = "duration_to_str",
        deserialize_with = "duration_from_str"
    )]
    pub update_step: Duration,
    /// Time at which this SNC starts to become applicable
    #[serde(skip)]
    pub start_time: Option<Epoch>,
    /// No noise is applied over intervals longer than this duration
    #[serde(skip)]
    pub disable_time: Option<Duration>,
}

impl fmt::Display for SNC {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "SNC: σ = ({:.1e}, {:.1e}, {:.1e}) km/s^2 {}",
            self.accel_sigma[0],
            self.accel_sigma[1],
            self.accel_sigma[2],
            if let Some(start) = self.start_time {
                format!("starting at {start}")
            } else {
                "".to_string()
            }
        )
    }
}

impl SNC {
    /// Initialize a state noise compensation structure from the acceleration sigmas
    pub fn from_sigmas(update_step: Duration, accel_sigma: [f64; 3]) -> Self {
        Self {
            accel_sigma,
            update_step,
            start_time: None,
            disable_time: None,
        }
    }

    /// Initialize an SNC with a time at which it should start
    pub fn with_start_time(mut self, start_time: Epoch) -> Self {
        self.start_time = Some(start_time);
        self
    }

    /// Only apply this SNC over intervals shorter than the provided duration
    pub fn with_disable_time(mut self, disable_time: Duration) -> Self {
        self.disable_time = Some(disable_time);
        self
    }
}

impl ConfigRepr for SNC {}

impl ProcessNoiseModel for SNC {
    fn size(&self) -> usize {
        6
    }

    fn noise_matrix(&self, elapsed: Duration, context: &NoiseContext) -> DMatrix<f64> {
        let mut q = DMatrix::zeros(6, 6);
        if let Some(start_time) = self.start_time {
            if start_time > context.epoch {
                // This SNC applies only later
                debug!("@{} SNC starts at {}", context.epoch, start_time);
                return q;
            }
        }

        if let Some(disable_time) = self.disable_time {
            if elapsed > disable_time {
                debug!(
                    "@{} SNC disabled: {} elapsed is greater than {}",
                    context.epoch, elapsed, disable_time
                );
                return q;
            }
        }

        let dt = elapsed.to_seconds();
        let dt2 = dt * dt;
        let dt3 = dt * dt2;
        for (i, sigma) in self.accel_sigma.iter().enumerate() {
            let var = sigma * sigma;
            q[(i, i)] = var * dt3 / 3.0;
            q[(i, i + 3)] = var * dt2 / 2.0;
            q[(i + 3, i)] = var * dt2 / 2.0;
            q[(i + 3, i + 3)] = var * dt;
        }

        trace!("@{} SNC diag {:?}", context.epoch, q.diagonal().as_slice());
        q
    }

    fn update_step(&self) -> Duration {
        self.update_step
    }
}
