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

use crate::io::{
    duration_from_str, duration_to_str, epoch_from_str, epoch_to_str, zero_duration, ConfigError,
    ConfigRepr,
};
use crate::state::CovarPropagation;
use crate::time::{Duration, Epoch};
use serde_derive::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use typed_builder::TypedBuilder;

/// Direction in which the observations are processed.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunDirection {
    #[default]
    Forward,
    Backward,
}

impl RunDirection {
    pub fn is_forward(self) -> bool {
        self == Self::Forward
    }

    /// Sign of the propagation steps in this direction.
    pub fn sign(self) -> f64 {
        match self {
            Self::Forward => 1.0,
            Self::Backward => -1.0,
        }
    }
}

impl fmt::Display for RunDirection {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Forward => write!(f, "forward"),
            Self::Backward => write!(f, "backward"),
        }
    }
}

/// Selects the warm start record to restart from.
#[derive(Copy, Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub enum RestartEpoch {
    /// Last record strictly before the first observation
    #[default]
    FirstMeasurement,
    /// Chronologically last record of the file, regardless of any epoch
    LastWarmStartRecord,
    /// Earliest record of the file
    EarliestRecord,
    /// Closest record at or before this epoch
    Epoch(
        #[serde(serialize_with = "epoch_to_str", deserialize_with = "epoch_from_str")] Epoch,
    ),
    /// Record at exactly this epoch
    ExactEpoch(
        #[serde(serialize_with = "epoch_to_str", deserialize_with = "epoch_from_str")] Epoch,
    ),
}

/// Measurement de-weighting: the measurement noise is inflated by `1 + coefficient` when the
/// position uncertainty exceeds the threshold.
#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Deweighting {
    /// Position uncertainty threshold, in km
    pub threshold: f64,
    pub coefficient: f64,
}

impl Deweighting {
    /// Returns the scaling factor of the measurement noise standard deviation, given the a-priori covariance.
    pub fn sigma_scale(&self, covar_bar: &crate::linalg::DMatrix<f64>) -> f64 {
        if self.coefficient <= 0.0 || covar_bar.nrows() < 3 {
            return 1.0;
        }
        let pos_sigma = (covar_bar[(0, 0)] + covar_bar[(1, 1)] + covar_bar[(2, 2)]).sqrt();
        if pos_sigma > self.threshold {
            (1.0 + self.coefficient).sqrt()
        } else {
            1.0
        }
    }
}

/// Configuration of the sequential estimator.
#[derive(Clone, Debug, PartialEq, TypedBuilder, Serialize, Deserialize)]
#[builder(doc)]
pub struct EstimatorConfig {
    /// Interval between two process noise updates; zero defers to the process noise models
    #[builder(default = Duration::ZERO)]
    #[serde(
        serialize_with = "duration_to_str",
        deserialize_with = "duration_from_str",
        default = "zero_duration"
    )]
    pub process_noise_step: Duration,
    /// Sigma editing gate: observations whose residual exceed this many sigmas are rejected
    #[builder(default = 3.0)]
    #[serde(default = "default_sigma_multiplier")]
    pub sigma_multiplier: f64,
    #[builder(default, setter(strip_option))]
    #[serde(default)]
    pub deweighting: Option<Deweighting>,
    /// Span after the start of the estimation during which corrections are held as an offset from the reference
    #[builder(default = Duration::ZERO)]
    #[serde(
        serialize_with = "duration_to_str",
        deserialize_with = "duration_from_str",
        default = "zero_duration"
    )]
    pub delayed_rectification_span: Duration,
    #[builder(default, setter(strip_option, into))]
    #[serde(default)]
    pub warm_start_input: Option<PathBuf>,
    #[builder(default, setter(strip_option, into))]
    #[serde(default)]
    pub warm_start_output: Option<PathBuf>,
    #[builder(default)]
    #[serde(default)]
    pub restart_epoch: RestartEpoch,
    #[builder(default)]
    #[serde(default)]
    pub direction: RunDirection,
    /// Measurement free propagation after the last observation
    #[builder(default = Duration::ZERO)]
    #[serde(
        serialize_with = "duration_to_str",
        deserialize_with = "duration_from_str",
        default = "zero_duration"
    )]
    pub predict_span: Duration,
    /// Covariance propagation method, defaults to square root when process noise is modeled
    #[builder(default, setter(strip_option))]
    #[serde(default)]
    pub covariance_method: Option<CovarPropagation>,
}

fn default_sigma_multiplier() -> f64 {
    3.0
}

impl Default for EstimatorConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl EstimatorConfig {
    /// Checks the bounds of every option.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.sigma_multiplier > 0.0) {
            return Err(ConfigError::InvalidConfig {
                msg: format!(
                    "sigma multiplier must be strictly positive, got {}",
                    self.sigma_multiplier
                ),
            });
        }
        for (name, span) in [
            ("process noise step", self.process_noise_step),
            ("delayed rectification span", self.delayed_rectification_span),
            ("predict span", self.predict_span),
        ] {
            if span < Duration::ZERO {
                return Err(ConfigError::InvalidConfig {
                    msg: format!("{name} must be positive or zero, got {span}"),
                });
            }
        }
        if let Some(dw) = self.deweighting {
            if dw.threshold < 0.0 || dw.coefficient < 0.0 {
                return Err(ConfigError::InvalidConfig {
                    msg: format!(
                        "de-weighting threshold and coefficient must be positive, got {} and {}",
                        dw.threshold, dw.coefficient
                    ),
                });
            }
        }
        Ok(())
    }
}

impl ConfigRepr for EstimatorConfig {}

impl fmt::Display for EstimatorConfig {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{} run with {}σ editing, noise step of {}, predict span of {}",
            self.direction, self.sigma_multiplier, self.process_noise_step, self.predict_span
        )
    }
}
