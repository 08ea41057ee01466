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

use super::ProcessNoiseModel;
use crate::io::{duration_from_str, duration_to_str, zero_duration, ConfigError, ConfigRepr};
use crate::linalg::{DMatrix, Matrix3, Vector3};
use crate::state::NoiseContext;
use crate::time::{Duration, Unit};
use serde_derive::{Deserialize, Serialize};
use std::fmt;

/// Below this ratio of elapsed time over time constant, the noise integrals are evaluated with their Taylor series.
const SERIES_THRESHOLD: f64 = 0.01;

fn unit_scale() -> f64 {
    1.0
}

/// A first order Gauss-Markov process modeling a stochastic scale factor on the acceleration of an object.
///
/// The process noise is a 7x7 matrix over the position, the velocity and the scale factor. The coupling between
/// the kinematics and the scale factor is driven by the instantaneous acceleration of the object, so this model
/// requires dynamics context: without an acceleration, only the scale factor itself receives noise.
///
/// The model is as follows, where τ is the time constant and σ the steady state sigma of the scale factor b:
///
/// \dot{b(t)} = -1/τ b(t) + w(t), with E[w²] = 2σ²/τ
#[derive(Copy, Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct GaussMarkov {
    /// Time constant of the Gauss-Markov process.
    #[serde(
        serialize_with = "duration_to_str",
        deserialize_with = "duration_from_str"
    )]
    pub tau: Duration,
    /// Steady state standard deviation of the process.
    pub steady_state_sigma: f64,
    /// Conversion factor between the estimated parameter and the acceleration scale.
    #[serde(default = "unit_scale")]
    pub scale: f64,
    /// Preferred process noise update interval, zero to let the filter decide
    #[serde(
        serialize_with = "duration_to_str",
        deserialize_with = "duration_from_str",
        default = "zero_duration"
    )]
    pub update_step: Duration,
}

impl fmt::Display for GaussMarkov {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "First order Gauss-Markov process with τ = {} and σ = {}",
            self.tau, self.steady_state_sigma
        )
    }
}

impl GaussMarkov {
    /// Create a new first order Gauss-Markov process from its time constant and steady state sigma.
    pub fn new(tau: Duration, steady_state_sigma: f64) -> Result<Self, ConfigError> {
        let me = Self {
            tau,
            steady_state_sigma,
            scale: 1.0,
            update_step: Duration::ZERO,
        };
        me.validate()?;
        Ok(me)
    }

    /// Create a new first order Gauss-Markov process from its half life: τ = half life / ln(2).
    pub fn from_half_life(half_life: Duration, steady_state_sigma: f64) -> Result<Self, ConfigError> {
        Self::new(
            (half_life.to_seconds() / std::f64::consts::LN_2) * Unit::Second,
            steady_state_sigma,
        )
    }

    pub fn with_update_step(mut self, update_step: Duration) -> Self {
        self.update_step = update_step;
        self
    }

    /// Checks that the time constant is strictly positive and that the sigma and scale are valid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.tau <= Duration::ZERO {
            return Err(ConfigError::InvalidConfig {
                msg: format!("Gauss-Markov time constant must be positive, got {}", self.tau),
            });
        }
        if self.steady_state_sigma < 0.0 {
            return Err(ConfigError::InvalidConfig {
                msg: format!(
                    "Gauss-Markov sigma must be non-negative, got {}",
                    self.steady_state_sigma
                ),
            });
        }
        if self.scale <= 0.0 {
            return Err(ConfigError::InvalidConfig {
                msg: format!("Gauss-Markov scale must be positive, got {}", self.scale),
            });
        }
        Ok(())
    }

    /// Returns the integrals (pp, pv, pa, vv, va, aa) of the process over the elapsed time in seconds.
    fn gammas(&self, dt: f64) -> [f64; 6] {
        let tau = self.tau.to_seconds();
        let dt2 = dt * dt;
        let dt3 = dt * dt2;

        if (dt / tau).abs() >= SERIES_THRESHOLD {
            let tau2 = tau * tau;
            let tau3 = tau * tau2;
            let tau4 = tau * tau3;
            let tau5 = tau * tau4;
            let exp1 = (-dt / tau).exp();
            let exp2 = (-2.0 * dt / tau).exp();
            [
                tau5 * (0.5 - 0.5 * exp2)
                    + tau4 * (dt - 2.0 * dt * exp1)
                    + tau3 * (-dt2)
                    + tau2 * (dt3 / 3.0),
                tau4 * (0.5 + 0.5 * exp2 - exp1) + tau3 * (dt * exp1 - dt) + tau2 * (0.5 * dt2),
                tau3 * (0.5 - 0.5 * exp2) + tau2 * (-dt * exp1),
                tau3 * (-1.5 - 0.5 * exp2 + 2.0 * exp1) + tau2 * dt,
                tau2 * (0.5 + 0.5 * exp2 - exp1),
                tau * (0.5 - 0.5 * exp2),
            ]
        } else {
            let dt4 = dt * dt3;
            let dt5 = dt * dt4;
            let r = dt / tau;
            let r2 = r * r;
            [
                dt5 * (1.0 / 20.0 - r / 36.0 + 5.0 * r2 / 504.0),
                dt4 * (1.0 / 8.0 - r / 12.0 + 5.0 * r2 / 144.0),
                dt3 * (1.0 / 6.0 - r / 6.0 + 11.0 * r2 / 120.0),
                dt3 * (1.0 / 3.0 - r / 4.0 + 7.0 * r2 / 60.0),
                dt2 * (1.0 / 2.0 - r / 2.0 + 7.0 * r2 / 24.0),
                dt * (1.0 - r + 2.0 * r2 / 3.0),
            ]
        }
    }
}

impl ConfigRepr for GaussMarkov {}

impl ProcessNoiseModel for GaussMarkov {
    fn size(&self) -> usize {
        7
    }

    fn noise_matrix(&self, elapsed: Duration, context: &NoiseContext) -> DMatrix<f64> {
        let dt = elapsed.to_seconds();
        let mut q = DMatrix::zeros(7, 7);
        if dt == 0.0 {
            return q;
        }

        let tau = self.tau.to_seconds();
        let sigma2 =
            2.0 * self.steady_state_sigma.powi(2) / (self.scale * self.scale * tau);
        let [pp, pv, pa, vv, va, aa] = self.gammas(dt);
        let accel = context.acceleration.unwrap_or_else(Vector3::zeros);
        let outer: Matrix3<f64> = accel * accel.transpose();

        for i in 0..3 {
            for j in 0..3 {
                q[(i, j)] = sigma2 * pp * outer[(i, j)];
                q[(i, j + 3)] = sigma2 * pv * outer[(i, j)];
                q[(i + 3, j)] = sigma2 * pv * outer[(i, j)];
                q[(i + 3, j + 3)] = sigma2 * vv * outer[(i, j)];
            }
            q[(i, 6)] = sigma2 * pa * accel[i];
            q[(6, i)] = sigma2 * pa * accel[i];
            q[(i + 3, 6)] = sigma2 * va * accel[i];
            q[(6, i + 3)] = sigma2 * va * accel[i];
        }
        q[(6, 6)] = sigma2 * aa;
        q
    }

    fn update_step(&self) -> Duration {
        self.update_step
    }
}
