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

use crate::errors::{DimensionMismatchSnafu, NotPositiveDefiniteSnafu, StateError};
use crate::linalg::DMatrix;
use crate::time::{Duration, Epoch};
use crate::utils::{cholesky_lower, cholesky_lower_compressed, psd_sqrt, symmetrize, thin_qr};
use serde_derive::{Deserialize, Serialize};
use snafu::prelude::*;
use std::fmt;

/// Threshold below which a diagonal entry of the propagated square root covariance is considered null.
const SQRT_DIAG_TOL: f64 = 1e-16;

/// Selects how a covariance is propagated between two update epochs.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum CovarPropagation {
    /// `P = Φ P Φᵀ (+ Q)`, then symmetrized.
    Direct,
    /// Propagates a persistent lower triangular Cholesky factor of the covariance with a thin QR decomposition.
    SquareRoot,
}

impl CovarPropagation {
    /// The square root form is used when process noise is modeled, the direct form otherwise.
    pub fn default_for(has_noise_model: bool) -> Self {
        if has_noise_model {
            Self::SquareRoot
        } else {
            Self::Direct
        }
    }
}

impl fmt::Display for CovarPropagation {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Direct => write!(f, "direct"),
            Self::SquareRoot => write!(f, "square root (Cholesky-QR)"),
        }
    }
}

/// Tracks the epochs of the two most recent covariance updates.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct UpdateEpochs {
    pub before_last: Epoch,
    pub at_last: Epoch,
}

impl UpdateEpochs {
    pub fn new(epoch: Epoch) -> Self {
        Self {
            before_last: epoch,
            at_last: epoch,
        }
    }

    /// True if the provided epoch is the epoch prior to the latest update, i.e. the caller is stepping back.
    pub fn is_reversion(&self, epoch: Epoch) -> bool {
        epoch == self.before_last && self.before_last != self.at_last
    }

    /// Records that an update happened at the provided epoch.
    pub fn record(&mut self, epoch: Epoch) {
        if self.is_reversion(epoch) {
            self.at_last = self.before_last;
        } else if epoch != self.at_last {
            self.before_last = self.at_last;
            self.at_last = epoch;
        }
    }

    /// Time span over which process noise must be accumulated for an update at the provided epoch.
    pub fn noise_interval(&self, epoch: Epoch) -> Duration {
        if self.before_last == self.at_last {
            (epoch - self.before_last).abs()
        } else {
            (epoch - self.at_last).abs()
        }
    }
}

/// Advances a covariance from the previous update epoch to the requested epoch.
///
/// Propagating at the epoch of the last update returns the covariance unchanged, and propagating back to the
/// epoch before the last update returns the cached covariance of that epoch: repeated evaluations at one epoch are idempotent.
#[derive(Clone, Debug)]
pub struct CovariancePropagator {
    method: CovarPropagation,
    sqrt_covar: Option<DMatrix<f64>>,
    last_covar: Option<DMatrix<f64>>,
    warned_indefinite: bool,
    warned_direct: bool,
}

impl CovariancePropagator {
    pub fn new(method: CovarPropagation) -> Self {
        Self {
            method,
            sqrt_covar: None,
            last_covar: None,
            warned_indefinite: false,
            warned_direct: false,
        }
    }

    pub fn method(&self) -> CovarPropagation {
        self.method
    }

    /// Lower triangular square root of the covariance, if the square root form has been used.
    pub fn sqrt_covar(&self) -> Option<&DMatrix<f64>> {
        self.sqrt_covar.as_ref()
    }

    /// Replaces the persistent square root factor, e.g. after a measurement update computed it directly.
    pub fn set_sqrt_covar(&mut self, sqrt_covar: DMatrix<f64>) {
        self.sqrt_covar = Some(sqrt_covar);
    }

    /// Drops the persistent square root factor: it will be rebuilt from the covariance at the next propagation.
    pub fn invalidate(&mut self) {
        self.sqrt_covar = None;
    }

    /// Propagates `covar` with the state transition matrix of the step `stm` to `epoch`, adding `noise` if provided.
    ///
    /// The noise matrix may be smaller than the covariance, in which case it applies to its leading states.
    pub fn propagate(
        &mut self,
        covar: &DMatrix<f64>,
        stm: &DMatrix<f64>,
        noise: Option<&DMatrix<f64>>,
        epoch: Epoch,
        epochs: &UpdateEpochs,
    ) -> Result<DMatrix<f64>, StateError> {
        let n = covar.nrows();
        ensure!(
            covar.ncols() == n,
            DimensionMismatchSnafu {
                action: "covariance propagation (square covariance)",
                expected: n,
                got: covar.ncols()
            }
        );
        ensure!(
            stm.nrows() == n && stm.ncols() == n,
            DimensionMismatchSnafu {
                action: "covariance propagation (STM)",
                expected: n,
                got: stm.nrows()
            }
        );

        if epoch == epochs.at_last {
            // No time elapsed since the last update
            return Ok(covar.clone());
        }

        if epochs.is_reversion(epoch) {
            if let Some(last) = &self.last_covar {
                debug!("reverting covariance to {epoch}");
                self.sqrt_covar = None;
                return Ok(last.clone());
            }
        }

        let noise = match noise {
            Some(q) => Some(embed_noise(q, n)?),
            None => None,
        };

        let propagated = match self.method {
            CovarPropagation::Direct => propagate_direct(covar, stm, noise.as_ref()),
            CovarPropagation::SquareRoot => {
                self.propagate_sqrt(covar, stm, noise.as_ref(), epoch, epochs)?
            }
        };

        self.last_covar = Some(covar.clone());
        Ok(propagated)
    }

    /// Square root propagation. If the factor of the covariance cannot be rebuilt, the direct form is used for
    /// this step and the factor is rebuilt at the next one.
    fn propagate_sqrt(
        &mut self,
        covar: &DMatrix<f64>,
        stm: &DMatrix<f64>,
        noise: Option<&DMatrix<f64>>,
        epoch: Epoch,
        epochs: &UpdateEpochs,
    ) -> Result<DMatrix<f64>, StateError> {
        let n = covar.nrows();
        let sqrt_noise = match noise {
            Some(q) => cholesky_lower_compressed(q)
                .or_else(|| psd_sqrt(q))
                .context(NotPositiveDefiniteSnafu {
                    matrix: "process noise matrix".to_string(),
                })?,
            None => DMatrix::zeros(n, 0),
        };

        let stepped_back = (epoch - epochs.at_last).abs() < (epochs.before_last - epochs.at_last).abs();
        if self.sqrt_covar.is_none() || stepped_back {
            self.sqrt_covar = cholesky_lower(covar).or_else(|| psd_sqrt(covar));
            if self.sqrt_covar.is_none() {
                if !self.warned_direct {
                    warn!(
                        "covariance at {} has no square root: propagating it in the direct form",
                        epochs.at_last
                    );
                    self.warned_direct = true;
                }
                return Ok(propagate_direct(covar, stm, noise));
            }
        }

        let sqrt_p = match &self.sqrt_covar {
            Some(s) if s.nrows() == n => s,
            _ => {
                return Err(StateError::DimensionMismatch {
                    action: "square root covariance propagation",
                    expected: n,
                    got: self.sqrt_covar.as_ref().map_or(0, |s| s.nrows()),
                })
            }
        };

        let sqrt_p = thin_qr(&(stm * sqrt_p), &sqrt_noise);

        if !self.warned_indefinite && (0..n).any(|i| sqrt_p[(i, i)].abs() < SQRT_DIAG_TOL) {
            warn!("covariance is no longer positive definite at {epoch}");
            self.warned_indefinite = true;
        }

        let mut p = &sqrt_p * sqrt_p.transpose();
        symmetrize(&mut p);
        self.sqrt_covar = Some(sqrt_p);
        Ok(p)
    }
}

fn propagate_direct(
    covar: &DMatrix<f64>,
    stm: &DMatrix<f64>,
    noise: Option<&DMatrix<f64>>,
) -> DMatrix<f64> {
    let mut p = stm * covar * stm.transpose();
    if let Some(q) = noise {
        p += q;
    }
    symmetrize(&mut p);
    p
}

/// Returns the noise matrix padded with zeros to the dimension of the covariance.
fn embed_noise(q: &DMatrix<f64>, n: usize) -> Result<DMatrix<f64>, StateError> {
    ensure!(
        q.nrows() == q.ncols() && q.nrows() <= n,
        DimensionMismatchSnafu {
            action: "process noise",
            expected: n,
            got: q.nrows()
        }
    );
    if q.nrows() == n {
        return Ok(q.clone());
    }
    let mut full = DMatrix::zeros(n, n);
    full.view_mut((0, 0), (q.nrows(), q.ncols())).copy_from(q);
    Ok(full)
}
