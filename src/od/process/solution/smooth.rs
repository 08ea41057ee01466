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

use super::{FilterLog, RunDirection};
use crate::linalg::{DMatrix, DVector};
use crate::od::{DimensionMismatchSnafu, ODError};
use crate::time::Epoch;
use crate::utils::symmetrize;
use snafu::prelude::*;

/// Combination of the forward and backward estimates at one epoch.
#[derive(Clone, Debug, PartialEq)]
pub struct SmoothedEstimate {
    pub epoch: Epoch,
    pub state: DVector<f64>,
    pub covar: DMatrix<f64>,
    /// Filter-smoother consistency ratio of each state: the difference between the filter and smoothed
    /// states over the square root of the difference of their variances.
    pub consistency: DVector<f64>,
}

/// Combines a forward run with a backward run over the same observations.
///
/// At each epoch of the backward run, the forward a-posteriori estimate is combined with the backward
/// a-priori estimate (which does not include the observations of that epoch):
/// `P = (Pf⁻¹ + P̄b⁻¹)⁻¹` and `x = P (Pf⁻¹ xf + P̄b⁻¹ x̄b)`.
/// Every backward epoch must be in the forward log.
///
/// The smoothed estimates are returned in chronological order.
pub fn smooth(forward: &FilterLog, backward: &FilterLog) -> Result<Vec<SmoothedEstimate>, ODError> {
    if forward.direction() != RunDirection::Forward || backward.direction() != RunDirection::Backward
    {
        return Err(ODError::InvalidAction {
            action: "smooth logs which are not a forward and a backward run",
            state: crate::od::process::FilterState::Finished,
        });
    }

    info!(
        "smoothing {} forward records with {} backward records",
        forward.len(),
        backward.len()
    );

    let mut smoothed: Vec<SmoothedEstimate> = Vec::with_capacity(backward.len());
    for bwd in backward.iter() {
        // The first backward record of an epoch is the a-priori of that epoch
        if smoothed.last().map(|sm| sm.epoch) == Some(bwd.epoch) {
            continue;
        }
        let fwd = forward
            .at_epoch(bwd.epoch)
            .context(crate::od::SmoothingMismatchSnafu { epoch: bwd.epoch })?;
        ensure!(
            fwd.state.len() == bwd.state_bar.len(),
            DimensionMismatchSnafu {
                action: "smoothing",
                expected: fwd.state.len(),
                got: bwd.state_bar.len()
            }
        );

        let pf_inv = fwd
            .covar
            .clone()
            .try_inverse()
            .ok_or(ODError::NotPositiveDefinite {
                matrix: "forward covariance",
            })?;
        let pb_inv = bwd
            .covar_bar
            .clone()
            .try_inverse()
            .ok_or(ODError::NotPositiveDefinite {
                matrix: "backward a-priori covariance",
            })?;
        let mut covar = (&pf_inv + &pb_inv)
            .try_inverse()
            .ok_or(ODError::NotPositiveDefinite {
                matrix: "smoothed information matrix",
            })?;
        symmetrize(&mut covar);
        let state = &covar * (&pf_inv * &fwd.state + &pb_inv * &bwd.state_bar);

        let consistency = DVector::from_fn(state.len(), |i, _| {
            let denom = (fwd.covar[(i, i)] - covar[(i, i)]).abs().sqrt();
            if denom > 0.0 {
                (fwd.state[i] - state[i]) / denom
            } else {
                0.0
            }
        });

        smoothed.push(SmoothedEstimate {
            epoch: bwd.epoch,
            state,
            covar,
            consistency,
        });
    }

    smoothed.reverse();
    Ok(smoothed)
}
