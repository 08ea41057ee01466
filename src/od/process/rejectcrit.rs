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
use std::fmt;

/// Outcome of the sigma editing of one component of an observation.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct ComponentEdit {
    /// Residual over the standard deviation of the innovation
    pub scaled_residual: f64,
    /// Standard deviation of the innovation, sqrt of the diagonal of `H P̄ Hᵀ + R`
    pub sigma: f64,
    pub rejected: bool,
}

/// Residual based outlier rejection: a component is rejected when its residual exceeds `multiplier` sigmas.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct SigmaEditor {
    pub multiplier: f64,
}

impl Default for SigmaEditor {
    fn default() -> Self {
        Self { multiplier: 3.0 }
    }
}

impl SigmaEditor {
    pub fn new(multiplier: f64) -> Self {
        Self { multiplier }
    }

    /// Innovation covariance `H P̄ Hᵀ + R` computed with the pre-update covariance.
    pub fn innovation_covariance(
        covar_bar: &DMatrix<f64>,
        sensitivity: &DMatrix<f64>,
        noise: &DMatrix<f64>,
    ) -> DMatrix<f64> {
        sensitivity * covar_bar * sensitivity.transpose() + noise
    }

    /// Edits each component of the prefit residual.
    ///
    /// The `reference_offset` is the pending state correction held while the state is not rectified: the
    /// residual against the corrected state is `prefit - H · offset`.
    pub fn edit(
        &self,
        prefit: &DVector<f64>,
        sensitivity: &DMatrix<f64>,
        covar_bar: &DMatrix<f64>,
        noise: &DMatrix<f64>,
        reference_offset: Option<&DVector<f64>>,
    ) -> Vec<ComponentEdit> {
        let innovation = Self::innovation_covariance(covar_bar, sensitivity, noise);
        let resid = match reference_offset {
            Some(offset) => prefit - sensitivity * offset,
            None => prefit.clone(),
        };
        resid
            .iter()
            .enumerate()
            .map(|(i, r)| {
                let sigma = innovation[(i, i)].max(0.0).sqrt();
                let scaled_residual = if sigma > 0.0 { r / sigma } else { f64::INFINITY };
                ComponentEdit {
                    scaled_residual,
                    sigma,
                    rejected: r.abs() > self.multiplier * sigma,
                }
            })
            .collect()
    }
}

impl fmt::Display for SigmaEditor {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}σ editing", self.multiplier)
    }
}
