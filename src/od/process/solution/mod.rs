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

use super::RunDirection;
use crate::linalg::{DMatrix, DVector};
use crate::od::msr::EditReason;
use crate::od::ODError;
use crate::time::Epoch;
use crate::utils::vnb_dcm;
use std::fmt;

mod smooth;
mod stats;

pub use smooth::{smooth, SmoothedEstimate};

/// Measurement statistics of a record.
#[derive(Clone, Debug, PartialEq)]
pub struct MeasurementStats {
    /// Identifier of the observation
    pub id: String,
    /// Observed minus computed
    pub prefit: DVector<f64>,
    /// Residual after the update, None if the observation was rejected
    pub postfit: Option<DVector<f64>>,
    /// Residuals over the standard deviation of the innovation
    pub scaled_residuals: DVector<f64>,
    /// Set for every rejected component
    pub rejected: Vec<bool>,
    /// Reason for which the observation was not used at all
    pub edit: Option<EditReason>,
    /// Scaling of the measurement noise standard deviation by the de-weighting
    pub deweight_scale: f64,
}

impl MeasurementStats {
    pub fn accepted(&self) -> bool {
        self.edit.is_none()
    }
}

/// An entry of the filter log.
#[derive(Clone, Debug, PartialEq)]
pub struct FilterRecord {
    pub epoch: Epoch,
    /// Best estimate of the solve-for state
    pub state: DVector<f64>,
    /// Solve-for state before the measurement update
    pub state_bar: DVector<f64>,
    pub covar: DMatrix<f64>,
    /// Covariance before the measurement update
    pub covar_bar: DMatrix<f64>,
    /// Covariance with the Cartesian blocks rotated into the velocity-normal-binormal frame
    pub covar_vnb: Option<DMatrix<f64>>,
    /// State transition matrix from the previous record
    pub stm: DMatrix<f64>,
    pub process_noise: Option<DMatrix<f64>>,
    pub measurement: Option<MeasurementStats>,
    /// Set if no observation was processed in this record
    pub predicted: bool,
    /// Set if a correction is held as an offset from the reference state
    pub offset_pending: bool,
}

impl FilterRecord {
    /// One sigma of each solve-for state.
    pub fn sigmas(&self) -> DVector<f64> {
        self.covar.diagonal().map(|v| v.max(0.0).sqrt())
    }
}

impl fmt::Display for FilterRecord {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let kind = match &self.measurement {
            Some(stats) if stats.accepted() => "measurement update",
            Some(_) => "rejected measurement",
            None => "time update",
        };
        write!(f, "{kind} @ {}", self.epoch)
    }
}

/// Rotates the 6x6 Cartesian blocks starting at each of the provided offsets into the VNB frame.
///
/// Returns None if any of the blocks has colinear position and velocity.
pub fn covar_in_vnb(
    state: &DVector<f64>,
    covar: &DMatrix<f64>,
    cartesian_offsets: &[usize],
) -> Option<DMatrix<f64>> {
    let n = covar.nrows();
    let mut rot = DMatrix::<f64>::identity(n, n);
    for &offset in cartesian_offsets {
        if offset + 6 > n || offset + 6 > state.len() {
            return None;
        }
        let r = state.fixed_rows::<3>(offset).into_owned();
        let v = state.fixed_rows::<3>(offset + 3).into_owned();
        let dcm = vnb_dcm(&r, &v)?;
        rot.view_mut((offset, offset), (3, 3)).copy_from(&dcm);
        rot.view_mut((offset + 3, offset + 3), (3, 3)).copy_from(&dcm);
    }
    Some(&rot * covar * rot.transpose())
}

/// Time ordered, append only log of the filter records of one run.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct FilterLog {
    direction: RunDirection,
    records: Vec<FilterRecord>,
}

impl FilterLog {
    pub fn new(direction: RunDirection) -> Self {
        Self {
            direction,
            records: Vec::new(),
        }
    }

    pub fn direction(&self) -> RunDirection {
        self.direction
    }

    /// Appends a record, which may not precede the last record in the run direction.
    pub fn push(&mut self, record: FilterRecord) -> Result<(), ODError> {
        if let Some(last) = self.records.last() {
            let out_of_order = match self.direction {
                RunDirection::Forward => record.epoch < last.epoch,
                RunDirection::Backward => record.epoch > last.epoch,
            };
            if out_of_order {
                return Err(ODError::NonMonotonicRecord {
                    epoch: record.epoch,
                    previous: last.epoch,
                });
            }
        }
        self.records.push(record);
        Ok(())
    }

    pub fn records(&self) -> &[FilterRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn first(&self) -> Option<&FilterRecord> {
        self.records.first()
    }

    pub fn last(&self) -> Option<&FilterRecord> {
        self.records.last()
    }

    pub fn iter(&self) -> impl Iterator<Item = &FilterRecord> {
        self.records.iter()
    }

    /// Last record at exactly the provided epoch, i.e. the estimate after every update at that epoch.
    pub fn at_epoch(&self, epoch: Epoch) -> Option<&FilterRecord> {
        let end = match self.direction {
            RunDirection::Forward => self.records.partition_point(|rec| rec.epoch <= epoch),
            RunDirection::Backward => self.records.partition_point(|rec| rec.epoch >= epoch),
        };
        self.records[..end].last().filter(|rec| rec.epoch == epoch)
    }

    /// Records with measurement statistics
    pub fn measurement_records(&self) -> impl Iterator<Item = &FilterRecord> {
        self.records.iter().filter(|rec| rec.measurement.is_some())
    }
}

/// Epochs of a forward run, on which a backward run must stop for the smoother.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SmoothingGrid {
    /// Sorted and without duplicates
    epochs: Vec<Epoch>,
}

impl SmoothingGrid {
    pub fn new(mut epochs: Vec<Epoch>) -> Self {
        epochs.sort();
        epochs.dedup();
        Self { epochs }
    }

    pub fn from_log(log: &FilterLog) -> Self {
        Self::new(log.iter().map(|rec| rec.epoch).collect())
    }

    pub fn epochs(&self) -> &[Epoch] {
        &self.epochs
    }

    pub fn contains(&self, epoch: Epoch) -> bool {
        self.epochs.binary_search(&epoch).is_ok()
    }

    /// Nearest grid epoch strictly before the provided epoch.
    pub fn nearest_before(&self, epoch: Epoch) -> Option<Epoch> {
        let idx = self.epochs.partition_point(|e| *e < epoch);
        idx.checked_sub(1).map(|i| self.epochs[i])
    }

    /// Returns where a backward step from `current` towards `target` must stop: the target itself if it
    /// is on the grid, and the nearest grid epoch strictly before `current` otherwise.
    pub fn sync(&self, current: Epoch, target: Epoch) -> Epoch {
        if self.contains(target) {
            target
        } else {
            match self.nearest_before(current) {
                Some(epoch) => {
                    debug!("smoothing sync: step to {target} redirected to {epoch}");
                    epoch
                }
                None => target,
            }
        }
    }
}
