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
use crate::state::{ElementKind, PropagatedObject, StateVectorAssembler};
use crate::time::{Epoch, TimeScale, Unit};
use snafu::prelude::*;
use std::fmt;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::str::FromStr;

const COVAR_PREFIX: &str = "Covariance_";
const CARTESIAN_AXES: [&str; 6] = ["X", "Y", "Z", "VX", "VY", "VZ"];

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum CheckpointError {
    #[snafu(display("checkpoint {path}: {source}"))]
    CheckpointIo {
        path: String,
        source: std::io::Error,
    },
    #[snafu(display("checkpoint {path} is not valid CSV: {source}"))]
    CheckpointCsv { path: String, source: csv::Error },
    #[snafu(display("checkpoint {path} has no epoch column"))]
    MissingEpochColumn { path: String },
    #[snafu(display("checkpoint epoch format {format} is not supported"))]
    UnsupportedEpochFormat { format: String },
    #[snafu(display("could not parse epoch `{value}` on row {row}"))]
    InvalidEpoch { row: usize, value: String },
    #[snafu(display("could not parse `{value}` in column {column} on row {row}"))]
    InvalidValue {
        row: usize,
        column: String,
        value: String,
    },
    #[snafu(display("malformed covariance column {header}"))]
    MalformedCovariance { header: String },
    #[snafu(display("no checkpoint record matches {selection}"))]
    NoMatchingRecord { selection: RowSelection },
    #[snafu(display("state conversion Jacobian is singular"))]
    SingularJacobian,
    #[snafu(display("{action} requires dimension {expected} but got {got}"))]
    CheckpointDimension {
        action: &'static str,
        expected: usize,
        got: usize,
    },
}

impl CheckpointError {
    pub fn is_io(&self) -> bool {
        matches!(self, Self::CheckpointIo { .. })
    }
}

/// Representation of the epoch column.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum EpochFormat {
    UtcGregorian,
    TaiModJulian,
}

impl EpochFormat {
    pub fn header(self) -> &'static str {
        match self {
            Self::UtcGregorian => "Epoch.UTCGregorian",
            Self::TaiModJulian => "Epoch.TAIModJulian",
        }
    }

    pub fn format(self, epoch: Epoch) -> String {
        match self {
            Self::UtcGregorian => format!("{}", epoch.to_time_scale(TimeScale::UTC)),
            Self::TaiModJulian => format!("{:.16e}", epoch.to_mjd_tai_days()),
        }
    }

    pub fn parse(self, value: &str) -> Option<Epoch> {
        match self {
            Self::UtcGregorian => Epoch::from_str(value).ok(),
            Self::TaiModJulian => value.parse::<f64>().ok().map(Epoch::from_mjd_tai),
        }
    }
}

impl FromStr for EpochFormat {
    type Err = CheckpointError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "utcgregorian" => Ok(Self::UtcGregorian),
            "taimodjulian" => Ok(Self::TaiModJulian),
            _ => Err(CheckpointError::UnsupportedEpochFormat {
                format: s.to_string(),
            }),
        }
    }
}

/// Policy to select the record to restart from.
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum RowSelection {
    Earliest,
    /// Chronologically last record
    Last,
    /// Latest record strictly before the epoch
    StrictlyBefore(Epoch),
    /// Latest record at or before the epoch
    AtOrBefore(Epoch),
    /// Record at the epoch
    Exact(Epoch),
}

impl RowSelection {
    /// Epoch tolerance of the matching
    pub fn tolerance() -> crate::time::Duration {
        10 * Unit::Microsecond
    }
}

impl fmt::Display for RowSelection {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Earliest => write!(f, "earliest record"),
            Self::Last => write!(f, "last record"),
            Self::StrictlyBefore(e) => write!(f, "latest record before {e}"),
            Self::AtOrBefore(e) => write!(f, "latest record at or before {e}"),
            Self::Exact(e) => write!(f, "record at {e}"),
        }
    }
}

/// Checkpoint headers of the solve-for states of the assembled vector.
///
/// Cartesian states are labeled `object.frame.axis` (with the member number appended past the first
/// six components) and bias terms `object.Bias.index`.
pub fn state_headers<O: PropagatedObject>(
    assembler: &StateVectorAssembler,
    objects: &[O],
) -> Vec<String> {
    assembler
        .solve_for_indices()
        .into_iter()
        .map(|slot| {
            let item = &assembler.items()[slot];
            let idx = item.subelement - 1;
            match item.kind {
                ElementKind::CartesianState => {
                    let frame = objects
                        .get(item.object.0)
                        .map(|obj| obj.frame_name().to_string())
                        .unwrap_or_default();
                    let axis = CARTESIAN_AXES[idx % 6];
                    if idx < 6 {
                        format!("{}.{frame}.{axis}", item.object_name)
                    } else {
                        format!("{}.{frame}.{axis}{}", item.object_name, idx / 6 + 1)
                    }
                }
                ElementKind::Bias => format!("{}.Bias.{}", item.object_name, item.subelement),
                _ => item.description(),
            }
        })
        .collect()
}

/// Appends one row per logged epoch to a warm start checkpoint.
pub struct CheckpointWriter {
    writer: csv::Writer<File>,
    path: String,
    size: usize,
}

impl CheckpointWriter {
    /// Creates the file and writes the header row.
    pub fn new<P: AsRef<Path>>(path: P, headers: &[String]) -> Result<Self, CheckpointError> {
        let path_str = path.as_ref().display().to_string();
        let file = File::create(path.as_ref()).context(CheckpointIoSnafu {
            path: path_str.clone(),
        })?;
        let mut writer = csv::Writer::from_writer(file);

        let size = headers.len();
        let mut row = Vec::with_capacity(1 + size + size * (size + 1) / 2);
        row.push(EpochFormat::UtcGregorian.header().to_string());
        row.extend(headers.iter().cloned());
        for i in 1..=size {
            for j in 1..=i {
                row.push(format!("{COVAR_PREFIX}{i}_{j}"));
            }
        }
        writer.write_record(&row).context(CheckpointCsvSnafu {
            path: path_str.clone(),
        })?;
        info!("writing warm start checkpoint to {path_str}");

        Ok(Self {
            writer,
            path: path_str,
            size,
        })
    }

    /// Writes the state and the lower triangle of the covariance, converted to Cartesian with the
    /// Jacobian `dX/dS` if provided. The state is mapped linearly with the same Jacobian.
    pub fn write(
        &mut self,
        epoch: Epoch,
        state: &DVector<f64>,
        covar: &DMatrix<f64>,
        jacobian: Option<&DMatrix<f64>>,
    ) -> Result<(), CheckpointError> {
        ensure!(
            state.len() == self.size && covar.nrows() == self.size,
            CheckpointDimensionSnafu {
                action: "checkpoint row",
                expected: self.size,
                got: state.len()
            }
        );
        let (state, covar) = match jacobian {
            Some(jac) => (jac * state, jac * covar * jac.transpose()),
            None => (state.clone(), covar.clone()),
        };
        let mut row = Vec::with_capacity(1 + self.size + self.size * (self.size + 1) / 2);
        row.push(EpochFormat::UtcGregorian.format(epoch));
        row.extend(state.iter().map(|v| format!("{v:.16e}")));
        for i in 0..self.size {
            for j in 0..=i {
                row.push(format!("{:.16e}", covar[(i, j)]));
            }
        }
        self.writer.write_record(&row).context(CheckpointCsvSnafu {
            path: self.path.clone(),
        })
    }

    pub fn flush(&mut self) -> Result<(), CheckpointError> {
        self.writer.flush().context(CheckpointIoSnafu {
            path: self.path.clone(),
        })
    }
}

impl Drop for CheckpointWriter {
    fn drop(&mut self) {
        if let Err(e) = self.writer.flush() {
            error!("could not flush checkpoint {}: {e}", self.path);
        }
    }
}

/// A record of a checkpoint file.
#[derive(Clone, Debug, PartialEq)]
pub struct CheckpointRecord {
    pub epoch: Epoch,
    /// Values of the state columns, in file order
    pub state: Vec<f64>,
    /// Covariance in file order, NaN where the file provides no value
    pub covar: DMatrix<f64>,
}

/// A warm start checkpoint file.
#[derive(Clone, Debug, PartialEq)]
pub struct Checkpoint {
    pub epoch_format: EpochFormat,
    pub state_headers: Vec<String>,
    pub records: Vec<CheckpointRecord>,
}

impl Checkpoint {
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self, CheckpointError> {
        let path_str = path.as_ref().display().to_string();
        let file = File::open(path.as_ref()).context(CheckpointIoSnafu {
            path: path_str.clone(),
        })?;
        let mut reader = csv::ReaderBuilder::new()
            .trim(csv::Trim::All)
            .flexible(true)
            .from_reader(BufReader::new(file));

        let headers: Vec<String> = reader
            .headers()
            .context(CheckpointCsvSnafu {
                path: path_str.clone(),
            })?
            .iter()
            .map(|h| h.to_string())
            .collect();

        let (epoch_col, epoch_format) = headers
            .iter()
            .enumerate()
            .find_map(|(i, h)| {
                let lower = h.to_lowercase();
                lower
                    .strip_prefix("epoch.")
                    .map(|fmt| (i, h[h.len() - fmt.len()..].to_string()))
            })
            .context(MissingEpochColumnSnafu {
                path: path_str.clone(),
            })?;
        let epoch_format = EpochFormat::from_str(&epoch_format)?;

        // Split the state columns from the covariance columns
        let mut state_cols = Vec::new();
        let mut covar_cols = Vec::new();
        for (col, header) in headers.iter().enumerate() {
            if col == epoch_col {
                continue;
            }
            match header.strip_prefix(COVAR_PREFIX) {
                Some(indexes) => {
                    let mut split = indexes.split('_').map(|s| s.parse::<usize>());
                    match (split.next(), split.next(), split.next()) {
                        (Some(Ok(i)), Some(Ok(j)), None) if i >= 1 && j >= 1 => {
                            covar_cols.push((col, i - 1, j - 1))
                        }
                        _ => {
                            return Err(CheckpointError::MalformedCovariance {
                                header: header.clone(),
                            })
                        }
                    }
                }
                None => state_cols.push(col),
            }
        }
        let size = state_cols.len();
        if let Some((col, _, _)) = covar_cols
            .iter()
            .find(|(_, i, j)| *i >= size || *j >= size)
        {
            return Err(CheckpointError::MalformedCovariance {
                header: headers[*col].clone(),
            });
        }

        let mut records = Vec::new();
        for (row_no, result) in reader.records().enumerate() {
            let record = result.context(CheckpointCsvSnafu {
                path: path_str.clone(),
            })?;
            if record.iter().all(|field| field.is_empty()) {
                continue;
            }
            // Account for the header row
            let row = row_no + 2;
            let field = |col: usize| record.get(col).unwrap_or("");
            let parse = |col: usize| -> Result<f64, CheckpointError> {
                field(col)
                    .parse::<f64>()
                    .map_err(|_| CheckpointError::InvalidValue {
                        row,
                        column: headers[col].clone(),
                        value: field(col).to_string(),
                    })
            };

            let epoch = epoch_format
                .parse(field(epoch_col))
                .context(InvalidEpochSnafu {
                    row,
                    value: field(epoch_col),
                })?;
            let state = state_cols
                .iter()
                .map(|&col| parse(col))
                .collect::<Result<Vec<f64>, _>>()?;
            let mut covar = DMatrix::from_element(size, size, f64::NAN);
            for &(col, i, j) in &covar_cols {
                let value = parse(col)?;
                covar[(i, j)] = value;
                covar[(j, i)] = value;
            }
            records.push(CheckpointRecord {
                epoch,
                state,
                covar,
            });
        }
        debug!("read {} records from checkpoint {path_str}", records.len());

        Ok(Self {
            epoch_format,
            state_headers: state_cols.iter().map(|&col| headers[col].clone()).collect(),
            records,
        })
    }

    /// Selects the record to restart from.
    pub fn select(&self, selection: RowSelection) -> Result<&CheckpointRecord, CheckpointError> {
        let tol = RowSelection::tolerance();
        // Ties are resolved in favor of the last record of the file
        let latest = |keep: &dyn Fn(Epoch) -> bool| {
            self.records
                .iter()
                .filter(|rec| keep(rec.epoch))
                .fold(None, |best: Option<&CheckpointRecord>, rec| match best {
                    Some(b) if b.epoch > rec.epoch => Some(b),
                    _ => Some(rec),
                })
        };
        let found = match selection {
            RowSelection::Earliest => self
                .records
                .iter()
                .fold(None, |best: Option<&CheckpointRecord>, rec| match best {
                    Some(b) if b.epoch <= rec.epoch => Some(b),
                    _ => Some(rec),
                }),
            RowSelection::Last => latest(&|_| true),
            RowSelection::StrictlyBefore(e) => latest(&|epoch| epoch < e - tol),
            RowSelection::AtOrBefore(e) => latest(&|epoch| epoch <= e + tol),
            RowSelection::Exact(e) => latest(&|epoch| (epoch - e).abs() <= tol),
        };
        found.context(NoMatchingRecordSnafu { selection })
    }

    /// Maps the record onto the live state and covariance, whose columns are labeled by `live_headers`.
    ///
    /// Columns missing from either side are left untouched. The state and covariance of the file are
    /// Cartesian: they are converted to the live parameterization with the inverse of the Jacobian `dX/dS`
    /// if provided.
    /// Returns the number of state columns matched.
    pub fn restore(
        &self,
        record: &CheckpointRecord,
        live_headers: &[String],
        state: &mut DVector<f64>,
        covar: &mut DMatrix<f64>,
        jacobian: Option<&DMatrix<f64>>,
    ) -> Result<usize, CheckpointError> {
        let n = live_headers.len();
        ensure!(
            state.len() == n && covar.nrows() == n && covar.ncols() == n,
            CheckpointDimensionSnafu {
                action: "checkpoint restoration",
                expected: n,
                got: state.len()
            }
        );

        let mapping: Vec<Option<usize>> = self
            .state_headers
            .iter()
            .map(|header| live_headers.iter().position(|live| live == header))
            .collect();

        let (mut cartesian_state, mut cartesian) = match jacobian {
            Some(jac) => (jac * &*state, jac * &*covar * jac.transpose()),
            None => (state.clone(), covar.clone()),
        };

        let mut matched = 0;
        for (file_i, live_i) in mapping.iter().enumerate() {
            let Some(live_i) = *live_i else {
                debug!("checkpoint column {} not in the state", self.state_headers[file_i]);
                continue;
            };
            matched += 1;
            cartesian_state[live_i] = record.state[file_i];
            for (file_j, live_j) in mapping.iter().enumerate() {
                if let Some(live_j) = *live_j {
                    let value = record.covar[(file_i, file_j)];
                    if !value.is_nan() {
                        cartesian[(live_i, live_j)] = value;
                    }
                }
            }
        }

        match jacobian {
            Some(jac) => {
                let inv = jac.clone().try_inverse().context(SingularJacobianSnafu)?;
                *state = &inv * cartesian_state;
                *covar = &inv * cartesian * inv.transpose();
            }
            None => {
                *state = cartesian_state;
                *covar = cartesian;
            }
        }
        Ok(matched)
    }
}
