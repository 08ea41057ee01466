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

use crate::io::checkpoint::{state_headers, Checkpoint, CheckpointWriter, RowSelection};
use crate::linalg::{DMatrix, DVector};
use crate::od::msr::{
    EditReason, EventResolutionSnafu, EventStatus, MeasurementManager, NoObservationSnafu,
};
use crate::od::{
    DimensionMismatchSnafu, Filter, InvalidActionSnafu, MissingCovarianceSnafu, MissingStmSnafu,
    NoMeasurementsRemainSnafu, NoParticipantsSnafu, ODCheckpointSnafu, ODConfigSnafu, ODError,
    ODMeasurementSnafu, ODPropSnafu, ODStateSnafu,
};
use crate::propagators::DynamicsPropagator;
use crate::state::{
    CovarPropagation, CovariancePropagator, ElementKind, ObjectHandle, PropagatedObject,
    StateVectorAssembler, UpdateEpochs,
};
use crate::time::{Duration, Epoch};
use crate::utils::cholesky_lower;
use snafu::prelude::*;
use std::fmt;

mod conf;
pub use conf::{Deweighting, EstimatorConfig, RestartEpoch, RunDirection};
mod rejectcrit;
pub use rejectcrit::{ComponentEdit, SigmaEditor};
mod solution;
pub use solution::{
    covar_in_vnb, smooth, FilterLog, FilterRecord, MeasurementStats, SmoothedEstimate,
    SmoothingGrid,
};

/// Number of polls of a pending event before it is deemed unresolvable
const MAX_EVENT_POLLS: usize = 50;
/// Process noise is not accumulated over shorter intervals, in seconds
const MIN_NOISE_INTERVAL_S: f64 = 1e-6;

/// States of the filter state machine.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum FilterState {
    Initializing,
    Propagating,
    Calculating,
    Locating,
    Estimating,
    CheckingRun,
    Finished,
}

impl fmt::Display for FilterState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            Self::Initializing => "INITIALIZING",
            Self::Propagating => "PROPAGATING",
            Self::Calculating => "CALCULATING",
            Self::Locating => "LOCATING",
            Self::Estimating => "ESTIMATING",
            Self::CheckingRun => "CHECKINGRUN",
            Self::Finished => "FINISHED",
        };
        write!(f, "{name}")
    }
}

/// Position of one estimated object in the solve-for state.
#[derive(Clone, Debug, PartialEq)]
pub struct EstimatedObject {
    pub handle: ObjectHandle,
    pub name: String,
    /// Index of the first solve-for state of this object
    pub offset: usize,
    pub size: usize,
    /// Number of Cartesian states, which come first
    pub cartesian_size: usize,
}

/// Estimate at the end of the observations, before any prediction.
#[derive(Clone, Debug)]
pub struct EstimationSnapshot<O> {
    pub epoch: Epoch,
    pub state: DVector<f64>,
    pub covar: DMatrix<f64>,
    pub objects: Vec<O>,
}

/// A sequential estimator: a state machine which interleaves the propagation of the objects, the evaluation
/// of the observations and the filter updates, and which logs a record at every update.
///
/// Note that everything passed to this structure is moved.
pub struct FilterStateMachine<P, M, K>
where
    P: DynamicsPropagator,
    M: MeasurementManager,
    K: Filter,
{
    /// Dynamics propagator, which owns the estimated objects
    pub prop: P,
    /// Measurement manager
    pub msr: M,
    /// Kalman filter itself
    pub kf: K,
    pub config: EstimatorConfig,
    assembler: StateVectorAssembler,
    state: FilterState,
    direction: RunDirection,
    layout: Vec<EstimatedObject>,
    editor: SigmaEditor,
    covar: DMatrix<f64>,
    /// A-priori covariance of the first run
    apriori: Option<DMatrix<f64>>,
    /// Covariance to restart from instead of the covariance of the objects
    restart_covar: Option<DMatrix<f64>>,
    covar_prop: CovariancePropagator,
    update_epochs: UpdateEpochs,
    estimation_start: Epoch,
    noise_step: Option<Duration>,
    next_noise_epoch: Option<Epoch>,
    anchor: Option<(Epoch, bool)>,
    predict_target: Option<Epoch>,
    predicting: bool,
    /// Correction held as an offset from the reference state, as of the latest update
    offset: Option<DVector<f64>>,
    log: FilterLog,
    forward_log: Option<FilterLog>,
    grid: Option<SmoothingGrid>,
    writer: Option<CheckpointWriter>,
    snapshot: Option<EstimationSnapshot<P::Object>>,
    warned_indefinite: bool,
    num_msrs: usize,
    msr_cnt: usize,
    reported: [bool; 11],
}

impl<P, M, K> FilterStateMachine<P, M, K>
where
    P: DynamicsPropagator,
    P::Object: Clone,
    M: MeasurementManager,
    K: Filter,
{
    /// Initializes a new estimator from the propagator owning the objects, the measurement manager, the filter, the
    /// assembled state vector of the objects, and the configuration.
    pub fn new(
        prop: P,
        msr: M,
        kf: K,
        assembler: StateVectorAssembler,
        config: EstimatorConfig,
    ) -> Result<Self, ODError> {
        config.validate().context(ODConfigSnafu)?;
        let epoch = assembler.epoch();
        let direction = config.direction;
        let editor = SigmaEditor::new(config.sigma_multiplier);
        Ok(Self {
            prop,
            msr,
            kf,
            config,
            assembler,
            state: FilterState::Initializing,
            direction,
            layout: Vec::new(),
            editor,
            covar: DMatrix::zeros(0, 0),
            apriori: None,
            restart_covar: None,
            covar_prop: CovariancePropagator::new(CovarPropagation::Direct),
            update_epochs: UpdateEpochs::new(epoch),
            estimation_start: epoch,
            noise_step: None,
            next_noise_epoch: None,
            anchor: None,
            predict_target: None,
            predicting: false,
            offset: None,
            log: FilterLog::new(direction),
            forward_log: None,
            grid: None,
            writer: None,
            snapshot: None,
            warned_indefinite: false,
            num_msrs: 0,
            msr_cnt: 0,
            reported: [false; 11],
        })
    }

    pub fn state(&self) -> FilterState {
        self.state
    }

    pub fn direction(&self) -> RunDirection {
        self.direction
    }

    pub fn assembler(&self) -> &StateVectorAssembler {
        &self.assembler
    }

    pub fn layout(&self) -> &[EstimatedObject] {
        &self.layout
    }

    /// Log of the current (or latest) run
    pub fn log(&self) -> &FilterLog {
        &self.log
    }

    /// Log of the forward run, available during and after a backward run
    pub fn forward_log(&self) -> Option<&FilterLog> {
        self.forward_log.as_ref()
    }

    /// Covariance of the solve-for state as of the latest update
    pub fn covariance(&self) -> &DMatrix<f64> {
        &self.covar
    }

    pub fn is_predicting(&self) -> bool {
        self.predicting
    }

    /// Correction not yet folded into the reference state, as of the latest update.
    pub fn state_offset(&self) -> Option<&DVector<f64>> {
        self.offset.as_ref()
    }

    /// Estimate at the end of the observations of the latest run.
    pub fn estimation_snapshot(&self) -> Option<&EstimationSnapshot<P::Object>> {
        self.snapshot.as_ref()
    }

    /// Sets the epoch to predict to once the observations are processed. If `noise_between` is set, the
    /// process noise updates are snapped to multiples of the noise step from this epoch.
    pub fn set_anchor_epoch(&mut self, epoch: Epoch, noise_between: bool) {
        info!("anchor epoch set to {epoch}");
        self.anchor = Some((epoch, noise_between));
    }

    /// Runs the state machine until it finishes.
    pub fn run_complete(&mut self) -> Result<(), ODError> {
        while self.advance_state()? != FilterState::Finished {}
        Ok(())
    }

    /// Performs the action of the current state and transitions. Returns the new state.
    pub fn advance_state(&mut self) -> Result<FilterState, ODError> {
        trace!("filter state {}", self.state);
        self.state = match self.state {
            FilterState::Initializing => self.complete_initialization()?,
            FilterState::Propagating => self.propagate()?,
            FilterState::Calculating => self.calculate()?,
            FilterState::Locating => self.locate()?,
            FilterState::Estimating => self.estimate()?,
            FilterState::CheckingRun => self.check_completion()?,
            FilterState::Finished => FilterState::Finished,
        };
        Ok(self.state)
    }

    /// Restarts a finished run backward from the end of the observations, for smoothing.
    ///
    /// The backward run starts from the state estimated by the forward run with the a-priori covariance of
    /// the forward run, and only stops at epochs of the forward log.
    pub fn run_backwards(&mut self) -> Result<(), ODError> {
        ensure!(
            self.state == FilterState::Finished,
            InvalidActionSnafu {
                action: "run backwards",
                state: self.state
            }
        );
        let forward = std::mem::replace(&mut self.log, FilterLog::new(RunDirection::Backward));
        self.grid = Some(SmoothingGrid::from_log(&forward));
        self.forward_log = Some(forward);
        self.restart(RunDirection::Backward)
    }

    /// Restarts a finished run forward from the end of the observations of the previous run.
    pub fn run_forwards(&mut self) -> Result<(), ODError> {
        ensure!(
            self.state == FilterState::Finished,
            InvalidActionSnafu {
                action: "run forwards",
                state: self.state
            }
        );
        self.grid = None;
        self.restart(RunDirection::Forward)
    }

    /// Smooths the forward log with the log of the completed backward run.
    pub fn smoothed(&self) -> Result<Vec<SmoothedEstimate>, ODError> {
        let forward = self
            .forward_log
            .as_ref()
            .context(InvalidActionSnafu {
                action: "smooth without a forward run",
                state: self.state,
            })?;
        smooth(forward, &self.log)
    }

    fn restart(&mut self, direction: RunDirection) -> Result<(), ODError> {
        if let Some(snapshot) = self.snapshot.take() {
            for (dst, src) in self.prop.objects_mut().iter_mut().zip(snapshot.objects) {
                *dst = src;
            }
        }
        info!("restarting the estimation {direction}");
        self.restart_covar = self.apriori.clone();
        self.direction = direction;
        self.predicting = false;
        self.predict_target = None;
        self.offset = None;
        self.log = FilterLog::new(direction);
        self.reported = [false; 11];
        self.msr_cnt = 0;
        self.state = FilterState::Initializing;
        Ok(())
    }

    /// Solve-for state stored in the state vector.
    fn reference_state(&self) -> DVector<f64> {
        let values = self.assembler.values();
        let indices = self.assembler.solve_for_indices();
        DVector::from_iterator(indices.len(), indices.iter().map(|&i| values[i]))
    }

    /// Best estimate: the reference state and any correction held as an offset.
    fn best_state(&self, offset: Option<&DVector<f64>>) -> DVector<f64> {
        let reference = self.reference_state();
        match offset {
            Some(offset) => reference + offset,
            None => reference,
        }
    }

    /// Writes the solve-for state onto the state vector and the objects.
    fn apply_state(&mut self, state: &DVector<f64>) -> Result<(), ODError> {
        let indices = self.assembler.solve_for_indices();
        ensure!(
            indices.len() == state.len(),
            DimensionMismatchSnafu {
                action: "state correction",
                expected: indices.len(),
                got: state.len()
            }
        );
        for (value, slot) in state.iter().zip(indices) {
            self.assembler.values_mut()[slot] = *value;
        }
        self.assembler
            .map_vector_to_objects(self.prop.objects_mut())
            .context(ODStateSnafu)
    }

    /// Writes the diagonal blocks of the filter covariance onto the objects which carry a covariance.
    fn write_object_covariances(&mut self) {
        for obj in &self.layout {
            let Some(object) = self.prop.objects_mut().get_mut(obj.handle.0) else {
                continue;
            };
            if object.element_size(ElementKind::Covariance) != Some(obj.size * obj.size) {
                continue;
            }
            for i in 0..obj.size {
                for j in 0..obj.size {
                    object.set_element_value(
                        ElementKind::Covariance,
                        i * obj.size + j,
                        self.covar[(obj.offset + i, obj.offset + j)],
                    );
                }
            }
        }
    }

    fn build_layout(&self) -> Vec<EstimatedObject> {
        let mut layout = Vec::new();
        let mut offset = 0;
        for (handle, name) in self.assembler.objects() {
            let len = |kind| {
                self.assembler
                    .element_range(*handle, kind)
                    .map(|range| range.len())
                    .unwrap_or(0)
            };
            let cartesian_size = len(ElementKind::CartesianState);
            let size = cartesian_size + len(ElementKind::Bias);
            if size == 0 {
                continue;
            }
            layout.push(EstimatedObject {
                handle: *handle,
                name: name.clone(),
                offset,
                size,
                cartesian_size,
            });
            offset += size;
        }
        layout
    }

    fn solve_for_size(&self) -> usize {
        self.layout.iter().map(|obj| obj.size).sum()
    }

    /// A-priori covariance from the objects, block diagonal.
    fn covariance_from_objects(&self) -> Result<DMatrix<f64>, ODError> {
        let n = self.solve_for_size();
        let mut covar = DMatrix::zeros(n, n);
        for obj in &self.layout {
            let object = &self.prop.objects()[obj.handle.0];
            let block = object
                .element_matrix(ElementKind::Covariance)
                .context(MissingCovarianceSnafu {
                    object: obj.name.clone(),
                })?;
            ensure!(
                block.nrows() == obj.size && block.ncols() == obj.size,
                DimensionMismatchSnafu {
                    action: "object covariance",
                    expected: obj.size,
                    got: block.nrows()
                }
            );
            covar
                .view_mut((obj.offset, obj.offset), (obj.size, obj.size))
                .copy_from(&block);
        }
        Ok(covar)
    }

    /// State transition matrix of the solve-for state since the latest update, block diagonal.
    fn stm(&self) -> Result<DMatrix<f64>, ODError> {
        let n = self.solve_for_size();
        let mut stm = DMatrix::zeros(n, n);
        for obj in &self.layout {
            let object = &self.prop.objects()[obj.handle.0];
            let block = object
                .element_matrix(ElementKind::Stm)
                .context(MissingStmSnafu {
                    object: obj.name.clone(),
                })?;
            ensure!(
                block.nrows() == obj.size && block.ncols() == obj.size,
                DimensionMismatchSnafu {
                    action: "object state transition matrix",
                    expected: obj.size,
                    got: block.nrows()
                }
            );
            stm.view_mut((obj.offset, obj.offset), (obj.size, obj.size))
                .copy_from(&block);
        }
        Ok(stm)
    }

    fn reset_stm(&mut self) -> Result<(), ODError> {
        self.assembler
            .reset_stm(self.prop.objects_mut())
            .context(ODStateSnafu)?;
        for obj in &self.layout {
            let Some(object) = self.prop.objects_mut().get_mut(obj.handle.0) else {
                continue;
            };
            if object.element_size(ElementKind::Stm) == Some(obj.size * obj.size) {
                for i in 0..obj.size {
                    for j in 0..obj.size {
                        let value = if i == j { 1.0 } else { 0.0 };
                        object.set_element_value(ElementKind::Stm, i * obj.size + j, value);
                    }
                }
            }
        }
        Ok(())
    }

    /// Jacobian of the Cartesian parameterization with respect to the solve-for state, None if identity.
    fn jacobian(&self) -> Option<DMatrix<f64>> {
        let n = self.solve_for_size();
        let mut jac = DMatrix::identity(n, n);
        let mut any = false;
        for obj in &self.layout {
            if let Some(partials) = self.prop.objects()[obj.handle.0].cartesian_partials() {
                if partials.nrows() == obj.cartesian_size && partials.ncols() == obj.cartesian_size {
                    jac.view_mut((obj.offset, obj.offset), (obj.cartesian_size, obj.cartesian_size))
                        .copy_from(&partials);
                    any = true;
                } else {
                    warn!("ignoring Cartesian partials of {} of unexpected size", obj.name);
                }
            }
        }
        any.then_some(jac)
    }

    fn cartesian_offsets(&self) -> Vec<usize> {
        self.layout
            .iter()
            .filter(|obj| obj.cartesian_size == 6)
            .map(|obj| obj.offset)
            .collect()
    }

    fn first_noise_epoch(&self, epoch: Epoch) -> Option<Epoch> {
        let step = self.noise_step?;
        let sign = self.direction.sign();
        match self.anchor {
            Some((anchor, true)) => {
                let ratio = (epoch - anchor).to_seconds() / step.to_seconds();
                // Next multiple of the step from the anchor, in the run direction
                let n = if sign > 0.0 {
                    (ratio + 1e-9).floor() + 1.0
                } else {
                    (ratio - 1e-9).ceil() - 1.0
                };
                Some(anchor + step * n)
            }
            _ => Some(epoch + step * sign),
        }
    }

    fn in_run_direction(&self, dt: Duration) -> bool {
        dt.to_seconds() * self.direction.sign() >= 0.0
    }

    /// A process noise update is due once its epoch is reached or passed, since a smoothing run may step over it.
    fn noise_due(&self, epoch: Epoch) -> bool {
        self.next_noise_epoch
            .map_or(false, |next| self.in_run_direction(epoch - next))
    }

    fn complete_initialization(&mut self) -> Result<FilterState, ODError> {
        ensure!(
            !self.assembler.objects().is_empty() && !self.prop.objects().is_empty(),
            NoParticipantsSnafu {
                details: "no object registered"
            }
        );
        self.layout = self.build_layout();
        ensure!(
            !self.layout.is_empty(),
            NoParticipantsSnafu {
                details: "no object has a solve-for state"
            }
        );
        let owned = self.prop.objects().len();
        ensure!(
            self.layout.iter().all(|obj| obj.handle.0 < owned),
            NoParticipantsSnafu {
                details: "an estimated object is not owned by the propagator"
            }
        );
        let forward = self.direction.is_forward();
        self.msr.set_direction(forward);
        self.msr.reset();

        self.assembler
            .map_objects_to_vector(self.prop.objects_mut())
            .context(ODStateSnafu)?;
        let mut epoch = self.assembler.epoch();
        info!("initializing {} estimation @ {epoch}", self.direction);

        let mut covar = match self.restart_covar.take() {
            Some(covar) => covar,
            None => self.covariance_from_objects()?,
        };
        let mut state = self.reference_state();
        let mut cutoff = epoch;

        if let Some(path) = self.config.warm_start_input.clone() {
            let chk = Checkpoint::from_path(&path).context(ODCheckpointSnafu)?;
            let selection = match self.config.restart_epoch {
                RestartEpoch::FirstMeasurement => {
                    let first = self.msr.epoch().context(NoMeasurementsRemainSnafu { epoch })?;
                    RowSelection::StrictlyBefore(first)
                }
                RestartEpoch::LastWarmStartRecord => RowSelection::Last,
                RestartEpoch::EarliestRecord => RowSelection::Earliest,
                RestartEpoch::Epoch(e) => RowSelection::AtOrBefore(e),
                RestartEpoch::ExactEpoch(e) => RowSelection::Exact(e),
            };
            let record = chk.select(selection).context(ODCheckpointSnafu)?;
            let headers = state_headers(&self.assembler, self.prop.objects());
            let jac = self.jacobian();
            let matched = chk
                .restore(record, &headers, &mut state, &mut covar, jac.as_ref())
                .context(ODCheckpointSnafu)?;
            info!(
                "warm start from {} @ {} ({matched} of {} states matched)",
                path.display(),
                record.epoch,
                headers.len()
            );
            epoch = record.epoch.to_time_scale(epoch.time_scale);
            // The record already includes the observations of its epoch
            cutoff = epoch + RowSelection::tolerance() * self.direction.sign();
            for object in self.prop.objects_mut() {
                object.set_epoch(epoch);
            }
            self.assembler
                .map_objects_to_vector(self.prop.objects_mut())
                .context(ODStateSnafu)?;
            self.apply_state(&state)?;
        }

        if cholesky_lower(&covar).is_none() {
            return Err(ODError::NotPositiveDefinite {
                matrix: "a-priori covariance",
            });
        }
        if self.apriori.is_none() {
            self.apriori = Some(covar.clone());
        }
        self.covar = covar;
        self.write_object_covariances();

        self.num_msrs = self.msr.drop_before(cutoff, forward);
        if self.num_msrs == 0 {
            ensure!(
                self.config.predict_span > Duration::ZERO || self.anchor.is_some(),
                NoMeasurementsRemainSnafu { epoch }
            );
            warn!("no observation to process after {epoch}: prediction only");
        } else {
            info!("processing {} observations", self.num_msrs);
        }

        let method = self
            .config
            .covariance_method
            .unwrap_or_else(|| CovarPropagation::default_for(self.assembler.has_noise_model()));
        self.covar_prop = CovariancePropagator::new(method);
        self.update_epochs = UpdateEpochs::new(epoch);
        self.estimation_start = epoch;

        self.reset_stm()?;
        self.assembler
            .map_vector_to_objects(self.prop.objects_mut())
            .context(ODStateSnafu)?;

        self.noise_step = if self.config.process_noise_step > Duration::ZERO {
            Some(self.config.process_noise_step)
        } else {
            self.assembler.noise_update_step()
        };
        self.next_noise_epoch = self.first_noise_epoch(epoch);
        if let Some(next) = self.next_noise_epoch {
            debug!("first process noise update @ {next}");
        }

        if forward {
            if let Some(path) = &self.config.warm_start_output {
                let headers = state_headers(&self.assembler, self.prop.objects());
                self.writer = Some(CheckpointWriter::new(path, &headers).context(ODCheckpointSnafu)?);
            }
        }

        let n = self.solve_for_size();
        let state = self.reference_state();
        let record = self.record(
            epoch,
            state.clone(),
            state,
            self.covar.clone(),
            DMatrix::identity(n, n),
            None,
            None,
        );
        self.push_record(record)?;

        Ok(self.after_measurement_check(epoch))
    }

    /// Next state once the current epoch is reached.
    fn after_measurement_check(&self, epoch: Epoch) -> FilterState {
        match self.msr.epoch() {
            Some(next) if !self.predicting && next == epoch => FilterState::Calculating,
            None if !self.predicting => FilterState::CheckingRun,
            _ => FilterState::Propagating,
        }
    }

    /// Returns the signed step to the next stop: the next observation, the next process noise update,
    /// or the prediction target. None if there is nowhere to go.
    pub fn find_time_step(&self) -> Option<Duration> {
        let epoch = self.assembler.epoch();
        let mut candidates = Vec::with_capacity(3);
        if self.predicting {
            candidates.push(self.predict_target? - epoch);
        } else {
            candidates.push(self.msr.epoch()? - epoch);
        }
        if let Some(next) = self.next_noise_epoch {
            candidates.push(next - epoch);
        }
        let step = candidates
            .into_iter()
            .filter(|dt| self.in_run_direction(*dt))
            .min_by_key(|dt| dt.abs())?;

        match &self.grid {
            Some(grid) if !self.direction.is_forward() && !self.predicting && step != Duration::ZERO => {
                let mut stop = grid.sync(epoch, epoch + step);
                // Observations the forward run could not compute are off the grid
                if let Some(next) = self.msr.epoch() {
                    if self.in_run_direction(next - epoch) && stop < next {
                        debug!("smoothing sync: stopping at the observation @ {next} instead of {stop}");
                        stop = next;
                    }
                }
                Some(stop - epoch)
            }
            _ => Some(step),
        }
    }

    fn propagate(&mut self) -> Result<FilterState, ODError> {
        let Some(step) = self.find_time_step() else {
            return Ok(FilterState::CheckingRun);
        };
        if step == Duration::ZERO {
            let epoch = self.assembler.epoch();
            if self.predicting {
                return Ok(FilterState::CheckingRun);
            }
            if self.noise_due(epoch) {
                self.noise_update(epoch)?;
            }
            return Ok(self.after_measurement_check(epoch));
        }

        let details = self.prop.step(step).context(ODPropSnafu)?;
        trace!("{details}");
        self.assembler
            .map_objects_to_vector(self.prop.objects_mut())
            .context(ODStateSnafu)?;
        self.assembler
            .map_vector_to_objects(self.prop.objects_mut())
            .context(ODStateSnafu)?;
        let epoch = self.assembler.epoch();
        debug!("propagated by {step} to {epoch}");

        let target_reached = self.predicting && self.predict_target == Some(epoch);
        if self.noise_due(epoch) || target_reached {
            self.noise_update(epoch)?;
        }

        if self.predicting {
            return Ok(match self.predict_target {
                Some(target) if target != epoch => FilterState::Propagating,
                _ => FilterState::CheckingRun,
            });
        }
        Ok(self.after_measurement_check(epoch))
    }

    /// Propagates the covariance to the epoch. Returns the a-priori covariance, the process noise, and the
    /// state transition matrix since the latest update.
    fn time_update(
        &mut self,
        epoch: Epoch,
    ) -> Result<(DMatrix<f64>, Option<DMatrix<f64>>, DMatrix<f64>), ODError> {
        let stm = self.stm()?;
        let elapsed = self.update_epochs.noise_interval(epoch);
        let noise = if elapsed.to_seconds() < MIN_NOISE_INTERVAL_S {
            None
        } else {
            self.assembler
                .process_noise(self.prop.objects(), elapsed, epoch)
        };
        let covar_bar = self
            .covar_prop
            .propagate(&self.covar, &stm, noise.as_ref(), epoch, &self.update_epochs)
            .context(ODStateSnafu)?;
        if !self.warned_indefinite && cholesky_lower(&covar_bar).is_none() {
            warn!("propagated covariance is no longer positive definite @ {epoch}");
            self.warned_indefinite = true;
        }
        Ok((covar_bar, noise, stm))
    }

    /// Closes the current update: records the epoch and resets the state transition matrices.
    fn close_update(&mut self, epoch: Epoch) -> Result<(), ODError> {
        self.update_epochs.record(epoch);
        self.reset_stm()?;
        self.write_object_covariances();
        // Only the objects' covariance blocks changed at this epoch
        self.assembler
            .map_vector_to_objects(self.prop.objects_mut())
            .context(ODStateSnafu)
    }

    /// Time update at a process noise epoch, logged as a predicted record.
    fn noise_update(&mut self, epoch: Epoch) -> Result<(), ODError> {
        let (covar_bar, noise, stm) = self.time_update(epoch)?;
        self.covar = covar_bar.clone();
        self.offset = self.offset.take().map(|offset| &stm * offset);
        self.close_update(epoch)?;
        self.next_noise_epoch = self.first_noise_epoch(epoch);
        debug!("time update @ {epoch}");

        let state = self.best_state(self.offset.as_ref());
        let record = self.record(epoch, state.clone(), state, covar_bar, stm, noise, None);
        self.push_record(record)
    }

    fn calculate(&mut self) -> Result<FilterState, ODError> {
        let epoch = self.assembler.epoch();
        let state = self.reference_state();
        if self
            .msr
            .calculate_measurements(epoch, &state)
            .context(ODMeasurementSnafu)?
        {
            if self.msr.event_count() > 0 {
                Ok(FilterState::Locating)
            } else {
                Ok(FilterState::Estimating)
            }
        } else {
            debug!("observation @ {epoch} cannot be computed");
            self.msr.mark_unused(EditReason::NotComputable);
            self.next_measurement(epoch)
        }
    }

    fn locate(&mut self) -> Result<FilterState, ODError> {
        let epoch = self.assembler.epoch();
        for index in 0..self.msr.event_count() {
            let mut polls = 0;
            while self.msr.locate_event(index).context(ODMeasurementSnafu)? == EventStatus::Pending {
                polls += 1;
                if polls >= MAX_EVENT_POLLS {
                    return EventResolutionSnafu {
                        index,
                        epoch,
                        details: format!("still pending after {polls} polls"),
                    }
                    .fail()
                    .context(ODMeasurementSnafu);
                }
            }
            self.msr.process_event(index).context(ODMeasurementSnafu)?;
        }
        Ok(FilterState::Estimating)
    }

    fn estimate(&mut self) -> Result<FilterState, ODError> {
        let epoch = self.assembler.epoch();
        let obs = self
            .msr
            .observation()
            .cloned()
            .context(NoObservationSnafu { epoch })
            .context(ODMeasurementSnafu)?;
        let n = self.solve_for_size();
        ensure!(
            obs.sensitivity.ncols() == n,
            DimensionMismatchSnafu {
                action: "observation sensitivity",
                expected: n,
                got: obs.sensitivity.ncols()
            }
        );

        let (covar_bar, noise, stm) = self.time_update(epoch)?;
        let offset_bar = self.offset.take().map(|offset| &stm * offset);
        let state_bar = self.best_state(offset_bar.as_ref());

        let deweight_scale = self
            .config
            .deweighting
            .map(|dw| dw.sigma_scale(&covar_bar))
            .unwrap_or(1.0);
        if deweight_scale > 1.0 {
            warn!("de-weighting {} by {deweight_scale:.3}", obs);
        }
        let msr_noise = &obs.noise * deweight_scale.powi(2);

        let prefit = obs.prefit();
        let innovation = match &offset_bar {
            Some(offset) => &prefit - &obs.sensitivity * offset,
            None => prefit.clone(),
        };
        let edits = self.editor.edit(
            &prefit,
            &obs.sensitivity,
            &covar_bar,
            &msr_noise,
            offset_bar.as_ref(),
        );
        let accepted: Vec<usize> = edits
            .iter()
            .enumerate()
            .filter_map(|(i, edit)| (!edit.rejected).then_some(i))
            .collect();

        let mut stats = MeasurementStats {
            id: obs.id.clone(),
            prefit,
            postfit: None,
            scaled_residuals: DVector::from_iterator(
                edits.len(),
                edits.iter().map(|edit| edit.scaled_residual),
            ),
            rejected: edits.iter().map(|edit| edit.rejected).collect(),
            edit: None,
            deweight_scale,
        };

        let state = if accepted.is_empty() {
            info!("{obs} rejected by {}", self.editor);
            self.msr.mark_unused(EditReason::SigmaEdit);
            stats.edit = Some(EditReason::SigmaEdit);
            self.covar = covar_bar.clone();
            self.offset = offset_bar;
            state_bar.clone()
        } else {
            if accepted.len() < edits.len() {
                debug!(
                    "{obs}: {} of {} components rejected",
                    edits.len() - accepted.len(),
                    edits.len()
                );
            }
            let h = obs.sensitivity.select_rows(accepted.iter());
            let r = msr_noise.select_rows(accepted.iter()).select_columns(accepted.iter());
            let y = innovation.select_rows(accepted.iter());
            let sqrt_bar = match self.covar_prop.method() {
                CovarPropagation::SquareRoot => self.covar_prop.sqrt_covar().cloned(),
                CovarPropagation::Direct => None,
            };
            let update = self
                .kf
                .measurement_update(&covar_bar, sqrt_bar.as_ref(), &h, &r, &y)?;
            match update.sqrt_covar {
                Some(sqrt) => self.covar_prop.set_sqrt_covar(sqrt),
                None => self.covar_prop.invalidate(),
            }
            self.covar = update.covar;
            stats.postfit = Some(&innovation - &obs.sensitivity * &update.state_correction);

            let delayed = self.config.delayed_rectification_span > Duration::ZERO
                && (epoch - self.estimation_start).abs() <= self.config.delayed_rectification_span;
            let correction = match offset_bar {
                Some(offset) => offset + update.state_correction,
                None => update.state_correction,
            };
            if delayed {
                debug!("holding the correction as an offset @ {epoch}");
                self.offset = Some(correction);
                self.best_state(self.offset.as_ref())
            } else {
                let state = self.reference_state() + correction;
                self.apply_state(&state)?;
                state
            }
        };

        self.close_update(epoch)?;
        let record = self.record(
            epoch,
            state,
            state_bar,
            covar_bar,
            stm,
            noise,
            Some(stats),
        );

        // Fold the offset once the next observation lies beyond the delayed rectification span
        let next = self.next_measurement(epoch)?;
        if let Some(offset) = self.offset.clone() {
            let beyond = match self.msr.epoch() {
                Some(next_epoch) => {
                    (next_epoch - self.estimation_start).abs() > self.config.delayed_rectification_span
                }
                None => true,
            };
            if beyond {
                info!("rectifying the state @ {epoch}");
                let state = self.reference_state() + offset;
                self.offset = None;
                self.apply_state(&state)?;
            }
        }
        let mut record = record;
        record.offset_pending = self.offset.is_some();
        self.push_record(record)?;
        Ok(next)
    }

    /// Moves on to the next observation and reports the progress.
    fn next_measurement(&mut self, epoch: Epoch) -> Result<FilterState, ODError> {
        self.msr.advance();
        self.msr_cnt += 1;
        if self.num_msrs > 0 {
            let msr_prct = (10 * self.msr_cnt / self.num_msrs).min(10);
            if !self.reported[msr_prct] {
                info!(
                    "{:>3}% done ({} observations processed)",
                    10 * msr_prct,
                    self.msr_cnt
                );
                self.reported[msr_prct] = true;
            }
        }
        Ok(self.after_measurement_check(epoch))
    }

    fn check_completion(&mut self) -> Result<FilterState, ODError> {
        let epoch = self.assembler.epoch();
        if !self.predicting {
            if let Some(offset) = self.offset.take() {
                info!("rectifying the state at the end of the observations @ {epoch}");
                let state = self.reference_state() + offset;
                self.apply_state(&state)?;
            }
            self.snapshot = Some(EstimationSnapshot {
                epoch,
                state: self.reference_state(),
                covar: self.covar.clone(),
                objects: self.prop.objects().to_vec(),
            });

            let sign = self.direction.sign();
            let target = match self.anchor {
                Some((anchor, _)) => Some(anchor),
                None if self.config.predict_span > Duration::ZERO => {
                    Some(epoch + self.config.predict_span * sign)
                }
                None => None,
            };
            if let Some(target) = target.filter(|t| *t != epoch && self.in_run_direction(*t - epoch)) {
                info!("predicting from {epoch} to {target}");
                self.predicting = true;
                self.predict_target = Some(target);
                return Ok(FilterState::Propagating);
            }
        }
        self.finish_run()?;
        Ok(FilterState::Finished)
    }

    fn finish_run(&mut self) -> Result<(), ODError> {
        if let Some(mut writer) = self.writer.take() {
            writer.flush().context(ODCheckpointSnafu)?;
        }
        let (accepted, rejected) = self.log.measurement_counts();
        info!(
            "{} run finished @ {}: {accepted} observations accepted, {rejected} rejected",
            self.direction,
            self.assembler.epoch()
        );
        if accepted > 0 {
            info!(
                "RMS prefit residual {:.6e}, RMS postfit residual {:.6e}",
                self.log.rms_prefit_residuals(),
                self.log.rms_postfit_residuals()
            );
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn record(
        &self,
        epoch: Epoch,
        state: DVector<f64>,
        state_bar: DVector<f64>,
        covar_bar: DMatrix<f64>,
        stm: DMatrix<f64>,
        process_noise: Option<DMatrix<f64>>,
        measurement: Option<MeasurementStats>,
    ) -> FilterRecord {
        let covar_vnb = covar_in_vnb(&state, &self.covar, &self.cartesian_offsets());
        FilterRecord {
            epoch,
            predicted: measurement.as_ref().map_or(true, |stats| !stats.accepted()),
            state,
            state_bar,
            covar: self.covar.clone(),
            covar_bar,
            covar_vnb,
            stm,
            process_noise,
            measurement,
            offset_pending: self.offset.is_some(),
        }
    }

    fn push_record(&mut self, record: FilterRecord) -> Result<(), ODError> {
        if self.writer.is_some() && self.offset.is_none() {
            let jac = self.jacobian();
            if let Some(writer) = &mut self.writer {
                writer
                    .write(record.epoch, &record.state, &record.covar, jac.as_ref())
                    .context(ODCheckpointSnafu)?;
            }
        }
        self.log.push(record)
    }
}
