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

use super::{
    CovarPropagation, CovariancePropagator, ElementKind, NoiseContext, ObjectHandle,
    PropagatedObject, UpdateEpochs,
};
use crate::errors::{
    DimensionMismatchSnafu, DuplicateObjectSnafu, EmptyStateSnafu, InfiniteSnafu,
    InvalidElementSizeSnafu, NotANumberSnafu, SingularStmSnafu, StateError, UnknownElementSnafu,
    UnregisteredObjectSnafu,
};
use crate::linalg::{DMatrix, DVector};
use crate::od::noise::ProcessNoiseModel;
use crate::time::{Duration, Epoch, Unit};
use snafu::prelude::*;
use std::collections::BTreeMap;
use std::ops::Range;
use std::str::FromStr;

/// Descriptor of one scalar slot of the propagation state vector.
#[derive(Clone, Debug, PartialEq)]
pub struct ListItem {
    pub object: ObjectHandle,
    pub object_name: String,
    pub kind: ElementKind,
    /// One-based index of this scalar within its element
    pub subelement: usize,
    /// Row of this scalar for matrix elements, or its zero-based index for vector elements
    pub row: usize,
    /// Column of this scalar for matrix elements, zero otherwise
    pub col: usize,
    /// Number of scalars of the element
    pub length: usize,
    /// Set if this slot affects the dynamics of its object
    pub affects_dynamics: bool,
    /// Set if this slot requires a post-integration completion step
    pub needs_completion: bool,
    /// Index of the first slot of the owning object
    pub associate: usize,
}

impl ListItem {
    /// Returns the `object.element.subelement` description of this slot.
    pub fn description(&self) -> String {
        format!("{}.{}.{}", self.object_name, self.kind, self.subelement)
    }
}

#[derive(Debug)]
struct Registration {
    handle: ObjectHandle,
    name: String,
    elements: Vec<ElementKind>,
    noise: Option<Box<dyn ProcessNoiseModel>>,
    method: Option<CovarPropagation>,
}

/// Collects the objects and the properties to propagate before the state vector is built.
///
/// Registration order matters: it breaks ties between elements of the same kind.
#[derive(Debug, Default)]
pub struct AssemblerBuilder {
    registrations: Vec<Registration>,
}

impl AssemblerBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an object to the managed set.
    pub fn register_object<O: PropagatedObject + ?Sized>(
        &mut self,
        handle: ObjectHandle,
        object: &O,
    ) -> Result<&mut Self, StateError> {
        ensure!(
            !self
                .registrations
                .iter()
                .any(|reg| reg.handle == handle || reg.name == object.name()),
            DuplicateObjectSnafu {
                object: object.name().to_string()
            }
        );
        debug!("registering {} as {handle}", object.name());
        self.registrations.push(Registration {
            handle,
            name: object.name().to_string(),
            elements: Vec::new(),
            noise: None,
            method: None,
        });
        Ok(self)
    }

    /// Declares a propagated property of a registered object, by name.
    pub fn register_property<O: PropagatedObject + ?Sized>(
        &mut self,
        handle: ObjectHandle,
        object: &O,
        property: &str,
    ) -> Result<&mut Self, StateError> {
        let kind = ElementKind::from_str(property).map_err(|_| StateError::UnknownElement {
            object: object.name().to_string(),
            element: property.to_string(),
        })?;
        self.register_element(handle, object, kind)
    }

    /// Declares a propagated element of a registered object.
    pub fn register_element<O: PropagatedObject + ?Sized>(
        &mut self,
        handle: ObjectHandle,
        object: &O,
        kind: ElementKind,
    ) -> Result<&mut Self, StateError> {
        let size = object
            .element_size(kind)
            .context(UnknownElementSnafu {
                object: object.name(),
                element: kind.name(),
            })?;
        ensure!(
            size > 0,
            InvalidElementSizeSnafu {
                object: object.name(),
                element: kind.name()
            }
        );
        let reg = self.registration_mut(handle)?;
        if reg.elements.contains(&kind) {
            debug!("{kind} of {} already registered", reg.name);
        } else {
            reg.elements.push(kind);
        }
        Ok(self)
    }

    /// Attaches a process noise model to the covariance propagation of an object.
    pub fn with_noise_model(
        &mut self,
        handle: ObjectHandle,
        model: Box<dyn ProcessNoiseModel>,
    ) -> Result<&mut Self, StateError> {
        self.registration_mut(handle)?.noise = Some(model);
        Ok(self)
    }

    /// Selects the covariance propagation method of an object, overriding the choice based on its noise model.
    pub fn with_covariance_method(
        &mut self,
        handle: ObjectHandle,
        method: CovarPropagation,
    ) -> Result<&mut Self, StateError> {
        self.registration_mut(handle)?.method = Some(method);
        Ok(self)
    }

    fn registration_mut(&mut self, handle: ObjectHandle) -> Result<&mut Registration, StateError> {
        self.registrations
            .iter_mut()
            .find(|reg| reg.handle == handle)
            .context(UnregisteredObjectSnafu { handle: handle.0 })
    }

    /// Sorts all of the registered elements by kind (ties broken by registration order) and builds the state vector.
    pub fn build<O: PropagatedObject>(
        self,
        objects: &[O],
    ) -> Result<StateVectorAssembler, StateError> {
        let mut items = Vec::new();
        for reg in &self.registrations {
            let object = objects
                .get(reg.handle.0)
                .context(UnregisteredObjectSnafu { handle: reg.handle.0 })?;
            for &kind in &reg.elements {
                let length = object.element_size(kind).context(UnknownElementSnafu {
                    object: reg.name.clone(),
                    element: kind.name(),
                })?;
                ensure!(
                    length > 0,
                    InvalidElementSizeSnafu {
                        object: reg.name.clone(),
                        element: kind.name()
                    }
                );
                let row_len = object.element_row_len(kind).max(1);
                for subelement in 1..=length {
                    let (row, col) = if kind.is_matrix() {
                        ((subelement - 1) / row_len, (subelement - 1) % row_len)
                    } else {
                        (subelement - 1, 0)
                    };
                    items.push(ListItem {
                        object: reg.handle,
                        object_name: reg.name.clone(),
                        kind,
                        subelement,
                        row,
                        col,
                        length,
                        affects_dynamics: object.affects_dynamics(kind),
                        needs_completion: object.needs_completion(kind),
                        associate: 0,
                    });
                }
            }
        }
        ensure!(!items.is_empty(), EmptyStateSnafu);

        // Stable: registration order is kept within a kind
        items.sort_by_key(|item| item.kind);

        let mut first_slot = BTreeMap::new();
        for (i, item) in items.iter().enumerate() {
            first_slot.entry(item.object).or_insert(i);
        }
        for item in &mut items {
            if let Some(&slot) = first_slot.get(&item.object) {
                item.associate = slot;
            }
        }

        let completion = items
            .iter()
            .enumerate()
            .filter_map(|(i, item)| item.needs_completion.then_some(i))
            .collect();

        let mut covariances = BTreeMap::new();
        let mut registered = Vec::with_capacity(self.registrations.len());
        for reg in self.registrations {
            let object = &objects[reg.handle.0];
            if reg.elements.contains(&ElementKind::Covariance) {
                let method = reg
                    .method
                    .unwrap_or_else(|| CovarPropagation::default_for(reg.noise.is_some()));
                info!("{} covariance propagated with the {method} method", reg.name);
                covariances.insert(
                    reg.handle,
                    CovarianceTracker {
                        propagator: CovariancePropagator::new(method),
                        noise: reg.noise,
                        last_stm: object.element_matrix(ElementKind::Stm),
                    },
                );
            } else if reg.noise.is_some() {
                warn!(
                    "{} has a process noise model but no propagated covariance: model ignored",
                    reg.name
                );
            }
            registered.push((reg.handle, reg.name));
        }

        let epoch = objects[registered[0].0 .0].epoch();
        let size = items.len();
        info!("built propagation state vector of {size} elements @ {epoch}");

        Ok(StateVectorAssembler {
            registered,
            items,
            values: DVector::zeros(size),
            derivative: DVector::zeros(size),
            epoch,
            update_epochs: UpdateEpochs::new(epoch),
            completion,
            covariances,
            warned_epochs: false,
        })
    }
}

#[derive(Debug)]
struct CovarianceTracker {
    propagator: CovariancePropagator,
    noise: Option<Box<dyn ProcessNoiseModel>>,
    /// STM as of the previous mapping onto the objects, None meaning identity
    last_stm: Option<DMatrix<f64>>,
}

/// Owns the flat propagation state vector of all registered objects and its slot descriptors.
#[derive(Debug)]
pub struct StateVectorAssembler {
    registered: Vec<(ObjectHandle, String)>,
    items: Vec<ListItem>,
    values: DVector<f64>,
    derivative: DVector<f64>,
    epoch: Epoch,
    update_epochs: UpdateEpochs,
    completion: Vec<usize>,
    covariances: BTreeMap<ObjectHandle, CovarianceTracker>,
    warned_epochs: bool,
}

impl StateVectorAssembler {
    pub fn builder() -> AssemblerBuilder {
        AssemblerBuilder::new()
    }

    pub fn state_size(&self) -> usize {
        self.items.len()
    }

    pub fn items(&self) -> &[ListItem] {
        &self.items
    }

    /// Handles and names of the registered objects, in registration order.
    pub fn objects(&self) -> &[(ObjectHandle, String)] {
        &self.registered
    }

    pub fn epoch(&self) -> Epoch {
        self.epoch
    }

    pub fn update_epochs(&self) -> UpdateEpochs {
        self.update_epochs
    }

    pub fn values(&self) -> &DVector<f64> {
        &self.values
    }

    pub fn values_mut(&mut self) -> &mut DVector<f64> {
        &mut self.values
    }

    /// Time derivative of the Cartesian slots (velocity and acceleration) as of the last harvest, zero elsewhere.
    pub fn derivative(&self) -> &DVector<f64> {
        &self.derivative
    }

    /// Index of the first slot of the object owning the provided slot.
    pub fn associate_index(&self, slot: usize) -> Option<usize> {
        self.items.get(slot).map(|item| item.associate)
    }

    /// Descriptions of every slot, as `object.element.subelement`.
    pub fn element_descriptions(&self) -> Vec<String> {
        self.items.iter().map(|item| item.description()).collect()
    }

    /// Indexes of the slots which require a post-integration completion step.
    pub fn completion_indices(&self) -> &[usize] {
        &self.completion
    }

    pub fn completion_size(&self) -> usize {
        self.completion.len()
    }

    /// Range of slots of the provided element of an object.
    pub fn element_range(&self, handle: ObjectHandle, kind: ElementKind) -> Option<Range<usize>> {
        let start = self
            .items
            .iter()
            .position(|item| item.object == handle && item.kind == kind)?;
        Some(start..start + self.items[start].length)
    }

    /// Returns the matrix stored in the slots of the provided element.
    pub fn element_matrix(&self, handle: ObjectHandle, kind: ElementKind) -> Option<DMatrix<f64>> {
        let range = self.element_range(handle, kind)?;
        let slots = &self.items[range.clone()];
        let nrows = slots.iter().map(|item| item.row).max()? + 1;
        let ncols = slots.iter().map(|item| item.col).max()? + 1;
        let mut m = DMatrix::zeros(nrows, ncols);
        for (item, value) in slots.iter().zip(self.values.rows(range.start, range.len()).iter()) {
            m[(item.row, item.col)] = *value;
        }
        Some(m)
    }

    pub fn covariance(&self, handle: ObjectHandle) -> Option<DMatrix<f64>> {
        self.element_matrix(handle, ElementKind::Covariance)
    }

    pub fn stm(&self, handle: ObjectHandle) -> Option<DMatrix<f64>> {
        self.element_matrix(handle, ElementKind::Stm)
    }

    /// Slot indexes of the solve-for elements, grouped by object in registration order.
    pub fn solve_for_indices(&self) -> Vec<usize> {
        let mut indices = Vec::new();
        for (handle, _) in &self.registered {
            for kind in [ElementKind::CartesianState, ElementKind::Bias] {
                if let Some(range) = self.element_range(*handle, kind) {
                    indices.extend(range);
                }
            }
        }
        indices
    }

    /// Returns whether any tracked covariance has a process noise model attached.
    pub fn has_noise_model(&self) -> bool {
        self.covariances.values().any(|tracker| tracker.noise.is_some())
    }

    /// Smallest non-zero update step preferred by the process noise models.
    pub fn noise_update_step(&self) -> Option<Duration> {
        self.covariances
            .values()
            .filter_map(|tracker| tracker.noise.as_ref().map(|model| model.update_step()))
            .filter(|step| *step > Duration::ZERO)
            .min()
    }

    /// Process noise of the solve-for states accumulated over `elapsed`, laid out as [Self::solve_for_indices].
    ///
    /// Returns None if no process noise model is attached.
    pub fn process_noise<O: PropagatedObject>(
        &self,
        objects: &[O],
        elapsed: Duration,
        epoch: Epoch,
    ) -> Option<DMatrix<f64>> {
        if !self.has_noise_model() {
            return None;
        }
        let size = self.solve_for_indices().len();
        let mut q = DMatrix::zeros(size, size);
        let mut offset = 0;
        for (handle, _) in &self.registered {
            let obj_size: usize = [ElementKind::CartesianState, ElementKind::Bias]
                .iter()
                .filter_map(|kind| self.element_range(*handle, *kind))
                .map(|range| range.len())
                .sum();
            let model = self
                .covariances
                .get(handle)
                .and_then(|tracker| tracker.noise.as_ref());
            if let (Some(model), Some(object)) = (model, objects.get(handle.0)) {
                let context = NoiseContext {
                    epoch,
                    acceleration: object.acceleration(),
                };
                let noise = model.noise_matrix(elapsed, &context);
                let n = noise.nrows().min(obj_size);
                q.view_mut((offset, offset), (n, n))
                    .copy_from(&noise.view((0, 0), (n, n)));
            }
            offset += obj_size;
        }
        Some(q)
    }

    /// Returns false if any two registered objects are not at the same epoch. Reading the objects into the
    /// state vector only warns about it, once.
    pub fn epochs_match<O: PropagatedObject>(&self, objects: &[O]) -> bool {
        self.epoch_mismatch(objects).is_none()
    }

    fn epoch_mismatch<O: PropagatedObject>(&self, objects: &[O]) -> Option<String> {
        let tol = 1 * Unit::Microsecond;
        let mut epochs = self
            .registered
            .iter()
            .filter_map(|(handle, _)| objects.get(handle.0).map(|o| (o.name(), o.epoch())));
        let (ref_name, ref_epoch) = epochs.next()?;
        epochs
            .find(|(_, epoch)| (*epoch - ref_epoch).abs() > tol)
            .map(|(name, epoch)| format!("{ref_name} @ {ref_epoch} but {name} @ {epoch}"))
    }

    /// Reads the current values of every registered object into the state vector.
    pub fn map_objects_to_vector<O: PropagatedObject>(
        &mut self,
        objects: &mut [O],
    ) -> Result<(), StateError> {
        for (handle, _) in &self.registered {
            objects
                .get_mut(handle.0)
                .context(UnregisteredObjectSnafu { handle: handle.0 })?
                .refresh();
        }

        for (i, item) in self.items.iter().enumerate() {
            let object = objects
                .get(item.object.0)
                .context(UnregisteredObjectSnafu {
                    handle: item.object.0,
                })?;
            let value = object.element_value(item.kind, item.subelement - 1);
            ensure!(
                !value.is_nan(),
                NotANumberSnafu {
                    object: item.object_name.clone(),
                    parameter: format!("{}.{}", item.kind, item.subelement)
                }
            );
            ensure!(
                value.is_finite(),
                InfiniteSnafu {
                    object: item.object_name.clone(),
                    parameter: format!("{}.{}", item.kind, item.subelement)
                }
            );
            self.values[i] = value;

            self.derivative[i] = if item.kind == ElementKind::CartesianState {
                let idx = item.subelement - 1;
                let axis = idx % 6;
                if axis < 3 {
                    object.element_value(item.kind, idx + 3)
                } else {
                    object
                        .acceleration()
                        .map(|acc| acc[axis - 3])
                        .unwrap_or(0.0)
                }
            } else {
                0.0
            };
        }

        let first = self.registered[0].0;
        self.epoch = objects[first.0].epoch();
        if !self.warned_epochs {
            if let Some(mismatch) = self.epoch_mismatch(objects) {
                warn!("epochs do not match: {mismatch}");
                self.warned_epochs = true;
            }
        }
        Ok(())
    }

    /// Writes the state vector back onto the objects, propagating their covariances first, and synchronizes
    /// every object to the epoch of the state vector.
    pub fn map_vector_to_objects<O: PropagatedObject>(
        &mut self,
        objects: &mut [O],
    ) -> Result<(), StateError> {
        let epoch = self.epoch;
        let handles: Vec<ObjectHandle> = self.covariances.keys().copied().collect();
        for handle in handles {
            let covar = self.propagate_covariance(handle, objects, epoch)?;
            if let Some(range) = self.element_range(handle, ElementKind::Covariance) {
                for i in range {
                    let (row, col) = (self.items[i].row, self.items[i].col);
                    self.values[i] = covar[(row, col)];
                }
            }
        }

        for (i, item) in self.items.iter().enumerate() {
            objects
                .get_mut(item.object.0)
                .context(UnregisteredObjectSnafu {
                    handle: item.object.0,
                })?
                .set_element_value(item.kind, item.subelement - 1, self.values[i]);
        }

        self.update_epochs.record(epoch);
        for (handle, _) in &self.registered {
            if let Some(object) = objects.get_mut(handle.0) {
                object.set_epoch(epoch);
            }
        }
        Ok(())
    }

    fn propagate_covariance<O: PropagatedObject>(
        &mut self,
        handle: ObjectHandle,
        objects: &[O],
        epoch: Epoch,
    ) -> Result<DMatrix<f64>, StateError> {
        let object = objects
            .get(handle.0)
            .context(UnregisteredObjectSnafu { handle: handle.0 })?;
        let covar = object
            .element_matrix(ElementKind::Covariance)
            .context(UnknownElementSnafu {
                object: object.name(),
                element: "Covariance",
            })?;
        let n = covar.nrows();
        let stm_now = self.stm(handle);
        let epochs = self.update_epochs;

        let Some(tracker) = self.covariances.get_mut(&handle) else {
            return Ok(covar);
        };

        let step_stm = match stm_now {
            Some(stm_now) => {
                let step = match tracker.last_stm.take() {
                    Some(old) => {
                        let inv = old.try_inverse().context(SingularStmSnafu {
                            object: object.name(),
                        })?;
                        &stm_now * inv
                    }
                    None => stm_now.clone(),
                };
                tracker.last_stm = Some(stm_now);
                ensure!(
                    step.nrows() >= n,
                    DimensionMismatchSnafu {
                        action: "covariance propagation of an object",
                        expected: n,
                        got: step.nrows()
                    }
                );
                step.view((0, 0), (n, n)).into_owned()
            }
            None => DMatrix::identity(n, n),
        };

        let noise = tracker.noise.as_ref().map(|model| {
            let context = NoiseContext {
                epoch,
                acceleration: object.acceleration(),
            };
            model.noise_matrix(epochs.noise_interval(epoch), &context)
        });

        tracker
            .propagator
            .propagate(&covar, &step_stm, noise.as_ref(), epoch, &epochs)
    }

    /// Resets every STM to identity, in the state vector and on the objects, at the start of a propagation segment.
    pub fn reset_stm<O: PropagatedObject>(&mut self, objects: &mut [O]) -> Result<(), StateError> {
        for (i, item) in self.items.iter().enumerate() {
            if item.kind == ElementKind::Stm {
                let value = if item.row == item.col { 1.0 } else { 0.0 };
                self.values[i] = value;
                objects
                    .get_mut(item.object.0)
                    .context(UnregisteredObjectSnafu {
                        handle: item.object.0,
                    })?
                    .set_element_value(item.kind, item.subelement - 1, value);
            }
        }
        for tracker in self.covariances.values_mut() {
            tracker.last_stm = None;
        }
        Ok(())
    }
}
