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

use crate::linalg::{DMatrix, Vector3};
use crate::time::Epoch;
use enum_iterator::{all, Sequence};
use serde_derive::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

mod assembler;
mod covariance;
mod spacecraft;

pub use assembler::{AssemblerBuilder, ListItem, StateVectorAssembler};
pub use covariance::{CovarPropagation, CovariancePropagator, UpdateEpochs};
pub use spacecraft::{Formation, Spacecraft};

/// A non-owning handle to a propagated object: the index of that object in the external registry
/// (typically the slice of objects owned by the dynamics propagator).
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObjectHandle(pub usize);

impl fmt::Display for ObjectHandle {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// The kinds of propagated quantities an object may contribute to the propagation state vector.
///
/// The declaration order is the global rank used to sort the state vector: the Cartesian state
/// comes first, then the state transition matrix, the dynamics Jacobian, the covariance, and finally the bias terms.
#[derive(
    Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Sequence,
)]
pub enum ElementKind {
    /// Position and velocity, in km and km/s.
    CartesianState,
    /// State transition matrix over the solve-for states of the object.
    Stm,
    /// Jacobian of the dynamics (the "A" matrix), which is closed after integration.
    AMatrix,
    /// Covariance of the object's state.
    Covariance,
    /// Stochastic bias parameters.
    Bias,
}

impl ElementKind {
    pub fn name(self) -> &'static str {
        match self {
            Self::CartesianState => "CartesianState",
            Self::Stm => "STM",
            Self::AMatrix => "AMatrix",
            Self::Covariance => "Covariance",
            Self::Bias => "Bias",
        }
    }

    /// Returns whether this element is stored as a square matrix, row major, in the state vector.
    pub fn is_matrix(self) -> bool {
        matches!(self, Self::Stm | Self::AMatrix | Self::Covariance)
    }

    /// Returns whether this element is part of the estimated (solve-for) state.
    pub fn is_solve_for(self) -> bool {
        matches!(self, Self::CartesianState | Self::Bias)
    }
}

impl fmt::Display for ElementKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl FromStr for ElementKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let alias = match s.to_lowercase().as_str() {
            "orbit" | "state" | "cartesian" => Some(Self::CartesianState),
            "orbitstm" | "statetransitionmatrix" => Some(Self::Stm),
            "orbitamatrix" => Some(Self::AMatrix),
            "covar" => Some(Self::Covariance),
            _ => None,
        };
        alias
            .or_else(|| all::<Self>().find(|kind| kind.name().eq_ignore_ascii_case(s)))
            .ok_or_else(|| format!("unknown state element `{s}`"))
    }
}

/// Dynamics information handed to the process noise models.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct NoiseContext {
    pub epoch: Epoch,
    /// Instantaneous acceleration of the object, if known, in km/s^2.
    pub acceleration: Option<Vector3<f64>>,
}

/// Typed capability interface of any object whose quantities are propagated.
///
/// Elements are accessed by kind and by zero-based flat index. Matrix elements are stored row major.
pub trait PropagatedObject {
    /// Unique name of this object
    fn name(&self) -> &str;

    fn epoch(&self) -> Epoch;

    fn set_epoch(&mut self, epoch: Epoch);

    /// Returns the number of scalars of this element, or None if this object does not carry it.
    fn element_size(&self, kind: ElementKind) -> Option<usize>;

    fn element_value(&self, kind: ElementKind, index: usize) -> f64;

    fn set_element_value(&mut self, kind: ElementKind, index: usize, value: f64);

    /// Number of columns of a matrix element, or its length for a vector element.
    fn element_row_len(&self, kind: ElementKind) -> usize {
        let size = self.element_size(kind).unwrap_or(0);
        if kind.is_matrix() {
            (size as f64).sqrt().round() as usize
        } else {
            size
        }
    }

    /// Returns whether this element affects the dynamics of the object.
    fn affects_dynamics(&self, kind: ElementKind) -> bool {
        kind != ElementKind::Covariance
    }

    /// Returns whether this element requires a post-integration completion step.
    fn needs_completion(&self, kind: ElementKind) -> bool {
        kind == ElementKind::AMatrix
    }

    /// Instantaneous acceleration of the object, used as dynamics context by noise models.
    fn acceleration(&self) -> Option<Vector3<f64>> {
        None
    }

    /// Refreshes any cached values, called before the object is read into the state vector.
    fn refresh(&mut self) {}

    /// Label of the coordinate frame of the Cartesian state, used in checkpoint headers.
    fn frame_name(&self) -> &str {
        "EarthMJ2000Eq"
    }

    /// Jacobian of the Cartesian parameterization with respect to the solve-for parameterization (dX/dS).
    /// None means that both parameterizations are identical.
    fn cartesian_partials(&self) -> Option<DMatrix<f64>> {
        None
    }

    /// Returns a matrix element as a square matrix.
    fn element_matrix(&self, kind: ElementKind) -> Option<DMatrix<f64>> {
        self.element_size(kind)?;
        let n = self.element_row_len(kind);
        let rows = if kind.is_matrix() { n } else { 1 };
        Some(DMatrix::from_fn(rows, n, |i, j| {
            self.element_value(kind, i * n + j)
        }))
    }
}

impl<T: PropagatedObject + ?Sized> PropagatedObject for Box<T> {
    fn name(&self) -> &str {
        (**self).name()
    }

    fn epoch(&self) -> Epoch {
        (**self).epoch()
    }

    fn set_epoch(&mut self, epoch: Epoch) {
        (**self).set_epoch(epoch)
    }

    fn element_size(&self, kind: ElementKind) -> Option<usize> {
        (**self).element_size(kind)
    }

    fn element_value(&self, kind: ElementKind, index: usize) -> f64 {
        (**self).element_value(kind, index)
    }

    fn set_element_value(&mut self, kind: ElementKind, index: usize, value: f64) {
        (**self).set_element_value(kind, index, value)
    }

    fn element_row_len(&self, kind: ElementKind) -> usize {
        (**self).element_row_len(kind)
    }

    fn affects_dynamics(&self, kind: ElementKind) -> bool {
        (**self).affects_dynamics(kind)
    }

    fn needs_completion(&self, kind: ElementKind) -> bool {
        (**self).needs_completion(kind)
    }

    fn acceleration(&self) -> Option<Vector3<f64>> {
        (**self).acceleration()
    }

    fn refresh(&mut self) {
        (**self).refresh()
    }

    fn frame_name(&self) -> &str {
        (**self).frame_name()
    }

    fn cartesian_partials(&self) -> Option<DMatrix<f64>> {
        (**self).cartesian_partials()
    }
}

/// Accessors of one element kind of an object of type `T`.
pub struct ElementAccessor<T> {
    pub size: fn(&T) -> Option<usize>,
    pub get: fn(&T, usize) -> f64,
    pub set: fn(&mut T, usize, f64),
}

impl<T> Clone for ElementAccessor<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for ElementAccessor<T> {}

/// Table mapping each element kind to its size, getter and setter for a given object type.
///
/// Implementors of [PropagatedObject] build one registry per type and dispatch to it,
/// which keeps the element access strongly typed.
pub struct ElementRegistry<T> {
    entries: BTreeMap<ElementKind, ElementAccessor<T>>,
}

impl<T> Default for ElementRegistry<T> {
    fn default() -> Self {
        Self {
            entries: BTreeMap::new(),
        }
    }
}

impl<T> ElementRegistry<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the accessors of an element kind, replacing any previous entry.
    pub fn with(
        mut self,
        kind: ElementKind,
        size: fn(&T) -> Option<usize>,
        get: fn(&T, usize) -> f64,
        set: fn(&mut T, usize, f64),
    ) -> Self {
        self.entries.insert(kind, ElementAccessor { size, get, set });
        self
    }

    pub fn kinds(&self) -> impl Iterator<Item = ElementKind> + '_ {
        self.entries.keys().copied()
    }

    pub fn size(&self, object: &T, kind: ElementKind) -> Option<usize> {
        self.entries.get(&kind).and_then(|acc| (acc.size)(object))
    }

    /// Returns the value of the element, or NaN if the element is not registered.
    pub fn get(&self, object: &T, kind: ElementKind, index: usize) -> f64 {
        match self.entries.get(&kind) {
            Some(acc) => (acc.get)(object, index),
            None => f64::NAN,
        }
    }

    /// Sets the value of the element and returns whether the element is registered.
    pub fn set(&self, object: &mut T, kind: ElementKind, index: usize, value: f64) -> bool {
        match self.entries.get(&kind) {
            Some(acc) => {
                (acc.set)(object, index, value);
                true
            }
            None => false,
        }
    }
}
