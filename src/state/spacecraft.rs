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

use super::{ElementKind, ElementRegistry, PropagatedObject};
use lazy_static::lazy_static;
use crate::linalg::{DMatrix, DVector, Vector3, Vector6};
use crate::time::Epoch;
use std::fmt;

lazy_static! {
    static ref SPACECRAFT_ELEMENTS: ElementRegistry<Spacecraft> =
        ElementRegistry::<Spacecraft>::new()
            .with(
                ElementKind::CartesianState,
                |_| Some(6),
                |sc: &Spacecraft, i| sc.state[i],
                |sc: &mut Spacecraft, i, v| sc.state[i] = v,
            )
            .with(
                ElementKind::Stm,
                |sc| sc.stm.as_ref().map(|m| m.len()),
                |sc, i| matrix_get(&sc.stm, i),
                |sc, i, v| matrix_set(&mut sc.stm, i, v),
            )
            .with(
                ElementKind::AMatrix,
                |sc| sc.a_matrix.as_ref().map(|m| m.len()),
                |sc, i| matrix_get(&sc.a_matrix, i),
                |sc, i, v| matrix_set(&mut sc.a_matrix, i, v),
            )
            .with(
                ElementKind::Covariance,
                |sc| sc.covar.as_ref().map(|m| m.len()),
                |sc, i| matrix_get(&sc.covar, i),
                |sc, i, v| matrix_set(&mut sc.covar, i, v),
            )
            .with(
                ElementKind::Bias,
                |sc| (!sc.bias.is_empty()).then_some(sc.bias.len()),
                |sc, i| sc.bias[i],
                |sc, i, v| sc.bias[i] = v,
            );
}

fn matrix_get(m: &Option<DMatrix<f64>>, index: usize) -> f64 {
    match m {
        Some(m) => {
            let n = m.ncols();
            m[(index / n, index % n)]
        }
        None => f64::NAN,
    }
}

fn matrix_set(m: &mut Option<DMatrix<f64>>, index: usize, value: f64) {
    if let Some(m) = m {
        let n = m.ncols();
        m[(index / n, index % n)] = value;
    }
}

/// A spacecraft whose orbit, optional bias terms, state transition matrix and covariance are propagated.
#[derive(Clone, Debug, PartialEq)]
pub struct Spacecraft {
    pub name: String,
    pub epoch: Epoch,
    /// Position and velocity in km and km/s
    pub state: Vector6<f64>,
    /// Stochastic bias parameters, solved-for after the Cartesian state
    pub bias: DVector<f64>,
    pub stm: Option<DMatrix<f64>>,
    pub a_matrix: Option<DMatrix<f64>>,
    pub covar: Option<DMatrix<f64>>,
    /// Latest acceleration computed by the dynamics, in km/s^2
    pub acceleration: Vector3<f64>,
    pub frame: String,
}

impl Spacecraft {
    pub fn new(name: &str, epoch: Epoch, state: Vector6<f64>) -> Self {
        Self {
            name: name.to_string(),
            epoch,
            state,
            bias: DVector::zeros(0),
            stm: None,
            a_matrix: None,
            covar: None,
            acceleration: Vector3::zeros(),
            frame: "EarthMJ2000Eq".to_string(),
        }
    }

    /// Number of solve-for states: the Cartesian state and the bias terms.
    pub fn solve_for_size(&self) -> usize {
        6 + self.bias.len()
    }

    /// Adds the bias terms, resizing the STM if one is already set.
    pub fn with_bias(mut self, bias: &[f64]) -> Self {
        self.bias = DVector::from_column_slice(bias);
        if self.stm.is_some() {
            self = self.with_stm();
        }
        self
    }

    /// Enables the state transition matrix, initialized to identity.
    pub fn with_stm(mut self) -> Self {
        let n = self.solve_for_size();
        self.stm = Some(DMatrix::identity(n, n));
        self
    }

    pub fn with_a_matrix(mut self) -> Self {
        let n = self.solve_for_size();
        self.a_matrix = Some(DMatrix::zeros(n, n));
        self
    }

    pub fn with_covariance(mut self, covar: DMatrix<f64>) -> Self {
        self.covar = Some(covar);
        self
    }

    pub fn with_frame(mut self, frame: &str) -> Self {
        self.frame = frame.to_string();
        self
    }

    pub fn radius(&self) -> Vector3<f64> {
        self.state.fixed_rows::<3>(0).into_owned()
    }

    pub fn velocity(&self) -> Vector3<f64> {
        self.state.fixed_rows::<3>(3).into_owned()
    }
}

impl fmt::Display for Spacecraft {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{} @ {}: r = [{:.6}, {:.6}, {:.6}] km, v = [{:.6}, {:.6}, {:.6}] km/s",
            self.name,
            self.epoch,
            self.state[0],
            self.state[1],
            self.state[2],
            self.state[3],
            self.state[4],
            self.state[5]
        )
    }
}

impl PropagatedObject for Spacecraft {
    fn name(&self) -> &str {
        &self.name
    }

    fn epoch(&self) -> Epoch {
        self.epoch
    }

    fn set_epoch(&mut self, epoch: Epoch) {
        self.epoch = epoch;
    }

    fn element_size(&self, kind: ElementKind) -> Option<usize> {
        SPACECRAFT_ELEMENTS.size(self, kind)
    }

    fn element_value(&self, kind: ElementKind, index: usize) -> f64 {
        SPACECRAFT_ELEMENTS.get(self, kind, index)
    }

    fn set_element_value(&mut self, kind: ElementKind, index: usize, value: f64) {
        SPACECRAFT_ELEMENTS.set(self, kind, index, value);
    }

    fn acceleration(&self) -> Option<Vector3<f64>> {
        Some(self.acceleration)
    }

    fn frame_name(&self) -> &str {
        &self.frame
    }
}

/// A formation groups several spacecraft which are propagated together: its Cartesian state is the
/// concatenation of the states of its members.
#[derive(Clone, Debug, PartialEq)]
pub struct Formation {
    pub name: String,
    pub members: Vec<Spacecraft>,
    epoch: Epoch,
    centroid: Vector6<f64>,
}

impl Formation {
    pub fn new(name: &str, members: Vec<Spacecraft>) -> Self {
        let epoch = members
            .first()
            .map(|sc| sc.epoch)
            .unwrap_or_else(|| Epoch::from_tai_seconds(0.0));
        let mut me = Self {
            name: name.to_string(),
            members,
            epoch,
            centroid: Vector6::zeros(),
        };
        me.refresh();
        me
    }

    /// Mean Cartesian state of the members, as of the last refresh.
    pub fn centroid(&self) -> Vector6<f64> {
        self.centroid
    }
}

impl PropagatedObject for Formation {
    fn name(&self) -> &str {
        &self.name
    }

    fn epoch(&self) -> Epoch {
        self.epoch
    }

    fn set_epoch(&mut self, epoch: Epoch) {
        self.epoch = epoch;
        for sc in &mut self.members {
            sc.epoch = epoch;
        }
    }

    fn element_size(&self, kind: ElementKind) -> Option<usize> {
        match kind {
            ElementKind::CartesianState if !self.members.is_empty() => {
                Some(6 * self.members.len())
            }
            _ => None,
        }
    }

    fn element_value(&self, kind: ElementKind, index: usize) -> f64 {
        match kind {
            ElementKind::CartesianState => self.members[index / 6].state[index % 6],
            _ => f64::NAN,
        }
    }

    fn set_element_value(&mut self, kind: ElementKind, index: usize, value: f64) {
        if kind == ElementKind::CartesianState {
            self.members[index / 6].state[index % 6] = value;
        }
    }

    fn acceleration(&self) -> Option<Vector3<f64>> {
        None
    }

    fn refresh(&mut self) {
        if self.members.is_empty() {
            return;
        }
        let epoch = self.epoch;
        let mut sum = Vector6::zeros();
        for sc in &mut self.members {
            sc.epoch = epoch;
            sum += sc.state;
        }
        self.centroid = sum / (self.members.len() as f64);
    }
}
