use rand_distr::{Distribution, Normal};
use rand_pcg::Pcg64Mcg;
use seqod::linalg::{DMatrix, DVector, Vector3, Vector6};
use seqod::od::msr::{EditReason, MeasurementError, MeasurementManager, Observation};
use seqod::od::process::{EstimatorConfig, FilterStateMachine};
use seqod::od::KF;
use seqod::propagators::{DynamicsPropagator, IntegrationDetails, PropagationError};
use seqod::state::{ElementKind, ObjectHandle, Spacecraft, StateVectorAssembler};
use seqod::time::{Duration, Epoch};

mod predict;
mod resid_reject;
mod smoothing;
mod warm_start;

/// Straight line motion: the position drifts with the constant velocity, and the STM is accumulated exactly.
pub struct ConstantVelocity {
    pub objects: Vec<Spacecraft>,
}

impl DynamicsPropagator for ConstantVelocity {
    type Object = Spacecraft;

    fn step(&mut self, step: Duration) -> Result<IntegrationDetails, PropagationError> {
        let dt = step.to_seconds();
        for sc in &mut self.objects {
            let n = sc.solve_for_size();
            let mut phi = DMatrix::<f64>::identity(n, n);
            for i in 0..3 {
                phi[(i, i + 3)] = dt;
                sc.state[i] += dt * sc.state[i + 3];
            }
            if let Some(stm) = sc.stm.as_mut() {
                *stm = &phi * &*stm;
            }
            sc.epoch = sc.epoch + step;
        }
        Ok(IntegrationDetails::fixed(step))
    }

    fn objects(&self) -> &[Spacecraft] {
        &self.objects
    }

    fn objects_mut(&mut self) -> &mut [Spacecraft] {
        &mut self.objects
    }
}

/// True straight line trajectory of the tracked object.
#[derive(Copy, Clone, Debug)]
pub struct Truth {
    pub epoch: Epoch,
    pub radius: Vector3<f64>,
    pub velocity: Vector3<f64>,
}

impl Truth {
    pub fn new(epoch: Epoch) -> Self {
        Self {
            epoch,
            radius: Vector3::new(7000.0, 100.0, -50.0),
            velocity: Vector3::new(0.1, 7.5, 0.2),
        }
    }

    pub fn radius_at(&self, epoch: Epoch) -> Vector3<f64> {
        self.radius + self.velocity * (epoch - self.epoch).to_seconds()
    }

    pub fn state_at(&self, epoch: Epoch) -> Vector6<f64> {
        let r = self.radius_at(epoch);
        Vector6::new(
            r[0],
            r[1],
            r[2],
            self.velocity[0],
            self.velocity[1],
            self.velocity[2],
        )
    }
}

/// Observes the position of the first solve-for object, with `H = [I 0]`.
pub struct PositionTracker {
    pub epochs: Vec<Epoch>,
    pub observed: Vec<Vector3<f64>>,
    pub sigma: f64,
    /// Epochs at which the object is not visible
    pub hidden: Vec<Epoch>,
    pub unused: Vec<(Epoch, EditReason)>,
    order: Vec<usize>,
    cursor: usize,
    forward: bool,
    current: Option<Observation>,
}

impl PositionTracker {
    /// Noise free observations of the truth, every `interval` from the truth epoch.
    pub fn new(truth: &Truth, count: usize, interval: Duration, sigma: f64) -> Self {
        let epochs: Vec<Epoch> = (0..count)
            .map(|k| truth.epoch + interval * (k as f64))
            .collect();
        let observed = epochs.iter().map(|e| truth.radius_at(*e)).collect();
        Self {
            epochs,
            observed,
            sigma,
            hidden: Vec::new(),
            unused: Vec::new(),
            order: (0..count).collect(),
            cursor: 0,
            forward: true,
            current: None,
        }
    }

    /// Adds white noise on every observation.
    pub fn with_noise(mut self, seed: u64) -> Self {
        let mut rng = Pcg64Mcg::new(seed as u128);
        let normal = Normal::new(0.0, self.sigma).unwrap();
        for obs in &mut self.observed {
            for i in 0..3 {
                obs[i] += normal.sample(&mut rng);
            }
        }
        self
    }

    fn index(&self) -> Option<usize> {
        self.order.get(self.cursor).copied()
    }
}

impl MeasurementManager for PositionTracker {
    fn calculate_measurements(
        &mut self,
        epoch: Epoch,
        state: &DVector<f64>,
    ) -> Result<bool, MeasurementError> {
        let idx = self
            .index()
            .ok_or(MeasurementError::NoObservation { epoch })?;
        if self.hidden.contains(&epoch) {
            self.current = None;
            return Ok(false);
        }
        let n = state.len();
        let mut sensitivity = DMatrix::zeros(3, n);
        for i in 0..3 {
            sensitivity[(i, i)] = 1.0;
        }
        self.current = Some(Observation {
            id: "position".to_string(),
            epoch,
            observed: DVector::from_column_slice(self.observed[idx].as_slice()),
            computed: state.rows(0, 3).into_owned(),
            sensitivity,
            noise: DMatrix::from_diagonal_element(3, 3, self.sigma.powi(2)),
        });
        Ok(true)
    }

    fn epoch(&self) -> Option<Epoch> {
        self.index().map(|idx| self.epochs[idx])
    }

    fn observation(&self) -> Option<&Observation> {
        self.current.as_ref()
    }

    fn advance(&mut self) -> bool {
        self.current = None;
        self.cursor += 1;
        self.cursor < self.order.len()
    }

    fn reset(&mut self) {
        self.order = (0..self.epochs.len()).collect();
        if !self.forward {
            self.order.reverse();
        }
        self.cursor = 0;
        self.current = None;
    }

    fn set_direction(&mut self, forward: bool) {
        self.forward = forward;
    }

    fn mark_unused(&mut self, reason: EditReason) {
        if let Some(epoch) = self.epoch() {
            self.unused.push((epoch, reason));
        }
    }

    fn drop_before(&mut self, epoch: Epoch, forward: bool) -> usize {
        while let Some(next) = self.epoch() {
            let before = if forward { next < epoch } else { next > epoch };
            if !before {
                break;
            }
            self.cursor += 1;
        }
        self.order.len() - self.cursor
    }
}

/// A-priori estimate: the truth with an error of a few hundred meters and a few meters per second.
pub fn estimated_spacecraft(truth: &Truth) -> Spacecraft {
    let mut state = truth.state_at(truth.epoch);
    state[0] += 0.5;
    state[1] -= 0.3;
    state[2] += 0.2;
    state[3] += 1e-3;
    state[4] -= 2e-3;
    let covar = DMatrix::from_diagonal(&DVector::from_vec(vec![
        1.0, 1.0, 1.0, 1e-4, 1e-4, 1e-4,
    ]));
    Spacecraft::new("sat", truth.epoch, state)
        .with_stm()
        .with_covariance(covar)
}

/// Registers the Cartesian state, STM and covariance of every object.
pub fn assemble(objects: &[Spacecraft]) -> seqod::state::AssemblerBuilder {
    let mut builder = StateVectorAssembler::builder();
    for (i, sc) in objects.iter().enumerate() {
        builder
            .register_object(ObjectHandle(i), sc)
            .unwrap()
            .register_element(ObjectHandle(i), sc, ElementKind::CartesianState)
            .unwrap()
            .register_element(ObjectHandle(i), sc, ElementKind::Stm)
            .unwrap()
            .register_element(ObjectHandle(i), sc, ElementKind::Covariance)
            .unwrap();
    }
    builder
}

pub fn position_error(state: &DVector<f64>, truth: &Truth, epoch: Epoch) -> f64 {
    (Vector3::new(state[0], state[1], state[2]) - truth.radius_at(epoch)).norm()
}

pub type Estimator = FilterStateMachine<ConstantVelocity, PositionTracker, KF>;

/// Square root filter of the straight line motion.
pub fn estimator(truth: &Truth, tracker: PositionTracker, config: EstimatorConfig) -> Estimator {
    let objects = vec![estimated_spacecraft(truth)];
    let asm = assemble(&objects).build(&objects).unwrap();
    FilterStateMachine::new(ConstantVelocity { objects }, tracker, KF::new(), asm, config).unwrap()
}
