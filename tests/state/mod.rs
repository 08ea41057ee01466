use approx::assert_relative_eq;
use pretty_env_logger::try_init;
use rstest::*;
use seqod::linalg::{DMatrix, Vector6};
use seqod::state::{Formation, StateVectorAssembler};
use seqod::time::{Epoch, Unit};
use seqod::{ElementKind, ObjectHandle, PropagatedObject, Spacecraft, StateError};

mod covariance;

#[fixture]
fn epoch() -> Epoch {
    let _ = try_init();
    crate::test_epoch()
}

pub fn leo(name: &str, epoch: Epoch) -> Spacecraft {
    let covar = DMatrix::from_fn(6, 6, |i, j| {
        if i == j {
            if i < 3 {
                0.25
            } else {
                1e-6
            }
        } else if (i < 3) == (j < 3) {
            1e-8
        } else {
            0.0
        }
    });
    Spacecraft::new(
        name,
        epoch,
        Vector6::new(-2436.45, -2436.45, 6891.037, 5.088611, -5.088611, 0.0),
    )
    .with_stm()
    .with_covariance(covar)
}

/// Emulates a straight line propagator step on the STM and the epoch of a spacecraft.
pub fn straight_step(sc: &mut Spacecraft, seconds: f64) {
    let mut step = DMatrix::identity(6, 6);
    for i in 0..3 {
        step[(i, i + 3)] = seconds;
        sc.state[i] += seconds * sc.state[i + 3];
    }
    if let Some(stm) = sc.stm.as_mut() {
        *stm = &step * &*stm;
    }
    sc.epoch = sc.epoch + seconds * Unit::Second;
}

#[rstest]
fn assemble_orbit_stm_covariance(epoch: Epoch) {
    let mut objects = vec![leo("sat", epoch)];
    let mut builder = StateVectorAssembler::builder();
    builder
        .register_object(ObjectHandle(0), &objects[0])
        .unwrap()
        .register_property(ObjectHandle(0), &objects[0], "Orbit")
        .unwrap()
        .register_property(ObjectHandle(0), &objects[0], "OrbitSTM")
        .unwrap()
        .register_property(ObjectHandle(0), &objects[0], "Covariance")
        .unwrap();
    let mut asm = builder.build(&objects).unwrap();
    assert_eq!(asm.state_size(), 78);

    let descriptions = asm.element_descriptions();
    assert_eq!(descriptions[0], "sat.CartesianState.1");
    assert_eq!(descriptions[5], "sat.CartesianState.6");
    assert_eq!(descriptions[6], "sat.STM.1");
    assert_eq!(descriptions[41], "sat.STM.36");
    assert_eq!(descriptions[42], "sat.Covariance.1");
    assert_eq!(descriptions[77], "sat.Covariance.36");
    assert!(asm.items().iter().all(|item| item.associate == 0));
    assert_eq!(
        asm.element_range(ObjectHandle(0), ElementKind::Covariance),
        Some(42..78)
    );

    asm.map_objects_to_vector(&mut objects).unwrap();
    assert_eq!(asm.values()[2], 6891.037);
    assert_eq!(asm.derivative()[0], 5.088611);
    assert_eq!(
        asm.covariance(ObjectHandle(0)).unwrap(),
        objects[0].covar.clone().unwrap()
    );
}

#[rstest]
fn identity_stm_keeps_covariance(epoch: Epoch) {
    let mut objects = vec![leo("sat", epoch)];
    let apriori = objects[0].covar.clone().unwrap();
    let mut builder = StateVectorAssembler::builder();
    builder
        .register_object(ObjectHandle(0), &objects[0])
        .unwrap()
        .register_element(ObjectHandle(0), &objects[0], ElementKind::CartesianState)
        .unwrap()
        .register_element(ObjectHandle(0), &objects[0], ElementKind::Stm)
        .unwrap()
        .register_element(ObjectHandle(0), &objects[0], ElementKind::Covariance)
        .unwrap();
    let mut asm = builder.build(&objects).unwrap();

    // Same epoch, several times
    for _ in 0..3 {
        asm.map_objects_to_vector(&mut objects).unwrap();
        asm.map_vector_to_objects(&mut objects).unwrap();
        assert_eq!(objects[0].covar.as_ref().unwrap(), &apriori);
    }

    // Later epoch but no dynamics and no process noise
    for k in 1..=3 {
        objects[0].epoch = epoch + (10 * k) * Unit::Second;
        asm.map_objects_to_vector(&mut objects).unwrap();
        asm.map_vector_to_objects(&mut objects).unwrap();
        assert_relative_eq!(
            objects[0].covar.clone().unwrap(),
            apriori,
            max_relative = 1e-15
        );
    }
    assert_eq!(asm.update_epochs().at_last, epoch + 30 * Unit::Second);
}

#[rstest]
fn vector_round_trip(epoch: Epoch) {
    let mut objects = vec![leo("one", epoch).with_bias(&[0.5, -0.5]), leo("two", epoch)];
    let mut builder = StateVectorAssembler::builder();
    for i in 0..2 {
        builder
            .register_object(ObjectHandle(i), &objects[i])
            .unwrap()
            .register_element(ObjectHandle(i), &objects[i], ElementKind::CartesianState)
            .unwrap();
    }
    builder
        .register_element(ObjectHandle(0), &objects[0], ElementKind::Bias)
        .unwrap();
    let mut asm = builder.build(&objects).unwrap();
    assert_eq!(asm.state_size(), 14);
    assert_eq!(
        asm.solve_for_indices(),
        vec![0, 1, 2, 3, 4, 5, 12, 13, 6, 7, 8, 9, 10, 11]
    );

    asm.map_objects_to_vector(&mut objects).unwrap();
    asm.values_mut()[7] += 1.0;
    asm.values_mut()[13] = 0.75;
    asm.map_vector_to_objects(&mut objects).unwrap();
    assert_relative_eq!(objects[1].state[1], -2435.45, epsilon = 1e-9);
    assert_eq!(objects[0].bias[1], 0.75);
    // Untouched values come back unchanged
    assert_eq!(objects[0].state, leo("one", epoch).state);
}

#[rstest]
fn formation_members(epoch: Epoch) {
    let a = Spacecraft::new("a", epoch, Vector6::new(7000.0, 0.0, 0.0, 0.0, 7.5, 0.0));
    let b = Spacecraft::new("b", epoch, Vector6::new(7001.0, 0.0, 0.0, 0.0, 7.5, 0.0));
    let mut objects = vec![Formation::new("pair", vec![a, b])];
    let mut builder = StateVectorAssembler::builder();
    builder
        .register_object(ObjectHandle(0), &objects[0])
        .unwrap()
        .register_element(ObjectHandle(0), &objects[0], ElementKind::CartesianState)
        .unwrap();
    assert!(matches!(
        builder
            .register_element(ObjectHandle(0), &objects[0], ElementKind::Stm)
            .unwrap_err(),
        StateError::UnknownElement { .. }
    ));
    let mut asm = builder.build(&objects).unwrap();
    assert_eq!(asm.state_size(), 12);
    assert_eq!(asm.items()[6].subelement, 7);

    asm.map_objects_to_vector(&mut objects).unwrap();
    assert_eq!(asm.values()[6], 7001.0);
    asm.values_mut()[6] = 7003.0;
    asm.map_vector_to_objects(&mut objects).unwrap();
    assert_eq!(objects[0].members[1].state[0], 7003.0);

    // The centroid is refreshed when the formation is read again
    asm.map_objects_to_vector(&mut objects).unwrap();
    assert_eq!(objects[0].centroid()[0], 7001.5);
    assert_eq!(objects[0].epoch(), epoch);
}
