use super::*;
use seqod::od::noise::SNC;
use seqod::state::{CovarPropagation, CovariancePropagator, UpdateEpochs};
use seqod::time::Duration;
use seqod::utils::is_symmetric;

fn tracked(objects: &[Spacecraft], method: CovarPropagation, snc: bool) -> StateVectorAssembler {
    let mut builder = StateVectorAssembler::builder();
    builder
        .register_object(ObjectHandle(0), &objects[0])
        .unwrap()
        .register_element(ObjectHandle(0), &objects[0], ElementKind::CartesianState)
        .unwrap()
        .register_element(ObjectHandle(0), &objects[0], ElementKind::Stm)
        .unwrap()
        .register_element(ObjectHandle(0), &objects[0], ElementKind::Covariance)
        .unwrap()
        .with_covariance_method(ObjectHandle(0), method)
        .unwrap();
    if snc {
        builder
            .with_noise_model(
                ObjectHandle(0),
                Box::new(SNC::from_sigmas(Duration::ZERO, [1e-8, 1e-8, 1e-8])),
            )
            .unwrap();
    }
    builder.build(objects).unwrap()
}

fn sync(asm: &mut StateVectorAssembler, objects: &mut [Spacecraft]) -> DMatrix<f64> {
    asm.map_objects_to_vector(objects).unwrap();
    asm.map_vector_to_objects(objects).unwrap();
    objects[0].covar.clone().unwrap()
}

#[rstest]
fn stepping_back_restores_covariance(epoch: Epoch) {
    let mut objects = vec![leo("sat", epoch)];
    let apriori = objects[0].covar.clone().unwrap();
    let mut asm = tracked(&objects, CovarPropagation::Direct, false);
    sync(&mut asm, &mut objects);

    straight_step(&mut objects[0], 60.0);
    let later = sync(&mut asm, &mut objects);
    assert!(later[(0, 0)] > apriori[(0, 0)]);

    // Back to the epoch before the last update: the cached covariance is returned
    objects[0].epoch = epoch;
    objects[0].stm = Some(DMatrix::identity(6, 6));
    assert_eq!(sync(&mut asm, &mut objects), apriori);
    assert_eq!(sync(&mut asm, &mut objects), apriori);
    assert_eq!(asm.update_epochs(), UpdateEpochs::new(epoch));

    // And forward again
    straight_step(&mut objects[0], 60.0);
    assert_relative_eq!(
        sync(&mut asm, &mut objects),
        later,
        epsilon = 1e-18,
        max_relative = 1e-14
    );
}

#[rstest]
fn square_root_matches_direct(epoch: Epoch) {
    let mut direct = vec![leo("sat", epoch)];
    let mut sqrt = direct.clone();
    let mut asm_direct = tracked(&direct, CovarPropagation::Direct, true);
    let mut asm_sqrt = tracked(&sqrt, CovarPropagation::SquareRoot, true);
    assert!(asm_sqrt.has_noise_model());
    assert_eq!(asm_sqrt.noise_update_step(), None);

    sync(&mut asm_direct, &mut direct);
    sync(&mut asm_sqrt, &mut sqrt);
    for _ in 0..5 {
        straight_step(&mut direct[0], 60.0);
        straight_step(&mut sqrt[0], 60.0);
        let p_direct = sync(&mut asm_direct, &mut direct);
        let p_sqrt = sync(&mut asm_sqrt, &mut sqrt);
        assert!(is_symmetric(&p_sqrt, 1e-12));
        assert_relative_eq!(p_sqrt, p_direct, epsilon = 1e-14, max_relative = 1e-9);
    }
    // Process noise inflates the velocity uncertainty
    assert!(direct[0].covar.as_ref().unwrap()[(3, 3)] > 1e-6);
}

#[rstest]
fn square_root_without_factor(epoch: Epoch) {
    // No square root exists: the covariance is propagated in the direct form and the run goes on
    let mut sqrt = vec![leo("sat", epoch)];
    sqrt[0].covar = Some(DMatrix::from_diagonal_element(6, 6, -1.0));
    let mut direct = sqrt.clone();
    let mut asm_sqrt = tracked(&sqrt, CovarPropagation::SquareRoot, false);
    let mut asm_direct = tracked(&direct, CovarPropagation::Direct, false);
    sync(&mut asm_sqrt, &mut sqrt);
    sync(&mut asm_direct, &mut direct);

    for _ in 0..3 {
        straight_step(&mut sqrt[0], 60.0);
        straight_step(&mut direct[0], 60.0);
        assert_eq!(
            sync(&mut asm_sqrt, &mut sqrt),
            sync(&mut asm_direct, &mut direct)
        );
    }
    assert!(sqrt[0].covar.as_ref().unwrap()[(0, 0)] < 0.0);
}

#[rstest]
fn propagator_dimensions(epoch: Epoch) {
    let mut prop = CovariancePropagator::new(CovarPropagation::Direct);
    let epochs = UpdateEpochs::new(epoch);
    let err = prop
        .propagate(
            &DMatrix::identity(6, 6),
            &DMatrix::identity(7, 7),
            None,
            epoch + 1 * Unit::Minute,
            &epochs,
        )
        .unwrap_err();
    assert!(matches!(err, StateError::DimensionMismatch { .. }));
    assert!(err.is_configuration());

    let err = prop
        .propagate(
            &DMatrix::identity(6, 6),
            &DMatrix::identity(6, 6),
            Some(&DMatrix::identity(7, 7)),
            epoch + 1 * Unit::Minute,
            &epochs,
        )
        .unwrap_err();
    assert!(matches!(err, StateError::DimensionMismatch { .. }));
}
