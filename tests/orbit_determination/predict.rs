use super::*;
use approx::assert_relative_eq;
use pretty_env_logger::try_init;
use rstest::*;
use seqod::od::prelude::*;

#[fixture]
fn truth() -> Truth {
    let _ = try_init();
    Truth::new(crate::test_epoch())
}

#[rstest]
fn od_predict_span(truth: Truth) {
    let tracker = PositionTracker::new(&truth, 20, 1 * Unit::Minute, 0.01).with_noise(1);
    let config = EstimatorConfig::builder()
        .predict_span(10 * Unit::Minute)
        .build();
    let mut odp = estimator(&truth, tracker, config);
    odp.run_complete().unwrap();
    assert!(odp.is_predicting());

    let snapshot = odp.estimation_snapshot().unwrap().clone();
    assert_eq!(snapshot.epoch, truth.epoch + 19 * Unit::Minute);
    assert_eq!(snapshot.objects[0].epoch, snapshot.epoch);

    let last = odp.log().last().unwrap();
    assert_eq!(last.epoch, snapshot.epoch + 10 * Unit::Minute);
    assert!(last.predicted);
    assert!(last.measurement.is_none());

    // Straight line prediction of the estimate and its covariance
    let mut phi = DMatrix::<f64>::identity(6, 6);
    for i in 0..3 {
        phi[(i, i + 3)] = 600.0;
    }
    let expected = &phi * &snapshot.covar * phi.transpose();
    assert_relative_eq!(last.covar, expected, epsilon = 1e-14, max_relative = 1e-9);
    assert_relative_eq!(
        last.state,
        &phi * &snapshot.state,
        epsilon = 1e-9,
        max_relative = 1e-12
    );
    assert_relative_eq!(last.stm, phi, epsilon = 1e-12);
    assert_eq!(odp.prop.objects()[0].epoch, last.epoch);
}

#[rstest]
fn od_predict_to_anchor(truth: Truth) {
    let tracker = PositionTracker::new(&truth, 20, 1 * Unit::Minute, 0.01);
    let end = truth.epoch + 19 * Unit::Minute;
    let anchor = end + 150 * Unit::Second;
    let config = EstimatorConfig::builder()
        .process_noise_step(1 * Unit::Minute)
        .build();
    let mut odp = estimator(&truth, tracker, config);
    odp.set_anchor_epoch(anchor, true);
    odp.run_complete().unwrap();

    let log = odp.log();
    assert_eq!(log.last().unwrap().epoch, anchor);
    assert_eq!(log.measurement_records().count(), 20);

    let time_updates: Vec<Epoch> = log
        .iter()
        .skip(1)
        .filter(|rec| rec.measurement.is_none())
        .map(|rec| rec.epoch)
        .collect();
    // Every noise update is a whole number of steps from the anchor
    for epoch in &time_updates {
        let steps = (*epoch - anchor).to_seconds() / 60.0;
        assert!(steps.fract().abs() < 1e-9, "time update @ {epoch} off the anchor grid");
    }
    assert_eq!(time_updates[0], truth.epoch + 30 * Unit::Second);
    assert_eq!(time_updates.iter().filter(|e| **e > end).count(), 3);
}

#[rstest]
fn od_no_measurements(truth: Truth) {
    // Nothing to process and nothing to predict
    let tracker = PositionTracker::new(&truth, 0, 1 * Unit::Minute, 0.01);
    let mut odp = estimator(&truth, tracker, EstimatorConfig::default());
    let err = odp.run_complete().unwrap_err();
    assert!(matches!(err, ODError::NoMeasurementsRemain { .. }));
    assert_eq!(err.category(), ErrorCategory::DataConsistency);

    // Prediction only
    let tracker = PositionTracker::new(&truth, 0, 1 * Unit::Minute, 0.01);
    let config = EstimatorConfig::builder()
        .predict_span(1 * Unit::Hour)
        .build();
    let mut odp = estimator(&truth, tracker, config);
    odp.run_complete().unwrap();
    assert_eq!(odp.log().len(), 2);
    assert_eq!(odp.log().last().unwrap().epoch, truth.epoch + 1 * Unit::Hour);
    assert_eq!(odp.log().measurement_counts(), (0, 0));
}
