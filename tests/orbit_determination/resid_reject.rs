use super::*;
use pretty_env_logger::try_init;
use rstest::*;
use seqod::od::prelude::*;

#[fixture]
fn truth() -> Truth {
    let _ = try_init();
    Truth::new(crate::test_epoch())
}

#[rstest]
fn od_resid_reject_outlier(truth: Truth) {
    let mut tracker = PositionTracker::new(&truth, 30, 1 * Unit::Minute, 0.01);
    tracker.observed[10] += Vector3::new(10.0, 10.0, 10.0);
    let outlier = tracker.epochs[10];

    let mut odp = estimator(&truth, tracker, EstimatorConfig::default());
    odp.run_complete().unwrap();

    assert_eq!(odp.msr.unused, vec![(outlier, EditReason::SigmaEdit)]);
    assert_eq!(odp.log().measurement_counts(), (29, 1));

    let rec = odp.log().at_epoch(outlier).unwrap();
    let stats = rec.measurement.as_ref().unwrap();
    assert_eq!(stats.edit, Some(EditReason::SigmaEdit));
    assert!(!stats.accepted());
    assert!(stats.postfit.is_none());
    assert_eq!(stats.rejected, vec![true, true, true]);
    assert!(stats.scaled_residuals.iter().all(|r| *r > 3.0));
    assert!(rec.predicted);
    // Time update only
    assert_eq!(rec.covar, rec.covar_bar);
    assert_eq!(rec.state, rec.state_bar);

    let last = odp.log().last().unwrap();
    assert!(position_error(&last.state, &truth, last.epoch) < 1e-3);
}

#[rstest]
fn od_resid_reject_component(truth: Truth) {
    let mut tracker = PositionTracker::new(&truth, 20, 1 * Unit::Minute, 0.01);
    tracker.observed[12][0] += 10.0;
    let epoch = tracker.epochs[12];

    let mut odp = estimator(&truth, tracker, EstimatorConfig::default());
    odp.run_complete().unwrap();

    assert!(odp.msr.unused.is_empty());
    let rec = odp.log().at_epoch(epoch).unwrap();
    let stats = rec.measurement.as_ref().unwrap();
    assert!(stats.accepted());
    assert!(!rec.predicted);
    assert_eq!(stats.rejected, vec![true, false, false]);
    // Only the accepted components reduce the uncertainty
    assert!((rec.covar[(0, 0)] - rec.covar_bar[(0, 0)]).abs() < 1e-9 * rec.covar_bar[(0, 0)]);
    assert!(rec.covar[(1, 1)] < rec.covar_bar[(1, 1)]);
    assert!(rec.covar[(2, 2)] < rec.covar_bar[(2, 2)]);
    // The rejected component does not pull the estimate
    assert!((rec.state[0] - truth.radius_at(epoch)[0]).abs() < 1e-3);
}

#[rstest]
fn od_resid_reject_wide_gate(truth: Truth) {
    let mut tracker = PositionTracker::new(&truth, 10, 1 * Unit::Minute, 0.01);
    tracker.observed[5] += Vector3::new(1.0, 0.0, 0.0);
    let config = EstimatorConfig::builder().sigma_multiplier(1e6).build();
    let mut odp = estimator(&truth, tracker, config);
    odp.run_complete().unwrap();
    assert_eq!(odp.log().measurement_counts(), (10, 0));
}

#[rstest]
fn od_deweighting(truth: Truth) {
    let tracker = PositionTracker::new(&truth, 10, 1 * Unit::Minute, 0.01);
    let config = EstimatorConfig::builder()
        .deweighting(Deweighting {
            threshold: 0.5,
            coefficient: 3.0,
        })
        .build();
    let mut odp = estimator(&truth, tracker, config);
    odp.run_complete().unwrap();

    let scales: Vec<f64> = odp
        .log()
        .measurement_records()
        .map(|rec| rec.measurement.as_ref().unwrap().deweight_scale)
        .collect();
    // The velocity is unknown until the second observation is processed
    assert_eq!(scales[0], 2.0);
    assert_eq!(scales[1], 2.0);
    assert!(scales[2..].iter().all(|s| *s == 1.0));
}
