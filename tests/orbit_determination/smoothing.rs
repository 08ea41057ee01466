use super::*;
use pretty_env_logger::try_init;
use rstest::*;
use seqod::od::prelude::*;

#[fixture]
fn truth() -> Truth {
    let _ = try_init();
    Truth::new(crate::test_epoch())
}

fn check_smoother(odp: &Estimator) -> Vec<SmoothedEstimate> {
    let forward = odp.forward_log().unwrap();
    let backward = odp.log();
    assert_eq!(forward.direction(), RunDirection::Forward);
    assert_eq!(backward.direction(), RunDirection::Backward);

    let grid = SmoothingGrid::from_log(forward);
    assert!(
        backward.iter().all(|rec| grid.contains(rec.epoch)),
        "backward run stopped off the forward epochs"
    );

    let smoothed = odp.smoothed().unwrap();
    let mut epochs: Vec<Epoch> = backward.iter().map(|rec| rec.epoch).collect();
    epochs.dedup();
    assert_eq!(smoothed.len(), epochs.len());

    for pair in smoothed.windows(2) {
        assert!(pair[0].epoch < pair[1].epoch, "smoothed estimates out of order");
    }
    for est in &smoothed {
        let fwd = forward.at_epoch(est.epoch).unwrap();
        for i in 0..6 {
            assert!(
                est.covar[(i, i)] <= fwd.covar[(i, i)] * (1.0 + 1e-9),
                "smoothing increased the variance of state {i} @ {}",
                est.epoch
            );
        }
        assert!(seqod::utils::is_symmetric(&est.covar, 1e-12));
    }
    smoothed
}

#[rstest]
fn od_smoother_two_pass(truth: Truth) {
    let tracker = PositionTracker::new(&truth, 20, 1 * Unit::Minute, 0.01).with_noise(3);
    let mut odp = estimator(&truth, tracker, EstimatorConfig::default());
    odp.run_complete().unwrap();
    let fwd_len = odp.log().len();
    let end = odp.estimation_snapshot().unwrap().epoch;
    assert_eq!(end, truth.epoch + 19 * Unit::Minute);

    odp.run_backwards().unwrap();
    assert_eq!(odp.state(), FilterState::Initializing);
    assert_eq!(odp.direction(), RunDirection::Backward);
    odp.run_complete().unwrap();

    assert_eq!(odp.forward_log().unwrap().len(), fwd_len);
    assert_eq!(odp.log().first().unwrap().epoch, end);
    assert_eq!(odp.log().last().unwrap().epoch, truth.epoch);
    assert_eq!(odp.log().measurement_records().count(), 20);
    // The backward run restarts from the a-priori covariance
    assert_eq!(odp.log().first().unwrap().covar_bar[(0, 0)], 1.0);

    let smoothed = check_smoother(&odp);
    assert_eq!(smoothed.len(), 20);
    let first = &smoothed[0];
    let fwd = odp.forward_log().unwrap().at_epoch(first.epoch).unwrap();
    // The start of the arc benefits the most from the later observations
    assert!(first.covar[(3, 3)] < 0.5 * fwd.covar[(3, 3)]);
    for est in &smoothed {
        assert!(position_error(&est.state, &truth, est.epoch) < 0.05);
    }
}

#[rstest]
fn od_smoother_sync_on_forward_epochs(truth: Truth) {
    // Process noise every 45 s while the observations are a minute apart: the backward noise updates
    // must be redirected onto epochs of the forward run.
    let tracker = PositionTracker::new(&truth, 20, 1 * Unit::Minute, 0.01).with_noise(5);
    let config = EstimatorConfig::builder()
        .process_noise_step(45 * Unit::Second)
        .build();
    let mut odp = estimator(&truth, tracker, config);
    odp.run_complete().unwrap();
    odp.run_backwards().unwrap();
    odp.run_complete().unwrap();

    let smoothed = check_smoother(&odp);
    assert!(smoothed.len() > 20);

    // Restart forward from the end of the backward run
    odp.run_forwards().unwrap();
    assert_eq!(odp.direction(), RunDirection::Forward);
    odp.run_complete().unwrap();
    assert_eq!(odp.log().first().unwrap().epoch, truth.epoch);
    assert_eq!(odp.log().measurement_records().count(), 20);
}

#[rstest]
fn od_smoother_missing_observation(truth: Truth) {
    // The object is not visible at ten minutes: neither run has a record there
    let mut tracker = PositionTracker::new(&truth, 20, 1 * Unit::Minute, 0.01).with_noise(3);
    let hidden = tracker.epochs[10];
    tracker.hidden.push(hidden);
    let mut odp = estimator(&truth, tracker, EstimatorConfig::default());
    odp.run_complete().unwrap();
    assert_eq!(odp.log().measurement_records().count(), 19);
    assert!(odp.log().at_epoch(hidden).is_none());

    odp.run_backwards().unwrap();
    odp.run_complete().unwrap();
    assert_eq!(odp.log().measurement_records().count(), 19);
    assert!(odp.log().at_epoch(hidden).is_none());
    assert_eq!(odp.log().last().unwrap().epoch, truth.epoch);

    let smoothed = check_smoother(&odp);
    assert_eq!(smoothed.len(), 19);
    assert!(smoothed.iter().all(|est| est.epoch != hidden));
}
