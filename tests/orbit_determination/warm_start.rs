use super::*;
use approx::assert_relative_eq;
use pretty_env_logger::try_init;
use rstest::*;
use seqod::io::checkpoint::{Checkpoint, RowSelection};
use seqod::od::prelude::*;
use std::path::PathBuf;

#[fixture]
fn truth() -> Truth {
    let _ = try_init();
    Truth::new(crate::test_epoch())
}

fn checkpoint_path(name: &str) -> PathBuf {
    std::env::temp_dir().join(format!("seqod_{name}.csv"))
}

/// Forward run over 20 noisy observations which writes its checkpoint to `path`.
fn forward_run(truth: &Truth, path: &PathBuf) -> Estimator {
    let tracker = PositionTracker::new(truth, 20, 1 * Unit::Minute, 0.01).with_noise(7);
    let config = EstimatorConfig::builder()
        .warm_start_output(path.clone())
        .build();
    let mut odp = estimator(truth, tracker, config);
    odp.run_complete().unwrap();
    odp
}

#[rstest]
fn od_checkpoint_written(truth: Truth) {
    let path = checkpoint_path("checkpoint_written");
    let odp = forward_run(&truth, &path);

    let chk = Checkpoint::from_path(&path).unwrap();
    assert_eq!(chk.records.len(), odp.log().len());
    assert_eq!(chk.state_headers.len(), 6);

    let last = odp.log().last().unwrap();
    let rec = chk.select(RowSelection::Last).unwrap();
    assert_eq!(rec.epoch.to_time_scale(last.epoch.time_scale), last.epoch);
    assert_relative_eq!(
        DVector::from_vec(rec.state.clone()),
        last.state,
        max_relative = 1e-14
    );
    assert_relative_eq!(rec.covar, last.covar, epsilon = 1e-20, max_relative = 1e-14);

    let _ = std::fs::remove_file(&path);
}

#[rstest]
fn od_checkpoint_skips_pending_offset(truth: Truth) {
    let path = checkpoint_path("checkpoint_pending_offset");
    let tracker = PositionTracker::new(&truth, 15, 1 * Unit::Minute, 0.01).with_noise(11);
    let config = EstimatorConfig::builder()
        .delayed_rectification_span(5 * Unit::Minute)
        .warm_start_output(path.clone())
        .build();
    let mut odp = estimator(&truth, tracker, config);
    odp.run_complete().unwrap();

    // The corrections of the first five observations are held as an offset
    let written: Vec<_> = odp.log().iter().filter(|rec| !rec.offset_pending).collect();
    assert_eq!(odp.log().len() - written.len(), 5);

    let chk = Checkpoint::from_path(&path).unwrap();
    assert_eq!(chk.records.len(), written.len());
    for (row, rec) in chk.records.iter().zip(written) {
        assert_eq!(row.epoch.to_time_scale(rec.epoch.time_scale), rec.epoch);
        assert_relative_eq!(
            DVector::from_vec(row.state.clone()),
            rec.state,
            max_relative = 1e-14
        );
    }
    // Only the a-priori record precedes the rectification
    for minutes in 1..5 {
        let epoch = truth.epoch + minutes * Unit::Minute;
        assert!(chk
            .records
            .iter()
            .all(|row| row.epoch.to_time_scale(epoch.time_scale) != epoch));
    }
    let first = chk.select(RowSelection::Earliest).unwrap();
    assert_eq!(first.epoch.to_time_scale(truth.epoch.time_scale), truth.epoch);

    let _ = std::fs::remove_file(&path);
}

#[rstest]
fn od_warm_start_last_record(truth: Truth) {
    let path = checkpoint_path("warm_start_last_record");
    let first = forward_run(&truth, &path);
    let end = first.log().last().unwrap().clone();

    // Every observation is covered by the last record: only a prediction remains
    let tracker = PositionTracker::new(&truth, 20, 1 * Unit::Minute, 0.01).with_noise(7);
    let config = EstimatorConfig::builder()
        .warm_start_input(path.clone())
        .restart_epoch(RestartEpoch::LastWarmStartRecord)
        .predict_span(5 * Unit::Minute)
        .build();
    let mut odp = estimator(&truth, tracker, config);
    odp.run_complete().unwrap();

    let start = odp.log().first().unwrap();
    assert_eq!(start.epoch, end.epoch);
    assert_relative_eq!(start.state, end.state, max_relative = 1e-12);
    assert_relative_eq!(start.covar, end.covar, epsilon = 1e-20, max_relative = 1e-12);
    assert_eq!(odp.log().measurement_counts(), (0, 0));
    assert_eq!(odp.log().last().unwrap().epoch, end.epoch + 5 * Unit::Minute);

    // Without a prediction there is nothing left to do
    let tracker = PositionTracker::new(&truth, 20, 1 * Unit::Minute, 0.01).with_noise(7);
    let config = EstimatorConfig::builder()
        .warm_start_input(path.clone())
        .restart_epoch(RestartEpoch::LastWarmStartRecord)
        .build();
    let mut odp = estimator(&truth, tracker, config);
    let err = odp.run_complete().unwrap_err();
    assert!(matches!(err, ODError::NoMeasurementsRemain { .. }));

    let _ = std::fs::remove_file(&path);
}

#[rstest]
fn od_warm_start_mid_arc(truth: Truth) {
    let path = checkpoint_path("warm_start_mid_arc");
    let first = forward_run(&truth, &path);
    let expected = first.log().last().unwrap().clone();

    // Restart between two observations: the closest record before is the update at nine minutes
    let tracker = PositionTracker::new(&truth, 20, 1 * Unit::Minute, 0.01).with_noise(7);
    let config = EstimatorConfig::builder()
        .warm_start_input(path.clone())
        .restart_epoch(RestartEpoch::Epoch(truth.epoch + 570 * Unit::Second))
        .build();
    let mut odp = estimator(&truth, tracker, config);
    odp.run_complete().unwrap();

    assert_eq!(odp.log().first().unwrap().epoch, truth.epoch + 9 * Unit::Minute);
    assert_eq!(odp.log().measurement_records().count(), 10);
    let last = odp.log().last().unwrap();
    assert_eq!(last.epoch, expected.epoch);
    assert_relative_eq!(last.state, expected.state, max_relative = 1e-9);
    assert_relative_eq!(last.covar, expected.covar, epsilon = 1e-16, max_relative = 1e-9);

    let _ = std::fs::remove_file(&path);
}

#[rstest]
fn od_warm_start_first_measurement(truth: Truth) {
    let path = checkpoint_path("warm_start_first_measurement");
    let first = forward_run(&truth, &path);
    let expected = first.log().last().unwrap().clone();

    // The tracking data now starts at five minutes
    let mut tracker = PositionTracker::new(&truth, 20, 1 * Unit::Minute, 0.01).with_noise(7);
    tracker.epochs.drain(..5);
    tracker.observed.drain(..5);
    let config = EstimatorConfig::builder()
        .warm_start_input(path.clone())
        .build();
    let mut odp = estimator(&truth, tracker, config);
    odp.run_complete().unwrap();

    assert_eq!(odp.log().first().unwrap().epoch, truth.epoch + 4 * Unit::Minute);
    assert_eq!(odp.log().measurement_records().count(), 15);
    let last = odp.log().last().unwrap();
    assert_relative_eq!(last.state, expected.state, max_relative = 1e-9);

    let _ = std::fs::remove_file(&path);
}

#[rstest]
fn od_warm_start_earliest_record(truth: Truth) {
    let path = checkpoint_path("warm_start_earliest_record");
    let first = forward_run(&truth, &path);
    let apriori = first.log().first().unwrap().clone();

    let tracker = PositionTracker::new(&truth, 20, 1 * Unit::Minute, 0.01).with_noise(7);
    let config = EstimatorConfig::builder()
        .warm_start_input(path.clone())
        .restart_epoch(RestartEpoch::EarliestRecord)
        .build();
    let mut odp = estimator(&truth, tracker, config);
    odp.run_complete().unwrap();

    // The a-priori record comes first in the file, and observations at its epoch are skipped
    let start = odp.log().first().unwrap();
    assert_eq!(start.epoch, truth.epoch);
    assert_relative_eq!(start.state, apriori.state, max_relative = 1e-12);
    assert_relative_eq!(start.covar, apriori.covar, epsilon = 1e-20, max_relative = 1e-12);
    assert_eq!(odp.log().measurement_records().count(), 19);

    let _ = std::fs::remove_file(&path);
}

#[rstest]
fn od_warm_start_errors(truth: Truth) {
    let path = checkpoint_path("warm_start_errors");
    forward_run(&truth, &path);

    // No record at that exact epoch
    let tracker = PositionTracker::new(&truth, 20, 1 * Unit::Minute, 0.01);
    let config = EstimatorConfig::builder()
        .warm_start_input(path.clone())
        .restart_epoch(RestartEpoch::ExactEpoch(truth.epoch + 30 * Unit::Second))
        .build();
    let mut odp = estimator(&truth, tracker, config);
    let err = odp.run_complete().unwrap_err();
    assert!(matches!(err, ODError::ODCheckpointError { .. }));
    assert_eq!(err.category(), ErrorCategory::DataConsistency);

    // Missing file
    let tracker = PositionTracker::new(&truth, 20, 1 * Unit::Minute, 0.01);
    let config = EstimatorConfig::builder()
        .warm_start_input(checkpoint_path("does_not_exist"))
        .build();
    let mut odp = estimator(&truth, tracker, config);
    let err = odp.run_complete().unwrap_err();
    assert_eq!(err.category(), ErrorCategory::Io);

    let _ = std::fs::remove_file(&path);
}
