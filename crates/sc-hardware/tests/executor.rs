//! Task executor deadlines, exclusivity, abort and fault reporting.

mod common;

use std::time::Duration;

use sc_core::capabilities::commands;
use sc_core::error::ScError;
use sc_core::model::Geometry;
use sc_core::state::{SampleChangerState, TaskKind};
use sc_driver_mock::{ErrorConfig, ErrorScenario, MockMode, MockSampleChanger, TimingConfig};
use sc_hardware::{DriverKind, TimingSettings};

use common::{attach, config, pucks};

fn mock_with(scenario: ErrorScenario) -> MockSampleChanger {
    MockSampleChanger::builder(Geometry::unipucks(2))
        .error_config(ErrorConfig::scenario(scenario))
        .build()
        .unwrap()
}

fn stuck_load() -> ErrorScenario {
    ErrorScenario::StuckPath {
        command: commands::LOAD.into(),
    }
}

/// Poll `f` every millisecond of (paused) time until it holds.
async fn until(mut f: impl FnMut() -> bool) {
    for _ in 0..10_000 {
        if f() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    panic!("condition never became true");
}

#[tokio::test(start_paused = true)]
async fn stuck_path_times_out_within_deadline() {
    let mock = mock_with(stuck_load());
    let changer = attach(&mock, config(DriverKind::Generic, Geometry::unipucks(2)));
    changer.resync().await;
    let timing = TimingSettings::fast();

    let started = tokio::time::Instant::now();
    let err = changer.load(Some("1:01".into())).await.unwrap_err();
    let elapsed = started.elapsed();

    match err {
        ScError::DeviceTimeout { ref phase, timeout } => {
            assert_eq!(phase, "load");
            assert_eq!(timeout, timing.action_timeout);
        }
        other => panic!("unexpected {other:?}"),
    }
    assert!(err.is_device_fault());
    assert!(elapsed >= timing.action_timeout, "{elapsed:?}");
    assert!(
        elapsed <= timing.action_timeout + timing.settle_delay + timing.poll_interval,
        "{elapsed:?}"
    );

    // Nothing was assumed about the outcome.
    assert_eq!(changer.loaded_sample(), None);
    assert_eq!(changer.in_flight(), None);
    assert_eq!(changer.state(), SampleChangerState::Moving);
}

#[tokio::test(start_paused = true)]
async fn device_never_ready_times_out_before_dispatch() {
    let (mock, changer) = pucks(1).await;
    mock.set_raw_state("ALARM");
    changer.resync().await;
    assert_eq!(changer.state(), SampleChangerState::Alarm);

    let err = changer.load(Some("1:01".into())).await.unwrap_err();

    assert!(
        matches!(err, ScError::DeviceTimeout { ref phase, .. } if phase == "ready"),
        "{err:?}"
    );
    assert!(mock.dispatched().is_empty());
}

#[tokio::test(start_paused = true)]
async fn unmapped_raw_state_blocks_loads() {
    let (mock, changer) = pucks(1).await;
    mock.set_raw_state("INIT");
    changer.resync().await;
    assert_eq!(changer.state(), SampleChangerState::Unknown);

    let err = changer.load(Some("1:01".into())).await.unwrap_err();
    assert!(matches!(err, ScError::DeviceTimeout { .. }), "{err:?}");
    assert!(mock.dispatched().is_empty());
}

#[tokio::test(start_paused = true)]
async fn second_action_is_rejected_while_busy() {
    let mock = mock_with(stuck_load());
    let changer = attach(&mock, config(DriverKind::Generic, Geometry::unipucks(2)));
    changer.resync().await;

    let task = tokio::spawn({
        let changer = changer.clone();
        async move { changer.load(Some("1:01".into())).await }
    });
    until(|| mock.path_running()).await;
    assert_eq!(changer.in_flight(), Some(TaskKind::Load));
    assert_eq!(changer.state(), SampleChangerState::Loading);

    let err = changer.scan("2", false).await.unwrap_err();
    assert!(
        matches!(err, ScError::Busy { in_flight: TaskKind::Load }),
        "{err:?}"
    );
    let err = changer.load(Some("2:01".into())).await.unwrap_err();
    assert!(matches!(err, ScError::Busy { .. }), "{err:?}");
    assert_eq!(mock.dispatched_names(), vec!["load"]);

    changer.abort().await.unwrap();
    let result = task.await.unwrap();
    assert!(matches!(result, Err(ScError::Aborted(ref c)) if c == "load"), "{result:?}");
    assert_eq!(changer.in_flight(), None);
    assert_eq!(changer.loaded_sample(), None);
    assert_eq!(changer.state(), SampleChangerState::Ready);
}

#[tokio::test(start_paused = true)]
async fn abort_realistic_trajectory() {
    let mock = MockSampleChanger::builder(Geometry::unipucks(1))
        .mode(MockMode::Realistic)
        .timing(TimingConfig::robot())
        .build()
        .unwrap();
    let mut cfg = config(DriverKind::Generic, Geometry::unipucks(1));
    cfg.timing.action_timeout = Duration::from_secs(10);
    let changer = attach(&mock, cfg);
    changer.resync().await;

    let task = tokio::spawn({
        let changer = changer.clone();
        async move { changer.load(Some("1:03".into())).await }
    });
    until(|| mock.path_running()).await;
    tokio::time::sleep(Duration::from_millis(300)).await;
    changer.abort().await.unwrap();

    let result = task.await.unwrap();
    assert!(matches!(result, Err(ScError::Aborted(_))), "{result:?}");
    assert_eq!(mock.mounted(), None);
    assert_eq!(changer.loaded_sample(), None);
}

#[tokio::test(start_paused = true)]
async fn realistic_load_waits_for_the_trajectory() {
    let mock = MockSampleChanger::builder(Geometry::unipucks(1))
        .mode(MockMode::Realistic)
        .timing(TimingConfig::robot())
        .build()
        .unwrap();
    let mut cfg = config(DriverKind::Generic, Geometry::unipucks(1));
    cfg.timing.action_timeout = Duration::from_secs(10);
    let changer = attach(&mock, cfg);
    changer.resync().await;

    let started = tokio::time::Instant::now();
    changer.load(Some("1:03".into())).await.unwrap();

    assert!(started.elapsed() >= TimingConfig::robot().transfer());
    assert_eq!(changer.loaded_sample_address().as_deref(), Some("1:03"));
    assert_eq!(changer.state(), SampleChangerState::Ready);
}

#[tokio::test]
async fn abort_without_command_is_unsupported() {
    let mock = MockSampleChanger::new(Geometry::unipucks(1)).unwrap();
    let mut cfg = config(DriverKind::Generic, Geometry::unipucks(1));
    cfg.commands.abort = None;
    let changer = attach(&mock, cfg);

    let err = changer.abort().await.unwrap_err();
    assert!(matches!(err, ScError::Unsupported(_)), "{err:?}");
    assert!(mock.dispatched().is_empty());
}

#[tokio::test]
async fn device_fault_becomes_action_failed() {
    let mock = mock_with(ErrorScenario::FailCommand {
        command: commands::LOAD.into(),
        message: "gripper collision".into(),
    });
    let changer = attach(&mock, config(DriverKind::Generic, Geometry::unipucks(2)));
    changer.resync().await;

    let err = changer.load(Some("2:02".into())).await.unwrap_err();

    match err {
        ScError::ActionFailed { command, message } => {
            assert_eq!(command, "load");
            assert_eq!(message, "gripper collision");
        }
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(changer.loaded_sample(), None);
    assert_eq!(changer.state(), SampleChangerState::Fault);
}

#[tokio::test]
async fn dispatch_failure_is_a_communication_error() {
    let mock = mock_with(ErrorScenario::FailAfterN {
        operation: commands::LOAD.into(),
        count: 0,
    });
    let changer = attach(&mock, config(DriverKind::Generic, Geometry::unipucks(2)));
    changer.resync().await;

    let err = changer.load(Some("1:01".into())).await.unwrap_err();

    assert!(
        matches!(err, ScError::Communication { ref target, .. } if target == "load"),
        "{err:?}"
    );
    assert_eq!(changer.in_flight(), None);
    assert_eq!(changer.loaded_sample(), None);
}
