//! Resync loop: state evaluation, presence and loaded-sample reconciliation,
//! telemetry signals.

mod common;

use std::time::Duration;

use tracing_test::traced_test;

use sc_core::capabilities::channels;
use sc_core::events::ChangerEvent;
use sc_core::model::Geometry;
use sc_core::state::SampleChangerState;
use sc_driver_mock::{ErrorConfig, ErrorScenario, MockProfile, MockSampleChanger};
use sc_hardware::{spawn_resync, DriverKind};

use common::{assert_consistent, attach, config, drain, gated_pucks, pucks, rig};

#[tokio::test]
async fn sensor_without_loaded_sample_is_unknown() {
    let (mock, changer) = pucks(1).await;
    assert_eq!(changer.state(), SampleChangerState::Ready);

    mock.set_sample_detected(Some(true));
    let report = changer.resync().await;

    assert_eq!(
        report.state,
        Some((SampleChangerState::Ready, SampleChangerState::Unknown))
    );
    assert_eq!(changer.state(), SampleChangerState::Unknown);

    mock.set_sample_detected(None);
    changer.resync().await;
    assert_eq!(changer.state(), SampleChangerState::Ready);
}

#[tokio::test]
async fn idle_device_produces_no_events() {
    let (_mock, changer) = pucks(2).await;
    let mut rx = changer.subscribe();

    for _ in 0..3 {
        let report = changer.resync().await;
        assert!(!report.has_changes(), "{report:?}");
        assert!(report.errors.is_empty());
    }
    assert!(drain(&mut rx).is_empty());
}

#[tokio::test]
async fn first_resync_publishes_telemetry() {
    let mock = MockSampleChanger::new(Geometry::unipucks(1)).unwrap();
    let changer = attach(&mock, config(DriverKind::Generic, Geometry::unipucks(1)));

    let report = changer.resync().await;

    assert!(report.telemetry.contains(&ChangerEvent::PowerStateChanged { powered: true }));
    assert!(report
        .telemetry
        .contains(&ChangerEvent::RegulationStateChanged { regulating: true }));
    assert!(report
        .telemetry
        .contains(&ChangerEvent::LidStateChanged { lid: 2, open: false }));
}

#[tokio::test]
async fn presence_flips_are_reported() {
    let (mock, changer) = pucks(3).await;
    let mut rx = changer.subscribe();

    mock.set_basket_present(2, false);
    let report = changer.resync().await;

    assert_eq!(report.presence, vec![("2".to_string(), false)]);
    assert_eq!(
        drain(&mut rx),
        vec![ChangerEvent::PresenceChanged {
            address: "2".into(),
            present: false,
        }]
    );
    changer.with_model(|m| {
        let sample = m.get(m.by_address("2:01").unwrap()).unwrap();
        assert!(!sample.present);
    });

    mock.set_basket_present(2, true);
    let report = changer.resync().await;
    assert_eq!(report.presence, vec![("2".to_string(), true)]);
    assert_consistent(&changer);
}

#[tokio::test]
async fn loaded_sample_follows_the_device() {
    let (mock, changer) = pucks(2).await;
    let mut rx = changer.subscribe();

    mock.set_mounted(Some("1:03")).unwrap();
    let report = changer.resync().await;

    assert_eq!(report.loaded, Some((None, Some("1:03".to_string()))));
    assert_eq!(changer.loaded_sample_address().as_deref(), Some("1:03"));
    assert_eq!(changer.state(), SampleChangerState::Ready);
    assert!(drain(&mut rx).contains(&ChangerEvent::LoadedSampleChanged {
        address: Some("1:03".into())
    }));

    // Swapped by hand: old sample leaves first.
    mock.set_mounted(Some("2:07")).unwrap();
    let report = changer.resync().await;
    assert_eq!(
        report.loaded,
        Some((Some("1:03".to_string()), Some("2:07".to_string())))
    );

    mock.set_mounted(None).unwrap();
    changer.resync().await;
    assert_eq!(changer.loaded_sample(), None);
    changer.with_model(|m| {
        assert!(m.get(m.by_address("2:07").unwrap()).unwrap().has_been_loaded());
    });
    assert_consistent(&changer);
}

#[tokio::test]
async fn zero_based_mounted_numbers() {
    let (mock, changer) = rig(DriverKind::Grob, MockProfile::grob(), Geometry::unipucks(3)).await;
    assert_eq!(changer.state(), SampleChangerState::Ready);

    mock.set_mounted(Some("2:05")).unwrap();
    changer.resync().await;

    assert_eq!(changer.loaded_sample_address().as_deref(), Some("2:05"));
}

#[tokio::test]
async fn bitmask_presence_with_mounted_puck() {
    let (mock, changer) = rig(DriverKind::Marvin, MockProfile::marvin(), Geometry::unipucks(2)).await;
    assert_eq!(changer.state(), SampleChangerState::Ready);

    mock.set_presence(&[false, true]);
    let report = changer.resync().await;
    assert_eq!(report.presence, vec![("1".to_string(), false)]);

    // The puck holding the mounted sample counts as present.
    mock.set_mounted(Some("1:03")).unwrap();
    let report = changer.resync().await;
    assert_eq!(report.presence, vec![("1".to_string(), true)]);
    assert_eq!(changer.loaded_sample_address().as_deref(), Some("1:03"));
    assert_consistent(&changer);
}

#[tokio::test]
#[traced_test]
async fn lost_state_channel_means_unknown() {
    let mock = MockSampleChanger::builder(Geometry::unipucks(1))
        .error_config(ErrorConfig::scenario(ErrorScenario::FailAfterN {
            operation: channels::STATE.into(),
            count: 1,
        }))
        .build()
        .unwrap();
    let changer = attach(&mock, config(DriverKind::Generic, Geometry::unipucks(1)));
    changer.resync().await;
    assert_eq!(changer.state(), SampleChangerState::Ready);

    let report = changer.resync().await;

    assert_eq!(report.errors.len(), 1, "{report:?}");
    assert_eq!(
        report.state,
        Some((SampleChangerState::Ready, SampleChangerState::Unknown))
    );
    assert!(logs_contain("raw state read failed"));
}

#[tokio::test]
async fn communication_loss_never_aborts_a_tick() {
    let mock = MockSampleChanger::builder(Geometry::unipucks(2))
        .error_config(ErrorConfig::scenario(ErrorScenario::CommunicationLoss))
        .build()
        .unwrap();
    let changer = attach(&mock, config(DriverKind::Generic, Geometry::unipucks(2)));

    let report = changer.resync().await;

    assert!(report.errors.len() > 1, "{report:?}");
    assert!(report.presence.is_empty());
    assert_eq!(report.loaded, None);
    assert_eq!(changer.state(), SampleChangerState::Unknown);
}

#[tokio::test]
async fn replay_telemetry_re_emits_known_values() {
    let (_mock, changer) = pucks(1).await;
    let mut rx = changer.subscribe();

    let replayed = changer.replay_telemetry();

    assert!(replayed.contains(&ChangerEvent::PowerStateChanged { powered: true }));
    assert!(replayed.contains(&ChangerEvent::LidStateChanged { lid: 1, open: false }));
    assert_eq!(drain(&mut rx), replayed);
}

#[tokio::test(start_paused = true)]
async fn background_loop_picks_up_device_changes() {
    let (mock, changer) = pucks(2).await;
    let mut rx = changer.subscribe();
    let handle = spawn_resync(changer.clone());

    mock.set_basket_present(1, false);
    let event = tokio::time::timeout(Duration::from_secs(1), async {
        loop {
            if let Ok(event @ ChangerEvent::PresenceChanged { .. }) = rx.recv().await {
                return event;
            }
        }
    })
    .await
    .unwrap();

    assert_eq!(
        event,
        ChangerEvent::PresenceChanged {
            address: "1".into(),
            present: false,
        }
    );
    handle.shutdown().await;
}

#[tokio::test]
async fn load_during_a_tick_is_not_undone() {
    let (mock, gate, changer) = gated_pucks(2, channels::MOUNTED_SAMPLE).await;
    let mut rx = changer.subscribe();

    gate.arm();
    let tick = tokio::spawn({
        let changer = changer.clone();
        async move { changer.resync().await }
    });
    gate.reached.notified().await;

    changer.load(Some("1:01".into())).await.unwrap();
    assert_eq!(changer.loaded_sample_address().as_deref(), Some("1:01"));

    gate.release.notify_one();
    let report = tick.await.unwrap();

    assert_eq!(report.loaded, None);
    assert_eq!(changer.loaded_sample_address(), mock.mounted());
    assert_eq!(changer.state(), SampleChangerState::Ready);
    assert!(!drain(&mut rx).contains(&ChangerEvent::LoadedSampleChanged { address: None }));
    assert_consistent(&changer);

    // The next tick reads after the load and agrees with it.
    let report = changer.resync().await;
    assert!(!report.has_changes(), "{report:?}");
}
