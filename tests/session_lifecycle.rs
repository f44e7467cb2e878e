//! End-to-end session behaviour against the simulated radio.

use ble_central::native::SimPeripheral;
use ble_central::uuids::*;
use ble_central::{
    Command, CommandOutput, ConnectionState, Error, Event, EventKind, Property,
    SessionConfig, SessionManager, SimulatedStack,
};
use futures::FutureExt;
use pretty_assertions::assert_eq;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

const SIM: &str = "5C:31:3E:00:00:01";

fn session() -> (SessionManager, Arc<SimulatedStack>) {
    let sim = Arc::new(SimulatedStack::new(vec![SimPeripheral::ble_plugin_sim(SIM)]));
    let manager = SessionManager::with_stack(sim.clone(), SessionConfig::default());
    (manager, sim)
}

async fn next_event(rx: &mut broadcast::Receiver<Event>, kind: EventKind) -> Event {
    tokio::time::timeout(Duration::from_secs(1), async {
        loop {
            let event = rx.recv().await.expect("event stream closed");
            if event.kind() == kind {
                return event;
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

async fn wait_for_held(sim: &SimulatedStack, count: usize) {
    tokio::time::timeout(Duration::from_secs(1), async {
        while sim.held_count() < count {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    })
    .await
    .expect("dispatch never reached the radio");
}

#[tokio::test]
async fn test_adapter_support_and_power_events() {
    let (manager, sim) = session();
    let mut rx = manager.subscribe();

    assert!(manager.is_supported().await);
    assert!(manager.adapter_state().await.unwrap().enabled);

    sim.set_powered(false);
    match next_event(&mut rx, EventKind::AdapterStateChanged).await {
        Event::AdapterStateChanged(state) => assert!(!state.enabled),
        other => panic!("unexpected event: {:?}", other),
    }
}

#[tokio::test]
async fn test_discovery_reports_simulator() {
    let (manager, _) = session();
    let mut rx = manager.subscribe();

    manager.start_discovery().await.unwrap();
    assert!(manager.adapter_state().await.unwrap().discovering);

    match next_event(&mut rx, EventKind::DeviceAdded).await {
        Event::DeviceAdded(device) => {
            assert_eq!(device.address, SIM);
            assert!(device.uuids.contains(&TEST_SERVICE_UUID));
        }
        other => panic!("unexpected event: {:?}", other),
    }

    manager.stop_discovery().await.unwrap();
    assert_eq!(manager.device(SIM).unwrap().name.as_deref(), Some("BlePluginSim"));
}

#[tokio::test]
async fn test_connect_browse_and_disconnect() {
    let (manager, _) = session();

    assert!(!manager.is_connected(SIM));
    manager.connect(SIM).await.unwrap();
    assert!(manager.is_connected(SIM));
    assert_eq!(manager.device(SIM).unwrap().state, ConnectionState::Connected);

    let services = manager.services(SIM).await.unwrap();
    let uuids: Vec<_> = services.iter().map(|s| s.uuid).collect();
    assert!(uuids.contains(&HEART_RATE_SERVICE_UUID));
    assert!(uuids.contains(&TEST_SERVICE_UUID));

    let service = manager.service(SIM, TEST_SERVICE_UUID).await.unwrap();
    assert_eq!(service.device_address, SIM);

    let characteristics = manager.characteristics(SIM, TEST_SERVICE_UUID).await.unwrap();
    assert_eq!(characteristics.len(), 2);

    let write = manager
        .characteristic(SIM, TEST_SERVICE_UUID, TEST_WRITE_UUID)
        .await
        .unwrap();
    assert!(write.has_property(Property::Write));

    assert_eq!(
        manager
            .characteristic(SIM, TEST_SERVICE_UUID, short_uuid(0xfff9))
            .await
            .unwrap_err(),
        Error::CharacteristicNotFound {
            uuid: "fff9".to_string()
        }
    );

    manager.disconnect(SIM).await.unwrap();
    assert!(!manager.is_connected(SIM));
    assert_eq!(manager.services(SIM).await.unwrap_err(), Error::NotConnected);
}

#[tokio::test]
async fn test_write_then_read_round_trip() {
    let (manager, _) = session();
    manager.connect(SIM).await.unwrap();

    let cases = [
        (TEST_WRITE_UUID, true, vec![0x42]),
        (TEST_WRITE_UUID, true, vec![1, 2, 3]),
        (TEST_WRITE_NO_RESPONSE_UUID, false, vec![0x09]),
        (TEST_WRITE_NO_RESPONSE_UUID, false, vec![7, 8]),
    ];

    for (characteristic, with_response, value) in cases {
        manager
            .write_characteristic_value(SIM, TEST_SERVICE_UUID, characteristic, value.clone(), with_response)
            .await
            .unwrap();
        assert_eq!(
            manager
                .read_characteristic_value(SIM, TEST_SERVICE_UUID, characteristic)
                .await
                .unwrap(),
            value
        );
    }
}

#[tokio::test]
async fn test_notifications_reach_listeners() {
    let (manager, sim) = session();
    manager.connect(SIM).await.unwrap();
    manager
        .characteristics(SIM, HEART_RATE_SERVICE_UUID)
        .await
        .unwrap();

    let (tx, mut values) = tokio::sync::mpsc::unbounded_channel();
    manager.on(EventKind::CharacteristicValueChanged, move |event| {
        if let Event::CharacteristicValueChanged { characteristic, .. } = event {
            let _ = tx.send(characteristic.clone());
        }
    });

    manager
        .start_characteristic_notifications(SIM, HEART_RATE_SERVICE_UUID, HEART_RATE_MEASUREMENT_UUID)
        .await
        .unwrap();
    assert!(sim.notify(SIM, HEART_RATE_SERVICE_UUID, HEART_RATE_MEASUREMENT_UUID, vec![0, 72]));

    let characteristic = tokio::time::timeout(Duration::from_secs(1), values.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(characteristic.uuid, HEART_RATE_MEASUREMENT_UUID);
    assert_eq!(characteristic.value, vec![0, 72]);
    assert!(characteristic.has_property(Property::Notify));

    manager
        .stop_characteristic_notifications(SIM, HEART_RATE_SERVICE_UUID, HEART_RATE_MEASUREMENT_UUID)
        .await
        .unwrap();
    assert!(!sim.notify(SIM, HEART_RATE_SERVICE_UUID, HEART_RATE_MEASUREMENT_UUID, vec![0, 73]));
}

#[tokio::test]
async fn test_disconnect_cancels_flood_before_returning() {
    let (manager, sim) = session();
    manager.connect(SIM).await.unwrap();
    sim.set_hold_dispatches(true);

    let handles: Vec<_> = (0..10)
        .map(|_| {
            manager
                .submit(SIM, Command::read(TEST_SERVICE_UUID, TEST_WRITE_UUID))
                .unwrap()
        })
        .collect();
    wait_for_held(&sim, 1).await;

    manager.disconnect(SIM).await.unwrap();

    for handle in handles {
        assert_eq!(handle.now_or_never(), Some(Err(Error::Cancelled)));
    }
    assert_eq!(sim.held_count(), 0);
}

#[tokio::test]
async fn test_reconnect_starts_clean_generation() {
    let (manager, sim) = session();
    manager.connect(SIM).await.unwrap();
    sim.set_hold_dispatches(true);

    let stale = manager
        .submit(SIM, Command::read(TEST_SERVICE_UUID, TEST_WRITE_UUID))
        .unwrap();
    wait_for_held(&sim, 1).await;
    manager.disconnect(SIM).await.unwrap();
    assert_eq!(stale.await, Err(Error::Cancelled));

    sim.set_hold_dispatches(false);
    manager.connect(SIM).await.unwrap();

    let characteristic = manager
        .characteristic(SIM, TEST_SERVICE_UUID, TEST_WRITE_UUID)
        .await
        .unwrap();
    assert_eq!(characteristic.uuid, TEST_WRITE_UUID);
    assert_eq!(
        manager
            .read_characteristic_value(SIM, TEST_SERVICE_UUID, TEST_WRITE_UUID)
            .await
            .unwrap(),
        vec![0]
    );
}

#[tokio::test]
async fn test_concurrent_disconnects_share_one_teardown() {
    let (manager, sim) = session();
    manager.connect(SIM).await.unwrap();
    sim.set_disconnect_delay(Duration::from_millis(50));

    let (first, second) = tokio::join!(manager.disconnect(SIM), manager.disconnect(SIM));
    assert_eq!(first, Ok(()));
    assert_eq!(second, Ok(()));
    assert_eq!(sim.native_disconnects(), 1);

    // Already disconnected: nothing to do.
    manager.disconnect(SIM).await.unwrap();
    assert_eq!(sim.native_disconnects(), 1);
}

#[tokio::test]
async fn test_one_command_in_flight_in_fifo_order() {
    let (manager, sim) = session();
    manager.connect(SIM).await.unwrap();
    sim.set_hold_dispatches(true);

    let commands = vec![
        Command::read(TEST_SERVICE_UUID, TEST_WRITE_UUID),
        Command::write(TEST_SERVICE_UUID, TEST_WRITE_UUID, vec![5], true),
        Command::discover_services(),
        Command::read(TEST_SERVICE_UUID, TEST_WRITE_UUID),
        Command::discover_characteristics(HEART_RATE_SERVICE_UUID),
    ];
    let expected: Vec<_> = commands.iter().map(|c| (SIM.to_string(), c.kind)).collect();

    let handles: Vec<_> = commands
        .into_iter()
        .map(|c| manager.submit(SIM, c).unwrap())
        .collect();

    for _ in 0..expected.len() {
        wait_for_held(&sim, 1).await;
        assert_eq!(sim.held_count(), 1);
        assert!(sim.release_next());
    }

    let outcomes = futures::future::join_all(handles).await;
    assert_eq!(outcomes[0], Ok(CommandOutput::Value(vec![0])));
    assert_eq!(outcomes[1], Ok(CommandOutput::Done));
    assert_eq!(outcomes[3], Ok(CommandOutput::Value(vec![5])));
    assert!(outcomes.iter().all(Result::is_ok));

    assert_eq!(sim.dispatch_log(), expected);
    assert_eq!(sim.max_in_flight(), 1);
}

#[tokio::test]
async fn test_failed_connect_then_retry() {
    let (manager, sim) = session();
    sim.fail_next_connect();

    assert!(matches!(
        manager.connect(SIM).await,
        Err(Error::ConnectionFailed { .. })
    ));
    assert_eq!(manager.connection_state(SIM), ConnectionState::Disconnected);

    manager.connect(SIM).await.unwrap();
    assert!(manager.is_connected(SIM));
    assert_eq!(sim.native_connects(), 2);
}

#[tokio::test]
async fn test_link_loss_cancels_and_notifies() {
    let (manager, sim) = session();
    let mut rx = manager.subscribe();
    manager.connect(SIM).await.unwrap();
    sim.set_hold_dispatches(true);

    let pending = manager.submit(SIM, Command::discover_services()).unwrap();
    wait_for_held(&sim, 1).await;
    sim.drop_link(SIM);

    match next_event(&mut rx, EventKind::DeviceDisconnected).await {
        Event::DeviceDisconnected { address } => assert_eq!(address, SIM),
        other => panic!("unexpected event: {:?}", other),
    }
    // Either the drain or the radio's own failure resolves it first.
    assert!(pending.await.is_err());
    assert!(!manager.is_connected(SIM));
    assert_eq!(manager.submit(SIM, Command::discover_services()).unwrap_err(), Error::NotConnected);
}

#[tokio::test]
async fn test_late_disconnect_report_spares_new_connection() {
    let (manager, sim) = session();
    sim.set_disconnect_echo(Some(Duration::from_millis(10)));

    manager.connect(SIM).await.unwrap();
    manager.disconnect(SIM).await.unwrap();
    manager.connect(SIM).await.unwrap();

    tokio::time::sleep(Duration::from_millis(50)).await;

    assert!(manager.is_connected(SIM));
    let characteristic = manager
        .characteristic(SIM, TEST_SERVICE_UUID, TEST_WRITE_UUID)
        .await
        .unwrap();
    assert_eq!(characteristic.uuid, TEST_WRITE_UUID);
}

#[tokio::test]
async fn test_real_link_loss_still_reported_with_echoes_enabled() {
    let (manager, sim) = session();
    let mut rx = manager.subscribe();
    sim.set_disconnect_echo(Some(Duration::from_millis(1)));

    manager.connect(SIM).await.unwrap();
    sim.drop_link(SIM);

    match next_event(&mut rx, EventKind::DeviceDisconnected).await {
        Event::DeviceDisconnected { address } => assert_eq!(address, SIM),
        other => panic!("unexpected event: {:?}", other),
    }
    assert!(!manager.is_connected(SIM));
}

#[tokio::test]
async fn test_disconnect_while_retrying_stops_attempts() {
    let sim = Arc::new(SimulatedStack::new(vec![SimPeripheral::ble_plugin_sim(SIM)]));
    let config = SessionConfig::default()
        .with_connect_attempts(3)
        .with_reconnect_delay(Duration::from_millis(30));
    let manager = SessionManager::with_stack(sim.clone(), config);
    sim.fail_next_connect();

    let (connected, disconnected) = tokio::join!(manager.connect(SIM), async {
        while sim.native_connects() < 1 {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        manager.disconnect(SIM).await
    });

    assert!(matches!(connected, Err(Error::ConnectionFailed { .. })));
    assert_eq!(disconnected, Ok(()));

    tokio::time::sleep(Duration::from_millis(60)).await;
    assert_eq!(sim.native_connects(), 1);
    assert_eq!(sim.native_disconnects(), 1);
    assert_eq!(manager.connection_state(SIM), ConnectionState::Disconnected);
}

#[tokio::test]
async fn test_calls_during_disconnecting() {
    let (manager, sim) = session();
    manager.connect(SIM).await.unwrap();
    sim.set_disconnect_delay(Duration::from_millis(50));

    let (disconnected, ()) = tokio::join!(manager.disconnect(SIM), async {
        while manager.connection_state(SIM) != ConnectionState::Disconnecting {
            tokio::task::yield_now().await;
        }

        assert!(!manager.is_connected(SIM));
        assert_eq!(manager.connect(SIM).await, Err(Error::InProgress));

        let late = manager.submit(SIM, Command::discover_services()).unwrap();
        assert_eq!(late.await, Err(Error::Cancelled));
    });

    assert_eq!(disconnected, Ok(()));
    assert_eq!(manager.connection_state(SIM), ConnectionState::Disconnected);
}

#[tokio::test]
async fn test_disconnect_during_connecting_fails_connect() {
    let (manager, sim) = session();
    sim.set_connect_delay(Duration::from_millis(50));

    let (connected, disconnected) = tokio::join!(manager.connect(SIM), async {
        while manager.connection_state(SIM) != ConnectionState::Connecting {
            tokio::task::yield_now().await;
        }
        let queued = manager.submit(SIM, Command::discover_services()).unwrap();
        let outcome = manager.disconnect(SIM).await;
        assert_eq!(queued.await, Err(Error::Cancelled));
        outcome
    });

    assert!(matches!(connected, Err(Error::ConnectionFailed { .. })));
    assert_eq!(disconnected, Ok(()));
    assert!(!manager.is_connected(SIM));
}
