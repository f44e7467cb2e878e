//! Full session against the in-memory radio: no hardware needed
//!
//! Run with: cargo run --example simulated_session

use ble_central::native::SimPeripheral;
use ble_central::uuids::{
    short_uuid, HEART_RATE_SERVICE_UUID, TEST_SERVICE_UUID, TEST_WRITE_UUID,
};
use ble_central::{Command, Event, EventKind, Result, SessionConfig, SessionManager, SimulatedStack};
use std::sync::Arc;

const ADDRESS: &str = "5C:31:3E:00:00:01";

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt().with_env_filter("ble_central=info").init();

    let sim = Arc::new(SimulatedStack::new(vec![SimPeripheral::ble_plugin_sim(ADDRESS)]));
    let manager = SessionManager::with_stack(sim.clone(), SessionConfig::default());

    manager.on(EventKind::DeviceDisconnected, |event| {
        if let Event::DeviceDisconnected { address } = event {
            println!("Link to {} dropped", address);
        }
    });

    println!("Supported: {}", manager.is_supported().await);
    manager.start_discovery().await?;
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    manager.stop_discovery().await?;

    for device in manager.devices() {
        println!("Found {} ({:?})", device.address, device.name);
    }

    manager.connect(ADDRESS).await?;
    println!("Connected: {}", manager.is_connected(ADDRESS));

    for service in manager.services(ADDRESS).await? {
        println!("Service {}", service.uuid);
        for characteristic in manager.characteristics(ADDRESS, service.uuid).await? {
            println!(
                "  Characteristic {} [{}]",
                characteristic.uuid,
                characteristic.property_names().join(", ")
            );
        }
    }

    manager
        .write_characteristic_value(ADDRESS, TEST_SERVICE_UUID, TEST_WRITE_UUID, vec![0x2a], true)
        .await?;
    let value = manager
        .read_characteristic_value(ADDRESS, TEST_SERVICE_UUID, TEST_WRITE_UUID)
        .await?;
    println!("Read back {:02x?}", value);

    // Queue a burst without waiting, then disconnect: whatever has not run
    // yet comes back cancelled.
    let pending: Vec<_> = (0..10)
        .map(|_| manager.submit(ADDRESS, Command::read(TEST_SERVICE_UUID, TEST_WRITE_UUID)))
        .collect::<Result<_>>()?;
    manager.disconnect(ADDRESS).await?;

    for (i, handle) in pending.into_iter().enumerate() {
        match handle.await {
            Ok(_) => println!("Command {} completed", i),
            Err(e) => println!("Command {} ended: {}", i, e),
        }
    }

    // Unknown services are reported, not fatal.
    manager.connect(ADDRESS).await?;
    if let Err(e) = manager.service(ADDRESS, short_uuid(0x1234)).await {
        println!("Lookup failed as expected: {}", e);
    }
    let heart_rate = manager.service(ADDRESS, HEART_RATE_SERVICE_UUID).await?;
    println!("Heart rate service: {}", heart_rate.instance_id);

    manager.shutdown().await?;
    println!("Done!");

    Ok(())
}
