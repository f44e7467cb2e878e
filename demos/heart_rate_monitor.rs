//! Stream heart rate notifications from the nearest monitor
//!
//! Run with: cargo run --example heart_rate_monitor

use ble_central::uuids::{HEART_RATE_MEASUREMENT_UUID, HEART_RATE_SERVICE_UUID};
use ble_central::{Error, Event, Result, SessionManager};
use std::time::Duration;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging (minimal)
    tracing_subscriber::fmt().with_env_filter("warn").init();

    println!("Heart Rate Monitor");
    println!("==================\n");
    println!("Looking for heart rate sensors...\n");

    let manager = SessionManager::new().await?;
    manager.start_discovery().await?;

    tokio::time::sleep(Duration::from_secs(5)).await;
    manager.stop_discovery().await?;

    let device = manager
        .devices()
        .into_iter()
        .filter(|d| d.uuids.contains(&HEART_RATE_SERVICE_UUID))
        .max_by_key(|d| d.rssi.unwrap_or(i16::MIN))
        .ok_or_else(|| Error::UnknownDevice {
            address: "any heart rate sensor".to_string(),
        })?;

    println!(
        "Found {} ({})",
        device.name.as_deref().unwrap_or("(unnamed)"),
        device.address
    );
    println!("Connecting...\n");

    manager.connect(&device.address).await?;

    let mut events = manager.subscribe();
    manager
        .start_characteristic_notifications(
            &device.address,
            HEART_RATE_SERVICE_UUID,
            HEART_RATE_MEASUREMENT_UUID,
        )
        .await?;

    println!("Connected! Press Ctrl+C to exit.\n");

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                println!("\nExiting...");
                break;
            }
            event = events.recv() => match event {
                Ok(Event::CharacteristicValueChanged { characteristic, .. })
                    if characteristic.uuid == HEART_RATE_MEASUREMENT_UUID =>
                {
                    if let Some(bpm) = parse_heart_rate(&characteristic.value) {
                        println!("Heart rate: {} bpm", bpm);
                    }
                }
                Ok(Event::DeviceDisconnected { address }) if address == device.address => {
                    println!("\nSensor disconnected");
                    break;
                }
                Ok(_) => {}
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {}
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            },
        }
    }

    if manager.is_connected(&device.address) {
        manager
            .stop_characteristic_notifications(
                &device.address,
                HEART_RATE_SERVICE_UUID,
                HEART_RATE_MEASUREMENT_UUID,
            )
            .await?;
    }
    manager.shutdown().await?;

    Ok(())
}

/// Decode a Heart Rate Measurement value (flags byte, then u8 or u16 LE).
fn parse_heart_rate(value: &[u8]) -> Option<u16> {
    let flags = *value.first()?;
    if flags & 0x01 == 0 {
        value.get(1).map(|&bpm| u16::from(bpm))
    } else {
        Some(u16::from_le_bytes([*value.get(1)?, *value.get(2)?]))
    }
}
