//! Basic example: Discover nearby BLE devices
//!
//! Run with: cargo run --example discover_devices

use ble_central::{uuids, Event, EventKind, Result, SessionManager};
use std::time::Duration;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("ble_central=debug".parse().unwrap()),
        )
        .init();

    println!("Starting BLE discovery...\n");

    let manager = SessionManager::new().await?;

    let adapter = manager.adapter_state().await?;
    println!("Adapter: {} (enabled: {})\n", adapter.name, adapter.enabled);

    // Print every advertisement as it arrives
    manager.on(EventKind::DeviceAdded, |event| {
        if let Event::DeviceAdded(device) = event {
            let services: Vec<String> = device.uuids.iter().map(uuids::to_short_string).collect();
            println!(
                "  {} {:<24} RSSI: {:?} dBm  services: [{}]",
                device.address,
                device.name.as_deref().unwrap_or("(unnamed)"),
                device.rssi,
                services.join(", ")
            );
        }
    });

    manager.start_discovery().await?;

    println!("Scanning for 30 seconds...");
    println!("Press Ctrl+C to exit early.\n");

    tokio::select! {
        _ = tokio::time::sleep(Duration::from_secs(30)) => {}
        _ = tokio::signal::ctrl_c() => {
            println!("\nInterrupted!");
        }
    }

    manager.stop_discovery().await?;

    println!("\n--- Scan Complete ---");
    let devices = manager.devices();
    println!("Total devices found: {}", devices.len());

    if let Some(nearest) = manager.nearest_device() {
        println!(
            "Nearest: {} ({:?} dBm)",
            nearest.name.as_deref().unwrap_or(&nearest.address),
            nearest.rssi
        );
    }

    manager.shutdown().await?;
    println!("\nDone!");

    Ok(())
}
