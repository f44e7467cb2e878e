//! BLE discovery.
//!
//! Starts and stops radio scanning and turns advertisement reports into
//! registry updates and `deviceAdded` events.

use parking_lot::RwLock;
use std::sync::Arc;
use tracing::{debug, info, trace};

use crate::ble::advertising::AdvertisementReport;
use crate::error::Result;
use crate::event_bus::{Event, EventBus};
use crate::native::NativeStack;
use crate::registry::DeviceRegistry;

/// Scan controller shared by a session manager and its event pump.
pub struct DiscoveryController {
    native: Arc<dyn NativeStack>,
    registry: Arc<DeviceRegistry>,
    bus: Arc<EventBus>,
    /// Whether scanning is currently active.
    is_scanning: RwLock<bool>,
    report_duplicates: bool,
}

impl DiscoveryController {
    /// Create a controller.
    pub fn new(
        native: Arc<dyn NativeStack>,
        registry: Arc<DeviceRegistry>,
        bus: Arc<EventBus>,
        report_duplicates: bool,
    ) -> Self {
        Self {
            native,
            registry,
            bus,
            is_scanning: RwLock::new(false),
            report_duplicates,
        }
    }

    /// Start scanning. Returns `false` if a scan was already running.
    ///
    /// # Errors
    ///
    /// Returns an error if the radio refuses to scan.
    pub async fn start(&self) -> Result<bool> {
        {
            let mut is_scanning = self.is_scanning.write();
            if *is_scanning {
                debug!("Already scanning, ignoring start request");
                return Ok(false);
            }
            // Set before the radio starts so early reports are not dropped.
            *is_scanning = true;
        }

        info!("Starting BLE scan");

        if let Err(e) = self.native.start_scan().await {
            *self.is_scanning.write() = false;
            return Err(e);
        }
        Ok(true)
    }

    /// Stop scanning. Returns `false` if no scan was running.
    pub async fn stop(&self) -> Result<bool> {
        {
            let mut is_scanning = self.is_scanning.write();
            if !*is_scanning {
                debug!("Not scanning, ignoring stop request");
                return Ok(false);
            }
            *is_scanning = false;
        }

        info!("Stopping BLE scan");

        self.native.stop_scan().await?;
        Ok(true)
    }

    /// Check if currently scanning.
    pub fn is_scanning(&self) -> bool {
        *self.is_scanning.read()
    }

    /// Fold an advertisement into the registry and republish it.
    ///
    /// Reports are always merged so a later `connect` knows the device;
    /// `deviceAdded` is only published while scanning.
    pub fn handle_advertisement(&self, report: &AdvertisementReport) {
        trace!("Advertisement from {:?} rssi {:?}", report.address, report.rssi);

        let Some(outcome) = self.registry.merge_advertisement(report) else {
            return;
        };

        if self.is_scanning() && (outcome.is_new || self.report_duplicates) {
            self.bus.publish(Event::DeviceAdded(outcome.device));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::event_bus::EventKind;
    use crate::native::MockNativeStack;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn controller(native: MockNativeStack, report_duplicates: bool) -> (DiscoveryController, Arc<EventBus>) {
        let bus = Arc::new(EventBus::default());
        let controller = DiscoveryController::new(
            Arc::new(native),
            Arc::new(DeviceRegistry::new()),
            bus.clone(),
            report_duplicates,
        );
        (controller, bus)
    }

    fn count_added(bus: &EventBus) -> Arc<AtomicUsize> {
        let added = Arc::new(AtomicUsize::new(0));
        let counter = added.clone();
        bus.on(EventKind::DeviceAdded, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        added
    }

    #[tokio::test]
    async fn test_start_and_stop_are_idempotent() {
        let mut native = MockNativeStack::new();
        native.expect_start_scan().times(1).returning(|| Ok(()));
        native.expect_stop_scan().times(1).returning(|| Ok(()));
        let (controller, _) = controller(native, true);

        assert!(controller.start().await.unwrap());
        assert!(!controller.start().await.unwrap());
        assert!(controller.is_scanning());

        assert!(controller.stop().await.unwrap());
        assert!(!controller.stop().await.unwrap());
        assert!(!controller.is_scanning());
    }

    #[tokio::test]
    async fn test_failed_start_leaves_scanning_off() {
        let mut native = MockNativeStack::new();
        native.expect_start_scan().returning(|| {
            Err(Error::NotSupported {
                operation: "scan".to_string(),
            })
        });
        let (controller, _) = controller(native, true);

        assert!(controller.start().await.is_err());
        assert!(!controller.is_scanning());
    }

    #[tokio::test]
    async fn test_reports_published_only_while_scanning() {
        let mut native = MockNativeStack::new();
        native.expect_start_scan().returning(|| Ok(()));
        let (controller, bus) = controller(native, true);
        let added = count_added(&bus);
        let report = AdvertisementReport::new("AA", Some(-40));

        controller.handle_advertisement(&report);
        assert_eq!(added.load(Ordering::SeqCst), 0);

        controller.start().await.unwrap();
        controller.handle_advertisement(&report);
        controller.handle_advertisement(&report);
        controller.handle_advertisement(&AdvertisementReport::new("", None));
        assert_eq!(added.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_duplicates_suppressed_when_configured() {
        let mut native = MockNativeStack::new();
        native.expect_start_scan().returning(|| Ok(()));
        let (controller, bus) = controller(native, false);
        let added = count_added(&bus);

        controller.start().await.unwrap();
        controller.handle_advertisement(&AdvertisementReport::new("AA", Some(-40)));
        controller.handle_advertisement(&AdvertisementReport::new("AA", Some(-42)));
        assert_eq!(added.load(Ordering::SeqCst), 1);
    }
}
