//! Session manager configuration.

use std::time::Duration;

/// Tunables for a [`SessionManager`](crate::SessionManager).
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct SessionConfig {
    /// Native connect attempts made by a single `connect` call.
    pub connect_attempts: u32,
    /// Pause between connect attempts.
    pub reconnect_delay: Duration,
    /// Capacity of the event broadcast channel.
    pub event_capacity: usize,
    /// Republish `deviceAdded` for devices that are already known.
    pub report_duplicates: bool,
}

impl SessionConfig {
    /// Set the number of native connect attempts (at least one).
    pub fn with_connect_attempts(mut self, attempts: u32) -> Self {
        self.connect_attempts = attempts.max(1);
        self
    }

    /// Set the delay between connect attempts.
    pub fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }

    /// Set the event broadcast capacity (at least one).
    pub fn with_event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity.max(1);
        self
    }

    /// Choose whether repeated advertisements are republished.
    pub fn with_report_duplicates(mut self, report: bool) -> Self {
        self.report_duplicates = report;
        self
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            connect_attempts: 1,
            reconnect_delay: Duration::from_secs(1),
            event_capacity: 64,
            report_duplicates: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_clamps() {
        let config = SessionConfig::default()
            .with_connect_attempts(0)
            .with_event_capacity(0)
            .with_report_duplicates(false);

        assert_eq!(config.connect_attempts, 1);
        assert_eq!(config.event_capacity, 1);
        assert!(!config.report_duplicates);
        assert_eq!(config.reconnect_delay, Duration::from_secs(1));
    }
}
