//! Prometheus metrics for polled Tapo devices.

use std::sync::atomic::AtomicU64;

use async_trait::async_trait;
use prometheus_client::{
    encoding::EncodeLabelSet,
    metrics::{family::Family, gauge::Gauge},
    registry::Registry,
};
use tapo_core::{DeviceEvent, DeviceStatus, EnergyReading, Error, ReadingSink};

/// Labels attached to every per-device series.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct DeviceLabels {
    pub device_id: String,
    pub name: String,
    pub room: String,
}

impl From<&EnergyReading> for DeviceLabels {
    fn from(reading: &EnergyReading) -> Self {
        Self {
            device_id: reading.device_id.clone(),
            name: reading.device_name.clone(),
            room: reading.room_id.clone(),
        }
    }
}

impl From<&DeviceStatus> for DeviceLabels {
    fn from(status: &DeviceStatus) -> Self {
        Self {
            device_id: status.device_id.clone(),
            name: status.device_name.clone(),
            room: status.room_id.clone(),
        }
    }
}

/// Gauges exported per device.
#[derive(Clone, Default)]
pub struct DeviceMetrics {
    power_watts: Family<DeviceLabels, Gauge<f64, AtomicU64>>,
    energy_today_watt_hours: Family<DeviceLabels, Gauge<f64, AtomicU64>>,
    energy_month_watt_hours: Family<DeviceLabels, Gauge<f64, AtomicU64>>,
    runtime_today_minutes: Family<DeviceLabels, Gauge>,
    relay_state: Family<DeviceLabels, Gauge>,
    rssi_dbm: Family<DeviceLabels, Gauge>,
    online: Family<DeviceLabels, Gauge>,
    consecutive_failures: Family<DeviceLabels, Gauge>,
}

impl DeviceMetrics {
    /// Creates the gauges and registers them with `registry`.
    pub fn new(registry: &mut Registry) -> Self {
        let metrics = Self::default();

        registry.register(
            "tapo_device_power_watts",
            "Current power draw in watts",
            metrics.power_watts.clone(),
        );
        registry.register(
            "tapo_device_energy_today_watt_hours",
            "Energy consumed today in watt-hours",
            metrics.energy_today_watt_hours.clone(),
        );
        registry.register(
            "tapo_device_energy_month_watt_hours",
            "Energy consumed this month in watt-hours",
            metrics.energy_month_watt_hours.clone(),
        );
        registry.register(
            "tapo_device_runtime_today_minutes",
            "Minutes the relay has been on today",
            metrics.runtime_today_minutes.clone(),
        );
        registry.register(
            "tapo_device_relay_state",
            "Relay state (1 = on, 0 = off)",
            metrics.relay_state.clone(),
        );
        registry.register(
            "tapo_device_rssi_dbm",
            "WiFi signal strength in dBm",
            metrics.rssi_dbm.clone(),
        );
        registry.register(
            "tapo_device_online",
            "Whether the device answered its recent polls (1 = online, 0 = offline)",
            metrics.online.clone(),
        );
        registry.register(
            "tapo_device_consecutive_failures",
            "Polls that failed in a row",
            metrics.consecutive_failures.clone(),
        );

        metrics
    }

    /// Records a successful reading.
    pub fn record_reading(&self, reading: &EnergyReading) {
        let labels = DeviceLabels::from(reading);
        let usage = &reading.usage;

        self.power_watts
            .get_or_create(&labels)
            .set(usage.current_power_watts());
        self.energy_today_watt_hours
            .get_or_create(&labels)
            .set(usage.today_energy_wh as f64);
        self.energy_month_watt_hours
            .get_or_create(&labels)
            .set(usage.month_energy_wh as f64);
        self.runtime_today_minutes
            .get_or_create(&labels)
            .set(usage.today_runtime_minutes as i64);
        if let Some(on) = reading.is_on {
            self.relay_state
                .get_or_create(&labels)
                .set(if on { 1 } else { 0 });
        }
        if let Some(rssi) = reading.rssi {
            self.rssi_dbm.get_or_create(&labels).set(rssi as i64);
        }
        self.online.get_or_create(&labels).set(1);
        self.consecutive_failures.get_or_create(&labels).set(0);
    }

    /// Refreshes the health gauges from a status snapshot.
    pub fn record_status(&self, status: &DeviceStatus) {
        let labels = DeviceLabels::from(status);
        self.online
            .get_or_create(&labels)
            .set(if status.online { 1 } else { 0 });
        self.consecutive_failures
            .get_or_create(&labels)
            .set(status.consecutive_failures as i64);
    }

    /// Drops every series of a removed device.
    pub fn forget(&self, labels: &DeviceLabels) {
        self.power_watts.remove(labels);
        self.energy_today_watt_hours.remove(labels);
        self.energy_month_watt_hours.remove(labels);
        self.runtime_today_minutes.remove(labels);
        self.relay_state.remove(labels);
        self.rssi_dbm.remove(labels);
        self.online.remove(labels);
        self.consecutive_failures.remove(labels);
    }

    /// Whether `event` changes the health gauges.
    pub fn affects_health(event: &DeviceEvent) -> bool {
        matches!(
            event,
            DeviceEvent::Registered { .. }
                | DeviceEvent::Offline { .. }
                | DeviceEvent::Online { .. }
                | DeviceEvent::AuthenticationFailed { .. }
        )
    }
}

/// Reading sink that feeds [`DeviceMetrics`].
#[derive(Clone)]
pub struct PrometheusSink {
    metrics: DeviceMetrics,
}

impl PrometheusSink {
    pub fn new(metrics: DeviceMetrics) -> Self {
        Self { metrics }
    }
}

#[async_trait]
impl ReadingSink for PrometheusSink {
    async fn publish(&self, reading: &EnergyReading) -> Result<(), Error> {
        self.metrics.record_reading(reading);
        Ok(())
    }
}
