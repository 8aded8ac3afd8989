//! Destination for successful readings.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::info;

use crate::error::Error;
use crate::response::EnergyUsage;

/// One successful energy poll, enriched with the device's identity and the
/// last known relay state.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EnergyReading {
    pub device_id: String,
    pub device_name: String,
    pub room_id: String,
    pub usage: EnergyUsage,
    /// From the most recent `get_device_info`, if any.
    pub is_on: Option<bool>,
    pub rssi: Option<i32>,
    pub timestamp: DateTime<Utc>,
}

/// Receives every reading a poll loop produces.
///
/// Errors are logged by the caller and never count as poll failures.
#[async_trait]
pub trait ReadingSink: Send + Sync {
    async fn publish(&self, reading: &EnergyReading) -> Result<(), Error>;
}

/// Sink that only logs readings.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

#[async_trait]
impl ReadingSink for TracingSink {
    async fn publish(&self, reading: &EnergyReading) -> Result<(), Error> {
        info!(
            device_id = %reading.device_id,
            room_id = %reading.room_id,
            power_w = reading.usage.current_power_watts(),
            today_wh = reading.usage.today_energy_wh,
            month_wh = reading.usage.month_energy_wh,
            "Energy reading"
        );
        Ok(())
    }
}
