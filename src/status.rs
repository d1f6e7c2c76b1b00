//! Status event types carried by the [`crate::bus::StatusBus`].
//!
//! Each type is an immutable snapshot produced at sampling time. Consumers
//! never mutate a received value; a newer publish on the same channel
//! supersedes it.

use serde::{Deserialize, Serialize};

/// Snapshot of a user button edge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ButtonStatus {
    /// Button name as reported to the remote endpoint (e.g. "user").
    pub name: String,
    pub pressed: bool,
}

/// Snapshot of the simulated wind turbine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindTurbineStatus {
    /// Wind speed (km/h).
    pub wind_speed: u16,
    /// Generator speed (rpm).
    pub generator_rpm: u16,
    /// Output voltage (volts).
    pub output_voltage: u16,
    /// Output power (kilowatts).
    pub output_power: u16,
}

/// Snapshot of the inverter derived from the turbine output.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct InverterStatus {
    /// Output voltage (volts).
    pub output_voltage: u16,
    /// Output power (kilowatts).
    pub output_power: u16,
    /// Grid frequency (hertz).
    pub frequency_hz: f64,
}

/// Link-layer connectivity snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkStatus {
    pub connected: bool,
    /// IPv4 address, present while connected.
    pub address: Option<String>,
}

impl NetworkStatus {
    pub fn up(address: impl Into<String>) -> Self {
        Self {
            connected: true,
            address: Some(address.into()),
        }
    }

    pub fn down() -> Self {
        Self {
            connected: false,
            address: None,
        }
    }
}
