//! Simulated wind turbine producer.
//!
//! Replaces the reference hardware's ADC input with a deterministic triangle
//! waveform over the same 12-bit range, then applies the same shaping: a dead
//! zone below 64, a voltage knee at 1340, and linear wind-speed/rpm scaling.
//! The numbers are chosen so the demo renders coherently, not for physical
//! accuracy.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::interval;
use tracing::{info, warn};

use crate::bus::StatusBus;
use crate::status::WindTurbineStatus;

const RAW_MAX: i32 = 4095;
const DEAD_ZONE: u32 = 64;
const VOLTAGE_KNEE: u32 = 1340;

/// Maps one 12-bit raw sample to a turbine status snapshot.
fn status_from_raw(raw: u16) -> WindTurbineStatus {
    let raw = u32::from(raw).min(RAW_MAX as u32);
    let raw = if raw < DEAD_ZONE { 0 } else { raw };
    let half = raw / 2;
    let voltage = if raw < VOLTAGE_KNEE {
        half
    } else {
        670 + (120 * (half - 670)) / 4096
    };

    WindTurbineStatus {
        wind_speed: ((raw * 100) / 4096) as u16,
        generator_rpm: ((raw * 30) / 4096) as u16,
        output_voltage: voltage as u16,
        output_power: raw as u16,
    }
}

pub struct WindTurbineSim {
    raw: i32,
    step: i32,
}

impl Default for WindTurbineSim {
    fn default() -> Self {
        // A step of 32 sweeps the full range in 128 samples, one ramp about
        // every 13 s at the 100 ms sampling period.
        Self { raw: 0, step: 32 }
    }
}

impl WindTurbineSim {
    fn next_raw(&mut self) -> u16 {
        self.raw += self.step;
        if self.raw >= RAW_MAX {
            self.raw = RAW_MAX;
            self.step = -self.step;
        } else if self.raw <= 0 {
            self.raw = 0;
            self.step = -self.step;
        }
        self.raw as u16
    }

    /// Samples the waveform every `sample_period` and publishes the shaped
    /// status. A skipped listener is logged and sampling continues.
    pub async fn run(mut self, bus: Arc<StatusBus>, sample_period: Duration) {
        info!("wind turbine simulation started");
        let mut ticker = interval(sample_period);
        loop {
            ticker.tick().await;
            let status = status_from_raw(self.next_raw());
            if let Err(e) = bus.wind_turbine.publish(status).await {
                warn!(error = %e, "turbine status publish skipped a listener");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dead_zone_reads_as_fully_stopped() {
        let status = status_from_raw(63);
        assert_eq!(status.wind_speed, 0);
        assert_eq!(status.generator_rpm, 0);
        assert_eq!(status.output_voltage, 0);
        assert_eq!(status.output_power, 0);
    }

    #[test]
    fn below_the_knee_voltage_is_half_the_raw_value() {
        let status = status_from_raw(1000);
        assert_eq!(status.output_voltage, 500);
        assert_eq!(status.output_power, 1000);
        assert_eq!(status.wind_speed, 24);
        assert_eq!(status.generator_rpm, 7);
    }

    #[test]
    fn above_the_knee_voltage_flattens() {
        // 670 + (120 * (1000 - 670)) / 4096 = 679
        let status = status_from_raw(2000);
        assert_eq!(status.output_voltage, 679);
        assert_eq!(status.wind_speed, 48);
        assert_eq!(status.generator_rpm, 14);
    }

    #[test]
    fn waveform_reverses_at_the_range_bounds() {
        let mut sim = WindTurbineSim { raw: 4090, step: 32 };
        assert_eq!(sim.next_raw(), 4095);
        assert!(sim.next_raw() < 4095);

        let mut sim = WindTurbineSim { raw: 10, step: -32 };
        assert_eq!(sim.next_raw(), 0);
        assert!(sim.next_raw() > 0);
    }
}
