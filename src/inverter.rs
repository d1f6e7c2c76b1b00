//! Inverter model derived from the turbine output.
//!
//! The inverter converts 99% of the turbine's power and nudges its voltage
//! and grid frequency around the nominal point depending on whether power is
//! rising, falling or steady relative to the previous sample.

use std::cmp::Ordering;
use std::sync::Arc;

use tracing::{info, warn};

use crate::bus::StatusBus;
use crate::status::{InverterStatus, WindTurbineStatus};

#[derive(Default)]
pub struct InverterModel {
    previous_output_power: u16,
}

impl InverterModel {
    /// Derives the inverter status for one turbine sample.
    pub fn derive(&mut self, turbine: &WindTurbineStatus) -> InverterStatus {
        let output_power = (99 * u32::from(turbine.output_power)) / 100;
        let (output_voltage, frequency_hz) =
            match turbine.output_power.cmp(&self.previous_output_power) {
                Ordering::Greater => (20050, 50.1),
                Ordering::Less => (19950, 49.9),
                Ordering::Equal => (20000, 50.0),
            };
        self.previous_output_power = turbine.output_power;

        InverterStatus {
            output_voltage,
            output_power: output_power as u16,
            frequency_hz,
        }
    }

    /// Mirrors every turbine publish onto the inverter channel until the
    /// turbine channel is gone.
    pub async fn run(mut self, bus: Arc<StatusBus>) {
        let mut turbine = bus.wind_turbine.subscribe().await;
        while let Some(status) = turbine.recv().await {
            let derived = self.derive(&status);
            if let Err(e) = bus.inverter.publish(derived).await {
                warn!(error = %e, "inverter status publish skipped a listener");
            }
        }
        info!("turbine channel closed, inverter stopping");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn turbine(output_power: u16) -> WindTurbineStatus {
        WindTurbineStatus {
            wind_speed: 50,
            generator_rpm: 15,
            output_voltage: 600,
            output_power,
        }
    }

    #[test]
    fn power_trend_drives_voltage_and_frequency() {
        let mut model = InverterModel::default();

        let rising = model.derive(&turbine(1000));
        assert_eq!(rising.output_voltage, 20050);
        assert_eq!(rising.frequency_hz, 50.1);

        let falling = model.derive(&turbine(500));
        assert_eq!(falling.output_voltage, 19950);
        assert_eq!(falling.frequency_hz, 49.9);

        let steady = model.derive(&turbine(500));
        assert_eq!(steady.output_voltage, 20000);
        assert_eq!(steady.frequency_hz, 50.0);
    }

    #[test]
    fn inverter_converts_99_percent_of_power() {
        let mut model = InverterModel::default();
        assert_eq!(model.derive(&turbine(1000)).output_power, 990);
        assert_eq!(model.derive(&turbine(99)).output_power, 98);
    }
}
