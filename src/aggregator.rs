//! Telemetry aggregation and report generation.
//!
//! Consumes status snapshots from the bus, accumulates them in fixed-size
//! sample windows and turns each full window into the JSON reports the remote
//! endpoint expects. Button edges bypass the windows and go out immediately
//! as alerts.
//!
//! Publish failures are logged and the report dropped; the window resets
//! regardless, so a broker outage costs at most the reports that fall inside
//! it and never backs samples up.

use async_trait::async_trait;
use serde::Serialize;
use tracing::{info, warn};

use crate::bus::StatusBus;
use crate::client::wire::QoS;
use crate::client::{ClientError, TelemetryClient};
use crate::config::AggregatorConfig;
use crate::status::{ButtonStatus, InverterStatus, WindTurbineStatus};

/// Where finished reports go. The production sink is [`TelemetryClient`];
/// tests substitute a recording sink.
#[async_trait]
pub trait TelemetrySink: Send + Sync {
    async fn publish_telemetry(&self, payload: String, qos: QoS) -> Result<u16, ClientError>;
    async fn publish_config(&self, payload: String, qos: QoS) -> Result<u16, ClientError>;
}

#[async_trait]
impl TelemetrySink for TelemetryClient {
    async fn publish_telemetry(&self, payload: String, qos: QoS) -> Result<u16, ClientError> {
        TelemetryClient::publish_telemetry(self, payload, qos).await
    }

    async fn publish_config(&self, payload: String, qos: QoS) -> Result<u16, ClientError> {
        TelemetryClient::publish_config(self, payload, qos).await
    }
}

#[derive(Serialize)]
struct AlertReport<'a> {
    alert: AlertBody<'a>,
}

#[derive(Serialize)]
struct AlertBody<'a> {
    name: &'a str,
    state: u8,
}

#[derive(Serialize)]
struct WindTurbineReport {
    wind_turbine: WindTurbineBody,
}

#[derive(Serialize)]
struct WindTurbineBody {
    output_voltage: u32,
    output_power: u32,
}

/// Device configuration snapshot sent alongside each turbine report. The
/// demo device is always on, in production mode, with a fixed power limiter.
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ConfigSnapshot {
    turned_on: bool,
    is_production: bool,
    limiter: u8,
}

impl ConfigSnapshot {
    fn current() -> Self {
        Self {
            turned_on: true,
            is_production: true,
            limiter: 30,
        }
    }
}

/// Application-level summary of the turbine window.
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct AppSummary {
    energy_production: u32,
    generator: u32,
    wind_speed: u32,
}

#[derive(Serialize)]
struct InverterReport {
    inverter: InverterBody,
}

#[derive(Serialize)]
struct InverterBody {
    output_voltage: u32,
    output_power: u32,
    frequency: f64,
}

/// Integer mean with the fractional part truncated, matching what the remote
/// endpoint renders.
fn mean_u16(values: &[u16]) -> u32 {
    if values.is_empty() {
        return 0;
    }
    values.iter().map(|&v| u32::from(v)).sum::<u32>() / values.len() as u32
}

fn mean_f64(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

struct TurbineAverages {
    wind_speed: u32,
    generator_rpm: u32,
    output_voltage: u32,
    output_power: u32,
}

struct TurbineWindow {
    capacity: usize,
    wind_speed: Vec<u16>,
    generator_rpm: Vec<u16>,
    output_voltage: Vec<u16>,
    output_power: Vec<u16>,
}

impl TurbineWindow {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            wind_speed: Vec::with_capacity(capacity),
            generator_rpm: Vec::with_capacity(capacity),
            output_voltage: Vec::with_capacity(capacity),
            output_power: Vec::with_capacity(capacity),
        }
    }

    /// Appends one sample; on the sample that fills the window, returns the
    /// window averages and resets in the same step so no concurrent observer
    /// can see a full-but-undrained window.
    fn push(&mut self, status: &WindTurbineStatus) -> Option<TurbineAverages> {
        self.wind_speed.push(status.wind_speed);
        self.generator_rpm.push(status.generator_rpm);
        self.output_voltage.push(status.output_voltage);
        self.output_power.push(status.output_power);

        if self.wind_speed.len() < self.capacity {
            return None;
        }

        let averages = TurbineAverages {
            wind_speed: mean_u16(&self.wind_speed),
            generator_rpm: mean_u16(&self.generator_rpm),
            output_voltage: mean_u16(&self.output_voltage),
            output_power: mean_u16(&self.output_power),
        };
        self.wind_speed.clear();
        self.generator_rpm.clear();
        self.output_voltage.clear();
        self.output_power.clear();
        Some(averages)
    }
}

struct InverterAverages {
    output_voltage: u32,
    output_power: u32,
    frequency_hz: f64,
}

struct InverterWindow {
    capacity: usize,
    output_voltage: Vec<u16>,
    output_power: Vec<u16>,
    frequency_hz: Vec<f64>,
}

impl InverterWindow {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            output_voltage: Vec::with_capacity(capacity),
            output_power: Vec::with_capacity(capacity),
            frequency_hz: Vec::with_capacity(capacity),
        }
    }

    fn push(&mut self, status: &InverterStatus) -> Option<InverterAverages> {
        self.output_voltage.push(status.output_voltage);
        self.output_power.push(status.output_power);
        self.frequency_hz.push(status.frequency_hz);

        if self.output_voltage.len() < self.capacity {
            return None;
        }

        let averages = InverterAverages {
            output_voltage: mean_u16(&self.output_voltage),
            output_power: mean_u16(&self.output_power),
            frequency_hz: mean_f64(&self.frequency_hz),
        };
        self.output_voltage.clear();
        self.output_power.clear();
        self.frequency_hz.clear();
        Some(averages)
    }
}

pub struct TelemetryAggregator<S> {
    sink: S,
    turbine_window: TurbineWindow,
    inverter_window: InverterWindow,
}

impl<S: TelemetrySink> TelemetryAggregator<S> {
    pub fn new(sink: S, config: &AggregatorConfig) -> Self {
        Self {
            sink,
            turbine_window: TurbineWindow::new(config.window_capacity),
            inverter_window: InverterWindow::new(config.window_capacity),
        }
    }

    /// Button edges are forwarded immediately as an alert, pressed encoded
    /// as 1 and released as 0.
    pub async fn on_button_status(&mut self, status: &ButtonStatus) {
        let report = AlertReport {
            alert: AlertBody {
                name: &status.name,
                state: u8::from(status.pressed),
            },
        };
        self.send_telemetry(&report).await;
    }

    /// Accumulates one turbine sample. A full window emits, in order, the
    /// turbine report, the configuration snapshot and the application
    /// summary.
    pub async fn on_wind_turbine_status(&mut self, status: &WindTurbineStatus) {
        let Some(averages) = self.turbine_window.push(status) else {
            return;
        };

        let report = WindTurbineReport {
            wind_turbine: WindTurbineBody {
                output_voltage: averages.output_voltage,
                output_power: averages.output_power,
            },
        };
        self.send_telemetry(&report).await;
        self.send_config(&ConfigSnapshot::current()).await;

        let summary = AppSummary {
            energy_production: averages.output_power,
            generator: averages.generator_rpm,
            wind_speed: averages.wind_speed,
        };
        self.send_telemetry(&summary).await;
    }

    /// Accumulates one inverter sample; the inverter window fills and drains
    /// independently of the turbine window.
    pub async fn on_inverter_status(&mut self, status: &InverterStatus) {
        let Some(averages) = self.inverter_window.push(status) else {
            return;
        };

        let report = InverterReport {
            inverter: InverterBody {
                output_voltage: averages.output_voltage,
                output_power: averages.output_power,
                frequency: averages.frequency_hz,
            },
        };
        self.send_telemetry(&report).await;
    }

    async fn send_telemetry<R: Serialize>(&self, report: &R) {
        let payload = match serde_json::to_string(report) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(error = %e, "unable to encode telemetry report");
                return;
            }
        };
        if let Err(e) = self.sink.publish_telemetry(payload, QoS::AtLeastOnce).await {
            warn!(error = %e, "telemetry report dropped");
        }
    }

    async fn send_config(&self, snapshot: &ConfigSnapshot) {
        let payload = match serde_json::to_string(snapshot) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(error = %e, "unable to encode configuration snapshot");
                return;
            }
        };
        if let Err(e) = self.sink.publish_config(payload, QoS::AtLeastOnce).await {
            warn!(error = %e, "configuration snapshot dropped");
        }
    }

    /// Drives the aggregator from the bus until every status channel is gone.
    pub async fn run(mut self, bus: std::sync::Arc<StatusBus>) {
        let mut buttons = bus.buttons.subscribe().await;
        let mut turbine = bus.wind_turbine.subscribe().await;
        let mut inverter = bus.inverter.subscribe().await;

        loop {
            tokio::select! {
                status = buttons.recv() => match status {
                    Some(status) => self.on_button_status(&status).await,
                    None => break,
                },
                status = turbine.recv() => match status {
                    Some(status) => self.on_wind_turbine_status(&status).await,
                    None => break,
                },
                status = inverter.recv() => match status {
                    Some(status) => self.on_inverter_status(&status).await,
                    None => break,
                },
            }
        }
        info!("status channels closed, aggregator stopping");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use tokio::sync::Mutex;

    #[derive(Debug, Clone, PartialEq)]
    enum Sent {
        Telemetry(String),
        Config(String),
    }

    #[derive(Clone, Default)]
    struct RecordingSink {
        sent: Arc<Mutex<Vec<Sent>>>,
        fail: Arc<AtomicBool>,
    }

    impl RecordingSink {
        async fn sent(&self) -> Vec<Sent> {
            self.sent.lock().await.clone()
        }
    }

    #[async_trait]
    impl TelemetrySink for RecordingSink {
        async fn publish_telemetry(&self, payload: String, _qos: QoS) -> Result<u16, ClientError> {
            if self.fail.load(Ordering::Relaxed) {
                return Err(ClientError::NotConnected);
            }
            self.sent.lock().await.push(Sent::Telemetry(payload));
            Ok(1)
        }

        async fn publish_config(&self, payload: String, _qos: QoS) -> Result<u16, ClientError> {
            if self.fail.load(Ordering::Relaxed) {
                return Err(ClientError::NotConnected);
            }
            self.sent.lock().await.push(Sent::Config(payload));
            Ok(1)
        }
    }

    fn small_window(capacity: usize) -> AggregatorConfig {
        AggregatorConfig {
            window_capacity: capacity,
        }
    }

    #[tokio::test]
    async fn full_turbine_window_emits_reports_with_truncated_means() {
        let sink = RecordingSink::default();
        let mut aggregator = TelemetryAggregator::new(sink.clone(), &small_window(4));

        let samples = [
            (10u16, 20u16, 230u16, 500u16),
            (11, 21, 230, 501),
            (12, 22, 231, 502),
            (13, 23, 231, 503),
        ];
        for (wind_speed, generator_rpm, output_voltage, output_power) in samples {
            aggregator
                .on_wind_turbine_status(&WindTurbineStatus {
                    wind_speed,
                    generator_rpm,
                    output_voltage,
                    output_power,
                })
                .await;
        }

        // 230.5 V and 501.5 kW truncate, and the three reports keep their
        // fixed order.
        assert_eq!(
            sink.sent().await,
            vec![
                Sent::Telemetry(
                    r#"{"wind_turbine":{"output_voltage":230,"output_power":501}}"#.into()
                ),
                Sent::Config(r#"{"turnedOn":true,"isProduction":true,"limiter":30}"#.into()),
                Sent::Telemetry(r#"{"energyProduction":501,"generator":21,"windSpeed":11}"#.into()),
            ]
        );
    }

    #[tokio::test]
    async fn partial_window_emits_nothing() {
        let sink = RecordingSink::default();
        let mut aggregator = TelemetryAggregator::new(sink.clone(), &small_window(4));

        for _ in 0..3 {
            aggregator
                .on_wind_turbine_status(&WindTurbineStatus {
                    wind_speed: 10,
                    generator_rpm: 20,
                    output_voltage: 230,
                    output_power: 500,
                })
                .await;
        }
        assert!(sink.sent().await.is_empty());
    }

    #[tokio::test]
    async fn window_resets_after_draining() {
        let sink = RecordingSink::default();
        let mut aggregator = TelemetryAggregator::new(sink.clone(), &small_window(2));

        let sample = WindTurbineStatus {
            wind_speed: 10,
            generator_rpm: 20,
            output_voltage: 230,
            output_power: 500,
        };
        for _ in 0..5 {
            aggregator.on_wind_turbine_status(&sample).await;
        }

        // Two full windows (three reports each); the fifth sample starts a
        // third window that has not drained.
        assert_eq!(sink.sent().await.len(), 6);
    }

    #[tokio::test]
    async fn button_edges_become_immediate_alerts() {
        let sink = RecordingSink::default();
        let mut aggregator = TelemetryAggregator::new(sink.clone(), &small_window(100));

        aggregator
            .on_button_status(&ButtonStatus {
                name: "user".into(),
                pressed: true,
            })
            .await;
        aggregator
            .on_button_status(&ButtonStatus {
                name: "user".into(),
                pressed: false,
            })
            .await;

        assert_eq!(
            sink.sent().await,
            vec![
                Sent::Telemetry(r#"{"alert":{"name":"user","state":1}}"#.into()),
                Sent::Telemetry(r#"{"alert":{"name":"user","state":0}}"#.into()),
            ]
        );
    }

    #[tokio::test]
    async fn inverter_window_reports_mean_frequency() {
        let sink = RecordingSink::default();
        let mut aggregator = TelemetryAggregator::new(sink.clone(), &small_window(2));

        aggregator
            .on_inverter_status(&InverterStatus {
                output_voltage: 20050,
                output_power: 495,
                frequency_hz: 50.5,
            })
            .await;
        aggregator
            .on_inverter_status(&InverterStatus {
                output_voltage: 20000,
                output_power: 496,
                frequency_hz: 49.5,
            })
            .await;

        assert_eq!(
            sink.sent().await,
            vec![Sent::Telemetry(
                r#"{"inverter":{"output_voltage":20025,"output_power":495,"frequency":50.0}}"#
                    .into()
            )]
        );
    }

    #[tokio::test]
    async fn sink_failure_drops_report_but_resets_window() {
        let sink = RecordingSink::default();
        sink.fail.store(true, Ordering::Relaxed);
        let mut aggregator = TelemetryAggregator::new(sink.clone(), &small_window(2));

        let sample = WindTurbineStatus {
            wind_speed: 10,
            generator_rpm: 20,
            output_voltage: 230,
            output_power: 500,
        };
        aggregator.on_wind_turbine_status(&sample).await;
        aggregator.on_wind_turbine_status(&sample).await;
        assert!(sink.sent().await.is_empty());

        // The failed window was discarded; the next one drains normally.
        sink.fail.store(false, Ordering::Relaxed);
        aggregator.on_wind_turbine_status(&sample).await;
        aggregator.on_wind_turbine_status(&sample).await;
        assert_eq!(sink.sent().await.len(), 3);
    }
}
