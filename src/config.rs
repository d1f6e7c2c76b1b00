//! Runtime configuration for the bus, aggregator and broker client.
//!
//! The reference device hard-codes these as build-time constants; here they
//! are explicit values injected at construction so the timing-sensitive
//! behavior stays testable with small numbers.

use std::time::Duration;

/// Delivery bounds for the status bus.
#[derive(Debug, Clone)]
pub struct BusConfig {
    /// Maximum time a publish waits on any single listener queue. Kept small
    /// so interrupt-style producers are never stalled by a slow consumer.
    pub publish_timeout: Duration,
    /// Queue depth of each subscription.
    pub subscription_depth: usize,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            publish_timeout: Duration::from_millis(10),
            subscription_depth: 16,
        }
    }
}

/// Windowing parameters for the telemetry aggregator.
#[derive(Debug, Clone)]
pub struct AggregatorConfig {
    /// Samples per report window. With the 100 ms sampling period the default
    /// of 100 gives one report every 10 s.
    pub window_capacity: usize,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self { window_capacity: 100 }
    }
}

/// Connection parameters for the remote telemetry client.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub broker_host: String,
    pub broker_port: u16,
    /// Pause between reconnect cycles, and between resolution retries.
    pub reconnect_interval: Duration,
    /// Bound on the TCP connect attempt.
    pub connect_timeout: Duration,
    /// Bound on waiting for the session acknowledgement after connect.
    pub handshake_timeout: Duration,
    /// Bound on each inbound wait while connected; an elapsed bound is an
    /// idle cycle, not an error.
    pub poll_interval: Duration,
    /// Depth of the session event queue handed to the application.
    pub event_queue_depth: usize,
}

impl ClientConfig {
    pub fn new(broker_host: impl Into<String>, broker_port: u16) -> Self {
        Self {
            broker_host: broker_host.into(),
            broker_port,
            reconnect_interval: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(10),
            handshake_timeout: Duration::from_secs(10),
            poll_interval: Duration::from_secs(10),
            event_queue_depth: 64,
        }
    }
}
