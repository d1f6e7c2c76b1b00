//! # Wind Turbine Demo Device
//!
//! Simulation of a connected wind-turbine demonstration device: an in-process
//! status bus, simulated turbine and inverter producers, windowed telemetry
//! aggregation, and a resilient client session to a remote broker.
//!
//! ## Features
//!
//! - **Status bus**: typed publish/subscribe channels with bounded, ordered
//!   per-listener delivery
//! - **Telemetry aggregation**: fixed-size sample windows averaged into
//!   periodic JSON reports, button edges forwarded as immediate alerts
//! - **Connectivity tracking**: link up/down edges folded into one
//!   reachability signal
//! - **Resilient broker session**: resolve, handshake, publish, and
//!   reconnect autonomously on any failure
//! - **Stub broker**: in-process endpoint for demos and integration tests
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use windbus::bus::StatusBus;
//! use windbus::config::BusConfig;
//! use windbus::status::WindTurbineStatus;
//!
//! # async fn demo() {
//! let bus = Arc::new(StatusBus::new(&BusConfig::default()));
//! let mut sub = bus.wind_turbine.subscribe().await;
//!
//! bus.wind_turbine
//!     .publish(WindTurbineStatus {
//!         wind_speed: 42,
//!         generator_rpm: 12,
//!         output_voltage: 600,
//!         output_power: 1200,
//!     })
//!     .await
//!     .unwrap();
//! assert_eq!(sub.recv().await.unwrap().output_power, 1200);
//! # }
//! ```
//!
//! ## Architecture
//!
//! - [`bus`] - typed status channels and the [`bus::StatusBus`]
//! - [`status`] - immutable status snapshot types
//! - [`turbine`] / [`inverter`] - simulated producers
//! - [`aggregator`] - sample windows and report generation
//! - [`connectivity`] - link reachability tracking
//! - [`client`] - remote broker session (state machine, wire protocol,
//!   credentials)
//! - [`broker`] - in-process stub broker

#![deny(clippy::all)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::cast_possible_truncation)]

pub mod aggregator;
pub mod broker;
pub mod bus;
pub mod client;
pub mod config;
pub mod connectivity;
pub mod inverter;
pub mod status;
pub mod turbine;

// Re-export main public types for convenience
pub use aggregator::{TelemetryAggregator, TelemetrySink};
pub use bus::{BusError, StatusBus, Subscription};
pub use client::{ClientError, SessionEvent, SessionState, TelemetryClient};
pub use connectivity::ConnectivityMonitor;
