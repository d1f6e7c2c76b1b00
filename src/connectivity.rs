//! Link-layer connectivity tracking.
//!
//! Translates connect/disconnect notifications raised by the network
//! collaborator into a single authoritative reachability signal for the
//! telemetry client, and into `NetworkStatus` publishes for presentation
//! sinks. Reconnection of the physical link is the collaborator's problem;
//! this component only observes and republishes.

use std::sync::Arc;

use tokio::sync::watch;
use tracing::{info, warn};

use crate::bus::StatusBus;
use crate::status::NetworkStatus;

/// Read side of the reachability signal. `true` while the link is usable.
pub type Reachability = watch::Receiver<bool>;

pub struct ConnectivityMonitor {
    bus: Arc<StatusBus>,
    reachable_tx: watch::Sender<bool>,
}

impl ConnectivityMonitor {
    pub fn new(bus: Arc<StatusBus>) -> (Self, Reachability) {
        let (reachable_tx, reachable_rx) = watch::channel(false);
        (Self { bus, reachable_tx }, reachable_rx)
    }

    pub fn is_reachable(&self) -> bool {
        *self.reachable_tx.borrow()
    }

    /// Link came up with the given address.
    pub async fn on_link_up(&self, address: impl Into<String>) {
        let address = address.into();
        info!(%address, "network is connected");
        self.reachable_tx.send_replace(true);
        if let Err(e) = self.bus.network.publish(NetworkStatus::up(address)).await {
            warn!(error = %e, "network status publish skipped a listener");
        }
    }

    /// Link went down.
    pub async fn on_link_down(&self) {
        warn!("network is disconnected");
        self.reachable_tx.send_replace(false);
        if let Err(e) = self.bus.network.publish(NetworkStatus::down()).await {
            warn!(error = %e, "network status publish skipped a listener");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BusConfig;

    #[tokio::test]
    async fn link_edges_drive_reachability_and_bus() {
        let bus = Arc::new(StatusBus::new(&BusConfig::default()));
        let (monitor, reachable) = ConnectivityMonitor::new(Arc::clone(&bus));
        let mut sub = bus.network.subscribe().await;

        assert!(!*reachable.borrow());

        monitor.on_link_up("192.168.1.17").await;
        assert!(*reachable.borrow());
        let status = sub.recv().await.unwrap();
        assert!(status.connected);
        assert_eq!(status.address.as_deref(), Some("192.168.1.17"));

        monitor.on_link_down().await;
        assert!(!*reachable.borrow());
        let status = sub.recv().await.unwrap();
        assert!(!status.connected);
        assert!(status.address.is_none());
    }
}
