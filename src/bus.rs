//! Typed in-process publish/subscribe bus.
//!
//! Producers publish immutable status snapshots to a named channel; every
//! registered listener receives the value through its own bounded queue.
//! Dispatch is serialized per channel, so listeners observe publishes in
//! publish order. Subscribing delivers no replay of the current value: a new
//! listener only sees publishes that happen after registration.
//!
//! A listener that cannot accept a value within the publish bound is skipped
//! for that publish and the publisher gets [`BusError::Timeout`]. Producers
//! are expected to treat this as non-fatal (log and continue) so a slow
//! consumer can never stall time-sensitive sampling.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::SendTimeoutError;
use tokio::sync::Mutex;
use tracing::trace;

use crate::config::BusConfig;
use crate::status::{ButtonStatus, InverterStatus, NetworkStatus, WindTurbineStatus};

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum BusError {
    #[error("publish to '{channel}' timed out before every listener accepted it")]
    Timeout { channel: &'static str },
}

/// Opaque handle identifying one registered listener on one channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// Receiving end of a channel registration.
///
/// Dropping the subscription unregisters the listener on the next publish.
#[derive(Debug)]
pub struct Subscription<T> {
    id: ListenerId,
    rx: mpsc::Receiver<T>,
}

impl<T> Subscription<T> {
    pub fn id(&self) -> ListenerId {
        self.id
    }

    /// Waits for the next published value. Returns `None` once the channel
    /// itself has been dropped.
    pub async fn recv(&mut self) -> Option<T> {
        self.rx.recv().await
    }
}

struct ListenerSlot<T> {
    id: ListenerId,
    tx: mpsc::Sender<T>,
}

/// One named, typed slot of the status bus.
pub struct StatusChannel<T> {
    name: &'static str,
    publish_timeout: Duration,
    subscription_depth: usize,
    /// Latest published value, replaced whole so readers never see a torn
    /// update.
    current: RwLock<Option<T>>,
    /// Registered listeners in registration order. The async lock also
    /// serializes dispatch, which is what gives per-channel publish ordering.
    listeners: Mutex<Vec<ListenerSlot<T>>>,
    next_id: AtomicU64,
}

impl<T: Clone + Send + 'static> StatusChannel<T> {
    fn new(name: &'static str, config: &BusConfig) -> Self {
        Self {
            name,
            publish_timeout: config.publish_timeout,
            subscription_depth: config.subscription_depth,
            current: RwLock::new(None),
            listeners: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Latest value published on this channel, `None` before the first
    /// publish. Presentation sinks use this to render a placeholder until
    /// real data arrives.
    pub fn latest(&self) -> Option<T> {
        match self.current.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Publishes `value` with the channel's configured delivery bound.
    pub async fn publish(&self, value: T) -> Result<(), BusError> {
        self.publish_with_timeout(value, self.publish_timeout).await
    }

    /// Publishes `value`, giving each listener at most `timeout` to accept it.
    ///
    /// The value becomes the channel's current value even when delivery to
    /// some listener times out.
    pub async fn publish_with_timeout(&self, value: T, timeout: Duration) -> Result<(), BusError> {
        match self.current.write() {
            Ok(mut guard) => *guard = Some(value.clone()),
            Err(poisoned) => *poisoned.into_inner() = Some(value.clone()),
        }

        let mut listeners = self.listeners.lock().await;
        let mut timed_out = false;
        let mut closed: Vec<ListenerId> = Vec::new();

        for slot in listeners.iter() {
            match slot.tx.send_timeout(value.clone(), timeout).await {
                Ok(()) => {}
                Err(SendTimeoutError::Timeout(_)) => {
                    trace!(channel = self.name, "listener queue full, value skipped");
                    timed_out = true;
                }
                Err(SendTimeoutError::Closed(_)) => closed.push(slot.id),
            }
        }

        if !closed.is_empty() {
            listeners.retain(|slot| !closed.contains(&slot.id));
        }

        if timed_out {
            Err(BusError::Timeout { channel: self.name })
        } else {
            Ok(())
        }
    }

    /// Registers a listener. Only publishes issued after this call are
    /// delivered.
    pub async fn subscribe(&self) -> Subscription<T> {
        let (tx, rx) = mpsc::channel(self.subscription_depth);
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.listeners.lock().await.push(ListenerSlot { id, tx });
        Subscription { id, rx }
    }

    /// Removes a previously registered listener. Idempotent: unknown ids are
    /// ignored.
    pub async fn unsubscribe(&self, id: ListenerId) {
        self.listeners.lock().await.retain(|slot| slot.id != id);
    }

    pub async fn listener_count(&self) -> usize {
        self.listeners.lock().await.len()
    }
}

/// The four channels of the demonstration device.
///
/// Constructed explicitly and shared by reference; there is no process-wide
/// bus instance.
pub struct StatusBus {
    pub buttons: StatusChannel<ButtonStatus>,
    pub wind_turbine: StatusChannel<WindTurbineStatus>,
    pub inverter: StatusChannel<InverterStatus>,
    pub network: StatusChannel<NetworkStatus>,
}

impl StatusBus {
    pub fn new(config: &BusConfig) -> Self {
        Self {
            buttons: StatusChannel::new("buttons_status", config),
            wind_turbine: StatusChannel::new("wind_turbine_status", config),
            inverter: StatusChannel::new("inverter_status", config),
            network: StatusChannel::new("network_status", config),
        }
    }
}
