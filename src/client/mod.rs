//! Remote telemetry client.
//!
//! Owns exactly one logical session to the remote broker and recovers from
//! every class of failure (resolution, connect, handshake, protocol-level
//! disconnect) without operator intervention. The session is driven by a
//! single background task, so there is never more than one handshake attempt
//! or one active session at a time.
//!
//! The publish surface is deliberately fire-and-forget: there is no outbound
//! queue, a publish while not connected fails fast with
//! [`ClientError::NotConnected`], and the caller is expected to discard the
//! payload. The next report window supersedes anything lost during a
//! reconnect.

pub mod credentials;
pub mod wire;

use std::io;
use std::net::SocketAddr;
use std::ops::ControlFlow;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, BufReader, Lines, ReadHalf, WriteHalf};
use tokio::net::{lookup_host, TcpStream};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

use crate::config::ClientConfig;
use crate::connectivity::Reachability;
use credentials::{CredentialError, CredentialMaterial, DeviceCredentials, DeviceIdentity};
use wire::{config_topic, decode_frame, telemetry_topic, write_frame, Frame, QoS};

#[derive(Debug, Error)]
pub enum ClientError {
    /// Authentication material is malformed or missing. Fatal to
    /// initialization; never retried.
    #[error("credential error: {0}")]
    Credential(#[from] CredentialError),
    /// Publish attempted while the session is not established. The caller
    /// discards the payload.
    #[error("not connected to the broker")]
    NotConnected,
    /// The send itself failed. The session loop notices the same error on its
    /// side and tears the session down.
    #[error("publish failed: {0}")]
    Delivery(io::Error),
}

/// Where the session currently stands. Transitions are driven solely by the
/// background loop and by connectivity edges.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Resolving,
    Connecting,
    Connected,
}

/// Session lifecycle notifications delivered to the owning application.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// The session acknowledgement arrived; publishes will now succeed.
    Connected,
    /// The session ended; fired exactly once per established session.
    Disconnected,
    /// Delivery result for an at-least-once publish.
    PublishResult { message_id: u16, success: bool },
    /// Payload pushed by the broker (e.g. a remote command). Interpretation
    /// is the application's business.
    Inbound { topic: String, payload: String },
}

/// Byte stream usable as a broker session.
pub trait SessionIo: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> SessionIo for T {}

pub type SessionStream = Box<dyn SessionIo>;

type SessionReader = Lines<BufReader<ReadHalf<SessionStream>>>;

/// Connection establishment seam. A secure transport implements this trait
/// and consumes the installed credentials during its handshake; those
/// internals stay behind the seam.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn connect(
        &self,
        addr: SocketAddr,
        host: &str,
        credentials: &DeviceCredentials,
    ) -> io::Result<SessionStream>;
}

/// Plain TCP transport used by the demo and the tests.
pub struct TcpTransport;

#[async_trait]
impl Transport for TcpTransport {
    async fn connect(
        &self,
        addr: SocketAddr,
        _host: &str,
        _credentials: &DeviceCredentials,
    ) -> io::Result<SessionStream> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        Ok(Box::new(stream))
    }
}

struct Shared {
    config: ClientConfig,
    identity: DeviceIdentity,
    credentials: DeviceCredentials,
    state_tx: watch::Sender<SessionState>,
    /// Write half of the live session. `None` whenever no session is
    /// established; taken by the session loop on teardown.
    writer: Mutex<Option<WriteHalf<SessionStream>>>,
    events_tx: mpsc::Sender<SessionEvent>,
    next_message_id: AtomicU16,
}

impl Shared {
    fn set_state(&self, state: SessionState) {
        self.state_tx.send_replace(state);
    }

    fn state(&self) -> SessionState {
        *self.state_tx.borrow()
    }

    /// Events must never block the session loop; an unresponsive consumer
    /// loses notifications instead.
    fn emit(&self, event: SessionEvent) {
        if self.events_tx.try_send(event).is_err() {
            warn!("session event queue full, notification dropped");
        }
    }

    fn next_message_id(&self) -> u16 {
        loop {
            let id = self.next_message_id.fetch_add(1, Ordering::Relaxed);
            if id != 0 {
                return id;
            }
        }
    }
}

/// Handle to the remote telemetry session. Cheap to clone; all clones share
/// the single underlying session.
#[derive(Clone)]
pub struct TelemetryClient {
    shared: Arc<Shared>,
}

impl TelemetryClient {
    /// Installs the device's authentication material and builds the client.
    /// Must succeed before any connection attempt; malformed material fails
    /// here with [`ClientError::Credential`] and is never retried.
    pub fn initialize(
        config: ClientConfig,
        identity: DeviceIdentity,
        material: &CredentialMaterial,
    ) -> Result<(Self, mpsc::Receiver<SessionEvent>), ClientError> {
        let credentials = DeviceCredentials::install(material)?;
        let (state_tx, _) = watch::channel(SessionState::Disconnected);
        let (events_tx, events_rx) = mpsc::channel(config.event_queue_depth);

        let shared = Arc::new(Shared {
            config,
            identity,
            credentials,
            state_tx,
            writer: Mutex::new(None),
            events_tx,
            next_message_id: AtomicU16::new(1),
        });

        Ok((Self { shared }, events_rx))
    }

    pub fn client_id(&self) -> &str {
        &self.shared.identity.client_id
    }

    pub fn state(&self) -> SessionState {
        self.shared.state()
    }

    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.shared.state_tx.subscribe()
    }

    /// Spawns the background session loop. The loop runs until the
    /// reachability channel is closed (application shutdown).
    pub fn start<T: Transport>(&self, reachability: Reachability, transport: T) -> JoinHandle<()> {
        let shared = Arc::clone(&self.shared);
        tokio::spawn(session_loop(shared, reachability, Arc::new(transport)))
    }

    /// Publishes a telemetry payload on the device's telemetry topic.
    pub async fn publish_telemetry(
        &self,
        payload: impl Into<String>,
        qos: QoS,
    ) -> Result<u16, ClientError> {
        let topic = telemetry_topic(&self.shared.identity.client_id);
        self.publish(topic, payload.into(), qos).await
    }

    /// Publishes a configuration payload on the device's config topic.
    pub async fn publish_config(
        &self,
        payload: impl Into<String>,
        qos: QoS,
    ) -> Result<u16, ClientError> {
        let topic = config_topic(&self.shared.identity.client_id);
        self.publish(topic, payload.into(), qos).await
    }

    /// Best-effort check-then-send. The session loop may tear the writer
    /// down between the state check and the send; the resulting I/O error is
    /// an ordinary publish failure, not corruption.
    async fn publish(&self, topic: String, payload: String, qos: QoS) -> Result<u16, ClientError> {
        if self.shared.state() != SessionState::Connected {
            return Err(ClientError::NotConnected);
        }

        let mut guard = self.shared.writer.lock().await;
        let writer = guard.as_mut().ok_or(ClientError::NotConnected)?;
        let id = self.shared.next_message_id();
        let frame = Frame::Publish {
            id,
            topic,
            qos,
            payload,
        };
        write_frame(writer, &frame).await.map_err(ClientError::Delivery)?;
        Ok(id)
    }
}

/// One iteration per session lifetime: wait for the link, resolve, connect,
/// handshake, serve the session, tear down, back off, repeat.
async fn session_loop(shared: Arc<Shared>, mut reachable: Reachability, transport: Arc<dyn Transport>) {
    loop {
        shared.set_state(SessionState::Disconnected);

        // Idle until the link is usable. A closed channel means the
        // connectivity monitor is gone and the application is shutting down.
        while !*reachable.borrow() {
            if reachable.changed().await.is_err() {
                return;
            }
        }

        // Resolve once per reconnect cycle; the address is dropped on
        // teardown so a broker re-IP is picked up by the next cycle.
        shared.set_state(SessionState::Resolving);
        let addr = match resolve_broker(&shared, &mut reachable).await {
            Some(addr) => addr,
            None => continue,
        };

        shared.set_state(SessionState::Connecting);
        let session = match open_session(&shared, transport.as_ref(), addr, &mut reachable).await {
            Some(session) => session,
            None => {
                shared.set_state(SessionState::Disconnected);
                backoff(&shared, &mut reachable).await;
                continue;
            }
        };

        let (reader, write_half) = session;
        *shared.writer.lock().await = Some(write_half);
        shared.set_state(SessionState::Connected);
        shared.emit(SessionEvent::Connected);
        info!(
            broker = %shared.config.broker_host,
            client_id = %shared.identity.client_id,
            "connected to broker"
        );

        run_session(&shared, reader, &mut reachable).await;

        // Teardown releases the transport completely; dropping both halves
        // closes the socket so nothing is ever left half-open.
        shared.writer.lock().await.take();
        shared.set_state(SessionState::Disconnected);
        shared.emit(SessionEvent::Disconnected);
        warn!("disconnected from broker, waiting before reconnecting");
        backoff(&shared, &mut reachable).await;
    }
}

/// Resolves the broker name, retrying with the reconnect backoff. Returns
/// `None` when the link drops or the application shuts down.
async fn resolve_broker(shared: &Shared, reachable: &mut Reachability) -> Option<SocketAddr> {
    let host = shared.config.broker_host.clone();
    let port = shared.config.broker_port;
    info!(%host, port, "resolving broker address");

    loop {
        tokio::select! {
            changed = reachable.changed() => {
                if changed.is_err() || !*reachable.borrow() {
                    return None;
                }
                // Link flapped back up; retry immediately.
            }
            resolved = lookup_host((host.as_str(), port)) => {
                match resolved {
                    Ok(mut addrs) => {
                        if let Some(addr) = addrs.next() {
                            info!(%addr, "resolved broker address");
                            return Some(addr);
                        }
                        warn!(%host, "broker name resolved to no addresses");
                    }
                    Err(e) => warn!(%host, error = %e, "unable to resolve broker"),
                }
                if !backoff(shared, reachable).await {
                    return None;
                }
            }
        }
    }
}

/// Connects and performs the session handshake. Returns `None` on any
/// failure; the caller backs off and restarts the cycle from scratch.
async fn open_session(
    shared: &Shared,
    transport: &dyn Transport,
    addr: SocketAddr,
    reachable: &mut Reachability,
) -> Option<(SessionReader, WriteHalf<SessionStream>)> {
    let stream = tokio::select! {
        changed = reachable.changed() => {
            if changed.is_err() || !*reachable.borrow() {
                return None;
            }
            debug!("connectivity change during connect, restarting attempt");
            return None;
        }
        result = timeout(shared.config.connect_timeout, transport.connect(addr, &shared.config.broker_host, &shared.credentials)) => {
            match result {
                Ok(Ok(stream)) => stream,
                Ok(Err(e)) => {
                    warn!(%addr, error = %e, "unable to connect to broker");
                    return None;
                }
                Err(_) => {
                    warn!(%addr, "broker connect timed out");
                    return None;
                }
            }
        }
    };

    let (read_half, mut write_half) = tokio::io::split(stream);
    let connect = Frame::Connect {
        client_id: shared.identity.client_id.clone(),
    };
    if let Err(e) = write_frame(&mut write_half, &connect).await {
        warn!(error = %e, "unable to send session open request");
        return None;
    }

    let mut reader = BufReader::new(read_half).lines();
    let line = tokio::select! {
        changed = reachable.changed() => {
            if changed.is_err() || !*reachable.borrow() {
                return None;
            }
            debug!("connectivity change during handshake, restarting attempt");
            return None;
        }
        result = timeout(shared.config.handshake_timeout, reader.next_line()) => {
            match result {
                Ok(Ok(Some(line))) => line,
                Ok(Ok(None)) => {
                    warn!("broker closed the connection during handshake");
                    return None;
                }
                Ok(Err(e)) => {
                    warn!(error = %e, "socket error during handshake");
                    return None;
                }
                Err(_) => {
                    warn!("session acknowledgement timed out");
                    return None;
                }
            }
        }
    };

    match decode_frame(&line) {
        Ok(Frame::ConnAck { accepted: true }) => Some((reader, write_half)),
        Ok(Frame::ConnAck { accepted: false }) => {
            warn!("broker refused the session");
            None
        }
        Ok(other) => {
            warn!(?other, "unexpected frame instead of session acknowledgement");
            None
        }
        Err(e) => {
            warn!(error = %e, "undecodable session acknowledgement");
            None
        }
    }
}

/// Serves an established session until the link drops, the socket errors,
/// or the broker disconnects.
async fn run_session(shared: &Shared, mut reader: SessionReader, reachable: &mut Reachability) {
    loop {
        tokio::select! {
            changed = reachable.changed() => {
                if changed.is_err() || !*reachable.borrow() {
                    info!("link lost, tearing down session");
                    return;
                }
            }
            result = timeout(shared.config.poll_interval, reader.next_line()) => {
                let line = match result {
                    // Idle poll cycle; loop back so link loss is noticed.
                    Err(_) => continue,
                    Ok(Ok(Some(line))) => line,
                    Ok(Ok(None)) => {
                        warn!("broker closed the connection");
                        return;
                    }
                    Ok(Err(e)) => {
                        warn!(error = %e, "socket error while waiting for broker data");
                        return;
                    }
                };
                match decode_frame(&line) {
                    Ok(frame) => {
                        if dispatch_frame(shared, frame).await.is_break() {
                            return;
                        }
                    }
                    Err(e) => warn!(error = %e, "ignoring undecodable frame"),
                }
            }
        }
    }
}

async fn dispatch_frame(shared: &Shared, frame: Frame) -> ControlFlow<()> {
    match frame {
        Frame::PubAck { id, success } => {
            if success {
                debug!(message_id = id, "publish acknowledged");
            } else {
                warn!(message_id = id, "broker rejected publish");
            }
            shared.emit(SessionEvent::PublishResult {
                message_id: id,
                success,
            });
        }
        Frame::Publish {
            id,
            topic,
            qos,
            payload,
        } => {
            debug!(message_id = id, %topic, "inbound publish from broker");
            if qos == QoS::AtLeastOnce {
                let mut guard = shared.writer.lock().await;
                if let Some(writer) = guard.as_mut() {
                    if let Err(e) = write_frame(writer, &Frame::PubAck { id, success: true }).await {
                        warn!(error = %e, "unable to acknowledge inbound publish");
                        return ControlFlow::Break(());
                    }
                }
            }
            shared.emit(SessionEvent::Inbound { topic, payload });
        }
        Frame::Disconnect => {
            info!("broker requested disconnect");
            return ControlFlow::Break(());
        }
        Frame::ConnAck { .. } => debug!("ignoring duplicate session acknowledgement"),
        Frame::Connect { .. } => debug!("ignoring client-bound connect frame"),
    }
    ControlFlow::Continue(())
}

/// Sleeps the reconnect interval, waking early on link loss or shutdown.
/// Returns whether the link is still usable.
async fn backoff(shared: &Shared, reachable: &mut Reachability) -> bool {
    if !*reachable.borrow() {
        return false;
    }
    let wait = sleep(shared.config.reconnect_interval);
    tokio::pin!(wait);
    loop {
        tokio::select! {
            () = &mut wait => return *reachable.borrow(),
            changed = reachable.changed() => {
                if changed.is_err() || !*reachable.borrow() {
                    return false;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::credentials::tests::demo_material;

    fn test_client() -> (TelemetryClient, mpsc::Receiver<SessionEvent>) {
        TelemetryClient::initialize(
            ClientConfig::new("broker.invalid", 1883),
            DeviceIdentity::new("wind_turbine_demo"),
            &demo_material(),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn publish_is_gated_before_any_session_exists() {
        let (client, _events) = test_client();
        assert_eq!(client.state(), SessionState::Disconnected);

        let err = client
            .publish_telemetry("{\"alert\":{}}", QoS::AtLeastOnce)
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::NotConnected));
    }

    #[tokio::test]
    async fn message_ids_skip_zero_on_wrap() {
        let (client, _events) = test_client();
        client.shared.next_message_id.store(u16::MAX, Ordering::Relaxed);
        assert_eq!(client.shared.next_message_id(), u16::MAX);
        // The counter wrapped to zero, which is reserved.
        assert_eq!(client.shared.next_message_id(), 1);
    }

    #[test]
    fn malformed_material_fails_initialization() {
        let mut material = demo_material();
        material.private_key_pem = b"garbage".to_vec();
        let result = TelemetryClient::initialize(
            ClientConfig::new("broker.invalid", 1883),
            DeviceIdentity::new("wind_turbine_demo"),
            &material,
        );
        assert!(matches!(result, Err(ClientError::Credential(_))));
    }
}
