//! In-process broker speaking the client's wire protocol.
//!
//! Backs the integration tests and the `--local-broker` demo mode. It accepts
//! sessions, acknowledges connects and at-least-once publishes, records
//! everything published and can misbehave on demand (hold the session
//! acknowledgement, drop live connections) so reconnect handling can be
//! exercised deterministically.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU16, AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::io::AsyncBufReadExt;
use tokio::io::BufReader;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::client::wire::{decode_frame, write_frame, Frame, QoS};

#[derive(Debug, Clone)]
pub struct BrokerConfig {
    pub bind_addr: SocketAddr,
    /// When set, never answer a session open request. Clients stall in their
    /// handshake until their own bound fires.
    pub hold_connack: bool,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            // Port 0 lets the OS pick; tests read the bound address back.
            bind_addr: ([127, 0, 0, 1], 0).into(),
            hold_connack: false,
        }
    }
}

/// One message a client published, as the broker recorded it.
#[derive(Debug, Clone, PartialEq)]
pub struct PublishedMessage {
    pub topic: String,
    pub qos: QoS,
    pub payload: String,
}

struct SessionHandle {
    writer: Arc<Mutex<OwnedWriteHalf>>,
    task: JoinHandle<()>,
}

struct BrokerInner {
    hold_connack: bool,
    published: Mutex<Vec<PublishedMessage>>,
    published_notify: Notify,
    connections_accepted: AtomicUsize,
    sessions: Mutex<Vec<SessionHandle>>,
    next_push_id: AtomicU16,
}

pub struct StubBroker {
    addr: SocketAddr,
    inner: Arc<BrokerInner>,
    accept_task: JoinHandle<()>,
}

impl StubBroker {
    pub async fn start(config: BrokerConfig) -> io::Result<Self> {
        let listener = TcpListener::bind(config.bind_addr).await?;
        let addr = listener.local_addr()?;
        info!(%addr, "broker listening");

        let inner = Arc::new(BrokerInner {
            hold_connack: config.hold_connack,
            published: Mutex::new(Vec::new()),
            published_notify: Notify::new(),
            connections_accepted: AtomicUsize::new(0),
            sessions: Mutex::new(Vec::new()),
            next_push_id: AtomicU16::new(1),
        });

        let accept_inner = Arc::clone(&inner);
        let accept_task = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, peer)) => {
                        debug!(%peer, "session accepted");
                        accept_inner
                            .connections_accepted
                            .fetch_add(1, Ordering::Relaxed);
                        let session_inner = Arc::clone(&accept_inner);
                        register_session(session_inner, stream).await;
                    }
                    Err(e) => {
                        warn!(error = %e, "accept failed, broker stopping");
                        return;
                    }
                }
            }
        });

        Ok(Self {
            addr,
            inner,
            accept_task,
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Sessions accepted so far, including ones since closed.
    pub fn connections_accepted(&self) -> usize {
        self.inner.connections_accepted.load(Ordering::Relaxed)
    }

    pub async fn published(&self) -> Vec<PublishedMessage> {
        self.inner.published.lock().await.clone()
    }

    /// Waits until at least `count` messages have been recorded and returns
    /// them. Callers bound this with a timeout.
    pub async fn wait_for_published(&self, count: usize) -> Vec<PublishedMessage> {
        loop {
            let notified = self.inner.published_notify.notified();
            {
                let published = self.inner.published.lock().await;
                if published.len() >= count {
                    return published.clone();
                }
            }
            notified.await;
        }
    }

    /// Pushes a publish frame to every live session.
    pub async fn push(&self, topic: &str, qos: QoS, payload: &str) {
        let id = self.inner.next_push_id.fetch_add(1, Ordering::Relaxed);
        let frame = Frame::Publish {
            id,
            topic: topic.to_string(),
            qos,
            payload: payload.to_string(),
        };
        self.broadcast(&frame).await;
    }

    /// Sends an orderly disconnect to every live session.
    pub async fn send_disconnect(&self) {
        self.broadcast(&Frame::Disconnect).await;
    }

    async fn broadcast(&self, frame: &Frame) {
        let sessions = self.inner.sessions.lock().await;
        for session in sessions.iter() {
            let mut writer = session.writer.lock().await;
            if let Err(e) = write_frame(&mut *writer, frame).await {
                debug!(error = %e, "broadcast to closed session skipped");
            }
        }
    }

    /// Tears down every live session without a disconnect frame; clients see
    /// a socket error or EOF.
    pub async fn drop_connections(&self) {
        let mut sessions = self.inner.sessions.lock().await;
        for session in sessions.drain(..) {
            session.task.abort();
        }
    }

    pub async fn shutdown(self) {
        self.accept_task.abort();
        self.drop_connections().await;
    }
}

async fn register_session(inner: Arc<BrokerInner>, stream: TcpStream) {
    let (read_half, write_half) = stream.into_split();
    let writer = Arc::new(Mutex::new(write_half));

    let task_inner = Arc::clone(&inner);
    let task_writer = Arc::clone(&writer);
    let task = tokio::spawn(async move {
        serve_session(task_inner, read_half, task_writer).await;
    });

    inner
        .sessions
        .lock()
        .await
        .push(SessionHandle { writer, task });
}

async fn serve_session(
    inner: Arc<BrokerInner>,
    read_half: tokio::net::tcp::OwnedReadHalf,
    writer: Arc<Mutex<OwnedWriteHalf>>,
) {
    let mut lines = BufReader::new(read_half).lines();

    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => {
                debug!("session closed by client");
                break;
            }
            Err(e) => {
                debug!(error = %e, "session socket error");
                break;
            }
        };

        let frame = match decode_frame(&line) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(error = %e, "ignoring undecodable frame from client");
                continue;
            }
        };

        match frame {
            Frame::Connect { client_id } => {
                if inner.hold_connack {
                    debug!(%client_id, "holding session acknowledgement");
                    continue;
                }
                info!(%client_id, "session opened");
                let ack = Frame::ConnAck { accepted: true };
                let mut guard = writer.lock().await;
                if write_frame(&mut *guard, &ack).await.is_err() {
                    break;
                }
            }
            Frame::Publish {
                id,
                topic,
                qos,
                payload,
            } => {
                debug!(message_id = id, %topic, "publish received");
                {
                    let mut published = inner.published.lock().await;
                    published.push(PublishedMessage {
                        topic,
                        qos,
                        payload,
                    });
                }
                inner.published_notify.notify_waiters();
                if qos == QoS::AtLeastOnce {
                    let ack = Frame::PubAck { id, success: true };
                    let mut guard = writer.lock().await;
                    if write_frame(&mut *guard, &ack).await.is_err() {
                        break;
                    }
                }
            }
            Frame::Disconnect => {
                info!("client disconnected");
                break;
            }
            Frame::ConnAck { .. } | Frame::PubAck { .. } => {
                debug!("ignoring broker-bound frame from client");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::net::TcpStream;
    use tokio::time::timeout;

    async fn open(addr: SocketAddr) -> (tokio::io::Lines<BufReader<tokio::net::tcp::OwnedReadHalf>>, OwnedWriteHalf) {
        let stream = TcpStream::connect(addr).await.unwrap();
        let (read_half, write_half) = stream.into_split();
        (BufReader::new(read_half).lines(), write_half)
    }

    #[tokio::test]
    async fn accepts_session_and_acknowledges_publish() {
        let broker = StubBroker::start(BrokerConfig::default()).await.unwrap();
        let (mut lines, mut writer) = open(broker.addr()).await;

        write_frame(
            &mut writer,
            &Frame::Connect {
                client_id: "dev1".into(),
            },
        )
        .await
        .unwrap();
        let ack = decode_frame(&lines.next_line().await.unwrap().unwrap()).unwrap();
        assert_eq!(ack, Frame::ConnAck { accepted: true });

        write_frame(
            &mut writer,
            &Frame::Publish {
                id: 7,
                topic: "device/dev1/telemetries".into(),
                qos: QoS::AtLeastOnce,
                payload: "{}".into(),
            },
        )
        .await
        .unwrap();
        let ack = decode_frame(&lines.next_line().await.unwrap().unwrap()).unwrap();
        assert_eq!(
            ack,
            Frame::PubAck {
                id: 7,
                success: true
            }
        );

        let published = broker.wait_for_published(1).await;
        assert_eq!(published[0].topic, "device/dev1/telemetries");
        assert_eq!(broker.connections_accepted(), 1);
        broker.shutdown().await;
    }

    #[tokio::test]
    async fn held_connack_never_answers() {
        let config = BrokerConfig {
            hold_connack: true,
            ..BrokerConfig::default()
        };
        let broker = StubBroker::start(config).await.unwrap();
        let (mut lines, mut writer) = open(broker.addr()).await;

        write_frame(
            &mut writer,
            &Frame::Connect {
                client_id: "dev1".into(),
            },
        )
        .await
        .unwrap();
        let answer = timeout(Duration::from_millis(100), lines.next_line()).await;
        assert!(answer.is_err());
        broker.shutdown().await;
    }
}
