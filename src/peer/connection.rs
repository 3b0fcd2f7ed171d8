use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{anyhow, bail};
use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, trace};

use crate::config::RpcConfig;
use crate::message::rpc_message::RpcMessage;
use crate::routing::router::PeerRef;
use crate::util::backoff::ReconnectDelayer;

/// One side of a duplex message channel. Framing and the wire transport are the connector's
///  business: the peer only ever sees whole messages.
#[derive(Debug)]
pub struct RpcConnection {
    pub sender: mpsc::Sender<RpcMessage>,
    pub receiver: mpsc::Receiver<RpcMessage>,
}

/// Creates two connected in-memory connection ends
pub fn connection_pair(capacity: usize) -> (RpcConnection, RpcConnection) {
    let (a_tx, a_rx) = mpsc::channel(capacity);
    let (b_tx, b_rx) = mpsc::channel(capacity);
    (
        RpcConnection { sender: a_tx, receiver: b_rx },
        RpcConnection { sender: b_tx, receiver: a_rx },
    )
}

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// The sending half of an established connection, as published in the peer's connection state.
///  The id distinguishes connection generations: a call is sent at most once per connection.
#[derive(Debug)]
pub struct ConnectionHandle {
    pub id: u64,
    sender: mpsc::Sender<RpcMessage>,
}

impl ConnectionHandle {
    pub fn new(id: u64, sender: mpsc::Sender<RpcMessage>) -> ConnectionHandle {
        ConnectionHandle { id, sender }
    }

    pub fn with_next_id(sender: mpsc::Sender<RpcMessage>) -> ConnectionHandle {
        ConnectionHandle::new(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed), sender)
    }

    /// returns `false` if the connection is closed
    pub async fn send(&self, message: RpcMessage) -> bool {
        trace!(connection = self.id, method = ?message.method, related_id = message.related_id, "sending");
        self.sender.send(message).await.is_ok()
    }

    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }
}

#[cfg_attr(test, automock)]
#[async_trait]
pub trait PeerConnector : Send + Sync {
    /// Establishes a connection to the peer. `try_index` is the number of consecutive failed
    ///  attempts so far, connectors use it to back off.
    async fn connect(&self, peer_ref: &PeerRef, try_index: u32) -> anyhow::Result<RpcConnection>;

    /// hands an inbound connection to a server-side peer
    fn accept(&self, _connection: RpcConnection) -> anyhow::Result<()> {
        bail!("this peer does not accept connections")
    }
}

pub trait PeerConnectorFactory : Send + Sync {
    fn create(&self, peer_ref: &PeerRef) -> Arc<dyn PeerConnector>;
}

/// Wraps a connector with exponential backoff between failed attempts
pub struct DelayedConnector {
    inner: Arc<dyn PeerConnector>,
    delayer: ReconnectDelayer,
}

impl DelayedConnector {
    pub fn new(inner: Arc<dyn PeerConnector>, config: &RpcConfig) -> DelayedConnector {
        DelayedConnector {
            inner,
            delayer: ReconnectDelayer::new(config),
        }
    }
}

#[async_trait]
impl PeerConnector for DelayedConnector {
    async fn connect(&self, peer_ref: &PeerRef, try_index: u32) -> anyhow::Result<RpcConnection> {
        let delay = self.delayer.delay(try_index);
        if !delay.is_zero() {
            debug!(?peer_ref, try_index, ?delay, "delaying reconnect");
            tokio::time::sleep(delay).await;
        }
        self.inner.connect(peer_ref, try_index).await
    }
}

/// The connector of server-side peers: 'connecting' means waiting for the client to connect
pub struct ServerConnector {
    sender: mpsc::UnboundedSender<RpcConnection>,
    receiver: Mutex<mpsc::UnboundedReceiver<RpcConnection>>,
}

impl ServerConnector {
    pub fn new() -> ServerConnector {
        let (sender, receiver) = mpsc::unbounded_channel();
        ServerConnector {
            sender,
            receiver: Mutex::new(receiver),
        }
    }
}

impl Default for ServerConnector {
    fn default() -> Self {
        ServerConnector::new()
    }
}

#[async_trait]
impl PeerConnector for ServerConnector {
    async fn connect(&self, _peer_ref: &PeerRef, _try_index: u32) -> anyhow::Result<RpcConnection> {
        self.receiver.lock().await
            .recv().await
            .ok_or_else(|| anyhow!("server connector is closed"))
    }

    fn accept(&self, connection: RpcConnection) -> anyhow::Result<()> {
        self.sender.send(connection)
            .map_err(|_| anyhow!("server connector is closed"))
    }
}
