use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::bail;
use async_trait::async_trait;
use parking_lot::Mutex;

use crate::config::RpcConfig;
use crate::hub::RpcHub;
use crate::message::peer_ref::ParsedRpcPeerRef;
use crate::message::rpc_message::RpcMessage;
use crate::peer::connection::{connection_pair, PeerConnector, PeerConnectorFactory, RpcConnection};
use crate::peer::rpc_peer::RpcPeer;
use crate::routing::router::{PeerRef, RpcRouter, StaticRouter, TableRouter};
use crate::test_util::{test_registry, PendingConnectorFactory};

const CHANNEL_CAPACITY: usize = 256;

/// The state shared between a pair and the connectors of its client hub
struct PairLink {
    server: Mutex<Arc<RpcHub>>,
    is_online: AtomicBool,
    /// every message the client sent to the server, in order
    client_messages: Mutex<Vec<RpcMessage>>,
}

impl PairLink {
    fn server_peer_ref() -> PeerRef {
        PeerRef::new(ParsedRpcPeerRef::parse("remote.server.compact://test-client").expect("valid peer ref"))
    }

    /// Connects the client end to the server end through a relay that records the client's
    ///  messages
    fn relay(self: &Arc<Self>) -> (RpcConnection, RpcConnection) {
        let (client, client_relay) = connection_pair(CHANNEL_CAPACITY);
        let (server_relay, server) = connection_pair(CHANNEL_CAPACITY);

        let RpcConnection { sender: to_client, receiver: mut from_client } = client_relay;
        let RpcConnection { sender: to_server, receiver: mut from_server } = server_relay;

        let link = self.clone();
        tokio::spawn(async move {
            while let Some(message) = from_client.recv().await {
                link.client_messages.lock().push(message.clone());
                if to_server.send(message).await.is_err() {
                    break;
                }
            }
        });
        tokio::spawn(async move {
            while let Some(message) = from_server.recv().await {
                if to_client.send(message).await.is_err() {
                    break;
                }
            }
        });
        (client, server)
    }
}

struct PairConnector {
    link: Arc<PairLink>,
}

#[async_trait]
impl PeerConnector for PairConnector {
    async fn connect(&self, _peer_ref: &PeerRef, _try_index: u32) -> anyhow::Result<RpcConnection> {
        if !self.link.is_online.load(Ordering::Acquire) {
            bail!("test pair is offline");
        }
        let (client, server) = self.link.relay();
        let server_hub = self.link.server.lock().clone();
        server_hub.accept(&PairLink::server_peer_ref(), server)?;
        Ok(client)
    }
}

struct PairConnectorFactory {
    link: Arc<PairLink>,
}

impl PeerConnectorFactory for PairConnectorFactory {
    fn create(&self, _peer_ref: &PeerRef) -> Arc<dyn PeerConnector> {
        Arc::new(PairConnector { link: self.link.clone() })
    }
}

/// A client hub and a server hub connected in memory. Every client peer connects to the current
///  server hub, regardless of its peer ref, so the client's routing can be changed freely through
///  [TestRpcPair::router].
pub struct TestRpcPair {
    pub client: Arc<RpcHub>,
    pub router: Arc<TableRouter>,
    link: Arc<PairLink>,
}

impl TestRpcPair {
    pub fn new() -> TestRpcPair {
        TestRpcPair::with_config(RpcConfig::new())
    }

    pub fn with_config(config: RpcConfig) -> TestRpcPair {
        let link = Arc::new(PairLink {
            server: Mutex::new(Self::new_server(&config)),
            is_online: AtomicBool::new(true),
            client_messages: Mutex::new(Vec::new()),
        });

        let router = Arc::new(TableRouter::new(ParsedRpcPeerRef::parse("remote.compact://server-1").expect("valid peer ref")));
        let client_router: Arc<dyn RpcRouter> = router.clone();
        let client = RpcHub::new(config, test_registry(), client_router, Arc::new(PairConnectorFactory { link: link.clone() }))
            .expect("valid client hub");

        TestRpcPair { client, router, link }
    }

    fn new_server(config: &RpcConfig) -> Arc<RpcHub> {
        let router: Arc<dyn RpcRouter> = Arc::new(StaticRouter::new(PairLink::server_peer_ref().parsed));
        RpcHub::new(config.clone(), test_registry(), router, Arc::new(PendingConnectorFactory {}))
            .expect("valid server hub")
    }

    pub fn server(&self) -> Arc<RpcHub> {
        self.link.server.lock().clone()
    }

    /// The server's peer representing the client, once the client connected
    pub fn server_peer(&self) -> Option<Arc<RpcPeer>> {
        self.server().peer(&PairLink::server_peer_ref().key())
    }

    pub fn client_peers(&self) -> Vec<Arc<RpcPeer>> {
        self.client.peers()
    }

    /// All messages the client sent so far
    pub fn client_messages(&self) -> Vec<RpcMessage> {
        self.link.client_messages.lock().clone()
    }

    /// Drops all connections. The client reconnects right away if the pair is online.
    pub fn disconnect(&self) {
        for peer in self.client.peers() {
            peer.disconnect(None);
        }
        for peer in self.server().peers() {
            peer.disconnect(None);
        }
    }

    /// Going offline drops all connections and makes reconnect attempts fail until the pair is
    ///  online again
    pub fn set_online(&self, is_online: bool) {
        self.link.is_online.store(is_online, Ordering::Release);
        if !is_online {
            self.disconnect();
        }
    }

    /// Replaces the server hub with a new one, which the client sees as a changed remote peer
    ///  when it reconnects
    pub async fn switch_server(&self) {
        let config = self.client.config.as_ref().clone();
        let previous = std::mem::replace(&mut *self.link.server.lock(), Self::new_server(&config));
        previous.stop().await;
        self.disconnect();
    }

    pub async fn stop(&self) {
        self.client.stop().await;
        self.server().stop().await;
    }
}

impl Default for TestRpcPair {
    fn default() -> Self {
        TestRpcPair::new()
    }
}
