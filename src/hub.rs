use std::fmt::{Debug, Formatter};
use std::sync::Arc;

use anyhow::bail;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use rustc_hash::FxBuildHasher;
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

use crate::call::outbound_context::OutboundContext;
use crate::config::RpcConfig;
use crate::error::{RpcError, RpcResult};
use crate::message::arguments::ArgumentList;
use crate::message::rpc_message::MethodRef;
use crate::message::serializer::{ArgumentSerializer, CompactArgumentSerializer};
use crate::message::value::RpcValue;
use crate::method::registry::ServiceRegistry;
use crate::peer::connection::{DelayedConnector, PeerConnector, PeerConnectorFactory, RpcConnection, ServerConnector};
use crate::peer::rpc_peer::RpcPeer;
use crate::routing::router::{PeerRef, RpcRouter};
use crate::system::system_call_sender::SystemCallSender;
use crate::system::system_calls::system_service;
use crate::util::random::jittered_period;

/// The root object of an RPC endpoint. A hub owns the configuration, the service registry and
///  the serializer shared by all of its peers, and the peers themselves, keyed by peer ref.
///
/// Client peers are created on demand when a call is routed to them, server peers when a
///  connection is accepted for them. A peer is removed when it stops, or when its route becomes
///  obsolete.
pub struct RpcHub {
    pub id: Uuid,
    pub config: Arc<RpcConfig>,
    pub registry: Arc<ServiceRegistry>,
    pub serializer: Arc<dyn ArgumentSerializer>,
    pub system_calls: SystemCallSender,
    router: Arc<dyn RpcRouter>,
    connector_factory: Arc<dyn PeerConnectorFactory>,
    peers: DashMap<String, Arc<RpcPeer>, FxBuildHasher>,
    stop_token: CancellationToken,
}

impl RpcHub {
    /// The system service is added to `registry` here, it must not be registered by the caller
    pub fn new(config: RpcConfig, registry: ServiceRegistry, router: Arc<dyn RpcRouter>, connector_factory: Arc<dyn PeerConnectorFactory>) -> anyhow::Result<Arc<RpcHub>> {
        config.validate()?;

        let registry = registry.with(system_service())?;
        let serializer: Arc<dyn ArgumentSerializer> = Arc::new(CompactArgumentSerializer::default());
        let system_calls = SystemCallSender::new(&registry, serializer.clone())?;

        let hub = Arc::new(RpcHub {
            id: Uuid::new_v4(),
            config: Arc::new(config),
            registry: Arc::new(registry),
            serializer,
            system_calls,
            router,
            connector_factory,
            peers: DashMap::with_hasher(FxBuildHasher),
            stop_token: CancellationToken::new(),
        });
        debug!(hub = ?hub.id, "created");
        Ok(hub)
    }

    pub fn router(&self) -> &Arc<dyn RpcRouter> {
        &self.router
    }

    pub fn is_stopping(&self) -> bool {
        self.stop_token.is_cancelled()
    }

    /// Returns the peer for a peer ref, creating and starting it if necessary. A registered peer
    ///  whose route is obsolete is replaced by a fresh one.
    pub fn get_peer(self: &Arc<Self>, peer_ref: &PeerRef) -> RpcResult<Arc<RpcPeer>> {
        if self.is_stopping() {
            return Err(RpcError::disconnected(peer_ref));
        }
        if peer_ref.is_obsolete() {
            return Err(RpcError::Reroute);
        }

        let (peer, is_new) = match self.peers.entry(peer_ref.key()) {
            Entry::Occupied(mut e) => {
                if e.get().peer_ref.is_obsolete() {
                    let peer = self.create_peer(peer_ref);
                    e.insert(peer.clone());
                    (peer, true)
                }
                else {
                    (e.get().clone(), false)
                }
            }
            Entry::Vacant(e) => {
                let peer = self.create_peer(peer_ref);
                e.insert(peer.clone());
                (peer, true)
            }
        };

        if is_new {
            peer.start();
        }
        Ok(peer)
    }

    fn create_peer(self: &Arc<Self>, peer_ref: &PeerRef) -> Arc<RpcPeer> {
        let connector: Arc<dyn PeerConnector> = if peer_ref.parsed.is_server() {
            Arc::new(ServerConnector::new())
        }
        else {
            let inner = self.connector_factory.create(peer_ref);
            Arc::new(DelayedConnector::new(inner, &self.config))
        };
        debug!(peer = ?peer_ref, "creating peer");
        RpcPeer::new(self.clone(), peer_ref.clone(), connector)
    }

    pub fn peer(&self, key: &str) -> Option<Arc<RpcPeer>> {
        self.peers.get(key)
            .map(|e| e.value().clone())
    }

    pub fn peers(&self) -> Vec<Arc<RpcPeer>> {
        self.peers.iter()
            .map(|e| e.value().clone())
            .collect()
    }

    /// Hands a connection a client established to the server peer for `peer_ref`. Any previous
    ///  connection of that peer is dropped in favour of the new one.
    pub fn accept(self: &Arc<Self>, peer_ref: &PeerRef, connection: RpcConnection) -> anyhow::Result<()> {
        if !peer_ref.parsed.is_server() {
            bail!("{:?} is not a server peer ref", peer_ref);
        }
        let peer = self.get_peer(peer_ref)?;
        peer.disconnect(None);
        peer.accept(connection)
    }

    /// NB: only removes this exact instance, not a peer that replaced it under the same key
    pub fn remove_peer(&self, peer: &RpcPeer) {
        let removed = self.peers.remove_if(&peer.peer_ref.key(), |_, p| std::ptr::eq(p.as_ref(), peer));
        if removed.is_some() {
            debug!(peer = ?peer.peer_ref, "removed peer");
        }
    }

    /// Calls a registered method, routing it by method and arguments
    pub async fn call_method(self: &Arc<Self>, service: &str, method: &str, arguments: ArgumentList) -> RpcResult<RpcValue> {
        let method_ref = MethodRef::new(service, method);
        let method = self.registry.method(&method_ref)
            .ok_or_else(|| RpcError::EndpointNotFound {
                service: method_ref.service.clone(),
                method: method_ref.method.clone(),
            })?;
        self.call(OutboundContext::new(method, arguments)).await
    }

    /// Performs a call. A call whose route changes while it is in flight is transparently
    ///  reattempted against the new target after `reroute_delay`, so [RpcError::Reroute] never
    ///  reaches the caller.
    pub async fn call(self: &Arc<Self>, mut context: OutboundContext) -> RpcResult<RpcValue> {
        let mut call = context.prepare_call(self);
        loop {
            let result = match call {
                Ok(call) => call.invoke().await,
                Err(e) => Err(e),
            };
            match result {
                Err(RpcError::Reroute) => {}
                result => return result,
            }

            debug!(method = ?context.method, "rerouting call");
            tokio::select! {
                _ = time::sleep(jittered_period(self.config.reroute_delay)) => {}
                _ = context.cancellation.cancelled() => return Err(RpcError::Cancelled),
                _ = self.stop_token.cancelled() => return Err(RpcError::Cancelled),
            }
            call = context.prepare_rerouted_call(self);
        }
    }

    /// Stops all peers. Calls in flight fail, and no new peers are created afterwards.
    pub async fn stop(&self) {
        if self.stop_token.is_cancelled() {
            return;
        }
        info!(hub = ?self.id, "stopping");
        self.stop_token.cancel();

        for peer in self.peers() {
            peer.stop().await;
        }
        self.peers.clear();
    }
}

impl Debug for RpcHub {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "RpcHub({:?})", self.id)
    }
}


#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::message::peer_ref::ParsedRpcPeerRef;
    use crate::routing::router::{MockRpcRouter, TableRouter};
    use crate::test_util::{test_hub, test_peer_ref, test_registry, PendingConnectorFactory, TestRpcPair};

    #[tokio::test]
    async fn test_get_peer_is_cached() {
        let hub = test_hub();
        let peer_ref = test_peer_ref();
        let a = hub.get_peer(&peer_ref).unwrap();
        let b = hub.get_peer(&peer_ref).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert!(hub.peer(&peer_ref.key()).is_some());

        a.stop().await;
        assert!(hub.peer(&peer_ref.key()).is_none());
        let c = hub.get_peer(&peer_ref).unwrap();
        assert!(!Arc::ptr_eq(&a, &c));
    }

    #[tokio::test]
    async fn test_stopped_hub_creates_no_peers() {
        let hub = test_hub();
        hub.get_peer(&test_peer_ref()).unwrap();
        hub.stop().await;
        assert!(hub.peers().is_empty());
        assert!(matches!(hub.get_peer(&test_peer_ref()), Err(RpcError::Disconnected { .. })));
    }

    #[tokio::test]
    async fn test_accept_requires_server_ref() {
        let hub = test_hub();
        let (connection, _) = crate::peer::connection::connection_pair(1);
        assert!(hub.accept(&test_peer_ref(), connection).is_err());
    }

    #[tokio::test]
    async fn test_obsolete_peer_is_replaced() {
        let hub = test_hub();
        let router = TableRouter::new(ParsedRpcPeerRef::parse("remote.compact://a").unwrap());
        let method = hub.registry.method(&MethodRef::new("Calc", "add")).unwrap();
        let args = ArgumentList::empty();

        let old_ref = router.route(&method, &args).unwrap();
        let old_peer = hub.get_peer(&old_ref).unwrap();
        router.set_default(ParsedRpcPeerRef::parse("remote.compact://b").unwrap());
        router.set_default(ParsedRpcPeerRef::parse("remote.compact://a").unwrap());
        assert!(matches!(hub.get_peer(&old_ref), Err(RpcError::Reroute)));

        let new_ref = router.route(&method, &args).unwrap();
        let new_peer = hub.get_peer(&new_ref).unwrap();
        assert!(!Arc::ptr_eq(&old_peer, &new_peer));

        hub.remove_peer(&old_peer);
        assert!(hub.peer(&new_ref.key()).is_some());
    }

    #[tokio::test]
    async fn test_routing_error_is_returned() {
        let mut router = MockRpcRouter::new();
        router.expect_route()
            .times(1)
            .returning(|_, _| Err(RpcError::Internal("no route".to_string())));
        let hub = RpcHub::new(RpcConfig::new(), test_registry(), Arc::new(router), Arc::new(PendingConnectorFactory {})).unwrap();

        let result = hub.call_method("Calc", "add", ArgumentList::new(vec![1i64.into(), 2i64.into()])).await;
        assert_eq!(result, Err(RpcError::Internal("no route".to_string())));
        assert!(hub.peers().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_call_through_pair() {
        let pair = TestRpcPair::new();
        let result = pair.client.call_method("Calc", "add", ArgumentList::new(vec![20i64.into(), 22i64.into()])).await;
        assert_eq!(result, Ok(RpcValue::I64(42)));

        let result = pair.client.call_method("Calc", "nope", ArgumentList::empty()).await;
        assert!(matches!(result, Err(RpcError::EndpointNotFound { .. })));
        pair.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_call_is_rerouted_when_route_changes() {
        let pair = TestRpcPair::new();
        pair.set_online(false);

        let call = {
            let client = pair.client.clone();
            tokio::spawn(async move {
                client.call_method("Calc", "add", ArgumentList::new(vec![1i64.into(), 2i64.into()])).await
            })
        };
        time::sleep(Duration::from_millis(50)).await;
        assert!(!call.is_finished());

        pair.router.set_default(ParsedRpcPeerRef::parse("remote.compact://server-2").unwrap());
        pair.set_online(true);
        assert_eq!(call.await.unwrap(), Ok(RpcValue::I64(3)));
        pair.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_call_cancelled_while_waiting_for_reroute() {
        let pair = TestRpcPair::new();
        pair.set_online(false);

        let cancellation = CancellationToken::new();
        let call = {
            let client = pair.client.clone();
            let method = client.registry.method(&MethodRef::new("Calc", "add")).unwrap();
            let context = OutboundContext::new(method, ArgumentList::new(vec![1i64.into(), 2i64.into()]))
                .with_cancellation(cancellation.clone());
            tokio::spawn(async move { client.call(context).await })
        };
        time::sleep(Duration::from_millis(50)).await;
        cancellation.cancel();
        assert_eq!(call.await.unwrap(), Err(RpcError::Cancelled));
        pair.stop().await;
    }
}
