use std::fmt::{Debug, Formatter};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{debug, debug_span, error, info, trace, warn, Instrument};
use uuid::Uuid;

use crate::call::inbound_call::InboundCall;
use crate::call::inbound_tracker::InboundCallTracker;
use crate::call::outbound_tracker::OutboundCallTracker;
use crate::config::PeerStopMode;
use crate::error::{RpcError, RpcResult};
use crate::hub::RpcHub;
use crate::message::arguments::ArgumentList;
use crate::message::rpc_message::{well_known_headers, CallTypeId, RpcMessage};
use crate::message::value::{RpcValue, StreamRef};
use crate::object::remote_objects::RemoteObjectTracker;
use crate::object::shared_objects::SharedObjectTracker;
use crate::peer::connection::{ConnectionHandle, PeerConnector, RpcConnection};
use crate::peer::connection_state::PeerConnectionState;
use crate::peer::handshake::{PeerChangeKind, RpcHandshake};
use crate::routing::router::PeerRef;
use crate::stream::remote_stream::RemoteStream;
use crate::stream::shared_stream::{ItemSource, SharedStream};
use crate::system::system_calls::SystemMethodKind;

/// One logical remote endpoint. The peer owns the connection life cycle: it (re)connects through
///  its connector, exchanges handshakes, replays in-flight calls after a reconnect, and resets
///  everything bound to the remote process when that process changes.
pub struct RpcPeer {
    /// this side's identity towards the remote side, sent in every handshake
    pub id: Uuid,
    pub peer_ref: PeerRef,
    pub hub: Arc<RpcHub>,
    pub outbound_calls: OutboundCallTracker,
    pub inbound_calls: InboundCallTracker,
    pub shared_objects: SharedObjectTracker,
    pub remote_objects: RemoteObjectTracker,
    connector: Arc<dyn PeerConnector>,
    connection_state: watch::Sender<Arc<PeerConnectionState>>,
    /// cancelled and replaced whenever the remote peer changes
    peer_changed: Mutex<CancellationToken>,
    stop_token: CancellationToken,
    last_handshake_index: AtomicI64,
    is_started: AtomicBool,
}

impl RpcPeer {
    pub fn new(hub: Arc<RpcHub>, peer_ref: PeerRef, connector: Arc<dyn PeerConnector>) -> Arc<RpcPeer> {
        let (connection_state, _) = watch::channel(Arc::new(PeerConnectionState::default()));
        Arc::new(RpcPeer {
            id: Uuid::new_v4(),
            peer_ref,
            hub,
            outbound_calls: OutboundCallTracker::new(),
            inbound_calls: InboundCallTracker::new(),
            shared_objects: SharedObjectTracker::new(),
            remote_objects: RemoteObjectTracker::new(),
            connector,
            connection_state,
            peer_changed: Mutex::new(CancellationToken::new()),
            stop_token: CancellationToken::new(),
            last_handshake_index: AtomicI64::new(0),
            is_started: AtomicBool::new(false),
        })
    }

    pub fn connection_state(&self) -> Arc<PeerConnectionState> {
        self.connection_state.borrow().clone()
    }

    pub fn connection(&self) -> Option<Arc<ConnectionHandle>> {
        self.connection_state.borrow().connection.clone()
    }

    pub fn is_connected(&self) -> bool {
        self.connection_state.borrow().is_connected()
    }

    pub fn is_stopping(&self) -> bool {
        self.stop_token.is_cancelled()
    }

    /// Cancelled when the remote peer changes. Inbound calls are bound to it, since their results
    ///  can not be delivered to a different remote process.
    pub fn peer_changed_token(&self) -> CancellationToken {
        self.peer_changed.lock().clone()
    }

    /// Waits until the peer is connected. Fails with [RpcError::Reroute] if the peer's route
    ///  changed in the meantime, since it will never connect to the right target then.
    pub async fn when_connected(&self, timeout: Option<Duration>, cancellation: &CancellationToken) -> RpcResult<Arc<ConnectionHandle>> {
        let wait = async {
            let mut receiver = self.connection_state.subscribe();
            loop {
                let connection = receiver.borrow_and_update().connection.clone();
                if let Some(connection) = connection {
                    return Ok(connection);
                }
                if receiver.changed().await.is_err() {
                    return Err(RpcError::disconnected(&self.peer_ref));
                }
            }
        };
        let wait = async {
            match timeout {
                Some(timeout) => time::timeout(timeout, wait).await
                    .unwrap_or_else(|_| Err(RpcError::ConnectTimeout { peer: self.peer_ref.key() })),
                None => wait.await,
            }
        };

        tokio::select! {
            result = wait => result,
            _ = cancellation.cancelled() => Err(RpcError::Cancelled),
            _ = self.stop_token.cancelled() => Err(RpcError::disconnected(&self.peer_ref)),
            _ = self.peer_ref.when_obsolete() => Err(RpcError::Reroute),
        }
    }

    /// Sends on the current connection, returns `false` if there is none
    pub async fn send(&self, message: RpcMessage) -> bool {
        match self.connection() {
            Some(connection) => connection.send(message).await,
            None => {
                trace!(peer = ?self.peer_ref, method = ?message.method, "not connected, dropping message");
                false
            }
        }
    }

    /// Shares a stream with the remote side, returning the reference to pass in a call
    pub fn share_stream(self: &Arc<Self>, source: ItemSource) -> RpcResult<StreamRef> {
        let config = &self.hub.config;
        let stream = SharedStream::new(self.clone(), source, config.stream_ack_period, config.stream_ack_advance);
        self.shared_objects.register(stream.clone())?;
        Ok(stream.stream_ref())
    }

    /// The consumer end of a stream the remote side shared
    pub fn remote_stream(self: &Arc<Self>, stream_ref: StreamRef) -> Arc<RemoteStream> {
        RemoteStream::new(self.clone(), stream_ref)
    }

    /// Hands an inbound connection to a server-side peer
    pub fn accept(&self, connection: RpcConnection) -> anyhow::Result<()> {
        self.connector.accept(connection)
    }

    fn update_state(&self, f: impl FnOnce(&PeerConnectionState) -> Option<PeerConnectionState>) -> bool {
        self.connection_state.send_if_modified(|state| match f(state) {
            Some(next) => {
                *state = Arc::new(next);
                true
            }
            None => false,
        })
    }

    /// Drops the current connection. The run loop reconnects afterwards unless the peer is
    ///  stopping.
    pub fn disconnect(&self, error: Option<RpcError>) {
        let mut reader_abort = None;
        self.update_state(|state| {
            if !state.is_connected() {
                return None;
            }
            reader_abort = state.reader_abort.clone();
            Some(state.next_disconnected(error))
        });
        if let Some(reader_abort) = reader_abort {
            info!(peer = ?self.peer_ref, "disconnected");
            reader_abort.cancel();
        }
    }

    pub fn start(self: &Arc<Self>) {
        if self.is_started.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!(peer = ?self.peer_ref, id = ?self.id, "starting");

        let peer = self.clone();
        tokio::spawn(async move {
            peer.outbound_calls.maintain(&peer.hub.config, peer.stop_token.clone()).await
        });

        if self.peer_ref.can_be_rerouted() {
            let peer = self.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = peer.peer_ref.when_obsolete() => {}
                    _ = peer.stop_token.cancelled() => return,
                }
                info!(peer = ?peer.peer_ref, "route changed, rerouting");
                peer.hub.remove_peer(&peer);
                let num_rerouted = peer.outbound_calls.try_reroute();
                debug!(peer = ?peer.peer_ref, num_rerouted, "rerouted calls");
                peer.stop().await;
            });
        }

        let peer = self.clone();
        tokio::spawn(async move { peer.run().await });
    }

    /// Stops the peer for good: outbound calls fail, shared and remote objects are released, and
    ///  inbound calls are cancelled or left to complete (without sending their result) depending
    ///  on the configured [PeerStopMode]
    pub async fn stop(&self) {
        if self.stop_token.is_cancelled() {
            return;
        }
        info!(peer = ?self.peer_ref, "stopping");
        self.stop_token.cancel();
        self.hub.remove_peer(self);
        self.disconnect(None);

        let config = &self.hub.config;
        self.remote_objects.abort();
        self.shared_objects.abort(config).await;
        match config.peer_stop_mode {
            PeerStopMode::CancelInboundCalls => {
                self.peer_changed_token().cancel();
                self.inbound_calls.clear();
            }
            PeerStopMode::KeepInboundCallsIncomplete => self.inbound_calls.clear(),
        }
        let num_aborted = self.outbound_calls.abort(RpcError::disconnected(&self.peer_ref), config).await;
        debug!(peer = ?self.peer_ref, num_aborted, "stopped");
    }

    async fn run(self: Arc<Self>) {
        while !self.stop_token.is_cancelled() {
            let try_index = self.connection_state().try_index;
            let connection = tokio::select! {
                connection = self.connector.connect(&self.peer_ref, try_index) => connection,
                _ = self.stop_token.cancelled() => break,
            };
            let connection = match connection {
                Ok(connection) => connection,
                Err(e) => {
                    debug!(peer = ?self.peer_ref, try_index, "connect failed: {:#}", e);
                    self.update_state(|state| Some(state.next_disconnected(Some(RpcError::from(e)))));
                    continue;
                }
            };

            if let Some(error @ RpcError::ConnectionUnrecoverable(_)) = self.run_connection(connection).await {
                error!(peer = ?self.peer_ref, "{}", error);
                self.stop().await;
                break;
            }
        }
        debug!(peer = ?self.peer_ref, "run loop finished");
    }

    /// Serves a single connection until it is closed or aborted, returning the error it ended with
    async fn run_connection(self: &Arc<Self>, connection: RpcConnection) -> Option<RpcError> {
        let RpcConnection { sender, mut receiver } = connection;
        let handle = Arc::new(ConnectionHandle::with_next_id(sender));
        let own_handshake = RpcHandshake {
            remote_peer_id: self.id,
            remote_hub_id: self.hub.id,
            protocol_version: self.hub.config.protocol_version,
            index: self.last_handshake_index.fetch_add(1, Ordering::AcqRel) + 1,
        };

        let handshake = tokio::select! {
            handshake = time::timeout(self.hub.config.handshake_timeout, self.handshake(&handle, &mut receiver, &own_handshake)) => {
                handshake.unwrap_or(Err(RpcError::HandshakeTimeout))
            }
            _ = self.stop_token.cancelled() => return None,
        };
        let handshake = match handshake {
            Ok(handshake) => handshake,
            Err(e) => {
                warn!(peer = ?self.peer_ref, "handshake failed: {}", e);
                self.update_state(|state| Some(state.next_disconnected(Some(e.clone()))));
                return Some(e);
            }
        };

        let change = PeerChangeKind::detect(self.connection_state().handshake.as_ref(), &handshake);
        if change == PeerChangeKind::Changed {
            info!(peer = ?self.peer_ref, remote_peer_id = ?handshake.remote_peer_id, "remote peer changed");
            self.reset_for_new_remote_peer().await;
        }

        let reader_abort = self.stop_token.child_token();
        self.update_state(|state| Some(state.next_connected(handle.clone(), handshake.clone(), own_handshake.clone(), reader_abort.clone())));
        info!(peer = ?self.peer_ref, connection = handle.id, ?change, "connected");

        {
            let peer = self.clone();
            let abort = reader_abort.clone();
            tokio::spawn(async move { peer.shared_objects.maintain(&peer, abort).await });
        }
        {
            let peer = self.clone();
            let abort = reader_abort.clone();
            let remote_peer_id = handshake.remote_peer_id;
            tokio::spawn(async move { peer.remote_objects.maintain(&peer, remote_peer_id, abort).await });
        }
        {
            let peer = self.clone();
            let abort = reader_abort.clone();
            let handle = handle.clone();
            let handshake_index = handshake.index;
            tokio::spawn(async move {
                peer.outbound_calls.reconnect(&peer, &handle, handshake_index, change.is_changed(), &abort).await
            });
        }

        let error = loop {
            tokio::select! {
                message = receiver.recv() => match message {
                    Some(message) => self.on_message(message).await,
                    None => break Some(RpcError::disconnected(&self.peer_ref)),
                },
                _ = reader_abort.cancelled() => break None,
            }
        };

        reader_abort.cancel();
        let is_current = self.update_state(|state| {
            let is_current = state.connection.as_ref().is_some_and(|c| c.id == handle.id);
            is_current.then(|| state.next_disconnected(error.clone()))
        });
        if is_current {
            info!(peer = ?self.peer_ref, connection = handle.id, "connection closed");
        }
        error
    }

    async fn handshake(&self, connection: &ConnectionHandle, receiver: &mut mpsc::Receiver<RpcMessage>, own_handshake: &RpcHandshake) -> RpcResult<RpcHandshake> {
        let system_calls = &self.hub.system_calls;
        if !connection.send(system_calls.handshake_message(own_handshake)?).await {
            return Err(RpcError::disconnected(&self.peer_ref));
        }

        let Some(message) = receiver.recv().await else {
            return Err(RpcError::disconnected(&self.peer_ref));
        };
        let method = system_calls.method(SystemMethodKind::Handshake);
        if message.method != method.method_ref {
            return Err(RpcError::HandshakeFailed(format!("expected a handshake, got {:?}", message.method)));
        }
        let arguments = self.hub.serializer.deserialize(&message.argument_data, &method.argument_shape, false)
            .map_err(|e| RpcError::HandshakeFailed(format!("{:#}", e)))?;
        let handshake = RpcHandshake::from_arguments(&arguments)?;

        if handshake.protocol_version != own_handshake.protocol_version {
            return Err(RpcError::ConnectionUnrecoverable(format!(
                "protocol version {} is not supported, expected {}", handshake.protocol_version, own_handshake.protocol_version)));
        }
        trace!(peer = ?self.peer_ref, ?handshake, "handshake received");
        Ok(handshake)
    }

    /// Everything bound to the previous remote process is gone: its objects, and the calls it
    ///  made to this side. Outbound calls survive and are resent in full.
    async fn reset_for_new_remote_peer(&self) {
        let previous = {
            let mut peer_changed = self.peer_changed.lock();
            std::mem::replace(&mut *peer_changed, CancellationToken::new())
        };
        previous.cancel();

        let num_remote = self.remote_objects.abort();
        let num_shared = self.shared_objects.abort(&self.hub.config).await;
        self.inbound_calls.clear();
        debug!(peer = ?self.peer_ref, num_remote, num_shared, "reset objects of previous remote peer");
    }

    async fn on_message(self: &Arc<Self>, message: RpcMessage) {
        let span = debug_span!("rpc_inbound",
            peer = %self.peer_ref.key(),
            method = ?message.method,
            related_id = message.related_id,
            activity = message.header(well_known_headers::ACTIVITY_ID).unwrap_or_default(),
        );
        self.dispatch(message).instrument(span).await
    }

    /// System calls are handled inline to preserve their order (stream items in particular),
    ///  regular calls run concurrently
    async fn dispatch(self: &Arc<Self>, message: RpcMessage) {
        if CallTypeId::try_from(message.call_type_id).is_err() {
            error!("unknown call type id {}", message.call_type_id);
            if message.related_id != 0 {
                let error = RpcError::UnknownCallType(message.call_type_id).to_info();
                self.hub.system_calls.error(self, message.related_id, error).await;
            }
            return;
        }

        let call = match self.hub.registry.method(&message.method) {
            Some(method) => InboundCall::new(self.clone(), message, method, None),
            None if message.related_id == 0 => {
                warn!("no-wait call to unknown method is dropped");
                return;
            }
            None => {
                let arguments = ArgumentList::new(vec![
                    RpcValue::String(message.method.service.clone()),
                    RpcValue::String(message.method.method.clone()),
                ]);
                let not_found = self.hub.system_calls.method(SystemMethodKind::NotFound).clone();
                InboundCall::new(self.clone(), message, not_found, Some(arguments))
            }
        };

        if call.context.method.is_system && call.context.method.no_wait {
            call.process().await;
        }
        else {
            tokio::spawn(async move { call.process().await; }.in_current_span());
        }
    }

    /// Attaches an in-memory connection without a connector or a handshake exchange
    #[doc(hidden)]
    pub fn set_test_connection(&self, sender: mpsc::Sender<RpcMessage>, handshake: RpcHandshake, own_handshake: RpcHandshake) -> Arc<ConnectionHandle> {
        let handle = Arc::new(ConnectionHandle::with_next_id(sender));
        let reader_abort = self.stop_token.child_token();
        self.update_state(|state| Some(state.next_connected(handle.clone(), handshake, own_handshake, reader_abort)));
        handle
    }
}

impl Debug for RpcPeer {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "RpcPeer({:?})", self.peer_ref)
    }
}


#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicU32;

    use async_trait::async_trait;

    use super::*;
    use crate::call::outbound_context::OutboundContext;
    use crate::error::ErrorInfo;
    use crate::message::rpc_message::MethodRef;
    use crate::peer::connection::{connection_pair, DelayedConnector, MockPeerConnector};
    use crate::test_util::{connected_test_peer, decode_system_call, disconnected_test_peer, inbound_message, test_hub, test_method, test_peer_ref};

    #[tokio::test(start_paused = true)]
    async fn test_when_connected_timeout() {
        let hub = test_hub();
        let peer = disconnected_test_peer(&hub);
        let result = peer.when_connected(Some(Duration::from_secs(1)), &CancellationToken::new()).await;
        assert_eq!(result.err(), Some(RpcError::ConnectTimeout { peer: peer.peer_ref.key() }));
    }

    #[tokio::test]
    async fn test_when_connected_cancelled() {
        let hub = test_hub();
        let peer = disconnected_test_peer(&hub);
        let cancellation = CancellationToken::new();
        cancellation.cancel();
        assert_eq!(peer.when_connected(None, &cancellation).await.err(), Some(RpcError::Cancelled));
    }

    #[tokio::test]
    async fn test_when_connected_resolves_on_connect() {
        let hub = test_hub();
        let peer = disconnected_test_peer(&hub);
        let waiter = {
            let peer = peer.clone();
            tokio::spawn(async move { peer.when_connected(None, &CancellationToken::new()).await })
        };
        tokio::task::yield_now().await;

        let (sender, _receiver) = mpsc::channel(1);
        let handshake = RpcHandshake { remote_peer_id: Uuid::new_v4(), remote_hub_id: Uuid::new_v4(), protocol_version: 1, index: 1 };
        let handle = peer.set_test_connection(sender, handshake.clone(), handshake);
        assert_eq!(waiter.await.unwrap().unwrap().id, handle.id);
    }

    #[tokio::test]
    async fn test_disconnect() {
        let hub = test_hub();
        let (peer, _outgoing) = connected_test_peer(&hub);
        let reader_abort = peer.connection_state().reader_abort.clone().unwrap();

        peer.disconnect(Some(RpcError::KeepAliveTimeout(Duration::from_secs(1))));
        assert!(!peer.is_connected());
        assert!(reader_abort.is_cancelled());
        assert_eq!(peer.connection_state().try_index, 1);
        assert!(peer.connection_state().handshake.is_some());
        assert!(!peer.send(inbound_message(&hub, &test_method(&hub, "add"), 1, vec![])).await);
    }

    #[tokio::test]
    async fn test_unknown_method_is_answered_with_not_found() {
        let hub = test_hub();
        let (peer, mut outgoing) = connected_test_peer(&hub);
        let mut message = inbound_message(&hub, &test_method(&hub, "add"), 3, vec![1i64.into(), 2i64.into()]);
        message.method = MethodRef::new("Calc", "nope");

        peer.on_message(message).await;
        let reply = outgoing.recv().await.unwrap();
        let (kind, arguments) = decode_system_call(&hub, &reply);
        assert_eq!(kind, SystemMethodKind::Error);
        assert_eq!(reply.related_id, 3);
        assert_eq!(RpcError::from_info(&arguments.error_at(0).unwrap().unwrap()), RpcError::EndpointNotFound {
            service: "Calc".to_string(),
            method: "nope".to_string(),
        });
    }

    #[tokio::test]
    async fn test_unknown_call_type() {
        let hub = test_hub();
        let (peer, mut outgoing) = connected_test_peer(&hub);
        let mut message = inbound_message(&hub, &test_method(&hub, "add"), 4, vec![1i64.into(), 2i64.into()]);
        message.call_type_id = 9;

        peer.on_message(message).await;
        let reply = outgoing.recv().await.unwrap();
        let (kind, arguments) = decode_system_call(&hub, &reply);
        assert_eq!(kind, SystemMethodKind::Error);
        assert_eq!(arguments.error_at(0).unwrap(), Some(RpcError::UnknownCallType(9).to_info()));
    }

    #[tokio::test]
    async fn test_regular_call_is_answered() {
        let hub = test_hub();
        let (peer, mut outgoing) = connected_test_peer(&hub);
        peer.on_message(inbound_message(&hub, &test_method(&hub, "add"), 5, vec![20i64.into(), 22i64.into()])).await;

        let reply = outgoing.recv().await.unwrap();
        let (kind, arguments) = decode_system_call(&hub, &reply);
        assert_eq!(kind, SystemMethodKind::Ok);
        assert_eq!(arguments.value_at(0).unwrap(), RpcValue::I64(42));
    }

    /// Answers the handshake with the given remote peer id, then keeps the connection open
    struct HandshakingConnector {
        remote_peer_ids: Vec<Uuid>,
        protocol_version: u8,
        attempts: AtomicU32,
        hub: Arc<RpcHub>,
        server_ends: Mutex<Vec<RpcConnection>>,
    }

    #[async_trait]
    impl PeerConnector for HandshakingConnector {
        async fn connect(&self, _peer_ref: &PeerRef, _try_index: u32) -> anyhow::Result<RpcConnection> {
            let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) as usize;
            let Some(remote_peer_id) = self.remote_peer_ids.get(attempt) else {
                std::future::pending::<()>().await;
                anyhow::bail!("unreachable");
            };
            let (client, server) = connection_pair(64);
            let handshake = RpcHandshake {
                remote_peer_id: *remote_peer_id,
                remote_hub_id: Uuid::nil(),
                protocol_version: self.protocol_version,
                index: attempt as i64 + 1,
            };
            server.sender.send(self.hub.system_calls.handshake_message(&handshake)?).await?;
            self.server_ends.lock().push(server);
            Ok(client)
        }
    }

    fn handshaking_peer(hub: &Arc<RpcHub>, remote_peer_ids: Vec<Uuid>, protocol_version: u8) -> (Arc<RpcPeer>, Arc<HandshakingConnector>) {
        let connector = Arc::new(HandshakingConnector {
            remote_peer_ids,
            protocol_version,
            attempts: AtomicU32::new(0),
            hub: hub.clone(),
            server_ends: Mutex::new(Vec::new()),
        });
        (RpcPeer::new(hub.clone(), test_peer_ref(), connector.clone()), connector)
    }

    async fn wait_connected(peer: &RpcPeer) -> Arc<ConnectionHandle> {
        peer.when_connected(Some(Duration::from_secs(5)), &CancellationToken::new()).await.unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_peer_change_cancels_inbound_calls() {
        let hub = test_hub();
        let (peer, connector) = handshaking_peer(&hub, vec![Uuid::new_v4(), Uuid::new_v4()], 1);
        peer.start();
        let first = wait_connected(&peer).await;
        let token = peer.peer_changed_token();

        peer.disconnect(None);
        let second = wait_connected(&peer).await;
        assert_ne!(first.id, second.id);
        assert!(token.is_cancelled());
        assert!(!peer.peer_changed_token().is_cancelled());
        assert_eq!(connector.attempts.load(Ordering::SeqCst), 2);
        peer.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_same_remote_peer_keeps_inbound_calls() {
        let hub = test_hub();
        let remote_peer_id = Uuid::new_v4();
        let (peer, _connector) = handshaking_peer(&hub, vec![remote_peer_id, remote_peer_id], 1);
        peer.start();
        wait_connected(&peer).await;
        let token = peer.peer_changed_token();

        peer.disconnect(None);
        wait_connected(&peer).await;
        assert!(!token.is_cancelled());
        peer.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_protocol_mismatch_stops_peer() {
        let hub = test_hub();
        let (peer, _connector) = handshaking_peer(&hub, vec![Uuid::new_v4()], 99);
        peer.start();
        let result = peer.when_connected(None, &CancellationToken::new()).await;
        assert_eq!(result.err(), Some(RpcError::disconnected(&peer.peer_ref)));
        assert!(peer.is_stopping());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_fails_outbound_calls() {
        let hub = test_hub();
        let mut connector = MockPeerConnector::new();
        connector.expect_connect()
            .returning(|_, _| Err(anyhow::anyhow!("refused")));
        let connector = DelayedConnector::new(Arc::new(connector), &hub.config);
        let peer = RpcPeer::new(hub.clone(), test_peer_ref(), Arc::new(connector));
        peer.start();

        let context = OutboundContext::new(test_method(&hub, "add"), ArgumentList::new(vec![1i64.into(), 2i64.into()]))
            .with_peer(peer.clone());
        let call = context.clone().prepare_call(&hub).unwrap();
        let invocation = {
            let call = call.clone();
            tokio::spawn(async move { call.invoke().await })
        };
        time::sleep(Duration::from_millis(10)).await;
        assert_eq!(peer.outbound_calls.len(), 1);

        peer.stop().await;
        assert_eq!(invocation.await.unwrap(), Err(RpcError::disconnected(&peer.peer_ref)));
        assert!(peer.outbound_calls.is_empty());
    }

    #[tokio::test]
    async fn test_error_info_of_remote_failure() {
        let hub = test_hub();
        let (peer, mut outgoing) = connected_test_peer(&hub);
        peer.on_message(inbound_message(&hub, &test_method(&hub, "add"), 6, vec!["x".into(), 1i64.into()])).await;

        let (kind, arguments) = decode_system_call(&hub, &outgoing.recv().await.unwrap());
        assert_eq!(kind, SystemMethodKind::Error);
        let info: ErrorInfo = arguments.error_at(0).unwrap().unwrap();
        assert_eq!(RpcError::from_info(&info).kind(), RpcError::Deserialization(String::new()).kind());
    }
}
