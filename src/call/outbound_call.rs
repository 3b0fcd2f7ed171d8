use std::fmt::{Debug, Formatter};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Weak};

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::task::AbortHandle;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::call::cache_info::{CachedResult, CallKey, CaptureMode};
use crate::call::outbound_context::OutboundContext;
use crate::call::CallStage;
use crate::error::{RpcError, RpcResult};
use crate::message::rpc_message::{well_known_headers, CallId, RpcMessage};
use crate::message::value::RpcValue;
use crate::method::method_def::MethodDef;
use crate::peer::connection::ConnectionHandle;
use crate::peer::rpc_peer::RpcPeer;
use crate::util::result_cell::ResultCell;

struct OutboundCallState {
    started_at: Instant,
    /// id of the connection this call was last sent on
    sent_on: Option<u64>,
    cancel_registration: Option<AbortHandle>,
}

/// The caller side of a single call. All terminal transitions (result, match, error, cancellation)
///  race for the single-assignment result cell under the call's lock, and the winner performs the
///  completion side effects exactly once.
pub struct OutboundCall {
    id: AtomicI64,
    pub context: OutboundContext,
    pub method: Arc<MethodDef>,
    pub peer: Arc<RpcPeer>,
    activity_id: Option<String>,
    result: ResultCell<RpcResult<RpcValue>>,
    state: Mutex<OutboundCallState>,
}

impl OutboundCall {
    pub fn new(context: OutboundContext, peer: Arc<RpcPeer>) -> Arc<OutboundCall> {
        Arc::new(OutboundCall {
            id: AtomicI64::new(0),
            method: context.method.clone(),
            context,
            peer,
            activity_id: tracing::Span::current().id().map(|id| id.into_u64().to_string()),
            result: ResultCell::new(),
            state: Mutex::new(OutboundCallState {
                started_at: Instant::now(),
                sent_on: None,
                cancel_registration: None,
            }),
        })
    }

    pub fn id(&self) -> CallId {
        self.id.load(Ordering::Acquire)
    }

    pub(crate) fn set_id(&self, id: CallId) {
        self.id.store(id, Ordering::Release);
    }

    pub fn started_at(&self) -> Instant {
        self.state.lock().started_at
    }

    pub(crate) fn set_started_at(&self, started_at: Instant) {
        self.state.lock().started_at = started_at;
    }

    pub fn result(&self) -> Option<RpcResult<RpcValue>> {
        self.result.get()
    }

    pub fn is_completed(&self) -> bool {
        self.result.is_set()
    }

    pub async fn wait_result(&self) -> RpcResult<RpcValue> {
        self.result.wait().await
    }

    pub async fn invoke(self: &Arc<Self>) -> RpcResult<RpcValue> {
        if let Some(capture) = &self.context.cache_info_capture {
            if capture.mode == CaptureMode::KeyOnly {
                let argument_data = self.serialize_arguments()?;
                capture.capture_key(CallKey {
                    method: self.method.method_ref.clone(),
                    argument_data,
                });
                self.result.try_set(Ok(RpcValue::None));
                return Ok(RpcValue::None);
            }
        }

        if self.method.no_wait {
            let message = self.create_message(0)?;
            match self.peer.connection() {
                Some(connection) => {
                    if !connection.send(message).await {
                        debug!(call = ?self, "connection closed, no-wait call is dropped");
                    }
                }
                None => debug!(call = ?self, "peer is disconnected, no-wait call is dropped"),
            }
            self.result.try_set(Ok(RpcValue::None));
            return Ok(RpcValue::None);
        }

        self.peer.outbound_calls.register(self)?;
        self.register_cancellation_handler();

        match self.peer.connection() {
            Some(connection) => {
                self.send_registered(&connection).await;
            }
            None => {
                trace!(call = ?self, "waiting for connection");
                tokio::select! {
                    connection = self.peer.when_connected(self.method.timeouts.connect_timeout, &self.context.cancellation) => {
                        match connection {
                            Ok(connection) => {
                                self.send_registered(&connection).await;
                            }
                            Err(e) => {
                                self.set_error(e, false);
                            }
                        }
                    }
                    _ = self.result.wait() => {}
                }
            }
        }

        self.result.wait().await
    }

    /// Sends the registered call on the given connection, unless it was sent there before or is
    ///  completed already. Returns `true` if the message was actually sent.
    pub(crate) async fn send_registered(self: &Arc<Self>, connection: &ConnectionHandle) -> bool {
        {
            let mut state = self.state.lock();
            if self.result.is_set() || state.sent_on == Some(connection.id) {
                return false;
            }
            state.sent_on = Some(connection.id);
        }

        match self.create_message(self.id()) {
            Ok(message) => connection.send(message).await,
            Err(e) => {
                self.set_error(e, false);
                false
            }
        }
    }

    fn register_cancellation_handler(self: &Arc<Self>) {
        let token = self.context.cancellation.clone();
        if token.is_cancelled() {
            self.cancel();
            return;
        }

        let call: Weak<OutboundCall> = Arc::downgrade(self);
        let handle = tokio::spawn(async move {
            token.cancelled().await;
            if let Some(call) = call.upgrade() {
                call.cancel();
            }
        }).abort_handle();

        let mut state = self.state.lock();
        if self.result.is_set() {
            handle.abort();
        }
        else {
            state.cancel_registration = Some(handle);
        }
    }

    fn serialize_arguments(&self) -> RpcResult<Bytes> {
        let arguments = self.context.arguments.without_cancellation(self.method.cancellation_index);
        self.peer.hub.serializer.serialize(&arguments, self.method.has_polymorphic_arguments)
            .map_err(|e| RpcError::Serialization(format!("{:#}", e)))
    }

    fn create_message(&self, related_id: CallId) -> RpcResult<RpcMessage> {
        let mut message = RpcMessage::new(related_id, self.method.method_ref.clone(), self.serialize_arguments()?)
            .with_headers(&self.context.headers);

        if let Some(cached) = &self.context.cached_result {
            message = message.with_header(well_known_headers::HASH, cached.hash.clone());
        }
        else if self.context.cache_info_capture.as_ref().map(|c| c.mode) == Some(CaptureMode::KeyAndData) {
            // an empty hash asks the callee to hash its result
            message = message.with_header(well_known_headers::HASH, "");
        }
        if let Some(activity_id) = &self.activity_id {
            message = message.with_header(well_known_headers::ACTIVITY_ID, activity_id.clone());
        }
        Ok(message)
    }

    pub fn set_result(self: &Arc<Self>, value: RpcValue, hash: Option<&str>) -> bool {
        if let (Some(capture), Some(hash)) = (&self.context.cache_info_capture, hash) {
            capture.capture_data(CachedResult {
                hash: hash.to_string(),
                value: value.clone(),
            });
        }
        self.complete(Ok(value), false)
    }

    /// The callee's result hashes the same as the cached result this call was sent with
    pub fn set_match(self: &Arc<Self>) -> bool {
        match self.context.cached_result.clone() {
            Some(cached) => {
                if let Some(capture) = &self.context.cache_info_capture {
                    capture.capture_data(cached.clone());
                }
                self.complete(Ok(cached.value), false)
            }
            None => self.complete(Err(RpcError::MatchButNoCachedEntry), false),
        }
    }

    pub fn set_error(self: &Arc<Self>, error: RpcError, notify_remote: bool) -> bool {
        self.complete(Err(error), notify_remote)
    }

    pub fn cancel(self: &Arc<Self>) -> bool {
        self.complete(Err(RpcError::Cancelled), true)
    }

    fn complete(self: &Arc<Self>, result: RpcResult<RpcValue>, notify_remote: bool) -> bool {
        let cancel_registration = {
            let mut state = self.state.lock();
            if !self.result.try_set(result) {
                return false;
            }
            state.cancel_registration.take()
        };
        if let Some(handle) = cancel_registration {
            handle.abort();
        }

        trace!(call = ?self, "completed");
        if self.peer.outbound_calls.unregister(self) && notify_remote && !self.method.no_wait {
            let peer = self.peer.clone();
            let id = self.id();
            tokio::spawn(async move {
                peer.hub.system_calls.cancel(&peer, id).await;
            });
        }
        true
    }

    /// `true` if the routing target for this call's method and arguments is no longer the peer the
    ///  call is attached to
    pub fn is_peer_changed(&self) -> bool {
        if !self.peer.peer_ref.can_be_rerouted() {
            return false;
        }
        if self.peer.peer_ref.is_obsolete() {
            return true;
        }
        match self.peer.hub.router().route(&self.method, &self.context.arguments) {
            Ok(peer_ref) => peer_ref.key() != self.peer.peer_ref.key(),
            Err(_) => false,
        }
    }

    /// System calls are never replayed, completed calls have nothing to replay
    pub fn reconnect_stage(&self) -> Option<CallStage> {
        if self.method.is_system || self.result.is_set() {
            None
        }
        else {
            Some(CallStage::Sent)
        }
    }
}

impl Debug for OutboundCall {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{} {:?} @ {:?}", self.id(), self.method, self.peer.peer_ref)
    }
}


#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::call::cache_info::CacheInfoCapture;
    use crate::message::arguments::ArgumentList;
    use crate::message::value::RpcValue;
    use crate::system::system_calls::SystemMethodKind;
    use crate::test_util::{connected_test_peer, decode_system_call, test_hub, test_method};
    use tokio_util::sync::CancellationToken;

    fn context(hub_method: Arc<MethodDef>) -> OutboundContext {
        OutboundContext::new(hub_method, ArgumentList::new(vec![1i64.into(), 2i64.into()]))
    }

    #[tokio::test]
    async fn test_result_is_assigned_once() {
        let hub = test_hub();
        let (peer, _outgoing) = connected_test_peer(&hub);
        let call = OutboundCall::new(context(test_method(&hub, "add")), peer.clone());
        peer.outbound_calls.register(&call).unwrap();

        assert!(call.set_result(3i64.into(), None));
        assert!(!call.set_error(RpcError::Cancelled, false));
        assert!(!call.cancel());
        assert!(!call.set_match());
        assert_eq!(call.result(), Some(Ok(3i64.into())));
        assert!(peer.outbound_calls.get(call.id()).is_none());
    }

    #[tokio::test]
    async fn test_concurrent_resolution() {
        let hub = test_hub();
        let (peer, _outgoing) = connected_test_peer(&hub);
        let call = OutboundCall::new(context(test_method(&hub, "add")), peer.clone());
        peer.outbound_calls.register(&call).unwrap();

        let mut tasks = Vec::new();
        for i in 0..16 {
            let call = call.clone();
            tasks.push(tokio::spawn(async move {
                match i % 4 {
                    0 => call.set_result(RpcValue::I64(i), None),
                    1 => call.set_error(RpcError::Internal("x".to_string()), false),
                    2 => call.cancel(),
                    _ => call.set_error(RpcError::Reroute, true),
                }
            }));
        }
        let mut winners = 0;
        for t in tasks {
            if t.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
        assert!(call.is_completed());
    }

    #[tokio::test]
    async fn test_invoke_sends_and_resolves() {
        let hub = test_hub();
        let (peer, mut outgoing) = connected_test_peer(&hub);
        let call = OutboundCall::new(context(test_method(&hub, "add")), peer.clone());

        let invocation = {
            let call = call.clone();
            tokio::spawn(async move { call.invoke().await })
        };

        let sent = outgoing.recv().await.unwrap();
        assert_eq!(sent.related_id, call.id());
        assert_eq!(sent.method, call.method.method_ref);

        let registered = peer.outbound_calls.get(sent.related_id).unwrap();
        registered.set_result(3i64.into(), None);
        assert_eq!(invocation.await.unwrap(), Ok(3i64.into()));
    }

    #[tokio::test]
    async fn test_cancellation_notifies_remote() {
        let hub = test_hub();
        let (peer, mut outgoing) = connected_test_peer(&hub);
        let token = CancellationToken::new();
        let call = OutboundCall::new(context(test_method(&hub, "add")).with_cancellation(token.clone()), peer.clone());

        let invocation = {
            let call = call.clone();
            tokio::spawn(async move { call.invoke().await })
        };
        let sent = outgoing.recv().await.unwrap();
        token.cancel();

        assert_eq!(invocation.await.unwrap(), Err(RpcError::Cancelled));
        let cancel = outgoing.recv().await.unwrap();
        assert_eq!(decode_system_call(&hub, &cancel).0, SystemMethodKind::Cancel);
        assert_eq!(cancel.related_id, sent.related_id);
    }

    #[tokio::test]
    async fn test_send_at_most_once_per_connection() {
        let hub = test_hub();
        let (peer, mut outgoing) = connected_test_peer(&hub);
        let call = OutboundCall::new(context(test_method(&hub, "add")), peer.clone());
        peer.outbound_calls.register(&call).unwrap();

        let connection = peer.connection().unwrap();
        assert!(call.send_registered(&connection).await);
        assert!(!call.send_registered(&connection).await);
        assert!(outgoing.recv().await.is_some());
        assert!(outgoing.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_key_only_capture_does_not_send() {
        let hub = test_hub();
        let (peer, mut outgoing) = connected_test_peer(&hub);
        let capture = Arc::new(CacheInfoCapture::new(CaptureMode::KeyOnly));
        let call = OutboundCall::new(context(test_method(&hub, "add")).with_cache_info_capture(capture.clone()), peer.clone());

        assert_eq!(call.invoke().await, Ok(RpcValue::None));
        let key = capture.key().unwrap();
        assert_eq!(key.method, call.method.method_ref);
        assert!(!key.argument_data.is_empty());
        assert!(outgoing.try_recv().is_err());
        assert_eq!(peer.outbound_calls.len(), 0);
    }

    #[tokio::test]
    async fn test_match_uses_cached_result() {
        let hub = test_hub();
        let (peer, mut outgoing) = connected_test_peer(&hub);
        let cached = CachedResult { hash: "abc".to_string(), value: 42i64.into() };
        let call = OutboundCall::new(context(test_method(&hub, "add")).with_cached_result(cached), peer.clone());

        let invocation = {
            let call = call.clone();
            tokio::spawn(async move { call.invoke().await })
        };
        let sent = outgoing.recv().await.unwrap();
        assert_eq!(sent.header(well_known_headers::HASH), Some("abc"));

        call.set_match();
        assert_eq!(invocation.await.unwrap(), Ok(42i64.into()));
    }

    #[tokio::test]
    async fn test_match_without_cached_entry() {
        let hub = test_hub();
        let (peer, _outgoing) = connected_test_peer(&hub);
        let call = OutboundCall::new(context(test_method(&hub, "add")), peer.clone());
        call.set_match();
        assert_eq!(call.result(), Some(Err(RpcError::MatchButNoCachedEntry)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_timeout() {
        let hub = test_hub();
        let peer = crate::test_util::disconnected_test_peer(&hub);
        let mut method = MethodDef::new("Calc", "add", crate::message::arguments::ArgumentShape::any(2));
        method.timeouts.connect_timeout = Some(Duration::from_secs(3));
        let call = OutboundCall::new(OutboundContext::new(Arc::new(method), ArgumentList::new(vec![1i64.into(), 2i64.into()])), peer.clone());

        let result = call.invoke().await;
        assert!(matches!(result, Err(RpcError::ConnectTimeout { .. })));
        assert_eq!(peer.outbound_calls.len(), 0);
    }

    #[tokio::test]
    async fn test_reconnect_stage() {
        let hub = test_hub();
        let (peer, _outgoing) = connected_test_peer(&hub);
        let call = OutboundCall::new(context(test_method(&hub, "add")), peer.clone());
        assert_eq!(call.reconnect_stage(), Some(CallStage::Sent));
        call.set_result(RpcValue::None, None);
        assert_eq!(call.reconnect_stage(), None);
    }
}
