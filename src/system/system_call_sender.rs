use std::sync::Arc;

use anyhow::anyhow;
use bytes::Bytes;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::call::inbound_call::InboundCall;
use crate::call::outbound_call::OutboundCall;
use crate::call::outbound_context::OutboundContext;
use crate::call::CallStage;
use crate::config::PeerStopMode;
use crate::error::{ErrorInfo, RpcError, RpcResult};
use crate::message::arguments::ArgumentList;
use crate::message::rpc_message::{content_hash, well_known_headers, CallId, MethodRef, RpcMessage};
use crate::message::serializer::ArgumentSerializer;
use crate::message::value::RpcValue;
use crate::method::method_def::MethodDef;
use crate::method::registry::ServiceRegistry;
use crate::peer::handshake::RpcHandshake;
use crate::peer::rpc_peer::RpcPeer;
use crate::system::system_calls::{SystemMethodKind, SYSTEM_SERVICE};

/// Builds and sends system calls. Nothing here waits for a connection: system messages that can
///  not be sent right away are dropped, since the protocol recovers from lost control messages
///  through reconnect replay and keep-alives.
pub struct SystemCallSender {
    serializer: Arc<dyn ArgumentSerializer>,
    /// indexed by [SystemMethodKind] discriminant, in the order of [SystemMethodKind::ALL]
    methods: Vec<Arc<MethodDef>>,
}

impl SystemCallSender {
    pub fn new(registry: &ServiceRegistry, serializer: Arc<dyn ArgumentSerializer>) -> anyhow::Result<SystemCallSender> {
        let methods = SystemMethodKind::ALL.iter()
            .map(|kind| registry.method(&MethodRef::new(SYSTEM_SERVICE, kind.name()))
                .ok_or_else(|| anyhow!("system method {} is not registered", kind.name())))
            .collect::<anyhow::Result<Vec<_>>>()?;
        Ok(SystemCallSender { serializer, methods })
    }

    pub fn method(&self, kind: SystemMethodKind) -> &Arc<MethodDef> {
        &self.methods[kind as usize]
    }

    pub fn error_method(&self) -> &Arc<MethodDef> {
        self.method(SystemMethodKind::Error)
    }

    pub fn message(&self, kind: SystemMethodKind, related_id: CallId, arguments: &ArgumentList) -> RpcResult<RpcMessage> {
        let method = self.method(kind);
        let data = self.serializer.serialize(arguments, method.has_polymorphic_arguments)
            .map_err(|e| RpcError::Serialization(format!("{:#}", e)))?;
        Ok(RpcMessage::new(related_id, method.method_ref.clone(), data))
    }

    async fn send(&self, peer: &RpcPeer, kind: SystemMethodKind, related_id: CallId, arguments: Vec<RpcValue>) -> bool {
        match self.message(kind, related_id, &ArgumentList::new(arguments)) {
            Ok(message) => peer.send(message).await,
            Err(e) => {
                warn!(peer = ?peer.peer_ref, ?kind, "can not send system call: {}", e);
                false
            }
        }
    }

    pub fn handshake_message(&self, handshake: &RpcHandshake) -> RpcResult<RpcMessage> {
        self.message(SystemMethodKind::Handshake, 0, &handshake.to_arguments())
    }

    /// Asks the callee which of the given in-flight calls it does not know, returning their
    ///  compressed ids
    pub async fn reconnect(&self, peer: &Arc<RpcPeer>, handshake_index: i64, stages: Vec<(CallStage, Bytes)>, abort: &CancellationToken) -> RpcResult<Bytes> {
        let stages = stages.into_iter()
            .map(|(stage, ids)| RpcValue::List(vec![RpcValue::I64(u8::from(stage) as i64), RpcValue::Bytes(ids)]))
            .collect::<Vec<_>>();
        let arguments = ArgumentList::new(vec![RpcValue::I64(handshake_index), RpcValue::List(stages)]);

        let context = OutboundContext::new(self.method(SystemMethodKind::Reconnect).clone(), arguments)
            .with_peer(peer.clone())
            .with_cancellation(abort.child_token());
        let result = OutboundCall::new(context, peer.clone()).invoke().await?;
        result.as_bytes()
            .cloned()
            .ok_or_else(|| RpcError::Deserialization("reconnect result must be bytes".to_string()))
    }

    /// Sends an inbound call's result to the caller. A successful result is replaced by a bare
    ///  match notice if the caller sent a hash and the result hashes the same.
    pub async fn complete(&self, peer: &RpcPeer, call: &InboundCall, result: &RpcResult<RpcValue>) {
        let value = match result {
            Ok(value) => value,
            Err(e) => {
                if e.is_cancellation() && peer.is_stopping() && peer.hub.config.peer_stop_mode == PeerStopMode::KeepInboundCallsIncomplete {
                    debug!(?call, "peer is stopping, not sending cancellation");
                    return;
                }
                if !e.is_cancellation() {
                    warn!(?call, "call failed: {}", e);
                }
                self.error(peer, call.id, e.to_info()).await;
                return;
            }
        };

        let ok_method = self.method(SystemMethodKind::Ok);
        let data = match self.serializer.serialize(&ArgumentList::new(vec![value.clone()]), true) {
            Ok(data) => data,
            Err(e) => {
                let error = RpcError::Serialization(format!("{:#}", e));
                warn!(?call, "call result can not be serialized: {}", error);
                self.error(peer, call.id, error.to_info()).await;
                return;
            }
        };

        let mut message = RpcMessage::new(call.id, ok_method.method_ref.clone(), data);
        if let Some(requested_hash) = call.context.message.header(well_known_headers::HASH) {
            let hash = content_hash(&message.argument_data);
            if requested_hash == hash {
                self.send(peer, SystemMethodKind::M, call.id, vec![]).await;
                return;
            }
            message = message.with_header(well_known_headers::HASH, hash);
        }
        peer.send(message).await;
    }

    pub async fn error(&self, peer: &RpcPeer, related_id: CallId, error: ErrorInfo) -> bool {
        self.send(peer, SystemMethodKind::Error, related_id, vec![RpcValue::Error(error)]).await
    }

    pub async fn cancel(&self, peer: &RpcPeer, related_id: CallId) -> bool {
        self.send(peer, SystemMethodKind::Cancel, related_id, vec![]).await
    }

    pub async fn keep_alive(&self, peer: &RpcPeer, local_ids: &[i64]) -> bool {
        self.send(peer, SystemMethodKind::KeepAlive, 0, vec![id_list(local_ids)]).await
    }

    pub async fn disconnect(&self, peer: &RpcPeer, local_ids: &[i64]) -> bool {
        self.send(peer, SystemMethodKind::Disconnect, 0, vec![id_list(local_ids)]).await
    }

    /// A nil `host_id` is a plain acknowledgement, a non-nil one requests a reset to `next_index`
    pub async fn ack(&self, peer: &RpcPeer, local_id: i64, next_index: i64, host_id: Uuid) -> bool {
        self.send(peer, SystemMethodKind::Ack, local_id, vec![RpcValue::I64(next_index), RpcValue::Uuid(host_id)]).await
    }

    pub async fn ack_end(&self, peer: &RpcPeer, local_id: i64, host_id: Uuid) -> bool {
        self.send(peer, SystemMethodKind::AckEnd, local_id, vec![RpcValue::Uuid(host_id)]).await
    }

    pub async fn item(&self, peer: &RpcPeer, local_id: i64, index: i64, item: RpcValue) -> bool {
        self.send(peer, SystemMethodKind::I, local_id, vec![RpcValue::I64(index), item]).await
    }

    pub async fn batch(&self, peer: &RpcPeer, local_id: i64, index: i64, items: Vec<RpcValue>) -> bool {
        self.send(peer, SystemMethodKind::B, local_id, vec![RpcValue::I64(index), RpcValue::List(items)]).await
    }

    pub async fn end(&self, peer: &RpcPeer, local_id: i64, index: i64, error: Option<ErrorInfo>) -> bool {
        let error = error.map(RpcValue::Error).unwrap_or(RpcValue::None);
        self.send(peer, SystemMethodKind::End, local_id, vec![RpcValue::I64(index), error]).await
    }
}

fn id_list(ids: &[i64]) -> RpcValue {
    RpcValue::List(ids.iter().map(|id| RpcValue::I64(*id)).collect())
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::arguments::ArgumentShape;
    use crate::test_util::{connected_test_peer, decode_system_call, inbound_message, test_hub};

    fn echo_call(peer: &Arc<RpcPeer>, hash: Option<&str>) -> Arc<InboundCall> {
        let hub = &peer.hub;
        let method = Arc::new(MethodDef::new("S", "echo", ArgumentShape::any(1)));
        let mut message = inbound_message(hub, &method, 11, vec!["x".into()]);
        if let Some(hash) = hash {
            message = message.with_header(well_known_headers::HASH, hash);
        }
        InboundCall::new(peer.clone(), message, method, None)
    }

    #[tokio::test]
    async fn test_ok_with_hash_request() {
        let hub = test_hub();
        let (peer, mut outgoing) = connected_test_peer(&hub);

        hub.system_calls.complete(&peer, &echo_call(&peer, Some("")), &Ok("result".into())).await;
        let ok = outgoing.recv().await.unwrap();
        assert_eq!(decode_system_call(&hub, &ok).0, SystemMethodKind::Ok);
        let hash = ok.header(well_known_headers::HASH).unwrap().to_string();
        assert_eq!(hash, content_hash(&ok.argument_data));

        hub.system_calls.complete(&peer, &echo_call(&peer, Some(&hash)), &Ok("result".into())).await;
        let matched = outgoing.recv().await.unwrap();
        assert_eq!(decode_system_call(&hub, &matched).0, SystemMethodKind::M);
        assert_eq!(matched.related_id, 11);
    }

    #[tokio::test]
    async fn test_ok_without_hash_request() {
        let hub = test_hub();
        let (peer, mut outgoing) = connected_test_peer(&hub);
        hub.system_calls.complete(&peer, &echo_call(&peer, None), &Ok(5i64.into())).await;

        let ok = outgoing.recv().await.unwrap();
        let (kind, arguments) = decode_system_call(&hub, &ok);
        assert_eq!(kind, SystemMethodKind::Ok);
        assert_eq!(arguments.value_at(0).unwrap(), RpcValue::I64(5));
        assert_eq!(ok.header(well_known_headers::HASH), None);
    }

    #[tokio::test]
    async fn test_error() {
        let hub = test_hub();
        let (peer, mut outgoing) = connected_test_peer(&hub);
        hub.system_calls.complete(&peer, &echo_call(&peer, None), &Err(RpcError::Remote(ErrorInfo::new("E", "m")))).await;

        let (kind, arguments) = decode_system_call(&hub, &outgoing.recv().await.unwrap());
        assert_eq!(kind, SystemMethodKind::Error);
        assert_eq!(arguments.error_at(0).unwrap(), Some(ErrorInfo::new("E", "m")));
    }
}
