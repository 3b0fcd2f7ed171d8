use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::call::inbound_call::InboundContext;
use crate::call::CallStage;
use crate::error::{RpcError, RpcResult};
use crate::message::arguments::{ArgumentList, ArgumentShape};
use crate::message::rpc_message::well_known_headers;
use crate::message::seq_compressor::{compress_ids, decompress_ids};
use crate::message::value::{RpcValue, ValueKind};
use crate::method::method_def::{ArgumentShapeResolver, MethodDef, MethodInvoker, ShapeResolution};
use crate::method::registry::ServiceDef;
use crate::stream::remote_stream::RemoteStream;
use crate::stream::shared_stream::SharedStream;

pub const SYSTEM_SERVICE: &str = "$sys";

/// The control plane: the methods of the always-present system service
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SystemMethodKind {
    Handshake,
    Reconnect,
    Ok,
    Error,
    Cancel,
    /// 'match': the result hashes the same as the result cached by the caller
    M,
    /// synthesized locally for inbound calls to unknown methods
    NotFound,
    KeepAlive,
    Disconnect,
    Ack,
    AckEnd,
    /// a single stream item
    I,
    /// a batch of stream items
    B,
    End,
}

impl SystemMethodKind {
    pub const ALL: [SystemMethodKind; 14] = [
        SystemMethodKind::Handshake,
        SystemMethodKind::Reconnect,
        SystemMethodKind::Ok,
        SystemMethodKind::Error,
        SystemMethodKind::Cancel,
        SystemMethodKind::M,
        SystemMethodKind::NotFound,
        SystemMethodKind::KeepAlive,
        SystemMethodKind::Disconnect,
        SystemMethodKind::Ack,
        SystemMethodKind::AckEnd,
        SystemMethodKind::I,
        SystemMethodKind::B,
        SystemMethodKind::End,
    ];

    pub fn name(&self) -> &'static str {
        use SystemMethodKind::*;

        match self {
            Handshake => "Handshake",
            Reconnect => "Reconnect",
            Ok => "Ok",
            Error => "Error",
            Cancel => "Cancel",
            M => "M",
            NotFound => "NotFound",
            KeepAlive => "KeepAlive",
            Disconnect => "Disconnect",
            Ack => "Ack",
            AckEnd => "AckEnd",
            I => "I",
            B => "B",
            End => "End",
        }
    }

    pub fn from_name(name: &str) -> Option<SystemMethodKind> {
        SystemMethodKind::ALL.into_iter()
            .find(|k| k.name() == name)
    }

    fn argument_shape(&self) -> ArgumentShape {
        use SystemMethodKind::*;
        use ValueKind as V;

        ArgumentShape::new(match self {
            Handshake => vec![V::Uuid, V::Uuid, V::I64, V::I64],
            Reconnect => vec![V::I64, V::List],
            Ok => vec![V::Any],
            Error => vec![V::Error],
            Cancel | M => vec![],
            NotFound => vec![V::String, V::String],
            KeepAlive | Disconnect => vec![V::List],
            Ack => vec![V::I64, V::Uuid],
            AckEnd => vec![V::Uuid],
            I => vec![V::I64, V::Any],
            B => vec![V::I64, V::List],
            End => vec![V::I64, V::Error],
        })
    }

    fn is_polymorphic(&self) -> bool {
        matches!(self, SystemMethodKind::Ok | SystemMethodKind::I | SystemMethodKind::B)
    }

    fn definition(self) -> MethodDef {
        let mut def = MethodDef::new(SYSTEM_SERVICE, self.name(), self.argument_shape())
            .with_invoker(Arc::new(SystemCallHandler { kind: self }))
            .as_system(self == SystemMethodKind::Ok);
        if self.is_polymorphic() {
            def = def.with_polymorphic_arguments();
        }
        // NB: NotFound answers the unknown call it stands in for, so it is tracked like a call
        if !matches!(self, SystemMethodKind::Reconnect | SystemMethodKind::NotFound) {
            def = def.with_no_wait();
        }
        def
    }
}

pub fn system_service() -> ServiceDef {
    SystemMethodKind::ALL.into_iter()
        .fold(ServiceDef::new(SYSTEM_SERVICE), |service, kind| service.with_method(kind.definition()))
        .with_shape_resolver(Arc::new(SystemShapeResolver {}))
}

/// Results and stream items can have any shape - and when the call or stream they refer to is
///  gone, there is no point in deserializing them
struct SystemShapeResolver {}

impl ArgumentShapeResolver for SystemShapeResolver {
    fn resolve(&self, method: &MethodDef, context: &InboundContext) -> ShapeResolution {
        let related_id = context.message.related_id;
        let is_known = match SystemMethodKind::from_name(method.name()) {
            Some(SystemMethodKind::Ok) => context.peer.outbound_calls.get(related_id).is_some(),
            Some(SystemMethodKind::I) | Some(SystemMethodKind::B) => context.peer.remote_objects.get(related_id).is_some(),
            _ => true,
        };
        if is_known {
            ShapeResolution::Shape(method.argument_shape.clone())
        }
        else {
            ShapeResolution::Ignore
        }
    }
}

struct SystemCallHandler {
    kind: SystemMethodKind,
}

#[async_trait]
impl MethodInvoker for SystemCallHandler {
    async fn invoke(&self, context: &InboundContext, arguments: ArgumentList) -> RpcResult<RpcValue> {
        let peer = &context.peer;
        let related_id = context.message.related_id;

        match self.kind {
            SystemMethodKind::Handshake => {
                warn!(peer = ?peer.peer_ref, "unexpected handshake on an established connection - ignoring");
            }
            SystemMethodKind::Reconnect => {
                return on_reconnect(context, &arguments);
            }
            SystemMethodKind::Ok => {
                if let Some(call) = peer.outbound_calls.get(related_id) {
                    call.set_result(arguments.value_at(0)?, context.message.header(well_known_headers::HASH));
                }
            }
            SystemMethodKind::Error => {
                let error = match arguments.error_at(0)? {
                    Some(info) => RpcError::from_info(&info),
                    None => RpcError::Internal("error without error info".to_string()),
                };
                let error = if error == RpcError::Reroute {
                    warn!(peer = ?peer.peer_ref, related_id, "remote side sent a reroute error, treating it as a cancellation");
                    RpcError::Cancelled
                }
                else {
                    error
                };
                if let Some(call) = peer.outbound_calls.get(related_id) {
                    call.set_error(error, false);
                }
            }
            SystemMethodKind::Cancel => {
                if let Some(call) = peer.inbound_calls.get(related_id) {
                    call.cancel();
                }
            }
            SystemMethodKind::M => {
                if let Some(call) = peer.outbound_calls.get(related_id) {
                    call.set_match();
                }
            }
            SystemMethodKind::NotFound => {
                let service = arguments.get(0).and_then(|v| v.as_str()).unwrap_or_default();
                let method = arguments.get(1).and_then(|v| v.as_str()).unwrap_or_default();
                return Err(RpcError::EndpointNotFound {
                    service: service.to_string(),
                    method: method.to_string(),
                });
            }
            SystemMethodKind::KeepAlive => {
                let ids = id_list(&arguments, 0)?;
                peer.shared_objects.keep_alive(peer, &ids).await;
            }
            SystemMethodKind::Disconnect => {
                let ids = id_list(&arguments, 0)?;
                peer.remote_objects.disconnect(&ids);
            }
            SystemMethodKind::Ack | SystemMethodKind::AckEnd => {
                let (next_index, host_id) = if self.kind == SystemMethodKind::Ack {
                    (arguments.i64_at(0)?, arguments.uuid_at(1)?)
                }
                else {
                    (i64::MAX, arguments.uuid_at(0)?)
                };
                match peer.shared_objects.get(related_id).and_then(|o| o.as_any().downcast::<SharedStream>().ok()) {
                    Some(stream) => stream.on_ack(next_index, host_id).await,
                    None => {
                        debug!(peer = ?peer.peer_ref, related_id, "ack for unknown stream");
                        peer.hub.system_calls.disconnect(peer, &[related_id]).await;
                    }
                }
            }
            SystemMethodKind::I | SystemMethodKind::B | SystemMethodKind::End => {
                let Some(stream) = peer.remote_objects.get(related_id).and_then(|o| o.as_any().downcast::<RemoteStream>().ok()) else {
                    debug!(peer = ?peer.peer_ref, related_id, "item for unknown stream");
                    return Ok(RpcValue::None);
                };
                let index = arguments.i64_at(0)?;
                match self.kind {
                    SystemMethodKind::I => stream.on_item(index, arguments.value_at(1)?).await,
                    SystemMethodKind::B => stream.on_batch(index, arguments.list_at(1)?.to_vec()).await,
                    _ => stream.on_end(index, arguments.error_at(1)?).await,
                }
            }
        }
        Ok(RpcValue::None)
    }
}

fn id_list(arguments: &ArgumentList, index: usize) -> RpcResult<Vec<i64>> {
    arguments.list_at(index)?
        .iter()
        .map(|v| v.as_i64().ok_or_else(|| RpcError::Deserialization("object ids must be i64".to_string())))
        .collect()
}

/// The callee side of call replay: the request names the callee's handshake that the caller last
///  saw, plus the ids of the caller's in-flight calls grouped by stage. The response lists the ids
///  the callee does not know, which the caller then resends.
fn on_reconnect(context: &InboundContext, arguments: &ArgumentList) -> RpcResult<RpcValue> {
    let peer = &context.peer;
    let handshake_index = arguments.i64_at(0)?;

    let own_index = peer.connection_state().own_handshake.as_ref().map(|h| h.index);
    if own_index != Some(handshake_index) {
        debug!(peer = ?peer.peer_ref, ?own_index, handshake_index, "reconnect refers to a different handshake");
        return Err(RpcError::TooLateToReconnect);
    }

    let mut unknown_ids = Vec::new();
    for entry in arguments.list_at(1)? {
        let (stage, data) = match entry.as_list() {
            Some([RpcValue::I64(stage), RpcValue::Bytes(data)]) => (*stage, data),
            _ => return Err(RpcError::Deserialization("malformed reconnect entry".to_string())),
        };
        let ids = decompress_ids(data)
            .map_err(|e| RpcError::Deserialization(format!("{:#}", e)))?;

        // stages this side does not know are treated as 'nothing known'
        let is_known_stage = u8::try_from(stage).ok()
            .and_then(|s| CallStage::try_from(s).ok())
            .is_some();
        if !is_known_stage {
            unknown_ids.extend(ids);
            continue;
        }
        unknown_ids.extend(ids.into_iter().filter(|id| peer.inbound_calls.get(*id).is_none()));
    }

    debug!(peer = ?peer.peer_ref, "reconnect: {} unknown calls", unknown_ids.len());
    Ok(RpcValue::Bytes(compress_ids(&unknown_ids)))
}
