//! This module contains utilities for testing code that makes or serves RPC calls. They are used
//!  for testing the RPC machinery itself, but they are also exported for application testing.
//!
//! Test peers are wired to channels instead of a real transport, so tests can inspect every
//!  message a peer sends. [pair::TestRpcPair] connects a client hub and a server hub in memory,
//!  with controls for dropping the connection and replacing the server.

pub mod pair;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::call::inbound_call::InboundContext;
use crate::config::RpcConfig;
use crate::error::RpcResult;
use crate::message::arguments::{ArgumentList, ArgumentShape};
use crate::message::peer_ref::ParsedRpcPeerRef;
use crate::message::rpc_message::{MethodRef, RpcMessage};
use crate::message::value::{RpcValue, ValueKind};
use crate::method::method_def::{MethodDef, MethodInvoker};
use crate::method::registry::{ServiceDef, ServiceRegistry};
use crate::peer::connection::{PeerConnector, PeerConnectorFactory, RpcConnection};
use crate::peer::handshake::RpcHandshake;
use crate::peer::rpc_peer::RpcPeer;
use crate::routing::router::{PeerRef, RpcRouter, StaticRouter};
use crate::hub::RpcHub;
use crate::system::system_calls::SystemMethodKind;

pub use pair::TestRpcPair;

pub const TEST_SERVICE: &str = "Calc";

/// The handshake index of both sides of a [connected_test_peer]
pub const TEST_HANDSHAKE_INDEX: i64 = 1;

/// How long the `slow` test method takes
pub const SLOW_METHOD_DELAY: Duration = Duration::from_secs(1);

enum CalcMethod {
    Add,
    Slow,
    Notify,
}

#[async_trait]
impl MethodInvoker for CalcMethod {
    async fn invoke(&self, _context: &InboundContext, arguments: ArgumentList) -> RpcResult<RpcValue> {
        match self {
            CalcMethod::Add => Ok(RpcValue::I64(arguments.i64_at(0)? + arguments.i64_at(1)?)),
            CalcMethod::Slow => {
                tokio::time::sleep(SLOW_METHOD_DELAY).await;
                arguments.value_at(0)
            }
            CalcMethod::Notify => Ok(RpcValue::None),
        }
    }
}

/// The `Calc` service: `add(i64, i64)`, `slow(any)` which echoes its argument after
///  [SLOW_METHOD_DELAY], and the no-wait method `notify(any)`
pub fn test_service() -> ServiceDef {
    ServiceDef::new(TEST_SERVICE)
        .with_method(MethodDef::new(TEST_SERVICE, "add", ArgumentShape::new(vec![ValueKind::I64, ValueKind::I64]))
            .with_invoker(Arc::new(CalcMethod::Add)))
        .with_method(MethodDef::new(TEST_SERVICE, "slow", ArgumentShape::any(1))
            .with_invoker(Arc::new(CalcMethod::Slow)))
        .with_method(MethodDef::new(TEST_SERVICE, "notify", ArgumentShape::any(1))
            .with_no_wait()
            .with_invoker(Arc::new(CalcMethod::Notify)))
}

pub fn test_registry() -> ServiceRegistry {
    ServiceRegistry::new()
        .with(test_service())
        .expect("test service can be registered")
}

/// A connector that never establishes a connection
pub struct PendingConnector {}

#[async_trait]
impl PeerConnector for PendingConnector {
    async fn connect(&self, _peer_ref: &PeerRef, _try_index: u32) -> anyhow::Result<RpcConnection> {
        std::future::pending().await
    }
}

pub struct PendingConnectorFactory {}

impl PeerConnectorFactory for PendingConnectorFactory {
    fn create(&self, _peer_ref: &PeerRef) -> Arc<dyn PeerConnector> {
        Arc::new(PendingConnector {})
    }
}

pub fn test_peer_ref() -> PeerRef {
    PeerRef::new(ParsedRpcPeerRef::parse("remote.compact://test-peer").expect("valid peer ref"))
}

/// A hub with the [test_service], routing everything to [test_peer_ref]. Its peers never connect
///  on their own.
pub fn test_hub() -> Arc<RpcHub> {
    test_hub_with_config(RpcConfig::new())
}

pub fn test_hub_with_config(config: RpcConfig) -> Arc<RpcHub> {
    let router: Arc<dyn RpcRouter> = Arc::new(StaticRouter::new(test_peer_ref().parsed));
    RpcHub::new(config, test_registry(), router, Arc::new(PendingConnectorFactory {}))
        .expect("valid test hub")
}

pub fn test_method(hub: &RpcHub, name: &str) -> Arc<MethodDef> {
    hub.registry.method(&MethodRef::new(TEST_SERVICE, name))
        .unwrap_or_else(|| panic!("no test method {}", name))
}

/// A peer that is not started and never connects
pub fn disconnected_test_peer(hub: &Arc<RpcHub>) -> Arc<RpcPeer> {
    RpcPeer::new(hub.clone(), test_peer_ref(), Arc::new(PendingConnector {}))
}

/// A peer that is connected without a run loop. Everything it sends ends up in the returned
///  receiver, and inbound messages are fed to it by the test.
pub fn connected_test_peer(hub: &Arc<RpcHub>) -> (Arc<RpcPeer>, mpsc::Receiver<RpcMessage>) {
    let peer = disconnected_test_peer(hub);
    let (sender, receiver) = mpsc::channel(256);
    let remote_handshake = RpcHandshake {
        remote_peer_id: Uuid::new_v4(),
        remote_hub_id: Uuid::new_v4(),
        protocol_version: hub.config.protocol_version,
        index: TEST_HANDSHAKE_INDEX,
    };
    let own_handshake = RpcHandshake {
        remote_peer_id: peer.id,
        remote_hub_id: hub.id,
        protocol_version: hub.config.protocol_version,
        index: TEST_HANDSHAKE_INDEX,
    };
    peer.set_test_connection(sender, remote_handshake, own_handshake);
    (peer, receiver)
}

/// A message as it would arrive from the remote side
pub fn inbound_message(hub: &RpcHub, method: &MethodDef, related_id: i64, arguments: Vec<RpcValue>) -> RpcMessage {
    let data = hub.serializer.serialize(&ArgumentList::new(arguments), method.has_polymorphic_arguments)
        .expect("test arguments can be serialized");
    RpcMessage::new(related_id, method.method_ref.clone(), data)
}

/// Panics if the message is not a system call
pub fn decode_system_call(hub: &RpcHub, message: &RpcMessage) -> (SystemMethodKind, ArgumentList) {
    let kind = SystemMethodKind::from_name(&message.method.method)
        .unwrap_or_else(|| panic!("not a system call: {:?}", message.method));
    let method = hub.system_calls.method(kind);
    let arguments = hub.serializer.deserialize(&message.argument_data, &method.argument_shape, true)
        .expect("system call arguments can be deserialized");
    (kind, arguments)
}


#[cfg(test)]
mod tests {
    use tracing::Level;

    use super::*;

    #[ctor::ctor]
    fn init_test_logging() {
        tracing_subscriber::fmt()
            .with_test_writer()
            .with_max_level(Level::DEBUG)
            // .with_max_level(Level::TRACE)
            .try_init()
            .ok();
    }

    #[test]
    fn test_inbound_message_decodes_as_system_call() {
        let hub = test_hub();
        let method = hub.system_calls.method(SystemMethodKind::Cancel).clone();
        let message = inbound_message(&hub, &method, 5, vec![]);
        let (kind, arguments) = decode_system_call(&hub, &message);
        assert_eq!(kind, SystemMethodKind::Cancel);
        assert!(arguments.is_empty());
    }
}
