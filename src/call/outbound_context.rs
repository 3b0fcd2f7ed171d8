use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::call::cache_info::{CacheInfoCapture, CachedResult};
use crate::call::outbound_call::OutboundCall;
use crate::error::RpcResult;
use crate::hub::RpcHub;
use crate::message::arguments::ArgumentList;
use crate::message::rpc_message::RpcHeader;
use crate::method::method_def::MethodDef;
use crate::peer::rpc_peer::RpcPeer;

/// Everything a caller specifies for one outbound call. This is passed explicitly down the call
///  chain; a context is prepared into a call against a concrete peer, and re-prepared against a
///  new peer when the call is rerouted.
#[derive(Clone)]
pub struct OutboundContext {
    pub method: Arc<MethodDef>,
    /// the local argument list, including the cancellation slot if the method has one
    pub arguments: ArgumentList,
    pub headers: Vec<RpcHeader>,
    pub cancellation: CancellationToken,
    /// a pinned target peer; `None` means 'route by method and arguments'
    pub peer: Option<Arc<RpcPeer>>,
    pub cached_result: Option<CachedResult>,
    pub cache_info_capture: Option<Arc<CacheInfoCapture>>,
}

impl OutboundContext {
    /// The cancellation token is taken from the method's cancellation slot if the arguments carry
    ///  one.
    pub fn new(method: Arc<MethodDef>, arguments: ArgumentList) -> OutboundContext {
        let cancellation = arguments.cancellation_token(method.cancellation_index)
            .unwrap_or_default();
        OutboundContext {
            method,
            arguments,
            headers: Vec::new(),
            cancellation,
            peer: None,
            cached_result: None,
            cache_info_capture: None,
        }
    }

    pub fn with_peer(mut self, peer: Arc<RpcPeer>) -> OutboundContext {
        self.peer = Some(peer);
        self
    }

    pub fn with_header(mut self, header: RpcHeader) -> OutboundContext {
        self.headers.retain(|h| h.name != header.name);
        self.headers.push(header);
        self
    }

    pub fn with_cancellation(mut self, cancellation: CancellationToken) -> OutboundContext {
        self.cancellation = cancellation;
        self
    }

    pub fn with_cached_result(mut self, cached_result: CachedResult) -> OutboundContext {
        self.cached_result = Some(cached_result);
        self
    }

    pub fn with_cache_info_capture(mut self, capture: Arc<CacheInfoCapture>) -> OutboundContext {
        self.cache_info_capture = Some(capture);
        self
    }

    pub fn allows_rerouting(&self) -> bool {
        self.peer.as_ref()
            .map(|p| p.peer_ref.can_be_rerouted())
            .unwrap_or(true)
    }

    /// Resolves the target peer (routing if none is pinned) and creates the call
    pub fn prepare_call(&mut self, hub: &Arc<RpcHub>) -> RpcResult<Arc<OutboundCall>> {
        let peer = match &self.peer {
            Some(peer) => peer.clone(),
            None => {
                let peer_ref = hub.router().route(&self.method, &self.arguments)?;
                let peer = hub.get_peer(&peer_ref)?;
                self.peer = Some(peer.clone());
                peer
            }
        };
        Ok(OutboundCall::new(self.clone(), peer))
    }

    /// Forgets the previous routing decision and prepares the call against the current target
    pub fn prepare_rerouted_call(&mut self, hub: &Arc<RpcHub>) -> RpcResult<Arc<OutboundCall>> {
        let prev_peer = self.peer.take();
        let call = self.prepare_call(hub)?;
        if let Some(prev_peer) = prev_peer {
            if Arc::ptr_eq(&prev_peer, &call.peer) {
                warn!(method = ?self.method, peer = ?call.peer.peer_ref, "call was rerouted to the same peer");
            }
        }
        Ok(call)
    }
}
