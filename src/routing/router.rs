use std::fmt::{Debug, Formatter};
use std::sync::Arc;

#[cfg(test)] use mockall::automock;
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::RpcResult;
use crate::message::arguments::ArgumentList;
use crate::message::peer_ref::ParsedRpcPeerRef;
use crate::method::method_def::MethodDef;

/// Marks a routing decision as stale. A peer whose route state changed is obsolete: it is removed
///  from the hub, and all of its calls are rerouted.
#[derive(Debug, Default)]
pub struct RouteState {
    changed: CancellationToken,
}
impl RouteState {
    pub fn new() -> RouteState {
        RouteState::default()
    }

    pub fn mark_changed(&self) {
        self.changed.cancel();
    }

    pub fn is_changed(&self) -> bool {
        self.changed.is_cancelled()
    }

    pub async fn when_changed(&self) {
        self.changed.cancelled().await
    }
}

/// A routing target: the parsed peer ref plus (for rerouting-capable refs) the route state that
///  is signalled when the routing decision that produced this ref changes
#[derive(Clone)]
pub struct PeerRef {
    pub parsed: ParsedRpcPeerRef,
    route_state: Option<Arc<RouteState>>,
}

impl PeerRef {
    pub fn new(parsed: ParsedRpcPeerRef) -> PeerRef {
        PeerRef {
            parsed,
            route_state: None,
        }
    }

    pub fn with_route_state(parsed: ParsedRpcPeerRef, route_state: Arc<RouteState>) -> PeerRef {
        PeerRef {
            parsed,
            route_state: Some(route_state),
        }
    }

    /// the key of the peer in the hub's peer map
    pub fn key(&self) -> String {
        self.parsed.to_string()
    }

    pub fn can_be_rerouted(&self) -> bool {
        self.route_state.is_some()
    }

    pub fn is_obsolete(&self) -> bool {
        self.route_state.as_ref()
            .map(|s| s.is_changed())
            .unwrap_or(false)
    }

    pub fn route_state(&self) -> Option<&Arc<RouteState>> {
        self.route_state.as_ref()
    }

    /// never completes for refs without route state
    pub async fn when_obsolete(&self) {
        match &self.route_state {
            Some(s) => s.when_changed().await,
            None => std::future::pending().await,
        }
    }
}

impl Debug for PeerRef {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self.parsed)?;
        if self.is_obsolete() {
            write!(f, "(obsolete)")?;
        }
        Ok(())
    }
}

#[cfg_attr(test, automock)]
pub trait RpcRouter: Send + Sync {
    fn route(&self, method: &MethodDef, arguments: &ArgumentList) -> RpcResult<PeerRef>;
}

/// Routes all calls to a single, fixed peer
pub struct StaticRouter {
    peer_ref: PeerRef,
}
impl StaticRouter {
    pub fn new(parsed: ParsedRpcPeerRef) -> StaticRouter {
        StaticRouter {
            peer_ref: PeerRef::new(parsed),
        }
    }
}
impl RpcRouter for StaticRouter {
    fn route(&self, _method: &MethodDef, _arguments: &ArgumentList) -> RpcResult<PeerRef> {
        Ok(self.peer_ref.clone())
    }
}

/// Routes by service name, falling back to a default target. Changing a target marks the previous
///  target's route state as changed, which triggers rerouting of all calls that went there.
pub struct TableRouter {
    default: RwLock<PeerRef>,
    by_service: RwLock<FxHashMap<String, PeerRef>>,
}

impl TableRouter {
    pub fn new(default: ParsedRpcPeerRef) -> TableRouter {
        TableRouter {
            default: RwLock::new(PeerRef::with_route_state(default, Arc::new(RouteState::new()))),
            by_service: Default::default(),
        }
    }

    pub fn set_default(&self, target: ParsedRpcPeerRef) {
        let mut default = self.default.write();
        debug!(from = ?default.parsed, to = ?target, "changing default route");
        Self::mark_obsolete(&default);
        *default = PeerRef::with_route_state(target, Arc::new(RouteState::new()));
    }

    pub fn set_route(&self, service: &str, target: ParsedRpcPeerRef) {
        let mut by_service = self.by_service.write();
        if let Some(prev) = by_service.get(service) {
            debug!(service, from = ?prev.parsed, to = ?target, "changing route");
            Self::mark_obsolete(prev);
        }
        by_service.insert(service.to_string(), PeerRef::with_route_state(target, Arc::new(RouteState::new())));
    }

    pub fn remove_route(&self, service: &str) {
        if let Some(prev) = self.by_service.write().remove(service) {
            Self::mark_obsolete(&prev);
        }
    }

    fn mark_obsolete(peer_ref: &PeerRef) {
        if let Some(s) = peer_ref.route_state() {
            s.mark_changed();
        }
    }
}

impl RpcRouter for TableRouter {
    fn route(&self, method: &MethodDef, _arguments: &ArgumentList) -> RpcResult<PeerRef> {
        if let Some(r) = self.by_service.read().get(method.service()) {
            return Ok(r.clone());
        }
        Ok(self.default.read().clone())
    }
}
