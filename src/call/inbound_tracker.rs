use std::sync::Arc;

use dashmap::DashMap;
use rustc_hash::FxBuildHasher;

use crate::call::inbound_call::InboundCall;
use crate::message::rpc_message::CallId;

/// A peer's registry of inbound calls that are being processed, used to deduplicate calls that
///  are delivered again after a reconnect
pub struct InboundCallTracker {
    calls: DashMap<CallId, Arc<InboundCall>, FxBuildHasher>,
}

impl InboundCallTracker {
    pub fn new() -> InboundCallTracker {
        InboundCallTracker {
            calls: DashMap::with_hasher(FxBuildHasher),
        }
    }

    /// Returns the call that is registered for the call's id - which is the call itself unless
    ///  a call with the same id was registered before. No-wait calls are never stored.
    pub fn get_or_register(&self, call: &Arc<InboundCall>) -> Arc<InboundCall> {
        if call.id == 0 {
            return call.clone();
        }
        self.calls.entry(call.id)
            .or_insert_with(|| call.clone())
            .value()
            .clone()
    }

    pub fn get(&self, id: CallId) -> Option<Arc<InboundCall>> {
        self.calls.get(&id).map(|c| c.value().clone())
    }

    /// Returns `true` if and only if this invocation removed the call. No-wait calls always
    ///  report `true` since there is nothing to remove.
    pub fn unregister(&self, call: &InboundCall) -> bool {
        if call.id == 0 {
            return true;
        }
        self.calls.remove_if(&call.id, |_, c| std::ptr::eq(c.as_ref(), call)).is_some()
    }

    pub fn clear(&self) {
        self.calls.clear();
    }

    pub fn len(&self) -> usize {
        self.calls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }
}

impl Default for InboundCallTracker {
    fn default() -> Self {
        InboundCallTracker::new()
    }
}
