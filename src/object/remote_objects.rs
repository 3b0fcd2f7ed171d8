use std::sync::{Arc, Weak};

use dashmap::DashMap;
use rustc_hash::FxBuildHasher;
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

use crate::object::RemoteObject;
use crate::peer::rpc_peer::RpcPeer;
use crate::util::random::jittered_period;

/// Tracks this side's handles to objects owned by the remote side. Handles are held weakly: an
///  object the application dropped simply stops being kept alive, and the owner releases it.
pub struct RemoteObjectTracker {
    objects: DashMap<i64, Weak<dyn RemoteObject>, FxBuildHasher>,
}

impl RemoteObjectTracker {
    pub fn new() -> RemoteObjectTracker {
        RemoteObjectTracker {
            objects: DashMap::with_hasher(FxBuildHasher),
        }
    }

    /// A different live object registered under the same id is disconnected
    pub fn register(&self, object: &Arc<dyn RemoteObject>) {
        let previous = self.objects.insert(object.id().local_id, Arc::downgrade(object));
        if let Some(previous) = previous.and_then(|w| w.upgrade()) {
            if !Arc::ptr_eq(&previous, object) {
                debug!(id = ?object.id(), "replacing registered remote object");
                previous.disconnect();
            }
        }
    }

    /// Returns `true` if and only if this invocation removed the object
    pub fn unregister(&self, object: &dyn RemoteObject) -> bool {
        // NB: no upgrade while holding the shard lock, dropping the last strong reference there
        //  would re-enter the map from the object's destructor
        self.objects.remove_if(&object.id().local_id, |_, w| {
            w.strong_count() == 0 || std::ptr::addr_eq(w.as_ptr(), object)
        }).is_some()
    }

    pub fn get(&self, local_id: i64) -> Option<Arc<dyn RemoteObject>> {
        let weak = self.objects.get(&local_id)?.value().clone();
        weak.upgrade()
    }

    /// number of registered handles, including ones that were dropped but not pruned yet
    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    /// The owner reported these ids as unknown
    pub fn disconnect(&self, local_ids: &[i64]) {
        for local_id in local_ids {
            let removed = self.objects.remove(local_id);
            if let Some(object) = removed.and_then(|(_, w)| w.upgrade()) {
                debug!(id = ?object.id(), "remote object disconnected by its owner");
                object.disconnect();
            }
        }
    }

    fn live_objects(&self) -> Vec<Arc<dyn RemoteObject>> {
        self.objects.retain(|_, w| w.strong_count() > 0);
        let handles = self.objects.iter()
            .map(|e| e.value().clone())
            .collect::<Vec<_>>();
        handles.into_iter()
            .filter_map(|w| w.upgrade())
            .collect()
    }

    /// Runs while a connection is established. Objects hosted by the connected remote peer are
    ///  reconnected, objects of any other host can not be recovered and are disconnected. After
    ///  that, keep-alives for all live objects are sent periodically.
    pub async fn maintain(&self, peer: &RpcPeer, remote_host_id: Uuid, abort: CancellationToken) {
        for object in self.live_objects() {
            if object.id().host_id == remote_host_id {
                object.reconnect().await;
            }
            else {
                self.unregister(object.as_ref());
                object.disconnect();
            }
        }

        let config = &peer.hub.config;
        loop {
            tokio::select! {
                _ = time::sleep(jittered_period(config.keep_alive_period)) => {}
                _ = abort.cancelled() => return,
            }

            let local_ids = self.live_objects().iter()
                .map(|o| o.id().local_id)
                .collect::<Vec<_>>();
            peer.hub.system_calls.keep_alive(peer, &local_ids).await;
        }
    }

    /// Disconnects all objects, e.g. when the remote peer changed
    pub fn abort(&self) -> usize {
        let objects = self.live_objects();
        self.objects.clear();
        for object in &objects {
            object.disconnect();
        }
        objects.len()
    }
}

impl Default for RemoteObjectTracker {
    fn default() -> Self {
        RemoteObjectTracker::new()
    }
}
