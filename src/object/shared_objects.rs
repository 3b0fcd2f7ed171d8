use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use rustc_hash::FxBuildHasher;
use tokio::time::{self, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::RpcConfig;
use crate::error::{RpcError, RpcResult};
use crate::object::object_id::RpcObjectId;
use crate::object::SharedObject;
use crate::peer::rpc_peer::RpcPeer;
use crate::util::random::jittered_period;

pub struct SharedObjectTracker {
    last_id: AtomicI64,
    objects: DashMap<i64, Arc<dyn SharedObject>, FxBuildHasher>,
    /// when the remote side last sent a keep-alive for any object
    last_keep_alive_at: Mutex<Instant>,
}

impl SharedObjectTracker {
    pub fn new() -> SharedObjectTracker {
        SharedObjectTracker {
            last_id: AtomicI64::new(0),
            objects: DashMap::with_hasher(FxBuildHasher),
            last_keep_alive_at: Mutex::new(Instant::now()),
        }
    }

    pub fn next_id(&self, host_id: Uuid) -> RpcObjectId {
        RpcObjectId::new(host_id, self.last_id.fetch_add(1, Ordering::AcqRel) + 1)
    }

    pub fn register(&self, object: Arc<dyn SharedObject>) -> RpcResult<()> {
        let local_id = object.id().local_id;
        match self.objects.entry(local_id) {
            Entry::Occupied(_) => Err(RpcError::ObjectAlreadyUsed(local_id)),
            Entry::Vacant(e) => {
                e.insert(object);
                Ok(())
            }
        }
    }

    pub fn get(&self, local_id: i64) -> Option<Arc<dyn SharedObject>> {
        self.objects.get(&local_id).map(|o| o.value().clone())
    }

    /// Returns `true` if and only if this invocation removed the object
    pub fn unregister(&self, object: &dyn SharedObject) -> bool {
        self.objects.remove_if(&object.id().local_id, |_, o| std::ptr::addr_eq(Arc::as_ptr(o), object)).is_some()
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    /// Refreshes the given objects. Ids this side does not know are reported back as
    ///  disconnected, so the remote side stops waiting for them.
    pub async fn keep_alive(&self, peer: &RpcPeer, local_ids: &[i64]) {
        *self.last_keep_alive_at.lock() = Instant::now();

        let mut unknown_ids = Vec::new();
        for local_id in local_ids {
            match self.get(*local_id) {
                Some(object) => object.keep_alive(),
                None => unknown_ids.push(*local_id),
            }
        }
        if !unknown_ids.is_empty() {
            debug!(peer = ?peer.peer_ref, ?unknown_ids, "keep-alive for unknown objects");
            peer.hub.system_calls.disconnect(peer, &unknown_ids).await;
        }
    }

    /// Runs while a connection is established: disconnects the peer if keep-alives stop coming,
    ///  and releases objects that were not kept alive for too long
    pub async fn maintain(&self, peer: &RpcPeer, abort: CancellationToken) {
        let config = &peer.hub.config;
        *self.last_keep_alive_at.lock() = Instant::now();

        loop {
            tokio::select! {
                _ = time::sleep(jittered_period(config.object_release_period)) => {}
                _ = abort.cancelled() => return,
            }

            let now = Instant::now();
            let since_keep_alive = now.duration_since(*self.last_keep_alive_at.lock());
            if since_keep_alive > config.keep_alive_timeout {
                warn!(peer = ?peer.peer_ref, "no keep-alive for {:?}, disconnecting", since_keep_alive);
                peer.disconnect(Some(RpcError::KeepAliveTimeout(config.keep_alive_timeout)));
                return;
            }

            let expired = self.objects.iter()
                .filter(|e| now.duration_since(e.value().last_keep_alive_at()) > config.object_release_timeout)
                .map(|e| e.value().clone())
                .collect::<Vec<_>>();
            for object in expired {
                if self.unregister(object.as_ref()) {
                    debug!(peer = ?peer.peer_ref, id = ?object.id(), "releasing expired shared object");
                    object.dispose().await;
                }
            }
        }
    }

    /// Releases all objects, repeatedly since objects may be registered concurrently
    pub async fn abort(&self, config: &RpcConfig) -> usize {
        let mut num_aborted = 0;
        for cycle in 0..config.object_abort_cycle_count {
            let objects = self.objects.iter()
                .map(|e| e.value().clone())
                .collect::<Vec<_>>();
            if objects.is_empty() {
                break;
            }
            for object in objects {
                if self.unregister(object.as_ref()) {
                    object.dispose().await;
                    num_aborted += 1;
                }
            }
            if cycle + 1 < config.object_abort_cycle_count {
                time::sleep(config.object_abort_cycle_period).await;
            }
        }
        num_aborted
    }
}

impl Default for SharedObjectTracker {
    fn default() -> Self {
        SharedObjectTracker::new()
    }
}
