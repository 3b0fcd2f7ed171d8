use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use rustc_hash::{FxBuildHasher, FxHashMap};
use tokio::time::{self, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::call::outbound_call::OutboundCall;
use crate::call::CallStage;
use crate::config::{RpcConfig, TimeoutAction};
use crate::error::{RpcError, RpcResult};
use crate::message::rpc_message::CallId;
use crate::message::seq_compressor::{compress_ids, decompress_ids};
use crate::peer::connection::ConnectionHandle;
use crate::peer::rpc_peer::RpcPeer;
use crate::util::random::jittered_period;

/// A peer's registry of outbound calls that await a result. Ids are assigned from a per-peer
///  counter. Calls with a run timeout are additionally kept in an 'in progress' index that the
///  periodic timeout sweep walks.
pub struct OutboundCallTracker {
    last_id: AtomicI64,
    calls: DashMap<CallId, Arc<OutboundCall>, FxBuildHasher>,
    in_progress: DashMap<CallId, Arc<OutboundCall>, FxBuildHasher>,
}

impl OutboundCallTracker {
    pub fn new() -> OutboundCallTracker {
        OutboundCallTracker {
            last_id: AtomicI64::new(0),
            calls: DashMap::with_hasher(FxBuildHasher),
            in_progress: DashMap::with_hasher(FxBuildHasher),
        }
    }

    /// Assigns an id to calls that have none, and validates that a pre-assigned id is not taken
    ///  by a different call
    pub fn register(&self, call: &Arc<OutboundCall>) -> RpcResult<()> {
        let id = match call.id() {
            0 => {
                let id = self.last_id.fetch_add(1, Ordering::AcqRel) + 1;
                call.set_id(id);
                id
            }
            id => id,
        };

        match self.calls.entry(id) {
            Entry::Occupied(e) => {
                if !Arc::ptr_eq(e.get(), call) {
                    return Err(RpcError::Internal(format!("outbound call id {} is already used", id)));
                }
            }
            Entry::Vacant(e) => {
                e.insert(call.clone());
            }
        }
        if call.method.timeouts.run_timeout.is_some() {
            self.in_progress.insert(id, call.clone());
        }
        Ok(())
    }

    pub fn get(&self, id: CallId) -> Option<Arc<OutboundCall>> {
        self.calls.get(&id).map(|c| c.value().clone())
    }

    /// Returns `true` if and only if this invocation removed the call
    pub fn unregister(&self, call: &OutboundCall) -> bool {
        let id = call.id();
        let removed = self.calls.remove_if(&id, |_, c| std::ptr::eq(c.as_ref(), call)).is_some();
        if removed {
            self.in_progress.remove_if(&id, |_, c| std::ptr::eq(c.as_ref(), call));
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.calls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }

    fn snapshot(&self) -> Vec<Arc<OutboundCall>> {
        self.calls.iter()
            .map(|e| e.value().clone())
            .collect()
    }

    /// Aborts all calls whose routing target changed, so the retry loop reattempts them
    pub fn try_reroute(&self) -> usize {
        let mut num_rerouted = 0;
        for call in self.snapshot() {
            if call.is_peer_changed() && call.set_error(RpcError::Reroute, true) {
                num_rerouted += 1;
            }
        }
        if num_rerouted > 0 {
            debug!("{} calls rerouted", num_rerouted);
        }
        num_rerouted
    }

    /// Periodically applies run timeouts and logs a summary of the calls in progress. Runs for the
    ///  peer's lifetime.
    pub async fn maintain(&self, config: &RpcConfig, stop: CancellationToken) {
        let mut last_summary_at = Instant::now();
        loop {
            tokio::select! {
                _ = time::sleep(jittered_period(config.call_timeout_check_period)) => {}
                _ = stop.cancelled() => return,
            }

            let now = Instant::now();
            self.check_timeouts(config, now);

            if now.duration_since(last_summary_at) >= config.call_summary_log_period {
                let num_calls = self.len();
                if num_calls >= config.call_summary_log_min_count {
                    info!("{} outbound calls in progress", num_calls);
                }
                last_summary_at = now;
            }
        }
    }

    pub(crate) fn check_timeouts(&self, config: &RpcConfig, now: Instant) {
        let mut num_logged = 0;
        let mut num_not_logged = 0;

        let calls = self.in_progress.iter()
            .map(|e| e.value().clone())
            .collect::<Vec<_>>();
        for call in calls {
            if call.is_completed() {
                self.in_progress.remove_if(&call.id(), |_, c| Arc::ptr_eq(c, &call));
                continue;
            }
            let timeouts = &call.method.timeouts;
            let Some(run_timeout) = timeouts.run_timeout else {
                continue;
            };
            let elapsed = now.duration_since(call.started_at());
            if elapsed < run_timeout {
                continue;
            }

            if timeouts.action.contains(TimeoutAction::LOG) {
                if num_logged < config.log_delayed_call_limit {
                    warn!(?call, ?elapsed, "call is delayed");
                    num_logged += 1;
                }
                else {
                    num_not_logged += 1;
                }
            }
            if timeouts.action.contains(TimeoutAction::FAIL) {
                if call.set_error(RpcError::CallTimeout { timeout: run_timeout }, true) {
                    error!(?call, ?elapsed, "call timed out");
                }
            }
            else {
                call.set_started_at(now);
            }
        }

        if num_not_logged > 0 {
            warn!("{} more delayed calls aren't logged", num_not_logged);
        }
    }

    /// Replays in-flight calls on a new connection. After a peer change everything is resent; on
    ///  the same remote peer, call ids are reported by stage and only the ids the callee does not
    ///  know are resent.
    pub async fn reconnect(&self, peer: &Arc<RpcPeer>, connection: &Arc<ConnectionHandle>, handshake_index: i64, is_peer_changed: bool, abort: &CancellationToken) {
        let calls = self.snapshot();
        if calls.is_empty() {
            return;
        }

        if is_peer_changed {
            debug!(peer = ?peer.peer_ref, "peer changed, resending {} calls", calls.len());
            Self::resend(&calls, connection).await;
            return;
        }

        let mut by_stage: FxHashMap<CallStage, Vec<CallId>> = FxHashMap::default();
        for call in &calls {
            if let Some(stage) = call.reconnect_stage() {
                by_stage.entry(stage).or_default().push(call.id());
            }
        }
        if by_stage.is_empty() {
            return;
        }
        let stages = by_stage.into_iter()
            .map(|(stage, ids)| (stage, compress_ids(&ids)))
            .collect::<Vec<_>>();

        let unknown_ids = match peer.hub.system_calls.reconnect(peer, handshake_index, stages, abort).await {
            Ok(data) => decompress_ids(&data),
            Err(e) => Err(anyhow::anyhow!(e)),
        };
        match unknown_ids {
            Ok(ids) => {
                debug!(peer = ?peer.peer_ref, "reconnected, resending {} unknown calls", ids.len());
                let calls = ids.into_iter()
                    .filter_map(|id| self.get(id))
                    .collect::<Vec<_>>();
                Self::resend(&calls, connection).await;
            }
            Err(e) => {
                if abort.is_cancelled() {
                    return;
                }
                warn!(peer = ?peer.peer_ref, "reconnect failed, resending all calls: {:#}", e);
                Self::resend(&calls, connection).await;
            }
        }
    }

    async fn resend(calls: &[Arc<OutboundCall>], connection: &ConnectionHandle) {
        for call in calls {
            if call.reconnect_stage().is_some() {
                call.send_registered(connection).await;
            }
        }
    }

    /// Fails all calls with the given error. Runs several cycles, since calls may be registered
    ///  concurrently with the abort.
    pub async fn abort(&self, error: RpcError, config: &RpcConfig) -> usize {
        let mut num_aborted = 0;
        for cycle in 0..config.call_abort_cycle_count {
            let calls = self.snapshot();
            if calls.is_empty() {
                break;
            }
            for call in calls {
                if call.set_error(error.clone(), false) {
                    num_aborted += 1;
                }
                else {
                    self.unregister(&call);
                }
            }
            if cycle + 1 < config.call_abort_cycle_count {
                time::sleep(config.call_abort_cycle_period).await;
            }
        }
        if num_aborted > 0 {
            debug!("{} outbound calls aborted: {}", num_aborted, error);
        }
        num_aborted
    }
}

impl Default for OutboundCallTracker {
    fn default() -> Self {
        OutboundCallTracker::new()
    }
}
