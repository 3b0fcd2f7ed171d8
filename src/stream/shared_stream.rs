use std::any::Any;
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::{FutureExt, StreamExt};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};
use uuid::Uuid;

use crate::error::{ErrorInfo, RpcError, RpcResult};
use crate::message::value::{RpcValue, StreamRef, ValueKind};
use crate::object::object_id::RpcObjectId;
use crate::object::SharedObject;
use crate::peer::rpc_peer::RpcPeer;
use crate::stream::ring_buffer::RingBuffer;

pub type ItemSource = BoxStream<'static, RpcResult<RpcValue>>;

#[derive(Clone, Copy, Debug)]
struct Ack {
    next_index: i64,
    must_reset: bool,
}

#[derive(Clone, Debug)]
enum BufferedItem {
    Value(RpcValue),
    /// the last item of a stream, carrying the error the source failed with (if any)
    End(Option<ErrorInfo>),
}

enum RunState {
    NotStarted(ItemSource),
    Running(mpsc::UnboundedSender<Ack>),
    Stopped,
}

/// The producer end of a stream. It starts sending when the consumer requests position 0, and
///  after that sends only within the window `[ack, ack + ack_advance)` of the latest
///  acknowledgement. Items are buffered until acknowledged, so the consumer can ask for a resend
///  of everything after its last acknowledgement (e.g. after a reconnect).
pub struct SharedStream {
    pub id: RpcObjectId,
    peer: Arc<RpcPeer>,
    ack_period: i64,
    ack_advance: i64,
    batch_size: usize,
    last_keep_alive_at: Mutex<Instant>,
    state: Mutex<RunState>,
    stop: CancellationToken,
}

impl SharedStream {
    pub fn new(peer: Arc<RpcPeer>, source: ItemSource, ack_period: i64, ack_advance: i64) -> Arc<SharedStream> {
        let id = peer.shared_objects.next_id(peer.id);
        let batch_size = peer.hub.config.stream_batch_size.max(1);
        Arc::new(SharedStream {
            id,
            peer,
            ack_period,
            ack_advance: ack_advance.max(1),
            batch_size,
            last_keep_alive_at: Mutex::new(Instant::now()),
            state: Mutex::new(RunState::NotStarted(source)),
            stop: CancellationToken::new(),
        })
    }

    pub fn stream_ref(&self) -> StreamRef {
        StreamRef {
            id: self.id,
            ack_period: self.ack_period,
            ack_advance: self.ack_advance,
        }
    }

    /// A non-nil `host_id` requests a reset to `next_index`, `i64::MAX` means the consumer is done
    pub async fn on_ack(self: &Arc<Self>, next_index: i64, host_id: Uuid) {
        let must_reset = !host_id.is_nil();
        if must_reset && host_id != self.id.host_id {
            debug!(id = ?self.id, ?host_id, "ack for a different host");
            self.send_missing().await;
            return;
        }

        self.keep_alive();
        let ack = Ack { next_index, must_reset };
        let is_accepted = {
            let mut state = self.state.lock();
            if let RunState::Running(acks) = &*state {
                acks.send(ack).is_ok()
            }
            else if matches!(*state, RunState::NotStarted(_)) && must_reset && next_index == 0 {
                let (sender, receiver) = mpsc::unbounded_channel();
                let previous = std::mem::replace(&mut *state, RunState::Running(sender.clone()));
                match previous {
                    RunState::NotStarted(source) => {
                        let _ = sender.send(ack);
                        trace!(id = ?self.id, "starting shared stream");
                        tokio::spawn(self.clone().run(source, receiver));
                        true
                    }
                    _ => false,
                }
            }
            else {
                false
            }
        };

        if !is_accepted {
            self.send_missing().await;
        }
    }

    async fn run(self: Arc<Self>, mut source: ItemSource, mut acks: mpsc::UnboundedReceiver<Ack>) {
        let mut buffer = RingBuffer::new(self.ack_advance as usize + 1);
        let mut buffer_start = 0i64;
        let mut index = 0i64;
        let mut is_fully_buffered = false;
        let mut batcher = Batcher::new(self.batch_size);
        let mut pending_ack = None;

        'ack: loop {
            // 1. wait for acknowledgements, processing all that are queued
            self.flush(&mut batcher, index).await;
            let mut ack = match pending_ack.take() {
                Some(ack) => ack,
                None => tokio::select! {
                    ack = acks.recv() => match ack {
                        Some(ack) => ack,
                        None => break,
                    },
                    _ = self.stop.cancelled() => break,
                },
            };
            loop {
                if ack.next_index == i64::MAX {
                    trace!(id = ?self.id, "consumer is done");
                    break 'ack;
                }
                if ack.must_reset || index < ack.next_index {
                    index = ack.next_index;
                }
                match acks.try_recv() {
                    Ok(next) => ack = next,
                    Err(_) => break,
                }
            }

            // 2. drop acknowledged items
            let shift = (ack.next_index - buffer_start).clamp(0, buffer.len() as i64);
            buffer_start += buffer.move_head(shift as usize) as i64;

            // 3. send the window [ack.next_index, ack.next_index + ack_advance)
            if index < buffer_start {
                debug!(id = ?self.id, index, buffer_start, "requested position is not buffered any more");
                self.send(index, BufferedItem::End(Some(RpcError::StreamInvalidPosition.to_info()))).await;
                continue;
            }
            let mut buffer_index = (index - buffer_start) as usize;
            let max_index = ack.next_index + self.ack_advance;
            while index < max_index {
                let mut is_source_pending = false;
                while !is_fully_buffered && (buffer.has_remaining_capacity() || buffer_index >= buffer.len()) {
                    if !buffer.has_remaining_capacity() {
                        // everything buffered precedes the requested position
                        buffer.pop_head();
                        buffer_start += 1;
                        buffer_index -= 1;
                    }
                    match source.next().now_or_never() {
                        Some(next) => {
                            is_fully_buffered = self.buffer_item(&mut buffer, next);
                            drop_acknowledged(&mut buffer, &mut buffer_start, &mut buffer_index, ack.next_index);
                        }
                        None => {
                            is_source_pending = true;
                            break;
                        }
                    }
                }

                while index < max_index {
                    let Some(item) = buffer.get(buffer_index).cloned() else {
                        break;
                    };
                    buffer_index += 1;
                    let is_end = matches!(item, BufferedItem::End(_));
                    self.add(&mut batcher, index, item).await;
                    index += 1;
                    if is_end {
                        continue 'ack;
                    }
                }
                if is_fully_buffered {
                    continue 'ack;
                }
                if !is_source_pending {
                    continue;
                }

                // 4. nothing more to send until an item is produced or an ack arrives
                self.flush(&mut batcher, index).await;
                tokio::select! {
                    ack = acks.recv() => match ack {
                        Some(ack) => {
                            pending_ack = Some(ack);
                            continue 'ack;
                        }
                        None => break 'ack,
                    },
                    next = source.next() => {
                        is_fully_buffered = self.buffer_item(&mut buffer, next);
                        drop_acknowledged(&mut buffer, &mut buffer_start, &mut buffer_index, ack.next_index);
                    }
                    _ = self.stop.cancelled() => break 'ack,
                }
            }
        }

        self.finish();
    }

    /// returns `true` if the item was the source's last
    fn buffer_item(&self, buffer: &mut RingBuffer<BufferedItem>, next: Option<RpcResult<RpcValue>>) -> bool {
        let (item, is_last) = match next {
            Some(Ok(value)) => (BufferedItem::Value(value), false),
            Some(Err(e)) => (BufferedItem::End(Some(e.to_info())), true),
            None => (BufferedItem::End(None), true),
        };
        if buffer.push_tail(item).is_err() {
            warn!(id = ?self.id, "stream buffer overflow - this is a bug");
        }
        is_last
    }

    async fn add(&self, batcher: &mut Batcher, index: i64, item: BufferedItem) {
        match item {
            BufferedItem::Value(value) => {
                let kind = value.kind();
                if batcher.items.len() >= batcher.batch_size || batcher.kind.is_some_and(|k| k != kind) {
                    self.flush(batcher, index).await;
                }
                batcher.kind = Some(kind);
                batcher.items.push(value);
            }
            end => {
                self.flush(batcher, index).await;
                self.send(index, end).await;
            }
        }
    }

    async fn flush(&self, batcher: &mut Batcher, next_index: i64) {
        let mut items = std::mem::take(&mut batcher.items);
        batcher.kind = None;
        match items.len() {
            0 => {}
            1 => {
                if let Some(item) = items.pop() {
                    self.send(next_index - 1, BufferedItem::Value(item)).await;
                }
            }
            n => {
                self.peer.hub.system_calls.batch(&self.peer, self.id.local_id, next_index - n as i64, items).await;
            }
        }
    }

    async fn send(&self, index: i64, item: BufferedItem) {
        let system_calls = &self.peer.hub.system_calls;
        match item {
            BufferedItem::Value(value) => system_calls.item(&self.peer, self.id.local_id, index, value).await,
            BufferedItem::End(error) => system_calls.end(&self.peer, self.id.local_id, index, error).await,
        };
    }

    async fn send_missing(&self) {
        self.peer.hub.system_calls.disconnect(&self.peer, &[self.id.local_id]).await;
    }

    fn finish(&self) {
        *self.state.lock() = RunState::Stopped;
        self.peer.shared_objects.unregister(self);
    }
}

/// Items produced after an acknowledgement skipped past them are acknowledged already and are not
///  kept. `buffer_index` never underflows since the send position is at or after `next_index`.
fn drop_acknowledged(buffer: &mut RingBuffer<BufferedItem>, buffer_start: &mut i64, buffer_index: &mut usize, next_index: i64) {
    while *buffer_start < next_index && buffer.pop_head().is_some() {
        *buffer_start += 1;
        *buffer_index -= 1;
    }
}

struct Batcher {
    batch_size: usize,
    items: Vec<RpcValue>,
    /// items of different kinds are never batched together
    kind: Option<ValueKind>,
}

impl Batcher {
    fn new(batch_size: usize) -> Batcher {
        Batcher {
            batch_size,
            items: Vec::with_capacity((batch_size / 4).max(1)),
            kind: None,
        }
    }
}

#[async_trait]
impl SharedObject for SharedStream {
    fn id(&self) -> RpcObjectId {
        self.id
    }

    fn last_keep_alive_at(&self) -> Instant {
        *self.last_keep_alive_at.lock()
    }

    fn keep_alive(&self) {
        *self.last_keep_alive_at.lock() = Instant::now();
    }

    async fn dispose(&self) {
        self.stop.cancel();
        self.finish();
    }

    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}


#[cfg(test)]
mod tests {
    use futures::stream;
    use tokio::sync::mpsc::Receiver;

    use super::*;
    use crate::message::arguments::ArgumentList;
    use crate::message::rpc_message::RpcMessage;
    use crate::message::value::RpcValue::I64;
    use crate::system::system_calls::SystemMethodKind;
    use crate::test_util::{connected_test_peer, decode_system_call, test_hub};

    fn numbers(n: i64) -> ItemSource {
        stream::iter((0..n).map(|i| Ok(I64(i)))).boxed()
    }

    fn shared(peer: &Arc<RpcPeer>, source: ItemSource, ack_advance: i64) -> Arc<SharedStream> {
        let stream = SharedStream::new(peer.clone(), source, 1, ack_advance);
        peer.shared_objects.register(stream.clone()).unwrap();
        stream
    }

    async fn next_call(peer: &Arc<RpcPeer>, outgoing: &mut Receiver<RpcMessage>) -> (SystemMethodKind, i64, ArgumentList) {
        let message = outgoing.recv().await.unwrap();
        let (kind, arguments) = decode_system_call(&peer.hub, &message);
        (kind, message.related_id, arguments)
    }

    #[tokio::test]
    async fn test_window_and_invalid_position() {
        let hub = test_hub();
        let (peer, mut outgoing) = connected_test_peer(&hub);
        let stream = shared(&peer, numbers(10), 2);

        stream.on_ack(0, peer.id).await;
        let (kind, related_id, arguments) = next_call(&peer, &mut outgoing).await;
        assert_eq!(kind, SystemMethodKind::B);
        assert_eq!(related_id, stream.id.local_id);
        assert_eq!(arguments.i64_at(0).unwrap(), 0);
        assert_eq!(arguments.list_at(1).unwrap(), &[I64(0), I64(1)]);

        stream.on_ack(5, Uuid::nil()).await;
        let (kind, _, arguments) = next_call(&peer, &mut outgoing).await;
        assert_eq!(kind, SystemMethodKind::B);
        assert_eq!(arguments.i64_at(0).unwrap(), 5);
        assert_eq!(arguments.list_at(1).unwrap(), &[I64(5), I64(6)]);

        stream.on_ack(0, peer.id).await;
        let (kind, _, arguments) = next_call(&peer, &mut outgoing).await;
        assert_eq!(kind, SystemMethodKind::End);
        assert_eq!(arguments.i64_at(0).unwrap(), 0);
        assert_eq!(arguments.error_at(1).unwrap(), Some(RpcError::StreamInvalidPosition.to_info()));
    }

    #[tokio::test]
    async fn test_acknowledged_items_are_not_buffered() {
        let hub = test_hub();
        let (peer, mut outgoing) = connected_test_peer(&hub);
        let stream = shared(&peer, numbers(10), 2);

        stream.on_ack(0, peer.id).await;
        let (_, _, arguments) = next_call(&peer, &mut outgoing).await;
        assert_eq!(arguments.list_at(1).unwrap(), &[I64(0), I64(1)]);

        // items 3 and 4 are produced while skipping to 5, but they are acknowledged already
        stream.on_ack(5, Uuid::nil()).await;
        let (_, _, arguments) = next_call(&peer, &mut outgoing).await;
        assert_eq!(arguments.i64_at(0).unwrap(), 5);
        assert_eq!(arguments.list_at(1).unwrap(), &[I64(5), I64(6)]);

        stream.on_ack(4, peer.id).await;
        let (kind, _, arguments) = next_call(&peer, &mut outgoing).await;
        assert_eq!(kind, SystemMethodKind::End);
        assert_eq!(arguments.i64_at(0).unwrap(), 4);
        assert_eq!(arguments.error_at(1).unwrap(), Some(RpcError::StreamInvalidPosition.to_info()));

        stream.on_ack(5, peer.id).await;
        let (kind, _, arguments) = next_call(&peer, &mut outgoing).await;
        assert_eq!(kind, SystemMethodKind::B);
        assert_eq!(arguments.list_at(1).unwrap(), &[I64(5), I64(6)]);
    }

    #[tokio::test]
    async fn test_resend_after_reset_and_end() {
        let hub = test_hub();
        let (peer, mut outgoing) = connected_test_peer(&hub);
        let stream = shared(&peer, numbers(3), 2);

        stream.on_ack(0, peer.id).await;
        let (_, _, arguments) = next_call(&peer, &mut outgoing).await;
        assert_eq!(arguments.list_at(1).unwrap(), &[I64(0), I64(1)]);

        // the consumer lost item 1
        stream.on_ack(1, peer.id).await;
        let (_, _, arguments) = next_call(&peer, &mut outgoing).await;
        assert_eq!(arguments.list_at(1).unwrap(), &[I64(1), I64(2)]);

        stream.on_ack(3, Uuid::nil()).await;
        let (kind, _, arguments) = next_call(&peer, &mut outgoing).await;
        assert_eq!(kind, SystemMethodKind::End);
        assert_eq!(arguments.i64_at(0).unwrap(), 3);
        assert_eq!(arguments.error_at(1).unwrap(), None);

        stream.on_ack(i64::MAX, peer.id).await;
        for _ in 0..100 {
            if peer.shared_objects.get(stream.id.local_id).is_none() {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert!(peer.shared_objects.get(stream.id.local_id).is_none());
    }

    #[tokio::test]
    async fn test_source_error_ends_stream() {
        let hub = test_hub();
        let (peer, mut outgoing) = connected_test_peer(&hub);
        let source = stream::iter(vec![Ok(I64(0)), Err(RpcError::Internal("boom".to_string()))]).boxed();
        let stream = shared(&peer, source, 5);

        stream.on_ack(0, peer.id).await;
        let (kind, _, arguments) = next_call(&peer, &mut outgoing).await;
        assert_eq!(kind, SystemMethodKind::I);
        assert_eq!(arguments.value_at(1).unwrap(), I64(0));

        let (kind, _, arguments) = next_call(&peer, &mut outgoing).await;
        assert_eq!(kind, SystemMethodKind::End);
        assert_eq!(arguments.i64_at(0).unwrap(), 1);
        assert_eq!(arguments.error_at(1).unwrap(), Some(RpcError::Internal("boom".to_string()).to_info()));
    }

    #[tokio::test]
    async fn test_batches_split_by_kind() {
        let hub = test_hub();
        let (peer, mut outgoing) = connected_test_peer(&hub);
        let source = stream::iter(vec![Ok(I64(0)), Ok(I64(1)), Ok("a".into())]).boxed();
        let stream = shared(&peer, source, 3);

        stream.on_ack(0, peer.id).await;
        let (kind, _, arguments) = next_call(&peer, &mut outgoing).await;
        assert_eq!(kind, SystemMethodKind::B);
        assert_eq!(arguments.list_at(1).unwrap(), &[I64(0), I64(1)]);
        let (kind, _, arguments) = next_call(&peer, &mut outgoing).await;
        assert_eq!(kind, SystemMethodKind::I);
        assert_eq!(arguments.i64_at(0).unwrap(), 2);
    }

    #[tokio::test]
    async fn test_acks_that_can_not_be_served() {
        let hub = test_hub();
        let (peer, mut outgoing) = connected_test_peer(&hub);
        let stream = shared(&peer, numbers(3), 2);

        // not started yet, and only a reset to 0 starts it
        stream.on_ack(1, Uuid::nil()).await;
        let (kind, _, arguments) = next_call(&peer, &mut outgoing).await;
        assert_eq!(kind, SystemMethodKind::Disconnect);
        assert_eq!(arguments.list_at(0).unwrap(), &[I64(stream.id.local_id)]);

        stream.on_ack(0, Uuid::new_v4()).await;
        let (kind, _, _) = next_call(&peer, &mut outgoing).await;
        assert_eq!(kind, SystemMethodKind::Disconnect);

        stream.dispose().await;
        stream.on_ack(0, peer.id).await;
        let (kind, _, _) = next_call(&peer, &mut outgoing).await;
        assert_eq!(kind, SystemMethodKind::Disconnect);
        assert!(peer.shared_objects.is_empty());
    }
}
