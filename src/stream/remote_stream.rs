use std::any::Any;
use std::sync::Arc;

use async_trait::async_trait;
use futures::Stream;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, trace};
use uuid::Uuid;

use crate::error::{ErrorInfo, RpcError, RpcResult};
use crate::message::value::{RpcValue, StreamRef};
use crate::object::object_id::RpcObjectId;
use crate::object::RemoteObject;
use crate::peer::rpc_peer::RpcPeer;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum AckRequest {
    Ack(i64),
    Reset(i64),
    End,
}

#[derive(Default)]
struct RemoteStreamState {
    /// present while items are being received
    items: Option<mpsc::UnboundedSender<RpcResult<RpcValue>>>,
    next_index: i64,
    is_enumerated: bool,
    is_disconnected: bool,
}

/// The consumer end of a stream shared by the remote side. Items must arrive in sequence: a gap
///  makes the consumer request a reset to the first missing position, duplicates are dropped.
pub struct RemoteStream {
    pub stream_ref: StreamRef,
    peer: Arc<RpcPeer>,
    state: Mutex<RemoteStreamState>,
}

impl RemoteStream {
    pub fn new(peer: Arc<RpcPeer>, stream_ref: StreamRef) -> Arc<RemoteStream> {
        Arc::new(RemoteStream {
            stream_ref,
            peer,
            state: Default::default(),
        })
    }

    /// Starts receiving. A remote stream can be enumerated only once.
    pub async fn subscribe(self: &Arc<Self>) -> RpcResult<RemoteStreamReader> {
        let items = {
            let mut state = self.state.lock();
            if state.is_enumerated {
                return Err(RpcError::RemoteStreamEnumeratedTwice);
            }
            state.is_enumerated = true;
            let (sender, receiver) = mpsc::unbounded_channel();
            state.items = Some(sender);
            receiver
        };

        let object: Arc<dyn RemoteObject> = self.clone();
        self.peer.remote_objects.register(&object);
        self.send(AckRequest::Reset(0)).await;

        Ok(RemoteStreamReader {
            stream: self.clone(),
            items,
            next_index: 0,
            is_ended: false,
        })
    }

    pub async fn on_item(&self, index: i64, item: RpcValue) {
        let request = {
            let mut state = self.state.lock();
            match self.check_index(&state, index) {
                Ok(items) => {
                    let _ = items.send(Ok(item));
                    state.next_index += 1;
                    None
                }
                Err(request) => request,
            }
        };
        if let Some(request) = request {
            self.send(request).await;
        }
    }

    pub async fn on_batch(&self, index: i64, items: Vec<RpcValue>) {
        let request = {
            let mut state = self.state.lock();
            match self.check_index(&state, index) {
                Ok(sender) => {
                    state.next_index += items.len() as i64;
                    for item in items {
                        let _ = sender.send(Ok(item));
                    }
                    None
                }
                Err(request) => request,
            }
        };
        if let Some(request) = request {
            self.send(request).await;
        }
    }

    pub async fn on_end(&self, index: i64, error: Option<ErrorInfo>) {
        let (request, is_closed) = {
            let mut state = self.state.lock();
            match self.check_index(&state, index) {
                Ok(_) => {
                    trace!(id = ?self.stream_ref.id, index, "stream ended");
                    (Self::close_locked(&mut state, error.map(|e| RpcError::from_info(&e))), true)
                }
                Err(request) => (request, false),
            }
        };
        if is_closed {
            self.peer.remote_objects.unregister(self);
        }
        if let Some(request) = request {
            self.send(request).await;
        }
    }

    /// Returns the item sink if `index` is the next expected position, or the acknowledgement to
    ///  send otherwise
    fn check_index(&self, state: &RemoteStreamState, index: i64) -> Result<mpsc::UnboundedSender<RpcResult<RpcValue>>, Option<AckRequest>> {
        let Some(items) = &state.items else {
            return Err(None);
        };
        if index < state.next_index {
            return Err(self.maybe_ack(index));
        }
        if index > state.next_index {
            debug!(id = ?self.stream_ref.id, index, expected = state.next_index, "gap in stream, requesting reset");
            return Err(Some(AckRequest::Reset(state.next_index)));
        }
        Ok(items.clone())
    }

    fn maybe_ack(&self, index: i64) -> Option<AckRequest> {
        (index > 0 && index % self.stream_ref.ack_period.max(1) == 0)
            .then_some(AckRequest::Ack(index))
    }

    /// NB: the caller must unregister the stream after releasing the lock
    fn close_locked(state: &mut RemoteStreamState, error: Option<RpcError>) -> Option<AckRequest> {
        let items = state.items.take()?;
        if let Some(error) = error {
            let _ = items.send(Err(error));
        }
        if state.next_index == i64::MAX {
            return None;
        }
        state.next_index = i64::MAX;
        Some(AckRequest::End)
    }

    fn close(self: &Arc<Self>) {
        let request = Self::close_locked(&mut self.state.lock(), None);
        self.peer.remote_objects.unregister(self.as_ref());
        if let (Some(request), Ok(runtime)) = (request, tokio::runtime::Handle::try_current()) {
            let stream = self.clone();
            runtime.spawn(async move { stream.send(request).await });
        }
    }

    async fn send(&self, request: AckRequest) {
        if self.state.lock().is_disconnected {
            return;
        }
        let system_calls = &self.peer.hub.system_calls;
        let id = self.stream_ref.id;
        match request {
            AckRequest::Ack(index) => system_calls.ack(&self.peer, id.local_id, index, Uuid::nil()).await,
            AckRequest::Reset(index) => system_calls.ack(&self.peer, id.local_id, index, id.host_id).await,
            AckRequest::End => system_calls.ack_end(&self.peer, id.local_id, id.host_id).await,
        };
    }
}

#[async_trait]
impl RemoteObject for RemoteStream {
    fn id(&self) -> RpcObjectId {
        self.stream_ref.id
    }

    async fn reconnect(&self) {
        let request = {
            let state = self.state.lock();
            (state.items.is_some() && !state.is_disconnected).then_some(AckRequest::Reset(state.next_index))
        };
        if let Some(request) = request {
            self.send(request).await;
        }
    }

    fn disconnect(&self) {
        {
            let mut state = self.state.lock();
            if state.is_disconnected {
                return;
            }
            state.is_disconnected = true;
            Self::close_locked(&mut state, Some(RpcError::StreamNotFound));
        }
        self.peer.remote_objects.unregister(self);
    }

    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

/// Reads a remote stream's items in order. Dropping the reader before the stream ended tells the
///  producer to stop.
pub struct RemoteStreamReader {
    stream: Arc<RemoteStream>,
    items: mpsc::UnboundedReceiver<RpcResult<RpcValue>>,
    next_index: i64,
    is_ended: bool,
}

impl RemoteStreamReader {
    /// Returns `None` once the stream ended. An error is always the last item.
    pub async fn next(&mut self) -> Option<RpcResult<RpcValue>> {
        if self.is_ended {
            return None;
        }
        if let Some(request) = self.stream.maybe_ack(self.next_index) {
            self.stream.send(request).await;
        }
        match self.items.recv().await {
            Some(Ok(item)) => {
                self.next_index += 1;
                Some(Ok(item))
            }
            Some(Err(e)) => {
                self.is_ended = true;
                Some(Err(e))
            }
            None => {
                self.is_ended = true;
                None
            }
        }
    }

    pub fn into_stream(self) -> impl Stream<Item = RpcResult<RpcValue>> + Send {
        futures::stream::unfold(self, |mut reader| async move {
            reader.next().await.map(|item| (item, reader))
        })
    }
}

impl Drop for RemoteStreamReader {
    fn drop(&mut self) {
        self.stream.close();
    }
}


#[cfg(test)]
mod tests {
    use futures::StreamExt;
    use tokio::sync::mpsc::Receiver;

    use super::*;
    use crate::message::arguments::ArgumentList;
    use crate::message::rpc_message::RpcMessage;
    use crate::message::value::RpcValue::I64;
    use crate::system::system_calls::SystemMethodKind;
    use crate::test_util::{connected_test_peer, decode_system_call, test_hub};

    fn remote(peer: &Arc<RpcPeer>, ack_period: i64) -> Arc<RemoteStream> {
        RemoteStream::new(peer.clone(), StreamRef {
            id: RpcObjectId::new(Uuid::new_v4(), 7),
            ack_period,
            ack_advance: 10,
        })
    }

    async fn next_call(peer: &Arc<RpcPeer>, outgoing: &mut Receiver<RpcMessage>) -> (SystemMethodKind, ArgumentList) {
        let message = outgoing.recv().await.unwrap();
        assert_eq!(message.related_id, 7);
        decode_system_call(&peer.hub, &message)
    }

    async fn expect_ack(peer: &Arc<RpcPeer>, outgoing: &mut Receiver<RpcMessage>, next_index: i64, host_id: Uuid) {
        let (kind, arguments) = next_call(peer, outgoing).await;
        assert_eq!(kind, SystemMethodKind::Ack);
        assert_eq!(arguments.i64_at(0).unwrap(), next_index);
        assert_eq!(arguments.uuid_at(1).unwrap(), host_id);
    }

    #[tokio::test]
    async fn test_receive_in_order() {
        let hub = test_hub();
        let (peer, mut outgoing) = connected_test_peer(&hub);
        let stream = remote(&peer, 100);
        let host = stream.stream_ref.id.host_id;

        let reader = stream.subscribe().await.unwrap();
        expect_ack(&peer, &mut outgoing, 0, host).await;
        assert!(peer.remote_objects.get(7).is_some());

        stream.on_item(0, I64(0)).await;
        stream.on_batch(1, vec![I64(1), I64(2)]).await;
        // duplicate
        stream.on_item(1, I64(1)).await;
        stream.on_end(3, None).await;

        let (kind, arguments) = next_call(&peer, &mut outgoing).await;
        assert_eq!(kind, SystemMethodKind::AckEnd);
        assert_eq!(arguments.uuid_at(0).unwrap(), host);
        assert!(peer.remote_objects.get(7).is_none());

        let items = reader.into_stream().collect::<Vec<_>>().await;
        assert_eq!(items, vec![Ok(I64(0)), Ok(I64(1)), Ok(I64(2))]);
    }

    #[tokio::test]
    async fn test_gap_requests_reset() {
        let hub = test_hub();
        let (peer, mut outgoing) = connected_test_peer(&hub);
        let stream = remote(&peer, 100);
        let host = stream.stream_ref.id.host_id;

        let _reader = stream.subscribe().await.unwrap();
        expect_ack(&peer, &mut outgoing, 0, host).await;

        stream.on_item(0, I64(0)).await;
        stream.on_item(2, I64(2)).await;
        expect_ack(&peer, &mut outgoing, 1, host).await;
    }

    #[tokio::test]
    async fn test_periodic_ack_while_reading() {
        let hub = test_hub();
        let (peer, mut outgoing) = connected_test_peer(&hub);
        let stream = remote(&peer, 2);
        let host = stream.stream_ref.id.host_id;

        let mut reader = stream.subscribe().await.unwrap();
        expect_ack(&peer, &mut outgoing, 0, host).await;
        stream.on_batch(0, vec![I64(0), I64(1), I64(2)]).await;

        assert_eq!(reader.next().await, Some(Ok(I64(0))));
        assert_eq!(reader.next().await, Some(Ok(I64(1))));
        assert!(outgoing.try_recv().is_err());
        assert_eq!(reader.next().await, Some(Ok(I64(2))));
        expect_ack(&peer, &mut outgoing, 2, Uuid::nil()).await;
    }

    #[tokio::test]
    async fn test_end_with_error() {
        let hub = test_hub();
        let (peer, _outgoing) = connected_test_peer(&hub);
        let stream = remote(&peer, 100);

        let mut reader = stream.subscribe().await.unwrap();
        stream.on_item(0, I64(0)).await;
        stream.on_end(1, Some(ErrorInfo::new("E", "failed"))).await;

        assert_eq!(reader.next().await, Some(Ok(I64(0))));
        assert_eq!(reader.next().await, Some(Err(RpcError::Remote(ErrorInfo::new("E", "failed")))));
        assert_eq!(reader.next().await, None);
    }

    #[tokio::test]
    async fn test_disconnect() {
        let hub = test_hub();
        let (peer, mut outgoing) = connected_test_peer(&hub);
        let stream = remote(&peer, 100);

        let mut reader = stream.subscribe().await.unwrap();
        let _ = outgoing.recv().await;

        peer.remote_objects.disconnect(&[7]);
        assert_eq!(reader.next().await, Some(Err(RpcError::StreamNotFound)));
        assert_eq!(reader.next().await, None);

        // no acks after a disconnect
        stream.reconnect().await;
        drop(reader);
        tokio::task::yield_now().await;
        assert!(outgoing.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_reconnect_resets_to_next_index() {
        let hub = test_hub();
        let (peer, mut outgoing) = connected_test_peer(&hub);
        let stream = remote(&peer, 100);
        let host = stream.stream_ref.id.host_id;

        let _reader = stream.subscribe().await.unwrap();
        expect_ack(&peer, &mut outgoing, 0, host).await;
        stream.on_batch(0, vec![I64(0), I64(1)]).await;

        stream.reconnect().await;
        expect_ack(&peer, &mut outgoing, 2, host).await;
    }

    #[tokio::test]
    async fn test_drop_reader_sends_ack_end() {
        let hub = test_hub();
        let (peer, mut outgoing) = connected_test_peer(&hub);
        let stream = remote(&peer, 100);

        let reader = stream.subscribe().await.unwrap();
        let _ = outgoing.recv().await;
        drop(reader);

        let (kind, _) = next_call(&peer, &mut outgoing).await;
        assert_eq!(kind, SystemMethodKind::AckEnd);
        assert!(peer.remote_objects.is_empty());
        assert_eq!(stream.subscribe().await.err(), Some(RpcError::RemoteStreamEnumeratedTwice));
    }
}
