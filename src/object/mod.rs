use std::any::Any;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::time::Instant;

use crate::object::object_id::RpcObjectId;

pub mod object_id;
pub mod remote_objects;
pub mod shared_objects;

/// An object owned by this side and referenced by the remote side, e.g. the producer end of a
///  stream. The owner keeps it alive for as long as the remote side sends keep-alives for it.
#[async_trait]
pub trait SharedObject : Send + Sync {
    fn id(&self) -> RpcObjectId;

    fn last_keep_alive_at(&self) -> Instant;

    fn keep_alive(&self);

    /// called once the object is released, either because it expired or because its peer was
    ///  reset
    async fn dispose(&self);

    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

/// This side's handle to an object owned by the remote side, e.g. the consumer end of a stream
#[async_trait]
pub trait RemoteObject : Send + Sync {
    fn id(&self) -> RpcObjectId;

    /// the owner is reachable again after a reconnect
    async fn reconnect(&self);

    /// the owner does not know the object any more
    fn disconnect(&self);

    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}
