use std::fmt::{Debug, Formatter};

use uuid::Uuid;

/// Identifies a shared / remote object across a peer relationship: `host_id` is the id of the
///  peer that owns the object, `local_id` is unique per owning peer.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct RpcObjectId {
    pub host_id: Uuid,
    pub local_id: i64,
}

impl RpcObjectId {
    pub const NONE: RpcObjectId = RpcObjectId { host_id: Uuid::nil(), local_id: 0 };

    pub fn new(host_id: Uuid, local_id: i64) -> RpcObjectId {
        RpcObjectId { host_id, local_id }
    }

    pub fn is_none(&self) -> bool {
        self.local_id == 0 && self.host_id.is_nil()
    }
}

impl Debug for RpcObjectId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        if self.is_none() {
            write!(f, "[none]")
        }
        else {
            write!(f, "[{}@{}]", self.local_id, self.host_id)
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RpcObjectKind {
    Local,
    Remote,
}
