use uuid::Uuid;

use crate::error::RpcResult;
use crate::message::arguments::ArgumentList;
use crate::message::value::RpcValue;

/// The first message each side sends on a new connection. `index` increases with every handshake a
///  peer sends, so a reconnect request can name the exact connection generation it refers to.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RpcHandshake {
    pub remote_peer_id: Uuid,
    pub remote_hub_id: Uuid,
    pub protocol_version: u8,
    pub index: i64,
}

impl RpcHandshake {
    pub fn to_arguments(&self) -> ArgumentList {
        ArgumentList::new(vec![
            RpcValue::Uuid(self.remote_peer_id),
            RpcValue::Uuid(self.remote_hub_id),
            RpcValue::I64(self.protocol_version as i64),
            RpcValue::I64(self.index),
        ])
    }

    pub fn from_arguments(arguments: &ArgumentList) -> RpcResult<RpcHandshake> {
        Ok(RpcHandshake {
            remote_peer_id: arguments.uuid_at(0)?,
            remote_hub_id: arguments.uuid_at(1)?,
            protocol_version: arguments.i64_at(2)? as u8,
            index: arguments.i64_at(3)?,
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PeerChangeKind {
    Unchanged,
    /// the first handshake a peer ever received
    ChangedToVeryFirst,
    /// the remote side is a different process (or a restarted one) than before
    Changed,
}

impl PeerChangeKind {
    pub fn detect(last: Option<&RpcHandshake>, next: &RpcHandshake) -> PeerChangeKind {
        match last {
            None => PeerChangeKind::ChangedToVeryFirst,
            Some(last) if last.remote_peer_id == next.remote_peer_id => PeerChangeKind::Unchanged,
            Some(_) => PeerChangeKind::Changed,
        }
    }

    pub fn is_changed(&self) -> bool {
        *self != PeerChangeKind::Unchanged
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn handshake(peer_id: u128, index: i64) -> RpcHandshake {
        RpcHandshake {
            remote_peer_id: Uuid::from_u128(peer_id),
            remote_hub_id: Uuid::from_u128(99),
            protocol_version: 1,
            index,
        }
    }

    #[rstest]
    #[case::very_first(None, handshake(1, 1), PeerChangeKind::ChangedToVeryFirst)]
    #[case::same_peer(Some(handshake(1, 1)), handshake(1, 2), PeerChangeKind::Unchanged)]
    #[case::other_peer(Some(handshake(1, 1)), handshake(2, 1), PeerChangeKind::Changed)]
    fn test_detect(#[case] last: Option<RpcHandshake>, #[case] next: RpcHandshake, #[case] expected: PeerChangeKind) {
        assert_eq!(PeerChangeKind::detect(last.as_ref(), &next), expected);
    }

    #[test]
    fn test_arguments() {
        let h = handshake(5, 7);
        assert_eq!(RpcHandshake::from_arguments(&h.to_arguments()).unwrap(), h);
        assert!(RpcHandshake::from_arguments(&ArgumentList::empty()).is_err());
    }
}
