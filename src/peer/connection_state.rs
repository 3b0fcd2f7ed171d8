use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::error::RpcError;
use crate::peer::connection::ConnectionHandle;
use crate::peer::handshake::RpcHandshake;

/// An immutable snapshot of a peer's connection. Transitions create a new snapshot that is
///  published atomically, so readers always see a consistent combination of connection,
///  handshakes and error.
#[derive(Clone, Debug, Default)]
pub struct PeerConnectionState {
    pub connection: Option<Arc<ConnectionHandle>>,
    /// the handshake received from the remote side; survives disconnects for change detection
    pub handshake: Option<RpcHandshake>,
    /// the handshake this side sent on the current (or last) connection
    pub own_handshake: Option<RpcHandshake>,
    pub error: Option<RpcError>,
    /// number of consecutive failed connection attempts
    pub try_index: u32,
    /// cancelled to abort the current connection's read loop and everything bound to it
    pub reader_abort: Option<CancellationToken>,
}

impl PeerConnectionState {
    pub fn is_connected(&self) -> bool {
        self.connection.is_some()
    }

    pub fn next_connected(&self, connection: Arc<ConnectionHandle>, handshake: RpcHandshake, own_handshake: RpcHandshake, reader_abort: CancellationToken) -> PeerConnectionState {
        PeerConnectionState {
            connection: Some(connection),
            handshake: Some(handshake),
            own_handshake: Some(own_handshake),
            error: None,
            try_index: 0,
            reader_abort: Some(reader_abort),
        }
    }

    pub fn next_disconnected(&self, error: Option<RpcError>) -> PeerConnectionState {
        let try_index = if error.is_some() { self.try_index.saturating_add(1) } else { self.try_index };
        PeerConnectionState {
            connection: None,
            handshake: self.handshake.clone(),
            own_handshake: self.own_handshake.clone(),
            error,
            try_index,
            reader_abort: None,
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;
    use uuid::Uuid;

    fn handshake(index: i64) -> RpcHandshake {
        RpcHandshake {
            remote_peer_id: Uuid::new_v4(),
            remote_hub_id: Uuid::new_v4(),
            protocol_version: 1,
            index,
        }
    }

    #[test]
    fn test_transitions() {
        let (sender, _receiver) = mpsc::channel(1);
        let initial = PeerConnectionState::default();
        assert!(!initial.is_connected());

        let failed = initial
            .next_disconnected(Some(RpcError::HandshakeTimeout))
            .next_disconnected(Some(RpcError::HandshakeTimeout));
        assert_eq!(failed.try_index, 2);

        let connected = failed.next_connected(Arc::new(ConnectionHandle::new(1, sender)), handshake(3), handshake(1), CancellationToken::new());
        assert!(connected.is_connected());
        assert_eq!(connected.try_index, 0);
        assert_eq!(connected.error, None);

        let disconnected = connected.next_disconnected(None);
        assert!(!disconnected.is_connected());
        assert_eq!(disconnected.try_index, 0);
        assert_eq!(disconnected.handshake, connected.handshake);
        assert_eq!(disconnected.own_handshake, connected.own_handshake);
        assert!(disconnected.reader_abort.is_none());
    }
}
