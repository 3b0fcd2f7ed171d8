pub mod connection;
pub mod connection_state;
pub mod handshake;
pub mod rpc_peer;
