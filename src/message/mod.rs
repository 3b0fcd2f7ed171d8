pub mod arguments;
pub mod peer_ref;
pub mod rpc_message;
pub mod seq_compressor;
pub mod serializer;
pub mod value;
