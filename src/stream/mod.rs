pub mod remote_stream;
pub mod ring_buffer;
pub mod shared_stream;
