pub mod system_call_sender;
pub mod system_calls;
