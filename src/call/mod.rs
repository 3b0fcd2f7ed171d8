use num_enum::{IntoPrimitive, TryFromPrimitive};

pub mod cache_info;
pub mod inbound_call;
pub mod inbound_tracker;
pub mod outbound_call;
pub mod outbound_context;
pub mod outbound_tracker;

/// How far a call got, as far as the caller knows. Reconnect requests group call ids by stage,
///  and the callee decides per stage whether it can pick up where the call left off.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum CallStage {
    /// sent, no result received yet
    Sent = 0,
    /// the callee finished the call, but the result may not have reached the caller
    ResultReady = 1,
}
