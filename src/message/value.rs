use bytes::Bytes;
use num_enum::{IntoPrimitive, TryFromPrimitive};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::ErrorInfo;
use crate::object::object_id::RpcObjectId;

/// The dynamic type of a [RpcValue], doubling as its tag in serialized form
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum ValueKind {
    None = 0,
    Bool = 1,
    I64 = 2,
    String = 3,
    Bytes = 4,
    Uuid = 5,
    List = 6,
    Error = 7,
    Stream = 8,
    /// never serialized: a local cancellation slot
    Cancellation = 9,
    /// only used in argument shapes, matches any value
    Any = 0xff,
}

/// A reference to a shared stream, sent in place of the stream itself
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StreamRef {
    pub id: RpcObjectId,
    pub ack_period: i64,
    pub ack_advance: i64,
}

#[derive(Clone, Debug)]
pub enum RpcValue {
    None,
    Bool(bool),
    I64(i64),
    String(String),
    Bytes(Bytes),
    Uuid(Uuid),
    List(Vec<RpcValue>),
    Error(ErrorInfo),
    Stream(StreamRef),
    Cancellation(CancellationToken),
}

impl RpcValue {
    pub fn kind(&self) -> ValueKind {
        match self {
            RpcValue::None => ValueKind::None,
            RpcValue::Bool(_) => ValueKind::Bool,
            RpcValue::I64(_) => ValueKind::I64,
            RpcValue::String(_) => ValueKind::String,
            RpcValue::Bytes(_) => ValueKind::Bytes,
            RpcValue::Uuid(_) => ValueKind::Uuid,
            RpcValue::List(_) => ValueKind::List,
            RpcValue::Error(_) => ValueKind::Error,
            RpcValue::Stream(_) => ValueKind::Stream,
            RpcValue::Cancellation(_) => ValueKind::Cancellation,
        }
    }

    pub fn is_none(&self) -> bool {
        matches!(self, RpcValue::None)
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            RpcValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            RpcValue::I64(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            RpcValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&Bytes> {
        match self {
            RpcValue::Bytes(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_uuid(&self) -> Option<Uuid> {
        match self {
            RpcValue::Uuid(u) => Some(*u),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[RpcValue]> {
        match self {
            RpcValue::List(l) => Some(l),
            _ => None,
        }
    }

    pub fn as_error(&self) -> Option<&ErrorInfo> {
        match self {
            RpcValue::Error(e) => Some(e),
            _ => None,
        }
    }

    pub fn as_stream(&self) -> Option<StreamRef> {
        match self {
            RpcValue::Stream(s) => Some(*s),
            _ => None,
        }
    }

    pub fn as_cancellation(&self) -> Option<&CancellationToken> {
        match self {
            RpcValue::Cancellation(c) => Some(c),
            _ => None,
        }
    }
}

/// NB: cancellation slots compare equal to each other regardless of the token
impl PartialEq for RpcValue {
    fn eq(&self, other: &Self) -> bool {
        use RpcValue::*;

        match (self, other) {
            (None, None) => true,
            (Bool(a), Bool(b)) => a == b,
            (I64(a), I64(b)) => a == b,
            (String(a), String(b)) => a == b,
            (Bytes(a), Bytes(b)) => a == b,
            (Uuid(a), Uuid(b)) => a == b,
            (List(a), List(b)) => a == b,
            (Error(a), Error(b)) => a == b,
            (Stream(a), Stream(b)) => a == b,
            (Cancellation(_), Cancellation(_)) => true,
            _ => false,
        }
    }
}

impl From<bool> for RpcValue {
    fn from(value: bool) -> Self {
        RpcValue::Bool(value)
    }
}
impl From<i64> for RpcValue {
    fn from(value: i64) -> Self {
        RpcValue::I64(value)
    }
}
impl From<&str> for RpcValue {
    fn from(value: &str) -> Self {
        RpcValue::String(value.to_string())
    }
}
impl From<String> for RpcValue {
    fn from(value: String) -> Self {
        RpcValue::String(value)
    }
}
impl From<Bytes> for RpcValue {
    fn from(value: Bytes) -> Self {
        RpcValue::Bytes(value)
    }
}
impl From<Uuid> for RpcValue {
    fn from(value: Uuid) -> Self {
        RpcValue::Uuid(value)
    }
}
impl From<Vec<RpcValue>> for RpcValue {
    fn from(value: Vec<RpcValue>) -> Self {
        RpcValue::List(value)
    }
}
impl From<ErrorInfo> for RpcValue {
    fn from(value: ErrorInfo) -> Self {
        RpcValue::Error(value)
    }
}
impl From<StreamRef> for RpcValue {
    fn from(value: StreamRef) -> Self {
        RpcValue::Stream(value)
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::none(RpcValue::None, ValueKind::None)]
    #[case::bool(true.into(), ValueKind::Bool)]
    #[case::i64(3i64.into(), ValueKind::I64)]
    #[case::string("x".into(), ValueKind::String)]
    #[case::list(vec![RpcValue::None].into(), ValueKind::List)]
    #[case::cancellation(RpcValue::Cancellation(CancellationToken::new()), ValueKind::Cancellation)]
    fn test_kind(#[case] value: RpcValue, #[case] kind: ValueKind) {
        assert_eq!(value.kind(), kind);
    }

    #[test]
    fn test_cancellation_slots_are_equal() {
        assert_eq!(RpcValue::Cancellation(CancellationToken::new()), RpcValue::Cancellation(CancellationToken::new()));
        assert_ne!(RpcValue::Cancellation(CancellationToken::new()), RpcValue::None);
    }
}
