use std::fmt::{Debug, Formatter};

use bytes::Bytes;
use crc::Crc;
use num_enum::{IntoPrimitive, TryFromPrimitive};

/// 0 for calls that do not correlate to anything (fire-and-forget), otherwise a peer-scoped
///  increasing number
pub type CallId = i64;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum CallTypeId {
    Regular = 0,
}

#[derive(Clone, PartialEq, Eq, Hash)]
pub struct MethodRef {
    pub service: String,
    pub method: String,
}
impl MethodRef {
    pub fn new(service: impl Into<String>, method: impl Into<String>) -> MethodRef {
        MethodRef {
            service: service.into(),
            method: method.into(),
        }
    }
}
impl Debug for MethodRef {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.service, self.method)
    }
}

pub mod well_known_headers {
    /// content hash of a call's arguments (request) or result (response)
    pub const HASH: &str = "#";
    pub const ACTIVITY_ID: &str = "~";
    pub const TRACE_PARENT: &str = "~p";
    pub const TRACE_STATE: &str = "~s";
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RpcHeader {
    pub name: String,
    pub value: String,
}
impl RpcHeader {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> RpcHeader {
        RpcHeader {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// An already-framed message. `related_id` is the sender's new call id for requests, and the id
///  of the call being responded to for system calls carrying results.
#[derive(Clone, Debug, PartialEq)]
pub struct RpcMessage {
    pub call_type_id: u8,
    pub related_id: CallId,
    pub method: MethodRef,
    pub argument_data: Bytes,
    pub headers: Vec<RpcHeader>,
}

impl RpcMessage {
    pub fn new(related_id: CallId, method: MethodRef, argument_data: Bytes) -> RpcMessage {
        RpcMessage {
            call_type_id: CallTypeId::Regular.into(),
            related_id,
            method,
            argument_data,
            headers: Vec::new(),
        }
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.iter()
            .find(|h| h.name == name)
            .map(|h| h.value.as_str())
    }

    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> RpcMessage {
        self.headers.retain(|h| h.name != name);
        self.headers.push(RpcHeader::new(name, value));
        self
    }

    pub fn with_headers(mut self, headers: &[RpcHeader]) -> RpcMessage {
        for h in headers {
            self = self.with_header(&h.name, h.value.clone());
        }
        self
    }
}

/// The value of the [well_known_headers::HASH] header for a given payload
pub fn content_hash(data: &[u8]) -> String {
    let hasher = Crc::<u64>::new(&crc::CRC_64_REDIS);
    format!("{:016x}", hasher.checksum(data))
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_with_header_replaces() {
        let msg = RpcMessage::new(1, MethodRef::new("a", "b"), Bytes::new())
            .with_header(well_known_headers::HASH, "1")
            .with_header(well_known_headers::ACTIVITY_ID, "x")
            .with_header(well_known_headers::HASH, "2");

        assert_eq!(msg.header(well_known_headers::HASH), Some("2"));
        assert_eq!(msg.header(well_known_headers::ACTIVITY_ID), Some("x"));
        assert_eq!(msg.header(well_known_headers::TRACE_PARENT), None);
        assert_eq!(msg.headers.len(), 2);
    }

    #[test]
    fn test_content_hash() {
        assert_eq!(content_hash(b"abc"), content_hash(b"abc"));
        assert_ne!(content_hash(b"abc"), content_hash(b"abd"));
        assert_eq!(content_hash(b"abc").len(), 16);
    }

    #[test]
    fn test_call_type_id() {
        assert_eq!(CallTypeId::try_from(0u8).unwrap(), CallTypeId::Regular);
        assert!(CallTypeId::try_from(5u8).is_err());
    }
}
