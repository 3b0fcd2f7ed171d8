use bytes::Bytes;
use parking_lot::Mutex;

use crate::message::rpc_message::MethodRef;
use crate::message::value::RpcValue;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CaptureMode {
    /// only the call key is captured, the call is not sent
    KeyOnly,
    /// the call is sent, and the result is captured together with its content hash
    KeyAndData,
}

/// Identifies a call by what it asks for, independently of call ids and peers
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CallKey {
    pub method: MethodRef,
    pub argument_data: Bytes,
}

/// A previously received result with its content hash. A call that carries a cached result sends
///  the hash, and the callee responds with a bare 'match' if its result hashes the same.
#[derive(Clone, Debug, PartialEq)]
pub struct CachedResult {
    pub hash: String,
    pub value: RpcValue,
}

#[derive(Debug)]
pub struct CacheInfoCapture {
    pub mode: CaptureMode,
    key: Mutex<Option<CallKey>>,
    data: Mutex<Option<CachedResult>>,
}

impl CacheInfoCapture {
    pub fn new(mode: CaptureMode) -> CacheInfoCapture {
        CacheInfoCapture {
            mode,
            key: Mutex::new(None),
            data: Mutex::new(None),
        }
    }

    pub fn key(&self) -> Option<CallKey> {
        self.key.lock().clone()
    }

    pub fn data(&self) -> Option<CachedResult> {
        self.data.lock().clone()
    }

    pub(crate) fn capture_key(&self, key: CallKey) {
        *self.key.lock() = Some(key);
    }

    pub(crate) fn capture_data(&self, data: CachedResult) {
        if self.mode == CaptureMode::KeyAndData {
            *self.data.lock() = Some(data);
        }
    }
}
