use std::time::Duration;

use thiserror::Error;

pub type RpcResult<T> = Result<T, RpcError>;

/// The transportable representation of an error: this is what travels inside `Error` and `End`
///  system calls, and what [RpcError::from_info] turns back into a typed error on the other side.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ErrorInfo {
    pub type_name: String,
    pub message: String,
}
impl ErrorInfo {
    pub fn new(type_name: impl Into<String>, message: impl Into<String>) -> ErrorInfo {
        ErrorInfo {
            type_name: type_name.into(),
            message: message.into(),
        }
    }
}

/// Rough classification of errors that decides how the call layer treats them: transport errors
///  may be overcome by reconnecting, protocol errors are surfaced directly, reroute signals never
///  reach the application.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    Transport,
    Protocol,
    Reroute,
    Cancellation,
    Deserialization,
    Timeout,
    ObjectLifecycle,
    Application,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RpcError {
    #[error("{peer}: disconnected")]
    Disconnected { peer: String },
    /// The peer did not become connected within the method's connect timeout
    #[error("{peer}: connect timeout")]
    ConnectTimeout { peer: String },
    #[error("call timed out after {timeout:?}")]
    CallTimeout { timeout: Duration },
    #[error("handshake timed out")]
    HandshakeTimeout,
    #[error("handshake failed: {0}")]
    HandshakeFailed(String),
    /// The remote side stopped sending keep-alive pings for shared objects
    #[error("no keep-alive received within {0:?}")]
    KeepAliveTimeout(Duration),
    #[error("remote peer changed")]
    PeerChanged,
    #[error("connection is unrecoverable: {0}")]
    ConnectionUnrecoverable(String),
    #[error("unknown call type id: {0}")]
    UnknownCallType(u8),
    #[error("endpoint not found: {service}.{method}")]
    EndpointNotFound { service: String, method: String },
    /// The callee's handshake index differs from the one the reconnect request refers to
    #[error("too late to reconnect")]
    TooLateToReconnect,
    #[error("got match response, but there is no cached entry")]
    MatchButNoCachedEntry,
    /// The routing target of a call changed; the call is reattempted against the new peer. This
    ///  variant is absorbed by the retry loop in [crate::hub::RpcHub::call].
    #[error("call must be rerouted")]
    Reroute,
    #[error("call was cancelled")]
    Cancelled,
    #[error("cannot deserialize: {0}")]
    Deserialization(String),
    #[error("cannot serialize: {0}")]
    Serialization(String),
    #[error("object id {0} is already used")]
    ObjectAlreadyUsed(i64),
    #[error("stream not found")]
    StreamNotFound,
    #[error("invalid stream position")]
    StreamInvalidPosition,
    #[error("remote stream can be enumerated just once")]
    RemoteStreamEnumeratedTwice,
    /// An error raised by application code on the other side
    #[error("{}: {}", .0.type_name, .0.message)]
    Remote(ErrorInfo),
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<anyhow::Error> for RpcError {
    fn from(value: anyhow::Error) -> Self {
        RpcError::Internal(format!("{:#}", value))
    }
}

impl RpcError {
    pub fn disconnected(peer: impl std::fmt::Debug) -> RpcError {
        RpcError::Disconnected { peer: format!("{:?}", peer) }
    }

    pub fn kind(&self) -> ErrorKind {
        use RpcError::*;

        match self {
            Disconnected { .. } | ConnectTimeout { .. } | HandshakeTimeout | HandshakeFailed(_)
            | PeerChanged | ConnectionUnrecoverable(_) => ErrorKind::Transport,
            UnknownCallType(_) | EndpointNotFound { .. } | TooLateToReconnect | MatchButNoCachedEntry
            | Serialization(_) | Internal(_) => ErrorKind::Protocol,
            Reroute => ErrorKind::Reroute,
            Cancelled => ErrorKind::Cancellation,
            Deserialization(_) => ErrorKind::Deserialization,
            CallTimeout { .. } | KeepAliveTimeout(_) => ErrorKind::Timeout,
            ObjectAlreadyUsed(_) | StreamNotFound | StreamInvalidPosition | RemoteStreamEnumeratedTwice => ErrorKind::ObjectLifecycle,
            Remote(_) => ErrorKind::Application,
        }
    }

    /// NB: [RpcError::Reroute] is a cancellation subtype
    pub fn is_cancellation(&self) -> bool {
        matches!(self, RpcError::Cancelled | RpcError::Reroute)
    }

    pub fn type_name(&self) -> &'static str {
        use RpcError::*;

        match self {
            Disconnected { .. } => "Disconnected",
            ConnectTimeout { .. } => "ConnectTimeout",
            CallTimeout { .. } => "CallTimeout",
            HandshakeTimeout => "HandshakeTimeout",
            HandshakeFailed(_) => "HandshakeFailed",
            KeepAliveTimeout(_) => "KeepAliveTimeout",
            PeerChanged => "PeerChanged",
            ConnectionUnrecoverable(_) => "ConnectionUnrecoverable",
            UnknownCallType(_) => "UnknownCallType",
            EndpointNotFound { .. } => "EndpointNotFound",
            TooLateToReconnect => "TooLateToReconnect",
            MatchButNoCachedEntry => "MatchButNoCachedEntry",
            Reroute => "Reroute",
            Cancelled => "Cancelled",
            Deserialization(_) => "Deserialization",
            Serialization(_) => "Serialization",
            ObjectAlreadyUsed(_) => "ObjectAlreadyUsed",
            StreamNotFound => "StreamNotFound",
            StreamInvalidPosition => "StreamInvalidPosition",
            RemoteStreamEnumeratedTwice => "RemoteStreamEnumeratedTwice",
            Remote(_) => "Remote",
            Internal(_) => "Internal",
        }
    }

    pub fn to_info(&self) -> ErrorInfo {
        use RpcError::*;

        match self {
            Remote(info) => info.clone(),
            Disconnected { peer } | ConnectTimeout { peer } => ErrorInfo::new(self.type_name(), peer.clone()),
            HandshakeFailed(msg) | ConnectionUnrecoverable(msg) | Deserialization(msg)
            | Serialization(msg) | Internal(msg) => ErrorInfo::new(self.type_name(), msg.clone()),
            EndpointNotFound { service, method } => ErrorInfo::new(self.type_name(), format!("{}.{}", service, method)),
            _ => ErrorInfo::new(self.type_name(), self.to_string()),
        }
    }

    /// Restores a typed error from its transportable form. Type names that have no variant (or
    ///  whose payload can not be restored) become [RpcError::Remote].
    pub fn from_info(info: &ErrorInfo) -> RpcError {
        use RpcError::*;

        let msg = || info.message.clone();
        match info.type_name.as_str() {
            "Disconnected" => Disconnected { peer: msg() },
            "ConnectTimeout" => ConnectTimeout { peer: msg() },
            "HandshakeTimeout" => HandshakeTimeout,
            "HandshakeFailed" => HandshakeFailed(msg()),
            "PeerChanged" => PeerChanged,
            "ConnectionUnrecoverable" => ConnectionUnrecoverable(msg()),
            "EndpointNotFound" => match info.message.split_once('.') {
                Some((service, method)) => EndpointNotFound { service: service.to_string(), method: method.to_string() },
                None => Remote(info.clone()),
            },
            "TooLateToReconnect" => TooLateToReconnect,
            "MatchButNoCachedEntry" => MatchButNoCachedEntry,
            "Reroute" => Reroute,
            "Cancelled" => Cancelled,
            "Deserialization" => Deserialization(msg()),
            "Serialization" => Serialization(msg()),
            "StreamNotFound" => StreamNotFound,
            "StreamInvalidPosition" => StreamInvalidPosition,
            "RemoteStreamEnumeratedTwice" => RemoteStreamEnumeratedTwice,
            "Internal" => Internal(msg()),
            _ => Remote(info.clone()),
        }
    }
}
