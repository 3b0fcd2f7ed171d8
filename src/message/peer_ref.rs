use std::fmt::{Debug, Display, Formatter};
use std::str::FromStr;

use anyhow::{anyhow, bail};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ConnectionKind {
    Remote,
    Local,
    Loopback,
    None,
}
impl ConnectionKind {
    fn as_str(&self) -> &'static str {
        match self {
            ConnectionKind::Remote => "remote",
            ConnectionKind::Local => "local",
            ConnectionKind::Loopback => "loopback",
            ConnectionKind::None => "none",
        }
    }

    fn parse(s: &str) -> anyhow::Result<ConnectionKind> {
        match s {
            "remote" => Ok(ConnectionKind::Remote),
            "local" => Ok(ConnectionKind::Local),
            "loopback" => Ok(ConnectionKind::Loopback),
            "none" => Ok(ConnectionKind::None),
            _ => Err(anyhow!("unknown connection kind {:?}", s)),
        }
    }
}

const BACKEND: &str = "backend";
const SERVER: &str = "server";
const DATA_DELIMITER: &str = "://";

/// A peer reference in its string form `connectionKind[.backend][.server].serializationFormat://data`.
///  `data` is opaque and identifies the concrete endpoint, everything before it is routing and
///  versioning metadata.
///
/// Instances can only be created through [ParsedRpcPeerRef::new] or parsing, both of which
///  validate, so formatting and parsing are inverse to each other.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct ParsedRpcPeerRef {
    connection_kind: ConnectionKind,
    is_backend: bool,
    is_server: bool,
    serialization_format: String,
    data: String,
}

impl ParsedRpcPeerRef {
    pub fn new(connection_kind: ConnectionKind, is_backend: bool, is_server: bool, serialization_format: &str, data: &str) -> anyhow::Result<ParsedRpcPeerRef> {
        if serialization_format.is_empty() {
            bail!("serialization format must not be empty");
        }
        if serialization_format.contains('.') || serialization_format.contains(DATA_DELIMITER) {
            bail!("serialization format {:?} must not contain '.' or '{}'", serialization_format, DATA_DELIMITER);
        }
        if serialization_format == BACKEND || serialization_format == SERVER {
            bail!("{:?} is not a valid serialization format", serialization_format);
        }

        Ok(ParsedRpcPeerRef {
            connection_kind,
            is_backend,
            is_server,
            serialization_format: serialization_format.to_string(),
            data: data.to_string(),
        })
    }

    pub fn parse(s: &str) -> anyhow::Result<ParsedRpcPeerRef> {
        let (head, data) = s.split_once(DATA_DELIMITER)
            .ok_or_else(|| anyhow!("peer ref {:?} has no '{}'", s, DATA_DELIMITER))?;

        let mut segments = head.split('.').collect::<Vec<_>>();
        if segments.len() < 2 {
            bail!("peer ref {:?} needs at least a connection kind and a serialization format", s);
        }

        let connection_kind = ConnectionKind::parse(segments.remove(0))?;
        let serialization_format = segments.pop().unwrap_or_default();

        let mut flags = segments.into_iter();
        let mut next = flags.next();
        let is_backend = next == Some(BACKEND);
        if is_backend {
            next = flags.next();
        }
        let is_server = next == Some(SERVER);
        if is_server {
            next = flags.next();
        }
        if let Some(unexpected) = next {
            bail!("unexpected segment {:?} in peer ref {:?}", unexpected, s);
        }

        ParsedRpcPeerRef::new(connection_kind, is_backend, is_server, serialization_format, data)
    }

    pub fn connection_kind(&self) -> ConnectionKind {
        self.connection_kind
    }
    pub fn is_backend(&self) -> bool {
        self.is_backend
    }
    pub fn is_server(&self) -> bool {
        self.is_server
    }
    pub fn serialization_format(&self) -> &str {
        &self.serialization_format
    }
    pub fn data(&self) -> &str {
        &self.data
    }
}

impl Display for ParsedRpcPeerRef {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.connection_kind.as_str())?;
        if self.is_backend {
            write!(f, ".{}", BACKEND)?;
        }
        if self.is_server {
            write!(f, ".{}", SERVER)?;
        }
        write!(f, ".{}{}{}", self.serialization_format, DATA_DELIMITER, self.data)
    }
}

impl Debug for ParsedRpcPeerRef {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}]", self)
    }
}

impl FromStr for ParsedRpcPeerRef {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ParsedRpcPeerRef::parse(s)
    }
}
