// MGCP message data model

use crate::error::MgcpControlError;
use std::fmt;
use std::str::FromStr;

/// Endpoint identifier wildcard matching all endpoints in a domain.
pub const WILDCARD_ALL: &str = "*";
/// Endpoint identifier wildcard requesting allocation of any free endpoint.
pub const WILDCARD_ANY: &str = "$";

/// MGCP request verbs (closed set; unknown verbs never construct a command)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MgcpRequestType {
    Crcx,
    Mdcx,
    Dlcx,
    Rqnt,
    Ntfy,
    Auep,
    Aucx,
}

impl MgcpRequestType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MgcpRequestType::Crcx => "CRCX",
            MgcpRequestType::Mdcx => "MDCX",
            MgcpRequestType::Dlcx => "DLCX",
            MgcpRequestType::Rqnt => "RQNT",
            MgcpRequestType::Ntfy => "NTFY",
            MgcpRequestType::Auep => "AUEP",
            MgcpRequestType::Aucx => "AUCX",
        }
    }
}

impl FromStr for MgcpRequestType {
    type Err = MgcpControlError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "CRCX" => Ok(MgcpRequestType::Crcx),
            "MDCX" => Ok(MgcpRequestType::Mdcx),
            "DLCX" => Ok(MgcpRequestType::Dlcx),
            "RQNT" => Ok(MgcpRequestType::Rqnt),
            "NTFY" => Ok(MgcpRequestType::Ntfy),
            "AUEP" => Ok(MgcpRequestType::Auep),
            "AUCX" => Ok(MgcpRequestType::Aucx),
            other => Err(MgcpControlError::UnknownVerb(other.to_string())),
        }
    }
}

impl fmt::Display for MgcpRequestType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Parameter lines carried by requests and responses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MgcpParameterType {
    CallId,
    ConnectionId,
    ConnectionMode,
    NotifiedEntity,
    RequestId,
    RequestedEvents,
    SignalRequests,
    ObservedEvents,
    LocalConnectionOptions,
    SpecificEndpointId,
}

impl MgcpParameterType {
    /// One-letter parameter symbol as it appears on the wire
    pub fn symbol(&self) -> &'static str {
        match self {
            MgcpParameterType::CallId => "C",
            MgcpParameterType::ConnectionId => "I",
            MgcpParameterType::ConnectionMode => "M",
            MgcpParameterType::NotifiedEntity => "N",
            MgcpParameterType::RequestId => "X",
            MgcpParameterType::RequestedEvents => "R",
            MgcpParameterType::SignalRequests => "S",
            MgcpParameterType::ObservedEvents => "O",
            MgcpParameterType::LocalConnectionOptions => "L",
            MgcpParameterType::SpecificEndpointId => "Z",
        }
    }

    pub fn from_symbol(symbol: &str) -> Option<Self> {
        match symbol.to_ascii_uppercase().as_str() {
            "C" => Some(MgcpParameterType::CallId),
            "I" => Some(MgcpParameterType::ConnectionId),
            "M" => Some(MgcpParameterType::ConnectionMode),
            "N" => Some(MgcpParameterType::NotifiedEntity),
            "X" => Some(MgcpParameterType::RequestId),
            "R" => Some(MgcpParameterType::RequestedEvents),
            "S" => Some(MgcpParameterType::SignalRequests),
            "O" => Some(MgcpParameterType::ObservedEvents),
            "L" => Some(MgcpParameterType::LocalConnectionOptions),
            "Z" => Some(MgcpParameterType::SpecificEndpointId),
            _ => None,
        }
    }
}

/// Insertion-ordered collection of message parameters
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Parameters {
    entries: Vec<(MgcpParameterType, String)>,
}

impl Parameters {
    pub fn new() -> Self {
        Parameters {
            entries: Vec::new(),
        }
    }

    /// Get the first value for the parameter type
    pub fn get(&self, key: MgcpParameterType) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| *k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Set a value, replacing any existing entries with the same type
    pub fn set(&mut self, key: MgcpParameterType, value: String) {
        self.remove(key);
        self.entries.push((key, value));
    }

    /// Append a value without removing existing entries with the same type
    pub fn add(&mut self, key: MgcpParameterType, value: String) {
        self.entries.push((key, value));
    }

    /// Remove all entries with the given type
    pub fn remove(&mut self, key: MgcpParameterType) {
        self.entries.retain(|(k, _)| *k != key);
    }

    pub fn entries(&self) -> &[(MgcpParameterType, String)] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Direction of a notified message relative to the controller
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageDirection {
    Incoming,
    Outgoing,
}

impl fmt::Display for MessageDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageDirection::Incoming => f.write_str("incoming"),
            MessageDirection::Outgoing => f.write_str("outgoing"),
        }
    }
}

/// Endpoint identifier of the form `localName@domain`.
/// `localName` may be `*` (all endpoints) or `$` (any free endpoint).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EndpointId {
    pub local_name: String,
    pub domain: String,
}

impl EndpointId {
    pub fn new(local_name: impl Into<String>, domain: impl Into<String>) -> Self {
        EndpointId {
            local_name: local_name.into(),
            domain: domain.into(),
        }
    }

    pub fn is_wildcard_all(&self) -> bool {
        self.local_name == WILDCARD_ALL
    }

    pub fn is_wildcard_any(&self) -> bool {
        self.local_name == WILDCARD_ANY
    }
}

impl FromStr for EndpointId {
    type Err = MgcpControlError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('@') {
            Some((local, domain)) if !local.is_empty() && !domain.is_empty() => {
                Ok(EndpointId::new(local, domain))
            }
            _ => Err(MgcpControlError::MalformedEndpointId(s.to_string())),
        }
    }
}

impl fmt::Display for EndpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.local_name, self.domain)
    }
}

/// MGCP request message
#[derive(Debug, Clone, PartialEq)]
pub struct MgcpRequest {
    pub verb: MgcpRequestType,
    pub transaction_id: u32,
    pub endpoint_id: EndpointId,
    pub parameters: Parameters,
}

/// MGCP response message
#[derive(Debug, Clone, PartialEq)]
pub struct MgcpResponse {
    pub transaction_id: u32,
    pub code: u16,
    pub comment: String,
    pub parameters: Parameters,
}

/// Top-level MGCP message enum
#[derive(Debug, Clone, PartialEq)]
pub enum MgcpMessage {
    Request(MgcpRequest),
    Response(MgcpResponse),
}

impl MgcpMessage {
    pub fn transaction_id(&self) -> u32 {
        match self {
            MgcpMessage::Request(r) => r.transaction_id,
            MgcpMessage::Response(r) => r.transaction_id,
        }
    }
}
