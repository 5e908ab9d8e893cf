#[derive(Debug, thiserror::Error)]
pub enum MgcpControlError {
    #[error("Protocol error: {0}")]
    ProtocolError(String),
    #[error("Unknown verb: {0}")]
    UnknownVerb(String),
    #[error("Malformed endpoint identifier: {0}")]
    MalformedEndpointId(String),
    #[error("Configuration error: {0}")]
    ConfigError(String),
    #[error("Observer failure: {0}")]
    ObserverFailure(String),
    #[error("Channel closed: {0}")]
    ChannelClosed(String),
}
