//! Manual `Display`/`Error` impls, matching the forwarder uplink's style:
//! plain enums for client-facing transport errors.

#[derive(Debug)]
pub enum ClientError {
    Connect(std::io::Error),
    Io(std::io::Error),
    Protocol(rt_protocol::ProtocolError),
    Server(String),
    Disconnected,
    NotSupported(&'static str),
}

impl std::fmt::Display for ClientError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClientError::Connect(e) => write!(f, "connect error: {e}"),
            ClientError::Io(e) => write!(f, "io error: {e}"),
            ClientError::Protocol(e) => write!(f, "protocol error: {e}"),
            ClientError::Server(msg) => write!(f, "server error: {msg}"),
            ClientError::Disconnected => write!(f, "connection closed"),
            ClientError::NotSupported(what) => write!(f, "pooled connection does not support {what}()"),
        }
    }
}

impl std::error::Error for ClientError {}

impl From<std::io::Error> for ClientError {
    fn from(e: std::io::Error) -> Self {
        ClientError::Io(e)
    }
}

impl From<rt_protocol::ProtocolError> for ClientError {
    fn from(e: rt_protocol::ProtocolError) -> Self {
        ClientError::Protocol(e)
    }
}
