use thiserror::Error;

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("auth: {0}")]
    BadAuth(String),
    #[error("duplicate auth for {0}")]
    DuplicateAuth(String),
    #[error(transparent)]
    Protocol(#[from] rt_protocol::ProtocolError),
    #[error(transparent)]
    Store(#[from] rt_store::StoreError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type BrokerResult<T> = Result<T, BrokerError>;
