use thiserror::Error;

/// Protocol-level decode errors. These always result in an `!` reply and
/// the connection being closed.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("length error")]
    BadLength,
    #[error("schema error: expect {{target}}:{{len}} or {{name}}:{{flags}}")]
    BadSchema,
    #[error("event name is empty")]
    EmptyName,
    #[error("event name over 30 char: {0}")]
    NameTooLong(usize),
    #[error("event data empty")]
    EmptyPayload,
    #[error("unexpected first frame: auth must come first")]
    AuthRequired,
    #[error("duplicate auth for name {0}")]
    DuplicateAuth(String),
    #[error("unknown verb byte {0:#x}")]
    UnknownVerb(u8),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
