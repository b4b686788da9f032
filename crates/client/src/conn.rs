//! A single dialed connection to a broker: auth, subscribe, fire, receive.

use crate::error::ClientError;
use rt_protocol::{ServerFrame, compress, wire};
use tokio::io::BufReader;
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};

/// A message decoded from the server, with event payloads already
/// decompressed for the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Received {
    Reply(String),
    Event { name: String, data: Vec<u8> },
    Pong(Vec<u8>),
}

/// One dialed, possibly-authenticated connection. Not `Clone` — the read and
/// write halves are owned exclusively, matching the single-reader,
/// serialized-writer discipline the wire protocol assumes.
pub struct Conn {
    r: BufReader<OwnedReadHalf>,
    w: OwnedWriteHalf,
    name: String,
    err: Option<String>,
}

impl Conn {
    pub async fn dial(name: &str, addr: &str) -> Result<Self, ClientError> {
        let stream = TcpStream::connect(addr).await.map_err(ClientError::Connect)?;
        let (r, w) = stream.into_split();
        Ok(Conn { r: BufReader::new(r), w, name: name.to_owned(), err: None })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn auth(&mut self, flags: i32) -> Result<(), ClientError> {
        wire::write_auth(&mut self.w, &self.name, flags).await.map_err(ClientError::Io)
    }

    pub async fn recover(&mut self, since: i64, until: i64) -> Result<(), ClientError> {
        wire::write_recover(&mut self.w, since, until).await.map_err(ClientError::Io)
    }

    pub async fn subscribe(&mut self, pattern: &str) -> Result<(), ClientError> {
        wire::write_channel(&mut self.w, wire::SUBSCRIBE, pattern).await.map_err(ClientError::Io)
    }

    pub async fn unsubscribe(&mut self, pattern: &str) -> Result<(), ClientError> {
        wire::write_channel(&mut self.w, wire::UNSUBSCRIBE, pattern).await.map_err(ClientError::Io)
    }

    pub async fn fire(&mut self, name: &str, data: &[u8]) -> Result<(), ClientError> {
        let compressed = compress::compress(data)?;
        let body = wire::make_event_body(name, &compressed);
        wire::write_event(&mut self.w, &body).await.map_err(ClientError::Io)
    }

    pub async fn fire_to(&mut self, target: &str, name: &str, data: &[u8]) -> Result<(), ClientError> {
        let compressed = compress::compress(data)?;
        let body = wire::make_event_body(name, &compressed);
        wire::write_event_to(&mut self.w, target, &body).await.map_err(ClientError::Io)
    }

    pub async fn ping(&mut self, payload: &[u8]) -> Result<(), ClientError> {
        wire::write_ping(&mut self.w, payload).await.map_err(ClientError::Io)
    }

    pub async fn info(&mut self) -> Result<(), ClientError> {
        wire::write_info(&mut self.w).await.map_err(ClientError::Io)
    }

    /// Block for the next frame from the server, decompressing event
    /// payloads. An `!` error frame surfaces as `Err(ClientError::Server)`.
    pub async fn receive(&mut self) -> Result<Received, ClientError> {
        match rt_protocol::read_server_frame(&mut self.r).await? {
            None => {
                self.err = Some("EOF".to_owned());
                Err(ClientError::Disconnected)
            }
            Some(ServerFrame::Reply { text }) => Ok(Received::Reply(text)),
            Some(ServerFrame::Pong { payload }) => Ok(Received::Pong(payload)),
            Some(ServerFrame::Error { text }) => {
                self.err = Some(text.clone());
                Err(ClientError::Server(text))
            }
            Some(ServerFrame::Event { name, compressed }) => {
                let data = compress::decompress(&compressed)?;
                Ok(Received::Event { name, data })
            }
        }
    }

    pub fn err(&self) -> Option<&str> {
        self.err.as_deref()
    }

    pub async fn close(mut self) {
        use tokio::io::AsyncWriteExt;
        let _ = self.w.shutdown().await;
    }
}
