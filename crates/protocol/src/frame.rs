//! The tagged union of decoded client frames.
//!
//! The original source dispatches on a decoded message via a runtime type
//! switch; here the receive loop returns one of these variants plus an
//! error, and callers match on it instead.

use crate::ProtocolError;
use crate::wire;
use tokio::io::{AsyncBufReadExt, AsyncReadExt};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientFrame {
    Auth { name: String, flags: i32 },
    Recover { since: i64, until: i64 },
    Subscribe { pattern: String },
    Unsubscribe { pattern: String },
    Ping { payload: Vec<u8> },
    Info,
    Event { name: String, compressed: Vec<u8> },
    TargetedEvent { target: String, name: String, compressed: Vec<u8> },
}

/// Read and decode exactly one client frame. Returns `Ok(None)` at a clean
/// EOF, and `Ok(Some(None))`-shaped skip for zero-length lines is instead
/// represented by looping internally: blank lines are silently skipped, as
/// the wire spec requires.
pub async fn read_client_frame<R>(r: &mut R) -> Result<Option<ClientFrame>, ProtocolError>
where
    R: AsyncBufReadExt + AsyncReadExt + Unpin,
{
    loop {
        let line = match wire::read_line(r).await? {
            Some(l) => l,
            None => return Ok(None),
        };
        if line.is_empty() {
            continue;
        }

        let verb = line[0];
        let rest = &line[1..];

        return Ok(Some(match verb {
            wire::AUTH => {
                let (name, flags) = wire::parse_auth(rest)?;
                ClientFrame::Auth { name, flags }
            }
            wire::RECOVER => {
                let (since, until) = wire::parse_since_until(rest);
                ClientFrame::Recover { since, until }
            }
            wire::SUBSCRIBE => ClientFrame::Subscribe {
                pattern: String::from_utf8_lossy(rest).trim().to_owned(),
            },
            wire::UNSUBSCRIBE => ClientFrame::Unsubscribe {
                pattern: String::from_utf8_lossy(rest).trim().to_owned(),
            },
            wire::PING_PONG => {
                let n = wire::parse_len(rest)?;
                let n = usize::try_from(n).map_err(|_| ProtocolError::BadLength)?;
                let payload = wire::read_exact_body(r, n).await?;
                ClientFrame::Ping { payload }
            }
            wire::INFO => ClientFrame::Info,
            wire::EVENT => {
                let n = wire::parse_len(rest)?;
                let n = usize::try_from(n).map_err(|_| ProtocolError::BadLength)?;
                let body = wire::read_exact_body(r, n).await?;
                let (name, compressed) = wire::parse_event_body(&body)?;
                ClientFrame::Event { name, compressed }
            }
            wire::TARGETED_EVENT => {
                let (target, n) = wire::parse_target_and_len(rest)?;
                let n = usize::try_from(n).map_err(|_| ProtocolError::BadLength)?;
                let body = wire::read_exact_body(r, n).await?;
                let (name, compressed) = wire::parse_event_body(&body)?;
                ClientFrame::TargetedEvent { target, name, compressed }
            }
            other => return Err(ProtocolError::UnknownVerb(other)),
        }));
    }
}

/// Frames a server sends to a client: events, replies, errors, and pongs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerFrame {
    Event { name: String, compressed: Vec<u8> },
    Reply { text: String },
    Error { text: String },
    Pong { payload: Vec<u8> },
}

/// Read and decode exactly one server-to-client frame.
pub async fn read_server_frame<R>(r: &mut R) -> Result<Option<ServerFrame>, ProtocolError>
where
    R: AsyncBufReadExt + AsyncReadExt + Unpin,
{
    loop {
        let line = match wire::read_line(r).await? {
            Some(l) => l,
            None => return Ok(None),
        };
        if line.is_empty() {
            continue;
        }

        let verb = line[0];
        let rest = &line[1..];

        return Ok(Some(match verb {
            wire::EVENT => {
                let n = wire::parse_len(rest)?;
                let n = usize::try_from(n).map_err(|_| ProtocolError::BadLength)?;
                let body = wire::read_exact_body(r, n).await?;
                let (name, compressed) = wire::parse_event_body(&body)?;
                ServerFrame::Event { name, compressed }
            }
            wire::REPLY => ServerFrame::Reply { text: String::from_utf8_lossy(rest).into_owned() },
            wire::ERROR => {
                let n = wire::parse_len(rest)?;
                let n = usize::try_from(n).map_err(|_| ProtocolError::BadLength)?;
                let body = wire::read_exact_body(r, n).await?;
                ServerFrame::Error { text: String::from_utf8_lossy(&body).into_owned() }
            }
            wire::PING_PONG => {
                let n = wire::parse_len(rest)?;
                let n = usize::try_from(n).map_err(|_| ProtocolError::BadLength)?;
                let payload = wire::read_exact_body(r, n).await?;
                ServerFrame::Pong { payload }
            }
            other => return Err(ProtocolError::UnknownVerb(other)),
        }));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::BufReader;

    async fn decode(bytes: &[u8]) -> Result<Option<ClientFrame>, ProtocolError> {
        let mut r = BufReader::new(std::io::Cursor::new(bytes.to_vec()));
        read_client_frame(&mut r).await
    }

    #[tokio::test]
    async fn decodes_auth() {
        let f = decode(b"$worker:3\r\n").await.unwrap().unwrap();
        assert_eq!(f, ClientFrame::Auth { name: "worker".into(), flags: 3 });
    }

    #[tokio::test]
    async fn decodes_recover() {
        let f = decode(b">100:200\r\n").await.unwrap().unwrap();
        assert_eq!(f, ClientFrame::Recover { since: 100, until: 200 });
    }

    #[tokio::test]
    async fn decodes_subscribe_and_unsubscribe() {
        let f = decode(b"+job.*\r\n").await.unwrap().unwrap();
        assert_eq!(f, ClientFrame::Subscribe { pattern: "job.*".into() });
        let f = decode(b"-job.*\r\n").await.unwrap().unwrap();
        assert_eq!(f, ClientFrame::Unsubscribe { pattern: "job.*".into() });
    }

    #[tokio::test]
    async fn decodes_ping_with_body() {
        let f = decode(b"@1\r\nx\r\n").await.unwrap().unwrap();
        assert_eq!(f, ClientFrame::Ping { payload: b"x".to_vec() });
    }

    #[tokio::test]
    async fn decodes_info() {
        let f = decode(b"#\r\n").await.unwrap().unwrap();
        assert_eq!(f, ClientFrame::Info);
    }

    #[tokio::test]
    async fn decodes_event_and_targeted_event() {
        let body = b"job.1:gzbytes";
        let mut frame = Vec::new();
        frame.push(b'=');
        frame.extend_from_slice(body.len().to_string().as_bytes());
        frame.extend_from_slice(b"\r\n");
        frame.extend_from_slice(body);
        frame.extend_from_slice(b"\r\n");
        let f = decode(&frame).await.unwrap().unwrap();
        assert_eq!(
            f,
            ClientFrame::Event { name: "job.1".into(), compressed: b"gzbytes".to_vec() }
        );

        let mut frame = Vec::new();
        frame.push(b'<');
        frame.extend_from_slice(b"worker:");
        frame.extend_from_slice(body.len().to_string().as_bytes());
        frame.extend_from_slice(b"\r\n");
        frame.extend_from_slice(body);
        frame.extend_from_slice(b"\r\n");
        let f = decode(&frame).await.unwrap().unwrap();
        assert_eq!(
            f,
            ClientFrame::TargetedEvent {
                target: "worker".into(),
                name: "job.1".into(),
                compressed: b"gzbytes".to_vec(),
            }
        );
    }

    #[tokio::test]
    async fn skips_blank_lines_then_decodes_next_frame() {
        let f = decode(b"\r\n#\r\n").await.unwrap().unwrap();
        assert_eq!(f, ClientFrame::Info);
    }

    #[tokio::test]
    async fn eof_yields_none() {
        assert!(decode(b"").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn unknown_verb_is_an_error() {
        assert!(decode(b"?garbage\r\n").await.is_err());
    }

    async fn decode_server(bytes: &[u8]) -> Result<Option<ServerFrame>, ProtocolError> {
        let mut r = BufReader::new(std::io::Cursor::new(bytes.to_vec()));
        read_server_frame(&mut r).await
    }

    #[tokio::test]
    async fn decodes_server_reply_error_and_pong() {
        assert_eq!(
            decode_server(b"*subscribe job.* OK\r\n").await.unwrap().unwrap(),
            ServerFrame::Reply { text: "subscribe job.* OK".into() }
        );
        assert_eq!(
            decode_server(b"!5\r\nboom!\r\n").await.unwrap().unwrap(),
            ServerFrame::Error { text: "boom!".into() }
        );
        assert_eq!(
            decode_server(b"@1\r\nx\r\n").await.unwrap().unwrap(),
            ServerFrame::Pong { payload: b"x".to_vec() }
        );
    }

    #[tokio::test]
    async fn decodes_server_event() {
        let body = b"job.1:gzbytes";
        let mut frame = vec![b'='];
        frame.extend_from_slice(body.len().to_string().as_bytes());
        frame.extend_from_slice(b"\r\n");
        frame.extend_from_slice(body);
        frame.extend_from_slice(b"\r\n");
        assert_eq!(
            decode_server(&frame).await.unwrap().unwrap(),
            ServerFrame::Event { name: "job.1".into(), compressed: b"gzbytes".to_vec() }
        );
    }
}
