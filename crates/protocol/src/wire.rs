//! Frame verbs and the length-prefixed line protocol.
//!
//! A frame begins with a single verb byte; the remainder is either inline
//! text terminated by CRLF, or a decimal length, CRLF, that many raw bytes,
//! and a trailing CRLF.

use crate::ProtocolError;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt};

pub const AUTH: u8 = b'$';
pub const RECOVER: u8 = b'>';
pub const SUBSCRIBE: u8 = b'+';
pub const UNSUBSCRIBE: u8 = b'-';
pub const PING_PONG: u8 = b'@';
pub const INFO: u8 = b'#';
pub const EVENT: u8 = b'=';
pub const TARGETED_EVENT: u8 = b'<';
pub const REPLY: u8 = b'*';
pub const ERROR: u8 = b'!';

pub const EOL: &[u8] = b"\r\n";

/// Parse a decimal length prefix. Accepts an optional leading `-`, stops at
/// CR/LF or end of slice. A negative result is a valid parse but represents
/// a length error to the caller (per the wire spec, not this function).
pub fn parse_len(p: &[u8]) -> Result<i64, ProtocolError> {
    if p.is_empty() {
        return Err(ProtocolError::BadLength);
    }

    let (negate, digits) = if p[0] == b'-' { (true, &p[1..]) } else { (false, p) };
    if digits.is_empty() {
        return Err(ProtocolError::BadLength);
    }

    let mut n: i64 = 0;
    let mut saw_digit = false;
    for &b in digits {
        if b == b'\r' || b == b'\n' {
            break;
        }
        if !b.is_ascii_digit() {
            return Err(ProtocolError::BadLength);
        }
        saw_digit = true;
        n = n * 10 + i64::from(b - b'0');
    }
    if !saw_digit {
        return Err(ProtocolError::BadLength);
    }

    Ok(if negate { -n } else { n })
}

/// Split `target:length` (the `<target:N` form of a targeted event header).
pub fn parse_target_and_len(p: &[u8]) -> Result<(String, i64), ProtocolError> {
    let i = p.iter().position(|&b| b == b':').ok_or(ProtocolError::BadSchema)?;
    let target = String::from_utf8_lossy(&p[..i]).into_owned();
    let length = parse_len(&p[i + 1..])?;
    Ok((target, length))
}

/// Split `since:until` decimal seconds.
pub fn parse_since_until(p: &[u8]) -> (i64, i64) {
    let s = String::from_utf8_lossy(p);
    let mut parts = s.splitn(2, ':');
    let since = parts.next().and_then(|v| v.trim().parse().ok()).unwrap_or(0);
    let until = parts.next().and_then(|v| v.trim().parse().ok()).unwrap_or(0);
    (since, until)
}

/// Split `name:flags` (an auth frame body).
pub fn parse_auth(p: &[u8]) -> Result<(String, i32), ProtocolError> {
    let s = String::from_utf8_lossy(p);
    let s = s.trim();
    let i = s.find(':').ok_or(ProtocolError::BadSchema)?;
    let name = s[..i].to_owned();
    let flags: i32 = s[i + 1..].parse().map_err(|_| ProtocolError::BadSchema)?;
    Ok((name, flags))
}

/// Split the `name:gzdata` body of an event payload into the raw name bytes
/// and raw (still-compressed) data bytes. The name is capped at 30 bytes
/// while scanning for `:`, matching the wire invariant that names are short.
pub fn parse_event_body(p: &[u8]) -> Result<(String, Vec<u8>), ProtocolError> {
    let sep = p.iter().position(|&b| b == b':');
    let sep = match sep {
        Some(i) if i <= crate::name::MAX_NAME_LEN => i,
        Some(_) => return Err(ProtocolError::NameTooLong(p.len())),
        None => return Err(ProtocolError::BadSchema),
    };

    let name = &p[..sep];
    let data = &p[sep + 1..];

    if name.is_empty() {
        return Err(ProtocolError::EmptyName);
    }
    if data.is_empty() {
        return Err(ProtocolError::EmptyPayload);
    }

    Ok((String::from_utf8_lossy(name).into_owned(), data.to_vec()))
}

/// Build the on-wire `name:gzdata` body from a name and already-compressed
/// payload bytes.
pub fn make_event_body(name: &str, compressed: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(name.len() + 1 + compressed.len());
    buf.extend_from_slice(name.as_bytes());
    buf.push(b':');
    buf.extend_from_slice(compressed);
    buf
}

/// Read one CRLF-or-LF-terminated line, with the terminator stripped.
/// Returns `Ok(None)` at EOF.
pub async fn read_line<R>(r: &mut R) -> std::io::Result<Option<Vec<u8>>>
where
    R: AsyncBufReadExt + Unpin,
{
    let mut buf = Vec::new();
    let n = r.read_until(b'\n', &mut buf).await?;
    if n == 0 {
        return Ok(None);
    }
    if buf.last() == Some(&b'\n') {
        buf.pop();
        if buf.last() == Some(&b'\r') {
            buf.pop();
        }
    }
    Ok(Some(buf))
}

/// Read exactly `n` raw bytes followed by the trailing CRLF (discarded).
pub async fn read_exact_body<R>(r: &mut R, n: usize) -> std::io::Result<Vec<u8>>
where
    R: tokio::io::AsyncReadExt + AsyncBufReadExt + Unpin,
{
    let mut buf = vec![0u8; n];
    r.read_exact(&mut buf).await?;
    let _ = read_line(r).await?;
    Ok(buf)
}

/// Write a `verb + decimal length + CRLF` header.
pub async fn write_len<W>(w: &mut W, verb: u8, n: usize) -> std::io::Result<()>
where
    W: AsyncWriteExt + Unpin,
{
    w.write_all(&[verb]).await?;
    w.write_all(n.to_string().as_bytes()).await?;
    w.write_all(EOL).await
}

/// Write a `verb + target ':' + decimal length + CRLF` header.
pub async fn write_target_and_len<W>(w: &mut W, verb: u8, target: &str, n: usize) -> std::io::Result<()>
where
    W: AsyncWriteExt + Unpin,
{
    w.write_all(&[verb]).await?;
    w.write_all(target.as_bytes()).await?;
    w.write_all(b":").await?;
    w.write_all(n.to_string().as_bytes()).await?;
    w.write_all(EOL).await
}

/// Write a full event frame: header, body, trailing CRLF, as one atomic
/// write so concurrent fanout tasks never interleave frames on one socket.
pub async fn write_event<W>(w: &mut W, body: &[u8]) -> std::io::Result<()>
where
    W: AsyncWriteExt + Unpin,
{
    let mut frame = Vec::with_capacity(1 + 10 + 2 + body.len() + 2);
    frame.push(EVENT);
    frame.extend_from_slice(body.len().to_string().as_bytes());
    frame.extend_from_slice(EOL);
    frame.extend_from_slice(body);
    frame.extend_from_slice(EOL);
    w.write_all(&frame).await
}

/// Write a full targeted-event frame atomically.
pub async fn write_event_to<W>(w: &mut W, target: &str, body: &[u8]) -> std::io::Result<()>
where
    W: AsyncWriteExt + Unpin,
{
    let mut frame = Vec::with_capacity(1 + target.len() + 1 + 10 + 2 + body.len() + 2);
    frame.push(TARGETED_EVENT);
    frame.extend_from_slice(target.as_bytes());
    frame.push(b':');
    frame.extend_from_slice(body.len().to_string().as_bytes());
    frame.extend_from_slice(EOL);
    frame.extend_from_slice(body);
    frame.extend_from_slice(EOL);
    w.write_all(&frame).await
}

/// Write a ping/pong frame atomically.
pub async fn write_ping<W>(w: &mut W, payload: &[u8]) -> std::io::Result<()>
where
    W: AsyncWriteExt + Unpin,
{
    let mut frame = Vec::with_capacity(1 + 10 + 2 + payload.len() + 2);
    frame.push(PING_PONG);
    frame.extend_from_slice(payload.len().to_string().as_bytes());
    frame.extend_from_slice(EOL);
    frame.extend_from_slice(payload);
    frame.extend_from_slice(EOL);
    w.write_all(&frame).await
}

/// Write an error frame atomically.
pub async fn write_error<W>(w: &mut W, message: &str) -> std::io::Result<()>
where
    W: AsyncWriteExt + Unpin,
{
    let payload = message.as_bytes();
    let mut frame = Vec::with_capacity(1 + 10 + 2 + payload.len() + 2);
    frame.push(ERROR);
    frame.extend_from_slice(payload.len().to_string().as_bytes());
    frame.extend_from_slice(EOL);
    frame.extend_from_slice(payload);
    frame.extend_from_slice(EOL);
    w.write_all(&frame).await
}

/// Write a reply frame (`*text\r\n`).
pub async fn write_reply<W>(w: &mut W, text: &str) -> std::io::Result<()>
where
    W: AsyncWriteExt + Unpin,
{
    w.write_all(&[REPLY]).await?;
    w.write_all(text.as_bytes()).await?;
    w.write_all(EOL).await
}

/// Write an auth frame (`$name:flags\r\n`).
pub async fn write_auth<W>(w: &mut W, name: &str, flags: i32) -> std::io::Result<()>
where
    W: AsyncWriteExt + Unpin,
{
    w.write_all(&[AUTH]).await?;
    w.write_all(format!("{name}:{flags}").as_bytes()).await?;
    w.write_all(EOL).await
}

/// Write a recover frame (`>since:until\r\n`).
pub async fn write_recover<W>(w: &mut W, since: i64, until: i64) -> std::io::Result<()>
where
    W: AsyncWriteExt + Unpin,
{
    w.write_all(&[RECOVER]).await?;
    w.write_all(format!("{since}:{until}").as_bytes()).await?;
    w.write_all(EOL).await
}

/// Write a subscribe/unsubscribe frame for one pattern.
pub async fn write_channel<W>(w: &mut W, verb: u8, pattern: &str) -> std::io::Result<()>
where
    W: AsyncWriteExt + Unpin,
{
    w.write_all(&[verb]).await?;
    w.write_all(pattern.as_bytes()).await?;
    w.write_all(EOL).await
}

/// Write the bare info request (`#\r\n`).
pub async fn write_info<W>(w: &mut W) -> std::io::Result<()>
where
    W: AsyncWriteExt + Unpin,
{
    w.write_all(&[INFO]).await?;
    w.write_all(EOL).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_len_accepts_positive_and_negative() {
        assert_eq!(parse_len(b"123").unwrap(), 123);
        assert_eq!(parse_len(b"-5").unwrap(), -5);
        assert_eq!(parse_len(b"0\r\n").unwrap(), 0);
    }

    #[test]
    fn parse_len_rejects_garbage() {
        assert!(parse_len(b"").is_err());
        assert!(parse_len(b"-").is_err());
        assert!(parse_len(b"12a").is_err());
    }

    #[test]
    fn parse_target_and_len_splits_on_first_colon() {
        let (target, len) = parse_target_and_len(b"worker:42").unwrap();
        assert_eq!(target, "worker");
        assert_eq!(len, 42);
    }

    #[test]
    fn parse_since_until_defaults_missing_until_to_zero() {
        assert_eq!(parse_since_until(b"100:200"), (100, 200));
        assert_eq!(parse_since_until(b"100"), (100, 0));
    }

    #[test]
    fn parse_event_body_rejects_empty_name_oversize_name_and_missing_separator() {
        assert!(matches!(parse_event_body(b":data"), Err(ProtocolError::EmptyName)));
        assert!(matches!(parse_event_body(b"noColon"), Err(ProtocolError::BadSchema)));
        assert!(matches!(parse_event_body(b"name:"), Err(ProtocolError::EmptyPayload)));
        let long_name = "a".repeat(31);
        let body = format!("{long_name}:data");
        assert!(matches!(
            parse_event_body(body.as_bytes()),
            Err(ProtocolError::NameTooLong(_))
        ));
    }

    #[test]
    fn parse_event_body_accepts_thirty_byte_name() {
        let name = "a".repeat(30);
        let body = format!("{name}:data");
        let (parsed_name, data) = parse_event_body(body.as_bytes()).unwrap();
        assert_eq!(parsed_name, name);
        assert_eq!(data, b"data");
    }

    #[tokio::test]
    async fn read_line_strips_crlf_and_detects_eof() {
        let mut r = tokio::io::BufReader::new(std::io::Cursor::new(b"hello\r\nworld\n".to_vec()));
        let l1 = read_line(&mut r).await.unwrap().unwrap();
        assert_eq!(l1, b"hello");
        let l2 = read_line(&mut r).await.unwrap().unwrap();
        assert_eq!(l2, b"world");
        assert!(read_line(&mut r).await.unwrap().is_none());
    }
}
