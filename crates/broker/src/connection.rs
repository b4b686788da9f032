//! One peer endpoint: auth state, channel set, write buffer.
//!
//! Registry membership (`named`/`ghost`) lives in [`crate::hub::Hub`]; this
//! type only owns what a single connection needs to answer `IsListening`
//! and to write frames without interleaving.

use rt_protocol::{Pattern, READABLE, SessionRecord, WRITABLE, wire};
use serde::Serialize;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::{Mutex, RwLock};

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

struct ConnState {
    id: u64,
    remote_addr: String,
    connected_at: i64,
    name: RwLock<Option<String>>,
    flags: AtomicI32,
    authed: AtomicBool,
    last_auth: RwLock<Option<SessionRecord>>,
    channels: RwLock<HashSet<Pattern>>,
    writer: Mutex<Option<OwnedWriteHalf>>,
    err: Mutex<Option<String>>,
}

/// A handle to one connection. Cheap to clone; clones share identity
/// (`Eq`/`Hash` by a monotonic id), which is what lets the hub's `ghost`
/// set use plain `Connection` values as set members.
#[derive(Clone)]
pub struct Connection(Arc<ConnState>);

impl PartialEq for Connection {
    fn eq(&self, other: &Self) -> bool {
        self.0.id == other.0.id
    }
}
impl Eq for Connection {}
impl std::hash::Hash for Connection {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.0.id.hash(state);
    }
}

impl Connection {
    pub fn new(remote_addr: String, connected_at: i64, writer: OwnedWriteHalf) -> Self {
        Connection(Arc::new(ConnState {
            id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
            remote_addr,
            connected_at,
            name: RwLock::new(None),
            flags: AtomicI32::new(0),
            authed: AtomicBool::new(false),
            last_auth: RwLock::new(None),
            channels: RwLock::new(HashSet::new()),
            writer: Mutex::new(Some(writer)),
            err: Mutex::new(None),
        }))
    }

    pub fn id(&self) -> u64 {
        self.0.id
    }

    pub fn remote_addr(&self) -> &str {
        &self.0.remote_addr
    }

    pub fn connected_at(&self) -> i64 {
        self.0.connected_at
    }

    pub async fn name(&self) -> Option<String> {
        self.0.name.read().await.clone()
    }

    pub async fn has_name(&self) -> bool {
        self.0.name.read().await.is_some()
    }

    pub async fn set_name(&self, name: String) {
        *self.0.name.write().await = Some(name);
    }

    pub fn flags(&self) -> i32 {
        self.0.flags.load(Ordering::Relaxed)
    }

    pub fn set_flags(&self, flags: i32) {
        self.0.flags.store(flags, Ordering::Relaxed);
    }

    pub fn writable(&self) -> bool {
        self.flags() & WRITABLE != 0
    }

    pub fn readable(&self) -> bool {
        self.flags() & READABLE != 0
    }

    pub fn is_authed(&self) -> bool {
        self.0.authed.load(Ordering::Relaxed)
    }

    pub fn set_authed(&self, authed: bool) {
        self.0.authed.store(authed, Ordering::Relaxed);
    }

    pub async fn set_last_auth(&self, last: Option<SessionRecord>) {
        *self.0.last_auth.write().await = last;
    }

    pub async fn last_auth(&self) -> Option<SessionRecord> {
        self.0.last_auth.read().await.clone()
    }

    /// The session record for this connection's current lifetime, as it
    /// stands right now (`disconnected_at` is filled in by the hub at quit
    /// time).
    pub async fn auth_record(&self) -> SessionRecord {
        SessionRecord::new(self.name().await.unwrap_or_default().as_str(), &self.0.remote_addr, self.0.connected_at)
    }

    /// Add `pattern` to the channel set. Returns `true` if it was newly added.
    pub async fn subscribe(&self, pattern: &str) -> bool {
        self.0.channels.write().await.insert(Pattern::new(pattern))
    }

    /// Remove `pattern` from the channel set. Returns `true` if it was present.
    pub async fn unsubscribe(&self, pattern: &str) -> bool {
        self.0.channels.write().await.remove(&Pattern::new(pattern))
    }

    /// True if this connection can receive `name`: it must have `Readable`
    /// and at least one subscribed pattern must match.
    pub async fn is_listening(&self, name: &str) -> bool {
        if !self.readable() {
            return false;
        }
        self.0.channels.read().await.iter().any(|p| p.matches(name))
    }

    /// The prefix set implied by current subscriptions, and whether `*` is
    /// among them (in which case the prefix set is meaningless and recover
    /// must scan all events).
    pub async fn channel_prefixes(&self) -> (Vec<String>, bool) {
        let channels = self.0.channels.read().await;
        let mut prefixes = Vec::new();
        let mut has_match_all = false;
        for p in channels.iter() {
            match p.prefix() {
                Some(prefix) => prefixes.push(prefix.to_owned()),
                None => has_match_all = true,
            }
        }
        (prefixes, has_match_all)
    }

    /// A connection without `Readable` has its write buffer routed to a
    /// sink (spec §3): events, replies, and pongs are silently discarded
    /// rather than written to the socket.
    pub async fn send_event(&self, raw: &[u8]) -> std::io::Result<()> {
        if !self.readable() {
            return Ok(());
        }
        let mut guard = self.0.writer.lock().await;
        match guard.as_mut() {
            Some(w) => wire::write_event(w, raw).await,
            None => Err(std::io::Error::new(std::io::ErrorKind::NotConnected, "connection closed")),
        }
    }

    pub async fn send_reply(&self, text: &str) -> std::io::Result<()> {
        if !self.readable() {
            return Ok(());
        }
        let mut guard = self.0.writer.lock().await;
        match guard.as_mut() {
            Some(w) => wire::write_reply(w, text).await,
            None => Err(std::io::Error::new(std::io::ErrorKind::NotConnected, "connection closed")),
        }
    }

    pub async fn send_error(&self, text: &str) -> std::io::Result<()> {
        let mut guard = self.0.writer.lock().await;
        match guard.as_mut() {
            Some(w) => wire::write_error(w, text).await,
            None => Err(std::io::Error::new(std::io::ErrorKind::NotConnected, "connection closed")),
        }
    }

    pub async fn send_pong(&self, payload: &[u8]) -> std::io::Result<()> {
        if !self.readable() {
            return Ok(());
        }
        let mut guard = self.0.writer.lock().await;
        match guard.as_mut() {
            Some(w) => wire::write_ping(w, payload).await,
            None => Err(std::io::Error::new(std::io::ErrorKind::NotConnected, "connection closed")),
        }
    }

    pub async fn record_err(&self, e: impl ToString) {
        let mut guard = self.0.err.lock().await;
        if guard.is_none() {
            *guard = Some(e.to_string());
        }
    }

    pub async fn err(&self) -> Option<String> {
        self.0.err.lock().await.clone()
    }

    /// Idempotent: the first call drops the write half (closing the
    /// socket); later calls are no-ops.
    pub async fn close(&self) {
        self.0.writer.lock().await.take();
    }

    /// A snapshot for the `info` response. `None` if `ignore_write_only` is
    /// set and this connection lacks `Readable`.
    pub async fn status(&self, ignore_write_only: bool) -> Option<ConnStatus> {
        if ignore_write_only && !self.readable() {
            return None;
        }
        let channels = self.0.channels.read().await.iter().map(|p| p.as_str().to_owned()).collect();
        Some(ConnStatus {
            channels,
            name: self.name().await,
            last_auth: self.last_auth().await,
            flags: self.flags(),
        })
    }
}

/// `info` snapshot entry. Field casing is part of the wire contract (spec
/// §4.3/§4.7: `status = {Channels, Name, LastAuth?, Flag}`).
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct ConnStatus {
    pub channels: Vec<String>,
    pub name: Option<String>,
    pub last_auth: Option<SessionRecord>,
    #[serde(rename = "Flag")]
    pub flags: i32,
}
