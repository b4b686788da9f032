//! The connection registry: auth/quit bookkeeping, publish fanout, recover
//! replay, and the per-connection receive loop.
//!
//! A single lock pair (`named`, `ghost`) guards membership. Every mutating
//! operation snapshots the relevant connections under the lock, then does
//! network I/O after releasing it — so a slow or dead peer never blocks
//! auth, quit, or another publish.

use crate::config::HubConfig;
use crate::connection::{Connection, ConnStatus};
use crate::error::{BrokerError, BrokerResult};
use crate::events;
use rt_protocol::{ClientFrame, EventRecord, compress, read_client_frame, wire};
use rt_store::Store;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::net::TcpListener;
use tokio::sync::{Notify, RwLock, watch};
use tracing::{debug, error, info, warn};

struct ActiveGuard {
    count: AtomicUsize,
    notify: Notify,
}

impl ActiveGuard {
    fn new() -> Self {
        ActiveGuard { count: AtomicUsize::new(0), notify: Notify::new() }
    }

    fn enter(&self) {
        self.count.fetch_add(1, Ordering::SeqCst);
    }

    fn leave(&self) {
        if self.count.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.notify.notify_waiters();
        }
    }

    async fn wait_zero(&self) {
        while self.count.load(Ordering::SeqCst) != 0 {
            self.notify.notified().await;
        }
    }
}

struct Inner {
    named: RwLock<HashMap<String, Connection>>,
    ghost: RwLock<HashSet<Connection>>,
    store: Store,
    config: HubConfig,
    active: ActiveGuard,
}

#[derive(Serialize)]
struct InfoSnapshot {
    #[serde(rename = "Auth")]
    auth: HashMap<String, ConnStatus>,
    #[serde(rename = "Ghost")]
    ghost: Vec<ConnStatus>,
}

/// Registry + fanout. Cheap to clone: state lives behind `Arc`.
#[derive(Clone)]
pub struct Hub(Arc<Inner>);

impl Hub {
    pub fn new(store: Store, config: HubConfig) -> Self {
        Hub(Arc::new(Inner {
            named: RwLock::new(HashMap::new()),
            ghost: RwLock::new(HashSet::new()),
            store,
            config,
            active: ActiveGuard::new(),
        }))
    }

    /// Record an auth frame: set flags, file the connection as named or
    /// ghost, and (for named connections) load the prior session and
    /// persist the new one.
    pub async fn auth(&self, conn: &Connection, name: String, flags: i32) -> BrokerResult<()> {
        conn.set_flags(flags);

        if name.is_empty() {
            self.0.ghost.write().await.insert(conn.clone());
            conn.set_authed(true);
            return Ok(());
        }

        {
            let mut named = self.0.named.write().await;
            if named.contains_key(&name) {
                return Err(BrokerError::DuplicateAuth(name));
            }
            named.insert(name.clone(), conn.clone());
        }

        conn.set_name(name.clone()).await;
        let last = self.0.store.get_last_auth(&name).await?;
        conn.set_last_auth(last).await;
        conn.set_authed(true);

        let record = conn.auth_record().await;
        self.0.store.new_auth(record).await?;
        Ok(())
    }

    /// Remove `conn` from whichever registry it's in, persist its
    /// `disconnected_at`, and close its socket. Returns the final session
    /// record (used to build the `leave` event).
    pub async fn quit(&self, conn: &Connection, at: i64) -> rt_protocol::SessionRecord {
        let mut record = conn.auth_record().await;
        record.disconnected_at = at;

        if conn.has_name().await {
            let name = conn.name().await.unwrap_or_default();
            self.0.named.write().await.remove(&name);
            if let Err(e) = self.0.store.update_auth(record.clone()).await {
                error!(error = %e, name, "failed to persist disconnect");
            }
        } else {
            self.0.ghost.write().await.remove(conn);
        }

        conn.close().await;
        record
    }

    pub async fn quit_all(&self, at: i64) {
        let conns: Vec<Connection> = {
            let named = self.0.named.read().await;
            let ghost = self.0.ghost.read().await;
            named.values().cloned().chain(ghost.iter().cloned()).collect()
        };
        for c in conns {
            let record = self.quit(&c, at).await;
            if let Err(e) = self.publish_quit(&c, record).await {
                error!(error = %e, "publish leave on shutdown failed");
            }
        }
    }

    /// Send `rec` to every connection listening on its name, excluding
    /// `ignore`. Returns the number of connections it was handed to (not
    /// whether the write succeeded — a failed send just closes that peer).
    pub async fn publish(&self, rec: &EventRecord, ignore: Option<&Connection>) -> usize {
        let candidates: Vec<Connection> = {
            let named = self.0.named.read().await;
            let ghost = self.0.ghost.read().await;
            named.values().cloned().chain(ghost.iter().cloned()).collect()
        };

        let mut targets = Vec::new();
        for c in candidates {
            if ignore.is_some_and(|ig| ig == &c) {
                continue;
            }
            if c.is_listening(&rec.name).await {
                targets.push(c);
            }
        }

        let count = targets.len();
        for c in targets {
            let raw = rec.raw.clone();
            tokio::spawn(async move {
                if let Err(e) = c.send_event(&raw).await {
                    c.record_err(e).await;
                    c.close().await;
                }
            });
        }
        count
    }

    /// Deliver `rec` to exactly one named connection, if present and
    /// listening. Never persisted, never broadcast.
    pub async fn send_event_to(&self, app: &str, rec: &EventRecord) -> std::io::Result<()> {
        let target = self.0.named.read().await.get(app).cloned();
        if let Some(c) = target {
            if c.is_listening(&rec.name).await {
                return c.send_event(&rec.raw).await;
            }
        }
        Ok(())
    }

    /// Replay persisted events in `[since, until]` to `conn`. `since == 0`
    /// defaults to its last disconnect time (no replay if there is none);
    /// `until <= 0` defaults to now.
    pub async fn recover(&self, conn: &Connection, mut since: i64, mut until: i64) -> BrokerResult<()> {
        if since == 0 {
            match conn.last_auth().await {
                None => return Ok(()),
                Some(last) if last.disconnected_at == 0 => return Ok(()),
                Some(last) => since = last.disconnected_at,
            }
        }
        if until <= 0 {
            until = now_unix();
        }

        let (mut prefixes, has_match_all) = conn.channel_prefixes().await;
        if has_match_all {
            prefixes.clear();
        }

        debug!(remote = conn.remote_addr(), since, until, ?prefixes, "recover");

        let events = self.0.store.each_events(prefixes, since, until).await?;
        for rec in &events {
            if conn.is_listening(&rec.name).await {
                conn.send_event(&rec.raw).await?;
            }
        }

        if conn.has_name().await {
            let mut record = conn.auth_record().await;
            record.recover_since = since;
            record.recover_until = until;
            self.0.store.update_auth(record).await?;
        }

        Ok(())
    }

    /// JSON snapshot `{Auth: {name -> status}, Ghost: [status...]}`.
    pub async fn info(&self, ignore_write_only: bool) -> BrokerResult<Vec<u8>> {
        let named = self.0.named.read().await;
        let mut auth = HashMap::new();
        for (name, c) in named.iter() {
            if let Some(status) = c.status(ignore_write_only).await {
                auth.insert(name.clone(), status);
            }
        }
        drop(named);

        let ghost = self.0.ghost.read().await;
        let mut ghosts = Vec::new();
        for c in ghost.iter() {
            if let Some(status) = c.status(ignore_write_only).await {
                ghosts.push(status);
            }
        }
        drop(ghost);

        Ok(serde_json::to_vec(&InfoSnapshot { auth, ghost: ghosts })?)
    }

    pub async fn publish_join(&self, conn: &Connection) -> BrokerResult<()> {
        if !conn.has_name().await {
            return Ok(());
        }
        let record = conn.auth_record().await;
        let payload = serde_json::to_vec(&record)?;
        let compressed = compress::compress(&payload)?;
        let rec = EventRecord::new(events::JOIN, &compressed, record.connected_at);
        self.publish(&rec, Some(conn)).await;
        Ok(())
    }

    pub async fn publish_quit(&self, conn: &Connection, record: rt_protocol::SessionRecord) -> BrokerResult<()> {
        if !conn.has_name().await {
            return Ok(());
        }
        let payload = serde_json::to_vec(&record)?;
        let compressed = compress::compress(&payload)?;
        let rec = EventRecord::new(events::LEAVE, &compressed, record.disconnected_at);
        self.publish(&rec, Some(conn)).await;
        Ok(())
    }

    /// Apply a remote `join` into local session history without publishing
    /// anything — used by the follower to mirror upstream session state.
    pub async fn mirror_join(&self, record: rt_protocol::SessionRecord) -> BrokerResult<()> {
        self.0.store.new_auth(record).await?;
        Ok(())
    }

    /// Apply a remote `leave` into local session history. See [`mirror_join`](Hub::mirror_join).
    pub async fn mirror_leave(&self, record: rt_protocol::SessionRecord) -> BrokerResult<()> {
        self.0.store.update_auth(record).await?;
        Ok(())
    }

    /// Persist and fan out an event the follower received from upstream, as
    /// if it had been published locally.
    pub async fn record_and_publish(&self, rec: EventRecord) -> BrokerResult<()> {
        self.0.store.record_event(rec.clone()).await?;
        self.publish(&rec, None).await;
        Ok(())
    }

    /// Drive one connection end to end: first frame must be auth, then
    /// loop dispatching every subsequent frame until EOF or a transport
    /// error. Always runs quit/publish-leave on the way out.
    pub async fn handle<R>(&self, conn: Connection, mut reader: R)
    where
        R: AsyncBufReadExt + AsyncReadExt + Unpin,
    {
        self.0.active.enter();

        if let Err(e) = self.handle_inner(&conn, &mut reader).await {
            conn.record_err(e.to_string()).await;
        }

        let record = self.quit(&conn, now_unix()).await;
        if let Err(e) = self.publish_quit(&conn, record).await {
            error!(error = %e, "publish leave failed");
        }

        match conn.err().await {
            Some(e) => info!(remote = conn.remote_addr(), error = e, "connection disconnected"),
            None => info!(remote = conn.remote_addr(), "connection disconnected"),
        }

        self.0.active.leave();
    }

    async fn handle_inner<R>(&self, conn: &Connection, reader: &mut R) -> BrokerResult<()>
    where
        R: AsyncBufReadExt + AsyncReadExt + Unpin,
    {
        if !conn.is_authed() {
            match read_client_frame(reader).await? {
                Some(ClientFrame::Auth { name, flags }) => {
                    if let Err(e) = self.auth(conn, name, flags).await {
                        let _ = conn.send_error(&e.to_string()).await;
                        return Err(e);
                    }
                }
                _ => {
                    let _ = conn.send_error("first frame must be auth").await;
                    return Err(BrokerError::BadAuth("missing initial auth frame".into()));
                }
            }
        }

        info!(remote = conn.remote_addr(), "connected");

        let connected_body = wire::make_event_body(events::CONNECTED, &compress::compress(b"OK")?);
        let _ = conn.send_event(&connected_body).await;

        let hub = self.clone();
        let delayed_conn = conn.clone();
        let join_delay = self.0.config.join_delay;
        tokio::spawn(async move {
            tokio::time::sleep(join_delay).await;
            if let Err(e) = hub.publish_join(&delayed_conn).await {
                error!(error = %e, "publish join failed");
            }
        });

        loop {
            let frame = match read_client_frame(reader).await {
                Ok(Some(f)) => f,
                Ok(None) => return Ok(()),
                Err(e) => return Err(e.into()),
            };

            match frame {
                ClientFrame::Auth { .. } => {} // single-auth per connection; ignored thereafter
                ClientFrame::Recover { since, until } => {
                    if let Err(e) = self.recover(conn, since, until).await {
                        warn!(error = %e, since, until, "recover failed");
                        let _ = conn.send_error(&e.to_string()).await;
                    }
                }
                ClientFrame::Subscribe { pattern } => {
                    conn.subscribe(&pattern).await;
                    let _ = conn.send_reply(&format!("subscribe {pattern} OK")).await;
                }
                ClientFrame::Unsubscribe { pattern } => {
                    conn.unsubscribe(&pattern).await;
                    let _ = conn.send_reply(&format!("unsubscribe {pattern} OK")).await;
                }
                ClientFrame::Ping { payload } => {
                    conn.send_pong(&payload).await?;
                }
                ClientFrame::Info => match self.info(true).await {
                    Ok(snapshot) => {
                        let compressed = compress::compress(&snapshot)?;
                        let body = wire::make_event_body(events::INFO, &compressed);
                        let _ = conn.send_event(&body).await;
                    }
                    Err(e) => {
                        let _ = conn.send_error(&e.to_string()).await;
                    }
                },
                ClientFrame::Event { name, compressed } => {
                    if !conn.writable() {
                        if self.0.config.verbose {
                            debug!(remote = conn.remote_addr(), name, "write-only conn, event dropped");
                        }
                        continue;
                    }
                    let rec = EventRecord::new(&name, &compressed, now_unix());
                    if let Err(e) = self.0.store.record_event(rec.clone()).await {
                        error!(error = %e, name, "failed to enqueue event for persistence");
                    }
                    self.publish(&rec, None).await;
                }
                ClientFrame::TargetedEvent { target, name, compressed } => {
                    if !conn.writable() {
                        continue;
                    }
                    let rec = EventRecord::new(&name, &compressed, now_unix());
                    if let Err(e) = self.send_event_to(&target, &rec).await {
                        warn!(error = %e, target, "targeted delivery failed");
                    }
                }
            }
        }
    }

    /// Bind `addr` and serve it. See [`Hub::serve`] for shutdown semantics.
    pub async fn listen_and_serve(&self, addr: &str, shutdown: watch::Receiver<bool>) -> std::io::Result<()> {
        let listener = TcpListener::bind(addr).await?;
        info!(addr, "broker listening");
        self.serve(listener, shutdown).await
    }

    /// Accept connections on an already-bound `listener` until `shutdown`
    /// fires, then quit every connection, stop accepting, drain in-flight
    /// handlers, and close the store.
    pub async fn serve(&self, listener: TcpListener, mut shutdown: watch::Receiver<bool>) -> std::io::Result<()> {
        let hub = self.clone();
        let accept_task = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, peer)) => {
                        let hub = hub.clone();
                        tokio::spawn(async move {
                            let (read_half, write_half) = stream.into_split();
                            let reader = BufReader::new(read_half);
                            let conn = Connection::new(peer.to_string(), now_unix(), write_half);
                            hub.handle(conn, reader).await;
                        });
                    }
                    Err(e) => {
                        error!(error = %e, "accept failed");
                        return;
                    }
                }
            }
        });

        let _ = shutdown.changed().await;
        info!("shutdown signal received");
        self.quit_all(now_unix()).await;
        accept_task.abort();
        self.0.active.wait_zero().await;
        self.0.store.close().await;
        info!("store closed");
        Ok(())
    }
}

fn now_unix() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
impl Hub {
    pub(crate) fn store(&self) -> &Store {
        &self.0.store
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn hub() -> Hub {
        Hub::new(Store::open_in_memory(Duration::from_secs(3600)).unwrap(), HubConfig { join_delay: Duration::from_millis(10), verbose: false })
    }

    #[tokio::test]
    async fn publish_counts_zero_targets_when_nobody_subscribed() {
        let hub = hub();
        let rec = rt_protocol::EventRecord::new("job.1", b"x", 1);
        let n = hub.publish(&rec, None).await;
        assert_eq!(n, 0);
    }

    #[tokio::test]
    async fn recover_with_no_prior_session_is_a_noop() {
        use crate::connection::Connection as Conn;
        let hub = hub();
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = tokio::net::TcpStream::connect(addr).await.unwrap();
        let (server_stream, _) = listener.accept().await.unwrap();
        drop(client);
        let (_r, w) = server_stream.into_split();
        let conn = Conn::new("127.0.0.1:0".into(), 1, w);
        hub.recover(&conn, 0, 0).await.unwrap();
    }

    #[tokio::test]
    async fn info_snapshot_is_valid_json() {
        let hub = hub();
        let snapshot = hub.info(true).await.unwrap();
        let v: serde_json::Value = serde_json::from_slice(&snapshot).unwrap();
        assert!(v.get("Auth").is_some());
        assert!(v.get("Ghost").is_some());
    }

    #[tokio::test]
    async fn end_to_end_auth_subscribe_fire_and_receive() {
        use rt_client::Conn;

        let hub = hub();
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let server_hub = hub.clone();
        let server = tokio::spawn(async move { server_hub.serve(listener, shutdown_rx).await });

        let mut sub = Conn::dial("reader", &addr).await.unwrap();
        sub.auth(rt_protocol::READABLE).await.unwrap();
        sub.subscribe("job.*").await.unwrap();

        // drain the synthetic "connected" event and the subscribe ack
        let first = sub.receive().await.unwrap();
        assert!(matches!(first, rt_client::Received::Event { ref name, .. } if name == "connected"));
        let ack = sub.receive().await.unwrap();
        assert_eq!(ack, rt_client::Received::Reply("subscribe job.* OK".into()));

        let mut pub_conn = Conn::dial("writer", &addr).await.unwrap();
        pub_conn.auth(rt_protocol::WRITABLE).await.unwrap();
        pub_conn.fire("job.1", b"hello").await.unwrap();

        let received = sub.receive().await.unwrap();
        assert_eq!(received, rt_client::Received::Event { name: "job.1".into(), data: b"hello".to_vec() });

        sub.close().await;
        pub_conn.close().await;
        let _ = shutdown_tx.send(true);
        server.await.unwrap().unwrap();
    }
}
