//! The async front the rest of the broker talks to. Wraps two [`Db`]
//! handles (auth, events) behind blocking tasks, an event-write channel, and
//! a GC ticker — mirroring the background writer + ticker goroutines of the
//! system this crate replaces.

use crate::db::Db;
use crate::error::{StoreError, StoreResult};
use rt_protocol::{EventRecord, SessionRecord};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{error, info};

pub struct Config {
    pub auth_dsn: PathBuf,
    pub event_dsn: PathBuf,
    pub gc_duration: Duration,
}

/// A durable store for auth history and the event log. Cheap to clone: all
/// state lives behind `Arc`.
#[derive(Clone)]
pub struct Store {
    inner: Arc<Inner>,
}

struct Inner {
    auth: Arc<Db>,
    events: Arc<Db>,
    event_tx: std::sync::Mutex<Option<mpsc::Sender<EventRecord>>>,
    shutdown_tx: watch::Sender<bool>,
    writer: std::sync::Mutex<Option<JoinHandle<()>>>,
    gc: std::sync::Mutex<Option<JoinHandle<()>>>,
}

const EVENT_CHANNEL_CAPACITY: usize = 1024;

impl Store {
    pub fn open(cfg: Config) -> StoreResult<Self> {
        let auth = Arc::new(Db::open(&cfg.auth_dsn)?);
        let events = Arc::new(Db::open(&cfg.event_dsn)?);
        Ok(Self::spawn(auth, events, cfg.gc_duration))
    }

    pub fn open_in_memory(gc_duration: Duration) -> StoreResult<Self> {
        let auth = Arc::new(Db::open_in_memory()?);
        let events = Arc::new(Db::open_in_memory()?);
        Ok(Self::spawn(auth, events, gc_duration))
    }

    fn spawn(auth: Arc<Db>, events: Arc<Db>, gc_duration: Duration) -> Self {
        let (event_tx, mut event_rx) = mpsc::channel::<EventRecord>(EVENT_CHANNEL_CAPACITY);
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);

        let writer_events = events.clone();
        let writer = tokio::spawn(async move {
            while let Some(rec) = event_rx.recv().await {
                let db = writer_events.clone();
                let name = rec.name.clone();
                let result = tokio::task::spawn_blocking(move || db.insert_event(&rec)).await;
                match result {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => error!(name, error = %e, "failed to persist event"),
                    Err(e) => error!(name, error = %e, "event writer task panicked"),
                }
            }
        });

        let gc_auth = auth.clone();
        let gc_events = events.clone();
        let mut gc_shutdown = shutdown_rx.clone();
        let gc = tokio::spawn(async move {
            let mut tick = tokio::time::interval(gc_duration);
            tick.tick().await; // first tick fires immediately; skip it
            loop {
                tokio::select! {
                    biased;
                    _ = gc_shutdown.changed() => {
                        if *gc_shutdown.borrow() { break; }
                    }
                    now = tick.tick() => {
                        let before = now_unix_from_tick(now) - gc_duration.as_secs() as i64;
                        let auth = gc_auth.clone();
                        let events = gc_events.clone();
                        let result = tokio::task::spawn_blocking(move || -> StoreResult<(usize, usize)> {
                            let (a, _) = auth.gc(before)?;
                            let (_, e) = events.gc(before)?;
                            Ok((a, e))
                        })
                        .await;
                        match result {
                            Ok(Ok((a, e))) => info!(auth_deleted = a, events_deleted = e, before, "gc complete"),
                            Ok(Err(err)) => error!(error = %err, "gc failed"),
                            Err(err) => error!(error = %err, "gc task panicked"),
                        }
                    }
                }
            }
        });

        shutdown_rx.mark_unchanged();
        Store {
            inner: Arc::new(Inner {
                auth,
                events,
                event_tx: std::sync::Mutex::new(Some(event_tx)),
                shutdown_tx,
                writer: std::sync::Mutex::new(Some(writer)),
                gc: std::sync::Mutex::new(Some(gc)),
            }),
        }
    }

    /// Enqueue an event for durable persistence. Returns once the write is
    /// queued, not once it has hit disk.
    pub async fn record_event(&self, rec: EventRecord) -> StoreResult<()> {
        let tx = self.inner.event_tx.lock().unwrap().clone().ok_or(StoreError::Closed)?;
        tx.send(rec).await.map_err(|_| StoreError::Closed)
    }

    pub async fn get_last_auth(&self, name: &str) -> StoreResult<Option<SessionRecord>> {
        let db = self.inner.auth.clone();
        let name = name.to_owned();
        blocking(move || db.get_last_auth(&name)).await
    }

    pub async fn new_auth(&self, rec: SessionRecord) -> StoreResult<()> {
        let db = self.inner.auth.clone();
        blocking(move || db.insert_auth(&rec)).await
    }

    pub async fn update_auth(&self, rec: SessionRecord) -> StoreResult<()> {
        let db = self.inner.auth.clone();
        blocking(move || db.update_auth(&rec)).await
    }

    pub async fn each_auth(&self, name: &str) -> StoreResult<Vec<SessionRecord>> {
        let db = self.inner.auth.clone();
        let name = name.to_owned();
        blocking(move || db.each_auth(&name)).await
    }

    /// Events in `[since, until]` (`until <= 0` means unbounded) restricted
    /// to `prefixes` (empty means all), ordered oldest first — used to
    /// replay history to a reconnecting subscriber.
    pub async fn each_events(&self, prefixes: Vec<String>, since: i64, until: i64) -> StoreResult<Vec<EventRecord>> {
        let db = self.inner.events.clone();
        blocking(move || db.each_events(&prefixes, since, until)).await
    }

    pub async fn integrity_check(&self) -> StoreResult<()> {
        let auth = self.inner.auth.clone();
        let events = self.inner.events.clone();
        blocking(move || auth.integrity_check()).await?;
        blocking(move || events.integrity_check()).await
    }

    /// Stop accepting new events, drain the writer, and stop the GC ticker.
    pub async fn close(&self) {
        self.inner.event_tx.lock().unwrap().take(); // closes the channel, ending the writer loop
        let _ = self.inner.shutdown_tx.send(true);
        let writer = self.inner.writer.lock().unwrap().take();
        if let Some(h) = writer {
            let _ = h.await;
        }
        let gc = self.inner.gc.lock().unwrap().take();
        if let Some(h) = gc {
            let _ = h.await;
        }
    }
}

async fn blocking<F, T>(f: F) -> StoreResult<T>
where
    F: FnOnce() -> StoreResult<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f).await.map_err(|e| StoreError::Io(std::io::Error::other(e)))?
}

fn now_unix_from_tick(instant: tokio::time::Instant) -> i64 {
    // `tokio::time::Instant` is monotonic, not wall-clock; callers only use
    // the delta (`gc_duration` back from "now"), so we anchor on the
    // system clock at the moment the tick fires rather than the Instant.
    let _ = instant;
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rt_protocol::EventRecord;

    #[tokio::test]
    async fn record_event_persists_asynchronously() {
        let store = Store::open_in_memory(Duration::from_secs(3600)).unwrap();
        store.record_event(EventRecord::new("job.1", b"a", 1)).await.unwrap();
        // Give the writer task a chance to run.
        for _ in 0..50 {
            if !store.each_events(vec![], 0, 0).await.unwrap().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let events = store.each_events(vec![], 0, 0).await.unwrap();
        assert_eq!(events.len(), 1);
        store.close().await;
    }

    #[tokio::test]
    async fn auth_round_trip() {
        let store = Store::open_in_memory(Duration::from_secs(3600)).unwrap();
        assert!(store.get_last_auth("worker").await.unwrap().is_none());
        store.new_auth(SessionRecord::new("worker", "127.0.0.1", 10)).await.unwrap();
        let last = store.get_last_auth("worker").await.unwrap().unwrap();
        assert_eq!(last.connected_at, 10);
        store.close().await;
    }

    #[tokio::test]
    async fn integrity_check_passes() {
        let store = Store::open_in_memory(Duration::from_secs(3600)).unwrap();
        store.integrity_check().await.unwrap();
        store.close().await;
    }
}
