//! One-way mirror: subscribe `*` on a remote broker and feed everything it
//! sends into the local hub, without re-publishing upstream.
//!
//! `join`/`leave` are special-cased: they update the local session history
//! directly (so local consumers see a consistent join/leave story) instead
//! of being treated as ordinary events.

use crate::events;
use crate::hub::Hub;
use rt_client::{Conn, Received};
use rt_protocol::{EventRecord, READABLE, SessionRecord, WRITABLE, compress};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};

const RETRY_DELAY: Duration = Duration::from_secs(3);

/// Run the follower forever: connect, subscribe `*`, consume events, and
/// reconnect on disconnect until `shutdown` fires.
pub async fn run(hub: Hub, addr: String, mut shutdown: watch::Receiver<bool>) {
    let mut since = now_unix();

    loop {
        tokio::select! {
            biased;
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!(addr, "follower stopping");
                    return;
                }
            }
            result = follow_once(&hub, &addr, since) => {
                match result {
                    Ok(()) => {}
                    Err(e) => warn!(addr, error = %e, "follower disconnected"),
                }
                since = now_unix();
                tokio::select! {
                    biased;
                    _ = shutdown.changed() => { if *shutdown.borrow() { return; } }
                    _ = tokio::time::sleep(RETRY_DELAY) => {}
                }
            }
        }
    }
}

async fn follow_once(hub: &Hub, addr: &str, since: i64) -> Result<(), rt_client::ClientError> {
    let mut conn = Conn::dial("", addr).await?;
    conn.auth(READABLE | WRITABLE).await?;
    conn.subscribe("*").await?;
    conn.recover(since, 0).await?;
    info!(addr, since, "follower connected");

    loop {
        match conn.receive().await? {
            Received::Reply(_) | Received::Pong(_) => {}
            Received::Event { name, data } => {
                if let Err(e) = dispatch(hub, &name, &data).await {
                    error!(error = %e, name, "follower failed to apply remote event");
                }
            }
        }
    }
}

async fn dispatch(hub: &Hub, name: &str, data: &[u8]) -> Result<(), FollowerError> {
    match name {
        events::JOIN => {
            let record: SessionRecord = serde_json::from_slice(data)?;
            hub.mirror_join(record).await?;
        }
        events::LEAVE => {
            let record: SessionRecord = serde_json::from_slice(data)?;
            hub.mirror_leave(record).await?;
        }
        events::CONNECTED => {} // synthetic, not a real event; nothing to mirror
        _ => {
            let compressed = compress::compress(data)?;
            let rec = EventRecord::new(name, &compressed, now_unix());
            hub.record_and_publish(rec).await?;
        }
    }
    Ok(())
}

#[derive(Debug, thiserror::Error)]
enum FollowerError {
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Broker(#[from] crate::error::BrokerError),
}

fn now_unix() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HubConfig;
    use rt_store::Store;
    use std::time::Duration;
    use tokio::net::TcpListener;

    fn test_hub() -> Hub {
        Hub::new(Store::open_in_memory(Duration::from_secs(3600)).unwrap(), HubConfig { join_delay: Duration::from_millis(10), verbose: false })
    }

    #[tokio::test]
    async fn follower_mirrors_upstream_events_and_join() {
        let upstream = test_hub();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let (upstream_shutdown_tx, upstream_shutdown_rx) = watch::channel(false);
        let serve_hub = upstream.clone();
        let upstream_server = tokio::spawn(async move { serve_hub.serve(listener, upstream_shutdown_rx).await });

        let downstream = test_hub();
        let (follower_shutdown_tx, follower_shutdown_rx) = watch::channel(false);
        let follower_hub = downstream.clone();
        let follower_addr = addr.clone();
        let follower_task = tokio::spawn(async move { run(follower_hub, follower_addr, follower_shutdown_rx).await });

        // give the follower time to dial, auth, subscribe, and recover.
        tokio::time::sleep(Duration::from_millis(100)).await;

        let mut publisher = Conn::dial("publisher", &addr).await.unwrap();
        publisher.auth(WRITABLE | READABLE).await.unwrap();
        // drain the synthetic "connected" event.
        let _ = publisher.receive().await.unwrap();
        publisher.fire("job.done", b"payload").await.unwrap();

        // the event needs to propagate: upstream publish -> follower receive -> mirror into downstream store.
        tokio::time::sleep(Duration::from_millis(200)).await;

        let events = downstream.store().each_events(Vec::new(), 0, now_unix() + 1).await.unwrap();
        assert!(events.iter().any(|e| e.name == "job.done"));

        let _ = follower_shutdown_tx.send(true);
        follower_task.abort();
        let _ = upstream_shutdown_tx.send(true);
        upstream_server.await.unwrap().unwrap();
        publisher.close().await;
    }

    #[tokio::test]
    async fn dispatch_routes_join_and_leave_without_publishing() {
        let hub = test_hub();
        let record = rt_protocol::SessionRecord::new("alice", "10.0.0.1:1", 100);
        let payload = serde_json::to_vec(&record).unwrap();

        dispatch(&hub, events::JOIN, &payload).await.unwrap();
        let last = hub.store().get_last_auth("alice").await.unwrap();
        assert!(last.is_some());

        let mut leave = record.clone();
        leave.disconnected_at = 200;
        let leave_payload = serde_json::to_vec(&leave).unwrap();
        dispatch(&hub, events::LEAVE, &leave_payload).await.unwrap();
        let after = hub.store().get_last_auth("alice").await.unwrap().unwrap();
        assert_eq!(after.disconnected_at, 200);

        // neither join nor leave should land in the event log.
        let events = hub.store().each_events(Vec::new(), 0, now_unix() + 1).await.unwrap();
        assert!(events.is_empty());
    }

    #[tokio::test]
    async fn dispatch_records_ordinary_events() {
        let hub = test_hub();
        dispatch(&hub, "job.1", b"hello").await.unwrap();
        let events = hub.store().each_events(Vec::new(), 0, now_unix() + 1).await.unwrap();
        assert!(events.iter().any(|e| e.name == "job.1"));
    }
}
