//! Buffered publisher: a bounded queue drained by a "reduce" task that
//! re-authenticates on reconnect and resends a small ring of its most
//! recently sent records.

use crate::conn::Conn;
use rt_protocol::WRITABLE;
use std::collections::VecDeque;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{error, warn};

const QUEUE_CAPACITY: usize = 100;
const RESEND_RING: usize = 5;
const RESEND_DELAY: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
enum Outbound {
    Fire { name: String, data: Vec<u8> },
    FireTo { target: String, name: String, data: Vec<u8> },
}

/// A publisher that queues fires and retries them against a reconnecting
/// connection. `Clone`s share the same queue.
#[derive(Clone)]
pub struct Launcher {
    tx: mpsc::Sender<Outbound>,
}

pub struct LauncherHandle {
    pub launcher: Launcher,
    reducer: tokio::task::JoinHandle<()>,
    tx: mpsc::Sender<Outbound>,
}

impl Launcher {
    /// Spawn the reducer task against `name`/`addr`, reconnecting forever.
    pub fn spawn(name: impl Into<String>, addr: impl Into<String>) -> LauncherHandle {
        let (tx, rx) = mpsc::channel(QUEUE_CAPACITY);
        let name = name.into();
        let addr = addr.into();
        let reducer = tokio::spawn(reduce(name, addr, rx));
        LauncherHandle { launcher: Launcher { tx: tx.clone() }, reducer, tx }
    }

    pub async fn fire(&self, name: &str, data: &[u8]) -> Result<(), mpsc::error::SendError<()>> {
        self.tx
            .send(Outbound::Fire { name: name.to_owned(), data: data.to_owned() })
            .await
            .map_err(|_| mpsc::error::SendError(()))
    }

    pub async fn fire_to(&self, target: &str, name: &str, data: &[u8]) -> Result<(), mpsc::error::SendError<()>> {
        self.tx
            .send(Outbound::FireTo { target: target.to_owned(), name: name.to_owned(), data: data.to_owned() })
            .await
            .map_err(|_| mpsc::error::SendError(()))
    }
}

impl LauncherHandle {
    pub async fn close(self) {
        drop(self.tx);
        let _ = self.reducer.await;
    }
}

async fn reduce(name: String, addr: String, mut rx: mpsc::Receiver<Outbound>) {
    let mut ring: VecDeque<Outbound> = VecDeque::with_capacity(RESEND_RING);
    let mut conn: Option<Conn> = None;

    while let Some(msg) = rx.recv().await {
        loop {
            if conn.is_none() {
                match connect_and_resend(&name, &addr, &ring).await {
                    Ok(c) => conn = Some(c),
                    Err(e) => {
                        warn!(error = %e, "launcher reconnect failed, retrying");
                        tokio::time::sleep(Duration::from_secs(1)).await;
                        continue;
                    }
                }
            }

            let c = conn.as_mut().unwrap();
            let result = match &msg {
                Outbound::Fire { name, data } => c.fire(name, data).await,
                Outbound::FireTo { target, name, data } => c.fire_to(target, name, data).await,
            };

            match result {
                Ok(()) => {
                    if ring.len() == RESEND_RING {
                        ring.pop_front();
                    }
                    ring.push_back(msg);
                    break;
                }
                Err(e) => {
                    error!(error = %e, "launcher write failed, reconnecting");
                    if let Some(c) = conn.take() {
                        c.close().await;
                    }
                }
            }
        }
    }

    if let Some(c) = conn.take() {
        c.close().await;
    }
}

async fn connect_and_resend(name: &str, addr: &str, ring: &VecDeque<Outbound>) -> Result<Conn, crate::error::ClientError> {
    let mut conn = Conn::dial(name, addr).await?;
    conn.auth(WRITABLE).await?;

    if !ring.is_empty() {
        tokio::time::sleep(RESEND_DELAY).await;
        for msg in ring {
            let result = match msg {
                Outbound::Fire { name, data } => conn.fire(name, data).await,
                Outbound::FireTo { target, name, data } => conn.fire_to(target, name, data).await,
            };
            if let Err(e) = result {
                warn!(error = %e, "resend after reconnect failed");
            }
        }
    }

    Ok(conn)
}
