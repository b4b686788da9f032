//! A bounded pool of dialed, pre-authed connections.
//!
//! Grounded on the original connection pool: a free list plus a bound on
//! concurrently active connections, with callers blocking until one frees
//! up. `std::sync::Mutex` + `tokio::sync::Notify` stand in for the
//! mutex/condition-variable pair the source uses.

use crate::conn::{Conn, Received};
use crate::error::ClientError;
use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;

type DialFuture = Pin<Box<dyn Future<Output = Result<Conn, ClientError>> + Send>>;
type DialFn = Arc<dyn Fn() -> DialFuture + Send + Sync>;

struct PoolState {
    idle: VecDeque<Conn>,
    active: usize,
}

/// Shared pool handle. Cheap to clone.
#[derive(Clone)]
pub struct Pool {
    dial: DialFn,
    state: Arc<Mutex<PoolState>>,
    notify: Arc<Notify>,
    max_idle: usize,
    max_active: usize,
}

impl Pool {
    /// `max_active == 0` means unbounded.
    pub fn new(dial: DialFn, max_idle: usize, max_active: usize) -> Self {
        Pool {
            dial,
            state: Arc::new(Mutex::new(PoolState { idle: VecDeque::new(), active: 0 })),
            notify: Arc::new(Notify::new()),
            max_idle,
            max_active,
        }
    }

    pub fn active_conn(&self) -> usize {
        self.state.lock().unwrap().active
    }

    /// Acquire a connection, blocking until one is idle or a new one may be
    /// dialed. On dial failure the returned handle carries the error from
    /// every method call instead of panicking or hanging the caller.
    pub async fn get(&self) -> Pooled {
        loop {
            {
                let mut state = self.state.lock().unwrap();
                if let Some(conn) = state.idle.pop_front() {
                    return Pooled { pool: self.clone(), conn: Ok(conn) };
                }
                if self.max_active == 0 || state.active < self.max_active {
                    state.active += 1;
                    break;
                }
            }
            self.notify.notified().await;
        }

        match (self.dial)().await {
            Ok(conn) => Pooled { pool: self.clone(), conn: Ok(conn) },
            Err(e) => {
                let mut state = self.state.lock().unwrap();
                state.active -= 1;
                drop(state);
                self.notify.notify_one();
                Pooled { pool: self.clone(), conn: Err(format!("{e}")) }
            }
        }
    }

    /// Return a connection: if there's idle room it's kept, otherwise
    /// closed. A connection that already recorded an error is never
    /// re-pooled.
    async fn put(&self, conn: Conn) {
        let had_error = conn.err().is_some();
        if had_error {
            conn.close().await;
            let mut state = self.state.lock().unwrap();
            state.active -= 1;
            drop(state);
            self.notify.notify_one();
            return;
        }

        let overflow = {
            let mut state = self.state.lock().unwrap();
            state.idle.push_front(conn);
            if state.idle.len() > self.max_idle { state.idle.pop_back() } else { None }
        };
        if let Some(stale) = overflow {
            stale.close().await;
            let mut state = self.state.lock().unwrap();
            state.active -= 1;
        }
        self.notify.notify_one();
    }
}

/// A pooled connection. Masks the full [`Conn`] interface: `auth`,
/// `recover`, `subscribe`, and `unsubscribe` return
/// [`ClientError::NotSupported`] instead of touching the wire, since a
/// pooled connection is already authed by the dialer and shared channel
/// membership would be meaningless.
pub struct Pooled {
    pool: Pool,
    conn: Result<Conn, String>,
}

impl Pooled {
    pub async fn fire(&mut self, name: &str, data: &[u8]) -> Result<(), ClientError> {
        self.conn_mut()?.fire(name, data).await
    }

    pub async fn fire_to(&mut self, target: &str, name: &str, data: &[u8]) -> Result<(), ClientError> {
        self.conn_mut()?.fire_to(target, name, data).await
    }

    pub async fn ping(&mut self, payload: &[u8]) -> Result<(), ClientError> {
        self.conn_mut()?.ping(payload).await
    }

    pub async fn info(&mut self) -> Result<(), ClientError> {
        self.conn_mut()?.info().await
    }

    pub async fn receive(&mut self) -> Result<Received, ClientError> {
        self.conn_mut()?.receive().await
    }

    pub async fn auth(&mut self, _flags: i32) -> Result<(), ClientError> {
        Err(ClientError::NotSupported("auth"))
    }

    pub async fn recover(&mut self, _since: i64, _until: i64) -> Result<(), ClientError> {
        Err(ClientError::NotSupported("recover"))
    }

    pub async fn subscribe(&mut self, _pattern: &str) -> Result<(), ClientError> {
        Err(ClientError::NotSupported("subscribe"))
    }

    pub async fn unsubscribe(&mut self, _pattern: &str) -> Result<(), ClientError> {
        Err(ClientError::NotSupported("unsubscribe"))
    }

    pub fn err(&self) -> Option<&str> {
        match &self.conn {
            Ok(c) => c.err(),
            Err(e) => Some(e.as_str()),
        }
    }

    fn conn_mut(&mut self) -> Result<&mut Conn, ClientError> {
        self.conn.as_mut().map_err(|e| ClientError::Server(e.clone()))
    }

    /// Return this connection to the pool (or close it, if it errored).
    pub async fn close(self) {
        if let Ok(conn) = self.conn {
            self.pool.put(conn).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    async fn echo_server() -> (String, tokio::task::JoinHandle<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let handle = tokio::spawn(async move {
            loop {
                let Ok((mut stream, _)) = listener.accept().await else { break };
                tokio::spawn(async move {
                    let mut buf = [0u8; 1024];
                    use tokio::io::AsyncReadExt;
                    loop {
                        match stream.read(&mut buf).await {
                            Ok(0) | Err(_) => break,
                            Ok(_) => {}
                        }
                    }
                });
            }
        });
        (addr, handle)
    }

    #[tokio::test]
    async fn pool_bounds_active_connections() {
        let (addr, _server) = echo_server().await;
        let dial: DialFn = Arc::new(move || {
            let addr = addr.clone();
            Box::pin(async move { Conn::dial("pooled", &addr).await })
        });
        let pool = Pool::new(dial, 1, 2);

        let a = pool.get().await;
        let b = pool.get().await;
        assert_eq!(pool.active_conn(), 2);

        let pool2 = pool.clone();
        let waiter = tokio::spawn(async move {
            let c = pool2.get().await;
            assert!(c.err().is_none());
        });

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        a.close().await;
        waiter.await.unwrap();
        b.close().await;
    }
}
