//! Reconnecting subscriber client.
//!
//! State machine: `idle -> connecting -> auth -> subscribing -> running ->
//! disconnected -> [backoff] -> connecting`. Each transition also dispatches
//! a synthetic event (`connecting`, `connected`, `disconnected`, `ready`) to
//! any handler whose registered pattern matches it, the same way a real
//! server event would be dispatched.

use crate::conn::{Conn, Received};
use crate::error::ClientError;
use rt_protocol::Pattern;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info, warn};

pub const EVENT_CONNECTING: &str = "connecting";
pub const EVENT_CONNECTED: &str = "connected";
pub const EVENT_DISCONNECTED: &str = "disconnected";
pub const EVENT_READY: &str = "ready";

pub type Handler = Arc<dyn Fn(String, Vec<u8>) + Send + Sync>;
pub type ErrorCallback = Arc<dyn Fn(&str, &dyn std::error::Error) + Send + Sync>;

struct Registration {
    pattern: Pattern,
    handler: Handler,
}

/// A subscribing client that reconnects on failure.
pub struct Listener {
    addr: String,
    name: String,
    registrations: Vec<Registration>,
    error_callback: Option<ErrorCallback>,
}

impl Listener {
    pub fn new(name: impl Into<String>, addr: impl Into<String>) -> Self {
        Listener { addr: addr.into(), name: name.into(), registrations: Vec::new(), error_callback: None }
    }

    /// Register a handler for events (or synthetic state changes) matching `pattern`.
    pub fn on(&mut self, pattern: &str, handler: Handler) {
        self.registrations.push(Registration { pattern: Pattern::new(pattern), handler });
    }

    /// Install a callback invoked when a dispatched handler task panics.
    pub fn set_handler_error_callback(&mut self, cb: ErrorCallback) {
        self.error_callback = Some(cb);
    }

    fn dispatch(&self, name: &str, data: Vec<u8>) {
        for reg in &self.registrations {
            if reg.pattern.matches(name) {
                let handler = reg.handler.clone();
                let name = name.to_owned();
                let data = data.clone();
                let err_cb = self.error_callback.clone();
                tokio::spawn(async move {
                    let result = tokio::task::spawn_blocking(move || handler(name, data)).await;
                    if let Err(join_err) = result {
                        if let Some(cb) = err_cb {
                            cb("handler panicked", &join_err);
                        }
                    }
                });
            }
        }
    }

    /// One connect -> auth -> subscribe -> run cycle. Returns when the
    /// connection drops (cleanly or with an error).
    pub async fn run(&self) -> Result<(), ClientError> {
        self.dispatch(EVENT_CONNECTING, Vec::new());
        let mut conn = Conn::dial(&self.name, &self.addr).await.inspect_err(|e| {
            self.dispatch(EVENT_DISCONNECTED, e.to_string().into_bytes());
        })?;

        conn.auth(rt_protocol::READABLE).await?;

        let want_ready_after = self.registrations.len();
        let mut subscribe_acks = 0usize;
        for reg in &self.registrations {
            conn.subscribe(reg.pattern.as_str()).await?;
        }

        self.dispatch(EVENT_CONNECTED, Vec::new());

        loop {
            match conn.receive().await {
                Ok(Received::Reply(text)) => {
                    debug!(text, "listener reply");
                    if text.starts_with("subscribe ") {
                        subscribe_acks += 1;
                        if subscribe_acks == want_ready_after {
                            self.dispatch(EVENT_READY, Vec::new());
                        }
                    }
                }
                Ok(Received::Pong(payload)) => self.dispatch("pong", payload),
                Ok(Received::Event { name, data }) => self.dispatch(&name, data),
                Err(e) => {
                    self.dispatch(EVENT_DISCONNECTED, e.to_string().into_bytes());
                    return Err(e);
                }
            }
        }
    }

    /// Forward a recover request on the active connection. The caller is
    /// expected to hold the connection open via [`run`]; in this crate's
    /// single-connection model, recover is issued right after subscribing
    /// by calling [`Conn::recover`] directly — exposed here for symmetry
    /// with the source API.
    pub async fn recover(conn: &mut Conn, since: i64, until: i64) -> Result<(), ClientError> {
        conn.recover(since, until).await
    }

    /// Run forever: attempt `run`, sleep `backoff` on failure, repeat until
    /// `quit` fires.
    pub async fn run_forever(&self, backoff: std::time::Duration, mut quit: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                biased;
                _ = quit.changed() => {
                    if *quit.borrow() {
                        info!(name = %self.name, "listener stopping");
                        return;
                    }
                }
                result = self.run() => {
                    if let Err(e) = result {
                        warn!(name = %self.name, error = %e, "listener disconnected, backing off");
                    }
                    tokio::select! {
                        biased;
                        _ = quit.changed() => { if *quit.borrow() { return; } }
                        _ = tokio::time::sleep(backoff) => {}
                    }
                }
            }
        }
    }
}
