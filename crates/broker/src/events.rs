//! Names of the synthetic events the hub emits on top of published traffic.

pub const CONNECTED: &str = "connected";
pub const JOIN: &str = "join";
pub const LEAVE: &str = "leave";
pub const INFO: &str = "info";
