//! The broker hub: connection registry, publish fanout, recover replay, and
//! the optional one-way follower link.

pub mod config;
pub mod connection;
pub mod error;
pub mod events;
pub mod follower;
pub mod hub;

pub use config::HubConfig;
pub use connection::{ConnStatus, Connection};
pub use error::{BrokerError, BrokerResult};
pub use hub::Hub;
