//! Wire protocol for the event broker: frame verbs, encode/decode, event
//! hashing, and dotted-segment glob matching.
//!
//! This crate has no knowledge of sockets, the hub, or storage — it only
//! knows how to turn bytes into [`ClientFrame`]s and back.

pub mod compress;
pub mod error;
pub mod frame;
pub mod name;
pub mod record;
pub mod wire;

pub use error::ProtocolError;
pub use frame::{ClientFrame, ServerFrame, read_client_frame, read_server_frame};
pub use name::{EventName, MAX_NAME_LEN, Pattern};
pub use record::{EventRecord, READABLE, SessionRecord, WRITABLE};
