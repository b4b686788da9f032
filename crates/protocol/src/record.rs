//! Durable record shapes shared by the store, the hub, and followers.

use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};

/// Read/write capability bits carried in an auth frame.
pub const WRITABLE: i32 = 0x1;
pub const READABLE: i32 = 0x2;

/// An immutable, persisted event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventRecord {
    /// Hex SHA-1 over `name:compressed_payload`.
    pub hash: String,
    pub name: String,
    pub prefix: String,
    pub length: i64,
    /// The verbatim on-wire `name:compressed_payload` bytes, stored as a
    /// lossy UTF-8 string for simplicity (gzip bytes round-trip through
    /// Latin-1-safe storage; see `store` crate for the byte-exact column).
    pub raw: Vec<u8>,
    pub received_at: i64,
}

impl EventRecord {
    /// Build a record from a name and an already-compressed payload.
    pub fn new(name: &str, compressed_payload: &[u8], received_at: i64) -> Self {
        let raw = crate::wire::make_event_body(name, compressed_payload);
        let mut hasher = Sha1::new();
        hasher.update(&raw);
        let hash = hex::encode(hasher.finalize());
        EventRecord {
            hash,
            name: name.to_owned(),
            prefix: name.split('.').next().unwrap_or(name).to_owned(),
            length: raw.len() as i64,
            raw,
            received_at,
        }
    }
}

/// One authenticated connection lifespan.
///
/// Serialized as `join`/`leave` event payloads, so the field casing is part
/// of the wire contract: `{"Name":"y","DisconnectedAt":…}`, matching the
/// original `json.Marshal` output (no json tags, exported Go field names).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct SessionRecord {
    pub name: String,
    pub ip: String,
    pub connected_at: i64,
    pub disconnected_at: i64,
    pub recover_since: i64,
    pub recover_until: i64,
}

impl SessionRecord {
    pub fn new(name: &str, ip: &str, connected_at: i64) -> Self {
        SessionRecord {
            name: name.to_owned(),
            ip: ip.to_owned(),
            connected_at,
            disconnected_at: 0,
            recover_since: 0,
            recover_until: 0,
        }
    }

    /// A seed record used when no prior session exists for `name`.
    pub fn seed(name: &str) -> Self {
        SessionRecord {
            name: name.to_owned(),
            ip: String::new(),
            connected_at: 0,
            disconnected_at: 0,
            recover_since: 0,
            recover_until: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_is_over_name_colon_compressed_payload() {
        let r1 = EventRecord::new("job.1", b"gzbytes", 100);
        let r2 = EventRecord::new("job.1", b"gzbytes", 999);
        // received_at is not part of the hash input.
        assert_eq!(r1.hash, r2.hash);
        let r3 = EventRecord::new("job.2", b"gzbytes", 100);
        assert_ne!(r1.hash, r3.hash);
    }

    #[test]
    fn prefix_is_first_dotted_segment() {
        let r = EventRecord::new("job.1", b"x", 0);
        assert_eq!(r.prefix, "job");
    }
}
