//! Gzip compression of event payloads.
//!
//! The broker never recompresses: payloads travel the wire exactly as the
//! publisher compressed them, and only the ultimate handler decompresses.

use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use std::io::{self, Read, Write};

pub fn compress(data: &[u8]) -> io::Result<Vec<u8>> {
    let mut enc = GzEncoder::new(Vec::new(), Compression::default());
    enc.write_all(data)?;
    enc.finish()
}

pub fn decompress(data: &[u8]) -> io::Result<Vec<u8>> {
    let mut dec = GzDecoder::new(data);
    let mut out = Vec::new();
    dec.read_to_end(&mut out)?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_arbitrary_bytes() {
        let data = b"hello, world! \0\x01\x02";
        let compressed = compress(data).unwrap();
        assert_ne!(compressed, data);
        let back = decompress(&compressed).unwrap();
        assert_eq!(back, data);
    }

    #[test]
    fn round_trips_empty() {
        let compressed = compress(b"").unwrap();
        let back = decompress(&compressed).unwrap();
        assert!(back.is_empty());
    }
}
