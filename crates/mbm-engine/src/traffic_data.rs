//! Per-packet telemetry records and the data-chunk prefix.
//!
//! Every data chunk starts with an 8-byte prefix: sequence number then nonce,
//! both network-order u32s; the rest of the chunk is opaque filler. The
//! client reports each arrival as a 16-byte `TrafficData` record over the
//! control channel, all four fields network-order u32s.

use crate::constants::NS_PER_SEC;
use crate::error::{Error, Result};

/// One observed packet: who it was (`seq_no`, `nonce`) and when it arrived
/// (monotonic nanoseconds split into whole seconds and a remainder).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrafficData {
    pub seq_no: u32,
    pub nonce: u32,
    sec: u32,
    nsec_remainder: u32,
}

/// Serialized length of one record.
pub const TRAFFIC_DATA_WIRE_LEN: usize = 16;

/// Length of the seq/nonce prefix stamped into every data chunk.
pub const CHUNK_PREFIX_LEN: usize = 8;

impl TrafficData {
    pub fn new(seq_no: u32, nonce: u32, timestamp_ns: u64) -> TrafficData {
        TrafficData {
            seq_no,
            nonce,
            sec: (timestamp_ns / NS_PER_SEC) as u32,
            nsec_remainder: (timestamp_ns % NS_PER_SEC) as u32,
        }
    }

    pub fn timestamp_ns(&self) -> u64 {
        self.sec as u64 * NS_PER_SEC + self.nsec_remainder as u64
    }

    /// Encode with all four fields in network byte order.
    pub fn encode(&self) -> [u8; TRAFFIC_DATA_WIRE_LEN] {
        let mut buf = [0u8; TRAFFIC_DATA_WIRE_LEN];
        buf[0..4].copy_from_slice(&self.seq_no.to_be_bytes());
        buf[4..8].copy_from_slice(&self.nonce.to_be_bytes());
        buf[8..12].copy_from_slice(&self.sec.to_be_bytes());
        buf[12..16].copy_from_slice(&self.nsec_remainder.to_be_bytes());
        buf
    }

    /// Decode and validate one record. `nsec_remainder` must be a genuine
    /// sub-second remainder.
    pub fn decode(buf: &[u8; TRAFFIC_DATA_WIRE_LEN]) -> Result<TrafficData> {
        let field = |i: usize| u32::from_be_bytes(buf[i * 4..i * 4 + 4].try_into().unwrap());
        let nsec_remainder = field(3);
        if nsec_remainder as u64 >= NS_PER_SEC {
            return Err(Error::Protocol(format!(
                "corrupt telemetry record: nsec remainder {nsec_remainder}"
            )));
        }
        Ok(TrafficData {
            seq_no: field(0),
            nonce: field(1),
            sec: field(2),
            nsec_remainder,
        })
    }
}

/// Stamp `(seq_no, nonce)` into a chunk's prefix. The chunk must already be
/// at least [`CHUNK_PREFIX_LEN`] bytes.
pub fn stamp_chunk(chunk: &mut [u8], seq_no: u32, nonce: u32) {
    chunk[0..4].copy_from_slice(&seq_no.to_be_bytes());
    chunk[4..8].copy_from_slice(&nonce.to_be_bytes());
}

/// Read `(seq_no, nonce)` back out of a received chunk.
pub fn parse_chunk_prefix(chunk: &[u8]) -> (u32, u32) {
    let seq_no = u32::from_be_bytes(chunk[0..4].try_into().unwrap());
    let nonce = u32::from_be_bytes(chunk[4..8].try_into().unwrap());
    (seq_no, nonce)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip() {
        let record = TrafficData::new(42, 0xdeadbeef, 7 * NS_PER_SEC + 123_456_789);
        let decoded = TrafficData::decode(&record.encode()).unwrap();
        assert_eq!(decoded, record);
        assert_eq!(decoded.timestamp_ns(), 7 * NS_PER_SEC + 123_456_789);
    }

    #[test]
    fn test_network_byte_order() {
        let record = TrafficData::new(1, 2, 3);
        let buf = record.encode();
        // Big-endian u32s: high bytes first.
        assert_eq!(&buf[0..4], &[0, 0, 0, 1]);
        assert_eq!(&buf[4..8], &[0, 0, 0, 2]);
        assert_eq!(&buf[8..12], &[0, 0, 0, 0]);
        assert_eq!(&buf[12..16], &[0, 0, 0, 3]);
    }

    #[test]
    fn test_corrupt_remainder_rejected() {
        let mut buf = TrafficData::new(0, 0, 0).encode();
        buf[12..16].copy_from_slice(&(NS_PER_SEC as u32).to_be_bytes());
        assert!(TrafficData::decode(&buf).is_err());
    }

    #[test]
    fn test_chunk_prefix() {
        let mut chunk = vec![0u8; 64];
        stamp_chunk(&mut chunk, 0x01020304, 0xa1b2c3d4);
        assert_eq!(&chunk[0..4], &[1, 2, 3, 4]);
        assert_eq!(&chunk[4..8], &[0xa1, 0xb2, 0xc3, 0xd4]);
        assert_eq!(parse_chunk_prefix(&chunk), (0x01020304, 0xa1b2c3d4));
    }
}
