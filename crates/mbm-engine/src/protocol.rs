//! Control-channel framing.
//!
//! The control channel carries, in order: the config record, the data-port
//! assignment, the READY handshake, the chunk size, the END sentinel, the
//! telemetry upload, and the verdict. All multi-byte integers are network
//! byte order; the config record alone is the fixed little-endian layout
//! from [`crate::config`]. Every message is fixed-size, so a short read
//! anywhere is a protocol abort rather than something to retry.

use std::net::TcpStream;

use crate::config::{TestConfig, CONFIG_WIRE_LEN};
use crate::constants::{END, MAX_UPLOAD_CHUNK_BYTES, READY};
use crate::error::{Error, Result};
use crate::net::{read_full, write_full};
use crate::traffic_data::{TrafficData, TRAFFIC_DATA_WIRE_LEN};
use crate::verdict::Verdict;

pub fn send_config(stream: &mut TcpStream, config: &TestConfig) -> Result<()> {
    write_full(stream, &config.encode())
}

pub fn recv_config(stream: &mut TcpStream) -> Result<TestConfig> {
    let mut buf = [0u8; CONFIG_WIRE_LEN];
    read_full(stream, &mut buf)?;
    TestConfig::decode(&buf)
}

/// Port 0 is the rejection sentinel: no data port exists and the verdict
/// follows immediately.
pub fn send_port(stream: &mut TcpStream, port: u16) -> Result<()> {
    write_full(stream, &port.to_be_bytes())
}

pub fn recv_port(stream: &mut TcpStream) -> Result<u16> {
    let mut buf = [0u8; 2];
    read_full(stream, &mut buf)?;
    Ok(u16::from_be_bytes(buf))
}

pub fn send_ready(stream: &mut TcpStream) -> Result<()> {
    write_full(stream, READY)
}

/// Read the 5-byte READY sentinel; anything else is a protocol violation.
pub fn expect_ready(stream: &mut TcpStream) -> Result<()> {
    let mut buf = [0u8; 5];
    read_full(stream, &mut buf)?;
    if buf != READY {
        return Err(Error::Protocol(format!(
            "expected READY, got {:?}",
            &buf[..]
        )));
    }
    Ok(())
}

pub fn send_bytes_per_chunk(stream: &mut TcpStream, bytes_per_chunk: u32) -> Result<()> {
    write_full(stream, &bytes_per_chunk.to_be_bytes())
}

pub fn recv_bytes_per_chunk(stream: &mut TcpStream) -> Result<u32> {
    let mut buf = [0u8; 4];
    read_full(stream, &mut buf)?;
    Ok(u32::from_be_bytes(buf))
}

pub fn send_end(stream: &mut TcpStream) -> Result<()> {
    write_full(stream, END)
}

/// Read the 3-byte END sentinel once the control channel turns readable.
pub fn expect_end(stream: &mut TcpStream) -> Result<()> {
    let mut buf = [0u8; 3];
    read_full(stream, &mut buf)?;
    if buf != END {
        return Err(Error::Protocol(format!("expected END, got {:?}", &buf[..])));
    }
    Ok(())
}

/// Upload the collected telemetry: record count, then the records in writes
/// capped at [`MAX_UPLOAD_CHUNK_BYTES`].
pub fn send_telemetry(stream: &mut TcpStream, records: &[TrafficData]) -> Result<()> {
    write_full(stream, &(records.len() as u32).to_be_bytes())?;

    let mut wire = Vec::with_capacity(MAX_UPLOAD_CHUNK_BYTES.min(records.len() * TRAFFIC_DATA_WIRE_LEN));
    for record in records {
        wire.extend_from_slice(&record.encode());
        if wire.len() + TRAFFIC_DATA_WIRE_LEN > MAX_UPLOAD_CHUNK_BYTES {
            write_full(stream, &wire)?;
            wire.clear();
        }
    }
    if !wire.is_empty() {
        write_full(stream, &wire)?;
    }
    Ok(())
}

/// Receive the telemetry upload. `max_records` bounds the allocation: the
/// client cannot legitimately report more arrivals than we sent packets
/// (duplicates excepted on UDP, covered by the slack the caller passes).
pub fn recv_telemetry(stream: &mut TcpStream, max_records: u64) -> Result<Vec<TrafficData>> {
    let mut buf = [0u8; 4];
    read_full(stream, &mut buf)?;
    let count = u32::from_be_bytes(buf) as u64;
    if count > max_records {
        return Err(Error::Protocol(format!(
            "telemetry count {count} exceeds limit {max_records}"
        )));
    }

    let mut records = Vec::with_capacity(count as usize);
    let mut record_buf = [0u8; TRAFFIC_DATA_WIRE_LEN];
    for _ in 0..count {
        read_full(stream, &mut record_buf)?;
        records.push(TrafficData::decode(&record_buf)?);
    }
    Ok(records)
}

pub fn send_verdict(stream: &mut TcpStream, verdict: Verdict) -> Result<()> {
    write_full(stream, &verdict.to_wire().to_be_bytes())
}

pub fn recv_verdict(stream: &mut TcpStream) -> Result<Verdict> {
    let mut buf = [0u8; 4];
    read_full(stream, &mut buf)?;
    let wire = u32::from_be_bytes(buf);
    Verdict::from_wire(wire).ok_or_else(|| Error::Protocol(format!("unknown verdict {wire}")))
}
