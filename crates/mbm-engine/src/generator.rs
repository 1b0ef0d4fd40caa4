//! Paced traffic source.
//!
//! Owns the data channel and the send buffer; stamps each chunk with the
//! next sequence number and a fresh nonce, emits it, and records the nonce
//! and send timestamp so the per-packet history can be correlated with the
//! client's telemetry afterwards.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::clock;
use crate::constants::SEED;
use crate::error::Result;
use crate::net::DataChannel;
use crate::traffic_data::stamp_chunk;

pub struct TrafficGenerator {
    channel: DataChannel,
    bytes_per_chunk: u32,
    buffer: Vec<u8>,
    nonces: Vec<u32>,
    timestamps: Vec<u64>,
    packets_sent: u64,
    total_bytes_sent: u64,
    rng: StdRng,
}

impl TrafficGenerator {
    /// `max_packets` bounds the per-packet history; both record vectors are
    /// reserved up front so the paced loop never reallocates.
    pub fn new(channel: DataChannel, bytes_per_chunk: u32, max_packets: u64) -> TrafficGenerator {
        TrafficGenerator {
            channel,
            bytes_per_chunk,
            buffer: vec![b'x'; bytes_per_chunk as usize],
            nonces: Vec::with_capacity(max_packets as usize),
            timestamps: Vec::with_capacity(max_packets as usize),
            packets_sent: 0,
            total_bytes_sent: 0,
            rng: StdRng::seed_from_u64(SEED),
        }
    }

    /// Send `n` chunks back to back. On success `packets_sent` grows by
    /// exactly `n`; a failed emit stops the burst and reports the bytes that
    /// did get out.
    pub fn send(&mut self, n: u64) -> Result<u64> {
        let mut bytes_sent = 0u64;
        for _ in 0..n {
            let nonce: u32 = self.rng.gen();
            stamp_chunk(&mut self.buffer, self.packets_sent as u32, nonce);

            if let Err(e) = self.channel.send_chunk(&self.buffer) {
                tracing::warn!(seq_no = self.packets_sent, "data-channel send failed");
                self.total_bytes_sent += bytes_sent;
                return Err(e);
            }

            self.nonces.push(nonce);
            self.timestamps.push(clock::now_ns());
            self.packets_sent += 1;
            bytes_sent += self.bytes_per_chunk as u64;
        }
        self.total_bytes_sent += bytes_sent;
        Ok(bytes_sent)
    }

    pub fn packets_sent(&self) -> u64 {
        self.packets_sent
    }

    pub fn total_bytes_sent(&self) -> u64 {
        self.total_bytes_sent
    }

    /// Per-packet history in send order: `(seq_no, nonce, send timestamp)`.
    pub fn records(&self) -> impl Iterator<Item = (u32, u32, u64)> + '_ {
        self.nonces
            .iter()
            .zip(self.timestamps.iter())
            .enumerate()
            .map(|(seq, (&nonce, &ts))| (seq as u32, nonce, ts))
    }
}
