//! Per-session test parameters and their fixed wire record.
//!
//! The config is the first message on the control channel and both peers
//! must agree on it bit for bit: five little-endian u32 fields, 20 bytes.

use crate::error::{Error, Result};

/// Transport used for the data channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SocketType {
    Tcp = 0,
    Udp = 1,
}

impl SocketType {
    fn from_wire(v: u32) -> Result<SocketType> {
        match v {
            0 => Ok(SocketType::Tcp),
            1 => Ok(SocketType::Udp),
            other => Err(Error::ConfigInvalid(format!("unknown socket type {other}"))),
        }
    }
}

/// Immutable per-session parameters, fixed at construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct TestConfig {
    pub socket_type: SocketType,
    /// Target rate in kb/s. Must be > 0.
    pub cbr_kb_s: u32,
    /// Target round-trip in milliseconds.
    pub rtt_ms: u32,
    /// Target MSS in bytes. Must be > 0.
    pub mss_bytes: u32,
    /// Advisory packets-per-burst hint; pacing derives its own burst size.
    pub burst_size: u32,
}

/// Serialized length of the config record.
pub const CONFIG_WIRE_LEN: usize = 20;

impl TestConfig {
    pub fn new(
        socket_type: SocketType,
        cbr_kb_s: u32,
        rtt_ms: u32,
        mss_bytes: u32,
        burst_size: u32,
    ) -> TestConfig {
        TestConfig {
            socket_type,
            cbr_kb_s,
            rtt_ms,
            mss_bytes,
            burst_size,
        }
    }

    /// Rejects parameter combinations no session can run with.
    pub fn validate(&self) -> Result<()> {
        if self.cbr_kb_s == 0 {
            return Err(Error::ConfigInvalid("cbr_kb_s must be > 0".into()));
        }
        if self.mss_bytes == 0 {
            return Err(Error::ConfigInvalid("mss_bytes must be > 0".into()));
        }
        Ok(())
    }

    /// Encode as the 20-byte little-endian record.
    pub fn encode(&self) -> [u8; CONFIG_WIRE_LEN] {
        let mut buf = [0u8; CONFIG_WIRE_LEN];
        buf[0..4].copy_from_slice(&(self.socket_type as u32).to_le_bytes());
        buf[4..8].copy_from_slice(&self.cbr_kb_s.to_le_bytes());
        buf[8..12].copy_from_slice(&self.rtt_ms.to_le_bytes());
        buf[12..16].copy_from_slice(&self.mss_bytes.to_le_bytes());
        buf[16..20].copy_from_slice(&self.burst_size.to_le_bytes());
        buf
    }

    /// Decode the fixed record. The caller is responsible for having read
    /// exactly [`CONFIG_WIRE_LEN`] bytes.
    pub fn decode(buf: &[u8; CONFIG_WIRE_LEN]) -> Result<TestConfig> {
        let field = |i: usize| u32::from_le_bytes(buf[i * 4..i * 4 + 4].try_into().unwrap());
        Ok(TestConfig {
            socket_type: SocketType::from_wire(field(0))?,
            cbr_kb_s: field(1),
            rtt_ms: field(2),
            mss_bytes: field(3),
            burst_size: field(4),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_golden_encoding() {
        let config = TestConfig::new(SocketType::Udp, 0x0102, 0x0a, 1460, 3);
        let buf = config.encode();
        assert_eq!(
            buf,
            [
                1, 0, 0, 0, // udp
                0x02, 0x01, 0, 0, // 258 kb/s, little-endian
                0x0a, 0, 0, 0, // 10 ms
                0xb4, 0x05, 0, 0, // 1460 B
                3, 0, 0, 0, // burst hint
            ]
        );
    }

    #[test]
    fn test_round_trip() {
        let config = TestConfig::new(SocketType::Tcp, 10_000, 100, 1460, 0);
        let decoded = TestConfig::decode(&config.encode()).unwrap();
        assert_eq!(decoded, config);
    }

    #[test]
    fn test_unknown_socket_type_rejected() {
        let mut buf = TestConfig::new(SocketType::Tcp, 1, 1, 1, 0).encode();
        buf[0] = 7;
        assert!(matches!(
            TestConfig::decode(&buf),
            Err(Error::ConfigInvalid(_))
        ));
    }

    #[test]
    fn test_validate() {
        assert!(TestConfig::new(SocketType::Tcp, 600, 10, 1460, 0)
            .validate()
            .is_ok());
        assert!(TestConfig::new(SocketType::Tcp, 0, 10, 1460, 0)
            .validate()
            .is_err());
        assert!(TestConfig::new(SocketType::Udp, 600, 10, 0, 0)
            .validate()
            .is_err());
    }
}
