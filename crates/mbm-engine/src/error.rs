//! Engine error taxonomy.
//!
//! Sessions never panic across the wire: every failure either retries locally
//! (ready handshake, data-listener creation) or surfaces as an ERROR verdict
//! to the peer plus a diagnostic on the server side.

use std::io;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Rate 0, mss 0, invalid port, or derived chunks_per_sec == 0.
    #[error("invalid config: {0}")]
    ConfigInvalid(String),

    /// A fixed-size control message returned fewer bytes than expected.
    #[error("short read: wanted {wanted} bytes, got {got}")]
    ShortRead { wanted: usize, got: usize },

    /// Zero-length read on the data channel mid-test.
    #[error("peer closed the data channel")]
    PeerDied,

    /// The peer sent something other than the message the protocol expects
    /// at this point (bad sentinel, absurd telemetry count).
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// Partial write on the data channel.
    #[error("send failed after {bytes_sent} bytes")]
    SendFailed { bytes_sent: u64 },

    /// Data-port pool exhausted; the session is rejected.
    #[error("no free data port")]
    NoFreePort,

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl Error {
    /// True for receive timeouts, which the ready handshake may retry.
    pub fn is_timeout(&self) -> bool {
        match self {
            Error::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
            ),
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_classification() {
        let timeout: Error = io::Error::from(io::ErrorKind::WouldBlock).into();
        assert!(timeout.is_timeout());
        let timeout: Error = io::Error::from(io::ErrorKind::TimedOut).into();
        assert!(timeout.is_timeout());

        let hard: Error = io::Error::from(io::ErrorKind::ConnectionReset).into();
        assert!(!hard.is_timeout());
        assert!(!Error::PeerDied.is_timeout());
    }
}
