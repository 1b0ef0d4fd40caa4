//! Kernel TCP introspection for loss accounting and warm-up control.
//!
//! Backed by `getsockopt(IPPROTO_TCP, TCP_INFO)` on Linux. Each named
//! statistic is a [`Var`] owning a before/after snapshot pair with explicit
//! `start`/`stop` transitions: `delta()` is the change between the two
//! snapshots (counters), `get()` the most recent stopped value (gauges), and
//! `stop()` may be called repeatedly to refresh the after-snapshot.
//!
//! Not every statistic the protocol names has a TCP_INFO equivalent; those
//! report `None` and callers degrade. Off Linux the constructor fails and
//! sessions fall back to telemetry-based loss accounting.

use std::net::TcpStream;
use std::os::unix::io::{AsRawFd, RawFd};

/// The statistics the coordinator samples.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TcpStat {
    /// Cumulative retransmitted packets (counter; delta = observed loss).
    PktsRetrans,
    /// Bytes sitting in the retransmit queue.
    CurRetxQueue,
    /// Bytes written by the application but not yet handed to the network.
    CurAppWQueue,
    /// Smoothed round-trip estimate, milliseconds.
    SampleRtt,
    /// Congestion window, bytes.
    CurCwnd,
    /// Oldest unacknowledged sequence number.
    SndUna,
    /// Next sequence number to send.
    SndNxt,
}

/// One `tcp_info` read, reduced to the fields the stats draw from.
#[derive(Debug, Clone, Copy, Default)]
struct Snapshot {
    total_retrans: u64,
    snd_cwnd: u64,
    snd_mss: u64,
    rtt_us: u64,
    unacked: u64,
    lost: u64,
}

#[cfg(target_os = "linux")]
fn snap(fd: RawFd) -> std::io::Result<Snapshot> {
    let mut info: libc::tcp_info = unsafe { std::mem::zeroed() };
    let mut len = std::mem::size_of::<libc::tcp_info>() as libc::socklen_t;
    let rc = unsafe {
        libc::getsockopt(
            fd,
            libc::IPPROTO_TCP,
            libc::TCP_INFO,
            &mut info as *mut _ as *mut libc::c_void,
            &mut len,
        )
    };
    if rc == -1 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(Snapshot {
        total_retrans: info.tcpi_total_retrans as u64,
        snd_cwnd: info.tcpi_snd_cwnd as u64,
        snd_mss: info.tcpi_snd_mss as u64,
        rtt_us: info.tcpi_rtt as u64,
        unacked: info.tcpi_unacked as u64,
        lost: info.tcpi_lost as u64,
    })
}

#[cfg(not(target_os = "linux"))]
fn snap(_fd: RawFd) -> std::io::Result<Snapshot> {
    Err(std::io::Error::from(std::io::ErrorKind::Unsupported))
}

impl TcpStat {
    /// Extract this statistic from a snapshot. `None` means TCP_INFO does
    /// not carry it.
    fn read(self, s: &Snapshot) -> Option<u64> {
        match self {
            TcpStat::PktsRetrans => Some(s.total_retrans),
            TcpStat::CurRetxQueue => Some(s.lost * s.snd_mss),
            TcpStat::CurAppWQueue => None,
            TcpStat::SampleRtt => Some(s.rtt_us / 1000),
            TcpStat::CurCwnd => Some(s.snd_cwnd * s.snd_mss),
            TcpStat::SndUna | TcpStat::SndNxt => None,
        }
    }
}

/// One named statistic with its two snapshots.
#[derive(Debug)]
pub struct Var {
    stat: TcpStat,
    fd: RawFd,
    before: Option<Snapshot>,
    after: Option<Snapshot>,
}

impl Var {
    fn new(stat: TcpStat, fd: RawFd) -> Var {
        Var {
            stat,
            fd,
            before: None,
            after: None,
        }
    }

    /// Take the before-snapshot. Legal once, from the fresh state.
    pub fn start(&mut self) -> std::io::Result<()> {
        debug_assert!(self.before.is_none(), "Var started twice");
        self.before = Some(snap(self.fd)?);
        Ok(())
    }

    /// Take (or refresh) the after-snapshot.
    pub fn stop(&mut self) -> std::io::Result<()> {
        self.after = Some(snap(self.fd)?);
        Ok(())
    }

    /// Change between start and the most recent stop. `None` until both
    /// transitions happened, or if the statistic is unavailable.
    pub fn delta(&self) -> Option<u64> {
        let before = self.stat.read(self.before.as_ref()?)?;
        let after = self.stat.read(self.after.as_ref()?)?;
        Some(after.saturating_sub(before))
    }

    /// Value at the most recent stop. `None` until stopped, or if the
    /// statistic is unavailable.
    pub fn get(&self) -> Option<u64> {
        self.stat.read(self.after.as_ref()?)
    }
}

/// Sampler bound to one live TCP socket.
///
/// The caller owns the socket; the connection must not outlive it.
#[derive(Debug)]
pub struct Connection {
    fd: RawFd,
    pkts_retrans: Var,
    cur_retx_queue: Var,
    cur_app_wqueue: Var,
    sample_rtt: Var,
    cur_cwnd: Var,
}

impl Connection {
    /// Bind to a socket, probing once so an unsupported kernel fails here
    /// rather than mid-test.
    pub fn from_socket(stream: &TcpStream) -> std::io::Result<Connection> {
        let fd = stream.as_raw_fd();
        snap(fd)?;
        Ok(Connection {
            fd,
            pkts_retrans: Var::new(TcpStat::PktsRetrans, fd),
            cur_retx_queue: Var::new(TcpStat::CurRetxQueue, fd),
            cur_app_wqueue: Var::new(TcpStat::CurAppWQueue, fd),
            sample_rtt: Var::new(TcpStat::SampleRtt, fd),
            cur_cwnd: Var::new(TcpStat::CurCwnd, fd),
        })
    }

    /// Begin loss accounting: snapshot the retransmission counter.
    pub fn start(&mut self) -> std::io::Result<()> {
        self.pkts_retrans.start()
    }

    /// Refresh every after-snapshot. Called at each sampling boundary and
    /// once more at the end of the test.
    pub fn stop(&mut self) -> std::io::Result<()> {
        self.pkts_retrans.stop()?;
        self.cur_retx_queue.stop()?;
        self.cur_app_wqueue.stop()?;
        self.sample_rtt.stop()?;
        self.cur_cwnd.stop()?;
        Ok(())
    }

    /// Packets retransmitted since [`start`](Connection::start).
    pub fn packet_retrans_count(&self) -> Option<u64> {
        self.pkts_retrans.delta()
    }

    pub fn retransmit_queue_bytes(&self) -> Option<u64> {
        self.cur_retx_queue.get()
    }

    pub fn app_write_queue_bytes(&self) -> Option<u64> {
        self.cur_app_wqueue.get()
    }

    pub fn sample_rtt_ms(&self) -> Option<u64> {
        self.sample_rtt.get()
    }

    /// Congestion window in bytes, refreshed live (for the warm-up loop).
    pub fn refresh_cwnd_bytes(&mut self) -> Option<u64> {
        self.cur_cwnd.stop().ok()?;
        self.cur_cwnd.get()
    }

    /// Unacknowledged bytes in flight, read live. Serves as the
    /// `SndNxt - SndUna` estimate for the post-warm-up drain.
    pub fn inflight_bytes(&self) -> Option<u64> {
        let s = snap(self.fd).ok()?;
        Some(s.unacked * s.snd_mss)
    }

    /// The MSS the kernel negotiated for this connection.
    pub fn kernel_mss(&self) -> Option<u32> {
        let s = snap(self.fd).ok()?;
        Some(s.snd_mss as u32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(target_os = "linux")]
    fn loopback_pair() -> (TcpStream, TcpStream) {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let a = TcpStream::connect(addr).unwrap();
        let (b, _) = listener.accept().unwrap();
        (a, b)
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_var_state_machine() {
        let (a, _b) = loopback_pair();
        let mut var = Var::new(TcpStat::PktsRetrans, a.as_raw_fd());

        // Fresh: nothing to report.
        assert_eq!(var.delta(), None);
        assert_eq!(var.get(), None);

        var.start().unwrap();
        assert_eq!(var.delta(), None);

        var.stop().unwrap();
        assert_eq!(var.delta(), Some(0));
        assert!(var.get().is_some());

        // Stopped is re-enterable.
        var.stop().unwrap();
        assert_eq!(var.delta(), Some(0));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_unavailable_stat_is_none() {
        let (a, _b) = loopback_pair();
        let mut var = Var::new(TcpStat::CurAppWQueue, a.as_raw_fd());
        var.start().unwrap();
        var.stop().unwrap();
        assert_eq!(var.get(), None);
        assert_eq!(var.delta(), None);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_connection_reports_sane_values() {
        let (a, _b) = loopback_pair();
        let mut conn = Connection::from_socket(&a).unwrap();
        conn.start().unwrap();
        conn.stop().unwrap();

        assert_eq!(conn.packet_retrans_count(), Some(0));
        assert!(conn.kernel_mss().unwrap() > 0);
        // Idle connection: congestion window exists, nothing in flight.
        assert!(conn.refresh_cwnd_bytes().unwrap() > 0);
        assert_eq!(conn.inflight_bytes(), Some(0));
        assert_eq!(conn.app_write_queue_bytes(), None);
    }

    #[cfg(not(target_os = "linux"))]
    #[test]
    fn test_sampler_unsupported_off_linux() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let a = TcpStream::connect(addr).unwrap();
        let (_b, _) = listener.accept().unwrap();
        assert!(Connection::from_socket(&a).is_err());
    }
}
