//! Client driver: one measurement run, or a rate sweep.
//!
//! A run opens the control connection, negotiates a data channel, receives
//! the paced traffic while timestamping every arrival, uploads the per-packet
//! telemetry once the server signals END, and reports the verdict. The sweep
//! walks a rate range over UDP and confirms the last sustainable rate with a
//! TCP run.

use std::net::{SocketAddr, TcpStream, ToSocketAddrs, UdpSocket};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::clock;
use crate::config::{SocketType, TestConfig};
use crate::constants::{DEFAULT_SOCKET_TIMEOUT_MS, NUM_READY_RETRANS, READY};
use crate::error::{Error, Result};
use crate::logfile;
use crate::net::{self, DataChannel};
use crate::protocol;
use crate::traffic_data::{parse_chunk_prefix, TrafficData, CHUNK_PREFIX_LEN};
use crate::verdict::Verdict;

/// Where and how to run.
#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub server: String,
    pub port: u16,
    /// Dump received packets to `<timestamp>_clientdata.txt` in this directory.
    pub log_dir: Option<PathBuf>,
}

/// Outcome of a single run, also the JSON report shape.
#[derive(Debug, Clone, serde::Serialize)]
pub struct RunReport {
    pub socket_type: SocketType,
    pub cbr_kb_s: u32,
    pub rtt_ms: u32,
    pub mss_bytes: u32,
    pub verdict: Verdict,
    pub bytes_per_chunk: u32,
    pub packets_received: u64,
    pub bytes_received: u64,
    pub elapsed_secs: f64,
    pub observed_rate_kb_s: f64,
}

/// Report for a sweep: every swept rate plus the TCP confirmation run.
#[derive(Debug, Clone, serde::Serialize)]
pub struct SweepReport {
    pub runs: Vec<RunReport>,
    pub selected_rate_kb_s: u32,
    pub confirmation: RunReport,
}

fn resolve(server: &str, port: u16) -> Result<SocketAddr> {
    (server, port)
        .to_socket_addrs()?
        .next()
        .ok_or_else(|| Error::ConfigInvalid(format!("cannot resolve {server}")))
}

/// Run one measurement against the server and return the report.
pub fn run_once(options: &ClientOptions, config: &TestConfig) -> Result<RunReport> {
    clock::ignore_sigpipe();
    let timeout = Duration::from_millis(DEFAULT_SOCKET_TIMEOUT_MS);

    let control_addr = resolve(&options.server, options.port)?;
    let mut control = TcpStream::connect(control_addr)?;
    net::apply_stream_timeouts(&control, timeout)?;

    protocol::send_config(&mut control, config)?;

    let data_port = protocol::recv_port(&mut control)?;
    if data_port == 0 {
        // Session rejected before a data port existed; the verdict follows.
        let verdict = protocol::recv_verdict(&mut control)?;
        tracing::warn!(%verdict, "server rejected the session");
        return Ok(empty_report(config, verdict));
    }
    tracing::debug!(port = data_port, "data port assigned");

    let data_addr = resolve(&options.server, data_port)?;
    let mut data = match config.socket_type {
        SocketType::Tcp => {
            let stream = TcpStream::connect(data_addr)?;
            net::apply_stream_timeouts(&stream, timeout)?;
            DataChannel::Tcp(stream)
        }
        SocketType::Udp => {
            let socket = UdpSocket::bind("0.0.0.0:0")?;
            socket.connect(data_addr)?;
            net::apply_udp_timeouts(&socket, timeout)?;
            DataChannel::Udp(socket)
        }
    };

    ready_handshake(&mut control, &mut data, config)?;

    let bytes_per_chunk = protocol::recv_bytes_per_chunk(&mut control)?;
    if bytes_per_chunk == 0 {
        // Poisoned chunk size: the server could not derive pacing.
        let verdict = protocol::recv_verdict(&mut control)?;
        tracing::warn!(%verdict, "server aborted before the test phase");
        return Ok(empty_report(config, verdict));
    }
    if (bytes_per_chunk as usize) < CHUNK_PREFIX_LEN || bytes_per_chunk > 10 * 1024 * 1024 {
        return Err(Error::Protocol(format!(
            "implausible chunk size {bytes_per_chunk}"
        )));
    }

    let (records, bytes_received, elapsed_ns) =
        receive_loop(&mut control, &mut data, bytes_per_chunk)?;
    tracing::info!(
        packets = records.len(),
        bytes = bytes_received,
        elapsed_ms = elapsed_ns / 1_000_000,
        "data phase complete"
    );

    protocol::send_telemetry(&mut control, &records)?;
    let verdict = protocol::recv_verdict(&mut control)?;

    if let Some(dir) = &options.log_dir {
        write_client_log(dir, &records);
    }

    let elapsed_secs = elapsed_ns as f64 / 1e9;
    let observed_rate_kb_s = if elapsed_ns > 0 {
        bytes_received as f64 * 8.0 / 1000.0 / elapsed_secs
    } else {
        0.0
    };
    Ok(RunReport {
        socket_type: config.socket_type,
        cbr_kb_s: config.cbr_kb_s,
        rtt_ms: config.rtt_ms,
        mss_bytes: config.mss_bytes,
        verdict,
        bytes_per_chunk,
        packets_received: records.len() as u64,
        bytes_received,
        elapsed_secs,
        observed_rate_kb_s,
    })
}

/// Sweep rates over UDP, then confirm the selected rate over TCP.
///
/// The first FAIL (or the end of the range) selects `rate - ratestep`;
/// INCONCLUSIVE rates are skipped with a warning.
pub fn run_sweep(
    options: &ClientOptions,
    base: &TestConfig,
    minrate: u32,
    maxrate: u32,
    ratestep: u32,
) -> Result<SweepReport> {
    if ratestep == 0 || minrate == 0 || maxrate < minrate {
        return Err(Error::ConfigInvalid(
            "sweep needs 0 < minrate <= maxrate and ratestep > 0".into(),
        ));
    }

    let mut runs = Vec::new();
    let mut selected = minrate;
    let mut rate = minrate;
    while rate <= maxrate {
        let config = TestConfig::new(
            SocketType::Udp,
            rate,
            base.rtt_ms,
            base.mss_bytes,
            base.burst_size,
        );
        tracing::info!(rate_kb_s = rate, "sweep: probing");
        let report = run_once(options, &config)?;
        let verdict = report.verdict;
        runs.push(report);

        match verdict {
            Verdict::Pass => selected = rate,
            Verdict::Fail => {
                tracing::info!(rate_kb_s = rate, "sweep: first failing rate");
                break;
            }
            Verdict::Inconclusive => {
                tracing::warn!(rate_kb_s = rate, "sweep: inconclusive, skipping rate");
            }
            Verdict::Error => {
                return Err(Error::Protocol(format!(
                    "sweep aborted: server error at {rate} kb/s"
                )));
            }
        }
        rate = rate.saturating_add(ratestep);
    }

    // Confirm the selected rate on TCP, where kernel loss accounting backs
    // the verdict.
    let selected = selected.max(minrate);
    let config = TestConfig::new(
        SocketType::Tcp,
        selected,
        base.rtt_ms,
        base.mss_bytes,
        base.burst_size,
    );
    tracing::info!(rate_kb_s = selected, "sweep: TCP confirmation run");
    let confirmation = run_once(options, &config)?;

    Ok(SweepReport {
        runs,
        selected_rate_kb_s: selected,
        confirmation,
    })
}

fn empty_report(config: &TestConfig, verdict: Verdict) -> RunReport {
    RunReport {
        socket_type: config.socket_type,
        cbr_kb_s: config.cbr_kb_s,
        rtt_ms: config.rtt_ms,
        mss_bytes: config.mss_bytes,
        verdict,
        bytes_per_chunk: 0,
        packets_received: 0,
        bytes_received: 0,
        elapsed_secs: 0.0,
        observed_rate_kb_s: 0.0,
    }
}

/// READY on control, READY on the data channel, then wait for the server's
/// READY on control. UDP retransmits the data-channel READY because the
/// datagram that performs the server-side "accept" can itself be lost.
fn ready_handshake(
    control: &mut TcpStream,
    data: &mut DataChannel,
    config: &TestConfig,
) -> Result<()> {
    protocol::send_ready(control)?;

    match data {
        DataChannel::Tcp(_) => {
            data.send_chunk(READY)
                .map_err(|_| Error::Protocol("failed to send READY on data channel".into()))?;
            protocol::expect_ready(control)
        }
        DataChannel::Udp(socket) => {
            let attempt_timeout = Duration::from_millis((3 * config.rtt_ms as u64).max(1));
            socket.set_read_timeout(Some(attempt_timeout))?;
            control.set_read_timeout(Some(attempt_timeout))?;

            let mut result = Err(Error::Protocol("ready handshake never completed".into()));
            for attempt in 1..=NUM_READY_RETRANS {
                socket.send(READY)?;
                match protocol::expect_ready(control) {
                    Ok(()) => {
                        result = Ok(());
                        break;
                    }
                    Err(e) if e.is_timeout() => {
                        tracing::debug!(attempt, "READY ack timed out, retransmitting");
                    }
                    Err(e) => {
                        result = Err(e);
                        break;
                    }
                }
            }

            let timeout = Duration::from_millis(DEFAULT_SOCKET_TIMEOUT_MS);
            socket.set_read_timeout(Some(timeout))?;
            control.set_read_timeout(Some(timeout))?;
            result
        }
    }
}

/// Wait on both channels: record data chunks as they arrive, break on the
/// control channel's END. Returns the records, total bytes, and elapsed time.
fn receive_loop(
    control: &mut TcpStream,
    data: &mut DataChannel,
    bytes_per_chunk: u32,
) -> Result<(Vec<TrafficData>, u64, u64)> {
    let timeout = Duration::from_millis(DEFAULT_SOCKET_TIMEOUT_MS);
    let mut chunk = vec![0u8; bytes_per_chunk as usize];
    let mut records = Vec::new();
    let mut bytes_received: u64 = 0;
    let start = clock::now_ns();

    loop {
        let events = net::poll_two(control.as_raw_fd(), data.as_raw_fd(), timeout)?;

        if events.data {
            let n = data.recv_chunk(&mut chunk)?;
            if n >= CHUNK_PREFIX_LEN {
                let (seq_no, nonce) = parse_chunk_prefix(&chunk);
                records.push(TrafficData::new(seq_no, nonce, clock::now_ns()));
            }
            bytes_received += n as u64;
            continue;
        }

        if events.control {
            protocol::expect_end(control)?;
            break;
        }

        // Nothing readable inside the socket timeout: the test is stalled.
        return Err(std::io::Error::from(std::io::ErrorKind::TimedOut).into());
    }

    Ok((records, bytes_received, clock::now_ns() - start))
}

fn write_client_log(dir: &Path, records: &[TrafficData]) {
    let rows = records.iter().map(|r| (r.seq_no, r.nonce, r.timestamp_ns()));
    match logfile::write_rows(dir, "clientdata", rows) {
        Ok(path) => tracing::info!(path = %path.display(), "client data written"),
        Err(e) => tracing::warn!(error = %e, "failed to write client data"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::{tcp_listener, write_full};
    use crate::traffic_data::stamp_chunk;

    fn tcp_pair() -> (TcpStream, TcpStream) {
        let listener = tcp_listener("127.0.0.1:0".parse().unwrap()).unwrap();
        let addr = listener.local_addr().unwrap();
        let a = TcpStream::connect(addr).unwrap();
        let (b, _) = listener.accept().unwrap();
        (a, b)
    }

    #[test]
    fn test_receive_loop_records_until_end() {
        let (control_srv, mut control_cli) = tcp_pair();
        let (data_srv, data_cli) = tcp_pair();
        control_cli
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();

        const CHUNK: u32 = 32;
        let server = std::thread::spawn(move || {
            let mut control = control_srv;
            let mut data = data_srv;
            let mut chunk = [b'x'; CHUNK as usize];
            for seq in 0..5u32 {
                stamp_chunk(&mut chunk, seq, seq * 100);
                write_full(&mut data, &chunk).unwrap();
            }
            protocol::send_end(&mut control).unwrap();
        });

        let mut data = DataChannel::Tcp(data_cli);
        let (records, bytes, elapsed_ns) =
            receive_loop(&mut control_cli, &mut data, CHUNK).unwrap();
        server.join().unwrap();

        assert_eq!(bytes, 5 * CHUNK as u64);
        assert_eq!(records.len(), 5);
        for (i, record) in records.iter().enumerate() {
            assert_eq!(record.seq_no, i as u32);
            assert_eq!(record.nonce, i as u32 * 100);
        }
        assert!(records.windows(2).all(|w| w[0].timestamp_ns() <= w[1].timestamp_ns()));
        assert!(elapsed_ns > 0);
    }

    #[test]
    fn test_udp_ready_handshake_retransmits() {
        let (control_srv, mut control_cli) = tcp_pair();
        let server_data = crate::net::udp_bound("127.0.0.1:0".parse().unwrap()).unwrap();
        let server_addr = server_data.local_addr().unwrap();

        // Server stays silent past the client's first 3*RTT attempt window,
        // then completes the handshake.
        let server = std::thread::spawn(move || {
            let mut control = control_srv;
            std::thread::sleep(Duration::from_millis(200));
            crate::net::udp_accept(&server_data, READY).unwrap();
            protocol::send_ready(&mut control).unwrap();
        });

        let client_data = UdpSocket::bind("127.0.0.1:0").unwrap();
        client_data.connect(server_addr).unwrap();
        let mut data = DataChannel::Udp(client_data);
        let config = TestConfig::new(SocketType::Udp, 600, 20, 1460, 0);

        ready_handshake(&mut control_cli, &mut data, &config).unwrap();
        server.join().unwrap();
    }

    #[test]
    fn test_sweep_argument_validation() {
        let options = ClientOptions {
            server: "localhost".into(),
            port: 1,
            log_dir: None,
        };
        let base = TestConfig::new(SocketType::Udp, 600, 10, 1460, 0);
        assert!(run_sweep(&options, &base, 600, 1200, 0).is_err());
        assert!(run_sweep(&options, &base, 0, 1200, 100).is_err());
        assert!(run_sweep(&options, &base, 1200, 600, 100).is_err());
    }

    #[test]
    fn test_resolve_rejects_garbage() {
        assert!(resolve("definitely-not-a-real-host.invalid.", 1).is_err());
    }
}
