//! Server-side session coordinator.
//!
//! Drives one measurement end to end: config receive, data-port assignment,
//! ready handshake, congestion-window warm-up (TCP), the paced test loop
//! with periodic SPRT checks, the END exchange, telemetry collection, and
//! the verdict. Every exit path releases the data-port lease (RAII) and
//! surfaces failures to the client as an ERROR verdict where the protocol
//! still allows one.

use std::net::{IpAddr, Ipv4Addr, SocketAddr, TcpListener, TcpStream, UdpSocket};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::clock;
use crate::config::{SocketType, TestConfig};
use crate::constants::{
    CWND_BASE_SEC, CWND_INCR_SEC_PER_MB, CWND_MAX_SEC, DEFAULT_SOCKET_TIMEOUT_MS, MIN_SLEEP_NS,
    NS_PER_SEC, READY, TEST_BASE_SEC, TEST_INCR_SEC_PER_MB, TEST_MAX_SEC,
};
use crate::error::{Error, Result};
use crate::generator::TrafficGenerator;
use crate::logfile;
use crate::model;
use crate::net::{self, DataChannel};
use crate::port_pool::{PortLease, PortPool};
use crate::protocol;
use crate::sampler;
use crate::stat_test::StatTest;
use crate::traffic_data::CHUNK_PREFIX_LEN;
use crate::verdict::Verdict;

const NS_PER_MS: u64 = 1_000_000;

/// Server-side knobs a session inherits from the dispatcher.
#[derive(Debug, Clone, Default)]
pub struct SessionOptions {
    /// Write per-session serverdata/testdata dumps into this directory.
    pub log_dir: Option<PathBuf>,
}

/// Per-session pacing constants derived from the config and the kernel MSS.
#[derive(Debug, Clone, Copy)]
struct Pacing {
    bytes_per_chunk: u32,
    chunks_per_sec: u64,
    time_per_chunk_ns: u64,
    /// Chunks per wake, sized so each inter-burst sleep is >= 500 us.
    burst_size_pkt: u64,
    max_cwnd_pkt: u64,
    max_test_pkt: u64,
    target_pipe_size: u64,
    target_run_length: u64,
}

fn derive_pacing(config: &TestConfig, kernel_mss: Option<u32>) -> Result<Pacing> {
    let bytes_per_chunk = match (config.socket_type, kernel_mss) {
        (SocketType::Tcp, Some(mss)) => config.mss_bytes.min(mss),
        _ => config.mss_bytes,
    };
    if (bytes_per_chunk as usize) < CHUNK_PREFIX_LEN {
        return Err(Error::ConfigInvalid(format!(
            "chunk size {bytes_per_chunk} cannot hold the seq/nonce prefix"
        )));
    }

    let bytes_per_sec = config.cbr_kb_s as u64 * 1000 / 8;
    let chunks_per_sec = bytes_per_sec / bytes_per_chunk as u64;
    if chunks_per_sec == 0 {
        return Err(Error::ConfigInvalid(format!(
            "rate {} kb/s is below one {bytes_per_chunk}-byte chunk per second",
            config.cbr_kb_s
        )));
    }
    if chunks_per_sec > NS_PER_SEC {
        return Err(Error::ConfigInvalid(format!(
            "rate {} kb/s cannot be paced at nanosecond resolution",
            config.cbr_kb_s
        )));
    }
    let time_per_chunk_ns = NS_PER_SEC / chunks_per_sec;
    let burst_size_pkt = MIN_SLEEP_NS.div_ceil(time_per_chunk_ns).max(1);

    let rate_mb_s = config.cbr_kb_s as u64 / 1000;
    let cwnd_sec = (CWND_BASE_SEC + CWND_INCR_SEC_PER_MB * rate_mb_s).min(CWND_MAX_SEC);
    let test_sec = (TEST_BASE_SEC + TEST_INCR_SEC_PER_MB * rate_mb_s).min(TEST_MAX_SEC);

    Ok(Pacing {
        bytes_per_chunk,
        chunks_per_sec,
        time_per_chunk_ns,
        burst_size_pkt,
        max_cwnd_pkt: cwnd_sec * chunks_per_sec,
        max_test_pkt: test_sec * chunks_per_sec,
        target_pipe_size: model::target_pipe_size(config.cbr_kb_s, config.rtt_ms, config.mss_bytes)?,
        target_run_length: model::target_run_length(
            config.cbr_kb_s,
            config.rtt_ms,
            config.mss_bytes,
        )?,
    })
}

/// Worker entry point: run the session, log the outcome, never panic the
/// dispatcher. The port lease (if any) is released on return.
pub fn handle_session(
    mut control: TcpStream,
    peer: SocketAddr,
    pool: Arc<PortPool>,
    options: SessionOptions,
) {
    match run(&mut control, peer, pool, &options) {
        Ok(verdict) => tracing::info!(%peer, %verdict, "session finished"),
        Err(e) => {
            tracing::error!(%peer, error = %e, "session aborted");
            // Best effort: the client may still be listening for a verdict.
            protocol::send_verdict(&mut control, Verdict::Error).ok();
        }
    }
}

/// Reject a session before a data port exists: port 0, then the verdict.
fn reject(control: &mut TcpStream) -> Result<Verdict> {
    protocol::send_port(control, 0)?;
    protocol::send_verdict(control, Verdict::Error)?;
    Ok(Verdict::Error)
}

enum DataListener {
    Tcp(TcpListener),
    Udp(UdpSocket),
}

/// Acquire a port slot and bind the data listener, retrying up to three
/// times. Every failed lease stays held until the function returns, so each
/// attempt lands on a slot that has not already refused to bind.
fn create_data_listener(
    pool: &Arc<PortPool>,
    socket_type: SocketType,
) -> Result<(PortLease, DataListener)> {
    let bind_ip = IpAddr::V4(Ipv4Addr::UNSPECIFIED);
    let mut failed_leases = Vec::new();
    let mut last_err = Error::NoFreePort;
    for attempt in 1..=3 {
        let lease = pool.acquire()?;
        let addr = SocketAddr::new(bind_ip, lease.port());
        let bound = match socket_type {
            SocketType::Tcp => net::tcp_listener(addr).map(DataListener::Tcp),
            SocketType::Udp => net::udp_bound(addr).map(DataListener::Udp),
        };
        match bound {
            Ok(listener) => return Ok((lease, listener)),
            Err(e) => {
                tracing::warn!(port = lease.port(), attempt, error = %e, "data listener bind failed");
                last_err = e;
                failed_leases.push(lease);
            }
        }
    }
    drop(failed_leases);
    Err(last_err)
}

/// How the paced loop ended.
enum TestOutcome {
    /// The SPRT (or the slippage guard) already decided.
    Decided(Verdict),
    /// UDP: losses are only known once the telemetry arrives.
    Pending,
    /// The data channel failed mid-test; report ERROR if the control
    /// channel still works.
    Errored,
}

fn run(
    control: &mut TcpStream,
    peer: SocketAddr,
    pool: Arc<PortPool>,
    options: &SessionOptions,
) -> Result<Verdict> {
    let timeout = Duration::from_millis(DEFAULT_SOCKET_TIMEOUT_MS);
    net::apply_stream_timeouts(control, timeout)?;

    let config = protocol::recv_config(control)?;
    tracing::info!(
        %peer,
        socket_type = ?config.socket_type,
        rate_kb_s = config.cbr_kb_s,
        rtt_ms = config.rtt_ms,
        mss_bytes = config.mss_bytes,
        "session config"
    );

    if let Err(e) = config.validate() {
        tracing::warn!(%peer, error = %e, "rejecting config");
        return reject(control);
    }

    let (lease, listener) = match create_data_listener(&pool, config.socket_type) {
        Ok(bound) => bound,
        Err(e) => {
            tracing::warn!(%peer, error = %e, "no usable data port");
            return reject(control);
        }
    };
    protocol::send_port(control, lease.port())?;
    tracing::debug!(port = lease.port(), "data port assigned");

    // Accept the data connection and complete the ready handshake. On UDP
    // the client's READY datagram doubles as the accept.
    protocol::expect_ready(control)?;
    let mut data_stream = None;
    let data = match listener {
        DataListener::Tcp(tcp) => {
            let mut stream = net::accept_timeout(&tcp, timeout)?;
            net::apply_stream_timeouts(&stream, timeout)?;
            let mut ready = [0u8; 5];
            net::read_full(&mut stream, &mut ready)?;
            if ready != READY {
                return Err(Error::Protocol("bad READY on data channel".into()));
            }
            data_stream = Some(stream.try_clone()?);
            DataChannel::Tcp(stream)
        }
        DataListener::Udp(udp) => {
            net::apply_udp_timeouts(&udp, timeout)?;
            net::udp_accept(&udp, READY)?;
            DataChannel::Udp(udp)
        }
    };
    protocol::send_ready(control)?;

    // Kernel sampler: TCP only, and only where the kernel cooperates.
    let mut sampler = match &data_stream {
        Some(stream) => match sampler::Connection::from_socket(stream) {
            Ok(conn) => Some(conn),
            Err(e) => {
                tracing::warn!(error = %e, "kernel sampler unavailable, falling back to telemetry loss accounting");
                None
            }
        },
        None => None,
    };

    let pacing = match derive_pacing(&config, sampler.as_ref().and_then(|s| s.kernel_mss())) {
        Ok(pacing) => pacing,
        Err(e) => {
            // The port message is already out; poison the chunk size so the
            // client knows to read the verdict instead of test data.
            tracing::warn!(%peer, error = %e, "unusable pacing parameters");
            protocol::send_bytes_per_chunk(control, 0)?;
            protocol::send_verdict(control, Verdict::Error)?;
            return Ok(Verdict::Error);
        }
    };
    tracing::debug!(
        bytes_per_chunk = pacing.bytes_per_chunk,
        chunks_per_sec = pacing.chunks_per_sec,
        burst_size_pkt = pacing.burst_size_pkt,
        target_pipe_size = pacing.target_pipe_size,
        target_run_length = pacing.target_run_length,
        "pacing derived"
    );

    let mut generator = TrafficGenerator::new(
        data,
        pacing.bytes_per_chunk,
        pacing.max_cwnd_pkt + pacing.max_test_pkt,
    );
    protocol::send_bytes_per_chunk(control, pacing.bytes_per_chunk)?;

    let stat_test = StatTest::new(pacing.target_run_length);
    let outcome = run_test_phase(&config, &pacing, &stat_test, &mut generator, sampler.as_mut());

    // End-of-test exchange happens on every path that got this far; the
    // client is in its receive loop and needs the END to stop.
    clock::sleep_ns(config.rtt_ms as u64 * NS_PER_MS);
    protocol::send_end(control)?;

    if let Some(conn) = sampler.as_mut() {
        conn.stop().ok();
        tracing::info!(
            pkts_retrans = ?conn.packet_retrans_count(),
            cur_retx_queue = ?conn.retransmit_queue_bytes(),
            cur_app_wqueue = ?conn.app_write_queue_bytes(),
            sample_rtt_ms = ?conn.sample_rtt_ms(),
            "final kernel samples"
        );
    }

    let max_records = generator.packets_sent() * 2 + 1024;
    let mut telemetry = protocol::recv_telemetry(control, max_records)?;

    // Records claiming packets we never sent are dropped, not trusted.
    let packets_sent = generator.packets_sent();
    let before = telemetry.len();
    telemetry.retain(|record| (record.seq_no as u64) < packets_sent);
    if telemetry.len() != before {
        tracing::warn!(
            dropped = before - telemetry.len(),
            "telemetry records with out-of-range sequence numbers"
        );
    }

    let verdict = match outcome {
        TestOutcome::Decided(verdict) => verdict,
        TestOutcome::Errored => Verdict::Error,
        TestOutcome::Pending => {
            let losses = packets_sent.saturating_sub(telemetry.len() as u64);
            let verdict = stat_test.test_result(packets_sent, losses);
            tracing::info!(
                packets_sent,
                received = telemetry.len(),
                losses,
                "inferred loss from telemetry"
            );
            verdict
        }
    };

    if let Some(dir) = &options.log_dir {
        let sent = logfile::write_rows(dir, "serverdata", generator.records());
        let observed = logfile::write_rows(
            dir,
            "testdata",
            telemetry
                .iter()
                .map(|r| (r.seq_no, r.nonce, r.timestamp_ns())),
        );
        if let Err(e) = sent.and(observed) {
            tracing::warn!(error = %e, "failed to write session data files");
        }
    }

    protocol::send_verdict(control, verdict)?;
    tracing::info!(
        packets_sent,
        total_bytes_sent = generator.total_bytes_sent(),
        received = telemetry.len(),
        %verdict,
        "verdict sent"
    );
    Ok(verdict)
}

/// Warm-up plus the paced loop. All data-channel failures are folded into
/// `TestOutcome::Errored`; control-channel work happens in the caller.
fn run_test_phase(
    config: &TestConfig,
    pacing: &Pacing,
    stat_test: &StatTest,
    generator: &mut TrafficGenerator,
    mut sampler: Option<&mut sampler::Connection>,
) -> TestOutcome {
    let rtt_ns = config.rtt_ms as u64 * NS_PER_MS;

    // CWND warm-up: pump a pipe's worth per RTT until the congestion window
    // covers the target pipe, so the measurement is not paced through
    // slow-start. Skipped when the kernel offers no window estimate.
    if let Some(conn) = sampler.as_deref_mut() {
        let target_cwnd_bytes = pacing.target_pipe_size * config.mss_bytes as u64;
        let mut warmup_sent = 0u64;
        while warmup_sent < pacing.max_cwnd_pkt {
            if generator.send(pacing.target_pipe_size).is_err() {
                return TestOutcome::Errored;
            }
            warmup_sent += pacing.target_pipe_size;
            clock::sleep_ns(rtt_ns);

            match conn.refresh_cwnd_bytes() {
                Some(cwnd) if cwnd >= target_cwnd_bytes => {
                    tracing::debug!(cwnd, warmup_sent, "congestion window warmed up");
                    break;
                }
                Some(_) => {}
                None => break,
            }
        }

        // Let the in-flight data drain below half a pipe before pacing
        // starts. Bounded: a stall here must not eat the test budget.
        let deadline = clock::now_ns() + (10 * rtt_ns).max(NS_PER_SEC);
        while let Some(inflight) = conn.inflight_bytes() {
            if inflight < target_cwnd_bytes / 2 || clock::now_ns() > deadline {
                break;
            }
            clock::sleep_ns(NS_PER_MS);
        }
    }

    if let Some(conn) = sampler.as_deref_mut() {
        if let Err(e) = conn.start() {
            tracing::warn!(error = %e, "loss sampler failed to start");
            sampler = None;
        }
    }

    let warmup_pkts = generator.packets_sent();
    let mut next_sample =
        (generator.packets_sent() / pacing.chunks_per_sec + 1) * pacing.chunks_per_sec;
    let mut missed_total: u64 = 0;
    let mut missed_sleeps: u64 = 0;
    let mut missed_max: u64 = 0;
    let mut decided = None;

    let t0 = clock::now_ns();
    while generator.packets_sent() - warmup_pkts < pacing.max_test_pkt {
        if generator.send(pacing.burst_size_pkt).is_err() {
            return TestOutcome::Errored;
        }
        let sent = generator.packets_sent();
        // Loss accounting started after warm-up; n must cover that same
        // window, so warm-up chunks are excluded from it.
        let test_pkts = sent - warmup_pkts;

        // Sampling boundary: submit the loss delta to the SPRT once per
        // second of traffic. First decisive outcome ends the test.
        if sent >= next_sample {
            while next_sample <= sent {
                next_sample += pacing.chunks_per_sec;
            }
            if let Some(conn) = sampler.as_deref_mut() {
                conn.stop().ok();
                if let Some(losses) = conn.packet_retrans_count() {
                    match stat_test.test_result(test_pkts, losses) {
                        Verdict::Inconclusive => {}
                        verdict => {
                            tracing::info!(packets_tested = test_pkts, losses, %verdict, "SPRT decided");
                            decided = Some(verdict);
                            break;
                        }
                    }
                }
            }
        }

        let next_start = t0 + test_pkts * pacing.time_per_chunk_ns;
        let now = clock::now_ns();
        if next_start > now {
            clock::sleep_ns(next_start - now);
        } else {
            let slip = now - next_start;
            missed_total += slip;
            missed_sleeps += 1;
            missed_max = missed_max.max(slip);

            // Falling behind by more than half the elapsed time means the
            // sender, not the path, is the bottleneck.
            let elapsed = now - t0;
            if missed_total > elapsed / 2 {
                tracing::warn!(
                    missed_total_ns = missed_total,
                    missed_sleeps,
                    missed_max_ns = missed_max,
                    elapsed_ns = elapsed,
                    "pacing slipped beyond recovery, abandoning"
                );
                return TestOutcome::Decided(Verdict::Inconclusive);
            }
        }
    }

    if missed_sleeps > 0 {
        tracing::info!(
            missed_total_ns = missed_total,
            missed_sleeps,
            missed_max_ns = missed_max,
            "pacing slippage summary"
        );
    }

    match (decided, config.socket_type) {
        (Some(verdict), _) => TestOutcome::Decided(verdict),
        (None, SocketType::Udp) => TestOutcome::Pending,
        // TCP with no sampler gets its losses from telemetry too.
        (None, SocketType::Tcp) if sampler.is_none() => TestOutcome::Pending,
        // Budget exhausted without a decision.
        (None, SocketType::Tcp) => TestOutcome::Decided(Verdict::Inconclusive),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SocketType;

    fn config(socket_type: SocketType, rate: u32, rtt: u32, mss: u32) -> TestConfig {
        TestConfig::new(socket_type, rate, rtt, mss, 0)
    }

    #[test]
    fn test_pacing_tcp_uses_kernel_mss_floor() {
        let pacing = derive_pacing(&config(SocketType::Tcp, 10_000, 10, 1460), Some(536)).unwrap();
        assert_eq!(pacing.bytes_per_chunk, 536);

        let pacing = derive_pacing(&config(SocketType::Tcp, 10_000, 10, 1460), Some(65_000)).unwrap();
        assert_eq!(pacing.bytes_per_chunk, 1460);

        // UDP ignores the kernel MSS entirely.
        let pacing = derive_pacing(&config(SocketType::Udp, 10_000, 10, 1460), Some(536)).unwrap();
        assert_eq!(pacing.bytes_per_chunk, 1460);
    }

    #[test]
    fn test_pacing_rate_arithmetic() {
        // 10 Mb/s in 1460-byte chunks: 1.25 MB/s -> 856 chunks/s.
        let pacing = derive_pacing(&config(SocketType::Udp, 10_000, 10, 1460), None).unwrap();
        assert_eq!(pacing.chunks_per_sec, 1_250_000 / 1460);
        assert_eq!(pacing.time_per_chunk_ns, NS_PER_SEC / pacing.chunks_per_sec);
        // ~1.17 ms per chunk: a single chunk already sleeps past 500 us.
        assert_eq!(pacing.burst_size_pkt, 1);

        // 100 Mb/s: 117 ns per chunk, bursts grow to keep sleeps >= 500 us.
        let pacing = derive_pacing(&config(SocketType::Udp, 100_000, 10, 1460), None).unwrap();
        assert!(pacing.burst_size_pkt >= MIN_SLEEP_NS / pacing.time_per_chunk_ns);
    }

    #[test]
    fn test_pacing_budgets_capped() {
        // 1 Mb/s: base budgets apply.
        let pacing = derive_pacing(&config(SocketType::Udp, 1_000, 10, 1460), None).unwrap();
        assert_eq!(
            pacing.max_test_pkt,
            (TEST_BASE_SEC + TEST_INCR_SEC_PER_MB) * pacing.chunks_per_sec
        );

        // 1 Gb/s: both budgets saturate at their caps.
        let pacing = derive_pacing(&config(SocketType::Udp, 1_000_000, 10, 1460), None).unwrap();
        assert_eq!(pacing.max_test_pkt, TEST_MAX_SEC * pacing.chunks_per_sec);
        assert_eq!(pacing.max_cwnd_pkt, CWND_MAX_SEC * pacing.chunks_per_sec);
    }

    #[test]
    fn test_pacing_rejects_zero_chunk_rate() {
        // 1 kb/s = 125 B/s, below one 1460-byte chunk per second.
        assert!(matches!(
            derive_pacing(&config(SocketType::Udp, 1, 10, 1460), None),
            Err(Error::ConfigInvalid(_))
        ));
    }

    #[test]
    fn test_pacing_rejects_tiny_chunks() {
        assert!(matches!(
            derive_pacing(&config(SocketType::Udp, 600, 10, 4), None),
            Err(Error::ConfigInvalid(_))
        ));
    }
}
