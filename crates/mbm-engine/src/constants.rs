//! Protocol and model constants shared by both peers.

/// Control-channel sentinel completing the ready handshake.
pub const READY: &[u8] = b"READY";
/// Control-channel sentinel ending the data phase.
pub const END: &[u8] = b"END";

/// First data port handed out by the dispatcher.
pub const BASE_PORT: u16 = 12345;
/// Size of the data-port pool.
pub const NUM_PORTS: usize = 100;

/// Lower clamp on the modelled pipe size, in packets. Keeps the target run
/// length at or above 3 * 10^2 = 300 so the SPRT hypotheses stay separated
/// at low rates.
pub const MIN_TARGET_PIPE_SIZE: u64 = 10;

pub const NS_PER_SEC: u64 = 1_000_000_000;
pub const MS_PER_SEC: u64 = 1_000;

/// Test-phase budget: base seconds plus a per-Mb/s increment, capped.
pub const TEST_BASE_SEC: u64 = 30;
pub const TEST_INCR_SEC_PER_MB: u64 = 15;
pub const TEST_MAX_SEC: u64 = 300;

/// Warm-up (CWND growth) budget, same shape as the test budget.
pub const CWND_BASE_SEC: u64 = 15;
pub const CWND_INCR_SEC_PER_MB: u64 = 5;
pub const CWND_MAX_SEC: u64 = 50;

/// Minimum sleep per wake in the paced loop; bursts are sized so that each
/// inter-burst sleep is at least this long.
pub const MIN_SLEEP_NS: u64 = 500_000;

/// Ready-handshake retransmission bound (per-attempt timeout is 3 * RTT).
pub const NUM_READY_RETRANS: u32 = 10;

/// Largest single write during the telemetry upload.
pub const MAX_UPLOAD_CHUNK_BYTES: usize = 500_000;

/// Send/receive timeout applied to both channels.
pub const DEFAULT_SOCKET_TIMEOUT_MS: u64 = 5_000;

/// Fixed nonce-stream seed; both per-run log files and the telemetry carry
/// the nonces, so a deterministic stream keeps runs reproducible.
pub const SEED: u64 = 132315;

/// SPRT Type I / Type II error defaults.
pub const DEFAULT_TYPE_I_ERR: f64 = 0.05;
pub const DEFAULT_TYPE_II_ERR: f64 = 0.05;
