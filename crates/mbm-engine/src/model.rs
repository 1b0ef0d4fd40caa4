//! BDP path model.
//!
//! Derives the target pipe size (the bandwidth-delay product expressed in
//! packets of `mss_bytes`) and the target run length (expected packets
//! between losses under the null hypothesis) from `(rate, rtt, mss)`.

use crate::constants::MIN_TARGET_PIPE_SIZE;
use crate::error::{Error, Result};

/// BDP in packets, clamped below at [`MIN_TARGET_PIPE_SIZE`].
///
/// `rate_kb_s / 8` is the rate in bytes per millisecond; multiplied by the
/// RTT in milliseconds it gives the in-flight byte budget.
pub fn target_pipe_size(cbr_kb_s: u32, rtt_ms: u32, mss_bytes: u32) -> Result<u64> {
    if mss_bytes == 0 {
        return Err(Error::ConfigInvalid("mss_bytes must be > 0".into()));
    }
    // kb/s * ms / 8 = bytes over one RTT; divide by MSS last so the only
    // floor happens at packet granularity.
    let pipe = cbr_kb_s as u64 * rtt_ms as u64 / 8 / mss_bytes as u64;
    Ok(pipe.max(MIN_TARGET_PIPE_SIZE))
}

/// Target run length: 3 * pipe^2 packets. Encodes the rule of thumb that a
/// path sustaining the rate should see at most one loss per three
/// congestion-avoidance sawtooth periods.
pub fn target_run_length(cbr_kb_s: u32, rtt_ms: u32, mss_bytes: u32) -> Result<u64> {
    let pipe = target_pipe_size(cbr_kb_s, rtt_ms, mss_bytes)?;
    // Saturate: adversarial configs can square a huge pipe past u64.
    Ok(pipe.saturating_mul(pipe).saturating_mul(3))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pipe_size_formula() {
        // 10 Mb/s, 100 ms, 1460 B: 1250 B/ms * 100 ms / 1460 B = 85 packets.
        assert_eq!(target_pipe_size(10_000, 100, 1460).unwrap(), 85);
    }

    #[test]
    fn test_pipe_size_clamped_below() {
        // 600 kb/s over 10 ms barely covers half a packet.
        let pipe = target_pipe_size(600, 10, 1460).unwrap();
        assert_eq!(pipe, MIN_TARGET_PIPE_SIZE);
    }

    #[test]
    fn test_run_length_is_three_pipe_squared() {
        let pipe = target_pipe_size(10_000, 100, 1460).unwrap();
        let run = target_run_length(10_000, 100, 1460).unwrap();
        assert_eq!(run, 3 * pipe * pipe);
        assert!(run > 0);
    }

    #[test]
    fn test_zero_mss_rejected() {
        assert!(matches!(
            target_pipe_size(10_000, 100, 0),
            Err(Error::ConfigInvalid(_))
        ));
        assert!(target_run_length(10_000, 100, 0).is_err());
    }

    #[test]
    fn test_extreme_config_saturates() {
        // rate and rtt at u32::MAX with a 1-byte MSS squares past u64.
        let run = target_run_length(u32::MAX, u32::MAX, 1).unwrap();
        assert_eq!(run, u64::MAX);
    }

    #[test]
    fn test_positive_for_all_valid_inputs() {
        for rate in [1u32, 600, 10_000, 1_000_000] {
            for rtt in [1u32, 10, 200, 1000] {
                for mss in [536u32, 1460, 9000] {
                    let pipe = target_pipe_size(rate, rtt, mss).unwrap();
                    assert!(pipe >= MIN_TARGET_PIPE_SIZE);
                    assert!(target_run_length(rate, rtt, mss).unwrap() > 0);
                }
            }
        }
    }
}
