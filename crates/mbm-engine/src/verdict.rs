//! Test verdicts and their wire encoding.

use std::fmt;

/// Outcome of a measurement session. ERROR is reserved for protocol
/// failures; the other three are statistical decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Verdict {
    Fail = 0,
    Pass = 1,
    Inconclusive = 2,
    Error = 3,
}

impl Verdict {
    /// Wire value, sent as a network-order u32 at the end of a session.
    pub fn to_wire(self) -> u32 {
        self as u32
    }

    pub fn from_wire(v: u32) -> Option<Verdict> {
        match v {
            0 => Some(Verdict::Fail),
            1 => Some(Verdict::Pass),
            2 => Some(Verdict::Inconclusive),
            3 => Some(Verdict::Error),
            _ => None,
        }
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Verdict::Fail => "FAIL",
            Verdict::Pass => "PASS",
            Verdict::Inconclusive => "INCONCLUSIVE",
            Verdict::Error => "ERROR",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_round_trip() {
        for v in [
            Verdict::Fail,
            Verdict::Pass,
            Verdict::Inconclusive,
            Verdict::Error,
        ] {
            assert_eq!(Verdict::from_wire(v.to_wire()), Some(v));
        }
        assert_eq!(Verdict::from_wire(4), None);
    }

    #[test]
    fn test_wire_order_is_stable() {
        // Peers disagree on verdicts if this order ever changes.
        assert_eq!(Verdict::Fail.to_wire(), 0);
        assert_eq!(Verdict::Pass.to_wire(), 1);
        assert_eq!(Verdict::Inconclusive.to_wire(), 2);
        assert_eq!(Verdict::Error.to_wire(), 3);
    }
}
