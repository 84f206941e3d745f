use serde::Serialize;
use std::fmt;

pub const EXIT_ACCEPTED: i32 = 0;
pub const EXIT_CRASHED: i32 = 1;
pub const EXIT_REJECTED: i32 = 10;

const TIMEOUT_CODE: &str = "timeout";

/// Classified result of one target invocation.
///
/// This is the only place exit-code semantics are interpreted. Everything
/// downstream (archive routing, ledger formatting) consumes the tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(tag = "kind", content = "code", rename_all = "snake_case")]
pub enum Outcome {
    Accepted,
    Rejected,
    Crashed,
    TimedOut,
    Unknown(i32),
}

/// Maps a raw exit code plus the watchdog flag onto an [`Outcome`].
///
/// A forced termination always wins: the code the OS reports for a killed
/// process is not meaningful.
pub fn classify(exit_code: i32, timed_out: bool) -> Outcome {
    if timed_out {
        return Outcome::TimedOut;
    }
    match exit_code {
        EXIT_ACCEPTED => Outcome::Accepted,
        EXIT_CRASHED => Outcome::Crashed,
        EXIT_REJECTED => Outcome::Rejected,
        other => Outcome::Unknown(other),
    }
}

impl Outcome {
    /// Fixed per-outcome subdirectory under `actual_maps/`.
    pub fn directory_name(&self) -> &'static str {
        match self {
            Outcome::Accepted => "accepted",
            Outcome::Crashed => "crashed",
            Outcome::Rejected => "rejected",
            Outcome::TimedOut => "timed_out",
            Outcome::Unknown(_) => "unknown",
        }
    }

    /// Value of the `ErrorCode` CSV column.
    pub fn error_code(&self) -> String {
        match self {
            Outcome::Accepted => EXIT_ACCEPTED.to_string(),
            Outcome::Crashed => EXIT_CRASHED.to_string(),
            Outcome::Rejected => EXIT_REJECTED.to_string(),
            Outcome::TimedOut => TIMEOUT_CODE.to_string(),
            Outcome::Unknown(code) => code.to_string(),
        }
    }

    /// Inverse of [`Outcome::error_code`].
    pub fn parse_error_code(raw: &str) -> Option<Outcome> {
        let raw = raw.trim();
        if raw == TIMEOUT_CODE {
            return Some(Outcome::TimedOut);
        }
        raw.parse::<i32>().ok().map(|code| classify(code, false))
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::Unknown(code) => write!(f, "unknown({})", code),
            other => f.write_str(other.directory_name()),
        }
    }
}

/// Per-outcome tallies for one run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct OutcomeCounts {
    pub accepted: usize,
    pub crashed: usize,
    pub rejected: usize,
    pub timed_out: usize,
    pub unknown: usize,
}

impl OutcomeCounts {
    pub fn record(&mut self, outcome: Outcome) {
        match outcome {
            Outcome::Accepted => self.accepted += 1,
            Outcome::Crashed => self.crashed += 1,
            Outcome::Rejected => self.rejected += 1,
            Outcome::TimedOut => self.timed_out += 1,
            Outcome::Unknown(_) => self.unknown += 1,
        }
    }

    pub fn total(&self) -> usize {
        self.accepted + self.crashed + self.rejected + self.timed_out + self.unknown
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn contractual_codes_classify_to_their_variants() {
        assert_eq!(classify(0, false), Outcome::Accepted);
        assert_eq!(classify(1, false), Outcome::Crashed);
        assert_eq!(classify(10, false), Outcome::Rejected);
    }

    #[test]
    fn other_codes_keep_their_raw_value() {
        for code in [-1, 2, 9, 11, 127, 139, 255, i32::MIN, i32::MAX] {
            assert_eq!(classify(code, false), Outcome::Unknown(code));
        }
    }

    #[test]
    fn timeout_flag_overrides_any_exit_code() {
        for code in [0, 1, 10, 137, -9] {
            assert_eq!(classify(code, true), Outcome::TimedOut);
        }
    }

    #[test]
    fn unknown_codes_share_one_directory() {
        assert_eq!(Outcome::Unknown(2).directory_name(), "unknown");
        assert_eq!(Outcome::Unknown(-7).directory_name(), "unknown");
        let all = [
            Outcome::Accepted,
            Outcome::Crashed,
            Outcome::Rejected,
            Outcome::TimedOut,
            Outcome::Unknown(i32::MAX),
        ];
        for outcome in all {
            let tag = outcome.directory_name();
            assert!(!tag.contains(char::is_numeric), "tag {} carries a code", tag);
        }
    }

    #[test]
    fn error_code_column_parses_back() {
        let cases = [
            Outcome::Accepted,
            Outcome::Crashed,
            Outcome::Rejected,
            Outcome::TimedOut,
            Outcome::Unknown(42),
        ];
        for outcome in cases {
            assert_eq!(Outcome::parse_error_code(&outcome.error_code()), Some(outcome));
        }
        assert_eq!(Outcome::parse_error_code("garbage"), None);
    }

    #[test]
    fn json_shape_carries_code_only_for_unknown() {
        assert_eq!(
            serde_json::to_value(Outcome::Unknown(3)).expect("json"),
            serde_json::json!({"kind": "unknown", "code": 3})
        );
        assert_eq!(
            serde_json::to_value(Outcome::TimedOut).expect("json"),
            serde_json::json!({"kind": "timed_out"})
        );
    }

    #[test]
    fn counts_track_every_variant() {
        let mut counts = OutcomeCounts::default();
        for outcome in [
            Outcome::Accepted,
            Outcome::Accepted,
            Outcome::Rejected,
            Outcome::TimedOut,
            Outcome::Unknown(3),
        ] {
            counts.record(outcome);
        }
        assert_eq!(counts.accepted, 2);
        assert_eq!(counts.rejected, 1);
        assert_eq!(counts.crashed, 0);
        assert_eq!(counts.timed_out, 1);
        assert_eq!(counts.unknown, 1);
        assert_eq!(counts.total(), 5);
    }
}
