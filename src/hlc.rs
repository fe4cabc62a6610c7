//! Hybrid Logical Clock: a physical-time/counter/node-id triple that provides
//! a total, causally-consistent order over events produced by any number of
//! independent clients without requiring synchronized wall clocks.
//!
//! The clock is exposed as a service object ([`ClockService`]) rather than a
//! bare value so that it can be owned by the host application, initialized
//! once from a persisted node id, and driven by an injectable time source in
//! tests instead of the real system clock.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use chrono::{LocalResult, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Counter ceiling: the counter may not exceed this value within one millisecond.
pub const MAX_COUNTER: u16 = 65535;
/// Default allowed skew, in milliseconds, between an HLC's physical time and
/// the local system clock before [`Error::ClockDrift`] is raised.
pub const DEFAULT_MAX_DRIFT_MS: i64 = 60_000;

/// An immutable Hybrid Logical Clock value: `(millis, counter, node)`.
///
/// `Ord`/`PartialOrd` are derived in field declaration order, which matches
/// the tuple comparison `(millis, counter, node)` used for LWW and gives the
/// same order as comparing the [`Display`](fmt::Display) string form
/// byte-lexicographically.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Hlc {
    pub millis: i64,
    pub counter: u16,
    pub node: String,
}

impl Hlc {
    pub fn new(millis: i64, counter: u16, node: impl Into<String>) -> Self {
        Hlc {
            millis,
            counter,
            node: node.into(),
        }
    }

    /// A 32-bit non-cryptographic hash of the string form, used only by the
    /// Merkle tree to combine entries. Intentionally not a cryptographic
    /// hash: the Merkle XOR-insert relies on the hash distributing evenly,
    /// not on any security property, and substituting one would not change
    /// correctness but would be a waste of cycles.
    pub fn hash(&self) -> u32 {
        fnv1a_32(self.to_string().as_bytes())
    }
}

/// FNV-1a, 32-bit variant. Fast, non-cryptographic, good avalanche for short
/// ASCII keys like HLC strings.
fn fnv1a_32(bytes: &[u8]) -> u32 {
    const OFFSET_BASIS: u32 = 0x811c_9dc5;
    const PRIME: u32 = 0x0100_0193;
    let mut hash = OFFSET_BASIS;
    for &b in bytes {
        hash ^= b as u32;
        hash = hash.wrapping_mul(PRIME);
    }
    hash
}

impl fmt::Display for Hlc {
    /// `YYYY-MM-DDTHH:MM:SS.mmmZ_HHHH_NNNNNNNNNNNNNNNN`.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}_{:04X}_{:0>16}",
            millis_to_iso8601(self.millis).map_err(|_| fmt::Error)?,
            self.counter,
            self.node,
        )
    }
}

impl FromStr for Hlc {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let parts: Vec<&str> = s.split('_').collect();
        if parts.len() != 3 {
            return Err(Error::InvalidEntry(format!(
                "HLC string must have exactly three '_'-separated parts: '{s}'"
            )));
        }
        let (ts_part, counter_part, node_part) = (parts[0], parts[1], parts[2]);

        if counter_part.len() != 4 {
            return Err(Error::InvalidEntry(format!(
                "HLC counter must be exactly 4 hex digits: '{counter_part}'"
            )));
        }
        if node_part.len() != 16 {
            return Err(Error::InvalidEntry(format!(
                "HLC node id must be exactly 16 characters: '{node_part}'"
            )));
        }

        let millis = iso8601_to_millis(ts_part)
            .map_err(|e| Error::InvalidEntry(format!("bad HLC timestamp '{ts_part}': {e}")))?;
        let counter = u16::from_str_radix(counter_part, 16)
            .map_err(|e| Error::InvalidEntry(format!("bad HLC counter '{counter_part}': {e}")))?;

        Ok(Hlc {
            millis,
            counter,
            node: node_part.to_string(),
        })
    }
}

fn millis_to_iso8601(millis: i64) -> std::result::Result<String, String> {
    let secs = millis.div_euclid(1000);
    let nanos = (millis.rem_euclid(1000) * 1_000_000) as u32;
    match Utc.timestamp_opt(secs, nanos) {
        LocalResult::Single(dt) => Ok(dt.to_rfc3339_opts(chrono::SecondsFormat::Millis, true)),
        _ => Err(format!("millis out of range: {millis}")),
    }
}

fn iso8601_to_millis(s: &str) -> std::result::Result<i64, String> {
    let dt = chrono::DateTime::parse_from_rfc3339(s).map_err(|e| e.to_string())?;
    Ok(dt.timestamp_millis())
}

fn now_ms_system() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before epoch")
        .as_millis() as i64
}

/// Process-wide clock state: `Uninitialized` until [`ClockService::init`] is
/// called, after which every operation works on the held [`Hlc`].
enum ClockState {
    Uninitialized,
    Initialized(Hlc),
}

/// Owns the current HLC value and the system-time source used to advance it.
///
/// Construct with [`ClockService::new`], call [`ClockService::init`] once
/// with the persisted node id, then use [`ClockService::tick`] for local
/// events and [`ClockService::tick_past`] when receiving a remote one.
pub struct ClockService {
    max_drift_ms: i64,
    max_counter: u16,
    now_ms: Box<dyn Fn() -> i64 + Send + Sync>,
    state: Mutex<ClockState>,
}

impl Default for ClockService {
    fn default() -> Self {
        Self::new()
    }
}

impl ClockService {
    pub fn new() -> Self {
        ClockService {
            max_drift_ms: DEFAULT_MAX_DRIFT_MS,
            max_counter: MAX_COUNTER,
            now_ms: Box::new(now_ms_system),
            state: Mutex::new(ClockState::Uninitialized),
        }
    }

    /// Builds a clock driven by `now_ms` instead of the system clock, for
    /// deterministic tests.
    pub fn with_clock_fn(now_ms: impl Fn() -> i64 + Send + Sync + 'static) -> Self {
        ClockService {
            max_drift_ms: DEFAULT_MAX_DRIFT_MS,
            max_counter: MAX_COUNTER,
            now_ms: Box::new(now_ms),
            state: Mutex::new(ClockState::Uninitialized),
        }
    }

    pub fn with_max_drift_ms(mut self, max_drift_ms: i64) -> Self {
        self.max_drift_ms = max_drift_ms;
        self
    }

    pub fn with_max_counter(mut self, max_counter: u16) -> Self {
        self.max_counter = max_counter;
        self
    }

    /// One-way transition out of `Uninitialized`. `node_id` must be the
    /// 16-character identifier persisted in settings.
    pub fn init(&self, node_id: impl Into<String>) {
        let mut state = self.state.lock().unwrap();
        if matches!(*state, ClockState::Uninitialized) {
            *state = ClockState::Initialized(Hlc::new(0, 0, node_id.into()));
        } else {
            log::warn!("ClockService::init called more than once; ignoring");
        }
    }

    pub fn time(&self) -> Result<Hlc> {
        match &*self.state.lock().unwrap() {
            ClockState::Uninitialized => Err(Error::ClockNotInitialized),
            ClockState::Initialized(hlc) => Ok(hlc.clone()),
        }
    }

    pub fn set_time(&self, hlc: Hlc) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        match &*state {
            ClockState::Uninitialized => Err(Error::ClockNotInitialized),
            ClockState::Initialized(_) => {
                *state = ClockState::Initialized(hlc);
                Ok(())
            }
        }
    }

    /// Advances the clock for a local event.
    pub fn tick(&self) -> Result<Hlc> {
        let mut state = self.state.lock().unwrap();
        let current = match &*state {
            ClockState::Uninitialized => return Err(Error::ClockNotInitialized),
            ClockState::Initialized(hlc) => hlc.clone(),
        };

        let sys = (self.now_ms)();
        if current.millis - sys > self.max_drift_ms {
            log::warn!(
                "clock drift: local hlc time {} ahead of system time {} by more than {}ms",
                current.millis, sys, self.max_drift_ms
            );
            return Err(Error::ClockDrift {
                detail: format!(
                    "local hlc time {} ahead of system time {} by more than {}ms",
                    current.millis, sys, self.max_drift_ms
                ),
            });
        }

        let new_millis = current.millis.max(sys);
        let new_counter: u32 = if new_millis == current.millis {
            current.counter as u32 + 1
        } else {
            0
        };
        if new_counter > self.max_counter as u32 {
            log::error!("hlc counter overflow for node '{}' at millis {}", current.node, new_millis);
            return Err(Error::CounterOverflow);
        }

        let new_hlc = Hlc::new(new_millis, new_counter as u16, current.node);
        *state = ClockState::Initialized(new_hlc.clone());
        Ok(new_hlc)
    }

    /// Advances the clock on receipt of a remote event.
    pub fn tick_past(&self, other: &Hlc) -> Result<Hlc> {
        let mut state = self.state.lock().unwrap();
        let current = match &*state {
            ClockState::Uninitialized => return Err(Error::ClockNotInitialized),
            ClockState::Initialized(hlc) => hlc.clone(),
        };

        if other.node == current.node {
            log::warn!("refusing tick_past: remote hlc carries local node id '{}'", current.node);
            return Err(Error::DuplicateNode(other.node.clone()));
        }

        let sys = (self.now_ms)();
        if other.millis - sys > self.max_drift_ms || current.millis - sys > self.max_drift_ms {
            log::warn!(
                "clock drift: remote or local hlc time more than {}ms ahead of system time {}",
                self.max_drift_ms, sys
            );
            return Err(Error::ClockDrift {
                detail: format!(
                    "remote or local hlc time more than {}ms ahead of system time {}",
                    self.max_drift_ms, sys
                ),
            });
        }

        let new_millis = current.millis.max(sys).max(other.millis);
        let new_counter: u32 = match (new_millis == current.millis, new_millis == other.millis) {
            (true, true) => current.counter.max(other.counter) as u32 + 1,
            (true, false) => current.counter as u32 + 1,
            (false, true) => other.counter as u32 + 1,
            (false, false) => 0,
        };
        if new_counter > self.max_counter as u32 {
            log::error!("hlc counter overflow for node '{}' at millis {}", current.node, new_millis);
            return Err(Error::CounterOverflow);
        }

        let new_hlc = Hlc::new(new_millis, new_counter as u16, current.node);
        *state = ClockState::Initialized(new_hlc.clone());
        Ok(new_hlc)
    }
}

/// Compares two HLC tuples the same way their string forms compare
/// byte-lexicographically; used by callers that only hold the string form.
pub fn cmp_hlc_strings(a: &str, b: &str) -> Ordering {
    a.cmp(b)
}

/// The smallest legal HLC string whose physical time is `millis`: counter
/// zero, node id the lowest possible value. Used by the sync driver as a
/// lower-bound cursor when it only has an approximate millisecond boundary
/// (e.g. from a Merkle path) rather than an exact `hlc_time` to resume from.
pub fn floor_hlc_time_at(millis: i64) -> String {
    Hlc::new(millis, 0, "0".repeat(16)).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicI64, Ordering as AtomicOrdering};
    use std::sync::Arc;

    fn fixed_clock(times: Vec<i64>) -> ClockService {
        let idx = Arc::new(AtomicI64::new(0));
        let times = Arc::new(times);
        ClockService::with_clock_fn(move || {
            let i = idx.fetch_add(1, AtomicOrdering::SeqCst) as usize;
            times[i.min(times.len() - 1)]
        })
    }

    #[test]
    fn round_trip_display_and_parse() {
        let hlc = Hlc::new(1_700_000_000_123, 0x00AB, "abcdef0123456789");
        let s = hlc.to_string();
        let parsed: Hlc = s.parse().unwrap();
        assert_eq!(hlc, parsed);
    }

    #[test]
    fn string_order_matches_tuple_order() {
        let a = Hlc::new(1000, 1, "aaaaaaaaaaaaaaaa");
        let b = Hlc::new(1000, 2, "aaaaaaaaaaaaaaaa");
        assert!(a < b);
        assert!(a.to_string() < b.to_string());

        let c = Hlc::new(1000, 5, "aaaaaaaaaaaaaaaa");
        let d = Hlc::new(1001, 0, "aaaaaaaaaaaaaaaa");
        assert!(c < d);
        assert!(c.to_string() < d.to_string());
    }

    #[test]
    fn parse_rejects_malformed_strings() {
        assert!("not-an-hlc".parse::<Hlc>().is_err());
        assert!("2024-01-01T00:00:00.000Z_ZZZZ_abcdef0123456789"
            .parse::<Hlc>()
            .is_err());
        assert!("2024-01-01T00:00:00.000Z_0001_tooshort"
            .parse::<Hlc>()
            .is_err());
    }

    #[test]
    fn s1_tick_sequence() {
        let clock = fixed_clock(vec![1500, 1500, 1499]);
        clock.init("n000000000000000".chars().take(16).collect::<String>());
        clock.set_time(Hlc::new(1000, 0, "n".repeat(16))).unwrap();

        let h1 = clock.tick().unwrap();
        assert_eq!((h1.millis, h1.counter), (1500, 0));

        let h2 = clock.tick().unwrap();
        assert_eq!((h2.millis, h2.counter), (1500, 1));

        let h3 = clock.tick().unwrap();
        assert_eq!((h3.millis, h3.counter), (1500, 2));
    }

    #[test]
    fn s2_tick_past_across_nodes() {
        let clock = fixed_clock(vec![2000, 2001]);
        let n1 = "n1".repeat(8);
        clock.init(n1.clone());
        clock.set_time(Hlc::new(2000, 3, n1.clone())).unwrap();

        let incoming = Hlc::new(2000, 5, "n2".repeat(8));
        let result = clock.tick_past(&incoming).unwrap();
        assert_eq!((result.millis, result.counter), (2000, 6));
        assert_eq!(result.node, n1);

        let incoming2 = Hlc::new(1999, 99, "n3".repeat(8));
        let result2 = clock.tick_past(&incoming2).unwrap();
        assert_eq!((result2.millis, result2.counter), (2001, 0));
    }

    #[test]
    fn tick_fails_before_init() {
        let clock = ClockService::new();
        assert!(matches!(clock.tick(), Err(Error::ClockNotInitialized)));
    }

    #[test]
    fn tick_past_rejects_own_node() {
        let clock = fixed_clock(vec![1000]);
        let node = "n".repeat(16);
        clock.init(node.clone());
        let other = Hlc::new(1000, 0, node);
        assert!(matches!(clock.tick_past(&other), Err(Error::DuplicateNode(_))));
    }

    #[test]
    fn counter_overflow_is_rejected() {
        let clock = fixed_clock(vec![1000]);
        let node = "n".repeat(16);
        clock.init(node.clone());
        clock
            .set_time(Hlc::new(1000, MAX_COUNTER, node))
            .unwrap();
        assert!(matches!(clock.tick(), Err(Error::CounterOverflow)));
    }
}
