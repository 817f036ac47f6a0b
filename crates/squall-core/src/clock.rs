//! Hybrid Logical Clock (HLC).
//!
//! Every mutation and every merge in the grid is stamped with a [`Timestamp`]:
//! wall-clock milliseconds, a logical counter for same-millisecond ordering,
//! and the node id as the final tie-breaker. The triple is totally ordered,
//! which is what makes Last-Write-Wins resolution deterministic across nodes.
//!
//! The clock itself is a process-wide resource: [`Hlc`] is a cheap cloneable
//! handle over shared interior state, so every map, merge path, and protocol
//! handler advances the same logical time.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// A hybrid logical timestamp: `(millis, counter, node_id)`.
///
/// Ordering is lexicographic over the triple. Node ids must not contain `:`
/// so the display form `millis:counter:nodeId` stays parseable.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Timestamp {
    /// Wall-clock milliseconds since the Unix epoch at generation time.
    pub millis: u64,
    /// Logical counter distinguishing events within one millisecond.
    pub counter: u32,
    /// Id of the node that produced this timestamp.
    pub node_id: String,
}

impl Timestamp {
    /// Builds a timestamp from its parts.
    #[must_use]
    pub fn new(millis: u64, counter: u32, node_id: impl Into<String>) -> Self {
        Self { millis, counter, node_id: node_id.into() }
    }

    /// The smallest possible timestamp; sorts before any generated one.
    #[must_use]
    pub fn zero() -> Self {
        Self { millis: 0, counter: 0, node_id: String::new() }
    }
}

impl Ord for Timestamp {
    fn cmp(&self, other: &Self) -> Ordering {
        self.millis
            .cmp(&other.millis)
            .then_with(|| self.counter.cmp(&other.counter))
            .then_with(|| self.node_id.cmp(&other.node_id))
    }
}

impl PartialOrd for Timestamp {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.millis, self.counter, self.node_id)
    }
}

/// Error parsing the `millis:counter:nodeId` display form.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("malformed timestamp: {input}")]
pub struct ParseTimestampError {
    /// The rejected input.
    pub input: String,
}

impl FromStr for Timestamp {
    type Err = ParseTimestampError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let reject = || ParseTimestampError { input: s.to_string() };
        let mut parts = s.splitn(3, ':');
        let millis = parts
            .next()
            .and_then(|p| p.parse::<u64>().ok())
            .ok_or_else(reject)?;
        let counter = parts
            .next()
            .and_then(|p| p.parse::<u32>().ok())
            .ok_or_else(reject)?;
        let node_id = parts.next().filter(|p| !p.is_empty()).ok_or_else(reject)?;
        Ok(Self { millis, counter, node_id: node_id.to_string() })
    }
}

/// Source of wall-clock milliseconds, injectable for deterministic tests.
pub trait ClockSource: Send + Sync {
    /// Current wall time in milliseconds since the Unix epoch.
    fn wall_millis(&self) -> u64;
}

/// The real system clock.
#[derive(Debug, Clone, Copy)]
pub struct SystemClock;

impl ClockSource for SystemClock {
    fn wall_millis(&self) -> u64 {
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system clock predates the Unix epoch")
            .as_millis();
        u64::try_from(millis).unwrap_or(u64::MAX)
    }
}

/// Remote timestamp too far ahead of the local wall clock.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("clock drift: remote {remote_millis} is {drift_ms}ms ahead of local {local_millis} (limit {max_drift_ms}ms)")]
pub struct ClockDriftError {
    pub remote_millis: u64,
    pub local_millis: u64,
    pub drift_ms: u64,
    pub max_drift_ms: u64,
}

#[derive(Debug, Default)]
struct ClockState {
    millis: u64,
    counter: u32,
}

/// Process-wide hybrid logical clock handle.
///
/// Cloning shares the underlying state; all clones observe and advance the
/// same logical time. `millis` may jump forward (wall clock, remote merges)
/// but never moves backward within a node.
#[derive(Clone)]
pub struct Hlc {
    node_id: Arc<str>,
    source: Arc<dyn ClockSource>,
    strict: bool,
    max_drift_ms: u64,
    state: Arc<Mutex<ClockState>>,
}

impl fmt::Debug for Hlc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Hlc")
            .field("node_id", &self.node_id)
            .field("strict", &self.strict)
            .field("max_drift_ms", &self.max_drift_ms)
            .finish_non_exhaustive()
    }
}

/// Default drift tolerance when merging remote timestamps: one minute.
pub const DEFAULT_MAX_DRIFT_MS: u64 = 60_000;

impl Hlc {
    /// Creates a permissive clock (drift is logged, never rejected).
    #[must_use]
    pub fn new(node_id: impl Into<String>, source: Arc<dyn ClockSource>) -> Self {
        Self::with_options(node_id, source, false, DEFAULT_MAX_DRIFT_MS)
    }

    /// Creates a clock with explicit strictness and drift tolerance.
    #[must_use]
    pub fn with_options(
        node_id: impl Into<String>,
        source: Arc<dyn ClockSource>,
        strict: bool,
        max_drift_ms: u64,
    ) -> Self {
        Self {
            node_id: Arc::from(node_id.into()),
            source,
            strict,
            max_drift_ms,
            state: Arc::new(Mutex::new(ClockState::default())),
        }
    }

    /// The node id stamped onto generated timestamps.
    #[must_use]
    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Reads the wall clock without touching logical state.
    ///
    /// CRDT maps use this for TTL expiry checks so that tests can steer the
    /// same clock that produced the timestamps.
    #[must_use]
    pub fn wall_millis(&self) -> u64 {
        self.source.wall_millis()
    }

    /// Generates a timestamp strictly greater than every previous one.
    ///
    /// When the wall clock has advanced past logical time the counter resets;
    /// otherwise it increments within the current millisecond.
    pub fn now(&self) -> Timestamp {
        let wall = self.source.wall_millis();
        let mut state = self.state.lock().expect("hlc state poisoned");
        if wall > state.millis {
            state.millis = wall;
            state.counter = 0;
        } else {
            state.counter += 1;
        }
        Timestamp {
            millis: state.millis,
            counter: state.counter,
            node_id: self.node_id.to_string(),
        }
    }

    /// Folds a remote timestamp into local logical time.
    ///
    /// Called on every received record or message so that subsequent local
    /// timestamps causally follow everything this node has observed.
    ///
    /// # Errors
    ///
    /// In strict mode, returns [`ClockDriftError`] when the remote timestamp
    /// is more than `max_drift_ms` ahead of the local wall clock. Permissive
    /// mode logs a warning and accepts the timestamp.
    pub fn observe(&self, remote: &Timestamp) -> Result<(), ClockDriftError> {
        let wall = self.source.wall_millis();

        if remote.millis > wall {
            let drift = remote.millis - wall;
            if drift > self.max_drift_ms {
                if self.strict {
                    return Err(ClockDriftError {
                        remote_millis: remote.millis,
                        local_millis: wall,
                        drift_ms: drift,
                        max_drift_ms: self.max_drift_ms,
                    });
                }
                tracing::warn!(
                    remote_millis = remote.millis,
                    local_millis = wall,
                    drift_ms = drift,
                    max_drift_ms = self.max_drift_ms,
                    "accepting remote timestamp beyond drift limit"
                );
            }
        }

        let mut state = self.state.lock().expect("hlc state poisoned");
        let max_millis = state.millis.max(wall).max(remote.millis);

        if max_millis == state.millis && max_millis == remote.millis {
            state.counter = state.counter.max(remote.counter) + 1;
        } else if max_millis == state.millis {
            state.counter += 1;
        } else if max_millis == remote.millis {
            state.counter = remote.counter + 1;
        } else {
            state.counter = 0;
        }
        state.millis = max_millis;
        Ok(())
    }
}


#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering as AtomicOrdering;

    use super::test_support::ManualClock;
    use super::*;

    fn manual_hlc(initial: u64) -> (Hlc, std::sync::Arc<std::sync::atomic::AtomicU64>) {
        let (clock, time) = ManualClock::new(initial);
        (Hlc::new("test-node", clock), time)
    }

    // ---- ordering ----

    #[test]
    fn order_is_millis_then_counter_then_node() {
        let base = Timestamp::new(100, 1, "m");
        assert!(base < Timestamp::new(101, 0, "a"));
        assert!(base < Timestamp::new(100, 2, "a"));
        assert!(base < Timestamp::new(100, 1, "z"));
        assert!(base > Timestamp::new(100, 1, "a"));
    }

    #[test]
    fn zero_sorts_before_everything() {
        assert!(Timestamp::zero() < Timestamp::new(0, 0, "a"));
    }

    // ---- display / parse ----

    #[test]
    fn display_roundtrips_through_parse() {
        let ts = Timestamp::new(1_700_000_000_000, 17, "node-a1");
        assert_eq!(ts.to_string(), "1700000000000:17:node-a1");
        let parsed: Timestamp = ts.to_string().parse().unwrap();
        assert_eq!(parsed, ts);
    }

    #[test]
    fn parse_rejects_malformed_input() {
        assert!("".parse::<Timestamp>().is_err());
        assert!("12:3".parse::<Timestamp>().is_err());
        assert!("x:0:node".parse::<Timestamp>().is_err());
        assert!("12:0:".parse::<Timestamp>().is_err());
    }

    #[test]
    fn parse_keeps_dashes_in_node_id() {
        let parsed: Timestamp = "5:0:node-with-dashes".parse().unwrap();
        assert_eq!(parsed.node_id, "node-with-dashes");
    }

    // ---- now() ----

    #[test]
    fn now_is_strictly_monotonic_on_a_frozen_clock() {
        let (hlc, _) = manual_hlc(1_000_000);
        let mut prev = hlc.now();
        for expected in 1..50u32 {
            let next = hlc.now();
            assert!(prev < next);
            assert_eq!(next.millis, 1_000_000);
            assert_eq!(next.counter, expected);
            prev = next;
        }
    }

    #[test]
    fn now_resets_counter_when_wall_advances() {
        let (hlc, time) = manual_hlc(1_000_000);
        assert_eq!(hlc.now().counter, 0);
        assert_eq!(hlc.now().counter, 1);
        time.store(1_000_001, AtomicOrdering::Relaxed);
        let ts = hlc.now();
        assert_eq!(ts.millis, 1_000_001);
        assert_eq!(ts.counter, 0);
    }

    #[test]
    fn clones_share_logical_state() {
        let (hlc, _) = manual_hlc(1_000_000);
        let other = hlc.clone();
        let a = hlc.now();
        let b = other.now();
        assert!(a < b);
        assert_eq!(b.counter, a.counter + 1);
    }

    // ---- observe() ----

    #[test]
    fn observe_fast_forwards_past_remote() {
        let (hlc, _) = manual_hlc(1_000_000);
        let remote = Timestamp::new(1_000_100, 5, "peer");
        hlc.observe(&remote).unwrap();
        let ts = hlc.now();
        assert_eq!(ts.millis, 1_000_100);
        assert_eq!(ts.counter, 7); // 5 + 1 from observe, + 1 from now
    }

    #[test]
    fn observe_same_millis_takes_max_counter() {
        let (hlc, _) = manual_hlc(1_000_000);
        hlc.now(); // counter 0 at 1_000_000
        hlc.observe(&Timestamp::new(1_000_000, 9, "peer")).unwrap();
        let ts = hlc.now();
        assert_eq!(ts.millis, 1_000_000);
        assert_eq!(ts.counter, 11);
    }

    #[test]
    fn observe_keeps_local_when_ahead() {
        let (hlc, _) = manual_hlc(1_000_500);
        hlc.now();
        hlc.observe(&Timestamp::new(1_000_000, 40, "peer")).unwrap();
        assert_eq!(hlc.now().millis, 1_000_500);
    }

    #[test]
    fn observe_resets_counter_when_wall_leads_both() {
        let (hlc, _) = manual_hlc(1_000_900);
        hlc.observe(&Timestamp::new(1_000_100, 5, "peer")).unwrap();
        let ts = hlc.now();
        assert_eq!(ts.millis, 1_000_900);
        assert_eq!(ts.counter, 1);
    }

    // ---- drift handling ----

    #[test]
    fn strict_mode_rejects_excessive_drift() {
        let (clock, _) = ManualClock::new(1_000_000);
        let hlc = Hlc::with_options("strict", clock, true, 5_000);
        let err = hlc
            .observe(&Timestamp::new(1_010_000, 0, "peer"))
            .unwrap_err();
        assert_eq!(err.drift_ms, 10_000);
        assert_eq!(err.max_drift_ms, 5_000);
    }

    #[test]
    fn strict_mode_accepts_drift_within_limit() {
        let (clock, _) = ManualClock::new(1_000_000);
        let hlc = Hlc::with_options("strict", clock, true, 10_000);
        assert!(hlc.observe(&Timestamp::new(1_005_000, 0, "peer")).is_ok());
        assert_eq!(hlc.now().millis, 1_005_000);
    }

    #[test]
    fn permissive_mode_accepts_any_forward_drift() {
        let (hlc, _) = manual_hlc(1_000_000);
        assert!(hlc.observe(&Timestamp::new(2_000_000, 0, "peer")).is_ok());
        assert_eq!(hlc.now().millis, 2_000_000);
    }

    #[test]
    fn lagging_remote_is_never_drift() {
        let (clock, _) = ManualClock::new(1_000_000);
        let hlc = Hlc::with_options("strict", clock, true, 1);
        assert!(hlc.observe(&Timestamp::new(1, 0, "peer")).is_ok());
    }

    // ---- cross-node causality ----

    #[test]
    fn receiver_timestamps_follow_senders() {
        let (a, _) = manual_hlc(1_000_000);
        let (clock_b, _) = ManualClock::new(1_000_000);
        let b = Hlc::new("node-b", clock_b);

        a.now();
        let sent = a.now();
        b.observe(&sent).unwrap();
        let received = b.now();
        assert!(sent < received);
    }

    #[test]
    fn serde_roundtrip_msgpack() {
        let ts = Timestamp::new(1_700_000_000_000, 3, "node-7");
        let bytes = rmp_serde::to_vec_named(&ts).unwrap();
        let back: Timestamp = rmp_serde::from_slice(&bytes).unwrap();
        assert_eq!(ts, back);
    }
}
