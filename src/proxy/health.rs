//! Per-node health: circuit breaker and latency/error scoring
//!
//! # States
//!
//! - **Closed**: normal operation, requests pass through
//! - **Open**: node tripped after repeated connection failures; requests are
//!   refused until the silence period has elapsed
//! - **HalfOpen**: a single trial request is in flight
//!
//! The breaker is driven only by connection failures and timeouts. Every
//! error, whatever its kind, feeds the per-second sample ring that the score
//! is computed from.

use crate::common::{DStoreConfig, Error, Result, METRICS};
use serde::Serialize;
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// Circuit breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed = 0,
    HalfOpen = 1,
    Open = 2,
}

impl CircuitState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Closed,
            1 => Self::HalfOpen,
            _ => Self::Open,
        }
    }
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::HalfOpen => write!(f, "half_open"),
            Self::Open => write!(f, "open"),
        }
    }
}

/// Outcome of asking the breaker whether a call may proceed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Allowed,
    /// The caller owns the single half-open trial request
    Trial,
    Rejected,
}

impl Admission {
    pub fn is_allowed(self) -> bool {
        !matches!(self, Admission::Rejected)
    }
}

/// How a node call ended, as far as health is concerned
#[derive(Debug, Clone)]
pub enum CallOutcome {
    Success(Duration),
    Failure { connection: bool, reason: String },
}

impl CallOutcome {
    /// A node that answered, even with `EXISTS`, is healthy
    pub fn of<T>(result: &Result<T>, latency: Duration) -> Self {
        match result {
            Ok(_) | Err(Error::VersionConflict(_)) => CallOutcome::Success(latency),
            Err(e) => CallOutcome::Failure {
                connection: e.is_connection_failure(),
                reason: e.to_string(),
            },
        }
    }
}

/// Health tuning, taken from the `[dstore]` section
#[derive(Debug, Clone)]
pub struct HealthSettings {
    pub max_connect_errors: u32,
    pub error_window: Duration,
    pub silence: Duration,
    pub response_time_seconds: u64,
    pub error_seconds: u64,
    pub score_deviation: f64,
    pub response_time_min: f64,
    pub item_size_stats: usize,
}

impl From<&DStoreConfig> for HealthSettings {
    fn from(c: &DStoreConfig) -> Self {
        Self {
            max_connect_errors: c.max_connect_errors.max(1),
            error_window: Duration::from_secs(c.error_seconds),
            silence: c.dial_fail_silence(),
            response_time_seconds: c.response_time_seconds.max(1),
            error_seconds: c.error_seconds.max(1),
            score_deviation: c.score_deviation,
            response_time_min: c.response_time_min,
            item_size_stats: c.item_size_stats,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct Slot {
    second: u64,
    rt_sum_us: u64,
    rt_count: u64,
    errors: u64,
}

/// Ring of one-second slots
#[derive(Debug)]
struct SampleRing {
    slots: Vec<Slot>,
}

impl SampleRing {
    fn new(len: usize) -> Self {
        Self {
            slots: vec![Slot::default(); len.max(1)],
        }
    }

    fn slot_mut(&mut self, second: u64) -> &mut Slot {
        let idx = (second % self.slots.len() as u64) as usize;
        let slot = &mut self.slots[idx];
        if slot.second != second {
            *slot = Slot {
                second,
                ..Slot::default()
            };
        }
        slot
    }

    fn recent(&self, now: u64, window: u64) -> impl Iterator<Item = &Slot> {
        self.slots
            .iter()
            .filter(move |s| s.second <= now && now - s.second < window)
    }

    fn avg_rt_us(&self, now: u64, window: u64) -> f64 {
        let (sum, count) = self
            .recent(now, window)
            .fold((0u64, 0u64), |(sum, count), s| {
                (sum + s.rt_sum_us, count + s.rt_count)
            });
        if count == 0 {
            0.0
        } else {
            sum as f64 / count as f64
        }
    }

    fn errors(&self, now: u64, window: u64) -> u64 {
        self.recent(now, window).map(|s| s.errors).sum()
    }
}

/// Value sizes seen on a node
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct ItemSizeStats {
    pub samples: usize,
    pub avg: u64,
    pub max: u64,
}

/// Health state of a single node
#[derive(Debug)]
pub struct NodeHealth {
    addr: String,
    settings: Arc<HealthSettings>,
    epoch: Instant,

    state: AtomicU8,
    consecutive_failures: AtomicU32,
    streak_start_ms: AtomicU64,
    last_failure_ms: AtomicU64,

    samples: Mutex<SampleRing>,
    item_sizes: Mutex<VecDeque<u64>>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    match m.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

impl NodeHealth {
    pub fn new(addr: impl Into<String>, settings: Arc<HealthSettings>) -> Self {
        let ring = settings
            .response_time_seconds
            .max(settings.error_seconds) as usize;
        Self {
            addr: addr.into(),
            epoch: Instant::now(),
            state: AtomicU8::new(CircuitState::Closed as u8),
            consecutive_failures: AtomicU32::new(0),
            streak_start_ms: AtomicU64::new(0),
            last_failure_ms: AtomicU64::new(0),
            samples: Mutex::new(SampleRing::new(ring)),
            item_sizes: Mutex::new(VecDeque::with_capacity(settings.item_size_stats.min(1024))),
            settings,
        }
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    fn now_second(&self) -> u64 {
        self.epoch.elapsed().as_secs()
    }

    pub fn state(&self) -> CircuitState {
        CircuitState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures.load(Ordering::Relaxed)
    }

    fn silence_elapsed(&self) -> bool {
        let since = self
            .now_ms()
            .saturating_sub(self.last_failure_ms.load(Ordering::Acquire));
        since >= self.settings.silence.as_millis() as u64
    }

    /// May this node be picked for a request right now?
    ///
    /// Does not change state; an open node past its silence period is
    /// routable so that one caller can take the trial request via [`admit`].
    ///
    /// [`admit`]: NodeHealth::admit
    pub fn is_routable(&self) -> bool {
        match self.state() {
            CircuitState::Closed => true,
            CircuitState::HalfOpen => false,
            CircuitState::Open => self.silence_elapsed(),
        }
    }

    /// Ask permission for one call
    pub fn admit(&self) -> Admission {
        match self.state() {
            CircuitState::Closed => Admission::Allowed,
            CircuitState::HalfOpen => Admission::Rejected,
            CircuitState::Open => {
                if !self.silence_elapsed() {
                    return Admission::Rejected;
                }
                match self.state.compare_exchange(
                    CircuitState::Open as u8,
                    CircuitState::HalfOpen as u8,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                ) {
                    Ok(_) => Admission::Trial,
                    Err(_) => Admission::Rejected,
                }
            }
        }
    }

    /// Feed the outcome of one call into the breaker and the sample ring
    pub fn record(&self, outcome: &CallOutcome) {
        match outcome {
            CallOutcome::Success(latency) => self.record_success(*latency),
            CallOutcome::Failure { connection, reason } => {
                self.record_failure(*connection, reason)
            }
        }
    }

    fn record_success(&self, latency: Duration) {
        self.consecutive_failures.store(0, Ordering::Relaxed);
        if self
            .state
            .compare_exchange(
                CircuitState::HalfOpen as u8,
                CircuitState::Closed as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
        {
            info!(node = %self.addr, "trial request succeeded, circuit closed");
        }

        let second = self.now_second();
        let mut ring = lock(&self.samples);
        let slot = ring.slot_mut(second);
        slot.rt_sum_us += latency.as_micros() as u64;
        slot.rt_count += 1;
    }

    fn record_failure(&self, connection: bool, reason: &str) {
        let now = self.now_ms();
        {
            let second = self.now_second();
            let mut ring = lock(&self.samples);
            ring.slot_mut(second).errors += 1;
        }

        if !connection {
            return;
        }

        self.last_failure_ms.store(now, Ordering::Release);

        match self.state() {
            CircuitState::HalfOpen => {
                self.state
                    .store(CircuitState::Open as u8, Ordering::Release);
                warn!(node = %self.addr, error = %reason, "trial request failed, circuit re-opened");
            }
            CircuitState::Open => {}
            CircuitState::Closed => {
                let window = self.settings.error_window.as_millis() as u64;
                let streak_start = self.streak_start_ms.load(Ordering::Acquire);
                let failures = if self.consecutive_failures() == 0
                    || now.saturating_sub(streak_start) > window
                {
                    self.streak_start_ms.store(now, Ordering::Release);
                    self.consecutive_failures.store(1, Ordering::Relaxed);
                    1
                } else {
                    self.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1
                };

                if failures >= self.settings.max_connect_errors
                    && self
                        .state
                        .compare_exchange(
                            CircuitState::Closed as u8,
                            CircuitState::Open as u8,
                            Ordering::AcqRel,
                            Ordering::Acquire,
                        )
                        .is_ok()
                {
                    METRICS.breaker_trips.inc();
                    warn!(
                        node = %self.addr,
                        failures,
                        error = %reason,
                        "circuit opened"
                    );
                }
            }
        }
    }

    /// Record the size of a value served by or written to this node
    pub fn record_item_size(&self, size: usize) {
        let cap = self.settings.item_size_stats;
        if cap == 0 {
            return;
        }
        let mut sizes = lock(&self.item_sizes);
        if sizes.len() >= cap {
            sizes.pop_front();
        }
        sizes.push_back(size as u64);
    }

    pub fn item_size_stats(&self) -> ItemSizeStats {
        let sizes = lock(&self.item_sizes);
        if sizes.is_empty() {
            return ItemSizeStats::default();
        }
        let sum: u64 = sizes.iter().sum();
        ItemSizeStats {
            samples: sizes.len(),
            avg: sum / sizes.len() as u64,
            max: sizes.iter().copied().max().unwrap_or(0),
        }
    }

    /// Mean response time (µs) over the response-time window
    pub fn avg_response_time_us(&self) -> f64 {
        let now = self.now_second();
        lock(&self.samples).avg_rt_us(now, self.settings.response_time_seconds)
    }

    pub fn recent_errors(&self) -> u64 {
        let now = self.now_second();
        lock(&self.samples).errors(now, self.settings.error_seconds)
    }

    /// Lower is healthier
    pub fn score(&self) -> f64 {
        let rt = self
            .avg_response_time_us()
            .max(self.settings.response_time_min);
        (rt / self.settings.score_deviation).floor() + self.recent_errors() as f64
    }

    pub fn status(&self) -> NodeStatus {
        NodeStatus {
            addr: self.addr.clone(),
            state: self.state().to_string(),
            score: self.score(),
            avg_response_time_us: self.avg_response_time_us(),
            recent_errors: self.recent_errors(),
            consecutive_failures: self.consecutive_failures(),
            item_size: self.item_size_stats(),
        }
    }
}

/// Serializable view of a node for the dashboard
#[derive(Debug, Clone, Serialize)]
pub struct NodeStatus {
    pub addr: String,
    pub state: String,
    pub score: f64,
    pub avg_response_time_us: f64,
    pub recent_errors: u64,
    pub consecutive_failures: u32,
    pub item_size: ItemSizeStats,
}

/// Health registry for every node in a route table
#[derive(Debug)]
pub struct NodeHealthMonitor {
    settings: Arc<HealthSettings>,
    nodes: BTreeMap<String, Arc<NodeHealth>>,
}

impl NodeHealthMonitor {
    /// Build a registry for `addrs`, carrying over state from `previous` for
    /// nodes that are still present
    pub fn new(
        settings: HealthSettings,
        addrs: &[String],
        previous: Option<&NodeHealthMonitor>,
    ) -> Self {
        let settings = Arc::new(settings);
        let nodes = addrs
            .iter()
            .map(|addr| {
                let health = previous
                    .and_then(|p| p.nodes.get(addr).cloned())
                    .unwrap_or_else(|| Arc::new(NodeHealth::new(addr.clone(), settings.clone())));
                (addr.clone(), health)
            })
            .collect();
        Self { settings, nodes }
    }

    pub fn settings(&self) -> &HealthSettings {
        &self.settings
    }

    pub fn node(&self, addr: &str) -> Option<&Arc<NodeHealth>> {
        self.nodes.get(addr)
    }

    /// Routable subset of `addrs`, order preserved
    pub fn live<'a>(&self, addrs: &'a [String]) -> Vec<&'a String> {
        addrs
            .iter()
            .filter(|addr| self.nodes.get(*addr).map_or(false, |n| n.is_routable()))
            .collect()
    }

    /// Routable subset of `addrs` ordered by (score, address)
    pub fn rank<'a>(&self, addrs: &'a [String]) -> Vec<&'a String> {
        let mut scored: Vec<(f64, &'a String)> = self
            .live(addrs)
            .into_iter()
            .map(|addr| {
                let score = self.nodes.get(addr).map_or(f64::MAX, |n| n.score());
                (score, addr)
            })
            .collect();
        scored.sort_by(|a, b| a.0.total_cmp(&b.0).then_with(|| a.1.cmp(b.1)));
        scored.into_iter().map(|(_, addr)| addr).collect()
    }

    pub fn status(&self) -> Vec<NodeStatus> {
        self.nodes.values().map(|n| n.status()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(max_errors: u32, silence_ms: u64) -> Arc<HealthSettings> {
        Arc::new(HealthSettings {
            max_connect_errors: max_errors,
            error_window: Duration::from_secs(10),
            silence: Duration::from_millis(silence_ms),
            response_time_seconds: 10,
            error_seconds: 10,
            score_deviation: 10_000.0,
            response_time_min: 4000.0,
            item_size_stats: 4,
        })
    }

    fn fail(node: &NodeHealth, err: Error) {
        node.record(&CallOutcome::of::<()>(&Err(err), Duration::ZERO));
    }

    fn refused() -> Error {
        Error::ConnectionFailed("refused".into())
    }

    fn ok(node: &NodeHealth, latency: Duration) {
        node.record(&CallOutcome::Success(latency));
    }

    #[test]
    fn test_opens_after_consecutive_failures() {
        let node = NodeHealth::new("a:1", settings(3, 60_000));
        fail(&node, refused());
        fail(&node, refused());
        assert_eq!(node.state(), CircuitState::Closed);
        fail(&node, refused());
        assert_eq!(node.state(), CircuitState::Open);
        assert!(!node.is_routable());
        assert_eq!(node.admit(), Admission::Rejected);
    }

    #[test]
    fn test_success_resets_streak() {
        let node = NodeHealth::new("a:1", settings(3, 60_000));
        fail(&node, refused());
        fail(&node, refused());
        ok(&node, Duration::from_millis(1));
        fail(&node, refused());
        assert_eq!(node.state(), CircuitState::Closed);
        assert_eq!(node.consecutive_failures(), 1);
    }

    #[test]
    fn test_non_connection_errors_do_not_trip() {
        let node = NodeHealth::new("a:1", settings(1, 60_000));
        fail(&node, Error::Protocol("garbage".into()));
        assert_eq!(node.state(), CircuitState::Closed);
        assert_eq!(node.recent_errors(), 1);
    }

    #[test]
    fn test_half_open_single_trial() {
        let node = NodeHealth::new("a:1", settings(1, 0));
        fail(&node, refused());
        assert_eq!(node.state(), CircuitState::Open);
        assert!(node.is_routable());

        assert_eq!(node.admit(), Admission::Trial);
        assert_eq!(node.state(), CircuitState::HalfOpen);
        assert_eq!(node.admit(), Admission::Rejected);
        assert!(!node.is_routable());

        ok(&node, Duration::from_millis(2));
        assert_eq!(node.state(), CircuitState::Closed);
        assert_eq!(node.admit(), Admission::Allowed);
    }

    #[test]
    fn test_trial_failure_reopens() {
        let node = NodeHealth::new("a:1", settings(1, 60_000));
        fail(&node, refused());
        // Force the trial request regardless of the silence timer
        node.state
            .store(CircuitState::HalfOpen as u8, Ordering::Release);
        fail(&node, Error::Timeout("read".into()));
        assert_eq!(node.state(), CircuitState::Open);
        assert_eq!(node.admit(), Admission::Rejected);
    }

    #[test]
    fn test_score() {
        let node = NodeHealth::new("a:1", settings(10, 0));
        // No samples: the floor applies and 4000 / 10000 rounds down
        assert_eq!(node.score(), 0.0);

        ok(&node, Duration::from_millis(25));
        ok(&node, Duration::from_millis(35));
        // mean 30ms = 30000µs → 3
        assert_eq!(node.score(), 3.0);

        fail(&node, Error::Protocol("x".into()));
        assert_eq!(node.score(), 4.0);
    }

    #[test]
    fn test_item_size_window() {
        let node = NodeHealth::new("a:1", settings(10, 0));
        for size in [10, 20, 30, 40, 100] {
            node.record_item_size(size);
        }
        let stats = node.item_size_stats();
        assert_eq!(stats.samples, 4);
        assert_eq!(stats.max, 100);
        assert_eq!(stats.avg, 47);
    }

    #[test]
    fn test_monitor_rank_and_carry_over() {
        let addrs = vec!["b:1".to_string(), "a:1".to_string(), "c:1".to_string()];
        let base = HealthSettings::from(&DStoreConfig::default());
        let monitor = NodeHealthMonitor::new(base.clone(), &addrs, None);

        // Equal scores: address order
        let ranked = monitor.rank(&addrs);
        assert_eq!(ranked, vec!["a:1", "b:1", "c:1"]);

        // Slow node sorts last
        ok(monitor.node("a:1").unwrap(), Duration::from_millis(50));
        let ranked = monitor.rank(&addrs);
        assert_eq!(ranked, vec!["b:1", "c:1", "a:1"]);

        let next = NodeHealthMonitor::new(base, &addrs[..2], Some(&monitor));
        assert!(Arc::ptr_eq(
            next.node("a:1").unwrap(),
            monitor.node("a:1").unwrap()
        ));
        assert!(next.node("c:1").is_none());
    }
}
