use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use metrics::{counter, gauge};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info, warn};

const ESTIMATOR_SHARE_GAUGE: &str = "namespace_limiter_estimator_share";
const ESTIMATOR_ACTIVE_INSTANCES_GAUGE: &str = "namespace_limiter_estimator_active_instances";
const ESTIMATOR_TRANSITIONS_COUNTER: &str = "namespace_limiter_estimator_transitions_total";
const ESTIMATOR_DEPARTED_PEERS_COUNTER: &str = "namespace_limiter_estimator_departed_peers_total";

/// Admission counts of one instance for one namespace over one reporting window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageReport {
    pub namespace: String,
    pub instance_id: String,
    pub admitted: u64,
    pub rejected: u64,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
}

impl UsageReport {
    pub fn total(&self) -> u64 {
        self.admitted.saturating_add(self.rejected)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EstimatorState {
    /// No peer data yet, this instance acts as the only one.
    Bootstrapping,
    /// Fresh peer reports are available and the local rate follows the share.
    Converged,
    /// Peers were seen but none reported within the freshness window.
    Degraded,
}

impl EstimatorState {
    pub fn as_str(&self) -> &'static str {
        match self {
            EstimatorState::Bootstrapping => "bootstrapping",
            EstimatorState::Converged => "converged",
            EstimatorState::Degraded => "degraded",
        }
    }
}

/// This instance's view of its part of a namespace's global traffic.
#[derive(Debug, Clone, PartialEq)]
pub struct ShareEstimate {
    pub namespace: String,
    pub active_instances: usize,
    /// Raw traffic share in `[0, 1]`, before the floor is applied.
    pub share: f64,
    /// Time since the last new peer report, `None` if no peer was ever heard from.
    pub staleness: Option<Duration>,
    pub state: EstimatorState,
}

impl ShareEstimate {
    fn sole_instance(namespace: &str, state: EstimatorState) -> Self {
        Self {
            namespace: namespace.to_string(),
            active_instances: 1,
            share: 1.0,
            staleness: None,
            state,
        }
    }
}

#[derive(Debug, Clone)]
pub struct EstimatorConfig {
    /// How often reports are emitted and peers collected.
    pub report_interval: Duration,
    /// Maximum age of the newest report of a peer for it to count.
    pub freshness_window: Duration,
    /// Consecutive stale rounds after which a peer is considered departed.
    pub max_stale_windows: u32,
    /// Lower bound on the fraction of the target granted to this instance.
    pub share_floor: f64,
    /// How long a departed peer's last window is remembered.
    pub departed_retention: Duration,
}

impl Default for EstimatorConfig {
    fn default() -> Self {
        Self {
            report_interval: Duration::from_secs(5),
            freshness_window: Duration::from_secs(15),
            max_stale_windows: 3,
            share_floor: 0.01,
            departed_retention: Duration::from_secs(300),
        }
    }
}

#[derive(Debug)]
struct PeerEntry {
    report: UsageReport,
    received_at: Instant,
    stale_windows: u32,
}

#[derive(Debug)]
struct Tombstone {
    window_end: DateTime<Utc>,
    departed_at: Instant,
}

#[derive(Debug)]
struct EstimatorInner {
    window_start: DateTime<Utc>,
    peers: HashMap<String, PeerEntry>,
    tombstones: HashMap<String, Tombstone>,
    last_peer_contact: Option<Instant>,
    estimate: ShareEstimate,
}

impl EstimatorInner {
    /// Keeps the newest report per peer. Returns whether the report carried new data.
    fn observe(&mut self, report: UsageReport, now: Instant) -> bool {
        if let Some(tombstone) = self.tombstones.get(&report.instance_id) {
            if report.window_end <= tombstone.window_end {
                return false;
            }
            self.tombstones.remove(&report.instance_id);
        }

        match self.peers.get_mut(&report.instance_id) {
            Some(entry) if report.window_end <= entry.report.window_end => return false,
            Some(entry) => {
                entry.report = report;
                entry.received_at = now;
                entry.stale_windows = 0;
            }
            None => {
                self.peers.insert(
                    report.instance_id.clone(),
                    PeerEntry {
                        report,
                        received_at: now,
                        stale_windows: 0,
                    },
                );
            }
        }
        self.last_peer_contact = Some(now);
        true
    }
}

/// Estimates this instance's share of one namespace's traffic across the fleet.
///
/// The admission path only touches atomics: `record` adds to the window counters and
/// `rate_multiplier` reads the current scale factor. Everything else happens in
/// `reconcile`, driven by the background reconciler.
#[derive(Debug)]
pub struct GlobalUsageEstimator {
    namespace: String,
    instance_id: String,
    config: EstimatorConfig,
    admitted: AtomicU64,
    rejected: AtomicU64,
    multiplier: AtomicU64,
    inner: Mutex<EstimatorInner>,
}

impl GlobalUsageEstimator {
    pub fn new(
        namespace: impl Into<String>,
        instance_id: impl Into<String>,
        config: EstimatorConfig,
    ) -> Self {
        let namespace = namespace.into();
        let estimate = ShareEstimate::sole_instance(&namespace, EstimatorState::Bootstrapping);
        Self {
            instance_id: instance_id.into(),
            config,
            admitted: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
            multiplier: AtomicU64::new(1.0f64.to_bits()),
            inner: Mutex::new(EstimatorInner {
                window_start: Utc::now(),
                peers: HashMap::new(),
                tombstones: HashMap::new(),
                last_peer_contact: None,
                estimate,
            }),
            namespace,
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub fn config(&self) -> &EstimatorConfig {
        &self.config
    }

    /// Count an admission decision, in cost units.
    pub fn record(&self, admitted: bool, cost: u32) {
        let counter = if admitted {
            &self.admitted
        } else {
            &self.rejected
        };
        counter.fetch_add(u64::from(cost), Ordering::Relaxed);
    }

    /// Factor applied to the target rate, in `[share_floor, 1]`.
    pub fn rate_multiplier(&self) -> f64 {
        f64::from_bits(self.multiplier.load(Ordering::Acquire))
    }

    pub fn state(&self) -> EstimatorState {
        self.lock_inner().estimate.state
    }

    /// The estimate produced by the last `reconcile`.
    pub fn estimate(&self) -> ShareEstimate {
        self.lock_inner().estimate.clone()
    }

    /// Drain the window counters into a report ending at `now`.
    pub fn take_report(&self, now: DateTime<Utc>) -> UsageReport {
        let mut inner = self.lock_inner();
        let window_start = inner.window_start;
        let window_end = now.max(window_start);
        inner.window_start = window_end;

        UsageReport {
            namespace: self.namespace.clone(),
            instance_id: self.instance_id.clone(),
            admitted: self.admitted.swap(0, Ordering::Relaxed),
            rejected: self.rejected.swap(0, Ordering::Relaxed),
            window_start,
            window_end,
        }
    }

    /// Fold the latest peer reports into the estimate and update the rate multiplier.
    ///
    /// `own` is the report this instance just emitted. Reports for other namespaces or
    /// from this instance are ignored.
    pub fn reconcile(&self, own: &UsageReport, peers: Vec<UsageReport>, now: Instant) -> ShareEstimate {
        let mut guard = self.lock_inner();
        let inner = &mut *guard;

        let retention = self.config.departed_retention;
        inner
            .tombstones
            .retain(|_, tombstone| now.saturating_duration_since(tombstone.departed_at) < retention);

        for report in peers {
            if report.namespace != self.namespace || report.instance_id == self.instance_id {
                continue;
            }
            inner.observe(report, now);
        }

        let mut fresh_peers = 0usize;
        let mut fresh_total = 0u64;
        let mut departed = Vec::new();
        for (instance_id, entry) in inner.peers.iter_mut() {
            if now.saturating_duration_since(entry.received_at) <= self.config.freshness_window {
                fresh_peers += 1;
                fresh_total = fresh_total.saturating_add(entry.report.total());
            } else {
                entry.stale_windows += 1;
                if entry.stale_windows >= self.config.max_stale_windows {
                    departed.push(instance_id.clone());
                }
            }
        }

        for instance_id in departed {
            if let Some(entry) = inner.peers.remove(&instance_id) {
                info!(
                    namespace = %self.namespace,
                    peer = %instance_id,
                    stale_windows = entry.stale_windows,
                    "peer departed"
                );
                counter!(ESTIMATOR_DEPARTED_PEERS_COUNTER, "namespace" => self.namespace.clone())
                    .increment(1);
                inner.tombstones.insert(
                    instance_id,
                    Tombstone {
                        window_end: entry.report.window_end,
                        departed_at: now,
                    },
                );
            }
        }

        let previous = inner.estimate.state;
        let own_total = own.total();
        let (state, share, active_instances) = if fresh_peers > 0 {
            let instances = fresh_peers + 1;
            let denominator = own_total.saturating_add(fresh_total);
            let share = if denominator == 0 {
                1.0 / instances as f64
            } else {
                own_total as f64 / denominator as f64
            };
            (EstimatorState::Converged, share, instances)
        } else if matches!(
            previous,
            EstimatorState::Converged | EstimatorState::Degraded
        ) {
            (EstimatorState::Degraded, 1.0, 1)
        } else {
            (EstimatorState::Bootstrapping, 1.0, 1)
        };

        let multiplier = match state {
            EstimatorState::Converged => share.max(self.share_floor()).min(1.0),
            EstimatorState::Bootstrapping | EstimatorState::Degraded => 1.0,
        };
        self.multiplier.store(multiplier.to_bits(), Ordering::Release);

        let estimate = ShareEstimate {
            namespace: self.namespace.clone(),
            active_instances,
            share,
            staleness: inner
                .last_peer_contact
                .map(|contact| now.saturating_duration_since(contact)),
            state,
        };
        inner.estimate = estimate.clone();
        drop(guard);

        if state != previous {
            self.report_transition(previous, &estimate);
        }
        debug!(
            namespace = %self.namespace,
            share,
            multiplier,
            active_instances,
            "usage reconciled"
        );
        gauge!(ESTIMATOR_SHARE_GAUGE, "namespace" => self.namespace.clone()).set(share);
        gauge!(ESTIMATOR_ACTIVE_INSTANCES_GAUGE, "namespace" => self.namespace.clone())
            .set(active_instances as f64);

        estimate
    }

    fn share_floor(&self) -> f64 {
        let floor = self.config.share_floor;
        if floor.is_nan() {
            0.0
        } else {
            floor.clamp(0.0, 1.0)
        }
    }

    fn report_transition(&self, previous: EstimatorState, estimate: &ShareEstimate) {
        counter!(
            ESTIMATOR_TRANSITIONS_COUNTER,
            "namespace" => self.namespace.clone(),
            "state" => estimate.state.as_str()
        )
        .increment(1);

        match estimate.state {
            EstimatorState::Degraded => warn!(
                namespace = %self.namespace,
                from = previous.as_str(),
                staleness_ms = estimate.staleness.map(|s| s.as_millis() as u64),
                "usage estimator degraded, no fresh peer reports"
            ),
            _ => info!(
                namespace = %self.namespace,
                from = previous.as_str(),
                to = estimate.state.as_str(),
                active_instances = estimate.active_instances,
                "usage estimator state changed"
            ),
        }
    }

    fn lock_inner(&self) -> MutexGuard<'_, EstimatorInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000 + secs, 0).unwrap()
    }

    fn report(namespace: &str, instance_id: &str, admitted: u64, end: i64) -> UsageReport {
        UsageReport {
            namespace: namespace.to_string(),
            instance_id: instance_id.to_string(),
            admitted,
            rejected: 0,
            window_start: at(end - 5),
            window_end: at(end),
        }
    }

    fn estimator() -> GlobalUsageEstimator {
        GlobalUsageEstimator::new("acme", "instance-a", EstimatorConfig::default())
    }

    #[test]
    fn test_starts_bootstrapping_at_full_rate() {
        let estimator = estimator();
        assert_eq!(estimator.state(), EstimatorState::Bootstrapping);
        assert_eq!(estimator.rate_multiplier(), 1.0);

        let estimate = estimator.estimate();
        assert_eq!(estimate.active_instances, 1);
        assert_eq!(estimate.staleness, None);
    }

    #[test]
    fn test_take_report_drains_counts() {
        let estimator = estimator();
        estimator.record(true, 1);
        estimator.record(true, 4);
        estimator.record(false, 2);
        estimator.record(true, 0);

        let first = estimator.take_report(at(5));
        assert_eq!(first.admitted, 5);
        assert_eq!(first.rejected, 2);
        assert_eq!(first.total(), 7);
        assert_eq!(first.window_end, at(5));

        let second = estimator.take_report(at(10));
        assert_eq!(second.total(), 0);
        assert_eq!(second.window_start, at(5));
        assert_eq!(second.window_end, at(10));
    }

    #[test]
    fn test_window_end_never_precedes_window_start() {
        let estimator = estimator();
        estimator.take_report(at(10));
        let report = estimator.take_report(at(3));
        assert_eq!(report.window_start, at(10));
        assert_eq!(report.window_end, at(10));
    }

    #[test]
    fn test_no_peers_stays_bootstrapping() {
        let estimator = estimator();
        let now = Instant::now();
        let own = report("acme", "instance-a", 10, 5);

        let estimate = estimator.reconcile(&own, vec![], now);
        assert_eq!(estimate.state, EstimatorState::Bootstrapping);
        assert_eq!(estimate.share, 1.0);
        assert_eq!(estimator.rate_multiplier(), 1.0);
    }

    #[test]
    fn test_even_traffic_splits_in_half() {
        let estimator = estimator();
        let own = report("acme", "instance-a", 50, 5);
        let peer = report("acme", "instance-b", 50, 5);

        let estimate = estimator.reconcile(&own, vec![peer], Instant::now());
        assert_eq!(estimate.state, EstimatorState::Converged);
        assert_eq!(estimate.active_instances, 2);
        assert_eq!(estimate.share, 0.5);
        assert_eq!(estimator.rate_multiplier(), 0.5);
        assert_eq!(estimate.staleness, Some(Duration::ZERO));
    }

    #[test]
    fn test_multiplier_never_drops_below_floor() {
        let estimator = estimator();
        let own = report("acme", "instance-a", 1, 5);
        let peer = report("acme", "instance-b", 1_000_000, 5);

        let estimate = estimator.reconcile(&own, vec![peer], Instant::now());
        assert!(estimate.share < 0.01);
        assert_eq!(estimator.rate_multiplier(), 0.01);

        let idle = report("acme", "instance-a", 0, 10);
        let busy = report("acme", "instance-b", 500, 10);
        estimator.reconcile(&idle, vec![busy], Instant::now());
        assert_eq!(estimator.rate_multiplier(), 0.01);
    }

    #[test]
    fn test_idle_fleet_splits_evenly() {
        let estimator = estimator();
        let own = report("acme", "instance-a", 0, 5);
        let peers = vec![
            report("acme", "instance-b", 0, 5),
            report("acme", "instance-c", 0, 5),
            report("acme", "instance-d", 0, 5),
        ];

        let estimate = estimator.reconcile(&own, peers, Instant::now());
        assert_eq!(estimate.active_instances, 4);
        assert_eq!(estimate.share, 0.25);
        assert_eq!(estimator.rate_multiplier(), 0.25);
    }

    #[test]
    fn test_ignores_own_and_foreign_reports() {
        let estimator = estimator();
        let own = report("acme", "instance-a", 10, 5);
        let peers = vec![
            report("acme", "instance-a", 90, 5),
            report("beta", "instance-b", 90, 5),
        ];

        let estimate = estimator.reconcile(&own, peers, Instant::now());
        assert_eq!(estimate.state, EstimatorState::Bootstrapping);
        assert_eq!(estimate.active_instances, 1);
    }

    #[test]
    fn test_older_peer_report_does_not_replace_newer() {
        let estimator = estimator();
        let t0 = Instant::now();

        estimator.reconcile(
            &report("acme", "instance-a", 50, 10),
            vec![report("acme", "instance-b", 150, 10)],
            t0,
        );
        let estimate = estimator.reconcile(
            &report("acme", "instance-a", 50, 15),
            vec![report("acme", "instance-b", 50, 5)],
            t0 + Duration::from_secs(5),
        );
        assert_eq!(estimate.share, 0.25);
    }

    #[test]
    fn test_stale_peer_degrades_to_full_rate() {
        let estimator = estimator();
        let t0 = Instant::now();
        let peer = report("acme", "instance-b", 50, 5);

        estimator.reconcile(&report("acme", "instance-a", 50, 5), vec![peer.clone()], t0);
        assert_eq!(estimator.state(), EstimatorState::Converged);

        // The exchange keeps returning the same report, which carries no new data
        let within = t0 + Duration::from_secs(10);
        estimator.reconcile(&report("acme", "instance-a", 50, 15), vec![peer.clone()], within);
        assert_eq!(estimator.state(), EstimatorState::Converged);

        let after = t0 + Duration::from_secs(16);
        let estimate = estimator.reconcile(&report("acme", "instance-a", 50, 21), vec![peer], after);
        assert_eq!(estimate.state, EstimatorState::Degraded);
        assert_eq!(estimate.staleness, Some(Duration::from_secs(16)));
        assert_eq!(estimator.rate_multiplier(), 1.0);
    }

    #[test]
    fn test_degraded_recovers_on_fresh_report() {
        let estimator = estimator();
        let t0 = Instant::now();

        estimator.reconcile(
            &report("acme", "instance-a", 50, 5),
            vec![report("acme", "instance-b", 50, 5)],
            t0,
        );
        estimator.reconcile(&report("acme", "instance-a", 50, 25), vec![], t0 + Duration::from_secs(20));
        assert_eq!(estimator.state(), EstimatorState::Degraded);

        let estimate = estimator.reconcile(
            &report("acme", "instance-a", 30, 30),
            vec![report("acme", "instance-b", 10, 30)],
            t0 + Duration::from_secs(25),
        );
        assert_eq!(estimate.state, EstimatorState::Converged);
        assert_eq!(estimator.rate_multiplier(), 0.75);
    }

    #[test]
    fn test_departed_peer_cannot_be_resurrected_by_old_report() {
        let config = EstimatorConfig {
            max_stale_windows: 2,
            ..Default::default()
        };
        let estimator = GlobalUsageEstimator::new("acme", "instance-a", config);
        let t0 = Instant::now();
        let peer = report("acme", "instance-b", 50, 5);

        estimator.reconcile(&report("acme", "instance-a", 50, 5), vec![peer.clone()], t0);
        for round in 1..=2 {
            let now = t0 + Duration::from_secs(15 + round * 5);
            estimator.reconcile(&report("acme", "instance-a", 50, 5), vec![], now);
        }
        assert_eq!(estimator.state(), EstimatorState::Degraded);

        // Same window as before the departure: ignored
        let now = t0 + Duration::from_secs(30);
        let estimate = estimator.reconcile(&report("acme", "instance-a", 50, 30), vec![peer], now);
        assert_eq!(estimate.state, EstimatorState::Degraded);

        // A newer window means the peer is back
        let estimate = estimator.reconcile(
            &report("acme", "instance-a", 50, 35),
            vec![report("acme", "instance-b", 50, 35)],
            now + Duration::from_secs(5),
        );
        assert_eq!(estimate.state, EstimatorState::Converged);
        assert_eq!(estimate.active_instances, 2);
    }

    #[test]
    fn test_usage_report_serde_shape() {
        let report = report("acme", "instance-a", 3, 5);
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["namespace"], "acme");
        assert_eq!(json["instance_id"], "instance-a");
        assert_eq!(json["admitted"], 3);

        let parsed: UsageReport = serde_json::from_value(json).unwrap();
        assert_eq!(parsed, report);
    }
}
