use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use limiters::{
    Controller, EstimatorState, LimiterConfig, MemoryExchange, PeerExchange, RateConfig, Request,
    RequestRateLimiter, StaticRates, UsageReconciler, WaitError,
};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Rate config whose lookups can be switched off, like a configuration store outage.
#[derive(Default)]
struct FlakyRates {
    rate: Mutex<Option<f64>>,
}

impl FlakyRates {
    fn set(&self, rate: Option<f64>) {
        *self.rate.lock().unwrap() = rate;
    }
}

impl RateConfig for FlakyRates {
    fn current_rate(&self, _namespace: &str) -> Option<f64> {
        *self.rate.lock().unwrap()
    }
}

fn config(instance_id: &str) -> LimiterConfig {
    LimiterConfig {
        instance_id: instance_id.to_string(),
        ..Default::default()
    }
}

fn request(namespace: &str) -> Request {
    Request::new("StartWorkflowExecution", namespace)
}

#[test]
fn test_single_instance_burst_and_refill() {
    let controller = Controller::new(config("instance-a"), Arc::new(StaticRates::new(10.0)));
    let acme = controller.get("acme");
    let t0 = Instant::now();

    for _ in 0..10 {
        assert!(acme.allow(t0, &request("acme")));
    }
    assert!(!acme.allow(t0, &request("acme")));

    assert!(acme.allow(t0 + Duration::from_secs(1), &request("acme")));
    assert_eq!(acme.estimate().state, EstimatorState::Bootstrapping);
}

#[tokio::test]
async fn test_two_instances_converge_on_half_the_target() {
    let exchange = MemoryExchange::new();
    let rates = Arc::new(StaticRates::new(100.0));
    let a = Controller::new(config("instance-a"), rates.clone());
    let b = Controller::new(config("instance-b"), rates);
    let now = Instant::now();

    for controller in [&a, &b] {
        let limiter = controller.get("acme");
        for _ in 0..50 {
            assert!(limiter.allow(now, &request("acme")));
        }
    }

    // Both instances publish the same window before either collects
    let window_end = Utc::now();
    let reports: Vec<_> = [&a, &b]
        .iter()
        .map(|controller| controller.get("acme").estimator().take_report(window_end))
        .collect();
    for report in &reports {
        assert_eq!(report.admitted, 50);
        assert_eq!(report.rejected, 0);
        exchange.publish(report).await.unwrap();
    }

    for (controller, own) in [&a, &b].iter().zip(&reports) {
        let limiter = controller.get("acme");
        let peers = exchange.collect("acme").await.unwrap();
        let estimate = limiter.estimator().reconcile(own, peers, Instant::now());

        assert_eq!(estimate.state, EstimatorState::Converged);
        assert_eq!(estimate.active_instances, 2);
        assert_eq!(estimate.share, 0.5);
        assert_eq!(limiter.rate(), 50.0);
        assert_eq!(limiter.target_rate(), 100.0);
    }
}

#[tokio::test]
async fn test_silent_peer_degrades_to_full_target() {
    let exchange = MemoryExchange::new();
    let rates = Arc::new(StaticRates::new(100.0));
    let a = Controller::new(config("instance-a"), rates.clone());
    let b = Controller::new(config("instance-b"), rates);
    let beta_a = a.get("beta");
    let beta_b = b.get("beta");
    let t0 = Instant::now();

    for _ in 0..20 {
        beta_a.allow(t0, &request("beta"));
        beta_b.allow(t0, &request("beta"));
    }
    let report_b = beta_b.estimator().take_report(Utc::now());
    exchange.publish(&report_b).await.unwrap();

    let own = beta_a.estimator().take_report(Utc::now());
    let peers = exchange.collect("beta").await.unwrap();
    beta_a.estimator().reconcile(&own, peers, t0);
    assert_eq!(beta_a.estimate().state, EstimatorState::Converged);
    assert!(beta_a.rate() < 100.0);

    // Instance b stops reporting; the exchange still returns its last report
    let freshness = a.config().estimator.freshness_window;
    let later = t0 + freshness + Duration::from_secs(1);
    let own = beta_a.estimator().take_report(Utc::now());
    let peers = exchange.collect("beta").await.unwrap();
    let estimate = beta_a.estimator().reconcile(&own, peers, later);

    assert_eq!(estimate.state, EstimatorState::Degraded);
    assert_eq!(beta_a.rate(), 100.0);
}

#[test]
fn test_rate_source_outage_keeps_last_rate() {
    let rates = Arc::new(FlakyRates::default());
    rates.set(Some(5.0));
    let controller = Controller::new(config("instance-a"), rates.clone());
    let limiter = controller.get("acme");
    let t0 = Instant::now();

    for _ in 0..5 {
        assert!(limiter.allow(t0, &request("acme")));
    }
    rates.set(None);

    for second in 1..=10u64 {
        let now = t0 + Duration::from_secs(second);
        let admitted = (0..10).filter(|_| limiter.allow(now, &request("acme"))).count();
        assert_eq!(admitted, 5, "second {second}");
    }
    assert_eq!(limiter.rate(), 5.0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn test_concurrent_first_get_builds_one_limiter() {
    let controller = Arc::new(Controller::new(
        config("instance-a"),
        Arc::new(StaticRates::new(10.0)),
    ));

    let handles: Vec<_> = (0..64)
        .map(|_| {
            let controller = controller.clone();
            tokio::spawn(async move { controller.get("acme") })
        })
        .collect();

    let mut limiters = Vec::new();
    for handle in handles {
        limiters.push(handle.await.unwrap());
    }
    assert!(limiters.iter().all(|l| Arc::ptr_eq(l, &limiters[0])));
    assert_eq!(controller.len(), 1);

    // One bucket: the whole fleet of callers shares a single burst of 10
    let now = Instant::now();
    let admitted = limiters
        .iter()
        .filter(|l| l.allow(now, &request("acme")))
        .count();
    assert_eq!(admitted, 10);
}

#[tokio::test]
async fn test_wait_with_cancelled_signal_consumes_nothing() {
    let controller = Controller::new(config("instance-a"), Arc::new(StaticRates::new(3.0)));
    let limiter = controller.get("acme");
    let cancel = CancellationToken::new();
    cancel.cancel();

    assert_eq!(
        limiter.wait(&cancel, &request("acme")).await,
        Err(WaitError::Cancelled)
    );

    let now = Instant::now();
    let admitted = (0..5).filter(|_| limiter.allow(now, &request("acme"))).count();
    assert_eq!(admitted, 3);
}

#[tokio::test(start_paused = true)]
async fn test_reconciler_loop_rebalances_fleet() {
    let exchange = MemoryExchange::new();
    let rates = Arc::new(StaticRates::new(100.0));
    let a = Arc::new(Controller::new(config("instance-a"), rates.clone()));
    let b = Arc::new(Controller::new(config("instance-b"), rates));
    let cancel = CancellationToken::new();

    let mut tasks = Vec::new();
    for controller in [&a, &b] {
        controller.get("acme");
        let reconciler = UsageReconciler::new(
            controller.clone(),
            Arc::new(exchange.clone()),
            Duration::from_millis(100),
        );
        let cancel = cancel.clone();
        tasks.push(tokio::spawn(async move { reconciler.run(cancel).await }));
    }

    // Instance a carries three times the traffic of b
    for _ in 0..6 {
        let now = Instant::now();
        for _ in 0..30 {
            a.get("acme").allow(now, &request("acme"));
        }
        for _ in 0..10 {
            b.get("acme").allow(now, &request("acme"));
        }
        tokio::time::sleep(Duration::from_secs(5)).await;
    }

    let estimate_a = a.get("acme").estimate();
    let estimate_b = b.get("acme").estimate();
    assert_eq!(estimate_a.state, EstimatorState::Converged);
    assert_eq!(estimate_b.state, EstimatorState::Converged);
    assert!(estimate_a.share > estimate_b.share);
    assert!(a.get("acme").rate() + b.get("acme").rate() <= 100.0 + 1e-9);

    cancel.cancel();
    for task in tasks {
        task.await.unwrap();
    }
}
