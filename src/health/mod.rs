// # Health Aggregator
//
// A registry of named checks executed in parallel, each bounded by its own
// timeout (defaulting to the aggregate budget, never exceeding it). One
// slow check can never delay the report past the caller's deadline: it is
// reported as FAIL with a timeout message instead. A bounded history ring
// per check supports flap diagnosis.

use crate::concurrent::{topics, EventBus};
use crate::error::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

const HISTORY_DEPTH: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CheckStatus {
    Ok,
    Degraded,
    Fail,
}

/// What a check reports about itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckOutcome {
    pub status: CheckStatus,
    pub message: Option<String>,
}

impl CheckOutcome {
    pub fn ok() -> Self {
        Self {
            status: CheckStatus::Ok,
            message: None,
        }
    }

    pub fn degraded(message: &str) -> Self {
        Self {
            status: CheckStatus::Degraded,
            message: Some(message.to_string()),
        }
    }

    pub fn fail(message: &str) -> Self {
        Self {
            status: CheckStatus::Fail,
            message: Some(message.to_string()),
        }
    }
}

/// One named probe.
#[async_trait]
pub trait HealthCheck: Send + Sync {
    fn name(&self) -> &str;
    async fn check(&self) -> Result<CheckOutcome>;
}

/// A check result inside a report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckResult {
    pub name: String,
    pub status: CheckStatus,
    pub latency_ms: u64,
    pub message: Option<String>,
}

/// The aggregate report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    pub overall: CheckStatus,
    pub checks: Vec<CheckResult>,
    pub generated_at: DateTime<Utc>,
    pub duration_ms: u64,
}

struct RegisteredCheck {
    check: Arc<dyn HealthCheck>,
    /// Per-check budget; capped at the aggregate budget at run time
    timeout: Option<Duration>,
}

/// The aggregator.
pub struct HealthAggregator {
    checks: RwLock<Vec<RegisteredCheck>>,
    history: Mutex<HashMap<String, VecDeque<CheckStatus>>>,
    bus: Option<Arc<EventBus>>,
}

impl HealthAggregator {
    pub fn new(bus: Option<Arc<EventBus>>) -> Self {
        Self {
            checks: RwLock::new(Vec::new()),
            history: Mutex::new(HashMap::new()),
            bus,
        }
    }

    /// Register a check, optionally with a tighter timeout than the
    /// aggregate budget.
    pub fn register(&self, check: Arc<dyn HealthCheck>, timeout: Option<Duration>) {
        self.checks.write().push(RegisteredCheck { check, timeout });
    }

    pub fn check_count(&self) -> usize {
        self.checks.read().len()
    }

    /// Run every check in parallel within `budget`.
    pub async fn run_all(&self, budget: Duration) -> HealthReport {
        let started = Instant::now();
        let snapshot: Vec<(Arc<dyn HealthCheck>, Duration)> = self
            .checks
            .read()
            .iter()
            .map(|rc| {
                let per_check = rc.timeout.map(|t| t.min(budget)).unwrap_or(budget);
                (Arc::clone(&rc.check), per_check)
            })
            .collect();

        let probes = snapshot.into_iter().map(|(check, per_check)| async move {
            let name = check.name().to_string();
            let probe_started = Instant::now();
            let outcome = tokio::time::timeout(per_check, check.check()).await;
            let latency_ms = probe_started.elapsed().as_millis() as u64;
            match outcome {
                Ok(Ok(result)) => CheckResult {
                    name,
                    status: result.status,
                    latency_ms,
                    message: result.message,
                },
                Ok(Err(e)) => CheckResult {
                    name,
                    status: CheckStatus::Fail,
                    latency_ms,
                    message: Some(e.to_string()),
                },
                Err(_) => CheckResult {
                    name,
                    status: CheckStatus::Fail,
                    latency_ms,
                    message: Some(format!("timed out after {:?}", per_check)),
                },
            }
        });
        let checks = join_all(probes).await;

        let overall = checks
            .iter()
            .map(|c| c.status)
            .max_by_key(|s| match s {
                CheckStatus::Ok => 0,
                CheckStatus::Degraded => 1,
                CheckStatus::Fail => 2,
            })
            .unwrap_or(CheckStatus::Ok);

        {
            let mut history = self.history.lock();
            for check in &checks {
                let ring = history.entry(check.name.clone()).or_default();
                if ring.len() >= HISTORY_DEPTH {
                    ring.pop_front();
                }
                ring.push_back(check.status);
            }
        }

        let report = HealthReport {
            overall,
            checks,
            generated_at: Utc::now(),
            duration_ms: started.elapsed().as_millis() as u64,
        };
        if let Some(bus) = &self.bus {
            bus.emit(
                topics::HEALTH_REPORT,
                "health",
                serde_json::to_value(&report).unwrap_or_default(),
            );
        }
        report
    }

    /// Recent status history for one check, oldest first.
    pub fn history(&self, name: &str) -> Vec<CheckStatus> {
        self.history
            .lock()
            .get(name)
            .map(|ring| ring.iter().copied().collect())
            .unwrap_or_default()
    }
}

// ============================================================================
// Built-in checks
// ============================================================================

/// Pings one pooled connection.
pub struct ConnectionPingCheck {
    name: String,
    pool: Arc<crate::pool::ConnectionPool>,
}

impl ConnectionPingCheck {
    pub fn new(pool: Arc<crate::pool::ConnectionPool>) -> Self {
        Self {
            name: format!("connection:{}", pool.name()),
            pool,
        }
    }
}

#[async_trait]
impl HealthCheck for ConnectionPingCheck {
    fn name(&self) -> &str {
        &self.name
    }

    async fn check(&self) -> Result<CheckOutcome> {
        match self.pool.ping().await {
            Ok(latency) if latency < Duration::from_millis(250) => Ok(CheckOutcome::ok()),
            Ok(latency) => Ok(CheckOutcome::degraded(&format!(
                "slow ping: {:?}",
                latency
            ))),
            Err(e) => Ok(CheckOutcome::fail(&e.to_string())),
        }
    }
}

/// Verifies a directory is writable by round-tripping a probe file.
pub struct FilesystemWritableCheck {
    name: String,
    dir: std::path::PathBuf,
}

impl FilesystemWritableCheck {
    pub fn new(dir: std::path::PathBuf) -> Self {
        Self {
            name: format!("fs:{}", dir.display()),
            dir,
        }
    }
}

#[async_trait]
impl HealthCheck for FilesystemWritableCheck {
    fn name(&self) -> &str {
        &self.name
    }

    async fn check(&self) -> Result<CheckOutcome> {
        let probe = self.dir.join(".steward-health-probe");
        match tokio::fs::write(&probe, b"ok").await {
            Ok(()) => {
                let _ = tokio::fs::remove_file(&probe).await;
                Ok(CheckOutcome::ok())
            }
            Err(e) => Ok(CheckOutcome::fail(&format!("not writable: {}", e))),
        }
    }
}

/// Wraps a closure as a custom check.
pub struct ClosureCheck<F> {
    name: String,
    probe: F,
}

impl<F> ClosureCheck<F>
where
    F: Fn() -> CheckOutcome + Send + Sync,
{
    pub fn new(name: &str, probe: F) -> Self {
        Self {
            name: name.to_string(),
            probe,
        }
    }
}

#[async_trait]
impl<F> HealthCheck for ClosureCheck<F>
where
    F: Fn() -> CheckOutcome + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn check(&self) -> Result<CheckOutcome> {
        Ok((self.probe)())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Slow;

    #[async_trait]
    impl HealthCheck for Slow {
        fn name(&self) -> &str {
            "slow"
        }

        async fn check(&self) -> Result<CheckOutcome> {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok(CheckOutcome::ok())
        }
    }

    #[tokio::test]
    async fn aggregates_statuses_with_worst_wins() {
        let agg = HealthAggregator::new(None);
        agg.register(
            Arc::new(ClosureCheck::new("a", || CheckOutcome::ok())),
            None,
        );
        agg.register(
            Arc::new(ClosureCheck::new("b", || CheckOutcome::degraded("meh"))),
            None,
        );
        let report = agg.run_all(Duration::from_millis(500)).await;
        assert_eq!(report.overall, CheckStatus::Degraded);
        assert_eq!(report.checks.len(), 2);
    }

    #[tokio::test]
    async fn slow_check_cannot_delay_the_report() {
        let agg = HealthAggregator::new(None);
        agg.register(Arc::new(Slow), None);
        agg.register(
            Arc::new(ClosureCheck::new("fast", || CheckOutcome::ok())),
            None,
        );
        let started = Instant::now();
        let report = agg.run_all(Duration::from_millis(100)).await;
        assert!(started.elapsed() < Duration::from_millis(400));
        assert_eq!(report.overall, CheckStatus::Fail);
        let slow = report.checks.iter().find(|c| c.name == "slow").unwrap();
        assert!(slow.message.as_deref().unwrap_or("").contains("timed out"));
    }

    #[tokio::test]
    async fn per_check_timeout_can_be_tighter() {
        let agg = HealthAggregator::new(None);
        agg.register(Arc::new(Slow), Some(Duration::from_millis(20)));
        let report = agg.run_all(Duration::from_secs(5)).await;
        assert_eq!(report.checks[0].status, CheckStatus::Fail);
        assert!(report.duration_ms < 1000);
    }

    #[tokio::test]
    async fn history_ring_tracks_transitions() {
        let agg = HealthAggregator::new(None);
        agg.register(
            Arc::new(ClosureCheck::new("c", || CheckOutcome::ok())),
            None,
        );
        for _ in 0..3 {
            agg.run_all(Duration::from_millis(100)).await;
        }
        assert_eq!(agg.history("c"), vec![CheckStatus::Ok; 3]);
        assert!(agg.history("unknown").is_empty());
    }

    #[tokio::test]
    async fn filesystem_check_roundtrip() {
        let dir = tempfile::TempDir::new().unwrap();
        let check = FilesystemWritableCheck::new(dir.path().to_path_buf());
        let outcome = check.check().await.unwrap();
        assert_eq!(outcome.status, CheckStatus::Ok);
    }
}
