//! Module health monitoring
//!
//! One sweep checks every live instance that provides a `health_check` hook.
//! Unhealthy results are logged and recorded; they never deactivate anything.

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::module::traits::{HealthStatus, Module, ModuleHooks, ModuleKey};
use crate::utils::{current_timestamp, with_hook_timeout};

/// Outcome of the most recent check of one module
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub checked_at: u64,
}

/// Counts from one sweep
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HealthSweepSummary {
    pub healthy: usize,
    pub degraded: usize,
    pub unhealthy: usize,
    /// Live instances without a health hook
    pub skipped: usize,
}

impl HealthSweepSummary {
    pub fn checked(&self) -> usize {
        self.healthy + self.degraded + self.unhealthy
    }
}

/// Check each instance concurrently, bounding every call by `check_timeout`
///
/// Returns the reports of checked modules and the sweep counts.
pub async fn sweep(
    targets: Vec<(ModuleKey, Arc<dyn Module>)>,
    check_timeout: Duration,
) -> (Vec<(ModuleKey, HealthReport)>, HealthSweepSummary) {
    let mut summary = HealthSweepSummary::default();

    let checks = targets.into_iter().filter_map(|(key, instance)| {
        if !instance.hooks().contains(ModuleHooks::HEALTH_CHECK) {
            summary.skipped += 1;
            return None;
        }
        Some(async move {
            let status = match with_hook_timeout(check_timeout, instance.health_check()).await {
                Ok(status) => status,
                Err(e) => HealthStatus::Unhealthy(e.to_string()),
            };
            (key, status)
        })
    });
    let checks: Vec<_> = checks.collect();

    let checked_at = current_timestamp();
    let mut reports = Vec::with_capacity(checks.len());
    for (key, status) in join_all(checks).await {
        match &status {
            HealthStatus::Healthy => {
                summary.healthy += 1;
                debug!(module = %key, "Health check passed");
            }
            HealthStatus::Degraded(detail) => {
                summary.degraded += 1;
                info!(module = %key, "Module reports degraded health: {}", detail);
            }
            HealthStatus::Unhealthy(detail) => {
                summary.unhealthy += 1;
                warn!(module = %key, "Module reports unhealthy: {}", detail);
            }
        }
        reports.push((key, HealthReport { status, checked_at }));
    }

    (reports, summary)
}

/// Periodic driver for health sweeps
pub struct HealthMonitor {
    token: CancellationToken,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl HealthMonitor {
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
            handle: Mutex::new(None),
        }
    }

    /// Run `pass` every `interval` until stopped or until `pass` returns false
    ///
    /// Returns false if a monitor is already running, was stopped, or the
    /// interval is zero.
    pub async fn start<F, Fut>(&self, interval: Duration, mut pass: F) -> bool
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = bool> + Send + 'static,
    {
        if interval.is_zero() {
            warn!("Refusing to start the health monitor with a zero interval");
            return false;
        }
        let mut handle = self.handle.lock().await;
        if handle.is_some() || self.token.is_cancelled() {
            return false;
        }

        let token = self.token.clone();
        *handle = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // The first tick completes immediately
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        if !pass().await {
                            break;
                        }
                    }
                }
            }
            debug!("Health monitor stopped");
        }));
        info!("Health monitor started ({:?} interval)", interval);
        true
    }

    pub async fn is_running(&self) -> bool {
        self.handle
            .lock()
            .await
            .as_ref()
            .map(|h| !h.is_finished())
            .unwrap_or(false)
    }

    /// Stop the loop and wait for an in-flight sweep to finish
    pub async fn stop(&self) {
        self.token.cancel();
        if let Some(handle) = self.handle.lock().await.take() {
            if let Err(e) = handle.await {
                warn!("Health monitor task ended abnormally: {}", e);
            }
        }
    }
}

impl Default for HealthMonitor {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module::traits::{ModuleContext, ModuleError};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct StubModule {
        hooks: ModuleHooks,
        result: fn() -> Result<HealthStatus, ModuleError>,
    }

    #[async_trait]
    impl Module for StubModule {
        fn hooks(&self) -> ModuleHooks {
            self.hooks
        }

        async fn initialize(&self, _context: ModuleContext) -> Result<(), ModuleError> {
            Ok(())
        }

        async fn cleanup(&self) -> Result<(), ModuleError> {
            Ok(())
        }

        async fn health_check(&self) -> Result<HealthStatus, ModuleError> {
            (self.result)()
        }
    }

    fn stub(hooks: ModuleHooks, result: fn() -> Result<HealthStatus, ModuleError>) -> Arc<dyn Module> {
        Arc::new(StubModule { hooks, result })
    }

    #[tokio::test]
    async fn test_sweep_counts_and_skips() {
        let with_check = ModuleHooks::MANDATORY | ModuleHooks::HEALTH_CHECK;
        let targets = vec![
            (ModuleKey::new("t", "ok"), stub(with_check, || Ok(HealthStatus::Healthy))),
            (
                ModuleKey::new("t", "slow"),
                stub(with_check, || Ok(HealthStatus::Degraded("lagging".into()))),
            ),
            (
                ModuleKey::new("t", "broken"),
                stub(with_check, || Err(ModuleError::OperationError("db down".into()))),
            ),
            (ModuleKey::new("t", "silent"), stub(ModuleHooks::MANDATORY, || Ok(HealthStatus::Healthy))),
        ];

        let (reports, summary) = sweep(targets, Duration::from_secs(1)).await;
        assert_eq!(summary.healthy, 1);
        assert_eq!(summary.degraded, 1);
        assert_eq!(summary.unhealthy, 1);
        assert_eq!(summary.skipped, 1);
        assert_eq!(summary.checked(), 3);

        let broken = reports
            .iter()
            .find(|(key, _)| key.name == "broken")
            .map(|(_, r)| r.status.clone())
            .unwrap();
        assert!(broken.is_unhealthy());
    }

    #[tokio::test]
    async fn test_monitor_runs_until_stopped() {
        let monitor = HealthMonitor::new();
        let passes = Arc::new(AtomicUsize::new(0));
        let counter = passes.clone();

        assert!(
            monitor
                .start(Duration::from_millis(10), move || {
                    let counter = counter.clone();
                    async move {
                        counter.fetch_add(1, Ordering::SeqCst);
                        true
                    }
                })
                .await
        );
        assert!(!monitor.start(Duration::from_millis(10), || async { true }).await);

        tokio::time::sleep(Duration::from_millis(100)).await;
        monitor.stop().await;
        let seen = passes.load(Ordering::SeqCst);
        assert!(seen >= 1);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(passes.load(Ordering::SeqCst), seen);
        assert!(!monitor.is_running().await);
    }

    #[tokio::test]
    async fn test_zero_interval_is_refused() {
        let monitor = HealthMonitor::new();
        assert!(!monitor.start(Duration::ZERO, || async { true }).await);
        assert!(!monitor.is_running().await);
    }
}
