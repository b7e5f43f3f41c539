//! Health Monitor (spec.md §4.10): a small component registry with
//! liveness checks, exposed via `/summary/health` and mirrored into
//! `g6_component_healthy` / `g6_last_check_unix` gauges.

use crate::metrics::Registry;
use chrono::Utc;
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Debug, Clone, Serialize)]
pub struct ComponentStatus {
    pub healthy: bool,
    pub last_check_unix: i64,
    pub detail: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthSnapshot {
    pub healthy: bool,
    pub components: HashMap<String, ComponentStatus>,
}

/// A named liveness probe. Implementors report whether the component they
/// own is currently healthy; failures are logged and proceed, never abort
/// the monitor's sweep (spec.md §4.8 "per-plugin exception isolation"
/// applies equally here).
pub trait Check: Send + Sync {
    fn name(&self) -> &str;
    fn check(&self) -> Result<(), String>;
}

pub struct HealthMonitor {
    checks: Vec<Box<dyn Check>>,
    state: RwLock<HashMap<String, ComponentStatus>>,
    metrics: Arc<Registry>,
}

impl HealthMonitor {
    pub fn new(metrics: Arc<Registry>) -> Self {
        Self {
            checks: Vec::new(),
            state: RwLock::new(HashMap::new()),
            metrics,
        }
    }

    pub fn register(&mut self, check: Box<dyn Check>) {
        self.checks.push(check);
    }

    /// Runs every registered check, updating state and metrics. Intended
    /// to be called periodically alongside the collector cycle.
    pub fn run_checks(&self) {
        let now = Utc::now().timestamp();
        let mut state = self.state.write();
        for check in &self.checks {
            let name = check.name().to_string();
            let result = check.check();
            let healthy = result.is_ok();
            self.metrics.set("g6_component_healthy", &[("component", name.as_str())], if healthy { 1.0 } else { 0.0 });
            self.metrics.set("g6_last_check_unix", &[("component", name.as_str())], now as f64);
            state.insert(
                name,
                ComponentStatus {
                    healthy,
                    last_check_unix: now,
                    detail: result.err(),
                },
            );
        }
    }

    pub fn snapshot(&self) -> HealthSnapshot {
        let state = self.state.read();
        let healthy = state.values().all(|c| c.healthy);
        HealthSnapshot {
            healthy,
            components: state.clone(),
        }
    }
}

/// Reports healthy as long as the last collector cycle completed within
/// `stale_after_secs` of now.
pub struct CollectorLivenessCheck {
    last_cycle_unix: Arc<std::sync::atomic::AtomicI64>,
    stale_after_secs: i64,
}

impl CollectorLivenessCheck {
    pub fn new(last_cycle_unix: Arc<std::sync::atomic::AtomicI64>, stale_after_secs: i64) -> Self {
        Self { last_cycle_unix, stale_after_secs }
    }
}

impl Check for CollectorLivenessCheck {
    fn name(&self) -> &str {
        "collector"
    }

    fn check(&self) -> Result<(), String> {
        let last = self.last_cycle_unix.load(std::sync::atomic::Ordering::SeqCst);
        if last == 0 {
            return Ok(()); // no cycle has run yet; not unhealthy, just unstarted
        }
        let age = Utc::now().timestamp() - last;
        if age > self.stale_after_secs {
            Err(format!("last collection cycle was {age}s ago"))
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct AlwaysOk;
    impl Check for AlwaysOk {
        fn name(&self) -> &str {
            "always_ok"
        }
        fn check(&self) -> Result<(), String> {
            Ok(())
        }
    }

    struct AlwaysFails;
    impl Check for AlwaysFails {
        fn name(&self) -> &str {
            "always_fails"
        }
        fn check(&self) -> Result<(), String> {
            Err("nope".to_string())
        }
    }

    #[test]
    fn snapshot_is_unhealthy_if_any_component_fails() {
        let metrics = Arc::new(Registry::new_for_test());
        let mut monitor = HealthMonitor::new(metrics);
        monitor.register(Box::new(AlwaysOk));
        monitor.register(Box::new(AlwaysFails));
        monitor.run_checks();
        let snapshot = monitor.snapshot();
        assert!(!snapshot.healthy);
        assert!(snapshot.components["always_ok"].healthy);
        assert!(!snapshot.components["always_fails"].healthy);
    }

    #[test]
    fn collector_liveness_is_healthy_before_first_cycle() {
        let check = CollectorLivenessCheck::new(Arc::new(std::sync::atomic::AtomicI64::new(0)), 60);
        assert!(check.check().is_ok());
    }
}
