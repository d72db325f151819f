//! Process health: components register named checks, the daemon aggregates
//! them into one report.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::Mutex;

/// How bad an issue is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Degraded,
    Unhealthy,
}

/// One problem reported by a component.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthIssue {
    pub component: String,
    pub severity: Severity,
    pub detail: String,
}

/// A component's health hook.
#[async_trait]
pub trait HealthCheck: Send + Sync {
    fn name(&self) -> &str;

    /// Current issues; empty means healthy.
    async fn issues(&self) -> Vec<HealthIssue>;
}

/// Aggregated report served over `/healthz`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    pub status: &'static str,
    pub issues: Vec<HealthIssue>,
}

impl HealthReport {
    pub fn is_healthy(&self) -> bool {
        self.issues.is_empty()
    }
}

/// Registry of health hooks.
#[derive(Default)]
pub struct HealthRegistry {
    checks: Mutex<Vec<Arc<dyn HealthCheck>>>,
}

impl HealthRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, check: Arc<dyn HealthCheck>) {
        self.checks.lock().await.push(check);
    }

    pub async fn report(&self) -> HealthReport {
        let checks = self.checks.lock().await.clone();
        let mut issues = Vec::new();
        for check in checks {
            issues.extend(check.issues().await);
        }
        let status = if issues.is_empty() { "ok" } else { "degraded" };
        HealthReport { status, issues }
    }
}
