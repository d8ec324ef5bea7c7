//! Read-only health checks over the cache and the translation client.

use serde::Serialize;

use crate::translate::cache::TranslationCache;
use crate::translate::TranslationClient;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub enum Severity {
    Pass,
    Warning,
    Fail,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Severity::Pass => write!(f, "PASS"),
            Severity::Warning => write!(f, "WARN"),
            Severity::Fail => write!(f, "FAIL"),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthCheck {
    pub name: &'static str,
    pub severity: Severity,
    pub message: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct HealthReport {
    pub checks: Vec<HealthCheck>,
}

impl HealthReport {
    /// Worst severity across all checks.
    pub fn overall(&self) -> Severity {
        self.checks
            .iter()
            .map(|c| c.severity)
            .max()
            .unwrap_or(Severity::Pass)
    }

    fn push(&mut self, name: &'static str, severity: Severity, message: impl Into<String>) {
        self.checks.push(HealthCheck {
            name,
            severity,
            message: message.into(),
        });
    }
}

/// Run every check. The connection test is skipped without an API key.
pub async fn run_diagnostics(
    cache: &TranslationCache,
    client: &dyn TranslationClient,
    warn_threshold: u64,
) -> HealthReport {
    let mut report = HealthReport::default();

    if client.has_api_key() {
        report.push("api_key", Severity::Pass, "API key configured");
        if client.test_connection().await {
            report.push("api_connection", Severity::Pass, "translation service reachable");
        } else {
            report.push("api_connection", Severity::Fail, "translation service unreachable");
        }
    } else {
        report.push(
            "api_key",
            Severity::Fail,
            "no API key; only cached translations are available",
        );
    }

    match cache.statistics().await {
        Ok(stats) => {
            report.push(
                "cache",
                Severity::Pass,
                format!(
                    "{} entries across {} languages, {} hits",
                    stats.total_count, stats.language_count, stats.total_hits
                ),
            );
            if stats.exceeds(warn_threshold) {
                report.push(
                    "cache_size",
                    Severity::Warning,
                    format!(
                        "cache holds {} entries (threshold {warn_threshold}); consider clearing it",
                        stats.total_count
                    ),
                );
            } else {
                report.push("cache_size", Severity::Pass, "cache size within threshold");
            }
        }
        Err(e) => report.push("cache", Severity::Fail, format!("cache unreadable: {e}")),
    }

    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::tests::FakeClient;

    #[tokio::test]
    async fn healthy_setup_passes() {
        let cache = TranslationCache::in_memory(8).unwrap();
        let client = FakeClient::new(&[]);
        let report = run_diagnostics(&cache, &client, 100_000).await;
        assert_eq!(report.overall(), Severity::Pass);
        assert_eq!(report.checks.len(), 4);
    }

    #[tokio::test]
    async fn large_cache_warns() {
        let cache = TranslationCache::in_memory(8).unwrap();
        cache.store("柱", "en", "Column").await.unwrap();
        cache.store("梁", "en", "Beam").await.unwrap();
        let client = FakeClient::new(&[]);

        let report = run_diagnostics(&cache, &client, 1).await;
        assert_eq!(report.overall(), Severity::Warning);
    }

    #[tokio::test]
    async fn missing_key_fails() {
        let cache = TranslationCache::in_memory(8).unwrap();
        let mut client = FakeClient::new(&[]);
        client.has_key = false;

        let report = run_diagnostics(&cache, &client, 100_000).await;
        assert_eq!(report.overall(), Severity::Fail);
        assert!(report.checks.iter().all(|c| c.name != "api_connection"));
    }
}
