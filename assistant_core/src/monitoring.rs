//! Per-plugin dispatch counters and event-delivery failure tracking

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{instrument, warn};

use crate::dispatcher::AttemptOutcome;
use crate::event_bus::{DeliveryFailure, DeliveryObserver};

/// Overall health derived from recent failure ratios
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Warning,
    Critical,
    Unknown,
}

/// Plugin handler performance metrics
#[derive(Debug, Clone, Serialize)]
pub struct PluginMetrics {
    pub plugin_name: String,
    pub total_invocations: u64,
    pub successful_invocations: u64,
    pub failed_invocations: u64,
    pub timed_out_invocations: u64,
    pub permission_denials: u64,
    pub discarded_results: u64,
    pub average_response_time_ms: f64,
    pub last_updated: DateTime<Utc>,
}

impl PluginMetrics {
    fn new(plugin_name: &str) -> Self {
        Self {
            plugin_name: plugin_name.to_string(),
            total_invocations: 0,
            successful_invocations: 0,
            failed_invocations: 0,
            timed_out_invocations: 0,
            permission_denials: 0,
            discarded_results: 0,
            average_response_time_ms: 0.0,
            last_updated: Utc::now(),
        }
    }

    pub fn error_rate(&self) -> f64 {
        if self.total_invocations == 0 {
            return 0.0;
        }
        (self.failed_invocations + self.timed_out_invocations) as f64
            / self.total_invocations as f64
    }
}

/// Event delivery failures per subscriber
#[derive(Debug, Clone, Default, Serialize)]
pub struct DeliveryMetrics {
    pub failures: u64,
    pub timeouts: u64,
    pub panics: u64,
    pub queue_full: u64,
    pub tripped: bool,
    pub last_failure: Option<String>,
}

#[derive(Debug, Clone)]
pub struct MonitoringConfig {
    /// Error rate above which a plugin is reported as `Warning`
    pub warning_error_rate: f64,
    /// Error rate above which a plugin is reported as `Critical`
    pub critical_error_rate: f64,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            warning_error_rate: 0.25,
            critical_error_rate: 0.5,
        }
    }
}

#[derive(Debug, Default)]
pub struct MonitoringSystem {
    config: MonitoringConfig,
    plugin_metrics: DashMap<String, PluginMetrics>,
    delivery_metrics: DashMap<(String, String), DeliveryMetrics>,
}

impl MonitoringSystem {
    pub fn new(config: MonitoringConfig) -> Self {
        Self {
            config,
            plugin_metrics: DashMap::new(),
            delivery_metrics: DashMap::new(),
        }
    }

    /// Record one handler attempt made by the dispatcher
    #[instrument(skip(self, outcome))]
    pub fn record_attempt(&self, plugin: &str, outcome: &AttemptOutcome, duration: Duration) {
        let mut metrics = self
            .plugin_metrics
            .entry(plugin.to_string())
            .or_insert_with(|| PluginMetrics::new(plugin));

        match outcome {
            AttemptOutcome::PermissionDenied => {
                metrics.permission_denials += 1;
                metrics.last_updated = Utc::now();
                return;
            }
            AttemptOutcome::Succeeded => metrics.successful_invocations += 1,
            AttemptOutcome::Discarded => {
                metrics.successful_invocations += 1;
                metrics.discarded_results += 1;
            }
            AttemptOutcome::Failed { .. } => metrics.failed_invocations += 1,
            AttemptOutcome::TimedOut { .. } => metrics.timed_out_invocations += 1,
        }

        metrics.total_invocations += 1;
        // running mean over invocations
        let n = metrics.total_invocations as f64;
        let duration_ms = duration.as_secs_f64() * 1000.0;
        metrics.average_response_time_ms += (duration_ms - metrics.average_response_time_ms) / n;
        metrics.last_updated = Utc::now();
    }

    pub fn plugin_metrics(&self, plugin: &str) -> Option<PluginMetrics> {
        self.plugin_metrics.get(plugin).map(|entry| entry.clone())
    }

    pub fn all_plugin_metrics(&self) -> HashMap<String, PluginMetrics> {
        self.plugin_metrics
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }

    pub fn delivery_metrics(&self, topic: &str, subscriber_id: &str) -> Option<DeliveryMetrics> {
        self.delivery_metrics
            .get(&(topic.to_string(), subscriber_id.to_string()))
            .map(|entry| entry.clone())
    }

    /// Worst status across plugins; `Unknown` before any invocation
    pub fn health_status(&self) -> HealthStatus {
        let mut status = HealthStatus::Unknown;
        for entry in self.plugin_metrics.iter() {
            if entry.total_invocations == 0 {
                continue;
            }
            let rate = entry.error_rate();
            let plugin_status = if rate > self.config.critical_error_rate {
                HealthStatus::Critical
            } else if rate > self.config.warning_error_rate {
                HealthStatus::Warning
            } else {
                HealthStatus::Healthy
            };
            status = match (status, plugin_status) {
                (HealthStatus::Critical, _) | (_, HealthStatus::Critical) => HealthStatus::Critical,
                (HealthStatus::Warning, _) | (_, HealthStatus::Warning) => HealthStatus::Warning,
                _ => HealthStatus::Healthy,
            };
        }
        status
    }
}

impl DeliveryObserver for MonitoringSystem {
    fn delivery_failed(&self, topic: &str, subscriber_id: &str, failure: &DeliveryFailure) {
        warn!(topic, subscriber_id, "Event delivery failed: {}", failure);
        let mut m = self
            .delivery_metrics
            .entry((topic.to_string(), subscriber_id.to_string()))
            .or_default();
        m.failures += 1;
        match failure {
            DeliveryFailure::TimedOut(_) => m.timeouts += 1,
            DeliveryFailure::Panicked => m.panics += 1,
            DeliveryFailure::QueueFull => m.queue_full += 1,
            DeliveryFailure::Error(_) => {}
        }
        m.last_failure = Some(failure.to_string());
    }

    fn subscriber_tripped(&self, topic: &str, subscriber_id: &str, consecutive_failures: u32) {
        warn!(
            topic,
            subscriber_id,
            consecutive_failures,
            "Subscriber removed after repeated delivery failures"
        );
        self.delivery_metrics
            .entry((topic.to_string(), subscriber_id.to_string()))
            .or_default()
            .tripped = true;
    }
}
