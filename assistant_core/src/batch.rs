//! Batch processing of pre-configured requests.
//!
//! A batch file lists requests with optional dependencies. Requests whose
//! dependencies all succeeded run concurrently under a semaphore; requests
//! depending on a failed one are skipped. Results can be written as a JSON
//! report.

use crate::{orchestrator::Orchestrator, response::Response, settings::Settings};
use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, info, instrument, warn};

/// Batch job configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchConfig {
    pub job: JobMetadata,

    pub requests: Vec<RequestConfig>,

    #[serde(default)]
    pub settings: BatchSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobMetadata {
    pub name: String,
    pub description: Option<String>,
    pub version: String,

    #[serde(default)]
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestConfig {
    /// Unique request identifier within the batch
    pub id: String,

    /// Requesting user; defaults to `agent.default_user`
    pub user: Option<String>,

    /// Natural-language request text
    pub text: String,

    #[serde(default)]
    pub settings: RequestSettings,

    /// Requests (by id) that must succeed first
    #[serde(default)]
    pub depends_on: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestSettings {
    #[serde(default = "default_request_timeout")]
    pub timeout_seconds: u64,

    /// Extra attempts after a retryable failure
    #[serde(default)]
    pub retries: u32,
}

impl Default for RequestSettings {
    fn default() -> Self {
        Self {
            timeout_seconds: default_request_timeout(),
            retries: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchSettings {
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_requests: usize,

    /// Output file for the JSON report
    pub output_file: Option<PathBuf>,

    /// Stop scheduling after the first failure
    #[serde(default)]
    pub fail_fast: bool,
}

impl Default for BatchSettings {
    fn default() -> Self {
        Self {
            max_concurrent_requests: default_max_concurrent(),
            output_file: None,
            fail_fast: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestResult {
    pub request_id: String,
    pub user: String,
    pub status: RequestStatus,
    pub response: Option<Response>,
    pub error: Option<String>,
    pub duration_ms: u64,
    pub retries_used: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum RequestStatus {
    Success,
    Failed,
    Skipped,
    Timeout,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchResult {
    pub job_name: String,
    pub status: BatchStatus,
    pub total_requests: usize,
    pub successful_requests: usize,
    pub failed_requests: usize,
    pub skipped_requests: usize,
    pub total_duration_ms: u64,
    pub results: Vec<RequestResult>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    Success,
    PartialSuccess,
    Failed,
}

/// Execute a batch job from a configuration file
#[instrument(skip(settings))]
pub async fn run(config_path: PathBuf, settings: Settings) -> Result<()> {
    info!("Starting batch execution from config: {:?}", config_path);

    let config = load_batch_config(&config_path).context("Failed to load batch configuration")?;
    info!("Loaded batch job: {} (version: {})", config.job.name, config.job.version);

    let output_file = config.settings.output_file.clone();
    let autoload = settings.plugins.autoload;

    let orchestrator = Arc::new(
        Orchestrator::builder(settings)
            .build()
            .await
            .context("Failed to initialize orchestrator")?,
    );
    if autoload {
        orchestrator.autoload_plugins().await?;
    }

    let result = execute_batch(orchestrator.clone(), config)
        .await
        .context("Batch execution failed")?;
    orchestrator.shutdown().await?;

    print_batch_summary(&result);

    if let Some(path) = &output_file {
        save_batch_results(&result, path).context("Failed to save batch results")?;
    }

    match result.status {
        BatchStatus::Success => Ok(()),
        BatchStatus::PartialSuccess => {
            warn!("Batch completed with some failures");
            Ok(())
        }
        BatchStatus::Failed => {
            error!("Batch execution failed");
            Err(anyhow!(
                "Batch execution failed: {}",
                result.error.unwrap_or_else(|| "every request failed".to_string())
            ))
        }
    }
}

/// Load and validate a batch configuration from TOML
pub fn load_batch_config(config_path: &Path) -> Result<BatchConfig> {
    let contents = std::fs::read_to_string(config_path)
        .with_context(|| format!("Failed to read config file: {:?}", config_path))?;

    let config: BatchConfig = toml::from_str(&contents)
        .with_context(|| format!("Failed to parse TOML config: {:?}", config_path))?;

    validate_batch_config(&config)?;
    Ok(config)
}

fn validate_batch_config(config: &BatchConfig) -> Result<()> {
    if config.requests.is_empty() {
        return Err(anyhow!("Batch configuration must contain at least one request"));
    }
    if config.settings.max_concurrent_requests == 0 {
        return Err(anyhow!("settings.max_concurrent_requests cannot be 0"));
    }

    let mut ids = HashSet::new();
    for request in &config.requests {
        if !ids.insert(request.id.as_str()) {
            return Err(anyhow!("Duplicate request ID: {}", request.id));
        }
    }
    for request in &config.requests {
        for dep in &request.depends_on {
            if !ids.contains(dep.as_str()) {
                return Err(anyhow!(
                    "Request {} depends on non-existent request: {}",
                    request.id,
                    dep
                ));
            }
        }
    }

    // Kahn's algorithm; anything left over sits on a cycle
    let mut indegree: HashMap<&str, usize> = config
        .requests
        .iter()
        .map(|r| (r.id.as_str(), r.depends_on.len()))
        .collect();
    let mut ready: Vec<&str> = indegree
        .iter()
        .filter(|(_, d)| **d == 0)
        .map(|(id, _)| *id)
        .collect();
    let mut visited = 0;
    while let Some(id) = ready.pop() {
        visited += 1;
        for request in &config.requests {
            if request.depends_on.iter().any(|d| d == id) {
                if let Some(d) = indegree.get_mut(request.id.as_str()) {
                    *d -= 1;
                    if *d == 0 {
                        ready.push(request.id.as_str());
                    }
                }
            }
        }
    }
    if visited != config.requests.len() {
        return Err(anyhow!("Circular dependency between batch requests"));
    }

    Ok(())
}

/// Run every request of `config` in dependency order
pub async fn execute_batch(orchestrator: Arc<Orchestrator>, config: BatchConfig) -> Result<BatchResult> {
    let start_time = Instant::now();
    let total_requests = config.requests.len();
    let default_user = orchestrator.settings().agent.default_user.clone();
    let semaphore = Arc::new(tokio::sync::Semaphore::new(config.settings.max_concurrent_requests));

    let mut results: Vec<RequestResult> = Vec::new();
    let mut succeeded: HashSet<String> = HashSet::new();
    let mut finished: HashSet<String> = HashSet::new();
    let mut remaining: Vec<RequestConfig> = config.requests;
    let mut abort_reason: Option<String> = None;

    while !remaining.is_empty() {
        // Dependents of a failed request can never run
        let (blocked, pending): (Vec<_>, Vec<_>) = remaining.into_iter().partition(|r| {
            r.depends_on
                .iter()
                .any(|d| finished.contains(d) && !succeeded.contains(d))
        });
        remaining = pending;
        for request in blocked {
            warn!("Skipping request {}: a dependency failed", request.id);
            finished.insert(request.id.clone());
            results.push(skipped(request, &default_user, "dependency failed"));
        }

        let (ready, waiting): (Vec<_>, Vec<_>) = remaining
            .into_iter()
            .partition(|r| r.depends_on.iter().all(|d| succeeded.contains(d)));
        remaining = waiting;

        if ready.is_empty() {
            if remaining.is_empty() {
                break;
            }
            return Err(anyhow!("Circular dependency detected or missing dependencies"));
        }

        let mut handles = Vec::new();
        for request in ready {
            let permit = semaphore.clone().acquire_owned().await?;
            let orchestrator = orchestrator.clone();
            let user = request.user.clone().unwrap_or_else(|| default_user.clone());
            let id = request.id.clone();

            let handle = tokio::spawn(async move {
                let _permit = permit;
                execute_single_request(orchestrator.as_ref(), request, user).await
            });
            handles.push((id, handle));
        }

        for (id, handle) in handles {
            let result = handle.await?;
            finished.insert(id.clone());
            if result.status == RequestStatus::Success {
                succeeded.insert(id.clone());
            } else if config.settings.fail_fast && abort_reason.is_none() {
                error!("Failing fast due to request failure: {}", id);
                abort_reason = Some(format!("Failed fast on request: {}", id));
            }
            results.push(result);
        }

        if abort_reason.is_some() {
            for request in remaining.drain(..) {
                results.push(skipped(request, &default_user, "batch aborted"));
            }
        }
    }

    let successful_requests = results.iter().filter(|r| r.status == RequestStatus::Success).count();
    let skipped_requests = results.iter().filter(|r| r.status == RequestStatus::Skipped).count();
    let failed_requests = total_requests - successful_requests - skipped_requests;

    let status = if abort_reason.is_some() {
        BatchStatus::Failed
    } else if failed_requests == 0 && skipped_requests == 0 {
        BatchStatus::Success
    } else if successful_requests > 0 {
        BatchStatus::PartialSuccess
    } else {
        BatchStatus::Failed
    };

    Ok(BatchResult {
        job_name: config.job.name,
        status,
        total_requests,
        successful_requests,
        failed_requests,
        skipped_requests,
        total_duration_ms: start_time.elapsed().as_millis() as u64,
        results,
        error: abort_reason,
    })
}

fn skipped(request: RequestConfig, default_user: &str, reason: &str) -> RequestResult {
    RequestResult {
        request_id: request.id,
        user: request.user.unwrap_or_else(|| default_user.to_string()),
        status: RequestStatus::Skipped,
        response: None,
        error: Some(reason.to_string()),
        duration_ms: 0,
        retries_used: 0,
    }
}

/// Failures worth another attempt; the rest would fail the same way again
fn is_retryable(kind: &str) -> bool {
    matches!(
        kind,
        "request_timeout" | "timeout" | "no_handler_available" | "handler_timeout" | "storage_error"
    )
}

async fn execute_single_request(orchestrator: &Orchestrator, request: RequestConfig, user: String) -> RequestResult {
    let start_time = Instant::now();
    let mut retries_used = 0;
    let timeout = Duration::from_secs(request.settings.timeout_seconds);

    loop {
        info!("Executing request: {} (attempt {})", request.id, retries_used + 1);

        let outcome = tokio::time::timeout(timeout, orchestrator.handle_request(&user, &request.text)).await;
        let (status, response, error, retryable) = match outcome {
            Ok(response) if response.success => (RequestStatus::Success, Some(response), None, false),
            Ok(response) => {
                let (kind, detail) = response
                    .error
                    .as_ref()
                    .map(|e| (e.kind.clone(), e.detail.clone()))
                    .unwrap_or_else(|| ("unknown".to_string(), response.message.clone()));
                warn!("Request {} failed ({}): {}", request.id, kind, detail);
                let retryable = is_retryable(&kind);
                (RequestStatus::Failed, Some(response), Some(format!("{kind}: {detail}")), retryable)
            }
            Err(_) => {
                warn!("Request {} timed out", request.id);
                (RequestStatus::Timeout, None, Some("Request timed out".to_string()), true)
            }
        };

        if retryable && retries_used < request.settings.retries {
            retries_used += 1;
            warn!("Retrying request {} (attempt {})", request.id, retries_used + 1);
            continue;
        }

        if status == RequestStatus::Success {
            info!("Request {} completed successfully", request.id);
        }
        return RequestResult {
            request_id: request.id,
            user,
            status,
            response,
            error,
            duration_ms: start_time.elapsed().as_millis() as u64,
            retries_used,
        };
    }
}

fn print_batch_summary(result: &BatchResult) {
    println!("\n=== Batch Execution Summary ===");
    println!("Job: {}", result.job_name);
    println!("Status: {:?}", result.status);
    println!("Total Requests: {}", result.total_requests);
    println!("Successful: {}", result.successful_requests);
    println!("Failed: {}", result.failed_requests);
    println!("Skipped: {}", result.skipped_requests);
    println!("Duration: {}ms", result.total_duration_ms);

    if result.failed_requests > 0 || result.skipped_requests > 0 {
        println!("\nUnsuccessful Requests:");
        for r in result.results.iter().filter(|r| r.status != RequestStatus::Success) {
            println!(
                "  - {} ({:?}): {}",
                r.request_id,
                r.status,
                r.error.as_deref().unwrap_or("Unknown error")
            );
        }
    }
    println!("===============================\n");
}

fn save_batch_results(result: &BatchResult, output_file: &Path) -> Result<()> {
    let json = serde_json::to_string_pretty(result).context("Failed to serialize batch results")?;

    std::fs::write(output_file, json)
        .with_context(|| format!("Failed to write results to: {:?}", output_file))?;

    info!("Batch results saved to: {:?}", output_file);
    Ok(())
}

fn default_request_timeout() -> u64 {
    30
}

fn default_max_concurrent() -> usize {
    4
}
