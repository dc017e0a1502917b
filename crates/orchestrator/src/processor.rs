//! Per-session loop scaffold: step tracking, doom-loop detection, and
//! retry with exponential backoff. Created at loop entry, destroyed at
//! exit.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use sha2::{Digest, Sha256};

use maestro_domain::Result;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Doom-loop detection
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

const DOOM_THRESHOLD: usize = 3;

/// Detects the same tool being called with the same arguments over and
/// over. The signature is `(tool_name, args_hash)` — the same tool with
/// different arguments is normal iteration, not a loop.
pub struct DoomLoopDetector {
    threshold: usize,
    history: Vec<(String, String)>,
}

impl DoomLoopDetector {
    pub fn new(threshold: usize) -> Self {
        Self {
            threshold,
            history: Vec::new(),
        }
    }

    /// Record a call; returns true when the last `threshold` signatures
    /// are all identical.
    pub fn record(&mut self, tool_name: &str, args: &serde_json::Value) -> bool {
        let signature = (tool_name.to_owned(), args_hash(args));
        self.history.push(signature);
        self.is_tripped()
    }

    pub fn is_tripped(&self) -> bool {
        if self.history.len() < self.threshold {
            return false;
        }
        let recent = &self.history[self.history.len() - self.threshold..];
        recent.iter().all(|sig| *sig == recent[0])
    }

    pub fn reset(&mut self) {
        self.history.clear();
    }
}

/// First 8 hex chars of a hash over canonical (key-sorted) JSON. Only
/// equality matters, so the digest choice is free.
fn args_hash(args: &serde_json::Value) -> String {
    let canonical = canonical_json(args);
    let digest = Sha256::digest(canonical.as_bytes());
    let hex: String = digest.iter().map(|b| format!("{b:02x}")).collect();
    hex[..8].to_owned()
}

fn canonical_json(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let body: Vec<String> = keys
                .iter()
                .map(|k| format!("{}:{}", k, canonical_json(&map[*k])))
                .collect();
            format!("{{{}}}", body.join(","))
        }
        serde_json::Value::Array(items) => {
            let body: Vec<String> = items.iter().map(canonical_json).collect();
            format!("[{}]", body.join(","))
        }
        other => other.to_string(),
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Retry
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub exponential_base: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            exponential_base: 2.0,
        }
    }
}

impl RetryConfig {
    /// `min(base · base^attempt, max_delay)`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let scaled = self.base_delay.as_secs_f64() * self.exponential_base.powi(attempt as i32);
        Duration::from_secs_f64(scaled).min(self.max_delay)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Steps
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Running,
    Completed,
    Error,
    DoomLoop,
}

#[derive(Debug, Clone, Serialize)]
pub struct StepInfo {
    pub step: u32,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub tool_calls: Vec<String>,
    pub status: StepStatus,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Processor
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Loop scaffold for one active session.
pub struct SessionProcessor {
    pub session_id: String,
    max_steps: u32,
    doom: DoomLoopDetector,
    retry: RetryConfig,
    steps: Vec<StepInfo>,
    aborted: bool,
}

impl SessionProcessor {
    pub fn new(session_id: &str, max_steps: u32) -> Self {
        Self {
            session_id: session_id.to_owned(),
            max_steps,
            doom: DoomLoopDetector::new(DOOM_THRESHOLD),
            retry: RetryConfig::default(),
            steps: Vec::new(),
            aborted: false,
        }
    }

    /// Open a new step in running state.
    pub fn start_step(&mut self) -> StepInfo {
        let info = StepInfo {
            step: self.steps.len() as u32 + 1,
            started_at: Utc::now(),
            finished_at: None,
            tool_calls: Vec::new(),
            status: StepStatus::Running,
        };
        self.steps.push(info.clone());
        info
    }

    /// Close the current step with a terminal status.
    pub fn finish_step(&mut self, status: StepStatus) -> Option<StepInfo> {
        let step = self.steps.last_mut()?;
        step.finished_at = Some(Utc::now());
        step.status = status;
        Some(step.clone())
    }

    /// Record a tool call on the current step; returns true when the doom
    /// detector trips.
    pub fn record_tool_call(&mut self, tool_name: &str, args: &serde_json::Value) -> bool {
        if let Some(step) = self.steps.last_mut() {
            step.tool_calls.push(tool_name.to_owned());
        }
        self.doom.record(tool_name, args)
    }

    pub fn is_doom_loop(&self) -> bool {
        self.doom.is_tripped()
    }

    pub fn reset_doom_detector(&mut self) {
        self.doom.reset();
    }

    pub fn abort(&mut self) {
        self.aborted = true;
    }

    /// False once aborted, at the step cap, or in a doom loop.
    pub fn should_continue(&self) -> bool {
        if self.aborted {
            return false;
        }
        if self.steps.len() as u32 >= self.max_steps {
            return false;
        }
        !self.is_doom_loop()
    }

    pub fn steps(&self) -> &[StepInfo] {
        &self.steps
    }

    pub fn retry_config(&self) -> &RetryConfig {
        &self.retry
    }
}

/// Retry an async operation with exponential backoff; the last error is
/// returned when attempts are exhausted.
pub async fn retry_with_backoff<T, Fut, Op>(config: &RetryConfig, mut op: Op) -> Result<T>
where
    Op: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut last_error = None;
    for attempt in 0..config.max_retries {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) => {
                tracing::debug!(attempt, error = %e, "retryable operation failed");
                last_error = Some(e);
                if attempt + 1 < config.max_retries {
                    tokio::time::sleep(config.delay_for(attempt)).await;
                }
            }
        }
    }
    Err(last_error.unwrap_or_else(|| maestro_domain::Error::Other("retry exhausted".into())))
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Registry
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Processors keyed by session ID; one per active prompt loop.
#[derive(Default)]
pub struct ProcessorRegistry {
    processors: Mutex<HashMap<String, Arc<Mutex<SessionProcessor>>>>,
}

impl ProcessorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_or_create(
        &self,
        session_id: &str,
        max_steps: u32,
    ) -> Arc<Mutex<SessionProcessor>> {
        self.processors
            .lock()
            .entry(session_id.to_owned())
            .or_insert_with(|| Arc::new(Mutex::new(SessionProcessor::new(session_id, max_steps))))
            .clone()
    }

    pub fn get(&self, session_id: &str) -> Option<Arc<Mutex<SessionProcessor>>> {
        self.processors.lock().get(session_id).cloned()
    }

    pub fn remove(&self, session_id: &str) {
        self.processors.lock().remove(session_id);
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
