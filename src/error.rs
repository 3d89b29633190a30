use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum ConvertError {
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("Engine launch failed: {0}")]
    LaunchFailed(String),

    #[error("Timeout after {0:?}")]
    Timeout(Duration),

    #[error("Rate limited by service '{service}': {reason}")]
    RateLimited { service: String, reason: String },

    #[error("Service '{service}' failed{}: {message}", status_suffix(.status))]
    ServiceError {
        service: String,
        status: Option<u16>,
        code: Option<String>,
        message: String,
    },

    #[error("Process pool exhausted ({max_instances} instances in use)")]
    PoolExhausted { max_instances: usize },

    #[error("Conversion cancelled")]
    Cancelled,

    #[error("Render failed: {0}")]
    RenderFailed(String),

    #[error("Network error: {0}")]
    NetworkError(String),

    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    #[error("IO error: {0}")]
    IoError(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),
}

impl ConvertError {
    /// Whether the same remote service may be tried again after a backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ConvertError::Timeout(_)
                | ConvertError::NetworkError(_)
                | ConvertError::ServiceError { .. }
        )
    }

    /// Whether the orchestrator may cascade to the next tier after this error.
    pub fn triggers_fallback(&self) -> bool {
        !matches!(self, ConvertError::Validation(_) | ConvertError::Cancelled)
    }

    pub fn severity(&self) -> ErrorSeverity {
        match self {
            ConvertError::Validation(_) => ErrorSeverity::Low,
            ConvertError::RateLimited { .. } => ErrorSeverity::Low,
            ConvertError::Cancelled => ErrorSeverity::Low,
            ConvertError::ConfigurationError(_) => ErrorSeverity::High,
            ConvertError::LaunchFailed(_) => ErrorSeverity::High,
            ConvertError::PoolExhausted { .. } => ErrorSeverity::High,
            _ => ErrorSeverity::Medium,
        }
    }

    /// Short machine-readable label, used for metrics and attempt history.
    pub fn kind(&self) -> &'static str {
        match self {
            ConvertError::Validation(_) => "validation",
            ConvertError::BackendUnavailable(_) => "backend_unavailable",
            ConvertError::LaunchFailed(_) => "launch_failed",
            ConvertError::Timeout(_) => "timeout",
            ConvertError::RateLimited { .. } => "rate_limited",
            ConvertError::ServiceError { .. } => "service_error",
            ConvertError::PoolExhausted { .. } => "pool_exhausted",
            ConvertError::Cancelled => "cancelled",
            ConvertError::RenderFailed(_) => "render_failed",
            ConvertError::NetworkError(_) => "network",
            ConvertError::ConfigurationError(_) => "configuration",
            ConvertError::IoError(_) => "io",
            ConvertError::SerializationError(_) => "serialization",
        }
    }
}

fn status_suffix(status: &Option<u16>) -> String {
    status
        .map(|s| format!(" with status {s}"))
        .unwrap_or_default()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorSeverity {
    Low,
    Medium,
    High,
    Critical,
}

/// One failed tier attempt inside a fallback cascade.
#[derive(Debug, Clone)]
pub struct AttemptRecord {
    pub tier: String,
    pub error: ConvertError,
    pub elapsed: Duration,
}

/// The error surfaced to callers once every fallback option is exhausted.
///
/// Carries the last concrete backend error together with the full attempt
/// history, so callers can explain why each tier was abandoned.
#[derive(Debug, Clone)]
pub struct CascadeFailure {
    pub error: ConvertError,
    pub attempts: Vec<AttemptRecord>,
    pub elapsed: Duration,
}

impl CascadeFailure {
    pub fn new(error: ConvertError, attempts: Vec<AttemptRecord>, elapsed: Duration) -> Self {
        Self {
            error,
            attempts,
            elapsed,
        }
    }

    pub fn tiers_tried(&self) -> Vec<&str> {
        self.attempts.iter().map(|a| a.tier.as_str()).collect()
    }
}

impl fmt::Display for CascadeFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.error)?;
        if !self.attempts.is_empty() {
            write!(f, " (after {} attempt(s) in {:?}:", self.attempts.len(), self.elapsed)?;
            for attempt in &self.attempts {
                write!(f, " [{}: {}]", attempt.tier, attempt.error.kind())?;
            }
            write!(f, ")")?;
        }
        Ok(())
    }
}

impl std::error::Error for CascadeFailure {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.error)
    }
}

#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    state: Arc<Mutex<CircuitState>>,
    failure_threshold: usize,
    recovery_timeout: Duration,
    failure_count: Arc<AtomicUsize>,
    last_failure_time: Arc<Mutex<Option<Instant>>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

// A poisoned lock only means another thread panicked mid-update; the breaker
// state is still a plain value, so keep using it.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl CircuitBreaker {
    pub fn new(failure_threshold: usize, recovery_timeout: Duration) -> Self {
        Self {
            state: Arc::new(Mutex::new(CircuitState::Closed)),
            failure_threshold,
            recovery_timeout,
            failure_count: Arc::new(AtomicUsize::new(0)),
            last_failure_time: Arc::new(Mutex::new(None)),
        }
    }

    pub fn can_execute(&self) -> bool {
        let mut state = lock(&self.state);
        match *state {
            CircuitState::Closed | CircuitState::HalfOpen => true,
            CircuitState::Open => {
                let last_failure = *lock(&self.last_failure_time);
                let recovered = last_failure
                    .map(|last| last.elapsed() > self.recovery_timeout)
                    .unwrap_or(false);
                if recovered {
                    *state = CircuitState::HalfOpen;
                }
                recovered
            }
        }
    }

    pub fn record_success(&self) {
        self.failure_count.store(0, Ordering::Relaxed);
        *lock(&self.state) = CircuitState::Closed;
        *lock(&self.last_failure_time) = None;
    }

    pub fn record_failure(&self) {
        let failures = self.failure_count.fetch_add(1, Ordering::Relaxed) + 1;
        *lock(&self.last_failure_time) = Some(Instant::now());

        if failures >= self.failure_threshold {
            *lock(&self.state) = CircuitState::Open;
        }
    }

    pub fn get_state(&self) -> CircuitState {
        *lock(&self.state)
    }

    pub fn get_failure_count(&self) -> usize {
        self.failure_count.load(Ordering::Relaxed)
    }
}

impl From<std::io::Error> for ConvertError {
    fn from(err: std::io::Error) -> Self {
        ConvertError::IoError(err.to_string())
    }
}

impl From<serde_json::Error> for ConvertError {
    fn from(err: serde_json::Error) -> Self {
        ConvertError::SerializationError(err.to_string())
    }
}

impl From<reqwest::Error> for ConvertError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ConvertError::Timeout(Duration::ZERO)
        } else if let Some(status) = err.status() {
            ConvertError::ServiceError {
                service: err
                    .url()
                    .and_then(|u| u.host_str().map(str::to_string))
                    .unwrap_or_default(),
                status: Some(status.as_u16()),
                code: None,
                message: err.to_string(),
            }
        } else {
            ConvertError::NetworkError(err.to_string())
        }
    }
}
