//! Configuration management with serde serialization/deserialization
//!
//! One [`Config`] document carries a section per component. Every section has
//! complete defaults, so a config file only needs the keys it changes.

use crate::remote_client::{ConversionService, ServiceAuth};
use crate::{BackendId, ConvertError, TargetFormat};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main configuration structure
///
/// # Examples
///
/// ```rust
/// use render_tiers::Config;
///
/// let mut config = Config::default();
/// config.pool.max_instances = 5;
/// config.orchestrator.max_fallback_attempts = 2;
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    pub orchestrator: OrchestratorConfig,
    pub capability: CapabilityConfig,
    pub pool: PoolConfig,
    pub engine: EngineConfig,
    pub canvas: CanvasConfig,
    pub markup: MarkupConfig,
    pub remote: RemoteConfig,
    pub stream: StreamConfig,

    /// Memory ceiling fed to the pressure monitor (default: `DEFAULT_MEMORY_LIMIT`)
    pub memory_limit: Option<usize>,
}

impl Config {
    pub fn from_json(content: &str) -> Result<Self, ConvertError> {
        let config: Config = serde_json::from_str(content)?;
        Ok(config)
    }

    pub async fn load(path: &Path) -> Result<Self, ConvertError> {
        let content = tokio::fs::read_to_string(path).await?;
        Self::from_json(&content)
    }

    pub fn validate(&self) -> Result<(), ConvertError> {
        let fail = |msg: &str| Err(ConvertError::ConfigurationError(msg.to_string()));

        if let Some(order) = &self.orchestrator.priority_order {
            if order.is_empty() {
                return fail("Priority order must name at least one backend when set");
            }
        }
        if self.pool.max_instances == 0 {
            return fail("Process pool max instances must be greater than 0");
        }
        if self.pool.launch_timeout.is_zero() {
            return fail("Launch timeout must be greater than 0");
        }
        if self.pool.sweep_interval.is_zero() {
            return fail("Sweep interval must be greater than 0");
        }
        if self.engine.render_timeout.is_zero() {
            return fail("Engine render timeout must be greater than 0");
        }
        if self.engine.viewport.width == 0 || self.engine.viewport.height == 0 {
            return fail("Viewport dimensions must be greater than 0");
        }
        if self.canvas.width == 0 || self.canvas.max_pixels == 0 {
            return fail("Canvas dimensions must be greater than 0");
        }
        if self.remote.request_timeout.is_zero() {
            return fail("Remote request timeout must be greater than 0");
        }
        if self.remote.retry.base_delay > self.remote.retry.max_delay {
            return fail("Retry base delay must not exceed max delay");
        }
        if self.remote.health_check.failure_threshold == 0 {
            return fail("Health failure threshold must be greater than 0");
        }
        if self.stream.chunk_size == 0 || self.stream.buffer_chunks == 0 {
            return fail("Stream chunk size and buffer must be greater than 0");
        }

        let weights = &self.capability.weights;
        for weight in [weights.engine, weights.canvas, weights.network] {
            if !(0.0..=1.0).contains(&weight) {
                return fail("Capability weights must be within [0, 1]");
            }
        }

        let mut seen = std::collections::HashSet::new();
        for service in &self.remote.services {
            if service.id.trim().is_empty() {
                return fail("Remote service ids must not be empty");
            }
            if !seen.insert(service.id.as_str()) {
                return Err(ConvertError::ConfigurationError(format!(
                    "Duplicate remote service id '{}'",
                    service.id
                )));
            }
            if url::Url::parse(&service.url).is_err() {
                return Err(ConvertError::ConfigurationError(format!(
                    "Remote service '{}' has an invalid url '{}'",
                    service.id, service.url
                )));
            }
        }

        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Maximum number of tier switches after the first attempt (default: 3).
    /// Zero keeps every conversion on its primary tier.
    pub max_fallback_attempts: usize,

    /// Explicit tier ordering; unavailable tiers are filtered out
    pub priority_order: Option<Vec<BackendId>>,

    /// Keep the markup tier as terminal fallback even when it cannot produce
    /// the requested format (default: true)
    pub allow_format_downgrade: bool,

    /// Format used when the caller does not name one (default: PDF)
    pub default_target: TargetFormat,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_fallback_attempts: 3,
            priority_order: None,
            allow_format_downgrade: true,
            default_target: TargetFormat::Pdf,
        }
    }
}

/// Weights of each backend's performance in the overall capability score.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ScoreWeights {
    pub engine: f64,
    pub canvas: f64,
    pub network: f64,
}

impl Default for ScoreWeights {
    fn default() -> Self {
        Self {
            engine: 0.5,
            canvas: 0.3,
            network: 0.2,
        }
    }
}

/// Minimum performance a backend needs before it is recommended.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TierThresholds {
    pub engine: f64,
    pub canvas: f64,
}

impl Default for TierThresholds {
    fn default() -> Self {
        Self {
            engine: 0.6,
            canvas: 0.3,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CapabilityConfig {
    pub weights: ScoreWeights,
    pub thresholds: TierThresholds,

    /// Performance assigned to an available backend when benchmarks are skipped
    pub baseline_performance: f64,

    /// Upper bound on a single probe (default: 5 seconds)
    pub probe_timeout: Duration,

    /// Reuse the last assessment until the cache is cleared (default: true)
    pub cache: bool,

    /// Skip micro-benchmarks and use `baseline_performance` (default: false)
    pub skip_performance_tests: bool,

    /// Run the heavier benchmark variant (default: false)
    pub intensive: bool,
}

impl Default for CapabilityConfig {
    fn default() -> Self {
        Self {
            weights: ScoreWeights::default(),
            thresholds: TierThresholds::default(),
            baseline_performance: 0.7,
            probe_timeout: Duration::from_secs(5),
            cache: true,
            skip_performance_tests: false,
            intensive: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Hard cap on simultaneously tracked engine processes (default: 3)
    pub max_instances: usize,

    /// Idle time after which the sweep evicts a handle (default: 5 minutes)
    pub idle_timeout: Duration,

    /// Lend idle handles to new conversions instead of launching (default: true)
    pub reuse_instances: bool,

    /// Interval of the background idle sweep (default: 30 seconds)
    pub sweep_interval: Duration,

    /// Upper bound on launching one process (default: 30 seconds)
    pub launch_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_instances: 3,
            idle_timeout: Duration::from_secs(300),
            reuse_instances: true,
            sweep_interval: Duration::from_secs(30),
            launch_timeout: Duration::from_secs(30),
        }
    }
}

/// Browser viewport used for engine renders.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Viewport {
    /// Viewport width in pixels (default: 1280)
    pub width: u32,

    /// Viewport height in pixels (default: 1024)
    pub height: u32,

    /// Device pixel ratio for high-DPI output (default: 1.0)
    pub device_scale_factor: f64,
}

impl Default for Viewport {
    fn default() -> Self {
        Self {
            width: 1280,
            height: 1024,
            device_scale_factor: 1.0,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Path to Chrome/Chromium executable (default: auto-detect)
    pub chrome_path: Option<String>,

    pub viewport: Viewport,

    /// Upper bound on one engine render (default: 30 seconds)
    pub render_timeout: Duration,

    /// Largest document the engine tier accepts (default: 10MB)
    pub max_document_size: usize,

    /// Print CSS backgrounds into PDFs (default: true)
    pub print_background: bool,

    pub user_agent: Option<String>,

    /// Consecutive engine failures that open the circuit (default: 5)
    pub failure_threshold: usize,

    /// Time before an open circuit lets a trial request through (default: 60 seconds)
    pub recovery_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            chrome_path: None,
            viewport: Viewport::default(),
            render_timeout: Duration::from_secs(30),
            max_document_size: 10 * 1024 * 1024,
            print_background: true,
            user_agent: None,
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CanvasConfig {
    /// Surface width in pixels (default: 1200)
    pub width: u32,

    /// Largest surface the rasterizer will allocate (default: 16 megapixels)
    pub max_pixels: u64,

    /// Largest document the canvas tier accepts (default: 1MB)
    pub max_document_size: usize,

    /// JPEG encoder quality, 1-100 (default: 85)
    pub jpeg_quality: u8,
}

impl Default for CanvasConfig {
    fn default() -> Self {
        Self {
            width: 1200,
            max_pixels: 16_000_000,
            max_document_size: 1024 * 1024,
            jpeg_quality: 85,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct MarkupConfig {
    /// Largest document the markup tier accepts (default: 50MB)
    pub max_document_size: usize,
}

impl Default for MarkupConfig {
    fn default() -> Self {
        Self {
            max_document_size: 50 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Retries of the same service after the first attempt (default: 2)
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Upper bound of the random delay added to each backoff
    pub jitter: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
            jitter: Duration::from_millis(100),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct HealthCheckConfig {
    /// Run periodic `/health` probes (default: true)
    pub enabled: bool,
    pub interval: Duration,
    pub timeout: Duration,
    /// Consecutive failures that mark a service unhealthy (default: 3)
    pub failure_threshold: usize,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: Duration::from_secs(60),
            timeout: Duration::from_secs(5),
            failure_threshold: 3,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RemoteConfig {
    /// User-registered services; merged over the defaults by id
    pub services: Vec<ConversionService>,

    /// Register the built-in local conversion gateway entries (default: true)
    pub include_default_services: bool,

    /// Authentication material keyed by service id
    pub auth: HashMap<String, ServiceAuth>,

    pub request_timeout: Duration,
    pub retry: RetryConfig,

    /// Advance to the next service of the category after one is exhausted
    pub try_multiple_services: bool,

    /// Age after which an unhealthy verdict no longer excludes a service
    pub health_cache_ttl: Duration,

    pub health_check: HealthCheckConfig,

    /// Largest document sent to a remote service (default: 25MB)
    pub max_document_size: usize,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            services: Vec::new(),
            include_default_services: true,
            auth: HashMap::new(),
            request_timeout: Duration::from_secs(30),
            retry: RetryConfig::default(),
            try_multiple_services: true,
            health_cache_ttl: Duration::from_secs(60),
            health_check: HealthCheckConfig::default(),
            max_document_size: 25 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct StreamConfig {
    /// Bytes per emitted chunk (default: 64KB)
    pub chunk_size: usize,
    /// Chunks buffered ahead of the consumer (default: 4)
    pub buffer_chunks: usize,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            chunk_size: 64 * 1024,
            buffer_chunks: 4,
        }
    }
}

pub const DEFAULT_MEMORY_LIMIT: usize = 2 * 1024 * 1024 * 1024;

/// Chromium flags for pooled instance `instance_id`.
///
/// Profile and temp directories of one engine instance.
pub fn instance_dirs(instance_id: usize) -> [PathBuf; 2] {
    let unique_id = format!("{}-{}", std::process::id(), instance_id);
    let tmp = std::env::temp_dir();
    [
        tmp.join(format!("render-tiers-profile-{unique_id}")),
        tmp.join(format!("render-tiers-temp-{unique_id}")),
    ]
}

/// Each instance gets its own user-data and temp directory so concurrently
/// launched processes never share a profile.
pub fn engine_args(engine: &EngineConfig, instance_id: usize) -> Vec<String> {
    let [profile_dir, temp_dir] = instance_dirs(instance_id);

    let mut args = vec![
        "--headless".to_string(),
        "--no-sandbox".to_string(),
        "--disable-dev-shm-usage".to_string(),
        "--disable-gpu".to_string(),
        "--disable-extensions".to_string(),
        "--disable-plugins".to_string(),
        "--disable-default-apps".to_string(),
        "--disable-sync".to_string(),
        "--no-first-run".to_string(),
        "--disable-background-networking".to_string(),
        "--disable-component-update".to_string(),
        "--disable-background-timer-throttling".to_string(),
        "--disable-renderer-backgrounding".to_string(),
        "--disable-features=TranslateUI,ProcessSingleton".to_string(),
        "--mute-audio".to_string(),
        "--hide-scrollbars".to_string(),
        format!(
            "--window-size={},{}",
            engine.viewport.width, engine.viewport.height
        ),
        format!("--user-data-dir={}", profile_dir.display()),
        format!("--temp-dir={}", temp_dir.display()),
    ];

    if let Some(user_agent) = &engine.user_agent {
        args.push(format!("--user-agent={user_agent}"));
    }

    args
}

pub fn engine_browser_config(
    engine: &EngineConfig,
    instance_id: usize,
) -> Result<chromiumoxide::browser::BrowserConfig, ConvertError> {
    use chromiumoxide::browser::BrowserConfig;

    let mut builder = BrowserConfig::builder()
        .window_size(engine.viewport.width, engine.viewport.height)
        .args(engine_args(engine, instance_id));

    if let Some(chrome_path) = &engine.chrome_path {
        builder = builder.chrome_executable(chrome_path);
    }

    builder.build().map_err(ConvertError::LaunchFailed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.orchestrator.max_fallback_attempts, 3);
        assert_eq!(config.pool.max_instances, 3);
        assert_eq!(config.remote.health_check.failure_threshold, 3);
        assert_eq!(config.capability.weights.engine, 0.5);
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let config = Config::from_json(
            r#"{ "pool": { "max_instances": 7 }, "orchestrator": { "priority_order": ["canvas", "markup"] } }"#,
        )
        .expect("parse");
        assert_eq!(config.pool.max_instances, 7);
        assert!(config.pool.reuse_instances);
        assert_eq!(
            config.orchestrator.priority_order,
            Some(vec![BackendId::Canvas, BackendId::Markup])
        );
        assert_eq!(config.stream.chunk_size, 64 * 1024);
    }

    #[test]
    fn rejects_zero_pool() {
        let mut config = Config::default();
        config.pool.max_instances = 0;
        assert!(matches!(
            config.validate(),
            Err(ConvertError::ConfigurationError(_))
        ));
    }

    #[test]
    fn rejects_inverted_retry_delays() {
        let mut config = Config::default();
        config.remote.retry.base_delay = Duration::from_secs(20);
        assert!(config.validate().is_err());
    }

    #[test]
    fn zero_fallback_attempts_is_valid() {
        let mut config = Config::default();
        config.orchestrator.max_fallback_attempts = 0;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn engine_args_are_isolated_per_instance() {
        let engine = EngineConfig::default();
        let first = engine_args(&engine, 0);
        let second = engine_args(&engine, 1);
        assert!(first.contains(&"--headless".to_string()));
        assert!(first.contains(&"--disable-gpu".to_string()));
        assert!(first.contains(&"--disable-extensions".to_string()));
        let profile = |args: &[String]| {
            args.iter()
                .find(|a| a.starts_with("--user-data-dir="))
                .cloned()
        };
        assert_ne!(profile(&first), profile(&second));
    }
}
