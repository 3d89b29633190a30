//! Runtime capability probing
//!
//! A [`CapabilityProbe`] asks a host-supplied [`CapabilityProvider`] which
//! tiers are present and how fast they are, and folds the answers into a
//! [`CapabilityAssessment`]. Probing never fails: a missing tier, a failed
//! benchmark or a probe that runs past its timeout all come back as
//! `available = false, performance = 0`.

use crate::backends::canvas::render_preview;
use crate::config::{CanvasConfig, CapabilityConfig, EngineConfig, ScoreWeights, TierThresholds};
use crate::converter::BackendId;
use crate::engine::find_engine_executable;
use crate::remote_client::RemoteServiceClient;
use crate::{ConvertError, TargetFormat};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tokio::time::timeout;
use tracing::{debug, info};

/// What the host knows about one tier before benchmarking it.
#[derive(Debug, Clone, Default)]
pub struct BackendSignals {
    pub present: bool,
    pub details: serde_json::Map<String, serde_json::Value>,
}

impl BackendSignals {
    pub fn present() -> Self {
        Self {
            present: true,
            details: serde_json::Map::new(),
        }
    }

    pub fn absent(reason: &str) -> Self {
        let mut details = serde_json::Map::new();
        details.insert("reason".to_string(), json!(reason));
        Self {
            present: false,
            details,
        }
    }

    pub fn with_detail(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.details.insert(key.to_string(), value.into());
        self
    }
}

/// Host description of which tiers are linked in and usable.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CapabilityProvider: Send + Sync {
    async fn signals(&self, backend: BackendId) -> BackendSignals;

    /// Bounded micro-benchmark scoring the tier in `[0, 1]`.
    async fn benchmark(&self, backend: BackendId, intensive: bool) -> Result<f64, ConvertError>;
}

#[derive(Debug, Clone, Serialize)]
pub struct BackendCapability {
    pub backend: BackendId,
    pub available: bool,
    pub performance: f64,
    pub details: serde_json::Map<String, serde_json::Value>,
}

impl BackendCapability {
    fn unavailable(backend: BackendId, mut details: serde_json::Map<String, serde_json::Value>, reason: impl Into<String>) -> Self {
        details
            .entry("reason")
            .or_insert_with(|| json!(reason.into()));
        Self {
            backend,
            available: false,
            performance: 0.0,
            details,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CapabilityAssessment {
    pub backend_scores: BTreeMap<BackendId, BackendCapability>,
    pub overall_score: f64,
    pub recommended_tier: BackendId,
    pub timestamp: DateTime<Utc>,
}

impl CapabilityAssessment {
    pub fn is_available(&self, backend: BackendId) -> bool {
        self.backend_scores
            .get(&backend)
            .map(|c| c.available)
            .unwrap_or(false)
    }

    /// Available tiers in fixed priority order.
    pub fn available_tiers(&self) -> Vec<BackendId> {
        BackendId::PRIORITY
            .into_iter()
            .filter(|id| self.is_available(*id))
            .collect()
    }

    /// Human-readable notes about missing or slow tiers.
    pub fn limitations(&self) -> Vec<String> {
        self.backend_scores
            .values()
            .filter(|c| !c.available)
            .map(|c| match c.details.get("reason").and_then(|r| r.as_str()) {
                Some(reason) => format!("{} tier unavailable: {}", c.backend, reason),
                None => format!("{} tier unavailable", c.backend),
            })
            .collect()
    }
}

#[derive(Debug, Clone)]
pub struct DetectOptions {
    pub intensive: bool,
    pub timeout: Duration,
    pub skip_performance_tests: bool,
}

impl From<&CapabilityConfig> for DetectOptions {
    fn from(config: &CapabilityConfig) -> Self {
        Self {
            intensive: config.intensive,
            timeout: config.probe_timeout,
            skip_performance_tests: config.skip_performance_tests,
        }
    }
}

#[derive(Debug, Clone)]
pub struct AssessmentOptions {
    pub cache: bool,
    pub timeout: Duration,
}

impl From<&CapabilityConfig> for AssessmentOptions {
    fn from(config: &CapabilityConfig) -> Self {
        Self {
            cache: config.cache,
            timeout: config.probe_timeout,
        }
    }
}

/// Minimum performance a tier needs before it counts as usable.
fn threshold_for(backend: BackendId, thresholds: &TierThresholds) -> Option<f64> {
    match backend {
        BackendId::Engine => Some(thresholds.engine),
        BackendId::Canvas => Some(thresholds.canvas),
        BackendId::Remote => Some(0.0),
        BackendId::Markup => None,
    }
}

fn meets_threshold(backend: BackendId, performance: f64, thresholds: &TierThresholds) -> bool {
    threshold_for(backend, thresholds)
        .map(|min| performance > min)
        .unwrap_or(true)
}

/// Weighted sum of the available tiers' performance, capped at 1.
pub fn overall_score(scores: &BTreeMap<BackendId, BackendCapability>, weights: &ScoreWeights) -> f64 {
    let performance = |backend| {
        scores
            .get(&backend)
            .filter(|c| c.available)
            .map(|c| c.performance)
            .unwrap_or(0.0)
    };
    let score = weights.engine * performance(BackendId::Engine)
        + weights.canvas * performance(BackendId::Canvas)
        + weights.network * performance(BackendId::Remote);
    score.clamp(0.0, 1.0)
}

/// First tier in priority order that is available and clears its threshold.
/// Markup is the answer when nothing else is.
pub fn recommend_tier(scores: &BTreeMap<BackendId, BackendCapability>, thresholds: &TierThresholds) -> BackendId {
    BackendId::PRIORITY
        .into_iter()
        .find(|backend| {
            scores
                .get(backend)
                .map(|c| c.available && meets_threshold(*backend, c.performance, thresholds))
                .unwrap_or(false)
        })
        .unwrap_or(BackendId::Markup)
}

pub struct CapabilityProbe {
    provider: Arc<dyn CapabilityProvider>,
    config: CapabilityConfig,
    cache: RwLock<Option<CapabilityAssessment>>,
}

impl CapabilityProbe {
    pub fn new(provider: Arc<dyn CapabilityProvider>, config: CapabilityConfig) -> Self {
        Self {
            provider,
            config,
            cache: RwLock::new(None),
        }
    }

    pub fn config(&self) -> &CapabilityConfig {
        &self.config
    }

    pub async fn detect(&self, backend: BackendId, options: &DetectOptions) -> BackendCapability {
        let signals = match timeout(options.timeout, self.provider.signals(backend)).await {
            Ok(signals) => signals,
            Err(_) => {
                return BackendCapability::unavailable(backend, Default::default(), "signal probe timed out")
            }
        };
        if !signals.present {
            return BackendCapability::unavailable(backend, signals.details, "not present on this host");
        }
        let mut details = signals.details;

        let performance = if options.skip_performance_tests {
            self.config.baseline_performance
        } else {
            let started = Instant::now();
            let outcome = timeout(
                options.timeout,
                self.provider.benchmark(backend, options.intensive),
            )
            .await;
            details.insert("benchmark_ms".to_string(), json!(started.elapsed().as_millis() as u64));
            match outcome {
                Ok(Ok(score)) if score.is_finite() => score.clamp(0.0, 1.0),
                Ok(Ok(score)) => {
                    return BackendCapability::unavailable(backend, details, format!("benchmark returned {score}"))
                }
                Ok(Err(e)) => return BackendCapability::unavailable(backend, details, e.to_string()),
                Err(_) => return BackendCapability::unavailable(backend, details, "benchmark timed out"),
            }
        };

        let available = meets_threshold(backend, performance, &self.config.thresholds);
        if let Some(min) = threshold_for(backend, &self.config.thresholds) {
            details.insert("threshold".to_string(), json!(min));
        }
        if !available {
            details.insert(
                "reason".to_string(),
                json!(format!("performance {performance:.2} below threshold")),
            );
        }

        debug!(
            "Detected {}: available={} performance={:.2}",
            backend, available, performance
        );
        BackendCapability {
            backend,
            available,
            performance,
            details,
        }
    }

    /// Probe every tier concurrently and score the result.
    pub async fn get_complete_assessment(&self, options: &AssessmentOptions) -> CapabilityAssessment {
        if options.cache {
            if let Some(cached) = self.cache.read().await.clone() {
                return cached;
            }
        }

        let detect = DetectOptions {
            timeout: options.timeout,
            ..DetectOptions::from(&self.config)
        };
        let (engine, canvas, remote, markup) = tokio::join!(
            self.detect(BackendId::Engine, &detect),
            self.detect(BackendId::Canvas, &detect),
            self.detect(BackendId::Remote, &detect),
            self.detect(BackendId::Markup, &detect),
        );

        let backend_scores: BTreeMap<BackendId, BackendCapability> = [engine, canvas, remote, markup]
            .into_iter()
            .map(|c| (c.backend, c))
            .collect();
        let assessment = CapabilityAssessment {
            overall_score: overall_score(&backend_scores, &self.config.weights),
            recommended_tier: recommend_tier(&backend_scores, &self.config.thresholds),
            backend_scores,
            timestamp: Utc::now(),
        };

        info!(
            "Capability assessment: recommended={} overall={:.2}",
            assessment.recommended_tier, assessment.overall_score
        );
        *self.cache.write().await = Some(assessment.clone());
        assessment
    }

    /// Assessment with the configured cache policy and timeout.
    pub async fn assess(&self) -> CapabilityAssessment {
        self.get_complete_assessment(&AssessmentOptions::from(&self.config))
            .await
    }

    pub async fn get_recommended_tier(&self, assessment: Option<&CapabilityAssessment>) -> BackendId {
        match assessment {
            Some(assessment) => recommend_tier(&assessment.backend_scores, &self.config.thresholds),
            None => self.assess().await.recommended_tier,
        }
    }

    pub async fn clear_cache(&self) {
        *self.cache.write().await = None;
    }

    pub async fn has_capability(&self, backend: BackendId) -> bool {
        if let Some(cached) = self.cache.read().await.as_ref() {
            return cached.is_available(backend);
        }
        self.detect(backend, &DetectOptions::from(&self.config))
            .await
            .available
    }
}

const BENCHMARK_MARKUP: &str = "<h1>Capability probe</h1><p>The quick brown fox jumps over the lazy dog.</p>";

/// Probes the real host: engine binary on disk, the built-in drawing surface
/// and the registered remote services.
pub struct HostCapabilities {
    engine: EngineConfig,
    canvas: CanvasConfig,
    remote: Option<Arc<RemoteServiceClient>>,
}

impl HostCapabilities {
    pub fn new(engine: EngineConfig, canvas: CanvasConfig, remote: Option<Arc<RemoteServiceClient>>) -> Self {
        Self {
            engine,
            canvas,
            remote,
        }
    }

    async fn benchmark_engine(&self, intensive: bool) -> Result<f64, ConvertError> {
        let executable = find_engine_executable(&self.engine)
            .ok_or_else(|| ConvertError::BackendUnavailable("engine executable not found".to_string()))?;
        let runs: u32 = if intensive { 3 } else { 1 };
        let budget = Duration::from_secs(2);

        let started = Instant::now();
        for _ in 0..runs {
            let output = tokio::process::Command::new(&executable)
                .arg("--version")
                .kill_on_drop(true)
                .output()
                .await?;
            if !output.status.success() {
                return Err(ConvertError::LaunchFailed(format!(
                    "{} --version exited with {}",
                    executable.display(),
                    output.status
                )));
            }
        }
        let per_run = started.elapsed() / runs;
        Ok(1.0 - per_run.as_secs_f64() / budget.as_secs_f64())
    }

    async fn benchmark_canvas(&self, intensive: bool) -> Result<f64, ConvertError> {
        let repeat = if intensive { 40 } else { 4 };
        let markup = BENCHMARK_MARKUP.repeat(repeat);
        let config = self.canvas.clone();
        let budget = Duration::from_millis(500);

        let started = Instant::now();
        tokio::task::spawn_blocking(move || render_preview(&markup, &config, TargetFormat::Png))
            .await
            .map_err(|e| ConvertError::RenderFailed(e.to_string()))??;
        Ok(1.0 - started.elapsed().as_secs_f64() / budget.as_secs_f64())
    }

    async fn benchmark_remote(&self, intensive: bool) -> Result<f64, ConvertError> {
        let client = self
            .remote
            .as_ref()
            .ok_or_else(|| ConvertError::BackendUnavailable("no remote client".to_string()))?;
        if intensive {
            client.health_check_all().await;
        }

        let categories: BTreeSet<String> = client
            .services()
            .iter()
            .map(|s| s.category.to_ascii_lowercase())
            .collect();
        let selectable: usize = categories
            .iter()
            .map(|category| client.get_available_services(category).len())
            .sum();
        let total = client.services().len().max(1);
        Ok(selectable as f64 / total as f64)
    }
}

#[async_trait]
impl CapabilityProvider for HostCapabilities {
    async fn signals(&self, backend: BackendId) -> BackendSignals {
        match backend {
            BackendId::Engine => match find_engine_executable(&self.engine) {
                Some(path) => BackendSignals::present().with_detail("executable", path.display().to_string()),
                None => BackendSignals::absent("engine executable not found"),
            },
            BackendId::Canvas => BackendSignals::present()
                .with_detail("surface", "image")
                .with_detail("width", self.canvas.width),
            BackendId::Remote => match &self.remote {
                Some(client) if !client.services().is_empty() => BackendSignals::present()
                    .with_detail("services", client.services().len())
                    .with_detail(
                        "formats",
                        client
                            .output_formats()
                            .iter()
                            .map(|f| f.extension())
                            .collect::<Vec<_>>(),
                    ),
                Some(_) => BackendSignals::absent("no services registered"),
                None => BackendSignals::absent("remote tier disabled"),
            },
            BackendId::Markup => BackendSignals::present(),
        }
    }

    async fn benchmark(&self, backend: BackendId, intensive: bool) -> Result<f64, ConvertError> {
        match backend {
            BackendId::Engine => self.benchmark_engine(intensive).await,
            BackendId::Canvas => self.benchmark_canvas(intensive).await,
            BackendId::Remote => self.benchmark_remote(intensive).await,
            BackendId::Markup => Ok(1.0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockall::predicate::{always, eq};

    fn scenario_provider() -> MockCapabilityProvider {
        let mut provider = MockCapabilityProvider::new();
        provider.expect_signals().returning(|backend| match backend {
            BackendId::Engine => BackendSignals::absent("no engine transport"),
            BackendId::Remote => BackendSignals::present().with_detail("cors", true),
            _ => BackendSignals::present(),
        });
        provider.expect_benchmark().returning(|backend, _| match backend {
            BackendId::Canvas => Ok(0.6),
            _ => Ok(1.0),
        });
        provider
    }

    fn probe(provider: MockCapabilityProvider) -> CapabilityProbe {
        CapabilityProbe::new(Arc::new(provider), CapabilityConfig::default())
    }

    #[tokio::test]
    async fn canvas_recommended_without_engine() {
        let probe = probe(scenario_provider());
        let assessment = probe.assess().await;

        assert_eq!(assessment.recommended_tier, BackendId::Canvas);
        assert!(!assessment.is_available(BackendId::Engine));
        assert_eq!(assessment.backend_scores[&BackendId::Engine].performance, 0.0);
        assert!((assessment.overall_score - (0.3 * 0.6 + 0.2 * 1.0)).abs() < 1e-9);
        assert_eq!(
            assessment.available_tiers(),
            vec![BackendId::Canvas, BackendId::Remote, BackendId::Markup]
        );
        assert_eq!(assessment.limitations().len(), 1);
    }

    #[tokio::test]
    async fn slow_engine_falls_below_threshold() {
        let mut provider = MockCapabilityProvider::new();
        provider.expect_signals().returning(|_| BackendSignals::present());
        provider
            .expect_benchmark()
            .with(always(), eq(false))
            .returning(|backend, _| match backend {
                BackendId::Engine => Ok(0.5),
                _ => Ok(0.9),
            });

        let probe = probe(provider);
        let engine = probe
            .detect(BackendId::Engine, &DetectOptions::from(probe.config()))
            .await;
        assert!(!engine.available);
        assert_eq!(engine.performance, 0.5);
        assert_eq!(probe.assess().await.recommended_tier, BackendId::Canvas);
    }

    #[tokio::test]
    async fn failing_benchmark_means_unavailable() {
        let mut provider = MockCapabilityProvider::new();
        provider.expect_signals().returning(|_| BackendSignals::present());
        provider
            .expect_benchmark()
            .returning(|_, _| Err(ConvertError::LaunchFailed("crashed".into())));

        let probe = probe(provider);
        let canvas = probe
            .detect(BackendId::Canvas, &DetectOptions::from(probe.config()))
            .await;
        assert!(!canvas.available);
        assert_eq!(canvas.performance, 0.0);
        assert!(canvas.details["reason"].as_str().unwrap_or_default().contains("crashed"));
    }

    #[tokio::test]
    async fn skipping_benchmarks_uses_baseline() {
        let mut provider = MockCapabilityProvider::new();
        provider.expect_signals().returning(|_| BackendSignals::present());
        provider.expect_benchmark().never();

        let probe = probe(provider);
        let options = DetectOptions {
            skip_performance_tests: true,
            ..DetectOptions::from(probe.config())
        };
        let engine = probe.detect(BackendId::Engine, &options).await;
        assert!(engine.available);
        assert_eq!(engine.performance, 0.7);
    }

    #[tokio::test]
    async fn cached_assessment_until_cleared() {
        let mut provider = MockCapabilityProvider::new();
        provider
            .expect_signals()
            .times(8)
            .returning(|_| BackendSignals::present());
        provider.expect_benchmark().returning(|_, _| Ok(0.9));

        let probe = probe(provider);
        let cached = AssessmentOptions {
            cache: true,
            timeout: Duration::from_secs(1),
        };
        let first = probe.get_complete_assessment(&cached).await;
        let second = probe.get_complete_assessment(&cached).await;
        assert_eq!(first.timestamp, second.timestamp);
        assert!(probe.has_capability(BackendId::Engine).await);

        probe.clear_cache().await;
        let third = probe
            .get_complete_assessment(&AssessmentOptions {
                cache: false,
                ..cached
            })
            .await;
        assert_eq!(third.recommended_tier, BackendId::Engine);
    }

    struct HangingProvider;

    #[async_trait]
    impl CapabilityProvider for HangingProvider {
        async fn signals(&self, _backend: BackendId) -> BackendSignals {
            std::future::pending().await
        }

        async fn benchmark(&self, _backend: BackendId, _intensive: bool) -> Result<f64, ConvertError> {
            Ok(1.0)
        }
    }

    #[tokio::test(start_paused = true)]
    async fn hanging_probe_times_out_as_unavailable() {
        let probe = CapabilityProbe::new(Arc::new(HangingProvider), CapabilityConfig::default());
        let assessment = probe.assess().await;
        assert!(assessment.backend_scores.values().all(|c| !c.available));
        assert_eq!(assessment.recommended_tier, BackendId::Markup);
        assert_eq!(assessment.overall_score, 0.0);
    }

    #[tokio::test]
    async fn recommendation_respects_thresholds_on_supplied_assessment() {
        let probe = probe(scenario_provider());
        let mut assessment = probe.assess().await;
        engine_mut(&mut assessment).available = true;
        engine_mut(&mut assessment).performance = 0.55;
        assert_eq!(probe.get_recommended_tier(Some(&assessment)).await, BackendId::Canvas);

        engine_mut(&mut assessment).performance = 0.65;
        assert_eq!(probe.get_recommended_tier(Some(&assessment)).await, BackendId::Engine);
    }

    fn engine_mut(assessment: &mut CapabilityAssessment) -> &mut BackendCapability {
        assessment
            .backend_scores
            .get_mut(&BackendId::Engine)
            .expect("engine entry")
    }

    #[tokio::test]
    async fn host_capabilities_probe_builtin_tiers() {
        let host = HostCapabilities::new(
            EngineConfig {
                chrome_path: Some("/nonexistent/chromium".to_string()),
                ..Default::default()
            },
            CanvasConfig::default(),
            None,
        );
        assert!(!host.signals(BackendId::Engine).await.present);
        assert!(!host.signals(BackendId::Remote).await.present);
        assert!(host.signals(BackendId::Canvas).await.present);
        assert!(host.signals(BackendId::Markup).await.present);

        let score = host.benchmark(BackendId::Canvas, false).await.expect("canvas bench");
        assert!(score <= 1.0);
    }
}
