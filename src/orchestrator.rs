//! Tier orchestration with bounded fallback
//!
//! The [`TierOrchestrator`] is the single `convert` entry point. It asks the
//! capability probe which tiers are usable, orders the candidates, validates
//! the document once against the first of them and then walks the list until
//! a tier succeeds or `max_fallback_attempts` fallbacks have been spent.

use crate::backends::{CanvasBackend, EngineBackend, MarkupBackend, RemoteBackend};
use crate::capability::{CapabilityAssessment, CapabilityProbe, CapabilityProvider, HostCapabilities};
use crate::config::{Config, DEFAULT_MEMORY_LIMIT};
use crate::converter::{BackendId, ConversionContext, Converter};
use crate::engine::{ChromiumLauncher, EngineLauncher};
use crate::process_pool::ProcessPool;
use crate::remote_client::RemoteServiceClient;
use crate::stream::ChunkStream;
use crate::{
    AttemptRecord, CancellationSignal, CascadeFailure, ConversionMetadata, ConversionResult, ConvertError,
    Document, Metrics, PressureLevel, PressureMonitor, TargetFormat,
};
use serde::Serialize;
use std::collections::BTreeMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Instant;
use tracing::{debug, error, info, warn};

/// Where a conversion currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversionState {
    Idle,
    AssessmentReady,
    TierSelected,
    Validating,
    Converting,
    FallbackTriggered,
    Succeeded,
    Failed,
}

/// Emitted every time the cascade moves on to another tier.
#[derive(Debug, Clone, Serialize)]
pub struct FallbackEvent {
    pub from_tier: String,
    pub to_tier: String,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProgressUpdate {
    pub percentage: u8,
    pub state: ConversionState,
    pub operation: String,
    pub limitations: Vec<String>,
    pub recommendations: Vec<String>,
}

pub type FallbackObserver = Arc<dyn Fn(&FallbackEvent) + Send + Sync>;
pub type ProgressCallback = Arc<dyn Fn(&ProgressUpdate) + Send + Sync>;

/// Output of [`TierOrchestrator::convert_streaming`].
pub struct StreamingConversion {
    pub mime_type: String,
    pub metadata: ConversionMetadata,
    pub stream: ChunkStream,
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Multi-tier document converter with capability-driven fallback.
///
/// # Examples
///
/// ```rust,no_run
/// use render_tiers::{Config, Document, TargetFormat, TierOrchestrator};
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let orchestrator = TierOrchestrator::builder(Config::default()).build().await?;
///
///     let doc = Document::new("<h1>Invoice</h1><p>Total: 42</p>").with_title("Invoice");
///     let result = orchestrator.convert(&doc, Some(TargetFormat::Pdf)).await?;
///     println!("{} produced {} bytes", result.metadata.tier, result.content.len());
///
///     orchestrator.shutdown().await;
///     Ok(())
/// }
/// ```
pub struct TierOrchestrator {
    config: Config,
    probe: Arc<CapabilityProbe>,
    backends: BTreeMap<BackendId, Arc<dyn Converter>>,
    extensions: RwLock<Vec<Arc<dyn Converter>>>,
    observers: RwLock<Vec<FallbackObserver>>,
    progress: RwLock<Vec<ProgressCallback>>,
    pool: Option<ProcessPool>,
    remote: Option<Arc<RemoteServiceClient>>,
    pressure: Arc<PressureMonitor>,
    metrics: Arc<Metrics>,
}

pub struct TierOrchestratorBuilder {
    config: Config,
    provider: Option<Arc<dyn CapabilityProvider>>,
    launcher: Option<Arc<dyn EngineLauncher>>,
    pressure: Option<Arc<PressureMonitor>>,
    metrics: Option<Arc<Metrics>>,
    backends: Vec<Arc<dyn Converter>>,
    enable_remote: bool,
}

impl TierOrchestratorBuilder {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            provider: None,
            launcher: None,
            pressure: None,
            metrics: None,
            backends: Vec::new(),
            enable_remote: true,
        }
    }

    /// Replace host probing with an explicit description of the platform.
    pub fn capability_provider(mut self, provider: Arc<dyn CapabilityProvider>) -> Self {
        self.provider = Some(provider);
        self
    }

    pub fn launcher(mut self, launcher: Arc<dyn EngineLauncher>) -> Self {
        self.launcher = Some(launcher);
        self
    }

    pub fn pressure_monitor(mut self, pressure: Arc<PressureMonitor>) -> Self {
        self.pressure = Some(pressure);
        self
    }

    pub fn metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Replace the built-in tier with the same `backend_id`.
    pub fn backend(mut self, backend: Arc<dyn Converter>) -> Self {
        self.backends.push(backend);
        self
    }

    pub fn without_remote(mut self) -> Self {
        self.enable_remote = false;
        self
    }

    pub async fn build(self) -> Result<TierOrchestrator, ConvertError> {
        let config = self.config;
        config.validate()?;

        let metrics = self.metrics.unwrap_or_else(|| Arc::new(Metrics::new()));
        let pressure = self.pressure.unwrap_or_else(|| {
            Arc::new(PressureMonitor::new(
                config.memory_limit.unwrap_or(DEFAULT_MEMORY_LIMIT),
            ))
        });

        let mut overrides: BTreeMap<BackendId, Arc<dyn Converter>> = BTreeMap::new();
        for backend in self.backends {
            match backend.backend_id() {
                Some(id) => {
                    overrides.insert(id, backend);
                }
                None => {
                    return Err(ConvertError::ConfigurationError(format!(
                        "backend '{}' has no tier id; register it as an extension",
                        backend.name()
                    )))
                }
            }
        }

        let remote = if self.enable_remote && !overrides.contains_key(&BackendId::Remote) {
            let client = Arc::new(RemoteServiceClient::with_metrics(
                config.remote.clone(),
                metrics.clone(),
            )?);
            if client.services().is_empty() {
                None
            } else {
                client.start_health_checks();
                Some(client)
            }
        } else {
            None
        };

        let mut backends: BTreeMap<BackendId, Arc<dyn Converter>> = BTreeMap::new();
        let mut pool = None;
        if !overrides.contains_key(&BackendId::Engine) {
            let launcher = self
                .launcher
                .unwrap_or_else(|| Arc::new(ChromiumLauncher::new(config.engine.clone())));
            let engine_pool = ProcessPool::with_monitoring(
                config.pool.clone(),
                launcher,
                Some(pressure.clone()),
                metrics.clone(),
            );
            engine_pool.spawn_sweeper();
            backends.insert(
                BackendId::Engine,
                Arc::new(EngineBackend::new(engine_pool.clone(), &config.engine)),
            );
            pool = Some(engine_pool);
        }
        backends.insert(BackendId::Canvas, Arc::new(CanvasBackend::new(config.canvas.clone())));
        if let Some(client) = &remote {
            backends.insert(
                BackendId::Remote,
                Arc::new(RemoteBackend::new(client.clone(), config.remote.max_document_size)),
            );
        }
        backends.insert(BackendId::Markup, Arc::new(MarkupBackend::new(config.markup.clone())));
        backends.extend(overrides);

        let provider = self.provider.unwrap_or_else(|| {
            Arc::new(HostCapabilities::new(
                config.engine.clone(),
                config.canvas.clone(),
                remote.clone(),
            ))
        });
        let probe = Arc::new(CapabilityProbe::new(provider, config.capability.clone()));

        info!(
            "Tier orchestrator ready with tiers: {}",
            backends.keys().map(|id| id.as_str()).collect::<Vec<_>>().join(", ")
        );

        Ok(TierOrchestrator {
            config,
            probe,
            backends,
            extensions: RwLock::new(Vec::new()),
            observers: RwLock::new(Vec::new()),
            progress: RwLock::new(Vec::new()),
            pool,
            remote,
            pressure,
            metrics,
        })
    }
}

impl TierOrchestrator {
    pub fn builder(config: Config) -> TierOrchestratorBuilder {
        TierOrchestratorBuilder::new(config)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn probe(&self) -> &Arc<CapabilityProbe> {
        &self.probe
    }

    pub fn pool(&self) -> Option<&ProcessPool> {
        self.pool.as_ref()
    }

    pub fn remote(&self) -> Option<&Arc<RemoteServiceClient>> {
        self.remote.as_ref()
    }

    pub fn pressure(&self) -> &Arc<PressureMonitor> {
        &self.pressure
    }

    pub fn backend(&self, id: BackendId) -> Option<&Arc<dyn Converter>> {
        self.backends.get(&id)
    }

    /// Extensions that can handle the requested format take precedence over
    /// every built-in tier.
    pub fn register_extension(&self, extension: Arc<dyn Converter>) {
        info!("Registered extension converter '{}'", extension.name());
        write(&self.extensions).push(extension);
    }

    pub fn on_fallback<F>(&self, observer: F)
    where
        F: Fn(&FallbackEvent) + Send + Sync + 'static,
    {
        write(&self.observers).push(Arc::new(observer));
    }

    pub fn on_progress<F>(&self, callback: F)
    where
        F: Fn(&ProgressUpdate) + Send + Sync + 'static,
    {
        write(&self.progress).push(Arc::new(callback));
    }

    fn notify_fallback(&self, event: &FallbackEvent) {
        let observers = read(&self.observers).clone();
        for observer in observers {
            if catch_unwind(AssertUnwindSafe(|| observer(event))).is_err() {
                error!("Fallback observer panicked; ignoring");
            }
        }
    }

    fn report(&self, update: ProgressUpdate) {
        debug!("[{:>3}%] {:?}: {}", update.percentage, update.state, update.operation);
        let callbacks = read(&self.progress).clone();
        for callback in callbacks {
            if catch_unwind(AssertUnwindSafe(|| callback(&update))).is_err() {
                error!("Progress callback panicked; ignoring");
            }
        }
    }

    fn progress(&self, percentage: u8, state: ConversionState, operation: impl Into<String>) {
        self.report(ProgressUpdate {
            percentage,
            state,
            operation: operation.into(),
            limitations: Vec::new(),
            recommendations: Vec::new(),
        });
    }

    fn limitations(&self, assessment: &CapabilityAssessment) -> Vec<String> {
        let mut limitations = assessment.limitations();
        match self.pressure.check() {
            PressureLevel::Normal => {}
            level => limitations.push(format!(
                "memory pressure {:?} ({:.1}% of limit); new engine processes may be refused",
                level,
                self.pressure.get_usage_percentage()
            )),
        }
        limitations
    }

    fn recommendations(assessment: &CapabilityAssessment) -> Vec<String> {
        let mut recommendations = Vec::new();
        if !assessment.is_available(BackendId::Engine) {
            recommendations.push(
                "Install Chromium or set engine.chrome_path for full-fidelity output".to_string(),
            );
        }
        if !assessment.is_available(BackendId::Remote) {
            recommendations.push("Register a remote conversion service as a network fallback".to_string());
        }
        recommendations
    }

    fn is_usable(&self, id: BackendId, assessment: &CapabilityAssessment) -> bool {
        id == BackendId::Markup || assessment.is_available(id)
    }

    /// Ordered candidate tiers for `target`.
    pub fn candidates(&self, assessment: &CapabilityAssessment, target: TargetFormat) -> Vec<Arc<dyn Converter>> {
        let mut candidates: Vec<Arc<dyn Converter>> = read(&self.extensions)
            .iter()
            .filter(|extension| extension.can_handle(target.mime_type()))
            .cloned()
            .collect();

        let order: Vec<BackendId> = match &self.config.orchestrator.priority_order {
            Some(order) => order.clone(),
            None => std::iter::once(assessment.recommended_tier)
                .chain(BackendId::PRIORITY)
                .collect(),
        };

        let mut seen = Vec::new();
        for id in order {
            if seen.contains(&id) || !self.is_usable(id, assessment) {
                continue;
            }
            if let Some(backend) = self.backends.get(&id) {
                if backend.output_formats().contains(&target) {
                    seen.push(id);
                    candidates.push(backend.clone());
                }
            }
        }

        if self.config.orchestrator.allow_format_downgrade && !seen.contains(&BackendId::Markup) {
            if let Some(markup) = self.backends.get(&BackendId::Markup) {
                candidates.push(markup.clone());
            }
        }
        candidates
    }

    pub async fn convert(
        &self,
        document: &Document,
        target: Option<TargetFormat>,
    ) -> Result<ConversionResult, CascadeFailure> {
        self.convert_with_cancel(document, target, &CancellationSignal::new())
            .await
    }

    pub async fn convert_with_cancel(
        &self,
        document: &Document,
        target: Option<TargetFormat>,
        cancel: &CancellationSignal,
    ) -> Result<ConversionResult, CascadeFailure> {
        let started = Instant::now();
        let target = target.unwrap_or(self.config.orchestrator.default_target);
        let fail = |error: ConvertError, attempts: Vec<AttemptRecord>| -> Result<ConversionResult, CascadeFailure> {
            self.metrics.record_conversion("none", started.elapsed(), false);
            self.progress(100, ConversionState::Failed, error.to_string());
            Err(CascadeFailure::new(error, attempts, started.elapsed()))
        };

        self.progress(0, ConversionState::Idle, format!("Converting {} to {}", document.id, target));
        let assessment = self.probe.assess().await;
        self.report(ProgressUpdate {
            percentage: 10,
            state: ConversionState::AssessmentReady,
            operation: format!("Recommended tier: {}", assessment.recommended_tier),
            limitations: self.limitations(&assessment),
            recommendations: Self::recommendations(&assessment),
        });

        let candidates = self.candidates(&assessment, target);
        let Some(first) = candidates.first() else {
            return fail(
                ConvertError::BackendUnavailable(format!("no available tier can produce {target}")),
                Vec::new(),
            );
        };

        self.progress(20, ConversionState::Validating, format!("Validating against {}", first.name()));
        let report = first.validate(document);
        if !report.is_valid {
            self.metrics.record_validation_failure();
            let message = report.first_error().unwrap_or("document is invalid").to_string();
            warn!("Document {} rejected by {}: {}", document.id, first.name(), message);
            return fail(ConvertError::Validation(message), Vec::new());
        }
        for warning in &report.warnings {
            debug!("Validation warning from {}: {}", first.name(), warning);
        }

        let max_fallbacks = self.config.orchestrator.max_fallback_attempts;
        let mut attempts: Vec<AttemptRecord> = Vec::new();

        for (index, converter) in candidates.iter().enumerate() {
            if index > max_fallbacks {
                warn!("Fallback budget of {} exhausted", max_fallbacks);
                break;
            }
            if cancel.is_cancelled() {
                return fail(ConvertError::Cancelled, attempts);
            }

            let tier = converter.name().to_string();
            let attempt_started = Instant::now();
            self.progress(
                (30 + index * 60 / (max_fallbacks + 1)).min(90) as u8,
                ConversionState::TierSelected,
                format!("Selected tier {tier}"),
            );

            // The first candidate was validated above; later ones may have
            // tighter limits.
            let rejected = (index > 0)
                .then(|| converter.validate(document))
                .filter(|report| !report.is_valid);
            let outcome = if let Some(report) = rejected {
                Err(ConvertError::BackendUnavailable(format!(
                    "{tier} tier rejects the document: {}",
                    report.first_error().unwrap_or("invalid")
                )))
            } else {
                self.progress(
                    (35 + index * 60 / (max_fallbacks + 1)).min(95) as u8,
                    ConversionState::Converting,
                    format!("Converting with {tier}"),
                );
                let context = ConversionContext::with_cancel(target, cancel.clone());
                match converter.convert(document, &context).await {
                    Ok(result) if result.is_complete() => Ok(result),
                    Ok(result) => Err(ConvertError::RenderFailed(format!(
                        "{tier} returned an incomplete result ({} bytes of {})",
                        result.content.len(),
                        result.mime_type
                    ))),
                    Err(e) => Err(e),
                }
            };

            match outcome {
                Ok(mut result) => {
                    let elapsed = started.elapsed();
                    result.metadata.execution_time = elapsed;
                    result.metadata.fallback_attempts = attempts.len();
                    self.metrics.record_conversion(&tier, elapsed, true);
                    self.progress(100, ConversionState::Succeeded, format!("Converted with {tier}"));
                    info!(
                        "Converted {} to {} via {} in {:?} after {} fallback(s)",
                        document.id,
                        result.metadata.target_format,
                        tier,
                        elapsed,
                        attempts.len()
                    );
                    return Ok(result);
                }
                Err(e) => {
                    warn!("Tier {} failed: {}", tier, e);
                    let fatal = !e.triggers_fallback();
                    attempts.push(AttemptRecord {
                        tier: tier.clone(),
                        error: e.clone(),
                        elapsed: attempt_started.elapsed(),
                    });
                    if fatal {
                        return fail(e, attempts);
                    }

                    if let Some(next) = candidates.get(index + 1).filter(|_| index < max_fallbacks) {
                        self.metrics.record_fallback(&tier);
                        self.progress(
                            (30 + index * 60 / (max_fallbacks + 1)).min(90) as u8,
                            ConversionState::FallbackTriggered,
                            format!("Falling back from {tier} to {}", next.name()),
                        );
                        self.notify_fallback(&FallbackEvent {
                            from_tier: tier,
                            to_tier: next.name().to_string(),
                            reason: e.to_string(),
                        });
                    }
                }
            }
        }

        let last = attempts
            .last()
            .map(|a| a.error.clone())
            .unwrap_or_else(|| ConvertError::BackendUnavailable("no tier was attempted".to_string()));
        fail(last, attempts)
    }

    /// Convert, then hand the artifact out in bounded chunks.
    pub async fn convert_streaming(
        &self,
        document: &Document,
        target: Option<TargetFormat>,
        cancel: &CancellationSignal,
    ) -> Result<StreamingConversion, CascadeFailure> {
        let result = self.convert_with_cancel(document, target, cancel).await?;
        let stream = ChunkStream::spawn(
            result.content,
            self.config.stream.chunk_size,
            self.config.stream.buffer_chunks,
            cancel.clone(),
        );
        Ok(StreamingConversion {
            mime_type: result.mime_type,
            metadata: result.metadata,
            stream,
        })
    }

    /// Every format some usable tier or extension can produce.
    pub async fn get_supported_formats(&self) -> Vec<TargetFormat> {
        let assessment = self.probe.assess().await;
        let mut formats: Vec<TargetFormat> = Vec::new();

        for (id, backend) in &self.backends {
            if !self.is_usable(*id, &assessment) {
                debug!("Skipping formats of unavailable tier {}", id);
                continue;
            }
            formats.extend(backend.output_formats());
        }
        for extension in read(&self.extensions).iter() {
            formats.extend(extension.output_formats());
        }

        TargetFormat::ALL
            .into_iter()
            .filter(|format| formats.contains(format))
            .collect()
    }

    pub async fn shutdown(&self) {
        info!("Shutting down tier orchestrator...");
        if let Some(remote) = &self.remote {
            remote.stop_health_checks();
        }
        if let Some(pool) = &self.pool {
            pool.cleanup().await;
        }
        info!("Tier orchestrator shutdown complete");
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::capability::{BackendSignals, MockCapabilityProvider};
    use crate::config::OrchestratorConfig;
    use crate::ValidationReport;
    use async_trait::async_trait;
    use futures::StreamExt;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Scripted tier double: pops one outcome per call, succeeds once the
    /// script runs out.
    pub(crate) struct ScriptedTier {
        pub id: Option<BackendId>,
        pub name: String,
        pub formats: Vec<TargetFormat>,
        pub script: Mutex<VecDeque<ConvertError>>,
        pub calls: AtomicUsize,
        pub validation_error: Option<String>,
    }

    impl ScriptedTier {
        pub(crate) fn new(id: BackendId) -> Self {
            Self {
                id: Some(id),
                name: id.as_str().to_string(),
                formats: TargetFormat::ALL.to_vec(),
                script: Mutex::new(VecDeque::new()),
                calls: AtomicUsize::new(0),
                validation_error: None,
            }
        }

        pub(crate) fn failing(id: BackendId, errors: Vec<ConvertError>) -> Self {
            let tier = Self::new(id);
            *tier.script.lock().expect("script") = errors.into();
            tier
        }

        pub(crate) fn calls(&self) -> usize {
            self.calls.load(Ordering::Relaxed)
        }
    }

    #[async_trait]
    impl Converter for ScriptedTier {
        fn name(&self) -> &str {
            &self.name
        }

        fn backend_id(&self) -> Option<BackendId> {
            self.id
        }

        fn supported_content_types(&self) -> Vec<String> {
            crate::converter::markup_content_types()
        }

        fn output_format(&self) -> TargetFormat {
            self.formats[0]
        }

        fn output_formats(&self) -> Vec<TargetFormat> {
            self.formats.clone()
        }

        fn validate(&self, _document: &Document) -> ValidationReport {
            let mut report = ValidationReport::valid();
            if let Some(message) = &self.validation_error {
                report.error(message.clone());
            }
            report
        }

        async fn convert(
            &self,
            document: &Document,
            context: &ConversionContext,
        ) -> Result<ConversionResult, ConvertError> {
            self.calls.fetch_add(1, Ordering::Relaxed);
            if let Some(error) = self.script.lock().expect("script").pop_front() {
                return Err(error);
            }
            Ok(ConversionResult::new(
                format!("{} output", self.name).into_bytes(),
                context.target,
                document,
                self.name.clone(),
            ))
        }
    }

    pub(crate) fn provider(available: &'static [BackendId]) -> Arc<MockCapabilityProvider> {
        let mut provider = MockCapabilityProvider::new();
        provider.expect_signals().returning(move |backend| {
            if available.contains(&backend) {
                BackendSignals::present()
            } else {
                BackendSignals::absent("disabled in test")
            }
        });
        provider.expect_benchmark().returning(|_, _| Ok(0.9));
        Arc::new(provider)
    }

    pub(crate) async fn orchestrator(
        orchestrator: OrchestratorConfig,
        available: &'static [BackendId],
        tiers: Vec<Arc<dyn Converter>>,
    ) -> TierOrchestrator {
        let mut config = Config::default();
        config.orchestrator = orchestrator;
        config.capability.cache = false;
        let mut builder = TierOrchestrator::builder(config)
            .capability_provider(provider(available))
            .without_remote();
        for tier in tiers {
            builder = builder.backend(tier);
        }
        builder.build().await.expect("build orchestrator")
    }

    const ALL: &[BackendId] = &[BackendId::Engine, BackendId::Canvas, BackendId::Remote, BackendId::Markup];

    fn timeout_error() -> ConvertError {
        ConvertError::Timeout(std::time::Duration::from_secs(1))
    }

    #[tokio::test]
    async fn invalid_document_never_reaches_convert() {
        let mut engine = ScriptedTier::new(BackendId::Engine);
        engine.validation_error = Some("Document content is empty".to_string());
        let engine = Arc::new(engine);
        let canvas = Arc::new(ScriptedTier::new(BackendId::Canvas));

        let orchestrator = orchestrator(
            OrchestratorConfig::default(),
            ALL,
            vec![engine.clone(), canvas.clone()],
        )
        .await;
        let failure = orchestrator
            .convert(&Document::new(""), Some(TargetFormat::Pdf))
            .await
            .expect_err("invalid");

        assert!(matches!(&failure.error, ConvertError::Validation(m) if m == "Document content is empty"));
        assert!(failure.attempts.is_empty());
        assert_eq!(engine.calls(), 0);
        assert_eq!(canvas.calls(), 0);
    }

    #[tokio::test]
    async fn cascades_until_a_tier_succeeds() {
        let engine = Arc::new(ScriptedTier::failing(BackendId::Engine, vec![timeout_error()]));
        let canvas = Arc::new(ScriptedTier::failing(
            BackendId::Canvas,
            vec![ConvertError::RenderFailed("blank".into())],
        ));
        let remote = Arc::new(ScriptedTier::new(BackendId::Remote));

        let orchestrator = orchestrator(
            OrchestratorConfig::default(),
            ALL,
            vec![engine.clone(), canvas.clone(), remote.clone()],
        )
        .await;
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        orchestrator.on_fallback(move |event| sink.lock().expect("events").push(event.clone()));

        let result = orchestrator
            .convert(&Document::new("<p>x</p>"), Some(TargetFormat::Pdf))
            .await
            .expect("remote succeeds");

        assert_eq!(result.metadata.tier, "remote");
        assert_eq!(result.metadata.fallback_attempts, 2);
        let events = events.lock().expect("events");
        assert_eq!(events.len(), 2);
        assert_eq!((events[0].from_tier.as_str(), events[0].to_tier.as_str()), ("engine", "canvas"));
        assert_eq!((events[1].from_tier.as_str(), events[1].to_tier.as_str()), ("canvas", "remote"));
        assert!(events[0].reason.contains("Timeout"));
    }

    #[tokio::test]
    async fn fallback_budget_is_bounded() {
        let engine = Arc::new(ScriptedTier::failing(BackendId::Engine, vec![timeout_error()]));
        let canvas = Arc::new(ScriptedTier::failing(
            BackendId::Canvas,
            vec![ConvertError::RenderFailed("blank".into())],
        ));
        let remote = Arc::new(ScriptedTier::new(BackendId::Remote));

        let orchestrator = orchestrator(
            OrchestratorConfig {
                max_fallback_attempts: 1,
                ..Default::default()
            },
            ALL,
            vec![engine, canvas, remote.clone()],
        )
        .await;
        let failure = orchestrator
            .convert(&Document::new("<p>x</p>"), Some(TargetFormat::Pdf))
            .await
            .expect_err("budget exhausted");

        assert!(matches!(failure.error, ConvertError::RenderFailed(_)));
        assert_eq!(failure.tiers_tried(), vec!["engine", "canvas"]);
        assert_eq!(remote.calls(), 0);
    }

    #[tokio::test]
    async fn zero_fallback_budget_tries_only_the_primary() {
        let engine = Arc::new(ScriptedTier::failing(BackendId::Engine, vec![timeout_error()]));
        let canvas = Arc::new(ScriptedTier::new(BackendId::Canvas));

        let orchestrator = orchestrator(
            OrchestratorConfig {
                max_fallback_attempts: 0,
                ..Default::default()
            },
            ALL,
            vec![engine.clone(), canvas.clone()],
        )
        .await;
        let failure = orchestrator
            .convert(&Document::new("<p>x</p>"), Some(TargetFormat::Pdf))
            .await
            .expect_err("no fallback allowed");

        assert!(matches!(failure.error, ConvertError::Timeout(_)));
        assert_eq!(failure.tiers_tried(), vec!["engine"]);
        assert_eq!(engine.calls(), 1);
        assert_eq!(canvas.calls(), 0);
    }

    #[tokio::test]
    async fn unavailable_tier_is_never_primary() {
        let engine = Arc::new(ScriptedTier::new(BackendId::Engine));
        let canvas = Arc::new(ScriptedTier::new(BackendId::Canvas));

        let orchestrator = orchestrator(
            OrchestratorConfig::default(),
            &[BackendId::Canvas, BackendId::Markup],
            vec![engine.clone(), canvas],
        )
        .await;
        let result = orchestrator
            .convert(&Document::new("<p>x</p>"), Some(TargetFormat::Png))
            .await
            .expect("canvas");

        assert_eq!(result.metadata.tier, "canvas");
        assert_eq!(result.metadata.fallback_attempts, 0);
        assert_eq!(engine.calls(), 0);
    }

    #[tokio::test]
    async fn explicit_priority_order_wins() {
        let engine = Arc::new(ScriptedTier::new(BackendId::Engine));
        let remote = Arc::new(ScriptedTier::new(BackendId::Remote));

        let orchestrator = orchestrator(
            OrchestratorConfig {
                priority_order: Some(vec![BackendId::Remote, BackendId::Engine]),
                ..Default::default()
            },
            ALL,
            vec![engine.clone(), remote],
        )
        .await;
        let result = orchestrator
            .convert(&Document::new("<p>x</p>"), None)
            .await
            .expect("remote first");
        assert_eq!(result.metadata.tier, "remote");
        assert_eq!(engine.calls(), 0);
    }

    #[tokio::test]
    async fn extension_takes_precedence() {
        let engine = Arc::new(ScriptedTier::new(BackendId::Engine));
        let orchestrator = orchestrator(OrchestratorConfig::default(), ALL, vec![engine.clone()]).await;

        let mut extension = ScriptedTier::new(BackendId::Engine);
        extension.id = None;
        extension.name = "docx-export".to_string();
        extension.formats = vec![TargetFormat::Pdf];
        orchestrator.register_extension(Arc::new(extension));

        let result = orchestrator
            .convert(&Document::new("<p>x</p>"), Some(TargetFormat::Pdf))
            .await
            .expect("extension");
        assert_eq!(result.metadata.tier, "docx-export");
        assert_eq!(engine.calls(), 0);

        let png = orchestrator
            .convert(&Document::new("<p>x</p>"), Some(TargetFormat::Png))
            .await
            .expect("engine handles png");
        assert_eq!(png.metadata.tier, "engine");
    }

    #[tokio::test]
    async fn markup_is_the_terminal_fallback() {
        let engine = Arc::new(ScriptedTier::failing(BackendId::Engine, vec![timeout_error()]));
        let orchestrator = orchestrator(
            OrchestratorConfig::default(),
            &[BackendId::Engine, BackendId::Markup],
            vec![engine],
        )
        .await;

        let result = orchestrator
            .convert(&Document::new("<p>fine</p>"), Some(TargetFormat::Pdf))
            .await
            .expect("markup");
        assert_eq!(result.metadata.tier, "markup");
        assert_eq!(result.mime_type, "text/html");
        assert!(result.is_complete());
        assert_eq!(result.metadata.extra["requested_format"], "pdf");
        assert_eq!(result.metadata.fallback_attempts, 1);
    }

    #[tokio::test]
    async fn without_downgrade_the_error_surfaces() {
        let engine = Arc::new(ScriptedTier::failing(BackendId::Engine, vec![timeout_error()]));
        let orchestrator = orchestrator(
            OrchestratorConfig {
                allow_format_downgrade: false,
                ..Default::default()
            },
            &[BackendId::Engine, BackendId::Markup],
            vec![engine],
        )
        .await;

        let failure = orchestrator
            .convert(&Document::new("<p>x</p>"), Some(TargetFormat::Pdf))
            .await
            .expect_err("only engine can make pdf");
        assert!(matches!(failure.error, ConvertError::Timeout(_)));
        assert_eq!(failure.attempts.len(), 1);
    }

    #[tokio::test]
    async fn cancellation_stops_the_cascade() {
        let engine = Arc::new(ScriptedTier::failing(BackendId::Engine, vec![ConvertError::Cancelled]));
        let canvas = Arc::new(ScriptedTier::new(BackendId::Canvas));
        let orchestrator =
            orchestrator(OrchestratorConfig::default(), ALL, vec![engine, canvas.clone()]).await;

        let failure = orchestrator
            .convert(&Document::new("<p>x</p>"), Some(TargetFormat::Png))
            .await
            .expect_err("cancelled");
        assert!(matches!(failure.error, ConvertError::Cancelled));
        assert_eq!(canvas.calls(), 0);
    }

    #[tokio::test]
    async fn panicking_callbacks_are_contained() {
        let orchestrator = orchestrator(OrchestratorConfig::default(), ALL, Vec::new()).await;
        let updates = Arc::new(Mutex::new(Vec::new()));
        let sink = updates.clone();
        orchestrator.on_progress(|_| panic!("callback bug"));
        orchestrator.on_progress(move |update| sink.lock().expect("updates").push(update.state));

        let result = orchestrator
            .convert(&Document::new("<p>x</p>"), Some(TargetFormat::SanitizedHtml))
            .await
            .expect("markup");
        assert_eq!(result.metadata.tier, "markup");

        let updates = updates.lock().expect("updates");
        assert_eq!(updates.first(), Some(&ConversionState::Idle));
        assert_eq!(updates.last(), Some(&ConversionState::Succeeded));
    }

    #[tokio::test]
    async fn supported_formats_skip_unavailable_tiers() {
        let mut canvas = ScriptedTier::new(BackendId::Canvas);
        canvas.formats = vec![TargetFormat::Png, TargetFormat::Jpeg];
        let mut engine = ScriptedTier::new(BackendId::Engine);
        engine.formats = vec![TargetFormat::Pdf, TargetFormat::Mhtml];

        let orchestrator = orchestrator(
            OrchestratorConfig::default(),
            &[BackendId::Canvas, BackendId::Markup],
            vec![Arc::new(engine), Arc::new(canvas)],
        )
        .await;
        assert_eq!(
            orchestrator.get_supported_formats().await,
            vec![TargetFormat::Png, TargetFormat::Jpeg, TargetFormat::SanitizedHtml]
        );
    }

    #[tokio::test]
    async fn streaming_delivers_the_whole_artifact() {
        let mut config = OrchestratorConfig::default();
        config.default_target = TargetFormat::SanitizedHtml;
        let orchestrator = orchestrator(config, ALL, Vec::new()).await;

        let doc = Document::new("<p>".to_string() + &"streamed ".repeat(20_000) + "</p>");
        let expected = orchestrator.convert(&doc, None).await.expect("convert").content;

        let streaming = orchestrator
            .convert_streaming(&doc, None, &CancellationSignal::new())
            .await
            .expect("stream");
        assert_eq!(streaming.mime_type, "text/html");
        let chunks: Vec<Vec<u8>> = streaming
            .stream
            .map(|chunk| chunk.expect("chunk"))
            .collect()
            .await;
        assert!(chunks.len() > 1);
        assert_eq!(chunks.concat(), expected);
    }
}
