//! Resilient client for network conversion services
//!
//! Services are grouped by category (`pdf`, `image`, `mhtml`, `html`). A
//! conversion walks the healthy services of its category in priority order;
//! each service gets `max_retries` retries with exponential backoff before the
//! client records the failure and moves to the next one.

use crate::config::{HealthCheckConfig, RemoteConfig};
use crate::service_health::{HealthTracker, ServiceHealth};
use crate::{CancellationSignal, ConvertError, Document, Metrics, TargetFormat};
use base64::Engine as _;
use rand::Rng;
use reqwest::header::CONTENT_TYPE;
use reqwest::multipart::{Form, Part};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    Get,
    #[default]
    Post,
    Put,
}

impl From<HttpMethod> for reqwest::Method {
    fn from(method: HttpMethod) -> Self {
        match method {
            HttpMethod::Get => reqwest::Method::GET,
            HttpMethod::Post => reqwest::Method::POST,
            HttpMethod::Put => reqwest::Method::PUT,
        }
    }
}

/// How the document is put on the wire.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RequestFormat {
    #[default]
    Json,
    FormData,
    Raw,
}

/// How the service returns the artifact.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseFormat {
    /// `{success, data: {content, mimeType}, error}` envelope
    #[default]
    Json,
    /// Base64 text body
    Base64,
    /// Raw bytes
    Binary,
    /// Text body passed through
    Text,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RateLimit {
    pub requests_per_minute: Option<u32>,
    pub max_concurrent: Option<usize>,
}

impl RateLimit {
    /// Minimum spacing between two requests implied by `requests_per_minute`.
    pub fn min_interval(&self) -> Option<Duration> {
        self.requests_per_minute
            .filter(|rpm| *rpm > 0)
            .map(|rpm| Duration::from_secs_f64(60.0 / rpm as f64))
    }
}

fn default_form_field() -> String {
    "files".to_string()
}

fn default_quality() -> f64 {
    0.5
}

/// A registered remote backend. Immutable once the client is built.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversionService {
    pub id: String,
    /// Service category: `pdf`, `image`, `mhtml` or `html`
    pub category: String,
    pub url: String,
    pub endpoint: String,
    #[serde(default)]
    pub method: HttpMethod,
    #[serde(default)]
    pub request_format: RequestFormat,
    #[serde(default)]
    pub response_format: ResponseFormat,
    /// Lower is tried first
    #[serde(default)]
    pub priority: u32,
    /// Tie-breaker between equal priorities; higher is tried first
    #[serde(default = "default_quality")]
    pub quality_score: f64,
    #[serde(default)]
    pub rate_limit: RateLimit,
    /// Multipart field carrying the document for `form-data` requests
    #[serde(default = "default_form_field")]
    pub form_field: String,
}

/// Authentication material for one service.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServiceAuth {
    ApiKey {
        #[serde(default)]
        header: Option<String>,
        key: String,
    },
    Bearer {
        token: String,
    },
    Headers {
        headers: HashMap<String, String>,
    },
}

impl ServiceAuth {
    fn apply(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match self {
            ServiceAuth::ApiKey { header, key } => {
                request.header(header.as_deref().unwrap_or("X-API-Key"), key)
            }
            ServiceAuth::Bearer { token } => request.bearer_auth(token),
            ServiceAuth::Headers { headers } => headers
                .iter()
                .fold(request, |request, (name, value)| request.header(name, value)),
        }
    }
}

/// Service category that produces `format`.
pub fn category_for(format: TargetFormat) -> &'static str {
    match format {
        TargetFormat::Pdf => "pdf",
        TargetFormat::Png | TargetFormat::Jpeg => "image",
        TargetFormat::Mhtml => "mhtml",
        TargetFormat::SanitizedHtml => "html",
    }
}

/// Formats a category can produce.
pub fn formats_for_category(category: &str) -> Vec<TargetFormat> {
    match category.to_ascii_lowercase().as_str() {
        "pdf" => vec![TargetFormat::Pdf],
        "image" => vec![TargetFormat::Png, TargetFormat::Jpeg],
        "mhtml" => vec![TargetFormat::Mhtml],
        "html" => vec![TargetFormat::SanitizedHtml],
        _ => Vec::new(),
    }
}

fn category_default_mime(category: &str) -> &'static str {
    match category.to_ascii_lowercase().as_str() {
        "pdf" => "application/pdf",
        "image" => "image/png",
        "mhtml" => "multipart/related",
        "html" => "text/html",
        _ => "application/octet-stream",
    }
}

fn is_textual(mime: &str) -> bool {
    mime.starts_with("text/") || mime.contains("json") || mime.contains("xml") || mime == "multipart/related"
}

/// Built-in entries for a local Chromium-based conversion gateway.
pub fn default_services() -> Vec<ConversionService> {
    let gateway = |id: &str, category: &str, endpoint: &str, quality: f64| ConversionService {
        id: id.to_string(),
        category: category.to_string(),
        url: "http://localhost:3000".to_string(),
        endpoint: endpoint.to_string(),
        method: HttpMethod::Post,
        request_format: RequestFormat::FormData,
        response_format: ResponseFormat::Binary,
        priority: 10,
        quality_score: quality,
        rate_limit: RateLimit {
            requests_per_minute: None,
            max_concurrent: Some(4),
        },
        form_field: default_form_field(),
    };

    vec![
        gateway("gotenberg-pdf", "pdf", "forms/chromium/convert/html", 0.9),
        gateway("gotenberg-image", "image", "forms/chromium/screenshot/html", 0.8),
    ]
}

/// Overlay user entries on the defaults: same id replaces, new ids append.
pub fn merge_services(
    defaults: Vec<ConversionService>,
    user: &[ConversionService],
) -> Vec<ConversionService> {
    let mut merged = defaults;
    for service in user {
        match merged.iter_mut().find(|s| s.id == service.id) {
            Some(existing) => *existing = service.clone(),
            None => merged.push(service.clone()),
        }
    }
    merged
}

/// `min(base * 2^attempt, cap)`; non-decreasing in `attempt`.
pub fn backoff_delay(attempt: u32, base: Duration, cap: Duration) -> Duration {
    let factor = 2u32.checked_pow(attempt).unwrap_or(u32::MAX);
    base.checked_mul(factor).unwrap_or(cap).min(cap)
}

/// Normalized artifact returned by a service.
#[derive(Debug, Clone)]
pub struct RemoteResponse {
    pub content: Vec<u8>,
    pub mime_type: String,
    pub service_id: String,
}

#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(default)]
    success: bool,
    data: Option<EnvelopeData>,
    error: Option<EnvelopeError>,
}

#[derive(Debug, Deserialize)]
struct EnvelopeData {
    content: String,
    #[serde(alias = "mimeType")]
    mime_type: Option<String>,
}

#[derive(Debug, Deserialize)]
struct EnvelopeError {
    code: Option<String>,
    message: Option<String>,
}

/// Turn a successful response body into `{content, mimeType}` according to
/// the service's response format.
///
/// Without an explicit MIME type the requested format is assumed, falling
/// back to the category default. An artifact of a different format than
/// `target` is a service error.
pub fn normalize_response(
    service: &ConversionService,
    target: Option<TargetFormat>,
    content_type: Option<&str>,
    body: &[u8],
) -> Result<RemoteResponse, ConvertError> {
    let service_error = |message: String, code: Option<String>| ConvertError::ServiceError {
        service: service.id.clone(),
        status: None,
        code,
        message,
    };
    let header_mime = content_type
        .map(|ct| ct.split(';').next().unwrap_or(ct).trim().to_string())
        .filter(|ct| !ct.is_empty());
    let default_mime = target
        .map(|t| t.mime_type())
        .unwrap_or_else(|| category_default_mime(&service.category))
        .to_string();

    let (content, mime_type) = match service.response_format {
        ResponseFormat::Json => {
            let envelope: Envelope = serde_json::from_slice(body)
                .map_err(|e| service_error(format!("invalid response envelope: {e}"), None))?;
            if !envelope.success {
                let (code, message) = envelope
                    .error
                    .map(|e| (e.code, e.message))
                    .unwrap_or((None, None));
                return Err(service_error(
                    message.unwrap_or_else(|| "service reported failure".to_string()),
                    code,
                ));
            }
            let data = envelope
                .data
                .ok_or_else(|| service_error("response has no data".to_string(), None))?;
            let mime = data.mime_type.unwrap_or(default_mime);
            let content = if is_textual(&mime) {
                data.content.into_bytes()
            } else {
                base64::engine::general_purpose::STANDARD
                    .decode(data.content.trim())
                    .map_err(|e| service_error(format!("invalid base64 content: {e}"), None))?
            };
            (content, mime)
        }
        ResponseFormat::Base64 => {
            let text = String::from_utf8_lossy(body);
            let content = base64::engine::general_purpose::STANDARD
                .decode(text.trim())
                .map_err(|e| service_error(format!("invalid base64 body: {e}"), None))?;
            (content, default_mime)
        }
        ResponseFormat::Binary => (body.to_vec(), header_mime.unwrap_or(default_mime)),
        ResponseFormat::Text => (body.to_vec(), header_mime.unwrap_or(default_mime)),
    };

    if content.is_empty() {
        return Err(service_error("empty response body".to_string(), None));
    }
    if let Some(target) = target {
        if TargetFormat::from_mime_type(&mime_type) != Some(target) {
            return Err(service_error(
                format!("returned {} but {} was requested", mime_type, target.mime_type()),
                None,
            ));
        }
    }

    Ok(RemoteResponse {
        content,
        mime_type,
        service_id: service.id.clone(),
    })
}

/// Parse a non-2xx response into a structured service error.
fn error_from_status(service: &ConversionService, status: u16, body: &[u8]) -> ConvertError {
    let (code, message) = match serde_json::from_slice::<Envelope>(body) {
        Ok(Envelope {
            error: Some(error), ..
        }) => (error.code, error.message),
        _ => (None, None),
    };
    let message = message.unwrap_or_else(|| {
        let text = String::from_utf8_lossy(body);
        let text = text.trim();
        if text.is_empty() {
            "request failed".to_string()
        } else {
            text.chars().take(200).collect()
        }
    });
    ConvertError::ServiceError {
        service: service.id.clone(),
        status: Some(status),
        code,
        message,
    }
}

/// Concurrency slot and pacing for one service.
#[derive(Debug)]
struct RateGate {
    in_flight: Arc<AtomicUsize>,
    max_concurrent: Option<usize>,
    min_interval: Option<Duration>,
    last_request: tokio::sync::Mutex<Option<Instant>>,
}

struct RatePermit {
    in_flight: Arc<AtomicUsize>,
}

impl Drop for RatePermit {
    fn drop(&mut self) {
        self.in_flight.fetch_sub(1, Ordering::Relaxed);
    }
}

impl RateGate {
    fn new(limit: &RateLimit) -> Self {
        Self {
            in_flight: Arc::new(AtomicUsize::new(0)),
            max_concurrent: limit.max_concurrent.filter(|m| *m > 0),
            min_interval: limit.min_interval(),
            last_request: tokio::sync::Mutex::new(None),
        }
    }

    fn try_enter(&self) -> Option<RatePermit> {
        let max = self.max_concurrent.unwrap_or(usize::MAX);
        self.in_flight
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| (n < max).then_some(n + 1))
            .ok()
            .map(|_| RatePermit {
                in_flight: self.in_flight.clone(),
            })
    }

    /// Sleep until the minimum spacing since the previous request has passed.
    async fn pace(&self, cancel: &CancellationSignal) -> Result<(), ConvertError> {
        let Some(interval) = self.min_interval else {
            return Ok(());
        };
        let mut last = self.last_request.lock().await;
        if let Some(previous) = *last {
            let wait = interval.saturating_sub(previous.elapsed());
            if !wait.is_zero() {
                debug!("Pacing request for {:?}", wait);
                cancel.run(tokio::time::sleep(wait)).await?;
            }
        }
        *last = Some(Instant::now());
        Ok(())
    }
}

pub struct RemoteServiceClient {
    http: reqwest::Client,
    services: Vec<ConversionService>,
    auth: HashMap<String, ServiceAuth>,
    config: RemoteConfig,
    health: HealthTracker,
    gates: HashMap<String, RateGate>,
    metrics: Arc<Metrics>,
    health_task: std::sync::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl RemoteServiceClient {
    pub fn new(config: RemoteConfig) -> Result<Self, ConvertError> {
        Self::with_metrics(config, Arc::new(Metrics::new()))
    }

    pub fn with_metrics(config: RemoteConfig, metrics: Arc<Metrics>) -> Result<Self, ConvertError> {
        let defaults = if config.include_default_services {
            default_services()
        } else {
            Vec::new()
        };
        let services = merge_services(defaults, &config.services);

        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .user_agent(concat!("render-tiers/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| ConvertError::ConfigurationError(e.to_string()))?;

        let health = HealthTracker::new(
            config.health_check.failure_threshold,
            config.health_cache_ttl,
        );
        let mut gates = HashMap::new();
        for service in &services {
            health.register(&service.id);
            gates.insert(service.id.clone(), RateGate::new(&service.rate_limit));
        }

        info!("Remote client initialized with {} services", services.len());

        Ok(Self {
            http,
            auth: config.auth.clone(),
            services,
            config,
            health,
            gates,
            metrics,
            health_task: std::sync::Mutex::new(None),
        })
    }

    pub fn services(&self) -> &[ConversionService] {
        &self.services
    }

    pub fn has_category(&self, category: &str) -> bool {
        self.services
            .iter()
            .any(|s| s.category.eq_ignore_ascii_case(category))
    }

    /// Every format some registered service can produce.
    pub fn output_formats(&self) -> Vec<TargetFormat> {
        let mut formats = Vec::new();
        for service in &self.services {
            for format in formats_for_category(&service.category) {
                if !formats.contains(&format) {
                    formats.push(format);
                }
            }
        }
        formats
    }

    pub fn get_health(&self, service_id: &str) -> Option<ServiceHealth> {
        self.health.get(service_id)
    }

    pub fn health_snapshot(&self) -> Vec<ServiceHealth> {
        self.health.snapshot()
    }

    /// Selectable services of `category`, by priority then quality.
    pub fn get_available_services(&self, category: &str) -> Vec<ConversionService> {
        let mut available: Vec<ConversionService> = self
            .services
            .iter()
            .filter(|s| s.category.eq_ignore_ascii_case(category))
            .filter(|s| self.health.is_selectable(&s.id))
            .cloned()
            .collect();
        available.sort_by(|a, b| {
            a.priority
                .cmp(&b.priority)
                .then_with(|| b.quality_score.total_cmp(&a.quality_score))
        });
        available
    }

    /// Convert through the first service of `category` that succeeds.
    pub async fn convert(
        &self,
        category: &str,
        document: &Document,
        target: Option<TargetFormat>,
        cancel: &CancellationSignal,
    ) -> Result<RemoteResponse, ConvertError> {
        let candidates = self.get_available_services(category);
        if candidates.is_empty() {
            return Err(ConvertError::BackendUnavailable(format!(
                "no available '{category}' services"
            )));
        }

        let mut last_error = None;
        for service in &candidates {
            match self.convert_with_service(service, document, target, cancel).await {
                Ok(response) => return Ok(response),
                Err(ConvertError::Cancelled) => return Err(ConvertError::Cancelled),
                Err(e) => {
                    warn!("Service '{}' failed: {}", service.id, e);
                    last_error = Some(e);
                    if !self.config.try_multiple_services {
                        break;
                    }
                }
            }
        }

        Err(last_error.unwrap_or_else(|| {
            ConvertError::BackendUnavailable(format!("no '{category}' service succeeded"))
        }))
    }

    pub fn retry_delay(&self, attempt: u32) -> Duration {
        let retry = &self.config.retry;
        let backoff = backoff_delay(attempt, retry.base_delay, retry.max_delay);
        let jitter_ms = retry.jitter.as_millis() as u64;
        let jitter = if jitter_ms > 0 {
            Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms))
        } else {
            Duration::ZERO
        };
        (backoff + jitter).min(retry.max_delay)
    }

    fn check_rate_limit(&self, service: &ConversionService) -> Result<Option<RatePermit>, ConvertError> {
        let Some(gate) = self.gates.get(&service.id) else {
            return Ok(None);
        };
        match gate.try_enter() {
            Some(permit) => Ok(Some(permit)),
            None => {
                self.metrics.record_rate_limited();
                Err(ConvertError::RateLimited {
                    service: service.id.clone(),
                    reason: format!(
                        "{} concurrent requests in flight",
                        gate.max_concurrent.unwrap_or_default()
                    ),
                })
            }
        }
    }

    async fn convert_with_service(
        &self,
        service: &ConversionService,
        document: &Document,
        target: Option<TargetFormat>,
        cancel: &CancellationSignal,
    ) -> Result<RemoteResponse, ConvertError> {
        let _permit = self.check_rate_limit(service)?;
        if let Some(gate) = self.gates.get(&service.id) {
            gate.pace(cancel).await?;
        }

        let max_retries = self.config.retry.max_retries;
        let mut last_error = None;

        for attempt in 0..=max_retries {
            if attempt > 0 {
                let delay = self.retry_delay(attempt as u32 - 1);
                debug!(
                    "Retrying '{}' after {:?} (attempt {}/{})",
                    service.id,
                    delay,
                    attempt + 1,
                    max_retries + 1
                );
                self.metrics.record_retry();
                cancel.run(tokio::time::sleep(delay)).await?;
            }

            // Cancellation drops the in-flight request future.
            let result = cancel.run(self.send_once(service, document, target)).await?;
            match result {
                Ok(response) => {
                    self.health.record_success(&service.id);
                    self.metrics.record_remote_request(&service.id, true);
                    debug!("Service '{}' returned {} bytes", service.id, response.content.len());
                    return Ok(response);
                }
                Err(e) => {
                    self.health.record_failure(&service.id, e.to_string());
                    self.metrics.record_remote_request(&service.id, false);
                    if !e.is_retryable() {
                        return Err(e);
                    }
                    last_error = Some(e);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| {
            ConvertError::BackendUnavailable(format!("service '{}' was not attempted", service.id))
        }))
    }

    fn transport_error(&self, service: &ConversionService, err: reqwest::Error) -> ConvertError {
        if err.is_timeout() {
            ConvertError::Timeout(self.config.request_timeout)
        } else {
            ConvertError::NetworkError(format!("{}: {}", service.id, err))
        }
    }

    async fn send_once(
        &self,
        service: &ConversionService,
        document: &Document,
        target: Option<TargetFormat>,
    ) -> Result<RemoteResponse, ConvertError> {
        let url = crate::join_url(&service.url, &service.endpoint);
        let mut request = self.http.request(service.method.into(), &url);

        request = match service.request_format {
            RequestFormat::Json => request.json(&serde_json::json!({
                "content": document.content,
                "source_type": document.source_type,
                "target_format": target.map(|t| t.extension()),
                "title": document.title,
                "base_url": document.base_url,
            })),
            RequestFormat::FormData => {
                let part = Part::bytes(document.content.clone().into_bytes())
                    .file_name("index.html")
                    .mime_str(&document.source_type)
                    .map_err(|e| {
                        ConvertError::Validation(format!(
                            "invalid source type '{}': {e}",
                            document.source_type
                        ))
                    })?;
                let mut form = Form::new().part(service.form_field.clone(), part);
                if let Some(format) = target.filter(TargetFormat::is_raster) {
                    form = form.text("format", format.mime_type().trim_start_matches("image/").to_string());
                }
                request.multipart(form)
            }
            RequestFormat::Raw => request
                .header(CONTENT_TYPE, document.source_type.as_str())
                .body(document.content.clone()),
        };

        if let Some(auth) = self.auth.get(&service.id) {
            request = auth.apply(request);
        }

        let response = request
            .send()
            .await
            .map_err(|e| self.transport_error(service, e))?;
        let status = response.status();
        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let body = response
            .bytes()
            .await
            .map_err(|e| self.transport_error(service, e))?;

        if !status.is_success() {
            return Err(error_from_status(service, status.as_u16(), &body));
        }

        normalize_response(service, target, content_type.as_deref(), &body)
    }

    async fn probe_health(&self, service: &ConversionService, check: &HealthCheckConfig) -> bool {
        let url = crate::join_url(&service.url, "health");
        let mut request = self.http.get(&url).timeout(check.timeout);
        if let Some(auth) = self.auth.get(&service.id) {
            request = auth.apply(request);
        }

        match request.send().await {
            Ok(response) if response.status().is_success() => {
                self.health.record_success(&service.id);
                true
            }
            Ok(response) => {
                self.health
                    .record_failure(&service.id, format!("health check returned {}", response.status()));
                false
            }
            Err(e) => {
                self.health
                    .record_failure(&service.id, self.transport_error(service, e).to_string());
                false
            }
        }
    }

    /// Probe `GET {url}/health` on every registered service.
    pub async fn health_check_all(&self) -> Vec<(String, bool)> {
        let check = &self.config.health_check;
        let probes = self
            .services
            .iter()
            .map(|service| async move {
                let healthy = self.probe_health(service, &check).await;
                (service.id.clone(), healthy)
            });
        let results = futures::future::join_all(probes).await;

        let healthy = results.iter().filter(|(_, ok)| *ok).count();
        debug!("Health check: {}/{} services healthy", healthy, results.len());
        results
    }

    /// Run `health_check_all` every `health_check.interval` until stopped.
    pub fn start_health_checks(self: &Arc<Self>) {
        if !self.config.health_check.enabled || self.services.is_empty() {
            return;
        }
        let mut task = self
            .health_task
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if task.is_some() {
            return;
        }

        let weak: Weak<Self> = Arc::downgrade(self);
        let period = self.config.health_check.interval;
        *task = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                ticker.tick().await;
                let Some(client) = weak.upgrade() else {
                    break;
                };
                client.health_check_all().await;
            }
        }));
    }

    pub fn stop_health_checks(&self) {
        if let Some(task) = self
            .health_task
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
        {
            task.abort();
        }
    }
}

impl Drop for RemoteServiceClient {
    fn drop(&mut self) {
        self.stop_health_checks();
    }
}
