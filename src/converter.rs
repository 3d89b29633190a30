//! The contract every conversion tier implements
//!
//! The orchestrator only ever talks to [`Converter`] trait objects, so the
//! built-in tiers and externally registered extensions are interchangeable.

use crate::{CancellationSignal, ConversionResult, ConvertError, Document, TargetFormat, ValidationReport};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Built-in backend tiers, declared in fixed priority order (highest first).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendId {
    /// External rendering engine driven over its command/event transport
    Engine,
    /// In-process drawing surface
    Canvas,
    /// Network-based conversion services
    Remote,
    /// Sanitized markup passthrough, always available
    Markup,
}

impl BackendId {
    pub const PRIORITY: [BackendId; 4] = [
        BackendId::Engine,
        BackendId::Canvas,
        BackendId::Remote,
        BackendId::Markup,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            BackendId::Engine => "engine",
            BackendId::Canvas => "canvas",
            BackendId::Remote => "remote",
            BackendId::Markup => "markup",
        }
    }

    /// Position in the fixed priority order; lower is preferred.
    pub fn rank(&self) -> usize {
        Self::PRIORITY
            .iter()
            .position(|id| id == self)
            .unwrap_or(Self::PRIORITY.len())
    }
}

impl fmt::Display for BackendId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackendId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "engine" => Ok(BackendId::Engine),
            "canvas" => Ok(BackendId::Canvas),
            "remote" => Ok(BackendId::Remote),
            "markup" => Ok(BackendId::Markup),
            other => Err(format!("unknown backend '{other}'")),
        }
    }
}

/// Per-call inputs a tier needs besides the document itself.
#[derive(Debug, Clone)]
pub struct ConversionContext {
    pub target: TargetFormat,
    pub cancel: CancellationSignal,
}

impl ConversionContext {
    pub fn new(target: TargetFormat) -> Self {
        Self {
            target,
            cancel: CancellationSignal::new(),
        }
    }

    pub fn with_cancel(target: TargetFormat, cancel: CancellationSignal) -> Self {
        Self { target, cancel }
    }
}

#[async_trait]
pub trait Converter: Send + Sync {
    /// Human-readable tier name, recorded as `metadata.tier`.
    fn name(&self) -> &str;

    /// The built-in tier this converter implements; `None` for extensions.
    fn backend_id(&self) -> Option<BackendId> {
        None
    }

    /// Input MIME types the converter accepts.
    fn supported_content_types(&self) -> Vec<String>;

    /// Default output format.
    fn output_format(&self) -> TargetFormat;

    /// Every output format the converter can produce.
    fn output_formats(&self) -> Vec<TargetFormat> {
        vec![self.output_format()]
    }

    /// Whether the converter can produce artifacts of `mime_type`.
    fn can_handle(&self, mime_type: &str) -> bool {
        TargetFormat::from_mime_type(mime_type)
            .map(|format| self.output_formats().contains(&format))
            .unwrap_or(false)
    }

    fn accepts_source(&self, source_type: &str) -> bool {
        let essence = source_type.split(';').next().unwrap_or(source_type).trim();
        self.supported_content_types()
            .iter()
            .any(|t| t.eq_ignore_ascii_case(essence))
    }

    fn validate(&self, document: &Document) -> ValidationReport;

    async fn convert(
        &self,
        document: &Document,
        context: &ConversionContext,
    ) -> Result<ConversionResult, ConvertError>;
}

/// Content types every built-in tier accepts.
pub fn markup_content_types() -> Vec<String> {
    vec![
        "text/html".to_string(),
        "application/xhtml+xml".to_string(),
    ]
}

/// Shared validation for markup input against a size ceiling.
///
/// Empty content and oversized content are errors; script tags and external
/// asset references are reported as warnings.
pub fn validate_markup(document: &Document, max_size: usize, tier: &str) -> ValidationReport {
    let mut report = ValidationReport::valid();

    if document.is_blank() {
        report.error("Document content is empty");
    }
    if document.size() > max_size {
        report.error(format!(
            "Document is {} but the {tier} tier accepts at most {}",
            crate::format_bytes(document.size()),
            crate::format_bytes(max_size)
        ));
    }

    let assets = crate::scan_assets(&document.content);
    if assets.total() > 0 {
        report.warn(format!(
            "Document references {} external asset(s) that must be fetched",
            assets.total()
        ));
    }
    if crate::contains_inline_script(&document.content) {
        report.warn("Document contains scripts; output may differ between tiers");
    }

    report.context = Some(serde_json::json!({
        "tier": tier,
        "size": document.size(),
        "external_assets": assets.counts(),
    }));
    report
}
