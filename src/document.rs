//! Documents, target formats and conversion results
//!
//! These are the values that flow through every tier: a [`Document`] goes in,
//! a [`ConversionResult`] comes out, and [`ValidationReport`] decides whether
//! the input is worth converting at all.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

pub const DEFAULT_SOURCE_TYPE: &str = "text/html";

/// A structured markup document submitted for conversion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    /// Markup source of the document
    pub content: String,
    /// MIME type of `content` (default: `text/html`)
    pub source_type: String,
    pub title: Option<String>,
    /// Base URL used to resolve relative references inside `content`
    pub base_url: Option<String>,
}

impl Document {
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            ..Default::default()
        }
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = Some(base_url.into());
        self
    }

    /// Size of the markup in bytes.
    pub fn size(&self) -> usize {
        self.content.len()
    }

    pub fn is_blank(&self) -> bool {
        self.content.trim().is_empty()
    }
}

impl Default for Document {
    fn default() -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            content: String::new(),
            source_type: DEFAULT_SOURCE_TYPE.to_string(),
            title: None,
            base_url: None,
        }
    }
}

/// Artifact formats a conversion can produce.
///
/// - Pdf: paginated document
/// - Png / Jpeg: raster image
/// - Mhtml: single-file web-archive snapshot
/// - SanitizedHtml: markup with scripts and unsafe attributes stripped
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetFormat {
    Pdf,
    Png,
    Jpeg,
    Mhtml,
    #[serde(rename = "html")]
    SanitizedHtml,
}

impl TargetFormat {
    pub const ALL: [TargetFormat; 5] = [
        TargetFormat::Pdf,
        TargetFormat::Png,
        TargetFormat::Jpeg,
        TargetFormat::Mhtml,
        TargetFormat::SanitizedHtml,
    ];

    pub fn mime_type(&self) -> &'static str {
        match self {
            TargetFormat::Pdf => "application/pdf",
            TargetFormat::Png => "image/png",
            TargetFormat::Jpeg => "image/jpeg",
            TargetFormat::Mhtml => "multipart/related",
            TargetFormat::SanitizedHtml => "text/html",
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            TargetFormat::Pdf => "pdf",
            TargetFormat::Png => "png",
            TargetFormat::Jpeg => "jpg",
            TargetFormat::Mhtml => "mhtml",
            TargetFormat::SanitizedHtml => "html",
        }
    }

    pub fn from_mime_type(mime: &str) -> Option<Self> {
        let essence = mime.split(';').next().unwrap_or(mime).trim();
        Self::ALL
            .into_iter()
            .find(|format| format.mime_type().eq_ignore_ascii_case(essence))
    }

    pub fn is_raster(&self) -> bool {
        matches!(self, TargetFormat::Png | TargetFormat::Jpeg)
    }
}

impl fmt::Display for TargetFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}

impl FromStr for TargetFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pdf" => Ok(TargetFormat::Pdf),
            "png" => Ok(TargetFormat::Png),
            "jpg" | "jpeg" => Ok(TargetFormat::Jpeg),
            "mhtml" | "mht" => Ok(TargetFormat::Mhtml),
            "html" | "htm" | "sanitized-html" => Ok(TargetFormat::SanitizedHtml),
            other => Err(format!("unsupported target format '{other}'")),
        }
    }
}

/// Outcome of checking a document against one backend's limits.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ValidationReport {
    pub is_valid: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    pub context: Option<serde_json::Value>,
}

impl ValidationReport {
    pub fn valid() -> Self {
        Self {
            is_valid: true,
            ..Default::default()
        }
    }

    pub fn error(&mut self, message: impl Into<String>) {
        self.is_valid = false;
        self.errors.push(message.into());
    }

    pub fn warn(&mut self, message: impl Into<String>) {
        self.warnings.push(message.into());
    }

    pub fn first_error(&self) -> Option<&str> {
        self.errors.first().map(String::as_str)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversionMetadata {
    pub source_type: String,
    pub target_format: TargetFormat,
    pub timestamp: DateTime<Utc>,
    /// Size of the produced content in bytes
    pub size: usize,
    #[serde(with = "duration_millis")]
    pub execution_time: Duration,
    /// Name of the tier that produced the content
    pub tier: String,
    pub fallback_attempts: usize,
    pub service_used: Option<String>,
    /// Tier-specific fields
    #[serde(default)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversionResult {
    #[serde(skip)]
    pub content: Vec<u8>,
    pub mime_type: String,
    pub metadata: ConversionMetadata,
}

impl ConversionResult {
    /// Build a result for `content` produced by `tier` in `format`.
    ///
    /// Timing and fallback fields are filled in by the orchestrator.
    pub fn new(
        content: Vec<u8>,
        format: TargetFormat,
        document: &Document,
        tier: impl Into<String>,
    ) -> Self {
        let size = content.len();
        Self {
            content,
            mime_type: format.mime_type().to_string(),
            metadata: ConversionMetadata {
                source_type: document.source_type.clone(),
                target_format: format,
                timestamp: Utc::now(),
                size,
                execution_time: Duration::ZERO,
                tier: tier.into(),
                fallback_attempts: 0,
                service_used: None,
                extra: serde_json::Map::new(),
            },
        }
    }

    pub fn with_service(mut self, service_id: impl Into<String>) -> Self {
        self.metadata.service_used = Some(service_id.into());
        self
    }

    pub fn with_extra(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.metadata.extra.insert(key.to_string(), value.into());
        self
    }

    pub fn is_complete(&self) -> bool {
        !self.content.is_empty() && self.mime_type == self.metadata.target_format.mime_type()
    }
}

mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn target_format_parsing() {
        assert_eq!("PDF".parse::<TargetFormat>(), Ok(TargetFormat::Pdf));
        assert_eq!("jpg".parse::<TargetFormat>(), Ok(TargetFormat::Jpeg));
        assert_eq!("html".parse::<TargetFormat>(), Ok(TargetFormat::SanitizedHtml));
        assert!("docx".parse::<TargetFormat>().is_err());
    }

    #[test]
    fn mime_lookup_ignores_parameters() {
        assert_eq!(
            TargetFormat::from_mime_type("text/html; charset=utf-8"),
            Some(TargetFormat::SanitizedHtml)
        );
        assert_eq!(TargetFormat::from_mime_type("application/zip"), None);
    }

    #[test]
    fn validation_report_tracks_first_error() {
        let mut report = ValidationReport::valid();
        assert!(report.is_valid);
        report.warn("external stylesheet");
        assert!(report.is_valid);
        report.error("content is empty");
        report.error("too large");
        assert!(!report.is_valid);
        assert_eq!(report.first_error(), Some("content is empty"));
    }

    #[test]
    fn result_completeness_requires_matching_mime() {
        let doc = Document::new("<p>hi</p>");
        let mut result =
            ConversionResult::new(b"%PDF-1.7".to_vec(), TargetFormat::Pdf, &doc, "engine");
        assert!(result.is_complete());
        assert_eq!(result.metadata.size, 8);

        result.mime_type = "image/png".into();
        assert!(!result.is_complete());

        let empty = ConversionResult::new(Vec::new(), TargetFormat::Png, &doc, "canvas");
        assert!(!empty.is_complete());
    }

    #[test]
    fn metadata_serializes_execution_time_in_millis() {
        let doc = Document::new("<p>hi</p>");
        let mut result = ConversionResult::new(b"x".to_vec(), TargetFormat::Png, &doc, "canvas");
        result.metadata.execution_time = Duration::from_millis(1500);
        let json = serde_json::to_value(&result.metadata).expect("serialize");
        assert_eq!(json["execution_time"], 1500);
        assert_eq!(json["target_format"], "png");
    }
}
