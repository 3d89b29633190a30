use crate::config::MarkupConfig;
use crate::converter::{markup_content_types, validate_markup, BackendId, ConversionContext, Converter};
use crate::{ConversionResult, ConvertError, Document, TargetFormat, ValidationReport};
use ammonia::Builder as AmmoniaBuilder;
use async_trait::async_trait;
use std::collections::HashSet;
use tracing::debug;

/// Sanitized markup passthrough. Needs nothing from the host, so it is the
/// tier of last resort.
pub struct MarkupBackend {
    config: MarkupConfig,
    sanitizer: AmmoniaBuilder<'static>,
}

fn build_sanitizer() -> AmmoniaBuilder<'static> {
    let mut builder = AmmoniaBuilder::default();
    builder.add_tags(&["figure", "figcaption", "section", "article", "header", "footer", "main", "nav"]);
    builder.add_generic_attributes(&["class", "id"]);
    builder.url_schemes(HashSet::from(["http", "https", "mailto", "data"]));
    builder.link_rel(Some("noopener noreferrer"));
    builder
}

impl MarkupBackend {
    pub fn new(config: MarkupConfig) -> Self {
        Self {
            config,
            sanitizer: build_sanitizer(),
        }
    }

    /// Strip scripts, event handlers and unsafe URL schemes.
    pub fn sanitize(&self, markup: &str) -> String {
        self.sanitizer.clean(markup).to_string()
    }

    /// Wrap sanitized markup in a minimal standalone document.
    pub fn standalone(&self, document: &Document) -> String {
        let title = document.title.as_deref().unwrap_or("Document");
        format!(
            "<!DOCTYPE html>\n<html>\n<head>\n<meta charset=\"utf-8\">\n<title>{}</title>\n</head>\n<body>\n{}\n</body>\n</html>\n",
            ammonia::clean_text(title),
            self.sanitize(&document.content)
        )
    }
}

impl Default for MarkupBackend {
    fn default() -> Self {
        Self::new(MarkupConfig::default())
    }
}

#[async_trait]
impl Converter for MarkupBackend {
    fn name(&self) -> &str {
        BackendId::Markup.as_str()
    }

    fn backend_id(&self) -> Option<BackendId> {
        Some(BackendId::Markup)
    }

    fn supported_content_types(&self) -> Vec<String> {
        markup_content_types()
    }

    fn output_format(&self) -> TargetFormat {
        TargetFormat::SanitizedHtml
    }

    fn validate(&self, document: &Document) -> ValidationReport {
        validate_markup(document, self.config.max_document_size, self.name())
    }

    async fn convert(
        &self,
        document: &Document,
        context: &ConversionContext,
    ) -> Result<ConversionResult, ConvertError> {
        if context.cancel.is_cancelled() {
            return Err(ConvertError::Cancelled);
        }

        let html = self.standalone(document);
        debug!("Sanitized {} bytes into {} bytes", document.size(), html.len());

        let mut result = ConversionResult::new(html.into_bytes(), TargetFormat::SanitizedHtml, document, self.name());
        if context.target != TargetFormat::SanitizedHtml {
            result = result.with_extra("requested_format", context.target.extension());
        }
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn strips_scripts_and_handlers() {
        let backend = MarkupBackend::default();
        let doc = Document::new(
            r#"<p onclick="steal()">Hello</p><script>alert(1)</script><a href="javascript:alert(2)">x</a>"#,
        )
        .with_title("Report <draft>");

        let result = backend
            .convert(&doc, &ConversionContext::new(TargetFormat::SanitizedHtml))
            .await
            .expect("markup never fails on valid input");
        let html = String::from_utf8(result.content.clone()).expect("utf8");

        assert!(result.is_complete());
        assert!(html.starts_with("<!DOCTYPE html>"));
        assert!(html.contains("&lt;draft&gt;</title>"));
        assert!(html.contains("<p>Hello</p>"));
        assert!(!html.contains("script"));
        assert!(!html.contains("onclick"));
        assert!(!html.contains("javascript:"));
        assert!(!result.metadata.extra.contains_key("requested_format"));
    }

    #[tokio::test]
    async fn downgrade_records_requested_format() {
        let backend = MarkupBackend::default();
        let result = backend
            .convert(&Document::new("<p>x</p>"), &ConversionContext::new(TargetFormat::Pdf))
            .await
            .expect("convert");
        assert_eq!(result.metadata.target_format, TargetFormat::SanitizedHtml);
        assert_eq!(result.metadata.extra["requested_format"], "pdf");
    }

    #[test]
    fn handles_only_html_output() {
        let backend = MarkupBackend::default();
        assert!(backend.can_handle("text/html"));
        assert!(!backend.can_handle("application/pdf"));
        assert!(backend.accepts_source("text/html; charset=utf-8"));
    }
}
