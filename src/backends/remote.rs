use crate::converter::{markup_content_types, validate_markup, BackendId, ConversionContext, Converter};
use crate::remote_client::{category_for, RemoteServiceClient};
use crate::{ConversionResult, ConvertError, Document, TargetFormat, ValidationReport};
use async_trait::async_trait;
use std::sync::Arc;

/// Tier backed by the network conversion services.
pub struct RemoteBackend {
    client: Arc<RemoteServiceClient>,
    max_document_size: usize,
}

impl RemoteBackend {
    pub fn new(client: Arc<RemoteServiceClient>, max_document_size: usize) -> Self {
        Self {
            client,
            max_document_size,
        }
    }

    pub fn client(&self) -> &Arc<RemoteServiceClient> {
        &self.client
    }
}

#[async_trait]
impl Converter for RemoteBackend {
    fn name(&self) -> &str {
        BackendId::Remote.as_str()
    }

    fn backend_id(&self) -> Option<BackendId> {
        Some(BackendId::Remote)
    }

    fn supported_content_types(&self) -> Vec<String> {
        markup_content_types()
    }

    fn output_format(&self) -> TargetFormat {
        self.client
            .output_formats()
            .first()
            .copied()
            .unwrap_or(TargetFormat::Pdf)
    }

    fn output_formats(&self) -> Vec<TargetFormat> {
        self.client.output_formats()
    }

    fn validate(&self, document: &Document) -> ValidationReport {
        validate_markup(document, self.max_document_size, self.name())
    }

    async fn convert(
        &self,
        document: &Document,
        context: &ConversionContext,
    ) -> Result<ConversionResult, ConvertError> {
        let category = category_for(context.target);
        if !self.client.has_category(category) {
            return Err(ConvertError::BackendUnavailable(format!(
                "no '{category}' services registered"
            )));
        }

        let response = self
            .client
            .convert(category, document, Some(context.target), &context.cancel)
            .await?;

        Ok(ConversionResult::new(response.content, context.target, document, self.name())
            .with_service(response.service_id))
    }
}
