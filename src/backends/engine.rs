use crate::config::EngineConfig;
use crate::converter::{markup_content_types, validate_markup, BackendId, ConversionContext, Converter};
use crate::engine::RenderOptions;
use crate::process_pool::ProcessPool;
use crate::{CircuitBreaker, ConversionResult, ConvertError, Document, TargetFormat, ValidationReport};
use async_trait::async_trait;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, warn};

/// Full-fidelity tier: renders in a pooled engine process.
pub struct EngineBackend {
    pool: ProcessPool,
    circuit_breaker: CircuitBreaker,
    options: RenderOptions,
    render_timeout: Duration,
    max_document_size: usize,
}

impl EngineBackend {
    pub fn new(pool: ProcessPool, config: &EngineConfig) -> Self {
        Self {
            pool,
            circuit_breaker: CircuitBreaker::new(config.failure_threshold, config.recovery_timeout),
            options: RenderOptions::from_config(config),
            render_timeout: config.render_timeout,
            max_document_size: config.max_document_size,
        }
    }

    pub fn pool(&self) -> &ProcessPool {
        &self.pool
    }

    pub fn circuit_breaker(&self) -> &CircuitBreaker {
        &self.circuit_breaker
    }
}

#[async_trait]
impl Converter for EngineBackend {
    fn name(&self) -> &str {
        BackendId::Engine.as_str()
    }

    fn backend_id(&self) -> Option<BackendId> {
        Some(BackendId::Engine)
    }

    fn supported_content_types(&self) -> Vec<String> {
        markup_content_types()
    }

    fn output_format(&self) -> TargetFormat {
        TargetFormat::Pdf
    }

    fn output_formats(&self) -> Vec<TargetFormat> {
        vec![
            TargetFormat::Pdf,
            TargetFormat::Png,
            TargetFormat::Jpeg,
            TargetFormat::Mhtml,
        ]
    }

    fn validate(&self, document: &Document) -> ValidationReport {
        validate_markup(document, self.max_document_size, self.name())
    }

    async fn convert(
        &self,
        document: &Document,
        context: &ConversionContext,
    ) -> Result<ConversionResult, ConvertError> {
        let format = context.target;
        if !self.output_formats().contains(&format) {
            return Err(ConvertError::BackendUnavailable(format!(
                "engine tier cannot produce {format}"
            )));
        }
        if !self.circuit_breaker.can_execute() {
            return Err(ConvertError::BackendUnavailable(
                "engine circuit breaker is open".to_string(),
            ));
        }

        let mut lease = match self.pool.acquire(&context.cancel).await {
            Ok(lease) => lease,
            Err(e @ ConvertError::LaunchFailed(_)) => {
                self.circuit_breaker.record_failure();
                return Err(e);
            }
            Err(e) => return Err(e),
        };
        let process_id = lease.handle().id;
        let session = lease.session().clone();

        // Dropping the lease on cancellation hands the process back.
        let rendered = context
            .cancel
            .run(timeout(self.render_timeout, session.render(document, format, &self.options)))
            .await?;

        let data = match rendered {
            Err(_) => {
                warn!("Render on process {} timed out after {:?}", process_id, self.render_timeout);
                lease.mark_unhealthy();
                self.circuit_breaker.record_failure();
                return Err(ConvertError::Timeout(self.render_timeout));
            }
            Ok(Err(e)) => {
                if !session.is_alive().await {
                    lease.mark_unhealthy();
                }
                self.circuit_breaker.record_failure();
                return Err(e);
            }
            Ok(Ok(data)) if data.is_empty() => {
                self.circuit_breaker.record_failure();
                return Err(ConvertError::RenderFailed("engine produced no output".to_string()));
            }
            Ok(Ok(data)) => data,
        };

        self.circuit_breaker.record_success();
        self.pool.release(lease).await;
        debug!("Process {} rendered {} bytes of {}", process_id, data.len(), format);

        Ok(ConversionResult::new(data, format, document, self.name()).with_extra("process_id", process_id))
    }
}
