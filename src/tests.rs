#[cfg(test)]
mod integration_tests {
    use crate::capability::{BackendSignals, MockCapabilityProvider};
    use crate::process_pool::tests::FakeLauncher;
    use crate::remote_client::default_services;
    use crate::{
        BackendId, CancellationSignal, CircuitBreaker, Config, ConvertError, Document, ErrorSeverity, TargetFormat,
        TierOrchestrator,
    };
    use httpmock::prelude::*;
    use std::sync::atomic::Ordering;
    use std::sync::Arc;
    use std::time::Duration;

    fn provider(available: &'static [BackendId]) -> Arc<MockCapabilityProvider> {
        let mut provider = MockCapabilityProvider::new();
        provider.expect_signals().returning(move |backend| {
            if available.contains(&backend) {
                BackendSignals::present().with_detail("source", "test")
            } else {
                BackendSignals::absent("not installed")
            }
        });
        provider.expect_benchmark().returning(|_, _| Ok(0.8));
        Arc::new(provider)
    }

    fn base_config() -> Config {
        let mut config = Config::default();
        config.capability.cache = false;
        config.remote.include_default_services = false;
        config.remote.health_check.enabled = false;
        config
    }

    #[test]
    fn test_config_default() {
        let config = Config::default();
        assert_eq!(config.orchestrator.max_fallback_attempts, 3);
        assert!(config.orchestrator.allow_format_downgrade);
        assert_eq!(config.orchestrator.default_target, TargetFormat::Pdf);
        assert!(config.orchestrator.priority_order.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_error_classification() {
        assert!(ConvertError::Timeout(Duration::from_secs(1)).is_retryable());
        assert!(ConvertError::NetworkError("reset".into()).is_retryable());
        assert!(!ConvertError::Validation("empty".into()).is_retryable());
        assert!(!ConvertError::RateLimited {
            service: "a".into(),
            reason: "429".into()
        }
        .is_retryable());

        assert!(ConvertError::LaunchFailed("no chromium".into()).triggers_fallback());
        assert!(ConvertError::PoolExhausted { max_instances: 2 }.triggers_fallback());
        assert!(!ConvertError::Validation("empty".into()).triggers_fallback());
        assert!(!ConvertError::Cancelled.triggers_fallback());

        assert_eq!(ConvertError::ConfigurationError("bad".into()).severity(), ErrorSeverity::High);
        assert_eq!(ConvertError::Validation("empty".into()).severity(), ErrorSeverity::Low);
    }

    #[test]
    fn test_circuit_breaker() {
        let breaker = CircuitBreaker::new(3, Duration::from_secs(60));
        assert!(breaker.can_execute());

        breaker.record_failure();
        breaker.record_failure();
        assert!(breaker.can_execute());

        breaker.record_failure();
        assert!(!breaker.can_execute());

        breaker.record_success();
        assert!(breaker.can_execute());
        assert_eq!(breaker.get_failure_count(), 0);
    }

    #[tokio::test]
    async fn test_engine_tier_through_pool() {
        let launcher = Arc::new(FakeLauncher::default());
        let orchestrator = TierOrchestrator::builder(base_config())
            .capability_provider(provider(&[BackendId::Engine, BackendId::Canvas, BackendId::Markup]))
            .launcher(launcher.clone())
            .build()
            .await
            .expect("build");

        let doc = Document::new("<h1>Quarterly</h1><p>numbers</p>").with_title("Q3");
        for _ in 0..3 {
            let result = orchestrator
                .convert(&doc, Some(TargetFormat::Pdf))
                .await
                .expect("engine converts");
            assert_eq!(result.metadata.tier, "engine");
            assert_eq!(result.mime_type, "application/pdf");
            assert_eq!(result.metadata.fallback_attempts, 0);
        }
        assert_eq!(launcher.launches.load(Ordering::Relaxed), 1);

        orchestrator.shutdown().await;
        let stats = orchestrator.pool().expect("pool").get_stats().await;
        assert_eq!(stats.total_instances, 0);
    }

    #[tokio::test]
    async fn test_engine_launch_failure_falls_back_to_remote() {
        let server = MockServer::start();
        let convert = server.mock(|when, then| {
            when.method(POST).path("/forms/chromium/convert/html");
            then.status(200)
                .header("content-type", "application/pdf")
                .body("%PDF-1.7 remote");
        });

        let mut config = base_config();
        let mut service = default_services()[0].clone();
        service.url = server.base_url();
        config.remote.services = vec![service];

        let launcher = Arc::new(FakeLauncher {
            fail_next: 10.into(),
            ..Default::default()
        });
        let orchestrator = TierOrchestrator::builder(config)
            .capability_provider(provider(&[
                BackendId::Engine,
                BackendId::Canvas,
                BackendId::Remote,
                BackendId::Markup,
            ]))
            .launcher(launcher)
            .build()
            .await
            .expect("build");

        let events = Arc::new(std::sync::Mutex::new(Vec::new()));
        let sink = events.clone();
        orchestrator.on_fallback(move |event| sink.lock().expect("events").push(event.clone()));

        let result = orchestrator
            .convert(&Document::new("<p>invoice</p>"), Some(TargetFormat::Pdf))
            .await
            .expect("remote converts");

        convert.assert();
        assert_eq!(result.metadata.tier, "remote");
        assert_eq!(result.metadata.service_used.as_deref(), Some("gotenberg-pdf"));
        assert_eq!(result.metadata.fallback_attempts, 1);
        assert_eq!(result.content, b"%PDF-1.7 remote");

        let events = events.lock().expect("events");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].from_tier, "engine");
        assert_eq!(events[0].to_tier, "remote");
        orchestrator.shutdown().await;
    }

    #[tokio::test]
    async fn test_canvas_renders_png_without_engine() {
        let orchestrator = TierOrchestrator::builder(base_config())
            .capability_provider(provider(&[BackendId::Canvas, BackendId::Markup]))
            .launcher(Arc::new(FakeLauncher::default()))
            .build()
            .await
            .expect("build");

        let doc = Document::new("<h1>Preview</h1><p>Some body text for the wireframe.</p>");
        let result = orchestrator
            .convert(&doc, Some(TargetFormat::Png))
            .await
            .expect("canvas converts");

        assert_eq!(result.metadata.tier, "canvas");
        assert!(result.content.starts_with(&[0x89, b'P', b'N', b'G']));
        assert_eq!(
            orchestrator.get_supported_formats().await,
            vec![TargetFormat::Png, TargetFormat::Jpeg, TargetFormat::SanitizedHtml]
        );
    }

    #[tokio::test]
    async fn test_pdf_without_capable_tier_downgrades_to_markup() {
        let orchestrator = TierOrchestrator::builder(base_config())
            .capability_provider(provider(&[BackendId::Canvas, BackendId::Markup]))
            .launcher(Arc::new(FakeLauncher::default()))
            .build()
            .await
            .expect("build");

        let doc = Document::new(r#"<p onclick="x()">Hi</p><script>alert(1)</script>"#).with_title("Hi");
        let result = orchestrator
            .convert(&doc, Some(TargetFormat::Pdf))
            .await
            .expect("markup converts");

        assert_eq!(result.metadata.tier, "markup");
        assert_eq!(result.metadata.fallback_attempts, 0);
        assert_eq!(result.metadata.extra["requested_format"], "pdf");
        let html = String::from_utf8(result.content).expect("utf8");
        assert!(!html.contains("<script"));
        assert!(!html.contains("onclick"));
    }

    #[tokio::test]
    async fn test_oversized_document_is_rejected_before_conversion() {
        let mut config = base_config();
        config.engine.max_document_size = 16;
        let launcher = Arc::new(FakeLauncher::default());
        let orchestrator = TierOrchestrator::builder(config)
            .capability_provider(provider(&[BackendId::Engine, BackendId::Markup]))
            .launcher(launcher.clone())
            .build()
            .await
            .expect("build");

        let failure = orchestrator
            .convert(&Document::new("<p>this is longer than sixteen bytes</p>"), None)
            .await
            .expect_err("too large");
        assert!(matches!(failure.error, ConvertError::Validation(_)));
        assert!(failure.attempts.is_empty());
        assert_eq!(launcher.launches.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn test_streaming_engine_output() {
        let mut config = base_config();
        config.stream.chunk_size = 3;
        let orchestrator = TierOrchestrator::builder(config)
            .capability_provider(provider(&[BackendId::Engine, BackendId::Markup]))
            .launcher(Arc::new(FakeLauncher::default()))
            .build()
            .await
            .expect("build");

        let streaming = orchestrator
            .convert_streaming(&Document::new("<p>x</p>"), None, &CancellationSignal::new())
            .await
            .expect("stream");
        assert_eq!(streaming.mime_type, "application/pdf");
        assert_eq!(streaming.stream.total_chunks(), 3);
        let content = streaming.stream.collect_all().await.expect("collect");
        assert_eq!(content, b"%PDF-fake");
    }
}
