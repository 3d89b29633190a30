//! # Render Tiers
//!
//! Converts markup documents into PDF, raster images, web archives or
//! sanitized HTML through a cascade of rendering tiers. Each tier trades
//! fidelity for availability:
//!
//! | Tier | Backend | Formats | Needs |
//! |------|---------|---------|-------|
//! | **engine** | Pooled headless Chromium | PDF, PNG, JPEG, MHTML | Chromium on the host |
//! | **canvas** | In-process wireframe rasterizer | PNG, JPEG | Nothing |
//! | **remote** | HTTP conversion services | Per registered category | Network |
//! | **markup** | Allow-list sanitizer | HTML | Nothing |
//!
//! A capability probe scores each tier on the current host and recommends a
//! primary one. The [`TierOrchestrator`] validates the document once, then
//! tries candidates in order, falling back on recoverable errors up to
//! `orchestrator.max_fallback_attempts` times. With format downgrade enabled
//! the markup tier is always the last resort.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use render_tiers::{Config, Document, TargetFormat, TierOrchestrator};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let orchestrator = TierOrchestrator::builder(Config::default()).build().await?;
//!     orchestrator.on_fallback(|event| {
//!         eprintln!("{} -> {}: {}", event.from_tier, event.to_tier, event.reason);
//!     });
//!
//!     let doc = Document::new("<h1>Hello</h1>");
//!     let result = orchestrator.convert(&doc, Some(TargetFormat::Png)).await?;
//!     println!("{} bytes from the {} tier", result.content.len(), result.metadata.tier);
//!
//!     orchestrator.shutdown().await;
//!     Ok(())
//! }
//! ```
//!
//! ## CLI Usage
//!
//! ```bash
//! render-tiers convert --input report.html --output report.pdf
//! render-tiers batch --input pages/ --output out/ --format png --concurrency 8
//! render-tiers probe --intensive --json
//! render-tiers services --check
//! ```

/// Configuration and settings
pub mod config;

/// Error taxonomy, cascade failures and the circuit breaker
pub mod error;

/// Documents, target formats and conversion results
pub mod document;

/// The converter contract shared by every tier
pub mod converter;

/// Built-in conversion tiers
pub mod backends;

/// Capability detection and tier recommendation
pub mod capability;

/// Tier selection and bounded fallback
pub mod orchestrator;

/// Engine process launching, sessions and events
pub mod engine;

/// Pool of reusable engine processes
pub mod process_pool;

/// HTTP client for remote conversion services
pub mod remote_client;

/// Per-service health bookkeeping
pub mod service_health;

/// Batch conversion with bounded concurrency
pub mod batch;

/// Chunked delivery of conversion output
pub mod stream;

/// Cooperative cancellation
pub mod cancel;

/// External asset reference scanning
pub mod assets;

/// Command-line interface implementation
pub mod cli;

/// Metrics collection and the Prometheus exporter
pub mod metrics;

/// Memory pressure monitoring and formatting helpers
pub mod utils;

#[cfg(test)]
mod tests;

pub use assets::*;
pub use backends::{CanvasBackend, EngineBackend, MarkupBackend, RemoteBackend};
pub use batch::*;
pub use cancel::*;
pub use capability::*;
pub use config::*;
pub use converter::*;
pub use document::*;
pub use engine::{ChromiumLauncher, EngineLauncher, EngineSession, EventBus, RenderOptions};
pub use error::*;
pub use metrics::*;
pub use orchestrator::*;
pub use process_pool::{ProcessHandle, ProcessLease, ProcessPool, ProcessPoolStats};
pub use remote_client::{ConversionService, RemoteResponse, RemoteServiceClient, ServiceAuth};
pub use service_health::{HealthStatus, ServiceHealth};
pub use stream::ChunkStream;
pub use utils::*;
