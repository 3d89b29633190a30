use crate::orchestrator::TierOrchestrator;
use crate::{CancellationSignal, CascadeFailure, ConversionResult, Document, TargetFormat};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Outcome for one document of a batch, in submission order.
#[derive(Debug)]
pub struct BatchOutcome {
    pub index: usize,
    pub document_id: String,
    pub result: Result<ConversionResult, CascadeFailure>,
}

impl BatchOutcome {
    pub fn is_success(&self) -> bool {
        self.result.is_ok()
    }
}

/// Runs many documents through one orchestrator with bounded concurrency.
///
/// A failed document is recorded and the batch carries on.
pub struct BatchConverter {
    orchestrator: Arc<TierOrchestrator>,
    concurrency: usize,
    cancel: CancellationSignal,
    progress: Option<Arc<dyn Fn(&ProgressInfo) + Send + Sync>>,
}

impl BatchConverter {
    pub fn new(orchestrator: Arc<TierOrchestrator>, concurrency: usize) -> Self {
        Self {
            orchestrator,
            concurrency: concurrency.max(1),
            cancel: CancellationSignal::new(),
            progress: None,
        }
    }

    pub fn with_cancel(mut self, cancel: CancellationSignal) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn on_progress<F>(mut self, callback: F) -> Self
    where
        F: Fn(&ProgressInfo) + Send + Sync + 'static,
    {
        self.progress = Some(Arc::new(callback));
        self
    }

    pub async fn process(&self, documents: Vec<Document>, target: Option<TargetFormat>) -> Vec<BatchOutcome> {
        let total = documents.len();
        info!("Processing batch of {} documents with concurrency {}", total, self.concurrency);

        let tracker = Arc::new(ProgressTracker::new(total));
        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let mut tasks = Vec::with_capacity(total);

        for (index, document) in documents.into_iter().enumerate() {
            let orchestrator = self.orchestrator.clone();
            let semaphore = semaphore.clone();
            let tracker = tracker.clone();
            let cancel = self.cancel.clone();
            let progress = self.progress.clone();

            tasks.push(tokio::spawn(async move {
                // The semaphore is never closed.
                let _permit = semaphore.acquire_owned().await.ok();
                debug!("Converting batch item {} ({})", index, document.id);

                let result = orchestrator.convert_with_cancel(&document, target, &cancel).await;
                tracker.record_completion(result.is_ok());
                if let Some(callback) = &progress {
                    callback(&tracker.get_progress());
                }

                BatchOutcome {
                    index,
                    document_id: document.id,
                    result,
                }
            }));
        }

        let mut outcomes = Vec::with_capacity(total);
        for task in tasks {
            match task.await {
                Ok(outcome) => {
                    if let Err(failure) = &outcome.result {
                        warn!("Batch item {} ({}) failed: {}", outcome.index, outcome.document_id, failure);
                    }
                    outcomes.push(outcome);
                }
                Err(e) => error!("Batch task panicked: {}", e),
            }
        }

        let progress = tracker.get_progress();
        info!(
            "Batch completed. Succeeded: {}, Failed: {}, Elapsed: {:?}",
            progress.success, progress.errors, progress.elapsed
        );
        outcomes
    }
}

pub struct ProgressTracker {
    total: usize,
    completed: AtomicUsize,
    errors: AtomicUsize,
    start_time: Instant,
}

impl ProgressTracker {
    pub fn new(total: usize) -> Self {
        Self {
            total,
            completed: AtomicUsize::new(0),
            errors: AtomicUsize::new(0),
            start_time: Instant::now(),
        }
    }

    pub fn record_completion(&self, success: bool) {
        self.completed.fetch_add(1, Ordering::Relaxed);
        if !success {
            self.errors.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn get_progress(&self) -> ProgressInfo {
        let completed = self.completed.load(Ordering::Relaxed);
        let errors = self.errors.load(Ordering::Relaxed);
        let elapsed = self.start_time.elapsed();
        let secs = elapsed.as_secs_f64();
        let rate = if secs > 0.0 { completed as f64 / secs } else { 0.0 };

        let eta = (rate > 0.0).then(|| {
            let remaining = self.total.saturating_sub(completed);
            Duration::from_secs_f64(remaining as f64 / rate)
        });

        ProgressInfo {
            total: self.total,
            completed,
            errors,
            success: completed.saturating_sub(errors),
            elapsed,
            rate,
            eta,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.completed.load(Ordering::Relaxed) >= self.total
    }
}

#[derive(Debug, Clone)]
pub struct ProgressInfo {
    pub total: usize,
    pub completed: usize,
    pub errors: usize,
    pub success: usize,
    pub elapsed: Duration,
    /// Documents per second
    pub rate: f64,
    pub eta: Option<Duration>,
}
