//! Rendering-engine transport and sessions
//!
//! The pool only sees [`EngineLauncher`] and [`EngineSession`]; the Chromium
//! implementation drives headless Chrome through chromiumoxide's CDP
//! connection. Asynchronous engine notifications are delivered through an
//! [`EventBus`] with one typed subscription channel per event name.

use crate::config::{engine_browser_config, instance_dirs, EngineConfig, Viewport};
use crate::{ConvertError, Document, TargetFormat};
use async_trait::async_trait;
use chromiumoxide::browser::Browser;
use chromiumoxide::cdp::browser_protocol::emulation::SetDeviceMetricsOverrideParams;
use chromiumoxide::cdp::browser_protocol::page::{
    CaptureScreenshotFormat, CaptureSnapshotFormat, CaptureSnapshotParams, PrintToPdfParams,
};
use chromiumoxide::page::{Page, ScreenshotParams};
use futures::StreamExt;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

pub const EVENT_DISCONNECTED: &str = "engine.disconnected";
pub const EVENT_PAGE_LOADED: &str = "page.loaded";

#[derive(Debug, Clone)]
pub struct EngineEvent {
    pub name: String,
    pub payload: serde_json::Value,
}

type Listeners = HashMap<String, Vec<(u64, mpsc::Sender<EngineEvent>)>>;

struct BusInner {
    listeners: Mutex<Listeners>,
    next_id: AtomicU64,
    capacity: usize,
}

impl BusInner {
    fn listeners(&self) -> MutexGuard<'_, Listeners> {
        self.listeners
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn remove(&self, name: &str, id: u64) {
        let mut listeners = self.listeners();
        if let Some(entries) = listeners.get_mut(name) {
            entries.retain(|(entry_id, _)| *entry_id != id);
            if entries.is_empty() {
                listeners.remove(name);
            }
        }
    }
}

/// Named-event fan-out with explicit unsubscribe.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(BusInner {
                listeners: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                capacity: capacity.max(1),
            }),
        }
    }

    pub fn subscribe(&self, name: &str) -> Subscription {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (sender, receiver) = mpsc::channel(self.inner.capacity);
        self.inner
            .listeners()
            .entry(name.to_string())
            .or_default()
            .push((id, sender));

        Subscription {
            id,
            name: name.to_string(),
            receiver,
            bus: Arc::downgrade(&self.inner),
        }
    }

    /// Deliver to every live subscriber of `name`. Returns how many received it.
    pub fn publish(&self, name: &str, payload: serde_json::Value) -> usize {
        let mut listeners = self.inner.listeners();
        let Some(entries) = listeners.get_mut(name) else {
            return 0;
        };

        let mut delivered = 0;
        entries.retain(|(id, sender)| {
            let event = EngineEvent {
                name: name.to_string(),
                payload: payload.clone(),
            };
            match sender.try_send(event) {
                Ok(()) => {
                    delivered += 1;
                    true
                }
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!("Dropping '{}' event for slow subscriber {}", name, id);
                    true
                }
                Err(mpsc::error::TrySendError::Closed(_)) => false,
            }
        });
        delivered
    }

    pub fn subscriber_count(&self, name: &str) -> usize {
        self.inner.listeners().get(name).map(Vec::len).unwrap_or(0)
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(16)
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let events: Vec<String> = self.inner.listeners().keys().cloned().collect();
        f.debug_struct("EventBus").field("events", &events).finish()
    }
}

/// Receiving end of one event-name subscription.
///
/// Dropping it removes the listener, same as [`Subscription::unsubscribe`].
pub struct Subscription {
    id: u64,
    name: String,
    receiver: mpsc::Receiver<EngineEvent>,
    bus: Weak<BusInner>,
}

impl Subscription {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn recv(&mut self) -> Option<EngineEvent> {
        self.receiver.recv().await
    }

    pub fn try_recv(&mut self) -> Option<EngineEvent> {
        self.receiver.try_recv().ok()
    }

    pub fn unsubscribe(self) {
        // Drop does the work.
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(bus) = self.bus.upgrade() {
            bus.remove(&self.name, self.id);
        }
    }
}

/// Per-render inputs taken from configuration.
#[derive(Debug, Clone)]
pub struct RenderOptions {
    pub viewport: Viewport,
    pub print_background: bool,
    pub jpeg_quality: u8,
}

impl RenderOptions {
    pub fn from_config(engine: &EngineConfig) -> Self {
        Self {
            viewport: engine.viewport.clone(),
            print_background: engine.print_background,
            jpeg_quality: 85,
        }
    }
}

/// One running engine process and its command/event transport.
#[async_trait]
pub trait EngineSession: Send + Sync {
    /// Transport endpoint, e.g. the DevTools websocket address.
    fn endpoint(&self) -> String;

    /// Non-destructive liveness probe.
    async fn is_alive(&self) -> bool;

    async fn render(
        &self,
        document: &Document,
        format: TargetFormat,
        options: &RenderOptions,
    ) -> Result<Vec<u8>, ConvertError>;

    fn events(&self) -> &EventBus;

    /// Close the transport and terminate the process. Safe to call twice.
    async fn close(&self);
}

#[async_trait]
pub trait EngineLauncher: Send + Sync {
    async fn launch(&self, instance_id: usize) -> Result<Arc<dyn EngineSession>, ConvertError>;

    /// Whether an engine binary is present on this host.
    fn is_installed(&self) -> bool {
        true
    }
}

const ENGINE_CANDIDATES: &[&str] = &[
    "chromium",
    "chromium-browser",
    "google-chrome",
    "google-chrome-stable",
    "chrome",
];

/// Resolve the engine executable: the configured path if it exists, else
/// the first known binary name found on `PATH`.
pub fn find_engine_executable(engine: &EngineConfig) -> Option<PathBuf> {
    if let Some(path) = &engine.chrome_path {
        let path = PathBuf::from(path);
        return path.is_file().then_some(path);
    }

    let search_path = std::env::var_os("PATH")?;
    std::env::split_paths(&search_path)
        .flat_map(|dir| ENGINE_CANDIDATES.iter().map(move |name| dir.join(name)))
        .find(|candidate| candidate.is_file())
}

pub struct ChromiumLauncher {
    engine: EngineConfig,
}

impl ChromiumLauncher {
    pub fn new(engine: EngineConfig) -> Self {
        Self { engine }
    }
}

#[async_trait]
impl EngineLauncher for ChromiumLauncher {
    async fn launch(&self, instance_id: usize) -> Result<Arc<dyn EngineSession>, ConvertError> {
        let mut engine = self.engine.clone();
        if engine.chrome_path.is_none() {
            engine.chrome_path = find_engine_executable(&engine).map(|p| p.display().to_string());
        }

        let scratch_dirs = instance_dirs(instance_id).to_vec();
        create_scratch_dirs(&scratch_dirs).await?;

        let launched = match engine_browser_config(&engine, instance_id) {
            Ok(browser_config) => Browser::launch(browser_config)
                .await
                .map_err(|e| ConvertError::LaunchFailed(e.to_string())),
            Err(e) => Err(e),
        };
        let (browser, mut handler) = match launched {
            Ok(launched) => launched,
            Err(e) => {
                remove_scratch_dirs(&scratch_dirs).await;
                return Err(e);
            }
        };

        let events = EventBus::default();
        let handler_events = events.clone();

        // The handler is a Stream that must be polled for the CDP connection
        // to make progress.
        let handler_task = tokio::spawn(async move {
            loop {
                match handler.next().await {
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => {
                        error!("Engine {} handler error: {}", instance_id, e);
                        handler_events.publish(
                            EVENT_DISCONNECTED,
                            serde_json::json!({ "instance_id": instance_id, "error": e.to_string() }),
                        );
                        break;
                    }
                    None => {
                        info!("Engine {} handler stream ended", instance_id);
                        handler_events.publish(
                            EVENT_DISCONNECTED,
                            serde_json::json!({ "instance_id": instance_id }),
                        );
                        break;
                    }
                }
            }
        });

        let endpoint = browser.websocket_address().clone();
        debug!("Engine {} listening on {}", instance_id, endpoint);

        Ok(Arc::new(ChromiumSession {
            instance_id,
            endpoint,
            browser: tokio::sync::Mutex::new(browser),
            handler: handler_task,
            events,
            scratch_dirs,
        }))
    }

    fn is_installed(&self) -> bool {
        find_engine_executable(&self.engine).is_some()
    }
}

pub struct ChromiumSession {
    instance_id: usize,
    endpoint: String,
    browser: tokio::sync::Mutex<Browser>,
    handler: tokio::task::JoinHandle<()>,
    events: EventBus,
    scratch_dirs: Vec<PathBuf>,
}

async fn create_scratch_dirs(dirs: &[PathBuf]) -> Result<(), ConvertError> {
    for dir in dirs {
        tokio::fs::create_dir_all(dir).await.map_err(|e| {
            ConvertError::LaunchFailed(format!("Failed to create {}: {e}", dir.display()))
        })?;
    }
    Ok(())
}

/// Missing directories are not an error, so closing twice is fine.
async fn remove_scratch_dirs(dirs: &[PathBuf]) {
    for dir in dirs {
        match tokio::fs::remove_dir_all(dir).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!("Failed to remove {}: {}", dir.display(), e),
        }
    }
}

fn render_error(e: impl std::fmt::Display) -> ConvertError {
    ConvertError::RenderFailed(e.to_string())
}

/// Prepend a `<base>` element so relative references resolve against
/// `base_url` when the markup does not carry its own.
fn with_base_href(document: &Document) -> std::borrow::Cow<'_, str> {
    match &document.base_url {
        Some(base) if !document.content.to_ascii_lowercase().contains("<base") => {
            std::borrow::Cow::Owned(format!(
                "<base href=\"{}\">{}",
                base.replace('"', "%22"),
                document.content
            ))
        }
        _ => std::borrow::Cow::Borrowed(&document.content),
    }
}

impl ChromiumSession {
    async fn render_page(
        &self,
        page: &Page,
        document: &Document,
        format: TargetFormat,
        options: &RenderOptions,
    ) -> Result<Vec<u8>, ConvertError> {
        let metrics = SetDeviceMetricsOverrideParams::builder()
            .width(options.viewport.width)
            .height(options.viewport.height)
            .device_scale_factor(options.viewport.device_scale_factor)
            .mobile(false)
            .build()
            .map_err(render_error)?;
        page.execute(metrics).await.map_err(render_error)?;

        page.set_content(with_base_href(document).as_ref())
            .await
            .map_err(render_error)?;
        self.events.publish(
            EVENT_PAGE_LOADED,
            serde_json::json!({ "instance_id": self.instance_id, "document": document.id }),
        );

        match format {
            TargetFormat::Pdf => {
                let mut params = PrintToPdfParams::default();
                params.print_background = Some(options.print_background);
                page.pdf(params).await.map_err(render_error)
            }
            TargetFormat::Png => {
                let params = ScreenshotParams::builder()
                    .format(CaptureScreenshotFormat::Png)
                    .full_page(true)
                    .build();
                page.screenshot(params).await.map_err(render_error)
            }
            TargetFormat::Jpeg => {
                let params = ScreenshotParams::builder()
                    .format(CaptureScreenshotFormat::Jpeg)
                    .quality(i64::from(options.jpeg_quality))
                    .full_page(true)
                    .build();
                page.screenshot(params).await.map_err(render_error)
            }
            TargetFormat::Mhtml => {
                let mut params = CaptureSnapshotParams::default();
                params.format = Some(CaptureSnapshotFormat::Mhtml);
                let snapshot = page.execute(params).await.map_err(render_error)?;
                Ok(snapshot.result.data.into_bytes())
            }
            TargetFormat::SanitizedHtml => Err(ConvertError::RenderFailed(
                "engine does not produce sanitized markup".to_string(),
            )),
        }
    }
}

#[async_trait]
impl EngineSession for ChromiumSession {
    fn endpoint(&self) -> String {
        self.endpoint.clone()
    }

    async fn is_alive(&self) -> bool {
        if self.handler.is_finished() {
            return false;
        }
        let mut browser = self.browser.lock().await;
        match browser.get_mut_child() {
            Some(child) => matches!(child.try_wait(), Ok(None)),
            None => true,
        }
    }

    async fn render(
        &self,
        document: &Document,
        format: TargetFormat,
        options: &RenderOptions,
    ) -> Result<Vec<u8>, ConvertError> {
        let page = {
            let browser = self.browser.lock().await;
            browser.new_page("about:blank").await.map_err(render_error)?
        };

        let result = self.render_page(&page, document, format, options).await;
        let _ = page.close().await;
        result
    }

    fn events(&self) -> &EventBus {
        &self.events
    }

    async fn close(&self) {
        let mut browser = self.browser.lock().await;
        if let Err(e) = browser.close().await {
            debug!("Engine {} close: {}", self.instance_id, e);
        }
        self.handler.abort();
        remove_scratch_dirs(&self.scratch_dirs).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn scratch_dirs_are_created_and_removed() {
        let root = tempfile::tempdir().expect("tempdir");
        let dirs = vec![root.path().join("profile"), root.path().join("temp")];

        create_scratch_dirs(&dirs).await.expect("create");
        std::fs::write(dirs[0].join("Preferences"), b"{}").expect("write");
        assert!(dirs.iter().all(|d| d.is_dir()));

        remove_scratch_dirs(&dirs).await;
        assert!(dirs.iter().all(|d| !d.exists()));
        // Second close finds nothing to remove.
        remove_scratch_dirs(&dirs).await;
    }

    #[tokio::test]
    async fn publishes_only_to_matching_subscribers() {
        let bus = EventBus::new(4);
        let mut loaded = bus.subscribe(EVENT_PAGE_LOADED);
        let mut disconnected = bus.subscribe(EVENT_DISCONNECTED);

        assert_eq!(bus.publish(EVENT_PAGE_LOADED, serde_json::json!({"n": 1})), 1);
        let event = loaded.recv().await.expect("event");
        assert_eq!(event.name, EVENT_PAGE_LOADED);
        assert_eq!(event.payload["n"], 1);
        assert!(disconnected.try_recv().is_none());
    }

    #[tokio::test]
    async fn unsubscribe_removes_listener() {
        let bus = EventBus::new(4);
        let first = bus.subscribe(EVENT_DISCONNECTED);
        let second = bus.subscribe(EVENT_DISCONNECTED);
        assert_eq!(bus.subscriber_count(EVENT_DISCONNECTED), 2);

        first.unsubscribe();
        assert_eq!(bus.subscriber_count(EVENT_DISCONNECTED), 1);
        drop(second);
        assert_eq!(bus.subscriber_count(EVENT_DISCONNECTED), 0);
        assert_eq!(bus.publish(EVENT_DISCONNECTED, serde_json::Value::Null), 0);
    }

    #[tokio::test]
    async fn full_subscriber_does_not_block_publish() {
        let bus = EventBus::new(1);
        let mut slow = bus.subscribe(EVENT_PAGE_LOADED);
        assert_eq!(bus.publish(EVENT_PAGE_LOADED, serde_json::json!(1)), 1);
        assert_eq!(bus.publish(EVENT_PAGE_LOADED, serde_json::json!(2)), 0);
        assert_eq!(slow.recv().await.map(|e| e.payload), Some(serde_json::json!(1)));
        assert_eq!(bus.subscriber_count(EVENT_PAGE_LOADED), 1);
    }

    #[test]
    fn base_href_is_injected_once() {
        let doc = Document::new("<p>x</p>").with_base_url("https://example.com/");
        assert!(with_base_href(&doc).starts_with("<base href=\"https://example.com/\">"));

        let doc = Document::new("<base href=\"/x\"><p>x</p>").with_base_url("https://example.com/");
        assert_eq!(with_base_href(&doc), doc.content.as_str());
    }

    #[test]
    fn configured_missing_executable_is_not_found() {
        let engine = EngineConfig {
            chrome_path: Some("/nonexistent/chrome".into()),
            ..Default::default()
        };
        assert!(find_engine_executable(&engine).is_none());
        assert!(!ChromiumLauncher::new(engine).is_installed());
    }
}
