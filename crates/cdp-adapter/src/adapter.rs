//! Page-scoped browser session on top of a [`CdpTransport`].

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use flowprobe_event_bus::{EventBus, Handler, InMemoryBus, ListenerId, ListenerSet};
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio::{select, spawn};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::commands::{
    AttachToTargetResult, Cookie, CookiesResult, CreateTargetResult, DeleteCookiesParams,
    NavigateResult, RequestPattern,
};
use crate::config::CdpConfig;
use crate::error::{AdapterError, AdapterErrorKind};
use crate::events::{decode, loaded_frame, BrowserEvent, PageSignal};
use crate::ids::PageId;
use crate::metrics;
use crate::transport::{
    CdpTransport, ChromiumTransport, CommandTarget, NoopTransport, TransportEvent,
};

/// What a redirect-flow check needs from a browser page.
#[async_trait]
pub trait BrowserSession: Send + Sync {
    /// Enable the network, page and fetch domains; every request is paused.
    async fn enable_interception(&self) -> Result<(), AdapterError>;

    /// Navigate and wait until the page reports `load`.
    async fn navigate(&self, url: &str, deadline: Duration) -> Result<(), AdapterError>;

    async fn get_cookies(&self, scope: &str) -> Result<Vec<Cookie>, AdapterError>;

    async fn get_all_cookies(&self) -> Result<Vec<Cookie>, AdapterError>;

    async fn delete_cookies(&self, name: &str, scope: &str) -> Result<(), AdapterError>;

    /// Resume a paused request without modification.
    async fn continue_request(&self, request_id: &str) -> Result<(), AdapterError>;

    /// Register a handler invoked synchronously for every network event of the page.
    fn listen(&self, handler: Handler<BrowserEvent>) -> ListenerId;

    fn unlisten(&self, id: ListenerId);
}

/// Adapter implementation with pluggable transport.
pub struct CdpAdapter {
    pub page: PageId,
    pub cfg: CdpConfig,
    shutdown: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    transport: Arc<dyn CdpTransport>,
    session: RwLock<Option<String>>,
    listeners: ListenerSet<BrowserEvent>,
    signals: Arc<InMemoryBus<PageSignal>>,
}

fn protocol_error(method: &str, err: serde_json::Error) -> AdapterError {
    AdapterError::new(AdapterErrorKind::Protocol)
        .with_hint(format!("unexpected {method} result: {err}"))
}

fn parse_result<T: DeserializeOwned>(method: &str, value: Value) -> Result<T, AdapterError> {
    serde_json::from_value(value).map_err(|err| protocol_error(method, err))
}

impl CdpAdapter {
    pub fn new(cfg: CdpConfig) -> Self {
        let transport: Arc<dyn CdpTransport> = if cfg.websocket_url.is_some() {
            info!(target: "cdp-adapter", "using remote Chromium transport");
            Arc::new(ChromiumTransport::new(cfg.clone()))
        } else {
            warn!(
                target: "cdp-adapter",
                remediation = "set FLOWPROBE_WS_URL or pass --ws-url",
                "no devtools endpoint configured; browser commands will fail"
            );
            Arc::new(NoopTransport)
        };
        Self::with_transport(cfg, transport)
    }

    pub fn with_transport(cfg: CdpConfig, transport: Arc<dyn CdpTransport>) -> Self {
        let signals = InMemoryBus::new(cfg.signal_buffer);
        Self {
            page: PageId::new(),
            cfg,
            shutdown: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
            transport,
            session: RwLock::new(None),
            listeners: ListenerSet::new(),
            signals,
        }
    }

    /// Token cancelled by [`CdpAdapter::shutdown`].
    pub fn cancel_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn session_id(&self) -> Option<String> {
        self.session.read().clone()
    }

    /// Connect the transport and start the event loop. Calling it twice is a no-op.
    pub async fn start(self: Arc<Self>) -> Result<(), AdapterError> {
        {
            let guard = self.tasks.lock().await;
            if !guard.is_empty() {
                return Ok(());
            }
        }

        self.transport.start().await?;
        let loop_task = spawn(Self::event_loop(Arc::clone(&self)));
        self.tasks.lock().await.push(loop_task);
        info!(target: "cdp-adapter", page = ?self.page, "event loop started");
        Ok(())
    }

    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        self.listeners.clear();
        let mut handles = self.tasks.lock().await;
        while let Some(handle) = handles.pop() {
            let _ = handle.await;
        }
        let totals = metrics::snapshot();
        info!(
            target: "cdp-adapter",
            commands_ok = totals.commands_ok,
            commands_failed = totals.commands_failed,
            events = totals.events,
            continuations = totals.continuations,
            "adapter shut down"
        );
    }

    /// Create a blank tab and attach to it with a flattened session.
    pub async fn open_page(&self) -> Result<String, AdapterError> {
        let created: CreateTargetResult = parse_result(
            "Target.createTarget",
            self.send_command("Target.createTarget", json!({ "url": "about:blank" }))
                .await?,
        )?;
        let attached: AttachToTargetResult = parse_result(
            "Target.attachToTarget",
            self.send_command(
                "Target.attachToTarget",
                json!({ "targetId": created.target_id, "flatten": true }),
            )
            .await?,
        )?;

        *self.session.write() = Some(attached.session_id.clone());
        info!(
            target: "cdp-adapter",
            target_id = %created.target_id,
            session = %attached.session_id,
            "page attached"
        );
        Ok(attached.session_id)
    }

    async fn event_loop(self: Arc<Self>) {
        debug!(target: "cdp-adapter", "event loop entered");
        const MIN_BACKOFF: Duration = Duration::from_millis(100);
        const MAX_BACKOFF: Duration = Duration::from_secs(5);
        let mut backoff = MIN_BACKOFF;

        loop {
            select! {
                _ = self.shutdown.cancelled() => {
                    break;
                }
                event = self.transport.next_event() => {
                    match event {
                        Some(ev) => {
                            backoff = MIN_BACKOFF;
                            self.handle_event(ev).await;
                        }
                        None => {
                            if self.shutdown.is_cancelled() {
                                break;
                            }
                            self.handle_transport_disconnect().await;
                            warn!(target: "cdp-adapter", "transport stream ended; attempting restart");
                            if let Err(err) = self.transport.start().await {
                                warn!(target: "cdp-adapter", ?err, "transport restart failed");
                            }
                            if self.shutdown.is_cancelled() {
                                break;
                            }
                            sleep(backoff).await;
                            backoff = (backoff + MIN_BACKOFF).min(MAX_BACKOFF);
                        }
                    }
                }
            }
        }
        debug!(target: "cdp-adapter", "event loop exiting");
    }

    async fn handle_transport_disconnect(&self) {
        let had_session = self.session.write().take().is_some();
        if had_session {
            warn!(target: "cdp-adapter", "page session lost with the transport");
        }
        let _ = self.signals.publish(PageSignal::Disconnected).await;
    }

    async fn handle_event(&self, event: TransportEvent) {
        metrics::record_event(&event.method);
        let session = self.session.read().clone();
        if event.session_id != session {
            trace!(
                target: "cdp-adapter",
                method = %event.method,
                session = ?event.session_id,
                "event for foreign session skipped"
            );
            return;
        }

        if let Some(frame) = loaded_frame(&event.method, &event.params) {
            let signal = PageSignal::Loaded {
                session: event.session_id.clone().unwrap_or_default(),
                frame,
            };
            let _ = self.signals.publish(signal).await;
            return;
        }

        match decode(&event.method, event.params) {
            Ok(Some(decoded)) => {
                trace!(target: "cdp-adapter", method = decoded.method(), "dispatching event");
                self.listeners.dispatch(&decoded);
            }
            Ok(None) => {}
            Err(err) => {
                warn!(target: "cdp-adapter", method = %event.method, %err, "failed to decode event");
            }
        }
    }

    async fn send_command(&self, method: &str, params: Value) -> Result<Value, AdapterError> {
        self.send(CommandTarget::Browser, method, params).await
    }

    async fn send_page_command(&self, method: &str, params: Value) -> Result<Value, AdapterError> {
        let session = self.session_id().ok_or_else(|| {
            AdapterError::new(AdapterErrorKind::Internal)
                .with_hint(format!("no page attached for {method}"))
        })?;
        self.send(CommandTarget::Session(session), method, params)
            .await
    }

    async fn send(
        &self,
        target: CommandTarget,
        method: &str,
        params: Value,
    ) -> Result<Value, AdapterError> {
        if self.shutdown.is_cancelled() {
            return Err(AdapterError::new(AdapterErrorKind::Cancelled)
                .with_hint(format!("adapter shut down before {method}")));
        }
        let start = Instant::now();
        let result = self.transport.send_command(target, method, params).await;
        metrics::observe_command(method, start.elapsed(), result.is_ok());
        result
    }

    /// Wait for `load` of the navigated frame; loads of other frames are skipped.
    async fn wait_for_load(
        &self,
        signals: &mut tokio::sync::broadcast::Receiver<PageSignal>,
        main_frame: Option<&str>,
    ) -> Result<(), AdapterError> {
        let session = self.session_id().unwrap_or_default();
        loop {
            match signals.recv().await {
                Ok(PageSignal::Loaded { session: loaded, frame }) if loaded == session => {
                    match (main_frame, frame.as_deref()) {
                        (Some(main), Some(frame)) if frame != main => {
                            trace!(target: "cdp-adapter", frame, "subframe load skipped");
                        }
                        _ => return Ok(()),
                    }
                }
                Ok(PageSignal::Loaded { .. }) => continue,
                Ok(PageSignal::Disconnected) => {
                    return Err(AdapterError::new(AdapterErrorKind::CdpIo)
                        .with_hint("transport disconnected during navigation")
                        .retriable(true))
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!(target: "cdp-adapter", skipped, "page signal receiver lagged");
                }
                Err(RecvError::Closed) => {
                    return Err(AdapterError::new(AdapterErrorKind::Internal)
                        .with_hint("page signal bus closed"))
                }
            }
        }
    }
}

#[async_trait]
impl BrowserSession for CdpAdapter {
    async fn enable_interception(&self) -> Result<(), AdapterError> {
        self.send_page_command("Network.enable", json!({})).await?;
        self.send_page_command("Page.enable", json!({})).await?;
        self.send_page_command("Page.setLifecycleEventsEnabled", json!({ "enabled": true }))
            .await?;
        self.send_page_command(
            "Fetch.enable",
            json!({ "patterns": [RequestPattern::default()] }),
        )
        .await?;
        debug!(target: "cdp-adapter", "request interception enabled");
        Ok(())
    }

    async fn navigate(&self, url: &str, deadline: Duration) -> Result<(), AdapterError> {
        let mut signals = self.signals.subscribe();
        let navigation = async {
            let result = self
                .send_page_command("Page.navigate", json!({ "url": url }))
                .await?;
            let result: NavigateResult = parse_result("Page.navigate", result)?;
            if let Some(error_text) = result.error_text.filter(|text| !text.is_empty()) {
                return Err(AdapterError::new(AdapterErrorKind::Protocol)
                    .with_hint(format!("navigation to {url} failed: {error_text}"))
                    .with_data(json!({ "url": url, "errorText": error_text })));
            }
            self.wait_for_load(&mut signals, result.frame_id.as_deref())
                .await
        };

        select! {
            _ = self.shutdown.cancelled() => Err(
                AdapterError::new(AdapterErrorKind::Cancelled).with_hint("navigation cancelled")
            ),
            outcome = tokio::time::timeout(deadline, navigation) => match outcome {
                Ok(result) => result,
                Err(_) => Err(AdapterError::new(AdapterErrorKind::NavTimeout)
                    .with_hint(format!("{url} did not finish loading within {deadline:?}"))
                    .with_data(json!({ "url": url, "deadline_ms": deadline.as_millis() as u64 }))),
            },
        }
    }

    async fn get_cookies(&self, scope: &str) -> Result<Vec<Cookie>, AdapterError> {
        let value = self
            .send_page_command("Network.getCookies", json!({ "urls": [scope] }))
            .await?;
        Ok(parse_result::<CookiesResult>("Network.getCookies", value)?.cookies)
    }

    async fn get_all_cookies(&self) -> Result<Vec<Cookie>, AdapterError> {
        let value = self
            .send_page_command("Network.getAllCookies", json!({}))
            .await?;
        Ok(parse_result::<CookiesResult>("Network.getAllCookies", value)?.cookies)
    }

    async fn delete_cookies(&self, name: &str, scope: &str) -> Result<(), AdapterError> {
        let params = DeleteCookiesParams {
            name: name.to_string(),
            url: Some(scope.to_string()),
            domain: None,
            path: None,
        };
        let params = serde_json::to_value(params).map_err(|err| {
            AdapterError::new(AdapterErrorKind::Internal).with_hint(err.to_string())
        })?;
        self.send_page_command("Network.deleteCookies", params)
            .await?;
        Ok(())
    }

    async fn continue_request(&self, request_id: &str) -> Result<(), AdapterError> {
        self.send_page_command("Fetch.continueRequest", json!({ "requestId": request_id }))
            .await?;
        metrics::record_continuation();
        Ok(())
    }

    fn listen(&self, handler: Handler<BrowserEvent>) -> ListenerId {
        self.listeners.listen(handler)
    }

    fn unlisten(&self, id: ListenerId) {
        if let Err(err) = self.listeners.remove(id) {
            debug!(target: "cdp-adapter", %err, "listener already removed");
        }
    }
}
