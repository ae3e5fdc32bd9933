//! Websocket transport to a remote Chromium.
//!
//! A [`Link`] is one live websocket. Its pump task owns the [`Connection`]: queued
//! commands are submitted, responses are routed back to callers by call id, and every
//! event is forwarded in arrival order into one channel drained by the adapter.
//! A dead link is replaced on the next use.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chromiumoxide::cdp::browser_protocol::target::SessionId as CdpSessionId;
use chromiumoxide::cdp::events::CdpEventMessage;
use chromiumoxide::conn::Connection;
use chromiumoxide::error::CdpError;
use chromiumoxide_types::{CallId, CdpJsonEventMessage, Message, MethodId, Response};
use futures::{future::BoxFuture, StreamExt};
use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::config::CdpConfig;
use crate::error::{AdapterError, AdapterErrorKind};
use crate::util::resolve_ws_url;

const HEARTBEAT_METHOD: &str = "Browser.getVersion";
const MAX_HEARTBEAT_WAIT: Duration = Duration::from_secs(5);

/// A CDP event as it came off the wire.
#[derive(Clone, Debug)]
pub struct TransportEvent {
    pub method: String,
    pub params: Value,
    /// Flattened session the event belongs to; `None` for browser-level events.
    pub session_id: Option<String>,
}

#[derive(Clone, Debug)]
pub enum CommandTarget {
    Browser,
    Session(String),
}

#[async_trait]
pub trait CdpTransport: Send + Sync {
    async fn start(&self) -> Result<(), AdapterError>;
    /// `None` once the underlying connection is gone.
    async fn next_event(&self) -> Option<TransportEvent>;
    async fn send_command(
        &self,
        target: CommandTarget,
        method: &str,
        params: Value,
    ) -> Result<Value, AdapterError>;
}

/// Transport used when no endpoint is configured; every command fails.
#[derive(Default)]
pub struct NoopTransport;

#[async_trait]
impl CdpTransport for NoopTransport {
    async fn start(&self) -> Result<(), AdapterError> {
        Ok(())
    }

    async fn next_event(&self) -> Option<TransportEvent> {
        None
    }

    async fn send_command(
        &self,
        _target: CommandTarget,
        method: &str,
        _params: Value,
    ) -> Result<Value, AdapterError> {
        Err(AdapterError::new(AdapterErrorKind::Internal)
            .with_hint(format!("no devtools endpoint; cannot send {method}")))
    }
}

type Reply = oneshot::Sender<Result<Value, AdapterError>>;

struct Outbound {
    target: CommandTarget,
    method: String,
    params: Value,
    reply: Reply,
}

/// Cloneable handle for submitting commands to a link's pump.
#[derive(Clone)]
struct Requester {
    tx: mpsc::Sender<Outbound>,
}

impl Requester {
    async fn call(
        &self,
        target: CommandTarget,
        method: &str,
        params: Value,
        deadline: Duration,
    ) -> Result<Value, AdapterError> {
        let (reply, response) = oneshot::channel();
        self.tx
            .send(Outbound {
                target,
                method: method.to_string(),
                params,
                reply,
            })
            .await
            .map_err(|_| {
                AdapterError::new(AdapterErrorKind::CdpIo).with_hint("cdp link is closed")
            })?;

        match tokio::time::timeout(deadline, response).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(AdapterError::new(AdapterErrorKind::CdpIo)
                .with_hint(format!("{method}: link dropped the reply"))),
            Err(_) => Err(AdapterError::new(AdapterErrorKind::NavTimeout)
                .with_hint(format!("{method}: no reply within {deadline:?}"))),
        }
    }
}

type Connector =
    Arc<dyn Fn(CdpConfig) -> BoxFuture<'static, Result<Arc<Link>, AdapterError>> + Send + Sync>;

/// Transport over a remote DevTools websocket, reconnecting when the link dies.
#[derive(Clone)]
pub struct ChromiumTransport {
    cfg: CdpConfig,
    link: Arc<Mutex<Option<Arc<Link>>>>,
    connect: Connector,
}

impl ChromiumTransport {
    pub fn new(cfg: CdpConfig) -> Self {
        let connect: Connector =
            Arc::new(|cfg: CdpConfig| Box::pin(async move { Link::open(&cfg).await.map(Arc::new) }));
        Self::with_connector(cfg, connect)
    }

    fn with_connector(cfg: CdpConfig, connect: Connector) -> Self {
        Self {
            cfg,
            link: Arc::new(Mutex::new(None)),
            connect,
        }
    }

    fn deadline(&self) -> Duration {
        Duration::from_millis(self.cfg.default_deadline_ms)
    }

    /// The current link, opening a new one if there is none or it has died.
    async fn link(&self) -> Result<Arc<Link>, AdapterError> {
        let mut slot = self.link.lock().await;
        if let Some(link) = slot.as_ref().filter(|link| link.is_alive()) {
            return Ok(Arc::clone(link));
        }
        if slot.is_some() {
            info!(target: "cdp-transport", "cdp link lost, reconnecting");
        }
        let link = (self.connect)(self.cfg.clone()).await?;
        *slot = Some(Arc::clone(&link));
        Ok(link)
    }
}

#[async_trait]
impl CdpTransport for ChromiumTransport {
    async fn start(&self) -> Result<(), AdapterError> {
        let link = self.link().await?;
        let version = link
            .requester
            .call(CommandTarget::Browser, HEARTBEAT_METHOD, json!({}), self.deadline())
            .await?;
        let field = |name: &str| {
            version
                .get(name)
                .and_then(Value::as_str)
                .unwrap_or("unknown")
                .to_string()
        };
        info!(
            target: "cdp-transport",
            product = %field("product"),
            protocol = %field("protocolVersion"),
            "attached to remote browser"
        );
        Ok(())
    }

    async fn next_event(&self) -> Option<TransportEvent> {
        match self.link().await {
            Ok(link) => link.events.lock().await.recv().await,
            Err(err) => {
                warn!(target: "cdp-transport", ?err, "no cdp link for events");
                None
            }
        }
    }

    async fn send_command(
        &self,
        target: CommandTarget,
        method: &str,
        params: Value,
    ) -> Result<Value, AdapterError> {
        self.link()
            .await?
            .requester
            .call(target, method, params, self.deadline())
            .await
    }
}

/// One websocket connection with its pump and heartbeat tasks.
struct Link {
    requester: Requester,
    events: Mutex<mpsc::Receiver<TransportEvent>>,
    alive: Arc<AtomicBool>,
    tasks: Vec<JoinHandle<()>>,
}

impl Link {
    async fn open(cfg: &CdpConfig) -> Result<Self, AdapterError> {
        let configured = cfg.websocket_url.as_deref().ok_or_else(|| {
            AdapterError::new(AdapterErrorKind::CdpIo)
                .with_hint("no devtools endpoint configured (set FLOWPROBE_WS_URL)")
        })?;
        let endpoint =
            resolve_ws_url(configured, Duration::from_millis(cfg.discovery_timeout_ms)).await?;

        let conn = Connection::<CdpEventMessage>::connect(&endpoint.ws_url)
            .await
            .map_err(|err| {
                AdapterError::new(AdapterErrorKind::CdpIo)
                    .with_hint(format!("connecting to {}: {err}", endpoint.ws_url))
                    .retriable(true)
            })?;

        let (command_tx, command_rx) = mpsc::channel(128);
        let (event_tx, event_rx) = mpsc::channel(512);
        let alive = Arc::new(AtomicBool::new(true));
        let requester = Requester { tx: command_tx };

        let pump_alive = Arc::clone(&alive);
        let mut tasks = vec![tokio::spawn(async move {
            let pump = Pump {
                conn,
                pending: HashMap::new(),
                events: event_tx,
            };
            if let Err(err) = pump.run(command_rx).await {
                error!(target: "cdp-transport", ?err, "cdp pump stopped");
            }
            pump_alive.store(false, Ordering::Relaxed);
        })];

        let every = Duration::from_millis(cfg.heartbeat_interval_ms);
        if !every.is_zero() {
            let wait = Duration::from_millis(cfg.default_deadline_ms).min(MAX_HEARTBEAT_WAIT);
            tasks.push(tokio::spawn(heartbeat(
                requester.clone(),
                Arc::clone(&alive),
                every,
                wait,
            )));
        }

        info!(
            target: "cdp-transport",
            url = %endpoint.ws_url,
            browser = endpoint.browser.as_deref().unwrap_or("unknown"),
            "cdp link open"
        );

        Ok(Self {
            requester,
            events: Mutex::new(event_rx),
            alive,
            tasks,
        })
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Relaxed)
    }

    #[cfg(test)]
    fn detached() -> (Self, Arc<AtomicBool>) {
        let (tx, _rx) = mpsc::channel(1);
        let (_event_tx, event_rx) = mpsc::channel(1);
        let alive = Arc::new(AtomicBool::new(true));
        (
            Self {
                requester: Requester { tx },
                events: Mutex::new(event_rx),
                alive: Arc::clone(&alive),
                tasks: Vec::new(),
            },
            alive,
        )
    }
}

impl Drop for Link {
    fn drop(&mut self) {
        self.alive.store(false, Ordering::Relaxed);
        for task in &self.tasks {
            task.abort();
        }
    }
}

/// Periodic liveness probe; the first failure marks the link dead.
async fn heartbeat(requester: Requester, alive: Arc<AtomicBool>, every: Duration, wait: Duration) {
    let mut ticker = interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    ticker.tick().await;

    loop {
        ticker.tick().await;
        if !alive.load(Ordering::Relaxed) {
            return;
        }
        if let Err(err) = requester
            .call(CommandTarget::Browser, HEARTBEAT_METHOD, json!({}), wait)
            .await
        {
            warn!(target: "cdp-transport", %err, "heartbeat failed, marking link dead");
            alive.store(false, Ordering::Relaxed);
            return;
        }
        debug!(target: "cdp-transport", "heartbeat ok");
    }
}

struct Pump {
    conn: Connection<CdpEventMessage>,
    pending: HashMap<CallId, Reply>,
    events: mpsc::Sender<TransportEvent>,
}

impl Pump {
    async fn run(mut self, mut commands: mpsc::Receiver<Outbound>) -> Result<(), AdapterError> {
        loop {
            tokio::select! {
                Some(outbound) = commands.recv() => self.submit(outbound),
                message = self.conn.next() => match message {
                    Some(Ok(Message::Response(resp))) => self.resolve(resp),
                    Some(Ok(Message::Event(event))) => self.forward(event).await,
                    Some(Err(err)) => {
                        let err = connection_error(err);
                        self.fail_pending(&err);
                        return Err(err);
                    }
                    None => {
                        self.fail_pending(
                            &AdapterError::new(AdapterErrorKind::CdpIo)
                                .with_hint("cdp connection closed"),
                        );
                        return Ok(());
                    }
                },
            }
        }
    }

    fn submit(&mut self, outbound: Outbound) {
        let session = match outbound.target {
            CommandTarget::Browser => None,
            CommandTarget::Session(id) => Some(CdpSessionId::from(id)),
        };
        let method: MethodId = outbound.method.clone().into();
        match self.conn.submit_command(method, session, outbound.params) {
            Ok(call) => {
                self.pending.insert(call, outbound.reply);
            }
            Err(err) => {
                let _ = outbound.reply.send(Err(AdapterError::new(AdapterErrorKind::CdpIo)
                    .with_hint(format!("submitting {}: {err}", outbound.method))));
            }
        }
    }

    fn resolve(&mut self, resp: Response) {
        match self.pending.remove(&resp.id) {
            Some(reply) => {
                let _ = reply.send(response_payload(resp));
            }
            None => debug!(target: "cdp-transport", id = ?resp.id, "reply for unknown call"),
        }
    }

    async fn forward(&mut self, event: CdpEventMessage) {
        let raw: CdpJsonEventMessage = match event.try_into() {
            Ok(raw) => raw,
            Err(err) => {
                warn!(target: "cdp-transport", %err, "undecodable cdp event dropped");
                return;
            }
        };
        let event = TransportEvent {
            method: raw.method.into_owned(),
            params: raw.params,
            session_id: raw.session_id,
        };
        if self.events.send(event).await.is_err() {
            debug!(target: "cdp-transport", "event receiver gone");
        }
    }

    fn fail_pending(&mut self, err: &AdapterError) {
        for (_, reply) in self.pending.drain() {
            let _ = reply.send(Err(err.clone()));
        }
    }
}

fn response_payload(resp: Response) -> Result<Value, AdapterError> {
    match (resp.result, resp.error) {
        (Some(result), _) => Ok(result),
        (None, Some(error)) => Err(AdapterError::new(AdapterErrorKind::Protocol)
            .with_hint(format!("cdp error {}: {}", error.code, error.message))
            .retriable(error.code >= 500)),
        (None, None) => {
            Err(AdapterError::new(AdapterErrorKind::Internal).with_hint("empty cdp response"))
        }
    }
}

fn connection_error(err: CdpError) -> AdapterError {
    let hint = err.to_string();
    match err {
        CdpError::Timeout => AdapterError::new(AdapterErrorKind::NavTimeout)
            .with_hint(hint)
            .retriable(true),
        CdpError::Serde(_)
        | CdpError::DecodeError(_)
        | CdpError::Chrome(_)
        | CdpError::ChromeMessage(_) => {
            AdapterError::new(AdapterErrorKind::Protocol).with_hint(hint)
        }
        _ => AdapterError::new(AdapterErrorKind::CdpIo)
            .with_hint(hint)
            .retriable(true),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex as SyncMutex;
    use std::sync::atomic::AtomicUsize;

    #[tokio::test]
    async fn dead_link_is_replaced_on_next_use() {
        let opened = Arc::new(AtomicUsize::new(0));
        let flags = Arc::new(SyncMutex::new(Vec::<Arc<AtomicBool>>::new()));

        let connect: Connector = {
            let opened = Arc::clone(&opened);
            let flags = Arc::clone(&flags);
            Arc::new(move |_cfg: CdpConfig| {
                opened.fetch_add(1, Ordering::SeqCst);
                let (link, alive) = Link::detached();
                flags.lock().push(alive);
                Box::pin(async move { Ok(Arc::new(link)) })
            })
        };
        let transport = ChromiumTransport::with_connector(CdpConfig::default(), connect);

        let first = transport.link().await.expect("first link");
        let again = transport.link().await.expect("cached link");
        assert!(Arc::ptr_eq(&first, &again));
        assert_eq!(opened.load(Ordering::SeqCst), 1);

        flags.lock()[0].store(false, Ordering::SeqCst);
        let second = transport.link().await.expect("second link");
        assert_eq!(opened.load(Ordering::SeqCst), 2);
        assert!(!Arc::ptr_eq(&first, &second));
    }

    #[tokio::test]
    async fn link_requires_an_endpoint() {
        let cfg = CdpConfig {
            websocket_url: None,
            ..CdpConfig::default()
        };
        let err = match Link::open(&cfg).await {
            Ok(_) => panic!("link opened without endpoint"),
            Err(err) => err,
        };
        assert_eq!(err.kind, AdapterErrorKind::CdpIo);
    }

    #[tokio::test]
    async fn closed_link_fails_commands_fast() {
        let (link, _alive) = Link::detached();
        let err = link
            .requester
            .call(
                CommandTarget::Browser,
                HEARTBEAT_METHOD,
                json!({}),
                Duration::from_secs(1),
            )
            .await
            .expect_err("receiver dropped");
        assert_eq!(err.kind, AdapterErrorKind::CdpIo);
    }

    #[tokio::test]
    async fn noop_transport_rejects_commands() {
        let err = NoopTransport
            .send_command(CommandTarget::Browser, "Network.getAllCookies", json!({}))
            .await
            .expect_err("noop");
        assert_eq!(err.kind, AdapterErrorKind::Internal);
        assert!(NoopTransport.next_event().await.is_none());
    }
}
