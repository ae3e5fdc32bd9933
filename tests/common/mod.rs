#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use cdp_adapter::{AdapterError, AdapterErrorKind, BrowserEvent, BrowserSession, Cookie};
use flowprobe::flow::FlowConfig;
use flowprobe::Scenario;
use flowprobe_event_bus::{Handler, ListenerId, ListenerSet};
use parking_lot::Mutex;
use tokio::sync::oneshot;

pub const TOKEN: &str = concat!(
    "eyJhbGciOiJIUzI1NiIsInR5cCI6IkpXVCJ9",
    ".eyJzdWIiOiJmb28iLCJleHAiOjE3MDAwMDAwMDB9",
    ".c2lnbmF0dXJl"
);

/// One request of the redirect chain as the fake browser replays it.
#[derive(Clone, Debug)]
pub struct Hop {
    pub url: String,
    pub network_id: String,
    pub status: i64,
    pub headers: BTreeMap<String, String>,
    /// Cookies the jar holds once this response has been processed.
    pub set_cookies: Vec<Cookie>,
    pub clear_cookies: Vec<String>,
}

impl Hop {
    pub fn new(url: impl Into<String>, network_id: &str, status: i64) -> Self {
        Self {
            url: url.into(),
            network_id: network_id.to_string(),
            status,
            headers: BTreeMap::new(),
            set_cookies: Vec::new(),
            clear_cookies: Vec::new(),
        }
    }

    pub fn header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.insert(name.to_string(), value.into());
        self
    }

    pub fn sets(mut self, name: &str, value: &str) -> Self {
        self.set_cookies.push(Cookie::new(name, value));
        self
    }

    pub fn clears(mut self, name: &str) -> Self {
        self.clear_cookies.push(name.to_string());
        self
    }
}

/// The gateway chain the default scenario expects, as a working gateway serves it.
pub fn couper_hops() -> Vec<Hop> {
    let entry = "http://couper:8080/en/docs/?foo=oidc-test";
    let authorize = "http://testop:8080/auth?client_id=foo&code_challenge=Qx3L&state=abc";
    let callback = "http://couper:8080/_couper/oidc/callback?code=asdf&state=%2Fen%2Fdocs%2F%3Ffoo%3Doidc-test";
    vec![
        Hop::new(entry, "net-0", 403).header("Content-Type", "text/html"),
        Hop::new(
            "http://couper:8080/_couper/oidc/start?url=%2Fen%2Fdocs%2F%3Ffoo%3Doidc-test",
            "net-1",
            303,
        )
        .header("Cache-Control", "no-cache,no-store")
        .header("Location", authorize)
        .header("Set-Cookie", "_couper_authvv=ver1; Path=/_couper/oidc/callback")
        .sets("_couper_authvv", "ver1"),
        Hop::new(authorize, "net-1", 303)
            .header("Cache-Control", "no-cache,no-store")
            .header("Location", callback),
        Hop::new(callback, "net-1", 303)
            .header("Cache-Control", "no-cache,no-store")
            .header("Location", "/en/docs/?foo=oidc-test")
            .header("Set-Cookie", format!("_couper_access_token={TOKEN}; Path=/"))
            .sets("_couper_access_token", TOKEN)
            .clears("_couper_authvv"),
        Hop::new(entry, "net-1", 200).header("Content-Type", "text/html"),
    ]
}

#[derive(Default)]
pub struct FakeBrowser {
    hops: Vec<Hop>,
    listeners: ListenerSet<BrowserEvent>,
    jar: Mutex<Vec<Cookie>>,
    pending: Mutex<HashMap<String, oneshot::Sender<()>>>,
    /// Cookie names `Network.deleteCookies` cannot remove.
    pinned: Vec<String>,
    /// The browser never gets past this URL.
    stuck_url: Option<String>,
    duplicate_pauses: bool,
    /// `Fetch.continueRequest` reports an error for this URL but the request still proceeds.
    failing_continue: Option<String>,
    pub calls: Mutex<Vec<String>>,
    pub continued: Mutex<Vec<String>>,
}

impl FakeBrowser {
    pub fn new(hops: Vec<Hop>) -> Self {
        Self {
            hops,
            ..Self::default()
        }
    }

    pub fn with_cookie(self, name: &str, value: &str) -> Self {
        self.jar.lock().push(Cookie::new(name, value));
        self
    }

    pub fn pin(mut self, name: &str) -> Self {
        self.pinned.push(name.to_string());
        self
    }

    pub fn stuck_at(mut self, url: &str) -> Self {
        self.stuck_url = Some(url.to_string());
        self
    }

    pub fn duplicate_pauses(mut self) -> Self {
        self.duplicate_pauses = true;
        self
    }

    pub fn failing_continue(mut self, url: &str) -> Self {
        self.failing_continue = Some(url.to_string());
        self
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }

    fn record(&self, call: impl Into<String>) {
        self.calls.lock().push(call.into());
    }

    async fn replay(&self) -> Result<(), AdapterError> {
        for (n, hop) in self.hops.iter().enumerate() {
            let job = format!("job-{n}");
            let (tx, rx) = oneshot::channel();
            self.pending.lock().insert(job.clone(), tx);

            let paused = BrowserEvent::RequestPaused {
                request_id: job.clone(),
                network_id: Some(hop.network_id.clone()),
                url: hop.url.clone(),
            };
            self.listeners.dispatch(&paused);
            if self.duplicate_pauses {
                self.listeners.dispatch(&paused);
            }

            if self.stuck_url.as_deref() == Some(hop.url.as_str()) {
                std::future::pending::<()>().await;
            }
            rx.await.map_err(|_| {
                AdapterError::new(AdapterErrorKind::Internal).with_hint(format!("{job} dropped"))
            })?;

            {
                let mut jar = self.jar.lock();
                jar.retain(|c| !hop.clear_cookies.contains(&c.name));
                for cookie in &hop.set_cookies {
                    jar.retain(|c| c.name != cookie.name);
                    jar.push(cookie.clone());
                }
            }
            self.listeners.dispatch(&BrowserEvent::ResponseExtraInfo {
                request_id: hop.network_id.clone(),
                status: hop.status,
                headers: hop.headers.clone(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl BrowserSession for FakeBrowser {
    async fn enable_interception(&self) -> Result<(), AdapterError> {
        self.record("Fetch.enable");
        Ok(())
    }

    async fn navigate(&self, url: &str, deadline: Duration) -> Result<(), AdapterError> {
        self.record(format!("Page.navigate {url}"));
        tokio::time::timeout(deadline, self.replay())
            .await
            .map_err(|_| AdapterError::new(AdapterErrorKind::NavTimeout).with_hint(url.to_string()))?
    }

    async fn get_cookies(&self, _scope: &str) -> Result<Vec<Cookie>, AdapterError> {
        Ok(self.jar.lock().clone())
    }

    async fn get_all_cookies(&self) -> Result<Vec<Cookie>, AdapterError> {
        self.record("Network.getAllCookies");
        Ok(self.jar.lock().clone())
    }

    async fn delete_cookies(&self, name: &str, scope: &str) -> Result<(), AdapterError> {
        self.record(format!("Network.deleteCookies {name} {scope}"));
        if !self.pinned.iter().any(|pinned| pinned == name) {
            self.jar.lock().retain(|c| c.name != name);
        }
        Ok(())
    }

    async fn continue_request(&self, request_id: &str) -> Result<(), AdapterError> {
        self.continued.lock().push(request_id.to_string());
        let idx: usize = request_id
            .trim_start_matches("job-")
            .parse()
            .map_err(|_| AdapterError::new(AdapterErrorKind::Protocol))?;
        if let Some(tx) = self.pending.lock().remove(request_id) {
            let _ = tx.send(());
        }
        let failing = self
            .hops
            .get(idx)
            .is_some_and(|hop| self.failing_continue.as_deref() == Some(hop.url.as_str()));
        if failing {
            return Err(AdapterError::new(AdapterErrorKind::Protocol).with_hint("Invalid InterceptionId."));
        }
        Ok(())
    }

    fn listen(&self, handler: Handler<BrowserEvent>) -> ListenerId {
        self.listeners.listen(handler)
    }

    fn unlisten(&self, id: ListenerId) {
        let _ = self.listeners.remove(id);
    }
}

pub fn fast_config() -> FlowConfig {
    FlowConfig {
        navigation_timeout_ms: 2_000,
        run_timeout_ms: 5_000,
        settle_ms: 20,
        event_log_capacity: 64,
    }
}

pub fn scenario() -> Scenario {
    Scenario::default()
}

pub fn session(browser: FakeBrowser) -> (Arc<FakeBrowser>, Arc<dyn BrowserSession>) {
    let browser = Arc::new(browser);
    let session: Arc<dyn BrowserSession> = browser.clone();
    (browser, session)
}
