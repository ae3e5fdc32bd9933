//! Chromium DevTools Protocol adapter used by flowprobe.
//!
//! The adapter attaches to one page of a remote Chromium instance, turns the page's raw
//! CDP network events into [`events::BrowserEvent`]s and hands them to registered
//! listeners in delivery order. It also exposes the handful of commands a redirect-flow
//! check needs: navigation, cookie access and resuming intercepted requests.

use serde::{Deserialize, Serialize};

pub mod ids {
    use serde::{Deserialize, Serialize};
    use uuid::Uuid;

    /// Unique identifier for a page/tab attached by the adapter.
    #[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
    pub struct PageId(pub Uuid);

    impl PageId {
        pub fn new() -> Self {
            Self(Uuid::new_v4())
        }
    }

    impl Default for PageId {
        fn default() -> Self {
            Self::new()
        }
    }
}

pub mod error {
    use serde::{Deserialize, Serialize};
    use std::fmt;
    use thiserror::Error;

    /// High-level error categories surfaced by the adapter.
    #[derive(Clone, Debug, Error, Eq, PartialEq, Serialize, Deserialize)]
    pub enum AdapterErrorKind {
        #[error("navigation timed out")]
        NavTimeout,
        #[error("cdp i/o failure")]
        CdpIo,
        #[error("operation cancelled")]
        Cancelled,
        #[error("protocol error")]
        Protocol,
        #[error("internal error")]
        Internal,
    }

    /// Enriched error metadata passed back to callers.
    #[derive(Clone, Debug, Serialize, Deserialize)]
    pub struct AdapterError {
        pub kind: AdapterErrorKind,
        pub hint: Option<String>,
        pub retriable: bool,
        pub data: Option<serde_json::Value>,
    }

    impl fmt::Display for AdapterError {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "{}", self.kind)?;
            if let Some(hint) = &self.hint {
                write!(f, ": {}", hint)?;
            }
            Ok(())
        }
    }

    impl std::error::Error for AdapterError {}

    impl AdapterError {
        pub fn new(kind: AdapterErrorKind) -> Self {
            Self {
                kind,
                hint: None,
                retriable: false,
                data: None,
            }
        }

        pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
            self.hint = Some(hint.into());
            self
        }

        pub fn retriable(mut self, flag: bool) -> Self {
            self.retriable = flag;
            self
        }

        pub fn with_data(mut self, data: serde_json::Value) -> Self {
            self.data = Some(data);
            self
        }

        pub fn is_cancelled(&self) -> bool {
            self.kind == AdapterErrorKind::Cancelled
        }
    }
}

pub mod events {
    use super::error::{AdapterError, AdapterErrorKind};
    use serde::de::DeserializeOwned;
    use serde::{Deserialize, Serialize};
    use serde_json::Value;
    use std::collections::BTreeMap;

    pub type Headers = BTreeMap<String, String>;

    /// Network-level events of the attached page, decoded from CDP.
    #[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
    #[serde(tag = "kind", rename_all = "snake_case")]
    pub enum BrowserEvent {
        /// `Network.requestWillBeSent`
        RequestInitiated { request_id: String, url: String },
        /// `Fetch.requestPaused`; `request_id` is the interception id used to resume,
        /// `network_id` the id the Network domain reports for the same request.
        RequestPaused {
            request_id: String,
            network_id: Option<String>,
            url: String,
        },
        /// `Network.responseReceived`
        ResponseReceived {
            request_id: String,
            url: String,
            status: i64,
            headers: Headers,
        },
        /// `Network.responseReceivedExtraInfo`: raw headers as seen on the wire,
        /// including `Set-Cookie`.
        ResponseExtraInfo {
            request_id: String,
            status: i64,
            headers: Headers,
        },
        /// `Page.frameRequestedNavigation`
        NavigationRequested { reason: String, url: String },
    }

    impl BrowserEvent {
        pub fn method(&self) -> &'static str {
            match self {
                Self::RequestInitiated { .. } => "Network.requestWillBeSent",
                Self::RequestPaused { .. } => "Fetch.requestPaused",
                Self::ResponseReceived { .. } => "Network.responseReceived",
                Self::ResponseExtraInfo { .. } => "Network.responseReceivedExtraInfo",
                Self::NavigationRequested { .. } => "Page.frameRequestedNavigation",
            }
        }
    }

    /// Low-volume page signals, broadcast so navigation can wait on them.
    #[derive(Clone, Debug, PartialEq, Eq)]
    pub enum PageSignal {
        /// `frame` is unset for `Page.loadEventFired`, which only fires for the main frame.
        Loaded {
            session: String,
            frame: Option<String>,
        },
        Disconnected,
    }

    #[derive(Deserialize)]
    #[serde(rename_all = "camelCase")]
    struct RequestPayload {
        url: String,
        #[serde(default)]
        url_fragment: Option<String>,
    }

    impl RequestPayload {
        fn full_url(self) -> String {
            match self.url_fragment {
                Some(fragment) => format!("{}{}", self.url, fragment),
                None => self.url,
            }
        }
    }

    #[derive(Deserialize)]
    #[serde(rename_all = "camelCase")]
    struct RequestPausedParams {
        request_id: String,
        request: RequestPayload,
        #[serde(default)]
        network_id: Option<String>,
    }

    #[derive(Deserialize)]
    #[serde(rename_all = "camelCase")]
    struct RequestWillBeSentParams {
        request_id: String,
        request: RequestPayload,
    }

    #[derive(Deserialize)]
    #[serde(rename_all = "camelCase")]
    struct ResponsePayload {
        url: String,
        status: i64,
        #[serde(default)]
        headers: Value,
    }

    #[derive(Deserialize)]
    #[serde(rename_all = "camelCase")]
    struct ResponseReceivedParams {
        request_id: String,
        response: ResponsePayload,
    }

    #[derive(Deserialize)]
    #[serde(rename_all = "camelCase")]
    struct ResponseExtraInfoParams {
        request_id: String,
        status_code: i64,
        #[serde(default)]
        headers: Value,
    }

    #[derive(Deserialize)]
    struct FrameRequestedNavigationParams {
        reason: String,
        url: String,
    }

    #[derive(Deserialize)]
    #[serde(rename_all = "camelCase")]
    struct LifecycleParams {
        #[serde(default)]
        frame_id: Option<String>,
        name: String,
    }

    fn parse<T: DeserializeOwned>(method: &str, params: Value) -> Result<T, AdapterError> {
        serde_json::from_value(params).map_err(|err| {
            AdapterError::new(AdapterErrorKind::Protocol)
                .with_hint(format!("malformed {method} payload: {err}"))
        })
    }

    /// CDP header objects map names to strings; anything else is stringified.
    pub fn headers_from(value: &Value) -> Headers {
        match value {
            Value::Object(map) => map
                .iter()
                .map(|(name, value)| {
                    let value = match value {
                        Value::String(s) => s.clone(),
                        other => other.to_string(),
                    };
                    (name.clone(), value)
                })
                .collect(),
            _ => Headers::new(),
        }
    }

    /// Decode a raw CDP event. Methods the adapter does not track yield `Ok(None)`.
    pub fn decode(method: &str, params: Value) -> Result<Option<BrowserEvent>, AdapterError> {
        let event = match method {
            "Fetch.requestPaused" => {
                let p: RequestPausedParams = parse(method, params)?;
                BrowserEvent::RequestPaused {
                    request_id: p.request_id,
                    network_id: p.network_id,
                    url: p.request.full_url(),
                }
            }
            "Network.requestWillBeSent" => {
                let p: RequestWillBeSentParams = parse(method, params)?;
                BrowserEvent::RequestInitiated {
                    request_id: p.request_id,
                    url: p.request.full_url(),
                }
            }
            "Network.responseReceived" => {
                let p: ResponseReceivedParams = parse(method, params)?;
                BrowserEvent::ResponseReceived {
                    request_id: p.request_id,
                    url: p.response.url,
                    status: p.response.status,
                    headers: headers_from(&p.response.headers),
                }
            }
            "Network.responseReceivedExtraInfo" => {
                let p: ResponseExtraInfoParams = parse(method, params)?;
                BrowserEvent::ResponseExtraInfo {
                    request_id: p.request_id,
                    status: p.status_code,
                    headers: headers_from(&p.headers),
                }
            }
            "Page.frameRequestedNavigation" => {
                let p: FrameRequestedNavigationParams = parse(method, params)?;
                BrowserEvent::NavigationRequested {
                    reason: p.reason,
                    url: p.url,
                }
            }
            _ => return Ok(None),
        };
        Ok(Some(event))
    }

    /// Frame whose `load` a raw CDP event reports; `None` when the event is not a load.
    /// `Page.loadEventFired` carries no frame id and yields `Some(None)`.
    pub fn loaded_frame(method: &str, params: &Value) -> Option<Option<String>> {
        match method {
            "Page.loadEventFired" => Some(None),
            "Page.lifecycleEvent" => serde_json::from_value::<LifecycleParams>(params.clone())
                .ok()
                .filter(|p| p.name == "load")
                .map(|p| p.frame_id),
            _ => None,
        }
    }
}

pub mod config {
    use serde::{Deserialize, Serialize};
    use std::env;

    /// Connection and timing settings for the adapter.
    #[derive(Clone, Debug, Serialize, Deserialize)]
    #[serde(default)]
    pub struct CdpConfig {
        /// DevTools endpoint. Either a full `ws://…/devtools/browser/<id>` URL or a bare
        /// `ws://host:port/` / `http://host:port/` which is resolved via `/json/version`.
        pub websocket_url: Option<String>,
        pub default_deadline_ms: u64,
        pub heartbeat_interval_ms: u64,
        pub discovery_timeout_ms: u64,
        pub signal_buffer: usize,
    }

    impl Default for CdpConfig {
        fn default() -> Self {
            Self {
                websocket_url: resolve_ws_url_default(),
                default_deadline_ms: 30_000,
                heartbeat_interval_ms: 15_000,
                discovery_timeout_ms: 5_000,
                signal_buffer: 64,
            }
        }
    }

    fn resolve_ws_url_default() -> Option<String> {
        match env::var("FLOWPROBE_WS_URL") {
            Ok(value) => {
                let trimmed = value.trim();
                (!trimmed.is_empty()).then(|| trimmed.to_string())
            }
            Err(_) => None,
        }
    }
}

/// Endpoint a DevTools client connects to.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DebuggerEndpoint {
    pub ws_url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub browser: Option<String>,
}

pub mod adapter;
pub mod commands;
pub mod metrics;
pub mod transport;
pub mod util;

pub use adapter::{BrowserSession, CdpAdapter};
pub use commands::Cookie;
pub use config::CdpConfig;
pub use error::{AdapterError, AdapterErrorKind};
pub use events::{BrowserEvent, Headers};
pub use flowprobe_event_bus::{Handler, ListenerId};
