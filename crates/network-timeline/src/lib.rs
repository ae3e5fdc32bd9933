//! Ordered timeline of logical HTTP exchanges.
//!
//! Entries are opened by request-side events (a paused or initiated request) and later
//! patched in place by response metadata for the same logical request. Every mutation
//! happens under one exclusive lock that is only ever held for in-memory work, so the
//! append order equals the order in which the dispatching task saw the requests.
//!
//! Once the driven navigation has finished the timeline is [`Timeline::freeze`]d and
//! becomes read-only; stragglers (favicon fetches and the like) are ignored after that.

pub mod config;

use std::collections::BTreeMap;
use std::fmt;

use crate::config::{Attribution, TimelineConfig};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, trace};

/// Header name to value. Names are case-sensitive; order is irrelevant.
pub type Headers = BTreeMap<String, String>;

/// Browser event that produced (or patched) a timeline entry.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    RequestInitiated,
    #[default]
    RequestPaused,
    ResponseReceived,
    ResponseExtraInfo,
    NavigationRequested,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RequestInitiated => "request_initiated",
            Self::RequestPaused => "request_paused",
            Self::ResponseReceived => "response_received",
            Self::ResponseExtraInfo => "response_extra_info",
            Self::NavigationRequested => "navigation_requested",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One entry in the timeline.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct ObservedEvent {
    #[serde(default)]
    pub kind: EventKind,
    /// Request URL; navigation-requested entries carry `"<reason>:<url>"`.
    pub url: String,
    /// Zero until response metadata arrives.
    #[serde(default)]
    pub status_code: i64,
    #[serde(default)]
    pub headers: Headers,
    /// Network-domain request id, used for id-keyed attribution.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
}

impl ObservedEvent {
    pub fn request(kind: EventKind, url: impl Into<String>, request_id: Option<String>) -> Self {
        Self {
            kind,
            url: url.into(),
            status_code: 0,
            headers: Headers::new(),
            request_id,
        }
    }

    pub fn navigation(reason: &str, url: &str) -> Self {
        Self::request(
            EventKind::NavigationRequested,
            format!("{reason}:{url}"),
            None,
        )
    }

    pub fn has_response(&self) -> bool {
        self.status_code != 0
    }
}

#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum TimelineError {
    #[error("response metadata arrived before any request was recorded")]
    Empty,
    #[error("no open timeline entry for request {0}")]
    UnknownRequest(String),
    #[error("timeline is frozen")]
    Frozen,
}

#[derive(Debug, Default)]
struct State {
    entries: Vec<ObservedEvent>,
    frozen: bool,
}

impl State {
    fn apply(&mut self, idx: usize, status: i64, headers: Headers) -> usize {
        let entry = &mut self.entries[idx];
        entry.status_code = status;
        entry.headers = headers;
        trace!(target: "network-timeline", idx, status, url = %entry.url, "entry patched");
        idx
    }
}

/// Mutex-guarded ordered list of [`ObservedEvent`]s.
#[derive(Debug, Default)]
pub struct Timeline {
    state: Mutex<State>,
    config: TimelineConfig,
}

impl Timeline {
    pub fn new() -> Self {
        Self::with_config(TimelineConfig::default())
    }

    pub fn with_config(config: TimelineConfig) -> Self {
        Self {
            state: Mutex::new(State::default()),
            config,
        }
    }

    pub fn config(&self) -> &TimelineConfig {
        &self.config
    }

    /// Record a new entry. Ignored once the timeline is frozen.
    pub fn append(&self, entry: ObservedEvent) {
        let mut state = self.state.lock();
        if state.frozen {
            debug!(target: "network-timeline", url = %entry.url, "append after freeze ignored");
            return;
        }
        trace!(
            target: "network-timeline",
            idx = state.entries.len(),
            kind = %entry.kind,
            url = %entry.url,
            "entry appended"
        );
        state.entries.push(entry);
    }

    /// Set status and headers on the most recently appended entry.
    ///
    /// # Panics
    ///
    /// Panics when nothing has been appended yet: metadata must never precede the
    /// request it belongs to.
    pub fn patch_last(&self, status: i64, headers: Headers) {
        match self.try_patch_last(status, headers) {
            Ok(_) | Err(TimelineError::Frozen) => {}
            Err(err) => panic!("patch_last on timeline: {err}"),
        }
    }

    /// Fallible form of [`Timeline::patch_last`]; returns the patched index.
    pub fn try_patch_last(&self, status: i64, headers: Headers) -> Result<usize, TimelineError> {
        let mut state = self.state.lock();
        if state.entries.is_empty() {
            return Err(TimelineError::Empty);
        }
        if state.frozen {
            return Err(TimelineError::Frozen);
        }
        let idx = state.entries.len() - 1;
        Ok(state.apply(idx, status, headers))
    }

    /// Patch the oldest entry for `request_id` that has no response yet.
    ///
    /// Redirect hops share one id and their responses arrive in hop order, so metadata
    /// that shows up after the next hop was paused still lands on its own hop.
    pub fn patch_request(
        &self,
        request_id: &str,
        status: i64,
        headers: Headers,
    ) -> Result<usize, TimelineError> {
        let mut state = self.state.lock();
        if state.frozen {
            return Err(TimelineError::Frozen);
        }
        let idx = state
            .entries
            .iter()
            .position(|entry| {
                !entry.has_response() && entry.request_id.as_deref() == Some(request_id)
            })
            .ok_or_else(|| TimelineError::UnknownRequest(request_id.to_string()))?;
        Ok(state.apply(idx, status, headers))
    }

    /// Attribute response metadata according to the configured [`Attribution`].
    pub fn attribute(
        &self,
        request_id: Option<&str>,
        status: i64,
        headers: Headers,
    ) -> Result<usize, TimelineError> {
        match (self.config.attribution, request_id) {
            (Attribution::RequestId, Some(id)) => self.patch_request(id, status, headers),
            _ => self.try_patch_last(status, headers),
        }
    }

    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().entries.is_empty()
    }

    pub fn is_frozen(&self) -> bool {
        self.state.lock().frozen
    }

    pub fn snapshot(&self) -> Vec<ObservedEvent> {
        self.state.lock().entries.clone()
    }

    /// Make the timeline read-only and return its final contents.
    pub fn freeze(&self) -> Vec<ObservedEvent> {
        let mut state = self.state.lock();
        state.frozen = true;
        debug!(target: "network-timeline", entries = state.entries.len(), "timeline frozen");
        state.entries.clone()
    }
}
