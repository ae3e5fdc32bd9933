//! Turns the browser event stream into timeline mutations.

use std::collections::VecDeque;
use std::sync::Arc;

use cdp_adapter::{BrowserEvent, Handler};
use network_timeline::{EventKind, Headers, ObservedEvent, Timeline, TimelineError};
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::errors::{ErrorSink, FlowError};
use crate::relay::ContinuationRelay;

/// Bounded record of the raw events seen during a run, printed when it fails.
#[derive(Debug)]
pub struct EventLog {
    entries: Mutex<VecDeque<String>>,
    capacity: usize,
}

impl EventLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
            capacity,
        }
    }

    pub fn push(&self, line: String) {
        if self.capacity == 0 {
            return;
        }
        let mut entries = self.entries.lock();
        if entries.len() == self.capacity {
            entries.pop_front();
        }
        entries.push_back(line);
    }

    pub fn lines(&self) -> Vec<String> {
        self.entries.lock().iter().cloned().collect()
    }
}

/// Timeline-relevant view of a browser event.
struct Observation<'a> {
    kind: EventKind,
    url: Option<&'a str>,
    /// Id used to attribute response metadata; the network id for paused requests.
    key: Option<&'a str>,
    response: Option<(i64, &'a Headers)>,
}

fn observe(event: &BrowserEvent) -> Observation<'_> {
    match event {
        BrowserEvent::RequestInitiated { request_id, url } => Observation {
            kind: EventKind::RequestInitiated,
            url: Some(url.as_str()),
            key: Some(request_id.as_str()),
            response: None,
        },
        BrowserEvent::RequestPaused {
            request_id,
            network_id,
            url,
        } => Observation {
            kind: EventKind::RequestPaused,
            url: Some(url.as_str()),
            key: Some(network_id.as_deref().unwrap_or(request_id.as_str())),
            response: None,
        },
        BrowserEvent::ResponseReceived {
            request_id,
            url,
            status,
            headers,
        } => Observation {
            kind: EventKind::ResponseReceived,
            url: Some(url.as_str()),
            key: Some(request_id.as_str()),
            response: Some((*status, headers)),
        },
        BrowserEvent::ResponseExtraInfo {
            request_id,
            status,
            headers,
        } => Observation {
            kind: EventKind::ResponseExtraInfo,
            url: None,
            key: Some(request_id.as_str()),
            response: Some((*status, headers)),
        },
        BrowserEvent::NavigationRequested { .. } => Observation {
            kind: EventKind::NavigationRequested,
            url: None,
            key: None,
            response: None,
        },
    }
}

/// The single handler registered on the session for a run.
pub struct Correlator {
    timeline: Arc<Timeline>,
    relay: Arc<ContinuationRelay>,
    errors: Arc<ErrorSink>,
    log: Option<Arc<EventLog>>,
}

impl Correlator {
    pub fn new(
        timeline: Arc<Timeline>,
        relay: Arc<ContinuationRelay>,
        errors: Arc<ErrorSink>,
    ) -> Self {
        Self {
            timeline,
            relay,
            errors,
            log: None,
        }
    }

    pub fn with_log(mut self, log: Arc<EventLog>) -> Self {
        self.log = Some(log);
        self
    }

    pub fn into_handler(self: Arc<Self>) -> Handler<BrowserEvent> {
        Arc::new(move |event: &BrowserEvent| self.handle(event))
    }

    /// Apply one event. Runs on the dispatching task and never awaits.
    pub fn handle(&self, event: &BrowserEvent) {
        if let Some(log) = &self.log {
            let payload = serde_json::to_string(event).unwrap_or_default();
            log.push(format!("{} {payload}", event.method()));
        }

        if let BrowserEvent::RequestPaused {
            request_id, url, ..
        } = event
        {
            if !self.relay.on_paused(request_id, url) {
                return;
            }
        }

        let observed = observe(event);
        let config = self.timeline.config();

        if config.appends(observed.kind) {
            let mut entry = match event {
                BrowserEvent::NavigationRequested { reason, url } => {
                    ObservedEvent::navigation(reason, url)
                }
                _ => ObservedEvent::request(
                    observed.kind,
                    observed.url.unwrap_or_default(),
                    observed.key.map(str::to_string),
                ),
            };
            if let Some((status, headers)) = observed.response {
                entry.status_code = status;
                entry.headers = headers.clone();
            }
            self.timeline.append(entry);
        } else if config.patches(observed.kind) {
            if let Some((status, headers)) = observed.response {
                self.attribute(observed.key, status, headers.clone());
            }
        }
    }

    fn attribute(&self, key: Option<&str>, status: i64, headers: Headers) {
        match self.timeline.attribute(key, status, headers) {
            Ok(idx) => {
                debug!(target: "flowprobe::correlator", idx, status, "response attributed");
            }
            Err(TimelineError::Empty) => {
                self.errors.record(FlowError::Ordering(format!(
                    "status {status} for request {} arrived before any request was recorded",
                    key.unwrap_or("<none>")
                )));
            }
            Err(TimelineError::UnknownRequest(id)) => {
                warn!(
                    target: "flowprobe::correlator",
                    request_id = %id,
                    status,
                    "response for a request that was never recorded"
                );
            }
            Err(TimelineError::Frozen) => {
                debug!(target: "flowprobe::correlator", status, "late response ignored");
            }
        }
    }
}
