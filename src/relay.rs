//! Resumes intercepted requests so the browser can make progress.
//!
//! Each paused request gets its own task; the dispatching task only spawns and
//! returns, so event delivery never waits on a continuation round trip.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use cdp_adapter::BrowserSession;
use dashmap::DashSet;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::errors::{ErrorSink, FlowError};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContinuationStats {
    pub issued: u64,
    pub failed: u64,
    pub duplicates: u64,
}

#[derive(Debug, Default)]
struct Counters {
    issued: AtomicU64,
    failed: AtomicU64,
    duplicates: AtomicU64,
    in_flight: AtomicUsize,
}

pub struct ContinuationRelay {
    session: Arc<dyn BrowserSession>,
    token: CancellationToken,
    errors: Arc<ErrorSink>,
    seen: DashSet<String>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    counters: Arc<Counters>,
}

impl ContinuationRelay {
    pub fn new(
        session: Arc<dyn BrowserSession>,
        token: CancellationToken,
        errors: Arc<ErrorSink>,
    ) -> Self {
        Self {
            session,
            token,
            errors,
            seen: DashSet::new(),
            tasks: Mutex::new(Vec::new()),
            counters: Arc::new(Counters::default()),
        }
    }

    /// Schedule exactly one continuation for `request_id`. Returns `false` for a
    /// duplicate delivery. Must be called from within a tokio runtime.
    pub fn on_paused(&self, request_id: &str, url: &str) -> bool {
        if !self.seen.insert(request_id.to_string()) {
            self.counters.duplicates.fetch_add(1, Ordering::Relaxed);
            debug!(target: "flowprobe::relay", %request_id, %url, "duplicate pause ignored");
            return false;
        }

        let session = Arc::clone(&self.session);
        let token = self.token.child_token();
        let errors = Arc::clone(&self.errors);
        let counters = Arc::clone(&self.counters);
        let request_id = request_id.to_string();
        let url = url.to_string();
        counters.in_flight.fetch_add(1, Ordering::SeqCst);

        let handle = tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {
                    trace!(target: "flowprobe::relay", %request_id, "continuation cancelled");
                }
                result = session.continue_request(&request_id) => match result {
                    Ok(()) => {
                        counters.issued.fetch_add(1, Ordering::Relaxed);
                        trace!(target: "flowprobe::relay", %request_id, %url, "request continued");
                    }
                    Err(err) if err.is_cancelled() || token.is_cancelled() => {
                        trace!(target: "flowprobe::relay", %request_id, "continuation cancelled");
                    }
                    Err(err) => {
                        counters.failed.fetch_add(1, Ordering::Relaxed);
                        warn!(target: "flowprobe::relay", %request_id, %url, %err, "continuation failed");
                        errors.record(FlowError::Protocol(format!(
                            "continuing {url} ({request_id}): {err}"
                        )));
                    }
                },
            }
            counters.in_flight.fetch_sub(1, Ordering::SeqCst);
        });

        let mut tasks = self.tasks.lock();
        tasks.retain(|task| !task.is_finished());
        tasks.push(handle);
        true
    }

    /// Wait for every continuation scheduled so far.
    pub async fn drain(&self) {
        let handles: Vec<_> = std::mem::take(&mut *self.tasks.lock());
        for handle in handles {
            if let Err(err) = handle.await {
                warn!(target: "flowprobe::relay", %err, "continuation task aborted");
            }
        }
    }

    pub fn in_flight(&self) -> usize {
        self.counters.in_flight.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> ContinuationStats {
        ContinuationStats {
            issued: self.counters.issued.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
            duplicates: self.counters.duplicates.load(Ordering::Relaxed),
        }
    }
}
