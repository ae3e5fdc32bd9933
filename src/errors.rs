//! Error taxonomy of a flow run.

use cdp_adapter::{AdapterError, AdapterErrorKind};
use parking_lot::Mutex;
use thiserror::Error;
use tracing::warn;

use crate::expect::Mismatch;

#[derive(Clone, Debug, Error)]
pub enum FlowError {
    /// Browser unreachable, interception could not be enabled, cookie commands failed.
    #[error("setup failed: {0}")]
    Setup(String),
    #[error("precondition failed: {0}")]
    Precondition(String),
    /// A paused request could not be resumed.
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("postcondition failed: {0}")]
    Postcondition(String),
    #[error(transparent)]
    Mismatch(#[from] Box<Mismatch>),
    #[error("timed out: {0}")]
    Timeout(String),
    #[error("run cancelled")]
    Cancelled,
    /// Response metadata arrived with no request to attribute it to.
    #[error("event ordering violated: {0}")]
    Ordering(String),
    #[error("configuration error: {0}")]
    Config(String),
}

impl FlowError {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Setup(_) => "setup",
            Self::Precondition(_) => "precondition",
            Self::Protocol(_) => "protocol",
            Self::Postcondition(_) => "postcondition",
            Self::Mismatch(_) => "mismatch",
            Self::Timeout(_) => "timeout",
            Self::Cancelled => "cancelled",
            Self::Ordering(_) => "ordering",
            Self::Config(_) => "config",
        }
    }

    /// Classify an adapter failure raised while doing `what`.
    pub fn from_adapter(what: &str, err: AdapterError) -> Self {
        let message = format!("{what}: {err}");
        match err.kind {
            AdapterErrorKind::NavTimeout => Self::Timeout(message),
            AdapterErrorKind::Cancelled => Self::Cancelled,
            AdapterErrorKind::Protocol => Self::Protocol(message),
            AdapterErrorKind::CdpIo | AdapterErrorKind::Internal => Self::Setup(message),
        }
    }
}

impl From<Mismatch> for FlowError {
    fn from(mismatch: Mismatch) -> Self {
        Self::Mismatch(Box::new(mismatch))
    }
}

/// Non-fatal errors collected while the run is in progress.
#[derive(Debug, Default)]
pub struct ErrorSink {
    errors: Mutex<Vec<FlowError>>,
}

impl ErrorSink {
    pub fn record(&self, err: FlowError) {
        warn!(target: "flowprobe::errors", kind = err.kind(), %err, "error recorded");
        self.errors.lock().push(err);
    }

    pub fn is_empty(&self) -> bool {
        self.errors.lock().is_empty()
    }

    pub fn snapshot(&self) -> Vec<FlowError> {
        self.errors.lock().clone()
    }

    /// First recorded error of the given kind.
    pub fn first_of(&self, kind: &str) -> Option<FlowError> {
        self.errors
            .lock()
            .iter()
            .find(|err| err.kind() == kind)
            .cloned()
    }
}
