//! Configuration types for the timeline assembler.

use serde::{Deserialize, Serialize};

use crate::EventKind;

/// How response metadata is attributed to an already recorded entry.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Attribution {
    /// Patch whatever entry was appended last.
    LastAppended,
    /// Patch the oldest unpatched entry carrying the same network request id.
    /// Metadata without an id falls back to [`Attribution::LastAppended`].
    RequestId,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct TimelineConfig {
    /// Event kinds that open a new timeline entry.
    pub append_on: Vec<EventKind>,
    /// Event kinds whose status and headers patch an existing entry.
    pub patch_on: Vec<EventKind>,
    pub attribution: Attribution,
}

impl TimelineConfig {
    pub fn appends(&self, kind: EventKind) -> bool {
        self.append_on.contains(&kind)
    }

    pub fn patches(&self, kind: EventKind) -> bool {
        self.patch_on.contains(&kind)
    }
}

impl Default for TimelineConfig {
    fn default() -> Self {
        Self {
            append_on: vec![EventKind::RequestPaused],
            patch_on: vec![EventKind::ResponseExtraInfo],
            attribution: Attribution::RequestId,
        }
    }
}
