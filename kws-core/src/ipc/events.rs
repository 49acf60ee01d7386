//! Event payloads broadcast by `KwsEngine`.
//!
//! | Event | Subscription |
//! |-------|--------------|
//! | `ClassificationEvent` | `KwsEngine::subscribe_classifications` |
//! | `StatusEvent` | `KwsEngine::subscribe_status` |

use serde::{Deserialize, Serialize};

use crate::decoder::{Classification, Command};

// ---------------------------------------------------------------------------
// Classification events
// ---------------------------------------------------------------------------

/// One decoded cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClassificationEvent {
    /// Monotonically increasing event sequence number.
    pub seq: u64,
    pub command: Command,
    /// Human-readable label, e.g. `"yes"`.
    pub label: String,
    /// Winning score shifted into `0..=255`.
    pub confidence: u8,
}

impl ClassificationEvent {
    pub fn new(seq: u64, classification: Classification) -> Self {
        Self {
            seq,
            command: classification.command,
            label: classification.command.label().to_owned(),
            confidence: classification.confidence,
        }
    }
}

// ---------------------------------------------------------------------------
// Status events
// ---------------------------------------------------------------------------

/// Emitted when the controller changes state or a cycle fails.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusEvent {
    pub state: PipelineState,
    /// Optional human-readable detail (e.g. error message).
    pub detail: Option<String>,
}

/// Controller lifecycle.
///
/// ```text
/// Uninitialized ─► Ready ⇄ Classifying
///        ▲           │
///        └─ ShutDown ◄┘   (any state may shut down)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PipelineState {
    /// Created; no model bound.
    Uninitialized,
    /// Model bound, waiting for a trigger.
    Ready,
    /// A cycle is running.
    Classifying,
    /// Released. `initialize` may bind a model again.
    ShutDown,
}
