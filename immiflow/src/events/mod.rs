//! Event emission for pipeline observability.
//!
//! The executor reports node and graph lifecycle transitions as
//! [`PipelineEvent`]s; sinks decide what to do with them.

mod sink;

pub use sink::{CollectingEventSink, EventSink, LoggingEventSink, NoOpEventSink};

use crate::core::ExecutionPeriod;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A lifecycle event emitted during a graph run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineEvent {
    /// Dotted event type, e.g. `node.started`.
    pub event_type: String,
    /// The period the run is processing.
    pub period: ExecutionPeriod,
    /// The node the event concerns, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node: Option<String>,
    /// Free-form payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    /// When the event was emitted.
    pub timestamp: DateTime<Utc>,
}

impl PipelineEvent {
    /// Creates a graph-level event.
    #[must_use]
    pub fn graph(event_type: impl Into<String>, period: ExecutionPeriod) -> Self {
        Self {
            event_type: event_type.into(),
            period,
            node: None,
            data: None,
            timestamp: Utc::now(),
        }
    }

    /// Creates a node-level event.
    #[must_use]
    pub fn node(
        event_type: impl Into<String>,
        period: ExecutionPeriod,
        node: impl Into<String>,
    ) -> Self {
        Self {
            node: Some(node.into()),
            ..Self::graph(event_type, period)
        }
    }

    /// Attaches a payload.
    #[must_use]
    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = Some(data);
        self
    }
}
