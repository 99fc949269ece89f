//! Temperature extract republishing.

use super::{Task, TaskContext};
use crate::core::{TaskKind, TaskOutput};
use crate::errors::TaskError;
use crate::storage::{ObjectLocation, ObjectPrefix, ObjectStore};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info};

/// Raw temperature extract name.
pub const RAW_TEMPERATURE_FILE: &str = "GlobalLandTemperaturesByCity.csv";

/// Staged temperature artifact name.
pub const STAGED_TEMPERATURE_FILE: &str = "cleanTemperatureData.csv";

/// Copies the raw temperature extract into staging, unchanged.
///
/// Any previous artifact is deleted first; a missing one is fine.
#[derive(Debug, Clone)]
pub struct TemperatureStagingTask {
    store: Arc<dyn ObjectStore>,
    source: ObjectLocation,
    target: ObjectLocation,
}

impl TemperatureStagingTask {
    /// Creates a stager using the standard file names under each prefix.
    #[must_use]
    pub fn new(store: Arc<dyn ObjectStore>, source: &ObjectPrefix, target: &ObjectPrefix) -> Self {
        Self::between(
            store,
            source.object(RAW_TEMPERATURE_FILE),
            target.object(STAGED_TEMPERATURE_FILE),
        )
    }

    /// Creates a stager between two explicit locations.
    #[must_use]
    pub fn between(store: Arc<dyn ObjectStore>, source: ObjectLocation, target: ObjectLocation) -> Self {
        Self {
            store,
            source,
            target,
        }
    }

    /// The staged artifact location.
    #[must_use]
    pub fn artifact(&self) -> &ObjectLocation {
        &self.target
    }
}

#[async_trait]
impl Task for TemperatureStagingTask {
    fn kind(&self) -> TaskKind {
        TaskKind::Stage
    }

    async fn execute(&self, ctx: &TaskContext) -> Result<TaskOutput, TaskError> {
        match self.store.delete(&self.target).await {
            Ok(()) => debug!(key = %self.target, "Previous temperature artifact removed"),
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e.into()),
        }

        self.store.copy(&self.source, &self.target).await?;
        info!(
            node = %ctx.node(),
            source = %self.source,
            key = %self.target,
            "Temperature extract staged"
        );
        Ok(TaskOutput::ok_value(
            "artifact",
            serde_json::json!(self.target.to_string()),
        ))
    }
}
