//! The immigration and temperature ETL graph.
//!
//! ```text
//! create_schemas_and_tables
//!   ├─ stage_immigration_dimensions ─ copy_immigration_dimensions ───┐
//!   ├─ stage_monthly_immigration_data ─ copy_monthly_immigration_data ┤
//!   └─ stage_temperatures_data ─ copy_temperatures_data ──────────────┤
//!                                  └─ run_temperatures_summary ───────┤
//!                                                 run_data_quality_checks
//!                                                   └─ analyze_* (4)
//! ```

use crate::catalog;
use crate::config::PipelineConfig;
use crate::credentials::{CredentialResolver, EnvCredentialResolver};
use crate::errors::PipelineError;
use crate::events::{EventSink, LoggingEventSink};
use crate::pipeline::{
    ExecutionOptions, FileRunLedger, GraphBuilder, NodeSpec, RetryConfig, TaskGraph,
};
use crate::reference::ReferenceTables;
use crate::storage::{LocalObjectStore, ObjectStore};
use crate::tasks::aggregate::AggregateTask;
use crate::tasks::analysis::{AnalysisTask, AnalysisTemplate};
use crate::tasks::immigration::ImmigrationStagingTask;
use crate::tasks::loader::{ArtifactSource, DimensionLoadTask, FactLoadTask, FactWritePolicy};
use crate::tasks::provision::ProvisionTask;
use crate::tasks::quality::QualityGateTask;
use crate::tasks::reference::ReferenceStagingTask;
use crate::tasks::temperature::{TemperatureStagingTask, STAGED_TEMPERATURE_FILE};
use crate::tasks::Task;
use crate::warehouse::{SqliteWarehouse, Warehouse};
use std::fmt;
use std::sync::Arc;
use tracing::info;

/// Graph name.
pub const PIPELINE_NAME: &str = "immigration_etl";

/// Stable node identifiers.
pub mod nodes {
    #![allow(missing_docs)]

    pub const CREATE_SCHEMAS_AND_TABLES: &str = "create_schemas_and_tables";
    pub const STAGE_IMMIGRATION_DIMENSIONS: &str = "stage_immigration_dimensions";
    pub const STAGE_MONTHLY_IMMIGRATION_DATA: &str = "stage_monthly_immigration_data";
    pub const STAGE_TEMPERATURES_DATA: &str = "stage_temperatures_data";
    pub const COPY_IMMIGRATION_DIMENSIONS: &str = "copy_immigration_dimensions";
    pub const COPY_MONTHLY_IMMIGRATION_DATA: &str = "copy_monthly_immigration_data";
    pub const COPY_TEMPERATURES_DATA: &str = "copy_temperatures_data";
    pub const RUN_TEMPERATURES_SUMMARY: &str = "run_temperatures_summary";
    pub const RUN_DATA_QUALITY_CHECKS: &str = "run_data_quality_checks";

    /// Analysis nodes are `analyze_{template name}`.
    #[must_use]
    pub fn analysis(name: &str) -> String {
        format!("analyze_{name}")
    }
}

/// The external collaborators every task talks to.
#[derive(Clone)]
pub struct Collaborators {
    /// Raw and staged artifacts.
    pub store: Arc<dyn ObjectStore>,
    /// Target warehouse.
    pub warehouse: Arc<dyn Warehouse>,
    /// Resolves the loaders' credential.
    pub resolver: Arc<dyn CredentialResolver>,
    /// Receives graph and quality events.
    pub sink: Arc<dyn EventSink>,
}

impl fmt::Debug for Collaborators {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Collaborators")
            .field("store", &self.store)
            .field("warehouse", &self.warehouse)
            .field("resolver", &self.resolver)
            .finish_non_exhaustive()
    }
}

impl Collaborators {
    /// Creates collaborators from explicit parts.
    #[must_use]
    pub fn new(
        store: Arc<dyn ObjectStore>,
        warehouse: Arc<dyn Warehouse>,
        resolver: Arc<dyn CredentialResolver>,
        sink: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            store,
            warehouse,
            resolver,
            sink,
        }
    }

    /// Filesystem store, SQLite warehouse, environment credentials and a
    /// logging sink, all located by the configuration.
    #[must_use]
    pub fn from_config(config: &PipelineConfig) -> Self {
        let store: Arc<dyn ObjectStore> = Arc::new(LocalObjectStore::new(&config.storage.root));
        let warehouse = Arc::new(SqliteWarehouse::new(&config.warehouse.root, store.clone()));
        Self::new(
            store,
            warehouse,
            Arc::new(EnvCredentialResolver::new(&config.credentials.env_prefix)),
            Arc::new(LoggingEventSink::default()),
        )
    }
}

fn node(name: &str, task: impl Task + 'static, retry: &RetryConfig) -> NodeSpec {
    NodeSpec::new(name, Arc::new(task)).with_retry(retry.clone())
}

/// Builds the ETL graph.
///
/// # Errors
///
/// Returns an error if the reference tables cannot be loaded or the
/// graph fails validation.
pub fn build_pipeline(
    config: &PipelineConfig,
    deps: &Collaborators,
) -> Result<TaskGraph, PipelineError> {
    let reference = config.reference_tables()?;
    build_pipeline_with_reference(config, deps, reference)
}

/// Builds the ETL graph with explicit reference tables.
///
/// # Errors
///
/// Returns an error if the graph fails validation.
pub fn build_pipeline_with_reference(
    config: &PipelineConfig,
    deps: &Collaborators,
    reference: ReferenceTables,
) -> Result<TaskGraph, PipelineError> {
    use nodes::*;

    let retry = &config.retry;
    let credential = config.credentials.role.clone();
    let dimensions: Vec<String> = reference.names().into_iter().map(String::from).collect();
    let mut builder = GraphBuilder::new(PIPELINE_NAME);

    builder.add_node(
        node(
            CREATE_SCHEMAS_AND_TABLES,
            ProvisionTask::catalog(deps.warehouse.clone()),
            retry,
        )
        .exclusive(),
    )?;

    builder
        .add_node(node(
            STAGE_IMMIGRATION_DIMENSIONS,
            ReferenceStagingTask::new(deps.store.clone(), config.staging_dimensions(), reference),
            retry,
        ))?
        .add_node(node(
            STAGE_MONTHLY_IMMIGRATION_DATA,
            ImmigrationStagingTask::new(
                deps.store.clone(),
                config.raw_immigration(),
                config.staging_immigration(),
            ),
            retry,
        ))?
        .add_node(node(
            STAGE_TEMPERATURES_DATA,
            TemperatureStagingTask::new(
                deps.store.clone(),
                &config.raw_temperatures(),
                &config.staging_temperatures(),
            ),
            retry,
        ))?;

    builder
        .add_node(node(
            COPY_IMMIGRATION_DIMENSIONS,
            DimensionLoadTask::new(
                deps.warehouse.clone(),
                deps.resolver.clone(),
                credential.clone(),
                config.staging_dimensions(),
                catalog::DIMENSION_SCHEMA,
                dimensions,
            ),
            retry,
        ))?
        .add_node(node(
            COPY_MONTHLY_IMMIGRATION_DATA,
            FactLoadTask::new(
                deps.warehouse.clone(),
                deps.resolver.clone(),
                credential.clone(),
                catalog::US_ENTRIES,
                ArtifactSource::MonthlyExtract(config.staging_immigration()),
            )
            .with_policy(FactWritePolicy::replace_arrival_period()),
            retry,
        ))?
        .add_node(node(
            COPY_TEMPERATURES_DATA,
            FactLoadTask::new(
                deps.warehouse.clone(),
                deps.resolver.clone(),
                credential,
                catalog::TEMPERATURE_FACT,
                ArtifactSource::Fixed(
                    config.staging_temperatures().object(STAGED_TEMPERATURE_FILE),
                ),
            )
            .with_policy(FactWritePolicy::Truncate),
            retry,
        ))?
        .add_node(node(
            RUN_TEMPERATURES_SUMMARY,
            AggregateTask::temperature_summary(deps.warehouse.clone()),
            retry,
        ))?
        .add_node(node(
            RUN_DATA_QUALITY_CHECKS,
            QualityGateTask::new(
                deps.warehouse.clone(),
                config.quality.tables.clone(),
                config.quality.checks.clone(),
            )
            .with_policy(config.quality.policy)
            .with_sink(deps.sink.clone()),
            retry,
        ))?;

    builder
        .add_edge(CREATE_SCHEMAS_AND_TABLES, STAGE_IMMIGRATION_DIMENSIONS)?
        .add_edge(CREATE_SCHEMAS_AND_TABLES, STAGE_MONTHLY_IMMIGRATION_DATA)?
        .add_edge(CREATE_SCHEMAS_AND_TABLES, STAGE_TEMPERATURES_DATA)?
        .add_edge(STAGE_IMMIGRATION_DIMENSIONS, COPY_IMMIGRATION_DIMENSIONS)?
        .add_edge(STAGE_MONTHLY_IMMIGRATION_DATA, COPY_MONTHLY_IMMIGRATION_DATA)?
        .add_edge(STAGE_TEMPERATURES_DATA, COPY_TEMPERATURES_DATA)?
        .add_edge(COPY_TEMPERATURES_DATA, RUN_TEMPERATURES_SUMMARY)?
        .add_edges_into(
            &[
                COPY_IMMIGRATION_DIMENSIONS,
                COPY_MONTHLY_IMMIGRATION_DATA,
                COPY_TEMPERATURES_DATA,
                RUN_TEMPERATURES_SUMMARY,
            ],
            RUN_DATA_QUALITY_CHECKS,
        )?;

    for template in AnalysisTemplate::builtin() {
        let name = nodes::analysis(&template.name);
        builder.add_node(node(
            &name,
            AnalysisTask::new(deps.warehouse.clone(), template),
            retry,
        ))?;
        builder.add_edge(RUN_DATA_QUALITY_CHECKS, &name)?;
    }

    let graph = builder.build()?;
    info!(
        graph = %graph.name(),
        nodes = graph.node_count(),
        "Pipeline graph built"
    );
    Ok(graph)
}

/// Execution options for the configuration: concurrency, resume, the
/// collaborators' sink and the file ledger when one is configured.
///
/// # Errors
///
/// Returns an error if the ledger file exists but cannot be read.
pub async fn execution_options(
    config: &PipelineConfig,
    deps: &Collaborators,
) -> Result<ExecutionOptions, PipelineError> {
    let mut options = ExecutionOptions::new()
        .with_max_parallel(config.execution.max_parallel)
        .with_resume(config.execution.resume)
        .with_sink(deps.sink.clone());
    if let Some(path) = &config.execution.ledger_path {
        options = options.with_ledger(Arc::new(FileRunLedger::open(path).await?));
    }
    Ok(options)
}
