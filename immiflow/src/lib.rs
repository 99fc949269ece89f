//! # Immiflow
//!
//! A period-scoped ETL pipeline for immigration and temperature reporting.
//!
//! Every run is parameterized by an [`ExecutionPeriod`](core::ExecutionPeriod)
//! (year and month) and executes a directed graph of idempotent tasks:
//!
//! - **Staging**: reference dimensions, the period's immigration extract
//!   (cleaned and reshaped) and the temperature extract are published to
//!   object storage
//! - **Loading**: staged artifacts are bulk-loaded into warehouse fact and
//!   dimension tables
//! - **Quality gate**: declarative checks run against every loaded table
//! - **Analyses**: period-versioned output tables such as
//!   `outputs.jan2016_length_of_stay`
//!
//! The graph executor dispatches ready nodes concurrently, retries
//! retryable failures, blocks descendants of failed nodes and records
//! outcomes in a run ledger so periods can be resumed or backfilled.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use immiflow::prelude::*;
//!
//! let config = PipelineConfig::load(None, &ConfigOverrides::default())?;
//! let deps = Collaborators::from_config(&config);
//! let graph = build_pipeline(&config, &deps)?;
//!
//! let options = execution_options(&config, &deps).await?;
//! let report = graph.execute("2016-01".parse()?, &options).await?;
//! assert!(report.success);
//! ```

#![forbid(unsafe_code)]
#![warn(
    clippy::all,
    clippy::pedantic,
    missing_docs,
    rust_2018_idioms
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc
)]

pub mod catalog;
pub mod config;
pub mod core;
pub mod credentials;
pub mod errors;
pub mod etl;
pub mod events;
pub mod pipeline;
pub mod reference;
pub mod storage;
pub mod tasks;
pub mod warehouse;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::config::{ConfigOverrides, PipelineConfig};
    pub use crate::core::{ExecutionPeriod, TaskKind, TaskOutput, TaskStatus};
    pub use crate::credentials::{
        AccessToken, CredentialRef, CredentialResolver, EnvCredentialResolver,
        StaticCredentialResolver,
    };
    pub use crate::errors::{
        ContractErrorInfo, CycleDetectedError, PipelineError, PipelineValidationError,
        StagingError, StoreError, TaskError, TemplateError, WarehouseError,
    };
    pub use crate::etl::{build_pipeline, execution_options, Collaborators};
    pub use crate::events::{
        CollectingEventSink, EventSink, LoggingEventSink, NoOpEventSink, PipelineEvent,
    };
    pub use crate::pipeline::{
        period_range, BackfillReport, ExecutionOptions, FileRunLedger, GraphBuilder,
        GraphRunReport, InMemoryRunLedger, NodeSpec, RetryConfig, RunLedger, Schedule,
        Scheduler, TaskGraph,
    };
    pub use crate::reference::{ReferenceTable, ReferenceTables};
    pub use crate::storage::{
        InMemoryObjectStore, LocalObjectStore, ObjectLocation, ObjectPrefix, ObjectStore,
    };
    pub use crate::tasks::{Task, TaskContext};
    pub use crate::warehouse::{SqlValue, SqliteWarehouse, Warehouse};
}
