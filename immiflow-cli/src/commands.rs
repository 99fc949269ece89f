//! Subcommand implementations.

use anyhow::{bail, Context, Result};
use chrono::Utc;
use immiflow::config::PipelineConfig;
use immiflow::core::ExecutionPeriod;
use immiflow::etl::{build_pipeline, execution_options, Collaborators};
use immiflow::pipeline::{period_range, BackfillReport, Scheduler, TaskGraph};
use immiflow::tasks::provision::ProvisionTask;
use std::sync::Arc;
use tracing::info;

async fn scheduler(config: &PipelineConfig) -> Result<Scheduler> {
    let deps = Collaborators::from_config(config);
    let graph = build_pipeline(config, &deps).context("failed to build the pipeline graph")?;
    let options = execution_options(config, &deps)
        .await
        .context("failed to open the run ledger")?;
    Ok(Scheduler::new(Arc::new(graph), options))
}

/// Resolves backfill bounds against the configured schedule.
pub fn backfill_periods(
    config: &PipelineConfig,
    from: Option<ExecutionPeriod>,
    to: Option<ExecutionPeriod>,
    today: chrono::NaiveDate,
) -> Result<Vec<ExecutionPeriod>> {
    let scheduled = config.schedule.periods_until(today);
    let from = match from.or_else(|| scheduled.first().copied()) {
        Some(from) => from,
        None => bail!("the schedule has no periods up to {today}"),
    };
    let to = to
        .or_else(|| scheduled.last().copied())
        .unwrap_or_else(|| ExecutionPeriod::from_date(today));
    if from > to {
        bail!("backfill range is empty: {from} is after {to}");
    }
    Ok(period_range(from, to))
}

/// Prints one line per period and returns whether every period succeeded.
pub fn print_report(report: &BackfillReport) -> bool {
    for run in &report.runs {
        let status = if run.success { "ok" } else { "FAILED" };
        println!(
            "{}  {status:<6}  {:>4} nodes  {:.0} ms",
            run.period,
            run.outcomes.len(),
            run.duration_ms
        );
        for node in run.failed_nodes() {
            let error = run
                .outcomes
                .get(node)
                .and_then(|o| o.output.error.clone())
                .unwrap_or_default();
            println!("    failed   {node}: {error}");
        }
        for node in run.blocked_nodes() {
            println!("    blocked  {node}");
        }
    }
    for (period, error) in &report.aborted {
        println!("{period}  ABORTED  {error}");
    }
    report.success()
}

pub async fn run_periods(config: &PipelineConfig, periods: &[ExecutionPeriod]) -> Result<bool> {
    let scheduler = scheduler(config).await?;
    info!(periods = periods.len(), "Starting pipeline");
    let report = scheduler.run(periods).await;
    Ok(print_report(&report))
}

pub async fn run_backfill(
    config: &PipelineConfig,
    from: Option<ExecutionPeriod>,
    to: Option<ExecutionPeriod>,
) -> Result<bool> {
    let periods = backfill_periods(config, from, to, Utc::now().date_naive())?;
    run_periods(config, &periods).await
}

pub async fn run_provision(config: &PipelineConfig) -> Result<()> {
    let deps = Collaborators::from_config(config);
    ProvisionTask::catalog(deps.warehouse)
        .provision()
        .await
        .context("provisioning failed")?;
    println!("warehouse provisioned at {}", config.warehouse.root.display());
    Ok(())
}

pub fn render_graph(graph: &TaskGraph) -> String {
    let mut out = format!("{} ({} nodes)\n\norder:\n", graph.name(), graph.node_count());
    for (i, node) in graph.execution_order().iter().enumerate() {
        out.push_str(&format!("  {:>2}. {node}\n", i + 1));
    }
    out.push_str("\nedges:\n");
    for (from, to) in graph.edges() {
        out.push_str(&format!("  {from} -> {to}\n"));
    }
    out
}

pub fn run_graph(config: &PipelineConfig) -> Result<()> {
    let deps = Collaborators::from_config(config);
    let graph = build_pipeline(config, &deps).context("failed to build the pipeline graph")?;
    print!("{}", render_graph(&graph));
    Ok(())
}
