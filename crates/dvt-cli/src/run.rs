use std::time::Duration;

use console::style;
use dvt_cancel::CancellationToken;
use dvt_error::{DvResult, ErrorCode, err};
use dvt_executor::{
    BulkExecutor, ExecutorConfig, ProgressEvent, ProgressReceiver, progress_channel,
};
use dvt_orchestrator::{
    DataArchive, ExportRequest, MigrationOrchestrator, OrchestratorRequest, run_export,
};
use dvt_output::OutputManager;
use dvt_pool::{ConnectionPool, PoolConfig, SelectionStrategy};
use dvt_schema::{SchemaDescriptor, TierPlan};
use dvt_sql::transpile_sql;

use crate::cli::{Cli, Commands, CommonArgs, ExportArgs, ImportArgs, PlanArgs, QueryArgs};
use crate::connections::build_pool;

/// Runs the selected command; the returned code is the process exit code.
pub async fn execute(cli: Cli, cancel: CancellationToken) -> DvResult<i32> {
    match cli.command {
        Commands::Import(args) => run_import(args, cancel).await,
        Commands::Export(args) => run_export_command(args, cancel).await,
        Commands::Query(args) => run_query(args),
        Commands::Plan(args) => run_plan(args),
    }
}

fn pool_config(common: &CommonArgs) -> PoolConfig {
    PoolConfig {
        max_concurrency: common.max_concurrency.max(1),
        strategy: SelectionStrategy::ThrottleAware,
        throttle_tolerance: common.throttle_tolerance.map(Duration::from_secs),
        ..PoolConfig::default()
    }
}

async fn init_pool(
    common: &CommonArgs,
    environment_url: &str,
    cancel: &CancellationToken,
) -> DvResult<ConnectionPool> {
    let pool = build_pool(common.connections.as_deref(), environment_url, pool_config(common))?;
    let report = pool.ensure_initialized(cancel).await;
    eprint!("{report}");
    if !report.is_usable() {
        return err!(
            ErrorCode::ConnectionNotReady,
            "no connection source is ready; cannot reach {environment_url}"
        );
    }
    Ok(pool)
}

async fn run_import(args: ImportArgs, cancel: CancellationToken) -> DvResult<i32> {
    let request = OrchestratorRequest {
        source_env_url: None,
        target_env_url: args.target_url.clone(),
        schema_path: args.schema.clone(),
        data_archive_path: args.data.clone(),
        import_mode: args.mode,
        bypass_plugins: args.bypass_plugins,
        bypass_flows: args.bypass_flows,
        continue_on_error: args.continue_on_error,
        user_mapping_path: args.user_mapping.clone(),
        strip_owner_fields: args.strip_owner_fields,
        skip_missing_columns: args.skip_missing_columns,
        batch_size: args.batch_size,
        parallelism: args.parallelism,
        output_base_path: args.out.clone(),
        retry_pool_exhaustion: true,
    };
    // configuration problems must surface before any I/O
    request.validate()?;
    let schema = SchemaDescriptor::from_path(&args.schema)?;
    let archive = DataArchive::open(&args.data)?;

    let pool = init_pool(&args.common_args, &args.target_url, &cancel).await?;
    let executor = BulkExecutor::new(
        pool,
        ExecutorConfig { configured_parallelism: args.parallelism, ..ExecutorConfig::default() },
    );
    let output = OutputManager::create(&args.out)?;
    eprintln!(
        "Writing {} / {} / {}",
        output.errors_path().display(),
        output.progress_path().display(),
        output.summary_path().display()
    );
    let orchestrator = MigrationOrchestrator::new(executor, output);

    let (sink, receiver) = progress_channel();
    let reporter = tokio::spawn(report_progress(receiver));
    let result = orchestrator.run_import(&request, &schema, &archive, &sink, &cancel).await;
    drop(sink);
    let _ = reporter.await;

    let summary = result?;
    eprintln!(
        "{} imported={} updated={} failed={}",
        if summary.success { style("done").green() } else { style("finished with failures").red() },
        summary.records_imported,
        summary.records_updated,
        summary.records_failed
    );
    Ok(if summary.records_failed == 0 && summary.success { 0 } else { 1 })
}

async fn run_export_command(args: ExportArgs, cancel: CancellationToken) -> DvResult<i32> {
    let pool = init_pool(&args.common_args, &args.source_url, &cancel).await?;
    let request = ExportRequest {
        source_env_url: args.source_url.clone(),
        query: args.query.clone(),
        archive_path: args.out.clone(),
        page_size: args.page_size,
    };
    let outcome = run_export(&pool, &request, &cancel).await?;
    eprintln!(
        "{} {} rows of {} in {} pages -> {}",
        style("exported").green(),
        outcome.rows_exported,
        outcome.entity,
        outcome.pages,
        args.out.display()
    );
    if !outcome.virtual_columns.is_empty() {
        eprintln!(
            "{} display-name columns resolve client-side: {}",
            style("note:").yellow(),
            outcome
                .virtual_columns
                .keys()
                .cloned()
                .collect::<Vec<_>>()
                .join(", ")
        );
    }
    Ok(0)
}

fn run_query(args: QueryArgs) -> DvResult<i32> {
    let output = transpile_sql(&args.sql)?;
    println!("{}", output.xml);
    if args.show_virtual {
        for (name, column) in &output.virtual_columns {
            println!(
                "virtual: {name} -> {} (explicit base: {})",
                column.base_column, column.base_explicitly_queried
            );
        }
        for name in &output.computed_columns {
            println!("computed client-side: {name}");
        }
    }
    Ok(0)
}

fn run_plan(args: PlanArgs) -> DvResult<i32> {
    let schema = SchemaDescriptor::from_path(&args.schema)?;
    let plan = TierPlan::build(&schema)?;
    print!("{plan}");
    Ok(0)
}

/// Prints the progress stream to stderr; the progress log file carries the
/// durable copy.
async fn report_progress(mut receiver: ProgressReceiver) {
    while let Some(events) = receiver.next_batch().await {
        for event in events {
            match event {
                ProgressEvent::PhaseStart(phase) => {
                    eprintln!("{}", style(format!("== {phase} ==")).bold());
                }
                ProgressEvent::PhaseEnd(_) => {}
                ProgressEvent::TierStart { tier, entities } => {
                    eprintln!("tier {tier}: {}", entities.join(", "));
                }
                ProgressEvent::TierEnd { .. } => {}
                ProgressEvent::EntityProgress { entity, processed, total, rps } => {
                    eprintln!("  {entity}: {processed}/{total} ({rps:.0} rows/s)");
                }
                ProgressEvent::Warning(warning) => {
                    eprintln!("{} {}", style("warning:").yellow(), warning.message);
                }
                ProgressEvent::ErrorSample(record) => {
                    eprintln!(
                        "{} {}: {}",
                        style("error:").red(),
                        record.entity,
                        record.message
                    );
                }
                ProgressEvent::Complete { .. } => {}
            }
        }
    }
}

/// Exit-code mapping: configuration and SQL-frontend problems are usage
/// errors (2), everything else is a runtime failure (1).
pub fn exit_code_for(error: &dvt_error::DvError) -> i32 {
    if error.code.is_frontend()
        || matches!(
            error.code,
            ErrorCode::InvalidConfig
                | ErrorCode::InvalidPath
                | ErrorCode::InvalidArgument
                | ErrorCode::MissingArgument
                | ErrorCode::InvalidOptions
                | ErrorCode::SchemaError
        )
    {
        2
    } else {
        1
    }
}
