use std::path::PathBuf;
use std::sync::LazyLock;

use clap::{Parser, Subcommand};
use console::Style;
use dvt_api::BypassPlugins;
use dvt_orchestrator::ImportMode;

static BOLD: LazyLock<Style> = LazyLock::new(|| Style::new().bold());

static ABOUT: LazyLock<String> = LazyLock::new(|| {
    format!(
        "dvt {}: cross-environment data migration toolkit for Dataverse",
        env!("CARGO_PKG_VERSION")
    )
});
static AFTER_HELP: LazyLock<String> = LazyLock::new(|| {
    format!(
        "{}",
        BOLD.apply_to("Use `dvt <COMMAND> --help` to learn more about the options for each command.")
    )
});

// ----------------------------------------------------------------------------------------------
// Cli and its subcommands

#[derive(Parser, Debug, Clone)]
#[command(
    author,
    name = "dvt",
    version = env!("CARGO_PKG_VERSION"),
    about = &**ABOUT,
    after_help = &**AFTER_HELP
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Import a data archive into a target environment
    Import(ImportArgs),

    /// Export query results from a source environment into a data archive
    Export(ExportArgs),

    /// Transpile a SQL query and print the resulting query XML
    Query(QueryArgs),

    /// Print the dependency tier plan for a schema
    Plan(PlanArgs),
}

#[derive(Parser, Debug, Default, Clone)]
pub struct CommonArgs {
    /// Connections file listing the credential identities of the pool
    #[arg(long, env = "DVT_CONNECTIONS")]
    pub connections: Option<PathBuf>,

    /// Total in-flight request budget across all connections
    #[arg(long, default_value_t = 8)]
    pub max_concurrency: usize,

    /// Give up instead of honoring Retry-After hints longer than this many seconds
    #[arg(long)]
    pub throttle_tolerance: Option<u64>,
}

// ----------------------------------------------------------------------------------------------
// Command Args

#[derive(Parser, Debug, Clone)]
pub struct ImportArgs {
    /// Target environment url
    #[arg(long)]
    pub target_url: String,

    /// Schema descriptor file (entities, reference fields, relationships)
    #[arg(long)]
    pub schema: PathBuf,

    /// Data archive directory to import
    #[arg(long)]
    pub data: PathBuf,

    /// How rows are written: create, update or upsert
    #[arg(long, default_value = "create")]
    pub mode: ImportMode,

    /// Plugin pipelines to bypass: none, sync, async or all
    #[arg(long, default_value = "none")]
    pub bypass_plugins: BypassPlugins,

    /// Suppress flow triggers on imported rows
    #[arg(long)]
    pub bypass_flows: bool,

    /// Keep importing past row-level failures
    #[arg(long)]
    pub continue_on_error: bool,

    /// JSON map of source user ids to target user ids
    #[arg(long)]
    pub user_mapping: Option<PathBuf>,

    /// Drop owner fields instead of importing them
    #[arg(long)]
    pub strip_owner_fields: bool,

    /// Drop row attributes the target schema does not know
    #[arg(long)]
    pub skip_missing_columns: bool,

    #[arg(long, default_value_t = 1000)]
    pub batch_size: usize,

    /// Entities imported concurrently within one tier
    #[arg(long, default_value_t = 4)]
    pub parallelism: usize,

    /// Base path for the errors/progress/summary output files
    #[arg(long)]
    pub out: PathBuf,

    // Flattened Common args
    #[clap(flatten)]
    pub common_args: CommonArgs,
}

#[derive(Parser, Debug, Clone)]
pub struct ExportArgs {
    /// Source environment url
    #[arg(long)]
    pub source_url: String,

    /// SQL query, or raw query XML when it starts with '<'
    #[arg(long)]
    pub query: String,

    /// Directory the data archive is written into
    #[arg(long)]
    pub out: PathBuf,

    #[arg(long, default_value_t = dvt_orchestrator::DEFAULT_PAGE_SIZE)]
    pub page_size: u32,

    // Flattened Common args
    #[clap(flatten)]
    pub common_args: CommonArgs,
}

#[derive(Parser, Debug, Clone)]
pub struct QueryArgs {
    /// SQL query to transpile
    #[arg(long)]
    pub sql: String,

    /// Also print the virtual-column map
    #[arg(long)]
    pub show_virtual: bool,
}

#[derive(Parser, Debug, Clone)]
pub struct PlanArgs {
    /// Schema descriptor file
    #[arg(long)]
    pub schema: PathBuf,
}
