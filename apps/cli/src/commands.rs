//! CLI command definitions, routing, and tracing setup.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use color_eyre::eyre::{Result, eyre};
use indicatif::{ProgressBar, ProgressStyle};
use tracing::info;

use amlflow_core::{
    AmlService, BulkFormat, ListQuery, LocalEngine, PipelineObserver, RunReport, SilentObserver, Stage,
    StageOutcome, StageStatus, SubmitOptions, Submission,
};
use amlflow_factstore::{FileContent, NodeKind, TreeNode};
use amlflow_shared::{
    AppConfig, EntityKind, RiskAssessment, TransactionId, TransactionState, init_config, load_config,
    validate_api_key,
};
use amlflow_storage::node_type_counts;

// ---------------------------------------------------------------------------
// CLI structure
// ---------------------------------------------------------------------------

/// amlflow: anti-money-laundering risk assessment for transactions.
#[derive(Parser)]
#[command(
    name = "amlflow",
    version,
    about = "Assess financial transactions for money-laundering risk and keep every fact for audit.",
    long_about = None,
)]
pub(crate) struct Cli {
    /// Log format: text (default) or json.
    #[arg(long, default_value = "text", global = true)]
    pub log_format: LogFormat,

    /// Verbosity level (-v, -vv, -vvv).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Command,
}

/// Log output format.
#[derive(Clone, Debug, clap::ValueEnum)]
pub(crate) enum LogFormat {
    Text,
    Json,
}

#[derive(Clone, Copy, Debug, clap::ValueEnum)]
pub(crate) enum KindArg {
    Organization,
    Person,
}

impl From<KindArg> for EntityKind {
    fn from(kind: KindArg) -> Self {
        match kind {
            KindArg::Organization => EntityKind::Organization,
            KindArg::Person => EntityKind::Person,
        }
    }
}

#[derive(Clone, Copy, Debug, clap::ValueEnum)]
pub(crate) enum StatusArg {
    Submitted,
    Running,
    Completed,
    Failed,
    TimedOut,
}

impl From<StatusArg> for TransactionState {
    fn from(status: StatusArg) -> Self {
        match status {
            StatusArg::Submitted => TransactionState::Submitted,
            StatusArg::Running => TransactionState::Running,
            StatusArg::Completed => TransactionState::Completed,
            StatusArg::Failed => TransactionState::Failed,
            StatusArg::TimedOut => TransactionState::TimedOut,
        }
    }
}

/// Top-level CLI subcommands.
#[derive(Subcommand)]
pub(crate) enum Command {
    /// Submit one transaction and wait for its risk assessment.
    Submit {
        /// Transaction text. Read from --file or stdin when omitted.
        text: Option<String>,

        /// Read the transaction text from a file.
        #[arg(short, long, conflicts_with = "text")]
        file: Option<PathBuf>,

        /// Address to POST the completion notice to.
        #[arg(long)]
        callback: Option<String>,
    },

    /// Submit a batch of transactions (CSV rows or `---`-separated text).
    Bulk {
        /// Batch file.
        file: PathBuf,

        /// Batch format; defaults to the file extension.
        #[arg(long)]
        format: Option<String>,

        /// Wait for every item to finish and report failures and timeouts.
        #[arg(long)]
        wait: bool,
    },

    /// Show the status (and verdict, if complete) of a transaction.
    Status {
        /// Transaction ID.
        id: String,
    },

    /// Risk distribution across all stored transactions.
    Dashboard,

    /// List stored transactions, newest first.
    List {
        #[arg(long, value_enum)]
        status: Option<StatusArg>,

        /// Case-insensitive substring of the transaction ID.
        #[arg(long)]
        search: Option<String>,

        #[arg(long, default_value_t = 100)]
        limit: usize,

        #[arg(long, default_value_t = 0)]
        offset: usize,
    },

    /// Print the fact tree of a transaction.
    Tree {
        /// Transaction ID.
        id: String,
    },

    /// Print one stored fact.
    Show {
        /// Transaction ID.
        id: String,

        /// Path relative to the transaction folder (as printed by `tree`).
        path: String,
    },

    /// Move legacy-layout facts into the versioned layout.
    Migrate {
        /// Transaction ID.
        id: String,
    },

    /// Cross-transaction history of an entity.
    History {
        /// Entity name.
        name: String,

        #[arg(long, value_enum)]
        kind: Option<KindArg>,
    },

    /// History of every entity extracted from a transaction.
    TransactionHistory {
        /// Transaction ID.
        id: String,
    },

    /// Entity network around a transaction.
    Network {
        /// Transaction ID.
        id: String,

        /// Hop bound (1-3).
        #[arg(long, default_value_t = 2)]
        depth: u32,
    },

    /// Re-run the assessment from stored facts.
    Reassess {
        /// Transaction ID.
        id: String,
    },

    /// Configuration management.
    Config {
        /// Config subcommand.
        #[command(subcommand)]
        action: ConfigAction,
    },
}

/// Config subcommands.
#[derive(Subcommand)]
pub(crate) enum ConfigAction {
    /// Initialize config file with defaults.
    Init,
    /// Show resolved configuration.
    Show,
}

// ---------------------------------------------------------------------------
// Tracing setup
// ---------------------------------------------------------------------------

/// Initialize tracing based on CLI flags.
pub(crate) fn init_tracing(cli: &Cli) {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = match cli.verbose {
        0 => "amlflow=info",
        1 => "amlflow=debug",
        _ => "amlflow=trace",
    };

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

    match cli.log_format {
        LogFormat::Text => {
            fmt()
                .with_env_filter(env_filter)
                .with_target(false)
                .with_writer(std::io::stderr)
                .init();
        }
        LogFormat::Json => {
            fmt()
                .json()
                .with_env_filter(env_filter)
                .with_writer(std::io::stderr)
                .init();
        }
    }
}

// ---------------------------------------------------------------------------
// Command dispatch
// ---------------------------------------------------------------------------

/// Run the CLI command.
pub(crate) async fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Command::Submit { text, file, callback } => cmd_submit(text, file.as_deref(), callback).await,
        Command::Bulk { file, format, wait } => cmd_bulk(&file, format.as_deref(), wait).await,
        Command::Status { id } => cmd_status(&id).await,
        Command::Dashboard => cmd_dashboard().await,
        Command::List {
            status,
            search,
            limit,
            offset,
        } => {
            let query = ListQuery {
                status: status.map(Into::into),
                search,
                limit,
                offset,
            };
            cmd_list(&query).await
        }
        Command::Tree { id } => cmd_tree(&id).await,
        Command::Show { id, path } => cmd_show(&id, &path).await,
        Command::Migrate { id } => cmd_migrate(&id).await,
        Command::History { name, kind } => cmd_history(&name, kind.map(Into::into)).await,
        Command::TransactionHistory { id } => cmd_transaction_history(&id).await,
        Command::Network { id, depth } => cmd_network(&id, depth).await,
        Command::Reassess { id } => cmd_reassess(&id).await,
        Command::Config { action } => match action {
            ConfigAction::Init => cmd_config_init().await,
            ConfigAction::Show => cmd_config_show().await,
        },
    }
}

/// Load config and wire the service. Commands that call the reasoning
/// service check for an API key first.
async fn open_service(
    needs_reasoning: bool,
    observer: Arc<dyn PipelineObserver>,
) -> Result<(AmlService, Arc<LocalEngine>)> {
    let config = load_config()?;
    if needs_reasoning {
        validate_api_key(&config)?;
    }
    Ok(AmlService::from_config(&config, observer).await?)
}

fn parse_id(id: &str) -> Result<TransactionId> {
    id.parse().map_err(|e| eyre!("invalid transaction id '{id}': {e}"))
}

// ---------------------------------------------------------------------------
// Command handlers
// ---------------------------------------------------------------------------

async fn cmd_submit(text: Option<String>, file: Option<&Path>, callback: Option<String>) -> Result<()> {
    let text = match (text, file) {
        (Some(text), _) => text,
        (None, Some(path)) => std::fs::read_to_string(path)
            .map_err(|e| eyre!("cannot read '{}': {e}", path.display()))?,
        (None, None) => std::io::read_to_string(std::io::stdin())
            .map_err(|e| eyre!("cannot read stdin: {e}"))?,
    };

    let progress = Arc::new(CliProgress::new());
    let (service, engine) = open_service(true, progress.clone()).await?;

    let options = SubmitOptions {
        wait: true,
        callback_url: callback,
    };
    let submission = service.submit(&text, options).await;
    // Persistence and notification may still be running after the verdict.
    engine.wait_idle().await;
    progress.finish();

    match submission? {
        Submission::Completed(ra) => print_assessment(&ra),
        Submission::Triggered(run) => {
            println!();
            println!("  Submitted {} (run {})", run.transaction_id, run.run_id);
            println!();
        }
    }
    Ok(())
}

async fn cmd_bulk(file: &Path, format: Option<&str>, wait: bool) -> Result<()> {
    let format = match format {
        Some(f) => f.parse::<BulkFormat>()?,
        None => file
            .extension()
            .and_then(|e| e.to_str())
            .and_then(BulkFormat::from_extension)
            .ok_or_else(|| eyre!("cannot infer batch format of '{}'; pass --format", file.display()))?,
    };
    let content =
        std::fs::read_to_string(file).map_err(|e| eyre!("cannot read '{}': {e}", file.display()))?;

    let progress = Arc::new(CliProgress::new());
    let (service, engine) = open_service(true, progress.clone()).await?;

    info!(file = %file.display(), %format, wait, "submitting batch");
    let options = SubmitOptions {
        wait,
        callback_url: None,
    };
    let summary = service.bulk(&content, format, options).await?;
    engine.wait_idle().await;
    progress.finish();

    println!();
    println!("  Batch submitted");
    println!("  Total:     {}", summary.total);
    println!("  Processed: {}", summary.processed);
    println!("  Failed:    {}", summary.failed);
    for run in &summary.results {
        let verdict = match run.risk_score {
            Some(score) => format!("risk {score:.2}"),
            None => match service.status(&parse_id(&run.transaction_id)?).await {
                Ok(status) => status
                    .risk_assessment
                    .map(|ra| format!("risk {:.2}", ra.risk_score))
                    .unwrap_or_else(|| status.status.to_string()),
                Err(e) => e.to_string(),
            },
        };
        println!("    {}  {verdict}", run.transaction_id);
    }
    for failure in &summary.failures {
        let id = failure.transaction_id.as_deref().unwrap_or("-");
        println!("    item {} ({id}, {:?}): {}", failure.index, failure.kind, failure.error);
    }
    println!();
    Ok(())
}

async fn cmd_status(id: &str) -> Result<()> {
    let txn = parse_id(id)?;
    let (service, _) = open_service(false, Arc::new(SilentObserver)).await?;
    let status = service.status(&txn).await?;

    println!();
    println!("  Transaction: {}", status.transaction_id);
    println!("  Status:      {}", status.status);
    println!("  Source:      {:?}", status.source);
    match &status.risk_assessment {
        Some(ra) => print_assessment(ra),
        None => println!(),
    }
    Ok(())
}

async fn cmd_dashboard() -> Result<()> {
    let (service, _) = open_service(false, Arc::new(SilentObserver)).await?;
    let dashboard = service.dashboard()?;

    println!();
    println!("  Transactions: {}", dashboard.total_transactions);
    println!("  High risk:    {}", dashboard.high_risk);
    println!("  Medium risk:  {}", dashboard.medium_risk);
    println!("  Low risk:     {}", dashboard.low_risk);
    if !dashboard.recent_transactions.is_empty() {
        println!();
        println!("  Recent:");
        for recent in &dashboard.recent_transactions {
            println!("    {:<40} {:.2}  {}", recent.id, recent.risk, recent.timestamp);
        }
    }
    println!();
    Ok(())
}

async fn cmd_list(query: &ListQuery) -> Result<()> {
    let (service, _) = open_service(false, Arc::new(SilentObserver)).await?;
    let page = service.list_transactions(query)?;

    if page.items.is_empty() {
        println!("No transactions found.");
        return Ok(());
    }
    for item in &page.items {
        let risk = item
            .risk_score
            .map(|r| format!("{r:.2}"))
            .unwrap_or_else(|| "-".into());
        println!(
            "{:<44} {:<10} {:>5}  {}",
            item.transaction_id,
            item.status.as_str(),
            risk,
            item.timestamp.as_deref().unwrap_or("-")
        );
    }
    println!(
        "\nShowing {}-{} of {}",
        page.offset + 1,
        page.offset + page.items.len(),
        page.total
    );
    Ok(())
}

async fn cmd_tree(id: &str) -> Result<()> {
    let txn = parse_id(id)?;
    let (service, _) = open_service(false, Arc::new(SilentObserver)).await?;
    let tree = service.tree(&txn)?;
    println!("{} ({})", tree.label, tree.name);
    print_children(&tree, "");
    Ok(())
}

fn print_children(node: &TreeNode, prefix: &str) {
    let count = node.children.len();
    for (i, child) in node.children.iter().enumerate() {
        let last = i + 1 == count;
        let branch = if last { "└── " } else { "├── " };
        match child.kind {
            NodeKind::Directory => println!("{prefix}{branch}{}/  [{}]", child.name, child.label),
            NodeKind::File => println!(
                "{prefix}{branch}{}  ({} bytes)",
                child.name,
                child.size.unwrap_or_default()
            ),
        }
        let next = format!("{prefix}{}", if last { "    " } else { "│   " });
        print_children(child, &next);
    }
}

async fn cmd_show(id: &str, path: &str) -> Result<()> {
    let txn = parse_id(id)?;
    let (service, _) = open_service(false, Arc::new(SilentObserver)).await?;
    let view = service.file(&txn, path)?;
    match view.content {
        FileContent::Json(value) => println!("{}", serde_json::to_string_pretty(&value)?),
        FileContent::Text(text) => println!("{text}"),
        FileContent::Binary => println!("{}: binary file ({} bytes), not shown", view.path, view.size),
        FileContent::TooLarge => println!("{}: {} bytes, too large to show inline", view.path, view.size),
    }
    Ok(())
}

async fn cmd_migrate(id: &str) -> Result<()> {
    let txn = parse_id(id)?;
    let (service, _) = open_service(false, Arc::new(SilentObserver)).await?;
    let report = service.migrate(&txn)?;

    if report.is_noop() {
        println!("Nothing to migrate for {txn}.");
        return Ok(());
    }
    println!();
    println!("  Moved:      {}", report.moved.len());
    println!("  Superseded: {}", report.superseded.len());
    for (path, error) in &report.failed {
        println!("  Failed:     {path}: {error}");
    }
    println!();
    if !report.is_success() {
        return Err(eyre!("{} documents could not be migrated", report.failed.len()));
    }
    Ok(())
}

async fn cmd_history(name: &str, kind: Option<EntityKind>) -> Result<()> {
    let (service, _) = open_service(false, Arc::new(SilentObserver)).await?;
    match service.entity_history(name, kind).await? {
        Some(history) => println!("{}", serde_json::to_string_pretty(&history)?),
        None => println!("No history for '{name}'."),
    }
    Ok(())
}

async fn cmd_transaction_history(id: &str) -> Result<()> {
    let txn = parse_id(id)?;
    let (service, _) = open_service(false, Arc::new(SilentObserver)).await?;
    let history = service.transaction_history(&txn).await?;
    println!("{}", serde_json::to_string_pretty(&history)?);
    Ok(())
}

async fn cmd_network(id: &str, depth: u32) -> Result<()> {
    let txn = parse_id(id)?;
    let (service, _) = open_service(false, Arc::new(SilentObserver)).await?;
    let network = service.network(&txn, depth).await?;

    if network.is_empty() {
        println!("Transaction {txn} is not in the graph store.");
        return Ok(());
    }
    for (node_type, count) in node_type_counts(&network) {
        println!("  {node_type:<14} {count}");
    }
    println!("  {:<14} {}", "links", network.links.len());
    println!();
    println!("{}", serde_json::to_string_pretty(&network)?);
    Ok(())
}

async fn cmd_reassess(id: &str) -> Result<()> {
    let txn = parse_id(id)?;
    let (service, _) = open_service(true, Arc::new(SilentObserver)).await?;
    let ra = service.reassess(&txn).await?;
    print_assessment(&ra);
    Ok(())
}

async fn cmd_config_init() -> Result<()> {
    let path = init_config()?;
    println!("Config initialized at: {}", path.display());
    Ok(())
}

async fn cmd_config_show() -> Result<()> {
    let config: AppConfig = load_config()?;
    let toml_str = toml::to_string_pretty(&config)?;
    println!("{toml_str}");
    Ok(())
}

fn print_assessment(ra: &RiskAssessment) {
    println!();
    println!("  Transaction: {}", ra.transaction_id);
    println!("  Risk score:  {:.2}", ra.risk_score);
    println!("  Confidence:  {:.2}", ra.confidence_score);
    if !ra.extracted_entities.is_empty() {
        println!("  Entities:    {}", ra.extracted_entities.join(", "));
    }
    if !ra.reason.is_empty() {
        println!("  Reason:      {}", ra.reason);
    }
    for evidence in &ra.supporting_evidence {
        println!("    - {evidence}");
    }
    if ra.is_degraded() {
        println!("  (degraded verdict: the reasoning service could not be reached)");
    }
    println!();
}

// ---------------------------------------------------------------------------
// CLI progress reporter
// ---------------------------------------------------------------------------

/// Pipeline observer rendering stages on an indicatif spinner.
struct CliProgress {
    spinner: ProgressBar,
}

impl CliProgress {
    fn new() -> Self {
        let spinner = ProgressBar::new_spinner();
        let style = ProgressStyle::with_template("{spinner:.cyan} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner())
            .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]);
        spinner.set_style(style);
        spinner.enable_steady_tick(std::time::Duration::from_millis(80));
        Self { spinner }
    }

    fn finish(&self) {
        self.spinner.finish_and_clear();
    }
}

impl PipelineObserver for CliProgress {
    fn stage_started(&self, txn: &TransactionId, stage: Stage) {
        self.spinner.set_message(format!("{txn}: {}", stage.label()));
    }

    fn stage_finished(&self, txn: &TransactionId, outcome: &StageOutcome) {
        if matches!(outcome.status, StageStatus::Failed | StageStatus::Degraded) {
            self.spinner.println(format!(
                "  {txn}: {} {} {}",
                outcome.stage.label(),
                outcome.status.as_str(),
                outcome.detail.as_deref().unwrap_or_default()
            ));
        }
    }

    fn run_finished(&self, report: &RunReport) {
        self.spinner
            .set_message(format!("{}: run {}", report.transaction_id, report.status));
    }
}
