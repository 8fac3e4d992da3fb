use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand, ValueEnum};
use serde_json::Value;

use intentflow::approval::ApprovalTracker;
use intentflow::budget::{AllocationStrategy, TokenBudgetManager};
use intentflow::compiler::{compile_ir, Compilation};
use intentflow::config::Config;
use intentflow::engine::{CancellationToken, ParallelExecutor, RunOptions, RunStatus};
use intentflow::events::EventSink;
use intentflow::ir::{parse_ir_file, validate_ir};
use intentflow::steps::{PluginRegistry, StepExecutor};
use intentflow::telemetry::{init_logging, LogConfig};
use intentflow::workflow::ActionCatalog;

#[derive(Parser)]
#[command(name = "intentflow")]
#[command(about = "Compile and run declarative workflow intent", long_about = None)]
#[command(version)]
struct Cli {
    /// Debug logging (RUST_LOG takes precedence)
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Config file (defaults to the user config directory)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate an IR document
    Validate {
        /// Path to IR (JSON or YAML)
        ir: PathBuf,
    },
    /// Compile an IR document and print the step graph
    Compile {
        /// Path to IR (JSON or YAML)
        ir: PathBuf,
        /// Pretty-print the JSON output
        #[arg(long)]
        pretty: bool,
        /// Extra action catalog entries (JSON or YAML)
        #[arg(long)]
        catalog: Option<PathBuf>,
    },
    /// Compile and dry-run an IR document against echo plugins
    Run {
        /// Path to IR (JSON or YAML)
        ir: PathBuf,
        /// JSON run input
        #[arg(short, long)]
        input: Option<String>,
        /// Workflow complexity, 0-10
        #[arg(long, default_value = "5")]
        complexity: f64,
        /// Token allocation strategy
        #[arg(long, value_enum)]
        strategy: Option<StrategyArg>,
        /// Print Prometheus metrics after the run
        #[arg(long)]
        metrics: bool,
        /// JSON file of canned plugin responses keyed by `plugin.action`
        #[arg(long)]
        fixtures: Option<PathBuf>,
        /// Extra action catalog entries (JSON or YAML)
        #[arg(long)]
        catalog: Option<PathBuf>,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum StrategyArg {
    Equal,
    Proportional,
    Adaptive,
    Priority,
}

impl From<StrategyArg> for AllocationStrategy {
    fn from(arg: StrategyArg) -> Self {
        match arg {
            StrategyArg::Equal => AllocationStrategy::Equal,
            StrategyArg::Proportional => AllocationStrategy::Proportional,
            StrategyArg::Adaptive => AllocationStrategy::Adaptive,
            StrategyArg::Priority => AllocationStrategy::Priority,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut log_config = LogConfig::default();
    if cli.verbose {
        log_config = log_config.verbose();
    }
    init_logging(&log_config);

    let config = match &cli.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load(),
    };

    match cli.command {
        Commands::Validate { ir } => cmd_validate(&ir),
        Commands::Compile {
            ir,
            pretty,
            catalog,
        } => cmd_compile(&ir, pretty, catalog.as_deref()),
        Commands::Run {
            ir,
            input,
            complexity,
            strategy,
            metrics,
            fixtures,
            catalog,
        } => {
            let options = RunOptions {
                complexity,
                strategy: strategy.map(Into::into),
            };
            cmd_run(
                &config,
                &ir,
                input.as_deref(),
                options,
                metrics,
                fixtures.as_deref(),
                catalog.as_deref(),
            )
            .await
        }
    }
}

fn load_catalog(extra: Option<&Path>) -> anyhow::Result<ActionCatalog> {
    let mut catalog = ActionCatalog::builtin();
    if let Some(path) = extra {
        catalog.load_from(path)?;
    }
    Ok(catalog)
}

fn compile_file(path: &Path, catalog: Option<&Path>) -> anyhow::Result<Compilation> {
    if !path.exists() {
        anyhow::bail!("File not found: {}", path.display());
    }
    let raw = parse_ir_file(path)?;
    let catalog = load_catalog(catalog)?;
    let compilation = compile_ir(&raw, &catalog).map_err(|e| {
        eprintln!("{}", serde_json::to_string_pretty(&e.to_json()).unwrap_or_default());
        e
    })?;
    for warning in &compilation.warnings {
        eprintln!("warning: {}", warning);
    }
    for fix in &compilation.auto_fixed {
        eprintln!("auto-fix [{}]: {}", fix.rule, fix.description);
    }
    Ok(compilation)
}

fn cmd_validate(path: &Path) -> anyhow::Result<()> {
    if !path.exists() {
        anyhow::bail!("File not found: {}", path.display());
    }
    let raw = parse_ir_file(path)?;
    match validate_ir(&raw) {
        Ok(ir) => {
            println!("✓ IR is valid");
            println!();
            println!("  Goal: {}", ir.goal);
            println!("  Data sources: {}", ir.data_sources.len());
            println!("  AI processing: {}", ir.ai_processing.len());
            println!("  Delivery rules: {}", ir.delivery_rules.configured_count());
            Ok(())
        }
        Err(errors) => {
            println!("✗ IR is invalid ({} error(s))", errors.len());
            println!();
            for error in &errors {
                println!("  {}", error);
            }
            anyhow::bail!("validation failed")
        }
    }
}

fn cmd_compile(path: &Path, pretty: bool, catalog: Option<&Path>) -> anyhow::Result<()> {
    let compilation = compile_file(path, catalog)?;
    let output = if pretty {
        serde_json::to_string_pretty(&compilation.workflow)?
    } else {
        serde_json::to_string(&compilation.workflow)?
    };
    println!("{}", output);
    Ok(())
}

async fn cmd_run(
    config: &Config,
    path: &Path,
    input: Option<&str>,
    options: RunOptions,
    metrics: bool,
    fixtures: Option<&Path>,
    catalog: Option<&Path>,
) -> anyhow::Result<()> {
    if metrics && intentflow::metrics::init_metrics().is_none() {
        eprintln!("warning: a metrics recorder is already installed");
    }

    let compilation = compile_file(path, catalog)?;
    let input: Value = match input {
        Some(text) => serde_json::from_str(text)?,
        None => Value::Object(Default::default()),
    };
    let fixtures: HashMap<String, Value> = match fixtures {
        Some(path) => serde_json::from_str(&std::fs::read_to_string(path)?)?,
        None => HashMap::new(),
    };

    let events = EventSink::new();
    let approvals = Arc::new(ApprovalTracker::new(events.clone()));
    let budget = Arc::new(TokenBudgetManager::new(&config.budget, events.clone()));
    let steps = Arc::new(StepExecutor::new(
        PluginRegistry::dry_run(fixtures),
        approvals,
        budget,
        &config.approval,
    ));
    let executor = ParallelExecutor::new(steps, config, events);

    let cancel = CancellationToken::new();
    cancel.cancel_on_ctrl_c();

    println!("Running '{}' ({} steps)...", compilation.workflow.goal, compilation.workflow.steps.len());
    let summary = executor
        .run(&compilation.workflow, input, options, cancel)
        .await?;

    println!();
    println!("Run ID: {}", summary.run_id);
    println!("Status: {}", summary.status);
    println!("Duration: {}ms", summary.duration_ms());
    println!("Tokens used: {}", summary.token_usage.total_used);
    println!();
    println!("{:<14} {:<16} {:<10} {:>10}", "STEP", "TYPE", "STATUS", "MS");
    println!("{}", "-".repeat(54));
    for record in &summary.step_states {
        println!(
            "{:<14} {:<16} {:<10} {:>10}",
            record.step_id,
            record.step_type,
            record.status.as_str(),
            record
                .duration_ms
                .map(|ms| ms.to_string())
                .unwrap_or_else(|| "-".to_string())
        );
        if let Some(reason) = &record.reason {
            println!("{:<14} skipped: {}", "", reason);
        }
        if let Some(error) = &record.error {
            println!("{:<14} error: {}", "", error);
        }
    }
    println!();
    println!("{}", serde_json::to_string_pretty(&summary.outputs)?);

    if metrics {
        println!();
        print!("{}", intentflow::metrics::render_metrics());
    }

    if summary.status != RunStatus::Completed {
        anyhow::bail!("run finished with status {}", summary.status);
    }
    Ok(())
}
