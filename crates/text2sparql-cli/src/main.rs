//! text2sparql CLI
//!
//! Command-line front end for the self-validating generator:
//! - `generate`: one question to one reviewed SPARQL query
//! - `plan`: the entity/relation plan for a question, as editable text or JSON
//! - `batch`: run a question set and append predictions to JSONL (resumable)
//! - `execute`: run predictions against a SPARQL endpoint, write QALD answers
//! - `serve`: HTTP server over the same service
//! - `providers`: configured providers and credential status
//!
//! Logs go to stderr; query output goes to stdout.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand};
use colored::Colorize;
use tracing_subscriber::EnvFilter;

use text2sparql_engine::batch::{self, BatchOptions, BatchSummary, PredictionSink};
use text2sparql_engine::dataset;
use text2sparql_engine::endpoint::{self, SparqlEndpoint, Throttle};
use text2sparql_engine::trace::{TraceEntry, TraceWriter};
use text2sparql_engine::{
    AppConfig, GenerateRequest, GenerateResponse, Plan, PlanRequest, ProviderKind, ServiceError,
    SessionStatus, Text2SparqlService,
};

mod server;

#[derive(Parser)]
#[command(name = "text2sparql")]
#[command(
    author,
    version,
    about = "text2sparql: self-validating natural language to SPARQL generation"
)]
struct Cli {
    /// JSON config file (falls back to `$TEXT2SPARQL_CONFIG`, then built-in defaults).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate a reviewed SPARQL query for one question.
    Generate(GenerateArgs),

    /// Produce the entity/relation plan used by chain-of-thought prompting.
    ///
    /// The default output is the editable text form accepted by
    /// `generate --plan <file>`.
    Plan(PlanArgs),

    /// Run every question of a dataset, appending one prediction per line.
    Batch(BatchArgs),

    /// Execute predictions against a SPARQL endpoint (QALD answer document).
    Execute(ExecuteArgs),

    /// Serve `/generate`, `/plan`, `/config` and `/healthz` over HTTP.
    Serve(ServeArgs),

    /// List providers, their default models and credential status.
    Providers,
}

#[derive(Args, Clone, Default)]
struct ModelArgs {
    /// Provider name (openai, deepseek, gemini, openrouter, anthropic, ollama, mock).
    #[arg(long)]
    provider: Option<String>,

    /// Model identifier (defaults to the provider's configured model).
    #[arg(long)]
    model: Option<String>,
}

#[derive(Args)]
struct GenerateArgs {
    /// Natural language question.
    question: String,

    #[command(flatten)]
    model: ModelArgs,

    /// Prompting technique: zero_shot, chain_of_thought (cot), dynamic_prompt.
    #[arg(long)]
    technique: Option<String>,

    /// Correction budget for this question (capped at 10).
    #[arg(long)]
    max_corrections: Option<u32>,

    /// Use this plan instead of asking the model (JSON or `plan` text output).
    #[arg(long)]
    plan: Option<PathBuf>,

    /// Print the full response as JSON, including attempts and trace.
    #[arg(long)]
    json: bool,

    /// Append the session trace to this JSONL file.
    #[arg(long)]
    trace_out: Option<PathBuf>,
}

#[derive(Args)]
struct PlanArgs {
    /// Natural language question.
    question: String,

    #[command(flatten)]
    model: ModelArgs,

    /// Print the plan as JSON instead of editable text.
    #[arg(long)]
    json: bool,

    /// Also write the plan to this file.
    #[arg(short, long)]
    out: Option<PathBuf>,
}

#[derive(Args)]
struct BatchArgs {
    /// Dataset name from `dataset_paths` in the config, or a file path.
    #[arg(long)]
    dataset: String,

    /// Prediction output (defaults to `output_file` from the config).
    #[arg(short, long)]
    out: Option<PathBuf>,

    #[command(flatten)]
    model: ModelArgs,

    #[arg(long)]
    technique: Option<String>,

    #[arg(long)]
    max_corrections: Option<u32>,

    /// Sessions in flight at once.
    #[arg(long)]
    concurrency: Option<usize>,

    /// Only the first N questions.
    #[arg(long)]
    limit: Option<usize>,

    /// Start over: remove the output file instead of skipping finished ids.
    #[arg(long)]
    no_resume: bool,

    /// Append every session trace to this JSONL file.
    #[arg(long)]
    trace_out: Option<PathBuf>,
}

#[derive(Args)]
struct ExecuteArgs {
    /// Prediction JSONL written by `batch`.
    #[arg(long)]
    predictions: PathBuf,

    /// QALD answer document to write.
    #[arg(short, long)]
    out: PathBuf,

    /// SPARQL endpoint (defaults to `sparql_endpoint` from the config).
    #[arg(long)]
    endpoint: Option<String>,

    /// Per-query timeout.
    #[arg(long, default_value_t = 60)]
    timeout_secs: u64,

    /// Pause after every N executed queries (0 disables pausing).
    #[arg(long, default_value_t = 0)]
    pause_every: usize,

    #[arg(long, default_value_t = 60)]
    pause_secs: u64,
}

#[derive(Args)]
struct ServeArgs {
    /// Listen address (use `127.0.0.1:0` to auto-pick a free port).
    #[arg(long, default_value = "127.0.0.1:8000")]
    listen: SocketAddr,

    /// Write `{addr, pid}` JSON here once the listener is bound.
    #[arg(long)]
    ready_file: Option<PathBuf>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    let config = AppConfig::load(cli.config.as_deref()).context("failed to load configuration")?;

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|e| anyhow!("failed to initialize tokio runtime: {e}"))?;

    rt.block_on(run(cli.command, config))
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

async fn run(command: Commands, config: AppConfig) -> Result<()> {
    if let Commands::Providers = command {
        cmd_providers(&config);
        return Ok(());
    }
    let service = Text2SparqlService::new(config).context("failed to build model router")?;
    match command {
        Commands::Generate(args) => cmd_generate(&service, args).await,
        Commands::Plan(args) => cmd_plan(&service, args).await,
        Commands::Batch(args) => cmd_batch(&service, args).await,
        Commands::Execute(args) => cmd_execute(service.config(), args).await,
        Commands::Serve(args) => server::serve(service, args.listen, args.ready_file).await,
        Commands::Providers => Ok(()),
    }
}

fn service_error(action: &str, e: ServiceError) -> anyhow::Error {
    anyhow!("{action} failed [{}]: {e}", e.kind())
}

// ============================================================================
// generate / plan
// ============================================================================

async fn cmd_generate(service: &Text2SparqlService, args: GenerateArgs) -> Result<()> {
    let plan = args.plan.as_deref().map(read_plan_file).transpose()?;
    let request = GenerateRequest {
        question: args.question,
        provider: args.model.provider,
        model: args.model.model,
        technique: args.technique,
        plan,
        max_corrections: args.max_corrections,
        include_trace: args.json || args.trace_out.is_some(),
    };

    let result = service.generate(request).await;

    if let Some(path) = &args.trace_out {
        let trace: &[TraceEntry] = match &result {
            Ok(response) => &response.trace,
            Err(ServiceError::Session(failure)) => &failure.trace,
            Err(_) => &[],
        };
        if !trace.is_empty() {
            TraceWriter::create(path)
                .and_then(|w| w.write_session(trace))
                .with_context(|| format!("failed to write trace {}", path.display()))?;
            eprintln!("{} {}", "trace".cyan(), path.display());
        }
    }

    let response = result.map_err(|e| service_error("generation", e))?;
    if args.json {
        println!("{}", serde_json::to_string_pretty(&response)?);
        return Ok(());
    }
    report_generation(&response);
    Ok(())
}

fn report_generation(response: &GenerateResponse) {
    let status = match response.status {
        SessionStatus::Accepted => "accepted".green().bold(),
        SessionStatus::Exhausted => "exhausted".yellow().bold(),
    };
    eprintln!(
        "{} after {} attempt(s) [{} / {} / {}]",
        status, response.attempts, response.provider, response.model, response.technique
    );
    if response.sparql.is_empty() {
        eprintln!("{} no SPARQL query could be extracted", "warning:".yellow().bold());
    } else {
        println!("{}", response.sparql);
    }
}

/// A plan file is either JSON or the text form printed by `plan`.
fn read_plan_file(path: &Path) -> Result<Plan> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read plan {}", path.display()))?;
    if text.trim_start().starts_with('{') {
        serde_json::from_str(&text).with_context(|| format!("invalid plan JSON in {}", path.display()))
    } else {
        Plan::from_edit_text(&text).with_context(|| format!("invalid plan text in {}", path.display()))
    }
}

async fn cmd_plan(service: &Text2SparqlService, args: PlanArgs) -> Result<()> {
    let response = service
        .plan(PlanRequest {
            question: args.question,
            provider: args.model.provider,
            model: args.model.model,
        })
        .await
        .map_err(|e| service_error("planning", e))?;

    let rendered = if args.json {
        serde_json::to_string_pretty(&response.plan)?
    } else {
        response.plan.to_edit_text()
    };
    eprintln!(
        "{} {} entities, {} relations [{} / {}]",
        "plan".green().bold(),
        response.plan.entities.len(),
        response.plan.relations.len(),
        response.provider,
        response.model
    );
    if let Some(out) = &args.out {
        write_with_parent(out, &rendered)?;
        eprintln!("{} {}", "wrote".green().bold(), out.display().to_string().bold());
    }
    println!("{rendered}");
    Ok(())
}

// ============================================================================
// batch / execute
// ============================================================================

async fn cmd_batch(service: &Text2SparqlService, args: BatchArgs) -> Result<()> {
    let config = service.config();
    let path = config.dataset_path(&args.dataset);
    let mut entries = dataset::load_dataset(&path)?;
    if let Some(limit) = args.limit {
        entries.truncate(limit);
    }

    let out = args.out.unwrap_or_else(|| config.output_file.clone());
    if args.no_resume && out.exists() {
        std::fs::remove_file(&out)
            .with_context(|| format!("failed to remove {}", out.display()))?;
    }

    let options = BatchOptions {
        technique: service.technique(args.technique.as_deref())?,
        provider: args.model.provider,
        model: args.model.model,
        max_corrections: args.max_corrections.unwrap_or(config.max_correction_cycles),
        concurrency: args.concurrency.unwrap_or(config.batch_concurrency),
        resume: !args.no_resume,
    };

    let sink = Arc::new(PredictionSink::open(&out)?);
    let traces = match &args.trace_out {
        Some(p) => Some(Arc::new(
            TraceWriter::create(p).with_context(|| format!("failed to open trace {}", p.display()))?,
        )),
        None => None,
    };

    eprintln!(
        "{} {} questions from {}",
        "Running".green().bold(),
        entries.len(),
        path.display()
    );
    let summary = batch::run_batch(service.router(), entries, sink, traces, &options).await?;
    report_batch(&summary, &out);
    Ok(())
}

fn report_batch(summary: &BatchSummary, out: &Path) {
    println!(
        "  {} {} total, {} skipped (already done)",
        "→".cyan(),
        summary.total,
        summary.skipped
    );
    println!(
        "  {} {} accepted, {} exhausted, {} failed",
        "→".cyan(),
        summary.accepted.to_string().green(),
        summary.exhausted.to_string().yellow(),
        summary.failed.to_string().red()
    );
    println!("  {} mean attempts {:.2}", "→".cyan(), summary.mean_attempts);
    println!("  {} {}", "→".cyan(), out.display());
}

async fn cmd_execute(config: &AppConfig, args: ExecuteArgs) -> Result<()> {
    let records = batch::latest_predictions(&args.predictions)?;
    let url = args
        .endpoint
        .unwrap_or_else(|| config.sparql_endpoint.clone());
    let ep = SparqlEndpoint::new(&url, Duration::from_secs(args.timeout_secs.max(1)))?;
    let throttle = (args.pause_every > 0).then(|| Throttle {
        every: args.pause_every,
        pause: Duration::from_secs(args.pause_secs),
    });

    eprintln!(
        "{} {} predictions against {}",
        "Executing".green().bold(),
        records.len(),
        url
    );
    let doc = endpoint::execute_predictions(&ep, &records, throttle).await;
    write_with_parent(&args.out, &serde_json::to_string_pretty(&doc)?)?;
    eprintln!("{} {}", "wrote".green().bold(), args.out.display().to_string().bold());
    Ok(())
}

fn write_with_parent(path: &Path, contents: &str) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    std::fs::write(path, contents).with_context(|| format!("failed to write {}", path.display()))
}

// ============================================================================
// providers
// ============================================================================

fn cmd_providers(config: &AppConfig) {
    for kind in ProviderKind::ALL {
        let marker = if kind == config.default_provider { "*" } else { " " };
        let credentials = match kind.api_key_env() {
            Some(var) if config.provider_settings(kind).api_key.is_some() => {
                format!("{var} set").green()
            }
            Some(var) => format!("{var} missing").red(),
            None => "no key needed".normal(),
        };
        println!(
            "{marker} {:<10} {:<28} {}",
            kind.name().bold(),
            config.default_model_for(kind),
            credentials
        );
    }
}
