//! Subcommands.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Args, Subcommand, ValueEnum};
use tokio::sync::broadcast::error::RecvError;

use bulkload_core::job::{FieldMappings, SourceFormat};
use bulkload_core::preview::{format_bytes, PreviewReport};
use bulkload_core::store::{JobEvent, JobPhase, JobState};
use bulkload_events::{EventBus, LogNotifier, Notifier};
use bulkload_pipeline::{Orchestrator, PipelineError};
use bulkload_remote::api::{IngestApi, IngestBackend};
use bulkload_remote::transport::SseTransport;

use crate::config::ClientConfig;

/// Exit code for an import that finished with some failed records.
const EXIT_PARTIAL: u8 = 2;

#[derive(Debug, Subcommand)]
pub enum Command {
    /// List the collections a file can be imported into.
    Collections,
    /// Analyze a file locally without uploading it.
    Preview(PreviewArgs),
    /// Upload a file and follow ingestion progress. Ctrl-C cancels.
    Import(ImportArgs),
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum FormatArg {
    Csv,
    Json,
}

impl From<FormatArg> for SourceFormat {
    fn from(arg: FormatArg) -> Self {
        match arg {
            FormatArg::Csv => SourceFormat::Csv,
            FormatArg::Json => SourceFormat::Json,
        }
    }
}

#[derive(Debug, Args)]
pub struct ParsingArgs {
    /// File to read.
    pub file: PathBuf,
    /// File format; guessed from the extension when omitted.
    #[arg(long, value_enum)]
    pub format: Option<FormatArg>,
    /// CSV field delimiter.
    #[arg(long)]
    pub delimiter: Option<char>,
    /// Text encoding label, e.g. utf-8 or windows-1252.
    #[arg(long)]
    pub encoding: Option<String>,
    /// The first CSV row is data, not a header.
    #[arg(long)]
    pub no_header: bool,
    /// Keep CSV rows whose fields are all empty.
    #[arg(long)]
    pub keep_empty_rows: bool,
    /// Dotted path to the item array in a JSON document.
    #[arg(long)]
    pub root_path: Option<String>,
    /// Depth to which nested JSON objects are flattened.
    #[arg(long)]
    pub depth: Option<u8>,
}

#[derive(Debug, Args)]
pub struct PreviewArgs {
    #[command(flatten)]
    pub parsing: ParsingArgs,
}

#[derive(Debug, Args)]
pub struct ImportArgs {
    #[command(flatten)]
    pub parsing: ParsingArgs,
    /// Target collection name.
    #[arg(long, short)]
    pub collection: String,
    /// Records per insert batch; advised from the file size when omitted.
    #[arg(long)]
    pub batch_size: Option<u32>,
    /// Map a source field to a target field (repeatable).
    #[arg(long = "mapping", value_name = "SOURCE=TARGET", value_parser = parse_mapping)]
    pub mappings: Vec<(String, String)>,
    /// Upload even when the file is above the size warning threshold.
    #[arg(long, short)]
    pub yes: bool,
    /// Reconnect to the progress stream this many times after it gives up.
    #[arg(long, default_value_t = 0)]
    pub progress_retries: u32,
}

fn parse_mapping(raw: &str) -> Result<(String, String), String> {
    let (source, target) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected SOURCE=TARGET, got '{raw}'"))?;
    let (source, target) = (source.trim(), target.trim());
    if source.is_empty() || target.is_empty() {
        return Err(format!("both sides of '{raw}' must be non-empty"));
    }
    Ok((source.to_string(), target.to_string()))
}

pub async fn run(command: Command, config: &ClientConfig) -> anyhow::Result<ExitCode> {
    match command {
        Command::Collections => collections(config).await,
        Command::Preview(args) => preview(config, args).await,
        Command::Import(args) => import(config, args).await,
    }
}

fn orchestrator(config: &ClientConfig, notifier: Arc<dyn Notifier>) -> anyhow::Result<Orchestrator> {
    let client = config.http_client()?;
    let backend = Arc::new(IngestApi::with_client(client.clone(), config.api_url.clone()));
    let transport = Arc::new(SseTransport::new(client, config.api_url.clone()));
    Ok(Orchestrator::new(
        backend,
        transport,
        notifier,
        config.orchestrator(),
    ))
}

// ---------------------------------------------------------------------------
// collections
// ---------------------------------------------------------------------------

async fn collections(config: &ClientConfig) -> anyhow::Result<ExitCode> {
    let api = IngestApi::with_client(config.http_client()?, config.api_url.clone());
    let collections = api.list_collections().await?;

    if collections.is_empty() {
        println!("No collections available.");
    }
    for collection in &collections {
        let fields: Vec<&str> = collection.fields.iter().map(|f| f.name.as_str()).collect();
        println!(
            "{:<24} {:<24} {}",
            collection.collection_name,
            collection.label(),
            fields.join(", ")
        );
    }
    Ok(ExitCode::SUCCESS)
}

// ---------------------------------------------------------------------------
// preview
// ---------------------------------------------------------------------------

async fn preview(config: &ClientConfig, args: PreviewArgs) -> anyhow::Result<ExitCode> {
    let mut orch = orchestrator(config, Arc::new(LogNotifier))?;
    orch.select_file(&args.parsing.file, args.parsing.format.map(Into::into))
        .await?;
    apply_parsing(&mut orch, &args.parsing)?;

    let report = orch.preview().await?;
    print_report(&report);
    Ok(ExitCode::SUCCESS)
}

fn apply_parsing(orch: &mut Orchestrator, args: &ParsingArgs) -> Result<(), PipelineError> {
    let Some(job) = orch.state().job.as_ref() else {
        return Ok(());
    };
    let mut parsing = job.parsing.clone();
    if let Some(delimiter) = args.delimiter {
        parsing.delimiter = delimiter;
    }
    if let Some(encoding) = &args.encoding {
        parsing.encoding = encoding.clone();
    }
    if args.no_header {
        parsing.has_header = false;
    }
    if args.keep_empty_rows {
        parsing.skip_empty_rows = false;
    }
    if let Some(root_path) = &args.root_path {
        parsing.root_path = root_path.clone();
    }
    if let Some(depth) = args.depth {
        parsing.sample_depth = depth;
    }
    orch.set_parsing(parsing)
}

fn print_report(report: &PreviewReport) {
    let estimate = if report.sampling.is_sampled { "~" } else { "" };
    println!(
        "{estimate}{} records, {} read of {}",
        report.total_records,
        format_bytes(report.bytes_read),
        format_bytes(report.file_size),
    );
    if let Some(note) = &report.sampling.note {
        println!("{note}");
    }
    if let Some(warning) = &report.warning {
        println!("warning: {warning}");
    }

    if let Some(raw) = &report.raw_preview {
        println!("--- raw preview ---\n{raw}");
        return;
    }

    println!();
    println!(
        "{:<28} {:<9} {:>9} {:>7} {:>9}",
        "FIELD", "TYPE", "EMPTY", "UNIQUE", "LENGTH"
    );
    for column in &report.columns {
        println!(
            "{:<28} {:<9} {:>9} {:>7} {:>9}",
            column.name,
            column.inferred_type,
            column.empty_count,
            column.unique_count_capped,
            format!("{}-{}", column.min_len, column.max_len),
        );
    }

    if !report.sample_rows.is_empty() {
        println!();
        for row in report.sample_rows.iter().take(5) {
            println!("  {}", row.join(" | "));
        }
    }
}

// ---------------------------------------------------------------------------
// import
// ---------------------------------------------------------------------------

async fn import(config: &ClientConfig, args: ImportArgs) -> anyhow::Result<ExitCode> {
    let bus = Arc::new(EventBus::default());
    let mut notices = bus.subscribe();
    let printer = tokio::spawn(async move {
        loop {
            match notices.recv().await {
                Ok(notice) => eprintln!("[{}] {}", notice.severity, notice.message),
                Err(RecvError::Lagged(skipped)) => {
                    tracing::debug!(skipped, "Notice printer lagged");
                }
                Err(RecvError::Closed) => break,
            }
        }
    });

    let mut orch = orchestrator(config, bus.clone())?;
    drop(bus);

    if let Err(e) = orch.refresh_collections().await {
        tracing::warn!(error = %e, "Continuing without the collection list");
    }
    orch.select_file(&args.parsing.file, args.parsing.format.map(Into::into))
        .await?;
    apply_parsing(&mut orch, &args.parsing)?;
    if let Some(batch_size) = args.batch_size {
        orch.set_batch_size(batch_size)?;
    }
    orch.select_target(args.collection.clone())?;
    if !args.mappings.is_empty() {
        let mappings: FieldMappings = args.mappings.iter().cloned().collect();
        orch.set_mappings(mappings)?;
    }

    match orch.preview().await {
        Ok(report) => {
            let estimate = if report.sampling.is_sampled { "~" } else { "" };
            println!(
                "{estimate}{} records in {}, {} fields",
                report.total_records,
                format_bytes(report.file_size),
                report.columns.len()
            );
        }
        Err(e) => tracing::warn!(error = %e, "Submitting without a preview"),
    }

    match orch.submit(args.yes).await {
        Ok(job_id) => tracing::info!(%job_id, "Import submitted"),
        Err(PipelineError::OversizeConfirmationRequired { size, limit }) => {
            eprintln!(
                "{} is larger than {}; re-run with --yes to upload it anyway",
                format_bytes(size),
                format_bytes(limit)
            );
            return Ok(ExitCode::FAILURE);
        }
        Err(e) => return Err(e.into()),
    }

    let mut retries_left = args.progress_retries;
    loop {
        follow(&mut orch).await?;
        if orch.state().can_retry_progress() && retries_left > 0 {
            retries_left -= 1;
            orch.retry_progress()?;
            continue;
        }
        break;
    }

    let code = print_outcome(orch.state());
    drop(orch);
    let _ = printer.await;
    Ok(code)
}

enum Step {
    Interrupted(std::io::Result<()>),
    Event(Option<JobEvent>),
}

/// Apply events until the import ends or the operator presses Ctrl-C.
async fn follow(orch: &mut Orchestrator) -> anyhow::Result<()> {
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        let step = tokio::select! {
            result = &mut ctrl_c => Step::Interrupted(result),
            event = orch.next_event() => Step::Event(event),
        };

        match step {
            Step::Interrupted(result) => {
                result?;
                eprintln!("Cancelling import...");
                orch.cancel().await?;
                return Ok(());
            }
            Step::Event(None) => return Ok(()),
            Step::Event(Some(event)) => render(&event, orch.state()),
        }
    }
}

fn render(event: &JobEvent, state: &JobState) {
    match event {
        JobEvent::TransferProgress(percent) => println!("upload {percent:>3}%"),
        JobEvent::ServerAccepted => println!("upload accepted, waiting for ingestion"),
        JobEvent::ProgressReceived { .. } => {
            let counts = state.channel.last_known;
            match counts.percent() {
                Some(percent) => println!(
                    "processed {}/{} ({percent}%)",
                    counts.processed, counts.total
                ),
                None => println!("processed {}", counts.processed),
            }
        }
        _ => {}
    }
}

fn print_outcome(state: &JobState) -> ExitCode {
    match state.phase {
        JobPhase::Succeeded | JobPhase::PartiallyFailed => {
            let Some(outcome) = &state.outcome else {
                return ExitCode::FAILURE;
            };
            println!(
                "inserted {}, failed {}, total {} in {} ms",
                outcome.success_count,
                outcome.failed_count,
                outcome.total_count,
                outcome.processing_time_ms
            );
            for sample in &outcome.failed_samples {
                match sample.index {
                    Some(index) => println!("  record {index}: {}", sample.error),
                    None => println!("  {}", sample.error),
                }
            }
            if outcome.has_failures() {
                ExitCode::from(EXIT_PARTIAL)
            } else {
                ExitCode::SUCCESS
            }
        }
        _ => {
            if let Some(message) = &state.message {
                eprintln!("{}: {message}", state.phase);
            }
            ExitCode::FAILURE
        }
    }
}
