use std::path::PathBuf;
use std::process::ExitCode;

use camino::Utf8PathBuf;
use clap::{Args, Parser, Subcommand};
use miette::IntoDiagnostic;
use tracing_subscriber::EnvFilter;

use quorem::app::{App, InlineJobQueue, JobTicket, ProgressSink, parse_field};
use quorem::config::ConfigLoader;
use quorem::domain::EntityKind;
use quorem::error::QuoremError;
use quorem::output::{JsonOutput, OutputMode, StderrProgress};
use quorem::store::Store;

#[derive(Parser)]
#[command(name = "quorem")]
#[command(about = "Track investigations, samples, analyses and results with typed values")]
#[command(version, author)]
struct Cli {
    /// Print results as JSON on stdout.
    #[arg(long, global = true)]
    json: bool,

    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Store directory (default: ./.quorem).
    #[arg(long, global = true)]
    store: Option<Utf8PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Ingest a QIIME2 artifact into an analysis")]
    IngestArtifact(IngestArtifactArgs),
    #[command(about = "Ingest a spreadsheet (identity columns or QIIME2 metadata)")]
    IngestSpreadsheet(IngestSpreadsheetArgs),
    #[command(about = "Create steps and default parameters from a plugin manifest")]
    Initialize(InitializeArgs),
    #[command(about = "Create an entity")]
    Create(CreateArgs),
    #[command(about = "Show an entity with its links and values")]
    Info(EntityArgs),
    #[command(about = "List entities of one kind")]
    List(ListArgs),
    #[command(about = "Show the effective parameters of an entity")]
    Parameters(EntityArgs),
}

#[derive(Args)]
struct IngestArtifactArgs {
    #[arg(long)]
    artifact: PathBuf,

    #[arg(long)]
    analysis: String,

    #[arg(long)]
    register_provenance: Option<bool>,
}

#[derive(Args)]
struct IngestSpreadsheetArgs {
    #[arg(long)]
    spreadsheet: PathBuf,

    /// Result uuid linked to every value of a metadata sheet.
    #[arg(long)]
    result: Option<String>,
}

#[derive(Args)]
struct InitializeArgs {
    #[arg(long)]
    manifest: PathBuf,
}

#[derive(Args)]
struct CreateArgs {
    kind: EntityKind,
    identity: String,

    #[arg(long = "field", value_parser = parse_field)]
    fields: Vec<(String, String)>,
}

#[derive(Args)]
struct EntityArgs {
    kind: EntityKind,
    identity: String,
}

#[derive(Args)]
struct ListArgs {
    kind: EntityKind,
}

fn main() -> ExitCode {
    if let Err(report) = run() {
        eprintln!("{report:?}");
        if let Some(quorem) = report.downcast_ref::<QuoremError>() {
            return ExitCode::from(map_exit_code(quorem));
        }
        return ExitCode::from(1);
    }
    ExitCode::SUCCESS
}

fn map_exit_code(error: &QuoremError) -> u8 {
    match error {
        QuoremError::EntityNotFound { .. }
        | QuoremError::UnknownEntityKind(_)
        | QuoremError::UnknownValueKind(_)
        | QuoremError::UnknownDataKind(_)
        | QuoremError::UnknownUnit(_)
        | QuoremError::UnknownField { .. }
        | QuoremError::MissingColumn { .. }
        | QuoremError::InvalidName { .. }
        | QuoremError::AmbiguousInput(_)
        | QuoremError::ConfigRead(_)
        | QuoremError::ConfigParse(_) => 2,
        error if error.is_structural() => 3,
        _ => 1,
    }
}

fn run() -> miette::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let output_mode = if cli.json {
        OutputMode::Json
    } else {
        OutputMode::Human
    };
    let sink: &dyn ProgressSink = match output_mode {
        OutputMode::Json => &JsonOutput,
        OutputMode::Human => &StderrProgress,
    };

    let config = ConfigLoader::resolve(cli.config.as_deref())?;
    let store = match cli.store.clone().or_else(|| config.store_path.clone()) {
        Some(root) => Store::new_with_root(root),
        None => Store::new()?,
    }
    .with_lock_policy(config.lock_policy);
    let app = App::new(store, config, InlineJobQueue);

    match cli.command {
        Commands::IngestArtifact(args) => {
            let ticket = app.ingest_artifact(
                &args.artifact,
                &args.analysis,
                args.register_provenance,
                sink,
            )?;
            print_ticket(&ticket, output_mode)
        }
        Commands::IngestSpreadsheet(args) => {
            let ticket = app.ingest_spreadsheet(&args.spreadsheet, args.result.as_deref(), sink)?;
            print_ticket(&ticket, output_mode)
        }
        Commands::Initialize(args) => {
            let result = app.initialize(&args.manifest, sink)?;
            match output_mode {
                OutputMode::Json => JsonOutput::print_json(&result).into_diagnostic(),
                OutputMode::Human => {
                    println!(
                        "steps: {} ({} new), versions: {}, parameters: {}",
                        result.steps, result.steps_created, result.versions, result.parameters
                    );
                    Ok(())
                }
            }
        }
        Commands::Create(args) => {
            let result = app.create(args.kind, &args.identity, &args.fields, sink)?;
            match output_mode {
                OutputMode::Json => JsonOutput::print_json(&result).into_diagnostic(),
                OutputMode::Human => {
                    let action = if result.created { "created" } else { "updated" };
                    println!("{action} {} {}", result.entity.kind, result.entity.identity);
                    Ok(())
                }
            }
        }
        Commands::Info(args) => {
            let result = app.info(args.kind, &args.identity, sink)?;
            match output_mode {
                OutputMode::Json => JsonOutput::print_json(&result).into_diagnostic(),
                OutputMode::Human => {
                    println!("{} {}", result.kind, result.identity);
                    for (field, value) in &result.text {
                        println!("  {field}: {value}");
                    }
                    for (field, target) in &result.references {
                        println!("  {field}: {target}");
                    }
                    for (field, targets) in &result.links {
                        println!("  {field}: {}", targets.join(", "));
                    }
                    if !result.upstream.is_empty() {
                        println!("  upstream: {}", result.upstream.join(", "));
                    }
                    if !result.downstream.is_empty() {
                        println!("  downstream: {}", result.downstream.join(", "));
                    }
                    if !result.categories.is_empty() {
                        println!("  categories: {}", result.categories.join(", "));
                    }
                    for value in &result.values {
                        println!("  [{}] {} = {} ({})", value.kind, value.name, value.data, value.data_kind);
                    }
                    Ok(())
                }
            }
        }
        Commands::List(args) => {
            let result = app.list(args.kind, sink)?;
            match output_mode {
                OutputMode::Json => JsonOutput::print_json(&result).into_diagnostic(),
                OutputMode::Human => {
                    for entry in &result.entities {
                        println!(
                            "{}\tvalues={}\tupstream={}\tdownstream={}",
                            entry.identity, entry.values, entry.upstream, entry.downstream
                        );
                    }
                    Ok(())
                }
            }
        }
        Commands::Parameters(args) => {
            let result = app.parameters(args.kind, &args.identity, sink)?;
            match output_mode {
                OutputMode::Json => JsonOutput::print_json(&result).into_diagnostic(),
                OutputMode::Human => {
                    for (step, parameters) in &result.steps {
                        println!("{step}");
                        for (name, parameter) in parameters {
                            println!("  {name} = {} ({})", parameter.data, parameter.source);
                        }
                    }
                    Ok(())
                }
            }
        }
    }
}

fn print_ticket(ticket: &JobTicket, output_mode: OutputMode) -> miette::Result<()> {
    if output_mode == OutputMode::Json {
        return JsonOutput::print_json(ticket).into_diagnostic();
    }
    let Some(report) = &ticket.report else {
        println!("job {} queued", ticket.id);
        return Ok(());
    };
    println!("job {}: {:?}", ticket.id, report.status);
    println!(
        "  entities created: {}, updated: {}",
        report.entities_created, report.entities_updated
    );
    println!(
        "  values created: {}, reused: {}, replaced: {}",
        report.values_created, report.values_reused, report.values_replaced
    );
    for error in &report.errors {
        println!("  ! {}: {}", error.record, error.message);
    }
    Ok(())
}
