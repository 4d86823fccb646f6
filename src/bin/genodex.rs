use std::path::PathBuf;
use std::process::ExitCode;

use camino::Utf8PathBuf;
use clap::{Args, Parser, Subcommand};
use miette::IntoDiagnostic;
use tracing::info;
use tracing_subscriber::EnvFilter;

use genodex::annotation::{AnnotationCache, Annotations};
use genodex::config::{ConfigLoader, ResolvedConfig};
use genodex::datasets::essentiality::EssentialityTransform;
use genodex::datasets::operon::import_operons;
use genodex::datasets::ppi::PpiTransform;
use genodex::domain::GroupId;
use genodex::error::GenodexError;
use genodex::index::{ElasticIndex, IndexWriter, MemoryIndex, Visibility};
use genodex::ingest::{IngestOptions, IngestSummary, RowTransform, StreamingIngestor};
use genodex::output::JsonOutput;
use genodex::remote::HttpFileServer;

#[derive(Parser)]
#[command(name = "genodex")]
#[command(about = "Ingest genomic feature tables into a search index")]
#[command(version, author)]
struct Cli {
    #[arg(long, global = true)]
    config: Option<Utf8PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Index protein-protein interaction pairs")]
    Ppi(IngestArgs),
    #[command(about = "Aggregate gene pairs into operon documents")]
    Operon(IngestArgs),
    #[command(about = "Append essentiality calls to gene documents")]
    Essentiality(IngestArgs),
    #[command(about = "Fetch annotation files for the given groups")]
    Preload(PreloadArgs),
}

#[derive(Args)]
struct IngestArgs {
    #[arg(required = true)]
    inputs: Vec<PathBuf>,

    #[arg(long)]
    index: String,

    #[arg(long)]
    batch_size: Option<usize>,

    #[arg(long)]
    chunk_size: Option<usize>,

    #[arg(long)]
    visibility: Option<Visibility>,

    #[arg(long)]
    no_annotations: bool,

    /// Write into an in-memory index instead of the configured store.
    #[arg(long)]
    dry_run: bool,
}

#[derive(Args)]
struct PreloadArgs {
    #[arg(required = true)]
    groups: Vec<String>,
}

#[derive(Clone, Copy)]
enum Kind {
    Ppi,
    Operon,
    Essentiality,
}

fn main() -> ExitCode {
    if let Err(report) = run() {
        eprintln!("{report:?}");
        if let Some(error) = report.downcast_ref::<GenodexError>() {
            return ExitCode::from(map_exit_code(error));
        }
        return ExitCode::from(1);
    }
    ExitCode::SUCCESS
}

fn map_exit_code(error: &GenodexError) -> u8 {
    match error {
        GenodexError::AnnotationNotFound { .. }
        | GenodexError::ConfigRead(_)
        | GenodexError::ConfigParse(_) => 2,
        GenodexError::RemoteConnect(_)
        | GenodexError::RemoteHttp(_)
        | GenodexError::RemoteStatus { .. }
        | GenodexError::IndexHttp(_)
        | GenodexError::IndexStatus { .. } => 3,
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
    let resolved = ConfigLoader::resolve(cli.config.as_deref())?;

    match cli.command {
        Commands::Ppi(args) => run_ingest(Kind::Ppi, args, &resolved),
        Commands::Operon(args) => run_ingest(Kind::Operon, args, &resolved),
        Commands::Essentiality(args) => run_ingest(Kind::Essentiality, args, &resolved),
        Commands::Preload(args) => run_preload(args, &resolved),
    }
}

fn annotation_cache(
    resolved: &ResolvedConfig,
) -> Result<AnnotationCache<HttpFileServer>, GenodexError> {
    let remote = HttpFileServer::new(&resolved.remote_url, resolved.remote_timeout)?;
    Ok(AnnotationCache::new(
        remote,
        resolved.annotations.clone(),
        resolved.retry.clone(),
    ))
}

fn run_preload(args: PreloadArgs, resolved: &ResolvedConfig) -> miette::Result<()> {
    let groups = args
        .groups
        .iter()
        .map(|group| group.parse::<GroupId>())
        .collect::<Result<Vec<_>, _>>()?;
    let cache = annotation_cache(resolved)?;
    let summary = cache.preload(&groups);
    JsonOutput::print_preload(&summary).into_diagnostic()?;
    Ok(())
}

fn run_ingest(kind: Kind, args: IngestArgs, resolved: &ResolvedConfig) -> miette::Result<()> {
    let mut options = resolved.ingest_options(&args.index);
    if let Some(batch_size) = args.batch_size {
        options.batch_size = batch_size.max(1);
    }
    if let Some(chunk_size) = args.chunk_size {
        options.chunk_size = chunk_size.max(1);
    }
    if let Some(visibility) = args.visibility {
        options.visibility = visibility;
    }

    let cache = if args.no_annotations {
        None
    } else {
        Some(annotation_cache(resolved)?)
    };
    let annotations = cache.as_ref().map(|cache| cache as &dyn Annotations);

    let summary = if args.dry_run {
        info!(index = %options.index, "dry run, writing to memory");
        ingest(kind, MemoryIndex::new(), &args.inputs, annotations, options)?
    } else {
        let index = ElasticIndex::new(&resolved.index_url, resolved.index_timeout)?;
        ingest(kind, index, &args.inputs, annotations, options)?
    };
    JsonOutput::print_ingest(&summary).into_diagnostic()?;
    Ok(())
}

fn ingest<W: IndexWriter>(
    kind: Kind,
    writer: W,
    inputs: &[PathBuf],
    annotations: Option<&dyn Annotations>,
    options: IngestOptions,
) -> Result<IngestSummary, GenodexError> {
    let transform: Box<dyn RowTransform + '_> = match kind {
        Kind::Ppi => Box::new(PpiTransform::new(annotations)),
        Kind::Essentiality => Box::new(EssentialityTransform::new(annotations)),
        Kind::Operon => {
            let (summary, _) = import_operons(&writer, inputs, annotations, &options)?;
            return Ok(summary);
        }
    };
    StreamingIngestor::new(writer, options).run(inputs, transform.as_ref())
}
