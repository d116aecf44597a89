mod output;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use output::{
    ArgumentInfo, InitOutput, JournalOutput, OutputWriter, PipelineInfo, PipelinesOutput,
    PruneOutput, QueryMatch, QueryOutput, RunOutput,
};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};
use vellum_core::{
    AttributeBag, Executor, Interpreter, OperationRegistry, Pipeline, PipelineSet, Volume,
};

/// Vellum - incremental pipelines over a metadata tree
#[derive(Parser)]
#[command(name = "vellum")]
#[command(about = "Runs incremental processing pipelines over a disk-persisted metadata tree", long_about = None)]
#[command(version)]
struct Cli {
    /// Volume directory (defaults to VELLUM_VOLUME env var or .)
    #[arg(long, global = true)]
    volume: Option<PathBuf>,

    /// Print results as JSON
    #[arg(long, global = true)]
    json: bool,

    /// Log at debug level unless VELLUM_LOG says otherwise
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Write logs as JSON lines
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize a new volume
    Init {
        /// Tag of the root node
        #[arg(long, default_value = "Volume")]
        root_tag: String,
    },

    /// Run a pipeline
    Run {
        /// Pipeline description file
        #[arg(long)]
        pipelines: PathBuf,

        /// Pipeline to run (defaults to the first one)
        name: Option<String>,

        /// Pipeline argument, repeatable
        #[arg(long = "arg", value_name = "NAME=VALUE", value_parser = parse_key_val)]
        args: Vec<(String, String)>,

        /// Stop at the first failing operation instead of rolling back
        #[arg(long)]
        debug: bool,

        /// Worker threads for external programs
        #[arg(long)]
        workers: Option<usize>,
    },

    /// Find nodes with a path query from the root
    Query {
        /// Path query, e.g. "Section/Channel[@Name='Raw8']"
        xpath: String,

        /// Print every match instead of the first
        #[arg(long)]
        all: bool,
    },

    /// Remove stale artifacts
    Prune {
        /// Dry run - show what would be removed without removing
        #[arg(long)]
        dry_run: bool,
    },

    /// Show recent journal entries
    Journal {
        /// Number of entries
        #[arg(short = 'n', long, default_value_t = 20)]
        count: usize,
    },

    /// List the pipelines of a description file
    Pipelines {
        /// Pipeline description file
        #[arg(long)]
        pipelines: PathBuf,
    },
}

fn parse_key_val(s: &str) -> Result<(String, String), String> {
    let (key, value) = s
        .split_once('=')
        .ok_or_else(|| format!("expected NAME=VALUE, got {s:?}"))?;
    if key.is_empty() {
        return Err(format!("empty argument name in {s:?}"));
    }
    Ok((key.to_string(), value.to_string()))
}

fn init_logging(verbose: bool, json: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_env("VELLUM_LOG").unwrap_or_else(|_| EnvFilter::new(default));
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry
            .with(fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.log_json);
    let output = OutputWriter::new(cli.json);

    // Volume directory: CLI arg > VELLUM_VOLUME env var > current directory
    let root = cli
        .volume
        .or_else(|| std::env::var("VELLUM_VOLUME").ok().map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from("."));

    let result = match cli.command {
        Commands::Init { root_tag } => cmd_init(&output, &root, &root_tag),
        Commands::Run {
            pipelines,
            name,
            args,
            debug,
            workers,
        } => cmd_run(&output, &root, &pipelines, name.as_deref(), args, debug, workers),
        Commands::Query { xpath, all } => cmd_query(&output, &root, &xpath, all),
        Commands::Prune { dry_run } => cmd_prune(&output, &root, dry_run),
        Commands::Journal { count } => cmd_journal(&output, &root, count),
        Commands::Pipelines { pipelines } => cmd_pipelines(&output, &pipelines),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            output.write_error(&e, 1);
            ExitCode::from(1)
        }
    }
}

fn open_volume(root: &Path) -> Result<Volume> {
    Volume::open(root).with_context(|| format!("Failed to open volume at {}", root.display()))
}

fn cmd_init(output: &OutputWriter, root: &Path, root_tag: &str) -> Result<()> {
    let volume = Volume::init(root, root_tag)
        .with_context(|| format!("Failed to initialize volume at {}", root.display()))?;

    let data = InitOutput {
        success: true,
        result_code: 0,
        root: volume.root().display().to_string(),
        root_tag: root_tag.to_string(),
        algorithm: volume.algorithm().as_str().to_string(),
    };
    output.write(&data, || {
        format!(
            "Initialized vellum volume at {}\nAlgorithm: {}\n",
            data.root, data.algorithm
        )
    })
}

/// Apply the pipeline's declared defaults and check the given arguments.
///
/// A pipeline that declares no arguments accepts any.
fn resolve_arguments(
    pipeline: &Pipeline,
    provided: Vec<(String, String)>,
) -> Result<BTreeMap<String, String>> {
    let declared = &pipeline.arguments;
    let mut arguments = BTreeMap::new();
    for (name, value) in provided {
        if !declared.is_empty() && !declared.iter().any(|d| d.name == name) {
            anyhow::bail!("Pipeline {} has no argument {}", pipeline.name, name);
        }
        arguments.insert(name, value);
    }
    for declared_arg in declared {
        if !arguments.contains_key(&declared_arg.name) {
            let default = declared_arg.default.clone().with_context(|| {
                format!(
                    "Pipeline {} requires --arg {}=VALUE",
                    pipeline.name, declared_arg.name
                )
            })?;
            arguments.insert(declared_arg.name.clone(), default);
        }
    }
    Ok(arguments)
}

fn cmd_run(
    output: &OutputWriter,
    root: &Path,
    pipelines: &Path,
    name: Option<&str>,
    args: Vec<(String, String)>,
    debug: bool,
    workers: Option<usize>,
) -> Result<()> {
    let set = PipelineSet::load(pipelines)
        .with_context(|| format!("Failed to load pipelines from {}", pipelines.display()))?;
    let pipeline = set.select(name).context("Failed to select pipeline")?;
    let arguments = resolve_arguments(pipeline, args)?;

    let volume = open_volume(root)?;
    let mut tree = volume.load_tree().context("Failed to load metadata tree")?;

    let executor = workers.map(Executor::new).unwrap_or_default();
    tracing::info!(
        pipeline = %pipeline.name,
        volume = %volume.root().display(),
        workers = executor.workers(),
        "running pipeline"
    );
    let interpreter =
        Interpreter::new(OperationRegistry::with_builtins(), executor).with_debug(debug);
    let report = interpreter
        .run(&mut tree, pipeline, &arguments)
        .with_context(|| format!("Pipeline {} aborted", pipeline.name))?;

    let data = RunOutput {
        success: true,
        result_code: 0,
        pipeline: pipeline.name.clone(),
        report,
    };
    output.write(&data, || data.to_text())
}

fn cmd_query(output: &OutputWriter, root: &Path, xpath: &str, all: bool) -> Result<()> {
    let volume = open_volume(root)?;
    let mut tree = volume.load_tree().context("Failed to load metadata tree")?;
    let from = tree.root();

    let found = if all {
        tree.find_all(from, xpath)
            .and_then(|mut matches| matches.collect(&mut tree))
    } else {
        tree.find(from, xpath).map(|found| found.into_iter().collect())
    };
    let found = found.with_context(|| format!("Query {} failed", xpath))?;

    let mut matches = Vec::with_capacity(found.len());
    for id in found {
        let node = tree.node(id)?;
        matches.push(QueryMatch {
            tag: node.tag().to_string(),
            name: node.name().map(str::to_string),
            path: tree.full_path(id)?.display().to_string(),
        });
    }

    let data = QueryOutput {
        success: true,
        result_code: 0,
        query: xpath.to_string(),
        matches,
    };
    output.write(&data, || data.to_text())
}

fn cmd_prune(output: &OutputWriter, root: &Path, dry_run: bool) -> Result<()> {
    let volume = open_volume(root)?;
    let mut tree = volume.load_tree().context("Failed to load metadata tree")?;

    let stats = tree.prune(dry_run).context("Failed to prune volume")?;
    if !dry_run {
        let tree_root = tree.root();
        tree.save(tree_root, true)
            .context("Failed to save metadata tree")?;
    }

    let data = PruneOutput {
        success: true,
        result_code: 0,
        dry_run,
        stats,
    };
    output.write(&data, || data.to_text())
}

fn cmd_journal(output: &OutputWriter, root: &Path, count: usize) -> Result<()> {
    let volume = open_volume(root)?;
    let entries = volume
        .journal()
        .read_recent(count)
        .context("Failed to read journal")?;

    let data = JournalOutput {
        success: true,
        result_code: 0,
        entries,
    };
    output.write(&data, || data.to_text())
}

fn cmd_pipelines(output: &OutputWriter, pipelines: &Path) -> Result<()> {
    let set = PipelineSet::load(pipelines)
        .with_context(|| format!("Failed to load pipelines from {}", pipelines.display()))?;

    let data = PipelinesOutput {
        success: true,
        result_code: 0,
        pipelines: set
            .pipelines()
            .iter()
            .map(|pipeline| PipelineInfo {
                name: pipeline.name.clone(),
                instructions: pipeline.body.len(),
                arguments: pipeline
                    .arguments
                    .iter()
                    .map(|declared_arg| ArgumentInfo {
                        name: declared_arg.name.clone(),
                        default: declared_arg.default.clone(),
                        help: declared_arg.help.clone(),
                    })
                    .collect(),
            })
            .collect(),
        operations: OperationRegistry::with_builtins().names(),
    };
    output.write(&data, || data.to_text())
}
