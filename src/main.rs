use annodex::config::SearchConfig;
use annodex::document::Corpus;
use annodex::index::stats::Statistic;
use annodex::index::types::Tolerance;
use annodex::output;
use annodex::scheduler::ReindexReason;
use annodex::service::SearchService;
use annodex::utils::{get_corpus_index_dir, remove_corpus_index};
use annodex::SearchError;
use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

#[derive(Parser)]
#[command(name = "annodex")]
#[command(version, about = "Search and measure annotated text corpora")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Disable colored output
    #[arg(long, global = true)]
    no_color: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Index a corpus directory, building only what is missing or changed
    Index {
        /// Corpus directory
        #[arg(default_value = ".")]
        path: PathBuf,
    },
    /// Search a corpus
    Search {
        /// Query: words, "quoted phrases", <Layer/>, <Layer.feature="value"/>, joined by |
        query: String,

        /// Corpus directory
        #[arg(short, long, default_value = ".")]
        path: PathBuf,

        /// Only search this document (path relative to the corpus root)
        #[arg(short, long)]
        doc: Option<String>,

        /// Annotator whose annotations are searched
        #[arg(short, long, default_value = "admin")]
        user: String,

        /// Also read documents that are being reindexed
        #[arg(long)]
        last_committed: bool,

        /// Print results as JSON
        #[arg(long)]
        json: bool,
    },
    /// Corpus statistics, optionally of the hits of a query
    Stats {
        /// Corpus directory
        #[arg(default_value = ".")]
        path: PathBuf,

        /// Report per-document hit statistics of this query
        #[arg(short, long)]
        query: Option<String>,

        /// Comma separated statistics: n, min, max, mean, median, standarddeviation
        #[arg(short, long)]
        metrics: Option<String>,

        /// Only documents with at least this many tokens
        #[arg(long)]
        min_tokens: Option<u32>,

        /// Only documents with at most this many tokens
        #[arg(long)]
        max_tokens: Option<u32>,

        #[arg(short, long, default_value = "admin")]
        user: String,

        /// Print statistics as JSON
        #[arg(long)]
        json: bool,
    },
    /// Show index state and failed documents
    Status {
        #[arg(default_value = ".")]
        path: PathBuf,
    },
    /// Reindex every document of a corpus
    Rebuild {
        #[arg(default_value = ".")]
        path: PathBuf,
    },
    /// Remove the index of a corpus
    Remove {
        path: PathBuf,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("annodex=info")),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    let cli = Cli::parse();
    let color = !cli.no_color;

    match cli.command {
        Commands::Index { path } => {
            // Opening queues whatever is missing or changed
            let (corpus, service) = open_corpus(&path)?;
            for task in service.failed_tasks(Corpus::PROJECT) {
                service.enqueue(Corpus::PROJECT, task.doc, task.variant, ReindexReason::Rebuild)?;
            }
            wait_for_index(&service, "Indexing")?;
            report_index(&corpus, &service, color)?;
            service.shutdown();
        }
        Commands::Search {
            query,
            path,
            doc,
            user,
            last_committed,
            json,
        } => {
            let (corpus, service) = open_corpus(&path)?;
            wait_for_index(&service, "Waiting for index")?;

            let scope = match doc {
                Some(name) => match corpus.doc_id(&name) {
                    Some(id) => Some(id),
                    None => bail!("No document named {} in {}", name, corpus.root.display()),
                },
                None => None,
            };
            let tolerance = if last_committed {
                Tolerance::LastCommitted
            } else {
                Tolerance::ValidOnly
            };

            let results = service.query_with(&user, Corpus::PROJECT, &query, scope, tolerance)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&results)?);
            } else if results.is_empty() {
                eprintln!("No matches");
            } else {
                output::print_results(&results, color)?;
            }
            service.shutdown();
        }
        Commands::Stats {
            path,
            query,
            metrics,
            min_tokens,
            max_tokens,
            user,
            json,
        } => {
            let (corpus, service) = open_corpus(&path)?;
            wait_for_index(&service, "Waiting for index")?;

            let metrics = metrics.unwrap_or_else(|| {
                Statistic::ALL.iter().map(|s| s.name()).collect::<Vec<_>>().join(",")
            });
            let result = match &query {
                Some(q) => service.get_query_statistics(
                    &user,
                    Corpus::PROJECT,
                    &metrics,
                    q,
                    min_tokens,
                    max_tokens,
                )?,
                None => service.get_project_statistics(&user, Corpus::PROJECT, &metrics, min_tokens, max_tokens)?,
            };

            if json {
                println!("{}", serde_json::to_string_pretty(&result)?);
            } else {
                output::print_statistics(&result, color)?;
            }
            service.shutdown();
        }
        Commands::Status { path } => {
            let (corpus, service) = open_corpus(&path)?;
            report_index(&corpus, &service, color)?;
            for skipped in corpus.skipped() {
                println!("  Skipped:   {}", skipped.display());
            }
            service.shutdown();
        }
        Commands::Rebuild { path } => {
            let (corpus, service) = open_corpus(&path)?;
            let queued = service.rebuild_project(Corpus::PROJECT)?;
            println!("Rebuilding {} document variants", queued);
            wait_for_index(&service, "Rebuilding")?;
            report_index(&corpus, &service, color)?;
            service.shutdown();
        }
        Commands::Remove { path } => {
            let root = path.canonicalize().context("Invalid corpus path")?;
            let index_root = SearchConfig::load().index.base_dir;
            if remove_corpus_index(&index_root, &root)? {
                println!("Removed index for: {}", root.display());
            } else {
                println!("No index for: {}", root.display());
            }
        }
    }

    Ok(())
}

/// Load a corpus directory and open its index
fn open_corpus(path: &Path) -> Result<(Corpus, SearchService)> {
    let corpus = Corpus::load(path)?;

    let mut config = SearchConfig::load();
    config.index.base_dir = get_corpus_index_dir(&config.index.base_dir, &corpus.root);

    let service = SearchService::new(config, corpus.documents.clone(), corpus.schema.clone());
    match service.open_project(Corpus::PROJECT) {
        Ok(_) => {}
        Err(SearchError::IndexCorrupt { reason, .. }) => {
            eprintln!("Index was corrupt ({}), rebuilding", reason);
        }
        Err(e) => return Err(e.into()),
    }
    Ok((corpus, service))
}

/// Poll the index until nothing is pending, showing progress
fn wait_for_index(service: &SearchService, message: &'static str) -> Result<()> {
    let project = Corpus::PROJECT;
    let total = service.get_index_progress(project).len();
    if total == 0 {
        return Ok(());
    }

    let pb = ProgressBar::new(total as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({percent}%) {msg}")?
            .progress_chars("█▓▒░  "),
    );
    pb.set_message(message);
    pb.enable_steady_tick(Duration::from_millis(80));

    let interval = service.config().scheduler.poll_interval();
    let timeout = service.config().scheduler.poll_timeout();
    let start = Instant::now();
    loop {
        let pending = service.get_index_progress(project).len();
        pb.set_position(total.saturating_sub(pending) as u64);
        if pending == 0 {
            break;
        }
        if start.elapsed() >= timeout {
            pb.abandon();
            return Err(SearchError::IndexNotReady { project, pending }.into());
        }
        std::thread::sleep(interval);
    }

    pb.finish_and_clear();
    Ok(())
}

fn report_index(corpus: &Corpus, service: &SearchService, color: bool) -> Result<()> {
    let status = service.status(Corpus::PROJECT)?;
    let failed = service.failed_tasks(Corpus::PROJECT);
    println!("Corpus: {} ({} documents)", corpus.root.display(), corpus.document_count());
    output::print_status(&status, &failed, |doc| corpus.name_of(doc), color)?;
    Ok(())
}
