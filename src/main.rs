//! # finrag CLI
//!
//! Index financial documents and ask questions grounded in them.
//!
//! ## Usage
//!
//! ```bash
//! finrag --config ./config/finrag.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `finrag init` | Create the SQLite database and documents directory |
//! | `finrag index <file>` | Index a PDF or text file under an identity tuple |
//! | `finrag reindex <filename>` | Replace the chunks of a previously indexed file |
//! | `finrag delete <id>` | Delete one chunk, or a document and all its chunks |
//! | `finrag get <id>` | Show a chunk or a document record |
//! | `finrag meta <chunk_id> <json>` | Merge free-form metadata into a chunk |
//! | `finrag count` | Total chunk count |
//! | `finrag parents` | List indexed documents |
//! | `finrag search "<query>"` | Filtered similarity search |
//! | `finrag ask "<question>"...` | Retrieve, cite and answer |
//! | `finrag completions <shell>` | Print shell completions |

use std::io;
use std::path::PathBuf;

use clap::{Args, CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use tracing_subscriber::EnvFilter;

use finrag::commands;
use finrag::config;
use finrag::filter::MetadataFilter;
use finrag::models::DocMetadata;

/// Citation-grounded question answering over financial documents.
#[derive(Parser)]
#[command(
    name = "finrag",
    about = "Citation-grounded retrieval over financial PDF documents",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/finrag.toml")]
    config: PathBuf,

    /// More log output (-v debug, -vv trace).
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Only log warnings and errors.
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

/// Identity tuple and descriptive metadata of a document.
#[derive(Args)]
struct MetadataArgs {
    #[arg(long)]
    advisor_id: String,
    #[arg(long)]
    client_id: String,
    /// Document type, e.g. `10-K` or `earnings-call`.
    #[arg(long)]
    doc_type: String,
    #[arg(long)]
    file_version: String,
    #[arg(long)]
    strategy: Option<String>,
    /// `pdf` or `txt`.
    #[arg(long, default_value = "pdf")]
    file_type: String,
    /// Fiscal year. Derived from the file name when omitted.
    #[arg(long)]
    year: Option<String>,
}

impl From<MetadataArgs> for DocMetadata {
    fn from(a: MetadataArgs) -> Self {
        DocMetadata {
            advisor_id: a.advisor_id,
            client_id: a.client_id,
            doc_type: a.doc_type,
            file_version: a.file_version,
            strategy: a.strategy,
            file_type: a.file_type,
            year: a.year,
        }
    }
}

/// Equality filters over chunk metadata.
#[derive(Args)]
struct FilterArgs {
    #[arg(long)]
    advisor_id: Option<String>,
    #[arg(long)]
    client_id: Option<String>,
    #[arg(long)]
    doc_type: Option<String>,
}

impl From<FilterArgs> for MetadataFilter {
    fn from(a: FilterArgs) -> Self {
        MetadataFilter::from_options(
            a.advisor_id.as_deref(),
            a.client_id.as_deref(),
            a.doc_type.as_deref(),
        )
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema and documents directory.
    ///
    /// Idempotent; running it again is safe.
    Init,

    /// Index a file. Re-submitting identical content and metadata is a no-op.
    Index {
        file: PathBuf,
        #[command(flatten)]
        metadata: MetadataArgs,
    },

    /// Re-chunk and re-embed a previously indexed file by name, replacing its chunks.
    Reindex {
        filename: String,
        #[command(flatten)]
        metadata: MetadataArgs,
    },

    /// Delete a chunk by chunk id, or a document and all its chunks by parent id.
    Delete { id: String },

    /// Show a chunk (or a document record for a parent id).
    Get { id: String },

    /// Merge a JSON object into a chunk's free-form metadata.
    Meta { chunk_id: String, patch: String },

    /// Print the total chunk count.
    Count,

    /// List indexed documents.
    Parents,

    /// Similarity search with optional metadata filters.
    Search {
        query: String,
        /// Number of hits (defaults to `retrieval.n_results`).
        #[arg(long)]
        k: Option<usize>,
        #[command(flatten)]
        filter: FilterArgs,
    },

    /// Answer one or more questions from retrieved context.
    Ask {
        #[arg(required = true)]
        questions: Vec<String>,
        #[arg(long)]
        n_results: Option<usize>,
        #[arg(long)]
        top_k_ctx: Option<usize>,
        #[command(flatten)]
        filter: FilterArgs,
    },

    /// Print shell completions.
    Completions { shell: Shell },
}

fn init_tracing(verbose: u8, quiet: bool) {
    let filter = if let Ok(env) = std::env::var("RUST_LOG") {
        EnvFilter::new(env)
    } else if quiet {
        EnvFilter::new("warn")
    } else {
        match verbose {
            0 => EnvFilter::new("info"),
            1 => EnvFilter::new("debug"),
            _ => EnvFilter::new("trace"),
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.quiet);

    if let Commands::Completions { shell } = cli.command {
        clap_complete::generate(shell, &mut Cli::command(), "finrag", &mut io::stdout());
        return Ok(());
    }

    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => commands::run_init(&cfg).await?,
        Commands::Index { file, metadata } => {
            commands::run_index(&cfg, &file, metadata.into()).await?
        }
        Commands::Reindex { filename, metadata } => {
            commands::run_reindex(&cfg, &filename, metadata.into()).await?
        }
        Commands::Delete { id } => commands::run_delete(&cfg, &id).await?,
        Commands::Get { id } => commands::run_get(&cfg, &id).await?,
        Commands::Meta { chunk_id, patch } => {
            commands::run_save_metadata(&cfg, &chunk_id, &patch).await?
        }
        Commands::Count => commands::run_count(&cfg).await?,
        Commands::Parents => commands::run_parents(&cfg).await?,
        Commands::Search { query, k, filter } => {
            commands::run_search(&cfg, &query, k, filter.into()).await?
        }
        Commands::Ask {
            questions,
            n_results,
            top_k_ctx,
            filter,
        } => commands::run_ask(&cfg, &questions, n_results, top_k_ctx, filter.into()).await?,
        Commands::Completions { .. } => {}
    }

    Ok(())
}
