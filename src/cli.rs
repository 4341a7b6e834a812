use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "cxref",
    version,
    about = "C/C++ cross-reference index built from per-unit event files",
    after_help = r#"Examples:
  cxref index --root .
  cxref reindex --root . --unit src/widget.cc
  cxref request --method find_symbol --params '{"query":"Widget","limit":10}'
  cxref request --method callers --params '{"usr":"c:@F@main#"}'
  cxref request --method uses --params '{"usr":"c:@S@Widget","roles":["call"]}'
  cxref overview --root .
  cxref serve --root .
"#
)]
pub struct Args {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Index every changed event file under the root and exit.
    Index {
        #[arg(long, default_value = ".")]
        root: PathBuf,
        #[arg(long)]
        db: Option<PathBuf>,
        /// Include files ignored by .gitignore.
        #[arg(long)]
        no_ignore: bool,
        /// Indexing worker threads (overrides CXREF_WORKERS).
        #[arg(long)]
        workers: Option<usize>,
    },
    /// Re-index one translation unit and exit.
    Reindex {
        #[arg(long, default_value = ".")]
        root: PathBuf,
        #[arg(long)]
        db: Option<PathBuf>,
        /// Unit path, or the event file it was read from.
        #[arg(long)]
        unit: String,
    },
    /// Print index counts.
    Overview {
        #[arg(long, default_value = ".")]
        root: PathBuf,
        #[arg(long)]
        db: Option<PathBuf>,
    },
    /// Run a single JSONL request and exit.
    Request {
        #[arg(long, default_value = ".")]
        root: PathBuf,
        #[arg(long)]
        db: Option<PathBuf>,
        #[arg(long)]
        method: String,
        #[arg(long, default_value = "{}")]
        params: String,
        #[arg(long, value_name = "PATH")]
        params_file: Option<PathBuf>,
        #[arg(long, default_value = "1")]
        id: String,
    },
    /// Run JSONL RPC server over stdin/stdout.
    Serve {
        #[arg(long, default_value = ".")]
        root: PathBuf,
        #[arg(long)]
        db: Option<PathBuf>,
        /// Include files ignored by .gitignore.
        #[arg(long)]
        no_ignore: bool,
    },
}
