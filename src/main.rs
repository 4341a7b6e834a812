use anyhow::Result;
use clap::Parser;
use cxref::config::Config;
use cxref::{cli, db, indexer, query, rpc};
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

fn default_db_path(root: &Path) -> PathBuf {
    root.join(".cxref").join("cxref.sqlite")
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn main() -> Result<()> {
    init_logging();
    let args = cli::Args::parse();

    match args.command {
        cli::Command::Index {
            root,
            db,
            no_ignore,
            workers,
        } => {
            let db_path = db.unwrap_or_else(|| default_db_path(&root));
            let mut config = Config::get().clone();
            if let Some(workers) = workers {
                config.workers = workers.max(1);
            }
            let mut indexer = indexer::Indexer::with_config(root, db_path, &config)?
                .with_scan_options(indexer::scan::ScanOptions::new(no_ignore));
            let stats = indexer.reindex()?;
            println!("{}", serde_json::to_string_pretty(&stats)?);
            indexer.shutdown()
        }
        cli::Command::Reindex { root, db, unit } => {
            let db_path = db.unwrap_or_else(|| default_db_path(&root));
            let mut indexer = indexer::Indexer::new(root, db_path)?;
            let pass = indexer.reindex_unit(&unit)?;
            println!(
                "{}",
                serde_json::to_string_pretty(&serde_json::json!({ "unit": unit, "pass": pass }))?
            );
            indexer.shutdown()
        }
        cli::Command::Overview { root, db } => {
            let db_path = db.unwrap_or_else(|| default_db_path(&root));
            let db = db::Db::open(&db_path)?;
            let mut store = cxref::store::EntityStore::new();
            for (pass, index) in db.load_units()? {
                store.link_with_pass(index, pass);
            }
            let overview = query::overview(&store);
            println!("{}", serde_json::to_string_pretty(&overview)?);
            Ok(())
        }
        cli::Command::Request {
            root,
            db,
            method,
            params,
            params_file,
            id,
        } => {
            let db_path = db.unwrap_or_else(|| default_db_path(&root));
            let params_raw = if let Some(path) = params_file {
                cxref::util::read_to_string(&path)?
            } else {
                params
            };
            let response = rpc::call(root, db_path, method, &params_raw, &id)?;
            println!("{response}");
            Ok(())
        }
        cli::Command::Serve {
            root,
            db,
            no_ignore,
        } => {
            let db_path = db.unwrap_or_else(|| default_db_path(&root));
            rpc::serve(root, db_path, indexer::scan::ScanOptions::new(no_ignore))
        }
    }
}
