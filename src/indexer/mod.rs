use crate::config::Config;
use crate::db::Db;
use crate::indexer::partial::PartialIndex;
use crate::pipeline::{Pipeline, PipelineConfig, Priority};
use crate::store::{EntityStore, SharedStore};
use crate::util;
use anyhow::{Context, Result};
use serde::Serialize;
use std::collections::HashMap;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

pub mod builder;
pub mod event;
pub mod fold;
pub mod partial;
pub mod scan;
pub mod stable_id;

/// Produces the partial index of one translation unit. Implementations run on
/// worker threads and must not touch shared mutable state.
pub trait UnitIndexer: Send + Sync {
    fn index_unit(&self, path: &Path) -> Result<PartialIndex>;
}

/// Indexes units from event files written by the analysis front end.
#[derive(Debug, Clone)]
pub struct EventFileIndexer {
    root: PathBuf,
}

impl EventFileIndexer {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl UnitIndexer for EventFileIndexer {
    fn index_unit(&self, path: &Path) -> Result<PartialIndex> {
        let abs = if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.root.join(path)
        };
        let source = util::normalize_rel_path(&self.root, &abs)
            .unwrap_or_else(|_| util::normalize_path(&abs));
        let hash = scan::hash_file(&abs).with_context(|| format!("hash {}", abs.display()))?;
        let file = File::open(&abs).with_context(|| format!("open {}", abs.display()))?;

        let mut builder = builder::IndexBuilder::new(default_unit_path(&source));
        builder
            .read_events(BufReader::new(file))
            .with_context(|| format!("read events from {}", abs.display()))?;
        let mut index = builder.finish();
        index.source = Some(source);
        index.source_hash = Some(hash);
        Ok(index)
    }
}

/// Unit path used when an event file carries no unit header: the file name
/// with its event extension removed.
fn default_unit_path(source: &str) -> String {
    for ext in scan::EVENT_EXTENSIONS {
        if let Some(stripped) = source.strip_suffix(&format!(".{ext}")) {
            return stripped.to_string();
        }
    }
    source.to_string()
}

#[derive(Debug, Default, Serialize)]
pub struct IndexStats {
    pub scanned: usize,
    pub indexed: usize,
    pub skipped: usize,
    pub removed: usize,
    pub errors: usize,
    /// Event files whose unit path is already claimed by another event file.
    pub duplicates: usize,
    pub units: usize,
    pub entities: usize,
    pub conflicts: usize,
    pub duration_ms: u128,
}

/// Ties the store, the indexing pipeline and the on-disk snapshot together
/// for one directory of event files.
pub struct Indexer {
    root: PathBuf,
    store: SharedStore,
    pipeline: Pipeline,
    scan_options: scan::ScanOptions,
    /// Event files that lost their unit to another file: source to the unit
    /// path and the content hash they had then.
    shadowed: HashMap<String, (String, String)>,
}

impl Indexer {
    pub fn new(root: PathBuf, db_path: PathBuf) -> Result<Self> {
        Self::with_config(root, db_path, Config::get())
    }

    pub fn with_config(root: PathBuf, db_path: PathBuf, config: &Config) -> Result<Self> {
        let root = std::fs::canonicalize(&root).unwrap_or(root);
        let db = Db::open(&db_path)?;
        let mut store = EntityStore::new();
        let loaded = db.load_units()?;
        let replayed = loaded.len();
        for (pass, index) in loaded {
            store.link_with_pass(index, pass);
        }
        if replayed > 0 {
            info!(units = replayed, entities = store.entity_count(), "loaded snapshot");
        }
        let store = SharedStore::new(store);
        let pipeline = Pipeline::start(
            PipelineConfig::from(config),
            store.clone(),
            Arc::new(EventFileIndexer::new(root.clone())),
            Some(db),
        )?;
        Ok(Self {
            root,
            store,
            pipeline,
            scan_options: scan::ScanOptions::default(),
            shadowed: HashMap::new(),
        })
    }

    pub fn with_scan_options(mut self, options: scan::ScanOptions) -> Self {
        self.scan_options = options;
        self
    }

    pub fn store(&self) -> &SharedStore {
        &self.store
    }

    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    /// Indexes every changed event file under the root and retracts units
    /// whose event file disappeared. Blocks until everything is merged.
    pub fn reindex(&mut self) -> Result<IndexStats> {
        let start = Instant::now();
        let scanned = scan::scan_events_with_options(&self.root, self.scan_options)?;
        let mut stats = IndexStats {
            scanned: scanned.len(),
            ..Default::default()
        };
        let before = self.pipeline.stats();

        let seen: HashMap<&str, &str> = scanned
            .iter()
            .map(|file| (file.rel_path.as_str(), file.hash.as_str()))
            .collect();
        let known = self.store.read().unit_sources();
        // Retractions go first so a unit whose event file was renamed is
        // relinked from the new file.
        for (unit, source, _) in &known {
            if !seen.contains_key(source.as_str()) {
                self.pipeline.retract(unit.clone());
                self.shadowed.retain(|_, (shadowed, _)| shadowed != unit);
                stats.removed += 1;
            }
        }
        self.shadowed
            .retain(|source, _| seen.contains_key(source.as_str()));
        for file in &scanned {
            let unchanged = known.iter().any(|(_, source, hash)| {
                source == &file.rel_path && hash.as_deref() == Some(file.hash.as_str())
            }) || self
                .shadowed
                .get(&file.rel_path)
                .is_some_and(|(_, hash)| hash == &file.hash);
            if unchanged {
                debug!(source = %file.rel_path, "unchanged, skipping");
                stats.skipped += 1;
                continue;
            }
            self.shadowed.remove(&file.rel_path);
            self.pipeline
                .submit(PathBuf::from(&file.rel_path), Priority::Background);
            stats.indexed += 1;
        }
        self.pipeline.wait_idle();

        for clash in self.pipeline.take_clashes() {
            let Some(hash) = seen.get(clash.dropped.as_str()) else {
                continue;
            };
            warn!(
                unit = %clash.unit,
                kept = %clash.kept,
                dropped = %clash.dropped,
                "two event files declare the same unit, keeping the later one"
            );
            self.shadowed
                .insert(clash.dropped, (clash.unit, hash.to_string()));
            stats.duplicates += 1;
        }

        let after = self.pipeline.stats();
        stats.errors = after.failed.saturating_sub(before.failed) as usize;
        let store = self.store.read();
        stats.units = store.unit_count();
        stats.entities = store.entity_count();
        stats.conflicts = store.conflicts().len();
        stats.duration_ms = start.elapsed().as_millis();
        info!(
            indexed = stats.indexed,
            skipped = stats.skipped,
            removed = stats.removed,
            errors = stats.errors,
            duplicates = stats.duplicates,
            "reindex finished"
        );
        Ok(stats)
    }

    /// Re-indexes one unit on the interactive lane, identified either by its
    /// unit path or by its event file, and waits for the merge.
    pub fn reindex_unit(&mut self, unit: &str) -> Result<Option<u64>> {
        let source = {
            let store = self.store.read();
            store
                .unit(unit)
                .and_then(|record| record.index.source.clone())
                .unwrap_or_else(|| unit.to_string())
        };
        let abs = self.root.join(&source);
        let Some(file) = scan::scan_path(&self.root, &abs)? else {
            anyhow::bail!("no event file for unit {unit}");
        };
        self.pipeline
            .submit(PathBuf::from(&file.rel_path), Priority::Interactive);
        self.pipeline.wait_idle();
        let store = self.store.read();
        let pass = store
            .unit(unit)
            .or_else(|| store.unit_by_source(&source))
            .map(|record| record.pass);
        Ok(pass)
    }

    pub fn shutdown(self) -> Result<()> {
        self.pipeline.shutdown()
    }
}
