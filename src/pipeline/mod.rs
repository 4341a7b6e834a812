//! Concurrent indexing: a pool of workers builds partial indexes, one merge
//! thread links them into the store.
//!
//! Workers pull event files from the [`TaskQueue`] and deposit results in a
//! [`Handoff`] keyed by unit path. The merge thread is the only writer of the
//! store; readers take snapshots through [`SharedStore::read`].

use crate::config::Config;
use crate::db::Db;
use crate::indexer::UnitIndexer;
use crate::indexer::partial::PartialIndex;
use crate::store::SharedStore;
use anyhow::{Result, anyhow};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, info, warn};

pub mod handoff;
pub mod queue;

pub use handoff::{Handoff, Take};
pub use queue::{Priority, TaskQueue};

#[derive(Debug, Clone, Copy)]
pub struct PipelineConfig {
    pub workers: usize,
    /// Longest the merge thread blocks on an empty hand-off before it
    /// re-checks for shutdown.
    pub merge_wait: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        PipelineConfig::from(&Config::default())
    }
}

impl From<&Config> for PipelineConfig {
    fn from(config: &Config) -> Self {
        Self {
            workers: config.workers.max(1),
            merge_wait: Duration::from_millis(config.merge_wait_ms.max(1)),
        }
    }
}

/// What the merge thread does with a unit.
#[derive(Debug)]
enum MergeJob {
    Link(PartialIndex),
    Retract,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PipelineStats {
    pub submitted: u64,
    pub indexed: u64,
    pub failed: u64,
    pub merged: u64,
    pub retracted: u64,
    /// Results overwritten in the hand-off before the merge thread saw them.
    pub superseded: u64,
    /// Submitted work not yet merged, dropped or failed.
    pub pending: u64,
    /// Event files waiting for a worker.
    pub queued: usize,
    /// Results sitting in the hand-off.
    pub awaiting_merge: usize,
}

/// Two event files produced the same unit path; only `kept` was merged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SourceClash {
    pub unit: String,
    pub kept: String,
    pub dropped: String,
}

#[derive(Debug, Default)]
struct Progress {
    stats: Mutex<PipelineStats>,
    idle: Condvar,
    clashes: Mutex<Vec<SourceClash>>,
}

impl Progress {
    fn lock(&self) -> MutexGuard<'_, PipelineStats> {
        self.stats.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn update(&self, apply: impl FnOnce(&mut PipelineStats)) {
        let mut stats = self.lock();
        apply(&mut stats);
        if stats.pending == 0 {
            self.idle.notify_all();
        }
    }

    fn begin(&self) {
        self.update(|stats| {
            stats.submitted += 1;
            stats.pending += 1;
        });
    }

    /// Resolves one unit of pending work.
    fn settle(&self, apply: impl FnOnce(&mut PipelineStats)) {
        self.update(|stats| {
            apply(stats);
            stats.pending = stats.pending.saturating_sub(1);
        });
    }

    fn clash(&self, unit: &str, kept: Option<&str>, dropped: Option<&str>) {
        let (Some(kept), Some(dropped)) = (kept, dropped) else {
            return;
        };
        if kept == dropped {
            return;
        }
        debug!(unit, kept, dropped, "event files share a unit path");
        self.clashes
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(SourceClash {
                unit: unit.to_string(),
                kept: kept.to_string(),
                dropped: dropped.to_string(),
            });
    }

    fn wait_idle(&self) {
        let mut stats = self.lock();
        while stats.pending > 0 {
            stats = self
                .idle
                .wait(stats)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
        }
    }
}

pub struct Pipeline {
    queue: Arc<TaskQueue<PathBuf>>,
    handoff: Arc<Handoff<String, MergeJob>>,
    progress: Arc<Progress>,
    workers: Vec<JoinHandle<()>>,
    merger: Option<JoinHandle<()>>,
}

impl Pipeline {
    /// Spawns the workers and the merge thread. Merged units are written to
    /// `db` when one is given.
    pub fn start(
        config: PipelineConfig,
        store: SharedStore,
        indexer: Arc<dyn UnitIndexer>,
        db: Option<Db>,
    ) -> Result<Self> {
        let queue = Arc::new(TaskQueue::new());
        let handoff = Arc::new(Handoff::new());
        let progress = Arc::new(Progress::default());

        let mut workers = Vec::with_capacity(config.workers);
        for id in 0..config.workers {
            let queue = Arc::clone(&queue);
            let handoff = Arc::clone(&handoff);
            let progress = Arc::clone(&progress);
            let indexer = Arc::clone(&indexer);
            let handle = thread::Builder::new()
                .name(format!("cxref-index-{id}"))
                .spawn(move || run_worker(&queue, &handoff, &progress, indexer.as_ref()))
                .map_err(|err| anyhow!("spawn indexing worker: {err}"))?;
            workers.push(handle);
        }

        let merger = {
            let handoff = Arc::clone(&handoff);
            let progress = Arc::clone(&progress);
            let merge_wait = config.merge_wait;
            thread::Builder::new()
                .name("cxref-merge".to_string())
                .spawn(move || run_merger(&handoff, &progress, &store, db, merge_wait))
                .map_err(|err| anyhow!("spawn merge thread: {err}"))?
        };

        debug!(workers = config.workers, "pipeline started");
        Ok(Self {
            queue,
            handoff,
            progress,
            workers,
            merger: Some(merger),
        })
    }

    /// Queues an event file for indexing. Returns `false` when it was already
    /// waiting.
    pub fn submit(&self, path: PathBuf, priority: Priority) -> bool {
        self.progress.begin();
        let queued = self.queue.push(path, priority);
        if !queued {
            self.progress.settle(|_| {});
        }
        queued
    }

    /// Asks the merge thread to remove a unit. Overrides any result for the
    /// same unit still waiting in the hand-off.
    pub fn retract(&self, unit: String) {
        self.progress.begin();
        if self.handoff.deposit(unit, MergeJob::Retract).is_some() {
            self.progress.settle(|stats| stats.superseded += 1);
        }
    }

    /// Blocks until every submitted task has been merged, dropped or failed.
    pub fn wait_idle(&self) {
        self.progress.wait_idle();
    }

    pub fn stats(&self) -> PipelineStats {
        let mut stats = *self.progress.lock();
        stats.queued = self.queue.len();
        stats.awaiting_merge = self.handoff.len();
        stats
    }

    /// Drains the unit path clashes seen since the last call. A clash is also
    /// reported when an event file was renamed.
    pub fn take_clashes(&self) -> Vec<SourceClash> {
        std::mem::take(
            &mut *self
                .progress
                .clashes
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner()),
        )
    }

    /// Drains outstanding work and joins every thread.
    pub fn shutdown(mut self) -> Result<()> {
        self.stop()
    }

    fn stop(&mut self) -> Result<()> {
        self.queue.close();
        let mut panicked = 0;
        for handle in self.workers.drain(..) {
            if handle.join().is_err() {
                panicked += 1;
            }
        }
        self.handoff.close();
        if let Some(merger) = self.merger.take() {
            if merger.join().is_err() {
                panicked += 1;
            }
        }
        if panicked > 0 {
            return Err(anyhow!("{panicked} pipeline thread(s) panicked"));
        }
        Ok(())
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        if let Err(err) = self.stop() {
            warn!("pipeline shutdown: {err:#}");
        }
    }
}

fn run_worker(
    queue: &TaskQueue<PathBuf>,
    handoff: &Handoff<String, MergeJob>,
    progress: &Progress,
    indexer: &dyn UnitIndexer,
) {
    while let Some(path) = queue.pop() {
        match indexer.index_unit(&path) {
            Ok(index) => {
                let unit = index.path.clone();
                let source = index.source.clone();
                debug!(unit = %unit, source = %path.display(), "indexed unit");
                let replaced = handoff.deposit(unit.clone(), MergeJob::Link(index));
                progress.update(|stats| stats.indexed += 1);
                if let Some(replaced) = replaced {
                    if let MergeJob::Link(old) = &replaced {
                        progress.clash(&unit, source.as_deref(), old.source.as_deref());
                    }
                    progress.settle(|stats| stats.superseded += 1);
                }
            }
            Err(err) => {
                warn!(source = %path.display(), "indexing failed: {err:#}");
                progress.settle(|stats| stats.failed += 1);
            }
        }
    }
}

fn run_merger(
    handoff: &Handoff<String, MergeJob>,
    progress: &Progress,
    store: &SharedStore,
    db: Option<Db>,
    merge_wait: Duration,
) {
    loop {
        let (unit, job) = match handoff.take_timeout(merge_wait) {
            Take::Item(unit, job) => (unit, job),
            Take::TimedOut => continue,
            Take::Closed => break,
        };
        match job {
            MergeJob::Link(index) => {
                let source = index.source.clone();
                let stats = store.write().link(index);
                progress.clash(
                    &unit,
                    source.as_deref(),
                    stats.previous_source.as_deref(),
                );
                if let Some(db) = db.as_ref() {
                    for other in &stats.displaced {
                        if let Err(err) = db.delete_unit(other) {
                            warn!(unit = %other, "delete unit: {err:#}");
                        }
                    }
                    let snapshot = store.read();
                    if let Some(record) = snapshot.unit(&unit) {
                        if let Err(err) = db.save_unit(&record.index, record.pass) {
                            warn!(unit = %unit, "persist unit: {err:#}");
                        }
                    }
                }
                info!(
                    unit = %unit,
                    pass = stats.pass,
                    entities = stats.entities,
                    conflicts = stats.conflicts,
                    displaced = stats.displaced.len(),
                    "merged unit"
                );
                progress.settle(|stats| stats.merged += 1);
            }
            MergeJob::Retract => {
                let removed = store.write().remove_unit(&unit);
                if let Some(db) = db.as_ref() {
                    if let Err(err) = db.delete_unit(&unit) {
                        warn!(unit = %unit, "delete unit: {err:#}");
                    }
                }
                info!(unit = %unit, removed, "retracted unit");
                progress.settle(|stats| stats.retracted += 1);
            }
        }
    }
    debug!("merge thread stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::EntityStore;
    use std::path::Path;
    use std::time::Instant;

    /// Builds units from task names of the form `unit#marker`.
    struct NamedUnits;

    impl UnitIndexer for NamedUnits {
        fn index_unit(&self, path: &Path) -> Result<PartialIndex> {
            let name = path.to_string_lossy().into_owned();
            if name.starts_with("fail") {
                return Err(anyhow!("cannot index {name}"));
            }
            let (unit, marker) = name.split_once('#').unwrap_or((name.as_str(), "0"));
            let mut index = PartialIndex::new(unit);
            let marker: u64 = marker.parse()?;
            index.to_var(1000 + marker);
            index.source = Some(name);
            Ok(index)
        }
    }

    fn start(workers: usize, store: &SharedStore) -> Pipeline {
        let config = PipelineConfig {
            workers,
            merge_wait: Duration::from_millis(5),
        };
        Pipeline::start(config, store.clone(), Arc::new(NamedUnits), None).unwrap()
    }

    fn wait_for(mut done: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !done() {
            assert!(Instant::now() < deadline, "timed out waiting");
            thread::sleep(Duration::from_millis(2));
        }
    }

    #[test]
    fn submitted_units_are_merged() {
        let store = SharedStore::new(EntityStore::new());
        let pipeline = start(3, &store);
        for unit in ["a.cc#1", "b.cc#2", "c.cc#3", "fail.cc"] {
            pipeline.submit(PathBuf::from(unit), Priority::Background);
        }
        pipeline.wait_idle();
        let stats = pipeline.stats();
        assert_eq!(stats.merged, 3);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.pending, 0);
        assert_eq!(store.read().unit_count(), 3);
        pipeline.shutdown().unwrap();
    }

    #[test]
    fn only_latest_undelivered_result_is_merged() {
        let store = SharedStore::new(EntityStore::new());
        let pipeline = start(1, &store);

        let guard = store.write();
        pipeline.submit(PathBuf::from("warm.cc#0"), Priority::Background);
        // The merge thread takes the first result and blocks on the store.
        wait_for(|| pipeline.stats().indexed == 1 && pipeline.stats().awaiting_merge == 0);
        pipeline.submit(PathBuf::from("x.cc#1"), Priority::Background);
        wait_for(|| pipeline.stats().indexed == 2);
        pipeline.submit(PathBuf::from("x.cc#2"), Priority::Background);
        wait_for(|| pipeline.stats().indexed == 3);
        assert_eq!(pipeline.stats().awaiting_merge, 1);
        drop(guard);

        pipeline.wait_idle();
        let stats = pipeline.stats();
        assert_eq!(stats.superseded, 1);
        assert_eq!(stats.merged, 2);
        let snapshot = store.read();
        assert!(snapshot.entity(1002).is_some());
        assert!(snapshot.entity(1001).is_none());
        assert_eq!(snapshot.unit("x.cc").map(|record| record.pass), Some(2));
        assert_eq!(
            pipeline.take_clashes(),
            vec![SourceClash {
                unit: "x.cc".to_string(),
                kept: "x.cc#2".to_string(),
                dropped: "x.cc#1".to_string(),
            }]
        );
    }

    #[test]
    fn second_file_for_a_merged_unit_is_reported() {
        let store = SharedStore::new(EntityStore::new());
        let pipeline = start(2, &store);
        pipeline.submit(PathBuf::from("x.cc#1"), Priority::Background);
        pipeline.wait_idle();
        pipeline.submit(PathBuf::from("x.cc#1"), Priority::Background);
        pipeline.wait_idle();
        assert!(pipeline.take_clashes().is_empty());

        pipeline.submit(PathBuf::from("x.cc#2"), Priority::Background);
        pipeline.wait_idle();
        let clashes = pipeline.take_clashes();
        assert_eq!(clashes.len(), 1);
        assert_eq!(clashes[0].kept, "x.cc#2");
        assert_eq!(clashes[0].dropped, "x.cc#1");
        assert!(pipeline.take_clashes().is_empty());
        assert_eq!(store.read().unit_count(), 1);
    }

    #[test]
    fn retract_removes_merged_unit() {
        let store = SharedStore::new(EntityStore::new());
        let pipeline = start(2, &store);
        pipeline.submit(PathBuf::from("a.cc#5"), Priority::Interactive);
        pipeline.wait_idle();
        assert!(store.read().entity(1005).is_some());
        pipeline.retract("a.cc".to_string());
        pipeline.wait_idle();
        assert!(store.read().entity(1005).is_none());
        assert_eq!(pipeline.stats().retracted, 1);
    }
}
