//! The canonical, cross-unit entity store.
//!
//! Entities live in one arena addressed through `usr2idx`. Every unit that
//! mentioned a usr is remembered as a contributor, so the entity can be rebuilt
//! from the remaining contributors when a unit is re-indexed or removed.

use crate::error::KindConflict;
use crate::indexer::partial::PartialIndex;
use crate::model::{Entity, FileId, FuncEntity, Kind, TypeEntity, Usr, VarEntity};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

pub mod linker;

pub use linker::LinkStats;

/// A merged unit, kept in its own file-id space.
#[derive(Debug, Clone)]
pub struct UnitRecord {
    pub pass: u64,
    pub index: PartialIndex,
    /// Local file id to store file id.
    pub file_map: Vec<FileId>,
}

/// A kind conflict found while linking, with the unit that caused it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UnitConflict {
    pub unit: String,
    #[serde(flatten)]
    pub conflict: KindConflict,
}

#[derive(Debug, Default)]
pub struct EntityStore {
    files: Vec<String>,
    path2file: HashMap<String, FileId>,
    units: HashMap<String, UnitRecord>,
    entities: Vec<Entity>,
    usr2idx: HashMap<Usr, usize>,
    contributors: HashMap<Usr, Vec<String>>,
    conflicts: Vec<UnitConflict>,
    next_pass: u64,
}

impl EntityStore {
    pub fn new() -> Self {
        Self {
            next_pass: 1,
            ..Default::default()
        }
    }

    pub(crate) fn intern_file(&mut self, path: &str) -> FileId {
        if let Some(id) = self.path2file.get(path) {
            return *id;
        }
        let id = self.files.len() as FileId;
        self.files.push(path.to_string());
        self.path2file.insert(path.to_string(), id);
        id
    }

    pub fn file_path(&self, id: FileId) -> Option<&str> {
        self.files.get(id as usize).map(String::as_str)
    }

    pub fn file_id(&self, path: &str) -> Option<FileId> {
        self.path2file.get(path).copied()
    }

    pub fn files(&self) -> &[String] {
        &self.files
    }

    pub fn entity(&self, usr: Usr) -> Option<&Entity> {
        self.usr2idx.get(&usr).map(|idx| &self.entities[*idx])
    }

    pub fn get_type(&self, usr: Usr) -> Option<&TypeEntity> {
        self.entity(usr).and_then(Entity::as_type)
    }

    pub fn get_func(&self, usr: Usr) -> Option<&FuncEntity> {
        self.entity(usr).and_then(Entity::as_func)
    }

    pub fn get_var(&self, usr: Usr) -> Option<&VarEntity> {
        self.entity(usr).and_then(Entity::as_var)
    }

    pub fn kind_of(&self, usr: Usr) -> Option<Kind> {
        self.entity(usr).map(Entity::kind)
    }

    pub fn entities(&self) -> impl Iterator<Item = &Entity> {
        self.entities.iter()
    }

    pub fn entity_count(&self) -> usize {
        self.entities.len()
    }

    pub fn count_by_kind(&self, kind: Kind) -> usize {
        self.entities
            .iter()
            .filter(|entity| entity.kind() == kind)
            .count()
    }

    pub fn unit(&self, path: &str) -> Option<&UnitRecord> {
        self.units.get(path)
    }

    pub fn unit_by_source(&self, source: &str) -> Option<&UnitRecord> {
        self.units
            .values()
            .find(|record| record.index.source.as_deref() == Some(source))
    }

    pub fn unit_count(&self) -> usize {
        self.units.len()
    }

    /// Merged units ordered by pass.
    pub fn units(&self) -> Vec<&UnitRecord> {
        let mut units: Vec<&UnitRecord> = self.units.values().collect();
        units.sort_by_key(|record| record.pass);
        units
    }

    /// `(unit path, event file, content hash)` of every merged unit.
    pub fn unit_sources(&self) -> Vec<(String, String, Option<String>)> {
        self.units()
            .into_iter()
            .filter_map(|record| {
                let source = record.index.source.clone()?;
                Some((
                    record.index.path.clone(),
                    source,
                    record.index.source_hash.clone(),
                ))
            })
            .collect()
    }

    /// Units that contributed to `usr`, in pass order.
    pub fn contributors(&self, usr: Usr) -> Vec<&str> {
        let mut records: Vec<&UnitRecord> = self
            .contributors
            .get(&usr)
            .into_iter()
            .flatten()
            .filter_map(|path| self.units.get(path))
            .collect();
        records.sort_by_key(|record| record.pass);
        records
            .into_iter()
            .map(|record| record.index.path.as_str())
            .collect()
    }

    pub fn conflicts(&self) -> &[UnitConflict] {
        &self.conflicts
    }

    pub fn last_pass(&self) -> u64 {
        self.next_pass.saturating_sub(1)
    }

    fn put_entity(&mut self, entity: Entity) {
        let usr = entity.usr();
        match self.usr2idx.get(&usr) {
            Some(idx) => self.entities[*idx] = entity,
            None => {
                self.usr2idx.insert(usr, self.entities.len());
                self.entities.push(entity);
            }
        }
    }

    fn drop_entity(&mut self, usr: Usr) {
        let Some(idx) = self.usr2idx.remove(&usr) else {
            return;
        };
        self.entities.swap_remove(idx);
        if let Some(moved) = self.entities.get(idx) {
            self.usr2idx.insert(moved.usr(), idx);
        }
    }
}

/// The store shared between the merge thread and readers.
#[derive(Debug, Clone, Default)]
pub struct SharedStore(Arc<RwLock<EntityStore>>);

impl SharedStore {
    pub fn new(store: EntityStore) -> Self {
        Self(Arc::new(RwLock::new(store)))
    }

    /// A consistent snapshot for the lifetime of the guard.
    pub fn read(&self) -> RwLockReadGuard<'_, EntityStore> {
        self.0.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub(crate) fn write(&self) -> RwLockWriteGuard<'_, EntityStore> {
        self.0.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn files_are_interned_once() {
        let mut store = EntityStore::new();
        let a = store.intern_file("a.h");
        let b = store.intern_file("b.h");
        assert_eq!(store.intern_file("a.h"), a);
        assert_ne!(a, b);
        assert_eq!(store.file_path(b), Some("b.h"));
        assert_eq!(store.file_id("a.h"), Some(a));
    }

    #[test]
    fn dropping_an_entity_keeps_the_arena_addressable() {
        let mut store = EntityStore::new();
        store.put_entity(Entity::new(Kind::Type, 1));
        store.put_entity(Entity::new(Kind::Func, 2));
        store.put_entity(Entity::new(Kind::Var, 3));
        store.drop_entity(1);
        assert!(store.entity(1).is_none());
        assert_eq!(store.kind_of(2), Some(Kind::Func));
        assert_eq!(store.kind_of(3), Some(Kind::Var));
        assert_eq!(store.entity_count(), 2);
    }
}
