use crate::error::KindConflict;
use crate::indexer::event::Include;
use crate::model::{
    CallRef, EntityCommon, FileId, FuncEntity, Kind, Loc, TypeEntity, Usr, VarEntity,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

/// Output of indexing one translation unit. Immutable once the builder hands it
/// over; the linker only ever reads it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PartialIndex {
    /// Translation unit path; the key re-indexing replaces results under.
    pub path: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub language: Option<String>,
    /// Event file the unit was read from, with its content hash.
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub source_hash: Option<String>,
    /// Local file table. Every `Loc::file` in this index points into it.
    pub files: Vec<String>,
    pub includes: Vec<Include>,
    pub skipped_ranges: Vec<Loc>,
    pub types: BTreeMap<Usr, TypeEntity>,
    pub funcs: BTreeMap<Usr, FuncEntity>,
    pub vars: BTreeMap<Usr, VarEntity>,
    pub conflicts: Vec<KindConflict>,
    pub malformed_events: usize,
    #[serde(skip)]
    file_lookup: FileLookup,
}

/// Cache derived from `files`; ignored by equality and serialization.
#[derive(Debug, Clone, Default)]
struct FileLookup(HashMap<String, FileId>);

impl PartialEq for FileLookup {
    fn eq(&self, _other: &Self) -> bool {
        true
    }
}

impl PartialIndex {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            ..Default::default()
        }
    }

    pub fn file_id(&mut self, path: &str) -> FileId {
        if let Some(id) = self.file_lookup.0.get(path) {
            return *id;
        }
        let id = match self.files.iter().position(|existing| existing == path) {
            Some(pos) => pos as FileId,
            None => {
                self.files.push(path.to_string());
                (self.files.len() - 1) as FileId
            }
        };
        self.file_lookup.0.insert(path.to_string(), id);
        id
    }

    pub fn file_path(&self, id: FileId) -> Option<&str> {
        self.files.get(id as usize).map(String::as_str)
    }

    pub fn kind_of(&self, usr: Usr) -> Option<Kind> {
        if self.types.contains_key(&usr) {
            Some(Kind::Type)
        } else if self.funcs.contains_key(&usr) {
            Some(Kind::Func)
        } else if self.vars.contains_key(&usr) {
            Some(Kind::Var)
        } else {
            None
        }
    }

    pub fn common(&self, usr: Usr) -> Option<&EntityCommon> {
        self.types
            .get(&usr)
            .map(|entity| &entity.common)
            .or_else(|| self.funcs.get(&usr).map(|entity| &entity.common))
            .or_else(|| self.vars.get(&usr).map(|entity| &entity.common))
    }

    pub fn to_type(&mut self, usr: Usr) -> &mut TypeEntity {
        self.types
            .entry(usr)
            .or_insert_with(|| TypeEntity::new(usr))
    }

    pub fn to_func(&mut self, usr: Usr) -> &mut FuncEntity {
        self.funcs
            .entry(usr)
            .or_insert_with(|| FuncEntity::new(usr))
    }

    pub fn to_var(&mut self, usr: Usr) -> &mut VarEntity {
        self.vars.entry(usr).or_insert_with(|| VarEntity::new(usr))
    }

    pub fn common_mut(&mut self, kind: Kind, usr: Usr) -> &mut EntityCommon {
        match kind {
            Kind::Type => &mut self.to_type(usr).common,
            Kind::Func => &mut self.to_func(usr).common,
            Kind::Var => &mut self.to_var(usr).common,
        }
    }

    /// Every usr this unit says something about, with its kind.
    pub fn usrs(&self) -> impl Iterator<Item = (Kind, Usr)> + '_ {
        self.types
            .keys()
            .map(|usr| (Kind::Type, *usr))
            .chain(self.funcs.keys().map(|usr| (Kind::Func, *usr)))
            .chain(self.vars.keys().map(|usr| (Kind::Var, *usr)))
    }

    pub fn entity_count(&self) -> usize {
        self.types.len() + self.funcs.len() + self.vars.len()
    }

    pub fn remove(&mut self, kind: Kind, usr: Usr) {
        match kind {
            Kind::Type => {
                self.types.remove(&usr);
            }
            Kind::Func => {
                self.funcs.remove(&usr);
            }
            Kind::Var => {
                self.vars.remove(&usr);
            }
        }
    }
}

pub(crate) fn push_unique<T: PartialEq>(list: &mut Vec<T>, value: T) -> bool {
    if list.contains(&value) {
        return false;
    }
    list.push(value);
    true
}

/// Adds a call edge endpoint unless one with the same target and span exists.
pub(crate) fn push_call(list: &mut Vec<CallRef>, call: CallRef) -> bool {
    if list
        .iter()
        .any(|existing| existing.usr == call.usr && existing.loc == call.loc)
    {
        return false;
    }
    list.push(call);
    true
}

fn remap_loc(loc: &mut Loc, map: &[FileId]) {
    if let Some(mapped) = map.get(loc.file as usize) {
        loc.file = *mapped;
    }
}

/// Rewrites every file id inside an entity through `map`.
pub(crate) fn remap_common(common: &mut EntityCommon, map: &[FileId]) {
    for decl in common
        .spell
        .iter_mut()
        .chain(common.decl.iter_mut())
        .chain(common.declarations.iter_mut())
    {
        remap_loc(&mut decl.loc, map);
    }
    for use_ in common.uses.iter_mut() {
        remap_loc(&mut use_.loc, map);
    }
}

pub(crate) fn remap_calls(calls: &mut [CallRef], map: &[FileId]) {
    for call in calls {
        remap_loc(&mut call.loc, map);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Role, Use};

    #[test]
    fn file_ids_are_interned() {
        let mut index = PartialIndex::new("a.cc");
        let a = index.file_id("a.cc");
        let h = index.file_id("a.h");
        assert_eq!(index.file_id("a.cc"), a);
        assert_ne!(a, h);
        assert_eq!(index.file_path(h), Some("a.h"));
        assert_eq!(index.files.len(), 2);
    }

    #[test]
    fn kind_lookup_follows_maps() {
        let mut index = PartialIndex::new("a.cc");
        index.to_type(1);
        index.to_func(2);
        index.to_var(3);
        assert_eq!(index.kind_of(1), Some(Kind::Type));
        assert_eq!(index.kind_of(2), Some(Kind::Func));
        assert_eq!(index.kind_of(3), Some(Kind::Var));
        assert_eq!(index.kind_of(4), None);
        assert_eq!(index.entity_count(), 3);
    }

    #[test]
    fn serialized_index_round_trips() {
        let mut index = PartialIndex::new("a.cc");
        let file = index.file_id("a.cc");
        let var = index.to_var(9);
        var.enum_value = Some(20);
        var.common.uses.push(Use {
            loc: Loc::new(file, "2:1-2:2".parse().unwrap()),
            role: Role::READ,
            folded: true,
        });
        let json = serde_json::to_string(&index).unwrap();
        let decoded: PartialIndex = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded, index);
    }
}
