//! Merges partial indexes into the [`EntityStore`].
//!
//! A unit's contribution is kept verbatim. Linking first retracts whatever the
//! unit contributed before, then rebuilds every touched entity from all of its
//! remaining contributors in pass order. Later passes win canonical fields;
//! records identical across units collapse into one.

use super::{EntityStore, UnitConflict, UnitRecord};
use crate::error::KindConflict;
use crate::indexer::partial::{PartialIndex, push_call, push_unique, remap_calls, remap_common};
use crate::model::{Entity, EntityCommon, FileId, Kind, Loc, Role, Usr};
use serde::Serialize;
use std::collections::{BTreeSet, HashSet};
use tracing::{debug, warn};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LinkStats {
    pub unit: String,
    pub pass: u64,
    pub entities: usize,
    pub files: usize,
    pub conflicts: usize,
    pub retracted: bool,
    /// Event file of the record this unit replaced, when it was a different
    /// file.
    pub previous_source: Option<String>,
    /// Other units produced earlier by the same event file, now removed.
    pub displaced: Vec<String>,
}

impl EntityStore {
    /// Merges `index` under a fresh pass id.
    pub fn link(&mut self, index: PartialIndex) -> LinkStats {
        let pass = self.next_pass;
        self.link_with_pass(index, pass)
    }

    /// Merges `index` under a known pass id, as when replaying a snapshot.
    pub fn link_with_pass(&mut self, mut index: PartialIndex, pass: u64) -> LinkStats {
        self.next_pass = self.next_pass.max(pass + 1);
        let unit = index.path.clone();
        let mut touched: BTreeSet<Usr> = BTreeSet::new();
        let previous_source = self
            .units
            .get(&unit)
            .and_then(|record| record.index.source.clone())
            .filter(|source| index.source.as_deref() != Some(source.as_str()));
        let retracted = match self.retract(&unit) {
            Some(old) => {
                touched.extend(old);
                true
            }
            None => false,
        };
        let displaced = self.units_from_source(index.source.as_deref());
        for other in &displaced {
            if let Some(old) = self.retract(other) {
                touched.extend(old);
            }
        }

        let file_map: Vec<FileId> = index
            .files
            .iter()
            .map(|path| self.intern_file(path))
            .collect();

        let mut conflicts = 0;
        let incoming: Vec<(Kind, Usr)> = index.usrs().collect();
        for (kind, usr) in incoming {
            // Only other units' records count; this unit's old ones are gone.
            let existing = if self.contributors.contains_key(&usr) {
                self.kind_of(usr)
            } else {
                None
            };
            if let Some(existing) = existing {
                if existing != kind {
                    let conflict = KindConflict {
                        usr,
                        existing,
                        incoming: kind,
                    };
                    warn!(
                        unit = %unit,
                        usr,
                        %existing,
                        incoming = %kind,
                        "kind conflict while linking, keeping earlier record"
                    );
                    self.conflicts.push(UnitConflict {
                        unit: unit.clone(),
                        conflict,
                    });
                    index.remove(kind, usr);
                    conflicts += 1;
                    continue;
                }
            }
            let units = self.contributors.entry(usr).or_default();
            if !units.contains(&unit) {
                units.push(unit.clone());
            }
            touched.insert(usr);
        }

        let entities = index.entity_count();
        let files = file_map.len();
        self.units.insert(
            unit.clone(),
            UnitRecord {
                pass,
                index,
                file_map,
            },
        );
        for usr in touched {
            self.rebuild(usr);
        }
        debug!(unit = %unit, pass, entities, retracted, "linked unit");
        LinkStats {
            unit,
            pass,
            entities,
            files,
            conflicts,
            retracted,
            previous_source,
            displaced,
        }
    }

    /// Units whose recorded event file is `source`.
    fn units_from_source(&self, source: Option<&str>) -> Vec<String> {
        let Some(source) = source else {
            return Vec::new();
        };
        self.units
            .values()
            .filter(|record| record.index.source.as_deref() == Some(source))
            .map(|record| record.index.path.clone())
            .collect()
    }

    /// Removes a unit and everything only it contributed.
    pub fn remove_unit(&mut self, unit: &str) -> bool {
        match self.retract(unit) {
            Some(touched) => {
                for usr in touched {
                    self.rebuild(usr);
                }
                debug!(unit, "removed unit");
                true
            }
            None => false,
        }
    }

    /// Detaches a unit's record, returning the usrs it contributed to. The
    /// caller rebuilds them.
    fn retract(&mut self, unit: &str) -> Option<Vec<Usr>> {
        let record = self.units.remove(unit)?;
        let usrs: Vec<Usr> = record.index.usrs().map(|(_, usr)| usr).collect();
        for usr in &usrs {
            if let Some(units) = self.contributors.get_mut(usr) {
                units.retain(|path| path != unit);
                if units.is_empty() {
                    self.contributors.remove(usr);
                }
            }
        }
        self.conflicts.retain(|conflict| conflict.unit != unit);
        Some(usrs)
    }

    /// Recomputes one entity from its contributors, or drops it when none
    /// remain.
    fn rebuild(&mut self, usr: Usr) {
        let merged = {
            let mut records: Vec<&UnitRecord> = self
                .contributors
                .get(&usr)
                .into_iter()
                .flatten()
                .filter_map(|path| self.units.get(path))
                .collect();
            records.sort_by_key(|record| record.pass);
            merge_contributions(usr, &records)
        };
        match merged {
            Some(entity) => self.put_entity(entity),
            None => self.drop_entity(usr),
        }
    }
}

/// Records seen in earlier units, used to collapse cross-unit duplicates while
/// keeping duplicates inside one unit.
#[derive(Default)]
struct SeenRecords {
    declarations: HashSet<(Loc, Role)>,
    uses: HashSet<(Loc, Role)>,
}

fn merge_contributions(usr: Usr, records: &[&UnitRecord]) -> Option<Entity> {
    let kind = records.iter().find_map(|record| record.index.kind_of(usr))?;
    let mut entity = Entity::new(kind, usr);
    let mut seen = SeenRecords::default();
    for record in records {
        let Some(part) = contribution(record, kind, usr) else {
            continue;
        };
        merge_entity(&mut entity, part, &mut seen);
    }
    Some(entity)
}

/// One unit's view of `usr`, translated to store file ids.
fn contribution(record: &UnitRecord, kind: Kind, usr: Usr) -> Option<Entity> {
    let map = &record.file_map;
    let index = &record.index;
    let entity = match kind {
        Kind::Type => {
            let mut entity = index.types.get(&usr)?.clone();
            remap_common(&mut entity.common, map);
            Entity::Type(entity)
        }
        Kind::Func => {
            let mut entity = index.funcs.get(&usr)?.clone();
            remap_common(&mut entity.common, map);
            remap_calls(&mut entity.callers, map);
            remap_calls(&mut entity.callees, map);
            Entity::Func(entity)
        }
        Kind::Var => {
            let mut entity = index.vars.get(&usr)?.clone();
            remap_common(&mut entity.common, map);
            Entity::Var(entity)
        }
    };
    Some(entity)
}

fn merge_entity(target: &mut Entity, part: Entity, seen: &mut SeenRecords) {
    match (target, part) {
        (Entity::Type(target), Entity::Type(part)) => {
            merge_common(&mut target.common, part.common, seen);
            if part.alias_of.is_some() {
                target.alias_of = part.alias_of;
            }
            extend_unique(&mut target.bases, part.bases);
            extend_unique(&mut target.derived, part.derived);
            extend_unique(&mut target.types, part.types);
            extend_unique(&mut target.funcs, part.funcs);
            extend_unique(&mut target.instances, part.instances);
            for (member, value) in part.vars {
                match target.vars.iter_mut().find(|(usr, _)| *usr == member) {
                    Some(slot) => {
                        if value.is_some() {
                            slot.1 = value;
                        }
                    }
                    None => target.vars.push((member, value)),
                }
            }
        }
        (Entity::Func(target), Entity::Func(part)) => {
            merge_common(&mut target.common, part.common, seen);
            if part.declaring_type.is_some() {
                target.declaring_type = part.declaring_type;
            }
            extend_unique(&mut target.bases, part.bases);
            extend_unique(&mut target.derived, part.derived);
            extend_unique(&mut target.vars, part.vars);
            for call in part.callers {
                push_call(&mut target.callers, call);
            }
            for call in part.callees {
                push_call(&mut target.callees, call);
            }
        }
        (Entity::Var(target), Entity::Var(part)) => {
            merge_common(&mut target.common, part.common, seen);
            if part.declaring_type.is_some() {
                target.declaring_type = part.declaring_type;
            }
            if part.type_usr.is_some() {
                target.type_usr = part.type_usr;
            }
            if part.enum_value.is_some() {
                target.enum_value = part.enum_value;
            }
        }
        (target, part) => {
            debug!(
                usr = target.usr(),
                existing = %target.kind(),
                incoming = %part.kind(),
                "skipping contribution of another kind"
            );
        }
    }
}

fn merge_common(target: &mut EntityCommon, part: EntityCommon, seen: &mut SeenRecords) {
    // A defining contributor owns the identity; others only fill gaps.
    let authoritative = part.spell.is_some() || target.spell.is_none();
    if part.has_name() && (authoritative || !target.has_name()) {
        target.detailed_name = part.detailed_name;
        target.qual_name_offset = part.qual_name_offset;
        target.short_name_offset = part.short_name_offset;
        target.short_name_size = part.short_name_size;
        target.kind = part.kind;
        target.parent_kind = part.parent_kind;
        target.storage = part.storage;
    }
    if part.scope.is_some() && (authoritative || target.scope.is_none()) {
        target.scope = part.scope;
    }
    if !part.hover.is_empty() && (authoritative || target.hover.is_empty()) {
        target.hover = part.hover;
    }
    if !part.comments.is_empty() && (authoritative || target.comments.is_empty()) {
        target.comments = part.comments;
    }
    if part.spell.is_some() {
        target.spell = part.spell;
    }
    if part.decl.is_some() {
        target.decl = part.decl;
    }

    let mut unit_declarations = Vec::with_capacity(part.declarations.len());
    for decl in part.declarations {
        let key = (decl.loc, decl.role);
        if !seen.declarations.contains(&key) {
            target.declarations.push(decl);
        }
        unit_declarations.push(key);
    }
    seen.declarations.extend(unit_declarations);

    let mut unit_uses = Vec::with_capacity(part.uses.len());
    for use_ in part.uses {
        let key = use_.key();
        if !seen.uses.contains(&key) {
            target.uses.push(use_);
        }
        unit_uses.push(key);
    }
    seen.uses.extend(unit_uses);
}

fn extend_unique(target: &mut Vec<Usr>, values: Vec<Usr>) {
    for value in values {
        push_unique(target, value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{DeclRef, Range, Use};

    fn range(text: &str) -> Range {
        text.parse().unwrap()
    }

    fn decl(index: &mut PartialIndex, file: &str, text: &str, role: Role) -> DeclRef {
        let file = index.file_id(file);
        DeclRef {
            loc: Loc::new(file, range(text)),
            extent: range(text),
            role,
        }
    }

    fn unit_defining(path: &str, usr: Usr, at: &str) -> PartialIndex {
        let mut index = PartialIndex::new(path);
        let spell = decl(&mut index, path, at, Role::DEFINITION);
        let func = index.to_func(usr);
        func.common.detailed_name = format!("void f{usr}()");
        func.common.spell = Some(spell);
        index
    }

    #[test]
    fn most_recent_pass_wins_the_definition() {
        let mut store = EntityStore::new();
        store.link(unit_defining("a.cc", 1, "1:6-1:8"));
        store.link(unit_defining("b.cc", 1, "9:6-9:8"));
        let spell = store.get_func(1).unwrap().common.spell.unwrap();
        assert_eq!(store.file_path(spell.loc.file), Some("b.cc"));

        // Re-indexing a.cc makes it the most recent pass.
        let stats = store.link(unit_defining("a.cc", 1, "2:6-2:8"));
        assert!(stats.retracted);
        let spell = store.get_func(1).unwrap().common.spell.unwrap();
        assert_eq!(store.file_path(spell.loc.file), Some("a.cc"));
        assert_eq!(spell.loc.range, range("2:6-2:8"));
        assert_eq!(store.contributors(1), vec!["b.cc", "a.cc"]);
    }

    #[test]
    fn header_uses_collapse_across_units() {
        let mut store = EntityStore::new();
        for unit in ["a.cc", "b.cc"] {
            let mut index = PartialIndex::new(unit);
            let header = index.file_id("common.h");
            let var = index.to_var(7);
            var.common.uses.push(Use::new(Loc::new(header, range("3:1-3:2")), Role::READ));
            var.common.uses.push(Use::new(Loc::new(header, range("3:1-3:2")), Role::READ));
            store.link(index);
        }
        // Duplicates inside a unit survive, the second unit adds nothing.
        assert_eq!(store.get_var(7).unwrap().common.uses.len(), 2);
    }

    #[test]
    fn retraction_is_exact() {
        let mut store = EntityStore::new();
        let mut a = PartialIndex::new("a.cc");
        a.to_type(1).derived.push(2);
        a.to_type(2).bases.push(1);
        store.link(a);
        let mut b = unit_defining("b.cc", 3, "1:1-1:2");
        b.to_type(1);
        store.link(b);

        assert_eq!(store.get_type(1).unwrap().derived, vec![2]);
        assert!(store.remove_unit("a.cc"));
        assert!(store.entity(2).is_none());
        assert!(store.get_type(1).unwrap().derived.is_empty());
        assert!(store.entity(3).is_some());
        assert!(!store.remove_unit("a.cc"));
    }

    #[test]
    fn conflicting_kinds_keep_the_earlier_record() {
        let mut store = EntityStore::new();
        let mut a = PartialIndex::new("a.cc");
        a.to_type(5);
        store.link(a);
        let mut b = PartialIndex::new("b.cc");
        b.to_func(5);
        let stats = store.link(b);
        assert_eq!(stats.conflicts, 1);
        assert_eq!(store.kind_of(5), Some(Kind::Type));
        assert_eq!(store.conflicts().len(), 1);
        store.remove_unit("b.cc");
        assert!(store.conflicts().is_empty());
    }

    #[test]
    fn replayed_passes_advance_the_counter() {
        let mut store = EntityStore::new();
        store.link_with_pass(unit_defining("a.cc", 1, "1:1-1:2"), 41);
        let stats = store.link(unit_defining("b.cc", 2, "1:1-1:2"));
        assert_eq!(stats.pass, 42);
        assert_eq!(store.last_pass(), 42);
    }

    #[test]
    fn renamed_unit_replaces_the_one_from_the_same_event_file() {
        let mut store = EntityStore::new();
        let mut x = unit_defining("x.cc", 1, "1:6-1:8");
        x.source = Some("a.jsonl".to_string());
        store.link(x);

        let mut y = unit_defining("y.cc", 2, "1:6-1:8");
        y.source = Some("a.jsonl".to_string());
        let stats = store.link(y);
        assert_eq!(stats.displaced, vec!["x.cc".to_string()]);
        assert!(!stats.retracted);
        assert!(store.unit("x.cc").is_none());
        assert!(store.entity(1).is_none());
        assert!(store.entity(2).is_some());

        let mut moved = unit_defining("y.cc", 2, "1:6-1:8");
        moved.source = Some("b.jsonl".to_string());
        let stats = store.link(moved);
        assert!(stats.retracted);
        assert!(stats.displaced.is_empty());
        assert_eq!(stats.previous_source.as_deref(), Some("a.jsonl"));
    }
}
