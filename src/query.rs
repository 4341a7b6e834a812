//! Read-side queries over a store snapshot.

use crate::indexer::event::Include;
use crate::matcher::Matcher;
use crate::model::{
    DeclRef, Entity, EntityCommon, Kind, Loc, Range, Role, StorageClass, SymbolKind, Usr,
};
use crate::store::EntityStore;
use anyhow::{Context, Result};
use serde::Serialize;
use std::collections::HashSet;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LocationView {
    pub path: String,
    pub range: String,
    pub roles: Vec<&'static str>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub folded: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeclView {
    pub path: String,
    pub range: String,
    pub extent: String,
    pub roles: Vec<&'static str>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SymbolSummary {
    pub usr: Usr,
    /// Absent when the usr is referenced but no unit described it.
    pub kind: Option<Kind>,
    pub symbol_kind: SymbolKind,
    pub name: String,
    pub qualified_name: String,
    pub detailed_name: String,
    pub location: Option<LocationView>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EntityView {
    #[serde(flatten)]
    pub summary: SymbolSummary,
    pub storage: StorageClass,
    pub scope: Option<Usr>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub hover: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub comments: String,
    pub definition: Option<DeclView>,
    pub declaration: Option<DeclView>,
    pub declarations: usize,
    pub uses: usize,
    pub declaring_type: Option<Usr>,
    pub alias_of: Option<Usr>,
    pub type_usr: Option<Usr>,
    pub enum_value: Option<i64>,
    pub is_local: bool,
    pub contributors: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CallView {
    #[serde(flatten)]
    pub symbol: SymbolSummary,
    pub call_site: LocationView,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MemberView {
    #[serde(flatten)]
    pub symbol: SymbolSummary,
    pub value: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileView {
    pub path: String,
    pub units: Vec<String>,
    pub skipped_ranges: Vec<String>,
    pub includes: Vec<Include>,
}

fn location(store: &EntityStore, loc: Loc, role: Role, folded: bool) -> LocationView {
    LocationView {
        path: store.file_path(loc.file).unwrap_or_default().to_string(),
        range: loc.range.to_string(),
        roles: role.names(),
        folded,
    }
}

fn decl_view(store: &EntityStore, decl: &DeclRef) -> DeclView {
    DeclView {
        path: store.file_path(decl.loc.file).unwrap_or_default().to_string(),
        range: decl.loc.range.to_string(),
        extent: decl.extent.to_string(),
        roles: decl.role.names(),
    }
}

/// Definition if there is one, otherwise the canonical declaration.
fn primary_decl(common: &EntityCommon) -> Option<&DeclRef> {
    common
        .spell
        .as_ref()
        .or(common.decl.as_ref())
        .or(common.declarations.first())
}

pub fn summary(store: &EntityStore, usr: Usr) -> SymbolSummary {
    let Some(entity) = store.entity(usr) else {
        return SymbolSummary {
            usr,
            kind: None,
            symbol_kind: SymbolKind::Unknown,
            name: String::new(),
            qualified_name: String::new(),
            detailed_name: String::new(),
            location: None,
        };
    };
    let common = entity.common();
    SymbolSummary {
        usr,
        kind: Some(entity.kind()),
        symbol_kind: common.kind,
        name: common.short_name().to_string(),
        qualified_name: common.qualified_name().to_string(),
        detailed_name: common.detailed_name.clone(),
        location: primary_decl(common).map(|decl| location(store, decl.loc, decl.role, false)),
    }
}

pub fn lookup(store: &EntityStore, usr: Usr) -> Option<EntityView> {
    let entity = store.entity(usr)?;
    let common = entity.common();
    let (declaring_type, alias_of, type_usr, enum_value, is_local) = match entity {
        Entity::Type(ty) => (None, ty.alias_of, None, None, false),
        Entity::Func(func) => (func.declaring_type, None, None, None, false),
        Entity::Var(var) => (
            var.declaring_type,
            None,
            var.type_usr,
            var.enum_value,
            var.is_local(),
        ),
    };
    Some(EntityView {
        summary: summary(store, usr),
        storage: common.storage,
        scope: common.scope,
        hover: common.hover.clone(),
        comments: common.comments.clone(),
        definition: common.spell.as_ref().map(|decl| decl_view(store, decl)),
        declaration: common.decl.as_ref().map(|decl| decl_view(store, decl)),
        declarations: common.declarations.len(),
        uses: common.uses.len(),
        declaring_type,
        alias_of,
        type_usr,
        enum_value,
        is_local,
        contributors: store
            .contributors(usr)
            .into_iter()
            .map(str::to_string)
            .collect(),
    })
}

fn is_local(entity: &Entity) -> bool {
    entity.as_var().is_some_and(|var| var.is_local())
}

/// Fuzzy symbol search. Exact short-name hits rank first, then prefixes,
/// then substrings of the qualified name, then plain subsequence matches.
pub fn find_by_name(
    store: &EntityStore,
    query: &str,
    limit: usize,
    include_locals: bool,
) -> Result<Vec<SymbolSummary>> {
    let matcher = Matcher::fuzzy(query).with_context(|| format!("build matcher for {query:?}"))?;
    let needle = query.trim().to_lowercase();
    let mut hits: Vec<(u8, usize, String, Usr)> = store
        .entities()
        .filter(|entity| entity.common().has_name())
        .filter(|entity| include_locals || !is_local(entity))
        .filter_map(|entity| {
            let common = entity.common();
            let qualified = common.qualified_name();
            if !matcher.is_match(qualified) {
                return None;
            }
            let short = common.short_name().to_lowercase();
            let tier = if short == needle {
                0
            } else if short.starts_with(&needle) {
                1
            } else if qualified.to_lowercase().contains(&needle) {
                2
            } else {
                3
            };
            Some((tier, qualified.len(), qualified.to_string(), common.usr))
        })
        .collect();
    hits.sort();
    hits.truncate(limit);
    Ok(hits
        .into_iter()
        .map(|(_, _, _, usr)| summary(store, usr))
        .collect())
}

/// Every recorded use, optionally restricted to uses carrying one of `roles`.
pub fn uses(store: &EntityStore, usr: Usr, roles: Option<Role>) -> Vec<LocationView> {
    let Some(entity) = store.entity(usr) else {
        return Vec::new();
    };
    entity
        .common()
        .uses
        .iter()
        .filter(|use_| roles.is_none_or(|roles| use_.role.intersects(roles)))
        .map(|use_| location(store, use_.loc, use_.role, use_.folded))
        .collect()
}

pub fn declarations(store: &EntityStore, usr: Usr) -> Vec<DeclView> {
    store
        .entity(usr)
        .map(|entity| {
            entity
                .common()
                .declarations
                .iter()
                .map(|decl| decl_view(store, decl))
                .collect()
        })
        .unwrap_or_default()
}

pub fn callers(store: &EntityStore, usr: Usr) -> Vec<CallView> {
    let Some(func) = store.get_func(usr) else {
        return Vec::new();
    };
    func.callers
        .iter()
        .map(|call| CallView {
            symbol: summary(store, call.usr),
            call_site: location(store, call.loc, call.role, false),
        })
        .collect()
}

pub fn callees(store: &EntityStore, usr: Usr) -> Vec<CallView> {
    let Some(func) = store.get_func(usr) else {
        return Vec::new();
    };
    func.callees
        .iter()
        .map(|call| CallView {
            symbol: summary(store, call.usr),
            call_site: location(store, call.loc, call.role, false),
        })
        .collect()
}

pub fn bases(store: &EntityStore, usr: Usr) -> Vec<SymbolSummary> {
    let list = match store.entity(usr) {
        Some(Entity::Type(ty)) => ty.bases.as_slice(),
        Some(Entity::Func(func)) => func.bases.as_slice(),
        _ => &[],
    };
    list.iter().map(|usr| summary(store, *usr)).collect()
}

pub fn derived(store: &EntityStore, usr: Usr) -> Vec<SymbolSummary> {
    let list = match store.entity(usr) {
        Some(Entity::Type(ty)) => ty.derived.as_slice(),
        Some(Entity::Func(func)) => func.derived.as_slice(),
        _ => &[],
    };
    list.iter().map(|usr| summary(store, *usr)).collect()
}

pub fn instances(store: &EntityStore, usr: Usr) -> Vec<SymbolSummary> {
    store
        .get_type(usr)
        .map(|ty| ty.instances.iter().map(|usr| summary(store, *usr)).collect())
        .unwrap_or_default()
}

pub fn members(store: &EntityStore, usr: Usr) -> Vec<MemberView> {
    let member = |usr: Usr, value: Option<i64>| MemberView {
        symbol: summary(store, usr),
        value,
    };
    match store.entity(usr) {
        Some(Entity::Type(ty)) => ty
            .types
            .iter()
            .chain(ty.funcs.iter())
            .map(|usr| member(*usr, None))
            .chain(ty.vars.iter().map(|(usr, value)| member(*usr, *value)))
            .collect(),
        Some(Entity::Func(func)) => func.vars.iter().map(|usr| member(*usr, None)).collect(),
        _ => Vec::new(),
    }
}

/// Follows `alias_of` from `usr`. The chain starts with `usr` and stops at the
/// first non-alias or at a cycle.
pub fn resolve_alias(store: &EntityStore, usr: Usr) -> Vec<Usr> {
    let mut chain = vec![usr];
    let mut seen = HashSet::from([usr]);
    let mut current = usr;
    while let Some(next) = store.get_type(current).and_then(|ty| ty.alias_of) {
        if !seen.insert(next) {
            break;
        }
        chain.push(next);
        current = next;
    }
    chain
}

/// Outline of one file: symbols defined or declared there, by position.
pub fn file_symbols(store: &EntityStore, path: &str) -> Vec<SymbolSummary> {
    let Some(file) = store.file_id(path) else {
        return Vec::new();
    };
    let mut found: Vec<(Range, Usr)> = store
        .entities()
        .filter(|entity| !is_local(entity))
        .filter_map(|entity| {
            let common = entity.common();
            common
                .spell
                .iter()
                .chain(common.declarations.iter())
                .filter(|decl| decl.loc.file == file)
                .map(|decl| decl.loc.range)
                .min()
                .map(|range| (range, common.usr))
        })
        .collect();
    found.sort();
    found
        .into_iter()
        .map(|(_, usr)| summary(store, usr))
        .collect()
}

/// Units that touched a file, and what they reported about it.
pub fn file_info(store: &EntityStore, path: &str) -> Option<FileView> {
    store.file_id(path)?;
    let mut view = FileView {
        path: path.to_string(),
        units: Vec::new(),
        skipped_ranges: Vec::new(),
        includes: Vec::new(),
    };
    for record in store.units() {
        let Some(local) = record.index.files.iter().position(|file| file == path) else {
            continue;
        };
        view.units.push(record.index.path.clone());
        for skipped in &record.index.skipped_ranges {
            if skipped.file as usize == local {
                let range = skipped.range.to_string();
                if !view.skipped_ranges.contains(&range) {
                    view.skipped_ranges.push(range);
                }
            }
        }
        if record.index.path == path {
            view.includes.extend(record.index.includes.iter().cloned());
        }
    }
    Some(view)
}

#[derive(Debug, Clone, Serialize)]
pub struct Overview {
    pub units: usize,
    pub files: usize,
    pub types: usize,
    pub funcs: usize,
    pub vars: usize,
    pub conflicts: usize,
    pub last_pass: u64,
}

pub fn overview(store: &EntityStore) -> Overview {
    Overview {
        units: store.unit_count(),
        files: store.files().len(),
        types: store.count_by_kind(Kind::Type),
        funcs: store.count_by_kind(Kind::Func),
        vars: store.count_by_kind(Kind::Var),
        conflicts: store.conflicts().len(),
        last_pass: store.last_pass(),
    }
}
