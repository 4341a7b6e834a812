//! Template instantiation folding and macro call-site attribution.

use crate::error::KindConflict;
use crate::indexer::event::{MacroSite, Span};
use crate::indexer::partial::{PartialIndex, push_call, push_unique};
use crate::model::{Entity, EntityCommon, Role, Use, Usr};
use std::collections::HashMap;
use tracing::{debug, warn};

/// Chains longer than this are treated as cycles.
const MAX_CHAIN: usize = 32;

/// Maps instantiation usrs onto the usr of the generic symbol they fold into.
#[derive(Debug, Clone, Default)]
pub struct FoldTable {
    targets: HashMap<Usr, Usr>,
}

impl FoldTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records that `instance` folds into `template`. Self maps, cycles and
    /// remaps of an already folded instance are refused.
    pub fn record(&mut self, instance: Usr, template: Usr) -> bool {
        if instance == template {
            return false;
        }
        if self.canonical(template) == instance {
            warn!(instance, template, "refusing cyclic template fold");
            return false;
        }
        match self.targets.get(&instance) {
            Some(existing) if *existing == template => true,
            Some(existing) => {
                debug!(
                    instance,
                    existing = *existing,
                    template,
                    "instance already folded elsewhere"
                );
                false
            }
            None => {
                self.targets.insert(instance, template);
                true
            }
        }
    }

    /// The generic symbol `usr` ultimately folds into, or `usr` itself.
    pub fn canonical(&self, usr: Usr) -> Usr {
        let mut current = usr;
        for _ in 0..MAX_CHAIN {
            match self.targets.get(&current) {
                Some(next) => current = *next,
                None => return current,
            }
        }
        current
    }

    pub fn is_folded(&self, usr: Usr) -> bool {
        self.targets.contains_key(&usr)
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }

    pub fn len(&self) -> usize {
        self.targets.len()
    }

    fn instances(&self) -> Vec<(Usr, Usr)> {
        let mut pairs: Vec<(Usr, Usr)> = self
            .targets
            .keys()
            .map(|instance| (*instance, self.canonical(*instance)))
            .collect();
        pairs.sort_unstable();
        pairs
    }
}

/// The span and role a call is recorded under. Calls produced by a macro
/// expansion point at the invocation token and carry the expansion bit.
pub fn attribute_macro<'a>(span: &'a Span, role: Role, site: Option<&'a MacroSite>) -> (&'a Span, Role) {
    match site {
        Some(site) => (&site.invocation, role | Role::MACRO_EXPANSION),
        None => (span, role),
    }
}

/// Merges entities created for instantiations before their template mapping
/// was known into the template entity, then rewrites every usr reference in
/// the index through the fold table.
pub fn finalize(index: &mut PartialIndex, table: &FoldTable) {
    if table.is_empty() {
        return;
    }
    for (instance, template) in table.instances() {
        fold_entity(index, instance, template);
    }
    rewrite_references(index, table);
}

fn take_entity(index: &mut PartialIndex, usr: Usr) -> Option<Entity> {
    if let Some(entity) = index.types.remove(&usr) {
        return Some(Entity::Type(entity));
    }
    if let Some(entity) = index.funcs.remove(&usr) {
        return Some(Entity::Func(entity));
    }
    index.vars.remove(&usr).map(Entity::Var)
}

fn fold_entity(index: &mut PartialIndex, instance: Usr, template: Usr) {
    let Some(kind) = index.kind_of(instance) else {
        return;
    };
    if let Some(existing) = index.kind_of(template) {
        if existing != kind {
            warn!(
                instance,
                template,
                %existing,
                incoming = %kind,
                "instantiation kind differs from template, not folding"
            );
            index.conflicts.push(KindConflict {
                usr: template,
                existing,
                incoming: kind,
            });
            return;
        }
    }
    let Some(entity) = take_entity(index, instance) else {
        return;
    };
    match entity {
        Entity::Type(source) => {
            let target = index.to_type(template);
            absorb_common(&mut target.common, source.common);
            target.alias_of = target.alias_of.or(source.alias_of);
            for usr in source.bases {
                push_unique(&mut target.bases, usr);
            }
            for usr in source.derived {
                push_unique(&mut target.derived, usr);
            }
            for usr in source.types {
                push_unique(&mut target.types, usr);
            }
            for usr in source.funcs {
                push_unique(&mut target.funcs, usr);
            }
            for member in source.vars {
                if !target.vars.iter().any(|(usr, _)| *usr == member.0) {
                    target.vars.push(member);
                }
            }
            for usr in source.instances {
                push_unique(&mut target.instances, usr);
            }
        }
        Entity::Func(source) => {
            let target = index.to_func(template);
            absorb_common(&mut target.common, source.common);
            target.declaring_type = target.declaring_type.or(source.declaring_type);
            for usr in source.bases {
                push_unique(&mut target.bases, usr);
            }
            for usr in source.derived {
                push_unique(&mut target.derived, usr);
            }
            for usr in source.vars {
                push_unique(&mut target.vars, usr);
            }
            for call in source.callers {
                push_call(&mut target.callers, call);
            }
            for call in source.callees {
                push_call(&mut target.callees, call);
            }
        }
        Entity::Var(source) => {
            let target = index.to_var(template);
            absorb_common(&mut target.common, source.common);
            target.declaring_type = target.declaring_type.or(source.declaring_type);
            target.type_usr = target.type_usr.or(source.type_usr);
        }
    }
    debug!(instance, template, %kind, "folded instantiation");
}

/// Instance sites become folded uses of the template; its own canonical
/// locations stay untouched.
fn absorb_common(target: &mut EntityCommon, source: EntityCommon) {
    if !target.has_name() && source.has_name() {
        target.detailed_name = source.detailed_name;
        target.qual_name_offset = source.qual_name_offset;
        target.short_name_offset = source.short_name_offset;
        target.short_name_size = source.short_name_size;
        target.kind = source.kind;
        target.parent_kind = source.parent_kind;
        target.scope = target.scope.or(source.scope);
    }
    let sites = source
        .spell
        .into_iter()
        .chain(source.declarations)
        .map(|decl| Use::new(decl.loc, decl.role));
    for site in sites.chain(source.uses) {
        push_unique(
            &mut target.uses,
            Use {
                folded: true,
                ..site
            },
        );
    }
}

fn rewrite(usr: &mut Usr, table: &FoldTable) {
    *usr = table.canonical(*usr);
}

fn rewrite_list(list: &mut Vec<Usr>, table: &FoldTable) {
    let mut out = Vec::with_capacity(list.len());
    for usr in list.drain(..) {
        push_unique(&mut out, table.canonical(usr));
    }
    *list = out;
}

fn rewrite_references(index: &mut PartialIndex, table: &FoldTable) {
    let mut instances_of: Vec<(Usr, Usr)> = Vec::new();
    for var in index.vars.values_mut() {
        if let Some(type_usr) = var.type_usr.as_mut() {
            if table.is_folded(*type_usr) {
                rewrite(type_usr, table);
                instances_of.push((*type_usr, var.common.usr));
            }
        }
        if let Some(owner) = var.declaring_type.as_mut() {
            rewrite(owner, table);
        }
        if let Some(scope) = var.common.scope.as_mut() {
            rewrite(scope, table);
        }
    }
    for func in index.funcs.values_mut() {
        let own = func.common.usr;
        rewrite_list(&mut func.bases, table);
        rewrite_list(&mut func.derived, table);
        rewrite_list(&mut func.vars, table);
        if let Some(owner) = func.declaring_type.as_mut() {
            rewrite(owner, table);
        }
        if let Some(scope) = func.common.scope.as_mut() {
            rewrite(scope, table);
        }
        for calls in [&mut func.callers, &mut func.callees] {
            let mut out = Vec::with_capacity(calls.len());
            for mut call in calls.drain(..) {
                rewrite(&mut call.usr, table);
                push_call(&mut out, call);
            }
            *calls = out;
        }
        func.bases.retain(|usr| *usr != own);
        func.derived.retain(|usr| *usr != own);
    }
    for ty in index.types.values_mut() {
        let own = ty.common.usr;
        rewrite_list(&mut ty.bases, table);
        rewrite_list(&mut ty.derived, table);
        rewrite_list(&mut ty.types, table);
        rewrite_list(&mut ty.funcs, table);
        rewrite_list(&mut ty.instances, table);
        if let Some(alias) = ty.alias_of.as_mut() {
            rewrite(alias, table);
        }
        if let Some(scope) = ty.common.scope.as_mut() {
            rewrite(scope, table);
        }
        let mut vars: Vec<(Usr, Option<i64>)> = Vec::with_capacity(ty.vars.len());
        for (usr, value) in ty.vars.drain(..) {
            let usr = table.canonical(usr);
            if !vars.iter().any(|(existing, _)| *existing == usr) {
                vars.push((usr, value));
            }
        }
        ty.vars = vars;
        ty.bases.retain(|usr| *usr != own);
        ty.derived.retain(|usr| *usr != own);
        ty.instances.retain(|usr| *usr != own);
        if ty.alias_of == Some(own) {
            ty.alias_of = None;
        }
    }
    for (template, var) in instances_of {
        if let Some(ty) = index.types.get_mut(&template) {
            push_unique(&mut ty.instances, var);
        }
    }
}
