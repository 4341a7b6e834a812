//! Turns the event stream of one translation unit into a [`PartialIndex`].
//!
//! Declarations and definitions of the same usr collapse into one entity:
//! the last definition becomes the canonical `spell`, every plain declaration
//! is kept in encounter order, and the declaration pointer tracks the most
//! local declaration. Uses are only ever appended.

use crate::error::{IndexError, KindConflict};
use crate::indexer::event::{
    CallSite, Declaration, Event, Include, Inheritance, Instantiation, MacroExpansion, MacroSite,
    Membership, Reference, SkippedRange, Span, SymbolKey, UnitHeader,
};
use crate::indexer::fold::{self, FoldTable};
use crate::indexer::partial::{PartialIndex, push_call, push_unique};
use crate::model::{
    CallRef, DeclRef, EntityCommon, Kind, Loc, Role, SymbolKind, Use, Usr,
};
use anyhow::{Context, Result};
use std::collections::HashMap;
use std::io::BufRead;
use tracing::{debug, warn};

pub struct IndexBuilder {
    index: PartialIndex,
    fold: FoldTable,
    /// Last enumerator value handed out per enum.
    enum_cursor: HashMap<Usr, i64>,
}

impl IndexBuilder {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            index: PartialIndex::new(path),
            fold: FoldTable::new(),
            enum_cursor: HashMap::new(),
        }
    }

    pub fn index(&self) -> &PartialIndex {
        &self.index
    }

    /// Applies one event. Problems are recorded on the index, never returned.
    pub fn apply(&mut self, event: Event) {
        match event {
            Event::Unit(header) => self.unit(header),
            Event::Declare(decl) => self.declare(decl),
            Event::Reference(reference) => self.reference(reference),
            Event::Call(call) => self.call(call),
            Event::Inherit(inherit) => self.inherit(inherit),
            Event::Member(member) => self.member(member),
            Event::Instantiate(inst) => self.instantiate(inst),
            Event::MacroExpansion(expansion) => self.macro_expansion(expansion),
            Event::Include(include) => self.include(include),
            Event::SkippedRange(skipped) => self.skipped_range(skipped),
        }
    }

    /// Reads JSON Lines events until EOF. Undecodable lines are logged,
    /// counted and skipped.
    pub fn read_events<R: BufRead>(&mut self, reader: R) -> Result<()> {
        for (idx, line) in reader.lines().enumerate() {
            let line = line.with_context(|| format!("read event line {}", idx + 1))?;
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            match serde_json::from_str::<Event>(trimmed) {
                Ok(event) => self.apply(event),
                Err(source) => {
                    let err = IndexError::MalformedEvent {
                        line: idx + 1,
                        source,
                    };
                    warn!(unit = %self.index.path, "{err}");
                    self.index.malformed_events += 1;
                }
            }
        }
        Ok(())
    }

    pub fn finish(mut self) -> PartialIndex {
        fold::finalize(&mut self.index, &self.fold);
        debug!(
            unit = %self.index.path,
            entities = self.index.entity_count(),
            folded = self.fold.len(),
            "built partial index"
        );
        self.index
    }

    fn loc(&mut self, span: &Span) -> Loc {
        Loc::new(self.index.file_id(&span.file), span.range)
    }

    /// Checks `usr` against the kind it was first seen with. A mismatch is
    /// recorded and the observation must be dropped.
    fn admit(&mut self, usr: Usr, kind: Kind) -> bool {
        match self.index.kind_of(usr) {
            Some(existing) if existing != kind => {
                let conflict = KindConflict {
                    usr,
                    existing,
                    incoming: kind,
                };
                warn!(unit = %self.index.path, "{}", IndexError::from(conflict));
                self.index.conflicts.push(conflict);
                false
            }
            _ => true,
        }
    }

    /// Resolves a key through the fold table. The flag is set when the usr
    /// was redirected to a template.
    fn resolve(&self, key: &SymbolKey) -> (Usr, bool) {
        let raw = key.resolve();
        let usr = self.fold.canonical(raw);
        (usr, usr != raw)
    }

    fn fold_into(&mut self, key: &SymbolKey, template: Option<&SymbolKey>) -> (Usr, bool) {
        if let Some(template) = template {
            let instance = key.resolve();
            self.fold.record(instance, template.resolve());
        }
        self.resolve(key)
    }

    fn unit(&mut self, header: UnitHeader) {
        self.index.path = header.path;
        self.index.args = header.args;
        self.index.language = header.language;
    }

    fn declare(&mut self, decl: Declaration) {
        let (usr, folded) = self.fold_into(&decl.usr, decl.template_of.as_ref());
        if !self.admit(usr, decl.kind) {
            return;
        }
        let loc = self.loc(&decl.spell);

        if folded {
            let common = self.index.common_mut(decl.kind, usr);
            push_unique(
                &mut common.uses,
                Use {
                    loc,
                    role: decl.role,
                    folded: true,
                },
            );
            if !common.has_name() {
                set_names(common, &decl);
            }
            return;
        }

        let decl_ref = DeclRef {
            loc,
            extent: decl.extent.unwrap_or(decl.spell.range),
            role: decl.role,
        };
        let is_definition = decl.role.contains(Role::DEFINITION);
        let scope = decl.scope.as_ref().map(|key| self.resolve(key).0);
        {
            let common = self.index.common_mut(decl.kind, usr);
            if is_definition || !common.has_name() {
                set_names(common, &decl);
                common.storage = decl.storage;
                common.parent_kind = decl.parent_kind;
                if scope.is_some() {
                    common.scope = scope;
                }
            }
            if let Some(hover) = decl.hover.as_ref().filter(|hover| !hover.is_empty()) {
                if is_definition || common.hover.is_empty() {
                    common.hover = hover.clone();
                }
            }
            if let Some(comments) = decl.comments.as_ref().filter(|text| !text.is_empty()) {
                if is_definition || common.comments.is_empty() {
                    common.comments = comments.clone();
                }
            }
            if is_definition {
                common.spell = Some(decl_ref);
            } else {
                common.declarations.push(decl_ref);
                common.decl = most_local_declaration(&common.declarations, loc);
            }
            if decl.kind == Kind::Type {
                common.uses.push(Use::new(loc, decl.role));
            }
        }

        match decl.kind {
            Kind::Type => {
                if let Some(alias) = decl.alias_of.as_ref() {
                    let (alias, _) = self.resolve(alias);
                    if alias != usr && self.admit(alias, Kind::Type) {
                        self.index.to_type(alias);
                        self.index.to_type(usr).alias_of = Some(alias);
                    }
                }
            }
            Kind::Func => {}
            Kind::Var => {
                if let Some(type_key) = decl.type_usr.as_ref() {
                    let (type_usr, _) = self.resolve(type_key);
                    if self.admit(type_usr, Kind::Type) {
                        self.index.to_var(usr).type_usr = Some(type_usr);
                        push_unique(&mut self.index.to_type(type_usr).instances, usr);
                    }
                }
                if let Some(owner) = decl.enumerator_of.as_ref() {
                    self.enumerator(usr, owner, decl.initializer);
                }
            }
        }

        if let Some(scope) = scope {
            self.attach_to_scope(scope, decl.kind, usr);
        }
    }

    /// Enumerators take their explicit initializer, or the previous value plus
    /// one starting from zero.
    fn enumerator(&mut self, usr: Usr, owner: &SymbolKey, initializer: Option<i64>) {
        let (owner, _) = self.resolve(owner);
        if !self.admit(owner, Kind::Type) {
            return;
        }
        let value = match self.index.vars.get(&usr).and_then(|var| var.enum_value) {
            Some(existing) => existing,
            None => {
                let value = initializer.unwrap_or_else(|| {
                    self.enum_cursor
                        .get(&owner)
                        .map(|prev| prev.saturating_add(1))
                        .unwrap_or(0)
                });
                self.enum_cursor.insert(owner, value);
                value
            }
        };
        let var = self.index.to_var(usr);
        var.enum_value = Some(value);
        var.declaring_type = Some(owner);
        if var.common.kind == SymbolKind::Unknown {
            var.common.kind = SymbolKind::EnumMember;
        }
        var.common.hover = format!("{} = {}", var.common.qualified_name(), value);

        let ty = self.index.to_type(owner);
        match ty.vars.iter_mut().find(|(member, _)| *member == usr) {
            Some(slot) => slot.1 = Some(value),
            None => ty.vars.push((usr, Some(value))),
        }
    }

    /// Links a declaration to its lexical scope when that scope is a type or
    /// function this unit knows about.
    fn attach_to_scope(&mut self, scope: Usr, kind: Kind, usr: Usr) {
        if scope == usr {
            return;
        }
        match self.index.kind_of(scope) {
            Some(Kind::Type) => self.add_member(scope, kind, usr),
            Some(Kind::Func) if kind == Kind::Var => {
                push_unique(&mut self.index.to_func(scope).vars, usr);
            }
            _ => {}
        }
    }

    fn add_member(&mut self, owner: Usr, kind: Kind, member: Usr) {
        match kind {
            Kind::Type => {
                push_unique(&mut self.index.to_type(owner).types, member);
                self.index.to_type(member);
            }
            Kind::Func => {
                push_unique(&mut self.index.to_type(owner).funcs, member);
                self.index.to_func(member).declaring_type = Some(owner);
            }
            Kind::Var => {
                let var = self.index.to_var(member);
                var.declaring_type = Some(owner);
                let value = var.enum_value;
                let ty = self.index.to_type(owner);
                if !ty.vars.iter().any(|(existing, _)| *existing == member) {
                    ty.vars.push((member, value));
                }
            }
        }
    }

    fn reference(&mut self, reference: Reference) {
        let (usr, folded) = self.fold_into(&reference.usr, reference.template_of.as_ref());
        if !self.admit(usr, reference.kind) {
            return;
        }
        let (span, role) = fold::attribute_macro(
            &reference.span,
            reference.role,
            reference.macro_site.as_ref(),
        );
        let loc = self.loc(span);
        self.index
            .common_mut(reference.kind, usr)
            .uses
            .push(Use { loc, role, folded });
        if let Some(site) = reference.macro_site.as_ref() {
            self.macro_use(site);
        }
    }

    fn call(&mut self, call: CallSite) {
        let (callee, callee_folded) = self.resolve(&call.callee);
        if !self.admit(callee, Kind::Func) {
            return;
        }
        let caller = match call.caller.as_ref() {
            Some(key) => {
                let (caller, _) = self.resolve(key);
                if !self.admit(caller, Kind::Func) {
                    return;
                }
                Some(caller)
            }
            None => None,
        };
        let (span, role) = fold::attribute_macro(&call.span, call.role, call.macro_site.as_ref());
        let loc = self.loc(span);

        let record_use = match caller {
            Some(caller) => {
                let inserted = push_call(
                    &mut self.index.to_func(callee).callers,
                    CallRef {
                        usr: caller,
                        loc,
                        role,
                    },
                );
                push_call(
                    &mut self.index.to_func(caller).callees,
                    CallRef {
                        usr: callee,
                        loc,
                        role,
                    },
                );
                inserted
            }
            None => true,
        };
        if record_use {
            self.index.to_func(callee).common.uses.push(Use {
                loc,
                role,
                folded: callee_folded,
            });
        }
        if let Some(site) = call.macro_site.as_ref() {
            self.macro_use(site);
        }
    }

    /// One expansion use per invocation token, however many calls it produced.
    fn macro_use(&mut self, site: &MacroSite) {
        let (usr, _) = self.resolve(&site.macro_usr);
        if !self.admit(usr, Kind::Var) {
            return;
        }
        let loc = self.loc(&site.invocation);
        let var = self.index.to_var(usr);
        if var.common.kind == SymbolKind::Unknown {
            var.common.kind = SymbolKind::Macro;
        }
        if !var.common.uses.iter().any(|existing| existing.loc == loc) {
            var.common.uses.push(Use::new(loc, Role::MACRO_EXPANSION));
        }
    }

    fn macro_expansion(&mut self, expansion: MacroExpansion) {
        self.macro_use(&MacroSite {
            macro_usr: expansion.macro_usr,
            invocation: expansion.span,
        });
    }

    fn inherit(&mut self, inherit: Inheritance) {
        let (parent, _) = self.resolve(&inherit.parent);
        let (child, _) = self.resolve(&inherit.child);
        if parent == child || !self.admit(parent, inherit.kind) || !self.admit(child, inherit.kind) {
            return;
        }
        match inherit.kind {
            Kind::Type => {
                push_unique(&mut self.index.to_type(child).bases, parent);
                push_unique(&mut self.index.to_type(parent).derived, child);
            }
            Kind::Func => {
                push_unique(&mut self.index.to_func(child).bases, parent);
                push_unique(&mut self.index.to_func(parent).derived, child);
            }
            Kind::Var => {
                debug!(parent, child, "ignoring inheritance between variables");
                return;
            }
        }
        if let Some(span) = inherit.span.as_ref() {
            let loc = self.loc(span);
            push_unique(
                &mut self.index.common_mut(inherit.kind, parent).uses,
                Use::new(loc, Role::REFERENCE),
            );
        }
    }

    fn member(&mut self, member: Membership) {
        let (usr, _) = self.resolve(&member.member);
        if !self.admit(usr, member.kind) {
            return;
        }
        // Still recorded when the owner is unknown, with no relationships.
        self.index.common_mut(member.kind, usr);
        let Some(owner) = member.owner.as_ref() else {
            return;
        };
        let (owner, _) = self.resolve(owner);
        if owner == usr || !self.admit(owner, member.owner_kind) {
            return;
        }
        match member.owner_kind {
            Kind::Type => self.add_member(owner, member.kind, usr),
            Kind::Func if member.kind == Kind::Var => {
                push_unique(&mut self.index.to_func(owner).vars, usr);
            }
            _ => debug!(owner, member = usr, "unsupported member relationship"),
        }
    }

    fn instantiate(&mut self, inst: Instantiation) {
        let (template, _) = self.resolve(&inst.template);
        if !self.admit(template, inst.template_kind) {
            return;
        }
        if inst.template_kind != Kind::Type {
            // Generic functions and variables have no instance list; their
            // instantiations fold into the template instead.
            if inst.instance_kind == inst.template_kind {
                self.fold.record(inst.instance.resolve(), template);
            }
            return;
        }
        let (instance, _) = self.resolve(&inst.instance);
        if instance == template || !self.admit(instance, inst.instance_kind) {
            return;
        }
        match inst.instance_kind {
            Kind::Var => {
                let var = self.index.to_var(instance);
                var.type_usr.get_or_insert(template);
            }
            kind => {
                self.index.common_mut(kind, instance);
            }
        }
        push_unique(&mut self.index.to_type(template).instances, instance);
        if let Some(span) = inst.span.as_ref() {
            let loc = self.loc(span);
            push_unique(
                &mut self.index.to_type(template).common.uses,
                Use {
                    loc,
                    role: Role::REFERENCE,
                    folded: true,
                },
            );
        }
    }

    fn include(&mut self, include: Include) {
        self.index.file_id(&include.resolved_path);
        self.index.includes.push(include);
    }

    fn skipped_range(&mut self, skipped: SkippedRange) {
        let loc = self.loc(&skipped.span);
        self.index.skipped_ranges.push(loc);
    }
}

/// The declaration with the highest start position in the file of `latest`.
fn most_local_declaration(declarations: &[DeclRef], latest: Loc) -> Option<DeclRef> {
    declarations
        .iter()
        .filter(|decl| decl.loc.file == latest.file)
        .max_by_key(|decl| decl.loc.range.start)
        .copied()
}

fn set_names(common: &mut EntityCommon, decl: &Declaration) {
    let detailed = decl.detailed_name.as_str();
    let qual = (decl.qual_name_offset as usize).min(detailed.len());
    let qual = floor_char_boundary(detailed, qual);
    let (offset, size) = short_name_span(detailed, qual, decl.short_name.as_deref());
    common.detailed_name = decl.detailed_name.clone();
    common.qual_name_offset = name_offset(qual);
    common.short_name_offset = name_offset(offset);
    common.short_name_size = name_offset(size);
    if decl.symbol_kind != SymbolKind::Unknown {
        common.kind = decl.symbol_kind;
    }
}

/// Locates the short name inside the qualified part of a detailed name.
/// The qualified part ends at the parameter list, if any.
fn short_name_span(detailed: &str, qual: usize, short: Option<&str>) -> (usize, usize) {
    let tail = &detailed[qual..];
    let qualified = tail.find('(').map_or(tail, |end| &tail[..end]).trim_end();
    if let Some(short) = short.filter(|short| !short.is_empty()) {
        if let Some(pos) = qualified.rfind(short).or_else(|| tail.rfind(short)) {
            return (qual + pos, short.len());
        }
        return (qual, qualified.len());
    }
    match qualified.rfind("::") {
        Some(pos) => (qual + pos + 2, qualified.len() - pos - 2),
        None => (qual, qualified.len()),
    }
}

fn floor_char_boundary(text: &str, mut idx: usize) -> usize {
    while idx > 0 && !text.is_char_boundary(idx) {
        idx -= 1;
    }
    idx
}

fn name_offset(value: usize) -> u32 {
    u32::try_from(value).unwrap_or(u32::MAX)
}
