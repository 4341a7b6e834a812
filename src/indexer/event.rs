//! Events emitted by the analysis front end, one JSON object per line.

use crate::indexer::stable_id;
use crate::model::{Kind, Range, Role, StorageClass, SymbolKind, Usr};
use serde::{Deserialize, Serialize};

/// A symbol identifier as sent by the front end: either already hashed or the
/// raw USR text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SymbolKey {
    Hash(Usr),
    Text(String),
}

impl SymbolKey {
    pub fn resolve(&self) -> Usr {
        match self {
            SymbolKey::Hash(usr) => *usr,
            SymbolKey::Text(text) => stable_id::usr_from_str(text),
        }
    }
}

impl From<Usr> for SymbolKey {
    fn from(usr: Usr) -> Self {
        SymbolKey::Hash(usr)
    }
}

impl From<&str> for SymbolKey {
    fn from(text: &str) -> Self {
        SymbolKey::Text(text.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Span {
    pub file: String,
    pub range: Range,
}

impl Span {
    pub fn new(file: impl Into<String>, range: Range) -> Self {
        Self {
            file: file.into(),
            range,
        }
    }
}

/// Where a macro was invoked when the call it produced is reported.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MacroSite {
    pub macro_usr: SymbolKey,
    pub invocation: Span,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnitHeader {
    pub path: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub language: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Declaration {
    pub usr: SymbolKey,
    pub kind: Kind,
    #[serde(default)]
    pub symbol_kind: SymbolKind,
    pub detailed_name: String,
    /// Falls back to the whole detailed name after the qualifier offset.
    #[serde(default)]
    pub short_name: Option<String>,
    #[serde(default)]
    pub qual_name_offset: u32,
    pub spell: Span,
    #[serde(default)]
    pub extent: Option<Range>,
    pub role: Role,
    #[serde(default)]
    pub storage: StorageClass,
    #[serde(default)]
    pub scope: Option<SymbolKey>,
    #[serde(default)]
    pub parent_kind: SymbolKind,
    #[serde(default)]
    pub type_usr: Option<SymbolKey>,
    #[serde(default)]
    pub alias_of: Option<SymbolKey>,
    /// Set when this declaration is an instantiation of a generic symbol.
    #[serde(default)]
    pub template_of: Option<SymbolKey>,
    #[serde(default)]
    pub enumerator_of: Option<SymbolKey>,
    #[serde(default)]
    pub initializer: Option<i64>,
    #[serde(default)]
    pub hover: Option<String>,
    #[serde(default)]
    pub comments: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reference {
    pub usr: SymbolKey,
    pub kind: Kind,
    pub span: Span,
    pub role: Role,
    #[serde(default)]
    pub template_of: Option<SymbolKey>,
    #[serde(default)]
    pub macro_site: Option<MacroSite>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallSite {
    /// Absent for calls made outside any function body.
    #[serde(default)]
    pub caller: Option<SymbolKey>,
    pub callee: SymbolKey,
    pub span: Span,
    #[serde(default = "default_call_role")]
    pub role: Role,
    #[serde(default)]
    pub macro_site: Option<MacroSite>,
}

fn default_call_role() -> Role {
    Role::CALL
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Inheritance {
    pub parent: SymbolKey,
    pub child: SymbolKey,
    /// `type` for class bases, `func` for method overrides.
    #[serde(default = "default_inherit_kind")]
    pub kind: Kind,
    #[serde(default)]
    pub span: Option<Span>,
}

fn default_inherit_kind() -> Kind {
    Kind::Type
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Membership {
    /// Absent when the front end could not determine the owner.
    #[serde(default)]
    pub owner: Option<SymbolKey>,
    #[serde(default = "default_owner_kind")]
    pub owner_kind: Kind,
    pub member: SymbolKey,
    pub kind: Kind,
}

fn default_owner_kind() -> Kind {
    Kind::Type
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Instantiation {
    pub template: SymbolKey,
    #[serde(default = "default_inherit_kind")]
    pub template_kind: Kind,
    pub instance: SymbolKey,
    pub instance_kind: Kind,
    #[serde(default)]
    pub span: Option<Span>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MacroExpansion {
    pub macro_usr: SymbolKey,
    pub span: Span,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Include {
    pub line: u32,
    pub resolved_path: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SkippedRange {
    pub span: Span,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum Event {
    Unit(UnitHeader),
    Declare(Declaration),
    Reference(Reference),
    Call(CallSite),
    Inherit(Inheritance),
    Member(Membership),
    Instantiate(Instantiation),
    MacroExpansion(MacroExpansion),
    Include(Include),
    SkippedRange(SkippedRange),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_declare_event() {
        let line = r#"{"event":"declare","usr":"c:@F@foo#","kind":"func","symbol_kind":"function","detailed_name":"void foo()","short_name":"foo","qual_name_offset":5,"spell":{"file":"a.cc","range":"1:6-1:9"},"extent":"1:1-1:11","role":2}"#;
        let event: Event = serde_json::from_str(line).unwrap();
        let Event::Declare(decl) = event else {
            panic!("expected declare event");
        };
        assert_eq!(decl.kind, Kind::Func);
        assert_eq!(decl.symbol_kind, SymbolKind::Function);
        assert_eq!(decl.role, Role::DEFINITION);
        assert_eq!(decl.spell.range.to_string(), "1:6-1:9");
        assert_eq!(decl.usr.resolve(), stable_id::usr_from_str("c:@F@foo#"));
    }

    #[test]
    fn numeric_keys_are_used_verbatim() {
        let line = r#"{"event":"call","caller":11,"callee":12,"span":{"file":"a.cc","range":"4:3-4:6"}}"#;
        let event: Event = serde_json::from_str(line).unwrap();
        let Event::Call(call) = event else {
            panic!("expected call event");
        };
        assert_eq!(call.caller.map(|key| key.resolve()), Some(11));
        assert_eq!(call.callee.resolve(), 12);
        assert_eq!(call.role, Role::CALL);
    }

    #[test]
    fn role_accepts_flag_names() {
        let line = r#"{"event":"reference","usr":3,"kind":"var","span":{"file":"a.cc","range":"2:1-2:2"},"role":["read","write"]}"#;
        let event: Event = serde_json::from_str(line).unwrap();
        let Event::Reference(reference) = event else {
            panic!("expected reference event");
        };
        assert_eq!(reference.role, Role::READ | Role::WRITE);
    }
}
