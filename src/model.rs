use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::ops::{BitOr, BitOrAssign};
use std::str::FromStr;

/// Stable symbol identifier shared by every observation of one logical symbol.
pub type Usr = u64;

/// Index into a file table. Local to a partial index until the linker remaps it.
pub type FileId = u32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Kind {
    Type,
    Func,
    Var,
}

impl Kind {
    pub fn as_str(self) -> &'static str {
        match self {
            Kind::Type => "type",
            Kind::Func => "func",
            Kind::Var => "var",
        }
    }
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SymbolKind {
    #[default]
    Unknown,
    File,
    Namespace,
    Class,
    Struct,
    Enum,
    Union,
    Interface,
    TypeAlias,
    TypeParameter,
    Function,
    Method,
    StaticMethod,
    Constructor,
    Destructor,
    Field,
    Variable,
    Parameter,
    EnumMember,
    Macro,
}

impl SymbolKind {
    pub fn is_function_like(self) -> bool {
        matches!(
            self,
            SymbolKind::Function
                | SymbolKind::Method
                | SymbolKind::StaticMethod
                | SymbolKind::Constructor
                | SymbolKind::Destructor
        )
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageClass {
    #[default]
    None,
    Extern,
    Static,
    PrivateExtern,
    Auto,
    Register,
}

/// How a symbol was used at one span. Flags combine freely: a single reference
/// may be both a call and a macro expansion.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct Role(u16);

impl Role {
    pub const NONE: Role = Role(0);
    pub const DECLARATION: Role = Role(1 << 0);
    pub const DEFINITION: Role = Role(1 << 1);
    pub const REFERENCE: Role = Role(1 << 2);
    pub const READ: Role = Role(1 << 3);
    pub const WRITE: Role = Role(1 << 4);
    pub const CALL: Role = Role(1 << 5);
    pub const DYNAMIC: Role = Role(1 << 6);
    pub const ADDRESS_OF: Role = Role(1 << 7);
    pub const IMPLICIT: Role = Role(1 << 8);
    pub const MACRO_EXPANSION: Role = Role(1 << 9);
    pub const ALL: Role = Role((1 << 10) - 1);

    const NAMES: [(Role, &'static str); 10] = [
        (Role::DECLARATION, "declaration"),
        (Role::DEFINITION, "definition"),
        (Role::REFERENCE, "reference"),
        (Role::READ, "read"),
        (Role::WRITE, "write"),
        (Role::CALL, "call"),
        (Role::DYNAMIC, "dynamic"),
        (Role::ADDRESS_OF, "address_of"),
        (Role::IMPLICIT, "implicit"),
        (Role::MACRO_EXPANSION, "macro_expansion"),
    ];

    pub const fn bits(self) -> u16 {
        self.0
    }

    pub const fn from_bits_truncate(bits: u16) -> Self {
        Role(bits & Role::ALL.0)
    }

    pub const fn contains(self, other: Role) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn intersects(self, other: Role) -> bool {
        self.0 & other.0 != 0
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn names(self) -> Vec<&'static str> {
        Role::NAMES
            .iter()
            .filter(|(flag, _)| self.contains(*flag))
            .map(|(_, name)| *name)
            .collect()
    }

    pub fn from_name(name: &str) -> Option<Role> {
        Role::NAMES
            .iter()
            .find(|(_, candidate)| *candidate == name)
            .map(|(flag, _)| *flag)
    }
}

/// Roles arrive either as the raw bitmask or as a list of flag names.
impl<'de> Deserialize<'de> for Role {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum RawRole {
            Bits(u16),
            Names(Vec<String>),
        }

        match RawRole::deserialize(deserializer)? {
            RawRole::Bits(bits) => Ok(Role::from_bits_truncate(bits)),
            RawRole::Names(names) => names.iter().try_fold(Role::NONE, |acc, name| {
                Role::from_name(name)
                    .map(|flag| acc | flag)
                    .ok_or_else(|| serde::de::Error::custom(format!("unknown role {name:?}")))
            }),
        }
    }
}

impl BitOr for Role {
    type Output = Role;

    fn bitor(self, rhs: Role) -> Role {
        Role(self.0 | rhs.0)
    }
}

impl BitOrAssign for Role {
    fn bitor_assign(&mut self, rhs: Role) {
        self.0 |= rhs.0;
    }
}

impl fmt::Debug for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return f.write_str("Role(none)");
        }
        write!(f, "Role({})", self.names().join("|"))
    }
}

/// 1-based line and column.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Position {
    pub line: u32,
    pub column: u32,
}

/// Half-open source range, written `line:col-line:col`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Range {
    pub start: Position,
    pub end: Position,
}

impl fmt::Display for Range {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}-{}:{}",
            self.start.line, self.start.column, self.end.line, self.end.column
        )
    }
}

#[derive(Debug, thiserror::Error)]
#[error("invalid range {0:?}, expected line:col-line:col")]
pub struct ParseRangeError(String);

impl FromStr for Range {
    type Err = ParseRangeError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let err = || ParseRangeError(raw.to_string());
        let (start, end) = raw.trim().split_once('-').ok_or_else(err)?;
        let parse_pos = |value: &str| -> Result<Position, ParseRangeError> {
            let (line, column) = value.split_once(':').ok_or_else(err)?;
            Ok(Position {
                line: line.parse().map_err(|_| err())?,
                column: column.parse().map_err(|_| err())?,
            })
        };
        Ok(Range {
            start: parse_pos(start)?,
            end: parse_pos(end)?,
        })
    }
}

impl Serialize for Range {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Range {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// A range inside one file of a file table.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Loc {
    pub file: FileId,
    pub range: Range,
}

impl Loc {
    pub fn new(file: FileId, range: Range) -> Self {
        Self { file, range }
    }
}

/// One occurrence of a symbol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Use {
    pub loc: Loc,
    pub role: Role,
    /// Contributed by a folded template instantiation rather than the template itself.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub folded: bool,
}

impl Use {
    pub fn new(loc: Loc, role: Role) -> Self {
        Self {
            loc,
            role,
            folded: false,
        }
    }

    pub fn key(&self) -> (Loc, Role) {
        (self.loc, self.role)
    }
}

/// A declaration or definition site: the name token plus the whole construct.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeclRef {
    pub loc: Loc,
    pub extent: Range,
    pub role: Role,
}

/// A call edge endpoint, seen from the other side of the edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CallRef {
    pub usr: Usr,
    pub loc: Loc,
    pub role: Role,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EntityCommon {
    pub usr: Usr,
    pub detailed_name: String,
    pub qual_name_offset: u32,
    pub short_name_offset: u32,
    pub short_name_size: u32,
    pub kind: SymbolKind,
    pub parent_kind: SymbolKind,
    pub storage: StorageClass,
    /// Namespace, class or function lexically containing the symbol.
    pub scope: Option<Usr>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub hover: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub comments: String,
    /// Canonical definition; absent while only forward-declared.
    pub spell: Option<DeclRef>,
    /// Most local declaration seen.
    pub decl: Option<DeclRef>,
    pub declarations: Vec<DeclRef>,
    pub uses: Vec<Use>,
}

impl EntityCommon {
    pub fn new(usr: Usr) -> Self {
        Self {
            usr,
            ..Default::default()
        }
    }

    pub fn short_name(&self) -> &str {
        let start = self.short_name_offset as usize;
        let end = start + self.short_name_size as usize;
        self.detailed_name.get(start..end).unwrap_or("")
    }

    pub fn qualified_name(&self) -> &str {
        let start = self.qual_name_offset as usize;
        let end = self.short_name_offset as usize + self.short_name_size as usize;
        self.detailed_name
            .get(start..end)
            .unwrap_or(&self.detailed_name)
    }

    pub fn has_name(&self) -> bool {
        !self.detailed_name.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TypeEntity {
    pub common: EntityCommon,
    pub alias_of: Option<Usr>,
    pub bases: Vec<Usr>,
    pub derived: Vec<Usr>,
    pub types: Vec<Usr>,
    pub funcs: Vec<Usr>,
    /// Member variables, with the enumerator value when the member is one.
    pub vars: Vec<(Usr, Option<i64>)>,
    pub instances: Vec<Usr>,
}

impl TypeEntity {
    pub fn new(usr: Usr) -> Self {
        Self {
            common: EntityCommon::new(usr),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FuncEntity {
    pub common: EntityCommon,
    pub declaring_type: Option<Usr>,
    /// Methods this one overrides.
    pub bases: Vec<Usr>,
    pub derived: Vec<Usr>,
    /// Locals and parameters.
    pub vars: Vec<Usr>,
    pub callers: Vec<CallRef>,
    pub callees: Vec<CallRef>,
}

impl FuncEntity {
    pub fn new(usr: Usr) -> Self {
        Self {
            common: EntityCommon::new(usr),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VarEntity {
    pub common: EntityCommon,
    pub declaring_type: Option<Usr>,
    /// Type of the variable, or the template it instantiates when folded.
    pub type_usr: Option<Usr>,
    pub enum_value: Option<i64>,
}

impl VarEntity {
    pub fn new(usr: Usr) -> Self {
        Self {
            common: EntityCommon::new(usr),
            ..Default::default()
        }
    }

    pub fn is_local(&self) -> bool {
        self.common.spell.is_some()
            && self.common.parent_kind.is_function_like()
            && self.common.storage == StorageClass::None
    }
}

/// A canonical record for one type, function, or variable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind_tag", rename_all = "lowercase")]
pub enum Entity {
    Type(TypeEntity),
    Func(FuncEntity),
    Var(VarEntity),
}

impl Entity {
    pub fn new(kind: Kind, usr: Usr) -> Self {
        match kind {
            Kind::Type => Entity::Type(TypeEntity::new(usr)),
            Kind::Func => Entity::Func(FuncEntity::new(usr)),
            Kind::Var => Entity::Var(VarEntity::new(usr)),
        }
    }

    pub fn kind(&self) -> Kind {
        match self {
            Entity::Type(_) => Kind::Type,
            Entity::Func(_) => Kind::Func,
            Entity::Var(_) => Kind::Var,
        }
    }

    pub fn common(&self) -> &EntityCommon {
        match self {
            Entity::Type(entity) => &entity.common,
            Entity::Func(entity) => &entity.common,
            Entity::Var(entity) => &entity.common,
        }
    }

    pub fn common_mut(&mut self) -> &mut EntityCommon {
        match self {
            Entity::Type(entity) => &mut entity.common,
            Entity::Func(entity) => &mut entity.common,
            Entity::Var(entity) => &mut entity.common,
        }
    }

    pub fn usr(&self) -> Usr {
        self.common().usr
    }

    pub fn as_type(&self) -> Option<&TypeEntity> {
        match self {
            Entity::Type(entity) => Some(entity),
            _ => None,
        }
    }

    pub fn as_func(&self) -> Option<&FuncEntity> {
        match self {
            Entity::Func(entity) => Some(entity),
            _ => None,
        }
    }

    pub fn as_var(&self) -> Option<&VarEntity> {
        match self {
            Entity::Var(entity) => Some(entity),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn range_round_trips_through_text() {
        let range: Range = "3:5-3:8".parse().unwrap();
        assert_eq!(range.start, Position { line: 3, column: 5 });
        assert_eq!(range.end, Position { line: 3, column: 8 });
        assert_eq!(range.to_string(), "3:5-3:8");
        assert!("3:5".parse::<Range>().is_err());
        assert!("a:b-c:d".parse::<Range>().is_err());
    }

    #[test]
    fn role_flags_combine() {
        let role = Role::CALL | Role::MACRO_EXPANSION;
        assert!(role.contains(Role::CALL));
        assert!(role.contains(Role::MACRO_EXPANSION));
        assert!(!role.contains(Role::READ));
        assert_eq!(role.names(), vec!["call", "macro_expansion"]);
        assert_eq!(Role::from_name("address_of"), Some(Role::ADDRESS_OF));
        assert_eq!(Role::from_bits_truncate(u16::MAX), Role::ALL);
    }

    #[test]
    fn names_are_sliced_from_detailed_name() {
        let mut common = EntityCommon::new(1);
        common.detailed_name = "void ns::Foo::bar(int)".to_string();
        common.qual_name_offset = 5;
        common.short_name_offset = 14;
        common.short_name_size = 3;
        assert_eq!(common.short_name(), "bar");
        assert_eq!(common.qualified_name(), "ns::Foo::bar");
    }

    #[test]
    fn local_variables_need_function_parent() {
        let mut var = VarEntity::new(7);
        var.common.parent_kind = SymbolKind::Method;
        assert!(!var.is_local());
        var.common.spell = Some(DeclRef {
            loc: Loc::default(),
            extent: Range::default(),
            role: Role::DEFINITION,
        });
        assert!(var.is_local());
        var.common.storage = StorageClass::Static;
        assert!(!var.is_local());
    }
}
