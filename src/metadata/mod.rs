//! Minimal metadata model the analyzer works on.
//!
//! The model only carries what override and interface resolution need: types
//! with their kind, base type, interfaces, methods, custom attributes and
//! explicit overrides. Adapters map real metadata sources onto it:
//!
//! - [`json`]: a serialized dump of the model itself
//! - [`il`]: the text produced by disassembling a managed module

pub mod il;
pub mod json;

use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssemblyIdentity {
    pub name: String,
    #[serde(default)]
    pub version: Option<String>,
}

/// A decoded custom attribute constructor argument.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "lowercase")]
pub enum AttributeArg {
    String(Option<String>),
    Type(String),
    Int(i64),
    Bool(bool),
    /// Anything the adapters do not decode; kept as source text.
    Other(String),
}

impl AttributeArg {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            AttributeArg::String(Some(value)) => Some(value),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CustomAttribute {
    /// Full name of the attribute type, without assembly qualifier.
    pub type_name: String,
    #[serde(default)]
    pub args: Vec<AttributeArg>,
}

impl CustomAttribute {
    pub fn simple_name(&self) -> &str {
        simple_name(&self.type_name)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Visibility {
    #[default]
    Private,
    Public,
    Family,
    Assembly,
    FamilyOrAssembly,
    FamilyAndAssembly,
    CompilerControlled,
}

/// Reference to a method by declaring type, name and optional parameter list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberRef {
    pub declaring_type: String,
    pub name: String,
    /// `None` matches any overload.
    #[serde(default)]
    pub params: Option<Vec<String>>,
}

impl MemberRef {
    pub fn matches(&self, method: &MethodDef) -> bool {
        self.name == method.name
            && self
                .params
                .as_ref()
                .map_or(true, |params| *params == method.params)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MethodDef {
    pub name: String,
    /// Normalized parameter types.
    #[serde(default)]
    pub params: Vec<String>,
    #[serde(default)]
    pub visibility: Visibility,
    #[serde(default)]
    pub is_static: bool,
    #[serde(default)]
    pub is_virtual: bool,
    #[serde(default)]
    pub is_abstract: bool,
    #[serde(default)]
    pub is_newslot: bool,
    #[serde(default)]
    pub is_final: bool,
    /// Explicit `.override` targets.
    #[serde(default)]
    pub overrides: Vec<MemberRef>,
}

impl MethodDef {
    pub fn same_signature(&self, other: &MethodDef) -> bool {
        self.name == other.name && self.params == other.params
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TypeKind {
    #[default]
    Class,
    Interface,
    ValueType,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypeDef {
    /// Namespace-qualified name; nested types use `Outer/Inner`.
    pub full_name: String,
    #[serde(default)]
    pub kind: TypeKind,
    #[serde(default)]
    pub is_abstract: bool,
    #[serde(default)]
    pub base_type: Option<String>,
    /// Interfaces listed directly on this type.
    #[serde(default)]
    pub interfaces: Vec<String>,
    #[serde(default)]
    pub methods: Vec<MethodDef>,
    #[serde(default)]
    pub attributes: Vec<CustomAttribute>,
}

impl TypeDef {
    pub fn simple_name(&self) -> &str {
        simple_name(&self.full_name)
    }

    pub fn is_interface(&self) -> bool {
        self.kind == TypeKind::Interface
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Module {
    pub assembly: AssemblyIdentity,
    /// Assembly and module level attributes.
    #[serde(default)]
    pub attributes: Vec<CustomAttribute>,
    #[serde(default)]
    pub types: Vec<TypeDef>,
}

impl Module {
    pub fn find_type(&self, full_name: &str) -> Option<&TypeDef> {
        self.types.iter().find(|t| t.full_name == full_name)
    }

    pub fn attribute(&self, simple: &str) -> Option<&CustomAttribute> {
        self.attributes.iter().find(|a| a.simple_name() == simple)
    }

    /// Description from the module's version metadata, if any.
    pub fn description(&self) -> Option<&str> {
        self.attribute("AssemblyDescriptionAttribute")
            .and_then(|a| a.args.first())
            .and_then(AttributeArg::as_str)
            .filter(|text| !text.trim().is_empty())
    }

    /// File version, falling back to the assembly version.
    pub fn file_version(&self) -> Option<&str> {
        self.attribute("AssemblyFileVersionAttribute")
            .and_then(|a| a.args.first())
            .and_then(AttributeArg::as_str)
            .or(self.assembly.version.as_deref())
    }
}

/// Last dotted or nested segment of a type name.
pub fn simple_name(full_name: &str) -> &str {
    full_name
        .rsplit(|c| c == '.' || c == '/')
        .next()
        .unwrap_or(full_name)
}

/// Where a type in the universe came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    User,
    Reference,
}

/// Identifies a method by its declaring type and position.
#[derive(Debug, Clone, Copy)]
pub struct MethodHandle<'a> {
    pub owner: &'a TypeDef,
    pub index: usize,
}

impl<'a> MethodHandle<'a> {
    pub fn def(&self) -> &'a MethodDef {
        &self.owner.methods[self.index]
    }
}

impl PartialEq for MethodHandle<'_> {
    fn eq(&self, other: &Self) -> bool {
        self.index == other.index && self.owner.full_name == other.owner.full_name
    }
}

impl Eq for MethodHandle<'_> {}

/// All types visible to the analyzer: the user module plus its references.
pub struct TypeUniverse<'a> {
    types: HashMap<&'a str, (&'a TypeDef, Origin)>,
}

impl<'a> TypeUniverse<'a> {
    pub fn new(user: &'a Module, references: &'a [Module]) -> Self {
        let mut types = HashMap::new();
        for module in references {
            for ty in &module.types {
                types.insert(ty.full_name.as_str(), (ty, Origin::Reference));
            }
        }
        // User definitions shadow reference ones.
        for ty in &user.types {
            types.insert(ty.full_name.as_str(), (ty, Origin::User));
        }
        Self { types }
    }

    pub fn get(&self, full_name: &str) -> Option<&'a TypeDef> {
        self.types.get(full_name).map(|(ty, _)| *ty)
    }

    pub fn is_user_type(&self, full_name: &str) -> bool {
        matches!(self.types.get(full_name), Some((_, Origin::User)))
    }

    pub fn base_of(&self, ty: &TypeDef) -> Option<&'a TypeDef> {
        ty.base_type.as_deref().and_then(|name| self.get(name))
    }

    /// The type and its resolvable base types, most derived first.
    pub fn ancestry(&self, ty: &'a TypeDef) -> Vec<&'a TypeDef> {
        let mut chain = vec![ty];
        let mut seen = BTreeSet::from([ty.full_name.as_str()]);
        let mut current = ty;
        while let Some(base) = self.base_of(current) {
            if !seen.insert(base.full_name.as_str()) {
                break;
            }
            chain.push(base);
            current = base;
        }
        chain
    }

    /// Whether `ty` has a base class with simple name `base_simple`.
    pub fn derives_from(&self, ty: &'a TypeDef, base_simple: &str) -> bool {
        let mut seen = BTreeSet::new();
        let mut current = ty.base_type.as_deref();
        while let Some(name) = current {
            if simple_name(name) == base_simple {
                return true;
            }
            if !seen.insert(name) {
                return false;
            }
            current = self.get(name).and_then(|t| t.base_type.as_deref());
        }
        false
    }

    /// Interfaces a type implements, through base types and interface
    /// inheritance, in discovery order.
    pub fn all_interfaces(&self, ty: &'a TypeDef) -> Vec<&'a str> {
        let mut found: Vec<&'a str> = Vec::new();
        for t in self.ancestry(ty) {
            for name in &t.interfaces {
                self.collect_interface(name, &mut found);
            }
        }
        found
    }

    fn collect_interface(&self, name: &'a str, found: &mut Vec<&'a str>) {
        if found.contains(&name) {
            return;
        }
        found.push(name);
        if let Some(iface) = self.get(name) {
            for inherited in &iface.interfaces {
                self.collect_interface(inherited, found);
            }
        }
    }

    /// Whether `ty` lists `interface` itself, or through one of its listed
    /// interfaces' inheritance.
    pub fn declares_interface(&self, ty: &'a TypeDef, interface: &str) -> bool {
        let mut found = Vec::new();
        for name in &ty.interfaces {
            self.collect_interface(name, &mut found);
        }
        found.iter().any(|name| *name == interface)
    }
}

/// Normalizes a type as written in IL text so signatures compare equal
/// across modules: drops assembly scopes, `class`/`valuetype` keywords and
/// collapses whitespace.
pub fn normalize_type(text: &str) -> String {
    let mut without_scopes = String::with_capacity(text.len());
    let mut chars = text.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '[' {
            // `[asm]` scopes precede a type name; `[]` and `[0...]` are arrays.
            let mut scope = String::new();
            let mut closed = false;
            for inner in chars.by_ref() {
                if inner == ']' {
                    closed = true;
                    break;
                }
                scope.push(inner);
            }
            let is_array = scope.is_empty()
                || scope
                    .chars()
                    .all(|ch| ch.is_ascii_digit() || matches!(ch, '.' | ',' | ' '));
            // Assembly scopes and `[in]`/`[out]`/`[opt]` markers are dropped.
            if is_array || !closed {
                without_scopes.push('[');
                without_scopes.push_str(&scope);
                if closed {
                    without_scopes.push(']');
                }
            }
        } else {
            without_scopes.push(c);
        }
    }

    without_scopes
        .split_whitespace()
        .filter(|token| !matches!(*token, "class" | "valuetype"))
        .collect::<Vec<_>>()
        .join(" ")
        .replace(" &", "&")
        .replace(" *", "*")
        .replace(" []", "[]")
}
