//! Maps user methods onto the cataloged interface members they implement.

use crate::catalog::ContractCatalog;
use crate::metadata::{simple_name, MemberRef, MethodHandle, TypeDef, TypeUniverse, Visibility};
use crate::plugin::{PluginDeclaration, PluginKind};
use serde::Serialize;
use std::collections::{BTreeSet, HashSet};
use tracing::{debug, trace};

/// A cataloged interface member the user's code implements.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct ImplementedMember {
    /// `Interface.Member`, as in the catalog.
    pub signature: String,
    /// User type declaring the implementing method.
    pub declaring_type: String,
}

pub struct OverrideResolver<'u, 'a> {
    universe: &'u TypeUniverse<'a>,
    catalog: &'u ContractCatalog,
}

impl<'u, 'a> OverrideResolver<'u, 'a> {
    pub fn new(universe: &'u TypeUniverse<'a>, catalog: &'u ContractCatalog) -> Self {
        Self { universe, catalog }
    }

    /// The cataloged member `method` implements for the declaration's kind.
    ///
    /// Walks the override chain upward from `method`; at every link the
    /// containing type's interface mappings are checked, and the first link
    /// that implements a member of the kind's catalog wins. Methods outside
    /// the user module never count.
    pub fn resolve(
        &self,
        method: MethodHandle<'a>,
        declaration: &PluginDeclaration,
    ) -> Option<ImplementedMember> {
        if !self.universe.is_user_type(&method.owner.full_name) {
            return None;
        }
        for link in self.override_chain(method) {
            if let Some(signature) = self.implemented_signature(link, declaration.kind) {
                trace!(
                    "{}::{} implements {}",
                    method.owner.full_name,
                    method.def().name,
                    signature
                );
                return Some(ImplementedMember {
                    signature,
                    declaring_type: method.owner.full_name.clone(),
                });
            }
        }
        let signature = self.unresolved_base_signature(method, declaration.kind)?;
        trace!(
            "{}::{} matched {} by name, base class not loaded",
            method.owner.full_name,
            method.def().name,
            signature
        );
        Some(ImplementedMember {
            signature,
            declaring_type: method.owner.full_name.clone(),
        })
    }

    /// Catalog signature named by a public virtual override in a class whose
    /// base chain ends at the kind's base class without its definition
    /// loaded.
    fn unresolved_base_signature(&self, method: MethodHandle<'a>, kind: PluginKind) -> Option<String> {
        let def = method.def();
        if def.visibility != Visibility::Public || !def.is_virtual || def.is_newslot || def.is_static {
            return None;
        }
        let root = self.universe.ancestry(method.owner).last().copied()?;
        let base = root.base_type.as_deref()?;
        if self.universe.get(base).is_some() || simple_name(base) != kind.base_class_name() {
            return None;
        }
        let signature = format!("{}.{}", kind.interface_name(), def.name);
        self.catalog.lookup(kind, &signature).map(|_| signature)
    }

    /// `method` followed by the methods it overrides, nearest first.
    fn override_chain(&self, method: MethodHandle<'a>) -> Vec<MethodHandle<'a>> {
        let mut chain = vec![method];
        let mut seen = HashSet::from([(method.owner.full_name.as_str(), method.index)]);
        let mut current = method;
        while let Some(next) = self.overridden(current) {
            if !seen.insert((next.owner.full_name.as_str(), next.index)) {
                debug!(
                    "override cycle at {}::{}",
                    next.owner.full_name,
                    next.def().name
                );
                break;
            }
            chain.push(next);
            current = next;
        }
        chain
    }

    /// The class method `method` overrides, explicitly or implicitly.
    fn overridden(&self, method: MethodHandle<'a>) -> Option<MethodHandle<'a>> {
        let def = method.def();
        for target in &def.overrides {
            let Some(owner) = self.universe.get(&target.declaring_type) else {
                continue;
            };
            if owner.is_interface() {
                continue;
            }
            if let Some(index) = owner.methods.iter().position(|m| target.matches(m)) {
                return Some(MethodHandle { owner, index });
            }
        }

        if !def.is_virtual || def.is_newslot || def.is_static {
            return None;
        }
        self.universe
            .ancestry(method.owner)
            .into_iter()
            .skip(1)
            .find_map(|base| {
                base.methods
                    .iter()
                    .position(|m| m.is_virtual && !m.is_static && m.same_signature(def))
                    .map(|index| MethodHandle { owner: base, index })
            })
    }

    /// Catalog signature of the interface member `method` implements in its
    /// own type, if any.
    fn implemented_signature(&self, method: MethodHandle<'a>, kind: PluginKind) -> Option<String> {
        let owner = method.owner;
        for interface in self.universe.all_interfaces(owner) {
            for member in self.interface_members(interface, kind) {
                let signature = format!("{}.{}", simple_name(interface), member.name);
                if self.catalog.lookup(kind, &signature).is_none() {
                    continue;
                }
                if self.implementation(owner, &member) == Some(method) {
                    return Some(signature);
                }
            }
        }
        None
    }

    /// Members of `interface`, or the catalog's names for the kind's
    /// interface when its definition is not available.
    fn interface_members(&self, interface: &str, kind: PluginKind) -> Vec<MemberRef> {
        if let Some(def) = self.universe.get(interface) {
            return def
                .methods
                .iter()
                .map(|m| MemberRef {
                    declaring_type: interface.to_string(),
                    name: m.name.clone(),
                    params: Some(m.params.clone()),
                })
                .collect();
        }
        if simple_name(interface) != kind.interface_name() {
            return Vec::new();
        }
        self.catalog
            .contracts(kind)
            .iter()
            .map(|contract| MemberRef {
                declaring_type: interface.to_string(),
                name: contract.member_name().to_string(),
                params: None,
            })
            .collect()
    }

    /// The method `ty` uses to implement `member`.
    ///
    /// An explicit `.override` wins; otherwise a type that lists the
    /// interface maps it to a public virtual method with the same name and
    /// parameters in itself or a base; otherwise the base type's mapping
    /// applies.
    fn implementation(&self, ty: &'a TypeDef, member: &MemberRef) -> Option<MethodHandle<'a>> {
        let mut visited = HashSet::new();
        let mut current = Some(ty);
        while let Some(t) = current {
            if !visited.insert(t.full_name.as_str()) {
                return None;
            }
            let explicit = t
                .methods
                .iter()
                .position(|m| m.overrides.iter().any(|o| same_member(o, member)));
            if let Some(index) = explicit {
                return Some(MethodHandle { owner: t, index });
            }
            if self.universe.declares_interface(t, &member.declaring_type) {
                let implicit = self.universe.ancestry(t).into_iter().find_map(|candidate| {
                    candidate
                        .methods
                        .iter()
                        .position(|m| {
                            m.visibility == Visibility::Public
                                && m.is_virtual
                                && !m.is_static
                                && member.matches(m)
                        })
                        .map(|index| MethodHandle { owner: candidate, index })
                });
                if implicit.is_some() {
                    return implicit;
                }
            }
            current = self.universe.base_of(t);
        }
        None
    }
}

/// Same interface member; a missing parameter list matches any overload.
fn same_member(a: &MemberRef, b: &MemberRef) -> bool {
    a.declaring_type == b.declaring_type
        && a.name == b.name
        && (a.params.is_none() || b.params.is_none() || a.params == b.params)
}

/// Every cataloged member implemented by methods declared in the user part
/// of the declared class's hierarchy.
pub fn implemented_members(
    universe: &TypeUniverse<'_>,
    catalog: &ContractCatalog,
    declaration: &PluginDeclaration,
) -> BTreeSet<ImplementedMember> {
    let resolver = OverrideResolver::new(universe, catalog);
    let mut implemented = BTreeSet::new();
    let Some(class) = universe.get(&declaration.class_name) else {
        debug!("declared class {} not found", declaration.class_name);
        return implemented;
    };

    for ty in universe
        .ancestry(class)
        .into_iter()
        .take_while(|t| universe.is_user_type(&t.full_name))
    {
        for (index, method) in ty.methods.iter().enumerate() {
            if method.is_static || method.is_abstract {
                continue;
            }
            let handle = MethodHandle { owner: ty, index };
            if let Some(member) = resolver.resolve(handle, declaration) {
                implemented.insert(member);
            }
        }
    }
    debug!(
        "{} implements {} cataloged {} members",
        declaration.class_name,
        implemented.len(),
        declaration.kind
    );
    implemented
}
