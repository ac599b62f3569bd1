//! Which native exports a module keeps.

use crate::catalog::{ContractCatalog, MethodContract};
use crate::error::{Error, Result};
use crate::plugin::PluginKind;
use crate::resolver::ImplementedMember;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub enum RetainReason {
    Mandatory,
    BaseImplemented,
    ImplementedByUser,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Verdict {
    Retain(RetainReason),
    Strip,
}

impl Verdict {
    pub fn is_retained(&self) -> bool {
        matches!(self, Verdict::Retain(_))
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Verdict::Retain(RetainReason::Mandatory) => f.write_str("retain (mandatory)"),
            Verdict::Retain(RetainReason::BaseImplemented) => f.write_str("retain (base)"),
            Verdict::Retain(RetainReason::ImplementedByUser) => f.write_str("retain (implemented)"),
            Verdict::Strip => f.write_str("strip"),
        }
    }
}

/// Verdict for every export name the effective kind can carry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExportDecision {
    pub kind: PluginKind,
    /// Content was folded into a FileSystem module.
    pub merged: bool,
    pub verdicts: BTreeMap<String, Verdict>,
}

impl ExportDecision {
    pub fn verdict(&self, name: &str) -> Option<Verdict> {
        self.verdicts.get(name).copied()
    }

    pub fn retained(&self) -> BTreeSet<&str> {
        self.names(true)
    }

    pub fn stripped(&self) -> BTreeSet<&str> {
        self.names(false)
    }

    /// Names to remove from the wrapper.
    pub fn excluded(&self) -> BTreeSet<String> {
        self.stripped().into_iter().map(str::to_string).collect()
    }

    fn names(&self, retained: bool) -> BTreeSet<&str> {
        self.verdicts
            .iter()
            .filter(|(_, verdict)| verdict.is_retained() == retained)
            .map(|(name, _)| name.as_str())
            .collect()
    }
}

fn reason(contract: &MethodContract, implemented: &BTreeSet<ImplementedMember>) -> Option<RetainReason> {
    if contract.mandatory {
        Some(RetainReason::Mandatory)
    } else if contract.base_implemented {
        Some(RetainReason::BaseImplemented)
    } else if implemented.iter().any(|m| m.signature == contract.signature) {
        Some(RetainReason::ImplementedByUser)
    } else {
        None
    }
}

/// Decision for a module implementing a single kind.
pub fn compute(
    catalog: &ContractCatalog,
    kind: PluginKind,
    implemented: &BTreeSet<ImplementedMember>,
) -> ExportDecision {
    let mut verdicts: BTreeMap<String, Verdict> = catalog
        .export_universe(kind)
        .into_iter()
        .map(|name| (name.to_string(), Verdict::Strip))
        .collect();

    for contract in catalog.contracts(kind) {
        if let Some(reason) = reason(contract, implemented) {
            for name in contract.export_names {
                verdicts.insert(name.to_string(), Verdict::Retain(reason));
            }
        }
    }

    ExportDecision {
        kind,
        merged: false,
        verdicts,
    }
}

/// Decision for a whole module from the implemented sets of every declared
/// kind.
///
/// A FileSystem module that also declares Content becomes one FileSystem
/// decision in which Content members are exported under their `FsContent*`
/// aliases. Every other combination of kinds is rejected.
pub fn compute_for_module(
    catalog: &ContractCatalog,
    module: &str,
    analyses: &BTreeMap<PluginKind, BTreeSet<ImplementedMember>>,
) -> Result<ExportDecision> {
    let kinds: Vec<PluginKind> = analyses.keys().copied().collect();
    match kinds.as_slice() {
        [] => Err(Error::NoPluginFound {
            module: module.to_string(),
            diagnostics: Vec::new(),
        }),
        [kind] => Ok(compute(catalog, *kind, &analyses[kind])),
        [PluginKind::FileSystem, PluginKind::Content] => {
            let mut decision = compute(
                catalog,
                PluginKind::FileSystem,
                &analyses[&PluginKind::FileSystem],
            );
            let content = &analyses[&PluginKind::Content];
            for contract in catalog.contracts(PluginKind::Content) {
                if let Some(reason) = reason(contract, content) {
                    for name in contract.merged_export_names {
                        decision
                            .verdicts
                            .insert(name.to_string(), Verdict::Retain(reason));
                    }
                }
            }
            decision.merged = true;
            Ok(decision)
        }
        _ => Err(Error::ConflictingPluginKinds { kinds }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn members(kind: PluginKind, names: &[&str]) -> BTreeSet<ImplementedMember> {
        names
            .iter()
            .map(|name| ImplementedMember {
                signature: format!("{}.{}", kind.interface_name(), name),
                declaring_type: "Sample.Plugin".into(),
            })
            .collect()
    }

    fn optional_retained(decision: &ExportDecision) -> BTreeSet<&str> {
        decision
            .verdicts
            .iter()
            .filter(|(_, v)| **v == Verdict::Retain(RetainReason::ImplementedByUser))
            .map(|(name, _)| name.as_str())
            .collect()
    }

    #[test]
    fn test_file_system_listing_only() {
        let catalog = ContractCatalog::load();
        let implemented = members(PluginKind::FileSystem, &["FindFirst"]);
        let decision = compute(&catalog, PluginKind::FileSystem, &implemented);

        let mandatory: BTreeSet<&str> = decision
            .verdicts
            .iter()
            .filter(|(_, v)| **v == Verdict::Retain(RetainReason::Mandatory))
            .map(|(name, _)| name.as_str())
            .collect();
        assert_eq!(
            mandatory,
            BTreeSet::from(["FsFindFirst", "FsFindFirstW", "FsFindNext", "FsFindNextW", "FsFindClose"])
        );
        assert!(optional_retained(&decision).is_empty());
        assert_eq!(
            decision.verdict("FsInitW"),
            Some(Verdict::Retain(RetainReason::BaseImplemented))
        );
        for name in decision.verdicts.keys().filter(|n| n.starts_with("FsContent")) {
            assert_eq!(decision.verdict(name), Some(Verdict::Strip), "{name}");
        }
        assert_eq!(decision.verdict("FsMkDir"), Some(Verdict::Strip));
        assert!(!decision.merged);
    }

    #[test]
    fn test_lister_load_only() {
        let catalog = ContractCatalog::load();
        let decision = compute(&catalog, PluginKind::Lister, &members(PluginKind::Lister, &["Load"]));
        assert!(decision.retained().is_superset(&BTreeSet::from(["ListLoad", "ListLoadW"])));
        for name in ["ListLoadNext", "ListLoadNextW", "ListSearchText", "ListPrintW"] {
            assert_eq!(decision.verdict(name), Some(Verdict::Strip), "{name}");
        }
        assert_eq!(
            decision.retained(),
            BTreeSet::from(["ListLoad", "ListLoadW", "ListSetDefaultParams"])
        );
    }

    #[test]
    fn test_user_implementation_retains_all_aliases() {
        let catalog = ContractCatalog::load();
        let decision = compute(
            &catalog,
            PluginKind::FileSystem,
            &members(PluginKind::FileSystem, &["GetDefaultView", "MkDir"]),
        );
        assert_eq!(
            optional_retained(&decision),
            BTreeSet::from(["FsContentGetDefaultView", "FsContentGetDefaultViewW", "FsMkDir", "FsMkDirW"])
        );
    }

    #[test]
    fn test_members_of_other_kinds_are_ignored() {
        let catalog = ContractCatalog::load();
        let decision = compute(&catalog, PluginKind::Lister, &members(PluginKind::Packer, &["PackFiles"]));
        assert!(!decision.verdicts.contains_key("PackFiles"));
        assert!(optional_retained(&decision).is_empty());
    }

    #[test]
    fn test_merge_file_system_with_content() {
        let catalog = ContractCatalog::load();
        let fs = members(PluginKind::FileSystem, &["MkDir"]);
        let analyses = BTreeMap::from([
            (PluginKind::FileSystem, fs.clone()),
            (PluginKind::Content, members(PluginKind::Content, &["SetValue"])),
        ]);
        let merged = compute_for_module(&catalog, "Sample", &analyses).unwrap();
        let alone = compute(&catalog, PluginKind::FileSystem, &fs);

        assert_eq!(merged.kind, PluginKind::FileSystem);
        assert!(merged.merged);
        assert!(merged.retained().is_superset(&alone.retained()));
        for name in [
            "FsContentGetSupportedField",
            "FsContentGetValueW",
            "FsContentPluginUnloading",
            "FsContentSetValueW",
        ] {
            assert!(merged.verdict(name).unwrap().is_retained(), "{name}");
        }
        assert_eq!(merged.verdict("FsContentStopGetValue"), Some(Verdict::Strip));
        assert!(!merged.verdicts.contains_key("ContentGetValue"));
    }

    #[test]
    fn test_other_combinations_conflict() {
        let catalog = ContractCatalog::load();
        let analyses = BTreeMap::from([
            (PluginKind::Lister, BTreeSet::new()),
            (PluginKind::Content, BTreeSet::new()),
        ]);
        let err = compute_for_module(&catalog, "Sample", &analyses).unwrap_err();
        assert!(matches!(
            err,
            Error::ConflictingPluginKinds { ref kinds }
                if kinds == &vec![PluginKind::Content, PluginKind::Lister]
        ));

        let three = BTreeMap::from([
            (PluginKind::FileSystem, BTreeSet::new()),
            (PluginKind::Content, BTreeSet::new()),
            (PluginKind::QuickSearch, BTreeSet::new()),
        ]);
        assert!(compute_for_module(&catalog, "Sample", &three).is_err());
    }

    #[test]
    fn test_no_kinds() {
        let catalog = ContractCatalog::load();
        let err = compute_for_module(&catalog, "Sample", &BTreeMap::new()).unwrap_err();
        assert!(matches!(err, Error::NoPluginFound { .. }));
    }

    #[test]
    fn test_single_kind_module_matches_compute() {
        let catalog = ContractCatalog::load();
        let set = members(PluginKind::Packer, &["PackFiles"]);
        let analyses = BTreeMap::from([(PluginKind::Packer, set.clone())]);
        assert_eq!(
            compute_for_module(&catalog, "Sample", &analyses).unwrap(),
            compute(&catalog, PluginKind::Packer, &set)
        );
    }
}
