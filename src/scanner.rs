//! Discovery of plugin-kind declarations in a user module.

use crate::error::{Error, Result};
use crate::metadata::{AttributeArg, CustomAttribute, Module, TypeDef, TypeUniverse};
use crate::plugin::{PluginDeclaration, PluginKind, ScanResult};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, warn};

/// Simple name of the declaration attribute.
pub const DECLARATION_ATTRIBUTE: &str = "PluginDefinitionAttribute";

/// Finds every valid plugin-kind declaration in `module`.
///
/// Declarations may sit on the module/assembly (kind and class arguments)
/// or on a type (kind argument, optional class argument defaulting to the
/// type itself). Unusable declarations are logged and collected as
/// diagnostics; if nothing valid remains the scan fails with
/// [`Error::NoPluginFound`].
pub fn scan(module: &Module, universe: &TypeUniverse<'_>) -> Result<ScanResult> {
    let mut valid = BTreeSet::new();
    let mut warnings = Vec::new();

    let module_level = module
        .attributes
        .iter()
        .filter(|a| a.simple_name() == DECLARATION_ATTRIBUTE)
        .map(|a| (a, None));
    let type_level = module.types.iter().flat_map(|ty| {
        ty.attributes
            .iter()
            .filter(|a| a.simple_name() == DECLARATION_ATTRIBUTE)
            .map(move |a| (a, Some(ty)))
    });

    for (attribute, owner) in module_level.chain(type_level) {
        match validate(attribute, owner, module, universe) {
            Ok(declaration) => {
                debug!("found {} plugin declaration for {}", declaration.kind, declaration.class_name);
                valid.insert(declaration);
            }
            Err(err) if err.is_warning() => {
                warn!("ignoring plugin declaration: {}", err);
                warnings.push(err.to_string());
            }
            Err(err) => return Err(err),
        }
    }

    let module_name = module.assembly.name.clone();
    if valid.is_empty() {
        return Err(Error::NoPluginFound {
            module: module_name,
            diagnostics: warnings,
        });
    }

    let mut by_kind: BTreeMap<PluginKind, Vec<String>> = BTreeMap::new();
    for declaration in &valid {
        by_kind
            .entry(declaration.kind)
            .or_default()
            .push(declaration.class_name.clone());
    }
    if let Some((kind, classes)) = by_kind.into_iter().find(|(_, classes)| classes.len() > 1) {
        return Err(Error::AmbiguousPluginDeclaration {
            module: module_name,
            kind,
            declarations: classes,
        });
    }

    Ok(ScanResult {
        declarations: valid.into_iter().collect(),
        assembly: module.assembly.clone(),
        warnings,
    })
}

fn validate(
    attribute: &CustomAttribute,
    owner: Option<&TypeDef>,
    module: &Module,
    universe: &TypeUniverse<'_>,
) -> Result<PluginDeclaration> {
    let invalid = |reason: String| Error::InvalidDeclarationArguments {
        declaration: render(attribute, owner),
        reason,
    };

    let (kind_arg, class_arg) = match (attribute.args.as_slice(), owner) {
        ([kind, class], _) => (kind, Some(class)),
        ([kind], Some(_)) => (kind, None),
        (args, _) => {
            return Err(invalid(format!("expected 2 arguments, found {}", args.len())));
        }
    };

    let kind_text = kind_arg
        .as_str()
        .ok_or_else(|| invalid("first argument is not a kind name".into()))?;
    let kind: PluginKind = kind_text.parse().map_err(invalid)?;

    let class_name = match (class_arg, owner) {
        (Some(AttributeArg::Type(name)), _) => name.clone(),
        (Some(AttributeArg::String(Some(name))), _) => name.trim().to_string(),
        (None, Some(ty)) => ty.full_name.clone(),
        _ => return Err(invalid("second argument is not a type reference".into())),
    };
    if class_name.is_empty() {
        return Err(invalid("empty class name".into()));
    }

    let class = module
        .find_type(&class_name)
        .ok_or_else(|| invalid(format!("class `{class_name}` is not defined in the module")))?;
    if class.is_interface() || class.is_abstract {
        return Err(invalid(format!("`{class_name}` is not a concrete class")));
    }
    if !universe.derives_from(class, kind.base_class_name()) {
        return Err(invalid(format!(
            "`{class_name}` does not derive from {}",
            kind.base_class_name()
        )));
    }

    Ok(PluginDeclaration { kind, class_name })
}

fn render(attribute: &CustomAttribute, owner: Option<&TypeDef>) -> String {
    let args: Vec<String> = attribute
        .args
        .iter()
        .map(|arg| match arg {
            AttributeArg::String(Some(text)) => format!("{text:?}"),
            AttributeArg::String(None) => "null".to_string(),
            AttributeArg::Type(name) => format!("typeof({name})"),
            AttributeArg::Int(value) => value.to_string(),
            AttributeArg::Bool(value) => value.to_string(),
            AttributeArg::Other(text) => text.clone(),
        })
        .collect();
    let text = format!("{}({})", attribute.simple_name(), args.join(", "));
    match owner {
        Some(ty) => format!("{text} on {}", ty.full_name),
        None => text,
    }
}
