//! Build orchestration: analyze the managed module, trim the native wrapper
//! exports, reassemble and package.
//!
//! Every intermediate file lives in a temporary working directory; only the
//! final publish step writes to the output directory.

use crate::catalog::ContractCatalog;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::exports::{compute_for_module, ExportDecision};
use crate::ir::{self, RemovalReport};
use crate::metadata::{il, json, Module, TypeUniverse};
use crate::package::{self, ManifestFields, PackageBuilder, PackageInputs, PackageReport, WrapperBinary};
use crate::plugin::{Architecture, PluginKind, ScanResult};
use crate::process::Toolchain;
use crate::resolver::{implemented_members, ImplementedMember};
use crate::scanner;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Where the analyzer gets the managed module's metadata from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MetadataSource {
    /// JSON dump of the module and its references.
    Json(PathBuf),
    /// Disassembled text of the module and of its references.
    Il {
        module: PathBuf,
        references: Vec<PathBuf>,
    },
    /// Disassemble the managed assembly and the SDK assembly with the
    /// configured tool.
    Disassemble,
}

/// A native wrapper to trim for one architecture. The template is either a
/// binary, disassembled first, or already IL text (`.il`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WrapperTarget {
    pub architecture: Architecture,
    pub template: PathBuf,
}

#[derive(Debug, Clone)]
pub struct BuildRequest {
    pub managed_assembly: PathBuf,
    pub metadata: MetadataSource,
    /// The first target is the primary wrapper.
    pub wrappers: Vec<WrapperTarget>,
    pub references: Vec<PathBuf>,
    pub output_dir: PathBuf,
    pub runtime_identifier: Option<String>,
    /// Plugin name; defaults to the assembly name.
    pub name: Option<String>,
    /// Packer only.
    pub default_extension: Option<String>,
}

/// Result of the analysis phases.
#[derive(Debug, Clone, Serialize)]
pub struct Analysis {
    pub scan: ScanResult,
    pub implemented: BTreeMap<PluginKind, BTreeSet<ImplementedMember>>,
    pub decision: ExportDecision,
}

#[derive(Debug, Clone, Serialize)]
pub struct WrapperOutcome {
    pub architecture: Architecture,
    pub removal: RemovalReport,
}

#[derive(Debug, Clone, Serialize)]
pub struct BuildOutcome {
    pub archive: PathBuf,
    /// Every file written outside the working directory.
    pub generated_files: Vec<PathBuf>,
    pub analysis: Analysis,
    pub wrappers: Vec<WrapperOutcome>,
    pub package: PackageReport,
}

fn checkpoint(cancel: &CancellationToken, phase: &str) -> Result<()> {
    if cancel.is_cancelled() {
        info!("build cancelled {}", phase);
        return Err(Error::Cancelled);
    }
    Ok(())
}

/// Runs scan, implemented-set and export phases over loaded metadata.
pub fn analyze(
    module: &Module,
    references: &[Module],
    catalog: &ContractCatalog,
) -> Result<Analysis> {
    let universe = TypeUniverse::new(module, references);
    let scan = scanner::scan(module, &universe)?;

    let implemented: BTreeMap<PluginKind, BTreeSet<ImplementedMember>> = scan
        .declarations
        .iter()
        .map(|declaration| {
            (
                declaration.kind,
                implemented_members(&universe, catalog, declaration),
            )
        })
        .collect();

    let decision = compute_for_module(catalog, &module.assembly.name, &implemented)?;
    info!(
        "{}: {} plugin, {} exports retained, {} stripped",
        module.assembly.name,
        decision.kind,
        decision.retained().len(),
        decision.stripped().len()
    );
    Ok(Analysis {
        scan,
        implemented,
        decision,
    })
}

/// Removes the decision's stripped exports from wrapper IL text.
pub fn trim(text: &str, decision: &ExportDecision) -> Result<(String, RemovalReport)> {
    let mut tree = ir::parse(text)?;
    let report = ir::remove_exports(&mut tree, &decision.excluded());
    Ok((tree.to_text(), report))
}

/// Loads the managed module and its references from the request's source.
pub fn load_metadata(
    request: &BuildRequest,
    config: &Config,
    tools: &dyn Toolchain,
    workdir: &Path,
    cancel: &CancellationToken,
) -> Result<(Module, Vec<Module>)> {
    match &request.metadata {
        MetadataSource::Json(path) => {
            let dump = json::load(path)?;
            Ok((dump.module, dump.references))
        }
        MetadataSource::Il { module, references } => {
            let module = read_il(module)?;
            let references = references
                .iter()
                .map(|path| read_il(path))
                .collect::<Result<Vec<_>>>()?;
            Ok((module, references))
        }
        MetadataSource::Disassemble => {
            let text = tools.disassemble(
                &request.managed_assembly,
                &workdir.join("managed.il"),
                cancel,
            )?;
            let module = il::from_text(&text)?;
            let mut references = Vec::new();
            match sdk_reference(request, &config.sdk.assembly) {
                Some(sdk) => {
                    let text = tools.disassemble(&sdk, &workdir.join("sdk.il"), cancel)?;
                    references.push(il::from_text(&text)?);
                }
                None => warn!(
                    "{} not found among references; interface members are matched by name only",
                    config.sdk.assembly
                ),
            }
            Ok((module, references))
        }
    }
}

fn read_il(path: &Path) -> Result<Module> {
    if !path.exists() {
        return Err(Error::MissingInput(path.to_path_buf()));
    }
    il::from_text(&fs::read_to_string(path)?)
}

/// The SDK assembly: a listed reference with the SDK's stem, else a
/// sibling of the managed assembly.
fn sdk_reference(request: &BuildRequest, sdk_assembly: &str) -> Option<PathBuf> {
    let matches_stem = |path: &Path| {
        path.file_stem()
            .and_then(|s| s.to_str())
            .is_some_and(|stem| stem.eq_ignore_ascii_case(sdk_assembly))
    };
    request
        .references
        .iter()
        .find(|path| matches_stem(path))
        .cloned()
        .or_else(|| {
            let sibling = request
                .managed_assembly
                .with_file_name(format!("{sdk_assembly}.dll"));
            sibling.exists().then_some(sibling)
        })
}

/// `<Name>[-<rid>].zip`
pub fn archive_name(name: &str, runtime_identifier: Option<&str>) -> String {
    match runtime_identifier.filter(|rid| !rid.is_empty()) {
        Some(rid) => format!("{name}-{rid}.zip"),
        None => format!("{name}.zip"),
    }
}

/// Runs the whole build.
pub fn build(
    request: &BuildRequest,
    config: &Config,
    catalog: &ContractCatalog,
    tools: &dyn Toolchain,
    cancel: &CancellationToken,
) -> Result<BuildOutcome> {
    if !request.managed_assembly.exists() {
        return Err(Error::MissingInput(request.managed_assembly.clone()));
    }
    if request.wrappers.is_empty() {
        return Err(Error::MissingInput(PathBuf::from("<primary wrapper>")));
    }
    let workdir = tempfile::Builder::new().prefix("plugforge-").tempdir()?;
    debug!("working directory {:?}", workdir.path());

    let (module, references) = load_metadata(request, config, tools, workdir.path(), cancel)?;
    checkpoint(cancel, "after loading metadata")?;
    let name = request
        .name
        .clone()
        .filter(|n| !n.trim().is_empty())
        .unwrap_or_else(|| module.assembly.name.clone());

    let analysis = analyze(&module, &references, catalog)?;
    checkpoint(cancel, "after export computation")?;

    // Parse every wrapper before editing any of them.
    let mut trees = Vec::with_capacity(request.wrappers.len());
    for (index, target) in request.wrappers.iter().enumerate() {
        let stem = format!("wrapper-{}", target.architecture);
        let text = if is_il_text(&target.template) {
            if !target.template.exists() {
                return Err(Error::MissingInput(target.template.clone()));
            }
            fs::read_to_string(&target.template)?
        } else if index > 0 && !target.template.exists() {
            warn!("{} wrapper template {:?} not found, skipped", target.architecture, target.template);
            continue;
        } else {
            tools.disassemble(&target.template, &workdir.path().join(format!("{stem}.il")), cancel)?
        };
        trees.push((target, stem, ir::parse(&text)?));
    }
    checkpoint(cancel, "after parsing wrappers")?;

    let excluded = analysis.decision.excluded();
    let mut outcomes = Vec::new();
    let mut edited = Vec::new();
    for (target, stem, mut tree) in trees {
        let removal = ir::remove_exports(&mut tree, &excluded);
        info!(
            "{} wrapper: removed {} export markers",
            target.architecture,
            removal.removed.len()
        );
        let source = workdir.path().join(format!("{stem}.trimmed.il"));
        fs::write(&source, tree.to_text())?;
        edited.push((target, stem, source));
        outcomes.push(WrapperOutcome {
            architecture: target.architecture,
            removal,
        });
    }
    checkpoint(cancel, "before reassembly")?;
    let mut binaries = Vec::new();
    for (target, stem, source) in &edited {
        let output = workdir
            .path()
            .join(format!("{}.{}", name, analysis.decision.kind.extension(target.architecture)));
        let resource = workdir.path().join(format!("{stem}.res"));
        let resource = resource.exists().then_some(resource);
        tools.reassemble(source, &output, resource.as_deref(), target.architecture, cancel)?;
        binaries.push(WrapperBinary {
            architecture: target.architecture,
            path: output,
        });
    }

    checkpoint(cancel, "before packaging")?;
    let manifest = ManifestFields::from_module(
        analysis.decision.kind,
        &name,
        &module,
        request.default_extension.clone(),
    );
    let inputs = PackageInputs {
        wrappers: binaries,
        managed_assembly: request.managed_assembly.clone(),
        references: request.references.clone(),
        manifest,
    };
    let file_name = archive_name(&name, request.runtime_identifier.as_deref());
    let staged = workdir.path().join(&file_name);
    let mut report = PackageBuilder::new(config.sdk.assembly.clone()).build(&inputs, &staged)?;

    checkpoint(cancel, "before publishing")?;
    let archive = request.output_dir.join(&file_name);
    package::publish(&staged, &archive, &config.output)?;
    report.archive = archive.clone();
    info!("wrote {:?}", archive);

    Ok(BuildOutcome {
        generated_files: vec![archive.clone()],
        archive,
        analysis,
        wrappers: outcomes,
        package: report,
    })
}

fn is_il_text(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case("il"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_archive_name() {
        assert_eq!(archive_name("Sample", None), "Sample.zip");
        assert_eq!(archive_name("Sample", Some("win-x64")), "Sample-win-x64.zip");
        assert_eq!(archive_name("Sample", Some("")), "Sample.zip");
    }

    #[test]
    fn test_sdk_reference_lookup() {
        let dir = tempfile::tempdir().unwrap();
        let managed = dir.path().join("Sample.dll");
        let request = BuildRequest {
            managed_assembly: managed.clone(),
            metadata: MetadataSource::Disassemble,
            wrappers: vec![],
            references: vec![PathBuf::from("lib/tcpluginbase.dll"), PathBuf::from("lib/Other.dll")],
            output_dir: dir.path().to_path_buf(),
            runtime_identifier: None,
            name: None,
            default_extension: None,
        };
        assert_eq!(
            sdk_reference(&request, "TcPluginBase"),
            Some(PathBuf::from("lib/tcpluginbase.dll"))
        );

        let sibling = dir.path().join("TcPluginBase.dll");
        let without = BuildRequest {
            references: vec![],
            ..request
        };
        assert_eq!(sdk_reference(&without, "TcPluginBase"), None);
        fs::write(&sibling, b"sdk").unwrap();
        assert_eq!(sdk_reference(&without, "TcPluginBase"), Some(sibling));
    }

    #[test]
    fn test_il_template_detection() {
        assert!(is_il_text(Path::new("wrapper.IL")));
        assert!(!is_il_text(Path::new("wrapper.dll")));
    }
}
