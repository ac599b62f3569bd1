//! Distribution archive: wrappers, managed module, references and the
//! host's install manifest.

use crate::config::OutputConfig;
use crate::error::{Error, Result};
use crate::metadata::Module;
use crate::plugin::{Architecture, PluginKind};
use chrono::{Datelike, Local, Timelike};
use serde::Serialize;
use std::collections::BTreeSet;
use std::fs;
use std::io::{self, ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;
use tracing::{debug, info, warn};
use zip::write::FileOptions;
use zip::CompressionMethod;

/// File name the host reads install instructions from.
pub const MANIFEST_NAME: &str = "pluginst.inf";
const DEFAULT_VERSION: &str = "1.0";

/// Native wrapper built for one architecture.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WrapperBinary {
    pub architecture: Architecture,
    pub path: PathBuf,
}

/// Key/value fields of `pluginst.inf`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ManifestFields {
    pub kind: PluginKind,
    pub name: String,
    pub description: String,
    pub version: String,
    /// Packer only.
    pub default_extension: Option<String>,
}

impl ManifestFields {
    /// Fields for `name`, taking description and version from the module's
    /// version metadata when present.
    pub fn from_module(
        kind: PluginKind,
        name: &str,
        module: &Module,
        default_extension: Option<String>,
    ) -> Self {
        let description = module
            .description()
            .map(str::to_string)
            .unwrap_or_else(|| format!("{} {} plugin", name, kind));
        let version = module
            .file_version()
            .map(str::to_string)
            .unwrap_or_else(|| DEFAULT_VERSION.to_string());
        Self {
            kind,
            name: name.to_string(),
            description,
            version,
            default_extension,
        }
    }

    /// Renders the manifest naming `file` as the module to install.
    pub fn render(&self, file: &str) -> String {
        let mut text = String::from("[plugininstall]\r\n");
        let base_type = self.kind.extension(Architecture::X86);
        let mut line = |key: &str, value: &str| {
            text.push_str(key);
            text.push('=');
            text.push_str(value);
            text.push_str("\r\n");
        };
        line("type", &base_type);
        line("file", file);
        line("description", &self.description);
        line("defaultdir", &self.name);
        line("version", &self.version);
        if self.kind == PluginKind::Packer {
            let extension = self
                .default_extension
                .clone()
                .unwrap_or_else(|| self.name.to_lowercase());
            line("defaultextension", &extension);
        }
        text
    }
}

/// Everything that goes into one archive.
#[derive(Debug, Clone)]
pub struct PackageInputs {
    /// The first wrapper is the primary one and must exist.
    pub wrappers: Vec<WrapperBinary>,
    pub managed_assembly: PathBuf,
    pub references: Vec<PathBuf>,
    pub manifest: ManifestFields,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PackageEntry {
    pub name: String,
    pub size: u64,
    pub md5: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct PackageReport {
    pub archive: PathBuf,
    pub entries: Vec<PackageEntry>,
    pub warnings: Vec<String>,
    pub created: String,
}

impl PackageReport {
    pub fn entry(&self, name: &str) -> Option<&PackageEntry> {
        self.entries.iter().find(|e| e.name == name)
    }
}

/// Whether a reference file ships with the plugin.
///
/// The SDK base assembly is loaded by the host-side shim and documentation
/// files are never needed at runtime.
pub fn should_bundle(path: &Path, sdk_assembly: &str) -> bool {
    let extension = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase);
    if extension.as_deref() == Some("xml") {
        return false;
    }
    let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or("");
    !stem.eq_ignore_ascii_case(sdk_assembly)
}

pub struct PackageBuilder {
    sdk_assembly: String,
}

impl PackageBuilder {
    pub fn new(sdk_assembly: impl Into<String>) -> Self {
        Self {
            sdk_assembly: sdk_assembly.into(),
        }
    }

    /// Writes the archive at `archive`.
    pub fn build(&self, inputs: &PackageInputs, archive: &Path) -> Result<PackageReport> {
        let primary = inputs
            .wrappers
            .first()
            .ok_or_else(|| Error::MissingInput(PathBuf::from("<primary wrapper>")))?;
        if !primary.path.exists() {
            return Err(Error::MissingInput(primary.path.clone()));
        }
        if !inputs.managed_assembly.exists() {
            return Err(Error::MissingInput(inputs.managed_assembly.clone()));
        }

        let mut writer = ArchiveWriter::create(archive)?;
        let name = &inputs.manifest.name;
        let kind = inputs.manifest.kind;

        for (index, wrapper) in inputs.wrappers.iter().enumerate() {
            if index > 0 && !wrapper.path.exists() {
                writer.warn(format!(
                    "{} wrapper {:?} not found, skipped",
                    wrapper.architecture, wrapper.path
                ));
                continue;
            }
            let entry = format!("{}.{}", name, kind.extension(wrapper.architecture));
            writer.add_file(&entry, &wrapper.path)?;
        }

        writer.add_file(&file_name(&inputs.managed_assembly)?, &inputs.managed_assembly)?;
        let pdb = inputs.managed_assembly.with_extension("pdb");
        if pdb.exists() {
            writer.add_file(&file_name(&pdb)?, &pdb)?;
        } else {
            writer.warn(format!("debug symbols {:?} not found", pdb));
        }

        for reference in &inputs.references {
            if !should_bundle(reference, &self.sdk_assembly) {
                debug!("not bundling {:?}", reference);
                continue;
            }
            if !reference.exists() {
                writer.warn(format!("reference {:?} not found, skipped", reference));
                continue;
            }
            writer.add_file(&file_name(reference)?, reference)?;
        }

        if kind == PluginKind::Packer && inputs.manifest.default_extension.is_none() {
            writer.warn(format!(
                "no default extension given, using `{}`",
                name.to_lowercase()
            ));
        }
        let manifest_file = format!("{}.{}", name, kind.extension(primary.architecture));
        let manifest = inputs.manifest.render(&manifest_file);
        writer.add_bytes(MANIFEST_NAME, manifest.as_bytes())?;

        let report = writer.finish()?;
        info!("packaged {} entries into {:?}", report.entries.len(), report.archive);
        Ok(report)
    }
}

fn file_name(path: &Path) -> Result<String> {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(str::to_string)
        .ok_or_else(|| Error::MissingInput(path.to_path_buf()))
}

struct ArchiveWriter {
    path: PathBuf,
    zip: zip::ZipWriter<fs::File>,
    options: FileOptions,
    names: BTreeSet<String>,
    entries: Vec<PackageEntry>,
    warnings: Vec<String>,
}

impl ArchiveWriter {
    fn create(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = fs::File::create(path)?;
        let now = Local::now();
        let mut options = FileOptions::default().compression_method(CompressionMethod::Deflated);
        if let Ok(stamp) = zip::DateTime::from_date_and_time(
            u16::try_from(now.year()).unwrap_or(1980),
            now.month() as u8,
            now.day() as u8,
            now.hour() as u8,
            now.minute() as u8,
            now.second() as u8,
        ) {
            options = options.last_modified_time(stamp);
        }
        Ok(Self {
            path: path.to_path_buf(),
            zip: zip::ZipWriter::new(file),
            options,
            names: BTreeSet::new(),
            entries: Vec::new(),
            warnings: Vec::new(),
        })
    }

    fn warn(&mut self, message: String) {
        warn!("{}", message);
        self.warnings.push(message);
    }

    fn add_file(&mut self, name: &str, source: &Path) -> Result<()> {
        let data = fs::read(source)?;
        self.add_bytes(name, &data)
    }

    fn add_bytes(&mut self, name: &str, data: &[u8]) -> Result<()> {
        if !self.names.insert(name.to_ascii_lowercase()) {
            self.warn(format!("duplicate archive entry {} skipped", name));
            return Ok(());
        }
        self.zip.start_file(name, self.options)?;
        self.zip.write_all(data)?;
        self.entries.push(PackageEntry {
            name: name.to_string(),
            size: data.len() as u64,
            md5: format!("{:x}", md5::compute(data)),
        });
        Ok(())
    }

    fn finish(mut self) -> Result<PackageReport> {
        self.zip.finish()?;
        Ok(PackageReport {
            archive: self.path,
            entries: self.entries,
            warnings: self.warnings,
            created: Local::now().to_rfc3339(),
        })
    }
}

/// Sharing and lock violations another process can cause by holding the
/// destination open.
fn is_contention(err: &io::Error) -> bool {
    matches!(err.kind(), ErrorKind::PermissionDenied | ErrorKind::WouldBlock)
        || matches!(err.raw_os_error(), Some(32) | Some(33))
}

/// Longest wait between two publish attempts.
pub const MAX_RETRY_BACKOFF: Duration = Duration::from_secs(5);

fn next_delay(delay: Duration) -> Duration {
    (delay * 2).min(MAX_RETRY_BACKOFF)
}

/// Publishes `source` as `dest`.
///
/// The bytes are first written to a temporary sibling of `dest`, which is
/// then renamed over it, retrying with doubling backoff while `dest` is
/// locked. `dest` is either untouched or complete.
pub fn publish(source: &Path, dest: &Path, output: &OutputConfig) -> Result<()> {
    let parent = match dest.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    fs::create_dir_all(parent)?;

    let mut staged = tempfile::Builder::new()
        .prefix(".plugforge-")
        .suffix(".partial")
        .tempfile_in(parent)?;
    let mut input = fs::File::open(source)?;
    io::copy(&mut input, staged.as_file_mut())?;
    staged.as_file().sync_all()?;
    let staged = staged.into_temp_path();

    publish_with(&staged, dest, output, |from, to| fs::rename(from, to))
}

fn publish_with(
    staged: &Path,
    dest: &Path,
    output: &OutputConfig,
    mut place: impl FnMut(&Path, &Path) -> io::Result<()>,
) -> Result<()> {
    let attempts = output.retry_attempts.max(1);
    let mut delay = output.retry_backoff().min(MAX_RETRY_BACKOFF);
    for attempt in 1..=attempts {
        match place(staged, dest) {
            Ok(()) => {
                debug!("published {:?} on attempt {}", dest, attempt);
                return Ok(());
            }
            Err(err) if is_contention(&err) => {
                warn!("{:?} is locked ({}), attempt {}/{}", dest, err, attempt, attempts);
                if attempt < attempts {
                    thread::sleep(delay);
                    delay = next_delay(delay);
                }
            }
            Err(err) => return Err(err.into()),
        }
    }
    Err(Error::OutputWriteContention {
        path: dest.to_path_buf(),
        attempts,
    })
}
