use std::cell::RefCell;
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};

use plugforge_core::error::{Error, Result};
use plugforge_core::pipeline;
use plugforge_core::process::Toolchain;
use plugforge_core::{
    Architecture, BuildRequest, Config, ContractCatalog, MetadataSource, PluginKind, RetainReason,
    Verdict, WrapperTarget,
};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

const SAMPLE_IL: &str = "\
.assembly extern TcPluginBase
{
  .ver 1:0:0:0
}
.assembly Sample
{
  .custom instance void [TcPluginBase]TcPluginBase.PluginDefinitionAttribute::.ctor(string,
                                                                                   class [mscorlib]System.Type) = ( 01 00 0A 46 69 6C 65 53 79 73 74 65 6D 12 53 61   // ...FileSystem.Sa
                                                                                                                    6D 70 6C 65 2E 46 73 2C 20 53 61 6D 70 6C 65 2C   // mple.Fs, Sample,
                                                                                                                    00 00 )
  .ver 1:2:0:0
}
.module Sample.dll
.class public auto ansi beforefieldinit Sample.Fs
       extends [TcPluginBase]TcPluginBase.FileSystem.FsPlugin
{
  .method public hidebysig virtual instance int32
          FindFirst(string path,
                    [out] valuetype [TcPluginBase]TcPluginBase.FileSystem.FindData& findData) cil managed
  {
    ret
  }
  .method public hidebysig virtual instance bool
          FindNext(native int handle,
                   [out] valuetype [TcPluginBase]TcPluginBase.FileSystem.FindData& findData) cil managed
  {
    ret
  }
  .method public hidebysig virtual instance bool MkDir(string dir) cil managed
  {
    ret
  }
}
";

const SDK_IL: &str = "\
.assembly TcPluginBase
{
  .ver 1:0:0:0
}
.module TcPluginBase.dll
.class interface public abstract auto ansi TcPluginBase.FileSystem.IFsPlugin
{
  .method public hidebysig newslot abstract virtual instance int32 FindFirst(string path, valuetype TcPluginBase.FileSystem.FindData& findData) cil managed
  {
  }
  .method public hidebysig newslot abstract virtual instance bool FindNext(native int handle, valuetype TcPluginBase.FileSystem.FindData& findData) cil managed
  {
  }
  .method public hidebysig newslot abstract virtual instance bool MkDir(string dir) cil managed
  {
  }
  .method public hidebysig newslot abstract virtual instance int32 RenMovFile(string oldName, string newName, bool move) cil managed
  {
  }
}
.class public abstract auto ansi beforefieldinit TcPluginBase.FileSystem.FsPlugin
       extends [mscorlib]System.Object
       implements TcPluginBase.FileSystem.IFsPlugin
{
  .method public hidebysig newslot abstract virtual instance int32 FindFirst(string path, valuetype TcPluginBase.FileSystem.FindData& findData) cil managed
  {
  }
  .method public hidebysig newslot abstract virtual instance bool FindNext(native int handle, valuetype TcPluginBase.FileSystem.FindData& findData) cil managed
  {
  }
  .method public hidebysig newslot virtual instance bool MkDir(string dir) cil managed
  {
    ldc.i4.0
    ret
  }
  .method public hidebysig newslot virtual instance int32 RenMovFile(string oldName, string newName, bool move) cil managed
  {
    ldc.i4.5
    ret
  }
}
";

const WRAPPER_IL: &str = "\
.assembly Wrapper
{
}
.module Wrapper.dll
.class public auto ansi sealed Wrapper.Exports
       extends [mscorlib]System.Object
{
  .method public static int32 FindFirst(native int path, native int data) cil managed
  {
    .vtentry 1 : 1
    .export [1] as FsFindFirst
    .export [2] as FsFindFirstW
    ret
  }
  .method public static int32 Init(int32 number) cil managed
  {
    .vtentry 2 : 1
    .export [3] as FsInit
    ret
  }
  .method public static bool MkDir(native int path) cil managed
  {
    .vtentry 3 : 1
    .export [4] as FsMkDir
    .export [5] as FsMkDirW
    ret
  }
  .method public static int32 RenMovFile(native int from,
                                         native int to) cil managed
  {
    .vtentry 4 : 1
    .export [6] as FsRenMovFile
    .export [7] as FsRenMovFileW
    ldstr      \"{ not a block\"
    ret
  }
} // end of class Wrapper.Exports
";

const COMBINED_IL: &str = "\
.assembly Combined
{
  .custom instance void [TcPluginBase]TcPluginBase.PluginDefinitionAttribute::.ctor(string, class [mscorlib]System.Type) = { string('FileSystem') type(class 'Combined.Fs') }
  .custom instance void [TcPluginBase]TcPluginBase.PluginDefinitionAttribute::.ctor(string, class [mscorlib]System.Type) = { string('Content') type(class 'Combined.Fields') }
  .ver 3:0:0:0
}
.module Combined.dll
.class public auto ansi beforefieldinit Combined.Fs
       extends [TcPluginBase]TcPluginBase.FileSystem.FsPlugin
{
  .method public hidebysig virtual instance bool
          MkDir(string dir) cil managed
  {
    ret
  }
}
.class public auto ansi beforefieldinit Combined.Fields
       extends [TcPluginBase]TcPluginBase.Content.ContentPlugin
{
  .method public hidebysig virtual instance void
          StopGetValue(string fileName) cil managed
  {
    ret
  }
}
";

const COMBINED_WRAPPER_IL: &str = "\
.class public auto ansi sealed Wrapper.Exports
       extends [mscorlib]System.Object
{
  .method public static int32 GetValue(native int file) cil managed
  {
    .export [1] as FsContentGetValue
    .export [2] as FsContentGetValueW
    ret
  }
  .method public static void StopGetValue(native int file) cil managed
  {
    .export [3] as FsContentStopGetValue
    ret
  }
  .method public static int32 SetValue(native int file) cil managed
  {
    .export [4] as FsContentSetValue
    ret
  }
  .method public static bool MkDir(native int path) cil managed
  {
    .export [5] as FsMkDir
    ret
  }
}
";

/// Treats "binary" modules as IL text and reassembly as a copy, so the
/// archive carries the trimmed text.
#[derive(Default)]
struct FakeTools {
    reassembled: RefCell<Vec<(PathBuf, Architecture)>>,
    cancel_on_reassemble: Option<CancellationToken>,
    /// Reassembly fails with this stderr.
    reassemble_error: Option<String>,
}

impl Toolchain for FakeTools {
    fn disassemble(&self, module: &Path, output: &Path, _cancel: &CancellationToken) -> Result<String> {
        let text = fs::read_to_string(module)?;
        fs::write(output, &text)?;
        Ok(text)
    }

    fn reassemble(
        &self,
        source: &Path,
        output: &Path,
        _resource: Option<&Path>,
        architecture: Architecture,
        _cancel: &CancellationToken,
    ) -> Result<()> {
        if let Some(token) = &self.cancel_on_reassemble {
            token.cancel();
        }
        if let Some(stderr) = &self.reassemble_error {
            return Err(Error::ExternalToolFailure {
                tool: "ilasm".into(),
                code: Some(1),
                stderr: stderr.clone(),
            });
        }
        fs::copy(source, output)?;
        self.reassembled
            .borrow_mut()
            .push((output.to_path_buf(), architecture));
        Ok(())
    }
}

struct Fixture {
    dir: TempDir,
}

impl Fixture {
    fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let fixture = Self { dir };
        fixture.write("Sample.dll", "managed");
        fixture.write("Sample.il", SAMPLE_IL);
        fixture.write("TcPluginBase.il", SDK_IL);
        fixture.write("wrapper.il", WRAPPER_IL);
        fixture.write("Helper.dll", "helper");
        fixture.write("TcPluginBase.dll", "sdk");
        fixture
    }

    fn path(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }

    fn write(&self, name: &str, text: &str) -> PathBuf {
        let path = self.path(name);
        fs::write(&path, text).unwrap();
        path
    }

    fn request(&self, wrappers: Vec<WrapperTarget>) -> BuildRequest {
        BuildRequest {
            managed_assembly: self.path("Sample.dll"),
            metadata: MetadataSource::Il {
                module: self.path("Sample.il"),
                references: vec![self.path("TcPluginBase.il")],
            },
            wrappers,
            references: vec![self.path("Helper.dll"), self.path("TcPluginBase.dll")],
            output_dir: self.path("out"),
            runtime_identifier: None,
            name: None,
            default_extension: None,
        }
    }

    fn wrapper(&self, architecture: Architecture, name: &str) -> WrapperTarget {
        WrapperTarget {
            architecture,
            template: self.path(name),
        }
    }
}

fn read_entry(archive: &Path, name: &str) -> String {
    let mut zip = zip::ZipArchive::new(fs::File::open(archive).unwrap()).unwrap();
    let mut entry = zip.by_name(name).unwrap();
    let mut text = String::new();
    entry.read_to_string(&mut text).unwrap();
    text
}

fn entry_names(archive: &Path) -> Vec<String> {
    let zip = zip::ZipArchive::new(fs::File::open(archive).unwrap()).unwrap();
    let mut names: Vec<String> = zip.file_names().map(str::to_string).collect();
    names.sort();
    names
}

#[test]
fn test_build_trims_and_packages_file_system_plugin() {
    let fixture = Fixture::new();
    fs::copy(fixture.path("wrapper.il"), fixture.path("wrapper64.dll")).unwrap();
    let request = fixture.request(vec![
        fixture.wrapper(Architecture::X86, "wrapper.il"),
        fixture.wrapper(Architecture::X64, "wrapper64.dll"),
    ]);
    let tools = FakeTools::default();
    let outcome = pipeline::build(
        &request,
        &Config::default(),
        &ContractCatalog::load(),
        &tools,
        &CancellationToken::new(),
    )
    .unwrap();

    let decision = &outcome.analysis.decision;
    assert_eq!(decision.kind, PluginKind::FileSystem);
    assert_eq!(
        decision.verdict("FsMkDirW"),
        Some(Verdict::Retain(RetainReason::ImplementedByUser))
    );
    assert_eq!(
        decision.verdict("FsInit"),
        Some(Verdict::Retain(RetainReason::BaseImplemented))
    );
    assert_eq!(decision.verdict("FsRenMovFile"), Some(Verdict::Strip));

    assert_eq!(outcome.archive, fixture.path("out").join("Sample.zip"));
    assert_eq!(outcome.generated_files, vec![outcome.archive.clone()]);
    assert_eq!(
        entry_names(&outcome.archive),
        vec!["Helper.dll", "Sample.dll", "Sample.wfx", "Sample.wfx64", "pluginst.inf"]
    );

    for entry in ["Sample.wfx", "Sample.wfx64"] {
        let text = read_entry(&outcome.archive, entry);
        assert!(text.contains(".export [4] as FsMkDir\n"));
        assert!(text.contains(".export [3] as FsInit\n"));
        assert!(!text.contains("FsRenMovFile"));
        assert!(text.contains("RenMovFile(native int from,"));
        assert!(text.contains("ldstr      \"{ not a block\""));
    }

    let removed: Vec<&str> = outcome.wrappers[0]
        .removal
        .removed
        .iter()
        .map(|r| r.name.as_str())
        .collect();
    assert_eq!(removed, vec!["FsRenMovFile", "FsRenMovFileW"]);

    let manifest = read_entry(&outcome.archive, "pluginst.inf");
    assert!(manifest.starts_with("[plugininstall]\r\ntype=wfx\r\nfile=Sample.wfx\r\n"));
    assert!(manifest.contains("defaultdir=Sample\r\n"));
    assert!(manifest.contains("version=1.2.0.0\r\n"));
    assert!(manifest.contains("description=Sample FileSystem plugin\r\n"));

    let entry = outcome.package.entry("Sample.dll").unwrap();
    assert_eq!(entry.size, 7);
    assert_eq!(entry.md5, format!("{:x}", md5::compute(b"managed")));
    assert_eq!(tools.reassembled.borrow().len(), 2);
}

#[test]
fn test_missing_secondary_binary_wrapper_is_skipped() {
    let fixture = Fixture::new();
    let mut request = fixture.request(vec![
        fixture.wrapper(Architecture::X86, "wrapper.il"),
        fixture.wrapper(Architecture::X64, "missing64.dll"),
    ]);
    request.runtime_identifier = Some("win-x86".into());
    request.name = Some("Remote".into());
    let tools = FakeTools::default();
    let outcome = pipeline::build(
        &request,
        &Config::default(),
        &ContractCatalog::load(),
        &tools,
        &CancellationToken::new(),
    )
    .unwrap();

    assert_eq!(outcome.archive, fixture.path("out").join("Remote-win-x86.zip"));
    assert_eq!(outcome.wrappers.len(), 1);
    assert_eq!(
        entry_names(&outcome.archive),
        vec!["Helper.dll", "Remote.wfx", "Sample.dll", "pluginst.inf"]
    );
}

#[test]
fn test_malformed_wrapper_fails_before_any_edit() {
    let fixture = Fixture::new();
    fixture.write(
        "broken.il",
        ".class public Broken\n{\n  .method public static void Run() cil managed\n  {\n    ret\n}\n",
    );
    let request = fixture.request(vec![
        fixture.wrapper(Architecture::X86, "wrapper.il"),
        fixture.wrapper(Architecture::X64, "broken.il"),
    ]);
    let tools = FakeTools::default();
    let result = pipeline::build(
        &request,
        &Config::default(),
        &ContractCatalog::load(),
        &tools,
        &CancellationToken::new(),
    );

    assert!(matches!(result, Err(Error::MalformedModuleText { .. })));
    assert!(tools.reassembled.borrow().is_empty());
    assert!(!fixture.path("out").exists());
    assert_eq!(fs::read_to_string(fixture.path("wrapper.il")).unwrap(), WRAPPER_IL);
}

#[test]
fn test_cancellation_leaves_output_untouched() {
    let fixture = Fixture::new();
    let request = fixture.request(vec![fixture.wrapper(Architecture::X86, "wrapper.il")]);

    let cancel = CancellationToken::new();
    cancel.cancel();
    let result = pipeline::build(
        &request,
        &Config::default(),
        &ContractCatalog::load(),
        &FakeTools::default(),
        &cancel,
    );
    assert!(matches!(result, Err(Error::Cancelled)));

    let cancel = CancellationToken::new();
    let tools = FakeTools {
        cancel_on_reassemble: Some(cancel.clone()),
        ..FakeTools::default()
    };
    let result = pipeline::build(
        &request,
        &Config::default(),
        &ContractCatalog::load(),
        &tools,
        &cancel,
    );
    assert!(matches!(result, Err(Error::Cancelled)));
    assert_eq!(tools.reassembled.borrow().len(), 1);
    assert!(!fixture.path("out").join("Sample.zip").exists());
}

#[test]
fn test_missing_managed_assembly() {
    let fixture = Fixture::new();
    let mut request = fixture.request(vec![fixture.wrapper(Architecture::X86, "wrapper.il")]);
    request.managed_assembly = fixture.path("Absent.dll");
    let result = pipeline::build(
        &request,
        &Config::default(),
        &ContractCatalog::load(),
        &FakeTools::default(),
        &CancellationToken::new(),
    );
    assert!(matches!(result, Err(Error::MissingInput(path)) if path == fixture.path("Absent.dll")));
}

#[test]
fn test_disassembled_metadata_without_sdk_matches_by_name() {
    let fixture = Fixture::new();
    // The fake disassembler reads the "binary" as text.
    fixture.write("Sample.dll", SAMPLE_IL);
    fs::remove_file(fixture.path("TcPluginBase.dll")).unwrap();
    let mut request = fixture.request(vec![fixture.wrapper(Architecture::X86, "wrapper.il")]);
    request.metadata = MetadataSource::Disassemble;
    request.references = vec![fixture.path("Helper.dll")];

    let outcome = pipeline::build(
        &request,
        &Config::default(),
        &ContractCatalog::load(),
        &FakeTools::default(),
        &CancellationToken::new(),
    )
    .unwrap();
    let retained = outcome.analysis.decision.retained();
    assert!(retained.contains("FsMkDir"));
    assert!(!retained.contains("FsRenMovFile"));
}

#[test]
fn test_tool_failure_surfaces_stderr_and_writes_nothing() {
    let fixture = Fixture::new();
    let request = fixture.request(vec![fixture.wrapper(Architecture::X86, "wrapper.il")]);
    let tools = FakeTools {
        reassemble_error: Some("***** FAILURE ***** undefined label".into()),
        ..FakeTools::default()
    };
    let err = pipeline::build(
        &request,
        &Config::default(),
        &ContractCatalog::load(),
        &tools,
        &CancellationToken::new(),
    )
    .unwrap_err();

    assert!(matches!(&err, Error::ExternalToolFailure { tool, .. } if tool == "ilasm"));
    assert!(err.to_string().contains("undefined label"));
    assert!(!fixture.path("out").exists());
}

#[test]
fn test_file_system_module_with_content_fields() {
    let fixture = Fixture::new();
    fixture.write("Combined.dll", "combined");
    fixture.write("Combined.il", COMBINED_IL);
    fixture.write("combined-wrapper.il", COMBINED_WRAPPER_IL);
    let mut request = fixture.request(vec![fixture.wrapper(Architecture::X64, "combined-wrapper.il")]);
    request.managed_assembly = fixture.path("Combined.dll");
    request.metadata = MetadataSource::Il {
        module: fixture.path("Combined.il"),
        references: vec![fixture.path("TcPluginBase.il")],
    };

    let outcome = pipeline::build(
        &request,
        &Config::default(),
        &ContractCatalog::load(),
        &FakeTools::default(),
        &CancellationToken::new(),
    )
    .unwrap();

    let kinds: Vec<PluginKind> = outcome.analysis.scan.kinds();
    assert_eq!(kinds, vec![PluginKind::FileSystem, PluginKind::Content]);
    let decision = &outcome.analysis.decision;
    assert_eq!(decision.kind, PluginKind::FileSystem);
    assert!(decision.merged);
    assert_eq!(
        decision.verdict("FsContentGetValueW"),
        Some(Verdict::Retain(RetainReason::Mandatory))
    );
    assert_eq!(
        decision.verdict("FsContentStopGetValue"),
        Some(Verdict::Retain(RetainReason::ImplementedByUser))
    );
    assert_eq!(decision.verdict("FsContentSetValue"), Some(Verdict::Strip));
    assert_eq!(
        decision.verdict("FsMkDir"),
        Some(Verdict::Retain(RetainReason::ImplementedByUser))
    );

    let text = read_entry(&outcome.archive, "Combined.wfx64");
    assert!(text.contains(".export [3] as FsContentStopGetValue"));
    assert!(text.contains(".export [5] as FsMkDir"));
    assert!(!text.contains("FsContentSetValue"));
    assert!(read_entry(&outcome.archive, "pluginst.inf").contains("file=Combined.wfx64\r\n"));
}
