//! External tool invocation: the disassembler and reassembler.

use crate::config::ToolsConfig;
use crate::error::{Error, Result};
use crate::plugin::Architecture;
use std::ffi::OsString;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

const POLL_INTERVAL: Duration = Duration::from_millis(25);

/// Captured result of a finished process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessOutput {
    /// `None` when the process was ended by a signal.
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl ProcessOutput {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    /// Text to report on failure: stderr, or stdout when stderr is empty.
    pub fn diagnostics(&self) -> &str {
        if self.stderr.trim().is_empty() {
            self.stdout.trim()
        } else {
            self.stderr.trim()
        }
    }
}

/// A child process owned by the current scope.
///
/// [`ScopedProcess::run`] waits for the child while draining both output
/// streams; the child is killed if cancellation fires or the scope unwinds
/// before it exits.
#[derive(Debug, Clone)]
pub struct ScopedProcess {
    program: PathBuf,
    args: Vec<OsString>,
    current_dir: Option<PathBuf>,
}

impl ScopedProcess {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            current_dir: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.current_dir = Some(dir.into());
        self
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    pub fn args(&self) -> &[OsString] {
        &self.args
    }

    pub fn run(&self, cancel: &CancellationToken) -> Result<ProcessOutput> {
        debug!("running {:?} {:?}", self.program, self.args);
        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(dir) = &self.current_dir {
            command.current_dir(dir);
        }

        let mut guard = ChildGuard(command.spawn()?);
        let stdout = drain(guard.0.stdout.take());
        let stderr = drain(guard.0.stderr.take());

        let status: ExitStatus = loop {
            if cancel.is_cancelled() {
                debug!("cancelling {:?}", self.program);
                return Err(Error::Cancelled);
            }
            match guard.0.try_wait()? {
                Some(status) => break status,
                None => thread::sleep(POLL_INTERVAL),
            }
        };

        Ok(ProcessOutput {
            code: status.code(),
            stdout: join(stdout),
            stderr: join(stderr),
        })
    }
}

struct ChildGuard(Child);

impl Drop for ChildGuard {
    fn drop(&mut self) {
        if let Ok(None) = self.0.try_wait() {
            let _ = self.0.kill();
            let _ = self.0.wait();
        }
    }
}

fn drain<R: Read + Send + 'static>(stream: Option<R>) -> Option<JoinHandle<String>> {
    stream.map(|mut stream| {
        thread::spawn(move || {
            let mut bytes = Vec::new();
            let _ = stream.read_to_end(&mut bytes);
            String::from_utf8_lossy(&bytes).into_owned()
        })
    })
}

fn join(handle: Option<JoinHandle<String>>) -> String {
    handle
        .and_then(|handle| handle.join().ok())
        .unwrap_or_default()
}

/// The external tools the pipeline drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tool {
    Ilasm,
    Ildasm,
}

impl Tool {
    pub fn name(&self) -> &'static str {
        match self {
            Tool::Ilasm => "ilasm",
            Tool::Ildasm => "ildasm",
        }
    }

    /// Configured path, else the first match on `PATH`.
    pub fn locate(&self, tools: &ToolsConfig) -> Result<PathBuf> {
        let configured = match self {
            Tool::Ilasm => tools.ilasm.as_ref(),
            Tool::Ildasm => tools.ildasm.as_ref(),
        };
        if let Some(path) = configured {
            if path.exists() {
                return Ok(path.clone());
            }
            return Err(Error::ToolNotFound(format!("{} at {:?}", self.name(), path)));
        }
        which::which(self.name()).map_err(|_| Error::ToolNotFound(self.name().to_string()))
    }
}

fn checked(tool: Tool, output: ProcessOutput) -> Result<ProcessOutput> {
    if output.success() {
        return Ok(output);
    }
    Err(Error::ExternalToolFailure {
        tool: tool.name().to_string(),
        code: output.code,
        stderr: output.diagnostics().to_string(),
    })
}

/// Turns a binary module into IL text.
#[derive(Debug, Clone)]
pub struct Disassembler {
    program: PathBuf,
}

impl Disassembler {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    pub fn from_config(tools: &ToolsConfig) -> Result<Self> {
        Ok(Self::new(Tool::Ildasm.locate(tools)?))
    }

    pub fn command(&self, module: &Path, output: &Path) -> ScopedProcess {
        let mut out = OsString::from("/OUT=");
        out.push(output);
        ScopedProcess::new(&self.program)
            .arg(module)
            .arg(out)
            .arg("/NOBAR")
    }

    /// Disassembles `module` into `output` and returns the text.
    pub fn disassemble(
        &self,
        module: &Path,
        output: &Path,
        cancel: &CancellationToken,
    ) -> Result<String> {
        if !module.exists() {
            return Err(Error::MissingInput(module.to_path_buf()));
        }
        info!("disassembling {:?}", module);
        let process = match output.parent() {
            Some(dir) => self.command(module, output).current_dir(dir),
            None => self.command(module, output),
        };
        checked(Tool::Ildasm, process.run(cancel)?)?;
        Ok(std::fs::read_to_string(output)?)
    }
}

/// Turns edited IL text back into a binary module.
#[derive(Debug, Clone)]
pub struct Reassembler {
    program: PathBuf,
}

impl Reassembler {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    pub fn from_config(tools: &ToolsConfig) -> Result<Self> {
        Ok(Self::new(Tool::Ilasm.locate(tools)?))
    }

    pub fn command(
        &self,
        source: &Path,
        output: &Path,
        resource: Option<&Path>,
        architecture: Architecture,
    ) -> ScopedProcess {
        let mut out = OsString::from("/OUTPUT=");
        out.push(output);
        let mut process = ScopedProcess::new(&self.program)
            .arg(source)
            .arg("/DLL")
            .arg("/QUIET")
            .arg(out);
        if let Some(resource) = resource {
            let mut res = OsString::from("/RESOURCE=");
            res.push(resource);
            process = process.arg(res);
        }
        if architecture == Architecture::X64 {
            process = process.arg("/X64").arg("/PE64");
        }
        process
    }

    pub fn reassemble(
        &self,
        source: &Path,
        output: &Path,
        resource: Option<&Path>,
        architecture: Architecture,
        cancel: &CancellationToken,
    ) -> Result<()> {
        info!("reassembling {:?} ({})", output, architecture);
        let mut process = self.command(source, output, resource, architecture);
        if let Some(dir) = source.parent() {
            process = process.current_dir(dir);
        }
        checked(Tool::Ilasm, process.run(cancel)?)?;
        if !output.exists() {
            return Err(Error::ExternalToolFailure {
                tool: Tool::Ilasm.name().to_string(),
                code: Some(0),
                stderr: format!("no output written to {:?}", output),
            });
        }
        Ok(())
    }
}

/// The tool operations a build needs.
pub trait Toolchain {
    fn disassemble(&self, module: &Path, output: &Path, cancel: &CancellationToken)
        -> Result<String>;

    fn reassemble(
        &self,
        source: &Path,
        output: &Path,
        resource: Option<&Path>,
        architecture: Architecture,
        cancel: &CancellationToken,
    ) -> Result<()>;
}

/// The configured or `PATH` tools, located on first use.
#[derive(Debug, Clone, Default)]
pub struct ExternalTools {
    tools: ToolsConfig,
}

impl ExternalTools {
    pub fn new(tools: ToolsConfig) -> Self {
        Self { tools }
    }
}

impl Toolchain for ExternalTools {
    fn disassemble(
        &self,
        module: &Path,
        output: &Path,
        cancel: &CancellationToken,
    ) -> Result<String> {
        Disassembler::from_config(&self.tools)?.disassemble(module, output, cancel)
    }

    fn reassemble(
        &self,
        source: &Path,
        output: &Path,
        resource: Option<&Path>,
        architecture: Architecture,
        cancel: &CancellationToken,
    ) -> Result<()> {
        Reassembler::from_config(&self.tools)?.reassemble(source, output, resource, architecture, cancel)
    }
}
