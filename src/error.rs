//! Error taxonomy for the analyzer, trimmer and packager.

use crate::plugin::PluginKind;
use std::path::PathBuf;
use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Error, Debug)]
pub enum Error {
    /// No class carries a valid plugin-kind declaration
    #[error("no plugin declaration found in {module}{}", render_diagnostics(.diagnostics))]
    NoPluginFound {
        module: String,
        diagnostics: Vec<String>,
    },

    /// More than one valid declaration for the same plugin kind
    #[error("ambiguous {kind} plugin declaration in {module}: {}", .declarations.join(", "))]
    AmbiguousPluginDeclaration {
        module: String,
        kind: PluginKind,
        declarations: Vec<String>,
    },

    /// A combination of plugin kinds that cannot share one native module
    #[error("conflicting plugin kinds: {}", render_kinds(.kinds))]
    ConflictingPluginKinds { kinds: Vec<PluginKind> },

    /// Warning-grade: a declaration whose arguments could not be used
    #[error("invalid plugin declaration `{declaration}`: {reason}")]
    InvalidDeclarationArguments { declaration: String, reason: String },

    /// Unbalanced braces or parentheses in module text
    #[error("malformed module text at line {line}: {reason}")]
    MalformedModuleText { line: usize, reason: String },

    /// External tool exited unsuccessfully
    #[error("{tool} failed ({}): {stderr}", render_code(.code))]
    ExternalToolFailure {
        tool: String,
        code: Option<i32>,
        stderr: String,
    },

    /// The output path stayed locked for the whole retry budget
    #[error("could not write {path:?} after {attempts} attempts")]
    OutputWriteContention { path: PathBuf, attempts: u32 },

    #[error("required input not found: {0:?}")]
    MissingInput(PathBuf),

    #[error("tool not found: {0}")]
    ToolNotFound(String),

    #[error("build cancelled")]
    Cancelled,

    #[error("metadata error: {0}")]
    Metadata(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("archive error: {0}")]
    Archive(#[from] zip::result::ZipError),
}

impl Error {
    pub fn metadata(message: impl Into<String>) -> Self {
        Self::Metadata(message.into())
    }

    pub fn malformed(line: usize, reason: impl Into<String>) -> Self {
        Self::MalformedModuleText {
            line,
            reason: reason.into(),
        }
    }

    /// Only declaration-argument problems are soft; everything else aborts.
    pub fn is_warning(&self) -> bool {
        matches!(self, Self::InvalidDeclarationArguments { .. })
    }
}

fn render_diagnostics(diagnostics: &[String]) -> String {
    if diagnostics.is_empty() {
        String::new()
    } else {
        format!(" ({})", diagnostics.join("; "))
    }
}

fn render_kinds(kinds: &[PluginKind]) -> String {
    kinds
        .iter()
        .map(|kind| kind.to_string())
        .collect::<Vec<_>>()
        .join(" + ")
}

fn render_code(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("exit code {code}"),
        None => "terminated".to_string(),
    }
}
