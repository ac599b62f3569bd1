use crate::metadata::AssemblyIdentity;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// The five native ABI contracts a module can implement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum PluginKind {
    FileSystem,
    Content,
    Lister,
    Packer,
    QuickSearch,
}

impl PluginKind {
    pub const ALL: [PluginKind; 5] = [
        PluginKind::FileSystem,
        PluginKind::Content,
        PluginKind::Lister,
        PluginKind::Packer,
        PluginKind::QuickSearch,
    ];

    /// Text used by the declaration attribute.
    pub fn declaration_name(&self) -> &'static str {
        match self {
            PluginKind::FileSystem => "FileSystem",
            PluginKind::Content => "Content",
            PluginKind::Lister => "Lister",
            PluginKind::Packer => "Packer",
            PluginKind::QuickSearch => "QuickSearch",
        }
    }

    /// Simple name of the SDK interface that carries the kind's members.
    pub fn interface_name(&self) -> &'static str {
        match self {
            PluginKind::FileSystem => "IFsPlugin",
            PluginKind::Content => "IContentPlugin",
            PluginKind::Lister => "IListerPlugin",
            PluginKind::Packer => "IPackerPlugin",
            PluginKind::QuickSearch => "IQuickSearchPlugin",
        }
    }

    /// Simple name of the SDK's abstract base class for the kind.
    pub fn base_class_name(&self) -> &'static str {
        match self {
            PluginKind::FileSystem => "FsPlugin",
            PluginKind::Content => "ContentPlugin",
            PluginKind::Lister => "ListerPlugin",
            PluginKind::Packer => "PackerPlugin",
            PluginKind::QuickSearch => "QuickSearchPlugin",
        }
    }

    /// Host file extension of the native module.
    pub fn extension(&self, architecture: Architecture) -> String {
        let base = match self {
            PluginKind::FileSystem => "wfx",
            PluginKind::Content => "wdx",
            PluginKind::Lister => "wlx",
            PluginKind::Packer => "wcx",
            PluginKind::QuickSearch => "dsx",
        };
        match architecture {
            Architecture::X86 => base.to_string(),
            Architecture::X64 => format!("{base}64"),
        }
    }
}

impl fmt::Display for PluginKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.declaration_name())
    }
}

impl FromStr for PluginKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        PluginKind::ALL
            .into_iter()
            .find(|kind| kind.declaration_name().eq_ignore_ascii_case(trimmed))
            .ok_or_else(|| format!("unknown plugin kind `{trimmed}`"))
    }
}

/// Target architecture of a native wrapper.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Architecture {
    X86,
    X64,
}

impl fmt::Display for Architecture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Architecture::X86 => f.write_str("x86"),
            Architecture::X64 => f.write_str("x64"),
        }
    }
}

impl FromStr for Architecture {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "x86" | "32" | "win32" | "win-x86" => Ok(Architecture::X86),
            "x64" | "64" | "amd64" | "win-x64" => Ok(Architecture::X64),
            other => Err(format!("unknown architecture `{other}`")),
        }
    }
}

/// One valid plugin-kind declaration.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PluginDeclaration {
    pub kind: PluginKind,
    pub class_name: String,
}

impl fmt::Display for PluginDeclaration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.kind, self.class_name)
    }
}

/// Outcome of scanning a module for plugin declarations.
#[derive(Debug, Clone, Serialize)]
pub struct ScanResult {
    /// Sorted by kind, never empty.
    pub declarations: Vec<PluginDeclaration>,
    pub assembly: AssemblyIdentity,
    /// Declarations that were ignored, with the reason.
    pub warnings: Vec<String>,
}

impl ScanResult {
    pub fn kinds(&self) -> Vec<PluginKind> {
        self.declarations.iter().map(|d| d.kind).collect()
    }

    pub fn declaration(&self, kind: PluginKind) -> Option<&PluginDeclaration> {
        self.declarations.iter().find(|d| d.kind == kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_parsing_is_case_insensitive() {
        assert_eq!("filesystem".parse::<PluginKind>(), Ok(PluginKind::FileSystem));
        assert_eq!(" QuickSearch ".parse::<PluginKind>(), Ok(PluginKind::QuickSearch));
        assert!("Viewer".parse::<PluginKind>().is_err());
    }

    #[test]
    fn test_extensions() {
        assert_eq!(PluginKind::FileSystem.extension(Architecture::X86), "wfx");
        assert_eq!(PluginKind::Packer.extension(Architecture::X64), "wcx64");
        assert_eq!(PluginKind::QuickSearch.extension(Architecture::X64), "dsx64");
    }

    #[test]
    fn test_architecture_parsing() {
        assert_eq!("amd64".parse::<Architecture>(), Ok(Architecture::X64));
        assert_eq!("32".parse::<Architecture>(), Ok(Architecture::X86));
        assert!("arm64".parse::<Architecture>().is_err());
    }
}
