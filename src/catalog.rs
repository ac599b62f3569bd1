//! Fixed catalog of interface members and native export names per plugin kind.
//!
//! The tables mirror the host's published ABI. Export names are resolved by
//! symbol name at native load time, so casing and spelling are significant.
//!
//! A member may export under several names (ANSI and Unicode entry points,
//! legacy aliases). Content members additionally carry the `FsContent*`
//! aliases a file-system module uses when it also serves content columns.

use crate::plugin::PluginKind;
use std::collections::{BTreeSet, HashMap};

/// One interface member and the native exports that back it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodContract {
    pub kind: PluginKind,
    /// `Interface.Member`, e.g. `IFsPlugin.FindFirst`.
    pub signature: String,
    pub export_names: &'static [&'static str],
    pub mandatory: bool,
    pub base_implemented: bool,
    /// Names used under the FileSystem module when Content is merged into it.
    pub merged_export_names: &'static [&'static str],
}

impl MethodContract {
    pub fn member_name(&self) -> &str {
        self.signature
            .split_once('.')
            .map(|(_, member)| member)
            .unwrap_or(&self.signature)
    }

    /// Always exported, whether or not the user overrides it.
    pub fn always_retained(&self) -> bool {
        self.mandatory || self.base_implemented
    }
}

struct Entry {
    member: &'static str,
    exports: &'static [&'static str],
    mandatory: bool,
    base: bool,
    merged: &'static [&'static str],
}

const fn mandatory(member: &'static str, exports: &'static [&'static str]) -> Entry {
    Entry { member, exports, mandatory: true, base: false, merged: &[] }
}

const fn base(member: &'static str, exports: &'static [&'static str]) -> Entry {
    Entry { member, exports, mandatory: false, base: true, merged: &[] }
}

const fn optional(member: &'static str, exports: &'static [&'static str]) -> Entry {
    Entry { member, exports, mandatory: false, base: false, merged: &[] }
}

const fn merged(entry: Entry, aliases: &'static [&'static str]) -> Entry {
    Entry { merged: aliases, ..entry }
}

const FILE_SYSTEM: &[Entry] = &[
    mandatory("FindFirst", &["FsFindFirst", "FsFindFirstW"]),
    mandatory("FindNext", &["FsFindNext", "FsFindNextW"]),
    mandatory("FindClose", &["FsFindClose"]),
    base("Init", &["FsInit", "FsInitW"]),
    base("SetCryptCallback", &["FsSetCryptCallback", "FsSetCryptCallbackW"]),
    base("SetDefaultParams", &["FsSetDefaultParams"]),
    base("GetDefRootName", &["FsGetDefRootName"]),
    base("GetBackgroundFlags", &["FsGetBackgroundFlags"]),
    optional("MkDir", &["FsMkDir", "FsMkDirW"]),
    optional("ExecuteFile", &["FsExecuteFile", "FsExecuteFileW"]),
    optional("RenMovFile", &["FsRenMovFile", "FsRenMovFileW"]),
    optional("GetFile", &["FsGetFile", "FsGetFileW"]),
    optional("PutFile", &["FsPutFile", "FsPutFileW"]),
    optional("DeleteFile", &["FsDeleteFile", "FsDeleteFileW"]),
    optional("RemoveDir", &["FsRemoveDir", "FsRemoveDirW"]),
    optional("Disconnect", &["FsDisconnect", "FsDisconnectW"]),
    optional("SetAttr", &["FsSetAttr", "FsSetAttrW"]),
    optional("SetTime", &["FsSetTime", "FsSetTimeW"]),
    optional("StatusInfo", &["FsStatusInfo", "FsStatusInfoW"]),
    optional("ExtractCustomIcon", &["FsExtractCustomIcon", "FsExtractCustomIconW"]),
    optional("GetPreviewBitmap", &["FsGetPreviewBitmap", "FsGetPreviewBitmapW"]),
    optional("LinksToLocalFiles", &["FsLinksToLocalFiles"]),
    optional("GetLocalName", &["FsGetLocalName", "FsGetLocalNameW"]),
    optional("GetDefaultView", &["FsContentGetDefaultView", "FsContentGetDefaultViewW"]),
];

const CONTENT: &[Entry] = &[
    merged(
        mandatory("GetSupportedField", &["ContentGetSupportedField"]),
        &["FsContentGetSupportedField"],
    ),
    merged(
        mandatory("GetValue", &["ContentGetValue", "ContentGetValueW"]),
        &["FsContentGetValue", "FsContentGetValueW"],
    ),
    base("SetDefaultParams", &["ContentSetDefaultParams"]),
    merged(
        base("PluginUnloading", &["ContentPluginUnloading"]),
        &["FsContentPluginUnloading"],
    ),
    optional("GetDetectString", &["ContentGetDetectString"]),
    merged(
        optional("StopGetValue", &["ContentStopGetValue", "ContentStopGetValueW"]),
        &["FsContentStopGetValue", "FsContentStopGetValueW"],
    ),
    merged(
        optional("GetDefaultSortOrder", &["ContentGetDefaultSortOrder"]),
        &["FsContentGetDefaultSortOrder"],
    ),
    merged(
        optional("GetSupportedFieldFlags", &["ContentGetSupportedFieldFlags"]),
        &["FsContentGetSupportedFieldFlags"],
    ),
    merged(
        optional("SetValue", &["ContentSetValue", "ContentSetValueW"]),
        &["FsContentSetValue", "FsContentSetValueW"],
    ),
    optional("EditValue", &["ContentEditValue"]),
    optional(
        "SendStateInformation",
        &["ContentSendStateInformation", "ContentSendStateInformationW"],
    ),
    optional("CompareFiles", &["ContentCompareFiles", "ContentCompareFilesW"]),
];

const LISTER: &[Entry] = &[
    mandatory("Load", &["ListLoad", "ListLoadW"]),
    base("SetDefaultParams", &["ListSetDefaultParams"]),
    optional("LoadNext", &["ListLoadNext", "ListLoadNextW"]),
    optional("CloseWindow", &["ListCloseWindow"]),
    optional("GetDetectString", &["ListGetDetectString"]),
    optional("SearchText", &["ListSearchText", "ListSearchTextW"]),
    optional("SearchDialog", &["ListSearchDialog"]),
    optional("SendCommand", &["ListSendCommand"]),
    optional("Print", &["ListPrint", "ListPrintW"]),
    optional("NotificationReceived", &["ListNotificationReceived"]),
    optional("GetPreviewBitmap", &["ListGetPreviewBitmap", "ListGetPreviewBitmapW"]),
];

const PACKER: &[Entry] = &[
    mandatory("OpenArchive", &["OpenArchive", "OpenArchiveW"]),
    mandatory("ReadHeader", &["ReadHeader", "ReadHeaderEx", "ReadHeaderExW"]),
    mandatory("ProcessFile", &["ProcessFile", "ProcessFileW"]),
    mandatory("CloseArchive", &["CloseArchive"]),
    base("SetChangeVolProc", &["SetChangeVolProc", "SetChangeVolProcW"]),
    base("SetProcessDataProc", &["SetProcessDataProc", "SetProcessDataProcW"]),
    base("GetPackerCaps", &["GetPackerCaps"]),
    base("PackSetDefaultParams", &["PackSetDefaultParams"]),
    base("SetCryptCallback", &["PkSetCryptCallback", "PkSetCryptCallbackW"]),
    base("GetBackgroundFlags", &["GetBackgroundFlags"]),
    optional("PackFiles", &["PackFiles", "PackFilesW"]),
    optional("DeleteFiles", &["DeleteFiles", "DeleteFilesW"]),
    optional("ConfigurePacker", &["ConfigurePacker"]),
    optional("StartMemPack", &["StartMemPack", "StartMemPackW"]),
    optional("PackToMem", &["PackToMem"]),
    optional("DoneMemPack", &["DoneMemPack"]),
    optional("CanYouHandleThisFile", &["CanYouHandleThisFile", "CanYouHandleThisFileW"]),
];

const QUICK_SEARCH: &[Entry] = &[
    mandatory("MatchFile", &["MatchFileW"]),
    mandatory("MatchGetSetOptions", &["MatchGetSetOptions"]),
];

fn entries(kind: PluginKind) -> &'static [Entry] {
    match kind {
        PluginKind::FileSystem => FILE_SYSTEM,
        PluginKind::Content => CONTENT,
        PluginKind::Lister => LISTER,
        PluginKind::Packer => PACKER,
        PluginKind::QuickSearch => QUICK_SEARCH,
    }
}

#[derive(Debug)]
struct KindCatalog {
    contracts: Vec<MethodContract>,
    by_signature: HashMap<String, usize>,
}

/// Immutable catalog, built once and passed by reference.
#[derive(Debug)]
pub struct ContractCatalog {
    kinds: HashMap<PluginKind, KindCatalog>,
}

impl ContractCatalog {
    pub fn load() -> Self {
        let kinds = PluginKind::ALL
            .into_iter()
            .map(|kind| (kind, build_kind(kind)))
            .collect();
        Self { kinds }
    }

    fn kind(&self, kind: PluginKind) -> &KindCatalog {
        // Every kind is populated by load().
        &self.kinds[&kind]
    }

    /// Members of `kind`, in ABI order.
    pub fn contracts(&self, kind: PluginKind) -> &[MethodContract] {
        &self.kind(kind).contracts
    }

    pub fn lookup(&self, kind: PluginKind, signature: &str) -> Option<&MethodContract> {
        let catalog = self.kind(kind);
        catalog
            .by_signature
            .get(signature)
            .map(|&index| &catalog.contracts[index])
    }

    /// Every export name a module of `kind` can carry.
    ///
    /// A FileSystem module always includes the `FsContent*` aliases so they can
    /// be stripped when no content plugin is merged in.
    pub fn export_universe(&self, kind: PluginKind) -> BTreeSet<&'static str> {
        let mut names: BTreeSet<&'static str> = self
            .contracts(kind)
            .iter()
            .flat_map(|contract| contract.export_names.iter().copied())
            .collect();
        if kind == PluginKind::FileSystem {
            names.extend(
                self.contracts(PluginKind::Content)
                    .iter()
                    .flat_map(|contract| contract.merged_export_names.iter().copied()),
            );
        }
        names
    }
}

impl Default for ContractCatalog {
    fn default() -> Self {
        Self::load()
    }
}

fn build_kind(kind: PluginKind) -> KindCatalog {
    let mut contracts = Vec::new();
    let mut by_signature = HashMap::new();
    let mut seen_exports = BTreeSet::new();

    for entry in entries(kind) {
        let signature = format!("{}.{}", kind.interface_name(), entry.member);
        let previous = by_signature.insert(signature.clone(), contracts.len());
        assert!(previous.is_none(), "duplicate catalog member {signature}");
        for name in entry.exports.iter().chain(entry.merged) {
            assert!(seen_exports.insert(*name), "duplicate export name {name} in {kind}");
        }
        contracts.push(MethodContract {
            kind,
            signature,
            export_names: entry.exports,
            mandatory: entry.mandatory,
            base_implemented: entry.base,
            merged_export_names: entry.merged,
        });
    }

    KindCatalog {
        contracts,
        by_signature,
    }
}
