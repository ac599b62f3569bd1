//! Plugforge Core Library
//!
//! Build tooling that turns a managed file manager plugin into a native
//! module exposing exactly the host ABI entry points the plugin implements.
//!
//! # Architecture
//!
//! The host resolves plugin entry points by export name. A prebuilt native
//! wrapper exports every entry point of a plugin kind; the build trims that
//! wrapper down to what the managed plugin actually provides:
//!
//! 1. Read the managed module's metadata (`metadata` module)
//! 2. Find the plugin-kind declarations (`scanner` module)
//! 3. Resolve which interface members the user's classes implement
//!    (`resolver` module)
//! 4. Decide the retained and stripped export names (`exports` module)
//! 5. Remove stripped export markers from the wrapper's IL text (`ir` module)
//! 6. Reassemble and package the plugin (`process`, `package` modules)
//!
//! `pipeline` runs these phases in order with cooperative cancellation.
//!
//! ## Contract Tables (`catalog` module)
//! - `ContractCatalog::load()` - Member and export tables for every kind
//! - `ContractCatalog::lookup()` - Contract by `Interface.Member` signature
//!
//! ## Data Structures (`plugin` module)
//! - `PluginKind` - FileSystem, Content, Lister, Packer, QuickSearch
//! - `Architecture` - Wrapper target architecture
//! - `PluginDeclaration` / `ScanResult` - Scanner output

pub mod catalog;
pub mod config;
pub mod error;
pub mod exports;
pub mod ir;
pub mod metadata;
pub mod package;
pub mod pipeline;
pub mod plugin;
pub mod process;
pub mod resolver;
pub mod scanner;

pub use catalog::{ContractCatalog, MethodContract};
pub use config::{Config, ConfigLoader};
pub use error::{Error, Result};
pub use exports::{compute, compute_for_module, ExportDecision, RetainReason, Verdict};
pub use pipeline::{BuildOutcome, BuildRequest, MetadataSource, WrapperTarget};
pub use plugin::{Architecture, PluginDeclaration, PluginKind, ScanResult};
pub use resolver::{implemented_members, ImplementedMember, OverrideResolver};
