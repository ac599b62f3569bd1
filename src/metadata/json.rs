//! Reads a metadata dump serialized as JSON.
//!
//! The dump holds the user module and the modules it references (at least
//! the SDK base assembly), in the shape of [`Module`].

use super::Module;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MetadataDump {
    pub module: Module,
    #[serde(default)]
    pub references: Vec<Module>,
}

pub fn from_str(text: &str) -> Result<MetadataDump> {
    let dump: MetadataDump = serde_json::from_str(text)?;
    if dump.module.assembly.name.trim().is_empty() {
        return Err(Error::metadata("metadata dump has no assembly name"));
    }
    Ok(dump)
}

pub fn load(path: &Path) -> Result<MetadataDump> {
    let text = fs::read_to_string(path).map_err(|e| {
        Error::metadata(format!("failed to read metadata dump {:?}: {}", path, e))
    })?;
    from_str(&text)
}
