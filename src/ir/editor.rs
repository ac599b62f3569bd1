use super::{Block, BlockKind, ExportMarker, Node};
use serde::Serialize;
use std::collections::BTreeSet;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RemovedExport {
    pub name: String,
    /// Method that carried the marker.
    pub method: String,
    pub line: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RemovalReport {
    pub removed: Vec<RemovedExport>,
    /// Requested names with no marker in the tree.
    pub missing: BTreeSet<String>,
}

impl RemovalReport {
    pub fn removed_names(&self) -> BTreeSet<&str> {
        self.removed.iter().map(|r| r.name.as_str()).collect()
    }
}

/// Deletes the export marker lines naming any of `excluded`.
///
/// Method bodies and their other markers are left untouched; a method whose
/// markers are all removed stays in the module, just no longer exported.
/// Names with no marker in the tree are reported, not treated as errors.
pub fn remove_exports(tree: &mut Block, excluded: &BTreeSet<String>) -> RemovalReport {
    let mut report = RemovalReport::default();
    strip_block(tree, excluded, &mut report);

    let removed = report.removed_names();
    report.missing = excluded
        .iter()
        .filter(|name| !removed.contains(name.as_str()))
        .cloned()
        .collect();
    for name in &report.missing {
        debug!("no export marker for {} in module text", name);
    }
    report
}

fn strip_block(block: &mut Block, excluded: &BTreeSet<String>, report: &mut RemovalReport) {
    if block.kind() == BlockKind::Method {
        let method = block
            .method()
            .map(|m| m.name.clone())
            .unwrap_or_default();
        block.children_mut().retain(|node| {
            let Node::Leaf(leaf) = node else {
                return true;
            };
            match ExportMarker::parse(&leaf.text) {
                Some(marker) if excluded.contains(&marker.name) => {
                    debug!("removing export {} from {} (line {})", marker.name, method, leaf.line);
                    report.removed.push(RemovedExport {
                        name: marker.name,
                        method: method.clone(),
                        line: leaf.line,
                    });
                    false
                }
                _ => true,
            }
        });
    }
    for node in block.children_mut() {
        if let Node::Block(child) = node {
            strip_block(child, excluded, report);
        }
    }
}
