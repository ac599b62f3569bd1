//! Block tree over the textual intermediate representation of a module.
//!
//! [`parse`] turns disassembled module text into a tree of [`Block`]s whose
//! leaves are the original logical lines. Serializing an unedited tree gives
//! back the input byte for byte. [`remove_exports`] edits the tree by deleting
//! export marker lines; nothing else is ever rewritten.

mod editor;
pub mod lexer;
pub mod method;
mod parser;

pub use editor::{remove_exports, RemovalReport, RemovedExport};
pub use method::{ExportMarker, MethodHeader};
pub use parser::parse;

use serde::Serialize;
use std::fmt;
use std::ops::Range;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum BlockKind {
    Assembly,
    Type,
    Method,
    Data,
    Opaque,
}

impl fmt::Display for BlockKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BlockKind::Assembly => "assembly",
            BlockKind::Type => "type",
            BlockKind::Method => "method",
            BlockKind::Data => "data",
            BlockKind::Opaque => "opaque",
        };
        f.write_str(name)
    }
}

/// One logical line of source text.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Leaf {
    pub text: String,
    /// Byte range in the parsed source.
    pub span: Range<usize>,
    /// 1-based number of the first physical line.
    pub line: usize,
}

impl Leaf {
    fn from_logical(line: &lexer::LogicalLine<'_>) -> Self {
        Self {
            text: line.text.to_string(),
            span: line.start..line.start + line.text.len(),
            line: line.line,
        }
    }

    pub fn trimmed(&self) -> &str {
        self.text.trim()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Node {
    Leaf(Leaf),
    Block(Block),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    kind: BlockKind,
    header: Leaf,
    children: Vec<Node>,
    method: Option<MethodHeader>,
}

impl Block {
    fn new(kind: BlockKind, header: Leaf, children: Vec<Node>) -> Self {
        let method = match kind {
            BlockKind::Method => MethodHeader::parse(&declaration_text(&header, &children)),
            _ => None,
        };
        Self {
            kind,
            header,
            children,
            method,
        }
    }

    fn root(children: Vec<Node>) -> Self {
        Self::new(BlockKind::Opaque, Leaf::default(), children)
    }

    /// Header text joined with the continuation lines before the opening
    /// brace, e.g. a method name wrapped below its return type.
    pub fn declaration(&self) -> String {
        declaration_text(&self.header, &self.children)
    }

    pub fn kind(&self) -> BlockKind {
        self.kind
    }

    pub fn header(&self) -> &Leaf {
        &self.header
    }

    pub fn children(&self) -> &[Node] {
        &self.children
    }

    /// Header facts for method blocks.
    pub fn method(&self) -> Option<&MethodHeader> {
        self.method.as_ref()
    }

    /// Direct child blocks.
    pub fn blocks(&self) -> impl Iterator<Item = &Block> {
        self.children.iter().filter_map(|node| match node {
            Node::Block(block) => Some(block),
            Node::Leaf(_) => None,
        })
    }

    /// Direct child leaves.
    pub fn leaves(&self) -> impl Iterator<Item = &Leaf> {
        self.children.iter().filter_map(|node| match node {
            Node::Leaf(leaf) => Some(leaf),
            Node::Block(_) => None,
        })
    }

    /// Visits this block and every nested block, depth first.
    pub fn walk<'a>(&'a self, visit: &mut impl FnMut(&'a Block)) {
        visit(self);
        for block in self.blocks() {
            block.walk(visit);
        }
    }

    /// All method blocks in the tree.
    pub fn methods(&self) -> Vec<&Block> {
        let mut methods = Vec::new();
        self.walk(&mut |block| {
            if block.kind == BlockKind::Method {
                methods.push(block);
            }
        });
        methods
    }

    /// Export markers declared directly in this method block.
    pub fn export_markers(&self) -> Vec<ExportMarker> {
        if self.kind != BlockKind::Method {
            return Vec::new();
        }
        self.leaves()
            .filter_map(|leaf| ExportMarker::parse(&leaf.text))
            .collect()
    }

    /// Every export marker in the tree with the name of its method.
    pub fn exports(&self) -> Vec<(String, ExportMarker)> {
        self.methods()
            .into_iter()
            .flat_map(|block| {
                let owner = block
                    .method()
                    .map(|m| m.name.clone())
                    .unwrap_or_default();
                block
                    .export_markers()
                    .into_iter()
                    .map(move |marker| (owner.clone(), marker))
            })
            .collect()
    }

    pub fn write_into(&self, out: &mut String) {
        out.push_str(&self.header.text);
        for node in &self.children {
            match node {
                Node::Leaf(leaf) => out.push_str(&leaf.text),
                Node::Block(block) => block.write_into(out),
            }
        }
    }

    pub fn to_text(&self) -> String {
        let mut out = String::new();
        self.write_into(&mut out);
        out
    }

    fn children_mut(&mut self) -> &mut Vec<Node> {
        &mut self.children
    }
}

fn declaration_text(header: &Leaf, children: &[Node]) -> String {
    let mut text = header.text.clone();
    if text.contains('{') {
        return text;
    }
    for node in children {
        let Node::Leaf(leaf) = node else {
            break;
        };
        if leaf.trimmed().starts_with('{') {
            break;
        }
        text.push_str(&leaf.text);
        if leaf.text.contains('{') {
            break;
        }
    }
    text
}

impl fmt::Display for Block {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_text())
    }
}
