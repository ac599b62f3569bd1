use super::lexer::{logical_lines, LogicalLine};
use super::{Block, BlockKind, Leaf, Node};
use crate::error::{Error, Result};
use tracing::debug;

/// Which declarations open blocks in a region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Region {
    /// Module level or inside `.namespace`.
    Module,
    /// Inside a `.class` body.
    Type,
    /// Everything is a leaf.
    Flat,
}

/// Parses module text into a block tree rooted at the module.
pub fn parse(text: &str) -> Result<Block> {
    let lines = logical_lines(text)?;
    let parser = Parser { lines: &lines };
    let children = parser.sequence(0, lines.len(), Region::Module)?;
    Ok(Block::root(children))
}

struct Parser<'l, 'a> {
    lines: &'l [LogicalLine<'a>],
}

impl Parser<'_, '_> {
    fn sequence(&self, start: usize, end: usize, region: Region) -> Result<Vec<Node>> {
        let mut nodes = Vec::new();
        let mut i = start;
        while i < end {
            let line = &self.lines[i];
            let kind = match region {
                Region::Flat => None,
                _ => opener(line.keyword(), region),
            };
            let kind = match kind {
                Some(kind) => Some(kind),
                None if line.net_braces() < 0 => {
                    return Err(Error::malformed(line.line, "unexpected `}`"));
                }
                // A body without a recognized declaration.
                None if region != Region::Flat && line.net_braces() > 0 => {
                    Some(BlockKind::Opaque)
                }
                None => None,
            };
            match kind {
                Some(kind) => {
                    let (block, next) = self.block(i, end, kind)?;
                    nodes.push(Node::Block(block));
                    i = next;
                }
                None => {
                    nodes.push(Node::Leaf(Leaf::from_logical(line)));
                    i += 1;
                }
            }
        }
        Ok(nodes)
    }

    /// Parses the block whose header is line `start`; returns it with the
    /// index of the first line after it.
    fn block(&self, start: usize, end: usize, kind: BlockKind) -> Result<(Block, usize)> {
        let header = &self.lines[start];
        let mut depth = header.net_braces();
        let mut open_line = (header.opens > 0).then_some(start);
        let mut next = start + 1;

        while !(open_line.is_some() && depth <= 0) {
            if next >= end {
                if open_line.is_some() {
                    return Err(Error::malformed(
                        header.line,
                        format!("unterminated {kind} block `{}`", header.keyword()),
                    ));
                }
                break;
            }
            let line = &self.lines[next];
            if open_line.is_none() && !is_continuation(line) {
                break;
            }
            depth += line.net_braces();
            if open_line.is_none() && line.opens > 0 {
                open_line = Some(next);
            }
            next += 1;
        }
        if depth < 0 {
            return Err(Error::malformed(
                self.lines[next - 1].line,
                format!("unbalanced `}}` closing {kind} block"),
            ));
        }

        let mut children = Vec::new();
        match open_line {
            None => children.extend(self.leaves(start + 1, next)),
            Some(open) => {
                children.extend(self.leaves(start + 1, open + 1));
                let close = next - 1;
                if close > open {
                    let inner = self.body(kind, start, open, close)?;
                    children.extend(inner);
                    children.push(Node::Leaf(Leaf::from_logical(&self.lines[close])));
                }
            }
        }

        let block = Block::new(kind, Leaf::from_logical(header), children);
        Ok((block, next))
    }

    /// Lines strictly between the opening and closing brace lines.
    fn body(&self, kind: BlockKind, header: usize, open: usize, close: usize) -> Result<Vec<Node>> {
        let region = match kind {
            BlockKind::Type => Region::Type,
            BlockKind::Opaque if self.lines[header].keyword() == ".namespace" => Region::Module,
            _ => Region::Flat,
        };
        let delimited =
            self.lines[open].net_braces() == 1 && self.lines[close].net_braces() == -1;
        if region == Region::Flat || !delimited {
            return Ok(self.leaves(open + 1, close).collect());
        }
        match self.sequence(open + 1, close, region) {
            Ok(nodes) => Ok(nodes),
            Err(err) => {
                debug!("keeping {} body at line {} flat: {}", kind, self.lines[open].line, err);
                Ok(self.leaves(open + 1, close).collect())
            }
        }
    }

    fn leaves(&self, start: usize, end: usize) -> impl Iterator<Item = Node> + '_ {
        self.lines[start..end]
            .iter()
            .map(|line| Node::Leaf(Leaf::from_logical(line)))
    }
}

fn opener(keyword: &str, region: Region) -> Option<BlockKind> {
    match (region, keyword) {
        (Region::Module, ".assembly") => Some(BlockKind::Assembly),
        (Region::Module, ".data") => Some(BlockKind::Data),
        (Region::Module, ".namespace" | ".mresource") => Some(BlockKind::Opaque),
        (Region::Module | Region::Type, ".class") => Some(BlockKind::Type),
        (Region::Module | Region::Type, ".method") => Some(BlockKind::Method),
        (Region::Type, ".property" | ".event") => Some(BlockKind::Opaque),
        _ => None,
    }
}

/// Lines between a header and its opening brace: `extends`, `implements`
/// clauses or the brace itself. Directives, comments and blank lines end a
/// header-only declaration such as `.data`.
fn is_continuation(line: &LogicalLine<'_>) -> bool {
    let trimmed = line.trimmed();
    if trimmed.starts_with('{') {
        return true;
    }
    !(trimmed.is_empty()
        || trimmed.starts_with('.')
        || trimmed.starts_with("//")
        || trimmed.starts_with('}'))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(block: &Block) -> Vec<BlockKind> {
        block.blocks().map(Block::kind).collect()
    }

    #[test]
    fn test_module_level_blocks() {
        let text = "\
// header comment
.assembly extern mscorlib
{
  .publickeytoken = (B7 7A 5C 56 19 34 E0 89 )
  .ver 4:0:0:0
}
.assembly Wrapper
{
}
.module Wrapper.dll
.data D_00004000 = bytearray (
                 01 02 03)
.data D_00004010 = int32(0)

.class private auto ansi '<Module>'
{
}
";
        let tree = parse(text).unwrap();
        assert_eq!(
            kinds(&tree),
            vec![
                BlockKind::Assembly,
                BlockKind::Assembly,
                BlockKind::Data,
                BlockKind::Data,
                BlockKind::Type
            ]
        );
        assert_eq!(tree.leaves().count(), 3);
        assert_eq!(tree.to_text(), text);
    }

    #[test]
    fn test_type_block_parses_methods_and_nested_types() {
        let text = "\
.class public auto ansi Outer
       extends [mscorlib]System.Object
       implements Sdk.IFoo
{
  .class nested private Inner
  {
    .method private void M() cil managed
    {
      ret
    }
  }
  .property instance string Name()
  {
    .get instance string Outer::get_Name()
  }
  .method public static int32 FsInit(int32 nr,
                                     native int proc) cil managed
  {
    .export [1] as FsInit
    .try
    {
      leave.s IL_0001
    }
    finally
    {
      endfinally
    }
    ret
  }
}
";
        let tree = parse(text).unwrap();
        let outer = tree.blocks().next().unwrap();
        assert_eq!(outer.kind(), BlockKind::Type);
        assert_eq!(
            kinds(outer),
            vec![BlockKind::Type, BlockKind::Opaque, BlockKind::Method]
        );
        let inner = outer.blocks().next().unwrap();
        assert_eq!(kinds(inner), vec![BlockKind::Method]);
        let init = outer.blocks().nth(2).unwrap();
        assert_eq!(init.method().unwrap().name, "FsInit");
        assert_eq!(init.blocks().count(), 0);
        assert_eq!(tree.to_text(), text);
    }

    #[test]
    fn test_method_name_wrapped_below_return_type() {
        let text = "\
.class public auto ansi Wrapper.Exports
       extends [mscorlib]System.Object
{
  .method public hidebysig static int32
          FsMkDir(native int path,
                  int32 flags) cil managed
  {
    .export [4] as FsMkDir
    ret
  }
  .method public static void Bare() cil managed {
    ret
  }
}
";
        let mut tree = parse(text).unwrap();
        let methods = tree.methods();
        let wrapped = methods[0].method().unwrap();
        assert_eq!(wrapped.name, "FsMkDir");
        assert!(wrapped.is_static);
        assert_eq!(
            crate::ir::method::split_top_level(&wrapped.params),
            vec!["native int path", "int32 flags"]
        );
        assert_eq!(methods[0].declaration().matches('{').count(), 0);
        assert_eq!(methods[1].method().unwrap().name, "Bare");

        let report = crate::ir::remove_exports(&mut tree, &["FsMkDir".to_string()].into());
        assert_eq!(report.removed[0].method, "FsMkDir");
        assert!(!tree.to_text().contains(".export"));
    }

    #[test]
    fn test_namespace_recurses_like_module_level() {
        let text = ".namespace Legacy\n{\n  .class public A\n  {\n  }\n}\n";
        let tree = parse(text).unwrap();
        let ns = tree.blocks().next().unwrap();
        assert_eq!(ns.kind(), BlockKind::Opaque);
        assert_eq!(kinds(ns), vec![BlockKind::Type]);
        assert_eq!(tree.to_text(), text);
    }

    #[test]
    fn test_global_method_at_module_level() {
        let text = ".method public static void Run() cil managed\n{\n  .export [1] as Run\n  ret\n}\n";
        let tree = parse(text).unwrap();
        assert_eq!(tree.methods().len(), 1);
        assert_eq!(tree.exports()[0].1.name, "Run");
    }

    #[test]
    fn test_braces_on_header_line() {
        let text = ".assembly extern x { .ver 1:0:0:0 }\n.class A {\n}\n";
        let tree = parse(text).unwrap();
        assert_eq!(kinds(&tree), vec![BlockKind::Assembly, BlockKind::Type]);
        assert_eq!(tree.to_text(), text);
    }

    #[test]
    fn test_unterminated_block_is_fatal() {
        let err = parse(".class A\n{\n  .method void M() cil managed\n  {\n  }\n").unwrap_err();
        assert!(matches!(err, Error::MalformedModuleText { line: 1, .. }));
    }

    #[test]
    fn test_stray_closing_brace_is_fatal() {
        let err = parse(".module x\n}\n").unwrap_err();
        assert!(matches!(err, Error::MalformedModuleText { line: 2, .. }));
    }

    #[test]
    fn test_unbalanced_paren_is_fatal() {
        let err = parse(".class A\n{\n.method void M(int32 a\n").unwrap_err();
        assert!(matches!(err, Error::MalformedModuleText { line: 3, .. }));
    }

    #[test]
    fn test_empty_text() {
        let tree = parse("").unwrap();
        assert!(tree.children().is_empty());
        assert_eq!(tree.to_text(), "");
    }
}
