//! Maps disassembled module text onto the metadata model.
//!
//! Only declarations are read: the assembly identity and attributes, class
//! headers, method headers, `.override` directives and `.custom` attributes.
//! Method bodies are never interpreted.

use super::{
    normalize_type, AssemblyIdentity, AttributeArg, CustomAttribute, MemberRef, MethodDef,
    Module, TypeDef, TypeKind,
};
use crate::error::Result;
use crate::ir::method::{split_top_level, tokenize, unquote, Token};
use crate::ir::{self, Block, BlockKind, Leaf, MethodHeader};
use tracing::debug;

pub fn from_text(text: &str) -> Result<Module> {
    let tree = ir::parse(text)?;
    Ok(from_tree(&tree))
}

pub fn from_tree(tree: &Block) -> Module {
    let mut module = Module::default();
    read_region(tree, "", &mut module);
    module
}

fn read_region(region: &Block, namespace: &str, module: &mut Module) {
    for leaf in region.leaves() {
        if let Some(attribute) = parse_custom(&leaf.text) {
            module.attributes.push(attribute);
        }
    }
    for block in region.blocks() {
        match block.kind() {
            BlockKind::Assembly => read_assembly(block, module),
            BlockKind::Type => read_type(block, namespace, None, &mut module.types),
            BlockKind::Opaque if keyword(block.header()) == ".namespace" => {
                let name = tokenize(&block.header().text)
                    .get(1)
                    .map(|t| unquote(&t.word).to_string())
                    .unwrap_or_default();
                let nested = qualify(namespace, &name);
                read_region(block, &nested, module);
            }
            _ => {}
        }
    }
}

fn keyword(leaf: &Leaf) -> &str {
    leaf.trimmed().split_whitespace().next().unwrap_or("")
}

fn qualify(namespace: &str, name: &str) -> String {
    if namespace.is_empty() {
        name.to_string()
    } else {
        format!("{namespace}.{name}")
    }
}

fn read_assembly(block: &Block, module: &mut Module) {
    let tokens = tokenize(&block.header().text);
    if tokens.iter().any(|t| t.word == "extern") {
        return;
    }
    let Some(name) = tokens
        .iter()
        .skip(1)
        .filter(|t| t.word != "{" && t.group.is_none())
        .last()
    else {
        return;
    };
    module.assembly = AssemblyIdentity {
        name: unquote(&name.word).to_string(),
        version: None,
    };
    for leaf in block.leaves() {
        let trimmed = leaf.trimmed();
        if let Some(version) = trimmed.strip_prefix(".ver") {
            let version = version.trim().replace(':', ".");
            if !version.is_empty() {
                module.assembly.version = Some(version);
            }
        } else if let Some(attribute) = parse_custom(&leaf.text) {
            module.attributes.push(attribute);
        }
    }
}

const CLASS_FLAGS: &[&str] = &[
    "public", "private", "nested", "family", "assembly", "famandassem", "famorassem",
    "auto", "sequential", "explicit", "ansi", "unicode", "autochar", "abstract", "sealed",
    "interface", "beforefieldinit", "serializable", "specialname", "rtspecialname", "import",
    "windowsruntime", "value", "enum",
];

fn read_type(block: &Block, namespace: &str, enclosing: Option<&str>, types: &mut Vec<TypeDef>) {
    // Header text plus `extends`/`implements` continuation lines.
    let tokens = tokenize(&block.declaration());
    let words: Vec<&str> = tokens.iter().skip(1).map(|t| t.word.as_str()).collect();

    let flags: Vec<&str> = words
        .iter()
        .take_while(|w| CLASS_FLAGS.contains(w))
        .copied()
        .collect();
    let Some(raw_name) = words.get(flags.len()) else {
        debug!("skipping class without a name at line {}", block.header().line);
        return;
    };
    let name = strip_generics(unquote(raw_name));
    let full_name = match enclosing {
        Some(outer) => format!("{outer}/{name}"),
        None => qualify(namespace, &name),
    };

    let mut base_type = None;
    let mut interfaces = Vec::new();
    let mut clause = "";
    for word in &words[flags.len() + 1..] {
        match *word {
            "{" => break,
            "extends" | "implements" => clause = word,
            "class" | "valuetype" | "," => {}
            _ if clause == "extends" && base_type.is_none() => {
                base_type = Some(type_ref_name(word.trim_end_matches(',')));
            }
            _ if clause == "implements" => {
                for part in split_top_level(word) {
                    interfaces.push(type_ref_name(&part));
                }
            }
            _ => {}
        }
    }

    let kind = if flags.contains(&"interface") {
        TypeKind::Interface
    } else if matches!(
        base_type.as_deref(),
        Some("System.ValueType") | Some("System.Enum")
    ) {
        TypeKind::ValueType
    } else {
        TypeKind::Class
    };

    let mut ty = TypeDef {
        full_name: full_name.clone(),
        kind,
        is_abstract: flags.contains(&"abstract"),
        base_type,
        interfaces,
        methods: Vec::new(),
        attributes: Vec::new(),
    };

    let mut class_overrides = Vec::new();
    for leaf in block.leaves() {
        if let Some(attribute) = parse_custom(&leaf.text) {
            ty.attributes.push(attribute);
        } else if let Some(pair) = parse_class_override(leaf.trimmed()) {
            class_overrides.push(pair);
        }
    }

    let mut nested = Vec::new();
    for child in block.blocks() {
        match child.kind() {
            BlockKind::Method => {
                if let Some(method) = read_method(child) {
                    ty.methods.push(method);
                }
            }
            BlockKind::Type => nested.push(child),
            _ => {}
        }
    }

    for (declaration, body_name, body_params) in class_overrides {
        let target = ty.methods.iter_mut().find(|m| {
            m.name == body_name && body_params.as_ref().map_or(true, |p| *p == m.params)
        });
        match target {
            Some(method) => method.overrides.push(declaration),
            None => debug!("no body {} for class-level override in {}", body_name, full_name),
        }
    }

    types.push(ty);
    for child in nested {
        read_type(child, namespace, Some(&full_name), types);
    }
}

fn read_method(block: &Block) -> Option<MethodDef> {
    let header: &MethodHeader = block.method()?;
    let overrides = block
        .leaves()
        .filter_map(|leaf| {
            let rest = leaf.trimmed().strip_prefix(".override")?;
            parse_member_ref(rest)
        })
        .collect();
    Some(MethodDef {
        name: header.name.clone(),
        params: param_types(&header.params),
        visibility: header.visibility,
        is_static: header.is_static,
        is_virtual: header.is_virtual,
        is_abstract: header.is_abstract,
        is_newslot: header.is_newslot,
        is_final: header.is_final,
        overrides,
    })
}

/// Parses `Type::Member` or `method <ret> Type::Member(<params>)`.
fn parse_member_ref(text: &str) -> Option<MemberRef> {
    let tokens = tokenize(text);
    let token = tokens.iter().find(|t| t.word.contains("::"))?;
    let (owner, name) = token.word.rsplit_once("::")?;
    Some(MemberRef {
        declaring_type: type_ref_name(owner),
        name: unquote(name).to_string(),
        params: token.group.as_deref().map(param_types),
    })
}

/// Class-level `.override Decl::Member with <ret> Type::Body(<params>)`.
fn parse_class_override(trimmed: &str) -> Option<(MemberRef, String, Option<Vec<String>>)> {
    let rest = trimmed.strip_prefix(".override")?;
    let (declaration, body) = rest.split_once(" with ")?;
    let declaration = parse_member_ref(declaration)?;
    let body = parse_member_ref(body)?;
    Some((declaration, body.name, body.params))
}

/// Normalized parameter types of a raw parameter list.
pub fn param_types(params: &str) -> Vec<String> {
    split_top_level(params)
        .iter()
        .map(|param| param_type(param))
        .collect()
}

fn param_type(param: &str) -> String {
    let tokens: Vec<Token> = tokenize(param);
    let mut words: Vec<String> = tokens
        .into_iter()
        .filter(|t| !matches!(t.word.as_str(), "marshal" | "modopt" | "modreq"))
        .map(|t| t.word)
        .filter(|w| !matches!(w.as_str(), "[in]" | "[out]" | "[opt]"))
        .collect();
    if has_parameter_name(&words) {
        words.pop();
    }
    normalize_type(&words.join(" "))
}

fn has_parameter_name(words: &[String]) -> bool {
    let [.., previous, last] = words else {
        return false;
    };
    if matches!(previous.as_str(), "native" | "unsigned" | "class" | "valuetype") {
        return false;
    }
    !last
        .chars()
        .any(|c| matches!(c, '.' | '[' | ']' | '&' | '*' | '<' | '>' | '!' | '`'))
}

/// Type reference without scope, keyword or generic arguments.
fn type_ref_name(text: &str) -> String {
    strip_generics(unquote(&normalize_type(text)))
}

fn strip_generics(name: &str) -> String {
    name.split('<').next().unwrap_or(name).to_string()
}

/// Parses a `.custom` line into an attribute.
fn parse_custom(text: &str) -> Option<CustomAttribute> {
    let tokens = tokenize(text);
    if tokens.first()?.word != ".custom" {
        return None;
    }
    let ctor = tokens.iter().find(|t| t.word.ends_with("::.ctor"))?;
    let type_name = type_ref_name(ctor.word.trim_end_matches("::.ctor"));
    let ctor_params = param_types(ctor.group.as_deref().unwrap_or(""));

    let equals = tokens.iter().position(|t| t.word == "=")?;
    let value = &tokens[equals + 1..];
    let args = match value.first() {
        Some(Token { word, group: Some(blob) }) if word.is_empty() => {
            let bytes = parse_hex(blob);
            decode_blob(&bytes, &ctor_params)
        }
        Some(_) => decode_verbal(value),
        None => Vec::new(),
    };
    Some(CustomAttribute { type_name, args })
}

fn parse_hex(blob: &str) -> Vec<u8> {
    blob.lines()
        .map(|line| line.split("//").next().unwrap_or(""))
        .flat_map(str::split_whitespace)
        .filter_map(|byte| u8::from_str_radix(byte, 16).ok())
        .collect()
}

/// Decodes the fixed arguments of a custom attribute blob. Arguments that
/// cannot be decoded come back as [`AttributeArg::Other`] so the count still
/// matches the constructor.
fn decode_blob(bytes: &[u8], params: &[String]) -> Vec<AttributeArg> {
    let mut args = Vec::with_capacity(params.len());
    if !bytes.starts_with(&[0x01, 0x00]) {
        args.extend(params.iter().map(|p| AttributeArg::Other(p.clone())));
        return args;
    }
    let mut reader = BlobReader { bytes, pos: 2 };
    let mut broken = false;
    for param in params {
        if broken {
            args.push(AttributeArg::Other(param.clone()));
            continue;
        }
        let value = match param.as_str() {
            "string" => reader.ser_string().map(AttributeArg::String),
            "System.Type" => reader.ser_string().map(|name| match name {
                Some(name) => AttributeArg::Type(serialized_type_name(&name)),
                None => AttributeArg::Other("null type".into()),
            }),
            "bool" => reader.take(1).map(|b| AttributeArg::Bool(b[0] != 0)),
            "int8" | "uint8" => reader.int(1),
            "int16" | "uint16" | "char" => reader.int(2),
            "int32" | "uint32" => reader.int(4),
            "int64" | "uint64" => reader.int(8),
            _ => None,
        };
        match value {
            Some(value) => args.push(value),
            None => {
                broken = true;
                args.push(AttributeArg::Other(param.clone()));
            }
        }
    }
    args
}

/// `Ns.Outer+Inner, Assembly, Version=...` becomes `Ns.Outer/Inner`.
fn serialized_type_name(name: &str) -> String {
    name.split(',')
        .next()
        .unwrap_or(name)
        .trim()
        .replace('+', "/")
}

struct BlobReader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> BlobReader<'a> {
    fn take(&mut self, len: usize) -> Option<&'a [u8]> {
        let slice = self.bytes.get(self.pos..self.pos + len)?;
        self.pos += len;
        Some(slice)
    }

    fn int(&mut self, len: usize) -> Option<AttributeArg> {
        let bytes = self.take(len)?;
        let mut buf = [0u8; 8];
        buf[..len].copy_from_slice(bytes);
        let value = match len {
            1 => i64::from(bytes[0] as i8),
            2 => i64::from(i16::from_le_bytes([bytes[0], bytes[1]])),
            4 => i64::from(i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])),
            _ => i64::from_le_bytes(buf),
        };
        Some(AttributeArg::Int(value))
    }

    fn compressed_len(&mut self) -> Option<usize> {
        let first = *self.take(1)?.first()?;
        if first & 0x80 == 0 {
            return Some(usize::from(first));
        }
        if first & 0xC0 == 0x80 {
            let second = *self.take(1)?.first()?;
            return Some((usize::from(first & 0x3F) << 8) | usize::from(second));
        }
        let rest = self.take(3)?;
        Some(
            (usize::from(first & 0x1F) << 24)
                | (usize::from(rest[0]) << 16)
                | (usize::from(rest[1]) << 8)
                | usize::from(rest[2]),
        )
    }

    /// `None` inside the option is the serialized null string.
    fn ser_string(&mut self) -> Option<Option<String>> {
        if self.bytes.get(self.pos) == Some(&0xFF) {
            self.pos += 1;
            return Some(None);
        }
        let len = self.compressed_len()?;
        let bytes = self.take(len)?;
        Some(Some(String::from_utf8_lossy(bytes).into_owned()))
    }
}

/// Decodes the `{ string('…') type(…) }` form of attribute values.
fn decode_verbal(tokens: &[Token]) -> Vec<AttributeArg> {
    tokens
        .iter()
        .filter_map(|token| {
            let group = token.group.as_deref()?;
            let arg = match token.word.as_str() {
                "string" if group.trim() == "nullref" => AttributeArg::String(None),
                "string" => AttributeArg::String(Some(unquote(group.trim()).to_string())),
                "type" => AttributeArg::Type(type_ref_name(group.trim())),
                "bool" => AttributeArg::Bool(group.trim() == "true"),
                word if word.starts_with("int") || word.starts_with("uint") => group
                    .trim()
                    .parse()
                    .map(AttributeArg::Int)
                    .unwrap_or_else(|_| AttributeArg::Other(group.to_string())),
                _ => AttributeArg::Other(format!("{}({})", token.word, group)),
            };
            Some(arg)
        })
        .collect()
}
