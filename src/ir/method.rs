//! Declaration header tokens, method headers and export markers.

use crate::metadata::Visibility;
use serde::Serialize;

/// A header token: a word, optionally followed directly by a `( … )` group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Token {
    pub word: String,
    /// Contents between the parentheses, without them.
    pub group: Option<String>,
}

/// Splits declaration text into tokens, dropping comments.
///
/// `[scope]` prefixes and `<generic>` arguments stay inside the word they
/// belong to.
pub fn tokenize(text: &str) -> Vec<Token> {
    let chars: Vec<char> = text.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        if c.is_whitespace() {
            i += 1;
            continue;
        }
        if c == '/' && chars.get(i + 1) == Some(&'/') {
            while i < chars.len() && chars[i] != '\n' {
                i += 1;
            }
            continue;
        }
        if c == '/' && chars.get(i + 1) == Some(&'*') {
            i += 2;
            while i < chars.len() && !(chars[i] == '*' && chars.get(i + 1) == Some(&'/')) {
                i += 1;
            }
            i += 2;
            continue;
        }

        let mut word = String::new();
        while i < chars.len() {
            let c = chars[i];
            if c.is_whitespace() || c == '(' {
                break;
            }
            match c {
                '\'' | '"' => {
                    let end = skip_literal(&chars, i);
                    word.extend(&chars[i..end]);
                    i = end;
                }
                '[' => {
                    let end = skip_nested(&chars, i, '[', ']');
                    word.extend(&chars[i..end]);
                    i = end;
                }
                '<' => {
                    let end = skip_nested(&chars, i, '<', '>');
                    word.extend(&chars[i..end]);
                    i = end;
                }
                _ => {
                    word.push(c);
                    i += 1;
                }
            }
        }

        let group = if chars.get(i) == Some(&'(') {
            let end = skip_nested(&chars, i, '(', ')');
            let inner_end = end.saturating_sub(1).max(i + 1);
            let inner: String = chars[i + 1..inner_end].iter().collect();
            i = end;
            Some(inner)
        } else {
            None
        };
        tokens.push(Token { word, group });
    }
    tokens
}

/// Index just past the literal starting at `start`.
fn skip_literal(chars: &[char], start: usize) -> usize {
    let quote = chars[start];
    let mut i = start + 1;
    while i < chars.len() {
        match chars[i] {
            '\\' => i += 2,
            c if c == quote => return i + 1,
            _ => i += 1,
        }
    }
    chars.len()
}

/// Index just past the delimiter closing the one at `start`.
fn skip_nested(chars: &[char], start: usize, open: char, close: char) -> usize {
    let mut depth = 0usize;
    let mut i = start;
    while i < chars.len() {
        let c = chars[i];
        if c == '\'' || c == '"' {
            i = skip_literal(chars, i);
            continue;
        }
        if c == '/' && chars.get(i + 1) == Some(&'/') {
            while i < chars.len() && chars[i] != '\n' {
                i += 1;
            }
            continue;
        }
        if c == open {
            depth += 1;
        } else if c == close {
            depth -= 1;
            if depth == 0 {
                return i + 1;
            }
        }
        i += 1;
    }
    chars.len()
}

/// Splits at commas that are not nested in brackets of any kind.
pub fn split_top_level(text: &str) -> Vec<String> {
    let mut parts = Vec::new();
    let mut depth = 0isize;
    let mut current = String::new();
    let mut in_literal: Option<char> = None;

    for c in text.chars() {
        if let Some(quote) = in_literal {
            current.push(c);
            if c == quote {
                in_literal = None;
            }
            continue;
        }
        match c {
            '\'' | '"' => in_literal = Some(c),
            '(' | '[' | '<' => depth += 1,
            ')' | ']' | '>' => depth -= 1,
            ',' if depth == 0 => {
                parts.push(current.trim().to_string());
                current.clear();
                continue;
            }
            _ => {}
        }
        current.push(c);
    }
    if !current.trim().is_empty() {
        parts.push(current.trim().to_string());
    }
    parts
}

/// Removes surrounding single quotes from an IL identifier.
pub fn unquote(word: &str) -> &str {
    word.strip_prefix('\'')
        .and_then(|rest| rest.strip_suffix('\''))
        .unwrap_or(word)
}

/// Visibility keyword, if `word` is one.
pub fn visibility(word: &str) -> Option<Visibility> {
    let visibility = match word {
        "public" => Visibility::Public,
        "private" => Visibility::Private,
        "family" => Visibility::Family,
        "assembly" => Visibility::Assembly,
        "famorassem" => Visibility::FamilyOrAssembly,
        "famandassem" => Visibility::FamilyAndAssembly,
        "privatescope" | "compilercontrolled" => Visibility::CompilerControlled,
        _ => return None,
    };
    Some(visibility)
}

/// Marshaling and interop qualifiers that carry a group but are not the
/// member signature.
const QUALIFIERS: &[&str] = &["marshal", "modopt", "modreq", "pinvokeimpl"];

/// Facts extracted from a `.method` header.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MethodHeader {
    pub name: String,
    /// Name plus parameter list as written, e.g. `FsFindFirst(string path)`.
    pub signature: String,
    /// Raw parameter list, without parentheses.
    pub params: String,
    pub visibility: Visibility,
    pub is_static: bool,
    pub is_virtual: bool,
    pub is_abstract: bool,
    pub is_newslot: bool,
    pub is_final: bool,
}

impl MethodHeader {
    pub fn parse(header: &str) -> Option<Self> {
        let tokens = tokenize(header);
        let (first, rest) = tokens.split_first()?;
        if first.word != ".method" {
            return None;
        }

        let mut method = MethodHeader {
            name: String::new(),
            signature: String::new(),
            params: String::new(),
            visibility: Visibility::Private,
            is_static: false,
            is_virtual: false,
            is_abstract: false,
            is_newslot: false,
            is_final: false,
        };

        for token in rest {
            if let Some(group) = &token.group {
                if QUALIFIERS.contains(&token.word.as_str()) || token.word.is_empty() {
                    continue;
                }
                let name = if token.word.starts_with('\'') {
                    unquote(&token.word)
                } else {
                    // Generic parameters are not part of the name.
                    token.word.split('<').next().unwrap_or(&token.word)
                };
                method.name = name.to_string();
                method.signature = format!("{}({})", token.word, group);
                method.params = group.clone();
                return Some(method);
            }
            if let Some(visibility) = visibility(&token.word) {
                method.visibility = visibility;
                continue;
            }
            match token.word.as_str() {
                "static" => method.is_static = true,
                "instance" => method.is_static = false,
                "virtual" => method.is_virtual = true,
                "abstract" => method.is_abstract = true,
                "newslot" => method.is_newslot = true,
                "final" => method.is_final = true,
                _ => {}
            }
        }
        None
    }
}

/// A `.export [n] as Name` line inside a method body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExportMarker {
    pub ordinal: Option<u32>,
    pub name: String,
}

impl ExportMarker {
    pub fn parse(line: &str) -> Option<Self> {
        let rest = line.trim_start().strip_prefix(".export")?;
        if !rest.starts_with(|c: char| c.is_whitespace() || c == '[') {
            return None;
        }
        let mut rest = rest.trim_start();
        let mut ordinal = None;
        if let Some(after) = rest.strip_prefix('[') {
            let (number, tail) = after.split_once(']')?;
            ordinal = number.trim().parse().ok();
            rest = tail.trim_start();
        }
        let rest = rest.strip_prefix("as")?;
        if !rest.starts_with(char::is_whitespace) {
            return None;
        }
        let name = rest.split("//").next().unwrap_or("").trim();
        let name = unquote(name);
        if name.is_empty() {
            return None;
        }
        Some(Self {
            ordinal,
            name: name.to_string(),
        })
    }
}
