//! Groups physical lines into logical lines.
//!
//! A logical line keeps absorbing physical lines while parentheses are
//! unbalanced. Parentheses and braces inside `"strings"`, `'quoted names'`
//! and comments are not counted.

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogicalLine<'a> {
    /// Raw text including line terminators.
    pub text: &'a str,
    /// Byte offset of `text` in the source.
    pub start: usize,
    /// 1-based number of the first physical line.
    pub line: usize,
    pub opens: usize,
    pub closes: usize,
}

impl<'a> LogicalLine<'a> {
    pub fn net_braces(&self) -> isize {
        self.opens as isize - self.closes as isize
    }

    pub fn trimmed(&self) -> &'a str {
        self.text.trim()
    }

    /// First whitespace-delimited token, e.g. `.method`.
    pub fn keyword(&self) -> &'a str {
        self.trimmed().split_whitespace().next().unwrap_or("")
    }
}

#[derive(Debug, Default)]
struct Counts {
    parens: isize,
    opens: usize,
    closes: usize,
}

/// Scanner state that survives a line break.
#[derive(Debug, Default)]
struct Scanner {
    in_block_comment: bool,
}

impl Scanner {
    fn scan(&mut self, line: &str, counts: &mut Counts) {
        let mut chars = line.chars().peekable();
        while let Some(c) = chars.next() {
            if self.in_block_comment {
                if c == '*' && chars.peek() == Some(&'/') {
                    chars.next();
                    self.in_block_comment = false;
                }
                continue;
            }
            match c {
                '/' if chars.peek() == Some(&'/') => break,
                '/' if chars.peek() == Some(&'*') => {
                    chars.next();
                    self.in_block_comment = true;
                }
                '"' | '\'' => {
                    // Literals never span physical lines.
                    while let Some(inner) = chars.next() {
                        if inner == '\\' {
                            chars.next();
                        } else if inner == c || inner == '\n' {
                            break;
                        }
                    }
                }
                '(' => counts.parens += 1,
                ')' => counts.parens -= 1,
                '{' => counts.opens += 1,
                '}' => counts.closes += 1,
                _ => {}
            }
        }
    }
}

pub fn logical_lines(text: &str) -> Result<Vec<LogicalLine<'_>>> {
    let mut lines = Vec::new();
    let mut scanner = Scanner::default();
    let mut offset = 0;
    let mut pending: Option<(usize, usize, Counts)> = None;

    for (index, physical) in text.split_inclusive('\n').enumerate() {
        let number = index + 1;
        let (start, first_line, mut counts) =
            pending.take().unwrap_or((offset, number, Counts::default()));
        scanner.scan(physical, &mut counts);
        offset += physical.len();

        if counts.parens < 0 {
            return Err(Error::malformed(number, "unbalanced `)`"));
        }
        if counts.parens > 0 {
            pending = Some((start, first_line, counts));
            continue;
        }
        lines.push(LogicalLine {
            text: &text[start..offset],
            start,
            line: first_line,
            opens: counts.opens,
            closes: counts.closes,
        });
    }

    if let Some((_, first_line, _)) = pending {
        return Err(Error::malformed(
            first_line,
            "unbalanced `(` at end of input",
        ));
    }
    Ok(lines)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_groups_lines_until_parens_balance() {
        let text = ".method public static int32 FsInit(int32 a,\n    int32 b) cil managed\n{\n";
        let lines = logical_lines(text).unwrap();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0].line, 1);
        assert!(lines[0].text.ends_with("cil managed\n"));
        assert_eq!(lines[1].line, 3);
        assert_eq!(lines[1].opens, 1);
        assert_eq!(lines[1].start, lines[0].text.len());
    }

    #[test]
    fn test_ignores_delimiters_in_literals_and_comments() {
        let text = "ldstr \"{(\"\n// }\n.custom = ( 01 ) // )(\n/* {\n } */ nop\n";
        let lines = logical_lines(text).unwrap();
        assert_eq!(lines.len(), 5);
        assert!(lines.iter().all(|l| l.opens == 0 && l.closes == 0));
    }

    #[test]
    fn test_quoted_names_do_not_count() {
        let lines = logical_lines("call void 'odd(name'::M()\n").unwrap();
        assert_eq!(lines.len(), 1);
    }

    #[test]
    fn test_trailing_open_paren_is_fatal() {
        let err = logical_lines("ok\n.method void F(int32 a,\n").unwrap_err();
        assert!(matches!(err, Error::MalformedModuleText { line: 2, .. }));
    }

    #[test]
    fn test_stray_close_paren_is_fatal() {
        let err = logical_lines("a)\n").unwrap_err();
        assert!(matches!(err, Error::MalformedModuleText { line: 1, .. }));
    }

    #[test]
    fn test_preserves_crlf_and_missing_final_newline() {
        let text = "a\r\nb";
        let lines = logical_lines(text).unwrap();
        assert_eq!(lines[0].text, "a\r\n");
        assert_eq!(lines[1].text, "b");
        assert_eq!(lines[1].keyword(), "b");
    }

    #[test]
    fn test_empty_input() {
        assert!(logical_lines("").unwrap().is_empty());
    }
}
