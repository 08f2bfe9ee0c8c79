// vendas-core/src/script.rs
//! Console query scripts
//!
//! Query files are written the way they are typed into the database shell:
//!
//! ```javascript
//! // db-vendas-aggregate-produtos-distintos.js
//! db.vendas.aggregate([
//!       { $unwind: "$compras" },
//!       { $group: { _id: "$compras.nome_produto" } },
//!       { $project: { "nome_produto": "$_id", "_id": 0 } }
//!     ]).pretty()
//! ```
//!
//! The pipeline literal is relaxed JSON: bare keys, single-quoted strings,
//! trailing commas and comments are accepted and rewritten to strict JSON
//! before the pipeline is parsed.

use crate::aggregation::Pipeline;
use crate::error::{Result, VendasError};
use lazy_static::lazy_static;
use regex::Regex;
use serde_json::Value;
use std::fs;
use std::path::Path;
use tracing::warn;

lazy_static! {
    static ref NAME_RE: Regex = Regex::new(r"^\s*//\s*(\S+)").expect("valid regex");
    static ref CALL_RE: Regex = Regex::new(
        r#"^\s*db\.(?:getCollection\(\s*["']([^"']+)["']\s*\)|([A-Za-z_$][\w$]*))\.aggregate\s*\("#
    )
    .expect("valid regex");
    static ref TAIL_RE: Regex = Regex::new(r"^\s*(\.pretty\(\s*\))?\s*;?\s*$").expect("valid regex");
    static ref IDENT_RE: Regex = Regex::new(r"^[A-Za-z_$][\w$]*$").expect("valid regex");
}

/// Shell expression for a collection: `db.vendas`, or
/// `db.getCollection("vendas-2023")` when the name is not an identifier
pub fn collection_accessor(collection: &str) -> String {
    if IDENT_RE.is_match(collection) {
        format!("db.{}", collection)
    } else {
        format!("db.getCollection({})", Value::from(collection))
    }
}

fn script_error(message: impl Into<String>) -> VendasError {
    VendasError::ScriptError(message.into())
}

/// A parsed `db.<collection>.aggregate([...])` call
#[derive(Debug, Clone, PartialEq)]
pub struct QueryScript {
    name: Option<String>,
    collection: String,
    pipeline: Pipeline,
    pretty: bool,
}

impl QueryScript {
    /// Parse script text
    pub fn parse(source: &str) -> Result<Self> {
        let name = source
            .lines()
            .find(|line| !line.trim().is_empty())
            .and_then(|line| NAME_RE.captures(line))
            .map(|caps| caps[1].to_string());

        let code = strip_comments(source)?;

        let call = CALL_RE
            .captures(&code)
            .ok_or_else(|| script_error("expected db.<collection>.aggregate(...)"))?;
        let collection = call
            .get(1)
            .or_else(|| call.get(2))
            .map(|m| m.as_str().to_string())
            .ok_or_else(|| script_error("missing collection name"))?;

        // CALL_RE ends right after the opening parenthesis
        let open = call.get(0).map_or(0, |m| m.end()) - 1;
        let close = matching_paren(&code, open)?;

        let tail = &code[close + 1..];
        let tail_caps = TAIL_RE.captures(tail).ok_or_else(|| {
            script_error(format!("unexpected input after aggregate(): {}", tail.trim()))
        })?;
        let pretty = tail_caps.get(1).is_some();

        let args = format!("[{}]", relaxed_to_json(&code[open + 1..close])?);
        let mut args: Vec<Value> = serde_json::from_str(&args)
            .map_err(|e| script_error(format!("invalid aggregate arguments: {}", e)))?;

        if args.len() > 2 {
            return Err(script_error("aggregate() takes a pipeline and optional options"));
        }
        if args.len() == 2 {
            warn!(options = %args[1], "aggregate options are ignored");
        }
        if args.is_empty() {
            return Err(script_error("aggregate() needs a pipeline"));
        }

        let pipeline = Pipeline::from_json(&args.swap_remove(0))?;

        Ok(QueryScript {
            name,
            collection,
            pipeline,
            pretty,
        })
    }

    /// Load a `.js` query file; its name is the file stem
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let source = fs::read_to_string(path)?;
        let mut script = Self::parse(&source)?;
        if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
            script.name = Some(stem.to_string());
        }
        Ok(script)
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn collection(&self) -> &str {
        &self.collection
    }

    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    /// Whether the script asked for `.pretty()` output
    pub fn pretty(&self) -> bool {
        self.pretty
    }
}

/// Length in bytes of the string literal starting at `start` (quotes included)
fn string_literal_len(text: &str, start: usize) -> Result<usize> {
    let quote = text[start..]
        .chars()
        .next()
        .ok_or_else(|| script_error("unexpected end of script"))?;
    let mut escaped = false;
    for (offset, c) in text[start..].char_indices().skip(1) {
        match c {
            _ if escaped => escaped = false,
            '\\' => escaped = true,
            c if c == quote => return Ok(offset + c.len_utf8()),
            '\n' => break,
            _ => {}
        }
    }
    Err(script_error("unterminated string literal"))
}

/// Remove `//` and `/* */` comments outside string literals
fn strip_comments(source: &str) -> Result<String> {
    let mut out = String::with_capacity(source.len());
    let mut i = 0;

    while i < source.len() {
        let rest = &source[i..];
        if rest.starts_with('"') || rest.starts_with('\'') {
            let len = string_literal_len(source, i)?;
            out.push_str(&source[i..i + len]);
            i += len;
        } else if rest.starts_with("//") {
            i += rest.find('\n').unwrap_or(rest.len());
        } else if rest.starts_with("/*") {
            let end = rest[2..]
                .find("*/")
                .ok_or_else(|| script_error("unterminated block comment"))?;
            out.push(' ');
            i += end + 4;
        } else {
            let c = rest.chars().next().unwrap_or_default();
            out.push(c);
            i += c.len_utf8();
        }
    }

    Ok(out)
}

/// Byte index of the `)` closing the `(` at `open`
fn matching_paren(code: &str, open: usize) -> Result<usize> {
    let mut stack: Vec<char> = Vec::new();
    let mut i = open;

    while i < code.len() {
        let c = code[i..].chars().next().unwrap_or_default();
        match c {
            '"' | '\'' => {
                i += string_literal_len(code, i)?;
                continue;
            }
            '(' => stack.push(')'),
            '[' => stack.push(']'),
            '{' => stack.push('}'),
            ')' | ']' | '}' => {
                if stack.pop() != Some(c) {
                    return Err(script_error(format!("unbalanced '{}'", c)));
                }
                if stack.is_empty() {
                    return Ok(i);
                }
            }
            _ => {}
        }
        i += c.len_utf8();
    }

    Err(script_error("aggregate( is never closed"))
}

/// Rewrite a console object literal as strict JSON
fn relaxed_to_json(text: &str) -> Result<String> {
    let mut out = String::with_capacity(text.len() + 16);
    let chars: Vec<(usize, char)> = text.char_indices().collect();
    let mut k = 0;

    let next_significant = |from: usize| {
        chars[from..]
            .iter()
            .map(|&(_, c)| c)
            .find(|c| !c.is_whitespace())
    };

    while k < chars.len() {
        let (pos, c) = chars[k];
        match c {
            '"' => {
                let len = string_literal_len(text, pos)?;
                out.push_str(&text[pos..pos + len]);
                k += text[pos..pos + len].chars().count();
            }
            '\'' => {
                let len = string_literal_len(text, pos)?;
                let inner = &text[pos + 1..pos + len - 1];
                out.push_str(&single_to_double_quoted(inner));
                k += text[pos..pos + len].chars().count();
            }
            ',' if matches!(next_significant(k + 1), Some('}') | Some(']')) => {
                k += 1;
            }
            c if c.is_ascii_digit() || c == '-' || c == '+' => {
                let start = k;
                while k < chars.len()
                    && matches!(chars[k].1, '0'..='9' | '.' | 'e' | 'E' | '-' | '+')
                {
                    k += 1;
                }
                let number: String = chars[start..k].iter().map(|&(_, c)| c).collect();
                out.push_str(number.trim_start_matches('+'));
            }
            c if c.is_alphabetic() || c == '_' || c == '$' => {
                let start = k;
                while k < chars.len()
                    && (chars[k].1.is_alphanumeric() || matches!(chars[k].1, '_' | '$'))
                {
                    k += 1;
                }
                let ident: String = chars[start..k].iter().map(|&(_, c)| c).collect();
                if next_significant(k) == Some(':') {
                    out.push_str(&Value::from(ident).to_string());
                } else if matches!(ident.as_str(), "true" | "false" | "null") {
                    out.push_str(&ident);
                } else {
                    return Err(script_error(format!("unsupported expression: {}", ident)));
                }
            }
            _ => {
                out.push(c);
                k += 1;
            }
        }
    }

    Ok(out)
}

fn single_to_double_quoted(inner: &str) -> String {
    let mut unescaped = String::with_capacity(inner.len());
    let mut chars = inner.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            match chars.next() {
                Some('\'') => unescaped.push('\''),
                Some(other) => {
                    unescaped.push('\\');
                    unescaped.push(other);
                }
                None => unescaped.push('\\'),
            }
        } else {
            unescaped.push(c);
        }
    }
    // Escapes other than \' are already valid JSON; only bare quotes need escaping
    let mut out = String::from("\"");
    let mut previous_backslash = false;
    for c in unescaped.chars() {
        if c == '"' && !previous_backslash {
            out.push('\\');
        }
        previous_backslash = c == '\\' && !previous_backslash;
        out.push(c);
    }
    out.push('"');
    out
}
