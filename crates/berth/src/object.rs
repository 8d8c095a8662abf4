//! Database object identities, source files and live snapshots.

use crate::hash::content_hash;
use berth_schema::{SequenceSpec, TableSpec};
use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};
use std::fmt;

/// The closed set of object kinds berth manages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ObjectKind {
    Table,
    Sequence,
    Function,
    View,
    Trigger,
}

impl ObjectKind {
    /// Source-tree directory name / persisted `obj_type` value.
    pub fn as_str(&self) -> &'static str {
        match self {
            ObjectKind::Table => "table",
            ObjectKind::Sequence => "sequence",
            ObjectKind::Function => "function",
            ObjectKind::View => "view",
            ObjectKind::Trigger => "trigger",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "table" => Some(ObjectKind::Table),
            "sequence" => Some(ObjectKind::Sequence),
            "function" => Some(ObjectKind::Function),
            "view" => Some(ObjectKind::View),
            "trigger" => Some(ObjectKind::Trigger),
            _ => None,
        }
    }
}

impl fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity of one database object within a run: (kind, schema.name).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectRef {
    #[serde(rename = "type")]
    pub kind: ObjectKind,
    pub schema: String,
    pub name: String,
}

impl ObjectRef {
    pub fn new(kind: ObjectKind, schema: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            kind,
            schema: schema.into(),
            name: name.into(),
        }
    }

    pub fn fullname(&self) -> String {
        format!("{}.{}", self.schema, self.name)
    }
}

impl fmt::Display for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}.{}", self.kind, self.schema, self.name)
    }
}

/// One object definition file from the source tree.
#[derive(Debug, Clone)]
pub struct SourceObject {
    pub reference: ObjectRef,
    pub path: Utf8PathBuf,
    pub text: String,
    pub hash: String,
}

impl SourceObject {
    pub fn new(reference: ObjectRef, path: Utf8PathBuf, text: String) -> Self {
        let hash = content_hash(&text);
        Self {
            reference,
            path,
            text,
            hash,
        }
    }
}

/// Live definition of an object as returned by the `berth_objsrc` support
/// routine, tagged by kind.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum DbSnapshot {
    Table { spec: TableSpec },
    Sequence { spec: SequenceSpec },
    Function { src: String, identity_arguments: String },
    View { src: String },
    Trigger { src: String },
}

impl DbSnapshot {
    /// Raw definition text, for kinds that have one.
    pub fn src(&self) -> Option<&str> {
        match self {
            DbSnapshot::Function { src, .. }
            | DbSnapshot::View { src }
            | DbSnapshot::Trigger { src } => Some(src),
            DbSnapshot::Table { .. } | DbSnapshot::Sequence { .. } => None,
        }
    }

    /// Normalized content hash of the canonical text of this snapshot.
    ///
    /// Tables and sequences hash their canonical JSON so that a database
    /// export and the file it produced hash identically.
    pub fn content_hash(&self) -> String {
        match self {
            DbSnapshot::Table { spec } => content_hash(&spec.canonical_json()),
            DbSnapshot::Sequence { spec } => content_hash(&spec.canonical_json()),
            DbSnapshot::Function { src, .. }
            | DbSnapshot::View { src }
            | DbSnapshot::Trigger { src } => content_hash(src),
        }
    }

    /// The script that drops the live object, for droppable kinds.
    pub fn drop_script(&self, reference: &ObjectRef) -> Option<String> {
        match self {
            DbSnapshot::Function {
                identity_arguments, ..
            } => Some(format!(
                "drop function if exists {}({});",
                reference.fullname(),
                identity_arguments
            )),
            DbSnapshot::View { .. } => {
                Some(format!("drop view if exists {};", reference.fullname()))
            }
            DbSnapshot::Trigger { src } => {
                let table = extract_trigger_table(src)?;
                Some(format!(
                    "drop trigger if exists {} on {};",
                    reference.name, table
                ))
            }
            DbSnapshot::Table { .. } | DbSnapshot::Sequence { .. } => None,
        }
    }
}

/// Extract the normalized parameter list from a `create function` source.
///
/// Takes the text between the first opening parenthesis and its matching
/// close, then strips string literals, nested parenthesized fragments and
/// `default` clauses, lowercases and collapses whitespace. The result is
/// comparable with `pg_get_function_identity_arguments` output normalized
/// the same way.
pub fn extract_function_identity(source: &str) -> String {
    let Some(inner) = matched_parens(source) else {
        return String::new();
    };
    let lower = inner.to_lowercase();
    let no_strings = strip_string_literals(&lower);
    let no_parens = strip_nested_parens(&no_strings);
    let no_defaults = strip_default_clauses(&no_parens);
    normalize_ws(&no_defaults)
}

/// Extract the normalized `returns` clause from a `create function` source.
///
/// `returns table(...)` keeps its column list; any other form yields the
/// single following token, lowercased.
pub fn extract_function_returns(source: &str) -> String {
    let lower = source.to_lowercase();
    let Some(pos) = find_keyword(&lower, "returns") else {
        return String::new();
    };
    let tail = lower[pos..].trim_start();
    if let Some(rest) = tail.strip_prefix("table") {
        let rest = rest.trim_start();
        if rest.starts_with('(') {
            if let Some(inner) = matched_parens(rest) {
                return format!("table({})", normalize_ws(&inner));
            }
        }
    }
    tail.split_whitespace().next().unwrap_or_default().to_string()
}

/// Extract the `schema.table` a trigger is attached to from its source.
pub fn extract_trigger_table(source: &str) -> Option<String> {
    let mut tokens = source.split_whitespace();
    while let Some(token) = tokens.next() {
        if token.eq_ignore_ascii_case("on") {
            return tokens.next().map(|t| t.trim_end_matches(';').to_string());
        }
    }
    None
}

/// Text between the first `(` and its matching `)`, quote-aware.
fn matched_parens(text: &str) -> Option<String> {
    let start = text.find('(')?;
    let mut depth = 0usize;
    let mut in_string = false;
    for (i, c) in text[start..].char_indices() {
        match c {
            '\'' => in_string = !in_string,
            '(' if !in_string => depth += 1,
            ')' if !in_string => {
                depth -= 1;
                if depth == 0 {
                    return Some(text[start + 1..start + i].to_string());
                }
            }
            _ => {}
        }
    }
    None
}

fn strip_string_literals(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut in_string = false;
    for c in text.chars() {
        if c == '\'' {
            in_string = !in_string;
        } else if !in_string {
            out.push(c);
        }
    }
    out
}

fn strip_nested_parens(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut depth = 0usize;
    for c in text.chars() {
        match c {
            '(' => depth += 1,
            ')' => depth = depth.saturating_sub(1),
            c if depth == 0 => out.push(c),
            _ => {}
        }
    }
    out
}

/// Drop `default <expr>` tails from each comma-separated argument.
/// Expects already-lowercased input.
fn strip_default_clauses(text: &str) -> String {
    text.split(',')
        .map(|arg| match find_keyword(arg, "default") {
            Some(after) => arg[..after - "default".len()].trim_end().to_string(),
            None => arg.to_string(),
        })
        .collect::<Vec<_>>()
        .join(",")
}

/// Position just past a whitespace-delimited keyword, or None.
fn find_keyword(lower: &str, keyword: &str) -> Option<usize> {
    let mut offset = 0;
    while let Some(pos) = lower[offset..].find(keyword) {
        let abs = offset + pos;
        let before_ok = abs == 0
            || lower[..abs]
                .chars()
                .next_back()
                .is_some_and(|c| c.is_whitespace());
        let after = abs + keyword.len();
        let after_ok = lower[after..]
            .chars()
            .next()
            .is_none_or(|c| c.is_whitespace() || c == '(');
        if before_ok && after_ok {
            return Some(after);
        }
        offset = after;
    }
    None
}

fn normalize_ws(text: &str) -> String {
    text.to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    const FUNC: &str = "create or replace function app.f_doc8add(p_caption text, \
         p_kind int8 default 1, p_note text default 'a, b') returns int8 as $$\n\
         begin return 1; end; $$ language plpgsql;";

    #[test]
    fn function_identity_strips_defaults_and_literals() {
        assert_eq!(
            extract_function_identity(FUNC),
            "p_caption text, p_kind int8, p_note text"
        );
    }

    #[test]
    fn function_returns_scalar_and_table_forms() {
        assert_eq!(extract_function_returns(FUNC), "int8");
        let table_fn = "create function app.f_list() returns table (id int8, caption text) as $$ select 1, 'x' $$ language sql;";
        assert_eq!(
            extract_function_returns(table_fn),
            "table(id int8, caption text)"
        );
    }

    #[test]
    fn trigger_table_extraction() {
        let trg = "create trigger tr4doc8check after insert or update on app.doc \
                   for each row execute procedure app.f_doc8tr_check();";
        assert_eq!(extract_trigger_table(trg).as_deref(), Some("app.doc"));
    }

    #[test]
    fn live_and_source_hashes_agree_when_converged() {
        // A view exported on another platform differs only in line endings;
        // it must still count as converged.
        let source = "create or replace view app.v_doc as\n select 1;\n";
        let snap = DbSnapshot::View {
            src: "create or replace view app.v_doc as\r\n select 1;".into(),
        };
        assert_eq!(snap.content_hash(), content_hash(source));
    }

    #[test]
    fn drop_scripts_per_kind() {
        let reference = ObjectRef::new(ObjectKind::Function, "app", "f_doc8add");
        let snap = DbSnapshot::Function {
            src: FUNC.to_string(),
            identity_arguments: "p_caption text, p_kind int8, p_tags text[]".to_string(),
        };
        assert_eq!(
            snap.drop_script(&reference).as_deref(),
            Some("drop function if exists app.f_doc8add(p_caption text, p_kind int8, p_tags text[]);")
        );

        let reference = ObjectRef::new(ObjectKind::Trigger, "app", "tr4doc8check");
        let snap = DbSnapshot::Trigger {
            src: "create trigger tr4doc8check before insert on app.doc for each row execute procedure app.f();".into(),
        };
        assert_eq!(
            snap.drop_script(&reference).as_deref(),
            Some("drop trigger if exists tr4doc8check on app.doc;")
        );
    }
}
