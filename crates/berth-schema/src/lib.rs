//! Structural schema representations for berth.
//!
//! This crate contains the types shared between the berth engine and the
//! structural differ: the JSON shape in which table and sequence definitions
//! are stored in the source tree (and returned by the live-definition fetch
//! routine), and the fixed phase-bucketed [`ScriptSet`] every diff produces.
//!
//! ## Canonical form
//!
//! Table and sequence sources are JSON documents. Two representations of the
//! same object must hash identically, so both sides are compared through
//! [`TableSpec::canonical_json`] / [`SequenceSpec::canonical_json`]: columns,
//! constraints and indexes sorted by name, four-space indented JSON. Files
//! exported from a database are written in canonical form already.

mod diff;

pub use diff::{SequenceDiff, TableDiff, diff_sequence, diff_table};

use serde::{Deserialize, Serialize};
use std::fmt;

/// A fixed record of script sequences, one per execution phase.
///
/// Every bucket is an ordered list of SQL statements and defaults to empty;
/// consumers never have to test for presence, only for emptiness.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScriptSet {
    /// Structure changes: create table, add/alter column, alter sequence.
    pub main: Vec<String>,
    /// Reversible drops (constraints, indexes, views, functions, triggers).
    pub safedrop: Vec<String>,
    /// Destructive drops (columns, tables); gated behind confirmation.
    pub unsafedrop: Vec<String>,
    /// Primary key and unique constraint creation.
    pub pkey: Vec<String>,
    /// Trailing statements: foreign keys, checks, indexes, comments.
    pub end: Vec<String>,
    /// Function (re)creation.
    pub func: Vec<String>,
    /// Trigger (re)creation.
    pub trig: Vec<String>,
    /// View (re)creation.
    pub view: Vec<String>,
}

impl ScriptSet {
    /// Returns true if every bucket is empty.
    pub fn is_empty(&self) -> bool {
        self.main.is_empty()
            && self.safedrop.is_empty()
            && self.unsafedrop.is_empty()
            && self.pkey.is_empty()
            && self.end.is_empty()
            && self.func.is_empty()
            && self.trig.is_empty()
            && self.view.is_empty()
    }

    /// Total number of statements across all buckets.
    pub fn len(&self) -> usize {
        self.main.len()
            + self.safedrop.len()
            + self.unsafedrop.len()
            + self.pkey.len()
            + self.end.len()
            + self.func.len()
            + self.trig.len()
            + self.view.len()
    }
}

/// Constraint classification, stored with the single-letter tags the
/// Postgres catalog uses (`pg_constraint.contype`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConstraintKind {
    #[serde(rename = "p")]
    PrimaryKey,
    #[serde(rename = "u")]
    Unique,
    #[serde(rename = "f")]
    ForeignKey,
    #[serde(rename = "c")]
    Check,
}

/// One column of a table representation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnSpec {
    pub name: String,
    pub datatype: String,
    /// NOT NULL.
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub default: Option<String>,
    #[serde(default)]
    pub comment: Option<String>,
    /// Declaration order in the original definition. Files store columns
    /// sorted by name; creation follows this ordinal instead.
    #[serde(default)]
    pub column_id: Option<i32>,
}

/// One table constraint.
///
/// `definition` holds the body after `constraint <name>` exactly as
/// `pg_get_constraintdef` renders it; when present it wins over the
/// reconstructed form, so foreign keys and checks round-trip verbatim.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConstraintSpec {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: ConstraintKind,
    #[serde(default)]
    pub columns: Vec<String>,
    #[serde(default)]
    pub definition: Option<String>,
}

impl ConstraintSpec {
    /// The body after `constraint <name>`, reconstructed when no verbatim
    /// definition is stored.
    pub fn body(&self) -> String {
        if let Some(def) = &self.definition {
            return def.clone();
        }
        match self.kind {
            ConstraintKind::PrimaryKey => format!("primary key ({})", self.columns.join(", ")),
            ConstraintKind::Unique => format!("unique ({})", self.columns.join(", ")),
            // Foreign keys and checks cannot be reconstructed from columns
            // alone; a missing definition yields an invalid statement that
            // fails loudly at execution rather than silently diverging.
            ConstraintKind::ForeignKey => format!("foreign key ({})", self.columns.join(", ")),
            ConstraintKind::Check => "check ()".to_string(),
        }
    }

    /// Comparison key. Key constraints compare by their column set so a
    /// stored verbatim definition and a reconstructed one agree; the rest
    /// compare by whitespace-normalized definition.
    fn compare_key(&self) -> String {
        match self.kind {
            ConstraintKind::PrimaryKey | ConstraintKind::Unique => {
                let mut cols = self.columns.clone();
                cols.sort();
                format!("{:?}:{}", self.kind, cols.join(","))
            }
            ConstraintKind::ForeignKey | ConstraintKind::Check => match &self.definition {
                Some(def) => format!("{:?}:{}", self.kind, normalize_sql(def)),
                None => {
                    let mut cols = self.columns.clone();
                    cols.sort();
                    format!("{:?}:{}", self.kind, cols.join(","))
                }
            },
        }
    }
}

/// One index on a table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexSpec {
    pub name: String,
    #[serde(default)]
    pub columns: Vec<String>,
    #[serde(default)]
    pub unique: bool,
    /// Partial index predicate, without the `where` keyword.
    #[serde(default, rename = "where")]
    pub where_clause: Option<String>,
}

impl IndexSpec {
    /// `create index` statement for this index on the given table.
    pub fn create_sql(&self, table_fullname: &str) -> String {
        let unique = if self.unique { "unique " } else { "" };
        let where_clause = self
            .where_clause
            .as_ref()
            .map(|w| format!(" where {w}"))
            .unwrap_or_default();
        format!(
            "create {}index if not exists {} on {} ({}){};",
            unique,
            self.name,
            table_fullname,
            self.columns.join(", "),
            where_clause
        )
    }

    /// Comparison key, name-insensitive: an index is the same index if it
    /// covers the same columns with the same uniqueness and predicate.
    fn compare_key(&self) -> String {
        let mut cols = self.columns.clone();
        cols.sort();
        format!(
            "{}:{}:{}",
            if self.unique { "u" } else { "" },
            cols.join(","),
            self.where_clause.as_deref().map(normalize_sql).unwrap_or_default()
        )
    }
}

/// Structural representation of a table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableSpec {
    pub schema: String,
    pub name: String,
    #[serde(default)]
    pub comment: Option<String>,
    #[serde(default)]
    pub cols: Vec<ColumnSpec>,
    #[serde(default)]
    pub cons: Vec<ConstraintSpec>,
    #[serde(default)]
    pub indx: Vec<IndexSpec>,
}

impl TableSpec {
    pub fn fullname(&self) -> String {
        format!("{}.{}", self.schema, self.name)
    }

    /// Columns in declaration order (`column_id` ascending), falling back to
    /// stored order where the ordinal is absent.
    pub fn ordered_columns(&self) -> Vec<&ColumnSpec> {
        let mut cols: Vec<&ColumnSpec> = self.cols.iter().collect();
        cols.sort_by_key(|c| c.column_id.unwrap_or(i32::MAX));
        cols
    }

    /// `create table` statement without constraints or indexes; those land
    /// in later phases so that cross-table ordering works out.
    pub fn create_sql(&self) -> String {
        let parts: Vec<String> = self
            .ordered_columns()
            .iter()
            .map(|col| {
                let mut def = format!("    {} {}", col.name, col.datatype);
                if col.required {
                    def.push_str(" not null");
                }
                if let Some(default) = &col.default {
                    def.push_str(&format!(" default {default}"));
                }
                def
            })
            .collect();
        format!(
            "create table if not exists {} (\n{}\n);",
            self.fullname(),
            parts.join(",\n")
        )
    }

    /// Canonical JSON used for content hashing: members sorted by name,
    /// four-space indentation.
    pub fn canonical_json(&self) -> String {
        let mut spec = self.clone();
        spec.cols.sort_by(|a, b| a.name.cmp(&b.name));
        spec.cons.sort_by(|a, b| a.name.cmp(&b.name));
        spec.indx.sort_by(|a, b| a.name.cmp(&b.name));
        pretty_json(&spec)
    }
}

impl fmt::Display for TableSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "table {}", self.fullname())
    }
}

/// Structural representation of a sequence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SequenceSpec {
    #[serde(default)]
    pub schema: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub start: Option<i64>,
    #[serde(default)]
    pub increment: Option<i64>,
    #[serde(default)]
    pub min_value: Option<i64>,
    #[serde(default)]
    pub max_value: Option<i64>,
    #[serde(default)]
    pub cache: Option<i64>,
    #[serde(default)]
    pub cycle: bool,
}

impl SequenceSpec {
    pub fn fullname(&self) -> String {
        format!("{}.{}", self.schema, self.name)
    }

    fn options_sql(&self) -> String {
        let mut opts = String::new();
        if let Some(v) = self.increment {
            opts.push_str(&format!(" increment by {v}"));
        }
        if let Some(v) = self.min_value {
            opts.push_str(&format!(" minvalue {v}"));
        }
        if let Some(v) = self.max_value {
            opts.push_str(&format!(" maxvalue {v}"));
        }
        if let Some(v) = self.start {
            opts.push_str(&format!(" start with {v}"));
        }
        if let Some(v) = self.cache {
            opts.push_str(&format!(" cache {v}"));
        }
        if self.cycle {
            opts.push_str(" cycle");
        }
        opts
    }

    pub fn create_sql(&self) -> String {
        format!(
            "create sequence if not exists {}{};",
            self.fullname(),
            self.options_sql()
        )
    }

    /// Canonical JSON used for content hashing.
    pub fn canonical_json(&self) -> String {
        pretty_json(self)
    }
}

impl fmt::Display for SequenceSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sequence {}", self.fullname())
    }
}

fn pretty_json<T: Serialize>(value: &T) -> String {
    let mut out = Vec::new();
    let fmt = serde_json::ser::PrettyFormatter::with_indent(b"    ");
    let mut ser = serde_json::Serializer::with_formatter(&mut out, fmt);
    value
        .serialize(&mut ser)
        .expect("structural specs serialize infallibly");
    String::from_utf8(out).expect("serde_json emits utf-8")
}

/// Whitespace-insensitive comparison form for SQL fragments.
fn normalize_sql(sql: &str) -> String {
    sql.split_whitespace().collect::<Vec<_>>().join(" ").to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn col(name: &str, datatype: &str, required: bool, id: i32) -> ColumnSpec {
        ColumnSpec {
            name: name.to_string(),
            datatype: datatype.to_string(),
            required,
            default: None,
            comment: None,
            column_id: Some(id),
        }
    }

    #[test]
    fn create_table_follows_declaration_order() {
        let table = TableSpec {
            schema: "app".into(),
            name: "customer".into(),
            comment: None,
            // Stored sorted by name, declared id-first.
            cols: vec![col("caption", "text", true, 2), col("id", "int8", true, 1)],
            cons: vec![],
            indx: vec![],
        };
        let sql = table.create_sql();
        assert_eq!(
            sql,
            "create table if not exists app.customer (\n    id int8 not null,\n    caption text not null\n);"
        );
    }

    #[test]
    fn canonical_json_sorts_members() {
        let a = TableSpec {
            schema: "app".into(),
            name: "t".into(),
            comment: None,
            cols: vec![col("b", "text", false, 2), col("a", "int8", false, 1)],
            cons: vec![],
            indx: vec![],
        };
        let mut b = a.clone();
        b.cols.reverse();
        assert_eq!(a.canonical_json(), b.canonical_json());
        assert!(a.canonical_json().contains("\"name\": \"a\""));
    }

    #[test]
    fn sequence_create_sql_renders_options() {
        let seq = SequenceSpec {
            schema: "app".into(),
            name: "s_customer".into(),
            start: Some(1000),
            increment: Some(1),
            min_value: None,
            max_value: None,
            cache: Some(20),
            cycle: false,
        };
        assert_eq!(
            seq.create_sql(),
            "create sequence if not exists app.s_customer increment by 1 start with 1000 cache 20;"
        );
    }

    #[test]
    fn constraint_body_prefers_verbatim_definition() {
        let con = ConstraintSpec {
            name: "fk4doc8org".into(),
            kind: ConstraintKind::ForeignKey,
            columns: vec!["org_id".into()],
            definition: Some("foreign key (org_id) references app.org(id)".into()),
        };
        assert_eq!(con.body(), "foreign key (org_id) references app.org(id)");
        let pk = ConstraintSpec {
            name: "pk4doc".into(),
            kind: ConstraintKind::PrimaryKey,
            columns: vec!["id".into()],
            definition: None,
        };
        assert_eq!(pk.body(), "primary key (id)");
    }
}
