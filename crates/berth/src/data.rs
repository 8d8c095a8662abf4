//! Seed data sets.
//!
//! A data set is a `data.json` array of row objects plus an import schema
//! describing which columns to load and which of them form the conflict
//! key. The codec turns each row into one insert-or-upsert statement with
//! named parameters; the provider rewrites those to positional form at
//! execution time.
//!
//! Data sets participate in change detection like objects do: the raw data
//! file is hashed and compared against the persisted record under the
//! `data` type.

use crate::catalog::{DataSource, read_to_string};
use crate::error::Error;
use crate::hash::content_hash;
use crate::Result;
use bytes::BytesMut;
use camino::Utf8PathBuf;
use serde::Deserialize;
use tokio_postgres::types::{IsNull, ToSql, Type, to_sql_checked};

/// One column mapping of an import schema.
#[derive(Debug, Clone, Deserialize)]
pub struct ColumnMap {
    pub name: String,
    /// Part of the conflict key used for upserts.
    #[serde(default)]
    pub key: bool,
}

/// Import schema: which columns a data row provides and how rows are keyed.
#[derive(Debug, Clone, Deserialize)]
pub struct ImportSchema {
    pub columns: Vec<ColumnMap>,
}

impl ImportSchema {
    fn keys(&self) -> Vec<&str> {
        self.columns
            .iter()
            .filter(|c| c.key)
            .map(|c| c.name.as_str())
            .collect()
    }
}

/// A scalar bound to a statement parameter.
///
/// Data files are JSON, so values arrive untyped; this closed set covers
/// what a row object can hold. Arrays and nested objects bind as their JSON
/// text (the column is expected to be json/jsonb-castable).
#[derive(Debug, Clone, PartialEq)]
pub enum ScriptParam {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl From<&serde_json::Value> for ScriptParam {
    fn from(value: &serde_json::Value) -> Self {
        use serde_json::Value;
        match value {
            Value::Null => ScriptParam::Null,
            Value::Bool(b) => ScriptParam::Bool(*b),
            Value::Number(n) => match n.as_i64() {
                Some(i) => ScriptParam::Int(i),
                None => ScriptParam::Float(n.as_f64().unwrap_or(f64::NAN)),
            },
            Value::String(s) => ScriptParam::Text(s.clone()),
            other => ScriptParam::Text(other.to_string()),
        }
    }
}

impl ToSql for ScriptParam {
    fn to_sql(
        &self,
        ty: &Type,
        out: &mut BytesMut,
    ) -> std::result::Result<IsNull, Box<dyn std::error::Error + Sync + Send>> {
        match self {
            ScriptParam::Null => Ok(IsNull::Yes),
            ScriptParam::Bool(v) => v.to_sql(ty, out),
            ScriptParam::Int(v) => v.to_sql(ty, out),
            ScriptParam::Float(v) => v.to_sql(ty, out),
            ScriptParam::Text(v) => v.to_sql(ty, out),
        }
    }

    fn accepts(_ty: &Type) -> bool {
        // The actual value decides at bind time; a mismatch surfaces as a
        // statement error with full context.
        true
    }

    to_sql_checked!();
}

/// One executable statement with named parameters.
#[derive(Debug, Clone)]
pub struct Statement {
    pub sql: String,
    pub params: Vec<(String, ScriptParam)>,
}

/// One data set scheduled for loading.
#[derive(Debug, Clone)]
pub struct DataSet {
    pub schema: String,
    pub table: String,
    pub hash: String,
    data_path: Utf8PathBuf,
    import_schema_path: Utf8PathBuf,
}

impl DataSet {
    /// Read the raw data file and compute its change-detection hash.
    pub fn load(source: &DataSource) -> Result<Self> {
        let raw = read_to_string(&source.data_path)?;
        Ok(Self {
            schema: source.schema.clone(),
            table: source.table.clone(),
            hash: content_hash(&raw),
            data_path: source.data_path.clone(),
            import_schema_path: source.import_schema_path.clone(),
        })
    }

    pub fn fullname(&self) -> String {
        format!("{}.{}", self.schema, self.table)
    }

    /// Produce one insert-or-upsert statement per row.
    pub fn statements(&self) -> Result<Vec<Statement>> {
        let schema_text = read_to_string(&self.import_schema_path)?;
        let import: ImportSchema = serde_json::from_str(&schema_text)
            .map_err(|e| Error::json(self.import_schema_path.as_str(), e))?;

        let data_text = read_to_string(&self.data_path)?;
        let rows: Vec<serde_json::Map<String, serde_json::Value>> =
            serde_json::from_str(&data_text)
                .map_err(|e| Error::json(self.data_path.as_str(), e))?;

        let sql = self.row_sql(&import);
        Ok(rows
            .into_iter()
            .map(|row| {
                let params = import
                    .columns
                    .iter()
                    .map(|col| {
                        let value = row
                            .get(&col.name)
                            .map(ScriptParam::from)
                            .unwrap_or(ScriptParam::Null);
                        (col.name.clone(), value)
                    })
                    .collect();
                Statement {
                    sql: sql.clone(),
                    params,
                }
            })
            .collect())
    }

    fn row_sql(&self, import: &ImportSchema) -> String {
        let cols: Vec<&str> = import.columns.iter().map(|c| c.name.as_str()).collect();
        let placeholders: Vec<String> = cols.iter().map(|c| format!(":{c}")).collect();
        let keys = import.keys();
        let mut sql = format!(
            "insert into {} ({}) values ({})",
            self.fullname(),
            cols.join(", "),
            placeholders.join(", ")
        );
        if !keys.is_empty() {
            let updates: Vec<String> = cols
                .iter()
                .filter(|c| !keys.contains(c))
                .map(|c| format!("{c} = excluded.{c}"))
                .collect();
            if updates.is_empty() {
                sql.push_str(&format!(" on conflict ({}) do nothing", keys.join(", ")));
            } else {
                sql.push_str(&format!(
                    " on conflict ({}) do update set {}",
                    keys.join(", "),
                    updates.join(", ")
                ));
            }
        }
        sql.push(';');
        sql
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn fixture(dir: &std::path::Path) -> DataSource {
        let table_dir = dir.join("app/dat/currency");
        fs::create_dir_all(&table_dir).unwrap();
        fs::write(
            table_dir.join("import.json"),
            r#"{"columns": [{"name": "code", "key": true}, {"name": "caption"}, {"name": "rate"}]}"#,
        )
        .unwrap();
        fs::write(
            table_dir.join("data.json"),
            r#"[
                {"code": "USD", "caption": "US dollar", "rate": 1.0},
                {"code": "EUR", "caption": "Euro", "rate": null}
            ]"#,
        )
        .unwrap();
        DataSource {
            schema: "app".into(),
            table: "currency".into(),
            data_path: Utf8PathBuf::try_from(table_dir.join("data.json")).unwrap(),
            import_schema_path: Utf8PathBuf::try_from(table_dir.join("import.json")).unwrap(),
            export_schema_path: Utf8PathBuf::try_from(table_dir.join("export.json")).unwrap(),
        }
    }

    #[test]
    fn statements_are_keyed_upserts() {
        let dir = tempfile::tempdir().unwrap();
        let set = DataSet::load(&fixture(dir.path())).unwrap();
        let statements = set.statements().unwrap();

        assert_eq!(statements.len(), 2);
        assert_eq!(
            statements[0].sql,
            "insert into app.currency (code, caption, rate) values (:code, :caption, :rate) \
             on conflict (code) do update set caption = excluded.caption, rate = excluded.rate;"
        );
        assert_eq!(
            statements[0].params,
            vec![
                ("code".to_string(), ScriptParam::Text("USD".into())),
                ("caption".to_string(), ScriptParam::Text("US dollar".into())),
                ("rate".to_string(), ScriptParam::Float(1.0)),
            ]
        );
        assert_eq!(statements[1].params[2].1, ScriptParam::Null);
    }

    #[test]
    fn data_hash_tracks_content() {
        let dir = tempfile::tempdir().unwrap();
        let source = fixture(dir.path());
        let before = DataSet::load(&source).unwrap().hash;
        fs::write(&source.data_path, "[]").unwrap();
        let after = DataSet::load(&source).unwrap().hash;
        assert_ne!(before, after);
    }
}
