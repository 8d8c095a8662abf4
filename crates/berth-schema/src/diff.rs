//! Structural diffing for tables and sequences.
//!
//! Compares a source-tree representation against the live database
//! representation and produces the minimal scripts to converge the live
//! object, bucketed by execution phase:
//!
//! - `main` carries structure changes (create table, add/alter column,
//!   alter sequence),
//! - `safedrop` carries reversible drops (constraints, indexes) that later
//!   buckets recreate,
//! - `unsafedrop` carries destructive drops (columns) that the caller gates
//!   behind an explicit confirmation,
//! - `pkey` carries primary key and unique constraints,
//! - `end` carries foreign keys, checks, indexes and comments, which must
//!   run after every table body and primary key exists.
//!
//! Columns whose datatype changed are reported in
//! [`TableDiff::col_change_datatype`] so the engine can look up dependent
//! views scoped to those columns.

use crate::{ConstraintKind, ConstraintSpec, IndexSpec, ScriptSet, SequenceSpec, TableSpec};
use std::collections::HashSet;

/// Outcome of a table comparison.
#[derive(Debug, Clone, Default)]
pub struct TableDiff {
    pub scripts: ScriptSet,
    /// Names of columns whose datatype changed.
    pub col_change_datatype: Vec<String>,
}

/// Outcome of a sequence comparison.
#[derive(Debug, Clone, Default)]
pub struct SequenceDiff {
    pub scripts: ScriptSet,
}

/// Compare a source table against the live table, if any.
pub fn diff_table(source: &TableSpec, live: Option<&TableSpec>) -> TableDiff {
    let mut diff = TableDiff::default();
    let fullname = source.fullname();

    let Some(live) = live else {
        diff.scripts.main.push(source.create_sql());
        push_constraint_adds(&mut diff.scripts, &fullname, &source.cons);
        for idx in &source.indx {
            diff.scripts.end.push(idx.create_sql(&fullname));
        }
        push_comments(&mut diff.scripts, source, None);
        return diff;
    };

    diff_columns(&mut diff, &fullname, source, live);
    diff_constraints(&mut diff.scripts, &fullname, &source.cons, &live.cons);
    diff_indexes(&mut diff.scripts, source, live);
    push_comments(&mut diff.scripts, source, Some(live));
    diff
}

fn diff_columns(diff: &mut TableDiff, fullname: &str, source: &TableSpec, live: &TableSpec) {
    let live_names: HashSet<&str> = live.cols.iter().map(|c| c.name.as_str()).collect();
    let source_names: HashSet<&str> = source.cols.iter().map(|c| c.name.as_str()).collect();

    for col in source.ordered_columns() {
        if !live_names.contains(col.name.as_str()) {
            let mut def = format!(
                "alter table {} add column if not exists {} {}",
                fullname, col.name, col.datatype
            );
            if let Some(default) = &col.default {
                def.push_str(&format!(" default {default}"));
            }
            if col.required {
                def.push_str(" not null");
            }
            def.push(';');
            diff.scripts.main.push(def);
        }
    }

    for col in &live.cols {
        if !source_names.contains(col.name.as_str()) {
            diff.scripts
                .unsafedrop
                .push(format!("alter table {} drop column {};", fullname, col.name));
        }
    }

    for col in &source.cols {
        let Some(live_col) = live.cols.iter().find(|c| c.name == col.name) else {
            continue;
        };
        if col.datatype != live_col.datatype {
            diff.scripts.main.push(format!(
                "alter table {} alter column {} type {} using {}::{};",
                fullname, col.name, col.datatype, col.name, col.datatype
            ));
            diff.col_change_datatype.push(col.name.clone());
        }
        if col.required != live_col.required {
            let action = if col.required { "set" } else { "drop" };
            diff.scripts.main.push(format!(
                "alter table {} alter column {} {} not null;",
                fullname, col.name, action
            ));
        }
        if col.default != live_col.default {
            let stmt = match &col.default {
                Some(default) => format!(
                    "alter table {} alter column {} set default {};",
                    fullname, col.name, default
                ),
                None => format!(
                    "alter table {} alter column {} drop default;",
                    fullname, col.name
                ),
            };
            diff.scripts.main.push(stmt);
        }
    }
}

fn diff_constraints(
    scripts: &mut ScriptSet,
    fullname: &str,
    source: &[ConstraintSpec],
    live: &[ConstraintSpec],
) {
    let live_names: HashSet<&str> = live.iter().map(|c| c.name.as_str()).collect();
    let source_names: HashSet<&str> = source.iter().map(|c| c.name.as_str()).collect();

    let added: Vec<&ConstraintSpec> = source
        .iter()
        .filter(|c| !live_names.contains(c.name.as_str()))
        .collect();

    for con in live {
        if !source_names.contains(con.name.as_str()) {
            scripts.safedrop.push(drop_constraint_sql(fullname, &con.name));
        }
    }

    // Same name, different body: drop and recreate.
    let mut changed: Vec<&ConstraintSpec> = Vec::new();
    for con in source {
        let Some(live_con) = live.iter().find(|c| c.name == con.name) else {
            continue;
        };
        if con.compare_key() != live_con.compare_key() {
            scripts.safedrop.push(drop_constraint_sql(fullname, &con.name));
            changed.push(con);
        }
    }

    let recreate: Vec<ConstraintSpec> = added
        .into_iter()
        .chain(changed)
        .cloned()
        .collect();
    push_constraint_adds(scripts, fullname, &recreate);
}

fn push_constraint_adds(scripts: &mut ScriptSet, fullname: &str, cons: &[ConstraintSpec]) {
    for con in cons {
        let stmt = format!(
            "alter table {} add constraint {} {};",
            fullname,
            con.name,
            con.body()
        );
        match con.kind {
            ConstraintKind::PrimaryKey | ConstraintKind::Unique => scripts.pkey.push(stmt),
            ConstraintKind::ForeignKey | ConstraintKind::Check => scripts.end.push(stmt),
        }
    }
}

fn drop_constraint_sql(fullname: &str, name: &str) -> String {
    format!("alter table {fullname} drop constraint if exists {name};")
}

fn diff_indexes(scripts: &mut ScriptSet, source: &TableSpec, live: &TableSpec) {
    let fullname = source.fullname();
    let source_names: HashSet<&str> = source.indx.iter().map(|i| i.name.as_str()).collect();

    for idx in &source.indx {
        match live.indx.iter().find(|i| i.name == idx.name) {
            None => scripts.end.push(idx.create_sql(&fullname)),
            Some(live_idx) if live_idx.compare_key() != idx.compare_key() => {
                scripts.safedrop.push(drop_index_sql(&source.schema, idx));
                scripts.end.push(idx.create_sql(&fullname));
            }
            Some(_) => {}
        }
    }

    for idx in &live.indx {
        if !source_names.contains(idx.name.as_str()) {
            scripts.safedrop.push(drop_index_sql(&source.schema, idx));
        }
    }
}

fn drop_index_sql(schema: &str, idx: &IndexSpec) -> String {
    format!("drop index if exists {}.{};", schema, idx.name)
}

fn push_comments(scripts: &mut ScriptSet, source: &TableSpec, live: Option<&TableSpec>) {
    let fullname = source.fullname();
    let live_comment = live.and_then(|t| t.comment.as_deref());
    if let Some(comment) = source.comment.as_deref() {
        if Some(comment) != live_comment {
            scripts.end.push(format!(
                "comment on table {} is '{}';",
                fullname,
                escape_literal(comment)
            ));
        }
    }
    for col in &source.cols {
        let Some(comment) = col.comment.as_deref() else {
            continue;
        };
        let live_col_comment = live
            .and_then(|t| t.cols.iter().find(|c| c.name == col.name))
            .and_then(|c| c.comment.as_deref());
        if Some(comment) != live_col_comment {
            scripts.end.push(format!(
                "comment on column {}.{} is '{}';",
                fullname,
                col.name,
                escape_literal(comment)
            ));
        }
    }
}

fn escape_literal(text: &str) -> String {
    text.replace('\'', "''")
}

/// Compare a source sequence against the live sequence, if any.
pub fn diff_sequence(source: &SequenceSpec, live: Option<&SequenceSpec>) -> SequenceDiff {
    let mut diff = SequenceDiff::default();

    let Some(live) = live else {
        diff.scripts.main.push(source.create_sql());
        return diff;
    };

    let mut opts = String::new();
    if source.increment != live.increment {
        if let Some(v) = source.increment {
            opts.push_str(&format!(" increment by {v}"));
        }
    }
    if source.min_value != live.min_value {
        match source.min_value {
            Some(v) => opts.push_str(&format!(" minvalue {v}")),
            None => opts.push_str(" no minvalue"),
        }
    }
    if source.max_value != live.max_value {
        match source.max_value {
            Some(v) => opts.push_str(&format!(" maxvalue {v}")),
            None => opts.push_str(" no maxvalue"),
        }
    }
    if source.cache != live.cache {
        if let Some(v) = source.cache {
            opts.push_str(&format!(" cache {v}"));
        }
    }
    if source.cycle != live.cycle {
        opts.push_str(if source.cycle { " cycle" } else { " no cycle" });
    }

    if !opts.is_empty() {
        diff.scripts
            .main
            .push(format!("alter sequence {}{};", source.fullname(), opts));
    }
    diff
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ColumnSpec;

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

    fn table(name: &str, cols: Vec<ColumnSpec>) -> TableSpec {
        TableSpec {
            schema: "app".into(),
            name: name.into(),
            comment: None,
            cols,
            cons: vec![],
            indx: vec![],
        }
    }

    #[test]
    fn identical_tables_diff_empty() {
        let t = table("customer", vec![col("id", "int8", true, 1)]);
        let diff = diff_table(&t, Some(&t.clone()));
        assert!(diff.scripts.is_empty());
        assert!(diff.col_change_datatype.is_empty());
    }

    #[test]
    fn missing_table_yields_full_create() {
        let mut t = table("customer", vec![col("id", "int8", true, 1)]);
        t.cons.push(ConstraintSpec {
            name: "pk4customer".into(),
            kind: ConstraintKind::PrimaryKey,
            columns: vec!["id".into()],
            definition: None,
        });
        let diff = diff_table(&t, None);
        assert_eq!(diff.scripts.main.len(), 1);
        assert!(diff.scripts.main[0].starts_with("create table if not exists app.customer"));
        assert_eq!(
            diff.scripts.pkey,
            vec!["alter table app.customer add constraint pk4customer primary key (id);"]
        );
    }

    #[test]
    fn added_column_lands_in_main() {
        let source = table(
            "customer",
            vec![col("id", "int8", true, 1), col("caption", "text", false, 2)],
        );
        let live = table("customer", vec![col("id", "int8", true, 1)]);
        let diff = diff_table(&source, Some(&live));
        assert_eq!(
            diff.scripts.main,
            vec!["alter table app.customer add column if not exists caption text;"]
        );
    }

    #[test]
    fn dropped_column_is_unsafe() {
        let source = table("customer", vec![col("id", "int8", true, 1)]);
        let live = table(
            "customer",
            vec![col("id", "int8", true, 1), col("legacy", "text", false, 2)],
        );
        let diff = diff_table(&source, Some(&live));
        assert!(diff.scripts.main.is_empty());
        assert_eq!(
            diff.scripts.unsafedrop,
            vec!["alter table app.customer drop column legacy;"]
        );
    }

    #[test]
    fn datatype_change_is_reported_for_dependent_lookup() {
        let source = table("customer", vec![col("amount", "numeric", true, 1)]);
        let live = table("customer", vec![col("amount", "int8", true, 1)]);
        let diff = diff_table(&source, Some(&live));
        assert_eq!(
            diff.scripts.main,
            vec!["alter table app.customer alter column amount type numeric using amount::numeric;"]
        );
        assert_eq!(diff.col_change_datatype, vec!["amount"]);
    }

    #[test]
    fn changed_constraint_is_dropped_then_recreated() {
        let mut source = table("customer", vec![col("id", "int8", true, 1)]);
        source.cons.push(ConstraintSpec {
            name: "ck4customer".into(),
            kind: ConstraintKind::Check,
            columns: vec![],
            definition: Some("check (id > 0)".into()),
        });
        let mut live = source.clone();
        live.cons[0].definition = Some("check (id >= 0)".into());
        let diff = diff_table(&source, Some(&live));
        assert_eq!(
            diff.scripts.safedrop,
            vec!["alter table app.customer drop constraint if exists ck4customer;"]
        );
        assert_eq!(
            diff.scripts.end,
            vec!["alter table app.customer add constraint ck4customer check (id > 0);"]
        );
    }

    #[test]
    fn index_rename_is_ignored_but_shape_change_is_not() {
        let mut source = table("customer", vec![col("org_id", "int8", true, 1)]);
        source.indx.push(IndexSpec {
            name: "i4customer8org".into(),
            columns: vec!["org_id".into()],
            unique: false,
            where_clause: None,
        });
        let mut live = source.clone();
        live.indx[0].unique = true;
        let diff = diff_table(&source, Some(&live));
        assert_eq!(
            diff.scripts.safedrop,
            vec!["drop index if exists app.i4customer8org;"]
        );
        assert_eq!(
            diff.scripts.end,
            vec!["create index if not exists i4customer8org on app.customer (org_id);"]
        );
    }

    #[test]
    fn sequence_alter_only_emits_changed_options() {
        let source = SequenceSpec {
            schema: "app".into(),
            name: "s_doc".into(),
            start: Some(1),
            increment: Some(1),
            min_value: None,
            max_value: None,
            cache: Some(50),
            cycle: false,
        };
        let mut live = source.clone();
        live.cache = Some(1);
        let diff = diff_sequence(&source, Some(&live));
        assert_eq!(diff.scripts.main, vec!["alter sequence app.s_doc cache 50;"]);
        assert!(diff_sequence(&source, Some(&source.clone())).scripts.is_empty());
    }
}
