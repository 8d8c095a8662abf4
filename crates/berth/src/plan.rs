//! Phase layout and per-phase script assembly.
//!
//! The execution order is fixed; migration-block hooks interleave between
//! the object phases. Scripts within most phases keep working-set order;
//! `safedrop` is emitted in topological order (the most dependent object
//! drops first) and `view` in the reverse of that same order, so base views
//! exist again before the views built on top of them. That asymmetry is
//! pinned by a regression test below.

use crate::diff::WorkObject;
use crate::topo;
use crate::Result;
use std::fmt;

/// One named stage of the fixed execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    EnsureSchemas,
    BeforeRunHooks,
    SafeDrop,
    AfterSafeDropHooks,
    Main,
    UnsafeDrop,
    AfterMainHooks,
    Func,
    AfterFuncHooks,
    Trig,
    AfterTrigHooks,
    View,
    AfterViewHooks,
    Pkey,
    AfterPkeyHooks,
    DataLoad,
    AfterDataHooks,
    End,
    AfterEndHooks,
    AfterRunHooks,
    CatchAllHooks,
}

impl Phase {
    /// Label used in progress logs and execution-error context.
    pub fn label(&self) -> &'static str {
        match self {
            Phase::EnsureSchemas => "ensure-schemas",
            Phase::BeforeRunHooks => "hooks:run/before",
            Phase::SafeDrop => "safedrop",
            Phase::AfterSafeDropHooks => "hooks:safedrop/after",
            Phase::Main => "main",
            Phase::UnsafeDrop => "unsafedrop",
            Phase::AfterMainHooks => "hooks:main/after",
            Phase::Func => "func",
            Phase::AfterFuncHooks => "hooks:func/after",
            Phase::Trig => "trig",
            Phase::AfterTrigHooks => "hooks:trig/after",
            Phase::View => "view",
            Phase::AfterViewHooks => "hooks:view/after",
            Phase::Pkey => "pkey",
            Phase::AfterPkeyHooks => "hooks:pkey/after",
            Phase::DataLoad => "data-load",
            Phase::AfterDataHooks => "hooks:dats/after",
            Phase::End => "end",
            Phase::AfterEndHooks => "hooks:end/after",
            Phase::AfterRunHooks => "hooks:run/after",
            Phase::CatchAllHooks => "hooks:catch-all",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Scripts of the whole working set, grouped per phase and ordered.
#[derive(Debug, Default)]
pub struct PhasedScripts {
    pub safedrop: Vec<String>,
    pub main: Vec<String>,
    pub unsafedrop: Vec<String>,
    pub func: Vec<String>,
    pub trig: Vec<String>,
    pub view: Vec<String>,
    pub pkey: Vec<String>,
    pub end: Vec<String>,
}

impl PhasedScripts {
    /// Gather every object's scripts into phase order.
    pub fn collect(objects: &[WorkObject]) -> Result<Self> {
        let mut scripts = PhasedScripts::default();

        for object in objects {
            let diff = object.diff()?;
            scripts.main.extend(diff.scripts.main.iter().cloned());
            scripts
                .unsafedrop
                .extend(diff.scripts.unsafedrop.iter().cloned());
            scripts.func.extend(diff.scripts.func.iter().cloned());
            scripts.trig.extend(diff.scripts.trig.iter().cloned());
            scripts.pkey.extend(diff.scripts.pkey.iter().cloned());
            scripts.end.extend(diff.scripts.end.iter().cloned());
        }

        // Dependency edges: an object points at the dependents that must be
        // dropped around it.
        let droppable: Vec<&WorkObject> = objects
            .iter()
            .filter(|o| {
                o.diff()
                    .map(|d| !d.scripts.safedrop.is_empty())
                    .unwrap_or(false)
            })
            .collect();
        for &index in &ordered_indexes(&droppable)? {
            scripts
                .safedrop
                .extend(droppable[index].diff()?.scripts.safedrop.iter().cloned());
        }

        let creatable: Vec<&WorkObject> = objects
            .iter()
            .filter(|o| {
                o.diff()
                    .map(|d| !d.scripts.view.is_empty())
                    .unwrap_or(false)
            })
            .collect();
        for &index in ordered_indexes(&creatable)?.iter().rev() {
            scripts
                .view
                .extend(creatable[index].diff()?.scripts.view.iter().cloned());
        }

        Ok(scripts)
    }
}

fn ordered_indexes(objects: &[&WorkObject]) -> Result<Vec<usize>> {
    let nodes: Vec<_> = objects
        .iter()
        .map(|o| {
            Ok((
                o.reference.clone(),
                o.diff()?.needdrop.clone(),
            ))
        })
        .collect::<Result<_>>()?;
    topo::sort_dependent(&nodes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diff::ObjectDiff;
    use crate::object::{ObjectKind, ObjectRef};
    use berth_schema::ScriptSet;

    fn view_object(name: &str, dependents: &[&str]) -> WorkObject {
        let diff = ObjectDiff {
            scripts: ScriptSet {
                safedrop: vec![format!("drop view if exists app.{name};")],
                view: vec![format!("create view app.{name} as ...;")],
                ..Default::default()
            },
            needdrop: dependents
                .iter()
                .map(|d| ObjectRef::new(ObjectKind::View, "app", *d))
                .collect(),
        };
        WorkObject::preset(ObjectRef::new(ObjectKind::View, "app", name), diff)
    }

    /// Pins the observed asymmetry: safedrop runs base-first, view
    /// recreation runs in the exact reverse of that order.
    #[test]
    fn safedrop_forward_view_reverse() {
        // v_base ← v_mid ← v_top (each depended on by the next).
        let objects = vec![
            view_object("v_top", &[]),
            view_object("v_base", &["v_mid"]),
            view_object("v_mid", &["v_top"]),
        ];
        let scripts = PhasedScripts::collect(&objects).unwrap();

        assert_eq!(
            scripts.safedrop,
            vec![
                "drop view if exists app.v_top;",
                "drop view if exists app.v_mid;",
                "drop view if exists app.v_base;",
            ]
        );
        assert_eq!(
            scripts.view,
            vec![
                "create view app.v_base as ...;",
                "create view app.v_mid as ...;",
                "create view app.v_top as ...;",
            ]
        );
    }

    #[test]
    fn flat_buckets_keep_working_set_order() {
        let first = WorkObject::preset(
            ObjectRef::new(ObjectKind::Table, "app", "doc"),
            ObjectDiff {
                scripts: ScriptSet {
                    main: vec!["alter table app.doc add column x int8;".into()],
                    pkey: vec!["alter table app.doc add constraint pk primary key (id);".into()],
                    ..Default::default()
                },
                needdrop: vec![],
            },
        );
        let second = WorkObject::preset(
            ObjectRef::new(ObjectKind::Function, "app", "f_doc"),
            ObjectDiff {
                scripts: ScriptSet {
                    func: vec!["create or replace function app.f_doc() ...;".into()],
                    ..Default::default()
                },
                needdrop: vec![],
            },
        );
        let scripts = PhasedScripts::collect(&[first, second]).unwrap();
        assert_eq!(scripts.main.len(), 1);
        assert_eq!(scripts.pkey.len(), 1);
        assert_eq!(scripts.func.len(), 1);
        assert!(scripts.safedrop.is_empty());
        assert!(scripts.view.is_empty());
    }
}
