//! Cascade expansion of the working set.
//!
//! When a changed object carries dependents in `needdrop`, those dependents
//! must be dropped before the change and recreated after it. Discovery is
//! deliberately one level deep: a dependent pulled in here has its own
//! dependents recorded as ordering edges, but they are not recursively
//! added to the working set. Deeper chains converge on the next run, which
//! sees the recreated definitions; treating that as accepted behavior.

use crate::diff::{DiffOracle, WorkObject};
use crate::error::Error;
use crate::object::{ObjectKind, ObjectRef};
use crate::session::Session;
use crate::Result;

/// How an in-set dependent was handled.
#[derive(Debug, PartialEq)]
enum Patched {
    /// Its change script already drops it (and recreates it).
    AlreadyDropped,
    /// Nothing was planned for it; flip to recreate-only and recompute.
    NeedsRecompute,
    /// A drop was synthesized in front of its existing recreation script.
    DropSynthesized,
}

/// Expand `objects` with every dependent that must be temporarily dropped.
pub async fn expand_cascades(
    objects: &mut Vec<WorkObject>,
    session: &Session,
    oracle: &dyn DiffOracle,
) -> Result<()> {
    // Newly discovered dependents accumulate on the side, deduplicated by
    // identity, and merge into the working set afterwards.
    let mut discovered: Vec<WorkObject> = Vec::new();

    for index in 0..objects.len() {
        let needdrop = objects[index].diff()?.needdrop.clone();
        if needdrop.is_empty() {
            continue;
        }
        let required_by = objects[index].reference.clone();

        for dependent in needdrop {
            if let Some(position) = objects.iter().position(|o| o.reference == dependent) {
                let target = &mut objects[position];
                if patch_in_set(target, &required_by)? == Patched::NeedsRecompute {
                    target.set_recreate_only();
                    target.compute_diff(session, oracle, true).await?;
                }
            } else if !discovered.iter().any(|o| o.reference == dependent) {
                let mut fresh = WorkObject::from_reference(dependent);
                fresh.compute_diff(session, oracle, false).await?;
                discovered.push(fresh);
            }
        }
    }

    objects.append(&mut discovered);
    Ok(())
}

/// Make sure an already-scheduled dependent gets dropped and recreated.
fn patch_in_set(target: &mut WorkObject, required_by: &ObjectRef) -> Result<Patched> {
    if target.diff()?.is_empty() {
        return Ok(Patched::NeedsRecompute);
    }
    if !target.diff()?.scripts.safedrop.is_empty() {
        return Ok(Patched::AlreadyDropped);
    }

    // Its script changes it without dropping it first: synthesize the drop,
    // then insist the script recreates it afterwards.
    let reference = target.reference.clone();
    let drop = target.drop_script().ok_or_else(|| Error::UnsupportedCascade {
        dependent: reference.clone(),
        required_by: required_by.clone(),
    })?;
    let diff = target.diff_mut()?;
    let recreated = match reference.kind {
        ObjectKind::View => !diff.scripts.view.is_empty(),
        ObjectKind::Trigger => !diff.scripts.trig.is_empty(),
        ObjectKind::Function => !diff.scripts.func.is_empty(),
        ObjectKind::Table | ObjectKind::Sequence => false,
    };
    if !recreated {
        return Err(Error::UnsupportedCascade {
            dependent: reference,
            required_by: required_by.clone(),
        });
    }
    diff.scripts.safedrop.push(drop);
    Ok(Patched::DropSynthesized)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diff::ObjectDiff;
    use crate::object::DbSnapshot;
    use berth_schema::ScriptSet;

    fn table_ref() -> ObjectRef {
        ObjectRef::new(ObjectKind::Table, "app", "doc")
    }

    #[test]
    fn empty_diff_requests_recompute() {
        let mut target = WorkObject::preset(
            ObjectRef::new(ObjectKind::View, "app", "v_doc"),
            ObjectDiff::default(),
        );
        assert_eq!(
            patch_in_set(&mut target, &table_ref()).unwrap(),
            Patched::NeedsRecompute
        );
    }

    #[test]
    fn existing_safedrop_needs_nothing() {
        let diff = ObjectDiff {
            scripts: ScriptSet {
                safedrop: vec!["drop view if exists app.v_doc;".into()],
                view: vec!["create view app.v_doc as select 1;".into()],
                ..Default::default()
            },
            needdrop: vec![],
        };
        let mut target =
            WorkObject::preset(ObjectRef::new(ObjectKind::View, "app", "v_doc"), diff);
        assert_eq!(
            patch_in_set(&mut target, &table_ref()).unwrap(),
            Patched::AlreadyDropped
        );
    }

    #[test]
    fn drop_is_synthesized_when_recreation_exists() {
        let diff = ObjectDiff {
            scripts: ScriptSet {
                view: vec!["create view app.v_doc as select 2;".into()],
                ..Default::default()
            },
            needdrop: vec![],
        };
        let mut target = WorkObject::preset_with_snapshot(
            ObjectRef::new(ObjectKind::View, "app", "v_doc"),
            diff,
            DbSnapshot::View {
                src: "create or replace view app.v_doc as select 1;".into(),
            },
        );
        assert_eq!(
            patch_in_set(&mut target, &table_ref()).unwrap(),
            Patched::DropSynthesized
        );
        assert_eq!(
            target.diff().unwrap().scripts.safedrop,
            vec!["drop view if exists app.v_doc;"]
        );
    }

    #[test]
    fn missing_recreation_is_a_fatal_cascade() {
        // A function whose diff somehow carries main-only scripts: dropping
        // it would lose it.
        let diff = ObjectDiff {
            scripts: ScriptSet {
                main: vec!["-- not a recreation".into()],
                ..Default::default()
            },
            needdrop: vec![],
        };
        let mut target = WorkObject::preset_with_snapshot(
            ObjectRef::new(ObjectKind::Function, "app", "f_doc"),
            diff,
            DbSnapshot::Function {
                src: "create function app.f_doc() returns int8 as $$ select 1 $$ language sql;"
                    .into(),
                identity_arguments: "".into(),
            },
        );
        let err = patch_in_set(&mut target, &table_ref()).unwrap_err();
        assert!(matches!(err, Error::UnsupportedCascade { .. }));
    }
}
