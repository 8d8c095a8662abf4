//! Per-object change scripts.
//!
//! A [`WorkObject`] is one object under evaluation: its source file (when it
//! came from the tree), its lazily fetched live snapshot, and its computed
//! [`ObjectDiff`]. The diff is computed once and cached; it is recomputed
//! only when an object gets reclassified as "recreate only" because a
//! changed object needs it temporarily dropped.
//!
//! Two hash gates keep work minimal: change detection shortlists candidates
//! against the persisted hash store, and a second comparison of the live
//! definition's hash against the source hash skips objects that already
//! converged through some other channel - even when the persisted record
//! looks stale.

use crate::error::Error;
use crate::object::{
    DbSnapshot, ObjectKind, ObjectRef, SourceObject, extract_function_identity,
    extract_function_returns,
};
use crate::session::Session;
use crate::Result;
use berth_schema::{ScriptSet, SequenceDiff, SequenceSpec, TableDiff, TableSpec};

/// Oracle for structural table/sequence comparison.
///
/// Table and sequence sources are structural documents rather than scripts,
/// so their comparison is delegated behind this seam; the other kinds diff
/// by definition text inside the engine itself.
pub trait DiffOracle: Send + Sync {
    fn table_diff(&self, source: &TableSpec, live: Option<&TableSpec>) -> TableDiff;
    fn sequence_diff(&self, source: &SequenceSpec, live: Option<&SequenceSpec>) -> SequenceDiff;
}

/// The in-repo structural oracle.
#[derive(Debug, Default)]
pub struct StructuralOracle;

impl DiffOracle for StructuralOracle {
    fn table_diff(&self, source: &TableSpec, live: Option<&TableSpec>) -> TableDiff {
        berth_schema::diff_table(source, live)
    }

    fn sequence_diff(&self, source: &SequenceSpec, live: Option<&SequenceSpec>) -> SequenceDiff {
        berth_schema::diff_sequence(source, live)
    }
}

/// Scripts needed to converge one object, plus the dependents that must be
/// temporarily dropped around it.
#[derive(Debug, Clone, Default)]
pub struct ObjectDiff {
    pub scripts: ScriptSet,
    pub needdrop: Vec<ObjectRef>,
}

impl ObjectDiff {
    pub fn is_empty(&self) -> bool {
        self.scripts.is_empty() && self.needdrop.is_empty()
    }
}

/// One object in the run's working set.
#[derive(Debug)]
pub struct WorkObject {
    pub reference: ObjectRef,
    pub source: Option<SourceObject>,
    /// Outer option: fetched yet? Inner: does the object exist live?
    snapshot: Option<Option<DbSnapshot>>,
    diff: Option<ObjectDiff>,
    recreate_only: bool,
    /// Candidates from change detection persist their source hash after a
    /// successful run; cascade-discovered objects do not.
    pub needs_hash_save: bool,
}

impl WorkObject {
    /// An object shortlisted by change detection.
    pub fn from_source(source: SourceObject) -> Self {
        Self {
            reference: source.reference.clone(),
            source: Some(source),
            snapshot: None,
            diff: None,
            recreate_only: false,
            needs_hash_save: true,
        }
    }

    /// An object pulled in purely as a cascade dependent: it is dropped and
    /// recreated from its own live definition.
    pub fn from_reference(reference: ObjectRef) -> Self {
        Self {
            reference,
            source: None,
            snapshot: None,
            diff: None,
            recreate_only: true,
            needs_hash_save: false,
        }
    }

    pub fn recreate_only(&self) -> bool {
        self.recreate_only
    }

    pub fn set_recreate_only(&mut self) {
        self.recreate_only = true;
    }

    /// The computed diff; an error until [`Self::compute_diff`] ran.
    pub fn diff(&self) -> Result<&ObjectDiff> {
        self.diff.as_ref().ok_or_else(|| Error::DiffNotReady {
            object: self.reference.to_string(),
        })
    }

    pub fn diff_mut(&mut self) -> Result<&mut ObjectDiff> {
        self.diff.as_mut().ok_or_else(|| Error::DiffNotReady {
            object: self.reference.to_string(),
        })
    }

    /// The live snapshot, fetched once and cached for this object.
    pub async fn snapshot(&mut self, session: &Session) -> Result<Option<&DbSnapshot>> {
        if self.snapshot.is_none() {
            self.snapshot = Some(session.fetch_snapshot(&self.reference).await?);
        }
        Ok(self.snapshot.as_ref().expect("just fetched").as_ref())
    }

    /// The drop script for the live object, if one exists.
    pub fn drop_script(&self) -> Option<String> {
        self.snapshot
            .as_ref()?
            .as_ref()?
            .drop_script(&self.reference)
    }

    /// Compute (or forcibly recompute) this object's diff.
    pub async fn compute_diff(
        &mut self,
        session: &Session,
        oracle: &dyn DiffOracle,
        force: bool,
    ) -> Result<()> {
        if self.diff.is_some() && !force {
            return Ok(());
        }
        self.snapshot(session).await?;
        let diff = if self.recreate_only {
            self.recreate_diff(session).await?
        } else {
            self.converge_diff(session, oracle).await?
        };
        tracing::debug!(
            object = %self.reference,
            statements = diff.scripts.len(),
            dependents = diff.needdrop.len(),
            "diff computed"
        );
        self.diff = Some(diff);
        Ok(())
    }

    /// Recreate-only mode: drop the live object and put it back verbatim.
    async fn recreate_diff(&mut self, session: &Session) -> Result<ObjectDiff> {
        let mut diff = ObjectDiff::default();
        let snapshot = self.snapshot.as_ref().expect("fetched by compute_diff");
        let Some(snapshot) = snapshot else {
            // Already gone; nothing to recreate.
            return Ok(diff);
        };
        match self.reference.kind {
            ObjectKind::View => {
                let src = snapshot.src().unwrap_or_default().to_string();
                if let Some(drop) = snapshot.drop_script(&self.reference) {
                    diff.scripts.safedrop.push(drop);
                }
                diff.scripts.view.push(src);
                diff.needdrop = session.dependent_views(&self.reference, None).await?;
            }
            ObjectKind::Trigger => {
                let src = snapshot.src().unwrap_or_default().to_string();
                if let Some(drop) = snapshot.drop_script(&self.reference) {
                    diff.scripts.safedrop.push(drop);
                }
                diff.scripts.trig.push(src);
            }
            kind => {
                tracing::warn!(object = %self.reference, %kind, "recreate-only unsupported; skipping");
            }
        }
        Ok(diff)
    }

    /// Normal mode: converge the live object to its source definition.
    async fn converge_diff(
        &mut self,
        session: &Session,
        oracle: &dyn DiffOracle,
    ) -> Result<ObjectDiff> {
        let source = self.source.as_ref().ok_or_else(|| {
            Error::Config(format!("{} has no source file to converge to", self.reference))
        })?;
        let snapshot = self.snapshot.as_ref().expect("fetched by compute_diff");

        // Second-level gate: a live definition that already hashes like the
        // source needs nothing, whatever the persisted record says.
        if let Some(snapshot) = snapshot {
            if snapshot.content_hash() == source.hash {
                return Ok(ObjectDiff::default());
            }
        }

        let mut diff = ObjectDiff::default();
        match self.reference.kind {
            ObjectKind::Table => {
                let spec: TableSpec = serde_json::from_str(&source.text)
                    .map_err(|e| Error::json(source.path.as_str(), e))?;
                let live = match snapshot {
                    Some(DbSnapshot::Table { spec }) => Some(spec),
                    _ => None,
                };
                let outcome = oracle.table_diff(&spec, live);
                diff.scripts = outcome.scripts;
                if !outcome.col_change_datatype.is_empty() {
                    diff.needdrop = session
                        .dependent_views(
                            &self.reference,
                            Some(outcome.col_change_datatype.as_slice()),
                        )
                        .await?;
                }
            }
            ObjectKind::Sequence => {
                let mut spec: SequenceSpec = serde_json::from_str(&source.text)
                    .map_err(|e| Error::json(source.path.as_str(), e))?;
                spec.schema = self.reference.schema.clone();
                spec.name = self.reference.name.clone();
                let live = match snapshot {
                    Some(DbSnapshot::Sequence { spec }) => Some(spec),
                    _ => None,
                };
                diff.scripts = oracle.sequence_diff(&spec, live).scripts;
            }
            ObjectKind::Function => {
                diff.scripts.func.push(source.text.clone());
                if let Some(snap @ DbSnapshot::Function { src, identity_arguments }) = snapshot {
                    let source_identity = extract_function_identity(&source.text);
                    let live_identity = normalize_identity(identity_arguments);
                    let source_returns = extract_function_returns(&source.text);
                    let live_returns = extract_function_returns(src);
                    // Same signature: create-or-replace suffices, no drop.
                    if source_identity != live_identity || source_returns != live_returns {
                        if let Some(drop) = snap.drop_script(&self.reference) {
                            diff.scripts.safedrop.push(drop);
                        }
                        let mut dependents =
                            session.dependent_triggers(&self.reference).await?;
                        dependents
                            .extend(session.dependent_views(&self.reference, None).await?);
                        diff.needdrop = dependents;
                    }
                }
            }
            ObjectKind::View => {
                diff.scripts.view.push(source.text.clone());
                if let Some(snap @ DbSnapshot::View { .. }) = snapshot {
                    if let Some(drop) = snap.drop_script(&self.reference) {
                        diff.scripts.safedrop.push(drop);
                    }
                    diff.needdrop = session.dependent_views(&self.reference, None).await?;
                }
            }
            ObjectKind::Trigger => {
                diff.scripts.trig.push(source.text.clone());
                if let Some(snap @ DbSnapshot::Trigger { .. }) = snapshot {
                    if let Some(drop) = snap.drop_script(&self.reference) {
                        diff.scripts.safedrop.push(drop);
                    }
                }
            }
        }
        Ok(diff)
    }

    /// Test/planning constructor: a work object with a preset diff.
    #[cfg(test)]
    pub(crate) fn preset(reference: ObjectRef, diff: ObjectDiff) -> Self {
        Self {
            reference,
            source: None,
            snapshot: Some(None),
            diff: Some(diff),
            recreate_only: false,
            needs_hash_save: false,
        }
    }

    /// Test constructor: preset diff plus a live snapshot.
    #[cfg(test)]
    pub(crate) fn preset_with_snapshot(
        reference: ObjectRef,
        diff: ObjectDiff,
        snapshot: DbSnapshot,
    ) -> Self {
        Self {
            reference,
            source: None,
            snapshot: Some(Some(snapshot)),
            diff: Some(diff),
            recreate_only: false,
            needs_hash_save: false,
        }
    }
}

/// `pg_get_function_identity_arguments` output normalized for comparison
/// with [`extract_function_identity`].
fn normalize_identity(identity: &str) -> String {
    identity
        .to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn structural_oracle_delegates() {
        let oracle = StructuralOracle;
        let spec = TableSpec {
            schema: "app".into(),
            name: "doc".into(),
            comment: None,
            cols: vec![],
            cons: vec![],
            indx: vec![],
        };
        let outcome = oracle.table_diff(&spec, None);
        assert_eq!(outcome.scripts.main.len(), 1);
    }

    #[test]
    fn identity_normalization_matches_extractor() {
        let source = "create function app.f(p_a int8, p_b text default 'x') returns int8 as $$ select 1 $$ language sql;";
        let live_identity = "p_a int8, p_b text";
        assert_eq!(
            extract_function_identity(source),
            normalize_identity(live_identity)
        );
    }
}
