//! Change detection.
//!
//! Shortlists the artifacts that need evaluation: migrations by filename
//! presence in the applied-migrations table (applied content is not
//! supposed to change), objects and data sets by comparing the normalized
//! content hash against the persisted record. Artifacts with no record are
//! candidates too. Everything is a candidate on a fresh install or under
//! the `force` flag.

use crate::catalog::{SourceCatalog, read_to_string};
use crate::data::DataSet;
use crate::diff::WorkObject;
use crate::migration::MigrationScript;
use crate::object::SourceObject;
use crate::session::{Role, Session};
use crate::{Result, RunConfig};

/// The three candidate lists consumed by the planner.
#[derive(Debug, Default)]
pub struct Candidates {
    pub migrations: Vec<MigrationScript>,
    pub objects: Vec<WorkObject>,
    pub data: Vec<DataSet>,
}

impl Candidates {
    pub fn any(&self) -> bool {
        !self.migrations.is_empty() || !self.objects.is_empty() || !self.data.is_empty()
    }
}

/// Presence of berth's bookkeeping tables, checked once up front.
#[derive(Debug, Clone, Copy)]
pub struct Bookkeeping {
    pub migrations_table: bool,
    pub objects_table: bool,
}

impl Bookkeeping {
    pub async fn check(session: &Session, role: Role) -> Result<Self> {
        Ok(Self {
            migrations_table: session
                .exists("table", "public", "berth_migrations", role)
                .await?,
            objects_table: session
                .exists("table", "public", "berth_objects", role)
                .await?,
        })
    }

    /// Fresh install: no applied-migrations history yet. Gates the
    /// `initial` policy of migration blocks.
    pub fn fresh_install(&self) -> bool {
        !self.migrations_table
    }
}

/// Compute all three candidate lists.
pub async fn collect(
    catalog: &SourceCatalog,
    session: &mut Session,
    role: Role,
    config: &RunConfig,
    bookkeeping: Bookkeeping,
) -> Result<Candidates> {
    let mut candidates = Candidates::default();

    for migration in &catalog.migrations {
        let applied = if bookkeeping.migrations_table {
            session
                .applied_migrations(role)
                .await?
                .iter()
                .any(|name| name == &migration.name)
        } else {
            false
        };
        if !applied {
            let text = read_to_string(&migration.path)?;
            candidates
                .migrations
                .push(MigrationScript::new(migration.name.clone(), text));
        }
    }

    let use_hashes = bookkeeping.objects_table && !config.force;
    for object in &catalog.objects {
        let text = read_to_string(&object.path)?;
        let source = SourceObject::new(object.reference.clone(), object.path.clone(), text);
        let current = if use_hashes {
            session.object_hashes(role).await?.get(&(
                object.reference.kind.as_str().to_string(),
                object.reference.schema.clone(),
                object.reference.name.clone(),
            ))
        } else {
            None
        };
        if current != Some(&source.hash) {
            candidates.objects.push(WorkObject::from_source(source));
        }
    }

    for data_source in &catalog.data {
        let data_set = DataSet::load(data_source)?;
        let current = if use_hashes {
            session.object_hashes(role).await?.get(&(
                "data".to_string(),
                data_set.schema.clone(),
                data_set.table.clone(),
            ))
        } else {
            None
        };
        if current != Some(&data_set.hash) {
            candidates.data.push(data_set);
        }
    }

    tracing::info!(
        migrations = candidates.migrations.len(),
        objects = candidates.objects.len(),
        data_sets = candidates.data.len(),
        "change detection complete"
    );
    Ok(candidates)
}
