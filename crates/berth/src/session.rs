//! Database session across the three credential roles.
//!
//! A run uses up to three connections, each established lazily and cached
//! until released:
//!
//! - **check** - read-only existence and hash lookups before anything runs,
//! - **admin** - owns the objects; the whole plan executes inside one
//!   transaction on this connection,
//! - **superuser** - used exclusively to create missing extensions, inside
//!   its own independent transaction.
//!
//! The persisted bookkeeping reads (applied migrations, object hashes) are
//! loaded once and cached for the run.

use crate::config::Credentials;
use crate::error::Error;
use crate::meta;
use crate::object::{DbSnapshot, ObjectKind, ObjectRef};
use crate::provider::{PgConnection, PgProvider};
use crate::Result;
use indexmap::IndexMap;

/// Credential role a statement runs under.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Check,
    Admin,
    Super,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Check => "check",
            Role::Admin => "admin",
            Role::Super => "super",
        }
    }
}

/// Hash-record key: (obj_type, schema, name). `obj_type` is an object kind
/// or the literal `data` for data sets.
type HashKey = (String, String, String);

pub struct Session {
    provider: PgProvider,
    check: Option<PgConnection>,
    admin: Option<PgConnection>,
    superuser: Option<PgConnection>,
    applied_migrations: Option<Vec<String>>,
    object_hashes: Option<IndexMap<HashKey, String>>,
    /// Whether `berth_objsrc` can be called. Probed once per run; false on
    /// a fresh target in the non-executing modes, where the routine is only
    /// buffered, never created.
    objsrc_available: bool,
}

impl Session {
    pub fn new(provider: PgProvider) -> Self {
        Self {
            provider,
            check: None,
            admin: None,
            superuser: None,
            applied_migrations: None,
            object_hashes: None,
            objsrc_available: false,
        }
    }

    /// Record whether the live-definition routine is callable. The runner
    /// probes this after support objects are ensured (or skipped).
    pub async fn probe_objsrc(&mut self, role: Role) -> Result<()> {
        self.objsrc_available = self.exists("function", "public", "berth_objsrc", role).await?;
        Ok(())
    }

    /// Establish the connection for a role unless already cached.
    pub async fn connect(&mut self, role: Role, creds: &Credentials) -> Result<()> {
        let slot = self.slot_mut(role);
        if slot.is_none() {
            let conn = self.provider.connect(creds, role.as_str()).await?;
            *self.slot_mut(role) = Some(conn);
        }
        Ok(())
    }

    /// Drop a role's connection (and its connection task with it).
    pub fn release(&mut self, role: Role) {
        *self.slot_mut(role) = None;
    }

    fn slot_mut(&mut self, role: Role) -> &mut Option<PgConnection> {
        match role {
            Role::Check => &mut self.check,
            Role::Admin => &mut self.admin,
            Role::Super => &mut self.superuser,
        }
    }

    pub fn conn(&self, role: Role) -> Result<&PgConnection> {
        let slot = match role {
            Role::Check => &self.check,
            Role::Admin => &self.admin,
            Role::Super => &self.superuser,
        };
        slot.as_ref().ok_or_else(|| {
            Error::Config(format!("role '{}' is not connected", role.as_str()))
        })
    }

    pub async fn begin(&self, role: Role) -> Result<()> {
        Ok(self.conn(role)?.begin().await?)
    }

    pub async fn commit(&self, role: Role) -> Result<()> {
        Ok(self.conn(role)?.commit().await?)
    }

    /// Roll back, swallowing secondary errors: this runs on failure paths
    /// where the original error is the one worth reporting.
    pub async fn rollback_quietly(&self, role: Role) {
        if let Ok(conn) = self.conn(role) {
            if let Err(e) = conn.rollback().await {
                tracing::warn!(role = role.as_str(), error = %e, "rollback failed");
            }
        }
    }

    /// Existence checks for schemas, tables, routines and extensions.
    pub async fn exists(&self, kind: &str, schema: &str, name: &str, role: Role) -> Result<bool> {
        // Schema- and extension-existence take one name only; the spare
        // parameter is referenced with a cast so its type stays inferable.
        let sql = match kind {
            "schema" => {
                "select exists (select $1::text from pg_catalog.pg_namespace where nspname = $2)"
            }
            "table" => {
                "select exists (select null from information_schema.tables \
                 where table_schema = $1 and table_name = $2)"
            }
            "function" => {
                "select exists (select null from information_schema.routines \
                 where routine_schema = $1 and routine_name = $2)"
            }
            "extension" => {
                "select exists (select $1::text from pg_catalog.pg_extension where extname = $2)"
            }
            other => {
                return Err(Error::Config(format!(
                    "no existence check for object kind '{other}'"
                )));
            }
        };
        let row = self.conn(role)?.query_one(sql, &[&schema, &name]).await?;
        Ok(row.get::<_, bool>(0))
    }

    /// Applied migration filenames, loaded once per run.
    pub async fn applied_migrations(&mut self, role: Role) -> Result<&[String]> {
        if self.applied_migrations.is_none() {
            let rows = self
                .conn(role)?
                .query("select filename from public.berth_migrations", &[])
                .await?;
            self.applied_migrations =
                Some(rows.iter().map(|r| r.get::<_, String>(0)).collect());
        }
        Ok(self.applied_migrations.as_deref().unwrap_or_default())
    }

    /// Persisted object hashes, loaded once per run.
    pub async fn object_hashes(&mut self, role: Role) -> Result<&IndexMap<HashKey, String>> {
        if self.object_hashes.is_none() {
            let rows = self
                .conn(role)?
                .query(
                    "select obj_type, obj_schema, obj_name, hash from public.berth_objects",
                    &[],
                )
                .await?;
            let map = rows
                .iter()
                .map(|r| {
                    (
                        (
                            r.get::<_, String>(0),
                            r.get::<_, String>(1),
                            r.get::<_, String>(2),
                        ),
                        r.get::<_, String>(3),
                    )
                })
                .collect();
            self.object_hashes = Some(map);
        }
        Ok(self.object_hashes.as_ref().expect("just populated"))
    }

    pub async fn save_object_hash(
        &self,
        obj_type: &str,
        schema: &str,
        name: &str,
        hash: &str,
    ) -> Result<()> {
        self.conn(Role::Admin)?
            .execute(meta::SAVE_OBJECT_HASH, &[&obj_type, &schema, &name, &hash])
            .await?;
        Ok(())
    }

    pub async fn mark_migration_applied(&self, filename: &str) -> Result<()> {
        self.conn(Role::Admin)?
            .execute(meta::MARK_MIGRATION_APPLIED, &[&filename])
            .await?;
        Ok(())
    }

    /// Create or upgrade berth's own tables and routines, and let the check
    /// role read them.
    pub async fn ensure_support_objects(&self, check_user: &str) -> Result<()> {
        let conn = self.conn(Role::Admin)?;
        for script in meta::SUPPORT_OBJECTS {
            conn.batch(script).await?;
        }
        let grants = format!(
            "grant select on public.berth_migrations, public.berth_objects to {check_user};\n\
             grant execute on function public.berth_obj_exists(text, text, text) to {check_user};\n\
             grant execute on function public.berth_objsrc(text, text, text) to {check_user};"
        );
        conn.batch(&grants).await?;
        Ok(())
    }

    /// Fetch the live definition of an object, if it exists.
    pub async fn fetch_snapshot(&self, reference: &ObjectRef) -> Result<Option<DbSnapshot>> {
        if !self.objsrc_available {
            return Ok(None);
        }
        let row = self
            .conn(Role::Admin)?
            .query_one(
                "select public.berth_objsrc($1, $2, $3)::text",
                &[
                    &reference.kind.as_str(),
                    &reference.schema,
                    &reference.name,
                ],
            )
            .await?;
        let Some(text) = row.get::<_, Option<String>>(0) else {
            return Ok(None);
        };
        let snapshot: DbSnapshot = serde_json::from_str(&text)
            .map_err(|e| Error::json(format!("berth_objsrc({reference})"), e))?;
        Ok(Some(snapshot))
    }

    /// Views that must be dropped while `reference` changes. For tables the
    /// lookup is scoped to the given columns.
    pub async fn dependent_views(
        &self,
        reference: &ObjectRef,
        columns: Option<&[String]>,
    ) -> Result<Vec<ObjectRef>> {
        let fullname = reference.fullname();
        let rows = match (reference.kind, columns) {
            (ObjectKind::Table, Some(columns)) => {
                self.conn(Role::Admin)?
                    .query(meta::DEPENDENT_VIEWS_OF_COLUMNS, &[&fullname, &columns])
                    .await?
            }
            (ObjectKind::View, _) => {
                self.conn(Role::Admin)?
                    .query(meta::DEPENDENT_VIEWS_OF_VIEW, &[&fullname])
                    .await?
            }
            (ObjectKind::Function, _) => {
                self.conn(Role::Admin)?
                    .query(meta::DEPENDENT_VIEWS_OF_FUNCTION, &[&fullname])
                    .await?
            }
            _ => return Ok(Vec::new()),
        };
        Ok(rows
            .iter()
            .map(|r| ObjectRef::new(ObjectKind::View, r.get::<_, String>(0), r.get::<_, String>(1)))
            .collect())
    }

    /// Triggers that must be dropped while a function changes.
    pub async fn dependent_triggers(&self, reference: &ObjectRef) -> Result<Vec<ObjectRef>> {
        if reference.kind != ObjectKind::Function {
            return Ok(Vec::new());
        }
        let fullname = reference.fullname();
        let rows = self
            .conn(Role::Admin)?
            .query(meta::DEPENDENT_TRIGGERS_OF_FUNCTION, &[&fullname])
            .await?;
        Ok(rows
            .iter()
            .map(|r| {
                ObjectRef::new(ObjectKind::Trigger, r.get::<_, String>(0), r.get::<_, String>(1))
            })
            .collect())
    }

    /// Invoke the configured post-update grant routine, if it exists.
    pub async fn grant_all(&self, function: &str) -> Result<()> {
        let (schema, name) = split_routine(function)?;
        if !self.exists("function", schema, name, Role::Admin).await? {
            tracing::warn!(function, "grant routine not found; skipping");
            return Ok(());
        }
        self.conn(Role::Admin)?
            .execute(&format!("select {function}()"), &[])
            .await?;
        Ok(())
    }

    /// True when the configured init routine exists and every sentinel
    /// table exists but at least one of them is empty.
    pub async fn init_needed(&self, function: &str, sentinels: &[String]) -> Result<bool> {
        let (schema, name) = split_routine(function)?;
        if !self.exists("function", schema, name, Role::Admin).await? {
            return Ok(false);
        }
        if sentinels.is_empty() {
            return Ok(false);
        }
        let mut any_empty = false;
        for sentinel in sentinels {
            let (schema, table) = split_routine(sentinel)?;
            if !self.exists("table", schema, table, Role::Admin).await? {
                return Ok(false);
            }
            let row = self
                .conn(Role::Admin)?
                .query_one(
                    &format!("select exists (select null from {schema}.{table})"),
                    &[],
                )
                .await?;
            if !row.get::<_, bool>(0) {
                any_empty = true;
            }
        }
        Ok(any_empty)
    }

    /// Call the init routine with the application-admin identity.
    pub async fn run_init(
        &self,
        function: &str,
        admin_name: &str,
        admin_password: &str,
        admin_role: &str,
    ) -> Result<()> {
        self.conn(Role::Admin)?
            .execute(
                &format!("select {function}($1, $2, $3)"),
                &[&admin_name, &admin_password, &admin_role],
            )
            .await?;
        Ok(())
    }
}

/// Split `schema.name`, defaulting the schema to `public`.
fn split_routine(qualified: &str) -> Result<(&str, &str)> {
    match qualified.split_once('.') {
        Some((schema, name)) if !schema.is_empty() && !name.is_empty() => Ok((schema, name)),
        None if !qualified.is_empty() => Ok(("public", qualified)),
        _ => Err(Error::Config(format!("invalid routine name '{qualified}'"))),
    }
}

/// SQL for a missing schema.
pub fn create_schema_sql(schema: &str, owner: &str) -> String {
    format!("create schema if not exists {schema} authorization {owner};")
}

/// SQL for a missing extension.
pub fn create_extension_sql(extension: &str) -> String {
    format!("create extension if not exists {extension} with cascade;")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_routine_defaults_to_public() {
        assert_eq!(split_routine("app.f_init").unwrap(), ("app", "f_init"));
        assert_eq!(split_routine("f_grant_all").unwrap(), ("public", "f_grant_all"));
        assert!(split_routine("").is_err());
        assert!(split_routine(".oops").is_err());
    }

    #[test]
    fn support_sql_shapes() {
        assert_eq!(
            create_schema_sql("app", "berth_admin"),
            "create schema if not exists app authorization berth_admin;"
        );
        assert_eq!(
            create_extension_sql("pgcrypto"),
            "create extension if not exists pgcrypto with cascade;"
        );
    }
}
