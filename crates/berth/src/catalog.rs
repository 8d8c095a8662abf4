//! Source tree enumeration.
//!
//! The source root holds one directory per database schema:
//!
//! ```text
//! dbsrc/
//!   app/
//!     mig/2026-05/2026-05-12-...~app.sql      migrations
//!     src/table/customer.sql                  object definitions
//!     src/view/v_customer.sql
//!     dat/currency/{data.json,import.json}    seed data sets
//!     sys.json                                {"extensions": ["pgcrypto"]}
//!   .shared/currency/{import.json,export.json}  shared data schemas
//! ```
//!
//! Enumeration is deterministic: every listing is sorted by name so that two
//! runs over the same tree produce the same plan.

use crate::error::Error;
use crate::object::{ObjectKind, ObjectRef};
use crate::{Result, RunConfig};
use camino::{Utf8Path, Utf8PathBuf};
use serde::Deserialize;
use std::collections::BTreeSet;

/// One migration file.
#[derive(Debug, Clone)]
pub struct MigrationSource {
    /// Filename without the `.sql` extension; also the applied-migrations key.
    pub name: String,
    pub path: Utf8PathBuf,
}

/// One object definition file.
#[derive(Debug, Clone)]
pub struct ObjectSource {
    pub reference: ObjectRef,
    pub path: Utf8PathBuf,
}

/// One seed data set.
#[derive(Debug, Clone)]
pub struct DataSource {
    pub schema: String,
    pub table: String,
    pub data_path: Utf8PathBuf,
    pub import_schema_path: Utf8PathBuf,
    pub export_schema_path: Utf8PathBuf,
}

#[derive(Debug, Deserialize, Default)]
struct SysFile {
    #[serde(default)]
    extensions: Vec<String>,
}

/// Everything the source tree provides for one run.
#[derive(Debug, Default)]
pub struct SourceCatalog {
    pub schemas: Vec<String>,
    pub migrations: Vec<MigrationSource>,
    pub objects: Vec<ObjectSource>,
    pub data: Vec<DataSource>,
    pub extensions: BTreeSet<String>,
}

impl SourceCatalog {
    /// Scan the source root, honoring the configured schema allow-list.
    pub fn scan(config: &RunConfig) -> Result<Self> {
        let root = &config.source_root;
        let mut catalog = SourceCatalog::default();

        for schema_dir in sorted_dirs(root)? {
            let schema = schema_dir
                .file_name()
                .unwrap_or_default()
                .to_string();
            if schema.starts_with('.') || !config.schema_allowed(&schema) {
                continue;
            }
            catalog.schemas.push(schema.clone());
            catalog.scan_migrations(&schema, &schema_dir)?;
            catalog.scan_objects(&schema, &schema_dir)?;
            catalog.scan_data(root, &schema, &schema_dir)?;
            catalog.scan_sys(&schema_dir)?;
        }

        catalog
            .migrations
            .sort_by(|a, b| a.name.cmp(&b.name));
        catalog
            .objects
            .sort_by(|a, b| a.reference.cmp(&b.reference));
        catalog
            .data
            .sort_by(|a, b| (&a.schema, &a.table).cmp(&(&b.schema, &b.table)));
        Ok(catalog)
    }

    fn scan_migrations(&mut self, _schema: &str, schema_dir: &Utf8Path) -> Result<()> {
        let mig_root = schema_dir.join("mig");
        if !mig_root.is_dir() {
            return Ok(());
        }
        for period_dir in sorted_dirs(&mig_root)? {
            for file in sorted_files(&period_dir)? {
                if file.extension() != Some("sql") {
                    continue;
                }
                self.migrations.push(MigrationSource {
                    name: file.file_stem().unwrap_or_default().to_string(),
                    path: file,
                });
            }
        }
        Ok(())
    }

    fn scan_objects(&mut self, schema: &str, schema_dir: &Utf8Path) -> Result<()> {
        let src_root = schema_dir.join("src");
        if !src_root.is_dir() {
            return Ok(());
        }
        for kind_dir in sorted_dirs(&src_root)? {
            let kind_name = kind_dir.file_name().unwrap_or_default();
            let Some(kind) = ObjectKind::parse(kind_name) else {
                tracing::warn!(dir = %kind_dir, "ignoring unknown object kind directory");
                continue;
            };
            for file in sorted_files(&kind_dir)? {
                if file.extension() != Some("sql") {
                    continue;
                }
                let name = file.file_stem().unwrap_or_default().to_string();
                self.objects.push(ObjectSource {
                    reference: ObjectRef::new(kind, schema, name),
                    path: file,
                });
            }
        }
        Ok(())
    }

    fn scan_data(&mut self, root: &Utf8Path, schema: &str, schema_dir: &Utf8Path) -> Result<()> {
        let dat_root = schema_dir.join("dat");
        if !dat_root.is_dir() {
            return Ok(());
        }
        for table_dir in sorted_dirs(&dat_root)? {
            let table = table_dir.file_name().unwrap_or_default().to_string();
            let data_path = table_dir.join("data.json");
            if !data_path.is_file() {
                continue;
            }
            // Per-table schemas win; otherwise fall back to the shared set.
            let shared = root.join(".shared").join(&table);
            let import_schema_path = pick(table_dir.join("import.json"), shared.join("import.json"));
            let export_schema_path = pick(table_dir.join("export.json"), shared.join("export.json"));
            self.data.push(DataSource {
                schema: schema.to_string(),
                table,
                data_path,
                import_schema_path,
                export_schema_path,
            });
        }
        Ok(())
    }

    fn scan_sys(&mut self, schema_dir: &Utf8Path) -> Result<()> {
        let sys_path = schema_dir.join("sys.json");
        if !sys_path.is_file() {
            return Ok(());
        }
        let text = read_to_string(&sys_path)?;
        let sys: SysFile =
            serde_json::from_str(&text).map_err(|e| Error::json(sys_path.as_str(), e))?;
        self.extensions.extend(sys.extensions);
        Ok(())
    }
}

fn pick(preferred: Utf8PathBuf, fallback: Utf8PathBuf) -> Utf8PathBuf {
    if preferred.is_file() { preferred } else { fallback }
}

pub(crate) fn read_to_string(path: &Utf8Path) -> Result<String> {
    std::fs::read_to_string(path).map_err(|e| Error::io(path.as_str(), e))
}

fn sorted_dirs(path: &Utf8Path) -> Result<Vec<Utf8PathBuf>> {
    sorted_entries(path, |p| p.is_dir())
}

fn sorted_files(path: &Utf8Path) -> Result<Vec<Utf8PathBuf>> {
    sorted_entries(path, |p| p.is_file())
}

fn sorted_entries(path: &Utf8Path, keep: impl Fn(&Utf8Path) -> bool) -> Result<Vec<Utf8PathBuf>> {
    let mut entries = Vec::new();
    let dir = std::fs::read_dir(path).map_err(|e| Error::io(path.as_str(), e))?;
    for entry in dir {
        let entry = entry.map_err(|e| Error::io(path.as_str(), e))?;
        let entry_path = Utf8PathBuf::try_from(entry.path())
            .map_err(|e| Error::Config(format!("non-utf8 path under {path}: {e}")))?;
        if keep(&entry_path) {
            entries.push(entry_path);
        }
    }
    entries.sort();
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ConnectOptions, Credentials, InitConfig, RunMode};
    use std::fs;

    fn test_config(root: &Utf8Path, only_schemas: Option<Vec<String>>) -> RunConfig {
        RunConfig {
            source_root: root.to_path_buf(),
            connect: ConnectOptions {
                host: "localhost".into(),
                port: 5432,
                dbname: "app".into(),
            },
            check: Credentials::default(),
            admin: Credentials::default(),
            superuser: Credentials::default(),
            silent: true,
            default_mode: RunMode::Rehearse,
            allow_unsafe_drop: false,
            only_schemas,
            force: false,
            save_path: "plan.sql".into(),
            grant_function: None,
            init: InitConfig::default(),
        }
    }

    fn write(path: impl AsRef<std::path::Path>, content: &str) {
        let path = path.as_ref();
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
    }

    fn fixture_tree(root: &std::path::Path) {
        write(root.join("app/mig/2026-05/0001~app.sql"), "select 1;");
        write(root.join("app/mig/2026-06/0002~app.sql"), "select 2;");
        write(root.join("app/src/table/customer.sql"), "{}");
        write(root.join("app/src/view/v_customer.sql"), "create view ...");
        write(root.join("app/dat/currency/data.json"), "[]");
        write(root.join("app/dat/currency/import.json"), "{}");
        write(
            root.join("app/sys.json"),
            r#"{"extensions": ["pgcrypto", "ltree"]}"#,
        );
        write(root.join("audit/src/table/log.sql"), "{}");
        write(root.join(".shared/currency/import.json"), "{}");
        write(root.join(".shared/currency/export.json"), "{}");
    }

    #[test]
    fn scans_all_artifact_kinds() {
        let dir = tempfile::tempdir().unwrap();
        fixture_tree(dir.path());
        let root = Utf8PathBuf::try_from(dir.path().to_path_buf()).unwrap();

        let catalog = SourceCatalog::scan(&test_config(&root, None)).unwrap();
        assert_eq!(catalog.schemas, vec!["app", "audit"]);
        assert_eq!(
            catalog.migrations.iter().map(|m| &m.name).collect::<Vec<_>>(),
            vec!["0001~app", "0002~app"]
        );
        assert_eq!(catalog.objects.len(), 3);
        assert_eq!(catalog.data.len(), 1);
        assert_eq!(
            catalog.extensions.iter().collect::<Vec<_>>(),
            vec!["ltree", "pgcrypto"]
        );
        // Per-table import schema wins over the shared one.
        assert!(catalog.data[0].import_schema_path.as_str().contains("dat/currency"));
        assert!(catalog.data[0].export_schema_path.as_str().contains(".shared"));
    }

    #[test]
    fn schema_allow_list_filters_everything() {
        let dir = tempfile::tempdir().unwrap();
        fixture_tree(dir.path());
        let root = Utf8PathBuf::try_from(dir.path().to_path_buf()).unwrap();

        let catalog =
            SourceCatalog::scan(&test_config(&root, Some(vec!["audit".into()]))).unwrap();
        assert_eq!(catalog.schemas, vec!["audit"]);
        assert!(catalog.migrations.is_empty());
        assert_eq!(catalog.objects.len(), 1);
        assert_eq!(catalog.objects[0].reference.fullname(), "audit.log");
        assert!(catalog.data.is_empty());
        assert!(catalog.extensions.is_empty());
    }
}
