//! Configuration file handling for berth.
//!
//! Looks for `.config/berth.toml` in the current directory or any parent
//! directory. Role passwords left empty in the file fall back to the
//! `BERTH_CHECK_PASSWORD` / `BERTH_ADMIN_PASSWORD` / `BERTH_SUPER_PASSWORD`
//! environment variables (a `.env` file is honored).

use berth::{ConnectOptions, Credentials, InitConfig, RunConfig, RunMode};
use camino::Utf8PathBuf;
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// `.config/berth.toml` as written on disk.
#[derive(Debug, Deserialize)]
pub struct FileConfig {
    pub source: SourceSection,
    pub database: ConnectOptions,
    pub roles: RolesSection,
    #[serde(default)]
    pub run: RunSection,
    #[serde(default)]
    pub init: InitConfig,
}

#[derive(Debug, Deserialize)]
pub struct SourceSection {
    pub root: Utf8PathBuf,
}

#[derive(Debug, Deserialize)]
pub struct RolesSection {
    pub check: Credentials,
    pub admin: Credentials,
    #[serde(default)]
    pub superuser: Option<Credentials>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct RunSection {
    pub silent: bool,
    pub default_mode: Option<RunMode>,
    pub allow_unsafe_drop: bool,
    pub only_schemas: Option<Vec<String>>,
    pub force: bool,
    pub save_path: Option<Utf8PathBuf>,
    pub grant_function: Option<String>,
}

impl FileConfig {
    /// Resolve into the engine's run configuration.
    pub fn into_run_config(self) -> RunConfig {
        let mut check = self.roles.check;
        let mut admin = self.roles.admin;
        let mut superuser = self.roles.superuser.unwrap_or_else(|| Credentials {
            user: "postgres".into(),
            password: String::new(),
        });
        fill_password(&mut check, "BERTH_CHECK_PASSWORD");
        fill_password(&mut admin, "BERTH_ADMIN_PASSWORD");
        fill_password(&mut superuser, "BERTH_SUPER_PASSWORD");

        RunConfig {
            source_root: self.source.root,
            connect: self.database,
            check,
            admin,
            superuser,
            silent: self.run.silent,
            default_mode: self.run.default_mode.unwrap_or(RunMode::Rehearse),
            allow_unsafe_drop: self.run.allow_unsafe_drop,
            only_schemas: self.run.only_schemas,
            force: self.run.force,
            save_path: self
                .run
                .save_path
                .unwrap_or_else(|| Utf8PathBuf::from("berth_plan.sql")),
            grant_function: self.run.grant_function,
            init: self.init,
        }
    }
}

fn fill_password(creds: &mut Credentials, var: &str) {
    if creds.password.is_empty() {
        if let Ok(value) = std::env::var(var) {
            creds.password = value;
        }
    }
}

/// Load configuration, searching up from the current directory.
pub fn load(explicit: Option<&Path>) -> Result<(FileConfig, PathBuf), ConfigError> {
    let path = match explicit {
        Some(path) => path.to_path_buf(),
        None => {
            let cwd = std::env::current_dir().map_err(|e| ConfigError::Io(e.to_string()))?;
            find_config_file(&cwd)?
        }
    };
    let content = std::fs::read_to_string(&path).map_err(|e| ConfigError::Io(e.to_string()))?;
    let config: FileConfig =
        toml::from_str(&content).map_err(|e| ConfigError::Parse(e.to_string()))?;
    Ok((config, path))
}

/// Find `.config/berth.toml` by searching up the directory tree.
fn find_config_file(start: &Path) -> Result<PathBuf, ConfigError> {
    let mut current = start.to_path_buf();
    loop {
        let config_path = current.join(".config/berth.toml");
        if config_path.exists() {
            return Ok(config_path);
        }
        if !current.pop() {
            return Err(ConfigError::NotFound);
        }
    }
}

/// Errors that can occur when loading configuration.
#[derive(Debug)]
pub enum ConfigError {
    /// No `.config/berth.toml` found in any parent directory
    NotFound,
    /// I/O error reading the file
    Io(String),
    /// Parse error in the TOML file
    Parse(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::NotFound => {
                write!(
                    f,
                    "No .config/berth.toml found in current directory or any parent"
                )
            }
            ConfigError::Io(e) => write!(f, "Failed to read berth config: {e}"),
            ConfigError::Parse(e) => write!(f, "Failed to parse berth config: {e}"),
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
[source]
root = "dbsrc"

[database]
dbname = "app"

[roles.check]
user = "berth_check"
password = "c"

[roles.admin]
user = "berth_admin"
password = "a"

[run]
default_mode = "apply"
only_schemas = ["app"]

[init]
function = "app.f_init"
sentinel_tables = ["app.org", "app.users"]
"#;

    #[test]
    fn parses_and_resolves() {
        let file: FileConfig = toml::from_str(SAMPLE).unwrap();
        let config = file.into_run_config();
        assert_eq!(config.source_root, "dbsrc");
        assert_eq!(config.connect.host, "localhost");
        assert_eq!(config.connect.port, 5432);
        assert_eq!(config.default_mode, RunMode::Apply);
        assert_eq!(config.superuser.user, "postgres");
        assert_eq!(config.init.function.as_deref(), Some("app.f_init"));
        assert!(config.schema_allowed("app"));
        assert!(!config.schema_allowed("audit"));
    }

    #[test]
    fn finds_config_up_the_tree() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("a/b/c");
        std::fs::create_dir_all(&nested).unwrap();
        let config_dir = dir.path().join(".config");
        std::fs::create_dir_all(&config_dir).unwrap();
        std::fs::write(config_dir.join("berth.toml"), SAMPLE).unwrap();

        let found = find_config_file(&nested).unwrap();
        assert!(found.ends_with(".config/berth.toml"));
    }
}
