//! Run configuration.
//!
//! Everything that used to be a scattered flag in the original tool lives in
//! one immutable [`RunConfig`] value threaded explicitly into every
//! component. A silent (non-interactive) run is fully determined by it.

use crate::error::Error;
use camino::Utf8PathBuf;
use serde::Deserialize;
use std::fmt;
use std::str::FromStr;

/// What to do once changes are detected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunMode {
    /// Execute every phase and commit.
    Apply,
    /// Execute every phase, then roll back unconditionally.
    Rehearse,
    /// Compute the plan and print it; execute nothing.
    Render,
    /// Compute the plan and write it to a file; execute nothing.
    Save,
    /// Do nothing.
    Skip,
}

impl RunMode {
    /// True for modes that execute statements against the database.
    pub fn executes(&self) -> bool {
        matches!(self, RunMode::Apply | RunMode::Rehearse)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RunMode::Apply => "apply",
            RunMode::Rehearse => "rehearse",
            RunMode::Render => "render",
            RunMode::Save => "save",
            RunMode::Skip => "skip",
        }
    }
}

impl fmt::Display for RunMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunMode {
    type Err = Error;

    /// Accepts the full mode name or its single-letter prompt shorthand.
    fn from_str(s: &str) -> Result<Self, Error> {
        match s.trim().to_lowercase().as_str() {
            "apply" | "a" | "r" => Ok(RunMode::Apply),
            "rehearse" | "t" => Ok(RunMode::Rehearse),
            "render" | "view" | "v" => Ok(RunMode::Render),
            "save" | "f" => Ok(RunMode::Save),
            "skip" | "m" => Ok(RunMode::Skip),
            other => Err(Error::Config(format!("unrecognized run mode '{other}'"))),
        }
    }
}

/// Login identity for one of the three credential roles.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Credentials {
    pub user: String,
    #[serde(default)]
    pub password: String,
}

/// Where the database lives.
#[derive(Debug, Clone, Deserialize)]
pub struct ConnectOptions {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    pub dbname: String,
}

fn default_host() -> String {
    "localhost".to_string()
}

fn default_port() -> u16 {
    5432
}

/// Bootstrap-initialization settings: a routine that seeds the application's
/// first organisation/administrator once the schema converges.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct InitConfig {
    /// Routine to call, e.g. `app.f_init`. Absent disables bootstrap.
    #[serde(default)]
    pub function: Option<String>,
    /// Tables whose collective emptiness means initialization is needed.
    #[serde(default)]
    pub sentinel_tables: Vec<String>,
    /// Preseeded prompt answers for silent runs.
    #[serde(default)]
    pub auto: Option<bool>,
    #[serde(default)]
    pub admin_name: Option<String>,
    #[serde(default)]
    pub admin_password: Option<String>,
    #[serde(default)]
    pub admin_role: Option<String>,
}

/// The one immutable configuration value for a run.
#[derive(Debug, Clone)]
pub struct RunConfig {
    /// Root of the source tree (one directory per schema).
    pub source_root: Utf8PathBuf,
    pub connect: ConnectOptions,
    /// Read-only role for existence/hash checks.
    pub check: Credentials,
    /// Role that owns the objects and runs the administrative transaction.
    pub admin: Credentials,
    /// Role used exclusively for extension creation.
    pub superuser: Credentials,
    /// No prompts; every answer comes from this configuration.
    pub silent: bool,
    /// Answer for the primary choice prompt.
    pub default_mode: RunMode,
    /// Answer for the irreversible-drop confirmation.
    pub allow_unsafe_drop: bool,
    /// Restrict the run to these schemas (None = all).
    pub only_schemas: Option<Vec<String>>,
    /// Evaluate every object/data candidate even when hashes look current.
    pub force: bool,
    /// Where `save` mode writes the plan.
    pub save_path: Utf8PathBuf,
    /// Post-update grant routine, invoked if it exists.
    pub grant_function: Option<String>,
    pub init: InitConfig,
}

impl RunConfig {
    /// True when `schema` participates in this run.
    pub fn schema_allowed(&self, schema: &str) -> bool {
        match &self.only_schemas {
            Some(allowed) => allowed.iter().any(|s| s == schema),
            None => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_mode_accepts_words_and_shorthand() {
        assert_eq!("apply".parse::<RunMode>().unwrap(), RunMode::Apply);
        assert_eq!("t".parse::<RunMode>().unwrap(), RunMode::Rehearse);
        assert_eq!("v".parse::<RunMode>().unwrap(), RunMode::Render);
        assert_eq!("Save".parse::<RunMode>().unwrap(), RunMode::Save);
        assert!("yolo".parse::<RunMode>().is_err());
    }

    #[test]
    fn schema_allow_list() {
        let config = RunConfig {
            source_root: "dbsrc".into(),
            connect: ConnectOptions {
                host: default_host(),
                port: default_port(),
                dbname: "app".into(),
            },
            check: Credentials::default(),
            admin: Credentials::default(),
            superuser: Credentials::default(),
            silent: true,
            default_mode: RunMode::Rehearse,
            allow_unsafe_drop: false,
            only_schemas: Some(vec!["app".into()]),
            force: false,
            save_path: "plan.sql".into(),
            grant_function: None,
            init: InitConfig::default(),
        };
        assert!(config.schema_allowed("app"));
        assert!(!config.schema_allowed("audit"));
    }
}
