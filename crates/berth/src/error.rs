use crate::object::ObjectRef;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("could not connect as role '{role}': {source}")]
    Connect {
        role: &'static str,
        source: tokio_postgres::Error,
    },

    #[error("postgres error: {0}")]
    Postgres(#[from] tokio_postgres::Error),

    #[error(
        "dependent {dependent} must be dropped for {required_by}, \
         but its change script never recreates it"
    )]
    UnsupportedCascade {
        dependent: ObjectRef,
        required_by: ObjectRef,
    },

    #[error("circular dependency detected at {object}")]
    Cycle { object: String },

    #[error("statement failed in phase [{phase}]: {source}\nsql: {sql}\nparams: {params}")]
    Execution {
        phase: String,
        sql: String,
        params: String,
        #[source]
        source: tokio_postgres::Error,
    },

    #[error("change script for {object} has not been prepared yet")]
    DiffNotReady { object: String },

    #[error("io error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid json in {path}: {source}")]
    Json {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}

impl Error {
    /// Attach phase/statement context to a bare postgres error.
    pub(crate) fn execution(
        phase: impl Into<String>,
        sql: impl Into<String>,
        params: impl Into<String>,
        source: tokio_postgres::Error,
    ) -> Self {
        Error::Execution {
            phase: phase.into(),
            sql: sql.into(),
            params: params.into(),
            source,
        }
    }

    pub(crate) fn io(path: impl Into<String>, source: std::io::Error) -> Self {
        Error::Io {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn json(path: impl Into<String>, source: serde_json::Error) -> Self {
        Error::Json {
            path: path.into(),
            source,
        }
    }
}
