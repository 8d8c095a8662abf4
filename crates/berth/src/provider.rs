//! Postgres connectivity.
//!
//! One plain `tokio_postgres` connection per credential role, with the
//! connection task spawned onto the runtime and every call wrapped in a
//! tracing span carrying the SQL and parameter count. Transaction control
//! is issued as plain statements so a connection can stay cached for the
//! whole run.

use crate::config::{ConnectOptions, Credentials};
use crate::data::ScriptParam;
use crate::error::Error;
use crate::Result;
use tokio_postgres::types::ToSql;
use tokio_postgres::{NoTls, Row};
use tracing::Instrument;

/// Connection factory for the configured database.
#[derive(Debug, Clone)]
pub struct PgProvider {
    options: ConnectOptions,
}

impl PgProvider {
    pub fn new(options: ConnectOptions) -> Self {
        Self { options }
    }

    /// Open a connection under the given credentials. The connection task
    /// is spawned and polls until the client drops.
    pub async fn connect(&self, creds: &Credentials, role: &'static str) -> Result<PgConnection> {
        let mut config = tokio_postgres::Config::new();
        config
            .host(&self.options.host)
            .port(self.options.port)
            .dbname(&self.options.dbname)
            .user(&creds.user)
            .password(&creds.password);

        let (client, connection) = config
            .connect(NoTls)
            .await
            .map_err(|source| Error::Connect { role, source })?;

        tokio::spawn(async move {
            if let Err(e) = connection.await {
                tracing::error!(error = %e, "database connection error");
            }
        });

        tracing::debug!(role, user = %creds.user, "connected");
        Ok(PgConnection { client, role })
    }
}

/// One live connection bound to a credential role.
pub struct PgConnection {
    client: tokio_postgres::Client,
    role: &'static str,
}

impl PgConnection {
    pub fn role(&self) -> &'static str {
        self.role
    }

    /// Execute a parameterized statement, returning the affected row count.
    pub async fn execute(
        &self,
        sql: &str,
        params: &[&(dyn ToSql + Sync)],
    ) -> std::result::Result<u64, tokio_postgres::Error> {
        let span = tracing::debug_span!(
            "db.execute",
            role = self.role,
            sql = %sql,
            params = params.len(),
        );
        self.client.execute(sql, params).instrument(span).await
    }

    /// Run a script of one or more statements over the simple protocol.
    ///
    /// DDL scripts routinely hold several statements and dollar-quoted
    /// bodies; the simple protocol takes them verbatim.
    pub async fn batch(&self, sql: &str) -> std::result::Result<(), tokio_postgres::Error> {
        let span = tracing::debug_span!("db.batch", role = self.role, sql = %sql);
        self.client.batch_execute(sql).instrument(span).await
    }

    /// Execute a query, returning all rows.
    pub async fn query(
        &self,
        sql: &str,
        params: &[&(dyn ToSql + Sync)],
    ) -> std::result::Result<Vec<Row>, tokio_postgres::Error> {
        let span = tracing::debug_span!(
            "db.query",
            role = self.role,
            sql = %sql,
            params = params.len(),
        );
        self.client.query(sql, params).instrument(span).await
    }

    /// Execute a query, returning at most one row.
    pub async fn query_opt(
        &self,
        sql: &str,
        params: &[&(dyn ToSql + Sync)],
    ) -> std::result::Result<Option<Row>, tokio_postgres::Error> {
        let span = tracing::debug_span!(
            "db.query",
            role = self.role,
            sql = %sql,
            params = params.len(),
        );
        self.client.query_opt(sql, params).instrument(span).await
    }

    /// Execute a query, returning exactly one row.
    pub async fn query_one(
        &self,
        sql: &str,
        params: &[&(dyn ToSql + Sync)],
    ) -> std::result::Result<Row, tokio_postgres::Error> {
        let span = tracing::debug_span!(
            "db.query",
            role = self.role,
            sql = %sql,
            params = params.len(),
        );
        self.client.query_one(sql, params).instrument(span).await
    }

    pub async fn begin(&self) -> std::result::Result<(), tokio_postgres::Error> {
        self.batch("begin").await
    }

    pub async fn commit(&self) -> std::result::Result<(), tokio_postgres::Error> {
        self.batch("commit").await
    }

    pub async fn rollback(&self) -> std::result::Result<(), tokio_postgres::Error> {
        self.batch("rollback").await
    }
}

/// Rewrite `:name` placeholders to `$n` positional form.
///
/// Returns the rewritten SQL and the bind values in positional order.
/// Repeated names reuse the same position; `::` casts and single-quoted
/// literals are left alone; names absent from `params` stay verbatim.
pub fn format_query<'a>(
    sql: &str,
    params: &'a [(String, ScriptParam)],
) -> (String, Vec<&'a ScriptParam>) {
    let mut out = String::with_capacity(sql.len());
    let mut ordered: Vec<&'a ScriptParam> = Vec::new();
    let mut positions: Vec<(&'a str, usize)> = Vec::new();

    let mut chars = sql.chars().peekable();
    let mut in_string = false;
    while let Some(c) = chars.next() {
        if c == '\'' {
            in_string = !in_string;
            out.push(c);
            continue;
        }
        if in_string || c != ':' {
            out.push(c);
            continue;
        }
        // A cast: emit both colons and move on.
        if chars.peek() == Some(&':') {
            chars.next();
            out.push_str("::");
            continue;
        }
        let mut name = String::new();
        while let Some(&next) = chars.peek() {
            if next.is_ascii_alphanumeric() || next == '_' {
                name.push(next);
                chars.next();
            } else {
                break;
            }
        }
        let known = params.iter().find(|(n, _)| *n == name);
        match known {
            Some((param_name, value)) if !name.is_empty() => {
                let position = match positions.iter().find(|(n, _)| *n == param_name.as_str()) {
                    Some((_, p)) => *p,
                    None => {
                        ordered.push(value);
                        let p = ordered.len();
                        positions.push((param_name.as_str(), p));
                        p
                    }
                };
                out.push_str(&format!("${position}"));
            }
            _ => {
                out.push(':');
                out.push_str(&name);
            }
        }
    }

    (out, ordered)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(names: &[&str]) -> Vec<(String, ScriptParam)> {
        names
            .iter()
            .map(|n| (n.to_string(), ScriptParam::Text(n.to_string())))
            .collect()
    }

    #[test]
    fn named_params_become_positional() {
        let p = params(&["code", "caption"]);
        let (sql, ordered) =
            format_query("insert into t (a, b) values (:code, :caption);", &p);
        assert_eq!(sql, "insert into t (a, b) values ($1, $2);");
        assert_eq!(ordered.len(), 2);
    }

    #[test]
    fn repeated_names_share_a_position() {
        let p = params(&["code"]);
        let (sql, ordered) = format_query("select :code where :code is not null;", &p);
        assert_eq!(sql, "select $1 where $1 is not null;");
        assert_eq!(ordered.len(), 1);
    }

    #[test]
    fn casts_and_literals_are_untouched() {
        let p = params(&["code"]);
        let (sql, ordered) =
            format_query("select ':code', x::text, :code from t;", &p);
        assert_eq!(sql, "select ':code', x::text, $1 from t;");
        assert_eq!(ordered.len(), 1);
    }

    #[test]
    fn unknown_names_stay_verbatim() {
        let p = params(&["code"]);
        let (sql, ordered) = format_query("select :mystery;", &p);
        assert_eq!(sql, "select :mystery;");
        assert!(ordered.is_empty());
    }
}
