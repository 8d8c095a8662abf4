//! The run itself: mode selection, role negotiation, the phase loop and
//! transaction boundaries.
//!
//! One run is strictly sequential. The superuser transaction (extension
//! creation) is independent and commits on its own terms; everything else
//! happens inside one administrative transaction that commits only in
//! apply mode. The non-executing modes (render, save) touch the database
//! with read queries only and collect every script into a buffer instead.

use crate::catalog::SourceCatalog;
use crate::config::{Credentials, InitConfig, RunConfig, RunMode};
use crate::data::Statement;
use crate::detect::{self, Bookkeeping, Candidates};
use crate::diff::StructuralOracle;
use crate::error::Error;
use crate::migration::{BlockSet, EventFilter};
use crate::plan::{Phase, PhasedScripts};
use crate::provider::{PgProvider, format_query};
use crate::session::{Role, Session, create_extension_sql, create_schema_sql};
use crate::{meta, resolver, Result};
use camino::Utf8PathBuf;
use tokio_postgres::types::ToSql;

/// Answers to the bootstrap-initialization prompts.
#[derive(Debug, Clone)]
pub struct InitAnswers {
    pub admin_name: String,
    pub admin_password: String,
    pub admin_role: String,
}

/// Every synchronous suspension point of a run.
///
/// The console implementation prompts; [`SilentInteraction`] answers from
/// configuration, making a run fully non-interactive and deterministic.
pub trait Interaction {
    /// The primary choice once changes are detected.
    fn choose_mode(&mut self, default: RunMode) -> Result<RunMode>;
    /// Identity that owns all objects (administrative role).
    fn admin_identity(&mut self, current: &Credentials) -> Result<Credentials>;
    /// Superuser identity, asked only when extensions are missing.
    fn super_identity(&mut self, current: &Credentials) -> Result<Credentials>;
    /// Gate in front of irreversible drops.
    fn confirm_unsafe_drop(&mut self, default: bool) -> Result<bool>;
    /// Offer to seed the application's first administrator.
    fn bootstrap_init(&mut self, init: &InitConfig) -> Result<Option<InitAnswers>>;
}

/// Non-interactive answers straight from [`RunConfig`].
pub struct SilentInteraction {
    mode: RunMode,
    unsafe_drop: bool,
    init: InitConfig,
}

impl SilentInteraction {
    pub fn new(config: &RunConfig) -> Self {
        Self {
            mode: config.default_mode,
            unsafe_drop: config.allow_unsafe_drop,
            init: config.init.clone(),
        }
    }
}

impl Interaction for SilentInteraction {
    fn choose_mode(&mut self, _default: RunMode) -> Result<RunMode> {
        Ok(self.mode)
    }

    fn admin_identity(&mut self, current: &Credentials) -> Result<Credentials> {
        Ok(current.clone())
    }

    fn super_identity(&mut self, current: &Credentials) -> Result<Credentials> {
        Ok(current.clone())
    }

    fn confirm_unsafe_drop(&mut self, _default: bool) -> Result<bool> {
        Ok(self.unsafe_drop)
    }

    fn bootstrap_init(&mut self, init: &InitConfig) -> Result<Option<InitAnswers>> {
        if init.auto != Some(true) {
            return Ok(None);
        }
        Ok(Some(InitAnswers {
            admin_name: init.admin_name.clone().unwrap_or_else(|| "admin".into()),
            admin_password: init.admin_password.clone().unwrap_or_default(),
            admin_role: init.admin_role.clone().unwrap_or_else(|| "admin".into()),
        }))
    }
}

/// What a run ended as.
#[derive(Debug)]
pub enum Outcome {
    /// Nothing to do; the target already converged.
    NoChanges,
    /// The operator chose to skip.
    Skipped,
    Applied,
    /// Executed fully, then rolled back.
    Rehearsed,
    /// The full plan text; nothing was executed.
    Rendered(String),
    /// The plan was written here; nothing was executed.
    Saved(Utf8PathBuf),
}

/// Detect drift and converge the database per the configured run mode.
pub async fn run(config: &RunConfig, interaction: &mut dyn Interaction) -> Result<Outcome> {
    let provider = PgProvider::new(config.connect.clone());
    let mut session = Session::new(provider);
    session.connect(Role::Check, &config.check).await?;

    let result = run_inner(config, interaction, &mut session).await;
    if result.is_err() {
        session.rollback_quietly(Role::Admin).await;
    }
    session.release(Role::Admin);
    session.release(Role::Check);
    result
}

async fn run_inner(
    config: &RunConfig,
    interaction: &mut dyn Interaction,
    session: &mut Session,
) -> Result<Outcome> {
    let bookkeeping = Bookkeeping::check(session, Role::Check).await?;
    tracing::info!(root = %config.source_root, "scanning source tree");
    let catalog = SourceCatalog::scan(config)?;
    let candidates = detect::collect(&catalog, session, Role::Check, config, bookkeeping).await?;
    if !candidates.any() {
        tracing::info!("no drift detected; nothing to do");
        return Ok(Outcome::NoChanges);
    }

    let mode = interaction.choose_mode(config.default_mode)?;
    if mode == RunMode::Skip {
        tracing::info!("changes detected, run skipped");
        return Ok(Outcome::Skipped);
    }
    tracing::info!(%mode, "changes detected");

    let mut buffer = String::new();

    // Extensions run apart from everything else: their own role, their own
    // transaction, committed even when the run itself only rehearses.
    let mut missing_extensions = Vec::new();
    for extension in &catalog.extensions {
        if !session.exists("extension", "public", extension, Role::Check).await? {
            missing_extensions.push(extension.clone());
        }
    }
    if !missing_extensions.is_empty() {
        create_extensions(config, interaction, session, &missing_extensions, mode, &mut buffer)
            .await?;
    }

    let admin = interaction.admin_identity(&config.admin)?;
    session.connect(Role::Admin, &admin).await?;
    if mode.executes() {
        session.begin(Role::Admin).await?;
    }

    let result = execute_plan(
        config,
        interaction,
        session,
        &catalog,
        candidates,
        bookkeeping,
        mode,
        &admin,
        &mut buffer,
    )
    .await;
    if let Err(e) = result {
        if mode.executes() {
            session.rollback_quietly(Role::Admin).await;
        }
        return Err(e);
    }

    match mode {
        RunMode::Apply => {
            session.commit(Role::Admin).await?;
            tracing::info!("database converged");
            Ok(Outcome::Applied)
        }
        RunMode::Rehearse => {
            session.conn(Role::Admin)?.rollback().await?;
            tracing::info!("rehearsal succeeded; all changes rolled back");
            Ok(Outcome::Rehearsed)
        }
        RunMode::Render => Ok(Outcome::Rendered(buffer)),
        RunMode::Save => {
            std::fs::write(&config.save_path, &buffer)
                .map_err(|e| Error::io(config.save_path.as_str(), e))?;
            tracing::info!(path = %config.save_path, "plan saved");
            Ok(Outcome::Saved(config.save_path.clone()))
        }
        RunMode::Skip => unreachable!("skip returns before planning"),
    }
}

async fn create_extensions(
    config: &RunConfig,
    interaction: &mut dyn Interaction,
    session: &mut Session,
    extensions: &[String],
    mode: RunMode,
    buffer: &mut String,
) -> Result<()> {
    let scripts: Vec<String> = extensions.iter().map(|e| create_extension_sql(e)).collect();
    if !mode.executes() {
        for script in &scripts {
            push_script(buffer, script);
        }
        return Ok(());
    }

    let superuser = interaction.super_identity(&config.superuser)?;
    session.connect(Role::Super, &superuser).await?;
    session.begin(Role::Super).await?;
    let result: Result<()> = async {
        for script in &scripts {
            session
                .conn(Role::Super)?
                .batch(script)
                .await
                .map_err(|e| Error::execution("extensions", script, "", e))?;
        }
        Ok(())
    }
    .await;
    match result {
        Ok(()) => session.commit(Role::Super).await?,
        Err(e) => {
            session.rollback_quietly(Role::Super).await;
            session.release(Role::Super);
            return Err(e);
        }
    }
    session.release(Role::Super);
    Ok(())
}

/// Either executes scripts on the admin connection or collects them into
/// the plan buffer; one behavior per run, never both.
struct PhaseRunner<'a> {
    session: &'a Session,
    mode: RunMode,
    buffer: &'a mut String,
}

impl PhaseRunner<'_> {
    async fn script(&mut self, label: &str, sql: &str) -> Result<()> {
        if self.mode.executes() {
            tracing::debug!(phase = label, "executing");
            self.session
                .conn(Role::Admin)?
                .batch(sql)
                .await
                .map_err(|e| Error::execution(label, sql, "", e))?;
        } else {
            push_script(self.buffer, sql);
        }
        Ok(())
    }

    async fn statement(&mut self, label: &str, statement: &Statement) -> Result<()> {
        if self.mode.executes() {
            let (sql, ordered) = format_query(&statement.sql, &statement.params);
            let params: Vec<&(dyn ToSql + Sync)> = ordered
                .iter()
                .map(|p| *p as &(dyn ToSql + Sync))
                .collect();
            self.session
                .conn(Role::Admin)?
                .execute(&sql, &params)
                .await
                .map_err(|e| {
                    Error::execution(label, &sql, format!("{:?}", statement.params), e)
                })?;
        } else {
            push_script(self.buffer, &statement.sql);
        }
        Ok(())
    }

    async fn hooks(&mut self, blocks: &mut BlockSet, phase: Phase, filter: Option<&EventFilter>) -> Result<()> {
        for block in blocks.take_matching(filter) {
            let label = format!("{}: {}#{}", phase.label(), block.migration, block.index);
            self.script(&label, &block.script).await?;
        }
        Ok(())
    }
}

fn push_script(buffer: &mut String, sql: &str) {
    buffer.push_str(sql.trim_end());
    buffer.push('\n');
}

#[allow(clippy::too_many_arguments)]
async fn execute_plan(
    config: &RunConfig,
    interaction: &mut dyn Interaction,
    session: &mut Session,
    catalog: &SourceCatalog,
    candidates: Candidates,
    bookkeeping: Bookkeeping,
    mode: RunMode,
    admin: &Credentials,
    buffer: &mut String,
) -> Result<()> {
    // Berth's own tables and routines come first, under the same
    // transaction as everything else.
    if mode.executes() {
        session
            .conn(Role::Admin)?
            .batch("set check_function_bodies = false;")
            .await
            .map_err(|e| {
                Error::execution("session-setup", "set check_function_bodies = false;", "", e)
            })?;
        session.ensure_support_objects(&config.check.user).await?;
    } else {
        push_script(buffer, "set check_function_bodies = false;");
        for script in meta::SUPPORT_OBJECTS {
            push_script(buffer, script);
        }
    }
    session.probe_objsrc(Role::Admin).await?;

    // Candidate lists computed before the bookkeeping tables existed are
    // recomputed now that they do.
    let mut candidates = if bookkeeping.migrations_table && bookkeeping.objects_table {
        candidates
    } else if mode.executes() {
        let bookkeeping = Bookkeeping::check(session, Role::Admin).await?;
        detect::collect(catalog, session, Role::Admin, config, bookkeeping).await?
    } else {
        candidates
    };

    let mut blocks = BlockSet::collect(&candidates.migrations, bookkeeping.fresh_install());
    let oracle = StructuralOracle;

    let mut runner = PhaseRunner {
        session,
        mode,
        buffer,
    };

    // ensure-schemas: every source-tree schema missing from the target.
    for schema in &catalog.schemas {
        if !runner
            .session
            .exists("schema", "public", schema, Role::Check)
            .await?
        {
            let sql = create_schema_sql(schema, &admin.user);
            runner.script(Phase::EnsureSchemas.label(), &sql).await?;
        }
    }

    // Migrations that must run before object comparison (renames, settings
    // the structural differ cannot express).
    runner
        .hooks(&mut blocks, Phase::BeforeRunHooks, Some(&EventFilter::new("run", "before")))
        .await?;

    for object in &mut candidates.objects {
        object.compute_diff(runner.session, &oracle, false).await?;
    }
    resolver::expand_cascades(&mut candidates.objects, runner.session, &oracle).await?;

    let scripts = PhasedScripts::collect(&candidates.objects)?;
    tracing::info!(
        objects = candidates.objects.len(),
        statements = scripts.safedrop.len()
            + scripts.main.len()
            + scripts.unsafedrop.len()
            + scripts.func.len()
            + scripts.trig.len()
            + scripts.view.len()
            + scripts.pkey.len()
            + scripts.end.len(),
        "plan assembled"
    );

    for sql in &scripts.safedrop {
        runner.script(Phase::SafeDrop.label(), sql).await?;
    }
    runner
        .hooks(&mut blocks, Phase::AfterSafeDropHooks, Some(&EventFilter::new("safedrop", "after")))
        .await?;
    for sql in &scripts.main {
        runner.script(Phase::Main.label(), sql).await?;
    }
    if !scripts.unsafedrop.is_empty() {
        if interaction.confirm_unsafe_drop(config.allow_unsafe_drop)? {
            for sql in &scripts.unsafedrop {
                runner.script(Phase::UnsafeDrop.label(), sql).await?;
            }
        } else {
            tracing::warn!(
                statements = scripts.unsafedrop.len(),
                "irreversible drops declined; skipped"
            );
        }
    }
    runner
        .hooks(&mut blocks, Phase::AfterMainHooks, Some(&EventFilter::new("main", "after")))
        .await?;
    for sql in &scripts.func {
        runner.script(Phase::Func.label(), sql).await?;
    }
    runner
        .hooks(&mut blocks, Phase::AfterFuncHooks, Some(&EventFilter::new("func", "after")))
        .await?;
    for sql in &scripts.trig {
        runner.script(Phase::Trig.label(), sql).await?;
    }
    runner
        .hooks(&mut blocks, Phase::AfterTrigHooks, Some(&EventFilter::new("trig", "after")))
        .await?;
    for sql in &scripts.view {
        runner.script(Phase::View.label(), sql).await?;
    }
    runner
        .hooks(&mut blocks, Phase::AfterViewHooks, Some(&EventFilter::new("view", "after")))
        .await?;
    for sql in &scripts.pkey {
        runner.script(Phase::Pkey.label(), sql).await?;
    }
    runner
        .hooks(&mut blocks, Phase::AfterPkeyHooks, Some(&EventFilter::new("pkey", "after")))
        .await?;

    for data_set in &candidates.data {
        let label = format!("{}: {}", Phase::DataLoad.label(), data_set.fullname());
        for statement in data_set.statements()? {
            runner.statement(&label, &statement).await?;
        }
    }
    runner
        .hooks(&mut blocks, Phase::AfterDataHooks, Some(&EventFilter::new("dats", "after")))
        .await?;

    for sql in &scripts.end {
        runner.script(Phase::End.label(), sql).await?;
    }
    runner
        .hooks(&mut blocks, Phase::AfterEndHooks, Some(&EventFilter::new("end", "after")))
        .await?;
    runner
        .hooks(&mut blocks, Phase::AfterRunHooks, Some(&EventFilter::new("run", "after")))
        .await?;
    runner.hooks(&mut blocks, Phase::CatchAllHooks, None).await?;

    if mode.executes() {
        record_run(session, &candidates, config).await?;
        bootstrap_init(config, interaction, session).await?;
    }
    Ok(())
}

/// Persist hashes and applied-migration records. Durable only if the
/// enclosing administrative transaction commits: a rehearsal unwinds these
/// together with everything else.
async fn record_run(session: &Session, candidates: &Candidates, config: &RunConfig) -> Result<()> {
    for object in &candidates.objects {
        if !object.needs_hash_save {
            continue;
        }
        let Some(source) = &object.source else {
            continue;
        };
        session
            .save_object_hash(
                object.reference.kind.as_str(),
                &object.reference.schema,
                &object.reference.name,
                &source.hash,
            )
            .await?;
    }
    for data_set in &candidates.data {
        session
            .save_object_hash("data", &data_set.schema, &data_set.table, &data_set.hash)
            .await?;
    }
    for migration in &candidates.migrations {
        session.mark_migration_applied(&migration.name).await?;
    }
    if let Some(function) = &config.grant_function {
        session.grant_all(function).await?;
    }
    Ok(())
}

async fn bootstrap_init(
    config: &RunConfig,
    interaction: &mut dyn Interaction,
    session: &Session,
) -> Result<()> {
    let Some(function) = &config.init.function else {
        return Ok(());
    };
    if !session
        .init_needed(function, &config.init.sentinel_tables)
        .await?
    {
        return Ok(());
    }
    let Some(answers) = interaction.bootstrap_init(&config.init)? else {
        tracing::info!("bootstrap initialization declined");
        return Ok(());
    };
    session
        .run_init(
            function,
            &answers.admin_name,
            &answers.admin_password,
            &answers.admin_role,
        )
        .await?;
    tracing::info!("application initialized");
    Ok(())
}
