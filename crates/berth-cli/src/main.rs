//! The `berth` binary.

mod config;
mod prompt;

use berth::{Outcome, RunMode, SilentInteraction, migration_name};
use clap::{Parser, Subcommand};
use owo_colors::OwoColorize;
use prompt::ConsoleInteraction;
use std::path::PathBuf;

/// Converge a Postgres database to its versioned source tree.
#[derive(Parser, Debug)]
#[command(name = "berth", version, about)]
struct Cli {
    /// Path to the configuration file (default: search for
    /// .config/berth.toml upward from the current directory)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Detect drift and converge, prompting for the run mode
    Run {
        /// Answer every prompt from configuration
        #[arg(long)]
        silent: bool,

        /// Run mode to use instead of the configured default
        #[arg(long)]
        mode: Option<String>,

        /// Evaluate every artifact even when hashes look current
        #[arg(long)]
        force: bool,

        /// Restrict the run to these schemas (semicolon-separated)
        #[arg(long)]
        only_schemas: Option<String>,
    },
    /// Print the full plan without executing anything
    Plan,
    /// Execute the full plan, then roll everything back
    Rehearse,
    /// Write the full plan to a file without executing anything
    Save {
        /// Output path (default: the configured save path)
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Generate an empty migration file for a schema
    Generate {
        /// Target schema
        schema: String,
        /// Short comment woven into the filename
        #[arg(default_value = "")]
        comment: String,
    },
}

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("berth=info".parse().expect("valid directive")),
        )
        .init();

    let cli = Cli::parse();
    std::process::exit(match run(cli).await {
        Ok(()) => 0,
        Err(e) => {
            eprintln!("{} {e}", "berth|".red());
            1
        }
    });
}

async fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    let (file, path) = config::load(cli.config.as_deref())?;
    tracing::debug!(path = %path.display(), "configuration loaded");
    let mut config = file.into_run_config();

    let outcome = match cli.command {
        Commands::Run {
            silent,
            mode,
            force,
            only_schemas,
        } => {
            config.silent = config.silent || silent;
            config.force = config.force || force;
            if let Some(mode) = mode {
                config.default_mode = mode.parse::<RunMode>()?;
            }
            if let Some(schemas) = only_schemas {
                config.only_schemas =
                    Some(schemas.split(';').map(|s| s.trim().to_string()).collect());
            }
            converge(&config).await?
        }
        Commands::Plan => {
            config.silent = true;
            config.default_mode = RunMode::Render;
            converge(&config).await?
        }
        Commands::Rehearse => {
            config.silent = true;
            config.default_mode = RunMode::Rehearse;
            converge(&config).await?
        }
        Commands::Save { out } => {
            config.silent = true;
            config.default_mode = RunMode::Save;
            if let Some(out) = out {
                config.save_path = out
                    .try_into()
                    .map_err(|e| format!("output path must be utf-8: {e}"))?;
            }
            converge(&config).await?
        }
        Commands::Generate { schema, comment } => {
            return generate(&config, &schema, &comment);
        }
    };

    match outcome {
        Outcome::NoChanges => println!("{} nothing to do, database is current", "berth|".cyan()),
        Outcome::Skipped => println!("{} changes pending, run skipped", "berth|".cyan()),
        Outcome::Applied => println!("{} database converged", "berth|".green()),
        Outcome::Rehearsed => {
            println!("{} rehearsal succeeded, all changes rolled back", "berth|".green())
        }
        Outcome::Rendered(plan) => print!("{plan}"),
        Outcome::Saved(path) => println!("{} plan written to {path}", "berth|".green()),
    }
    Ok(())
}

async fn converge(config: &berth::RunConfig) -> Result<Outcome, berth::Error> {
    if config.silent {
        let mut interaction = SilentInteraction::new(config);
        berth::run(config, &mut interaction).await
    } else {
        let mut interaction = ConsoleInteraction::new();
        berth::run(config, &mut interaction).await
    }
}

fn generate(
    config: &berth::RunConfig,
    schema: &str,
    comment: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let comment = (!comment.is_empty()).then_some(comment);
    let name = migration_name(schema, 0, comment);
    // Group migrations by year-month, like the rest of the tree.
    let period: String = name.chars().take(7).collect();
    let dir = config.source_root.join(schema).join("mig").join(period);
    std::fs::create_dir_all(&dir)?;
    let path = dir.join(&name);
    std::fs::write(
        &path,
        "--[block]\n{\"event\": \"run\", \"when\": \"before\"}\n\n",
    )?;
    println!("{} created {path}", "berth|".green());
    Ok(())
}
