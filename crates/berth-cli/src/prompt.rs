//! Console prompts.
//!
//! Implements the engine's [`Interaction`] seam over stdin/stdout. Every
//! prompt shows its default; an empty answer takes it. Unrecognized answers
//! to the primary choice are fatal, matching the engine's error contract.

use berth::{Credentials, Error, InitAnswers, InitConfig, Interaction, RunMode};
use owo_colors::OwoColorize;
use std::io::{BufRead, Write};

pub struct ConsoleInteraction;

impl ConsoleInteraction {
    pub fn new() -> Self {
        Self
    }

    fn ask(&self, question: &str, default: &str) -> Result<String, Error> {
        let prompt = format!("{} {question}", "berth|".cyan());
        if default.is_empty() {
            print!("{prompt}: ");
        } else {
            print!("{prompt} [{}]: ", default.dimmed());
        }
        std::io::stdout()
            .flush()
            .map_err(|e| Error::Config(format!("cannot write prompt: {e}")))?;
        let mut answer = String::new();
        std::io::stdin()
            .lock()
            .read_line(&mut answer)
            .map_err(|e| Error::Config(format!("cannot read answer: {e}")))?;
        let answer = answer.trim().to_string();
        Ok(if answer.is_empty() {
            default.to_string()
        } else {
            answer
        })
    }

    fn confirm(&self, question: &str, default: bool) -> Result<bool, Error> {
        let answer = self.ask(question, if default { "y" } else { "n" })?;
        match answer.to_lowercase().as_str() {
            "y" | "yes" => Ok(true),
            "n" | "no" => Ok(false),
            other => Err(Error::Config(format!("unrecognized answer '{other}'"))),
        }
    }
}

impl Default for ConsoleInteraction {
    fn default() -> Self {
        Self::new()
    }
}

impl Interaction for ConsoleInteraction {
    fn choose_mode(&mut self, default: RunMode) -> Result<RunMode, Error> {
        let answer = self.ask(
            "changes detected. apply / view / save / skip / rehearse?",
            default.as_str(),
        )?;
        answer.parse()
    }

    fn admin_identity(&mut self, current: &Credentials) -> Result<Credentials, Error> {
        let user = self.ask("owner of all database objects", &current.user)?;
        let password = self.ask(&format!("password for [{user}]"), &current.password)?;
        Ok(Credentials { user, password })
    }

    fn super_identity(&mut self, current: &Credentials) -> Result<Credentials, Error> {
        let user = self.ask("database superuser", &current.user)?;
        let password = self.ask(&format!("password for [{user}]"), &current.password)?;
        Ok(Credentials { user, password })
    }

    fn confirm_unsafe_drop(&mut self, default: bool) -> Result<bool, Error> {
        self.confirm(
            "the plan contains irreversible drops (columns, tables). run them?",
            default,
        )
    }

    fn bootstrap_init(&mut self, init: &InitConfig) -> Result<Option<InitAnswers>, Error> {
        let wanted = self.confirm(
            "no organisations or users found. initialize the application?",
            init.auto.unwrap_or(true),
        )?;
        if !wanted {
            return Ok(None);
        }
        let admin_name = self.ask(
            "application administrator login",
            init.admin_name.as_deref().unwrap_or("admin"),
        )?;
        let admin_password = self.ask(
            &format!("password for [{admin_name}]"),
            init.admin_password.as_deref().unwrap_or(""),
        )?;
        let admin_role = self.ask(
            "administrator role name",
            init.admin_role.as_deref().unwrap_or("admin"),
        )?;
        Ok(Some(InitAnswers {
            admin_name,
            admin_password,
            admin_role,
        }))
    }
}
