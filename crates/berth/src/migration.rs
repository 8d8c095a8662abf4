//! Migration files and event-tagged blocks.
//!
//! A migration file is free-form SQL split on the literal `--[block]`
//! marker. Each non-empty chunk may begin with one line of JSON describing
//! when the block runs relative to the phase pipeline:
//!
//! ```text
//! --[block]
//! {"event": "run", "when": "before"}
//! alter table app.doc rename column kind to doc_kind;
//! --[block]
//! {"event": "main", "when": "after", "initial": "only"}
//! insert into app.org (caption) values ('head office');
//! ```
//!
//! A chunk whose first line fails to parse as JSON is one unconditioned
//! block: it carries no event and runs in the final catch-all phase.
//!
//! Applied migrations are tracked by filename only; once applied, a
//! migration's content is not supposed to change.

use serde::Deserialize;

/// The block delimiter, matched literally at line granularity.
pub const BLOCK_MARKER: &str = "--[block]";

/// `initial` policy: how a block relates to fresh installs (targets with no
/// bookkeeping tables yet).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InitialPolicy {
    /// Apply only on non-fresh installs (the default).
    #[default]
    No,
    /// Apply unconditionally.
    Yes,
    /// Apply only on fresh installs.
    Only,
}

impl InitialPolicy {
    /// Should a block with this policy run against this target?
    pub fn applies(&self, fresh_install: bool) -> bool {
        match self {
            InitialPolicy::Yes => true,
            InitialPolicy::Only => fresh_install,
            InitialPolicy::No => !fresh_install,
        }
    }
}

/// Parsed JSON event header of a block.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct BlockHeader {
    pub event: String,
    #[serde(default)]
    pub when: Option<String>,
    #[serde(default, rename = "objName")]
    pub obj_name: Option<String>,
    #[serde(default, rename = "objType")]
    pub obj_type: Option<String>,
    #[serde(default)]
    pub initial: InitialPolicy,
}

/// Query for blocks attached to a pipeline event.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EventFilter {
    pub event: String,
    pub when: Option<String>,
    pub obj_name: Option<String>,
    pub obj_type: Option<String>,
}

impl EventFilter {
    pub fn new(event: &str, when: &str) -> Self {
        Self {
            event: event.to_string(),
            when: Some(when.to_string()),
            obj_name: None,
            obj_type: None,
        }
    }

    fn matches(&self, header: &BlockHeader) -> bool {
        header.event == self.event
            && header.when == self.when
            && header.obj_name == self.obj_name
            && header.obj_type == self.obj_type
    }
}

/// One block of one migration.
#[derive(Debug, Clone)]
pub struct MigrationBlock {
    pub migration: String,
    pub index: usize,
    pub header: Option<BlockHeader>,
    pub script: String,
    pub applied: bool,
}

/// A migration file's name and text.
#[derive(Debug, Clone)]
pub struct MigrationScript {
    pub name: String,
    pub text: String,
}

impl MigrationScript {
    pub fn new(name: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            text: text.into(),
        }
    }

    /// Split into blocks. The first line of each chunk is tried as a JSON
    /// event header; on failure the entire chunk is the script.
    pub fn blocks(&self) -> Vec<MigrationBlock> {
        self.text
            .split(BLOCK_MARKER)
            .filter(|chunk| !chunk.trim().is_empty())
            .enumerate()
            .map(|(index, chunk)| {
                let trimmed = chunk.trim_start_matches(['\r', '\n']);
                let (first_line, rest) = match trimmed.split_once('\n') {
                    Some((first, rest)) => (first.trim_end_matches('\r'), rest),
                    None => (trimmed, ""),
                };
                let (header, script) = match serde_json::from_str::<BlockHeader>(first_line) {
                    Ok(header) => (Some(header), rest.to_string()),
                    Err(_) => (None, chunk.to_string()),
                };
                MigrationBlock {
                    migration: self.name.clone(),
                    index,
                    header,
                    script,
                    applied: false,
                }
            })
            .collect()
    }
}

/// All pending migration blocks of a run, already filtered by initial
/// policy, queried per pipeline event.
#[derive(Debug, Default)]
pub struct BlockSet {
    blocks: Vec<MigrationBlock>,
}

impl BlockSet {
    /// Collect blocks from pending migrations, keeping only those whose
    /// initial policy matches the target.
    pub fn collect(migrations: &[MigrationScript], fresh_install: bool) -> Self {
        let mut blocks: Vec<MigrationBlock> = migrations
            .iter()
            .flat_map(|m| m.blocks())
            .filter(|b| {
                b.header
                    .as_ref()
                    .map(|h| h.initial)
                    .unwrap_or_default()
                    .applies(fresh_install)
            })
            .collect();
        blocks.sort_by(|a, b| (&a.migration, a.index).cmp(&(&b.migration, b.index)));
        Self { blocks }
    }

    /// Unapplied blocks matching the filter (all unapplied blocks when the
    /// filter is absent), in (migration name, block index) order. Matches
    /// are marked applied immediately: a block enters the plan exactly once,
    /// whatever the run mode does with it.
    pub fn take_matching(&mut self, filter: Option<&EventFilter>) -> Vec<MigrationBlock> {
        let mut taken = Vec::new();
        for block in &mut self.blocks {
            if block.applied {
                continue;
            }
            let matches = match (filter, &block.header) {
                (None, _) => true,
                (Some(filter), Some(header)) => filter.matches(header),
                (Some(_), None) => false,
            };
            if matches {
                block.applied = true;
                taken.push(block.clone());
            }
        }
        taken
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }
}

/// Generate a migration filename: sortable timestamp, ordinal, entropy
/// suffix, target schema and optional comment.
pub fn migration_name(schema: &str, count: u32, comment: Option<&str>) -> String {
    let now = jiff::Timestamp::now();
    let stamp = now.strftime("%Y-%m-%d-T-%H-%M-%S").to_string();
    let suffix = format!("{:04x}", now.as_nanosecond() as u64 & 0xffff);
    let comment = comment.map(|c| format!("~{c}")).unwrap_or_default();
    format!("{stamp}~{count}~{suffix}~{schema}{comment}.sql")
}

#[cfg(test)]
mod tests {
    use super::*;

    const MIG: &str = "--[block]\n\
        {\"event\": \"run\", \"when\": \"before\"}\n\
        alter table app.doc rename column kind to doc_kind;\n\
        --[block]\n\
        {\"event\": \"main\", \"when\": \"after\", \"initial\": \"only\"}\n\
        insert into app.org (caption) values ('head office');\n\
        --[block]\n\
        {\"event\": \"main\", \"when\": \"after\", \"initial\": \"no\"}\n\
        update app.org set caption = caption;\n\
        --[block]\n\
        vacuum analyze app.doc;\n";

    #[test]
    fn splits_blocks_and_parses_headers() {
        let mig = MigrationScript::new("0001~app", MIG);
        let blocks = mig.blocks();
        assert_eq!(blocks.len(), 4);
        assert_eq!(blocks[0].header.as_ref().unwrap().event, "run");
        assert_eq!(blocks[0].header.as_ref().unwrap().when.as_deref(), Some("before"));
        assert_eq!(blocks[1].header.as_ref().unwrap().initial, InitialPolicy::Only);
        // The last chunk has no JSON header: unconditioned block.
        assert!(blocks[3].header.is_none());
        assert!(blocks[3].script.contains("vacuum analyze"));
    }

    #[test]
    fn bad_header_makes_the_whole_chunk_the_script() {
        let mig = MigrationScript::new("0002~app", "--[block]\nnot json at all\nselect 1;\n");
        let blocks = mig.blocks();
        assert_eq!(blocks.len(), 1);
        assert!(blocks[0].header.is_none());
        assert!(blocks[0].script.contains("not json at all"));
        assert!(blocks[0].script.contains("select 1;"));
    }

    #[test]
    fn initial_policy_filtering() {
        let mig = MigrationScript::new("0001~app", MIG);
        let fresh = BlockSet::collect(std::slice::from_ref(&mig), true);
        let existing = BlockSet::collect(&[mig], false);

        // Fresh: "only" included, "no"/unconditioned excluded, headerless
        // blocks default to "no".
        let fresh_scripts: Vec<_> = fresh.blocks.iter().map(|b| b.index).collect();
        assert_eq!(fresh_scripts, vec![1]);
        let existing_scripts: Vec<_> = existing.blocks.iter().map(|b| b.index).collect();
        assert_eq!(existing_scripts, vec![0, 2, 3]);
    }

    #[test]
    fn take_matching_orders_and_marks_applied() {
        let a = MigrationScript::new(
            "0002~app",
            "--[block]\n{\"event\": \"main\", \"when\": \"after\"}\nselect 'second';\n",
        );
        let b = MigrationScript::new(
            "0001~app",
            "--[block]\n{\"event\": \"main\", \"when\": \"after\"}\nselect 'first';\n",
        );
        let mut set = BlockSet::collect(&[a, b], false);

        let taken = set.take_matching(Some(&EventFilter::new("main", "after")));
        assert_eq!(taken.len(), 2);
        assert_eq!(taken[0].migration, "0001~app");
        assert_eq!(taken[1].migration, "0002~app");

        // Already applied: the same filter returns nothing.
        assert!(set.take_matching(Some(&EventFilter::new("main", "after"))).is_empty());
        // And the catch-all is empty too.
        assert!(set.take_matching(None).is_empty());
    }

    #[test]
    fn catch_all_returns_everything_unapplied() {
        let mig = MigrationScript::new(
            "0001~app",
            "--[block]\n{\"event\": \"func\", \"when\": \"after\"}\nselect 1;\n--[block]\nselect 2;\n",
        );
        let mut set = BlockSet::collect(&[mig], false);
        let all = set.take_matching(None);
        assert_eq!(all.len(), 2);
    }

    #[test]
    fn migration_name_shape() {
        let name = migration_name("app", 0, Some("add-doc"));
        assert!(name.ends_with("~app~add-doc.sql"));
        assert!(name.contains("-T-"));
    }
}
