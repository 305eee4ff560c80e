//! `rolesync intents`: inspect the durable intent table.
//!
//! Reads `intents.json` directly so it works whether or not the daemon runs.

use anyhow::{Context, Result};
use clap::Args;
use tabled::{settings::Style, Table, Tabled};

use rolesync_core::{IntentStore, SubjectId};

use super::home_dir;

#[derive(Args, Debug)]
pub struct IntentsArgs {
    /// Only show this member.
    pub subject: Option<String>,

    /// Emit machine-readable JSON.
    #[arg(long)]
    pub json: bool,
}

#[derive(Tabled)]
struct IntentRow {
    #[tabled(rename = "member")]
    subject: String,
    #[tabled(rename = "roles")]
    roles: String,
}

impl IntentsArgs {
    pub fn run(self) -> Result<()> {
        let home = home_dir()?;
        let store = IntentStore::open_at(&home).context("failed to open intent store")?;

        let mut table = store.snapshot();
        if let Some(subject) = &self.subject {
            let subject = SubjectId::from(subject.as_str());
            table.retain(|s, _| s == &subject);
        }

        if self.json {
            println!(
                "{}",
                serde_json::to_string_pretty(&table).context("failed to render intents JSON")?
            );
            return Ok(());
        }

        if table.is_empty() {
            match &self.subject {
                Some(subject) => println!("No roles recorded for {subject}."),
                None => println!("No role intents recorded yet."),
            }
            return Ok(());
        }

        let rows: Vec<IntentRow> = table
            .into_iter()
            .map(|(subject, roles)| IntentRow {
                subject: subject.0,
                roles: roles.into_iter().map(|r| r.0).collect::<Vec<_>>().join(", "),
            })
            .collect();
        let mut rendered = Table::new(rows);
        rendered.with(Style::rounded());
        println!("{rendered}");
        Ok(())
    }
}
