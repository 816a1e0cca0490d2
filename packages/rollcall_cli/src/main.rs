//! Operator CLI over a file-backed rollcall store.
//!
//! The data directory holds `journal.jsonl` (the commit journal),
//! `directory.json` (sessions and participants) and an optional
//! `config.json`.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Duration, Utc};
use clap::{Parser, Subcommand, ValueEnum};
use serde::Serialize;

use rollcall::conflict::Resolution;
use rollcall::directory::InMemoryDirectory;
use rollcall::model::{Domain, OrganizationId};
use rollcall::store::{FileJournal, PresenceStore};
use rollcall::{EngineConfig, PresenceWriteCoordinator, Submission, SyncRequest};

#[derive(Parser, Debug)]
#[command(name = "rollcall")]
#[command(about = "Presence sync, conflict resolution and audit review", long_about = None)]
struct Cli {
    /// Directory holding the journal, directory and config files
    #[arg(long, default_value = "rollcall-data")]
    data_dir: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Choice {
    A,
    B,
    Override,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Record one presence write
    Submit {
        #[arg(long)]
        session: i64,
        #[arg(long)]
        participant: i64,
        /// Presence state code, e.g. present or late
        #[arg(long)]
        state: String,
        #[arg(long)]
        actor: Option<i64>,
        /// Device id; defaults to this host's name
        #[arg(long)]
        device: Option<String>,
        /// RFC 3339 timestamp of the observation; defaults to now
        #[arg(long)]
        at: Option<DateTime<Utc>>,
    },
    /// Apply an offline batch read from a JSON sync request
    Sync { file: PathBuf },
    /// Resolve an open conflict
    Resolve {
        conflict: i64,
        #[arg(long, value_enum)]
        choice: Choice,
        /// State code for an override
        #[arg(long)]
        state: Option<String>,
        #[arg(long)]
        actor: Option<i64>,
    },
    /// List open conflicts, oldest first
    Conflicts {
        #[arg(long)]
        org: OrganizationId,
    },
    /// Show audit history of one record or a whole organization
    Audit {
        #[arg(long)]
        org: Option<OrganizationId>,
        #[arg(long, default_value = "presence_records")]
        table: String,
        #[arg(long)]
        record: Option<i64>,
        /// Only entries from the last N hours (organization view)
        #[arg(long, default_value_t = 24)]
        hours: i64,
        #[arg(long, default_value_t = 50)]
        limit: usize,
    },
    /// Verify the audit hash chain
    Verify,
    /// List presence states of a domain
    States {
        #[arg(long)]
        org: OrganizationId,
        #[arg(long)]
        domain: Domain,
    },
    /// Head count of one session
    Summary {
        #[arg(long)]
        session: i64,
    },
}

fn open(data_dir: &Path) -> Result<PresenceWriteCoordinator> {
    let config_path = data_dir.join("config.json");
    let config = if config_path.exists() {
        EngineConfig::from_json_file(&config_path)
            .with_context(|| format!("loading {}", config_path.display()))?
    } else {
        EngineConfig::default()
    };

    let directory_path = data_dir.join("directory.json");
    let directory = InMemoryDirectory::from_json_file(&directory_path)
        .with_context(|| format!("loading {}", directory_path.display()))?;

    let journal = FileJournal::open(data_dir.join("journal.jsonl"))
        .with_context(|| format!("opening journal in {}", data_dir.display()))?;
    let store = PresenceStore::open(journal).context("replaying journal")?;

    Ok(PresenceWriteCoordinator::new(
        Arc::new(store),
        Arc::new(directory),
        &config,
    ))
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn default_device() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "rollcall-cli".to_string())
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();
    let engine = open(&cli.data_dir)?;

    match cli.command {
        Commands::Submit {
            session,
            participant,
            state,
            actor,
            device,
            at,
        } => {
            let mut submission =
                Submission::new(session, participant, state, at.unwrap_or_else(Utc::now))
                    .from_device(device.unwrap_or_else(default_device));
            submission.actor = actor;
            let outcome = engine.submit(submission).await?;
            print_json(&outcome)?;
        }
        Commands::Sync { file } => {
            let data = std::fs::read(&file).with_context(|| format!("reading {}", file.display()))?;
            let request: SyncRequest = serde_json::from_slice(&data)
                .with_context(|| format!("parsing {}", file.display()))?;
            let response = engine.sync_batch(request).await?;
            print_json(&response)?;
        }
        Commands::Resolve {
            conflict,
            choice,
            state,
            actor,
        } => {
            let resolution = match (choice, state) {
                (Choice::A, _) => Resolution::VersionA,
                (Choice::B, _) => Resolution::VersionB,
                (Choice::Override, Some(state_code)) => Resolution::Override { state_code },
                (Choice::Override, None) => bail!("--choice override needs --state"),
            };
            let record = engine.resolve(conflict, resolution, actor).await?;
            print_json(&record)?;
        }
        Commands::Conflicts { org } => {
            for conflict in engine.conflicts().list_open(org) {
                println!(
                    "#{} {} / {}: {} ({}) vs {} ({}) opened {}",
                    conflict.id,
                    conflict.session,
                    conflict.participant,
                    conflict.version_a.state_code,
                    conflict.version_a.device.as_deref().unwrap_or("server"),
                    conflict.version_b.state_code,
                    conflict.version_b.device.as_deref().unwrap_or("server"),
                    conflict.created_at
                );
            }
        }
        Commands::Audit {
            org,
            table,
            record,
            hours,
            limit,
        } => {
            let entries: Vec<_> = match (record, org) {
                (Some(record), _) => engine.audit().find_for(&table, record).take(limit).collect(),
                (None, Some(org)) => engine
                    .audit()
                    .find_for_organization(org, Utc::now() - Duration::hours(hours))
                    .take(limit)
                    .collect(),
                (None, None) => bail!("give --record or --org"),
            };
            print_json(&entries)?;
        }
        Commands::Verify => {
            let verified = engine.audit().verify_chain()?;
            println!("audit chain intact: {} entries", verified);
        }
        Commands::States { org, domain } => {
            for state in engine.registry().states(org, &domain)? {
                println!(
                    "{:>3}  {:<12} {:<14} {}{}",
                    state.sort_order,
                    state.code,
                    state.label,
                    state.color,
                    if state.is_default { "" } else { "  (custom)" }
                );
            }
        }
        Commands::Summary { session } => {
            print_json(&engine.session_summary(session)?)?;
        }
    }
    Ok(())
}
