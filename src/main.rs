//! # refsync CLI
//!
//! The `refsync` binary drives imports from a reference-management library
//! into the local linked-data store and inspects what past runs wrote.
//!
//! ## Usage
//!
//! ```bash
//! refsync --config ./config/refsync.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `refsync init` | Create the SQLite database, tables and vocabulary catalogue |
//! | `refsync container create <title>` | Create an item set to import into |
//! | `refsync import ...` | Run an incremental import |
//! | `refsync runs` | List past imports |
//! | `refsync links <run-id>` | List source key to record id links of a run |
//! | `refsync show <id>` | Print a stored record as JSON |

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use clap::{Parser, Subcommand};
use tracing::warn;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use refsync::config::{self, Config};
use refsync::ingest::{self, ImportArgs, ImportContext, RunState, StopFlag};
use refsync::mapping::MappingTables;
use refsync::models::{Draft, NewImportRun, ResourceKind, Value};
use refsync::progress::ProgressMode;
use refsync::source::{HttpTransport, Library, LibraryKind, SourceUrl};
use refsync::store::{ImportLog, TargetStore};
use refsync::{db, migrate};

/// refsync: incremental import of a reference library into a linked-data store.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/refsync.example.toml` for a full example.
#[derive(Parser)]
#[command(name = "refsync", version, about)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/refsync.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema and seed the vocabulary catalogue.
    ///
    /// Idempotent: running it multiple times is safe.
    Init,

    /// Manage target containers (item sets).
    Container {
        #[command(subcommand)]
        action: ContainerAction,
    },

    /// Import changed records from a library.
    ///
    /// Without `--full` or `--resume`, the run starts from the highest
    /// version cursor any earlier run of the same library reached.
    Import {
        /// `user` or `group`.
        #[arg(long, default_value = "user")]
        library_type: String,

        /// Numeric user or group id.
        #[arg(long)]
        library_id: u64,

        /// Restrict the import to one collection key.
        #[arg(long)]
        collection: Option<String>,

        /// API key. Falls back to the environment variable named by
        /// `source.api_key_env`.
        #[arg(long)]
        api_key: Option<String>,

        /// Attach stored files as media (requires an API key).
        #[arg(long)]
        import_files: bool,

        /// Only import records added on or after this date (YYYY-MM-DD).
        #[arg(long)]
        after: Option<String>,

        /// Only import records added before this date (YYYY-MM-DD).
        #[arg(long)]
        before: Option<String>,

        /// Item set id every document is placed in.
        #[arg(long)]
        container: Option<i64>,

        /// Name for the import run. Defaults to the library URL.
        #[arg(long)]
        name: Option<String>,

        /// Account name recorded as the operator of the run.
        #[arg(long, default_value = "refsync")]
        user: String,

        /// Continue an existing run from its version cursor.
        #[arg(long, conflicts_with = "full")]
        resume: Option<i64>,

        /// Ignore earlier cursors and fetch every record.
        #[arg(long)]
        full: bool,

        /// Progress on stderr. Defaults to human when stderr is a TTY.
        #[arg(long, value_enum)]
        progress: Option<ProgressMode>,
    },

    /// List past imports with their link counts.
    Runs,

    /// List the source key to record id links written by a run.
    Links {
        /// Import run id.
        run_id: i64,
    },

    /// Print a stored record as JSON.
    Show {
        /// Record id.
        id: i64,
    },
}

#[derive(Subcommand)]
enum ContainerAction {
    /// Create an item set and print its id.
    Create {
        /// Container title.
        title: String,
    },
}

fn init_tracing(config: &Config) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "refsync=info".into());
    let registry = tracing_subscriber::registry().with(env_filter);
    if config.logging.format == "json" {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(std::io::stderr),
            )
            .init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}

fn parse_day(value: &str) -> Result<DateTime<Utc>> {
    let date = NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .with_context(|| format!("Invalid date '{}', expected YYYY-MM-DD", value))?;
    Ok(date.and_time(NaiveTime::MIN).and_utc())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;
    init_tracing(&cfg);

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Container {
            action: ContainerAction::Create { title },
        } => {
            let store = db::open_store(&cfg).await?;
            let mut draft = Draft::new();
            draft.push("dcterms:title", Value::literal(title.as_str()));
            let id = store.create(ResourceKind::ItemSet, &draft).await?;
            println!("{}", id);
        }
        Commands::Import {
            library_type,
            library_id,
            collection,
            api_key,
            import_files,
            after,
            before,
            container,
            name,
            user,
            resume,
            full,
            progress,
        } => {
            let library = Library {
                kind: library_type.parse::<LibraryKind>()?,
                id: library_id,
            };
            let api_key = api_key.or_else(|| std::env::var(&cfg.source.api_key_env).ok());
            if import_files && api_key.is_none() {
                warn!("--import-files has no effect without an API key");
            }
            let added_after = after.as_deref().map(parse_day).transpose()?;
            let added_before = before.as_deref().map(parse_day).transpose()?;

            let store = db::open_store(&cfg).await?;
            let url = SourceUrl::new(&cfg.source.base_url, library)?.library_url();

            let run = match resume {
                Some(id) => {
                    let run = store
                        .get_run(id)
                        .await?
                        .with_context(|| format!("import run #{} not found", id))?;
                    if run.url != url {
                        bail!("import run #{} reads {}, not {}", id, run.url, url);
                    }
                    run
                }
                None => {
                    let since = if full {
                        0
                    } else {
                        store.latest_version(&url).await?.unwrap_or(0)
                    };
                    store
                        .create_run(&NewImportRun {
                            name: name.unwrap_or_else(|| url.clone()),
                            url: url.clone(),
                            version: since,
                            job_id: uuid::Uuid::new_v4().to_string(),
                        })
                        .await?
                }
            };

            let transport = HttpTransport::new(
                cfg.source.api_version,
                api_key.as_deref(),
                Duration::from_secs(cfg.source.timeout_secs),
            )?;
            let tables = MappingTables::load(cfg.mapping.path.as_deref())?;

            let stop = StopFlag::new();
            let handle = stop.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    handle.stop();
                }
            });

            let reporter = progress
                .unwrap_or_else(ProgressMode::default_for_tty)
                .reporter();
            let ctx = ImportContext {
                config: &cfg,
                store: &store,
                log: &store,
                transport: &transport,
                tables: &tables,
                stop: &stop,
                progress: reporter.as_ref(),
            };
            let args = ImportArgs {
                run_id: run.id,
                library,
                collection,
                api_key,
                import_files,
                since: run.version,
                added_after,
                added_before,
                container,
                operator: user,
            };
            let report = ingest::run_import(&ctx, &args).await?;

            println!("import #{} ({})", report.run_id, run.name);
            println!("  changed keys: {}", report.changed);
            println!("  fetched: {}", report.fetched);
            println!("  out of range: {}", report.out_of_range);
            for (label, t) in [
                ("documents", report.documents),
                ("notes", report.notes),
                ("actors", report.actors),
                ("persons", report.persons),
                ("tags", report.tags),
                ("annotations", report.annotations),
            ] {
                println!(
                    "  {}: {} created, {} updated, {} failed",
                    label, t.created, t.updated, t.failed
                );
            }
            for failure in &report.failures {
                println!(
                    "  failed {:?} {}: {}",
                    failure.stage, failure.key, failure.message
                );
            }
            println!("  version: {}", report.version);
            match report.state {
                RunState::Completed => println!("ok"),
                other => println!("{}", other.label()),
            }
        }
        Commands::Runs => {
            let store = db::open_store(&cfg).await?;
            let runs = store.list_runs().await?;
            if runs.is_empty() {
                println!("No imports.");
            }
            for summary in runs {
                let run = &summary.run;
                println!(
                    "#{}  {}  version {}  {} records  {}  {}",
                    run.id,
                    run.created_at.format("%Y-%m-%d %H:%M"),
                    run.version,
                    summary.link_count,
                    run.name,
                    run.url
                );
            }
        }
        Commands::Links { run_id } => {
            let store = db::open_store(&cfg).await?;
            if store.get_run(run_id).await?.is_none() {
                bail!("import run #{} not found", run_id);
            }
            for link in store.links_for_run(run_id).await? {
                println!("{}\t{}", link.source_key, link.record_id);
            }
        }
        Commands::Show { id } => {
            let store = db::open_store(&cfg).await?;
            let mut found = None;
            for kind in [ResourceKind::Item, ResourceKind::ItemSet, ResourceKind::Annotation] {
                if let Some(record) = store.read(kind, id).await? {
                    found = Some(record);
                    break;
                }
            }
            let Some(record) = found else {
                bail!("record not found: {}", id);
            };
            println!("{}", serde_json::to_string_pretty(&record)?);
        }
    }

    Ok(())
}
