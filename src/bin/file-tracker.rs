use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;

use filetracker_lib::config::AppConfig;
use filetracker_lib::event_log::{read_log_file, EventLogger};
use filetracker_lib::tracker_store::{Tracker, TrackerId, TrackerStore};
use filetracker_lib::{init_tracing, AppRuntime};

#[derive(Parser)]
#[command(name = "file-tracker")]
#[command(about = "Mirror new files from the latest subfolder into a destination", long_about = None)]
struct Cli {
    /// YAML config file
    #[arg(short, long, default_value = "file-tracker.yaml")]
    config: PathBuf,

    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Register a new tracker
    Add {
        source: PathBuf,
        dest: PathBuf,
        /// Copy files from the source root instead of following its latest subfolder
        #[arg(long)]
        flat: bool,
        #[arg(long)]
        inactive: bool,
    },
    Remove {
        id: TrackerId,
    },
    List,
    Enable {
        id: TrackerId,
    },
    Disable {
        id: TrackerId,
    },
    /// Toggle latest-subfolder mode for a tracker
    Subfolders {
        id: TrackerId,
        mode: Toggle,
    },
    /// Watch all active trackers until Ctrl-C
    Run,
    /// Show or clear the event log
    Logs {
        #[arg(short, long, default_value_t = 50)]
        limit: usize,
        #[arg(long)]
        clear: bool,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum Toggle {
    On,
    Off,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let config = AppConfig::load(&cli.config)?;

    match cli.command {
        Command::Add {
            source,
            dest,
            flat,
            inactive,
        } => {
            let store = TrackerStore::open(&config.trackers_file)?;
            let mut tracker = Tracker::new(source, dest);
            tracker.watch_subfolders = !flat;
            tracker.is_active = !inactive;
            let id = store.insert(tracker)?;
            println!("✅ Tracker {id} added");
        }
        Command::Remove { id } => {
            let store = TrackerStore::open(&config.trackers_file)?;
            let removed = store.delete(id)?;
            println!(
                "🗑️  Tracker {} removed ({:?} -> {:?})",
                removed.id, removed.source_dir, removed.dest_dir
            );
        }
        Command::List => {
            let store = TrackerStore::open(&config.trackers_file)?;
            let trackers = store.list();
            if trackers.is_empty() {
                println!("No trackers configured.");
                return Ok(());
            }

            println!(
                "{:<6} {:<8} {:<11} {:<30} {:<30}",
                "ID", "ACTIVE", "SUBFOLDERS", "SOURCE", "DEST"
            );
            println!("{}", "-".repeat(89));
            for t in trackers {
                println!(
                    "{:<6} {:<8} {:<11} {:<30} {:<30}",
                    t.id,
                    if t.is_active { "yes" } else { "no" },
                    if t.watch_subfolders { "latest" } else { "flat" },
                    t.source_dir.display(),
                    t.dest_dir.display()
                );
            }
        }
        Command::Enable { id } => {
            TrackerStore::open(&config.trackers_file)?.set_active(id, true)?;
            println!("▶️  Tracker {id} enabled");
        }
        Command::Disable { id } => {
            TrackerStore::open(&config.trackers_file)?.set_active(id, false)?;
            println!("⏸️  Tracker {id} disabled");
        }
        Command::Subfolders { id, mode } => {
            let enabled = matches!(mode, Toggle::On);
            TrackerStore::open(&config.trackers_file)?.set_watch_subfolders(id, enabled)?;
            println!(
                "🔄 Tracker {id} now {}",
                if enabled {
                    "follows the latest subfolder"
                } else {
                    "watches its source root"
                }
            );
        }
        Command::Run => run(config).await?,
        Command::Logs { limit, clear } => {
            let Some(path) = config.event_log_file.clone() else {
                anyhow::bail!("Event log file is disabled in {:?}", cli.config);
            };

            if clear {
                EventLogger::new(config.max_log_lines)
                    .with_file(&path)?
                    .clear()?;
                println!("🧹 Event log cleared");
                return Ok(());
            }

            for entry in read_log_file(&path, limit)? {
                println!(
                    "{} [{:<5}] {}: {}",
                    entry.timestamp, entry.level, entry.entry_type, entry.message
                );
            }
        }
    }

    Ok(())
}

async fn run(config: AppConfig) -> anyhow::Result<()> {
    let runtime = AppRuntime::build(config)?;
    let cancel = CancellationToken::new();

    println!("🚀 Watching {} tracker(s)...", runtime.store.list().len());
    println!("   Store: {:?}", runtime.config.trackers_file);
    println!("   Press Ctrl-C to stop");

    let service = tokio::spawn(
        runtime
            .service
            .clone()
            .run(runtime.store.trackers_live(), cancel.clone()),
    );

    tokio::signal::ctrl_c().await?;
    println!();
    println!("🛑 Stopping...");
    cancel.cancel();
    service.await??;

    println!("✅ Stopped");
    Ok(())
}
