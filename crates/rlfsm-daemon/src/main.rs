//! rlfsmd daemon binary.
//!
//! Reads `rlfsm.toml` (or the path given with `--config`), opens the SQLite
//! ledger and history, and either runs the cycle until interrupted or performs
//! one operator action and exits.
//!
//! ```text
//! rlfsmd run
//! rlfsmd subscribe --site T2_DEST /store/data/run1/a.root
//! rlfsmd list --direction deletion --status held,retry
//! ```

use std::{
  path::{Path, PathBuf},
  sync::Arc,
};

use anyhow::Context as _;
use clap::{Parser, Subcommand};
use rlfsm_core::subscription::{Direction, Status, SubscriptionId};
use rlfsm_daemon::{ConfiguredBackend, DaemonConfig};
use rlfsm_engine::Rlfsm;
use rlfsm_store_sqlite::{SqliteHistory, SqliteStore};
use serde::Serialize;
use tokio::sync::watch;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

type Engine = Rlfsm<SqliteStore, SqliteStore, SqliteHistory, ConfiguredBackend>;

#[derive(Parser)]
#[command(author, version, about = "Reliable file-operation state machine")]
struct Cli {
  /// Path to the TOML configuration file.
  #[arg(short, long, default_value = "rlfsm.toml")]
  config: PathBuf,

  /// Never write to the ledger or talk to a backend, whatever the config says.
  #[arg(long)]
  read_only: bool,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand)]
enum Command {
  /// Run passes until interrupted.
  Run,
  /// Run a single pass over both directions.
  Pass,
  /// Request that files be transferred to a site.
  Subscribe {
    #[arg(long)]
    site:  String,
    #[arg(required = true)]
    files: Vec<String>,
  },
  /// Request that files be deleted from a site.
  Desubscribe {
    #[arg(long)]
    site:  String,
    #[arg(required = true)]
    files: Vec<String>,
  },
  /// Print subscriptions as JSON lines, refreshing their status first.
  List {
    #[arg(long, default_value_t = Direction::Transfer)]
    direction: Direction,
    /// Comma-separated statuses; all of them when omitted.
    #[arg(long, value_delimiter = ',')]
    status:    Vec<Status>,
  },
  /// Delete `done` subscriptions.
  Close {
    #[arg(long, default_value_t = Direction::Transfer)]
    direction: Direction,
    #[arg(required = true)]
    ids:       Vec<SubscriptionId>,
  },
  /// Withdraw live subscriptions.
  Cancel {
    #[arg(long, default_value_t = Direction::Transfer)]
    direction: Direction,
    #[arg(required = true)]
    ids:       Vec<SubscriptionId>,
  },
  /// Put `held` subscriptions back into `retry`.
  Release {
    #[arg(long, default_value_t = Direction::Transfer)]
    direction: Direction,
    #[arg(required = true)]
    ids:       Vec<SubscriptionId>,
  },
  /// Print and drain the directories left behind by completed deletions.
  CleanupCandidates,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
  // Initialise tracing.
  tracing_subscriber::fmt()
    .with_env_filter(
      EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy(),
    )
    .init();

  let cli = Cli::parse();

  let mut config =
    DaemonConfig::load(&cli.config).context("failed to read configuration")?;
  config.read_only |= cli.read_only;

  let engine = open_engine(&config).await?;

  match cli.command {
    Command::Run => {
      let (stop, stop_rx) = watch::channel(false);
      tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
          tracing::info!("interrupt received; finishing current phase");
        }
        let _ = stop.send(true);
      });
      engine.run(stop_rx).await;
    }
    Command::Pass => {
      for (direction, summary) in engine.run_once().await.context("pass failed")? {
        tracing::info!(%direction, ?summary, "pass complete");
      }
    }
    Command::Subscribe { site, files } => {
      for file in files {
        let outcome = engine
          .subscribe(&file, &site)
          .await
          .with_context(|| format!("failed to subscribe {file}"))?;
        print_json(&serde_json::json!({ "file": file, "site": site, "result": outcome }))?;
      }
    }
    Command::Desubscribe { site, files } => {
      for file in files {
        let outcome = engine
          .desubscribe(&file, &site)
          .await
          .with_context(|| format!("failed to desubscribe {file}"))?;
        print_json(&serde_json::json!({ "file": file, "site": site, "result": outcome }))?;
      }
    }
    Command::List { direction, status } => {
      let statuses = if status.is_empty() { all_statuses() } else { status };
      let subscriptions = engine
        .get_subscriptions(direction, statuses)
        .await
        .context("failed to list subscriptions")?;
      for subscription in &subscriptions {
        print_json(subscription)?;
      }
    }
    Command::Close { direction, ids } => {
      let n = engine.close_subscriptions(direction, &ids).await?;
      tracing::info!(%direction, closed = n, requested = ids.len(), "closed");
    }
    Command::Cancel { direction, ids } => {
      let n = engine.cancel_subscriptions(direction, &ids).await?;
      tracing::info!(%direction, cancelled = n, requested = ids.len(), "cancelled");
    }
    Command::Release { direction, ids } => {
      let n = engine.release_subscriptions(direction, &ids).await?;
      tracing::info!(%direction, released = n, requested = ids.len(), "released");
    }
    Command::CleanupCandidates => {
      for candidate in engine.take_dir_cleanup_candidates().await? {
        print_json(&candidate)?;
      }
    }
  }

  Ok(())
}

async fn open_engine(config: &DaemonConfig) -> anyhow::Result<Engine> {
  // Expand `~` in database paths.
  let store_path = expand_tilde(&config.store_path);
  let history_path = expand_tilde(&config.history_path);

  let store = SqliteStore::open(&store_path)
    .await
    .with_context(|| format!("failed to open ledger at {store_path:?}"))?
    .with_read_only(config.read_only);
  let history = SqliteHistory::open(&history_path)
    .await
    .with_context(|| format!("failed to open history at {history_path:?}"))?;

  let transfer = ConfiguredBackend::from_config(&config.transfer_backend);
  let deletion = ConfiguredBackend::from_config(&config.deletion_backend);
  tracing::info!(
    ledger = ?store_path,
    transfer = transfer.kind(),
    deletion = deletion.kind(),
    read_only = config.read_only,
    "engine configured"
  );

  let store = Arc::new(store);
  Ok(Rlfsm::new(
    store.clone(),
    store,
    Arc::new(history),
    transfer,
    deletion,
    config.settings(),
  ))
}

fn all_statuses() -> Vec<Status> {
  let mut statuses = Status::LIVE.to_vec();
  statuses.extend([Status::Cancelled, Status::Done]);
  statuses
}

fn print_json(value: &impl Serialize) -> anyhow::Result<()> {
  println!("{}", serde_json::to_string(value)?);
  Ok(())
}

/// Expand a leading `~` to the user's home directory.
fn expand_tilde(path: &Path) -> PathBuf {
  let s = path.to_string_lossy();
  if let Some(rest) = s.strip_prefix("~/")
    && let Ok(home) = std::env::var("HOME")
  {
    return PathBuf::from(home).join(rest);
  }
  path.to_path_buf()
}
