mod api;
mod app;
mod cache;
mod config;
mod connectivity;
mod epoch;
mod event;
mod settings;
mod sync;

use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use std::path::{Path, PathBuf};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

use crate::cache::EntityKind;
use crate::sync::Query;

#[derive(Parser, Debug)]
#[command(name = "docsync")]
#[command(about = "Local-first cache for the document and invoice API")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/docsync/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// API base url, overrides the config file
  #[arg(long)]
  api_url: Option<String>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Load one query: cached rows first, then reconcile with the server
  Sync {
    /// documents, users or address-book
    kind: EntityKind,
    /// Filter as key=value, repeatable (e.g. -f status=unpaid)
    #[arg(short, long = "filter")]
    filters: Vec<String>,
  },
  /// Print cached rows without contacting the server
  Show {
    kind: EntityKind,
    #[arg(long)]
    id: Option<i64>,
  },
  /// Keep the given kinds (default: all) in sync until interrupted
  Watch { kinds: Vec<EntityKind> },
  /// Delete the local cache
  Reset,
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();
  let config = load_config(&args)?;
  let _log_guard = init_logging(&config.data_dir()?)?;

  let app = app::App::start(config)?;

  match args.command {
    Command::Sync { kind, filters } => {
      let query = Query::parse(kind, &filters).map_err(|e| eyre!(e))?;
      app.sync(query).await
    }
    Command::Show { kind, id } => app.show(kind, id),
    Command::Watch { kinds } => app.watch(&kinds).await,
    Command::Reset => app.reset(),
  }
}

fn load_config(args: &Args) -> Result<config::Config> {
  match (config::Config::load(args.config.as_deref()), &args.api_url) {
    (Ok(mut config), Some(url)) => {
      config.api.url = url.clone();
      Ok(config)
    }
    (Ok(config), None) => Ok(config),
    // No config file at all is fine when the url comes from the command line
    (Err(_), Some(url)) if args.config.is_none() => Ok(config::Config::with_api_url(url.clone())),
    (Err(e), _) => Err(e),
  }
}

/// Log to a file in the data directory; stdout is for command output.
fn init_logging(data_dir: &Path) -> Result<WorkerGuard> {
  std::fs::create_dir_all(data_dir)
    .map_err(|e| eyre!("Failed to create data directory {}: {}", data_dir.display(), e))?;

  let appender = tracing_appender::rolling::never(data_dir, "docsync.log");
  let (writer, guard) = tracing_appender::non_blocking(appender);
  let filter = EnvFilter::try_from_env("DOCSYNC_LOG").unwrap_or_else(|_| EnvFilter::new("info"));

  tracing_subscriber::fmt()
    .with_env_filter(filter)
    .with_writer(writer)
    .with_ansi(false)
    .init();

  Ok(guard)
}
