use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

use offsync::auth::EnvToken;
use offsync::config::Config;
use offsync::connectivity::{spawn_probe, ProbeTarget};
use offsync::{
  logging, ConnectivityMonitor, HttpTransport, Method, Outbox, Outcome, Request, ResponseCache,
  SqliteStore, SyncCoordinator, SyncError, SyncEvent,
};

#[derive(Parser, Debug)]
#[command(name = "offsync")]
#[command(about = "Offline-tolerant client for a REST backend")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/offsync/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Backend base URL, overriding api.base_url
  #[arg(long)]
  base_url: Option<String>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Read a resource, falling back to the cache when offline
  Get { path: String },
  /// Send a write; queued for later if the backend is unreachable
  Send {
    method: Method,
    path: String,
    /// JSON request body
    #[arg(short, long)]
    data: Option<String>,
  },
  /// Replay queued writes now
  Drain,
  /// Watch connectivity and replay queued writes on every reconnect
  Watch,
  /// Show connectivity, queue and cache counts
  Status,
  /// List writes that permanently failed replay
  DeadLetters,
  /// Remove every cached response
  ClearCache,
  /// Drop every queued write and dead letter
  ClearQueue,
  /// Remove expired cache entries
  Sweep,
}

impl Command {
  fn needs_backend(&self) -> bool {
    matches!(
      self,
      Command::Get { .. } | Command::Send { .. } | Command::Drain | Command::Watch
    )
  }
}

type Coordinator = SyncCoordinator<SqliteStore>;

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  // Load configuration
  let config = Config::load(args.config.as_deref())?;

  // Override base URL if specified on command line
  let config = if let Some(base_url) = args.base_url {
    let mut config = config;
    config.api.base_url = Some(base_url);
    config
  } else {
    config
  };

  let _log_guard = logging::init(&config.logging, &config.log_directory()?)?;

  if args.command.needs_backend() {
    config.base_url()?;
  }

  let monitor = Arc::new(ConnectivityMonitor::new());
  let coordinator = Arc::new(build(&config, monitor.clone())?);

  match args.command {
    Command::Get { path } => print_outcome(coordinator.execute(Request::get(path)).await)?,
    Command::Send { method, path, data } => {
      let mut request = Request::new(method, path);
      if let Some(data) = data {
        let payload: Value =
          serde_json::from_str(&data).map_err(|e| eyre!("--data is not valid JSON: {}", e))?;
        request = request.with_payload(payload);
      }
      print_outcome(coordinator.execute(request).await)?;
    }
    Command::Drain => {
      let report = coordinator.drain().await?;
      println!(
        "replayed {}, rejected {}, dead-lettered {}{}",
        report.replayed,
        report.rejected,
        report.dead_lettered,
        if report.interrupted {
          " (stopped: backend unreachable)"
        } else {
          ""
        }
      );
      println!("{} still queued", coordinator.outbox().len()?);
    }
    Command::Watch => watch(&config, coordinator, monitor).await?,
    Command::Status => {
      if let Ok(target) = config.base_url().and_then(ProbeTarget::from_base_url) {
        monitor.observe(target.probe(config.timeout()).await);
      }
      let status = coordinator.status()?;
      println!("connectivity:   {:?}", status.connectivity);
      println!("queued writes:  {}", status.pending);
      println!("dead letters:   {}", status.dead_letters);
      println!("cached entries: {}", status.cached_entries);
    }
    Command::DeadLetters => {
      for letter in coordinator.outbox().dead_letters()? {
        let m = &letter.mutation;
        println!(
          "#{} {} {} attempts={} status={} failed_at={}",
          m.id,
          m.request.method,
          m.request.target,
          m.attempts,
          letter
            .last_status
            .map(|s| s.to_string())
            .unwrap_or_else(|| "-".to_string()),
          letter.failed_at.to_rfc3339()
        );
      }
    }
    Command::ClearCache => println!("removed {} cached responses", coordinator.cache().clear()?),
    Command::ClearQueue => println!("dropped {} queued writes", coordinator.outbox().clear()?),
    Command::Sweep => println!(
      "purged {} expired entries",
      coordinator.cache().purge_expired()?
    ),
  }

  Ok(())
}

fn build(config: &Config, monitor: Arc<ConnectivityMonitor>) -> Result<Coordinator> {
  let store = Arc::new(SqliteStore::open(&config.database_path()?)?);

  let cache = ResponseCache::new(store.clone())
    .with_freshness_window(config.freshness_window())
    .with_ignored_params(config.cache.ignored_query_params.clone());

  let outbox = Outbox::new(store)
    .with_max_attempts(config.outbox.max_attempts)
    .with_capacity(config.outbox.capacity)
    .with_dead_letter_capacity(config.outbox.dead_letter_capacity);

  // Local-only commands work without a backend configured
  let transport = HttpTransport::new(
    config.api.base_url.as_deref().unwrap_or("http://localhost/"),
    config.timeout(),
  )?;

  let coordinator = SyncCoordinator::new(Arc::new(transport), cache, Arc::new(outbox), monitor)?
    .with_auth(Arc::new(EnvToken::new(config.api.token_env.clone())))
    .with_invalidate_on_write(config.sync.invalidate_on_write)
    .with_retry_interval(config.retry_interval());

  Ok(coordinator)
}

async fn watch(
  config: &Config,
  coordinator: Arc<Coordinator>,
  monitor: Arc<ConnectivityMonitor>,
) -> Result<()> {
  let target = ProbeTarget::from_base_url(config.base_url()?)?;
  let mut events = coordinator.subscribe();

  let sync_task = coordinator.spawn();
  let probe_task = spawn_probe(monitor, target, config.probe_interval());
  info!(pending = coordinator.outbox().len()?, "watching for connectivity");

  loop {
    tokio::select! {
      _ = tokio::signal::ctrl_c() => break,
      event = events.recv() => match event {
        Some(SyncEvent::Replayed { id, status }) => println!("#{} delivered ({})", id, status),
        Some(SyncEvent::Rejected { id, status, attempts }) => {
          println!("#{} rejected ({:?}), attempt {}", id, status, attempts)
        }
        Some(SyncEvent::DeadLettered(letter)) => println!(
          "#{} {} {} permanently failed",
          letter.mutation.id, letter.mutation.request.method, letter.mutation.request.target
        ),
        Some(SyncEvent::DrainFinished(_)) => {}
        None => break,
      },
    }
  }

  probe_task.abort();
  sync_task.abort();
  Ok(())
}

fn print_outcome(outcome: Result<Outcome, SyncError>) -> Result<()> {
  match outcome {
    Ok(Outcome::Live(response)) => print_json(&response.body),
    Ok(Outcome::Cached(entry)) => {
      eprintln!(
        "offline: showing cached response from {}",
        entry.stored_at.to_rfc3339()
      );
      print_json(&entry.payload)
    }
    Ok(Outcome::Queued { id }) => {
      println!("queued as #{}, will be sent once the backend is reachable", id);
      Ok(())
    }
    Err(SyncError::Application(response)) => {
      print_json(&response.body)?;
      Err(eyre!("backend returned status {}", response.status))
    }
    Err(e) => Err(eyre!(e)),
  }
}

fn print_json(value: &Value) -> Result<()> {
  let text =
    serde_json::to_string_pretty(value).map_err(|e| eyre!("Failed to format response: {}", e))?;
  println!("{}", text);
  Ok(())
}
