use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use fleetsync::branding::SyncOutcome;
use fleetsync::http::{Method, RequestSpec};
use fleetsync::queue::FlushOutcome;
use fleetsync::{Config, Runtime};
use serde_json::{json, Value};
use std::path::PathBuf;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "fleetsync")]
#[command(about = "Offline-first sync client for fleet tracking APIs")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/fleetsync/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// School scope to use instead of api.scope
  #[arg(short, long)]
  scope: Option<String>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Show connectivity, queue and session state
  Status,
  /// Read a resource, falling back to the cache when offline
  Get {
    path: String,
    /// Query parameter as key=value (repeatable)
    #[arg(short, long = "query", value_parser = parse_pair)]
    query: Vec<(String, String)>,
  },
  /// Send a request; mutations are queued when offline
  Send {
    method: Method,
    path: String,
    /// JSON request body
    #[arg(short, long)]
    body: Option<String>,
  },
  /// Replay queued mutations now
  Flush,
  /// List queued mutations
  Pending,
  /// Show branding assets for the scope
  Branding {
    /// Force a version check even if assets are on disk
    #[arg(long)]
    refresh: bool,
  },
  /// Store a credential for later requests
  Login { token: String },
  /// Abort in-flight calls, purge the scope's cache and sign out
  Logout,
  /// Keep running: poll connectivity, flush on reconnect, print events
  Run,
}

fn parse_pair(s: &str) -> Result<(String, String), String> {
  s.split_once('=')
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .ok_or_else(|| format!("expected key=value, got {}", s))
}

fn init_tracing() -> Result<WorkerGuard> {
  let dir = Config::log_dir()?;
  std::fs::create_dir_all(&dir)
    .map_err(|e| eyre!("Failed to create log directory {}: {}", dir.display(), e))?;

  let (writer, guard) = tracing_appender::non_blocking(tracing_appender::rolling::daily(
    &dir,
    "fleetsync.log",
  ));
  let filter =
    EnvFilter::try_from_env("FLEETSYNC_LOG").unwrap_or_else(|_| EnvFilter::new("info"));

  let _ = tracing_subscriber::fmt()
    .with_env_filter(filter)
    .with_ansi(false)
    .with_writer(writer)
    .try_init();
  Ok(guard)
}

fn print_json(value: &Value) -> Result<()> {
  println!("{}", serde_json::to_string_pretty(value)?);
  Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  // Keep the guard alive so buffered log lines are flushed on exit
  let _guard = init_tracing()?;

  // Load configuration
  let mut config = Config::load(args.config.as_deref())?;

  // Override scope if specified on command line
  if let Some(scope) = args.scope {
    config.api.scope = scope;
  }

  let runtime = Runtime::open(config)?;
  let scope = runtime.scope().to_string();

  match args.command {
    Command::Status => {
      runtime.monitor().probe().await;
      let state = runtime.monitor().state();
      print_json(&json!({
        "scope": scope,
        "connectivity": state,
        "pending": runtime.queue().len()?,
        "signed_in": runtime.session().token()?.is_some(),
      }))?;
    }
    Command::Get { path, query } => {
      let mut request = RequestSpec::get(path).scoped(scope);
      for (key, value) in query {
        request = request.with_query(key, value);
      }
      let reply = runtime.dispatcher().dispatch(request).await?;
      print_json(&serde_json::to_value(&reply)?)?;
    }
    Command::Send { method, path, body } => {
      let mut request = RequestSpec::new(method, path);
      if let Some(body) = body {
        let body: Value =
          serde_json::from_str(&body).map_err(|e| eyre!("--body is not valid JSON: {}", e))?;
        request = request.with_body(body);
      }
      if method.is_read() {
        request = request.scoped(scope);
      }
      let reply = runtime.dispatcher().dispatch(request).await?;
      print_json(&serde_json::to_value(&reply)?)?;
    }
    Command::Flush => {
      runtime.monitor().probe().await;
      match runtime.dispatcher().flush().await? {
        FlushOutcome::Completed(report) => print_json(&serde_json::to_value(report)?)?,
        FlushOutcome::Coalesced => print_json(&json!({ "coalesced": true }))?,
      }
    }
    Command::Pending => {
      print_json(&serde_json::to_value(runtime.queue().pending()?)?)?;
    }
    Command::Branding { refresh } => {
      let outcome = if refresh {
        runtime.branding().refresh(&scope).await?
      } else {
        runtime.branding().activate(&scope).await?.outcome
      };
      let check = match &outcome {
        SyncOutcome::Current => "current",
        SyncOutcome::Updated(_) => "updated",
        SyncOutcome::Unreachable => "unreachable",
      };
      print_json(&json!({
        "scope": scope,
        "state": runtime.branding().state(&scope),
        "check": check,
        "updated": outcome.updated_count(),
        "assets": runtime.branding().assets(&scope),
      }))?;
    }
    Command::Login { token } => {
      runtime.login(&token)?;
      print_json(&json!({ "signed_in": true }))?;
    }
    Command::Logout => {
      runtime.logout()?;
      print_json(&json!({ "signed_in": false }))?;
    }
    Command::Run => {
      let mut events = runtime.events().subscribe();
      runtime.start();
      loop {
        tokio::select! {
          event = events.recv() => match event {
            Ok(event) => println!("{}", serde_json::to_string(&event)?),
            Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
              tracing::warn!(skipped, "event printer fell behind");
            }
            Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
          },
          _ = tokio::signal::ctrl_c() => break,
        }
      }
      runtime.shutdown().await;
    }
  }

  Ok(())
}
