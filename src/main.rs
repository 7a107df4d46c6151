use clap::{Parser, Subcommand, ValueEnum};
use color_eyre::Result;
use std::path::PathBuf;

use opsdeck::api::types::{ItemFilters, JobFilters, JobStatus, LogFilters, Trigger};
use opsdeck::app::ItemAction;
use opsdeck::{app, config, logging};

#[derive(Parser, Debug)]
#[command(name = "opsdeck")]
#[command(about = "Cached, polling client for the operator console API")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/opsdeck/config.yaml)
  #[arg(short, long, global = true)]
  config: Option<PathBuf>,

  /// Echo debug logs on stderr
  #[arg(short, long, global = true)]
  verbose: bool,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// List jobs, or follow their status with --watch
  Jobs {
    #[arg(long)]
    name: Option<String>,
    #[arg(long = "type")]
    job_type: Option<String>,
    #[arg(long, value_parser = parse_job_status)]
    status: Option<JobStatus>,
    /// Pages to load when listing
    #[arg(long, default_value_t = 1)]
    pages: usize,
    /// Poll until Ctrl-C, printing status changes
    #[arg(short, long)]
    watch: bool,
  },
  /// Show one job's status
  Job { id: String },
  /// Start a pipeline run and show the refreshed job list
  Run {
    #[arg(value_enum)]
    pipeline: Pipeline,
    /// Lowest virality score auto-publish will post
    #[arg(long, default_value_t = 5.0)]
    min_score: f64,
  },
  /// Approve, reject or delete a content item
  Item {
    #[arg(value_enum)]
    action: ItemVerb,
    id: String,
  },
  /// List content items
  Items {
    #[arg(long)]
    status: Option<String>,
    #[arg(long, default_value_t = 1)]
    pages: usize,
  },
  /// Stats, health, recent activity and derived metrics
  Dashboard {
    #[arg(short, long)]
    watch: bool,
  },
  /// Activity logs
  #[command(args_conflicts_with_subcommands = true)]
  Logs {
    #[command(subcommand)]
    action: Option<LogsAction>,
    #[arg(long, default_value_t = 100)]
    limit: usize,
    #[arg(long = "type")]
    activity_type: Option<String>,
    #[arg(long)]
    level: Option<String>,
    #[arg(short, long)]
    watch: bool,
  },
  /// Manage the local cache
  Cache {
    #[command(subcommand)]
    action: CacheAction,
  },
}

#[derive(Subcommand, Debug)]
enum LogsAction {
  /// Delete every activity log entry on the server
  Clear,
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq)]
enum Pipeline {
  Scan,
  Generation,
  Full,
  AutoPublish,
}

impl Pipeline {
  fn trigger(self, min_score: f64) -> Trigger {
    match self {
      Pipeline::Scan => Trigger::Scan,
      Pipeline::Generation => Trigger::Generation,
      Pipeline::Full => Trigger::FullPipeline,
      Pipeline::AutoPublish => Trigger::AutoPublish { min_score },
    }
  }
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq)]
enum ItemVerb {
  Approve,
  Reject,
  Delete,
}

impl From<ItemVerb> for ItemAction {
  fn from(verb: ItemVerb) -> Self {
    match verb {
      ItemVerb::Approve => ItemAction::Approve,
      ItemVerb::Reject => ItemAction::Reject,
      ItemVerb::Delete => ItemAction::Delete,
    }
  }
}

#[derive(Subcommand, Debug)]
enum CacheAction {
  /// Forget a cached query, e.g. `dashboard` or `jobs:status=running`
  Clear { key: String },
}

fn parse_job_status(s: &str) -> Result<JobStatus, String> {
  match s.to_ascii_lowercase().as_str() {
    "running" => Ok(JobStatus::Running),
    "completed" => Ok(JobStatus::Completed),
    "failed" => Ok(JobStatus::Failed),
    other => Err(format!(
      "unknown status '{}' (expected running, completed or failed)",
      other
    )),
  }
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  let _log_guard = logging::init(&logging::default_log_dir()?, args.verbose)?;

  // Load configuration
  let config = config::Config::load(args.config.as_deref())?;

  let app = app::App::new(config)?;
  match args.command {
    Command::Jobs {
      name,
      job_type,
      status,
      pages,
      watch,
    } => {
      let filters = JobFilters {
        name,
        job_type,
        status,
      };
      app.jobs(filters, pages, watch).await?;
    }
    Command::Job { id } => app.job(&id).await?,
    Command::Run {
      pipeline,
      min_score,
    } => app.run(pipeline.trigger(min_score)).await?,
    Command::Item { action, id } => app.item(action.into(), &id).await?,
    Command::Logs {
      action: Some(LogsAction::Clear),
      ..
    } => app.clear_logs().await?,
    Command::Items { status, pages } => app.items(ItemFilters { status }, pages).await?,
    Command::Dashboard { watch } => app.dashboard(watch).await?,
    Command::Logs {
      action: None,
      limit,
      activity_type,
      level,
      watch,
    } => {
      let filters = LogFilters {
        limit,
        activity_type,
        level,
      };
      app.logs(filters, watch).await?;
    }
    Command::Cache {
      action: CacheAction::Clear { key },
    } => app.clear_cache(&key),
  }

  Ok(())
}
