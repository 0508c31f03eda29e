use chrono::{DateTime, Utc};
use clap::{Args, Parser, Subcommand};

use redeliver_core::{FailedEventId, FailedEventStatus};
use redeliver_infra::event_bus::redis_streams::DEFAULT_STREAM_PREFIX;
use redeliver_infra::failed_events::FailedEventFilter;

#[derive(Debug, Parser)]
#[command(name = "redeliver-sweeper", version, about = "Retry sweeper and operator tool for failed events")]
pub struct Cli {
    /// Postgres connection string for the failed_events table.
    #[arg(long, env = "DATABASE_URL", hide_env_values = true)]
    pub database_url: String,

    #[arg(long, env = "DATABASE_MAX_CONNECTIONS", default_value_t = 5)]
    pub max_connections: u32,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Create the failed_events table and indexes if they are missing.
    Migrate,
    /// Run the periodic sweep until interrupted.
    Run(RedisArgs),
    /// Run a single sweep now and print its report.
    Sweep(RedisArgs),
    #[command(flatten)]
    Admin(AdminCommand),
}

/// Where swept events are republished.
#[derive(Debug, Clone, Args)]
pub struct RedisArgs {
    #[arg(long, env = "REDIS_URL", default_value = "redis://localhost:6379", hide_env_values = true)]
    pub redis_url: String,

    #[arg(long, env = "REDIS_STREAM_PREFIX", default_value = DEFAULT_STREAM_PREFIX)]
    pub stream_prefix: String,

    /// Approximate per-stream length cap (XADD MAXLEN ~).
    #[arg(long, env = "REDIS_STREAM_MAXLEN")]
    pub stream_max_len: Option<usize>,
}

#[derive(Debug, Clone, Subcommand)]
pub enum AdminCommand {
    /// Counts by status, topic, service and event type.
    Stats,
    /// List records, newest first.
    List(ListArgs),
    /// Print one record.
    Show { id: FailedEventId },
    /// Reset a record to PENDING with a fresh attempt budget.
    Retry { id: FailedEventId },
    /// Close a record as RESOLVED.
    Resolve {
        id: FailedEventId,
        #[arg(long = "by")]
        resolved_by: String,
        #[arg(long)]
        reason: String,
    },
    /// Delete a record permanently.
    Remove { id: FailedEventId },
}

#[derive(Debug, Clone, Default, Args)]
pub struct ListArgs {
    #[arg(long)]
    pub status: Option<FailedEventStatus>,
    #[arg(long)]
    pub topic: Option<String>,
    #[arg(long)]
    pub service: Option<String>,
    #[arg(long)]
    pub event_type: Option<String>,
    /// Only records created at or after this RFC 3339 timestamp.
    #[arg(long)]
    pub since: Option<DateTime<Utc>>,
    /// Only records created at or before this RFC 3339 timestamp.
    #[arg(long)]
    pub until: Option<DateTime<Utc>>,
    #[arg(long)]
    pub limit: Option<u32>,
}

impl ListArgs {
    pub fn filter(&self) -> FailedEventFilter {
        FailedEventFilter {
            status: self.status,
            topic: self.topic.clone(),
            service: self.service.clone(),
            event_type: self.event_type.clone(),
            created_after: self.since,
            created_before: self.until,
            limit: self.limit,
        }
    }
}
