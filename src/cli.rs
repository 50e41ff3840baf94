use clap::Parser;

#[derive(Parser, Debug)]
#[command(
    name = "live-events",
    about = "live event stream client with batched buffering, filters and stats polling",
    version
)]
pub struct Args {
    /// Live events host (scheme, host and optional path prefix)
    #[arg(long, env = "LIVE_EVENTS_HOST")]
    pub host: String,

    /// Team id the stream is scoped to
    #[arg(short, long, env = "LIVE_EVENTS_TEAM_ID")]
    pub team_id: Option<u64>,

    /// Bearer token for the live events host
    #[arg(long, env = "LIVE_EVENTS_TOKEN", hide_env_values = true)]
    pub token: Option<String>,

    /// Only stream events of this type (server-side filter)
    #[arg(short, long)]
    pub event_type: Option<String>,

    /// Client-side filter as key=value, may be repeated (all must match)
    #[arg(short, long = "filter", value_name = "KEY=VALUE")]
    pub filters: Vec<String>,

    /// Publish a batch once it holds this many events
    #[arg(long, default_value = "10")]
    pub batch_size: usize,

    /// Publish a batch when this many milliseconds passed since the last one
    #[arg(long, default_value = "300")]
    pub batch_window_ms: u64,

    /// Maximum events kept in the buffer
    #[arg(long, default_value = "500")]
    pub max_events: usize,

    /// Events kept after the buffer overflows
    #[arg(long, default_value = "400")]
    pub retained_events: usize,

    /// Stats polling interval in milliseconds (0 disables polling)
    #[arg(long, default_value = "1500")]
    pub stats_interval_ms: u64,

    /// Connection timeout in seconds
    #[arg(long, default_value = "30")]
    pub timeout: u64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    pub log_level: String,

    /// Output logs in JSON format
    #[arg(long)]
    pub json_logs: bool,

    /// Enable metrics server
    #[arg(long)]
    pub metrics: bool,

    /// Metrics server port
    #[arg(long, default_value = "9090")]
    pub metrics_port: u16,

    /// Output format: table, json, minimal
    #[arg(long, default_value = "table")]
    pub format: String,

    /// Disable colored output (useful for piping to files)
    #[arg(long)]
    pub no_color: bool,

    /// Quiet mode - only event rows and errors
    #[arg(long)]
    pub quiet: bool,

    /// Stop after printing this many events (0 for unlimited)
    #[arg(long, default_value = "0")]
    pub max_printed: u64,

    /// Ignore stdin commands (pause, resume, filters)
    #[arg(long)]
    pub no_controls: bool,
}
