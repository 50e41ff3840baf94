/// file: src/config.rs
/// description: runtime configuration built from CLI arguments, with validation
use crate::{
    buffer::{
        DEFAULT_MAX_BATCH_AGE, DEFAULT_MAX_BATCH_SIZE, DEFAULT_MAX_EVENTS,
        DEFAULT_RETAINED_EVENTS,
    },
    cli::Args,
    error::LiveEventsError,
    types::{ClientSideFilters, StreamFilters, TenantContext},
};
use anyhow::Result;
use std::time::Duration;
use url::Url;

pub const DEFAULT_STATS_INTERVAL: Duration = Duration::from_millis(1500);

#[derive(Debug, Clone)]
pub struct Config {
    pub stream: StreamConfig,
    pub batch: BatchConfig,
    pub buffer: BufferConfig,
    pub stats: StatsConfig,
    pub metrics: MetricsConfig,
    pub output: OutputConfig,
}

#[derive(Debug, Clone)]
pub struct StreamConfig {
    pub host: Url,
    pub tenant: Option<TenantContext>,
    pub filters: StreamFilters,
    pub client_side_filters: ClientSideFilters,
    pub connect_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct BatchConfig {
    pub max_batch_size: usize,
    pub max_batch_age: Duration,
}

#[derive(Debug, Clone)]
pub struct BufferConfig {
    pub max_events: usize,
    pub retained_events: usize,
}

#[derive(Debug, Clone)]
pub struct StatsConfig {
    /// `None` turns polling off.
    pub poll_interval: Option<Duration>,
    pub request_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct MetricsConfig {
    pub enabled: bool,
    pub port: u16,
}

#[derive(Debug, Clone)]
pub struct OutputConfig {
    pub format: String,
    pub colored: bool,
    pub quiet: bool,
    pub max_printed: Option<u64>,
    pub controls: bool,
}

impl Config {
    /// Defaults for everything except the host.
    pub fn for_host(host: Url) -> Self {
        Config {
            stream: StreamConfig {
                host,
                tenant: None,
                filters: StreamFilters::default(),
                client_side_filters: ClientSideFilters::default(),
                connect_timeout: Duration::from_secs(30),
            },
            batch: BatchConfig {
                max_batch_size: DEFAULT_MAX_BATCH_SIZE,
                max_batch_age: DEFAULT_MAX_BATCH_AGE,
            },
            buffer: BufferConfig {
                max_events: DEFAULT_MAX_EVENTS,
                retained_events: DEFAULT_RETAINED_EVENTS,
            },
            stats: StatsConfig {
                poll_interval: Some(DEFAULT_STATS_INTERVAL),
                request_timeout: Duration::from_secs(5),
            },
            metrics: MetricsConfig {
                enabled: false,
                port: 9090,
            },
            output: OutputConfig {
                format: "table".to_string(),
                colored: true,
                quiet: false,
                max_printed: None,
                controls: true,
            },
        }
    }

    pub fn with_tenant(mut self, team_id: u64, token: impl Into<String>) -> Self {
        self.stream.tenant = Some(TenantContext {
            team_id,
            token: token.into(),
        });
        self
    }

    pub fn from_args(args: &Args) -> Result<Self> {
        let host = Url::parse(&args.host)?;

        let tenant = match (args.team_id, args.token.as_deref()) {
            (Some(team_id), Some(token)) if !token.is_empty() => Some(TenantContext {
                team_id,
                token: token.to_string(),
            }),
            (None, None) => None,
            _ => {
                return Err(LiveEventsError::InvalidConfig(
                    "--team-id and --token must be given together".to_string(),
                )
                .into());
            }
        };

        let client_side_filters = args
            .filters
            .iter()
            .map(|expr| ClientSideFilters::parse_pair(expr))
            .collect::<Result<ClientSideFilters, _>>()?;

        let config = Config {
            stream: StreamConfig {
                host,
                tenant,
                filters: StreamFilters {
                    event_type: args.event_type.clone().filter(|t| !t.is_empty()),
                },
                client_side_filters,
                connect_timeout: Duration::from_secs(args.timeout),
            },
            batch: BatchConfig {
                max_batch_size: args.batch_size,
                max_batch_age: Duration::from_millis(args.batch_window_ms),
            },
            buffer: BufferConfig {
                max_events: args.max_events,
                retained_events: args.retained_events,
            },
            stats: StatsConfig {
                poll_interval: (args.stats_interval_ms > 0)
                    .then(|| Duration::from_millis(args.stats_interval_ms)),
                request_timeout: Duration::from_secs(args.timeout.min(10)),
            },
            metrics: MetricsConfig {
                enabled: args.metrics,
                port: args.metrics_port,
            },
            output: OutputConfig {
                format: args.format.clone(),
                colored: !args.no_color,
                quiet: args.quiet,
                max_printed: (args.max_printed > 0).then_some(args.max_printed),
                controls: !args.no_controls,
            },
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), LiveEventsError> {
        if self.batch.max_batch_size == 0 {
            return Err(LiveEventsError::InvalidConfig(
                "batch size must be at least 1".to_string(),
            ));
        }
        if self.buffer.max_events == 0 {
            return Err(LiveEventsError::InvalidConfig(
                "max events must be at least 1".to_string(),
            ));
        }
        if self.buffer.retained_events > self.buffer.max_events {
            return Err(LiveEventsError::InvalidConfig(format!(
                "retained events ({}) cannot exceed max events ({})",
                self.buffer.retained_events, self.buffer.max_events
            )));
        }
        if self.stream.host.cannot_be_a_base() {
            return Err(LiveEventsError::InvalidConfig(format!(
                "host {} is not a base URL",
                self.stream.host
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;
    use serde_json::json;

    fn args(extra: &[&str]) -> Args {
        let mut argv = vec!["live-events", "--host", "https://live.example.com"];
        argv.extend_from_slice(extra);
        Args::parse_from(argv)
    }

    #[test]
    fn defaults_match_stream_behaviour() {
        let config = Config::from_args(&args(&[])).unwrap();

        assert!(config.stream.tenant.is_none());
        assert_eq!(config.batch.max_batch_size, 10);
        assert_eq!(config.batch.max_batch_age, Duration::from_millis(300));
        assert_eq!(config.buffer.max_events, 500);
        assert_eq!(config.buffer.retained_events, 400);
        assert_eq!(config.stats.poll_interval, Some(Duration::from_millis(1500)));
    }

    #[test]
    fn tenant_and_filters_are_parsed() {
        let config = Config::from_args(&args(&[
            "--team-id",
            "2",
            "--token",
            "abc",
            "--event-type",
            "$pageview",
            "-f",
            "distinct_id=user-1",
            "-f",
            "team_id=2",
        ]))
        .unwrap();

        let tenant = config.stream.tenant.unwrap();
        assert_eq!(tenant.team_id, 2);
        assert_eq!(tenant.token, "abc");
        assert_eq!(config.stream.filters.event_type.as_deref(), Some("$pageview"));
        assert_eq!(config.stream.client_side_filters.len(), 2);
        assert_eq!(
            config
                .stream
                .client_side_filters
                .iter()
                .find(|(k, _)| k.as_str() == "team_id")
                .map(|(_, v)| v.clone()),
            Some(json!(2))
        );
    }

    #[test]
    fn rejects_half_a_tenant_and_bad_buffer_sizes() {
        assert!(Config::from_args(&args(&["--team-id", "2"])).is_err());
        assert!(Config::from_args(&args(&["--max-events", "10", "--retained-events", "20"])).is_err());
        assert!(Config::from_args(&args(&["--batch-size", "0"])).is_err());
        assert!(Config::from_args(&args(&["-f", "nokey"])).is_err());
    }

    #[test]
    fn zero_interval_disables_stats() {
        let config = Config::from_args(&args(&["--stats-interval-ms", "0"])).unwrap();
        assert!(config.stats.poll_interval.is_none());
    }
}
