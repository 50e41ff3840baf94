use crate::{error::LiveEventsError, live_state::LiveState, types::ConnectionState};
use anyhow::Result;
use metrics::{Counter, Gauge, counter, gauge};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::{net::SocketAddr, sync::LazyLock};
use tracing::{error, info};

// Global metrics
pub static MESSAGES_RECEIVED_COUNTER: LazyLock<Counter> =
    LazyLock::new(|| counter!("live_events_messages_received_total"));
pub static EVENTS_FLUSHED_COUNTER: LazyLock<Counter> =
    LazyLock::new(|| counter!("live_events_events_flushed_total"));
pub static FLUSH_COUNTER: LazyLock<Counter> =
    LazyLock::new(|| counter!("live_events_flushes_total"));
pub static MALFORMED_COUNTER: LazyLock<Counter> =
    LazyLock::new(|| counter!("live_events_malformed_payloads_total"));
pub static CONNECTION_ERROR_COUNTER: LazyLock<Counter> =
    LazyLock::new(|| counter!("live_events_connection_errors_total"));
pub static STATS_POLL_FAILURE_COUNTER: LazyLock<Counter> =
    LazyLock::new(|| counter!("live_events_stats_poll_failures_total"));
pub static BUFFER_SIZE_GAUGE: LazyLock<Gauge> =
    LazyLock::new(|| gauge!("live_events_buffer_size"));
pub static CONNECTED_GAUGE: LazyLock<Gauge> = LazyLock::new(|| gauge!("live_events_connected"));

pub async fn setup_metrics(port: u16) -> Result<()> {
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();

    let builder = PrometheusBuilder::new()
        .with_http_listener(addr)
        .add_global_label("service", "live-events")
        .add_global_label("version", env!("CARGO_PKG_VERSION"));

    match builder.install() {
        Ok(_handle) => {
            info!(
                "Prometheus metrics server started on http://{}/metrics",
                addr
            );

            MESSAGES_RECEIVED_COUNTER.absolute(0);
            EVENTS_FLUSHED_COUNTER.absolute(0);
            FLUSH_COUNTER.absolute(0);
            MALFORMED_COUNTER.absolute(0);
            CONNECTION_ERROR_COUNTER.absolute(0);
            STATS_POLL_FAILURE_COUNTER.absolute(0);
            BUFFER_SIZE_GAUGE.set(0.0);
            CONNECTED_GAUGE.set(0.0);

            Ok(())
        }
        Err(e) => {
            error!("Failed to start metrics server: {}", e);
            Err(LiveEventsError::MetricsError(e.to_string()).into())
        }
    }
}

#[derive(Debug)]
pub struct HealthStatus {
    pub is_healthy: bool,
    pub connection_state: ConnectionState,
    pub stream_paused: bool,
    pub buffered_events: usize,
    pub total_messages: u64,
    pub malformed_payloads: u64,
    pub connection_errors: u64,
    pub seconds_since_last_message: Option<u64>,
}

impl HealthStatus {
    /// A paused stream counts as healthy; an errored one does not.
    pub fn from_state(state: &LiveState) -> Self {
        let is_healthy = matches!(
            state.connection_state,
            ConnectionState::Connected | ConnectionState::Connecting | ConnectionState::Paused
        );

        Self {
            is_healthy,
            connection_state: state.connection_state,
            stream_paused: state.stream_paused,
            buffered_events: state.event_count(),
            total_messages: state.total_messages_received,
            malformed_payloads: state.malformed_payloads,
            connection_errors: state.connection_errors,
            seconds_since_last_message: state.last_message_time.map(|t| t.elapsed().as_secs()),
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "status": if self.is_healthy { "healthy" } else { "unhealthy" },
            "connection_state": self.connection_state.to_string(),
            "stream_paused": self.stream_paused,
            "buffered_events": self.buffered_events,
            "total_messages": self.total_messages,
            "malformed_payloads": self.malformed_payloads,
            "connection_errors": self.connection_errors,
            "seconds_since_last_message": self.seconds_since_last_message,
            "timestamp": chrono::Utc::now()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errored_stream_is_unhealthy() {
        let mut state = LiveState::default();
        state.mark_errored();

        let health = HealthStatus::from_state(&state);
        assert!(!health.is_healthy);
        assert_eq!(health.to_json()["status"], "unhealthy");
        assert_eq!(health.to_json()["connection_state"], "errored");
    }

    #[test]
    fn paused_stream_is_healthy() {
        let mut state = LiveState::default();
        state.pause();

        let health = HealthStatus::from_state(&state);
        assert!(health.is_healthy);
        assert_eq!(health.to_json()["stream_paused"], true);
    }
}
