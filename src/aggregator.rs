// file: src/aggregator.rs
// description: live event stream aggregator: owns the connection, batches arrivals,
// runs the stats poller and serves consumer commands

use crate::{
    buffer::{BatchPolicy, EventBuffer},
    config::Config,
    error::{LiveEventsError, Result},
    events::{AggregatorEvent, EventSender},
    live_state::{FlushOutcome, LiveState, SharedLiveState},
    monitoring::{
        BUFFER_SIZE_GAUGE, CONNECTED_GAUGE, CONNECTION_ERROR_COUNTER, EVENTS_FLUSHED_COUNTER,
        FLUSH_COUNTER, HealthStatus, MALFORMED_COUNTER, MESSAGES_RECEIVED_COUNTER,
        STATS_POLL_FAILURE_COUNTER,
    },
    subscription::{StreamEnvelope, StreamMessage, StreamReceiver, StreamSender, Subscription, subscribe},
    transport::LiveEventsApi,
    types::{ClientSideFilters, ConnectionState, FilterUpdate, LiveEvent, Stats, TenantContext},
};
use std::{sync::Arc, time::Duration};
use tokio::{
    sync::{Mutex, mpsc, oneshot},
    task::{JoinError, JoinSet},
    time::{Instant, Interval, MissedTickBehavior, interval_at},
};
use tracing::{debug, error, info, trace, warn};

const COMMAND_CHANNEL_CAPACITY: usize = 64;
const STREAM_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug)]
pub enum Command {
    Pause,
    Resume,
    SetFilters(FilterUpdate),
    SetClientSideFilters(ClientSideFilters),
    ClearEvents,
    PollStats,
    Shutdown,
}

#[derive(Debug)]
struct Request {
    command: Command,
    done: oneshot::Sender<()>,
}

/// Consumer side of the aggregator. Cheap to clone; reads go straight to the
/// shared state, actions are queued and resolve once applied.
#[derive(Clone)]
pub struct LiveEventsHandle {
    commands: mpsc::Sender<Request>,
    state: SharedLiveState,
}

impl LiveEventsHandle {
    async fn request(&self, command: Command) -> Result<()> {
        let (done, applied) = oneshot::channel();
        self.commands
            .send(Request { command, done })
            .await
            .map_err(|_| LiveEventsError::AggregatorStopped)?;
        applied.await.map_err(|_| LiveEventsError::AggregatorStopped)
    }

    pub async fn pause_stream(&self) -> Result<()> {
        self.request(Command::Pause).await
    }

    pub async fn resume_stream(&self) -> Result<()> {
        self.request(Command::Resume).await
    }

    pub async fn set_filters(&self, update: FilterUpdate) -> Result<()> {
        self.request(Command::SetFilters(update)).await
    }

    pub async fn set_client_side_filters(&self, filters: ClientSideFilters) -> Result<()> {
        self.request(Command::SetClientSideFilters(filters)).await
    }

    pub async fn clear_events(&self) -> Result<()> {
        self.request(Command::ClearEvents).await
    }

    /// Fire one stats poll now, outside the regular cadence.
    pub async fn poll_stats(&self) -> Result<()> {
        self.request(Command::PollStats).await
    }

    pub async fn shutdown(&self) -> Result<()> {
        self.request(Command::Shutdown).await
    }

    pub async fn events(&self) -> Vec<Arc<LiveEvent>> {
        self.state.lock().await.events()
    }

    pub async fn filtered_events(&self) -> Vec<Arc<LiveEvent>> {
        self.state.lock().await.filtered_events()
    }

    pub async fn event_count(&self) -> usize {
        self.state.lock().await.event_count()
    }

    /// Events received but not yet published.
    pub async fn pending_count(&self) -> usize {
        self.state.lock().await.pending_count()
    }

    pub async fn current_event_properties(&self) -> Vec<String> {
        self.state.lock().await.current_event_properties()
    }

    pub async fn client_side_filters(&self) -> ClientSideFilters {
        self.state.lock().await.client_side_filters.clone()
    }

    pub async fn stats(&self) -> Stats {
        self.state.lock().await.stats.clone()
    }

    pub async fn stream_paused(&self) -> bool {
        self.state.lock().await.stream_paused
    }

    pub async fn connection_state(&self) -> ConnectionState {
        self.state.lock().await.connection_state
    }

    pub async fn health(&self) -> HealthStatus {
        HealthStatus::from_state(&*self.state.lock().await)
    }
}

pub struct LiveEventsAggregator {
    api: Arc<dyn LiveEventsApi>,
    tenant: Option<TenantContext>,
    state: SharedLiveState,
    subscription: Option<Subscription>,
    stream_tx: StreamSender,
    stream_rx: StreamReceiver,
    commands: mpsc::Receiver<Request>,
    event_sender: EventSender,
    stats_interval: Option<Duration>,
    stats_polls: JoinSet<Result<Stats>>,
}

impl LiveEventsAggregator {
    pub fn new(
        config: &Config,
        api: Arc<dyn LiveEventsApi>,
        event_sender: EventSender,
    ) -> (Self, LiveEventsHandle) {
        let mut state = LiveState::new(
            BatchPolicy {
                max_batch_size: config.batch.max_batch_size,
                max_batch_age: config.batch.max_batch_age,
            },
            EventBuffer::new(config.buffer.max_events, config.buffer.retained_events),
        );
        state.filters = config.stream.filters.clone();
        state.client_side_filters = config.stream.client_side_filters.clone();
        let state = Arc::new(Mutex::new(state));

        let (command_tx, command_rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        let (stream_tx, stream_rx) = mpsc::channel(STREAM_CHANNEL_CAPACITY);

        let aggregator = Self {
            api,
            tenant: config.stream.tenant.clone(),
            state: state.clone(),
            subscription: None,
            stream_tx,
            stream_rx,
            commands: command_rx,
            event_sender,
            stats_interval: config.stats.poll_interval,
            stats_polls: JoinSet::new(),
        };
        let handle = LiveEventsHandle {
            commands: command_tx,
            state,
        };
        (aggregator, handle)
    }

    pub fn state(&self) -> SharedLiveState {
        self.state.clone()
    }

    /// Main loop. Returns once shut down or once every handle is dropped.
    pub async fn run(mut self) -> Result<()> {
        self.emit(AggregatorEvent::Starting);
        self.connect().await;

        let mut ticker = self.stats_interval.map(|period| {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker
        });

        loop {
            tokio::select! {
                request = self.commands.recv() => {
                    let Some(Request { command, done }) = request else {
                        debug!("All handles dropped, stopping aggregator");
                        self.shutdown().await;
                        break;
                    };
                    let stop = matches!(command, Command::Shutdown);
                    self.execute(command).await;
                    let _ = done.send(());
                    if stop {
                        break;
                    }
                }
                Some(envelope) = self.stream_rx.recv() => {
                    self.handle_stream(envelope).await;
                }
                _ = next_tick(&mut ticker) => {
                    self.poll_stats();
                }
                Some(result) = self.stats_polls.join_next(), if !self.stats_polls.is_empty() => {
                    self.apply_stats(result).await;
                }
            }
        }

        Ok(())
    }

    async fn execute(&mut self, command: Command) {
        debug!(?command, "Executing command");
        match command {
            Command::Pause => self.pause().await,
            Command::Resume => self.resume().await,
            Command::SetFilters(update) => self.set_filters(update).await,
            Command::SetClientSideFilters(filters) => {
                self.state.lock().await.set_client_side_filters(filters);
            }
            Command::ClearEvents => self.clear_events().await,
            Command::PollStats => self.poll_stats(),
            Command::Shutdown => self.shutdown().await,
        }
    }

    /// Open a connection with the current filters, closing any previous one
    /// first. Does nothing while paused or without a tenant context.
    pub async fn connect(&mut self) -> bool {
        self.close_subscription().await;

        let Some(tenant) = self.tenant.clone() else {
            debug!("No tenant context, live events stream not started");
            return false;
        };

        let (connection_id, filters) = {
            let mut state = self.state.lock().await;
            if state.stream_paused {
                debug!("Stream paused, not connecting");
                return false;
            }
            (state.begin_connection(), state.filters.clone())
        };

        info!(
            connection_id = %connection_id,
            team_id = tenant.team_id,
            event_type = ?filters.event_type,
            "Connecting to live events stream"
        );
        self.emit(AggregatorEvent::Connecting {
            connection_id: connection_id.clone(),
            event_type: filters.event_type.clone(),
        });
        self.emit(AggregatorEvent::StateChanged(ConnectionState::Connecting));

        self.subscription = Some(subscribe(
            self.api.clone(),
            tenant,
            filters,
            connection_id,
            self.stream_tx.clone(),
        ));
        true
    }

    async fn close_subscription(&mut self) {
        let Some(subscription) = self.subscription.take() else {
            return;
        };
        subscription.cancel();

        let dropped = {
            let mut state = self.state.lock().await;
            if state.is_current(subscription.connection_id()) {
                state.close_connection()
            } else {
                0
            }
        };
        CONNECTED_GAUGE.set(0.0);

        debug!(
            connection_id = subscription.connection_id(),
            dropped_pending = dropped,
            "Closed live events connection"
        );
    }

    pub async fn pause(&mut self) {
        self.close_subscription().await;
        self.state.lock().await.pause();
        info!("Live events stream paused");
        self.emit(AggregatorEvent::StateChanged(ConnectionState::Paused));
    }

    pub async fn resume(&mut self) {
        self.state.lock().await.resume();
        info!("Resuming live events stream");
        if !self.connect().await {
            let state = self.state.lock().await.connection_state;
            self.emit(AggregatorEvent::StateChanged(state));
        }
    }

    /// Drop everything buffered under the old filters, then reconnect.
    pub async fn set_filters(&mut self, update: FilterUpdate) {
        {
            let mut state = self.state.lock().await;
            state.apply_filters(update);
            BUFFER_SIZE_GAUGE.set(0.0);
            info!(event_type = ?state.filters.event_type, "Stream filters changed");
        }
        self.emit(AggregatorEvent::EventsCleared);
        self.connect().await;
    }

    pub async fn clear_events(&mut self) {
        self.state.lock().await.clear_events();
        BUFFER_SIZE_GAUGE.set(0.0);
        self.emit(AggregatorEvent::EventsCleared);
    }

    /// Start one stats fetch without waiting for earlier ones to finish.
    pub fn poll_stats(&mut self) {
        let Some(tenant) = self.tenant.clone() else {
            trace!("No tenant context, skipping stats poll");
            return;
        };
        let api = self.api.clone();
        self.stats_polls
            .spawn(async move { api.fetch_stats(&tenant).await });
    }

    async fn apply_stats(&mut self, result: std::result::Result<Result<Stats>, JoinError>) {
        match result {
            Ok(Ok(stats)) => {
                trace!(users_on_product = ?stats.users_on_product, "Stats updated");
                self.state.lock().await.set_stats(stats.clone());
                self.emit(AggregatorEvent::StatsUpdated(stats));
            }
            Ok(Err(e)) => {
                STATS_POLL_FAILURE_COUNTER.increment(1);
                warn!(error = %e, "Failed to poll stats");
            }
            Err(e) if e.is_cancelled() => {}
            Err(e) => {
                STATS_POLL_FAILURE_COUNTER.increment(1);
                error!(error = %e, "Stats poll task failed");
            }
        }
    }

    /// Apply one message from a connection. Messages from anything but the
    /// current connection are dropped. A clean end of stream publishes the
    /// pending batch even when neither flush rule has fired; a failure
    /// discards it.
    pub async fn handle_stream(&mut self, envelope: StreamEnvelope) {
        let StreamEnvelope {
            connection_id,
            message,
        } = envelope;
        let mut state = self.state.lock().await;

        if !state.is_current(&connection_id) {
            state.record_stale_message();
            trace!(connection_id = %connection_id, "Dropping message from closed connection");
            return;
        }

        match message {
            StreamMessage::Opened => {
                state.mark_connected();
                drop(state);
                CONNECTED_GAUGE.set(1.0);
                self.emit(AggregatorEvent::Connected { connection_id });
                self.emit(AggregatorEvent::StateChanged(ConnectionState::Connected));
            }
            StreamMessage::Payload(raw) => {
                MESSAGES_RECEIVED_COUNTER.increment(1);
                let result = state.on_message(&raw, Instant::now());
                drop(state);
                match result {
                    Ok(Some(outcome)) => self.publish(outcome),
                    Ok(None) => {}
                    Err(e) => self.report_malformed(e),
                }
            }
            StreamMessage::Malformed(e) => {
                MESSAGES_RECEIVED_COUNTER.increment(1);
                state.record_malformed();
                drop(state);
                self.report_malformed(e);
            }
            StreamMessage::Failed(e) => {
                state.mark_errored();
                drop(state);
                self.subscription = None;
                CONNECTION_ERROR_COUNTER.increment(1);
                CONNECTED_GAUGE.set(0.0);
                error!(error = %e, "Live events stream connection failed");
                self.emit(AggregatorEvent::ConnectionFailed(format!(
                    "Failed to connect to live events stream ({e}). Resume or change filters to try again."
                )));
                self.emit(AggregatorEvent::StateChanged(ConnectionState::Errored));
            }
            StreamMessage::Ended => {
                // a cleanly closed stream has nothing stale pending
                let outcome = state.flush(Instant::now());
                state.close_connection();
                drop(state);
                self.subscription = None;
                CONNECTED_GAUGE.set(0.0);
                if let Some(outcome) = outcome {
                    self.publish(outcome);
                }
                self.emit(AggregatorEvent::StreamEnded);
                self.emit(AggregatorEvent::StateChanged(ConnectionState::Disconnected));
            }
        }
    }

    fn report_malformed(&self, e: LiveEventsError) {
        MALFORMED_COUNTER.increment(1);
        warn!(error = %e, "Dropping malformed live event payload");
        self.emit(AggregatorEvent::MalformedPayload {
            reason: e.to_string(),
        });
    }

    fn publish(&self, outcome: FlushOutcome) {
        FLUSH_COUNTER.increment(1);
        EVENTS_FLUSHED_COUNTER.increment(outcome.batch.len() as u64);
        BUFFER_SIZE_GAUGE.set(outcome.buffered as f64);
        debug!(
            flushed = outcome.batch.len(),
            buffered = outcome.buffered,
            truncated = outcome.truncated,
            "Published event batch"
        );
        self.emit(AggregatorEvent::EventsFlushed {
            batch: outcome.batch,
            buffered: outcome.buffered,
            truncated: outcome.truncated,
        });
    }

    /// Close the connection and cancel outstanding stats polls.
    pub async fn shutdown(&mut self) {
        self.close_subscription().await;
        self.stats_polls.abort_all();
        info!("Live events aggregator stopped");
        self.emit(AggregatorEvent::Stopping);
    }

    fn emit(&self, event: AggregatorEvent) {
        match self.event_sender.try_send(event) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(event)) => {
                debug!(?event, "Notification channel full, dropping notification");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                trace!("Notification receiver gone");
            }
        }
    }
}

async fn next_tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{events::create_event_channel, transport::LineStream, types::StreamFilters};
    use async_trait::async_trait;
    use url::Url;

    struct SilentApi;

    #[async_trait]
    impl LiveEventsApi for SilentApi {
        async fn open_stream(&self, _: &TenantContext, _: &StreamFilters) -> Result<LineStream> {
            Ok(Box::pin(futures::stream::pending::<Result<String>>()))
        }

        async fn fetch_stats(&self, _: &TenantContext) -> Result<Stats> {
            Ok(Stats::default())
        }
    }

    fn aggregator(with_tenant: bool) -> (LiveEventsAggregator, LiveEventsHandle) {
        let mut config = Config::for_host(Url::parse("http://live.test").unwrap());
        if with_tenant {
            config = config.with_tenant(2, "tok");
        }
        let (tx, _rx) = create_event_channel();
        LiveEventsAggregator::new(&config, Arc::new(SilentApi), tx)
    }

    fn payload(connection_id: &str, raw: &str) -> StreamEnvelope {
        StreamEnvelope {
            connection_id: connection_id.to_string(),
            message: StreamMessage::Payload(raw.to_string()),
        }
    }

    #[tokio::test]
    async fn messages_from_a_replaced_connection_are_ignored() {
        let (mut aggregator, handle) = aggregator(true);

        assert!(aggregator.connect().await);
        let first = aggregator.state.lock().await.connection_id.clone().unwrap();
        assert!(aggregator.connect().await);
        let second = aggregator.state.lock().await.connection_id.clone().unwrap();
        assert_ne!(first, second);

        aggregator.handle_stream(payload(&first, r#"{"event":"old"}"#)).await;
        assert_eq!(handle.event_count().await, 0);
        assert_eq!(aggregator.state.lock().await.stale_messages_dropped, 1);

        aggregator.handle_stream(payload(&second, r#"{"event":"new"}"#)).await;
        assert_eq!(handle.event_count().await, 1);
        assert_eq!(handle.events().await[0].event, "new");
    }

    #[tokio::test]
    async fn unreadable_lines_are_counted_and_skipped() {
        let (mut aggregator, handle) = aggregator(true);
        aggregator.connect().await;
        let id = aggregator.state.lock().await.connection_id.clone().unwrap();

        aggregator
            .handle_stream(StreamEnvelope {
                connection_id: id.clone(),
                message: StreamMessage::Malformed(LiveEventsError::malformed(
                    "invalid UTF-8",
                    "{\"event\":\"a\u{fffd}\"}",
                )),
            })
            .await;
        assert_eq!(handle.event_count().await, 0);
        assert_eq!(aggregator.state.lock().await.malformed_payloads, 1);
        assert_eq!(handle.connection_state().await, ConnectionState::Connecting);

        aggregator.handle_stream(payload(&id, r#"{"event":"b"}"#)).await;
        assert_eq!(handle.event_count().await, 1);
    }

    #[tokio::test]
    async fn connect_without_tenant_does_nothing() {
        let (mut aggregator, handle) = aggregator(false);

        assert!(!aggregator.connect().await);
        assert!(aggregator.subscription.is_none());
        assert_eq!(handle.connection_state().await, ConnectionState::Disconnected);

        aggregator.poll_stats();
        assert!(aggregator.stats_polls.is_empty());
    }

    #[tokio::test]
    async fn pause_rejects_queued_messages_and_blocks_connect() {
        let (mut aggregator, handle) = aggregator(true);
        aggregator.connect().await;
        let id = aggregator.state.lock().await.connection_id.clone().unwrap();

        aggregator.pause().await;
        assert!(aggregator.subscription.is_none());
        assert!(handle.stream_paused().await);

        aggregator.handle_stream(payload(&id, r#"{"event":"late"}"#)).await;
        assert_eq!(handle.event_count().await, 0);

        // filter changes while paused clear the buffer but stay disconnected
        aggregator.set_filters(FilterUpdate::event_type("$pageview")).await;
        assert!(aggregator.subscription.is_none());
        assert_eq!(handle.connection_state().await, ConnectionState::Paused);

        aggregator.resume().await;
        assert!(aggregator.subscription.is_some());
        assert_eq!(handle.connection_state().await, ConnectionState::Connecting);
    }
}
