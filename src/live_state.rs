/// file: src/live_state.rs
/// description: live stream state kept apart from the connection plumbing
use crate::{
    buffer::{BatchPolicy, EventBuffer, PendingBatch},
    error::LiveEventsError,
    types::{ClientSideFilters, ConnectionState, FilterUpdate, LiveEvent, Stats, StreamFilters},
};
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::time::Instant;

/// Result of publishing the pending batch into the buffer.
#[derive(Debug, Clone, PartialEq)]
pub struct FlushOutcome {
    /// The published events, in arrival order.
    pub batch: Vec<Arc<LiveEvent>>,
    pub buffered: usize,
    pub truncated: bool,
}

#[derive(Debug)]
pub struct LiveState {
    /// Id of the connection whose messages are accepted. `None` while closed.
    pub connection_id: Option<String>,
    pub connection_state: ConnectionState,
    pub stream_paused: bool,
    pub filters: StreamFilters,
    pub client_side_filters: ClientSideFilters,
    pub stats: Stats,
    pub last_message_time: Option<Instant>,
    pub last_batch_time: Option<Instant>,

    // counters
    pub total_messages_received: u64,
    pub total_events_flushed: u64,
    pub malformed_payloads: u64,
    pub stale_messages_dropped: u64,
    pub connection_errors: u64,

    events: EventBuffer<LiveEvent>,
    pending: PendingBatch<LiveEvent>,
    policy: BatchPolicy,
}

impl Default for LiveState {
    fn default() -> Self {
        Self::new(BatchPolicy::default(), EventBuffer::default())
    }
}

impl LiveState {
    pub fn new(policy: BatchPolicy, events: EventBuffer<LiveEvent>) -> Self {
        Self {
            connection_id: None,
            connection_state: ConnectionState::Disconnected,
            stream_paused: false,
            filters: StreamFilters::default(),
            client_side_filters: ClientSideFilters::default(),
            stats: Stats::default(),
            last_message_time: None,
            last_batch_time: None,
            total_messages_received: 0,
            total_events_flushed: 0,
            malformed_payloads: 0,
            stale_messages_dropped: 0,
            connection_errors: 0,
            events,
            pending: PendingBatch::default(),
            policy,
        }
    }

    /// Start tracking a fresh connection. Anything pending from the previous
    /// one is dropped.
    pub fn begin_connection(&mut self) -> String {
        let id = uuid::Uuid::new_v4().to_string();
        self.pending.discard();
        self.connection_id = Some(id.clone());
        self.connection_state = ConnectionState::Connecting;
        id
    }

    /// Stop accepting messages from the current connection.
    pub fn close_connection(&mut self) -> usize {
        self.connection_id = None;
        if self.connection_state != ConnectionState::Errored {
            self.connection_state = ConnectionState::Disconnected;
        }
        self.pending.discard()
    }

    pub fn is_current(&self, connection_id: &str) -> bool {
        self.connection_id.as_deref() == Some(connection_id)
    }

    pub fn mark_connected(&mut self) {
        self.connection_state = ConnectionState::Connected;
    }

    pub fn mark_errored(&mut self) {
        self.connection_errors += 1;
        self.connection_id = None;
        self.pending.discard();
        self.connection_state = ConnectionState::Errored;
    }

    /// Count a line the transport could not read.
    pub fn record_malformed(&mut self) {
        self.total_messages_received += 1;
        self.malformed_payloads += 1;
    }

    pub fn record_stale_message(&mut self) {
        self.stale_messages_dropped += 1;
    }

    /// Parse one payload and apply the flush rule. A payload that fails to
    /// parse is counted and dropped; it never reaches the batch.
    pub fn on_message(
        &mut self,
        raw: &str,
        now: Instant,
    ) -> Result<Option<FlushOutcome>, LiveEventsError> {
        self.total_messages_received += 1;
        self.last_message_time = Some(now);

        let event = match LiveEvent::parse(raw) {
            Ok(event) => event,
            Err(e) => {
                self.malformed_payloads += 1;
                return Err(e);
            }
        };

        self.pending.push(Arc::new(event));
        if self
            .policy
            .should_flush(self.pending.len(), self.last_batch_time, now)
        {
            return Ok(self.flush(now));
        }
        Ok(None)
    }

    /// Publish the pending batch. The batch timestamp only moves when
    /// something was actually published.
    pub fn flush(&mut self, now: Instant) -> Option<FlushOutcome> {
        let batch = self.pending.take();
        if batch.is_empty() {
            return None;
        }

        self.total_events_flushed += batch.len() as u64;
        let truncated = self.events.prepend_batch(batch.clone());
        self.last_batch_time = Some(now);

        Some(FlushOutcome {
            batch,
            buffered: self.events.len(),
            truncated,
        })
    }

    pub fn pause(&mut self) {
        self.close_connection();
        self.stream_paused = true;
        self.connection_state = ConnectionState::Paused;
    }

    pub fn resume(&mut self) {
        self.stream_paused = false;
        if self.connection_state == ConnectionState::Paused {
            self.connection_state = ConnectionState::Disconnected;
        }
    }

    /// Clears the buffer and merges the new server-side filters.
    pub fn apply_filters(&mut self, update: FilterUpdate) {
        self.events.clear();
        self.filters.merge(update);
    }

    pub fn clear_events(&mut self) {
        self.events.clear();
    }

    pub fn set_client_side_filters(&mut self, filters: ClientSideFilters) {
        self.client_side_filters = filters;
    }

    pub fn set_stats(&mut self, stats: Stats) {
        self.stats = stats;
    }

    pub fn events(&self) -> Vec<Arc<LiveEvent>> {
        self.events.to_vec()
    }

    pub fn filtered_events(&self) -> Vec<Arc<LiveEvent>> {
        if self.client_side_filters.is_empty() {
            return self.events();
        }
        self.events
            .iter()
            .filter(|event| self.client_side_filters.matches(event))
            .cloned()
            .collect()
    }

    pub fn event_count(&self) -> usize {
        self.events.len()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Distinct property keys across buffered events, sorted.
    pub fn current_event_properties(&self) -> Vec<String> {
        self.events
            .iter()
            .flat_map(|event| event.properties.keys().cloned())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }
}

pub type SharedLiveState = Arc<Mutex<LiveState>>;

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;

    fn payload(i: usize) -> String {
        json!({ "event": format!("e{i}"), "distinct_id": "d" }).to_string()
    }

    #[test]
    fn first_message_flushes_immediately() {
        let mut state = LiveState::default();
        let now = Instant::now();

        let outcome = state.on_message(&payload(0), now).unwrap().unwrap();
        assert_eq!(outcome.batch.len(), 1);
        assert_eq!(outcome.batch[0].event, "e0");
        assert_eq!(outcome.buffered, 1);
        assert!(!outcome.truncated);
        assert_eq!(state.last_batch_time, Some(now));
    }

    #[test]
    fn twelve_events_in_one_tick_flush_once_at_the_tenth() {
        let mut state = LiveState::default();
        let now = Instant::now();
        // seed a recent flush so the time rule does not fire
        state.last_batch_time = Some(now);

        let mut flushes = Vec::new();
        for i in 0..12 {
            if let Some(outcome) = state.on_message(&payload(i), now).unwrap() {
                flushes.push((i, outcome.batch.len()));
            }
        }

        assert_eq!(flushes, vec![(9, 10)]);
        assert_eq!(state.event_count(), 10);
        assert_eq!(state.pending_count(), 2);
    }

    #[test]
    fn time_rule_flushes_partial_batch_on_next_arrival() {
        let mut state = LiveState::default();
        let start = Instant::now();
        state.last_batch_time = Some(start);

        assert!(state.on_message(&payload(0), start).unwrap().is_none());
        assert!(state
            .on_message(&payload(1), start + Duration::from_millis(200))
            .unwrap()
            .is_none());

        let outcome = state
            .on_message(&payload(2), start + Duration::from_millis(301))
            .unwrap()
            .unwrap();
        assert_eq!(outcome.batch.len(), 3);
        assert_eq!(state.pending_count(), 0);
    }

    #[test]
    fn malformed_payload_is_dropped_and_counted() {
        let mut state = LiveState::default();
        let now = Instant::now();

        assert!(state.on_message("not json", now).is_err());
        assert_eq!(state.malformed_payloads, 1);
        assert_eq!(state.pending_count(), 0);
        assert_eq!(state.event_count(), 0);

        // the handler keeps working afterwards
        assert!(state.on_message(&payload(1), now).unwrap().is_some());
    }

    #[test]
    fn filters_clear_buffer_and_merge() {
        let mut state = LiveState::default();
        state.on_message(&payload(0), Instant::now()).unwrap();
        assert_eq!(state.event_count(), 1);

        state.apply_filters(FilterUpdate::event_type("$pageview"));
        assert_eq!(state.event_count(), 0);
        assert_eq!(state.filters.event_type.as_deref(), Some("$pageview"));
    }

    #[test]
    fn pause_keeps_buffer_and_drops_pending() {
        let mut state = LiveState::default();
        let now = Instant::now();
        let id = state.begin_connection();
        state.on_message(&payload(0), now).unwrap();
        state.on_message(&payload(1), now).unwrap();
        assert_eq!(state.pending_count(), 1);

        state.pause();
        assert!(!state.is_current(&id));
        assert!(state.stream_paused);
        assert_eq!(state.connection_state, ConnectionState::Paused);
        assert_eq!(state.event_count(), 1);
        assert_eq!(state.pending_count(), 0);

        state.resume();
        assert!(!state.stream_paused);
        assert_eq!(state.connection_state, ConnectionState::Disconnected);
    }

    #[test]
    fn filtered_view_and_property_keys() {
        let mut state = LiveState::default();
        let now = Instant::now();
        state
            .on_message(r#"{"event":"a","properties":{"$os":"Mac"}}"#, now)
            .unwrap();
        state.flush(now);
        state
            .on_message(r#"{"event":"b","properties":{"$browser":"Chrome","$os":"Linux"}}"#, now)
            .unwrap();
        state.flush(now);

        assert_eq!(state.filtered_events().len(), 2);
        state.set_client_side_filters(ClientSideFilters::new().with("event", json!("b")));
        let filtered = state.filtered_events();
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered[0].event, "b");

        assert_eq!(state.current_event_properties(), vec!["$browser", "$os"]);
    }

    #[test]
    fn new_connection_supersedes_old_one() {
        let mut state = LiveState::default();
        let first = state.begin_connection();
        let second = state.begin_connection();

        assert!(!state.is_current(&first));
        assert!(state.is_current(&second));
        assert_eq!(state.connection_state, ConnectionState::Connecting);
    }
}
