/// file: src/events.rs
/// description: notifications from the aggregator to whatever is displaying it
use crate::types::{ConnectionState, LiveEvent, Stats};
use std::sync::Arc;
use tokio::sync::mpsc;

#[derive(Debug, Clone)]
pub enum AggregatorEvent {
    Starting,
    Connecting {
        connection_id: String,
        event_type: Option<String>,
    },
    Connected { connection_id: String },
    /// A batch was published into the buffer, in arrival order.
    EventsFlushed {
        batch: Vec<Arc<LiveEvent>>,
        buffered: usize,
        truncated: bool,
    },
    MalformedPayload { reason: String },
    /// User-facing connection failure. Nothing is retried until the stream
    /// is resumed or the filters change.
    ConnectionFailed(String),
    StreamEnded,
    StateChanged(ConnectionState),
    StatsUpdated(Stats),
    EventsCleared,
    Stopping,
}

// Bounded so a stalled consumer cannot grow memory without limit; the
// aggregator drops notifications rather than block on a full channel.
const EVENT_CHANNEL_CAPACITY: usize = 1_024;

pub type EventSender = mpsc::Sender<AggregatorEvent>;
pub type EventReceiver = mpsc::Receiver<AggregatorEvent>;

pub fn create_event_channel() -> (EventSender, EventReceiver) {
    mpsc::channel(EVENT_CHANNEL_CAPACITY)
}
