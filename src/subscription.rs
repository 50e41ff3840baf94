// file: src/subscription.rs
// description: one cancellable push connection feeding the aggregator

use crate::{
    error::LiveEventsError,
    transport::LiveEventsApi,
    types::{StreamFilters, TenantContext},
};
use futures::StreamExt;
use std::sync::Arc;
use tokio::{sync::mpsc, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

#[derive(Debug)]
pub enum StreamMessage {
    /// The server accepted the request.
    Opened,
    Payload(String),
    /// One line could not be read. The connection stays open.
    Malformed(LiveEventsError),
    Failed(LiveEventsError),
    /// The server closed the body cleanly.
    Ended,
}

/// A stream message tagged with the connection it came from, so the
/// aggregator can ignore anything sent by a connection it already closed.
#[derive(Debug)]
pub struct StreamEnvelope {
    pub connection_id: String,
    pub message: StreamMessage,
}

pub type StreamSender = mpsc::Sender<StreamEnvelope>;
pub type StreamReceiver = mpsc::Receiver<StreamEnvelope>;

/// Handle to a running connection. Cancelling or dropping it stops the
/// reader task.
#[derive(Debug)]
pub struct Subscription {
    connection_id: String,
    token: CancellationToken,
    task: JoinHandle<()>,
}

impl Subscription {
    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn cancel(&self) {
        if !self.token.is_cancelled() {
            debug!(connection_id = %self.connection_id, "Cancelling subscription");
            self.token.cancel();
        }
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

/// Open a connection in the background and forward what it yields to `sink`.
pub fn subscribe(
    api: Arc<dyn LiveEventsApi>,
    tenant: TenantContext,
    filters: StreamFilters,
    connection_id: String,
    sink: StreamSender,
) -> Subscription {
    let token = CancellationToken::new();
    let cancelled = token.clone();
    let id = connection_id.clone();

    let task = tokio::spawn(async move {
        tokio::select! {
            biased;
            _ = cancelled.cancelled() => {
                debug!(connection_id = %id, "Subscription closed");
            }
            _ = pump(api, tenant, filters, &id, &sink) => {}
        }
    });

    Subscription {
        connection_id,
        token,
        task,
    }
}

async fn pump(
    api: Arc<dyn LiveEventsApi>,
    tenant: TenantContext,
    filters: StreamFilters,
    connection_id: &str,
    sink: &StreamSender,
) {
    let forward = |message: StreamMessage| StreamEnvelope {
        connection_id: connection_id.to_string(),
        message,
    };

    let mut lines = match api.open_stream(&tenant, &filters).await {
        Ok(lines) => lines,
        Err(e) => {
            warn!(connection_id, error = %e, "Failed to open live events stream");
            let _ = sink.send(forward(StreamMessage::Failed(e))).await;
            return;
        }
    };

    info!(connection_id, team_id = tenant.team_id, event_type = ?filters.event_type, "Live events stream open");
    if sink.send(forward(StreamMessage::Opened)).await.is_err() {
        return;
    }

    while let Some(item) = lines.next().await {
        let message = match item {
            Ok(line) => {
                trace!(connection_id, bytes = line.len(), "Stream payload");
                StreamMessage::Payload(line)
            }
            Err(e @ LiveEventsError::MalformedPayload { .. }) => StreamMessage::Malformed(e),
            Err(e) => {
                warn!(connection_id, error = %e, "Live events stream failed");
                let _ = sink.send(forward(StreamMessage::Failed(e))).await;
                return;
            }
        };
        if sink.send(forward(message)).await.is_err() {
            debug!(connection_id, "Aggregator gone, stopping reader");
            return;
        }
    }

    info!(connection_id, "Live events stream ended");
    let _ = sink.send(forward(StreamMessage::Ended)).await;
}
