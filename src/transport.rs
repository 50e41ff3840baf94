// file: src/transport.rs
// description: HTTP access to the live events host: push stream and stats endpoint

use crate::{
    error::{LiveEventsError, Result},
    types::{Stats, StreamFilters, TenantContext},
};
use async_trait::async_trait;
use futures::{Stream, StreamExt};
use reqwest::{Client, header};
use std::{pin::Pin, time::Duration};
use tracing::{debug, trace};
use url::Url;

/// Raw payload lines from an open stream, one event per item. A
/// `MalformedPayload` error marks one unreadable line; any other error ends
/// the stream.
pub type LineStream = Pin<Box<dyn Stream<Item = Result<String>> + Send>>;

/// Remote side of the aggregator. The HTTP implementation is the real one;
/// tests plug in their own.
#[async_trait]
pub trait LiveEventsApi: Send + Sync + 'static {
    /// Open the push connection. Resolves once the server has accepted it.
    async fn open_stream(
        &self,
        tenant: &TenantContext,
        filters: &StreamFilters,
    ) -> Result<LineStream>;

    /// Point-in-time stats snapshot.
    async fn fetch_stats(&self, tenant: &TenantContext) -> Result<Stats>;
}

pub struct HttpLiveEventsApi {
    client: Client,
    host: Url,
    stats_timeout: Duration,
}

impl HttpLiveEventsApi {
    pub fn new(host: Url, connect_timeout: Duration, stats_timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(connect_timeout)
            .user_agent(concat!("live-events/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            client,
            host,
            stats_timeout,
        })
    }

    pub fn events_url(&self, tenant: &TenantContext, filters: &StreamFilters) -> Result<Url> {
        let mut url = self.endpoint("events")?;
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("teamId", &tenant.team_id.to_string());
            if let Some(event_type) = &filters.event_type {
                query.append_pair("eventType", event_type);
            }
        }
        Ok(url)
    }

    pub fn stats_url(&self, tenant: &TenantContext) -> Result<Url> {
        let mut url = self.endpoint("stats")?;
        url.query_pairs_mut()
            .append_pair("teamId", &tenant.team_id.to_string());
        Ok(url)
    }

    fn endpoint(&self, name: &str) -> Result<Url> {
        let mut url = self.host.clone();
        url.set_query(None);
        url.path_segments_mut()
            .map_err(|_| {
                LiveEventsError::InvalidConfig(format!("host {} cannot carry a path", self.host))
            })?
            .pop_if_empty()
            .push(name);
        Ok(url)
    }
}

#[async_trait]
impl LiveEventsApi for HttpLiveEventsApi {
    async fn open_stream(
        &self,
        tenant: &TenantContext,
        filters: &StreamFilters,
    ) -> Result<LineStream> {
        let url = self.events_url(tenant, filters)?;
        debug!(%url, "Opening live events stream");

        let response = self
            .client
            .get(url.clone())
            .bearer_auth(&tenant.token)
            .header(
                header::ACCEPT,
                "text/event-stream, application/x-ndjson, application/json",
            )
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(LiveEventsError::UnexpectedStatus {
                status: status.as_u16(),
                url: url.to_string(),
            });
        }

        Ok(decode_lines(response.bytes_stream()))
    }

    async fn fetch_stats(&self, tenant: &TenantContext) -> Result<Stats> {
        let url = self.stats_url(tenant)?;
        trace!(%url, "Polling stats");

        let response = self
            .client
            .get(url.clone())
            .bearer_auth(&tenant.token)
            .timeout(self.stats_timeout)
            .send()
            .await
            .map_err(|e| LiveEventsError::StatsFetch(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(LiveEventsError::StatsFetch(format!(
                "{} returned {}",
                url, status
            )));
        }

        response
            .json::<Stats>()
            .await
            .map_err(|e| LiveEventsError::StatsFetch(e.to_string()))
    }
}

/// Turn a chunked byte body into payload lines. Accepts both bare NDJSON and
/// SSE framing.
pub fn decode_lines<S, B, E>(body: S) -> LineStream
where
    S: Stream<Item = std::result::Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
    E: Into<LiveEventsError> + Send + 'static,
{
    Box::pin(async_stream::stream! {
        let mut chunks = Box::pin(body);
        let mut lines = LineDecoder::default();

        while let Some(chunk) = chunks.next().await {
            match chunk {
                Ok(bytes) => {
                    lines.extend(bytes.as_ref());
                    while let Some(line) = lines.next_line() {
                        match line {
                            Ok(line) => {
                                if let Some(payload) = payload_from_line(&line) {
                                    yield Ok(payload.to_string());
                                }
                            }
                            Err(e) => yield Err(e),
                        }
                    }
                }
                Err(e) => {
                    yield Err(e.into());
                    lines = LineDecoder::default();
                    break;
                }
            }
        }

        match lines.finish() {
            Some(Ok(line)) => {
                if let Some(payload) = payload_from_line(&line) {
                    yield Ok(payload.to_string());
                }
            }
            Some(Err(e)) => yield Err(e),
            None => {}
        }
    })
}

/// Longest line accepted from the stream.
pub const MAX_LINE_BYTES: usize = 1024 * 1024;

/// Splits incoming bytes on `\n`, holding back any partial trailing line.
///
/// Lines that are not valid UTF-8 or grow past the length limit come back
/// as `MalformedPayload`. The rest of an oversized line is skipped up to
/// its newline.
#[derive(Debug)]
pub struct LineDecoder {
    buffer: Vec<u8>,
    // bytes of `buffer` already searched for a newline
    scanned: usize,
    max_line: usize,
    skipping: bool,
}

impl Default for LineDecoder {
    fn default() -> Self {
        Self::with_max_line(MAX_LINE_BYTES)
    }
}

impl LineDecoder {
    pub fn with_max_line(max_line: usize) -> Self {
        Self {
            buffer: Vec::new(),
            scanned: 0,
            max_line,
            skipping: false,
        }
    }

    pub fn extend(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    pub fn next_line(&mut self) -> Option<Result<String>> {
        loop {
            let Some(offset) = self.buffer[self.scanned..].iter().position(|&b| b == b'\n') else {
                self.scanned = self.buffer.len();
                if self.skipping {
                    self.buffer.clear();
                    self.scanned = 0;
                    return None;
                }
                if self.buffer.len() > self.max_line {
                    return Some(Err(self.reject_oversized()));
                }
                return None;
            };

            let end = self.scanned + offset;
            let line: Vec<u8> = self.buffer.drain(..=end).collect();
            self.scanned = 0;
            if std::mem::take(&mut self.skipping) {
                continue;
            }
            if line.len() > self.max_line + 1 {
                return Some(Err(oversized(&line, self.max_line)));
            }
            return Some(decode_line(&line));
        }
    }

    /// Whatever is left once the body has ended.
    pub fn finish(&mut self) -> Option<Result<String>> {
        let rest = std::mem::take(&mut self.buffer);
        self.scanned = 0;
        if std::mem::take(&mut self.skipping) || rest.is_empty() {
            return None;
        }
        if rest.len() > self.max_line {
            return Some(Err(oversized(&rest, self.max_line)));
        }
        Some(decode_line(&rest))
    }

    fn reject_oversized(&mut self) -> LiveEventsError {
        let error = oversized(&self.buffer, self.max_line);
        self.buffer.clear();
        self.scanned = 0;
        self.skipping = true;
        error
    }
}

fn decode_line(bytes: &[u8]) -> Result<String> {
    let bytes = bytes.trim_ascii_end();
    std::str::from_utf8(bytes)
        .map(str::to_string)
        .map_err(|e| LiveEventsError::malformed(format!("invalid UTF-8: {e}"), &String::from_utf8_lossy(bytes)))
}

fn oversized(bytes: &[u8], max_line: usize) -> LiveEventsError {
    let head = &bytes[..bytes.len().min(max_line)];
    LiveEventsError::malformed(
        format!("line exceeds {max_line} bytes"),
        &String::from_utf8_lossy(head),
    )
}

/// Extract the event payload from one line, skipping blank lines and SSE
/// bookkeeping fields.
pub fn payload_from_line(line: &str) -> Option<&str> {
    let line = line.trim();
    if line.is_empty() || line.starts_with(':') {
        return None;
    }
    if let Some(data) = line.strip_prefix("data:") {
        let data = data.trim_start();
        return (!data.is_empty()).then_some(data);
    }
    if ["event:", "id:", "retry:"]
        .iter()
        .any(|field| line.starts_with(field))
    {
        return None;
    }
    Some(line)
}
