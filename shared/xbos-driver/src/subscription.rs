//! Streaming subscriptions
//!
//! A subscription POSTs a query to the archiver's republish endpoint and keeps
//! the response open. The body is an unbounded sequence of JSON documents
//! separated by a blank line (`\n\n`); each document is handed to a
//! [`MessageHandler`] in arrival order.
//!
//! Frames are cut from an accumulator, never from a single chunk, so a
//! delimiter split across two network reads is still found.

use async_trait::async_trait;
use bytes::{Buf, Bytes, BytesMut};
use futures_util::{pin_mut, Stream, StreamExt};
use serde_json::Value;
use std::fmt::Display;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::error::{DriverError, Result};
use crate::registry::SeriesRegistry;

pub const FRAME_DELIMITER: &[u8] = b"\n\n";

/// Incremental splitter for delimiter-separated JSON documents
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buffer: BytesMut,
    // bytes already known not to start a delimiter
    scanned: usize,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn extend(&mut self, chunk: &[u8]) {
        self.buffer.extend_from_slice(chunk);
    }

    /// Pop the next complete frame. `None` means only a partial frame (or
    /// nothing) is left and more input is needed.
    ///
    /// Blank frames are skipped. A frame that is not UTF-8 JSON comes back as
    /// a [`DriverError::Protocol`]; the decoder stays usable.
    pub fn next_frame(&mut self) -> Option<Result<Value>> {
        loop {
            let found = self.buffer[self.scanned..]
                .windows(FRAME_DELIMITER.len())
                .position(|w| w == FRAME_DELIMITER);

            let Some(offset) = found else {
                self.scanned = self
                    .buffer
                    .len()
                    .saturating_sub(FRAME_DELIMITER.len() - 1);
                return None;
            };

            let frame = self.buffer.split_to(self.scanned + offset).freeze();
            self.buffer.advance(FRAME_DELIMITER.len());
            self.scanned = 0;

            if frame.iter().all(u8::is_ascii_whitespace) {
                continue;
            }
            return Some(decode_frame(&frame));
        }
    }

    /// Feed one chunk and collect every frame it completes
    pub fn decode(&mut self, chunk: &[u8]) -> Vec<Result<Value>> {
        self.extend(chunk);
        std::iter::from_fn(|| self.next_frame()).collect()
    }

    /// Bytes of the frame still waiting for its delimiter
    pub fn remainder(&self) -> &[u8] {
        &self.buffer
    }
}

fn decode_frame(frame: &Bytes) -> Result<Value> {
    let text = std::str::from_utf8(frame)
        .map_err(|e| DriverError::Protocol(format!("frame is not UTF-8: {}", e)))?;
    serde_json::from_str(text)
        .map_err(|e| DriverError::Protocol(format!("frame is not JSON: {}", e)))
}

/// What a handler knows about the subscription that produced a message
#[derive(Clone)]
pub struct SubscriptionContext {
    pub query: String,
    pub endpoint: String,
    /// Actuator series this subscription was opened for, if any
    pub actuator: Option<String>,
    /// Caller-supplied arguments bound at registration
    pub args: Value,
    pub series: SeriesRegistry,
}

impl SubscriptionContext {
    pub fn new(query: impl Into<String>, endpoint: impl Into<String>, series: SeriesRegistry) -> Self {
        Self {
            query: query.into(),
            endpoint: endpoint.into(),
            actuator: None,
            args: Value::Null,
            series,
        }
    }

    pub fn with_actuator(mut self, path: impl Into<String>) -> Self {
        self.actuator = Some(path.into());
        self
    }

    pub fn with_args(mut self, args: Value) -> Self {
        self.args = args;
        self
    }

    /// Record the value an actuation applied on the bound actuator series
    pub fn record_actuation(&self, value: Value, timestamp: Option<i64>) -> Result<()> {
        let path = self.actuator.as_deref().ok_or_else(|| {
            DriverError::Validation(format!(
                "subscription '{}' is not bound to an actuator",
                self.query
            ))
        })?;
        self.series.add_reading(path, value, timestamp)
    }
}

/// Receives decoded subscription messages. The message shape is whatever the
/// archiver republished; validating it is up to the handler.
#[async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    async fn handle(&self, message: Value, ctx: &SubscriptionContext) -> Result<()>;
}

#[async_trait]
impl<F> MessageHandler for F
where
    F: Fn(Value, &SubscriptionContext) -> Result<()> + Send + Sync + 'static,
{
    async fn handle(&self, message: Value, ctx: &SubscriptionContext) -> Result<()> {
        (self)(message, ctx)
    }
}

/// Per-stream counters returned when a subscription closes
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct StreamStats {
    pub bytes_read: u64,
    pub messages: u64,
    pub dropped_frames: u64,
    pub handler_errors: u64,
}

pub struct SubscriptionClient {
    http: reqwest::Client,
    handler: Arc<dyn MessageHandler>,
    context: SubscriptionContext,
}

impl SubscriptionClient {
    pub fn new(
        http: reqwest::Client,
        handler: Arc<dyn MessageHandler>,
        context: SubscriptionContext,
    ) -> Self {
        Self {
            http,
            handler,
            context,
        }
    }

    pub fn context(&self) -> &SubscriptionContext {
        &self.context
    }

    /// Open the stream and dispatch messages until the server closes it.
    ///
    /// Failing to open the stream is a [`DriverError::Setup`]; there is no
    /// reconnect.
    pub async fn subscribe(self) -> Result<StreamStats> {
        let endpoint = self.context.endpoint.clone();
        info!(endpoint = %endpoint, query = %self.context.query, "Subscribing");

        let response = self
            .http
            .post(&endpoint)
            .body(self.context.query.clone())
            .send()
            .await
            .map_err(|e| {
                error!(endpoint = %endpoint, error = %e, "Subscription request failed");
                DriverError::Setup(format!("cannot subscribe to {}: {}", endpoint, e))
            })?;

        let status = response.status();
        if !status.is_success() {
            error!(endpoint = %endpoint, status = status.as_u16(), "Subscription rejected");
            return Err(DriverError::Setup(format!(
                "subscription to {} rejected with status {}",
                endpoint, status
            )));
        }

        let stats = self.consume(response.bytes_stream()).await;
        info!(
            endpoint = %endpoint,
            messages = stats.messages,
            dropped = stats.dropped_frames,
            "Subscription closed"
        );
        Ok(stats)
    }

    /// Frame and dispatch everything `stream` yields. A read error is
    /// treated like the server closing the stream.
    pub async fn consume<S, E>(&self, stream: S) -> StreamStats
    where
        S: Stream<Item = std::result::Result<Bytes, E>>,
        E: Display,
    {
        pin_mut!(stream);
        let mut decoder = FrameDecoder::new();
        let mut stats = StreamStats::default();

        while let Some(chunk) = stream.next().await {
            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(e) => {
                    warn!(endpoint = %self.context.endpoint, error = %e, "Subscription read failed");
                    break;
                }
            };
            stats.bytes_read += chunk.len() as u64;
            decoder.extend(&chunk);

            while let Some(frame) = decoder.next_frame() {
                match frame {
                    Ok(message) => {
                        stats.messages += 1;
                        if let Err(e) = self.handler.handle(message, &self.context).await {
                            stats.handler_errors += 1;
                            warn!(query = %self.context.query, error = %e, "Subscription handler failed");
                        }
                    }
                    Err(e) => {
                        stats.dropped_frames += 1;
                        warn!(endpoint = %self.context.endpoint, error = %e, "Dropping malformed frame");
                    }
                }
            }
        }

        if !decoder.remainder().is_empty() {
            debug!(
                bytes = decoder.remainder().len(),
                "Discarding unterminated frame at end of stream"
            );
        }
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use serde_json::json;

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<Value>>,
    }

    #[async_trait]
    impl MessageHandler for Recorder {
        async fn handle(&self, message: Value, _ctx: &SubscriptionContext) -> Result<()> {
            self.seen.lock().push(message);
            Ok(())
        }
    }

    fn decode_all(chunks: &[&[u8]]) -> Vec<Value> {
        let mut decoder = FrameDecoder::new();
        chunks
            .iter()
            .flat_map(|chunk| decoder.decode(chunk))
            .filter_map(|frame| frame.ok())
            .collect()
    }

    fn client(handler: Arc<dyn MessageHandler>) -> SubscriptionClient {
        SubscriptionClient::new(
            reqwest::Client::new(),
            handler,
            SubscriptionContext::new("Metadata/Room = '410'", "http://localhost:8079/republish", SeriesRegistry::new()),
        )
    }

    fn chunks(parts: &[&'static [u8]]) -> impl Stream<Item = std::result::Result<Bytes, std::io::Error>> {
        futures_util::stream::iter(
            parts
                .iter()
                .map(|p| Ok(Bytes::from_static(p)))
                .collect::<Vec<_>>(),
        )
    }

    #[test]
    fn test_message_split_across_chunks() {
        let messages = decode_all(&[b"{\"a\":1}\n\n{\"a\"", b":2}\n\n"]);
        assert_eq!(messages, vec![json!({"a": 1}), json!({"a": 2})]);
    }

    #[test]
    fn test_delimiter_split_across_chunks() {
        let messages = decode_all(&[b"{\"a\":1}\n", b"\n{\"a\":2}\n", b"\n"]);
        assert_eq!(messages, vec![json!({"a": 1}), json!({"a": 2})]);
    }

    #[test]
    fn test_any_chunking_matches_single_read() {
        let stream: &[u8] =
            b"{\"uuid\":\"x\",\"Readings\":[[1,2.5]]}\n\n[1,2,3]\n\n\"text\"\n\n{\"nested\":{\"k\":\"a\\n\\nb\"}}\n\n{\"tail\":";
        let whole = decode_all(&[stream]);
        assert_eq!(whole.len(), 4);

        for size in 1..stream.len() {
            let pieces: Vec<&[u8]> = stream.chunks(size).collect();
            assert_eq!(decode_all(&pieces), whole, "chunk size {}", size);
        }
    }

    #[test]
    fn test_malformed_frame_is_dropped() {
        let mut decoder = FrameDecoder::new();
        let frames = decoder.decode(b"{\"a\":1}\n\n{not json}\n\n\xff\xfe\n\n{\"a\":2}\n\n");
        assert_eq!(frames.len(), 4);
        assert!(matches!(frames[1], Err(DriverError::Protocol(_))));
        assert!(matches!(frames[2], Err(DriverError::Protocol(_))));
        assert_eq!(frames[3].as_ref().unwrap(), &json!({"a": 2}));
    }

    #[test]
    fn test_blank_frames_skipped_and_remainder_kept() {
        let mut decoder = FrameDecoder::new();
        let frames = decoder.decode(b"\n\n\n\n{\"a\":1}\n\n{\"b\"");
        assert_eq!(frames.len(), 1);
        assert_eq!(decoder.remainder(), b"{\"b\"");
    }

    #[tokio::test]
    async fn test_consume_dispatches_in_order() {
        let recorder = Arc::new(Recorder::default());
        let client = client(recorder.clone());

        let stats = client
            .consume(chunks(&[b"{\"a\":1}\n\n{\"a\"", b":2}\n\n"]))
            .await;

        assert_eq!(*recorder.seen.lock(), vec![json!({"a": 1}), json!({"a": 2})]);
        assert_eq!(stats.messages, 2);
        assert_eq!(stats.dropped_frames, 0);
        assert_eq!(stats.bytes_read, 18);
    }

    #[tokio::test]
    async fn test_handler_error_does_not_stop_stream() {
        let calls = Arc::new(Mutex::new(0u32));
        let counter = Arc::clone(&calls);
        let handler = move |message: Value, _ctx: &SubscriptionContext| -> Result<()> {
            *counter.lock() += 1;
            if message["fail"] == json!(true) {
                return Err(DriverError::Validation("unexpected shape".into()));
            }
            Ok(())
        };
        let client = client(Arc::new(handler));

        let stats = client
            .consume(chunks(&[b"{\"fail\":true}\n\n{\"fail\":false}\n\ngarbage\n\n"]))
            .await;

        assert_eq!(*calls.lock(), 2);
        assert_eq!(stats.handler_errors, 1);
        assert_eq!(stats.dropped_frames, 1);
    }

    #[tokio::test]
    async fn test_read_error_closes_stream() {
        let recorder = Arc::new(Recorder::default());
        let client = client(recorder.clone());
        let stream = futures_util::stream::iter(vec![
            Ok(Bytes::from_static(b"{\"a\":1}\n\n")),
            Err(std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset")),
            Ok(Bytes::from_static(b"{\"a\":2}\n\n")),
        ]);

        let stats = client.consume(stream).await;
        assert_eq!(stats.messages, 1);
        assert_eq!(recorder.seen.lock().len(), 1);
    }

    #[test]
    fn test_record_actuation_requires_binding() {
        let ctx = SubscriptionContext::new("q", "http://localhost:8079/republish", SeriesRegistry::new());
        assert!(matches!(
            ctx.record_actuation(json!(1), None),
            Err(DriverError::Validation(_))
        ));
    }
}
