//! HTTP-backed source reader
//!
//! Speaks to the remote reader service over HTTP:
//!
//! ```text
//! POST <url>/get_many
//! {"keys": ["user/1/username", ...]}
//!
//! 200 OK
//! {"position": 417, "values": {"user/1/username": "hugo"}}
//! ```
//!
//! Keys missing from the `values` object are absent; a present entry
//! holds the raw JSON value. Transient failures (connect errors,
//! timeouts, 5xx) are retried with exponential backoff.
//!
//! Change batches do not travel over HTTP. The stream transport
//! (a Redis stream in production) pushes them through the
//! [`ChangeFeed`] handle; reconnecting to the stream is the
//! transport's duty.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use plenum_key::Key;
use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, warn};

use crate::error::SourceError;
use crate::source::{Source, SourceAnswer, Value};

/// Buffered change batches between the transport and the update loop.
const FEED_CAPACITY: usize = 64;

/// Retry behaviour for reads against the reader service.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Retry attempts after the first failure
    pub max_retries: u32,
    /// Base delay, doubled per attempt
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(200),
        }
    }
}

impl RetryPolicy {
    fn delay(&self, attempt: u32) -> Duration {
        // Cap the exponent so the delay stays bounded.
        self.base_delay * (1 << attempt.min(6))
    }
}

/// Producer handle for the change stream transport.
///
/// Whatever consumes the physical stream pushes decoded batches here.
/// Dropping the handle closes the feed and ends the update loop.
#[derive(Debug, Clone)]
pub struct ChangeFeed {
    tx: mpsc::Sender<SourceAnswer>,
}

impl ChangeFeed {
    /// Push one change batch to the cache's update loop.
    pub async fn send(&self, batch: SourceAnswer) -> Result<(), SourceError> {
        self.tx.send(batch).await.map_err(|_| SourceError::FeedClosed)
    }
}

/// [`Source`] implementation over the remote reader service.
pub struct HttpSource {
    client: reqwest::Client,
    get_many_url: String,
    retry: RetryPolicy,
    feed: Mutex<mpsc::Receiver<SourceAnswer>>,
}

#[derive(Serialize)]
struct GetManyRequest<'a> {
    keys: &'a [Key],
}

#[derive(Deserialize)]
struct GetManyResponse {
    position: u64,
    values: HashMap<String, Box<RawValue>>,
}

impl HttpSource {
    /// Create a source talking to the reader at `url`, along with the
    /// feed handle for the change-stream transport.
    pub fn new(
        url: &str,
        timeout: Duration,
        retry: RetryPolicy,
    ) -> Result<(Self, ChangeFeed), SourceError> {
        let (tx, rx) = mpsc::channel(FEED_CAPACITY);
        let client = reqwest::Client::builder().timeout(timeout).build()?;

        let source = Self {
            client,
            get_many_url: format!("{}/get_many", url.trim_end_matches('/')),
            retry,
            feed: Mutex::new(rx),
        };
        Ok((source, ChangeFeed { tx }))
    }

    async fn get_many(&self, keys: &[Key]) -> Result<GetManyResponse, SourceError> {
        let mut attempt = 0;
        loop {
            let result = self
                .client
                .post(&self.get_many_url)
                .json(&GetManyRequest { keys })
                .send()
                .await
                .and_then(|resp| resp.error_for_status());

            match result {
                Ok(resp) => {
                    return resp
                        .json()
                        .await
                        .map_err(|e| SourceError::Protocol(e.to_string()));
                }
                Err(err) if attempt < self.retry.max_retries && is_retryable(&err) => {
                    let delay = self.retry.delay(attempt);
                    debug!(
                        attempt,
                        delay_ms = delay.as_millis(),
                        error = %err,
                        "reader request failed, will retry"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err.into()),
            }
        }
    }
}

/// Transient failures worth retrying: timeouts, connection errors,
/// server errors and rate limits.
fn is_retryable(error: &reqwest::Error) -> bool {
    if error.is_timeout() || error.is_connect() {
        return true;
    }
    if let Some(status) = error.status() {
        return status.is_server_error() || status.as_u16() == 429;
    }
    false
}

#[async_trait]
impl Source for HttpSource {
    async fn get(&self, keys: &[Key]) -> Result<SourceAnswer, SourceError> {
        let response = self.get_many(keys).await?;

        let mut parsed: HashMap<Key, Bytes> = HashMap::with_capacity(response.values.len());
        for (key, value) in response.values {
            let key = Key::parse(&key)
                .map_err(|e| SourceError::Protocol(format!("reader answered with {e}")))?;
            parsed.insert(key, Bytes::from(value.get().to_string()));
        }

        let values: HashMap<Key, Value> = keys
            .iter()
            .map(|key| (key.clone(), parsed.remove(key)))
            .collect();

        if !parsed.is_empty() {
            warn!(count = parsed.len(), "reader answered with unrequested keys");
        }

        Ok(SourceAnswer {
            values,
            position: response.position,
        })
    }

    async fn update(&self) -> Result<SourceAnswer, SourceError> {
        let mut feed = self.feed.lock().await;
        feed.recv().await.ok_or(SourceError::FeedClosed)
    }
}
