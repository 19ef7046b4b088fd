//! Resumable client-side subscription over an SSE endpoint.
//!
//! The worker reconnects on transient failures with bounded exponential
//! backoff, echoing the last seen event id back to the server so delivery
//! resumes from the last checkpoint. Connection state is reported through a
//! `watch` channel; unsubscribing cancels the token, which aborts whatever
//! the worker is awaiting.

use anyhow::anyhow;
use bytes::Bytes;
use futures::{Stream, StreamExt};
use serde_json::Value;
use std::time::Duration;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::frame::FrameDecoder;

/// Connection lifecycle as observed by the subscriber.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    /// Establishing (or re-establishing) the upstream connection.
    Connecting,
    /// Connected, frames may arrive at any time.
    Pending,
    /// The upstream signalled completion; no further frames will arrive.
    Idle,
}

/// Reconnect policy knobs. Retries are bounded: an unbounded reconnect loop
/// would leak the worker task on a permanently dead endpoint.
#[derive(Clone, Debug)]
pub struct ConsumerOptions {
    pub retryable_statuses: Vec<u16>,
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for ConsumerOptions {
    fn default() -> Self {
        Self {
            retryable_statuses: vec![408, 429, 500, 502, 503, 504],
            max_attempts: 5,
            initial_backoff: Duration::from_millis(250),
            max_backoff: Duration::from_secs(10),
        }
    }
}

/// One forwarded event: the decoded JSON payload plus the event id when the
/// frame carried one.
#[derive(Clone, Debug, PartialEq)]
pub struct StreamFrame {
    pub id: Option<String>,
    pub data: Value,
}

/// Handle to an active subscription. Dropping it (or calling `unsubscribe`)
/// cancels the worker synchronously; no network activity survives teardown.
pub struct Subscription {
    events: UnboundedReceiver<anyhow::Result<StreamFrame>>,
    state: watch::Receiver<ConnectionState>,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl Subscription {
    pub async fn next(&mut self) -> Option<anyhow::Result<StreamFrame>> {
        self.events.recv().await
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    pub fn unsubscribe(&self) {
        self.cancel.cancel();
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.cancel.cancel();
        self.handle.abort();
    }
}

/// Open a push subscription against `base_url` with the given operation input.
pub fn subscribe(
    client: reqwest::Client,
    base_url: reqwest::Url,
    options: ConsumerOptions,
    input: Value,
) -> Subscription {
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let (state_tx, state_rx) = watch::channel(ConnectionState::Connecting);
    let cancel = CancellationToken::new();

    let worker_cancel = cancel.clone();
    let handle = tokio::spawn(async move {
        run(client, base_url, options, input, event_tx, state_tx, worker_cancel).await;
    });

    Subscription {
        events: event_rx,
        state: state_rx,
        cancel,
        handle,
    }
}

fn build_url(
    base: &reqwest::Url,
    input: &Value,
    last_event_id: Option<&str>,
) -> anyhow::Result<reqwest::Url> {
    let mut merged = input.clone();
    if let (Some(id), Value::Object(map)) = (last_event_id, &mut merged) {
        map.insert("lastEventId".to_string(), Value::String(id.to_string()));
    }

    let mut url = base.clone();
    url.query_pairs_mut()
        .append_pair("type", "subscription")
        .append_pair("input", &serde_json::to_string(&merged)?);
    Ok(url)
}

fn backoff_delay(options: &ConsumerOptions, attempt: u32) -> Duration {
    let exp = attempt.saturating_sub(1).min(16);
    options
        .initial_backoff
        .saturating_mul(1u32 << exp)
        .min(options.max_backoff)
}

enum PumpOutcome {
    /// Upstream signalled logical completion.
    Done,
    /// Cancellation observed.
    Cancelled,
    /// Connection dropped mid-stream; reconnect from the last event id.
    Disconnected,
    /// Unrecoverable payload failure already forwarded to the subscriber.
    Failed,
}

async fn pump<S>(
    body: S,
    tx: &UnboundedSender<anyhow::Result<StreamFrame>>,
    last_event_id: &mut Option<String>,
    cancel: &CancellationToken,
) -> PumpOutcome
where
    S: Stream<Item = anyhow::Result<Bytes>>,
{
    let mut body = std::pin::pin!(body);
    let mut decoder = FrameDecoder::new();

    loop {
        if cancel.is_cancelled() {
            return PumpOutcome::Cancelled;
        }
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => return PumpOutcome::Cancelled,
            next = body.next() => next,
        };

        let chunk = match next {
            Some(Ok(chunk)) => chunk,
            Some(Err(err)) => {
                debug!("stream read failed, will reconnect: {err}");
                return PumpOutcome::Disconnected;
            }
            // Server closed without the done sentinel: treat as a drop.
            None => return PumpOutcome::Disconnected,
        };

        for frame in decoder.feed(&chunk) {
            if frame.is_done() {
                return PumpOutcome::Done;
            }
            let data: Value = match serde_json::from_str(&frame.data) {
                Ok(v) => v,
                Err(err) => {
                    let _ = tx.send(Err(anyhow!("unparsable frame payload: {err}")));
                    return PumpOutcome::Failed;
                }
            };
            if let Some(id) = &frame.id {
                *last_event_id = Some(id.clone());
            }
            if tx.send(Ok(StreamFrame { id: frame.id, data })).is_err() {
                // Subscriber went away.
                return PumpOutcome::Cancelled;
            }
        }
    }
}

async fn run(
    client: reqwest::Client,
    base_url: reqwest::Url,
    options: ConsumerOptions,
    input: Value,
    tx: UnboundedSender<anyhow::Result<StreamFrame>>,
    state: watch::Sender<ConnectionState>,
    cancel: CancellationToken,
) {
    let mut last_event_id: Option<String> = None;
    let mut attempt: u32 = 0;

    loop {
        if cancel.is_cancelled() {
            break;
        }
        let _ = state.send(ConnectionState::Connecting);

        let url = match build_url(&base_url, &input, last_event_id.as_deref()) {
            Ok(url) => url,
            Err(err) => {
                let _ = tx.send(Err(err));
                break;
            }
        };

        let response = tokio::select! {
            _ = cancel.cancelled() => break,
            response = client.get(url).send() => response,
        };

        let transient = match response {
            Ok(response) if response.status().is_success() => {
                let _ = state.send(ConnectionState::Pending);
                attempt = 0;
                let body = response.bytes_stream().map(|r| r.map_err(anyhow::Error::from));
                match pump(body, &tx, &mut last_event_id, &cancel).await {
                    PumpOutcome::Done => {
                        let _ = state.send(ConnectionState::Idle);
                        return;
                    }
                    PumpOutcome::Cancelled | PumpOutcome::Failed => break,
                    PumpOutcome::Disconnected => true,
                }
            }
            Ok(response) => {
                let status = response.status().as_u16();
                if options.retryable_statuses.contains(&status) {
                    warn!("retryable status {status}, reconnecting");
                    true
                } else {
                    let _ = tx.send(Err(anyhow!("server returned status {status}")));
                    break;
                }
            }
            Err(err) => {
                warn!("connect failed, reconnecting: {err}");
                true
            }
        };

        if transient {
            attempt += 1;
            if attempt >= options.max_attempts {
                let _ = tx.send(Err(anyhow!(
                    "giving up after {attempt} failed connection attempts"
                )));
                break;
            }
            let delay = backoff_delay(&options, attempt);
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    let _ = state.send(ConnectionState::Idle);
}
