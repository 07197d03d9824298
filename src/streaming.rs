//! Server-streaming calls with retry and resumption.
//!
//! A logical streaming call may span several underlying transport streams.
//! The caller sees one [`CallStream`]; each retry reissues the call (possibly
//! with a resumption request) and splices the new stream into it.
//!
//! Two retry protocols exist, selected per method by
//! [`StreamDescriptor::gax_streaming_retries`]:
//!
//! - [`ResumableRetry`]: classification by predicate or codes, full backoff
//!   budget, optional resumption request. New callers should use it.
//! - [`LegacyRetry`]: deprecated. Retries only while no data has been
//!   received, never rewrites the request.

use std::fmt;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use futures::{Stream, StreamExt};
use rand::Rng;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::backoff::Backoff;
use crate::retry::NOT_TRANSIENT_NOTE;
use crate::{
    AttemptOptions, CallSettings, Code, EventStream, GaxError, OtherArgs, ResponseInfo, Result,
    RetryOptions, RetryRequestOptions, ShouldRetryFn, StreamEvent, StreamingTransport,
};

/// Per-method streaming configuration.
#[derive(Clone, Debug)]
pub struct StreamDescriptor {
    /// Use the resumable retry protocol instead of the legacy one.
    pub gax_streaming_retries: bool,
}

impl Default for StreamDescriptor {
    fn default() -> Self {
        Self {
            gax_streaming_retries: true,
        }
    }
}

/// Events the driver may read ahead of the caller.
const EVENT_BUFFER: usize = 16;

/// Output of a server-streaming call.
///
/// Yields `Metadata`, `Status`, `Response` and `Data` events; an `Err` item is
/// terminal. The stream ends after a clean end of the underlying call.
///
/// Dropping the stream cancels the call: no further attempt is issued.
pub struct CallStream {
    events: mpsc::Receiver<Result<StreamEvent>>,
    cancel: CancellationToken,
}

impl fmt::Debug for CallStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallStream")
            .field("cancelled", &self.cancel.is_cancelled())
            .finish()
    }
}

impl CallStream {
    /// Cancels the call. The stream then yields a single CANCELLED error,
    /// unless it had already terminated.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }
}

impl Drop for CallStream {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl Stream for CallStream {
    type Item = Result<StreamEvent>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().events.poll_recv(cx)
    }
}

/// Retry protocol of a streaming call.
pub trait StreamRetryStrategy: Send {
    /// Checked when the stream starts; a failure is the stream's first item.
    fn validate(&self) -> Result<()>;

    /// Timeout to attach to the next attempt.
    fn attempt_timeout(&self) -> Option<Duration>;

    /// Decides after an error: `Ok(sleep)` to reissue after `sleep`, `Err`
    /// with the terminal error.
    fn on_error(&mut self, err: GaxError, received_data: bool, now: Instant) -> Result<Duration>;

    fn on_sleep_elapsed(&mut self, now: Instant);

    /// Retries issued so far.
    fn retries(&self) -> u32;

    /// Request of the next attempt.
    fn next_request(&self, original: &Value) -> Value;
}

/// Resumable stream retry protocol.
#[derive(Debug)]
pub struct ResumableRetry {
    retry: Option<RetryOptions>,
    api_name: String,
    backoff: Option<Backoff>,
    deadline: Option<Instant>,
    previous_deadline: Option<Instant>,
    errors: Vec<GaxError>,
}

impl ResumableRetry {
    /// Fails with INVALID_ARGUMENT when both budgets are configured.
    pub fn new(retry: Option<RetryOptions>, api_name: impl Into<String>, now: Instant) -> Result<Self> {
        let backoff = retry
            .as_ref()
            .map(|retry| Backoff::start(&retry.backoff_settings, now))
            .transpose()?;
        let deadline = backoff
            .as_ref()
            .and_then(Backoff::timeout)
            .map(|timeout| now + timeout);
        let previous_deadline = backoff.as_ref().and_then(Backoff::deadline);
        Ok(Self {
            retry,
            api_name: api_name.into(),
            backoff,
            deadline,
            previous_deadline,
            errors: Vec::new(),
        })
    }

    /// Deadline of the current attempt.
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    fn check_budget(&self, backoff: &Backoff, now: Instant, err: &GaxError) -> Result<()> {
        let settings = backoff.settings();
        let exceeded = match (self.previous_deadline, settings.total_timeout_millis) {
            (Some(previous), Some(total)) if now >= previous => Some(format!(
                "Total timeout of API {} exceeded {total} milliseconds retrying error {err} before any response was received.",
                self.api_name
            )),
            _ => settings
                .max_retries()
                .filter(|max| backoff.retries() >= *max)
                .map(|_| {
                    format!(
                        "Exceeded maximum number of retries retrying error {err} before any response was received"
                    )
                }),
        };
        match exceeded {
            Some(message) => Err(GaxError::deadline_exceeded(message)
                .with_note(format!("Exception occurred in retry method: {err}"))
                .with_error_summary(&self.errors)),
            None => Ok(()),
        }
    }
}

impl StreamRetryStrategy for ResumableRetry {
    fn validate(&self) -> Result<()> {
        match &self.retry {
            Some(retry) => retry.validate_classification(),
            None => Ok(()),
        }
    }

    fn attempt_timeout(&self) -> Option<Duration> {
        self.backoff.as_ref().and_then(Backoff::timeout)
    }

    fn on_error(&mut self, err: GaxError, _received_data: bool, now: Instant) -> Result<Duration> {
        let (Some(retry), Some(backoff)) = (&self.retry, &self.backoff) else {
            return Err(err);
        };
        if !retry.can_retry() {
            return Err(err);
        }
        self.errors.push(err.clone());
        if !retry.is_retryable(&err) {
            return Err(err.with_note(NOT_TRANSIENT_NOTE));
        }
        self.check_budget(backoff, now, &err)?;
        Ok(backoff.jittered_delay())
    }

    fn on_sleep_elapsed(&mut self, now: Instant) {
        if let Some(backoff) = self.backoff.as_mut() {
            backoff.advance(now);
            self.previous_deadline = backoff.deadline();
            self.deadline = backoff.timeout().map(|timeout| now + timeout);
        }
    }

    fn retries(&self) -> u32 {
        self.backoff.as_ref().map_or(0, Backoff::retries)
    }

    fn next_request(&self, original: &Value) -> Value {
        match &self.retry {
            Some(retry) => retry.resumption_request(original),
            None => original.clone(),
        }
    }
}

/// Legacy stream retry protocol.
///
/// Deprecated: retries only until the first data event and always restarts
/// from the original request. Use [`ResumableRetry`].
pub struct LegacyRetry {
    retry_codes: Vec<Code>,
    should_retry_fn: Option<ShouldRetryFn>,
    max_retries: u32,
    max_retry_delay: Duration,
    timeout: Option<Duration>,
    retries: u32,
}

impl fmt::Debug for LegacyRetry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LegacyRetry")
            .field("retry_codes", &self.retry_codes)
            .field("max_retries", &self.max_retries)
            .field("max_retry_delay", &self.max_retry_delay)
            .field("retries", &self.retries)
            .finish()
    }
}

impl LegacyRetry {
    const DEFAULT_RETRIES: u32 = 2;

    pub fn new(
        retry: Option<&RetryOptions>,
        legacy: Option<&RetryRequestOptions>,
        timeout: Option<Duration>,
    ) -> Self {
        #[cfg(feature = "tracing")]
        tracing::warn!(
            "legacy streaming retries are deprecated; enable gax_streaming_retries to use resumable retries"
        );
        let max_retries = legacy
            .and_then(|legacy| legacy.retries)
            .or_else(|| retry.and_then(|retry| retry.backoff_settings.max_retries()))
            .unwrap_or(if retry.is_some() { Self::DEFAULT_RETRIES } else { 0 });
        let max_retry_delay = legacy
            .and_then(|legacy| legacy.max_retry_delay)
            .map(Duration::from_secs_f64)
            .or_else(|| retry.map(|retry| Duration::from_millis(retry.backoff_settings.max_retry_delay_millis)))
            .unwrap_or(Duration::from_secs(64));
        Self {
            retry_codes: retry.map(|retry| retry.retry_codes.clone()).unwrap_or_default(),
            should_retry_fn: legacy
                .and_then(|legacy| legacy.should_retry_fn.clone())
                .or_else(|| retry.and_then(|retry| retry.should_retry_fn.clone())),
            max_retries,
            max_retry_delay,
            timeout,
            retries: 0,
        }
    }
}

impl StreamRetryStrategy for LegacyRetry {
    fn validate(&self) -> Result<()> {
        Ok(())
    }

    fn attempt_timeout(&self) -> Option<Duration> {
        self.timeout
    }

    fn on_error(&mut self, err: GaxError, received_data: bool, _now: Instant) -> Result<Duration> {
        let retryable = match &self.should_retry_fn {
            Some(should_retry) => should_retry(&err),
            None => self.retry_codes.contains(&err.code),
        };
        if received_data || !retryable || self.retries >= self.max_retries {
            return Err(err);
        }
        let exponential = Duration::from_secs(1u64 << self.retries.min(16));
        let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..1000));
        Ok((exponential + jitter).min(self.max_retry_delay))
    }

    fn on_sleep_elapsed(&mut self, _now: Instant) {
        self.retries += 1;
    }

    fn retries(&self) -> u32 {
        self.retries
    }

    fn next_request(&self, original: &Value) -> Value {
        original.clone()
    }
}

/// Where a streaming call currently is.
enum StreamState {
    Issuing,
    Forwarding(EventStream),
    ErrorEvaluate(GaxError),
    RetrySleep(Duration),
    TerminalError(GaxError),
    TerminalEnd,
}

/// Outcome of handing one event to the caller.
enum Delivery {
    Sent,
    Cancelled,
    Closed,
}

/// Drives one logical streaming call across its underlying streams.
pub struct StreamRetryExecutor {
    transport: Arc<dyn StreamingTransport>,
    original_request: Value,
    request: Value,
    other_args: OtherArgs,
    strategy: Box<dyn StreamRetryStrategy>,
    response_emitted: bool,
    received_data: bool,
}

impl StreamRetryExecutor {
    pub fn new(
        transport: Arc<dyn StreamingTransport>,
        request: Value,
        other_args: OtherArgs,
        strategy: Box<dyn StreamRetryStrategy>,
    ) -> Self {
        Self {
            transport,
            original_request: request.clone(),
            request,
            other_args,
            strategy,
            response_emitted: false,
            received_data: false,
        }
    }

    /// Starts driving on the runtime and returns the caller's stream.
    pub fn spawn(self) -> CallStream {
        let (tx, events) = mpsc::channel(EVENT_BUFFER);
        let cancel = CancellationToken::new();
        tokio::spawn(self.drive(tx, cancel.clone()));
        CallStream { events, cancel }
    }

    async fn drive(mut self, tx: mpsc::Sender<Result<StreamEvent>>, cancel: CancellationToken) {
        let mut state = match self.strategy.validate() {
            Ok(()) => StreamState::Issuing,
            Err(err) => StreamState::TerminalError(err),
        };
        loop {
            state = match state {
                StreamState::Issuing => {
                    if cancel.is_cancelled() {
                        StreamState::TerminalError(GaxError::cancelled())
                    } else {
                        self.response_emitted = false;
                        let options = AttemptOptions::new(self.strategy.attempt_timeout(), &self.other_args)
                            .with_retries(self.strategy.retries());
                        StreamState::Forwarding(self.transport.open(self.request.clone(), options))
                    }
                }
                StreamState::Forwarding(mut stream) => {
                    let next = tokio::select! {
                        biased;
                        _ = cancel.cancelled() => None,
                        item = stream.next() => Some(item),
                    };
                    match next {
                        None => StreamState::TerminalError(GaxError::cancelled()),
                        Some(Some(Ok(event))) => match self.forward(&tx, &cancel, event).await {
                            Delivery::Sent => StreamState::Forwarding(stream),
                            Delivery::Cancelled => StreamState::TerminalError(GaxError::cancelled()),
                            // Caller dropped the stream.
                            Delivery::Closed => return,
                        },
                        Some(Some(Err(err))) => StreamState::ErrorEvaluate(err),
                        Some(None) => StreamState::TerminalEnd,
                    }
                }
                StreamState::ErrorEvaluate(err) => {
                    match self.strategy.on_error(err, self.received_data, Instant::now()) {
                        Ok(sleep) => StreamState::RetrySleep(sleep),
                        Err(err) => StreamState::TerminalError(err),
                    }
                }
                StreamState::RetrySleep(sleep) => {
                    #[cfg(feature = "tracing")]
                    tracing::debug!(sleep_ms = sleep.as_millis() as u64, "reissuing stream after transient error");
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => StreamState::TerminalError(GaxError::cancelled()),
                        _ = tokio::time::sleep(sleep) => {
                            self.strategy.on_sleep_elapsed(Instant::now());
                            self.request = self.strategy.next_request(&self.original_request);
                            StreamState::Issuing
                        }
                    }
                }
                StreamState::TerminalError(err) => {
                    let _ = tx.send(Err(err)).await;
                    return;
                }
                StreamState::TerminalEnd => return,
            };
        }
    }

    /// Passes one transport event through, synthesizing the once-per-attempt
    /// `Response` event. Waits while the caller's buffer is full.
    async fn forward(
        &mut self,
        tx: &mpsc::Sender<Result<StreamEvent>>,
        cancel: &CancellationToken,
        event: StreamEvent,
    ) -> Delivery {
        let synthesize = match &event {
            StreamEvent::Metadata(_) | StreamEvent::Status(_) => !self.response_emitted,
            StreamEvent::Response(_) => {
                self.response_emitted = true;
                false
            }
            StreamEvent::Data(_) => {
                self.received_data = true;
                false
            }
        };
        match deliver(tx, cancel, Ok(event)).await {
            Delivery::Sent if synthesize => {
                self.response_emitted = true;
                deliver(tx, cancel, Ok(StreamEvent::Response(ResponseInfo::ok()))).await
            }
            delivery => delivery,
        }
    }
}

async fn deliver(
    tx: &mpsc::Sender<Result<StreamEvent>>,
    cancel: &CancellationToken,
    item: Result<StreamEvent>,
) -> Delivery {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Delivery::Cancelled,
        sent = tx.send(item) => match sent {
            Ok(()) => Delivery::Sent,
            Err(_) => Delivery::Closed,
        },
    }
}

/// Starts a streaming call under `settings`.
///
/// Conflicting budgets fail synchronously; conflicting classification is the
/// first item of the returned stream.
pub(crate) fn start(
    transport: Arc<dyn StreamingTransport>,
    request: Value,
    settings: &CallSettings,
    descriptor: &StreamDescriptor,
    legacy: Option<&RetryRequestOptions>,
) -> Result<CallStream> {
    let strategy: Box<dyn StreamRetryStrategy> = if descriptor.gax_streaming_retries {
        Box::new(ResumableRetry::new(
            settings.retry.clone(),
            settings.api_name.clone(),
            Instant::now(),
        )?)
    } else {
        Box::new(LegacyRetry::new(settings.retry.as_ref(), legacy, settings.timeout))
    };
    let executor = StreamRetryExecutor::new(transport, request, settings.other_args.clone(), strategy);
    Ok(executor.spawn())
}
