//! Unary calls: the retry state machine and the cancellable call handle.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use futures::future::{self, BoxFuture};
use futures::FutureExt;
use serde_json::Value;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tokio_util::sync::{CancellationToken, DropGuard};

use crate::backoff::Backoff;
use crate::retry::NOT_TRANSIENT_NOTE;
use crate::{AttemptOptions, CallSettings, GaxError, OtherArgs, Result, RetryOptions, UnaryTransport};

/// A function issuing one logical call, retries included.
pub type ApiCallFn = Arc<dyn Fn(Value) -> BoxFuture<'static, Result<Value>> + Send + Sync>;

/// Handle to a call in flight.
///
/// Await it for the result. [`OngoingCall::cancel`] may be called any number
/// of times; the call then resolves once, with a CANCELLED error, unless it
/// had already completed. Dropping the handle of a directly issued call
/// cancels it.
pub struct OngoingCall {
    result: oneshot::Receiver<Result<Value>>,
    canceller: Arc<dyn Fn() + Send + Sync>,
    _abort_on_drop: Option<DropGuard>,
}

impl fmt::Debug for OngoingCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OngoingCall").finish_non_exhaustive()
    }
}

impl OngoingCall {
    pub(crate) fn new(
        result: oneshot::Receiver<Result<Value>>,
        canceller: impl Fn() + Send + Sync + 'static,
    ) -> Self {
        Self {
            result,
            canceller: Arc::new(canceller),
            _abort_on_drop: None,
        }
    }

    /// Runs `call` on the runtime; cancelling drops it, which clears a pending
    /// retry sleep and drops the attempt in flight.
    pub(crate) fn spawn(call: BoxFuture<'static, Result<Value>>) -> Self {
        let token = CancellationToken::new();
        let (tx, rx) = oneshot::channel();
        let cancelled = token.clone();
        tokio::spawn(async move {
            let result = tokio::select! {
                _ = cancelled.cancelled() => Err(GaxError::cancelled()),
                result = call => result,
            };
            let _ = tx.send(result);
        });
        let guard = token.clone().drop_guard();
        Self {
            _abort_on_drop: Some(guard),
            ..Self::new(rx, move || token.cancel())
        }
    }

    pub fn cancel(&self) {
        (self.canceller)();
    }
}

impl Future for OngoingCall {
    type Output = Result<Value>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.get_mut().result).poll(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            // The driver went away without answering.
            Poll::Ready(Err(_)) => Poll::Ready(Err(GaxError::cancelled())),
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Where a retried call currently is.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RetryState {
    /// An attempt is (about to be) in flight.
    Attempt,
    /// Waiting this long before the next attempt.
    Sleep(Duration),
    Done,
}

/// Retry state machine for one logical unary call.
///
/// The driver feeds it events ([`begin_attempt`](Self::begin_attempt),
/// [`on_success`](Self::on_success), [`on_error`](Self::on_error),
/// [`on_sleep_elapsed`](Self::on_sleep_elapsed)); each returns what to do next.
#[derive(Debug)]
pub struct RetryExecutor {
    retry: RetryOptions,
    api_name: String,
    backoff: Backoff,
    errors: Vec<GaxError>,
    state: RetryState,
}

impl RetryExecutor {
    /// Fails with INVALID_ARGUMENT when both budgets are configured.
    pub fn new(retry: RetryOptions, api_name: impl Into<String>, now: Instant) -> Result<Self> {
        let backoff = Backoff::start(&retry.backoff_settings, now)?;
        Ok(Self {
            retry,
            api_name: api_name.into(),
            backoff,
            errors: Vec::new(),
            state: RetryState::Attempt,
        })
    }

    pub fn state(&self) -> &RetryState {
        &self.state
    }

    /// Every error seen so far, oldest first.
    pub fn errors(&self) -> &[GaxError] {
        &self.errors
    }

    pub fn retries(&self) -> u32 {
        self.backoff.retries()
    }

    /// Checks the budget and returns the timeout for the attempt about to be
    /// issued.
    pub fn begin_attempt(&mut self, now: Instant) -> Result<Option<Duration>> {
        let checked = self.backoff.check_budget(
            now,
            self.backoff.retries(),
            &self.api_name,
            self.errors.last(),
        );
        if let Err(err) = checked {
            self.state = RetryState::Done;
            return Err(err.with_error_summary(&self.errors));
        }
        self.state = RetryState::Attempt;
        Ok(self.backoff.timeout())
    }

    pub fn on_success(&mut self) {
        self.state = RetryState::Done;
    }

    /// Classifies a failed attempt: `Ok(sleep)` to retry after `sleep`, `Err`
    /// with the error to surface.
    pub fn on_error(&mut self, err: GaxError) -> Result<Duration> {
        self.errors.push(err.clone());
        if !self.retry.is_retryable(&err) {
            self.state = RetryState::Done;
            return Err(err.with_note(NOT_TRANSIENT_NOTE));
        }
        let sleep = self.backoff.jittered_delay();
        self.state = RetryState::Sleep(sleep);
        Ok(sleep)
    }

    pub fn on_sleep_elapsed(&mut self, now: Instant) {
        self.backoff.advance(now);
        self.state = RetryState::Attempt;
    }

    /// Drives the machine to completion against `transport`.
    pub async fn run(
        mut self,
        transport: Arc<dyn UnaryTransport>,
        request: Value,
        other_args: OtherArgs,
    ) -> Result<Value> {
        loop {
            let timeout = self.begin_attempt(Instant::now())?;
            let options = AttemptOptions::new(timeout, &other_args).with_retries(self.retries());
            let attempt = transport.invoke(request.clone(), options);
            match with_timeout(timeout, attempt).await {
                Ok(response) => {
                    self.on_success();
                    return Ok(response);
                }
                Err(err) => {
                    let sleep = self.on_error(err)?;
                    #[cfg(feature = "tracing")]
                    tracing::debug!(
                        api = %self.api_name,
                        retries = self.retries(),
                        sleep_ms = sleep.as_millis() as u64,
                        "retrying call after transient error"
                    );
                    tokio::time::sleep(sleep).await;
                    self.on_sleep_elapsed(Instant::now());
                }
            }
        }
    }
}

async fn with_timeout(
    timeout: Option<Duration>,
    attempt: BoxFuture<'static, Result<Value>>,
) -> Result<Value> {
    match timeout {
        Some(timeout) => tokio::time::timeout(timeout, attempt)
            .await
            .unwrap_or_else(|_| {
                Err(GaxError::deadline_exceeded(format!(
                    "Attempt timed out after {} ms",
                    timeout.as_millis()
                )))
            }),
        None => attempt.await,
    }
}

/// Rejects settings that can never run, before any network action.
pub(crate) fn validate_settings(settings: &CallSettings) -> Result<()> {
    match &settings.retry {
        Some(retry) => retry.backoff_settings.validate(),
        None => Ok(()),
    }
}

/// One logical call under `settings`: retried when the settings classify
/// any error as transient, a single attempt bounded by `settings.timeout`
/// otherwise.
pub(crate) fn call_future(
    transport: Arc<dyn UnaryTransport>,
    request: Value,
    settings: &CallSettings,
) -> BoxFuture<'static, Result<Value>> {
    let other_args = settings.other_args.clone();
    match &settings.retry {
        Some(retry) if retry.can_retry() => {
            match RetryExecutor::new(retry.clone(), settings.api_name.clone(), Instant::now()) {
                Ok(executor) => executor.run(transport, request, other_args).boxed(),
                Err(err) => future::ready(Err(err)).boxed(),
            }
        }
        _ => {
            let timeout = settings.timeout;
            async move {
                let attempt = transport.invoke(request, AttemptOptions::new(timeout, &other_args));
                with_timeout(timeout, attempt).await
            }
            .boxed()
        }
    }
}

/// Binds `transport` and `settings` into an [`ApiCallFn`].
pub(crate) fn api_call_fn(transport: Arc<dyn UnaryTransport>, settings: CallSettings) -> ApiCallFn {
    Arc::new(move |request| call_future(Arc::clone(&transport), request, &settings))
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::time::Instant;

    use super::{RetryExecutor, RetryState};
    use crate::{BackoffSettings, Code, GaxError, RetryOptions};

    fn executor(backoff: BackoffSettings) -> RetryExecutor {
        let retry = RetryOptions::new([Code::Unavailable], backoff);
        RetryExecutor::new(retry, "Echo", Instant::now()).expect("valid settings")
    }

    #[test]
    fn retryable_error_moves_to_sleep() {
        let mut exec = executor(BackoffSettings::with_max_retries(100, 2.0, 1_000, None, None, None, 3));
        assert_eq!(exec.begin_attempt(Instant::now()).expect("within budget"), None);
        let sleep = exec
            .on_error(GaxError::new(Code::Unavailable, "down"))
            .expect("retryable");
        assert!(sleep <= Duration::from_millis(100));
        assert_eq!(exec.state(), &RetryState::Sleep(sleep));
        exec.on_sleep_elapsed(Instant::now());
        assert_eq!(exec.state(), &RetryState::Attempt);
        assert_eq!(exec.retries(), 1);
    }

    #[test]
    fn non_retryable_error_is_annotated() {
        let mut exec = executor(BackoffSettings::default());
        let err = exec
            .on_error(GaxError::new(Code::DeadlineExceeded, "slow"))
            .expect_err("not retryable");
        assert_eq!(err.code, Code::DeadlineExceeded);
        assert!(err
            .note
            .as_deref()
            .is_some_and(|note| note.contains("not classified as transient")));
        assert_eq!(exec.state(), &RetryState::Done);
    }

    #[test]
    fn exhausted_retries_report_all_errors() {
        let mut exec = executor(BackoffSettings::with_max_retries(1, 1.0, 1, None, None, None, 1));
        let now = Instant::now();
        exec.begin_attempt(now).expect("first attempt");
        exec.on_error(GaxError::new(Code::Unavailable, "one")).expect("retry");
        exec.on_sleep_elapsed(now);
        exec.begin_attempt(now).expect("second attempt");
        exec.on_error(GaxError::new(Code::Unavailable, "two")).expect("retry");
        exec.on_sleep_elapsed(now);

        let err = exec.begin_attempt(now).expect_err("budget exhausted");
        assert_eq!(err.code, Code::DeadlineExceeded);
        assert!(err.message.contains("Exceeded maximum number of retries"));
        assert!(err.message.contains("retrying error UNAVAILABLE: two"));
        assert!(err.message.contains("Previous errors"));
        assert_eq!(exec.errors().len(), 2);
        assert_eq!(exec.state(), &RetryState::Done);
    }

    #[test]
    fn total_timeout_bounds_attempt_timeout() {
        let backoff = BackoffSettings::with_total_timeout(10, 1.0, 10, Some(5_000), Some(1.0), Some(5_000), 2_000);
        let mut exec = executor(backoff);
        let timeout = exec.begin_attempt(Instant::now()).expect("within budget");
        assert_eq!(timeout, Some(Duration::from_millis(2_000)));
    }
}
