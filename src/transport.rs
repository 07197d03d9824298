//! Contracts between the call engine and the transport that moves bytes.
//!
//! The engine never talks to a channel or HTTP client directly. It invokes a
//! [`UnaryTransport`] or opens a [`StreamingTransport`] once per attempt and
//! cancels an attempt by dropping the returned future or stream.

use std::future::Future;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::stream::{BoxStream, Stream};
use futures::{FutureExt, StreamExt};
use serde_json::Value;
use tokio::time::Instant;

use crate::{OtherArgs, Result};

/// Per-attempt options handed to the transport.
#[derive(Clone, Debug, Default)]
pub struct AttemptOptions {
    /// Timeout of this attempt.
    pub timeout: Option<Duration>,
    /// Absolute deadline of this attempt, derived from `timeout`.
    pub deadline: Option<Instant>,
    pub other_args: OtherArgs,
    /// Retries that preceded this attempt within the logical call.
    pub retries: u32,
}

impl AttemptOptions {
    pub(crate) fn new(timeout: Option<Duration>, other_args: &OtherArgs) -> Self {
        Self {
            timeout,
            deadline: timeout.map(|t| Instant::now() + t),
            other_args: other_args.clone(),
            retries: 0,
        }
    }

    pub(crate) fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }
}

/// Single request, single response.
pub trait UnaryTransport: Send + Sync + 'static {
    fn invoke(&self, request: Value, options: AttemptOptions) -> BoxFuture<'static, Result<Value>>;
}

impl<F, Fut> UnaryTransport for F
where
    F: Fn(Value, AttemptOptions) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value>> + Send + 'static,
{
    fn invoke(&self, request: Value, options: AttemptOptions) -> BoxFuture<'static, Result<Value>> {
        self(request, options).boxed()
    }
}

/// Status line of a server stream, in the shape HTTP callers expect.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResponseInfo {
    pub code: u16,
    pub message: String,
}

impl ResponseInfo {
    pub(crate) fn ok() -> Self {
        Self {
            code: 200,
            message: "OK".to_owned(),
        }
    }
}

/// One event of a server-streaming call.
///
/// A transport yields `Metadata`, `Status` and `Data`; an `Err` item is the
/// stream's error and the end of the stream is its clean end. `Response` is
/// synthesized by the call engine.
#[derive(Clone, Debug, PartialEq)]
pub enum StreamEvent {
    Metadata(Value),
    Status(Value),
    Response(ResponseInfo),
    Data(Value),
}

pub type EventStream = BoxStream<'static, Result<StreamEvent>>;

/// Single request, stream of events.
pub trait StreamingTransport: Send + Sync + 'static {
    fn open(&self, request: Value, options: AttemptOptions) -> EventStream;
}

impl<F, S> StreamingTransport for F
where
    F: Fn(Value, AttemptOptions) -> S + Send + Sync + 'static,
    S: Stream<Item = Result<StreamEvent>> + Send + 'static,
{
    fn open(&self, request: Value, options: AttemptOptions) -> EventStream {
        self(request, options).boxed()
    }
}
