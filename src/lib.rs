//! `rpc-gax` is the client-side call runtime of generated RPC clients.
//!
//! It sits between a generated method stub and the transport and adds:
//! - retries with exponential backoff and jitter ([`ApiCall::call`])
//! - server-stream retries with request resumption ([`StreamingApiCall::call`])
//! - request bundling ([`BundleExecutor`])
//! - page-token pagination ([`PagedCaller`])
//!
//! Per-method defaults come from a JSON client config
//! ([`construct_settings`]); per-call [`CallOptions`] are merged over them.

mod api_call;
mod backoff;
mod bundling;
mod config;
mod error;
mod http;
mod paging;
mod retry;
mod settings;
mod status;
mod streaming;
mod transport;
mod unary;

pub use api_call::{ApiCall, Descriptor, StreamingApiCall};
pub use backoff::{Backoff, BackoffSettings};
pub use bundling::{BundleDescriptor, BundleExecutor, BundleOptions, ByteLengthFn};
pub use config::{construct_settings, ClientConfig, InterfaceConfig, MethodConfig, RetryParams};
pub use error::GaxError;
pub use http::{HttpJsonTransport, HttpMethod};
pub use paging::{Page, PageDescriptor, PagedCaller};
pub use retry::{
    ResumptionRequestFn, RetryOptions, RetryOptionsPatch, RetryRequestOptions, ShouldRetryFn,
};
pub use settings::{CallOptions, CallSettings, OtherArgs, Override};
pub use status::Code;
pub use streaming::{
    CallStream, LegacyRetry, ResumableRetry, StreamDescriptor, StreamRetryExecutor,
    StreamRetryStrategy,
};
pub use transport::{
    AttemptOptions, EventStream, ResponseInfo, StreamEvent, StreamingTransport, UnaryTransport,
};
pub use unary::{ApiCallFn, OngoingCall, RetryExecutor, RetryState};

pub type Result<T> = std::result::Result<T, GaxError>;
