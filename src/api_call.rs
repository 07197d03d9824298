//! Call orchestration: one entry point per RPC method.

use std::sync::Arc;

use futures::stream::BoxStream;
use futures::FutureExt;
use serde_json::Value;

use crate::bundling::{BundleDescriptor, BundleExecutor};
use crate::paging::{Page, PageDescriptor, PagedCaller};
use crate::streaming::{self, CallStream, StreamDescriptor};
use crate::unary::{api_call_fn, call_future, validate_settings, OngoingCall};
use crate::{CallOptions, CallSettings, GaxError, Result, StreamingTransport, UnaryTransport};

/// What kind of unary method a call targets.
#[derive(Clone, Debug)]
pub enum Descriptor {
    Normal,
    Bundling(BundleDescriptor),
    Paging(PageDescriptor),
}

/// A unary RPC method bound to its transport and default settings.
pub struct ApiCall {
    transport: Arc<dyn UnaryTransport>,
    settings: CallSettings,
    descriptor: Descriptor,
    bundler: Option<BundleExecutor>,
}

impl std::fmt::Debug for ApiCall {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiCall")
            .field("settings", &self.settings)
            .field("descriptor", &self.descriptor)
            .finish_non_exhaustive()
    }
}

impl ApiCall {
    /// Bundling methods share one [`BundleExecutor`], created when
    /// `settings.bundle_options` is configured.
    pub fn new(transport: impl UnaryTransport, settings: CallSettings, descriptor: Descriptor) -> Self {
        let bundler = match (&descriptor, &settings.bundle_options) {
            (Descriptor::Bundling(bundle), Some(options)) => {
                Some(BundleExecutor::new(options.clone(), bundle.clone()))
            }
            _ => None,
        };
        Self {
            transport: Arc::new(transport),
            settings,
            descriptor,
            bundler,
        }
    }

    pub fn settings(&self) -> &CallSettings {
        &self.settings
    }

    pub fn bundler(&self) -> Option<&BundleExecutor> {
        self.bundler.as_ref()
    }

    /// Starts one logical call.
    ///
    /// Configuration errors are returned here, before any network action.
    /// Paginated methods resolve to the flattened resource array when
    /// auto-paginating and to the single raw page otherwise.
    pub fn call(&self, request: Value, options: CallOptions) -> Result<OngoingCall> {
        let settings = self.prepare(options)?;
        let transport = Arc::clone(&self.transport);
        match &self.descriptor {
            Descriptor::Normal => Ok(OngoingCall::spawn(call_future(transport, request, &settings))),
            Descriptor::Bundling(_) => match &self.bundler {
                Some(bundler) if settings.is_bundling => {
                    bundler.schedule(api_call_fn(transport, settings), request)
                }
                _ => Ok(OngoingCall::spawn(call_future(transport, request, &settings))),
            },
            Descriptor::Paging(descriptor) => {
                let max_results = settings.max_results;
                let auto_paginate = settings.auto_paginate;
                let caller = PagedCaller::new(api_call_fn(transport, settings), descriptor.clone());
                let call = async move {
                    if auto_paginate {
                        caller.collect_all(request, max_results).await.map(Value::Array)
                    } else {
                        caller.page(request, max_results).await.map(|page| page.raw_response)
                    }
                };
                Ok(OngoingCall::spawn(call.boxed()))
            }
        }
    }

    /// Fetches a single page of a paginated method.
    pub async fn page(&self, request: Value, options: CallOptions) -> Result<Page> {
        let (caller, max_results) = self.paged_caller(options)?;
        caller.page(request, max_results).await
    }

    /// Lazily streams resources of a paginated method.
    pub fn resources(&self, request: Value, options: CallOptions) -> Result<BoxStream<'static, Result<Value>>> {
        let (caller, max_results) = self.paged_caller(options)?;
        Ok(caller.resources(request, max_results))
    }

    fn paged_caller(&self, options: CallOptions) -> Result<(PagedCaller, Option<usize>)> {
        let Descriptor::Paging(descriptor) = &self.descriptor else {
            return Err(GaxError::invalid_argument(format!(
                "{} is not a paginated method",
                self.settings.api_name
            )));
        };
        let settings = self.prepare(options)?;
        let max_results = settings.max_results;
        let caller = PagedCaller::new(
            api_call_fn(Arc::clone(&self.transport), settings),
            descriptor.clone(),
        );
        Ok((caller, max_results))
    }

    fn prepare(&self, options: CallOptions) -> Result<CallSettings> {
        let settings = self.settings.merge(options)?;
        validate_settings(&settings)?;
        Ok(settings)
    }
}

/// A server-streaming RPC method bound to its transport and default settings.
pub struct StreamingApiCall {
    transport: Arc<dyn StreamingTransport>,
    settings: CallSettings,
    descriptor: StreamDescriptor,
}

impl std::fmt::Debug for StreamingApiCall {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamingApiCall")
            .field("settings", &self.settings)
            .field("descriptor", &self.descriptor)
            .finish_non_exhaustive()
    }
}

impl StreamingApiCall {
    pub fn new(
        transport: impl StreamingTransport,
        settings: CallSettings,
        descriptor: StreamDescriptor,
    ) -> Self {
        Self {
            transport: Arc::new(transport),
            settings,
            descriptor,
        }
    }

    pub fn settings(&self) -> &CallSettings {
        &self.settings
    }

    /// Starts a streaming call.
    ///
    /// Under the legacy protocol, `retry_request_options` configure the
    /// legacy retries directly instead of being converted.
    pub fn call(&self, request: Value, mut options: CallOptions) -> Result<CallStream> {
        let legacy = if self.descriptor.gax_streaming_retries {
            None
        } else {
            options.retry_request_options.take()
        };
        if legacy.is_some() && !options.retry.is_keep() {
            return Err(GaxError::invalid_argument(
                "Only one of retry or retryRequestOptions may be set",
            ));
        }
        let settings = self.settings.merge(options)?;
        streaming::start(
            Arc::clone(&self.transport),
            request,
            &settings,
            &self.descriptor,
            legacy.as_ref(),
        )
    }
}
