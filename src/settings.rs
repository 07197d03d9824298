//! Effective per-call configuration and the per-call override merge.

use std::collections::BTreeMap;
use std::time::Duration;

use serde_json::Value;

use crate::{BundleOptions, GaxError, Result, RetryOptions, RetryOptionsPatch, RetryRequestOptions};

/// Extra per-call arguments forwarded to the transport (headers, metadata).
pub type OtherArgs = BTreeMap<String, Value>;

/// Three-state override: leave the base alone, clear it, or replace it.
#[derive(Clone, Debug)]
pub enum Override<T> {
    Keep,
    Clear,
    Set(T),
}

impl<T> Default for Override<T> {
    fn default() -> Self {
        Self::Keep
    }
}

impl<T> Override<T> {
    pub fn is_keep(&self) -> bool {
        matches!(self, Self::Keep)
    }
}

/// Effective configuration for one RPC method.
#[derive(Clone, Debug)]
pub struct CallSettings {
    /// Timeout of a call without retry.
    pub timeout: Option<Duration>,
    /// Retry policy; `None` disables retry.
    pub retry: Option<RetryOptions>,
    /// Flatten paged responses into one resource list.
    pub auto_paginate: bool,
    /// Cap on the number of resources collected by auto-pagination.
    pub max_results: Option<usize>,
    pub bundle_options: Option<BundleOptions>,
    /// Whether bundling-enabled methods actually bundle.
    pub is_bundling: bool,
    /// Name used in diagnostics.
    pub api_name: String,
    pub other_args: OtherArgs,
}

impl Default for CallSettings {
    fn default() -> Self {
        Self {
            timeout: Some(Duration::from_millis(30_000)),
            retry: None,
            auto_paginate: true,
            max_results: None,
            bundle_options: None,
            is_bundling: true,
            api_name: String::new(),
            other_args: OtherArgs::new(),
        }
    }
}

/// Per-call overrides. An absent field keeps the base value.
#[derive(Clone, Debug, Default)]
pub struct CallOptions {
    pub timeout: Option<Duration>,
    pub retry: Override<RetryOptionsPatch>,
    pub max_retries: Option<u32>,
    /// Deprecated seconds-based retry shape; see [`RetryRequestOptions`].
    pub retry_request_options: Option<RetryRequestOptions>,
    pub auto_paginate: Option<bool>,
    pub max_results: Option<usize>,
    pub is_bundling: Option<bool>,
    pub bundle_options: Option<BundleOptions>,
    pub api_name: Option<String>,
    pub other_args: Option<OtherArgs>,
}

impl CallOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Replaces the given retry fields for this call.
    pub fn with_retry(mut self, retry: impl Into<RetryOptionsPatch>) -> Self {
        self.retry = Override::Set(retry.into());
        self
    }

    /// Disables retry for this call.
    pub fn without_retry(mut self) -> Self {
        self.retry = Override::Clear;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    pub fn with_auto_paginate(mut self, auto_paginate: bool) -> Self {
        self.auto_paginate = Some(auto_paginate);
        self
    }

    pub fn with_max_results(mut self, max_results: usize) -> Self {
        self.max_results = Some(max_results);
        self
    }

    pub fn with_bundling(mut self, is_bundling: bool) -> Self {
        self.is_bundling = Some(is_bundling);
        self
    }

    pub fn with_other_arg(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.other_args
            .get_or_insert_with(OtherArgs::new)
            .insert(key.into(), value.into());
        self
    }

    /// Converts deprecated `retry_request_options` into `retry`.
    pub fn convert_retry_request_options(mut self) -> Result<Self> {
        let Some(legacy) = self.retry_request_options.take() else {
            return Ok(self);
        };
        if !self.retry.is_keep() {
            return Err(GaxError::invalid_argument(
                "Only one of retry or retryRequestOptions may be set",
            ));
        }
        self.retry = Override::Set(legacy.to_retry_options()?.into());
        Ok(self)
    }
}

impl CallSettings {
    /// Returns a new configuration with `options` applied on top of `self`.
    ///
    /// A timeout override also bounds retries: it becomes the initial and
    /// maximum RPC timeout and, unless the retry budget is a retry count, the
    /// total timeout.
    pub fn merge(&self, options: CallOptions) -> Result<CallSettings> {
        let options = options.convert_retry_request_options()?;
        let mut merged = self.clone();

        if let Some(timeout) = options.timeout {
            merged.timeout = Some(timeout);
        }

        merged.retry = match &options.retry {
            Override::Keep => merged.retry,
            Override::Clear => None,
            Override::Set(patch) => patch.apply(merged.retry.as_ref()),
        };

        if let Some(max_retries) = options.max_retries {
            if let Some(retry) = merged.retry.as_mut() {
                retry.backoff_settings.max_retries = Some(max_retries);
                retry.backoff_settings.total_timeout_millis = None;
            }
        }

        if let (Some(timeout), Some(retry)) = (options.timeout, merged.retry.as_mut()) {
            let millis = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
            let backoff = &mut retry.backoff_settings;
            backoff.initial_rpc_timeout_millis = Some(millis);
            backoff.max_rpc_timeout_millis = Some(millis);
            if backoff.max_retries().is_none() {
                backoff.total_timeout_millis = Some(millis);
            }
        }

        if let Some(auto_paginate) = options.auto_paginate {
            merged.auto_paginate = auto_paginate;
        }
        if let Some(max_results) = options.max_results {
            merged.max_results = Some(max_results);
        }
        if let Some(is_bundling) = options.is_bundling {
            merged.is_bundling = is_bundling;
        }
        if let Some(bundle_options) = options.bundle_options {
            merged.bundle_options = Some(bundle_options);
        }
        if let Some(api_name) = options.api_name {
            merged.api_name = api_name;
        }
        if let Some(other_args) = options.other_args {
            merged.other_args.extend(other_args);
        }

        if let Some(retry) = &merged.retry {
            retry.backoff_settings.validate()?;
        }
        Ok(merged)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;

    use super::{CallOptions, CallSettings, Override};
    use crate::{
        BackoffSettings, Code, RetryOptions, RetryOptionsPatch, RetryRequestOptions,
    };

    fn base() -> CallSettings {
        CallSettings {
            retry: Some(RetryOptions::new(
                [Code::Unavailable],
                BackoffSettings::with_total_timeout(100, 1.3, 60_000, Some(20_000), Some(1.0), Some(20_000), 600_000),
            )),
            api_name: "Echo".to_owned(),
            ..CallSettings::default()
        }
    }

    #[test]
    fn absent_fields_keep_base() {
        let merged = base().merge(CallOptions::new()).expect("merges");
        assert_eq!(merged.timeout, Some(Duration::from_secs(30)));
        assert!(merged.auto_paginate);
        assert_eq!(merged.api_name, "Echo");
        assert_eq!(merged.retry.expect("retry kept").retry_codes, vec![Code::Unavailable]);
    }

    #[test]
    fn falsy_overrides_still_apply() {
        let merged = base()
            .merge(CallOptions::new().with_auto_paginate(false).with_bundling(false))
            .expect("merges");
        assert!(!merged.auto_paginate);
        assert!(!merged.is_bundling);
    }

    #[test]
    fn clear_disables_retry() {
        let merged = base().merge(CallOptions::new().without_retry()).expect("merges");
        assert!(merged.retry.is_none());
    }

    #[test]
    fn timeout_cascades_into_backoff() {
        let merged = base()
            .merge(CallOptions::new().with_timeout(Duration::from_millis(1_500)))
            .expect("merges");
        let backoff = merged.retry.expect("retry kept").backoff_settings;
        assert_eq!(backoff.initial_rpc_timeout_millis, Some(1_500));
        assert_eq!(backoff.max_rpc_timeout_millis, Some(1_500));
        assert_eq!(backoff.total_timeout_millis, Some(1_500));
    }

    #[test]
    fn max_retries_removes_total_timeout() {
        let merged = base()
            .merge(
                CallOptions::new()
                    .with_max_retries(5)
                    .with_timeout(Duration::from_millis(800)),
            )
            .expect("merges");
        let backoff = merged.retry.expect("retry kept").backoff_settings;
        assert_eq!(backoff.max_retries, Some(5));
        assert_eq!(backoff.total_timeout_millis, None);
        assert_eq!(backoff.max_rpc_timeout_millis, Some(800));
    }

    #[test]
    fn partial_retry_patch_keeps_other_fields() {
        let patch = RetryOptionsPatch {
            retry_codes: Some(vec![Code::Aborted, Code::Unavailable]),
            ..Default::default()
        };
        let merged = base().merge(CallOptions::new().with_retry(patch)).expect("merges");
        let retry = merged.retry.expect("retry kept");
        assert_eq!(retry.retry_codes, vec![Code::Aborted, Code::Unavailable]);
        assert_eq!(retry.backoff_settings.total_timeout_millis, Some(600_000));
    }

    #[test]
    fn merging_both_budgets_is_rejected() {
        let mut backoff = BackoffSettings::default();
        backoff.max_retries = Some(3);
        let patch = RetryOptionsPatch {
            backoff_settings: Some(backoff),
            ..Default::default()
        };
        let err = base()
            .merge(CallOptions::new().with_retry(patch))
            .expect_err("both budgets set");
        assert_eq!(err.code, Code::InvalidArgument);
    }

    #[test]
    fn other_args_union_overrides_win() {
        let mut settings = base();
        settings.other_args.insert("a".to_owned(), json!(1));
        settings.other_args.insert("b".to_owned(), json!(2));
        let merged = settings
            .merge(CallOptions::new().with_other_arg("b", 20).with_other_arg("c", 30))
            .expect("merges");
        assert_eq!(merged.other_args["a"], json!(1));
        assert_eq!(merged.other_args["b"], json!(20));
        assert_eq!(merged.other_args["c"], json!(30));
    }

    #[test]
    fn legacy_retry_request_options_are_converted() {
        let options = CallOptions {
            retry_request_options: Some(RetryRequestOptions {
                retries: Some(2),
                ..Default::default()
            }),
            ..Default::default()
        };
        let merged = base().merge(options).expect("merges");
        let backoff = merged.retry.expect("retry kept").backoff_settings;
        assert_eq!(backoff.max_retries, Some(2));
        assert_eq!(backoff.total_timeout_millis, None);
    }

    #[test]
    fn retry_and_legacy_options_together_are_rejected() {
        let options = CallOptions {
            retry: Override::Clear,
            retry_request_options: Some(RetryRequestOptions::default()),
            ..Default::default()
        };
        let err = base().merge(options).expect_err("must reject");
        assert_eq!(err.code, Code::InvalidArgument);
    }
}
