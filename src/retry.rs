//! Retry classification and the options that drive the retry executors.

use std::fmt;
use std::sync::Arc;

use serde_json::Value;

use crate::{BackoffSettings, Code, GaxError, Result};

/// Caller-supplied retry predicate, an alternative to code membership.
pub type ShouldRetryFn = Arc<dyn Fn(&GaxError) -> bool + Send + Sync>;

/// Rewrites the original request into a "continue from here" request after a
/// retryable stream failure. `None` retries with the original request.
pub type ResumptionRequestFn = Arc<dyn Fn(&Value) -> Option<Value> + Send + Sync>;

pub(crate) const NOT_TRANSIENT_NOTE: &str =
    "Exception occurred in retry method that was not classified as transient";

/// Retry policy for one RPC method.
#[derive(Clone)]
pub struct RetryOptions {
    /// Codes that are retried. Empty means no code is retryable.
    pub retry_codes: Vec<Code>,
    pub backoff_settings: BackoffSettings,
    pub should_retry_fn: Option<ShouldRetryFn>,
    pub resumption_request_fn: Option<ResumptionRequestFn>,
}

impl fmt::Debug for RetryOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryOptions")
            .field("retry_codes", &self.retry_codes)
            .field("backoff_settings", &self.backoff_settings)
            .field("should_retry_fn", &self.should_retry_fn.as_ref().map(|_| "<fn>"))
            .field(
                "resumption_request_fn",
                &self.resumption_request_fn.as_ref().map(|_| "<fn>"),
            )
            .finish()
    }
}

impl RetryOptions {
    pub fn new(retry_codes: impl Into<Vec<Code>>, backoff_settings: BackoffSettings) -> Self {
        Self {
            retry_codes: retry_codes.into(),
            backoff_settings,
            should_retry_fn: None,
            resumption_request_fn: None,
        }
    }

    pub fn with_should_retry_fn<F>(mut self, f: F) -> Self
    where
        F: Fn(&GaxError) -> bool + Send + Sync + 'static,
    {
        self.should_retry_fn = Some(Arc::new(f));
        self
    }

    pub fn with_resumption_request_fn<F>(mut self, f: F) -> Self
    where
        F: Fn(&Value) -> Option<Value> + Send + Sync + 'static,
    {
        self.resumption_request_fn = Some(Arc::new(f));
        self
    }

    /// Whether `err` should be retried: the predicate when one is set,
    /// otherwise membership in `retry_codes`.
    pub fn is_retryable(&self, err: &GaxError) -> bool {
        match &self.should_retry_fn {
            Some(should_retry) => should_retry(err),
            None => self.retry_codes.contains(&err.code),
        }
    }

    /// Whether any classification is configured at all.
    pub fn can_retry(&self) -> bool {
        self.should_retry_fn.is_some() || !self.retry_codes.is_empty()
    }

    /// Codes and predicate are mutually exclusive for resumable streams.
    pub fn validate_classification(&self) -> Result<()> {
        if !self.retry_codes.is_empty() && self.should_retry_fn.is_some() {
            return Err(GaxError::invalid_argument(
                "Only one of retryCodes or shouldRetryFn may be defined",
            ));
        }
        Ok(())
    }

    /// Request for the next attempt of a stream.
    pub(crate) fn resumption_request(&self, original: &Value) -> Value {
        self.resumption_request_fn
            .as_ref()
            .and_then(|resume| resume(original))
            .unwrap_or_else(|| original.clone())
    }
}

/// Partial retry override. Each field present replaces the base value.
#[derive(Clone, Default)]
pub struct RetryOptionsPatch {
    pub retry_codes: Option<Vec<Code>>,
    pub backoff_settings: Option<BackoffSettings>,
    pub should_retry_fn: Option<ShouldRetryFn>,
    pub resumption_request_fn: Option<ResumptionRequestFn>,
}

impl fmt::Debug for RetryOptionsPatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryOptionsPatch")
            .field("retry_codes", &self.retry_codes)
            .field("backoff_settings", &self.backoff_settings)
            .field("should_retry_fn", &self.should_retry_fn.as_ref().map(|_| "<fn>"))
            .field(
                "resumption_request_fn",
                &self.resumption_request_fn.as_ref().map(|_| "<fn>"),
            )
            .finish()
    }
}

impl RetryOptionsPatch {
    fn is_empty(&self) -> bool {
        self.retry_codes.is_none()
            && self.backoff_settings.is_none()
            && self.should_retry_fn.is_none()
            && self.resumption_request_fn.is_none()
    }

    /// Shallow-merges the patch onto `base`.
    pub fn apply(&self, base: Option<&RetryOptions>) -> Option<RetryOptions> {
        if self.is_empty() {
            return base.cloned();
        }
        let base = base
            .cloned()
            .unwrap_or_else(|| RetryOptions::new(Vec::new(), BackoffSettings::default()));
        Some(RetryOptions {
            retry_codes: self.retry_codes.clone().unwrap_or(base.retry_codes),
            backoff_settings: self
                .backoff_settings
                .clone()
                .unwrap_or(base.backoff_settings),
            should_retry_fn: self.should_retry_fn.clone().or(base.should_retry_fn),
            resumption_request_fn: self
                .resumption_request_fn
                .clone()
                .or(base.resumption_request_fn),
        })
    }
}

impl From<RetryOptions> for RetryOptionsPatch {
    fn from(options: RetryOptions) -> Self {
        Self {
            retry_codes: Some(options.retry_codes),
            backoff_settings: Some(options.backoff_settings),
            should_retry_fn: options.should_retry_fn,
            resumption_request_fn: options.resumption_request_fn,
        }
    }
}

/// Legacy, seconds-based retry options.
///
/// Deprecated: pass [`RetryOptions`] through `CallOptions::retry` instead.
/// Kept so existing callers can migrate; converted once per call by
/// [`RetryRequestOptions::to_retry_options`].
#[derive(Clone, Default)]
pub struct RetryRequestOptions {
    /// Not supported; always on internally.
    pub object_mode: Option<bool>,
    pub retries: Option<u32>,
    /// Seconds.
    pub max_retry_delay: Option<f64>,
    pub retry_delay_multiplier: Option<f64>,
    /// Seconds.
    pub total_timeout: Option<f64>,
    /// Not supported; use retry codes or a predicate.
    pub no_response_retries: Option<u32>,
    /// Not supported; attempts are tracked internally.
    pub current_retry_attempt: Option<u32>,
    pub should_retry_fn: Option<ShouldRetryFn>,
}

impl fmt::Debug for RetryRequestOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryRequestOptions")
            .field("object_mode", &self.object_mode)
            .field("retries", &self.retries)
            .field("max_retry_delay", &self.max_retry_delay)
            .field("retry_delay_multiplier", &self.retry_delay_multiplier)
            .field("total_timeout", &self.total_timeout)
            .field("no_response_retries", &self.no_response_retries)
            .field("current_retry_attempt", &self.current_retry_attempt)
            .field("should_retry_fn", &self.should_retry_fn.as_ref().map(|_| "<fn>"))
            .finish()
    }
}

impl RetryRequestOptions {
    #[cfg(feature = "tracing")]
    fn warn_unsupported(&self) {
        tracing::warn!(
            "retryRequestOptions will be deprecated in a future release; pass retry options at call time instead"
        );
        if self.object_mode.is_some() {
            tracing::warn!("objectMode override is not supported; it is always enabled internally");
        }
        if self.no_response_retries.is_some() {
            tracing::warn!(
                "noResponseRetries override is not supported; specify retry codes or a retry predicate"
            );
        }
        if self.current_retry_attempt.is_some() {
            tracing::warn!("currentRetryAttempt override is not supported; retry attempts are tracked internally");
        }
    }

    /// Converts to millisecond-based [`RetryOptions`], logging a warning for
    /// the deprecation and for each parameter without an equivalent.
    pub fn to_retry_options(&self) -> Result<RetryOptions> {
        #[cfg(feature = "tracing")]
        self.warn_unsupported();

        let max_retries = self.retries.filter(|retries| *retries > 0);
        let total_timeout_millis = self
            .total_timeout
            .filter(|secs| *secs > 0.0)
            .map(seconds_to_millis);
        if max_retries.is_some() && total_timeout_millis.is_some() {
            return Err(GaxError::invalid_argument(
                "Cannot set both totalTimeoutMillis and maxRetries in backoffSettings.",
            ));
        }

        let backoff_settings = BackoffSettings {
            initial_retry_delay_millis: 100,
            retry_delay_multiplier: self.retry_delay_multiplier.unwrap_or(2.0),
            max_retry_delay_millis: self.max_retry_delay.map_or(64_000, seconds_to_millis),
            initial_rpc_timeout_millis: None,
            rpc_timeout_multiplier: None,
            max_rpc_timeout_millis: None,
            total_timeout_millis: match max_retries {
                Some(_) => None,
                None => Some(total_timeout_millis.unwrap_or(600_000)),
            },
            max_retries,
        };

        let options = match &self.should_retry_fn {
            Some(should_retry) => RetryOptions {
                retry_codes: Vec::new(),
                backoff_settings,
                should_retry_fn: Some(Arc::clone(should_retry)),
                resumption_request_fn: None,
            },
            None => RetryOptions::new([Code::Unavailable], backoff_settings),
        };
        Ok(options)
    }
}

fn seconds_to_millis(secs: f64) -> u64 {
    (secs * 1000.0).round().max(0.0) as u64
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{RetryOptions, RetryOptionsPatch, RetryRequestOptions};
    use crate::{BackoffSettings, Code, GaxError};

    #[test]
    fn classifies_by_codes_or_predicate() {
        let by_codes = RetryOptions::new([Code::Unavailable], BackoffSettings::default());
        assert!(by_codes.is_retryable(&GaxError::new(Code::Unavailable, "x")));
        assert!(!by_codes.is_retryable(&GaxError::new(Code::DeadlineExceeded, "x")));

        let by_predicate = RetryOptions::new(Vec::new(), BackoffSettings::default())
            .with_should_retry_fn(|err| err.message.contains("again"));
        assert!(by_predicate.is_retryable(&GaxError::new(Code::Internal, "try again")));
        assert!(!by_predicate.is_retryable(&GaxError::new(Code::Unavailable, "x")));
    }

    #[test]
    fn empty_classification_never_retries() {
        let options = RetryOptions::new(Vec::new(), BackoffSettings::default());
        assert!(!options.can_retry());
        assert!(!options.is_retryable(&GaxError::new(Code::Unavailable, "x")));
    }

    #[test]
    fn codes_and_predicate_are_exclusive() {
        let options = RetryOptions::new([Code::Unavailable], BackoffSettings::default())
            .with_should_retry_fn(|_| true);
        let err = options.validate_classification().expect_err("must reject");
        assert_eq!(err.code, Code::InvalidArgument);
    }

    #[test]
    fn resumption_falls_back_to_original_request() {
        let options = RetryOptions::new([Code::Unavailable], BackoffSettings::default())
            .with_resumption_request_fn(|req| {
                req.get("resume").and_then(|v| v.as_bool()).filter(|v| *v).map(|_| json!({"offset": 2}))
            });
        assert_eq!(options.resumption_request(&json!({"resume": true})), json!({"offset": 2}));
        assert_eq!(options.resumption_request(&json!({"resume": false})), json!({"resume": false}));
    }

    #[test]
    fn patch_replaces_only_present_fields() {
        let base = RetryOptions::new([Code::Unavailable], BackoffSettings::default())
            .with_resumption_request_fn(|_| None);
        let patch = RetryOptionsPatch {
            retry_codes: Some(vec![Code::Aborted]),
            ..Default::default()
        };
        let merged = patch.apply(Some(&base)).expect("retry stays enabled");
        assert_eq!(merged.retry_codes, vec![Code::Aborted]);
        assert_eq!(merged.backoff_settings, BackoffSettings::default());
        assert!(merged.resumption_request_fn.is_some());

        assert!(RetryOptionsPatch::default().apply(None).is_none());
    }

    #[test]
    fn legacy_options_convert_seconds_to_millis() {
        let legacy = RetryRequestOptions {
            retries: Some(4),
            max_retry_delay: Some(3.0),
            retry_delay_multiplier: Some(1.5),
            no_response_retries: Some(2),
            ..Default::default()
        };
        let options = legacy.to_retry_options().expect("converts");
        assert_eq!(options.retry_codes, vec![Code::Unavailable]);
        assert_eq!(options.backoff_settings.max_retries, Some(4));
        assert_eq!(options.backoff_settings.total_timeout_millis, None);
        assert_eq!(options.backoff_settings.max_retry_delay_millis, 3_000);
        assert_eq!(options.backoff_settings.retry_delay_multiplier, 1.5);
    }

    #[test]
    fn legacy_predicate_replaces_codes() {
        let legacy = RetryRequestOptions {
            total_timeout: Some(30.0),
            should_retry_fn: Some(std::sync::Arc::new(|_: &GaxError| true)),
            ..Default::default()
        };
        let options = legacy.to_retry_options().expect("converts");
        assert!(options.retry_codes.is_empty());
        assert!(options.should_retry_fn.is_some());
        assert_eq!(options.backoff_settings.total_timeout_millis, Some(30_000));
    }

    #[test]
    fn legacy_rejects_both_budgets() {
        let legacy = RetryRequestOptions {
            retries: Some(2),
            total_timeout: Some(10.0),
            ..Default::default()
        };
        let err = legacy.to_retry_options().expect_err("must reject");
        assert_eq!(err.code, Code::InvalidArgument);
    }
}
