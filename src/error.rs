use serde_json::Value;

use crate::Code;

/// Error type returned by this crate.
///
/// Transport failures, configuration problems, exhausted retry budgets and
/// cancellations all surface as a `GaxError` carrying a canonical [`Code`].
#[derive(Clone, Debug, PartialEq, thiserror::Error)]
#[error("{code}: {message}")]
pub struct GaxError {
    /// Canonical status code.
    pub code: Code,
    /// Human-readable message.
    pub message: String,
    /// Diagnostic note added by the retry machinery.
    pub note: Option<String>,
    /// Structured error details, passed through undecoded.
    pub details: Vec<Value>,
}

impl GaxError {
    pub fn new(code: Code, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            note: None,
            details: Vec::new(),
        }
    }

    /// Configuration error raised before any network action.
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::new(Code::InvalidArgument, message)
    }

    pub fn deadline_exceeded(message: impl Into<String>) -> Self {
        Self::new(Code::DeadlineExceeded, message)
    }

    pub fn cancelled() -> Self {
        Self::new(Code::Cancelled, "cancelled")
    }

    pub fn with_note(mut self, note: impl Into<String>) -> Self {
        self.note = Some(note.into());
        self
    }

    pub fn with_details(mut self, details: Vec<Value>) -> Self {
        self.details = details;
        self
    }

    /// Appends a compact summary of every error seen during a retried call.
    ///
    /// A single error is not summarized: it is already the one being reported.
    pub(crate) fn with_error_summary(mut self, errors: &[GaxError]) -> Self {
        if errors.len() < 2 {
            return self;
        }
        let summary = errors
            .iter()
            .map(|err| {
                let details = err
                    .details
                    .iter()
                    .map(Value::to_string)
                    .collect::<Vec<_>>()
                    .join(", ");
                format!(
                    "[message: {}, code: {}, details: {}, note: {}]",
                    err.message,
                    err.code.as_i32(),
                    details,
                    err.note.as_deref().unwrap_or("")
                )
            })
            .collect::<Vec<_>>()
            .join(", ");
        self.message = format!("{} : Previous errors : {summary}", self.message);
        self
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use crate::{Code, GaxError};

    #[test]
    fn display_includes_code_name() {
        let err = GaxError::new(Code::Unavailable, "backend down");
        assert_eq!(err.to_string(), "UNAVAILABLE: backend down");
    }

    #[test]
    fn single_error_is_not_summarized() {
        let first = GaxError::new(Code::Unavailable, "first");
        let err = GaxError::deadline_exceeded("gave up").with_error_summary(&[first]);
        assert_eq!(err.message, "gave up");
    }

    #[test]
    fn multiple_errors_are_summarized_in_order() {
        let errors = vec![
            GaxError::new(Code::Unavailable, "first").with_details(vec![json!({"a": 1})]),
            GaxError::new(Code::Unavailable, "second").with_note("transient"),
        ];
        let err = GaxError::deadline_exceeded("gave up").with_error_summary(&errors);
        assert!(err.message.starts_with("gave up : Previous errors : "));
        let first = err.message.find("message: first").expect("first error listed");
        let second = err.message.find("message: second").expect("second error listed");
        assert!(first < second);
        assert!(err.message.contains("code: 14"));
        assert!(err.message.contains("{\"a\":1}"));
        assert!(err.message.contains("note: transient"));
    }
}
