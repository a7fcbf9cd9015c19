//! Closed error taxonomy (spec §4.1, §7).
use std::fmt;

/// Structured context attached to most error kinds: which model/method was
/// being called and a short summary of the arguments, for log correlation.
#[derive(Debug, Clone, Default)]
pub struct ErrorContext {
    pub model: Option<String>,
    pub method: Option<String>,
    pub args_summary: Option<String>,
    pub attempt: u32,
}

impl ErrorContext {
    pub fn new(model: impl Into<String>, method: impl Into<String>) -> Self {
        Self {
            model: Some(model.into()),
            method: Some(method.into()),
            args_summary: None,
            attempt: 1,
        }
    }

    pub fn with_args_summary(mut self, summary: impl Into<String>) -> Self {
        self.args_summary = Some(summary.into());
        self
    }

    pub fn with_attempt(mut self, attempt: u32) -> Self {
        self.attempt = attempt;
        self
    }
}

impl fmt::Display for ErrorContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "model={} method={} attempt={}",
            self.model.as_deref().unwrap_or("?"),
            self.method.as_deref().unwrap_or("?"),
            self.attempt
        )
    }
}

/// The closed set of transport/server fault kinds (spec §4.1 table).
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("connection error: {message} ({context})")]
    ConnectionError { message: String, context: ErrorContext },

    #[error("request timed out: {message} ({context})")]
    TimeoutError { message: String, context: ErrorContext },

    #[error("authentication failed: {message}")]
    AuthenticationError { message: String },

    #[error("access denied: {message} ({context})")]
    AccessError {
        message: String,
        traceback: Option<String>,
        context: ErrorContext,
    },

    #[error("validation failed: {message} ({context})")]
    ValidationError {
        message: String,
        traceback: Option<String>,
        context: ErrorContext,
    },

    #[error("method or model not found: {message} ({context})")]
    MethodNotFoundError { message: String, context: ErrorContext },

    #[error("internal server error: {message} ({context})")]
    InternalError {
        message: String,
        traceback: Option<String>,
        context: ErrorContext,
    },

    #[error("malformed response: {message}")]
    ProtocolError { message: String },

    #[error("record not found: {context}")]
    NotFoundError { context: ErrorContext },

    #[error("transaction error: {message}")]
    TransactionError { message: String },

    #[error("rollback failed for {} operation(s): {}", .unrecovered.len(), summarize(&.unrecovered))]
    RollbackError { unrecovered: Vec<String> },

    #[error("batch operation failed for {} of {} item(s)", .failed, .total)]
    BatchOperationError {
        total: usize,
        failed: usize,
        errors: Vec<(usize, Box<Error>)>,
    },

    #[error("cache error: {message}")]
    CacheError { message: String },

    #[error("cache backend connection error: {message}")]
    CacheConnectionError { message: String },

    #[error("retry budget exhausted after {attempts} attempt(s): {last}")]
    MaxRetriesExceededError { attempts: u32, last: Box<Error> },

    #[error("retry deadline exceeded: {last}")]
    RetryTimeoutError { last: Box<Error> },

    #[error("circuit breaker open until {retry_after_secs}s from now")]
    CircuitBreakerOpenError { retry_after_secs: u64 },

    #[error(transparent)]
    HttpClient(#[from] reqwest::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

fn summarize(ops: &[String]) -> String {
    ops.join(", ")
}

impl Error {
    /// Default retryability hint (spec §4.1, used by §4.6's default classifier).
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::ConnectionError { .. } | Error::TimeoutError { .. } | Error::InternalError { .. }
        )
    }

    pub fn context(&self) -> Option<&ErrorContext> {
        match self {
            Error::ConnectionError { context, .. }
            | Error::TimeoutError { context, .. }
            | Error::AccessError { context, .. }
            | Error::ValidationError { context, .. }
            | Error::MethodNotFoundError { context, .. }
            | Error::InternalError { context, .. }
            | Error::NotFoundError { context } => Some(context),
            _ => None,
        }
    }
}

/// Pluggable mapping from a server-reported error name to a taxonomy kind.
/// Spec §9 Open Questions: this mapping is server-version specific and not
/// exhaustively enumerable; callers may override it per session.
pub trait ErrorClassifier: Send + Sync {
    fn classify(&self, name: &str, message: &str, traceback: Option<String>, context: ErrorContext) -> Error;
}

/// The default classifier, covering the common Odoo-family error names.
#[derive(Default)]
pub struct DefaultErrorClassifier;

impl ErrorClassifier for DefaultErrorClassifier {
    fn classify(&self, name: &str, message: &str, traceback: Option<String>, context: ErrorContext) -> Error {
        match name {
            "odoo.exceptions.AccessError" | "odoo.exceptions.AccessDenied" => Error::AccessError {
                message: message.to_string(),
                traceback,
                context,
            },
            "odoo.exceptions.ValidationError" | "odoo.exceptions.UserError" | "psycopg2.IntegrityError" => {
                Error::ValidationError {
                    message: message.to_string(),
                    traceback,
                    context,
                }
            }
            "werkzeug.exceptions.NotFound" => Error::MethodNotFoundError {
                message: message.to_string(),
                context,
            },
            _ => Error::InternalError {
                message: message.to_string(),
                traceback,
                context,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_retryability_matches_policy_table() {
        let ctx = ErrorContext::new("res.partner", "search_read");
        assert!(Error::ConnectionError {
            message: "reset".into(),
            context: ctx.clone()
        }
        .is_retryable());
        assert!(!Error::ValidationError {
            message: "bad".into(),
            traceback: None,
            context: ctx.clone()
        }
        .is_retryable());
        assert!(!Error::AuthenticationError { message: "no".into() }.is_retryable());
    }

    #[test]
    fn default_classifier_maps_access_error() {
        let ctx = ErrorContext::new("res.partner", "write");
        let e = DefaultErrorClassifier.classify("odoo.exceptions.AccessError", "nope", None, ctx);
        assert!(matches!(e, Error::AccessError { .. }));
    }
}
