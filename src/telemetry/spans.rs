//! Span factories and result recording.

use tracing::{info_span, Span};

/// Extension trait for adding context to spans.
pub trait SpanExt {
    /// Record the result of an operation into the span.
    fn record_result<T, E>(&self, result: &Result<T, E>)
    where
        E: std::fmt::Display;
}

impl SpanExt for Span {
    fn record_result<T, E>(&self, result: &Result<T, E>)
    where
        E: std::fmt::Display,
    {
        match result {
            Ok(_) => {
                self.record("status", "ok");
            }
            Err(e) => {
                self.record("status", "error");
                self.record("error.message", e.to_string().as_str());
            }
        }
    }
}

/// Factory for per-download spans.
pub struct DownloadSpan;

impl DownloadSpan {
    /// Fields:
    /// - `model_id`: local id of the model
    /// - `format`: format the strategy was chosen for
    /// - `status` / `error.message`: filled in by `SpanExt::record_result`
    pub fn new(model_id: &str, format: &str) -> Span {
        info_span!(
            "download",
            model_id = %model_id,
            format = %format,
            status = tracing::field::Empty,
            error.message = tracing::field::Empty,
        )
    }
}

/// Factory for activation spans.
pub struct ActivationSpan;

impl ActivationSpan {
    pub fn new(model_id: &str) -> Span {
        info_span!(
            "activation",
            model_id = %model_id,
            status = tracing::field::Empty,
            error.message = tracing::field::Empty,
        )
    }
}
