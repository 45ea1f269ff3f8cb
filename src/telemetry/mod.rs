//! Structured logging, spans and metrics.

mod logging;
mod metrics;
mod spans;

pub use logging::{init_logging, LogConfig, LogError, LogFormat};
pub use self::metrics::{
    record_activation, record_bytes_downloaded, record_download_outcome, record_retry,
    set_active_model_bytes,
};
pub use spans::{ActivationSpan, DownloadSpan, SpanExt};
