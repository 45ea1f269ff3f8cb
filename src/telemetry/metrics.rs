//! Metric emission through the `metrics` facade.
//!
//! Nothing is exported unless the embedding application installs a recorder.

use metrics::{counter, gauge};

pub fn record_bytes_downloaded(bytes: u64) {
    counter!("gg_depot_bytes_downloaded_total").increment(bytes);
}

pub fn record_retry() {
    counter!("gg_depot_transfer_retries_total").increment(1);
}

/// `outcome` is the terminal download status.
pub fn record_download_outcome(outcome: &'static str) {
    counter!("gg_depot_downloads_total", "outcome" => outcome).increment(1);
}

pub fn record_activation(outcome: &'static str) {
    counter!("gg_depot_activations_total", "outcome" => outcome).increment(1);
}

pub fn set_active_model_bytes(bytes: u64) {
    gauge!("gg_depot_active_model_bytes").set(bytes as f64);
}
