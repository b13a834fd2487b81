//! Test doubles shared by the backend crates.

mod metrics;

pub use metrics::RecordingMetrics;
