use std::sync::Mutex;

use sandbox::MetricsSink;

/// Keeps every recorded metric in memory.
#[derive(Debug, Default)]
pub struct RecordingMetrics {
    metrics: Mutex<Vec<(String, f64, Vec<(String, String)>)>>,
}

impl RecordingMetrics {
    /// Number of samples recorded under `name`.
    pub fn count(&self, name: &str) -> usize {
        self.metrics
            .lock()
            .map(|metrics| metrics.iter().filter(|(n, _, _)| n == name).count())
            .unwrap_or(0)
    }

    /// Tags of every sample recorded under `name`.
    pub fn tags(&self, name: &str) -> Vec<Vec<(String, String)>> {
        self.metrics
            .lock()
            .map(|metrics| {
                metrics
                    .iter()
                    .filter(|(n, _, _)| n == name)
                    .map(|(_, _, tags)| tags.clone())
                    .collect()
            })
            .unwrap_or_default()
    }
}

impl MetricsSink for RecordingMetrics {
    fn record_metric(&self, name: &str, value: f64, tags: &[(&str, &str)]) {
        if let Ok(mut metrics) = self.metrics.lock() {
            metrics.push((
                name.to_owned(),
                value,
                tags.iter()
                    .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
                    .collect(),
            ));
        }
    }
}
