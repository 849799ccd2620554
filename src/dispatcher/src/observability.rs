//! Inference metrics, recorded through the `metrics` facade. Nothing is
//! collected until the binary installs a recorder.

use crate::{Error, InferenceResponse};
use metrics::{counter, histogram};
use std::time::Duration;

/// Successful inferences, by model and version.
pub const INFERENCE_SUCCESS: &str = "kalypso_inference_success_total";
/// Failed inferences, by model, version and error kind.
pub const INFERENCE_FAILURE: &str = "kalypso_inference_failure_total";
/// End to end dispatch latency in seconds, by model and version.
pub const INFERENCE_DURATION: &str = "kalypso_inference_duration_seconds";

/// Histogram buckets for dispatch latency (in seconds).
pub const LATENCY_BUCKETS: [f64; 12] = [
    0.0001, // 100µs
    0.0005, // 500µs
    0.001,  // 1ms
    0.005,  // 5ms
    0.01,   // 10ms
    0.025,  // 25ms
    0.05,   // 50ms
    0.1,    // 100ms
    0.25,   // 250ms
    0.5,    // 500ms
    1.0,    // 1s
    5.0,    // 5s
];

/// Version label; requests that failed before a version was resolved
/// are filed under "default".
fn version_label(version: Option<u64>) -> String {
    version.map_or_else(|| "default".to_string(), |v| v.to_string())
}

pub(crate) fn record_inference(
    model: &str,
    version: Option<u64>,
    result: &Result<InferenceResponse, Error>,
    elapsed: Duration,
) {
    let version = version_label(version);
    match result {
        Ok(_) => counter!(
            INFERENCE_SUCCESS,
            "model" => model.to_string(),
            "version" => version.clone()
        )
        .increment(1),
        Err(err) => counter!(
            INFERENCE_FAILURE,
            "model" => model.to_string(),
            "version" => version.clone(),
            "reason" => err.kind()
        )
        .increment(1),
    }
    histogram!(
        INFERENCE_DURATION,
        "model" => model.to_string(),
        "version" => version
    )
    .record(elapsed.as_secs_f64());
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_version_label() {
        assert_eq!(version_label(Some(3)), "3");
        assert_eq!(version_label(None), "default");
    }
}
