//! Common test utilities and helpers

#![allow(dead_code)] // Test utilities may not all be used in every test file

pub mod builders;
pub mod mock_helpers;

use std::time::Duration;
use tomopipe::pipeline::{drain, Pipeline, PipelineNotification};

/// Upper bound for a pipeline run in tests
pub fn test_timeout() -> Duration {
    Duration::from_secs(20)
}

/// Run until idle and return everything published meanwhile
pub fn settle(pipeline: &mut Pipeline) -> Vec<PipelineNotification> {
    let rx = pipeline.notifications();
    assert!(
        pipeline.wait_for_idle(test_timeout()),
        "pipeline did not go idle"
    );
    drain(&rx)
}

/// Assert every voxel of `values` equals `expected`
pub fn assert_all(values: &[f64], expected: f64) {
    assert!(
        values.iter().all(|&v| (v - expected).abs() < 1e-9),
        "Expected every voxel to be {}, got {:?}",
        expected,
        values
    );
}
