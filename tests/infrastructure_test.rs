//! Test to verify test infrastructure works correctly

mod common;

use common::builders::{threaded_pipeline, volume, Gated};
use tomopipe::operator::Operator;

#[test]
fn test_infrastructure_setup() {
    let buffer = volume(7.0);
    assert_eq!(buffer.dims(), [2, 2, 2]);
    common::assert_all(buffer.voxels(), 7.0);

    let pipeline = threaded_pipeline(7.0);
    assert!(!pipeline.is_running());
    assert_eq!(pipeline.tree().len(), 1);
}

#[test]
fn test_gate_releases_transform() {
    let (gated, gate) = Gated::new();
    let op = Operator::new(gated);
    gate.open();
    let mut buffer = volume(3.0);
    assert_eq!(
        op.transform(&mut buffer, None),
        tomopipe::operator::TransformResult::Complete
    );
    common::assert_all(buffer.voxels(), 3.0);
}

#[test]
#[should_panic]
fn test_assert_all_fails() {
    common::assert_all(&[1.0, 2.0], 1.0);
}
