//! End-to-end behaviour of the pipeline on the threaded executor

mod common;

use common::builders::{threaded_pipeline, Gated};
use common::{assert_all, settle, test_timeout};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tomopipe::operator::{
    Fork, Invert, Operator, OperatorConfig, OperatorFactory, OperatorState, Threshold,
};
use tomopipe::pipeline::{
    drain, ChildEdge, OperatorId, Pipeline, PipelineNotification,
};

/// Process events until `op` has started; returns what was published
fn wait_for_start(pipeline: &mut Pipeline, op: OperatorId) -> Vec<PipelineNotification> {
    let rx = pipeline.notifications();
    let mut seen = Vec::new();
    let deadline = Instant::now() + test_timeout();
    while Instant::now() < deadline {
        pipeline.process_events(Duration::from_millis(20));
        for note in drain(&rx) {
            let started =
                matches!(note, PipelineNotification::OperatorStarted { operator } if operator == op);
            seen.push(note);
            if started {
                return seen;
            }
        }
    }
    panic!("operator {} never started", op);
}

fn started(notes: &[PipelineNotification], op: OperatorId) -> bool {
    notes
        .iter()
        .any(|n| matches!(n, PipelineNotification::OperatorStarted { operator } if *operator == op))
}

// ==================== Output data source ====================

#[test]
fn test_output_moves_to_new_tail_and_resumes_from_it() {
    let mut p = threaded_pipeline(10.0);
    let root = p.root();
    let first = p.add_operator(root, Operator::new(Invert)).unwrap();
    settle(&mut p);
    let out = p.transformed_data_source(root);
    assert_all(p.data_source(out).unwrap().buffer.voxels(), 245.0);

    let second = p
        .add_operator(root, Operator::new(Threshold::new(250.0)))
        .unwrap();
    let notes = settle(&mut p);

    assert!(notes.iter().any(|n| matches!(
        n,
        PipelineNotification::DataSourceMoved { data_source, from, to }
            if *data_source == out && *from == first && *to == second
    )));
    assert!(started(&notes, second));
    assert!(!started(&notes, first), "first operator should not re-run");

    assert_eq!(p.tree().len(), 2);
    assert_eq!(p.tree().child(first), None);
    assert_eq!(p.tree().child(second), Some(ChildEdge::Staging(out)));
    assert_all(p.data_source(out).unwrap().buffer.voxels(), 0.0);
}

#[test]
fn test_removing_tail_moves_output_back_and_reruns() {
    let mut p = threaded_pipeline(10.0);
    let root = p.root();
    let first = p.add_operator(root, Operator::new(Invert)).unwrap();
    settle(&mut p);
    let second = p
        .add_operator(root, Operator::new(Threshold::new(250.0)))
        .unwrap();
    settle(&mut p);
    let out = p.transformed_data_source(root);

    p.remove_operator(second).unwrap();
    let notes = settle(&mut p);

    assert!(notes.iter().any(|n| matches!(
        n,
        PipelineNotification::DataSourceMoved { data_source, from, to }
            if *data_source == out && *from == second && *to == first
    )));
    assert!(notes
        .iter()
        .any(|n| matches!(n, PipelineNotification::OperatorRemoved { operator } if *operator == second)));
    assert!(started(&notes, first));
    assert_eq!(p.tree().child(first), Some(ChildEdge::Staging(out)));
    assert_all(p.data_source(out).unwrap().buffer.voxels(), 245.0);
}

#[test]
fn test_removing_only_operator_deletes_output() {
    let mut p = threaded_pipeline(10.0);
    let root = p.root();
    let first = p.add_operator(root, Operator::new(Invert)).unwrap();
    settle(&mut p);
    let out = p.transformed_data_source(root);

    p.remove_operator(first).unwrap();
    let notes = settle(&mut p);

    assert!(notes
        .iter()
        .any(|n| matches!(n, PipelineNotification::DataSourceRemoved(ds) if *ds == out)));
    assert_eq!(p.tree().len(), 1);
    assert_eq!(p.transformed_data_source(root), root);
    assert!(p.operator(first).is_none());
    assert!(!p.is_running());
}

#[test]
fn test_adding_while_running_creates_one_output() {
    let mut p = threaded_pipeline(10.0);
    let root = p.root();
    p.add_operator(root, Operator::new(Invert)).unwrap();
    p.add_operator(root, Operator::new(Threshold::new(250.0)))
        .unwrap();
    let notes = settle(&mut p);

    let created = notes
        .iter()
        .filter(|n| matches!(n, PipelineNotification::ChildDataSourceCreated { .. }))
        .count();
    assert_eq!(created, 1);
    assert_eq!(p.tree().len(), 2);
    let out = p.transformed_data_source(root);
    assert_all(p.data_source(out).unwrap().buffer.voxels(), 0.0);
}

#[test]
fn test_user_spacing_survives_rerun() {
    let mut p = threaded_pipeline(10.0);
    let root = p.root();
    let first = p.add_operator(root, Operator::new(Invert)).unwrap();
    settle(&mut p);
    let out = p.transformed_data_source(root);

    p.set_spacing(out, [3.0, 3.0, 3.0]).unwrap();
    p.set_spacing(root, [0.5, 0.5, 0.5]).unwrap();
    assert_eq!(p.data_source(out).unwrap().buffer.spacing(), [3.0, 3.0, 3.0]);

    // A parameter change is picked up from the operator's events
    p.operator(first).unwrap().reconfigure(Threshold::new(5.0));
    let notes = settle(&mut p);
    assert!(started(&notes, first));

    let output = p.data_source(out).unwrap();
    assert_all(output.buffer.voxels(), 255.0);
    assert_eq!(output.buffer.spacing(), [3.0, 3.0, 3.0]);
}

// ==================== Child data sources ====================

#[test]
fn test_fork_creates_explicit_child_branch() {
    let mut p = threaded_pipeline(10.0);
    let root = p.root();
    p.add_operator(root, Operator::new(Invert)).unwrap();
    settle(&mut p);
    let staging = p.transformed_data_source(root);

    let fork = p
        .add_operator(
            root,
            Operator::new(Fork {
                label: "Snapshot".to_string(),
            }),
        )
        .unwrap();
    let notes = settle(&mut p);

    assert!(notes
        .iter()
        .any(|n| matches!(n, PipelineNotification::DataSourceRemoved(ds) if *ds == staging)));
    let snapshot = match p.tree().child(fork) {
        Some(ChildEdge::Explicit(ds)) => ds,
        other => panic!("expected an explicit child, got {:?}", other),
    };
    assert!(notes.iter().any(|n| matches!(
        n,
        PipelineNotification::ChildDataSourceCreated { operator, data_source }
            if *operator == fork && *data_source == snapshot
    )));
    let child = p.data_source(snapshot).unwrap();
    assert_eq!(child.label, "Snapshot");
    assert_eq!(child.parent, Some(fork));
    assert_all(child.buffer.voxels(), 245.0);
    assert_eq!(p.tree().len(), 2);

    // The child branch runs on its own data
    p.add_operator(snapshot, Operator::new(Invert)).unwrap();
    settle(&mut p);
    let out = p.transformed_data_source(root);
    assert_ne!(out, snapshot);
    assert_eq!(p.data_source(out).unwrap().label, "Output");
    assert_all(p.data_source(out).unwrap().buffer.voxels(), 10.0);
    assert_eq!(p.tree().len(), 3);
}

// ==================== Cancel ====================

#[test]
fn test_cancel_runs_callback_once_confirmed() {
    let mut p = threaded_pipeline(10.0);
    let root = p.root();
    let (gated, _gate) = Gated::new();
    let id = p.add_operator(root, Operator::new(gated)).unwrap();
    wait_for_start(&mut p, id);

    let confirmed = Arc::new(AtomicBool::new(false));
    let flag = confirmed.clone();
    assert!(p.cancel(Some(Box::new(move || flag.store(true, Ordering::SeqCst)))));
    let notes = settle(&mut p);

    assert!(confirmed.load(Ordering::SeqCst));
    assert!(notes
        .iter()
        .any(|n| matches!(n, PipelineNotification::Canceled { data_source } if *data_source == root)));
    assert!(!notes
        .iter()
        .any(|n| matches!(n, PipelineNotification::Finished { .. })));
    assert_eq!(p.operator(id).unwrap().state(), OperatorState::Canceled);
    assert_eq!(p.tree().len(), 1);
}

#[test]
fn test_new_run_waits_for_superseded_run_to_cancel() {
    let mut p = threaded_pipeline(10.0);
    let root = p.root();
    let (gated, gate) = Gated::new();
    let held = p.add_operator(root, Operator::new(gated)).unwrap();
    wait_for_start(&mut p, held);

    // Supersedes the gated run; the new one starts over from the gated op
    p.add_operator(root, Operator::new(Invert)).unwrap();
    let deadline = Instant::now() + test_timeout();
    while gate.entered() < 2 {
        assert!(Instant::now() < deadline, "re-run never reached the gated operator");
        p.process_events(Duration::from_millis(20));
    }
    assert_eq!(gate.canceled(), 1, "superseded run should stop on its cancel");

    gate.open();
    settle(&mut p);
    assert_eq!(gate.entered(), 2);
    let out = p.transformed_data_source(root);
    assert_all(p.data_source(out).unwrap().buffer.voxels(), 245.0);
}

#[test]
fn test_cancel_callback_fires_when_new_run_follows() {
    let mut p = threaded_pipeline(10.0);
    let root = p.root();
    let (gated, gate) = Gated::new();
    let held = p.add_operator(root, Operator::new(gated)).unwrap();
    wait_for_start(&mut p, held);

    let confirmed = Arc::new(AtomicBool::new(false));
    let flag = confirmed.clone();
    assert!(p.cancel(Some(Box::new(move || flag.store(true, Ordering::SeqCst)))));
    p.add_operator(root, Operator::new(Invert)).unwrap();
    gate.open();

    assert!(p.wait_for_idle(test_timeout()));
    assert!(confirmed.load(Ordering::SeqCst));
    assert!(!p.is_running());
    let out = p.transformed_data_source(root);
    assert_all(p.data_source(out).unwrap().buffer.voxels(), 245.0);
}

#[test]
fn test_cancel_without_run_is_a_no_op() {
    let mut p = threaded_pipeline(10.0);
    let called = Arc::new(AtomicBool::new(false));
    let flag = called.clone();
    assert!(!p.cancel(Some(Box::new(move || flag.store(true, Ordering::SeqCst)))));
    assert!(p.wait_for_idle(Duration::from_millis(50)));
    assert!(!called.load(Ordering::SeqCst));
}

#[test]
fn test_new_tail_after_cancel_restarts_chain() {
    let mut p = threaded_pipeline(10.0);
    let root = p.root();
    let first = p.add_operator(root, Operator::new(Invert)).unwrap();
    settle(&mut p);

    let (gated, gate) = Gated::new();
    let held = p.add_operator(root, Operator::new(gated)).unwrap();
    wait_for_start(&mut p, held);
    assert!(p.cancel(None));
    settle(&mut p);
    assert!(p.operator(held).unwrap().is_canceled());

    gate.open();
    let tail = p
        .add_operator(root, Operator::new(Threshold::new(250.0)))
        .unwrap();
    let notes = settle(&mut p);

    assert!(started(&notes, first), "chain should restart from the first operator");
    assert!(started(&notes, tail));
    assert_eq!(p.operator(held).unwrap().state(), OperatorState::Complete);
    let out = p.transformed_data_source(root);
    assert_eq!(p.tree().child(tail), Some(ChildEdge::Staging(out)));
    assert_all(p.data_source(out).unwrap().buffer.voxels(), 0.0);
}

// ==================== Failures ====================

#[test]
fn test_operator_failure_reports_error_without_finishing() {
    let mut p = threaded_pipeline(10.0);
    let root = p.root();
    let broken = OperatorFactory::default()
        .create(OperatorConfig::Script {
            label: "Broken".to_string(),
            script: "throw \"boom\"".to_string(),
            params: Default::default(),
            c_ordering: false,
        })
        .unwrap();
    let id = p.add_operator(root, broken).unwrap();
    let notes = settle(&mut p);

    let report = notes
        .iter()
        .find_map(|n| match n {
            PipelineNotification::Error(report) => Some(report.clone()),
            _ => None,
        })
        .expect("an error notification");
    assert_eq!(report.title, "Operator Error");
    assert!(report.message.contains("Broken"));
    assert!(!notes
        .iter()
        .any(|n| matches!(n, PipelineNotification::Finished { .. })));

    let op = p.operator(id).unwrap();
    assert_eq!(op.state(), OperatorState::Error);
    assert!(op.last_error().unwrap_or_default().contains("boom"));
    assert_eq!(p.transformed_data_source(root), root);
}

// ==================== Pause / copies ====================

#[test]
fn test_pause_collects_changes_until_resume() {
    let mut p = threaded_pipeline(10.0);
    let root = p.root();
    p.pause();
    p.add_operator(root, Operator::new(Invert)).unwrap();
    p.add_operator(root, Operator::new(Threshold::new(250.0)))
        .unwrap();
    assert!(!p.is_running());
    assert_eq!(p.tree().len(), 1);
    drain(&p.notifications());

    assert!(p.resume().unwrap().is_started());
    let notes = settle(&mut p);
    assert!(matches!(notes.first(), Some(PipelineNotification::Started { .. })));
    let out = p.transformed_data_source(root);
    assert_all(p.data_source(out).unwrap().buffer.voxels(), 0.0);
}

#[test]
fn test_copy_of_image_prior_to_replays_earlier_operators() {
    let mut p = threaded_pipeline(10.0);
    let root = p.root();
    let first = p.add_operator(root, Operator::new(Invert)).unwrap();
    settle(&mut p);
    let second = p
        .add_operator(root, Operator::new(Threshold::new(250.0)))
        .unwrap();
    settle(&mut p);

    let before_first = p.copy_of_image_prior_to(first).unwrap();
    assert!(before_first.is_finished());
    assert_all(before_first.result().unwrap().voxels(), 10.0);

    let mut before_second = p.copy_of_image_prior_to(second).unwrap();
    assert_eq!(before_second.wait(test_timeout()), Some(true));
    assert_all(before_second.result().unwrap().voxels(), 245.0);

    // The live operators are untouched by the replay
    assert_eq!(p.operator(first).unwrap().state(), OperatorState::Complete);
    assert!(!p.is_running());
}
