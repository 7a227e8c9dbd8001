//! Pipelines run through the runner subprocess
//!
//! The runner is this package's own binary with `execute-state`.

mod common;

use common::builders::volume;
use common::{assert_all, settle};
use std::path::PathBuf;
use tomopipe::config::{ExecutionMode, PipelineSettings, ProgressChannelKind};
use tomopipe::executor::WorkerPool;
use tomopipe::operator::{Fork, Invert, Operator, OperatorConfig, OperatorFactory, OperatorState};
use tomopipe::pipeline::{ChildEdge, Pipeline, PipelineNotification};

fn runner_settings(channel: ProgressChannelKind) -> PipelineSettings {
    let mut settings = PipelineSettings::default();
    settings.execution_mode = ExecutionMode::External;
    settings.external.executable = Some(PathBuf::from(env!("CARGO_BIN_EXE_tomopipe")));
    settings.external.runner_args = vec!["execute-state".to_string()];
    settings.progress.channel = channel;
    settings
}

fn external_pipeline(settings: PipelineSettings) -> Pipeline {
    Pipeline::with_pool("volume.tvb", volume(10.0), settings, WorkerPool::new(1).unwrap())
}

fn run_fork_chain(channel: ProgressChannelKind) {
    let mut p = external_pipeline(runner_settings(channel));
    assert_eq!(p.execution_mode(), ExecutionMode::External);
    let root = p.root();

    p.pause();
    let invert = p.add_operator(root, Operator::new(Invert)).unwrap();
    let fork = p
        .add_operator(
            root,
            Operator::new(Fork {
                label: "Snapshot".to_string(),
            }),
        )
        .unwrap();
    assert!(p.resume().unwrap().is_started());
    let notes = settle(&mut p);

    for op in [invert, fork] {
        assert!(notes.iter().any(|n| matches!(
            n,
            PipelineNotification::OperatorStarted { operator } if *operator == op
        )));
        assert_eq!(p.operator(op).unwrap().state(), OperatorState::Complete);
    }

    let snapshot = match p.tree().child(fork) {
        Some(ChildEdge::Explicit(ds)) => ds,
        other => panic!("expected an explicit child, got {:?}", other),
    };
    let child = p.data_source(snapshot).unwrap();
    assert_eq!(child.label, "Snapshot");
    assert_all(child.buffer.voxels(), 245.0);
    assert!(matches!(notes.last(), Some(PipelineNotification::Finished { .. })));
}

#[test]
fn test_runner_reports_progress_over_files() {
    run_fork_chain(ProgressChannelKind::Files);
}

#[cfg(unix)]
#[test]
fn test_runner_reports_progress_over_socket() {
    if !tomopipe::progress::socket_supported() {
        return;
    }
    run_fork_chain(ProgressChannelKind::Socket);
}

#[test]
fn test_runner_output_becomes_pipeline_output() {
    let mut p = external_pipeline(runner_settings(ProgressChannelKind::Files));
    let root = p.root();
    let op = p.add_operator(root, Operator::new(Invert)).unwrap();
    settle(&mut p);

    let out = p.transformed_data_source(root);
    assert_eq!(p.tree().child(op), Some(ChildEdge::Staging(out)));
    assert_all(p.data_source(out).unwrap().buffer.voxels(), 245.0);
    assert_all(p.last_result().unwrap().voxels(), 245.0);
}

#[test]
fn test_runner_operator_error_is_reported() {
    let mut p = external_pipeline(runner_settings(ProgressChannelKind::Files));
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

    let op = p.operator(id).unwrap();
    assert_eq!(op.state(), OperatorState::Error);
    assert!(op.last_error().unwrap_or_default().contains("boom"));
    let report = notes
        .iter()
        .find_map(|n| match n {
            PipelineNotification::Error(report) => Some(report.clone()),
            _ => None,
        })
        .expect("an error notification");
    assert_eq!(report.title, "External Pipeline Error");
    assert_eq!(p.transformed_data_source(root), root);
}

#[test]
fn test_missing_runner_fails_to_launch() {
    let mut settings = runner_settings(ProgressChannelKind::Files);
    settings.external.executable = Some(PathBuf::from("/nonexistent/tomopipe-runner"));
    let mut p = external_pipeline(settings);
    let root = p.root();
    p.add_operator(root, Operator::new(Invert)).unwrap();
    let notes = settle(&mut p);

    let report = notes
        .iter()
        .find_map(|n| match n {
            PipelineNotification::Error(report) => Some(report.clone()),
            _ => None,
        })
        .expect("an error notification");
    assert_eq!(report.title, "Execution Error");
    assert!(report.message.contains("executable not found"));
    assert!(!p.is_running());
}
