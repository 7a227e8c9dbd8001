//! Container execution against a mocked runtime

mod common;

use common::builders::threaded_pipeline;
use common::mock_helpers::{exited, run_container_in_process, MockRuntime};
use common::{assert_all, settle};
use mockall::predicate::eq;
use std::sync::Arc;
use tomopipe::config::{DockerSettings, ExecutionMode, ProgressChannelKind};
use tomopipe::executor::{DockerBackend, ExternalPipelineExecutor};
use tomopipe::operator::{Invert, Operator, Threshold};
use tomopipe::pipeline::{Pipeline, PipelineNotification};

const IMAGE: &str = "tomviz/runner";

fn docker_settings() -> DockerSettings {
    DockerSettings {
        image: IMAGE.to_string(),
        inspect_interval_ms: 1,
        ..DockerSettings::default()
    }
}

fn install(pipeline: &mut Pipeline, runtime: MockRuntime, settings: DockerSettings) {
    let backend = DockerBackend::new(Arc::new(runtime), settings);
    pipeline.set_executor(Box::new(ExternalPipelineExecutor::new(
        backend,
        ProgressChannelKind::Files,
    )));
}

#[test]
fn test_container_run_produces_output() {
    let mut runtime = MockRuntime::new();
    runtime
        .expect_pull()
        .with(eq(IMAGE))
        .times(1)
        .returning(|_| Ok(()));
    runtime.expect_run().times(1).returning(|spec| {
        assert_eq!(spec.image, IMAGE);
        assert_eq!(spec.mounts[0].1, "/tomviz");
        run_container_in_process(spec)?;
        Ok("c0ffee".to_string())
    });
    runtime
        .expect_inspect()
        .with(eq("c0ffee"))
        .returning(|_| Ok(exited(0)));
    runtime
        .expect_remove()
        .with(eq("c0ffee"), eq(false))
        .times(1)
        .returning(|_, _| Ok(()));
    runtime.expect_logs().never();
    runtime.expect_stop().never();

    let mut p = threaded_pipeline(10.0);
    install(&mut p, runtime, docker_settings());
    assert_eq!(p.execution_mode(), ExecutionMode::Docker);

    let root = p.root();
    p.pause();
    let invert = p.add_operator(root, Operator::new(Invert)).unwrap();
    let threshold = p
        .add_operator(root, Operator::new(Threshold::new(250.0)))
        .unwrap();
    p.resume().unwrap();
    let notes = settle(&mut p);

    for op in [invert, threshold] {
        assert!(notes.iter().any(|n| matches!(
            n,
            PipelineNotification::OperatorFinished { operator, .. } if *operator == op
        )));
    }
    let out = p.transformed_data_source(root);
    assert_ne!(out, root);
    assert_all(p.data_source(out).unwrap().buffer.voxels(), 0.0);
}

#[test]
fn test_container_failure_surfaces_logs() {
    let mut runtime = MockRuntime::new();
    runtime.expect_pull().times(1).returning(|_| Ok(()));
    runtime
        .expect_run()
        .times(1)
        .returning(|_| Ok("deadbeef".to_string()));
    runtime
        .expect_inspect()
        .returning(|_| Ok(exited(3)));
    runtime
        .expect_logs()
        .with(eq("deadbeef"))
        .times(1)
        .returning(|_| Ok("Traceback: boom".to_string()));
    runtime.expect_remove().times(1).returning(|_, _| Ok(()));

    let mut p = threaded_pipeline(10.0);
    install(&mut p, runtime, docker_settings());
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
    assert_eq!(report.title, "Pipeline Error");
    assert!(report.message.contains("exit code: 3"));
    assert!(report.message.contains("Traceback: boom"));
    assert_eq!(p.tree().len(), 1);
}

#[test]
fn test_missing_image_fails_without_touching_runtime() {
    let mut runtime = MockRuntime::new();
    runtime.expect_pull().never();
    runtime.expect_run().never();

    let mut p = threaded_pipeline(10.0);
    install(&mut p, runtime, DockerSettings::default());
    let root = p.root();
    p.add_operator(root, Operator::new(Invert)).unwrap();
    let notes = settle(&mut p);

    assert!(notes.iter().any(|n| matches!(
        n,
        PipelineNotification::Error(report) if report.message.contains("no docker image")
    )));
}
