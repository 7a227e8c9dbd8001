//! The runner side of external execution
//!
//! `tomopipe execute-state` reads a state document and its input buffer,
//! applies the operators from index `start` onwards, and writes the result.
//! Progress goes back to the host over the channel the host opened. Child
//! data published by operator `k` is written to `<output dir>/<k>/` before
//! the host is told that `k` finished.

use crate::buffer::{VolumeBuffer, TRANSFER_EXTENSION};
use crate::config::ProgressChannelKind;
use crate::error::{PipelineError, Result, ResultExt};
use crate::executor::PipelineState;
use crate::operator::{ChildRequest, Operator, OperatorEvent, OperatorFactory, TransformResult};
use crate::progress::{MessageKind, ProgressMessage, ProgressWriter};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

const FORWARD_POLL: Duration = Duration::from_millis(50);

/// Arguments of one runner invocation
#[derive(Debug, Clone, PartialEq)]
pub struct RunnerArgs {
    pub state: PathBuf,
    /// First operator to apply
    pub start: usize,
    pub output: PathBuf,
    pub progress: ProgressChannelKind,
    /// Progress socket or directory; no reporting without one
    pub progress_path: Option<PathBuf>,
}

/// Apply a state document and write the result to `args.output`
pub fn execute_state(args: &RunnerArgs, factory: &OperatorFactory) -> Result<()> {
    let state = PipelineState::read_from(&args.state)?;
    let primary = state.primary()?;
    let input = primary.reader.file_names.first().ok_or_else(|| {
        PipelineError::Serialization("data source has no file names".to_string())
    })?;

    let mut buffer = VolumeBuffer::read_from(input)
        .with_context(|| format!("reading input {}", input.display()))?;
    if let Some(spacing) = primary.spacing {
        buffer.set_spacing(spacing);
    }
    let operators = factory.from_json_list(&primary.operators)?;

    let mut writer = match &args.progress_path {
        Some(path) => ProgressWriter::connect(args.progress, path).unwrap_or_else(|e| {
            tracing::warn!("progress reporting disabled: {}", e);
            ProgressWriter::Null
        }),
        None => ProgressWriter::Null,
    };

    let output_dir = args
        .output
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_default();

    tracing::info!(
        operators = operators.len(),
        start = args.start,
        "executing pipeline state"
    );
    writer.report(ProgressMessage::pipeline(MessageKind::Started));

    for (k, op) in operators.iter().enumerate().skip(args.start) {
        writer.report(ProgressMessage::operator(MessageKind::Started, k));
        let (result, children) = run_operator(op, &mut buffer, k, &mut writer);
        match result {
            TransformResult::Complete => {
                write_children(&output_dir.join(k.to_string()), &children)?;
                writer.report(ProgressMessage::operator(MessageKind::Finished, k));
            }
            TransformResult::Canceled => {
                return Err(PipelineError::Operator {
                    label: op.label(),
                    message: "canceled".to_string(),
                });
            }
            TransformResult::Error => {
                let message = op
                    .last_error()
                    .unwrap_or_else(|| "transform failed".to_string());
                writer.report(ProgressMessage::operator(MessageKind::Error, k).with_error(message.clone()));
                return Err(PipelineError::Operator {
                    label: op.label(),
                    message,
                });
            }
        }
    }

    buffer
        .write_to(&args.output)
        .with_context(|| format!("writing result {}", args.output.display()))?;
    writer.report(ProgressMessage::pipeline(MessageKind::Finished));
    Ok(())
}

/// Run one operator on a scoped thread, forwarding its progress
fn run_operator(
    op: &Arc<Operator>,
    buffer: &mut VolumeBuffer,
    k: usize,
    writer: &mut ProgressWriter,
) -> (TransformResult, Vec<ChildRequest>) {
    let events = op.subscribe();
    let children = Mutex::new(Vec::new());

    let result = std::thread::scope(|scope| {
        let worker = scope.spawn(|| {
            let sink = |request: ChildRequest| {
                children
                    .lock()
                    .unwrap_or_else(|p| p.into_inner())
                    .push(request)
            };
            op.transform(buffer, Some(&sink))
        });

        while !worker.is_finished() {
            if let Ok(event) = events.recv_timeout(FORWARD_POLL) {
                forward(event, k, writer);
            }
        }
        let result = worker.join().unwrap_or(TransformResult::Error);
        for event in events.try_iter() {
            forward(event, k, writer);
        }
        result
    });

    (result, children.into_inner().unwrap_or_else(|p| p.into_inner()))
}

fn forward(event: OperatorEvent, k: usize, writer: &mut ProgressWriter) {
    let message = match event {
        OperatorEvent::TotalProgressStepsChanged(max) => {
            ProgressMessage::operator(MessageKind::ProgressMaximum, k).with_value(max)
        }
        OperatorEvent::ProgressStepChanged(step) => {
            ProgressMessage::operator(MessageKind::ProgressStep, k).with_value(step)
        }
        OperatorEvent::ProgressMessageChanged(text) => {
            ProgressMessage::operator(MessageKind::ProgressMessage, k).with_value(text)
        }
        _ => return,
    };
    writer.report(message);
}

fn write_children(dir: &Path, children: &[ChildRequest]) -> Result<()> {
    if children.is_empty() {
        return Ok(());
    }
    std::fs::create_dir_all(dir)
        .map_err(PipelineError::from)
        .with_context(|| format!("creating child output directory {}", dir.display()))?;
    for child in children {
        let name: String = child
            .label
            .chars()
            .map(|c| if c == '/' || c == '\\' { '_' } else { c })
            .collect();
        let path = dir.join(format!("{}.{}", name, TRANSFER_EXTENSION));
        child.buffer.write_to(&path)?;
        tracing::debug!(path = %path.display(), "wrote child output");
    }
    Ok(())
}
