//! Notifications published by a [`super::Pipeline`] to its observers.
//!
//! Observers hold a clone of the receiver returned by
//! [`super::Pipeline::notifications`] and drain it from their own thread.
//! The channel is bounded; once it is full new notifications are dropped
//! with a warning.

use crate::operator::TransformResult;
use crate::pipeline::id::{DataSourceId, OperatorId};
use chrono::{DateTime, Local};
use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};

/// Channel capacity for notifications (pipeline → observers).
pub(crate) const NOTIFICATION_CAPACITY: usize = 10_000;

/// An error surfaced to the user
#[derive(Debug, Clone)]
pub struct ErrorReport {
    pub title: String,
    pub message: String,
    pub at: DateTime<Local>,
}

impl ErrorReport {
    pub fn new(title: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            message: message.into(),
            at: Local::now(),
        }
    }
}

#[derive(Debug, Clone)]
pub enum PipelineNotification {
    /// An execution was started at `data_source`.
    Started { data_source: DataSourceId },

    /// The execution completed; `data_source` is the last branch that ran.
    Finished { data_source: DataSourceId },

    /// A cancel of the run on `data_source` was confirmed.
    Canceled { data_source: DataSourceId },

    /// An operator was appended; `output` is the staging data source that
    /// moved onto it, if any.
    OperatorAdded {
        operator: OperatorId,
        output: Option<DataSourceId>,
    },

    /// An operator was removed from its chain.
    OperatorRemoved { operator: OperatorId },

    OperatorStarted { operator: OperatorId },

    OperatorFinished {
        operator: OperatorId,
        result: TransformResult,
    },

    /// An operator created its explicit child data source.
    ChildDataSourceCreated {
        operator: OperatorId,
        data_source: DataSourceId,
    },

    /// The staging output moved to another operator.
    DataSourceMoved {
        data_source: DataSourceId,
        from: OperatorId,
        to: OperatorId,
    },

    /// New data was committed to a data source.
    DataSourceUpdated(DataSourceId),

    DataSourceRemoved(DataSourceId),

    /// Something failed; shown to the user.
    Error(ErrorReport),
}

/// Sending half, owned by the pipeline
#[derive(Debug, Clone)]
pub(crate) struct Notifier {
    tx: Sender<PipelineNotification>,
}

impl Notifier {
    pub(crate) fn new() -> (Self, Receiver<PipelineNotification>) {
        let (tx, rx) = bounded(NOTIFICATION_CAPACITY);
        (Self { tx }, rx)
    }

    pub(crate) fn send(&self, notification: PipelineNotification) {
        match self.tx.try_send(notification) {
            Ok(()) => {}
            Err(TrySendError::Full(dropped)) => {
                tracing::warn!("notification channel full, dropping {:?}", dropped);
            }
            // The pipeline keeps its own receiver, so this only happens
            // during teardown
            Err(TrySendError::Disconnected(_)) => {}
        }
    }

    pub(crate) fn error(&self, title: impl Into<String>, message: impl Into<String>) {
        let report = ErrorReport::new(title, message);
        tracing::error!(title = %report.title, "{}", report.message);
        self.send(PipelineNotification::Error(report));
    }
}

/// Drain all pending notifications.
pub fn drain(rx: &Receiver<PipelineNotification>) -> Vec<PipelineNotification> {
    let mut out = Vec::new();
    while let Ok(n) = rx.try_recv() {
        out.push(n);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_drain_in_order() {
        let (notifier, rx) = Notifier::new();
        notifier.send(PipelineNotification::DataSourceUpdated(DataSourceId(1)));
        notifier.send(PipelineNotification::DataSourceRemoved(DataSourceId(2)));

        let drained = drain(&rx);
        assert_eq!(drained.len(), 2);
        assert!(matches!(
            drained[0],
            PipelineNotification::DataSourceUpdated(DataSourceId(1))
        ));
        assert!(drain(&rx).is_empty());
    }

    #[test]
    fn test_full_channel_drops_instead_of_blocking() {
        let (notifier, rx) = Notifier::new();
        for _ in 0..NOTIFICATION_CAPACITY + 5 {
            notifier.send(PipelineNotification::Canceled {
                data_source: DataSourceId(0),
            });
        }
        assert_eq!(drain(&rx).len(), NOTIFICATION_CAPACITY);
    }

    #[test]
    fn test_error_report() {
        let (notifier, rx) = Notifier::new();
        notifier.error("Operator failed", "Binary Threshold: out of range");
        match drain(&rx).pop() {
            Some(PipelineNotification::Error(report)) => {
                assert_eq!(report.title, "Operator failed");
                assert!(report.message.contains("out of range"));
            }
            other => panic!("unexpected {:?}", other),
        }
    }
}
