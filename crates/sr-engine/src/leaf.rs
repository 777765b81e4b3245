//! Per-leaf channels and the run-wide stop latch.

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use sr_optimizer::ObjectiveError;
use sr_types::{EvaluationReport, LeafInput, LeafMessage, OptimizationError};

use crate::tree::NodeId;

/// Broadcast stop request. Once triggered it stays triggered.
#[derive(Debug, Clone, Default)]
pub struct StopSignal(Arc<AtomicBool>);

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trigger(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_triggered(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Controller side of a leaf.
#[derive(Debug)]
pub struct LeafHandle {
    pub node: NodeId,
    pub path: String,
    pub input: Sender<LeafInput>,
    /// Kept so drivers and the dispatcher can publish on the leaf.
    pub publisher: Sender<LeafMessage>,
    pub results: Receiver<LeafMessage>,
    feedback: Option<Receiver<EvaluationReport>>,
}

/// Worker side of a leaf.
#[derive(Debug)]
pub struct WorkerEndpoints {
    pub input: Receiver<LeafInput>,
    pub results: Sender<LeafMessage>,
    pub feedback: Sender<EvaluationReport>,
}

/// Create the channels of one leaf.
///
/// Only the worker holds the feedback sender, so a driver waiting on a
/// crashed worker sees a disconnect instead of blocking forever.
pub fn leaf_channels(node: NodeId, path: impl Into<String>) -> (LeafHandle, WorkerEndpoints) {
    let (input_tx, input_rx) = unbounded();
    let (results_tx, results_rx) = unbounded();
    let (feedback_tx, feedback_rx) = unbounded();
    (
        LeafHandle {
            node,
            path: path.into(),
            input: input_tx,
            publisher: results_tx.clone(),
            results: results_rx,
            feedback: Some(feedback_rx),
        },
        WorkerEndpoints {
            input: input_rx,
            results: results_tx,
            feedback: feedback_tx,
        },
    )
}

impl LeafHandle {
    /// Hand the driver-facing endpoints to an optimization driver.
    pub fn link(&mut self) -> Option<LeafLink> {
        self.feedback.take().map(|feedback| LeafLink {
            path: self.path.clone(),
            input: self.input.clone(),
            publisher: self.publisher.clone(),
            feedback,
        })
    }
}

/// Endpoints an optimization driver uses to talk to one leaf.
#[derive(Debug)]
pub struct LeafLink {
    pub path: String,
    pub input: Sender<LeafInput>,
    pub publisher: Sender<LeafMessage>,
    feedback: Receiver<EvaluationReport>,
}

impl LeafLink {
    pub fn send(&self, input: LeafInput) -> Result<(), ObjectiveError> {
        self.input.send(input).map_err(|_| self.disconnected())
    }

    pub fn publish(&self, message: LeafMessage) {
        let _ = self.publisher.send(message);
    }

    /// Block for exactly one evaluation report.
    ///
    /// A disconnect after a stop request counts as a stop, since cooperative
    /// workers leave their loop as soon as they observe it.
    pub fn await_report(
        &self,
        timeout: Option<Duration>,
        stop: &StopSignal,
    ) -> Result<EvaluationReport, ObjectiveError> {
        match timeout {
            Some(limit) => self.feedback.recv_timeout(limit).map_err(|err| match err {
                RecvTimeoutError::Timeout => ObjectiveError::Failed(format!(
                    "no evaluation report from '{}' within {} ms",
                    self.path,
                    limit.as_millis()
                )),
                RecvTimeoutError::Disconnected => self.disconnected_or_stopped(stop),
            }),
            None => self
                .feedback
                .recv()
                .map_err(|_| self.disconnected_or_stopped(stop)),
        }
    }

    fn disconnected_or_stopped(&self, stop: &StopSignal) -> ObjectiveError {
        if stop.is_triggered() {
            ObjectiveError::Stopped
        } else {
            self.disconnected()
        }
    }

    fn disconnected(&self) -> ObjectiveError {
        ObjectiveError::Failed(
            OptimizationError::Disconnected {
                leaf: self.path.clone(),
            }
            .to_string(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sr_types::ResultsMap;

    #[test]
    fn stop_signal_is_shared_latch() {
        let stop = StopSignal::new();
        let observer = stop.clone();
        assert!(!observer.is_triggered());
        stop.trigger();
        stop.trigger();
        assert!(observer.is_triggered());
    }

    #[test]
    fn link_is_handed_out_once() {
        let (mut handle, _endpoints) = leaf_channels(1, "s1");
        assert!(handle.link().is_some());
        assert!(handle.link().is_none());
    }

    #[test]
    fn report_wait_reflects_worker_state() {
        let (mut handle, endpoints) = leaf_channels(1, "s1");
        let link = handle.link().unwrap();
        let stop = StopSignal::new();

        endpoints
            .feedback
            .send(EvaluationReport::success(ResultsMap::new(), None))
            .unwrap();
        assert!(link.await_report(None, &stop).unwrap().is_ok());

        assert!(matches!(
            link.await_report(Some(Duration::from_millis(5)), &stop),
            Err(ObjectiveError::Failed(_))
        ));

        drop(endpoints);
        assert!(matches!(
            link.await_report(None, &stop),
            Err(ObjectiveError::Failed(_))
        ));
        stop.trigger();
        assert_eq!(link.await_report(None, &stop), Err(ObjectiveError::Stopped));
    }
}
