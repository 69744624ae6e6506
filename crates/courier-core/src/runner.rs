//! Runner - executes one command and classifies the attempt.

use std::sync::Arc;

use tracing::{error, info, warn};

use crate::command::Command;
use crate::domain::{ExecutionOutcome, ProvisioningEvent};
use crate::ports::EventSink;

/// Runs commands and records what happened.
///
/// The boolean returned by [`Runner::run`] is the only thing the retry
/// decision sees. Output and error detail end up in the logs and, when a sink
/// is configured, in a provisioning event.
///
/// Reports go out on detached tasks that nothing waits for, so a report still
/// in flight when the process exits is lost.
#[derive(Clone, Default)]
pub struct Runner {
    sink: Option<Arc<dyn EventSink>>,
}

impl Runner {
    pub fn new() -> Self {
        Self { sink: None }
    }

    pub fn with_sink(sink: Arc<dyn EventSink>) -> Self {
        Self { sink: Some(sink) }
    }

    /// Execute `command` exactly once. `body` is the delivery body as
    /// received, used for reporting only.
    pub async fn run(&self, command: Box<dyn Command>, body: &[u8]) -> bool {
        let outcome = self.attempt(command).await;
        self.report(&outcome, body);
        outcome.success
    }

    async fn attempt(&self, command: Box<dyn Command>) -> ExecutionOutcome {
        info!("processing message");
        match command.execute().await {
            Ok(output) => {
                info!(output = %String::from_utf8_lossy(&output), "processed");
                ExecutionOutcome::succeeded(output)
            }
            Err(err) => {
                let outcome = ExecutionOutcome::failed(err.output().to_vec(), err.to_string());
                error!(output = %outcome.output_lossy(), "command failed");
                error!(error = %err, "command error");
                info!("failed, see error log for details");
                outcome
            }
        }
    }

    fn report(&self, outcome: &ExecutionOutcome, body: &[u8]) {
        let Some(sink) = &self.sink else {
            return;
        };
        let sink = Arc::clone(sink);
        let event = ProvisioningEvent::from_outcome(outcome, body);
        // detached: reporting never holds up acknowledgment
        tokio::spawn(async move {
            if let Err(e) = sink.emit(event).await {
                warn!(error = %e, "provisioning report not delivered");
            }
        });
    }
}
