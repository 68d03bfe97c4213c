// src/execution/mod.rs

//! Step journal for operations spanning independent collaborators.
//!
//! A [`Saga`] records each completed step of a multi-collaborator flow
//! together with the action that would undo it. Flows decide per failure
//! whether to run the compensations ([`Saga::compensate`]) or to leave the
//! completed steps in place for the caller ([`Saga::abandon`]).

use futures::future::BoxFuture;
use tracing::{debug, error, warn};

use crate::error::Error;

/// Deferred action undoing one completed step
pub type Compensation<'a> = Box<dyn FnOnce() -> BoxFuture<'a, Result<(), Error>> + Send + 'a>;

/// One completed step
struct CompletedStep<'a> {
    /// Human-readable step name
    name: String,

    /// Undo action, if the step has one
    compensation: Option<Compensation<'a>>,
}

/// Ordered journal of completed steps
pub struct Saga<'a> {
    /// Operation this journal belongs to
    operation: String,

    /// Steps in completion order
    completed: Vec<CompletedStep<'a>>,
}

impl<'a> Saga<'a> {
    /// Starts an empty journal
    pub fn new(operation: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            completed: Vec::new(),
        }
    }

    /// Records a completed step
    pub fn record(&mut self, step: impl Into<String>, compensation: Option<Compensation<'a>>) {
        let name = step.into();
        debug!(operation = %self.operation, step = %name, "Step completed");
        self.completed.push(CompletedStep { name, compensation });
    }

    /// Names of completed steps, oldest first
    pub fn completed_steps(&self) -> Vec<&str> {
        self.completed.iter().map(|s| s.name.as_str()).collect()
    }

    /// Runs compensations newest first.
    ///
    /// Every compensation is attempted; failures are returned with the name
    /// of the step they belong to.
    pub async fn compensate(self) -> Vec<(String, Error)> {
        let mut failures = Vec::new();
        for step in self.completed.into_iter().rev() {
            let Some(compensation) = step.compensation else {
                continue;
            };
            debug!(operation = %self.operation, step = %step.name, "Compensating step");
            if let Err(e) = compensation().await {
                error!(
                    operation = %self.operation,
                    step = %step.name,
                    "Compensation failed: {}",
                    e
                );
                failures.push((step.name, e));
            }
        }
        failures
    }

    /// Leaves completed steps in place and returns their names
    pub fn abandon(self) -> Vec<String> {
        let names: Vec<String> = self.completed.into_iter().map(|s| s.name).collect();
        if !names.is_empty() {
            warn!(
                operation = %self.operation,
                steps = ?names,
                "Operation failed, completed steps left in place"
            );
        }
        names
    }
}
