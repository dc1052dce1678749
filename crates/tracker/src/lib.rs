//! Lifecycle tracking for remote batch computations.
//!
//! A [`Task`](entity::Task) is a multi-job workflow driven by an explicit
//! [`StateMachine`](statemachine::StateMachine); each of its child
//! [`Job`](entity::Job)s is backed by exactly one [`Run`](entity::Run), the
//! concrete submission of a set of input files to the batch system. The
//! [`Scheduler`](scheduler::Scheduler) advances every in-flight run by one
//! status transition per polling pass, and the
//! [`TaskDriver`](registry::TaskDriver) steps every pollable task through its
//! registered workflow.
//!
//! All state lives in a [`DocumentStore`]; in-memory entities are transient
//! views refreshed from the store before each mutation. The batch system and
//! the store are both reached through ports so that tests (and single-machine
//! deployments) can swap in the bundled in-process adapters.

use std::sync::Arc;

use gridmill_store::DocumentStore;

pub mod batch;
pub mod entity;
pub mod registry;
pub mod scheduler;
pub mod statemachine;

#[cfg(test)]
mod test_util;

pub use batch::{BatchClient, BatchError, RemoteHandle, RemoteStatus, ResourceRequest};
pub use entity::{EntityError, Job, Run, RunStatus, Task, Transition};
pub use registry::{TaskDriver, WorkflowRegistry};
pub use scheduler::{PassStats, PollerConfig, Scheduler};
pub use statemachine::{
    children_done, KillChildren, LockConfig, StateHandler, StateMachine, StateName, StepError,
};

/// Process-wide handles, constructed once at startup and passed explicitly
/// into every component that needs them.
#[derive(Clone)]
pub struct Context {
    store: Arc<dyn DocumentStore>,
    batch: Arc<dyn BatchClient>,
}

impl Context {
    pub fn new(store: Arc<dyn DocumentStore>, batch: Arc<dyn BatchClient>) -> Self {
        Self { store, batch }
    }

    pub fn store(&self) -> &dyn DocumentStore {
        self.store.as_ref()
    }

    pub fn batch(&self) -> &dyn BatchClient {
        self.batch.as_ref()
    }
}
