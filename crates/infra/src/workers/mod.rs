//! Background worker threads.

pub mod event_worker;
pub mod matcher_worker;

use std::io;
use std::sync::Arc;
use std::sync::mpsc;
use std::thread;

use wager_events::{EventBus, EventEnvelope, LifecycleEvent};

use crate::coordinator::{CoordinatorError, MatchCoordinator};

pub use event_worker::EventWorker;
pub use matcher_worker::MatcherWorker;

/// Handle to control and join a background worker.
#[derive(Debug)]
pub struct WorkerHandle {
    shutdown: mpsc::Sender<()>,
    join: Option<thread::JoinHandle<()>>,
}

impl WorkerHandle {
    fn new(shutdown: mpsc::Sender<()>, join: thread::JoinHandle<()>) -> Self {
        Self {
            shutdown,
            join: Some(join),
        }
    }

    /// Request graceful shutdown and wait for the worker to stop.
    pub fn shutdown(mut self) {
        let _ = self.shutdown.send(());
        if let Some(j) = self.join.take() {
            let _ = j.join();
        }
    }
}

/// Feed every lifecycle event on the configured topics into the coordinator.
pub fn spawn_coordinator_worker<B>(coordinator: Arc<MatchCoordinator<B>>) -> io::Result<WorkerHandle>
where
    B: EventBus<EventEnvelope<LifecycleEvent>> + 'static,
{
    let topics = vec![
        coordinator.topics().match_lifecycle.clone(),
        coordinator.topics().server_lifecycle.clone(),
    ];
    let bus_owner = Arc::clone(&coordinator);
    EventWorker::spawn("match-coordinator", bus_owner.bus(), topics, move |envelope| {
        coordinator
            .handle_event(envelope.payload())
            .map(|_| ())
            .map_err(|err: CoordinatorError| err.to_string())
    })
}
