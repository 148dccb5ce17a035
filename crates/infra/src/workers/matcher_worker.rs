use std::io;
use std::sync::Arc;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread;
use std::time::Duration;

use tracing::{debug, warn};

use wager_events::{EventBus, EventEnvelope, LifecycleEvent};

use crate::coordinator::MatchCoordinator;

use super::WorkerHandle;

/// Periodically runs a matching cycle (match every lane, escrow what formed).
#[derive(Debug)]
pub struct MatcherWorker;

impl MatcherWorker {
    pub fn spawn<B>(
        name: &'static str,
        coordinator: Arc<MatchCoordinator<B>>,
        interval: Duration,
    ) -> io::Result<WorkerHandle>
    where
        B: EventBus<EventEnvelope<LifecycleEvent>> + 'static,
    {
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();

        let join = thread::Builder::new().name(name.to_string()).spawn(move || {
            loop {
                match coordinator.run_matching_cycle() {
                    Ok(matches) if !matches.is_empty() => {
                        debug!(worker = name, formed = matches.len(), "matching cycle")
                    }
                    Ok(_) => {}
                    Err(err) => warn!(worker = name, error = %err, "matching cycle failed"),
                }

                match shutdown_rx.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) => continue,
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                }
            }
        })?;

        Ok(WorkerHandle::new(shutdown_tx, join))
    }
}
