use std::io;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread;
use std::time::Duration;

use tracing::{debug, warn};

use wager_events::{EventBus, EventEnvelope, Subscription};

use super::WorkerHandle;

/// Subscribe-and-handle loop over an event bus.
///
/// - `topics`: when non-empty, envelopes on other topics are skipped
/// - `handler`: must be idempotent (delivery is at-least-once)
#[derive(Debug)]
pub struct EventWorker;

impl EventWorker {
    pub fn spawn<E, B, H, Err>(
        name: &'static str,
        bus: &B,
        topics: Vec<String>,
        mut handler: H,
    ) -> io::Result<WorkerHandle>
    where
        E: Send + 'static,
        B: EventBus<EventEnvelope<E>>,
        H: FnMut(EventEnvelope<E>) -> Result<(), Err> + Send + 'static,
        Err: core::fmt::Debug + Send + 'static,
    {
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();
        // Subscribe before the thread starts so nothing published after spawn is missed.
        let sub = bus.subscribe();

        let join = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || worker_loop(name, sub, shutdown_rx, &topics, &mut handler))?;

        Ok(WorkerHandle::new(shutdown_tx, join))
    }
}

fn worker_loop<E, H, Err>(
    name: &'static str,
    sub: Subscription<EventEnvelope<E>>,
    shutdown_rx: mpsc::Receiver<()>,
    topics: &[String],
    handler: &mut H,
) where
    H: FnMut(EventEnvelope<E>) -> Result<(), Err>,
    Err: core::fmt::Debug,
{
    let tick = Duration::from_millis(250);

    loop {
        if shutdown_rx.try_recv().is_ok() {
            break;
        }

        match sub.recv_timeout(tick) {
            Ok(msg) => {
                if !topics.is_empty() && !topics.iter().any(|t| t == msg.topic()) {
                    debug!(worker = name, topic = msg.topic(), "skipping event on foreign topic");
                    continue;
                }

                let event_type = msg.event_type().to_string();
                if let Err(err) = handler(msg) {
                    warn!(worker = name, %event_type, error = ?err, "event handler failed");
                }
            }
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
}
