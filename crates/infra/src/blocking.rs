//! Bridge from the synchronous store traits to async sqlx / tokio IO.

use std::future::Future;

use tokio::runtime::Handle;

/// Runtime handle captured when a persistent adapter is built.
///
/// Store traits are synchronous so the domain services stay runtime-agnostic.
/// Calls arriving on a tokio worker thread go through `block_in_place` (which
/// requires the multi-threaded runtime); calls from plain threads, such as the
/// background workers, block on the captured handle directly.
#[derive(Debug, Clone)]
pub struct RuntimeBridge {
    handle: Handle,
}

impl RuntimeBridge {
    pub fn current() -> Result<Self, String> {
        Handle::try_current()
            .map(|handle| Self { handle })
            .map_err(|_| {
                "persistent stores require a tokio runtime; construct them inside one".to_string()
            })
    }

    pub fn block_on<F: Future>(&self, fut: F) -> F::Output {
        if Handle::try_current().is_ok() {
            tokio::task::block_in_place(|| self.handle.block_on(fut))
        } else {
            self.handle.block_on(fut)
        }
    }
}
