//! Cancellation framework: CancellationToken + run generation.
//! Starting a new run cancels the one in flight, so a host that re-issues a
//! translation never has two runs racing over the same drawing.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Hands out cancellation tokens, one generation per run.
pub struct RunCoordinator {
    current_token: RwLock<CancellationToken>,
    generation: Arc<AtomicU64>,
}

impl Default for RunCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl RunCoordinator {
    pub fn new() -> Self {
        Self {
            current_token: RwLock::new(CancellationToken::new()),
            generation: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Cancel the current run, advance the generation, return a ticket for the new run.
    pub fn begin_run(&self) -> RunTicket {
        let mut token_guard = self.current_token.write();
        token_guard.cancel();
        let new_root = CancellationToken::new();
        let child = new_root.child_token();
        *token_guard = new_root;
        let gen = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        debug!(generation = gen, "run started");
        RunTicket {
            generation: Arc::clone(&self.generation),
            my_generation: gen,
            token: child,
        }
    }

    /// Cancel whatever is running without starting anything new.
    pub fn cancel_current(&self) {
        self.current_token.read().cancel();
    }
}

/// A run's view of the coordinator.
#[derive(Clone)]
pub struct RunTicket {
    generation: Arc<AtomicU64>,
    my_generation: u64,
    token: CancellationToken,
}

impl RunTicket {
    /// Returns true if no newer run has started.
    #[inline]
    pub fn is_current(&self) -> bool {
        self.generation.load(Ordering::SeqCst) == self.my_generation
    }

    #[inline]
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn generation(&self) -> u64 {
        self.my_generation
    }
}
