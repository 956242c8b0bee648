//! Non-fatal signals for the UI and logs

use tokio::sync::broadcast;

use crate::models::Collection;

const CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Diagnostic {
    /// A malformed record was dropped at ingestion
    InvalidRecord {
        collection: Collection,
        reason: String,
    },
    /// Polling paused after repeated failures
    TransportDegraded {
        consecutive_failures: u32,
        last_error: String,
    },
    /// Live push or polling is delivering again
    TransportRecovered,
}

/// Broadcast fan-out of diagnostics; publishing never blocks or fails
#[derive(Debug, Clone)]
pub struct Diagnostics {
    sender: broadcast::Sender<Diagnostic>,
}

impl Default for Diagnostics {
    fn default() -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { sender }
    }
}

impl Diagnostics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn publish(&self, diagnostic: Diagnostic) {
        // No receivers is fine.
        let _ = self.sender.send(diagnostic);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Diagnostic> {
        self.sender.subscribe()
    }
}
