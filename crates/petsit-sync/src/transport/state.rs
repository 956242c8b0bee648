//! Observable transport state

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransportState {
    #[default]
    Disconnected,
    /// Live push connection established
    Live,
    /// Live push unavailable; polling the fetch-latest source
    Polling,
    /// Polling paused after repeated failures; see `resume_polling`
    Degraded { consecutive_failures: u32 },
}

impl TransportState {
    pub const fn is_receiving(self) -> bool {
        matches!(self, Self::Live | Self::Polling)
    }
}

impl fmt::Display for TransportState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disconnected => f.write_str("disconnected"),
            Self::Live => f.write_str("live"),
            Self::Polling => f.write_str("polling"),
            Self::Degraded {
                consecutive_failures,
            } => write!(f, "degraded ({consecutive_failures} failures)"),
        }
    }
}

/// How `connect` ended up receiving events
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionMode {
    Live,
    Polling,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Connected {
    pub mode: ConnectionMode,
}
