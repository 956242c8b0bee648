//! petsit-sync - Local-first real-time sync for the PetSit Connect client
//!
//! Records from push, polling and REST responses all flow through one
//! [`ReconciliationEngine`], which applies a last-writer-wins rule, persists
//! accepted versions in a [`LocalStore`] and fans them out to subscriptions.
//! Domain services (notifications, sitter locations, messages) write
//! optimistic versions through the same path.

pub mod client;
pub mod clock;
pub mod config;
pub mod error;
pub mod models;
pub mod services;
pub mod session;
pub mod store;
pub mod sync;
pub mod transport;
mod util;

pub use client::{ApiClient, AuthProvider, StaticToken};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::SyncConfig;
pub use error::{Error, Result};
pub use models::{Collection, Origin, Record};
pub use services::{LocationService, MessagingService, NotificationService, ServiceContext};
pub use session::SyncSession;
pub use store::{LocalStore, SqliteStore};
pub use sync::{Diagnostic, Outcome, ReconciliationEngine};
pub use transport::{EventTransport, TransportState};
