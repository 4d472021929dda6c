//! Sync server, session orchestration, and the conduit pipeline

pub mod conduit;
pub mod server;
pub mod session;

pub use conduit::{Conduit, default_pipeline};
pub use server::{ServerController, SyncEvent, SyncServer};
pub use session::{SessionContext, SessionOutcome, SyncType};
