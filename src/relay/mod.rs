//! Data Relay Module
//! 
//! A relay session pairs one inbound client with one outbound target and
//! copies bytes between them in both directions.

mod copier;
pub mod session;
pub mod stats;

pub use session::{RelaySession, SessionStatus};
pub use stats::{ConnectionStats, RelayCounters};
