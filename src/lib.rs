//! TcpBounce Library
//!
//! TCP port forwarding relay. Each forwarding rule maps a local port to a
//! remote `host:port`; one session per rule accepts a single client,
//! connects it to the target and copies bytes both ways until either side
//! closes.

pub mod config;
pub mod error;
pub mod metrics;
pub mod registry;
pub mod relay;
pub mod shutdown;

pub use config::{Config, ForwardRule, RelaySettings};
pub use error::{RelayError, RuleParseError, StartError};
pub use registry::SessionRegistry;
pub use relay::{RelaySession, SessionStatus};
pub use shutdown::ShutdownCoordinator;

/// Common error type for the relay
pub type Result<T> = anyhow::Result<T>;
