// membroker - Cross-process memory pool broker
// A long-lived server that owns physical memory pools and lends byte
// ranges to client processes, reclaiming idle reservations as demand shifts.

#![warn(rust_2018_idioms)]

pub mod broker;
pub mod config;
pub mod metrics;
pub mod network;
pub mod pool;
pub mod session;

// Re-exports for convenience
pub use broker::Broker;
pub use config::BrokerConfig;
pub use pool::{Handle, Pool};
pub use session::{SessionId, SessionRegistry};

/// Broker error types
pub mod error {
    use thiserror::Error;

    #[derive(Error, Debug)]
    pub enum Error {
        #[error("Invalid argument: {0}")]
        InvalidArgument(String),

        #[error("Unauthorized: {0}")]
        Unauthorized(String),

        #[error("Not owner: {0}")]
        NotOwner(String),

        #[error("Pool exhausted: {0}")]
        Exhausted(String),

        #[error("Quota exceeded: {0}")]
        QuotaExceeded(String),

        #[error("Session dead: {0}")]
        SessionDead(String),

        #[error("Network error: {0}")]
        Network(String),

        #[error("Internal error: {0}")]
        Internal(String),
    }

    pub type Result<T> = std::result::Result<T, Error>;
}

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = error::Error::Exhausted("pool 0".to_string());
        assert_eq!(err.to_string(), "Pool exhausted: pool 0");
    }

    #[test]
    fn test_version_format() {
        let _version: &str = VERSION;
    }
}
