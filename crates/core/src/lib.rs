//! Shared foundations for the AskOps policy assistant: the configuration value
//! object, the error taxonomy and the session transcript model with its store
//! contract.

pub mod config;
pub mod errors;
pub mod session;

pub use config::{AppConfig, ConfigError, ConfigOverrides, LoadOptions};
pub use errors::{ApplicationError, DomainError, InterfaceError};
pub use session::{
    SessionId, SessionMetadata, SessionStore, SessionStoreError, Turn, TurnRole,
    INPUT_INTERVENTION_MARKER, OUTPUT_INTERVENTION_MARKER,
};
