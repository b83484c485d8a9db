//! Ficus Facts
//!
//! Shared runtime state for fact processing workers:
//!
//! - a [`DatasourceRegistry`] mapping datasource codes to live backend
//!   connections, dispatched by [`DatasourceKind`] through [`BackendDriver`]s
//! - a [`ChangeListener`] that hot-reloads the registry from a datasource
//!   change topic
//! - a [`RuleScriptCache`] that compiles rule scripts into action and
//!   condition objects exactly once per name

#![deny(rust_2018_idioms, nonstandard_style, future_incompatible)]
#![warn(missing_docs)]

pub mod backoff;
pub mod config;
pub mod datasource;
pub mod driver;
pub mod error;
pub mod event;
pub mod listener;
pub mod registry;
pub mod rules;
pub mod transport;

#[doc(hidden)]
pub mod testing;

pub use config::{
    BackoffConfig, FactsConfig, ListenerConfig, RegistryConfig, RuleCacheConfig, TieBreak,
};
pub use datasource::{Credentials, DatasourceConfig, DatasourceKind};
pub use driver::{BackendConnection, BackendDriver, DriverRegistry};
pub use error::{FactError, FactResult};
pub use event::{ChangeAction, ChangeEvent};
pub use listener::{ChangeListener, ListenerState, ListenerStats};
pub use registry::{DatasourceHandle, DatasourceRegistry};
pub use rules::{
    Capability, Facts, RuleAction, RuleCondition, RuleEntryInfo, RuleObject, RuleScriptCache,
};
pub use transport::{ChannelTransport, EventPublisher, EventTransport};

/// Version of the ficus-facts crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Initialize logging at `log_level`
///
/// `RUST_LOG` style filters are not read; fails if a logger is already set.
pub fn init_logging(log_level: log::LevelFilter) -> FactResult<()> {
    env_logger::Builder::new()
        .filter_level(log_level)
        .format_timestamp_millis()
        .try_init()
        .map_err(|e| FactError::InvalidConfig(format!("logger already initialized: {}", e)))?;

    log::info!("Ficus facts v{} initialized", VERSION);
    Ok(())
}
