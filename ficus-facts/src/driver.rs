//! Backend driver interface and the kind-to-driver dispatch table.
//!
//! Concrete clients (Kafka, Elasticsearch, SQL...) live outside this crate and
//! plug in by implementing [`BackendDriver`].

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

use crate::datasource::{Credentials, DatasourceKind};
use crate::error::{FactError, FactResult};

/// A live connection owned by a datasource handle
pub trait BackendConnection: Send + Sync + 'static {
    /// Human readable description used in logs
    fn describe(&self) -> String;

    /// Access the concrete connection type
    fn as_any(&self) -> &dyn Any;
}

impl fmt::Debug for dyn BackendConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.describe())
    }
}

/// Client for one datasource technology
#[async_trait]
pub trait BackendDriver: Send + Sync {
    /// Kind serviced by this driver
    fn kind(&self) -> DatasourceKind;

    /// Establish a connection
    ///
    /// Drivers report refusals as `FactError::Connect`; the registry bounds the
    /// call with its connect timeout.
    async fn connect(
        &self,
        code: &str,
        connection: &str,
        credentials: Option<&Credentials>,
    ) -> FactResult<Box<dyn BackendConnection>>;

    /// Release a connection, called once per connection
    async fn close(&self, connection: &dyn BackendConnection);

    /// Whether the connection still works
    async fn healthy(&self, connection: &dyn BackendConnection) -> bool;
}

/// Dispatch table from backend kind to driver
#[derive(Clone, Default)]
pub struct DriverRegistry {
    drivers: HashMap<DatasourceKind, Arc<dyn BackendDriver>>,
}

impl DriverRegistry {
    /// Create an empty dispatch table
    pub fn new() -> Self {
        Self {
            drivers: HashMap::new(),
        }
    }

    /// Register a driver under its own kind, replacing any previous one
    pub fn register(&mut self, driver: Arc<dyn BackendDriver>) -> FactResult<()> {
        let kind = driver.kind();
        if kind == DatasourceKind::Default {
            return Err(FactError::InvalidConfig(
                "A driver cannot be registered for the DEFAULT kind".to_string(),
            ));
        }
        self.drivers.insert(kind, driver);
        Ok(())
    }

    /// Builder form of [`DriverRegistry::register`]
    pub fn with_driver(mut self, driver: Arc<dyn BackendDriver>) -> FactResult<Self> {
        self.register(driver)?;
        Ok(self)
    }

    /// Driver for a concrete kind
    pub fn driver_for(&self, kind: DatasourceKind) -> FactResult<Arc<dyn BackendDriver>> {
        self.drivers.get(&kind).cloned().ok_or(FactError::NoDriver(kind))
    }

    /// All registered kinds
    pub fn kinds(&self) -> Vec<DatasourceKind> {
        let mut kinds: Vec<_> = self.drivers.keys().copied().collect();
        kinds.sort();
        kinds
    }

    /// Whether a driver serves the kind
    pub fn supports(&self, kind: DatasourceKind) -> bool {
        self.drivers.contains_key(&kind)
    }
}

impl fmt::Debug for DriverRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DriverRegistry").field("kinds", &self.kinds()).finish()
    }
}
