//! Test doubles for the registry and listener.

use std::any::Any;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::config::RegistryConfig;
use crate::datasource::{Credentials, DatasourceKind};
use crate::driver::{BackendConnection, BackendDriver, DriverRegistry};
use crate::error::{FactError, FactResult};
use crate::registry::DatasourceRegistry;

/// Connection produced by [`CountingDriver`]
#[derive(Debug)]
pub struct MemoryConnection {
    /// Datasource code
    pub code: String,
    /// Connection string passed to the driver
    pub connection: String,
    /// Sequence number of the connect that produced it, starting at 1
    pub serial: usize,
}

impl BackendConnection for MemoryConnection {
    fn describe(&self) -> String {
        format!("memory://{}#{}", self.code, self.serial)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Driver that records every call and can inject delays and failures
pub struct CountingDriver {
    kind: DatasourceKind,
    delay: Duration,
    connects: AtomicUsize,
    closes: AtomicUsize,
    failures: AtomicUsize,
    healthy: AtomicBool,
}

impl CountingDriver {
    /// Create a driver for `kind`
    pub fn new(kind: DatasourceKind) -> Self {
        Self {
            kind,
            delay: Duration::ZERO,
            connects: AtomicUsize::new(0),
            closes: AtomicUsize::new(0),
            failures: AtomicUsize::new(0),
            healthy: AtomicBool::new(true),
        }
    }

    /// Make every connect take `delay`
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Make the next `count` connects fail
    pub fn fail_next(&self, count: usize) {
        self.failures.store(count, Ordering::SeqCst);
    }

    /// Set what `healthy` reports
    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::SeqCst);
    }

    /// Number of connect calls so far, failed ones included
    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    /// Number of close calls so far
    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BackendDriver for CountingDriver {
    fn kind(&self) -> DatasourceKind {
        self.kind
    }

    async fn connect(
        &self,
        code: &str,
        connection: &str,
        _credentials: Option<&Credentials>,
    ) -> FactResult<Box<dyn BackendConnection>> {
        let serial = self.connects.fetch_add(1, Ordering::SeqCst) + 1;
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        let failing = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if failing {
            return Err(FactError::Connect {
                code: code.to_string(),
                kind: self.kind,
                reason: "injected failure".to_string(),
            });
        }

        Ok(Box::new(MemoryConnection {
            code: code.to_string(),
            connection: connection.to_string(),
            serial,
        }))
    }

    async fn close(&self, _connection: &dyn BackendConnection) {
        self.closes.fetch_add(1, Ordering::SeqCst);
    }

    async fn healthy(&self, _connection: &dyn BackendConnection) -> bool {
        self.healthy.load(Ordering::SeqCst)
    }
}

/// Registry over the given drivers; the first driver's kind is the default
pub fn registry_with(
    drivers: Vec<Arc<CountingDriver>>,
    close_grace_period: Duration,
) -> DatasourceRegistry {
    let default_kind = drivers.first().map_or(DatasourceKind::Kafka, |driver| driver.kind);
    let mut table = DriverRegistry::new();
    for driver in drivers {
        table.register(driver).expect("test drivers serve concrete kinds");
    }

    DatasourceRegistry::new(
        RegistryConfig::new()
            .default_kind(default_kind)
            .close_grace_period(close_grace_period),
        table,
    )
    .expect("valid test registry config")
}
