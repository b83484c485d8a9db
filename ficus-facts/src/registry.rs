//! Datasource Registry
//!
//! The registry is the single source of truth for which backend connection a
//! datasource code uses right now. Reads are served from a mutex-guarded map
//! and never wait for a concurrent reload: a reload connects outside the lock
//! and then swaps the published handle with a compare-and-swap on the version.
//! Retired handles are closed after a grace period so readers still holding
//! them can finish their work.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, FutureExt, Shared};
use log::{debug, info, warn};
use parking_lot::Mutex;

use crate::config::RegistryConfig;
use crate::datasource::{Credentials, DatasourceConfig, DatasourceKind};
use crate::driver::{BackendConnection, BackendDriver, DriverRegistry};
use crate::error::{FactError, FactResult};

/// A published, immutable view of one live backend connection
///
/// Cloning is cheap. A handle is bound to exactly one config version; a reload
/// publishes a new handle instead of mutating this one.
#[derive(Clone)]
pub struct DatasourceHandle {
    inner: Arc<HandleInner>,
}

struct HandleInner {
    config: DatasourceConfig,
    connection: Box<dyn BackendConnection>,
    driver: Arc<dyn BackendDriver>,
    connected_at: DateTime<Utc>,
    opened: Instant,
    closed: AtomicBool,
}

impl DatasourceHandle {
    fn new(
        config: DatasourceConfig,
        connection: Box<dyn BackendConnection>,
        driver: Arc<dyn BackendDriver>,
    ) -> Self {
        Self {
            inner: Arc::new(HandleInner {
                config,
                connection,
                driver,
                connected_at: Utc::now(),
                opened: Instant::now(),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Datasource code
    pub fn code(&self) -> &str {
        &self.inner.config.code
    }

    /// Resolved backend kind, never `Default`
    pub fn kind(&self) -> DatasourceKind {
        self.inner.config.kind
    }

    /// Config version this handle was connected with
    pub fn version(&self) -> u64 {
        self.inner.config.version
    }

    /// Config this handle was connected with
    pub fn config(&self) -> &DatasourceConfig {
        &self.inner.config
    }

    /// The backend connection
    pub fn connection(&self) -> &dyn BackendConnection {
        self.inner.connection.as_ref()
    }

    /// When the connection was established
    pub fn connected_at(&self) -> DateTime<Utc> {
        self.inner.connected_at
    }

    /// Whether the connection outlived the config ttl (a zero ttl never expires)
    pub fn is_expired(&self) -> bool {
        let ttl = self.inner.config.ttl;
        !ttl.is_zero() && self.inner.opened.elapsed() >= ttl
    }

    /// Whether the registry already closed the connection
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Ask the driver whether the connection still works
    pub async fn healthy(&self) -> bool {
        if self.is_closed() {
            return false;
        }
        self.inner.driver.healthy(self.connection()).await
    }

    /// Whether both handles refer to the same connection
    pub fn ptr_eq(&self, other: &DatasourceHandle) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    async fn close(&self) {
        if !self.inner.closed.swap(true, Ordering::SeqCst) {
            self.inner.driver.close(self.connection()).await;
            debug!("Closed datasource {} version {}", self.code(), self.version());
        }
    }
}

impl fmt::Debug for DatasourceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatasourceHandle")
            .field("code", &self.code())
            .field("kind", &self.kind())
            .field("version", &self.version())
            .field("connection", &self.connection().describe())
            .field("closed", &self.is_closed())
            .finish()
    }
}

type SharedConnect = Shared<BoxFuture<'static, FactResult<DatasourceHandle>>>;

/// State of one code in the registry map
enum Slot {
    /// Known config, not connected yet
    Configured(DatasourceConfig),
    /// First connect in flight, every caller awaits the same future
    Connecting {
        attempt: u64,
        config: DatasourceConfig,
        previous: Option<Box<Slot>>,
        future: SharedConnect,
    },
    /// Published handle
    Ready(DatasourceHandle),
    /// Removed; remembers the last version so stale re-adds are dropped
    Tombstone(u64),
}

impl Slot {
    fn version(&self) -> u64 {
        match self {
            Slot::Configured(config) => config.version,
            Slot::Connecting { config, .. } => config.version,
            Slot::Ready(handle) => handle.version(),
            Slot::Tombstone(version) => *version,
        }
    }

    fn config(&self) -> Option<&DatasourceConfig> {
        match self {
            Slot::Configured(config) => Some(config),
            Slot::Connecting { config, .. } => Some(config),
            Slot::Ready(handle) => Some(handle.config()),
            Slot::Tombstone(_) => None,
        }
    }

    fn is_live(&self) -> bool {
        !matches!(self, Slot::Tombstone(_))
    }
}

struct RegistryInner {
    config: RegistryConfig,
    drivers: DriverRegistry,
    entries: Mutex<HashMap<String, Slot>>,
    next_attempt: AtomicU64,
}

impl RegistryInner {
    async fn connect(&self, config: &DatasourceConfig) -> FactResult<DatasourceHandle> {
        let driver = self.drivers.driver_for(config.kind)?;
        let timeout = self.config.connect_timeout;

        debug!(
            "Connecting datasource {} ({}) version {}",
            config.code, config.kind, config.version
        );
        let connect = driver.connect(&config.code, &config.connection, config.credentials.as_ref());
        match tokio::time::timeout(timeout, connect).await {
            Ok(Ok(connection)) => {
                info!(
                    "Connected datasource {} ({}) version {}: {}",
                    config.code,
                    config.kind,
                    config.version,
                    connection.describe()
                );
                Ok(DatasourceHandle::new(config.clone(), connection, driver))
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Err(FactError::ConnectTimeout {
                code: config.code.clone(),
                timeout,
            }),
        }
    }

    /// Publish the outcome of a first connect, unless a reload or removal
    /// superseded the attempt while it was in flight.
    fn finish_connect(
        &self,
        attempt: u64,
        code: &str,
        result: FactResult<DatasourceHandle>,
    ) -> FactResult<DatasourceHandle> {
        let mut entries = self.entries.lock();

        let ours = matches!(
            entries.get(code),
            Some(Slot::Connecting { attempt: current, .. }) if *current == attempt
        );
        if !ours {
            debug!("Connect attempt {} for {} was superseded", attempt, code);
            if let Ok(handle) = &result {
                self.retire(handle.clone(), self.config.close_grace_period);
            }
            return match entries.get(code) {
                Some(Slot::Ready(handle)) => Ok(handle.clone()),
                Some(Slot::Tombstone(_)) | None => {
                    Err(FactError::UnknownDatasource(code.to_string()))
                }
                Some(_) => result,
            };
        }

        match result {
            Ok(handle) => {
                entries.insert(code.to_string(), Slot::Ready(handle.clone()));
                Ok(handle)
            }
            Err(e) => {
                warn!("Failed to connect datasource {}: {}", code, e);
                if let Some(Slot::Connecting { previous, .. }) = entries.remove(code) {
                    if let Some(previous) = previous {
                        entries.insert(code.to_string(), *previous);
                    }
                }
                Err(e)
            }
        }
    }

    /// Close `handle` once `grace` has elapsed
    fn retire(&self, handle: DatasourceHandle, grace: Duration) {
        debug!("Retiring datasource {} version {} in {:?}", handle.code(), handle.version(), grace);
        tokio::spawn(async move {
            if !grace.is_zero() {
                tokio::time::sleep(grace).await;
            }
            handle.close().await;
        });
    }
}

/// Registry of live datasource handles, keyed by datasource code
///
/// Cheap to clone; clones share the same map.
#[derive(Clone)]
pub struct DatasourceRegistry {
    inner: Arc<RegistryInner>,
}

impl DatasourceRegistry {
    /// Create a registry and register the configured initial datasources
    pub fn new(config: RegistryConfig, drivers: DriverRegistry) -> FactResult<Self> {
        config.validate()?;
        if !drivers.supports(config.default_kind) {
            warn!("No driver registered for the default datasource kind {}", config.default_kind);
        }

        let initial = config.initial.clone();
        let registry = Self {
            inner: Arc::new(RegistryInner {
                config,
                drivers,
                entries: Mutex::new(HashMap::new()),
                next_attempt: AtomicU64::new(1),
            }),
        };
        registry.preload(initial)?;
        Ok(registry)
    }

    /// Fallback backend kind for datasources that do not name one
    pub fn default_kind(&self) -> DatasourceKind {
        self.inner.config.default_kind
    }

    /// Register configs without connecting; the first `get` connects
    ///
    /// A config is skipped when the code already holds the same or a newer
    /// version. Returns how many configs were registered.
    pub fn preload(
        &self,
        configs: impl IntoIterator<Item = DatasourceConfig>,
    ) -> FactResult<usize> {
        let default_kind = self.default_kind();
        let mut entries = self.inner.entries.lock();
        let mut registered = 0;

        for config in configs {
            config.validate()?;
            let config = config.resolved(default_kind);
            let fresh = match entries.get(&config.code) {
                None => true,
                Some(Slot::Tombstone(version)) => config.version > *version,
                Some(_) => false,
            };
            if fresh {
                debug!("Preloaded datasource {} version {}", config.code, config.version);
                entries.insert(config.code.clone(), Slot::Configured(config));
                registered += 1;
            }
        }

        Ok(registered)
    }

    /// Return the handle for `code`, connecting it first when unknown
    ///
    /// Concurrent callers for the same unknown code share one connect. A code
    /// that is already known keeps its registered config; the arguments only
    /// describe the datasource to create.
    pub async fn get_or_create(
        &self,
        code: &str,
        kind: DatasourceKind,
        connection: &str,
        credentials: Option<Credentials>,
    ) -> FactResult<DatasourceHandle> {
        let pending = {
            let mut entries = self.inner.entries.lock();
            match entries.get(code) {
                Some(Slot::Ready(handle)) => return Ok(handle.clone()),
                Some(Slot::Connecting { future, .. }) => future.clone(),
                Some(Slot::Configured(config)) => {
                    let config = config.clone();
                    self.begin_connect(&mut entries, config)
                }
                Some(Slot::Tombstone(tombstone)) => {
                    let tombstone = *tombstone;
                    let config =
                        self.creation_config(code, kind, connection, credentials, tombstone)?;
                    self.begin_connect(&mut entries, config)
                }
                None => {
                    let config = self.creation_config(code, kind, connection, credentials, 0)?;
                    self.begin_connect(&mut entries, config)
                }
            }
        };

        pending.await
    }

    /// Return the handle for a registered code
    ///
    /// Preloaded or lazily reloaded configs are connected on first use.
    pub async fn get(&self, code: &str) -> FactResult<DatasourceHandle> {
        let pending = {
            let mut entries = self.inner.entries.lock();
            match entries.get(code) {
                Some(Slot::Ready(handle)) => return Ok(handle.clone()),
                Some(Slot::Connecting { future, .. }) => future.clone(),
                Some(Slot::Configured(config)) => {
                    let config = config.clone();
                    self.begin_connect(&mut entries, config)
                }
                Some(Slot::Tombstone(_)) | None => {
                    return Err(FactError::UnknownDatasource(code.to_string()));
                }
            }
        };

        pending.await
    }

    /// Swap in a newly connected handle for `config.code`
    ///
    /// Fails with `StaleVersion` when the version does not advance past the
    /// current one (or the tombstone of a removed code); the registry is left
    /// untouched and nothing is connected. On connect failure the previous
    /// handle keeps serving.
    pub async fn replace(&self, config: DatasourceConfig) -> FactResult<()> {
        config.validate()?;
        let config = config.resolved(self.default_kind());
        let code = config.code.clone();

        self.check_advances(&code, config.version)?;

        let handle = self.inner.connect(&config).await?;

        let previous = {
            let mut entries = self.inner.entries.lock();
            if let Some(current) = entries.get(&code).map(Slot::version) {
                if config.version <= current {
                    drop(entries);
                    debug!(
                        "Datasource {} moved past version {} while connecting",
                        code, config.version
                    );
                    self.inner.retire(handle, Duration::ZERO);
                    return Err(FactError::StaleVersion {
                        code,
                        current,
                        offered: config.version,
                    });
                }
            }
            entries.insert(code.clone(), Slot::Ready(handle))
        };

        if let Some(Slot::Ready(old)) = previous {
            self.inner.retire(old, self.inner.config.close_grace_period);
        }
        info!("Datasource {} replaced with version {}", code, config.version);
        Ok(())
    }

    /// Close and evict `code`
    ///
    /// Subsequent `get` calls fail with `UnknownDatasource` until a newer
    /// version is added again.
    pub async fn remove(&self, code: &str) -> FactResult<()> {
        let previous = {
            let mut entries = self.inner.entries.lock();
            let version = match entries.get(code) {
                Some(slot) if slot.is_live() => slot.version(),
                _ => return Err(FactError::UnknownDatasource(code.to_string())),
            };
            entries.insert(code.to_string(), Slot::Tombstone(version))
        };

        self.retire_slot(code, previous);
        Ok(())
    }

    /// Remove `code` as of `version`
    ///
    /// A removal older than the live version is stale. Removing an unknown
    /// code still records the tombstone and returns `Ok(false)`.
    pub async fn remove_versioned(&self, code: &str, version: u64) -> FactResult<bool> {
        let previous = {
            let mut entries = self.inner.entries.lock();
            match entries.get(code) {
                Some(slot) if slot.is_live() => {
                    let current = slot.version();
                    if version < current {
                        return Err(FactError::StaleVersion {
                            code: code.to_string(),
                            current,
                            offered: version,
                        });
                    }
                    entries.insert(code.to_string(), Slot::Tombstone(version.max(current)))
                }
                Some(slot) => {
                    let tombstone = version.max(slot.version());
                    entries.insert(code.to_string(), Slot::Tombstone(tombstone));
                    return Ok(false);
                }
                None => {
                    entries.insert(code.to_string(), Slot::Tombstone(version));
                    return Ok(false);
                }
            }
        };

        self.retire_slot(code, previous);
        Ok(true)
    }

    /// Codes with a live datasource, sorted
    pub fn codes(&self) -> Vec<String> {
        let entries = self.inner.entries.lock();
        let mut codes: Vec<String> = entries
            .iter()
            .filter(|(_, slot)| slot.is_live())
            .map(|(code, _)| code.clone())
            .collect();
        codes.sort();
        codes
    }

    /// Whether `code` has a live datasource
    pub fn contains(&self, code: &str) -> bool {
        self.inner.entries.lock().get(code).map_or(false, Slot::is_live)
    }

    /// Version of the live datasource registered under `code`
    pub fn version_of(&self, code: &str) -> Option<u64> {
        let entries = self.inner.entries.lock();
        entries.get(code).filter(|slot| slot.is_live()).map(Slot::version)
    }

    /// Whether a live connection is currently published for `code`
    pub fn is_connected(&self, code: &str) -> bool {
        matches!(self.inner.entries.lock().get(code), Some(Slot::Ready(_)))
    }

    /// Number of live datasources
    pub fn len(&self) -> usize {
        self.inner.entries.lock().values().filter(|slot| slot.is_live()).count()
    }

    /// Whether no datasource is live
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Configs of all live datasources, sorted by code
    pub fn snapshot(&self) -> Vec<DatasourceConfig> {
        let entries = self.inner.entries.lock();
        let mut configs: Vec<DatasourceConfig> =
            entries.values().filter_map(Slot::config).cloned().collect();
        configs.sort_by(|a, b| a.code.cmp(&b.code));
        configs
    }

    /// Driver health of every connected datasource, sorted by code
    pub async fn health_report(&self) -> Vec<(String, bool)> {
        let handles: Vec<DatasourceHandle> = {
            let entries = self.inner.entries.lock();
            entries
                .values()
                .filter_map(|slot| match slot {
                    Slot::Ready(handle) => Some(handle.clone()),
                    _ => None,
                })
                .collect()
        };

        let mut report = Vec::with_capacity(handles.len());
        for handle in handles {
            let healthy = handle.healthy().await;
            report.push((handle.code().to_string(), healthy));
        }
        report.sort();
        report
    }

    /// Close every connection immediately and forget all datasources
    pub async fn close_all(&self) {
        let handles: Vec<DatasourceHandle> = {
            let mut entries = self.inner.entries.lock();
            entries
                .drain()
                .filter_map(|(_, slot)| match slot {
                    Slot::Ready(handle) => Some(handle),
                    _ => None,
                })
                .collect()
        };

        info!("Closing {} datasource connections", handles.len());
        for handle in handles {
            handle.close().await;
        }
    }

    fn creation_config(
        &self,
        code: &str,
        kind: DatasourceKind,
        connection: &str,
        credentials: Option<Credentials>,
        version: u64,
    ) -> FactResult<DatasourceConfig> {
        let mut config = DatasourceConfig::new(code, kind, connection).with_version(version);
        config.credentials = credentials;
        config.validate()?;
        Ok(config.resolved(self.default_kind()))
    }

    fn check_advances(&self, code: &str, offered: u64) -> FactResult<()> {
        let entries = self.inner.entries.lock();
        if let Some(current) = entries.get(code).map(Slot::version) {
            if offered <= current {
                return Err(FactError::StaleVersion {
                    code: code.to_string(),
                    current,
                    offered,
                });
            }
        }
        Ok(())
    }

    /// Install a `Connecting` slot for `config` and return the shared future
    fn begin_connect(
        &self,
        entries: &mut HashMap<String, Slot>,
        config: DatasourceConfig,
    ) -> SharedConnect {
        let attempt = self.inner.next_attempt.fetch_add(1, Ordering::Relaxed);
        let code = config.code.clone();
        let inner = Arc::clone(&self.inner);
        let target = config.clone();

        let future = async move {
            let result = inner.connect(&target).await;
            inner.finish_connect(attempt, &target.code, result)
        }
        .boxed()
        .shared();

        let previous = entries.remove(&code).map(Box::new);
        entries.insert(
            code,
            Slot::Connecting {
                attempt,
                config,
                previous,
                future: future.clone(),
            },
        );
        future
    }

    fn retire_slot(&self, code: &str, previous: Option<Slot>) {
        match previous {
            Some(Slot::Ready(handle)) => {
                info!("Datasource {} removed at version {}", code, handle.version());
                self.inner.retire(handle, self.inner.config.close_grace_period);
            }
            Some(_) => info!("Datasource {} removed before it was connected", code),
            None => {}
        }
    }
}

impl fmt::Debug for DatasourceRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatasourceRegistry")
            .field("default_kind", &self.default_kind())
            .field("drivers", &self.inner.drivers)
            .field("codes", &self.codes())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{registry_with, CountingDriver};

    fn es(code: &str, version: u64) -> DatasourceConfig {
        DatasourceConfig::new(code, DatasourceKind::Es, "http://localhost:9200")
            .with_version(version)
    }

    #[tokio::test]
    async fn test_get_or_create_connects_once() {
        let driver = Arc::new(CountingDriver::new(DatasourceKind::Es));
        let registry = registry_with(vec![driver.clone()], Duration::ZERO);

        let first = registry
            .get_or_create("es_test", DatasourceKind::Es, "http://localhost:9200", None)
            .await
            .unwrap();
        let second = registry
            .get_or_create("es_test", DatasourceKind::Es, "http://elsewhere:9200", None)
            .await
            .unwrap();

        assert!(first.ptr_eq(&second));
        assert_eq!(driver.connects(), 1);
        assert_eq!(second.config().connection, "http://localhost:9200");
    }

    #[tokio::test]
    async fn test_default_kind_is_resolved() {
        let driver = Arc::new(CountingDriver::new(DatasourceKind::Kafka));
        let registry = registry_with(vec![driver.clone()], Duration::ZERO);
        assert_eq!(registry.default_kind(), DatasourceKind::Kafka);

        let handle = registry
            .get_or_create("events", DatasourceKind::Default, "broker:9092", None)
            .await
            .unwrap();
        assert_eq!(handle.kind(), DatasourceKind::Kafka);
    }

    #[tokio::test]
    async fn test_replace_swaps_and_closes_old_handle() {
        let driver = Arc::new(CountingDriver::new(DatasourceKind::Es));
        let registry = registry_with(vec![driver.clone()], Duration::ZERO);

        registry.replace(es("es_test", 1)).await.unwrap();
        let old = registry.get("es_test").await.unwrap();
        registry.replace(es("es_test", 2)).await.unwrap();
        let new = registry.get("es_test").await.unwrap();

        assert!(!old.ptr_eq(&new));
        assert_eq!(new.version(), 2);
        assert_eq!(registry.version_of("es_test"), Some(2));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(old.is_closed());
        assert!(!new.is_closed());
        assert_eq!(driver.closes(), 1);
    }

    #[tokio::test]
    async fn test_stale_replace_is_a_noop() {
        let driver = Arc::new(CountingDriver::new(DatasourceKind::Es));
        let registry = registry_with(vec![driver.clone()], Duration::ZERO);

        registry.replace(es("es_test", 3)).await.unwrap();
        let before = registry.get("es_test").await.unwrap();

        for version in [1, 3] {
            let err = registry.replace(es("es_test", version)).await.unwrap_err();
            assert!(err.is_stale());
        }

        let after = registry.get("es_test").await.unwrap();
        assert!(before.ptr_eq(&after));
        assert_eq!(driver.connects(), 1);
    }

    #[tokio::test]
    async fn test_remove_then_stale_add_stays_removed() {
        let driver = Arc::new(CountingDriver::new(DatasourceKind::Es));
        let registry = registry_with(vec![driver.clone()], Duration::ZERO);

        registry.replace(es("es_test", 1)).await.unwrap();
        registry.remove("es_test").await.unwrap();

        assert_eq!(
            registry.get("es_test").await.unwrap_err(),
            FactError::UnknownDatasource("es_test".to_string())
        );
        assert!(registry.replace(es("es_test", 1)).await.unwrap_err().is_stale());
        assert!(!registry.contains("es_test"));

        registry.replace(es("es_test", 2)).await.unwrap();
        assert_eq!(registry.get("es_test").await.unwrap().version(), 2);
    }

    #[tokio::test]
    async fn test_remove_unknown_code() {
        let driver = Arc::new(CountingDriver::new(DatasourceKind::Es));
        let registry = registry_with(vec![driver], Duration::ZERO);
        assert!(matches!(
            registry.remove("missing").await,
            Err(FactError::UnknownDatasource(_))
        ));
        assert_eq!(registry.remove_versioned("missing", 4).await, Ok(false));
        assert!(registry.replace(es("missing", 4)).await.unwrap_err().is_stale());
    }

    #[tokio::test]
    async fn test_remove_versioned_ignores_older_delete() {
        let driver = Arc::new(CountingDriver::new(DatasourceKind::Es));
        let registry = registry_with(vec![driver], Duration::ZERO);

        registry.replace(es("es_test", 5)).await.unwrap();
        assert!(registry.remove_versioned("es_test", 4).await.unwrap_err().is_stale());
        assert!(registry.contains("es_test"));

        assert_eq!(registry.remove_versioned("es_test", 5).await, Ok(true));
        assert!(!registry.contains("es_test"));
    }

    #[tokio::test]
    async fn test_preload_connects_lazily() {
        let driver = Arc::new(CountingDriver::new(DatasourceKind::Es));
        let registry = registry_with(vec![driver.clone()], Duration::ZERO);

        assert_eq!(registry.preload(vec![es("a", 1), es("b", 1)]).unwrap(), 2);
        assert_eq!(registry.codes(), vec!["a".to_string(), "b".to_string()]);
        assert_eq!(driver.connects(), 0);
        assert!(!registry.is_connected("a"));

        registry.get("a").await.unwrap();
        assert_eq!(driver.connects(), 1);
        assert!(registry.is_connected("a"));
    }

    #[tokio::test]
    async fn test_failed_connect_is_not_cached() {
        let driver = Arc::new(CountingDriver::new(DatasourceKind::Es));
        let registry = registry_with(vec![driver.clone()], Duration::ZERO);

        driver.fail_next(1);
        let err = registry
            .get_or_create("es_test", DatasourceKind::Es, "http://localhost:9200", None)
            .await
            .unwrap_err();
        assert!(err.is_transient());
        assert!(!registry.contains("es_test"));

        registry
            .get_or_create("es_test", DatasourceKind::Es, "http://localhost:9200", None)
            .await
            .unwrap();
        assert_eq!(driver.connects(), 2);
    }

    #[tokio::test]
    async fn test_failed_replace_keeps_previous_handle() {
        let driver = Arc::new(CountingDriver::new(DatasourceKind::Es));
        let registry = registry_with(vec![driver.clone()], Duration::ZERO);

        registry.replace(es("es_test", 1)).await.unwrap();
        driver.fail_next(1);
        assert!(registry.replace(es("es_test", 2)).await.is_err());

        let handle = registry.get("es_test").await.unwrap();
        assert_eq!(handle.version(), 1);
        assert!(!handle.is_closed());
    }

    #[tokio::test]
    async fn test_connect_timeout() {
        let driver =
            Arc::new(CountingDriver::new(DatasourceKind::Es).with_delay(Duration::from_secs(5)));
        let registry = DatasourceRegistry::new(
            RegistryConfig::new()
                .default_kind(DatasourceKind::Es)
                .connect_timeout(Duration::from_millis(20)),
            DriverRegistry::new().with_driver(driver).unwrap(),
        )
        .unwrap();

        let err = registry.replace(es("slow", 1)).await.unwrap_err();
        assert!(matches!(err, FactError::ConnectTimeout { .. }));
        assert!(!registry.contains("slow"));
    }

    #[tokio::test]
    async fn test_missing_driver() {
        let driver = Arc::new(CountingDriver::new(DatasourceKind::Es));
        let registry = registry_with(vec![driver], Duration::ZERO);
        let err = registry
            .get_or_create("pg", DatasourceKind::Sql, "postgres://db", None)
            .await
            .unwrap_err();
        assert_eq!(err, FactError::NoDriver(DatasourceKind::Sql));
    }

    #[tokio::test]
    async fn test_health_report_and_close_all() {
        let driver = Arc::new(CountingDriver::new(DatasourceKind::Es));
        let registry = registry_with(vec![driver.clone()], Duration::ZERO);

        registry.replace(es("a", 1)).await.unwrap();
        registry.replace(es("b", 1)).await.unwrap();
        let report = registry.health_report().await;
        assert_eq!(report, vec![("a".to_string(), true), ("b".to_string(), true)]);

        driver.set_healthy(false);
        let report = registry.health_report().await;
        assert_eq!(report, vec![("a".to_string(), false), ("b".to_string(), false)]);
        assert!(!registry.get("a").await.unwrap().healthy().await);
        driver.set_healthy(true);

        registry.close_all().await;
        assert!(registry.is_empty());
        assert_eq!(driver.closes(), 2);
    }

    #[tokio::test]
    async fn test_handle_ttl() {
        let driver = Arc::new(CountingDriver::new(DatasourceKind::Es));
        let registry = registry_with(vec![driver], Duration::ZERO);

        registry.replace(es("forever", 1)).await.unwrap();
        registry
            .replace(es("short", 1).with_ttl(Duration::from_secs(1)))
            .await
            .unwrap();

        assert!(!registry.get("forever").await.unwrap().is_expired());
        assert!(!registry.get("short").await.unwrap().is_expired());
    }
}
