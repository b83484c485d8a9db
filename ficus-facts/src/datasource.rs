//! Datasource configuration model.
//!
//! A datasource is a named, typed external data connection. Its configuration
//! is what travels on the change-event topic and what the registry compares
//! versions on.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{FactError, FactResult};

/// Technology family of a datasource, selects the backend driver
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DatasourceKind {
    /// Kafka topic
    #[serde(alias = "kafka")]
    Kafka,
    /// Elasticsearch index
    #[serde(alias = "es", alias = "elasticsearch", alias = "ELASTICSEARCH")]
    Es,
    /// Relational database
    #[serde(alias = "sql", alias = "jdbc", alias = "JDBC")]
    Sql,
    /// Resolved to the registry's configured fallback kind
    #[serde(alias = "default")]
    Default,
}

impl Default for DatasourceKind {
    fn default() -> Self {
        DatasourceKind::Default
    }
}

impl fmt::Display for DatasourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DatasourceKind::Kafka => "KAFKA",
            DatasourceKind::Es => "ES",
            DatasourceKind::Sql => "SQL",
            DatasourceKind::Default => "DEFAULT",
        };
        f.write_str(name)
    }
}

impl FromStr for DatasourceKind {
    type Err = FactError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "KAFKA" => Ok(DatasourceKind::Kafka),
            "ES" | "ELASTICSEARCH" => Ok(DatasourceKind::Es),
            "SQL" | "JDBC" => Ok(DatasourceKind::Sql),
            "DEFAULT" | "" => Ok(DatasourceKind::Default),
            other => Err(FactError::InvalidConfig(format!("Unknown datasource kind: {}", other))),
        }
    }
}

/// Opaque credential bytes handed to the backend driver
///
/// Never printed: `Debug` only reports the length.
#[derive(Clone, PartialEq, Eq, Default)]
pub struct Credentials(Vec<u8>);

impl Credentials {
    /// Wrap raw credential bytes
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    /// Raw credential bytes
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Number of credential bytes
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether no credential bytes are present
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Credentials(<redacted {} bytes>)", self.0.len())
    }
}

impl Serialize for Credentials {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match std::str::from_utf8(&self.0) {
            Ok(text) => serializer.serialize_str(text),
            Err(_) => self.0.serialize(serializer),
        }
    }
}

impl<'de> Deserialize<'de> for Credentials {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Text(String),
            Bytes(Vec<u8>),
        }

        Ok(match Raw::deserialize(deserializer)? {
            Raw::Text(text) => Credentials(text.into_bytes()),
            Raw::Bytes(bytes) => Credentials(bytes),
        })
    }
}

/// Connection configuration of one datasource
///
/// `version` strictly increases on every successful reload of the same `code`;
/// the registry uses it to discard out-of-order and duplicate reloads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasourceConfig {
    /// Unique datasource code
    pub code: String,

    /// Backend kind, `Default` when the event omits it
    #[serde(default)]
    pub kind: DatasourceKind,

    /// Driver specific connection string
    #[serde(default)]
    pub connection: String,

    /// Opaque credentials
    #[serde(default)]
    pub credentials: Option<Credentials>,

    /// Free-form tags
    #[serde(default)]
    pub tags: BTreeSet<String>,

    /// Site (deployment location) the datasource belongs to
    #[serde(default)]
    pub site: String,

    /// Advisory time-to-live of a connection, zero means unbounded
    #[serde(default, with = "ttl_secs")]
    pub ttl: Duration,

    /// Monotonic config version
    #[serde(default)]
    pub version: u64,
}

impl DatasourceConfig {
    /// Create a version-0 config
    pub fn new(
        code: impl Into<String>,
        kind: DatasourceKind,
        connection: impl Into<String>,
    ) -> Self {
        Self {
            code: code.into(),
            kind,
            connection: connection.into(),
            credentials: None,
            tags: BTreeSet::new(),
            site: String::new(),
            ttl: Duration::ZERO,
            version: 0,
        }
    }

    /// Set the version
    pub fn with_version(mut self, version: u64) -> Self {
        self.version = version;
        self
    }

    /// Set the credentials
    pub fn with_credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = Some(credentials);
        self
    }

    /// Add a tag
    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.insert(tag.into());
        self
    }

    /// Set the site
    pub fn with_site(mut self, site: impl Into<String>) -> Self {
        self.site = site.into();
        self
    }

    /// Set the connection ttl
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    /// Check the config can be handed to a driver
    pub fn validate(&self) -> FactResult<()> {
        if self.code.trim().is_empty() {
            return Err(FactError::InvalidConfig("Datasource code cannot be empty".to_string()));
        }
        Ok(())
    }

    /// The config with `Default` kind replaced by `fallback`
    pub(crate) fn resolved(mut self, fallback: DatasourceKind) -> Self {
        if self.kind == DatasourceKind::Default {
            self.kind = fallback;
        }
        self
    }
}

mod ttl_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(ttl: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(ttl.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = Option::<u64>::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs.unwrap_or(0)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_parsing() {
        assert_eq!("kafka".parse::<DatasourceKind>().unwrap(), DatasourceKind::Kafka);
        assert_eq!("Elasticsearch".parse::<DatasourceKind>().unwrap(), DatasourceKind::Es);
        assert_eq!("".parse::<DatasourceKind>().unwrap(), DatasourceKind::Default);
        assert!("mongo".parse::<DatasourceKind>().is_err());
        assert_eq!(DatasourceKind::Sql.to_string(), "SQL");
    }

    #[test]
    fn test_config_defaults_from_json() {
        let config: DatasourceConfig = serde_json::from_value(serde_json::json!({
            "code": "es_test",
            "connection": "http://localhost:9200",
        }))
        .unwrap();

        assert_eq!(config.kind, DatasourceKind::Default);
        assert_eq!(config.version, 0);
        assert_eq!(config.ttl, Duration::ZERO);
        assert!(config.credentials.is_none());
        assert!(config.tags.is_empty());
    }

    #[test]
    fn test_credentials_are_redacted() {
        let config = DatasourceConfig::new("pg", DatasourceKind::Sql, "postgres://db")
            .with_credentials(Credentials::new("s3cret"));

        let printed = format!("{:?}", config);
        assert!(!printed.contains("s3cret"));
        assert!(printed.contains("redacted 6 bytes"));
    }

    #[test]
    fn test_credentials_accept_text_and_bytes() {
        let text: Credentials = serde_json::from_str("\"user:pass\"").unwrap();
        assert_eq!(text.as_bytes(), b"user:pass");

        let bytes: Credentials = serde_json::from_str("[0, 159, 146, 150]").unwrap();
        assert_eq!(bytes.as_bytes(), &[0, 159, 146, 150]);
        assert_eq!(serde_json::to_string(&bytes).unwrap(), "[0,159,146,150]");
    }

    #[test]
    fn test_resolved_kind() {
        let config = DatasourceConfig::new("t", DatasourceKind::Default, "");
        assert_eq!(config.resolved(DatasourceKind::Kafka).kind, DatasourceKind::Kafka);

        let config = DatasourceConfig::new("t", DatasourceKind::Sql, "");
        assert_eq!(config.resolved(DatasourceKind::Kafka).kind, DatasourceKind::Sql);
    }

    #[test]
    fn test_validate_rejects_empty_code() {
        assert!(DatasourceConfig::new(" ", DatasourceKind::Es, "").validate().is_err());
    }
}
