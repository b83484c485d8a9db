//! Datasource change events.
//!
//! Wire format is JSON:
//! `{"action": "UPDATE", "datasource": {"code": ..., "kind": ..., "version": ...}}`.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::datasource::DatasourceConfig;
use crate::error::{FactError, FactResult};

/// What happened to the datasource
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeAction {
    /// A datasource was created
    #[serde(alias = "add")]
    Add,
    /// A datasource config changed
    #[serde(alias = "update")]
    Update,
    /// A datasource was deleted
    #[serde(alias = "delete")]
    Delete,
}

impl fmt::Display for ChangeAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ChangeAction::Add => "ADD",
            ChangeAction::Update => "UPDATE",
            ChangeAction::Delete => "DELETE",
        };
        f.write_str(name)
    }
}

/// One change notification from the control plane
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    /// Kind of change
    pub action: ChangeAction,
    /// Affected datasource, at the version the change produced
    pub datasource: DatasourceConfig,
}

impl ChangeEvent {
    /// Create an ADD event
    pub fn add(datasource: DatasourceConfig) -> Self {
        Self {
            action: ChangeAction::Add,
            datasource,
        }
    }

    /// Create an UPDATE event
    pub fn update(datasource: DatasourceConfig) -> Self {
        Self {
            action: ChangeAction::Update,
            datasource,
        }
    }

    /// Create a DELETE event
    pub fn delete(datasource: DatasourceConfig) -> Self {
        Self {
            action: ChangeAction::Delete,
            datasource,
        }
    }

    /// Decode a transport payload
    ///
    /// Any payload that is not a well formed event is reported as
    /// `MalformedEvent` so the listener can skip it.
    pub fn decode(payload: &[u8]) -> FactResult<Self> {
        let event: ChangeEvent =
            serde_json::from_slice(payload).map_err(|e| FactError::MalformedEvent(e.to_string()))?;
        event
            .datasource
            .validate()
            .map_err(|e| FactError::MalformedEvent(e.to_string()))?;
        Ok(event)
    }

    /// Encode as a transport payload
    pub fn encode(&self) -> FactResult<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Code of the affected datasource
    pub fn code(&self) -> &str {
        &self.datasource.code
    }

    /// Version carried by the event
    pub fn version(&self) -> u64 {
        self.datasource.version
    }
}
