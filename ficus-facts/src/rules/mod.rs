//! Rule scripts
//!
//! Rule source text is compiled from a restricted script language into
//! objects serving one of two capabilities: an executable [`RuleAction`] or
//! an evaluable [`RuleCondition`]. Scripts cannot perform I/O; they only read
//! and write the [`Facts`] they are given.
//!
//! ```text
//! rule LargeOrder: Condition, Action {
//!     let limit = 1000;
//!     when order.amount > limit and order.currency in ["EUR", "USD"];
//!     then { set order.review = true; }
//! }
//! ```
//!
//! [`RuleScriptCache`] compiles each named script at most once.

mod ast;
mod cache;
mod compiler;
mod eval;
mod lexer;
mod parser;

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::FactResult;

pub use cache::{RuleEntryInfo, RuleScriptCache};

/// Facts a rule is evaluated against
pub type Facts = serde_json::Map<String, serde_json::Value>;

/// Role a compiled rule fulfils
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Capability {
    /// Mutates facts
    Action,
    /// Tests facts
    Condition,
}

impl Capability {
    /// Name used in script declarations
    pub fn marker(self) -> &'static str {
        match self {
            Capability::Action => "Action",
            Capability::Condition => "Condition",
        }
    }

    pub(crate) fn from_marker(name: &str) -> Option<Self> {
        match name {
            "Action" => Some(Capability::Action),
            "Condition" => Some(Capability::Condition),
            _ => None,
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Capability::Action => f.write_str("ACTION"),
            Capability::Condition => f.write_str("CONDITION"),
        }
    }
}

/// A compiled rule that tests facts
pub trait RuleCondition: Send + Sync {
    /// Declared rule name
    fn name(&self) -> &str;

    /// Whether the facts satisfy the rule
    fn evaluate(&self, facts: &Facts) -> FactResult<bool>;
}

/// A compiled rule that mutates facts
pub trait RuleAction: Send + Sync {
    /// Declared rule name
    fn name(&self) -> &str;

    /// Apply the rule to the facts
    fn execute(&self, facts: &mut Facts) -> FactResult<()>;
}

/// Instantiated rule, shared by every caller that loaded it
#[derive(Clone)]
pub enum RuleObject {
    /// An action rule
    Action(Arc<dyn RuleAction>),
    /// A condition rule
    Condition(Arc<dyn RuleCondition>),
}

impl RuleObject {
    /// Capability this object serves
    pub fn capability(&self) -> Capability {
        match self {
            RuleObject::Action(_) => Capability::Action,
            RuleObject::Condition(_) => Capability::Condition,
        }
    }

    /// Declared rule name
    pub fn name(&self) -> &str {
        match self {
            RuleObject::Action(action) => action.name(),
            RuleObject::Condition(condition) => condition.name(),
        }
    }

    /// The action, if this is one
    pub fn as_action(&self) -> Option<&Arc<dyn RuleAction>> {
        match self {
            RuleObject::Action(action) => Some(action),
            RuleObject::Condition(_) => None,
        }
    }

    /// The condition, if this is one
    pub fn as_condition(&self) -> Option<&Arc<dyn RuleCondition>> {
        match self {
            RuleObject::Condition(condition) => Some(condition),
            RuleObject::Action(_) => None,
        }
    }

    /// Whether both refer to the same instance
    pub fn ptr_eq(&self, other: &RuleObject) -> bool {
        match (self, other) {
            (RuleObject::Action(a), RuleObject::Action(b)) => {
                Arc::as_ptr(a) as *const () == Arc::as_ptr(b) as *const ()
            }
            (RuleObject::Condition(a), RuleObject::Condition(b)) => {
                Arc::as_ptr(a) as *const () == Arc::as_ptr(b) as *const ()
            }
            _ => false,
        }
    }
}

impl fmt::Debug for RuleObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RuleObject")
            .field("capability", &self.capability())
            .field("name", &self.name())
            .finish()
    }
}
