//! Write operations handed to the execution engine.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::error::{CoreError, InvalidId, InvalidOperation};

/// Collection namespace, `<db>.<collection>`.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Namespace(String);

impl Namespace {
    pub fn parse(raw: impl Into<String>) -> Result<Self, CoreError> {
        let raw = raw.into();
        let Some((db, coll)) = raw.split_once('.') else {
            return Err(InvalidId::Namespace {
                raw,
                reason: "expected <db>.<collection>".into(),
            }
            .into());
        };
        if db.is_empty() || coll.is_empty() {
            return Err(InvalidId::Namespace {
                raw,
                reason: "empty database or collection name".into(),
            }
            .into());
        }
        if raw.contains('\0') || db.contains(' ') {
            return Err(InvalidId::Namespace {
                raw,
                reason: "illegal character".into(),
            }
            .into());
        }
        Ok(Self(raw))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for Namespace {
    type Error = CoreError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(value)
    }
}

impl From<Namespace> for String {
    fn from(value: Namespace) -> Self {
        value.0
    }
}

impl fmt::Debug for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Namespace({:?})", self.0)
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A single write statement.
///
/// `filter` is an equality match on top-level fields. `update` is either a
/// replacement document or an operator document (`$set`, `$inc`, `$unset`).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum WriteOp {
    Insert {
        ns: Namespace,
        document: Value,
    },
    Update {
        ns: Namespace,
        filter: Value,
        update: Value,
        #[serde(default)]
        upsert: bool,
        #[serde(default)]
        multi: bool,
    },
    Delete {
        ns: Namespace,
        filter: Value,
        #[serde(default)]
        multi: bool,
    },
}

impl WriteOp {
    pub fn ns(&self) -> &Namespace {
        match self {
            WriteOp::Insert { ns, .. } | WriteOp::Update { ns, .. } | WriteOp::Delete { ns, .. } => {
                ns
            }
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            WriteOp::Insert { .. } => "insert",
            WriteOp::Update { .. } => "update",
            WriteOp::Delete { .. } => "delete",
        }
    }

    /// Shape checks that do not need document state.
    pub fn validate(&self) -> Result<(), CoreError> {
        match self {
            WriteOp::Insert { document, .. } => {
                if !document.is_object() {
                    return Err(invalid("insert document must be an object"));
                }
            }
            WriteOp::Update { filter, update, .. } => {
                if !filter.is_object() {
                    return Err(invalid("update filter must be an object"));
                }
                let Some(update) = update.as_object() else {
                    return Err(invalid("update must be an object"));
                };
                let operators = update.keys().filter(|k| k.starts_with('$')).count();
                if operators != 0 && operators != update.len() {
                    return Err(invalid("update mixes operators and replacement fields"));
                }
            }
            WriteOp::Delete { filter, .. } => {
                if !filter.is_object() {
                    return Err(invalid("delete filter must be an object"));
                }
            }
        }
        Ok(())
    }
}

fn invalid(reason: &str) -> CoreError {
    InvalidOperation {
        reason: reason.to_string(),
    }
    .into()
}
