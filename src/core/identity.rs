//! Layer 1: Identity atoms
//!
//! SessionId: top-level logical session
//! TxnUuid: disambiguates child sessions of one parent transaction number
//! TxnNumber / StmtId: transaction and statement sequencing
//! SessionIdentity: parent or child session as seen by the protocol

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::error::{CoreError, InvalidId};

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident, $variant:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(Uuid);

        impl $name {
            pub fn new(uuid: Uuid) -> Self {
                Self(uuid)
            }

            pub fn generate() -> Self {
                Self(Uuid::new_v4())
            }

            pub fn as_uuid(&self) -> Uuid {
                self.0
            }

            pub fn parse_str(raw: &str) -> Result<Self, CoreError> {
                Uuid::parse_str(raw).map(Self).map_err(|err| {
                    InvalidId::$variant {
                        raw: raw.to_string(),
                        reason: err.to_string(),
                    }
                    .into()
                })
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!(stringify!($name), "({})"), self.0)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

uuid_id!(
    /// Top-level logical session id, created by a client.
    SessionId,
    Session
);

uuid_id!(
    /// Child transaction UUID. Every retry of an internal transaction gets a fresh one.
    TxnUuid,
    TxnUuid
);

/// Transaction number within a session.
///
/// Never negative. Stored as `INTEGER` so the upper bound is `i64::MAX`.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TxnNumber(u64);

impl TxnNumber {
    pub const MAX: u64 = i64::MAX as u64;

    pub fn new(value: u64) -> Result<Self, CoreError> {
        if value > Self::MAX {
            return Err(InvalidId::TxnNumber {
                raw: value.to_string(),
                reason: "exceeds i64::MAX".into(),
            }
            .into());
        }
        Ok(Self(value))
    }

    pub fn get(self) -> u64 {
        self.0
    }

    pub fn next(self) -> Option<Self> {
        self.0.checked_add(1).and_then(|v| Self::new(v).ok())
    }
}

impl fmt::Debug for TxnNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TxnNumber({})", self.0)
    }
}

impl fmt::Display for TxnNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Statement id within a transaction or retryable write.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StmtId(u32);

impl StmtId {
    pub fn new(value: u32) -> Self {
        Self(value)
    }

    pub fn get(self) -> u32 {
        self.0
    }
}

impl fmt::Debug for StmtId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "StmtId({})", self.0)
    }
}

impl fmt::Display for StmtId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Link from a child session back to its parent.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ChildLink {
    /// Parent transaction number the child executes a statement for.
    /// `None` for internal transactions backing non-retryable writes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_txn_number: Option<TxnNumber>,
    pub txn_uuid: TxnUuid,
}

/// Identity of a logical session: the top-level session or one of its children.
///
/// Two identities denote the same logical child session iff all fields are equal.
/// Children of one session are independent for replay of their own records
/// but share the session's transaction-number ordering (see `ledger`).
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SessionIdentity {
    pub session_id: SessionId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub child: Option<ChildLink>,
}

impl SessionIdentity {
    pub fn parent(session_id: SessionId) -> Self {
        Self {
            session_id,
            child: None,
        }
    }

    /// Child spawned to run one statement of retryable write / transaction `parent_txn_number`.
    pub fn retryable_child(
        session_id: SessionId,
        parent_txn_number: TxnNumber,
        txn_uuid: TxnUuid,
    ) -> Self {
        Self {
            session_id,
            child: Some(ChildLink {
                parent_txn_number: Some(parent_txn_number),
                txn_uuid,
            }),
        }
    }

    /// Child backing a non-retryable write. Never participates in the ledger.
    pub fn non_retryable_child(session_id: SessionId, txn_uuid: TxnUuid) -> Self {
        Self {
            session_id,
            child: Some(ChildLink {
                parent_txn_number: None,
                txn_uuid,
            }),
        }
    }

    /// Build from loose request fields.
    pub fn from_parts(
        session_id: SessionId,
        parent_txn_number: Option<TxnNumber>,
        txn_uuid: Option<TxnUuid>,
    ) -> Result<Self, CoreError> {
        match (parent_txn_number, txn_uuid) {
            (None, None) => Ok(Self::parent(session_id)),
            (Some(parent), Some(uuid)) => Ok(Self::retryable_child(session_id, parent, uuid)),
            (None, Some(uuid)) => Ok(Self::non_retryable_child(session_id, uuid)),
            (Some(parent), None) => Err(InvalidId::SessionIdentity {
                raw: format!("{session_id}/{parent}"),
                reason: "parent txn number requires a child txn uuid".into(),
            }
            .into()),
        }
    }

    pub fn is_child(&self) -> bool {
        self.child.is_some()
    }

    pub fn parent_txn_number(&self) -> Option<TxnNumber> {
        self.child.and_then(|child| child.parent_txn_number)
    }

    pub fn txn_uuid(&self) -> Option<TxnUuid> {
        self.child.map(|child| child.txn_uuid)
    }

    /// Transaction number this identity contributes to the session ordering,
    /// given the number carried by the request itself.
    ///
    /// Parent: its own number. Retryable child: the parent number.
    /// Non-retryable child: none.
    pub fn effective_txn_number(&self, own: Option<TxnNumber>) -> Option<TxnNumber> {
        match self.child {
            None => own,
            Some(link) => link.parent_txn_number,
        }
    }

    /// Canonical storage key.
    pub fn key(&self) -> String {
        self.to_string()
    }

    pub fn parse_key(raw: &str) -> Result<Self, CoreError> {
        let invalid = |reason: &str| -> CoreError {
            InvalidId::SessionIdentity {
                raw: raw.to_string(),
                reason: reason.to_string(),
            }
            .into()
        };
        let parts: Vec<&str> = raw.split('/').collect();
        match parts.as_slice() {
            [session] => Ok(Self::parent(SessionId::parse_str(session)?)),
            [session, uuid] => Ok(Self::non_retryable_child(
                SessionId::parse_str(session)?,
                TxnUuid::parse_str(uuid)?,
            )),
            [session, txn, uuid] => {
                let txn = txn
                    .parse::<u64>()
                    .map_err(|_| invalid("parent txn number is not an integer"))?;
                Ok(Self::retryable_child(
                    SessionId::parse_str(session)?,
                    TxnNumber::new(txn)?,
                    TxnUuid::parse_str(uuid)?,
                ))
            }
            _ => Err(invalid("expected 1 to 3 '/'-separated segments")),
        }
    }
}

impl FromStr for SessionIdentity {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse_key(s)
    }
}

impl fmt::Debug for SessionIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SessionIdentity({self})")
    }
}

impl fmt::Display for SessionIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.child {
            None => write!(f, "{}", self.session_id),
            Some(ChildLink {
                parent_txn_number: None,
                txn_uuid,
            }) => write!(f, "{}/{}", self.session_id, txn_uuid),
            Some(ChildLink {
                parent_txn_number: Some(parent),
                txn_uuid,
            }) => write!(f, "{}/{}/{}", self.session_id, parent, txn_uuid),
        }
    }
}

/// One transaction (or retryable write) of one session identity.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TxnId {
    pub identity: SessionIdentity,
    pub txn_number: TxnNumber,
}

impl TxnId {
    pub fn new(identity: SessionIdentity, txn_number: TxnNumber) -> Self {
        Self {
            identity,
            txn_number,
        }
    }
}

impl fmt::Debug for TxnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TxnId({self})")
    }
}

impl fmt::Display for TxnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.identity, self.txn_number)
    }
}
