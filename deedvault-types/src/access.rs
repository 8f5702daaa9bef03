//! Data classes, permissions, relation states and access actions.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Error returned when a stored enum tag does not name a known variant.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown {kind} tag: {value}")]
pub struct ParseEnumError {
    pub kind: &'static str,
    pub value: String,
}

/// Classification of the sensitive field an encrypted item holds.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataClass {
    DeedItemName,
    DeedItemDescription,
    EntryNote,
    ReflectionMessage,
    TargetNote,
}

impl DataClass {
    pub const ALL: [DataClass; 5] = [
        DataClass::DeedItemName,
        DataClass::DeedItemDescription,
        DataClass::EntryNote,
        DataClass::ReflectionMessage,
        DataClass::TargetNote,
    ];

    /// Stable tag used in persisted rows.
    pub fn as_str(&self) -> &'static str {
        match self {
            DataClass::DeedItemName => "deed_item_name",
            DataClass::DeedItemDescription => "deed_item_description",
            DataClass::EntryNote => "entry_note",
            DataClass::ReflectionMessage => "reflection_message",
            DataClass::TargetNote => "target_note",
        }
    }
}

impl fmt::Display for DataClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DataClass {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        DataClass::ALL
            .into_iter()
            .find(|c| c.as_str() == s)
            .ok_or_else(|| ParseEnumError {
                kind: "data class",
                value: s.to_string(),
            })
    }
}

/// Permission carried by an active grant. `Write` implies `Read`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Permission {
    Read,
    Write,
}

impl Permission {
    /// Whether a grant with this permission is enough for `action`.
    ///
    /// `Share` is never satisfied by a permission alone; it needs ownership
    /// or an explicit re-share right.
    pub fn permits(&self, action: AccessAction) -> bool {
        match action {
            AccessAction::Read => true,
            AccessAction::Write => *self == Permission::Write,
            AccessAction::Share => false,
        }
    }
}

/// Status of a relation between two users, owned by the external social graph.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RelationStatus {
    Pending,
    Accepted,
    Rejected,
    Blocked,
}

/// Action a caller wants to perform on an item.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccessAction {
    Read,
    Write,
    Share,
}

impl AccessAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccessAction::Read => "read",
            AccessAction::Write => "write",
            AccessAction::Share => "share",
        }
    }
}

impl fmt::Display for AccessAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
