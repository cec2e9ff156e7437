//! Core domain model for itsync: tracker issues, store rows and the record shape written back.

use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "itsync-core";

/// Lifecycle state reported by the tracker for an issue or pull request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IssueState {
    Open,
    Closed,
    Merged,
}

impl IssueState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Closed => "closed",
            Self::Merged => "merged",
        }
    }
}

impl fmt::Display for IssueState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Milestone {
    pub title: String,
    pub state: Option<String>,
    pub due_on: Option<DateTime<Utc>>,
}

/// Placement of an issue card on a named project board.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectPlacement {
    pub project: String,
    pub column: Option<String>,
}

/// One issue or pull request as fetched from the tracker. Never mutated within a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawIssue {
    pub number: u64,
    pub title: String,
    pub body: Option<String>,
    pub state: IssueState,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub url: String,
    pub milestone: Option<Milestone>,
    pub assignees: Vec<String>,
    pub labels: Vec<String>,
    pub project_placements: Vec<ProjectPlacement>,
}

/// Opaque store-assigned row handle. Only ever obtained from the store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RowId(String);

impl RowId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A store row projected down to its external key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreRow {
    pub id: RowId,
    pub number: Option<u64>,
}

/// Issue number -> row id, built once per run from the store's contents.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeyIndex {
    rows: HashMap<u64, RowId>,
}

impl KeyIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a mapping, returning the row id it displaced (last write wins).
    pub fn insert(&mut self, number: u64, id: RowId) -> Option<RowId> {
        self.rows.insert(number, id)
    }

    pub fn get(&self, number: u64) -> Option<&RowId> {
        self.rows.get(&number)
    }

    pub fn contains(&self, number: u64) -> bool {
        self.rows.contains_key(&number)
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

impl FromIterator<(u64, RowId)> for KeyIndex {
    fn from_iter<I: IntoIterator<Item = (u64, RowId)>>(iter: I) -> Self {
        Self {
            rows: iter.into_iter().collect(),
        }
    }
}

/// Field mapping written to the store for one issue, keyed by the store's column names.
///
/// Absent values are omitted on the wire; a full-row replace therefore clears them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct IssueRecord {
    pub number: u64,
    pub title: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub link: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    pub state: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub milestone: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub milestone_state: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub milestone_due_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub assignees: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub engineer: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub product_state: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub engineering_state: Option<String>,
    #[serde(default)]
    pub labels: Vec<String>,
    #[serde(default)]
    pub customers: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub theme: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initiative: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bug_severity: Option<String>,
}
