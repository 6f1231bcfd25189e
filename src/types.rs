//! Memory records, field categories and store scopes

use crate::error::{MemoryError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Store-assigned record identifier (scratch and archive are separate namespaces)
pub type RecordId = i64;

/// `parent_id` value marking a root record
pub const ROOT_PARENT: RecordId = -1;

/// One reasoning step in a scratch or archive tree
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MemoryRecord {
    /// Identifier within its store
    pub id: RecordId,
    /// Record this step was reached from, `ROOT_PARENT` for a root
    pub parent_id: RecordId,
    /// Depth in the tree (root = 1)
    pub level: i64,
    /// Situation before the step
    pub status: String,
    /// Objective pursued
    pub goal: String,
    /// Action taken
    pub action: String,
    /// Outcome or critique of the action
    pub feedback: String,
    /// When the step was first recorded
    pub created_at: DateTime<Utc>,
    /// Outcome of the step
    pub final_status: FinalStatus,
    /// Consolidation sweep this record belongs to (archive only)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tree_num: Option<i64>,
    /// Scratch id this record was migrated from (archive only)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_id: Option<RecordId>,
}

impl MemoryRecord {
    pub fn is_root(&self) -> bool {
        self.parent_id == ROOT_PARENT
    }

    /// Text of one field
    pub fn field(&self, category: FieldCategory) -> &str {
        match category {
            FieldCategory::Status => &self.status,
            FieldCategory::Goal => &self.goal,
            FieldCategory::Action => &self.action,
            FieldCategory::Feedback => &self.feedback,
        }
    }
}

/// Input for saving a new step
#[derive(Debug, Clone, PartialEq)]
pub struct NewRecord {
    pub parent_id: RecordId,
    pub level: i64,
    pub status: String,
    pub goal: String,
    pub action: String,
    pub feedback: String,
    pub final_status: FinalStatus,
}

impl NewRecord {
    pub fn new(parent_id: RecordId, level: i64, status: impl Into<String>) -> Self {
        Self {
            parent_id,
            level,
            status: status.into(),
            goal: String::new(),
            action: String::new(),
            feedback: String::new(),
            final_status: FinalStatus::Pending,
        }
    }

    /// First step of a new episode
    pub fn root(status: impl Into<String>) -> Self {
        Self::new(ROOT_PARENT, 1, status)
    }

    /// Step reached from `parent`
    pub fn child_of(parent: &MemoryRecord, status: impl Into<String>) -> Self {
        Self::new(parent.id, parent.level + 1, status)
    }

    pub fn with_goal(mut self, goal: impl Into<String>) -> Self {
        self.goal = goal.into();
        self
    }

    pub fn with_action(mut self, action: impl Into<String>) -> Self {
        self.action = action.into();
        self
    }

    pub fn with_feedback(mut self, feedback: impl Into<String>) -> Self {
        self.feedback = feedback.into();
        self
    }

    pub fn with_final_status(mut self, final_status: FinalStatus) -> Self {
        self.final_status = final_status;
        self
    }

    pub fn field(&self, category: FieldCategory) -> &str {
        match category {
            FieldCategory::Status => &self.status,
            FieldCategory::Goal => &self.goal,
            FieldCategory::Action => &self.action,
            FieldCategory::Feedback => &self.feedback,
        }
    }

    /// Root/level consistency that can be checked without the store
    pub fn validate_shape(&self) -> Result<()> {
        if self.level < 1 {
            return Err(MemoryError::Validation(format!(
                "level must be >= 1, got {}",
                self.level
            )));
        }
        if self.parent_id == ROOT_PARENT && self.level != 1 {
            return Err(MemoryError::Validation(format!(
                "root record must have level 1, got {}",
                self.level
            )));
        }
        if self.parent_id != ROOT_PARENT && self.level == 1 {
            return Err(MemoryError::Validation(format!(
                "record with parent {} cannot have level 1",
                self.parent_id
            )));
        }
        Ok(())
    }
}

/// Outcome of a step. `Success`/`Fail` are terminal.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum FinalStatus {
    #[default]
    Pending,
    Success,
    Fail,
}

impl FinalStatus {
    /// Group order used when consolidating leaves
    pub const CONSOLIDATION_ORDER: [FinalStatus; 3] =
        [FinalStatus::Success, FinalStatus::Fail, FinalStatus::Pending];

    pub fn is_terminal(&self) -> bool {
        !matches!(self, FinalStatus::Pending)
    }

    /// Position in `CONSOLIDATION_ORDER`
    pub fn consolidation_rank(&self) -> usize {
        match self {
            FinalStatus::Success => 0,
            FinalStatus::Fail => 1,
            FinalStatus::Pending => 2,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FinalStatus::Pending => "pending",
            FinalStatus::Success => "success",
            FinalStatus::Fail => "fail",
        }
    }
}

impl std::fmt::Display for FinalStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FinalStatus {
    type Err = MemoryError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" | "uncompleted" => Ok(FinalStatus::Pending),
            "success" => Ok(FinalStatus::Success),
            "fail" => Ok(FinalStatus::Fail),
            other => Err(MemoryError::InvalidStatus(other.to_string())),
        }
    }
}

/// Which text field a vector was computed from
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum FieldCategory {
    Status,
    Goal,
    Action,
    Feedback,
}

impl FieldCategory {
    pub const ALL: [FieldCategory; 4] = [
        FieldCategory::Status,
        FieldCategory::Goal,
        FieldCategory::Action,
        FieldCategory::Feedback,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            FieldCategory::Status => "status",
            FieldCategory::Goal => "goal",
            FieldCategory::Action => "action",
            FieldCategory::Feedback => "feedback",
        }
    }
}

impl std::fmt::Display for FieldCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FieldCategory {
    type Err = MemoryError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "status" => Ok(FieldCategory::Status),
            "goal" => Ok(FieldCategory::Goal),
            "action" => Ok(FieldCategory::Action),
            "feedback" => Ok(FieldCategory::Feedback),
            other => Err(MemoryError::Serialization(format!(
                "unknown field category '{other}'"
            ))),
        }
    }
}

/// Scratch (short-term) or archive (long-term) store
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum StoreScope {
    Scratch,
    Archive,
}

impl StoreScope {
    pub fn as_str(&self) -> &'static str {
        match self {
            StoreScope::Scratch => "scratch",
            StoreScope::Archive => "archive",
        }
    }

    /// Relational table backing this scope
    pub fn table(&self) -> &'static str {
        match self {
            StoreScope::Scratch => "short_term",
            StoreScope::Archive => "long_term",
        }
    }
}

impl std::fmt::Display for StoreScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Leaf of a scratch tree, as enumerated for consolidation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeafInfo {
    pub id: RecordId,
    pub level: i64,
    pub final_status: FinalStatus,
}

/// Nearest-neighbour hit. Higher score is closer.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VectorHit {
    pub record_id: RecordId,
    pub score: f32,
}

/// Archive placement of a migrated scratch record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MigratedRecord {
    pub source_id: RecordId,
    pub archive_id: RecordId,
    pub tree_num: i64,
}

/// Successful archived records from one consolidated tree matching a query
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchiveMatch {
    pub tree_num: i64,
    /// Closest status match in this tree (shallowest when several hit)
    pub status_hit: MemoryRecord,
    /// Goal matches in this tree
    pub goal_hits: Vec<MemoryRecord>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn final_status_round_trips_through_str() {
        for status in FinalStatus::CONSOLIDATION_ORDER {
            assert_eq!(status.as_str().parse::<FinalStatus>().unwrap(), status);
        }
        assert_eq!("uncompleted".parse::<FinalStatus>().unwrap(), FinalStatus::Pending);
        assert!(matches!(
            "done".parse::<FinalStatus>(),
            Err(MemoryError::InvalidStatus(_))
        ));
    }

    #[test]
    fn consolidation_rank_follows_order() {
        for (rank, status) in FinalStatus::CONSOLIDATION_ORDER.iter().enumerate() {
            assert_eq!(status.consolidation_rank(), rank);
        }
        assert!(FinalStatus::Success.is_terminal());
        assert!(FinalStatus::Fail.is_terminal());
        assert!(!FinalStatus::Pending.is_terminal());
    }

    #[test]
    fn new_record_shape_validation() {
        assert!(NewRecord::root("start").validate_shape().is_ok());
        assert!(NewRecord::new(ROOT_PARENT, 2, "bad").validate_shape().is_err());
        assert!(NewRecord::new(4, 1, "bad").validate_shape().is_err());
        assert!(NewRecord::new(4, 0, "bad").validate_shape().is_err());
        assert!(NewRecord::new(4, 3, "ok").validate_shape().is_ok());
    }

    #[test]
    fn scope_tables() {
        assert_eq!(StoreScope::Scratch.table(), "short_term");
        assert_eq!(StoreScope::Archive.table(), "long_term");
    }
}
