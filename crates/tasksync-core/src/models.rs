//! Data models for tasksync
//!
//! Defines the task record, its sync state machine, and the wire shapes
//! exchanged with the remote store.
//!
//! A task carries its sync state inline. On disk the state is flattened into
//! the `pending`, `action`, `attempts` and `error` keys so a snapshot is plain
//! structured data; in memory it is the explicit [`SyncState`] variant.

use std::fmt;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Opaque task identifier
///
/// Generated on the client at creation time. The remote store may hand back
/// a different canonical id when it confirms the record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(String);

impl TaskId {
    /// Generate a fresh client-side id
    pub fn generate() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }

    /// Get the id as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for TaskId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for TaskId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Remote operation a pending task still needs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncAction {
    Insert,
    Update,
}

/// Sync state of a single task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(from = "SyncMeta", into = "SyncMeta")]
pub enum SyncState {
    /// Matches the remote store
    #[default]
    Confirmed,
    /// Applied locally, remote delivery outstanding
    Pending { action: SyncAction, attempts: u32 },
    /// Delivery attempts exhausted for this session
    Failed { action: SyncAction, attempts: u32 },
}

impl SyncState {
    /// State of a task created locally and not yet sent
    pub fn new_insert() -> Self {
        SyncState::Pending {
            action: SyncAction::Insert,
            attempts: 0,
        }
    }

    /// Whether the task holds local state the remote has not confirmed
    ///
    /// Failed tasks count: their data is still only local.
    pub fn is_unconfirmed(&self) -> bool {
        !matches!(self, SyncState::Confirmed)
    }

    /// Whether the task is queued for (re)delivery
    pub fn is_pending(&self) -> bool {
        matches!(self, SyncState::Pending { .. })
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, SyncState::Failed { .. })
    }

    pub fn action(&self) -> Option<SyncAction> {
        match self {
            SyncState::Confirmed => None,
            SyncState::Pending { action, .. } | SyncState::Failed { action, .. } => Some(*action),
        }
    }

    pub fn attempts(&self) -> u32 {
        match self {
            SyncState::Confirmed => 0,
            SyncState::Pending { attempts, .. } | SyncState::Failed { attempts, .. } => *attempts,
        }
    }

    /// Transition for a new local mutation of an existing task
    ///
    /// - confirmed tasks start a fresh update
    /// - pending tasks keep their action and attempt count
    /// - failed tasks are re-armed with a fresh attempt budget
    pub fn after_local_edit(self) -> Self {
        match self {
            SyncState::Confirmed => SyncState::Pending {
                action: SyncAction::Update,
                attempts: 0,
            },
            pending @ SyncState::Pending { .. } => pending,
            SyncState::Failed { action, .. } => SyncState::Pending {
                action,
                attempts: 0,
            },
        }
    }

    /// Transition after a failed delivery attempt
    pub fn after_failure(self, max_retries: u32) -> Self {
        match self {
            SyncState::Pending { action, attempts } => {
                let attempts = attempts + 1;
                if attempts >= max_retries {
                    SyncState::Failed { action, attempts }
                } else {
                    SyncState::Pending { action, attempts }
                }
            }
            other => other,
        }
    }

    /// Re-arm a failed task at the start of a new session
    pub fn rearmed(self) -> Self {
        match self {
            SyncState::Failed { action, .. } => SyncState::Pending {
                action,
                attempts: 0,
            },
            other => other,
        }
    }
}

/// Flat on-disk representation of [`SyncState`]
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct SyncMeta {
    #[serde(default)]
    pending: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    action: Option<SyncAction>,
    #[serde(default)]
    attempts: u32,
    #[serde(default)]
    error: bool,
}

impl From<SyncMeta> for SyncState {
    fn from(meta: SyncMeta) -> Self {
        // A pending flag without an action cannot be delivered; treat as an update
        let action = meta.action.unwrap_or(SyncAction::Update);
        match (meta.pending || meta.error, meta.error) {
            (false, _) => SyncState::Confirmed,
            (true, true) => SyncState::Failed {
                action,
                attempts: meta.attempts,
            },
            (true, false) => SyncState::Pending {
                action,
                attempts: meta.attempts,
            },
        }
    }
}

impl From<SyncState> for SyncMeta {
    fn from(state: SyncState) -> Self {
        match state {
            SyncState::Confirmed => SyncMeta::default(),
            SyncState::Pending { action, attempts } => SyncMeta {
                pending: true,
                action: Some(action),
                attempts,
                error: false,
            },
            SyncState::Failed { action, attempts } => SyncMeta {
                pending: true,
                action: Some(action),
                attempts,
                error: true,
            },
        }
    }
}

/// A task record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub text: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub done: bool,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub due_date: Option<NaiveDate>,
    /// Assigned by the remote store on first successful creation
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(flatten)]
    pub sync: SyncState,
}

impl Task {
    /// Build an optimistic task from validated input
    pub fn from_new(new: NewTask) -> Self {
        Self {
            id: TaskId::generate(),
            text: new.text.trim().to_string(),
            description: new
                .description
                .map(|d| d.trim().to_string())
                .filter(|d| !d.is_empty()),
            done: false,
            tags: normalize_tags(new.tags),
            due_date: new.due_date,
            created_at: None,
            sync: SyncState::new_insert(),
        }
    }

    /// Strip sync metadata for sending to the remote store
    pub fn to_row(&self) -> TaskRow {
        TaskRow {
            id: self.id.clone(),
            text: self.text.clone(),
            description: self.description.clone(),
            done: self.done,
            tags: self.tags.clone(),
            due_date: self.due_date,
            created_at: self.created_at,
        }
    }

    /// Mutable fields, for remote updates
    pub fn fields(&self) -> TaskFields {
        TaskFields {
            text: self.text.clone(),
            description: self.description.clone(),
            done: self.done,
            tags: self.tags.clone(),
            due_date: self.due_date,
        }
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.iter().any(|t| t == tag)
    }

    /// Case-insensitive substring match against text and description
    ///
    /// `needle` must already be lowercase.
    pub fn matches_query(&self, needle: &str) -> bool {
        self.text.to_lowercase().contains(needle)
            || self
                .description
                .as_deref()
                .is_some_and(|d| d.to_lowercase().contains(needle))
    }
}

/// User input for a new task
#[derive(Debug, Clone, Default)]
pub struct NewTask {
    pub text: String,
    pub description: Option<String>,
    pub tags: Vec<String>,
    pub due_date: Option<NaiveDate>,
}

impl NewTask {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Self::default()
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Set tags from raw comma-separated input
    pub fn with_tag_input(mut self, input: &str) -> Self {
        self.tags = parse_tags(input);
        self
    }

    pub fn with_tags(mut self, tags: Vec<String>) -> Self {
        self.tags = tags;
        self
    }

    pub fn with_due_date(mut self, due: NaiveDate) -> Self {
        self.due_date = Some(due);
        self
    }

    /// Whether the text is non-empty after trimming
    pub fn is_valid(&self) -> bool {
        !self.text.trim().is_empty()
    }
}

/// Task as stored by the remote, without sync metadata
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRow {
    pub id: TaskId,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub done: bool,
    #[serde(default, deserialize_with = "nullable_tags")]
    pub tags: Vec<String>,
    #[serde(default)]
    pub due_date: Option<NaiveDate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
}

impl TaskRow {
    /// Adopt a remote row as a confirmed task
    pub fn into_task(self) -> Task {
        Task {
            id: self.id,
            text: self.text,
            description: self.description,
            done: self.done,
            tags: self.tags,
            due_date: self.due_date,
            created_at: self.created_at,
            sync: SyncState::Confirmed,
        }
    }
}

/// Mutable fields sent with a remote update
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskFields {
    pub text: String,
    pub description: Option<String>,
    pub done: bool,
    pub tags: Vec<String>,
    pub due_date: Option<NaiveDate>,
}

/// Remote stores commonly return `null` for an empty array column
fn nullable_tags<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Ok(Option::<Vec<String>>::deserialize(deserializer)?.unwrap_or_default())
}

/// Parse comma-separated tag input
///
/// Each piece is trimmed, a leading `#` is stripped, the result is
/// lowercased and empties are dropped. Order is preserved and repeats are
/// removed.
pub fn parse_tags(input: &str) -> Vec<String> {
    normalize_tags(input.split(',').map(str::to_string))
}

fn normalize_tags(tags: impl IntoIterator<Item = String>) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for raw in tags {
        let tag = raw.trim();
        let tag = tag.strip_prefix('#').unwrap_or(tag).trim().to_lowercase();
        if !tag.is_empty() && !out.contains(&tag) {
            out.push(tag);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_tags() {
        assert_eq!(
            parse_tags("Work, #Urgent , ,home"),
            vec!["work", "urgent", "home"]
        );
        assert!(parse_tags("").is_empty());
        assert!(parse_tags(" , #, ").is_empty());
        assert_eq!(parse_tags("a, A, #a"), vec!["a"]);
    }

    #[test]
    fn test_new_task_validation() {
        assert!(!NewTask::new("").is_valid());
        assert!(!NewTask::new("   \t").is_valid());
        assert!(NewTask::new(" Buy milk ").is_valid());
    }

    #[test]
    fn test_from_new_is_pending_insert() {
        let task = Task::from_new(
            NewTask::new("  Buy milk ")
                .with_description("  ")
                .with_tags(vec!["#Shop".to_string()]),
        );
        assert_eq!(task.text, "Buy milk");
        assert!(task.description.is_none());
        assert_eq!(task.tags, vec!["shop"]);
        assert!(!task.done);
        assert!(task.created_at.is_none());
        assert_eq!(
            task.sync,
            SyncState::Pending {
                action: SyncAction::Insert,
                attempts: 0
            }
        );
    }

    #[test]
    fn test_generated_ids_are_unique() {
        let a = TaskId::generate();
        let b = TaskId::generate();
        assert_ne!(a, b);
    }

    #[test]
    fn test_local_edit_transitions() {
        assert_eq!(
            SyncState::Confirmed.after_local_edit(),
            SyncState::Pending {
                action: SyncAction::Update,
                attempts: 0
            }
        );

        // An unconfirmed insert stays an insert and keeps its attempts
        let pending = SyncState::Pending {
            action: SyncAction::Insert,
            attempts: 2,
        };
        assert_eq!(pending.after_local_edit(), pending);

        let failed = SyncState::Failed {
            action: SyncAction::Insert,
            attempts: 3,
        };
        assert_eq!(
            failed.after_local_edit(),
            SyncState::Pending {
                action: SyncAction::Insert,
                attempts: 0
            }
        );
    }

    #[test]
    fn test_failure_transitions() {
        let mut state = SyncState::new_insert();
        state = state.after_failure(3);
        assert_eq!(state.attempts(), 1);
        assert!(state.is_pending());
        state = state.after_failure(3);
        state = state.after_failure(3);
        assert!(state.is_failed());
        assert_eq!(state.attempts(), 3);

        // Failed and confirmed states are not affected
        assert_eq!(state.after_failure(3), state);
        assert_eq!(SyncState::Confirmed.after_failure(3), SyncState::Confirmed);
    }

    #[test]
    fn test_task_serialization_shape() {
        let task = Task::from_new(NewTask::new("Write report").with_tag_input("work"));
        let value = serde_json::to_value(&task).unwrap();
        let obj = value.as_object().unwrap();
        for key in [
            "id",
            "text",
            "description",
            "done",
            "tags",
            "due_date",
            "created_at",
            "pending",
            "action",
            "attempts",
            "error",
        ] {
            assert!(obj.contains_key(key), "missing key {}", key);
        }
        assert_eq!(obj["pending"], true);
        assert_eq!(obj["action"], "insert");
        assert_eq!(obj["error"], false);
    }

    #[test]
    fn test_task_deserialize_confirmed_without_sync_keys() {
        let json = r#"{
            "id": "abc",
            "text": "Remote task",
            "done": true,
            "tags": ["home"],
            "created_at": "2024-05-01T10:00:00Z"
        }"#;
        let task: Task = serde_json::from_str(json).unwrap();
        assert_eq!(task.sync, SyncState::Confirmed);
        assert!(task.done);
        assert!(task.created_at.is_some());
    }

    #[test]
    fn test_task_serialization_preserves_failed_state() {
        let mut task = Task::from_new(NewTask::new("x"));
        task.sync = SyncState::Failed {
            action: SyncAction::Update,
            attempts: 3,
        };
        task.due_date = NaiveDate::from_ymd_opt(2024, 12, 24);
        let json = serde_json::to_string(&task).unwrap();
        let back: Task = serde_json::from_str(&json).unwrap();
        assert_eq!(back, task);
    }

    #[test]
    fn test_row_accepts_null_tags() {
        let row: TaskRow =
            serde_json::from_str(r#"{"id":"r1","text":"t","tags":null,"done":false}"#).unwrap();
        assert!(row.tags.is_empty());
        assert_eq!(row.into_task().sync, SyncState::Confirmed);
    }

    #[test]
    fn test_matches_query() {
        let task = Task::from_new(NewTask::new("Buy Milk").with_description("From the Corner shop"));
        assert!(task.matches_query("milk"));
        assert!(task.matches_query("corner"));
        assert!(!task.matches_query("bread"));
    }
}
