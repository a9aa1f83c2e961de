//! Notes, feedback records and their repositories
//!
//! Persistence of notes and feedback belongs to the surrounding application;
//! the engine only talks to it through [`NoteRepository`] and
//! [`FeedbackRepository`]. In-memory implementations back the CLI and tests.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

use crate::model::ModelKind;
use crate::policy::{PolicyAction, StateSnapshot};
use crate::{NoteId, Result, UserId};

/// Accept/reject signal on a note
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedbackLabel {
    Like,
    Dislike,
}

impl FeedbackLabel {
    pub fn from_like(like: bool) -> Self {
        if like {
            Self::Like
        } else {
            Self::Dislike
        }
    }

    /// Reward pushed into replay memory
    pub fn reward(self) -> f32 {
        match self {
            Self::Like => 1.0,
            Self::Dislike => -1.0,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Like => "like",
            Self::Dislike => "dislike",
        }
    }
}

/// One feedback event, kept until a training pass consumes it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedbackRecord {
    pub user_id: UserId,
    pub note_id: NoteId,
    /// Source content the note was written for
    pub prompt: String,
    /// Note text the user reacted to
    pub response: String,
    pub label: FeedbackLabel,
    pub timestamp: DateTime<Utc>,
}

/// Supervised example handed to the adapter trainer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingExample {
    pub input: String,
    pub output: String,
    pub label: FeedbackLabel,
}

impl TrainingExample {
    pub fn like<S1: Into<String>, S2: Into<String>>(input: S1, output: S2) -> Self {
        Self {
            input: input.into(),
            output: output.into(),
            label: FeedbackLabel::Like,
        }
    }

    pub fn dislike<S1: Into<String>, S2: Into<String>>(input: S1, output: S2) -> Self {
        Self {
            input: input.into(),
            output: output.into(),
            label: FeedbackLabel::Dislike,
        }
    }
}

impl From<&FeedbackRecord> for TrainingExample {
    fn from(record: &FeedbackRecord) -> Self {
        Self {
            input: record.prompt.clone(),
            output: record.response.clone(),
            label: record.label,
        }
    }
}

/// A note to be stored
#[derive(Debug, Clone)]
pub struct NewNote {
    /// `None` for initial notes produced before any user is involved
    pub user_id: Option<UserId>,
    pub content: String,
    pub text: String,
    pub model_kind: ModelKind,
    /// Policy decision that produced the note, if any
    pub action: Option<PolicyAction>,
    /// Context the decision was made in
    pub state: Option<StateSnapshot>,
}

/// A stored note
#[derive(Debug, Clone, Serialize)]
pub struct Note {
    pub id: NoteId,
    pub user_id: Option<UserId>,
    pub content: String,
    pub text: String,
    pub model_kind: ModelKind,
    pub action: Option<PolicyAction>,
    #[serde(skip)]
    pub state: Option<StateSnapshot>,
    pub created_at: DateTime<Utc>,
}

#[async_trait]
pub trait NoteRepository: Send + Sync {
    async fn insert(&self, note: NewNote) -> Result<NoteId>;

    async fn get(&self, id: NoteId) -> Result<Option<Note>>;
}

#[async_trait]
pub trait FeedbackRepository: Send + Sync {
    /// Append a record to the user's pending log
    async fn append(&self, record: FeedbackRecord) -> Result<()>;

    /// Pending records, oldest first
    async fn pending(&self, user_id: UserId) -> Result<Vec<FeedbackRecord>>;

    /// Drop the oldest `consumed` pending records; returns how many were removed
    async fn clear(&self, user_id: UserId, consumed: usize) -> Result<usize>;
}

/// Process-local note storage
#[derive(Debug)]
pub struct InMemoryNoteRepository {
    notes: DashMap<NoteId, Note>,
    next_id: AtomicU64,
}

impl InMemoryNoteRepository {
    pub fn new() -> Self {
        Self {
            notes: DashMap::new(),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn len(&self) -> usize {
        self.notes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.notes.is_empty()
    }
}

impl Default for InMemoryNoteRepository {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl NoteRepository for InMemoryNoteRepository {
    async fn insert(&self, note: NewNote) -> Result<NoteId> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.notes.insert(
            id,
            Note {
                id,
                user_id: note.user_id,
                content: note.content,
                text: note.text,
                model_kind: note.model_kind,
                action: note.action,
                state: note.state,
                created_at: Utc::now(),
            },
        );
        Ok(id)
    }

    async fn get(&self, id: NoteId) -> Result<Option<Note>> {
        Ok(self.notes.get(&id).map(|entry| entry.value().clone()))
    }
}

/// Process-local feedback log
#[derive(Debug, Default)]
pub struct InMemoryFeedbackRepository {
    records: DashMap<UserId, Vec<FeedbackRecord>>,
}

impl InMemoryFeedbackRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl FeedbackRepository for InMemoryFeedbackRepository {
    async fn append(&self, record: FeedbackRecord) -> Result<()> {
        self.records.entry(record.user_id).or_default().push(record);
        Ok(())
    }

    async fn pending(&self, user_id: UserId) -> Result<Vec<FeedbackRecord>> {
        Ok(self
            .records
            .get(&user_id)
            .map(|entry| entry.value().clone())
            .unwrap_or_default())
    }

    async fn clear(&self, user_id: UserId, consumed: usize) -> Result<usize> {
        let removed = match self.records.get_mut(&user_id) {
            Some(mut entry) => {
                let n = consumed.min(entry.len());
                entry.drain(..n);
                n
            }
            None => 0,
        };
        self.records.remove_if(&user_id, |_, records| records.is_empty());
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(user_id: UserId, note_id: NoteId, label: FeedbackLabel) -> FeedbackRecord {
        FeedbackRecord {
            user_id,
            note_id,
            prompt: "content".into(),
            response: format!("note {}", note_id),
            label,
            timestamp: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_note_ids_are_unique() {
        let repo = InMemoryNoteRepository::new();
        let note = NewNote {
            user_id: Some(7),
            content: "c".into(),
            text: "t".into(),
            model_kind: ModelKind::Base,
            action: None,
            state: None,
        };
        let a = repo.insert(note.clone()).await.unwrap();
        let b = repo.insert(note).await.unwrap();
        assert_ne!(a, b);
        assert_eq!(repo.get(a).await.unwrap().unwrap().user_id, Some(7));
        assert!(repo.get(999).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_clear_only_removes_consumed_records() {
        let repo = InMemoryFeedbackRepository::new();
        repo.append(record(7, 1, FeedbackLabel::Like)).await.unwrap();
        repo.append(record(7, 2, FeedbackLabel::Dislike)).await.unwrap();
        repo.append(record(8, 3, FeedbackLabel::Like)).await.unwrap();

        assert_eq!(repo.clear(7, 1).await.unwrap(), 1);
        let left = repo.pending(7).await.unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].note_id, 2);
        assert_eq!(repo.pending(8).await.unwrap().len(), 1);

        assert_eq!(repo.clear(7, 10).await.unwrap(), 1);
        assert!(repo.pending(7).await.unwrap().is_empty());
    }

    #[test]
    fn test_example_from_record() {
        let example = TrainingExample::from(&record(7, 1, FeedbackLabel::Like));
        assert_eq!(example.output, "note 1");
        assert_eq!(example.label, FeedbackLabel::Like);
        assert_eq!(FeedbackLabel::from_like(false).reward(), -1.0);
    }
}
