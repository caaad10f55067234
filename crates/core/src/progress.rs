//! Progress Store
//!
//! Durable learner-side state: students and their curriculum pointer, session
//! transcripts, one progress record per (student, subtopic), and notes. The
//! store exposes single-record operations plus [`ProgressStore::commit`], the
//! all-or-nothing write the engine issues at every phase transition.

use crate::curriculum::{CurriculumTree, SubtopicId};
use crate::error::Result;
use crate::session::{Session, SessionId, StudentId};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Understanding verdict recorded for a subtopic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Status {
    NotStarted,
    Red,
    Yellow,
    Green,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::NotStarted => "not_started",
            Status::Red => "red",
            Status::Yellow => "yellow",
            Status::Green => "green",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "not_started" => Some(Status::NotStarted),
            "red" => Some(Status::Red),
            "yellow" => Some(Status::Yellow),
            "green" => Some(Status::Green),
            _ => None,
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressRecord {
    pub student_id: StudentId,
    pub subtopic_id: SubtopicId,
    pub status: Status,
    /// Number of assessment verdicts recorded for this subtopic.
    pub attempts: u32,
    pub flagged: bool,
    pub updated_at: DateTime<Utc>,
    /// Set whenever a session on this subtopic reaches Completed.
    pub completed_at: Option<DateTime<Utc>>,
}

impl ProgressRecord {
    pub fn not_started(student_id: impl Into<StudentId>, subtopic_id: SubtopicId) -> Self {
        Self {
            student_id: student_id.into(),
            subtopic_id,
            status: Status::NotStarted,
            attempts: 0,
            flagged: false,
            updated_at: DateTime::<Utc>::UNIX_EPOCH,
            completed_at: None,
        }
    }

    /// Applies one assessment verdict to the record.
    pub fn apply(&mut self, update: &ProgressUpdate, now: DateTime<Utc>) {
        self.status = update.status;
        self.flagged = update.flagged;
        self.attempts += 1;
        self.updated_at = now;
        if update.completes {
            self.completed_at = Some(now);
        }
    }
}

/// Where a student is in the curriculum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "subtopicId")]
pub enum CurriculumPointer {
    NotStarted,
    At(SubtopicId),
    Complete,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Student {
    pub id: StudentId,
    pub preferred_language: String,
    pub pointer: CurriculumPointer,
    pub created_at: DateTime<Utc>,
}

impl Student {
    pub fn new(id: impl Into<StudentId>, language: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            id: id.into(),
            preferred_language: language.into(),
            pointer: CurriculumPointer::NotStarted,
            created_at: now,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Note {
    pub summary: String,
    pub key_points: Vec<String>,
    pub struggle_points: Vec<String>,
    pub generated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum NoteState {
    Pending,
    Ready { note: Note },
    GenerationFailed { attempts: u32, last_error: String },
}

/// The note slot for a (student, subtopic) pair. `session_id` names the
/// completion that owns the slot; results from older sessions are ignored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NoteEntry {
    pub student_id: StudentId,
    pub subtopic_id: SubtopicId,
    pub session_id: SessionId,
    #[serde(flatten)]
    pub state: NoteState,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgressUpdate {
    pub status: Status,
    pub flagged: bool,
    /// The session completes in the same transition.
    pub completes: bool,
}

/// Everything one phase transition writes.
#[derive(Debug, Clone)]
pub struct TransitionCommit {
    /// Full session state after the turn.
    pub session: Session,
    pub progress: Option<ProgressUpdate>,
    pub pointer: Option<CurriculumPointer>,
    /// Reset the note slot to Pending for this session.
    pub queue_note: bool,
}

/// Completion figures for one student against one curriculum snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressSummary {
    pub total_subtopics: usize,
    pub completed_subtopics: usize,
    pub completion_percentage: u32,
}

impl ProgressSummary {
    pub fn compute(records: &[ProgressRecord], tree: &CurriculumTree) -> Self {
        let total_subtopics = tree.active_subtopic_count();
        let completed_subtopics = records
            .iter()
            .filter(|r| r.completed_at.is_some() && tree.position(r.subtopic_id).is_some())
            .count()
            .min(total_subtopics);
        let completion_percentage = if total_subtopics == 0 {
            0
        } else {
            (completed_subtopics * 100 / total_subtopics) as u32
        };
        Self {
            total_subtopics,
            completed_subtopics,
            completion_percentage,
        }
    }
}

/// Orders records by curriculum position; records for subtopics no longer
/// in the tree go last, oldest first.
pub fn order_by_curriculum(records: &mut [ProgressRecord], tree: &CurriculumTree) {
    records.sort_by(|a, b| {
        let pa = tree.position(a.subtopic_id).unwrap_or(usize::MAX);
        let pb = tree.position(b.subtopic_id).unwrap_or(usize::MAX);
        pa.cmp(&pb).then(a.updated_at.cmp(&b.updated_at))
    });
}

/// Storage for everything the engine writes.
///
/// Writes to the same (student, subtopic) key are serialised by the
/// implementation; writes to different keys proceed independently. A
/// backend that detects contention it cannot serialise reports
/// `TutorError::ProgressPersistenceConflict`, which the engine retries.
#[async_trait]
pub trait ProgressStore: Send + Sync {
    // --- Students ---

    async fn get_student(&self, student_id: &str) -> Result<Option<Student>>;

    /// Inserts the student unless one with the same id exists; returns the stored row.
    async fn create_student(&self, student: Student) -> Result<Student>;

    // --- Sessions ---

    async fn insert_session(&self, session: &Session) -> Result<()>;

    async fn get_session(&self, session_id: SessionId) -> Result<Option<Session>>;

    async fn save_session(&self, session: &Session) -> Result<()>;

    /// The student's latest session that is either still active or was
    /// abandoned for inactivity, most recent first.
    async fn open_session_for(&self, student_id: &str) -> Result<Option<Session>>;

    /// Sessions in a non-terminal phase, for the inactivity sweep.
    async fn list_active_sessions(&self) -> Result<Vec<Session>>;

    async fn count_sessions(&self) -> Result<usize>;

    // --- Progress records ---

    /// Records one verdict for the key, incrementing its attempt count.
    async fn upsert(
        &self,
        student_id: &str,
        subtopic_id: SubtopicId,
        status: Status,
        flagged: bool,
    ) -> Result<ProgressRecord>;

    async fn find(
        &self,
        student_id: &str,
        subtopic_id: SubtopicId,
    ) -> Result<Option<ProgressRecord>>;

    /// Records for one student, in no particular order.
    async fn records_for_student(&self, student_id: &str) -> Result<Vec<ProgressRecord>>;

    async fn list_all(&self) -> Result<Vec<ProgressRecord>>;

    /// Like [`find`](Self::find) but reports a missing record as NotStarted.
    async fn get(&self, student_id: &str, subtopic_id: SubtopicId) -> Result<ProgressRecord> {
        Ok(self
            .find(student_id, subtopic_id)
            .await?
            .unwrap_or_else(|| ProgressRecord::not_started(student_id, subtopic_id)))
    }

    /// Records for one student in curriculum order.
    async fn list_for_student(
        &self,
        student_id: &str,
        tree: &CurriculumTree,
    ) -> Result<Vec<ProgressRecord>> {
        let mut records = self.records_for_student(student_id).await?;
        order_by_curriculum(&mut records, tree);
        Ok(records)
    }

    // --- Notes ---

    async fn get_note(
        &self,
        student_id: &str,
        subtopic_id: SubtopicId,
    ) -> Result<Option<NoteEntry>>;

    /// Every slot still waiting on a generation result.
    async fn pending_notes(&self) -> Result<Vec<NoteEntry>>;

    /// Writes the outcome of a generation attempt if `session_id` still
    /// owns the slot. Returns whether anything was written.
    async fn resolve_note(
        &self,
        student_id: &str,
        subtopic_id: SubtopicId,
        session_id: SessionId,
        state: NoteState,
    ) -> Result<bool>;

    // --- Transitions ---

    /// Applies the session update, the progress verdict, the pointer move
    /// and the note reset together, or none of them.
    async fn commit(&self, commit: TransitionCommit) -> Result<Option<ProgressRecord>>;
}
