//! API and Database Models
//!
//! Row types mapped with `sqlx::FromRow` for the storage layer, and the
//! request/response bodies documented with `utoipa`. Engine types stay free of
//! HTTP and SQL concerns; everything here converts to or from them.

use anyhow::anyhow;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use sqlx::types::Json;
use tutor_core::analytics::Analytics;
use tutor_core::curriculum::{
    CodeExample, CurriculumCounts, CurriculumTree, Lecture, LectureDraft, LectureNode,
    OrderTarget, Subtopic, SubtopicDraft, SubtopicId, SubtopicPrompts, Topic, TopicDraft,
};
use tutor_core::engine::ProgressReport;
use tutor_core::progress::{
    CurriculumPointer, NoteEntry, NoteState, ProgressRecord, ProgressSummary, Status, Student,
};
use tutor_core::session::{Session, SessionView, StudentInput};
use utoipa::ToSchema;
use uuid::Uuid;

// --- Database rows ---

#[derive(FromRow, Debug)]
pub struct LectureRow {
    pub id: i64,
    pub title: String,
    pub description: String,
    pub order_index: i32,
    pub is_active: bool,
}

impl From<LectureRow> for Lecture {
    fn from(row: LectureRow) -> Self {
        Lecture {
            id: row.id,
            title: row.title,
            description: row.description,
            order_index: row.order_index,
            is_active: row.is_active,
        }
    }
}

#[derive(FromRow, Debug)]
pub struct TopicRow {
    pub id: i64,
    pub lecture_id: i64,
    pub title: String,
    pub description: String,
    pub order_index: i32,
    pub learning_objectives: Json<Vec<String>>,
    pub estimated_duration_minutes: i32,
}

impl From<TopicRow> for Topic {
    fn from(row: TopicRow) -> Self {
        Topic {
            id: row.id,
            lecture_id: row.lecture_id,
            title: row.title,
            description: row.description,
            order_index: row.order_index,
            learning_objectives: row.learning_objectives.0,
            estimated_duration_minutes: row.estimated_duration_minutes,
        }
    }
}

#[derive(FromRow, Debug)]
pub struct SubtopicRow {
    pub id: i64,
    pub topic_id: i64,
    pub title: String,
    pub objective: String,
    pub content: String,
    pub examples: Json<Vec<CodeExample>>,
    pub exercises: Json<Vec<String>>,
    pub order_index: i32,
    pub introduction_prompt: String,
    pub explanation_prompt: String,
    pub assessment_prompt: String,
}

impl From<SubtopicRow> for Subtopic {
    fn from(row: SubtopicRow) -> Self {
        Subtopic {
            id: row.id,
            topic_id: row.topic_id,
            title: row.title,
            objective: row.objective,
            content: row.content,
            examples: row.examples.0,
            exercises: row.exercises.0,
            order_index: row.order_index,
            prompts: SubtopicPrompts {
                introduction: row.introduction_prompt,
                explanation: row.explanation_prompt,
                assessment: row.assessment_prompt,
            },
        }
    }
}

#[derive(FromRow, Debug)]
pub struct StudentRow {
    pub id: String,
    pub preferred_language: String,
    pub pointer_kind: String,
    pub pointer_subtopic_id: Option<i64>,
    pub created_at: DateTime<Utc>,
}

impl TryFrom<StudentRow> for Student {
    type Error = anyhow::Error;

    fn try_from(row: StudentRow) -> anyhow::Result<Self> {
        let pointer = match (row.pointer_kind.as_str(), row.pointer_subtopic_id) {
            ("not_started", _) => CurriculumPointer::NotStarted,
            ("at", Some(id)) => CurriculumPointer::At(id),
            ("complete", _) => CurriculumPointer::Complete,
            (kind, id) => return Err(anyhow!("invalid curriculum pointer {kind}/{id:?}")),
        };
        Ok(Student {
            id: row.id,
            preferred_language: row.preferred_language,
            pointer,
            created_at: row.created_at,
        })
    }
}

/// Column values for a pointer.
pub fn pointer_columns(pointer: CurriculumPointer) -> (&'static str, Option<i64>) {
    match pointer {
        CurriculumPointer::NotStarted => ("not_started", None),
        CurriculumPointer::At(id) => ("at", Some(id)),
        CurriculumPointer::Complete => ("complete", None),
    }
}

#[derive(FromRow, Debug)]
pub struct SessionRow {
    pub state_json: Json<Session>,
}

#[derive(FromRow, Debug)]
pub struct ProgressRow {
    pub student_id: String,
    pub subtopic_id: i64,
    pub status: String,
    pub attempts: i32,
    pub flagged: bool,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl TryFrom<ProgressRow> for ProgressRecord {
    type Error = anyhow::Error;

    fn try_from(row: ProgressRow) -> anyhow::Result<Self> {
        let status =
            Status::parse(&row.status).ok_or_else(|| anyhow!("invalid status '{}'", row.status))?;
        Ok(ProgressRecord {
            student_id: row.student_id,
            subtopic_id: row.subtopic_id,
            status,
            attempts: u32::try_from(row.attempts)?,
            flagged: row.flagged,
            updated_at: row.updated_at,
            completed_at: row.completed_at,
        })
    }
}

#[derive(FromRow, Debug)]
pub struct NoteRow {
    pub student_id: String,
    pub subtopic_id: i64,
    pub session_id: Uuid,
    pub state_json: Json<NoteState>,
    pub updated_at: DateTime<Utc>,
}

impl From<NoteRow> for NoteEntry {
    fn from(row: NoteRow) -> Self {
        NoteEntry {
            student_id: row.student_id,
            subtopic_id: row.subtopic_id,
            session_id: row.session_id,
            state: row.state_json.0,
            updated_at: row.updated_at,
        }
    }
}

// --- Requests ---

#[derive(Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct StartSessionPayload {
    #[schema(example = "student-42")]
    pub student_id: String,
    /// Used only when the student is seen for the first time.
    #[schema(example = "en")]
    pub language: Option<String>,
}

/// One student turn: a message, or the signal that they are ready to be assessed.
#[derive(Deserialize, ToSchema, Debug, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TurnPayload {
    Message { text: String },
    Ready,
}

impl From<TurnPayload> for StudentInput {
    fn from(payload: TurnPayload) -> Self {
        match payload {
            TurnPayload::Message { text } => StudentInput::Message { text },
            TurnPayload::Ready => StudentInput::Ready,
        }
    }
}

#[derive(Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct LecturePayload {
    #[schema(example = "Python Fundamentals")]
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_true")]
    pub is_active: bool,
}

fn default_true() -> bool {
    true
}

impl From<LecturePayload> for LectureDraft {
    fn from(p: LecturePayload) -> Self {
        LectureDraft {
            title: p.title,
            description: p.description,
            is_active: p.is_active,
        }
    }
}

#[derive(Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct TopicPayload {
    #[schema(example = "Variables and Data Types")]
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub learning_objectives: Vec<String>,
    pub estimated_duration_minutes: Option<i32>,
}

impl From<TopicPayload> for TopicDraft {
    fn from(p: TopicPayload) -> Self {
        TopicDraft {
            title: p.title,
            description: p.description,
            learning_objectives: p.learning_objectives,
            estimated_duration_minutes: p.estimated_duration_minutes.unwrap_or(30),
        }
    }
}

#[derive(Deserialize, Serialize, ToSchema)]
pub struct CodeExamplePayload {
    #[schema(example = "age = 25")]
    pub code: String,
    #[serde(default)]
    pub explanation: String,
}

#[derive(Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct SubtopicPayload {
    #[schema(example = "Creating Variables")]
    pub title: String,
    #[serde(default)]
    pub objective: String,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub examples: Vec<CodeExamplePayload>,
    #[serde(default)]
    pub exercises: Vec<String>,
    #[serde(default)]
    pub introduction_prompt: String,
    #[serde(default)]
    pub explanation_prompt: String,
    #[serde(default)]
    pub assessment_prompt: String,
}

impl From<SubtopicPayload> for SubtopicDraft {
    fn from(p: SubtopicPayload) -> Self {
        SubtopicDraft {
            title: p.title,
            objective: p.objective,
            content: p.content,
            examples: p
                .examples
                .into_iter()
                .map(|e| CodeExample {
                    code: e.code,
                    explanation: e.explanation,
                })
                .collect(),
            exercises: p.exercises,
            introduction_prompt: p.introduction_prompt,
            explanation_prompt: p.explanation_prompt,
            assessment_prompt: p.assessment_prompt,
        }
    }
}

#[derive(Deserialize, ToSchema, Debug, Clone, Copy, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    Lecture,
    Topic,
    Subtopic,
}

#[derive(Deserialize, ToSchema)]
pub struct ReorderPayload {
    pub kind: EntityKind,
    pub id: i64,
    /// Zero-based position among siblings; clamped to the last slot.
    pub index: usize,
}

impl ReorderPayload {
    pub fn target(&self) -> OrderTarget {
        match self.kind {
            EntityKind::Lecture => OrderTarget::Lecture(self.id),
            EntityKind::Topic => OrderTarget::Topic(self.id),
            EntityKind::Subtopic => OrderTarget::Subtopic(self.id),
        }
    }
}

#[derive(Deserialize, ToSchema)]
pub struct DuplicatePayload {
    #[schema(example = "Python Fundamentals (copy)")]
    pub title: String,
}

// --- Responses ---

#[derive(Serialize, ToSchema)]
pub struct ErrorResponse {
    pub message: String,
}

#[derive(Serialize, ToSchema)]
pub struct HealthResponse {
    #[schema(example = "ok")]
    pub status: String,
}

#[derive(Serialize, Deserialize, ToSchema, Debug)]
#[serde(rename_all = "camelCase")]
pub struct SummaryResponse {
    pub total_subtopics: usize,
    pub completed_subtopics: usize,
    pub completion_percentage: u32,
}

impl From<ProgressSummary> for SummaryResponse {
    fn from(s: ProgressSummary) -> Self {
        Self {
            total_subtopics: s.total_subtopics,
            completed_subtopics: s.completed_subtopics,
            completion_percentage: s.completion_percentage,
        }
    }
}

#[derive(Serialize, Deserialize, ToSchema, Debug)]
#[serde(rename_all = "camelCase")]
pub struct ProgressRecordResponse {
    pub subtopic_id: SubtopicId,
    #[schema(example = "green")]
    pub status: String,
    pub attempts: u32,
    pub flagged: bool,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl From<ProgressRecord> for ProgressRecordResponse {
    fn from(r: ProgressRecord) -> Self {
        Self {
            subtopic_id: r.subtopic_id,
            status: r.status.as_str().to_string(),
            attempts: r.attempts,
            flagged: r.flagged,
            updated_at: r.updated_at,
            completed_at: r.completed_at,
        }
    }
}

#[derive(Serialize, Deserialize, ToSchema, Debug)]
#[serde(rename_all = "camelCase")]
pub struct SessionResponse {
    #[schema(value_type = String, format = Uuid)]
    pub session_id: Uuid,
    pub student_id: String,
    pub subtopic_id: SubtopicId,
    pub subtopic_title: String,
    pub topic_title: String,
    pub lecture_title: String,
    #[schema(example = "explanation")]
    pub phase: String,
    pub reply: String,
    pub transcript_length: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress: Option<ProgressRecordResponse>,
    pub summary: SummaryResponse,
    pub resumed: bool,
}

impl From<SessionView> for SessionResponse {
    fn from(v: SessionView) -> Self {
        Self {
            session_id: v.session_id,
            student_id: v.student_id,
            subtopic_id: v.subtopic_id,
            subtopic_title: v.subtopic_title,
            topic_title: v.topic_title,
            lecture_title: v.lecture_title,
            phase: v.phase.as_str().to_string(),
            reply: v.reply,
            transcript_length: v.transcript_length,
            progress: v.progress.map(Into::into),
            summary: v.summary.into(),
            resumed: v.resumed,
        }
    }
}

#[derive(Serialize, Deserialize, ToSchema, Debug)]
#[serde(rename_all = "camelCase")]
pub struct PointerResponse {
    #[schema(example = "at")]
    pub kind: String,
    pub subtopic_id: Option<SubtopicId>,
}

impl From<CurriculumPointer> for PointerResponse {
    fn from(pointer: CurriculumPointer) -> Self {
        let (kind, subtopic_id) = pointer_columns(pointer);
        Self {
            kind: kind.to_string(),
            subtopic_id,
        }
    }
}

#[derive(Serialize, Deserialize, ToSchema, Debug)]
#[serde(rename_all = "camelCase")]
pub struct ProgressResponse {
    pub student_id: String,
    pub pointer: PointerResponse,
    /// In curriculum order.
    pub records: Vec<ProgressRecordResponse>,
    pub summary: SummaryResponse,
}

impl From<ProgressReport> for ProgressResponse {
    fn from(r: ProgressReport) -> Self {
        Self {
            student_id: r.student_id,
            pointer: r.pointer.into(),
            records: r.records.into_iter().map(Into::into).collect(),
            summary: r.summary.into(),
        }
    }
}

#[derive(Serialize, Deserialize, ToSchema, Debug)]
#[serde(rename_all = "camelCase")]
pub struct NoteResponse {
    pub student_id: String,
    pub subtopic_id: SubtopicId,
    #[schema(value_type = String, format = Uuid)]
    pub session_id: Uuid,
    /// `pending`, `ready` or `generation_failed`.
    #[schema(example = "ready")]
    pub state: String,
    pub summary: Option<String>,
    pub key_points: Vec<String>,
    pub struggle_points: Vec<String>,
    pub attempts: Option<u32>,
    pub last_error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl From<NoteEntry> for NoteResponse {
    fn from(entry: NoteEntry) -> Self {
        let mut response = Self {
            student_id: entry.student_id,
            subtopic_id: entry.subtopic_id,
            session_id: entry.session_id,
            state: String::new(),
            summary: None,
            key_points: Vec::new(),
            struggle_points: Vec::new(),
            attempts: None,
            last_error: None,
            updated_at: entry.updated_at,
        };
        match entry.state {
            NoteState::Pending => response.state = "pending".to_string(),
            NoteState::Ready { note } => {
                response.state = "ready".to_string();
                response.summary = Some(note.summary);
                response.key_points = note.key_points;
                response.struggle_points = note.struggle_points;
            }
            NoteState::GenerationFailed {
                attempts,
                last_error,
            } => {
                response.state = "generation_failed".to_string();
                response.attempts = Some(attempts);
                response.last_error = Some(last_error);
            }
        }
        response
    }
}

#[derive(Serialize, Deserialize, ToSchema, Debug, PartialEq)]
pub struct CountsResponse {
    pub lectures: usize,
    pub topics: usize,
    pub subtopics: usize,
}

impl From<CurriculumCounts> for CountsResponse {
    fn from(c: CurriculumCounts) -> Self {
        Self {
            lectures: c.lectures,
            topics: c.topics,
            subtopics: c.subtopics,
        }
    }
}

/// The nested curriculum at one revision, in traversal order.
#[derive(Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct CurriculumResponse {
    pub revision: u64,
    pub counts: CountsResponse,
    #[schema(value_type = Vec<Object>)]
    pub lectures: Vec<LectureNode>,
}

impl From<&CurriculumTree> for CurriculumResponse {
    fn from(tree: &CurriculumTree) -> Self {
        Self {
            revision: tree.revision(),
            counts: tree.counts().into(),
            lectures: tree.to_document().lectures,
        }
    }
}

/// What an authoring write returns.
#[derive(Serialize, Deserialize, ToSchema, Debug)]
#[serde(rename_all = "camelCase")]
pub struct EntityResponse {
    pub id: i64,
    pub title: String,
    pub order_index: i32,
}

impl From<Lecture> for EntityResponse {
    fn from(l: Lecture) -> Self {
        Self {
            id: l.id,
            title: l.title,
            order_index: l.order_index,
        }
    }
}

impl From<Topic> for EntityResponse {
    fn from(t: Topic) -> Self {
        Self {
            id: t.id,
            title: t.title,
            order_index: t.order_index,
        }
    }
}

impl From<Subtopic> for EntityResponse {
    fn from(s: Subtopic) -> Self {
        Self {
            id: s.id,
            title: s.title,
            order_index: s.order_index,
        }
    }
}

#[derive(Serialize, Deserialize, ToSchema, Debug)]
#[serde(rename_all = "camelCase")]
pub struct StatusDistributionResponse {
    pub not_started: usize,
    pub red: usize,
    pub yellow: usize,
    pub green: usize,
}

#[derive(Serialize, Deserialize, ToSchema, Debug)]
#[serde(rename_all = "camelCase")]
pub struct AnalyticsResponse {
    pub active_students: usize,
    pub total_sessions: usize,
    pub by_status_distribution: StatusDistributionResponse,
    pub flagged_records: usize,
    pub average_sessions_per_student: f64,
    pub curriculum: CountsResponse,
}

impl From<Analytics> for AnalyticsResponse {
    fn from(a: Analytics) -> Self {
        let d = a.engagement.by_status_distribution;
        Self {
            active_students: a.engagement.active_students,
            total_sessions: a.engagement.total_sessions,
            by_status_distribution: StatusDistributionResponse {
                not_started: d.not_started,
                red: d.red,
                yellow: d.yellow,
                green: d.green,
            },
            flagged_records: a.engagement.flagged_records,
            average_sessions_per_student: a.engagement.average_sessions_per_student,
            curriculum: a.curriculum.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tutor_core::progress::Note;

    #[test]
    fn test_turn_payload_deserialization() {
        let ready: TurnPayload = serde_json::from_str(r#"{"type": "ready"}"#).unwrap();
        assert_eq!(StudentInput::from(ready), StudentInput::Ready);

        let message: TurnPayload =
            serde_json::from_str(r#"{"type": "message", "text": "Is it a box?"}"#).unwrap();
        assert_eq!(StudentInput::from(message), StudentInput::message("Is it a box?"));

        let bare: Result<TurnPayload, _> = serde_json::from_str(r#"{"text": "hi"}"#);
        assert!(bare.is_err());
    }

    #[test]
    fn test_start_session_payload_language_is_optional() {
        let payload: StartSessionPayload =
            serde_json::from_str(r#"{"studentId": "s1"}"#).unwrap();
        assert_eq!(payload.student_id, "s1");
        assert!(payload.language.is_none());
    }

    #[test]
    fn test_subtopic_payload_defaults() {
        let payload: SubtopicPayload = serde_json::from_str(
            r#"{"title": "Creating Variables", "examples": [{"code": "x = 1"}]}"#,
        )
        .unwrap();
        let draft = SubtopicDraft::from(payload);
        assert_eq!(draft.title, "Creating Variables");
        assert_eq!(draft.examples.len(), 1);
        assert!(draft.examples[0].explanation.is_empty());
        assert!(draft.introduction_prompt.is_empty());
    }

    #[test]
    fn test_reorder_payload_target() {
        let payload: ReorderPayload =
            serde_json::from_str(r#"{"kind": "topic", "id": 7, "index": 0}"#).unwrap();
        assert_eq!(payload.target(), OrderTarget::Topic(7));
    }

    #[test]
    fn test_student_row_pointer_mapping() {
        let row = |kind: &str, id: Option<i64>| StudentRow {
            id: "s1".to_string(),
            preferred_language: "en".to_string(),
            pointer_kind: kind.to_string(),
            pointer_subtopic_id: id,
            created_at: Utc::now(),
        };
        let student = Student::try_from(row("at", Some(4))).unwrap();
        assert_eq!(student.pointer, CurriculumPointer::At(4));
        assert_eq!(pointer_columns(student.pointer), ("at", Some(4)));

        let done = Student::try_from(row("complete", None)).unwrap();
        assert_eq!(done.pointer, CurriculumPointer::Complete);

        assert!(Student::try_from(row("at", None)).is_err());
        assert!(Student::try_from(row("elsewhere", None)).is_err());
    }

    #[test]
    fn test_progress_row_rejects_unknown_status() {
        let row = ProgressRow {
            student_id: "s1".to_string(),
            subtopic_id: 1,
            status: "purple".to_string(),
            attempts: 1,
            flagged: false,
            updated_at: Utc::now(),
            completed_at: None,
        };
        assert!(ProgressRecord::try_from(row).is_err());
    }

    #[test]
    fn test_note_response_flattens_state() {
        let now = Utc::now();
        let entry = NoteEntry {
            student_id: "s1".to_string(),
            subtopic_id: 3,
            session_id: Uuid::new_v4(),
            state: NoteState::Ready {
                note: Note {
                    summary: "Variables name values.".to_string(),
                    key_points: vec!["assignment uses =".to_string()],
                    struggle_points: vec![],
                    generated_at: now,
                },
            },
            updated_at: now,
        };
        let response = NoteResponse::from(entry);
        assert_eq!(response.state, "ready");
        assert_eq!(response.summary.as_deref(), Some("Variables name values."));
        assert!(response.attempts.is_none());

        let failed = NoteResponse::from(NoteEntry {
            student_id: "s1".to_string(),
            subtopic_id: 3,
            session_id: Uuid::new_v4(),
            state: NoteState::GenerationFailed {
                attempts: 4,
                last_error: "timeout".to_string(),
            },
            updated_at: now,
        });
        assert_eq!(failed.state, "generation_failed");
        assert_eq!(failed.attempts, Some(4));
    }

    #[test]
    fn test_error_response_serialization() {
        let error = ErrorResponse {
            message: "Session not found".to_string(),
        };
        let json = serde_json::to_string(&error).unwrap();
        assert_eq!(json, r#"{"message":"Session not found"}"#);
    }
}
