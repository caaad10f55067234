//! Data Access Layer
//!
//! PostgreSQL implementations of the engine's storage traits. `Db` wraps a
//! `PgPool` and backs both [`CurriculumStore`] and [`ProgressStore`].
//!
//! Every curriculum write starts by bumping the single `curriculum_revision`
//! row, which also serialises writers. Snapshots are read in one
//! repeatable-read transaction so the tree and its revision always agree.

use async_trait::async_trait;
use chrono::Utc;
use sqlx::types::Json;
use sqlx::{PgConnection, PgPool};
use tracing::{info, warn};
use tutor_core::curriculum::{
    CurriculumStore, CurriculumTree, Lecture, LectureDraft, LectureId, OrderTarget, Subtopic,
    SubtopicDraft, SubtopicId, Topic, TopicDraft, move_to_index,
};
use tutor_core::progress::{
    NoteEntry, NoteState, ProgressRecord, ProgressStore, Status, Student, TransitionCommit,
};
use tutor_core::session::{Session, SessionId};
use tutor_core::{Result, TutorError};

use crate::models::{
    LectureRow, NoteRow, ProgressRow, SessionRow, StudentRow, SubtopicRow, TopicRow,
    pointer_columns,
};

const LECTURE_COLUMNS: &str = "id, title, description, order_index, is_active";
const TOPIC_COLUMNS: &str = "id, lecture_id, title, description, order_index, learning_objectives, estimated_duration_minutes";
const SUBTOPIC_COLUMNS: &str = "id, topic_id, title, objective, content, examples, exercises, order_index, introduction_prompt, explanation_prompt, assessment_prompt";
const PROGRESS_COLUMNS: &str =
    "student_id, subtopic_id, status, attempts, flagged, updated_at, completed_at";
const NOTE_COLUMNS: &str = "student_id, subtopic_id, session_id, state_json, updated_at";
const OPEN_SESSION_FILTER: &str = "(phase NOT IN ('completed', 'abandoned') OR (phase = 'abandoned' AND abandon_reason = 'inactivity_timeout'))";

/// A wrapper around the `PgPool` to provide a clear data access interface.
#[derive(Clone)]
pub struct Db {
    pool: PgPool,
}

impl Db {
    /// Creates a new `Db` instance.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Runs all pending `sqlx` migrations.
    pub async fn run_migrations(&self) -> anyhow::Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    /// True when no lecture exists yet, i.e. the curriculum can be seeded.
    pub async fn is_curriculum_empty(&self) -> anyhow::Result<bool> {
        let exists: bool = sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM lectures)")
            .fetch_one(&self.pool)
            .await?;
        Ok(!exists)
    }
}

fn storage(e: sqlx::Error) -> TutorError {
    TutorError::Storage(e.into())
}

fn not_found(kind: &str, id: i64) -> TutorError {
    TutorError::CurriculumNotFound(format!("{kind} {id}"))
}

/// Serialization failures and deadlocks: the transaction may succeed if retried.
fn is_contention(e: &sqlx::Error) -> bool {
    match e {
        sqlx::Error::Database(db) => matches!(db.code().as_deref(), Some("40001" | "40P01")),
        _ => false,
    }
}

async fn bump_revision(conn: &mut PgConnection) -> Result<u64> {
    let revision: i64 = sqlx::query_scalar(
        "UPDATE curriculum_revision SET revision = revision + 1 WHERE id RETURNING revision",
    )
    .fetch_one(conn)
    .await
    .map_err(storage)?;
    Ok(revision as u64)
}

/// Sibling ids of one parent, in current order. `table` and `parent` are
/// fixed identifiers, never user input.
async fn sibling_ids(
    conn: &mut PgConnection,
    table: &str,
    parent: Option<(&str, i64)>,
) -> Result<Vec<i64>> {
    let ids = match parent {
        Some((column, id)) => {
            sqlx::query_scalar(&format!(
                "SELECT id FROM {table} WHERE {column} = $1 ORDER BY order_index, id"
            ))
            .bind(id)
            .fetch_all(conn)
            .await
        }
        None => {
            sqlx::query_scalar(&format!("SELECT id FROM {table} ORDER BY order_index, id"))
                .fetch_all(conn)
                .await
        }
    };
    ids.map_err(storage)
}

/// Writes `0..n` order indices following `order`.
async fn renumber(conn: &mut PgConnection, table: &str, order: &[i64]) -> Result<()> {
    let query = format!("UPDATE {table} SET order_index = $1 WHERE id = $2");
    for (index, id) in order.iter().enumerate() {
        sqlx::query(&query)
            .bind(index as i32)
            .bind(id)
            .execute(&mut *conn)
            .await
            .map_err(storage)?;
    }
    Ok(())
}

async fn parent_of(conn: &mut PgConnection, table: &str, column: &str, id: i64) -> Result<Option<i64>> {
    sqlx::query_scalar(&format!("SELECT {column} FROM {table} WHERE id = $1"))
        .bind(id)
        .fetch_optional(conn)
        .await
        .map_err(storage)
}

// --- Curriculum ---

#[async_trait]
impl CurriculumStore for Db {
    async fn snapshot(&self) -> Result<CurriculumTree> {
        let mut tx = self.pool.begin().await.map_err(storage)?;
        sqlx::query("SET TRANSACTION ISOLATION LEVEL REPEATABLE READ, READ ONLY")
            .execute(&mut *tx)
            .await
            .map_err(storage)?;

        let revision: i64 = sqlx::query_scalar("SELECT revision FROM curriculum_revision")
            .fetch_one(&mut *tx)
            .await
            .map_err(storage)?;
        let lectures = sqlx::query_as::<_, LectureRow>(&format!("SELECT {LECTURE_COLUMNS} FROM lectures"))
            .fetch_all(&mut *tx)
            .await
            .map_err(storage)?;
        let topics = sqlx::query_as::<_, TopicRow>(&format!("SELECT {TOPIC_COLUMNS} FROM topics"))
            .fetch_all(&mut *tx)
            .await
            .map_err(storage)?;
        let subtopics =
            sqlx::query_as::<_, SubtopicRow>(&format!("SELECT {SUBTOPIC_COLUMNS} FROM subtopics"))
                .fetch_all(&mut *tx)
                .await
                .map_err(storage)?;
        tx.commit().await.map_err(storage)?;

        Ok(CurriculumTree::new(
            revision as u64,
            lectures.into_iter().map(Into::into).collect(),
            topics.into_iter().map(Into::into).collect(),
            subtopics.into_iter().map(Into::into).collect(),
        ))
    }

    async fn revision(&self) -> Result<u64> {
        let revision: i64 = sqlx::query_scalar("SELECT revision FROM curriculum_revision")
            .fetch_one(&self.pool)
            .await
            .map_err(storage)?;
        Ok(revision as u64)
    }

    async fn create_lecture(&self, draft: LectureDraft) -> Result<Lecture> {
        let mut tx = self.pool.begin().await.map_err(storage)?;
        bump_revision(&mut tx).await?;
        let row = sqlx::query_as::<_, LectureRow>(&format!(
            "INSERT INTO lectures (title, description, order_index, is_active)
             VALUES ($1, $2, (SELECT COALESCE(MAX(order_index) + 1, 0) FROM lectures), $3)
             RETURNING {LECTURE_COLUMNS}"
        ))
        .bind(&draft.title)
        .bind(&draft.description)
        .bind(draft.is_active)
        .fetch_one(&mut *tx)
        .await
        .map_err(storage)?;
        tx.commit().await.map_err(storage)?;
        Ok(row.into())
    }

    async fn update_lecture(&self, id: LectureId, draft: LectureDraft) -> Result<Lecture> {
        let mut tx = self.pool.begin().await.map_err(storage)?;
        bump_revision(&mut tx).await?;
        let row = sqlx::query_as::<_, LectureRow>(&format!(
            "UPDATE lectures SET title = $2, description = $3, is_active = $4
             WHERE id = $1 RETURNING {LECTURE_COLUMNS}"
        ))
        .bind(id)
        .bind(&draft.title)
        .bind(&draft.description)
        .bind(draft.is_active)
        .fetch_optional(&mut *tx)
        .await
        .map_err(storage)?
        .ok_or_else(|| not_found("lecture", id))?;
        tx.commit().await.map_err(storage)?;
        Ok(row.into())
    }

    async fn delete_lecture(&self, id: LectureId) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(storage)?;
        bump_revision(&mut tx).await?;
        let deleted = sqlx::query("DELETE FROM lectures WHERE id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await
            .map_err(storage)?;
        if deleted.rows_affected() == 0 {
            return Err(not_found("lecture", id));
        }
        let order = sibling_ids(&mut tx, "lectures", None).await?;
        renumber(&mut tx, "lectures", &order).await?;
        tx.commit().await.map_err(storage)?;
        info!(lecture_id = id, "Lecture deleted with its topics and subtopics");
        Ok(())
    }

    async fn create_topic(&self, lecture_id: LectureId, draft: TopicDraft) -> Result<Topic> {
        let mut tx = self.pool.begin().await.map_err(storage)?;
        bump_revision(&mut tx).await?;
        let lecture: Option<i64> = sqlx::query_scalar("SELECT id FROM lectures WHERE id = $1")
            .bind(lecture_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(storage)?;
        if lecture.is_none() {
            return Err(not_found("lecture", lecture_id));
        }
        let row = sqlx::query_as::<_, TopicRow>(&format!(
            "INSERT INTO topics (lecture_id, title, description, order_index, learning_objectives, estimated_duration_minutes)
             VALUES ($1, $2, $3, (SELECT COALESCE(MAX(order_index) + 1, 0) FROM topics WHERE lecture_id = $1), $4, $5)
             RETURNING {TOPIC_COLUMNS}"
        ))
        .bind(lecture_id)
        .bind(&draft.title)
        .bind(&draft.description)
        .bind(Json(&draft.learning_objectives))
        .bind(draft.estimated_duration_minutes)
        .fetch_one(&mut *tx)
        .await
        .map_err(storage)?;
        tx.commit().await.map_err(storage)?;
        Ok(row.into())
    }

    async fn update_topic(&self, id: i64, draft: TopicDraft) -> Result<Topic> {
        let mut tx = self.pool.begin().await.map_err(storage)?;
        bump_revision(&mut tx).await?;
        let row = sqlx::query_as::<_, TopicRow>(&format!(
            "UPDATE topics SET title = $2, description = $3, learning_objectives = $4, estimated_duration_minutes = $5
             WHERE id = $1 RETURNING {TOPIC_COLUMNS}"
        ))
        .bind(id)
        .bind(&draft.title)
        .bind(&draft.description)
        .bind(Json(&draft.learning_objectives))
        .bind(draft.estimated_duration_minutes)
        .fetch_optional(&mut *tx)
        .await
        .map_err(storage)?
        .ok_or_else(|| not_found("topic", id))?;
        tx.commit().await.map_err(storage)?;
        Ok(row.into())
    }

    async fn delete_topic(&self, id: i64) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(storage)?;
        bump_revision(&mut tx).await?;
        let lecture_id: i64 = sqlx::query_scalar("DELETE FROM topics WHERE id = $1 RETURNING lecture_id")
            .bind(id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(storage)?
            .ok_or_else(|| not_found("topic", id))?;
        let order = sibling_ids(&mut tx, "topics", Some(("lecture_id", lecture_id))).await?;
        renumber(&mut tx, "topics", &order).await?;
        tx.commit().await.map_err(storage)?;
        Ok(())
    }

    async fn create_subtopic(&self, topic_id: i64, draft: SubtopicDraft) -> Result<Subtopic> {
        let mut tx = self.pool.begin().await.map_err(storage)?;
        bump_revision(&mut tx).await?;
        let topic: Option<i64> = sqlx::query_scalar("SELECT id FROM topics WHERE id = $1")
            .bind(topic_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(storage)?;
        if topic.is_none() {
            return Err(not_found("topic", topic_id));
        }
        let row = sqlx::query_as::<_, SubtopicRow>(&format!(
            "INSERT INTO subtopics (topic_id, title, objective, content, examples, exercises, order_index,
                                    introduction_prompt, explanation_prompt, assessment_prompt)
             VALUES ($1, $2, $3, $4, $5, $6,
                     (SELECT COALESCE(MAX(order_index) + 1, 0) FROM subtopics WHERE topic_id = $1),
                     $7, $8, $9)
             RETURNING {SUBTOPIC_COLUMNS}"
        ))
        .bind(topic_id)
        .bind(&draft.title)
        .bind(&draft.objective)
        .bind(&draft.content)
        .bind(Json(&draft.examples))
        .bind(Json(&draft.exercises))
        .bind(&draft.introduction_prompt)
        .bind(&draft.explanation_prompt)
        .bind(&draft.assessment_prompt)
        .fetch_one(&mut *tx)
        .await
        .map_err(storage)?;
        tx.commit().await.map_err(storage)?;
        Ok(row.into())
    }

    async fn update_subtopic(&self, id: SubtopicId, draft: SubtopicDraft) -> Result<Subtopic> {
        let mut tx = self.pool.begin().await.map_err(storage)?;
        bump_revision(&mut tx).await?;
        let row = sqlx::query_as::<_, SubtopicRow>(&format!(
            "UPDATE subtopics SET title = $2, objective = $3, content = $4, examples = $5, exercises = $6,
                    introduction_prompt = $7, explanation_prompt = $8, assessment_prompt = $9
             WHERE id = $1 RETURNING {SUBTOPIC_COLUMNS}"
        ))
        .bind(id)
        .bind(&draft.title)
        .bind(&draft.objective)
        .bind(&draft.content)
        .bind(Json(&draft.examples))
        .bind(Json(&draft.exercises))
        .bind(&draft.introduction_prompt)
        .bind(&draft.explanation_prompt)
        .bind(&draft.assessment_prompt)
        .fetch_optional(&mut *tx)
        .await
        .map_err(storage)?
        .ok_or_else(|| not_found("subtopic", id))?;
        tx.commit().await.map_err(storage)?;
        Ok(row.into())
    }

    async fn delete_subtopic(&self, id: SubtopicId) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(storage)?;
        bump_revision(&mut tx).await?;
        let topic_id: i64 = sqlx::query_scalar("DELETE FROM subtopics WHERE id = $1 RETURNING topic_id")
            .bind(id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(storage)?
            .ok_or_else(|| not_found("subtopic", id))?;
        let order = sibling_ids(&mut tx, "subtopics", Some(("topic_id", topic_id))).await?;
        renumber(&mut tx, "subtopics", &order).await?;
        tx.commit().await.map_err(storage)?;
        Ok(())
    }

    async fn reorder(&self, target: OrderTarget, new_index: usize) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(storage)?;
        bump_revision(&mut tx).await?;
        let (table, kind, id, mut order) = match target {
            OrderTarget::Lecture(id) => (
                "lectures",
                "lecture",
                id,
                sibling_ids(&mut tx, "lectures", None).await?,
            ),
            OrderTarget::Topic(id) => {
                let lecture_id = parent_of(&mut tx, "topics", "lecture_id", id)
                    .await?
                    .ok_or_else(|| not_found("topic", id))?;
                let order = sibling_ids(&mut tx, "topics", Some(("lecture_id", lecture_id))).await?;
                ("topics", "topic", id, order)
            }
            OrderTarget::Subtopic(id) => {
                let topic_id = parent_of(&mut tx, "subtopics", "topic_id", id)
                    .await?
                    .ok_or_else(|| not_found("subtopic", id))?;
                let order = sibling_ids(&mut tx, "subtopics", Some(("topic_id", topic_id))).await?;
                ("subtopics", "subtopic", id, order)
            }
        };
        if !move_to_index(&mut order, id, new_index) {
            return Err(not_found(kind, id));
        }
        renumber(&mut tx, table, &order).await?;
        tx.commit().await.map_err(storage)?;
        Ok(())
    }

    async fn duplicate_lecture(&self, id: LectureId, new_title: String) -> Result<Lecture> {
        let mut tx = self.pool.begin().await.map_err(storage)?;
        bump_revision(&mut tx).await?;
        let source = sqlx::query_as::<_, LectureRow>(&format!(
            "SELECT {LECTURE_COLUMNS} FROM lectures WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(storage)?
        .ok_or_else(|| not_found("lecture", id))?;

        let copy = sqlx::query_as::<_, LectureRow>(&format!(
            "INSERT INTO lectures (title, description, order_index, is_active)
             VALUES ($1, $2, (SELECT COALESCE(MAX(order_index) + 1, 0) FROM lectures), $3)
             RETURNING {LECTURE_COLUMNS}"
        ))
        .bind(&new_title)
        .bind(&source.description)
        .bind(source.is_active)
        .fetch_one(&mut *tx)
        .await
        .map_err(storage)?;

        let topics = sqlx::query_as::<_, TopicRow>(&format!(
            "SELECT {TOPIC_COLUMNS} FROM topics WHERE lecture_id = $1 ORDER BY order_index, id"
        ))
        .bind(id)
        .fetch_all(&mut *tx)
        .await
        .map_err(storage)?;
        for topic in topics {
            let new_topic: i64 = sqlx::query_scalar(
                "INSERT INTO topics (lecture_id, title, description, order_index, learning_objectives, estimated_duration_minutes)
                 VALUES ($1, $2, $3, $4, $5, $6) RETURNING id",
            )
            .bind(copy.id)
            .bind(&topic.title)
            .bind(&topic.description)
            .bind(topic.order_index)
            .bind(&topic.learning_objectives)
            .bind(topic.estimated_duration_minutes)
            .fetch_one(&mut *tx)
            .await
            .map_err(storage)?;
            sqlx::query(
                "INSERT INTO subtopics (topic_id, title, objective, content, examples, exercises, order_index,
                                        introduction_prompt, explanation_prompt, assessment_prompt)
                 SELECT $1, title, objective, content, examples, exercises, order_index,
                        introduction_prompt, explanation_prompt, assessment_prompt
                 FROM subtopics WHERE topic_id = $2",
            )
            .bind(new_topic)
            .bind(topic.id)
            .execute(&mut *tx)
            .await
            .map_err(storage)?;
        }
        tx.commit().await.map_err(storage)?;
        info!(source = id, copy = copy.id, "Lecture duplicated");
        Ok(copy.into())
    }
}

// --- Progress ---

#[async_trait]
impl ProgressStore for Db {
    async fn get_student(&self, student_id: &str) -> Result<Option<Student>> {
        let row = sqlx::query_as::<_, StudentRow>(
            "SELECT id, preferred_language, pointer_kind, pointer_subtopic_id, created_at
             FROM students WHERE id = $1",
        )
        .bind(student_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(storage)?;
        Ok(row.map(Student::try_from).transpose()?)
    }

    async fn create_student(&self, student: Student) -> Result<Student> {
        let (kind, subtopic_id) = pointer_columns(student.pointer);
        sqlx::query(
            "INSERT INTO students (id, preferred_language, pointer_kind, pointer_subtopic_id, created_at)
             VALUES ($1, $2, $3, $4, $5) ON CONFLICT (id) DO NOTHING",
        )
        .bind(&student.id)
        .bind(&student.preferred_language)
        .bind(kind)
        .bind(subtopic_id)
        .bind(student.created_at)
        .execute(&self.pool)
        .await
        .map_err(storage)?;
        self.get_student(&student.id)
            .await?
            .ok_or_else(|| TutorError::Storage(anyhow::anyhow!("student '{}' vanished after insert", student.id)))
    }

    async fn insert_session(&self, session: &Session) -> Result<()> {
        sqlx::query(
            "INSERT INTO sessions (id, student_id, subtopic_id, phase, abandon_reason, state_json, created_at, last_activity_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
        )
        .bind(session.id)
        .bind(&session.student_id)
        .bind(session.subtopic_id)
        .bind(session.phase.as_str())
        .bind(session.abandon_reason.map(|r| r.as_str()))
        .bind(Json(session))
        .bind(session.created_at)
        .bind(session.last_activity_at)
        .execute(&self.pool)
        .await
        .map_err(storage)?;
        Ok(())
    }

    async fn get_session(&self, session_id: SessionId) -> Result<Option<Session>> {
        let row = sqlx::query_as::<_, SessionRow>("SELECT state_json FROM sessions WHERE id = $1")
            .bind(session_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(storage)?;
        Ok(row.map(|r| r.state_json.0))
    }

    async fn save_session(&self, session: &Session) -> Result<()> {
        let mut conn = self.pool.acquire().await.map_err(storage)?;
        write_session(&mut conn, session).await
    }

    async fn open_session_for(&self, student_id: &str) -> Result<Option<Session>> {
        let row = sqlx::query_as::<_, SessionRow>(&format!(
            "SELECT state_json FROM sessions WHERE student_id = $1 AND {OPEN_SESSION_FILTER}
             ORDER BY created_at DESC LIMIT 1"
        ))
        .bind(student_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(storage)?;
        Ok(row.map(|r| r.state_json.0))
    }

    async fn list_active_sessions(&self) -> Result<Vec<Session>> {
        let rows = sqlx::query_as::<_, SessionRow>(
            "SELECT state_json FROM sessions WHERE phase NOT IN ('completed', 'abandoned')",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(storage)?;
        Ok(rows.into_iter().map(|r| r.state_json.0).collect())
    }

    async fn count_sessions(&self) -> Result<usize> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM sessions")
            .fetch_one(&self.pool)
            .await
            .map_err(storage)?;
        Ok(count as usize)
    }

    async fn upsert(
        &self,
        student_id: &str,
        subtopic_id: SubtopicId,
        status: Status,
        flagged: bool,
    ) -> Result<ProgressRecord> {
        let mut conn = self.pool.acquire().await.map_err(storage)?;
        upsert_record(&mut conn, student_id, subtopic_id, status, flagged, false).await
    }

    async fn find(&self, student_id: &str, subtopic_id: SubtopicId) -> Result<Option<ProgressRecord>> {
        let row = sqlx::query_as::<_, ProgressRow>(&format!(
            "SELECT {PROGRESS_COLUMNS} FROM progress_records WHERE student_id = $1 AND subtopic_id = $2"
        ))
        .bind(student_id)
        .bind(subtopic_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(storage)?;
        Ok(row.map(ProgressRecord::try_from).transpose()?)
    }

    async fn records_for_student(&self, student_id: &str) -> Result<Vec<ProgressRecord>> {
        let rows = sqlx::query_as::<_, ProgressRow>(&format!(
            "SELECT {PROGRESS_COLUMNS} FROM progress_records WHERE student_id = $1"
        ))
        .bind(student_id)
        .fetch_all(&self.pool)
        .await
        .map_err(storage)?;
        Ok(rows
            .into_iter()
            .map(ProgressRecord::try_from)
            .collect::<anyhow::Result<_>>()?)
    }

    async fn list_all(&self) -> Result<Vec<ProgressRecord>> {
        let rows = sqlx::query_as::<_, ProgressRow>(&format!(
            "SELECT {PROGRESS_COLUMNS} FROM progress_records"
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(storage)?;
        Ok(rows
            .into_iter()
            .map(ProgressRecord::try_from)
            .collect::<anyhow::Result<_>>()?)
    }

    async fn get_note(&self, student_id: &str, subtopic_id: SubtopicId) -> Result<Option<NoteEntry>> {
        let row = sqlx::query_as::<_, NoteRow>(&format!(
            "SELECT {NOTE_COLUMNS} FROM notes WHERE student_id = $1 AND subtopic_id = $2"
        ))
        .bind(student_id)
        .bind(subtopic_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(storage)?;
        Ok(row.map(Into::into))
    }

    async fn pending_notes(&self) -> Result<Vec<NoteEntry>> {
        let rows = sqlx::query_as::<_, NoteRow>(&format!(
            "SELECT {NOTE_COLUMNS} FROM notes WHERE state_json->>'state' = 'pending'"
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(storage)?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn resolve_note(
        &self,
        student_id: &str,
        subtopic_id: SubtopicId,
        session_id: SessionId,
        state: NoteState,
    ) -> Result<bool> {
        let updated = sqlx::query(
            "UPDATE notes SET state_json = $4, updated_at = $5
             WHERE student_id = $1 AND subtopic_id = $2 AND session_id = $3",
        )
        .bind(student_id)
        .bind(subtopic_id)
        .bind(session_id)
        .bind(Json(&state))
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .map_err(storage)?;
        Ok(updated.rows_affected() > 0)
    }

    async fn commit(&self, commit: TransitionCommit) -> Result<Option<ProgressRecord>> {
        let session = &commit.session;
        let conflict = |e: sqlx::Error| {
            if is_contention(&e) {
                warn!(error = %e, "Transition commit hit contention");
                TutorError::ProgressPersistenceConflict {
                    student_id: session.student_id.clone(),
                    subtopic_id: session.subtopic_id,
                }
            } else {
                storage(e)
            }
        };

        let mut tx = self.pool.begin().await.map_err(storage)?;
        let locked: Option<SessionId> =
            sqlx::query_scalar("SELECT id FROM sessions WHERE id = $1 FOR UPDATE")
                .bind(session.id)
                .fetch_optional(&mut *tx)
                .await
                .map_err(conflict)?;
        if locked.is_none() {
            return Err(TutorError::SessionNotFound(session.id));
        }

        let record = match commit.progress {
            Some(update) => Some(
                upsert_record(
                    &mut tx,
                    &session.student_id,
                    session.subtopic_id,
                    update.status,
                    update.flagged,
                    update.completes,
                )
                .await?,
            ),
            None => None,
        };

        if let Some(pointer) = commit.pointer {
            let (kind, subtopic_id) = pointer_columns(pointer);
            let moved = sqlx::query(
                "UPDATE students SET pointer_kind = $2, pointer_subtopic_id = $3 WHERE id = $1",
            )
            .bind(&session.student_id)
            .bind(kind)
            .bind(subtopic_id)
            .execute(&mut *tx)
            .await
            .map_err(conflict)?;
            if moved.rows_affected() == 0 {
                return Err(TutorError::Storage(anyhow::anyhow!(
                    "student '{}' not found",
                    session.student_id
                )));
            }
        }

        if commit.queue_note {
            sqlx::query(
                "INSERT INTO notes (student_id, subtopic_id, session_id, state_json, updated_at)
                 VALUES ($1, $2, $3, $4, $5)
                 ON CONFLICT (student_id, subtopic_id)
                 DO UPDATE SET session_id = EXCLUDED.session_id, state_json = EXCLUDED.state_json,
                               updated_at = EXCLUDED.updated_at",
            )
            .bind(&session.student_id)
            .bind(session.subtopic_id)
            .bind(session.id)
            .bind(Json(&NoteState::Pending))
            .bind(Utc::now())
            .execute(&mut *tx)
            .await
            .map_err(conflict)?;
        }

        write_session(&mut tx, session).await?;
        tx.commit().await.map_err(conflict)?;
        Ok(record)
    }
}

async fn write_session(conn: &mut PgConnection, session: &Session) -> Result<()> {
    let updated = sqlx::query(
        "UPDATE sessions SET phase = $2, abandon_reason = $3, state_json = $4, last_activity_at = $5
         WHERE id = $1",
    )
    .bind(session.id)
    .bind(session.phase.as_str())
    .bind(session.abandon_reason.map(|r| r.as_str()))
    .bind(Json(session))
    .bind(session.last_activity_at)
    .execute(conn)
    .await
    .map_err(storage)?;
    if updated.rows_affected() == 0 {
        return Err(TutorError::SessionNotFound(session.id));
    }
    Ok(())
}

/// Records one verdict, creating the row on first use.
async fn upsert_record(
    conn: &mut PgConnection,
    student_id: &str,
    subtopic_id: SubtopicId,
    status: Status,
    flagged: bool,
    completes: bool,
) -> Result<ProgressRecord> {
    let now = Utc::now();
    let row = sqlx::query_as::<_, ProgressRow>(&format!(
        "INSERT INTO progress_records (student_id, subtopic_id, status, attempts, flagged, updated_at, completed_at)
         VALUES ($1, $2, $3, 1, $4, $5, $6)
         ON CONFLICT (student_id, subtopic_id) DO UPDATE SET
             status = EXCLUDED.status,
             attempts = progress_records.attempts + 1,
             flagged = EXCLUDED.flagged,
             updated_at = EXCLUDED.updated_at,
             completed_at = COALESCE(EXCLUDED.completed_at, progress_records.completed_at)
         RETURNING {PROGRESS_COLUMNS}"
    ))
    .bind(student_id)
    .bind(subtopic_id)
    .bind(status.as_str())
    .bind(flagged)
    .bind(now)
    .bind(completes.then_some(now))
    .fetch_one(conn)
    .await
    .map_err(|e| {
        if is_contention(&e) {
            TutorError::ProgressPersistenceConflict {
                student_id: student_id.to_string(),
                subtopic_id,
            }
        } else {
            storage(e)
        }
    })?;
    Ok(ProgressRecord::try_from(row)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tutor_core::curriculum::{CurriculumDocument, import_document};
    use tutor_core::progress::{CurriculumPointer, Note, ProgressUpdate};
    use tutor_core::session::Phase;

    /// Connects to `DATABASE_URL` and starts from empty tables.
    async fn fresh_db() -> Db {
        dotenvy::dotenv().ok();
        let url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set");
        let db = Db::new(PgPool::connect(&url).await.unwrap());
        db.run_migrations().await.unwrap();
        sqlx::query("TRUNCATE lectures, topics, subtopics, students, sessions, progress_records, notes CASCADE")
            .execute(&db.pool)
            .await
            .unwrap();
        db
    }

    fn document() -> CurriculumDocument {
        serde_json::from_str(
            r#"{"lectures": [{"title": "Basics", "topics": [{"title": "Variables", "subtopics": [
                {"title": "Creating Variables"}, {"title": "Variable Types"}, {"title": "Naming"}
            ]}]}]}"#,
        )
        .unwrap()
    }

    #[tokio::test]
    #[ignore = "needs a PostgreSQL database in DATABASE_URL"]
    async fn test_curriculum_round_trip_and_reorder() {
        let db = fresh_db().await;
        let before = db.revision().await.unwrap();
        import_document(&db, document()).await.unwrap();
        let tree = db.snapshot().await.unwrap();
        assert!(tree.revision() > before);
        assert_eq!(tree.counts().subtopics, 3);

        let topic = tree.topics_of(tree.lectures()[0].id).next().unwrap().id;
        let ids: Vec<_> = tree.subtopics_of(topic).map(|s| s.id).collect();
        db.reorder(OrderTarget::Subtopic(ids[2]), 0).await.unwrap();
        let reordered: Vec<_> = db
            .snapshot()
            .await
            .unwrap()
            .subtopics_of(topic)
            .map(|s| (s.id, s.order_index))
            .collect();
        assert_eq!(reordered, vec![(ids[2], 0), (ids[0], 1), (ids[1], 2)]);

        db.delete_subtopic(ids[0]).await.unwrap();
        let err = db.delete_subtopic(ids[0]).await.unwrap_err();
        assert!(matches!(err, TutorError::CurriculumNotFound(_)));
    }

    #[tokio::test]
    #[ignore = "needs a PostgreSQL database in DATABASE_URL"]
    async fn test_commit_writes_record_pointer_and_note() {
        let db = fresh_db().await;
        import_document(&db, document()).await.unwrap();
        let tree = db.snapshot().await.unwrap();
        let tutor_core::curriculum::Cursor::Subtopic(first) = tree.first() else {
            panic!("empty curriculum");
        };

        db.create_student(Student::new("s1", "en", Utc::now())).await.unwrap();
        let mut session = Session::new("s1", first, Utc::now());
        db.insert_session(&session).await.unwrap();
        session.phase = Phase::Completed;

        let record = db
            .commit(TransitionCommit {
                session: session.clone(),
                progress: Some(ProgressUpdate {
                    status: Status::Green,
                    flagged: false,
                    completes: true,
                }),
                pointer: Some(CurriculumPointer::Complete),
                queue_note: true,
            })
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.attempts, 1);
        assert!(record.completed_at.is_some());

        let student = db.get_student("s1").await.unwrap().unwrap();
        assert_eq!(student.pointer, CurriculumPointer::Complete);
        let note = db.get_note("s1", first).await.unwrap().unwrap();
        assert_eq!(note.state, NoteState::Pending);
        assert!(db.open_session_for("s1").await.unwrap().is_none());

        let stale = db
            .resolve_note("s1", first, uuid::Uuid::new_v4(), NoteState::Pending)
            .await
            .unwrap();
        assert!(!stale);

        let pending = db.pending_notes().await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].session_id, session.id);

        let ready = NoteState::Ready {
            note: Note {
                summary: "Covered variables.".to_string(),
                key_points: vec![],
                struggle_points: vec![],
                generated_at: Utc::now(),
            },
        };
        assert!(db.resolve_note("s1", first, session.id, ready).await.unwrap());
        assert!(db.pending_notes().await.unwrap().is_empty());
    }
}
