//! Axum Handlers for the REST API
//!
//! Each handler validates its input, calls exactly one engine or curriculum
//! operation, and maps the result to a response. No tutoring rule lives here.
//! It uses `utoipa` doc comments to generate OpenAPI documentation.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use std::sync::Arc;
use tracing::{error, warn};
use tutor_core::TutorError;
use tutor_core::curriculum::{LectureId, SubtopicId, TopicId};
use uuid::Uuid;

use crate::{
    models::{
        AnalyticsResponse, CurriculumResponse, DuplicatePayload, EntityResponse, ErrorResponse,
        HealthResponse, LecturePayload, NoteResponse, ProgressResponse, ReorderPayload,
        SessionResponse, StartSessionPayload, SubtopicPayload, TopicPayload, TurnPayload,
    },
    state::AppState,
};

#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    NotFound(String),
    Conflict(String),
    Unavailable(String),
    InternalServerError(anyhow::Error),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::BadRequest(message) => (StatusCode::BAD_REQUEST, message),
            ApiError::NotFound(message) => (StatusCode::NOT_FOUND, message),
            ApiError::Conflict(message) => (StatusCode::CONFLICT, message),
            ApiError::Unavailable(message) => {
                warn!("Service unavailable: {}", message);
                (StatusCode::SERVICE_UNAVAILABLE, message)
            }
            ApiError::InternalServerError(err) => {
                error!("Internal Server Error: {:?}", err);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "An internal server error occurred.".to_string(),
                )
            }
        };
        (status, Json(ErrorResponse { message })).into_response()
    }
}

impl From<TutorError> for ApiError {
    fn from(err: TutorError) -> Self {
        let message = err.to_string();
        match err {
            TutorError::CurriculumNotFound(_) | TutorError::SessionNotFound(_) => {
                Self::NotFound(message)
            }
            TutorError::InvalidPhaseTransition { .. }
            | TutorError::SessionBusy(_)
            | TutorError::CurriculumComplete(_)
            | TutorError::CurriculumInconsistent { .. } => Self::Conflict(message),
            TutorError::LanguageModelUnavailable { .. }
            | TutorError::ProgressPersistenceConflict { .. } => Self::Unavailable(message),
            other => Self::InternalServerError(other.into()),
        }
    }
}

fn require(value: &str, what: &str) -> Result<(), ApiError> {
    if value.trim().is_empty() {
        return Err(ApiError::BadRequest(format!("{what} must not be empty")));
    }
    Ok(())
}

/// Liveness check.
#[utoipa::path(
    get,
    path = "/health",
    responses((status = 200, description = "Service is up", body = HealthResponse))
)]
pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
    })
}

// --- Student sessions ---

/// Start the student's next subtopic, or return the session they already have open.
#[utoipa::path(
    post,
    path = "/sessions",
    request_body = StartSessionPayload,
    responses(
        (status = 200, description = "Session started or resumed", body = SessionResponse),
        (status = 400, description = "Bad request", body = ErrorResponse),
        (status = 404, description = "Curriculum is empty", body = ErrorResponse),
        (status = 409, description = "Curriculum already completed", body = ErrorResponse),
        (status = 503, description = "Language model unavailable", body = ErrorResponse)
    )
)]
pub async fn start_session(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<StartSessionPayload>,
) -> Result<Json<SessionResponse>, ApiError> {
    require(&payload.student_id, "studentId")?;
    let view = state
        .engine
        .start_session(&payload.student_id, payload.language)
        .await?;
    Ok(Json(view.into()))
}

/// Advance a session by one student turn.
#[utoipa::path(
    post,
    path = "/sessions/{id}/turns",
    request_body = TurnPayload,
    responses(
        (status = 200, description = "Tutor reply and resulting phase", body = SessionResponse),
        (status = 400, description = "Bad request", body = ErrorResponse),
        (status = 404, description = "Session not found", body = ErrorResponse),
        (status = 409, description = "Turn not valid in the current phase, or a turn is already in flight", body = ErrorResponse),
        (status = 503, description = "Language model unavailable; the same turn may be retried", body = ErrorResponse)
    ),
    params(("id" = Uuid, Path, description = "Session ID"))
)]
pub async fn respond(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(payload): Json<TurnPayload>,
) -> Result<Json<SessionResponse>, ApiError> {
    if let TurnPayload::Message { text } = &payload {
        require(text, "text")?;
    }
    let view = state.engine.respond(id, payload.into()).await?;
    Ok(Json(view.into()))
}

/// A student's progress records in curriculum order.
#[utoipa::path(
    get,
    path = "/students/{student_id}/progress",
    responses((status = 200, description = "Progress report", body = ProgressResponse)),
    params(("student_id" = String, Path, description = "Student ID"))
)]
pub async fn get_progress(
    State(state): State<Arc<AppState>>,
    Path(student_id): Path<String>,
) -> Result<Json<ProgressResponse>, ApiError> {
    let report = state.engine.get_progress(&student_id).await?;
    Ok(Json(report.into()))
}

/// The study note for a completed subtopic.
#[utoipa::path(
    get,
    path = "/students/{student_id}/notes/{subtopic_id}",
    responses(
        (status = 200, description = "Note, possibly still pending", body = NoteResponse),
        (status = 404, description = "No note for this subtopic", body = ErrorResponse)
    ),
    params(
        ("student_id" = String, Path, description = "Student ID"),
        ("subtopic_id" = i64, Path, description = "Subtopic ID")
    )
)]
pub async fn get_note(
    State(state): State<Arc<AppState>>,
    Path((student_id, subtopic_id)): Path<(String, SubtopicId)>,
) -> Result<Json<NoteResponse>, ApiError> {
    let entry = state
        .engine
        .get_note(&student_id, subtopic_id)
        .await?
        .ok_or_else(|| {
            ApiError::NotFound(format!(
                "No note for student '{}' on subtopic {}",
                student_id, subtopic_id
            ))
        })?;
    Ok(Json(entry.into()))
}

// --- Teacher dashboard ---

/// The full curriculum at its current revision.
#[utoipa::path(
    get,
    path = "/curriculum",
    responses((status = 200, description = "Curriculum snapshot", body = CurriculumResponse))
)]
pub async fn get_curriculum(
    State(state): State<Arc<AppState>>,
) -> Result<Json<CurriculumResponse>, ApiError> {
    let tree = state.engine.get_curriculum_snapshot().await?;
    Ok(Json((&tree).into()))
}

/// Engagement figures across all students.
#[utoipa::path(
    get,
    path = "/analytics",
    responses((status = 200, description = "Engagement summary", body = AnalyticsResponse))
)]
pub async fn get_analytics(
    State(state): State<Arc<AppState>>,
) -> Result<Json<AnalyticsResponse>, ApiError> {
    let analytics = state.engine.get_analytics().await?;
    Ok(Json(analytics.into()))
}

// --- Curriculum authoring ---

/// Append a lecture.
#[utoipa::path(
    post,
    path = "/curriculum/lectures",
    request_body = LecturePayload,
    responses(
        (status = 201, description = "Lecture created", body = EntityResponse),
        (status = 400, description = "Bad request", body = ErrorResponse)
    )
)]
pub async fn create_lecture(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<LecturePayload>,
) -> Result<impl IntoResponse, ApiError> {
    require(&payload.title, "title")?;
    let lecture = state.curriculum.create_lecture(payload.into()).await?;
    Ok((StatusCode::CREATED, Json(EntityResponse::from(lecture))))
}

/// Replace a lecture's fields.
#[utoipa::path(
    put,
    path = "/curriculum/lectures/{id}",
    request_body = LecturePayload,
    responses(
        (status = 200, description = "Lecture updated", body = EntityResponse),
        (status = 404, description = "Lecture not found", body = ErrorResponse)
    ),
    params(("id" = i64, Path, description = "Lecture ID"))
)]
pub async fn update_lecture(
    State(state): State<Arc<AppState>>,
    Path(id): Path<LectureId>,
    Json(payload): Json<LecturePayload>,
) -> Result<Json<EntityResponse>, ApiError> {
    require(&payload.title, "title")?;
    let lecture = state.curriculum.update_lecture(id, payload.into()).await?;
    Ok(Json(lecture.into()))
}

/// Delete a lecture with all of its topics and subtopics.
#[utoipa::path(
    delete,
    path = "/curriculum/lectures/{id}",
    responses(
        (status = 204, description = "Lecture deleted"),
        (status = 404, description = "Lecture not found", body = ErrorResponse)
    ),
    params(("id" = i64, Path, description = "Lecture ID"))
)]
pub async fn delete_lecture(
    State(state): State<Arc<AppState>>,
    Path(id): Path<LectureId>,
) -> Result<StatusCode, ApiError> {
    state.curriculum.delete_lecture(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Copy a lecture with everything under it.
#[utoipa::path(
    post,
    path = "/curriculum/lectures/{id}/duplicate",
    request_body = DuplicatePayload,
    responses(
        (status = 201, description = "Copy created", body = EntityResponse),
        (status = 404, description = "Lecture not found", body = ErrorResponse)
    ),
    params(("id" = i64, Path, description = "Lecture ID"))
)]
pub async fn duplicate_lecture(
    State(state): State<Arc<AppState>>,
    Path(id): Path<LectureId>,
    Json(payload): Json<DuplicatePayload>,
) -> Result<impl IntoResponse, ApiError> {
    require(&payload.title, "title")?;
    let copy = state.curriculum.duplicate_lecture(id, payload.title).await?;
    Ok((StatusCode::CREATED, Json(EntityResponse::from(copy))))
}

/// Append a topic to a lecture.
#[utoipa::path(
    post,
    path = "/curriculum/lectures/{id}/topics",
    request_body = TopicPayload,
    responses(
        (status = 201, description = "Topic created", body = EntityResponse),
        (status = 404, description = "Lecture not found", body = ErrorResponse)
    ),
    params(("id" = i64, Path, description = "Lecture ID"))
)]
pub async fn create_topic(
    State(state): State<Arc<AppState>>,
    Path(lecture_id): Path<LectureId>,
    Json(payload): Json<TopicPayload>,
) -> Result<impl IntoResponse, ApiError> {
    require(&payload.title, "title")?;
    let topic = state.curriculum.create_topic(lecture_id, payload.into()).await?;
    Ok((StatusCode::CREATED, Json(EntityResponse::from(topic))))
}

#[utoipa::path(
    put,
    path = "/curriculum/topics/{id}",
    request_body = TopicPayload,
    responses(
        (status = 200, description = "Topic updated", body = EntityResponse),
        (status = 404, description = "Topic not found", body = ErrorResponse)
    ),
    params(("id" = i64, Path, description = "Topic ID"))
)]
pub async fn update_topic(
    State(state): State<Arc<AppState>>,
    Path(id): Path<TopicId>,
    Json(payload): Json<TopicPayload>,
) -> Result<Json<EntityResponse>, ApiError> {
    require(&payload.title, "title")?;
    let topic = state.curriculum.update_topic(id, payload.into()).await?;
    Ok(Json(topic.into()))
}

#[utoipa::path(
    delete,
    path = "/curriculum/topics/{id}",
    responses(
        (status = 204, description = "Topic deleted"),
        (status = 404, description = "Topic not found", body = ErrorResponse)
    ),
    params(("id" = i64, Path, description = "Topic ID"))
)]
pub async fn delete_topic(
    State(state): State<Arc<AppState>>,
    Path(id): Path<TopicId>,
) -> Result<StatusCode, ApiError> {
    state.curriculum.delete_topic(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Append a subtopic to a topic.
#[utoipa::path(
    post,
    path = "/curriculum/topics/{id}/subtopics",
    request_body = SubtopicPayload,
    responses(
        (status = 201, description = "Subtopic created", body = EntityResponse),
        (status = 404, description = "Topic not found", body = ErrorResponse)
    ),
    params(("id" = i64, Path, description = "Topic ID"))
)]
pub async fn create_subtopic(
    State(state): State<Arc<AppState>>,
    Path(topic_id): Path<TopicId>,
    Json(payload): Json<SubtopicPayload>,
) -> Result<impl IntoResponse, ApiError> {
    require(&payload.title, "title")?;
    let subtopic = state.curriculum.create_subtopic(topic_id, payload.into()).await?;
    Ok((StatusCode::CREATED, Json(EntityResponse::from(subtopic))))
}

#[utoipa::path(
    put,
    path = "/curriculum/subtopics/{id}",
    request_body = SubtopicPayload,
    responses(
        (status = 200, description = "Subtopic updated", body = EntityResponse),
        (status = 404, description = "Subtopic not found", body = ErrorResponse)
    ),
    params(("id" = i64, Path, description = "Subtopic ID"))
)]
pub async fn update_subtopic(
    State(state): State<Arc<AppState>>,
    Path(id): Path<SubtopicId>,
    Json(payload): Json<SubtopicPayload>,
) -> Result<Json<EntityResponse>, ApiError> {
    require(&payload.title, "title")?;
    let subtopic = state.curriculum.update_subtopic(id, payload.into()).await?;
    Ok(Json(subtopic.into()))
}

/// Delete a subtopic. Sessions on it are suspended at their next turn.
#[utoipa::path(
    delete,
    path = "/curriculum/subtopics/{id}",
    responses(
        (status = 204, description = "Subtopic deleted"),
        (status = 404, description = "Subtopic not found", body = ErrorResponse)
    ),
    params(("id" = i64, Path, description = "Subtopic ID"))
)]
pub async fn delete_subtopic(
    State(state): State<Arc<AppState>>,
    Path(id): Path<SubtopicId>,
) -> Result<StatusCode, ApiError> {
    state.curriculum.delete_subtopic(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Move a lecture, topic or subtopic among its siblings.
#[utoipa::path(
    post,
    path = "/curriculum/reorder",
    request_body = ReorderPayload,
    responses(
        (status = 204, description = "Order updated"),
        (status = 404, description = "Entity not found", body = ErrorResponse)
    )
)]
pub async fn reorder(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<ReorderPayload>,
) -> Result<StatusCode, ApiError> {
    state
        .curriculum
        .reorder(payload.target(), payload.index)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tutor_core::session::Phase;

    fn status_of(err: TutorError) -> StatusCode {
        ApiError::from(err).into_response().status()
    }

    #[test]
    fn test_error_status_mapping() {
        let sid = Uuid::new_v4();
        assert_eq!(
            status_of(TutorError::CurriculumNotFound("subtopic 9".into())),
            StatusCode::NOT_FOUND
        );
        assert_eq!(status_of(TutorError::SessionNotFound(sid)), StatusCode::NOT_FOUND);
        assert_eq!(
            status_of(TutorError::invalid_transition(Phase::Completed, "respond")),
            StatusCode::CONFLICT
        );
        assert_eq!(status_of(TutorError::SessionBusy(sid)), StatusCode::CONFLICT);
        assert_eq!(
            status_of(TutorError::CurriculumComplete("s1".into())),
            StatusCode::CONFLICT
        );
        assert_eq!(
            status_of(TutorError::CurriculumInconsistent {
                session_id: sid,
                subtopic_id: 3
            }),
            StatusCode::CONFLICT
        );
        assert_eq!(
            status_of(TutorError::LanguageModelUnavailable {
                attempts: 4,
                message: "timeout".into()
            }),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            status_of(TutorError::Template("missing judge".into())),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(
            status_of(TutorError::Storage(anyhow::anyhow!("disk full"))),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_require_rejects_blank() {
        assert!(require("  ", "title").is_err());
        assert!(require("Loops", "title").is_ok());
    }
}
