//! Axum Router Configuration
//!
//! This module defines the complete HTTP routing for the application:
//! the student session endpoints, the curriculum authoring endpoints used by
//! the teacher dashboard, and the OpenAPI documentation.

use crate::{
    handlers,
    models::{
        AnalyticsResponse, CodeExamplePayload, CountsResponse, CurriculumResponse,
        DuplicatePayload, EntityKind, EntityResponse, ErrorResponse, HealthResponse,
        LecturePayload, NoteResponse, PointerResponse, ProgressRecordResponse, ProgressResponse,
        ReorderPayload, SessionResponse, StartSessionPayload, StatusDistributionResponse,
        SubtopicPayload, SummaryResponse, TopicPayload, TurnPayload,
    },
    state::AppState,
};

use axum::{
    Router,
    routing::{get, post, put},
};
use std::sync::Arc;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

#[derive(OpenApi)]
#[openapi(
    paths(
        handlers::health,
        handlers::start_session,
        handlers::respond,
        handlers::get_progress,
        handlers::get_note,
        handlers::get_curriculum,
        handlers::get_analytics,
        handlers::create_lecture,
        handlers::update_lecture,
        handlers::delete_lecture,
        handlers::duplicate_lecture,
        handlers::create_topic,
        handlers::update_topic,
        handlers::delete_topic,
        handlers::create_subtopic,
        handlers::update_subtopic,
        handlers::delete_subtopic,
        handlers::reorder,
    ),
    components(
        schemas(
            StartSessionPayload, TurnPayload, SessionResponse, SummaryResponse,
            ProgressRecordResponse, ProgressResponse, PointerResponse, NoteResponse,
            CurriculumResponse, CountsResponse, AnalyticsResponse, StatusDistributionResponse,
            LecturePayload, TopicPayload, SubtopicPayload, CodeExamplePayload,
            ReorderPayload, EntityKind, DuplicatePayload, EntityResponse,
            ErrorResponse, HealthResponse
        )
    ),
    tags(
        (name = "Tutor API", description = "Curriculum-driven tutoring sessions and curriculum authoring")
    )
)]
pub struct ApiDoc;

/// Creates the main Axum router for the application.
pub fn create_router(app_state: Arc<AppState>) -> Router {
    let api_router = Router::new()
        .route("/health", get(handlers::health))
        .route("/sessions", post(handlers::start_session))
        .route("/sessions/{id}/turns", post(handlers::respond))
        .route(
            "/students/{student_id}/progress",
            get(handlers::get_progress),
        )
        .route(
            "/students/{student_id}/notes/{subtopic_id}",
            get(handlers::get_note),
        )
        .route("/analytics", get(handlers::get_analytics))
        .route("/curriculum", get(handlers::get_curriculum))
        .route("/curriculum/reorder", post(handlers::reorder))
        .route("/curriculum/lectures", post(handlers::create_lecture))
        .route(
            "/curriculum/lectures/{id}",
            put(handlers::update_lecture).delete(handlers::delete_lecture),
        )
        .route(
            "/curriculum/lectures/{id}/topics",
            post(handlers::create_topic),
        )
        .route(
            "/curriculum/lectures/{id}/duplicate",
            post(handlers::duplicate_lecture),
        )
        .route(
            "/curriculum/topics/{id}",
            put(handlers::update_topic).delete(handlers::delete_topic),
        )
        .route(
            "/curriculum/topics/{id}/subtopics",
            post(handlers::create_subtopic),
        )
        .route(
            "/curriculum/subtopics/{id}",
            put(handlers::update_subtopic).delete(handlers::delete_subtopic),
        )
        .with_state(app_state);

    Router::new()
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()))
        .merge(api_router)
}
