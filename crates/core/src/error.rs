//! Error Types for the Tutoring Engine
//!
//! Every failure the session engine can surface is a variant of [`TutorError`].
//! Transient kinds (model unavailability, persistence contention) are retried
//! locally before they reach a caller; structural curriculum breakage and
//! exhausted model retries are the only ones a student should ever see.

use crate::curriculum::SubtopicId;
use crate::session::{Phase, SessionId};

/// A specialized `Result` type for engine operations.
pub type Result<T> = std::result::Result<T, TutorError>;

#[derive(Debug, thiserror::Error)]
pub enum TutorError {
    /// A referenced curriculum entity is missing, or one of its parents is.
    #[error("Curriculum entity not found: {0}")]
    CurriculumNotFound(String),

    /// The curriculum changed under a live session in a way the session cannot survive.
    #[error(
        "Curriculum changed during session {session_id}: subtopic {subtopic_id} is no longer reachable. The session was suspended; please restart it."
    )]
    CurriculumInconsistent {
        session_id: SessionId,
        subtopic_id: SubtopicId,
    },

    /// The requested operation is not valid in the session's current phase.
    #[error("Invalid phase transition: cannot {action} while session is in {phase}")]
    InvalidPhaseTransition { phase: Phase, action: String },

    /// The judge reply did not name exactly one verdict. Recovered inside the classifier.
    #[error("Classification reply was ambiguous: {0}")]
    ClassificationAmbiguous(String),

    /// The language model did not answer within the retry budget.
    #[error("Language model unavailable after {attempts} attempts: {message}")]
    LanguageModelUnavailable { attempts: u32, message: String },

    /// Write contention on a progress record.
    #[error("Progress write conflict for student '{student_id}' on subtopic {subtopic_id}")]
    ProgressPersistenceConflict {
        student_id: String,
        subtopic_id: SubtopicId,
    },

    #[error("Session with id '{0}' not found")]
    SessionNotFound(SessionId),

    /// Another turn for the same session is still awaiting the model.
    #[error("Session '{0}' is still processing the previous turn")]
    SessionBusy(SessionId),

    #[error("Student '{0}' has completed the curriculum")]
    CurriculumComplete(String),

    #[error("Prompt template error: {0}")]
    Template(String),

    #[error("Storage error: {0}")]
    Storage(#[from] anyhow::Error),
}

impl TutorError {
    pub fn invalid_transition(phase: Phase, action: impl Into<String>) -> Self {
        Self::InvalidPhaseTransition {
            phase,
            action: action.into(),
        }
    }

    /// Returns `true` if the operation may succeed when retried unchanged.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::LanguageModelUnavailable { .. }
                | Self::ProgressPersistenceConflict { .. }
                | Self::SessionBusy(_)
        )
    }

    /// Returns `true` if the error is meant to be shown to the student.
    pub fn is_user_visible(&self) -> bool {
        matches!(
            self,
            Self::CurriculumInconsistent { .. }
                | Self::LanguageModelUnavailable { .. }
                | Self::CurriculumComplete(_)
        )
    }
}
