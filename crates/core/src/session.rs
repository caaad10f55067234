//! Session state.
//!
//! A session is one student's conversation about one subtopic. Its phase moves
//! Introduction → Explanation ⇄ Assessment → Completed, or to Abandoned when
//! the student goes idle or the curriculum breaks underneath it.

use crate::curriculum::SubtopicId;
use crate::progress::{ProgressRecord, ProgressSummary};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

pub type SessionId = Uuid;
pub type StudentId = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Phase {
    Introduction,
    Explanation,
    Assessment,
    Completed,
    Abandoned,
}

impl Phase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Phase::Completed | Phase::Abandoned)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Introduction => "introduction",
            Phase::Explanation => "explanation",
            Phase::Assessment => "assessment",
            Phase::Completed => "completed",
            Phase::Abandoned => "abandoned",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "introduction" => Some(Phase::Introduction),
            "explanation" => Some(Phase::Explanation),
            "assessment" => Some(Phase::Assessment),
            "completed" => Some(Phase::Completed),
            "abandoned" => Some(Phase::Abandoned),
            _ => None,
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Introduction => "Introduction",
            Phase::Explanation => "Explanation",
            Phase::Assessment => "Assessment",
            Phase::Completed => "Completed",
            Phase::Abandoned => "Abandoned",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Speaker {
    Student,
    Tutor,
}

impl fmt::Display for Speaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Speaker::Student => write!(f, "student"),
            Speaker::Tutor => write!(f, "tutor"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Turn {
    pub speaker: Speaker,
    pub text: String,
    pub at: DateTime<Utc>,
}

impl Turn {
    pub fn new(speaker: Speaker, text: impl Into<String>, at: DateTime<Utc>) -> Self {
        Self {
            speaker,
            text: text.into(),
            at,
        }
    }
}

/// Why a session left the active phases without completing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AbandonReason {
    /// Resumable: the student comes back to the phase they left.
    InactivityTimeout,
    /// Not resumable automatically; a teacher has to repair the curriculum.
    CurriculumInconsistent,
}

impl AbandonReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            AbandonReason::InactivityTimeout => "inactivity_timeout",
            AbandonReason::CurriculumInconsistent => "curriculum_inconsistent",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "inactivity_timeout" => Some(AbandonReason::InactivityTimeout),
            "curriculum_inconsistent" => Some(AbandonReason::CurriculumInconsistent),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub id: SessionId,
    pub student_id: StudentId,
    pub subtopic_id: SubtopicId,
    pub phase: Phase,
    pub turns: Vec<Turn>,
    /// The phase an abandoned session returns to on resume.
    pub suspended_phase: Option<Phase>,
    pub abandon_reason: Option<AbandonReason>,
    /// Consecutive judge replies that named no verdict.
    pub unparseable_streak: u32,
    /// Rationale of the latest verdict, carried into re-explanation and notes.
    pub last_rationale: Option<String>,
    /// Rationales of Red and Yellow verdicts, in order.
    #[serde(default)]
    pub struggles: Vec<String>,
    /// Set once any verdict in this session was soft-failed or forced.
    #[serde(default)]
    pub flagged: bool,
    pub created_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
}

impl Session {
    pub fn new(student_id: impl Into<StudentId>, subtopic_id: SubtopicId, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            student_id: student_id.into(),
            subtopic_id,
            phase: Phase::Introduction,
            turns: Vec::new(),
            suspended_phase: None,
            abandon_reason: None,
            unparseable_streak: 0,
            last_rationale: None,
            struggles: Vec::new(),
            flagged: false,
            created_at: now,
            last_activity_at: now,
        }
    }

    pub fn push_turn(&mut self, speaker: Speaker, text: impl Into<String>, at: DateTime<Utc>) {
        self.turns.push(Turn::new(speaker, text, at));
        self.last_activity_at = at;
    }

    pub fn last_tutor_turn(&self) -> Option<&Turn> {
        self.turns.iter().rev().find(|t| t.speaker == Speaker::Tutor)
    }

    pub fn last_student_turn(&self) -> Option<&Turn> {
        self.turns.iter().rev().find(|t| t.speaker == Speaker::Student)
    }

    pub fn is_idle(&self, now: DateTime<Utc>, timeout: chrono::Duration) -> bool {
        !self.phase.is_terminal() && now - self.last_activity_at >= timeout
    }

    /// Moves the session to Abandoned, remembering the phase it was in.
    pub fn abandon(&mut self, reason: AbandonReason) {
        if self.phase.is_terminal() {
            return;
        }
        self.suspended_phase = Some(self.phase);
        self.abandon_reason = Some(reason);
        self.phase = Phase::Abandoned;
    }

    /// Returns an idle-abandoned session to the phase it left. Transcript
    /// and everything else stay untouched.
    pub fn resume(&mut self, now: DateTime<Utc>) -> bool {
        if self.abandon_reason != Some(AbandonReason::InactivityTimeout) {
            return false;
        }
        let Some(phase) = self.suspended_phase.take() else {
            return false;
        };
        self.phase = phase;
        self.abandon_reason = None;
        self.last_activity_at = now;
        true
    }
}

/// What the transport layer sends for one student turn.
///
/// Readiness to be assessed is a distinct signal, never inferred from the
/// text of an ordinary message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StudentInput {
    Message { text: String },
    Ready,
}

impl StudentInput {
    pub fn message(text: impl Into<String>) -> Self {
        StudentInput::Message { text: text.into() }
    }
}

/// The response of every engine operation that advances a session.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionView {
    pub session_id: SessionId,
    pub student_id: StudentId,
    pub subtopic_id: SubtopicId,
    pub subtopic_title: String,
    pub topic_title: String,
    pub lecture_title: String,
    pub phase: Phase,
    pub reply: String,
    pub transcript_length: usize,
    /// Present when this turn wrote a progress record.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress: Option<ProgressRecord>,
    pub summary: ProgressSummary,
    /// True when the session resumed rather than started fresh.
    pub resumed: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_terminal() {
        assert!(Phase::Completed.is_terminal());
        assert!(Phase::Abandoned.is_terminal());
        assert!(!Phase::Introduction.is_terminal());
        assert!(!Phase::Explanation.is_terminal());
        assert!(!Phase::Assessment.is_terminal());
    }

    #[test]
    fn test_phase_string_forms() {
        for phase in [
            Phase::Introduction,
            Phase::Explanation,
            Phase::Assessment,
            Phase::Completed,
            Phase::Abandoned,
        ] {
            assert_eq!(Phase::parse(phase.as_str()), Some(phase));
        }
        assert_eq!(Phase::parse("bogus"), None);
        assert_eq!(Phase::Explanation.to_string(), "Explanation");
    }

    #[test]
    fn test_abandon_then_resume_restores_phase_and_transcript() {
        let now = Utc::now();
        let mut session = Session::new("s1", 1, now);
        session.phase = Phase::Assessment;
        session.push_turn(Speaker::Tutor, "What is a variable?", now);

        session.abandon(AbandonReason::InactivityTimeout);
        assert_eq!(session.phase, Phase::Abandoned);
        assert_eq!(session.suspended_phase, Some(Phase::Assessment));

        assert!(session.resume(now));
        assert_eq!(session.phase, Phase::Assessment);
        assert_eq!(session.turns.len(), 1);
        assert_eq!(session.suspended_phase, None);
    }

    #[test]
    fn test_inconsistent_sessions_do_not_resume() {
        let now = Utc::now();
        let mut session = Session::new("s1", 1, now);
        session.phase = Phase::Explanation;
        session.abandon(AbandonReason::CurriculumInconsistent);
        assert!(!session.resume(now));
        assert_eq!(session.phase, Phase::Abandoned);
        assert_eq!(session.suspended_phase, Some(Phase::Explanation));
    }

    #[test]
    fn test_idle_detection() {
        let start = Utc::now();
        let session = Session::new("s1", 1, start);
        let timeout = chrono::Duration::seconds(60);
        assert!(!session.is_idle(start + chrono::Duration::seconds(59), timeout));
        assert!(session.is_idle(start + chrono::Duration::seconds(60), timeout));
    }

    #[test]
    fn test_student_input_wire_format() {
        let ready: StudentInput = serde_json::from_str(r#"{"type":"ready"}"#).unwrap();
        assert_eq!(ready, StudentInput::Ready);
        let msg: StudentInput =
            serde_json::from_str(r#"{"type":"message","text":"why?"}"#).unwrap();
        assert_eq!(msg, StudentInput::message("why?"));
    }
}
