//! Session Engine
//!
//! Drives one student's conversation about one subtopic through
//! Introduction → Explanation ⇄ Assessment → Completed, deciding every phase
//! transition and curriculum advance.
//!
//! Each turn works on a private copy of the session. Model calls happen first;
//! only once every call a turn needs has succeeded is the result written, as a
//! single [`TransitionCommit`]. A failed turn therefore leaves the stored
//! session exactly as it was and the student can send the same turn again.

use crate::analytics::{Analytics, AnalyticsAggregator};
use crate::classifier::{AssessmentExchange, UnderstandingClassifier};
use crate::config::EngineConfig;
use crate::curriculum::{CurriculumStore, CurriculumTree, Cursor, ResolvedSubtopic, SubtopicId};
use crate::error::{Result, TutorError};
use crate::llm_client::{LanguageModel, Prompt, RetryPolicy, complete_with_retry};
use crate::locks::KeyedLocks;
use crate::notes::{NoteGenerator, NoteJob};
use crate::progress::{
    CurriculumPointer, NoteEntry, ProgressRecord, ProgressStore, ProgressSummary, ProgressUpdate,
    Status, Student, TransitionCommit,
};
use crate::prompt::{Directive, PromptComposer, PromptContext, PromptTemplates, strip_ready_marker};
use crate::session::{
    AbandonReason, Phase, Session, SessionId, SessionView, Speaker, StudentId, StudentInput,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{info, instrument, warn};

/// Extra commit attempts after a `ProgressPersistenceConflict`.
const COMMIT_RETRIES: u32 = 5;
const COMMIT_BACKOFF: Duration = Duration::from_millis(20);

/// A student's progress in curriculum order.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressReport {
    pub student_id: StudentId,
    pub pointer: CurriculumPointer,
    pub records: Vec<ProgressRecord>,
    pub summary: ProgressSummary,
}

/// The outcome of one turn before it is persisted.
struct TurnOutcome {
    reply: String,
    progress: Option<ProgressUpdate>,
    pointer: Option<CurriculumPointer>,
    queue_note: bool,
}

impl TurnOutcome {
    fn reply(reply: String) -> Self {
        Self {
            reply,
            progress: None,
            pointer: None,
            queue_note: false,
        }
    }
}

pub struct SessionEngine {
    config: EngineConfig,
    policy: RetryPolicy,
    curriculum: Arc<dyn CurriculumStore>,
    progress: Arc<dyn ProgressStore>,
    model: Arc<dyn LanguageModel>,
    composer: PromptComposer,
    classifier: UnderstandingClassifier,
    notes: Arc<NoteGenerator>,
    analytics: AnalyticsAggregator,
    /// Serialises `start_session` per student.
    student_locks: KeyedLocks<StudentId>,
    /// Held for the whole of a turn; a second turn is rejected, not queued.
    session_locks: KeyedLocks<SessionId>,
    note_jobs: Mutex<Vec<JoinHandle<()>>>,
}

impl SessionEngine {
    pub fn new(
        config: EngineConfig,
        curriculum: Arc<dyn CurriculumStore>,
        progress: Arc<dyn ProgressStore>,
        model: Arc<dyn LanguageModel>,
        templates: PromptTemplates,
    ) -> Self {
        let policy = config.retry_policy();
        Self {
            classifier: UnderstandingClassifier::new(model.clone(), templates.clone(), policy),
            notes: Arc::new(NoteGenerator::new(
                model.clone(),
                templates.clone(),
                policy,
                config.max_note_retries,
            )),
            analytics: AnalyticsAggregator::new(progress.clone()),
            composer: PromptComposer::new(templates),
            config,
            policy,
            curriculum,
            progress,
            model,
            student_locks: KeyedLocks::new(),
            session_locks: KeyedLocks::new(),
            note_jobs: Mutex::new(Vec::new()),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    // --- Student-facing operations ---

    /// Starts the student's next subtopic, or picks up the session they
    /// already have open.
    ///
    /// A student seen for the first time is registered with `language`, or
    /// the configured default.
    #[instrument(skip(self, language), fields(session_id, subtopic_id))]
    pub async fn start_session(
        &self,
        student_id: &str,
        language: Option<String>,
    ) -> Result<SessionView> {
        let _student_guard = self.student_locks.lock(&student_id.to_string()).await;
        let now = Utc::now();

        let student = match self.progress.get_student(student_id).await? {
            Some(student) => student,
            None => {
                let language = language.unwrap_or_else(|| self.config.default_language.clone());
                info!(%language, "Registering new student");
                self.progress
                    .create_student(Student::new(student_id, language, now))
                    .await?
            }
        };
        let tree = self.curriculum.snapshot().await?;

        if let Some(open) = self.progress.open_session_for(student_id).await? {
            return self.reopen(open, &tree, now).await;
        }

        let subtopic_id = self.next_subtopic_for(&student, &tree).await?;
        tracing::Span::current().record("subtopic_id", subtopic_id);
        let resolved = tree.resolve(subtopic_id)?;

        let mut session = Session::new(student_id, subtopic_id, now);
        tracing::Span::current().record("session_id", &session.id.to_string());
        let prompt = self.composer.compose(
            Phase::Introduction,
            &PromptContext {
                subtopic: resolved,
                history: &[],
                language: &student.preferred_language,
                directive: None,
            },
        )?;
        let (reply, _) = strip_ready_marker(&self.complete(&prompt).await?);
        session.push_turn(Speaker::Tutor, reply.clone(), Utc::now());
        session.phase = Phase::Explanation;

        self.progress.insert_session(&session).await?;
        self.persist(TransitionCommit {
            session: session.clone(),
            progress: None,
            pointer: (student.pointer != CurriculumPointer::At(subtopic_id))
                .then_some(CurriculumPointer::At(subtopic_id)),
            queue_note: false,
        })
        .await?;
        info!(title = %resolved.subtopic.title, "Session started");

        self.view(&session, &tree, reply, None, false).await
    }

    /// Advances a session by exactly one turn.
    #[instrument(skip(self, input), fields(student_id, subtopic_id))]
    pub async fn respond(&self, session_id: SessionId, input: StudentInput) -> Result<SessionView> {
        let _turn_guard = self
            .session_locks
            .try_lock(&session_id)
            .ok_or(TutorError::SessionBusy(session_id))?;

        let mut session = self
            .progress
            .get_session(session_id)
            .await?
            .ok_or(TutorError::SessionNotFound(session_id))?;
        tracing::Span::current().record("student_id", session.student_id.as_str());
        tracing::Span::current().record("subtopic_id", session.subtopic_id);

        let now = Utc::now();
        if session.phase.is_terminal() {
            return Err(TutorError::invalid_transition(session.phase, "respond"));
        }
        if session.is_idle(now, self.config.inactivity_timeout()) {
            session.abandon(AbandonReason::InactivityTimeout);
            session.resume(now);
            info!(phase = %session.phase, "Turn arrived after the inactivity timeout; session resumed");
        }

        let tree = self.curriculum.snapshot().await?;
        if tree.resolve(session.subtopic_id).is_err() {
            return Err(self.abandon_inconsistent(session).await);
        }
        let language = self.language_of(&session.student_id).await?;

        let mut outcome = match (session.phase, input) {
            (Phase::Explanation, StudentInput::Message { text }) => {
                session.push_turn(Speaker::Student, text, now);
                self.explain(&mut session, &tree, &language).await?
            }
            (Phase::Explanation, StudentInput::Ready) => {
                session.last_activity_at = now;
                self.ask_question(&mut session, &tree, &language, None).await?
            }
            (Phase::Assessment, StudentInput::Message { text }) => {
                session.push_turn(Speaker::Student, text, now);
                self.assess(&mut session, &tree, &language).await?
            }
            (phase, StudentInput::Ready) => {
                return Err(TutorError::invalid_transition(phase, "signal readiness"));
            }
            (phase, StudentInput::Message { .. }) => {
                return Err(TutorError::invalid_transition(phase, "respond"));
            }
        };

        // The curriculum may have changed while we were waiting on the model.
        let Some(tree) = self.recheck_curriculum(&session, tree).await else {
            return Err(self.abandon_inconsistent(session).await);
        };

        let completed = session.phase == Phase::Completed;
        if completed {
            outcome.pointer = Some(pointer_for(tree.next(session.subtopic_id)?));
        }
        let record = self
            .persist(TransitionCommit {
                session: session.clone(),
                progress: outcome.progress,
                pointer: outcome.pointer,
                queue_note: outcome.queue_note,
            })
            .await?;

        if completed {
            self.queue_note(&session, &tree);
        }

        self.view(&session, &tree, outcome.reply, record, false).await
    }

    /// Progress records in curriculum order, with completion figures.
    #[instrument(skip(self))]
    pub async fn get_progress(&self, student_id: &str) -> Result<ProgressReport> {
        let tree = self.curriculum.snapshot().await?;
        let pointer = self
            .progress
            .get_student(student_id)
            .await?
            .map(|s| s.pointer)
            .unwrap_or(CurriculumPointer::NotStarted);
        let records = self.progress.list_for_student(student_id, &tree).await?;
        let summary = ProgressSummary::compute(&records, &tree);
        Ok(ProgressReport {
            student_id: student_id.to_string(),
            pointer,
            records,
            summary,
        })
    }

    pub async fn get_note(&self, student_id: &str, subtopic_id: SubtopicId) -> Result<Option<NoteEntry>> {
        self.progress.get_note(student_id, subtopic_id).await
    }

    // --- Teacher-facing reads ---

    pub async fn get_curriculum_snapshot(&self) -> Result<CurriculumTree> {
        self.curriculum.snapshot().await
    }

    pub async fn get_analytics(&self) -> Result<Analytics> {
        let engagement = self.analytics.engagement_summary().await?;
        let curriculum = self.curriculum.snapshot().await?.counts();
        Ok(Analytics {
            engagement,
            curriculum,
        })
    }

    // --- Housekeeping ---

    /// Abandons every active session idle for longer than the inactivity
    /// timeout. Sessions with a turn in flight are skipped. Returns how many
    /// were abandoned.
    #[instrument(skip(self))]
    pub async fn expire_idle_sessions(&self, now: DateTime<Utc>) -> Result<usize> {
        let timeout = self.config.inactivity_timeout();
        let mut expired = 0;
        for candidate in self.progress.list_active_sessions().await? {
            if !candidate.is_idle(now, timeout) {
                continue;
            }
            let Some(_guard) = self.session_locks.try_lock(&candidate.id) else {
                continue;
            };
            let Some(mut session) = self.progress.get_session(candidate.id).await? else {
                continue;
            };
            if !session.is_idle(now, timeout) {
                continue;
            }
            session.abandon(AbandonReason::InactivityTimeout);
            self.progress.save_session(&session).await?;
            info!(session_id = %session.id, student_id = %session.student_id, phase = ?session.suspended_phase, "Session abandoned for inactivity");
            expired += 1;
        }
        Ok(expired)
    }

    /// Waits for every note generation started so far.
    pub async fn drain_note_jobs(&self) {
        let jobs = {
            let mut jobs = self.note_jobs.lock().unwrap_or_else(|e| e.into_inner());
            std::mem::take(&mut *jobs)
        };
        if jobs.is_empty() {
            return;
        }
        info!(count = jobs.len(), "Waiting for note generation to finish");
        for result in futures::future::join_all(jobs).await {
            if let Err(e) = result {
                warn!(error = %e, "Note generation task did not finish cleanly");
            }
        }
    }

    /// Restarts generation for notes left pending by a previous process.
    pub async fn resume_note_jobs(&self) -> Result<usize> {
        let pending = self.progress.pending_notes().await?;
        if pending.is_empty() {
            return Ok(0);
        }
        let tree = self.curriculum.snapshot().await?;
        let mut resumed = 0;
        for entry in pending {
            let Some(session) = self.progress.get_session(entry.session_id).await? else {
                warn!(session_id = %entry.session_id, "Pending note has no session; skipping");
                continue;
            };
            if tree.resolve(session.subtopic_id).is_err() {
                warn!(session_id = %session.id, subtopic_id = session.subtopic_id, "Pending note names a removed subtopic; skipping");
                continue;
            }
            self.queue_note(&session, &tree);
            resumed += 1;
        }
        Ok(resumed)
    }

    // --- Phase handlers ---

    /// One Explanation exchange. Moves to Assessment if the model proposes it.
    async fn explain(
        &self,
        session: &mut Session,
        tree: &CurriculumTree,
        language: &str,
    ) -> Result<TurnOutcome> {
        let resolved = tree.resolve(session.subtopic_id)?;
        let directive = self.remediation_directive(session).await?;
        let prompt = self.composer.compose(
            Phase::Explanation,
            &PromptContext {
                subtopic: resolved,
                history: &session.turns,
                language,
                directive: directive.as_ref(),
            },
        )?;
        let (reply, ready) = strip_ready_marker(&self.complete(&prompt).await?);
        session.push_turn(Speaker::Tutor, reply.clone(), Utc::now());

        if !ready {
            return Ok(TurnOutcome::reply(reply));
        }
        info!("Model proposed assessment");
        self.ask_question(session, tree, language, Some(reply)).await
    }

    /// Asks the assessment question and enters Assessment. `lead` is tutor
    /// text already produced this turn, delivered ahead of the question.
    async fn ask_question(
        &self,
        session: &mut Session,
        tree: &CurriculumTree,
        language: &str,
        lead: Option<String>,
    ) -> Result<TurnOutcome> {
        let resolved = tree.resolve(session.subtopic_id)?;
        let prompt = self.composer.compose(
            Phase::Assessment,
            &PromptContext {
                subtopic: resolved,
                history: &session.turns,
                language,
                directive: None,
            },
        )?;
        let (question, _) = strip_ready_marker(&self.complete(&prompt).await?);
        session.push_turn(Speaker::Tutor, question.clone(), Utc::now());
        session.phase = Phase::Assessment;
        info!(from = %Phase::Explanation, to = %Phase::Assessment, "Phase transition");

        let reply = match lead {
            Some(lead) => format!("{lead}\n\n{question}"),
            None => question,
        };
        Ok(TurnOutcome::reply(reply))
    }

    /// Grades the student's answer and either completes the subtopic or loops
    /// back to Explanation with remediation.
    async fn assess(
        &self,
        session: &mut Session,
        tree: &CurriculumTree,
        language: &str,
    ) -> Result<TurnOutcome> {
        let resolved = tree.resolve(session.subtopic_id)?;
        let answer = session
            .last_student_turn()
            .map(|t| t.text.clone())
            .unwrap_or_default();
        let question = session
            .turns
            .iter()
            .rev()
            .skip(1)
            .find(|t| t.speaker == Speaker::Tutor)
            .map(|t| t.text.clone())
            .unwrap_or_default();

        let classification = self
            .classifier
            .classify(
                &AssessmentExchange {
                    subtopic: resolved,
                    question: &question,
                    answer: &answer,
                },
                session.unparseable_streak,
            )
            .await?;

        session.unparseable_streak = if classification.was_parsed() {
            0
        } else {
            session.unparseable_streak + 1
        };
        session.last_rationale = Some(classification.rationale.clone());
        if classification.status != Status::Green {
            session.struggles.push(classification.rationale.clone());
        }

        let prior_attempts = self
            .progress
            .get(&session.student_id, session.subtopic_id)
            .await?
            .attempts;
        let status = classification.status;
        let (completes, flagged) = match status {
            Status::Green => (true, classification.flagged),
            Status::Yellow if prior_attempts < self.config.retry_limit_for_yellow => {
                (false, classification.flagged)
            }
            Status::Yellow => (true, true),
            Status::Red | Status::NotStarted => (false, classification.flagged),
        };
        let flagged = flagged || session.flagged;
        session.flagged = flagged;
        info!(
            %status,
            confidence = classification.confidence,
            flagged,
            prior_attempts,
            completes,
            "Assessment graded"
        );

        let progress = ProgressUpdate {
            status,
            flagged,
            completes,
        };
        if completes {
            self.wrap_up(session, tree, resolved, language, progress).await
        } else {
            self.remediate(session, resolved, language, progress, classification.rationale)
                .await
        }
    }

    async fn wrap_up(
        &self,
        session: &mut Session,
        tree: &CurriculumTree,
        resolved: ResolvedSubtopic<'_>,
        language: &str,
        progress: ProgressUpdate,
    ) -> Result<TurnOutcome> {
        let next = tree.next(session.subtopic_id)?;
        let next_title = match next {
            Cursor::Subtopic(id) => Some(tree.resolve(id)?.subtopic.title.clone()),
            Cursor::EndOfCurriculum => None,
        };
        let directive = Directive::WrapUp {
            status: progress.status,
            next_subtopic: next_title,
        };
        let prompt = self.composer.compose(
            Phase::Completed,
            &PromptContext {
                subtopic: resolved,
                history: &session.turns,
                language,
                directive: Some(&directive),
            },
        )?;
        let (reply, _) = strip_ready_marker(&self.complete(&prompt).await?);
        session.push_turn(Speaker::Tutor, reply.clone(), Utc::now());
        session.phase = Phase::Completed;
        info!(from = %Phase::Assessment, to = %Phase::Completed, ?next, "Phase transition");

        Ok(TurnOutcome {
            reply,
            progress: Some(progress),
            pointer: Some(pointer_for(next)),
            queue_note: true,
        })
    }

    async fn remediate(
        &self,
        session: &mut Session,
        resolved: ResolvedSubtopic<'_>,
        language: &str,
        progress: ProgressUpdate,
        rationale: String,
    ) -> Result<TurnOutcome> {
        let directive = Directive::Remediate {
            status: progress.status,
            rationale,
        };
        let prompt = self.composer.compose(
            Phase::Explanation,
            &PromptContext {
                subtopic: resolved,
                history: &session.turns,
                language,
                directive: Some(&directive),
            },
        )?;
        let (reply, _) = strip_ready_marker(&self.complete(&prompt).await?);
        session.push_turn(Speaker::Tutor, reply.clone(), Utc::now());
        session.phase = Phase::Explanation;
        info!(from = %Phase::Assessment, to = %Phase::Explanation, "Phase transition");

        Ok(TurnOutcome {
            reply,
            progress: Some(progress),
            pointer: None,
            queue_note: false,
        })
    }

    // --- Helpers ---

    async fn complete(&self, prompt: &Prompt) -> Result<String> {
        complete_with_retry(self.model.as_ref(), prompt, &self.policy).await
    }

    /// Guidance carried through Explanation after a Red or Yellow verdict.
    async fn remediation_directive(&self, session: &Session) -> Result<Option<Directive>> {
        let Some(rationale) = session.last_rationale.clone() else {
            return Ok(None);
        };
        let status = self
            .progress
            .get(&session.student_id, session.subtopic_id)
            .await?
            .status;
        Ok(matches!(status, Status::Red | Status::Yellow)
            .then_some(Directive::Remediate { status, rationale }))
    }

    async fn language_of(&self, student_id: &str) -> Result<String> {
        Ok(self
            .progress
            .get_student(student_id)
            .await?
            .map(|s| s.preferred_language)
            .unwrap_or_else(|| self.config.default_language.clone()))
    }

    /// Picks the subtopic a fresh session should cover.
    async fn next_subtopic_for(&self, student: &Student, tree: &CurriculumTree) -> Result<SubtopicId> {
        match student.pointer {
            CurriculumPointer::Complete => Err(TutorError::CurriculumComplete(student.id.clone())),
            CurriculumPointer::At(id) if tree.resolve(id).is_ok() => Ok(id),
            CurriculumPointer::At(id) => {
                // The subtopic was removed between sessions. Fall back to the
                // first one the student has not completed.
                let records = self.progress.records_for_student(&student.id).await?;
                let mut cursor = tree.first();
                while let Cursor::Subtopic(candidate) = cursor {
                    let done = records
                        .iter()
                        .any(|r| r.subtopic_id == candidate && r.completed_at.is_some());
                    if !done {
                        warn!(missing = id, fallback = candidate, "Curriculum pointer was stale");
                        return Ok(candidate);
                    }
                    cursor = tree.next(candidate)?;
                }
                Err(TutorError::CurriculumComplete(student.id.clone()))
            }
            CurriculumPointer::NotStarted => match tree.first() {
                Cursor::Subtopic(id) => Ok(id),
                Cursor::EndOfCurriculum => Err(TutorError::CurriculumNotFound(
                    "curriculum has no active subtopics".to_string(),
                )),
            },
        }
    }

    /// Returns to a session the student already has open, resuming it if it
    /// was abandoned or has gone stale.
    async fn reopen(&self, open: Session, tree: &CurriculumTree, now: DateTime<Utc>) -> Result<SessionView> {
        let _turn_guard = self
            .session_locks
            .try_lock(&open.id)
            .ok_or(TutorError::SessionBusy(open.id))?;
        let mut session = self
            .progress
            .get_session(open.id)
            .await?
            .ok_or(TutorError::SessionNotFound(open.id))?;
        tracing::Span::current().record("session_id", &session.id.to_string());
        tracing::Span::current().record("subtopic_id", session.subtopic_id);

        let mut resumed = false;
        if session.is_idle(now, self.config.inactivity_timeout()) {
            session.abandon(AbandonReason::InactivityTimeout);
        }
        if session.phase == Phase::Abandoned {
            resumed = session.resume(now);
            info!(phase = %session.phase, turns = session.turns.len(), "Session resumed");
        }
        if tree.resolve(session.subtopic_id).is_err() {
            return Err(self.abandon_inconsistent(session).await);
        }
        if resumed {
            self.progress.save_session(&session).await?;
        }

        let reply = session
            .last_tutor_turn()
            .map(|t| t.text.clone())
            .unwrap_or_default();
        self.view(&session, tree, reply, None, resumed).await
    }

    /// Takes a fresh snapshot if the curriculum changed mid-turn. `None`
    /// means the session's subtopic no longer resolves.
    async fn recheck_curriculum(&self, session: &Session, tree: CurriculumTree) -> Option<CurriculumTree> {
        match self.curriculum.revision().await {
            Ok(revision) if revision == tree.revision() => return Some(tree),
            Ok(_) => {}
            Err(e) => {
                warn!(error = %e, "Could not read curriculum revision; keeping snapshot");
                return Some(tree);
            }
        }
        let fresh = match self.curriculum.snapshot().await {
            Ok(fresh) => fresh,
            Err(e) => {
                warn!(error = %e, "Could not refresh curriculum snapshot; keeping snapshot");
                return Some(tree);
            }
        };
        info!(from = tree.revision(), to = fresh.revision(), "Curriculum changed during turn");
        fresh.resolve(session.subtopic_id).is_ok().then_some(fresh)
    }

    /// Suspends a session whose subtopic is gone and builds the error to report.
    async fn abandon_inconsistent(&self, mut session: Session) -> TutorError {
        let session_id = session.id;
        let subtopic_id = session.subtopic_id;
        if session.phase == Phase::Completed {
            // Suspend at the phase the turn started in.
            session.phase = Phase::Assessment;
        }
        session.abandon(AbandonReason::CurriculumInconsistent);
        if let Err(e) = self.progress.save_session(&session).await {
            tracing::error!(error = %e, %session_id, "Failed to persist abandoned session");
            return e;
        }
        warn!(%session_id, subtopic_id, "Session abandoned: curriculum is inconsistent");
        TutorError::CurriculumInconsistent {
            session_id,
            subtopic_id,
        }
    }

    /// Commits a transition, retrying write conflicts.
    async fn persist(&self, commit: TransitionCommit) -> Result<Option<ProgressRecord>> {
        let mut retries = 0;
        loop {
            match self.progress.commit(commit.clone()).await {
                Err(e @ TutorError::ProgressPersistenceConflict { .. }) if retries < COMMIT_RETRIES => {
                    retries += 1;
                    warn!(error = %e, retries, "Retrying transition commit");
                    tokio::time::sleep(COMMIT_BACKOFF * retries).await;
                }
                Err(e) => {
                    tracing::error!(error = %e, "Transition commit failed");
                    return Err(e);
                }
                Ok(record) => return Ok(record),
            }
        }
    }

    fn queue_note(&self, session: &Session, tree: &CurriculumTree) {
        let Ok(resolved) = tree.resolve(session.subtopic_id) else {
            return;
        };
        let job = NoteJob {
            session: session.clone(),
            topic: resolved.topic.clone(),
            subtopic: resolved.subtopic.clone(),
        };
        let handle = self.notes.spawn(self.progress.clone(), job);
        let mut jobs = self.note_jobs.lock().unwrap_or_else(|e| e.into_inner());
        jobs.retain(|h| !h.is_finished());
        jobs.push(handle);
    }

    async fn view(
        &self,
        session: &Session,
        tree: &CurriculumTree,
        reply: String,
        progress: Option<ProgressRecord>,
        resumed: bool,
    ) -> Result<SessionView> {
        let resolved = tree.resolve(session.subtopic_id)?;
        let records = self.progress.records_for_student(&session.student_id).await?;
        Ok(SessionView {
            session_id: session.id,
            student_id: session.student_id.clone(),
            subtopic_id: session.subtopic_id,
            subtopic_title: resolved.subtopic.title.clone(),
            topic_title: resolved.topic.title.clone(),
            lecture_title: resolved.lecture.title.clone(),
            phase: session.phase,
            reply,
            transcript_length: session.turns.len(),
            progress,
            summary: ProgressSummary::compute(&records, tree),
            resumed,
        })
    }
}

fn pointer_for(next: Cursor) -> CurriculumPointer {
    match next {
        Cursor::Subtopic(id) => CurriculumPointer::At(id),
        Cursor::EndOfCurriculum => CurriculumPointer::Complete,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::curriculum::{CurriculumDocument, import_document};
    use crate::llm_client::MockLanguageModel;
    use crate::memory::{InMemoryCurriculumStore, InMemoryProgressStore};
    use crate::progress::NoteState;

    fn document() -> CurriculumDocument {
        serde_json::from_str(
            r#"{"lectures": [{"title": "Basics", "topics": [{"title": "Variables", "subtopics": [
                {"title": "Creating Variables", "objective": "Assign values"},
                {"title": "Variable Types", "objective": "Name the basic types"}
            ]}]}]}"#,
        )
        .unwrap()
    }

    /// Routes replies by prompt kind so tests do not depend on call order.
    fn model(judge: &'static str) -> MockLanguageModel {
        let mut mock = MockLanguageModel::new();
        mock.expect_complete().returning(move |p: Prompt| {
            let s = &p.system;
            Ok(if s.contains("impartial examiner") {
                judge.to_string()
            } else if s.contains("concise study notes") {
                r#"{"summary": "Done."}"#.to_string()
            } else if s.contains("checking a student's understanding") {
                "What does x = 5 do?".to_string()
            } else if s.contains("closing the lesson") {
                "Well done.".to_string()
            } else {
                "Let's talk about variables.".to_string()
            })
        });
        mock
    }

    async fn engine(judge: &'static str) -> (SessionEngine, Arc<InMemoryProgressStore>, Arc<InMemoryCurriculumStore>) {
        let curriculum = Arc::new(InMemoryCurriculumStore::new());
        import_document(curriculum.as_ref(), document()).await.unwrap();
        let progress = Arc::new(InMemoryProgressStore::new());
        let engine = SessionEngine::new(
            EngineConfig::default(),
            curriculum.clone(),
            progress.clone(),
            Arc::new(model(judge)),
            PromptTemplates::default(),
        );
        (engine, progress, curriculum)
    }

    #[tokio::test]
    async fn test_start_then_second_start_returns_same_session() {
        let (engine, _, _) = engine("VERDICT: GREEN").await;
        let first = engine.start_session("s1", None).await.unwrap();
        assert_eq!(first.phase, Phase::Explanation);
        assert_eq!(first.subtopic_title, "Creating Variables");
        assert_eq!(first.transcript_length, 1);

        let again = engine.start_session("s1", None).await.unwrap();
        assert_eq!(again.session_id, first.session_id);
        assert_eq!(again.reply, first.reply);
        assert!(!again.resumed);
    }

    #[tokio::test]
    async fn test_green_completes_and_advances() {
        let (engine, progress, _) = engine("VERDICT: GREEN\nRATIONALE: Clear.").await;
        let view = engine.start_session("s1", None).await.unwrap();
        let sid = view.session_id;

        let view = engine.respond(sid, StudentInput::Ready).await.unwrap();
        assert_eq!(view.phase, Phase::Assessment);
        assert_eq!(view.reply, "What does x = 5 do?");

        let view = engine
            .respond(sid, StudentInput::message("It stores 5 in x."))
            .await
            .unwrap();
        assert_eq!(view.phase, Phase::Completed);
        let record = view.progress.unwrap();
        assert_eq!(record.status, Status::Green);
        assert!(!record.flagged);
        assert_eq!(view.summary.completed_subtopics, 1);

        let student = progress.get_student("s1").await.unwrap().unwrap();
        let tree = engine.get_curriculum_snapshot().await.unwrap();
        assert_eq!(student.pointer, pointer_for(tree.next(view.subtopic_id).unwrap()));

        engine.drain_note_jobs().await;
        let note = progress.get_note("s1", view.subtopic_id).await.unwrap().unwrap();
        assert!(matches!(note.state, NoteState::Ready { .. }));

        let err = engine
            .respond(sid, StudentInput::message("more"))
            .await
            .unwrap_err();
        assert!(matches!(err, TutorError::InvalidPhaseTransition { .. }));
    }

    #[tokio::test]
    async fn test_ready_is_rejected_during_assessment() {
        let (engine, _, _) = engine("VERDICT: GREEN").await;
        let sid = engine.start_session("s1", None).await.unwrap().session_id;
        engine.respond(sid, StudentInput::Ready).await.unwrap();
        let err = engine.respond(sid, StudentInput::Ready).await.unwrap_err();
        assert!(matches!(
            err,
            TutorError::InvalidPhaseTransition {
                phase: Phase::Assessment,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_commit_conflicts_are_retried() {
        let (engine, progress, _) = engine("VERDICT: GREEN").await;
        let sid = engine.start_session("s1", None).await.unwrap().session_id;
        progress.inject_commit_conflicts(2);
        let view = engine.respond(sid, StudentInput::Ready).await.unwrap();
        assert_eq!(view.phase, Phase::Assessment);
        let stored = progress.get_session(sid).await.unwrap().unwrap();
        assert_eq!(stored.phase, Phase::Assessment);
    }

    #[tokio::test]
    async fn test_deleted_subtopic_abandons_session() {
        let (engine, progress, curriculum) = engine("VERDICT: GREEN").await;
        let view = engine.start_session("s1", None).await.unwrap();
        curriculum.delete_subtopic(view.subtopic_id).await.unwrap();

        let err = engine
            .respond(view.session_id, StudentInput::message("hello?"))
            .await
            .unwrap_err();
        assert!(matches!(err, TutorError::CurriculumInconsistent { .. }));
        assert!(err.is_user_visible());

        let stored = progress.get_session(view.session_id).await.unwrap().unwrap();
        assert_eq!(stored.phase, Phase::Abandoned);
        assert_eq!(stored.abandon_reason, Some(AbandonReason::CurriculumInconsistent));
        assert_eq!(stored.suspended_phase, Some(Phase::Explanation));
    }

    #[tokio::test]
    async fn test_expire_idle_sessions() {
        let (engine, progress, _) = engine("VERDICT: GREEN").await;
        let sid = engine.start_session("s1", None).await.unwrap().session_id;

        assert_eq!(engine.expire_idle_sessions(Utc::now()).await.unwrap(), 0);
        let later = Utc::now() + engine.config().inactivity_timeout() + chrono::Duration::seconds(1);
        assert_eq!(engine.expire_idle_sessions(later).await.unwrap(), 1);

        let stored = progress.get_session(sid).await.unwrap().unwrap();
        assert_eq!(stored.phase, Phase::Abandoned);
        assert!(progress.find("s1", stored.subtopic_id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_empty_curriculum_cannot_start() {
        let progress = Arc::new(InMemoryProgressStore::new());
        let engine = SessionEngine::new(
            EngineConfig::default(),
            Arc::new(InMemoryCurriculumStore::new()),
            progress,
            Arc::new(MockLanguageModel::new()),
            PromptTemplates::default(),
        );
        let err = engine.start_session("s1", None).await.unwrap_err();
        assert!(matches!(err, TutorError::CurriculumNotFound(_)));
    }
}
