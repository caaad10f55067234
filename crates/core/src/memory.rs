//! In-memory stores.
//!
//! Process-local implementations of [`CurriculumStore`] and [`ProgressStore`],
//! used by tests and by hosts that do not need durability. Each store keeps its
//! state behind one lock, so every write, including a full
//! [`TransitionCommit`], is atomic.

use crate::curriculum::{
    CurriculumStore, CurriculumTree, Lecture, LectureDraft, LectureId, OrderTarget, Subtopic,
    SubtopicDraft, SubtopicId, Topic, TopicDraft, TopicId, move_to_index,
};
use crate::error::{Result, TutorError};
use crate::progress::{
    NoteEntry, NoteState, ProgressRecord, ProgressStore, ProgressUpdate, Status, Student,
    TransitionCommit,
};
use crate::session::{AbandonReason, Phase, Session, SessionId, StudentId};
use anyhow::anyhow;
use async_trait::async_trait;
use chrono::Utc;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU32, Ordering};
use tokio::sync::RwLock;

// --- Curriculum ---

#[derive(Debug, Default)]
struct CurriculumState {
    revision: u64,
    next_id: i64,
    lectures: BTreeMap<LectureId, Lecture>,
    topics: BTreeMap<TopicId, Topic>,
    subtopics: BTreeMap<SubtopicId, Subtopic>,
}

impl CurriculumState {
    fn allocate_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }

    fn lecture_order(&self) -> Vec<LectureId> {
        let mut ids: Vec<_> = self.lectures.values().map(|l| (l.order_index, l.id)).collect();
        ids.sort();
        ids.into_iter().map(|(_, id)| id).collect()
    }

    fn topic_order(&self, lecture_id: LectureId) -> Vec<TopicId> {
        let mut ids: Vec<_> = self
            .topics
            .values()
            .filter(|t| t.lecture_id == lecture_id)
            .map(|t| (t.order_index, t.id))
            .collect();
        ids.sort();
        ids.into_iter().map(|(_, id)| id).collect()
    }

    fn subtopic_order(&self, topic_id: TopicId) -> Vec<SubtopicId> {
        let mut ids: Vec<_> = self
            .subtopics
            .values()
            .filter(|s| s.topic_id == topic_id)
            .map(|s| (s.order_index, s.id))
            .collect();
        ids.sort();
        ids.into_iter().map(|(_, id)| id).collect()
    }

    fn renumber_lectures(&mut self, order: &[LectureId]) {
        for (index, id) in order.iter().enumerate() {
            if let Some(lecture) = self.lectures.get_mut(id) {
                lecture.order_index = index as i32;
            }
        }
    }

    fn renumber_topics(&mut self, order: &[TopicId]) {
        for (index, id) in order.iter().enumerate() {
            if let Some(topic) = self.topics.get_mut(id) {
                topic.order_index = index as i32;
            }
        }
    }

    fn renumber_subtopics(&mut self, order: &[SubtopicId]) {
        for (index, id) in order.iter().enumerate() {
            if let Some(subtopic) = self.subtopics.get_mut(id) {
                subtopic.order_index = index as i32;
            }
        }
    }

    fn remove_topic_cascade(&mut self, id: TopicId) {
        self.topics.remove(&id);
        self.subtopics.retain(|_, s| s.topic_id != id);
    }
}

#[derive(Debug, Default)]
pub struct InMemoryCurriculumStore {
    state: RwLock<CurriculumState>,
}

impl InMemoryCurriculumStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn not_found(kind: &str, id: i64) -> TutorError {
    TutorError::CurriculumNotFound(format!("{kind} {id}"))
}

#[async_trait]
impl CurriculumStore for InMemoryCurriculumStore {
    async fn snapshot(&self) -> Result<CurriculumTree> {
        let state = self.state.read().await;
        Ok(CurriculumTree::new(
            state.revision,
            state.lectures.values().cloned().collect(),
            state.topics.values().cloned().collect(),
            state.subtopics.values().cloned().collect(),
        ))
    }

    async fn revision(&self) -> Result<u64> {
        Ok(self.state.read().await.revision)
    }

    async fn create_lecture(&self, draft: LectureDraft) -> Result<Lecture> {
        let mut state = self.state.write().await;
        let lecture = Lecture {
            id: state.allocate_id(),
            title: draft.title,
            description: draft.description,
            order_index: state.lectures.len() as i32,
            is_active: draft.is_active,
        };
        state.lectures.insert(lecture.id, lecture.clone());
        state.revision += 1;
        Ok(lecture)
    }

    async fn update_lecture(&self, id: LectureId, draft: LectureDraft) -> Result<Lecture> {
        let mut state = self.state.write().await;
        let lecture = state.lectures.get_mut(&id).ok_or_else(|| not_found("lecture", id))?;
        lecture.title = draft.title;
        lecture.description = draft.description;
        lecture.is_active = draft.is_active;
        let updated = lecture.clone();
        state.revision += 1;
        Ok(updated)
    }

    async fn delete_lecture(&self, id: LectureId) -> Result<()> {
        let mut state = self.state.write().await;
        if state.lectures.remove(&id).is_none() {
            return Err(not_found("lecture", id));
        }
        let topic_ids: Vec<_> = state
            .topics
            .values()
            .filter(|t| t.lecture_id == id)
            .map(|t| t.id)
            .collect();
        for topic_id in topic_ids {
            state.remove_topic_cascade(topic_id);
        }
        let order = state.lecture_order();
        state.renumber_lectures(&order);
        state.revision += 1;
        Ok(())
    }

    async fn create_topic(&self, lecture_id: LectureId, draft: TopicDraft) -> Result<Topic> {
        let mut state = self.state.write().await;
        if !state.lectures.contains_key(&lecture_id) {
            return Err(not_found("lecture", lecture_id));
        }
        let topic = Topic {
            id: state.allocate_id(),
            lecture_id,
            title: draft.title,
            description: draft.description,
            order_index: state.topic_order(lecture_id).len() as i32,
            learning_objectives: draft.learning_objectives,
            estimated_duration_minutes: draft.estimated_duration_minutes,
        };
        state.topics.insert(topic.id, topic.clone());
        state.revision += 1;
        Ok(topic)
    }

    async fn update_topic(&self, id: TopicId, draft: TopicDraft) -> Result<Topic> {
        let mut state = self.state.write().await;
        let topic = state.topics.get_mut(&id).ok_or_else(|| not_found("topic", id))?;
        topic.title = draft.title;
        topic.description = draft.description;
        topic.learning_objectives = draft.learning_objectives;
        topic.estimated_duration_minutes = draft.estimated_duration_minutes;
        let updated = topic.clone();
        state.revision += 1;
        Ok(updated)
    }

    async fn delete_topic(&self, id: TopicId) -> Result<()> {
        let mut state = self.state.write().await;
        let lecture_id = state
            .topics
            .get(&id)
            .map(|t| t.lecture_id)
            .ok_or_else(|| not_found("topic", id))?;
        state.remove_topic_cascade(id);
        let order = state.topic_order(lecture_id);
        state.renumber_topics(&order);
        state.revision += 1;
        Ok(())
    }

    async fn create_subtopic(&self, topic_id: TopicId, draft: SubtopicDraft) -> Result<Subtopic> {
        let mut state = self.state.write().await;
        if !state.topics.contains_key(&topic_id) {
            return Err(not_found("topic", topic_id));
        }
        let id = state.allocate_id();
        let order_index = state.subtopic_order(topic_id).len() as i32;
        let subtopic = draft.into_subtopic(id, topic_id, order_index);
        state.subtopics.insert(id, subtopic.clone());
        state.revision += 1;
        Ok(subtopic)
    }

    async fn update_subtopic(&self, id: SubtopicId, draft: SubtopicDraft) -> Result<Subtopic> {
        let mut state = self.state.write().await;
        let existing = state
            .subtopics
            .get(&id)
            .ok_or_else(|| not_found("subtopic", id))?;
        let updated = draft.into_subtopic(id, existing.topic_id, existing.order_index);
        state.subtopics.insert(id, updated.clone());
        state.revision += 1;
        Ok(updated)
    }

    async fn delete_subtopic(&self, id: SubtopicId) -> Result<()> {
        let mut state = self.state.write().await;
        let removed = state
            .subtopics
            .remove(&id)
            .ok_or_else(|| not_found("subtopic", id))?;
        let order = state.subtopic_order(removed.topic_id);
        state.renumber_subtopics(&order);
        state.revision += 1;
        Ok(())
    }

    async fn reorder(&self, target: OrderTarget, new_index: usize) -> Result<()> {
        let mut state = self.state.write().await;
        match target {
            OrderTarget::Lecture(id) => {
                let mut order = state.lecture_order();
                if !move_to_index(&mut order, id, new_index) {
                    return Err(not_found("lecture", id));
                }
                state.renumber_lectures(&order);
            }
            OrderTarget::Topic(id) => {
                let lecture_id = state
                    .topics
                    .get(&id)
                    .map(|t| t.lecture_id)
                    .ok_or_else(|| not_found("topic", id))?;
                let mut order = state.topic_order(lecture_id);
                move_to_index(&mut order, id, new_index);
                state.renumber_topics(&order);
            }
            OrderTarget::Subtopic(id) => {
                let topic_id = state
                    .subtopics
                    .get(&id)
                    .map(|s| s.topic_id)
                    .ok_or_else(|| not_found("subtopic", id))?;
                let mut order = state.subtopic_order(topic_id);
                move_to_index(&mut order, id, new_index);
                state.renumber_subtopics(&order);
            }
        }
        state.revision += 1;
        Ok(())
    }

    async fn duplicate_lecture(&self, id: LectureId, new_title: String) -> Result<Lecture> {
        let mut state = self.state.write().await;
        let source = state
            .lectures
            .get(&id)
            .cloned()
            .ok_or_else(|| not_found("lecture", id))?;
        let copy = Lecture {
            id: state.allocate_id(),
            title: new_title,
            order_index: state.lectures.len() as i32,
            ..source
        };
        state.lectures.insert(copy.id, copy.clone());

        for topic_id in state.topic_order(id) {
            let Some(topic) = state.topics.get(&topic_id).cloned() else {
                continue;
            };
            let new_topic = Topic {
                id: state.allocate_id(),
                lecture_id: copy.id,
                ..topic
            };
            state.topics.insert(new_topic.id, new_topic.clone());
            for subtopic_id in state.subtopic_order(topic_id) {
                let Some(subtopic) = state.subtopics.get(&subtopic_id).cloned() else {
                    continue;
                };
                let new_subtopic = Subtopic {
                    id: state.allocate_id(),
                    topic_id: new_topic.id,
                    ..subtopic
                };
                state.subtopics.insert(new_subtopic.id, new_subtopic);
            }
        }
        state.revision += 1;
        Ok(copy)
    }
}

// --- Progress ---

type RecordKey = (StudentId, SubtopicId);

#[derive(Debug, Default)]
struct ProgressState {
    students: HashMap<StudentId, Student>,
    sessions: HashMap<SessionId, Session>,
    records: HashMap<RecordKey, ProgressRecord>,
    notes: HashMap<RecordKey, NoteEntry>,
}

#[derive(Debug, Default)]
pub struct InMemoryProgressStore {
    state: RwLock<ProgressState>,
    injected_conflicts: AtomicU32,
}

impl InMemoryProgressStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `count` commits fail with `ProgressPersistenceConflict`.
    pub fn inject_commit_conflicts(&self, count: u32) {
        self.injected_conflicts.store(count, Ordering::SeqCst);
    }

    fn take_injected_conflict(&self) -> bool {
        self.injected_conflicts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

fn is_open(session: &Session) -> bool {
    !session.phase.is_terminal()
        || (session.phase == Phase::Abandoned
            && session.abandon_reason == Some(AbandonReason::InactivityTimeout))
}

#[async_trait]
impl ProgressStore for InMemoryProgressStore {
    async fn get_student(&self, student_id: &str) -> Result<Option<Student>> {
        Ok(self.state.read().await.students.get(student_id).cloned())
    }

    async fn create_student(&self, student: Student) -> Result<Student> {
        let mut state = self.state.write().await;
        Ok(state
            .students
            .entry(student.id.clone())
            .or_insert(student)
            .clone())
    }

    async fn insert_session(&self, session: &Session) -> Result<()> {
        let mut state = self.state.write().await;
        if state.sessions.contains_key(&session.id) {
            return Err(anyhow!("session {} already exists", session.id).into());
        }
        state.sessions.insert(session.id, session.clone());
        Ok(())
    }

    async fn get_session(&self, session_id: SessionId) -> Result<Option<Session>> {
        Ok(self.state.read().await.sessions.get(&session_id).cloned())
    }

    async fn save_session(&self, session: &Session) -> Result<()> {
        let mut state = self.state.write().await;
        match state.sessions.get_mut(&session.id) {
            Some(stored) => {
                *stored = session.clone();
                Ok(())
            }
            None => Err(TutorError::SessionNotFound(session.id)),
        }
    }

    async fn open_session_for(&self, student_id: &str) -> Result<Option<Session>> {
        let state = self.state.read().await;
        Ok(state
            .sessions
            .values()
            .filter(|s| s.student_id == student_id && is_open(s))
            .max_by_key(|s| s.created_at)
            .cloned())
    }

    async fn list_active_sessions(&self) -> Result<Vec<Session>> {
        let state = self.state.read().await;
        Ok(state
            .sessions
            .values()
            .filter(|s| !s.phase.is_terminal())
            .cloned()
            .collect())
    }

    async fn count_sessions(&self) -> Result<usize> {
        Ok(self.state.read().await.sessions.len())
    }

    async fn upsert(
        &self,
        student_id: &str,
        subtopic_id: SubtopicId,
        status: Status,
        flagged: bool,
    ) -> Result<ProgressRecord> {
        let mut state = self.state.write().await;
        let record = state
            .records
            .entry((student_id.to_string(), subtopic_id))
            .or_insert_with(|| ProgressRecord::not_started(student_id, subtopic_id));
        record.apply(
            &ProgressUpdate {
                status,
                flagged,
                completes: false,
            },
            Utc::now(),
        );
        Ok(record.clone())
    }

    async fn find(&self, student_id: &str, subtopic_id: SubtopicId) -> Result<Option<ProgressRecord>> {
        let state = self.state.read().await;
        Ok(state
            .records
            .get(&(student_id.to_string(), subtopic_id))
            .cloned())
    }

    async fn records_for_student(&self, student_id: &str) -> Result<Vec<ProgressRecord>> {
        let state = self.state.read().await;
        Ok(state
            .records
            .values()
            .filter(|r| r.student_id == student_id)
            .cloned()
            .collect())
    }

    async fn list_all(&self) -> Result<Vec<ProgressRecord>> {
        Ok(self.state.read().await.records.values().cloned().collect())
    }

    async fn get_note(&self, student_id: &str, subtopic_id: SubtopicId) -> Result<Option<NoteEntry>> {
        let state = self.state.read().await;
        Ok(state
            .notes
            .get(&(student_id.to_string(), subtopic_id))
            .cloned())
    }

    async fn pending_notes(&self) -> Result<Vec<NoteEntry>> {
        let state = self.state.read().await;
        Ok(state
            .notes
            .values()
            .filter(|entry| entry.state == NoteState::Pending)
            .cloned()
            .collect())
    }

    async fn resolve_note(
        &self,
        student_id: &str,
        subtopic_id: SubtopicId,
        session_id: SessionId,
        note_state: NoteState,
    ) -> Result<bool> {
        let mut state = self.state.write().await;
        match state.notes.get_mut(&(student_id.to_string(), subtopic_id)) {
            Some(entry) if entry.session_id == session_id => {
                entry.state = note_state;
                entry.updated_at = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn commit(&self, commit: TransitionCommit) -> Result<Option<ProgressRecord>> {
        let session = commit.session;
        if self.take_injected_conflict() {
            return Err(TutorError::ProgressPersistenceConflict {
                student_id: session.student_id.clone(),
                subtopic_id: session.subtopic_id,
            });
        }

        let mut state = self.state.write().await;
        if !state.sessions.contains_key(&session.id) {
            return Err(TutorError::SessionNotFound(session.id));
        }
        if commit.pointer.is_some() && !state.students.contains_key(&session.student_id) {
            return Err(anyhow!("student '{}' not found", session.student_id).into());
        }

        let now = Utc::now();
        let key = (session.student_id.clone(), session.subtopic_id);
        let record = commit.progress.map(|update| {
            let record = state
                .records
                .entry(key.clone())
                .or_insert_with(|| ProgressRecord::not_started(&session.student_id, session.subtopic_id));
            record.apply(&update, now);
            record.clone()
        });
        if let Some(pointer) = commit.pointer {
            if let Some(student) = state.students.get_mut(&session.student_id) {
                student.pointer = pointer;
            }
        }
        if commit.queue_note {
            state.notes.insert(
                key,
                NoteEntry {
                    student_id: session.student_id.clone(),
                    subtopic_id: session.subtopic_id,
                    session_id: session.id,
                    state: NoteState::Pending,
                    updated_at: now,
                },
            );
        }
        state.sessions.insert(session.id, session);
        Ok(record)
    }
}
