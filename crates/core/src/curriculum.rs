//! Curriculum Tree
//!
//! Lectures contain topics, topics contain subtopics, and each level is ordered
//! by a dense `order_index` among its siblings. The engine only ever sees a
//! [`CurriculumTree`], an immutable snapshot taken from a [`CurriculumStore`];
//! teachers edit the store concurrently and every committed edit bumps the
//! store's revision.

use crate::error::{Result, TutorError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

pub type LectureId = i64;
pub type TopicId = i64;
pub type SubtopicId = i64;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Lecture {
    pub id: LectureId,
    pub title: String,
    pub description: String,
    pub order_index: i32,
    /// Inactive lectures stay in the tree but are skipped by traversal.
    pub is_active: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Topic {
    pub id: TopicId,
    pub lecture_id: LectureId,
    pub title: String,
    pub description: String,
    pub order_index: i32,
    pub learning_objectives: Vec<String>,
    pub estimated_duration_minutes: i32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodeExample {
    pub code: String,
    pub explanation: String,
}

/// The three per-phase teaching instructions authored for a subtopic.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubtopicPrompts {
    pub introduction: String,
    pub explanation: String,
    pub assessment: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Subtopic {
    pub id: SubtopicId,
    pub topic_id: TopicId,
    pub title: String,
    pub objective: String,
    /// Main teaching text.
    pub content: String,
    #[serde(default)]
    pub examples: Vec<CodeExample>,
    #[serde(default)]
    pub exercises: Vec<String>,
    pub order_index: i32,
    pub prompts: SubtopicPrompts,
}

/// A subtopic together with its (verified) parent chain.
#[derive(Debug, Clone, Copy)]
pub struct ResolvedSubtopic<'a> {
    pub lecture: &'a Lecture,
    pub topic: &'a Topic,
    pub subtopic: &'a Subtopic,
}

/// Result of a traversal step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "subtopicId")]
pub enum Cursor {
    Subtopic(SubtopicId),
    EndOfCurriculum,
}

/// An immutable, internally consistent view of the curriculum at one revision.
#[derive(Debug, Clone, Default)]
pub struct CurriculumTree {
    revision: u64,
    lectures: Vec<Lecture>,
    topics: HashMap<TopicId, Topic>,
    subtopics: HashMap<SubtopicId, Subtopic>,
    topic_order: HashMap<LectureId, Vec<TopicId>>,
    subtopic_order: HashMap<TopicId, Vec<SubtopicId>>,
    /// In-order traversal over every properly linked subtopic, with the
    /// owning lecture's active flag.
    sequence: Vec<(SubtopicId, bool)>,
    positions: HashMap<SubtopicId, usize>,
}

impl CurriculumTree {
    /// Builds a snapshot from flat rows. Sibling order is `(order_index, id)`.
    pub fn new(
        revision: u64,
        mut lectures: Vec<Lecture>,
        topics: Vec<Topic>,
        subtopics: Vec<Subtopic>,
    ) -> Self {
        lectures.sort_by_key(|l| (l.order_index, l.id));

        let mut topic_order: HashMap<LectureId, Vec<TopicId>> = HashMap::new();
        let mut sorted_topics = topics.clone();
        sorted_topics.sort_by_key(|t| (t.order_index, t.id));
        for topic in &sorted_topics {
            topic_order.entry(topic.lecture_id).or_default().push(topic.id);
        }

        let mut subtopic_order: HashMap<TopicId, Vec<SubtopicId>> = HashMap::new();
        let mut sorted_subtopics = subtopics.clone();
        sorted_subtopics.sort_by_key(|s| (s.order_index, s.id));
        for subtopic in &sorted_subtopics {
            subtopic_order
                .entry(subtopic.topic_id)
                .or_default()
                .push(subtopic.id);
        }

        let mut sequence = Vec::new();
        for lecture in &lectures {
            for topic_id in topic_order.get(&lecture.id).into_iter().flatten() {
                for subtopic_id in subtopic_order.get(topic_id).into_iter().flatten() {
                    sequence.push((*subtopic_id, lecture.is_active));
                }
            }
        }
        let positions = sequence
            .iter()
            .enumerate()
            .map(|(i, (id, _))| (*id, i))
            .collect();

        Self {
            revision,
            lectures,
            topics: topics.into_iter().map(|t| (t.id, t)).collect(),
            subtopics: subtopics.into_iter().map(|s| (s.id, s)).collect(),
            topic_order,
            subtopic_order,
            sequence,
            positions,
        }
    }

    pub fn revision(&self) -> u64 {
        self.revision
    }

    /// Looks up a subtopic and verifies its topic and lecture still exist.
    pub fn resolve(&self, id: SubtopicId) -> Result<ResolvedSubtopic<'_>> {
        let subtopic = self
            .subtopics
            .get(&id)
            .ok_or_else(|| TutorError::CurriculumNotFound(format!("subtopic {id}")))?;
        let topic = self.topics.get(&subtopic.topic_id).ok_or_else(|| {
            TutorError::CurriculumNotFound(format!(
                "topic {} (parent of subtopic {id})",
                subtopic.topic_id
            ))
        })?;
        let lecture = self
            .lectures
            .iter()
            .find(|l| l.id == topic.lecture_id)
            .ok_or_else(|| {
                TutorError::CurriculumNotFound(format!(
                    "lecture {} (parent of topic {})",
                    topic.lecture_id, topic.id
                ))
            })?;
        Ok(ResolvedSubtopic {
            lecture,
            topic,
            subtopic,
        })
    }

    pub fn first(&self) -> Cursor {
        self.sequence
            .iter()
            .find(|(_, active)| *active)
            .map(|(id, _)| Cursor::Subtopic(*id))
            .unwrap_or(Cursor::EndOfCurriculum)
    }

    /// The next subtopic after `id` in lecture → topic → subtopic order,
    /// skipping subtopics of inactive lectures.
    pub fn next(&self, id: SubtopicId) -> Result<Cursor> {
        self.resolve(id)?;
        let position = self
            .positions
            .get(&id)
            .ok_or_else(|| TutorError::CurriculumNotFound(format!("subtopic {id}")))?;
        Ok(self.sequence[position + 1..]
            .iter()
            .find(|(_, active)| *active)
            .map(|(next, _)| Cursor::Subtopic(*next))
            .unwrap_or(Cursor::EndOfCurriculum))
    }

    /// Zero-based curriculum position, used to order progress listings.
    pub fn position(&self, id: SubtopicId) -> Option<usize> {
        self.positions.get(&id).copied()
    }

    /// Subtopics a student is expected to work through.
    pub fn active_subtopic_count(&self) -> usize {
        self.sequence.iter().filter(|(_, active)| *active).count()
    }

    pub fn lectures(&self) -> &[Lecture] {
        &self.lectures
    }

    pub fn topics_of(&self, lecture_id: LectureId) -> impl Iterator<Item = &Topic> {
        self.topic_order
            .get(&lecture_id)
            .into_iter()
            .flatten()
            .filter_map(|id| self.topics.get(id))
    }

    pub fn subtopics_of(&self, topic_id: TopicId) -> impl Iterator<Item = &Subtopic> {
        self.subtopic_order
            .get(&topic_id)
            .into_iter()
            .flatten()
            .filter_map(|id| self.subtopics.get(id))
    }

    pub fn counts(&self) -> CurriculumCounts {
        CurriculumCounts {
            lectures: self.lectures.len(),
            topics: self.topics.len(),
            subtopics: self.subtopics.len(),
        }
    }

    /// Renders the snapshot as a nested document for dashboards.
    pub fn to_document(&self) -> CurriculumDocument {
        let lectures = self
            .lectures
            .iter()
            .map(|lecture| LectureNode {
                id: Some(lecture.id),
                title: lecture.title.clone(),
                description: lecture.description.clone(),
                is_active: lecture.is_active,
                topics: self
                    .topics_of(lecture.id)
                    .map(|topic| TopicNode {
                        id: Some(topic.id),
                        title: topic.title.clone(),
                        description: topic.description.clone(),
                        learning_objectives: topic.learning_objectives.clone(),
                        estimated_duration_minutes: topic.estimated_duration_minutes,
                        subtopics: self
                            .subtopics_of(topic.id)
                            .map(|s| SubtopicNode {
                                id: Some(s.id),
                                draft: SubtopicDraft::from(s),
                            })
                            .collect(),
                    })
                    .collect(),
            })
            .collect();
        CurriculumDocument {
            revision: Some(self.revision),
            lectures,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CurriculumCounts {
    pub lectures: usize,
    pub topics: usize,
    pub subtopics: usize,
}

// --- Nested document form (seed files and snapshot views) ---

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CurriculumDocument {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revision: Option<u64>,
    pub lectures: Vec<LectureNode>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LectureNode {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<LectureId>,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_true")]
    pub is_active: bool,
    #[serde(default)]
    pub topics: Vec<TopicNode>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TopicNode {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<TopicId>,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub learning_objectives: Vec<String>,
    #[serde(default = "default_duration")]
    pub estimated_duration_minutes: i32,
    #[serde(default)]
    pub subtopics: Vec<SubtopicNode>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubtopicNode {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<SubtopicId>,
    #[serde(flatten)]
    pub draft: SubtopicDraft,
}

fn default_true() -> bool {
    true
}

fn default_duration() -> i32 {
    30
}

// --- Authoring drafts ---

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LectureDraft {
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_true")]
    pub is_active: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TopicDraft {
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub learning_objectives: Vec<String>,
    #[serde(default = "default_duration")]
    pub estimated_duration_minutes: i32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubtopicDraft {
    pub title: String,
    #[serde(default)]
    pub objective: String,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub examples: Vec<CodeExample>,
    #[serde(default)]
    pub exercises: Vec<String>,
    #[serde(default)]
    pub introduction_prompt: String,
    #[serde(default)]
    pub explanation_prompt: String,
    #[serde(default)]
    pub assessment_prompt: String,
}

impl From<&Subtopic> for SubtopicDraft {
    fn from(s: &Subtopic) -> Self {
        Self {
            title: s.title.clone(),
            objective: s.objective.clone(),
            content: s.content.clone(),
            examples: s.examples.clone(),
            exercises: s.exercises.clone(),
            introduction_prompt: s.prompts.introduction.clone(),
            explanation_prompt: s.prompts.explanation.clone(),
            assessment_prompt: s.prompts.assessment.clone(),
        }
    }
}

impl SubtopicDraft {
    pub fn into_subtopic(self, id: SubtopicId, topic_id: TopicId, order_index: i32) -> Subtopic {
        Subtopic {
            id,
            topic_id,
            title: self.title,
            objective: self.objective,
            content: self.content,
            examples: self.examples,
            exercises: self.exercises,
            order_index,
            prompts: SubtopicPrompts {
                introduction: self.introduction_prompt,
                explanation: self.explanation_prompt,
                assessment: self.assessment_prompt,
            },
        }
    }
}

/// Which sibling list a reorder applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "id")]
pub enum OrderTarget {
    Lecture(LectureId),
    Topic(TopicId),
    Subtopic(SubtopicId),
}

/// Moves `item` to `new_index` within `order`, clamping to the last slot.
///
/// Returns `false` if `item` is not in `order`. After the move, a sibling's
/// dense order index is simply its position in the vector.
pub fn move_to_index<T: Copy + PartialEq>(order: &mut Vec<T>, item: T, new_index: usize) -> bool {
    let Some(current) = order.iter().position(|x| *x == item) else {
        return false;
    };
    let value = order.remove(current);
    let target = new_index.min(order.len());
    order.insert(target, value);
    true
}

/// Read access for the engine plus the authoring API teachers use.
///
/// The engine calls only [`snapshot`](Self::snapshot) and
/// [`revision`](Self::revision). Every successful write must commit
/// atomically and bump the revision.
#[async_trait]
pub trait CurriculumStore: Send + Sync {
    async fn snapshot(&self) -> Result<CurriculumTree>;

    async fn revision(&self) -> Result<u64>;

    /// New lectures, topics and subtopics are appended after their siblings.
    async fn create_lecture(&self, draft: LectureDraft) -> Result<Lecture>;
    async fn update_lecture(&self, id: LectureId, draft: LectureDraft) -> Result<Lecture>;
    /// Deletes the lecture with all its topics and subtopics.
    async fn delete_lecture(&self, id: LectureId) -> Result<()>;

    async fn create_topic(&self, lecture_id: LectureId, draft: TopicDraft) -> Result<Topic>;
    async fn update_topic(&self, id: TopicId, draft: TopicDraft) -> Result<Topic>;
    async fn delete_topic(&self, id: TopicId) -> Result<()>;

    async fn create_subtopic(&self, topic_id: TopicId, draft: SubtopicDraft) -> Result<Subtopic>;
    async fn update_subtopic(&self, id: SubtopicId, draft: SubtopicDraft) -> Result<Subtopic>;
    async fn delete_subtopic(&self, id: SubtopicId) -> Result<()>;

    /// Moves one entity among its siblings and re-normalises the sibling
    /// order indices to `0..n`.
    async fn reorder(&self, target: OrderTarget, new_index: usize) -> Result<()>;

    /// Copies a lecture with all of its topics and subtopics, appended last.
    async fn duplicate_lecture(&self, id: LectureId, new_title: String) -> Result<Lecture>;
}

/// Loads a nested document into an (empty) store through the authoring API.
pub async fn import_document(
    store: &dyn CurriculumStore,
    document: CurriculumDocument,
) -> Result<CurriculumCounts> {
    let mut counts = CurriculumCounts {
        lectures: 0,
        topics: 0,
        subtopics: 0,
    };
    for lecture in document.lectures {
        let created = store
            .create_lecture(LectureDraft {
                title: lecture.title,
                description: lecture.description,
                is_active: lecture.is_active,
            })
            .await?;
        counts.lectures += 1;
        for topic in lecture.topics {
            let created_topic = store
                .create_topic(
                    created.id,
                    TopicDraft {
                        title: topic.title,
                        description: topic.description,
                        learning_objectives: topic.learning_objectives,
                        estimated_duration_minutes: topic.estimated_duration_minutes,
                    },
                )
                .await?;
            counts.topics += 1;
            for subtopic in topic.subtopics {
                store.create_subtopic(created_topic.id, subtopic.draft).await?;
                counts.subtopics += 1;
            }
        }
    }
    Ok(counts)
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;

    pub fn lecture(id: LectureId, order_index: i32) -> Lecture {
        Lecture {
            id,
            title: format!("Lecture {id}"),
            description: String::new(),
            order_index,
            is_active: true,
        }
    }

    pub fn topic(id: TopicId, lecture_id: LectureId, order_index: i32) -> Topic {
        Topic {
            id,
            lecture_id,
            title: format!("Topic {id}"),
            description: String::new(),
            order_index,
            learning_objectives: vec![],
            estimated_duration_minutes: 30,
        }
    }

    pub fn subtopic(id: SubtopicId, topic_id: TopicId, order_index: i32) -> Subtopic {
        SubtopicDraft {
            title: format!("Subtopic {id}"),
            objective: "Understand it".to_string(),
            content: "Some content".to_string(),
            examples: vec![],
            exercises: vec![],
            introduction_prompt: "Introduce it".to_string(),
            explanation_prompt: "Explain it".to_string(),
            assessment_prompt: "Ask about it".to_string(),
        }
        .into_subtopic(id, topic_id, order_index)
    }
}
