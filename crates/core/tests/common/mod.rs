#![allow(dead_code)]

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tutor_core::EngineConfig;
use tutor_core::SessionEngine;
use tutor_core::curriculum::{CurriculumDocument, import_document};
use tutor_core::llm_client::{LanguageModel, Prompt};
use tutor_core::memory::{InMemoryCurriculumStore, InMemoryProgressStore};
use tutor_core::prompt::PromptTemplates;

pub const QUESTION: &str = "In your own words, what does `age = 25` do?";
pub const WRAP_UP: &str = "Nicely done, that wraps up this lesson.";
pub const EXPLANATION: &str = "A variable is a name that refers to a value.";

/// Which template a prompt was rendered from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromptKind {
    Introduction,
    Explanation,
    Assessment,
    WrapUp,
    Judge,
    Note,
}

impl PromptKind {
    pub fn of(prompt: &Prompt) -> Self {
        let s = &prompt.system;
        if s.contains("impartial examiner") {
            PromptKind::Judge
        } else if s.contains("concise study notes") {
            PromptKind::Note
        } else if s.contains("checking a student's understanding") {
            PromptKind::Assessment
        } else if s.contains("closing the lesson") {
            PromptKind::WrapUp
        } else if s.contains("starting a new lesson") {
            PromptKind::Introduction
        } else {
            PromptKind::Explanation
        }
    }
}

/// A language model stub that answers from per-kind queues of scripted
/// replies and records every prompt it sees.
///
/// When a queue is empty the stub falls back to a fixed reply for that kind
/// (a Green verdict for the judge, a valid note for the note writer).
#[derive(Default)]
pub struct ScriptedModel {
    explanation: Mutex<VecDeque<Result<String, String>>>,
    judge: Mutex<VecDeque<Result<String, String>>>,
    notes: Mutex<VecDeque<Result<String, String>>>,
    seen: Mutex<Vec<(PromptKind, Prompt)>>,
}

impl ScriptedModel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn judge(self, replies: &[&str]) -> Self {
        self.judge
            .lock()
            .unwrap()
            .extend(replies.iter().map(|r| Ok(r.to_string())));
        self
    }

    pub fn judge_failures(self, count: usize) -> Self {
        self.judge
            .lock()
            .unwrap()
            .extend((0..count).map(|_| Err("judge offline".to_string())));
        self
    }

    pub fn explanation(self, replies: &[&str]) -> Self {
        self.explanation
            .lock()
            .unwrap()
            .extend(replies.iter().map(|r| Ok(r.to_string())));
        self
    }

    pub fn note_failures(self, count: usize) -> Self {
        self.notes
            .lock()
            .unwrap()
            .extend((0..count).map(|_| Err("note writer offline".to_string())));
        self
    }

    pub fn prompts_of(&self, kind: PromptKind) -> Vec<Prompt> {
        self.seen
            .lock()
            .unwrap()
            .iter()
            .filter(|(k, _)| *k == kind)
            .map(|(_, p)| p.clone())
            .collect()
    }

    pub fn kinds(&self) -> Vec<PromptKind> {
        self.seen.lock().unwrap().iter().map(|(k, _)| *k).collect()
    }
}

#[async_trait]
impl LanguageModel for ScriptedModel {
    async fn complete(&self, prompt: Prompt) -> Result<String> {
        // Yield once so concurrent callers interleave as they would over a network.
        tokio::task::yield_now().await;
        let kind = PromptKind::of(&prompt);
        self.seen.lock().unwrap().push((kind, prompt));
        let scripted = match kind {
            PromptKind::Judge => self.judge.lock().unwrap().pop_front(),
            PromptKind::Note => self.notes.lock().unwrap().pop_front(),
            PromptKind::Explanation => self.explanation.lock().unwrap().pop_front(),
            _ => None,
        };
        match scripted {
            Some(Ok(reply)) => Ok(reply),
            Some(Err(message)) => Err(anyhow!(message)),
            None => Ok(match kind {
                PromptKind::Introduction => "Welcome! What do you already know about variables?",
                PromptKind::Explanation => EXPLANATION,
                PromptKind::Assessment => QUESTION,
                PromptKind::WrapUp => WRAP_UP,
                PromptKind::Judge => "VERDICT: GREEN\nCONFIDENCE: 0.9\nRATIONALE: Clear and correct.",
                PromptKind::Note => {
                    r#"{"summary": "Covered variables.", "keyPoints": ["names refer to values"]}"#
                }
            }
            .to_string()),
        }
    }
}

/// Three subtopics across two lectures.
pub fn document() -> CurriculumDocument {
    serde_json::from_str(
        r#"{
        "lectures": [
            {
                "title": "Python Fundamentals",
                "topics": [{
                    "title": "Variables and Data Types",
                    "subtopics": [
                        {
                            "title": "Creating Variables",
                            "objective": "Create variables and assign values",
                            "content": "A variable stores a value under a name.",
                            "examples": [
                                {"code": "name = 'Alice'", "explanation": "a string"},
                                {"code": "age = 25", "explanation": "an integer"},
                                {"code": "height = 5.8", "explanation": "a float"}
                            ],
                            "introductionPrompt": "Relate variables to labelled boxes.",
                            "explanationPrompt": "Use everyday analogies.",
                            "assessmentPrompt": "Ask the student to explain assignment."
                        },
                        {
                            "title": "Variable Types",
                            "objective": "Name the basic types",
                            "content": "int, float, str and bool."
                        }
                    ]
                }]
            },
            {
                "title": "Control Flow",
                "topics": [{
                    "title": "Conditionals",
                    "subtopics": [{"title": "If Statements", "objective": "Branch on a condition"}]
                }]
            }
        ]
    }"#,
    )
    .unwrap()
}

pub struct Harness {
    pub engine: Arc<SessionEngine>,
    pub model: Arc<ScriptedModel>,
    pub progress: Arc<InMemoryProgressStore>,
    pub curriculum: Arc<InMemoryCurriculumStore>,
}

pub fn fast_config() -> EngineConfig {
    EngineConfig {
        max_model_retries: 0,
        model_retry_backoff_millis: 1,
        max_note_retries: 1,
        ..EngineConfig::default()
    }
}

pub async fn harness(model: ScriptedModel) -> Harness {
    harness_with(model, fast_config()).await
}

pub async fn harness_with(model: ScriptedModel, config: EngineConfig) -> Harness {
    let curriculum = Arc::new(InMemoryCurriculumStore::new());
    import_document(curriculum.as_ref(), document()).await.unwrap();
    let progress = Arc::new(InMemoryProgressStore::new());
    let model = Arc::new(model);
    let engine = Arc::new(SessionEngine::new(
        config,
        curriculum.clone(),
        progress.clone(),
        model.clone(),
        PromptTemplates::default(),
    ));
    Harness {
        engine,
        model,
        progress,
        curriculum,
    }
}
