//! Note Generator
//!
//! Condenses a completed session into a study note with a dedicated model
//! call. Generation runs after the session has already completed, so failures
//! never reach the student: the slot stays `Pending` while attempts continue
//! and ends as `GenerationFailed` once they are exhausted.

use crate::curriculum::{Subtopic, Topic};
use crate::llm_client::{LanguageModel, Prompt, RetryPolicy, complete_with_retry};
use crate::progress::{Note, NoteState, ProgressStore};
use crate::prompt::{PromptTemplates, render_history};
use crate::session::Session;
use anyhow::{Context, Result, bail};
use chrono::Utc;
use serde::Deserialize;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{error, info, instrument, warn};

/// Everything a background generation needs, owned.
#[derive(Debug, Clone)]
pub struct NoteJob {
    pub session: Session,
    pub topic: Topic,
    pub subtopic: Subtopic,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct NoteReply {
    summary: String,
    #[serde(default)]
    key_points: Vec<String>,
    #[serde(default)]
    struggle_points: Vec<String>,
}

pub struct NoteGenerator {
    model: Arc<dyn LanguageModel>,
    templates: PromptTemplates,
    policy: RetryPolicy,
    /// Generation attempts after the first one.
    max_retries: u32,
}

impl NoteGenerator {
    pub fn new(
        model: Arc<dyn LanguageModel>,
        templates: PromptTemplates,
        policy: RetryPolicy,
        max_retries: u32,
    ) -> Self {
        Self {
            model,
            templates,
            policy,
            max_retries,
        }
    }

    /// One generation attempt over the full transcript.
    pub async fn generate(&self, job: &NoteJob) -> Result<Note> {
        let session = &job.session;
        let struggles = if session.struggles.is_empty() {
            "(none)".to_string()
        } else {
            session
                .struggles
                .iter()
                .map(|s| format!("- {s}"))
                .collect::<Vec<_>>()
                .join("\n")
        };
        let text = self.templates.render(
            "note",
            &[
                ("subtopic", &job.subtopic.title),
                ("topic", &job.topic.title),
                ("objective", &job.subtopic.objective),
                ("transcript", &render_history(&session.turns, usize::MAX)),
                ("struggles", &struggles),
            ],
        )?;
        let reply =
            complete_with_retry(self.model.as_ref(), &Prompt::system(text), &self.policy).await?;
        let parsed = parse_reply(&reply)?;

        let mut struggle_points = parsed.struggle_points;
        if struggle_points.is_empty() {
            struggle_points = session.struggles.clone();
        }
        Ok(Note {
            summary: parsed.summary,
            key_points: parsed.key_points,
            struggle_points,
            generated_at: Utc::now(),
        })
    }

    /// Generates with retries and records the outcome in the store. Writes
    /// are ignored by the store if a newer session has taken over the slot.
    #[instrument(skip_all, fields(student_id = %job.session.student_id, subtopic_id = job.subtopic.id, session_id = %job.session.id))]
    pub async fn run(&self, store: &dyn ProgressStore, job: NoteJob) {
        let attempts = self.max_retries + 1;
        let mut last_error = String::new();

        for attempt in 1..=attempts {
            match self.generate(&job).await {
                Ok(note) => {
                    self.record(store, &job, NoteState::Ready { note }).await;
                    info!(attempt, "Note generated");
                    return;
                }
                Err(e) => {
                    last_error = format!("{e:#}");
                    warn!(attempt, of = attempts, error = %last_error, "Note generation failed");
                }
            }
            if attempt < attempts {
                tokio::time::sleep(self.policy.backoff.saturating_mul(attempt)).await;
            }
        }

        self.record(
            store,
            &job,
            NoteState::GenerationFailed {
                attempts,
                last_error,
            },
        )
        .await;
    }

    /// Runs generation as a background task.
    pub fn spawn(self: &Arc<Self>, store: Arc<dyn ProgressStore>, job: NoteJob) -> JoinHandle<()> {
        let generator = Arc::clone(self);
        tokio::spawn(async move { generator.run(store.as_ref(), job).await })
    }

    async fn record(&self, store: &dyn ProgressStore, job: &NoteJob, state: NoteState) {
        let session = &job.session;
        match store
            .resolve_note(&session.student_id, session.subtopic_id, session.id, state)
            .await
        {
            Ok(true) => {}
            Ok(false) => info!("Note slot taken over by a newer session; result dropped"),
            Err(e) => error!(error = %e, "Failed to store note"),
        }
    }
}

/// Accepts the JSON object bare or inside a fenced code block.
fn parse_reply(reply: &str) -> Result<NoteReply> {
    let start = reply.find('{');
    let end = reply.rfind('}');
    let json = match (start, end) {
        (Some(s), Some(e)) if s < e => &reply[s..=e],
        _ => bail!("note reply contained no JSON object"),
    };
    let parsed: NoteReply =
        serde_json::from_str(json).context("note reply was not valid JSON")?;
    if parsed.summary.trim().is_empty() {
        bail!("note reply had an empty summary");
    }
    Ok(parsed)
}
