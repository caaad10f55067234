//! Understanding Classifier
//!
//! Grades an assessment exchange with a dedicated "judge" model call, separate
//! from the tutoring dialogue. The judge reply is parsed into a [`Verdict`] at
//! the boundary; an unparseable reply never leaves this module and is turned
//! into a flagged Yellow (or, on a repeat, a flagged Red).

use crate::curriculum::ResolvedSubtopic;
use crate::error::{Result, TutorError};
use crate::llm_client::{LanguageModel, Prompt, RetryPolicy, complete_with_retry};
use crate::progress::Status;
use crate::prompt::PromptTemplates;
use std::sync::Arc;
use tracing::{debug, warn};

/// Confidence reported when the judge gave a label but no usable number.
const DEFAULT_CONFIDENCE: f32 = 0.5;

/// The judge's answer as read off the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Green,
    Yellow,
    Red,
    Unparseable,
}

impl Verdict {
    /// Reads the label from a `VERDICT:` line if there is one, otherwise
    /// from the whole reply. Anything other than exactly one distinct label
    /// is `Unparseable`.
    pub fn parse(reply: &str) -> Verdict {
        let source = field(reply, "VERDICT").unwrap_or(reply);
        let mut found: Option<Verdict> = None;
        for word in source
            .split(|c: char| !c.is_ascii_alphabetic())
            .filter(|w| !w.is_empty())
        {
            let label = match word.to_ascii_uppercase().as_str() {
                "GREEN" => Verdict::Green,
                "YELLOW" => Verdict::Yellow,
                "RED" => Verdict::Red,
                _ => continue,
            };
            match found {
                None => found = Some(label),
                Some(existing) if existing == label => {}
                Some(_) => return Verdict::Unparseable,
            }
        }
        found.unwrap_or(Verdict::Unparseable)
    }

    fn status(self) -> Option<Status> {
        match self {
            Verdict::Green => Some(Status::Green),
            Verdict::Yellow => Some(Status::Yellow),
            Verdict::Red => Some(Status::Red),
            Verdict::Unparseable => None,
        }
    }
}

/// Value of a `NAME: value` line, matched case-insensitively.
fn field<'a>(reply: &'a str, name: &str) -> Option<&'a str> {
    reply.lines().find_map(|line| {
        let (key, value) = line.split_once(':')?;
        key.trim()
            .trim_start_matches(['*', '#', '-'])
            .trim()
            .eq_ignore_ascii_case(name)
            .then(|| value.trim())
    })
}

/// The question the tutor asked and the student's answer to it.
#[derive(Debug, Clone, Copy)]
pub struct AssessmentExchange<'a> {
    pub subtopic: ResolvedSubtopic<'a>,
    pub question: &'a str,
    pub answer: &'a str,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Classification {
    pub status: Status,
    pub confidence: f32,
    pub rationale: String,
    /// Set when the verdict came from the soft-fail policy.
    pub flagged: bool,
    pub verdict: Verdict,
}

impl Classification {
    pub fn was_parsed(&self) -> bool {
        self.verdict != Verdict::Unparseable
    }
}

pub struct UnderstandingClassifier {
    model: Arc<dyn LanguageModel>,
    templates: PromptTemplates,
    policy: RetryPolicy,
}

impl UnderstandingClassifier {
    pub fn new(model: Arc<dyn LanguageModel>, templates: PromptTemplates, policy: RetryPolicy) -> Self {
        Self {
            model,
            templates,
            policy,
        }
    }

    /// Grades one exchange.
    ///
    /// `prior_unparseable` is how many judge replies in a row, immediately
    /// before this one, could not be parsed for the same session. Model
    /// unavailability propagates; ambiguity does not.
    pub async fn classify(
        &self,
        exchange: &AssessmentExchange<'_>,
        prior_unparseable: u32,
    ) -> Result<Classification> {
        let subtopic = exchange.subtopic.subtopic;
        let text = self.templates.render(
            "judge",
            &[
                ("subtopic", &subtopic.title),
                ("objective", &subtopic.objective),
                ("content", &subtopic.content),
                ("question", exchange.question),
                ("answer", exchange.answer),
            ],
        )?;
        let reply =
            complete_with_retry(self.model.as_ref(), &Prompt::system(text), &self.policy).await?;
        debug!(subtopic_id = subtopic.id, reply = %reply, "Judge replied");
        Ok(interpret(&reply, prior_unparseable))
    }
}

/// Applies the soft-fail policy to a raw judge reply.
pub fn interpret(reply: &str, prior_unparseable: u32) -> Classification {
    let verdict = Verdict::parse(reply);
    match verdict.status() {
        Some(status) => Classification {
            status,
            confidence: field(reply, "CONFIDENCE")
                .and_then(|v| v.trim_end_matches('%').trim().parse::<f32>().ok())
                .map(|c| if c > 1.0 { c / 100.0 } else { c })
                .map(|c| c.clamp(0.0, 1.0))
                .unwrap_or(DEFAULT_CONFIDENCE),
            rationale: field(reply, "RATIONALE")
                .filter(|r| !r.is_empty())
                .unwrap_or_else(|| reply.trim())
                .to_string(),
            flagged: false,
            verdict,
        },
        None => {
            let ambiguity = TutorError::ClassificationAmbiguous(reply.trim().to_string());
            let escalated = prior_unparseable >= 1;
            warn!(error = %ambiguity, escalated, "Falling back to a flagged verdict");
            Classification {
                status: if escalated { Status::Red } else { Status::Yellow },
                confidence: 0.0,
                rationale: if escalated {
                    "The assessment could not be graded twice in a row.".to_string()
                } else {
                    "The assessment could not be graded automatically.".to_string()
                },
                flagged: true,
                verdict,
            }
        }
    }
}
