//! Prompt Composer
//!
//! Turns a phase, a subtopic, the conversation so far and the student's
//! language into the exact instruction sent to the language model. Composition
//! is a pure function of its inputs.
//!
//! The wording lives in `{placeholder}` templates, one per prompt kind. Built-in
//! defaults ship with the crate and can be overridden from a directory of `.md`
//! files named after the template key.

use crate::curriculum::{CodeExample, ResolvedSubtopic};
use crate::error::{Result, TutorError};
use crate::llm_client::Prompt;
use crate::progress::Status;
use crate::session::{Phase, Speaker, Turn};
use std::collections::HashMap;
use std::path::Path;
use tracing::{info, warn};

/// Token a tutor reply ends with when the model proposes moving to assessment.
pub const READY_MARKER: &str = "[READY_FOR_ASSESSMENT]";

/// Number of most recent turns included as conversation context.
pub const HISTORY_WINDOW: usize = 8;

/// Examples shown when introducing a subtopic.
const INTRODUCTION_EXAMPLES: usize = 2;

/// Every template key with its built-in text and the placeholders it may use.
const TEMPLATES: &[(&str, &str, &[&str])] = &[
    (
        "introduction",
        include_str!("../prompts/introduction.md"),
        &["subtopic", "topic", "lecture", "objective", "content", "examples", "phase_prompt", "language"],
    ),
    (
        "explanation",
        include_str!("../prompts/explanation.md"),
        &[
            "subtopic",
            "topic",
            "objective",
            "content",
            "examples",
            "history",
            "student_message",
            "guidance",
            "phase_prompt",
            "language",
            "ready_marker",
        ],
    ),
    (
        "assessment",
        include_str!("../prompts/assessment.md"),
        &["subtopic", "topic", "objective", "content", "history", "phase_prompt", "directive", "language"],
    ),
    (
        "assessment_directive",
        include_str!("../prompts/assessment_directive.md"),
        &[],
    ),
    (
        "guidance_red",
        include_str!("../prompts/guidance_red.md"),
        &["rationale"],
    ),
    (
        "guidance_yellow",
        include_str!("../prompts/guidance_yellow.md"),
        &["rationale"],
    ),
    (
        "wrap_up",
        include_str!("../prompts/wrap_up.md"),
        &["subtopic", "topic", "verdict", "history", "next_subtopic", "language"],
    ),
    (
        "judge",
        include_str!("../prompts/judge.md"),
        &["subtopic", "objective", "content", "question", "answer"],
    ),
    (
        "note",
        include_str!("../prompts/note.md"),
        &["subtopic", "topic", "objective", "transcript", "struggles"],
    ),
];

/// The set of prompt templates in use.
#[derive(Debug, Clone)]
pub struct PromptTemplates {
    templates: HashMap<String, String>,
}

impl Default for PromptTemplates {
    fn default() -> Self {
        Self {
            templates: TEMPLATES
                .iter()
                .map(|(key, text, _)| (key.to_string(), text.to_string()))
                .collect(),
        }
    }
}

impl PromptTemplates {
    /// Loads `<key>.md` overrides from a directory on top of the defaults.
    pub fn load_dir(path: &Path) -> Result<Self> {
        let mut templates = Self::default();
        let entries = std::fs::read_dir(path)
            .map_err(|e| TutorError::Template(format!("cannot read {}: {e}", path.display())))?;
        for entry in entries {
            let path = entry
                .map_err(|e| TutorError::Template(e.to_string()))?
                .path();
            if !path.is_file() || path.extension().and_then(|s| s.to_str()) != Some("md") {
                continue;
            }
            let Some(key) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            if placeholders_for(key).is_none() {
                warn!(file = %path.display(), "Ignoring unknown prompt template");
                continue;
            }
            let text = std::fs::read_to_string(&path)
                .map_err(|e| TutorError::Template(format!("cannot read {}: {e}", path.display())))?;
            templates = templates.with_override(key, text)?;
            info!(template = key, "Loaded prompt template override");
        }
        Ok(templates)
    }

    /// Replaces one template after checking its placeholders.
    pub fn with_override(mut self, key: &str, text: impl Into<String>) -> Result<Self> {
        let text = text.into();
        let allowed = placeholders_for(key)
            .ok_or_else(|| TutorError::Template(format!("unknown template '{key}'")))?;
        if let Some(unknown) = placeholders(&text).find(|p| !allowed.contains(p)) {
            return Err(TutorError::Template(format!(
                "template '{key}' uses unknown placeholder '{{{unknown}}}'"
            )));
        }
        self.templates.insert(key.to_string(), text);
        Ok(self)
    }

    /// Renders a template, substituting each `{name}` in a single pass.
    pub fn render(&self, key: &str, vars: &[(&str, &str)]) -> Result<String> {
        let template = self
            .templates
            .get(key)
            .ok_or_else(|| TutorError::Template(format!("missing template '{key}'")))?;
        Ok(substitute(template, vars))
    }
}

fn placeholders_for(key: &str) -> Option<&'static [&'static str]> {
    TEMPLATES
        .iter()
        .find(|(k, _, _)| *k == key)
        .map(|(_, _, allowed)| *allowed)
}

/// `{identifier}` tokens in a template. Braces around anything else (JSON
/// samples, code) are left alone.
fn placeholders(text: &str) -> impl Iterator<Item = &str> {
    text.split('{').skip(1).filter_map(|rest| {
        let end = rest.find('}')?;
        let name = &rest[..end];
        let is_ident =
            !name.is_empty() && name.chars().all(|c| c.is_ascii_lowercase() || c == '_');
        is_ident.then_some(name)
    })
}

fn substitute(template: &str, vars: &[(&str, &str)]) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find('{') {
        out.push_str(&rest[..start]);
        let after = &rest[start + 1..];
        let value = after.find('}').and_then(|end| {
            let name = &after[..end];
            vars.iter()
                .find(|(k, _)| *k == name)
                .map(|(_, v)| (*v, end))
        });
        match value {
            Some((v, end)) => {
                out.push_str(v);
                rest = &after[end + 1..];
            }
            None => {
                out.push('{');
                rest = after;
            }
        }
    }
    out.push_str(rest);
    out
}

/// Extra instruction layered onto a phase prompt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Directive {
    /// Re-explain after a Red or Yellow verdict.
    Remediate { status: Status, rationale: String },
    /// Close the lesson after it completes.
    WrapUp {
        status: Status,
        next_subtopic: Option<String>,
    },
}

/// Inputs for one composition.
#[derive(Debug, Clone, Copy)]
pub struct PromptContext<'a> {
    pub subtopic: ResolvedSubtopic<'a>,
    /// Full transcript, including the student's latest turn if there is one.
    pub history: &'a [Turn],
    pub language: &'a str,
    pub directive: Option<&'a Directive>,
}

#[derive(Debug, Clone, Default)]
pub struct PromptComposer {
    templates: PromptTemplates,
}

impl PromptComposer {
    pub fn new(templates: PromptTemplates) -> Self {
        Self { templates }
    }

    /// Builds the tutor prompt for the phase the session is entering.
    pub fn compose(&self, phase: Phase, ctx: &PromptContext<'_>) -> Result<Prompt> {
        let s = ctx.subtopic;
        let text = match phase {
            Phase::Introduction => {
                let examples = render_examples(&s.subtopic.examples, INTRODUCTION_EXAMPLES);
                self.templates.render(
                    "introduction",
                    &[
                        ("subtopic", &s.subtopic.title),
                        ("topic", &s.topic.title),
                        ("lecture", &s.lecture.title),
                        ("objective", &s.subtopic.objective),
                        ("content", &s.subtopic.content),
                        ("examples", &examples),
                        ("phase_prompt", &s.subtopic.prompts.introduction),
                        ("language", ctx.language),
                    ],
                )?
            }
            Phase::Explanation => {
                let (earlier, latest) = split_latest_student_turn(ctx.history);
                let history = render_history(earlier, HISTORY_WINDOW);
                let examples = render_examples(&s.subtopic.examples, usize::MAX);
                let guidance = match ctx.directive {
                    Some(Directive::Remediate { status, rationale }) => {
                        self.guidance(*status, rationale)?
                    }
                    _ => String::new(),
                };
                self.templates.render(
                    "explanation",
                    &[
                        ("subtopic", &s.subtopic.title),
                        ("topic", &s.topic.title),
                        ("objective", &s.subtopic.objective),
                        ("content", &s.subtopic.content),
                        ("examples", &examples),
                        ("history", &history),
                        ("student_message", latest.map(|t| t.text.as_str()).unwrap_or("")),
                        ("guidance", &guidance),
                        ("phase_prompt", &s.subtopic.prompts.explanation),
                        ("language", ctx.language),
                        ("ready_marker", READY_MARKER),
                    ],
                )?
            }
            Phase::Assessment => {
                let history = render_history(ctx.history, HISTORY_WINDOW);
                let directive = self.templates.render("assessment_directive", &[])?;
                self.templates.render(
                    "assessment",
                    &[
                        ("subtopic", &s.subtopic.title),
                        ("topic", &s.topic.title),
                        ("objective", &s.subtopic.objective),
                        ("content", &s.subtopic.content),
                        ("history", &history),
                        ("phase_prompt", &s.subtopic.prompts.assessment),
                        ("directive", directive.trim()),
                        ("language", ctx.language),
                    ],
                )?
            }
            Phase::Completed => {
                let (status, next) = match ctx.directive {
                    Some(Directive::WrapUp {
                        status,
                        next_subtopic,
                    }) => (*status, next_subtopic.as_deref()),
                    _ => (Status::Green, None),
                };
                let next_line = match next {
                    Some(title) => format!("Tell them the next lesson is \"{title}\"."),
                    None => "Tell them they have finished the whole curriculum.".to_string(),
                };
                let history = render_history(ctx.history, HISTORY_WINDOW);
                self.templates.render(
                    "wrap_up",
                    &[
                        ("subtopic", &s.subtopic.title),
                        ("topic", &s.topic.title),
                        ("verdict", status.as_str()),
                        ("history", &history),
                        ("next_subtopic", &next_line),
                        ("language", ctx.language),
                    ],
                )?
            }
            Phase::Abandoned => {
                return Err(TutorError::invalid_transition(phase, "compose a tutor prompt"));
            }
        };
        Ok(Prompt::system(text))
    }

    fn guidance(&self, status: Status, rationale: &str) -> Result<String> {
        let key = match status {
            Status::Red => "guidance_red",
            Status::Yellow => "guidance_yellow",
            Status::Green | Status::NotStarted => return Ok(String::new()),
        };
        self.templates.render(key, &[("rationale", rationale)])
    }
}

/// Removes the readiness marker from a tutor reply. Returns the cleaned text
/// and whether the marker was present.
pub fn strip_ready_marker(reply: &str) -> (String, bool) {
    if !reply.contains(READY_MARKER) {
        return (reply.trim().to_string(), false);
    }
    (reply.replace(READY_MARKER, "").trim().to_string(), true)
}

fn split_latest_student_turn(history: &[Turn]) -> (&[Turn], Option<&Turn>) {
    match history.last() {
        Some(turn) if turn.speaker == Speaker::Student => {
            (&history[..history.len() - 1], Some(turn))
        }
        _ => (history, None),
    }
}

/// The last `window` turns as `speaker: text` lines.
pub fn render_history(history: &[Turn], window: usize) -> String {
    let start = history.len().saturating_sub(window);
    let lines: Vec<String> = history[start..]
        .iter()
        .map(|t| format!("{}: {}", t.speaker, t.text))
        .collect();
    if lines.is_empty() {
        "(none yet)".to_string()
    } else {
        lines.join("\n")
    }
}

fn render_examples(examples: &[CodeExample], limit: usize) -> String {
    if examples.is_empty() {
        return String::new();
    }
    let lines: Vec<String> = examples
        .iter()
        .take(limit)
        .map(|ex| format!("• {}: {}", ex.code, ex.explanation))
        .collect();
    format!("\nExamples:\n{}\n", lines.join("\n"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::curriculum::{CurriculumTree, fixtures::*};
    use chrono::Utc;

    fn tree() -> CurriculumTree {
        let mut s = subtopic(100, 10, 0);
        s.title = "Creating Variables".to_string();
        s.examples = vec![
            CodeExample {
                code: "name = 'Alice'".to_string(),
                explanation: "a string".to_string(),
            },
            CodeExample {
                code: "age = 25".to_string(),
                explanation: "an integer".to_string(),
            },
            CodeExample {
                code: "height = 5.8".to_string(),
                explanation: "a float".to_string(),
            },
        ];
        CurriculumTree::new(1, vec![lecture(1, 0)], vec![topic(10, 1, 0)], vec![s])
    }

    fn turns(texts: &[(Speaker, &str)]) -> Vec<Turn> {
        let now = Utc::now();
        texts
            .iter()
            .map(|(speaker, text)| Turn::new(*speaker, *text, now))
            .collect()
    }

    #[test]
    fn test_introduction_ignores_history_and_limits_examples() {
        let tree = tree();
        let composer = PromptComposer::default();
        let history = turns(&[(Speaker::Student, "secret earlier message")]);
        let prompt = composer
            .compose(
                Phase::Introduction,
                &PromptContext {
                    subtopic: tree.resolve(100).unwrap(),
                    history: &history,
                    language: "es",
                    directive: None,
                },
            )
            .unwrap();
        assert!(prompt.system.contains("Creating Variables"));
        assert!(prompt.system.contains("\"es\""));
        assert!(prompt.system.contains("Introduce it"));
        assert!(prompt.system.contains("age = 25"));
        assert!(!prompt.system.contains("height = 5.8"));
        assert!(!prompt.system.contains("secret earlier message"));
    }

    #[test]
    fn test_explanation_includes_latest_utterance_and_guidance() {
        let tree = tree();
        let composer = PromptComposer::default();
        let history = turns(&[
            (Speaker::Tutor, "What is a variable?"),
            (Speaker::Student, "A box for values?"),
        ]);
        let directive = Directive::Remediate {
            status: Status::Red,
            rationale: "confused assignment with equality".to_string(),
        };
        let prompt = composer
            .compose(
                Phase::Explanation,
                &PromptContext {
                    subtopic: tree.resolve(100).unwrap(),
                    history: &history,
                    language: "en",
                    directive: Some(&directive),
                },
            )
            .unwrap();
        assert!(prompt.system.contains("The student just said: \"A box for values?\""));
        assert!(prompt.system.contains("tutor: What is a variable?"));
        assert!(prompt.system.contains("confused assignment with equality"));
        assert!(prompt.system.contains(READY_MARKER));
        assert!(prompt.system.contains("height = 5.8"));
    }

    #[test]
    fn test_assessment_carries_directive_and_is_deterministic() {
        let tree = tree();
        let composer = PromptComposer::default();
        let history = turns(&[(Speaker::Tutor, "hello")]);
        let ctx = PromptContext {
            subtopic: tree.resolve(100).unwrap(),
            history: &history,
            language: "en",
            directive: None,
        };
        let a = composer.compose(Phase::Assessment, &ctx).unwrap();
        let b = composer.compose(Phase::Assessment, &ctx).unwrap();
        assert_eq!(a, b);
        assert!(a.system.contains("Ask exactly one open question"));
        assert!(a.system.contains("Ask about it"));
    }

    #[test]
    fn test_directive_is_tunable() {
        let templates = PromptTemplates::default()
            .with_override("assessment_directive", "Ask a multiple choice question.")
            .unwrap();
        let composer = PromptComposer::new(templates);
        let tree = tree();
        let prompt = composer
            .compose(
                Phase::Assessment,
                &PromptContext {
                    subtopic: tree.resolve(100).unwrap(),
                    history: &[],
                    language: "en",
                    directive: None,
                },
            )
            .unwrap();
        assert!(prompt.system.contains("Ask a multiple choice question."));
    }

    #[test]
    fn test_abandoned_phase_is_rejected() {
        let tree = tree();
        let err = PromptComposer::default()
            .compose(
                Phase::Abandoned,
                &PromptContext {
                    subtopic: tree.resolve(100).unwrap(),
                    history: &[],
                    language: "en",
                    directive: None,
                },
            )
            .unwrap_err();
        assert!(matches!(err, TutorError::InvalidPhaseTransition { .. }));
    }

    #[test]
    fn test_override_rejects_unknown_placeholders() {
        let err = PromptTemplates::default()
            .with_override("judge", "Grade {answer} against {rubric}")
            .unwrap_err();
        assert!(err.to_string().contains("{rubric}"));

        let err = PromptTemplates::default()
            .with_override("nonsense", "text")
            .unwrap_err();
        assert!(err.to_string().contains("unknown template"));
    }

    #[test]
    fn test_substitute_is_single_pass() {
        let out = substitute(
            "Q: {question} / {answer} / {\"json\": 1}",
            &[("question", "{answer}"), ("answer", "42")],
        );
        assert_eq!(out, "Q: {answer} / 42 / {\"json\": 1}");
    }

    #[test]
    fn test_strip_ready_marker() {
        let (text, ready) = strip_ready_marker("Great work!\n[READY_FOR_ASSESSMENT]\n");
        assert_eq!(text, "Great work!");
        assert!(ready);
        let (text, ready) = strip_ready_marker("  Keep going. ");
        assert_eq!(text, "Keep going.");
        assert!(!ready);
    }

    #[test]
    fn test_render_history_window() {
        let history = turns(&[
            (Speaker::Tutor, "one"),
            (Speaker::Student, "two"),
            (Speaker::Tutor, "three"),
        ]);
        assert_eq!(render_history(&history, 2), "student: two\ntutor: three");
        assert_eq!(render_history(&[], 8), "(none yet)");
    }

    #[test]
    fn test_load_dir_overrides_defaults() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("assessment_directive.md"),
            "Ask one short question.",
        )
        .unwrap();
        std::fs::write(dir.path().join("README.txt"), "not a template").unwrap();

        let templates = PromptTemplates::load_dir(dir.path()).unwrap();
        assert_eq!(
            templates.render("assessment_directive", &[]).unwrap(),
            "Ask one short question."
        );
        assert!(templates.render("judge", &[]).unwrap().contains("VERDICT"));
    }
}
