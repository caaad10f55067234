//! Curriculum-driven tutoring engine.
//!
//! A student is walked through a lecture → topic → subtopic curriculum one
//! subtopic at a time. For each subtopic the [`engine::SessionEngine`] runs an
//! introduction, an open-ended explanation dialogue, and an assessment that a
//! separate judge call grades Red, Yellow or Green. Verdicts, transcripts and
//! generated study notes are kept in a [`progress::ProgressStore`]; the
//! curriculum itself lives behind a [`curriculum::CurriculumStore`] that
//! teachers edit independently.

pub mod analytics;
pub mod classifier;
pub mod config;
pub mod curriculum;
pub mod engine;
pub mod error;
pub mod llm_client;
pub mod locks;
pub mod memory;
pub mod notes;
pub mod progress;
pub mod prompt;
pub mod session;

pub use config::EngineConfig;
pub use engine::SessionEngine;
pub use error::{Result, TutorError};
