//! Shared Application State
//!
//! Holds the session engine and the curriculum store the authoring routes
//! write to. Both are cheap to clone behind `Arc`.

use std::sync::Arc;
use tutor_core::SessionEngine;
use tutor_core::curriculum::CurriculumStore;

/// The shared application state, created once at startup and passed to all handlers.
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<SessionEngine>,
    /// The same store the engine reads snapshots from.
    pub curriculum: Arc<dyn CurriculumStore>,
}
