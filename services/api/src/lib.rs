//! Tutor API Library Crate
//!
//! The HTTP surface of the tutoring engine: configuration, PostgreSQL-backed
//! storage, request handlers and routing. The `api` binary is a thin wrapper
//! around this library.

pub mod config;
pub mod db;
pub mod handlers;
pub mod models;
pub mod router;
pub mod state;
