//! # caseforge core
//!
//! Shared, runtime-agnostic logic for caseforge: data models, chunking,
//! the chunk index abstraction, embedding trait, prompt composition,
//! output validation, and the request state machine vocabulary.
//!
//! This crate contains no tokio, sqlx, HTTP clients, or filesystem I/O.
//! Concrete providers, persistence, and the orchestrator live in the
//! `caseforge` app crate.

pub mod chunk;
pub mod embedding;
pub mod error;
pub mod framework;
pub mod models;
pub mod prompt;
pub mod selectors;
pub mod state;
pub mod store;
pub mod validate;
