//! # caseforge
//!
//! Retrieval-grounded generation of test cases and test scripts.
//!
//! Support documents are chunked, embedded and stored in a collection.
//! A requirement then flows through a two-agent pipeline: the test case
//! agent drafts structured cases from the requirement and the retrieved
//! context, the script agent turns the validated cases into one script
//! each. Every agent output is validated; rejected output is sent back
//! with the reason, a bounded number of times.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────┐   ┌──────────────┐   ┌──────────────┐
//! │  Loader   │──▶│   Ingestor   │──▶│ SQLite index │
//! │ md/pdf/.. │   │ chunk+embed  │   │  (per coll.) │
//! └───────────┘   └──────────────┘   └──────┬───────┘
//!                                           │ retrieve
//!                  ┌────────────────────────┘
//!                  ▼
//!         ┌──────────────────┐   ┌───────────┐
//!         │   Orchestrator   │──▶│ LLM client│
//!         │ testcases→script │   │ retry+sem │
//!         └────────┬─────────┘   └───────────┘
//!                  │
//!        ┌─────────┴─────────┐
//!        ▼                   ▼
//!   ┌──────────┐       ┌──────────┐
//!   │   CLI    │       │   HTTP   │
//!   │ (forge)  │       │ (status) │
//!   └──────────┘       └──────────┘
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing and validation |
//! | [`db`] / [`migrate`] | SQLite connection and schema |
//! | [`sqlite_store`] | Persistent chunk index |
//! | [`embedding`] | Embedding providers (hash, OpenAI, Ollama, local) |
//! | [`loader`] | Reading support files from disk |
//! | [`ingest`] | Document ingestion |
//! | [`retrieve`] | Query-time retrieval |
//! | [`llm`] | Chat backends and the retrying LLM client |
//! | [`agents`] | Test case and script agents |
//! | [`orchestrator`] | Request state machine, retries, cancellation |
//! | [`server`] | HTTP status interface |
//!
//! Pure logic (chunking, validation, prompts, the in-memory index) lives
//! in the `caseforge-core` crate.

pub mod agents;
pub mod app;
pub mod collections;
pub mod config;
pub mod db;
pub mod embedding;
pub mod generate;
pub mod ingest;
pub mod llm;
pub mod loader;
pub mod migrate;
pub mod orchestrator;
pub mod retrieve;
pub mod server;
pub mod sqlite_store;
