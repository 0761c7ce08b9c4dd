//! # Regulens
//!
//! A resumable compliance audit pipeline: given a regulation (a set of
//! clauses) and a library of procedure documents, determine for every clause
//! whether the organization's procedures demonstrate compliance.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────┐   ┌────────────┐   ┌────────────┐   ┌────────────┐
//! │ Need-Check │──▶│ Audit-Plan │──▶│   Search   │──▶│   Judge    │
//! │  (clause)  │   │  (tasks)   │   │ (evidence) │   │ (verdict)  │
//! └─────┬──────┘   └─────┬──────┘   └─────┬──────┘   └─────┬──────┘
//!       │                │                │                │
//!       └────────────────┴──── run.json ──┴────────────────┘
//!                                         ▲
//!              procedures ──▶ ingest ──▶ normalize ──▶ chunk+embed ──▶ index
//! ```
//!
//! Every stage checkpoints the run state after each unit of work, and every
//! expensive intermediate (embeddings, audit plans) lives in a content-keyed
//! cache, so an interrupted run resumes where it stopped.
//!
//! ## Quick Start
//!
//! ```bash
//! regulens --config ./config/regulens.toml run
//! regulens --config ./config/regulens.toml run --stop-after audit-plan
//! regulens --config ./config/regulens.toml status --json
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Core data types |
//! | [`error`] | Error types |
//! | [`cache`] | Content-keyed record and vector cache |
//! | [`connector_fs`] | Procedure file discovery |
//! | [`extract`] | PDF and delimited-table text extraction |
//! | [`ingest`] | Files to raw documents |
//! | [`normalize`] | Text cleanup and section detection |
//! | [`chunk`] | Token-bounded chunking |
//! | [`embedding`] | Cached chunk embedding |
//! | [`index`] | Persisted vector index |
//! | [`retrieve`] | Nearest-neighbor evidence retrieval |
//! | [`llm`] | Language-model gateway and OpenAI backend |
//! | [`run_state`] | Regulation parsing and run-state persistence |
//! | [`progress`] | Progress reporting |
//! | [`pipeline`] | Stage orchestration |
//! | [`verdict`] | Assessment aggregation |

pub mod cache;
pub mod chunk;
pub mod config;
pub mod connector_fs;
pub mod embedding;
pub mod error;
pub mod extract;
pub mod index;
pub mod ingest;
pub mod llm;
pub mod models;
pub mod normalize;
pub mod pipeline;
pub mod progress;
pub mod retrieve;
pub mod run_state;
pub mod verdict;
