//! # Shelfwise
//!
//! Request routing and primary/mirror data access for a conversational
//! inventory assistant.
//!
//! Every message is scored by all registered handlers at once; the best
//! candidates are asked for a reply in turn until one passes the quality
//! gate. Handlers read inventory through a router that prefers the
//! PostgreSQL primary and falls back to an embedded SQLite mirror rebuilt
//! from periodic dumps.
//!
//! ## Architecture
//!
//! ```text
//!   request ──▶ DispatchController ──▶ Handler::handle ──▶ QualityGate
//!                                          │
//!                                          ▼
//!                                  DataAccessRouter
//!                                   │            │
//!                                   ▼            ▼
//!                          PostgresStore   SqliteStore ◀── MirrorSyncEngine ◀── dump
//!                            (primary)       (mirror)
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`app`] | Wiring of stores, router, handlers and dispatcher |
//! | [`config`] | TOML configuration parsing and validation |
//! | [`dump`] | Streaming `pg_dump` reader and SQLite translation |
//! | [`embed_cmd`] | Product embedding backfill |
//! | [`embedding`] | Embedding providers |
//! | [`handlers`] | Built-in handlers |
//! | [`llm`] | Text generation providers |
//! | [`mirror`] | Mirror rebuild, metadata and scheduling |
//! | [`router`] | Per-call store selection and failover |
//! | [`server`] | HTTP API |
//! | [`stores`] | sqlx-backed data stores |
//!
//! Runtime-agnostic pieces (models, dispatch, quality gate, sanitiser,
//! schema adaptation) live in the `shelfwise-core` crate.

pub mod app;
pub mod config;
pub mod dump;
pub mod embed_cmd;
pub mod embedding;
pub mod handlers;
pub mod llm;
pub mod mirror;
pub mod router;
pub mod server;
pub mod stores;
