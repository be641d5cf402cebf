//! # Shelfwise Core
//!
//! Runtime-agnostic logic for shelfwise: the request/reply model, the
//! [`Handler`](handler::Handler) trait and registry, the dispatch loop, the
//! response quality gate, the [`DataStore`](store::DataStore) trait, dump
//! sanitising, the SQL builders for the derived inventory view and the
//! vector helpers behind semantic search.
//!
//! This crate contains no tokio, sqlx, HTTP or filesystem I/O. Concrete
//! backends, the mirror sync engine and the built-in handlers live in the
//! `shelfwise` crate.

pub mod dispatch;
pub mod error;
pub mod handler;
pub mod models;
pub mod names;
pub mod quality;
pub mod sanitize;
pub mod schema;
pub mod store;
pub mod vector;
