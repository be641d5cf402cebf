//! In-memory [`DataStore`] for tests.
//!
//! Answers queries from canned tables keyed by a SQL fragment, records every
//! call, and can be flipped unreachable (or made to fail a set number of
//! calls) to exercise failover and retry paths.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::RwLock;

use async_trait::async_trait;

use crate::error::StoreError;
use crate::models::{SqlValue, Table};
use crate::schema::Dialect;

use super::{BackendKind, DataStore};

/// A call seen by a [`MemoryStore`].
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedCall {
    pub sql: String,
    pub params: Vec<SqlValue>,
    pub read_only: bool,
}

pub struct MemoryStore {
    kind: BackendKind,
    dialect: Dialect,
    reachable: AtomicBool,
    responses: RwLock<Vec<(String, Table)>>,
    columns: RwLock<Vec<(String, Vec<String>)>>,
    calls: RwLock<Vec<RecordedCall>>,
    probes: AtomicUsize,
    failures: AtomicUsize,
    attempts: AtomicUsize,
}

impl MemoryStore {
    pub fn new(kind: BackendKind) -> Self {
        Self {
            kind,
            dialect: Dialect::Sqlite,
            reachable: AtomicBool::new(true),
            responses: RwLock::new(Vec::new()),
            columns: RwLock::new(Vec::new()),
            calls: RwLock::new(Vec::new()),
            probes: AtomicUsize::new(0),
            failures: AtomicUsize::new(0),
            attempts: AtomicUsize::new(0),
        }
    }

    pub fn with_dialect(mut self, dialect: Dialect) -> Self {
        self.dialect = dialect;
        self
    }

    /// Return `table` for any query containing `fragment`. First match wins.
    pub fn respond(&self, fragment: &str, table: Table) {
        if let Ok(mut responses) = self.responses.write() {
            responses.push((fragment.to_string(), table));
        }
    }

    pub fn set_columns(&self, table: &str, columns: &[&str]) {
        if let Ok(mut all) = self.columns.write() {
            all.push((
                table.to_string(),
                columns.iter().map(|c| c.to_string()).collect(),
            ));
        }
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.read().map(|c| c.clone()).unwrap_or_default()
    }

    pub fn probe_count(&self) -> usize {
        self.probes.load(Ordering::SeqCst)
    }

    /// Fail the next `n` queries and executes with a connectivity error.
    /// Probes are unaffected.
    pub fn fail_next(&self, n: usize) {
        self.failures.store(n, Ordering::SeqCst);
    }

    /// Queries and executes started, including failed ones.
    pub fn attempt_count(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    fn check_reachable(&self) -> Result<(), StoreError> {
        if self.reachable.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StoreError::unavailable(
                self.kind.to_string(),
                "connection refused",
            ))
        }
    }

    fn begin_call(&self) -> Result<(), StoreError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        self.check_reachable()?;
        let injected = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(StoreError::unavailable(
                self.kind.to_string(),
                "connection reset",
            ));
        }
        Ok(())
    }

    fn record(&self, sql: &str, params: &[SqlValue], read_only: bool) {
        if let Ok(mut calls) = self.calls.write() {
            calls.push(RecordedCall {
                sql: sql.to_string(),
                params: params.to_vec(),
                read_only,
            });
        }
    }

    fn answer(&self, sql: &str) -> Result<Table, StoreError> {
        let responses = self
            .responses
            .read()
            .map_err(|e| StoreError::Query(e.to_string()))?;
        Ok(responses
            .iter()
            .find(|(fragment, _)| sql.contains(fragment.as_str()))
            .map(|(_, table)| table.clone())
            .unwrap_or_default())
    }
}

#[async_trait]
impl DataStore for MemoryStore {
    fn kind(&self) -> BackendKind {
        self.kind
    }

    fn dialect(&self) -> Dialect {
        self.dialect
    }

    async fn probe(&self) -> Result<(), StoreError> {
        self.probes.fetch_add(1, Ordering::SeqCst);
        self.check_reachable()
    }

    async fn query(&self, sql: &str, params: &[SqlValue]) -> Result<Table, StoreError> {
        self.begin_call()?;
        self.record(sql, params, false);
        self.answer(sql)
    }

    async fn execute(&self, sql: &str, params: &[SqlValue]) -> Result<u64, StoreError> {
        self.begin_call()?;
        self.record(sql, params, false);
        Ok(0)
    }

    async fn query_read_only(&self, sql: &str, params: &[SqlValue]) -> Result<Table, StoreError> {
        self.begin_call()?;
        self.record(sql, params, true);
        self.answer(sql)
    }

    async fn columns(&self, table: &str) -> Result<Vec<String>, StoreError> {
        self.check_reachable()?;
        let columns = self
            .columns
            .read()
            .map_err(|e| StoreError::Query(e.to_string()))?;
        Ok(columns
            .iter()
            .find(|(name, _)| name == table)
            .map(|(_, cols)| cols.clone())
            .unwrap_or_default())
    }
}
