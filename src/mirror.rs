//! Embedded mirror maintenance.
//!
//! The [`MirrorSyncEngine`] owns the SQLite file that stands in for the
//! primary when it is unreachable. A sync streams a plain-text `pg_dump`
//! (optionally gzipped) through the sanitiser, replays it into a fresh
//! temporary file, materialises the `app_inventory` view, records metadata
//! and finally renames the file over the previous mirror. Readers hold an `Arc` to the snapshot that was
//! current when they started, so a sync never exposes a half-built file.
//!
//! # Sync triggers
//!
//! | Trigger | Entry point |
//! |---------|-------------|
//! | startup with no usable mirror file | [`MirrorSyncEngine::startup`] |
//! | timer (`auto_sync`) | [`MirrorSyncEngine::spawn_auto_sync`] |
//! | router fallback with no snapshot | [`MirrorSource::ensure_ready`] |
//! | operator (`shelf mirror sync`, `POST /mirror/sync`) | [`MirrorSyncEngine::sync`] |
//!
//! Syncs are serialised; a failed sync leaves the previous snapshot in place
//! and marks the mirror stale.

use arc_swap::ArcSwapOption;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use sqlx::{Sqlite, Transaction};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use shelfwise_core::error::{ConfigurationError, StoreError, SyncError};
use shelfwise_core::models::SqlValue;
use shelfwise_core::sanitize::DumpSanitizer;
use shelfwise_core::schema::StoreSource;
use shelfwise_core::store::{refresh_inventory_view, BackendKind, DataStore};

use crate::config::MirrorConfig;
use crate::dump::{
    file_checksum, first_line, normalize_table_name, parse_copy_row, translate_for_sqlite,
    CopyCommand, DumpEvent, DumpReader,
};
use crate::router::MirrorSource;
use crate::stores::sqlite::bind_params;
use crate::stores::SqliteStore;

/// Single-row table inside the mirror file describing how it was built.
pub const METADATA_TABLE: &str = "_shelfwise_mirror";

/// COPY rows inserted per transaction.
pub const COPY_BATCH_ROWS: usize = 5_000;

/// Snapshot of the engine's bookkeeping, as reported by `mirror status`.
#[derive(Debug, Clone, Serialize)]
pub struct MirrorState {
    pub path: PathBuf,
    pub dump_path: Option<PathBuf>,
    pub ready: bool,
    pub last_sync: Option<DateTime<Utc>>,
    pub checksum: Option<String>,
    pub source: Option<String>,
    pub store_source: Option<StoreSource>,
    pub auto_sync: bool,
    pub sync_interval_secs: u64,
    pub stale: bool,
    pub sync_in_progress: bool,
    pub last_error: Option<String>,
}

/// Counts from one replay.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ReplayReport {
    pub statements: usize,
    pub skipped: usize,
    pub failed: usize,
    pub copied_rows: u64,
    pub rejected_rows: u64,
}

struct Built {
    report: ReplayReport,
    store_source: StoreSource,
    synced_at: DateTime<Utc>,
}

pub struct MirrorSyncEngine {
    config: MirrorConfig,
    path: PathBuf,
    sanitizer: DumpSanitizer,
    snapshot: ArcSwapOption<SqliteStore>,
    state: Mutex<MirrorState>,
    sync_lock: tokio::sync::Mutex<()>,
}

/// Holds `sync_in_progress` up for the lifetime of one sync.
struct InProgress<'a>(&'a Mutex<MirrorState>);

impl<'a> InProgress<'a> {
    fn enter(state: &'a Mutex<MirrorState>) -> Self {
        state.lock().sync_in_progress = true;
        Self(state)
    }
}

impl Drop for InProgress<'_> {
    fn drop(&mut self) {
        self.0.lock().sync_in_progress = false;
    }
}

impl MirrorSyncEngine {
    pub fn new(config: MirrorConfig) -> Result<Self, ConfigurationError> {
        let path = config
            .path
            .clone()
            .ok_or_else(|| ConfigurationError::new("mirror.path must be set for the mirror"))?;

        let state = MirrorState {
            path: path.clone(),
            dump_path: config.dump_path.clone(),
            ready: false,
            last_sync: None,
            checksum: None,
            source: None,
            store_source: None,
            auto_sync: config.auto_sync,
            sync_interval_secs: config.sync_interval_secs,
            stale: false,
            sync_in_progress: false,
            last_error: None,
        };

        Ok(Self {
            sanitizer: DumpSanitizer::new(config.role_markers.clone()),
            config,
            path,
            snapshot: ArcSwapOption::empty(),
            state: Mutex::new(state),
            sync_lock: tokio::sync::Mutex::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The installed snapshot, if any.
    pub fn store(&self) -> Option<Arc<SqliteStore>> {
        self.snapshot.load_full()
    }

    pub fn state(&self) -> MirrorState {
        let mut state = self.state.lock().clone();
        state.ready = self.snapshot.load().is_some();
        state
    }

    /// Adopt an existing mirror file if it carries valid metadata.
    ///
    /// Returns whether a snapshot is installed afterwards.
    pub async fn open(&self) -> bool {
        if self.snapshot.load().is_some() {
            return true;
        }

        let non_empty = tokio::fs::metadata(&self.path)
            .await
            .map(|m| m.is_file() && m.len() > 0)
            .unwrap_or(false);
        if !non_empty {
            debug!(path = %self.path.display(), "no existing mirror file");
            return false;
        }

        let store = match SqliteStore::open(&self.path, BackendKind::Mirror, false).await {
            Ok(store) => store,
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "existing mirror file unusable");
                return false;
            }
        };

        let sql = format!(
            "SELECT synced_at, checksum, source_path, store_source FROM {} LIMIT 1",
            METADATA_TABLE
        );
        let meta = match store.query(&sql, &[]).await {
            Ok(table) if !table.is_empty() => table,
            Ok(_) | Err(_) => {
                warn!(path = %self.path.display(), "mirror file has no metadata; it will be rebuilt");
                store.close().await;
                return false;
            }
        };

        {
            let mut state = self.state.lock();
            state.last_sync = meta
                .text(0, "synced_at")
                .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
                .map(|d| d.with_timezone(&Utc));
            state.checksum = meta.text(0, "checksum");
            state.source = meta.text(0, "source_path");
            state.store_source = meta.text(0, "store_source").and_then(|s| parse_store_source(&s));
            state.ready = true;
        }
        self.snapshot.store(Some(Arc::new(store)));
        info!(path = %self.path.display(), "opened existing mirror");
        true
    }

    /// Adopt the existing file, building it from the dump if that fails.
    pub async fn startup(&self) -> bool {
        if self.open().await {
            return true;
        }
        match self.sync(false).await {
            Ok(true) => true,
            Ok(false) => {
                warn!("mirror not built: no dump available");
                false
            }
            Err(e) => {
                warn!(error = %e, "initial mirror build failed");
                false
            }
        }
    }

    /// Rebuild from the configured dump.
    ///
    /// `Ok(false)` when no dump is configured or the file is absent.
    pub async fn sync(&self, force: bool) -> Result<bool, SyncError> {
        match self.config.dump_path.clone() {
            Some(dump) => self.sync_from(&dump, force).await,
            None => {
                debug!("no mirror dump configured");
                Ok(false)
            }
        }
    }

    /// Rebuild from `dump`.
    ///
    /// Unless `force` is set, a dump whose checksum matches the last
    /// successful sync is not replayed again.
    pub async fn sync_from(&self, dump: &Path, force: bool) -> Result<bool, SyncError> {
        let present = tokio::fs::metadata(dump)
            .await
            .map(|m| m.is_file())
            .unwrap_or(false);
        if !present {
            warn!(dump = %dump.display(), "mirror dump not found; skipping sync");
            return Ok(false);
        }

        let _lock = self.sync_lock.lock().await;
        let _progress = InProgress::enter(&self.state);

        let checksum = file_checksum(dump).await.map_err(|e| source_error(dump, e))?;

        if !force
            && self.snapshot.load().is_some()
            && self.state.lock().checksum.as_deref() == Some(checksum.as_str())
        {
            debug!(checksum = %checksum, "dump unchanged; mirror is current");
            return Ok(true);
        }

        info!(dump = %dump.display(), "rebuilding mirror");

        match self.rebuild(dump, &checksum).await {
            Ok((store, built)) => {
                info!(
                    statements = built.report.statements,
                    skipped = built.report.skipped,
                    failed = built.report.failed,
                    copied_rows = built.report.copied_rows,
                    "mirror rebuilt"
                );
                {
                    let mut state = self.state.lock();
                    state.ready = true;
                    state.stale = false;
                    state.last_error = None;
                    state.last_sync = Some(built.synced_at);
                    state.checksum = Some(checksum);
                    state.source = Some(dump.display().to_string());
                    state.store_source = Some(built.store_source);
                }
                self.snapshot.store(Some(Arc::new(store)));
                Ok(true)
            }
            Err(e) => {
                warn!(error = %e, "mirror sync failed; keeping previous snapshot");
                let mut state = self.state.lock();
                state.stale = true;
                state.last_error = Some(e.to_string());
                Err(e)
            }
        }
    }

    /// Run the periodic sync until `token` is cancelled.
    ///
    /// Returns `None` when `auto_sync` is off.
    pub fn spawn_auto_sync(self: Arc<Self>, token: CancellationToken) -> Option<JoinHandle<()>> {
        if !self.config.auto_sync {
            return None;
        }
        let period = Duration::from_secs(self.config.sync_interval_secs.max(1));

        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // The first tick completes immediately; startup already synced.
            ticker.tick().await;
            info!(interval_secs = period.as_secs(), "mirror auto-sync started");

            loop {
                tokio::select! {
                    _ = token.cancelled() => {
                        info!("mirror auto-sync stopped");
                        break;
                    }
                    _ = ticker.tick() => {
                        if let Err(e) = self.sync(false).await {
                            warn!(error = %e, "scheduled mirror sync failed");
                        }
                    }
                }
            }
        }))
    }

    fn temp_path(&self) -> PathBuf {
        let name = self
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "mirror".to_string());
        self.path
            .with_file_name(format!(".{}.{}.tmp", name, uuid::Uuid::new_v4()))
    }

    /// Build into a temp file and rename it into place.
    async fn rebuild(
        &self,
        dump: &Path,
        checksum: &str,
    ) -> Result<(SqliteStore, Built), SyncError> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| SyncError::Install(e.to_string()))?;
        }

        let temp = self.temp_path();
        let built = match self.build_file(&temp, dump, checksum).await {
            Ok(built) => built,
            Err(e) => {
                remove_quietly(&temp).await;
                return Err(e);
            }
        };

        if let Err(e) = tokio::fs::rename(&temp, &self.path).await {
            remove_quietly(&temp).await;
            return Err(SyncError::Install(e.to_string()));
        }

        let store = SqliteStore::open(&self.path, BackendKind::Mirror, false)
            .await
            .map_err(|e| SyncError::Install(e.to_string()))?;
        Ok((store, built))
    }

    async fn build_file(&self, temp: &Path, dump: &Path, checksum: &str) -> Result<Built, SyncError> {
        let mut reader = DumpReader::open(dump, self.sanitizer.clone())
            .await
            .map_err(|e| source_error(dump, e))?;

        let store = SqliteStore::open(temp, BackendKind::Mirror, true)
            .await
            .map_err(|e| SyncError::Build(e.to_string()))?;
        let result = self.populate(&store, &mut reader, dump, checksum).await;
        store.close().await;

        let sanitized = reader.sanitize_report();
        debug!(
            lines_read = sanitized.lines_read,
            lines_dropped = sanitized.lines_dropped,
            markers_removed = sanitized.markers_removed,
            "dump sanitised"
        );
        result
    }

    async fn populate(
        &self,
        store: &SqliteStore,
        reader: &mut DumpReader,
        dump: &Path,
        checksum: &str,
    ) -> Result<Built, SyncError> {
        let report = replay(store, reader).await?;

        for table in &self.config.required_tables {
            let columns = store
                .columns(table)
                .await
                .map_err(|e| SyncError::Build(e.to_string()))?;
            if columns.is_empty() {
                return Err(SyncError::MissingTable(table.clone()));
            }
        }

        let store_source = refresh_inventory_view(store)
            .await
            .map_err(|e| SyncError::Build(e.to_string()))?;

        let synced_at = Utc::now();
        write_metadata(store, synced_at, checksum, dump, store_source)
            .await
            .map_err(|e| SyncError::Build(e.to_string()))?;

        Ok(Built {
            report,
            store_source,
            synced_at,
        })
    }
}

#[async_trait]
impl MirrorSource for MirrorSyncEngine {
    fn current(&self) -> Option<Arc<dyn DataStore>> {
        self.snapshot
            .load_full()
            .map(|store| store as Arc<dyn DataStore>)
    }

    async fn ensure_ready(&self) -> bool {
        if self.open().await {
            return true;
        }
        if let Err(e) = self.sync(false).await {
            warn!(error = %e, "on-demand mirror build failed");
        }
        self.snapshot.load().is_some()
    }
}

fn source_error(path: &Path, err: std::io::Error) -> SyncError {
    SyncError::Source {
        path: path.display().to_string(),
        message: err.to_string(),
    }
}

async fn remove_quietly(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!(path = %path.display(), error = %e, "failed to remove temporary mirror file");
        }
    }
}

fn parse_store_source(value: &str) -> Option<StoreSource> {
    match value {
        "store" => Some(StoreSource::Store),
        "source_id" => Some(StoreSource::SourceId),
        "missing" => Some(StoreSource::Missing),
        _ => None,
    }
}

fn store_source_label(source: StoreSource) -> &'static str {
    match source {
        StoreSource::Store => "store",
        StoreSource::SourceId => "source_id",
        StoreSource::Missing => "missing",
    }
}

fn quote_ident(name: &str) -> String {
    let bare = name.trim().trim_matches('"');
    format!("\"{}\"", bare.replace('"', "\"\""))
}

/// Replay a dump into an empty SQLite database as it is read.
pub async fn replay(store: &SqliteStore, reader: &mut DumpReader) -> Result<ReplayReport, SyncError> {
    let mut report = ReplayReport::default();
    let mut copy: Option<CopyLoader<'_>> = None;

    loop {
        let event = reader
            .next_event()
            .await
            .map_err(|e| source_error(reader.path(), e))?;
        let Some(event) = event else { break };

        match event {
            DumpEvent::Sql(statement) => {
                let Some(translated) = translate_for_sqlite(&statement) else {
                    report.skipped += 1;
                    continue;
                };
                report.statements += 1;
                if let Err(e) = sqlx::raw_sql(&translated).execute(store.pool()).await {
                    report.failed += 1;
                    debug!(statement = %first_line(&statement), error = %e, "statement skipped");
                }
            }
            DumpEvent::CopyStart(command) => {
                report.statements += 1;
                copy = Some(CopyLoader::begin(store, &command).await?);
            }
            DumpEvent::CopyRow(line) => {
                if let Some(loader) = copy.as_mut() {
                    loader.push(&line).await?;
                }
            }
            DumpEvent::CopyEnd => {
                if let Some(loader) = copy.take() {
                    let (inserted, rejected) = loader.finish().await?;
                    report.copied_rows += inserted;
                    report.rejected_rows += rejected;
                }
            }
        }
    }

    if let Some(loader) = copy.take() {
        let (inserted, rejected) = loader.abandon();
        report.copied_rows += inserted;
        report.rejected_rows += rejected;
    }

    Ok(report)
}

/// Inserts the rows of one `COPY` block, committing every
/// [`COPY_BATCH_ROWS`] rows so memory stays flat on large tables.
struct CopyLoader<'a> {
    store: &'a SqliteStore,
    table: String,
    /// `None` when the target has no known columns; rows are rejected.
    insert_sql: Option<String>,
    width: usize,
    tx: Option<Transaction<'static, Sqlite>>,
    batch_rows: usize,
    batch_inserted: u64,
    inserted: u64,
    rejected: u64,
}

impl<'a> CopyLoader<'a> {
    async fn begin(store: &'a SqliteStore, command: &CopyCommand) -> Result<Self, SyncError> {
        let table = normalize_table_name(&command.table);
        let columns = match &command.columns {
            Some(columns) => columns.clone(),
            None => store
                .columns(table.trim_matches('"'))
                .await
                .map_err(|e| SyncError::Build(e.to_string()))?,
        };

        let insert_sql = if columns.is_empty() {
            debug!(table = %table, "no columns for COPY target; rows skipped");
            None
        } else {
            Some(format!(
                "INSERT INTO {} ({}) VALUES ({})",
                quote_ident(&table),
                columns
                    .iter()
                    .map(|c| quote_ident(c))
                    .collect::<Vec<_>>()
                    .join(", "),
                (1..=columns.len())
                    .map(|i| format!("?{}", i))
                    .collect::<Vec<_>>()
                    .join(", ")
            ))
        };

        Ok(Self {
            store,
            table,
            insert_sql,
            width: columns.len(),
            tx: None,
            batch_rows: 0,
            batch_inserted: 0,
            inserted: 0,
            rejected: 0,
        })
    }

    fn build_error(&self, err: sqlx::Error) -> SyncError {
        SyncError::Build(self.store.map_error(err).to_string())
    }

    async fn push(&mut self, line: &str) -> Result<(), SyncError> {
        let Some(sql) = self.insert_sql.as_deref() else {
            self.rejected += 1;
            return Ok(());
        };

        let tx = match self.tx.as_mut() {
            Some(tx) => tx,
            None => {
                let begun = self
                    .store
                    .pool()
                    .begin()
                    .await
                    .map_err(|e| SyncError::Build(self.store.map_error(e).to_string()))?;
                self.tx.insert(begun)
            }
        };

        let mut fields = parse_copy_row(line);
        fields.resize(self.width, None);
        let params: Vec<SqlValue> = fields.into_iter().map(SqlValue::from).collect();
        match bind_params(sql, &params).execute(&mut **tx).await {
            Ok(_) => {
                self.inserted += 1;
                self.batch_inserted += 1;
            }
            Err(e) => {
                self.rejected += 1;
                debug!(table = %self.table, error = %e, "COPY row rejected");
            }
        }

        self.batch_rows += 1;
        if self.batch_rows >= COPY_BATCH_ROWS {
            self.commit().await?;
        }
        Ok(())
    }

    async fn commit(&mut self) -> Result<(), SyncError> {
        if let Some(tx) = self.tx.take() {
            tx.commit().await.map_err(|e| self.build_error(e))?;
        }
        self.batch_rows = 0;
        self.batch_inserted = 0;
        Ok(())
    }

    /// Commit the tail of the block. Returns `(inserted, rejected)`.
    async fn finish(mut self) -> Result<(u64, u64), SyncError> {
        self.commit().await?;
        debug!(table = %self.table, inserted = self.inserted, rejected = self.rejected, "COPY block loaded");
        Ok((self.inserted, self.rejected))
    }

    /// The dump ended inside the block: the open batch is rolled back when
    /// its transaction drops, earlier batches stay.
    fn abandon(self) -> (u64, u64) {
        warn!(
            table = %self.table,
            discarded = self.batch_inserted,
            "dump ended inside COPY block; uncommitted rows discarded"
        );
        (
            self.inserted - self.batch_inserted,
            self.rejected + self.batch_inserted,
        )
    }
}

async fn write_metadata(
    store: &SqliteStore,
    synced_at: DateTime<Utc>,
    checksum: &str,
    dump: &Path,
    store_source: StoreSource,
) -> Result<(), StoreError> {
    store
        .execute(&format!("DROP TABLE IF EXISTS {}", METADATA_TABLE), &[])
        .await?;
    store
        .execute(
            &format!(
                "CREATE TABLE {} (synced_at TEXT NOT NULL, checksum TEXT NOT NULL, \
                 source_path TEXT NOT NULL, store_source TEXT)",
                METADATA_TABLE
            ),
            &[],
        )
        .await?;
    store
        .execute(
            &format!(
                "INSERT INTO {} (synced_at, checksum, source_path, store_source) VALUES ($1, $2, $3, $4)",
                METADATA_TABLE
            ),
            &[
                synced_at.to_rfc3339().into(),
                checksum.into(),
                dump.display().to_string().into(),
                store_source_label(store_source).into(),
            ],
        )
        .await?;
    Ok(())
}
