//! Embedded relational store.
//!
//! One SQLite file under `<data_root>/db/` owns every persisted entity. All
//! writes are transactional per call; multi-row updates (cascading folder
//! deletes, chunk set replacement) are single transactions. SQLITE_BUSY is
//! retried internally with exponential backoff before surfacing as
//! [`StoreError::Busy`].
//!
//! Embeddings are not stored here — the vector index owns them, keyed by
//! chunk id.

use chrono::{DateTime, Utc};
use mindex_core::config::StoreConfig;
use mindex_core::error::{StoreError, StoreResult};
use mindex_core::types::*;
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, Row};
use std::path::Path;
use std::sync::Mutex;
use tracing::{debug, warn};

// ---------------------------------------------------------------------------
// Schema
// ---------------------------------------------------------------------------

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS monitored_folders (
    id INTEGER PRIMARY KEY,
    path TEXT NOT NULL UNIQUE,
    alias TEXT,
    is_blacklist INTEGER NOT NULL DEFAULT 0,
    parent_id INTEGER REFERENCES monitored_folders(id),
    is_common_folder INTEGER NOT NULL DEFAULT 0,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS file_categories (
    id INTEGER PRIMARY KEY,
    name TEXT NOT NULL UNIQUE,
    icon TEXT,
    description TEXT
);

CREATE TABLE IF NOT EXISTS extension_mappings (
    id INTEGER PRIMARY KEY,
    extension TEXT NOT NULL,
    category_id INTEGER NOT NULL REFERENCES file_categories(id) ON DELETE CASCADE,
    priority TEXT NOT NULL DEFAULT 'medium',
    created_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS filter_rules (
    id INTEGER PRIMARY KEY,
    name TEXT NOT NULL,
    rule_type TEXT NOT NULL,
    pattern TEXT NOT NULL,
    pattern_type TEXT NOT NULL,
    action TEXT NOT NULL,
    priority INTEGER NOT NULL DEFAULT 0,
    enabled INTEGER NOT NULL DEFAULT 1,
    is_system INTEGER NOT NULL DEFAULT 0,
    category_id INTEGER REFERENCES file_categories(id) ON DELETE SET NULL
);

CREATE TABLE IF NOT EXISTS bundle_extensions (
    id INTEGER PRIMARY KEY,
    extension TEXT NOT NULL UNIQUE,
    is_active INTEGER NOT NULL DEFAULT 1
);

CREATE TABLE IF NOT EXISTS screening_results (
    id INTEGER PRIMARY KEY,
    file_path TEXT NOT NULL,
    file_name TEXT NOT NULL,
    extension TEXT,
    size INTEGER NOT NULL DEFAULT 0,
    created_time INTEGER,
    modified_time INTEGER NOT NULL,
    category_id INTEGER REFERENCES file_categories(id) ON DELETE SET NULL,
    content_hash TEXT,
    status TEXT NOT NULL DEFAULT 'new'
);
CREATE UNIQUE INDEX IF NOT EXISTS idx_screening_live_path
    ON screening_results(file_path) WHERE status != 'deleted';
CREATE INDEX IF NOT EXISTS idx_screening_hash ON screening_results(content_hash);
CREATE INDEX IF NOT EXISTS idx_screening_status ON screening_results(status);

CREATE TABLE IF NOT EXISTS tags (
    id INTEGER PRIMARY KEY,
    name TEXT NOT NULL UNIQUE,
    kind TEXT NOT NULL,
    weight INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS file_tags (
    file_id INTEGER NOT NULL REFERENCES screening_results(id) ON DELETE CASCADE,
    tag_id INTEGER NOT NULL REFERENCES tags(id) ON DELETE CASCADE,
    PRIMARY KEY (file_id, tag_id)
);

CREATE TABLE IF NOT EXISTS vector_chunks (
    id INTEGER PRIMARY KEY,
    file_path TEXT NOT NULL,
    tier TEXT NOT NULL,
    parent_id INTEGER REFERENCES vector_chunks(id) ON DELETE CASCADE,
    ordinal INTEGER NOT NULL,
    text TEXT,
    modality TEXT NOT NULL DEFAULT 'text',
    token_count INTEGER NOT NULL DEFAULT 0,
    UNIQUE (file_path, tier, ordinal)
);
CREATE INDEX IF NOT EXISTS idx_chunks_path ON vector_chunks(file_path);

CREATE TABLE IF NOT EXISTS vectorization_tasks (
    id INTEGER PRIMARY KEY,
    file_path TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'queued',
    stage TEXT NOT NULL DEFAULT 'queued',
    progress INTEGER NOT NULL DEFAULT 0,
    parent_count INTEGER,
    child_count INTEGER,
    error TEXT,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL
);
CREATE UNIQUE INDEX IF NOT EXISTS idx_tasks_live_path
    ON vectorization_tasks(file_path) WHERE status IN ('queued', 'processing');

CREATE TABLE IF NOT EXISTS sessions (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    scenario_id TEXT,
    metadata TEXT NOT NULL DEFAULT '{}',
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS pinned_files (
    session_id TEXT NOT NULL REFERENCES sessions(id) ON DELETE CASCADE,
    file_path TEXT NOT NULL,
    metadata TEXT NOT NULL DEFAULT '{}',
    PRIMARY KEY (session_id, file_path)
);

CREATE TABLE IF NOT EXISTS session_tool_selections (
    session_id TEXT NOT NULL REFERENCES sessions(id) ON DELETE CASCADE,
    tool_name TEXT NOT NULL,
    PRIMARY KEY (session_id, tool_name)
);

CREATE TABLE IF NOT EXISTS provider_configs (
    id INTEGER PRIMARY KEY,
    kind TEXT NOT NULL,
    display_name TEXT NOT NULL,
    base_url TEXT,
    api_key TEXT,
    use_proxy INTEGER NOT NULL DEFAULT 0,
    is_active INTEGER NOT NULL DEFAULT 1,
    source_type TEXT NOT NULL DEFAULT 'configurable',
    support_discovery INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS model_configs (
    id INTEGER PRIMARY KEY,
    provider_id INTEGER NOT NULL REFERENCES provider_configs(id) ON DELETE CASCADE,
    model_identifier TEXT NOT NULL,
    display_name TEXT NOT NULL,
    cap_text INTEGER NOT NULL DEFAULT 0,
    cap_vision INTEGER NOT NULL DEFAULT 0,
    cap_tool_use INTEGER NOT NULL DEFAULT 0,
    cap_structured_output INTEGER NOT NULL DEFAULT 0,
    is_enabled INTEGER NOT NULL DEFAULT 0,
    UNIQUE (provider_id, model_identifier)
);

CREATE TABLE IF NOT EXISTS capability_assignments (
    capability TEXT PRIMARY KEY,
    model_id INTEGER NOT NULL REFERENCES model_configs(id) ON DELETE CASCADE
);

CREATE TABLE IF NOT EXISTS config_changes (
    id INTEGER PRIMARY KEY,
    kind TEXT NOT NULL,
    payload TEXT NOT NULL,
    enqueued_at INTEGER NOT NULL,
    executed_at INTEGER,
    failed INTEGER NOT NULL DEFAULT 0
);
"#;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn ms(dt: DateTime<Utc>) -> i64 {
    dt.timestamp_millis()
}

fn from_ms(v: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(v).unwrap_or_default()
}

fn map_sql_err(e: rusqlite::Error) -> StoreError {
    match &e {
        rusqlite::Error::QueryReturnedNoRows => StoreError::NotFound("row".into()),
        rusqlite::Error::SqliteFailure(ffi, msg) => match ffi.code {
            ErrorCode::ConstraintViolation => {
                StoreError::Conflict(msg.clone().unwrap_or_else(|| "constraint violation".into()))
            }
            ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked => StoreError::Busy { attempts: 1 },
            ErrorCode::DiskFull | ErrorCode::CannotOpen | ErrorCode::DatabaseCorrupt
            | ErrorCode::NotADatabase | ErrorCode::SystemIoFailure => {
                StoreError::Fatal(e.to_string())
            }
            _ => StoreError::InvalidInput(e.to_string()),
        },
        _ => StoreError::InvalidInput(e.to_string()),
    }
}

fn is_busy(e: &StoreError) -> bool {
    matches!(e, StoreError::Busy { .. })
}

/// New chunk rows for [`Store::replace_chunk_set`]. Children reference their
/// parent by parent *ordinal*; the store resolves ordinals to rowids.
#[derive(Debug, Clone)]
pub struct NewChunk {
    pub tier: ChunkTier,
    pub parent_ordinal: Option<i64>,
    pub ordinal: i64,
    pub text: Option<String>,
    pub modality: Modality,
    pub token_count: i64,
}

/// Filters for screening queries, all optional and ANDed together.
#[derive(Debug, Clone, Default)]
pub struct ScreeningQuery {
    pub category_id: Option<i64>,
    pub modified_after: Option<DateTime<Utc>>,
    pub modified_before: Option<DateTime<Utc>>,
    pub path_substring: Option<String>,
    pub tag_names: Vec<String>,
    pub status: Option<ScreeningStatus>,
    pub limit: usize,
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

pub struct Store {
    conn: Mutex<Connection>,
    busy: StoreConfig,
}

impl Store {
    /// Open (or create) the store at `<db_dir>/mindex.db`.
    pub fn open(db_dir: &Path, busy: StoreConfig) -> StoreResult<Self> {
        std::fs::create_dir_all(db_dir)
            .map_err(|e| StoreError::Fatal(format!("create db dir: {e}")))?;
        let conn = Connection::open(db_dir.join("mindex.db")).map_err(map_sql_err)?;
        conn.pragma_update(None, "journal_mode", "WAL").map_err(map_sql_err)?;
        conn.pragma_update(None, "foreign_keys", "ON").map_err(map_sql_err)?;
        conn.execute_batch(SCHEMA).map_err(map_sql_err)?;
        Ok(Self { conn: Mutex::new(conn), busy })
    }

    /// In-memory store for tests.
    pub fn open_in_memory() -> StoreResult<Self> {
        let conn = Connection::open_in_memory().map_err(map_sql_err)?;
        conn.pragma_update(None, "foreign_keys", "ON").map_err(map_sql_err)?;
        conn.execute_batch(SCHEMA).map_err(map_sql_err)?;
        Ok(Self { conn: Mutex::new(conn), busy: StoreConfig::default() })
    }

    /// Run `f` with the connection, retrying on SQLITE_BUSY with backoff.
    fn with_conn<T>(
        &self,
        mut f: impl FnMut(&mut Connection) -> Result<T, rusqlite::Error>,
    ) -> StoreResult<T> {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let result = {
                let mut guard = self.conn.lock().unwrap_or_else(|p| p.into_inner());
                f(&mut *guard).map_err(map_sql_err)
            };
            match result {
                Err(ref e) if is_busy(e) && attempt < self.busy.busy_max_attempts => {
                    let delay = self.busy.busy_base_delay_ms.saturating_mul(1 << (attempt - 1));
                    debug!(attempt, delay_ms = delay, "Store busy, backing off");
                    std::thread::sleep(std::time::Duration::from_millis(delay));
                }
                Err(e) if is_busy(&e) => return Err(StoreError::Busy { attempts: attempt }),
                other => return other,
            }
        }
    }

    // -----------------------------------------------------------------------
    // Monitored folders
    // -----------------------------------------------------------------------

    fn row_to_folder(row: &Row) -> Result<MonitoredFolder, rusqlite::Error> {
        Ok(MonitoredFolder {
            id: row.get(0)?,
            path: row.get(1)?,
            alias: row.get(2)?,
            is_blacklist: row.get::<_, i64>(3)? != 0,
            parent_id: row.get(4)?,
            is_common_folder: row.get::<_, i64>(5)? != 0,
            created_at: from_ms(row.get(6)?),
            updated_at: from_ms(row.get(7)?),
        })
    }

    const FOLDER_COLS: &'static str =
        "id, path, alias, is_blacklist, parent_id, is_common_folder, created_at, updated_at";

    /// Insert a monitored folder. Blacklist folders must descend from an
    /// existing whitelist folder or be converted common folders.
    pub fn add_folder(
        &self,
        path: &str,
        alias: Option<&str>,
        is_blacklist: bool,
        is_common_folder: bool,
    ) -> StoreResult<MonitoredFolder> {
        if !Path::new(path).is_absolute() {
            return Err(StoreError::InvalidInput(format!("path not absolute: {path}")));
        }
        let path = path.trim_end_matches('/').to_string();
        let path = if path.is_empty() { "/".to_string() } else { path };

        let parent_id = if is_blacklist && !is_common_folder {
            let parent = self.whitelist_ancestor(&path)?;
            match parent {
                Some(p) => Some(p.id),
                None => {
                    return Err(StoreError::InvalidInput(format!(
                        "blacklist folder {path} has no whitelist ancestor"
                    )))
                }
            }
        } else {
            None
        };

        if !is_blacklist {
            if let Some(existing) = self.whitelist_ancestor(&path)? {
                warn!(path = path.as_str(), under = existing.path.as_str(),
                    "Nested whitelist folder; deepest root wins for pruning");
            }
        }

        let now = ms(Utc::now());
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO monitored_folders
                 (path, alias, is_blacklist, parent_id, is_common_folder, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)",
                params![path, alias, is_blacklist as i64, parent_id, is_common_folder as i64, now],
            )?;
            let id = conn.last_insert_rowid();
            conn.query_row(
                &format!("SELECT {} FROM monitored_folders WHERE id = ?1", Self::FOLDER_COLS),
                params![id],
                Self::row_to_folder,
            )
        })
    }

    /// Deepest whitelist folder whose path is a prefix of `path` (or equals it).
    pub fn whitelist_ancestor(&self, path: &str) -> StoreResult<Option<MonitoredFolder>> {
        let folders = self.list_folders()?;
        let mut best: Option<MonitoredFolder> = None;
        for f in folders.into_iter().filter(|f| !f.is_blacklist) {
            if path_has_prefix(path, &f.path)
                && best.as_ref().map_or(true, |b| f.path.len() > b.path.len())
                && f.path != path
            {
                best = Some(f);
            }
        }
        Ok(best)
    }

    pub fn get_folder(&self, id: i64) -> StoreResult<MonitoredFolder> {
        self.with_conn(|conn| {
            conn.query_row(
                &format!("SELECT {} FROM monitored_folders WHERE id = ?1", Self::FOLDER_COLS),
                params![id],
                Self::row_to_folder,
            )
        })
        .map_err(|e| match e {
            StoreError::NotFound(_) => StoreError::NotFound(format!("folder {id}")),
            other => other,
        })
    }

    pub fn get_folder_by_path(&self, path: &str) -> StoreResult<Option<MonitoredFolder>> {
        self.with_conn(|conn| {
            conn.query_row(
                &format!("SELECT {} FROM monitored_folders WHERE path = ?1", Self::FOLDER_COLS),
                params![path],
                Self::row_to_folder,
            )
            .optional()
        })
    }

    pub fn list_folders(&self) -> StoreResult<Vec<MonitoredFolder>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM monitored_folders ORDER BY path",
                Self::FOLDER_COLS
            ))?;
            let rows = stmt.query_map([], Self::row_to_folder)?;
            rows.collect()
        })
    }

    /// Delete a folder. A whitelist delete cascades to its blacklist children
    /// in the same transaction. Returns every removed folder path.
    pub fn delete_folder_cascade(&self, id: i64) -> StoreResult<Vec<String>> {
        let folder = self.get_folder(id)?;
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            let mut removed = vec![folder.path.clone()];
            if !folder.is_blacklist {
                let mut stmt = tx.prepare(
                    "SELECT path FROM monitored_folders WHERE parent_id = ?1 AND is_blacklist = 1",
                )?;
                let children: Vec<String> =
                    stmt.query_map(params![id], |r| r.get(0))?.collect::<Result<_, _>>()?;
                drop(stmt);
                tx.execute(
                    "DELETE FROM monitored_folders WHERE parent_id = ?1 AND is_blacklist = 1",
                    params![id],
                )?;
                removed.extend(children);
            }
            tx.execute("DELETE FROM monitored_folders WHERE id = ?1", params![id])?;
            tx.commit()?;
            Ok(removed)
        })
    }

    /// Flip a folder between whitelist and blacklist. Whitelist → blacklist
    /// deletes now-redundant blacklist children in the same transaction.
    pub fn toggle_folder(&self, id: i64) -> StoreResult<MonitoredFolder> {
        let folder = self.get_folder(id)?;
        let now = ms(Utc::now());
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            if !folder.is_blacklist {
                tx.execute(
                    "DELETE FROM monitored_folders WHERE parent_id = ?1 AND is_blacklist = 1",
                    params![id],
                )?;
                // A converted whitelist behaves like a blacklisted common folder:
                // it needs no whitelist ancestor.
                tx.execute(
                    "UPDATE monitored_folders
                     SET is_blacklist = 1, is_common_folder = 1, updated_at = ?2 WHERE id = ?1",
                    params![id, now],
                )?;
            } else {
                tx.execute(
                    "UPDATE monitored_folders
                     SET is_blacklist = 0, parent_id = NULL, updated_at = ?2 WHERE id = ?1",
                    params![id, now],
                )?;
            }
            let updated = tx.query_row(
                &format!("SELECT {} FROM monitored_folders WHERE id = ?1", Self::FOLDER_COLS),
                params![id],
                Self::row_to_folder,
            )?;
            tx.commit()?;
            Ok(updated)
        })
    }

    // -----------------------------------------------------------------------
    // Categories
    // -----------------------------------------------------------------------

    fn row_to_category(row: &Row) -> Result<FileCategory, rusqlite::Error> {
        Ok(FileCategory {
            id: row.get(0)?,
            name: row.get(1)?,
            icon: row.get(2)?,
            description: row.get(3)?,
        })
    }

    pub fn upsert_category(
        &self,
        name: &str,
        icon: Option<&str>,
        description: Option<&str>,
    ) -> StoreResult<FileCategory> {
        if name.trim().is_empty() {
            return Err(StoreError::InvalidInput("category name empty".into()));
        }
        let name = name.to_string();
        let icon = icon.map(str::to_string);
        let description = description.map(str::to_string);
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO file_categories (name, icon, description) VALUES (?1, ?2, ?3)
                 ON CONFLICT(name) DO UPDATE SET icon = excluded.icon,
                     description = excluded.description",
                params![name, icon, description],
            )?;
            conn.query_row(
                "SELECT id, name, icon, description FROM file_categories WHERE name = ?1",
                params![name],
                Self::row_to_category,
            )
        })
    }

    pub fn list_categories(&self) -> StoreResult<Vec<FileCategory>> {
        self.with_conn(|conn| {
            let mut stmt = conn
                .prepare("SELECT id, name, icon, description FROM file_categories ORDER BY name")?;
            let rows = stmt.query_map([], Self::row_to_category)?;
            rows.collect()
        })
    }

    pub fn get_category(&self, id: i64) -> StoreResult<FileCategory> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT id, name, icon, description FROM file_categories WHERE id = ?1",
                params![id],
                Self::row_to_category,
            )
        })
        .map_err(|e| match e {
            StoreError::NotFound(_) => StoreError::NotFound(format!("category {id}")),
            other => other,
        })
    }

    pub fn delete_category(&self, id: i64) -> StoreResult<()> {
        let n = self.with_conn(|conn| {
            conn.execute("DELETE FROM file_categories WHERE id = ?1", params![id])
        })?;
        if n == 0 {
            return Err(StoreError::NotFound(format!("category {id}")));
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Extension mappings
    // -----------------------------------------------------------------------

    fn row_to_mapping(row: &Row) -> Result<ExtensionMapping, rusqlite::Error> {
        let priority: String = row.get(3)?;
        Ok(ExtensionMapping {
            id: row.get(0)?,
            extension: row.get(1)?,
            category_id: row.get(2)?,
            priority: MappingPriority::parse(&priority).unwrap_or(MappingPriority::Medium),
            created_at: from_ms(row.get(4)?),
        })
    }

    pub fn add_mapping(
        &self,
        extension: &str,
        category_id: i64,
        priority: MappingPriority,
    ) -> StoreResult<ExtensionMapping> {
        let extension = extension.trim_start_matches('.').to_lowercase();
        if extension.is_empty() {
            return Err(StoreError::InvalidInput("extension empty".into()));
        }
        let now = ms(Utc::now());
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO extension_mappings (extension, category_id, priority, created_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![extension, category_id, priority.as_str(), now],
            )?;
            let id = conn.last_insert_rowid();
            conn.query_row(
                "SELECT id, extension, category_id, priority, created_at
                 FROM extension_mappings WHERE id = ?1",
                params![id],
                Self::row_to_mapping,
            )
        })
    }

    pub fn list_mappings(&self) -> StoreResult<Vec<ExtensionMapping>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, extension, category_id, priority, created_at
                 FROM extension_mappings ORDER BY extension, id",
            )?;
            let rows = stmt.query_map([], Self::row_to_mapping)?;
            rows.collect()
        })
    }

    pub fn delete_mapping(&self, id: i64) -> StoreResult<()> {
        let n = self.with_conn(|conn| {
            conn.execute("DELETE FROM extension_mappings WHERE id = ?1", params![id])
        })?;
        if n == 0 {
            return Err(StoreError::NotFound(format!("mapping {id}")));
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Filter rules
    // -----------------------------------------------------------------------

    fn row_to_rule(row: &Row) -> Result<FilterRule, rusqlite::Error> {
        let rule_type: String = row.get(2)?;
        let pattern_type: String = row.get(4)?;
        let action: String = row.get(5)?;
        Ok(FilterRule {
            id: row.get(0)?,
            name: row.get(1)?,
            rule_type: match rule_type.as_str() {
                "extension" => RuleType::Extension,
                "filename" => RuleType::Filename,
                "size" => RuleType::Size,
                _ => RuleType::Path,
            },
            pattern: row.get(3)?,
            pattern_type: match pattern_type.as_str() {
                "regex" => PatternType::Regex,
                "glob" => PatternType::Glob,
                _ => PatternType::Exact,
            },
            action: if action == "exclude" { RuleAction::Exclude } else { RuleAction::Include },
            priority: row.get(6)?,
            enabled: row.get::<_, i64>(7)? != 0,
            is_system: row.get::<_, i64>(8)? != 0,
            category_id: row.get(9)?,
        })
    }

    const RULE_COLS: &'static str =
        "id, name, rule_type, pattern, pattern_type, action, priority, enabled, is_system, category_id";

    #[allow(clippy::too_many_arguments)]
    pub fn add_rule(
        &self,
        name: &str,
        rule_type: RuleType,
        pattern: &str,
        pattern_type: PatternType,
        action: RuleAction,
        priority: i64,
        is_system: bool,
        category_id: Option<i64>,
    ) -> StoreResult<FilterRule> {
        let rule_type_s = match rule_type {
            RuleType::Extension => "extension",
            RuleType::Filename => "filename",
            RuleType::Path => "path",
            RuleType::Size => "size",
        };
        let pattern_type_s = match pattern_type {
            PatternType::Regex => "regex",
            PatternType::Glob => "glob",
            PatternType::Exact => "exact",
        };
        let action_s = if action == RuleAction::Exclude { "exclude" } else { "include" };
        let name = name.to_string();
        let pattern = pattern.to_string();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO filter_rules
                 (name, rule_type, pattern, pattern_type, action, priority, enabled, is_system, category_id)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, 1, ?7, ?8)",
                params![
                    name,
                    rule_type_s,
                    pattern,
                    pattern_type_s,
                    action_s,
                    priority,
                    is_system as i64,
                    category_id
                ],
            )?;
            let id = conn.last_insert_rowid();
            conn.query_row(
                &format!("SELECT {} FROM filter_rules WHERE id = ?1", Self::RULE_COLS),
                params![id],
                Self::row_to_rule,
            )
        })
    }

    /// Update a rule. System rules accept only `enabled` and `priority`
    /// changes; their `pattern` and `action` are immutable.
    pub fn update_rule(
        &self,
        id: i64,
        pattern: Option<&str>,
        action: Option<RuleAction>,
        priority: Option<i64>,
        enabled: Option<bool>,
    ) -> StoreResult<FilterRule> {
        let existing = self.get_rule(id)?;
        if existing.is_system && (pattern.is_some() || action.is_some()) {
            return Err(StoreError::InvalidInput(format!(
                "system rule '{}' is immutable in pattern and action",
                existing.name
            )));
        }
        let pattern = pattern.map(str::to_string).unwrap_or(existing.pattern);
        let action = action.unwrap_or(existing.action);
        let priority = priority.unwrap_or(existing.priority);
        let enabled = enabled.unwrap_or(existing.enabled);
        let action_s = if action == RuleAction::Exclude { "exclude" } else { "include" };
        self.with_conn(move |conn| {
            conn.execute(
                "UPDATE filter_rules SET pattern = ?2, action = ?3, priority = ?4, enabled = ?5
                 WHERE id = ?1",
                params![id, pattern, action_s, priority, enabled as i64],
            )?;
            conn.query_row(
                &format!("SELECT {} FROM filter_rules WHERE id = ?1", Self::RULE_COLS),
                params![id],
                Self::row_to_rule,
            )
        })
    }

    pub fn get_rule(&self, id: i64) -> StoreResult<FilterRule> {
        self.with_conn(|conn| {
            conn.query_row(
                &format!("SELECT {} FROM filter_rules WHERE id = ?1", Self::RULE_COLS),
                params![id],
                Self::row_to_rule,
            )
        })
        .map_err(|e| match e {
            StoreError::NotFound(_) => StoreError::NotFound(format!("rule {id}")),
            other => other,
        })
    }

    pub fn list_rules(&self) -> StoreResult<Vec<FilterRule>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM filter_rules ORDER BY priority DESC, id",
                Self::RULE_COLS
            ))?;
            let rows = stmt.query_map([], Self::row_to_rule)?;
            rows.collect()
        })
    }

    pub fn delete_rule(&self, id: i64) -> StoreResult<()> {
        let existing = self.get_rule(id)?;
        if existing.is_system {
            return Err(StoreError::InvalidInput(format!(
                "system rule '{}' cannot be deleted",
                existing.name
            )));
        }
        self.with_conn(|conn| conn.execute("DELETE FROM filter_rules WHERE id = ?1", params![id]))?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Bundle extensions
    // -----------------------------------------------------------------------

    fn row_to_bundle(row: &Row) -> Result<BundleExtension, rusqlite::Error> {
        Ok(BundleExtension {
            id: row.get(0)?,
            extension: row.get(1)?,
            is_active: row.get::<_, i64>(2)? != 0,
        })
    }

    pub fn upsert_bundle_extension(
        &self,
        extension: &str,
        is_active: bool,
    ) -> StoreResult<BundleExtension> {
        let extension = extension.trim_start_matches('.').to_lowercase();
        if extension.is_empty() {
            return Err(StoreError::InvalidInput("bundle extension empty".into()));
        }
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO bundle_extensions (extension, is_active) VALUES (?1, ?2)
                 ON CONFLICT(extension) DO UPDATE SET is_active = excluded.is_active",
                params![extension, is_active as i64],
            )?;
            conn.query_row(
                "SELECT id, extension, is_active FROM bundle_extensions WHERE extension = ?1",
                params![extension],
                Self::row_to_bundle,
            )
        })
    }

    pub fn list_bundle_extensions(&self) -> StoreResult<Vec<BundleExtension>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, extension, is_active FROM bundle_extensions ORDER BY extension",
            )?;
            let rows = stmt.query_map([], Self::row_to_bundle)?;
            rows.collect()
        })
    }

    pub fn delete_bundle_extension(&self, id: i64) -> StoreResult<()> {
        let n = self.with_conn(|conn| {
            conn.execute("DELETE FROM bundle_extensions WHERE id = ?1", params![id])
        })?;
        if n == 0 {
            return Err(StoreError::NotFound(format!("bundle extension {id}")));
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Screening results
    // -----------------------------------------------------------------------

    fn row_to_screening(row: &Row) -> Result<ScreeningResult, rusqlite::Error> {
        let status: String = row.get(9)?;
        Ok(ScreeningResult {
            id: row.get(0)?,
            file_path: row.get(1)?,
            file_name: row.get(2)?,
            extension: row.get(3)?,
            size: row.get::<_, i64>(4)? as u64,
            created_time: row.get::<_, Option<i64>>(5)?.map(from_ms),
            modified_time: from_ms(row.get(6)?),
            category_id: row.get(7)?,
            content_hash: row.get(8)?,
            status: ScreeningStatus::parse(&status).unwrap_or(ScreeningStatus::New),
        })
    }

    const SCREENING_COLS: &'static str = "id, file_path, file_name, extension, size, \
         created_time, modified_time, category_id, content_hash, status";

    /// Idempotent screening write keyed by `file_path`.
    ///
    /// Unchanged fingerprint ⇒ `Unchanged` (no event should be emitted).
    /// A strictly newer `modified_time` ⇒ `Refreshed`: status resets to `new`
    /// and the stale content hash is cleared. `modified_time` never moves
    /// backwards.
    pub fn upsert_screening(
        &self,
        candidate: &FileCandidate,
        category_id: Option<i64>,
    ) -> StoreResult<(ScreeningOutcome, ScreeningResult)> {
        let c = candidate.clone();
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            let existing = tx
                .query_row(
                    &format!(
                        "SELECT {} FROM screening_results
                         WHERE file_path = ?1 AND status != 'deleted'",
                        Self::SCREENING_COLS
                    ),
                    params![c.path],
                    Self::row_to_screening,
                )
                .optional()?;

            let outcome = match existing {
                None => {
                    tx.execute(
                        "INSERT INTO screening_results
                         (file_path, file_name, extension, size, created_time, modified_time,
                          category_id, content_hash, status)
                         VALUES (?1, ?2, ?3, ?4, NULL, ?5, ?6, NULL, 'new')",
                        params![c.path, c.name, c.extension, c.size as i64, ms(c.mtime), category_id],
                    )?;
                    ScreeningOutcome::Inserted
                }
                Some(prev) if c.mtime > prev.modified_time => {
                    tx.execute(
                        "UPDATE screening_results
                         SET size = ?2, modified_time = ?3, category_id = ?4,
                             content_hash = NULL, status = 'new'
                         WHERE id = ?1",
                        params![prev.id, c.size as i64, ms(c.mtime), category_id],
                    )?;
                    ScreeningOutcome::Refreshed
                }
                Some(_) => ScreeningOutcome::Unchanged,
            };

            let result = tx.query_row(
                &format!(
                    "SELECT {} FROM screening_results WHERE file_path = ?1 AND status != 'deleted'",
                    Self::SCREENING_COLS
                ),
                params![c.path],
                Self::row_to_screening,
            )?;
            tx.commit()?;
            Ok((outcome, result))
        })
    }

    pub fn get_screening(&self, file_path: &str) -> StoreResult<Option<ScreeningResult>> {
        self.with_conn(|conn| {
            conn.query_row(
                &format!(
                    "SELECT {} FROM screening_results WHERE file_path = ?1 AND status != 'deleted'",
                    Self::SCREENING_COLS
                ),
                params![file_path],
                Self::row_to_screening,
            )
            .optional()
        })
    }

    pub fn set_screening_status(&self, file_path: &str, status: ScreeningStatus) -> StoreResult<()> {
        let n = self.with_conn(|conn| {
            conn.execute(
                "UPDATE screening_results SET status = ?2
                 WHERE file_path = ?1 AND status != 'deleted'",
                params![file_path, status.as_str()],
            )
        })?;
        if n == 0 {
            return Err(StoreError::NotFound(format!("screening row for {file_path}")));
        }
        Ok(())
    }

    pub fn set_content_hash(&self, file_path: &str, hash: &str) -> StoreResult<()> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE screening_results SET content_hash = ?2
                 WHERE file_path = ?1 AND status != 'deleted'",
                params![file_path, hash],
            )
        })?;
        Ok(())
    }

    /// Live rows sharing a content hash — duplicate set for embedding reuse.
    pub fn find_by_content_hash(&self, hash: &str) -> StoreResult<Vec<ScreeningResult>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM screening_results
                 WHERE content_hash = ?1 AND status != 'deleted' ORDER BY id",
                Self::SCREENING_COLS
            ))?;
            let rows = stmt.query_map(params![hash], Self::row_to_screening)?;
            rows.collect()
        })
    }

    /// Mark every live row under a path prefix with the given status.
    /// Returns the affected file paths.
    pub fn mark_under_prefix(
        &self,
        prefix: &str,
        status: ScreeningStatus,
    ) -> StoreResult<Vec<String>> {
        let like = format!("{}/%", prefix.trim_end_matches('/'));
        let exact = prefix.to_string();
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            let mut stmt = tx.prepare(
                "SELECT file_path FROM screening_results
                 WHERE (file_path LIKE ?1 OR file_path = ?2) AND status != 'deleted'",
            )?;
            let paths: Vec<String> =
                stmt.query_map(params![like, exact], |r| r.get(0))?.collect::<Result<_, _>>()?;
            drop(stmt);
            tx.execute(
                "UPDATE screening_results SET status = ?3
                 WHERE (file_path LIKE ?1 OR file_path = ?2) AND status != 'deleted'",
                params![like, exact, status.as_str()],
            )?;
            tx.commit()?;
            Ok(paths)
        })
    }

    pub fn query_screening(&self, q: &ScreeningQuery) -> StoreResult<Vec<ScreeningResult>> {
        let mut sql = format!(
            "SELECT DISTINCT s.id, s.file_path, s.file_name, s.extension, s.size, s.created_time,
                    s.modified_time, s.category_id, s.content_hash, s.status
             FROM screening_results s"
        );
        let mut clauses: Vec<String> = vec!["s.status != 'deleted'".into()];
        let mut args: Vec<Box<dyn rusqlite::types::ToSql>> = Vec::new();

        if !q.tag_names.is_empty() {
            sql.push_str(
                " JOIN file_tags ft ON ft.file_id = s.id JOIN tags t ON t.id = ft.tag_id",
            );
            let placeholders: Vec<String> =
                (0..q.tag_names.len()).map(|i| format!("?{}", i + 1)).collect();
            clauses.push(format!("t.name IN ({})", placeholders.join(", ")));
            for name in &q.tag_names {
                args.push(Box::new(name.clone()));
            }
        }
        if let Some(cat) = q.category_id {
            args.push(Box::new(cat));
            clauses.push(format!("s.category_id = ?{}", args.len()));
        }
        if let Some(after) = q.modified_after {
            args.push(Box::new(ms(after)));
            clauses.push(format!("s.modified_time >= ?{}", args.len()));
        }
        if let Some(before) = q.modified_before {
            args.push(Box::new(ms(before)));
            clauses.push(format!("s.modified_time <= ?{}", args.len()));
        }
        if let Some(sub) = &q.path_substring {
            args.push(Box::new(format!("%{sub}%")));
            clauses.push(format!("s.file_path LIKE ?{}", args.len()));
        }
        if let Some(status) = q.status {
            args.push(Box::new(status.as_str().to_string()));
            clauses.push(format!("s.status = ?{}", args.len()));
        }

        sql.push_str(" WHERE ");
        sql.push_str(&clauses.join(" AND "));
        sql.push_str(" ORDER BY s.modified_time DESC");
        let limit = if q.limit == 0 { 200 } else { q.limit };
        sql.push_str(&format!(" LIMIT {limit}"));

        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(&sql)?;
            let params_ref: Vec<&dyn rusqlite::types::ToSql> =
                args.iter().map(|b| b.as_ref()).collect();
            let rows = stmt.query_map(params_ref.as_slice(), Self::row_to_screening)?;
            rows.collect()
        })
    }

    // -----------------------------------------------------------------------
    // Tags
    // -----------------------------------------------------------------------

    fn row_to_tag(row: &Row) -> Result<Tag, rusqlite::Error> {
        let kind: String = row.get(2)?;
        Ok(Tag {
            id: row.get(0)?,
            name: row.get(1)?,
            kind: TagKind::parse(&kind).unwrap_or(TagKind::System),
            weight: row.get(3)?,
        })
    }

    pub fn ensure_tag(&self, name: &str, kind: TagKind) -> StoreResult<Tag> {
        let name = name.trim().to_string();
        if name.is_empty() {
            return Err(StoreError::InvalidInput("tag name empty".into()));
        }
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO tags (name, kind, weight) VALUES (?1, ?2, 0)
                 ON CONFLICT(name) DO NOTHING",
                params![name, kind.as_str()],
            )?;
            conn.query_row(
                "SELECT id, name, kind, weight FROM tags WHERE name = ?1",
                params![name],
                Self::row_to_tag,
            )
        })
    }

    /// Attach a tag to a file, bumping the tag weight iff the membership row
    /// is new. One transaction.
    pub fn attach_tag(&self, file_id: i64, tag_id: i64) -> StoreResult<bool> {
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            let inserted = tx.execute(
                "INSERT OR IGNORE INTO file_tags (file_id, tag_id) VALUES (?1, ?2)",
                params![file_id, tag_id],
            )?;
            if inserted > 0 {
                tx.execute("UPDATE tags SET weight = weight + 1 WHERE id = ?1", params![tag_id])?;
            }
            tx.commit()?;
            Ok(inserted > 0)
        })
    }

    /// Remove tag memberships for a file (optionally one kind only),
    /// decrementing weights.
    pub fn detach_tags_for_file(&self, file_id: i64, kind: Option<TagKind>) -> StoreResult<usize> {
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            let tag_ids: Vec<i64> = {
                let (sql, has_kind) = match kind {
                    Some(_) => (
                        "SELECT t.id FROM tags t JOIN file_tags ft ON ft.tag_id = t.id
                         WHERE ft.file_id = ?1 AND t.kind = ?2",
                        true,
                    ),
                    None => (
                        "SELECT t.id FROM tags t JOIN file_tags ft ON ft.tag_id = t.id
                         WHERE ft.file_id = ?1",
                        false,
                    ),
                };
                let mut stmt = tx.prepare(sql)?;
                if has_kind {
                    let k = kind.map(TagKind::as_str).unwrap_or("SYSTEM");
                    stmt.query_map(params![file_id, k], |r| r.get(0))?.collect::<Result<_, _>>()?
                } else {
                    stmt.query_map(params![file_id], |r| r.get(0))?.collect::<Result<_, _>>()?
                }
            };
            for tag_id in &tag_ids {
                tx.execute(
                    "DELETE FROM file_tags WHERE file_id = ?1 AND tag_id = ?2",
                    params![file_id, tag_id],
                )?;
                tx.execute(
                    "UPDATE tags SET weight = MAX(weight - 1, 0) WHERE id = ?1",
                    params![tag_id],
                )?;
            }
            tx.commit()?;
            Ok(tag_ids.len())
        })
    }

    pub fn tags_for_file(&self, file_id: i64) -> StoreResult<Vec<Tag>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT t.id, t.name, t.kind, t.weight FROM tags t
                 JOIN file_tags ft ON ft.tag_id = t.id WHERE ft.file_id = ?1 ORDER BY t.name",
            )?;
            let rows = stmt.query_map(params![file_id], Self::row_to_tag)?;
            rows.collect()
        })
    }

    /// Top tags by weight — the materialized tag-cloud view.
    pub fn tag_cloud(&self, limit: usize) -> StoreResult<Vec<Tag>> {
        let limit = if limit == 0 { 100 } else { limit };
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, name, kind, weight FROM tags WHERE weight > 0
                 ORDER BY weight DESC, name LIMIT ?1",
            )?;
            let rows = stmt.query_map(params![limit as i64], Self::row_to_tag)?;
            rows.collect()
        })
    }

    /// Periodic audit: recompute every tag weight from live memberships.
    pub fn recount_tag_weights(&self) -> StoreResult<()> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE tags SET weight = (
                     SELECT COUNT(*) FROM file_tags ft
                     JOIN screening_results s ON s.id = ft.file_id
                     WHERE ft.tag_id = tags.id AND s.status != 'deleted')",
                [],
            )
        })?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Vector chunks
    // -----------------------------------------------------------------------

    fn row_to_chunk(row: &Row) -> Result<VectorChunk, rusqlite::Error> {
        let tier: String = row.get(2)?;
        let modality: String = row.get(6)?;
        Ok(VectorChunk {
            id: row.get(0)?,
            file_path: row.get(1)?,
            tier: if tier == "parent" { ChunkTier::Parent } else { ChunkTier::Child },
            parent_id: row.get(3)?,
            ordinal: row.get(4)?,
            text: row.get(5)?,
            modality: if modality == "image" { Modality::Image } else { Modality::Text },
            embedding: Vec::new(),
            token_count: row.get(7)?,
        })
    }

    const CHUNK_COLS: &'static str =
        "id, file_path, tier, parent_id, ordinal, text, modality, token_count";

    /// Atomically replace the chunk set of a file. Children reference parents
    /// by ordinal; the store resolves those to fresh rowids. Returns the
    /// inserted rows (parents first). Retries never double-insert: the old
    /// set is deleted in the same transaction.
    pub fn replace_chunk_set(
        &self,
        file_path: &str,
        chunks: &[NewChunk],
    ) -> StoreResult<Vec<VectorChunk>> {
        let parent_ordinals: std::collections::HashSet<i64> = chunks
            .iter()
            .filter(|c| c.tier == ChunkTier::Parent)
            .map(|c| c.ordinal)
            .collect();
        for c in chunks {
            match c.tier {
                ChunkTier::Parent if c.parent_ordinal.is_some() => {
                    return Err(StoreError::InvalidInput("parent chunk with parent_ordinal".into()))
                }
                ChunkTier::Child => match c.parent_ordinal {
                    None => {
                        return Err(StoreError::InvalidInput("child chunk without parent".into()))
                    }
                    Some(p) if !parent_ordinals.contains(&p) => {
                        return Err(StoreError::InvalidInput(format!(
                            "child references missing parent ordinal {p}"
                        )))
                    }
                    Some(_) => {}
                },
                _ => {}
            }
        }
        let file_path = file_path.to_string();
        let chunks = chunks.to_vec();
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            tx.execute("DELETE FROM vector_chunks WHERE file_path = ?1", params![file_path])?;

            let mut parent_ids: std::collections::HashMap<i64, i64> =
                std::collections::HashMap::new();
            let mut ids: Vec<i64> = Vec::with_capacity(chunks.len());

            for c in chunks.iter().filter(|c| c.tier == ChunkTier::Parent) {
                tx.execute(
                    "INSERT INTO vector_chunks
                     (file_path, tier, parent_id, ordinal, text, modality, token_count)
                     VALUES (?1, 'parent', NULL, ?2, ?3, ?4, ?5)",
                    params![file_path, c.ordinal, c.text, c.modality.as_str(), c.token_count],
                )?;
                let id = tx.last_insert_rowid();
                parent_ids.insert(c.ordinal, id);
                ids.push(id);
            }
            for c in chunks.iter().filter(|c| c.tier == ChunkTier::Child) {
                let parent_ordinal = c.parent_ordinal.unwrap_or_default();
                // Pre-validated above; the lookup cannot fail.
                let parent_id = parent_ids
                    .get(&parent_ordinal)
                    .copied()
                    .ok_or(rusqlite::Error::InvalidQuery)?;
                tx.execute(
                    "INSERT INTO vector_chunks
                     (file_path, tier, parent_id, ordinal, text, modality, token_count)
                     VALUES (?1, 'child', ?2, ?3, ?4, ?5, ?6)",
                    params![file_path, parent_id, c.ordinal, c.text, c.modality.as_str(), c.token_count],
                )?;
                ids.push(tx.last_insert_rowid());
            }

            let mut out = Vec::with_capacity(ids.len());
            for id in ids {
                out.push(tx.query_row(
                    &format!("SELECT {} FROM vector_chunks WHERE id = ?1", Self::CHUNK_COLS),
                    params![id],
                    Self::row_to_chunk,
                )?);
            }
            tx.commit()?;
            Ok(out)
        })
    }

    pub fn chunks_for_file(&self, file_path: &str) -> StoreResult<Vec<VectorChunk>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM vector_chunks WHERE file_path = ?1 ORDER BY tier DESC, ordinal",
                Self::CHUNK_COLS
            ))?;
            let rows = stmt.query_map(params![file_path], Self::row_to_chunk)?;
            rows.collect()
        })
    }

    pub fn get_chunk(&self, id: i64) -> StoreResult<VectorChunk> {
        self.with_conn(|conn| {
            conn.query_row(
                &format!("SELECT {} FROM vector_chunks WHERE id = ?1", Self::CHUNK_COLS),
                params![id],
                Self::row_to_chunk,
            )
        })
        .map_err(|e| match e {
            StoreError::NotFound(_) => StoreError::NotFound(format!("chunk {id}")),
            other => other,
        })
    }

    /// Delete a file's chunks, returning the removed ids so the vector index
    /// can drop the matching embeddings.
    pub fn delete_chunks_for_file(&self, file_path: &str) -> StoreResult<Vec<i64>> {
        let file_path = file_path.to_string();
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            let mut stmt = tx.prepare("SELECT id FROM vector_chunks WHERE file_path = ?1")?;
            let ids: Vec<i64> =
                stmt.query_map(params![file_path], |r| r.get(0))?.collect::<Result<_, _>>()?;
            drop(stmt);
            tx.execute("DELETE FROM vector_chunks WHERE file_path = ?1", params![file_path])?;
            tx.commit()?;
            Ok(ids)
        })
    }

    /// File-level modality derived from the chunk set.
    pub fn file_modality(&self, file_path: &str) -> StoreResult<Option<FileModality>> {
        let chunks = self.chunks_for_file(file_path)?;
        let children: Vec<&VectorChunk> =
            chunks.iter().filter(|c| c.tier == ChunkTier::Child).collect();
        if children.is_empty() {
            return Ok(None);
        }
        let has_text = children.iter().any(|c| c.modality == Modality::Text);
        let has_image = children.iter().any(|c| c.modality == Modality::Image);
        Ok(Some(match (has_text, has_image) {
            (true, true) => FileModality::Mixed,
            (false, true) => FileModality::Image,
            _ => FileModality::Text,
        }))
    }

    /// Copy an existing chunk set onto another path (content-hash dedup).
    /// Returns `(source_child_id, new_child_id)` pairs so the vector index
    /// can duplicate embeddings without re-embedding.
    pub fn copy_chunk_set(
        &self,
        from_path: &str,
        to_path: &str,
    ) -> StoreResult<Vec<(i64, i64)>> {
        let source = self.chunks_for_file(from_path)?;
        if source.is_empty() {
            return Ok(Vec::new());
        }
        let to_path = to_path.to_string();
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            tx.execute("DELETE FROM vector_chunks WHERE file_path = ?1", params![to_path])?;

            let mut parent_map: std::collections::HashMap<i64, i64> =
                std::collections::HashMap::new();
            for chunk in source.iter().filter(|c| c.tier == ChunkTier::Parent) {
                tx.execute(
                    "INSERT INTO vector_chunks
                     (file_path, tier, parent_id, ordinal, text, modality, token_count)
                     VALUES (?1, 'parent', NULL, ?2, ?3, ?4, ?5)",
                    params![to_path, chunk.ordinal, chunk.text, chunk.modality.as_str(), chunk.token_count],
                )?;
                parent_map.insert(chunk.id, tx.last_insert_rowid());
            }
            let mut pairs = Vec::new();
            for chunk in source.iter().filter(|c| c.tier == ChunkTier::Child) {
                let parent_id = chunk.parent_id.and_then(|p| parent_map.get(&p).copied());
                tx.execute(
                    "INSERT INTO vector_chunks
                     (file_path, tier, parent_id, ordinal, text, modality, token_count)
                     VALUES (?1, 'child', ?2, ?3, ?4, ?5, ?6)",
                    params![to_path, parent_id, chunk.ordinal, chunk.text, chunk.modality.as_str(), chunk.token_count],
                )?;
                pairs.push((chunk.id, tx.last_insert_rowid()));
            }
            tx.commit()?;
            Ok(pairs)
        })
    }

    /// Chunk file paths with no live screening row — candidates for deletion.
    pub fn audit_orphan_chunks(&self) -> StoreResult<Vec<String>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT DISTINCT c.file_path FROM vector_chunks c
                 WHERE NOT EXISTS (
                     SELECT 1 FROM screening_results s
                     WHERE s.file_path = c.file_path AND s.status != 'deleted')",
            )?;
            let rows = stmt.query_map([], |r| r.get(0))?;
            rows.collect()
        })
    }

    // -----------------------------------------------------------------------
    // Vectorization tasks
    // -----------------------------------------------------------------------

    fn row_to_task(row: &Row) -> Result<VectorizationTask, rusqlite::Error> {
        let status: String = row.get(2)?;
        let stage: String = row.get(3)?;
        Ok(VectorizationTask {
            id: row.get(0)?,
            file_path: row.get(1)?,
            status: TaskStatus::parse(&status).unwrap_or(TaskStatus::Queued),
            stage: match stage.as_str() {
                "parsing" => TaskStage::Parsing,
                "chunking" => TaskStage::Chunking,
                "vectorizing" => TaskStage::Vectorizing,
                "completed" => TaskStage::Completed,
                "failed" => TaskStage::Failed,
                _ => TaskStage::Queued,
            },
            progress: row.get::<_, i64>(4)? as u8,
            parent_count: row.get(5)?,
            child_count: row.get(6)?,
            error: row.get(7)?,
            created_at: from_ms(row.get(8)?),
            updated_at: from_ms(row.get(9)?),
        })
    }

    const TASK_COLS: &'static str = "id, file_path, status, stage, progress, parent_count, \
         child_count, error, created_at, updated_at";

    /// Create a queued task. `Conflict` if a non-terminal task already exists
    /// for the path (exactly-one invariant, enforced by a partial index).
    pub fn create_task(&self, file_path: &str) -> StoreResult<VectorizationTask> {
        let file_path = file_path.to_string();
        let now = ms(Utc::now());
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO vectorization_tasks
                 (file_path, status, stage, progress, created_at, updated_at)
                 VALUES (?1, 'queued', 'queued', 0, ?2, ?2)",
                params![file_path, now],
            )?;
            let id = conn.last_insert_rowid();
            conn.query_row(
                &format!("SELECT {} FROM vectorization_tasks WHERE id = ?1", Self::TASK_COLS),
                params![id],
                Self::row_to_task,
            )
        })
    }

    #[allow(clippy::too_many_arguments)]
    pub fn update_task(
        &self,
        id: i64,
        status: TaskStatus,
        stage: TaskStage,
        progress: u8,
        parent_count: Option<i64>,
        child_count: Option<i64>,
        error: Option<&str>,
    ) -> StoreResult<VectorizationTask> {
        let now = ms(Utc::now());
        let error = error.map(str::to_string);
        self.with_conn(move |conn| {
            conn.execute(
                "UPDATE vectorization_tasks
                 SET status = ?2, stage = ?3, progress = ?4, parent_count = ?5,
                     child_count = ?6, error = ?7, updated_at = ?8
                 WHERE id = ?1",
                params![
                    id,
                    status.as_str(),
                    stage.as_str(),
                    i64::from(progress.min(100)),
                    parent_count,
                    child_count,
                    error,
                    now
                ],
            )?;
            conn.query_row(
                &format!("SELECT {} FROM vectorization_tasks WHERE id = ?1", Self::TASK_COLS),
                params![id],
                Self::row_to_task,
            )
        })
    }

    pub fn get_task(&self, id: i64) -> StoreResult<VectorizationTask> {
        self.with_conn(|conn| {
            conn.query_row(
                &format!("SELECT {} FROM vectorization_tasks WHERE id = ?1", Self::TASK_COLS),
                params![id],
                Self::row_to_task,
            )
        })
        .map_err(|e| match e {
            StoreError::NotFound(_) => StoreError::NotFound(format!("task {id}")),
            other => other,
        })
    }

    /// Latest task for a path, terminal or not.
    pub fn task_for_file(&self, file_path: &str) -> StoreResult<Option<VectorizationTask>> {
        self.with_conn(|conn| {
            conn.query_row(
                &format!(
                    "SELECT {} FROM vectorization_tasks WHERE file_path = ?1
                     ORDER BY id DESC LIMIT 1",
                    Self::TASK_COLS
                ),
                params![file_path],
                Self::row_to_task,
            )
            .optional()
        })
    }

    pub fn list_tasks(&self, status: Option<TaskStatus>) -> StoreResult<Vec<VectorizationTask>> {
        self.with_conn(move |conn| {
            let (sql, with_status) = match status {
                Some(_) => (
                    format!(
                        "SELECT {} FROM vectorization_tasks WHERE status = ?1 ORDER BY id",
                        Self::TASK_COLS
                    ),
                    true,
                ),
                None => (
                    format!("SELECT {} FROM vectorization_tasks ORDER BY id", Self::TASK_COLS),
                    false,
                ),
            };
            let mut stmt = conn.prepare(&sql)?;
            if with_status {
                let s = status.map(TaskStatus::as_str).unwrap_or("queued");
                let rows = stmt.query_map(params![s], Self::row_to_task)?;
                rows.collect()
            } else {
                let rows = stmt.query_map([], Self::row_to_task)?;
                rows.collect()
            }
        })
    }

    // -----------------------------------------------------------------------
    // Sessions
    // -----------------------------------------------------------------------

    fn row_to_session(row: &Row) -> Result<Session, rusqlite::Error> {
        let metadata: String = row.get(3)?;
        Ok(Session {
            id: row.get(0)?,
            name: row.get(1)?,
            scenario_id: row.get(2)?,
            metadata: serde_json::from_str(&metadata)
                .unwrap_or(serde_json::Value::Object(Default::default())),
            created_at: from_ms(row.get(4)?),
            updated_at: from_ms(row.get(5)?),
        })
    }

    const SESSION_COLS: &'static str =
        "id, name, scenario_id, metadata, created_at, updated_at";

    pub fn create_session(&self, name: &str) -> StoreResult<Session> {
        let id = uuid::Uuid::new_v4().to_string();
        let name = name.to_string();
        let now = ms(Utc::now());
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO sessions (id, name, metadata, created_at, updated_at)
                 VALUES (?1, ?2, '{}', ?3, ?3)",
                params![id, name, now],
            )?;
            conn.query_row(
                &format!("SELECT {} FROM sessions WHERE id = ?1", Self::SESSION_COLS),
                params![id],
                Self::row_to_session,
            )
        })
    }

    pub fn get_session(&self, id: &str) -> StoreResult<Session> {
        self.with_conn(|conn| {
            conn.query_row(
                &format!("SELECT {} FROM sessions WHERE id = ?1", Self::SESSION_COLS),
                params![id],
                Self::row_to_session,
            )
        })
        .map_err(|e| match e {
            StoreError::NotFound(_) => StoreError::NotFound(format!("session {id}")),
            other => other,
        })
    }

    pub fn list_sessions(&self) -> StoreResult<Vec<Session>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM sessions ORDER BY updated_at DESC",
                Self::SESSION_COLS
            ))?;
            let rows = stmt.query_map([], Self::row_to_session)?;
            rows.collect()
        })
    }

    pub fn rename_session(&self, id: &str, name: &str) -> StoreResult<Session> {
        let now = ms(Utc::now());
        let n = self.with_conn(|conn| {
            conn.execute(
                "UPDATE sessions SET name = ?2, updated_at = ?3 WHERE id = ?1",
                params![id, name, now],
            )
        })?;
        if n == 0 {
            return Err(StoreError::NotFound(format!("session {id}")));
        }
        self.get_session(id)
    }

    pub fn delete_session(&self, id: &str) -> StoreResult<()> {
        let n = self
            .with_conn(|conn| conn.execute("DELETE FROM sessions WHERE id = ?1", params![id]))?;
        if n == 0 {
            return Err(StoreError::NotFound(format!("session {id}")));
        }
        Ok(())
    }

    /// Atomic scenario transition: `scenario_id` and metadata written
    /// together or not at all.
    pub fn set_session_scenario(
        &self,
        id: &str,
        scenario_id: Option<&str>,
        metadata: &serde_json::Value,
    ) -> StoreResult<Session> {
        let metadata = serde_json::to_string(metadata)
            .map_err(|e| StoreError::InvalidInput(format!("metadata: {e}")))?;
        let scenario_id = scenario_id.map(str::to_string);
        let now = ms(Utc::now());
        let n = self.with_conn(move |conn| {
            conn.execute(
                "UPDATE sessions SET scenario_id = ?2, metadata = ?3, updated_at = ?4
                 WHERE id = ?1",
                params![id, scenario_id, metadata, now],
            )
        })?;
        if n == 0 {
            return Err(StoreError::NotFound(format!("session {id}")));
        }
        self.get_session(id)
    }

    pub fn pin_file(
        &self,
        session_id: &str,
        file_path: &str,
        metadata: &serde_json::Value,
    ) -> StoreResult<()> {
        self.get_session(session_id)?;
        let metadata = serde_json::to_string(metadata)
            .map_err(|e| StoreError::InvalidInput(format!("metadata: {e}")))?;
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO pinned_files (session_id, file_path, metadata) VALUES (?1, ?2, ?3)
                 ON CONFLICT(session_id, file_path) DO UPDATE SET metadata = excluded.metadata",
                params![session_id, file_path, metadata],
            )
        })?;
        Ok(())
    }

    pub fn unpin_file(&self, session_id: &str, file_path: &str) -> StoreResult<()> {
        let n = self.with_conn(|conn| {
            conn.execute(
                "DELETE FROM pinned_files WHERE session_id = ?1 AND file_path = ?2",
                params![session_id, file_path],
            )
        })?;
        if n == 0 {
            return Err(StoreError::NotFound(format!("pin {file_path} in {session_id}")));
        }
        Ok(())
    }

    pub fn pinned_files(&self, session_id: &str) -> StoreResult<Vec<PinnedFile>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT session_id, file_path, metadata FROM pinned_files
                 WHERE session_id = ?1 ORDER BY file_path",
            )?;
            let rows = stmt.query_map(params![session_id], |row| {
                let metadata: String = row.get(2)?;
                Ok(PinnedFile {
                    session_id: row.get(0)?,
                    file_path: row.get(1)?,
                    metadata: serde_json::from_str(&metadata)
                        .unwrap_or(serde_json::Value::Object(Default::default())),
                })
            })?;
            rows.collect()
        })
    }

    pub fn set_session_tools(&self, session_id: &str, tools: &[String]) -> StoreResult<()> {
        self.get_session(session_id)?;
        let tools = tools.to_vec();
        let session_id = session_id.to_string();
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            tx.execute(
                "DELETE FROM session_tool_selections WHERE session_id = ?1",
                params![session_id],
            )?;
            for tool in &tools {
                tx.execute(
                    "INSERT OR IGNORE INTO session_tool_selections (session_id, tool_name)
                     VALUES (?1, ?2)",
                    params![session_id, tool],
                )?;
            }
            tx.commit()?;
            Ok(())
        })
    }

    pub fn session_tools(&self, session_id: &str) -> StoreResult<Vec<String>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT tool_name FROM session_tool_selections
                 WHERE session_id = ?1 ORDER BY tool_name",
            )?;
            let rows = stmt.query_map(params![session_id], |r| r.get(0))?;
            rows.collect()
        })
    }

    // -----------------------------------------------------------------------
    // Providers / models / capability assignments
    // -----------------------------------------------------------------------

    fn row_to_provider(row: &Row) -> Result<ProviderConfig, rusqlite::Error> {
        let kind: String = row.get(1)?;
        let source: String = row.get(7)?;
        Ok(ProviderConfig {
            id: row.get(0)?,
            kind: ProviderKind::parse(&kind).unwrap_or(ProviderKind::OpenAiLike),
            display_name: row.get(2)?,
            base_url: row.get(3)?,
            api_key: row.get(4)?,
            use_proxy: row.get::<_, i64>(5)? != 0,
            is_active: row.get::<_, i64>(6)? != 0,
            source_type: ProviderSource::parse(&source).unwrap_or(ProviderSource::Configurable),
            support_discovery: row.get::<_, i64>(8)? != 0,
        })
    }

    const PROVIDER_COLS: &'static str = "id, kind, display_name, base_url, api_key, use_proxy, \
         is_active, source_type, support_discovery";

    #[allow(clippy::too_many_arguments)]
    pub fn add_provider(
        &self,
        kind: ProviderKind,
        display_name: &str,
        base_url: Option<&str>,
        api_key: Option<&str>,
        use_proxy: bool,
        source_type: ProviderSource,
        support_discovery: bool,
    ) -> StoreResult<ProviderConfig> {
        let display_name = display_name.to_string();
        let base_url = base_url.map(str::to_string);
        let api_key = api_key.map(str::to_string);
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO provider_configs
                 (kind, display_name, base_url, api_key, use_proxy, is_active, source_type, support_discovery)
                 VALUES (?1, ?2, ?3, ?4, ?5, 1, ?6, ?7)",
                params![
                    kind.as_str(),
                    display_name,
                    base_url,
                    api_key,
                    use_proxy as i64,
                    source_type.as_str(),
                    support_discovery as i64
                ],
            )?;
            let id = conn.last_insert_rowid();
            conn.query_row(
                &format!("SELECT {} FROM provider_configs WHERE id = ?1", Self::PROVIDER_COLS),
                params![id],
                Self::row_to_provider,
            )
        })
    }

    pub fn get_provider(&self, id: i64) -> StoreResult<ProviderConfig> {
        self.with_conn(|conn| {
            conn.query_row(
                &format!("SELECT {} FROM provider_configs WHERE id = ?1", Self::PROVIDER_COLS),
                params![id],
                Self::row_to_provider,
            )
        })
        .map_err(|e| match e {
            StoreError::NotFound(_) => StoreError::NotFound(format!("provider {id}")),
            other => other,
        })
    }

    pub fn list_providers(&self) -> StoreResult<Vec<ProviderConfig>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM provider_configs ORDER BY id",
                Self::PROVIDER_COLS
            ))?;
            let rows = stmt.query_map([], Self::row_to_provider)?;
            rows.collect()
        })
    }

    pub fn update_provider(
        &self,
        id: i64,
        base_url: Option<&str>,
        api_key: Option<&str>,
        use_proxy: Option<bool>,
        is_active: Option<bool>,
    ) -> StoreResult<ProviderConfig> {
        let existing = self.get_provider(id)?;
        let base_url = base_url.map(str::to_string).or(existing.base_url);
        let api_key = api_key.map(str::to_string).or(existing.api_key);
        let use_proxy = use_proxy.unwrap_or(existing.use_proxy);
        let is_active = is_active.unwrap_or(existing.is_active);
        self.with_conn(move |conn| {
            conn.execute(
                "UPDATE provider_configs
                 SET base_url = ?2, api_key = ?3, use_proxy = ?4, is_active = ?5 WHERE id = ?1",
                params![id, base_url, api_key, use_proxy as i64, is_active as i64],
            )?;
            conn.query_row(
                &format!("SELECT {} FROM provider_configs WHERE id = ?1", Self::PROVIDER_COLS),
                params![id],
                Self::row_to_provider,
            )
        })
    }

    pub fn delete_provider(&self, id: i64) -> StoreResult<()> {
        let n = self.with_conn(|conn| {
            conn.execute("DELETE FROM provider_configs WHERE id = ?1", params![id])
        })?;
        if n == 0 {
            return Err(StoreError::NotFound(format!("provider {id}")));
        }
        Ok(())
    }

    fn row_to_model(row: &Row) -> Result<ModelConfig, rusqlite::Error> {
        Ok(ModelConfig {
            id: row.get(0)?,
            provider_id: row.get(1)?,
            model_identifier: row.get(2)?,
            display_name: row.get(3)?,
            capabilities: Capabilities {
                text: row.get::<_, i64>(4)? != 0,
                vision: row.get::<_, i64>(5)? != 0,
                tool_use: row.get::<_, i64>(6)? != 0,
                structured_output: row.get::<_, i64>(7)? != 0,
            },
            is_enabled: row.get::<_, i64>(8)? != 0,
        })
    }

    const MODEL_COLS: &'static str = "id, provider_id, model_identifier, display_name, cap_text, \
         cap_vision, cap_tool_use, cap_structured_output, is_enabled";

    /// Insert or refresh a model row. New rows start disabled unless stated.
    pub fn upsert_model(
        &self,
        provider_id: i64,
        model_identifier: &str,
        display_name: &str,
        capabilities: Capabilities,
        is_enabled: bool,
    ) -> StoreResult<ModelConfig> {
        let model_identifier = model_identifier.to_string();
        let display_name = display_name.to_string();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO model_configs
                 (provider_id, model_identifier, display_name, cap_text, cap_vision,
                  cap_tool_use, cap_structured_output, is_enabled)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                 ON CONFLICT(provider_id, model_identifier) DO UPDATE SET
                     display_name = excluded.display_name",
                params![
                    provider_id,
                    model_identifier,
                    display_name,
                    capabilities.text as i64,
                    capabilities.vision as i64,
                    capabilities.tool_use as i64,
                    capabilities.structured_output as i64,
                    is_enabled as i64
                ],
            )?;
            conn.query_row(
                &format!(
                    "SELECT {} FROM model_configs
                     WHERE provider_id = ?1 AND model_identifier = ?2",
                    Self::MODEL_COLS
                ),
                params![provider_id, model_identifier],
                Self::row_to_model,
            )
        })
    }

    pub fn get_model(&self, id: i64) -> StoreResult<ModelConfig> {
        self.with_conn(|conn| {
            conn.query_row(
                &format!("SELECT {} FROM model_configs WHERE id = ?1", Self::MODEL_COLS),
                params![id],
                Self::row_to_model,
            )
        })
        .map_err(|e| match e {
            StoreError::NotFound(_) => StoreError::NotFound(format!("model {id}")),
            other => other,
        })
    }

    pub fn list_models(&self, provider_id: Option<i64>) -> StoreResult<Vec<ModelConfig>> {
        self.with_conn(move |conn| match provider_id {
            Some(pid) => {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {} FROM model_configs WHERE provider_id = ?1 ORDER BY id",
                    Self::MODEL_COLS
                ))?;
                let rows = stmt.query_map(params![pid], Self::row_to_model)?;
                rows.collect()
            }
            None => {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {} FROM model_configs ORDER BY id",
                    Self::MODEL_COLS
                ))?;
                let rows = stmt.query_map([], Self::row_to_model)?;
                rows.collect()
            }
        })
    }

    pub fn set_model_enabled(&self, id: i64, enabled: bool) -> StoreResult<ModelConfig> {
        let n = self.with_conn(|conn| {
            conn.execute(
                "UPDATE model_configs SET is_enabled = ?2 WHERE id = ?1",
                params![id, enabled as i64],
            )
        })?;
        if n == 0 {
            return Err(StoreError::NotFound(format!("model {id}")));
        }
        self.get_model(id)
    }

    pub fn set_model_capabilities(
        &self,
        id: i64,
        capabilities: Capabilities,
    ) -> StoreResult<ModelConfig> {
        let n = self.with_conn(move |conn| {
            conn.execute(
                "UPDATE model_configs SET cap_text = ?2, cap_vision = ?3, cap_tool_use = ?4,
                     cap_structured_output = ?5 WHERE id = ?1",
                params![
                    id,
                    capabilities.text as i64,
                    capabilities.vision as i64,
                    capabilities.tool_use as i64,
                    capabilities.structured_output as i64
                ],
            )
        })?;
        if n == 0 {
            return Err(StoreError::NotFound(format!("model {id}")));
        }
        self.get_model(id)
    }

    pub fn delete_model(&self, id: i64) -> StoreResult<()> {
        let n = self
            .with_conn(|conn| conn.execute("DELETE FROM model_configs WHERE id = ?1", params![id]))?;
        if n == 0 {
            return Err(StoreError::NotFound(format!("model {id}")));
        }
        Ok(())
    }

    /// Bind a capability to a model. The model must advertise the capability.
    pub fn assign_capability(&self, capability: Capability, model_id: i64) -> StoreResult<()> {
        let model = self.get_model(model_id)?;
        if !model.capabilities.advertises(capability) {
            return Err(StoreError::InvalidInput(format!(
                "model '{}' does not advertise capability '{}'",
                model.model_identifier,
                capability.as_str()
            )));
        }
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO capability_assignments (capability, model_id) VALUES (?1, ?2)
                 ON CONFLICT(capability) DO UPDATE SET model_id = excluded.model_id",
                params![capability.as_str(), model_id],
            )
        })?;
        Ok(())
    }

    pub fn clear_capability(&self, capability: Capability) -> StoreResult<()> {
        self.with_conn(|conn| {
            conn.execute(
                "DELETE FROM capability_assignments WHERE capability = ?1",
                params![capability.as_str()],
            )
        })?;
        Ok(())
    }

    pub fn list_assignments(&self) -> StoreResult<Vec<GlobalCapabilityAssignment>> {
        self.with_conn(|conn| {
            let mut stmt =
                conn.prepare("SELECT capability, model_id FROM capability_assignments")?;
            let rows = stmt.query_map([], |row| {
                let cap: String = row.get(0)?;
                Ok(GlobalCapabilityAssignment {
                    capability: Capability::parse(&cap).unwrap_or(Capability::Text),
                    model_id: row.get(1)?,
                })
            })?;
            rows.collect()
        })
    }

    /// Resolve a capability to its assigned (model, provider) pair.
    pub fn resolve_capability(
        &self,
        capability: Capability,
    ) -> StoreResult<Option<(ModelConfig, ProviderConfig)>> {
        let model_id: Option<i64> = self.with_conn(|conn| {
            conn.query_row(
                "SELECT model_id FROM capability_assignments WHERE capability = ?1",
                params![capability.as_str()],
                |r| r.get(0),
            )
            .optional()
        })?;
        let Some(model_id) = model_id else { return Ok(None) };
        let model = self.get_model(model_id)?;
        let provider = self.get_provider(model.provider_id)?;
        Ok(Some((model, provider)))
    }

    // -----------------------------------------------------------------------
    // Config change log
    // -----------------------------------------------------------------------

    fn row_to_change(row: &Row) -> Result<ConfigChange, rusqlite::Error> {
        let kind: String = row.get(1)?;
        let payload: String = row.get(2)?;
        Ok(ConfigChange {
            id: row.get(0)?,
            kind: ConfigChangeKind::parse(&kind).unwrap_or(ConfigChangeKind::ToggleStatus),
            payload: serde_json::from_str(&payload).unwrap_or(serde_json::Value::Null),
            enqueued_at: from_ms(row.get(3)?),
            executed_at: row.get::<_, Option<i64>>(4)?.map(from_ms),
            failed: row.get::<_, i64>(5)? != 0,
        })
    }

    pub fn enqueue_change(
        &self,
        kind: ConfigChangeKind,
        payload: &serde_json::Value,
    ) -> StoreResult<ConfigChange> {
        let payload = serde_json::to_string(payload)
            .map_err(|e| StoreError::InvalidInput(format!("payload: {e}")))?;
        let now = ms(Utc::now());
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO config_changes (kind, payload, enqueued_at) VALUES (?1, ?2, ?3)",
                params![kind.as_str(), payload, now],
            )?;
            let id = conn.last_insert_rowid();
            conn.query_row(
                "SELECT id, kind, payload, enqueued_at, executed_at, failed
                 FROM config_changes WHERE id = ?1",
                params![id],
                Self::row_to_change,
            )
        })
    }

    /// Unexecuted changes in FIFO order.
    pub fn pending_changes(&self) -> StoreResult<Vec<ConfigChange>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, kind, payload, enqueued_at, executed_at, failed
                 FROM config_changes WHERE executed_at IS NULL ORDER BY id",
            )?;
            let rows = stmt.query_map([], Self::row_to_change)?;
            rows.collect()
        })
    }

    pub fn mark_change_executed(&self, id: i64, failed: bool) -> StoreResult<()> {
        let now = ms(Utc::now());
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE config_changes SET executed_at = ?2, failed = ?3 WHERE id = ?1",
                params![id, now, failed as i64],
            )
        })?;
        Ok(())
    }
}

/// True when `path` equals `prefix` or lives underneath it, component-wise.
pub fn path_has_prefix(path: &str, prefix: &str) -> bool {
    let prefix = prefix.trim_end_matches('/');
    path == prefix || path.starts_with(&format!("{prefix}/"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn candidate(path: &str, mtime_s: i64) -> FileCandidate {
        FileCandidate {
            path: path.to_string(),
            name: path.rsplit('/').next().unwrap_or(path).to_string(),
            extension: path.rsplit_once('.').map(|(_, e)| e.to_lowercase()),
            size: 123,
            mtime: Utc.timestamp_opt(mtime_s, 0).unwrap(),
            is_bundle: false,
        }
    }

    #[test]
    fn screening_upsert_is_idempotent() {
        let store = Store::open_in_memory().unwrap();
        let c = candidate("/docs/readme.md", 1_000);

        let (o1, r1) = store.upsert_screening(&c, None).unwrap();
        assert_eq!(o1, ScreeningOutcome::Inserted);
        assert_eq!(r1.status, ScreeningStatus::New);

        let (o2, _) = store.upsert_screening(&c, None).unwrap();
        assert_eq!(o2, ScreeningOutcome::Unchanged);

        // Newer mtime refreshes and resets status.
        store.set_screening_status("/docs/readme.md", ScreeningStatus::Vectorized).unwrap();
        let (o3, r3) = store.upsert_screening(&candidate("/docs/readme.md", 2_000), None).unwrap();
        assert_eq!(o3, ScreeningOutcome::Refreshed);
        assert_eq!(r3.status, ScreeningStatus::New);
        assert!(r3.content_hash.is_none());

        // Older mtime never moves the row backwards.
        let (o4, r4) = store.upsert_screening(&candidate("/docs/readme.md", 500), None).unwrap();
        assert_eq!(o4, ScreeningOutcome::Unchanged);
        assert_eq!(r4.modified_time, Utc.timestamp_opt(2_000, 0).unwrap());
    }

    #[test]
    fn blacklist_requires_whitelist_ancestor() {
        let store = Store::open_in_memory().unwrap();
        let err = store.add_folder("/docs/.cache", None, true, false).unwrap_err();
        assert!(matches!(err, StoreError::InvalidInput(_)));

        store.add_folder("/docs", None, false, false).unwrap();
        let black = store.add_folder("/docs/.cache", None, true, false).unwrap();
        assert!(black.parent_id.is_some());
    }

    #[test]
    fn whitelist_delete_cascades_to_blacklist_children() {
        let store = Store::open_in_memory().unwrap();
        let white = store.add_folder("/docs", None, false, false).unwrap();
        store.add_folder("/docs/.cache", None, true, false).unwrap();

        let removed = store.delete_folder_cascade(white.id).unwrap();
        assert_eq!(removed.len(), 2);
        assert!(store.list_folders().unwrap().is_empty());
    }

    #[test]
    fn duplicate_folder_path_conflicts() {
        let store = Store::open_in_memory().unwrap();
        store.add_folder("/docs", None, false, false).unwrap();
        let err = store.add_folder("/docs", None, false, false).unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
    }

    #[test]
    fn tag_weights_track_membership() {
        let store = Store::open_in_memory().unwrap();
        let (_, row) = store.upsert_screening(&candidate("/docs/a.md", 1), None).unwrap();
        let tag = store.ensure_tag("finance", TagKind::Llm).unwrap();

        assert!(store.attach_tag(row.id, tag.id).unwrap());
        assert!(!store.attach_tag(row.id, tag.id).unwrap()); // duplicate no-op

        let cloud = store.tag_cloud(10).unwrap();
        assert_eq!(cloud[0].weight, 1);

        store.detach_tags_for_file(row.id, None).unwrap();
        assert!(store.tag_cloud(10).unwrap().is_empty());
    }

    #[test]
    fn chunk_set_children_reference_parents() {
        let store = Store::open_in_memory().unwrap();
        let chunks = vec![
            NewChunk {
                tier: ChunkTier::Parent,
                parent_ordinal: None,
                ordinal: 0,
                text: Some("parent text".into()),
                modality: Modality::Text,
                token_count: 4,
            },
            NewChunk {
                tier: ChunkTier::Child,
                parent_ordinal: Some(0),
                ordinal: 0,
                text: Some("child one".into()),
                modality: Modality::Text,
                token_count: 3,
            },
            NewChunk {
                tier: ChunkTier::Child,
                parent_ordinal: Some(0),
                ordinal: 1,
                text: Some("child two".into()),
                modality: Modality::Text,
                token_count: 3,
            },
        ];
        let rows = store.replace_chunk_set("/docs/a.md", &chunks).unwrap();
        let parent = rows.iter().find(|c| c.tier == ChunkTier::Parent).unwrap();
        for child in rows.iter().filter(|c| c.tier == ChunkTier::Child) {
            assert_eq!(child.parent_id, Some(parent.id));
            assert_eq!(child.file_path, parent.file_path);
        }

        // Replacement is atomic — re-running never duplicates.
        let rows2 = store.replace_chunk_set("/docs/a.md", &chunks).unwrap();
        assert_eq!(rows2.len(), 3);
        assert_eq!(store.chunks_for_file("/docs/a.md").unwrap().len(), 3);
    }

    #[test]
    fn one_live_task_per_file() {
        let store = Store::open_in_memory().unwrap();
        let t = store.create_task("/docs/a.md").unwrap();
        let err = store.create_task("/docs/a.md").unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));

        store
            .update_task(t.id, TaskStatus::Completed, TaskStage::Completed, 100, Some(1), Some(2), None)
            .unwrap();
        store.create_task("/docs/a.md").unwrap(); // terminal task frees the slot
    }

    #[test]
    fn capability_assignment_checks_advertised() {
        let store = Store::open_in_memory().unwrap();
        let provider = store
            .add_provider(
                ProviderKind::OllamaLike,
                "local",
                Some("http://localhost:11434"),
                None,
                false,
                ProviderSource::Builtin,
                true,
            )
            .unwrap();
        let model = store
            .upsert_model(
                provider.id,
                "nomic-embed-text",
                "Nomic Embed",
                Capabilities { text: true, ..Default::default() },
                true,
            )
            .unwrap();

        let err = store.assign_capability(Capability::Vision, model.id).unwrap_err();
        assert!(matches!(err, StoreError::InvalidInput(_)));

        store.assign_capability(Capability::Text, model.id).unwrap();
        let (m, p) = store.resolve_capability(Capability::Text).unwrap().unwrap();
        assert_eq!(m.id, model.id);
        assert_eq!(p.id, provider.id);
    }

    #[test]
    fn orphan_audit_spots_chunks_without_screening() {
        let store = Store::open_in_memory().unwrap();
        store
            .replace_chunk_set(
                "/ghost.md",
                &[NewChunk {
                    tier: ChunkTier::Parent,
                    parent_ordinal: None,
                    ordinal: 0,
                    text: Some("x".into()),
                    modality: Modality::Text,
                    token_count: 1,
                }],
            )
            .unwrap();
        assert_eq!(store.audit_orphan_chunks().unwrap(), vec!["/ghost.md".to_string()]);
    }

    #[test]
    fn mark_under_prefix_hits_folder_subtree_only() {
        let store = Store::open_in_memory().unwrap();
        store.upsert_screening(&candidate("/a/x.md", 1), None).unwrap();
        store.upsert_screening(&candidate("/a/b/y.md", 1), None).unwrap();
        store.upsert_screening(&candidate("/ab/z.md", 1), None).unwrap();

        let hit = store.mark_under_prefix("/a", ScreeningStatus::Stale).unwrap();
        assert_eq!(hit.len(), 2);
        let z = store.get_screening("/ab/z.md").unwrap().unwrap();
        assert_eq!(z.status, ScreeningStatus::New);
    }
}
