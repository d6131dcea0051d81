// Helpdesk store: JSONL source of truth with a SQLite cache

use crate::filter::Filter;
use crate::jsonl;
use crate::record::{IndexValue, Record};
use crate::ticket::Ticket;
use crate::user::User;
use eyre::{Context, Result, eyre};
use fs2::FileExt;
use rusqlite::Connection;
use rusqlite::OptionalExtension;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

const CURRENT_VERSION: u32 = 1;
const STORE_DIR: &str = ".helpdesk";
const DB_FILE: &str = "helpdesk.db";
const LOCKS_DIR: &str = "locks";
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Persistent ticket and user store
pub struct Store {
    base_path: PathBuf,
    db: Connection,
}

impl Store {
    /// Open or create a store in the `.helpdesk` subdirectory of `path`
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let base_path = path.as_ref().join(STORE_DIR);

        fs::create_dir_all(base_path.join(LOCKS_DIR)).context("Failed to create store directory")?;

        let db_path = base_path.join(DB_FILE);
        let db = Connection::open(&db_path).context("Failed to open SQLite database")?;
        db.busy_timeout(BUSY_TIMEOUT)
            .context("Failed to set SQLite busy timeout")?;

        let mut store = Self { base_path, db };

        store.create_schema()?;
        store.create_gitignore()?;
        store.write_version()?;

        if store.is_stale()? {
            info!("Database is stale, syncing from JSONL files");
            store.sync()?;
        }

        Ok(store)
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    fn create_schema(&self) -> Result<()> {
        debug!("Creating database schema");

        self.db.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS records (
                collection TEXT NOT NULL,
                id TEXT NOT NULL,
                data_json TEXT NOT NULL,
                updated_at INTEGER NOT NULL,
                PRIMARY KEY (collection, id)
            );

            CREATE INDEX IF NOT EXISTS idx_records_updated_at ON records(collection, updated_at);

            CREATE TABLE IF NOT EXISTS record_indexes (
                collection TEXT NOT NULL,
                id TEXT NOT NULL,
                field_name TEXT NOT NULL,
                field_value_str TEXT,
                field_value_int INTEGER,
                field_value_bool INTEGER,
                PRIMARY KEY (collection, id, field_name),
                FOREIGN KEY (collection, id) REFERENCES records(collection, id) ON DELETE CASCADE
            );

            CREATE INDEX IF NOT EXISTS idx_record_indexes_field_str ON record_indexes(collection, field_name, field_value_str);
            CREATE INDEX IF NOT EXISTS idx_record_indexes_field_int ON record_indexes(collection, field_name, field_value_int);
            CREATE INDEX IF NOT EXISTS idx_record_indexes_field_bool ON record_indexes(collection, field_name, field_value_bool);

            CREATE TABLE IF NOT EXISTS sync_metadata (
                collection TEXT PRIMARY KEY,
                last_sync_time INTEGER NOT NULL,
                file_mtime INTEGER NOT NULL
            );
            "#,
        )?;

        Ok(())
    }

    fn create_gitignore(&self) -> Result<()> {
        let gitignore_path = self.base_path.join(".gitignore");
        if !gitignore_path.exists() {
            fs::write(
                gitignore_path,
                format!("{db}\n{db}-shm\n{db}-wal\n{LOCKS_DIR}/\n", db = DB_FILE),
            )?;
        }
        Ok(())
    }

    fn write_version(&self) -> Result<()> {
        let version_path = self.base_path.join(".version");
        if !version_path.exists() {
            fs::write(version_path, CURRENT_VERSION.to_string())?;
        }
        Ok(())
    }

    /// True if any JSONL file changed since the last sync or was never synced
    pub fn is_stale(&self) -> Result<bool> {
        for entry in fs::read_dir(&self.base_path)? {
            let path = entry?.path();

            if path.extension().and_then(|s| s.to_str()) != Some("jsonl") {
                continue;
            }

            let Some(collection) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };

            let file_mtime = Self::file_mtime(&path)?;

            let stored_mtime: Option<i64> = self
                .db
                .query_row(
                    "SELECT file_mtime FROM sync_metadata WHERE collection = ?1",
                    [collection],
                    |row| row.get(0),
                )
                .optional()?;

            match stored_mtime {
                None => return Ok(true),
                Some(mtime) if file_mtime > mtime => return Ok(true),
                _ => continue,
            }
        }

        Ok(false)
    }

    fn file_mtime(path: &Path) -> Result<i64> {
        Ok(fs::metadata(path)?
            .modified()?
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0))
    }

    // ========================================================================
    // CRUD
    // ========================================================================

    /// Write a record (insert or replace) to JSONL then SQLite
    pub fn create<T: Record>(&mut self, record: T) -> Result<String> {
        let collection = T::collection_name();
        Self::validate_collection_name(collection)?;

        let id = record.id().to_string();
        Self::validate_id(&id)?;

        jsonl::append_jsonl(&self.jsonl_path(collection), &record)?;

        let tx = self.db.transaction()?;

        let data_json = serde_json::to_string(&record).context("Failed to serialize record")?;

        tx.execute(
            "INSERT OR REPLACE INTO records (collection, id, data_json, updated_at)
             VALUES (?1, ?2, ?3, ?4)",
            rusqlite::params![collection, &id, data_json, record.updated_at()],
        )?;

        Self::update_indexes_tx(&tx, collection, &id, &record.indexed_fields())?;

        tx.commit()?;

        debug!(collection, id = %id, "Stored record");
        Ok(id)
    }

    pub fn get<T: Record>(&self, id: &str) -> Result<Option<T>> {
        let collection = T::collection_name();

        let json: Option<String> = self
            .db
            .query_row(
                "SELECT data_json FROM records WHERE collection = ?1 AND id = ?2",
                rusqlite::params![collection, id],
                |row| row.get(0),
            )
            .optional()?;

        json.map(|json| serde_json::from_str(&json).context("Failed to deserialize record from database"))
            .transpose()
    }

    pub fn update<T: Record>(&mut self, record: T) -> Result<()> {
        self.create(record)?;
        Ok(())
    }

    /// Delete a record, leaving a tombstone in the JSONL log
    pub fn delete<T: Record>(&mut self, id: &str) -> Result<()> {
        let collection = T::collection_name();

        jsonl::append_jsonl(&self.jsonl_path(collection), &jsonl::tombstone(id, now_ms()))?;

        let tx = self.db.transaction()?;
        tx.execute(
            "DELETE FROM record_indexes WHERE collection = ?1 AND id = ?2",
            rusqlite::params![collection, id],
        )?;
        tx.execute(
            "DELETE FROM records WHERE collection = ?1 AND id = ?2",
            rusqlite::params![collection, id],
        )?;
        tx.commit()?;

        Ok(())
    }

    /// List records matching every filter, most recently updated first
    pub fn list<T: Record>(&self, filters: &[Filter]) -> Result<Vec<T>> {
        let collection = T::collection_name();

        let mut query = String::from(
            "SELECT r.data_json
             FROM records r
             WHERE r.collection = ?1",
        );

        for (i, filter) in filters.iter().enumerate() {
            Self::validate_field_name(&filter.field)?;

            let alias = format!("idx{}", i);
            let column = match filter.value {
                IndexValue::String(_) => "field_value_str",
                IndexValue::Int(_) => "field_value_int",
                IndexValue::Bool(_) => "field_value_bool",
            };
            query.push_str(&format!(
                " AND EXISTS (
                    SELECT 1 FROM record_indexes {alias}
                    WHERE {alias}.collection = r.collection
                      AND {alias}.id = r.id
                      AND {alias}.field_name = ?{name_param}
                      AND {alias}.{column} {op} ?{value_param})",
                name_param = i + 2,
                op = filter.op.to_sql(),
                value_param = i + 2 + filters.len(),
            ));
        }

        query.push_str(" ORDER BY r.updated_at DESC");

        let mut params: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();
        params.push(Box::new(collection.to_string()));

        for filter in filters {
            params.push(Box::new(filter.field.clone()));
        }

        for filter in filters {
            match &filter.value {
                IndexValue::String(s) => params.push(Box::new(s.clone())),
                IndexValue::Int(i) => params.push(Box::new(*i)),
                IndexValue::Bool(b) => params.push(Box::new(*b as i64)),
            }
        }

        let params_refs: Vec<&dyn rusqlite::ToSql> = params.iter().map(|p| p.as_ref()).collect();

        let mut stmt = self.db.prepare(&query)?;
        let rows = stmt.query_map(params_refs.as_slice(), |row| row.get::<_, String>(0))?;

        let mut results = Vec::new();
        for row in rows {
            let record: T = serde_json::from_str(&row?).context("Failed to deserialize record")?;
            results.push(record);
        }

        Ok(results)
    }

    // ========================================================================
    // Per-ticket serialization
    // ========================================================================

    /// Run `f` while holding the exclusive lock for ticket `id`
    ///
    /// Load, engine call and persist for one ticket must all happen inside `f`.
    /// Locks are advisory and per ticket, so different tickets never contend.
    pub fn with_ticket_lock<R, E, F>(&mut self, id: &str, f: F) -> std::result::Result<R, E>
    where
        F: FnOnce(&mut Self) -> std::result::Result<R, E>,
        E: From<eyre::Report>,
    {
        let lock_file = self.acquire_ticket_lock(id)?;
        let result = f(self);

        if let Err(e) = FileExt::unlock(&lock_file) {
            warn!(ticket_id = id, error = ?e, "Failed to release ticket lock");
        }
        result
    }

    fn acquire_ticket_lock(&self, id: &str) -> Result<fs::File> {
        Self::validate_lock_id(id)?;

        let lock_path = self.base_path.join(LOCKS_DIR).join(format!("{}.lock", id));
        let file = fs::OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&lock_path)
            .with_context(|| format!("Failed to open lock file {}", lock_path.display()))?;

        file.lock_exclusive().context("Failed to acquire ticket lock")?;
        debug!(ticket_id = id, "Acquired ticket lock");
        Ok(file)
    }

    // ========================================================================
    // Helpers
    // ========================================================================

    fn jsonl_path(&self, collection: &str) -> PathBuf {
        self.base_path.join(format!("{}.jsonl", collection))
    }

    fn update_indexes_tx(
        tx: &rusqlite::Transaction,
        collection: &str,
        id: &str,
        fields: &std::collections::HashMap<String, IndexValue>,
    ) -> Result<()> {
        debug!(collection, id, field_count = fields.len(), "update_indexes_tx: called");

        tx.execute(
            "DELETE FROM record_indexes WHERE collection = ?1 AND id = ?2",
            rusqlite::params![collection, id],
        )?;

        for (field_name, value) in fields {
            Self::validate_field_name(field_name)?;

            let (s, i, b): (Option<&str>, Option<i64>, Option<i64>) = match value {
                IndexValue::String(s) => (Some(s.as_str()), None, None),
                IndexValue::Int(i) => (None, Some(*i), None),
                IndexValue::Bool(b) => (None, None, Some(*b as i64)),
            };

            tx.execute(
                "INSERT INTO record_indexes (collection, id, field_name, field_value_str, field_value_int, field_value_bool)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                rusqlite::params![collection, id, field_name, s, i, b],
            )?;
        }

        Ok(())
    }

    fn validate_collection_name(name: &str) -> Result<()> {
        if name.is_empty() {
            return Err(eyre!("Collection name cannot be empty"));
        }
        if name.len() > 64 {
            return Err(eyre!("Collection name too long: {} (max 64 chars)", name));
        }
        if !name.chars().all(|c| c.is_alphanumeric() || c == '_' || c == '-') {
            return Err(eyre!(
                "Invalid collection name: {} (must be alphanumeric with _/-)",
                name
            ));
        }
        Ok(())
    }

    fn validate_field_name(name: &str) -> Result<()> {
        if name.is_empty() {
            return Err(eyre!("Field name cannot be empty"));
        }
        if name.len() > 64 {
            return Err(eyre!("Field name too long: {} (max 64 chars)", name));
        }
        if !name.chars().all(|c| c.is_alphanumeric() || c == '_') {
            return Err(eyre!("Invalid field name: {} (must be alphanumeric with _)", name));
        }
        Ok(())
    }

    fn validate_id(id: &str) -> Result<()> {
        if id.trim().is_empty() {
            return Err(eyre!("Record ID cannot be empty or whitespace-only"));
        }
        if id.len() > 256 {
            return Err(eyre!("Record ID too long: {} chars (max 256)", id.len()));
        }
        Ok(())
    }

    /// Whether `id` can name a ticket lock file
    ///
    /// Ticket ids are uuids, so an id outside this alphabet cannot exist in the store.
    pub fn is_lockable_id(id: &str) -> bool {
        Self::validate_id(id).is_ok() && id.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    }

    // Lock ids become file names
    fn validate_lock_id(id: &str) -> Result<()> {
        Self::validate_id(id)?;
        if !Self::is_lockable_id(id) {
            return Err(eyre!("Invalid ticket ID for locking: {}", id));
        }
        Ok(())
    }

    // ========================================================================
    // Sync
    // ========================================================================

    /// Rebuild the SQLite cache from the JSONL files, then reindex tickets and users
    pub fn sync(&mut self) -> Result<()> {
        info!("Syncing database from JSONL files");

        let tx = self.db.transaction()?;
        tx.execute("DELETE FROM record_indexes", [])?;
        tx.execute("DELETE FROM records", [])?;
        tx.execute("DELETE FROM sync_metadata", [])?;

        for entry in fs::read_dir(&self.base_path)? {
            let path = entry?.path();

            if path.extension().and_then(|s| s.to_str()) != Some("jsonl") {
                continue;
            }

            let collection = path
                .file_stem()
                .and_then(|s| s.to_str())
                .ok_or_else(|| eyre!("Invalid JSONL filename: {:?}", path))?;

            debug!("Syncing collection: {}", collection);

            let file_mtime = Self::file_mtime(&path)?;
            let records = jsonl::read_jsonl_latest(&path)?;

            for (id, record) in records {
                if jsonl::is_tombstone(&record) {
                    continue;
                }

                let data_json = serde_json::to_string(&record)?;
                let updated_at = jsonl::updated_at_ms(&record).unwrap_or(0);

                tx.execute(
                    "INSERT OR REPLACE INTO records (collection, id, data_json, updated_at)
                     VALUES (?1, ?2, ?3, ?4)",
                    rusqlite::params![collection, &id, data_json, updated_at],
                )?;
            }

            tx.execute(
                "INSERT OR REPLACE INTO sync_metadata (collection, last_sync_time, file_mtime)
                 VALUES (?1, ?2, ?3)",
                rusqlite::params![collection, now_ms(), file_mtime],
            )?;
        }

        tx.commit()?;

        let tickets = self.rebuild_indexes::<Ticket>()?;
        let users = self.rebuild_indexes::<User>()?;

        info!(tickets, users, "Sync complete");
        Ok(())
    }

    /// Rebuild `record_indexes` for one record type; returns the number indexed
    ///
    /// Rows that fail to deserialize as `T` are skipped with a warning.
    pub fn rebuild_indexes<T: Record>(&mut self) -> Result<usize> {
        let collection = T::collection_name();

        let records_data: Vec<(String, String)> = {
            let mut stmt = self
                .db
                .prepare("SELECT id, data_json FROM records WHERE collection = ?1")?;

            let rows = stmt.query_map([collection], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })?;

            rows.filter_map(|r| r.ok()).collect()
        };

        let tx = self.db.transaction()?;
        let mut count = 0;

        for (id, data_json) in records_data {
            let record: T = match serde_json::from_str(&data_json) {
                Ok(r) => r,
                Err(e) => {
                    warn!(
                        collection = collection,
                        id = &id,
                        error = ?e,
                        "Skipping record that doesn't match type"
                    );
                    continue;
                }
            };

            Self::update_indexes_tx(&tx, collection, &id, &record.indexed_fields())?;
            count += 1;
        }

        tx.commit()?;
        debug!(collection = collection, count = count, "Rebuilt indexes for collection");
        Ok(count)
    }
}

/// Current time in milliseconds since epoch
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
