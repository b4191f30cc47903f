use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use anyhow::{anyhow, Context, Result};
use engram_core::{
    Backend, EngramError, EntryFilter, EntrySort, EntryWrite, Fact, FactQuery, FactWrite,
    MutableEntry, RecordQuery, RecordSort, RecordWrite, SortOrder, VersionedRecord,
};
use rusqlite::{params, Connection, DatabaseName, OptionalExtension, Transaction};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use time::OffsetDateTime;

const LATEST_SCHEMA_VERSION: i64 = 1;

const CREATE_SCHEMA_MIGRATIONS_SQL: &str = r"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at TEXT NOT NULL
);
";

const MIGRATION_001_SQL: &str = r"
CREATE TABLE IF NOT EXISTS versioned_records (
  record_type TEXT NOT NULL,
  record_id TEXT NOT NULL,
  space_id TEXT,
  user_id TEXT,
  version INTEGER NOT NULL CHECK (version >= 1),
  created_at TEXT NOT NULL,
  updated_at TEXT NOT NULL,
  body TEXT NOT NULL,
  PRIMARY KEY (record_type, record_id)
);

CREATE TABLE IF NOT EXISTS facts (
  fact_id TEXT PRIMARY KEY,
  space_id TEXT NOT NULL,
  subject TEXT NOT NULL,
  predicate TEXT NOT NULL,
  fact_type TEXT NOT NULL CHECK (fact_type IN ('identity','preference','knowledge','observation','relationship','event')),
  confidence INTEGER NOT NULL CHECK (confidence BETWEEN 0 AND 100),
  valid_until TEXT,
  version INTEGER NOT NULL CHECK (version >= 1),
  created_at TEXT NOT NULL,
  updated_at TEXT NOT NULL,
  body TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS mutable_entries (
  namespace TEXT NOT NULL,
  key TEXT NOT NULL,
  user_id TEXT,
  access_count INTEGER NOT NULL DEFAULT 0,
  created_at TEXT NOT NULL,
  updated_at TEXT NOT NULL,
  body TEXT NOT NULL,
  PRIMARY KEY (namespace, key)
);

CREATE INDEX IF NOT EXISTS idx_versioned_records_type_space ON versioned_records(record_type, space_id);
CREATE INDEX IF NOT EXISTS idx_facts_space_slot ON facts(space_id, subject, predicate);
CREATE INDEX IF NOT EXISTS idx_facts_space_active ON facts(space_id, valid_until);
CREATE INDEX IF NOT EXISTS idx_mutable_entries_user ON mutable_entries(namespace, user_id);
";

/// Reference [`Backend`] implementation over sqlite. Every read-modify-write
/// runs inside one sqlite transaction, which supplies the atomic
/// single-document primitive the core layers rely on.
pub struct SqliteBackend {
    conn: Mutex<Connection>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SchemaStatus {
    pub current_version: i64,
    pub target_version: i64,
    pub pending_versions: Vec<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExportFileDigest {
    pub path: String,
    pub sha256: String,
    pub records: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExportManifest {
    pub schema_version: i64,
    pub exported_at: String,
    pub files: Vec<ExportFileDigest>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ImportSummary {
    pub imported_records: usize,
    pub skipped_existing_records: usize,
    pub imported_facts: usize,
    pub skipped_existing_facts: usize,
    pub imported_entries: usize,
    pub skipped_existing_entries: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IntegrityReport {
    pub quick_check_ok: bool,
    pub quick_check_message: String,
    pub schema_status: SchemaStatus,
}

const RECORDS_FILE: &str = "records.ndjson";
const FACTS_FILE: &str = "facts.ndjson";
const ENTRIES_FILE: &str = "entries.ndjson";

impl SqliteBackend {
    /// Open a sqlite-backed store and configure required runtime pragmas.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or pragmas cannot
    /// be applied.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn: Mutex::new(conn) })
    }

    /// Open an in-memory store, mostly for tests and throwaway sessions.
    ///
    /// # Errors
    /// Returns an error when the in-memory database cannot be created.
    pub fn open_in_memory() -> Result<Self> {
        Self::open(Path::new(":memory:"))
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, EngramError> {
        self.conn
            .lock()
            .map_err(|_| EngramError::Storage("sqlite connection mutex poisoned".to_string()))
    }

    fn lock_anyhow(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| anyhow!("sqlite connection mutex poisoned"))
    }

    /// Report current and target schema versions plus pending migrations.
    ///
    /// # Errors
    /// Returns an error when schema metadata cannot be read or initialized.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        let conn = self.lock_anyhow()?;
        conn.execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;
        let current_version = current_schema_version(&conn)?;
        let pending_versions = if current_version < LATEST_SCHEMA_VERSION {
            ((current_version + 1)..=LATEST_SCHEMA_VERSION).collect::<Vec<_>>()
        } else {
            Vec::new()
        };

        Ok(SchemaStatus {
            current_version,
            target_version: LATEST_SCHEMA_VERSION,
            pending_versions,
        })
    }

    /// Apply all forward migrations up to the latest supported schema
    /// version.
    ///
    /// # Errors
    /// Returns an error when migration bootstrapping or any step fails.
    pub fn migrate(&self) -> Result<()> {
        let conn = self.lock_anyhow()?;
        conn.execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;

        let mut version = current_schema_version(&conn)?;
        if version < 1 {
            conn.execute_batch(MIGRATION_001_SQL).context("failed to apply migration v1")?;
            record_schema_version(&conn, 1)?;
            version = 1;
        }

        if version != LATEST_SCHEMA_VERSION {
            return Err(anyhow!(
                "unsupported schema version {version}; expected {LATEST_SCHEMA_VERSION}"
            ));
        }

        Ok(())
    }

    /// Export records, facts, and entries as deterministic NDJSON plus a
    /// digest manifest.
    ///
    /// # Errors
    /// Returns an error when export files cannot be created or serialized.
    pub fn export_snapshot(&self, out_dir: &Path) -> Result<ExportManifest> {
        fs::create_dir_all(out_dir)
            .with_context(|| format!("failed to create export directory {}", out_dir.display()))?;

        let records = self.all_records().map_err(|err| anyhow!("{err}"))?;
        let facts = self.all_facts().map_err(|err| anyhow!("{err}"))?;
        let entries = self.all_entries().map_err(|err| anyhow!("{err}"))?;

        let record_digest = write_ndjson_file(&out_dir.join(RECORDS_FILE), &records)?;
        let fact_digest = write_ndjson_file(&out_dir.join(FACTS_FILE), &facts)?;
        let entry_digest = write_ndjson_file(&out_dir.join(ENTRIES_FILE), &entries)?;

        let manifest = ExportManifest {
            schema_version: LATEST_SCHEMA_VERSION,
            exported_at: now_rfc3339()?,
            files: vec![
                ExportFileDigest {
                    path: RECORDS_FILE.to_string(),
                    sha256: record_digest.0,
                    records: record_digest.1,
                },
                ExportFileDigest {
                    path: FACTS_FILE.to_string(),
                    sha256: fact_digest.0,
                    records: fact_digest.1,
                },
                ExportFileDigest {
                    path: ENTRIES_FILE.to_string(),
                    sha256: entry_digest.0,
                    records: entry_digest.1,
                },
            ],
        };

        let manifest_path = out_dir.join("manifest.json");
        let manifest_json =
            serde_json::to_vec_pretty(&manifest).context("failed to serialize export manifest")?;
        fs::write(&manifest_path, manifest_json).with_context(|| {
            format!("failed to write export manifest {}", manifest_path.display())
        })?;

        Ok(manifest)
    }

    /// Import an exported snapshot directory into this database.
    ///
    /// # Errors
    /// Returns an error when the manifest fails validation, a duplicate is
    /// hit without `skip_existing`, or any write fails.
    pub fn import_snapshot(&self, in_dir: &Path, skip_existing: bool) -> Result<ImportSummary> {
        self.migrate()?;
        let manifest = read_export_manifest(&in_dir.join("manifest.json"))?;
        validate_import_manifest(in_dir, &manifest)?;

        let mut summary = ImportSummary::default();

        for record in read_ndjson_file::<VersionedRecord>(&in_dir.join(RECORDS_FILE))? {
            if self.get_record(&record.record_type, &record.record_id)?.is_some() {
                if skip_existing {
                    summary.skipped_existing_records += 1;
                    continue;
                }
                return Err(anyhow!(
                    "record already exists: {}/{}",
                    record.record_type,
                    record.record_id
                ));
            }
            self.modify_record(&record.record_type.clone(), &record.record_id.clone(), &mut |_| {
                Ok(RecordWrite::Put(record.clone()))
            })?;
            summary.imported_records += 1;
        }

        for fact in read_ndjson_file::<Fact>(&in_dir.join(FACTS_FILE))? {
            if self.get_fact(&fact.fact_id)?.is_some() {
                if skip_existing {
                    summary.skipped_existing_facts += 1;
                    continue;
                }
                return Err(anyhow!("fact already exists: {}", fact.fact_id));
            }
            self.modify_fact(&fact.fact_id.clone(), &mut |_| Ok(FactWrite::Put(fact.clone())))?;
            summary.imported_facts += 1;
        }

        for entry in read_ndjson_file::<MutableEntry>(&in_dir.join(ENTRIES_FILE))? {
            if self.get_entry(&entry.namespace, &entry.key)?.is_some() {
                if skip_existing {
                    summary.skipped_existing_entries += 1;
                    continue;
                }
                return Err(anyhow!("entry already exists: {}/{}", entry.namespace, entry.key));
            }
            self.modify_entry(&entry.namespace.clone(), &entry.key.clone(), &mut |_| {
                Ok(EntryWrite::Put(entry.clone()))
            })?;
            summary.imported_entries += 1;
        }

        Ok(summary)
    }

    /// Create a sqlite backup file of the current main database.
    ///
    /// # Errors
    /// Returns an error when directories cannot be created or backup fails.
    pub fn backup_database(&self, out_file: &Path) -> Result<()> {
        if let Some(parent) = out_file.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("failed to create parent directory for backup {}", out_file.display())
            })?;
        }

        let conn = self.lock_anyhow()?;
        conn.backup(DatabaseName::Main, out_file, None)
            .with_context(|| format!("failed to create sqlite backup at {}", out_file.display()))
    }

    /// Restore this database from a sqlite backup file, then migrate.
    ///
    /// # Errors
    /// Returns an error when the file is missing or restore/migration fails.
    pub fn restore_database(&self, in_file: &Path) -> Result<()> {
        if !in_file.exists() {
            return Err(anyhow!("backup file does not exist: {}", in_file.display()));
        }

        {
            let mut conn = self.lock_anyhow()?;
            conn.restore(DatabaseName::Main, in_file, None::<fn(rusqlite::backup::Progress)>)
                .with_context(|| {
                    format!("failed to restore sqlite backup from {}", in_file.display())
                })?;
        }

        self.migrate()
    }

    /// Run quick-check and schema status health probes.
    ///
    /// # Errors
    /// Returns an error when any probe query fails.
    pub fn integrity_check(&self) -> Result<IntegrityReport> {
        let quick_check_message: String = {
            let conn = self.lock_anyhow()?;
            conn.query_row("PRAGMA quick_check", [], |row| row.get::<_, String>(0))
                .context("failed to run PRAGMA quick_check")?
        };

        let schema_status = self.schema_status()?;
        Ok(IntegrityReport {
            quick_check_ok: quick_check_message == "ok",
            quick_check_message,
            schema_status,
        })
    }

    fn all_records(&self) -> Result<Vec<VersionedRecord>, EngramError> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(
                "SELECT body FROM versioned_records ORDER BY record_type ASC, record_id ASC",
            )
            .map_err(sql_err)?;
        collect_bodies(&mut stmt)
    }

    fn all_facts(&self) -> Result<Vec<Fact>, EngramError> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare("SELECT body FROM facts ORDER BY fact_id ASC")
            .map_err(sql_err)?;
        collect_bodies(&mut stmt)
    }

    fn all_entries(&self) -> Result<Vec<MutableEntry>, EngramError> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare("SELECT body FROM mutable_entries ORDER BY namespace ASC, key ASC")
            .map_err(sql_err)?;
        collect_bodies(&mut stmt)
    }
}

impl Backend for SqliteBackend {
    fn get_record(
        &self,
        record_type: &str,
        record_id: &str,
    ) -> Result<Option<VersionedRecord>, EngramError> {
        let conn = self.lock()?;
        read_record(&conn, record_type, record_id)
    }

    fn modify_record(
        &self,
        record_type: &str,
        record_id: &str,
        op: &mut dyn FnMut(Option<VersionedRecord>) -> Result<RecordWrite, EngramError>,
    ) -> Result<Option<VersionedRecord>, EngramError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction().map_err(sql_err)?;

        let current = read_record(&tx, record_type, record_id)?;
        let result = match op(current.clone())? {
            RecordWrite::Put(record) => {
                upsert_record(&tx, &record)?;
                Some(record)
            }
            RecordWrite::Delete => {
                tx.execute(
                    "DELETE FROM versioned_records WHERE record_type = ?1 AND record_id = ?2",
                    params![record_type, record_id],
                )
                .map_err(sql_err)?;
                None
            }
            RecordWrite::Keep => current,
        };

        tx.commit().map_err(sql_err)?;
        Ok(result)
    }

    fn list_records(&self, query: &RecordQuery) -> Result<Vec<VersionedRecord>, EngramError> {
        let rows = {
            let conn = self.lock()?;
            let mut stmt = conn
                .prepare(
                    "SELECT body FROM versioned_records
                     WHERE record_type = ?1 AND (?2 IS NULL OR space_id = ?2)",
                )
                .map_err(sql_err)?;
            let mapped = stmt
                .query_map(params![query.record_type, query.space_id], |row| {
                    row.get::<_, String>(0)
                })
                .map_err(sql_err)?;

            let mut bodies = Vec::new();
            for body in mapped {
                bodies.push(body.map_err(sql_err)?);
            }
            bodies
        };

        let mut records = Vec::new();
        for body in rows {
            records.push(decode_body::<VersionedRecord>(&body)?);
        }

        records.retain(|record| {
            if let Some(user_id) = &query.user_id {
                if record.user_id.as_deref() != Some(user_id.as_str()) {
                    return false;
                }
            }
            if let Some(after) = query.updated_after {
                if record.chain.updated_at <= after {
                    return false;
                }
            }
            if let Some(before) = query.updated_before {
                if record.chain.updated_at >= before {
                    return false;
                }
            }
            true
        });

        sort_records(&mut records, query.sort_by, query.sort_order);
        if let Some(limit) = query.limit {
            records.truncate(limit);
        }
        Ok(records)
    }

    fn get_fact(&self, fact_id: &str) -> Result<Option<Fact>, EngramError> {
        let conn = self.lock()?;
        read_fact(&conn, fact_id)
    }

    fn modify_fact(
        &self,
        fact_id: &str,
        op: &mut dyn FnMut(Option<Fact>) -> Result<FactWrite, EngramError>,
    ) -> Result<Option<Fact>, EngramError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction().map_err(sql_err)?;

        let current = read_fact(&tx, fact_id)?;
        let result = match op(current.clone())? {
            FactWrite::Put(fact) => {
                upsert_fact(&tx, &fact)?;
                Some(fact)
            }
            FactWrite::Delete => {
                tx.execute("DELETE FROM facts WHERE fact_id = ?1", params![fact_id])
                    .map_err(sql_err)?;
                None
            }
            FactWrite::Keep => current,
        };

        tx.commit().map_err(sql_err)?;
        Ok(result)
    }

    fn list_facts(&self, query: &FactQuery) -> Result<Vec<Fact>, EngramError> {
        let bodies = {
            let conn = self.lock()?;
            let mut stmt = conn
                .prepare(
                    "SELECT body FROM facts
                     WHERE space_id = ?1
                       AND (?2 IS NULL OR subject = ?2)
                       AND (?3 IS NULL OR predicate = ?3)",
                )
                .map_err(sql_err)?;
            let mapped = stmt
                .query_map(params![query.space_id, query.subject, query.predicate], |row| {
                    row.get::<_, String>(0)
                })
                .map_err(sql_err)?;

            let mut bodies = Vec::new();
            for body in mapped {
                bodies.push(body.map_err(sql_err)?);
            }
            bodies
        };

        let mut facts = Vec::new();
        for body in bodies {
            facts.push(decode_body::<Fact>(&body)?);
        }

        facts.retain(|fact| query.matches(fact));
        facts.sort_by(|a, b| {
            b.chain
                .updated_at
                .cmp(&a.chain.updated_at)
                .then_with(|| a.fact_id.cmp(&b.fact_id))
        });
        if let Some(limit) = query.limit {
            facts.truncate(limit);
        }
        Ok(facts)
    }

    fn supersede_fact(&self, retired: &Fact, replacement: &Fact) -> Result<(), EngramError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction().map_err(sql_err)?;
        upsert_fact(&tx, retired)?;
        upsert_fact(&tx, replacement)?;
        tx.commit().map_err(sql_err)?;
        Ok(())
    }

    fn get_entry(&self, namespace: &str, key: &str) -> Result<Option<MutableEntry>, EngramError> {
        let conn = self.lock()?;
        read_entry(&conn, namespace, key)
    }

    fn modify_entry(
        &self,
        namespace: &str,
        key: &str,
        op: &mut dyn FnMut(Option<MutableEntry>) -> Result<EntryWrite, EngramError>,
    ) -> Result<Option<MutableEntry>, EngramError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction().map_err(sql_err)?;

        let current = read_entry(&tx, namespace, key)?;
        let result = match op(current.clone())? {
            EntryWrite::Put(entry) => {
                upsert_entry(&tx, &entry)?;
                Some(entry)
            }
            EntryWrite::Delete => {
                tx.execute(
                    "DELETE FROM mutable_entries WHERE namespace = ?1 AND key = ?2",
                    params![namespace, key],
                )
                .map_err(sql_err)?;
                None
            }
            EntryWrite::Keep => current,
        };

        tx.commit().map_err(sql_err)?;
        Ok(result)
    }

    fn list_entries(&self, filter: &EntryFilter) -> Result<Vec<MutableEntry>, EngramError> {
        let bodies = {
            let conn = self.lock()?;
            let mut stmt = conn
                .prepare("SELECT body FROM mutable_entries WHERE namespace = ?1")
                .map_err(sql_err)?;
            let mapped = stmt
                .query_map(params![filter.namespace], |row| row.get::<_, String>(0))
                .map_err(sql_err)?;

            let mut bodies = Vec::new();
            for body in mapped {
                bodies.push(body.map_err(sql_err)?);
            }
            bodies
        };

        let mut entries = Vec::new();
        for body in bodies {
            entries.push(decode_body::<MutableEntry>(&body)?);
        }

        entries.retain(|entry| filter.matches(entry));
        sort_entries(&mut entries, filter.sort_by, filter.sort_order);
        if let Some(limit) = filter.limit {
            entries.truncate(limit);
        }
        Ok(entries)
    }

    fn record_access(&self, namespace: &str, key: &str) {
        // Best-effort metric: a failed bump is dropped, never surfaced.
        let Ok(conn) = self.lock() else {
            return;
        };
        let _ = conn.execute(
            "UPDATE mutable_entries
             SET access_count = access_count + 1,
                 body = json_set(body, '$.access_count', access_count + 1)
             WHERE namespace = ?1 AND key = ?2",
            params![namespace, key],
        );
    }
}

fn sql_err(err: rusqlite::Error) -> EngramError {
    EngramError::Storage(err.to_string())
}

fn decode_body<T: DeserializeOwned>(body: &str) -> Result<T, EngramError> {
    serde_json::from_str(body)
        .map_err(|err| EngramError::Storage(format!("failed to decode stored body: {err}")))
}

fn encode_body<T: Serialize>(value: &T) -> Result<String, EngramError> {
    serde_json::to_string(value)
        .map_err(|err| EngramError::Storage(format!("failed to encode body: {err}")))
}

fn rfc3339(value: OffsetDateTime) -> Result<String, EngramError> {
    value
        .format(&time::format_description::well_known::Rfc3339)
        .map_err(|err| EngramError::Storage(format!("failed to format timestamp: {err}")))
}

fn now_rfc3339() -> Result<String> {
    OffsetDateTime::now_utc()
        .format(&time::format_description::well_known::Rfc3339)
        .context("failed to format RFC3339 timestamp")
}

fn read_record(
    conn: &Connection,
    record_type: &str,
    record_id: &str,
) -> Result<Option<VersionedRecord>, EngramError> {
    let body = conn
        .query_row(
            "SELECT body FROM versioned_records WHERE record_type = ?1 AND record_id = ?2",
            params![record_type, record_id],
            |row| row.get::<_, String>(0),
        )
        .optional()
        .map_err(sql_err)?;

    body.as_deref().map(decode_body).transpose()
}

fn upsert_record(tx: &Transaction<'_>, record: &VersionedRecord) -> Result<(), EngramError> {
    record.chain.validate()?;
    tx.execute(
        "INSERT INTO versioned_records(
            record_type, record_id, space_id, user_id, version, created_at, updated_at, body
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
        ON CONFLICT(record_type, record_id) DO UPDATE SET
            space_id = excluded.space_id,
            user_id = excluded.user_id,
            version = excluded.version,
            created_at = excluded.created_at,
            updated_at = excluded.updated_at,
            body = excluded.body",
        params![
            record.record_type,
            record.record_id,
            record.space_id,
            record.user_id,
            i64::from(record.chain.version),
            rfc3339(record.chain.created_at)?,
            rfc3339(record.chain.updated_at)?,
            encode_body(record)?,
        ],
    )
    .map_err(sql_err)?;
    Ok(())
}

fn read_fact(conn: &Connection, fact_id: &str) -> Result<Option<Fact>, EngramError> {
    let body = conn
        .query_row(
            "SELECT body FROM facts WHERE fact_id = ?1",
            params![fact_id],
            |row| row.get::<_, String>(0),
        )
        .optional()
        .map_err(sql_err)?;

    body.as_deref().map(decode_body).transpose()
}

fn upsert_fact(tx: &Transaction<'_>, fact: &Fact) -> Result<(), EngramError> {
    fact.chain.validate()?;
    let valid_until = fact.valid_until.map(rfc3339).transpose()?;
    tx.execute(
        "INSERT INTO facts(
            fact_id, space_id, subject, predicate, fact_type, confidence,
            valid_until, version, created_at, updated_at, body
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
        ON CONFLICT(fact_id) DO UPDATE SET
            space_id = excluded.space_id,
            subject = excluded.subject,
            predicate = excluded.predicate,
            fact_type = excluded.fact_type,
            confidence = excluded.confidence,
            valid_until = excluded.valid_until,
            version = excluded.version,
            created_at = excluded.created_at,
            updated_at = excluded.updated_at,
            body = excluded.body",
        params![
            fact.fact_id,
            fact.space_id,
            fact.data().subject,
            fact.data().predicate,
            fact.data().fact_type.as_str(),
            i64::from(fact.data().confidence),
            valid_until,
            i64::from(fact.chain.version),
            rfc3339(fact.chain.created_at)?,
            rfc3339(fact.chain.updated_at)?,
            encode_body(fact)?,
        ],
    )
    .map_err(sql_err)?;
    Ok(())
}

fn read_entry(
    conn: &Connection,
    namespace: &str,
    key: &str,
) -> Result<Option<MutableEntry>, EngramError> {
    let body = conn
        .query_row(
            "SELECT body FROM mutable_entries WHERE namespace = ?1 AND key = ?2",
            params![namespace, key],
            |row| row.get::<_, String>(0),
        )
        .optional()
        .map_err(sql_err)?;

    body.as_deref().map(decode_body).transpose()
}

fn upsert_entry(tx: &Transaction<'_>, entry: &MutableEntry) -> Result<(), EngramError> {
    tx.execute(
        "INSERT INTO mutable_entries(
            namespace, key, user_id, access_count, created_at, updated_at, body
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
        ON CONFLICT(namespace, key) DO UPDATE SET
            user_id = excluded.user_id,
            access_count = excluded.access_count,
            created_at = excluded.created_at,
            updated_at = excluded.updated_at,
            body = excluded.body",
        params![
            entry.namespace,
            entry.key,
            entry.user_id,
            i64::try_from(entry.access_count).unwrap_or(i64::MAX),
            rfc3339(entry.created_at)?,
            rfc3339(entry.updated_at)?,
            encode_body(entry)?,
        ],
    )
    .map_err(sql_err)?;
    Ok(())
}

fn collect_bodies<T: DeserializeOwned>(
    stmt: &mut rusqlite::Statement<'_>,
) -> Result<Vec<T>, EngramError> {
    let mapped = stmt.query_map([], |row| row.get::<_, String>(0)).map_err(sql_err)?;
    let mut values = Vec::new();
    for body in mapped {
        values.push(decode_body(&body.map_err(sql_err)?)?);
    }
    Ok(values)
}

fn sort_records(records: &mut [VersionedRecord], sort_by: RecordSort, order: SortOrder) {
    records.sort_by(|a, b| {
        let ordering = match sort_by {
            RecordSort::CreatedAt => a.chain.created_at.cmp(&b.chain.created_at),
            RecordSort::UpdatedAt => a.chain.updated_at.cmp(&b.chain.updated_at),
            RecordSort::RecordId => a.record_id.cmp(&b.record_id),
        };
        let ordering = match order {
            SortOrder::Asc => ordering,
            SortOrder::Desc => ordering.reverse(),
        };
        ordering.then_with(|| a.record_id.cmp(&b.record_id))
    });
}

fn sort_entries(entries: &mut [MutableEntry], sort_by: EntrySort, order: SortOrder) {
    entries.sort_by(|a, b| {
        let ordering = match sort_by {
            EntrySort::Key => a.key.cmp(&b.key),
            EntrySort::CreatedAt => a.created_at.cmp(&b.created_at),
            EntrySort::UpdatedAt => a.updated_at.cmp(&b.updated_at),
        };
        let ordering = match order {
            SortOrder::Asc => ordering,
            SortOrder::Desc => ordering.reverse(),
        };
        ordering.then_with(|| a.key.cmp(&b.key))
    });
}

fn current_schema_version(conn: &Connection) -> Result<i64> {
    conn.query_row("SELECT COALESCE(MAX(version), 0) FROM schema_migrations", [], |row| {
        row.get::<_, i64>(0)
    })
    .context("failed to read current schema version")
}

fn record_schema_version(conn: &Connection, version: i64) -> Result<()> {
    let now = now_rfc3339()?;
    conn.execute(
        "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
        params![version, now],
    )
    .with_context(|| format!("failed to record migration version {version}"))?;
    Ok(())
}

fn write_ndjson_file<T: Serialize>(path: &Path, values: &[T]) -> Result<(String, usize)> {
    let file = File::create(path)
        .with_context(|| format!("failed to create export file {}", path.display()))?;
    let mut writer = BufWriter::new(file);
    let mut hasher = Sha256::new();

    for value in values {
        let line = serde_json::to_string(value).context("failed to serialize NDJSON row")?;
        writer
            .write_all(line.as_bytes())
            .with_context(|| format!("failed to write export file {}", path.display()))?;
        writer
            .write_all(b"\n")
            .with_context(|| format!("failed to write export file {}", path.display()))?;
        hasher.update(line.as_bytes());
        hasher.update(b"\n");
    }

    writer.flush().with_context(|| format!("failed to flush export file {}", path.display()))?;
    Ok((format!("{:x}", hasher.finalize()), values.len()))
}

fn read_ndjson_file<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>> {
    let file = File::open(path)
        .with_context(|| format!("failed to open NDJSON file {}", path.display()))?;
    let reader = BufReader::new(file);
    let mut values = Vec::new();

    for (index, line) in reader.lines().enumerate() {
        let line = line.with_context(|| {
            format!("failed to read line {} from {}", index + 1, path.display())
        })?;
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        let value = serde_json::from_str(trimmed).with_context(|| {
            format!("failed to parse NDJSON row {} from {}", index + 1, path.display())
        })?;
        values.push(value);
    }

    Ok(values)
}

fn read_export_manifest(path: &Path) -> Result<ExportManifest> {
    let bytes = fs::read(path)
        .with_context(|| format!("failed to read manifest file {}", path.display()))?;
    serde_json::from_slice(&bytes)
        .with_context(|| format!("failed to parse manifest JSON {}", path.display()))
}

fn ndjson_digest_and_records(path: &Path) -> Result<(String, usize)> {
    let file = File::open(path)
        .with_context(|| format!("failed to open NDJSON file {}", path.display()))?;
    let reader = BufReader::new(file);
    let mut hasher = Sha256::new();
    let mut records = 0_usize;

    for (index, line) in reader.lines().enumerate() {
        let line = line.with_context(|| {
            format!("failed to read line {} from {}", index + 1, path.display())
        })?;
        hasher.update(line.as_bytes());
        hasher.update(b"\n");
        if !line.trim().is_empty() {
            records += 1;
        }
    }

    Ok((format!("{:x}", hasher.finalize()), records))
}

fn validate_import_manifest(in_dir: &Path, manifest: &ExportManifest) -> Result<()> {
    if manifest.schema_version <= 0 || manifest.schema_version > LATEST_SCHEMA_VERSION {
        return Err(anyhow!(
            "unsupported export schema version {}; supported range is 1..={}",
            manifest.schema_version,
            LATEST_SCHEMA_VERSION
        ));
    }

    let mut by_path: BTreeMap<&str, &ExportFileDigest> = BTreeMap::new();
    for file in &manifest.files {
        if by_path.insert(file.path.as_str(), file).is_some() {
            return Err(anyhow!("manifest contains duplicate file entry: {}", file.path));
        }
    }

    for required in [RECORDS_FILE, FACTS_FILE, ENTRIES_FILE] {
        let Some(expected) = by_path.get(required) else {
            return Err(anyhow!("manifest is missing required file entry: {required}"));
        };
        let file_path = in_dir.join(required);
        if !file_path.exists() {
            return Err(anyhow!("manifest references missing file {}", file_path.display()));
        }

        let (actual_sha256, actual_records) = ndjson_digest_and_records(&file_path)?;
        if actual_sha256 != expected.sha256 {
            return Err(anyhow!(
                "manifest digest mismatch for {required}: expected {}, got {}",
                expected.sha256,
                actual_sha256
            ));
        }
        if actual_records != expected.records {
            return Err(anyhow!(
                "manifest record count mismatch for {required}: expected {}, got {}",
                expected.records,
                actual_records
            ));
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use engram_core::{FactData, FactType};
    use serde_json::{json, Value};
    use time::Duration;

    use super::*;

    fn fixture_time() -> OffsetDateTime {
        OffsetDateTime::UNIX_EPOCH + Duration::seconds(1_700_000_000)
    }

    fn open_migrated() -> Result<SqliteBackend> {
        let backend = SqliteBackend::open_in_memory()?;
        backend.migrate()?;
        Ok(backend)
    }

    fn unique_temp_dir(label: &str) -> PathBuf {
        std::env::temp_dir().join(format!("engram-{label}-{}", ulid::Ulid::new()))
    }

    fn mk_fact(space: &str, subject: &str, object: Value, confidence: u8) -> Fact {
        Fact::new(
            space,
            FactData {
                subject: subject.to_string(),
                predicate: "likes".to_string(),
                object,
                fact_type: FactType::Preference,
                confidence,
                tags: vec![],
                source_type: None,
            },
            fixture_time(),
        )
    }

    // Test IDs: TSQ-001
    #[test]
    fn record_roundtrip_preserves_chain_and_metadata() -> Result<()> {
        let backend = open_migrated()?;

        let mut record =
            VersionedRecord::new("note", "note-1", json!({"body": "first"}), fixture_time());
        record.space_id = Some("sp".to_string());
        record.metadata.insert("origin".to_string(), json!("import"));
        record.chain.append(json!({"body": "second"}), fixture_time() + Duration::seconds(5));

        backend.modify_record("note", "note-1", &mut |_| Ok(RecordWrite::Put(record.clone())))?;

        let loaded = backend
            .get_record("note", "note-1")?
            .ok_or_else(|| anyhow!("record should exist"))?;
        assert_eq!(loaded, record);
        assert_eq!(loaded.chain.version, 2);
        assert_eq!(loaded.chain.previous_versions.len(), 1);
        Ok(())
    }

    // Test IDs: TSQ-002
    #[test]
    fn modify_record_delete_removes_the_document() -> Result<()> {
        let backend = open_migrated()?;
        let record = VersionedRecord::new("note", "note-1", json!("x"), fixture_time());
        backend.modify_record("note", "note-1", &mut |_| Ok(RecordWrite::Put(record.clone())))?;

        let after = backend.modify_record("note", "note-1", &mut |current| {
            assert!(current.is_some());
            Ok(RecordWrite::Delete)
        })?;
        assert!(after.is_none());
        assert!(backend.get_record("note", "note-1")?.is_none());
        Ok(())
    }

    // Test IDs: TSQ-003
    #[test]
    fn list_records_filters_by_space_and_sorts_deterministically() -> Result<()> {
        let backend = open_migrated()?;

        for (id, space, offset) in [("a", "sp1", 0), ("b", "sp1", 10), ("c", "sp2", 20)] {
            let mut record = VersionedRecord::new(
                "note",
                id,
                json!({"id": id}),
                fixture_time() + Duration::seconds(offset),
            );
            record.space_id = Some(space.to_string());
            backend.modify_record("note", id, &mut |_| Ok(RecordWrite::Put(record.clone())))?;
        }

        let listed = backend.list_records(&RecordQuery::in_space("note", "sp1"))?;
        assert_eq!(
            listed.iter().map(|r| r.record_id.as_str()).collect::<Vec<_>>(),
            vec!["b", "a"]
        );

        let ascending = backend.list_records(&RecordQuery {
            sort_order: SortOrder::Asc,
            ..RecordQuery::in_space("note", "sp1")
        })?;
        assert_eq!(
            ascending.iter().map(|r| r.record_id.as_str()).collect::<Vec<_>>(),
            vec!["a", "b"]
        );
        Ok(())
    }

    // Test IDs: TSQ-004
    #[test]
    fn supersede_fact_persists_both_documents_together() -> Result<()> {
        let backend = open_migrated()?;

        let mut retired = mk_fact("sp", "user", json!("coffee"), 70);
        backend.modify_fact(&retired.fact_id.clone(), &mut |_| {
            Ok(FactWrite::Put(retired.clone()))
        })?;

        let mut replacement = mk_fact("sp", "user", json!("tea"), 80);
        replacement.supersedes = Some(retired.fact_id.clone());
        retired.valid_until = Some(fixture_time() + Duration::seconds(60));
        retired.superseded_by = Some(replacement.fact_id.clone());

        backend.supersede_fact(&retired, &replacement)?;

        let active = backend.list_facts(&FactQuery::in_space("sp"))?;
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].fact_id, replacement.fact_id);

        let everything =
            backend.list_facts(&FactQuery { include_inactive: true, ..FactQuery::in_space("sp") })?;
        assert_eq!(everything.len(), 2);

        let stored_retired = backend
            .get_fact(&retired.fact_id)?
            .ok_or_else(|| anyhow!("retired fact should remain readable"))?;
        assert_eq!(stored_retired.superseded_by, Some(replacement.fact_id.clone()));
        Ok(())
    }

    // Test IDs: TSQ-005
    #[test]
    fn record_access_bumps_counter_in_row_and_body() -> Result<()> {
        let backend = open_migrated()?;
        let entry = MutableEntry::new("cache", "hits", json!(0), fixture_time());
        backend.modify_entry("cache", "hits", &mut |_| Ok(EntryWrite::Put(entry.clone())))?;

        backend.record_access("cache", "hits");
        backend.record_access("cache", "hits");
        // Unknown keys are ignored, never an error.
        backend.record_access("cache", "missing");

        let loaded = backend
            .get_entry("cache", "hits")?
            .ok_or_else(|| anyhow!("entry should exist"))?;
        assert_eq!(loaded.access_count, 2);
        Ok(())
    }

    // Test IDs: TSQ-006
    #[test]
    fn list_entries_applies_prefix_window_and_limit() -> Result<()> {
        let backend = open_migrated()?;

        for (key, offset) in [("user:alice", 0), ("user:bob", 10), ("config:x", 20)] {
            let entry = MutableEntry::new(
                "app",
                key,
                json!(key),
                fixture_time() + Duration::seconds(offset),
            );
            backend.modify_entry("app", key, &mut |_| Ok(EntryWrite::Put(entry.clone())))?;
        }

        let filter = EntryFilter {
            key_prefix: Some("user:".to_string()),
            sort_by: EntrySort::Key,
            sort_order: SortOrder::Asc,
            ..EntryFilter::in_namespace("app")
        };
        let listed = backend.list_entries(&filter)?;
        assert_eq!(
            listed.iter().map(|e| e.key.as_str()).collect::<Vec<_>>(),
            vec!["user:alice", "user:bob"]
        );

        let limited = backend.list_entries(&EntryFilter { limit: Some(1), ..filter })?;
        assert_eq!(limited.len(), 1);

        let impossible = backend.list_entries(&EntryFilter {
            updated_after: Some(fixture_time() + Duration::seconds(100)),
            updated_before: Some(fixture_time()),
            ..EntryFilter::in_namespace("app")
        })?;
        assert!(impossible.is_empty());
        Ok(())
    }

    // Test IDs: TSQ-007
    #[test]
    fn export_import_snapshot_round_trip() -> Result<()> {
        let source = open_migrated()?;

        let record = VersionedRecord::new("note", "note-1", json!("payload"), fixture_time());
        source.modify_record("note", "note-1", &mut |_| Ok(RecordWrite::Put(record.clone())))?;
        let fact = mk_fact("sp", "user", json!("tea"), 60);
        source.modify_fact(&fact.fact_id.clone(), &mut |_| Ok(FactWrite::Put(fact.clone())))?;
        let entry = MutableEntry::new("app", "k", json!(1), fixture_time());
        source.modify_entry("app", "k", &mut |_| Ok(EntryWrite::Put(entry.clone())))?;

        let out_dir = unique_temp_dir("export");
        let manifest = source.export_snapshot(&out_dir)?;
        assert_eq!(manifest.files.len(), 3);

        let target = open_migrated()?;
        let summary = target.import_snapshot(&out_dir, true)?;
        assert_eq!(summary.imported_records, 1);
        assert_eq!(summary.imported_facts, 1);
        assert_eq!(summary.imported_entries, 1);

        assert_eq!(target.get_record("note", "note-1")?, Some(record));
        assert_eq!(target.get_fact(&fact.fact_id)?, Some(fact));
        assert_eq!(target.get_entry("app", "k")?, Some(entry));

        // Re-import skips everything already present.
        let again = target.import_snapshot(&out_dir, true)?;
        assert_eq!(again.imported_records, 0);
        assert_eq!(again.skipped_existing_records, 1);

        fs::remove_dir_all(&out_dir)?;
        Ok(())
    }

    // Test IDs: TSQ-008
    #[test]
    fn import_rejects_tampered_snapshot() -> Result<()> {
        let source = open_migrated()?;
        let entry = MutableEntry::new("app", "k", json!(1), fixture_time());
        source.modify_entry("app", "k", &mut |_| Ok(EntryWrite::Put(entry.clone())))?;

        let out_dir = unique_temp_dir("tamper");
        source.export_snapshot(&out_dir)?;

        let entries_path = out_dir.join(ENTRIES_FILE);
        let mut body = fs::read_to_string(&entries_path)?;
        body.push_str("{\"forged\":true}\n");
        fs::write(&entries_path, body)?;

        let target = open_migrated()?;
        let err = match target.import_snapshot(&out_dir, true) {
            Ok(_) => panic!("tampered snapshot should be rejected"),
            Err(err) => err,
        };
        assert!(err.to_string().contains("digest mismatch"));

        fs::remove_dir_all(&out_dir)?;
        Ok(())
    }

    // Test IDs: TSQ-009
    #[test]
    fn integrity_check_reports_clean_database() -> Result<()> {
        let backend = open_migrated()?;
        let report = backend.integrity_check()?;
        assert!(report.quick_check_ok);
        assert_eq!(report.schema_status.current_version, LATEST_SCHEMA_VERSION);
        assert!(report.schema_status.pending_versions.is_empty());
        Ok(())
    }
}
