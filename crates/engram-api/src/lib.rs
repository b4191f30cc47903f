use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::sync::Arc;

use engram_core::{
    apply_numeric_delta, check_transition, decide_dedup, decide_revision, new_prefixed_id,
    validate_key, validate_limit, validate_namespace, validate_record_id, validate_record_type,
    validate_space_id, validate_value_size, Backend, EngramError, EntityKind, EntryFilter,
    EntryWrite, Fact, FactCandidate, FactData, FactQuery, FactWrite, KvOperation, MutableEntry,
    RecordQuery, RecordWrite, RevisionAction, RevisionOutcome, VersionEntry, VersionedRecord,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use time::OffsetDateTime;
use tracing::warn;

pub const CONVERSATION_TYPE: &str = "conversation";
pub const MESSAGE_TYPE: &str = "message";
pub const MEMORY_TYPE: &str = "memory";

/// How `MutableKeyStore::transaction` treats a failing operation.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TransactionMode {
    /// Source-compatible behavior: operations run in order and the first
    /// failure rejects the call, leaving earlier operations applied.
    Sequential,
    /// Validate every operation against a projected snapshot before applying
    /// any; a doomed batch rejects with zero writes applied.
    #[default]
    PreValidated,
}

/// Two-gate activation for the optional graph synchronization path. Both the
/// explicit opt-in and the credentials must be present; anything less is a
/// silent no-op apart from one warning on the half-configured case.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GraphSyncConfig {
    pub endpoint: Option<String>,
    pub opt_in: bool,
}

impl GraphSyncConfig {
    #[must_use]
    pub fn disabled() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn is_active(&self) -> bool {
        self.opt_in && self.endpoint.is_some()
    }
}

/// Library configuration, resolved once at construction and passed by value.
/// The library itself never reads ambient environment.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EngramConfig {
    pub transaction_mode: TransactionMode,
    pub graph_sync: GraphSyncConfig,
}

/// Caller-supplied fact extraction. Absence skips the fact layer entirely.
pub trait FactExtractor: Send + Sync {
    /// # Errors
    /// Implementations may fail; the error is propagated to the caller.
    fn extract_facts(
        &self,
        user_text: &str,
        agent_text: &str,
    ) -> Result<Vec<FactCandidate>, EngramError>;
}

/// Caller-supplied embedding generation. Absence stores memories without
/// vectors and search falls back to lexical overlap.
pub trait EmbeddingProvider: Send + Sync {
    /// # Errors
    /// Implementations may fail; the error is propagated to the caller.
    fn embed(&self, text: &str) -> Result<Vec<f32>, EngramError>;
}

/// Optional content-reduction hook for remembered exchanges.
pub trait ContentSummarizer: Send + Sync {
    /// # Errors
    /// Implementations may fail; the error is propagated to the caller.
    fn summarize(&self, user_text: &str, agent_text: &str)
        -> Result<Option<String>, EngramError>;
}

/// Secondary synchronization target for fact writes. Failures are logged and
/// swallowed; sync is best-effort by contract.
pub trait GraphSink: Send + Sync {
    /// # Errors
    /// Implementations may fail; the error is logged, never propagated.
    fn sync_fact(&self, space_id: &str, fact: &Fact) -> Result<(), EngramError>;
}

/// Injected collaborators for the orchestration layer. All optional.
#[derive(Clone, Default)]
pub struct Hooks {
    pub fact_extractor: Option<Arc<dyn FactExtractor>>,
    pub embedding_provider: Option<Arc<dyn EmbeddingProvider>>,
    pub content_summarizer: Option<Arc<dyn ContentSummarizer>>,
    pub graph_sink: Option<Arc<dyn GraphSink>>,
}

/// Entry point tying one backend and one configuration to the per-layer
/// stores. Stateless facade: cloning is cheap and every clone sees the same
/// data.
#[derive(Clone)]
pub struct Engram {
    backend: Arc<dyn Backend>,
    config: EngramConfig,
}

impl Engram {
    #[must_use]
    pub fn new(backend: Arc<dyn Backend>, config: EngramConfig) -> Self {
        Self { backend, config }
    }

    #[must_use]
    pub fn records(&self) -> VersionStore {
        VersionStore { backend: Arc::clone(&self.backend) }
    }

    #[must_use]
    pub fn kv(&self) -> MutableKeyStore {
        MutableKeyStore {
            backend: Arc::clone(&self.backend),
            mode: self.config.transaction_mode,
        }
    }

    #[must_use]
    pub fn facts(&self) -> FactStore {
        FactStore { backend: Arc::clone(&self.backend) }
    }

    #[must_use]
    pub fn conversations(&self) -> ConversationLog {
        ConversationLog { backend: Arc::clone(&self.backend) }
    }

    #[must_use]
    pub fn spaces(&self) -> SpaceStore {
        SpaceStore { backend: Arc::clone(&self.backend) }
    }

    #[must_use]
    pub fn contexts(&self) -> ContextStore {
        ContextStore { backend: Arc::clone(&self.backend) }
    }

    #[must_use]
    pub fn agents(&self) -> AgentStore {
        AgentStore { backend: Arc::clone(&self.backend) }
    }

    #[must_use]
    pub fn stats(&self) -> StatisticsAggregator {
        StatisticsAggregator { backend: Arc::clone(&self.backend) }
    }

    /// Build the orchestration layer with the given hooks.
    #[must_use]
    pub fn memory(&self, hooks: Hooks) -> MemoryLayer {
        MemoryLayer::new(Arc::clone(&self.backend), &self.config, hooks)
    }
}

/// Optional grouping attributes for a versioned store call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StoreOptions {
    pub space_id: Option<String>,
    pub user_id: Option<String>,
    pub metadata: Option<BTreeMap<String, Value>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PurgeVersionsReport {
    pub versions_purged: usize,
    pub versions_remaining: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PurgeReport {
    pub deleted: bool,
    pub versions_deleted: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PurgeManyReport {
    pub deleted: usize,
    pub record_ids: Vec<String>,
}

/// Append-only versioned record operations.
#[derive(Clone)]
pub struct VersionStore {
    backend: Arc<dyn Backend>,
}

impl VersionStore {
    #[must_use]
    pub fn new(backend: Arc<dyn Backend>) -> Self {
        Self { backend }
    }

    /// Store a payload: version 1 on first call, an appended version after.
    /// Metadata overrides merge over retained metadata.
    ///
    /// # Errors
    /// Returns [`EngramError::Validation`] for malformed input and storage
    /// errors otherwise.
    pub fn store(
        &self,
        record_type: &str,
        record_id: &str,
        data: Value,
        options: StoreOptions,
    ) -> Result<VersionedRecord, EngramError> {
        validate_record_type(record_type)?;
        validate_record_id(record_id)?;
        validate_value_size(&data)?;
        if let Some(space_id) = &options.space_id {
            validate_space_id(space_id)?;
        }

        let now = OffsetDateTime::now_utc();
        let stored = self.backend.modify_record(record_type, record_id, &mut |current| {
            let record = match current {
                None => {
                    let mut record =
                        VersionedRecord::new(record_type, record_id, data.clone(), now);
                    record.space_id = options.space_id.clone();
                    record.user_id = options.user_id.clone();
                    if let Some(metadata) = options.metadata.clone() {
                        record.apply_metadata_override(metadata);
                    }
                    record
                }
                Some(mut record) => {
                    record.chain.append(data.clone(), now);
                    if let Some(space_id) = options.space_id.clone() {
                        record.space_id = Some(space_id);
                    }
                    if let Some(user_id) = options.user_id.clone() {
                        record.user_id = Some(user_id);
                    }
                    if let Some(metadata) = options.metadata.clone() {
                        record.apply_metadata_override(metadata);
                    }
                    record
                }
            };
            Ok(RecordWrite::Put(record))
        })?;

        stored.ok_or_else(|| EngramError::Storage("store produced no record".to_string()))
    }

    /// # Errors
    /// Returns storage errors; absence is `Ok(None)`.
    pub fn get(
        &self,
        record_type: &str,
        record_id: &str,
    ) -> Result<Option<VersionedRecord>, EngramError> {
        self.backend.get_record(record_type, record_id)
    }

    /// Fetch one version snapshot; absent when the id or the version is
    /// unknown (including pruned versions).
    ///
    /// # Errors
    /// Returns storage errors only.
    pub fn get_version(
        &self,
        record_type: &str,
        record_id: &str,
        version: u32,
    ) -> Result<Option<VersionEntry<Value>>, EngramError> {
        Ok(self
            .backend
            .get_record(record_type, record_id)?
            .and_then(|record| record.chain.get_version(version)))
    }

    /// Fetch the version that was current at `at`; absent before the record
    /// existed.
    ///
    /// # Errors
    /// Returns storage errors only.
    pub fn get_at_timestamp(
        &self,
        record_type: &str,
        record_id: &str,
        at: OffsetDateTime,
    ) -> Result<Option<VersionEntry<Value>>, EngramError> {
        Ok(self
            .backend
            .get_record(record_type, record_id)?
            .and_then(|record| record.chain.at_timestamp(at)))
    }

    /// Full retained history, oldest first. Unknown ids yield an empty
    /// sequence, not an error.
    ///
    /// # Errors
    /// Returns storage errors only.
    pub fn get_history(
        &self,
        record_type: &str,
        record_id: &str,
    ) -> Result<Vec<VersionEntry<Value>>, EngramError> {
        Ok(self
            .backend
            .get_record(record_type, record_id)?
            .map(|record| record.chain.history())
            .unwrap_or_default())
    }

    /// # Errors
    /// Returns [`EngramError::Validation`] for bad filters, storage errors
    /// otherwise.
    pub fn list(&self, query: &RecordQuery) -> Result<Vec<VersionedRecord>, EngramError> {
        validate_record_type(&query.record_type)?;
        validate_limit(query.limit)?;
        self.backend.list_records(query)
    }

    /// Count distinct records under the same filter `list` would use. Always
    /// equals the unpaginated list length.
    ///
    /// # Errors
    /// Returns [`EngramError::Validation`] for bad filters, storage errors
    /// otherwise.
    pub fn count(&self, query: &RecordQuery) -> Result<usize, EngramError> {
        let unpaginated = RecordQuery { limit: None, ..query.clone() };
        Ok(self.list(&unpaginated)?.len())
    }

    /// Case-insensitive substring search over current payloads.
    ///
    /// # Errors
    /// Returns [`EngramError::Validation`] for bad filters, storage errors
    /// otherwise.
    pub fn search(
        &self,
        record_type: &str,
        space_id: Option<&str>,
        text: &str,
    ) -> Result<Vec<VersionedRecord>, EngramError> {
        let query = RecordQuery {
            record_type: record_type.to_string(),
            space_id: space_id.map(ToString::to_string),
            ..RecordQuery::default()
        };
        let needle = text.to_ascii_lowercase();
        let mut records = self.list(&query)?;
        records.retain(|record| {
            serde_json::to_string(&record.chain.data)
                .map(|body| body.to_ascii_lowercase().contains(&needle))
                .unwrap_or(false)
        });
        Ok(records)
    }

    /// Drop the oldest history entries beyond `keep_latest`. The current
    /// version always survives.
    ///
    /// # Errors
    /// Returns [`EngramError::RecordNotFound`] for unknown ids.
    pub fn purge_versions(
        &self,
        record_type: &str,
        record_id: &str,
        keep_latest: usize,
    ) -> Result<PurgeVersionsReport, EngramError> {
        let mut versions_purged = 0;
        let mut versions_remaining = 0;
        self.backend.modify_record(record_type, record_id, &mut |current| {
            let Some(mut record) = current else {
                return Err(EngramError::record_not_found(record_type, record_id));
            };
            versions_purged = record.chain.prune(keep_latest);
            versions_remaining = record.chain.retained_versions();
            if versions_purged == 0 {
                return Ok(RecordWrite::Keep);
            }
            Ok(RecordWrite::Put(record))
        })?;
        Ok(PurgeVersionsReport { versions_purged, versions_remaining })
    }

    /// Delete the whole chain atomically, reporting how many versions went
    /// with it.
    ///
    /// # Errors
    /// Returns [`EngramError::RecordNotFound`] for unknown ids.
    pub fn purge(&self, record_type: &str, record_id: &str) -> Result<PurgeReport, EngramError> {
        let mut versions_deleted = 0;
        self.backend.modify_record(record_type, record_id, &mut |current| {
            let Some(record) = current else {
                return Err(EngramError::record_not_found(record_type, record_id));
            };
            versions_deleted = record.chain.retained_versions();
            Ok(RecordWrite::Delete)
        })?;
        Ok(PurgeReport { deleted: true, versions_deleted })
    }

    /// Bulk purge every record the filter matches.
    ///
    /// # Errors
    /// Returns [`EngramError::Validation`] for bad filters, storage errors
    /// otherwise.
    pub fn purge_many(&self, query: &RecordQuery) -> Result<PurgeManyReport, EngramError> {
        let unpaginated = RecordQuery { limit: None, ..query.clone() };
        let records = self.list(&unpaginated)?;
        let mut record_ids = Vec::with_capacity(records.len());
        for record in records {
            self.purge(&record.record_type, &record.record_id)?;
            record_ids.push(record.record_id);
        }
        Ok(PurgeManyReport { deleted: record_ids.len(), record_ids })
    }
}

/// Optional attributes for a mutable `set`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SetOptions {
    pub user_id: Option<String>,
    pub metadata: Option<BTreeMap<String, Value>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeleteReport {
    pub deleted: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PurgeKeysReport {
    pub deleted: usize,
    pub keys: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TransactionReport {
    pub success: bool,
    pub operations_executed: usize,
    pub results: Vec<Value>,
}

/// Single-current-value store per `(namespace, key)`.
#[derive(Clone)]
pub struct MutableKeyStore {
    backend: Arc<dyn Backend>,
    mode: TransactionMode,
}

impl MutableKeyStore {
    #[must_use]
    pub fn new(backend: Arc<dyn Backend>, mode: TransactionMode) -> Self {
        Self { backend, mode }
    }

    /// Create or fully overwrite an entry. No history is kept; `created_at`
    /// and the access counter survive overwrites.
    ///
    /// # Errors
    /// Returns [`EngramError::Validation`] for malformed keys or oversized
    /// values.
    pub fn set(
        &self,
        namespace: &str,
        key: &str,
        value: Value,
        options: SetOptions,
    ) -> Result<MutableEntry, EngramError> {
        validate_namespace(namespace)?;
        validate_key(key)?;
        validate_value_size(&value)?;

        let now = OffsetDateTime::now_utc();
        let stored = self.backend.modify_entry(namespace, key, &mut |current| {
            let entry = match current {
                None => {
                    let mut entry = MutableEntry::new(namespace, key, value.clone(), now);
                    entry.user_id = options.user_id.clone();
                    entry.metadata = options.metadata.clone().unwrap_or_default();
                    entry
                }
                Some(mut entry) => {
                    entry.value = value.clone();
                    entry.user_id = options.user_id.clone();
                    entry.metadata = options.metadata.clone().unwrap_or_default();
                    entry.updated_at = now;
                    entry
                }
            };
            Ok(EntryWrite::Put(entry))
        })?;

        stored.ok_or_else(|| EngramError::Storage("set produced no entry".to_string()))
    }

    /// Current value, or JSON `null` when the key is absent. A present key
    /// holding `null` is indistinguishable here; use [`Self::get_record`] or
    /// [`Self::exists`] when the difference matters.
    ///
    /// # Errors
    /// Returns storage errors only.
    pub fn get(&self, namespace: &str, key: &str) -> Result<Value, EngramError> {
        match self.backend.get_entry(namespace, key)? {
            Some(entry) => {
                self.backend.record_access(namespace, key);
                Ok(entry.value)
            }
            None => Ok(Value::Null),
        }
    }

    /// The unambiguous read: the full entry when the key exists.
    ///
    /// # Errors
    /// Returns storage errors only.
    pub fn get_record(
        &self,
        namespace: &str,
        key: &str,
    ) -> Result<Option<MutableEntry>, EngramError> {
        self.backend.get_entry(namespace, key)
    }

    /// Transform an existing value in place. The updater only ever sees
    /// present values; an absent key is always an error.
    ///
    /// # Errors
    /// Returns [`EngramError::KeyNotFound`] for absent keys.
    pub fn update<F>(&self, namespace: &str, key: &str, f: F) -> Result<MutableEntry, EngramError>
    where
        F: FnOnce(&Value) -> Value,
    {
        let mut updater = Some(f);
        let stored = self.backend.modify_entry(namespace, key, &mut |current| {
            let Some(mut entry) = current else {
                return Err(EngramError::key_not_found(namespace, key));
            };
            let Some(f) = updater.take() else {
                return Err(EngramError::Storage("updater invoked twice".to_string()));
            };
            let next = f(&entry.value);
            validate_value_size(&next)?;
            entry.value = next;
            entry.updated_at = OffsetDateTime::now_utc();
            Ok(EntryWrite::Put(entry))
        })?;

        stored.ok_or_else(|| EngramError::Storage("update produced no entry".to_string()))
    }

    /// Add `amount` to a numeric value; a present `null` counts as zero and
    /// results may go negative.
    ///
    /// # Errors
    /// Returns [`EngramError::KeyNotFound`] for absent keys and
    /// [`EngramError::Validation`] for non-numeric values.
    pub fn increment(
        &self,
        namespace: &str,
        key: &str,
        amount: i64,
    ) -> Result<MutableEntry, EngramError> {
        let stored = self.backend.modify_entry(namespace, key, &mut |current| {
            let Some(mut entry) = current else {
                return Err(EngramError::key_not_found(namespace, key));
            };
            entry.value = apply_numeric_delta(&entry.value, amount)?;
            entry.updated_at = OffsetDateTime::now_utc();
            Ok(EntryWrite::Put(entry))
        })?;

        stored.ok_or_else(|| EngramError::Storage("increment produced no entry".to_string()))
    }

    /// # Errors
    /// Returns [`EngramError::KeyNotFound`] for absent keys and
    /// [`EngramError::Validation`] for non-numeric values or overflow.
    pub fn decrement(
        &self,
        namespace: &str,
        key: &str,
        amount: i64,
    ) -> Result<MutableEntry, EngramError> {
        let delta = amount.checked_neg().ok_or_else(|| {
            EngramError::Validation(format!("decrement amount {amount} cannot be negated"))
        })?;
        self.increment(namespace, key, delta)
    }

    /// # Errors
    /// Returns storage errors only.
    pub fn exists(&self, namespace: &str, key: &str) -> Result<bool, EngramError> {
        Ok(self.backend.get_entry(namespace, key)?.is_some())
    }

    /// # Errors
    /// Returns [`EngramError::KeyNotFound`] for absent keys.
    pub fn delete(&self, namespace: &str, key: &str) -> Result<DeleteReport, EngramError> {
        self.backend.modify_entry(namespace, key, &mut |current| {
            if current.is_none() {
                return Err(EngramError::key_not_found(namespace, key));
            }
            Ok(EntryWrite::Delete)
        })?;
        Ok(DeleteReport { deleted: true })
    }

    /// Pure alias of [`Self::delete`]: identical contract, identical error.
    ///
    /// # Errors
    /// Returns [`EngramError::KeyNotFound`] for absent keys.
    pub fn purge(&self, namespace: &str, key: &str) -> Result<DeleteReport, EngramError> {
        self.delete(namespace, key)
    }

    /// # Errors
    /// Returns [`EngramError::Validation`] for bad filters, storage errors
    /// otherwise.
    pub fn list(&self, filter: &EntryFilter) -> Result<Vec<MutableEntry>, EngramError> {
        validate_namespace(&filter.namespace)?;
        validate_limit(filter.limit)?;
        self.backend.list_entries(filter)
    }

    /// Count under the same filter `list` would use, minus pagination. Always
    /// equals the unpaginated list length.
    ///
    /// # Errors
    /// Returns [`EngramError::Validation`] for bad filters, storage errors
    /// otherwise.
    pub fn count(&self, filter: &EntryFilter) -> Result<usize, EngramError> {
        let unpaginated = EntryFilter { limit: None, ..filter.clone() };
        Ok(self.list(&unpaginated)?.len())
    }

    /// Delete every entry the filter matches.
    ///
    /// # Errors
    /// Returns [`EngramError::Validation`] for bad filters, storage errors
    /// otherwise.
    pub fn purge_many(&self, filter: &EntryFilter) -> Result<PurgeKeysReport, EngramError> {
        let unpaginated = EntryFilter { limit: None, ..filter.clone() };
        let entries = self.list(&unpaginated)?;
        let mut keys = Vec::with_capacity(entries.len());
        for entry in entries {
            self.delete(&entry.namespace, &entry.key)?;
            keys.push(entry.key);
        }
        Ok(PurgeKeysReport { deleted: keys.len(), keys })
    }

    /// # Errors
    /// Returns [`EngramError::Validation`] for a bad namespace, storage
    /// errors otherwise.
    pub fn purge_namespace(&self, namespace: &str) -> Result<PurgeKeysReport, EngramError> {
        self.purge_many(&EntryFilter::in_namespace(namespace))
    }

    /// Execute a batch of operations sequentially. Behavior on failure is
    /// governed by the configured [`TransactionMode`].
    ///
    /// # Errors
    /// Rejects with the first failing operation's error.
    pub fn transaction(&self, ops: &[KvOperation]) -> Result<TransactionReport, EngramError> {
        if self.mode == TransactionMode::PreValidated {
            self.prevalidate(ops)?;
        }

        let mut results = Vec::with_capacity(ops.len());
        for op in ops {
            results.push(self.apply_operation(op)?);
        }

        Ok(TransactionReport { success: true, operations_executed: results.len(), results })
    }

    /// Dry-run every operation against a projected snapshot, accounting for
    /// the effects of earlier operations in the same batch.
    fn prevalidate(&self, ops: &[KvOperation]) -> Result<(), EngramError> {
        let mut projected: BTreeMap<(String, String), Option<Value>> = BTreeMap::new();

        for op in ops {
            let namespace = op.namespace();
            let key = op.key();
            validate_namespace(namespace)?;
            validate_key(key)?;

            let slot = (namespace.to_string(), key.to_string());
            let state = match projected.get(&slot) {
                Some(value) => value.clone(),
                None => self.backend.get_entry(namespace, key)?.map(|entry| entry.value),
            };

            let next = match op {
                KvOperation::Set { value, .. } => {
                    validate_value_size(value)?;
                    Some(value.clone())
                }
                KvOperation::Update { value, .. } => {
                    if state.is_none() {
                        return Err(EngramError::key_not_found(namespace, key));
                    }
                    validate_value_size(value)?;
                    Some(value.clone())
                }
                KvOperation::Increment { amount, .. } => {
                    let Some(current) = state else {
                        return Err(EngramError::key_not_found(namespace, key));
                    };
                    Some(apply_numeric_delta(&current, *amount)?)
                }
                KvOperation::Decrement { amount, .. } => {
                    let Some(current) = state else {
                        return Err(EngramError::key_not_found(namespace, key));
                    };
                    let delta = amount.checked_neg().ok_or_else(|| {
                        EngramError::Validation(format!(
                            "decrement amount {amount} cannot be negated"
                        ))
                    })?;
                    Some(apply_numeric_delta(&current, delta)?)
                }
                KvOperation::Delete { .. } => {
                    if state.is_none() {
                        return Err(EngramError::key_not_found(namespace, key));
                    }
                    None
                }
            };

            projected.insert(slot, next);
        }

        Ok(())
    }

    fn apply_operation(&self, op: &KvOperation) -> Result<Value, EngramError> {
        match op {
            KvOperation::Set { namespace, key, value, user_id } => {
                let entry = self.set(
                    namespace,
                    key,
                    value.clone(),
                    SetOptions { user_id: user_id.clone(), metadata: None },
                )?;
                Ok(json!({"op": "set", "namespace": namespace, "key": key, "value": entry.value}))
            }
            KvOperation::Update { namespace, key, value } => {
                let entry = self.update(namespace, key, |_| value.clone())?;
                Ok(json!({"op": "update", "namespace": namespace, "key": key, "value": entry.value}))
            }
            KvOperation::Increment { namespace, key, amount } => {
                let entry = self.increment(namespace, key, *amount)?;
                Ok(json!({"op": "increment", "namespace": namespace, "key": key, "value": entry.value}))
            }
            KvOperation::Decrement { namespace, key, amount } => {
                let entry = self.decrement(namespace, key, *amount)?;
                Ok(json!({"op": "decrement", "namespace": namespace, "key": key, "value": entry.value}))
            }
            KvOperation::Delete { namespace, key } => {
                self.delete(namespace, key)?;
                Ok(json!({"op": "delete", "namespace": namespace, "key": key, "deleted": true}))
            }
        }
    }
}

/// One belief-revision decision applied to a candidate fact.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FactRevision {
    pub action: RevisionOutcome,
    pub fact: Fact,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub previous_fact_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub superseded_fact_id: Option<String>,
}

/// Fact storage plus the belief-revision engine.
#[derive(Clone)]
pub struct FactStore {
    backend: Arc<dyn Backend>,
}

impl FactStore {
    #[must_use]
    pub fn new(backend: Arc<dyn Backend>) -> Self {
        Self { backend }
    }

    /// Run full belief revision for each candidate. Active-fact state is
    /// re-fetched immediately before each decision; no snapshot is carried
    /// across candidates.
    ///
    /// # Errors
    /// Returns [`EngramError::Validation`] for malformed candidates and
    /// [`EngramError::FactNotFound`] for unknown explicit update targets.
    pub fn revise(
        &self,
        space_id: &str,
        candidates: &[FactCandidate],
    ) -> Result<Vec<FactRevision>, EngramError> {
        validate_space_id(space_id)?;

        let mut revisions = Vec::with_capacity(candidates.len());
        for candidate in candidates {
            let data = candidate.clone().into_data();
            data.validate()?;

            let active = self.active_slot(space_id, candidate)?;
            let action = decide_revision(candidate, &active);
            revisions.push(self.apply_action(space_id, data, &active, action)?);
        }
        Ok(revisions)
    }

    /// Deduplication-only storage used when belief revision is disabled:
    /// exact duplicates are dropped, everything else is added. Returns the
    /// facts actually written.
    ///
    /// # Errors
    /// Returns [`EngramError::Validation`] for malformed candidates.
    pub fn store_dedup(
        &self,
        space_id: &str,
        candidates: &[FactCandidate],
    ) -> Result<Vec<Fact>, EngramError> {
        validate_space_id(space_id)?;

        let mut stored = Vec::new();
        for candidate in candidates {
            let data = candidate.clone().into_data();
            data.validate()?;

            let active = self.active_slot(space_id, candidate)?;
            if let RevisionAction::Add = decide_dedup(candidate, &active) {
                let fact = Fact::new(space_id, data, OffsetDateTime::now_utc());
                self.put_fact(&fact)?;
                stored.push(fact);
            }
        }
        Ok(stored)
    }

    fn active_slot(
        &self,
        space_id: &str,
        candidate: &FactCandidate,
    ) -> Result<Vec<Fact>, EngramError> {
        self.backend.list_facts(&FactQuery::slot(
            space_id,
            candidate.subject.clone(),
            candidate.predicate.clone(),
        ))
    }

    fn apply_action(
        &self,
        space_id: &str,
        data: FactData,
        active: &[Fact],
        action: RevisionAction,
    ) -> Result<FactRevision, EngramError> {
        let now = OffsetDateTime::now_utc();
        match action {
            RevisionAction::Add => {
                let fact = Fact::new(space_id, data, now);
                self.put_fact(&fact)?;
                Ok(FactRevision {
                    action: RevisionOutcome::Add,
                    fact,
                    previous_fact_id: None,
                    superseded_fact_id: None,
                })
            }
            RevisionAction::Update { fact_id } => {
                let updated = self.backend.modify_fact(&fact_id, &mut |current| {
                    let Some(mut fact) = current else {
                        return Err(EngramError::FactNotFound(fact_id.clone()));
                    };
                    if !fact.is_active() {
                        return Err(EngramError::FactNotFound(fact_id.clone()));
                    }
                    fact.chain.append(data.clone(), now);
                    Ok(FactWrite::Put(fact))
                })?;
                let fact = updated.ok_or_else(|| {
                    EngramError::Storage("update produced no fact".to_string())
                })?;
                Ok(FactRevision {
                    action: RevisionOutcome::Update,
                    fact,
                    previous_fact_id: Some(fact_id),
                    superseded_fact_id: None,
                })
            }
            RevisionAction::Supersede { fact_id } => {
                let Some(existing) = active.iter().find(|fact| fact.fact_id == fact_id) else {
                    return Err(EngramError::FactNotFound(fact_id));
                };

                let mut replacement = Fact::new(space_id, data, now);
                replacement.supersedes = Some(existing.fact_id.clone());

                let mut retired = existing.clone();
                retired.valid_until = Some(now);
                retired.superseded_by = Some(replacement.fact_id.clone());

                self.backend.supersede_fact(&retired, &replacement)?;
                Ok(FactRevision {
                    action: RevisionOutcome::Supersede,
                    fact: replacement,
                    previous_fact_id: None,
                    superseded_fact_id: Some(fact_id),
                })
            }
            RevisionAction::None { fact_id } => {
                let existing = match active.iter().find(|fact| fact.fact_id == fact_id) {
                    Some(fact) => fact.clone(),
                    None => self
                        .backend
                        .get_fact(&fact_id)?
                        .ok_or_else(|| EngramError::FactNotFound(fact_id.clone()))?,
                };
                Ok(FactRevision {
                    action: RevisionOutcome::None,
                    fact: existing,
                    previous_fact_id: None,
                    superseded_fact_id: None,
                })
            }
        }
    }

    fn put_fact(&self, fact: &Fact) -> Result<(), EngramError> {
        self.backend.modify_fact(&fact.fact_id, &mut |_| Ok(FactWrite::Put(fact.clone())))?;
        Ok(())
    }

    /// Fetch one fact by id, active or superseded.
    ///
    /// # Errors
    /// Returns storage errors only.
    pub fn get(&self, fact_id: &str) -> Result<Option<Fact>, EngramError> {
        self.backend.get_fact(fact_id)
    }

    /// # Errors
    /// Returns [`EngramError::Validation`] for bad filters, storage errors
    /// otherwise.
    pub fn list(&self, query: &FactQuery) -> Result<Vec<Fact>, EngramError> {
        validate_space_id(&query.space_id)?;
        validate_limit(query.limit)?;
        self.backend.list_facts(query)
    }

    /// Count under the same filter `list` would use, minus pagination.
    ///
    /// # Errors
    /// Returns [`EngramError::Validation`] for bad filters, storage errors
    /// otherwise.
    pub fn count(&self, query: &FactQuery) -> Result<usize, EngramError> {
        let unpaginated = FactQuery { limit: None, ..query.clone() };
        Ok(self.list(&unpaginated)?.len())
    }

    /// Full version history of one fact, oldest first; empty for unknown ids.
    ///
    /// # Errors
    /// Returns storage errors only.
    pub fn history(&self, fact_id: &str) -> Result<Vec<VersionEntry<FactData>>, EngramError> {
        Ok(self
            .backend
            .get_fact(fact_id)?
            .map(|fact| fact.chain.history())
            .unwrap_or_default())
    }

    /// Delete a fact and its history.
    ///
    /// # Errors
    /// Returns [`EngramError::FactNotFound`] for unknown ids.
    pub fn forget(&self, fact_id: &str) -> Result<(), EngramError> {
        self.backend.modify_fact(fact_id, &mut |current| {
            if current.is_none() {
                return Err(EngramError::FactNotFound(fact_id.to_string()));
            }
            Ok(FactWrite::Delete)
        })?;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    User,
    Agent,
    System,
}

impl MessageRole {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Agent => "agent",
            Self::System => "system",
        }
    }
}

/// Conversation records plus immutable version-1 message records. No message
/// counter is maintained anywhere; counts are always computed live.
#[derive(Clone)]
pub struct ConversationLog {
    backend: Arc<dyn Backend>,
}

impl ConversationLog {
    #[must_use]
    pub fn new(backend: Arc<dyn Backend>) -> Self {
        Self { backend }
    }

    /// # Errors
    /// Returns [`EngramError::Validation`] for a malformed space id.
    pub fn create(
        &self,
        space_id: &str,
        title: Option<String>,
    ) -> Result<VersionedRecord, EngramError> {
        validate_space_id(space_id)?;
        let now = OffsetDateTime::now_utc();
        let conversation_id = new_prefixed_id("conv");
        let mut record = VersionedRecord::new(
            CONVERSATION_TYPE,
            conversation_id.clone(),
            json!({ "title": title }),
            now,
        );
        record.space_id = Some(space_id.to_string());

        let stored =
            self.backend.modify_record(CONVERSATION_TYPE, &conversation_id, &mut |_| {
                Ok(RecordWrite::Put(record.clone()))
            })?;
        stored.ok_or_else(|| EngramError::Storage("create produced no conversation".to_string()))
    }

    /// # Errors
    /// Returns storage errors only.
    pub fn get(&self, conversation_id: &str) -> Result<Option<VersionedRecord>, EngramError> {
        self.backend.get_record(CONVERSATION_TYPE, conversation_id)
    }

    /// Append one immutable message to an existing conversation.
    ///
    /// # Errors
    /// Returns [`EngramError::RecordNotFound`] for unknown conversations.
    pub fn append_message(
        &self,
        conversation_id: &str,
        role: MessageRole,
        content: &str,
    ) -> Result<VersionedRecord, EngramError> {
        let conversation = self
            .get(conversation_id)?
            .ok_or_else(|| EngramError::record_not_found(CONVERSATION_TYPE, conversation_id))?;

        let now = OffsetDateTime::now_utc();
        let message_id = new_prefixed_id("msg");
        let mut record = VersionedRecord::new(
            MESSAGE_TYPE,
            message_id.clone(),
            json!({
                "conversation_id": conversation_id,
                "role": role.as_str(),
                "content": content,
            }),
            now,
        );
        record.space_id = conversation.space_id.clone();

        let stored = self.backend.modify_record(MESSAGE_TYPE, &message_id, &mut |_| {
            Ok(RecordWrite::Put(record.clone()))
        })?;
        stored.ok_or_else(|| EngramError::Storage("append produced no message".to_string()))
    }

    /// Messages of one conversation in chronological order.
    ///
    /// # Errors
    /// Returns [`EngramError::RecordNotFound`] for unknown conversations.
    pub fn list_messages(
        &self,
        conversation_id: &str,
        limit: Option<usize>,
    ) -> Result<Vec<VersionedRecord>, EngramError> {
        validate_limit(limit)?;
        let conversation = self
            .get(conversation_id)?
            .ok_or_else(|| EngramError::record_not_found(CONVERSATION_TYPE, conversation_id))?;

        let query = RecordQuery {
            record_type: MESSAGE_TYPE.to_string(),
            space_id: conversation.space_id.clone(),
            sort_by: engram_core::RecordSort::CreatedAt,
            sort_order: engram_core::SortOrder::Asc,
            ..RecordQuery::default()
        };
        let mut messages = self.backend.list_records(&query)?;
        messages.retain(|message| {
            message.chain.data.get("conversation_id").and_then(Value::as_str)
                == Some(conversation_id)
        });
        if let Some(limit) = limit {
            messages.truncate(limit);
        }
        Ok(messages)
    }

    /// Live message count; always the unpaginated list length.
    ///
    /// # Errors
    /// Returns [`EngramError::RecordNotFound`] for unknown conversations.
    pub fn count_messages(&self, conversation_id: &str) -> Result<usize, EngramError> {
        Ok(self.list_messages(conversation_id, None)?.len())
    }

    /// # Errors
    /// Returns [`EngramError::Validation`] for a malformed space id.
    pub fn list_conversations(
        &self,
        space_id: &str,
    ) -> Result<Vec<VersionedRecord>, EngramError> {
        validate_space_id(space_id)?;
        self.backend.list_records(&RecordQuery::in_space(CONVERSATION_TYPE, space_id))
    }
}

fn transition_entity(
    backend: &Arc<dyn Backend>,
    kind: EntityKind,
    record_id: &str,
    to_status: &str,
) -> Result<VersionedRecord, EngramError> {
    let now = OffsetDateTime::now_utc();
    let stored = backend.modify_record(kind.record_type(), record_id, &mut |current| {
        let Some(mut record) = current else {
            return Err(EngramError::record_not_found(kind.record_type(), record_id));
        };

        let from = record
            .chain
            .data
            .get("status")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let check = check_transition(kind, &from, to_status)?;
        if check.noop {
            return Ok(RecordWrite::Keep);
        }
        if !check.declared {
            warn!(
                kind = kind.as_str(),
                id = record_id,
                from = from.as_str(),
                to = to_status,
                "status transition outside the declared edge list"
            );
        }

        let mut doc = record.chain.data.clone();
        let Some(fields) = doc.as_object_mut() else {
            return Err(EngramError::Storage(format!(
                "persisted {} document is not an object",
                kind.as_str()
            )));
        };
        fields.insert("status".to_string(), Value::from(to_status));
        if kind == EntityKind::Context && to_status == "completed" {
            let completed_at = now
                .format(&time::format_description::well_known::Rfc3339)
                .map_err(|err| EngramError::Storage(format!("failed to format timestamp: {err}")))?;
            fields.insert("completed_at".to_string(), Value::from(completed_at));
        }

        record.chain.append(doc, now);
        Ok(RecordWrite::Put(record))
    })?;

    stored.ok_or_else(|| EngramError::record_not_found(kind.record_type(), record_id))
}

fn list_by_status(
    backend: &Arc<dyn Backend>,
    kind: EntityKind,
    space_id: Option<&str>,
    status: &str,
) -> Result<Vec<VersionedRecord>, EngramError> {
    kind.parse_status(status)?;
    let query = RecordQuery {
        record_type: kind.record_type().to_string(),
        space_id: space_id.map(ToString::to_string),
        ..RecordQuery::default()
    };
    let mut records = backend.list_records(&query)?;
    records.retain(|record| {
        record.chain.data.get("status").and_then(Value::as_str) == Some(status)
    });
    Ok(records)
}

fn create_entity(
    backend: &Arc<dyn Backend>,
    kind: EntityKind,
    record_id: &str,
    space_id: Option<&str>,
    doc: Value,
) -> Result<VersionedRecord, EngramError> {
    validate_record_id(record_id)?;
    if let Some(space_id) = space_id {
        validate_space_id(space_id)?;
    }

    let now = OffsetDateTime::now_utc();
    let mut record = VersionedRecord::new(kind.record_type(), record_id, doc, now);
    record.space_id = space_id.map(ToString::to_string);

    let stored = backend.modify_record(kind.record_type(), record_id, &mut |current| {
        if current.is_some() {
            return Err(EngramError::Validation(format!(
                "{} `{record_id}` already exists",
                kind.as_str()
            )));
        }
        Ok(RecordWrite::Put(record.clone()))
    })?;
    stored.ok_or_else(|| EngramError::Storage("create produced no entity".to_string()))
}

/// Memory spaces: the collection roots statistics aggregate over.
#[derive(Clone)]
pub struct SpaceStore {
    backend: Arc<dyn Backend>,
}

impl SpaceStore {
    #[must_use]
    pub fn new(backend: Arc<dyn Backend>) -> Self {
        Self { backend }
    }

    /// # Errors
    /// Returns [`EngramError::Validation`] when the space already exists or
    /// the id is malformed.
    pub fn create(
        &self,
        space_id: &str,
        name: Option<String>,
        data: Value,
    ) -> Result<VersionedRecord, EngramError> {
        validate_space_id(space_id)?;
        create_entity(
            &self.backend,
            EntityKind::Space,
            space_id,
            None,
            json!({ "status": "active", "name": name, "data": data }),
        )
    }

    /// # Errors
    /// Returns storage errors only.
    pub fn get(&self, space_id: &str) -> Result<Option<VersionedRecord>, EngramError> {
        self.backend.get_record(EntityKind::Space.record_type(), space_id)
    }

    /// # Errors
    /// Returns storage errors only.
    pub fn list(&self) -> Result<Vec<VersionedRecord>, EngramError> {
        self.backend.list_records(&RecordQuery::of_type(EntityKind::Space.record_type()))
    }

    /// # Errors
    /// Returns [`EngramError::InvalidStatusValue`] for unknown tokens.
    pub fn list_by_status(&self, status: &str) -> Result<Vec<VersionedRecord>, EngramError> {
        list_by_status(&self.backend, EntityKind::Space, None, status)
    }

    /// # Errors
    /// Returns [`EngramError::InvalidStatusValue`] for unknown tokens and
    /// [`EngramError::RecordNotFound`] for unknown spaces.
    pub fn set_status(
        &self,
        space_id: &str,
        to_status: &str,
    ) -> Result<VersionedRecord, EngramError> {
        transition_entity(&self.backend, EntityKind::Space, space_id, to_status)
    }
}

/// Contexts: stateful entities with parent references by id only. A parent's
/// transition never cascades to its children.
#[derive(Clone)]
pub struct ContextStore {
    backend: Arc<dyn Backend>,
}

impl ContextStore {
    #[must_use]
    pub fn new(backend: Arc<dyn Backend>) -> Self {
        Self { backend }
    }

    /// # Errors
    /// Returns [`EngramError::RecordNotFound`] when `parent_id` names a
    /// nonexistent context.
    pub fn create(
        &self,
        space_id: &str,
        context_id: Option<String>,
        data: Value,
        parent_id: Option<String>,
    ) -> Result<VersionedRecord, EngramError> {
        if let Some(parent_id) = &parent_id {
            if self.get(parent_id)?.is_none() {
                return Err(EngramError::record_not_found(
                    EntityKind::Context.record_type(),
                    parent_id,
                ));
            }
        }

        let context_id = context_id.unwrap_or_else(|| new_prefixed_id("ctx"));
        create_entity(
            &self.backend,
            EntityKind::Context,
            &context_id,
            Some(space_id),
            json!({
                "status": "active",
                "data": data,
                "parent_id": parent_id,
                "completed_at": Value::Null,
            }),
        )
    }

    /// # Errors
    /// Returns storage errors only.
    pub fn get(&self, context_id: &str) -> Result<Option<VersionedRecord>, EngramError> {
        self.backend.get_record(EntityKind::Context.record_type(), context_id)
    }

    /// # Errors
    /// Returns [`EngramError::Validation`] for a malformed space id.
    pub fn list(&self, space_id: &str) -> Result<Vec<VersionedRecord>, EngramError> {
        validate_space_id(space_id)?;
        self.backend
            .list_records(&RecordQuery::in_space(EntityKind::Context.record_type(), space_id))
    }

    /// # Errors
    /// Returns [`EngramError::InvalidStatusValue`] for unknown tokens.
    pub fn list_by_status(
        &self,
        space_id: &str,
        status: &str,
    ) -> Result<Vec<VersionedRecord>, EngramError> {
        list_by_status(&self.backend, EntityKind::Context, Some(space_id), status)
    }

    /// Children reference parents by id; parents never embed child lists.
    ///
    /// # Errors
    /// Returns [`EngramError::Validation`] for a malformed space id.
    pub fn children(
        &self,
        space_id: &str,
        parent_id: &str,
    ) -> Result<Vec<VersionedRecord>, EngramError> {
        let mut contexts = self.list(space_id)?;
        contexts.retain(|record| {
            record.chain.data.get("parent_id").and_then(Value::as_str) == Some(parent_id)
        });
        Ok(contexts)
    }

    /// # Errors
    /// Returns [`EngramError::InvalidStatusValue`] for unknown tokens and
    /// [`EngramError::RecordNotFound`] for unknown contexts.
    pub fn set_status(
        &self,
        context_id: &str,
        to_status: &str,
    ) -> Result<VersionedRecord, EngramError> {
        transition_entity(&self.backend, EntityKind::Context, context_id, to_status)
    }
}

/// Agents registered within a space.
#[derive(Clone)]
pub struct AgentStore {
    backend: Arc<dyn Backend>,
}

impl AgentStore {
    #[must_use]
    pub fn new(backend: Arc<dyn Backend>) -> Self {
        Self { backend }
    }

    /// # Errors
    /// Returns [`EngramError::Validation`] when the agent already exists.
    pub fn create(
        &self,
        space_id: &str,
        agent_id: Option<String>,
        name: Option<String>,
        data: Value,
    ) -> Result<VersionedRecord, EngramError> {
        let agent_id = agent_id.unwrap_or_else(|| new_prefixed_id("agent"));
        create_entity(
            &self.backend,
            EntityKind::Agent,
            &agent_id,
            Some(space_id),
            json!({ "status": "active", "name": name, "data": data }),
        )
    }

    /// # Errors
    /// Returns storage errors only.
    pub fn get(&self, agent_id: &str) -> Result<Option<VersionedRecord>, EngramError> {
        self.backend.get_record(EntityKind::Agent.record_type(), agent_id)
    }

    /// # Errors
    /// Returns [`EngramError::Validation`] for a malformed space id.
    pub fn list(&self, space_id: &str) -> Result<Vec<VersionedRecord>, EngramError> {
        validate_space_id(space_id)?;
        self.backend
            .list_records(&RecordQuery::in_space(EntityKind::Agent.record_type(), space_id))
    }

    /// # Errors
    /// Returns [`EngramError::InvalidStatusValue`] for unknown tokens and
    /// [`EngramError::RecordNotFound`] for unknown agents.
    pub fn set_status(
        &self,
        agent_id: &str,
        to_status: &str,
    ) -> Result<VersionedRecord, EngramError> {
        transition_entity(&self.backend, EntityKind::Agent, agent_id, to_status)
    }
}

fn is_archived(record: &VersionedRecord) -> bool {
    record.chain.data.get("archived").and_then(Value::as_bool).unwrap_or(false)
}

fn embedding_from_doc(doc: &Value) -> Option<Vec<f32>> {
    let values = doc.get("embedding")?.as_array()?;
    let mut embedding = Vec::with_capacity(values.len());
    for value in values {
        #[allow(clippy::cast_possible_truncation)]
        embedding.push(value.as_f64()? as f32);
    }
    Some(embedding)
}

fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.is_empty() || a.len() != b.len() {
        return 0.0;
    }

    let mut dot = 0.0_f32;
    let mut norm_a = 0.0_f32;
    let mut norm_b = 0.0_f32;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom == 0.0 {
        0.0
    } else {
        dot / denom
    }
}

fn tokenize(value: &str) -> Vec<String> {
    use std::collections::BTreeSet;

    let mut terms = BTreeSet::new();
    for raw in value.split_whitespace() {
        let normalized = raw
            .chars()
            .filter(|ch| ch.is_ascii_alphanumeric() || *ch == '_' || *ch == '-')
            .collect::<String>()
            .to_ascii_lowercase();
        if normalized.len() >= 2 {
            terms.insert(normalized);
        }
    }
    terms.into_iter().collect()
}

#[allow(clippy::cast_precision_loss)]
fn lexical_overlap(query_terms: &[String], text: &str) -> f32 {
    if query_terms.is_empty() {
        return 0.0;
    }

    let text_terms = tokenize(text);
    let matched = query_terms.iter().filter(|term| text_terms.contains(*term)).count();
    matched as f32 / query_terms.len() as f32
}

/// Request for one remembered exchange.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RememberRequest {
    pub space_id: String,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub conversation_id: Option<String>,
    pub user_text: String,
    pub agent_text: String,
    #[serde(default = "default_true")]
    pub belief_revision: bool,
}

fn default_true() -> bool {
    true
}

/// Everything one `remember` call wrote. `fact_revisions` is entirely absent
/// (not an empty array) when belief revision was disabled for the call.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RememberResult {
    pub conversation_id: String,
    pub user_message_id: String,
    pub agent_message_id: String,
    pub memory_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fact_revisions: Option<Vec<FactRevision>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MemoryHit {
    pub record: VersionedRecord,
    pub score: f32,
}

/// Orchestration layer combining conversation logs, vector memories, and the
/// fact layer behind injected hooks.
pub struct MemoryLayer {
    backend: Arc<dyn Backend>,
    facts: FactStore,
    log: ConversationLog,
    hooks: Hooks,
    graph_sync_active: bool,
}

impl MemoryLayer {
    #[must_use]
    pub fn new(backend: Arc<dyn Backend>, config: &EngramConfig, hooks: Hooks) -> Self {
        if config.graph_sync.opt_in && config.graph_sync.endpoint.is_none() {
            warn!("graph sync opt-in is set but no endpoint is configured; sync disabled");
        }
        let graph_sync_active = config.graph_sync.is_active() && hooks.graph_sink.is_some();

        Self {
            facts: FactStore::new(Arc::clone(&backend)),
            log: ConversationLog::new(Arc::clone(&backend)),
            backend,
            hooks,
            graph_sync_active,
        }
    }

    /// Record one user/agent exchange: append messages, derive and store a
    /// memory, and run extracted facts through belief revision (or pure
    /// deduplication when disabled for the call).
    ///
    /// # Errors
    /// Returns [`EngramError::RecordNotFound`] for unknown conversations and
    /// propagates hook failures.
    pub fn remember(&self, request: &RememberRequest) -> Result<RememberResult, EngramError> {
        validate_space_id(&request.space_id)?;

        let conversation = match &request.conversation_id {
            Some(conversation_id) => self.log.get(conversation_id)?.ok_or_else(|| {
                EngramError::record_not_found(CONVERSATION_TYPE, conversation_id)
            })?,
            None => self.log.create(&request.space_id, None)?,
        };

        let user_message =
            self.log.append_message(&conversation.record_id, MessageRole::User, &request.user_text)?;
        let agent_message = self.log.append_message(
            &conversation.record_id,
            MessageRole::Agent,
            &request.agent_text,
        )?;

        let content = match &self.hooks.content_summarizer {
            Some(summarizer) => summarizer
                .summarize(&request.user_text, &request.agent_text)?
                .unwrap_or_else(|| default_content(&request.user_text, &request.agent_text)),
            None => default_content(&request.user_text, &request.agent_text),
        };

        let memory = self.write_memory(
            &request.space_id,
            request.user_id.as_deref(),
            &content,
            Some(&conversation.record_id),
        )?;

        let fact_revisions = match &self.hooks.fact_extractor {
            None => None,
            Some(extractor) => {
                let candidates =
                    extractor.extract_facts(&request.user_text, &request.agent_text)?;
                if request.belief_revision {
                    let revisions = self.facts.revise(&request.space_id, &candidates)?;
                    for revision in &revisions {
                        if revision.action != RevisionOutcome::None {
                            self.sync_to_graph(&request.space_id, &revision.fact);
                        }
                    }
                    Some(revisions)
                } else {
                    // Dedup path: no revision detail is reported at all.
                    let stored = self.facts.store_dedup(&request.space_id, &candidates)?;
                    for fact in &stored {
                        self.sync_to_graph(&request.space_id, fact);
                    }
                    None
                }
            }
        };

        Ok(RememberResult {
            conversation_id: conversation.record_id,
            user_message_id: user_message.record_id,
            agent_message_id: agent_message.record_id,
            memory_id: memory.record_id,
            fact_revisions,
        })
    }

    fn write_memory(
        &self,
        space_id: &str,
        user_id: Option<&str>,
        content: &str,
        conversation_id: Option<&str>,
    ) -> Result<VersionedRecord, EngramError> {
        let now = OffsetDateTime::now_utc();
        let memory_id = new_prefixed_id("mem");

        let mut doc = json!({
            "content": content,
            "conversation_id": conversation_id,
            "archived": false,
        });
        if let Some(provider) = &self.hooks.embedding_provider {
            let embedding = provider.embed(content)?;
            if let Some(fields) = doc.as_object_mut() {
                fields.insert("embedding".to_string(), json!(embedding));
            }
        }

        let mut record = VersionedRecord::new(MEMORY_TYPE, memory_id.clone(), doc, now);
        record.space_id = Some(space_id.to_string());
        record.user_id = user_id.map(ToString::to_string);

        let stored = self.backend.modify_record(MEMORY_TYPE, &memory_id, &mut |_| {
            Ok(RecordWrite::Put(record.clone()))
        })?;
        stored.ok_or_else(|| EngramError::Storage("write produced no memory".to_string()))
    }

    fn sync_to_graph(&self, space_id: &str, fact: &Fact) {
        if !self.graph_sync_active {
            return;
        }
        let Some(sink) = &self.hooks.graph_sink else {
            return;
        };
        if let Err(err) = sink.sync_fact(space_id, fact) {
            // Sync is best-effort: connection failures are logged, never
            // propagated.
            warn!(fact_id = fact.fact_id.as_str(), error = %err, "graph sync failed");
        }
    }

    /// Store a memory directly, outside any conversation.
    ///
    /// # Errors
    /// Returns [`EngramError::Validation`] for malformed input and propagates
    /// embedding-hook failures.
    pub fn store(
        &self,
        space_id: &str,
        user_id: Option<&str>,
        content: &str,
    ) -> Result<VersionedRecord, EngramError> {
        validate_space_id(space_id)?;
        self.write_memory(space_id, user_id, content, None)
    }

    /// # Errors
    /// Returns storage errors only.
    pub fn get(&self, memory_id: &str) -> Result<Option<VersionedRecord>, EngramError> {
        self.backend.get_record(MEMORY_TYPE, memory_id)
    }

    /// Replace a memory's content with a new version (re-embedding when a
    /// provider is configured). Other fields carry over verbatim.
    ///
    /// # Errors
    /// Returns [`EngramError::RecordNotFound`] for unknown memories.
    pub fn update(&self, memory_id: &str, content: &str) -> Result<VersionedRecord, EngramError> {
        let embedding = match &self.hooks.embedding_provider {
            Some(provider) => Some(provider.embed(content)?),
            None => None,
        };

        let now = OffsetDateTime::now_utc();
        let stored = self.backend.modify_record(MEMORY_TYPE, memory_id, &mut |current| {
            let Some(mut record) = current else {
                return Err(EngramError::record_not_found(MEMORY_TYPE, memory_id));
            };

            let mut doc = record.chain.data.clone();
            let Some(fields) = doc.as_object_mut() else {
                return Err(EngramError::Storage(
                    "persisted memory document is not an object".to_string(),
                ));
            };
            fields.insert("content".to_string(), Value::from(content));
            if let Some(embedding) = &embedding {
                fields.insert("embedding".to_string(), json!(embedding));
            }

            record.chain.append(doc, now);
            Ok(RecordWrite::Put(record))
        })?;

        stored.ok_or_else(|| EngramError::record_not_found(MEMORY_TYPE, memory_id))
    }

    /// Delete a memory and its history.
    ///
    /// # Errors
    /// Returns [`EngramError::RecordNotFound`] for unknown memories.
    pub fn delete(&self, memory_id: &str) -> Result<PurgeReport, EngramError> {
        VersionStore::new(Arc::clone(&self.backend)).purge(MEMORY_TYPE, memory_id)
    }

    /// Alias of [`Self::delete`] in the orchestration vocabulary.
    ///
    /// # Errors
    /// Returns [`EngramError::RecordNotFound`] for unknown memories.
    pub fn forget(&self, memory_id: &str) -> Result<PurgeReport, EngramError> {
        self.delete(memory_id)
    }

    /// Move a memory out of default listing, counting, and search. Already
    /// archived memories are left untouched.
    ///
    /// # Errors
    /// Returns [`EngramError::RecordNotFound`] for unknown memories.
    pub fn archive(&self, memory_id: &str) -> Result<VersionedRecord, EngramError> {
        self.set_archived(memory_id, true)
    }

    /// # Errors
    /// Returns [`EngramError::RecordNotFound`] for unknown memories.
    pub fn restore_from_archive(&self, memory_id: &str) -> Result<VersionedRecord, EngramError> {
        self.set_archived(memory_id, false)
    }

    fn set_archived(&self, memory_id: &str, archived: bool) -> Result<VersionedRecord, EngramError> {
        let now = OffsetDateTime::now_utc();
        let stored = self.backend.modify_record(MEMORY_TYPE, memory_id, &mut |current| {
            let Some(mut record) = current else {
                return Err(EngramError::record_not_found(MEMORY_TYPE, memory_id));
            };
            if is_archived(&record) == archived {
                return Ok(RecordWrite::Keep);
            }

            let mut doc = record.chain.data.clone();
            let Some(fields) = doc.as_object_mut() else {
                return Err(EngramError::Storage(
                    "persisted memory document is not an object".to_string(),
                ));
            };
            fields.insert("archived".to_string(), Value::from(archived));
            record.chain.append(doc, now);
            Ok(RecordWrite::Put(record))
        })?;

        stored.ok_or_else(|| EngramError::record_not_found(MEMORY_TYPE, memory_id))
    }

    /// Non-archived memories of a space.
    ///
    /// # Errors
    /// Returns [`EngramError::Validation`] for a malformed space id.
    pub fn list(&self, space_id: &str) -> Result<Vec<VersionedRecord>, EngramError> {
        validate_space_id(space_id)?;
        let mut records =
            self.backend.list_records(&RecordQuery::in_space(MEMORY_TYPE, space_id))?;
        records.retain(|record| !is_archived(record));
        Ok(records)
    }

    /// Rank non-archived memories against a query: cosine similarity over
    /// stored vectors when an embedding provider is configured, lexical term
    /// overlap otherwise.
    ///
    /// # Errors
    /// Returns [`EngramError::Validation`] for bad input and propagates
    /// embedding-hook failures.
    pub fn search(
        &self,
        space_id: &str,
        query: &str,
        limit: usize,
    ) -> Result<Vec<MemoryHit>, EngramError> {
        validate_limit(Some(limit))?;
        let memories = self.list(space_id)?;

        let query_embedding = match &self.hooks.embedding_provider {
            Some(provider) => Some(provider.embed(query)?),
            None => None,
        };
        let query_terms = tokenize(query);

        let mut hits = Vec::with_capacity(memories.len());
        for record in memories {
            let score = match (&query_embedding, embedding_from_doc(&record.chain.data)) {
                (Some(query_vec), Some(memory_vec)) => cosine_similarity(query_vec, &memory_vec),
                _ => {
                    let content =
                        record.chain.data.get("content").and_then(Value::as_str).unwrap_or("");
                    lexical_overlap(&query_terms, content)
                }
            };
            hits.push(MemoryHit { record, score });
        }

        hits.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(Ordering::Equal)
                .then_with(|| a.record.record_id.cmp(&b.record.record_id))
        });
        hits.truncate(limit);
        Ok(hits)
    }
}

fn default_content(user_text: &str, agent_text: &str) -> String {
    format!("User: {user_text}\nAgent: {agent_text}")
}

/// Aggregate statistics for one memory space.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SpaceStats {
    pub conversations: usize,
    pub messages: usize,
    pub memories: usize,
    pub facts: usize,
    pub total: usize,
}

/// Live statistics: every count runs the corresponding list filter and takes
/// its length, so `count == list.len()` holds by construction and no counter
/// is persisted anywhere.
#[derive(Clone)]
pub struct StatisticsAggregator {
    backend: Arc<dyn Backend>,
}

impl StatisticsAggregator {
    #[must_use]
    pub fn new(backend: Arc<dyn Backend>) -> Self {
        Self { backend }
    }

    /// # Errors
    /// Returns [`EngramError::Validation`] for a malformed space id.
    pub fn space_stats(&self, space_id: &str) -> Result<SpaceStats, EngramError> {
        validate_space_id(space_id)?;

        let conversations = self
            .backend
            .list_records(&RecordQuery::in_space(CONVERSATION_TYPE, space_id))?
            .len();
        let messages =
            self.backend.list_records(&RecordQuery::in_space(MESSAGE_TYPE, space_id))?.len();
        let memories = {
            let mut records =
                self.backend.list_records(&RecordQuery::in_space(MEMORY_TYPE, space_id))?;
            records.retain(|record| !is_archived(record));
            records.len()
        };
        let facts = self.backend.list_facts(&FactQuery::in_space(space_id))?.len();

        Ok(SpaceStats {
            conversations,
            messages,
            memories,
            facts,
            total: conversations + messages + memories + facts,
        })
    }
}

#[cfg(test)]
mod tests {
    use engram_core::FactType;
    use engram_store_sqlite::SqliteBackend;

    use super::*;

    fn open_engram(mode: TransactionMode) -> Engram {
        let backend = match SqliteBackend::open_in_memory() {
            Ok(backend) => backend,
            Err(err) => panic!("failed to open in-memory backend: {err}"),
        };
        if let Err(err) = backend.migrate() {
            panic!("failed to migrate: {err}");
        }
        Engram::new(
            Arc::new(backend),
            EngramConfig { transaction_mode: mode, ..EngramConfig::default() },
        )
    }

    fn mk_candidate(subject: &str, predicate: &str, object: Value, confidence: u8) -> FactCandidate {
        FactCandidate {
            subject: subject.to_string(),
            predicate: predicate.to_string(),
            object,
            fact_type: FactType::Preference,
            confidence,
            tags: vec![],
            source_type: None,
            update_of: None,
        }
    }

    fn assert_code(err: &EngramError, code: &str) {
        assert!(
            err.to_string().contains(code),
            "error `{err}` did not contain code `{code}`"
        );
    }

    // Test IDs: TAP-001
    #[test]
    fn versioned_store_appends_and_reads_back_25_versions() -> Result<(), EngramError> {
        let engram = open_engram(TransactionMode::default());
        let records = engram.records();

        for version in 1..=25 {
            records.store("doc", "doc-1", json!({"rev": version}), StoreOptions::default())?;
        }

        let current = records
            .get("doc", "doc-1")?
            .ok_or_else(|| EngramError::Storage("missing record".to_string()))?;
        assert_eq!(current.chain.version, 25);
        assert_eq!(records.get_history("doc", "doc-1")?.len(), 25);
        for version in 1..=25_u32 {
            let snapshot = records.get_version("doc", "doc-1", version)?;
            assert_eq!(
                snapshot.map(|entry| entry.data),
                Some(json!({"rev": version}))
            );
        }
        Ok(())
    }

    // Test IDs: TAP-002
    #[test]
    fn purge_versions_and_purge_report_exact_counts() -> Result<(), EngramError> {
        let engram = open_engram(TransactionMode::default());
        let records = engram.records();

        for version in 1..=10 {
            records.store("doc", "doc-1", json!(version), StoreOptions::default())?;
        }

        let report = records.purge_versions("doc", "doc-1", 3)?;
        assert_eq!(report.versions_purged, 7);
        assert_eq!(report.versions_remaining, 3);

        let noop = records.purge_versions("doc", "doc-1", 3)?;
        assert_eq!(noop.versions_purged, 0);

        let purge = records.purge("doc", "doc-1")?;
        assert!(purge.deleted);
        assert_eq!(purge.versions_deleted, 3);

        let missing = records.purge("doc", "doc-1");
        match missing {
            Ok(_) => panic!("purging a purged record should fail"),
            Err(err) => assert_code(&err, "IMMUTABLE_ENTRY_NOT_FOUND"),
        }
        Ok(())
    }

    // Test IDs: TAP-003
    #[test]
    fn unknown_history_is_empty_not_an_error() -> Result<(), EngramError> {
        let engram = open_engram(TransactionMode::default());
        assert!(engram.records().get_history("doc", "missing")?.is_empty());
        assert!(engram.records().get_version("doc", "missing", 1)?.is_none());
        Ok(())
    }

    // Test IDs: TAP-010
    #[test]
    fn kv_increment_contract_handles_missing_and_null_keys() -> Result<(), EngramError> {
        let engram = open_engram(TransactionMode::default());
        let kv = engram.kv();

        // Never-set key rejects with the stable code.
        match kv.increment("counters", "missing", 1) {
            Ok(_) => panic!("increment on a missing key should fail"),
            Err(err) => assert_code(&err, "MUTABLE_KEY_NOT_FOUND"),
        }

        // Explicit null is treated as zero.
        kv.set("c", "k", Value::Null, SetOptions::default())?;
        let entry = kv.increment("c", "k", 1)?;
        assert_eq!(entry.value, json!(1));

        // No floor at zero.
        let entry = kv.decrement("c", "k", 5)?;
        assert_eq!(entry.value, json!(-4));
        Ok(())
    }

    // Test IDs: TAP-011
    #[test]
    fn kv_overwrite_keeps_no_history_and_get_is_ambiguous_by_design() -> Result<(), EngramError> {
        let engram = open_engram(TransactionMode::default());
        let kv = engram.kv();

        kv.set("ns", "v", json!("first"), SetOptions::default())?;
        kv.set("ns", "v", json!("second"), SetOptions::default())?;
        assert_eq!(kv.get("ns", "v")?, json!("second"));

        // get() cannot distinguish absent from present-null; get_record can.
        assert_eq!(kv.get("ns", "absent")?, Value::Null);
        kv.set("ns", "null-holder", Value::Null, SetOptions::default())?;
        assert_eq!(kv.get("ns", "null-holder")?, Value::Null);
        assert!(kv.get_record("ns", "absent")?.is_none());
        assert!(kv.get_record("ns", "null-holder")?.is_some());
        Ok(())
    }

    // Test IDs: TAP-012
    #[test]
    fn kv_count_always_matches_list_length() -> Result<(), EngramError> {
        let engram = open_engram(TransactionMode::default());
        let kv = engram.kv();

        for key in ["a", "b", "c", "d"] {
            kv.set("parity", key, json!(key), SetOptions::default())?;
        }
        kv.delete("parity", "b")?;
        kv.transaction(&[
            KvOperation::Set { namespace: "parity".into(), key: "e".into(), value: json!(5), user_id: None },
            KvOperation::Delete { namespace: "parity".into(), key: "c".into() },
        ])?;

        let filter = EntryFilter::in_namespace("parity");
        assert_eq!(kv.count(&filter)?, kv.list(&filter)?.len());
        assert_eq!(kv.count(&filter)?, 3);

        let limited = EntryFilter { limit: Some(1), ..EntryFilter::in_namespace("parity") };
        assert_eq!(kv.list(&limited)?.len(), 1);
        // Count ignores pagination.
        assert_eq!(kv.count(&limited)?, 3);
        Ok(())
    }

    // Test IDs: TAP-013
    #[test]
    fn sequential_transaction_persists_the_prefix_before_a_failure() -> Result<(), EngramError> {
        let engram = open_engram(TransactionMode::Sequential);
        let kv = engram.kv();

        let ops = vec![
            KvOperation::Set { namespace: "tx".into(), key: "a".into(), value: json!(1), user_id: None },
            KvOperation::Decrement { namespace: "tx".into(), key: "ghost".into(), amount: 1 },
            KvOperation::Set { namespace: "tx".into(), key: "b".into(), value: json!(2), user_id: None },
        ];
        match kv.transaction(&ops) {
            Ok(_) => panic!("transaction should reject on the failing operation"),
            Err(err) => assert_code(&err, "MUTABLE_KEY_NOT_FOUND"),
        }

        // The documented source behavior: earlier operations persist.
        assert!(kv.exists("tx", "a")?);
        assert!(!kv.exists("tx", "b")?);
        Ok(())
    }

    // Test IDs: TAP-014
    #[test]
    fn prevalidated_transaction_applies_nothing_on_doomed_input() -> Result<(), EngramError> {
        let engram = open_engram(TransactionMode::PreValidated);
        let kv = engram.kv();

        let ops = vec![
            KvOperation::Set { namespace: "tx".into(), key: "a".into(), value: json!(1), user_id: None },
            KvOperation::Decrement { namespace: "tx".into(), key: "ghost".into(), amount: 1 },
        ];
        match kv.transaction(&ops) {
            Ok(_) => panic!("transaction should reject on the failing operation"),
            Err(err) => assert_code(&err, "MUTABLE_KEY_NOT_FOUND"),
        }
        assert!(!kv.exists("tx", "a")?);

        // A batch whose later ops depend on earlier ones still validates.
        let report = kv.transaction(&[
            KvOperation::Set { namespace: "tx".into(), key: "n".into(), value: json!(10), user_id: None },
            KvOperation::Increment { namespace: "tx".into(), key: "n".into(), amount: 5 },
        ])?;
        assert!(report.success);
        assert_eq!(report.operations_executed, 2);
        assert_eq!(kv.get("tx", "n")?, json!(15));
        Ok(())
    }

    // Test IDs: TAP-020
    #[test]
    fn belief_revision_walks_add_none_supersede() -> Result<(), EngramError> {
        let engram = open_engram(TransactionMode::default());
        let facts = engram.facts();

        let added = facts.revise("sp", &[mk_candidate("user", "color", json!("teal"), 80)])?;
        assert_eq!(added.len(), 1);
        assert_eq!(added[0].action, RevisionOutcome::Add);
        let first_id = added[0].fact.fact_id.clone();

        let repeated = facts.revise("sp", &[mk_candidate("user", "color", json!("teal"), 80)])?;
        assert_eq!(repeated[0].action, RevisionOutcome::None);
        assert_eq!(repeated[0].fact.fact_id, first_id);

        let superseded =
            facts.revise("sp", &[mk_candidate("user", "color", json!("red"), 85)])?;
        assert_eq!(superseded[0].action, RevisionOutcome::Supersede);
        assert_eq!(superseded[0].superseded_fact_id.as_deref(), Some(first_id.as_str()));

        // Default listing and counting exclude the superseded fact.
        assert_eq!(facts.count(&FactQuery::in_space("sp"))?, 1);
        let all = facts.list(&FactQuery { include_inactive: true, ..FactQuery::in_space("sp") })?;
        assert_eq!(all.len(), 2);

        // The superseded fact stays retrievable with lineage intact.
        let old = facts
            .get(&first_id)?
            .ok_or_else(|| EngramError::Storage("missing superseded fact".to_string()))?;
        assert!(old.valid_until.is_some());
        assert_eq!(old.superseded_by.as_deref(), Some(superseded[0].fact.fact_id.as_str()));
        Ok(())
    }

    // Test IDs: TAP-021
    #[test]
    fn explicit_update_appends_to_the_same_fact_identity() -> Result<(), EngramError> {
        let engram = open_engram(TransactionMode::default());
        let facts = engram.facts();

        let added = facts.revise("sp", &[mk_candidate("user", "role", json!("dev"), 80)])?;
        let fact_id = added[0].fact.fact_id.clone();

        let mut correction = mk_candidate("user", "role", json!("staff dev"), 85);
        correction.update_of = Some(fact_id.clone());
        let updated = facts.revise("sp", &[correction])?;

        assert_eq!(updated[0].action, RevisionOutcome::Update);
        assert_eq!(updated[0].fact.fact_id, fact_id);
        assert_eq!(updated[0].fact.chain.version, 2);
        assert_eq!(facts.history(&fact_id)?.len(), 2);
        // An update never changes the active-fact count.
        assert_eq!(facts.count(&FactQuery::in_space("sp"))?, 1);
        Ok(())
    }

    // Test IDs: TAP-030
    #[test]
    fn transitions_are_idempotent_and_stamp_completion() -> Result<(), EngramError> {
        let engram = open_engram(TransactionMode::default());
        let contexts = engram.contexts();

        let created =
            contexts.create("sp", Some("ctx-a".to_string()), json!({"goal": "ship"}), None)?;
        assert_eq!(created.chain.version, 1);

        let unchanged = contexts.set_status("ctx-a", "active")?;
        assert_eq!(unchanged.chain.version, 1);

        let completed = contexts.set_status("ctx-a", "completed")?;
        assert_eq!(completed.chain.version, 2);
        // Non-status fields carry over verbatim.
        assert_eq!(completed.chain.data.get("data"), Some(&json!({"goal": "ship"})));
        assert_eq!(completed.chain.data.get("data"), created.chain.data.get("data"));
        assert!(completed
            .chain
            .data
            .get("completed_at")
            .and_then(Value::as_str)
            .is_some());

        match contexts.set_status("ctx-a", "nonsense") {
            Ok(_) => panic!("unknown status token should be rejected"),
            Err(err) => assert_code(&err, "INVALID_STATUS_VALUE"),
        }
        Ok(())
    }

    // Test IDs: TAP-031
    #[test]
    fn parent_transition_never_cascades_to_children() -> Result<(), EngramError> {
        let engram = open_engram(TransactionMode::default());
        let contexts = engram.contexts();

        contexts.create("sp", Some("parent".to_string()), json!({}), None)?;
        contexts.create("sp", Some("child".to_string()), json!({}), Some("parent".to_string()))?;

        contexts.set_status("parent", "completed")?;

        let child = contexts
            .get("child")?
            .ok_or_else(|| EngramError::Storage("missing child".to_string()))?;
        assert_eq!(child.chain.data.get("status"), Some(&json!("active")));

        let children = contexts.children("sp", "parent")?;
        assert_eq!(children.len(), 1);

        // Status listing reflects the transition immediately.
        let completed = contexts.list_by_status("sp", "completed")?;
        assert_eq!(completed.len(), 1);
        let active = contexts.list_by_status("sp", "active")?;
        assert!(active.iter().all(|record| record.record_id != "parent"));
        Ok(())
    }

    // Test IDs: TAP-040
    #[test]
    fn impossible_time_window_lists_empty_for_records_too() -> Result<(), EngramError> {
        let engram = open_engram(TransactionMode::default());
        let records = engram.records();
        records.store("doc", "doc-1", json!(1), StoreOptions::default())?;

        let now = OffsetDateTime::now_utc();
        let query = RecordQuery {
            updated_after: Some(now),
            updated_before: Some(now - time::Duration::seconds(1)),
            ..RecordQuery::of_type("doc")
        };
        assert!(records.list(&query)?.is_empty());
        assert_eq!(records.count(&query)?, 0);
        Ok(())
    }
}
