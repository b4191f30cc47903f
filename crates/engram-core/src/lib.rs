use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;
use ulid::Ulid;

/// Maximum byte length of namespaces, keys, record types, and identifiers.
pub const MAX_IDENT_BYTES: usize = 128;

/// Maximum serialized size of a stored value payload.
pub const MAX_VALUE_BYTES: usize = 1024 * 1024;

/// Maximum page size accepted by list operations.
pub const MAX_LIST_LIMIT: usize = 1000;

/// A candidate fact loses to the incumbent only when its confidence is more
/// than this many points below the incumbent's; recency wins otherwise.
pub const CONFIDENCE_TOLERANCE: u8 = 15;

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum EngramError {
    #[error("VALIDATION_ERROR: {0}")]
    Validation(String),
    #[error("IMMUTABLE_ENTRY_NOT_FOUND: no `{record_type}` record with id `{record_id}`")]
    RecordNotFound { record_type: String, record_id: String },
    #[error("MUTABLE_KEY_NOT_FOUND: no entry for key `{key}` in namespace `{namespace}`")]
    KeyNotFound { namespace: String, key: String },
    #[error("FACT_NOT_FOUND: no fact with id `{0}`")]
    FactNotFound(String),
    #[error("INVALID_STATUS_VALUE: `{value}` is not a valid {kind} status")]
    InvalidStatusValue { kind: &'static str, value: String },
    #[error("STORAGE_ERROR: {0}")]
    Storage(String),
    #[error("CONNECTION_ERROR: {0}")]
    Connection(String),
}

impl EngramError {
    /// Stable, greppable error code carried by every variant.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "VALIDATION_ERROR",
            Self::RecordNotFound { .. } => "IMMUTABLE_ENTRY_NOT_FOUND",
            Self::KeyNotFound { .. } => "MUTABLE_KEY_NOT_FOUND",
            Self::FactNotFound(_) => "FACT_NOT_FOUND",
            Self::InvalidStatusValue { .. } => "INVALID_STATUS_VALUE",
            Self::Storage(_) => "STORAGE_ERROR",
            Self::Connection(_) => "CONNECTION_ERROR",
        }
    }

    #[must_use]
    pub fn record_not_found(record_type: &str, record_id: &str) -> Self {
        Self::RecordNotFound {
            record_type: record_type.to_string(),
            record_id: record_id.to_string(),
        }
    }

    #[must_use]
    pub fn key_not_found(namespace: &str, key: &str) -> Self {
        Self::KeyNotFound { namespace: namespace.to_string(), key: key.to_string() }
    }
}

/// Mint a new identifier with a stable prefix, e.g. `fact-01HZ...`.
#[must_use]
pub fn new_prefixed_id(prefix: &str) -> String {
    format!("{prefix}-{}", Ulid::new())
}

fn check_ident(field: &'static str, value: &str) -> Result<(), EngramError> {
    if value.is_empty() {
        return Err(EngramError::Validation(format!("{field} MUST be non-empty")));
    }

    if value.len() > MAX_IDENT_BYTES {
        return Err(EngramError::Validation(format!(
            "{field} MUST be at most {MAX_IDENT_BYTES} bytes (got {})",
            value.len()
        )));
    }

    let mut chars = value.chars();
    if !chars.next().is_some_and(|ch| ch.is_ascii_alphanumeric()) {
        return Err(EngramError::Validation(format!(
            "{field} MUST start with an ASCII letter or digit: `{value}`"
        )));
    }

    if let Some(bad) = chars.find(|ch| {
        !(ch.is_ascii_alphanumeric() || matches!(*ch, '.' | '_' | ':' | '-'))
    }) {
        return Err(EngramError::Validation(format!(
            "{field} contains illegal character `{bad}`: `{value}`"
        )));
    }

    Ok(())
}

/// # Errors
/// Returns [`EngramError::Validation`] when the namespace is malformed.
pub fn validate_namespace(value: &str) -> Result<(), EngramError> {
    check_ident("namespace", value)
}

/// # Errors
/// Returns [`EngramError::Validation`] when the key is malformed.
pub fn validate_key(value: &str) -> Result<(), EngramError> {
    check_ident("key", value)
}

/// # Errors
/// Returns [`EngramError::Validation`] when the record type is malformed.
pub fn validate_record_type(value: &str) -> Result<(), EngramError> {
    check_ident("record type", value)
}

/// # Errors
/// Returns [`EngramError::Validation`] when the record id is malformed.
pub fn validate_record_id(value: &str) -> Result<(), EngramError> {
    check_ident("record id", value)
}

/// # Errors
/// Returns [`EngramError::Validation`] when the space id is malformed.
pub fn validate_space_id(value: &str) -> Result<(), EngramError> {
    check_ident("space id", value)
}

/// Reject payloads above [`MAX_VALUE_BYTES`] before any backend call.
///
/// # Errors
/// Returns [`EngramError::Validation`] for oversized or unserializable values.
pub fn validate_value_size(value: &Value) -> Result<(), EngramError> {
    let bytes = serde_json::to_vec(value)
        .map_err(|err| EngramError::Validation(format!("value is not serializable: {err}")))?;
    if bytes.len() > MAX_VALUE_BYTES {
        return Err(EngramError::Validation(format!(
            "value MUST serialize to at most {MAX_VALUE_BYTES} bytes (got {})",
            bytes.len()
        )));
    }
    Ok(())
}

/// # Errors
/// Returns [`EngramError::Validation`] when confidence is outside `0..=100`.
pub fn validate_confidence(value: u8) -> Result<(), EngramError> {
    if value > 100 {
        return Err(EngramError::Validation(format!(
            "confidence MUST be in 0..=100 (got {value})"
        )));
    }
    Ok(())
}

/// # Errors
/// Returns [`EngramError::Validation`] when the limit exceeds [`MAX_LIST_LIMIT`].
pub fn validate_limit(limit: Option<usize>) -> Result<(), EngramError> {
    if let Some(value) = limit {
        if value > MAX_LIST_LIMIT {
            return Err(EngramError::Validation(format!(
                "limit MUST be at most {MAX_LIST_LIMIT} (got {value})"
            )));
        }
    }
    Ok(())
}

#[must_use]
pub fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// One retained version snapshot: the payload and the instant it became
/// current.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VersionEntry<T> {
    pub version: u32,
    pub data: T,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
}

/// Append-only version chain shared by every versioned entity.
///
/// The current payload lives in `data`; each append moves the prior current
/// payload into `previous_versions`. History entries are never mutated once
/// superseded; pruning may drop the oldest of them but never the current
/// version.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VersionChain<T> {
    pub version: u32,
    pub data: T,
    #[serde(default = "Vec::new")]
    pub previous_versions: Vec<VersionEntry<T>>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

impl<T: Clone> VersionChain<T> {
    #[must_use]
    pub fn new(data: T, now: OffsetDateTime) -> Self {
        Self { version: 1, data, previous_versions: Vec::new(), created_at: now, updated_at: now }
    }

    /// Install `data` as the new current version, retiring the prior current
    /// payload into history.
    pub fn append(&mut self, data: T, now: OffsetDateTime) {
        let prior = std::mem::replace(&mut self.data, data);
        self.previous_versions.push(VersionEntry {
            version: self.version,
            data: prior,
            timestamp: self.updated_at,
        });
        self.version += 1;
        self.updated_at = now;
    }

    /// Number of versions still retrievable (history plus current).
    #[must_use]
    pub fn retained_versions(&self) -> usize {
        self.previous_versions.len() + 1
    }

    /// Fetch one version by number; absent when it never existed or was
    /// pruned.
    #[must_use]
    pub fn get_version(&self, version: u32) -> Option<VersionEntry<T>> {
        if version == self.version {
            return Some(VersionEntry {
                version: self.version,
                data: self.data.clone(),
                timestamp: self.updated_at,
            });
        }

        self.previous_versions.iter().find(|entry| entry.version == version).cloned()
    }

    /// The version whose lifetime interval contains `at`. The current version
    /// has an open-ended upper bound; instants before `created_at` (or before
    /// the oldest retained version after pruning) resolve to nothing.
    #[must_use]
    pub fn at_timestamp(&self, at: OffsetDateTime) -> Option<VersionEntry<T>> {
        if at < self.created_at {
            return None;
        }

        if at >= self.updated_at {
            return self.get_version(self.version);
        }

        self.previous_versions.iter().rev().find(|entry| at >= entry.timestamp).cloned()
    }

    /// All retained versions, oldest first, current last.
    #[must_use]
    pub fn history(&self) -> Vec<VersionEntry<T>> {
        let mut entries = self.previous_versions.clone();
        entries.push(VersionEntry {
            version: self.version,
            data: self.data.clone(),
            timestamp: self.updated_at,
        });
        entries
    }

    /// Drop the oldest history entries until at most `keep_latest` versions
    /// remain (the current version always survives). Returns how many entries
    /// were purged.
    pub fn prune(&mut self, keep_latest: usize) -> usize {
        let keep = keep_latest.max(1);
        let total = self.retained_versions();
        if total <= keep {
            return 0;
        }

        let purge = total - keep;
        self.previous_versions.drain(..purge);
        purge
    }

    /// Check append-only lineage invariants.
    ///
    /// # Errors
    /// Returns [`EngramError::Validation`] when the chain shape is corrupt.
    pub fn validate(&self) -> Result<(), EngramError> {
        if self.version == 0 {
            return Err(EngramError::Validation(
                "version MUST be >= 1 for append-only lineage".to_string(),
            ));
        }

        if self.retained_versions() > self.version as usize {
            return Err(EngramError::Validation(
                "history MUST NOT hold more entries than the current version".to_string(),
            ));
        }

        if let Some(last) = self.previous_versions.last() {
            if last.version != self.version - 1 {
                return Err(EngramError::Validation(
                    "history MUST end at the version preceding the current one".to_string(),
                ));
            }
        }

        for pair in self.previous_versions.windows(2) {
            if pair[1].version != pair[0].version + 1 {
                return Err(EngramError::Validation(
                    "history versions MUST be consecutive".to_string(),
                ));
            }
        }

        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SortOrder {
    Asc,
    #[default]
    Desc,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RecordSort {
    CreatedAt,
    #[default]
    UpdatedAt,
    RecordId,
}

/// Filter for listing/counting versioned records of one type.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecordQuery {
    pub record_type: String,
    pub space_id: Option<String>,
    pub user_id: Option<String>,
    pub updated_after: Option<OffsetDateTime>,
    pub updated_before: Option<OffsetDateTime>,
    pub limit: Option<usize>,
    pub sort_by: RecordSort,
    pub sort_order: SortOrder,
}

impl RecordQuery {
    #[must_use]
    pub fn of_type(record_type: impl Into<String>) -> Self {
        Self { record_type: record_type.into(), ..Self::default() }
    }

    #[must_use]
    pub fn in_space(record_type: impl Into<String>, space_id: impl Into<String>) -> Self {
        Self {
            record_type: record_type.into(),
            space_id: Some(space_id.into()),
            ..Self::default()
        }
    }
}

/// A versioned document: `(record_type, record_id)` identity plus an embedded
/// append-only chain of JSON payloads. Metadata is carried forward across
/// appends; per-append overrides merge over it and never clear unspecified
/// keys.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VersionedRecord {
    pub record_type: String,
    pub record_id: String,
    #[serde(default)]
    pub space_id: Option<String>,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub metadata: BTreeMap<String, Value>,
    #[serde(flatten)]
    pub chain: VersionChain<Value>,
}

impl VersionedRecord {
    #[must_use]
    pub fn new(
        record_type: impl Into<String>,
        record_id: impl Into<String>,
        data: Value,
        now: OffsetDateTime,
    ) -> Self {
        Self {
            record_type: record_type.into(),
            record_id: record_id.into(),
            space_id: None,
            user_id: None,
            metadata: BTreeMap::new(),
            chain: VersionChain::new(data, now),
        }
    }

    /// Merge an override map into retained metadata. Keys absent from the
    /// override are preserved.
    pub fn apply_metadata_override(&mut self, overrides: BTreeMap<String, Value>) {
        for (key, value) in overrides {
            self.metadata.insert(key, value);
        }
    }
}

/// A mutable entry: last-write-wins value with no history.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MutableEntry {
    pub namespace: String,
    pub key: String,
    pub value: Value,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub metadata: BTreeMap<String, Value>,
    #[serde(default)]
    pub access_count: u64,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

impl MutableEntry {
    #[must_use]
    pub fn new(
        namespace: impl Into<String>,
        key: impl Into<String>,
        value: Value,
        now: OffsetDateTime,
    ) -> Self {
        Self {
            namespace: namespace.into(),
            key: key.into(),
            value,
            user_id: None,
            metadata: BTreeMap::new(),
            access_count: 0,
            created_at: now,
            updated_at: now,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EntrySort {
    Key,
    CreatedAt,
    #[default]
    UpdatedAt,
}

/// Filter for listing/counting mutable entries. The namespace is mandatory;
/// an impossible time window (`updated_after > updated_before`) simply
/// matches nothing.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EntryFilter {
    pub namespace: String,
    pub key_prefix: Option<String>,
    pub user_id: Option<String>,
    pub updated_after: Option<OffsetDateTime>,
    pub updated_before: Option<OffsetDateTime>,
    pub limit: Option<usize>,
    pub sort_by: EntrySort,
    pub sort_order: SortOrder,
}

impl EntryFilter {
    #[must_use]
    pub fn in_namespace(namespace: impl Into<String>) -> Self {
        Self { namespace: namespace.into(), ..Self::default() }
    }

    /// Whether `entry` satisfies every non-pagination predicate.
    #[must_use]
    pub fn matches(&self, entry: &MutableEntry) -> bool {
        if entry.namespace != self.namespace {
            return false;
        }
        if let Some(prefix) = &self.key_prefix {
            if !entry.key.starts_with(prefix.as_str()) {
                return false;
            }
        }
        if let Some(user_id) = &self.user_id {
            if entry.user_id.as_deref() != Some(user_id.as_str()) {
                return false;
            }
        }
        if let Some(after) = self.updated_after {
            if entry.updated_at <= after {
                return false;
            }
        }
        if let Some(before) = self.updated_before {
            if entry.updated_at >= before {
                return false;
            }
        }
        true
    }
}

/// Apply an integer delta to a stored JSON value. A `null` current value
/// counts as zero; anything non-numeric is rejected. Results may go negative.
///
/// # Errors
/// Returns [`EngramError::Validation`] for non-numeric values and overflow.
pub fn apply_numeric_delta(current: &Value, delta: i64) -> Result<Value, EngramError> {
    match current {
        Value::Null => Ok(Value::from(delta)),
        Value::Number(number) => {
            if let Some(value) = number.as_i64() {
                let next = value.checked_add(delta).ok_or_else(|| {
                    EngramError::Validation(format!(
                        "integer overflow applying delta {delta} to {value}"
                    ))
                })?;
                return Ok(Value::from(next));
            }

            if let Some(value) = number.as_f64() {
                #[allow(clippy::cast_precision_loss)]
                let next = value + delta as f64;
                return serde_json::Number::from_f64(next).map(Value::Number).ok_or_else(|| {
                    EngramError::Validation(format!("non-finite result applying delta {delta}"))
                });
            }

            Err(EngramError::Validation("numeric value is out of supported range".to_string()))
        }
        other => Err(EngramError::Validation(format!(
            "cannot apply numeric delta to {} value",
            json_type_name(other)
        ))),
    }
}

fn default_amount() -> i64 {
    1
}

/// One step of a multi-operation batch against the mutable store.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum KvOperation {
    Set {
        namespace: String,
        key: String,
        value: Value,
        #[serde(default)]
        user_id: Option<String>,
    },
    Update {
        namespace: String,
        key: String,
        value: Value,
    },
    Increment {
        namespace: String,
        key: String,
        #[serde(default = "default_amount")]
        amount: i64,
    },
    Decrement {
        namespace: String,
        key: String,
        #[serde(default = "default_amount")]
        amount: i64,
    },
    Delete {
        namespace: String,
        key: String,
    },
}

impl KvOperation {
    #[must_use]
    pub fn namespace(&self) -> &str {
        match self {
            Self::Set { namespace, .. }
            | Self::Update { namespace, .. }
            | Self::Increment { namespace, .. }
            | Self::Decrement { namespace, .. }
            | Self::Delete { namespace, .. } => namespace,
        }
    }

    #[must_use]
    pub fn key(&self) -> &str {
        match self {
            Self::Set { key, .. }
            | Self::Update { key, .. }
            | Self::Increment { key, .. }
            | Self::Decrement { key, .. }
            | Self::Delete { key, .. } => key,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum FactType {
    Identity,
    Preference,
    Knowledge,
    Observation,
    Relationship,
    Event,
}

impl FactType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Identity => "identity",
            Self::Preference => "preference",
            Self::Knowledge => "knowledge",
            Self::Observation => "observation",
            Self::Relationship => "relationship",
            Self::Event => "event",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "identity" => Some(Self::Identity),
            "preference" => Some(Self::Preference),
            "knowledge" => Some(Self::Knowledge),
            "observation" => Some(Self::Observation),
            "relationship" => Some(Self::Relationship),
            "event" => Some(Self::Event),
            _ => None,
        }
    }
}

/// The versioned payload of a fact.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FactData {
    pub subject: String,
    pub predicate: String,
    pub object: Value,
    pub fact_type: FactType,
    pub confidence: u8,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub source_type: Option<String>,
}

impl FactData {
    /// # Errors
    /// Returns [`EngramError::Validation`] for malformed subject/predicate,
    /// out-of-range confidence, or an oversized object payload.
    pub fn validate(&self) -> Result<(), EngramError> {
        if self.subject.trim().is_empty() {
            return Err(EngramError::Validation("fact subject MUST be non-empty".to_string()));
        }
        if self.predicate.trim().is_empty() {
            return Err(EngramError::Validation("fact predicate MUST be non-empty".to_string()));
        }
        validate_confidence(self.confidence)?;
        validate_value_size(&self.object)
    }
}

/// A fact: a versioned record specialization with belief-revision lineage.
/// `valid_until` is set when the fact is superseded; inactive facts drop out
/// of default listing and counting but stay readable by id and via history.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Fact {
    pub fact_id: String,
    pub space_id: String,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub valid_until: Option<OffsetDateTime>,
    #[serde(default)]
    pub supersedes: Option<String>,
    #[serde(default)]
    pub superseded_by: Option<String>,
    #[serde(default)]
    pub metadata: BTreeMap<String, Value>,
    #[serde(flatten)]
    pub chain: VersionChain<FactData>,
}

impl Fact {
    #[must_use]
    pub fn new(space_id: impl Into<String>, data: FactData, now: OffsetDateTime) -> Self {
        Self {
            fact_id: new_prefixed_id("fact"),
            space_id: space_id.into(),
            valid_until: None,
            supersedes: None,
            superseded_by: None,
            metadata: BTreeMap::new(),
            chain: VersionChain::new(data, now),
        }
    }

    #[must_use]
    pub fn data(&self) -> &FactData {
        &self.chain.data
    }

    #[must_use]
    pub fn is_active(&self) -> bool {
        self.valid_until.is_none()
    }
}

/// A candidate fact extracted from an interaction, before revision.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FactCandidate {
    pub subject: String,
    pub predicate: String,
    pub object: Value,
    pub fact_type: FactType,
    pub confidence: u8,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub source_type: Option<String>,
    /// Explicit correction target: append a new version onto this existing
    /// fact identity instead of running conflict reasoning.
    #[serde(default)]
    pub update_of: Option<String>,
}

impl FactCandidate {
    #[must_use]
    pub fn into_data(self) -> FactData {
        FactData {
            subject: self.subject,
            predicate: self.predicate,
            object: self.object,
            fact_type: self.fact_type,
            confidence: self.confidence,
            tags: self.tags,
            source_type: self.source_type,
        }
    }
}

/// Serialized decision label, one per candidate fact processed.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum RevisionOutcome {
    Add,
    Update,
    Supersede,
    None,
}

impl RevisionOutcome {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Add => "ADD",
            Self::Update => "UPDATE",
            Self::Supersede => "SUPERSEDE",
            Self::None => "NONE",
        }
    }
}

/// The decision produced for one candidate against the current active set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RevisionAction {
    Add,
    Update { fact_id: String },
    Supersede { fact_id: String },
    None { fact_id: String },
}

/// Two fact objects carry the same semantic content when their strings match
/// after trimming and ASCII case folding; all other shapes compare
/// structurally.
#[must_use]
pub fn objects_equivalent(left: &Value, right: &Value) -> bool {
    match (left, right) {
        (Value::String(a), Value::String(b)) => a.trim().eq_ignore_ascii_case(b.trim()),
        _ => left == right,
    }
}

fn most_recent_match<'a>(candidate: &FactCandidate, active: &'a [Fact]) -> Option<&'a Fact> {
    active
        .iter()
        .filter(|fact| {
            fact.is_active()
                && fact.data().subject == candidate.subject
                && fact.data().predicate == candidate.predicate
        })
        .max_by(|a, b| {
            a.chain
                .updated_at
                .cmp(&b.chain.updated_at)
                .then_with(|| a.fact_id.cmp(&b.fact_id))
        })
}

/// Full belief revision: decide ADD / UPDATE / SUPERSEDE / NONE for one
/// candidate against the active facts of its `(subject, predicate)` slot.
#[must_use]
pub fn decide_revision(candidate: &FactCandidate, active: &[Fact]) -> RevisionAction {
    if let Some(target) = &candidate.update_of {
        return RevisionAction::Update { fact_id: target.clone() };
    }

    let Some(existing) = most_recent_match(candidate, active) else {
        return RevisionAction::Add;
    };

    if objects_equivalent(&existing.data().object, &candidate.object) {
        return RevisionAction::None { fact_id: existing.fact_id.clone() };
    }

    let incumbent = u16::from(existing.data().confidence);
    let challenger = u16::from(candidate.confidence) + u16::from(CONFIDENCE_TOLERANCE);
    if challenger >= incumbent {
        RevisionAction::Supersede { fact_id: existing.fact_id.clone() }
    } else {
        RevisionAction::None { fact_id: existing.fact_id.clone() }
    }
}

/// Dedup-only path used when belief revision is disabled: an exact duplicate
/// is a NONE, anything else is an ADD. No SUPERSEDE/UPDATE reasoning.
#[must_use]
pub fn decide_dedup(candidate: &FactCandidate, active: &[Fact]) -> RevisionAction {
    let duplicate = active.iter().find(|fact| {
        fact.is_active()
            && fact.data().subject == candidate.subject
            && fact.data().predicate == candidate.predicate
            && fact.data().object == candidate.object
    });

    match duplicate {
        Some(existing) => RevisionAction::None { fact_id: existing.fact_id.clone() },
        None => RevisionAction::Add,
    }
}

/// Filter for listing/counting facts. Superseded facts are excluded unless
/// `include_inactive` is set.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FactQuery {
    pub space_id: String,
    pub subject: Option<String>,
    pub predicate: Option<String>,
    pub fact_type: Option<FactType>,
    pub tag: Option<String>,
    pub min_confidence: Option<u8>,
    pub include_inactive: bool,
    pub limit: Option<usize>,
}

impl FactQuery {
    #[must_use]
    pub fn in_space(space_id: impl Into<String>) -> Self {
        Self { space_id: space_id.into(), ..Self::default() }
    }

    #[must_use]
    pub fn slot(
        space_id: impl Into<String>,
        subject: impl Into<String>,
        predicate: impl Into<String>,
    ) -> Self {
        Self {
            space_id: space_id.into(),
            subject: Some(subject.into()),
            predicate: Some(predicate.into()),
            ..Self::default()
        }
    }

    /// Whether `fact` satisfies every non-pagination predicate.
    #[must_use]
    pub fn matches(&self, fact: &Fact) -> bool {
        if fact.space_id != self.space_id {
            return false;
        }
        if !self.include_inactive && !fact.is_active() {
            return false;
        }
        if let Some(subject) = &self.subject {
            if &fact.data().subject != subject {
                return false;
            }
        }
        if let Some(predicate) = &self.predicate {
            if &fact.data().predicate != predicate {
                return false;
            }
        }
        if let Some(fact_type) = self.fact_type {
            if fact.data().fact_type != fact_type {
                return false;
            }
        }
        if let Some(tag) = &self.tag {
            if !fact.data().tags.iter().any(|candidate| candidate == tag) {
                return false;
            }
        }
        if let Some(min) = self.min_confidence {
            if fact.data().confidence < min {
                return false;
            }
        }
        true
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Space,
    Context,
    Agent,
}

impl EntityKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Space => "space",
            Self::Context => "context",
            Self::Agent => "agent",
        }
    }

    /// The record type under which this entity kind is persisted.
    #[must_use]
    pub fn record_type(self) -> &'static str {
        self.as_str()
    }

    #[must_use]
    pub fn status_values(self) -> &'static [&'static str] {
        match self {
            Self::Space => &["active", "archived"],
            Self::Context => &["active", "blocked", "completed", "cancelled"],
            Self::Agent => &["active", "paused", "retired"],
        }
    }

    /// Declared legal edges. Advisory: transitions outside this list are
    /// accepted by the validator, which only hard-rejects unknown status
    /// tokens.
    #[must_use]
    pub fn declared_edges(self) -> &'static [(&'static str, &'static str)] {
        match self {
            Self::Space => &[("active", "archived"), ("archived", "active")],
            Self::Context => &[
                ("active", "blocked"),
                ("blocked", "active"),
                ("active", "completed"),
                ("completed", "active"),
                ("active", "cancelled"),
                ("blocked", "cancelled"),
            ],
            Self::Agent => &[
                ("active", "paused"),
                ("paused", "active"),
                ("active", "retired"),
                ("paused", "retired"),
            ],
        }
    }

    /// # Errors
    /// Returns [`EngramError::InvalidStatusValue`] for unknown tokens.
    pub fn parse_status(self, value: &str) -> Result<(), EngramError> {
        if self.status_values().contains(&value) {
            Ok(())
        } else {
            Err(EngramError::InvalidStatusValue { kind: self.as_str(), value: value.to_string() })
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SpaceStatus {
    #[default]
    Active,
    Archived,
}

impl SpaceStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Archived => "archived",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ContextStatus {
    #[default]
    Active,
    Blocked,
    Completed,
    Cancelled,
}

impl ContextStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Blocked => "blocked",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    #[default]
    Active,
    Paused,
    Retired,
}

impl AgentStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Paused => "paused",
            Self::Retired => "retired",
        }
    }
}

/// Outcome of checking one status transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransitionCheck {
    /// `from == to`: an idempotent success that must not rewrite the entity.
    pub noop: bool,
    /// Whether the edge appears in the kind's declared edge list.
    pub declared: bool,
}

/// Validate a status transition. Unknown target tokens are rejected; edges
/// outside the declared list pass with `declared == false` so callers can
/// surface the mismatch without refusing previously-accepted transitions.
///
/// # Errors
/// Returns [`EngramError::InvalidStatusValue`] when `to` is not a status of
/// this kind, and [`EngramError::Storage`] when the stored `from` status is
/// itself unknown.
pub fn check_transition(
    kind: EntityKind,
    from: &str,
    to: &str,
) -> Result<TransitionCheck, EngramError> {
    kind.parse_status(to)?;

    if kind.parse_status(from).is_err() {
        return Err(EngramError::Storage(format!(
            "persisted {} status `{from}` is not a known value",
            kind.as_str()
        )));
    }

    let noop = from == to;
    let declared = noop || kind.declared_edges().contains(&(from, to));
    Ok(TransitionCheck { noop, declared })
}

/// Write decision returned by a record read-modify-write closure.
#[derive(Debug, Clone)]
pub enum RecordWrite {
    Put(VersionedRecord),
    Delete,
    Keep,
}

/// Write decision returned by a fact read-modify-write closure.
#[derive(Debug, Clone)]
pub enum FactWrite {
    Put(Fact),
    Delete,
    Keep,
}

/// Write decision returned by an entry read-modify-write closure.
#[derive(Debug, Clone)]
pub enum EntryWrite {
    Put(MutableEntry),
    Delete,
    Keep,
}

/// The single external primitive the library depends on: durable storage with
/// read-after-write consistency and atomic read-modify-write of one document.
/// Each `modify_*` call runs its closure against the current committed state
/// and applies the returned write atomically, returning the resulting state.
/// The library provides no cross-call mutual exclusion beyond that.
pub trait Backend: Send + Sync {
    /// # Errors
    /// Returns [`EngramError::Storage`] on backend failure.
    fn get_record(
        &self,
        record_type: &str,
        record_id: &str,
    ) -> Result<Option<VersionedRecord>, EngramError>;

    /// # Errors
    /// Propagates closure errors unchanged; [`EngramError::Storage`] on
    /// backend failure.
    fn modify_record(
        &self,
        record_type: &str,
        record_id: &str,
        op: &mut dyn FnMut(Option<VersionedRecord>) -> Result<RecordWrite, EngramError>,
    ) -> Result<Option<VersionedRecord>, EngramError>;

    /// # Errors
    /// Returns [`EngramError::Storage`] on backend failure.
    fn list_records(&self, query: &RecordQuery) -> Result<Vec<VersionedRecord>, EngramError>;

    /// # Errors
    /// Returns [`EngramError::Storage`] on backend failure.
    fn get_fact(&self, fact_id: &str) -> Result<Option<Fact>, EngramError>;

    /// # Errors
    /// Propagates closure errors unchanged; [`EngramError::Storage`] on
    /// backend failure.
    fn modify_fact(
        &self,
        fact_id: &str,
        op: &mut dyn FnMut(Option<Fact>) -> Result<FactWrite, EngramError>,
    ) -> Result<Option<Fact>, EngramError>;

    /// # Errors
    /// Returns [`EngramError::Storage`] on backend failure.
    fn list_facts(&self, query: &FactQuery) -> Result<Vec<Fact>, EngramError>;

    /// Persist the retired fact and its replacement together where the
    /// backend can make the pair atomic.
    ///
    /// # Errors
    /// Returns [`EngramError::Storage`] on backend failure.
    fn supersede_fact(&self, retired: &Fact, replacement: &Fact) -> Result<(), EngramError>;

    /// # Errors
    /// Returns [`EngramError::Storage`] on backend failure.
    fn get_entry(&self, namespace: &str, key: &str) -> Result<Option<MutableEntry>, EngramError>;

    /// # Errors
    /// Propagates closure errors unchanged; [`EngramError::Storage`] on
    /// backend failure.
    fn modify_entry(
        &self,
        namespace: &str,
        key: &str,
        op: &mut dyn FnMut(Option<MutableEntry>) -> Result<EntryWrite, EngramError>,
    ) -> Result<Option<MutableEntry>, EngramError>;

    /// # Errors
    /// Returns [`EngramError::Storage`] on backend failure.
    fn list_entries(&self, filter: &EntryFilter) -> Result<Vec<MutableEntry>, EngramError>;

    /// Best-effort access-count bump; failures are ignored by design of the
    /// metric, so this cannot error.
    fn record_access(&self, namespace: &str, key: &str);
}
