use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Result};
use engram_api::{
    ContentSummarizer, EmbeddingProvider, Engram, EngramConfig, FactExtractor, GraphSink,
    GraphSyncConfig, Hooks, MessageRole, RememberRequest, SetOptions, StoreOptions,
};
use engram_core::{
    EngramError, EntryFilter, Fact, FactCandidate, FactQuery, FactType, RecordQuery,
    RevisionOutcome,
};
use engram_store_sqlite::SqliteBackend;
use serde_json::{json, Value};

fn open_engram() -> Result<Engram> {
    open_engram_with(EngramConfig::default())
}

fn open_engram_with(config: EngramConfig) -> Result<Engram> {
    let backend = SqliteBackend::open_in_memory()?;
    backend.migrate()?;
    Ok(Engram::new(Arc::new(backend), config))
}

/// Returns the same candidate set on every extraction call.
struct FixedExtractor {
    candidates: Vec<FactCandidate>,
}

impl FactExtractor for FixedExtractor {
    fn extract_facts(
        &self,
        _user_text: &str,
        _agent_text: &str,
    ) -> Result<Vec<FactCandidate>, EngramError> {
        Ok(self.candidates.clone())
    }
}

/// Deterministic toy embedder: an 8-bucket ASCII histogram. Identical texts
/// embed identically, which is all the ranking assertions need.
struct HistogramEmbedder;

impl EmbeddingProvider for HistogramEmbedder {
    fn embed(&self, text: &str) -> Result<Vec<f32>, EngramError> {
        let mut buckets = [0.0_f32; 8];
        for byte in text.bytes() {
            buckets[usize::from(byte) % 8] += 1.0;
        }
        Ok(buckets.to_vec())
    }
}

struct PrefixSummarizer;

impl ContentSummarizer for PrefixSummarizer {
    fn summarize(
        &self,
        user_text: &str,
        _agent_text: &str,
    ) -> Result<Option<String>, EngramError> {
        Ok(Some(format!("summary: {user_text}")))
    }
}

/// Records every synced fact; optionally fails to exercise the best-effort
/// contract.
struct RecordingSink {
    synced: Mutex<Vec<String>>,
    fail: bool,
}

impl RecordingSink {
    fn new(fail: bool) -> Self {
        Self { synced: Mutex::new(Vec::new()), fail }
    }

    fn synced_ids(&self) -> Vec<String> {
        match self.synced.lock() {
            Ok(guard) => guard.clone(),
            Err(_) => Vec::new(),
        }
    }
}

impl GraphSink for RecordingSink {
    fn sync_fact(&self, _space_id: &str, fact: &Fact) -> Result<(), EngramError> {
        if self.fail {
            return Err(EngramError::Connection("graph endpoint unreachable".to_string()));
        }
        if let Ok(mut guard) = self.synced.lock() {
            guard.push(fact.fact_id.clone());
        }
        Ok(())
    }
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

// Test IDs: TFL-001
#[test]
fn remember_writes_every_layer_and_reports_revisions() -> Result<()> {
    let engram = open_engram()?;
    let sink = Arc::new(RecordingSink::new(false));
    let memory = engram.memory(Hooks {
        fact_extractor: Some(Arc::new(FixedExtractor {
            candidates: vec![mk_candidate("user", "favorite_color", json!("teal"), 80)],
        })),
        embedding_provider: Some(Arc::new(HistogramEmbedder)),
        content_summarizer: Some(Arc::new(PrefixSummarizer)),
        graph_sink: Some(Arc::clone(&sink) as Arc<dyn GraphSink>),
    });

    let result = memory.remember(&RememberRequest {
        space_id: "sp".to_string(),
        user_id: Some("alice".to_string()),
        conversation_id: None,
        user_text: "my favorite color is teal".to_string(),
        agent_text: "noted!".to_string(),
        belief_revision: true,
    })?;

    // Conversation plus both messages exist.
    let log = engram.conversations();
    assert_eq!(log.count_messages(&result.conversation_id)?, 2);
    let messages = log.list_messages(&result.conversation_id, None)?;
    assert_eq!(
        messages[0].chain.data.get("role").and_then(Value::as_str),
        Some(MessageRole::User.as_str())
    );

    // The memory carries the summarized content and an embedding.
    let stored = memory
        .get(&result.memory_id)?
        .ok_or_else(|| anyhow!("memory should exist"))?;
    assert_eq!(
        stored.chain.data.get("content").and_then(Value::as_str),
        Some("summary: my favorite color is teal")
    );
    assert!(stored.chain.data.get("embedding").is_some());

    // Belief revision ran and reported one ADD.
    let revisions = result.fact_revisions.ok_or_else(|| anyhow!("revisions should be present"))?;
    assert_eq!(revisions.len(), 1);
    assert_eq!(revisions[0].action, RevisionOutcome::Add);

    // Graph sync is off (no opt-in), so nothing was mirrored.
    assert!(sink.synced_ids().is_empty());
    Ok(())
}

// Test IDs: TFL-002
#[test]
fn disabled_belief_revision_omits_the_revision_field_entirely() -> Result<()> {
    let engram = open_engram()?;
    let memory = engram.memory(Hooks {
        fact_extractor: Some(Arc::new(FixedExtractor {
            candidates: vec![mk_candidate("user", "favorite_color", json!("teal"), 80)],
        })),
        ..Hooks::default()
    });

    let request = RememberRequest {
        space_id: "sp".to_string(),
        user_id: None,
        conversation_id: None,
        user_text: "color talk".to_string(),
        agent_text: "ok".to_string(),
        belief_revision: false,
    };

    let result = memory.remember(&request)?;
    assert!(result.fact_revisions.is_none());
    let serialized = serde_json::to_value(&result)?;
    assert!(serialized.get("fact_revisions").is_none());

    // The fact was still stored (dedup path), and repeating the exchange
    // does not duplicate it.
    assert_eq!(engram.facts().count(&FactQuery::in_space("sp"))?, 1);
    memory.remember(&request)?;
    assert_eq!(engram.facts().count(&FactQuery::in_space("sp"))?, 1);

    // A conflicting object on the same slot is ADDED in dedup mode: the
    // single-active-fact invariant only holds under full belief revision.
    let conflicting = engram.memory(Hooks {
        fact_extractor: Some(Arc::new(FixedExtractor {
            candidates: vec![mk_candidate("user", "favorite_color", json!("red"), 90)],
        })),
        ..Hooks::default()
    });
    conflicting.remember(&request)?;
    assert_eq!(engram.facts().count(&FactQuery::in_space("sp"))?, 2);
    Ok(())
}

// Test IDs: TFL-003
#[test]
fn supersession_keeps_history_reachable_but_out_of_default_lists() -> Result<()> {
    let engram = open_engram()?;
    let facts = engram.facts();

    let added = facts.revise("sp", &[mk_candidate("user", "city", json!("Lisbon"), 70)])?;
    let first_id = added[0].fact.fact_id.clone();

    let superseded = facts.revise("sp", &[mk_candidate("user", "city", json!("Porto"), 75)])?;
    assert_eq!(superseded[0].action, RevisionOutcome::Supersede);

    // Default list and count agree and exclude the retired fact.
    let active = facts.list(&FactQuery::in_space("sp"))?;
    assert_eq!(active.len(), facts.count(&FactQuery::in_space("sp"))?);
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].data().object, json!("Porto"));

    // Explicit access still reaches the retired fact and its chain.
    let retired = facts.get(&first_id)?.ok_or_else(|| anyhow!("retired fact"))?;
    assert!(!retired.is_active());
    assert_eq!(facts.history(&first_id)?.len(), 1);
    Ok(())
}

// Test IDs: TFL-004
#[test]
fn graph_sync_gates_and_best_effort_failure() -> Result<()> {
    // Both gates open: facts are mirrored.
    let engram = open_engram_with(EngramConfig {
        graph_sync: GraphSyncConfig {
            endpoint: Some("bolt://graph.internal:7687".to_string()),
            opt_in: true,
        },
        ..EngramConfig::default()
    })?;
    let sink = Arc::new(RecordingSink::new(false));
    let memory = engram.memory(Hooks {
        fact_extractor: Some(Arc::new(FixedExtractor {
            candidates: vec![mk_candidate("user", "likes", json!("tea"), 60)],
        })),
        graph_sink: Some(Arc::clone(&sink) as Arc<dyn GraphSink>),
        ..Hooks::default()
    });
    let request = RememberRequest {
        space_id: "sp".to_string(),
        user_id: None,
        conversation_id: None,
        user_text: "tea".to_string(),
        agent_text: "noted".to_string(),
        belief_revision: true,
    };
    memory.remember(&request)?;
    assert_eq!(sink.synced_ids().len(), 1);

    // Opt-in without credentials: silently disabled.
    let gated = open_engram_with(EngramConfig {
        graph_sync: GraphSyncConfig { endpoint: None, opt_in: true },
        ..EngramConfig::default()
    })?;
    let gated_sink = Arc::new(RecordingSink::new(false));
    let gated_memory = gated.memory(Hooks {
        fact_extractor: Some(Arc::new(FixedExtractor {
            candidates: vec![mk_candidate("user", "likes", json!("tea"), 60)],
        })),
        graph_sink: Some(Arc::clone(&gated_sink) as Arc<dyn GraphSink>),
        ..Hooks::default()
    });
    gated_memory.remember(&request)?;
    assert!(gated_sink.synced_ids().is_empty());

    // A failing sink never fails the write.
    let flaky = open_engram_with(EngramConfig {
        graph_sync: GraphSyncConfig {
            endpoint: Some("bolt://graph.internal:7687".to_string()),
            opt_in: true,
        },
        ..EngramConfig::default()
    })?;
    let failing_sink = Arc::new(RecordingSink::new(true));
    let flaky_memory = flaky.memory(Hooks {
        fact_extractor: Some(Arc::new(FixedExtractor {
            candidates: vec![mk_candidate("user", "likes", json!("tea"), 60)],
        })),
        graph_sink: Some(failing_sink as Arc<dyn GraphSink>),
        ..Hooks::default()
    });
    let result = flaky_memory.remember(&request)?;
    assert!(result.fact_revisions.is_some());
    assert_eq!(flaky.facts().count(&FactQuery::in_space("sp"))?, 1);
    Ok(())
}

// Test IDs: TFL-005
#[test]
fn search_ranks_by_vector_when_embedded_and_lexically_otherwise() -> Result<()> {
    let engram = open_engram()?;

    // Lexical path: no embedding provider anywhere.
    let lexical = engram.memory(Hooks::default());
    lexical.store("sp", None, "rust ownership and borrowing rules")?;
    lexical.store("sp", None, "gardening tips for spring")?;
    let hits = lexical.search("sp", "rust borrowing", 10)?;
    assert_eq!(hits.len(), 2);
    assert_eq!(
        hits[0].record.chain.data.get("content").and_then(Value::as_str),
        Some("rust ownership and borrowing rules")
    );
    assert!(hits[0].score > hits[1].score);

    // Vector path: identical text embeds identically and ranks first.
    let vectored = engram.memory(Hooks {
        embedding_provider: Some(Arc::new(HistogramEmbedder)),
        ..Hooks::default()
    });
    vectored.store("vec", None, "the quick brown fox")?;
    vectored.store("vec", None, "zzzzzzzzzzzzzzzzzzzzzzzz")?;
    let hits = vectored.search("vec", "the quick brown fox", 10)?;
    assert_eq!(
        hits[0].record.chain.data.get("content").and_then(Value::as_str),
        Some("the quick brown fox")
    );
    Ok(())
}

// Test IDs: TFL-006
#[test]
fn archive_and_restore_flip_default_visibility() -> Result<()> {
    let engram = open_engram()?;
    let memory = engram.memory(Hooks::default());

    let kept = memory.store("sp", None, "keep me")?;
    let shelved = memory.store("sp", None, "shelve me")?;

    memory.archive(&shelved.record_id)?;
    assert_eq!(memory.list("sp")?.len(), 1);
    assert!(memory.search("sp", "shelve", 10)?.iter().all(|hit| hit.score == 0.0));

    // Archiving is idempotent: no extra version is appended.
    let before = memory.get(&shelved.record_id)?.ok_or_else(|| anyhow!("memory"))?;
    memory.archive(&shelved.record_id)?;
    let after = memory.get(&shelved.record_id)?.ok_or_else(|| anyhow!("memory"))?;
    assert_eq!(before.chain.version, after.chain.version);

    memory.restore_from_archive(&shelved.record_id)?;
    assert_eq!(memory.list("sp")?.len(), 2);

    memory.forget(&kept.record_id)?;
    assert_eq!(memory.list("sp")?.len(), 1);
    Ok(())
}

// Test IDs: TFL-007
#[test]
fn space_stats_track_logical_entities_not_versions() -> Result<()> {
    let engram = open_engram()?;
    let memory = engram.memory(Hooks::default());
    let stats = engram.stats();

    let baseline = stats.space_stats("sp")?;
    assert_eq!(baseline.total, 0);

    let result = memory.remember(&RememberRequest {
        space_id: "sp".to_string(),
        user_id: None,
        conversation_id: None,
        user_text: "hello".to_string(),
        agent_text: "hi".to_string(),
        belief_revision: true,
    })?;

    let after_remember = stats.space_stats("sp")?;
    assert_eq!(after_remember.conversations, 1);
    assert_eq!(after_remember.messages, 2);
    assert_eq!(after_remember.memories, 1);
    assert_eq!(after_remember.facts, 0);

    // A content update appends a version but moves no count.
    memory.update(&result.memory_id, "hello again")?;
    let after_update = stats.space_stats("sp")?;
    assert_eq!(after_update, after_remember);

    // Belief-revision ADD moves exactly the facts count by one.
    engram.facts().revise("sp", &[mk_candidate("user", "likes", json!("tea"), 60)])?;
    let after_fact = stats.space_stats("sp")?;
    assert_eq!(after_fact.facts, 1);
    assert_eq!(after_fact.total, after_update.total + 1);

    // SUPERSEDE retires one fact and adds one: the active count is unchanged.
    engram.facts().revise("sp", &[mk_candidate("user", "likes", json!("coffee"), 70)])?;
    assert_eq!(stats.space_stats("sp")?.facts, 1);

    // Archiving a memory removes it from the live count.
    memory.archive(&result.memory_id)?;
    assert_eq!(stats.space_stats("sp")?.memories, 0);
    Ok(())
}

// Test IDs: TFL-008
#[test]
fn kv_purge_surface_and_namespace_wipe() -> Result<()> {
    let engram = open_engram()?;
    let kv = engram.kv();

    for key in ["session:a", "session:b", "profile:a"] {
        kv.set("users", key, json!({"key": key}), SetOptions::default())?;
    }
    kv.set("other", "untouched", json!(1), SetOptions::default())?;

    let report = kv.purge_many(&EntryFilter {
        key_prefix: Some("session:".to_string()),
        ..EntryFilter::in_namespace("users")
    })?;
    assert_eq!(report.deleted, 2);
    assert_eq!(kv.count(&EntryFilter::in_namespace("users"))?, 1);

    let wiped = kv.purge_namespace("users")?;
    assert_eq!(wiped.deleted, 1);
    assert_eq!(kv.count(&EntryFilter::in_namespace("users"))?, 0);
    assert!(kv.exists("other", "untouched")?);

    // purge is a strict alias of delete, including its error.
    match kv.purge("users", "session:a") {
        Ok(_) => panic!("purge of a missing key should fail"),
        Err(err) => assert!(err.to_string().contains("MUTABLE_KEY_NOT_FOUND")),
    }
    Ok(())
}

// Test IDs: TFL-009
#[test]
fn update_closure_never_sees_absent_keys() -> Result<()> {
    let engram = open_engram()?;
    let kv = engram.kv();

    match kv.update("ns", "missing", |_| json!(1)) {
        Ok(_) => panic!("update on a missing key should fail"),
        Err(err) => assert!(err.to_string().contains("MUTABLE_KEY_NOT_FOUND")),
    }

    kv.set("ns", "present", json!({"n": 1}), SetOptions::default())?;
    let entry = kv.update("ns", "present", |value| {
        let n = value.get("n").and_then(Value::as_i64).unwrap_or(0);
        json!({"n": n + 1})
    })?;
    assert_eq!(entry.value, json!({"n": 2}));
    Ok(())
}

// Test IDs: TFL-010
#[test]
fn versioned_record_point_in_time_reads() -> Result<()> {
    let engram = open_engram()?;
    let records = engram.records();

    records.store("doc", "d", json!("one"), StoreOptions::default())?;
    let first = records.get("doc", "d")?.ok_or_else(|| anyhow!("record"))?;
    records.store("doc", "d", json!("two"), StoreOptions::default())?;
    let second = records.get("doc", "d")?.ok_or_else(|| anyhow!("record"))?;

    // Before creation: absent.
    let before = first.chain.created_at - time::Duration::seconds(1);
    assert!(records.get_at_timestamp("doc", "d", before)?.is_none());

    // At-or-after the newest version: the current payload.
    let at_latest = records.get_at_timestamp("doc", "d", second.chain.updated_at)?;
    assert_eq!(at_latest.map(|entry| entry.data), Some(json!("two")));
    Ok(())
}

// Test IDs: TFL-011
#[test]
fn metadata_overrides_merge_across_versions() -> Result<()> {
    let engram = open_engram()?;
    let records = engram.records();

    let mut first_meta = std::collections::BTreeMap::new();
    first_meta.insert("origin".to_string(), json!("import"));
    first_meta.insert("weight".to_string(), json!(1));
    records.store(
        "doc",
        "d",
        json!("one"),
        StoreOptions { metadata: Some(first_meta), ..StoreOptions::default() },
    )?;

    let mut second_meta = std::collections::BTreeMap::new();
    second_meta.insert("weight".to_string(), json!(2));
    let updated = records.store(
        "doc",
        "d",
        json!("two"),
        StoreOptions { metadata: Some(second_meta), ..StoreOptions::default() },
    )?;

    assert_eq!(updated.metadata.get("origin"), Some(&json!("import")));
    assert_eq!(updated.metadata.get("weight"), Some(&json!(2)));
    Ok(())
}

// Test IDs: TFL-012
#[test]
fn record_search_matches_current_payload_substrings() -> Result<()> {
    let engram = open_engram()?;
    let records = engram.records();

    records.store(
        "doc",
        "a",
        json!({"title": "Quarterly Report"}),
        StoreOptions { space_id: Some("sp".to_string()), ..StoreOptions::default() },
    )?;
    records.store(
        "doc",
        "b",
        json!({"title": "Meeting Notes"}),
        StoreOptions { space_id: Some("sp".to_string()), ..StoreOptions::default() },
    )?;

    let hits = records.search("doc", Some("sp"), "quarterly")?;
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].record_id, "a");

    // Superseded payloads are not searched.
    records.store("doc", "a", json!({"title": "Renamed"}), StoreOptions::default())?;
    assert!(records.search("doc", None, "quarterly")?.is_empty());
    Ok(())
}

// Test IDs: TFL-013
#[test]
fn purge_many_reports_every_deleted_record() -> Result<()> {
    let engram = open_engram()?;
    let records = engram.records();

    for id in ["a", "b", "c"] {
        records.store(
            "scratch",
            id,
            json!(id),
            StoreOptions { space_id: Some("sp".to_string()), ..StoreOptions::default() },
        )?;
    }

    let report = records.purge_many(&RecordQuery::in_space("scratch", "sp"))?;
    assert_eq!(report.deleted, 3);
    assert_eq!(report.record_ids.len(), 3);
    assert_eq!(records.count(&RecordQuery::in_space("scratch", "sp"))?, 0);
    Ok(())
}
