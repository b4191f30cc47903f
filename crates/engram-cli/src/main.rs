use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use engram_api::{
    Engram, EngramConfig, GraphSyncConfig, Hooks, RememberRequest, SetOptions, StoreOptions,
    TransactionMode,
};
use engram_core::{EntryFilter, FactCandidate, FactQuery, FactType, KvOperation, RecordQuery};
use engram_store_sqlite::SqliteBackend;
use serde_json::Value;
use time::OffsetDateTime;

const CLI_CONTRACT_VERSION: &str = "cli.v1";

#[derive(Debug, Parser)]
#[command(name = "engram")]
#[command(about = "Layered memory storage CLI")]
struct Cli {
    #[arg(long, default_value = "./engram.sqlite3")]
    db: PathBuf,

    /// Failure behavior of `kv transaction` batches.
    #[arg(long, value_enum, default_value = "pre-validated")]
    transaction_mode: TransactionModeArg,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Db {
        #[command(subcommand)]
        command: Box<DbCommand>,
    },
    Record {
        #[command(subcommand)]
        command: Box<RecordCommand>,
    },
    Kv {
        #[command(subcommand)]
        command: Box<KvCommand>,
    },
    Fact {
        #[command(subcommand)]
        command: Box<FactCommand>,
    },
    Space {
        #[command(subcommand)]
        command: Box<SpaceCommand>,
    },
    Context {
        #[command(subcommand)]
        command: Box<ContextCommand>,
    },
    Memory {
        #[command(subcommand)]
        command: Box<MemoryCommand>,
    },
}

#[derive(Debug, Subcommand)]
enum DbCommand {
    SchemaVersion,
    Migrate,
    Export(DbExportArgs),
    Import(DbImportArgs),
    Backup(DbBackupArgs),
    Restore(DbRestoreArgs),
    IntegrityCheck,
}

#[derive(Debug, Args)]
struct DbExportArgs {
    #[arg(long)]
    out: PathBuf,
}

#[derive(Debug, Args)]
struct DbImportArgs {
    #[arg(long = "in")]
    input: PathBuf,
    #[arg(long, default_value_t = true)]
    skip_existing: bool,
}

#[derive(Debug, Args)]
struct DbBackupArgs {
    #[arg(long)]
    out: PathBuf,
}

#[derive(Debug, Args)]
struct DbRestoreArgs {
    #[arg(long = "in")]
    input: PathBuf,
}

#[derive(Debug, Subcommand)]
enum RecordCommand {
    Store(RecordStoreArgs),
    Get(RecordRefArgs),
    History(RecordRefArgs),
    Version(RecordVersionArgs),
    At(RecordAtArgs),
    List(RecordListArgs),
    Count(RecordListArgs),
    Search(RecordSearchArgs),
    Purge(RecordRefArgs),
    PurgeVersions(RecordPurgeVersionsArgs),
}

#[derive(Debug, Args)]
struct RecordStoreArgs {
    #[arg(long = "type")]
    record_type: String,
    #[arg(long)]
    id: String,
    /// JSON payload for the new version.
    #[arg(long)]
    data: String,
    #[arg(long)]
    space: Option<String>,
    #[arg(long)]
    user: Option<String>,
}

#[derive(Debug, Args)]
struct RecordRefArgs {
    #[arg(long = "type")]
    record_type: String,
    #[arg(long)]
    id: String,
}

#[derive(Debug, Args)]
struct RecordVersionArgs {
    #[command(flatten)]
    record: RecordRefArgs,
    #[arg(long)]
    version: u32,
}

#[derive(Debug, Args)]
struct RecordAtArgs {
    #[command(flatten)]
    record: RecordRefArgs,
    /// RFC3339 timestamp to reconstruct at.
    #[arg(long)]
    at: String,
}

#[derive(Debug, Args)]
struct RecordListArgs {
    #[arg(long = "type")]
    record_type: String,
    #[arg(long)]
    space: Option<String>,
    #[arg(long)]
    limit: Option<usize>,
}

#[derive(Debug, Args)]
struct RecordSearchArgs {
    #[arg(long = "type")]
    record_type: String,
    #[arg(long)]
    space: Option<String>,
    #[arg(long)]
    text: String,
}

#[derive(Debug, Args)]
struct RecordPurgeVersionsArgs {
    #[command(flatten)]
    record: RecordRefArgs,
    #[arg(long)]
    keep: usize,
}

#[derive(Debug, Subcommand)]
enum KvCommand {
    Set(KvSetArgs),
    Get(KvRefArgs),
    GetRecord(KvRefArgs),
    Incr(KvDeltaArgs),
    Decr(KvDeltaArgs),
    Exists(KvRefArgs),
    Delete(KvRefArgs),
    List(KvListArgs),
    Count(KvListArgs),
    PurgeNamespace(KvNamespaceArgs),
    Transaction(KvTransactionArgs),
}

#[derive(Debug, Args)]
struct KvSetArgs {
    #[arg(long)]
    namespace: String,
    #[arg(long)]
    key: String,
    /// JSON value; `null` is itself a valid payload.
    #[arg(long)]
    value: String,
    #[arg(long)]
    user: Option<String>,
}

#[derive(Debug, Args)]
struct KvRefArgs {
    #[arg(long)]
    namespace: String,
    #[arg(long)]
    key: String,
}

#[derive(Debug, Args)]
struct KvDeltaArgs {
    #[command(flatten)]
    entry: KvRefArgs,
    #[arg(long, default_value_t = 1)]
    amount: i64,
}

#[derive(Debug, Args)]
struct KvListArgs {
    #[arg(long)]
    namespace: String,
    #[arg(long)]
    prefix: Option<String>,
    #[arg(long)]
    user: Option<String>,
    #[arg(long)]
    limit: Option<usize>,
}

#[derive(Debug, Args)]
struct KvNamespaceArgs {
    #[arg(long)]
    namespace: String,
}

#[derive(Debug, Args)]
struct KvTransactionArgs {
    /// JSON array of operations, e.g.
    /// `[{"op":"set","namespace":"c","key":"k","value":1}]`.
    #[arg(long)]
    ops: String,
}

#[derive(Debug, Subcommand)]
enum FactCommand {
    Add(FactAddArgs),
    Get(FactRefArgs),
    List(FactListArgs),
    Count(FactListArgs),
    History(FactRefArgs),
    Forget(FactRefArgs),
}

#[derive(Debug, Args)]
struct FactAddArgs {
    #[arg(long)]
    space: String,
    #[arg(long)]
    subject: String,
    #[arg(long)]
    predicate: String,
    /// JSON object payload.
    #[arg(long)]
    object: String,
    #[arg(long, value_enum)]
    fact_type: FactTypeArg,
    #[arg(long)]
    confidence: u8,
    #[arg(long = "tag")]
    tags: Vec<String>,
    /// Append a new version onto this fact id instead of conflict reasoning.
    #[arg(long)]
    update_of: Option<String>,
}

#[derive(Debug, Args)]
struct FactRefArgs {
    #[arg(long)]
    id: String,
}

#[derive(Debug, Args)]
struct FactListArgs {
    #[arg(long)]
    space: String,
    #[arg(long)]
    subject: Option<String>,
    #[arg(long)]
    predicate: Option<String>,
    #[arg(long, default_value_t = false)]
    include_inactive: bool,
    #[arg(long)]
    limit: Option<usize>,
}

#[derive(Debug, Subcommand)]
enum SpaceCommand {
    Create(SpaceCreateArgs),
    List,
    Stats(SpaceRefArgs),
    SetStatus(SpaceStatusArgs),
}

#[derive(Debug, Args)]
struct SpaceCreateArgs {
    #[arg(long)]
    id: String,
    #[arg(long)]
    name: Option<String>,
}

#[derive(Debug, Args)]
struct SpaceRefArgs {
    #[arg(long)]
    id: String,
}

#[derive(Debug, Args)]
struct SpaceStatusArgs {
    #[arg(long)]
    id: String,
    #[arg(long)]
    status: String,
}

#[derive(Debug, Subcommand)]
enum ContextCommand {
    Create(ContextCreateArgs),
    List(ContextListArgs),
    Children(ContextChildrenArgs),
    SetStatus(SpaceStatusArgs),
}

#[derive(Debug, Args)]
struct ContextCreateArgs {
    #[arg(long)]
    space: String,
    #[arg(long)]
    id: Option<String>,
    /// JSON payload preserved verbatim across status changes.
    #[arg(long, default_value = "{}")]
    data: String,
    #[arg(long)]
    parent: Option<String>,
}

#[derive(Debug, Args)]
struct ContextListArgs {
    #[arg(long)]
    space: String,
    #[arg(long)]
    status: Option<String>,
}

#[derive(Debug, Args)]
struct ContextChildrenArgs {
    #[arg(long)]
    space: String,
    #[arg(long)]
    parent: String,
}

#[derive(Debug, Subcommand)]
enum MemoryCommand {
    Remember(MemoryRememberArgs),
    Store(MemoryStoreArgs),
    Get(FactRefArgs),
    Search(MemorySearchArgs),
    List(MemoryListArgs),
    Archive(FactRefArgs),
    Restore(FactRefArgs),
    Forget(FactRefArgs),
}

#[derive(Debug, Args)]
struct MemoryRememberArgs {
    #[arg(long)]
    space: String,
    #[arg(long)]
    user: Option<String>,
    #[arg(long)]
    conversation: Option<String>,
    #[arg(long)]
    user_text: String,
    #[arg(long)]
    agent_text: String,
    #[arg(long, default_value_t = false)]
    no_belief_revision: bool,
}

#[derive(Debug, Args)]
struct MemoryStoreArgs {
    #[arg(long)]
    space: String,
    #[arg(long)]
    user: Option<String>,
    #[arg(long)]
    content: String,
}

#[derive(Debug, Args)]
struct MemorySearchArgs {
    #[arg(long)]
    space: String,
    #[arg(long)]
    query: String,
    #[arg(long, default_value_t = 10)]
    limit: usize,
}

#[derive(Debug, Args)]
struct MemoryListArgs {
    #[arg(long)]
    space: String,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum TransactionModeArg {
    Sequential,
    PreValidated,
}

impl TransactionModeArg {
    fn into_mode(self) -> TransactionMode {
        match self {
            Self::Sequential => TransactionMode::Sequential,
            Self::PreValidated => TransactionMode::PreValidated,
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum FactTypeArg {
    Identity,
    Preference,
    Knowledge,
    Observation,
    Relationship,
    Event,
}

impl FactTypeArg {
    fn into_fact_type(self) -> FactType {
        match self {
            Self::Identity => FactType::Identity,
            Self::Preference => FactType::Preference,
            Self::Knowledge => FactType::Knowledge,
            Self::Observation => FactType::Observation,
            Self::Relationship => FactType::Relationship,
            Self::Event => FactType::Event,
        }
    }
}

fn with_contract_version(value: Value) -> Value {
    match value {
        Value::Object(mut object) => {
            object.insert(
                "contract_version".to_string(),
                Value::String(CLI_CONTRACT_VERSION.to_string()),
            );
            Value::Object(object)
        }
        other => serde_json::json!({
            "contract_version": CLI_CONTRACT_VERSION,
            "payload": other
        }),
    }
}

fn emit_json(value: Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(&with_contract_version(value))?);
    Ok(())
}

/// Graph-sync gates are resolved from the environment here, at the process
/// edge; the library only ever sees the explicit config struct.
fn graph_sync_from_env() -> GraphSyncConfig {
    GraphSyncConfig {
        endpoint: std::env::var("ENGRAM_GRAPH_URL").ok().filter(|value| !value.is_empty()),
        opt_in: std::env::var("ENGRAM_GRAPH_SYNC").map(|value| value == "1").unwrap_or(false),
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    let backend = SqliteBackend::open(&cli.db)?;

    if let Command::Db { command } = &cli.command {
        return run_db(command, &backend);
    }

    backend.migrate()?;
    let engram = Engram::new(
        Arc::new(backend),
        EngramConfig {
            transaction_mode: cli.transaction_mode.into_mode(),
            graph_sync: graph_sync_from_env(),
        },
    );

    match cli.command {
        Command::Db { .. } => Ok(()),
        Command::Record { command } => run_record(*command, &engram),
        Command::Kv { command } => run_kv(*command, &engram),
        Command::Fact { command } => run_fact(*command, &engram),
        Command::Space { command } => run_space(*command, &engram),
        Command::Context { command } => run_context(*command, &engram),
        Command::Memory { command } => run_memory(*command, &engram),
    }
}

fn run_db(command: &DbCommand, backend: &SqliteBackend) -> Result<()> {
    match command {
        DbCommand::SchemaVersion => {
            let status = backend.schema_status()?;
            emit_json(serde_json::json!({
                "current_version": status.current_version,
                "target_version": status.target_version,
                "pending_versions": status.pending_versions,
                "up_to_date": status.pending_versions.is_empty()
            }))
        }
        DbCommand::Migrate => {
            let before = backend.schema_status()?;
            backend.migrate()?;
            let after = backend.schema_status()?;
            emit_json(serde_json::json!({
                "before_version": before.current_version,
                "applied_versions": before.pending_versions,
                "after_version": after.current_version,
                "up_to_date": after.pending_versions.is_empty()
            }))
        }
        DbCommand::Export(args) => {
            backend.migrate()?;
            let manifest = backend.export_snapshot(&args.out)?;
            emit_json(serde_json::json!({ "out_dir": args.out, "manifest": manifest }))
        }
        DbCommand::Import(args) => {
            let summary = backend.import_snapshot(&args.input, args.skip_existing)?;
            emit_json(serde_json::json!({
                "in_dir": args.input,
                "skip_existing": args.skip_existing,
                "summary": summary
            }))
        }
        DbCommand::Backup(args) => {
            backend.migrate()?;
            backend.backup_database(&args.out)?;
            emit_json(serde_json::json!({ "backup_path": args.out, "status": "ok" }))
        }
        DbCommand::Restore(args) => {
            backend.restore_database(&args.input)?;
            let status = backend.schema_status()?;
            emit_json(serde_json::json!({
                "restored_from": args.input,
                "current_version": status.current_version
            }))
        }
        DbCommand::IntegrityCheck => {
            let report = backend.integrity_check()?;
            emit_json(serde_json::to_value(&report).context("failed to serialize report")?)
        }
    }
}

fn run_record(command: RecordCommand, engram: &Engram) -> Result<()> {
    let records = engram.records();
    match command {
        RecordCommand::Store(args) => {
            let data = parse_json_arg("--data", &args.data)?;
            let record = records.store(
                &args.record_type,
                &args.id,
                data,
                StoreOptions { space_id: args.space, user_id: args.user, metadata: None },
            )?;
            emit_json(serde_json::to_value(&record)?)
        }
        RecordCommand::Get(args) => {
            let record = records.get(&args.record_type, &args.id)?;
            emit_json(serde_json::json!({ "record": record }))
        }
        RecordCommand::History(args) => {
            let history = records.get_history(&args.record_type, &args.id)?;
            emit_json(serde_json::json!({ "versions": history }))
        }
        RecordCommand::Version(args) => {
            let snapshot =
                records.get_version(&args.record.record_type, &args.record.id, args.version)?;
            emit_json(serde_json::json!({ "version": snapshot }))
        }
        RecordCommand::At(args) => {
            let at = parse_rfc3339(&args.at)?;
            let snapshot = records.get_at_timestamp(&args.record.record_type, &args.record.id, at)?;
            emit_json(serde_json::json!({ "version": snapshot }))
        }
        RecordCommand::List(args) => {
            let listed = records.list(&record_query(&args))?;
            emit_json(serde_json::json!({ "records": listed }))
        }
        RecordCommand::Count(args) => {
            let count = records.count(&record_query(&args))?;
            emit_json(serde_json::json!({ "count": count }))
        }
        RecordCommand::Search(args) => {
            let hits = records.search(&args.record_type, args.space.as_deref(), &args.text)?;
            emit_json(serde_json::json!({ "records": hits }))
        }
        RecordCommand::Purge(args) => {
            let report = records.purge(&args.record_type, &args.id)?;
            emit_json(serde_json::to_value(&report)?)
        }
        RecordCommand::PurgeVersions(args) => {
            let report =
                records.purge_versions(&args.record.record_type, &args.record.id, args.keep)?;
            emit_json(serde_json::to_value(&report)?)
        }
    }
}

fn record_query(args: &RecordListArgs) -> RecordQuery {
    RecordQuery {
        record_type: args.record_type.clone(),
        space_id: args.space.clone(),
        limit: args.limit,
        ..RecordQuery::default()
    }
}

fn run_kv(command: KvCommand, engram: &Engram) -> Result<()> {
    let kv = engram.kv();
    match command {
        KvCommand::Set(args) => {
            let value = parse_json_arg("--value", &args.value)?;
            let entry = kv.set(
                &args.namespace,
                &args.key,
                value,
                SetOptions { user_id: args.user, metadata: None },
            )?;
            emit_json(serde_json::to_value(&entry)?)
        }
        KvCommand::Get(args) => {
            let value = kv.get(&args.namespace, &args.key)?;
            emit_json(serde_json::json!({ "value": value }))
        }
        KvCommand::GetRecord(args) => {
            let entry = kv.get_record(&args.namespace, &args.key)?;
            emit_json(serde_json::json!({ "entry": entry }))
        }
        KvCommand::Incr(args) => {
            let entry = kv.increment(&args.entry.namespace, &args.entry.key, args.amount)?;
            emit_json(serde_json::to_value(&entry)?)
        }
        KvCommand::Decr(args) => {
            let entry = kv.decrement(&args.entry.namespace, &args.entry.key, args.amount)?;
            emit_json(serde_json::to_value(&entry)?)
        }
        KvCommand::Exists(args) => {
            let exists = kv.exists(&args.namespace, &args.key)?;
            emit_json(serde_json::json!({ "exists": exists }))
        }
        KvCommand::Delete(args) => {
            let report = kv.delete(&args.namespace, &args.key)?;
            emit_json(serde_json::to_value(&report)?)
        }
        KvCommand::List(args) => {
            let listed = kv.list(&entry_filter(&args))?;
            emit_json(serde_json::json!({ "entries": listed }))
        }
        KvCommand::Count(args) => {
            let count = kv.count(&entry_filter(&args))?;
            emit_json(serde_json::json!({ "count": count }))
        }
        KvCommand::PurgeNamespace(args) => {
            let report = kv.purge_namespace(&args.namespace)?;
            emit_json(serde_json::to_value(&report)?)
        }
        KvCommand::Transaction(args) => {
            let ops: Vec<KvOperation> = serde_json::from_str(&args.ops)
                .with_context(|| format!("--ops is not a valid operation array: {}", args.ops))?;
            let report = kv.transaction(&ops)?;
            emit_json(serde_json::to_value(&report)?)
        }
    }
}

fn entry_filter(args: &KvListArgs) -> EntryFilter {
    EntryFilter {
        namespace: args.namespace.clone(),
        key_prefix: args.prefix.clone(),
        user_id: args.user.clone(),
        limit: args.limit,
        ..EntryFilter::default()
    }
}

fn run_fact(command: FactCommand, engram: &Engram) -> Result<()> {
    let facts = engram.facts();
    match command {
        FactCommand::Add(args) => {
            let object = parse_json_arg("--object", &args.object)?;
            let candidate = FactCandidate {
                subject: args.subject,
                predicate: args.predicate,
                object,
                fact_type: args.fact_type.into_fact_type(),
                confidence: args.confidence,
                tags: args.tags,
                source_type: Some("cli".to_string()),
                update_of: args.update_of,
            };
            let revisions = facts.revise(&args.space, &[candidate])?;
            emit_json(serde_json::json!({ "fact_revisions": revisions }))
        }
        FactCommand::Get(args) => {
            let fact = facts.get(&args.id)?;
            emit_json(serde_json::json!({ "fact": fact }))
        }
        FactCommand::List(args) => {
            let listed = facts.list(&fact_query(&args))?;
            emit_json(serde_json::json!({ "facts": listed }))
        }
        FactCommand::Count(args) => {
            let count = facts.count(&fact_query(&args))?;
            emit_json(serde_json::json!({ "count": count }))
        }
        FactCommand::History(args) => {
            let history = facts.history(&args.id)?;
            emit_json(serde_json::json!({ "versions": history }))
        }
        FactCommand::Forget(args) => {
            facts.forget(&args.id)?;
            emit_json(serde_json::json!({ "deleted": true, "fact_id": args.id }))
        }
    }
}

fn fact_query(args: &FactListArgs) -> FactQuery {
    FactQuery {
        space_id: args.space.clone(),
        subject: args.subject.clone(),
        predicate: args.predicate.clone(),
        include_inactive: args.include_inactive,
        limit: args.limit,
        ..FactQuery::default()
    }
}

fn run_space(command: SpaceCommand, engram: &Engram) -> Result<()> {
    let spaces = engram.spaces();
    match command {
        SpaceCommand::Create(args) => {
            let record = spaces.create(&args.id, args.name, serde_json::json!({}))?;
            emit_json(serde_json::to_value(&record)?)
        }
        SpaceCommand::List => {
            let listed = spaces.list()?;
            emit_json(serde_json::json!({ "spaces": listed }))
        }
        SpaceCommand::Stats(args) => {
            let stats = engram.stats().space_stats(&args.id)?;
            emit_json(serde_json::to_value(&stats)?)
        }
        SpaceCommand::SetStatus(args) => {
            let record = spaces.set_status(&args.id, &args.status)?;
            emit_json(serde_json::to_value(&record)?)
        }
    }
}

fn run_context(command: ContextCommand, engram: &Engram) -> Result<()> {
    let contexts = engram.contexts();
    match command {
        ContextCommand::Create(args) => {
            let data = parse_json_arg("--data", &args.data)?;
            let record = contexts.create(&args.space, args.id, data, args.parent)?;
            emit_json(serde_json::to_value(&record)?)
        }
        ContextCommand::List(args) => {
            let listed = match &args.status {
                Some(status) => contexts.list_by_status(&args.space, status)?,
                None => contexts.list(&args.space)?,
            };
            emit_json(serde_json::json!({ "contexts": listed }))
        }
        ContextCommand::Children(args) => {
            let children = contexts.children(&args.space, &args.parent)?;
            emit_json(serde_json::json!({ "contexts": children }))
        }
        ContextCommand::SetStatus(args) => {
            let record = contexts.set_status(&args.id, &args.status)?;
            emit_json(serde_json::to_value(&record)?)
        }
    }
}

fn run_memory(command: MemoryCommand, engram: &Engram) -> Result<()> {
    // The CLI wires no extraction/embedding hooks; the fact layer is simply
    // skipped and search uses the lexical path.
    let memory = engram.memory(Hooks::default());
    match command {
        MemoryCommand::Remember(args) => {
            let result = memory.remember(&RememberRequest {
                space_id: args.space,
                user_id: args.user,
                conversation_id: args.conversation,
                user_text: args.user_text,
                agent_text: args.agent_text,
                belief_revision: !args.no_belief_revision,
            })?;
            emit_json(serde_json::to_value(&result)?)
        }
        MemoryCommand::Store(args) => {
            let record = memory.store(&args.space, args.user.as_deref(), &args.content)?;
            emit_json(serde_json::to_value(&record)?)
        }
        MemoryCommand::Get(args) => {
            let record = memory.get(&args.id)?;
            emit_json(serde_json::json!({ "memory": record }))
        }
        MemoryCommand::Search(args) => {
            let hits = memory.search(&args.space, &args.query, args.limit)?;
            emit_json(serde_json::json!({ "hits": hits }))
        }
        MemoryCommand::List(args) => {
            let listed = memory.list(&args.space)?;
            emit_json(serde_json::json!({ "memories": listed }))
        }
        MemoryCommand::Archive(args) => {
            let record = memory.archive(&args.id)?;
            emit_json(serde_json::to_value(&record)?)
        }
        MemoryCommand::Restore(args) => {
            let record = memory.restore_from_archive(&args.id)?;
            emit_json(serde_json::to_value(&record)?)
        }
        MemoryCommand::Forget(args) => {
            let report = memory.forget(&args.id)?;
            emit_json(serde_json::to_value(&report)?)
        }
    }
}

fn parse_json_arg(flag: &str, raw: &str) -> Result<Value> {
    serde_json::from_str(raw).with_context(|| format!("{flag} is not valid JSON: {raw}"))
}

fn parse_rfc3339(value: &str) -> Result<OffsetDateTime> {
    OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .map_err(|err| anyhow!("invalid RFC3339 timestamp `{value}`: {err}"))
}
