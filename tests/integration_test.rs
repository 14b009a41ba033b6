//! Integration tests for xreply.
//!
//! These drive the whole interaction pipeline with:
//! - an in-memory social channel
//! - a scripted text generator
//! - real `SQLite` warehouse and memory databases in a temp directory

use async_trait::async_trait;
use chrono::Utc;
use rusqlite::Connection;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;
use xreply::{
    AgentContext, AnalyticsService, CandidatePost, Config, Decision, IdempotencyRecord,
    InMemoryChannel, InteractionClient, MemoryStore, ModelClass, Profile, QueryEngine,
    SocialChannel, SqliteMemoryStore, TextGenerator,
    error::Result,
    query::{COLUMN_TABLE, MANDATORY_COLUMNS, SUMMARY_COLUMN},
    warehouse::SqliteWarehouse,
};

const BOT_ID: &str = "1000";
const BOT_HANDLE: &str = "metricsbot";

/// Answers the gate with RESPOND and everything else with a fixed reply.
struct ScriptedGenerator;

#[async_trait]
impl TextGenerator for ScriptedGenerator {
    async fn generate(&self, context: &str, _class: ModelClass) -> Result<String> {
        if context.contains("[RESPOND]") {
            Ok("[RESPOND]".to_string())
        } else {
            Ok("\"$BTC leads on trader grade right now.\"".to_string())
        }
    }
}

/// Warehouse with every column the rule planner can select.
fn create_warehouse(dir: &TempDir) -> PathBuf {
    let mut columns: BTreeSet<&str> = MANDATORY_COLUMNS.iter().copied().collect();
    columns.extend(COLUMN_TABLE.iter().map(|c| c.name));
    columns.extend([SUMMARY_COLUMN, "VOLUME_24H", "TRADING_SIGNAL"]);
    let schema: Vec<String> = columns
        .iter()
        .map(|c| {
            if *c == "TOKEN_NAME" || *c == "TOKEN_SYMBOL" || *c == "TOKEN_URL" || *c == SUMMARY_COLUMN {
                format!("{c} TEXT")
            } else {
                format!("{c} REAL")
            }
        })
        .collect();

    let path = dir.path().join("warehouse.db");
    let conn = Connection::open(&path).unwrap();
    conn.execute_batch(&format!("CREATE TABLE tokens ({});", schema.join(", ")))
        .unwrap();
    for (name, symbol, cap, volume, grade) in [
        ("Bitcoin", "BTC", 1.2e12, 3.0e10, 88.0),
        ("Ethereum", "ETH", 4.0e11, 1.5e10, 74.0),
        ("Solana", "SOL", 8.0e10, 4.0e9, 69.0),
    ] {
        conn.execute(
            "INSERT INTO tokens (TOKEN_NAME, TOKEN_SYMBOL, MARKET_CAP, VOLUME_24H, TM_TRADER_GRADE) \
             VALUES (?1, ?2, ?3, ?4, ?5)",
            rusqlite::params![name, symbol, cap, volume, grade],
        )
        .unwrap();
    }
    path
}

struct Harness {
    _dir: TempDir,
    channel: Arc<InMemoryChannel>,
    memory: Arc<SqliteMemoryStore>,
    client: Arc<InteractionClient>,
}

fn create_harness() -> Harness {
    let dir = TempDir::new().unwrap();
    let warehouse_path = create_warehouse(&dir);
    let mut config = Config::default();
    config.warehouse.table = "tokens".to_string();
    config.warehouse.path = Some(warehouse_path.clone());

    let queries: Arc<dyn QueryEngine> = Arc::new(AnalyticsService::from_config(
        SqliteWarehouse::new(&warehouse_path),
        &config,
        None,
    ));
    let memory = Arc::new(SqliteMemoryStore::open(dir.path().join("memory.db")).unwrap());
    let profile = Profile {
        id: BOT_ID.to_string(),
        handle: BOT_HANDLE.to_string(),
        name: "Metrics Bot".to_string(),
    };
    let channel = Arc::new(InMemoryChannel::new(profile.clone()));

    let agent = AgentContext {
        channel: Arc::clone(&channel) as Arc<dyn SocialChannel>,
        memory: Arc::clone(&memory) as Arc<dyn MemoryStore>,
        generator: Arc::new(ScriptedGenerator),
        queries,
        profile,
        agent_id: "agent-1".to_string(),
    };
    let client = Arc::new(InteractionClient::new(agent, config.interactions.clone()));
    Harness {
        _dir: dir,
        channel,
        memory,
        client,
    }
}

fn add_mentions(channel: &InMemoryChannel, ids: &[&str]) {
    for (n, id) in ids.iter().enumerate() {
        channel.add_post(CandidatePost::new(
            *id,
            format!("user{n}"),
            format!("trader{n}"),
            format!("@{BOT_HANDLE} what are the top tokens by trader grade?"),
        ));
    }
}

fn reply_targets(channel: &InMemoryChannel) -> Vec<String> {
    let mut targets: Vec<String> = channel
        .published()
        .into_iter()
        .filter_map(|p| p.in_reply_to)
        .collect();
    targets.sort();
    targets
}

#[tokio::test]
async fn test_pass_skips_pre_recorded_candidate() {
    let h = create_harness();
    add_mentions(&h.channel, &["101", "102", "103", "104", "105"]);
    h.memory
        .record_idempotency(&IdempotencyRecord {
            post_id: "103".to_string(),
            response_id: None,
            decision: Decision::Ignore,
            created_at: Utc::now(),
        })
        .await
        .unwrap();

    let summary = h.client.handle_interactions().await.unwrap();
    assert_eq!(summary.discovered, 5);
    assert_eq!(summary.processed, 4);
    assert_eq!(summary.skipped, 1);
    assert_eq!(summary.responded, 4);
    assert_eq!(summary.failed, 0);
    assert_eq!(summary.last_checked.as_deref(), Some("105"));

    assert_eq!(reply_targets(&h.channel), vec!["101", "102", "104", "105"]);
    for published in h.channel.published() {
        assert_eq!(published.text, "$BTC leads on trader grade right now.");
    }

    let record = h.memory.get_idempotency("101").await.unwrap().unwrap();
    assert_eq!(record.decision, Decision::Respond);
    assert!(record.response_id.is_some());
}

#[tokio::test]
async fn test_repeated_passes_reply_once() {
    let h = create_harness();
    add_mentions(&h.channel, &["201", "202", "203"]);

    let first = h.client.handle_interactions().await.unwrap();
    assert_eq!(first.responded, 3);

    let second = h.client.handle_interactions().await.unwrap();
    assert_eq!(second.processed, 0);
    assert_eq!(second.responded, 0);
    assert_eq!(h.channel.published().len(), 3);

    // New mentions after the marker are still picked up.
    add_mentions(&h.channel, &["204"]);
    let third = h.client.handle_interactions().await.unwrap();
    assert_eq!(third.responded, 1);
    assert_eq!(reply_targets(&h.channel), vec!["201", "202", "203", "204"]);
}

#[tokio::test]
async fn test_concurrent_passes_reply_once() {
    let h = create_harness();
    add_mentions(&h.channel, &["301", "302", "303", "304", "305"]);

    let (a, b) = tokio::join!(h.client.handle_interactions(), h.client.handle_interactions());
    let (a, b) = (a.unwrap(), b.unwrap());
    assert_eq!(a.responded + b.responded, 5);
    assert_eq!(reply_targets(&h.channel), vec!["301", "302", "303", "304", "305"]);
}

#[tokio::test]
async fn test_reply_thread_is_remembered() {
    let h = create_harness();
    h.channel.add_post(
        CandidatePost::new("400", "u9", "whale", "What is the best token to hold?")
            .with_conversation("400"),
    );
    h.channel.add_post(
        CandidatePost::new("401", "u8", "fish", format!("@{BOT_HANDLE} this one please"))
            .replying_to("400")
            .with_conversation("400"),
    );

    let summary = h.client.handle_interactions().await.unwrap();
    assert_eq!(summary.responded, 1);
    assert_eq!(reply_targets(&h.channel), vec!["401"]);

    let counts = h.memory.counts().unwrap();
    // Both thread posts plus our reply.
    assert_eq!(counts.memories, 3);
}

#[test]
fn test_warehouse_fixture_has_rows() {
    let dir = TempDir::new().unwrap();
    let path = create_warehouse(&dir);
    assert!(Path::new(&path).exists());
    let conn = Connection::open(&path).unwrap();
    let count: i64 = conn
        .query_row("SELECT COUNT(*) FROM tokens", [], |row| row.get(0))
        .unwrap();
    assert_eq!(count, 3);
}
