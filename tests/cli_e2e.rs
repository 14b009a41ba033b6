//! End-to-end CLI tests for xreply.
//!
//! These tests run the actual xreply binary and verify:
//! - Command-line interface behavior
//! - Output format and content
//! - Error handling and messages
//!
//! # Test Organization
//!
//! Tests are organized by command:
//! - `test_plan_*` - Query synthesis and execution
//! - `test_token_*` / `test_search_*` - Token lookups and web search
//! - `test_thread_*` - Thread reconstruction from a fixture channel
//! - `test_poll_*` - One interaction pass
//! - `test_config_*` - Configuration management
//! - `test_cli_*` - General CLI tests (flags, help, version)

use assert_cmd::Command;
use assert_cmd::cargo::cargo_bin_cmd;
use predicates::prelude::*;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tempfile::TempDir;

// =============================================================================
// Test Utilities
// =============================================================================

/// Log a test event with timestamp
macro_rules! test_log {
    ($($arg:tt)*) => {
        let timestamp = chrono::Utc::now().format("%H:%M:%S%.3f");
        eprintln!("[TEST {}] {}", timestamp, format!($($arg)*));
    };
}

/// Get the xreply command with a clean environment
fn xreply_cmd() -> Command {
    let mut cmd = cargo_bin_cmd!("xreply");
    cmd.env("NO_COLOR", "1");
    for var in [
        "XREPLY_CONFIG",
        "XREPLY_DB",
        "XREPLY_FIXTURE",
        "XREPLY_USERNAME",
        "XREPLY_BEARER_TOKEN",
        "XREPLY_LLM_ENDPOINT",
        "XREPLY_LLM_API_KEY",
        "XREPLY_WAREHOUSE_PATH",
        "XREPLY_WAREHOUSE_URL",
        "XREPLY_WAREHOUSE_API_KEY",
        "XREPLY_DRY_RUN",
        "XREPLY_MAX_RESULTS",
        "XREPLY_SEARCH_API_KEY",
        "RUST_LOG",
    ] {
        cmd.env_remove(var);
    }
    cmd
}

/// Workspace with a config file, a warehouse, and a fixture channel.
struct Workspace {
    dir: TempDir,
}

impl Workspace {
    fn new() -> Self {
        let dir = TempDir::new().expect("Failed to create temp directory");
        let ws = Self { dir };
        ws.write_warehouse();
        fs::write(ws.fixture_path(), SAMPLE_FIXTURE).expect("Failed to write fixture");
        fs::write(
            ws.config_path(),
            format!(
                "[warehouse]\ntable = \"tokens\"\npath = {:?}\n\n\
                 [storage]\ndb = {:?}\n\n\
                 [channel]\nbearer_token = \"secret-token\"\n\n\
                 [llm]\nendpoint = \"http://127.0.0.1:9\"\ntimeout_secs = 2\n",
                ws.path("warehouse.db"),
                ws.path("memory.db"),
            ),
        )
        .expect("Failed to write config");
        ws
    }

    fn path(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }

    fn config_path(&self) -> PathBuf {
        self.path("config.toml")
    }

    fn fixture_path(&self) -> PathBuf {
        self.path("fixture.json")
    }

    fn write_warehouse(&self) {
        let conn = rusqlite::Connection::open(self.path("warehouse.db"))
            .expect("Failed to create warehouse");
        conn.execute_batch(SAMPLE_WAREHOUSE)
            .expect("Failed to seed warehouse");
    }

    /// Command preconfigured with this workspace's config file.
    fn cmd(&self) -> Command {
        let mut cmd = xreply_cmd();
        cmd.arg("--config").arg(self.config_path());
        cmd
    }
}

fn file_contains(path: &Path, needle: &str) -> bool {
    fs::read_to_string(path).is_ok_and(|c| c.contains(needle))
}

// =============================================================================
// Sample Test Data
// =============================================================================

const SAMPLE_WAREHOUSE: &str = "
CREATE TABLE tokens (
    TOKEN_NAME TEXT, TOKEN_SYMBOL TEXT, TOKEN_URL TEXT,
    MARKET_CAP REAL, FULLY_DILUTED_VALUATION REAL,
    TM_TRADER_GRADE REAL, TA_GRADE REAL, QUANT_GRADE REAL,
    TM_INVESTOR_GRADE REAL, FUNDAMENTAL_GRADE REAL, TECHNOLOGY_GRADE REAL,
    VALUATION_GRADE REAL, TVL REAL, TRADING_SIGNAL REAL, TOKEN_TREND REAL,
    VOLUME_24H REAL, SUMMARY TEXT
);
INSERT INTO tokens (TOKEN_NAME, TOKEN_SYMBOL, MARKET_CAP, VOLUME_24H, TM_TRADER_GRADE)
VALUES ('Bitcoin', 'BTC', 1.2e12, 3.0e10, 88.0),
       ('Ethereum', 'ETH', 4.0e11, 1.5e10, 74.0);
";

const SAMPLE_FIXTURE: &str = r#"{
    "profile": {"id": "1000", "handle": "metricsbot", "name": "Metrics Bot"},
    "posts": [
        {
            "id": "500",
            "author_id": "u1",
            "author_handle": "alice",
            "author_name": "Alice",
            "text": "Which token has the best trader grade?",
            "created_at": "2025-01-08T12:00:00Z",
            "conversation_id": "500"
        },
        {
            "id": "501",
            "author_id": "u2",
            "author_handle": "bob",
            "text": "@metricsbot curious too",
            "created_at": "2025-01-08T12:05:00Z",
            "in_reply_to": "500",
            "conversation_id": "500"
        },
        {
            "id": "502",
            "author_id": "u3",
            "author_handle": "carol",
            "text": "@metricsbot what is the top token by trader grade?",
            "created_at": "2025-01-08T12:10:00Z",
            "in_reply_to": "501",
            "conversation_id": "500"
        }
    ],
    "timeline": []
}"#;

// =============================================================================
// General CLI
// =============================================================================

#[test]
fn test_cli_help_lists_commands() {
    test_log!("Starting test_cli_help_lists_commands");
    xreply_cmd()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("poll"))
        .stdout(predicate::str::contains("plan"))
        .stdout(predicate::str::contains("thread"))
        .stdout(predicate::str::contains("token"))
        .stdout(predicate::str::contains("completions"));
}

#[test]
fn test_cli_version() {
    xreply_cmd()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("xreply"));
}

#[test]
fn test_cli_unknown_command_fails() {
    xreply_cmd().arg("frobnicate").assert().failure();
}

#[test]
fn test_cli_completions() {
    xreply_cmd()
        .args(["completions", "bash"])
        .assert()
        .success()
        .stdout(predicate::str::contains("xreply"));
}

// =============================================================================
// Plan
// =============================================================================

#[test]
fn test_plan_prints_sql() {
    let ws = Workspace::new();
    ws.cmd()
        .args(["plan", "top tokens by trader grade"])
        .assert()
        .success()
        .stdout(predicate::str::starts_with("SELECT "))
        .stdout(predicate::str::contains("FROM tokens"))
        .stdout(predicate::str::contains("ORDER BY TM_TRADER_GRADE DESC NULLS LAST"));
}

#[test]
fn test_plan_execute_returns_rows() {
    test_log!("Starting test_plan_execute_returns_rows");
    let start = Instant::now();
    let ws = Workspace::new();
    let output = ws
        .cmd()
        .args(["plan", "top tokens by trader grade", "--execute"])
        .output()
        .expect("Failed to run xreply");
    test_log!("plan --execute finished in {:?}", start.elapsed());

    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    let btc = stdout.find("BTC").expect("BTC in output");
    let eth = stdout.find("ETH").expect("ETH in output");
    assert!(btc < eth, "rows should be ordered by trader grade");
}

#[test]
fn test_plan_missing_warehouse_fails() {
    let ws = Workspace::new();
    fs::remove_file(ws.path("warehouse.db")).unwrap();
    ws.cmd()
        .args(["plan", "top tokens", "--execute"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Warehouse connection failed"));
}

// =============================================================================
// Token / Search
// =============================================================================

#[test]
fn test_token_lookup_by_symbol() {
    let ws = Workspace::new();
    ws.cmd()
        .args(["token", "$btc"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Token: Bitcoin (BTC)"))
        .stdout(predicate::str::contains("- Trader: 88"));
}

#[test]
fn test_token_search_json() {
    let ws = Workspace::new();
    let output = ws
        .cmd()
        .args(["token", "eth", "--search", "--json"])
        .output()
        .expect("Failed to run xreply");

    assert!(output.status.success());
    let found: serde_json::Value = serde_json::from_slice(&output.stdout).expect("JSON output");
    let found = found.as_array().expect("array of tokens");
    assert_eq!(found.len(), 1);
    assert_eq!(found[0]["symbol"], "ETH");
}

#[test]
fn test_token_unknown_fails() {
    let ws = Workspace::new();
    ws.cmd()
        .args(["token", "DOGE"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("not found"));
}

#[test]
fn test_search_requires_api_key() {
    let ws = Workspace::new();
    ws.cmd()
        .args(["search", "eth upgrade"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("search.api_key"));
}

// =============================================================================
// Thread
// =============================================================================

#[test]
fn test_thread_from_fixture() {
    let ws = Workspace::new();
    ws.cmd()
        .env("XREPLY_FIXTURE", ws.fixture_path())
        .args(["thread", "502"])
        .assert()
        .success()
        .stdout(predicate::str::contains("@alice"))
        .stdout(predicate::str::contains("@carol"))
        .stdout(predicate::str::contains("3 posts"));
}

#[test]
fn test_thread_depth_limit() {
    let ws = Workspace::new();
    ws.cmd()
        .env("XREPLY_FIXTURE", ws.fixture_path())
        .args(["thread", "502", "--depth", "2"])
        .assert()
        .success()
        .stdout(predicate::str::contains("@alice").not())
        .stdout(predicate::str::contains("2 posts"));
}

#[test]
fn test_thread_unknown_post() {
    let ws = Workspace::new();
    ws.cmd()
        .env("XREPLY_FIXTURE", ws.fixture_path())
        .args(["thread", "999"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("not found"));
}

// =============================================================================
// Poll
// =============================================================================

#[test]
fn test_poll_counts_generation_failure() {
    // The generator endpoint refuses connections, so each candidate fails
    // without stopping the pass.
    let ws = Workspace::new();
    let output = ws
        .cmd()
        .env("XREPLY_FIXTURE", ws.fixture_path())
        .args(["-q", "poll", "--dry-run", "--json"])
        .output()
        .expect("Failed to run xreply");
    assert!(output.status.success());

    let summary: serde_json::Value =
        serde_json::from_slice(&output.stdout).expect("summary is JSON");
    assert_eq!(summary["discovered"], 2);
    assert_eq!(summary["failed"], 2);
    assert_eq!(summary["responded"], 0);
    assert_eq!(summary["last_checked"], "502");
}

#[test]
fn test_poll_requires_credentials() {
    let ws = Workspace::new();
    fs::write(ws.config_path(), "[warehouse]\ntable = \"tokens\"\n").unwrap();
    ws.cmd()
        .env("XREPLY_DB", ws.path("memory.db"))
        .arg("poll")
        .assert()
        .failure()
        .stderr(predicate::str::contains("channel.bearer_token"));
}

// =============================================================================
// Config
// =============================================================================

#[test]
fn test_config_show_redacts_secrets() {
    let ws = Workspace::new();
    ws.cmd()
        .args(["config", "--show"])
        .assert()
        .success()
        .stdout(predicate::str::contains("[interactions]"))
        .stdout(predicate::str::contains("table = \"tokens\""))
        .stdout(predicate::str::contains("secret-token").not());
}

#[test]
fn test_config_init_writes_file_once() {
    let dir = TempDir::new().unwrap();
    let target = dir.path().join("nested").join("config.toml");

    xreply_cmd()
        .arg("--config")
        .arg(&target)
        .args(["config", "--init"])
        .assert()
        .success();
    assert!(file_contains(&target, "[query]"));

    xreply_cmd()
        .arg("--config")
        .arg(&target)
        .args(["config", "--init"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("already exists"));

    xreply_cmd()
        .arg("--config")
        .arg(&target)
        .args(["config", "--init", "--force"])
        .assert()
        .success();
}

#[test]
fn test_config_bad_file_is_an_error() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("broken.toml");
    fs::write(&path, "[pool\nmax_size = ").unwrap();
    xreply_cmd()
        .arg("--config")
        .arg(&path)
        .args(["config", "--show"])
        .assert()
        .failure();
}

#[test]
fn test_config_path() {
    xreply_cmd()
        .args(["config", "--path"])
        .assert()
        .success()
        .stdout(predicate::str::contains("config.toml"));
}
