//! Analytical warehouse adapters.
//!
//! A [`Warehouse`] is a [`ConnectionFactory`] that can also run SQL on one of
//! its connections. Two adapters ship with the crate:
//!
//! - [`SqliteWarehouse`] opens a local `SQLite` file read-only
//! - [`HttpWarehouse`] posts `{"query": sql}` to `{url}/query` with a bearer
//!   key and expects JSON rows back

use crate::error::{Result, XrError};
use crate::model::Row;
use crate::pool::ConnectionFactory;
use async_trait::async_trait;
use reqwest::Client;
use rusqlite::types::ValueRef;
use rusqlite::{Connection, OpenFlags};
use serde_json::{Value, json};
use std::path::PathBuf;
use std::time::Duration;
use tracing::debug;

/// Runs SQL on pooled connections.
#[async_trait]
pub trait Warehouse: ConnectionFactory {
    /// Execute `sql` and return every row as a JSON object.
    async fn execute(&self, conn: &mut Self::Connection, sql: &str) -> Result<Vec<Row>>;
}

// =============================================================================
// SQLite
// =============================================================================

/// Read-only `SQLite` warehouse.
#[derive(Debug, Clone)]
pub struct SqliteWarehouse {
    path: PathBuf,
}

impl SqliteWarehouse {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    #[must_use]
    pub fn path(&self) -> &std::path::Path {
        &self.path
    }
}

#[async_trait]
impl ConnectionFactory for SqliteWarehouse {
    type Connection = Connection;

    async fn connect(&self) -> Result<Connection> {
        if !self.path.exists() {
            return Err(XrError::warehouse_connect(format!(
                "no database at {}",
                self.path.display()
            )));
        }
        let conn = Connection::open_with_flags(
            &self.path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .map_err(|e| XrError::warehouse_connect(e.to_string()))?;
        conn.busy_timeout(Duration::from_secs(5))?;
        Ok(conn)
    }

    async fn health_check(&self, conn: &mut Connection) -> bool {
        conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))
            .is_ok()
    }

    async fn destroy(&self, conn: Connection) -> Result<()> {
        conn.close().map_err(|(_, e)| XrError::DatabaseError(e))
    }
}

#[async_trait]
impl Warehouse for SqliteWarehouse {
    async fn execute(&self, conn: &mut Connection, sql: &str) -> Result<Vec<Row>> {
        query_sqlite(conn, sql).map_err(|e| XrError::query_execution(e.to_string()))
    }
}

fn query_sqlite(conn: &Connection, sql: &str) -> rusqlite::Result<Vec<Row>> {
    let mut stmt = conn.prepare(sql)?;
    let columns: Vec<String> = stmt.column_names().iter().map(|c| (*c).to_string()).collect();

    let mut rows = stmt.query([])?;
    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
        let mut object = Row::new();
        for (idx, name) in columns.iter().enumerate() {
            object.insert(name.clone(), sqlite_value_to_json(row.get_ref(idx)?));
        }
        out.push(object);
    }
    Ok(out)
}

fn sqlite_value_to_json(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => json!(i),
        ValueRef::Real(f) => serde_json::Number::from_f64(f).map_or(Value::Null, Value::Number),
        ValueRef::Text(bytes) => Value::String(String::from_utf8_lossy(bytes).into_owned()),
        ValueRef::Blob(bytes) => Value::String(format!("<{} bytes>", bytes.len())),
    }
}

// =============================================================================
// HTTP
// =============================================================================

/// Warehouse reached through a JSON query endpoint.
#[derive(Debug, Clone)]
pub struct HttpWarehouse {
    http: Client,
    url: String,
    api_key: Option<String>,
}

/// One logical session against the HTTP endpoint.
#[derive(Debug)]
pub struct HttpSession {
    http: Client,
}

impl HttpWarehouse {
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be constructed.
    pub fn new(url: impl Into<String>, api_key: Option<String>, timeout: Duration) -> Result<Self> {
        let http = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            url: url.into().trim_end_matches('/').to_string(),
            api_key,
        })
    }

    async fn post_query(&self, http: &Client, sql: &str) -> Result<Value> {
        let mut req = http
            .post(format!("{}/query", self.url))
            .json(&json!({ "query": sql }));
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key);
        }

        let response = req
            .send()
            .await
            .map_err(|e| XrError::query_execution(format!("request failed: {e}")))?;
        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| XrError::query_execution(format!("unreadable response: {e}")))?;

        if !status.is_success() {
            return Err(XrError::query_execution(format!("warehouse returned {status}: {text}")));
        }

        serde_json::from_str(&text)
            .map_err(|e| XrError::query_execution(format!("invalid JSON response: {e}")))
    }
}

#[async_trait]
impl ConnectionFactory for HttpWarehouse {
    type Connection = HttpSession;

    async fn connect(&self) -> Result<HttpSession> {
        debug!(url = %self.url, "opening warehouse session");
        Ok(HttpSession {
            http: self.http.clone(),
        })
    }

    /// Sessions share one HTTP client and hold no server-side state, so
    /// there is nothing to check. Endpoint failures surface on execute.
    async fn health_check(&self, _conn: &mut HttpSession) -> bool {
        true
    }

    async fn destroy(&self, _conn: HttpSession) -> Result<()> {
        Ok(())
    }
}

#[async_trait]
impl Warehouse for HttpWarehouse {
    async fn execute(&self, conn: &mut HttpSession, sql: &str) -> Result<Vec<Row>> {
        let body = self.post_query(&conn.http, sql).await?;
        rows_from_json(body)
    }
}

/// Accept a bare array of objects or an envelope with `rows`/`data`.
fn rows_from_json(body: Value) -> Result<Vec<Row>> {
    let array = match body {
        Value::Array(items) => items,
        Value::Object(mut object) => match object.remove("rows").or_else(|| object.remove("data")) {
            Some(Value::Array(items)) => items,
            _ => return Err(XrError::query_execution("response has no rows array")),
        },
        _ => return Err(XrError::query_execution("response is not a JSON array")),
    };

    array
        .into_iter()
        .map(|item| match item {
            Value::Object(row) => Ok(row),
            other => Err(XrError::query_execution(format!("row is not an object: {other}"))),
        })
        .collect()
}
