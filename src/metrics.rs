//! Single-token lookups against the warehouse table.
//!
//! [`lookup_query`] and [`search_query`] build fixed-shape SQL for a name or
//! symbol typed by a user, so the text is normalized and quoted here rather
//! than passed through the rule planner. Rows come back as loose JSON;
//! [`TokenMetrics::from_row`] pulls out the fields [`format_token_metrics`]
//! renders.

use crate::error::{Result, XrError};
use crate::model::Row;
use crate::query::PreparedQuery;
use serde::Serialize;
use serde_json::Value;
use std::fmt::Write;

/// Longest name or search text accepted.
pub const MAX_LOOKUP_CHARS: usize = 64;

/// Escape character used in `LIKE` patterns. Neither `SQLite` nor the remote
/// dialect treats it specially inside a string literal.
const LIKE_ESCAPE: char = '!';

/// Fields of a warehouse row that describe one token.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TokenMetrics {
    pub name: Option<String>,
    pub symbol: Option<String>,
    pub url: Option<String>,
    pub summary: Option<String>,
    pub market_cap: Option<f64>,
    pub volume_24h: Option<f64>,
    pub trader_grade: Option<f64>,
    pub investor_grade: Option<f64>,
    pub ta_grade: Option<f64>,
    pub fundamental_grade: Option<f64>,
    pub trading_signal: Option<f64>,
    pub token_trend: Option<f64>,
    pub trader_grade_signal: Option<String>,
    pub price_change_1h: Option<f64>,
    pub price_change_24h: Option<f64>,
    pub price_change_7d: Option<f64>,
}

impl TokenMetrics {
    /// Read the known columns from `row`. Missing or mistyped columns stay
    /// `None`.
    #[must_use]
    pub fn from_row(row: &Row) -> Self {
        let changes = row.get("PRICE_CHANGE_PERCENTAGE").and_then(json_object);
        let change = |key: &str| changes.as_ref().and_then(|c| c.get(key)).and_then(number);

        Self {
            name: text(row, "TOKEN_NAME"),
            symbol: text(row, "TOKEN_SYMBOL"),
            url: text(row, "TOKEN_URL"),
            summary: text(row, "SUMMARY"),
            market_cap: column_number(row, "MARKET_CAP"),
            volume_24h: column_number(row, "VOLUME_24H"),
            trader_grade: column_number(row, "TM_TRADER_GRADE"),
            investor_grade: column_number(row, "TM_INVESTOR_GRADE"),
            ta_grade: column_number(row, "TA_GRADE"),
            fundamental_grade: column_number(row, "FUNDAMENTAL_GRADE"),
            trading_signal: column_number(row, "TRADING_SIGNAL"),
            token_trend: column_number(row, "TOKEN_TREND"),
            trader_grade_signal: text(row, "TRADER_GRADE_SIGNAL"),
            price_change_1h: change("1h"),
            price_change_24h: change("24h"),
            price_change_7d: change("7d"),
        }
    }
}

fn text(row: &Row, column: &str) -> Option<String> {
    match row.get(column)? {
        Value::String(s) if !s.trim().is_empty() => Some(s.clone()),
        _ => None,
    }
}

fn number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn column_number(row: &Row, column: &str) -> Option<f64> {
    row.get(column).and_then(number)
}

/// Object columns arrive either as JSON or as JSON text.
fn json_object(value: &Value) -> Option<serde_json::Map<String, Value>> {
    match value {
        Value::Object(map) => Some(map.clone()),
        Value::String(s) => match serde_json::from_str(s) {
            Ok(Value::Object(map)) => Some(map),
            _ => None,
        },
        _ => None,
    }
}

/// Lowercased name or symbol with a leading `$` removed.
///
/// # Errors
///
/// `InvalidArgument` when the text is empty or longer than
/// [`MAX_LOOKUP_CHARS`].
pub fn normalize_lookup(text: &str) -> Result<String> {
    let normalized = text.trim().trim_start_matches('$').trim().to_lowercase();
    if normalized.is_empty() {
        return Err(XrError::InvalidArgument {
            reason: "token name or symbol is empty".to_string(),
        });
    }
    if normalized.chars().count() > MAX_LOOKUP_CHARS {
        return Err(XrError::InvalidArgument {
            reason: format!("token lookup longer than {MAX_LOOKUP_CHARS} characters"),
        });
    }
    Ok(normalized)
}

fn quote_literal(text: &str) -> String {
    text.replace('\'', "''")
}

fn like_pattern(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len() + 2);
    for c in text.chars() {
        if matches!(c, '%' | '_') || c == LIKE_ESCAPE {
            escaped.push(LIKE_ESCAPE);
        }
        escaped.push(c);
    }
    format!("%{}%", quote_literal(&escaped))
}

/// Exact, case-insensitive match on name or symbol. When several tokens
/// share a symbol the largest by market cap wins.
///
/// # Errors
///
/// Propagates [`normalize_lookup`] failures.
pub fn lookup_query(table: &str, name: &str) -> Result<PreparedQuery> {
    let name = quote_literal(&normalize_lookup(name)?);
    Ok(PreparedQuery::fixed(format!(
        "SELECT * FROM {table} WHERE LOWER(TOKEN_NAME) = '{name}' OR LOWER(TOKEN_SYMBOL) = '{name}' \
         ORDER BY MARKET_CAP DESC NULLS LAST LIMIT 1"
    )))
}

/// Substring match on name or symbol, largest tokens first.
///
/// # Errors
///
/// Propagates [`normalize_lookup`] failures.
pub fn search_query(table: &str, text: &str, limit: usize) -> Result<PreparedQuery> {
    let pattern = like_pattern(&normalize_lookup(text)?);
    Ok(PreparedQuery::fixed(format!(
        "SELECT * FROM {table} WHERE LOWER(TOKEN_NAME) LIKE '{pattern}' ESCAPE '{LIKE_ESCAPE}' \
         OR LOWER(TOKEN_SYMBOL) LIKE '{pattern}' ESCAPE '{LIKE_ESCAPE}' \
         ORDER BY MARKET_CAP DESC NULLS LAST LIMIT {}",
        limit.max(1)
    )))
}

/// `1.23B`, `4.50M`, `7.00K`, or two decimals below a thousand.
#[must_use]
pub fn format_compact_number(value: f64) -> String {
    let abs = value.abs();
    if abs >= 1e9 {
        format!("{:.2}B", value / 1e9)
    } else if abs >= 1e6 {
        format!("{:.2}M", value / 1e6)
    } else if abs >= 1e3 {
        format!("{:.2}K", value / 1e3)
    } else {
        format!("{value:.2}")
    }
}

#[allow(clippy::float_cmp)]
fn signal_label(signal: Option<f64>) -> &'static str {
    match signal.map(f64::round) {
        Some(s) if s == 1.0 => "🟢 Bullish",
        Some(s) if s == -1.0 => "🔴 Bearish",
        _ => "⚪ Neutral",
    }
}

#[allow(clippy::float_cmp)]
fn trend_label(trend: Option<f64>) -> &'static str {
    match trend.map(f64::round) {
        Some(t) if t == 1.0 => "📈 Uptrend",
        Some(t) if t == -1.0 => "📉 Downtrend",
        _ => "➡️ Sideways",
    }
}

fn grade(value: Option<f64>) -> String {
    value.map_or_else(|| "n/a".to_string(), |g| format!("{g:.0}"))
}

fn percent(value: Option<f64>) -> String {
    value.map_or_else(|| "n/a".to_string(), |p| format!("{p:.2}%"))
}

fn dollars(value: Option<f64>) -> String {
    value.map_or_else(|| "n/a".to_string(), |v| format!("${}", format_compact_number(v)))
}

/// Multi-line summary of grades, signals, and market data.
#[must_use]
pub fn format_token_metrics(metrics: &TokenMetrics) -> String {
    let name = metrics.name.as_deref().unwrap_or("Unknown");
    let mut out = match &metrics.symbol {
        Some(symbol) => format!("Token: {name} ({symbol})\n"),
        None => format!("Token: {name}\n"),
    };

    let _ = writeln!(
        out,
        "Price Changes: 1h: {} | 24h: {} | 7d: {}",
        percent(metrics.price_change_1h),
        percent(metrics.price_change_24h),
        percent(metrics.price_change_7d),
    );
    let _ = writeln!(out, "Market Cap: {}", dollars(metrics.market_cap));
    let _ = writeln!(out, "Volume (24h): {}", dollars(metrics.volume_24h));
    out.push_str("Grades:\n");
    let _ = writeln!(out, "- Trader: {}", grade(metrics.trader_grade));
    let _ = writeln!(out, "- Investor: {}", grade(metrics.investor_grade));
    let _ = writeln!(out, "- Technical: {}", grade(metrics.ta_grade));
    let _ = writeln!(out, "- Fundamental: {}", grade(metrics.fundamental_grade));
    out.push_str("Signals:\n");
    let _ = writeln!(out, "- Trading: {}", signal_label(metrics.trading_signal));
    let _ = writeln!(out, "- Trend: {}", trend_label(metrics.token_trend));
    if let Some(signal) = &metrics.trader_grade_signal {
        let _ = writeln!(out, "- Grade: {signal}");
    }
    if let Some(url) = &metrics.url {
        let _ = writeln!(out, "More Info: {url}");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row(value: Value) -> Row {
        match value {
            Value::Object(map) => map,
            _ => panic!("row must be an object"),
        }
    }

    #[test]
    fn test_lookup_query_normalizes_and_quotes() {
        let query = lookup_query("tokens", "  $BTC ").unwrap();
        assert!(query.sql.contains("LOWER(TOKEN_SYMBOL) = 'btc'"));
        assert!(query.sql.ends_with("LIMIT 1"));

        // Same token, same cache key.
        assert_eq!(query.cache_key, lookup_query("tokens", "btc").unwrap().cache_key);

        let quoted = lookup_query("tokens", "it's").unwrap();
        assert!(quoted.sql.contains("= 'it''s'"));
        crate::query::validate_select(&quoted.sql).unwrap();
    }

    #[test]
    fn test_lookup_rejects_empty_and_long_text() {
        assert!(matches!(
            lookup_query("tokens", " $ "),
            Err(XrError::InvalidArgument { .. })
        ));
        let long = "x".repeat(MAX_LOOKUP_CHARS + 1);
        assert!(search_query("tokens", &long, 5).is_err());
    }

    #[test]
    fn test_search_query_escapes_wildcards() {
        let query = search_query("tokens", "100%_dog", 7).unwrap();
        assert!(query.sql.contains("LIKE '%100!%!_dog%' ESCAPE '!'"));
        assert!(query.sql.ends_with("LIMIT 7"));
    }

    #[test]
    fn test_from_row_reads_numbers_and_json_text() {
        let metrics = TokenMetrics::from_row(&row(json!({
            "TOKEN_NAME": "Bitcoin",
            "TOKEN_SYMBOL": "BTC",
            "MARKET_CAP": 1.2e12,
            "TM_TRADER_GRADE": "85.4",
            "TRADING_SIGNAL": 1,
            "SUMMARY": "",
            "PRICE_CHANGE_PERCENTAGE": "{\"1h\": 0.5, \"24h\": -1.25, \"7d\": 3}"
        })));
        assert_eq!(metrics.symbol.as_deref(), Some("BTC"));
        assert_eq!(metrics.trader_grade, Some(85.4));
        assert_eq!(metrics.summary, None);
        assert_eq!(metrics.price_change_24h, Some(-1.25));
        assert_eq!(metrics.volume_24h, None);
    }

    #[test]
    fn test_format_compact_number() {
        assert_eq!(format_compact_number(1_234_000_000.0), "1.23B");
        assert_eq!(format_compact_number(4_500_000.0), "4.50M");
        assert_eq!(format_compact_number(7_000.0), "7.00K");
        assert_eq!(format_compact_number(12.0), "12.00");
    }

    #[test]
    fn test_format_token_metrics() {
        let metrics = TokenMetrics {
            name: Some("Bitcoin".into()),
            symbol: Some("BTC".into()),
            url: Some("https://example.com/btc".into()),
            market_cap: Some(1.2e12),
            volume_24h: Some(3.0e10),
            trader_grade: Some(85.0),
            trading_signal: Some(1.0),
            token_trend: Some(-1.0),
            trader_grade_signal: Some("BULLISH".into()),
            price_change_1h: Some(0.5),
            ..TokenMetrics::default()
        };
        let text = format_token_metrics(&metrics);
        assert!(text.starts_with("Token: Bitcoin (BTC)\n"));
        assert!(text.contains("Price Changes: 1h: 0.50% | 24h: n/a | 7d: n/a"));
        assert!(text.contains("Market Cap: $1200.00B"));
        assert!(text.contains("Volume (24h): $30.00B"));
        assert!(text.contains("- Trader: 85"));
        assert!(text.contains("- Investor: n/a"));
        assert!(text.contains("- Trading: 🟢 Bullish"));
        assert!(text.contains("- Trend: 📉 Downtrend"));
        assert!(text.contains("- Grade: BULLISH"));
        assert!(text.contains("More Info: https://example.com/btc"));
    }

    #[test]
    fn test_format_missing_signals_are_neutral() {
        let text = format_token_metrics(&TokenMetrics::default());
        assert!(text.starts_with("Token: Unknown\n"));
        assert!(text.contains("- Trading: ⚪ Neutral"));
        assert!(text.contains("- Trend: ➡️ Sideways"));
        assert!(!text.contains("More Info"));
    }
}
