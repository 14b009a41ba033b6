//! Deterministic query synthesis from free-text questions.
//!
//! A question becomes a [`QueryPlan`]: a mandatory display column set plus
//! any metric columns the question mentions, optional filter predicates, one
//! sort key with `NULLS LAST`, and a row limit. Everything is decided by the
//! static tables in this module, evaluated in order:
//!
//! | Rule             | Trigger (whole words)                 | Effect                          |
//! |------------------|---------------------------------------|---------------------------------|
//! | value sort       | value, price, worth, market cap, ...  | `MARKET_CAP DESC`               |
//! | grade sort       | grade, score, rating, ...             | `TM_TRADER_GRADE DESC`          |
//! | default sort     | anything else                         | `VOLUME_24H DESC`               |
//! | high threshold   | grade intent + high/highest/...       | `TM_TRADER_GRADE > 70`          |
//! | low threshold    | grade intent + low/lowest/...         | `TM_TRADER_GRADE < 30`, ASC     |
//! | single entity    | cashtag, "should i buy", "which token"| `LIMIT 1`, adds `SUMMARY`       |
//!
//! Sort rules are first-match-wins. A cashtag in the question (or, for a
//! single-entity question without one, in the conversation context) adds a
//! symbol filter.
//!
//! [`LlmPlanner`] can hand the question to a text generator instead; its
//! output is sanitized and validated, and the rule plan is used whenever the
//! generated SQL is empty or rejected.

use crate::canonicalize::{sanitize_generated_sql, sql_cache_key};
use crate::error::{Result, XrError};
use crate::llm::TextGenerator;
use crate::model::ModelClass;
use crate::prompts;
use aho_corasick::{AhoCorasick, MatchKind};
use once_cell::sync::Lazy;
use regex::Regex;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

/// Default warehouse view.
pub const DEFAULT_TABLE: &str = "TOKENMETRICS_DEV.ANALYTICS.CRYPTO_INFO_HUB_CURRENT_VIEW";

/// Columns present in every plan.
pub const MANDATORY_COLUMNS: &[&str] = &[
    "TOKEN_NAME",
    "TOKEN_SYMBOL",
    "TOKEN_URL",
    "MARKET_CAP",
    "FULLY_DILUTED_VALUATION",
];

/// Added to single-entity plans.
pub const SUMMARY_COLUMN: &str = "SUMMARY";

const VALUATION_COLUMN: &str = "MARKET_CAP";
const GRADE_COLUMN: &str = "TM_TRADER_GRADE";
const DEFAULT_SORT_COLUMN: &str = "VOLUME_24H";

/// A metric column the question can reference.
#[derive(Debug, Clone, Copy)]
pub struct ColumnSpec {
    pub name: &'static str,
    pub description: &'static str,
    /// Lowercase phrases that reference this column.
    pub keywords: &'static [&'static str],
}

/// Metric columns, in the order they are added to a plan.
pub const COLUMN_TABLE: &[ColumnSpec] = &[
    ColumnSpec {
        name: "TM_TRADER_GRADE",
        description: "Short-term trader grade (0-100) combining technical and quant signals",
        keywords: &["trader grade", "trading grade", "trader", "short term", "short-term"],
    },
    ColumnSpec {
        name: "TA_GRADE",
        description: "Technical analysis grade (0-100)",
        keywords: &["technical analysis", "ta grade", "technical", "chart", "charts"],
    },
    ColumnSpec {
        name: "QUANT_GRADE",
        description: "Quantitative grade (0-100)",
        keywords: &["quant", "quantitative"],
    },
    ColumnSpec {
        name: "TM_INVESTOR_GRADE",
        description: "Long-term investor grade (0-100)",
        keywords: &["investor grade", "investor", "long term", "long-term", "hodl"],
    },
    ColumnSpec {
        name: "FUNDAMENTAL_GRADE",
        description: "Fundamental analysis grade (0-100)",
        keywords: &["fundamental", "fundamentals", "tokenomics"],
    },
    ColumnSpec {
        name: "TECHNOLOGY_GRADE",
        description: "Technology and development activity grade (0-100)",
        keywords: &["technology", "tech", "development", "developer", "github"],
    },
    ColumnSpec {
        name: "VALUATION_GRADE",
        description: "Valuation grade relative to peers (0-100)",
        keywords: &["valuation", "undervalued", "overvalued"],
    },
    ColumnSpec {
        name: "TVL",
        description: "Total value locked in USD",
        keywords: &["tvl", "total value locked", "locked"],
    },
    ColumnSpec {
        name: "TRADING_SIGNAL",
        description: "Current trading signal (1 bullish, -1 bearish, 0 neutral)",
        keywords: &["signal", "signals", "bullish", "bearish"],
    },
    ColumnSpec {
        name: "TOKEN_TREND",
        description: "Current price trend direction",
        keywords: &["trend", "trending", "momentum"],
    },
    ColumnSpec {
        name: "VOLUME_24H",
        description: "Trading volume over the last 24 hours in USD",
        keywords: &["volume", "24h", "traded", "liquidity", "activity"],
    },
];

/// An ordered sort rule; the first whose terms match decides the sort key.
#[derive(Debug, Clone, Copy)]
pub struct SortRule {
    pub name: &'static str,
    pub terms: &'static [&'static str],
    pub column: &'static str,
}

pub const SORT_RULES: &[SortRule] = &[
    SortRule {
        name: "value",
        terms: &[
            "value", "valuable", "price", "priced", "worth", "market cap", "marketcap", "mcap",
            "biggest", "largest",
        ],
        column: VALUATION_COLUMN,
    },
    SortRule {
        name: "grade",
        terms: &["grade", "grades", "graded", "score", "scores", "rating", "rated"],
        column: GRADE_COLUMN,
    },
];

/// A grade threshold applied when the question has grade intent.
#[derive(Debug, Clone, Copy)]
pub struct ThresholdRule {
    pub terms: &'static [&'static str],
    pub comparison: Comparison,
    pub value: f64,
}

pub const GRADE_THRESHOLD_RULES: &[ThresholdRule] = &[
    ThresholdRule {
        terms: &["high", "higher", "highest", "highly", "strong", "strongest"],
        comparison: Comparison::GreaterThan,
        value: 70.0,
    },
    ThresholdRule {
        terms: &["low", "lower", "lowest", "weak", "weakest", "poor"],
        comparison: Comparison::LessThan,
        value: 30.0,
    },
];

/// Phrases that ask about exactly one token.
pub const SINGLE_ENTITY_TERMS: &[&str] = &[
    "should i buy",
    "should i sell",
    "which token",
    "which coin",
    "best token",
    "best coin",
    "next 100x",
    "tell me about",
    "what about",
];

static CASHTAG_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\$([A-Za-z][A-Za-z0-9]{0,9})\b").expect("valid cashtag regex"));

static COLUMN_MATCHER: Lazy<(AhoCorasick, Vec<usize>)> = Lazy::new(|| {
    let mut patterns = Vec::new();
    let mut owners = Vec::new();
    for (idx, column) in COLUMN_TABLE.iter().enumerate() {
        patterns.push(column.name.to_lowercase().replace('_', " "));
        owners.push(idx);
        for keyword in column.keywords {
            patterns.push((*keyword).to_string());
            owners.push(idx);
        }
    }
    let matcher = AhoCorasick::builder()
        .ascii_case_insensitive(true)
        .match_kind(MatchKind::LeftmostLongest)
        .build(&patterns)
        .expect("valid column patterns");
    (matcher, owners)
});

// =============================================================================
// Plan types
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Comparison {
    GreaterThan,
    LessThan,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Asc,
    Desc,
}

impl Direction {
    const fn as_sql(self) -> &'static str {
        match self {
            Self::Asc => "ASC",
            Self::Desc => "DESC",
        }
    }
}

/// One filter predicate.
#[derive(Debug, Clone, PartialEq)]
pub enum Predicate {
    Threshold {
        column: &'static str,
        comparison: Comparison,
        value: f64,
    },
    /// Case-insensitive symbol match; the symbol is alphanumeric only.
    SymbolEquals(String),
}

impl fmt::Display for Predicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Threshold {
                column,
                comparison,
                value,
            } => {
                let op = match comparison {
                    Comparison::GreaterThan => ">",
                    Comparison::LessThan => "<",
                };
                write!(f, "{column} {op} {value}")
            }
            Self::SymbolEquals(symbol) => {
                write!(f, "LOWER(TOKEN_SYMBOL) = LOWER('{symbol}')")
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SortKey {
    pub column: &'static str,
    pub direction: Direction,
}

/// Bounded specification of a warehouse query.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryPlan {
    pub columns: Vec<String>,
    pub filters: Vec<Predicate>,
    pub sort: SortKey,
    pub limit: usize,
    pub single_entity: bool,
}

impl QueryPlan {
    /// Top tokens by trader grade among liquid, sizeable markets.
    #[must_use]
    pub fn top_by_trader_grade(limit: usize) -> Self {
        let mut plan = Self::with_mandatory_columns();
        for column in [GRADE_COLUMN, "TA_GRADE", "QUANT_GRADE", "VOLUME_24H", "TRADING_SIGNAL"] {
            plan.add_column(column);
        }
        plan.filters = vec![
            Predicate::Threshold {
                column: "MARKET_CAP",
                comparison: Comparison::GreaterThan,
                value: 1_000_000.0,
            },
            Predicate::Threshold {
                column: "VOLUME_24H",
                comparison: Comparison::GreaterThan,
                value: 100_000.0,
            },
        ];
        plan.sort = SortKey {
            column: GRADE_COLUMN,
            direction: Direction::Desc,
        };
        plan.limit = limit.max(1);
        plan
    }

    fn with_mandatory_columns() -> Self {
        Self {
            columns: MANDATORY_COLUMNS.iter().map(|c| (*c).to_string()).collect(),
            filters: Vec::new(),
            sort: SortKey {
                column: DEFAULT_SORT_COLUMN,
                direction: Direction::Desc,
            },
            limit: 1,
            single_entity: false,
        }
    }

    fn add_column(&mut self, column: &str) {
        if !self.columns.iter().any(|c| c == column) {
            self.columns.push(column.to_string());
        }
    }

    #[must_use]
    pub fn selects(&self, column: &str) -> bool {
        self.columns.iter().any(|c| c == column)
    }

    /// Render as SQL against `table`.
    #[must_use]
    pub fn to_sql(&self, table: &str) -> String {
        let mut sql = format!("SELECT {} FROM {table}", self.columns.join(", "));
        if !self.filters.is_empty() {
            let clauses: Vec<String> = self.filters.iter().map(ToString::to_string).collect();
            sql.push_str(" WHERE ");
            sql.push_str(&clauses.join(" AND "));
        }
        sql.push_str(&format!(
            " ORDER BY {} {} NULLS LAST LIMIT {}",
            self.sort.column,
            self.sort.direction.as_sql(),
            self.limit
        ));
        sql
    }
}

/// Where a prepared statement came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlanOrigin {
    Rules,
    Generated,
}

/// SQL ready for execution, with its cache key.
#[derive(Debug, Clone, PartialEq)]
pub struct PreparedQuery {
    pub sql: String,
    pub cache_key: String,
    pub origin: PlanOrigin,
    /// Present when the SQL came from the rule table.
    pub plan: Option<QueryPlan>,
}

impl PreparedQuery {
    #[must_use]
    pub fn from_plan(plan: QueryPlan, table: &str) -> Self {
        let sql = plan.to_sql(table);
        Self {
            cache_key: sql_cache_key(&sql),
            sql,
            origin: PlanOrigin::Rules,
            plan: Some(plan),
        }
    }

    /// SQL from a fixed template, such as a single-token lookup.
    #[must_use]
    pub fn fixed(sql: String) -> Self {
        Self {
            cache_key: sql_cache_key(&sql),
            sql,
            origin: PlanOrigin::Rules,
            plan: None,
        }
    }

    fn generated(sql: String) -> Self {
        Self {
            cache_key: sql_cache_key(&sql),
            sql,
            origin: PlanOrigin::Generated,
            plan: None,
        }
    }
}

// =============================================================================
// Rule planner
// =============================================================================

/// Whole-word (or whole-phrase) containment on a lowercase haystack.
fn contains_term(haystack: &str, term: &str) -> bool {
    haystack.match_indices(term).any(|(start, _)| {
        let end = start + term.len();
        let before_ok = haystack[..start]
            .chars()
            .next_back()
            .is_none_or(|c| !c.is_alphanumeric());
        let after_ok = haystack[end..]
            .chars()
            .next()
            .is_none_or(|c| !c.is_alphanumeric());
        before_ok && after_ok
    })
}

fn contains_any(haystack: &str, terms: &[&str]) -> bool {
    terms.iter().any(|term| contains_term(haystack, term))
}

/// First cashtag symbol in `text`, lowercased.
#[must_use]
pub fn extract_cashtag(text: &str) -> Option<String> {
    CASHTAG_RE
        .captures(text)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_lowercase())
        .filter(|symbol| symbol.chars().all(|c| c.is_ascii_alphanumeric()))
}

/// Columns referenced by name or keyword, in table order.
fn referenced_columns(question: &str) -> Vec<&'static str> {
    let (matcher, owners) = &*COLUMN_MATCHER;
    let mut hits = vec![false; COLUMN_TABLE.len()];
    for found in matcher.find_iter(question) {
        let start = found.start();
        let end = found.end();
        let before_ok = question[..start]
            .chars()
            .next_back()
            .is_none_or(|c| !c.is_alphanumeric());
        let after_ok = question[end..]
            .chars()
            .next()
            .is_none_or(|c| !c.is_alphanumeric());
        if before_ok && after_ok {
            hits[owners[found.pattern().as_usize()]] = true;
        }
    }
    COLUMN_TABLE
        .iter()
        .zip(hits)
        .filter_map(|(column, hit)| hit.then_some(column.name))
        .collect()
}

/// Builds [`QueryPlan`]s from the rule tables.
#[derive(Debug, Clone)]
pub struct QueryPlanner {
    table: String,
    max_results: usize,
}

impl QueryPlanner {
    pub fn new(table: impl Into<String>, max_results: usize) -> Self {
        Self {
            table: table.into(),
            max_results: max_results.max(1),
        }
    }

    #[must_use]
    pub fn table(&self) -> &str {
        &self.table
    }

    #[must_use]
    pub const fn max_results(&self) -> usize {
        self.max_results
    }

    /// Derive a plan from `question`, using `context` only to resolve the
    /// token a single-entity question refers to.
    #[must_use]
    pub fn synthesize(&self, question: &str, context: &str) -> QueryPlan {
        let lower = question.to_lowercase();
        let mut plan = QueryPlan::with_mandatory_columns();
        plan.limit = self.max_results;

        for column in referenced_columns(question) {
            plan.add_column(column);
        }

        let sort_rule = SORT_RULES.iter().find(|rule| contains_any(&lower, rule.terms));
        plan.sort = SortKey {
            column: sort_rule.map_or(DEFAULT_SORT_COLUMN, |rule| rule.column),
            direction: Direction::Desc,
        };

        let grade_intent = SORT_RULES
            .iter()
            .filter(|rule| rule.column == GRADE_COLUMN)
            .any(|rule| contains_any(&lower, rule.terms));
        if grade_intent {
            if let Some(rule) = GRADE_THRESHOLD_RULES
                .iter()
                .find(|rule| contains_any(&lower, rule.terms))
            {
                plan.filters.push(Predicate::Threshold {
                    column: GRADE_COLUMN,
                    comparison: rule.comparison,
                    value: rule.value,
                });
                plan.add_column(GRADE_COLUMN);
                if rule.comparison == Comparison::LessThan && plan.sort.column == GRADE_COLUMN {
                    plan.sort.direction = Direction::Asc;
                }
            }
        }

        let question_symbol = extract_cashtag(question);
        let single_entity = question_symbol.is_some() || contains_any(&lower, SINGLE_ENTITY_TERMS);
        let symbol = question_symbol.or_else(|| {
            if single_entity {
                extract_cashtag(context)
            } else {
                None
            }
        });
        if let Some(symbol) = symbol {
            plan.filters.push(Predicate::SymbolEquals(symbol));
        }
        if single_entity {
            plan.single_entity = true;
            plan.limit = 1;
            plan.add_column(SUMMARY_COLUMN);
        }

        plan.add_column(plan.sort.column);
        debug!(
            sort = plan.sort.column,
            limit = plan.limit,
            filters = plan.filters.len(),
            "synthesized query plan"
        );
        plan
    }

    /// Synthesize and render in one step.
    #[must_use]
    pub fn prepare(&self, question: &str, context: &str) -> PreparedQuery {
        PreparedQuery::from_plan(self.synthesize(question, context), &self.table)
    }
}

// =============================================================================
// Generated SQL
// =============================================================================

const FORBIDDEN_KEYWORDS: &[&str] = &[
    "insert", "update", "delete", "drop", "alter", "create", "attach", "detach", "pragma",
    "grant", "revoke", "truncate", "merge", "replace", "vacuum", "copy", "put",
];

/// Accept only a single read-only `SELECT`/`WITH` statement.
///
/// # Errors
///
/// Returns `XrError::UnsafeQuery` describing the first problem found.
pub fn validate_select(sql: &str) -> Result<()> {
    let lower = sql.trim().to_lowercase();
    if lower.is_empty() {
        return Err(XrError::unsafe_query("empty statement"));
    }
    if !(lower.starts_with("select") || lower.starts_with("with")) {
        return Err(XrError::unsafe_query("statement must start with SELECT or WITH"));
    }
    if lower.contains(';') {
        return Err(XrError::unsafe_query("multiple statements"));
    }
    if let Some(keyword) = FORBIDDEN_KEYWORDS.iter().find(|k| contains_term(&lower, k)) {
        return Err(XrError::unsafe_query(format!("contains {}", keyword.to_uppercase())));
    }
    Ok(())
}

/// Asks a text generator for SQL, falling back to the rule planner.
pub struct LlmPlanner {
    rules: QueryPlanner,
    generator: Arc<dyn TextGenerator>,
}

impl LlmPlanner {
    #[must_use]
    pub fn new(rules: QueryPlanner, generator: Arc<dyn TextGenerator>) -> Self {
        Self { rules, generator }
    }

    #[must_use]
    pub const fn rules(&self) -> &QueryPlanner {
        &self.rules
    }

    /// Generated SQL when it passes validation, the rule plan otherwise.
    pub async fn prepare(&self, question: &str, context: &str) -> PreparedQuery {
        let prompt = prompts::sql_prompt(
            self.rules.table(),
            COLUMN_TABLE,
            self.rules.max_results(),
            question,
            context,
        );

        let raw = match self.generator.generate(&prompt, ModelClass::Small).await {
            Ok(raw) => raw,
            Err(e) => {
                warn!(error = %e, "SQL generation failed; using rule plan");
                return self.rules.prepare(question, context);
            }
        };

        let sql = sanitize_generated_sql(&raw);
        match validate_select(&sql) {
            Ok(()) => {
                debug!(sql = %sql, "using generated SQL");
                PreparedQuery::generated(sql)
            }
            Err(e) => {
                warn!(error = %e, "rejected generated SQL; using rule plan");
                self.rules.prepare(question, context)
            }
        }
    }
}
