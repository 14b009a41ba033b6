//! Prompt templates.
//!
//! Wording is deliberately plain; the parsers in [`crate::llm`] and
//! [`crate::canonicalize`] tolerate whatever formatting the model adds.

use crate::model::{CandidatePost, ConversationThread, Row};
use crate::query::ColumnSpec;
use std::fmt::Write;

/// Respond/ignore/stop gate for one post.
#[must_use]
pub fn should_respond(
    agent_handle: &str,
    target_users: &[String],
    post: &CandidatePost,
    thread: &ConversationThread,
) -> String {
    let mut prompt = format!(
        "You are @{agent_handle}, an account that answers crypto market questions with data.\n\n\
         Decide whether to reply to the current post.\n\
         - RESPOND to direct questions about tokens, grades, prices, volume, or market data.\n\
         - IGNORE greetings, spam, insults, and posts with nothing to answer.\n\
         - STOP if the user asks you to stop or the conversation is over.\n"
    );
    if !target_users.is_empty() {
        let _ = writeln!(
            prompt,
            "- Posts from these accounts get priority; RESPOND unless clearly irrelevant: {}",
            target_users.join(", ")
        );
    }
    let _ = write!(
        prompt,
        "\nThread:\n{}\n\nCurrent post from @{} ({}):\n{}\n\n\
         Answer with exactly one of [RESPOND], [IGNORE], or [STOP].",
        thread.format_conversation(),
        post.author_handle,
        post.display_name(),
        post.text
    );
    prompt
}

/// SQL generation prompt with schema, rules, and worked examples.
#[must_use]
pub fn sql_prompt(
    table: &str,
    columns: &[ColumnSpec],
    max_results: usize,
    question: &str,
    context: &str,
) -> String {
    let mut prompt = format!(
        "Write one SQL SELECT statement that answers the question.\n\nTable: {table}\n\nColumns:\n\
         - TOKEN_NAME: token name\n\
         - TOKEN_SYMBOL: ticker symbol\n\
         - TOKEN_URL: token page URL\n\
         - MARKET_CAP: market capitalization in USD\n\
         - FULLY_DILUTED_VALUATION: fully diluted valuation in USD\n\
         - SUMMARY: short text summary of the token\n"
    );
    for column in columns {
        let _ = writeln!(prompt, "- {}: {}", column.name, column.description);
    }
    let _ = write!(
        prompt,
        "\nRules:\n\
         - Always select TOKEN_NAME, TOKEN_SYMBOL, TOKEN_URL, MARKET_CAP, FULLY_DILUTED_VALUATION.\n\
         - Match names with LOWER(TOKEN_NAME) or LOWER(TOKEN_SYMBOL).\n\
         - For a question about a single token, select SUMMARY and use LIMIT 1.\n\
         - Every ORDER BY uses NULLS LAST.\n\
         - Never return more than {max_results} rows.\n\
         - Output only the SQL. No explanation, no semicolon.\n\n\
         Examples:\n\
         Q: top tokens by trader grade\n\
         SELECT TOKEN_NAME, TOKEN_SYMBOL, TOKEN_URL, MARKET_CAP, FULLY_DILUTED_VALUATION, TM_TRADER_GRADE FROM {table} ORDER BY TM_TRADER_GRADE DESC NULLS LAST LIMIT {max_results}\n\
         Q: should I buy $ETH?\n\
         SELECT TOKEN_NAME, TOKEN_SYMBOL, TOKEN_URL, MARKET_CAP, FULLY_DILUTED_VALUATION, SUMMARY, TM_TRADER_GRADE FROM {table} WHERE LOWER(TOKEN_SYMBOL) = LOWER('eth') ORDER BY MARKET_CAP DESC NULLS LAST LIMIT 1\n\n\
         Conversation:\n{context}\n\nQuestion: {question}\nSQL:"
    );
    prompt
}

/// Reply grounded in query rows.
#[must_use]
pub fn data_reply(
    agent_handle: &str,
    post: &CandidatePost,
    thread: &ConversationThread,
    question: &str,
    rows: &[Row],
    max_chars: usize,
) -> String {
    format!(
        "You are @{agent_handle}. Reply to @{author} using only the data below.\n\
         Keep it under {max_chars} characters, no hashtags, no financial advice disclaimers \
         longer than a few words.\n\n\
         Thread:\n{thread}\n\nQuestion: {question}\n\nData (JSON rows):\n{data}\n\nReply:",
        author = post.author_handle,
        thread = thread.format_conversation(),
        data = rows_as_json(rows),
    )
}

/// Which actions to take on a timeline post.
#[must_use]
pub fn timeline_actions(agent_handle: &str, post: &CandidatePost) -> String {
    format!(
        "You are @{agent_handle}. Decide how to engage with this post from @{author}:\n\n{text}\n\n\
         Choose any of [LIKE], [RETWEET], [QUOTE], [REPLY]. Only pick actions that fit a \
         data-focused crypto account. Output the chosen tags and nothing else.",
        author = post.author_handle,
        text = post.text,
    )
}

/// Quote or reply text for a timeline action.
#[must_use]
pub fn action_content(
    agent_handle: &str,
    kind: &str,
    post: &CandidatePost,
    thread: &ConversationThread,
    max_chars: usize,
) -> String {
    format!(
        "You are @{agent_handle}. Write a {kind} to the last post in this thread, under \
         {max_chars} characters.\n\nThread:\n{}\n\n{kind}:",
        thread_or_post(thread, post),
    )
}

/// Original post built from the top-token rows.
#[must_use]
pub fn data_post(agent_handle: &str, rows: &[Row], max_chars: usize) -> String {
    format!(
        "You are @{agent_handle}. Write one post (under {max_chars} characters) highlighting \
         what stands out in today's top tokens by trader grade. Mention symbols with $.\n\n\
         Data (JSON rows):\n{}\n\nPost:",
        rows_as_json(rows),
    )
}

fn thread_or_post(thread: &ConversationThread, post: &CandidatePost) -> String {
    if thread.is_empty() {
        format!("@{}: {}", post.author_handle, post.text)
    } else {
        thread.format_conversation()
    }
}

fn rows_as_json(rows: &[Row]) -> String {
    serde_json::to_string_pretty(rows).unwrap_or_else(|_| "[]".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::COLUMN_TABLE;

    #[test]
    fn test_should_respond_mentions_targets() {
        let post = CandidatePost::new("1", "u", "alice", "which token has the best grade?");
        let thread = ConversationThread::from_posts(vec![post.clone()]);
        let prompt = should_respond("bot", &["vip".to_string()], &post, &thread);
        assert!(prompt.contains("@bot"));
        assert!(prompt.contains("vip"));
        assert!(prompt.contains("[RESPOND]"));
        assert!(prompt.contains("which token has the best grade?"));
    }

    #[test]
    fn test_sql_prompt_lists_columns() {
        let prompt = sql_prompt("tokens", COLUMN_TABLE, 5, "top grade", "");
        for column in COLUMN_TABLE {
            assert!(prompt.contains(column.name));
        }
        assert!(prompt.contains("LIMIT 5"));
        assert!(prompt.ends_with("Question: top grade\nSQL:"));
    }

    #[test]
    fn test_data_reply_embeds_rows() {
        let post = CandidatePost::new("1", "u", "alice", "q");
        let mut row = Row::new();
        row.insert("TOKEN_SYMBOL".into(), serde_json::json!("BTC"));
        let prompt = data_reply("bot", &post, &ConversationThread::default(), "q", &[row], 280);
        assert!(prompt.contains("\"TOKEN_SYMBOL\": \"BTC\""));
        assert!(prompt.contains("280"));
    }
}
