//! Request rewriting.
//!
//! Two idempotent transformations between route selection and send:
//! channel system-prompt injection and optional search augmentation.
//! Augmentation asks a configured probe model whether the conversation
//! warrants a web search, runs it against SearXNG and embeds the
//! results into the last user message. Every failure here is logged and
//! swallowed; the relay request proceeds unmodified.

use serde::Deserialize;
use serde_json::{json, Value};

use crate::config;
use crate::db::Channel;
use crate::{logger, relay::quota};

use super::context::RelayContext;
use super::types::{
    ChatCompletionRequest, ChatCompletionResponse, ChatMessage, MessageContent, Usage, ROLE_USER,
};

/// Prepend the channel's system prompt, when it has one.
pub fn apply_system_prompt(channel: &Channel, request: &mut ChatCompletionRequest) {
    if channel.system_prompt.is_empty() {
        return;
    }
    request
        .messages
        .insert(0, ChatMessage::system(channel.system_prompt.clone()));
}

const SEARCH_TEMPLATE: &str = r#"# The following are web search results for the user's message:
{results}

Each result above is wrapped in a JSON document with url, title and content
fields. Cite the sources you rely on inline, right where they support a
statement, as [n](url), and close with a reference list of the cited entries.
When answering, note:
- Today is {date}.
- Not every result is relevant; weigh and filter them against the question.
- Synthesize across several results rather than repeating a single page.
- Answer in the same language the user asked in unless told otherwise.

# The user's message is:
{message}"#;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SearchResultEntry {
    pub url: String,
    pub title: String,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub score: f64,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SearchResponse {
    #[serde(default)]
    pub query: String,
    #[serde(default)]
    pub number_of_results: i64,
    #[serde(default)]
    pub results: Vec<SearchResultEntry>,
    #[serde(default)]
    pub suggestions: Vec<String>,
}

/// Text of the last two messages, `role: text` per line. Empty when the
/// conversation does not end on a user turn.
pub fn extract_recent_text(request: &ChatCompletionRequest) -> String {
    let Some(last) = request.messages.last() else {
        return String::new();
    };
    if last.role != ROLE_USER {
        return String::new();
    }

    let start = request.messages.len().saturating_sub(2);
    let mut out = String::new();
    for message in &request.messages[start..] {
        let text = message.content.plain_text();
        if !text.is_empty() {
            out.push_str(&format!("{}: {}\n", message.role, text));
        }
    }
    out
}

/// Extract the probe's `search(query=...)` tool call, if it made one.
pub fn parse_probe_query(response: &ChatCompletionResponse) -> Option<String> {
    let calls = response.choices.first()?.message.tool_calls.as_ref()?;
    let call = calls.first()?;
    if call.function.name != "search" {
        return None;
    }
    let args: Value = serde_json::from_str(&call.function.arguments).ok()?;
    args.get("query")
        .and_then(|q| q.as_str())
        .map(|q| q.to_string())
        .filter(|q| !q.is_empty())
}

fn probe_request(user_text: &str, model: &str) -> Value {
    let now = chrono::Local::now().format("%Y-%m-%d %H:%M:%S");
    json!({
        "model": model,
        "messages": [
            {
                "role": "system",
                "content": format!(
                    "Current time: {}. You are a web search assistant. Decide whether the \
                     conversation below needs a web search. If it does, call the search tool \
                     with a query in the user's language; if not, reply with the digit 0.",
                    now
                ),
            },
            {"role": "user", "content": user_text},
        ],
        "tools": [{
            "type": "function",
            "function": {
                "name": "search",
                "description": "Searches the web for information.\n\n    Args:\n        query: keyword to search for",
                "parameters": {
                    "type": "object",
                    "properties": {"query": {"type": "string"}},
                    "required": ["query"],
                },
            },
        }],
    })
}

async fn run_probe(
    ctx: &RelayContext,
    search_cfg: &config::SearchConfig,
    user_text: &str,
) -> Option<String> {
    let url = search_cfg.ai_url.as_deref()?;
    let client = reqwest::Client::new();
    let mut builder = client.post(url).json(&probe_request(user_text, &search_cfg.ai_model));
    if let Some(key) = search_cfg.ai_key.as_deref() {
        builder = builder.bearer_auth(key);
    }

    let response = match builder.send().await {
        Ok(r) => r,
        Err(e) => {
            logger::warn("search", &format!("probe request failed: {}", e));
            return None;
        }
    };
    let payload: ChatCompletionResponse = match response.json().await {
        Ok(p) => p,
        Err(e) => {
            logger::warn("search", &format!("probe response unreadable: {}", e));
            return None;
        }
    };

    // The probe runs on the caller's dime.
    if let Some(usage) = payload.usage {
        if let Err(e) = quota::consume_probe(ctx, &search_cfg.ai_model, &usage) {
            logger::warn("search", &format!("probe billing failed: {}", e));
        }
    } else {
        let _ = quota::consume_probe(ctx, &search_cfg.ai_model, &Usage::default());
    }

    parse_probe_query(&payload)
}

async fn run_searxng(base_url: &str, query: &str) -> Option<SearchResponse> {
    let url = format!("{}/search", base_url.trim_end_matches('/'));
    let client = reqwest::Client::new();
    let response = client
        .get(&url)
        .query(&[
            ("q", query),
            ("category_general", "1"),
            ("format", "json"),
            ("engines", "bing,google"),
            ("safesearch", "2"),
        ])
        .send()
        .await
        .ok()?;
    response.json::<SearchResponse>().await.ok()
}

/// Render the augmented last-message text.
pub fn render_search_message(results: &SearchResponse, user_text: &str) -> String {
    let results_json = serde_json::to_string(
        &results
            .results
            .iter()
            .map(|r| json!({"url": r.url, "title": r.title, "content": r.content, "score": r.score}))
            .collect::<Vec<_>>(),
    )
    .unwrap_or_else(|_| "[]".to_string());

    SEARCH_TEMPLATE
        .replace("{results}", &results_json)
        .replace("{date}", &chrono::Local::now().format("%Y-%m-%d %H:%M:%S").to_string())
        .replace("{message}", user_text)
}

/// Search augmentation entry point. Runs when globally configured and
/// either the channel opts in or the caller set `enable_search`.
pub async fn apply_search(
    ctx: &RelayContext,
    channel: &Channel,
    request: &mut ChatCompletionRequest,
) {
    let settings = config::load();
    if !settings.search.is_enabled() {
        return;
    }
    if !(channel.enable_search || request.enable_search) {
        return;
    }

    let user_text = extract_recent_text(request);
    if user_text.is_empty() {
        return;
    }

    let Some(query) = run_probe(ctx, &settings.search, &user_text).await else {
        return;
    };
    logger::info("search", &format!("probe requested search: {}", query));

    let Some(searxng) = settings.search.searxng.as_deref() else {
        return;
    };
    let Some(results) = run_searxng(searxng, &query).await else {
        logger::warn("search", "searxng fetch failed, leaving request unmodified");
        return;
    };
    if results.results.is_empty() {
        return;
    }

    if let Some(last) = request.messages.last_mut() {
        last.content = MessageContent::Text(render_search_message(&results, &user_text));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::types::{Choice, FunctionCall, ResponseMessage, ToolCall};

    #[test]
    fn system_prompt_prepends_once_per_attempt() {
        let channel = Channel { system_prompt: "You are terse.".to_string(), ..Default::default() };
        let mut request = ChatCompletionRequest {
            model: "m".to_string(),
            messages: vec![ChatMessage::user("hi")],
            ..Default::default()
        };
        apply_system_prompt(&channel, &mut request);
        assert_eq!(request.messages.len(), 2);
        assert_eq!(request.messages[0].role, "system");
        assert_eq!(request.messages[0].content.plain_text(), "You are terse.");

        let empty = Channel::default();
        apply_system_prompt(&empty, &mut request);
        assert_eq!(request.messages.len(), 2);
    }

    #[test]
    fn recent_text_requires_a_trailing_user_turn() {
        let mut request = ChatCompletionRequest {
            model: "m".to_string(),
            messages: vec![
                ChatMessage::user("first question"),
                ChatMessage {
                    role: "assistant".to_string(),
                    content: MessageContent::Text("an answer".to_string()),
                    ..Default::default()
                },
                ChatMessage::user("follow-up"),
            ],
            ..Default::default()
        };
        let text = extract_recent_text(&request);
        assert!(text.contains("assistant: an answer"));
        assert!(text.contains("user: follow-up"));
        assert!(!text.contains("first question"));

        request.messages.pop();
        assert!(extract_recent_text(&request).is_empty());
    }

    fn probe_response(calls: Option<Vec<ToolCall>>) -> ChatCompletionResponse {
        ChatCompletionResponse {
            choices: vec![Choice {
                index: 0,
                message: ResponseMessage {
                    role: "assistant".to_string(),
                    content: Some("0".to_string()),
                    tool_calls: calls,
                },
                finish_reason: None,
            }],
            ..Default::default()
        }
    }

    #[test]
    fn probe_query_comes_from_the_search_tool_call() {
        let calls = vec![ToolCall {
            id: "call_1".to_string(),
            call_type: "function".to_string(),
            function: FunctionCall {
                name: "search".to_string(),
                arguments: r#"{"query":"rust async runtime"}"#.to_string(),
            },
        }];
        assert_eq!(
            parse_probe_query(&probe_response(Some(calls))).as_deref(),
            Some("rust async runtime")
        );
        assert_eq!(parse_probe_query(&probe_response(None)), None);

        let wrong_tool = vec![ToolCall {
            function: FunctionCall { name: "lookup".to_string(), arguments: "{}".to_string() },
            ..Default::default()
        }];
        assert_eq!(parse_probe_query(&probe_response(Some(wrong_tool))), None);
    }

    #[test]
    fn searxng_response_parses_and_renders() {
        let raw = r#"{
            "query": "rust async",
            "number_of_results": 2,
            "results": [
                {"url": "https://a.example", "title": "A", "content": "alpha", "score": 1.5,
                 "positions": [1], "category": "general", "thumbnail": null},
                {"url": "https://b.example", "title": "B", "content": "beta", "score": 0.5}
            ],
            "suggestions": ["rust tokio"]
        }"#;
        let parsed: SearchResponse = serde_json::from_str(raw).unwrap();
        assert_eq!(parsed.results.len(), 2);
        assert_eq!(parsed.suggestions, vec!["rust tokio"]);

        let rendered = render_search_message(&parsed, "user: what is tokio?\n");
        assert!(rendered.contains("https://a.example"));
        assert!(rendered.contains("what is tokio?"));
        assert!(rendered.contains("Today is"));
    }
}
