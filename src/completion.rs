use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::config::OpenAiConfig;
use crate::relay::session::Turn;

/// Speaker of one conversation turn, in chat-completions terms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// A tool invocation the model asked for. `id` correlates the request with
/// its result turn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolCallRequest {
    pub id: String,
    pub name: String,
    pub arguments: serde_json::Value,
}

/// What one completion call produced: a final reply, or tool work to do
/// before a follow-up call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompletionOutcome {
    Reply(String),
    ToolCalls(Vec<ToolCallRequest>),
}

#[derive(Debug, thiserror::Error)]
pub enum CompletionError {
    #[error("completion request failed: {0}")]
    Request(String),
    #[error("completion API error: {0}")]
    Api(String),
    #[error("failed to parse completion response: {0}")]
    Parse(String),
}

/// Abstraction over the external text-generation call, so the dispatcher
/// can be tested without the network.
#[async_trait]
pub trait CompletionBackend: Send + Sync {
    /// Run one completion over the full turn sequence. `tools` is the
    /// catalog offered to the model; pass `None` for the follow-up call
    /// after tool results so tool calls are never chained.
    async fn complete(
        &self,
        turns: &[Turn],
        tools: Option<&[serde_json::Value]>,
    ) -> Result<CompletionOutcome, CompletionError>;
}

/// OpenAI chat-completions client.
pub struct OpenAiClient {
    client: reqwest::Client,
    url: String,
    api_key: String,
    model: String,
    max_tokens: u32,
    temperature: f32,
}

impl OpenAiClient {
    pub fn new(config: &OpenAiConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: "https://api.openai.com/v1/chat/completions".to_string(),
            api_key: config.api_key.clone(),
            model: config.model.clone(),
            max_tokens: config.max_tokens,
            temperature: config.temperature,
        }
    }
}

#[async_trait]
impl CompletionBackend for OpenAiClient {
    async fn complete(
        &self,
        turns: &[Turn],
        tools: Option<&[serde_json::Value]>,
    ) -> Result<CompletionOutcome, CompletionError> {
        let mut body = json!({
            "model": self.model,
            "messages": wire_messages(turns),
            "max_tokens": self.max_tokens,
            "temperature": self.temperature,
        });
        if let Some(tools) = tools {
            body["tools"] = json!(tools);
            body["tool_choice"] = json!("auto");
        }

        let resp = self
            .client
            .post(&self.url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| CompletionError::Request(e.to_string()))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(CompletionError::Api(format!("HTTP {status}: {body}")));
        }

        let parsed: ChatResponse = resp
            .json()
            .await
            .map_err(|e| CompletionError::Parse(e.to_string()))?;

        into_outcome(parsed)
    }
}

/// Serialize turns into chat-completions message objects.
///
/// Assistant turns that requested tools carry a `tool_calls` array with the
/// arguments re-encoded as a JSON string; tool-result turns carry the
/// correlating `tool_call_id`.
fn wire_messages(turns: &[Turn]) -> Vec<serde_json::Value> {
    turns
        .iter()
        .map(|turn| match turn.role {
            Role::Tool => json!({
                "role": "tool",
                "tool_call_id": turn.tool_call_id.as_deref().unwrap_or_default(),
                "content": turn.content,
            }),
            Role::Assistant if !turn.tool_calls.is_empty() => json!({
                "role": "assistant",
                "content": serde_json::Value::Null,
                "tool_calls": turn.tool_calls.iter().map(|call| json!({
                    "id": call.id,
                    "type": "function",
                    "function": {
                        "name": call.name,
                        "arguments": call.arguments.to_string(),
                    },
                })).collect::<Vec<_>>(),
            }),
            role => json!({ "role": role, "content": turn.content }),
        })
        .collect()
}

fn into_outcome(response: ChatResponse) -> Result<CompletionOutcome, CompletionError> {
    let choice = response
        .choices
        .into_iter()
        .next()
        .ok_or_else(|| CompletionError::Parse("no choices in response".to_string()))?;

    if let Some(calls) = choice.message.tool_calls {
        if !calls.is_empty() {
            let requests = calls
                .into_iter()
                .map(|call| {
                    let arguments = serde_json::from_str(&call.function.arguments)
                        .map_err(|e| {
                            CompletionError::Parse(format!("bad tool arguments: {e}"))
                        })?;
                    Ok(ToolCallRequest {
                        id: call.id,
                        name: call.function.name,
                        arguments,
                    })
                })
                .collect::<Result<Vec<_>, CompletionError>>()?;
            return Ok(CompletionOutcome::ToolCalls(requests));
        }
    }

    let text = choice
        .message
        .content
        .ok_or_else(|| CompletionError::Parse("empty assistant message".to_string()))?;
    Ok(CompletionOutcome::Reply(text))
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<WireToolCall>>,
}

#[derive(Debug, Deserialize)]
struct WireToolCall {
    id: String,
    function: WireFunction,
}

#[derive(Debug, Deserialize)]
struct WireFunction {
    name: String,
    arguments: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::session::Turn;

    #[test]
    fn plain_turns_serialize_with_role_and_content() {
        let turns = vec![
            Turn::system("You are Sarah."),
            Turn::user("hi"),
            Turn::assistant("Hello! How can I help?"),
        ];
        let messages = wire_messages(&turns);
        assert_eq!(
            messages[0],
            json!({ "role": "system", "content": "You are Sarah." })
        );
        assert_eq!(messages[1]["role"], "user");
        assert_eq!(messages[2]["role"], "assistant");
    }

    #[test]
    fn tool_round_trip_serializes_with_correlation_ids() {
        let call = ToolCallRequest {
            id: "call_1".into(),
            name: "check_availability".into(),
            arguments: json!({ "date": "2025-03-14" }),
        };
        let turns = vec![
            Turn::assistant_tool_calls(vec![call]),
            Turn::tool_result("call_1", json!({ "available": true }).to_string()),
        ];
        let messages = wire_messages(&turns);

        assert_eq!(messages[0]["role"], "assistant");
        assert!(messages[0]["content"].is_null());
        assert_eq!(
            messages[0]["tool_calls"][0]["function"]["name"],
            "check_availability"
        );
        // Arguments go over the wire as a JSON string
        assert_eq!(
            messages[0]["tool_calls"][0]["function"]["arguments"],
            r#"{"date":"2025-03-14"}"#
        );
        assert_eq!(messages[1]["role"], "tool");
        assert_eq!(messages[1]["tool_call_id"], "call_1");
    }

    #[test]
    fn response_with_text_becomes_reply() {
        let response: ChatResponse = serde_json::from_value(json!({
            "choices": [{ "message": { "content": "We open at 9am." } }]
        }))
        .unwrap();
        assert_eq!(
            into_outcome(response).unwrap(),
            CompletionOutcome::Reply("We open at 9am.".into())
        );
    }

    #[test]
    fn response_with_tool_calls_becomes_tool_outcome() {
        let response: ChatResponse = serde_json::from_value(json!({
            "choices": [{ "message": {
                "content": null,
                "tool_calls": [{
                    "id": "call_9",
                    "type": "function",
                    "function": {
                        "name": "book_appointment",
                        "arguments": "{\"date\":\"tomorrow\",\"time\":\"2pm\"}"
                    }
                }]
            }}]
        }))
        .unwrap();
        match into_outcome(response).unwrap() {
            CompletionOutcome::ToolCalls(calls) => {
                assert_eq!(calls.len(), 1);
                assert_eq!(calls[0].name, "book_appointment");
                assert_eq!(calls[0].arguments["time"], "2pm");
            }
            other => panic!("expected tool calls, got {other:?}"),
        }
    }

    #[test]
    fn empty_choices_is_a_parse_error() {
        let response: ChatResponse = serde_json::from_value(json!({ "choices": [] })).unwrap();
        assert!(matches!(
            into_outcome(response),
            Err(CompletionError::Parse(_))
        ));
    }
}
