use async_trait::async_trait;
use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::time::Duration;
use tracing::debug;

use crate::computer::Action;
use crate::error::ModelError;

// ========================= Wire Types =========================

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseId(pub String);

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ResponseStatus {
    Completed,
    InProgress,
    Incomplete,
    Queued,
    Failed,
    Cancelled,
    Other(String),
}

impl ResponseStatus {
    pub fn parse(s: &str) -> Self {
        match s {
            "completed" => ResponseStatus::Completed,
            "in_progress" => ResponseStatus::InProgress,
            "incomplete" => ResponseStatus::Incomplete,
            "queued" => ResponseStatus::Queued,
            "failed" => ResponseStatus::Failed,
            "cancelled" => ResponseStatus::Cancelled,
            other => ResponseStatus::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            ResponseStatus::Completed => "completed",
            ResponseStatus::InProgress => "in_progress",
            ResponseStatus::Incomplete => "incomplete",
            ResponseStatus::Queued => "queued",
            ResponseStatus::Failed => "failed",
            ResponseStatus::Cancelled => "cancelled",
            ResponseStatus::Other(s) => s,
        }
    }
}

impl fmt::Display for ResponseStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Hazard flag attached to a computer call; must be acknowledged before the
/// call's action runs.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SafetyCheck {
    pub id: String,
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Clone, Debug, PartialEq)]
pub enum OutputItem {
    Message {
        role: String,
        text: Vec<String>,
    },
    ComputerCall {
        call_id: String,
        action: Action,
        pending_safety_checks: Vec<SafetyCheck>,
    },
    FunctionCall {
        call_id: String,
        name: String,
        arguments: String,
    },
    Reasoning {
        summary: Vec<String>,
    },
    /// An item type this client does not know how to answer.
    Unknown(String),
}

/// The latest response for the active conversation. Never mutated after it
/// is received; the next response replaces it wholesale.
#[derive(Clone, Debug, PartialEq)]
pub struct Turn {
    pub id: ResponseId,
    pub status: ResponseStatus,
    pub output: Vec<OutputItem>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ComputerScreenshot {
    #[serde(rename = "type")]
    pub kind: String,
    pub image_url: String,
}

impl ComputerScreenshot {
    pub fn png_base64(data: &str) -> Self {
        Self {
            kind: "computer_screenshot".into(),
            image_url: format!("data:image/png;base64,{data}"),
        }
    }
}

/// One element of the next request's `input`.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InputItem {
    ComputerCallOutput {
        call_id: String,
        output: ComputerScreenshot,
        acknowledged_safety_checks: Vec<SafetyCheck>,
    },
    FunctionCallOutput {
        call_id: String,
        output: String,
    },
    Message {
        role: String,
        content: String,
    },
}

impl InputItem {
    pub fn user(content: impl Into<String>) -> Self {
        InputItem::Message {
            role: "user".into(),
            content: content.into(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ToolDescriptor {
    #[serde(rename = "computer_use_preview")]
    Computer {
        display_width: u32,
        display_height: u32,
        environment: String,
    },
    Function {
        name: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        description: Option<String>,
        parameters: Value,
    },
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ReasoningOptions {
    pub generate_summary: String,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ResponseRequest {
    pub model: String,
    pub input: Vec<InputItem>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub previous_response_id: Option<String>,
    pub tools: Vec<ToolDescriptor>,
    pub reasoning: ReasoningOptions,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    pub truncation: String,
    pub parallel_tool_calls: bool,
}

// ========================= Service Seam =========================

/// The remote agent-model service.
#[async_trait]
pub trait ResponsesApi: Send + Sync {
    async fn create(&self, request: &ResponseRequest) -> Result<Turn, ModelError>;
}

// ========================= HTTP Client =========================

#[derive(Clone, Debug, PartialEq)]
pub enum Endpoint {
    OpenAi { base_url: String, api_key: String },
    Azure {
        endpoint: String,
        api_key: String,
        api_version: String,
    },
}

#[derive(Clone)]
pub struct CuaClient {
    http: Client,
    endpoint: Endpoint,
    extra_headers: HeaderMap,
}

impl CuaClient {
    pub fn new(endpoint: Endpoint) -> Self {
        Self {
            http: Client::new(),
            endpoint,
            extra_headers: HeaderMap::new(),
        }
    }

    /// Headers sent with every request in addition to authentication.
    pub fn with_extra_headers(mut self, headers: HeaderMap) -> Self {
        self.extra_headers = headers;
        self
    }

    fn url(&self) -> String {
        match &self.endpoint {
            Endpoint::OpenAi { base_url, .. } => {
                format!("{}/responses", base_url.trim_end_matches('/'))
            }
            Endpoint::Azure {
                endpoint,
                api_version,
                ..
            } => format!(
                "{}/openai/responses?api-version={}",
                endpoint.trim_end_matches('/'),
                api_version
            ),
        }
    }

    fn sanitized(body: &Value) -> String {
        let mut body = body.clone();
        if let Some(items) = body.get_mut("input").and_then(|x| x.as_array_mut()) {
            for item in items {
                if let Some(url) = item.pointer_mut("/output/image_url") {
                    *url = Value::String("<omitted_base64_image>".into());
                }
            }
        }
        body.to_string()
    }
}

#[async_trait]
impl ResponsesApi for CuaClient {
    async fn create(&self, request: &ResponseRequest) -> Result<Turn, ModelError> {
        let body = serde_json::to_value(request).map_err(|e| ModelError::Other {
            status: None,
            message: format!("failed to encode request: {e}"),
        })?;
        debug!(body = %Self::sanitized(&body), "sending response request");

        let mut req = self
            .http
            .post(self.url())
            .headers(self.extra_headers.clone())
            .json(&body);
        req = match &self.endpoint {
            Endpoint::OpenAi { api_key, .. } => req.bearer_auth(api_key),
            Endpoint::Azure { api_key, .. } => req.header("api-key", api_key),
        };

        let resp = req.send().await.map_err(|e| ModelError::Other {
            status: None,
            message: e.to_string(),
        })?;
        let status = resp.status();
        let retry_after = retry_after_header(resp.headers());
        let text = resp.text().await.map_err(|e| ModelError::Other {
            status: Some(status.as_u16()),
            message: e.to_string(),
        })?;
        if !status.is_success() {
            return Err(classify_failure(status, retry_after, &text));
        }

        let v: Value = serde_json::from_str(&text)
            .map_err(|e| ModelError::Protocol(format!("response is not JSON: {e}")))?;
        parse_turn(&v)
    }
}

fn retry_after_header(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)
        .and_then(|h| h.to_str().ok())
        .and_then(|s| s.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

/// Maps a non-success HTTP reply onto the failure modes the resilience
/// policy understands.
pub fn classify_failure(status: StatusCode, retry_after: Option<Duration>, body: &str) -> ModelError {
    let message = serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| v.pointer("/error/message").and_then(|m| m.as_str()).map(str::to_string))
        .unwrap_or_else(|| body.to_string());

    if status == StatusCode::TOO_MANY_REQUESTS {
        ModelError::RateLimited {
            message,
            retry_after,
        }
    } else if status.is_server_error() {
        ModelError::Server {
            status: status.as_u16(),
            message,
        }
    } else {
        ModelError::Other {
            status: Some(status.as_u16()),
            message,
        }
    }
}

// ========================= Decoding =========================

/// The Responses API returns `{ id, status, output: [ ... ] }`.
pub fn parse_turn(v: &Value) -> Result<Turn, ModelError> {
    let id = v
        .get("id")
        .and_then(|x| x.as_str())
        .map(|s| ResponseId(s.to_string()))
        .ok_or_else(|| ModelError::Protocol("missing response id".into()))?;
    let status = v
        .get("status")
        .and_then(|x| x.as_str())
        .map(ResponseStatus::parse)
        .ok_or_else(|| ModelError::Protocol("missing response status".into()))?;
    let output = v
        .get("output")
        .and_then(|x| x.as_array())
        .map(|items| items.iter().map(parse_output_item).collect::<Result<Vec<_>, _>>())
        .transpose()?
        .unwrap_or_default();
    Ok(Turn { id, status, output })
}

fn str_field(v: &Value, key: &str) -> String {
    v.get(key).and_then(|x| x.as_str()).unwrap_or_default().to_string()
}

fn parse_output_item(o: &Value) -> Result<OutputItem, ModelError> {
    let kind = o.get("type").and_then(|x| x.as_str()).unwrap_or("unknown");
    let item = match kind {
        "message" => OutputItem::Message {
            role: str_field(o, "role"),
            text: o
                .get("content")
                .and_then(|x| x.as_array())
                .map(|parts| {
                    parts
                        .iter()
                        .filter(|p| p.get("type").and_then(|t| t.as_str()) == Some("output_text"))
                        .filter_map(|p| p.get("text").and_then(|t| t.as_str()))
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default(),
        },
        "computer_call" => {
            let raw = o
                .get("action")
                .cloned()
                .ok_or_else(|| ModelError::Protocol("computer_call without action".into()))?;
            let action_kind = str_field(&raw, "type");
            let action: Action = serde_json::from_value(raw)
                .map_err(|e| ModelError::Protocol(format!("computer action '{action_kind}': {e}")))?;
            let pending_safety_checks = o
                .get("pending_safety_checks")
                .cloned()
                .map(serde_json::from_value::<Vec<SafetyCheck>>)
                .transpose()
                .map_err(|e| ModelError::Protocol(format!("pending_safety_checks: {e}")))?
                .unwrap_or_default();
            OutputItem::ComputerCall {
                call_id: str_field(o, "call_id"),
                action,
                pending_safety_checks,
            }
        }
        "function_call" => OutputItem::FunctionCall {
            call_id: str_field(o, "call_id"),
            name: str_field(o, "name"),
            arguments: str_field(o, "arguments"),
        },
        "reasoning" => OutputItem::Reasoning {
            summary: o
                .get("summary")
                .and_then(|x| x.as_array())
                .map(|parts| {
                    parts
                        .iter()
                        .filter_map(|p| p.get("text").and_then(|t| t.as_str()))
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default(),
        },
        other => OutputItem::Unknown(other.to_string()),
    };
    Ok(item)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::computer::{MouseButton, Point};
    use serde_json::json;

    #[test]
    fn parses_a_full_turn() {
        let v = json!({
            "id": "resp_1",
            "status": "completed",
            "output": [
                {"type": "reasoning", "summary": [{"type": "summary_text", "text": "Clicking "}, {"type": "summary_text", "text": "start."}]},
                {"type": "computer_call", "call_id": "call_1",
                 "action": {"type": "click", "x": 5, "y": 6, "button": "left"},
                 "pending_safety_checks": [{"id": "sc_1", "code": "malicious_instructions", "message": "careful"}]},
                {"type": "message", "role": "assistant", "content": [{"type": "output_text", "text": "hi"}]}
            ]
        });
        let turn = parse_turn(&v).unwrap();
        assert_eq!(turn.id, ResponseId("resp_1".into()));
        assert_eq!(turn.status, ResponseStatus::Completed);
        assert_eq!(turn.output.len(), 3);
        match &turn.output[1] {
            OutputItem::ComputerCall { call_id, action, pending_safety_checks } => {
                assert_eq!(call_id, "call_1");
                assert_eq!(*action, Action::Click { x: 5, y: 6, button: MouseButton::Left });
                assert_eq!(pending_safety_checks[0].code.as_deref(), Some("malicious_instructions"));
            }
            other => panic!("unexpected item {other:?}"),
        }
    }

    #[test]
    fn drag_path_is_kept_in_order() {
        let v = json!({
            "id": "r", "status": "completed",
            "output": [{"type": "computer_call", "call_id": "c",
                        "action": {"type": "drag", "path": [{"x": 1, "y": 1}, {"x": 2, "y": 3}, {"x": 4, "y": 9}]}}]
        });
        let turn = parse_turn(&v).unwrap();
        let OutputItem::ComputerCall { action: Action::Drag { path }, .. } = &turn.output[0] else {
            panic!("expected drag");
        };
        assert_eq!(path, &vec![Point::new(1, 1), Point::new(2, 3), Point::new(4, 9)]);
    }

    #[test]
    fn unknown_items_survive_decoding() {
        let v = json!({"id": "r", "status": "completed", "output": [{"type": "web_search_call"}]});
        let turn = parse_turn(&v).unwrap();
        assert_eq!(turn.output, vec![OutputItem::Unknown("web_search_call".into())]);
    }

    #[test]
    fn unknown_action_kind_is_a_protocol_error() {
        let v = json!({"id": "r", "status": "completed",
                       "output": [{"type": "computer_call", "call_id": "c", "action": {"type": "teleport"}}]});
        assert!(matches!(parse_turn(&v), Err(ModelError::Protocol(_))));
    }

    #[test]
    fn classifies_http_failures() {
        let body = r#"{"error":{"message":"Rate limit reached. Please try again in 7s."}}"#;
        let err = classify_failure(StatusCode::TOO_MANY_REQUESTS, None, body);
        assert_eq!(
            err,
            ModelError::RateLimited {
                message: "Rate limit reached. Please try again in 7s.".into(),
                retry_after: None
            }
        );
        assert!(matches!(
            classify_failure(StatusCode::BAD_GATEWAY, None, "oops"),
            ModelError::Server { status: 502, .. }
        ));
        assert!(matches!(
            classify_failure(StatusCode::UNAUTHORIZED, None, "nope"),
            ModelError::Other { status: Some(401), .. }
        ));
    }

    #[test]
    fn request_serializes_like_the_responses_api() {
        let req = ResponseRequest {
            model: "computer-use-preview".into(),
            input: vec![
                InputItem::ComputerCallOutput {
                    call_id: "c1".into(),
                    output: ComputerScreenshot::png_base64("AAAA"),
                    acknowledged_safety_checks: vec![],
                },
                InputItem::user("go on"),
            ],
            previous_response_id: Some("resp_0".into()),
            tools: vec![ToolDescriptor::Computer {
                display_width: 1024,
                display_height: 768,
                environment: "browser".into(),
            }],
            reasoning: ReasoningOptions { generate_summary: "concise".into() },
            temperature: None,
            truncation: "auto".into(),
            parallel_tool_calls: false,
        };
        let v = serde_json::to_value(&req).unwrap();
        assert_eq!(v["input"][0]["type"], "computer_call_output");
        assert_eq!(v["input"][0]["output"]["image_url"], "data:image/png;base64,AAAA");
        assert_eq!(v["input"][1], json!({"type": "message", "role": "user", "content": "go on"}));
        assert_eq!(v["tools"][0]["type"], "computer_use_preview");
        assert!(v.get("temperature").is_none());
        assert_eq!(v["previous_response_id"], "resp_0");
    }

    #[test]
    fn azure_url_carries_api_version() {
        let client = CuaClient::new(Endpoint::Azure {
            endpoint: "https://example.openai.azure.com/".into(),
            api_key: "k".into(),
            api_version: "2025-03-01-preview".into(),
        });
        assert_eq!(
            client.url(),
            "https://example.openai.azure.com/openai/responses?api-version=2025-03-01-preview"
        );
    }
}
