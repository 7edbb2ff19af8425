//! OpenAI-compatible request and response types.
//!
//! Request types keep unknown fields through `serde(flatten)` so provider
//! extensions pass through untouched; the router only interprets the
//! fields it needs (`model`, `stream`, and the routing hint `provider`,
//! which is stripped before forwarding).

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// One chat message. Content is untyped to allow multimodal payloads.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: Value,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// `POST /v1/chat/completions` request body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatCompletionRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream: Option<bool>,
    /// Routing hint: pin a specific provider id. Never forwarded upstream.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// `POST /v1/completions` request body (legacy surface).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionRequest {
    pub model: String,
    pub prompt: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Serialize a request for forwarding, dropping router-only fields.
pub fn forwarded_payload<T: Serialize>(request: &T) -> Value {
    let mut value = serde_json::to_value(request).unwrap_or(Value::Null);
    if let Some(obj) = value.as_object_mut() {
        obj.remove("provider");
    }
    value
}

/// `GET /v1/models` response.
#[derive(Debug, Clone, Serialize)]
pub struct ModelList {
    pub object: &'static str,
    pub data: Vec<ModelInfo>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ModelInfo {
    pub id: String,
    pub object: &'static str,
    pub created: i64,
    pub owned_by: String,
}

impl ModelList {
    pub fn from_model_names(models: Vec<String>) -> Self {
        let created = chrono::Utc::now().timestamp();
        Self {
            object: "list",
            data: models
                .into_iter()
                .map(|id| ModelInfo {
                    id,
                    object: "model",
                    created,
                    owned_by: "llm-router".to_string(),
                })
                .collect(),
        }
    }
}
