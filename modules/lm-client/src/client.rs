use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;

// =============================================================================
// Wire types (OpenAI chat completions subset)
// =============================================================================

#[derive(Debug, Serialize)]
struct ChatMessage {
    role: &'static str,
    content: String,
}

#[derive(Debug, Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    temperature: f32,
    max_tokens: u32,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<ResponseFormat>,
}

#[derive(Debug, Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    format_type: &'static str,
    json_schema: JsonSchemaFormat,
}

#[derive(Debug, Serialize)]
struct JsonSchemaFormat {
    name: String,
    strict: bool,
    schema: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    content: Option<String>,
}

// =============================================================================
// LocalModel
// =============================================================================

/// Client for one local model instance. Cheap to clone; calls are issued
/// strictly one at a time by the pipeline, so no pooling or backpressure.
#[derive(Clone)]
pub struct LocalModel {
    http: reqwest::Client,
    base_url: String,
    model: String,
    temperature: f32,
    max_tokens: u32,
}

impl LocalModel {
    pub fn new(base_url: &str, model: &str) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            model: model.to_string(),
            // Low temperature for consistent extraction output.
            temperature: 0.1,
            max_tokens: 2000,
        }
    }

    /// Probe the server's model listing. Used as a startup check: an
    /// unreachable endpoint is the one failure that should abort a run
    /// before any work is attempted.
    pub async fn ping(&self) -> Result<()> {
        let url = format!("{}/v1/models", self.base_url);
        let response = self
            .http
            .get(&url)
            .send()
            .await
            .with_context(|| format!("local model server unreachable at {}", self.base_url))?;
        if !response.status().is_success() {
            return Err(anyhow!(
                "local model server returned {} from {url}",
                response.status()
            ));
        }
        Ok(())
    }

    /// One chat completion constrained to a JSON schema. Returns the raw
    /// JSON text; callers own the parse so they can treat a parse failure
    /// as malformed model output rather than a transport error.
    pub async fn complete_with_schema(
        &self,
        system_prompt: &str,
        user_prompt: &str,
        schema_name: &str,
        schema: serde_json::Value,
    ) -> Result<String> {
        let format = ResponseFormat {
            format_type: "json_schema",
            json_schema: JsonSchemaFormat {
                name: schema_name.to_string(),
                strict: true,
                schema,
            },
        };
        self.chat(system_prompt, user_prompt, Some(format)).await
    }

    async fn chat(
        &self,
        system_prompt: &str,
        user_prompt: &str,
        response_format: Option<ResponseFormat>,
    ) -> Result<String> {
        let url = format!("{}/v1/chat/completions", self.base_url);

        let mut messages = Vec::with_capacity(2);
        if !system_prompt.is_empty() {
            messages.push(ChatMessage {
                role: "system",
                content: system_prompt.to_string(),
            });
        }
        messages.push(ChatMessage {
            role: "user",
            content: user_prompt.to_string(),
        });

        let request = ChatRequest {
            model: self.model.clone(),
            messages,
            temperature: self.temperature,
            max_tokens: self.max_tokens,
            stream: false,
            response_format,
        };

        debug!(model = %self.model, "local model chat request");

        let response = self.http.post(&url).json(&request).send().await?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await?;
            return Err(anyhow!("local model error ({status}): {error_text}"));
        }

        let chat_response: ChatResponse = response.json().await?;
        chat_response
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .map(|c| c.trim().to_string())
            .ok_or_else(|| anyhow!("empty completion from local model"))
    }
}
