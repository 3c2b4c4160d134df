//! Groq chat-completions client (OpenAI compatible API) used for alert
//! messages and expense categorisation.

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};

use super::{AlertMessageGenerator, CategoryClassifier};
use crate::config::GroqConfig;
use crate::database::models::Category;
use crate::error::{AppError, AppResult};
use crate::limits::period::Period;

const ALERT_PROMPT: &str = "Provide a warning message in one sentence, simple, straightforward \
and friendly. The alert is about the user-defined spending limit and is based on the submitted \
data. Reply in JSON as {\"message\": \"...\"}.";

#[derive(Clone)]
pub struct GroqClient {
    client: Client,
    api_key: String,
    base_url: String,
    model: String,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Deserialize)]
struct ChoiceMessage {
    content: Option<String>,
}

impl GroqClient {
    pub fn new(config: &GroqConfig) -> AppResult<Self> {
        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| AppError::Unavailable(e.to_string()))?;
        Ok(Self {
            client,
            api_key: config.api_key.clone(),
            base_url: config.base_url.trim_end_matches('/').to_string(),
            model: config.model.clone(),
        })
    }

    /// Sends one system + user exchange and returns the JSON object the
    /// model replied with.
    async fn complete_json(&self, system: &str, user: &str) -> AppResult<Value> {
        let body = json!({
            "model": self.model,
            "messages": [
                { "role": "system", "content": system },
                { "role": "user", "content": user },
            ],
            "temperature": 0,
            "top_p": 1,
            "stream": false,
            "response_format": { "type": "json_object" },
        });

        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| AppError::Unavailable(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(AppError::Unavailable(format!("groq returned {status}: {text}")));
        }

        let chat: ChatResponse = response
            .json()
            .await
            .map_err(|e| AppError::Unavailable(e.to_string()))?;
        let content = chat
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| AppError::Unavailable("empty completion".into()))?;

        serde_json::from_str(&content)
            .map_err(|e| AppError::Unavailable(format!("unparsable completion: {e}")))
    }
}

#[async_trait]
impl AlertMessageGenerator for GroqClient {
    async fn alert_message(
        &self,
        alert_percentage: i64,
        current_percentage: f64,
        period: Period,
    ) -> AppResult<Option<String>> {
        let user = json!({
            "alert_percentage": format!("{alert_percentage}%"),
            "current_percentage": format!("{current_percentage}%"),
            "periode": period.as_str(),
        })
        .to_string();

        let reply = self.complete_json(ALERT_PROMPT, &user).await?;
        Ok(reply
            .get("message")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|m| !m.is_empty())
            .map(str::to_string))
    }
}

#[async_trait]
impl CategoryClassifier for GroqClient {
    async fn classify(&self, text: &str, candidates: &[Category]) -> AppResult<Option<i64>> {
        if candidates.is_empty() {
            return Ok(None);
        }
        let list: Vec<Value> = candidates
            .iter()
            .map(|c| json!({ "id": c.category_id, "name": c.category_name }))
            .collect();
        let system = format!(
            "Pick the right category id from the list {} for the submitted expense. \
             Reply in JSON as {{\"id\": <number>}}.",
            Value::Array(list)
        );

        let reply = self.complete_json(&system, text).await?;
        // models sometimes answer with the id as a string
        let id = match reply.get("id") {
            Some(Value::Number(n)) => n.as_i64(),
            Some(Value::String(s)) => s.trim().parse().ok(),
            _ => None,
        };
        Ok(id.filter(|id| candidates.iter().any(|c| c.category_id == *id)))
    }
}
