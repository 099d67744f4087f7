use super::retry::{send_with_retry, RetryPolicy, TransportError};
use super::{CommandSource, MessageId, Photo, Target, Transport, Update, HTTP_CLIENT};
use crate::config::Config;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;

/// Bot API limits, in characters
const MAX_TEXT_CHARS: usize = 4096;
const MAX_CAPTION_CHARS: usize = 1024;

#[derive(Debug, Deserialize)]
struct ApiResponse {
    ok: bool,
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    description: Option<String>,
}

/// Telegram Bot API client, used both as the notification sink and as the
/// command long-poll source.
pub struct TelegramClient {
    base_url: String,
    group_id: i64,
    topic_id: Option<i64>,
    notify_policy: RetryPolicy,
    command_policy: RetryPolicy,
}

impl TelegramClient {
    pub fn new(config: &Config) -> Self {
        Self {
            base_url: format!(
                "{}/bot{}",
                config.telegram.api_base.trim_end_matches('/'),
                config.telegram.bot_token
            ),
            group_id: config.telegram.group_id,
            topic_id: config.telegram.topic_id,
            notify_policy: RetryPolicy::notifications(&config.retry),
            command_policy: RetryPolicy::command(
                &config.retry,
                Duration::from_secs(config.command.http_timeout_secs),
            ),
        }
    }

    fn url(&self, method: &str) -> String {
        format!("{}/{}", self.base_url, method)
    }

    /// Chat addressing fields for a target
    fn address(&self, target: Target) -> serde_json::Map<String, Value> {
        let mut map = serde_json::Map::new();
        match target {
            Target::Group => {
                map.insert("chat_id".into(), json!(self.group_id));
                if let Some(topic) = self.topic_id {
                    map.insert("message_thread_id".into(), json!(topic));
                }
            }
            Target::GroupTopic(thread) => {
                map.insert("chat_id".into(), json!(self.group_id));
                if let Some(thread) = thread {
                    map.insert("message_thread_id".into(), json!(thread));
                }
            }
            Target::Chat(id) => {
                map.insert("chat_id".into(), json!(id));
            }
        }
        map
    }

    async fn call(&self, policy: &RetryPolicy, method: &str, payload: &Value) -> Result<Value, TransportError> {
        let url = self.url(method);
        let outcome = send_with_retry(policy, method, || HTTP_CLIENT.post(&url).json(payload)).await;
        read_envelope(outcome).await
    }
}

async fn read_envelope(
    outcome: Result<reqwest::Response, TransportError>,
) -> Result<Value, TransportError> {
    let response = match outcome {
        Ok(r) => r,
        // The API reports errors as a JSON envelope with a non-2xx status
        Err(TransportError::Status { code, body, .. }) => {
            return Err(match serde_json::from_str::<ApiResponse>(&body) {
                Ok(ApiResponse {
                    description: Some(description),
                    ..
                }) => TransportError::Api(format!("{} (HTTP {})", description, code)),
                _ => TransportError::Status {
                    code,
                    body,
                    retry_after: None,
                },
            })
        }
        Err(e) => return Err(e),
    };

    let envelope: ApiResponse = response
        .json()
        .await
        .map_err(|e| TransportError::Decode(e.to_string()))?;
    if !envelope.ok {
        return Err(TransportError::Api(
            envelope.description.unwrap_or_else(|| "unknown error".to_string()),
        ));
    }
    Ok(envelope.result.unwrap_or(Value::Null))
}

fn message_id(result: &Value) -> Result<MessageId, TransportError> {
    result["message_id"]
        .as_i64()
        .ok_or_else(|| TransportError::Decode("reply has no message_id".to_string()))
}

/// Truncate to at most `max` characters, on a char boundary.
fn clip(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((idx, _)) => text[..idx].to_string(),
        None => text.to_string(),
    }
}

#[async_trait]
impl Transport for TelegramClient {
    async fn send_text(&self, target: Target, text: &str) -> Result<MessageId, TransportError> {
        let mut payload = self.address(target);
        payload.insert("text".into(), json!(clip(text, MAX_TEXT_CHARS)));
        payload.insert("disable_web_page_preview".into(), json!(true));

        let result = self
            .call(&self.notify_policy, "sendMessage", &Value::Object(payload))
            .await?;
        message_id(&result)
    }

    async fn send_photo(
        &self,
        target: Target,
        photo: Photo,
        caption: &str,
    ) -> Result<MessageId, TransportError> {
        let caption = clip(caption, MAX_CAPTION_CHARS);
        match photo {
            Photo::Url(url) => {
                let mut payload = self.address(target);
                payload.insert("photo".into(), json!(url));
                payload.insert("caption".into(), json!(caption));
                let result = self
                    .call(&self.notify_policy, "sendPhoto", &Value::Object(payload))
                    .await?;
                message_id(&result)
            }
            Photo::Bytes(bytes) => {
                let url = self.url("sendPhoto");
                let address = self.address(target);
                // A multipart form is consumed by send, so rebuild it per attempt
                let outcome = send_with_retry(&self.notify_policy, "sendPhoto", || {
                    let mut form = reqwest::multipart::Form::new().text("caption", caption.clone());
                    for (key, value) in &address {
                        form = form.text(key.clone(), value.to_string());
                    }
                    let part = reqwest::multipart::Part::bytes(bytes.clone()).file_name("frame.jpg");
                    HTTP_CLIENT.post(&url).multipart(form.part("photo", part))
                })
                .await;
                let result = read_envelope(outcome).await?;
                message_id(&result)
            }
        }
    }

    async fn edit_text(
        &self,
        target: Target,
        message_id: MessageId,
        text: &str,
    ) -> Result<(), TransportError> {
        let mut payload = self.address(target);
        payload.remove("message_thread_id");
        payload.insert("message_id".into(), json!(message_id));
        payload.insert("text".into(), json!(clip(text, MAX_TEXT_CHARS)));
        payload.insert("disable_web_page_preview".into(), json!(true));

        match self
            .call(&self.notify_policy, "editMessageText", &Value::Object(payload))
            .await
        {
            Ok(_) => Ok(()),
            Err(TransportError::Api(description)) if description.contains("message is not modified") => {
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

#[async_trait]
impl CommandSource for TelegramClient {
    async fn poll(&self, offset: Option<i64>, wait: Duration) -> Result<Vec<Update>, TransportError> {
        let mut payload = json!({
            "timeout": wait.as_secs(),
            "allowed_updates": ["message"],
        });
        if let Some(offset) = offset {
            payload["offset"] = json!(offset);
        }
        let result = self.call(&self.command_policy, "getUpdates", &payload).await?;
        Ok(parse_updates(&result))
    }

    async fn drop_pending(&self) -> Result<Option<i64>, TransportError> {
        // offset -1 returns only the newest update and confirms the rest
        let payload = json!({"offset": -1, "timeout": 0});
        let result = self.call(&self.command_policy, "getUpdates", &payload).await?;
        Ok(parse_updates(&result)
            .iter()
            .map(|u| u.update_id)
            .max()
            .map(|id| id + 1))
    }
}

/// Parse a `getUpdates` result array. Entries without an id are skipped.
pub fn parse_updates(result: &Value) -> Vec<Update> {
    let Some(items) = result.as_array() else {
        return Vec::new();
    };
    items
        .iter()
        .filter_map(|item| {
            let update_id = item["update_id"].as_i64()?;
            let message = &item["message"];
            Some(Update {
                update_id,
                command: message["text"].as_str().and_then(normalize_command),
                from_id: message["from"]["id"].as_i64(),
                chat_id: message["chat"]["id"].as_i64(),
                // Plain replies carry a thread id too; only forum topics count
                thread_id: message["is_topic_message"]
                    .as_bool()
                    .unwrap_or(false)
                    .then(|| message["message_thread_id"].as_i64())
                    .flatten(),
            })
        })
        .collect()
}

/// `/Status@SomeBot extra` becomes `status`. Non-commands give `None`.
pub fn normalize_command(text: &str) -> Option<String> {
    let first = text.trim().split_whitespace().next()?;
    let name = first.strip_prefix('/')?;
    let name = name.split('@').next().unwrap_or_default().to_lowercase();
    (!name.is_empty()).then_some(name)
}
