//! AI query dispatch: per-provider request shaping, retries, and streaming

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures_util::StreamExt;
use log::{info, warn};
use reqwest::Client;
use serde_json::{json, Value};

use crate::models::{AiModelConfig, ProviderKind};

/// Attempts per query before giving up
const MAX_ATTEMPTS: u32 = 3;

/// First backoff delay; doubles on each subsequent attempt
const BACKOFF_BASE_MS: u64 = 500;

/// Generation calls can be slow on CPU-bound local servers
const GENERATION_TIMEOUT_SECS: u64 = 90;

/// Completion token cap sent to OpenAI-compatible servers
const MAX_COMPLETION_TOKENS: u32 = 4000;

/// The wire dialect spoken at a given endpoint path
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ApiFlavor {
    OpenAiChat,
    OllamaChat,
    OllamaGenerate,
}

fn flavor_for_path(path: &str) -> ApiFlavor {
    if path.ends_with("/api/generate") {
        ApiFlavor::OllamaGenerate
    } else if path.ends_with("/api/chat") {
        ApiFlavor::OllamaChat
    } else {
        ApiFlavor::OpenAiChat
    }
}

/// Endpoint paths to try for a provider, preferred first. Later entries are
/// the fallbacks used when a path 404s (e.g. an Ollama URL saved as custom).
fn endpoint_paths(provider: ProviderKind) -> &'static [&'static str] {
    match provider {
        ProviderKind::Lmstudio => &["/v1/chat/completions"],
        ProviderKind::Ollama => &["/api/chat", "/api/generate", "/v1/chat/completions"],
        ProviderKind::Custom => &["/v1/chat/completions", "/api/chat", "/api/generate"],
    }
}

/// Builds an OpenAI-compatible messages array; images ride as data-URI
/// `image_url` content parts on the user message
pub fn build_openai_messages(system_prompt: &str, user_text: &str, images: &[String]) -> Vec<Value> {
    let mut messages: Vec<Value> = vec![json!({
        "role": "system",
        "content": system_prompt
    })];

    if images.is_empty() {
        messages.push(json!({
            "role": "user",
            "content": user_text
        }));
    } else {
        let mut content = vec![json!({ "type": "text", "text": user_text })];
        for base64 in images {
            content.push(json!({
                "type": "image_url",
                "image_url": { "url": format!("data:image/jpeg;base64,{}", base64) }
            }));
        }
        messages.push(json!({
            "role": "user",
            "content": content
        }));
    }
    messages
}

/// Builds an Ollama chat messages array; images ride as a base64 array on
/// the user message
pub fn build_ollama_messages(system_prompt: &str, user_text: &str, images: &[String]) -> Vec<Value> {
    let mut user = json!({
        "role": "user",
        "content": user_text
    });
    if !images.is_empty() {
        user["images"] = json!(images);
    }
    vec![
        json!({ "role": "system", "content": system_prompt }),
        user,
    ]
}

/// Flattens system and user text into a single prompt for /api/generate
fn flatten_prompt(system_prompt: &str, user_text: &str) -> String {
    format!("{}\n\n{}", system_prompt, user_text)
}

fn request_body(
    flavor: ApiFlavor,
    model: &str,
    system_prompt: &str,
    user_text: &str,
    images: &[String],
    stream: bool,
) -> Value {
    match flavor {
        ApiFlavor::OpenAiChat => {
            let mut body = json!({
                "model": model,
                "messages": build_openai_messages(system_prompt, user_text, images),
                "max_tokens": MAX_COMPLETION_TOKENS,
                "temperature": 0.2
            });
            if stream {
                body["stream"] = json!(true);
            }
            body
        }
        ApiFlavor::OllamaChat => json!({
            "model": model,
            "messages": build_ollama_messages(system_prompt, user_text, images),
            "stream": stream
        }),
        ApiFlavor::OllamaGenerate => {
            let mut body = json!({
                "model": model,
                "prompt": flatten_prompt(system_prompt, user_text),
                "stream": stream
            });
            if !images.is_empty() {
                body["images"] = json!(images);
            }
            body
        }
    }
}

/// Pulls the assistant text out of any of the known response shapes
pub fn extract_content(value: &Value) -> Option<String> {
    if let Some(content) = value["choices"][0]["message"]["content"].as_str() {
        return Some(content.to_string());
    }
    if let Some(content) = value["message"]["content"].as_str() {
        return Some(content.to_string());
    }
    value["response"].as_str().map(|s| s.to_string())
}

/// Extracts the outermost JSON object from a raw model answer, tolerating
/// markdown fences and surrounding prose
pub fn extract_json_object(raw: &str) -> Option<String> {
    let start = raw.find('{')?;
    let end = raw.rfind('}')?;
    if start >= end {
        return None;
    }
    Some(raw[start..=end].to_string())
}

fn generation_client() -> Result<Client, String> {
    Client::builder()
        .timeout(Duration::from_secs(GENERATION_TIMEOUT_SECS))
        .build()
        .map_err(|e| format!("Failed to build HTTP client: {}", e))
}

fn apply_auth(request: reqwest::RequestBuilder, config: &AiModelConfig) -> reqwest::RequestBuilder {
    match config.api_key.as_deref().filter(|k| !k.is_empty()) {
        Some(key) => request.header("Authorization", format!("Bearer {}", key)),
        None => request,
    }
}

/// Sends one query to the configured model and returns the raw answer text.
/// Rotates through the provider's endpoint paths and retries with
/// exponential backoff until the retry limit is reached.
pub async fn query_model(
    config: &AiModelConfig,
    system_prompt: &str,
    user_text: &str,
    images: &[String],
    cancel: &AtomicBool,
) -> Result<String, String> {
    let client = generation_client()?;
    let base_url = config.base_url.trim_end_matches('/');
    let paths = endpoint_paths(config.provider);

    let mut last_error = format!("No endpoint answered at {}", base_url);
    for attempt in 0..MAX_ATTEMPTS {
        if attempt > 0 {
            let delay = BACKOFF_BASE_MS << (attempt - 1);
            info!("retrying query in {} ms (attempt {})", delay, attempt + 1);
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }

        'paths: for path in paths {
            if cancel.load(Ordering::SeqCst) {
                return Err("Request cancelled".to_string());
            }

            let url = format!("{}{}", base_url, path);
            let body = request_body(
                flavor_for_path(path),
                &config.model,
                system_prompt,
                user_text,
                images,
                false,
            );
            let request = apply_auth(client.post(&url), config)
                .header("Content-Type", "application/json")
                .json(&body);

            let resp = match request.send().await {
                Ok(resp) => resp,
                Err(e) => {
                    last_error = format!("Request to {} failed: {}", url, e);
                    continue;
                }
            };

            let status = resp.status();
            if !status.is_success() {
                let error_text = resp.text().await.unwrap_or_default();
                last_error = format!("{} returned {}: {}", url, status, error_text);
                if status.as_u16() == 404 || status.as_u16() == 405 {
                    // Wrong dialect for this server; try the next path
                    continue;
                }
                // The server understood the path but refused; back off
                break 'paths;
            }

            let response_json: Value = match resp.json().await {
                Ok(json) => json,
                Err(e) => {
                    last_error = format!("Failed to parse response from {}: {}", url, e);
                    continue;
                }
            };

            match extract_content(&response_json) {
                Some(content) => return Ok(content),
                None => {
                    last_error = format!("Unrecognized response shape from {}", url);
                    continue;
                }
            }
        }
    }

    warn!("query failed after {} attempts: {}", MAX_ATTEMPTS, last_error);
    Err(last_error)
}

/// Streaming variant of [`query_model`]. Chunks are forwarded to `on_chunk`
/// as they arrive; the full concatenated answer is returned at the end.
pub async fn query_model_stream(
    config: &AiModelConfig,
    system_prompt: &str,
    user_text: &str,
    images: &[String],
    cancel: &AtomicBool,
    mut on_chunk: impl FnMut(&str),
) -> Result<String, String> {
    let client = generation_client()?;
    let base_url = config.base_url.trim_end_matches('/');
    let paths = endpoint_paths(config.provider);

    let mut last_error = format!("No endpoint answered at {}", base_url);
    for attempt in 0..MAX_ATTEMPTS {
        if attempt > 0 {
            let delay = BACKOFF_BASE_MS << (attempt - 1);
            info!("retrying streaming query in {} ms (attempt {})", delay, attempt + 1);
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }

        for path in paths {
            if cancel.load(Ordering::SeqCst) {
                return Err("Request cancelled".to_string());
            }

            let flavor = flavor_for_path(path);
            let url = format!("{}{}", base_url, path);
            let body = request_body(
                flavor,
                &config.model,
                system_prompt,
                user_text,
                images,
                true,
            );
            let request = apply_auth(client.post(&url), config)
                .header("Content-Type", "application/json")
                .json(&body);

            let resp = match request.send().await {
                Ok(resp) => resp,
                Err(e) => {
                    last_error = format!("Request to {} failed: {}", url, e);
                    continue;
                }
            };

            let status = resp.status();
            if !status.is_success() {
                let error_text = resp.text().await.unwrap_or_default();
                last_error = format!("{} returned {}: {}", url, status, error_text);
                continue;
            }

            // Once a stream opens, errors inside it surface directly rather
            // than consuming further attempts
            return consume_stream(resp, flavor, cancel, &mut on_chunk).await;
        }
    }

    warn!(
        "streaming query failed after {} attempts: {}",
        MAX_ATTEMPTS, last_error
    );
    Err(last_error)
}

/// Drains a streaming response, dispatching on the wire dialect: SSE
/// `data:` lines for OpenAI-compatible servers, NDJSON for Ollama
async fn consume_stream(
    resp: reqwest::Response,
    flavor: ApiFlavor,
    cancel: &AtomicBool,
    on_chunk: &mut impl FnMut(&str),
) -> Result<String, String> {
    let mut stream = resp.bytes_stream();
    let mut full_content = String::new();
    let mut buffer = String::new();

    while let Some(chunk_result) = stream.next().await {
        if cancel.load(Ordering::SeqCst) {
            return Err("Request cancelled".to_string());
        }
        let chunk = chunk_result.map_err(|e| format!("Stream error: {}", e))?;
        buffer.push_str(&String::from_utf8_lossy(&chunk));

        // Process complete lines from the buffer
        while let Some(line_end) = buffer.find('\n') {
            let line = buffer[..line_end].trim().to_string();
            buffer = buffer[line_end + 1..].to_string();

            if line.is_empty() {
                continue;
            }

            match flavor {
                ApiFlavor::OpenAiChat => {
                    if line == "data: [DONE]" {
                        return Ok(full_content);
                    }
                    if let Some(json_str) = line.strip_prefix("data: ") {
                        if let Ok(json_value) = serde_json::from_str::<Value>(json_str) {
                            if let Some(content) =
                                json_value["choices"][0]["delta"]["content"].as_str()
                            {
                                full_content.push_str(content);
                                on_chunk(content);
                            }
                        }
                    }
                }
                ApiFlavor::OllamaChat | ApiFlavor::OllamaGenerate => {
                    if let Ok(json_value) = serde_json::from_str::<Value>(&line) {
                        let content = json_value["message"]["content"]
                            .as_str()
                            .or_else(|| json_value["response"].as_str());
                        if let Some(content) = content {
                            full_content.push_str(content);
                            on_chunk(content);
                        }
                        if json_value["done"].as_bool() == Some(true) {
                            return Ok(full_content);
                        }
                    }
                }
            }
        }
    }

    Ok(full_content)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn openai_messages_carry_images_as_data_uris() {
        let messages = build_openai_messages("sys", "look at this", &["QUJD".to_string()]);
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0]["role"], "system");

        let content = messages[1]["content"].as_array().unwrap();
        assert_eq!(content[0]["type"], "text");
        assert_eq!(content[1]["type"], "image_url");
        assert_eq!(
            content[1]["image_url"]["url"].as_str().unwrap(),
            "data:image/jpeg;base64,QUJD"
        );
    }

    #[test]
    fn openai_messages_without_images_use_plain_content() {
        let messages = build_openai_messages("sys", "hello", &[]);
        assert_eq!(messages[1]["content"].as_str(), Some("hello"));
    }

    #[test]
    fn ollama_messages_carry_images_as_base64_array() {
        let messages = build_ollama_messages("sys", "look", &["QUJD".to_string()]);
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[1]["images"][0].as_str(), Some("QUJD"));

        let bare = build_ollama_messages("sys", "look", &[]);
        assert!(bare[1].get("images").is_none());
    }

    #[test]
    fn generate_body_flattens_prompt_and_keeps_images() {
        let body = request_body(
            ApiFlavor::OllamaGenerate,
            "llava",
            "sys",
            "user",
            &["QUJD".to_string()],
            false,
        );
        assert_eq!(body["prompt"].as_str(), Some("sys\n\nuser"));
        assert_eq!(body["images"][0].as_str(), Some("QUJD"));
        assert_eq!(body["stream"].as_bool(), Some(false));
    }

    #[test]
    fn openai_body_only_sets_stream_when_streaming() {
        let plain = request_body(ApiFlavor::OpenAiChat, "m", "s", "u", &[], false);
        assert!(plain.get("stream").is_none());
        let streaming = request_body(ApiFlavor::OpenAiChat, "m", "s", "u", &[], true);
        assert_eq!(streaming["stream"].as_bool(), Some(true));
    }

    #[test]
    fn extract_content_handles_all_known_shapes() {
        let openai = serde_json::json!({
            "choices": [{"message": {"content": "a"}}]
        });
        let ollama_chat = serde_json::json!({"message": {"content": "b"}});
        let ollama_generate = serde_json::json!({"response": "c"});
        let junk = serde_json::json!({"unexpected": true});

        assert_eq!(extract_content(&openai).as_deref(), Some("a"));
        assert_eq!(extract_content(&ollama_chat).as_deref(), Some("b"));
        assert_eq!(extract_content(&ollama_generate).as_deref(), Some("c"));
        assert!(extract_content(&junk).is_none());
    }

    #[test]
    fn extract_json_object_strips_fences_and_prose() {
        let raw = "Sure! Here you go:\n```json\n{\"code\": \"x\"}\n```\nHope that helps.";
        assert_eq!(extract_json_object(raw).as_deref(), Some("{\"code\": \"x\"}"));
        assert!(extract_json_object("no object here").is_none());
        assert!(extract_json_object("}{").is_none());
    }

    #[test]
    fn endpoint_paths_prefer_the_native_dialect() {
        assert_eq!(endpoint_paths(ProviderKind::Lmstudio)[0], "/v1/chat/completions");
        assert_eq!(endpoint_paths(ProviderKind::Ollama)[0], "/api/chat");
        assert_eq!(endpoint_paths(ProviderKind::Custom)[0], "/v1/chat/completions");
        assert!(endpoint_paths(ProviderKind::Ollama).contains(&"/api/generate"));
    }

    #[test]
    fn flavor_follows_path_suffix() {
        assert_eq!(flavor_for_path("/api/generate"), ApiFlavor::OllamaGenerate);
        assert_eq!(flavor_for_path("/api/chat"), ApiFlavor::OllamaChat);
        assert_eq!(flavor_for_path("/v1/chat/completions"), ApiFlavor::OpenAiChat);
    }
}
