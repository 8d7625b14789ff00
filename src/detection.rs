//! Network detection of local AI servers (LM Studio, Ollama, custom)

use std::time::Duration;

use futures_util::{stream, StreamExt};
use log::{debug, info};
use reqwest::Client;
use serde_json::Value;

use crate::models::{AiModelConfig, DetectedServer, ProviderKind};

/// Default port LM Studio serves its OpenAI-compatible API on
const LMSTUDIO_PORT: u16 = 1234;

/// Default port of the Ollama HTTP API
const OLLAMA_PORT: u16 = 11434;

/// Secondary ports worth probing for custom/OpenAI-compatible servers
const FALLBACK_PORTS: [u16; 2] = [8080, 5000];

/// Per-probe timeout; probes must stay short so a full scan finishes quickly
const PROBE_TIMEOUT_MS: u64 = 800;

/// Upper bound on in-flight probes during a scan
const PROBE_CONCURRENCY: usize = 8;

/// One host:port pair to probe
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeCandidate {
    pub host: String,
    pub port: u16,
}

impl ProbeCandidate {
    pub fn base_url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }
}

/// Builds the prioritized probe list: localhost aliases first, well-known AI
/// server ports before fallbacks, user-supplied hosts and ports last
pub fn candidate_list(extra_hosts: &[String], extra_ports: &[u16]) -> Vec<ProbeCandidate> {
    let mut hosts: Vec<String> = vec!["127.0.0.1".to_string(), "localhost".to_string()];
    for host in extra_hosts {
        let host = host.trim();
        if !host.is_empty() && !hosts.iter().any(|h| h == host) {
            hosts.push(host.to_string());
        }
    }

    let mut ports: Vec<u16> = vec![LMSTUDIO_PORT, OLLAMA_PORT];
    ports.extend_from_slice(&FALLBACK_PORTS);
    for &port in extra_ports {
        if !ports.contains(&port) {
            ports.push(port);
        }
    }

    let mut candidates = Vec::with_capacity(hosts.len() * ports.len());
    for host in &hosts {
        for &port in &ports {
            candidates.push(ProbeCandidate {
                host: host.clone(),
                port,
            });
        }
    }
    candidates
}

fn probe_client() -> Result<Client, String> {
    Client::builder()
        .timeout(Duration::from_millis(PROBE_TIMEOUT_MS))
        .build()
        .map_err(|e| format!("Failed to build HTTP client: {}", e))
}

/// Extracts model ids from an OpenAI-compatible `/v1/models` response
pub fn parse_openai_models(value: &Value) -> Option<Vec<String>> {
    let data = value.get("data")?.as_array()?;
    Some(
        data.iter()
            .filter_map(|m| m.get("id").and_then(Value::as_str))
            .map(|s| s.to_string())
            .collect(),
    )
}

/// Extracts model names from an Ollama `/api/tags` response
pub fn parse_ollama_tags(value: &Value) -> Option<Vec<String>> {
    let models = value.get("models")?.as_array()?;
    Some(
        models
            .iter()
            .filter_map(|m| m.get("name").and_then(Value::as_str))
            .map(|s| s.to_string())
            .collect(),
    )
}

/// Probes one candidate for a known server signature. A non-answering or
/// non-matching candidate yields None, never an error.
async fn probe_candidate(client: &Client, candidate: &ProbeCandidate) -> Option<DetectedServer> {
    let base_url = candidate.base_url();

    // LM Studio and other OpenAI-compatible servers answer /v1/models
    if let Ok(resp) = client.get(format!("{}/v1/models", base_url)).send().await {
        if resp.status().is_success() {
            if let Ok(body) = resp.json::<Value>().await {
                if let Some(models) = parse_openai_models(&body) {
                    debug!("{} answered /v1/models with {} models", base_url, models.len());
                    return Some(DetectedServer {
                        provider: ProviderKind::Lmstudio,
                        base_url,
                        models,
                    });
                }
            }
        }
    }

    // Ollama answers /api/tags
    if let Ok(resp) = client.get(format!("{}/api/tags", base_url)).send().await {
        if resp.status().is_success() {
            if let Ok(body) = resp.json::<Value>().await {
                if let Some(models) = parse_ollama_tags(&body) {
                    debug!("{} answered /api/tags with {} models", base_url, models.len());
                    return Some(DetectedServer {
                        provider: ProviderKind::Ollama,
                        base_url,
                        models,
                    });
                }
            }
        }
    }

    None
}

/// Scans the candidate list and returns the first responding server, probing
/// with bounded parallelism and exiting as soon as one answers
pub async fn detect_server(
    extra_hosts: &[String],
    extra_ports: &[u16],
) -> Result<Option<DetectedServer>, String> {
    let client = probe_client()?;
    let candidates = candidate_list(extra_hosts, extra_ports);
    info!("probing {} candidates for AI servers", candidates.len());

    let mut probes = stream::iter(candidates)
        .map(|candidate| {
            let client = client.clone();
            async move { probe_candidate(&client, &candidate).await }
        })
        .buffer_unordered(PROBE_CONCURRENCY);

    while let Some(result) = probes.next().await {
        if let Some(server) = result {
            info!(
                "detected {} server at {} ({} models)",
                server.provider.as_str(),
                server.base_url,
                server.models.len()
            );
            return Ok(Some(server));
        }
    }
    Ok(None)
}

/// Scans the full candidate list and returns every responding server
pub async fn scan_all(
    extra_hosts: &[String],
    extra_ports: &[u16],
) -> Result<Vec<DetectedServer>, String> {
    let client = probe_client()?;
    let candidates = candidate_list(extra_hosts, extra_ports);
    info!("scanning {} candidates for AI servers", candidates.len());

    let found: Vec<DetectedServer> = stream::iter(candidates)
        .map(|candidate| {
            let client = client.clone();
            async move { probe_candidate(&client, &candidate).await }
        })
        .buffer_unordered(PROBE_CONCURRENCY)
        .filter_map(|r| async move { r })
        .collect()
        .await;
    Ok(found)
}

/// Known name fragments of local models that accept image input
const MULTIMODAL_MARKERS: [&str; 6] = ["llava", "bakllava", "vision", "-vl", "moondream", "minicpm-v"];

/// Guesses whether a model accepts images from its name. Local servers do
/// not advertise modality, so this goes by well-known naming conventions.
pub fn is_multimodal_model(name: &str) -> bool {
    let name = name.to_lowercase();
    MULTIMODAL_MARKERS.iter().any(|marker| name.contains(marker))
}

/// Lists the models a configured endpoint advertises, using the provider's
/// native listing path
pub async fn list_models(config: &AiModelConfig) -> Result<Vec<String>, String> {
    let client = Client::builder()
        .timeout(Duration::from_secs(10))
        .build()
        .map_err(|e| format!("Failed to build HTTP client: {}", e))?;
    let base_url = config.base_url.trim_end_matches('/');

    let paths: &[&str] = match config.provider {
        ProviderKind::Lmstudio => &["/v1/models"],
        ProviderKind::Ollama => &["/api/tags"],
        ProviderKind::Custom => &["/v1/models", "/api/tags"],
    };

    let mut last_error = format!("No model listing endpoint answered at {}", base_url);
    for path in paths {
        let mut request = client.get(format!("{}{}", base_url, path));
        if let Some(key) = config.api_key.as_deref().filter(|k| !k.is_empty()) {
            request = request.header("Authorization", format!("Bearer {}", key));
        }

        let resp = match request.send().await {
            Ok(resp) => resp,
            Err(e) => {
                last_error = format!("Request to {}{} failed: {}", base_url, path, e);
                continue;
            }
        };
        if !resp.status().is_success() {
            last_error = format!("{}{} returned {}", base_url, path, resp.status());
            continue;
        }
        let body: Value = match resp.json().await {
            Ok(body) => body,
            Err(e) => {
                last_error = format!("Failed to parse response from {}{}: {}", base_url, path, e);
                continue;
            }
        };

        if let Some(models) = parse_openai_models(&body).or_else(|| parse_ollama_tags(&body)) {
            return Ok(models);
        }
        last_error = format!("Unrecognized model listing shape from {}{}", base_url, path);
    }
    Err(last_error)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn candidate_list_puts_localhost_and_known_ports_first() {
        let candidates = candidate_list(&[], &[]);
        assert_eq!(
            candidates[0],
            ProbeCandidate {
                host: "127.0.0.1".to_string(),
                port: LMSTUDIO_PORT
            }
        );
        assert_eq!(candidates[1].port, OLLAMA_PORT);
        assert!(candidates.iter().all(|c| c.port != 0));
    }

    #[test]
    fn candidate_list_appends_extras_without_duplicates() {
        let candidates = candidate_list(
            &["192.168.1.20".to_string(), "localhost".to_string()],
            &[11434, 9000],
        );
        let hosts: Vec<&str> = candidates.iter().map(|c| c.host.as_str()).collect();
        assert!(hosts.contains(&"192.168.1.20"));
        assert_eq!(hosts.iter().filter(|h| **h == "localhost").count(), 5);
        assert_eq!(
            candidates.iter().filter(|c| c.port == 11434).count(),
            3 // one per host, not duplicated by the extra port
        );
        assert!(candidates.iter().any(|c| c.port == 9000));
    }

    #[test]
    fn parses_openai_model_listing() {
        let body = json!({
            "data": [
                {"id": "qwen2-vl-7b-instruct", "object": "model"},
                {"id": "llama-3.2-1b", "object": "model"},
                {"object": "model"}
            ]
        });
        let models = parse_openai_models(&body).unwrap();
        assert_eq!(models, vec!["qwen2-vl-7b-instruct", "llama-3.2-1b"]);
    }

    #[test]
    fn parses_ollama_tag_listing() {
        let body = json!({
            "models": [
                {"name": "llava:latest", "size": 4000000},
                {"name": "llama3:8b"}
            ]
        });
        let models = parse_ollama_tags(&body).unwrap();
        assert_eq!(models, vec!["llava:latest", "llama3:8b"]);
    }

    #[test]
    fn unrecognized_shapes_parse_to_none() {
        assert!(parse_openai_models(&json!({"models": []})).is_none());
        assert!(parse_ollama_tags(&json!({"data": []})).is_none());
        assert!(parse_openai_models(&json!("nope")).is_none());
    }

    #[test]
    fn multimodal_guess_follows_naming_conventions() {
        assert!(is_multimodal_model("llava:latest"));
        assert!(is_multimodal_model("Qwen2-VL-7B-Instruct"));
        assert!(is_multimodal_model("minicpm-v:8b"));
        assert!(!is_multimodal_model("llama3:8b"));
        assert!(!is_multimodal_model("qwen2.5-coder"));
    }

    #[test]
    fn candidate_base_url_is_well_formed() {
        let candidate = ProbeCandidate {
            host: "127.0.0.1".to_string(),
            port: 1234,
        };
        assert_eq!(candidate.base_url(), "http://127.0.0.1:1234");
    }
}
