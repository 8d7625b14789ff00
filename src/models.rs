//! Data models and structures used throughout the application

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Kind of AI server a model configuration talks to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    Lmstudio,
    Ollama,
    Custom,
}

impl ProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::Lmstudio => "lmstudio",
            ProviderKind::Ollama => "ollama",
            ProviderKind::Custom => "custom",
        }
    }
}

/// A saved AI model configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AiModelConfig {
    pub id: String,
    pub name: String,
    pub provider: ProviderKind,
    pub base_url: String,
    #[serde(default)]
    pub api_key: Option<String>,
    pub model: String,
    #[serde(default)]
    pub multimodal: bool,
}

/// An AI server found during network detection
#[derive(Debug, Clone, Serialize)]
pub struct DetectedServer {
    pub provider: ProviderKind,
    pub base_url: String,
    pub models: Vec<String>,
}

/// Problem description extracted from queued screenshots
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProblemInfo {
    pub problem_statement: String,
    #[serde(default)]
    pub constraints: Option<String>,
    #[serde(default)]
    pub example_input: Option<String>,
    #[serde(default)]
    pub example_output: Option<String>,
}

/// Generated solution for an extracted problem
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SolutionResult {
    pub code: String,
    #[serde(default)]
    pub thoughts: Vec<String>,
    #[serde(default)]
    pub time_complexity: Option<String>,
    #[serde(default)]
    pub space_complexity: Option<String>,
}

/// Represents a single pipeline run stored in the database
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub id: Option<i64>,
    pub timestamp: String,
    pub kind: String,
    pub language: String,
    pub problem_statement: String,
    pub solution_json: String,
}

/// Event published by the processing orchestrator
#[derive(Debug, Clone, Serialize)]
pub struct AppEvent {
    pub name: String,
    pub payload: Value,
}
