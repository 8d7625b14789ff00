//! Persistent store for saved AI model configurations

use std::path::Path;

use log::info;
use serde::{Deserialize, Serialize};

use crate::models::{AiModelConfig, ProviderKind};
use crate::paths::get_config_path;

/// On-disk configuration: saved model list plus the active selection
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AiConfig {
    #[serde(default)]
    pub models: Vec<AiModelConfig>,
    #[serde(default)]
    pub active_model_id: Option<String>,
    // Legacy single-endpoint fields kept for config migration
    #[serde(skip_serializing, default)]
    endpoint: Option<String>,
    #[serde(skip_serializing, default)]
    model: Option<String>,
    #[serde(skip_serializing, default)]
    api_key: Option<String>,
}

impl AiConfig {
    /// Returns the active model configuration, if any
    pub fn active_model(&self) -> Option<&AiModelConfig> {
        let id = self.active_model_id.as_deref()?;
        self.models.iter().find(|m| m.id == id)
    }
}

/// Loads the config file, migrating legacy layouts when found
pub fn load_config() -> Result<AiConfig, String> {
    let config_path = get_config_path()?;
    load_config_from(&config_path)
}

pub fn load_config_from(path: &Path) -> Result<AiConfig, String> {
    if !path.exists() {
        return Ok(AiConfig::default());
    }
    let content = std::fs::read_to_string(path)
        .map_err(|e| format!("Failed to read model config: {}", e))?;
    let mut config: AiConfig = serde_json::from_str(&content)
        .map_err(|e| format!("Failed to parse model config: {}", e))?;

    if migrate_legacy_endpoint(&mut config) {
        info!("migrated legacy single-endpoint config to model list");
        save_config_to(path, &config)?;
    }

    Ok(config)
}

/// Saves the config file, creating parent directories as needed
pub fn save_config(config: &AiConfig) -> Result<(), String> {
    let config_path = get_config_path()?;
    save_config_to(&config_path, config)
}

pub fn save_config_to(path: &Path, config: &AiConfig) -> Result<(), String> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| format!("Failed to create directory: {}", e))?;
    }
    let content = serde_json::to_string_pretty(config)
        .map_err(|e| format!("Failed to serialize model config: {}", e))?;
    std::fs::write(path, content).map_err(|e| format!("Failed to save model config: {}", e))
}

/// Migration: fold old top-level endpoint/model/api_key keys into the model
/// list. Returns true when the config changed and should be re-saved.
fn migrate_legacy_endpoint(config: &mut AiConfig) -> bool {
    let endpoint = match config.endpoint.take() {
        Some(e) if !e.trim().is_empty() => e,
        _ => return false,
    };
    if !config.models.is_empty() {
        return false;
    }

    let provider = guess_provider_from_url(&endpoint);
    let migrated = AiModelConfig {
        id: "migrated".to_string(),
        name: "Migrated model".to_string(),
        provider,
        base_url: endpoint,
        api_key: config.api_key.take(),
        model: config.model.take().unwrap_or_default(),
        multimodal: false,
    };
    config.active_model_id = Some(migrated.id.clone());
    config.models.push(migrated);
    true
}

/// Guesses the provider kind for a legacy endpoint URL by its port
fn guess_provider_from_url(url: &str) -> ProviderKind {
    if url.contains(":11434") {
        ProviderKind::Ollama
    } else if url.contains(":1234") {
        ProviderKind::Lmstudio
    } else {
        ProviderKind::Custom
    }
}

/// Adds a model config; the first saved model becomes active
pub fn add_model(config: &mut AiConfig, model: AiModelConfig) -> Result<(), String> {
    if config.models.iter().any(|m| m.id == model.id) {
        return Err(format!("A model with id '{}' already exists", model.id));
    }
    if config.models.is_empty() {
        config.active_model_id = Some(model.id.clone());
    }
    config.models.push(model);
    Ok(())
}

/// Removes a model config; removing the active one falls back to the first
/// remaining entry
pub fn remove_model(config: &mut AiConfig, id: &str) -> Result<(), String> {
    let before = config.models.len();
    config.models.retain(|m| m.id != id);
    if config.models.len() == before {
        return Err(format!("No model with id '{}'", id));
    }
    if config.active_model_id.as_deref() == Some(id) {
        config.active_model_id = config.models.first().map(|m| m.id.clone());
    }
    Ok(())
}

/// Marks a saved model as the active one
pub fn set_active_model(config: &mut AiConfig, id: &str) -> Result<(), String> {
    if !config.models.iter().any(|m| m.id == id) {
        return Err(format!("No model with id '{}'", id));
    }
    config.active_model_id = Some(id.to_string());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn sample_model(id: &str) -> AiModelConfig {
        AiModelConfig {
            id: id.to_string(),
            name: format!("Model {}", id),
            provider: ProviderKind::Lmstudio,
            base_url: "http://127.0.0.1:1234".to_string(),
            api_key: None,
            model: "qwen2-vl".to_string(),
            multimodal: true,
        }
    }

    #[test]
    fn first_added_model_becomes_active() {
        let mut config = AiConfig::default();
        add_model(&mut config, sample_model("a")).unwrap();
        add_model(&mut config, sample_model("b")).unwrap();
        assert_eq!(config.active_model_id.as_deref(), Some("a"));
        assert_eq!(config.active_model().unwrap().id, "a");
    }

    #[test]
    fn duplicate_model_id_is_rejected() {
        let mut config = AiConfig::default();
        add_model(&mut config, sample_model("a")).unwrap();
        assert!(add_model(&mut config, sample_model("a")).is_err());
    }

    #[test]
    fn removing_active_model_falls_back_to_first_remaining() {
        let mut config = AiConfig::default();
        add_model(&mut config, sample_model("a")).unwrap();
        add_model(&mut config, sample_model("b")).unwrap();
        remove_model(&mut config, "a").unwrap();
        assert_eq!(config.active_model_id.as_deref(), Some("b"));

        remove_model(&mut config, "b").unwrap();
        assert!(config.active_model_id.is_none());
        assert!(config.active_model().is_none());
    }

    #[test]
    fn set_active_model_requires_known_id() {
        let mut config = AiConfig::default();
        add_model(&mut config, sample_model("a")).unwrap();
        assert!(set_active_model(&mut config, "missing").is_err());
        set_active_model(&mut config, "a").unwrap();
        assert_eq!(config.active_model_id.as_deref(), Some("a"));
    }

    #[test]
    fn legacy_endpoint_config_is_migrated_on_load() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(".ai_models.json");
        std::fs::write(
            &path,
            r#"{"endpoint": "http://127.0.0.1:11434", "model": "llava", "api_key": "k"}"#,
        )
        .unwrap();

        let config = load_config_from(&path).unwrap();
        assert_eq!(config.models.len(), 1);
        let migrated = config.active_model().unwrap();
        assert_eq!(migrated.provider, ProviderKind::Ollama);
        assert_eq!(migrated.model, "llava");
        assert_eq!(migrated.api_key.as_deref(), Some("k"));

        // The migrated file no longer carries legacy keys
        let rewritten = std::fs::read_to_string(&path).unwrap();
        assert!(!rewritten.contains("\"endpoint\""));
        let reloaded = load_config_from(&path).unwrap();
        assert_eq!(reloaded.models.len(), 1);
    }

    #[test]
    fn missing_config_file_yields_defaults() {
        let dir = tempdir().unwrap();
        let config = load_config_from(&dir.path().join("none.json")).unwrap();
        assert!(config.models.is_empty());
        assert!(config.active_model_id.is_none());
    }
}
