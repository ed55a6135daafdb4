//! Discovered models and the settings used to address them.

use crate::service::ServiceConfiguration;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// One model as reported by a vendor's listing endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AvailableModelEntry {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    pub provider: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl AvailableModelEntry {
    pub fn new(id: impl Into<String>, provider: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            display_name: None,
            provider: provider.into(),
            created: None,
            description: None,
        }
    }

    pub fn label(&self) -> &str {
        self.display_name.as_deref().unwrap_or(&self.id)
    }
}

/// Generation knobs. Every field is optional and drivers omit unset ones.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelSettings {
    pub id: Uuid,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub store: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning_effort: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_completion_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub n: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_k: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub frequency_penalty: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub presence_penalty: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logit_bias: Option<HashMap<String, f64>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logprobs: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_logprobs: Option<u32>,
}

impl ModelSettings {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            comment: None,
            store: None,
            reasoning_effort: None,
            max_completion_tokens: None,
            max_tokens: None,
            temperature: None,
            top_p: None,
            n: None,
            top_k: None,
            frequency_penalty: None,
            presence_penalty: None,
            logit_bias: None,
            logprobs: None,
            top_logprobs: None,
        }
    }

    /// Default settings for a freshly discovered entry.
    pub fn for_entry(entry: &AvailableModelEntry) -> Self {
        Self {
            comment: entry.description.clone(),
            ..Self::named(entry.label())
        }
    }
}

/// Everything a driver needs to address one vendor model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelProfile {
    pub id: String,
    pub name: String,
    pub description: String,
    pub model_entry: AvailableModelEntry,
    pub model_settings: ModelSettings,
}

impl ModelProfile {
    pub fn new(model_entry: AvailableModelEntry, model_settings: ModelSettings) -> Self {
        Self {
            id: model_entry.id.clone(),
            name: model_entry.label().to_string(),
            description: model_entry.description.clone().unwrap_or_default(),
            model_entry,
            model_settings,
        }
    }

    /// Profile with default settings, handy for one-off calls.
    pub fn for_entry(model_entry: AvailableModelEntry) -> Self {
        let settings = ModelSettings::for_entry(&model_entry);
        Self::new(model_entry, settings)
    }
}

/// A model reachable through a specific service.
///
/// Rebuilt on every discovery pass; the id is `"<service id>:<model id>"`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LlmModel {
    pub id: String,
    pub configuration: ServiceConfiguration,
    pub model_entry: AvailableModelEntry,
    pub model_settings: ModelSettings,
}

impl LlmModel {
    pub fn new(configuration: ServiceConfiguration, model_entry: AvailableModelEntry) -> Self {
        let model_settings = ModelSettings::for_entry(&model_entry);
        Self {
            id: format!("{}:{}", configuration.id, model_entry.id),
            configuration,
            model_entry,
            model_settings,
        }
    }

    pub fn profile(&self) -> ModelProfile {
        ModelProfile::new(self.model_entry.clone(), self.model_settings.clone())
    }
}

/// Human-readable name for a bare model id.
/// "gpt-4o-mini" -> "GPT 4o Mini", "gpt-3.5-turbo" -> "GPT 3.5 Turbo"
pub fn display_name_from_id(id: &str) -> String {
    static ACRONYMS: &[&str] = &["gpt", "glm", "llm", "ai"];

    id.split('-')
        .filter(|part| !part.is_empty())
        .map(|part| {
            if part.chars().all(|c| c.is_ascii_digit() || c == '.') {
                part.to_string()
            } else if ACRONYMS.contains(&part.to_lowercase().as_str()) {
                part.to_uppercase()
            } else {
                let mut chars = part.chars();
                match chars.next() {
                    None => String::new(),
                    Some(first) => first.to_uppercase().chain(chars).collect(),
                }
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}
