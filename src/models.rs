use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum GenerationMode {
    Icons,
    Illustrations,
    Mockups,
    UiElements,
    Labels,
}

impl GenerationMode {
    pub const ALL: [GenerationMode; 5] = [
        GenerationMode::Icons,
        GenerationMode::Illustrations,
        GenerationMode::Mockups,
        GenerationMode::UiElements,
        GenerationMode::Labels,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            GenerationMode::Icons => "icons",
            GenerationMode::Illustrations => "illustrations",
            GenerationMode::Mockups => "mockups",
            GenerationMode::UiElements => "ui-elements",
            GenerationMode::Labels => "labels",
        }
    }

    /// Modes billed at a flat rate whether or not variations are requested.
    pub fn has_flat_cost(&self) -> bool {
        matches!(self, GenerationMode::Mockups | GenerationMode::UiElements)
    }
}

impl fmt::Display for GenerationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for GenerationMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        GenerationMode::ALL
            .into_iter()
            .find(|mode| mode.as_str() == s.trim())
            .ok_or_else(|| format!("unknown generation mode: {s}"))
    }
}

/// Form fields submitted with a generation. Fields the core does not inspect
/// ride along in `extra` and are sent back to the server untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationPayload {
    #[serde(default)]
    pub general_description: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub individual_descriptions: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icon_count: Option<u32>,
    /// Base64-encoded reference image.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reference_image: Option<String>,
    #[serde(default)]
    pub generate_variations: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label_text: Option<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl GenerationPayload {
    pub fn has_reference_image(&self) -> bool {
        self.reference_image
            .as_deref()
            .is_some_and(|img| !img.trim().is_empty())
    }

    pub fn has_description(&self) -> bool {
        !self.general_description.trim().is_empty()
            || self
                .individual_descriptions
                .iter()
                .any(|d| !d.trim().is_empty())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Icon {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub base64_data: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_source: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub grid_position: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generation_index: Option<u8>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceStatus {
    #[default]
    Started,
    Success,
    Error,
    /// Only appears in polled payloads for services that were switched off.
    Disabled,
}

impl ServiceStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ServiceStatus::Success | ServiceStatus::Error)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceResult {
    #[serde(default)]
    pub icons: Vec<Icon>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_grid_image_base64: Option<String>,
    #[serde(default)]
    pub generation_time_ms: u64,
    #[serde(default)]
    pub status: ServiceStatus,
    #[serde(default)]
    pub message: String,
    /// Zero when the server left it out; the position in its service's list
    /// stands in.
    #[serde(default)]
    pub generation_index: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<String>,
}

impl ServiceResult {
    pub fn placeholder(generation_index: u8) -> Self {
        Self {
            icons: Vec::new(),
            original_grid_image_base64: None,
            generation_time_ms: 0,
            status: ServiceStatus::Started,
            message: "Generating...".to_string(),
            generation_index,
            seed: None,
        }
    }
}

/// Materialised view of a finished session. Rebuilt from the ledger, never edited.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationResponse {
    #[serde(default)]
    pub icons: Vec<Icon>,
    #[serde(default)]
    pub request_id: String,
    #[serde(default)]
    pub service_results: BTreeMap<String, Vec<ServiceResult>>,
    #[serde(default)]
    pub trial_mode: bool,
}

/// The single pending generation persisted across reloads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationRequestDescriptor {
    pub request_id: String,
    pub mode: GenerationMode,
    pub payload: GenerationPayload,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartGenerationResponse {
    pub request_id: String,
    #[serde(default)]
    pub enabled_services: BTreeMap<String, bool>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PollStatus {
    Completed,
    InProgress,
    NotFound,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusResponse {
    pub status: PollStatus,
    #[serde(default)]
    pub data: Option<GenerationResponse>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateMoreRequest {
    pub request_id: String,
    pub mode: GenerationMode,
    pub service_id: String,
    pub generation_index: u8,
    pub original_grid_image_base64: String,
    pub payload: GenerationPayload,
    pub count: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GenerateMoreStatus {
    Success,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateMoreResponse {
    pub status: GenerateMoreStatus,
    #[serde(default)]
    pub new_icons: Vec<Icon>,
    #[serde(default)]
    pub message: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn mode_uses_kebab_case_on_the_wire() {
        assert_eq!(
            serde_json::to_value(GenerationMode::UiElements).unwrap(),
            json!("ui-elements")
        );
        assert_eq!(
            "ui-elements".parse::<GenerationMode>().unwrap(),
            GenerationMode::UiElements
        );
        assert!("stickers".parse::<GenerationMode>().is_err());
    }

    #[test]
    fn payload_keeps_unknown_fields() {
        let raw = json!({
            "generalDescription": "cat logos",
            "generateVariations": true,
            "style": "flat",
            "removeBackground": false
        });
        let payload: GenerationPayload = serde_json::from_value(raw).unwrap();
        assert!(payload.generate_variations);
        assert_eq!(payload.extra.get("style"), Some(&json!("flat")));
        let back = serde_json::to_value(&payload).unwrap();
        assert_eq!(back["removeBackground"], json!(false));
    }

    #[test]
    fn service_result_defaults_missing_fields() {
        let result: ServiceResult = serde_json::from_value(json!({"status": "success"})).unwrap();
        assert_eq!(result.generation_index, 0);
        assert!(result.icons.is_empty());
        assert_eq!(result.generation_time_ms, 0);
    }

    #[test]
    fn poll_status_parses_snake_case() {
        let resp: StatusResponse =
            serde_json::from_value(json!({"status": "in_progress"})).unwrap();
        assert_eq!(resp.status, PollStatus::InProgress);
        assert!(resp.data.is_none());
    }
}
