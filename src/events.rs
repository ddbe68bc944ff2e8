//! Typed view of the generation event stream.

use serde::Deserialize;

use crate::error::GenerationError;
use crate::models::{GenerationResponse, Icon, ServiceStatus};
use crate::services::ServiceKey;
use crate::sse::SseFrame;

pub const SERVICE_UPDATE: &str = "service_update";
pub const GENERATION_COMPLETE: &str = "generation_complete";
pub const GENERATION_ERROR: &str = "generation_error";

/// Partial progress for one `{serviceId}-gen{n}` key. Absent fields leave the
/// stored value untouched.
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceUpdate {
    pub key: ServiceKey,
    pub status: ServiceStatus,
    pub message: Option<String>,
    pub generation_time_ms: Option<u64>,
    pub icons: Option<Vec<Icon>>,
    pub original_grid_image_base64: Option<String>,
    pub seed: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct GenerationFailure {
    pub message: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    ServiceUpdate(ServiceUpdate),
    GenerationComplete(GenerationResponse),
    GenerationError(GenerationFailure),
}

impl StreamEvent {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, StreamEvent::ServiceUpdate(_))
    }

    pub fn name(&self) -> &'static str {
        match self {
            StreamEvent::ServiceUpdate(_) => SERVICE_UPDATE,
            StreamEvent::GenerationComplete(_) => GENERATION_COMPLETE,
            StreamEvent::GenerationError(_) => GENERATION_ERROR,
        }
    }

    /// Decodes one frame. Frames with other event names yield `None`.
    pub fn from_frame(frame: &SseFrame) -> Result<Option<Self>, GenerationError> {
        let event = match frame.event.as_str() {
            SERVICE_UPDATE => {
                let wire: WireServiceUpdate = serde_json::from_str(&frame.data)?;
                StreamEvent::ServiceUpdate(wire.into_update()?)
            }
            GENERATION_COMPLETE => StreamEvent::GenerationComplete(serde_json::from_str(&frame.data)?),
            GENERATION_ERROR => {
                let wire: WireFailure = serde_json::from_str(&frame.data).unwrap_or_default();
                StreamEvent::GenerationError(GenerationFailure {
                    message: wire.message.or(wire.error).filter(|m| !m.trim().is_empty()),
                })
            }
            _ => return Ok(None),
        };
        Ok(Some(event))
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireServiceUpdate {
    #[serde(default)]
    service_key: Option<String>,
    #[serde(default, alias = "serviceName", alias = "service")]
    service_id: Option<String>,
    #[serde(default)]
    generation_index: Option<u8>,
    #[serde(default)]
    status: ServiceStatus,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    generation_time_ms: Option<u64>,
    #[serde(default)]
    icons: Option<Vec<Icon>>,
    #[serde(default)]
    original_grid_image_base64: Option<String>,
    #[serde(default)]
    seed: Option<String>,
}

impl WireServiceUpdate {
    fn into_update(self) -> Result<ServiceUpdate, GenerationError> {
        let key = match (self.service_key, self.service_id) {
            (Some(raw), _) => raw.parse()?,
            (None, Some(service)) => ServiceKey::new(service, self.generation_index.unwrap_or(1))?,
            (None, None) => {
                return Err(GenerationError::Decode(
                    "service_update without service id".into(),
                ))
            }
        };
        Ok(ServiceUpdate {
            key,
            status: self.status,
            message: self.message,
            generation_time_ms: self.generation_time_ms,
            icons: self.icons,
            original_grid_image_base64: self.original_grid_image_base64,
            seed: self.seed,
        })
    }
}

#[derive(Debug, Default, Deserialize)]
struct WireFailure {
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    error: Option<String>,
}
